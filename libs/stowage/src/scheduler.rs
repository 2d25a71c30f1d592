// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! The transfer scheduler: admission, capacity hand-off, and cycle-group
//! release for concurrent component transfers.
//!
//! All cluster bookkeeping lives behind a single `parking_lot::Mutex`.
//! The lock is held only for admission and the short bookkeeping windows
//! between callback phases; `prepare()` and `perform()` always run on the
//! calling thread with the lock released. Blocked operations wait on
//! one-shot rendezvous channels created when they park, so a waker never
//! blocks while signalling.
//!
//! The protocol every transfer follows after its capacity is secured:
//!
//! 1. `prepare()` outside the lock;
//! 2. under the lock, vacate the source slot (this fires the gate of
//!    whichever reservation claimed it, or frees the slot for a parked
//!    waiter);
//! 3. outside the lock, wait for this transfer's own gate if its claimed
//!    slot is not yet materially free;
//! 4. under the lock, commit destination occupancy;
//! 5. `perform()` outside the lock, then clear the busy flag.
//!
//! Vacating the source immediately after `prepare()` is what makes a
//! released cycle group live: every ring member's departure is
//! unconditional once its `prepare()` returns, so each member's gate is
//! guaranteed to fire.

use std::collections::{HashMap, HashSet, VecDeque};

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::ClusterConfig;
use crate::device::{DeviceState, SlotGate, SlotToken, Vacated};
use crate::error::{Result, TransferError};
use crate::registry::ComponentRegistry;
use crate::snapshot::{ClusterSnapshot, DeviceSnapshot, ReservationSnapshot};
use crate::transfer::{ComponentTransfer, TransferKind, TransferPhase};
use crate::types::{ComponentId, DeviceId};
use crate::waitgraph::{self, ParkedMove};

/// Sent by a waker to a parked operation once capacity has been secured
/// on its behalf.
enum Resume {
    /// A departing or freed slot was handed off along the wait chain.
    Handoff(SlotToken),
    /// The operation was released as a member of a wait-for ring.
    CycleGroup(SlotToken),
}

/// A parked operation's entry on its destination device's wait list.
///
/// Both channels are one-shot rendezvous channels created by the parked
/// thread before it blocks; senders never block on them.
struct Waiter {
    component: ComponentId,
    source: Option<DeviceId>,
    resume_tx: Sender<Resume>,
    gate_tx: SlotGate,
}

/// Outcome of admission: how the calling thread proceeds to `prepare()`.
enum Claim {
    /// Capacity already counted (or not needed, for a remove).
    Ready(Option<SlotToken>),
    /// Slot claimed from a departing occupant; the gate fires on vacate.
    Future(SlotToken, Receiver<()>),
    /// No capacity; blocked until a waker sends a `Resume`.
    Parked(Receiver<Resume>, Receiver<()>),
}

/// Everything guarded by the scheduler lock.
struct Core {
    devices: HashMap<DeviceId, DeviceState>,
    registry: ComponentRegistry,
    waiters: HashMap<DeviceId, VecDeque<Waiter>>,
    phases: HashMap<ComponentId, TransferPhase>,
}

/// Concurrency-safe transfer scheduler for a fixed cluster of devices.
///
/// Construct one from a [`ClusterConfig`], share it across threads (it is
/// `Sync`; callers typically wrap it in an `Arc`), and call
/// [`execute`](Self::execute) from any number of threads. Every
/// legitimate operation eventually completes; operations that cannot make
/// progress individually are released together when their wait-for
/// dependencies close a ring.
pub struct TransferScheduler {
    known_devices: HashSet<DeviceId>,
    core: Mutex<Core>,
}

impl TransferScheduler {
    /// Build a scheduler over the given cluster description.
    ///
    /// Fails with `InvalidConfiguration` if a component is placed on an
    /// unknown device or a device starts over capacity.
    pub fn new(config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        let (capacities, placement) = config.into_parts();

        let mut initial: HashMap<DeviceId, Vec<ComponentId>> = HashMap::new();
        for (component, device) in &placement {
            initial.entry(*device).or_default().push(*component);
        }

        let devices: HashMap<DeviceId, DeviceState> = capacities
            .iter()
            .map(|(id, capacity)| {
                let occupants = initial.remove(id).unwrap_or_default();
                (*id, DeviceState::new(*id, *capacity, occupants))
            })
            .collect();

        debug!(
            devices = devices.len(),
            components = placement.len(),
            "Scheduler initialized"
        );

        Ok(Self {
            known_devices: capacities.keys().copied().collect(),
            core: Mutex::new(Core {
                devices,
                registry: ComponentRegistry::new(placement),
                waiters: HashMap::new(),
                phases: HashMap::new(),
            }),
        })
    }

    /// Execute one transfer to completion on the calling thread.
    ///
    /// Validation happens first, under the lock; a rejected transfer has
    /// no effect and its callbacks are never invoked. An accepted
    /// transfer blocks the calling thread as long as necessary, invokes
    /// `prepare()` and `perform()` exactly once each with no lock held,
    /// and returns `Ok(())` once the component's busy flag is cleared.
    pub fn execute(&self, transfer: &dyn ComponentTransfer) -> Result<()> {
        let component = transfer.component();
        let (kind, claim) = {
            let mut core = self.core.lock();
            let kind = core.registry.validate(
                &self.known_devices,
                component,
                transfer.source(),
                transfer.destination(),
            )?;
            core.registry.try_begin(component);
            core.phases.insert(component, TransferPhase::Admitted);
            let claim = core.admit(component, kind);
            (kind, claim)
        };

        trace!(%component, ?kind, "Transfer admitted");

        let (token, gate_rx) = match claim {
            Claim::Ready(token) => (token, None),
            Claim::Future(token, gate_rx) => (Some(token), Some(gate_rx)),
            Claim::Parked(resume_rx, gate_rx) => {
                let resume = resume_rx
                    .recv()
                    .map_err(|_| TransferError::InterruptedWait(component))?;
                let token = match resume {
                    Resume::Handoff(token) => {
                        trace!(%component, "Resumed by capacity hand-off");
                        token
                    }
                    Resume::CycleGroup(token) => {
                        trace!(%component, "Released as cycle-group member");
                        token
                    }
                };
                (Some(token), Some(gate_rx))
            }
        };

        transfer.prepare();

        {
            let mut core = self.core.lock();
            core.phases.insert(component, TransferPhase::Prepared);
            if let Some(source) = kind.source() {
                core.vacate_and_route(source, component);
                if kind.destination().is_none() {
                    core.registry.clear_placement(component);
                }
            }
        }

        if let Some(gate_rx) = gate_rx {
            gate_rx
                .recv()
                .map_err(|_| TransferError::InterruptedWait(component))?;
        }

        {
            let mut core = self.core.lock();
            if let Some(token) = token {
                let destination = token.device;
                core.device_mut(destination).commit_reserved(token);
                core.registry.record_placement(component, destination);
            }
            core.phases.insert(component, TransferPhase::Committed);
        }

        transfer.perform();

        {
            let mut core = self.core.lock();
            core.registry.end(component);
            core.phases.remove(&component);
        }
        trace!(%component, "Transfer complete");
        Ok(())
    }

    /// Consistent point-in-time view of the whole cluster.
    pub fn snapshot(&self) -> ClusterSnapshot {
        let core = self.core.lock();

        let mut devices: Vec<DeviceSnapshot> = core
            .devices
            .values()
            .map(|dev| {
                let mut occupants: Vec<ComponentId> = dev.occupants().iter().copied().collect();
                occupants.sort();
                DeviceSnapshot {
                    id: dev.id(),
                    capacity: dev.capacity(),
                    occupants,
                    departing: dev.departing().collect(),
                    reservations: dev
                        .reservations()
                        .map(|(incoming, vacating, ready)| ReservationSnapshot {
                            incoming,
                            vacating,
                            ready,
                        })
                        .collect(),
                    parked: core
                        .waiters
                        .get(&dev.id())
                        .map(|queue| queue.iter().map(|w| w.component).collect())
                        .unwrap_or_default(),
                }
            })
            .collect();
        devices.sort_by_key(|d| d.id);

        let mut busy: Vec<ComponentId> = core.registry.busy_components().collect();
        busy.sort();

        let mut phases: Vec<(ComponentId, TransferPhase)> =
            core.phases.iter().map(|(c, p)| (*c, *p)).collect();
        phases.sort_by_key(|(c, _)| *c);

        ClusterSnapshot {
            devices,
            busy,
            phases,
        }
    }
}

impl Core {
    /// Devices are fixed at construction and rechecked at admission.
    fn device_mut(&mut self, id: DeviceId) -> &mut DeviceState {
        self.devices
            .get_mut(&id)
            .expect("device validated at admission")
    }

    fn set_phase(&mut self, component: ComponentId, phase: TransferPhase) {
        self.phases.insert(component, phase);
    }

    /// Secure capacity for a validated transfer, or park it. Infallible:
    /// the worst case is a `Parked` claim.
    fn admit(&mut self, component: ComponentId, kind: TransferKind) -> Claim {
        match kind {
            TransferKind::Remove { source } => {
                self.set_phase(component, TransferPhase::Running);
                self.device_mut(source).mark_departing(component);
                self.dispatch_capacity(source);
                Claim::Ready(None)
            }
            TransferKind::Add { destination } => self.admit_inbound(component, None, destination),
            TransferKind::Move {
                source,
                destination,
            } => self.admit_inbound(component, Some(source), destination),
        }
    }

    fn admit_inbound(
        &mut self,
        component: ComponentId,
        source: Option<DeviceId>,
        destination: DeviceId,
    ) -> Claim {
        if let Ok(token) = self.device_mut(destination).occupy_free_slot(component) {
            self.set_phase(component, TransferPhase::Running);
            self.announce_departure(component, source);
            return Claim::Ready(Some(token));
        }

        // One gate for whatever path secures the slot.
        let (gate_tx, gate_rx) = bounded(1);

        if let Ok(token) = self
            .device_mut(destination)
            .reserve_departing_slot(component, gate_tx.clone())
        {
            self.set_phase(component, TransferPhase::Running);
            self.announce_departure(component, source);
            return Claim::Future(token, gate_rx);
        }

        // Only moves carry a source edge, so only moves can close a ring.
        if let Some(source) = source {
            let origin = ParkedMove {
                component,
                source,
                destination,
            };
            let parked = self.parked_moves();
            if let Some(ring) = waitgraph::find_cycle(&parked, &origin) {
                let token = self.release_cycle_group(&origin, &ring, gate_tx);
                self.set_phase(component, TransferPhase::Running);
                return Claim::Future(token, gate_rx);
            }
        }

        let (resume_tx, resume_rx) = bounded(1);
        self.waiters.entry(destination).or_default().push_back(Waiter {
            component,
            source,
            resume_tx,
            gate_tx,
        });
        self.set_phase(component, TransferPhase::WaitingForCapacity);
        trace!(%component, %destination, "Parked waiting for capacity");
        Claim::Parked(resume_rx, gate_rx)
    }

    /// Record a move's source as departing and let any waiter there claim
    /// the slot ahead of the actual vacate.
    fn announce_departure(&mut self, component: ComponentId, source: Option<DeviceId>) {
        if let Some(source) = source {
            self.device_mut(source).mark_departing(component);
            self.dispatch_capacity(source);
        }
    }

    /// Remove `component` from `device` and route the slot: fire the gate
    /// of the reservation that claimed it, or hand the freed slot to the
    /// oldest parked waiter.
    fn vacate_and_route(&mut self, device: DeviceId, component: ComponentId) {
        match self.device_mut(device).vacate(component) {
            Vacated::ToClaimant(gate) => {
                if let Some(gate) = gate {
                    if gate.send(()).is_err() {
                        warn!(%component, %device, "Slot claimant dropped its gate");
                    }
                }
            }
            Vacated::Freed => self.dispatch_capacity(device),
        }
    }

    /// Hand available capacity on `start` to parked waiters, oldest
    /// first, and follow the chain: a woken move's own source becomes
    /// departing capacity for waiters parked there.
    ///
    /// The capacity step runs here, under the waker's lock tenure; the
    /// woken thread resumes directly with its claim in hand.
    fn dispatch_capacity(&mut self, start: DeviceId) {
        let mut worklist = VecDeque::from([start]);
        while let Some(device) = worklist.pop_front() {
            loop {
                let Some(waiter) = self
                    .waiters
                    .get_mut(&device)
                    .and_then(|queue| queue.pop_front())
                else {
                    break;
                };

                let dev = self.device_mut(device);
                let claim = match dev.occupy_free_slot(waiter.component) {
                    // Slot already materially free: pre-fire the gate.
                    Ok(token) => Some((token, true)),
                    Err(_) => dev
                        .reserve_departing_slot(waiter.component, waiter.gate_tx.clone())
                        .ok()
                        .map(|token| (token, false)),
                };

                let Some((token, ready)) = claim else {
                    // No capacity left; restore FIFO order.
                    self.waiters
                        .entry(device)
                        .or_default()
                        .push_front(waiter);
                    break;
                };

                if ready && waiter.gate_tx.send(()).is_err() {
                    warn!(component = %waiter.component, "Woken waiter dropped its gate");
                }
                self.set_phase(waiter.component, TransferPhase::Inherited);
                debug!(component = %waiter.component, %device, "Capacity handed off");

                if let Some(source) = waiter.source {
                    self.device_mut(source).mark_departing(waiter.component);
                    worklist.push_back(source);
                }

                if waiter.resume_tx.send(Resume::Handoff(token)).is_err() {
                    warn!(
                        component = %waiter.component,
                        "Woken waiter dropped its resume channel"
                    );
                }
            }
        }
    }

    /// All currently parked moves, FIFO within each destination.
    fn parked_moves(&self) -> Vec<ParkedMove> {
        let mut moves = Vec::new();
        for (destination, queue) in &self.waiters {
            for waiter in queue {
                if let Some(source) = waiter.source {
                    moves.push(ParkedMove {
                        component: waiter.component,
                        source,
                        destination: *destination,
                    });
                }
            }
        }
        moves
    }

    /// Pull a parked operation off whichever wait list holds it.
    fn take_waiter(&mut self, component: ComponentId) -> Option<(DeviceId, Waiter)> {
        for (device, queue) in self.waiters.iter_mut() {
            if let Some(pos) = queue.iter().position(|w| w.component == component) {
                if let Some(waiter) = queue.remove(pos) {
                    return Some((*device, waiter));
                }
            }
        }
        None
    }

    /// Release a wait-for ring as a group.
    ///
    /// Every participant claims the slot its ring successor vacates: the
    /// origin claims the first member's slot at the origin's destination,
    /// each member claims the next member's slot at its own destination,
    /// and the last member claims the slot the origin itself vacates.
    /// Members are pulled off their wait lists and resumed immediately;
    /// their gates fire one by one as the ring's `prepare()`s complete
    /// and sources vacate.
    fn release_cycle_group(
        &mut self,
        origin: &ParkedMove,
        ring: &[ComponentId],
        origin_gate: SlotGate,
    ) -> SlotToken {
        debug!(
            origin = %origin.component,
            members = ring.len(),
            "Releasing wait-for cycle group"
        );

        let mut members = Vec::with_capacity(ring.len());
        for member in ring {
            match self.take_waiter(*member) {
                Some(entry) => members.push(entry),
                // The ring was derived from the wait lists under this
                // same lock tenure.
                None => warn!(component = %member, "Ring member missing from wait lists"),
            }
        }

        let first = ring[0];
        self.device_mut(origin.destination).mark_departing(first);
        let token =
            self.device_mut(origin.destination)
                .reserve_slot_of(first, origin.component, origin_gate);

        for (i, (destination, member)) in members.iter().enumerate() {
            let vacating = members
                .get(i + 1)
                .map(|(_, next)| next.component)
                .unwrap_or(origin.component);
            let destination = *destination;
            let gate = member.gate_tx.clone();
            self.device_mut(destination).mark_departing(vacating);
            let member_token =
                self.device_mut(destination)
                    .reserve_slot_of(vacating, member.component, gate);
            self.set_phase(member.component, TransferPhase::WaitingInCycleGroup);
            if member
                .resume_tx
                .send(Resume::CycleGroup(member_token))
                .is_err()
            {
                warn!(
                    component = %member.component,
                    "Ring member dropped its resume channel"
                );
            }
        }

        token
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::transfer::Transfer;

    fn two_device_scheduler() -> TransferScheduler {
        let config = ClusterConfig::new()
            .device(1, 2)
            .device(2, 2)
            .place(101, 1)
            .place(102, 2);
        TransferScheduler::new(config).unwrap()
    }

    #[test]
    fn test_add_to_free_slot() {
        let scheduler = two_device_scheduler();
        let transfer = Transfer::add(ComponentId::new(200), DeviceId::new(1));
        scheduler.execute(&transfer).unwrap();

        let snap = scheduler.snapshot();
        assert!(snap.device(DeviceId::new(1)).unwrap().holds(ComponentId::new(200)));
        assert!(!snap.is_busy(ComponentId::new(200)));
        assert!(snap.capacity_invariant_holds());
    }

    #[test]
    fn test_remove_frees_slot() {
        let scheduler = two_device_scheduler();
        let transfer = Transfer::remove(ComponentId::new(101), DeviceId::new(1));
        scheduler.execute(&transfer).unwrap();

        let snap = scheduler.snapshot();
        assert!(!snap.device(DeviceId::new(1)).unwrap().holds(ComponentId::new(101)));
        assert_eq!(snap.device(DeviceId::new(1)).unwrap().free_slots(), 2);
    }

    #[test]
    fn test_move_between_devices() {
        let scheduler = two_device_scheduler();
        let transfer = Transfer::between(ComponentId::new(101), DeviceId::new(1), DeviceId::new(2));
        scheduler.execute(&transfer).unwrap();

        let snap = scheduler.snapshot();
        assert!(snap.device(DeviceId::new(2)).unwrap().holds(ComponentId::new(101)));
        assert!(!snap.device(DeviceId::new(1)).unwrap().holds(ComponentId::new(101)));
    }

    #[test]
    fn test_callbacks_run_in_order_on_calling_thread() {
        let scheduler = two_device_scheduler();
        let caller = std::thread::current().id();
        let order = Arc::new(AtomicUsize::new(0));

        let prepare_seen = order.clone();
        let perform_seen = order.clone();
        let transfer = Transfer::add(ComponentId::new(200), DeviceId::new(2))
            .on_prepare(move || {
                assert_eq!(std::thread::current().id(), caller);
                assert_eq!(prepare_seen.fetch_add(1, Ordering::SeqCst), 0);
            })
            .on_perform(move || {
                assert_eq!(std::thread::current().id(), caller);
                assert_eq!(perform_seen.fetch_add(1, Ordering::SeqCst), 1);
            });

        scheduler.execute(&transfer).unwrap();
        assert_eq!(order.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_rejections_leave_no_trace() {
        let scheduler = two_device_scheduler();

        let unknown_device =
            Transfer::add(ComponentId::new(200), DeviceId::new(9));
        assert_eq!(
            scheduler.execute(&unknown_device).unwrap_err(),
            TransferError::DeviceDoesNotExist(DeviceId::new(9))
        );

        let duplicate = Transfer::add(ComponentId::new(101), DeviceId::new(2));
        assert_eq!(
            scheduler.execute(&duplicate).unwrap_err(),
            TransferError::ComponentAlreadyExists {
                component: ComponentId::new(101),
                device: DeviceId::new(1),
            }
        );

        let phantom = Transfer::remove(ComponentId::new(500), DeviceId::new(1));
        assert_eq!(
            scheduler.execute(&phantom).unwrap_err(),
            TransferError::ComponentDoesNotExist {
                component: ComponentId::new(500),
                device: DeviceId::new(1),
            }
        );

        let snap = scheduler.snapshot();
        assert!(snap.busy.is_empty());
        assert!(snap.phases.is_empty());
        assert!(snap.capacity_invariant_holds());
    }

    #[test]
    fn test_no_op_move_rejected() {
        let scheduler = two_device_scheduler();
        let transfer = Transfer::between(ComponentId::new(101), DeviceId::new(1), DeviceId::new(1));
        assert_eq!(
            scheduler.execute(&transfer).unwrap_err(),
            TransferError::ComponentDoesNotNeedTransfer {
                component: ComponentId::new(101),
                device: DeviceId::new(1),
            }
        );
    }

    #[test]
    fn test_invalid_initial_placement_rejected() {
        let config = ClusterConfig::new().device(1, 1).place(101, 1).place(102, 1);
        assert!(matches!(
            TransferScheduler::new(config),
            Err(TransferError::InvalidConfiguration(_))
        ));
    }
}
