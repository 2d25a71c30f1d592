// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Per-device capacity bookkeeping: occupants, departure order, and slot
//! reservations.
//!
//! A `DeviceState` is only ever touched while the scheduler holds the
//! global critical section; it owns no locking of its own. A reservation
//! against a departing, not-yet-vacated occupant is tracked but not
//! counted against capacity until the occupant actually vacates, so
//! `occupants + ready reservations <= capacity` holds at every instant
//! and the free-slot count can never go negative.

use std::collections::{HashMap, HashSet, VecDeque};

use crossbeam_channel::Sender;
use thiserror::Error;

use crate::types::{ComponentId, DeviceId};

/// Fired by the scheduler when a reserved slot's occupant has vacated.
pub(crate) type SlotGate = Sender<()>;

#[derive(Error, Debug)]
#[error("no free slot")]
pub(crate) struct NoFreeSlot;

#[derive(Error, Debug)]
#[error("no departure available to reserve")]
pub(crate) struct NoDepartureAvailable;

/// Proof that a slot on `device` has been claimed for `component`.
///
/// Issued by `occupy_free_slot` / `reserve_departing_slot` /
/// `reserve_slot_of` and consumed by `commit_reserved`.
#[derive(Debug)]
pub(crate) struct SlotToken {
    pub(crate) device: DeviceId,
    pub(crate) component: ComponentId,
}

/// A claimed slot that has not yet been committed to an occupant.
#[derive(Debug)]
struct Reservation {
    /// Departing occupant whose slot this claims; `None` once the slot is
    /// materially free.
    vacating: Option<ComponentId>,
    /// True when the slot is materially free and counts against capacity.
    ready: bool,
    /// Signal to the reserving thread, fired by the scheduler on vacate.
    gate: Option<SlotGate>,
}

/// What happened to a vacated occupant's slot.
pub(crate) enum Vacated {
    /// The slot transferred to a pending reservation; fire this gate.
    ToClaimant(Option<SlotGate>),
    /// The slot became free.
    Freed,
}

#[derive(Debug)]
pub(crate) struct DeviceState {
    id: DeviceId,
    capacity: usize,
    occupants: HashSet<ComponentId>,
    /// Occupants marked departing, oldest first. A departing component
    /// stays in `occupants` until it vacates.
    departing: VecDeque<ComponentId>,
    /// Keyed by the incoming component the slot is claimed for.
    reserved: HashMap<ComponentId, Reservation>,
}

impl DeviceState {
    pub(crate) fn new(
        id: DeviceId,
        capacity: usize,
        occupants: impl IntoIterator<Item = ComponentId>,
    ) -> Self {
        Self {
            id,
            capacity,
            occupants: occupants.into_iter().collect(),
            departing: VecDeque::new(),
            reserved: HashMap::new(),
        }
    }

    pub(crate) fn id(&self) -> DeviceId {
        self.id
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn occupants(&self) -> &HashSet<ComponentId> {
        &self.occupants
    }

    pub(crate) fn departing(&self) -> impl Iterator<Item = ComponentId> + '_ {
        self.departing.iter().copied()
    }

    /// (incoming component, departing occupant it claims, ready) triples.
    pub(crate) fn reservations(&self) -> impl Iterator<Item = (ComponentId, Option<ComponentId>, bool)> + '_ {
        self.reserved.iter().map(|(c, r)| (*c, r.vacating, r.ready))
    }

    /// Slots counted against capacity right now.
    pub(crate) fn slots_in_use(&self) -> usize {
        self.occupants.len() + self.reserved.values().filter(|r| r.ready).count()
    }

    pub(crate) fn free_slots(&self) -> usize {
        self.capacity.saturating_sub(self.slots_in_use())
    }

    pub(crate) fn has_free_slot(&self) -> bool {
        self.free_slots() > 0
    }

    /// True iff some occupant is marked departing and its slot is not yet
    /// claimed by a reservation.
    pub(crate) fn has_departure_pending(&self) -> bool {
        self.oldest_unclaimed_departure().is_some()
    }

    fn oldest_unclaimed_departure(&self) -> Option<ComponentId> {
        self.departing
            .iter()
            .copied()
            .find(|c| !self.reserved.values().any(|r| r.vacating == Some(*c)))
    }

    /// Claim a materially free slot for `incoming`. The slot counts
    /// against capacity immediately.
    pub(crate) fn occupy_free_slot(
        &mut self,
        incoming: ComponentId,
    ) -> Result<SlotToken, NoFreeSlot> {
        if !self.has_free_slot() {
            return Err(NoFreeSlot);
        }
        self.reserved.insert(
            incoming,
            Reservation {
                vacating: None,
                ready: true,
                gate: None,
            },
        );
        Ok(SlotToken {
            device: self.id,
            component: incoming,
        })
    }

    /// Claim the slot of the oldest departing, not-yet-claimed occupant
    /// for `incoming`. The caller's `gate` fires when that occupant
    /// actually vacates.
    pub(crate) fn reserve_departing_slot(
        &mut self,
        incoming: ComponentId,
        gate: SlotGate,
    ) -> Result<SlotToken, NoDepartureAvailable> {
        let vacating = self.oldest_unclaimed_departure().ok_or(NoDepartureAvailable)?;
        Ok(self.reserve(vacating, incoming, gate))
    }

    /// Cycle-group variant: claim a *specific* occupant's slot. The
    /// occupant must already be marked departing.
    pub(crate) fn reserve_slot_of(
        &mut self,
        vacating: ComponentId,
        incoming: ComponentId,
        gate: SlotGate,
    ) -> SlotToken {
        self.reserve(vacating, incoming, gate)
    }

    fn reserve(&mut self, vacating: ComponentId, incoming: ComponentId, gate: SlotGate) -> SlotToken {
        self.reserved.insert(
            incoming,
            Reservation {
                vacating: Some(vacating),
                ready: false,
                gate: Some(gate),
            },
        );
        SlotToken {
            device: self.id,
            component: incoming,
        }
    }

    /// Record an occupant as about to leave. Its slot stays counted until
    /// `vacate`.
    pub(crate) fn mark_departing(&mut self, component: ComponentId) {
        if !self.departing.contains(&component) {
            self.departing.push_back(component);
        }
    }

    /// Turn a claimed slot into residency.
    pub(crate) fn commit_reserved(&mut self, token: SlotToken) {
        if self.reserved.remove(&token.component).is_none() {
            tracing::error!("[{}] commit for {} without a reservation", self.id, token.component);
        }
        self.occupants.insert(token.component);
    }

    /// Remove an occupant and route its slot: to the reservation claiming
    /// it (whose gate the scheduler must fire), or back to the free pool.
    pub(crate) fn vacate(&mut self, component: ComponentId) -> Vacated {
        self.occupants.remove(&component);
        self.departing.retain(|c| *c != component);
        match self
            .reserved
            .values_mut()
            .find(|r| r.vacating == Some(component))
        {
            Some(claim) => {
                claim.vacating = None;
                claim.ready = true;
                Vacated::ToClaimant(claim.gate.take())
            }
            None => Vacated::Freed,
        }
    }

    pub(crate) fn holds(&self, component: ComponentId) -> bool {
        self.occupants.contains(&component)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    fn comp(n: u32) -> ComponentId {
        ComponentId::new(n)
    }

    fn device(capacity: usize, occupants: &[u32]) -> DeviceState {
        DeviceState::new(
            DeviceId::new(1),
            capacity,
            occupants.iter().map(|n| comp(*n)),
        )
    }

    #[test]
    fn test_free_slots_derived_from_occupancy() {
        let dev = device(3, &[10, 11]);
        assert_eq!(dev.free_slots(), 1);
        assert!(dev.has_free_slot());
        assert_eq!(dev.slots_in_use(), 2);
    }

    #[test]
    fn test_occupy_fails_when_full() {
        let mut dev = device(2, &[10, 11]);
        assert!(dev.occupy_free_slot(comp(20)).is_err());
    }

    #[test]
    fn test_occupy_then_commit() {
        let mut dev = device(2, &[10]);
        let token = dev.occupy_free_slot(comp(20)).unwrap();
        // The claimed slot counts immediately; no second claimant fits.
        assert_eq!(dev.free_slots(), 0);
        dev.commit_reserved(token);
        assert!(dev.holds(comp(20)));
        assert_eq!(dev.slots_in_use(), 2);
    }

    #[test]
    fn test_departing_slot_not_double_counted() {
        let mut dev = device(1, &[10]);
        dev.mark_departing(comp(10));
        assert!(dev.has_departure_pending());
        assert!(!dev.has_free_slot());

        let (gate, _rx) = bounded(1);
        let token = dev.reserve_departing_slot(comp(20), gate).unwrap();
        // Occupant still resident, reservation pending: one slot in use.
        assert_eq!(dev.slots_in_use(), 1);
        assert!(!dev.has_departure_pending());

        match dev.vacate(comp(10)) {
            Vacated::ToClaimant(gate) => assert!(gate.is_some()),
            Vacated::Freed => panic!("slot should transfer to the claimant"),
        }
        // Slot moved from occupant to ready reservation: still one in use.
        assert_eq!(dev.slots_in_use(), 1);
        assert_eq!(dev.free_slots(), 0);

        dev.commit_reserved(token);
        assert!(dev.holds(comp(20)));
        assert!(!dev.holds(comp(10)));
    }

    #[test]
    fn test_reserve_claims_oldest_departure_first() {
        let mut dev = device(3, &[10, 11, 12]);
        dev.mark_departing(comp(11));
        dev.mark_departing(comp(10));

        let (gate_a, _ra) = bounded(1);
        let (gate_b, _rb) = bounded(1);
        dev.reserve_departing_slot(comp(20), gate_a).unwrap();
        dev.reserve_departing_slot(comp(21), gate_b).unwrap();

        let claims: Vec<_> = dev
            .reservations()
            .map(|(incoming, vacating, _)| (incoming, vacating))
            .collect();
        assert!(claims.contains(&(comp(20), Some(comp(11)))));
        assert!(claims.contains(&(comp(21), Some(comp(10)))));
        assert!(dev.reserve_departing_slot(comp(22), bounded(1).0).is_err());
    }

    #[test]
    fn test_vacate_without_claim_frees_slot() {
        let mut dev = device(2, &[10, 11]);
        dev.mark_departing(comp(10));
        assert!(matches!(dev.vacate(comp(10)), Vacated::Freed));
        assert_eq!(dev.free_slots(), 1);
        assert!(!dev.has_departure_pending());
    }

    #[test]
    fn test_mark_departing_is_idempotent() {
        let mut dev = device(2, &[10]);
        dev.mark_departing(comp(10));
        dev.mark_departing(comp(10));
        assert_eq!(dev.departing().count(), 1);
    }
}
