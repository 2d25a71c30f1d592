// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! The transfer contract: the two-phase callback trait, the add/remove/move
//! classification, and the per-operation phase state machine.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransferError};
use crate::types::{ComponentId, DeviceId};

/// A single requested operation on a component.
///
/// The scheduler treats `prepare()` and `perform()` as opaque external
/// work: both are invoked exactly once, on the calling thread, with no
/// scheduler lock held, and may block for arbitrary external-world
/// duration.
///
/// - `prepare()` runs after the operation's capacity has been secured
///   (slot occupied, reserved, or inherited from a waker) but before the
///   component is recorded as moved.
/// - `perform()` runs after bookkeeping marks the destination as holding
///   the component (or the source as not holding it, for a remove).
///
/// The component's busy flag is cleared only after `perform()` returns.
pub trait ComponentTransfer: Send + Sync {
    fn component(&self) -> ComponentId;

    /// Device the component leaves, if any. `None` for an add.
    fn source(&self) -> Option<DeviceId>;

    /// Device the component enters, if any. `None` for a remove.
    fn destination(&self) -> Option<DeviceId>;

    fn prepare(&self);

    fn perform(&self);
}

/// Add / remove / move classification of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Add { destination: DeviceId },
    Remove { source: DeviceId },
    Move { source: DeviceId, destination: DeviceId },
}

impl TransferKind {
    /// Classify a transfer from its endpoints. A transfer naming neither
    /// endpoint is rejected with `IllegalTransferType`.
    pub fn classify(
        component: ComponentId,
        source: Option<DeviceId>,
        destination: Option<DeviceId>,
    ) -> Result<Self> {
        match (source, destination) {
            (None, Some(destination)) => Ok(Self::Add { destination }),
            (Some(source), None) => Ok(Self::Remove { source }),
            (Some(source), Some(destination)) => Ok(Self::Move {
                source,
                destination,
            }),
            (None, None) => Err(TransferError::IllegalTransferType(component)),
        }
    }

    pub fn source(&self) -> Option<DeviceId> {
        match self {
            Self::Add { .. } => None,
            Self::Remove { source } | Self::Move { source, .. } => Some(*source),
        }
    }

    pub fn destination(&self) -> Option<DeviceId> {
        match self {
            Self::Remove { .. } => None,
            Self::Add { destination } | Self::Move { destination, .. } => Some(*destination),
        }
    }
}

/// Per-operation lifecycle phase.
///
/// ```text
///                     ┌──────────────────────┐
///                     ▼                      │ (waker hands off the
/// Admitted ──► WaitingForCapacity ──► Inherited   capacity step)
///     │               │
///     │               └──► WaitingInCycleGroup   (ring extracted)
///     │
///     └──► Running ──► Prepared ──► Committed ──► Done
/// ```
///
/// `WaitingForCapacity → Inherited` is the hand-off transition: the waking
/// operation performs the parked operation's capacity step under its own
/// lock tenure, then signals the parked thread's rendezvous channel. The
/// resumed thread next touches scheduler state at its post-`prepare()`
/// lock acquisition, which records `Prepared`.
///
/// `Done` is terminal; the scheduler discards the phase entry at that
/// point, so completed operations do not appear in snapshots. A rejected
/// operation never enters the machine at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferPhase {
    /// Validated and marked busy; capacity not yet examined.
    Admitted,
    /// Capacity secured; the operation owns its forward progress.
    Running,
    /// Parked on the destination's wait list.
    WaitingForCapacity,
    /// Member of an extracted wait-for cycle, released as a group.
    WaitingInCycleGroup,
    /// A waker reserved capacity on this operation's behalf.
    Inherited,
    /// `prepare()` returned; source vacated (component may be in flight).
    Prepared,
    /// Destination occupancy committed (or source release committed).
    Committed,
    /// `perform()` returned and busy cleared.
    Done,
}

impl TransferPhase {
    /// True while the operation's thread is blocked on a scheduler signal.
    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::WaitingForCapacity | Self::WaitingInCycleGroup)
    }

    /// True once capacity is secured, by any path.
    pub fn has_capacity(&self) -> bool {
        matches!(
            self,
            Self::Running | Self::Inherited | Self::Prepared | Self::Committed | Self::Done
        )
    }
}

type Callback = Box<dyn Fn() + Send + Sync>;

/// Closure-backed `ComponentTransfer` for callers that do not want to
/// implement the trait themselves.
///
/// ```
/// use stowage::{ComponentId, DeviceId, Transfer};
///
/// let t = Transfer::between(ComponentId::new(101), DeviceId::new(1), DeviceId::new(2))
///     .on_prepare(|| { /* stage payload */ })
///     .on_perform(|| { /* copy payload */ });
/// ```
pub struct Transfer {
    component: ComponentId,
    source: Option<DeviceId>,
    destination: Option<DeviceId>,
    prepare: Option<Callback>,
    perform: Option<Callback>,
}

impl Transfer {
    /// An add: the component enters `destination` from outside the cluster.
    pub fn add(component: ComponentId, destination: DeviceId) -> Self {
        Self::new(component, None, Some(destination))
    }

    /// A remove: the component leaves `source` and the cluster.
    pub fn remove(component: ComponentId, source: DeviceId) -> Self {
        Self::new(component, Some(source), None)
    }

    /// A move between two devices.
    pub fn between(component: ComponentId, source: DeviceId, destination: DeviceId) -> Self {
        Self::new(component, Some(source), Some(destination))
    }

    fn new(
        component: ComponentId,
        source: Option<DeviceId>,
        destination: Option<DeviceId>,
    ) -> Self {
        Self {
            component,
            source,
            destination,
            prepare: None,
            perform: None,
        }
    }

    pub fn on_prepare(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.prepare = Some(Box::new(f));
        self
    }

    pub fn on_perform(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.perform = Some(Box::new(f));
        self
    }
}

impl ComponentTransfer for Transfer {
    fn component(&self) -> ComponentId {
        self.component
    }

    fn source(&self) -> Option<DeviceId> {
        self.source
    }

    fn destination(&self) -> Option<DeviceId> {
        self.destination
    }

    fn prepare(&self) {
        if let Some(f) = &self.prepare {
            f();
        }
    }

    fn perform(&self) {
        if let Some(f) = &self.perform {
            f();
        }
    }
}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfer")
            .field("component", &self.component)
            .field("source", &self.source)
            .field("destination", &self.destination)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_endpoints() {
        let comp = ComponentId::new(1);
        let d1 = DeviceId::new(1);
        let d2 = DeviceId::new(2);

        assert_eq!(
            TransferKind::classify(comp, None, Some(d1)),
            Ok(TransferKind::Add { destination: d1 })
        );
        assert_eq!(
            TransferKind::classify(comp, Some(d1), None),
            Ok(TransferKind::Remove { source: d1 })
        );
        assert_eq!(
            TransferKind::classify(comp, Some(d1), Some(d2)),
            Ok(TransferKind::Move {
                source: d1,
                destination: d2
            })
        );
        assert_eq!(
            TransferKind::classify(comp, None, None),
            Err(TransferError::IllegalTransferType(comp))
        );
    }

    #[test]
    fn test_kind_endpoint_accessors() {
        let d1 = DeviceId::new(1);
        let d2 = DeviceId::new(2);
        let mv = TransferKind::Move {
            source: d1,
            destination: d2,
        };
        assert_eq!(mv.source(), Some(d1));
        assert_eq!(mv.destination(), Some(d2));
        assert_eq!(TransferKind::Add { destination: d2 }.source(), None);
        assert_eq!(TransferKind::Remove { source: d1 }.destination(), None);
    }

    #[test]
    fn test_phase_is_waiting() {
        assert!(TransferPhase::WaitingForCapacity.is_waiting());
        assert!(TransferPhase::WaitingInCycleGroup.is_waiting());
        assert!(!TransferPhase::Admitted.is_waiting());
        assert!(!TransferPhase::Inherited.is_waiting());
        assert!(!TransferPhase::Prepared.is_waiting());
    }

    #[test]
    fn test_phase_has_capacity() {
        assert!(TransferPhase::Running.has_capacity());
        assert!(TransferPhase::Inherited.has_capacity());
        assert!(TransferPhase::Committed.has_capacity());
        assert!(!TransferPhase::Admitted.has_capacity());
        assert!(!TransferPhase::WaitingForCapacity.has_capacity());
    }

    #[test]
    fn test_builder_callbacks_fire() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let hits = Arc::new(AtomicU32::new(0));
        let h1 = hits.clone();
        let h2 = hits.clone();
        let t = Transfer::add(ComponentId::new(9), DeviceId::new(1))
            .on_prepare(move || {
                h1.fetch_add(1, Ordering::SeqCst);
            })
            .on_perform(move || {
                h2.fetch_add(10, Ordering::SeqCst);
            });

        t.prepare();
        t.perform();
        assert_eq!(hits.load(Ordering::SeqCst), 11);
        assert_eq!(t.component(), ComponentId::new(9));
        assert_eq!(t.destination(), Some(DeviceId::new(1)));
    }
}
