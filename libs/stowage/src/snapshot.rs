//! Point-in-time snapshot types for cluster observation.
//!
//! Snapshots are taken under the scheduler lock and are therefore
//! internally consistent: every capacity invariant that holds for the
//! live cluster holds for the snapshot. Tests use them to assert
//! occupancy bounds, hand-off phases, and parked queues without reaching
//! into scheduler internals.

use serde::Serialize;

use crate::transfer::TransferPhase;
use crate::types::{ComponentId, DeviceId};

/// Point-in-time snapshot of one device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    /// Device identifier.
    pub id: DeviceId,
    /// Total slot count.
    pub capacity: usize,
    /// Resident components, sorted.
    pub occupants: Vec<ComponentId>,
    /// Occupants marked departing, oldest first.
    pub departing: Vec<ComponentId>,
    /// Outstanding slot reservations.
    pub reservations: Vec<ReservationSnapshot>,
    /// Components parked waiting to enter, arrival order.
    pub parked: Vec<ComponentId>,
}

/// One outstanding slot reservation.
#[derive(Debug, Clone, Serialize)]
pub struct ReservationSnapshot {
    /// Component the slot is claimed for.
    pub incoming: ComponentId,
    /// Departing occupant whose slot it claims, if not yet vacated.
    pub vacating: Option<ComponentId>,
    /// True once the slot is materially free (counts against capacity).
    pub ready: bool,
}

impl DeviceSnapshot {
    /// Slots counted against capacity: occupants plus ready reservations.
    pub fn slots_in_use(&self) -> usize {
        self.occupants.len() + self.reservations.iter().filter(|r| r.ready).count()
    }

    pub fn free_slots(&self) -> usize {
        self.capacity.saturating_sub(self.slots_in_use())
    }

    pub fn holds(&self, component: ComponentId) -> bool {
        self.occupants.contains(&component)
    }
}

/// Full-cluster snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterSnapshot {
    /// All devices, sorted by id.
    pub devices: Vec<DeviceSnapshot>,
    /// Components with an operation in flight, sorted.
    pub busy: Vec<ComponentId>,
    /// Lifecycle phase of every in-flight operation, sorted by component.
    pub phases: Vec<(ComponentId, TransferPhase)>,
}

impl ClusterSnapshot {
    pub fn device(&self, id: DeviceId) -> Option<&DeviceSnapshot> {
        self.devices.iter().find(|d| d.id == id)
    }

    pub fn phase(&self, component: ComponentId) -> Option<TransferPhase> {
        self.phases
            .iter()
            .find(|(c, _)| *c == component)
            .map(|(_, p)| *p)
    }

    pub fn is_busy(&self, component: ComponentId) -> bool {
        self.busy.contains(&component)
    }

    /// Check the global capacity invariant: for every device,
    /// `occupants + ready reservations <= capacity`.
    pub fn capacity_invariant_holds(&self) -> bool {
        self.devices.iter().all(|d| d.slots_in_use() <= d.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comp(n: u32) -> ComponentId {
        ComponentId::new(n)
    }

    #[test]
    fn test_slots_in_use_counts_ready_reservations() {
        let dev = DeviceSnapshot {
            id: DeviceId::new(1),
            capacity: 3,
            occupants: vec![comp(10), comp(11)],
            departing: vec![comp(10)],
            reservations: vec![
                ReservationSnapshot {
                    incoming: comp(20),
                    vacating: Some(comp(10)),
                    ready: false,
                },
                ReservationSnapshot {
                    incoming: comp(21),
                    vacating: None,
                    ready: true,
                },
            ],
            parked: vec![],
        };
        assert_eq!(dev.slots_in_use(), 3);
        assert_eq!(dev.free_slots(), 0);
    }

    #[test]
    fn test_capacity_invariant_check() {
        let good = ClusterSnapshot {
            devices: vec![DeviceSnapshot {
                id: DeviceId::new(1),
                capacity: 1,
                occupants: vec![comp(10)],
                departing: vec![],
                reservations: vec![],
                parked: vec![],
            }],
            busy: vec![],
            phases: vec![],
        };
        assert!(good.capacity_invariant_holds());
    }
}
