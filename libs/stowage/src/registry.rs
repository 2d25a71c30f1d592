// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Component registry: per-component busy flags and authoritative
//! placement, plus operation validation.
//!
//! Validation and `try_begin` run under the same critical section as
//! scheduling, so no two operations on the same component can both pass.

use std::collections::{HashMap, HashSet};

use crate::error::{Result, TransferError};
use crate::transfer::TransferKind;
use crate::types::{ComponentId, DeviceId};

#[derive(Debug, Default)]
pub(crate) struct ComponentRegistry {
    /// Components with an operation in flight.
    busy: HashSet<ComponentId>,
    /// Where each component currently resides. Updated at vacate (remove)
    /// and commit (enter); a component mid-move keeps its stale source
    /// mapping, shielded by the busy flag.
    placement: HashMap<ComponentId, DeviceId>,
}

impl ComponentRegistry {
    pub(crate) fn new(placement: HashMap<ComponentId, DeviceId>) -> Self {
        Self {
            busy: HashSet::new(),
            placement,
        }
    }

    /// Validate an operation against known devices and current placement,
    /// classifying it on success. No state is mutated.
    ///
    /// Check order: structural, busy, device existence, placement — the
    /// first failure wins.
    pub(crate) fn validate(
        &self,
        known_devices: &HashSet<DeviceId>,
        component: ComponentId,
        source: Option<DeviceId>,
        destination: Option<DeviceId>,
    ) -> Result<TransferKind> {
        let kind = TransferKind::classify(component, source, destination)?;

        if self.busy.contains(&component) {
            return Err(TransferError::ComponentIsBeingOperatedOn(component));
        }
        for device in [source, destination].into_iter().flatten() {
            if !known_devices.contains(&device) {
                return Err(TransferError::DeviceDoesNotExist(device));
            }
        }

        match kind {
            TransferKind::Add { .. } => {
                if let Some(current) = self.placement.get(&component) {
                    return Err(TransferError::ComponentAlreadyExists {
                        component,
                        device: *current,
                    });
                }
            }
            TransferKind::Remove { source } => {
                if self.placement.get(&component) != Some(&source) {
                    return Err(TransferError::ComponentDoesNotExist {
                        component,
                        device: source,
                    });
                }
            }
            TransferKind::Move {
                source,
                destination,
            } => {
                if self.placement.get(&component) != Some(&source) {
                    return Err(TransferError::ComponentDoesNotExist {
                        component,
                        device: source,
                    });
                }
                if destination == source {
                    return Err(TransferError::ComponentDoesNotNeedTransfer {
                        component,
                        device: destination,
                    });
                }
            }
        }

        Ok(kind)
    }

    /// Atomically check-not-busy-and-set-busy. Returns false if an
    /// operation on the component is already in flight.
    pub(crate) fn try_begin(&mut self, component: ComponentId) -> bool {
        self.busy.insert(component)
    }

    /// Clear the busy flag once an operation has fully completed.
    pub(crate) fn end(&mut self, component: ComponentId) {
        self.busy.remove(&component);
    }

    pub(crate) fn is_busy(&self, component: ComponentId) -> bool {
        self.busy.contains(&component)
    }

    pub(crate) fn busy_components(&self) -> impl Iterator<Item = ComponentId> + '_ {
        self.busy.iter().copied()
    }

    pub(crate) fn record_placement(&mut self, component: ComponentId, device: DeviceId) {
        self.placement.insert(component, device);
    }

    pub(crate) fn clear_placement(&mut self, component: ComponentId) {
        self.placement.remove(&component);
    }
}
