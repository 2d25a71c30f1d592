// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Cluster configuration: device capacities and initial component
//! placement.
//!
//! Built programmatically or loaded from a TOML file:
//!
//! ```toml
//! [[devices]]
//! id = 1
//! capacity = 3
//!
//! [[components]]
//! id = 101
//! device = 1
//! ```
//!
//! The configuration is validated when the scheduler is constructed; a
//! placement referencing an unknown device, a duplicate component, or an
//! over-capacity device fails with `InvalidConfiguration` before any
//! operation can run.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Result, TransferError};
use crate::types::{ComponentId, DeviceId};

#[derive(Debug, Deserialize)]
struct DeviceDecl {
    id: u32,
    capacity: usize,
}

#[derive(Debug, Deserialize)]
struct PlacementDecl {
    id: u32,
    device: u32,
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    devices: Vec<DeviceDecl>,
    #[serde(default)]
    components: Vec<PlacementDecl>,
}

/// Immutable cluster description consumed by `TransferScheduler::new`.
#[derive(Debug, Clone, Default)]
pub struct ClusterConfig {
    capacities: HashMap<DeviceId, usize>,
    placement: HashMap<ComponentId, DeviceId>,
}

impl ClusterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a device with the given slot count.
    pub fn device(mut self, id: impl Into<DeviceId>, capacity: usize) -> Self {
        self.capacities.insert(id.into(), capacity);
        self
    }

    /// Place a component on a device at construction time.
    pub fn place(mut self, component: impl Into<ComponentId>, device: impl Into<DeviceId>) -> Self {
        self.placement.insert(component.into(), device.into());
        self
    }

    /// Parse a TOML cluster description.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(content)
            .map_err(|e| TransferError::InvalidConfiguration(format!("parse error: {e}")))?;

        let mut config = Self::new();
        for d in raw.devices {
            let id = DeviceId::new(d.id);
            if config.capacities.insert(id, d.capacity).is_some() {
                return Err(TransferError::InvalidConfiguration(format!(
                    "device {id} declared twice"
                )));
            }
        }
        for c in raw.components {
            let component = ComponentId::new(c.id);
            let device = DeviceId::new(c.device);
            if config.placement.insert(component, device).is_some() {
                return Err(TransferError::InvalidConfiguration(format!(
                    "component {component} placed twice"
                )));
            }
        }
        Ok(config)
    }

    /// Load a TOML cluster description from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TransferError::InvalidConfiguration(format!(
                "failed to read {}: {e}",
                path.display()
            ))
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!("Loaded cluster config from {}", path.display());
        Ok(config)
    }

    /// Validate internal consistency: every placed component references a
    /// known device and no device starts over capacity.
    pub fn validate(&self) -> Result<()> {
        let mut initial_counts: HashMap<DeviceId, usize> = HashMap::new();
        for (component, device) in &self.placement {
            if !self.capacities.contains_key(device) {
                return Err(TransferError::InvalidConfiguration(format!(
                    "component {component} placed on unknown device {device}"
                )));
            }
            *initial_counts.entry(*device).or_default() += 1;
        }
        for (device, count) in initial_counts {
            let capacity = self.capacities.get(&device).copied().unwrap_or(0);
            if count > capacity {
                return Err(TransferError::InvalidConfiguration(format!(
                    "device {device} holds {count} components but has capacity {capacity}"
                )));
            }
        }
        Ok(())
    }

    pub fn device_count(&self) -> usize {
        self.capacities.len()
    }

    pub fn component_count(&self) -> usize {
        self.placement.len()
    }

    pub(crate) fn into_parts(self) -> (HashMap<DeviceId, usize>, HashMap<ComponentId, DeviceId>) {
        (self.capacities, self.placement)
    }
}
