// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Concurrent transfer scheduling for a storage cluster of fixed devices
//! with bounded slot capacity.
//!
//! Components are added to, removed from, and moved between devices by
//! [`ComponentTransfer`] operations executed on caller threads through a
//! shared [`TransferScheduler`]. The scheduler validates each request,
//! secures destination capacity (waiting when necessary), invokes the
//! transfer's two callback phases with no internal lock held, and keeps
//! every device within its slot capacity at all times. Operations whose
//! wait-for dependencies close a ring are detected and released as a
//! group, so the scheduler never deadlocks on legitimate requests.
//!
//! ```no_run
//! use stowage::{ClusterConfig, Transfer, TransferScheduler};
//!
//! let config = ClusterConfig::new()
//!     .device(1, 3)
//!     .device(2, 3)
//!     .place(101, 1);
//! let scheduler = TransferScheduler::new(config)?;
//! scheduler.execute(&Transfer::between(101.into(), 1.into(), 2.into()))?;
//! # Ok::<(), stowage::TransferError>(())
//! ```

pub mod config;
pub mod error;
pub mod scheduler;
pub mod snapshot;
pub mod transfer;
pub mod types;

mod device;
mod registry;
mod waitgraph;

pub use config::ClusterConfig;
pub use error::{Result, TransferError};
pub use scheduler::TransferScheduler;
pub use snapshot::{ClusterSnapshot, DeviceSnapshot, ReservationSnapshot};
pub use transfer::{ComponentTransfer, Transfer, TransferKind, TransferPhase};
pub use types::{ComponentId, DeviceId};
