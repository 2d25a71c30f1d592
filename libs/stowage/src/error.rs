use thiserror::Error;

use crate::types::{ComponentId, DeviceId};

/// Errors surfaced by `TransferScheduler::new` and `execute`.
///
/// All validation variants are raised synchronously inside `execute()`
/// before any state mutation; a rejected operation has no side effects.
/// `InterruptedWait` is the one infrastructure-level variant: it is fatal
/// for the operation and leaves the component marked busy (documented
/// limitation, no compensating action).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("device {0} does not exist")]
    DeviceDoesNotExist(DeviceId),

    #[error("component {component} does not exist on device {device}")]
    ComponentDoesNotExist {
        component: ComponentId,
        device: DeviceId,
    },

    #[error("component {component} already exists on device {device}")]
    ComponentAlreadyExists {
        component: ComponentId,
        device: DeviceId,
    },

    #[error("component {component} is already resident on device {device}")]
    ComponentDoesNotNeedTransfer {
        component: ComponentId,
        device: DeviceId,
    },

    #[error("component {0} is being operated on")]
    ComponentIsBeingOperatedOn(ComponentId),

    #[error("transfer for component {0} names neither a source nor a destination")]
    IllegalTransferType(ComponentId),

    #[error("wait interrupted for component {0}; the component remains busy")]
    InterruptedWait(ComponentId),
}

pub type Result<T> = std::result::Result<T, TransferError>;
