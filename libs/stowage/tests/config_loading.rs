// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Loading a cluster description from a TOML file and driving the
//! scheduler from it.

use std::io::Write;

use stowage::{ClusterConfig, ComponentId, DeviceId, Transfer, TransferError, TransferScheduler};

#[test]
fn test_load_and_run_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
        [[devices]]
        id = 1
        capacity = 2

        [[devices]]
        id = 2
        capacity = 2

        [[components]]
        id = 101
        device = 1
        "#
    )
    .unwrap();

    let config = ClusterConfig::load(file.path()).unwrap();
    assert_eq!(config.device_count(), 2);
    assert_eq!(config.component_count(), 1);

    let scheduler = TransferScheduler::new(config).unwrap();
    scheduler
        .execute(&Transfer::between(
            ComponentId::new(101),
            DeviceId::new(1),
            DeviceId::new(2),
        ))
        .unwrap();
    assert!(
        scheduler
            .snapshot()
            .device(DeviceId::new(2))
            .unwrap()
            .holds(ComponentId::new(101))
    );
}

#[test]
fn test_missing_file_is_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = ClusterConfig::load(&dir.path().join("nope.toml")).unwrap_err();
    assert!(matches!(err, TransferError::InvalidConfiguration(_)));
}

#[test]
fn test_placement_on_undeclared_device_rejected_at_construction() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
        [[devices]]
        id = 1
        capacity = 1

        [[components]]
        id = 101
        device = 7
        "#
    )
    .unwrap();

    let config = ClusterConfig::load(file.path()).unwrap();
    assert!(matches!(
        TransferScheduler::new(config),
        Err(TransferError::InvalidConfiguration(_))
    ));
}
