// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Concurrent transfer burst demo.
//!
//! Six devices with three slots each, eighteen components, and a handful
//! of transferer threads moving components between devices at once. Each
//! transfer self-checks the callback contract: `prepare()` runs exactly
//! once before `perform()`, and both run on the thread that issued the
//! transfer.
//!
//! ```bash
//! cargo run -p transfer-burst
//! RUST_LOG=stowage=trace cargo run -p transfer-burst
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::thread::ThreadId;
use std::time::Duration;

use stowage::{
    ClusterConfig, ComponentId, ComponentTransfer, DeviceId, TransferScheduler,
};
use tracing_subscriber::EnvFilter;

static UID: AtomicUsize = AtomicUsize::new(0);

/// A transfer that narrates its lifecycle and verifies the callback
/// contract as it goes.
struct BurstTransfer {
    uid: usize,
    owner: ThreadId,
    component: ComponentId,
    source: Option<DeviceId>,
    destination: Option<DeviceId>,
    duration: Duration,
    prepared: AtomicBool,
    performed: AtomicBool,
}

impl BurstTransfer {
    fn new(
        component: u32,
        source: Option<u32>,
        destination: Option<u32>,
        duration_ms: u64,
    ) -> Self {
        let uid = UID.fetch_add(1, Ordering::SeqCst) + 1;
        let transfer = Self {
            uid,
            owner: thread::current().id(),
            component: ComponentId::new(component),
            source: source.map(DeviceId::new),
            destination: destination.map(DeviceId::new),
            duration: Duration::from_millis(duration_ms),
            prepared: AtomicBool::new(false),
            performed: AtomicBool::new(false),
        };
        println!(
            "[{:?}] issuing transfer {} of {} from {:?} to {:?}",
            transfer.owner, uid, transfer.component, transfer.source, transfer.destination
        );
        transfer
    }
}

impl ComponentTransfer for BurstTransfer {
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
        assert!(
            !self.prepared.swap(true, Ordering::SeqCst),
            "transfer {} prepared more than once",
            self.uid
        );
        assert_eq!(
            thread::current().id(),
            self.owner,
            "transfer {} prepared off its issuing thread",
            self.uid
        );
        println!(
            "transfer {} of {} prepared on {:?}",
            self.uid,
            self.component,
            thread::current().id()
        );
    }

    fn perform(&self) {
        assert!(
            self.prepared.load(Ordering::SeqCst),
            "transfer {} performed before prepare",
            self.uid
        );
        assert!(
            !self.performed.swap(true, Ordering::SeqCst),
            "transfer {} performed more than once",
            self.uid
        );
        assert_eq!(
            thread::current().id(),
            self.owner,
            "transfer {} performed off its issuing thread",
            self.uid
        );
        thread::sleep(self.duration);
        println!("transfer {} of {} completed", self.uid, self.component);
    }
}

fn setup_cluster() -> ClusterConfig {
    let mut config = ClusterConfig::new();
    for device in 1..=6 {
        config = config.device(device, 3);
    }
    // Three components per device: 101..=109 and 111..=119.
    for (slot, component) in (101..=109).chain(111..=119).enumerate() {
        config = config.place(component as u32, (slot / 3 + 1) as u32);
    }
    config
}

fn run_transfer(
    scheduler: &TransferScheduler,
    component: u32,
    source: u32,
    destination: u32,
    duration_ms: u64,
) {
    let transfer = BurstTransfer::new(
        component,
        (source > 0).then_some(source),
        (destination > 0).then_some(destination),
        duration_ms,
    );
    if let Err(e) = scheduler.execute(&transfer) {
        panic!("unexpected transfer rejection: {e}");
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let scheduler = TransferScheduler::new(setup_cluster())?;
    tracing::info!("Cluster ready; starting transferers");

    // Overlapping moves through shared devices, including enough pressure
    // on device 2 to exercise waiting and hand-off.
    let burst: &[(u32, u32, u32, u64)] = &[
        (101, 1, 2, 20),
        (111, 4, 2, 20),
        (107, 3, 4, 10),
        (108, 3, 1, 10),
        (104, 2, 3, 10),
    ];

    let scheduler = &scheduler;
    thread::scope(|s| {
        for &(component, source, destination, duration_ms) in burst {
            s.spawn(move || {
                thread::sleep(Duration::from_millis(fastrand::u64(0..5)));
                println!("transferer {:?} has started", thread::current().id());
                run_transfer(&scheduler, component, source, destination, duration_ms);
                println!("transferer {:?} has finished", thread::current().id());
            });
        }
    });

    let snapshot = scheduler.snapshot();
    println!("final cluster layout:");
    for device in &snapshot.devices {
        println!(
            "  {}: {:?} ({} free)",
            device.id,
            device.occupants,
            device.free_slots()
        );
    }
    assert!(snapshot.capacity_invariant_holds());
    Ok(())
}
