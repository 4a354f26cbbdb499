//! Two coordinators racing to migrate the same database.
//!
//! Run with: `cargo run -p keva-store --example coordinated`

use std::time::Duration;

use keva_migrate::{run, ApplyOptions, Migration, VersionedStore};
use keva_store::{LocalBus, LockCoordinator, MemoryStore};

fn main() {
    let bus = LocalBus::new();
    let set = vec![
        Migration::new(1, "init").with_store("events", "++id,at,kind"),
        Migration::new(2, "sessions").with_store("sessions", "id,&token"),
    ];

    // First coordinator wins the lock and migrates.
    let winner = LockCoordinator::new(bus.subscribe("events-db"));
    let mut store = MemoryStore::new();
    let outcome = winner.run_with_coordination(Duration::from_secs(1), || {
        run(&mut store, &set, ApplyOptions::default())
    });
    match outcome {
        Ok(report) => println!("winner applied {:?}", report.applied),
        Err(e) => println!("winner failed: {e}"),
    }
    println!("store version: {}", store.current_version().unwrap_or(0));

    // A second coordinator on the same topic would have waited: with the
    // lock released it now acquires immediately and finds nothing pending.
    let second = LockCoordinator::new(bus.subscribe("events-db"));
    let outcome = second.run_with_coordination(Duration::from_secs(1), || {
        run(&mut store, &set, ApplyOptions::default())
    });
    match outcome {
        Ok(report) => println!("second skipped {:?}", report.skipped),
        Err(e) => println!("second failed: {e}"),
    }
}
