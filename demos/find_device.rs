//! Find a device: read its firmware version and play the locator tune
//!
//! Run with: cargo run --example find_device
//!
//! To target a specific device:
//!   cargo run --example find_device -- --id xy:ibeacon:<uuid>.<major>.<minor>

use std::time::Duration;
use xyfinder_rust_ble::{DeviceManager, EngineConfig, Error, EventKind, FinderSong, Result};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("warn,xyfinder_rust_ble=debug")
        .init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let target_id = args
        .iter()
        .position(|arg| arg == "--id")
        .and_then(|i| args.get(i + 1))
        .cloned();

    let config = EngineConfig::default()
        .with_rssi_floor(-85)
        .with_operation_timeout(Duration::from_secs(5));
    let manager = DeviceManager::with_config(config).await?;

    let _link = manager.subscribe(
        &[
            EventKind::Connected,
            EventKind::Disconnected,
            EventKind::ConnectionError,
            EventKind::TimedOut,
        ],
        "find-link",
        |event| println!("  [{:?}] {}", event.kind(), event.device().id()),
    )?;

    if let Some(id) = &target_id {
        manager.add_device(id)?;
    }

    manager.start_scanning().await?;
    println!("Looking for a finder...");

    let device = {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        loop {
            let found = match &target_id {
                Some(id) => manager
                    .device(id)
                    .filter(|d| manager.is_ranged(d)),
                None => manager.nearest_device(),
            };
            if let Some(device) = found {
                break device;
            }
            if tokio::time::Instant::now() >= deadline {
                manager.shutdown().await?;
                return Err(Error::DeviceNotFound {
                    identifier: target_id.unwrap_or_else(|| "any finder".to_string()),
                });
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    };

    println!("Found {} ({})", device.id(), device.proximity());

    match manager.read_version(&device).await {
        Ok(version) => println!("Firmware version: {}", version),
        Err(e) => println!("Could not read version: {}", e),
    }

    println!("Playing locator tune...");
    manager.find(&device, FinderSong::FindIt).await?;
    tokio::time::sleep(Duration::from_secs(3)).await;
    manager.find(&device, FinderSong::Off).await?;

    manager.shutdown().await?;
    println!("\nDone!");

    Ok(())
}
