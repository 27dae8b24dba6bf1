//! Basic example: Discover nearby XY Finder devices
//!
//! Run with: cargo run --example discover_devices

use std::time::Duration;
use xyfinder_rust_ble::{DeviceManager, EventKind, FinderEvent, Result};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("xyfinder_rust_ble=debug".parse().unwrap()),
        )
        .init();

    println!("Starting XY Finder discovery...");
    println!("Press the button on your finder to see button events.\n");

    let manager = DeviceManager::new().await?;

    let _presence = manager.subscribe(
        &[EventKind::Entered, EventKind::Exited, EventKind::ButtonPressed],
        "discover-presence",
        |event| match event {
            FinderEvent::Entered { device } => {
                println!("\nEntered: {}", device.id());
                println!("  Family: {}", device.family());
                println!("  Address: {:?}", device.address());
                println!("  RSSI: {:?} dBm", device.rssi());
                println!("  Proximity: {}", device.proximity());
            }
            FinderEvent::Exited { device } => {
                println!("\nExited: {}", device.id());
            }
            FinderEvent::ButtonPressed { device, press } => {
                println!("\nButton {:?} on {}", press, device.id());
            }
            _ => {}
        },
    )?;

    let mut status = manager.subscribe_scan_status();
    tokio::spawn(async move {
        while let Ok(status) = status.recv().await {
            println!("[scan {}]", status);
        }
    });

    manager.start_scanning().await?;

    println!("Scanning for 30 seconds...");
    println!("Press Ctrl+C to exit early.\n");

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(30)) => {}
        _ = tokio::signal::ctrl_c() => {
            println!("\nInterrupted!");
        }
    }

    println!("\n--- Scan Complete ---");
    println!("Total devices found: {}", manager.device_count());

    for device in manager.ranged_devices() {
        println!(
            "  {} - power {} (RSSI: {:?}, seen {} times)",
            device.id(),
            device.power_level(),
            device.rssi(),
            device.detection_count()
        );
    }

    manager.shutdown().await?;
    println!("\nDone!");

    Ok(())
}
