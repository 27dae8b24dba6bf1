//! Background monitoring example
//!
//! Duty-cycles the radio and reports presence changes for XY4 finders only.
//!
//! Run with: cargo run --example background_monitor

use std::time::Duration;
use xyfinder_rust_ble::{
    DeviceFamily, DeviceManager, EngineConfig, EventKind, FinderEvent, Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("xyfinder_rust_ble=info".parse().unwrap()),
        )
        .init();

    let config = EngineConfig::default()
        .with_families([DeviceFamily::Xy4])
        .with_background_duty_cycle(Duration::from_secs(5), Duration::from_secs(15))
        .with_stale_timeouts(Duration::from_secs(10), Duration::from_secs(40));
    let manager = DeviceManager::with_config(config).await?;

    let _monitor = manager.subscribe(
        &[EventKind::Entered, EventKind::Exited, EventKind::Updated],
        "background-monitor",
        |event| {
            let now = chrono::Local::now().format("%H:%M:%S");
            match event {
                FinderEvent::Entered { device } => {
                    println!("{} + {} ({})", now, device.id(), device.proximity())
                }
                FinderEvent::Exited { device } => println!("{} - {}", now, device.id()),
                FinderEvent::Updated { device } => {
                    println!("{} ~ {} power {}", now, device.id(), device.power_level())
                }
                _ => {}
            }
        },
    )?;

    manager.start_monitoring().await?;
    println!("Monitoring in the background. Press Ctrl+C to stop.\n");

    let _ = tokio::signal::ctrl_c().await;

    println!("\nStopping...");
    manager.stop_monitoring().await?;
    manager.shutdown().await?;

    Ok(())
}
