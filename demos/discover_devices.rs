//! Basic example: Discover nearby BLE peripherals
//!
//! Run with: cargo run --example discover_devices

use blelink::{Result, SessionManager};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("blelink=debug".parse().unwrap()),
        )
        .init();

    println!("Starting BLE device discovery...\n");

    let manager = SessionManager::new().await?;
    manager.initialize().await?;

    // Register callback for registry changes
    let _handle = manager.on_devices_changed(|devices| {
        println!("\n{} device(s) in sight:", devices.len());
        for device in &devices {
            println!("  {} ({}) at {} dBm", device.name, device.id, device.rssi);
        }
    });

    manager.start_scan(Duration::from_secs(30)).await?;

    println!("Scanning for 30 seconds...");
    println!("Press Ctrl+C to exit early.\n");

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(30)) => {}
        _ = tokio::signal::ctrl_c() => {
            println!("\nInterrupted!");
            manager.stop_scan().await?;
        }
    }

    println!("\n--- Scan Complete ---");
    println!("Total devices found: {}", manager.devices().len());

    // List all devices
    for device in manager.devices() {
        println!("  {} - {} (RSSI: {} dBm)", device.name, device.id, device.rssi);
        if !device.advertisement.services.is_empty() {
            println!("    advertises: {:?}", device.advertisement.services);
        }
    }

    manager.shutdown();
    println!("\nDone!");

    Ok(())
}
