//! Connect to a peripheral and exchange text over a characteristic
//!
//! Scans for devices, connects to the one named on the command line (or the
//! first one found), subscribes to the first characteristic that notifies,
//! and writes a line of text to the first writable one.
//!
//! Run with: cargo run --example text_exchange [device-id] [message]

use blelink::{Result, SessionManager, DEFAULT_SCAN_DURATION};
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

    let mut args = std::env::args().skip(1);
    let wanted = args.next();
    let message = args.next().unwrap_or_else(|| "ping".to_string());

    let manager = SessionManager::new().await?;
    manager.initialize().await?;

    println!("Scanning for {:?}...\n", DEFAULT_SCAN_DURATION);
    manager.start_scan(DEFAULT_SCAN_DURATION).await?;
    tokio::time::sleep(DEFAULT_SCAN_DURATION).await;

    let devices = manager.devices();
    if devices.is_empty() {
        println!("No devices found.");
        manager.shutdown();
        return Ok(());
    }
    for device in &devices {
        println!("  {} ({}) at {} dBm", device.name, device.id, device.rssi);
    }

    let target = match wanted {
        Some(id) => match manager.device(&id) {
            Some(device) => device,
            None => {
                println!("\nDevice {id} was not seen during the scan.");
                manager.shutdown();
                return Ok(());
            }
        },
        None => devices[0].clone(),
    };

    println!("\nConnecting to {} ({})...", target.name, target.id);
    manager.connect(&target.id).await?;

    // Pick the characteristics to talk over
    let services = manager.services(&target.id)?;
    let mut notify_char = None;
    let mut write_char = None;
    for service in &services {
        println!("Service {}", service.uuid);
        for characteristic in &service.characteristics {
            println!(
                "  characteristic {} ({:?})",
                characteristic.uuid, characteristic.properties
            );
            if notify_char.is_none() && characteristic.properties.supports_subscription() {
                notify_char = Some((service.uuid, characteristic.uuid));
            }
            if write_char.is_none() && characteristic.properties.supports_write() {
                write_char = Some((service.uuid, characteristic.uuid));
            }
        }
    }

    if let Some((service, characteristic)) = notify_char {
        println!("\nSubscribing to {characteristic}...");
        manager
            .start_notifications(&target.id, service, characteristic, |text| {
                println!("<- {text}");
            })
            .await?;
    }

    if let Some((service, characteristic)) = write_char {
        println!("-> {message}");
        manager
            .write(&target.id, service, characteristic, &message, true)
            .await?;
    } else {
        println!("\nNo writable characteristic found.");
    }

    println!("\nListening for 15 seconds. Press Ctrl+C to exit early.");
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(15)) => {}
        _ = tokio::signal::ctrl_c() => {
            println!("\nInterrupted!");
        }
    }

    // Show what happened, newest first
    println!("\n--- Activity ---");
    for entry in manager.activity().entries() {
        println!("  {entry}");
    }

    manager.disconnect(&target.id).await?;
    manager.shutdown();
    println!("\nDone!");

    Ok(())
}
