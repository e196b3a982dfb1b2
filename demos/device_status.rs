/**
 * Device Status Example
 *
 * This example demonstrates how to manage one smart socket: poll its
 * connectivity in the background and react to Online/Offline events.
 */
use futures_util::StreamExt;
use rustlink::{Device, DeviceConfig, DiscoveryManager, SocketSwitch};
use std::time::Duration;

#[tokio::main]
async fn main() {
    env_logger::init();

    println!("--- Rustlink - Device Status ---");

    // 1. Configure the device (dynamic IP: rediscovered by MAC if it moves)
    let config = DeviceConfig::new("192.168.0.23", "aa:bb:cc:dd:ee:ff")
        .expect("valid device configuration")
        .with_static_ip(false)
        .with_poll_interval(Duration::from_secs(30));

    let discovery = DiscoveryManager::new();
    let device = Device::new(config, Box::new(SocketSwitch), discovery)
        .expect("valid device configuration");

    // 2. Get the event stream before polling starts
    let events = device.events();
    tokio::pin!(events);

    // 3. Poll in the background and watch connectivity for a minute
    device.start();
    println!("[INFO] Waiting for events (Press Ctrl+C to stop)...");

    let timeout = tokio::time::sleep(Duration::from_secs(60));
    tokio::pin!(timeout);

    loop {
        tokio::select! {
            Some(event) = events.next() => {
                match event.reason {
                    Some(reason) => println!("[EVENT] {:?}: {}", event.status, reason),
                    None => println!("[EVENT] {:?}", event.status),
                }
            }
            _ = &mut timeout => {
                println!("[INFO] Example timeout reached. Exiting.");
                break;
            }
        }
    }

    device.stop();
}
