/**
 * Scanner Example
 *
 * This example demonstrates how to scan the local network for Broadlink
 * devices using a UDP broadcast and print what answers.
 */
use std::time::Duration;

#[tokio::main]
async fn main() {
    env_logger::init();

    println!("--- Rustlink - Scanner ---");
    println!("[INFO] Scanning the network for Broadlink devices...");

    let discovery = rustlink::DiscoveryManager::new();

    match discovery.scan(Duration::from_secs(10)).await {
        Ok(devices) => {
            for (i, device) in devices.iter().enumerate() {
                println!(
                    "[{}] Found Device: MAC={}, IP={}, Model={:#06x}, Kind={:?}",
                    i + 1,
                    rustlink::protocol::format_mac(&device.mac),
                    device.addr,
                    device.model,
                    device.kind
                );
            }
            println!("[INFO] Scan finished. Total devices found: {}", devices.len());
        }
        Err(e) => eprintln!("[ERROR] Scan failed: {}", e),
    }
}
