use env_logger;

use viera_client::{discover_viera_devices, VieraClient, VieraError};

#[tokio::main]
async fn main() -> Result<(), VieraError> {
    // Print all logs to stdout
    env_logger::Builder::new()
        .filter(None, log::LevelFilter::Debug)
        .init();

    println!("Discovering Viera TVs...");

    let devices = discover_viera_devices().await?;

    if devices.is_empty() {
        println!("\nNo Viera TVs found.\n");
        return Ok(());
    }

    println!("\nDiscovered TVs:\n");

    for ip in devices {
        match VieraClient::probe(ip).await {
            Ok(tv) => println!("{ip}: {}", tv.specs()),
            Err(e) => println!("{ip}: could not fetch specs ({e})"),
        }
    }

    Ok(())
}
