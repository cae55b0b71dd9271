use std::net::Ipv4Addr;

use env_logger;
use tokio::io::{AsyncBufReadExt, BufReader};

use viera_client::{Credentials, VieraClient, VieraError};

// Usage: control <TV IP> [<app id> <encryption key>]
#[tokio::main]
async fn main() -> Result<(), VieraError> {
    // Print all logs to stdout
    // Set LevelFilter::Debug to see the SOAP traffic
    env_logger::Builder::new()
        .filter(None, log::LevelFilter::Info)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let ip: Ipv4Addr = args
        .first()
        .and_then(|ip| ip.parse().ok())
        .ok_or_else(|| VieraError::Misuse("Usage: control <TV IP> [<app id> <key>]".into()))?;

    let credentials = match (args.get(1), args.get(2)) {
        (Some(app_id), Some(key)) => Some(Credentials::new(app_id, key)),
        _ => None,
    };

    let tv = VieraClient::connect(ip, credentials, None).await?;
    println!("Connected to {}", tv.specs());

    println!(concat!(
        ">>> Enter command:\n",
        ">>>    u (volume up), d (volume down), m (toggle mute), v (get volume)\n",
        ">>>    a (list apps), h<N> (switch to HDMI N), k<KEY> (send key), q (quit)\n"
    ));

    let mut reader = BufReader::new(tokio::io::stdin());

    loop {
        let mut buf = String::new();

        match reader.read_line(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        let input = buf.trim();

        let result = match input {
            "u" => tv.send_key("VOLUP").await,
            "d" => tv.send_key("VOLDOWN").await,
            "m" => match tv.get_mute().await {
                Ok(muted) => tv.set_mute(!muted).await,
                Err(e) => Err(e),
            },
            "v" => tv.get_volume().await.map(|volume| println!("<<< Volume: {volume}")),
            "a" => tv.get_apps().await.map(|apps| {
                for app in apps {
                    println!("<<< {app}");
                }
            }),
            "q" => break,
            _ if input.starts_with('h') => match input[1..].parse::<u8>() {
                Ok(hdmi) => tv.switch_to_hdmi(hdmi).await,
                Err(_) => Ok(()),
            },
            _ if input.starts_with('k') && input.len() > 1 => tv.send_key(&input[1..]).await,
            _ => Ok(()),
        };

        if let Err(e) = result {
            println!("<<< Command failed: {e}");
        }
    }

    Ok(())
}
