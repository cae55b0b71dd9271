//! Discover Panasonic Viera TVs on the local network.
//!
//! An SSDP `M-SEARCH` for the Panasonic network-control service is sent from every non-loopback
//! IPv4 interface at once. Every address which answers within the discovery window is a TV.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{Outcome, VieraError};
use crate::network::local_ipv4_addresses;
use crate::settings::ClientSettings;

const SSDP_MULTICAST: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(239, 255, 255, 250)), 1900);

const M_SEARCH: &str = concat!(
    "M-SEARCH * HTTP/1.1\r\n",
    "HOST:239.255.255.250:1900\r\n",
    "MAN:\"ssdp:discover\"\r\n",
    "ST:urn:panasonic-com:service:p00NetworkControl:1\r\n",
    "MX:1\r\n",
    "\r\n"
);

// SSDP replies are a handful of headers
const MAX_REPLY_SIZE: usize = 2048;

/// Scans the local network for Viera TVs using the default discovery window.
///
/// See [`discover_viera_devices_with`].
pub async fn discover_viera_devices() -> Outcome<HashSet<Ipv4Addr>> {
    discover_viera_devices_with(&ClientSettings::default()).await
}

/// Scans the local network for Viera TVs, returning the address of every TV which answered.
///
/// No discovered TVs is an empty set. Failing to search from one interface is logged and the
/// other interfaces are still searched.
pub async fn discover_viera_devices_with(settings: &ClientSettings) -> Outcome<HashSet<Ipv4Addr>> {
    let interfaces = local_ipv4_addresses()?;

    if interfaces.is_empty() {
        let msg = "No non-loopback IPv4 interface to discover from";
        error!("{}", msg);

        return Err(VieraError::Connectivity(msg.into()));
    }

    info!(
        "Performing SSDP discovery for Viera TVs on {} interface{}...",
        interfaces.len(),
        if interfaces.len() == 1 { "" } else { "s" }
    );

    let found = search(&interfaces, SSDP_MULTICAST, settings.discovery_window).await;

    info!(
        "Viera SSDP discovery found {} TV{}",
        found.len(),
        if found.len() == 1 { "" } else { "s" }
    );

    Ok(found)
}

/// Send an `M-SEARCH` to `target` from each of `interfaces`, collecting responders for `window`.
async fn search(
    interfaces: &[Ipv4Addr],
    target: SocketAddr,
    window: Duration,
) -> HashSet<Ipv4Addr> {
    let (responder_tx, mut responder_rx) = mpsc::unbounded_channel::<Ipv4Addr>();
    let cancel_token = CancellationToken::new();
    let tracker = TaskTracker::new();

    for interface in interfaces {
        let interface = *interface;
        let responder_tx = responder_tx.clone();
        let cancel_token = cancel_token.clone();

        tracker.spawn(async move {
            if let Err(e) = search_from(interface, target, responder_tx, cancel_token).await {
                warn!("SSDP discovery from {} failed: {}", &interface, e);
            }
        });
    }

    tracker.close();
    drop(responder_tx);

    let mut found: HashSet<Ipv4Addr> = HashSet::new();
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            responder = responder_rx.recv() => match responder {
                Some(ip) => {
                    if found.insert(ip) {
                        info!("Viera TV discovered at {}", &ip);
                    }
                }
                // Every interface failed
                None => break,
            }
        }
    }

    cancel_token.cancel();
    tracker.wait().await;

    found
}

/// Search from a single `interface`, forwarding responder addresses until cancelled.
async fn search_from(
    interface: Ipv4Addr,
    target: SocketAddr,
    responder_tx: mpsc::UnboundedSender<Ipv4Addr>,
    cancel_token: CancellationToken,
) -> Outcome<()> {
    let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(interface), 0))
        .await
        .map_err(|e| VieraError::Connectivity(format!("Cannot bind to {interface}: {e}")))?;

    socket
        .send_to(M_SEARCH.as_bytes(), target)
        .await
        .map_err(|e| VieraError::Connectivity(format!("Cannot send M-SEARCH: {e}")))?;

    debug!("M-SEARCH sent from {}", &interface);

    let mut buf = [0u8; MAX_REPLY_SIZE];

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => return Ok(()),
            received = socket.recv_from(&mut buf) => match received {
                Ok((_, SocketAddr::V4(from))) => {
                    if responder_tx.send(*from.ip()).is_err() {
                        return Ok(());
                    }
                }
                Ok((_, from)) => debug!("Ignoring SSDP reply from {}", &from),
                Err(e) => {
                    return Err(VieraError::Connectivity(format!(
                        "Cannot receive SSDP reply: {e}"
                    )));
                }
            }
        }
    }
}

// ================================================================================================
// Tests
