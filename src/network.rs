use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use log::{debug, info, warn};
use macaddr::MacAddr6;
use tokio::net::TcpStream;
use wol::send_wol;

use crate::error::{Outcome, VieraError};
use crate::settings::{ClientSettings, DEFAULT_PORT};

// ------------------------------------------------------------------------------------------------
// Network helpers for reachability, local interfaces, and Wake-on-LAN.
// ------------------------------------------------------------------------------------------------

const WOL_PACKETS: usize = 3;
const WOL_INTERVAL: Duration = Duration::from_millis(100);

/// Whether a TV is accepting connections on its control port.
///
/// Uses the default port and timeout. See [`liveness_probe_with`].
pub async fn liveness_probe(ip: Ipv4Addr) -> bool {
    let settings = ClientSettings::default();

    liveness_probe_with(ip, DEFAULT_PORT, settings.liveness_timeout).await
}

/// Whether a TCP connection to `ip:port` can be opened within `timeout`.
///
/// The connection is closed immediately.
pub async fn liveness_probe_with(ip: Ipv4Addr, port: u16, timeout: Duration) -> bool {
    let addr = SocketAddr::new(IpAddr::V4(ip), port);

    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => {
            debug!("{} is reachable", &addr);
            true
        }
        Ok(Err(e)) => {
            debug!("{} is not reachable: {}", &addr, e);
            false
        }
        Err(_) => {
            debug!("{} did not answer within {:?}", &addr, timeout);
            false
        }
    }
}

/// All non-loopback IPv4 addresses of this host.
pub(crate) fn local_ipv4_addresses() -> Outcome<Vec<Ipv4Addr>> {
    let interfaces = local_ip_address::list_afinet_netifas().map_err(|e| {
        VieraError::Connectivity(format!("Could not list network interfaces: {e}"))
    })?;

    let mut addresses: Vec<Ipv4Addr> = interfaces
        .into_iter()
        .filter_map(|(_, ip)| match ip {
            IpAddr::V4(ipv4) if !ipv4.is_loopback() => Some(ipv4),
            _ => None,
        })
        .collect();

    addresses.sort();
    addresses.dedup();

    Ok(addresses)
}

/// The first non-loopback IPv4 address of this host.
pub(crate) fn first_local_ipv4_address() -> Outcome<Ipv4Addr> {
    local_ip_address::local_ip()
        .ok()
        .and_then(|ip| match ip {
            IpAddr::V4(ipv4) if !ipv4.is_loopback() => Some(ipv4),
            _ => None,
        })
        .or_else(|| local_ipv4_addresses().ok()?.into_iter().next())
        .ok_or_else(|| VieraError::Connectivity("No non-loopback IPv4 interface found".into()))
}

/// Wake a TV with Wake-on-LAN magic packets.
///
/// Packets are sent to the broadcast address and directly to `ip`, which helps TVs on wireless
/// connections.
pub async fn wake_on_lan(mac: MacAddr6, ip: Ipv4Addr) -> Outcome<()> {
    info!("Sending Wake-on-LAN to {}, {}", &ip, &mac);

    for _ in 0..WOL_PACKETS {
        for target in [None, Some(IpAddr::V4(ip))] {
            if let Err(e) = send_wol(wol_mac_addr(&mac)?, target, None) {
                let msg = format!("Cannot send Wake-on-LAN: {e}");
                warn!("{}", &msg);

                return Err(VieraError::Connectivity(msg));
            }
        }

        tokio::time::sleep(WOL_INTERVAL).await;
    }

    Ok(())
}

fn wol_mac_addr(mac: &MacAddr6) -> Outcome<wol::MacAddr> {
    wol::MacAddr::from_str(&mac.to_string())
        .map_err(|_| VieraError::Misuse(format!("Cannot use MAC address {mac} for Wake-on-LAN")))
}

// ================================================================================================
// Tests
