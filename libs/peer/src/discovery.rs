//! mDNS advertisement and discovery of other appliances on the local
//! network, via the `_rpi-cloner._tcp.local.` service type.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, UdpSocket};
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};

use crate::error::DiscoveryError;

pub const SERVICE_TYPE: &str = "_rpi-cloner._tcp.local.";
const BROWSE_WINDOW: Duration = Duration::from_secs(5);

/// A peer appliance found via mDNS.
#[derive(Debug, Clone)]
pub struct PeerDevice {
    pub hostname: String,
    pub ipv4: Ipv4Addr,
    pub port: u16,
    pub device_id: String,
    pub txt: BTreeMap<String, String>,
}

pub struct Discovery {
    daemon: ServiceDaemon,
    port: u16,
    published_fullname: Option<String>,
}

impl Discovery {
    pub fn new(port: u16) -> Result<Self, DiscoveryError> {
        let daemon =
            ServiceDaemon::new().map_err(|e| DiscoveryError::DaemonStart(e.to_string()))?;
        Ok(Self { daemon, port, published_fullname: None })
    }

    /// Advertises this host as a peer. `device_id` should be stable across
    /// restarts (persisted in the CLI's config) so peers recognize this
    /// device consistently.
    pub fn publish(&mut self, device_id: &str, hostname: &str) -> Result<(), DiscoveryError> {
        let ip = local_ipv4()?;
        let mut properties: std::collections::HashMap<String, String> = std::collections::HashMap::new();
        properties.insert("device_id".to_string(), device_id.to_string());
        properties.insert("version".to_string(), env!("CARGO_PKG_VERSION").to_string());
        properties.insert("hostname".to_string(), hostname.to_string());

        let instance_name = device_id;
        let host_fqdn = format!("{hostname}.local.");
        let info = ServiceInfo::new(
            SERVICE_TYPE,
            instance_name,
            &host_fqdn,
            ip,
            self.port,
            properties,
        )
        .map_err(|e| DiscoveryError::Registration(e.to_string()))?;

        let fullname = info.get_fullname().to_string();
        self.daemon
            .register(info)
            .map_err(|e| DiscoveryError::Registration(e.to_string()))?;
        self.published_fullname = Some(fullname);
        Ok(())
    }

    pub fn unpublish(&self) -> Result<(), DiscoveryError> {
        if let Some(fullname) = &self.published_fullname {
            self.daemon
                .unregister(fullname)
                .map_err(|e| DiscoveryError::Registration(e.to_string()))?;
        }
        Ok(())
    }

    /// Browses for peers for `window` (default 5s when `Duration::ZERO` is
    /// passed), calling `on_update` each time the known peer set changes,
    /// then stops browsing and returns the final set. Peers advertising
    /// `self_device_id` are filtered out.
    pub fn browse(
        &self,
        window: Duration,
        self_device_id: &str,
        mut on_update: impl FnMut(&[PeerDevice]),
    ) -> Vec<PeerDevice> {
        let window = if window.is_zero() { BROWSE_WINDOW } else { window };
        let Ok(receiver) = self.daemon.browse(SERVICE_TYPE) else {
            return Vec::new();
        };

        let mut peers: Vec<PeerDevice> = Vec::new();
        let deadline = std::time::Instant::now() + window;
        while let Some(remaining) = deadline.checked_duration_since(std::time::Instant::now()) {
            let Ok(event) = receiver.recv_timeout(remaining.min(Duration::from_millis(200)))
            else {
                continue;
            };
            if let ServiceEvent::ServiceResolved(info) = event {
                let txt: BTreeMap<String, String> = info
                    .get_properties()
                    .iter()
                    .map(|p| (p.key().to_string(), p.val_str().to_string()))
                    .collect();
                let Some(device_id) = txt.get("device_id").cloned() else {
                    continue;
                };
                if device_id == self_device_id {
                    continue;
                }
                let Some(ipv4) = info.get_addresses().iter().find_map(|addr| match addr {
                    std::net::IpAddr::V4(v4) => Some(*v4),
                    std::net::IpAddr::V6(_) => None,
                }) else {
                    continue;
                };
                let peer = PeerDevice {
                    hostname: info.get_hostname().trim_end_matches('.').to_string(),
                    ipv4,
                    port: info.get_port(),
                    device_id,
                    txt,
                };
                if let Some(existing) = peers.iter_mut().find(|p| p.device_id == peer.device_id) {
                    *existing = peer;
                } else {
                    peers.push(peer);
                }
                on_update(&peers);
            }
        }
        let _ = self.daemon.stop_browse(SERVICE_TYPE);
        peers
    }
}

/// Discovers this host's local IPv4 address by connecting a UDP socket to
/// a well-known public address (no packets are actually sent) and reading
/// back the socket's local endpoint.
fn local_ipv4() -> Result<Ipv4Addr, DiscoveryError> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .map_err(|e| DiscoveryError::NoLocalAddress(e.to_string()))?;
    socket
        .connect("8.8.8.8:80")
        .map_err(|e| DiscoveryError::NoLocalAddress(e.to_string()))?;
    match socket
        .local_addr()
        .map_err(|e| DiscoveryError::NoLocalAddress(e.to_string()))?
        .ip()
    {
        std::net::IpAddr::V4(v4) if !v4.is_loopback() => Ok(v4),
        other => Err(DiscoveryError::NoLocalAddress(format!(
            "resolved local address {other} is unusable"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_ipv4_resolves_to_a_non_loopback_address() {
        // Requires outbound UDP routing, which is available in this test
        // environment even though no packet is actually sent.
        let ip = local_ipv4();
        if let Ok(ip) = ip {
            assert!(!ip.is_loopback());
        }
    }
}
