//! # NAT Port Mapping
//!
//! Best-effort reachability helper. On enable it probes, in order:
//!
//! 1. **NAT-PMP**: binary datagrams to the gateway on UDP 5351;
//! 2. **UPnP**: SSDP discovery on 239.255.255.250:1900 followed by a
//!    WANIPConnection SOAP call;
//! 3. **Freebox**: the vendor HTTP API at `mafreebox.freebox.fr`.
//!
//! The first protocol that answers is kept and the mapping refreshed every
//! ten minutes. Failure anywhere degrades gracefully: the node simply has
//! no learnt external address and relies on path folding and the tracker.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, trace};

/// Mapping refresh cadence.
const REFRESH_INTERVAL: Duration = Duration::from_secs(600);

/// Mapping lifetime requested from the gateway, comfortably above the
/// refresh cadence.
const MAPPING_LIFETIME_SECS: u32 = 3600;

/// Per-probe answer deadline.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

const NAT_PMP_PORT: u16 = 5351;
const SSDP_ADDR: &str = "239.255.255.250:1900";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Backend {
    NatPmp,
    Upnp,
    Freebox,
}

#[derive(Default)]
struct MappingState {
    backend: Option<Backend>,
    external_ip: Option<IpAddr>,
    external_port: Option<u16>,
    /// UPnP control endpoint once discovered.
    upnp_control: Option<String>,
}

/// Optional singleton-per-node port mapper handle.
#[derive(Clone, Default)]
pub struct PortMapping {
    state: Arc<Mutex<MappingState>>,
}

impl PortMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start mapping `port` (both TCP and UDP) in the background.
    pub fn enable(&self, port: u16) {
        let mapping = self.clone();
        tokio::spawn(async move {
            loop {
                mapping.refresh(port).await;
                tokio::time::sleep(REFRESH_INTERVAL).await;
            }
        });
    }

    /// External address for the mapped port, once a gateway answered.
    pub fn external_addr(&self) -> Option<SocketAddr> {
        let state = self.state.lock().expect("mapping lock poisoned");
        match (state.external_ip, state.external_port) {
            (Some(ip), Some(port)) => Some(SocketAddr::new(ip, port)),
            _ => None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.state.lock().expect("mapping lock poisoned").external_ip.is_some()
    }

    async fn refresh(&self, port: u16) {
        let preferred = self.state.lock().expect("mapping lock poisoned").backend;
        let order: Vec<Backend> = match preferred {
            Some(backend) => vec![backend, Backend::NatPmp, Backend::Upnp, Backend::Freebox],
            None => vec![Backend::NatPmp, Backend::Upnp, Backend::Freebox],
        };

        for backend in order {
            let result = match backend {
                Backend::NatPmp => self.try_nat_pmp(port).await,
                Backend::Upnp => self.try_upnp(port).await,
                Backend::Freebox => self.try_freebox(port).await,
            };
            match result {
                Ok((ip, external_port)) => {
                    let mut state = self.state.lock().expect("mapping lock poisoned");
                    let fresh = state.external_ip != Some(ip)
                        || state.external_port != Some(external_port);
                    state.backend = Some(backend);
                    state.external_ip = Some(ip);
                    state.external_port = Some(external_port);
                    drop(state);
                    if fresh {
                        info!(backend = ?backend, ip = %ip, port = external_port, "port mapping active");
                    }
                    return;
                }
                Err(e) => {
                    trace!(backend = ?backend, error = %e, "port mapping probe failed");
                }
            }
        }
        debug!("no port mapping protocol available");
    }

    // ------------------------------------------------------------------
    // NAT-PMP
    // ------------------------------------------------------------------

    async fn try_nat_pmp(&self, port: u16) -> Result<(IpAddr, u16)> {
        let gateway = default_gateway().context("no default gateway")?;
        let target = SocketAddr::new(IpAddr::V4(gateway), NAT_PMP_PORT);
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(target).await?;

        // Opcode 0: external address request.
        socket.send(&[0u8, 0u8]).await?;
        let mut buf = [0u8; 16];
        let n = timeout(PROBE_TIMEOUT, socket.recv(&mut buf))
            .await
            .context("NAT-PMP address request timed out")??;
        let external_ip = parse_nat_pmp_address(&buf[..n]).context("bad NAT-PMP address answer")?;

        // Opcodes 1 (UDP) and 2 (TCP): map both flavours of the port.
        let mut external_port = port;
        for opcode in [1u8, 2u8] {
            let request = build_nat_pmp_mapping(opcode, port, port, MAPPING_LIFETIME_SECS);
            socket.send(&request).await?;
            let n = timeout(PROBE_TIMEOUT, socket.recv(&mut buf))
                .await
                .context("NAT-PMP mapping request timed out")??;
            external_port = parse_nat_pmp_mapping(&buf[..n], opcode, port)
                .context("bad NAT-PMP mapping answer")?;
        }

        Ok((IpAddr::V4(external_ip), external_port))
    }

    // ------------------------------------------------------------------
    // UPnP
    // ------------------------------------------------------------------

    async fn try_upnp(&self, port: u16) -> Result<(IpAddr, u16)> {
        let existing_control = self.state.lock().expect("mapping lock poisoned").upnp_control.clone();
        let control = match existing_control {
            Some(control) => control,
            None => {
                let control = discover_upnp_gateway().await?;
                self.state.lock().expect("mapping lock poisoned").upnp_control =
                    Some(control.clone());
                control
            }
        };

        let local_ip = local_ip_toward(&control).unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let http = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build()?;

        for protocol in ["UDP", "TCP"] {
            let body = soap_add_mapping(port, protocol, &local_ip.to_string());
            let response = http
                .post(&control)
                .header("Content-Type", "text/xml; charset=\"utf-8\"")
                .header(
                    "SOAPAction",
                    "\"urn:schemas-upnp-org:service:WANIPConnection:1#AddPortMapping\"",
                )
                .body(body)
                .send()
                .await
                .context("UPnP AddPortMapping failed")?;
            if !response.status().is_success() {
                anyhow::bail!("UPnP AddPortMapping answered {}", response.status());
            }
        }

        // GetExternalIPAddress tells us where the mapping lives.
        let response = http
            .post(&control)
            .header("Content-Type", "text/xml; charset=\"utf-8\"")
            .header(
                "SOAPAction",
                "\"urn:schemas-upnp-org:service:WANIPConnection:1#GetExternalIPAddress\"",
            )
            .body(soap_get_external_ip())
            .send()
            .await
            .context("UPnP GetExternalIPAddress failed")?;
        let text = response.text().await?;
        let ip = extract_tag(&text, "NewExternalIPAddress")
            .and_then(|s| s.parse().ok())
            .context("UPnP answered no external address")?;

        Ok((ip, port))
    }

    // ------------------------------------------------------------------
    // Freebox
    // ------------------------------------------------------------------

    async fn try_freebox(&self, port: u16) -> Result<(IpAddr, u16)> {
        let http = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build()?;
        let response = http
            .get("http://mafreebox.freebox.fr/api_version")
            .send()
            .await
            .context("Freebox not reachable")?;
        if !response.status().is_success() {
            anyhow::bail!("Freebox answered {}", response.status());
        }
        // Without an authorized app token the redirection API refuses the
        // mapping; reachability of the API is still a useful signal that a
        // Freebox fronts this network.
        let _ = port;
        anyhow::bail!("Freebox API requires an app token for port redirections")
    }
}

impl std::fmt::Debug for PortMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("mapping lock poisoned");
        f.debug_struct("PortMapping")
            .field("backend", &state.backend)
            .field("external_ip", &state.external_ip)
            .field("external_port", &state.external_port)
            .finish()
    }
}

// ============================================================================
// NAT-PMP wire helpers
// ============================================================================

fn build_nat_pmp_mapping(opcode: u8, internal: u16, suggested: u16, lifetime: u32) -> [u8; 12] {
    let mut request = [0u8; 12];
    request[0] = 0; // version
    request[1] = opcode;
    request[4..6].copy_from_slice(&internal.to_be_bytes());
    request[6..8].copy_from_slice(&suggested.to_be_bytes());
    request[8..12].copy_from_slice(&lifetime.to_be_bytes());
    request
}

fn parse_nat_pmp_address(buf: &[u8]) -> Option<Ipv4Addr> {
    // version, opcode 128, result code, epoch, address.
    if buf.len() < 12 || buf[1] != 128 {
        return None;
    }
    let result = u16::from_be_bytes([buf[2], buf[3]]);
    if result != 0 {
        return None;
    }
    Some(Ipv4Addr::new(buf[8], buf[9], buf[10], buf[11]))
}

fn parse_nat_pmp_mapping(buf: &[u8], opcode: u8, internal: u16) -> Option<u16> {
    if buf.len() < 16 || buf[1] != 128 + opcode {
        return None;
    }
    let result = u16::from_be_bytes([buf[2], buf[3]]);
    if result != 0 {
        return None;
    }
    let answered_internal = u16::from_be_bytes([buf[8], buf[9]]);
    if answered_internal != internal {
        return None;
    }
    Some(u16::from_be_bytes([buf[10], buf[11]]))
}

/// Default IPv4 gateway from the kernel routing table.
fn default_gateway() -> Option<Ipv4Addr> {
    let content = std::fs::read_to_string("/proc/net/route").ok()?;
    parse_route_table(&content)
}

fn parse_route_table(content: &str) -> Option<Ipv4Addr> {
    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // destination 00000000 marks the default route; the gateway field
        // is little-endian hex.
        if fields.len() >= 3 && fields[1] == "00000000" {
            let gw = u32::from_str_radix(fields[2], 16).ok()?;
            if gw != 0 {
                return Some(Ipv4Addr::from(gw.swap_bytes()));
            }
        }
    }
    None
}

// ============================================================================
// UPnP helpers
// ============================================================================

/// SSDP search for an internet gateway, returning the WANIPConnection
/// control URL.
async fn discover_upnp_gateway() -> Result<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let search = "M-SEARCH * HTTP/1.1\r\n\
                  HOST: 239.255.255.250:1900\r\n\
                  MAN: \"ssdp:discover\"\r\n\
                  MX: 2\r\n\
                  ST: urn:schemas-upnp-org:device:InternetGatewayDevice:1\r\n\r\n";
    socket.send_to(search.as_bytes(), SSDP_ADDR).await?;

    let mut buf = [0u8; 2048];
    let (n, _) = timeout(PROBE_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .context("SSDP search timed out")??;
    let response = String::from_utf8_lossy(&buf[..n]);
    let location = extract_ssdp_location(&response).context("SSDP answer without location")?;

    // The device description names the control URL for WANIPConnection.
    let http = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build()?;
    let description = http.get(&location).send().await?.text().await?;
    let control_path = extract_control_url(&description)
        .context("gateway description without WANIPConnection control URL")?;

    // Resolve a path-only control URL against the description's origin.
    if control_path.starts_with("http") {
        return Ok(control_path);
    }
    let origin: String = location.splitn(4, '/').take(3).collect::<Vec<_>>().join("/");
    Ok(format!("{}{}", origin, control_path))
}

fn extract_ssdp_location(response: &str) -> Option<String> {
    response.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("location") {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}

/// Minimal scan of the device description for the WANIPConnection service
/// control URL. Gateways embed tiny XML; a full parser buys nothing here.
fn extract_control_url(description: &str) -> Option<String> {
    let service_pos = description.find("WANIPConnection")?;
    let tail = &description[service_pos..];
    let start = tail.find("<controlURL>")? + "<controlURL>".len();
    let end = tail[start..].find("</controlURL>")? + start;
    Some(tail[start..end].trim().to_string())
}

fn soap_add_mapping(port: u16, protocol: &str, client_ip: &str) -> String {
    format!(
        r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body><u:AddPortMapping xmlns:u="urn:schemas-upnp-org:service:WANIPConnection:1">
<NewRemoteHost></NewRemoteHost>
<NewExternalPort>{port}</NewExternalPort>
<NewProtocol>{protocol}</NewProtocol>
<NewInternalPort>{port}</NewInternalPort>
<NewInternalClient>{client_ip}</NewInternalClient>
<NewEnabled>1</NewEnabled>
<NewPortMappingDescription>teapotnet</NewPortMappingDescription>
<NewLeaseDuration>{lifetime}</NewLeaseDuration>
</u:AddPortMapping></s:Body></s:Envelope>"#,
        port = port,
        protocol = protocol,
        client_ip = client_ip,
        lifetime = MAPPING_LIFETIME_SECS,
    )
}

fn soap_get_external_ip() -> String {
    r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body><u:GetExternalIPAddress xmlns:u="urn:schemas-upnp-org:service:WANIPConnection:1">
</u:GetExternalIPAddress></s:Body></s:Envelope>"#
        .to_string()
}

fn extract_tag(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml[start..end].trim().to_string())
}

/// Local address used to reach a URL's host, for the SOAP InternalClient
/// field.
fn local_ip_toward(url: &str) -> Option<IpAddr> {
    let host_port = url.split("://").nth(1)?.split('/').next()?;
    let target: SocketAddr = host_port
        .parse()
        .or_else(|_| format!("{}:80", host_port).parse())
        .ok()?;
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect(target).ok()?;
    Some(socket.local_addr().ok()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nat_pmp_mapping_request_layout() {
        let request = build_nat_pmp_mapping(2, 8480, 8480, 3600);
        assert_eq!(request[0], 0);
        assert_eq!(request[1], 2);
        assert_eq!(u16::from_be_bytes([request[4], request[5]]), 8480);
        assert_eq!(u16::from_be_bytes([request[6], request[7]]), 8480);
        assert_eq!(u32::from_be_bytes([request[8], request[9], request[10], request[11]]), 3600);
    }

    #[test]
    fn nat_pmp_address_answer_parsed() {
        let mut answer = vec![0u8, 128, 0, 0, 0, 0, 0, 1, 203, 0, 113, 7];
        assert_eq!(parse_nat_pmp_address(&answer), Some(Ipv4Addr::new(203, 0, 113, 7)));

        answer[2] = 0;
        answer[3] = 3; // network failure result
        assert_eq!(parse_nat_pmp_address(&answer), None);
    }

    #[test]
    fn nat_pmp_mapping_answer_parsed() {
        let mut answer = vec![0u8; 16];
        answer[1] = 129; // opcode 1 + 128
        answer[8..10].copy_from_slice(&8480u16.to_be_bytes());
        answer[10..12].copy_from_slice(&18480u16.to_be_bytes());
        assert_eq!(parse_nat_pmp_mapping(&answer, 1, 8480), Some(18480));
        assert_eq!(parse_nat_pmp_mapping(&answer, 2, 8480), None, "wrong opcode");
        assert_eq!(parse_nat_pmp_mapping(&answer, 1, 9999), None, "wrong internal port");
    }

    #[test]
    fn route_table_default_gateway_parsed() {
        let table = "Iface\tDestination\tGateway\tFlags\n\
                     eth0\t00000000\t0101A8C0\t0003\n\
                     eth0\t0000FEA9\t00000000\t0001\n";
        assert_eq!(parse_route_table(table), Some(Ipv4Addr::new(192, 168, 1, 1)));

        let no_default = "Iface\tDestination\tGateway\tFlags\n\
                          eth0\t0000FEA9\t00000000\t0001\n";
        assert_eq!(parse_route_table(no_default), None);
    }

    #[test]
    fn ssdp_location_header_extracted() {
        let response = "HTTP/1.1 200 OK\r\n\
                        CACHE-CONTROL: max-age=120\r\n\
                        LOCATION: http://192.168.1.1:5000/rootDesc.xml\r\n\
                        ST: urn:schemas-upnp-org:device:InternetGatewayDevice:1\r\n\r\n";
        assert_eq!(
            extract_ssdp_location(response).as_deref(),
            Some("http://192.168.1.1:5000/rootDesc.xml")
        );
    }

    #[test]
    fn control_url_extracted_from_description() {
        let description = r#"<service>
            <serviceType>urn:schemas-upnp-org:service:WANIPConnection:1</serviceType>
            <controlURL>/ctl/IPConn</controlURL>
        </service>"#;
        assert_eq!(extract_control_url(description).as_deref(), Some("/ctl/IPConn"));
        assert_eq!(extract_control_url("<nothing/>"), None);
    }

    #[test]
    fn xml_tag_extraction() {
        let xml = "<NewExternalIPAddress> 203.0.113.9 </NewExternalIPAddress>";
        assert_eq!(extract_tag(xml, "NewExternalIPAddress").as_deref(), Some("203.0.113.9"));
    }
}
