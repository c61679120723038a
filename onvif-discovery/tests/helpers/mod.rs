//! Test helpers: a loopback WS-Discovery responder and ProbeMatches builders

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

/// A device answering probes on loopback
#[derive(Debug, Clone)]
pub struct FakeDevice {
    pub urn: String,
    pub xaddr: String,
    pub types: String,
}

impl FakeDevice {
    pub fn camera(urn: &str, ip: &str) -> Self {
        Self {
            urn: urn.to_string(),
            xaddr: format!("http://{}/onvif/device_service", ip),
            types: "dn:NetworkVideoTransmitter tds:Device".to_string(),
        }
    }
}

/// ProbeMatches envelope for `device`, optionally relating to a probe
pub fn probe_matches(relates_to: Option<&str>, device: &FakeDevice) -> String {
    let header = relates_to
        .map(|id| format!("<s:Header><a:RelatesTo>{}</a:RelatesTo></s:Header>", id))
        .unwrap_or_default();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:a="http://schemas.xmlsoap.org/ws/2004/08/addressing" xmlns:d="http://schemas.xmlsoap.org/ws/2005/04/discovery">{header}<s:Body><d:ProbeMatches><d:ProbeMatch><a:EndpointReference><a:Address>{urn}</a:Address></a:EndpointReference><d:Types>{types}</d:Types><d:Scopes>onvif://www.onvif.org/Profile/Streaming onvif://www.onvif.org/name/Test%20Camera</d:Scopes><d:XAddrs>{xaddr}</d:XAddrs><d:MetadataVersion>1</d:MetadataVersion></d:ProbeMatch></d:ProbeMatches></s:Body></s:Envelope>"#,
        urn = device.urn,
        types = device.types,
        xaddr = device.xaddr,
    )
}

/// MessageID of a received Probe
pub fn message_id(probe: &str) -> Option<String> {
    let start = probe.find("<a:MessageID>")? + "<a:MessageID>".len();
    let end = probe[start..].find("</a:MessageID>")? + start;
    Some(probe[start..end].to_string())
}

/// Loopback stand-in for the multicast group.
///
/// Every probe is answered by each device, `repeats` times.
pub struct Responder {
    pub addr: SocketAddr,
    task: JoinHandle<()>,
}

impl Responder {
    pub async fn start(devices: Vec<FakeDevice>, repeats: usize) -> Self {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            loop {
                let Ok((size, from)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let probe = String::from_utf8_lossy(&buf[..size]).to_string();
                let id = message_id(&probe);
                for device in &devices {
                    let reply = probe_matches(id.as_deref(), device);
                    for _ in 0..repeats {
                        let _ = socket.send_to(reply.as_bytes(), from).await;
                    }
                }
            }
        });
        Self { addr, task }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A loopback port with nothing listening
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
