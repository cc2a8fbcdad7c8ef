//! UDP responder that lets devices on the LAN find the collector.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;

pub const DISCOVERY_REQUEST: &str = "DISCOVER_SERVER";
const MAX_DATAGRAM: usize = 1024;
const RECV_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Reply for a discovery datagram, or `None` for anything else.
pub fn discovery_reply(payload: &[u8], ip: IpAddr) -> Option<String> {
    let text = std::str::from_utf8(payload).ok()?;
    (text.trim_end_matches(['\r', '\n']) == DISCOVERY_REQUEST).then(|| format!("SERVER_IP:{ip}"))
}

/// Address of the interface that routes outbound traffic. Connecting a UDP
/// socket sends nothing; it only selects the source address.
pub fn detect_local_ip() -> IpAddr {
    let probe = || -> io::Result<IpAddr> {
        let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
        Ok(socket.local_addr()?.ip())
    };
    match probe() {
        Ok(ip) => ip,
        Err(err) => {
            tracing::warn!(error = %err, "could not detect local address, advertising loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

pub async fn bind(port: u16) -> io::Result<UdpSocket> {
    UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await
}

/// Answers discovery requests on `socket` until `shutdown` fires. Socket
/// errors are logged and the responder keeps going.
pub async fn run(socket: UdpSocket, advertise: IpAddr, mut shutdown: watch::Receiver<bool>) {
    tracing::info!(addr = ?socket.local_addr().ok(), advertise = %advertise, "discovery responder ready");
    let mut buf = [0u8; MAX_DATAGRAM];
    loop {
        let (len, peer) = tokio::select! {
            res = socket.recv_from(&mut buf) => match res {
                Ok(received) => received,
                Err(err) => {
                    tracing::warn!(error = %err, "discovery receive failed");
                    tokio::time::sleep(RECV_RETRY_DELAY).await;
                    continue;
                }
            },
            _ = shutdown.changed() => break,
        };
        match discovery_reply(&buf[..len], advertise) {
            Some(reply) => {
                if let Err(err) = socket.send_to(reply.as_bytes(), peer).await {
                    tracing::warn!(peer = %peer, error = %err, "discovery reply failed");
                } else {
                    tracing::info!(peer = %peer, "answered discovery request");
                }
            }
            None => tracing::debug!(peer = %peer, len, "ignoring unexpected datagram"),
        }
    }
}
