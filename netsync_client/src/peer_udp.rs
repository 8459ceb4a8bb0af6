//! Direct peer channels over UDP.
//!
//! Each peer gets its own socket. Offers, answers and candidates carry the
//! socket address as `{"addr": "ip:port"}`. Once a side knows the remote
//! address it sends an empty probe datagram; the first probe received on a
//! socket marks the channel open and is answered with a probe of its own.
//! Non-empty datagrams are forwarded to the session as peer messages.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use netsync_shared::net::{ClientId, MAX_DATAGRAM_LEN};
use serde_json::{json, Value};
use tokio::{net::UdpSocket, sync::mpsc, task::JoinHandle};
use tracing::{debug, info};

use crate::session::LinkEvent;
use crate::signaling::PeerTransport;

struct PeerSocket {
    socket: Arc<UdpSocket>,
    remote: Option<SocketAddr>,
    reader: JoinHandle<()>,
}

impl Drop for PeerSocket {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

pub struct UdpPeerTransport {
    bind_ip: IpAddr,
    events: mpsc::UnboundedSender<LinkEvent>,
    peers: BTreeMap<ClientId, PeerSocket>,
}

impl UdpPeerTransport {
    /// Must be created and used inside a tokio runtime.
    pub fn new(bind_ip: IpAddr, events: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self {
            bind_ip,
            events,
            peers: BTreeMap::new(),
        }
    }

    fn bind(&mut self, peer: &ClientId) -> anyhow::Result<SocketAddr> {
        let std_socket = std::net::UdpSocket::bind(SocketAddr::new(self.bind_ip, 0))
            .context("peer udp bind")?;
        std_socket
            .set_nonblocking(true)
            .context("peer udp nonblocking")?;
        let socket = Arc::new(UdpSocket::from_std(std_socket).context("peer udp register")?);
        let local = socket.local_addr().context("peer udp local_addr")?;
        let reader = tokio::spawn(read_loop(
            peer.clone(),
            Arc::clone(&socket),
            self.events.clone(),
        ));
        self.peers.insert(
            peer.clone(),
            PeerSocket {
                socket,
                remote: None,
                reader,
            },
        );
        debug!(%peer, %local, "Peer socket bound");
        Ok(local)
    }

    fn set_remote(&mut self, peer: &ClientId, data: &Value) -> anyhow::Result<()> {
        let remote = parse_addr(data)?;
        let entry = self
            .peers
            .get_mut(peer)
            .with_context(|| format!("no socket for peer {peer}"))?;
        if entry.remote.is_none() {
            entry.remote = Some(remote);
            // Empty datagram: probe.
            entry
                .socket
                .try_send_to(&[], remote)
                .context("peer udp probe")?;
        }
        Ok(())
    }
}

fn parse_addr(data: &Value) -> anyhow::Result<SocketAddr> {
    data.get("addr")
        .and_then(Value::as_str)
        .context("signal data has no addr")?
        .parse()
        .context("parse peer addr")
}

async fn read_loop(
    peer: ClientId,
    socket: Arc<UdpSocket>,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let mut opened = false;
    let mut buf = BytesMut::zeroed(MAX_DATAGRAM_LEN);
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                debug!(%peer, error = %e, "Peer socket read failed");
                let _ = events.send(LinkEvent::PeerClosed { peer });
                return;
            }
        };
        let event = if n == 0 {
            if opened {
                continue;
            }
            opened = true;
            let _ = socket.send_to(&[], from).await;
            info!(%peer, %from, "Peer channel open");
            LinkEvent::PeerOpened { peer: peer.clone() }
        } else {
            LinkEvent::PeerMessage {
                peer: peer.clone(),
                payload: Bytes::copy_from_slice(&buf[..n]),
            }
        };
        if events.send(event).is_err() {
            return;
        }
    }
}

impl PeerTransport for UdpPeerTransport {
    fn create_offer(&mut self, peer: &ClientId) -> anyhow::Result<Value> {
        let local = self.bind(peer)?;
        Ok(json!({ "addr": local.to_string() }))
    }

    fn accept_offer(&mut self, peer: &ClientId, offer: &Value) -> anyhow::Result<Value> {
        let local = self.bind(peer)?;
        self.set_remote(peer, offer)?;
        Ok(json!({ "addr": local.to_string() }))
    }

    fn apply_answer(&mut self, peer: &ClientId, answer: &Value) -> anyhow::Result<()> {
        self.set_remote(peer, answer)
    }

    fn add_candidate(&mut self, peer: &ClientId, candidate: &Value) -> anyhow::Result<()> {
        self.set_remote(peer, candidate)
    }

    fn send(&mut self, peer: &ClientId, payload: &[u8]) -> anyhow::Result<()> {
        let entry = self
            .peers
            .get(peer)
            .with_context(|| format!("no socket for peer {peer}"))?;
        let remote = entry.remote.context("peer address unknown")?;
        entry
            .socket
            .try_send_to(payload, remote)
            .context("peer udp send")?;
        Ok(())
    }

    fn close(&mut self, peer: &ClientId) {
        if self.peers.remove(peer).is_some() {
            debug!(%peer, "Peer socket closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use super::*;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<LinkEvent>) -> LinkEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn probe_exchange_opens_both_sides() {
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let mut a = UdpPeerTransport::new(ip, a_tx);
        let mut b = UdpPeerTransport::new(ip, b_tx);
        let (id_a, id_b) = (ClientId::new("a"), ClientId::new("b"));

        let offer = a.create_offer(&id_b).unwrap();
        let answer = b.accept_offer(&id_a, &offer).unwrap();
        a.apply_answer(&id_b, &answer).unwrap();

        assert!(matches!(next_event(&mut a_rx).await, LinkEvent::PeerOpened { peer } if peer == id_b));
        assert!(matches!(next_event(&mut b_rx).await, LinkEvent::PeerOpened { peer } if peer == id_a));

        a.send(&id_b, b"hello").unwrap();
        match next_event(&mut b_rx).await {
            LinkEvent::PeerMessage { peer, payload } => {
                assert_eq!(peer, id_a);
                assert_eq!(&payload[..], b"hello");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn addr_is_required() {
        assert!(parse_addr(&json!({})).is_err());
        assert!(parse_addr(&json!({"addr": "nope"})).is_err());
        assert_eq!(
            parse_addr(&json!({"addr": "127.0.0.1:9"})).unwrap(),
            "127.0.0.1:9".parse().unwrap()
        );
    }
}
