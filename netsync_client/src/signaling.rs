//! Peer channel signaling.
//!
//! Direct fast channels between peers are negotiated over the reliable
//! server connection. Per remote peer:
//!
//! ```text
//! initiator: idle -> offer-sent -> answer-received -> established
//! responder: idle -> offer-received -> answer-sent  -> established
//! ```
//!
//! The coordinator owns the per-peer negotiation state and the
//! [`PeerTransport`] that creates the actual channel resources. Outbound
//! signaling messages are queued in an outbox the session flushes over the
//! reliable channel; negotiations that never complete are swept after a
//! timeout.

use std::collections::BTreeMap;

use netsync_shared::{
    clock::Millis,
    config::SignalingConfig,
    net::{ClientId, NetMsg, SignalMsg, SignalType},
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::transport::{Outlet, SendError};

/// Creates and drives direct peer channels.
///
/// Offer, answer and candidate payloads are opaque to the coordinator.
/// When a channel becomes usable the transport's owner reports it through
/// [`SignalingCoordinator::on_channel_open`].
pub trait PeerTransport {
    fn create_offer(&mut self, peer: &ClientId) -> anyhow::Result<Value>;
    fn accept_offer(&mut self, peer: &ClientId, offer: &Value) -> anyhow::Result<Value>;
    fn apply_answer(&mut self, peer: &ClientId, answer: &Value) -> anyhow::Result<()>;
    fn add_candidate(&mut self, peer: &ClientId, candidate: &Value) -> anyhow::Result<()>;
    fn send(&mut self, peer: &ClientId, payload: &[u8]) -> anyhow::Result<()>;
    fn close(&mut self, peer: &ClientId);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    OfferSent,
    OfferReceived,
    AnswerSent,
    AnswerReceived,
    Established,
}

impl PeerPhase {
    /// Whether the remote description has been applied.
    fn has_remote(self) -> bool {
        matches!(
            self,
            PeerPhase::AnswerSent | PeerPhase::AnswerReceived | PeerPhase::Established
        )
    }
}

/// One in-progress or established negotiation.
#[derive(Debug, Clone)]
pub struct PeerLink {
    pub initiator: ClientId,
    pub responder: ClientId,
    pub phase: PeerPhase,
    pub created_at: Millis,
    pending_candidates: Vec<Value>,
    /// The channel reported open before the remote description was applied.
    channel_open: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    PeerJoined(ClientId),
    PeerLeft(ClientId),
}

pub struct SignalingCoordinator {
    local: Option<ClientId>,
    cfg: SignalingConfig,
    transport: Box<dyn PeerTransport>,
    peers: BTreeMap<ClientId, PeerLink>,
    /// Candidates that arrived before any offer from that peer.
    early_candidates: BTreeMap<ClientId, Vec<Value>>,
    last_sweep: Option<Millis>,
    outbox: Vec<NetMsg>,
    events: Vec<SignalingEvent>,
}

impl SignalingCoordinator {
    pub fn new(cfg: SignalingConfig, transport: Box<dyn PeerTransport>) -> Self {
        Self {
            local: None,
            cfg,
            transport,
            peers: BTreeMap::new(),
            early_candidates: BTreeMap::new(),
            last_sweep: None,
            outbox: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn set_local(&mut self, id: ClientId) {
        self.local = Some(id);
    }

    pub fn local(&self) -> Option<&ClientId> {
        self.local.as_ref()
    }

    pub fn phase(&self, peer: &ClientId) -> Option<PeerPhase> {
        self.peers.get(peer).map(|l| l.phase)
    }

    pub fn link(&self, peer: &ClientId) -> Option<&PeerLink> {
        self.peers.get(peer)
    }

    pub fn established_peers(&self) -> impl Iterator<Item = &ClientId> {
        self.peers
            .iter()
            .filter(|(_, l)| l.phase == PeerPhase::Established)
            .map(|(id, _)| id)
    }

    pub fn pending_count(&self) -> usize {
        self.peers
            .values()
            .filter(|l| l.phase != PeerPhase::Established)
            .count()
    }

    pub fn take_outbox(&mut self) -> Vec<NetMsg> {
        std::mem::take(&mut self.outbox)
    }

    pub fn take_events(&mut self) -> Vec<SignalingEvent> {
        std::mem::take(&mut self.events)
    }

    /// Message asking the server for the current peer list.
    pub fn request_peers(&self) -> Option<NetMsg> {
        self.local.as_ref().map(|id| NetMsg::RequestWebrtcPeers {
            from_peer: id.clone(),
        })
    }

    /// Handles one relayed signaling message.
    pub fn handle(&mut self, now: Millis, msg: &SignalMsg) {
        let Some(local) = self.local.clone() else {
            warn!(signal = ?msg.signal_type, "Signaling before client id assigned");
            return;
        };
        if let Some(to) = &msg.to_peer {
            if *to != local {
                debug!(%to, "Signaling message for another peer");
                return;
            }
        }
        let from = &msg.from_peer;
        match msg.signal_type {
            SignalType::PeerList => self.on_peer_list(now, &local, &msg.signal_data),
            SignalType::Offer => self.on_offer(now, &local, from, &msg.signal_data),
            SignalType::Answer => self.on_answer(from, &msg.signal_data),
            SignalType::IceCandidate => self.on_remote_candidate(from, &msg.signal_data),
            SignalType::PeerLeft => {
                let peer = msg
                    .signal_data
                    .as_str()
                    .map(ClientId::new)
                    .unwrap_or_else(|| from.clone());
                self.teardown(&peer);
            }
        }
    }

    /// Relays a locally discovered connectivity candidate for `peer`.
    pub fn local_candidate(&mut self, peer: &ClientId, candidate: Value) {
        if !self.peers.contains_key(peer) {
            debug!(%peer, "Candidate for unknown negotiation dropped");
            return;
        }
        self.queue(peer, SignalType::IceCandidate, candidate);
    }

    /// The direct channel to `peer` became usable.
    pub fn on_channel_open(&mut self, peer: &ClientId) {
        let Some(link) = self.peers.get_mut(peer) else {
            return;
        };
        if link.phase.has_remote() {
            self.establish(peer);
        } else {
            debug!(%peer, "Channel open before answer");
            link.channel_open = true;
        }
    }

    /// The direct channel to `peer` went away.
    pub fn on_channel_closed(&mut self, peer: &ClientId) {
        self.teardown(peer);
    }

    /// Discards negotiations older than the timeout. Runs at most once per
    /// sweep interval; returns how many were discarded.
    pub fn sweep(&mut self, now: Millis) -> usize {
        if self
            .last_sweep
            .is_some_and(|at| now - at < self.cfg.sweep_interval_ms)
        {
            return 0;
        }
        self.last_sweep = Some(now);

        let timeout = self.cfg.negotiation_timeout_ms;
        let stale: Vec<ClientId> = self
            .peers
            .iter()
            .filter(|(_, l)| l.phase != PeerPhase::Established && now - l.created_at >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for peer in &stale {
            debug!(%peer, "Discarding stale negotiation");
            self.peers.remove(peer);
            self.transport.close(peer);
        }
        stale.len()
    }

    /// Tears down every negotiation and channel.
    pub fn reset(&mut self) {
        let peers: Vec<ClientId> = self.peers.keys().cloned().collect();
        for peer in &peers {
            self.teardown(peer);
        }
        self.early_candidates.clear();
        self.outbox.clear();
    }

    fn on_peer_list(&mut self, now: Millis, local: &ClientId, data: &Value) {
        let Some(list) = data.as_array() else {
            warn!("Peer list is not an array");
            return;
        };
        for peer in list.iter().filter_map(Value::as_str).map(ClientId::new) {
            if peer == *local || self.peers.contains_key(&peer) {
                continue;
            }
            self.initiate(now, local, peer);
        }
    }

    fn initiate(&mut self, now: Millis, local: &ClientId, peer: ClientId) {
        match self.transport.create_offer(&peer) {
            Ok(offer) => {
                info!(%peer, "Sending offer");
                self.peers.insert(
                    peer.clone(),
                    PeerLink {
                        initiator: local.clone(),
                        responder: peer.clone(),
                        phase: PeerPhase::OfferSent,
                        created_at: now,
                        pending_candidates: Vec::new(),
                        channel_open: false,
                    },
                );
                self.queue(&peer, SignalType::Offer, offer);
            }
            Err(e) => warn!(%peer, error = %e, "Failed to create offer"),
        }
    }

    fn on_offer(&mut self, now: Millis, local: &ClientId, from: &ClientId, offer: &Value) {
        if let Some(existing) = self.peers.get(from) {
            if existing.phase == PeerPhase::OfferSent && local < from {
                debug!(peer = %from, "Offer glare, keeping our offer");
                return;
            }
            debug!(peer = %from, phase = ?existing.phase, "Replacing negotiation with incoming offer");
            self.peers.remove(from);
            self.transport.close(from);
        }

        self.peers.insert(
            from.clone(),
            PeerLink {
                initiator: from.clone(),
                responder: local.clone(),
                phase: PeerPhase::OfferReceived,
                created_at: now,
                pending_candidates: Vec::new(),
                channel_open: false,
            },
        );

        match self.transport.accept_offer(from, offer) {
            Ok(answer) => {
                if let Some(link) = self.peers.get_mut(from) {
                    link.phase = PeerPhase::AnswerSent;
                }
                info!(peer = %from, "Sending answer");
                self.queue(from, SignalType::Answer, answer);
                let early = self.early_candidates.remove(from).unwrap_or_default();
                self.apply_candidates(from, early);
            }
            Err(e) => {
                warn!(peer = %from, error = %e, "Failed to accept offer");
                self.peers.remove(from);
                self.transport.close(from);
            }
        }
    }

    fn on_answer(&mut self, from: &ClientId, answer: &Value) {
        let Some(link) = self.peers.get_mut(from) else {
            debug!(peer = %from, "Answer without negotiation");
            return;
        };
        if link.phase != PeerPhase::OfferSent {
            debug!(peer = %from, phase = ?link.phase, "Unexpected answer");
            return;
        }
        if let Err(e) = self.transport.apply_answer(from, answer) {
            warn!(peer = %from, error = %e, "Failed to apply answer");
            self.teardown(from);
            return;
        }
        link.phase = PeerPhase::AnswerReceived;
        let pending = std::mem::take(&mut link.pending_candidates);
        let open = link.channel_open;
        debug!(peer = %from, "Answer applied");
        self.apply_candidates(from, pending);
        if open {
            self.establish(from);
        }
    }

    fn establish(&mut self, peer: &ClientId) {
        if let Some(link) = self.peers.get_mut(peer) {
            if link.phase != PeerPhase::Established {
                link.phase = PeerPhase::Established;
                info!(%peer, "Peer channel established");
                self.events.push(SignalingEvent::PeerJoined(peer.clone()));
            }
        }
    }

    fn on_remote_candidate(&mut self, from: &ClientId, candidate: &Value) {
        match self.peers.get_mut(from) {
            Some(link) if link.phase.has_remote() => {
                if let Err(e) = self.transport.add_candidate(from, candidate) {
                    debug!(peer = %from, error = %e, "Candidate rejected");
                }
            }
            Some(link) => link.pending_candidates.push(candidate.clone()),
            None => self
                .early_candidates
                .entry(from.clone())
                .or_default()
                .push(candidate.clone()),
        }
    }

    fn apply_candidates(&mut self, peer: &ClientId, candidates: Vec<Value>) {
        for candidate in &candidates {
            if let Err(e) = self.transport.add_candidate(peer, candidate) {
                debug!(%peer, error = %e, "Buffered candidate rejected");
            }
        }
    }

    fn teardown(&mut self, peer: &ClientId) {
        self.early_candidates.remove(peer);
        if let Some(link) = self.peers.remove(peer) {
            self.transport.close(peer);
            info!(%peer, phase = ?link.phase, "Peer torn down");
            self.events.push(SignalingEvent::PeerLeft(peer.clone()));
        }
    }

    fn queue(&mut self, peer: &ClientId, signal_type: SignalType, signal_data: Value) {
        let Some(local) = self.local.clone() else {
            return;
        };
        self.outbox.push(NetMsg::WebrtcSignaling(SignalMsg {
            from_peer: local,
            to_peer: Some(peer.clone()),
            signal_type,
            signal_data,
        }));
    }
}

/// Established peers form a broadcast fast outlet.
impl Outlet for SignalingCoordinator {
    fn is_healthy(&self) -> bool {
        self.established_peers().next().is_some()
    }

    fn send_payload(&mut self, payload: &[u8]) -> Result<(), SendError> {
        let peers: Vec<ClientId> = self.established_peers().cloned().collect();
        let mut delivered = 0usize;
        let mut last_err = None;
        for peer in &peers {
            match self.transport.send(peer, payload) {
                Ok(()) => delivered += 1,
                Err(e) => last_err = Some(e.to_string()),
            }
        }
        match (delivered, last_err) {
            (0, Some(e)) => Err(SendError::Link(e)),
            (0, None) => Err(SendError::NoRoute),
            _ => Ok(()),
        }
    }
}
