//! In-process peer connections for tests and demos.
//!
//! Descriptions carry the peer id (`memory-offer:<id>`), and each peer emits a
//! single synthetic candidate once its local description is set. Two peers
//! link once both have local and remote descriptions and have each applied
//! the other's candidate; at that point the offerer's channels are mirrored
//! to the answerer and opened on both sides.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use super::{
    DataChannel, DataChannelOptions, PeerConnection, PeerConnectionState, PeerConnector,
    PeerHandler, TransportError,
};
use crate::signaling::{IceCandidate, SessionDescription};

type Shared<T> = Arc<dyn Fn(T) + Send + Sync>;

#[derive(Default)]
struct NetworkState {
    next_id: u64,
    peers: HashMap<u64, Weak<MemoryPeer>>,
    close_hook: Option<Arc<dyn Fn() + Send + Sync>>,
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
    fail_negotiation: Arc<AtomicBool>,
    channels_created: Arc<AtomicUsize>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MemoryPeerConnector {
        MemoryPeerConnector {
            network: self.clone(),
        }
    }

    /// Makes every subsequent offer/answer generation fail.
    pub fn set_fail_negotiation(&self, fail: bool) {
        self.fail_negotiation.store(fail, Ordering::SeqCst);
    }

    pub fn channels_created(&self) -> usize {
        self.channels_created.load(Ordering::SeqCst)
    }

    pub fn open_peers(&self) -> usize {
        self.state
            .lock()
            .peers
            .values()
            .filter_map(Weak::upgrade)
            .filter(|peer| !peer.state.lock().closed)
            .count()
    }

    /// Runs `hook` whenever a peer starts closing.
    pub fn on_peer_close<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.state.lock().close_hook = Some(Arc::new(hook));
    }

    fn register(&self) -> Arc<MemoryPeer> {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        let peer = Arc::new(MemoryPeer {
            id,
            network: self.clone(),
            state: Mutex::new(PeerState::default()),
            on_candidate: Mutex::new(None),
            on_channel: Mutex::new(None),
            on_state: Mutex::new(None),
        });
        state.peers.insert(id, Arc::downgrade(&peer));
        peer
    }

    fn peer(&self, id: u64) -> Option<Arc<MemoryPeer>> {
        self.state.lock().peers.get(&id).and_then(Weak::upgrade)
    }
}

pub struct MemoryPeerConnector {
    network: MemoryNetwork,
}

#[async_trait]
impl PeerConnector for MemoryPeerConnector {
    async fn new_peer(&self) -> Result<Arc<dyn PeerConnection>, TransportError> {
        Ok(self.network.register())
    }
}

#[derive(Default)]
struct PeerState {
    local: Option<SessionDescription>,
    remote_peer: Option<u64>,
    remote_candidate: bool,
    is_offerer: bool,
    channels: Vec<Arc<MemoryDataChannel>>,
    linked: bool,
    closed: bool,
}

impl PeerState {
    fn ready(&self) -> bool {
        self.local.is_some() && self.remote_peer.is_some() && self.remote_candidate && !self.closed
    }
}

pub struct MemoryPeer {
    id: u64,
    network: MemoryNetwork,
    state: Mutex<PeerState>,
    on_candidate: Mutex<Option<Shared<IceCandidate>>>,
    on_channel: Mutex<Option<Shared<Arc<dyn DataChannel>>>>,
    on_state: Mutex<Option<Shared<PeerConnectionState>>>,
}

impl MemoryPeer {
    fn description(&self, kind: &str) -> SessionDescription {
        SessionDescription(json!({
            "type": kind,
            "sdp": format!("memory-{kind}:{}", self.id),
        }))
    }

    fn emit_state(&self, state: PeerConnectionState) {
        let handler = self.on_state.lock().clone();
        if let Some(handler) = handler {
            handler(state);
        }
    }

    fn try_link(&self) {
        let Some(remote_id) = ({
            let state = self.state.lock();
            if !state.ready() || state.linked {
                return;
            }
            state.remote_peer
        }) else {
            return;
        };
        let Some(remote) = self.network.peer(remote_id) else {
            return;
        };
        if !remote.state.lock().ready() {
            return;
        }
        let (offerer, answerer) = if self.state.lock().is_offerer {
            (self, remote.as_ref())
        } else {
            (remote.as_ref(), self)
        };
        link(offerer, answerer);
    }
}

fn link(offerer: &MemoryPeer, answerer: &MemoryPeer) {
    let channels = {
        let mut offer_state = offerer.state.lock();
        let mut answer_state = answerer.state.lock();
        if offer_state.linked || answer_state.linked {
            return;
        }
        offer_state.linked = true;
        answer_state.linked = true;
        offer_state.channels.clone()
    };
    tracing::debug!(
        target = "transport::memory",
        offerer = offerer.id,
        answerer = answerer.id,
        channels = channels.len(),
        "memory peers linked"
    );
    offerer.emit_state(PeerConnectionState::Connected);
    answerer.emit_state(PeerConnectionState::Connected);
    for channel in channels {
        mirror(&channel, answerer);
    }
}

fn mirror(local: &Arc<MemoryDataChannel>, answerer: &MemoryPeer) {
    let remote = MemoryDataChannel::new(local.label.clone());
    local.state.lock().partner = Arc::downgrade(&remote);
    remote.state.lock().partner = Arc::downgrade(local);
    answerer.state.lock().channels.push(Arc::clone(&remote));
    let handler = answerer.on_channel.lock().clone();
    if let Some(handler) = handler {
        handler(Arc::clone(&remote) as Arc<dyn DataChannel>);
    }
    local.open();
    remote.open();
}

fn parse_peer_id(value: Option<&str>, prefix: &str) -> Result<u64, TransportError> {
    value
        .and_then(|raw| raw.strip_prefix(prefix))
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| {
            TransportError::Negotiation(format!(
                "unrecognized memory description {}",
                value.unwrap_or("<missing>")
            ))
        })
}

#[async_trait]
impl PeerConnection for MemoryPeer {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        if self.network.fail_negotiation.load(Ordering::SeqCst) {
            return Err(TransportError::Negotiation("offer generation failed".into()));
        }
        Ok(self.description("offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        if self.network.fail_negotiation.load(Ordering::SeqCst) {
            return Err(TransportError::Negotiation("answer generation failed".into()));
        }
        if self.state.lock().remote_peer.is_none() {
            return Err(TransportError::Negotiation(
                "cannot answer without a remote offer".into(),
            ));
        }
        Ok(self.description("answer"))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock();
            state.is_offerer = description.kind() == Some("offer");
            state.local = Some(description);
        }
        let handler = self.on_candidate.lock().clone();
        if let Some(handler) = handler {
            handler(IceCandidate(json!({
                "candidate": format!("candidate:memory-{}", self.id),
                "sdpMid": "0",
                "sdpMLineIndex": 0,
            })));
        }
        self.try_link();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let prefix = match description.kind() {
            Some("offer") => "memory-offer:",
            Some("answer") => "memory-answer:",
            other => {
                return Err(TransportError::Negotiation(format!(
                    "unsupported description type {}",
                    other.unwrap_or("<missing>")
                )));
            }
        };
        let remote = parse_peer_id(description.sdp(), prefix)?;
        self.state.lock().remote_peer = Some(remote);
        self.try_link();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let expected = self.state.lock().remote_peer.ok_or_else(|| {
            TransportError::Negotiation("candidate before remote description".into())
        })?;
        let id = parse_peer_id(candidate.candidate(), "candidate:memory-")?;
        if id != expected {
            return Err(TransportError::Negotiation(format!(
                "candidate from unexpected peer {id}"
            )));
        }
        self.state.lock().remote_candidate = true;
        self.try_link();
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        _options: &DataChannelOptions,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        let channel = MemoryDataChannel::new(label.to_string());
        let linked_to = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(TransportError::ChannelClosed);
            }
            state.channels.push(Arc::clone(&channel));
            state.linked.then_some(state.remote_peer).flatten()
        };
        self.network.channels_created.fetch_add(1, Ordering::SeqCst);
        if let Some(remote) = linked_to.and_then(|id| self.network.peer(id)) {
            mirror(&channel, &remote);
        }
        Ok(channel)
    }

    fn on_ice_candidate(&self, handler: PeerHandler<IceCandidate>) {
        *self.on_candidate.lock() = Some(Arc::from(handler));
    }

    fn on_data_channel(&self, handler: PeerHandler<Arc<dyn DataChannel>>) {
        *self.on_channel.lock() = Some(Arc::from(handler));
    }

    fn on_connection_state_change(&self, handler: PeerHandler<PeerConnectionState>) {
        *self.on_state.lock() = Some(Arc::from(handler));
    }

    async fn close(&self) -> Result<(), TransportError> {
        let hook = self.network.state.lock().close_hook.clone();
        if let Some(hook) = hook {
            hook();
        }
        let channels = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            std::mem::take(&mut state.channels)
        };
        for channel in channels {
            channel.shutdown();
        }
        self.emit_state(PeerConnectionState::Closed);
        Ok(())
    }
}

#[derive(Default)]
struct ChannelState {
    open: bool,
    closed: bool,
    partner: Weak<MemoryDataChannel>,
    inbox: VecDeque<String>,
    on_open: Option<Shared<()>>,
    on_message: Option<Shared<String>>,
    on_close: Option<Shared<()>>,
}

/// One end of a mirrored in-memory data channel. Frames that arrive before a
/// message handler is registered are held and replayed in order.
pub struct MemoryDataChannel {
    label: String,
    state: Mutex<ChannelState>,
}

impl MemoryDataChannel {
    fn new(label: String) -> Arc<Self> {
        Arc::new(Self {
            label,
            state: Mutex::new(ChannelState::default()),
        })
    }

    fn open(&self) {
        let handler = {
            let mut state = self.state.lock();
            if state.open || state.closed {
                return;
            }
            state.open = true;
            state.on_open.clone()
        };
        if let Some(handler) = handler {
            handler(());
        }
    }

    fn deliver(&self, text: String) {
        let handler = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            match state.on_message.clone() {
                Some(handler) => handler,
                None => {
                    state.inbox.push_back(text);
                    return;
                }
            }
        };
        handler(text);
    }

    fn shutdown(&self) {
        let (handler, partner) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.open = false;
            (state.on_close.clone(), state.partner.upgrade())
        };
        if let Some(handler) = handler {
            handler(());
        }
        if let Some(partner) = partner {
            partner.shutdown();
        }
    }
}

#[async_trait]
impl DataChannel for MemoryDataChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        let partner = {
            let state = self.state.lock();
            if !state.open {
                return Err(TransportError::DataChannel(format!(
                    "channel {} is not open",
                    self.label
                )));
            }
            state.partner.upgrade()
        };
        let partner = partner.ok_or(TransportError::ChannelClosed)?;
        partner.deliver(text);
        Ok(())
    }

    fn on_open(&self, handler: PeerHandler<()>) {
        self.state.lock().on_open = Some(Arc::from(handler));
    }

    fn on_message(&self, handler: PeerHandler<String>) {
        let handler: Shared<String> = Arc::from(handler);
        let backlog: Vec<String> = {
            let mut state = self.state.lock();
            state.on_message = Some(Arc::clone(&handler));
            state.inbox.drain(..).collect()
        };
        for text in backlog {
            handler(text);
        }
    }

    fn on_close(&self, handler: PeerHandler<()>) {
        self.state.lock().on_close = Some(Arc::from(handler));
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shutdown();
        Ok(())
    }
}
