//! Peer transport bootstrapped over a [`SignalingChannel`].
//!
//! The signaling link only carries session descriptions and candidates; once
//! the peer connection is up, application data flows over a single ordered
//! data channel.

pub mod memory;
pub mod webrtc;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use url::Url;

use crate::signaling::{
    ConnectionState, IceCandidate, NegotiationSignal, SessionDescription, SignalingChannel,
    SignalingEvent, SignalingEventKind, SignalingMessage,
};

pub use memory::{MemoryDataChannel, MemoryNetwork, MemoryPeer};
pub use self::webrtc::WebRtcConnector;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("signaling error: {0}")]
    Signaling(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("peer connection failed")]
    PeerFailed,
    #[error("data channel error: {0}")]
    DataChannel(String),
    #[error("channel closed")]
    ChannelClosed,
    #[error("signaling channel already connected")]
    AlreadyConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    New,
    HaveLocalOffer,
    HaveRemoteOffer,
    Connected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChannelOptions {
    pub ordered: bool,
    pub max_retransmits: Option<u16>,
}

impl Default for DataChannelOptions {
    fn default() -> Self {
        Self {
            ordered: true,
            max_retransmits: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Queued,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Room code allocated by the relay.
    Code(String),
    /// Identity of the peer that joined our room.
    User(String),
    Negotiation(NegotiationState),
    ChannelOpen,
    Data(String),
    ChannelClosed,
    SignalingClosed,
    Error(TransportError),
}

pub type PeerHandler<T> = Box<dyn Fn(T) + Send + Sync>;

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;
    async fn create_data_channel(
        &self,
        label: &str,
        options: &DataChannelOptions,
    ) -> Result<Arc<dyn DataChannel>, TransportError>;
    fn on_ice_candidate(&self, handler: PeerHandler<IceCandidate>);
    fn on_data_channel(&self, handler: PeerHandler<Arc<dyn DataChannel>>);
    fn on_connection_state_change(&self, handler: PeerHandler<PeerConnectionState>);
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;
    fn is_open(&self) -> bool;
    async fn send_text(&self, text: String) -> Result<(), TransportError>;
    fn on_open(&self, handler: PeerHandler<()>);
    fn on_message(&self, handler: PeerHandler<String>);
    fn on_close(&self, handler: PeerHandler<()>);
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn new_peer(&self) -> Result<Arc<dyn PeerConnection>, TransportError>;
}

enum Internal {
    Signal(SignalingEvent),
    RemoteChannel(Arc<dyn DataChannel>),
    ChannelOpen,
    ChannelMessage(String),
    ChannelClosed,
    PeerState(PeerConnectionState),
}

struct ChannelSlot {
    channel: Option<Arc<dyn DataChannel>>,
    state: ConnectionState,
    queue: VecDeque<String>,
}

struct RemoteCandidates {
    remote_described: bool,
    pending: Vec<IceCandidate>,
}

struct TransportInner {
    signaling: SignalingChannel,
    peer: Arc<dyn PeerConnection>,
    internal: mpsc::UnboundedSender<Internal>,
    events: mpsc::UnboundedSender<TransportEvent>,
    slot: AsyncMutex<ChannelSlot>,
    candidates: AsyncMutex<RemoteCandidates>,
    negotiation: Mutex<NegotiationState>,
    listening: AtomicBool,
    closed: AtomicBool,
}

/// One negotiated peer connection plus the signaling channel that bootstraps
/// it. Observations are delivered on a single-consumer event stream; see
/// [`PeerTransport::take_events`].
pub struct PeerTransport {
    inner: Arc<TransportInner>,
    events: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl PeerTransport {
    /// Wires `peer` to `signaling` and starts the event driver. Must be
    /// called from within a Tokio runtime.
    pub fn new(signaling: SignalingChannel, peer: Arc<dyn PeerConnection>) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        for kind in [
            SignalingEventKind::Message,
            SignalingEventKind::Close,
            SignalingEventKind::Error,
        ] {
            let tx = internal_tx.clone();
            signaling.on(kind, move |event| {
                let _ = tx.send(Internal::Signal(event.clone()));
            });
        }

        let courier = signaling.clone();
        peer.on_ice_candidate(Box::new(move |candidate| {
            tracing::trace!(
                target = "transport",
                candidate = candidate.candidate().unwrap_or_default(),
                "relaying local candidate"
            );
            if let Err(err) = courier.send(&SignalingMessage::candidate(candidate)) {
                tracing::debug!(target = "transport", error = %err, "dropped local candidate");
            }
        }));
        let tx = internal_tx.clone();
        peer.on_data_channel(Box::new(move |channel| {
            let _ = tx.send(Internal::RemoteChannel(channel));
        }));
        let tx = internal_tx.clone();
        peer.on_connection_state_change(Box::new(move |state| {
            let _ = tx.send(Internal::PeerState(state));
        }));

        let inner = Arc::new(TransportInner {
            signaling,
            peer,
            internal: internal_tx,
            events: events_tx,
            slot: AsyncMutex::new(ChannelSlot {
                channel: None,
                state: ConnectionState::Connecting,
                queue: VecDeque::new(),
            }),
            candidates: AsyncMutex::new(RemoteCandidates {
                remote_described: false,
                pending: Vec::new(),
            }),
            negotiation: Mutex::new(NegotiationState::New),
            listening: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        let driver = tokio::spawn(drive(Arc::downgrade(&inner), internal_rx));

        Self {
            inner,
            events: Mutex::new(Some(events_rx)),
            driver: Mutex::new(Some(driver)),
        }
    }

    /// Hands out the event stream. Only the first caller gets it.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events.lock().take()
    }

    pub fn signaling(&self) -> &SignalingChannel {
        &self.inner.signaling
    }

    pub fn connect_signaling(&self, endpoint: &Url) -> Result<(), TransportError> {
        self.inner.signaling.connect(endpoint)
    }

    pub fn send_signal(&self, message: &SignalingMessage) -> Result<(), TransportError> {
        self.inner.signaling.send(message)
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        *self.inner.negotiation.lock()
    }

    pub async fn channel_state(&self) -> ConnectionState {
        self.inner.slot.lock().await.state
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Starts delivering inbound data as [`TransportEvent::Data`]. Until this
    /// is called, inbound frames and remotely created channels are dropped.
    pub fn listen_for_data(&self) {
        self.inner.listening.store(true, Ordering::SeqCst);
    }

    /// Creates the local data channel. Repeated calls keep the first channel.
    pub async fn create_data_channel(
        &self,
        label: &str,
        options: DataChannelOptions,
    ) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ChannelClosed);
        }
        let mut slot = self.inner.slot.lock().await;
        if slot.channel.is_some() {
            return Ok(());
        }
        let channel = self.inner.peer.create_data_channel(label, &options).await?;
        tracing::debug!(target = "transport", label, "created data channel");
        self.inner.attach(&channel);
        slot.channel = Some(channel);
        Ok(())
    }

    /// Sends `payload` now if the data channel is open, otherwise queues it
    /// for the open transition.
    pub async fn send_data(&self, payload: &str) -> Result<SendOutcome, TransportError> {
        if self.is_closed() {
            return Err(TransportError::ChannelClosed);
        }
        let mut slot = self.inner.slot.lock().await;
        match slot.state {
            ConnectionState::Open => {
                let channel = slot
                    .channel
                    .clone()
                    .ok_or(TransportError::ChannelClosed)?;
                channel.send_text(payload.to_string()).await?;
                Ok(SendOutcome::Sent)
            }
            ConnectionState::Connecting => {
                slot.queue.push_back(payload.to_string());
                tracing::trace!(
                    target = "transport",
                    queued = slot.queue.len(),
                    "queued data until channel opens"
                );
                Ok(SendOutcome::Queued)
            }
            ConnectionState::Closed => Err(TransportError::ChannelClosed),
        }
    }

    /// Generates an offer and applies it locally before relaying it, so an
    /// early answer never lands on a peer still in the stable state.
    pub async fn create_offer(&self) -> Result<(), TransportError> {
        self.inner.create_offer().await
    }

    /// Applies the remote offer, then generates an answer, applies it and
    /// relays it.
    pub async fn create_answer(&self, remote: SessionDescription) -> Result<(), TransportError> {
        self.inner.create_answer(remote).await
    }

    /// Closes signaling first, then the data channel and peer connection.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(target = "transport", "closing peer transport");
        self.inner.signaling.close();
        let channel = {
            let mut slot = self.inner.slot.lock().await;
            slot.state = ConnectionState::Closed;
            slot.queue.clear();
            slot.channel.take()
        };
        if let Some(channel) = channel {
            if let Err(err) = channel.close().await {
                tracing::debug!(target = "transport", error = %err, "data channel close failed");
            }
        }
        if let Err(err) = self.inner.peer.close().await {
            tracing::debug!(target = "transport", error = %err, "peer close failed");
        }
        *self.inner.negotiation.lock() = NegotiationState::Closed;
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
    }
}

impl Drop for PeerTransport {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get_mut().take() {
            driver.abort();
        }
    }
}

impl TransportInner {
    fn publish(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!(target = "transport", "transport event dropped");
        }
    }

    fn set_negotiation(&self, state: NegotiationState) {
        let changed = {
            let mut current = self.negotiation.lock();
            let changed = *current != state;
            *current = state;
            changed
        };
        if changed {
            tracing::debug!(target = "transport", ?state, "negotiation state");
            self.publish(TransportEvent::Negotiation(state));
        }
    }

    fn fail(&self, err: TransportError) {
        tracing::warn!(target = "transport", error = %err, "peer negotiation failed");
        self.set_negotiation(NegotiationState::Failed);
        self.publish(TransportEvent::Error(err));
    }

    /// An adopted channel may already be open with frames buffered, so the
    /// open transition is queued before the message handler replays them.
    fn attach(&self, channel: &Arc<dyn DataChannel>) {
        let tx = self.internal.clone();
        channel.on_open(Box::new(move |()| {
            let _ = tx.send(Internal::ChannelOpen);
        }));
        if channel.is_open() {
            let _ = self.internal.send(Internal::ChannelOpen);
        }
        let tx = self.internal.clone();
        channel.on_message(Box::new(move |text| {
            let _ = tx.send(Internal::ChannelMessage(text));
        }));
        let tx = self.internal.clone();
        channel.on_close(Box::new(move |()| {
            let _ = tx.send(Internal::ChannelClosed);
        }));
    }

    async fn create_offer(&self) -> Result<(), TransportError> {
        let offer = self.peer.create_offer().await?;
        self.peer.set_local_description(offer.clone()).await?;
        self.set_negotiation(NegotiationState::HaveLocalOffer);
        self.signaling.send(&SignalingMessage::offer(offer))
    }

    async fn create_answer(&self, remote: SessionDescription) -> Result<(), TransportError> {
        self.apply_remote_description(remote).await?;
        self.set_negotiation(NegotiationState::HaveRemoteOffer);
        let answer = self.peer.create_answer().await?;
        self.peer.set_local_description(answer.clone()).await?;
        self.signaling.send(&SignalingMessage::answer(answer))
    }

    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let mut candidates = self.candidates.lock().await;
        self.peer.set_remote_description(description).await?;
        candidates.remote_described = true;
        for candidate in candidates.pending.drain(..) {
            self.peer.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    async fn apply_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut candidates = self.candidates.lock().await;
        if candidates.remote_described {
            self.peer.add_ice_candidate(candidate).await
        } else {
            candidates.pending.push(candidate);
            Ok(())
        }
    }

    async fn open_channel(&self) {
        let mut slot = self.slot.lock().await;
        if slot.state != ConnectionState::Connecting {
            return;
        }
        let Some(channel) = slot.channel.clone() else {
            return;
        };
        let flushed = slot.queue.len();
        while let Some(text) = slot.queue.pop_front() {
            if let Err(err) = channel.send_text(text).await {
                tracing::warn!(target = "transport", error = %err, "flush on open failed");
                self.publish(TransportEvent::Error(err));
                break;
            }
        }
        slot.state = ConnectionState::Open;
        drop(slot);
        tracing::debug!(target = "transport", flushed, "data channel open");
        self.publish(TransportEvent::ChannelOpen);
    }

    async fn handle(&self, event: Internal) {
        match event {
            Internal::Signal(event) => self.handle_signal(event).await,
            Internal::RemoteChannel(channel) => {
                if !self.listening.load(Ordering::SeqCst) {
                    tracing::debug!(
                        target = "transport",
                        label = %channel.label(),
                        "ignoring remote data channel; not listening"
                    );
                    return;
                }
                let mut slot = self.slot.lock().await;
                if slot.channel.is_some() {
                    tracing::debug!(target = "transport", "ignoring extra remote data channel");
                    return;
                }
                tracing::debug!(target = "transport", label = %channel.label(), "adopted remote data channel");
                self.attach(&channel);
                slot.channel = Some(channel);
            }
            Internal::ChannelOpen => self.open_channel().await,
            Internal::ChannelMessage(text) => {
                if self.listening.load(Ordering::SeqCst) {
                    self.publish(TransportEvent::Data(text));
                } else {
                    tracing::trace!(target = "transport", "dropping inbound data; not listening");
                }
            }
            Internal::ChannelClosed => {
                let mut slot = self.slot.lock().await;
                if slot.state == ConnectionState::Closed {
                    return;
                }
                slot.state = ConnectionState::Closed;
                slot.queue.clear();
                drop(slot);
                self.publish(TransportEvent::ChannelClosed);
            }
            Internal::PeerState(state) => match state {
                PeerConnectionState::Connected => self.set_negotiation(NegotiationState::Connected),
                PeerConnectionState::Failed => self.fail(TransportError::PeerFailed),
                PeerConnectionState::Closed => self.set_negotiation(NegotiationState::Closed),
                other => tracing::trace!(target = "transport", state = ?other, "peer state"),
            },
        }
    }

    async fn handle_signal(&self, event: SignalingEvent) {
        match event.kind {
            SignalingEventKind::Message => match event.message_payload() {
                Some(SignalingMessage::Code { code }) => self.publish(TransportEvent::Code(code)),
                Some(SignalingMessage::User { user }) => self.publish(TransportEvent::User(user)),
                Some(SignalingMessage::Negotiation(NegotiationSignal::Offer(offer))) => {
                    if let Err(err) = self.create_answer(offer).await {
                        self.fail(err);
                    }
                }
                Some(SignalingMessage::Negotiation(NegotiationSignal::Answer(answer))) => {
                    if let Err(err) = self.apply_remote_description(answer).await {
                        self.fail(err);
                    }
                }
                Some(SignalingMessage::Negotiation(NegotiationSignal::Candidate(candidate))) => {
                    if let Err(err) = self.apply_remote_candidate(candidate).await {
                        self.fail(err);
                    }
                }
                None => tracing::debug!(
                    target = "transport",
                    raw = event.raw.as_deref().unwrap_or_default(),
                    "ignoring unrecognized signaling frame"
                ),
            },
            SignalingEventKind::Close => self.publish(TransportEvent::SignalingClosed),
            SignalingEventKind::Error => {
                let reason = event.raw.unwrap_or_else(|| "unknown signaling error".into());
                self.publish(TransportEvent::Error(TransportError::Signaling(reason)));
            }
            SignalingEventKind::Open => {}
        }
    }
}

async fn drive(inner: Weak<TransportInner>, mut internal: mpsc::UnboundedReceiver<Internal>) {
    while let Some(event) = internal.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        inner.handle(event).await;
    }
}
