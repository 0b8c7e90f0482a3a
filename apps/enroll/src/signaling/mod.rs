//! Out-of-band courier between the two pairing endpoints and the relay.

pub mod memory;
pub mod websocket;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use crate::transport::TransportError;

pub use memory::{MemoryConnector, MemoryRelay, RelayFrame};
pub use websocket::WebSocketConnector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// Session description blob (`{"type": "...", "sdp": "..."}`), relayed untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionDescription(pub Value);

impl SessionDescription {
    pub fn kind(&self) -> Option<&str> {
        self.0.get("type").and_then(Value::as_str)
    }

    pub fn sdp(&self) -> Option<&str> {
        self.0.get("sdp").and_then(Value::as_str)
    }
}

/// Trickled ICE candidate blob, relayed untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IceCandidate(pub Value);

impl IceCandidate {
    pub fn candidate(&self) -> Option<&str> {
        self.0.get("candidate").and_then(Value::as_str)
    }

    pub fn sdp_mid(&self) -> Option<&str> {
        self.0.get("sdpMid").and_then(Value::as_str)
    }

    pub fn sdp_mline_index(&self) -> Option<u16> {
        self.0
            .get("sdpMLineIndex")
            .and_then(Value::as_u64)
            .and_then(|index| u16::try_from(index).ok())
    }

    pub fn username_fragment(&self) -> Option<&str> {
        self.0.get("usernameFragment").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum NegotiationSignal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

/// JSON frames understood by the relay.
///
/// Shapes are checked in the order `{code}`, `{user}`, `{event, data}`; a
/// frame matching none of them is not a signaling message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalingMessage {
    Code { code: String },
    User { user: String },
    Negotiation(NegotiationSignal),
}

impl SignalingMessage {
    pub fn code(code: impl Into<String>) -> Self {
        SignalingMessage::Code { code: code.into() }
    }

    pub fn user(user: impl Into<String>) -> Self {
        SignalingMessage::User { user: user.into() }
    }

    pub fn offer(description: SessionDescription) -> Self {
        SignalingMessage::Negotiation(NegotiationSignal::Offer(description))
    }

    pub fn answer(description: SessionDescription) -> Self {
        SignalingMessage::Negotiation(NegotiationSignal::Answer(description))
    }

    pub fn candidate(candidate: IceCandidate) -> Self {
        SignalingMessage::Negotiation(NegotiationSignal::Candidate(candidate))
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingEventKind {
    Open,
    Message,
    Close,
    Error,
}

/// What a listener sees: the raw frame (or error text) and, for messages,
/// the parsed JSON. A frame that is not JSON arrives with `payload: None`.
#[derive(Debug, Clone)]
pub struct SignalingEvent {
    pub kind: SignalingEventKind,
    pub raw: Option<String>,
    pub payload: Option<Value>,
}

impl SignalingEvent {
    fn bare(kind: SignalingEventKind) -> Self {
        Self {
            kind,
            raw: None,
            payload: None,
        }
    }

    fn message(raw: String) -> Self {
        let payload = serde_json::from_str::<Value>(&raw).ok();
        Self {
            kind: SignalingEventKind::Message,
            raw: Some(raw),
            payload,
        }
    }

    fn error(reason: String) -> Self {
        Self {
            kind: SignalingEventKind::Error,
            raw: Some(reason),
            payload: None,
        }
    }

    pub fn message_payload(&self) -> Option<SignalingMessage> {
        self.payload.as_ref().and_then(SignalingMessage::from_value)
    }
}

/// Both directions of an established relay connection. Dropping `outbound`
/// closes the connection; `inbound` ends when the relay goes away.
pub struct SignalingLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<Result<String, TransportError>>,
}

#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(&self, endpoint: &Url) -> Result<SignalingLink, TransportError>;
}

type Listener = Arc<dyn Fn(&SignalingEvent) + Send + Sync>;

struct LinkState {
    state: ConnectionState,
    dialed: bool,
    queue: VecDeque<String>,
    outbound: Option<mpsc::UnboundedSender<String>>,
}

struct ChannelInner {
    connector: Arc<dyn SignalingConnector>,
    link: Mutex<LinkState>,
    listeners: Mutex<HashMap<SignalingEventKind, Vec<Listener>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Ordered JSON message channel to the rendezvous relay.
///
/// Messages sent before the link is open are queued and flushed in call
/// order at the moment the link opens. Closing is terminal: a closed channel
/// never reconnects and a fresh instance is needed for another attempt.
#[derive(Clone)]
pub struct SignalingChannel {
    inner: Arc<ChannelInner>,
}

impl SignalingChannel {
    pub fn new(connector: Arc<dyn SignalingConnector>) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                connector,
                link: Mutex::new(LinkState {
                    state: ConnectionState::Connecting,
                    dialed: false,
                    queue: VecDeque::new(),
                    outbound: None,
                }),
                listeners: Mutex::new(HashMap::new()),
                pump: Mutex::new(None),
            }),
        }
    }

    /// Starts dialing `endpoint` in the background. Must be called from
    /// within a Tokio runtime.
    pub fn connect(&self, endpoint: &Url) -> Result<(), TransportError> {
        {
            let mut link = self.inner.link.lock();
            if link.state == ConnectionState::Closed {
                return Err(TransportError::ChannelClosed);
            }
            if link.dialed {
                return Err(TransportError::AlreadyConnected);
            }
            link.dialed = true;
        }
        tracing::debug!(target = "signaling", endpoint = %endpoint, "dialing relay");
        let handle = tokio::spawn(run_link(
            Arc::downgrade(&self.inner),
            Arc::clone(&self.inner.connector),
            endpoint.clone(),
        ));
        *self.inner.pump.lock() = Some(handle);
        Ok(())
    }

    pub fn send(&self, message: &SignalingMessage) -> Result<(), TransportError> {
        let text = serde_json::to_string(message)
            .map_err(|err| TransportError::Signaling(format!("encode failed: {err}")))?;
        let mut link = self.inner.link.lock();
        match link.state {
            ConnectionState::Connecting => {
                link.queue.push_back(text);
                tracing::trace!(
                    target = "signaling",
                    queued = link.queue.len(),
                    "queued outbound message until relay opens"
                );
                Ok(())
            }
            ConnectionState::Open => match link.outbound.as_ref() {
                Some(outbound) => outbound
                    .send(text)
                    .map_err(|_| TransportError::ChannelClosed),
                None => Err(TransportError::ChannelClosed),
            },
            ConnectionState::Closed => Err(TransportError::ChannelClosed),
        }
    }

    pub fn on<F>(&self, kind: SignalingEventKind, handler: F)
    where
        F: Fn(&SignalingEvent) + Send + Sync + 'static,
    {
        self.inner
            .listeners
            .lock()
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.link.lock().state
    }

    pub fn queued(&self) -> usize {
        self.inner.link.lock().queue.len()
    }

    pub fn close(&self) {
        if self.inner.mark_closed() {
            if let Some(pump) = self.inner.pump.lock().take() {
                pump.abort();
            }
            tracing::debug!(target = "signaling", "signaling channel closed");
            self.inner.emit(&SignalingEvent::bare(SignalingEventKind::Close));
        }
    }
}

impl fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let link = self.inner.link.lock();
        f.debug_struct("SignalingChannel")
            .field("state", &link.state)
            .field("queued", &link.queue.len())
            .finish()
    }
}

impl ChannelInner {
    /// Flushes the queue into `outbound` and flips to `Open` under one lock,
    /// so no concurrent `send` can slip in between queued messages.
    fn open_with(&self, outbound: mpsc::UnboundedSender<String>) -> bool {
        let mut link = self.link.lock();
        if link.state == ConnectionState::Closed {
            return false;
        }
        let flushed = link.queue.len();
        while let Some(text) = link.queue.pop_front() {
            if outbound.send(text).is_err() {
                tracing::warn!(target = "signaling", "relay dropped while flushing queue");
                break;
            }
        }
        link.outbound = Some(outbound);
        link.state = ConnectionState::Open;
        tracing::debug!(target = "signaling", flushed, "relay link open");
        true
    }

    fn mark_closed(&self) -> bool {
        let mut link = self.link.lock();
        if link.state == ConnectionState::Closed {
            return false;
        }
        link.state = ConnectionState::Closed;
        link.outbound = None;
        link.queue.clear();
        true
    }

    fn emit(&self, event: &SignalingEvent) {
        let listeners = self
            .listeners
            .lock()
            .get(&event.kind)
            .cloned()
            .unwrap_or_default();
        for listener in listeners {
            listener(event);
        }
    }
}

async fn run_link(
    inner: Weak<ChannelInner>,
    connector: Arc<dyn SignalingConnector>,
    endpoint: Url,
) {
    let result = connector.connect(&endpoint).await;
    let Some(channel) = inner.upgrade() else {
        return;
    };
    let mut link = match result {
        Ok(link) => link,
        Err(err) => {
            tracing::warn!(
                target = "signaling",
                endpoint = %endpoint,
                error = %err,
                "relay connect failed"
            );
            if channel.mark_closed() {
                channel.emit(&SignalingEvent::error(err.to_string()));
                channel.emit(&SignalingEvent::bare(SignalingEventKind::Close));
            }
            return;
        }
    };
    if !channel.open_with(link.outbound) {
        return;
    }
    channel.emit(&SignalingEvent::bare(SignalingEventKind::Open));
    drop(channel);

    while let Some(frame) = link.inbound.recv().await {
        let Some(channel) = inner.upgrade() else {
            return;
        };
        match frame {
            Ok(text) => {
                let event = SignalingEvent::message(text);
                if event.payload.is_none() {
                    tracing::debug!(
                        target = "signaling",
                        len = event.raw.as_deref().map(str::len).unwrap_or_default(),
                        "relay frame is not json"
                    );
                }
                channel.emit(&event);
            }
            Err(err) => {
                tracing::warn!(target = "signaling", error = %err, "relay link error");
                channel.emit(&SignalingEvent::error(err.to_string()));
            }
        }
    }

    if let Some(channel) = inner.upgrade() {
        if channel.mark_closed() {
            tracing::debug!(target = "signaling", "relay closed the link");
            channel.emit(&SignalingEvent::bare(SignalingEventKind::Close));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::oneshot;
    use tokio::time::{timeout, Duration};

    const WAIT: Duration = Duration::from_secs(2);

    /// Connector whose link only comes up once the test releases the gate.
    struct GatedConnector {
        pending: Mutex<Option<(oneshot::Receiver<()>, SignalingLink)>>,
    }

    struct RelaySide {
        gate: oneshot::Sender<()>,
        from_client: mpsc::UnboundedReceiver<String>,
        to_client: mpsc::UnboundedSender<Result<String, TransportError>>,
    }

    fn gated() -> (Arc<GatedConnector>, RelaySide) {
        let (gate_tx, gate_rx) = oneshot::channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(GatedConnector {
            pending: Mutex::new(Some((
                gate_rx,
                SignalingLink {
                    outbound: outbound_tx,
                    inbound: inbound_rx,
                },
            ))),
        });
        (
            connector,
            RelaySide {
                gate: gate_tx,
                from_client: outbound_rx,
                to_client: inbound_tx,
            },
        )
    }

    #[async_trait]
    impl SignalingConnector for GatedConnector {
        async fn connect(&self, _endpoint: &Url) -> Result<SignalingLink, TransportError> {
            let pending = self.pending.lock().take();
            let (gate, link) = pending.ok_or(TransportError::AlreadyConnected)?;
            gate.await
                .map_err(|_| TransportError::Setup("gate dropped".into()))?;
            Ok(link)
        }
    }

    struct RefusingConnector;

    #[async_trait]
    impl SignalingConnector for RefusingConnector {
        async fn connect(&self, _endpoint: &Url) -> Result<SignalingLink, TransportError> {
            Err(TransportError::Setup("connection refused".into()))
        }
    }

    fn endpoint() -> Url {
        Url::parse("ws://relay.test/api/socket").unwrap()
    }

    fn watch(
        channel: &SignalingChannel,
        kind: SignalingEventKind,
    ) -> mpsc::UnboundedReceiver<SignalingEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        channel.on(kind, move |event| {
            let _ = tx.send(event.clone());
        });
        rx
    }

    #[test]
    fn signaling_shapes_match_the_relay_wire_format() {
        let offer = SignalingMessage::offer(SessionDescription(json!({"type": "offer", "sdp": "v=0"})));
        assert_eq!(
            serde_json::to_value(&offer).unwrap(),
            json!({"event": "offer", "data": {"type": "offer", "sdp": "v=0"}})
        );
        assert_eq!(
            serde_json::to_value(SignalingMessage::code("AB12")).unwrap(),
            json!({"code": "AB12"})
        );
        assert_eq!(
            SignalingMessage::from_value(&json!({"user": "alice"})),
            Some(SignalingMessage::user("alice"))
        );
        assert_eq!(
            SignalingMessage::from_value(&json!({"event": "candidate", "data": {"candidate": "c"}})),
            Some(SignalingMessage::candidate(IceCandidate(json!({"candidate": "c"}))))
        );
        assert_eq!(SignalingMessage::from_value(&json!({"event": "bye"})), None);
        assert_eq!(SignalingMessage::from_value(&json!({"code": 12})), None);
    }

    #[test]
    fn candidate_accessors_read_browser_field_names() {
        let candidate = IceCandidate(json!({
            "candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0,
            "usernameFragment": "abcd"
        }));
        assert_eq!(candidate.sdp_mid(), Some("0"));
        assert_eq!(candidate.sdp_mline_index(), Some(0));
        assert_eq!(candidate.username_fragment(), Some("abcd"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn queued_messages_flush_in_order_when_link_opens() {
        let (connector, mut relay) = gated();
        let channel = SignalingChannel::new(connector);
        let mut opened = watch(&channel, SignalingEventKind::Open);

        channel.send(&SignalingMessage::code("ONE")).unwrap();
        channel.send(&SignalingMessage::user("two")).unwrap();
        channel.connect(&endpoint()).unwrap();
        channel.send(&SignalingMessage::code("THREE")).unwrap();
        assert_eq!(channel.queued(), 3);
        assert_eq!(channel.state(), ConnectionState::Connecting);

        relay.gate.send(()).unwrap();
        timeout(WAIT, opened.recv()).await.unwrap().unwrap();
        assert_eq!(channel.state(), ConnectionState::Open);
        channel.send(&SignalingMessage::code("FOUR")).unwrap();

        let mut received = Vec::new();
        for _ in 0..4 {
            received.push(timeout(WAIT, relay.from_client.recv()).await.unwrap().unwrap());
        }
        assert_eq!(
            received,
            vec![
                r#"{"code":"ONE"}"#,
                r#"{"user":"two"}"#,
                r#"{"code":"THREE"}"#,
                r#"{"code":"FOUR"}"#,
            ]
        );
        assert!(relay.from_client.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn malformed_frames_arrive_without_payload() {
        let (connector, relay) = gated();
        let channel = SignalingChannel::new(connector);
        let mut messages = watch(&channel, SignalingEventKind::Message);
        channel.connect(&endpoint()).unwrap();
        relay.gate.send(()).unwrap();

        relay.to_client.send(Ok("not json".into())).unwrap();
        relay.to_client.send(Ok(r#"{"code":"AB12"}"#.into())).unwrap();

        let first = timeout(WAIT, messages.recv()).await.unwrap().unwrap();
        assert_eq!(first.raw.as_deref(), Some("not json"));
        assert!(first.payload.is_none());
        assert!(first.message_payload().is_none());

        let second = timeout(WAIT, messages.recv()).await.unwrap().unwrap();
        assert_eq!(second.message_payload(), Some(SignalingMessage::code("AB12")));
    }

    #[test_timeout::tokio_timeout_test]
    async fn close_is_terminal() {
        let (connector, relay) = gated();
        let channel = SignalingChannel::new(connector);
        let mut closed = watch(&channel, SignalingEventKind::Close);
        channel.connect(&endpoint()).unwrap();
        relay.gate.send(()).unwrap();

        channel.close();
        timeout(WAIT, closed.recv()).await.unwrap().unwrap();
        assert_eq!(channel.state(), ConnectionState::Closed);
        assert_eq!(
            channel.send(&SignalingMessage::code("LATE")),
            Err(TransportError::ChannelClosed)
        );
        assert_eq!(channel.connect(&endpoint()), Err(TransportError::ChannelClosed));
        channel.close();
        assert!(closed.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn closing_while_dialing_discards_the_queue() {
        let (connector, mut relay) = gated();
        let channel = SignalingChannel::new(connector);
        channel.send(&SignalingMessage::code("NEVER")).unwrap();
        channel.connect(&endpoint()).unwrap();
        channel.close();
        assert_eq!(channel.queued(), 0);
        let _ = relay.gate.send(());
        drop(channel);

        assert!(timeout(WAIT, relay.from_client.recv()).await.unwrap().is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn second_connect_is_rejected() {
        let (connector, _relay) = gated();
        let channel = SignalingChannel::new(connector);
        channel.connect(&endpoint()).unwrap();
        assert_eq!(
            channel.connect(&endpoint()),
            Err(TransportError::AlreadyConnected)
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn failed_connect_reports_error_then_close() {
        let channel = SignalingChannel::new(Arc::new(RefusingConnector));
        let mut errors = watch(&channel, SignalingEventKind::Error);
        let mut closed = watch(&channel, SignalingEventKind::Close);
        channel.send(&SignalingMessage::code("AB12")).unwrap();
        channel.connect(&endpoint()).unwrap();

        let error = timeout(WAIT, errors.recv()).await.unwrap().unwrap();
        assert!(error.raw.unwrap().contains("connection refused"));
        timeout(WAIT, closed.recv()).await.unwrap().unwrap();
        assert_eq!(channel.state(), ConnectionState::Closed);
    }

    #[test_timeout::tokio_timeout_test]
    async fn relay_hangup_closes_the_channel() {
        let (connector, relay) = gated();
        let channel = SignalingChannel::new(connector);
        let mut closed = watch(&channel, SignalingEventKind::Close);
        channel.connect(&endpoint()).unwrap();
        relay.gate.send(()).unwrap();
        drop(relay.to_client);

        timeout(WAIT, closed.recv()).await.unwrap().unwrap();
        assert_eq!(channel.state(), ConnectionState::Closed);
    }
}
