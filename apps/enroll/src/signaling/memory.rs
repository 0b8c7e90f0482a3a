//! In-process rendezvous relay used by tests and the local demo.
//!
//! Mirrors the hosted relay's behavior: every new connection is allocated a
//! room and told its code; a client that sends `{code}` for another client's
//! room is paired with the owner, who receives `{user}`. From then on frames
//! are forwarded verbatim between the pair. Each room accepts one joiner.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use url::Url;

use super::{SignalingConnector, SignalingLink};
use crate::transport::TransportError;

const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_LEN: usize = 6;
const ANONYMOUS_USER: &str = "anonymous";

/// A frame a client sent to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayFrame {
    pub client: u64,
    pub text: String,
}

struct RelayClient {
    identity: Option<String>,
    to_client: mpsc::UnboundedSender<Result<String, TransportError>>,
    partner: Option<u64>,
}

struct Room {
    owner: u64,
    joined_by: Option<u64>,
}

#[derive(Default)]
struct RelayState {
    next_client: u64,
    clients: HashMap<u64, RelayClient>,
    rooms: HashMap<String, Room>,
    scripted_codes: VecDeque<String>,
    transcript: Vec<RelayFrame>,
}

impl RelayState {
    fn allocate_code(&mut self) -> String {
        while let Some(code) = self.scripted_codes.pop_front() {
            if !self.rooms.contains_key(&code) {
                return code;
            }
        }
        let mut rng = rand::thread_rng();
        loop {
            let code: String = (0..CODE_LEN)
                .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
                .collect();
            if !self.rooms.contains_key(&code) {
                return code;
            }
        }
    }

    fn send_to(&self, client: u64, text: String) {
        if let Some(entry) = self.clients.get(&client) {
            let _ = entry.to_client.send(Ok(text));
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands out `codes` in order before falling back to random ones.
    pub fn with_codes<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let relay = Self::default();
        relay.state.lock().scripted_codes = codes.into_iter().map(Into::into).collect();
        relay
    }

    /// Connector for an unauthenticated client.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            relay: self.clone(),
            identity: None,
        }
    }

    /// Connector for a client the relay knows as `identity`.
    pub fn connector_for(&self, identity: impl Into<String>) -> MemoryConnector {
        MemoryConnector {
            relay: self.clone(),
            identity: Some(identity.into()),
        }
    }

    pub fn transcript(&self) -> Vec<RelayFrame> {
        self.state.lock().transcript.clone()
    }

    pub fn connected_clients(&self) -> usize {
        self.state.lock().clients.len()
    }

    /// Rooms still waiting for a joiner.
    pub fn open_rooms(&self) -> usize {
        self.state
            .lock()
            .rooms
            .values()
            .filter(|room| room.joined_by.is_none())
            .count()
    }

    fn register(
        &self,
        identity: Option<String>,
        to_client: mpsc::UnboundedSender<Result<String, TransportError>>,
    ) -> u64 {
        let mut state = self.state.lock();
        state.next_client += 1;
        let id = state.next_client;
        let code = state.allocate_code();
        state.clients.insert(
            id,
            RelayClient {
                identity,
                to_client,
                partner: None,
            },
        );
        state.rooms.insert(
            code.clone(),
            Room {
                owner: id,
                joined_by: None,
            },
        );
        tracing::debug!(target = "signaling::memory", client = id, %code, "allocated room");
        state.send_to(id, json!({ "code": code }).to_string());
        id
    }

    fn handle_frame(&self, client: u64, text: String) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.transcript.push(RelayFrame {
            client,
            text: text.clone(),
        });
        let Some(entry) = state.clients.get(&client) else {
            return;
        };
        if let Some(partner) = entry.partner {
            state.send_to(partner, text);
            return;
        }
        let requested = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|value| value.get("code").and_then(Value::as_str).map(str::to_string));
        let Some(code) = requested else {
            tracing::trace!(target = "signaling::memory", client, "dropping frame from unpaired client");
            return;
        };

        let owner = state
            .rooms
            .get(&code)
            .filter(|room| {
                room.owner != client
                    && room.joined_by.is_none()
                    && state.clients.contains_key(&room.owner)
            })
            .map(|room| room.owner);
        let Some(owner) = owner else {
            tracing::warn!(target = "signaling::memory", client, %code, "rejected join");
            state.clients.remove(&client);
            state.rooms.retain(|_, room| room.owner != client);
            return;
        };

        if let Some(room) = state.rooms.get_mut(&code) {
            room.joined_by = Some(client);
        }
        state
            .rooms
            .retain(|_, room| room.owner != client || room.joined_by.is_some());
        let identity = state
            .clients
            .get(&client)
            .and_then(|entry| entry.identity.clone())
            .unwrap_or_else(|| ANONYMOUS_USER.to_string());
        if let Some(entry) = state.clients.get_mut(&client) {
            entry.partner = Some(owner);
        }
        if let Some(entry) = state.clients.get_mut(&owner) {
            entry.partner = Some(client);
        }
        tracing::debug!(target = "signaling::memory", owner, joiner = client, %code, "paired clients");
        state.send_to(owner, json!({ "user": identity }).to_string());
    }

    fn disconnect(&self, client: u64) {
        let mut state = self.state.lock();
        if state.clients.remove(&client).is_some() {
            tracing::debug!(target = "signaling::memory", client, "client disconnected");
        }
        state
            .rooms
            .retain(|_, room| room.owner != client || room.joined_by.is_some());
    }
}

pub struct MemoryConnector {
    relay: MemoryRelay,
    identity: Option<String>,
}

#[async_trait]
impl SignalingConnector for MemoryConnector {
    async fn connect(&self, _endpoint: &Url) -> Result<SignalingLink, TransportError> {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let client = self.relay.register(self.identity.clone(), inbound_tx);
        let relay = self.relay.clone();
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                relay.handle_frame(client, text);
            }
            relay.disconnect(client);
        });
        Ok(SignalingLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    const WAIT: Duration = Duration::from_secs(2);

    fn endpoint() -> Url {
        Url::parse("memory://relay").unwrap()
    }

    async fn recv(link: &mut SignalingLink) -> Option<String> {
        timeout(WAIT, link.inbound.recv())
            .await
            .unwrap()
            .map(|frame| frame.unwrap())
    }

    #[test_timeout::tokio_timeout_test]
    async fn pairs_one_joiner_and_forwards_verbatim() {
        let relay = MemoryRelay::with_codes(["ROOMA"]);
        let mut owner = relay.connector().connect(&endpoint()).await.unwrap();
        assert_eq!(recv(&mut owner).await.unwrap(), r#"{"code":"ROOMA"}"#);

        let mut joiner = relay.connector_for("alice").connect(&endpoint()).await.unwrap();
        recv(&mut joiner).await.unwrap();
        joiner.outbound.send(r#"{"code":"ROOMA"}"#.into()).unwrap();
        assert_eq!(recv(&mut owner).await.unwrap(), r#"{"user":"alice"}"#);

        owner.outbound.send("opaque frame".into()).unwrap();
        assert_eq!(recv(&mut joiner).await.unwrap(), "opaque frame");
        assert_eq!(relay.open_rooms(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn consumed_code_rejects_second_joiner() {
        let relay = MemoryRelay::with_codes(["ROOMA"]);
        let mut owner = relay.connector().connect(&endpoint()).await.unwrap();
        recv(&mut owner).await.unwrap();

        let mut first = relay.connector_for("first").connect(&endpoint()).await.unwrap();
        recv(&mut first).await.unwrap();
        first.outbound.send(r#"{"code":"ROOMA"}"#.into()).unwrap();
        assert_eq!(recv(&mut owner).await.unwrap(), r#"{"user":"first"}"#);

        let mut second = relay.connector_for("second").connect(&endpoint()).await.unwrap();
        recv(&mut second).await.unwrap();
        second.outbound.send(r#"{"code":"ROOMA"}"#.into()).unwrap();
        assert_eq!(recv(&mut second).await, None);

        owner.outbound.send("for first only".into()).unwrap();
        assert_eq!(recv(&mut first).await.unwrap(), "for first only");
    }

    #[test_timeout::tokio_timeout_test]
    async fn unknown_code_closes_the_joiner() {
        let relay = MemoryRelay::new();
        let mut joiner = relay.connector().connect(&endpoint()).await.unwrap();
        let allocated = recv(&mut joiner).await.unwrap();
        assert!(allocated.starts_with(r#"{"code":""#));
        joiner.outbound.send(r#"{"code":"NOPE"}"#.into()).unwrap();
        assert_eq!(recv(&mut joiner).await, None);
        assert_eq!(relay.connected_clients(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn separate_rooms_do_not_cross_talk() {
        let relay = MemoryRelay::with_codes(["ROOMA", "ROOMB"]);
        let mut owner_a = relay.connector().connect(&endpoint()).await.unwrap();
        let mut owner_b = relay.connector().connect(&endpoint()).await.unwrap();
        recv(&mut owner_a).await.unwrap();
        recv(&mut owner_b).await.unwrap();

        let mut joiner_a = relay.connector_for("a").connect(&endpoint()).await.unwrap();
        let mut joiner_b = relay.connector_for("b").connect(&endpoint()).await.unwrap();
        recv(&mut joiner_a).await.unwrap();
        recv(&mut joiner_b).await.unwrap();
        joiner_a.outbound.send(r#"{"code":"ROOMA"}"#.into()).unwrap();
        joiner_b.outbound.send(r#"{"code":"ROOMB"}"#.into()).unwrap();
        assert_eq!(recv(&mut owner_a).await.unwrap(), r#"{"user":"a"}"#);
        assert_eq!(recv(&mut owner_b).await.unwrap(), r#"{"user":"b"}"#);

        joiner_a.outbound.send("to a".into()).unwrap();
        joiner_b.outbound.send("to b".into()).unwrap();
        assert_eq!(recv(&mut owner_a).await.unwrap(), "to a");
        assert_eq!(recv(&mut owner_b).await.unwrap(), "to b");
        assert!(owner_a.inbound.try_recv().is_err());
    }
}
