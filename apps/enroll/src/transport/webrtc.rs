use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::util::vnet::net::Net;

use super::{
    DataChannel, DataChannelOptions, PeerConnection, PeerConnectionState, PeerConnector,
    PeerHandler, TransportError,
};
use crate::signaling::{IceCandidate, SessionDescription};

fn to_setup_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}

fn to_negotiation_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Negotiation(err.to_string())
}

fn build_api(setting: SettingEngine) -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Creates WebRTC peer connections using the configured ICE servers.
#[derive(Clone)]
pub struct WebRtcConnector {
    ice_servers: Vec<String>,
    vnet: Option<Arc<Net>>,
}

impl WebRtcConnector {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self {
            ice_servers,
            vnet: None,
        }
    }

    /// Routes ICE over a virtual network instead of host interfaces.
    pub fn with_vnet(mut self, net: Arc<Net>) -> Self {
        self.vnet = Some(net);
        self
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn new_peer(&self) -> Result<Arc<dyn PeerConnection>, TransportError> {
        let mut setting = SettingEngine::default();
        setting.set_ice_timeouts(
            Some(Duration::from_secs(3)),
            Some(Duration::from_secs(10)),
            Some(Duration::from_millis(500)),
        );
        if let Some(net) = &self.vnet {
            setting.set_vnet(Some(Arc::clone(net)));
        }
        let api = build_api(setting)?;
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = api
            .new_peer_connection(config)
            .await
            .map_err(to_setup_error)?;
        tracing::debug!(
            target = "transport::webrtc",
            ice_servers = self.ice_servers.len(),
            "created peer connection"
        );
        Ok(Arc::new(WebRtcPeer { pc: Arc::new(pc) }))
    }
}

fn description_to_json(description: &RTCSessionDescription) -> SessionDescription {
    SessionDescription(json!({
        "type": description.sdp_type.to_string(),
        "sdp": description.sdp,
    }))
}

fn description_from_json(
    description: &SessionDescription,
) -> Result<RTCSessionDescription, TransportError> {
    let sdp = description
        .sdp()
        .ok_or_else(|| TransportError::Negotiation("description missing sdp".into()))?
        .to_string();
    match description.kind() {
        Some("offer") => RTCSessionDescription::offer(sdp).map_err(to_negotiation_error),
        Some("answer") => RTCSessionDescription::answer(sdp).map_err(to_negotiation_error),
        Some("pranswer") => RTCSessionDescription::pranswer(sdp).map_err(to_negotiation_error),
        other => Err(TransportError::Negotiation(format!(
            "unsupported sdp type {}",
            other.unwrap_or("<missing>")
        ))),
    }
}

fn candidate_to_json(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate(json!({
        "candidate": init.candidate,
        "sdpMid": init.sdp_mid,
        "sdpMLineIndex": init.sdp_mline_index,
        "usernameFragment": init.username_fragment,
    }))
}

fn candidate_from_json(candidate: &IceCandidate) -> Result<RTCIceCandidateInit, TransportError> {
    let text = candidate
        .candidate()
        .ok_or_else(|| TransportError::Negotiation("candidate missing candidate field".into()))?;
    Ok(RTCIceCandidateInit {
        candidate: text.to_string(),
        sdp_mid: candidate.sdp_mid().map(str::to_string),
        sdp_mline_index: candidate.sdp_mline_index(),
        username_fragment: candidate.username_fragment().map(str::to_string),
    })
}

fn map_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
            PeerConnectionState::New
        }
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
    }
}

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(to_negotiation_error)?;
        Ok(description_to_json(&offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(to_negotiation_error)?;
        Ok(description_to_json(&answer))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let description = description_from_json(&description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(to_negotiation_error)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let description = description_from_json(&description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(to_negotiation_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = candidate_from_json(&candidate)?;
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(to_negotiation_error)
    }

    async fn create_data_channel(
        &self,
        label: &str,
        options: &DataChannelOptions,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(options.ordered),
            max_retransmits: options.max_retransmits,
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(to_setup_error)?;
        Ok(Arc::new(WebRtcDataChannel { dc }))
    }

    fn on_ice_candidate(&self, handler: PeerHandler<IceCandidate>) {
        let handler: Arc<dyn Fn(IceCandidate) + Send + Sync> = Arc::from(handler);
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let handler = Arc::clone(&handler);
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => handler(candidate_to_json(init)),
                        Err(err) => tracing::warn!(
                            target = "transport::webrtc",
                            error = %err,
                            "failed to serialize local candidate"
                        ),
                    }
                })
            }));
    }

    fn on_data_channel(&self, handler: PeerHandler<Arc<dyn DataChannel>>) {
        let handler: Arc<dyn Fn(Arc<dyn DataChannel>) + Send + Sync> = Arc::from(handler);
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let handler = Arc::clone(&handler);
                Box::pin(async move {
                    tracing::debug!(
                        target = "transport::webrtc",
                        label = %dc.label(),
                        "remote data channel announced"
                    );
                    handler(Arc::new(WebRtcDataChannel { dc }));
                })
            }));
    }

    fn on_connection_state_change(&self, handler: PeerHandler<PeerConnectionState>) {
        let handler: Arc<dyn Fn(PeerConnectionState) + Send + Sync> = Arc::from(handler);
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let handler = Arc::clone(&handler);
                Box::pin(async move {
                    tracing::debug!(target = "transport::webrtc", ?state, "peer connection state");
                    handler(map_state(state));
                })
            }));
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await.map_err(to_setup_error)
    }
}

struct WebRtcDataChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.dc
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|err| TransportError::DataChannel(err.to_string()))
    }

    fn on_open(&self, handler: PeerHandler<()>) {
        let handler: Arc<dyn Fn(()) + Send + Sync> = Arc::from(handler);
        self.dc.on_open(Box::new(move || {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                handler(());
            })
        }));
    }

    fn on_message(&self, handler: PeerHandler<String>) {
        let handler: Arc<dyn Fn(String) + Send + Sync> = Arc::from(handler);
        self.dc
            .on_message(Box::new(move |message: DataChannelMessage| {
                let handler = Arc::clone(&handler);
                Box::pin(async move {
                    match String::from_utf8(message.data.to_vec()) {
                        Ok(text) => handler(text),
                        Err(_) => tracing::debug!(
                            target = "transport::webrtc",
                            len = message.data.len(),
                            "dropping non-utf8 data channel frame"
                        ),
                    }
                })
            }));
    }

    fn on_close(&self, handler: PeerHandler<()>) {
        let handler: Arc<dyn Fn(()) + Send + Sync> = Arc::from(handler);
        self.dc.on_close(Box::new(move || {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                handler(());
            })
        }));
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.dc.close().await.map_err(to_setup_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_json_uses_browser_field_names() {
        let candidate = candidate_to_json(RTCIceCandidateInit {
            candidate: "candidate:1 1 udp 2130706431 10.0.0.2 50000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        });
        assert_eq!(candidate.0["sdpMLineIndex"], 0);
        let init = candidate_from_json(&candidate).unwrap();
        assert_eq!(init.sdp_mid.as_deref(), Some("0"));
        assert_eq!(init.sdp_mline_index, Some(0));
    }

    #[test]
    fn rejects_descriptions_without_known_type() {
        let err = description_from_json(&SessionDescription(json!({"type": "rollback", "sdp": ""})))
            .unwrap_err();
        assert!(matches!(err, TransportError::Negotiation(_)));
        assert!(description_from_json(&SessionDescription(json!({"type": "offer"}))).is_err());
    }
}
