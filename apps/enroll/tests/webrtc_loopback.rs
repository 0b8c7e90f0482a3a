use std::sync::Arc;

use enroll_core::signaling::MemoryRelay;
use enroll_core::transport::{DataChannelOptions, PeerConnector, WebRtcConnector};
use enroll_core::{PeerTransport, SignalingChannel, SignalingMessage, TransportEvent};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{timeout, Duration};
use url::Url;
use webrtc::util::vnet::net::{Net, NetConfig};
use webrtc::util::vnet::router::{Router, RouterConfig};

const WAIT: Duration = Duration::from_secs(20);

async fn attach(net: &Arc<Net>, router: &Arc<AsyncMutex<Router>>) {
    let nic = net.get_nic().unwrap();
    router.lock().await.add_net(Arc::clone(&nic)).await.unwrap();
    nic.lock().await.set_router(Arc::clone(router)).await.unwrap();
}

/// Two vnet hosts on one virtual LAN so ICE never touches real interfaces.
async fn virtual_lan() -> (Arc<Net>, Arc<Net>) {
    let wan = Arc::new(AsyncMutex::new(
        Router::new(RouterConfig {
            cidr: "10.0.0.0/24".to_owned(),
            ..Default::default()
        })
        .unwrap(),
    ));
    let offerer = Arc::new(Net::new(Some(NetConfig {
        static_ips: vec!["10.0.0.2".to_owned()],
        ..Default::default()
    })));
    let answerer = Arc::new(Net::new(Some(NetConfig {
        static_ips: vec!["10.0.0.3".to_owned()],
        ..Default::default()
    })));
    attach(&offerer, &wan).await;
    attach(&answerer, &wan).await;
    wan.lock().await.start().await.unwrap();
    (offerer, answerer)
}

async fn next_matching<F>(events: &mut UnboundedReceiver<TransportEvent>, predicate: F) -> TransportEvent
where
    F: Fn(&TransportEvent) -> bool,
{
    loop {
        let event = timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("transport event stream closed");
        if predicate(&event) {
            return event;
        }
    }
}

#[test_timeout::tokio_timeout_test(secs = 45)]
#[ignore = "runs a full ICE/DTLS/SCTP handshake over a virtual network"]
async fn data_flows_over_a_real_peer_connection() {
    let (offer_net, answer_net) = virtual_lan().await;
    let relay = MemoryRelay::with_codes(["LOOP01"]);
    let endpoint = Url::parse("memory://relay/api/socket").unwrap();

    let offerer = PeerTransport::new(
        SignalingChannel::new(Arc::new(relay.connector())),
        WebRtcConnector::new(Vec::new())
            .with_vnet(offer_net)
            .new_peer()
            .await
            .unwrap(),
    );
    let answerer = PeerTransport::new(
        SignalingChannel::new(Arc::new(relay.connector_for("provider"))),
        WebRtcConnector::new(Vec::new())
            .with_vnet(answer_net)
            .new_peer()
            .await
            .unwrap(),
    );
    let mut offerer_events = offerer.take_events().unwrap();
    let mut answerer_events = answerer.take_events().unwrap();

    offerer.connect_signaling(&endpoint).unwrap();
    next_matching(&mut offerer_events, |event| matches!(event, TransportEvent::Code(_))).await;
    answerer.listen_for_data();
    answerer.send_signal(&SignalingMessage::code("LOOP01")).unwrap();
    answerer.connect_signaling(&endpoint).unwrap();
    next_matching(&mut offerer_events, |event| matches!(event, TransportEvent::User(_))).await;

    offerer
        .create_data_channel("dataChannel", DataChannelOptions::default())
        .await
        .unwrap();
    offerer.send_data("action::add").await.unwrap();
    offerer.create_offer().await.unwrap();

    let received = next_matching(&mut answerer_events, |event| {
        matches!(event, TransportEvent::Data(_))
    })
    .await;
    assert!(matches!(received, TransportEvent::Data(text) if text == "action::add"));

    offerer.close().await;
    answerer.close().await;
}
