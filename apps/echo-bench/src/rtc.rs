//! WebRTC data-channel transport built on `webrtc`.

use std::sync::Arc;

use async_trait::async_trait;
use echo_proto::SessionDescription;
use tracing::{debug, info, warn};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc_ice::udp_network::{EphemeralUDP, UDPNetwork};

use crate::connection::{ClosedFlag, Connection, ConnectionError, ConnectionId, Frame, TransportKind};
use crate::negotiation::{NegotiationError, PeerEngine, PeerEvents, PeerTransport};

/// ICE knobs applied to every peer connection.
#[derive(Debug, Clone, Default)]
pub struct IceSettings {
    pub port_range: Option<(u16, u16)>,
    /// Advertised in host candidates instead of the local interface address.
    pub public_ip: Option<String>,
    pub stun_servers: Vec<String>,
}

pub struct WebRtcEngine {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcEngine {
    pub fn new(settings: &IceSettings) -> Self {
        let mut setting = SettingEngine::default();
        if let Some((start, end)) = settings.port_range {
            match EphemeralUDP::new(start, end) {
                Ok(ephemeral) => setting.set_udp_network(UDPNetwork::Ephemeral(ephemeral)),
                Err(err) => warn!(
                    target = "rtc",
                    port_start = start,
                    port_end = end,
                    error = %err,
                    "invalid ICE UDP port range; using defaults"
                ),
            }
        }
        if let Some(ip) = &settings.public_ip {
            setting.set_nat_1to1_ips(vec![ip.clone()], RTCIceCandidateType::Host);
        }

        let api = APIBuilder::new().with_setting_engine(setting).build();
        let ice_servers = if settings.stun_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: settings.stun_servers.clone(),
                ..Default::default()
            }]
        };
        Self { api, ice_servers }
    }

    async fn build(
        &self,
        remote: RTCSessionDescription,
        events: PeerEvents,
    ) -> Result<Arc<RTCPeerConnection>, webrtc::Error> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await?);
        let is_offer = remote.sdp_type == RTCSdpType::Offer;

        let channel_events = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let events = channel_events.clone();
            Box::pin(async move {
                install_channel(dc, events);
            })
        }));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                debug!(target = "rtc", session = %events.session(), state = %state, "peer connection state");
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                ) {
                    events.transport_closed();
                }
            })
        }));

        pc.set_remote_description(remote).await?;
        if !is_offer {
            // Nothing to answer; completion finds no local description.
            events.gathering_complete();
            return Ok(pc);
        }

        let mut gathered = pc.gathering_complete_promise().await;
        let answer = pc.create_answer(None).await?;
        pc.set_local_description(answer).await?;
        tokio::spawn(async move {
            let _ = gathered.recv().await;
            events.gathering_complete();
        });
        Ok(pc)
    }
}

#[async_trait]
impl PeerEngine for WebRtcEngine {
    async fn accept(
        &self,
        remote: SessionDescription,
        events: PeerEvents,
    ) -> Result<Arc<dyn PeerTransport>, NegotiationError> {
        let remote = remote_description(&remote)?;
        let pc = self
            .build(remote, events)
            .await
            .map_err(|err| NegotiationError::Engine(err.to_string()))?;
        Ok(Arc::new(WebRtcTransport { pc }))
    }
}

fn remote_description(desc: &SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
    let engine_err = |err: webrtc::Error| NegotiationError::Engine(err.to_string());
    match RTCSdpType::from(desc.kind.as_str()) {
        RTCSdpType::Offer => RTCSessionDescription::offer(desc.sdp.clone()).map_err(engine_err),
        RTCSdpType::Answer => RTCSessionDescription::answer(desc.sdp.clone()).map_err(engine_err),
        RTCSdpType::Pranswer => {
            RTCSessionDescription::pranswer(desc.sdp.clone()).map_err(engine_err)
        }
        RTCSdpType::Rollback | RTCSdpType::Unspecified => {
            Err(NegotiationError::UnsupportedType(desc.kind.clone()))
        }
    }
}

fn install_channel(dc: Arc<RTCDataChannel>, events: PeerEvents) {
    let conn = Arc::new(DataChannelConnection::new(dc.clone()));
    let id = conn.id();
    info!(
        target = "rtc",
        session = %events.session(),
        connection = %id,
        label = %dc.label(),
        "data channel announced"
    );
    events.channel_opened(conn);

    let message_events = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = message_events.clone();
        Box::pin(async move {
            let frame = if msg.is_string {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => Frame::Text(text),
                    Err(_) => Frame::Binary(msg.data),
                }
            } else {
                Frame::Binary(msg.data)
            };
            events.channel_message(id, frame);
        })
    }));

    dc.on_close(Box::new(move || {
        let events = events.clone();
        Box::pin(async move {
            events.channel_closed(id);
        })
    }));
}

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc.local_description().await.map(|desc| SessionDescription {
            sdp: desc.sdp,
            kind: desc.sdp_type.to_string(),
        })
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            debug!(target = "rtc", error = %err, "peer connection close failed");
        }
    }
}

/// One data channel registered as a peer-to-peer connection.
pub struct DataChannelConnection {
    id: ConnectionId,
    dc: Arc<RTCDataChannel>,
    closed: ClosedFlag,
}

impl DataChannelConnection {
    pub fn new(dc: Arc<RTCDataChannel>) -> Self {
        Self {
            id: ConnectionId::new(),
            dc,
            closed: ClosedFlag::default(),
        }
    }
}

#[async_trait]
impl Connection for DataChannelConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::PeerToPeer
    }

    async fn buffered_bytes(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn send(&self, frame: Frame) -> Result<(), ConnectionError> {
        if self.closed.is_set() {
            return Err(ConnectionError::Closed);
        }
        let sent = match frame {
            Frame::Text(text) => self.dc.send_text(text).await,
            Frame::Binary(bytes) => self.dc.send(&bytes).await,
        };
        sent.map(|_| ())
            .map_err(|err| ConnectionError::Transport(err.to_string()))
    }

    fn is_closed(&self) -> bool {
        self.closed.is_set()
    }

    fn mark_closed(&self) -> bool {
        self.closed.set()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_SDP: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

    fn desc(kind: &str) -> SessionDescription {
        SessionDescription {
            sdp: MINIMAL_SDP.into(),
            kind: kind.into(),
        }
    }

    #[test]
    fn description_types_map_to_engine_types() {
        assert_eq!(
            remote_description(&desc("offer")).unwrap().sdp_type,
            RTCSdpType::Offer
        );
        assert_eq!(
            remote_description(&desc("answer")).unwrap().sdp_type,
            RTCSdpType::Answer
        );
        assert_eq!(
            remote_description(&desc("pranswer")).unwrap().sdp_type,
            RTCSdpType::Pranswer
        );
        assert!(matches!(
            remote_description(&desc("rollback")),
            Err(NegotiationError::UnsupportedType(kind)) if kind == "rollback"
        ));
        assert!(matches!(
            remote_description(&desc("bogus")),
            Err(NegotiationError::UnsupportedType(_))
        ));
    }

    #[test]
    fn stun_servers_become_one_ice_server_entry() {
        let engine = WebRtcEngine::new(&IceSettings {
            stun_servers: vec!["stun:stun.l.google.com:19302".into()],
            ..IceSettings::default()
        });
        assert_eq!(engine.ice_servers.len(), 1);
        assert_eq!(engine.ice_servers[0].urls.len(), 1);
        assert!(WebRtcEngine::new(&IceSettings::default()).ice_servers.is_empty());
    }

    #[tokio::test]
    async fn engine_rejects_unparseable_offer_sdp() {
        let (handle, _task) = crate::event_loop::EventLoop::spawn(Default::default());
        let engine = WebRtcEngine::new(&IceSettings::default());
        let events = PeerEvents::new(crate::negotiation::SessionId::new(), handle);
        let garbage = SessionDescription {
            sdp: "not sdp".into(),
            kind: "offer".into(),
        };
        let result = engine.accept(garbage, events).await;
        assert!(matches!(result, Err(NegotiationError::Engine(_))));
    }
}
