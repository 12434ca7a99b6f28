use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;
use webrtc::api::media_engine::MIME_TYPE_PCMU;
use webrtc::api::API;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use super::{Leg, SpyError};

/// One spectator: a browser peer connection carrying both legs of the call
/// as outbound PCMU tracks. The tracks are plain RTP pass-throughs; the
/// fan-out readers write into them directly.
pub struct SpySession {
    pub id: Uuid,
    pc: Arc<RTCPeerConnection>,
    track_from: Arc<TrackLocalStaticRTP>,
    track_to: Arc<TrackLocalStaticRTP>,
}

/// Outbound µ-law track. Declaring PCMU here is what guarantees the engine's
/// packets reach the browser without recoding.
fn pcmu_track(track_id: &str) -> Arc<TrackLocalStaticRTP> {
    Arc::new(TrackLocalStaticRTP::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_PCMU.to_string(),
            clock_rate: 8000,
            channels: 1,
            ..Default::default()
        },
        track_id.to_string(),
        "spy".to_string(),
    ))
}

impl SpySession {
    /// Create the browser peer connection with both outbound tracks and
    /// produce the server's SDP offer. ICE gathering is awaited, so the
    /// offer carries the complete candidate set and the browser can reply
    /// with a single answer.
    ///
    /// `on_terminal` fires (with the session id) when the peer connection
    /// reaches `failed` or `closed`.
    pub async fn connect(
        api: &API,
        on_terminal: impl Fn(Uuid) + Send + Sync + 'static,
    ) -> Result<(Arc<Self>, String), SpyError> {
        let pc = Arc::new(api.new_peer_connection(RTCConfiguration::default()).await?);
        let id = Uuid::new_v4();

        let track_from = pcmu_track("audio_from");
        let track_to = pcmu_track("audio_to");
        if let Err(err) = async {
            pc.add_track(Arc::clone(&track_from) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            pc.add_track(Arc::clone(&track_to) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            Ok::<_, webrtc::Error>(())
        }
        .await
        {
            let _ = pc.close().await;
            return Err(err.into());
        }

        pc.on_peer_connection_state_change(Box::new(move |state| {
            debug!(session_id = %id, ?state, "Spectator peer state changed");
            if matches!(
                state,
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
            ) {
                on_terminal(id);
            }
            Box::pin(async {})
        }));

        let offer_sdp = match Self::gather_offer(&pc).await {
            Ok(sdp) => sdp,
            Err(err) => {
                let _ = pc.close().await;
                return Err(err);
            }
        };

        let session = Arc::new(Self {
            id,
            pc,
            track_from,
            track_to,
        });
        Ok((session, offer_sdp))
    }

    async fn gather_offer(pc: &Arc<RTCPeerConnection>) -> Result<String, SpyError> {
        let offer = pc.create_offer(None).await?;
        let mut gather_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(offer).await?;
        let _ = gather_complete.recv().await;
        let local = pc
            .local_description()
            .await
            .ok_or(SpyError::MissingLocalDescription)?;
        Ok(local.sdp)
    }

    /// Apply the browser's SDP answer.
    pub async fn apply_answer(&self, sdp: String) -> Result<(), SpyError> {
        let answer = RTCSessionDescription::answer(sdp)?;
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }

    pub fn track(&self, leg: Leg) -> &Arc<TrackLocalStaticRTP> {
        match leg {
            Leg::From => &self.track_from,
            Leg::To => &self.track_to,
        }
    }

    pub async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            debug!(session_id = %self.id, "Closing spectator peer failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebrtcConfig;
    use crate::rtc;

    #[tokio::test]
    async fn offer_carries_two_audio_sections() {
        let apis = rtc::build(&WebrtcConfig::default()).unwrap();
        let (session, offer) = SpySession::connect(&apis.browser, |_| {}).await.unwrap();
        assert!(offer.starts_with("v=0"));
        assert_eq!(offer.matches("m=audio").count(), 2);
        assert!(offer.contains("PCMU/8000"));
        session.close().await;
    }

    #[tokio::test]
    async fn bogus_answer_is_rejected() {
        let apis = rtc::build(&WebrtcConfig::default()).unwrap();
        let (session, _) = SpySession::connect(&apis.browser, |_| {}).await.unwrap();
        assert!(session
            .apply_answer("not an sdp".to_string())
            .await
            .is_err());
        session.close().await;
    }

    #[tokio::test]
    async fn sessions_get_distinct_ids() {
        let apis = rtc::build(&WebrtcConfig::default()).unwrap();
        let (a, _) = SpySession::connect(&apis.browser, |_| {}).await.unwrap();
        let (b, _) = SpySession::connect(&apis.browser, |_| {}).await.unwrap();
        assert_ne!(a.id, b.id);
        a.close().await;
        b.close().await;
    }
}
