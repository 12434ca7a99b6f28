use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::API;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;

use super::session::SpySession;
use super::{Leg, SpyError};
use crate::engine::EngineClient;

/// One spied call: both backend subscriptions plus the spectators attached
/// to them.
///
/// The source is complete once [`SpySource::connect`] returns; before that
/// no handle escapes, and a failed construction reclaims everything it
/// already built (peer connections and engine subscriptions).
pub struct SpySource {
    pub call_id: String,
    pub from_tag: String,
    pub to_tag: String,
    legs: [LegState; 2],
    sessions: RwLock<HashMap<Uuid, Arc<SpySession>>>,
    /// Bumped on every attach/detach. Fan-out readers refresh their
    /// destination snapshot only when this moves, keeping the hot path
    /// allocation-free while the spectator set is stable.
    membership: AtomicU64,
    /// Set while the source has no spectators; the idle reaper keys off it.
    idle_since: Mutex<Option<Instant>>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct LegState {
    pc: OnceLock<Arc<RTCPeerConnection>>,
    /// Subscription tag the engine handed back; needed to unsubscribe.
    sub_tag: OnceLock<String>,
}

impl SpySource {
    /// Subscribe to both legs of `call_id` and return the completed source.
    ///
    /// `on_dead` fires when either backend peer connection reaches `failed`
    /// or `closed`; the owner is expected to run source cleanup then.
    pub async fn connect(
        api: &API,
        engine: &EngineClient,
        call_id: String,
        from_tag: String,
        to_tag: String,
        on_dead: impl Fn() + Clone + Send + Sync + 'static,
    ) -> Result<Arc<Self>, SpyError> {
        let source = Arc::new(Self {
            call_id,
            from_tag,
            to_tag,
            legs: [LegState::default(), LegState::default()],
            sessions: RwLock::new(HashMap::new()),
            membership: AtomicU64::new(0),
            idle_since: Mutex::new(Some(Instant::now())),
            cancel: CancellationToken::new(),
        });

        for leg in Leg::BOTH {
            if let Err(err) =
                Self::subscribe_leg(&source, api, engine, leg, on_dead.clone()).await
            {
                warn!(
                    call_id = %source.call_id,
                    leg = leg.label(),
                    "Backend subscription failed: {err}"
                );
                source.release(engine).await;
                return Err(err);
            }
        }
        Ok(source)
    }

    /// Set up one leg: peer connection, handlers, `subscribe request`,
    /// engine offer applied, gathered local answer, `subscribe answer`.
    async fn subscribe_leg(
        source: &Arc<Self>,
        api: &API,
        engine: &EngineClient,
        leg: Leg,
        on_dead: impl Fn() + Send + Sync + 'static,
    ) -> Result<(), SpyError> {
        let pc = Arc::new(api.new_peer_connection(RTCConfiguration::default()).await?);
        // Stored before anything can fail so release() reclaims it.
        let _ = source.legs[leg.index()].pc.set(Arc::clone(&pc));

        let weak = Arc::downgrade(source);
        pc.on_track(Box::new(move |track, _, _| {
            if track.kind() != RTPCodecType::Audio {
                return Box::pin(async {});
            }
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(source) = weak.upgrade() {
                    info!(
                        call_id = %source.call_id,
                        leg = leg.label(),
                        ssrc = track.ssrc(),
                        "Backend audio track up"
                    );
                    let cancel = source.cancel.clone();
                    tokio::spawn(fan_out(Arc::downgrade(&source), leg, track, cancel));
                }
            })
        }));

        let call_id = source.call_id.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            debug!(%call_id, leg = leg.label(), ?state, "Backend peer state changed");
            if matches!(
                state,
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
            ) {
                on_dead();
            }
            Box::pin(async {})
        }));

        let leg_tag = match leg {
            Leg::From => &source.from_tag,
            Leg::To => &source.to_tag,
        };
        let sub = engine.subscribe(&source.call_id, leg_tag).await?;
        let _ = source.legs[leg.index()].sub_tag.set(sub.to_tag.clone());

        let offer = RTCSessionDescription::offer(sub.sdp)?;
        pc.set_remote_description(offer).await?;
        let answer = pc.create_answer(None).await?;
        let mut gather_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(answer).await?;
        // Non-trickle at this boundary: the engine gets one complete answer.
        let _ = gather_complete.recv().await;
        let local = pc
            .local_description()
            .await
            .ok_or(SpyError::MissingLocalDescription)?;

        let sdp = rewrite_rejected_audio(&local.sdp);
        engine
            .subscribe_answer(&source.call_id, &sdp, &sub.to_tag)
            .await?;
        Ok(())
    }

    /// Attach a spectator. Fan-out picks it up from the next packet on.
    pub async fn attach(&self, session: Arc<SpySession>) {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.id, session);
        *self.idle_since.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.membership.fetch_add(1, Ordering::Release);
    }

    /// Detach a spectator. Returns it if it was attached.
    pub async fn detach(&self, id: Uuid) -> Option<Arc<SpySession>> {
        let mut sessions = self.sessions.write().await;
        let removed = sessions.remove(&id);
        if removed.is_some() {
            if sessions.is_empty() {
                *self.idle_since.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some(Instant::now());
            }
            self.membership.fetch_add(1, Ordering::Release);
        }
        removed
    }

    pub async fn session_ids(&self) -> Vec<Uuid> {
        self.sessions.read().await.keys().copied().collect()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// How long the source has been spectator-less, if it is.
    pub fn idle_for(&self) -> Option<Duration> {
        self.idle_since
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|since| since.elapsed())
    }

    /// Stop both fan-out readers at their next iteration boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Close both backend peer connections and release both engine
    /// subscriptions (best effort). Safe to call on a half-built source.
    pub async fn release(&self, engine: &EngineClient) {
        self.cancel.cancel();
        for leg in Leg::BOTH {
            let slot = &self.legs[leg.index()];
            if let Some(pc) = slot.pc.get() {
                if let Err(err) = pc.close().await {
                    debug!(
                        call_id = %self.call_id,
                        leg = leg.label(),
                        "Closing backend peer failed: {err}"
                    );
                }
            }
            if let Some(sub_tag) = slot.sub_tag.get() {
                let leg_tag = match leg {
                    Leg::From => &self.from_tag,
                    Leg::To => &self.to_tag,
                };
                if let Err(err) = engine.unsubscribe(&self.call_id, leg_tag, sub_tag).await {
                    warn!(
                        call_id = %self.call_id,
                        leg = leg.label(),
                        "Unsubscribe failed: {err}"
                    );
                }
            }
        }
    }

    /// Refresh `dests` from the current spectator set if membership moved
    /// since `seen`. Factored out of [`fan_out`] so the refresh rule is
    /// testable without live tracks.
    async fn snapshot_into(
        &self,
        leg: Leg,
        seen: &mut u64,
        dests: &mut Vec<Arc<TrackLocalStaticRTP>>,
    ) {
        let current = self.membership.load(Ordering::Acquire);
        if current == *seen {
            return;
        }
        let sessions = self.sessions.read().await;
        dests.clear();
        dests.extend(sessions.values().map(|s| Arc::clone(s.track(leg))));
        *seen = current;
    }
}

/// The read loop behind one backend track: read one RTP packet, write it to
/// every spectator track on the same leg. Exits on read error (terminal for
/// the leg), source cancellation, or the source being dropped.
async fn fan_out(
    source: Weak<SpySource>,
    leg: Leg,
    track: Arc<TrackRemote>,
    cancel: CancellationToken,
) {
    let mut dests: Vec<Arc<TrackLocalStaticRTP>> = Vec::new();
    let mut seen = u64::MAX;

    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => break,
            result = track.read_rtp() => match result {
                Ok((packet, _)) => packet,
                Err(err) => {
                    debug!(leg = leg.label(), "Backend track read ended: {err}");
                    break;
                }
            },
        };

        let Some(source) = source.upgrade() else { break };
        source.snapshot_into(leg, &mut seen, &mut dests).await;
        drop(source);

        for dest in &dests {
            if let Err(err) = dest.write_rtp(&packet).await {
                // A closed spectator is reaped by its own state handler;
                // nothing to do here.
                if err != webrtc::Error::ErrClosedPipe {
                    debug!(leg = leg.label(), "Spectator write failed: {err}");
                }
            }
        }
    }
    debug!(leg = leg.label(), "Fan-out reader stopped");
}

/// The engine drops a subscription whose answer rejects the audio section.
/// Port 9 (discard) keeps a section that would otherwise carry `m=audio 0`
/// alive; everything else passes through byte-identical.
fn rewrite_rejected_audio(sdp: &str) -> String {
    sdp.split_inclusive('\n')
        .map(|line| {
            if let Some(rest) = line.strip_prefix("m=audio 0 ") {
                format!("m=audio 9 {rest}")
            } else {
                line.to_string()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebrtcConfig;
    use crate::rtc;

    #[test]
    fn rewrites_rejected_audio_line_only() {
        let sdp = "v=0\r\n\
                   o=- 1 1 IN IP4 127.0.0.1\r\n\
                   m=audio 0 UDP/TLS/RTP/SAVPF 0\r\n\
                   a=mid:0\r\n";
        let rewritten = rewrite_rejected_audio(sdp);
        assert!(rewritten.contains("m=audio 9 UDP/TLS/RTP/SAVPF 0\r\n"));
        assert_eq!(
            rewritten.replace("m=audio 9 ", "m=audio 0 "),
            sdp,
            "everything but the rejected port must be untouched"
        );
    }

    #[test]
    fn leaves_live_audio_sections_alone() {
        let sdp = "m=audio 9 UDP/TLS/RTP/SAVPF 0\r\nm=audio 30000 RTP/AVP 0\r\n";
        assert_eq!(rewrite_rejected_audio(sdp), sdp);
    }

    #[test]
    fn rewrite_handles_final_line_without_newline() {
        assert_eq!(
            rewrite_rejected_audio("m=audio 0 RTP/AVP 0"),
            "m=audio 9 RTP/AVP 0"
        );
    }

    fn bare_source() -> Arc<SpySource> {
        Arc::new(SpySource {
            call_id: "call".into(),
            from_tag: "a".into(),
            to_tag: "b".into(),
            legs: [LegState::default(), LegState::default()],
            sessions: RwLock::new(HashMap::new()),
            membership: AtomicU64::new(0),
            idle_since: Mutex::new(Some(Instant::now())),
            cancel: CancellationToken::new(),
        })
    }

    async fn spectator() -> Arc<SpySession> {
        let apis = rtc::build(&WebrtcConfig::default()).unwrap();
        let (session, _) = SpySession::connect(&apis.browser, |_| {}).await.unwrap();
        session
    }

    #[tokio::test]
    async fn snapshot_refreshes_only_on_membership_change() {
        let source = bare_source();
        let mut seen = u64::MAX;
        let mut dests = Vec::new();

        source.snapshot_into(Leg::From, &mut seen, &mut dests).await;
        assert!(dests.is_empty());
        let settled = seen;

        // No membership movement: the snapshot must not be rebuilt.
        source.snapshot_into(Leg::From, &mut seen, &mut dests).await;
        assert_eq!(seen, settled);

        let session = spectator().await;
        source.attach(Arc::clone(&session)).await;
        source.snapshot_into(Leg::From, &mut seen, &mut dests).await;
        assert_eq!(dests.len(), 1);
        assert!(Arc::ptr_eq(&dests[0], session.track(Leg::From)));
        session.close().await;
    }

    #[tokio::test]
    async fn leave_then_join_with_equal_cardinality_still_refreshes() {
        let source = bare_source();
        let first = spectator().await;
        source.attach(Arc::clone(&first)).await;

        let mut seen = u64::MAX;
        let mut dests = Vec::new();
        source.snapshot_into(Leg::To, &mut seen, &mut dests).await;
        assert_eq!(dests.len(), 1);

        // Swap spectators between two packets: cardinality is unchanged but
        // the destination set is not.
        let second = spectator().await;
        source.detach(first.id).await;
        source.attach(Arc::clone(&second)).await;

        source.snapshot_into(Leg::To, &mut seen, &mut dests).await;
        assert_eq!(dests.len(), 1);
        assert!(Arc::ptr_eq(&dests[0], second.track(Leg::To)));

        first.close().await;
        second.close().await;
    }

    #[tokio::test]
    async fn idle_tracking_follows_membership() {
        let source = bare_source();
        assert!(source.idle_for().is_some());

        let session = spectator().await;
        source.attach(Arc::clone(&session)).await;
        assert!(source.idle_for().is_none());

        source.detach(session.id).await;
        assert!(source.idle_for().is_some());
        session.close().await;
    }

    #[tokio::test]
    async fn detach_of_unknown_session_is_harmless() {
        let source = bare_source();
        let before = source.membership.load(Ordering::Acquire);
        assert!(source.detach(Uuid::new_v4()).await.is_none());
        assert_eq!(source.membership.load(Ordering::Acquire), before);
    }
}
