use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use rtpscope_protocol::ng;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use super::session::SpySession;
use super::source::SpySource;
use super::SpyError;
use crate::engine::EngineClient;
use crate::rtc::RtcApis;

/// Counters exposed on `/metrics`.
#[derive(Default)]
pub struct SpyMetrics {
    pub sessions_active: AtomicI64,
    pub sessions_total: AtomicU64,
    pub sources_active: AtomicI64,
    pub sources_total: AtomicU64,
}

/// What a successful `POST /spy/{call_id}` hands back to the browser.
#[derive(Debug)]
pub struct SpyOffer {
    pub session_id: Uuid,
    pub sdp: String,
    pub from_tag: String,
    pub to_tag: String,
}

struct SessionSlot {
    call_id: String,
    session: Arc<SpySession>,
}

/// Registry and lifecycle coordinator for the spy subsystem.
///
/// Owns the source table (call id → source) and the flat session table
/// (session id → session) and is the only module that mutates either.
/// Cleanup always runs service → source → session, never the reverse.
pub struct SpyService {
    engine: Arc<EngineClient>,
    rtc: RtcApis,
    /// Held across source construction, engine I/O included. That is the
    /// single-flight guarantee: concurrent spectators of a fresh call wait
    /// here and then find the source the first one built.
    sources: Mutex<HashMap<String, Arc<SpySource>>>,
    /// Flat table for O(1) answer lookup. Locked only for map access.
    sessions: RwLock<HashMap<Uuid, SessionSlot>>,
    /// Handle to ourselves for the peer-connection state handlers; they
    /// must not keep the service alive.
    weak: Weak<SpyService>,
    pub metrics: SpyMetrics,
}

impl SpyService {
    pub fn new(engine: Arc<EngineClient>, rtc: RtcApis) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            engine,
            rtc,
            sources: Mutex::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            weak: weak.clone(),
            metrics: SpyMetrics::default(),
        })
    }

    /// Discover the two call legs via `query`, ordered by creation time
    /// (ties break on the tag string).
    pub async fn detect_tags(&self, call_id: &str) -> Result<(String, String), SpyError> {
        let reply = self.engine.query_call(call_id).await?;
        let tags = ng::want_dict(&reply, "tags")?;
        let mut entries: Vec<(i64, String)> = Vec::new();
        for (tag, details) in tags.as_dict().into_iter().flatten() {
            let created = ng::want_int(details, "created")?;
            entries.push((created, String::from_utf8_lossy(tag).into_owned()));
        }
        entries.sort();
        let mut entries = entries.into_iter();
        match (entries.next(), entries.next()) {
            (Some((_, from)), Some((_, to))) => Ok((from, to)),
            _ => Err(SpyError::NotEnoughTags),
        }
    }

    /// Create a spectator session on `call_id`, creating the spy source
    /// first if this is the call's first spectator.
    pub async fn start_session(
        &self,
        call_id: &str,
        from_tag: Option<String>,
        to_tag: Option<String>,
    ) -> Result<SpyOffer, SpyError> {
        let (from_tag, to_tag) = match (from_tag, to_tag) {
            (Some(from), Some(to)) if !from.is_empty() && !to.is_empty() => (from, to),
            _ => self.detect_tags(call_id).await?,
        };

        let source = self.get_or_create_source(call_id, from_tag, to_tag).await?;

        let service = self.weak.clone();
        let (session, offer_sdp) = SpySession::connect(&self.rtc.browser, move |session_id| {
            if let Some(service) = service.upgrade() {
                tokio::spawn(async move { service.cleanup_session(session_id).await });
            }
        })
        .await?;

        source.attach(Arc::clone(&session)).await;
        self.sessions.write().await.insert(
            session.id,
            SessionSlot {
                call_id: call_id.to_string(),
                session: Arc::clone(&session),
            },
        );
        self.metrics.sessions_active.fetch_add(1, Ordering::Relaxed);
        self.metrics.sessions_total.fetch_add(1, Ordering::Relaxed);

        let spectators = source.session_count().await;
        info!(
            %call_id,
            session_id = %session.id,
            spectators,
            "Spy session created"
        );

        Ok(SpyOffer {
            session_id: session.id,
            sdp: offer_sdp,
            from_tag: source.from_tag.clone(),
            to_tag: source.to_tag.clone(),
        })
    }

    async fn get_or_create_source(
        &self,
        call_id: &str,
        from_tag: String,
        to_tag: String,
    ) -> Result<Arc<SpySource>, SpyError> {
        let mut sources = self.sources.lock().await;
        if let Some(source) = sources.get(call_id) {
            return Ok(Arc::clone(source));
        }

        let service = self.weak.clone();
        let dead_call_id = call_id.to_string();
        let on_dead = move || {
            if let Some(service) = service.upgrade() {
                let call_id = dead_call_id.clone();
                tokio::spawn(async move { service.cleanup_source(&call_id).await });
            }
        };

        let source = SpySource::connect(
            &self.rtc.backend,
            &self.engine,
            call_id.to_string(),
            from_tag,
            to_tag,
            on_dead,
        )
        .await?;

        sources.insert(call_id.to_string(), Arc::clone(&source));
        self.metrics.sources_active.fetch_add(1, Ordering::Relaxed);
        self.metrics.sources_total.fetch_add(1, Ordering::Relaxed);
        info!(
            %call_id,
            from_tag = %source.from_tag,
            to_tag = %source.to_tag,
            "Spy source created"
        );
        Ok(source)
    }

    /// Apply a browser answer to the session it belongs to.
    pub async fn handle_answer(&self, session_id: Uuid, sdp: String) -> Result<(), SpyError> {
        let session = {
            let sessions = self.sessions.read().await;
            sessions
                .get(&session_id)
                .map(|slot| Arc::clone(&slot.session))
        };
        match session {
            Some(session) => session.apply_answer(sdp).await,
            None => Err(SpyError::SessionNotFound),
        }
    }

    /// Remove one spectator from both tables and close its peer connection.
    /// Idempotent; the spectator-less source stays alive for the idle
    /// reaper.
    pub async fn cleanup_session(&self, session_id: Uuid) {
        let Some(slot) = self.sessions.write().await.remove(&session_id) else {
            return;
        };
        self.metrics.sessions_active.fetch_sub(1, Ordering::Relaxed);

        let source = self.sources.lock().await.get(&slot.call_id).cloned();
        if let Some(source) = source {
            source.detach(session_id).await;
        }
        slot.session.close().await;
        info!(%session_id, call_id = %slot.call_id, "Spy session removed");
    }

    /// Remove a source from the table and tear it down: cancel the fan-out
    /// readers, drop every spectator, close the backend peer connections,
    /// and release the engine subscriptions. Idempotent.
    pub async fn cleanup_source(&self, call_id: &str) {
        let Some(source) = self.sources.lock().await.remove(call_id) else {
            return;
        };
        self.metrics.sources_active.fetch_sub(1, Ordering::Relaxed);
        self.destroy_source(source).await;
    }

    async fn destroy_source(&self, source: Arc<SpySource>) {
        source.cancel();
        for session_id in source.session_ids().await {
            // The table guard must not be held across the peer close below.
            let Some(slot) = self.sessions.write().await.remove(&session_id) else {
                continue;
            };
            self.metrics.sessions_active.fetch_sub(1, Ordering::Relaxed);
            source.detach(session_id).await;
            slot.session.close().await;
        }
        source.release(&self.engine).await;
        info!(call_id = %source.call_id, "Spy source destroyed");
    }

    /// Tear down sources that have been spectator-less longer than
    /// `idle_timeout`, releasing their engine subscriptions.
    pub async fn reap_idle(&self, idle_timeout: Duration) {
        let stale: Vec<Arc<SpySource>> = {
            let sources = self.sources.lock().await;
            sources
                .values()
                .filter(|source| source.idle_for().is_some_and(|idle| idle > idle_timeout))
                .cloned()
                .collect()
        };
        for source in stale {
            warn!(
                call_id = %source.call_id,
                "Reaping idle spy source (no spectators for > {idle_timeout:?})"
            );
            self.cleanup_source(&source.call_id).await;
        }
    }

    /// Drain every remaining source. Called once on process shutdown so the
    /// engine is not left holding subscriptions it has to time out.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<SpySource>> = {
            let mut sources = self.sources.lock().await;
            sources.drain().map(|(_, source)| source).collect()
        };
        if drained.is_empty() {
            return;
        }
        info!(count = drained.len(), "Releasing remaining spy sources");
        for source in drained {
            self.metrics.sources_active.fetch_sub(1, Ordering::Relaxed);
            self.destroy_source(source).await;
        }
    }

    pub async fn source_count(&self) -> usize {
        self.sources.lock().await.len()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
