use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use zbus::interface;

use passage_core::{AccessEngine, Detection, GrayFrame, Precision};

use crate::config::Config;
use crate::rate_limiter::AttemptLimiter;
use crate::sessions::SessionRegistry;
use crate::store::{AccessAttempt, AccessStore};

/// Shared state accessible by D-Bus method handlers.
pub struct AppState {
    pub config: Config,
    pub store: AccessStore,
    pub rate_limiter: AttemptLimiter,
    pub sessions: SessionRegistry,
}

/// D-Bus interface for the Passage access-control daemon.
///
/// Bus name: org.passage.Access1
/// Object path: /org/passage/Access1
///
/// The engine sits behind a read/write lock: validations share read access
/// against a stable index snapshot, while enrollment, removal and reset are
/// serialized as exclusive writers.
pub struct PassageService {
    pub engine: Arc<RwLock<AccessEngine>>,
    pub state: Arc<Mutex<AppState>>,
}

/// Retrieve the UID of the D-Bus peer identified by `sender_str` (a unique bus name).
async fn get_caller_uid(sender_str: &str, conn: &zbus::Connection) -> zbus::fdo::Result<u32> {
    let dbus_proxy = zbus::fdo::DBusProxy::new(conn)
        .await
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
    let bus_name = zbus::names::BusName::try_from(sender_str)
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
    dbus_proxy
        .get_connection_unix_user(bus_name)
        .await
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn parse_detections(json: &str) -> zbus::fdo::Result<Vec<Detection>> {
    serde_json::from_str(json)
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("bad detections payload: {e}")))
}

impl PassageService {
    /// Validate that the caller may invoke an administrative method.
    ///
    /// On the system bus only root (UID 0) qualifies. On the session bus
    /// (development mode) the check is skipped — all callers share one user.
    async fn require_admin(
        &self,
        header: &zbus::message::Header<'_>,
        conn: &zbus::Connection,
    ) -> zbus::fdo::Result<()> {
        let session_bus = self.state.lock().await.config.session_bus;
        if session_bus {
            return Ok(());
        }

        let sender = header
            .sender()
            .ok_or_else(|| zbus::fdo::Error::Failed("no sender in message".to_string()))?;
        let caller_uid = get_caller_uid(sender.as_str(), conn).await?;
        if caller_uid != 0 {
            tracing::warn!(caller_uid, "administrative method refused");
            return Err(zbus::fdo::Error::AccessDenied(
                "administrative methods require root".to_string(),
            ));
        }
        Ok(())
    }
}

#[interface(name = "org.passage.Access1")]
impl PassageService {
    /// Register a new user from an enrollment frame.
    ///
    /// The best detection (high-precision confidence gate) supplies the
    /// embedding. Returns the new user id. If index enrollment fails after
    /// the user row was created, the row is rolled back — the registration
    /// is not committed.
    #[allow(clippy::too_many_arguments)]
    async fn register_user(
        &self,
        name: &str,
        email: &str,
        frame: Vec<u8>,
        width: u32,
        height: u32,
        detections_json: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<i64> {
        self.require_admin(&header, conn).await?;
        tracing::info!(name, "register_user requested");

        let detections = parse_detections(detections_json)?;
        let gray = GrayFrame::new(&frame, width, height).ok_or_else(|| {
            zbus::fdo::Error::InvalidArgs("frame buffer shorter than width*height".to_string())
        })?;

        let best = {
            let engine = self.engine.read().await;
            engine.best_detection(&gray, detections, Precision::High)
        };
        let Some(detection) = best else {
            return Err(zbus::fdo::Error::Failed(
                "no usable face in enrollment frame".to_string(),
            ));
        };

        let store = self.state.lock().await.store.clone();
        let user_id = store
            .insert_user(name, email, &detection.embedding)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "register_user: store insert failed");
                zbus::fdo::Error::Failed(e.to_string())
            })?;

        let slot = {
            let mut engine = self.engine.write().await;
            match engine.enroll(&detection.embedding, user_id) {
                Ok(slot) => slot,
                Err(e) => {
                    tracing::error!(error = %e, user_id, "register_user: enrollment failed, rolling back");
                    let _ = store.delete_user(user_id).await;
                    return Err(zbus::fdo::Error::Failed(e.to_string()));
                }
            }
        };

        store.update_slot(user_id, slot).await.map_err(|e| {
            tracing::error!(error = %e, "register_user: slot update failed");
            zbus::fdo::Error::Failed(e.to_string())
        })?;

        tracing::info!(user_id, slot, quality = detection.quality, "user registered");
        Ok(user_id)
    }

    /// Validate one frame from a camera stream.
    ///
    /// Returns a JSON decision: `{success, access_granted, liveness_passed,
    /// confidence, user_id, message}`. Every attempt lands in the audit log;
    /// denial reasons are never surfaced to the subject beyond a generic
    /// message.
    async fn validate(
        &self,
        stream_id: &str,
        frame: Vec<u8>,
        width: u32,
        height: u32,
        detections_json: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::debug!(stream_id, "validate requested");

        {
            let mut state = self.state.lock().await;
            state.rate_limiter.check(stream_id).map_err(|msg| {
                tracing::warn!(stream_id, "validate: rate limited");
                zbus::fdo::Error::Failed(msg)
            })?;
        }

        let detections = parse_detections(detections_json)?;
        let gray = GrayFrame::new(&frame, width, height).ok_or_else(|| {
            zbus::fdo::Error::InvalidArgs("frame buffer shorter than width*height".to_string())
        })?;

        // Read-locked engine: gate detections, advance the stream's liveness
        // session, fuse.
        let decision = {
            let engine = self.engine.read().await;
            match engine.best_detection(&gray, detections, Precision::Default) {
                None => None,
                Some(detection) => {
                    let mut state = self.state.lock().await;
                    let session = state.sessions.session_mut(stream_id);
                    let live =
                        session.add_frame(&gray, &detection.bbox, detection.landmarks.as_deref());
                    Some(engine.decide(Some(&detection), live).map_err(|e| {
                        tracing::error!(error = %e, "validate: decision failed");
                        zbus::fdo::Error::Failed(e.to_string())
                    })?)
                }
            }
        };

        // Record the outcome: limiter bookkeeping, audit log, response body.
        let store = {
            let mut state = self.state.lock().await;
            match &decision {
                Some(d) if d.granted => state.rate_limiter.record_granted(stream_id),
                _ => state.rate_limiter.record_denial(stream_id),
            }
            state.store.clone()
        };

        let response = match decision {
            None => {
                store
                    .log_access(AccessAttempt {
                        user_id: None,
                        confidence: None,
                        access_granted: false,
                        liveness_passed: false,
                        stream_id,
                        error_message: Some("no usable face detection"),
                    })
                    .await
                    .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

                serde_json::json!({
                    "success": false,
                    "access_granted": false,
                    "liveness_passed": false,
                    "confidence": 0.0,
                    "user_id": null,
                    "message": "access denied",
                })
            }
            Some(d) => {
                store
                    .log_access(AccessAttempt {
                        user_id: d.identity,
                        confidence: d.identity.map(|_| d.confidence as f64),
                        access_granted: d.granted,
                        liveness_passed: d.liveness_passed,
                        stream_id,
                        error_message: None,
                    })
                    .await
                    .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

                let message = match (d.granted, d.identity) {
                    (true, Some(user_id)) => {
                        store.record_passage(user_id).await.ok();
                        match store.user_name(user_id).await {
                            Ok(Some(name)) => format!("access granted: {name}"),
                            _ => "access granted".to_string(),
                        }
                    }
                    (true, None) => "access granted".to_string(),
                    (false, _) => "access denied".to_string(),
                };

                serde_json::json!({
                    "success": true,
                    "access_granted": d.granted,
                    "liveness_passed": d.liveness_passed,
                    "confidence": d.confidence,
                    "user_id": d.identity,
                    "message": message,
                })
            }
        };

        tracing::info!(
            stream_id,
            granted = response["access_granted"].as_bool().unwrap_or(false),
            "validate complete"
        );
        Ok(response.to_string())
    }

    /// Discard liveness history for a stream (new subject at the door).
    async fn reset_session(&self, stream_id: &str) -> zbus::fdo::Result<bool> {
        let mut state = self.state.lock().await;
        Ok(state.sessions.reset(stream_id))
    }

    /// Remove a registered user and tombstone their index slot.
    async fn remove_user(
        &self,
        user_id: i64,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<bool> {
        self.require_admin(&header, conn).await?;
        tracing::info!(user_id, "remove_user requested");

        let store = self.state.lock().await.store.clone();
        let Some(slot) = store
            .remove_user(user_id)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?
        else {
            tracing::warn!(user_id, "remove_user: not found");
            return Ok(false);
        };

        if slot >= 0 {
            let mut engine = self.engine.write().await;
            engine
                .remove_identity(slot as u64)
                .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        }

        tracing::info!(user_id, slot, "user removed");
        Ok(true)
    }

    /// Clear the identity index and the user registry.
    async fn reset_index(
        &self,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<()> {
        self.require_admin(&header, conn).await?;
        tracing::warn!("reset_index requested");

        {
            let mut engine = self.engine.write().await;
            engine
                .reset_index()
                .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        }

        let store = self.state.lock().await.store.clone();
        store
            .clear_users()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

        tracing::info!("index and user registry cleared");
        Ok(())
    }

    /// Rebuild the identity index from the stored user embeddings.
    ///
    /// Drops orphaned vectors accumulated by removals and reassigns fresh
    /// slot ids. Returns the number of re-enrolled users.
    async fn rebuild_index(
        &self,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<u32> {
        self.require_admin(&header, conn).await?;
        tracing::info!("rebuild_index requested");

        let store = self.state.lock().await.store.clone();
        let embeddings = store
            .active_embeddings()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

        let slots = {
            let mut engine = self.engine.write().await;
            engine
                .reset_index()
                .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
            let mut slots = Vec::with_capacity(embeddings.len());
            for (user_id, embedding) in &embeddings {
                let slot = engine
                    .enroll(embedding, *user_id)
                    .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
                slots.push((*user_id, slot));
            }
            slots
        };

        for (user_id, slot) in &slots {
            store
                .update_slot(*user_id, *slot)
                .await
                .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        }

        tracing::info!(users = slots.len(), "index rebuilt");
        Ok(slots.len() as u32)
    }

    /// List registered users as JSON (metadata only, no embeddings).
    async fn list_users(&self) -> zbus::fdo::Result<String> {
        let store = self.state.lock().await.store.clone();
        let users = store
            .list_users()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        serde_json::to_string(&users).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Recent audit log entries as JSON, newest first.
    async fn recent_logs(&self, limit: u32) -> zbus::fdo::Result<String> {
        let store = self.state.lock().await.store.clone();
        let logs = store
            .recent_logs(limit)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        serde_json::to_string(&logs).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Return daemon status information as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let engine_stats = {
            let engine = self.engine.read().await;
            engine.stats()
        };

        let (store, sessions) = {
            let state = self.state.lock().await;
            (state.store.clone(), state.sessions.len())
        };
        let user_count = store.count_users().await.unwrap_or(0);
        let passage = store.passage_stats().await.ok();

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "users_registered": user_count,
            "index": engine_stats,
            "active_sessions": sessions,
            "passages": passage,
        })
        .to_string())
    }
}
