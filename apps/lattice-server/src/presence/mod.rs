//! Presence and status transition engine.
//!
//! Status rows obey three invariants: `prev_status` carries the status a
//! timed DND interrupted or, on an offline row, a pending DND
//! restoration; `dnd_end_time` is nonzero only for a timed DND and the
//! offline row it was demoted to; `manual` is never true while online.
//! Manual statuses are protected from automatic transitions; DND and
//! out-of-office are never auto-promoted.

pub mod logs;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::model::event::{event_type, Broadcast};
use crate::model::status_log::{StatusLogKind, StatusLogReason, DEVICE_API};
use crate::model::{
    Session, Status, StatusLogEntry, UserStatus, WebSocketEvent, DND_EXPIRY_INTERVAL_SECS,
    SESSION_ACTIVITY_TIMEOUT_MS, STATUS_MIN_UPDATE_MS,
};
use crate::model::request::PresenceIndicator;
use crate::model::{ClusterEvent, ClusterMessage, ClusterSendType};
use crate::PlatformService;

/// Capacity of the queued-offline channel.
pub const STATUS_UPDATE_BUFFER: usize = 256;
/// Queued updates are flushed early once this many are pending.
const FLUSH_THRESHOLD: usize = STATUS_UPDATE_BUFFER / 8;
/// Flush cadence for the queued-offline batcher.
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// One queued offline transition.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub user_id: String,
    pub manual: bool,
}

impl PlatformService {
    fn statuses_enabled(&self) -> bool {
        self.config().enable_user_statuses
    }

    // --- lookups ---

    pub fn get_status_from_cache(&self, user_id: &str) -> Option<Status> {
        self.status_cache().get(user_id)
    }

    pub async fn get_status(&self, user_id: &str) -> Result<Status, crate::error::AppError> {
        if let Some(status) = self.status_cache().get(user_id) {
            return Ok(status);
        }
        let status = self.stores.status.get(user_id).await?;
        self.add_status_cache_skip_cluster_send(status.clone());
        Ok(status)
    }

    /// Statuses for a set of users, backfilling cache misses from the
    /// store. Users with no stored status default to offline.
    pub async fn get_user_statuses_by_ids(
        &self,
        user_ids: &[String],
    ) -> Result<Vec<Status>, crate::error::AppError> {
        let mut found: HashMap<String, Status> = HashMap::new();
        let mut missing: Vec<String> = Vec::new();
        for id in user_ids {
            match self.status_cache().get(id) {
                Some(status) => {
                    found.insert(id.clone(), status);
                }
                None => missing.push(id.clone()),
            }
        }

        if !missing.is_empty() {
            for status in self.stores.status.get_by_ids(&missing).await? {
                self.add_status_cache_skip_cluster_send(status.clone());
                found.insert(status.user_id.clone(), status);
            }
        }

        Ok(user_ids
            .iter()
            .map(|id| {
                found
                    .remove(id)
                    .unwrap_or_else(|| Status::new_offline(id, false, 0))
            })
            .collect())
    }

    /// user id → status name, for client-facing bulk lookups.
    pub async fn get_statuses_by_ids(
        &self,
        user_ids: &[String],
    ) -> Result<HashMap<String, String>, crate::error::AppError> {
        Ok(self
            .get_user_statuses_by_ids(user_ids)
            .await?
            .into_iter()
            .map(|s| (s.user_id.clone(), s.status.as_str().to_string()))
            .collect())
    }

    // --- cache and broadcast plumbing ---

    pub fn add_status_cache_skip_cluster_send(&self, status: Status) {
        let user_id = status.user_id.clone();
        self.status_cache().set(&user_id, status);
    }

    pub async fn add_status_cache(&self, status: Status) {
        self.add_status_cache_skip_cluster_send(status.clone());
        if let Some(cluster) = self.cluster_ref() {
            match serde_json::to_vec(&status) {
                Ok(data) => {
                    let msg = ClusterMessage::new(
                        ClusterEvent::UpdateStatus,
                        ClusterSendType::BestEffort,
                        data,
                    );
                    if let Err(err) = cluster.send_cluster_message(msg).await {
                        tracing::warn!(error = %err, "failed to send status to cluster");
                    }
                }
                Err(err) => tracing::warn!(error = %err, "failed to encode status"),
            }
        }
    }

    /// `status_change` event to the user's own connections. Shed while the
    /// server is busy.
    pub async fn broadcast_status(&self, status: &Status) {
        if self.busy.is_busy() {
            return;
        }
        let ev = WebSocketEvent::new(
            event_type::STATUS_CHANGE,
            Broadcast {
                user_id: status.user_id.clone(),
                ..Default::default()
            },
        )
        .with("user_id", status.user_id.as_str())
        .with("status", status.status.as_str());
        self.publish(ev).await;
    }

    pub async fn save_and_broadcast_status(&self, status: Status) {
        if let Err(err) = self.stores.status.save_or_update(&status).await {
            tracing::warn!(user_id = %status.user_id, error = %err, "failed to save status");
        }
        self.add_status_cache(status.clone()).await;
        self.broadcast_status(&status).await;
    }

    // --- transitions ---

    pub async fn set_status_online(&self, user_id: &str, manual: bool) {
        let reason = if manual {
            StatusLogReason::Manual
        } else {
            StatusLogReason::Connect
        };
        self.set_status_online_inner(user_id, manual, DEVICE_API, reason)
            .await;
    }

    async fn set_status_online_inner(
        &self,
        user_id: &str,
        manual: bool,
        device: &str,
        reason: StatusLogReason,
    ) {
        if !self.statuses_enabled() {
            return;
        }
        let now = lattice_common::millis();
        let old = self.get_status(user_id).await.ok();

        if let Some(status) = &old {
            // Offline with a pending DND restoration goes back to DND
            // instead of online, whether the transition is automatic or
            // the user picked Online themselves.
            if status.awaiting_dnd_restore() {
                let restored = Status {
                    user_id: user_id.to_string(),
                    status: UserStatus::Dnd,
                    manual: true,
                    last_activity_at: now,
                    active_channel: status.active_channel.clone(),
                    prev_status: None,
                    dnd_end_time: status.dnd_end_time,
                };
                self.log_status_change(&restored, status.status, StatusLogReason::DndRestored, device)
                    .await;
                self.save_and_broadcast_status(restored).await;
                return;
            }
            if status.manual && !manual {
                return;
            }
        }

        let old_status = old.as_ref().map(|s| s.status).unwrap_or_default();
        let changed = old_status != UserStatus::Online;
        let mut status = old.unwrap_or_else(|| Status::new_online(user_id, now));
        let prev_activity = status.last_activity_at;
        status.status = UserStatus::Online;
        status.manual = false;
        status.prev_status = None;
        status.dnd_end_time = 0;
        status.last_activity_at = now;

        if changed {
            self.log_status_change(&status, old_status, reason, device)
                .await;
            self.save_and_broadcast_status(status).await;
        } else if now - prev_activity >= STATUS_MIN_UPDATE_MS {
            self.add_status_cache_skip_cluster_send(status);
            self.set_status_last_activity_at(user_id, now).await;
        } else {
            self.add_status_cache_skip_cluster_send(status);
        }
    }

    pub async fn set_status_offline(
        &self,
        user_id: &str,
        manual: bool,
        force: bool,
        device: &str,
    ) {
        if !self.statuses_enabled() {
            return;
        }
        let old = self.get_status(user_id).await.ok();
        if !force {
            if let Some(status) = &old {
                if status.manual && !manual {
                    return;
                }
            }
        }
        let old_status = old.map(|s| s.status).unwrap_or_default();
        let status = Status::new_offline(user_id, manual, lattice_common::millis());
        let reason = if manual {
            StatusLogReason::Manual
        } else {
            StatusLogReason::Disconnect
        };
        self.log_status_change(&status, old_status, reason, device)
            .await;
        self.save_and_broadcast_status(status).await;
    }

    /// Demote an auto-online user to away after the inactivity threshold.
    /// Manual statuses, DND, out-of-office, and offline-with-pending-DND
    /// are never touched.
    pub async fn set_status_away_if_needed(&self, user_id: &str, manual: bool) {
        if !self.statuses_enabled() {
            return;
        }
        let Ok(status) = self.get_status(user_id).await else {
            return;
        };

        if !manual {
            if status.manual {
                return;
            }
            if matches!(status.status, UserStatus::Dnd | UserStatus::OutOfOffice) {
                return;
            }
            if status.awaiting_dnd_restore() {
                return;
            }
            if status.status == UserStatus::Away {
                return;
            }
            if !self.is_user_away(status.last_activity_at) {
                return;
            }
        }

        let old_status = status.status;
        let next = Status {
            user_id: user_id.to_string(),
            status: UserStatus::Away,
            manual,
            last_activity_at: status.last_activity_at,
            active_channel: String::new(),
            prev_status: None,
            dnd_end_time: 0,
        };
        let reason = if manual {
            StatusLogReason::Manual
        } else {
            StatusLogReason::Inactivity
        };
        self.log_status_change(&next, old_status, reason, DEVICE_API)
            .await;
        self.save_and_broadcast_status(next).await;
    }

    pub async fn set_status_dnd(&self, user_id: &str) {
        self.set_status_dnd_inner(user_id, 0).await;
    }

    /// Timed DND. The end time is truncated down to the expiry grid so the
    /// status clears on the wall-clock minute the user picked.
    pub async fn set_status_dnd_timed(&self, user_id: &str, end_time_secs: i64) {
        let end = lattice_common::time::truncate_to_interval(end_time_secs, DND_EXPIRY_INTERVAL_SECS);
        self.set_status_dnd_inner(user_id, end).await;
    }

    async fn set_status_dnd_inner(&self, user_id: &str, dnd_end_time: i64) {
        if !self.statuses_enabled() {
            return;
        }
        let old = self.get_status(user_id).await.ok();
        let old_status = old.as_ref().map(|s| s.status).unwrap_or_default();
        let status = Status {
            user_id: user_id.to_string(),
            status: UserStatus::Dnd,
            manual: true,
            last_activity_at: old.map(|s| s.last_activity_at).unwrap_or_default(),
            active_channel: String::new(),
            // A timed DND remembers what it interrupted; expiry puts it
            // back.
            prev_status: (dnd_end_time != 0).then_some(old_status),
            dnd_end_time,
        };
        self.log_status_change(&status, old_status, StatusLogReason::Manual, DEVICE_API)
            .await;
        self.save_and_broadcast_status(status).await;
    }

    pub async fn set_status_out_of_office(&self, user_id: &str) {
        if !self.statuses_enabled() {
            return;
        }
        let old = self.get_status(user_id).await.ok();
        let old_status = old.as_ref().map(|s| s.status).unwrap_or_default();
        let status = Status {
            user_id: user_id.to_string(),
            status: UserStatus::OutOfOffice,
            manual: true,
            last_activity_at: old.map(|s| s.last_activity_at).unwrap_or_default(),
            active_channel: String::new(),
            prev_status: None,
            dnd_end_time: 0,
        };
        self.log_status_change(&status, old_status, StatusLogReason::Manual, DEVICE_API)
            .await;
        self.save_and_broadcast_status(status).await;
    }

    /// Refresh the activity timestamp without broadcasting.
    pub async fn set_status_last_activity_at(&self, user_id: &str, activity_at: i64) {
        let Some(mut status) = self.status_cache().get(user_id) else {
            return;
        };
        status.last_activity_at = activity_at;
        self.add_status_cache_skip_cluster_send(status);
        if let Err(err) = self
            .stores
            .status
            .update_last_activity_at(user_id, activity_at)
            .await
        {
            tracing::warn!(user_id, error = %err, "failed to update status activity");
        }
    }

    /// Queue an offline transition for the batched flusher; falls back to
    /// a direct write when the queue is full.
    pub async fn queue_set_status_offline(&self, user_id: &str, manual: bool) {
        let update = StatusUpdate {
            user_id: user_id.to_string(),
            manual,
        };
        if self.status_update_tx().try_send(update).is_err() {
            self.set_status_offline(user_id, manual, false, DEVICE_API)
                .await;
        }
    }

    /// Write the session activity timestamp at most once per five minutes.
    pub async fn update_last_activity_at_if_needed(&self, session: &Session) {
        if !self.config().extend_session_length_with_activity {
            return;
        }
        let now = lattice_common::millis();
        if now - session.last_activity_at < SESSION_ACTIVITY_TIMEOUT_MS {
            return;
        }
        if let Err(err) = self
            .stores
            .session
            .update_last_activity_at(&session.id, now)
            .await
        {
            tracing::warn!(session_id = %session.id, error = %err,
                "failed to update session activity");
            return;
        }
        let mut refreshed = session.clone();
        refreshed.last_activity_at = now;
        let token = refreshed.token.clone();
        self.cache_session(&token, Arc::new(refreshed));
    }

    /// With `no_offline` set, activity coerces an away or offline user
    /// back online. A pending DND restoration still wins, a manual Away
    /// stays put, and a manual Offline is the one protection exception
    /// the flag carries.
    pub async fn set_online_if_no_offline(&self, user_id: &str) {
        if !self.statuses_enabled() || !self.config().no_offline {
            return;
        }
        let Ok(status) = self.get_status(user_id).await else {
            return;
        };
        if status.awaiting_dnd_restore() {
            self.set_status_online_inner(
                user_id,
                false,
                DEVICE_API,
                StatusLogReason::OfflinePrevented,
            )
            .await;
            return;
        }
        let eligible = status.status == UserStatus::Offline
            || (status.status == UserStatus::Away && !status.manual);
        if !eligible {
            return;
        }
        let next = Status {
            user_id: user_id.to_string(),
            status: UserStatus::Online,
            manual: false,
            last_activity_at: lattice_common::millis(),
            active_channel: status.active_channel.clone(),
            prev_status: None,
            dnd_end_time: 0,
        };
        self.log_status_change(&next, status.status, StatusLogReason::OfflinePrevented, DEVICE_API)
            .await;
        self.save_and_broadcast_status(next).await;
    }

    pub fn is_user_away(&self, last_activity_at: i64) -> bool {
        lattice_common::millis() - last_activity_at >= self.config().away_timeout_ms()
    }

    // --- heartbeat-driven presence (accurate statuses) ---

    /// Process one presence heartbeat. Activity is recognized only when the
    /// window is active and the cached active channel is non-empty, or the
    /// viewed channel changed; a heartbeat with an empty cached channel is
    /// a page still loading and refreshes nothing.
    pub async fn update_activity_from_heartbeat(
        &self,
        user_id: &str,
        indicator: &PresenceIndicator,
    ) {
        let config = self.config();
        if !config.enable_user_statuses || !config.accurate_statuses {
            return;
        }
        let now = lattice_common::millis();
        let mut status = self
            .get_status(user_id)
            .await
            .unwrap_or_else(|_| Status::new_offline(user_id, false, 0));

        let cached_channel = status.active_channel.clone();
        let channel_changed = !indicator.channel_id.is_empty()
            && !cached_channel.is_empty()
            && indicator.channel_id != cached_channel;
        let is_activity =
            (indicator.window_active && !cached_channel.is_empty()) || channel_changed;

        status.active_channel = indicator.channel_id.clone();
        self.add_status_cache_skip_cluster_send(status.clone());

        if is_activity {
            let reason = if channel_changed {
                StatusLogReason::ChannelView
            } else {
                StatusLogReason::WindowFocus
            };
            self.log_activity(&status, reason, indicator).await;

            if status.awaiting_dnd_restore()
                || (!status.manual
                    && matches!(status.status, UserStatus::Away | UserStatus::Offline))
            {
                self.set_status_online_inner(
                    user_id,
                    false,
                    &indicator.device,
                    StatusLogReason::Heartbeat,
                )
                .await;
            } else if config.no_offline && status.status == UserStatus::Offline {
                // A manual Offline, which only the NoOffline flag may lift.
                self.set_online_if_no_offline(user_id).await;
            } else {
                self.set_status_last_activity_at(user_id, now).await;
            }
            return;
        }

        // No recognized activity: check the inactivity demotions.
        if status.status == UserStatus::Online
            && !status.manual
            && now - status.last_activity_at >= config.inactivity_timeout_ms()
        {
            let next = Status {
                status: UserStatus::Away,
                manual: false,
                active_channel: String::new(),
                prev_status: None,
                dnd_end_time: 0,
                ..status.clone()
            };
            self.log_status_change(&next, status.status, StatusLogReason::Inactivity, &indicator.device)
                .await;
            self.save_and_broadcast_status(next).await;
            return;
        }

        if status.status == UserStatus::Dnd
            && config.dnd_inactivity_timeout_minutes > 0
            && now - status.last_activity_at >= config.dnd_inactivity_timeout_ms()
        {
            let next = Status {
                status: UserStatus::Offline,
                // The demotion drops the manual flag; restoration raises
                // it again.
                manual: false,
                active_channel: String::new(),
                prev_status: Some(UserStatus::Dnd),
                // The timed end survives the offline row so a restored DND
                // still expires on schedule.
                dnd_end_time: status.dnd_end_time,
                ..status.clone()
            };
            self.log_status_change(&next, status.status, StatusLogReason::DndInactivity, &indicator.device)
                .await;
            self.save_and_broadcast_status(next).await;
        }
    }

    /// Activity from an explicit user action (typing, posting, viewing a
    /// channel). Only meaningful with accurate statuses on.
    pub async fn update_activity_from_manual_action(
        &self,
        user_id: &str,
        channel_id: &str,
        device: &str,
        reason: StatusLogReason,
    ) {
        let config = self.config();
        if !config.enable_user_statuses || !config.accurate_statuses {
            return;
        }
        let now = lattice_common::millis();
        let mut status = self
            .get_status(user_id)
            .await
            .unwrap_or_else(|_| Status::new_offline(user_id, false, 0));
        if !channel_id.is_empty() {
            status.active_channel = channel_id.to_string();
            self.add_status_cache_skip_cluster_send(status.clone());
        }

        if status.awaiting_dnd_restore()
            || (!status.manual
                && matches!(status.status, UserStatus::Away | UserStatus::Offline))
        {
            self.set_status_online_inner(user_id, false, device, reason)
                .await;
        } else if config.no_offline && status.status == UserStatus::Offline {
            self.set_online_if_no_offline(user_id).await;
        } else {
            self.set_status_last_activity_at(user_id, now).await;
        }
    }

    // --- batched offline flusher ---

    pub(crate) async fn run_status_flusher(
        self: &Arc<Self>,
        mut rx: mpsc::Receiver<StatusUpdate>,
    ) {
        let mut pending: Vec<StatusUpdate> = Vec::new();
        let mut flush_tick = tokio::time::interval(FLUSH_INTERVAL);
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut dnd_tick =
            tokio::time::interval(Duration::from_secs(DND_EXPIRY_INTERVAL_SECS as u64));
        dnd_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown_token().cancelled() => {
                    while let Ok(update) = rx.try_recv() {
                        pending.push(update);
                    }
                    // Final flush without broadcasting; sockets are gone.
                    self.flush_status_updates(&mut pending, false).await;
                    return;
                }
                update = rx.recv() => {
                    let Some(update) = update else { return };
                    pending.push(update);
                    if pending.len() >= FLUSH_THRESHOLD {
                        self.flush_status_updates(&mut pending, true).await;
                    }
                }
                _ = flush_tick.tick() => {
                    self.flush_status_updates(&mut pending, true).await;
                }
                _ = dnd_tick.tick() => {
                    self.expire_dnd_statuses().await;
                }
            }
        }
    }

    /// Apply queued offline transitions in one store write. Each user is
    /// written at most once per flush; the latest queued entry wins.
    async fn flush_status_updates(&self, pending: &mut Vec<StatusUpdate>, broadcast: bool) {
        if pending.is_empty() {
            return;
        }
        let updates: HashMap<String, StatusUpdate> = pending
            .drain(..)
            .map(|u| (u.user_id.clone(), u))
            .collect();

        let now = lattice_common::millis();
        let mut batch: HashMap<String, Status> = HashMap::new();
        for update in updates.values() {
            if let Ok(current) = self.get_status(&update.user_id).await {
                if current.manual && !update.manual {
                    continue;
                }
            }
            batch.insert(
                update.user_id.clone(),
                Status::new_offline(&update.user_id, update.manual, now),
            );
        }
        if batch.is_empty() {
            return;
        }

        if let Err(err) = self.stores.status.save_or_update_many(&batch).await {
            tracing::warn!(error = %err, count = batch.len(), "failed to flush status batch");
            return;
        }
        for status in batch.into_values() {
            self.log_status_change(
                &status,
                self.get_status_from_cache(&status.user_id)
                    .map(|s| s.status)
                    .unwrap_or_default(),
                StatusLogReason::Disconnect,
                DEVICE_API,
            )
            .await;
            self.add_status_cache(status.clone()).await;
            if broadcast {
                self.broadcast_status(&status).await;
            }
        }
    }

    /// Sweep the cache for timed DNDs that passed their end time and put
    /// the interrupted status back.
    async fn expire_dnd_statuses(&self) {
        if !self.statuses_enabled() {
            return;
        }
        let now_secs = lattice_common::time::seconds();
        let mut expired: Vec<Status> = Vec::new();
        self.status_cache().scan(|_, status| {
            if status.status == UserStatus::Dnd
                && status.dnd_end_time != 0
                && now_secs >= status.dnd_end_time
            {
                expired.push(status.clone());
            }
        });
        for old in expired {
            let restored = Status {
                user_id: old.user_id.clone(),
                status: old.prev_status.unwrap_or(UserStatus::Online),
                manual: false,
                last_activity_at: lattice_common::millis(),
                active_channel: old.active_channel.clone(),
                prev_status: None,
                dnd_end_time: 0,
            };
            self.log_status_change(&restored, old.status, StatusLogReason::DndExpired, DEVICE_API)
                .await;
            self.save_and_broadcast_status(restored).await;
        }
    }

    // --- status logs ---

    async fn log_status_change(
        &self,
        new: &Status,
        old_status: UserStatus,
        reason: StatusLogReason,
        device: &str,
    ) {
        if !self.config().enable_status_logs {
            return;
        }
        let username = self
            .stores
            .user
            .get_username(&new.user_id)
            .await
            .unwrap_or_default();
        let entry = StatusLogEntry {
            at: lattice_common::millis(),
            kind: StatusLogKind::StatusChange,
            user_id: new.user_id.clone(),
            username,
            old_status,
            new_status: new.status,
            reason,
            device: device.to_string(),
            window_active: false,
            channel_id: new.active_channel.clone(),
            manual: new.manual,
            source: String::new(),
        };
        self.status_logs().push(entry.clone());
        self.broadcast_status_log(entry).await;
    }

    async fn log_activity(
        &self,
        status: &Status,
        reason: StatusLogReason,
        indicator: &PresenceIndicator,
    ) {
        if !self.config().enable_status_logs {
            return;
        }
        let username = self
            .stores
            .user
            .get_username(&status.user_id)
            .await
            .unwrap_or_default();
        let entry = StatusLogEntry {
            at: lattice_common::millis(),
            kind: StatusLogKind::Activity,
            user_id: status.user_id.clone(),
            username,
            old_status: status.status,
            new_status: status.status,
            reason,
            device: indicator.device.clone(),
            window_active: indicator.window_active,
            channel_id: indicator.channel_id.clone(),
            manual: status.manual,
            source: String::new(),
        };
        self.status_logs().push(entry.clone());
        self.broadcast_status_log(entry).await;
    }

    /// Admin-only live feed of status-log entries.
    async fn broadcast_status_log(&self, entry: StatusLogEntry) {
        let data = match serde_json::to_value(&entry) {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode status log entry");
                return;
            }
        };
        let ev = WebSocketEvent::new(
            event_type::STATUS_LOG,
            Broadcast {
                contains_sensitive_data: true,
                ..Default::default()
            },
        )
        .with("entry", data);
        self.publish_skip_cluster_send(ev).await;
    }
}
