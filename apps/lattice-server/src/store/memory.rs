//! DashMap-backed store used by tests and single-node development.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::AppError;
use crate::model::{Session, Status};

use super::{ChannelStore, SessionStore, StatusStore, UserStore};

/// One map per table. Sessions are indexed by token, like the session
/// lookup path of the real store.
#[derive(Default)]
pub struct MemoryStore {
    statuses: DashMap<String, Status>,
    sessions_by_token: DashMap<String, Session>,
    usernames: DashMap<String, String>,
    /// user-id → (channel-id → roles)
    channel_members: DashMap<String, HashMap<String, String>>,
    channel_names: DashMap<String, String>,
    /// viewer-id → user-ids they may see (guest visibility).
    visibility: DashMap<String, HashSet<String>>,
}

impl MemoryStore {
    pub fn put_username(&self, user_id: &str, username: &str) {
        self.usernames
            .insert(user_id.to_string(), username.to_string());
    }

    pub fn put_channel_member(&self, user_id: &str, channel_id: &str, roles: &str) {
        self.channel_members
            .entry(user_id.to_string())
            .or_default()
            .insert(channel_id.to_string(), roles.to_string());
    }

    pub fn put_channel_name(&self, channel_id: &str, name: &str) {
        self.channel_names
            .insert(channel_id.to_string(), name.to_string());
    }

    pub fn put_visible(&self, viewer_id: &str, other_id: &str) {
        self.visibility
            .entry(viewer_id.to_string())
            .or_default()
            .insert(other_id.to_string());
    }
}

#[async_trait]
impl StatusStore for MemoryStore {
    async fn get(&self, user_id: &str) -> Result<Status, AppError> {
        self.statuses
            .get(user_id)
            .map(|s| s.clone())
            .ok_or_else(|| AppError::not_found("StatusStore.Get", "app.status.get.missing.app_error"))
    }

    async fn get_by_ids(&self, user_ids: &[String]) -> Result<Vec<Status>, AppError> {
        Ok(user_ids
            .iter()
            .filter_map(|id| self.statuses.get(id).map(|s| s.clone()))
            .collect())
    }

    async fn save_or_update(&self, status: &Status) -> Result<(), AppError> {
        self.statuses
            .insert(status.user_id.clone(), status.clone());
        Ok(())
    }

    async fn save_or_update_many(
        &self,
        statuses: &HashMap<String, Status>,
    ) -> Result<(), AppError> {
        for status in statuses.values() {
            self.statuses
                .insert(status.user_id.clone(), status.clone());
        }
        Ok(())
    }

    async fn update_last_activity_at(
        &self,
        user_id: &str,
        activity_at: i64,
    ) -> Result<(), AppError> {
        if let Some(mut s) = self.statuses.get_mut(user_id) {
            s.last_activity_at = activity_at;
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get(&self, token: &str) -> Result<Session, AppError> {
        self.sessions_by_token
            .get(token)
            .map(|s| s.clone())
            .ok_or_else(|| {
                AppError::not_found("SessionStore.Get", "app.session.get.missing.app_error")
            })
    }

    async fn save(&self, session: &Session) -> Result<(), AppError> {
        self.sessions_by_token
            .insert(session.token.clone(), session.clone());
        Ok(())
    }

    async fn update_last_activity_at(
        &self,
        session_id: &str,
        activity_at: i64,
    ) -> Result<(), AppError> {
        for mut entry in self.sessions_by_token.iter_mut() {
            if entry.id == session_id {
                entry.last_activity_at = activity_at;
                break;
            }
        }
        Ok(())
    }

    async fn remove(&self, session_id: &str) -> Result<(), AppError> {
        self.sessions_by_token
            .retain(|_, s| s.id != session_id);
        Ok(())
    }

    async fn remove_all_for_user(&self, user_id: &str) -> Result<(), AppError> {
        self.sessions_by_token.retain(|_, s| s.user_id != user_id);
        Ok(())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn get_username(&self, user_id: &str) -> Result<String, AppError> {
        self.usernames
            .get(user_id)
            .map(|u| u.clone())
            .ok_or_else(|| AppError::not_found("UserStore.Get", "app.user.get.missing.app_error"))
    }

    async fn can_see_user(&self, viewer_id: &str, other_id: &str) -> Result<bool, AppError> {
        Ok(self
            .visibility
            .get(viewer_id)
            .is_some_and(|set| set.contains(other_id)))
    }
}

#[async_trait]
impl ChannelStore for MemoryStore {
    async fn get_all_channel_members_for_user(
        &self,
        user_id: &str,
    ) -> Result<HashMap<String, String>, AppError> {
        Ok(self
            .channel_members
            .get(user_id)
            .map(|m| m.clone())
            .unwrap_or_default())
    }

    async fn get_display_name(&self, channel_id: &str) -> Result<String, AppError> {
        self.channel_names
            .get(channel_id)
            .map(|n| n.clone())
            .ok_or_else(|| {
                AppError::not_found("ChannelStore.Get", "app.channel.get.missing.app_error")
            })
    }
}
