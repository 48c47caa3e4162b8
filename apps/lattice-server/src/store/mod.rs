//! Store contracts at the boundary of the fabric core.
//!
//! Persistent storage is an external collaborator; only the method shapes
//! matter here. The in-memory implementations back tests and single-node
//! development.

pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AppError;
use crate::model::{Session, Status};

#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Status, AppError>;
    async fn get_by_ids(&self, user_ids: &[String]) -> Result<Vec<Status>, AppError>;
    async fn save_or_update(&self, status: &Status) -> Result<(), AppError>;
    async fn save_or_update_many(
        &self,
        statuses: &HashMap<String, Status>,
    ) -> Result<(), AppError>;
    async fn update_last_activity_at(
        &self,
        user_id: &str,
        activity_at: i64,
    ) -> Result<(), AppError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, token: &str) -> Result<Session, AppError>;
    async fn save(&self, session: &Session) -> Result<(), AppError>;
    async fn update_last_activity_at(
        &self,
        session_id: &str,
        activity_at: i64,
    ) -> Result<(), AppError>;
    /// Revocation order matters for re-login safety: callers revoke the
    /// access token first, then the session row.
    async fn remove(&self, session_id: &str) -> Result<(), AppError>;
    async fn remove_all_for_user(&self, user_id: &str) -> Result<(), AppError>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_username(&self, user_id: &str) -> Result<String, AppError>;
    /// Guest visibility: whether `viewer_id` shares a channel or team with
    /// `other_id`. Applied to `user_updated` / `new_user` fan-out for
    /// guest recipients.
    async fn can_see_user(&self, viewer_id: &str, other_id: &str) -> Result<bool, AppError>;
}

#[async_trait]
pub trait ChannelStore: Send + Sync {
    /// channel-id → membership roles for every channel the user is in.
    async fn get_all_channel_members_for_user(
        &self,
        user_id: &str,
    ) -> Result<HashMap<String, String>, AppError>;
    async fn get_display_name(&self, channel_id: &str) -> Result<String, AppError>;
}

/// The bundle of store handles the platform carries.
#[derive(Clone)]
pub struct Stores {
    pub status: Arc<dyn StatusStore>,
    pub session: Arc<dyn SessionStore>,
    pub user: Arc<dyn UserStore>,
    pub channel: Arc<dyn ChannelStore>,
}

impl Stores {
    /// All-in-memory stores, used by tests and single-node development.
    pub fn in_memory() -> Self {
        let mem = Arc::new(memory::MemoryStore::default());
        Stores {
            status: mem.clone(),
            session: mem.clone(),
            user: mem.clone(),
            channel: mem,
        }
    }
}
