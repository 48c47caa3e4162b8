//! Session snapshots shared between the session cache and live connections.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Role granted to users who may administer the system. Carried inside the
/// space-separated `roles` string, matching the session rows of the
/// surrounding server.
pub const ROLE_SYSTEM_ADMIN: &str = "system_admin";

/// Props key marking a guest session.
pub const PROP_IS_GUEST: &str = "is_guest";

/// An authenticated session. Treated as an immutable snapshot once placed
/// into the session cache; mutation goes through the store and a fresh
/// snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub token: String,
    pub user_id: String,
    #[serde(default)]
    pub device_id: String,
    pub created_at: i64,
    /// 0 means the session never expires.
    pub expires_at: i64,
    pub last_activity_at: i64,
    /// Space-separated role names.
    #[serde(default)]
    pub roles: String,
    #[serde(default)]
    pub is_oauth: bool,
    #[serde(default)]
    pub props: HashMap<String, String>,
    /// Team IDs this session's user belongs to, captured at login.
    #[serde(default)]
    pub team_ids: Vec<String>,
}

impl Session {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at != 0 && now_ms >= self.expires_at
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.split_whitespace().any(|r| r == role)
    }

    /// "Manage system" permission gate used by the recipient predicate.
    pub fn is_system_admin(&self) -> bool {
        self.has_role(ROLE_SYSTEM_ADMIN)
    }

    pub fn is_guest(&self) -> bool {
        self.props
            .get(PROP_IS_GUEST)
            .is_some_and(|v| v == "true")
    }

    pub fn belongs_to_team(&self, team_id: &str) -> bool {
        self.team_ids.iter().any(|t| t == team_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry() {
        let mut s = Session {
            expires_at: 1000,
            ..Default::default()
        };
        assert!(!s.is_expired(999));
        assert!(s.is_expired(1000));

        s.expires_at = 0;
        assert!(!s.is_expired(i64::MAX));
    }

    #[test]
    fn roles_and_guest() {
        let mut s = Session {
            roles: "system_user system_admin".to_string(),
            ..Default::default()
        };
        assert!(s.is_system_admin());
        assert!(!s.is_guest());

        s.roles = "system_user".to_string();
        s.props
            .insert(PROP_IS_GUEST.to_string(), "true".to_string());
        assert!(!s.is_system_admin());
        assert!(s.is_guest());
    }
}
