//! Inter-node event plane.
//!
//! The transport is a capability: nodes without one run standalone and
//! every send is skipped. Inbound messages are dispatched to local
//! handlers; a message that fails to decode is logged and dropped, never
//! retried.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::AppError;
use crate::model::{ClusterEvent, ClusterMessage, Status, WebSocketEvent};
use crate::PlatformService;

#[async_trait]
pub trait Cluster: Send + Sync {
    /// Deliver a message to every other node, honoring its send type.
    async fn send_cluster_message(&self, msg: ClusterMessage) -> Result<(), AppError>;
}

/// Apply one message received from a peer node.
pub async fn handle_cluster_message(platform: &Arc<PlatformService>, msg: ClusterMessage) {
    match msg.event {
        ClusterEvent::Publish => match WebSocketEvent::from_cluster_json(&msg.data) {
            Ok(ev) => platform.publish_skip_cluster_send(ev).await,
            Err(err) => {
                tracing::warn!(error = %err, "dropping undecodable cluster broadcast");
            }
        },
        ClusterEvent::UpdateStatus => match serde_json::from_slice::<Status>(&msg.data) {
            Ok(status) => platform.add_status_cache_skip_cluster_send(status),
            Err(err) => {
                tracing::warn!(error = %err, "dropping undecodable cluster status");
            }
        },
        ClusterEvent::InvalidateAllCaches => {
            platform.invalidate_all_caches_skip_cluster();
        }
        ClusterEvent::InvalidateWebconnCacheForUser => match user_id_payload(&msg.data) {
            Some(user_id) => platform.hub_pool().invalidate_user(&user_id).await,
            None => tracing::warn!("dropping webconn invalidation with bad user id"),
        },
        ClusterEvent::ClearSessionCacheForUser => match user_id_payload(&msg.data) {
            Some(user_id) => platform.clear_session_cache_for_user_skip_cluster(&user_id),
            None => tracing::warn!("dropping session invalidation with bad user id"),
        },
        ClusterEvent::ClearSessionCacheForAllUsers => {
            platform.clear_session_cache_for_all_users_skip_cluster();
        }
        ClusterEvent::BusyStateChanged => match serde_json::from_slice(&msg.data) {
            Ok(state) => platform.apply_busy_state(state),
            Err(err) => {
                tracing::warn!(error = %err, "dropping undecodable busy state");
            }
        },
        ClusterEvent::PluginEvent => {
            platform.dispatch_plugin_event(&msg);
        }
    }
}

fn user_id_payload(data: &[u8]) -> Option<String> {
    let s = std::str::from_utf8(data).ok()?;
    if s.is_empty() {
        return None;
    }
    Some(s.to_string())
}

/// In-process transport that records every message; used by tests and as
/// the loopback for single-node setups that still want the code path.
#[derive(Default)]
pub struct RecordingCluster {
    sent: Mutex<Vec<ClusterMessage>>,
}

impl RecordingCluster {
    pub fn messages(&self) -> Vec<ClusterMessage> {
        self.sent.lock().clone()
    }

    pub fn take_messages(&self) -> Vec<ClusterMessage> {
        std::mem::take(&mut *self.sent.lock())
    }
}

#[async_trait]
impl Cluster for RecordingCluster {
    async fn send_cluster_message(&self, msg: ClusterMessage) -> Result<(), AppError> {
        self.sent.lock().push(msg);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::model::event::{event_type, Broadcast};
    use crate::model::{ClusterSendType, UserStatus};
    use crate::store::Stores;

    fn platform_with_cluster() -> (Arc<PlatformService>, Arc<RecordingCluster>) {
        let cluster = Arc::new(RecordingCluster::default());
        let platform = PlatformService::new(
            Config::default(),
            Stores::in_memory(),
            Some(cluster.clone()),
        );
        (platform, cluster)
    }

    #[tokio::test]
    async fn publish_forwards_to_cluster_with_send_type() {
        let (platform, cluster) = platform_with_cluster();

        let typing = WebSocketEvent::new(event_type::TYPING, Broadcast::default());
        platform.publish(typing).await;

        let posted = WebSocketEvent::new(event_type::POSTED, Broadcast::default());
        platform.publish(posted).await;

        let sent = cluster.messages();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].event, ClusterEvent::Publish);
        assert_eq!(sent[0].send_type, ClusterSendType::BestEffort);
        assert_eq!(sent[1].send_type, ClusterSendType::Reliable);
    }

    #[tokio::test]
    async fn publish_skip_does_not_forward() {
        let (platform, cluster) = platform_with_cluster();
        let ev = WebSocketEvent::new(event_type::POSTED, Broadcast::default());
        platform.publish_skip_cluster_send(ev).await;
        assert!(cluster.messages().is_empty());
    }

    #[tokio::test]
    async fn producer_flag_forces_reliable() {
        let (platform, cluster) = platform_with_cluster();
        let ev = WebSocketEvent::new(
            event_type::TYPING,
            Broadcast {
                reliable_cluster_send: true,
                ..Default::default()
            },
        );
        platform.publish(ev).await;
        assert_eq!(cluster.messages()[0].send_type, ClusterSendType::Reliable);
    }

    #[tokio::test]
    async fn inbound_publish_does_not_echo_back() {
        let (platform, cluster) = platform_with_cluster();
        let ev = WebSocketEvent::new(event_type::POSTED, Broadcast::default());
        let msg = ClusterMessage::new(
            ClusterEvent::Publish,
            ClusterSendType::Reliable,
            ev.to_cluster_json().unwrap(),
        );
        handle_cluster_message(&platform, msg).await;
        assert!(cluster.messages().is_empty());
    }

    #[tokio::test]
    async fn inbound_status_lands_in_cache_without_echo() {
        let (platform, cluster) = platform_with_cluster();
        let status = Status::new_online("u1", 42);
        let msg = ClusterMessage::new(
            ClusterEvent::UpdateStatus,
            ClusterSendType::BestEffort,
            serde_json::to_vec(&status).unwrap(),
        );
        handle_cluster_message(&platform, msg).await;
        assert_eq!(
            platform.get_status_from_cache("u1").map(|s| s.status),
            Some(UserStatus::Online)
        );
        assert!(cluster.messages().is_empty());
    }

    #[tokio::test]
    async fn inbound_busy_state_converges() {
        let (platform, _) = platform_with_cluster();
        let state = crate::busy::BusyState {
            busy: true,
            expires_at: lattice_common::time::seconds() + 300,
        };
        let msg = ClusterMessage::new(
            ClusterEvent::BusyStateChanged,
            ClusterSendType::Reliable,
            serde_json::to_vec(&state).unwrap(),
        );
        handle_cluster_message(&platform, msg).await;
        assert!(platform.busy.is_busy());
    }

    #[tokio::test]
    async fn undecodable_payloads_are_dropped() {
        let (platform, cluster) = platform_with_cluster();
        for event in [
            ClusterEvent::Publish,
            ClusterEvent::UpdateStatus,
            ClusterEvent::BusyStateChanged,
        ] {
            let msg =
                ClusterMessage::new(event, ClusterSendType::BestEffort, b"not json".to_vec());
            handle_cluster_message(&platform, msg).await;
        }
        assert!(cluster.messages().is_empty());
        assert!(!platform.busy.is_busy());
    }

    #[tokio::test]
    async fn busy_mutations_broadcast_reliably() {
        let (platform, cluster) = platform_with_cluster();
        platform
            .set_server_busy(std::time::Duration::from_secs(60))
            .await;
        platform.clear_server_busy().await;

        let sent = cluster.messages();
        assert_eq!(sent.len(), 2);
        assert!(sent
            .iter()
            .all(|m| m.event == ClusterEvent::BusyStateChanged
                && m.send_type == ClusterSendType::Reliable));
        let last: crate::busy::BusyState = serde_json::from_slice(&sent[1].data).unwrap();
        assert!(!last.busy);
    }
}
