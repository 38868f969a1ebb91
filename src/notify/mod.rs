//! System notification sink - the chat subsystem boundary
//!
//! The engine hands committed-transition notices to a sink and moves on.
//! Delivery is best-effort: implementations log failures and never
//! propagate them, so a lost notice cannot fail or stall a transition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::game::Notice;
use crate::store::SupabaseClient;

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, match_id: Uuid, notice: Notice);
}

/// Sink that only writes to the server log (dev / memory backend)
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn publish(&self, match_id: Uuid, notice: Notice) {
        match notice {
            Notice::System(text) => info!(match_id = %match_id, "{}", text),
            Notice::RoleReveal { player_id, role } => {
                debug!(match_id = %match_id, player_id = %player_id, ?role, "role assigned")
            }
        }
    }
}

/// Row shape of the chat subsystem's `group_messages` table
#[derive(Debug, Serialize)]
struct NewGroupMessage {
    id: Uuid,
    match_id: Uuid,
    username: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    text: String,
    created_at: DateTime<Utc>,
}

/// Sink that posts system lines into the external chat feed. Role reveals
/// are deliberately not posted: the group feed is public and reveals are
/// delivered to players through their own snapshots.
pub struct ChatSink {
    client: SupabaseClient,
    table: String,
}

impl ChatSink {
    pub fn new(client: SupabaseClient) -> Self {
        Self {
            client,
            table: "group_messages".to_string(),
        }
    }
}

#[async_trait]
impl NotificationSink for ChatSink {
    async fn publish(&self, match_id: Uuid, notice: Notice) {
        let text = match notice {
            Notice::System(text) => text,
            Notice::RoleReveal { player_id, role } => {
                debug!(match_id = %match_id, player_id = %player_id, ?role, "role assigned");
                return;
            }
        };

        let message = NewGroupMessage {
            id: Uuid::new_v4(),
            match_id,
            username: "Narrator",
            kind: "text",
            text,
            created_at: Utc::now(),
        };

        if let Err(e) = self.client.insert(&self.table, &message).await {
            warn!(match_id = %match_id, error = %e, "failed to post system notice to chat");
        }
    }
}
