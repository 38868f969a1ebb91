//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::game::MatchSnapshot;

/// Messages sent from client to server. These mirror the HTTP command
/// surface; the WebSocket exists for low-latency play and push updates,
/// not for anything the REST API cannot do.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Join the match this socket is bound to
    Join,

    /// Start the match (any member may request it)
    Start,

    /// Vote to eliminate a player in the current round
    CastVote { target_id: Uuid, round: u32 },

    /// Designate tonight's victim (wolves only)
    NightAction { target_id: Uuid },

    /// Leave the match
    Leave,

    /// Ping for latency measurement
    Ping {
        /// Client timestamp
        t: u64,
    },
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Welcome message after connection
    Welcome { player_id: Uuid, server_time: u64 },

    /// Viewer-scoped match snapshot; pushed after every committed
    /// transition and as the reply to every accepted command
    Snapshot { snapshot: MatchSnapshot },

    /// Public system line ("Night falls...")
    Notice { text: String },

    /// Command rejection or connection problem
    Error { kind: String, message: String },

    /// Pong response
    Pong {
        /// Echo back client timestamp
        t: u64,
    },
}
