//! Heartbeat messages and per-member observations

use crate::cluster_time::SignedClusterTime;
use crate::config::MemberId;
use crate::optime::OpTime;
use crate::state::MemberState;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Heartbeat sent to every other member on the configured cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    /// Set name; mismatches are rejected outright.
    pub set_name: String,
    /// Sender's member id.
    pub sender_id: MemberId,
    /// Sender's current state.
    pub sender_state: MemberState,
    /// Sender's election term.
    pub sender_term: u64,
    /// Sender's last applied optime.
    pub last_applied: OpTime,
    /// Sender's config version.
    pub config_version: u64,
    /// Gossiped cluster time.
    pub cluster_time: SignedClusterTime,
}

/// Reply to a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// Responder's member id.
    pub responder_id: MemberId,
    /// Responder's state.
    pub state: MemberState,
    /// Responder's term.
    pub term: u64,
    /// Responder's last applied optime.
    pub last_applied: OpTime,
    /// Responder's config version.
    pub config_version: u64,
    /// Gossiped cluster time.
    pub cluster_time: SignedClusterTime,
}

/// What this node last observed about a peer.
#[derive(Debug, Clone)]
pub struct MemberObservation {
    /// Peer's reported state.
    pub state: MemberState,
    /// Peer's reported term.
    pub term: u64,
    /// Peer's reported last applied optime.
    pub last_applied: OpTime,
    /// When the last heartbeat (in either direction) arrived.
    pub last_heartbeat_at: Instant,
    /// Reachability as of the last exchange.
    pub up: bool,
}

impl MemberObservation {
    /// Initial observation before any contact.
    pub fn unknown() -> Self {
        Self {
            state: MemberState::Startup,
            term: 0,
            last_applied: OpTime::initial(),
            last_heartbeat_at: Instant::now(),
            up: false,
        }
    }
}
