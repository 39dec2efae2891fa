use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Opaque ID types for readability
pub type ParticipantId = String;
pub type SessionId = String;

/// The fixed, ordered set of estimates a participant can pick from
pub const VOTE_OPTIONS: [u8; 7] = [0, 1, 2, 3, 5, 8, 13];

/// Broadcast event name used by the reset protocol
pub const RESET_VOTES_EVENT: &str = "reset-votes";

/// Whether a value belongs to the fixed vote set
pub fn is_valid_vote(value: u8) -> bool {
    VOTE_OPTIONS.contains(&value)
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Role {
    Admin,
    #[default]
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "Admin",
            Role::User => "User",
        }
    }

    /// Lenient parse used for replicated and persisted values: anything that
    /// isn't exactly "Admin" is a plain user.
    pub fn parse(value: &str) -> Self {
        match value {
            "Admin" => Role::Admin,
            _ => Role::User,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A session member as reconstructed from the latest presence snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    pub role: Role,
    pub vote: Option<u8>,
    pub joined_at: DateTime<Utc>,
    pub voting_finished: bool,
}

impl Participant {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// The record a client publishes on the presence channel.
///
/// Every field is optional on the way in: replicated records are loosely
/// shaped and get validated when they are turned into a [`Participant`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub vote: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joined_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_voting_finished: Option<bool>,
}

impl PresenceRecord {
    /// Build the record a local client tracks
    pub fn local(
        user_id: &str,
        name: &str,
        role: Role,
        vote: Option<u8>,
        joined_at: DateTime<Utc>,
        voting_finished: bool,
    ) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            name: Some(name.to_string()),
            role: Some(role.as_str().to_string()),
            vote: Some(vote.map_or(serde_json::Value::Null, serde_json::Value::from)),
            joined_at: Some(format_timestamp(&joined_at)),
            is_voting_finished: Some(voting_finished),
        }
    }
}

/// Tally for one fixed vote value
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VoteResult {
    pub value: u8,
    pub voters: Vec<String>,
    pub count: u32,
}

/// Summary statistics over all cast votes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OverallStats {
    pub total_votes: u32,
    /// Arithmetic mean, always formatted with two decimals
    pub average: String,
    pub max_vote: u8,
    pub min_vote: u8,
}

/// Timestamps go over the wire as RFC 3339 with millisecond precision
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}
