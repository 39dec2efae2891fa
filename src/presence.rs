//! Presence synchronizer.
//!
//! Every presence sync delivers the complete replicated state of the channel.
//! [`PresenceSync::reconcile`] rebuilds the participant map from it by whole
//! replacement and derives the two pieces of session state that need
//! convergence rules:
//!
//! - the sticky `voting_finished` flag, raised by any other Admin's record
//!   that carries it and only lowered by the reset protocol. The local
//!   client's own record never raises it: a queued snapshot may still show a
//!   finish that the client has since reset.
//! - the single-admin rule: an Admin that sees a strictly newer Admin demotes
//!   itself. Newness is ordered by `(joined_at, id)` so equal timestamps still
//!   produce exactly one winner.
//!
//! The demotion itself is a side effect (persist + re-track) and is left to
//! the caller; reconciliation only returns a [`Convergence`] decision.

use crate::types::{
    is_valid_vote, parse_timestamp, Participant, ParticipantId, PresenceRecord, Role,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// Full presence state as delivered by the channel: presence key -> records
pub type PresenceSnapshot = HashMap<String, Vec<serde_json::Value>>;

/// What the synchronizer needs to know about the local client
#[derive(Debug, Clone, Copy)]
pub struct LocalParticipant<'a> {
    pub id: &'a str,
    pub role: Role,
    /// When this client first tracked itself, if it has
    pub joined_at: Option<DateTime<Utc>>,
}

/// Outcome of the single-admin rule for the local client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Convergence {
    Keep,
    /// A newer Admin exists, the local client must step down to User
    Demote { newer_admin: ParticipantId },
}

/// Validate one replicated record. Returns None for anything without an
/// identifier or a name.
pub fn decode_presence(raw: &serde_json::Value) -> Option<Participant> {
    let record: PresenceRecord = match serde_json::from_value(raw.clone()) {
        Ok(record) => record,
        Err(e) => {
            tracing::debug!("Skipping undecodable presence record: {}", e);
            return None;
        }
    };

    let id = record.user_id.filter(|id| !id.is_empty())?;
    let name = record.name.filter(|name| !name.is_empty())?;

    let vote = record
        .vote
        .as_ref()
        .and_then(serde_json::Value::as_u64)
        .and_then(|v| u8::try_from(v).ok())
        .filter(|v| is_valid_vote(*v));

    // Missing timestamps sort as oldest on every client alike
    let joined_at = record
        .joined_at
        .as_deref()
        .and_then(parse_timestamp)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

    Some(Participant {
        id,
        name,
        role: record.role.as_deref().map(Role::parse).unwrap_or_default(),
        vote,
        joined_at,
        voting_finished: record.is_voting_finished.unwrap_or(false),
    })
}

/// Flatten a snapshot into one participant per identifier
pub fn flatten_snapshot(snapshot: &PresenceSnapshot) -> HashMap<ParticipantId, Participant> {
    let mut participants = HashMap::new();
    for presences in snapshot.values() {
        for participant in presences.iter().filter_map(decode_presence) {
            participants.insert(participant.id.clone(), participant);
        }
    }
    participants
}

/// Single-admin rule, evaluated for the local client only.
///
/// Only older Admins ever step down, so every Admin applying this rule to the
/// same snapshot leaves exactly one Admin standing.
pub fn convergence_decision(
    participants: &HashMap<ParticipantId, Participant>,
    local: &LocalParticipant<'_>,
) -> Convergence {
    if local.role != Role::Admin {
        return Convergence::Keep;
    }

    let my_joined_at = match participants.get(local.id) {
        Some(me) => me.joined_at,
        None => match local.joined_at {
            Some(ts) => ts,
            // Not visible yet and never tracked: nothing to compare against
            None => return Convergence::Keep,
        },
    };
    let me = (my_joined_at, local.id);

    participants
        .values()
        .filter(|p| p.is_admin() && p.id != local.id)
        .filter(|p| (p.joined_at, p.id.as_str()) > me)
        .max_by(|a, b| (a.joined_at, &a.id).cmp(&(b.joined_at, &b.id)))
        .map(|newer| Convergence::Demote {
            newer_admin: newer.id.clone(),
        })
        .unwrap_or(Convergence::Keep)
}

/// Locally reconstructed session state
#[derive(Debug, Clone, Default)]
pub struct PresenceSync {
    participants: Arc<HashMap<ParticipantId, Participant>>,
    voting_finished: bool,
}

impl PresenceSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild state from a full snapshot. Never fails; malformed entries are
    /// skipped and duplicate snapshots are harmless.
    pub fn reconcile(
        &mut self,
        snapshot: &PresenceSnapshot,
        local: &LocalParticipant<'_>,
    ) -> Convergence {
        let participants = flatten_snapshot(snapshot);

        let admin_finished = participants
            .values()
            .any(|p| p.is_admin() && p.voting_finished && p.id != local.id);
        if admin_finished && !self.voting_finished {
            tracing::info!("An admin finished voting");
            self.voting_finished = true;
        }

        let decision = convergence_decision(&participants, local);
        self.participants = Arc::new(participants);
        decision
    }

    pub fn participants(&self) -> Arc<HashMap<ParticipantId, Participant>> {
        Arc::clone(&self.participants)
    }

    pub fn get(&self, id: &str) -> Option<&Participant> {
        self.participants.get(id)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn voting_finished(&self) -> bool {
        self.voting_finished
    }

    /// Raise the sticky flag for a local finish
    pub fn mark_finished(&mut self) {
        self.voting_finished = true;
    }

    /// Lower the sticky flag. Only the reset protocol calls this.
    pub fn clear_finished(&mut self) {
        self.voting_finished = false;
    }

    /// Forget all participants (leave/expire)
    pub fn clear(&mut self) {
        self.participants = Arc::new(HashMap::new());
    }
}
