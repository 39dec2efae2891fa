//! Session lifecycle manager.
//!
//! Owns the single active channel subscription of a client and every
//! transition of the local participant: join, vote, finish, reset, leave,
//! expire and logout. Incoming channel events are consumed one at a time
//! through [`SessionManager::next_event`], which also runs the grace timer for
//! the "everyone left" expiry check.
//!
//! Error policy: transport failures are logged and swallowed, precondition
//! violations are silent no-ops. The next presence sync is the only source of
//! truth; local flags such as `has_voted` are hints for the UI.

use crate::aggregate;
use crate::channel::{ChannelEvent, PresenceTransport, SessionChannel};
use crate::config::SessionConfig;
use crate::identity::{
    generate_participant_id, suggest_display_name, IdentityStore, KeyValueStore,
};
use crate::presence::{Convergence, LocalParticipant, PresenceSnapshot, PresenceSync};
use crate::types::*;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;

/// Coarse lifecycle position of the local client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No session (never joined, expired or logged out)
    NotJoined,
    /// Subscribed, results hidden
    Voting,
    /// Subscribed, everyone voted or an admin finished voting
    Resolved,
    /// Channel released but the session id is kept
    Left,
}

/// What processing one channel event did
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Synced { participants: usize },
    /// A newer admin showed up and the local client stepped down
    Demoted { newer_admin: ParticipantId },
    PresenceJoined { key: String },
    PresenceLeft { key: String },
    /// The reset protocol ran for the local client
    Reset,
    /// A broadcast this client doesn't handle
    Broadcast { event: String },
    /// Empty past the grace period, torn down
    Expired,
    /// The substrate closed the subscription
    ChannelClosed,
}

/// Everything a UI needs to render the session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: Option<SessionId>,
    pub state: SessionState,
    pub user_id: Option<ParticipantId>,
    pub user_name: String,
    pub user_role: Role,
    pub is_admin: bool,
    pub has_voted: bool,
    pub voting_finished: bool,
    pub participants: Vec<Participant>,
    pub all_voted: bool,
    pub show_results: bool,
    pub vote_results: Vec<VoteResult>,
    pub overall_stats: OverallStats,
}

enum Wake {
    Event(Option<ChannelEvent>),
    ExpiryDue,
}

pub struct SessionManager<S> {
    transport: Arc<dyn PresenceTransport>,
    identity: IdentityStore<S>,
    config: SessionConfig,
    session_id: Option<SessionId>,
    channel: Option<SessionChannel>,
    presence: PresenceSync,
    user_name: String,
    user_role: Role,
    user_id: Option<ParticipantId>,
    /// When the current subscription first tracked us
    joined_at: Option<DateTime<Utc>>,
    has_voted: bool,
    expiry_deadline: Option<Instant>,
}

impl<S: KeyValueStore> SessionManager<S> {
    /// Create a manager, picking up any persisted identity
    pub fn new(
        transport: Arc<dyn PresenceTransport>,
        identity: IdentityStore<S>,
        config: SessionConfig,
    ) -> Self {
        let loaded = identity.load_identity();
        Self {
            transport,
            identity,
            config,
            session_id: None,
            channel: None,
            presence: PresenceSync::new(),
            user_name: loaded.name,
            user_role: loaded.role,
            user_id: loaded.id,
            joined_at: None,
            has_voted: false,
            expiry_deadline: None,
        }
    }

    /// Whether a display name is known (callers prompt for one otherwise)
    pub fn has_name(&self) -> bool {
        !self.user_name.is_empty()
    }

    /// Set and persist the display name and role. When already in a session
    /// the presence record is re-tracked so others see the change.
    pub async fn set_identity(&mut self, name: &str, role: Role) {
        self.user_name = name.to_string();
        self.user_role = role;
        if let Err(e) = self.identity.save_identity(name, role) {
            tracing::warn!("Failed to persist identity: {}", e);
        }

        if self.channel.is_some() {
            let vote = self.own_vote();
            let finished = self.presence.voting_finished() && role == Role::Admin;
            self.track(vote, finished).await;
        }
    }

    /// Join a session, replacing any previous subscription
    pub async fn join(&mut self, session_id: &str) {
        let user_id = match self.identity.ensure_id() {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!("Failed to persist participant id: {}", e);
                self.user_id.clone().unwrap_or_else(generate_participant_id)
            }
        };
        self.user_id = Some(user_id);
        self.session_id = Some(session_id.to_string());

        // Nameless records are dropped by every client, including this one
        if self.user_name.is_empty() {
            let name = suggest_display_name();
            tracing::info!("No display name stored, joining as {}", name);
            if let Err(e) = self.identity.save_identity(&name, self.user_role) {
                tracing::warn!("Failed to persist suggested name: {}", e);
            }
            self.user_name = name;
        }

        if let Some(previous) = self.channel.take() {
            previous.close().await;
        }
        self.presence = PresenceSync::new();
        self.has_voted = false;
        self.expiry_deadline = None;
        self.joined_at = None;

        match SessionChannel::open(self.transport.as_ref(), session_id).await {
            Ok(channel) => {
                tracing::info!(
                    "Joined {} as {} ({})",
                    channel.topic(),
                    self.user_name,
                    self.user_role
                );
                self.channel = Some(channel);
                self.joined_at = Some(Utc::now());
                self.track(None, false).await;
            }
            Err(e) => {
                tracing::warn!("Could not subscribe to session {}: {}", session_id, e);
            }
        }
    }

    pub async fn submit_vote(&mut self, value: u8) {
        if self.channel.is_none() || self.user_id.is_none() {
            tracing::debug!("Ignoring vote: not in a session");
            return;
        }
        if !is_valid_vote(value) {
            tracing::debug!("Ignoring vote {}: not a valid estimate", value);
            return;
        }

        self.has_voted = true;
        let finished = self.presence.voting_finished();
        self.track(Some(value), finished).await;
    }

    /// Close voting for everyone. Admin only.
    pub async fn finish_voting(&mut self) {
        if self.channel.is_none() || self.user_id.is_none() || self.user_role != Role::Admin {
            tracing::debug!("Ignoring finish: requires an admin in a session");
            return;
        }

        self.presence.mark_finished();
        tracing::info!("Finishing voting");
        // Admins never carry a vote
        self.track(None, true).await;
    }

    /// Clear every participant's vote and reopen voting
    pub async fn reset_votes(&mut self) {
        let Some(channel) = self.channel.as_ref() else {
            tracing::debug!("Ignoring reset: not in a session");
            return;
        };

        self.presence.clear_finished();
        tracing::info!("Resetting votes");
        channel.broadcast_reset().await;

        // Delivery of our own broadcast isn't guaranteed, clear locally too
        self.has_voted = false;
        if self.user_id.is_some() {
            self.track(None, false).await;
        }
    }

    /// Release the channel but keep the session id
    pub async fn leave(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
        self.presence.clear();
        self.has_voted = false;
        self.expiry_deadline = None;
        self.joined_at = None;
    }

    /// Full teardown, the session id is forgotten
    pub async fn expire_session(&mut self) {
        if let Some(session_id) = &self.session_id {
            tracing::info!("Session {} expired", session_id);
        }
        self.leave().await;
        self.session_id = None;
    }

    pub async fn logout(&mut self) {
        self.leave().await;
        self.user_name.clear();
        self.user_role = Role::User;
        self.user_id = None;
        if let Err(e) = self.identity.clear_identity() {
            tracing::warn!("Failed to clear persisted identity: {}", e);
        }
    }

    /// Wait for and apply the next channel event or the expiry timer.
    /// Returns None when not subscribed.
    pub async fn next_event(&mut self) -> Option<SessionUpdate> {
        loop {
            let wake = {
                let channel = self.channel.as_mut()?;
                match self.expiry_deadline {
                    Some(deadline) => tokio::select! {
                        event = channel.next_event() => Wake::Event(event),
                        _ = tokio::time::sleep_until(deadline) => Wake::ExpiryDue,
                    },
                    None => Wake::Event(channel.next_event().await),
                }
            };

            match wake {
                Wake::Event(Some(event)) => return Some(self.handle_event(event).await),
                Wake::Event(None) => {
                    tracing::warn!("Channel closed by the substrate");
                    self.leave().await;
                    return Some(SessionUpdate::ChannelClosed);
                }
                Wake::ExpiryDue => {
                    self.expiry_deadline = None;
                    if self.presence.is_empty() && self.channel.is_some() {
                        self.expire_session().await;
                        return Some(SessionUpdate::Expired);
                    }
                }
            }
        }
    }

    /// Apply every event that is already queued, without waiting
    pub async fn process_pending(&mut self) -> Vec<SessionUpdate> {
        let mut updates = Vec::new();
        while let Some(event) = self.channel.as_mut().and_then(|c| c.try_next_event()) {
            updates.push(self.handle_event(event).await);
        }
        updates
    }

    pub async fn handle_event(&mut self, event: ChannelEvent) -> SessionUpdate {
        match event {
            ChannelEvent::Sync(snapshot) => self.handle_sync(&snapshot).await,
            ChannelEvent::Join { key, presences } => {
                tracing::debug!("Presence joined {}: {:?}", key, presences);
                SessionUpdate::PresenceJoined { key }
            }
            ChannelEvent::Leave { key, presences } => {
                tracing::debug!("Presence left {}: {:?}", key, presences);
                SessionUpdate::PresenceLeft { key }
            }
            ChannelEvent::Broadcast { event, .. } if event == RESET_VOTES_EVENT => {
                self.handle_reset().await;
                SessionUpdate::Reset
            }
            ChannelEvent::Broadcast { event, .. } => {
                tracing::debug!("Ignoring broadcast {}", event);
                SessionUpdate::Broadcast { event }
            }
        }
    }

    async fn handle_sync(&mut self, snapshot: &PresenceSnapshot) -> SessionUpdate {
        let Some(user_id) = self.user_id.clone() else {
            return SessionUpdate::Synced { participants: 0 };
        };

        let local = LocalParticipant {
            id: &user_id,
            role: self.user_role,
            joined_at: self.joined_at,
        };
        let decision = self.presence.reconcile(snapshot, &local);

        if self.presence.get(&user_id).is_none() {
            if let Some(channel) = self.channel.as_mut() {
                channel.invalidate_tracked();
            }
        }

        if self.presence.is_empty() {
            if self.expiry_deadline.is_none() {
                tracing::debug!(
                    "Session is empty, expiring in {:?} unless someone returns",
                    self.config.expiry_grace
                );
                self.expiry_deadline = Some(Instant::now() + self.config.expiry_grace);
            }
        } else {
            self.expiry_deadline = None;
        }

        match decision {
            Convergence::Keep => SessionUpdate::Synced {
                participants: self.presence.len(),
            },
            Convergence::Demote { newer_admin } => {
                self.demote().await;
                SessionUpdate::Demoted { newer_admin }
            }
        }
    }

    async fn demote(&mut self) {
        tracing::info!("Newer admin detected, demoting self to User");
        self.user_role = Role::User;
        if let Err(e) = self.identity.save_identity(&self.user_name, Role::User) {
            tracing::warn!("Failed to persist demotion: {}", e);
        }
        self.has_voted = false;
        self.retrack(None, false).await;
    }

    async fn handle_reset(&mut self) {
        tracing::info!("Votes reset by broadcast");
        self.has_voted = false;
        self.presence.clear_finished();
        self.retrack(None, false).await;
    }

    fn record(&self, vote: Option<u8>, voting_finished: bool) -> Option<PresenceRecord> {
        let user_id = self.user_id.as_deref()?;
        Some(PresenceRecord::local(
            user_id,
            &self.user_name,
            self.user_role,
            vote,
            self.presence_joined_at(),
            voting_finished,
        ))
    }

    /// The replicated join time wins over the local one so it never drifts
    fn presence_joined_at(&self) -> DateTime<Utc> {
        self.user_id
            .as_deref()
            .and_then(|id| self.presence.get(id))
            .map(|p| p.joined_at)
            .or(self.joined_at)
            .unwrap_or_else(Utc::now)
    }

    fn own_vote(&self) -> Option<u8> {
        self.user_id
            .as_deref()
            .and_then(|id| self.presence.get(id))
            .and_then(|p| p.vote)
    }

    async fn track(&mut self, vote: Option<u8>, voting_finished: bool) {
        let Some(record) = self.record(vote, voting_finished) else {
            return;
        };
        if let Some(channel) = self.channel.as_mut() {
            channel.track(record).await;
        }
    }

    /// Re-track triggered by an incoming event; identical records are coalesced
    async fn retrack(&mut self, vote: Option<u8>, voting_finished: bool) {
        let Some(record) = self.record(vote, voting_finished) else {
            return;
        };
        if let Some(channel) = self.channel.as_mut() {
            channel.track_if_changed(record).await;
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn role(&self) -> Role {
        self.user_role
    }

    pub fn is_admin(&self) -> bool {
        self.user_role == Role::Admin
    }

    pub fn has_voted(&self) -> bool {
        self.has_voted
    }

    pub fn voting_finished(&self) -> bool {
        self.presence.voting_finished()
    }

    pub fn is_joined(&self) -> bool {
        self.channel.is_some()
    }

    pub fn expiry_pending(&self) -> bool {
        self.expiry_deadline.is_some()
    }

    pub fn participants(&self) -> Vec<Participant> {
        aggregate::participants_array(&self.presence.participants())
    }

    pub fn identity(&self) -> &IdentityStore<S> {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        match (&self.channel, &self.session_id) {
            (Some(_), _) => {
                if aggregate::show_results(&self.participants(), self.presence.voting_finished()) {
                    SessionState::Resolved
                } else {
                    SessionState::Voting
                }
            }
            (None, Some(_)) => SessionState::Left,
            (None, None) => SessionState::NotJoined,
        }
    }

    pub fn view(&self) -> SessionView {
        let participants = self.participants();
        let voting_finished = self.presence.voting_finished();
        let vote_results = aggregate::vote_results(&participants);
        let overall_stats = aggregate::overall_stats(&vote_results);

        SessionView {
            session_id: self.session_id.clone(),
            state: self.state(),
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            user_role: self.user_role,
            is_admin: self.is_admin(),
            has_voted: self.has_voted,
            voting_finished,
            all_voted: aggregate::all_voted(&participants),
            show_results: aggregate::show_results(&participants, voting_finished),
            participants,
            vote_results,
            overall_stats,
        }
    }
}
