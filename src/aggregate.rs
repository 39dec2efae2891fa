//! Vote aggregation. Pure functions over the current participant set.

use crate::types::{OverallStats, Participant, ParticipantId, Role, VoteResult, VOTE_OPTIONS};
use std::collections::HashMap;

/// Participants in a stable order (earliest join first, id as tie-break)
pub fn participants_array(participants: &HashMap<ParticipantId, Participant>) -> Vec<Participant> {
    let mut list: Vec<Participant> = participants.values().cloned().collect();
    list.sort_by(|a, b| (a.joined_at, &a.id).cmp(&(b.joined_at, &b.id)));
    list
}

/// True when there is at least one non-Admin and every non-Admin has voted
pub fn all_voted(participants: &[Participant]) -> bool {
    let mut voters = participants.iter().filter(|p| p.role != Role::Admin).peekable();
    if voters.peek().is_none() {
        return false;
    }
    voters.all(|p| p.vote.is_some())
}

pub fn show_results(participants: &[Participant], voting_finished: bool) -> bool {
    voting_finished || all_voted(participants)
}

/// One entry per fixed vote value, in fixed order, zero-count values included
pub fn vote_results(participants: &[Participant]) -> Vec<VoteResult> {
    let mut results: Vec<VoteResult> = VOTE_OPTIONS
        .iter()
        .map(|&value| VoteResult {
            value,
            voters: Vec::new(),
            count: 0,
        })
        .collect();

    for participant in participants {
        let Some(vote) = participant.vote else {
            continue;
        };
        if let Some(result) = results.iter_mut().find(|r| r.value == vote) {
            result.voters.push(participant.name.clone());
            result.count += 1;
        }
    }

    results
}

pub fn overall_stats(results: &[VoteResult]) -> OverallStats {
    let total_votes: u32 = results.iter().map(|r| r.count).sum();
    let weighted: u64 = results
        .iter()
        .map(|r| u64::from(r.value) * u64::from(r.count))
        .sum();

    let average = if total_votes > 0 {
        weighted as f64 / f64::from(total_votes)
    } else {
        0.0
    };

    let voted = results.iter().filter(|r| r.count > 0).map(|r| r.value);
    let max_vote = voted.clone().max().unwrap_or(0);
    let min_vote = voted.min().unwrap_or(0);

    OverallStats {
        total_votes,
        average: format!("{:.2}", average),
        max_vote,
        min_vote,
    }
}
