use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::{PlatformIdentity, Roster, StudentNumber};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelMessage {
    pub author_id: u64,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipationLine {
    pub name: String,
    pub number: StudentNumber,
    pub words: usize,
}

impl Display for ParticipationLine {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.words)
    }
}

/// Words typed per registered student. Messages from identities that are not
/// bound to a record are skipped.
#[must_use]
pub fn word_participation(roster: &Roster, messages: &[ChannelMessage]) -> Vec<ParticipationLine> {
    let mut words = BTreeMap::<StudentNumber, usize>::new();
    for message in messages {
        let Ok(student) = roster.find_by_identity(message.author_id) else {
            continue;
        };
        *words.entry(student.number).or_default() += message.content.split_whitespace().count();
    }

    let mut lines = words
        .into_iter()
        .filter_map(|(number, words)| {
            roster.find_by_number(number).ok().map(|student| ParticipationLine {
                name: student.name.clone(),
                number,
                words,
            })
        })
        .collect::<Vec<_>>();
    lines.sort_by(|left, right| {
        left.name
            .to_lowercase()
            .cmp(&right.name.to_lowercase())
            .then(left.number.cmp(&right.number))
    });
    lines
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PollOption {
    pub emoji: String,
    pub label: String,
}

impl PollOption {
    #[must_use]
    pub fn new(emoji: impl Into<String>, label: impl Into<String>) -> Self {
        Self { emoji: emoji.into(), label: label.into() }
    }

    /// The two-option poll the bot posts when no options are supplied.
    #[must_use]
    pub fn yes_no() -> Vec<Self> {
        vec![Self::new("👍", "Yes"), Self::new("👎", "No")]
    }
}

/// Everyone who reacted to a poll message with `emoji`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PollReaction {
    pub emoji: String,
    pub voters: Vec<PlatformIdentity>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PollTally {
    pub emoji: String,
    pub label: String,
    pub votes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PollSummary {
    /// One tally per declared option, in declaration order.
    pub tallies: Vec<PollTally>,
    /// `None` when nobody voted.
    pub winner: Option<PollTally>,
    /// `name: label[/label...]` for every registered voter, sorted case-insensitively.
    pub participation: Vec<String>,
}

impl PollSummary {
    #[must_use]
    pub fn headline(&self) -> String {
        match &self.winner {
            Some(winner) => format!("{} won with {} votes.", winner.emoji, winner.votes),
            None => "Unable to determine a winner: Nobody voted!".to_string(),
        }
    }
}

/// Tally poll reactions against the declared options.
///
/// Reactions with an undeclared emoji are ignored, as are reactions by
/// `bot_id`. Each identity is counted at most once per option. Ties go to the
/// option declared first.
#[must_use]
pub fn summarize_poll(
    roster: &Roster,
    options: &[PollOption],
    reactions: &[PollReaction],
    bot_id: Option<u64>,
) -> PollSummary {
    let mut tallies = options
        .iter()
        .map(|option| PollTally { emoji: option.emoji.clone(), label: option.label.clone(), votes: 0 })
        .collect::<Vec<_>>();
    let mut seen = HashSet::<(usize, u64)>::new();
    let mut votes_by_voter = BTreeMap::<u64, Vec<String>>::new();

    for reaction in reactions {
        // Reactions with an emoji outside the declared options are not votes.
        let Some(index) = options.iter().position(|option| option.emoji == reaction.emoji) else {
            continue;
        };
        for voter in &reaction.voters {
            if Some(voter.id) == bot_id || !seen.insert((index, voter.id)) {
                continue;
            }
            tallies[index].votes += 1;
            votes_by_voter.entry(voter.id).or_default().push(options[index].label.clone());
        }
    }

    let winner = tallies
        .iter()
        .fold(None::<&PollTally>, |best, tally| match best {
            Some(best) if best.votes >= tally.votes => Some(best),
            _ => Some(tally),
        })
        .filter(|tally| tally.votes > 0)
        .cloned();

    let mut participation = votes_by_voter
        .into_iter()
        .filter_map(|(voter_id, labels)| {
            roster
                .find_by_identity(voter_id)
                .ok()
                .map(|student| format!("{}: {}", student.name, labels.join("/")))
        })
        .collect::<Vec<_>>();
    participation.sort_by_key(|line| line.to_lowercase());

    PollSummary { tallies, winner, participation }
}

/// Everyone who answered an attendance check: `name#number` for registered
/// students, the platform display name for anyone else. Sorted and de-duplicated.
#[must_use]
pub fn attendance_summary(
    roster: &Roster,
    responders: &[PlatformIdentity],
    bot_id: Option<u64>,
) -> Vec<String> {
    responders
        .iter()
        .filter(|responder| Some(responder.id) != bot_id)
        .map(|responder| match roster.find_by_identity(responder.id) {
            Ok(student) => format!("{}#{}", student.name, student.number),
            Err(_) => responder.name.clone(),
        })
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
