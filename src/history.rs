use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One complete turn of speech.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utterance {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Fillers, acknowledgments and apologies: spoken, but not authoritative.
    pub is_filler: bool,
}

impl Utterance {
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text, false)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text, false)
    }

    pub fn filler(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text, true)
    }

    fn new(role: Role, text: impl Into<String>, is_filler: bool) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: Utc::now(),
            is_filler,
        }
    }
}

/// Ordered record of completed turns for one session.
///
/// Append-only; an utterance is added once its turn has completed.
#[derive(Debug, Clone, Default)]
pub struct ConversationHistory {
    utterances: Vec<Utterance>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, utterance: Utterance) {
        self.utterances.push(utterance);
    }

    pub fn as_slice(&self) -> &[Utterance] {
        &self.utterances
    }

    /// The last `n` authoritative utterances, oldest first.
    pub fn window(&self, n: usize) -> Vec<Utterance> {
        let authoritative: Vec<&Utterance> =
            self.utterances.iter().filter(|u| !u.is_filler).collect();
        let start = authoritative.len().saturating_sub(n);
        authoritative[start..].iter().map(|u| (*u).clone()).collect()
    }

    pub fn count(&self, role: Role, include_fillers: bool) -> usize {
        self.utterances
            .iter()
            .filter(|u| u.role == role && (include_fillers || !u.is_filler))
            .count()
    }

    pub fn len(&self) -> usize {
        self.utterances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utterances.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "History: {} utterances ({} user, {} assistant, {} fillers)",
            self.len(),
            self.count(Role::User, false),
            self.count(Role::Assistant, false),
            self.utterances.iter().filter(|u| u.is_filler).count()
        )
    }
}

/// Most recent user utterance in `utterances`.
pub fn last_user(utterances: &[Utterance]) -> Option<&Utterance> {
    utterances.iter().rev().find(|u| u.role == Role::User)
}

impl From<Vec<Utterance>> for ConversationHistory {
    fn from(utterances: Vec<Utterance>) -> Self {
        Self { utterances }
    }
}
