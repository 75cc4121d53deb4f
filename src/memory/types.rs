//! Core type definitions for observations, sessions, summaries, pending
//! captures, and the knowledge graph.
//!
//! Set-valued fields (facts, concepts, files) are stored as JSON arrays in
//! TEXT columns; equality over them is order-independent.

use serde::{Deserialize, Serialize};

/// Classification of a distilled observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationType {
    Decision,
    Bugfix,
    Feature,
    Refactor,
    Discovery,
    Change,
}

impl ObservationType {
    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decision => "decision",
            Self::Bugfix => "bugfix",
            Self::Feature => "feature",
            Self::Refactor => "refactor",
            Self::Discovery => "discovery",
            Self::Change => "change",
        }
    }

    pub const ALL: [ObservationType; 6] = [
        Self::Decision,
        Self::Bugfix,
        Self::Feature,
        Self::Refactor,
        Self::Discovery,
        Self::Change,
    ];

    /// Single-character icon used by the context index.
    pub fn icon(&self) -> &'static str {
        match self {
            Self::Decision => "⚖",
            Self::Bugfix => "🐛",
            Self::Feature => "✨",
            Self::Refactor => "♻",
            Self::Discovery => "🔍",
            Self::Change => "✏",
        }
    }
}

impl std::fmt::Display for ObservationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ObservationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "decision" => Ok(Self::Decision),
            "bugfix" => Ok(Self::Bugfix),
            "feature" => Ok(Self::Feature),
            "refactor" => Ok(Self::Refactor),
            "discovery" => Ok(Self::Discovery),
            "change" => Ok(Self::Change),
            _ => Err(format!("unknown observation type: {s}")),
        }
    }
}

/// Visibility scope for an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    #[default]
    Project,
    User,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::User => "user",
        }
    }
}

impl std::str::FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "project" => Ok(Self::Project),
            "user" => Ok(Self::User),
            _ => Err(format!("unknown scope: {s}")),
        }
    }
}

/// Lineage state filter for list and search operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ObservationState {
    /// Active rows only: not superseded, not tombstoned.
    #[default]
    Current,
    Superseded,
    Deleted,
    All,
}

/// An immutable record of one distilled event, matching the `observations`
/// table schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    /// UUID v7 (time-sortable) primary key.
    pub id: String,
    pub session_id: String,
    pub scope: Scope,
    #[serde(rename = "type")]
    pub observation_type: ObservationType,
    pub title: String,
    pub subtitle: Option<String>,
    pub narrative: String,
    /// Ordered list of distilled facts.
    pub facts: Vec<String>,
    /// Concept tags; order-independent set semantics.
    pub concepts: Vec<String>,
    pub files_read: Vec<String>,
    pub files_modified: Vec<String>,
    pub raw_tool_output: Option<String>,
    pub tool_name: Option<String>,
    /// ISO 8601 creation timestamp. Never mutated.
    pub created_at: String,
    /// Distilled size in approximate tokens, computed once at creation.
    pub token_count: u32,
    /// Raw pre-compression size in approximate tokens.
    pub discovery_tokens: u32,
    /// 1..=5, default 3.
    pub importance: u8,
    /// Predecessor in the revision chain, if any.
    pub revision_of: Option<String>,
    /// Successor that superseded this row, if any.
    pub superseded_by: Option<String>,
    pub superseded_at: Option<String>,
    /// Tombstone marker; set rows stay addressable by id for audit only.
    pub deleted_at: Option<String>,
}

impl Observation {
    /// An observation is active iff not superseded and not tombstoned.
    pub fn is_active(&self) -> bool {
        self.superseded_by.is_none() && self.deleted_at.is_none()
    }

    pub fn state(&self) -> ObservationState {
        if self.deleted_at.is_some() {
            ObservationState::Deleted
        } else if self.superseded_by.is_some() {
            ObservationState::Superseded
        } else {
            ObservationState::Current
        }
    }
}

/// Content fields for a new observation, excluding identity and lineage.
/// Produced by the compressor (or the basic extractor fallback).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservationDraft {
    #[serde(rename = "type")]
    pub observation_type: Option<ObservationType>,
    pub title: String,
    pub subtitle: Option<String>,
    pub narrative: String,
    pub facts: Vec<String>,
    pub concepts: Vec<String>,
    pub files_read: Vec<String>,
    pub files_modified: Vec<String>,
    pub raw_tool_output: Option<String>,
    pub tool_name: Option<String>,
    pub importance: Option<u8>,
    pub scope: Option<Scope>,
    /// Raw pre-compression size in approximate tokens.
    pub discovery_tokens: u32,
}

/// Partial update applied by [`crate::memory::store::update`]; every set
/// field replaces the value copied from the predecessor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservationPatch {
    #[serde(rename = "type")]
    pub observation_type: Option<ObservationType>,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub narrative: Option<String>,
    pub facts: Option<Vec<String>>,
    pub concepts: Option<Vec<String>>,
    pub files_read: Option<Vec<String>>,
    pub files_modified: Option<Vec<String>>,
    pub importance: Option<u8>,
}

impl ObservationPatch {
    pub fn is_empty(&self) -> bool {
        self.observation_type.is_none()
            && self.title.is_none()
            && self.subtitle.is_none()
            && self.narrative.is_none()
            && self.facts.is_none()
            && self.concepts.is_none()
            && self.files_read.is_none()
            && self.files_modified.is_none()
            && self.importance.is_none()
    }
}

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Idle,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Completed => "completed",
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "idle" => Ok(Self::Idle),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("unknown session status: {s}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub project_path: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub status: SessionStatus,
    pub observation_count: u32,
    pub summary_id: Option<String>,
}

/// AI-generated summary of one session's active observations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub session_id: String,
    pub summary: String,
    pub key_decisions: Vec<String>,
    pub files_modified: Vec<String>,
    pub concepts: Vec<String>,
    pub request: Option<String>,
    pub investigated: Option<String>,
    pub learned: Option<String>,
    pub completed: Option<String>,
    pub next_steps: Option<String>,
    pub token_count: u32,
    pub created_at: String,
}

/// Summary content produced by the compressor, excluding identity fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SummaryDraft {
    pub summary: String,
    pub key_decisions: Vec<String>,
    pub files_modified: Vec<String>,
    pub concepts: Vec<String>,
    pub request: Option<String>,
    pub investigated: Option<String>,
    pub learned: Option<String>,
    pub completed: Option<String>,
    pub next_steps: Option<String>,
}

/// Processing status of a pending capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl PendingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for PendingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown pending status: {s}")),
        }
    }
}

/// A raw capture awaiting compression, matching `pending_messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingMessage {
    pub id: i64,
    pub session_id: String,
    pub tool_name: String,
    pub tool_output: String,
    pub call_id: String,
    pub status: PendingStatus,
    pub retry_count: u32,
    pub error: Option<String>,
    pub created_at: String,
}

/// A knowledge-graph node, deduped case-insensitively on (type, name).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub entity_type: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: String,
}

/// A directed edge carrying the observation that introduced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub from_entity_id: String,
    pub relationship_type: String,
    pub to_entity_id: String,
    pub observation_id: String,
    pub created_at: String,
}

/// Approximate token count: `ceil(chars / 4)`.
pub fn approx_tokens(text: &str) -> u32 {
    (text.len() as u32).div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observation_type_round_trips() {
        for t in ObservationType::ALL {
            assert_eq!(t.as_str().parse::<ObservationType>().unwrap(), t);
        }
        assert!("nonsense".parse::<ObservationType>().is_err());
    }

    #[test]
    fn active_state_classification() {
        let mut obs = Observation {
            id: "o1".into(),
            session_id: "s1".into(),
            scope: Scope::Project,
            observation_type: ObservationType::Discovery,
            title: "t".into(),
            subtitle: None,
            narrative: "n".into(),
            facts: vec![],
            concepts: vec![],
            files_read: vec![],
            files_modified: vec![],
            raw_tool_output: None,
            tool_name: None,
            created_at: "2026-01-01T00:00:00Z".into(),
            token_count: 1,
            discovery_tokens: 4,
            importance: 3,
            revision_of: None,
            superseded_by: None,
            superseded_at: None,
            deleted_at: None,
        };
        assert!(obs.is_active());
        assert_eq!(obs.state(), ObservationState::Current);

        obs.superseded_by = Some("o2".into());
        assert!(!obs.is_active());
        assert_eq!(obs.state(), ObservationState::Superseded);

        obs.deleted_at = Some("2026-01-02T00:00:00Z".into());
        assert_eq!(obs.state(), ObservationState::Deleted);
    }

    #[test]
    fn approx_tokens_rounds_up() {
        assert_eq!(approx_tokens(""), 0);
        assert_eq!(approx_tokens("abc"), 1);
        assert_eq!(approx_tokens("abcd"), 1);
        assert_eq!(approx_tokens("abcde"), 2);
    }
}
