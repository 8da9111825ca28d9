//! Core types for skillforge
//!
//! Activity lifecycle, history rows, backup records and gateway events.

use serde::{Deserialize, Serialize};

// ============ Activity lifecycle ============

/// Lifecycle state of an activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    Draft,
    Analyzed,
    Scheduled,
    PendingReview,
    Evaluated,
    Closed,
}

impl ActivityState {
    pub const ALL: [ActivityState; 6] = [
        ActivityState::Draft,
        ActivityState::Analyzed,
        ActivityState::Scheduled,
        ActivityState::PendingReview,
        ActivityState::Evaluated,
        ActivityState::Closed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityState::Draft => "draft",
            ActivityState::Analyzed => "analyzed",
            ActivityState::Scheduled => "scheduled",
            ActivityState::PendingReview => "pending_review",
            ActivityState::Evaluated => "evaluated",
            ActivityState::Closed => "closed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(ActivityState::Draft),
            "analyzed" => Some(ActivityState::Analyzed),
            "scheduled" => Some(ActivityState::Scheduled),
            "pending_review" => Some(ActivityState::PendingReview),
            "evaluated" => Some(ActivityState::Evaluated),
            "closed" => Some(ActivityState::Closed),
            _ => None,
        }
    }

    /// Human label shown in user notifications
    pub fn label(&self) -> &'static str {
        match self {
            ActivityState::Draft => "Draft",
            ActivityState::Analyzed => "Analyzed",
            ActivityState::Scheduled => "Scheduled",
            ActivityState::PendingReview => "Pending review",
            ActivityState::Evaluated => "Evaluated",
            ActivityState::Closed => "Closed",
        }
    }

    /// Permitted successor states. This table is the only source of truth
    /// for state mutations.
    pub fn successors(&self) -> &'static [ActivityState] {
        match self {
            ActivityState::Draft => &[ActivityState::Analyzed],
            ActivityState::Analyzed => &[ActivityState::Scheduled, ActivityState::PendingReview],
            ActivityState::Scheduled => &[ActivityState::PendingReview, ActivityState::Closed],
            ActivityState::PendingReview => &[ActivityState::Evaluated, ActivityState::Closed],
            ActivityState::Evaluated => &[ActivityState::Closed],
            ActivityState::Closed => &[],
        }
    }

    pub fn can_transition_to(&self, next: ActivityState) -> bool {
        self.successors().contains(&next)
    }
}

impl std::fmt::Display for ActivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An activity row as seen by the core. Everything else about activities
/// belongs to the CRUD layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub id: String,
    pub name: String,
    pub state: ActivityState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_date: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Append-only history row
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateHistoryEntry {
    pub id: String,
    pub activity_id: String,
    pub state: ActivityState,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

/// Result of one transition pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub count: usize,
    pub ids: Vec<String>,
}

impl TransitionOutcome {
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

// ============ Backups ============

/// Backup track. Both kinds are full logical snapshots; they differ only in
/// cadence and retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackupKind {
    #[serde(rename = "INC", alias = "INCREMENTAL")]
    Incremental,
    #[serde(rename = "FULL")]
    Full,
}

impl BackupKind {
    pub const ALL: [BackupKind; 2] = [BackupKind::Incremental, BackupKind::Full];

    /// Tag used in artifact file names
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Incremental => "INC",
            BackupKind::Full => "FULL",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "INC" | "INCREMENTAL" => Some(BackupKind::Incremental),
            "FULL" => Some(BackupKind::Full),
            _ => None,
        }
    }
}

impl Default for BackupKind {
    fn default() -> Self {
        BackupKind::Incremental
    }
}

impl std::fmt::Display for BackupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A compressed snapshot on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub kind: BackupKind,
    pub file: std::path::PathBuf,
    /// `YYYY-MM-DD_HH-MM`, local time. Sorts chronologically as a string.
    pub timestamp: String,
    pub size_bytes: u64,
}

/// Keep-counts per backup kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    pub incremental_keep: usize,
    pub full_keep: usize,
}

impl RetentionPolicy {
    pub fn keep_for(&self, kind: BackupKind) -> usize {
        match kind {
            BackupKind::Incremental => self.incremental_keep,
            BackupKind::Full => self.full_keep,
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            incremental_keep: 12,
            full_keep: 48,
        }
    }
}

// ============ Gateway events ============

/// Events pushed to observers (UI windows, CLI subscribers)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum GatewayEvent {
    ActivitiesUpdated { count: usize },
    UserNotification { title: String, body: String },
}
