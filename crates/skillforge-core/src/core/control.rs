//! Forge Control - administrative facade
//!
//! Owns the database handle, the backup manager and the gateway. Every
//! mutating operation runs under one async lock, so a backup never overlaps
//! a restore or a transition pass.

use chrono::{Local, NaiveDate, NaiveDateTime};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::gateway::BroadcastGateway;
use crate::backup::{BackupManager, RotationReport};
use crate::config::ForgeConfig;
use crate::db::ForgeDB;
use crate::error::{CoreError, Result};
use crate::types::{
    Activity, ActivityState, BackupKind, BackupRecord, GatewayEvent, StateHistoryEntry,
    TransitionOutcome,
};

const NOTIFICATION_TITLE: &str = "SkillForge";

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

pub struct ForgeControl {
    db: Arc<ForgeDB>,
    backups: BackupManager,
    gateway: Arc<dyn BroadcastGateway>,
    op_lock: Mutex<()>,
}

impl ForgeControl {
    pub fn new(db: Arc<ForgeDB>, backups: BackupManager, gateway: Arc<dyn BroadcastGateway>) -> Self {
        Self {
            db,
            backups,
            gateway,
            op_lock: Mutex::new(()),
        }
    }

    /// Open the database named by `config` and wire the backup manager to it
    pub fn open(config: &ForgeConfig, gateway: Arc<dyn BroadcastGateway>) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Arc::new(ForgeDB::open(&config.db_path)?);
        let backups = BackupManager::new(&config.db_path, &config.backups_root, config.retention);
        info!(
            db = %config.db_path.display(),
            backups = %config.backups_root.display(),
            "ForgeControl initialized"
        );
        Ok(Self::new(db, backups, gateway))
    }

    pub fn db(&self) -> &Arc<ForgeDB> {
        &self.db
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    // ============ Backups ============

    /// Take a backup of `kind` now. Rotation runs as part of it.
    pub async fn backup_now(&self, kind: BackupKind) -> Result<BackupRecord> {
        self.backup_at(kind, Local::now().naive_local()).await
    }

    pub async fn backup_at(&self, kind: BackupKind, now: NaiveDateTime) -> Result<BackupRecord> {
        let _guard = self.op_lock.lock().await;
        let backups = self.backups.clone();
        blocking(move || backups.backup_at(kind, now)).await
    }

    pub async fn list_backups(&self, kind: Option<BackupKind>) -> Result<Vec<BackupRecord>> {
        let backups = self.backups.clone();
        blocking(move || backups.list(kind)).await
    }

    pub async fn rotate_backups(&self) -> Result<RotationReport> {
        let _guard = self.op_lock.lock().await;
        let backups = self.backups.clone();
        blocking(move || Ok(backups.rotate())).await
    }

    /// Replace the live database with `file`. The connection is closed for
    /// the duration and reopened afterwards, also on failure.
    pub async fn restore(&self, file: PathBuf) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let db = Arc::clone(&self.db);
        let backups = self.backups.clone();
        blocking(move || db.detached(|| backups.restore(&file))).await
    }

    // ============ Transitions ============

    /// Advance due SCHEDULED activities using the local clock
    pub async fn run_transition_pass(&self) -> Result<TransitionOutcome> {
        let now = Local::now().naive_local();
        self.run_transition_pass_at(now.date(), now).await
    }

    pub async fn run_transition_pass_at(
        &self,
        today: NaiveDate,
        now: NaiveDateTime,
    ) -> Result<TransitionOutcome> {
        let outcome = {
            let _guard = self.op_lock.lock().await;
            let db = Arc::clone(&self.db);
            blocking(move || Ok(db.advance_due_scheduled(today, now)?)).await?
        };

        if outcome.is_empty() {
            debug!("Transition pass: nothing due");
            return Ok(outcome);
        }

        info!(count = outcome.count, ids = ?outcome.ids, "Activities moved to pending review");
        self.gateway
            .broadcast(&GatewayEvent::ActivitiesUpdated { count: outcome.count });
        self.gateway
            .notify_user(NOTIFICATION_TITLE, &review_message(outcome.count));
        Ok(outcome)
    }

    /// Manual trigger for a transition pass; returns the number moved
    pub async fn force_review(&self) -> Result<usize> {
        Ok(self.run_transition_pass().await?.count)
    }

    // ============ Activities ============

    pub async fn create_activity(
        &self,
        name: String,
        scheduled_date: Option<String>,
    ) -> Result<Activity> {
        let db = Arc::clone(&self.db);
        blocking(move || Ok(db.create_activity(&name, scheduled_date.as_deref())?)).await
    }

    pub async fn get_activity(&self, id: String) -> Result<Activity> {
        let db = Arc::clone(&self.db);
        blocking(move || db.get_activity(&id)?.ok_or(CoreError::ActivityNotFound(id))).await
    }

    pub async fn transition_activity(
        &self,
        id: String,
        to: ActivityState,
        meta: Option<serde_json::Value>,
    ) -> Result<Activity> {
        let _guard = self.op_lock.lock().await;
        let db = Arc::clone(&self.db);
        blocking(move || db.transition_activity(&id, to, meta.as_ref())).await
    }

    pub async fn schedule_activity(&self, id: String, date: NaiveDate) -> Result<Activity> {
        let _guard = self.op_lock.lock().await;
        let db = Arc::clone(&self.db);
        blocking(move || db.schedule_activity(&id, date)).await
    }

    pub async fn activity_history(&self, id: String) -> Result<Vec<StateHistoryEntry>> {
        let db = Arc::clone(&self.db);
        blocking(move || Ok(db.activity_history(&id)?)).await
    }
}

fn review_message(count: usize) -> String {
    let noun = if count == 1 { "activity" } else { "activities" };
    format!(
        "{} {} moved to {}",
        count,
        noun,
        ActivityState::PendingReview.label()
    )
}
