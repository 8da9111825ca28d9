//! Periodic work: transition passes and clock-aligned backups
//!
//! Each loop runs on its own tokio task. A failed iteration is logged and
//! the loop keeps going; loops only end through [`SchedulerHandle::shutdown`].

use chrono::{Local, NaiveDateTime, Timelike};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::Profile;
use crate::core::ForgeControl;
use crate::types::BackupKind;

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Delay before the first transition pass
    pub startup_delay: Duration,
    pub transition_interval: Duration,
    /// Minutes between incremental backups, aligned to the wall clock
    pub incremental_every_minutes: u32,
    /// Minutes between full backups, aligned to the wall clock
    pub full_every_minutes: u32,
    pub backups_enabled: bool,
}

impl SchedulerOptions {
    pub fn for_profile(profile: Profile) -> Self {
        Self {
            startup_delay: Duration::from_secs(5),
            transition_interval: profile.transition_interval(),
            incremental_every_minutes: 20,
            full_every_minutes: 60,
            backups_enabled: true,
        }
    }

    fn every_minutes(&self, kind: BackupKind) -> u32 {
        match kind {
            BackupKind::Incremental => self.incremental_every_minutes,
            BackupKind::Full => self.full_every_minutes,
        }
    }
}

/// Time from `now` to the next multiple of `step_minutes` counted from
/// local midnight. A `now` exactly on a boundary waits a full step.
pub fn delay_until_next_boundary(now: NaiveDateTime, step_minutes: u32) -> Duration {
    let step = u64::from(step_minutes.max(1)) * 60;
    let into_step = u64::from(now.num_seconds_from_midnight()) % step;
    let nanos = u64::from(now.nanosecond().min(999_999_999));
    Duration::from_secs(step - into_step) - Duration::from_nanos(nanos)
}

pub struct Scheduler {
    control: Arc<ForgeControl>,
    options: SchedulerOptions,
}

impl Scheduler {
    pub fn new(control: Arc<ForgeControl>, options: SchedulerOptions) -> Self {
        Self { control, options }
    }

    /// Spawn the loops. Consumes the scheduler, so it can only start once.
    pub fn start(self) -> SchedulerHandle {
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(transition_loop(
            Arc::clone(&self.control),
            self.options.startup_delay,
            self.options.transition_interval,
        )));

        if self.options.backups_enabled {
            for kind in BackupKind::ALL {
                tasks.push(tokio::spawn(backup_loop(
                    Arc::clone(&self.control),
                    kind,
                    self.options.every_minutes(kind),
                )));
            }
        }

        info!(
            transition_every = ?self.options.transition_interval,
            incremental_every_min = self.options.incremental_every_minutes,
            full_every_min = self.options.full_every_minutes,
            backups = self.options.backups_enabled,
            "Scheduler started"
        );
        SchedulerHandle { tasks }
    }
}

pub struct SchedulerHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Stop every loop. An operation in flight is not interrupted midway
    /// through its blocking section.
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            let _ = task.await;
        }
        info!("Scheduler stopped");
    }
}

async fn transition_loop(control: Arc<ForgeControl>, startup_delay: Duration, every: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + startup_delay, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match control.run_transition_pass().await {
            Ok(outcome) if !outcome.is_empty() => {
                info!(count = outcome.count, "Scheduled transition pass applied");
            }
            Ok(_) => debug!("Scheduled transition pass: nothing due"),
            Err(e) => warn!(error = %e, "Scheduled transition pass failed"),
        }
    }
}

async fn backup_loop(control: Arc<ForgeControl>, kind: BackupKind, every_minutes: u32) {
    loop {
        let delay = delay_until_next_boundary(Local::now().naive_local(), every_minutes);
        debug!(kind = %kind, delay_secs = delay.as_secs(), "Next backup scheduled");
        tokio::time::sleep(delay).await;

        if let Err(e) = control.backup_now(kind).await {
            warn!(kind = %kind, error = %e, "Scheduled backup failed");
        }
    }
}
