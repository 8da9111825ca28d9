//! skillforge-core
//!
//! Durable backups of the SkillForge SQLite database and the scheduled
//! activity lifecycle engine.
//!
//! # Modules
//!
//! - `backup`: snapshot, compression, retention and atomic restore
//! - `db`: activities, state history and the due-date transition pass
//! - `core`: `ForgeControl` facade and the broadcast gateway
//! - `scheduler`: transition cadence and clock-aligned backup timers
//! - `config`: layered runtime configuration
//! - `ipc`: local socket transport for the administrative contract

pub mod backup;
pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod ipc;
pub mod scheduler;
pub mod types;

pub use backup::{BackupManager, RotationFailure, RotationReport};
pub use config::{ForgeConfig, Profile};
pub use crate::core::{BroadcastGateway, ChannelGateway, ForgeControl, NullGateway};
pub use db::ForgeDB;
pub use error::{CoreError, Result};
pub use scheduler::{Scheduler, SchedulerHandle, SchedulerOptions};
pub use types::*;
