//! Administrative operation contract
//!
//! Method names, parameter shapes and result shapes shared by the daemon and
//! its clients.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

use skillforge_core::BackupKind;

use crate::protocol::RpcError;

pub const PING: &str = "ping";
pub const BACKUP_LIST: &str = "backup.list";
pub const BACKUP_NOW: &str = "backup.now";
pub const BACKUP_RESTORE: &str = "backup.restore";
pub const TRANSITION_FORCE_REVIEW: &str = "transition.forceReview";
pub const EVENTS_SUBSCRIBE: &str = "events.subscribe";

/// Method name carried by every event stream line
pub const EVENT_NOTIFICATION: &str = "event";

/// Params of `backup.list` and `backup.now`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupKindParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<BackupKind>,
}

/// Params of `backup.restore`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreParams {
    pub file: PathBuf,
}

/// Result of `transition.forceReview`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceReviewResult {
    pub count: usize,
}

/// Method listing entry
#[derive(Debug, Clone, Serialize)]
pub struct MethodInfo {
    pub name: &'static str,
    pub description: &'static str,
}

pub fn all_methods() -> Vec<MethodInfo> {
    vec![
        MethodInfo {
            name: PING,
            description: "Liveness check",
        },
        MethodInfo {
            name: BACKUP_LIST,
            description: "List backups newest first, optionally filtered by kind",
        },
        MethodInfo {
            name: BACKUP_NOW,
            description: "Take a backup now (default INC) and apply retention",
        },
        MethodInfo {
            name: BACKUP_RESTORE,
            description: "Replace the live database with a backup artifact",
        },
        MethodInfo {
            name: TRANSITION_FORCE_REVIEW,
            description: "Run a transition pass now and return how many activities moved",
        },
        MethodInfo {
            name: EVENTS_SUBSCRIBE,
            description: "Stream gateway events on this connection until it closes",
        },
    ]
}

/// Deserialize request params. Missing params read as an empty object.
pub fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, RpcError> {
    let params = match params {
        None | Some(Value::Null) => Value::Object(serde_json::Map::new()),
        Some(v) => v,
    };
    serde_json::from_value(params).map_err(|e| RpcError::InvalidParams(e.to_string()))
}
