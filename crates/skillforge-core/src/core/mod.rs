//! Core coordination for skillforge
//!
//! - ForgeControl: serialized entry point for backups, restores and transitions
//! - BroadcastGateway: outbound events and user notifications

mod control;
mod gateway;

pub use control::ForgeControl;
pub use gateway::{BroadcastGateway, ChannelGateway, NullGateway};
