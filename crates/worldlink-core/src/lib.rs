#![allow(clippy::doc_markdown)]

//! worldlink-core - shared building blocks for the world simulator link.
//!
//! This crate holds everything the link needs that does not touch a socket:
//!
//! - [`config`]: TOML configuration with environment overrides
//! - [`fleet`]: truck, status and delivery types plus argument validation
//! - [`reconnect`]: reconnection policy and exponential backoff schedule

pub mod config;
pub mod fleet;
pub mod reconnect;

pub use config::{ConfigError, LinkConfig, RequestConfig, SimulatorConfig};
pub use fleet::{
    DeliveryDrop, PackageId, TruckId, TruckSnapshot, TruckStatus, ValidationError, WarehouseId,
};
pub use reconnect::{BackoffSchedule, ReconnectPolicy};
