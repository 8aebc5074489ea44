#![allow(clippy::doc_markdown)]

//! worldlink-daemon - client link to the world simulator.
//!
//! This library connects a fleet backend to the world simulator over a
//! single TCP connection, issues truck commands, and reconciles the events
//! the simulator pushes back against the requests that caused them.
//!
//! # Runtime Requirements
//!
//! The link spawns its reader, writer and sweeper as tokio tasks, so every
//! [`link::SimulatorLink`] method must be called from within a tokio runtime.
//!
//! # Modules
//!
//! - [`protocol`]: varint framing, protobuf messages and the connect
//!   handshake
//! - [`link`]: the link itself, request correlation, dispatch, routing and
//!   reconnection
//! - [`health`]: health reports for monitoring
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use worldlink_core::LinkConfig;
//! use worldlink_daemon::link::{InMemoryFleet, SimulatorLink};
//!
//! let config = LinkConfig::default();
//! let trucks = config.initial_fleet();
//! let link = SimulatorLink::new(config, Arc::new(InMemoryFleet::new(trucks.clone())));
//! let world_id = link.connect(None, trucks).await?;
//! let reply = link.pickup(1, 3)?.wait().await?;
//! ```

pub mod health;
pub mod link;
pub mod protocol;

pub use health::{HealthReport, HealthStatus};
pub use link::{LinkError, LinkPhase, LinkResult, SimulatorLink};
