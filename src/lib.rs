//! # Meshwatch - MQTT Node Tracker for Meshtastic Networks
//!
//! Meshwatch subscribes to the JSON topic tree a Meshtastic MQTT gateway publishes,
//! keeps a per-node view of everything it hears (names, position, telemetry, signal
//! quality, message statistics), persists that view atomically to a YAML node
//! database, and can answer configured "signal check" text messages on-air.
//!
//! ## Features
//!
//! - **Node Database**: Latest-value state per node, merged from unordered JSON
//!   events and saved with a write-temp-then-rename discipline that survives
//!   crashes mid-write.
//! - **Auto-Responder**: Exact-match trigger phrases answered with a greeting that
//!   names the uplink station and reports hop count or RSSI/SNR, jittered to avoid
//!   channel collisions.
//! - **MQTT Integration**: rumqttc-backed subscription to `<root>/2/json/#` with
//!   automatic reconnect and resubscribe.
//! - **Fault Isolation**: A malformed message is logged and dropped; it never
//!   takes down the subscription loop or the save loop.
//! - **Async Design**: Built with Tokio; registry merges never block on I/O.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshwatch::config::Config;
//! use meshwatch::tracker::TrackerServer;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Load configuration
//!     let config = Config::load("meshwatch.toml").await?;
//!
//!     // Create and run the tracker
//!     let mut tracker = TrackerServer::new(config)?;
//!     tracker.run().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`tracker`] - The orchestrating server loop
//! - [`mqtt`] - Topic routing and the MQTT bus gateway
//! - [`event`] - JSON event decoding into typed mesh events
//! - [`nodedb`] - The node registry, merge logic, and YAML persistence
//! - [`responder`] - Trigger matching and reply composition
//! - [`config`] - Configuration management
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  MQTT Gateway   │ ← rumqttc subscription / publish
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │  Tracker Loop   │ ← topic router → event decoder → registry merge
//! └─────────────────┘
//!     │          │
//! ┌────────┐ ┌───────────┐
//! │ NodeDb │ │ Responder │ ← jittered replies back through the gateway
//! └────────┘ └───────────┘
//!     │
//! ┌─────────────────┐
//! │  Save Loop      │ ← periodic atomic YAML snapshots
//! └─────────────────┘
//! ```

pub mod config;
pub mod event;
pub mod logutil;
pub mod metrics;
pub mod mqtt;
pub mod nodedb;
pub mod responder;
pub mod tracker;
