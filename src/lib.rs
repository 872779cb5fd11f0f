//! # Meshgate - packet ingestion gateway for Meshtastic radios
//!
//! Meshgate sits between a Meshtastic radio and its clients. It turns the raw packet
//! stream into durable, merged per-node state and an ordered channel message history,
//! tracks delivery acknowledgements for outbound text, and pushes change events to a
//! sink as they happen.
//!
//! ## Features
//!
//! - **Node registry**: deep-merge of partial user, position and telemetry updates into one record per node.
//! - **Channel history**: ordered text messages per channel, with delivery status for outbound sends.
//! - **Ack tracking**: per-packet deadlines, routing ack/failure correlation, timeout sweeping.
//! - **Serial link**: framed protobuf exchange with a USB/UART attached device (feature `serial`).
//! - **Replay**: feed recorded JSON packets through the same engine without hardware.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshgate::config::Config;
//! use meshgate::gateway::{Gateway, GatewaySettings, GatewayEvent};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let (events, _rx) = tokio::sync::broadcast::channel::<GatewayEvent>(64);
//!     let gateway = Gateway::new(GatewaySettings::from(&config.gateway), Arc::new(events));
//!     println!("{} nodes known", gateway.list_nodes().len());
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`gateway`] - Registry, ledger, ack correlation, dispatcher and client commands
//! - [`meshtastic`] - Device session protocol, stream framing and the serial link
//! - [`config`] - Configuration management and validation
//! - [`protobuf`] - Protocol buffer definitions for Meshtastic packets
//! - [`metrics`] - Process-wide counters
//! - [`logutil`] - Helpers for safe log output
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │    Clients      │ ← list_* / send_message, event sink
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │    Gateway      │ ← registry, ledger, acks, dispatcher
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │   Meshtastic    │ ← serial framing and device session
//! │   Link          │
//! └─────────────────┘
//! ```

pub mod config;
pub mod gateway;
pub mod logutil;
pub mod meshtastic;
pub mod metrics;
pub mod protobuf;
