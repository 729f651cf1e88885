//! Bluetooth Module
//!
//! BLE connection to the R02 ring.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      RingService                         │
//! │   (event loop: transport events, commands, timers)       │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                  ConnectionManager                       │
//! │   (discovery → GATT → subscribe → stream, reconnect)     │
//! └──────┬──────────────┬──────────────┬────────────────────┘
//!        │              │              │
//!        ▼              ▼              ▼
//! ┌────────────┐  ┌────────────┐  ┌──────────────┐
//! │ Transport  │  │  Protocol  │  │   Battery    │
//! │            │  │            │  │              │
//! │ - btleplug │  │ - UUIDs    │  │ - poll timer │
//! │ - fake     │  │ - commands │  │              │
//! │   (tests)  │  │ - decoding │  │              │
//! └────────────┘  └────────────┘  └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Ring UART protocol: UUIDs, command packets, notification decoding
//! - [`transport`] - The platform BLE boundary
//! - [`connection`] - Connection state machine
//! - [`battery`] - Battery polling
//! - [`service`] - Event loop and thread hosting

pub mod battery;
#[cfg(feature = "btleplug")]
pub mod btleplug_transport;
pub mod connection;
pub mod protocol;
pub mod service;
pub mod transport;

pub use connection::{ConnectionManager, ConnectorConfig};
pub use service::{spawn_on_thread, ConnectorHandle, RingService};
