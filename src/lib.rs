//! Connector for the R02 smart ring.
//!
//! Finds the ring over BLE, streams its accelerometer, and turns tilt into
//! pointer movement. The connector runs as a single event loop
//! ([`infrastructure::bluetooth::RingService`]) and talks to its host through
//! [`domain::models::ConnectorCommand`] and [`domain::models::ConnectorEvent`].

pub mod domain;
pub mod infrastructure;
