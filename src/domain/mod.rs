//! Connector domain: data model, settings and signal conditioning.

pub mod error;
pub mod models;
pub mod rate;
pub mod settings;
pub mod signal;
