use crate::domain::error::ConnectorError;
use crate::domain::settings::TuningConfig;
use serde::{Deserialize, Serialize};

/// Connector lifecycle.
///
/// ```text
/// Idle → Discovering → ConnectingGatt → DiscoveringServices
///      → SubscribingNotifications → Streaming → Stopping → Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Discovering,
    ConnectingGatt,
    DiscoveringServices,
    SubscribingNotifications,
    Streaming,
    Stopping,
}

/// A ring found during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingDevice {
    pub address: String,
    pub name: String,
}

/// Advertisement as reported by the platform scanner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: String,
    pub name: String,
    pub le_capable: bool,
}

/// Accelerometer axes exactly as decoded from the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawAccelSample {
    pub x: i16,
    pub y: i16,
    pub z: i16,
}

/// Output of the signal pipeline: rotated X/Y and unsmoothed Z
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProcessedSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Relative cursor movement in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PointerDelta {
    pub dx: i32,
    pub dy: i32,
}

impl PointerDelta {
    pub fn is_zero(&self) -> bool {
        self.dx == 0 && self.dy == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryStatus {
    /// Charge level, 0-100
    pub level: u8,
    /// Cell voltage in millivolts
    pub voltage_mv: u16,
}

/// Events published to whoever hosts the connector (UI, tray, CLI)
#[derive(Debug, Clone)]
pub enum ConnectorEvent {
    Status(StatusMessage),
    Error(ConnectorError),
    ConnectionStateChanged(ConnectionState),
    Accelerometer(ProcessedSample),
    BatteryChanged(BatteryStatus),
    PacketRateChanged(f64),
    AutoReconnectChanged(bool),
    MouseControlChanged(bool),
    TuningChanged(TuningConfig),
}

/// Requests accepted by the connector event loop
#[derive(Debug, Clone)]
pub enum ConnectorCommand {
    StartDiscovery,
    Stop,
    Calibrate,
    SetAutoReconnect(bool),
    SetMouseControl(bool),
    SetRotation(f64),
    SetSensitivity(f64),
    SetDeadzone(i32),
    SetSmoothing(f64),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

impl StatusMessage {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: MessageSeverity::Info,
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: MessageSeverity::Success,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: MessageSeverity::Warning,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
}
