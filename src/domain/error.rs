use thiserror::Error;

/// Failures surfaced to the host as `ConnectorEvent::Error`.
///
/// None of these are fatal; the connector stays usable and the caller may
/// retry discovery.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    #[error("Device discovery finished: no ring found")]
    DeviceNotFound,
    #[error("Device discovery error: {0}")]
    Discovery(String),
    #[error("GATT connection failed: {0}")]
    GattConnect(String),
    #[error("Ring disconnected unexpectedly")]
    GattDisconnected,
    #[error("UART service not found")]
    ServiceMissing,
    #[error("{0} characteristic not found")]
    CharacteristicMissing(&'static str),
    #[error("CCCD not found for TX characteristic")]
    DescriptorMissing,
    #[error("Cannot write {0}: RX characteristic not ready")]
    WriteNotReady(&'static str),
    #[error("Transport error: {0}")]
    Transport(String),
}
