//! R02 Ring UART Protocol
//!
//! Command packet construction and notification decoding for the ring's
//! UART-over-GATT service.

use crate::domain::models::{BatteryStatus, RawAccelSample};
use thiserror::Error;
use tracing::trace;
use uuid::Uuid;

/// UART service exposing the command/telemetry pipe
pub const UART_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e40fff0_b5a3_f393_e0a9_e50e24dcca9e);

/// RX characteristic - commands are written here
pub const UART_RX_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

/// TX characteristic - telemetry is notified from here
pub const UART_TX_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// Client Characteristic Configuration Descriptor (Bluetooth SIG 0x2902)
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// CCCD value enabling notifications
pub const NOTIFICATIONS_ENABLE: [u8; 2] = [0x01, 0x00];

/// Advertised name prefix of the ring family
pub const RING_NAME_PREFIX: &str = "R02";

pub const PACKET_LEN: usize = 16;
/// Payload bytes between the command id and the checksum
pub const PAYLOAD_LEN: usize = PACKET_LEN - 2;

pub const CMD_BATTERY: u8 = 0x03;
pub const CMD_RAW_SENSOR: u8 = 0xA1;

pub const SUBTYPE_STREAM_DISABLE: u8 = 0x02;
pub const SUBTYPE_STREAM_ENABLE: u8 = 0x04;

pub const SUBTYPE_SPO2: u8 = 0x01;
pub const SUBTYPE_PPG: u8 = 0x02;
pub const SUBTYPE_ACCEL: u8 = 0x03;

const MIN_NOTIFICATION_LEN: usize = 3;
const RAW_SENSOR_PACKET_LEN: usize = 10;
const BATTERY_PACKET_LEN: usize = 4;

/// Commands the connector sends to the ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingCommand {
    /// Start streaming raw sensor packets
    EnableRawStream,
    /// Stop streaming raw sensor packets
    DisableRawStream,
    /// Ask for a battery packet
    BatteryRequest,
}

impl RingCommand {
    pub fn id(&self) -> u8 {
        match self {
            Self::EnableRawStream | Self::DisableRawStream => CMD_RAW_SENSOR,
            Self::BatteryRequest => CMD_BATTERY,
        }
    }

    pub fn payload(&self) -> &'static [u8] {
        match self {
            Self::EnableRawStream => &[SUBTYPE_STREAM_ENABLE],
            Self::DisableRawStream => &[SUBTYPE_STREAM_DISABLE],
            Self::BatteryRequest => &[],
        }
    }

    pub fn packet(&self) -> [u8; PACKET_LEN] {
        build_command(self.id(), self.payload())
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::EnableRawStream => "start stream",
            Self::DisableRawStream => "stop stream",
            Self::BatteryRequest => "battery request",
        }
    }
}

/// Build a 16-byte command packet
///
/// ```text
/// [0]     : command id
/// [1-14]  : payload, zero padded (extra bytes are dropped)
/// [15]    : checksum = sum of bytes 0-14, low 8 bits
/// ```
pub fn build_command(command: u8, payload: &[u8]) -> [u8; PACKET_LEN] {
    let mut packet = [0u8; PACKET_LEN];
    packet[0] = command;
    let len = payload.len().min(PAYLOAD_LEN);
    packet[1..=len].copy_from_slice(&payload[..len]);
    packet[PACKET_LEN - 1] = checksum(&packet[..PACKET_LEN - 1]);
    packet
}

pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Decode one 12-bit axis value from its (high, low) byte pair
///
/// The high byte carries the top bits and the low nibble of the second byte the
/// rest. Bit 3 of the high byte marks a negative reading.
pub fn decode_axis(high: u8, low: u8) -> i16 {
    let value = ((high as i16) << 4) | (low & 0x0F) as i16;
    if high & 0x08 != 0 {
        value - 2048
    } else {
        value
    }
}

/// PPG reading streamed alongside accelerometer data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PpgReading {
    pub value: u16,
    pub max: u16,
    pub min: u16,
    pub diff: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpO2Reading {
    pub value: u16,
    pub max: u8,
    pub min: u8,
    pub diff: u8,
}

/// A notification whose command byte was recognised
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundPacket {
    Accelerometer(RawAccelSample),
    Battery(BatteryStatus),
    Ppg(PpgReading),
    SpO2(SpO2Reading),
    /// Known command, unsupported subtype or truncated body
    Ignored { command: u8, len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("notification too short: {0} bytes")]
    TooShort(usize),
    #[error("unknown command {0:#04X}")]
    UnknownCommand(u8),
}

/// Decode a TX notification
///
/// # Notification layouts
///
/// ```text
/// Accelerometer (>= 10 bytes):
/// [0]     : 0xA1
/// [1]     : 0x03
/// [2-3]   : X (high byte, low nibble)
/// [4-5]   : Y
/// [6-7]   : Z
///
/// Battery (>= 4 bytes):
/// [0]     : 0x03
/// [1]     : level percent
/// [2-3]   : voltage, millivolts, big-endian
/// ```
///
/// The trailing checksum is not verified.
pub fn decode_notification(bytes: &[u8]) -> Result<InboundPacket, DecodeError> {
    if bytes.len() < MIN_NOTIFICATION_LEN {
        return Err(DecodeError::TooShort(bytes.len()));
    }

    #[cfg(debug_assertions)]
    trace!("Raw notification: {:02X?}", bytes);

    let ignored = InboundPacket::Ignored {
        command: bytes[0],
        len: bytes.len(),
    };

    match bytes[0] {
        CMD_RAW_SENSOR => {
            if bytes.len() < RAW_SENSOR_PACKET_LEN {
                return Ok(ignored);
            }
            let packet = match bytes[1] {
                SUBTYPE_ACCEL => InboundPacket::Accelerometer(RawAccelSample {
                    x: decode_axis(bytes[2], bytes[3]),
                    y: decode_axis(bytes[4], bytes[5]),
                    z: decode_axis(bytes[6], bytes[7]),
                }),
                SUBTYPE_PPG => InboundPacket::Ppg(PpgReading {
                    value: u16::from_be_bytes([bytes[2], bytes[3]]),
                    max: u16::from_be_bytes([bytes[4], bytes[5]]),
                    min: u16::from_be_bytes([bytes[6], bytes[7]]),
                    diff: u16::from_be_bytes([bytes[8], bytes[9]]),
                }),
                SUBTYPE_SPO2 => InboundPacket::SpO2(SpO2Reading {
                    value: u16::from_be_bytes([bytes[2], bytes[3]]),
                    max: bytes[5],
                    min: bytes[7],
                    diff: bytes[9],
                }),
                _ => ignored,
            };
            Ok(packet)
        }
        CMD_BATTERY => {
            if bytes.len() < BATTERY_PACKET_LEN {
                return Ok(ignored);
            }
            Ok(InboundPacket::Battery(BatteryStatus {
                level: bytes[1],
                voltage_mv: u16::from_be_bytes([bytes[2], bytes[3]]),
            }))
        }
        other => Err(DecodeError::UnknownCommand(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuids_match_published_strings() {
        assert_eq!(
            UART_SERVICE_UUID,
            Uuid::parse_str("6E40FFF0-B5A3-F393-E0A9-E50E24DCCA9E").unwrap()
        );
        assert_eq!(
            UART_RX_CHAR_UUID,
            Uuid::parse_str("6e400002-b5a3-f393-e0a9-e50e24dcca9e").unwrap()
        );
        assert_eq!(
            UART_TX_CHAR_UUID,
            Uuid::parse_str("6E400003-B5A3-F393-E0A9-E50E24DCCA9E").unwrap()
        );
    }

    #[test]
    fn test_command_bytes() {
        let mut start = [0u8; PACKET_LEN];
        start[0] = 0xA1;
        start[1] = 0x04;
        start[15] = 0xA5;
        assert_eq!(RingCommand::EnableRawStream.packet(), start);

        let mut stop = [0u8; PACKET_LEN];
        stop[0] = 0xA1;
        stop[1] = 0x02;
        stop[15] = 0xA3;
        assert_eq!(RingCommand::DisableRawStream.packet(), stop);

        let mut battery = [0u8; PACKET_LEN];
        battery[0] = 0x03;
        battery[15] = 0x03;
        assert_eq!(RingCommand::BatteryRequest.packet(), battery);
    }

    #[test]
    fn test_checksum_is_sum_mod_256() {
        let payloads: [&[u8]; 4] = [
            &[],
            &[0xFF; 14],
            &[0x01, 0x80, 0x7F, 0xFE],
            &[0xAA; 20], // longer than the packet; truncated
        ];
        for command in [0x00u8, 0x03, 0xA1, 0xFF] {
            for payload in payloads {
                let packet = build_command(command, payload);
                let used = &payload[..payload.len().min(PAYLOAD_LEN)];
                let expected = used
                    .iter()
                    .fold(command as u32, |acc, b| acc + *b as u32)
                    % 256;
                assert_eq!(packet[15] as u32, expected);
                assert_eq!(packet[15], checksum(&packet[..15]));
            }
        }
    }

    #[test]
    fn test_payload_is_zero_padded() {
        let packet = build_command(0x0A, &[0x02, 0x00]);
        assert_eq!(&packet[..3], &[0x0A, 0x02, 0x00]);
        assert!(packet[3..15].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_decode_axis_sign_handling() {
        assert_eq!(decode_axis(0x00, 0x00), 0);
        assert_eq!(decode_axis(0x01, 0x20), 16);
        assert_eq!(decode_axis(0x00, 0x0F), 15);
        assert_eq!(decode_axis(0x07, 0xFF), 127);
        // bit 3 of the high byte set
        assert_eq!(decode_axis(0x08, 0x00), 128 - 2048);
        assert_eq!(decode_axis(0xFF, 0x0F), 4095 - 2048);
    }

    #[test]
    fn test_decode_axis_is_injective() {
        let mut seen = std::collections::HashMap::new();
        for high in 0..=255u8 {
            for nibble in 0..16u8 {
                let value = decode_axis(high, nibble);
                // upper nibble of the low byte is ignored
                assert_eq!(value, decode_axis(high, nibble | 0xF0));
                if let Some(previous) = seen.insert(value, (high, nibble)) {
                    panic!("{value} decoded from {previous:?} and {:?}", (high, nibble));
                }
            }
        }
        assert_eq!(seen.len(), 4096);
    }

    #[test]
    fn test_decode_accelerometer_packet() {
        let bytes = [0xA1, 0x03, 0x01, 0x20, 0x00, 0xF0, 0x00, 0x10, 0x00, 0x00];
        assert_eq!(
            decode_notification(&bytes),
            Ok(InboundPacket::Accelerometer(RawAccelSample {
                x: 16,
                y: 0,
                z: 0
            }))
        );

        let bytes = [0xA1, 0x03, 0x0F, 0x0A, 0x02, 0x03, 0x7F, 0x0F, 0, 0, 0, 0];
        assert_eq!(
            decode_notification(&bytes),
            Ok(InboundPacket::Accelerometer(RawAccelSample {
                x: 0xFA - 2048,
                y: 0x23,
                z: 0x7FF - 2048,
            }))
        );
    }

    #[test]
    fn test_decode_battery_packet() {
        let bytes = [0x03, 0x55, 0x0C, 0x80, 0x00];
        assert_eq!(
            decode_notification(&bytes),
            Ok(InboundPacket::Battery(BatteryStatus {
                level: 85,
                voltage_mv: 3200
            }))
        );
    }

    #[test]
    fn test_decode_ppg_and_spo2() {
        let ppg = [0xA1, 0x02, 0x01, 0x00, 0x02, 0x00, 0x00, 0x80, 0x01, 0x80];
        assert_eq!(
            decode_notification(&ppg),
            Ok(InboundPacket::Ppg(PpgReading {
                value: 256,
                max: 512,
                min: 128,
                diff: 384
            }))
        );

        let spo2 = [0xA1, 0x01, 0x00, 0x62, 0x00, 0x63, 0x00, 0x5F, 0x00, 0x04];
        assert_eq!(
            decode_notification(&spo2),
            Ok(InboundPacket::SpO2(SpO2Reading {
                value: 98,
                max: 99,
                min: 95,
                diff: 4
            }))
        );
    }

    #[test]
    fn test_short_and_unknown_packets() {
        assert_eq!(decode_notification(&[]), Err(DecodeError::TooShort(0)));
        assert_eq!(
            decode_notification(&[0xA1, 0x03]),
            Err(DecodeError::TooShort(2))
        );
        assert_eq!(
            decode_notification(&[0x42, 0x00, 0x00, 0x00]),
            Err(DecodeError::UnknownCommand(0x42))
        );

        // recognised command, but too short for its layout
        assert_eq!(
            decode_notification(&[0xA1, 0x03, 0x01, 0x02, 0x03]),
            Ok(InboundPacket::Ignored {
                command: 0xA1,
                len: 5
            })
        );
        assert_eq!(
            decode_notification(&[0x03, 0x55, 0x0C]),
            Ok(InboundPacket::Ignored {
                command: 0x03,
                len: 3
            })
        );
        // unsupported subtype
        assert_eq!(
            decode_notification(&[0xA1, 0x09, 0, 0, 0, 0, 0, 0, 0, 0]),
            Ok(InboundPacket::Ignored {
                command: 0xA1,
                len: 10
            })
        );
    }
}
