//! Ring Connection Manager
//!
//! Owns the single GATT session to the ring and walks it through discovery,
//! connection, service discovery, notification subscription and streaming.
//! Everything here runs on the connector's event loop; transport requests
//! return immediately and their outcomes come back as [`TransportEvent`]s.

use crate::domain::error::ConnectorError;
use crate::domain::models::{
    Advertisement, BatteryStatus, ConnectionState, ConnectorCommand, ConnectorEvent,
    RingDevice, StatusMessage,
};
use crate::domain::rate::PacketRateMonitor;
use crate::domain::settings::{Settings, TuningConfig};
use crate::domain::signal::{pointer_delta, SignalProcessor};
use crate::infrastructure::bluetooth::battery::BatteryPoller;
use crate::infrastructure::bluetooth::protocol::{
    self, InboundPacket, RingCommand, CCCD_UUID, NOTIFICATIONS_ENABLE, RING_NAME_PREFIX,
    UART_RX_CHAR_UUID, UART_SERVICE_UUID, UART_TX_CHAR_UUID,
};
use crate::infrastructure::bluetooth::transport::{
    BleTransport, CharacteristicHandle, LinkState, TransportEvent,
};
use crate::infrastructure::input_simulator::CursorMover;
use crate::infrastructure::timer::{TimerKind, Timers};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Configuration for connector behavior
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub tuning: TuningConfig,
    pub auto_reconnect: bool,
    pub mouse_control: bool,
    pub battery_poll_interval: Duration,
    pub packet_rate_window: Duration,
    pub reconnect_delay: Duration,
    /// How long `stop()` lets the "disable stream" write drain
    pub stop_drain: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl ConnectorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            tuning: settings.tuning.sanitized(),
            auto_reconnect: settings.auto_reconnect,
            mouse_control: settings.mouse_control_enabled,
            battery_poll_interval: settings.timing.battery_poll_interval(),
            packet_rate_window: settings.timing.packet_rate_window(),
            reconnect_delay: settings.timing.reconnect_delay(),
            stop_drain: settings.timing.stop_drain(),
        }
    }
}

/// Resources tied to one connection attempt
#[derive(Debug)]
struct Session {
    device: RingDevice,
    uart_service_found: bool,
    rx: Option<CharacteristicHandle>,
    tx: Option<CharacteristicHandle>,
    subscribe_requested: bool,
    notifications_enabled: bool,
}

impl Session {
    fn new(device: RingDevice) -> Self {
        Self {
            device,
            uart_service_found: false,
            rx: None,
            tx: None,
            subscribe_requested: false,
            notifications_enabled: false,
        }
    }
}

/// The connector state machine
pub struct ConnectionManager<T: BleTransport> {
    transport: T,
    event_sender: mpsc::UnboundedSender<ConnectorEvent>,
    cursor: Box<dyn CursorMover>,

    state: ConnectionState,
    session: Option<Session>,
    /// `stop()` asked for a disconnect; the link is released once it completes
    release_pending: bool,
    /// A reconnect cycle is in progress after an unexpected loss
    reconnecting: bool,

    timers: Timers,
    battery_poller: BatteryPoller,
    packet_rate: PacketRateMonitor,
    signal: SignalProcessor,

    tuning: TuningConfig,
    battery: Option<BatteryStatus>,
    auto_reconnect: bool,
    mouse_control: bool,
    reconnect_delay: Duration,
    stop_drain: Duration,
}

impl<T: BleTransport> ConnectionManager<T> {
    pub fn new(
        transport: T,
        event_sender: mpsc::UnboundedSender<ConnectorEvent>,
        cursor: Box<dyn CursorMover>,
        config: ConnectorConfig,
    ) -> Self {
        Self {
            transport,
            event_sender,
            cursor,
            state: ConnectionState::Idle,
            session: None,
            release_pending: false,
            reconnecting: false,
            timers: Timers::new(),
            battery_poller: BatteryPoller::new(config.battery_poll_interval),
            packet_rate: PacketRateMonitor::new(config.packet_rate_window),
            signal: SignalProcessor::new(),
            tuning: config.tuning,
            battery: None,
            auto_reconnect: config.auto_reconnect,
            mouse_control: config.mouse_control,
            reconnect_delay: config.reconnect_delay,
            stop_drain: config.stop_drain,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn device(&self) -> Option<&RingDevice> {
        self.session.as_ref().map(|s| &s.device)
    }

    pub fn tuning(&self) -> TuningConfig {
        self.tuning
    }

    /// `None` until the first battery packet arrives
    pub fn battery(&self) -> Option<BatteryStatus> {
        self.battery
    }

    pub fn packet_rate(&self) -> f64 {
        self.packet_rate.rate()
    }

    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect
    }

    pub fn mouse_control(&self) -> bool {
        self.mouse_control
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Scan for a ring and connect to the first match
    ///
    /// Any active session is torn down first so two sessions never overlap.
    pub fn start_discovery(&mut self) {
        // Stopping without a session only has the deferred release left
        let torn_down = matches!(
            self.state,
            ConnectionState::Idle | ConnectionState::Stopping
        );
        if self.session.is_some() || !torn_down {
            info!("Tearing down active session before discovery");
            self.stop();
        }
        if self.release_pending {
            debug!("Releasing previous link without waiting for disconnect");
            self.release_pending = false;
            self.transport.release();
        }
        self.timers.cancel(TimerKind::Reconnect);

        self.set_state(ConnectionState::Discovering);
        self.status(StatusMessage::info("Starting device discovery..."));
        self.transport.start_scan();
    }

    /// Tear the session down from any state
    pub fn stop(&mut self) {
        if self.state == ConnectionState::Streaming {
            self.send_command(RingCommand::DisableRawStream);
            // Let the write leave the radio before the link goes away
            self.transport.drain(self.stop_drain);
        }
        if self.state == ConnectionState::Discovering {
            self.transport.stop_scan();
        }

        self.reconnecting = false;
        self.timers.cancel(TimerKind::Reconnect);
        self.stop_stream_timers();

        if let Some(session) = self.session.take() {
            if session.notifications_enabled {
                if let Some(tx) = session.tx.as_ref() {
                    self.transport.unsubscribe(tx);
                }
            }
            info!("Closing session with {}", session.device.address);

            match self.transport.link_state() {
                LinkState::Idle => self.transport.release(),
                _ => {
                    self.release_pending = true;
                    self.transport.disconnect();
                }
            }
        }

        let next = if self.release_pending {
            ConnectionState::Stopping
        } else {
            ConnectionState::Idle
        };
        self.set_state(next);
        self.status(StatusMessage::info("Stopped"));
    }

    /// Use the latest raw sample as the new zero point
    pub fn calibrate(&mut self) {
        let offset = self.signal.calibrate();
        self.status(StatusMessage::success(format!(
            "Calibrated: offset ({}, {}, {})",
            offset.x, offset.y, offset.z
        )));
    }

    pub fn set_auto_reconnect(&mut self, enabled: bool) {
        if self.auto_reconnect == enabled {
            return;
        }
        self.auto_reconnect = enabled;
        if !enabled {
            self.reconnecting = false;
            if self.timers.cancel(TimerKind::Reconnect) {
                info!("Pending reconnect cancelled");
            }
        }
        self.emit(ConnectorEvent::AutoReconnectChanged(enabled));
    }

    pub fn set_mouse_control(&mut self, enabled: bool) {
        if self.mouse_control == enabled {
            return;
        }
        self.mouse_control = enabled;
        self.emit(ConnectorEvent::MouseControlChanged(enabled));
    }

    pub fn set_rotation(&mut self, degrees: f64) {
        let changed = self.tuning.set_rotation(degrees);
        self.tuning_changed(changed);
    }

    pub fn set_sensitivity(&mut self, sensitivity: f64) {
        let changed = self.tuning.set_sensitivity(sensitivity);
        self.tuning_changed(changed);
    }

    pub fn set_deadzone(&mut self, deadzone: i32) {
        let changed = self.tuning.set_deadzone(deadzone);
        self.tuning_changed(changed);
    }

    pub fn set_smoothing(&mut self, smoothing: f64) {
        let changed = self.tuning.set_smoothing(smoothing);
        self.tuning_changed(changed);
    }

    /// Apply a host request; returns `false` once the connector should shut down
    pub fn handle_command(&mut self, command: ConnectorCommand) -> bool {
        debug!("Command: {:?}", command);
        match command {
            ConnectorCommand::StartDiscovery => self.start_discovery(),
            ConnectorCommand::Stop => self.stop(),
            ConnectorCommand::Calibrate => self.calibrate(),
            ConnectorCommand::SetAutoReconnect(enabled) => self.set_auto_reconnect(enabled),
            ConnectorCommand::SetMouseControl(enabled) => self.set_mouse_control(enabled),
            ConnectorCommand::SetRotation(degrees) => self.set_rotation(degrees),
            ConnectorCommand::SetSensitivity(sensitivity) => self.set_sensitivity(sensitivity),
            ConnectorCommand::SetDeadzone(deadzone) => self.set_deadzone(deadzone),
            ConnectorCommand::SetSmoothing(smoothing) => self.set_smoothing(smoothing),
            ConnectorCommand::Shutdown => {
                self.stop();
                return false;
            }
        }
        true
    }

    /// Run every timer due at `now`
    pub fn handle_timers(&mut self, now: Instant) {
        for kind in self.timers.take_due(now) {
            match kind {
                TimerKind::BatteryPoll => self.poll_battery(),
                TimerKind::PacketRate => {
                    if let Some(rate) = self.packet_rate.tick() {
                        debug!("Packet rate: {:.1}/s", rate);
                        self.emit(ConnectorEvent::PacketRateChanged(rate));
                    }
                }
                TimerKind::Reconnect => {
                    info!("Reconnecting to ring");
                    self.start_discovery();
                }
            }
        }
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::DeviceDiscovered(advertisement) => {
                self.on_device_discovered(advertisement)
            }
            TransportEvent::ScanFinished => self.on_scan_finished(None, now),
            TransportEvent::ScanFailed(message) => self.on_scan_finished(Some(message), now),
            TransportEvent::Connected => self.on_connected(),
            TransportEvent::ConnectFailed(message) => self.on_connect_failed(message, now),
            TransportEvent::ServiceDiscovered(uuid) => self.on_service_discovered(uuid),
            TransportEvent::ServiceDiscoveryFinished => self.on_service_discovery_finished(),
            TransportEvent::ServiceDetailsDiscovered(uuid) => self.on_service_details(uuid),
            TransportEvent::DescriptorWritten {
                characteristic,
                descriptor,
            } => self.on_descriptor_written(characteristic, descriptor, now),
            TransportEvent::DescriptorWriteFailed(message) => {
                warn!("Notification subscription failed: {}", message);
                self.error(ConnectorError::Transport(format!(
                    "subscribing to notifications failed: {message}"
                )));
            }
            TransportEvent::Notification {
                characteristic,
                value,
            } => self.on_notification(characteristic, &value),
            TransportEvent::WriteFailed(message) => {
                warn!("Write failed: {}", message);
                self.error(ConnectorError::Transport(message));
            }
            TransportEvent::Disconnected => self.on_disconnected(now),
        }
    }

    fn on_device_discovered(&mut self, advertisement: Advertisement) {
        if self.state != ConnectionState::Discovering {
            trace!("Ignoring advertisement outside discovery: {}", advertisement.name);
            return;
        }
        if !advertisement.le_capable || !advertisement.name.starts_with(RING_NAME_PREFIX) {
            trace!("Skipping {} ({})", advertisement.name, advertisement.address);
            return;
        }

        self.transport.stop_scan();
        let device = RingDevice {
            address: advertisement.address,
            name: advertisement.name,
        };
        info!("Found ring {} at {}", device.name, device.address);
        self.status(StatusMessage::info(format!(
            "Found Ring: {} ({})",
            device.name, device.address
        )));

        self.transport.connect(&device);
        self.session = Some(Session::new(device));
        self.set_state(ConnectionState::ConnectingGatt);
        self.status(StatusMessage::info("Connecting to ring..."));
    }

    fn on_scan_finished(&mut self, failure: Option<String>, now: Instant) {
        if self.state != ConnectionState::Discovering {
            debug!("Device discovery finished");
            return;
        }
        self.set_state(ConnectionState::Idle);
        match failure {
            Some(message) => self.error(ConnectorError::Discovery(message)),
            None => self.error(ConnectorError::DeviceNotFound),
        }
        if self.reconnecting {
            self.schedule_reconnect(now);
        }
    }

    fn on_connected(&mut self) {
        if self.state != ConnectionState::ConnectingGatt {
            debug!("Ignoring stale connect in {:?}", self.state);
            return;
        }
        self.set_state(ConnectionState::DiscoveringServices);
        self.status(StatusMessage::info(
            "Controller connected. Discovering services...",
        ));
        self.transport.discover_services();
    }

    fn on_connect_failed(&mut self, message: String, now: Instant) {
        if self.release_pending {
            self.finish_release();
            return;
        }
        if self.state != ConnectionState::ConnectingGatt {
            debug!("Ignoring stale connect failure: {}", message);
            return;
        }
        warn!("GATT connection failed: {}", message);
        self.lose_session(ConnectorError::GattConnect(message), now);
    }

    fn on_service_discovered(&mut self, uuid: uuid::Uuid) {
        if self.state != ConnectionState::DiscoveringServices {
            return;
        }
        if uuid != UART_SERVICE_UUID {
            trace!("Skipping service {}", uuid);
            return;
        }
        if let Some(session) = self.session.as_mut() {
            session.uart_service_found = true;
        }
        self.status(StatusMessage::info("UART Service found."));
        self.transport.discover_service_details(UART_SERVICE_UUID);
    }

    fn on_service_discovery_finished(&mut self) {
        if self.state != ConnectionState::DiscoveringServices {
            return;
        }
        let found = self
            .session
            .as_ref()
            .map(|s| s.uart_service_found)
            .unwrap_or(false);
        if found {
            self.status(StatusMessage::info("Service discovery finished."));
        } else {
            self.error(ConnectorError::ServiceMissing);
        }
    }

    fn on_service_details(&mut self, service: uuid::Uuid) {
        if self.state != ConnectionState::DiscoveringServices || service != UART_SERVICE_UUID {
            return;
        }
        self.status(StatusMessage::info("UART Service details discovered."));

        let rx = self
            .transport
            .characteristic(UART_SERVICE_UUID, UART_RX_CHAR_UUID);
        let tx = self
            .transport
            .characteristic(UART_SERVICE_UUID, UART_TX_CHAR_UUID);
        if let Some(session) = self.session.as_mut() {
            session.rx = rx;
            session.tx = tx;
        }

        match rx {
            Some(_) => self.status(StatusMessage::info("RX Characteristic found.")),
            None => self.error(ConnectorError::CharacteristicMissing("RX")),
        }
        match tx {
            Some(_) => self.status(StatusMessage::info("TX Characteristic found.")),
            None => self.error(ConnectorError::CharacteristicMissing("TX")),
        }
        let (Some(_), Some(tx)) = (rx, tx) else {
            return;
        };

        self.set_state(ConnectionState::SubscribingNotifications);
        if !self.transport.has_descriptor(&tx, CCCD_UUID) {
            self.error(ConnectorError::DescriptorMissing);
            return;
        }
        self.status(StatusMessage::info("Subscribing to TX notifications..."));
        if let Some(session) = self.session.as_mut() {
            session.subscribe_requested = true;
        }
        self.transport
            .write_descriptor(&tx, CCCD_UUID, &NOTIFICATIONS_ENABLE);
    }

    fn on_descriptor_written(
        &mut self,
        characteristic: uuid::Uuid,
        descriptor: uuid::Uuid,
        now: Instant,
    ) {
        if self.state != ConnectionState::SubscribingNotifications
            || characteristic != UART_TX_CHAR_UUID
            || descriptor != CCCD_UUID
        {
            return;
        }
        match self.session.as_mut() {
            Some(session) if session.subscribe_requested => session.notifications_enabled = true,
            _ => {
                debug!("Ignoring unrequested descriptor write");
                return;
            }
        }

        self.send_command(RingCommand::EnableRawStream);
        self.set_state(ConnectionState::Streaming);
        self.reconnecting = false;
        self.status(StatusMessage::success("Streaming accelerometer data"));

        self.poll_battery();
        self.battery_poller.start(&mut self.timers, now);
        self.timers
            .schedule_repeating(TimerKind::PacketRate, now, self.packet_rate.window());
    }

    fn on_notification(&mut self, characteristic: uuid::Uuid, value: &[u8]) {
        if characteristic != UART_TX_CHAR_UUID
            || !matches!(
                self.state,
                ConnectionState::SubscribingNotifications | ConnectionState::Streaming
            )
        {
            return;
        }

        match protocol::decode_notification(value) {
            Ok(packet) => {
                self.packet_rate.record_packet();
                self.route_packet(packet);
            }
            Err(e) => trace!("Dropping notification: {}", e),
        }
    }

    fn route_packet(&mut self, packet: InboundPacket) {
        match packet {
            InboundPacket::Accelerometer(raw) => {
                let sample = self.signal.process(raw, &self.tuning);
                self.emit(ConnectorEvent::Accelerometer(sample));

                if self.mouse_control {
                    let delta = pointer_delta(&sample, &self.tuning);
                    if !delta.is_zero() {
                        if let Err(e) = self.cursor.move_by(delta.dx, delta.dy) {
                            warn!("Pointer move failed: {}", e);
                        }
                    }
                }
            }
            InboundPacket::Battery(status) => {
                if self.battery != Some(status) {
                    info!(
                        "Battery {}% ({} mV)",
                        status.level, status.voltage_mv
                    );
                    self.battery = Some(status);
                    self.emit(ConnectorEvent::BatteryChanged(status));
                }
            }
            InboundPacket::Ppg(reading) => trace!("PPG: {:?}", reading),
            InboundPacket::SpO2(reading) => trace!("SpO2: {:?}", reading),
            InboundPacket::Ignored { command, len } => {
                trace!("Ignoring packet {:#04X} ({} bytes)", command, len)
            }
        }
    }

    fn on_disconnected(&mut self, now: Instant) {
        if self.release_pending {
            self.finish_release();
            return;
        }
        if self.session.is_none() {
            debug!("Ignoring disconnect without a session");
            return;
        }
        warn!("Ring disconnected unexpectedly");
        self.lose_session(ConnectorError::GattDisconnected, now);
    }

    /// Complete a disconnect requested by `stop()`
    fn finish_release(&mut self) {
        self.release_pending = false;
        self.transport.release();
        self.set_state(ConnectionState::Idle);
        self.status(StatusMessage::info("Controller disconnected."));
    }

    /// Drop a session the transport lost, then apply the reconnect policy
    fn lose_session(&mut self, error: ConnectorError, now: Instant) {
        self.stop_stream_timers();
        self.session = None;
        self.transport.release();
        self.set_state(ConnectionState::Idle);
        self.error(error);

        if self.auto_reconnect {
            self.reconnecting = true;
            self.schedule_reconnect(now);
        }
    }

    fn schedule_reconnect(&mut self, now: Instant) {
        if !self.auto_reconnect {
            self.reconnecting = false;
            return;
        }
        self.timers
            .schedule_once(TimerKind::Reconnect, now, self.reconnect_delay);
        self.status(StatusMessage::warning(format!(
            "Reconnecting in {} ms...",
            self.reconnect_delay.as_millis()
        )));
    }

    fn stop_stream_timers(&mut self) {
        self.battery_poller.stop(&mut self.timers);
        self.timers.cancel(TimerKind::PacketRate);
        if let Some(rate) = self.packet_rate.reset() {
            self.emit(ConnectorEvent::PacketRateChanged(rate));
        }
    }

    fn poll_battery(&mut self) {
        let (notifications_enabled, rx_resolved) = self
            .session
            .as_ref()
            .map(|s| (s.notifications_enabled, s.rx.is_some()))
            .unwrap_or((false, false));

        match BatteryPoller::request(notifications_enabled, rx_resolved) {
            Ok(command) => self.send_command(command),
            Err(e) => self.error(e),
        }
    }

    /// Fire-and-forget write to RX; dropped when RX is not resolved
    fn send_command(&mut self, command: RingCommand) {
        let Some(rx) = self.session.as_ref().and_then(|s| s.rx) else {
            self.error(ConnectorError::WriteNotReady(command.label()));
            return;
        };
        let packet = command.packet();
        debug!("Writing '{}' command: {:02X?}", command.label(), packet);
        self.transport.write_without_response(&rx, &packet);
    }

    fn tuning_changed(&mut self, changed: bool) {
        if changed {
            self.emit(ConnectorEvent::TuningChanged(self.tuning));
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        debug!("State {:?} -> {:?}", self.state, state);
        self.state = state;
        self.emit(ConnectorEvent::ConnectionStateChanged(state));
    }

    fn status(&self, message: StatusMessage) {
        info!("{}", message.message);
        self.emit(ConnectorEvent::Status(message));
    }

    fn error(&self, error: ConnectorError) {
        warn!("{}", error);
        self.emit(ConnectorEvent::Error(error));
    }

    fn emit(&self, event: ConnectorEvent) {
        let _ = self.event_sender.send(event);
    }
}

impl<T: BleTransport> Drop for ConnectionManager<T> {
    fn drop(&mut self) {
        if self.session.is_some() || self.state == ConnectionState::Discovering {
            self.stop();
        }
        if self.release_pending {
            self.release_pending = false;
            self.transport.release();
        }
    }
}
