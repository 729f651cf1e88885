use r02_ring_connector::domain::models::{ConnectorCommand, ConnectorEvent, MessageSeverity};
use r02_ring_connector::domain::settings::SettingsService;
use r02_ring_connector::infrastructure::bluetooth::btleplug_transport::BtleplugTransport;
use r02_ring_connector::infrastructure::bluetooth::{spawn_on_thread, ConnectorConfig};
use r02_ring_connector::infrastructure::input_simulator::platform_cursor;
use r02_ring_connector::infrastructure::logging::init_logger;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::load();
    let _logging_guard = init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting R02 ring connector");
    if let Some(path) = settings_service.path() {
        debug!("Settings file: {}", path.display());
    }
    let settings = settings_service.into_settings();

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let scan_timeout = settings.timing.scan_timeout();
    let connector = spawn_on_thread(
        move |transport_tx| BtleplugTransport::new(transport_tx, scan_timeout),
        ConnectorConfig::from_settings(&settings),
        platform_cursor(),
        event_tx,
    )?;
    connector.send(ConnectorCommand::StartDiscovery);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(async {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    break;
                }
                event = event_rx.recv() => match event {
                    Some(event) => report(event),
                    None => break,
                },
            }
        }
    });

    connector.shutdown()
}

fn report(event: ConnectorEvent) {
    match event {
        ConnectorEvent::Status(status) => match status.severity {
            MessageSeverity::Warning => warn!("{}", status.message),
            _ => info!("{}", status.message),
        },
        ConnectorEvent::Error(e) => warn!("Connector error: {}", e),
        ConnectorEvent::ConnectionStateChanged(state) => info!("State: {:?}", state),
        ConnectorEvent::Accelerometer(sample) => {
            trace!("Accel x={:.1} y={:.1} z={:.1}", sample.x, sample.y, sample.z)
        }
        ConnectorEvent::BatteryChanged(battery) => {
            info!("Battery: {}% ({} mV)", battery.level, battery.voltage_mv)
        }
        ConnectorEvent::PacketRateChanged(rate) => debug!("Packet rate: {:.1}/s", rate),
        ConnectorEvent::AutoReconnectChanged(enabled) => info!("Auto-reconnect: {}", enabled),
        ConnectorEvent::MouseControlChanged(enabled) => info!("Mouse control: {}", enabled),
        ConnectorEvent::TuningChanged(tuning) => debug!("Tuning: {:?}", tuning),
    }
}
