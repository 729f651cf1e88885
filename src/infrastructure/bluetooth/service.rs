//! Ring Service
//!
//! Event loop that owns the [`ConnectionManager`] and feeds it transport
//! events, host commands and timer deadlines, one at a time.

use crate::domain::error::ConnectorError;
use crate::domain::models::{ConnectionState, ConnectorCommand, ConnectorEvent};
use crate::infrastructure::bluetooth::connection::{ConnectionManager, ConnectorConfig};
use crate::infrastructure::bluetooth::transport::{BleTransport, TransportEvent};
use crate::infrastructure::input_simulator::CursorMover;
use std::future::Future;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// How long shutdown waits for an in-flight disconnect
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

pub struct RingService<T: BleTransport> {
    manager: ConnectionManager<T>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    commands: mpsc::UnboundedReceiver<ConnectorCommand>,
}

impl<T: BleTransport> RingService<T> {
    pub fn new(
        manager: ConnectionManager<T>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        commands: mpsc::UnboundedReceiver<ConnectorCommand>,
    ) -> Self {
        Self {
            manager,
            transport_events,
            commands,
        }
    }

    pub fn manager(&self) -> &ConnectionManager<T> {
        &self.manager
    }

    /// Run until `Shutdown` arrives or every command sender is dropped
    pub async fn run(mut self) {
        info!("Ring service started");

        loop {
            let deadline = self.manager.next_deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.manager.handle_command(command) {
                            break;
                        }
                    }
                    None => {
                        info!("Command channel closed");
                        self.manager.stop();
                        break;
                    }
                },
                Some(event) = self.transport_events.recv() => {
                    self.manager.handle_transport_event(event, Instant::now());
                }
                _ = wait_until(deadline) => {
                    self.manager.handle_timers(Instant::now());
                }
            }
        }

        self.finish_disconnect().await;
        info!("Ring service stopped");
    }

    /// Give a disconnect requested during shutdown a chance to complete
    async fn finish_disconnect(&mut self) {
        let grace = tokio::time::sleep(SHUTDOWN_GRACE);
        tokio::pin!(grace);

        while self.manager.state() == ConnectionState::Stopping {
            tokio::select! {
                Some(event) = self.transport_events.recv() => {
                    self.manager.handle_transport_event(event, Instant::now());
                }
                _ = &mut grace => {
                    warn!("Disconnect did not complete before shutdown");
                    break;
                }
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
        }
        None => std::future::pending().await,
    }
}

/// Host-side handle to a connector running on its own thread
pub struct ConnectorHandle {
    commands: mpsc::UnboundedSender<ConnectorCommand>,
    thread: Option<JoinHandle<()>>,
}

impl ConnectorHandle {
    /// Queue a command; `false` once the connector has shut down
    pub fn send(&self, command: ConnectorCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<ConnectorCommand> {
        self.commands.clone()
    }

    /// Stop the connector and wait for its thread to exit
    pub fn shutdown(mut self) -> anyhow::Result<()> {
        self.join()
    }

    fn join(&mut self) -> anyhow::Result<()> {
        let _ = self.commands.send(ConnectorCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| anyhow::anyhow!("Connector thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for ConnectorHandle {
    fn drop(&mut self) {
        if let Err(e) = self.join() {
            error!("{}", e);
        }
    }
}

/// Run the connector on a dedicated thread with its own current-thread runtime
///
/// `make_transport` runs inside that runtime, so transports that spawn tokio
/// tasks can be built there.
pub fn spawn_on_thread<T, F, Fut>(
    make_transport: F,
    config: ConnectorConfig,
    cursor: Box<dyn CursorMover>,
    events: mpsc::UnboundedSender<ConnectorEvent>,
) -> anyhow::Result<ConnectorHandle>
where
    T: BleTransport + 'static,
    F: FnOnce(mpsc::UnboundedSender<TransportEvent>) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let (command_tx, command_rx) = mpsc::unbounded_channel();

    let thread = std::thread::Builder::new()
        .name("r02-ring".to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!("Failed to create tokio runtime for Bluetooth: {}", e);
                    return;
                }
            };

            rt.block_on(async move {
                let (transport_tx, transport_rx) = mpsc::unbounded_channel();
                let transport = match make_transport(transport_tx).await {
                    Ok(transport) => transport,
                    Err(e) => {
                        error!("Bluetooth unavailable: {:#}", e);
                        let _ = events
                            .send(ConnectorEvent::Error(ConnectorError::Transport(e.to_string())));
                        return;
                    }
                };

                let manager = ConnectionManager::new(transport, events, cursor, config);
                RingService::new(manager, transport_rx, command_rx)
                    .run()
                    .await;
            });
        })?;

    Ok(ConnectorHandle {
        commands: command_tx,
        thread: Some(thread),
    })
}
