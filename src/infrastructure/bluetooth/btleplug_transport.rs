//! btleplug Transport
//!
//! Maps [`BleTransport`] requests onto btleplug. Every request spawns work on
//! the current tokio runtime and reports back through the transport event
//! channel, so the connector loop never awaits the radio.
//!
//! Tasks tied to a link carry the link generation they were started for;
//! `release()` bumps the generation so late results from a released link are
//! dropped instead of reaching the next session.

use crate::domain::models::{Advertisement, RingDevice};
use crate::infrastructure::bluetooth::protocol::{CCCD_UUID, NOTIFICATIONS_ENABLE};
use crate::infrastructure::bluetooth::transport::{
    join_within, BleTransport, CharacteristicHandle, LinkState, PeripheralDirectory,
    TransportEvent, UNKNOWN_ADDRESS,
};
use anyhow::anyhow;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Ordered per-link GATT operations
enum Op {
    Write(Characteristic, Vec<u8>),
    Unsubscribe(Characteristic),
}

#[derive(Default)]
struct Link {
    state: LinkState,
    generation: u64,
    peripheral: Option<Peripheral>,
    ops: Option<mpsc::UnboundedSender<Op>>,
    writer: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Link {
    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

type SharedLink = Arc<Mutex<Link>>;
type SharedDirectory = Arc<Mutex<PeripheralDirectory<PeripheralId>>>;

fn lock<T>(shared: &Mutex<T>) -> MutexGuard<'_, T> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct BtleplugTransport {
    adapter: Adapter,
    events: mpsc::UnboundedSender<TransportEvent>,
    scan_timeout: Duration,
    scan_task: Option<JoinHandle<()>>,
    connect_task: Option<JoinHandle<()>>,
    /// Time the next disconnect gives queued writes to flush
    drain_budget: Duration,
    link: SharedLink,
    /// Peripherals reported by scans, so connect can go through the id
    directory: SharedDirectory,
}

impl BtleplugTransport {
    /// Open the first Bluetooth adapter
    pub async fn new(
        events: mpsc::UnboundedSender<TransportEvent>,
        scan_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;

        match adapter.adapter_info().await {
            Ok(info) => info!("Using Bluetooth adapter: {}", info),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }

        Ok(Self {
            adapter,
            events,
            scan_timeout,
            scan_task: None,
            connect_task: None,
            drain_budget: Duration::ZERO,
            link: SharedLink::default(),
            directory: SharedDirectory::default(),
        })
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        lock(&self.link)
    }

    fn peripheral(&self) -> Option<Peripheral> {
        self.link().peripheral.clone()
    }

    fn send(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn resolve(&self, handle: &CharacteristicHandle) -> Option<(Peripheral, Characteristic)> {
        let peripheral = self.peripheral()?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == handle.service && c.uuid == handle.uuid)?;
        Some((peripheral, characteristic))
    }

    /// Spawn work that dies with the current link
    fn spawn_link_task<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        self.link().tasks.push(handle);
    }

    fn queue(&self, op: Op) -> bool {
        match self.link().ops.as_ref() {
            Some(ops) => ops.send(op).is_ok(),
            None => false,
        }
    }
}

impl BleTransport for BtleplugTransport {
    fn start_scan(&mut self) {
        self.stop_scan();

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let directory = self.directory.clone();
        let timeout = self.scan_timeout;
        info!("Scanning for rings ({}s)", timeout.as_secs());

        self.scan_task = Some(tokio::spawn(async move {
            match scan(&adapter, &events, &directory, timeout).await {
                Ok(()) => {
                    let _ = events.send(TransportEvent::ScanFinished);
                }
                Err(e) => {
                    let _ = events.send(TransportEvent::ScanFailed(format!("{e:#}")));
                }
            }
            let _ = adapter.stop_scan().await;
        }));
    }

    fn stop_scan(&mut self) {
        if let Some(task) = self.scan_task.take() {
            task.abort();
            let adapter = self.adapter.clone();
            tokio::spawn(async move {
                if let Err(e) = adapter.stop_scan().await {
                    debug!("stop_scan: {}", e);
                }
            });
        }
    }

    fn connect(&mut self, device: &RingDevice) {
        let generation = {
            let mut link = self.link();
            link.state = LinkState::Connecting;
            link.generation
        };
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let shared = self.link.clone();
        let address = device.address.clone();
        let id = lock(&self.directory).lookup(&address);

        self.connect_task = Some(tokio::spawn(async move {
            let result = async {
                let peripheral = find_peripheral(&adapter, id, &address).await?;
                peripheral.connect().await?;
                anyhow::Ok(peripheral)
            }
            .await;

            let peripheral = match result {
                Ok(peripheral) => peripheral,
                Err(e) => {
                    let current = {
                        let mut link = lock(&shared);
                        let current = link.generation == generation;
                        if current {
                            link.state = LinkState::Idle;
                        }
                        current
                    };
                    if current {
                        let _ = events.send(TransportEvent::ConnectFailed(format!("{e:#}")));
                    }
                    return;
                }
            };
            info!("Connected to {}", address);

            let tasks = vec![
                tokio::spawn(forward_notifications(peripheral.clone(), events.clone())),
                tokio::spawn(watch_disconnect(
                    adapter.clone(),
                    peripheral.clone(),
                    shared.clone(),
                    generation,
                    events.clone(),
                )),
            ];
            let (ops, writer) = spawn_writer(peripheral.clone(), events.clone());

            let stale = {
                let mut link = lock(&shared);
                if link.generation == generation {
                    link.state = LinkState::Connected;
                    link.peripheral = Some(peripheral.clone());
                    link.ops = Some(ops);
                    link.writer = Some(writer);
                    link.tasks.extend(tasks);
                    None
                } else {
                    Some((tasks, writer))
                }
            };

            match stale {
                None => {
                    let _ = events.send(TransportEvent::Connected);
                }
                Some((tasks, writer)) => {
                    debug!("Link released while connecting; dropping {}", address);
                    for task in tasks {
                        task.abort();
                    }
                    writer.abort();
                    let _ = peripheral.disconnect().await;
                }
            }
        }));
    }

    fn discover_services(&mut self) {
        let Some(peripheral) = self.peripheral() else {
            warn!("Service discovery without a link");
            self.send(TransportEvent::ServiceDiscoveryFinished);
            return;
        };
        let events = self.events.clone();

        self.spawn_link_task(async move {
            match peripheral.discover_services().await {
                Ok(()) => {
                    for service in peripheral.services() {
                        let _ = events.send(TransportEvent::ServiceDiscovered(service.uuid));
                    }
                }
                Err(e) => warn!("Service discovery failed: {}", e),
            }
            let _ = events.send(TransportEvent::ServiceDiscoveryFinished);
        });
    }

    fn discover_service_details(&mut self, service: Uuid) {
        // btleplug resolves characteristics together with services
        self.send(TransportEvent::ServiceDetailsDiscovered(service));
    }

    fn characteristic(&self, service: Uuid, uuid: Uuid) -> Option<CharacteristicHandle> {
        let handle = CharacteristicHandle { service, uuid };
        self.resolve(&handle).map(|_| handle)
    }

    fn has_descriptor(&self, characteristic: &CharacteristicHandle, descriptor: Uuid) -> bool {
        let Some((_, characteristic)) = self.resolve(characteristic) else {
            return false;
        };
        if characteristic.descriptors.iter().any(|d| d.uuid == descriptor) {
            return true;
        }
        // Some back-ends do not enumerate descriptors; a notifying
        // characteristic always carries a CCCD.
        descriptor == CCCD_UUID
            && characteristic
                .properties
                .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
    }

    fn write_descriptor(
        &mut self,
        characteristic: &CharacteristicHandle,
        descriptor: Uuid,
        value: &[u8],
    ) {
        if descriptor != CCCD_UUID || value != NOTIFICATIONS_ENABLE {
            self.send(TransportEvent::DescriptorWriteFailed(format!(
                "unsupported descriptor write {descriptor} = {value:02X?}"
            )));
            return;
        }
        let Some((peripheral, characteristic)) = self.resolve(characteristic) else {
            self.send(TransportEvent::DescriptorWriteFailed(
                "characteristic not resolved".to_string(),
            ));
            return;
        };
        let events = self.events.clone();

        self.spawn_link_task(async move {
            let event = match peripheral.subscribe(&characteristic).await {
                Ok(()) => TransportEvent::DescriptorWritten {
                    characteristic: characteristic.uuid,
                    descriptor,
                },
                Err(e) => TransportEvent::DescriptorWriteFailed(e.to_string()),
            };
            let _ = events.send(event);
        });
    }

    fn write_without_response(&mut self, characteristic: &CharacteristicHandle, data: &[u8]) {
        let queued = match self.resolve(characteristic) {
            Some((_, characteristic)) => self.queue(Op::Write(characteristic, data.to_vec())),
            None => false,
        };
        if !queued {
            self.send(TransportEvent::WriteFailed(format!(
                "no link for write to {}",
                characteristic.uuid
            )));
        }
    }

    fn drain(&mut self, budget: Duration) {
        self.drain_budget = budget;
    }

    fn unsubscribe(&mut self, characteristic: &CharacteristicHandle) {
        if let Some((_, characteristic)) = self.resolve(characteristic) {
            self.queue(Op::Unsubscribe(characteristic));
        }
    }

    fn link_state(&self) -> LinkState {
        self.link().state
    }

    fn disconnect(&mut self) {
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        let budget = std::mem::take(&mut self.drain_budget);
        let events = self.events.clone();
        let shared = self.link.clone();

        let (peripheral, writer, generation) = {
            let mut link = self.link();
            link.state = LinkState::Disconnecting;
            link.abort_tasks();
            // closing the queue lets the writer finish what is already queued
            link.ops = None;
            (link.peripheral.clone(), link.writer.take(), link.generation)
        };

        tokio::spawn(async move {
            if let Some(writer) = writer {
                // queued writes must not race the disconnect
                if !join_within(writer, budget).await {
                    debug!("Write queue not drained within {:?}; aborted", budget);
                }
            }
            if let Some(peripheral) = peripheral {
                if let Err(e) = peripheral.disconnect().await {
                    warn!("Disconnect failed: {}", e);
                }
            }

            let current = {
                let mut link = lock(&shared);
                let current = link.generation == generation;
                if current {
                    link.state = LinkState::Idle;
                }
                current
            };
            if current {
                let _ = events.send(TransportEvent::Disconnected);
            }
        });
    }

    fn release(&mut self) {
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        let mut link = self.link();
        link.generation += 1;
        link.abort_tasks();
        link.ops = None;
        if let Some(writer) = link.writer.take() {
            writer.abort();
        }
        link.peripheral = None;
        link.state = LinkState::Idle;
        debug!("Link released (generation {})", link.generation);
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        if let Some(task) = self.scan_task.take() {
            task.abort();
        }
        self.release();
    }
}

/// Report named advertisements until the timeout expires
async fn scan(
    adapter: &Adapter,
    events: &mpsc::UnboundedSender<TransportEvent>,
    directory: &SharedDirectory,
    timeout: Duration,
) -> anyhow::Result<()> {
    let mut central_events = adapter.events().await?;
    adapter.start_scan(ScanFilter::default()).await?;

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut reported = HashSet::new();

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = central_events.next() => match event {
                Some(CentralEvent::DeviceDiscovered(id)) | Some(CentralEvent::DeviceUpdated(id)) => {
                    if reported.contains(&id) {
                        continue;
                    }
                    let Ok(peripheral) = adapter.peripheral(&id).await else {
                        continue;
                    };
                    let Ok(Some(properties)) = peripheral.properties().await else {
                        continue;
                    };
                    // names often arrive in a later scan response
                    let Some(name) = properties.local_name else {
                        continue;
                    };
                    let address =
                        lock(directory).record(&properties.address.to_string(), id.clone());
                    trace!("Advertisement: {} ({})", name, address);
                    reported.insert(id);
                    let _ = events.send(TransportEvent::DeviceDiscovered(Advertisement {
                        address,
                        name,
                        le_capable: true,
                    }));
                }
                Some(_) => {}
                None => break,
            },
        }
    }
    Ok(())
}

/// Resolve the peripheral to connect to, by scan id when one was recorded
async fn find_peripheral(
    adapter: &Adapter,
    id: Option<PeripheralId>,
    address: &str,
) -> anyhow::Result<Peripheral> {
    if let Some(id) = id {
        return Ok(adapter.peripheral(&id).await?);
    }
    // a zero address would match whichever peripheral comes first
    if address == UNKNOWN_ADDRESS {
        return Err(anyhow!("Device {} was not seen in a scan", address));
    }
    adapter
        .peripherals()
        .await?
        .into_iter()
        .find(|p| p.address().to_string() == address)
        .ok_or_else(|| anyhow!("Device {} is no longer known to the adapter", address))
}

async fn forward_notifications(
    peripheral: Peripheral,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut notifications = match peripheral.notifications().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Could not open notification stream: {}", e);
            return;
        }
    };
    while let Some(notification) = notifications.next().await {
        let _ = events.send(TransportEvent::Notification {
            characteristic: notification.uuid,
            value: notification.value,
        });
    }
    debug!("Notification stream ended");
}

/// Report a link drop the connector did not ask for
async fn watch_disconnect(
    adapter: Adapter,
    peripheral: Peripheral,
    shared: SharedLink,
    generation: u64,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut central_events = match adapter.events().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Disconnect watcher unavailable: {}", e);
            return;
        }
    };
    let id = peripheral.id();

    while let Some(event) = central_events.next().await {
        let CentralEvent::DeviceDisconnected(disconnected) = event else {
            continue;
        };
        if disconnected != id {
            continue;
        }
        let current = {
            let mut link = lock(&shared);
            let current =
                link.generation == generation && link.state == LinkState::Connected;
            if current {
                link.state = LinkState::Idle;
            }
            current
        };
        if current {
            info!("Peripheral {:?} disconnected", id);
            let _ = events.send(TransportEvent::Disconnected);
        }
        break;
    }
}

fn spawn_writer(
    peripheral: Peripheral,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> (mpsc::UnboundedSender<Op>, JoinHandle<()>) {
    let (ops, mut queue) = mpsc::unbounded_channel();
    let writer = tokio::spawn(async move {
        while let Some(op) = queue.recv().await {
            match op {
                Op::Write(characteristic, data) => {
                    if let Err(e) = peripheral
                        .write(&characteristic, &data, WriteType::WithoutResponse)
                        .await
                    {
                        let _ = events.send(TransportEvent::WriteFailed(e.to_string()));
                    }
                }
                Op::Unsubscribe(characteristic) => {
                    if let Err(e) = peripheral.unsubscribe(&characteristic).await {
                        debug!("Unsubscribe failed: {}", e);
                    }
                }
            }
        }
    });
    (ops, writer)
}
