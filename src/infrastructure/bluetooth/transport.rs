//! Platform BLE boundary
//!
//! The connector drives the platform stack through [`BleTransport`] requests,
//! which return immediately. Outcomes arrive later on the event loop as
//! [`TransportEvent`]s.

use crate::domain::models::{Advertisement, RingDevice};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Address some stacks (CoreBluetooth) report for every peripheral
pub const UNKNOWN_ADDRESS: &str = "00:00:00:00:00:00";

/// A resolved GATT characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
    pub service: Uuid,
    pub uuid: Uuid,
}

/// State of the underlying GATT link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnecting,
}

/// Outcomes reported by the platform stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    DeviceDiscovered(Advertisement),
    ScanFinished,
    ScanFailed(String),
    Connected,
    ConnectFailed(String),
    ServiceDiscovered(Uuid),
    ServiceDiscoveryFinished,
    ServiceDetailsDiscovered(Uuid),
    DescriptorWritten {
        characteristic: Uuid,
        descriptor: Uuid,
    },
    DescriptorWriteFailed(String),
    Notification {
        characteristic: Uuid,
        value: Vec<u8>,
    },
    WriteFailed(String),
    Disconnected,
}

pub trait BleTransport {
    /// Begin an LE scan; matches arrive as `DeviceDiscovered`, then `ScanFinished`
    fn start_scan(&mut self);

    fn stop_scan(&mut self);

    /// Open a GATT link; answered by `Connected` or `ConnectFailed`
    fn connect(&mut self, device: &RingDevice);

    /// Enumerate primary services; answered by `ServiceDiscovered`* then
    /// `ServiceDiscoveryFinished`
    fn discover_services(&mut self);

    /// Resolve characteristics of one service; answered by `ServiceDetailsDiscovered`
    fn discover_service_details(&mut self, service: Uuid);

    /// Look up a characteristic discovered earlier
    fn characteristic(&self, service: Uuid, uuid: Uuid) -> Option<CharacteristicHandle>;

    fn has_descriptor(&self, characteristic: &CharacteristicHandle, descriptor: Uuid) -> bool;

    /// Answered by `DescriptorWritten` or `DescriptorWriteFailed`
    fn write_descriptor(
        &mut self,
        characteristic: &CharacteristicHandle,
        descriptor: Uuid,
        value: &[u8],
    );

    /// Write without response; failures surface as `WriteFailed`
    fn write_without_response(&mut self, characteristic: &CharacteristicHandle, data: &[u8]);

    /// Give queued writes up to `budget` to reach the radio
    fn drain(&mut self, budget: Duration);

    /// Drop the notification subscription for `characteristic`
    fn unsubscribe(&mut self, characteristic: &CharacteristicHandle);

    fn link_state(&self) -> LinkState;

    /// Request link teardown; answered by `Disconnected`
    fn disconnect(&mut self);

    /// Free every resource tied to the current link
    fn release(&mut self);
}

/// Platform peripheral ids seen during scanning, keyed by reported address
///
/// Connecting goes through the id, never through the address, so a stack that
/// hides addresses still reaches the advertised device.
#[derive(Debug)]
pub struct PeripheralDirectory<Id> {
    ids: HashMap<String, Id>,
}

impl<Id> Default for PeripheralDirectory<Id> {
    fn default() -> Self {
        Self {
            ids: HashMap::new(),
        }
    }
}

#[cfg_attr(not(feature = "btleplug"), allow(dead_code))]
impl<Id: Clone + Debug + Eq + Hash> PeripheralDirectory<Id> {
    /// Remember `id` and return the address to advertise it under
    ///
    /// A missing (all-zero) address is replaced by the id so every device
    /// keeps a distinct key.
    pub fn record(&mut self, address: &str, id: Id) -> String {
        let key = if address == UNKNOWN_ADDRESS {
            format!("{id:?}")
        } else {
            address.to_string()
        };
        self.ids.insert(key.clone(), id);
        key
    }

    pub fn lookup(&self, address: &str) -> Option<Id> {
        self.ids.get(address).cloned()
    }
}

/// Wait up to `budget` for `task`, aborting it once the budget runs out
///
/// Returns whether the task finished on its own.
#[cfg_attr(not(feature = "btleplug"), allow(dead_code))]
pub(crate) async fn join_within(task: JoinHandle<()>, budget: Duration) -> bool {
    let abort = task.abort_handle();
    match tokio::time::timeout(budget, task).await {
        Ok(_) => true,
        Err(_) => {
            abort.abort();
            false
        }
    }
}

#[cfg(test)]
pub mod fake {
    //! Recording transport for state machine tests

    use super::*;
    use std::collections::HashSet;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        StartScan,
        StopScan,
        Connect(String),
        DiscoverServices,
        DiscoverServiceDetails(Uuid),
        WriteDescriptor(Uuid, Vec<u8>),
        Write(Uuid, Vec<u8>),
        Drain(Duration),
        Unsubscribe(Uuid),
        Disconnect,
        Release,
    }

    #[derive(Debug, Default)]
    pub struct FakeTransport {
        pub calls: Vec<Call>,
        pub characteristics: HashSet<(Uuid, Uuid)>,
        pub descriptors: HashSet<(Uuid, Uuid)>,
        pub link: LinkState,
    }

    impl FakeTransport {
        /// A ring exposing the full UART service
        pub fn with_uart() -> Self {
            use crate::infrastructure::bluetooth::protocol::*;

            let mut transport = Self::default();
            transport
                .characteristics
                .insert((UART_SERVICE_UUID, UART_RX_CHAR_UUID));
            transport
                .characteristics
                .insert((UART_SERVICE_UUID, UART_TX_CHAR_UUID));
            transport.descriptors.insert((UART_TX_CHAR_UUID, CCCD_UUID));
            transport
        }

        pub fn writes(&self) -> Vec<Vec<u8>> {
            self.calls
                .iter()
                .filter_map(|c| match c {
                    Call::Write(_, data) => Some(data.clone()),
                    _ => None,
                })
                .collect()
        }

        pub fn count(&self, call: &Call) -> usize {
            self.calls.iter().filter(|c| *c == call).count()
        }
    }

    impl BleTransport for FakeTransport {
        fn start_scan(&mut self) {
            self.calls.push(Call::StartScan);
        }

        fn stop_scan(&mut self) {
            self.calls.push(Call::StopScan);
        }

        fn connect(&mut self, device: &RingDevice) {
            self.link = LinkState::Connecting;
            self.calls.push(Call::Connect(device.address.clone()));
        }

        fn discover_services(&mut self) {
            self.calls.push(Call::DiscoverServices);
        }

        fn discover_service_details(&mut self, service: Uuid) {
            self.calls.push(Call::DiscoverServiceDetails(service));
        }

        fn characteristic(&self, service: Uuid, uuid: Uuid) -> Option<CharacteristicHandle> {
            self.characteristics
                .contains(&(service, uuid))
                .then_some(CharacteristicHandle { service, uuid })
        }

        fn has_descriptor(&self, characteristic: &CharacteristicHandle, descriptor: Uuid) -> bool {
            self.descriptors.contains(&(characteristic.uuid, descriptor))
        }

        fn write_descriptor(
            &mut self,
            _characteristic: &CharacteristicHandle,
            descriptor: Uuid,
            value: &[u8],
        ) {
            self.calls
                .push(Call::WriteDescriptor(descriptor, value.to_vec()));
        }

        fn write_without_response(&mut self, characteristic: &CharacteristicHandle, data: &[u8]) {
            self.calls
                .push(Call::Write(characteristic.uuid, data.to_vec()));
        }

        fn drain(&mut self, budget: Duration) {
            self.calls.push(Call::Drain(budget));
        }

        fn unsubscribe(&mut self, characteristic: &CharacteristicHandle) {
            self.calls.push(Call::Unsubscribe(characteristic.uuid));
        }

        fn link_state(&self) -> LinkState {
            self.link
        }

        fn disconnect(&mut self) {
            self.link = LinkState::Disconnecting;
            self.calls.push(Call::Disconnect);
        }

        fn release(&mut self) {
            self.link = LinkState::Idle;
            self.calls.push(Call::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[test]
    fn test_directory_keeps_hidden_addresses_apart() {
        let mut directory = PeripheralDirectory::default();
        let ring = directory.record(UNKNOWN_ADDRESS, 7u32);
        let watch = directory.record(UNKNOWN_ADDRESS, 9u32);

        assert_ne!(ring, watch);
        assert_ne!(ring, UNKNOWN_ADDRESS);
        assert_eq!(directory.lookup(&ring), Some(7));
        assert_eq!(directory.lookup(&watch), Some(9));
        assert_eq!(directory.lookup(UNKNOWN_ADDRESS), None);
    }

    #[test]
    fn test_directory_uses_real_addresses() {
        let mut directory = PeripheralDirectory::default();
        let key = directory.record("AA:BB:CC:DD:EE:FF", 1u32);
        assert_eq!(key, "AA:BB:CC:DD:EE:FF");

        directory.record("AA:BB:CC:DD:EE:FF", 2u32);
        assert_eq!(directory.lookup("AA:BB:CC:DD:EE:FF"), Some(2));
    }

    #[tokio::test]
    async fn test_join_within_aborts_stuck_task() {
        let (held, released) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _held = held;
            std::future::pending::<()>().await;
        });

        assert!(!join_within(task, Duration::from_millis(20)).await);
        // the sender is dropped only when the task is torn down
        let outcome = tokio::time::timeout(Duration::from_secs(1), released).await;
        assert!(matches!(outcome, Ok(Err(_))));
    }

    #[tokio::test]
    async fn test_join_within_waits_for_finished_task() {
        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_millis(5)).await;
        });
        assert!(join_within(task, Duration::from_secs(1)).await);
    }
}
