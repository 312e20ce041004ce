use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, Characteristic, Manager as _, Peripheral as _,
        PeripheralProperties, ScanFilter as BtleScanFilter, ValueNotification,
    },
    platform::{Adapter, Manager, Peripheral},
};
use futures::stream::{Stream, StreamExt};
use std::{collections::HashMap, pin::Pin, time::Duration};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::{
    error::{BridgeError, Result},
    reader::{ScanFilter, TreadmillInfo, TreadmillTransport},
    FTMS_SERVICE_UUID, TREADMILL_DATA_UUID,
};

type EventStream = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;
type NotificationStream = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

/// FTMS treadmill client on top of `btleplug`
pub struct BtleplugTransport {
    adapter: Adapter,
    candidates: HashMap<String, Peripheral>,
    peripheral: Option<Peripheral>,
    characteristic: Option<Characteristic>,
    notifications: Option<NotificationStream>,
    events: Option<EventStream>,
}

impl BtleplugTransport {
    /// Open the first Bluetooth adapter
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::AdapterUnavailable`] if no adapter is present,
    /// or [`BridgeError::Ble`] if the Bluetooth stack cannot be reached.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(BridgeError::AdapterUnavailable)?;

        info!("Treadmill reader using adapter {}", adapter.adapter_info().await?);

        Ok(Self {
            adapter,
            candidates: HashMap::new(),
            peripheral: None,
            characteristic: None,
            notifications: None,
            events: None,
        })
    }

    async fn watch_scan(
        &mut self,
        filter: &ScanFilter,
        deadline: Instant,
    ) -> Result<Option<TreadmillInfo>> {
        let mut events = self.adapter.events().await?;

        for peripheral in self.adapter.peripherals().await? {
            if let Some(treadmill) = self.candidate(filter, peripheral).await {
                return Ok(Some(treadmill));
            }
        }

        while let Ok(Some(event)) = time::timeout_at(deadline, events.next()).await {
            let id = match event {
                CentralEvent::DeviceDiscovered(id)
                | CentralEvent::DeviceUpdated(id)
                | CentralEvent::ServicesAdvertisement { id, .. } => id,
                _ => continue,
            };

            let Ok(peripheral) = self.adapter.peripheral(&id).await else {
                continue;
            };
            if let Some(treadmill) = self.candidate(filter, peripheral).await {
                return Ok(Some(treadmill));
            }
        }

        Ok(None)
    }

    async fn candidate(
        &mut self,
        filter: &ScanFilter,
        peripheral: Peripheral,
    ) -> Option<TreadmillInfo> {
        let properties = peripheral.properties().await.ok()??;
        let treadmill = treadmill_info(properties);

        if !filter.matches(&treadmill) {
            return None;
        }

        self.candidates.insert(treadmill.address.clone(), peripheral);
        Some(treadmill)
    }

    fn clear_link(&mut self) {
        self.peripheral = None;
        self.characteristic = None;
        self.notifications = None;
        self.events = None;
    }
}

fn treadmill_info(properties: PeripheralProperties) -> TreadmillInfo {
    TreadmillInfo {
        name: properties.local_name,
        address: properties.address.to_string(),
        services: properties.services,
        rssi: properties.rssi,
    }
}

#[async_trait]
impl TreadmillTransport for BtleplugTransport {
    async fn scan(
        &mut self,
        filter: &ScanFilter,
        window: Duration,
    ) -> Result<Option<TreadmillInfo>> {
        info!("Scanning for FTMS treadmills ({}ms)", window.as_millis());

        self.candidates.clear();
        self.adapter.start_scan(BtleScanFilter::default()).await?;

        let found = self.watch_scan(filter, Instant::now() + window).await;

        if let Err(e) = self.stop_scan().await {
            debug!("Failed to stop scan: {}", e);
        }
        found
    }

    async fn stop_scan(&mut self) -> Result<()> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&mut self, treadmill: &TreadmillInfo) -> Result<()> {
        let peripheral = self
            .candidates
            .get(&treadmill.address)
            .cloned()
            .ok_or_else(|| {
                BridgeError::ConnectionRefused(format!(
                    "{} was not seen in the last scan",
                    treadmill.address
                ))
            })?;

        self.events = Some(self.adapter.events().await?);
        // recorded first so a cancelled attempt can still be torn down
        self.peripheral = Some(peripheral.clone());
        peripheral
            .connect()
            .await
            .map_err(|e| BridgeError::ConnectionRefused(e.to_string()))?;

        peripheral.discover_services().await?;

        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == FTMS_SERVICE_UUID && c.uuid == TREADMILL_DATA_UUID)
            .ok_or_else(|| {
                BridgeError::ConnectionRefused(
                    "treadmill data characteristic not found".to_string(),
                )
            })?;

        debug!("Treadmill data characteristic: {:?}", characteristic);
        self.characteristic = Some(characteristic);
        Ok(())
    }

    async fn subscribe(&mut self) -> Result<()> {
        let (Some(peripheral), Some(characteristic)) =
            (self.peripheral.as_ref(), self.characteristic.as_ref())
        else {
            return Err(BridgeError::ConnectionRefused(
                "not connected to a treadmill".to_string(),
            ));
        };

        let notifications = peripheral.notifications().await?;
        peripheral.subscribe(characteristic).await?;
        self.notifications = Some(notifications);
        Ok(())
    }

    async fn next_notification(&mut self) -> Option<Vec<u8>> {
        let id = self.peripheral.as_ref()?.id();
        let notifications = self.notifications.as_mut()?;
        let events = self.events.as_mut()?;

        loop {
            tokio::select! {
                notification = notifications.next() => match notification {
                    Some(data) if data.uuid == TREADMILL_DATA_UUID => return Some(data.value),
                    Some(data) => debug!("Ignoring notification from {}", data.uuid),
                    None => break,
                },
                event = events.next() => match event {
                    Some(CentralEvent::DeviceDisconnected(lost)) if lost == id => break,
                    Some(_) => {}
                    None => break,
                },
            }
        }

        warn!("Treadmill link lost");
        self.clear_link();
        None
    }

    async fn disconnect(&mut self) -> Result<()> {
        let peripheral = self.peripheral.take();
        self.clear_link();

        if let Some(peripheral) = peripheral {
            // a cancelled connect may still be pending below btleplug
            let connected = peripheral.is_connected().await.unwrap_or(false);
            match peripheral.disconnect().await {
                Ok(()) => info!("Disconnected from treadmill"),
                Err(e) if !connected => debug!("No link to tear down: {}", e),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btleplug::api::BDAddr;

    #[test]
    fn test_ftms_uuids() {
        assert_eq!(
            FTMS_SERVICE_UUID.to_string(),
            "00001826-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            TREADMILL_DATA_UUID.to_string(),
            "00002acd-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_treadmill_info_from_properties() {
        let properties = PeripheralProperties {
            address: BDAddr::from([0xC4, 0x8A, 0x11, 0x22, 0x33, 0x44]),
            local_name: Some("NordicTrack T 6.5".to_string()),
            rssi: Some(-61),
            services: vec![FTMS_SERVICE_UUID],
            ..Default::default()
        };

        let treadmill = treadmill_info(properties);
        assert_eq!(treadmill.address, "C4:8A:11:22:33:44");
        assert_eq!(treadmill.rssi, Some(-61));
        assert!(treadmill.advertises_ftms());
        assert!(ScanFilter::default().matches(&treadmill));
    }
}
