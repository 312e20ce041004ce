use async_trait::async_trait;
use bluer::{
    adv::{Advertisement, AdvertisementHandle, Type as AdvertisementType},
    gatt::{
        local::{
            characteristic_control, Application, ApplicationHandle, Characteristic,
            CharacteristicControl, CharacteristicControlEvent, CharacteristicNotify,
            CharacteristicNotifyMethod, CharacteristicRead, Service,
        },
        CharacteristicWriter,
    },
    Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, Session,
};
use futures::{future, pin_mut, FutureExt, StreamExt};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    future::Future,
    pin::Pin,
};
use tokio::{
    io::AsyncWriteExt,
    sync::mpsc,
    task::{AbortHandle, JoinHandle, JoinSet},
};
use tracing::{debug, info, warn};

use crate::{
    emulator::{FootpodTransport, PeripheralEvent},
    error::{BridgeError, Result},
    protocol::rsc_feature_value,
    RSC_FEATURE_UUID, RSC_MEASUREMENT_UUID, RSC_SERVICE_UUID,
};

/// Foot-pod GATT server on top of `BlueZ`
///
/// Registers the RSC service with a read-only feature characteristic and a
/// notify-only measurement characteristic, and turns `BlueZ` device and
/// notification-session changes into [`PeripheralEvent`]s.
pub struct BluezFootpod {
    _session: Session,
    adapter: Adapter,
    local_name: String,
    _application: ApplicationHandle,
    advertisement: Option<AdvertisementHandle>,
    control: Pin<Box<CharacteristicControl>>,
    links: mpsc::UnboundedReceiver<PeripheralEvent>,
    link_watcher: JoinHandle<()>,
    writer: Option<CharacteristicWriter>,
    connected: HashSet<String>,
    pending: VecDeque<PeripheralEvent>,
}

impl BluezFootpod {
    /// Register the foot-pod service on the default adapter
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::AdapterUnavailable`] if `BlueZ` or an adapter is missing,
    /// or [`BridgeError::Bluez`] if the GATT application cannot be registered.
    pub async fn new(local_name: &str) -> Result<Self> {
        let session = Session::new()
            .await
            .map_err(|_| BridgeError::AdapterUnavailable)?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|_| BridgeError::AdapterUnavailable)?;
        adapter.set_powered(true).await?;

        info!(
            "Foot-pod using adapter {} ({})",
            adapter.name(),
            adapter.address().await?
        );

        let (control, control_handle) = characteristic_control();
        let application = Application {
            services: vec![Service {
                uuid: RSC_SERVICE_UUID,
                primary: true,
                characteristics: vec![
                    Characteristic {
                        uuid: RSC_FEATURE_UUID,
                        read: Some(CharacteristicRead {
                            read: true,
                            fun: Box::new(|_req| {
                                async move {
                                    debug!("RSC feature read");
                                    Ok(rsc_feature_value().to_vec())
                                }
                                .boxed()
                            }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    Characteristic {
                        uuid: RSC_MEASUREMENT_UUID,
                        notify: Some(CharacteristicNotify {
                            notify: true,
                            method: CharacteristicNotifyMethod::Io,
                            ..Default::default()
                        }),
                        control_handle,
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }],
            ..Default::default()
        };

        let application = adapter.serve_gatt_application(application).await?;
        info!("RSC GATT service registered");

        let (link_tx, links) = mpsc::unbounded_channel();
        let link_watcher = tokio::spawn(watch_links(adapter.clone(), link_tx));

        Ok(Self {
            _session: session,
            adapter,
            local_name: local_name.to_string(),
            _application: application,
            advertisement: None,
            control: Box::pin(control),
            links,
            link_watcher,
            writer: None,
            connected: HashSet::new(),
            pending: VecDeque::new(),
        })
    }

    fn on_link(&mut self, event: PeripheralEvent) -> PeripheralEvent {
        match &event {
            PeripheralEvent::Connected(peer) => {
                self.connected.insert(peer.clone());
            }
            PeripheralEvent::Disconnected(peer) => {
                self.connected.remove(peer);
                if self.writer_peer().as_deref() == Some(peer.as_str()) {
                    self.writer = None;
                }
            }
            _ => {}
        }
        event
    }

    fn on_subscribe(&mut self, writer: CharacteristicWriter) {
        let peer = writer.device_address().to_string();
        info!(
            "Measurement notification session from {} (MTU {})",
            peer,
            writer.mtu()
        );

        // BlueZ may report the session before the device property change
        if self.connected.insert(peer.clone()) {
            self.pending
                .push_back(PeripheralEvent::Connected(peer.clone()));
        }
        self.pending.push_back(PeripheralEvent::Subscribed(peer));
        self.writer = Some(writer);
    }

    fn writer_peer(&self) -> Option<String> {
        self.writer
            .as_ref()
            .map(|writer| writer.device_address().to_string())
    }
}

impl Drop for BluezFootpod {
    fn drop(&mut self) {
        self.link_watcher.abort();
    }
}

#[async_trait]
impl FootpodTransport for BluezFootpod {
    async fn start_advertising(&mut self) -> Result<()> {
        let advertisement = Advertisement {
            advertisement_type: AdvertisementType::Peripheral,
            service_uuids: [RSC_SERVICE_UUID].into_iter().collect(),
            local_name: Some(self.local_name.clone()),
            discoverable: Some(true),
            ..Default::default()
        };

        let handle = self
            .adapter
            .advertise(advertisement)
            .await
            .map_err(|e| BridgeError::AdvertisingFailed(e.to_string()))?;
        self.advertisement = Some(handle);

        info!("Advertising as '{}' with RSC service", self.local_name);
        Ok(())
    }

    async fn stop_advertising(&mut self) -> Result<()> {
        if self.advertisement.take().is_some() {
            debug!("Advertisement released");
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Option<PeripheralEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }

            let writer = self.writer.as_ref();
            let links = &mut self.links;
            let control = &mut self.control;

            tokio::select! {
                link = links.recv() => {
                    let event = link?;
                    return Some(self.on_link(event));
                }
                control_event = control.next() => match control_event? {
                    CharacteristicControlEvent::Notify(writer) => self.on_subscribe(writer),
                    CharacteristicControlEvent::Write(request) => {
                        debug!("Ignoring write to measurement from {}", request.device_address());
                    }
                },
                closed = async {
                    match writer {
                        Some(writer) => writer.closed().await,
                        None => future::pending().await,
                    }
                } => {
                    if let Err(e) = closed {
                        debug!("Notification session ended: {}", e);
                    }
                    if let Some(peer) = self.writer_peer() {
                        self.pending.push_back(PeripheralEvent::Unsubscribed(peer));
                    }
                    self.writer = None;
                }
            }
        }
    }

    async fn notify(&mut self, payload: &[u8]) -> Result<()> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            BridgeError::NotificationWriteFailed("no notification session".to_string())
        })?;

        writer
            .write_all(payload)
            .await
            .map_err(|e| BridgeError::NotificationWriteFailed(e.to_string()))
    }

    async fn disconnect(&mut self, peer: &str) -> Result<()> {
        if self.writer_peer().as_deref() == Some(peer) {
            self.writer = None;
        }

        let address: Address = peer
            .parse()
            .map_err(|_| BridgeError::Bluez(format!("invalid device address {peer}")))?;
        self.adapter.device(address)?.disconnect().await?;
        Ok(())
    }
}

/// Forward connection changes of every known device
async fn watch_links(adapter: Adapter, sender: mpsc::UnboundedSender<PeripheralEvent>) {
    let events = match adapter.events().await {
        Ok(events) => events,
        Err(e) => {
            warn!("Cannot watch adapter events: {}", e);
            return;
        }
    };
    pin_mut!(events);

    // dropped with this task, which aborts every device watcher
    let mut watchers = DeviceWatchers::default();

    while let Some(event) = events.next().await {
        match event {
            AdapterEvent::DeviceAdded(address) => match adapter.device(address) {
                Ok(device) => watchers.watch(address, watch_device(device, sender.clone())),
                Err(e) => debug!("Skipping device {}: {}", address, e),
            },
            AdapterEvent::DeviceRemoved(address) => watchers.forget(address),
            _ => {}
        }
    }
}

/// Connection watchers, at most one per device address
#[derive(Default)]
struct DeviceWatchers {
    tasks: JoinSet<()>,
    handles: HashMap<Address, AbortHandle>,
}

impl DeviceWatchers {
    /// Start watching `address`, replacing any earlier watcher for it
    fn watch<F>(&mut self, address: Address, watcher: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.forget(address);
        while self.tasks.try_join_next().is_some() {}

        let handle = self.tasks.spawn(watcher);
        self.handles.insert(address, handle);
    }

    fn forget(&mut self, address: Address) {
        if let Some(handle) = self.handles.remove(&address) {
            handle.abort();
        }
    }
}

async fn watch_device(device: Device, sender: mpsc::UnboundedSender<PeripheralEvent>) {
    let peer = device.address().to_string();

    if device.is_connected().await.unwrap_or(false)
        && sender.send(PeripheralEvent::Connected(peer.clone())).is_err()
    {
        return;
    }

    let events = match device.events().await {
        Ok(events) => events,
        Err(e) => {
            debug!("Cannot watch device {}: {}", peer, e);
            return;
        }
    };
    pin_mut!(events);

    while let Some(DeviceEvent::PropertyChanged(property)) = events.next().await {
        if let DeviceProperty::Connected(connected) = property {
            let event = if connected {
                PeripheralEvent::Connected(peer.clone())
            } else {
                PeripheralEvent::Disconnected(peer.clone())
            };
            if sender.send(event).is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn settle() {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    fn parked(token: Arc<()>) -> impl Future<Output = ()> + Send + 'static {
        async move {
            let _token = token;
            future::pending::<()>().await;
        }
    }

    #[tokio::test]
    async fn test_readded_device_has_one_watcher() {
        let token = Arc::new(());
        let address = Address::new([0xC4, 0x8A, 0x11, 0x22, 0x33, 0x44]);
        let mut watchers = DeviceWatchers::default();

        watchers.watch(address, parked(token.clone()));
        watchers.watch(address, parked(token.clone()));
        settle().await;

        assert_eq!(Arc::strong_count(&token), 2);
        assert_eq!(watchers.handles.len(), 1);
    }

    #[tokio::test]
    async fn test_watchers_stop_with_owner() {
        let token = Arc::new(());
        let mut watchers = DeviceWatchers::default();

        watchers.watch(Address::new([1, 0, 0, 0, 0, 1]), parked(token.clone()));
        watchers.watch(Address::new([1, 0, 0, 0, 0, 2]), parked(token.clone()));
        settle().await;
        assert_eq!(Arc::strong_count(&token), 3);

        watchers.forget(Address::new([1, 0, 0, 0, 0, 1]));
        settle().await;
        assert_eq!(Arc::strong_count(&token), 2);

        drop(watchers);
        settle().await;
        assert_eq!(Arc::strong_count(&token), 1);
    }
}
