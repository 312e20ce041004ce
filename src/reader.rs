use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{future::Future, time::Duration};
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    error::{BridgeError, Result},
    protocol::decode_treadmill_data,
    shutdown::Shutdown,
    sink::EventSink,
    types::{ReaderConfig, ReaderState, StatusEvent},
    FTMS_SERVICE_UUID,
};

/// Name fragments that identify a treadmill which does not advertise FTMS
pub const TREADMILL_NAME_KEYWORDS: [&str; 5] =
    ["nordictrack", "nordic", "ifit", "treadmill", "ftms"];

/// A peripheral seen during a scan window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreadmillInfo {
    /// Advertised local name
    pub name: Option<String>,
    /// Device address
    pub address: String,
    /// Advertised service UUIDs
    pub services: Vec<Uuid>,
    /// Signal strength in dBm
    pub rssi: Option<i16>,
}

impl TreadmillInfo {
    /// Check if the FTMS service is advertised
    #[must_use]
    pub fn advertises_ftms(&self) -> bool {
        self.services.contains(&FTMS_SERVICE_UUID)
    }

    /// Name for display, falling back to the address
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }
}

/// Which discovered peripherals the reader will connect to
///
/// A peripheral qualifies when it advertises FTMS or its name contains one of
/// [`TREADMILL_NAME_KEYWORDS`]. Non-empty allow-lists narrow that further.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFilter {
    /// Accepted addresses, compared case-insensitively
    pub addresses: Vec<String>,
    /// Accepted name substrings, compared case-insensitively
    pub names: Vec<String>,
}

impl ScanFilter {
    /// Accept a single device address
    #[must_use]
    pub fn address(address: impl Into<String>) -> Self {
        Self {
            addresses: vec![address.into()],
            names: Vec::new(),
        }
    }

    /// Check a discovered peripheral against the filter
    #[must_use]
    pub fn matches(&self, info: &TreadmillInfo) -> bool {
        let name = info.name.as_deref().unwrap_or_default().to_lowercase();

        let is_treadmill = info.advertises_ftms()
            || TREADMILL_NAME_KEYWORDS
                .iter()
                .any(|keyword| name.contains(keyword));
        if !is_treadmill {
            return false;
        }

        if !self.addresses.is_empty()
            && !self
                .addresses
                .iter()
                .any(|address| address.eq_ignore_ascii_case(&info.address))
        {
            return false;
        }

        self.names.is_empty()
            || self
                .names
                .iter()
                .any(|fragment| name.contains(&fragment.to_lowercase()))
    }
}

/// GATT client side of the FTMS treadmill profile
#[async_trait]
pub trait TreadmillTransport: Send {
    /// Scan for one window, returning the first peripheral the filter accepts
    async fn scan(&mut self, filter: &ScanFilter, window: Duration)
        -> Result<Option<TreadmillInfo>>;

    /// Stop a scan whose window was cut short
    async fn stop_scan(&mut self) -> Result<()>;

    /// Connect to a discovered treadmill and locate the treadmill data characteristic
    async fn connect(&mut self, treadmill: &TreadmillInfo) -> Result<()>;

    /// Enable treadmill data notifications
    async fn subscribe(&mut self) -> Result<()>;

    /// Wait for the next notification payload, `None` once the link is lost
    async fn next_notification(&mut self) -> Option<Vec<u8>>;

    /// Drop the link
    async fn disconnect(&mut self) -> Result<()>;
}

/// FTMS treadmill reader
///
/// Walks `Scanning → Connecting → Subscribing → Streaming` and returns to
/// `Scanning` after link loss. Connection failures back off and rescan;
/// exhausting the subscription attempts ends the run with an error. Payloads
/// that fail to decode are reported and skipped without dropping the link.
pub struct TreadmillReader<T, S> {
    transport: T,
    sink: S,
    filter: ScanFilter,
    config: ReaderConfig,
    state: ReaderState,
    target: Option<TreadmillInfo>,
    connected: bool,
    records_decoded: u64,
}

impl<T: TreadmillTransport, S: EventSink> TreadmillReader<T, S> {
    /// Create a reader over the given transport
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidConfig`] if the configuration is out of range.
    pub fn new(transport: T, sink: S, filter: ScanFilter, config: ReaderConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            transport,
            sink,
            filter,
            config,
            state: ReaderState::Scanning,
            target: None,
            connected: false,
            records_decoded: 0,
        })
    }

    /// Current reader state
    #[must_use]
    pub const fn state(&self) -> ReaderState {
        self.state
    }

    /// Treadmill currently targeted
    #[must_use]
    pub const fn treadmill(&self) -> Option<&TreadmillInfo> {
        self.target.as_ref()
    }

    /// Records delivered to the sink since creation
    #[must_use]
    pub const fn records_decoded(&self) -> u64 {
        self.records_decoded
    }

    /// Run until shutdown is requested
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::SubscriptionFailed`] once every subscription attempt
    /// failed, or a fatal transport error such as [`BridgeError::AdapterUnavailable`].
    pub async fn run(&mut self, mut shutdown: Shutdown) -> Result<()> {
        let mut failures = 0u32;

        while !shutdown.is_triggered() {
            match self.state {
                ReaderState::Scanning => {
                    let window = Duration::from_millis(self.config.scan_window_ms);
                    let Some(scan) =
                        until_shutdown(&mut shutdown, self.transport.scan(&self.filter, window))
                            .await
                    else {
                        break;
                    };

                    match scan {
                        Ok(Some(treadmill)) => {
                            info!(
                                "Found treadmill {} ({})",
                                treadmill.display_name(),
                                treadmill.address
                            );
                            self.sink.on_status(StatusEvent::TreadmillFound {
                                name: treadmill.display_name().to_string(),
                                address: treadmill.address.clone(),
                            });
                            self.target = Some(treadmill);
                            self.state = ReaderState::Connecting;
                        }
                        Ok(None) => debug!("No treadmill in this scan window"),
                        Err(e) if e.is_fatal() => {
                            error!("Scan failed: {}", e);
                            return Err(e);
                        }
                        Err(e) => {
                            warn!("Scan failed: {}", e);
                            if !self.back_off(&mut shutdown, &mut failures).await {
                                break;
                            }
                        }
                    }
                }
                ReaderState::Connecting => {
                    let Some(result) = until_shutdown(&mut shutdown, self.connect()).await else {
                        break;
                    };

                    match result {
                        Ok(()) => {
                            failures = 0;
                            self.state = ReaderState::Subscribing;
                        }
                        Err(e) if e.is_fatal() => {
                            error!("Connection failed: {}", e);
                            return Err(e);
                        }
                        Err(e) => {
                            warn!("Connection failed: {}", e);
                            self.sink.on_status(StatusEvent::ConnectionFailed {
                                reason: e.to_string(),
                            });
                            self.drop_link().await;
                            self.state = ReaderState::Scanning;
                            if !self.back_off(&mut shutdown, &mut failures).await {
                                break;
                            }
                        }
                    }
                }
                ReaderState::Subscribing => match self.subscribe_with_retry(&mut shutdown).await {
                    Some(Ok(())) => {
                        info!("Streaming treadmill data");
                        self.state = ReaderState::Streaming;
                        self.sink.on_status(StatusEvent::Streaming);
                    }
                    Some(Err(e)) => {
                        self.drop_link().await;
                        self.state = ReaderState::Disconnected;
                        return Err(e);
                    }
                    None => break,
                },
                ReaderState::Streaming => {
                    let Some(notification) =
                        until_shutdown(&mut shutdown, self.transport.next_notification()).await
                    else {
                        break;
                    };

                    match notification {
                        Some(payload) => self.handle_payload(&payload),
                        None => {
                            let peer = self
                                .target
                                .as_ref()
                                .map(|t| t.address.clone())
                                .unwrap_or_default();
                            warn!("Lost link to treadmill {}", peer);
                            self.connected = false;
                            self.state = ReaderState::Disconnected;
                            self.sink.on_status(StatusEvent::Disconnected { peer });
                        }
                    }
                }
                ReaderState::Disconnected => {
                    self.target = None;
                    self.state = ReaderState::Scanning;
                }
            }
        }

        self.release().await;
        Ok(())
    }

    async fn connect(&mut self) -> Result<()> {
        let treadmill = self
            .target
            .clone()
            .ok_or_else(|| BridgeError::ConnectionRefused("no treadmill selected".to_string()))?;
        let timeout_ms = self.config.connect_timeout_ms;

        info!("Connecting to {}", treadmill.address);

        // the link may come up before the attempt is cancelled or refused
        self.connected = true;
        match time::timeout(
            Duration::from_millis(timeout_ms),
            self.transport.connect(&treadmill),
        )
        .await
        {
            Ok(Ok(())) => {
                info!("Connected to {}", treadmill.display_name());
                self.sink.on_status(StatusEvent::Connected {
                    peer: treadmill.address,
                });
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BridgeError::ConnectionTimeout { timeout_ms }),
        }
    }

    /// Enable notifications, `None` when shutdown interrupted the attempts
    async fn subscribe_with_retry(&mut self, shutdown: &mut Shutdown) -> Option<Result<()>> {
        let attempts = self.config.max_subscribe_attempts;
        let timeout = Duration::from_millis(self.config.subscribe_timeout_ms);

        for attempt in 1..=attempts {
            debug!("Subscription attempt {}/{}", attempt, attempts);

            let result =
                until_shutdown(shutdown, time::timeout(timeout, self.transport.subscribe()))
                    .await?;

            match result {
                Ok(Ok(())) => {
                    info!("Subscribed to treadmill data");
                    self.sink.on_status(StatusEvent::Subscribed);
                    return Some(Ok(()));
                }
                Ok(Err(e)) if e.is_fatal() => return Some(Err(e)),
                Ok(Err(e)) => warn!("Subscription attempt {} failed: {}", attempt, e),
                Err(_) => warn!(
                    "Subscription attempt {} timed out after {}ms",
                    attempt,
                    timeout.as_millis()
                ),
            }

            if attempt < attempts {
                let delay = self.config.backoff.delay(attempt - 1);
                until_shutdown(shutdown, time::sleep(delay)).await?;
            }
        }

        error!("Giving up on subscription after {} attempts", attempts);
        self.sink.on_status(StatusEvent::SubscriptionFailed { attempts });
        Some(Err(BridgeError::SubscriptionFailed { attempts }))
    }

    fn handle_payload(&mut self, payload: &[u8]) {
        debug!("Treadmill data: {:02X?}", payload);

        match decode_treadmill_data(payload) {
            Ok(record) => {
                self.records_decoded += 1;
                self.sink.on_record(&record);
            }
            Err(e) => {
                warn!("Dropping treadmill notification: {}", e);
                self.sink.on_status(StatusEvent::DecodeFailed {
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Wait out the next backoff delay, `false` when shutdown interrupted it
    async fn back_off(&self, shutdown: &mut Shutdown, failures: &mut u32) -> bool {
        let delay = self.config.backoff.delay(*failures);
        *failures = failures.saturating_add(1);
        debug!("Backing off for {}ms", delay.as_millis());

        until_shutdown(shutdown, time::sleep(delay)).await.is_some()
    }

    async fn drop_link(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        if let Err(e) = self.transport.disconnect().await {
            debug!("Disconnect failed: {}", e);
        }
    }

    async fn release(&mut self) {
        if self.state == ReaderState::Scanning {
            if let Err(e) = self.transport.stop_scan().await {
                debug!("Failed to stop scan: {}", e);
            }
        }
        self.drop_link().await;
        info!("Treadmill reader stopped");
        self.target = None;
        self.state = ReaderState::Disconnected;
    }
}

/// Drive `future` unless shutdown is requested first
async fn until_shutdown<F: Future>(shutdown: &mut Shutdown, future: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        () = shutdown.wait() => None,
        output = future => Some(output),
    }
}
