use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::{
    error::{BridgeError, Result},
    protocol::{encode_rsc_measurement, RscFlags},
    shutdown::Shutdown,
    sink::EventSink,
    telemetry::TelemetryGenerator,
    types::{BackoffConfig, ConnectionState, EmulatorConfig, StatusEvent},
};

/// Link events delivered by a peripheral transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralEvent {
    /// A central completed the connection procedure
    Connected(String),
    /// The central enabled measurement notifications
    Subscribed(String),
    /// The central disabled measurement notifications
    Unsubscribed(String),
    /// The link to the central went down
    Disconnected(String),
}

/// GATT server side of the foot-pod profile
///
/// Implementations own advertising and the measurement characteristic; the
/// [`SensorEmulator`] decides when to use them.
#[async_trait]
pub trait FootpodTransport: Send {
    /// Start advertising the RSC service
    async fn start_advertising(&mut self) -> Result<()>;

    /// Stop advertising
    async fn stop_advertising(&mut self) -> Result<()>;

    /// Wait for the next link event, `None` once the transport has closed
    async fn next_event(&mut self) -> Option<PeripheralEvent>;

    /// Push one measurement notification to the subscribed central
    async fn notify(&mut self, payload: &[u8]) -> Result<()>;

    /// Drop the link to a central
    async fn disconnect(&mut self, peer: &str) -> Result<()>;
}

/// Foot-pod sensor emulator
///
/// Drives the peripheral through `Idle → Advertising → ConnectedUnsubscribed →
/// ConnectedNotifying` and back to `Idle` on disconnect, re-advertising
/// automatically. Only one central is served at a time and measurements are
/// pushed only while that central is subscribed.
pub struct SensorEmulator<T, S> {
    transport: T,
    sink: S,
    generator: TelemetryGenerator,
    flags: RscFlags,
    notify_timeout: Duration,
    backoff: BackoffConfig,
    state: ConnectionState,
    peer: Option<String>,
    fresh_session: bool,
    sessions: u64,
    notifications_sent: u64,
}

impl<T: FootpodTransport, S: EventSink> SensorEmulator<T, S> {
    /// Create an emulator over the given transport
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidConfig`] if the configuration is out of range.
    pub fn new(transport: T, sink: S, config: &EmulatorConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            transport,
            sink,
            generator: TelemetryGenerator::new(config.footpod, config.tick_interval()),
            flags: RscFlags::default(),
            notify_timeout: Duration::from_millis(config.notify_timeout_ms),
            backoff: config.backoff,
            state: ConnectionState::Idle,
            peer: None,
            fresh_session: true,
            sessions: 0,
            notifications_sent: 0,
        })
    }

    /// Use a different measurement flags byte
    #[must_use]
    pub const fn with_flags(mut self, flags: RscFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Current connection state
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Address of the connected central
    #[must_use]
    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    /// Notifications pushed since creation
    #[must_use]
    pub const fn notifications_sent(&self) -> u64 {
        self.notifications_sent
    }

    /// Telemetry source for the current session
    #[must_use]
    pub const fn generator(&self) -> &TelemetryGenerator {
        &self.generator
    }

    /// Run until shutdown is requested
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::AdvertisingFailed`] if the very first advertising attempt
    /// fails, and [`BridgeError::AdapterUnavailable`] if the transport closes.
    pub async fn run(&mut self, mut shutdown: Shutdown) -> Result<()> {
        let mut ticker = self.new_ticker();
        let mut advertise_failures = 0u32;

        while !shutdown.is_triggered() {
            match self.state {
                ConnectionState::Idle => match self.advertise().await {
                    Ok(()) => advertise_failures = 0,
                    Err(e) if self.sessions == 0 => {
                        error!("Advertising failed at startup: {}", e);
                        return Err(e);
                    }
                    Err(e) => {
                        let delay = self.backoff.delay(advertise_failures);
                        advertise_failures = advertise_failures.saturating_add(1);
                        warn!("Advertising failed, retrying in {}ms: {}", delay.as_millis(), e);

                        tokio::select! {
                            biased;
                            () = shutdown.wait() => break,
                            () = time::sleep(delay) => {}
                        }
                    }
                },
                ConnectionState::Advertising | ConnectionState::ConnectedUnsubscribed => {
                    let event = tokio::select! {
                        biased;
                        () = shutdown.wait() => break,
                        event = self.transport.next_event() => event,
                    };

                    if self.handle_event(event).await? {
                        ticker = self.new_ticker();
                    }
                }
                ConnectionState::ConnectedNotifying => {
                    tokio::select! {
                        biased;
                        () = shutdown.wait() => break,
                        event = self.transport.next_event() => {
                            self.handle_event(event).await?;
                        }
                        _ = ticker.tick() => self.push_measurement().await,
                    }
                }
            }
        }

        self.release().await;
        Ok(())
    }

    fn new_ticker(&self) -> Interval {
        let mut ticker = time::interval(self.generator.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    }

    async fn advertise(&mut self) -> Result<()> {
        self.transport.start_advertising().await.map_err(|e| match e {
            BridgeError::AdvertisingFailed(_) | BridgeError::AdapterUnavailable => e,
            other => BridgeError::AdvertisingFailed(other.to_string()),
        })?;

        info!("Advertising foot-pod service");
        self.state = ConnectionState::Advertising;
        self.sink.on_status(StatusEvent::Advertising);
        Ok(())
    }

    fn is_current(&self, peer: &str) -> bool {
        self.peer.as_deref() == Some(peer)
    }

    /// Apply one transport event, returning `true` when notifications were just enabled
    async fn handle_event(&mut self, event: Option<PeripheralEvent>) -> Result<bool> {
        let Some(event) = event else {
            error!("Peripheral transport closed");
            self.state = ConnectionState::Idle;
            return Err(BridgeError::AdapterUnavailable);
        };

        match event {
            PeripheralEvent::Connected(peer) if self.state.is_connected() => {
                if !self.is_current(&peer) {
                    warn!("Rejecting second central {}", peer);
                    if let Err(e) = self.transport.disconnect(&peer).await {
                        warn!("Failed to drop {}: {}", peer, e);
                    }
                    self.sink.on_status(StatusEvent::Rejected { peer });
                }
            }
            PeripheralEvent::Connected(peer) => {
                if let Err(e) = self.transport.stop_advertising().await {
                    warn!("Failed to stop advertising: {}", e);
                }

                info!("Central {} connected", peer);
                self.generator.reset();
                self.fresh_session = true;
                self.sessions += 1;
                self.state = ConnectionState::ConnectedUnsubscribed;
                self.peer = Some(peer.clone());
                self.sink.on_status(StatusEvent::Connected { peer });
            }
            PeripheralEvent::Subscribed(peer)
                if self.state == ConnectionState::ConnectedUnsubscribed
                    && self.is_current(&peer) =>
            {
                info!("Central {} enabled notifications", peer);
                self.state = ConnectionState::ConnectedNotifying;
                self.sink.on_status(StatusEvent::Subscribed);
                return Ok(true);
            }
            PeripheralEvent::Unsubscribed(peer)
                if self.state == ConnectionState::ConnectedNotifying && self.is_current(&peer) =>
            {
                info!("Central {} disabled notifications", peer);
                self.state = ConnectionState::ConnectedUnsubscribed;
                self.sink.on_status(StatusEvent::Unsubscribed);
            }
            PeripheralEvent::Disconnected(peer)
                if self.state.is_connected() && self.is_current(&peer) =>
            {
                info!("Central {} disconnected", peer);
                self.end_session();
            }
            other => debug!("Ignoring {:?} while {}", other, self.state),
        }

        Ok(false)
    }

    async fn push_measurement(&mut self) {
        // the first measurement of a session reports the freshly reset counters
        let sample = if self.fresh_session {
            self.fresh_session = false;
            self.generator.sample()
        } else {
            self.generator.tick()
        };

        let payload = encode_rsc_measurement(&sample, self.flags);
        debug!("Notifying measurement: {:02X?}", &payload[..]);

        let failure = match time::timeout(self.notify_timeout, self.transport.notify(&payload)).await
        {
            Ok(Ok(())) => {
                self.notifications_sent += 1;
                return;
            }
            Ok(Err(e)) => BridgeError::NotificationWriteFailed(e.to_string()),
            Err(_) => BridgeError::NotificationWriteFailed(format!(
                "no completion within {}ms",
                self.notify_timeout.as_millis()
            )),
        };

        warn!("{}", failure);
        self.sink.on_status(StatusEvent::NotificationFailed {
            reason: failure.to_string(),
        });

        if let Some(peer) = self.peer.clone() {
            if let Err(e) = self.transport.disconnect(&peer).await {
                debug!("Disconnect after failed write: {}", e);
            }
        }
        self.end_session();
    }

    fn end_session(&mut self) {
        let peer = self.peer.take().unwrap_or_default();
        self.state = ConnectionState::Idle;
        self.sink.on_status(StatusEvent::Disconnected { peer });
    }

    async fn release(&mut self) {
        match self.state {
            ConnectionState::Advertising => {
                if let Err(e) = self.transport.stop_advertising().await {
                    warn!("Failed to stop advertising: {}", e);
                }
            }
            ConnectionState::ConnectedUnsubscribed | ConnectionState::ConnectedNotifying => {
                if let Some(peer) = self.peer.take() {
                    if let Err(e) = self.transport.disconnect(&peer).await {
                        warn!("Failed to disconnect {}: {}", peer, e);
                    }
                }
            }
            ConnectionState::Idle => {}
        }

        info!("Sensor emulator stopped");
        self.peer = None;
        self.state = ConnectionState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        protocol::decode_rsc_measurement,
        shutdown,
        sink::{ChannelSink, SinkEvent},
        types::FootpodConfig,
    };
    use std::sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    };
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Shared {
        sent: Mutex<Vec<Vec<u8>>>,
        dropped: Mutex<Vec<String>>,
        advertise_calls: AtomicUsize,
        advertising: AtomicBool,
        fail_advertising: AtomicBool,
        fail_notify: AtomicBool,
        stall_notify: AtomicBool,
        slow_second_write_ms: AtomicU64,
        write_starts: Mutex<Vec<time::Instant>>,
    }

    impl Shared {
        fn sent(&self) -> Vec<Vec<u8>> {
            self.sent.lock().unwrap().clone()
        }
    }

    struct MockTransport {
        events: mpsc::UnboundedReceiver<PeripheralEvent>,
        shared: Arc<Shared>,
    }

    #[async_trait]
    impl FootpodTransport for MockTransport {
        async fn start_advertising(&mut self) -> Result<()> {
            self.shared.advertise_calls.fetch_add(1, Ordering::SeqCst);
            if self.shared.fail_advertising.load(Ordering::SeqCst) {
                return Err(BridgeError::Bluez("advertisement rejected".to_string()));
            }
            self.shared.advertising.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop_advertising(&mut self) -> Result<()> {
            self.shared.advertising.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn next_event(&mut self) -> Option<PeripheralEvent> {
            self.events.recv().await
        }

        async fn notify(&mut self, payload: &[u8]) -> Result<()> {
            let index = {
                let mut starts = self.shared.write_starts.lock().unwrap();
                starts.push(time::Instant::now());
                starts.len() - 1
            };
            let slow_ms = self.shared.slow_second_write_ms.load(Ordering::SeqCst);
            if index == 1 && slow_ms > 0 {
                time::sleep(Duration::from_millis(slow_ms)).await;
            }
            if self.shared.stall_notify.load(Ordering::SeqCst) {
                futures::future::pending::<()>().await;
            }
            if self.shared.fail_notify.load(Ordering::SeqCst) {
                return Err(BridgeError::Io(std::io::Error::other("broken pipe")));
            }
            self.shared.sent.lock().unwrap().push(payload.to_vec());
            Ok(())
        }

        async fn disconnect(&mut self, peer: &str) -> Result<()> {
            self.shared.dropped.lock().unwrap().push(peer.to_string());
            Ok(())
        }
    }

    struct Harness {
        emulator: SensorEmulator<MockTransport, ChannelSink>,
        events: mpsc::UnboundedSender<PeripheralEvent>,
        shared: Arc<Shared>,
        statuses: mpsc::UnboundedReceiver<SinkEvent>,
        trigger: shutdown::ShutdownTrigger,
        shutdown: Shutdown,
    }

    impl Harness {
        fn new(pace_kmh: f64) -> Self {
            Self::with_config(EmulatorConfig {
                footpod: FootpodConfig::new(pace_kmh, 85),
                ..Default::default()
            })
        }

        fn with_config(config: EmulatorConfig) -> Self {
            let (events, receiver) = mpsc::unbounded_channel();
            let shared = Arc::new(Shared::default());
            let transport = MockTransport {
                events: receiver,
                shared: shared.clone(),
            };
            let (sink, statuses) = ChannelSink::new();
            let (trigger, shutdown) = shutdown::channel();

            Self {
                emulator: SensorEmulator::new(transport, sink, &config).unwrap(),
                events,
                shared,
                statuses,
                trigger,
                shutdown,
            }
        }

        fn send(&self, event: PeripheralEvent) {
            self.events.send(event).unwrap();
        }

        /// Run the emulator for a stretch of virtual time
        async fn run_for(&mut self, millis: u64) {
            let result = time::timeout(
                Duration::from_millis(millis),
                self.emulator.run(self.shutdown.clone()),
            )
            .await;
            assert!(result.is_err(), "emulator stopped early: {result:?}");
        }

        fn statuses(&mut self) -> Vec<StatusEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.statuses.try_recv() {
                if let SinkEvent::Status(status) = event {
                    out.push(status);
                }
            }
            out
        }
    }

    fn distances(sent: &[Vec<u8>]) -> Vec<f64> {
        sent.iter()
            .map(|payload| {
                decode_rsc_measurement(payload)
                    .unwrap()
                    .total_distance_m
                    .unwrap()
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_advertising_without_subscription_sends_nothing() {
        let mut harness = Harness::new(10.0);

        harness.run_for(60_000).await;

        assert_eq!(harness.emulator.state(), ConnectionState::Advertising);
        assert!(harness.shared.sent().is_empty());
        assert_eq!(harness.emulator.notifications_sent(), 0);
        assert_eq!(harness.statuses(), vec![StatusEvent::Advertising]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_notifications_before_subscription() {
        let mut harness = Harness::new(10.0);
        harness.send(PeripheralEvent::Connected("AA".to_string()));

        harness.run_for(5_000).await;

        assert_eq!(
            harness.emulator.state(),
            ConnectionState::ConnectedUnsubscribed
        );
        assert!(harness.shared.sent().is_empty());
        assert!(!harness.shared.advertising.load(Ordering::SeqCst));

        harness.send(PeripheralEvent::Subscribed("AA".to_string()));
        harness.run_for(3_500).await;

        assert_eq!(harness.emulator.state(), ConnectionState::ConnectedNotifying);
        // ticks at 0, 1, 2 and 3 seconds after subscribing
        assert_eq!(harness.shared.sent().len(), 4);
        assert_eq!(
            harness.statuses(),
            vec![
                StatusEvent::Advertising,
                StatusEvent::Connected {
                    peer: "AA".to_string()
                },
                StatusEvent::Subscribed,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_distance_monotonic_and_speed_encoded() {
        let mut harness = Harness::new(12.0);
        harness.send(PeripheralEvent::Connected("AA".to_string()));
        harness.send(PeripheralEvent::Subscribed("AA".to_string()));

        harness.run_for(3_500).await;

        let sent = harness.shared.sent();
        let distances = distances(&sent);
        assert!((distances[0]).abs() < f64::EPSILON);
        assert!(distances.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!((distances[3] - 10.0).abs() <= 0.1);

        let first = decode_rsc_measurement(&sent[0]).unwrap();
        assert!((first.speed_mps - 12.0 / 3.6).abs() < 1.0 / 256.0);
        assert_eq!(first.cadence_spm, 85);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_connection_resets_distance() {
        let mut harness = Harness::new(10.0);
        harness.send(PeripheralEvent::Connected("AA".to_string()));
        harness.send(PeripheralEvent::Subscribed("AA".to_string()));
        harness.run_for(5_500).await;
        assert!(harness.emulator.generator().sample().cumulative_distance_m > 10.0);

        harness.send(PeripheralEvent::Disconnected("AA".to_string()));
        harness.run_for(100).await;
        assert_eq!(harness.emulator.state(), ConnectionState::Advertising);
        assert_eq!(harness.shared.advertise_calls.load(Ordering::SeqCst), 2);

        let before = harness.shared.sent().len();
        harness.send(PeripheralEvent::Connected("BB".to_string()));
        harness.send(PeripheralEvent::Subscribed("BB".to_string()));
        harness.run_for(1_500).await;

        let sent = harness.shared.sent();
        let session = distances(&sent[before..]);
        assert!(session[0].abs() < f64::EPSILON);
        assert!(session[1] > 0.0 && session[1] < 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_central_rejected() {
        let mut harness = Harness::new(10.0);
        harness.send(PeripheralEvent::Connected("AA".to_string()));
        harness.send(PeripheralEvent::Connected("BB".to_string()));
        harness.send(PeripheralEvent::Subscribed("BB".to_string()));
        harness.send(PeripheralEvent::Disconnected("BB".to_string()));

        harness.run_for(2_000).await;

        assert_eq!(
            harness.emulator.state(),
            ConnectionState::ConnectedUnsubscribed
        );
        assert_eq!(harness.emulator.peer(), Some("AA"));
        assert_eq!(
            *harness.shared.dropped.lock().unwrap(),
            vec!["BB".to_string()]
        );
        assert!(harness.shared.sent().is_empty());
        assert!(harness.statuses().contains(&StatusEvent::Rejected {
            peer: "BB".to_string()
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_is_a_disconnect() {
        let mut harness = Harness::new(10.0);
        harness.shared.fail_notify.store(true, Ordering::SeqCst);
        harness.send(PeripheralEvent::Connected("AA".to_string()));
        harness.send(PeripheralEvent::Subscribed("AA".to_string()));

        harness.run_for(500).await;

        assert_eq!(harness.emulator.state(), ConnectionState::Advertising);
        assert_eq!(harness.shared.advertise_calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            *harness.shared.dropped.lock().unwrap(),
            vec!["AA".to_string()]
        );

        let statuses = harness.statuses();
        assert!(statuses
            .iter()
            .any(|s| matches!(s, StatusEvent::NotificationFailed { .. })));
        assert_eq!(
            statuses.last(),
            Some(&StatusEvent::Advertising),
            "advertising resumes after the failed session"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_times_out() {
        let mut harness = Harness::new(10.0);
        harness.shared.stall_notify.store(true, Ordering::SeqCst);
        harness.send(PeripheralEvent::Connected("AA".to_string()));
        harness.send(PeripheralEvent::Subscribed("AA".to_string()));

        harness.run_for(1_500).await;

        assert_eq!(harness.emulator.state(), ConnectionState::Advertising);
        assert_eq!(harness.emulator.notifications_sent(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_write_skips_missed_ticks() {
        let mut harness = Harness::with_config(EmulatorConfig {
            footpod: FootpodConfig::new(10.0, 85),
            tick_ms: 1_000,
            notify_timeout_ms: 5_000,
            ..Default::default()
        });
        harness
            .shared
            .slow_second_write_ms
            .store(2_500, Ordering::SeqCst);
        harness.send(PeripheralEvent::Connected("AA".to_string()));
        harness.send(PeripheralEvent::Subscribed("AA".to_string()));

        harness.run_for(5_500).await;

        let starts = harness.shared.write_starts.lock().unwrap().clone();
        assert!(
            (4..=5).contains(&starts.len()),
            "unexpected write count {}",
            starts.len()
        );
        for pair in starts.windows(2) {
            assert!(
                pair[1] - pair[0] >= Duration::from_millis(500),
                "writes issued back to back after a slow one: {:?}",
                pair[1] - pair[0]
            );
        }
        assert_eq!(harness.emulator.state(), ConnectionState::ConnectedNotifying);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_stops_pushes() {
        let mut harness = Harness::new(10.0);
        harness.send(PeripheralEvent::Connected("AA".to_string()));
        harness.send(PeripheralEvent::Subscribed("AA".to_string()));
        harness.run_for(1_500).await;
        assert_eq!(harness.shared.sent().len(), 2);

        harness.send(PeripheralEvent::Unsubscribed("AA".to_string()));
        harness.run_for(5_000).await;

        assert_eq!(
            harness.emulator.state(),
            ConnectionState::ConnectedUnsubscribed
        );
        assert_eq!(harness.shared.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_advertising_failure_is_fatal() {
        let mut harness = Harness::new(10.0);
        harness.shared.fail_advertising.store(true, Ordering::SeqCst);

        let result = harness.emulator.run(harness.shutdown.clone()).await;

        assert!(matches!(result, Err(BridgeError::AdvertisingFailed(_))));
        assert_eq!(harness.emulator.state(), ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_link() {
        let mut harness = Harness::new(10.0);
        harness.send(PeripheralEvent::Connected("AA".to_string()));
        harness.send(PeripheralEvent::Subscribed("AA".to_string()));
        harness.run_for(1_500).await;

        harness.trigger.trigger();
        let result = time::timeout(
            Duration::from_millis(10),
            harness.emulator.run(harness.shutdown.clone()),
        )
        .await;

        assert!(matches!(result, Ok(Ok(()))));
        assert_eq!(harness.emulator.state(), ConnectionState::Idle);
        assert_eq!(
            *harness.shared.dropped.lock().unwrap(),
            vec!["AA".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_transport_is_fatal() {
        let mut harness = Harness::new(10.0);
        let (closed, _) = mpsc::unbounded_channel::<PeripheralEvent>();
        harness.events = closed;

        let result = harness.emulator.run(harness.shutdown.clone()).await;
        assert!(matches!(result, Err(BridgeError::AdapterUnavailable)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let (_events, receiver) = mpsc::unbounded_channel();
        let transport = MockTransport {
            events: receiver,
            shared: Arc::new(Shared::default()),
        };
        let (sink, _statuses) = ChannelSink::new();
        let config = EmulatorConfig {
            footpod: FootpodConfig::new(-1.0, 85),
            ..Default::default()
        };

        assert!(matches!(
            SensorEmulator::new(transport, sink, &config),
            Err(BridgeError::InvalidConfig(_))
        ));
    }
}
