use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::types::{StatusEvent, TreadmillRecord};

/// Consumer of reader records and role status events
///
/// Calls are made synchronously in arrival order, so implementations should
/// hand work off rather than block.
pub trait EventSink: Send {
    /// A role changed state or hit a failure
    fn on_status(&mut self, event: StatusEvent);

    /// A treadmill notification was decoded
    fn on_record(&mut self, _record: &TreadmillRecord) {}
}

/// Event forwarded by [`ChannelSink`]
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    /// Status event
    Status(StatusEvent),
    /// Decoded treadmill record
    Record(TreadmillRecord),
}

/// Sink that forwards every event over an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    /// Create the sink and the receiving end
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelSink {
    fn on_status(&mut self, event: StatusEvent) {
        // a closed receiver means nobody is listening any more
        let _ = self.sender.send(SinkEvent::Status(event));
    }

    fn on_record(&mut self, record: &TreadmillRecord) {
        let _ = self.sender.send(SinkEvent::Record(*record));
    }
}

/// Sink that writes every event to the `tracing` log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn on_status(&mut self, event: StatusEvent) {
        match event {
            StatusEvent::DecodeFailed { .. }
            | StatusEvent::NotificationFailed { .. }
            | StatusEvent::ConnectionFailed { .. }
            | StatusEvent::SubscriptionFailed { .. }
            | StatusEvent::Rejected { .. } => warn!("{event}"),
            _ => info!("{event}"),
        }
    }

    fn on_record(&mut self, record: &TreadmillRecord) {
        let pace = record
            .speed_kmh()
            .filter(|kmh| *kmh > 0.0)
            .map(|kmh| {
                let secs_per_km = pace_seconds(kmh);
                format!("{}:{:02} min/km", secs_per_km / 60, secs_per_km % 60)
            })
            .unwrap_or_else(|| "-".to_string());

        info!(
            "Speed: {:5.1} km/h | Pace: {} | Incline: {:4.1}% | Distance: {}m",
            record.speed_kmh().unwrap_or_default(),
            pace,
            record.incline_percent.unwrap_or_default(),
            record
                .total_distance_m
                .map_or_else(|| "-".to_string(), |m| m.to_string()),
        );
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn pace_seconds(kmh: f64) -> u64 {
    (3600.0 / kmh).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink_preserves_order() {
        let (mut sink, mut receiver) = ChannelSink::new();

        sink.on_status(StatusEvent::Streaming);
        sink.on_record(&TreadmillRecord {
            flags: 0x0001,
            speed_mps: Some(2.0),
            ..Default::default()
        });
        sink.on_status(StatusEvent::Disconnected {
            peer: "AA:BB".to_string(),
        });

        assert_eq!(
            receiver.try_recv().unwrap(),
            SinkEvent::Status(StatusEvent::Streaming)
        );
        assert!(matches!(receiver.try_recv().unwrap(), SinkEvent::Record(r) if r.flags == 1));
        assert!(matches!(
            receiver.try_recv().unwrap(),
            SinkEvent::Status(StatusEvent::Disconnected { .. })
        ));
    }

    #[test]
    fn test_pace_rounds_to_whole_seconds() {
        assert_eq!(pace_seconds(12.0), 300);
        // 5:59.9 rounds up instead of printing 5:60
        assert_eq!(pace_seconds(10.0028), 360);
    }

    #[test]
    fn test_channel_sink_survives_closed_receiver() {
        let (mut sink, receiver) = ChannelSink::new();
        drop(receiver);
        sink.on_status(StatusEvent::Advertising);
    }
}
