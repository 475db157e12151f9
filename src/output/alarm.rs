//! Alarm dispatcher (§4.7): fans an emitted [`BehaviorEvent`] out to a set
//! of `DeliveryChannel`s, fire-and-forget, never blocking the pipeline.
//! HTTP/WebSocket/MQTT transport implementations are external
//! collaborators (§1); this module owns only the dispatch contract and a
//! logging channel used for tests and as a last-resort fallback.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::detection::BBox;
use crate::rules::{BehaviorEvent, BehaviorEventType};

/// Exact on-wire JSON field names from §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmPayload {
    pub event_id: String,
    pub camera_id: String,
    pub rule_id: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub bbox: BBox,
    pub local_track_id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_track_id: Option<String>,
    pub confidence: f32,
    pub snapshot: SnapshotRef,
    pub test_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SnapshotRef {
    DataUri(String),
    Url { url: String },
}

pub fn event_type_name(kind: BehaviorEventType) -> &'static str {
    match kind {
        BehaviorEventType::Intrusion => "intrusion",
        BehaviorEventType::Loitering => "loitering",
        BehaviorEventType::Crowd => "crowd",
        BehaviorEventType::LineCross => "line_cross",
    }
}

pub fn build_payload(event: &BehaviorEvent, bbox: BBox, snapshot: SnapshotRef, test_mode: bool) -> AlarmPayload {
    AlarmPayload {
        event_id: event.id.clone(),
        camera_id: event.camera_id.clone(),
        rule_id: event.rule_id.clone(),
        event_type: event_type_name(event.event_type).to_string(),
        timestamp: event.start_ts,
        bbox,
        local_track_id: event.track_id,
        global_track_id: event.global_track_id.clone(),
        confidence: event.confidence,
        snapshot,
        test_mode,
    }
}

/// Capability every concrete transport implements. Channels are expected
/// to buffer and retry internally; a failure here is logged, never
/// propagated back to the pipeline (§7 `DeliveryFailed`).
#[async_trait::async_trait]
pub trait DeliveryChannel: Send + Sync {
    fn name(&self) -> &str;
    /// Relative dispatch order; lower fires first within the 1s budget.
    fn priority(&self) -> u8;
    async fn deliver(&self, payload: &AlarmPayload) -> crate::error::Result<()>;
}

/// Reference channel that just logs; used for tests and as the default
/// when no real transport is configured.
pub struct LoggingChannel {
    name: String,
    priority: u8,
}

impl LoggingChannel {
    pub fn new(name: impl Into<String>, priority: u8) -> Self {
        LoggingChannel { name: name.into(), priority }
    }
}

#[async_trait::async_trait]
impl DeliveryChannel for LoggingChannel {
    fn name(&self) -> &str {
        &self.name
    }
    fn priority(&self) -> u8 {
        self.priority
    }
    async fn deliver(&self, payload: &AlarmPayload) -> crate::error::Result<()> {
        tracing::info!(channel = %self.name, event_id = %payload.event_id, "alarm delivered");
        Ok(())
    }
}

/// High-priority delivery deadline from §4.7: "all configured channels
/// must be attempted within 1 s for a high priority event."
const HIGH_PRIORITY_DEADLINE: Duration = Duration::from_secs(1);

pub struct AlarmDispatcher {
    channels: Vec<std::sync::Arc<dyn DeliveryChannel>>,
}

impl AlarmDispatcher {
    pub fn new() -> Self {
        AlarmDispatcher { channels: Vec::new() }
    }

    pub fn add_channel(&mut self, channel: std::sync::Arc<dyn DeliveryChannel>) {
        self.channels.push(channel);
        self.channels.sort_by_key(|c| c.priority());
    }

    /// Fires every channel concurrently and fire-and-forget; a slow or
    /// failing channel never blocks the others or the caller beyond the
    /// high-priority deadline.
    pub async fn dispatch(&self, payload: AlarmPayload) {
        let payload = std::sync::Arc::new(payload);
        let mut handles = Vec::new();
        for channel in &self.channels {
            let channel = channel.clone();
            let payload = payload.clone();
            handles.push(tokio::spawn(async move {
                match tokio::time::timeout(HIGH_PRIORITY_DEADLINE, channel.deliver(&payload)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(channel = channel.name(), error = %e, "alarm delivery failed"),
                    Err(_) => error!(channel = channel.name(), "alarm delivery exceeded 1s deadline"),
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Default for AlarmDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::BehaviorEventType;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingChannel {
        priority: u8,
        count: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl DeliveryChannel for CountingChannel {
        fn name(&self) -> &str {
            "counting"
        }
        fn priority(&self) -> u8 {
            self.priority
        }
        async fn deliver(&self, _payload: &AlarmPayload) -> crate::error::Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn all_channels_attempted_even_if_one_fails() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = AlarmDispatcher::new();
        dispatcher.add_channel(Arc::new(CountingChannel { priority: 1, count: count.clone() }));
        dispatcher.add_channel(Arc::new(LoggingChannel::new("http", 2)));
        dispatcher.add_channel(Arc::new(CountingChannel { priority: 3, count: count.clone() }));

        let payload = AlarmPayload {
            event_id: "e1".into(),
            camera_id: "cam1".into(),
            rule_id: "r1".into(),
            event_type: event_type_name(BehaviorEventType::Intrusion).to_string(),
            timestamp: Utc::now(),
            bbox: BBox { x: 0.0, y: 0.0, w: 1.0, h: 1.0 },
            local_track_id: 1,
            global_track_id: None,
            confidence: 0.9,
            snapshot: SnapshotRef::Url { url: "http://example/x.jpg".into() },
            test_mode: false,
        };
        dispatcher.dispatch(payload).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
