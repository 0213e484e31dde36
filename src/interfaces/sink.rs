//! Alert Sinks

use super::AlertSink;
use crate::detection::{AnomalyEvent, Severity};
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// tracing へ出力する通知先
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn publish(&self, event: AnomalyEvent) {
        match event.severity {
            Severity::Critical | Severity::High => warn!(
                event_id = %event.id,
                entity = %event.entity_id,
                metric = %event.metric_label(),
                severity = %event.severity,
                score = event.anomaly_score,
                method = ?event.method,
                "Anomaly detected"
            ),
            Severity::Medium => info!(
                event_id = %event.id,
                entity = %event.entity_id,
                metric = %event.metric_label(),
                severity = %event.severity,
                score = event.anomaly_score,
                method = ?event.method,
                "Anomaly detected"
            ),
        }
    }
}

/// 購読者へブロードキャストする通知先
///
/// 購読者がいない場合や遅れた購読者の取りこぼしは通知先側の責務として扱う。
#[derive(Debug, Clone)]
pub struct BroadcastAlertSink {
    sender: broadcast::Sender<AnomalyEvent>,
}

impl BroadcastAlertSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// イベントストリームを購読
    pub fn subscribe(&self) -> broadcast::Receiver<AnomalyEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl AlertSink for BroadcastAlertSink {
    async fn publish(&self, event: AnomalyEvent) {
        // 購読者なしは正常
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{AnomalySubject, DetectionMethod, ExpectedRange};
    use chrono::Utc;

    fn event() -> AnomalyEvent {
        AnomalyEvent::new(
            "web-1".into(),
            AnomalySubject::Metric {
                metric: "cpu_usage".into(),
                value: 97.0,
            },
            1.0,
            Severity::Critical,
            ExpectedRange {
                min: 20.0,
                max: 80.0,
            },
            DetectionMethod::Statistical,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastAlertSink::new(16);
        let mut rx = sink.subscribe();
        assert_eq!(sink.receiver_count(), 1);

        let sent = event();
        sink.publish(sent.clone()).await;
        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, sent.id);
    }

    #[tokio::test]
    async fn test_broadcast_sink_without_subscribers() {
        let sink = BroadcastAlertSink::new(1);
        sink.publish(event()).await;
        assert_eq!(sink.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_log_sink_does_not_panic() {
        LogAlertSink.publish(event()).await;
    }
}
