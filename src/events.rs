//! Live-update event broadcast for dashboard clients.
//!
//! The pipeline publishes through this interface after each state
//! transition; the transport (an in-process broadcast channel) stays behind
//! it. Payloads carry enough denormalized data to render without a
//! follow-up query.

use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize)]
pub struct SiteStatusSummary {
    pub site_id: i64,
    pub site_name: String,
    pub status: &'static str,
}

/// The four live-update event kinds.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Event {
    StatusUpdate {
        site_id: i64,
        site_name: String,
        status: &'static str,
        response_time_ms: Option<i64>,
    },
    BulkStatusUpdate {
        sites: Vec<SiteStatusSummary>,
    },
    NewAlert {
        site_id: i64,
        site_name: String,
        category: &'static str,
        severity: &'static str,
        message: String,
    },
    DefacementDetected {
        site_id: i64,
        site_name: String,
        hybrid_score: f64,
        snapshot_key: String,
        diff_key: Option<String>,
    },
}

/// Publish-side handle. Cheap to clone; publishing with no subscribers is
/// not an error.
#[derive(Clone)]
pub struct Publisher {
    tx: broadcast::Sender<Event>,
}

impl Publisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_published_events() {
        let publisher = Publisher::new(16);
        let mut rx = publisher.subscribe();

        publisher.publish(Event::StatusUpdate {
            site_id: 1,
            site_name: "Example".into(),
            status: "down",
            response_time_ms: None,
        });

        match rx.recv().await.unwrap() {
            Event::StatusUpdate { site_id, status, .. } => {
                assert_eq!(site_id, 1);
                assert_eq!(status, "down");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let publisher = Publisher::new(4);
        publisher.publish(Event::BulkStatusUpdate { sites: Vec::new() });
    }

    #[test]
    fn test_events_serialize_with_kind_tag() {
        let json = serde_json::to_string(&Event::DefacementDetected {
            site_id: 2,
            site_name: "Example".into(),
            hybrid_score: 72.5,
            snapshot_key: "current/2_1.png".into(),
            diff_key: Some("diffs/2_1.png".into()),
        })
        .unwrap();
        assert!(json.contains(r#""kind":"defacement-detected""#));
        assert!(json.contains(r#""hybrid_score":72.5"#));
    }
}
