//! WebSocket surface every UI client reads from. One
//! `tokio::sync::broadcast` channel fed by the Coordinator and Write
//! Queue; each connection demuxes it onto the topics the client
//! subscribed to, using a split-socket/`tokio::select!` keepalive loop
//! with per-topic subscription sets rather than per-field predicates.

use crate::coordinator::ProgressEvent;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const UNMAPPED_SAMPLE_LIMIT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    ScrapeProgress,
    OddsUpdates,
    RiskAlerts,
    UnmappedAlerts,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe { topics: Vec<Topic> },
}

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    timestamp: chrono::DateTime<chrono::Utc>,
    data: serde_json::Value,
}

pub struct Broadcaster {
    tx: broadcast::Sender<ProgressEvent>,
}

impl Broadcaster {
    pub fn new(tx: broadcast::Sender<ProgressEvent>) -> Self {
        Self { tx }
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<Broadcaster>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<Broadcaster>) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.tx.subscribe();
    info!("websocket client connected");

    // No subscription yet means nothing is forwarded; clients must
    // subscribe before they see anything.
    let mut subscribed: HashSet<Topic> = HashSet::new();

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(ClientMessage::Subscribe { topics }) = serde_json::from_str(&text) {
                            subscribed = topics.into_iter().collect();
                            info!(topics = ?subscribed, "client updated subscription");
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("websocket client disconnected");
                        break;
                    }
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        if let Some((topic, payload)) = route(&event) {
                            if !subscribed.contains(&topic) {
                                continue;
                            }
                            if sender.send(Message::Text(payload)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "client lagged, dropping missed progress events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = tokio::time::sleep(PING_INTERVAL) => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Maps one `ProgressEvent` to its topic and serialized envelope, or
/// `None` for variants with no client-facing representation.
fn route(event: &ProgressEvent) -> Option<(Topic, String)> {
    let (kind, topic, data) = match event {
        ProgressEvent::DiscoveryStarted => ("discovery_started", Topic::ScrapeProgress, serde_json::json!({})),
        ProgressEvent::DiscoveryComplete { per_book_counts } => (
            "discovery_complete",
            Topic::ScrapeProgress,
            serde_json::json!({ "per_book_counts": stringify_book_counts(per_book_counts) }),
        ),
        ProgressEvent::BatchScraping { batch_id, events } => (
            "batch_scraping",
            Topic::ScrapeProgress,
            serde_json::json!({ "batch_id": batch_id, "events": events }),
        ),
        ProgressEvent::BatchScraped { batch_id, ms } => (
            "batch_scraped",
            Topic::ScrapeProgress,
            serde_json::json!({ "batch_id": batch_id, "ms": ms }),
        ),
        ProgressEvent::BatchStored { batch_id, ms } => (
            "batch_stored",
            Topic::ScrapeProgress,
            serde_json::json!({ "batch_id": batch_id, "ms": ms }),
        ),
        ProgressEvent::CycleComplete { events_scraped, batches } => (
            "cycle_complete",
            Topic::ScrapeProgress,
            serde_json::json!({ "events_scraped": events_scraped, "batches": batches }),
        ),
        ProgressEvent::BatchCommitted { batch_id, event_ids, changed_markets } => {
            // Confirmation-only commits (no repricing, no new/unavailable
            // markets) don't warrant a client-facing odds_update.
            if *changed_markets == 0 {
                return None;
            }
            (
                "odds_update",
                Topic::OddsUpdates,
                serde_json::json!({ "batch_id": batch_id, "event_ids": event_ids, "changed_count": changed_markets }),
            )
        }
        ProgressEvent::BatchFailed { batch_id, event_ids, reason } => (
            "batch_failed",
            Topic::OddsUpdates,
            serde_json::json!({ "batch_id": batch_id, "event_ids": event_ids, "reason": reason }),
        ),
        ProgressEvent::RiskAlertsBatch(alerts) => {
            if alerts.is_empty() {
                return None;
            }
            let event_ids: Vec<i64> = alerts.iter().map(|a| a.event_id).collect();
            let severities: Vec<&'static str> = alerts
                .iter()
                .map(|a| match a.severity {
                    crate::types::AlertSeverity::Warning => "warning",
                    crate::types::AlertSeverity::Elevated => "elevated",
                    crate::types::AlertSeverity::Critical => "critical",
                })
                .collect();
            (
                "risk_alerts",
                Topic::RiskAlerts,
                serde_json::json!({ "alert_count": alerts.len(), "event_ids": event_ids, "severities": severities }),
            )
        }
        ProgressEvent::UnmappedObserved(observations) => {
            if observations.is_empty() {
                return None;
            }
            let samples: Vec<serde_json::Value> = observations
                .iter()
                .take(UNMAPPED_SAMPLE_LIMIT)
                .map(|o| {
                    serde_json::json!({
                        "book": o.book.as_str(),
                        "raw_market_id": o.raw_market_id,
                        "sample_outcomes": o.sample_outcomes,
                    })
                })
                .collect();
            (
                "unmapped_alert",
                Topic::UnmappedAlerts,
                serde_json::json!({ "new_count": observations.len(), "samples": samples }),
            )
        }
    };

    let envelope = Envelope { kind, timestamp: chrono::Utc::now(), data };
    serde_json::to_string(&envelope).ok().map(|payload| (topic, payload))
}

fn stringify_book_counts(counts: &std::collections::HashMap<crate::types::BookSlug, usize>) -> serde_json::Value {
    serde_json::Value::Object(
        counts
            .iter()
            .map(|(book, count)| (book.as_str().to_string(), serde_json::json!(count)))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert(severity: crate::types::AlertSeverity) -> crate::types::RiskAlert {
        crate::types::RiskAlert {
            event_id: 1,
            book: crate::types::BookSlug::Primary,
            canonical_market_id: "1x2".into(),
            line: None,
            outcome_name: "Home".into(),
            alert_type: crate::types::RiskAlertType::PriceChange,
            severity,
            old_value: Some(2.0),
            new_value: Some(2.1),
            change_percent: Some(5.0),
            competitor_direction: None,
            detected_at: chrono::Utc::now(),
            status: crate::types::AlertStatus::New,
            kickoff: chrono::Utc::now(),
        }
    }

    #[test]
    fn risk_alerts_batch_routes_to_risk_alerts_topic_aggregated() {
        let alerts = vec![alert(crate::types::AlertSeverity::Warning), alert(crate::types::AlertSeverity::Critical)];
        let (topic, payload) = route(&ProgressEvent::RiskAlertsBatch(alerts)).unwrap();
        assert_eq!(topic, Topic::RiskAlerts);
        assert!(payload.contains("\"alert_count\":2"));
        assert!(payload.contains("\"severities\":[\"warning\",\"critical\"]"));
    }

    #[test]
    fn empty_risk_alerts_batch_emits_nothing() {
        assert!(route(&ProgressEvent::RiskAlertsBatch(Vec::new())).is_none());
    }

    #[test]
    fn batch_committed_routes_to_odds_updates_topic() {
        let (topic, payload) = route(&ProgressEvent::BatchCommitted { batch_id: 1, event_ids: vec![1, 2], changed_markets: 4 }).unwrap();
        assert_eq!(topic, Topic::OddsUpdates);
        assert!(payload.contains("\"changed_count\":4"));
    }

    #[test]
    fn batch_committed_with_no_changes_emits_nothing() {
        assert!(route(&ProgressEvent::BatchCommitted { batch_id: 1, event_ids: vec![1], changed_markets: 0 }).is_none());
    }

    #[test]
    fn unmapped_observed_routes_with_new_count_and_samples() {
        let observations = vec![crate::mapper::UnmappedObservation {
            book: crate::types::BookSlug::CompetitorA,
            raw_market_id: "x1".into(),
            sample_outcomes: vec!["Home".into()],
        }];
        let (topic, payload) = route(&ProgressEvent::UnmappedObserved(observations)).unwrap();
        assert_eq!(topic, Topic::UnmappedAlerts);
        assert!(payload.contains("\"new_count\":1"));
        assert!(payload.contains("\"raw_market_id\":\"x1\""));
    }
}
