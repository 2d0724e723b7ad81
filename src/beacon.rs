//! Best-effort beacon publishing.
//!
//! Beacons never block or fail a manifest response: every publish is a
//! spawned fire-and-forget task with a short timeout. When a beacon
//! collaborator endpoint is configured the structured message goes there;
//! tracker URLs are always pinged directly.

use crate::metrics;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

const BEACON_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize)]
pub struct BeaconMessage {
    /// "imp" | "ad_start" | "quartile" | "complete" | "error"
    pub event: String,
    #[serde(rename = "adId", skip_serializing_if = "Option::is_none")]
    pub ad_id: Option<String>,
    #[serde(rename = "podId", skip_serializing_if = "Option::is_none")]
    pub pod_id: Option<String>,
    pub channel: String,
    /// Epoch milliseconds.
    pub ts: i64,
    #[serde(rename = "trackerUrls")]
    pub tracker_urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Clone)]
pub struct BeaconSink {
    client: Client,
    endpoint: Option<String>,
}

impl BeaconSink {
    pub fn new(client: Client, endpoint: Option<String>) -> Self {
        Self { client, endpoint }
    }

    /// Publish a beacon. Returns immediately; delivery is best-effort.
    pub fn publish(&self, message: BeaconMessage) {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();

        tokio::spawn(async move {
            if let Some(endpoint) = endpoint {
                match client
                    .post(&endpoint)
                    .timeout(BEACON_TIMEOUT)
                    .json(&message)
                    .send()
                    .await
                {
                    Ok(resp) => {
                        debug!("Beacon {} -> {} ({})", message.event, endpoint, resp.status());
                        metrics::record_beacon("success");
                    }
                    Err(e) => {
                        warn!("Beacon {} failed: {}", message.event, e);
                        metrics::record_beacon("error");
                    }
                }
            }

            for url in &message.tracker_urls {
                match client.get(url).timeout(BEACON_TIMEOUT).send().await {
                    Ok(resp) => {
                        debug!("Tracker {} ({})", url, resp.status());
                        metrics::record_beacon("success");
                    }
                    Err(e) => {
                        warn!("Tracker {} failed: {}", url, e);
                        metrics::record_beacon("error");
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn publish_hits_endpoint_and_trackers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;

        let sink = BeaconSink::new(Client::new(), Some(server.uri()));
        sink.publish(BeaconMessage {
            event: "ad_start".to_string(),
            ad_id: Some("a1".to_string()),
            pod_id: Some("ad_ch1_1700000000".to_string()),
            channel: "ch1".to_string(),
            ts: 1_700_000_000_000,
            tracker_urls: vec![
                format!("{}/imp1", server.uri()),
                format!("{}/imp2", server.uri()),
            ],
            metadata: None,
        });

        // Fire-and-forget: give the spawned task a beat, then let the mock
        // expectations verify on drop
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    #[test]
    fn message_serializes_with_wire_names() {
        let message = BeaconMessage {
            event: "imp".to_string(),
            ad_id: Some("a1".to_string()),
            pod_id: None,
            channel: "ch1".to_string(),
            ts: 42,
            tracker_urls: vec![],
            metadata: None,
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["adId"], "a1");
        assert_eq!(json["trackerUrls"], serde_json::json!([]));
        assert!(json.get("podId").is_none());
    }
}
