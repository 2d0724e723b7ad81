//! Decision collaborator transport and fallbacks.

use super::{AdPod, AdPodItem, DecisionResponse};
use crate::channel::ChannelConfig;
use crate::error::{AdEdgeError, Result};
use crate::hls::AdMediaSegment;
use crate::http_retry::{fetch_with_retry, RetryConfig};
use crate::metrics;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};

/// Deadline for decisions requested synchronously while opening a break.
pub const BREAK_OPEN_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DecisionRequest<'a> {
    channel: &'a str,
    duration_sec: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    scte35_metadata: Option<&'a Value>,
}

/// Client for the external ad decision collaborator.
#[derive(Clone)]
pub struct DecisionClient {
    client: Client,
    endpoint: String,
    on_demand_timeout: Duration,
}

impl DecisionClient {
    pub fn new(client: Client, endpoint: String, on_demand_timeout_ms: u64) -> Self {
        Self {
            client,
            endpoint,
            on_demand_timeout: Duration::from_millis(on_demand_timeout_ms),
        }
    }

    pub fn on_demand_timeout(&self) -> Duration {
        self.on_demand_timeout
    }

    /// Raw decision RPC. No viewer-specific parameters: the response carries
    /// all bitrates and the renderer picks per rendition.
    pub async fn request(
        &self,
        channel_id: &str,
        duration_sec: f64,
        scte35_metadata: Option<&Value>,
        timeout: Duration,
    ) -> Result<DecisionResponse> {
        let url = format!("{}/decision", self.endpoint.trim_end_matches('/'));
        let body = DecisionRequest {
            channel: channel_id,
            duration_sec,
            scte35_metadata,
        };

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                metrics::record_decision(if e.is_timeout() { "timeout" } else { "error" });
                AdEdgeError::DecisionUnavailable(e.to_string())
            })?;

        if !response.status().is_success() {
            metrics::record_decision("error");
            return Err(AdEdgeError::DecisionUnavailable(format!(
                "decision endpoint returned {}",
                response.status()
            )));
        }

        let decision: DecisionResponse = response.json().await.map_err(|e| {
            metrics::record_decision("error");
            AdEdgeError::DecisionUnavailable(format!("undecodable decision body: {}", e))
        })?;

        metrics::record_decision("success");
        Ok(decision)
    }

    /// Decision with a fallback ladder: slate pod when the channel has
    /// one configured, otherwise an empty pod (callers suppress the ad and
    /// serve content). Never returns an error.
    pub async fn decide_with_fallback(
        &self,
        channel: &ChannelConfig,
        duration_sec: f64,
        scte35_metadata: Option<&Value>,
        timeout: Duration,
    ) -> DecisionResponse {
        match self
            .request(&channel.id, duration_sec, scte35_metadata, timeout)
            .await
        {
            Ok(decision) if !decision.pod.items.is_empty() => decision,
            Ok(_) => {
                info!("Decision returned an empty pod for {}", channel.id);
                metrics::record_decision("empty");
                self.fallback_decision(channel, duration_sec)
            }
            Err(e) => {
                warn!("Decision failed for {}: {}, falling back", channel.id, e);
                self.fallback_decision(channel, duration_sec)
            }
        }
    }

    fn fallback_decision(&self, channel: &ChannelConfig, duration_sec: f64) -> DecisionResponse {
        match &channel.slate_url {
            Some(slate_url) => {
                metrics::record_decision("slate");
                slate_decision(channel, slate_url, duration_sec)
            }
            None => DecisionResponse {
                pod: AdPod {
                    pod_id: format!("empty_{}", channel.id),
                    duration_sec,
                    items: Vec::new(),
                },
                tracking: None,
            },
        }
    }
}

/// Builds a slate-backed decision: every ladder bitrate points at the slate
/// playlist so any rendition resolves.
pub fn slate_decision(
    channel: &ChannelConfig,
    slate_url: &str,
    duration_sec: f64,
) -> DecisionResponse {
    let ladder = if channel.bitrate_ladder.is_empty() {
        vec![800u64]
    } else {
        channel.bitrate_ladder.clone()
    };

    let playlist_url = format!("{}/playlist.m3u8", slate_url.trim_end_matches('/'));
    let items = ladder
        .into_iter()
        .map(|kbps| AdPodItem {
            ad_id: format!("slate_{}", channel.id),
            bitrate: kbps * 1000,
            playlist_url: playlist_url.clone(),
        })
        .collect();

    DecisionResponse {
        pod: AdPod {
            pod_id: format!("slate_{}", channel.id),
            duration_sec,
            items,
        },
        tracking: None,
    }
}

/// Fetches an ad (or slate) variant playlist and flattens it into spliceable
/// segments. Relative segment URIs are resolved against the playlist URL.
///
/// Retries with exponential backoff (100/200/400 ms); after the final failure
/// the caller suppresses the ad.
pub async fn fetch_ad_segments(
    client: &Client,
    playlist_url: &str,
    slate: bool,
) -> Result<Vec<AdMediaSegment>> {
    let response = fetch_with_retry(client, playlist_url, &RetryConfig::default()).await?;
    let body = response.text().await?;
    let playlist = crate::hls::parse_media_playlist(&body)?;

    let base = playlist_url
        .rsplit_once('/')
        .map(|(base, _)| base)
        .unwrap_or(playlist_url);

    Ok(playlist
        .segments
        .iter()
        .map(|seg| {
            let uri = if seg.uri.starts_with("http") {
                seg.uri.clone()
            } else {
                format!("{}/{}", base, seg.uri)
            };
            AdMediaSegment {
                uri,
                duration_sec: seg.duration as f64,
                slate,
            }
        })
        .collect())
}
