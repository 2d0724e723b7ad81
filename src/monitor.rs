//! Per-channel SCTE-35 monitor loop.
//!
//! One task per armed channel polls a deterministic mid-tier variant, runs
//! the decoder over it, and pre-populates the KV fast path when a new active
//! OUT appears — so the first viewer request of a break can be served without
//! waiting on the serializer. Projections written here are advisory; the
//! serializer overwrites them when it processes the same break.

use crate::breaks::kv::{AdBreakKv, AdBreakRecord, Scte35Meta};
use crate::channel::{ChannelConfig, ChannelStore};
use crate::decision::DecisionClient;
use crate::metrics;
use crate::scte35::{self, SignalKind, SignalValidation};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Consecutive poll failures before the monitor disarms itself.
const MAX_CONSECUTIVE_FAILURES: u32 = 10;

/// Decision deadline used from the monitor (same as the on-demand deadline).
const MONITOR_DECISION_TIMEOUT: Duration = Duration::from_millis(2000);

#[derive(Clone)]
pub struct MonitorDeps {
    pub http: Client,
    pub kv: AdBreakKv,
    pub decision: DecisionClient,
    pub channels: Arc<ChannelStore>,
    pub poll_interval: Duration,
}

/// Registry of running monitor tasks, keyed by channel id.
pub struct MonitorRegistry {
    tasks: DashMap<String, JoinHandle<()>>,
    deps: MonitorDeps,
}

impl MonitorRegistry {
    pub fn new(deps: MonitorDeps) -> Self {
        Self {
            tasks: DashMap::new(),
            deps,
        }
    }

    /// Arms a monitor for the channel. Re-arming an armed channel restarts
    /// its task (this is how an admin recovers a self-disarmed monitor).
    pub fn arm(self: &Arc<Self>, channel_id: &str) -> bool {
        let Some(channel) = self.deps.channels.by_id(channel_id) else {
            warn!("Cannot arm monitor: unknown channel {}", channel_id);
            return false;
        };

        if let Some((_, old)) = self.tasks.remove(channel_id) {
            old.abort();
        }

        let deps = self.deps.clone();
        let registry = Arc::downgrade(self);
        let id = channel_id.to_string();
        let handle = tokio::spawn(async move {
            run_monitor(deps, channel).await;
            // Self-disarm after repeated failures: drop the registry entry so
            // `armed()` reflects reality and an admin can re-arm
            if let Some(registry) = registry.upgrade() {
                registry.tasks.remove(&id);
            }
        });

        info!("Armed SCTE-35 monitor for {}", channel_id);
        self.tasks.insert(channel_id.to_string(), handle);
        true
    }

    /// Disarms immediately (abort, not graceful) per channel deactivation.
    pub fn disarm(&self, channel_id: &str) {
        if let Some((_, handle)) = self.tasks.remove(channel_id) {
            handle.abort();
            info!("Disarmed SCTE-35 monitor for {}", channel_id);
        }
    }

    pub fn armed(&self, channel_id: &str) -> bool {
        self.tasks.contains_key(channel_id)
    }

    pub fn armed_count(&self) -> usize {
        self.tasks.len()
    }
}

async fn run_monitor(deps: MonitorDeps, channel: Arc<ChannelConfig>) {
    let mut ticker = tokio::time::interval(deps.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut consecutive_failures: u32 = 0;

    loop {
        ticker.tick().await;

        match poll_once(&deps, &channel).await {
            Ok(found_signal) => {
                consecutive_failures = 0;
                metrics::record_monitor_poll(if found_signal { "signal" } else { "idle" });
            }
            Err(e) => {
                consecutive_failures += 1;
                metrics::record_monitor_poll("error");
                warn!(
                    "Monitor poll failed for {} ({}/{}): {}",
                    channel.id, consecutive_failures, MAX_CONSECUTIVE_FAILURES, e
                );
                if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    warn!(
                        "Monitor for {} disarmed after {} consecutive failures; re-arm required",
                        channel.id, MAX_CONSECUTIVE_FAILURES
                    );
                    return;
                }
            }
        }
    }
}

/// One poll cycle. Returns whether a new active OUT was projected to KV.
async fn poll_once(
    deps: &MonitorDeps,
    channel: &ChannelConfig,
) -> Result<bool, crate::error::AdEdgeError> {
    let detected = deps.channels.detected_bitrates(&channel.id);
    let variant = channel.mid_tier_variant(detected.as_ref());
    let url = channel.variant_url(&variant);

    let body = deps
        .http
        .get(&url)
        .timeout(Duration::from_secs(2))
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;

    let playlist = crate::hls::parse_media_playlist(&body)?;
    let now_ms = Utc::now().timestamp_millis();
    let signals = scte35::signals_from_playlist(&playlist);

    let Some(active) = scte35::select_active_break(&signals, now_ms) else {
        return Ok(false);
    };
    if active.kind != SignalKind::Out {
        return Ok(false);
    }
    if let SignalValidation::Reject(reason) = scte35::validate_signal(active, now_ms) {
        debug!("Monitor: signal {} rejected: {}", active.event_id, reason);
        return Ok(false);
    }

    // Already projected? The active key is the dedupe point.
    if let Some(existing) = deps.kv.get_active(&channel.id, now_ms).await {
        if existing.event_id == active.event_id {
            return Ok(false);
        }
    }

    let duration = active.duration_sec.unwrap_or(0.0);
    if duration <= 0.0 {
        return Ok(false);
    }

    let decision = deps
        .decision
        .decide_with_fallback(channel, duration, None, MONITOR_DECISION_TIMEOUT)
        .await;

    let end_ms = active.start_ms + (duration * 1000.0).round() as i64;
    let record = AdBreakRecord {
        channel_id: channel.id.clone(),
        event_id: active.event_id.clone(),
        source: "scte35".to_string(),
        start_time: active.start_iso.clone(),
        duration,
        end_time: DateTime::from_timestamp_millis(end_ms)
            .map(|dt| dt.fixed_offset().to_rfc3339())
            .unwrap_or_default(),
        decision: Some(decision),
        scte35: Some(Scte35Meta {
            event_id: active.event_id.clone(),
            start_pdt: Some(active.start_iso.clone()),
            duration_sec: Some(duration),
            tier: active.tier,
            raw_hex: (!active.raw.is_empty()).then(|| hex::encode(&active.raw)),
        }),
        stable_skip_count: None,
        pod_url: None,
    };

    deps.kv.put(&record).await;
    info!(
        "Monitor pre-populated break {} for {} ({}s)",
        active.event_id, channel.id, duration
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelMode, ChannelStatus};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn channel(origin: &str) -> ChannelConfig {
        ChannelConfig {
            id: "ch1".to_string(),
            org_slug: "acme".to_string(),
            slug: "news".to_string(),
            origin_url: origin.to_string(),
            ad_pod_base_url: None,
            sign_host: None,
            status: ChannelStatus::Active,
            mode: ChannelMode::Auto,
            tier: 0,
            scte35_auto_insert: true,
            time_based_auto_insert: false,
            slate_url: None,
            bitrate_ladder: vec![2000],
            segment_cache_max_age: None,
            manifest_cache_max_age: None,
        }
    }

    fn live_manifest_with_cue(now_ms: i64) -> String {
        let start = DateTime::from_timestamp_millis(now_ms).unwrap().to_rfc3339();
        let pdt0 = DateTime::from_timestamp_millis(now_ms - 12_000)
            .unwrap()
            .to_rfc3339();
        format!(
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:6\n#EXT-X-MEDIA-SEQUENCE:10\n\
             #EXT-X-PROGRAM-DATE-TIME:{}\n#EXTINF:6.0,\nseg10.ts\n#EXTINF:6.0,\nseg11.ts\n\
             #EXT-X-DATERANGE:ID=\"e1\",CLASS=\"scte35:oatcls\",START-DATE=\"{}\",DURATION=12.0\n\
             #EXTINF:6.0,\nseg12.ts\n",
            pdt0, start
        )
    }

    fn deps(server_uri: &str, channel_cfg: ChannelConfig) -> MonitorDeps {
        MonitorDeps {
            http: Client::new(),
            kv: AdBreakKv::new_memory(),
            decision: DecisionClient::new(Client::new(), server_uri.to_string(), 500),
            channels: Arc::new(ChannelStore::new(vec![channel_cfg])),
            poll_interval: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn poll_projects_new_break_to_kv() {
        let server = MockServer::start().await;
        let now_ms = Utc::now().timestamp_millis();

        Mock::given(method("GET"))
            .and(path("/live/2000.m3u8"))
            .respond_with(ResponseTemplate::new(200).set_body_string(live_manifest_with_cue(now_ms)))
            .mount(&server)
            .await;
        // Decision endpoint fails → empty-pod fallback, projection still lands
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let origin = format!("{}/live", server.uri());
        let d = deps(&server.uri(), channel(&origin));
        let ch = d.channels.by_id("ch1").unwrap();

        let found = poll_once(&d, &ch).await.unwrap();
        assert!(found);

        let record = d.kv.get_active("ch1", now_ms + 1_000).await.unwrap();
        assert_eq!(record.event_id, "e1");
        assert_eq!(record.source, "scte35");

        // Second poll with the same signal is a no-op
        let found_again = poll_once(&d, &ch).await.unwrap();
        assert!(!found_again);
    }

    #[tokio::test]
    async fn poll_without_signal_is_idle() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:6\n#EXTINF:6.0,\nseg0.ts\n",
            ))
            .mount(&server)
            .await;

        let origin = format!("{}/live", server.uri());
        let d = deps(&server.uri(), channel(&origin));
        let ch = d.channels.by_id("ch1").unwrap();

        assert!(!poll_once(&d, &ch).await.unwrap());
    }

    #[tokio::test]
    async fn arm_and_disarm() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("#EXTM3U\n"))
            .mount(&server)
            .await;

        let origin = format!("{}/live", server.uri());
        let d = deps(&server.uri(), channel(&origin));
        let registry = Arc::new(MonitorRegistry::new(d));

        assert!(registry.arm("ch1"));
        assert!(registry.armed("ch1"));
        assert!(!registry.arm("nope"));

        registry.disarm("ch1");
        assert!(!registry.armed("ch1"));
    }
}
