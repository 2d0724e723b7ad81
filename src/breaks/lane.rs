//! Per-channel serializer.
//!
//! Exactly one logical writer exists per channel: every mutation of its
//! [`BreakSlot`] happens under the channel lane's mutex, so concurrent
//! requests for different renditions observe a linearizable break state —
//! the first rewrite binds the skip plan, everyone after reads it. Requests
//! for distinct channels never contend.
//!
//! Everything fallible inside the critical section is caught there and
//! reduced to a content-preserving fallback, so the lock always releases
//! with a servable manifest in hand.

use crate::beacon::{BeaconMessage, BeaconSink};
use crate::breaks::kv::{AdBreakKv, AdBreakRecord, Scte35Meta};
use crate::breaks::state::{tier_matches, BreakSlot, BreakSource, SharedManifestPlan};
use crate::cache::OriginCache;
use crate::channel::ChannelConfig;
use crate::decision::{fetch_ad_segments, select_ad_variant, DecisionClient, DecisionResponse};
use crate::decision::client::BREAK_OPEN_TIMEOUT;
use crate::error::{AdEdgeError, Result};
use crate::hls::{self, AdMediaSegment, InterstitialSpec};
use crate::metrics;
use crate::scte35::{self, SignalKind, SignalValidation};
use chrono::DateTime;
use dashmap::DashMap;
use m3u8_rs::MediaPlaylist;
use reqwest::Client;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Soft bound on queued requests per channel; beyond it new arrivals bypass
/// the serializer entirely.
const LANE_SOFT_BOUND: usize = 64;

/// Origin fetches inside the critical section are deadlined at 2s.
const ORIGIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Stitching mode resolved for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StitchMode {
    Ssai,
    Sgai,
}

/// Collaborators the lane needs; bundled so handlers pass one reference.
#[derive(Clone)]
pub struct LaneDeps {
    pub http: Client,
    pub origin_cache: OriginCache,
    pub kv: AdBreakKv,
    pub decision: DecisionClient,
    pub beacons: BeaconSink,
    pub break_window_expiry_ms: i64,
    pub time_based_break_duration_secs: f64,
}

pub struct ChannelLane {
    pub slot: Mutex<BreakSlot>,
    pending: AtomicUsize,
}

/// Sharded map of per-channel lanes.
pub struct ChannelLanes {
    lanes: DashMap<String, Arc<ChannelLane>>,
}

impl ChannelLanes {
    pub fn new() -> Self {
        Self {
            lanes: DashMap::new(),
        }
    }

    pub fn lane(&self, channel_id: &str) -> Arc<ChannelLane> {
        self.lanes
            .entry(channel_id.to_string())
            .or_insert_with(|| {
                Arc::new(ChannelLane {
                    slot: Mutex::new(BreakSlot::default()),
                    pending: AtomicUsize::new(0),
                })
            })
            .clone()
    }

    /// Best-effort count of lanes holding a live break (for the gauge).
    pub fn approx_active_breaks(&self) -> usize {
        self.lanes
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .slot
                    .try_lock()
                    .map(|slot| slot.current.is_some())
                    .unwrap_or(false)
            })
            .count()
    }
}

impl Default for ChannelLanes {
    fn default() -> Self {
        Self::new()
    }
}

struct PendingGuard<'a>(&'a AtomicUsize);

impl<'a> PendingGuard<'a> {
    fn acquire(counter: &'a AtomicUsize) -> Option<Self> {
        if counter.fetch_add(1, Ordering::SeqCst) >= LANE_SOFT_BOUND {
            counter.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(Self(counter))
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// ── Break views ─────────────────────────────────────────────────────────

/// The fields a rewrite needs, abstracted over the authoritative state and
/// the KV projection so the fast path renders identically.
#[derive(Debug, Clone)]
pub struct BreakView {
    pub pod_id: String,
    pub source: String,
    pub pod_url: Option<String>,
    /// Break start as epoch ms when pinned (SCTE-35 PDT or bound plan);
    /// `None` means "most recent manifest PDT" (manual/time, unbound).
    pub start_ms: Option<i64>,
    pub duration_sec: f64,
    pub decision: Option<DecisionResponse>,
    pub scte35_payload: Option<Vec<u8>>,
    pub stable_skip_count: Option<usize>,
}

impl BreakView {
    pub fn from_state(state: &crate::breaks::state::AdBreakState) -> Self {
        let start_ms = state
            .manifest_plan
            .as_ref()
            .and_then(|p| DateTime::parse_from_rfc3339(&p.start_pdt).ok())
            .map(|dt| dt.timestamp_millis())
            .or((state.source == BreakSource::Scte35).then_some(state.started_at));
        Self {
            pod_id: state.pod_id.clone(),
            source: state.source.as_str().to_string(),
            pod_url: state.pod_url.clone(),
            start_ms,
            duration_sec: state.duration_sec,
            decision: state.decision.clone(),
            scte35_payload: state.scte35_payload.clone(),
            stable_skip_count: state.skip_bound().then_some(state.content_segments_to_skip),
        }
    }

    pub fn from_record(record: &AdBreakRecord) -> Self {
        let scte_payload = record
            .scte35
            .as_ref()
            .and_then(|m| m.raw_hex.as_ref())
            .and_then(|h| hex::decode(h.trim_start_matches("0x")).ok());
        Self {
            pod_id: record.pod_id(),
            source: record.source.clone(),
            pod_url: record.pod_url.clone(),
            start_ms: (record.source == "scte35")
                .then(|| record.start_ms())
                .flatten(),
            duration_sec: record.duration,
            decision: record.decision.clone(),
            scte35_payload: scte_payload,
            stable_skip_count: record.stable_skip_count,
        }
    }
}

/// What a successful rewrite bound, for write-back into the state.
#[derive(Debug, Clone)]
pub struct BindInfo {
    pub segments_skipped: usize,
    pub duration_skipped: f64,
    pub start_pdt: String,
    pub resume_pdt: Option<String>,
}

pub struct Rendered {
    pub manifest: String,
    pub bind: Option<BindInfo>,
}

// ── Rendering (shared by lane and KV fast path) ─────────────────────────

fn parse_variant_kbps(variant: &str) -> Option<u64> {
    let digits: String = variant.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Applies a break to a parsed variant playlist. Returns `None` when the ad
/// must be suppressed (empty pod, start PDT out of window, short tail) — the
/// caller serves stripped content instead.
pub async fn render_with_break(
    deps: &LaneDeps,
    channel: &ChannelConfig,
    playlist: &MediaPlaylist,
    view: &BreakView,
    mode: StitchMode,
    variant: &str,
) -> Result<Option<Rendered>> {
    let start_ms = match view.start_ms.or_else(|| hls::last_pdt_ms(playlist)) {
        Some(ms) => ms,
        None => {
            debug!("No PDT available to anchor break {}", view.pod_id);
            return Ok(None);
        }
    };

    let viewer_bps = parse_variant_kbps(variant).map(|k| k * 1000).unwrap_or(u64::MAX);
    let items = view.decision.as_ref().map(|d| d.pod.items.as_slice()).unwrap_or(&[]);

    match mode {
        StitchMode::Sgai => {
            let asset_uri = view
                .pod_url
                .clone()
                .or_else(|| {
                    select_ad_variant(items, viewer_bps, variant).map(|i| i.playlist_url.clone())
                });
            let Some(asset_uri) = asset_uri else {
                return Ok(None);
            };
            let Some(start_pdt) = DateTime::from_timestamp_millis(start_ms) else {
                return Ok(None);
            };

            let mut out = playlist.clone();
            hls::strip_origin_scte35(&mut out);
            hls::inject_interstitial(
                &mut out,
                &InterstitialSpec {
                    id: view.pod_id.clone(),
                    start_pdt: start_pdt.fixed_offset(),
                    duration_sec: view.duration_sec,
                    asset_uri,
                    scte35_payload: view.scte35_payload.clone(),
                },
            );
            let manifest = hls::serialize_media_playlist(out)?;
            Ok(Some(Rendered {
                manifest,
                bind: None,
            }))
        }
        StitchMode::Ssai => {
            let Some(item) = (match &view.pod_url {
                // Operator-supplied pod URL overrides decision items
                Some(url) => Some(std::borrow::Cow::Owned(crate::decision::AdPodItem {
                    ad_id: view.pod_id.clone(),
                    bitrate: viewer_bps,
                    playlist_url: url.clone(),
                })),
                None => select_ad_variant(items, viewer_bps, variant).map(std::borrow::Cow::Borrowed),
            }) else {
                return Ok(None);
            };

            let pod_segments = match fetch_ad_segments(&deps.http, &item.playlist_url, false).await
            {
                Ok(segments) if !segments.is_empty() => segments,
                Ok(_) => return Ok(None),
                Err(e) => {
                    warn!("Ad playlist fetch failed for {}: {}, suppressing ad", view.pod_id, e);
                    return Ok(None);
                }
            };

            let slate_segments: Option<Vec<AdMediaSegment>> = match &channel.slate_url {
                Some(slate_url) => {
                    let playlist_url = format!("{}/playlist.m3u8", slate_url.trim_end_matches('/'));
                    fetch_ad_segments(&deps.http, &playlist_url, true).await.ok()
                }
                None => None,
            };

            let outcome = hls::splice_ad_pod(
                playlist,
                start_ms,
                pod_segments,
                view.duration_sec,
                view.stable_skip_count,
                slate_segments.as_deref(),
            );

            match outcome {
                Some(outcome) => {
                    let manifest = hls::serialize_media_playlist(outcome.playlist)?;
                    let start_pdt = DateTime::from_timestamp_millis(start_ms)
                        .map(|dt| dt.fixed_offset().to_rfc3339())
                        .unwrap_or_default();
                    let resume_pdt = DateTime::from_timestamp_millis(
                        start_ms + (outcome.duration_skipped * 1000.0).round() as i64,
                    )
                    .map(|dt| dt.fixed_offset().to_rfc3339());
                    Ok(Some(Rendered {
                        manifest,
                        bind: Some(BindInfo {
                            segments_skipped: outcome.segments_skipped,
                            duration_skipped: outcome.duration_skipped,
                            start_pdt,
                            resume_pdt,
                        }),
                    }))
                }
                None => Ok(None),
            }
        }
    }
}

// ── The serializer itself ───────────────────────────────────────────────

/// Origin manifest fetch with the 1s dedupe cache and a 2s deadline.
pub async fn fetch_origin(deps: &LaneDeps, url: &str) -> Result<String> {
    if let Some(cached) = deps.origin_cache.get(url) {
        return Ok(cached);
    }
    let response = deps
        .http
        .get(url)
        .timeout(ORIGIN_TIMEOUT)
        .send()
        .await
        .map_err(|e| {
            metrics::record_origin_error();
            AdEdgeError::OriginFetch(e)
        })?;
    let response = response.error_for_status().map_err(|e| {
        metrics::record_origin_error();
        AdEdgeError::OriginFetch(e)
    })?;
    let body = response.text().await?;
    deps.origin_cache.insert(url, body.clone());
    Ok(body)
}

fn stripped(content: &MediaPlaylist) -> Result<String> {
    let mut out = content.clone();
    hls::strip_origin_scte35(&mut out);
    hls::serialize_media_playlist(out)
}

fn scte35_metadata_json(state: &crate::breaks::state::AdBreakState) -> Option<serde_json::Value> {
    (state.source == BreakSource::Scte35).then(|| {
        serde_json::json!({
            "eventId": state.processed_event_ids.iter().next(),
            "startPdt": state.scte35_start_pdt,
            "durationSec": state.duration_sec,
        })
    })
}

fn record_from_state(state: &crate::breaks::state::AdBreakState) -> AdBreakRecord {
    let start = DateTime::from_timestamp_millis(state.started_at)
        .map(|dt| dt.fixed_offset().to_rfc3339())
        .unwrap_or_default();
    let end = DateTime::from_timestamp_millis(state.ends_at)
        .map(|dt| dt.fixed_offset().to_rfc3339())
        .unwrap_or_default();
    let event_id = state
        .processed_event_ids
        .iter()
        .next()
        .cloned()
        .unwrap_or_else(|| state.pod_id.clone());
    AdBreakRecord {
        channel_id: state.channel_id.clone(),
        event_id,
        source: state.source.as_str().to_string(),
        start_time: start,
        duration: state.duration_sec,
        end_time: end,
        decision: state.decision.clone(),
        scte35: (state.source == BreakSource::Scte35).then(|| Scte35Meta {
            event_id: state
                .processed_event_ids
                .iter()
                .next()
                .cloned()
                .unwrap_or_default(),
            start_pdt: state.scte35_start_pdt.clone(),
            duration_sec: Some(state.duration_sec),
            tier: 0,
            raw_hex: state.scte35_payload.as_ref().map(hex::encode),
        }),
        stable_skip_count: state.skip_bound().then_some(state.content_segments_to_skip),
        pod_url: state.pod_url.clone(),
    }
}

/// Serves one manifest request through the channel's critical section.
///
/// Returns [`AdEdgeError::LaneOverloaded`] without touching the lock when the
/// queue depth exceeds the soft bound; callers then fall back to the KV fast
/// path or raw origin.
pub async fn serve(
    lanes: &ChannelLanes,
    deps: &LaneDeps,
    channel: &ChannelConfig,
    variant: &str,
    mode: StitchMode,
    now_ms: i64,
) -> Result<String> {
    let lane = lanes.lane(&channel.id);
    let Some(_guard) = PendingGuard::acquire(&lane.pending) else {
        metrics::record_serializer_bypass();
        return Err(AdEdgeError::LaneOverloaded(channel.id.clone()));
    };

    let mut slot = lane.slot.lock().await;

    // Origin failure short-circuits to a synthetic manifest with 200 so the
    // player keeps polling instead of erroring out
    let origin_url = channel.variant_url(variant);
    let body = match fetch_origin(deps, &origin_url).await {
        Ok(body) => body,
        Err(e) => {
            warn!("Origin fetch failed for {}: {}, serving slate", origin_url, e);
            return Ok(hls::synthetic_slate_manifest(channel.slate_url.as_deref()));
        }
    };

    let result = match mutate(&mut slot, deps, channel, variant, mode, now_ms, &body).await {
        Ok(manifest) => Ok(manifest),
        Err(e) => {
            // All in-section failures degrade to content with origin SCTE
            // stripped; a parse failure degrades to the raw body
            warn!("Serializer error on {}: {}, serving origin", channel.id, e);
            match hls::parse_media_playlist(&body) {
                Ok(playlist) => stripped(&playlist),
                Err(_) => Ok(body),
            }
        }
    };

    drop(slot);
    metrics::set_active_breaks(lanes.approx_active_breaks());
    result
}

async fn mutate(
    slot: &mut BreakSlot,
    deps: &LaneDeps,
    channel: &ChannelConfig,
    variant: &str,
    mode: StitchMode,
    now_ms: i64,
    body: &str,
) -> Result<String> {
    let playlist = match hls::parse_playlist(body)? {
        m3u8_rs::Playlist::MediaPlaylist(media) => media,
        // Master playlists are never mutated here
        m3u8_rs::Playlist::MasterPlaylist(_) => return Ok(body.to_string()),
    };

    // 1. Expiry first (wall clock + manifest window) so a cleared slot can
    // accept the next break this same cycle
    if slot.expire(now_ms, deps.break_window_expiry_ms).is_some() {
        deps.kv.clear_active(&channel.id).await;
    }

    // 2. Evaluate SCTE-35 signals against the state machine
    if channel.scte35_auto_insert {
        let signals = scte35::signals_from_playlist(&playlist);
        for signal in &signals {
            match scte35::validate_signal(signal, now_ms) {
                SignalValidation::Reject(reason) => {
                    metrics::record_scte35_signal("rejected");
                    warn!("SCTE-35 signal {} rejected: {}", signal.event_id, reason);
                    continue;
                }
                SignalValidation::Warn(reasons) => {
                    for reason in &reasons {
                        warn!("SCTE-35 signal {}: {}", signal.event_id, reason);
                    }
                }
                SignalValidation::Accept => {}
            }
            match signal.kind {
                SignalKind::Out => {
                    slot.on_scte35_out(
                        &channel.id,
                        signal,
                        tier_matches(channel.tier, signal.tier),
                        now_ms,
                    );
                }
                SignalKind::In => {
                    slot.on_scte35_in(&signal.event_id);
                }
                SignalKind::Cmd => {}
            }
        }
    }

    // 3. Schedule trigger
    if slot.current.is_none() && channel.time_based_auto_insert {
        slot.maybe_start_scheduled(&channel.id, now_ms, deps.time_based_break_duration_secs);
    }

    let Some(state) = slot.current.as_mut() else {
        return stripped(&playlist);
    };

    // 4. Decision, synchronously on break open, refreshed past the TTL
    if !state.decision_fresh(now_ms) {
        let timeout = if state.decision.is_none() {
            BREAK_OPEN_TIMEOUT
        } else {
            deps.decision.on_demand_timeout()
        };
        let first_decision = state.decision.is_none();
        let metadata = scte35_metadata_json(state);
        let decision = deps
            .decision
            .decide_with_fallback(channel, state.duration_sec, metadata.as_ref(), timeout)
            .await;
        let impressions = decision
            .tracking
            .as_ref()
            .map(|t| t.impressions.clone())
            .unwrap_or_default();
        state.store_decision(decision, now_ms);
        if first_decision {
            deps.beacons.publish(BeaconMessage {
                event: "ad_start".to_string(),
                ad_id: None,
                pod_id: Some(state.pod_id.clone()),
                channel: channel.id.clone(),
                ts: now_ms,
                tracker_urls: impressions,
                metadata: None,
            });
        }
    }

    // 5. Rewrite
    let view = BreakView::from_state(state);
    let rendered = render_with_break(deps, channel, &playlist, &view, mode, variant).await?;

    match rendered {
        Some(output) => {
            if let Some(bind) = &output.bind {
                // Telemetry cross-check: a fresh duration-derived plan that
                // disagrees with the bound count is an anomaly (bound wins)
                if let (Some(bound), Some(start_ms)) = (view.stable_skip_count, view.start_ms) {
                    if let Some(check) =
                        hls::calculate_skip_plan(&playlist, start_ms, state.duration_sec, None)
                    {
                        if check.segments_skipped != bound {
                            metrics::record_skip_count_anomaly();
                            warn!(
                                "Skip recomputation for {} disagrees: bound {} vs {}",
                                state.pod_id, bound, check.segments_skipped
                            );
                        }
                    }
                }
                state.bind_skip_plan(bind.segments_skipped, bind.duration_skipped);
                if state.manifest_plan.is_none() {
                    state.store_plan(SharedManifestPlan {
                        start_pdt: bind.start_pdt.clone(),
                        leading_decorations: vec![
                            "#EXT-X-PROGRAM-DATE-TIME".to_string(),
                            "#EXT-X-DISCONTINUITY".to_string(),
                        ],
                        trailing_decorations: vec!["#EXT-X-DISCONTINUITY".to_string()],
                        stable_skip_count: bind.segments_skipped,
                        updated_at: now_ms,
                    });
                }
            }
            // Mirror the (possibly newly bound) projection for the fast path
            deps.kv.put(&record_from_state(state)).await;
            info!(
                "Break {} applied to {}/{} ({})",
                state.pod_id,
                channel.id,
                variant,
                match mode {
                    StitchMode::Ssai => "ssai",
                    StitchMode::Sgai => "sgai",
                }
            );
            Ok(output.manifest)
        }
        None => {
            // Suppressed: keep the projection current, serve clean content
            deps.kv.put(&record_from_state(state)).await;
            stripped(&playlist)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_kbps_parses_numeric_prefix() {
        assert_eq!(parse_variant_kbps("2000.m3u8"), Some(2000));
        assert_eq!(parse_variant_kbps("800.m3u8"), Some(800));
        assert_eq!(parse_variant_kbps("playlist.m3u8"), None);
    }

    #[test]
    fn pending_guard_enforces_soft_bound() {
        let counter = AtomicUsize::new(0);
        let guards: Vec<_> = (0..LANE_SOFT_BOUND)
            .map(|_| PendingGuard::acquire(&counter).expect("under bound"))
            .collect();

        assert!(PendingGuard::acquire(&counter).is_none(), "65th must bypass");
        drop(guards);
        assert!(PendingGuard::acquire(&counter).is_some(), "freed after drain");
    }

    #[test]
    fn lanes_are_per_channel() {
        let lanes = ChannelLanes::new();
        let a = lanes.lane("ch-a");
        let a2 = lanes.lane("ch-a");
        let b = lanes.lane("ch-b");
        assert!(Arc::ptr_eq(&a, &a2));
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn break_view_pins_scte35_start() {
        let state = crate::breaks::state::AdBreakState::new(
            "ch1",
            BreakSource::Scte35,
            1_772_000_012_000,
            12.0,
            Some("2026-03-01T12:00:12+00:00".to_string()),
        );
        let view = BreakView::from_state(&state);
        assert_eq!(view.start_ms, Some(1_772_000_012_000));

        let manual = crate::breaks::state::AdBreakState::new(
            "ch1",
            BreakSource::Manual,
            1_772_000_012_000,
            15.0,
            None,
        );
        let view = BreakView::from_state(&manual);
        assert_eq!(view.start_ms, None, "manual break anchors to manifest PDT");
    }
}
