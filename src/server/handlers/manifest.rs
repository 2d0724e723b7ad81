//! Viewer manifest pipeline.
//!
//! Per request: route parse → auth gate → segment passthrough bypass →
//! micro-cache → KV fast path → per-channel serializer → response shaping.
//! Every stage degrades toward "origin content with SCTE stripped" rather
//! than an error status; only auth and routing failures surface as non-200.

use crate::{
    breaks::{lane, BreakView, StitchMode},
    cache::MicroCache,
    channel::{ChannelConfig, ChannelMode, ChannelStatus},
    error::{AdEdgeError, Result},
    hls, metrics,
    server::{auth, handlers::segment, state::AppState},
};
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Whole-request deadline for the serializer path.
const REQUEST_DEADLINE: Duration = Duration::from_secs(10);

/// `GET /{org}/{channel}/{variant}`
pub async fn serve_manifest(
    Path((org, channel, variant)): Path<(String, String, String)>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Response> {
    handle(state, Some(org), channel, variant, params, headers).await
}

/// Legacy `GET /manifest?channel=&variant=` (org optional).
pub async fn serve_manifest_legacy(
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Response> {
    let channel = params
        .get("channel")
        .cloned()
        .ok_or_else(|| AdEdgeError::BadRequest("missing channel parameter".to_string()))?;
    let variant = params
        .get("variant")
        .cloned()
        .ok_or_else(|| AdEdgeError::BadRequest("missing variant parameter".to_string()))?;
    let org = params.get("org").cloned();
    handle(state, org, channel, variant, params, headers).await
}

async fn handle(
    state: AppState,
    org: Option<String>,
    channel_slug: String,
    variant: String,
    params: HashMap<String, String>,
    headers: HeaderMap,
) -> Result<Response> {
    let start = Instant::now();

    // Auth gate: 403, no fallback
    let auth_ctx = auth::authenticate(&headers, &state.config)?;

    let channel = match &org {
        Some(org) => state.channels.lookup(org, &channel_slug),
        None => state.channels.lookup_slug(&channel_slug),
    }
    .ok_or_else(|| AdEdgeError::ChannelUnknown(format!("{:?}/{}", org, channel_slug)))?;

    if channel.status == ChannelStatus::Inactive {
        return Err(AdEdgeError::ChannelInactive(channel.id.clone()));
    }

    // Segment passthrough: hot path, never touches the serializer
    if !variant.ends_with(".m3u8") {
        return segment::passthrough(&state, &channel, &variant).await;
    }

    let now_ms = Utc::now().timestamp_millis();
    let cache_key = MicroCache::key(
        &channel.id,
        &variant,
        now_ms,
        state.config.window_bucket_secs,
        &auth_ctx.viewer_bucket,
    );

    if let Some(cached) = state.micro_cache.get(&cache_key) {
        metrics::record_micro_cache_hit();
        metrics::record_request("manifest", 200);
        metrics::record_duration("manifest", start);
        return Ok(shape(&state, &channel, cached));
    }

    let mode = resolve_mode(&params, channel.mode, &headers);

    // KV fast path: an active projection lets us serve without the serializer
    let manifest = if let Some(record) = state.kv.get_active(&channel.id, now_ms).await {
        metrics::record_kv_fast_path_hit();
        debug!("KV fast path hit for {} ({})", channel.id, record.event_id);
        match serve_from_projection(&state, &channel, &record, mode, &variant).await {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("KV fast path failed for {}: {}, using serializer", channel.id, e);
                serve_via_lane(&state, &channel, &variant, mode, now_ms).await
            }
        }
    } else {
        serve_via_lane(&state, &channel, &variant, mode, now_ms).await
    };

    maybe_detect_bitrates(&state, &channel, &manifest);
    state.micro_cache.insert(&cache_key, manifest.clone());

    metrics::record_request("manifest", 200);
    metrics::record_duration("manifest", start);
    Ok(shape(&state, &channel, manifest))
}

/// Serializer path with the request deadline and overload bypass.
async fn serve_via_lane(
    state: &AppState,
    channel: &Arc<ChannelConfig>,
    variant: &str,
    mode: StitchMode,
    now_ms: i64,
) -> String {
    let deps = state.lane_deps();
    let served = tokio::time::timeout(
        REQUEST_DEADLINE,
        lane::serve(&state.lanes, &deps, channel, variant, mode, now_ms),
    )
    .await;

    match served {
        Ok(Ok(manifest)) => manifest,
        Ok(Err(AdEdgeError::LaneOverloaded(_))) | Err(_) => {
            // Overload or deadline: last-resort best effort from the origin
            origin_fallback(state, channel, variant).await
        }
        Ok(Err(e)) => {
            warn!("Serializer failed for {}: {}", channel.id, e);
            origin_fallback(state, channel, variant).await
        }
    }
}

/// Raw origin with SCTE stripped; synthetic slate when even that fails.
async fn origin_fallback(state: &AppState, channel: &ChannelConfig, variant: &str) -> String {
    let deps = state.lane_deps();
    let url = channel.variant_url(variant);
    match lane::fetch_origin(&deps, &url).await {
        Ok(body) => match hls::parse_media_playlist(&body) {
            Ok(mut playlist) => {
                hls::strip_origin_scte35(&mut playlist);
                hls::serialize_media_playlist(playlist)
                    .unwrap_or_else(|_| hls::synthetic_slate_manifest(channel.slate_url.as_deref()))
            }
            Err(_) => body,
        },
        Err(_) => hls::synthetic_slate_manifest(channel.slate_url.as_deref()),
    }
}

/// Renders a manifest from the KV projection without entering the lane.
async fn serve_from_projection(
    state: &AppState,
    channel: &Arc<ChannelConfig>,
    record: &crate::breaks::AdBreakRecord,
    mode: StitchMode,
    variant: &str,
) -> Result<String> {
    let deps = state.lane_deps();
    let url = channel.variant_url(variant);
    let body = match lane::fetch_origin(&deps, &url).await {
        Ok(body) => body,
        Err(e) => {
            warn!("Origin fetch failed on fast path for {}: {}", channel.id, e);
            return Ok(hls::synthetic_slate_manifest(channel.slate_url.as_deref()));
        }
    };

    let playlist = match hls::parse_playlist(&body)? {
        m3u8_rs::Playlist::MediaPlaylist(media) => media,
        m3u8_rs::Playlist::MasterPlaylist(_) => return Ok(body),
    };

    let view = BreakView::from_record(record);
    match lane::render_with_break(&deps, channel, &playlist, &view, mode, variant).await? {
        Some(rendered) => Ok(rendered.manifest),
        None => {
            let mut out = playlist;
            hls::strip_origin_scte35(&mut out);
            hls::serialize_media_playlist(out)
        }
    }
}

/// Mode priority: explicit query (`?mode=`, legacy `?force=`) > channel
/// config (non-auto) > User-Agent feature detection.
fn resolve_mode(
    params: &HashMap<String, String>,
    channel_mode: ChannelMode,
    headers: &HeaderMap,
) -> StitchMode {
    if let Some(requested) = params.get("mode").or_else(|| params.get("force")) {
        match requested.as_str() {
            "sgai" => return StitchMode::Sgai,
            "ssai" => return StitchMode::Ssai,
            _ => {}
        }
    }

    match channel_mode {
        ChannelMode::Ssai => StitchMode::Ssai,
        ChannelMode::Sgai => StitchMode::Sgai,
        ChannelMode::Auto => {
            let ua = headers
                .get(header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if is_interstitial_capable(ua) {
                StitchMode::Sgai
            } else {
                StitchMode::Ssai
            }
        }
    }
}

/// Apple players handle HLS interstitials natively.
fn is_interstitial_capable(user_agent: &str) -> bool {
    user_agent.contains("AppleCoreMedia")
        || user_agent.contains("tvOS")
        || user_agent.contains("AVPlayer")
        || (user_agent.contains("Safari") && !user_agent.contains("Chrome"))
}

/// Persist the bitrate ladder discovered from a master manifest; async, never
/// blocks the response.
fn maybe_detect_bitrates(state: &AppState, channel: &Arc<ChannelConfig>, manifest: &str) {
    if channel.mode != ChannelMode::Auto || !manifest.contains("#EXT-X-STREAM-INF") {
        return;
    }
    let channels = state.channels.clone();
    let channel_id = channel.id.clone();
    let body = manifest.to_string();
    tokio::spawn(async move {
        if let Ok(m3u8_rs::Playlist::MasterPlaylist(master)) =
            m3u8_rs::parse_playlist_res(body.as_bytes())
        {
            let kbps = hls::extract_bitrates(&master);
            if !kbps.is_empty() {
                channels.set_detected_bitrates(&channel_id, kbps);
            }
        }
    });
}

fn shape(state: &AppState, channel: &ChannelConfig, manifest: String) -> Response {
    let max_age = channel
        .manifest_cache_max_age
        .unwrap_or(state.config.manifest_cache_max_age);
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/vnd.apple.mpegurl".to_string()),
            (header::CACHE_CONTROL, format!("private, max-age={}", max_age)),
        ],
        manifest,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with_ua(ua: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, ua.parse().unwrap());
        headers
    }

    #[test]
    fn query_mode_wins_over_everything() {
        let mut params = HashMap::new();
        params.insert("mode".to_string(), "sgai".to_string());
        let mode = resolve_mode(&params, ChannelMode::Ssai, &headers_with_ua("curl/8"));
        assert_eq!(mode, StitchMode::Sgai);
    }

    #[test]
    fn legacy_force_param_is_honored() {
        let mut params = HashMap::new();
        params.insert("force".to_string(), "ssai".to_string());
        let mode = resolve_mode(
            &params,
            ChannelMode::Auto,
            &headers_with_ua("AppleCoreMedia/1.0"),
        );
        assert_eq!(mode, StitchMode::Ssai);
    }

    #[test]
    fn channel_mode_beats_ua() {
        let mode = resolve_mode(
            &HashMap::new(),
            ChannelMode::Ssai,
            &headers_with_ua("AppleCoreMedia/1.0"),
        );
        assert_eq!(mode, StitchMode::Ssai);
    }

    #[test]
    fn auto_mode_sniffs_apple_players() {
        for ua in [
            "AppleCoreMedia/1.0.0.16G102 (Apple TV; U; CPU OS 12_4 like Mac OS X)",
            "MyApp AVPlayer tvOS/17.2",
            "Mozilla/5.0 (Macintosh) AppleWebKit/605.1.15 Version/17.0 Safari/605.1.15",
        ] {
            assert_eq!(
                resolve_mode(&HashMap::new(), ChannelMode::Auto, &headers_with_ua(ua)),
                StitchMode::Sgai,
                "{}",
                ua
            );
        }

        for ua in [
            "Mozilla/5.0 (Windows NT 10.0) Chrome/120.0 Safari/537.36",
            "hls.js/1.5.0",
            "curl/8.4.0",
        ] {
            assert_eq!(
                resolve_mode(&HashMap::new(), ChannelMode::Auto, &headers_with_ua(ua)),
                StitchMode::Ssai,
                "{}",
                ua
            );
        }
    }
}
