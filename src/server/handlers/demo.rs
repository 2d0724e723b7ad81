//! Synthetic demo origin.
//!
//! Serves a rolling live window with aligned PDTs and an optional SCTE-35
//! DATERANGE so the full pipeline can be exercised without a real encoder.
//! Segment boundaries snap to wall-clock multiples of the segment duration,
//! so every rendition (and every request within a window) sees identical
//! timing — the same property a real packager provides.

use axum::{
    extract::{Path, Query},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

const SEGMENT_SECS: i64 = 6;
const WINDOW_SEGMENTS: i64 = 6;

pub async fn serve_demo_master() -> impl IntoResponse {
    let body = "#EXTM3U\n#EXT-X-VERSION:3\n\
        #EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360\n800.m3u8\n\
        #EXT-X-STREAM-INF:BANDWIDTH=2000000,RESOLUTION=1280x720\n2000.m3u8\n";
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")],
        body,
    )
}

/// `GET /demo/{variant}?cue=e1&dur=12&at=2`
///
/// Emits a live window of six 6s segments. With `cue` set, a SCTE-35
/// DATERANGE (attribute form) is attached to the segment at index `at`
/// (default 2), advertising a break of `dur` seconds (default 12).
pub async fn serve_demo_variant(
    Path(variant): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !variant.ends_with(".m3u8") {
        // Demo segments are empty bodies with the right content type
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "video/MP2T")],
            Vec::<u8>::new(),
        )
            .into_response();
    }

    let cue = params.get("cue");
    let cue_duration: f64 = params.get("dur").and_then(|d| d.parse().ok()).unwrap_or(12.0);
    let cue_at: i64 = params.get("at").and_then(|a| a.parse().ok()).unwrap_or(2);

    let now_ms = Utc::now().timestamp_millis();
    // Snap the window to segment boundaries so PDTs agree across renditions
    let edge = now_ms / (SEGMENT_SECS * 1000) * (SEGMENT_SECS * 1000);
    let first_seq = edge / (SEGMENT_SECS * 1000) - WINDOW_SEGMENTS;

    let mut body = format!(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:{}\n#EXT-X-MEDIA-SEQUENCE:{}\n",
        SEGMENT_SECS, first_seq
    );

    for i in 0..WINDOW_SEGMENTS {
        let seq = first_seq + i;
        let pdt_ms = edge - (WINDOW_SEGMENTS - i) * SEGMENT_SECS * 1000;
        let pdt = DateTime::from_timestamp_millis(pdt_ms)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default();

        body.push_str(&format!("#EXT-X-PROGRAM-DATE-TIME:{}\n", pdt));
        if let Some(cue_id) = cue {
            if i == cue_at {
                body.push_str(&format!(
                    "#EXT-X-DATERANGE:ID=\"{}\",CLASS=\"scte35:oatcls\",START-DATE=\"{}\",DURATION={}\n",
                    cue_id, pdt, cue_duration
                ));
            }
        }
        body.push_str(&format!("#EXTINF:{}.0,\nseg{}.ts\n", SEGMENT_SECS, seq));
    }

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/vnd.apple.mpegurl"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        body,
    )
        .into_response()
}
