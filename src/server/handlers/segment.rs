//! Segment passthrough — the hot path.
//!
//! Anything that is not a manifest streams straight from the origin with a
//! long immutable cache lifetime. The per-channel serializer is never
//! touched here.

use crate::{
    channel::ChannelConfig,
    error::Result,
    http_retry::{fetch_with_retry, RetryConfig},
    metrics,
    server::state::AppState,
};
use axum::{
    body::Body,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use std::time::Instant;
use tracing::debug;

fn content_type_for(segment_path: &str, origin_type: Option<&str>) -> String {
    if segment_path.ends_with(".ts") {
        "video/MP2T".to_string()
    } else if segment_path.ends_with(".m4s") || segment_path.ends_with(".mp4") {
        "video/mp4".to_string()
    } else {
        origin_type.unwrap_or("application/octet-stream").to_string()
    }
}

pub async fn passthrough(
    state: &AppState,
    channel: &ChannelConfig,
    segment_path: &str,
) -> Result<Response> {
    let start = Instant::now();
    let url = channel.variant_url(segment_path);
    debug!("Segment passthrough: {}", url);

    let response = match fetch_with_retry(&state.http_client, &url, &RetryConfig::default()).await {
        Ok(response) => response,
        Err(e) => {
            metrics::record_origin_error();
            metrics::record_request("segment", 502);
            metrics::record_duration("segment", start);
            return Err(crate::error::AdEdgeError::OriginFetch(e));
        }
    };

    let origin_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let content_type = content_type_for(segment_path, origin_type.as_deref());

    let max_age = channel
        .segment_cache_max_age
        .unwrap_or(state.config.segment_cache_max_age);
    let cache_control = format!("public, max-age={}, immutable", max_age);

    metrics::record_request("segment", 200);
    metrics::record_duration("segment", start);

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, cache_control),
        ],
        Body::from_stream(response.bytes_stream()),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_by_extension() {
        assert_eq!(content_type_for("seg1.ts", None), "video/MP2T");
        assert_eq!(content_type_for("seg1.m4s", Some("text/plain")), "video/mp4");
        assert_eq!(content_type_for("init.mp4", None), "video/mp4");
        assert_eq!(
            content_type_for("thing.bin", Some("video/MP2T")),
            "video/MP2T"
        );
        assert_eq!(content_type_for("thing.bin", None), "application/octet-stream");
    }
}
