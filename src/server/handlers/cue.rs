//! Operator cue endpoint — out-of-band break control.

use crate::{
    beacon::BeaconMessage,
    error::{AdEdgeError, Result},
    metrics,
    server::{auth, state::AppState},
};
use axum::{
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct CueRequest {
    pub channel: String,
    #[serde(default)]
    pub org: Option<String>,
    #[serde(rename = "type")]
    pub cue_type: String,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub pod_id: Option<String>,
    #[serde(default)]
    pub pod_url: Option<String>,
}

/// `POST /cue` with `{channel, org?, type: "start"|"stop", duration?,
/// pod_id?, pod_url?}`.
pub async fn handle_cue(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CueRequest>,
) -> Result<Response> {
    auth::authenticate(&headers, &state.config)?;

    let channel = match &body.org {
        Some(org) => state.channels.lookup(org, &body.channel),
        None => state.channels.lookup_slug(&body.channel),
    }
    .ok_or_else(|| AdEdgeError::ChannelUnknown(body.channel.clone()))?;

    let lane = state.lanes.lane(&channel.id);
    let mut slot = lane.slot.lock().await;
    let now_ms = Utc::now().timestamp_millis();

    match body.cue_type.as_str() {
        "start" => {
            let duration = body.duration.unwrap_or(0.0);
            if duration <= 0.0 {
                return Err(AdEdgeError::BadRequest(
                    "cue start requires duration > 0".to_string(),
                ));
            }
            if body.pod_id.is_none() && body.pod_url.is_none() {
                return Err(AdEdgeError::BadRequest(
                    "cue start requires pod_id or pod_url".to_string(),
                ));
            }

            let state_ref =
                slot.start_manual(&channel.id, now_ms, duration, body.pod_id, body.pod_url);
            let snapshot = state_ref.clone();
            drop(slot);

            state.beacons.publish(BeaconMessage {
                event: "ad_start".to_string(),
                ad_id: None,
                pod_id: Some(snapshot.pod_id.clone()),
                channel: channel.id.clone(),
                ts: now_ms,
                tracker_urls: Vec::new(),
                metadata: Some(json!({"source": "api"})),
            });
            metrics::record_request("cue", 200);
            info!("Cue start on {}: {:.3}s", channel.id, snapshot.duration_sec);

            Ok(Json(json!({"ok": true, "state": snapshot})).into_response())
        }
        "stop" => {
            let cleared = slot.stop();
            drop(slot);
            state.kv.clear_active(&channel.id).await;
            metrics::record_request("cue", 200);
            info!(
                "Cue stop on {} (cleared: {})",
                channel.id,
                cleared.is_some()
            );

            Ok(Json(json!({"ok": true, "cleared": true})).into_response())
        }
        other => Err(AdEdgeError::BadRequest(format!(
            "unknown cue type '{}'",
            other
        ))),
    }
}
