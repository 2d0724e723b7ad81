use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Domain-specific error types for adedge.
///
/// Most failure modes never reach the client as an error status: the manifest
/// pipeline reduces them to content-preserving fallbacks (origin passthrough,
/// synthetic slate manifest). The variants here cover the cases that DO map
/// to an HTTP status, plus the internal kinds the pipeline matches on.
#[derive(Error, Debug)]
pub enum AdEdgeError {
    #[error("Failed to fetch from origin: {0}")]
    OriginFetch(#[from] reqwest::Error),

    #[error("Failed to parse HLS playlist: {0}")]
    PlaylistParse(String),

    #[error("Failed to rewrite playlist: {0}")]
    PlaylistRewrite(String),

    #[error("SCTE-35 parse error: {0}")]
    Scte35Parse(String),

    #[error("Decision service unavailable: {0}")]
    DecisionUnavailable(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Unknown channel: {0}")]
    ChannelUnknown(String),

    #[error("Channel inactive: {0}")]
    ChannelInactive(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Per-channel serializer queue depth exceeded the soft bound.
    /// The pipeline catches this and serves from the KV fast path or origin.
    #[error("Channel serializer overloaded: {0}")]
    LaneOverloaded(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AdEdgeError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AdEdgeError::AuthFailed(ref e) => {
                tracing::warn!("Auth failure: {}", e);
                (StatusCode::FORBIDDEN, self.to_string())
            }
            AdEdgeError::ChannelUnknown(ref e) => {
                tracing::warn!("Unknown channel: {}", e);
                (StatusCode::NOT_FOUND, self.to_string())
            }
            AdEdgeError::ChannelInactive(ref e) => {
                tracing::warn!("Inactive channel: {}", e);
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            AdEdgeError::BadRequest(ref e) => {
                tracing::warn!("Bad request: {}", e);
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            AdEdgeError::OriginFetch(ref e) => {
                // Reached only when a handler lets the error escape; the
                // manifest pipeline substitutes a slate manifest instead.
                tracing::error!("Origin fetch error: {:?}", e);
                (StatusCode::BAD_GATEWAY, self.to_string())
            }
            AdEdgeError::LaneOverloaded(ref e) => {
                tracing::warn!("Serializer overloaded: {}", e);
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            AdEdgeError::PlaylistParse(ref e)
            | AdEdgeError::PlaylistRewrite(ref e)
            | AdEdgeError::Scte35Parse(ref e)
            | AdEdgeError::DecisionUnavailable(ref e)
            | AdEdgeError::Config(ref e)
            | AdEdgeError::Internal(ref e) => {
                tracing::error!("Internal error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
        };

        (status, message).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AdEdgeError>;
