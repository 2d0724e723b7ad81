//! Viewer auth gate.
//!
//! Verifies `Authorization: Bearer <jwt>` with HS256 or RS256 per config.
//! `DEV_ALLOW_NO_AUTH=1` (or dev mode without key material) bypasses the
//! gate entirely. The viewer bucket claim feeds the micro-cache key so
//! bucketed experiments never share cached manifests.

use crate::config::{Config, JwtAlgorithm};
use crate::error::{AdEdgeError, Result};
use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

/// Default viewer bucket when the token carries none.
const DEFAULT_VIEWER_BUCKET: &str = "A";

#[derive(Debug, Clone)]
pub struct AuthContext {
    pub subject: Option<String>,
    pub viewer_bucket: String,
}

impl AuthContext {
    fn anonymous() -> Self {
        Self {
            subject: None,
            viewer_bucket: DEFAULT_VIEWER_BUCKET.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    bucket: Option<String>,
}

/// Verifies the request's bearer token. 403 on any failure.
pub fn authenticate(headers: &HeaderMap, config: &Config) -> Result<AuthContext> {
    let has_key_material = config.jwt_secret.is_some() || config.jwt_public_key.is_some();
    if config.dev_allow_no_auth || (config.is_dev && !has_key_material) {
        return Ok(AuthContext::anonymous());
    }

    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| AdEdgeError::AuthFailed("missing bearer token".to_string()))?;

    let (key, algorithm) = match config.jwt_algorithm {
        JwtAlgorithm::Hs256 => {
            let secret = config
                .jwt_secret
                .as_ref()
                .ok_or_else(|| AdEdgeError::AuthFailed("JWT_SECRET not configured".to_string()))?;
            (DecodingKey::from_secret(secret.as_bytes()), Algorithm::HS256)
        }
        JwtAlgorithm::Rs256 => {
            let pem = config.jwt_public_key.as_ref().ok_or_else(|| {
                AdEdgeError::AuthFailed("JWT_PUBLIC_KEY not configured".to_string())
            })?;
            (
                DecodingKey::from_rsa_pem(pem.as_bytes())
                    .map_err(|e| AdEdgeError::AuthFailed(format!("bad public key: {}", e)))?,
                Algorithm::RS256,
            )
        }
    };

    let validation = Validation::new(algorithm);
    let data = decode::<Claims>(token, &key, &validation)
        .map_err(|e| AdEdgeError::AuthFailed(e.to_string()))?;

    Ok(AuthContext {
        subject: data.claims.sub,
        viewer_bucket: data
            .claims
            .bucket
            .unwrap_or_else(|| DEFAULT_VIEWER_BUCKET.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
        bucket: Option<String>,
        exp: u64,
    }

    fn config_with_secret(secret: &str) -> Config {
        let mut config = Config::for_tests();
        config.dev_allow_no_auth = false;
        config.is_dev = false;
        config.jwt_secret = Some(secret.to_string());
        config
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            format!("Bearer {}", token).parse().unwrap(),
        );
        headers
    }

    fn sign(secret: &str, bucket: Option<&str>) -> String {
        let claims = TestClaims {
            sub: "viewer-1".to_string(),
            bucket: bucket.map(|b| b.to_string()),
            exp: 4_102_444_800, // 2100-01-01
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn dev_bypass_yields_default_bucket() {
        let config = Config::for_tests();
        let ctx = authenticate(&HeaderMap::new(), &config).unwrap();
        assert_eq!(ctx.viewer_bucket, "A");
    }

    #[test]
    fn valid_token_passes_and_extracts_bucket() {
        let config = config_with_secret("s3cret");
        let headers = bearer(&sign("s3cret", Some("B")));

        let ctx = authenticate(&headers, &config).unwrap();
        assert_eq!(ctx.subject.as_deref(), Some("viewer-1"));
        assert_eq!(ctx.viewer_bucket, "B");
    }

    #[test]
    fn missing_bucket_defaults_to_a() {
        let config = config_with_secret("s3cret");
        let headers = bearer(&sign("s3cret", None));

        let ctx = authenticate(&headers, &config).unwrap();
        assert_eq!(ctx.viewer_bucket, "A");
    }

    #[test]
    fn missing_token_is_rejected() {
        let config = config_with_secret("s3cret");
        assert!(matches!(
            authenticate(&HeaderMap::new(), &config),
            Err(AdEdgeError::AuthFailed(_))
        ));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let config = config_with_secret("s3cret");
        let headers = bearer(&sign("other-secret", None));
        assert!(matches!(
            authenticate(&headers, &config),
            Err(AdEdgeError::AuthFailed(_))
        ));
    }
}
