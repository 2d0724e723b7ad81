use std::env;

/// JWT verification algorithm selection
#[derive(Clone, Debug, PartialEq)]
pub enum JwtAlgorithm {
    Hs256,
    Rs256,
}

/// KV ad-break store backend selection
#[derive(Clone, Debug, PartialEq)]
pub enum KvStoreType {
    Memory,
    Valkey,
}

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub base_url: String,
    pub is_dev: bool,
    /// Default origin variant base URL when a channel has none configured
    pub origin_variant_base: String,
    /// Default ad-pod base URL
    pub ad_pod_base: String,
    /// Host used when constructing signed ad-playlist URLs
    pub sign_host: String,
    /// Micro-cache window bucket size in seconds
    pub window_bucket_secs: u64,
    /// Decision collaborator base URL (POST {endpoint}/decision)
    pub decision_endpoint: String,
    /// On-demand decision RPC deadline in milliseconds
    pub decision_timeout_ms: u64,
    /// Default segment cache-control max-age in seconds
    pub segment_cache_max_age: u64,
    /// Default manifest cache-control max-age in seconds
    pub manifest_cache_max_age: u64,
    /// HS256 shared secret (when jwt_algorithm = Hs256)
    pub jwt_secret: Option<String>,
    /// RS256 public key PEM (when jwt_algorithm = Rs256)
    pub jwt_public_key: Option<String>,
    pub jwt_algorithm: JwtAlgorithm,
    /// Signing key for ad-playlist URLs
    pub segment_secret: Option<String>,
    /// Dev-only bypass of the auth gate
    pub dev_allow_no_auth: bool,
    /// Monitor loop poll cadence in milliseconds
    pub scte35_poll_interval_ms: u64,
    /// Channel ids armed with a monitor task at boot (comma-separated env)
    pub monitor_channels: Vec<String>,
    /// Slate source for fallback content when no ads are available
    pub slate_url: Option<String>,
    /// Beacon collaborator endpoint; tracker URLs are fired directly when unset
    pub beacon_endpoint: Option<String>,
    /// JSON file seeding the channel store; dev default channel when unset
    pub channels_file: Option<String>,
    /// Duration of schedule-triggered breaks in seconds
    pub time_based_break_duration_secs: f64,
    /// Manifest-window expiry for SCTE-35-sourced breaks in milliseconds
    pub break_window_expiry_ms: i64,
    pub kv_store: KvStoreType,
    pub valkey_url: Option<String>,
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables.
    /// In DEV mode, provides sensible defaults. In PROD mode, the service
    /// endpoints are required.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let is_dev = env::var("DEV_MODE")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .unwrap_or(false);

        let port = if is_dev {
            env_or("PORT", "3000").parse()?
        } else {
            env::var("PORT")
                .map_err(|_| "PORT is required in production")?
                .parse()?
        };

        let base_url = if is_dev {
            env_or("BASE_URL", "http://localhost:3000")
        } else {
            env::var("BASE_URL").map_err(|_| "BASE_URL is required in production")?
        };

        let origin_variant_base = if is_dev {
            env_or("ORIGIN_VARIANT_BASE", "http://localhost:3000/demo")
        } else {
            env::var("ORIGIN_VARIANT_BASE")
                .map_err(|_| "ORIGIN_VARIANT_BASE is required in production")?
        };

        let decision_endpoint = if is_dev {
            env_or("DECISION_ENDPOINT", "http://localhost:4000")
        } else {
            env::var("DECISION_ENDPOINT")
                .map_err(|_| "DECISION_ENDPOINT is required in production")?
        };

        let jwt_algorithm = match env_or("JWT_ALGORITHM", "HS256").to_uppercase().as_str() {
            "RS256" => JwtAlgorithm::Rs256,
            _ => JwtAlgorithm::Hs256,
        };

        // Dev mode without key material behaves as DEV_ALLOW_NO_AUTH=1;
        // production must configure one or the other explicitly
        let dev_allow_no_auth = env_or("DEV_ALLOW_NO_AUTH", "0") == "1";
        let has_key_material =
            env::var("JWT_SECRET").is_ok() || env::var("JWT_PUBLIC_KEY").is_ok();
        if !dev_allow_no_auth && !has_key_material && !is_dev {
            return Err("JWT_SECRET or JWT_PUBLIC_KEY is required unless DEV_ALLOW_NO_AUTH=1".into());
        }

        let monitor_channels = env::var("MONITOR_CHANNELS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let kv_store = match env_or("KV_STORE", "memory").to_lowercase().as_str() {
            "valkey" => KvStoreType::Valkey,
            _ => KvStoreType::Memory,
        };

        Ok(Config {
            port,
            base_url,
            is_dev,
            origin_variant_base,
            ad_pod_base: env_or("AD_POD_BASE", "http://localhost:3000/adpods"),
            sign_host: env_or("SIGN_HOST", "localhost:3000"),
            window_bucket_secs: env_parse("WINDOW_BUCKET_SECS", 2),
            decision_endpoint,
            decision_timeout_ms: env_parse("DECISION_TIMEOUT_MS", 2000),
            segment_cache_max_age: env_parse("SEGMENT_CACHE_MAX_AGE", 60),
            manifest_cache_max_age: env_parse("MANIFEST_CACHE_MAX_AGE", 4),
            jwt_secret: env::var("JWT_SECRET").ok(),
            jwt_public_key: env::var("JWT_PUBLIC_KEY").ok(),
            jwt_algorithm,
            segment_secret: env::var("SEGMENT_SECRET").ok(),
            dev_allow_no_auth,
            scte35_poll_interval_ms: env_parse("SCTE35_POLL_INTERVAL_MS", 5000),
            monitor_channels,
            slate_url: env::var("SLATE_URL").ok(),
            beacon_endpoint: env::var("BEACON_ENDPOINT").ok(),
            channels_file: env::var("CHANNELS_FILE").ok(),
            time_based_break_duration_secs: env_parse("TIME_BASED_BREAK_DURATION_SECS", 30.0),
            break_window_expiry_ms: env_parse("BREAK_WINDOW_EXPIRY_MS", 90_000),
            kv_store,
            valkey_url: env::var("VALKEY_URL").ok(),
        })
    }

    /// A permissive dev config for tests; no env access.
    pub fn for_tests() -> Self {
        Config {
            port: 0,
            base_url: "http://localhost".to_string(),
            is_dev: true,
            origin_variant_base: "http://localhost/demo".to_string(),
            ad_pod_base: "http://localhost/adpods".to_string(),
            sign_host: "localhost".to_string(),
            window_bucket_secs: 1,
            decision_endpoint: "http://localhost:4000".to_string(),
            decision_timeout_ms: 2000,
            segment_cache_max_age: 60,
            manifest_cache_max_age: 4,
            jwt_secret: None,
            jwt_public_key: None,
            jwt_algorithm: JwtAlgorithm::Hs256,
            segment_secret: None,
            dev_allow_no_auth: true,
            scte35_poll_interval_ms: 5000,
            monitor_channels: Vec::new(),
            slate_url: None,
            beacon_endpoint: None,
            channels_file: None,
            time_based_break_duration_secs: 30.0,
            break_window_expiry_ms: 90_000,
            kv_store: KvStoreType::Memory,
            valkey_url: None,
        }
    }
}
