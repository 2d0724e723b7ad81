use crate::{
    beacon::BeaconSink,
    breaks::{AdBreakKv, ChannelLanes, LaneDeps},
    cache::{MicroCache, OriginCache},
    channel::ChannelStore,
    config::{Config, KvStoreType},
    decision::DecisionClient,
    monitor::{MonitorDeps, MonitorRegistry},
};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Shared HTTP client for connection pooling
    pub http_client: Client,
    pub channels: Arc<ChannelStore>,
    pub lanes: Arc<ChannelLanes>,
    pub kv: AdBreakKv,
    pub decision: DecisionClient,
    pub beacons: BeaconSink,
    pub origin_cache: OriginCache,
    pub micro_cache: MicroCache,
    pub monitors: Arc<MonitorRegistry>,
}

impl AppState {
    pub async fn new(config: Config) -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build()
            .expect("Failed to create HTTP client");

        let kv = match config.kv_store {
            KvStoreType::Memory => AdBreakKv::new_memory(),
            #[cfg(feature = "valkey")]
            KvStoreType::Valkey => {
                let url = config
                    .valkey_url
                    .as_deref()
                    .expect("VALKEY_URL is required when KV_STORE=valkey");
                AdBreakKv::new_valkey(url)
                    .await
                    .expect("Failed to connect to Valkey")
            }
            #[cfg(not(feature = "valkey"))]
            KvStoreType::Valkey => {
                panic!("KV_STORE=valkey requires the 'valkey' feature flag");
            }
        };

        let channels = Arc::new(ChannelStore::from_config(&config));
        let decision = DecisionClient::new(
            http_client.clone(),
            config.decision_endpoint.clone(),
            config.decision_timeout_ms,
        );
        let beacons = BeaconSink::new(http_client.clone(), config.beacon_endpoint.clone());

        let monitors = Arc::new(MonitorRegistry::new(MonitorDeps {
            http: http_client.clone(),
            kv: kv.clone(),
            decision: decision.clone(),
            channels: channels.clone(),
            poll_interval: Duration::from_millis(config.scte35_poll_interval_ms),
        }));

        Self {
            micro_cache: MicroCache::new(config.window_bucket_secs),
            origin_cache: OriginCache::new(),
            lanes: Arc::new(ChannelLanes::new()),
            config: Arc::new(config),
            http_client,
            channels,
            kv,
            decision,
            beacons,
            monitors,
        }
    }

    /// The lane/render dependency bundle.
    pub fn lane_deps(&self) -> LaneDeps {
        LaneDeps {
            http: self.http_client.clone(),
            origin_cache: self.origin_cache.clone(),
            kv: self.kv.clone(),
            decision: self.decision.clone(),
            beacons: self.beacons.clone(),
            break_window_expiry_ms: self.config.break_window_expiry_ms,
            time_based_break_duration_secs: self.config.time_based_break_duration_secs,
        }
    }
}
