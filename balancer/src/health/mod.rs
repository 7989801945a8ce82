//! ヘルスチェック監視
//!
//! プル型プローブでサービスインスタンスの稼働状況を監視する。
//! 一定間隔で各インスタンスのステータスエンドポイントへGETを送り、
//! 連続失敗でDropped、成功1回でAliveへ遷移させる。
//! 検出遅延はDropped側が「間隔×連続失敗閾値＋タイムアウト」、
//! Restarted側が「間隔＋タイムアウト」で上に抑えられる。

use crate::pool::ServicePool;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};
use wallet_balancer_common::types::ServiceInstance;

/// プローブのタイムアウト（秒）
const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 3;

/// 既定のプローブ間隔（秒）
const DEFAULT_PROBE_INTERVAL_SECS: u64 = 5;

/// Dropped判定までの連続失敗回数
const DEFAULT_FAILURE_THRESHOLD: u32 = 2;

/// サービスプールのヘルスチェッカー
///
/// 稼働状態の遷移はすべてプール経由で行い、通知の順序や
/// エッジトリガーの保証はプール側に委ねる。
#[derive(Clone)]
pub struct HealthChecker {
    /// 監視対象プール
    pool: ServicePool,
    /// HTTPクライアント
    client: Client,
    /// プローブ間隔（秒）
    interval_secs: u64,
    /// Dropped判定までの連続失敗回数
    failure_threshold: u32,
    /// インスタンスごとの連続失敗カウント
    failures: Arc<Mutex<HashMap<usize, u32>>>,
}

impl HealthChecker {
    /// 新しいヘルスチェッカーを作成
    pub fn new(pool: ServicePool) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            pool,
            client,
            interval_secs: DEFAULT_PROBE_INTERVAL_SECS,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            failures: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// プローブ間隔を設定
    pub fn with_interval(mut self, interval_secs: u64) -> Self {
        self.interval_secs = interval_secs;
        self
    }

    /// プローブのリクエストタイムアウトを設定
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .expect("Failed to create HTTP client");
        self
    }

    /// Dropped判定までの連続失敗回数を設定
    pub fn with_failure_threshold(mut self, failure_threshold: u32) -> Self {
        self.failure_threshold = failure_threshold.max(1);
        self
    }

    /// バックグラウンドで監視を開始
    pub fn start(self) {
        tokio::spawn(async move {
            self.monitor_loop().await;
        });
    }

    /// 監視ループ
    async fn monitor_loop(&self) {
        let mut timer = interval(Duration::from_secs(self.interval_secs.max(1)));

        info!(
            pool = %self.pool.name(),
            interval_secs = self.interval_secs,
            failure_threshold = self.failure_threshold,
            "health checker started"
        );

        loop {
            timer.tick().await;
            self.check_all().await;
        }
    }

    /// 全インスタンスをプローブする
    ///
    /// タイマーループから呼ばれるほか、テストから直接駆動できる。
    pub async fn check_all(&self) {
        let instances = self.pool.instances().await;
        for instance in instances {
            self.check_instance(&instance).await;
        }
    }

    /// 単一インスタンスをプローブし、必要なら稼働状態を遷移させる
    async fn check_instance(&self, instance: &ServiceInstance) {
        let url = format!("http://{}/status", instance.address);

        let healthy = match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                debug!(
                    pool = %self.pool.name(),
                    index = instance.index,
                    status = %response.status(),
                    "probe returned non-success status"
                );
                false
            }
            Err(e) => {
                debug!(
                    pool = %self.pool.name(),
                    index = instance.index,
                    error = %e,
                    "probe request failed"
                );
                false
            }
        };

        if healthy {
            self.clear_failures(instance.index);
            if self.pool.mark_restarted(instance.index).await {
                info!(
                    pool = %self.pool.name(),
                    index = instance.index,
                    address = %instance.address,
                    "service restarted"
                );
            }
        } else {
            let consecutive = self.record_failure(instance.index);
            if consecutive >= self.failure_threshold && self.pool.mark_dropped(instance.index).await
            {
                warn!(
                    pool = %self.pool.name(),
                    index = instance.index,
                    address = %instance.address,
                    consecutive,
                    "service dropped after consecutive probe failures"
                );
            }
        }
    }

    fn record_failure(&self, index: usize) -> u32 {
        let mut failures = self.failures.lock().expect("failure counter mutex poisoned");
        let count = failures.entry(index).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    fn clear_failures(&self, index: usize) {
        let mut failures = self.failures.lock().expect("failure counter mutex poisoned");
        failures.remove(&index);
    }
}
