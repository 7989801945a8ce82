//! 設定管理
//!
//! BalancerConfig等の設定構造体とファイル/環境変数からの読み込み

use crate::error::{BalancerError, BalancerResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// バランサー設定
///
/// サービスインスタンスのアドレスリストは静的で、起動後に増減しない。
/// リストの検証（空・重複）はプール構築時に行われる。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// ウォレットサービスのアドレスリスト（host:port、デフォルト: 空）
    #[serde(default)]
    pub wallet_services: Vec<String>,

    /// SBBSメッセージブリッジサービスのアドレスリスト（host:port、デフォルト: 空）
    #[serde(default)]
    pub sbbs_services: Vec<String>,

    /// ヘルスプローブ間隔（秒）(デフォルト: 5、0でプローブ無効)
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    /// ヘルスプローブのリクエストタイムアウト（秒）(デフォルト: 3)
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Dropped判定までの連続プローブ失敗回数 (デフォルト: 2)
    #[serde(default = "default_probe_failure_threshold")]
    pub probe_failure_threshold: u32,

    /// aliveシグナルが途絶えたエンドポイントを除去するまでの秒数 (デフォルト: 600)
    #[serde(default = "default_endpoint_idle_timeout")]
    pub endpoint_idle_timeout_secs: u64,

    /// Dropped/Restarted通知キューの容量 (デフォルト: 64)
    #[serde(default = "default_notification_buffer")]
    pub notification_buffer: usize,
}

fn default_probe_interval() -> u64 {
    5
}

fn default_probe_timeout() -> u64 {
    3
}

fn default_probe_failure_threshold() -> u32 {
    2
}

fn default_endpoint_idle_timeout() -> u64 {
    600
}

fn default_notification_buffer() -> usize {
    64
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            wallet_services: Vec::new(),
            sbbs_services: Vec::new(),
            probe_interval_secs: default_probe_interval(),
            probe_timeout_secs: default_probe_timeout(),
            probe_failure_threshold: default_probe_failure_threshold(),
            endpoint_idle_timeout_secs: default_endpoint_idle_timeout(),
            notification_buffer: default_notification_buffer(),
        }
    }
}

impl BalancerConfig {
    /// 設定ファイルと`WALLET_BALANCER_*`環境変数から設定を読み込む
    ///
    /// 環境変数がファイルの値を上書きする。読み込み失敗は起動時致命エラー。
    pub fn load(path: &Path) -> BalancerResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("WALLET_BALANCER").try_parsing(true))
            .build()
            .map_err(|e| BalancerError::Config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| BalancerError::Config(e.to_string()))
    }
}
