//! ロギング初期化ユーティリティ

use tracing_subscriber::EnvFilter;

/// ログレベルを指定する環境変数
const LOG_LEVEL_ENV: &str = "WALLET_BALANCER_LOG_LEVEL";

/// tracingサブスクライバを初期化する
///
/// レベルは`WALLET_BALANCER_LOG_LEVEL`で制御する（デフォルト: info）。
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter =
        EnvFilter::try_from_env(LOG_LEVEL_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(filter).try_init()?;

    Ok(())
}
