//! CLIインターフェース
//!
//! サービスインスタンスの構成は設定ファイルと環境変数で行う。

use clap::Parser;
use std::path::PathBuf;

/// Wallet Service Balancer - Sticky session routing for wallet service instances
#[derive(Parser, Debug)]
#[command(name = "wallet-balancer")]
#[command(version, about, long_about = None)]
#[command(after_help = r#"ENVIRONMENT VARIABLES:
    WALLET_BALANCER_CONFIG       Config file path (default: wallet-balancer.json)
    WALLET_BALANCER_LOG_LEVEL    Log level (default: info)
    WALLET_BALANCER_*            Overrides for any config key, e.g.
                                 WALLET_BALANCER_PROBE_INTERVAL_SECS=10
"#)]
pub struct Cli {
    /// 設定ファイルのパス
    #[arg(
        short,
        long,
        env = "WALLET_BALANCER_CONFIG",
        default_value = "wallet-balancer.json"
    )]
    pub config: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_default_config_path() {
        let cli = Cli::parse_from(["wallet-balancer"]);
        assert_eq!(cli.config, PathBuf::from("wallet-balancer.json"));
    }

    #[test]
    fn test_cli_config_flag() {
        let cli = Cli::parse_from(["wallet-balancer", "--config", "/etc/balancer.json"]);
        assert_eq!(cli.config, PathBuf::from("/etc/balancer.json"));
    }
}
