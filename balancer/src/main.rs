//! Wallet Service Balancer Entry Point

use clap::Parser;
use tracing::info;
use wallet_balancer::cli::Cli;
use wallet_balancer::logging;
use wallet_balancer::monitor::Monitor;
use wallet_balancer_common::config::BalancerConfig;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    logging::init().expect("failed to initialize logging");

    info!("Wallet Service Balancer v{}", env!("CARGO_PKG_VERSION"));

    let config = BalancerConfig::load(&cli.config).expect("failed to load configuration");

    let monitor = Monitor::new(&config).expect("failed to construct monitor");
    monitor.start(Some(Box::new(|| {
        // ブリッジのトランスポートは外部コラボレーター。ここでは起動合図のみ
        info!("message bridge listener start signaled");
    })));

    info!(
        wallet_services = config.wallet_services.len(),
        sbbs_services = config.sbbs_services.len(),
        probe_interval_secs = config.probe_interval_secs,
        "balancer started"
    );

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for shutdown signal");
    info!("shutdown signal received, exiting");
}
