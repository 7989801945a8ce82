//! モニター（オーケストレーション）
//!
//! サービスファミリーごとのプールと単一のエンドポイントレジストリを束ね、
//! トランスポート層が呼ぶresolve / report_alive / report_logoutを公開する。
//! ウォレットプールのDropped通知はレジストリの一括無効化へ転送される。

use crate::health::HealthChecker;
use crate::pool::{PoolEvents, PoolStatus, ServicePool};
use crate::registry::EndpointRegistry;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use wallet_balancer_common::config::BalancerConfig;
use wallet_balancer_common::error::BalancerResult;

/// メッセージブリッジリスナーの起動シグナル
///
/// ブリッジのトランスポートは外部コラボレーターであり、
/// モニターは起動の合図を一度だけ発行する。
pub type BridgeStarter = Box<dyn FnOnce() + Send>;

/// モニターの診断スナップショット
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    /// ウォレットプールの状態
    pub wallet: PoolStatus,
    /// SBBSプールの状態
    pub sbbs: PoolStatus,
    /// 現在の紐付け数
    pub bound_endpoints: usize,
}

/// モニター
///
/// プロセス全体で1つだけ構築し、参照を必要とする層へ渡す。
#[derive(Clone, Debug)]
pub struct Monitor {
    wallet_pool: ServicePool,
    sbbs_pool: ServicePool,
    registry: EndpointRegistry,
    config: BalancerConfig,
}

impl Monitor {
    /// 設定からプールとレジストリを構築する
    ///
    /// アドレスリストが不正な場合は`BalancerError::Config`で失敗する
    /// （起動時致命エラー）。
    pub fn new(config: &BalancerConfig) -> BalancerResult<Self> {
        let wallet_pool = ServicePool::new(
            "wallet",
            &config.wallet_services,
            config.notification_buffer,
        )?;
        let sbbs_pool =
            ServicePool::new("sbbs", &config.sbbs_services, config.notification_buffer)?;
        let registry =
            EndpointRegistry::new(Duration::from_secs(config.endpoint_idle_timeout_secs));

        Ok(Self {
            wallet_pool,
            sbbs_pool,
            registry,
            config: config.clone(),
        })
    }

    /// バックグラウンド処理を開始する
    ///
    /// プールごとの通知フォワーダとヘルスチェッカーを起動し、
    /// メッセージブリッジリスナーへ起動シグナルを送る。
    /// `probe_interval_secs`が0の場合、プローブは起動しない
    /// （稼働状態を外部から駆動する構成・テスト用）。
    pub fn start(&self, bridge_listener: Option<BridgeStarter>) {
        match self.wallet_pool.take_events() {
            Some(events) => self.spawn_wallet_forwarder(events),
            None => warn!("wallet pool events already taken, monitor started twice?"),
        }
        match self.sbbs_pool.take_events() {
            Some(events) => self.spawn_sbbs_forwarder(events),
            None => warn!("sbbs pool events already taken, monitor started twice?"),
        }

        if self.config.probe_interval_secs > 0 {
            for pool in [&self.wallet_pool, &self.sbbs_pool] {
                HealthChecker::new(pool.clone())
                    .with_interval(self.config.probe_interval_secs)
                    .with_timeout(self.config.probe_timeout_secs)
                    .with_failure_threshold(self.config.probe_failure_threshold)
                    .start();
            }
        } else {
            info!("health probing disabled by configuration");
        }

        if let Some(listener) = bridge_listener {
            info!("starting message bridge listener");
            listener();
        }
    }

    /// ウォレットプールの通知フォワーダ
    ///
    /// サービスとエンドポイントの接続点。Droppedは紐付けの
    /// 一括無効化に変換され、Restartedは記録のみ行う。
    fn spawn_wallet_forwarder(&self, mut events: PoolEvents) {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    index = events.dropped.recv() => match index {
                        Some(index) => {
                            let (endpoints, wallets) =
                                registry.invalidate_by_service(index).await;
                            info!(
                                service_index = index,
                                endpoints,
                                wallets,
                                "wallet service dropped, bindings invalidated"
                            );
                        }
                        None => break,
                    },
                    index = events.restarted.recv() => match index {
                        Some(index) => {
                            info!(service_index = index, "wallet service restarted");
                        }
                        None => break,
                    },
                }
            }
        });
    }

    /// SBBSプールの通知フォワーダ（記録のみ）
    fn spawn_sbbs_forwarder(&self, mut events: PoolEvents) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    index = events.dropped.recv() => match index {
                        Some(index) => info!(service_index = index, "sbbs service dropped"),
                        None => break,
                    },
                    index = events.restarted.recv() => match index {
                        Some(index) => info!(service_index = index, "sbbs service restarted"),
                        None => break,
                    },
                }
            }
        });
    }

    /// ウォレットの接続先アドレスを解決する
    ///
    /// 既存の紐付けがあればそのアドレスを返す。無ければウォレット
    /// プールからラウンドロビンで選択してadd_or_getに持ち込む。
    /// 選択と挿入は原子的ではないため、同時ファーストタッチでは
    /// 挿入が勝った側の紐付けが全員に返る。失敗時に紐付けが
    /// 作りかけで残ることはない。
    pub async fn resolve(&self, wallet_id: &str) -> BalancerResult<String> {
        if let Some(endpoint) = self.registry.get(wallet_id).await {
            debug!(
                wallet_id,
                service_index = endpoint.service_index,
                service_address = %endpoint.service_address,
                "existing endpoint"
            );
            return Ok(endpoint.service_address);
        }

        let (index, address) = match self.wallet_pool.select_next().await {
            Ok(selected) => selected,
            Err(err) => {
                error!(wallet_id, error = %err, "resolve failed");
                return Err(err);
            }
        };

        let endpoint = self.registry.add_or_get(wallet_id, index, address).await;
        info!(
            wallet_id,
            service_index = endpoint.service_index,
            service_address = %endpoint.service_address,
            "new endpoint"
        );
        Ok(endpoint.service_address)
    }

    /// ウォレットの生存シグナルを転送する
    pub async fn report_alive(&self, wallet_id: &str) -> BalancerResult<()> {
        match self.registry.report_alive(wallet_id).await {
            Ok(()) => Ok(()),
            Err(err) => {
                // 通常はWebウォレット側の実装不備を示す
                warn!(wallet_id, error = %err, "alive report on missing endpoint");
                Err(err)
            }
        }
    }

    /// ウォレットのログアウトを転送する
    pub async fn report_logout(&self, wallet_id: &str) -> BalancerResult<()> {
        match self.registry.report_logout(wallet_id).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(wallet_id, error = %err, "logout report on missing endpoint");
                Err(err)
            }
        }
    }

    /// 診断スナップショットを取得
    pub async fn status(&self) -> MonitorStatus {
        MonitorStatus {
            wallet: self.wallet_pool.status().await,
            sbbs: self.sbbs_pool.status().await,
            bound_endpoints: self.registry.count().await,
        }
    }

    /// ウォレットプールへの参照を取得
    pub fn wallet_pool(&self) -> &ServicePool {
        &self.wallet_pool
    }

    /// SBBSプールへの参照を取得
    pub fn sbbs_pool(&self) -> &ServicePool {
        &self.sbbs_pool
    }

    /// エンドポイントレジストリへの参照を取得
    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }
}
