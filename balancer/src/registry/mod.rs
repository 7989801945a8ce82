//! エンドポイントレジストリ
//!
//! ウォレットIDとサービスインスタンスの紐付けをメモリ内で管理する。
//! 紐付けはプロセス再起動をまたいで永続化されない。

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;
use wallet_balancer_common::error::{BalancerError, BalancerResult};

/// alive/logoutシグナルチャネルの容量
///
/// シグナルは「届いていること」だけに意味があるため、
/// 未処理の1件に後続を合流させて構わない。
const SIGNAL_BUFFER: usize = 1;

/// エンドポイント除去の理由（ログ用）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemovalReason {
    IdleTimeout,
    Logout,
}

/// ウォレットとサービスインスタンスの紐付け
///
/// `wallet_id`ごとに常に高々1つ存在する。`service_index`/`service_address`は
/// 生成後に変化せず、付け替えは除去と再生成で行う。
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// 紐付け世代の識別子
    ///
    /// 同一ウォレットの後続世代とライフサイクルトラッカーを
    /// 区別するために使う。
    pub id: Uuid,
    /// ウォレットID
    pub wallet_id: String,
    /// バインド先インスタンスのindex
    pub service_index: usize,
    /// バインド先インスタンスのアドレス
    pub service_address: String,
    /// 最終利用時刻（resolveのたびに更新）
    pub last_used: DateTime<Utc>,
    alive_tx: mpsc::Sender<()>,
    logout_tx: mpsc::Sender<()>,
}

/// エンドポイントレジストリ
///
/// get/add_or_getの2段階で解決される前提のため、同一ウォレットへの
/// 同時ファーストタッチでは挿入が先に成功した側が勝ち、負けた側の
/// 選択結果は破棄される（`add_or_get`参照）。
#[derive(Clone, Debug)]
pub struct EndpointRegistry {
    bindings: Arc<RwLock<HashMap<String, Endpoint>>>,
    /// aliveシグナルが途絶えたエンドポイントを除去するまでの時間
    idle_timeout: Duration,
}

impl EndpointRegistry {
    /// 新しいレジストリを作成
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            bindings: Arc::new(RwLock::new(HashMap::new())),
            idle_timeout,
        }
    }

    /// 紐付けを取得し、ヒット時は`last_used`を更新する
    pub async fn get(&self, wallet_id: &str) -> Option<Endpoint> {
        let mut bindings = self.bindings.write().await;
        let endpoint = bindings.get_mut(wallet_id)?;
        endpoint.last_used = Utc::now();
        Some(endpoint.clone())
    }

    /// 紐付けが無ければ作成し、あれば既存をそのまま返す
    ///
    /// 解決はレジスト外で「get失敗 → プール選択 → add_or_get」と
    /// 分かれて進むため、同じウォレットの別スレッドがこの間に先に
    /// 挿入していることがある。その場合は既存の紐付けが唯一の正であり、
    /// 今回選択された`(service_index, service_address)`は破棄される。
    /// 選択はキャパシティを予約しないので破棄による漏れはない。
    pub async fn add_or_get(
        &self,
        wallet_id: &str,
        service_index: usize,
        service_address: String,
    ) -> Endpoint {
        let mut bindings = self.bindings.write().await;

        if let Some(existing) = bindings.get(wallet_id) {
            debug!(
                wallet_id,
                bound_index = existing.service_index,
                discarded_index = service_index,
                "insert race lost, keeping existing binding"
            );
            return existing.clone();
        }

        let (alive_tx, alive_rx) = mpsc::channel(SIGNAL_BUFFER);
        let (logout_tx, logout_rx) = mpsc::channel(SIGNAL_BUFFER);

        let endpoint = Endpoint {
            id: Uuid::new_v4(),
            wallet_id: wallet_id.to_string(),
            service_index,
            service_address,
            last_used: Utc::now(),
            alive_tx,
            logout_tx,
        };

        bindings.insert(wallet_id.to_string(), endpoint.clone());
        self.spawn_tracker(
            endpoint.wallet_id.clone(),
            endpoint.id,
            endpoint.service_index,
            alive_rx,
            logout_rx,
        );

        endpoint
    }

    /// エンドポイントごとのライフサイクルトラッカーを起動する
    ///
    /// aliveシグナルでアイドル期限を再設定し、logoutまたは期限切れで
    /// 紐付けを除去する。トラッカーはEndpointの送信側を保持しないため、
    /// 紐付けが除去されチャネルが閉じれば自然に終了する。
    fn spawn_tracker(
        &self,
        wallet_id: String,
        endpoint_id: Uuid,
        service_index: usize,
        mut alive_rx: mpsc::Receiver<()>,
        mut logout_rx: mpsc::Receiver<()>,
    ) {
        let bindings = Arc::clone(&self.bindings);
        let idle_timeout = self.idle_timeout;

        tokio::spawn(async move {
            let idle = tokio::time::sleep(idle_timeout);
            tokio::pin!(idle);

            let reason = loop {
                // 期限切れと同時に届いたaliveを取りこぼさないよう、
                // シグナルをタイマーより先に評価する
                tokio::select! {
                    biased;

                    signal = alive_rx.recv() => match signal {
                        Some(()) => {
                            idle.as_mut()
                                .reset(tokio::time::Instant::now() + idle_timeout);
                        }
                        // 紐付けが既に除去された（無効化または置き換え）
                        None => return,
                    },
                    signal = logout_rx.recv() => match signal {
                        Some(()) => break RemovalReason::Logout,
                        None => return,
                    },
                    _ = &mut idle => break RemovalReason::IdleTimeout,
                }
            };

            let mut bindings = bindings.write().await;
            // 同一ウォレットの後続世代を誤って除去しないようidを確認する
            let is_current = bindings
                .get(&wallet_id)
                .map(|endpoint| endpoint.id == endpoint_id)
                .unwrap_or(false);
            if !is_current {
                return;
            }
            bindings.remove(&wallet_id);

            match reason {
                RemovalReason::IdleTimeout => info!(
                    wallet_id = %wallet_id,
                    service_index,
                    "endpoint expired without alive signal"
                ),
                RemovalReason::Logout => info!(
                    wallet_id = %wallet_id,
                    service_index,
                    "endpoint removed on logout"
                ),
            }
        });
    }

    /// 指定インスタンスに紐付く全エンドポイントを除去する
    ///
    /// プールがインスタンスのDroppedを報告したときに呼ばれる。
    /// 除去されたウォレットは次のresolveで再び未登録として扱われ、
    /// その時点でAliveなインスタンスへ付け替わる。
    /// 戻り値は(除去エンドポイント数, 影響ウォレット数)。紐付けは
    /// ウォレットIDで一意なので両者は常に一致するが、境界契約として
    /// 双方を返す。
    pub async fn invalidate_by_service(&self, service_index: usize) -> (usize, usize) {
        let mut bindings = self.bindings.write().await;

        let affected: Vec<String> = bindings
            .values()
            .filter(|endpoint| endpoint.service_index == service_index)
            .map(|endpoint| endpoint.wallet_id.clone())
            .collect();

        for wallet_id in &affected {
            bindings.remove(wallet_id);
            debug!(wallet_id = %wallet_id, service_index, "binding invalidated");
        }

        (affected.len(), affected.len())
    }

    /// ウォレットの生存シグナルを受け付け、アイドル期限を再設定する
    ///
    /// 紐付けが存在しない場合は`BalancerError::UnknownWallet`。
    /// 紐付けを副作用で作ることはない。
    pub async fn report_alive(&self, wallet_id: &str) -> BalancerResult<()> {
        let bindings = self.bindings.read().await;
        let endpoint = bindings
            .get(wallet_id)
            .ok_or_else(|| BalancerError::UnknownWallet(wallet_id.to_string()))?;

        match endpoint.alive_tx.try_send(()) {
            // 満杯なら未処理のシグナルが既に期限を再設定するので合流できる
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(())) => {
                // トラッカー終了と除去の間の狭い窓。除去は確定している
                debug!(wallet_id, "alive signal after tracker shutdown");
                Ok(())
            }
        }
    }

    /// ウォレットのログアウトを受け付け、紐付けの除去を起動する
    ///
    /// 実際の除去はライフサイクルトラッカーが行う（アイドル期限切れと
    /// 同じ経路に合流する）。紐付けが存在しない場合は
    /// `BalancerError::UnknownWallet`。
    pub async fn report_logout(&self, wallet_id: &str) -> BalancerResult<()> {
        let bindings = self.bindings.read().await;
        let endpoint = bindings
            .get(wallet_id)
            .ok_or_else(|| BalancerError::UnknownWallet(wallet_id.to_string()))?;

        match endpoint.logout_tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(())) => {
                debug!(wallet_id, "logout signal after tracker shutdown");
                Ok(())
            }
        }
    }

    /// 現在の紐付け数
    pub async fn count(&self) -> usize {
        self.bindings.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDLE: Duration = Duration::from_secs(300);

    /// spawn済みトラッカーに処理機会を与える
    async fn drain() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_add_or_get_creates_then_returns_existing() {
        let registry = EndpointRegistry::new(IDLE);

        let first = registry
            .add_or_get("walletA", 0, "10.0.0.1:9000".to_string())
            .await;
        assert_eq!(first.service_index, 0);

        // 2回目は別の選択結果を持ち込んでも既存が勝つ
        let second = registry
            .add_or_get("walletA", 1, "10.0.0.2:9000".to_string())
            .await;
        assert_eq!(second.id, first.id);
        assert_eq!(second.service_index, 0);
        assert_eq!(second.service_address, "10.0.0.1:9000");
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_add_or_get_yields_single_binding() {
        let registry = EndpointRegistry::new(IDLE);

        let mut handles = Vec::new();
        for index in 0..16usize {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .add_or_get("walletA", index, format!("10.0.0.{}:9000", index + 1))
                    .await
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().id);
        }

        // 全員が同じ世代を観測し、紐付けは1つだけ
        assert!(ids.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_get_miss_returns_none() {
        let registry = EndpointRegistry::new(IDLE);
        assert!(registry.get("walletA").await.is_none());
    }

    #[tokio::test]
    async fn test_get_refreshes_last_used() {
        let registry = EndpointRegistry::new(IDLE);
        let created = registry
            .add_or_get("walletA", 0, "10.0.0.1:9000".to_string())
            .await;

        let fetched = registry.get("walletA").await.unwrap();
        assert_eq!(fetched.id, created.id);
        assert!(fetched.last_used >= created.last_used);
    }

    #[tokio::test]
    async fn test_invalidate_by_service_counts() {
        let registry = EndpointRegistry::new(IDLE);
        registry
            .add_or_get("walletA", 0, "10.0.0.1:9000".to_string())
            .await;
        registry
            .add_or_get("walletB", 1, "10.0.0.2:9000".to_string())
            .await;
        registry
            .add_or_get("walletC", 0, "10.0.0.1:9000".to_string())
            .await;

        let (endpoints, wallets) = registry.invalidate_by_service(0).await;
        assert_eq!((endpoints, wallets), (2, 2));
        assert!(registry.get("walletA").await.is_none());
        assert!(registry.get("walletB").await.is_some());
        assert!(registry.get("walletC").await.is_none());

        // 対象なしの無効化は空振り
        let (endpoints, wallets) = registry.invalidate_by_service(7).await;
        assert_eq!((endpoints, wallets), (0, 0));
    }

    #[tokio::test]
    async fn test_report_alive_unknown_wallet() {
        let registry = EndpointRegistry::new(IDLE);

        let err = registry.report_alive("nonexistent").await.unwrap_err();
        assert!(matches!(err, BalancerError::UnknownWallet(_)));
        // 副作用で紐付けが作られていない
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_report_logout_unknown_wallet() {
        let registry = EndpointRegistry::new(IDLE);

        let err = registry.report_logout("nonexistent").await.unwrap_err();
        assert!(matches!(err, BalancerError::UnknownWallet(_)));
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_logout_removes_binding() {
        let registry = EndpointRegistry::new(IDLE);
        registry
            .add_or_get("walletA", 0, "10.0.0.1:9000".to_string())
            .await;

        registry.report_logout("walletA").await.unwrap();
        drain().await;

        assert!(registry.get("walletA").await.is_none());
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_removes_binding() {
        let registry = EndpointRegistry::new(IDLE);
        registry
            .add_or_get("walletA", 0, "10.0.0.1:9000".to_string())
            .await;

        tokio::time::advance(IDLE + Duration::from_secs(1)).await;
        drain().await;

        assert!(registry.get("walletA").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_alive_resets_idle_deadline() {
        let registry = EndpointRegistry::new(IDLE);
        registry
            .add_or_get("walletA", 0, "10.0.0.1:9000".to_string())
            .await;

        // 期限間際のaliveで窓が開き直す
        tokio::time::advance(Duration::from_secs(250)).await;
        registry.report_alive("walletA").await.unwrap();
        drain().await;

        // 元の期限(300s)を越えても生存している
        tokio::time::advance(Duration::from_secs(250)).await;
        drain().await;
        assert!(registry.get("walletA").await.is_some());

        // 再設定後の期限を越えると除去される
        tokio::time::advance(Duration::from_secs(100)).await;
        drain().await;
        assert!(registry.get("walletA").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_tracker_cannot_remove_successor() {
        let registry = EndpointRegistry::new(IDLE);
        let first = registry
            .add_or_get("walletA", 0, "10.0.0.1:9000".to_string())
            .await;

        registry.report_logout("walletA").await.unwrap();
        drain().await;

        // ログアウト直後の再解決は初回バインドと同じ扱い
        let second = registry
            .add_or_get("walletA", 1, "10.0.0.2:9000".to_string())
            .await;
        assert_ne!(second.id, first.id);

        // 旧世代のトラッカーが残っていても新しい紐付けは生きている
        drain().await;
        let current = registry.get("walletA").await.unwrap();
        assert_eq!(current.id, second.id);
        assert_eq!(current.service_index, 1);
    }
}
