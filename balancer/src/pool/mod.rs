//! サービスプール
//!
//! 一つのサービスファミリーに属する固定インスタンス集合の
//! 稼働状態管理とラウンドロビン選択

use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use wallet_balancer_common::error::{BalancerError, BalancerResult};
use wallet_balancer_common::types::{ServiceHealth, ServiceInstance};

/// プールのライフサイクル通知受信側
///
/// `ServicePool::take_events`で一度だけ取り出し、単一のコンシューマが
/// 消費する。通知はベストエフォートの診断情報であり、稼働状態そのものは
/// `instances`/`alive_count`でいつでも参照できる。
#[derive(Debug)]
pub struct PoolEvents {
    /// Alive→Droppedに遷移したインスタンスのindex
    pub dropped: mpsc::Receiver<usize>,
    /// Dropped→Aliveに遷移したインスタンスのindex
    pub restarted: mpsc::Receiver<usize>,
}

/// プールの診断スナップショット
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    /// インスタンス総数
    pub total: usize,
    /// Aliveなインスタンス数
    pub alive: usize,
    /// キュー溢れで破棄された通知数
    pub notifications_lost: u64,
}

/// サービスプール
///
/// インスタンステーブルは構築時に静的設定から生成され、以後増減しない。
/// 稼働状態の遷移はエッジトリガーで、同一indexに対するDroppedは
/// 間にRestartedを挟まずに連続しない。
#[derive(Clone, Debug)]
pub struct ServicePool {
    /// サービスファミリー名（ログ用）
    name: String,
    /// インスタンステーブル（indexで整列）
    instances: Arc<RwLock<Vec<ServiceInstance>>>,
    /// ラウンドロビン用カーソル
    cursor: Arc<AtomicUsize>,
    dropped_tx: mpsc::Sender<usize>,
    restarted_tx: mpsc::Sender<usize>,
    events: Arc<Mutex<Option<PoolEvents>>>,
    /// キュー溢れで破棄した通知数
    overflow: Arc<AtomicU64>,
}

impl ServicePool {
    /// 静的なアドレスリストからプールを構築する
    ///
    /// リストが空、またはアドレスが重複している場合は
    /// `BalancerError::Config`で失敗する。全インスタンスはAliveで開始し、
    /// 実際の稼働状態はヘルスチェッカーが追従して補正する。
    pub fn new(
        name: impl Into<String>,
        addresses: &[String],
        notification_buffer: usize,
    ) -> BalancerResult<Self> {
        let name = name.into();

        if addresses.is_empty() {
            return Err(BalancerError::Config(format!(
                "service pool {name}: instance list is empty"
            )));
        }

        let mut seen = HashSet::new();
        for address in addresses {
            if !seen.insert(address.as_str()) {
                return Err(BalancerError::Config(format!(
                    "service pool {name}: duplicate instance address {address}"
                )));
            }
        }

        let instances = addresses
            .iter()
            .enumerate()
            .map(|(index, address)| ServiceInstance::new(index, address.clone()))
            .collect();

        let (dropped_tx, dropped_rx) = mpsc::channel(notification_buffer.max(1));
        let (restarted_tx, restarted_rx) = mpsc::channel(notification_buffer.max(1));

        Ok(Self {
            name,
            instances: Arc::new(RwLock::new(instances)),
            cursor: Arc::new(AtomicUsize::new(0)),
            dropped_tx,
            restarted_tx,
            events: Arc::new(Mutex::new(Some(PoolEvents {
                dropped: dropped_rx,
                restarted: restarted_rx,
            }))),
            overflow: Arc::new(AtomicU64::new(0)),
        })
    }

    /// サービスファミリー名を取得
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 通知受信側を取り出す（一度だけ取得できる）
    pub fn take_events(&self) -> Option<PoolEvents> {
        self.events
            .lock()
            .expect("pool events mutex poisoned")
            .take()
    }

    /// Aliveなインスタンスをラウンドロビンで1つ選択する
    ///
    /// 選択はキャパシティを予約しない。Aliveなインスタンスが
    /// 存在しない場合は`BalancerError::NoServiceAvailable`。
    pub async fn select_next(&self) -> BalancerResult<(usize, String)> {
        let instances = self.instances.read().await;
        let alive: Vec<&ServiceInstance> = instances
            .iter()
            .filter(|instance| instance.health.is_alive())
            .collect();

        if alive.is_empty() {
            return Err(BalancerError::NoServiceAvailable);
        }

        let slot = self.cursor.fetch_add(1, Ordering::SeqCst) % alive.len();
        let chosen = alive[slot];
        Ok((chosen.index, chosen.address.clone()))
    }

    /// インスタンスをDroppedに遷移させる
    ///
    /// Alive→Droppedの遷移が起きた場合のみtrueを返し、`dropped`
    /// ストリームへ通知する。既にDroppedの場合は何もしない。
    pub async fn mark_dropped(&self, index: usize) -> bool {
        let mut instances = self.instances.write().await;
        match instances.get_mut(index) {
            Some(instance) if instance.health.is_alive() => {
                instance.health = ServiceHealth::Dropped;
                // 同一インスタンスの通知順序を保つため、ロックを保持したまま送信する
                self.notify(&self.dropped_tx, index, "dropped");
                true
            }
            Some(_) => false,
            None => {
                warn!(
                    pool = %self.name,
                    index,
                    "health transition for unknown instance index"
                );
                false
            }
        }
    }

    /// インスタンスをAliveに戻す
    ///
    /// Dropped→Aliveの遷移が起きた場合のみtrueを返し、`restarted`
    /// ストリームへ通知する。
    pub async fn mark_restarted(&self, index: usize) -> bool {
        let mut instances = self.instances.write().await;
        match instances.get_mut(index) {
            Some(instance) if !instance.health.is_alive() => {
                instance.health = ServiceHealth::Alive;
                self.notify(&self.restarted_tx, index, "restarted");
                true
            }
            Some(_) => false,
            None => {
                warn!(
                    pool = %self.name,
                    index,
                    "health transition for unknown instance index"
                );
                false
            }
        }
    }

    /// ベストエフォート通知。キューが満杯なら破棄してカウントする
    fn notify(&self, tx: &mpsc::Sender<usize>, index: usize, kind: &'static str) {
        match tx.try_send(index) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.overflow.fetch_add(1, Ordering::Relaxed);
                warn!(pool = %self.name, index, kind, "notification queue full, dropping");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(pool = %self.name, index, kind, "notification consumer gone");
            }
        }
    }

    /// インスタンステーブルのスナップショットを取得
    pub async fn instances(&self) -> Vec<ServiceInstance> {
        self.instances.read().await.clone()
    }

    /// 指定indexのインスタンスを取得
    pub async fn instance(&self, index: usize) -> Option<ServiceInstance> {
        self.instances.read().await.get(index).cloned()
    }

    /// インスタンス総数
    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    /// プールが空かどうか（構築検証により通常はfalse）
    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }

    /// Aliveなインスタンス数
    pub async fn alive_count(&self) -> usize {
        self.instances
            .read()
            .await
            .iter()
            .filter(|instance| instance.health.is_alive())
            .count()
    }

    /// 診断スナップショットを取得
    pub async fn status(&self) -> PoolStatus {
        let instances = self.instances.read().await;
        PoolStatus {
            total: instances.len(),
            alive: instances
                .iter()
                .filter(|instance| instance.health.is_alive())
                .count(),
            notifications_lost: self.overflow.load(Ordering::Relaxed),
        }
    }
}
