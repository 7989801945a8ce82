//! 共通型定義
//!
//! ServiceInstance, ServiceHealth等のコアデータ型

use serde::{Deserialize, Serialize};

/// サービスインスタンスの稼働状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceHealth {
    /// 稼働中
    Alive,
    /// 停止検出済み
    Dropped,
}

impl ServiceHealth {
    /// 稼働中かどうか
    pub fn is_alive(&self) -> bool {
        matches!(self, ServiceHealth::Alive)
    }

    /// ログ出力用の文字列表現
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceHealth::Alive => "alive",
            ServiceHealth::Dropped => "dropped",
        }
    }
}

/// バックエンドサービスインスタンス
///
/// `index`はプール内で安定な順序識別子で、プールの生存中は再利用されない。
/// 再起動は同じ`index`がAliveに戻ることであり、新しいインスタンスにはならない。
/// `address`は割り当て後に変化しない。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceInstance {
    /// プール内の順序識別子
    pub index: usize,
    /// ネットワークアドレス（host:port）
    pub address: String,
    /// 稼働状態
    pub health: ServiceHealth,
}

impl ServiceInstance {
    /// Alive状態の新しいインスタンス記述子を作成
    pub fn new(index: usize, address: impl Into<String>) -> Self {
        Self {
            index,
            address: address.into(),
            health: ServiceHealth::Alive,
        }
    }
}
