//! エラー型定義
//!
//! バランサー全体で共有するエラー分類

use thiserror::Error;

/// バランサーのエラー型
///
/// 内部でのリトライは行わず、すべて呼び出し側へそのまま返す。
#[derive(Debug, Error)]
pub enum BalancerError {
    /// 静的設定が不正（起動時のみ発生し、回復しない）
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Aliveなサービスインスタンスが存在しない（一時的、再解決は呼び出し側の判断）
    #[error("no service instance available")]
    NoServiceAvailable,

    /// 未登録のウォレットIDに対する通知（通常はWebウォレット側の実装不備を示す）
    #[error("wallet {0}: no endpoint bound")]
    UnknownWallet(String),
}

/// バランサー共通のResult型
pub type BalancerResult<T> = Result<T, BalancerError>;
