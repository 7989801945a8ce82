//! Wallet Service Balancer
//!
//! Webウォレットクライアントのセッションを複数の等価なバックエンド
//! サービスインスタンスへ固定的（スティッキー）に振り分ける

#![warn(missing_docs)]

/// CLIインターフェース
pub mod cli;

/// ヘルスチェック監視
pub mod health;

/// ロギング初期化ユーティリティ
pub mod logging;

/// モニター（オーケストレーション）
pub mod monitor;

/// サービスプール（稼働状態管理とラウンドロビン選択）
pub mod pool;

/// エンドポイントレジストリ（ウォレットとインスタンスの紐付け）
pub mod registry;
