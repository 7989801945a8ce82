//! ヘルスチェッカーのプローブ挙動テスト
//!
//! wiremockでステータスエンドポイントを模擬し、連続失敗での
//! Dropped遷移と復帰時のRestarted遷移を検証する。

use wallet_balancer::health::HealthChecker;
use wallet_balancer::pool::ServicePool;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_status_ok(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_probe_keeps_healthy_instance_alive() {
    let server = MockServer::start().await;
    mount_status_ok(&server).await;

    let pool = ServicePool::new("wallet", &[server.address().to_string()], 16).unwrap();
    let mut events = pool.take_events().unwrap();
    let checker = HealthChecker::new(pool.clone())
        .with_timeout(1)
        .with_failure_threshold(2);

    for _ in 0..3 {
        checker.check_all().await;
    }

    assert_eq!(pool.alive_count().await, 1);
    assert!(events.dropped.try_recv().is_err());
    assert!(events.restarted.try_recv().is_err());
}

#[tokio::test]
async fn test_consecutive_failures_drop_then_recovery_restarts() {
    let server = MockServer::start().await;
    mount_status_ok(&server).await;

    let pool = ServicePool::new("wallet", &[server.address().to_string()], 16).unwrap();
    let mut events = pool.take_events().unwrap();
    let checker = HealthChecker::new(pool.clone())
        .with_timeout(1)
        .with_failure_threshold(2);

    checker.check_all().await;
    assert_eq!(pool.alive_count().await, 1);

    // マッチするモックを消す → プローブは404で失敗する
    server.reset().await;

    // 1回目の失敗ではまだ落とさない
    checker.check_all().await;
    assert_eq!(pool.alive_count().await, 1);

    // 連続2回目でDropped
    checker.check_all().await;
    assert_eq!(pool.alive_count().await, 0);
    assert_eq!(events.dropped.recv().await, Some(0));

    // 応答が戻れば成功1回でAliveに復帰する
    mount_status_ok(&server).await;
    checker.check_all().await;
    assert_eq!(pool.alive_count().await, 1);
    assert_eq!(events.restarted.recv().await, Some(0));
}

#[tokio::test]
async fn test_success_resets_failure_streak() {
    let server = MockServer::start().await;

    let pool = ServicePool::new("wallet", &[server.address().to_string()], 16).unwrap();
    let checker = HealthChecker::new(pool.clone())
        .with_timeout(1)
        .with_failure_threshold(2);

    // 失敗1回 → 成功 → 失敗1回。連続ではないのでAliveのまま
    checker.check_all().await;
    mount_status_ok(&server).await;
    checker.check_all().await;
    server.reset().await;
    checker.check_all().await;

    assert_eq!(pool.alive_count().await, 1);
}

#[tokio::test]
async fn test_unreachable_instance_drops_while_healthy_survives() {
    let server = MockServer::start().await;
    mount_status_ok(&server).await;

    // インスタンス1は接続先が存在しない
    let addresses = vec![server.address().to_string(), "127.0.0.1:9".to_string()];
    let pool = ServicePool::new("wallet", &addresses, 16).unwrap();
    let mut events = pool.take_events().unwrap();
    let checker = HealthChecker::new(pool.clone())
        .with_timeout(1)
        .with_failure_threshold(2);

    checker.check_all().await;
    checker.check_all().await;

    assert_eq!(events.dropped.recv().await, Some(1));
    let instances = pool.instances().await;
    assert!(instances[0].health.is_alive());
    assert!(!instances[1].health.is_alive());

    // 落ちた後の選択は健全なインスタンスだけに向かう
    for _ in 0..4 {
        let (index, _) = pool.select_next().await.unwrap();
        assert_eq!(index, 0);
    }
}
