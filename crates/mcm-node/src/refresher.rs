//! 会话刷新工作者。
//!
//! 独立的后台任务：每 5 秒续约一次会话，保证注册表记录与主节点锁的
//! 有效性。续约失败先以 5 秒间隔重试约 35 秒；仍失败则认定会话已失，
//! 丢弃旧会话 ID、创建新会话、重新发布节点记录，并向控制循环递送一次
//! session-lost 事件。本工作者从不阻塞控制循环。

use std::sync::Arc;
use std::time::Duration;

use mcm_coord::{CoordClient, NodeRegistry};
use mcm_core::FailureClass;
use mcm_core::record::session_name;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 续约周期 R；R ≤ TTL/2。
pub const REFRESH_PERIOD: Duration = Duration::from_secs(5);
/// 会话 TTL。
pub const SESSION_TTL: Duration = Duration::from_secs(15);
/// 续约失败后的额外坚持：7 次 × 5 秒 ≈ 35 秒。
const RENEW_ATTEMPTS: u32 = 7;

pub fn spawn_refresher(
    client: Arc<CoordClient>,
    registry: Arc<NodeRegistry>,
    mut shutdown: watch::Receiver<bool>,
    lost_tx: mpsc::Sender<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(REFRESH_PERIOD) => {}
            }
            if *shutdown.borrow() {
                info!("session refresher stopping");
                return;
            }

            // 控制循环尚未建立会话时没有可续约的对象。
            let Some(session) = client.session_opt() else {
                continue;
            };

            if renew_with_budget(&client, &session, &shutdown).await {
                continue;
            }
            if *shutdown.borrow() {
                return;
            }

            warn!("session renewal budget exhausted, treating the session as lost");
            client.clear_session();

            let name = session_name(client.namespace());
            match client.session_create(&name, SESSION_TTL).await {
                Ok(new_session) => {
                    info!(session = %new_session, "session recreated, republishing node record");
                    if let Err(err) = registry.republish().await {
                        warn!(%err, "republish after session recreation failed");
                    }
                }
                Err(err) => {
                    warn!(%err, "session recreation failed, control loop will re-enter");
                }
            }
            // 无论重建成败都通知控制循环重新评估角色。
            let _ = lost_tx.try_send(());
        }
    })
}

/// 在 ≈35 秒预算内反复尝试续约；会话被服务端判死时立即放弃。
async fn renew_with_budget(
    client: &CoordClient,
    session: &str,
    shutdown: &watch::Receiver<bool>,
) -> bool {
    for attempt in 1..=RENEW_ATTEMPTS {
        match client.session_renew(session).await {
            Ok(()) => {
                debug!(session, "session renewed");
                return true;
            }
            Err(err) if err.class() == FailureClass::SessionLost => {
                warn!(session, %err, "session expired on the coordination service");
                return false;
            }
            Err(err) => {
                warn!(session, attempt, %err, "session renewal failed, retrying");
            }
        }
        if *shutdown.borrow() {
            return false;
        }
        if attempt < RENEW_ATTEMPTS {
            tokio::time::sleep(REFRESH_PERIOD).await;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcm_coord::{CoordBackend, MemoryCoord};
    use mcm_core::RetryPolicy;

    fn client(backend: &Arc<MemoryCoord>) -> Arc<CoordClient> {
        let short = RetryPolicy::new(2, Duration::from_millis(5));
        Arc::new(CoordClient::with_policies(
            Arc::clone(backend) as Arc<dyn CoordBackend>,
            "mcm/",
            short,
            short,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn expired_session_is_recreated_and_the_loop_is_notified() {
        let backend = Arc::new(MemoryCoord::new());
        let client = client(&backend);
        let first = client
            .session_create("mcm/instances", SESSION_TTL)
            .await
            .unwrap();
        let registry = Arc::new(NodeRegistry::new(Arc::clone(&client), "10.0.0.7"));
        registry.register().await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (lost_tx, mut lost_rx) = mpsc::channel(4);
        let handle = spawn_refresher(
            Arc::clone(&client),
            Arc::clone(&registry),
            shutdown_rx,
            lost_tx,
        );

        // 服务端判死旧会话：续约应立即失败并触发重建。
        backend.expire_session(&first);

        lost_rx.recv().await.expect("应收到 session-lost 事件");
        let renewed = client.session_opt().expect("应已建立新会话");
        assert_ne!(renewed, first);
        assert!(backend.session_alive(&renewed));
        // 节点记录随新会话重新发布。
        assert!(registry.get_own().await.unwrap().is_some());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_sessions_are_just_renewed() {
        let backend = Arc::new(MemoryCoord::new());
        let client = client(&backend);
        let session = client
            .session_create("mcm/instances", SESSION_TTL)
            .await
            .unwrap();
        let registry = Arc::new(NodeRegistry::new(Arc::clone(&client), "10.0.0.7"));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (lost_tx, mut lost_rx) = mpsc::channel(4);
        let handle = spawn_refresher(
            Arc::clone(&client),
            Arc::clone(&registry),
            shutdown_rx,
            lost_tx,
        );

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(lost_rx.try_recv().is_err(), "健康会话不应触发丢失事件");
        assert_eq!(client.session_opt().as_deref(), Some(session.as_str()));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
