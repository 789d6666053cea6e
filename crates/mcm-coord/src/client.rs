//! 带重试的协调客户端与会话持有。
//!
//! 每个节点进程持有恰好一个 [`CoordClient`]，其中保存当前会话。会话
//! 丢失与重建由刷新工作者驱动；客户端本身只提供原子的替换/清除入口。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use mcm_core::{FailureClass, McmError, McmResult, RetryPolicy, codes};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::backend::{CoordBackend, KvEntry, PutMode, ServiceSpec, SessionId, SessionSpec};

/// 路由目录中数据库服务的名称。
const SERVICE_NAME: &str = "mysql";

/// 重试客户端。
///
/// # 教案式注释
/// - **意图 (Why)**：把“有界固定退避、瞬时错误才重试”的策略集中在一处，
///   让注册表、主节点锁与分配器的代码只描述语义。
/// - **契约 (What)**：点查与会话操作走 [`RetryPolicy::fast`]（≈30 秒），
///   前缀扫描走 [`RetryPolicy::slow`]（≈3 分钟）；预算耗尽时返回
///   `Transient` 分类的最终错误，由控制循环折算成会话丢失。
/// - **权衡 (Trade-offs)**：重试期间调用方被挂起，因此控制循环的每个
///   tick 必须幂等，不得假设有界时延。
pub struct CoordClient {
    backend: Arc<dyn CoordBackend>,
    namespace: String,
    session: Mutex<Option<SessionId>>,
    fast: RetryPolicy,
    slow: RetryPolicy,
}

impl CoordClient {
    pub fn new(backend: Arc<dyn CoordBackend>, namespace: impl Into<String>) -> Self {
        Self::with_policies(backend, namespace, RetryPolicy::fast(), RetryPolicy::slow())
    }

    /// 测试用：注入更短的重试计划。
    pub fn with_policies(
        backend: Arc<dyn CoordBackend>,
        namespace: impl Into<String>,
        fast: RetryPolicy,
        slow: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
            session: Mutex::new(None),
            fast,
            slow,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// 当前会话；无会话时报 `coord.session_lost`。
    pub fn session(&self) -> McmResult<SessionId> {
        self.session.lock().clone().ok_or_else(|| {
            McmError::new(
                codes::COORD_SESSION_LOST,
                FailureClass::SessionLost,
                "no live coordination session",
            )
        })
    }

    pub fn session_opt(&self) -> Option<SessionId> {
        self.session.lock().clone()
    }

    /// 刷新工作者重建会话后调用。
    pub fn replace_session(&self, id: SessionId) {
        *self.session.lock() = Some(id);
    }

    pub fn clear_session(&self) {
        *self.session.lock() = None;
    }

    async fn retrying<T, F, Fut>(
        &self,
        policy: RetryPolicy,
        what: &'static str,
        mut op: F,
    ) -> McmResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = McmResult<T>>,
    {
        let mut last = None;
        for attempt in 1..=policy.attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.class() == FailureClass::Transient => {
                    warn!(
                        what,
                        attempt,
                        attempts = policy.attempts,
                        error = %err,
                        "coordination operation failed, backing off"
                    );
                    last = Some(err);
                    if attempt < policy.attempts {
                        tokio::time::sleep(policy.backoff).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Err(last.unwrap_or_else(|| {
            McmError::new(
                codes::COORD_UNREACHABLE,
                FailureClass::Transient,
                "retry budget exhausted",
            )
        }))
    }

    pub async fn get(&self, key: &str) -> McmResult<Option<KvEntry>> {
        self.retrying(self.fast, "kv get", || self.backend.kv_get(key))
            .await
    }

    /// CAS 写入；`expected_index == 0` 表示仅创建。
    pub async fn cas_put(&self, key: &str, value: Vec<u8>, expected_index: u64) -> McmResult<bool> {
        self.retrying(self.fast, "kv cas put", || {
            self.backend
                .kv_put(key, value.clone(), PutMode::Cas(expected_index))
        })
        .await
    }

    /// 以当前会话做绑定写入。
    pub async fn acquire_put(&self, key: &str, value: Vec<u8>) -> McmResult<bool> {
        let session = self.session()?;
        self.retrying(self.fast, "kv acquire put", || {
            self.backend
                .kv_put(key, value.clone(), PutMode::Acquire(session.clone()))
        })
        .await
    }

    pub async fn delete(&self, key: &str) -> McmResult<()> {
        self.retrying(self.fast, "kv delete", || self.backend.kv_delete(key))
            .await
    }

    pub async fn list(&self, prefix: &str) -> McmResult<Vec<(String, KvEntry)>> {
        self.retrying(self.slow, "kv list", || self.backend.kv_list(prefix))
            .await
    }

    /// 创建会话并立即持有。
    pub async fn session_create(&self, name: &str, ttl: Duration) -> McmResult<SessionId> {
        let spec = SessionSpec {
            name: name.to_string(),
            ttl,
        };
        let id = self
            .retrying(self.fast, "session create", || {
                self.backend.session_create(&spec)
            })
            .await?;
        debug!(session = %id, "coordination session established");
        self.replace_session(id.clone());
        Ok(id)
    }

    /// 续约指定会话（刷新工作者单次调用，不叠加客户端重试）。
    pub async fn session_renew(&self, id: &str) -> McmResult<()> {
        self.backend.session_renew(id).await
    }

    /// 销毁当前会话；随会话消失的还有它获取的全部键。
    pub async fn session_destroy_current(&self) -> McmResult<()> {
        let Some(id) = self.session_opt() else {
            return Ok(());
        };
        self.clear_session();
        self.retrying(self.fast, "session destroy", || {
            self.backend.session_destroy(&id)
        })
        .await
    }

    /// 等待协调服务可达，预算同慢路径。
    pub async fn wait_reachable(&self) -> McmResult<()> {
        for attempt in 1..=self.slow.attempts {
            if self.backend.reachable().await {
                return Ok(());
            }
            debug!(attempt, "coordination service not reachable yet");
            if attempt < self.slow.attempts {
                tokio::time::sleep(self.slow.backoff).await;
            }
        }
        Err(McmError::new(
            codes::COORD_UNREACHABLE,
            FailureClass::Transient,
            "coordination service unreachable past the retry budget",
        ))
    }

    /// 在服务目录中登记本节点的数据库服务（角色以标签表达）。
    ///
    /// 旧实例先注销再注册，角色切换时标签才不会叠加。
    pub async fn register_service(&self, address: &str, leader: bool, port: u16) -> McmResult<()> {
        let id = format!("{SERVICE_NAME}_{address}");
        let spec = ServiceSpec {
            name: SERVICE_NAME.to_string(),
            id: id.clone(),
            port,
            tags: vec![if leader { "leader" } else { "follower" }.to_string()],
        };
        self.retrying(self.fast, "service deregister", || {
            self.backend.service_deregister(&id)
        })
        .await?;
        self.retrying(self.fast, "service register", || {
            self.backend.service_register(&spec)
        })
        .await
    }

    pub async fn deregister_service(&self, address: &str) -> McmResult<()> {
        let id = format!("{SERVICE_NAME}_{address}");
        self.retrying(self.fast, "service deregister", || {
            self.backend.service_deregister(&id)
        })
        .await
    }
}
