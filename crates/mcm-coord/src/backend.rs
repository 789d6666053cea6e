//! 协调服务后端的原始操作缝合面。
//!
//! 本层不做重试、不做序列化语义解释：值是字节，索引是数字。重试与
//! 文档结构属于上层（[`crate::client`] 与各领域对象）。

use std::time::Duration;

use async_trait::async_trait;
use mcm_core::McmResult;

/// 会话标识。协调服务生成的不透明字符串。
pub type SessionId = String;

/// 一条 KV 读出结果。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvEntry {
    pub value: Vec<u8>,
    /// 最近一次修改的索引，CAS 写入的比较基准。
    pub modify_index: u64,
    /// 当前绑定（持有）该键的会话。
    pub session: Option<SessionId>,
}

/// KV 写入模式。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PutMode {
    /// 无条件覆盖。
    Plain,
    /// 仅当修改索引与给定值一致时写入；`Cas(0)` 表示仅当键不存在时创建。
    Cas(u64),
    /// 会话绑定写入：键随会话过期被删除；已被其他存活会话持有时失败。
    Acquire(SessionId),
}

/// 会话创建参数。行为固定为 delete，锁延迟固定为零。
#[derive(Clone, Debug)]
pub struct SessionSpec {
    pub name: String,
    pub ttl: Duration,
}

/// 服务目录注册参数。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub id: String,
    pub port: u16,
    pub tags: Vec<String>,
}

/// 原始协调操作。所有方法单次执行、失败即报，重试由调用方决定。
#[async_trait]
pub trait CoordBackend: Send + Sync {
    async fn kv_get(&self, key: &str) -> McmResult<Option<KvEntry>>;

    /// 返回写入是否生效；CAS 与 Acquire 的失败以 `Ok(false)` 表达，
    /// 网络/服务故障才是 `Err`。
    async fn kv_put(&self, key: &str, value: Vec<u8>, mode: PutMode) -> McmResult<bool>;

    async fn kv_delete(&self, key: &str) -> McmResult<()>;

    /// 前缀扫描，按键名升序返回。
    async fn kv_list(&self, prefix: &str) -> McmResult<Vec<(String, KvEntry)>>;

    async fn session_create(&self, spec: &SessionSpec) -> McmResult<SessionId>;

    async fn session_renew(&self, id: &str) -> McmResult<()>;

    async fn session_destroy(&self, id: &str) -> McmResult<()>;

    async fn service_register(&self, spec: &ServiceSpec) -> McmResult<()>;

    async fn service_deregister(&self, id: &str) -> McmResult<()>;

    /// 协调服务当前是否可达（健康探测，不计入重试预算）。
    async fn reachable(&self) -> bool;
}
