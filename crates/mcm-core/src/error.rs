//! 统一错误域。
//!
//! 所有跨 crate 传播的错误最终收敛为 [`McmError`]：稳定错误码 + 故障
//! 分类 + 可选根因。控制循环只依据 [`FailureClass`] 做状态迁移决策，
//! 错误码负责日志与告警的精确定位。

use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt;

/// 本项目统一的 `Result` 别名。
pub type McmResult<T> = Result<T, McmError>;

/// 故障分类。
///
/// # 契约说明（What）
/// - `Transient`：协调服务暂时不可达，已在客户端内重试仍失败；连续出现
///   视为会话丢失。
/// - `SessionLost`：集群成员资格事件，节点须放弃角色并重新入会。
/// - `CasConflict`：CAS 写入因并发修改失败，调用方以新读数重试即可。
/// - `Subprocess`：外部工具（数据库引擎、备份工具、路由器）非零退出。
/// - `InvalidRecord`：协调服务返回的文档缺少必填键，记录被整体跳过。
/// - `Fatal`：无法继续推进，进程应以非零码退出。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureClass {
    Transient,
    SessionLost,
    CasConflict,
    Subprocess,
    InvalidRecord,
    Fatal,
}

impl FailureClass {
    /// 该类故障是否适合由调用方原地重试。
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureClass::Transient | FailureClass::CasConflict)
    }
}

/// 跨层共享的稳定错误类型。
///
/// # 教案式注释
/// - **意图 (Why)**：重试逻辑收敛在协调客户端内部，业务层只看到带分类
///   的最终结果；异常控制流被显式 `Result` 取代。
/// - **契约 (What)**：`code` 恒为 `'static` 字符串，取值见 [`codes`]；
///   `class` 驱动状态机决策；`cause` 保留底层根因供日志输出。
/// - **权衡 (Trade-offs)**：`message` 采用 `Cow` 以便常量消息零分配，
///   动态上下文则付出一次堆分配换取可读性。
#[derive(Debug)]
pub struct McmError {
    code: &'static str,
    class: FailureClass,
    message: Cow<'static, str>,
    cause: Option<Box<dyn StdError + Send + Sync>>,
}

impl McmError {
    /// 构造错误；`code` 必须取自 [`codes`] 表。
    pub fn new(
        code: &'static str,
        class: FailureClass,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code,
            class,
            message: message.into(),
            cause: None,
        }
    }

    /// 附加底层根因，保留完整链路。
    pub fn with_cause(mut self, cause: impl StdError + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn class(&self) -> FailureClass {
        self.class
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause.as_deref().map(|c| c as &(dyn StdError + 'static))
    }
}

impl fmt::Display for McmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl StdError for McmError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause()
    }
}

/// 稳定错误码表，命名遵循 `<域>.<语义>`。
pub mod codes {
    /// 协调服务在重试预算内始终不可达。
    pub const COORD_UNREACHABLE: &str = "coord.unreachable";
    /// 当前无有效会话，或会话已被协调服务判定过期。
    pub const COORD_SESSION_LOST: &str = "coord.session_lost";
    /// CAS 写入与并发修改冲突。
    pub const COORD_CAS_CONFLICT: &str = "coord.cas_conflict";
    /// 读-改-写时本节点记录不存在，需要先重新注册。
    pub const REGISTRY_RECORD_MISSING: &str = "registry.record_missing";
    /// 注册表文档缺少必填键。
    pub const REGISTRY_INVALID_RECORD: &str = "registry.invalid_record";
    /// 服务器 ID 分配在有界重试后仍未成功。
    pub const CLUSTER_ID_EXHAUSTED: &str = "cluster.id_exhausted";
    /// 引擎或外部工具子进程失败。
    pub const ENGINE_SUBPROCESS: &str = "engine.subprocess";
    /// 管理 SQL 语句执行失败。
    pub const ENGINE_SQL: &str = "engine.sql";
    /// 引擎在预算时间内未就绪。
    pub const ENGINE_TIMEOUT: &str = "engine.timeout";
    /// 要求恢复时不存在有效快照。
    pub const SNAPSHOT_MISSING: &str = "snapshot.missing";
    /// 等待进行中的快照/恢复超时。
    pub const SNAPSHOT_PENDING: &str = "snapshot.pending";
    /// 快照目录操作失败。
    pub const SNAPSHOT_IO: &str = "snapshot.io";
    /// 备份工具调用失败。
    pub const SNAPSHOT_TOOL: &str = "snapshot.tool";
    /// 路由器管理口操作失败。
    pub const ROUTER_ADMIN: &str = "router.admin";
    /// 本机可路由地址发现失败。
    pub const NODE_ADDRESS_DISCOVERY: &str = "node.address_discovery";
    /// 节点进入退化态，等待重启。
    pub const NODE_DEGRADED: &str = "node.degraded";
    /// 必需的环境变量及其 `_FILE` 形式均缺失。
    pub const CONFIG_MISSING: &str = "config.missing";
    /// 配置取值非法。
    pub const CONFIG_INVALID: &str = "config.invalid";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_and_cause() {
        let io = std::io::Error::other("boom");
        let err = McmError::new(codes::SNAPSHOT_IO, FailureClass::Subprocess, "复制失败")
            .with_cause(io);
        let text = err.to_string();
        assert!(text.contains("snapshot.io"));
        assert!(text.contains("boom"));
        assert!(err.cause().is_some());
    }

    #[test]
    fn retryable_classes() {
        assert!(FailureClass::Transient.is_retryable());
        assert!(FailureClass::CasConflict.is_retryable());
        assert!(!FailureClass::SessionLost.is_retryable());
        assert!(!FailureClass::Fatal.is_retryable());
    }
}
