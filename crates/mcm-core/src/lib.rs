//! # mcm-core
//!
//! ## 定位与职责（Why）
//! - 作为 MySQL 集群管理器各执行层 crate 的公共契约层，集中定义错误域、
//!   配置面、集群记录与重试策略，避免各层各自发明不兼容的基础类型。
//! - 本 crate 不做任何 I/O：协调服务访问、子进程管理与文件系统操作分别
//!   下沉到 `mcm-coord`、`mcm-engine`、`mcm-snapshot` 等实现层。
//!
//! ## 架构嵌入（Where）
//! - `error` 模块承载稳定错误码与故障分类，是控制循环做状态迁移决策的
//!   唯一依据；实现层的细粒度 `thiserror` 枚举最终都折叠到这里。
//! - `config` 模块负责环境变量与 `_FILE` 机密文件的统一读取，并组装
//!   成类型化的 [`Settings`](config::Settings)。
//! - `record` 模块定义协调服务键空间中的结构化文档（节点记录、主节点
//!   记录、服务器 ID 计数器）及键名布局。
//! - `retry` 模块以纯数据描述有界固定退避计划，执行动作由调用方完成。
//!
//! ## 设计取舍（Trade-offs）
//! - 记录文档使用 `serde` 显式可选字段：字段缺失与 false/0 可区分，
//!   缺少必填键的文档在解码阶段即被拒绝，绝不部分解析。

pub mod config;
pub mod error;
pub mod record;
pub mod retry;

pub use error::{FailureClass, McmError, McmResult, codes};
pub use record::{FieldPatch, LeaderRecord, NodeRecord, ServerIdCounter};
pub use retry::RetryPolicy;
