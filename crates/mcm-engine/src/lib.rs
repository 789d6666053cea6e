//! # mcm-engine
//!
//! ## 定位与职责（Why）
//! - 监护本节点的 MySQL 引擎子进程：首次初始化（含运维账号创建）、
//!   集群配置片段生成、受监护启动/停止、复制角色切换与只读开关。
//! - 管理 SQL 一律经本机 UNIX socket 以特权账号执行；执行通道是
//!   官方客户端二进制的子进程调用，与备份工具、协调代理的管理方式
//!   保持同一idiom。
//!
//! ## 契约要点（What）
//! - 从节点恒为只读（`read_only` 与 `super_read_only` 双旗标），主节点
//!   恒可写；晋升先清复制配置再开写，降级先关写再配复制。
//! - 复制使用自动定位（GTID），首次连接时向源索取公钥。
//!
//! ## 权衡（Trade-offs）
//! - 子进程通道使启动顺序可观测、出错即非零退出码，代价是每条语句
//!   一次进程创建；管理面的调用频率（秒级 tick）下这不构成瓶颈。

pub mod accounts;
pub mod admin;
pub mod error;
pub mod replication;
pub mod server;

pub use admin::{SqlRunner, SqlTarget};
pub use error::EngineError;
pub use server::{Engine, EngineConfig, EngineProcess, run_checked};
