//! # mcm-router
//!
//! ## 定位与职责（Why）
//! - 让查询路由器的后端列表、写组（组 1，单后端 = 主节点）与读组
//!   （组 2，其余存活节点）跟随注册表；以及路由器启动时的一次性开通
//!   （监控账号、TLS 材料、读写分离规则、应用账号）。
//! - 差量驱动：读注册表、排序比较，未变化时零操作；提交走路由器的
//!   管理协议（删服务器、插服务器、载入运行时、落盘）。
//!
//! ## 契约要点（What）
//! - 查询规则与用户配置只在路由器启动时下发一次，控制循环不重复下发。
//! - 管理口是 SQL 方言的 TCP 端口，凭据为静态管理账号。

pub mod bridge;
pub mod error;
pub mod setup;

pub use bridge::{BackendSet, RouterBridge, RouterSettings};
pub use error::RouterError;
