//! # mcm-coord
//!
//! ## 定位与职责（Why）
//! - 封装强一致协调服务（KV + 会话 + 会话绑定锁）的全部访问，向控制
//!   循环提供四个领域对象：重试客户端 [`CoordClient`]、节点注册表
//!   [`NodeRegistry`]、主节点锁 [`LeaderLock`] 与服务器 ID 分配器
//!   [`IdAllocator`]。
//! - 重试收敛在本层：业务逻辑看不到裸的网络错误，只看到带
//!   [`FailureClass`](mcm_core::FailureClass) 的最终结果。
//!
//! ## 契约要点（What）
//! - 会话行为恒为 delete：会话过期时其获取的全部键被协调服务移除，
//!   节点记录与主节点记录的生命周期由此推导。
//! - 锁延迟恒为零：主节点记录消失后任何节点可立即竞争。
//! - `am_leader` 以记录当前绑定的会话为准——“我最后写过它”不构成
//!   领导权证据。
//!
//! ## 实现分层（How）
//! - [`backend::CoordBackend`] 是无重试的原始操作缝合面；
//!   [`consul::ConsulCoord`] 走 HTTP API，[`memory::MemoryCoord`]
//!   是测试用的进程内实现（含手动会话过期钩子）。

pub mod allocator;
pub mod backend;
pub mod client;
pub mod consul;
pub mod leader;
pub mod memory;
pub mod registry;

pub use allocator::IdAllocator;
pub use backend::{CoordBackend, KvEntry, PutMode, ServiceSpec, SessionId, SessionSpec};
pub use client::CoordClient;
pub use consul::ConsulCoord;
pub use leader::LeaderLock;
pub use memory::MemoryCoord;
pub use registry::NodeRegistry;
