//! # mcm-node
//!
//! ## 定位与职责（Why）
//! - 节点守护进程本体：把协调层、引擎层、快照层与路由桥装配成一个
//!   单逻辑 actor 的控制循环，驱动
//!   `Boot → WaitCoord → SessionReady → Initializing → (Restoring) →
//!   Running(Leader|Follower)` 的状态机，外加 `Degraded` 与 `Stopping`。
//! - 后台协作者只有两个：会话刷新工作者与快照工作者，与控制循环仅
//!   通过 {shutdown 观察通道、session-lost 消息通道、快照任务句柄}
//!   交互，不共享其他可变状态。
//!
//! ## 关键不变量（What）
//! - 任意时刻至多一个节点 `am_leader() == true`；从节点恒为双旗标
//!   只读，主节点恒可写。
//! - 每个 tick 幂等：协调调用可能阻塞到其重试预算上限，重复执行
//!   必须安全。
//! - 会话丢失是成员资格事件：节点放弃角色判断回到 WaitCoord，引擎
//!   保持运行，重新入会后重新竞争领导权。

pub mod address;
pub mod agent;
pub mod context;
pub mod control;
pub mod refresher;

pub use context::AppContext;
pub use control::{ControlLoop, NodeState, Role};
