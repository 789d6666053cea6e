//! # mcm-snapshot
//!
//! ## 定位与职责（Why）
//! - 管理本节点磁盘上的物理快照：`pending/`（进行中）与 `current/`
//!   （可恢复）两个众所周知的目录，以及对备份工具的三种调用
//!   （backup、prepare、copy-back）。
//! - 与协调层互锁：创建与恢复分别置位 `snapshotting`/`restoring`
//!   咨询旗标，恢复期间集群内不得开始新快照，反之亦然。旗标是咨询
//!   性的——互斥由每个节点开工前读注册表来维持，没有硬锁。
//!
//! ## 契约要点（What）
//! - 快照有效当且仅当 `current/` 存在且备份工具的三个标记文件齐全；
//!   缺任何一个都按不存在处理。
//! - `pending/` 只通过同文件系统内的原子改名晋升为 `current/`。
//! - 两个旗标在所有退出路径上都被清除，包括失败路径。
//!
//! ## 可见性假设（Trade-offs）
//! - 一个节点产出的 `current/` 经共享卷对其余节点可见；本层只提供
//!   `exists()` 谓词，不感知卷的挂载方式。

pub mod error;
pub mod store;

pub use error::SnapshotError;
pub use store::{SnapshotConfig, SnapshotStore};
