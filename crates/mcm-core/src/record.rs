//! 协调服务键空间中的结构化文档与键名布局。
//!
//! 三类文档：
//! - 节点记录：`<ns>instances/<addr>`，由持有会话的节点独占写入，
//!   会话过期时随会话删除。
//! - 主节点记录：`<ns>replication_leader`，由主节点会话持有。
//! - 服务器 ID 计数器：`<ns>server_id`，无属主，仅以 CAS 更新。

use serde::{Deserialize, Serialize};

/// 默认键空间前缀。
pub const DEFAULT_NAMESPACE: &str = "mcm/";

/// 节点记录所在前缀。
pub fn instances_prefix(namespace: &str) -> String {
    format!("{namespace}instances/")
}

/// 某个节点的记录键。
pub fn instance_key(namespace: &str, address: &str) -> String {
    format!("{namespace}instances/{address}")
}

/// 会话名（与节点记录共享前缀，便于在协调服务 UI 里归类）。
pub fn session_name(namespace: &str) -> String {
    format!("{namespace}instances")
}

/// 主节点记录键。
pub fn leader_key(namespace: &str) -> String {
    format!("{namespace}replication_leader")
}

/// 服务器 ID 计数器键。
pub fn server_id_key(namespace: &str) -> String {
    format!("{namespace}server_id")
}

/// 节点在注册表中的自述文档。
///
/// # 契约说明（What）
/// - `address` 为必填键；缺失时整条记录非法，解码即失败。
/// - `server_id` 与 `engine_version` 在分配/探测完成前缺席，缺席与
///   零值可区分。
/// - `snapshotting`/`restoring` 是集群级互斥操作的咨询旗标：任一为真
///   的节点不作为路由目标，且快照创建在任何节点 `restoring` 期间推迟。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_version: Option<String>,
    #[serde(default)]
    pub snapshotting: bool,
    #[serde(default)]
    pub restoring: bool,
}

impl NodeRecord {
    /// 新注册节点的初始记录。
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            server_id: None,
            engine_version: None,
            snapshotting: false,
            restoring: false,
        }
    }

    /// 是否可作为路由目标。
    pub fn is_routable(&self) -> bool {
        !self.snapshotting && !self.restoring
    }
}

/// 主节点记录的值；属主会话由协调服务随键返回，不在文档内。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderRecord {
    pub address: String,
}

/// 集群单调递增的服务器 ID 计数器。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIdCounter {
    pub last_used_id: u64,
}

/// 节点记录的读-改-写补丁；`None` 表示该字段保持原值。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldPatch {
    pub server_id: Option<u64>,
    pub engine_version: Option<String>,
    pub snapshotting: Option<bool>,
    pub restoring: Option<bool>,
}

impl FieldPatch {
    /// 仅设置 `snapshotting` 旗标的补丁。
    pub fn snapshotting(value: bool) -> Self {
        Self {
            snapshotting: Some(value),
            ..Self::default()
        }
    }

    /// 仅设置 `restoring` 旗标的补丁。
    pub fn restoring(value: bool) -> Self {
        Self {
            restoring: Some(value),
            ..Self::default()
        }
    }

    /// 发布身份信息（服务器 ID 与引擎版本）的补丁。
    pub fn identity(server_id: u64, engine_version: impl Into<String>) -> Self {
        Self {
            server_id: Some(server_id),
            engine_version: Some(engine_version.into()),
            ..Self::default()
        }
    }

    /// 将补丁套用到一份新鲜读出的记录上。
    pub fn apply(&self, record: &mut NodeRecord) {
        if let Some(id) = self.server_id {
            record.server_id = Some(id);
        }
        if let Some(version) = &self.engine_version {
            record.engine_version = Some(version.clone());
        }
        if let Some(flag) = self.snapshotting {
            record.snapshotting = flag;
        }
        if let Some(flag) = self.restoring {
            record.restoring = flag;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn record_missing_address_is_rejected() {
        let err = serde_json::from_str::<NodeRecord>(r#"{"restoring": true}"#);
        assert!(err.is_err());
    }

    #[test]
    fn absent_optionals_stay_distinguishable_from_defaults() {
        let record: NodeRecord =
            serde_json::from_str(r#"{"address": "10.0.0.7"}"#).expect("最小文档应可解码");
        assert_eq!(record.server_id, None);
        assert_eq!(record.engine_version, None);
        assert!(!record.snapshotting);
        assert!(!record.restoring);
        assert!(record.is_routable());
    }

    #[test]
    fn flags_make_node_unroutable() {
        let mut record = NodeRecord::new("10.0.0.7");
        FieldPatch::snapshotting(true).apply(&mut record);
        assert!(!record.is_routable());
    }

    #[test]
    fn key_layout_matches_namespace() {
        assert_eq!(instance_key("mcm/", "10.0.0.7"), "mcm/instances/10.0.0.7");
        assert_eq!(leader_key("mcm/"), "mcm/replication_leader");
        assert_eq!(server_id_key("mcm/"), "mcm/server_id");
        assert_eq!(session_name("mcm/"), "mcm/instances");
    }

    proptest! {
        /// 补丁语义：未设置的字段必须保持原值，设置的字段必须生效。
        #[test]
        fn patch_only_touches_selected_fields(
            server_id in proptest::option::of(1u64..10_000),
            snapshotting in proptest::option::of(any::<bool>()),
            restoring in proptest::option::of(any::<bool>()),
        ) {
            let mut record = NodeRecord::new("10.0.0.7");
            record.server_id = Some(1);
            record.snapshotting = true;
            let before = record.clone();

            let patch = FieldPatch {
                server_id,
                engine_version: None,
                snapshotting,
                restoring,
            };
            patch.apply(&mut record);

            prop_assert_eq!(record.server_id, server_id.or(before.server_id));
            prop_assert_eq!(record.snapshotting, snapshotting.unwrap_or(before.snapshotting));
            prop_assert_eq!(record.restoring, restoring.unwrap_or(before.restoring));
            prop_assert_eq!(record.engine_version, before.engine_version);
        }
    }
}
