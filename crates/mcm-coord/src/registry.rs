//! 节点注册表。
//!
//! 每个节点在 `<ns>instances/<addr>` 下维护一条会话绑定的自述记录。
//! 记录只由属主节点写入；跨节点只读。写路径一律是“新鲜读-改-写”：
//! 同一 tick 内不缓存读数，本节点内并发操作（如晋升与旗标清理）合并
//! 出的结果才是一致的。

use std::sync::Arc;

use mcm_core::record::{self, NodeRecord};
use mcm_core::{FailureClass, FieldPatch, McmError, McmResult, codes};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::client::CoordClient;

/// 注册等待旧会话让位的尝试次数；大致覆盖两个会话 TTL。
const REGISTER_ATTEMPTS: u32 = 8;

pub struct NodeRegistry {
    client: Arc<CoordClient>,
    address: String,
    /// 最近一次成功发布的记录。仅用于会话重建后的再发布，
    /// 读-改-写路径永远走新鲜读。
    published: Mutex<Option<NodeRecord>>,
}

impl NodeRegistry {
    pub fn new(client: Arc<CoordClient>, address: impl Into<String>) -> Self {
        Self {
            client,
            address: address.into(),
            published: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn own_key(&self) -> String {
        record::instance_key(self.client.namespace(), &self.address)
    }

    fn prefix(&self) -> String {
        record::instances_prefix(self.client.namespace())
    }

    fn decode(key: &str, value: &[u8]) -> Option<NodeRecord> {
        match serde_json::from_slice::<NodeRecord>(value) {
            Ok(node) => Some(node),
            Err(err) => {
                // 缺必填键的记录整体跳过，绝不取其存活性。
                error!(key, %err, "discarding malformed registry record");
                None
            }
        }
    }

    /// 注册本节点。必须先于任何其他发布成功。
    ///
    /// 上一世代的记录若还挂在未过期的旧会话上，绑定写入会失败；这里
    /// 以注册专用的等待计划让位给旧会话的 TTL。残留记录的 `restoring`
    /// 旗标被继承：恢复中途崩溃的节点重新上线时不得谎报状态。
    pub async fn register(&self) -> McmResult<()> {
        let key = self.own_key();
        let mut node = NodeRecord::new(self.address.clone());
        if let Some(entry) = self.client.get(&key).await? {
            if let Some(previous) = Self::decode(&key, &entry.value) {
                node.restoring = previous.restoring;
            }
        }

        let payload = serde_json::to_vec(&node).expect("node record serialization is infallible");
        for attempt in 1..=REGISTER_ATTEMPTS {
            if self.client.acquire_put(&key, payload.clone()).await? {
                info!(address = %self.address, restoring = node.restoring, "node registered");
                *self.published.lock() = Some(node);
                return Ok(());
            }
            debug!(
                attempt,
                "registry key still bound to a previous session, waiting"
            );
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        }

        Err(McmError::new(
            codes::COORD_SESSION_LOST,
            FailureClass::SessionLost,
            "unable to bind the node record to the current session",
        ))
    }

    /// 读-改-写更新本节点记录中的若干字段。
    ///
    /// 读不到记录说明会话已经丢过一次（记录随旧会话删除），调用方须先
    /// 重新注册。
    pub async fn set_fields(&self, patch: FieldPatch) -> McmResult<()> {
        let key = self.own_key();
        let entry = self.client.get(&key).await?.ok_or_else(|| {
            McmError::new(
                codes::REGISTRY_RECORD_MISSING,
                FailureClass::SessionLost,
                "own registry record vanished, re-registration required",
            )
        })?;

        let mut node = Self::decode(&key, &entry.value).ok_or_else(|| {
            McmError::new(
                codes::REGISTRY_INVALID_RECORD,
                FailureClass::InvalidRecord,
                "own registry record failed to decode",
            )
        })?;
        patch.apply(&mut node);

        let payload = serde_json::to_vec(&node).expect("node record serialization is infallible");
        if !self.client.acquire_put(&key, payload).await? {
            return Err(McmError::new(
                codes::COORD_SESSION_LOST,
                FailureClass::SessionLost,
                "registry record could not be reacquired under the current session",
            ));
        }
        *self.published.lock() = Some(node);
        Ok(())
    }

    /// 会话重建后把最近发布的记录重新绑定到新会话上。
    pub async fn republish(&self) -> McmResult<()> {
        let node = self
            .published
            .lock()
            .clone()
            .unwrap_or_else(|| NodeRecord::new(self.address.clone()));
        let payload = serde_json::to_vec(&node).expect("node record serialization is infallible");
        if !self.client.acquire_put(&self.own_key(), payload).await? {
            return Err(McmError::new(
                codes::COORD_SESSION_LOST,
                FailureClass::SessionLost,
                "republish failed, record held elsewhere",
            ));
        }
        Ok(())
    }

    /// 本节点当前的注册记录。
    pub async fn get_own(&self) -> McmResult<Option<NodeRecord>> {
        let key = self.own_key();
        Ok(self
            .client
            .get(&key)
            .await?
            .and_then(|entry| Self::decode(&key, &entry.value)))
    }

    /// 全部可解码的注册记录（含旗标置位的节点）。
    pub async fn all_records(&self) -> McmResult<Vec<NodeRecord>> {
        let entries = self.client.list(&self.prefix()).await?;
        Ok(entries
            .iter()
            .filter_map(|(key, entry)| Self::decode(key, &entry.value))
            .collect())
    }

    /// 可作为路由目标的节点，按地址排序以便稳定比较。
    pub async fn list_live(&self) -> McmResult<Vec<NodeRecord>> {
        let mut nodes: Vec<NodeRecord> = self
            .all_records()
            .await?
            .into_iter()
            .filter(|node| {
                if !node.is_routable() {
                    debug!(address = %node.address, "skipping node with an operation in progress");
                }
                node.is_routable()
            })
            .collect();
        nodes.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(nodes)
    }

    pub async fn any_restoring(&self) -> McmResult<bool> {
        Ok(self.all_records().await?.iter().any(|node| node.restoring))
    }

    pub async fn any_snapshotting(&self) -> McmResult<bool> {
        Ok(self
            .all_records()
            .await?
            .iter()
            .any(|node| node.snapshotting))
    }

    /// 显式删除本节点记录（停机路径；会话销毁同样会删除它）。
    pub async fn deregister(&self) -> McmResult<()> {
        self.client.delete(&self.own_key()).await
    }
}
