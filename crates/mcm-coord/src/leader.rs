//! 主节点锁。
//!
//! 整个集群唯一的咨询锁：`<ns>replication_leader` 键由主节点的会话
//! 持有。主节点死亡（会话过期）后记录自行消失，任何节点随即可竞争；
//! 不存在显式交接。锁延迟为零，下游必须容忍另一节点立刻接手。

use std::sync::Arc;

use mcm_core::McmResult;
use mcm_core::record::{self, LeaderRecord};
use tracing::{debug, error, info};

use crate::client::CoordClient;

pub struct LeaderLock {
    client: Arc<CoordClient>,
    address: String,
}

impl LeaderLock {
    pub fn new(client: Arc<CoordClient>, address: impl Into<String>) -> Self {
        Self {
            client,
            address: address.into(),
        }
    }

    fn key(&self) -> String {
        record::leader_key(self.client.namespace())
    }

    /// 尝试成为主节点。
    ///
    /// 记录已存在时不做任何事直接返回 false；不存在时以当前会话做绑定
    /// 写入。两个节点同时观察到空缺时，协调服务的 CAS 语义保证恰有一个
    /// 绑定成功。
    pub async fn try_acquire(&self) -> McmResult<bool> {
        if self.client.get(&self.key()).await?.is_some() {
            debug!("replication leader already recorded");
            return Ok(false);
        }

        let payload = serde_json::to_vec(&LeaderRecord {
            address: self.address.clone(),
        })
        .expect("leader record serialization is infallible");

        let acquired = self.client.acquire_put(&self.key(), payload).await?;
        if acquired {
            info!(address = %self.address, "acquired replication leadership");
        } else {
            debug!("lost the leadership race");
        }
        Ok(acquired)
    }

    /// 本节点当前是否持有领导权。
    ///
    /// 以记录绑定的会话与本地当前会话比对为准。本地写入历史不作数：
    /// 会话重建之后，旧记录即便仍写着我们的地址也不再属于我们。
    pub async fn am_leader(&self) -> McmResult<bool> {
        let Some(entry) = self.client.get(&self.key()).await? else {
            return Ok(false);
        };
        let Some(own_session) = self.client.session_opt() else {
            return Ok(false);
        };
        Ok(entry.session.as_deref() == Some(own_session.as_str()))
    }

    /// 当前主节点地址；记录缺失或非法时为 `None`。
    pub async fn leader_address(&self) -> McmResult<Option<String>> {
        let Some(entry) = self.client.get(&self.key()).await? else {
            return Ok(None);
        };
        match serde_json::from_slice::<LeaderRecord>(&entry.value) {
            Ok(leader) => Ok(Some(leader.address)),
            Err(err) => {
                error!(%err, "discarding malformed leader record");
                Ok(None)
            }
        }
    }
}
