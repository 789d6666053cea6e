//! 集群唯一的服务器 ID 分配器。
//!
//! 单键 `<ns>server_id` 保存 `{"last_used_id": n}`，只以 CAS 更新：
//! 键不存在时在索引 0 上创建并返回 1，否则在观察到的修改索引上写入
//! n+1。CAS 失败意味着并发分配，重读重试即可；返回值跨集群唯一且
//! 严格递增，永不回收。

use std::sync::Arc;

use mcm_core::record::{self, ServerIdCounter};
use mcm_core::{FailureClass, McmError, McmResult, codes};
use tracing::{debug, info};

use crate::client::CoordClient;

/// CAS 冲突的重试上限；耗尽视为致命。
const ALLOCATE_ATTEMPTS: u32 = 30;

pub struct IdAllocator {
    client: Arc<CoordClient>,
}

impl IdAllocator {
    pub fn new(client: Arc<CoordClient>) -> Self {
        Self { client }
    }

    fn key(&self) -> String {
        record::server_id_key(self.client.namespace())
    }

    /// 分配下一个服务器 ID。
    pub async fn allocate(&self) -> McmResult<u64> {
        let key = self.key();

        for attempt in 1..=ALLOCATE_ATTEMPTS {
            match self.client.get(&key).await? {
                None => {
                    let payload = serde_json::to_vec(&ServerIdCounter { last_used_id: 1 })
                        .expect("counter serialization is infallible");
                    if self.client.cas_put(&key, payload, 0).await? {
                        info!(server_id = 1, "started the cluster server-id counter");
                        return Ok(1);
                    }
                    // 另一节点抢先创建了计数器。
                    debug!(attempt, "counter creation raced, re-reading");
                }
                Some(entry) => {
                    let counter: ServerIdCounter =
                        serde_json::from_slice(&entry.value).map_err(|err| {
                            McmError::new(
                                codes::REGISTRY_INVALID_RECORD,
                                FailureClass::InvalidRecord,
                                "server-id counter document failed to decode",
                            )
                            .with_cause(err)
                        })?;

                    let next = counter.last_used_id + 1;
                    let payload = serde_json::to_vec(&ServerIdCounter { last_used_id: next })
                        .expect("counter serialization is infallible");
                    if self.client.cas_put(&key, payload, entry.modify_index).await? {
                        info!(server_id = next, "allocated server id");
                        return Ok(next);
                    }
                    debug!(attempt, "counter update raced, re-reading");
                }
            }
        }

        Err(McmError::new(
            codes::CLUSTER_ID_EXHAUSTED,
            FailureClass::Fatal,
            "server-id allocation kept losing CAS races",
        ))
    }
}
