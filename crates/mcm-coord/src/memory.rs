//! 进程内协调后端。
//!
//! 与 HTTP 后端遵守同一套 CAS / 会话绑定 / delete 行为语义，用单把锁
//! 保证线性化。额外暴露两个测试钩子：`expire_session`（模拟 TTL 过期）
//! 与 `set_reachable`（模拟服务中断）。注册表、主节点锁与分配器的
//! 语义测试都跑在这个后端上。

use std::collections::BTreeMap;

use async_trait::async_trait;
use mcm_core::{FailureClass, McmError, McmResult, codes};
use parking_lot::Mutex;

use crate::backend::{CoordBackend, KvEntry, PutMode, ServiceSpec, SessionId, SessionSpec};

#[derive(Clone, Debug)]
struct Stored {
    value: Vec<u8>,
    modify_index: u64,
    session: Option<SessionId>,
}

#[derive(Debug)]
struct State {
    kv: BTreeMap<String, Stored>,
    sessions: BTreeMap<SessionId, String>,
    services: BTreeMap<String, ServiceSpec>,
    next_index: u64,
    next_session: u64,
    reachable: bool,
}

/// 测试用协调后端。
#[derive(Debug)]
pub struct MemoryCoord {
    state: Mutex<State>,
}

impl Default for MemoryCoord {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoord {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                kv: BTreeMap::new(),
                sessions: BTreeMap::new(),
                services: BTreeMap::new(),
                next_index: 1,
                next_session: 1,
                reachable: true,
            }),
        }
    }

    /// 模拟会话 TTL 过期：删除会话本身以及它获取的全部键。
    pub fn expire_session(&self, id: &str) {
        let mut state = self.state.lock();
        state.sessions.remove(id);
        state.kv.retain(|_, stored| stored.session.as_deref() != Some(id));
    }

    /// 模拟协调服务中断（所有操作报瞬时错误）与恢复。
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// 会话是否仍然存活（断言辅助）。
    pub fn session_alive(&self, id: &str) -> bool {
        self.state.lock().sessions.contains_key(id)
    }

    /// 服务目录中某实例的标签（断言辅助）。
    pub fn service_tags(&self, id: &str) -> Option<Vec<String>> {
        self.state
            .lock()
            .services
            .get(id)
            .map(|spec| spec.tags.clone())
    }

    fn outage() -> McmError {
        McmError::new(
            codes::COORD_UNREACHABLE,
            FailureClass::Transient,
            "coordination service unreachable",
        )
    }
}

#[async_trait]
impl CoordBackend for MemoryCoord {
    async fn kv_get(&self, key: &str) -> McmResult<Option<KvEntry>> {
        let state = self.state.lock();
        if !state.reachable {
            return Err(Self::outage());
        }
        Ok(state.kv.get(key).map(|stored| KvEntry {
            value: stored.value.clone(),
            modify_index: stored.modify_index,
            session: stored.session.clone(),
        }))
    }

    async fn kv_put(&self, key: &str, value: Vec<u8>, mode: PutMode) -> McmResult<bool> {
        let mut state = self.state.lock();
        if !state.reachable {
            return Err(Self::outage());
        }

        let applied = match &mode {
            PutMode::Plain => true,
            PutMode::Cas(0) => !state.kv.contains_key(key),
            PutMode::Cas(expected) => state
                .kv
                .get(key)
                .is_some_and(|stored| stored.modify_index == *expected),
            PutMode::Acquire(session) => {
                state.sessions.contains_key(session)
                    && match state.kv.get(key) {
                        Some(stored) => match &stored.session {
                            Some(holder) => holder == session,
                            None => true,
                        },
                        None => true,
                    }
            }
        };

        if !applied {
            return Ok(false);
        }

        let index = state.next_index;
        state.next_index += 1;
        let session = match mode {
            PutMode::Acquire(session) => Some(session),
            _ => state.kv.get(key).and_then(|stored| stored.session.clone()),
        };
        state.kv.insert(
            key.to_string(),
            Stored {
                value,
                modify_index: index,
                session,
            },
        );
        Ok(true)
    }

    async fn kv_delete(&self, key: &str) -> McmResult<()> {
        let mut state = self.state.lock();
        if !state.reachable {
            return Err(Self::outage());
        }
        state.kv.remove(key);
        Ok(())
    }

    async fn kv_list(&self, prefix: &str) -> McmResult<Vec<(String, KvEntry)>> {
        let state = self.state.lock();
        if !state.reachable {
            return Err(Self::outage());
        }
        Ok(state
            .kv
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, stored)| {
                (
                    key.clone(),
                    KvEntry {
                        value: stored.value.clone(),
                        modify_index: stored.modify_index,
                        session: stored.session.clone(),
                    },
                )
            })
            .collect())
    }

    async fn session_create(&self, spec: &SessionSpec) -> McmResult<SessionId> {
        let mut state = self.state.lock();
        if !state.reachable {
            return Err(Self::outage());
        }
        let id = format!("session-{}", state.next_session);
        state.next_session += 1;
        state.sessions.insert(id.clone(), spec.name.clone());
        Ok(id)
    }

    async fn session_renew(&self, id: &str) -> McmResult<()> {
        let state = self.state.lock();
        if !state.reachable {
            return Err(Self::outage());
        }
        if state.sessions.contains_key(id) {
            Ok(())
        } else {
            Err(McmError::new(
                codes::COORD_SESSION_LOST,
                FailureClass::SessionLost,
                format!("session {id} expired on the coordination service"),
            ))
        }
    }

    async fn session_destroy(&self, id: &str) -> McmResult<()> {
        {
            let state = self.state.lock();
            if !state.reachable {
                return Err(Self::outage());
            }
        }
        // destroy 与过期同效：行为是 delete。
        self.expire_session(id);
        Ok(())
    }

    async fn service_register(&self, spec: &ServiceSpec) -> McmResult<()> {
        let mut state = self.state.lock();
        if !state.reachable {
            return Err(Self::outage());
        }
        state.services.insert(spec.id.clone(), spec.clone());
        Ok(())
    }

    async fn service_deregister(&self, id: &str) -> McmResult<()> {
        let mut state = self.state.lock();
        if !state.reachable {
            return Err(Self::outage());
        }
        state.services.remove(id);
        Ok(())
    }

    async fn reachable(&self) -> bool {
        self.state.lock().reachable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spec() -> SessionSpec {
        SessionSpec {
            name: "mcm/instances".into(),
            ttl: Duration::from_secs(15),
        }
    }

    #[tokio::test]
    async fn cas_zero_means_create_only() {
        let coord = MemoryCoord::new();
        assert!(coord.kv_put("k", b"1".to_vec(), PutMode::Cas(0)).await.unwrap());
        assert!(!coord.kv_put("k", b"2".to_vec(), PutMode::Cas(0)).await.unwrap());
    }

    #[tokio::test]
    async fn stale_cas_fails_and_fresh_read_succeeds() {
        let coord = MemoryCoord::new();
        coord.kv_put("k", b"1".to_vec(), PutMode::Cas(0)).await.unwrap();
        let first = coord.kv_get("k").await.unwrap().unwrap();

        assert!(
            coord
                .kv_put("k", b"2".to_vec(), PutMode::Cas(first.modify_index))
                .await
                .unwrap()
        );
        // 旧索引已经过期。
        assert!(
            !coord
                .kv_put("k", b"3".to_vec(), PutMode::Cas(first.modify_index))
                .await
                .unwrap()
        );

        let second = coord.kv_get("k").await.unwrap().unwrap();
        assert!(second.modify_index > first.modify_index);
        assert_eq!(second.value, b"2");
    }

    #[tokio::test]
    async fn acquire_is_exclusive_between_live_sessions() {
        let coord = MemoryCoord::new();
        let a = coord.session_create(&spec()).await.unwrap();
        let b = coord.session_create(&spec()).await.unwrap();

        assert!(
            coord
                .kv_put("lock", b"a".to_vec(), PutMode::Acquire(a.clone()))
                .await
                .unwrap()
        );
        assert!(
            !coord
                .kv_put("lock", b"b".to_vec(), PutMode::Acquire(b.clone()))
                .await
                .unwrap()
        );

        coord.expire_session(&a);
        assert!(coord.kv_get("lock").await.unwrap().is_none());
        assert!(
            coord
                .kv_put("lock", b"b".to_vec(), PutMode::Acquire(b))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn acquire_with_dead_session_is_rejected() {
        let coord = MemoryCoord::new();
        let a = coord.session_create(&spec()).await.unwrap();
        coord.expire_session(&a);
        assert!(
            !coord
                .kv_put("lock", b"a".to_vec(), PutMode::Acquire(a))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn outage_surfaces_as_transient() {
        let coord = MemoryCoord::new();
        coord.set_reachable(false);
        let err = coord.kv_get("k").await.unwrap_err();
        assert_eq!(err.class(), mcm_core::FailureClass::Transient);
        assert!(!coord.reachable().await);
    }
}
