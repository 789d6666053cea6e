//! Consul HTTP API 后端。
//!
//! 走 `/v1/kv`、`/v1/session`、`/v1/agent/service` 三组端点：CAS 与
//! 会话绑定写入分别映射到 `?cas=` 与 `?acquire=` 查询参数，读出的值
//! 是 base64 编码。会话固定以 delete 行为、零锁延迟创建。

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use mcm_core::{FailureClass, McmError, McmResult, codes};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{CoordBackend, KvEntry, PutMode, ServiceSpec, SessionId, SessionSpec};

/// Consul 协调后端。
#[derive(Clone, Debug)]
pub struct ConsulCoord {
    http: reqwest::Client,
    base: String,
}

#[derive(Debug, Deserialize)]
struct KvPair {
    #[serde(rename = "Key")]
    key: String,
    /// 键被会话持有但无值时为 null。
    #[serde(rename = "Value")]
    value: Option<String>,
    #[serde(rename = "ModifyIndex")]
    modify_index: u64,
    #[serde(rename = "Session")]
    session: Option<String>,
}

#[derive(Debug, Serialize)]
struct SessionCreateBody {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "TTL")]
    ttl: String,
    #[serde(rename = "Behavior")]
    behavior: &'static str,
    #[serde(rename = "LockDelay")]
    lock_delay: &'static str,
}

#[derive(Debug, Deserialize)]
struct SessionCreateReply {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Serialize)]
struct ServiceRegisterBody {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Tags")]
    tags: Vec<String>,
}

fn transport_error(err: reqwest::Error) -> McmError {
    McmError::new(
        codes::COORD_UNREACHABLE,
        FailureClass::Transient,
        "coordination service request failed",
    )
    .with_cause(err)
}

fn status_error(context: &'static str, status: reqwest::StatusCode) -> McmError {
    McmError::new(
        codes::COORD_UNREACHABLE,
        FailureClass::Transient,
        format!("coordination service returned {status} for {context}"),
    )
}

impl ConsulCoord {
    /// `base` 形如 `http://127.0.0.1:8500`，结尾斜线会被剥除。
    pub fn new(base: impl Into<String>) -> Self {
        let mut base = base.into();
        while base.ends_with('/') {
            base.pop();
        }
        Self {
            http: reqwest::Client::new(),
            base,
        }
    }

    fn kv_url(&self, key: &str) -> String {
        format!("{}/v1/kv/{key}", self.base)
    }

    fn decode_pair(pair: KvPair) -> McmResult<KvEntry> {
        let value = match pair.value {
            Some(encoded) => BASE64.decode(encoded.as_bytes()).map_err(|err| {
                McmError::new(
                    codes::REGISTRY_INVALID_RECORD,
                    FailureClass::InvalidRecord,
                    format!("value of key {} is not valid base64", pair.key),
                )
                .with_cause(err)
            })?,
            None => Vec::new(),
        };
        Ok(KvEntry {
            value,
            modify_index: pair.modify_index,
            session: pair.session,
        })
    }
}

#[async_trait]
impl CoordBackend for ConsulCoord {
    async fn kv_get(&self, key: &str) -> McmResult<Option<KvEntry>> {
        let response = self
            .http
            .get(self.kv_url(key))
            .send()
            .await
            .map_err(transport_error)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(status_error("kv get", response.status()));
        }

        let mut pairs: Vec<KvPair> = response.json().await.map_err(transport_error)?;
        match pairs.pop() {
            Some(pair) => Ok(Some(Self::decode_pair(pair)?)),
            None => Ok(None),
        }
    }

    async fn kv_put(&self, key: &str, value: Vec<u8>, mode: PutMode) -> McmResult<bool> {
        let mut request = self.http.put(self.kv_url(key));
        request = match &mode {
            PutMode::Plain => request,
            PutMode::Cas(index) => request.query(&[("cas", index.to_string())]),
            PutMode::Acquire(session) => request.query(&[("acquire", session.clone())]),
        };

        let response = request.body(value).send().await.map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error("kv put", response.status()));
        }

        // Consul 以字面 true/false 应答条件写入是否生效。
        let applied: bool = response.json().await.map_err(transport_error)?;
        debug!(key, ?mode, applied, "kv put");
        Ok(applied)
    }

    async fn kv_delete(&self, key: &str) -> McmResult<()> {
        let response = self
            .http
            .delete(self.kv_url(key))
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error("kv delete", response.status()));
        }
        Ok(())
    }

    async fn kv_list(&self, prefix: &str) -> McmResult<Vec<(String, KvEntry)>> {
        let response = self
            .http
            .get(self.kv_url(prefix))
            .query(&[("recurse", "true")])
            .send()
            .await
            .map_err(transport_error)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(status_error("kv list", response.status()));
        }

        let pairs: Vec<KvPair> = response.json().await.map_err(transport_error)?;
        let mut entries = Vec::with_capacity(pairs.len());
        for pair in pairs {
            let key = pair.key.clone();
            entries.push((key, Self::decode_pair(pair)?));
        }
        Ok(entries)
    }

    async fn session_create(&self, spec: &SessionSpec) -> McmResult<SessionId> {
        let body = SessionCreateBody {
            name: spec.name.clone(),
            ttl: format!("{}s", spec.ttl.as_secs()),
            behavior: "delete",
            lock_delay: "0s",
        };
        let response = self
            .http
            .put(format!("{}/v1/session/create", self.base))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error("session create", response.status()));
        }
        let reply: SessionCreateReply = response.json().await.map_err(transport_error)?;
        Ok(reply.id)
    }

    async fn session_renew(&self, id: &str) -> McmResult<()> {
        let response = self
            .http
            .put(format!("{}/v1/session/renew/{id}", self.base))
            .send()
            .await
            .map_err(transport_error)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            // 协调服务已经忘掉了这个会话：续约无从谈起。
            return Err(McmError::new(
                codes::COORD_SESSION_LOST,
                FailureClass::SessionLost,
                format!("session {id} expired on the coordination service"),
            ));
        }
        if !response.status().is_success() {
            return Err(status_error("session renew", response.status()));
        }
        Ok(())
    }

    async fn session_destroy(&self, id: &str) -> McmResult<()> {
        let response = self
            .http
            .put(format!("{}/v1/session/destroy/{id}", self.base))
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error("session destroy", response.status()));
        }
        Ok(())
    }

    async fn service_register(&self, spec: &ServiceSpec) -> McmResult<()> {
        let body = ServiceRegisterBody {
            name: spec.name.clone(),
            id: spec.id.clone(),
            port: spec.port,
            tags: spec.tags.clone(),
        };
        let response = self
            .http
            .put(format!("{}/v1/agent/service/register", self.base))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error("service register", response.status()));
        }
        Ok(())
    }

    async fn service_deregister(&self, id: &str) -> McmResult<()> {
        let response = self
            .http
            .put(format!("{}/v1/agent/service/deregister/{id}", self.base))
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error("service deregister", response.status()));
        }
        Ok(())
    }

    async fn reachable(&self) -> bool {
        match self
            .http
            .get(format!("{}/v1/status/leader", self.base))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn base_url_is_normalised() {
        let coord = ConsulCoord::new("http://127.0.0.1:8500///");
        assert_eq!(coord.kv_url("mcm/server_id"), "http://127.0.0.1:8500/v1/kv/mcm/server_id");
    }

    #[test]
    fn session_body_pins_delete_behavior_and_zero_lock_delay() {
        let body = SessionCreateBody {
            name: "mcm/instances".into(),
            ttl: format!("{}s", Duration::from_secs(15).as_secs()),
            behavior: "delete",
            lock_delay: "0s",
        };
        let json = serde_json::to_value(&body).expect("会话体应可序列化");
        assert_eq!(json["TTL"], "15s");
        assert_eq!(json["Behavior"], "delete");
        assert_eq!(json["LockDelay"], "0s");
    }

    #[test]
    fn kv_pair_decodes_base64_and_session() {
        let pair: KvPair = serde_json::from_str(
            r#"{"Key":"mcm/replication_leader","Value":"eyJhZGRyZXNzIjoiMTAuMC4wLjcifQ==",
                "ModifyIndex":42,"Session":"s-1","CreateIndex":40,"Flags":0,"LockIndex":1}"#,
        )
        .expect("Consul 应答应可解码");
        let entry = ConsulCoord::decode_pair(pair).expect("base64 值应可解码");
        assert_eq!(entry.modify_index, 42);
        assert_eq!(entry.session.as_deref(), Some("s-1"));
        assert_eq!(entry.value, br#"{"address":"10.0.0.7"}"#);
    }
}
