//! 引擎层错误。

use std::time::Duration;

use mcm_core::{FailureClass, McmError, codes};
use thiserror::Error;

/// 引擎监护与管理 SQL 的细粒度错误。
///
/// 折叠进统一错误域时：子进程与 SQL 失败归 `Subprocess` 分类，就绪
/// 超时归 `engine.timeout`，控制循环据此进入 Degraded。
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with status {status}: {stderr}")]
    Subprocess {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("sql statement failed: {stderr}")]
    Sql { stderr: String },

    #[error("engine did not accept connections within {timeout:?}")]
    StartTimeout { timeout: Duration },

    #[error("failed to write config fragment {path}: {source}")]
    Config {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unexpected replica status output: {detail}")]
    ReplicaStatus { detail: String },
}

impl From<EngineError> for McmError {
    fn from(err: EngineError) -> Self {
        let (code, class) = match &err {
            EngineError::StartTimeout { .. } => (codes::ENGINE_TIMEOUT, FailureClass::Subprocess),
            EngineError::Sql { .. } | EngineError::ReplicaStatus { .. } => {
                (codes::ENGINE_SQL, FailureClass::Subprocess)
            }
            _ => (codes::ENGINE_SUBPROCESS, FailureClass::Subprocess),
        };
        McmError::new(code, class, err.to_string()).with_cause(err)
    }
}
