//! 路由桥错误。

use mcm_core::{FailureClass, McmError, codes};
use mcm_engine::EngineError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("router admin operation failed: {source}")]
    Admin {
        #[from]
        source: EngineError,
    },

    #[error("router tls material setup failed on {path}: {source}")]
    Tls {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<RouterError> for McmError {
    fn from(err: RouterError) -> Self {
        McmError::new(codes::ROUTER_ADMIN, FailureClass::Subprocess, err.to_string()).with_cause(err)
    }
}
