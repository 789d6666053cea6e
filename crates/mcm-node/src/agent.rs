//! 协调代理子进程。
//!
//! 每个节点旁路运行一个协调服务代理，以 server 模式加入
//! `tasks.<service>` 的其余成员。代理自管生命周期；本进程退出时由
//! 运行环境（容器）连带回收。

use std::process::Stdio;
use std::time::Duration;

use mcm_core::config::CoordinationSettings;
use mcm_core::{FailureClass, McmError, McmResult, codes};
use tokio::process::{Child, Command};
use tracing::info;

/// 组装代理命令行。
pub fn agent_args(settings: &CoordinationSettings, bind_address: &str) -> Vec<String> {
    let mut args = vec![
        "agent".to_string(),
        "-data-dir".to_string(),
        "/tmp/consul".to_string(),
        "-bind".to_string(),
        bind_address.to_string(),
        "-client".to_string(),
        "0.0.0.0".to_string(),
        "-server".to_string(),
        "-retry-join".to_string(),
        format!("tasks.{}", settings.bootstrap_service),
        "-bootstrap-expect".to_string(),
        settings.bootstrap_expect.clone(),
    ];
    if settings.enable_ui {
        args.push("-ui".to_string());
    }
    args
}

/// 启动代理并稍候片刻让其起监听。
pub async fn start_agent(
    settings: &CoordinationSettings,
    bind_address: &str,
) -> McmResult<Child> {
    let args = agent_args(settings, bind_address);
    info!(?args, "starting coordination agent");

    let child = Command::new("consul")
        .args(&args)
        .stdin(Stdio::null())
        .spawn()
        .map_err(|err| {
            McmError::new(
                codes::COORD_UNREACHABLE,
                FailureClass::Fatal,
                "failed to launch the coordination agent",
            )
            .with_cause(err)
        })?;

    info!(pid = ?child.id(), "coordination agent started");
    tokio::time::sleep(Duration::from_secs(1)).await;
    Ok(child)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(enable_ui: bool) -> CoordinationSettings {
        CoordinationSettings {
            bootstrap_service: "mysql".into(),
            bootstrap_expect: "3".into(),
            enable_ui,
            http_addr: "http://127.0.0.1:8500".into(),
            namespace: "mcm/".into(),
        }
    }

    #[test]
    fn agent_args_join_the_bootstrap_service() {
        let args = agent_args(&settings(false), "10.0.0.7");
        let joined = args.join(" ");
        assert!(joined.contains("-bind 10.0.0.7"));
        assert!(joined.contains("-retry-join tasks.mysql"));
        assert!(joined.contains("-bootstrap-expect 3"));
        assert!(joined.contains("-server"));
        assert!(!joined.contains("-ui"));
    }

    #[test]
    fn ui_flag_is_optional() {
        let args = agent_args(&settings(true), "10.0.0.7");
        assert!(args.contains(&"-ui".to_string()));
    }
}
