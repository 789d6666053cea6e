//! 管理 SQL 执行通道。
//!
//! 语句通过官方客户端二进制执行：引擎侧走本机 UNIX socket（首次初始
//! 化期间引擎不开网络口），路由器侧走管理 TCP 口。查询结果用垂直
//! 输出（`\G`）解析成键值行，避免对列宽排版做任何假设。

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::EngineError;

/// SQL 通道目标。
#[derive(Clone, Debug)]
pub enum SqlTarget {
    /// 本机 UNIX socket。
    UnixSocket(PathBuf),
    /// TCP 管理口（路由器）。
    Tcp { host: String, port: u16 },
}

/// 一条可复用的 SQL 执行通道。
#[derive(Clone, Debug)]
pub struct SqlRunner {
    client_binary: PathBuf,
    target: SqlTarget,
    user: String,
    password: Option<String>,
    database: Option<String>,
}

impl SqlRunner {
    pub fn new(
        client_binary: impl Into<PathBuf>,
        target: SqlTarget,
        user: impl Into<String>,
        password: Option<String>,
        database: Option<String>,
    ) -> Self {
        Self {
            client_binary: client_binary.into(),
            target,
            user: user.into(),
            password,
            database,
        }
    }

    fn args(&self, statement: &str) -> Vec<String> {
        let mut args = Vec::new();
        match &self.target {
            SqlTarget::UnixSocket(path) => {
                args.push(format!("--socket={}", path.display()));
            }
            SqlTarget::Tcp { host, port } => {
                args.push(format!("--host={host}"));
                args.push(format!("--port={port}"));
                args.push("--protocol=TCP".to_string());
            }
        }
        args.push(format!("--user={}", self.user));
        if let Some(password) = &self.password {
            args.push(format!("--password={password}"));
        }
        if let Some(database) = &self.database {
            args.push(format!("--database={database}"));
        }
        args.push("--batch".to_string());
        args.push(format!("--execute={statement}"));
        args
    }

    async fn run(&self, statement: &str) -> Result<String, EngineError> {
        let args = self.args(statement);
        let output = Command::new(&self.client_binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| EngineError::Spawn {
                command: self.client_binary.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(EngineError::Sql {
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// 执行语句，丢弃输出。
    pub async fn execute(&self, statement: &str) -> Result<(), EngineError> {
        debug!(statement = first_word(statement), "executing admin sql");
        self.run(statement).await.map(|_| ())
    }

    /// 执行语句但容忍失败（如对未启用复制的实例 STOP REPLICA）。
    pub async fn execute_lenient(&self, statement: &str) {
        if let Err(err) = self.run(statement).await {
            warn!(statement = first_word(statement), %err, "lenient admin sql failed");
        }
    }

    /// 以垂直输出执行查询并解析为键值行。
    pub async fn query_vertical(
        &self,
        statement: &str,
    ) -> Result<Vec<BTreeMap<String, String>>, EngineError> {
        let output = self.run(&format!("{statement}\\G")).await?;
        Ok(parse_vertical(&output))
    }
}

fn first_word(statement: &str) -> &str {
    statement.split_whitespace().next().unwrap_or("")
}

/// 解析 `\G` 垂直输出。行分隔符是 `*** N. row ***` 标题行，
/// 字段行是 `键: 值`（值里允许再出现冒号）。
pub(crate) fn parse_vertical(output: &str) -> Vec<BTreeMap<String, String>> {
    let mut rows = Vec::new();
    let mut current: Option<BTreeMap<String, String>> = None;

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("***") {
            if let Some(row) = current.take() {
                rows.push(row);
            }
            current = Some(BTreeMap::new());
            continue;
        }
        if let Some((key, value)) = trimmed.split_once(':') {
            if let Some(row) = current.as_mut() {
                row.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
    }
    if let Some(row) = current {
        rows.push(row);
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_socket_args_carry_socket_user_and_statement() {
        let runner = SqlRunner::new(
            "mysql",
            SqlTarget::UnixSocket(PathBuf::from("/var/run/mysqld/mysqld.sock")),
            "root",
            Some("secret".into()),
            Some("mysql".into()),
        );
        let args = runner.args("SHUTDOWN");
        assert!(args.contains(&"--socket=/var/run/mysqld/mysqld.sock".to_string()));
        assert!(args.contains(&"--user=root".to_string()));
        assert!(args.contains(&"--password=secret".to_string()));
        assert!(args.contains(&"--database=mysql".to_string()));
        assert!(args.contains(&"--execute=SHUTDOWN".to_string()));
    }

    #[test]
    fn tcp_args_force_the_tcp_protocol() {
        let runner = SqlRunner::new(
            "mysql",
            SqlTarget::Tcp {
                host: "127.0.0.1".into(),
                port: 6032,
            },
            "admin",
            Some("admin".into()),
            None,
        );
        let args = runner.args("SELECT 1");
        assert!(args.contains(&"--host=127.0.0.1".to_string()));
        assert!(args.contains(&"--port=6032".to_string()));
        assert!(args.contains(&"--protocol=TCP".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--database=")));
    }

    #[test]
    fn passwordless_runner_omits_the_password_flag() {
        let runner = SqlRunner::new(
            "mysql",
            SqlTarget::UnixSocket(PathBuf::from("/tmp/mysqld.sock")),
            "root",
            None,
            None,
        );
        assert!(
            !runner
                .args("SELECT 1")
                .iter()
                .any(|a| a.starts_with("--password"))
        );
    }

    #[test]
    fn vertical_output_parses_into_rows() {
        let output = "\
*************************** 1. row ***************************
             Replica_IO_State: Waiting for master to send event
                  Source_Host: 10.0.0.1
    Replica_SQL_Running_State: Replica has read all relay log; waiting for more updates
";
        let rows = parse_vertical(output);
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0].get("Source_Host").map(String::as_str),
            Some("10.0.0.1")
        );
        assert_eq!(
            rows[0].get("Replica_SQL_Running_State").map(String::as_str),
            Some("Replica has read all relay log; waiting for more updates")
        );
    }

    #[test]
    fn empty_output_yields_no_rows() {
        assert!(parse_vertical("").is_empty());
    }
}
