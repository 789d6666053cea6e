//! 引擎生命周期：初始化、受监护启动、停止与版本探测。

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use mcm_core::config::AccountSettings;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::accounts;
use crate::admin::{SqlRunner, SqlTarget};
use crate::error::EngineError;

/// 引擎已初始化的标志文件。
const ENGINE_LOG_FILE: &str = "ib_logfile0";

/// 引擎路径与监护参数；默认值对应常规发行版布局。
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub server_binary: PathBuf,
    pub client_binary: PathBuf,
    pub datadir: PathBuf,
    pub socket: PathBuf,
    pub config_fragment: PathBuf,
    /// 引擎运行身份，也是恢复后数据目录的属主。
    pub service_user: String,
    pub port: u16,
    /// 等待引擎可接受连接的预算。
    pub ready_timeout: Duration,
    /// SQL SHUTDOWN 后等待进程退出的预算，超过则强杀。
    pub stop_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_binary: PathBuf::from("/usr/sbin/mysqld"),
            client_binary: PathBuf::from("mysql"),
            datadir: PathBuf::from("/var/lib/mysql"),
            socket: PathBuf::from("/var/run/mysqld/mysqld.sock"),
            config_fragment: PathBuf::from("/etc/mysql/conf.d/zz_cluster.cnf"),
            service_user: "mysql".to_string(),
            port: 3306,
            ready_timeout: Duration::from_secs(120),
            stop_timeout: Duration::from_secs(30),
        }
    }
}

/// 受监护的引擎子进程。
#[derive(Debug)]
pub struct EngineProcess {
    child: Child,
}

impl EngineProcess {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub async fn wait(&mut self) -> Result<std::process::ExitStatus, std::io::Error> {
        self.child.wait().await
    }

    pub async fn kill(&mut self) -> Result<(), std::io::Error> {
        self.child.kill().await
    }
}

/// 引擎监护句柄。
pub struct Engine {
    config: EngineConfig,
    accounts: AccountSettings,
}

impl Engine {
    pub fn new(config: EngineConfig, accounts: AccountSettings) -> Self {
        Self { config, accounts }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn accounts(&self) -> &AccountSettings {
        &self.accounts
    }

    /// 以任意账号构造本机 socket 上的 SQL 通道。
    pub fn runner(
        &self,
        user: &str,
        password: Option<String>,
        database: Option<String>,
    ) -> SqlRunner {
        SqlRunner::new(
            self.config.client_binary.clone(),
            SqlTarget::UnixSocket(self.config.socket.clone()),
            user,
            password,
            database,
        )
    }

    /// 特权通道（root + 配置的口令）。
    pub fn root_runner(&self) -> SqlRunner {
        self.runner(
            "root",
            Some(self.accounts.root_password.clone()),
            Some("mysql".to_string()),
        )
    }

    /// 数据目录是否已有引擎数据。
    pub fn is_initialized(&self) -> bool {
        self.config.datadir.join(ENGINE_LOG_FILE).is_file()
    }

    /// 生成集群配置片段。每次启动前重写，内容只依赖服务器 ID。
    pub fn write_cluster_config(&self, server_id: u64) -> Result<(), EngineError> {
        let contents = format!(
            "# DO NOT EDIT - This file was generated automatically\n\
             [mysqld]\n\
             server_id={server_id}\n\
             gtid_mode=ON\n\
             enforce-gtid-consistency=ON\n"
        );
        std::fs::write(&self.config.config_fragment, contents).map_err(|source| {
            EngineError::Config {
                path: self.config.config_fragment.display().to_string(),
                source,
            }
        })
    }

    /// 首次初始化：建库目录、建运维账号，然后停库。
    ///
    /// 已初始化时直接返回 `false`。初始化期间引擎不开网络口，所有
    /// 语句都走 socket。
    pub async fn init_if_needed(&self, server_id: u64) -> Result<bool, EngineError> {
        if self.is_initialized() {
            info!("engine data directory already initialised, skipping");
            return Ok(false);
        }

        info!(datadir = %self.config.datadir.display(), "initialising engine data directory");
        run_checked(
            &self.config.server_binary,
            &[
                "--initialize-insecure".to_string(),
                format!("--user={}", self.config.service_user),
            ],
        )
        .await?;

        // 初始化后的首次启动：root 尚无口令。
        let mut process = self.start(server_id, false).await?;

        let setup = accounts::create_operator_accounts(self).await;

        // 无论账号创建成败都要把引擎停下来，避免半配置实例漏网络口。
        let shutdown = self.stop(&mut process).await;
        setup?;
        shutdown?;
        Ok(true)
    }

    /// 启动引擎并等待其在 socket 上可用。
    pub async fn start(
        &self,
        server_id: u64,
        use_root_password: bool,
    ) -> Result<EngineProcess, EngineError> {
        self.write_cluster_config(server_id)?;

        info!(server_id, "starting engine");
        let child = Command::new(&self.config.server_binary)
            .arg(format!("--user={}", self.config.service_user))
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| EngineError::Spawn {
                command: self.config.server_binary.display().to_string(),
                source,
            })?;

        let mut process = EngineProcess { child };
        let password = use_root_password.then(|| self.accounts.root_password.clone());
        if let Err(err) = self.wait_ready(password).await {
            let _ = process.kill().await;
            return Err(err);
        }
        debug!(pid = ?process.pid(), "engine accepting connections");
        Ok(process)
    }

    /// 轮询 socket 直到 `SELECT 1` 成功。
    async fn wait_ready(&self, password: Option<String>) -> Result<(), EngineError> {
        let runner = self.runner("root", password, Some("mysql".to_string()));
        let deadline = tokio::time::Instant::now() + self.config.ready_timeout;

        while tokio::time::Instant::now() < deadline {
            if runner.execute("SELECT 1").await.is_ok() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Err(EngineError::StartTimeout {
            timeout: self.config.ready_timeout,
        })
    }

    /// 停止引擎：先 SQL SHUTDOWN（无口令优先，root 口令兜底），
    /// 预算内等不到退出就强杀。
    pub async fn stop(&self, process: &mut EngineProcess) -> Result<(), EngineError> {
        info!("stopping engine");
        let bare = self.runner("root", None, Some("mysql".to_string()));
        if bare.execute("SHUTDOWN").await.is_err() {
            self.root_runner().execute_lenient("SHUTDOWN").await;
        }

        match tokio::time::timeout(self.config.stop_timeout, process.wait()).await {
            Ok(Ok(status)) => {
                debug!(%status, "engine exited");
                Ok(())
            }
            Ok(Err(source)) => Err(EngineError::Spawn {
                command: self.config.server_binary.display().to_string(),
                source,
            }),
            Err(_) => {
                warn!("engine ignored shutdown, killing");
                process.kill().await.map_err(|source| EngineError::Spawn {
                    command: self.config.server_binary.display().to_string(),
                    source,
                })
            }
        }
    }

    /// 探测引擎版本（`mysqld --version`）。
    pub async fn version(&self) -> Result<String, EngineError> {
        let output = Command::new(&self.config.server_binary)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| EngineError::Spawn {
                command: self.config.server_binary.display().to_string(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_version(&stdout).ok_or_else(|| EngineError::ReplicaStatus {
            detail: format!("unparseable version output: {}", stdout.trim()),
        })
    }
}

/// 运行外部工具并校验退出码。
pub async fn run_checked(
    program: &PathBuf,
    args: &[String],
) -> Result<(), EngineError> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|source| EngineError::Spawn {
            command: program.display().to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(EngineError::Subprocess {
            command: program.display().to_string(),
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// 从 `mysqld --version` 输出提取版本号（`Ver` 后的第一个 token）。
fn parse_version(output: &str) -> Option<String> {
    let mut tokens = output.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "Ver" {
            return tokens.next().map(str::to_string);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcm_core::config::{Account, AccountSettings};

    fn accounts() -> AccountSettings {
        AccountSettings {
            application: Account {
                user: "app".into(),
                password: "app-pw".into(),
            },
            backup: Account {
                user: "backup".into(),
                password: "backup-pw".into(),
            },
            replication: Account {
                user: "repl".into(),
                password: "repl-pw".into(),
            },
            root_password: "root-pw".into(),
            initial_database: None,
        }
    }

    #[test]
    fn cluster_config_fragment_contains_the_replication_identity() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.config_fragment = dir.path().join("zz_cluster.cnf");

        let engine = Engine::new(config.clone(), accounts());
        engine.write_cluster_config(42).unwrap();

        let written = std::fs::read_to_string(&config.config_fragment).unwrap();
        assert!(written.contains("server_id=42"));
        assert!(written.contains("gtid_mode=ON"));
        assert!(written.contains("enforce-gtid-consistency=ON"));
        assert!(written.starts_with("# DO NOT EDIT"));
    }

    #[test]
    fn initialised_detection_keys_off_the_engine_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.datadir = dir.path().to_path_buf();

        let engine = Engine::new(config, accounts());
        assert!(!engine.is_initialized());

        std::fs::write(dir.path().join(ENGINE_LOG_FILE), b"").unwrap();
        assert!(engine.is_initialized());
    }

    #[test]
    fn version_parsing_takes_the_token_after_ver() {
        let output = "/usr/sbin/mysqld  Ver 8.0.39-0ubuntu0.24.04.1 for Linux on x86_64 ((Ubuntu))";
        assert_eq!(parse_version(output).as_deref(), Some("8.0.39-0ubuntu0.24.04.1"));
        assert_eq!(parse_version("garbage"), None);
    }
}
