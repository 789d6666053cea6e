//! 快照存储：布局、创建与恢复。

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use mcm_core::FieldPatch;
use mcm_core::config::Account;
use mcm_coord::NodeRegistry;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::error::SnapshotError;

/// 备份工具产出的有效性标记；缺任何一个快照即视为不存在。
const MARKERS: [&str; 3] = [
    "xtrabackup_checkpoints",
    "xtrabackup_binlog_info",
    "xtrabackup_logfile",
];

/// 引擎已初始化的标志文件（数据目录非空判定）。
const ENGINE_LOG_FILE: &str = "ib_logfile0";

/// 快照层配置。
#[derive(Clone, Debug)]
pub struct SnapshotConfig {
    /// 快照根目录，其下为 `pending/` 与 `current/`。
    pub root: PathBuf,
    pub backup_binary: PathBuf,
    pub chown_binary: PathBuf,
    pub datadir: PathBuf,
    /// 恢复后数据目录的属主。
    pub service_user: String,
    pub backup_account: Account,
    /// 等待进行中操作让位的轮询参数。
    pub wait_attempts: u32,
    pub wait_interval: Duration,
}

impl SnapshotConfig {
    pub fn new(root: impl Into<PathBuf>, datadir: impl Into<PathBuf>, backup_account: Account) -> Self {
        Self {
            root: root.into(),
            backup_binary: PathBuf::from("/usr/bin/xtrabackup"),
            chown_binary: PathBuf::from("chown"),
            datadir: datadir.into(),
            service_user: "mysql".to_string(),
            backup_account,
            wait_attempts: 100,
            wait_interval: Duration::from_secs(5),
        }
    }
}

/// 本节点的快照存储。
pub struct SnapshotStore {
    config: SnapshotConfig,
    registry: Arc<NodeRegistry>,
}

impl SnapshotStore {
    pub fn new(config: SnapshotConfig, registry: Arc<NodeRegistry>) -> Self {
        Self { config, registry }
    }

    pub fn pending_path(&self) -> PathBuf {
        self.config.root.join("pending")
    }

    pub fn current_path(&self) -> PathBuf {
        self.config.root.join("current")
    }

    /// 是否存在可恢复的快照（目录与全部标记文件齐备）。
    pub fn exists(&self) -> bool {
        let current = self.current_path();
        current.exists() && MARKERS.iter().all(|marker| current.join(marker).exists())
    }

    /// 当前快照的修改时间；无有效快照时为 `None`。
    pub fn mtime(&self) -> Option<SystemTime> {
        if !self.exists() {
            return None;
        }
        std::fs::metadata(self.current_path())
            .and_then(|meta| meta.modified())
            .ok()
    }

    /// 当前快照距今的年龄。
    pub fn age(&self) -> Option<Duration> {
        self.mtime()
            .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
    }

    /// 是否有快照正在产出。
    ///
    /// 本地 `pending/` 存在且集群里有节点置位 `snapshotting` 才算数。
    /// 无人置位时把 `pending/` 当作残留清掉——与一个刚置位旗标但尚未
    /// 可见的节点之间存在已知的竞争窗口，代价止于一次被丢弃的备份。
    pub async fn is_pending(&self) -> bool {
        if !self.pending_path().exists() {
            return false;
        }
        match self.registry.any_snapshotting().await {
            Ok(true) => true,
            Ok(false) => {
                self.reset_pending();
                false
            }
            Err(err) => {
                // 注册表读不到时宁可保守：按仍在产出处理。
                warn!(%err, "cannot read registry, treating pending snapshot as live");
                true
            }
        }
    }

    /// 删除残留的 `pending/`。
    pub fn reset_pending(&self) {
        let pending = self.pending_path();
        if pending.exists() {
            info!(path = %pending.display(), "removing pending snapshot");
            if let Err(err) = std::fs::remove_dir_all(&pending) {
                error!(%err, "failed to remove pending snapshot");
            }
        }
    }

    async fn any_restoring(&self) -> bool {
        self.registry.any_restoring().await.unwrap_or(true)
    }

    async fn any_snapshotting(&self) -> bool {
        self.registry.any_snapshotting().await.unwrap_or(true)
    }

    /// 等待集群内所有进行中的快照与（可选）恢复让位。
    async fn wait_until_clear(&self, include_restores: bool) -> Result<(), SnapshotError> {
        for _ in 0..self.config.wait_attempts {
            let pending = self.is_pending().await;
            let snapshotting = self.any_snapshotting().await;
            let restoring = include_restores && self.any_restoring().await;
            if !pending && !snapshotting && !restoring {
                return Ok(());
            }
            debug!(pending, snapshotting, restoring, "waiting for in-flight operations");
            tokio::time::sleep(self.config.wait_interval).await;
        }
        Err(SnapshotError::WaitTimeout)
    }

    /// 创建一个新快照。
    ///
    /// `from_source` 为 false（常态，备份在从节点上跑）时传安全从库
    /// 选项，备份期间短暂暂停复制以保证一致性。
    pub async fn create(&self, from_source: bool) -> Result<(), SnapshotError> {
        if self.is_pending().await || self.any_snapshotting().await || self.any_restoring().await {
            info!("snapshot or restore in flight, waiting before creating a new one");
            self.wait_until_clear(true).await?;
        }

        let pending = self.pending_path();
        if pending.exists() {
            warn!(path = %pending.display(), "stale pending snapshot, removing");
            std::fs::remove_dir_all(&pending).map_err(|source| SnapshotError::Io {
                path: pending.display().to_string(),
                source,
            })?;
        }
        std::fs::create_dir_all(&pending).map_err(|source| SnapshotError::Io {
            path: pending.display().to_string(),
            source,
        })?;

        if let Err(err) = self.registry.set_fields(FieldPatch::snapshotting(true)).await {
            self.reset_pending();
            return Err(SnapshotError::Flag { source: err });
        }

        info!(path = %pending.display(), "snapshotting engine");
        let result = self.run_backup(from_source).await;

        // 旗标清理走尽力而为：失败路径也要清，否则全集群的快照调度
        // 会被一个死旗标卡住（旗标最终随会话过期兜底消失）。
        if let Err(err) = self
            .registry
            .set_fields(FieldPatch::snapshotting(false))
            .await
        {
            error!(%err, "failed to clear the snapshotting flag");
        }

        if result.is_err() {
            self.reset_pending();
        }
        result
    }

    async fn run_backup(&self, from_source: bool) -> Result<(), SnapshotError> {
        let pending = self.pending_path();
        let account = &self.config.backup_account;

        let mut backup_args = vec![
            format!("--user={}", account.user),
            format!("--password={}", account.password),
            "--backup".to_string(),
            format!("--target-dir={}", pending.display()),
        ];
        if !from_source {
            backup_args.push("--safe-slave-backup".to_string());
        }
        run_tool(&self.config.backup_binary, &backup_args).await?;

        run_tool(
            &self.config.backup_binary,
            &[
                "--prepare".to_string(),
                format!("--target-dir={}", pending.display()),
            ],
        )
        .await?;

        self.promote_pending()?;
        info!("snapshot created");
        Ok(())
    }

    /// `pending/` 晋升为 `current/`：先删旧、后同文件系统原子改名。
    fn promote_pending(&self) -> Result<(), SnapshotError> {
        let current = self.current_path();
        if current.exists() {
            info!(path = %current.display(), "removing previous snapshot");
            std::fs::remove_dir_all(&current).map_err(|source| SnapshotError::Io {
                path: current.display().to_string(),
                source,
            })?;
        }
        std::fs::rename(self.pending_path(), &current).map_err(|source| SnapshotError::Io {
            path: current.display().to_string(),
            source,
        })
    }

    /// 从 `current/` 恢复数据目录。
    pub async fn restore(&self) -> Result<(), SnapshotError> {
        if !self.exists() {
            return Err(SnapshotError::Missing);
        }
        if self.is_pending().await {
            info!("snapshot in flight, waiting before restoring");
            self.wait_until_clear(false).await?;
            if !self.exists() {
                return Err(SnapshotError::Missing);
            }
        }

        self.registry
            .set_fields(FieldPatch::restoring(true))
            .await
            .map_err(|err| SnapshotError::Flag { source: err })?;

        let result = self.run_restore().await;

        if let Err(err) = self.registry.set_fields(FieldPatch::restoring(false)).await {
            error!(%err, "failed to clear the restoring flag");
        }
        result
    }

    async fn run_restore(&self) -> Result<(), SnapshotError> {
        let datadir = &self.config.datadir;
        info!(snapshot = %self.current_path().display(), "restoring snapshot");

        // 数据目录非空时逐项挪进带时间戳的旁路目录。逐项而非整目录
        // 改名：绑定挂载的数据卷不允许移动挂载点本身。
        let mut aside: Option<PathBuf> = None;
        if datadir.join(ENGINE_LOG_FILE).is_file() {
            let stamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            let aside_dir = PathBuf::from(format!("{}_restore_{stamp}", datadir.display()));
            std::fs::create_dir_all(&aside_dir).map_err(|source| SnapshotError::Io {
                path: aside_dir.display().to_string(),
                source,
            })?;
            move_entries(datadir, &aside_dir)?;
            info!(path = %aside_dir.display(), "previous engine data moved aside");
            aside = Some(aside_dir);
        }

        let restore_result = self.copy_back_and_chown().await;

        match restore_result {
            Ok(()) => {
                if let Some(aside_dir) = aside {
                    info!(path = %aside_dir.display(), "removing previous engine data");
                    if let Err(err) = std::fs::remove_dir_all(&aside_dir) {
                        warn!(%err, "failed to remove the set-aside data directory");
                    }
                }
                Ok(())
            }
            Err(err) => {
                error!(%err, "restore failed, rolling back");
                if let Some(aside_dir) = &aside {
                    if let Err(rollback) = rollback_datadir(datadir, aside_dir) {
                        error!(%rollback, "rollback of the data directory failed");
                    }
                }
                Err(err)
            }
        }
    }

    async fn copy_back_and_chown(&self) -> Result<(), SnapshotError> {
        run_tool(
            &self.config.backup_binary,
            &[
                "--copy-back".to_string(),
                format!("--target-dir={}", self.current_path().display()),
            ],
        )
        .await?;

        let owner = format!("{0}:{0}", self.config.service_user);
        run_tool(
            &self.config.chown_binary,
            &[
                owner,
                "-R".to_string(),
                self.config.datadir.display().to_string(),
            ],
        )
        .await
    }
}

/// 把 `from` 的所有目录项移动到 `to` 下。
fn move_entries(from: &Path, to: &Path) -> Result<(), SnapshotError> {
    let entries = std::fs::read_dir(from).map_err(|source| SnapshotError::Io {
        path: from.display().to_string(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| SnapshotError::Io {
            path: from.display().to_string(),
            source,
        })?;
        let dest = to.join(entry.file_name());
        debug!(from = %entry.path().display(), to = %dest.display(), "moving entry");
        std::fs::rename(entry.path(), &dest).map_err(|source| SnapshotError::Io {
            path: dest.display().to_string(),
            source,
        })?;
    }
    Ok(())
}

/// 失败恢复的回滚：清掉半恢复的数据，把旁路目录的内容挪回去。
fn rollback_datadir(datadir: &Path, aside: &Path) -> Result<(), SnapshotError> {
    let entries = std::fs::read_dir(datadir).map_err(|source| SnapshotError::Io {
        path: datadir.display().to_string(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| SnapshotError::Io {
            path: datadir.display().to_string(),
            source,
        })?;
        let path = entry.path();
        let removed = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        removed.map_err(|source| SnapshotError::Io {
            path: path.display().to_string(),
            source,
        })?;
    }
    move_entries(aside, datadir)?;
    std::fs::remove_dir_all(aside).map_err(|source| SnapshotError::Io {
        path: aside.display().to_string(),
        source,
    })
}

/// 运行外部工具并校验退出码。
async fn run_tool(program: &Path, args: &[String]) -> Result<(), SnapshotError> {
    debug!(command = %program.display(), ?args, "running backup tool");
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|source| SnapshotError::Spawn {
            command: program.display().to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(SnapshotError::Tool {
            command: program.display().to_string(),
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}
