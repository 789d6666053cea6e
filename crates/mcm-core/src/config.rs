//! 配置面。
//!
//! 所有旋钮来自环境变量；任何变量 `NAME` 均可改以 `NAME_FILE` 提供一个
//! 机密文件路径，文件内容（去除首尾空白）作为取值。容器编排场景下
//! 凭据以文件挂载注入，这是唯一受支持的机密通道。

use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{FailureClass, McmError, McmResult, codes};

/// 变量查找的抽象源。
///
/// - **意图 (Why)**：进程环境是全局可变状态，测试中直接改写既不安全也
///   互相干扰；以只读查找接口隔离后，测试用内存表即可覆盖全部路径。
/// - **契约 (What)**：`var` 返回 `None` 表示未设置；空字符串是合法取值，
///   由上层语义决定是否接受。
pub trait VarSource {
    fn var(&self, name: &str) -> Option<String>;
}

/// 进程环境变量源。
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessEnv;

impl VarSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        env::var(name).ok()
    }
}

/// 读取变量或其 `_FILE` 机密文件；两者皆缺时返回 `None`。
///
/// `_FILE` 形式优先：显式挂载的机密应当压过镜像里残留的明文变量。
pub fn lookup(source: &dyn VarSource, name: &str) -> Option<String> {
    let file_key = format!("{name}_FILE");
    if let Some(path) = source.var(&file_key) {
        if let Ok(contents) = fs::read_to_string(&path) {
            return Some(contents.trim().to_string());
        }
    }
    source.var(name)
}

/// 必填变量；缺失时报 `config.missing` 并同时点名 `_FILE` 形式。
pub fn require(source: &dyn VarSource, name: &str) -> McmResult<String> {
    lookup(source, name).ok_or_else(|| {
        McmError::new(
            codes::CONFIG_MISSING,
            FailureClass::Fatal,
            format!("environment variable {name} (or {name}_FILE) is not set"),
        )
    })
}

/// 带默认值的可选变量。
pub fn lookup_or(source: &dyn VarSource, name: &str, default: &str) -> String {
    lookup(source, name).unwrap_or_else(|| default.to_string())
}

/// 布尔旋钮：`true`/`1`（不区分大小写）为真。
pub fn flag(source: &dyn VarSource, name: &str, default: bool) -> bool {
    match lookup(source, name) {
        Some(value) => value.eq_ignore_ascii_case("true") || value == "1",
        None => default,
    }
}

/// 一组数据库账号凭据。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Account {
    pub user: String,
    pub password: String,
}

/// 四类运维账号与可选的初始数据库。
#[derive(Clone, Debug)]
pub struct AccountSettings {
    /// 应用账号，经路由器访问集群。
    pub application: Account,
    /// 备份账号，仅限本机 socket。
    pub backup: Account,
    /// 复制账号，从节点连接主节点时使用。
    pub replication: Account,
    /// root 口令；`root@localhost` 与 `root@'%'` 共用。
    pub root_password: String,
    /// 首次初始化时创建的业务库。
    pub initial_database: Option<String>,
}

/// 协调服务引导参数。
#[derive(Clone, Debug)]
pub struct CoordinationSettings {
    /// 引导用服务名；本机地址通过解析 `tasks.<service>` 发现。
    pub bootstrap_service: String,
    /// 预期成员数，透传给协调代理。
    pub bootstrap_expect: String,
    /// 是否启用协调代理的 Web UI。
    pub enable_ui: bool,
    /// 协调服务 HTTP 入口。
    pub http_addr: String,
    /// 键空间前缀。
    pub namespace: String,
}

/// 快照调度参数。
#[derive(Clone, Debug)]
pub struct SnapshotSettings {
    /// 两次快照之间的最大间隔；下限 60 秒。
    pub interval: Duration,
    /// 快照目录根（其下为 `pending/` 与 `current/`）。
    pub root: PathBuf,
}

/// TLS 材料；三个路径齐备时才视为启用。
#[derive(Clone, Debug)]
pub struct TlsSettings {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
    /// 是否强制应用连接走 TLS。
    pub required: bool,
}

/// 进程启动时一次性装配的全量配置。
#[derive(Clone, Debug)]
pub struct Settings {
    pub coordination: CoordinationSettings,
    pub accounts: AccountSettings,
    pub snapshot: SnapshotSettings,
    pub tls: Option<TlsSettings>,
    /// 指定网卡名时跳过 DNS 交集直接取该网卡地址。
    pub bind_interface: Option<String>,
}

/// 快照间隔下限。调度再频繁也不应把备份工具压成忙等。
pub const SNAPSHOT_INTERVAL_FLOOR: Duration = Duration::from_secs(60);

impl Settings {
    /// 从进程环境装配配置。
    pub fn from_env() -> McmResult<Self> {
        Self::from_source(&ProcessEnv)
    }

    /// 从任意变量源装配配置；缺失必填项时给出致命错误。
    pub fn from_source(source: &dyn VarSource) -> McmResult<Self> {
        let coordination = CoordinationSettings {
            bootstrap_service: lookup_or(source, "CONSUL_BOOTSTRAP_SERVICE", "mysql"),
            bootstrap_expect: lookup_or(source, "CONSUL_BOOTSTRAP_EXPECT", "3"),
            enable_ui: flag(source, "CONSUL_ENABLE_UI", false),
            http_addr: lookup_or(source, "CONSUL_HTTP_ADDR", "http://127.0.0.1:8500"),
            namespace: lookup_or(source, "MCM_KV_PREFIX", "mcm/"),
        };

        let accounts = AccountSettings {
            application: Account {
                user: require(source, "MYSQL_USER")?,
                password: require(source, "MYSQL_PASSWORD")?,
            },
            backup: Account {
                user: require(source, "MYSQL_BACKUP_USER")?,
                password: require(source, "MYSQL_BACKUP_PASSWORD")?,
            },
            replication: Account {
                user: require(source, "MYSQL_REPLICATION_USER")?,
                password: require(source, "MYSQL_REPLICATION_PASSWORD")?,
            },
            root_password: require(source, "MYSQL_ROOT_PASSWORD")?,
            initial_database: lookup(source, "MYSQL_DATABASE").filter(|db| !db.is_empty()),
        };

        let minutes: u64 = lookup_or(source, "SNAPSHOT_MINUTES", "15")
            .parse()
            .map_err(|err: std::num::ParseIntError| {
                McmError::new(
                    codes::CONFIG_INVALID,
                    FailureClass::Fatal,
                    "SNAPSHOT_MINUTES must be an integer number of minutes",
                )
                .with_cause(err)
            })?;
        let interval = Duration::from_secs(minutes * 60).max(SNAPSHOT_INTERVAL_FLOOR);

        let snapshot = SnapshotSettings {
            interval,
            root: PathBuf::from(lookup_or(source, "MCM_SNAPSHOT_ROOT", "/snapshots")),
        };

        let tls = match (
            lookup(source, "MYSQL_TLS_CA"),
            lookup(source, "MYSQL_TLS_CERT"),
            lookup(source, "MYSQL_TLS_KEY"),
        ) {
            (Some(ca), Some(cert), Some(key)) => Some(TlsSettings {
                ca: PathBuf::from(ca),
                cert: PathBuf::from(cert),
                key: PathBuf::from(key),
                required: flag(source, "MYSQL_TLS_REQUIRED", true),
            }),
            _ => None,
        };

        Ok(Self {
            coordination,
            accounts,
            snapshot,
            tls,
            bind_interface: lookup(source, "MCM_BIND_INTERFACE"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::Write;

    struct MapSource(BTreeMap<String, String>);

    impl VarSource for MapSource {
        fn var(&self, name: &str) -> Option<String> {
            self.0.get(name).cloned()
        }
    }

    fn base_vars() -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        for (key, value) in [
            ("MYSQL_USER", "app"),
            ("MYSQL_PASSWORD", "app-secret"),
            ("MYSQL_BACKUP_USER", "backup"),
            ("MYSQL_BACKUP_PASSWORD", "backup-secret"),
            ("MYSQL_REPLICATION_USER", "repl"),
            ("MYSQL_REPLICATION_PASSWORD", "repl-secret"),
            ("MYSQL_ROOT_PASSWORD", "root-secret"),
        ] {
            vars.insert(key.to_string(), value.to_string());
        }
        vars
    }

    #[test]
    fn secret_file_wins_over_plain_variable() {
        let mut file = tempfile::NamedTempFile::new().expect("临时机密文件应可创建");
        writeln!(file, "  from-file  ").unwrap();

        let mut vars = base_vars();
        vars.insert("MYSQL_PASSWORD".into(), "from-env".into());
        vars.insert(
            "MYSQL_PASSWORD_FILE".into(),
            file.path().to_string_lossy().into_owned(),
        );

        let settings = Settings::from_source(&MapSource(vars)).expect("装配应成功");
        assert_eq!(settings.accounts.application.password, "from-file");
    }

    #[test]
    fn missing_required_variable_is_fatal_and_names_both_forms() {
        let mut vars = base_vars();
        vars.remove("MYSQL_ROOT_PASSWORD");
        let err = Settings::from_source(&MapSource(vars)).unwrap_err();
        assert_eq!(err.class(), FailureClass::Fatal);
        assert!(err.message().contains("MYSQL_ROOT_PASSWORD_FILE"));
    }

    #[test]
    fn snapshot_interval_has_a_floor() {
        let mut vars = base_vars();
        vars.insert("SNAPSHOT_MINUTES".into(), "0".into());
        let settings = Settings::from_source(&MapSource(vars)).unwrap();
        assert_eq!(settings.snapshot.interval, SNAPSHOT_INTERVAL_FLOOR);
    }

    #[test]
    fn tls_requires_all_three_paths() {
        let mut vars = base_vars();
        vars.insert("MYSQL_TLS_CA".into(), "/tls/ca.pem".into());
        vars.insert("MYSQL_TLS_CERT".into(), "/tls/cert.pem".into());
        let settings = Settings::from_source(&MapSource(vars.clone())).unwrap();
        assert!(settings.tls.is_none());

        vars.insert("MYSQL_TLS_KEY".into(), "/tls/key.pem".into());
        let settings = Settings::from_source(&MapSource(vars)).unwrap();
        let tls = settings.tls.expect("三个路径齐备时 TLS 应启用");
        assert!(tls.required);
    }

    #[test]
    fn defaults_apply_without_optional_variables() {
        let settings = Settings::from_source(&MapSource(base_vars())).unwrap();
        assert_eq!(settings.coordination.bootstrap_service, "mysql");
        assert_eq!(settings.coordination.namespace, "mcm/");
        assert_eq!(settings.snapshot.interval, Duration::from_secs(15 * 60));
        assert!(settings.accounts.initial_database.is_none());
        assert!(settings.bind_interface.is_none());
    }
}
