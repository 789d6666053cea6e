//! 差量驱动的后端同步。

use std::path::PathBuf;

use mcm_core::config::{AccountSettings, TlsSettings};
use mcm_engine::{SqlRunner, SqlTarget};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::RouterError;

/// 写组与读组的组号（路由器复制组配置的两半）。
pub const WRITER_HOSTGROUP: u16 = 1;
pub const READER_HOSTGROUP: u16 = 2;

/// 路由器管理面配置。
#[derive(Clone, Debug)]
pub struct RouterSettings {
    pub admin_host: String,
    pub admin_port: u16,
    pub admin_user: String,
    pub admin_password: String,
    pub client_binary: PathBuf,
    pub router_binary: PathBuf,
    pub router_config: PathBuf,
    /// 路由器期望 TLS 材料所在的目录。
    pub tls_dir: PathBuf,
    /// 后端数据库端口。
    pub backend_port: u16,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            admin_host: "127.0.0.1".to_string(),
            admin_port: 6032,
            admin_user: "admin".to_string(),
            admin_password: "admin".to_string(),
            client_binary: PathBuf::from("mysql"),
            router_binary: PathBuf::from("/usr/bin/proxysql"),
            router_config: PathBuf::from("/etc/proxysql.cnf"),
            tls_dir: PathBuf::from("/var/lib/proxysql"),
            backend_port: 3306,
        }
    }
}

/// 一次同步的目标后端集合；读组地址恒为排序后形态，便于稳定比较。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendSet {
    pub writer: Option<String>,
    pub readers: Vec<String>,
}

impl BackendSet {
    pub fn new(writer: Option<String>, mut readers: Vec<String>) -> Self {
        readers.sort_unstable();
        readers.dedup();
        Self { writer, readers }
    }
}

/// 路由器管理桥。
pub struct RouterBridge {
    settings: RouterSettings,
    accounts: AccountSettings,
    tls: Option<TlsSettings>,
    admin: SqlRunner,
    /// 上次成功提交的后端集合；未变化时同步是零操作。
    applied: Mutex<Option<BackendSet>>,
}

impl RouterBridge {
    pub fn new(
        settings: RouterSettings,
        accounts: AccountSettings,
        tls: Option<TlsSettings>,
    ) -> Self {
        let admin = SqlRunner::new(
            settings.client_binary.clone(),
            SqlTarget::Tcp {
                host: settings.admin_host.clone(),
                port: settings.admin_port,
            },
            settings.admin_user.clone(),
            Some(settings.admin_password.clone()),
            None,
        );
        Self {
            settings,
            accounts,
            tls,
            admin,
            applied: Mutex::new(None),
        }
    }

    pub(crate) fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    pub(crate) fn accounts(&self) -> &AccountSettings {
        &self.accounts
    }

    pub(crate) fn tls(&self) -> Option<&TlsSettings> {
        self.tls.as_ref()
    }

    pub(crate) fn admin(&self) -> &SqlRunner {
        &self.admin
    }

    pub(crate) fn use_ssl(&self) -> bool {
        self.tls.is_some()
    }

    /// 把路由器后端对齐到给定的写者与读者集合。
    ///
    /// 返回是否真的提交了变更。
    pub async fn sync_backends(
        &self,
        writer: Option<&str>,
        readers: &[String],
    ) -> Result<bool, RouterError> {
        let target = BackendSet::new(writer.map(str::to_string), readers.to_vec());
        if self.applied.lock().as_ref() == Some(&target) {
            debug!("router backends unchanged");
            return Ok(false);
        }

        info!(?target, "router backends changed, reconfiguring");
        self.admin.execute("DELETE FROM mysql_servers").await?;

        if let Some(writer) = &target.writer {
            self.admin
                .execute(&backend_insert_sql(
                    WRITER_HOSTGROUP,
                    writer,
                    self.settings.backend_port,
                    self.use_ssl(),
                ))
                .await?;
        }
        for reader in &target.readers {
            self.admin
                .execute(&backend_insert_sql(
                    READER_HOSTGROUP,
                    reader,
                    self.settings.backend_port,
                    self.use_ssl(),
                ))
                .await?;
        }

        self.admin.execute("LOAD MYSQL SERVERS TO RUNTIME").await?;
        self.admin.execute("SAVE MYSQL SERVERS TO DISK").await?;

        *self.applied.lock() = Some(target);
        Ok(true)
    }
}

/// 后端插入语句。
pub(crate) fn backend_insert_sql(hostgroup: u16, host: &str, port: u16, use_ssl: bool) -> String {
    format!(
        "INSERT INTO mysql_servers(hostgroup_id, hostname, port, use_ssl) \
         VALUES ({hostgroup}, '{host}', {port}, {ssl})",
        ssl = u8::from(use_ssl),
    )
}
