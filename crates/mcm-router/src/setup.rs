//! 路由器的一次性开通。
//!
//! 启动路由器进程，随后下发：监控账号、后端 TLS 变量、复制组配置
//! （写组 1 / 读组 2）、读写分离查询规则、应用账号，最后持久化并激活。
//! TLS 材料以符号链接放进路由器期望的路径并触发一次 TLS 重载。
//! 这些配置只在路由器启动时下发，控制循环不再重复。

use std::time::Duration;

use mcm_engine::run_checked;
use tracing::{debug, info};

use crate::bridge::{READER_HOSTGROUP, RouterBridge, WRITER_HOSTGROUP};
use crate::error::RouterError;

impl RouterBridge {
    /// 启动路由器进程（幂等：已在运行时由其自身的 pid 锁拒绝第二实例）。
    pub async fn start_router(&self) -> Result<(), RouterError> {
        info!("starting query router");
        let settings = self.settings();
        run_checked(
            &settings.router_binary,
            &[
                "--idle-threads".to_string(),
                "-c".to_string(),
                settings.router_config.display().to_string(),
                "--initial".to_string(),
            ],
        )
        .await?;
        Ok(())
    }

    /// 一次性开通：账号、TLS、复制组、查询规则、应用用户。
    pub async fn initial_setup(&self) -> Result<(), RouterError> {
        info!("performing initial router setup");
        let admin = self.admin();
        let accounts = self.accounts();

        // 监控账号复用复制账号。
        let (user, password) = (
            &accounts.replication.user,
            &accounts.replication.password,
        );
        admin
            .execute(&format!(
                "UPDATE global_variables SET variable_value='{user}' \
                 WHERE variable_name='mysql-monitor_username'"
            ))
            .await?;
        admin
            .execute(&format!(
                "UPDATE global_variables SET variable_value='{password}' \
                 WHERE variable_name='mysql-monitor_password'"
            ))
            .await?;

        if let Some(tls) = self.tls() {
            debug!("configuring backend tls variables");
            for (variable, path) in [
                ("mysql-ssl_p2s_ca", &tls.ca),
                ("mysql-ssl_p2s_cert", &tls.cert),
                ("mysql-ssl_p2s_key", &tls.key),
            ] {
                admin
                    .execute(&format!(
                        "UPDATE global_variables SET variable_value='{}' \
                         WHERE variable_name='{variable}'",
                        path.display()
                    ))
                    .await?;
            }
        }

        admin
            .execute("DELETE FROM mysql_replication_hostgroups")
            .await?;
        admin
            .execute(&format!(
                "INSERT INTO mysql_replication_hostgroups \
                 (writer_hostgroup, reader_hostgroup, comment) \
                 VALUES ({WRITER_HOSTGROUP}, {READER_HOSTGROUP}, 'cluster1')"
            ))
            .await?;

        // 读写分离：普通 SELECT 去读组，带锁的留在写组。
        admin
            .execute(&format!(
                "INSERT INTO mysql_query_rules (active, match_digest, \
                 destination_hostgroup, apply) VALUES (1, '^SELECT.*', {READER_HOSTGROUP}, 0)"
            ))
            .await?;
        admin
            .execute(&format!(
                "INSERT INTO mysql_query_rules (active, match_digest, \
                 destination_hostgroup, apply) VALUES (1, '^SELECT.*FOR UPDATE', {WRITER_HOSTGROUP}, 1)"
            ))
            .await?;

        let use_ssl = u8::from(self.tls().is_some_and(|tls| tls.required));
        let (app_user, app_password) = (
            &accounts.application.user,
            &accounts.application.password,
        );
        admin.execute("DELETE FROM mysql_users").await?;
        admin
            .execute(&format!(
                "INSERT INTO mysql_users(username, password, use_ssl, default_hostgroup) \
                 VALUES ('{app_user}', '{app_password}', '{use_ssl}', {WRITER_HOSTGROUP})"
            ))
            .await?;

        self.persist_and_activate().await?;

        if self.tls().is_some() {
            self.install_tls_material().await?;
        }
        Ok(())
    }

    /// LOAD 到运行时并 SAVE 到磁盘（变量、服务器、用户、查询规则）。
    pub async fn persist_and_activate(&self) -> Result<(), RouterError> {
        let admin = self.admin();
        for scope in ["VARIABLES", "SERVERS", "USERS", "QUERY RULES"] {
            admin
                .execute(&format!("LOAD MYSQL {scope} TO RUNTIME"))
                .await?;
        }
        for scope in ["VARIABLES", "SERVERS", "USERS", "QUERY RULES"] {
            admin.execute(&format!("SAVE MYSQL {scope} TO DISK")).await?;
        }
        Ok(())
    }

    /// 把 TLS 材料链接进路由器目录并触发重载。
    async fn install_tls_material(&self) -> Result<(), RouterError> {
        let Some(tls) = self.tls() else {
            return Ok(());
        };
        // 给路由器一点时间把初始配置落盘。
        tokio::time::sleep(Duration::from_secs(1)).await;

        let links = [
            ("proxysql-ca.pem", &tls.ca),
            ("proxysql-cert.pem", &tls.cert),
            ("proxysql-key.pem", &tls.key),
        ];
        for (link_name, target) in links {
            let link = self.settings().tls_dir.join(link_name);
            if link.exists() {
                std::fs::remove_file(&link).map_err(|source| RouterError::Tls {
                    path: link.display().to_string(),
                    source,
                })?;
            }
            std::os::unix::fs::symlink(target, &link).map_err(|source| RouterError::Tls {
                path: link.display().to_string(),
                source,
            })?;
        }

        self.admin().execute("PROXYSQL RELOAD TLS").await?;
        Ok(())
    }
}
