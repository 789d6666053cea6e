//! 运维账号开通。
//!
//! 仅在首次初始化、root 尚无口令的窗口内执行：应用账号、备份账号、
//! 复制账号、root 远程账号，以及可选的初始业务库。授权集刻意最小：
//! 备份账号只拿物理备份所需的权限与 performance_schema 的三张状态表。

use tracing::debug;

use crate::error::EngineError;
use crate::server::Engine;

pub(crate) async fn create_operator_accounts(engine: &Engine) -> Result<(), EngineError> {
    // 初始化窗口内 root 无口令。
    let sql = engine.runner("root", None, Some("mysql".to_string()));
    let accounts = engine.accounts();

    debug!("creating application account");
    let (user, password) = (&accounts.application.user, &accounts.application.password);
    sql.execute(&format!(
        "CREATE USER '{user}'@'%' IDENTIFIED WITH caching_sha2_password BY '{password}'"
    ))
    .await?;

    debug!("creating backup account");
    let (user, password) = (&accounts.backup.user, &accounts.backup.password);
    sql.execute(&format!(
        "CREATE USER '{user}'@'localhost' IDENTIFIED WITH caching_sha2_password BY '{password}'"
    ))
    .await?;
    sql.execute(&format!(
        "GRANT BACKUP_ADMIN, PROCESS, RELOAD, LOCK TABLES, REPLICATION CLIENT, \
         REPLICATION_SLAVE_ADMIN ON *.* TO '{user}'@'localhost'"
    ))
    .await?;
    for table in [
        "performance_schema.log_status",
        "performance_schema.keyring_component_status",
        "performance_schema.replication_group_members",
    ] {
        sql.execute(&format!("GRANT SELECT ON {table} TO '{user}'@'localhost'"))
            .await?;
    }

    debug!("creating replication account");
    let (user, password) = (&accounts.replication.user, &accounts.replication.password);
    sql.execute(&format!(
        "CREATE USER '{user}'@'%' IDENTIFIED WITH caching_sha2_password BY '{password}'"
    ))
    .await?;
    sql.execute(&format!(
        "GRANT REPLICATION SLAVE ON *.* TO '{user}'@'%'"
    ))
    .await?;

    debug!("configuring root access");
    let root_password = &accounts.root_password;
    sql.execute(&format!(
        "CREATE USER 'root'@'%' IDENTIFIED WITH caching_sha2_password BY '{root_password}'"
    ))
    .await?;
    sql.execute("GRANT ALL PRIVILEGES ON *.* TO 'root'@'%' WITH GRANT OPTION")
        .await?;
    sql.execute(&format!(
        "ALTER USER 'root'@'localhost' IDENTIFIED WITH caching_sha2_password BY '{root_password}'"
    ))
    .await?;

    if let Some(database) = &accounts.initial_database {
        debug!(database, "creating initial database");
        let root = engine.root_runner();
        root.execute(&format!("CREATE DATABASE IF NOT EXISTS `{database}`"))
            .await?;
        let app_user = &accounts.application.user;
        root.execute(&format!(
            "GRANT ALL PRIVILEGES ON `{database}`.* TO '{app_user}'@'%'"
        ))
        .await?;
    }

    Ok(())
}
