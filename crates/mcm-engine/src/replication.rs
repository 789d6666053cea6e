//! 复制角色切换与状态读取。
//!
//! 从节点配置使用 GTID 自动定位并在首次连接时索取源公钥；只读以
//! `read_only` + `super_read_only` 双旗标表达。切换顺序是硬约束：
//! 晋升先清复制配置再放开写入，降级先收紧写入再指向新主。

use tracing::info;

use crate::error::EngineError;
use crate::server::Engine;

/// 从节点空闲时的 IO 线程状态。
const IO_STATE_WAITING: &str = "Waiting for master to send event";
/// 源短暂不可达时的 IO 线程状态，同样视为已追平。
const IO_STATE_RECONNECTING: &str = "Reconnecting after a failed source event read";
/// 中继日志全部回放完毕时的 SQL 线程状态。
const SQL_STATE_DRAINED: &str = "Replica has read all relay log; waiting for more updates";

impl Engine {
    /// 把本实例配置为指定主节点的复制从节点，并转入只读。
    pub async fn configure_follower(&self, leader_addr: &str) -> Result<(), EngineError> {
        info!(leader = leader_addr, "configuring replication follower");
        let sql = self.root_runner();
        let accounts = self.accounts();

        sql.execute_lenient("STOP REPLICA").await;
        sql.execute(&format!(
            "CHANGE REPLICATION SOURCE TO SOURCE_HOST = '{leader_addr}', \
             SOURCE_PORT = {port}, SOURCE_USER = '{user}', \
             SOURCE_PASSWORD = '{password}', \
             SOURCE_AUTO_POSITION = 1, GET_SOURCE_PUBLIC_KEY = 1",
            port = self.config().port,
            user = accounts.replication.user,
            password = accounts.replication.password,
        ))
        .await?;
        sql.execute("START REPLICA").await?;

        info!("setting engine read-only");
        sql.execute("SET GLOBAL read_only = 1").await?;
        sql.execute("SET GLOBAL super_read_only = 1").await?;
        Ok(())
    }

    /// 清除复制配置并放开写入（晋升路径）。
    pub async fn clear_follower_config(&self) -> Result<(), EngineError> {
        info!("clearing replication configuration, going read-write");
        let sql = self.root_runner();
        sql.execute_lenient("STOP REPLICA").await;
        sql.execute("RESET REPLICA ALL").await?;
        sql.execute("SET GLOBAL super_read_only = 0").await?;
        sql.execute("SET GLOBAL read_only = 0").await?;
        Ok(())
    }

    /// 仅收紧写入（降级路径中新主尚未可知时）。
    pub async fn set_read_only(&self) -> Result<(), EngineError> {
        info!("setting engine read-only");
        let sql = self.root_runner();
        sql.execute("SET GLOBAL read_only = 1").await?;
        sql.execute("SET GLOBAL super_read_only = 1").await?;
        Ok(())
    }

    /// 当前复制源地址；未配置复制时为 `None`。
    pub async fn replication_source(&self) -> Result<Option<String>, EngineError> {
        let rows = self
            .root_runner()
            .query_vertical("SHOW REPLICA STATUS")
            .await?;
        if rows.len() != 1 {
            return Ok(None);
        }
        match rows[0].get("Source_Host") {
            Some(host) if !host.is_empty() => Ok(Some(host.clone())),
            Some(_) => Ok(None),
            None => Err(EngineError::ReplicaStatus {
                detail: "Source_Host column missing".to_string(),
            }),
        }
    }

    /// 中继日志是否已全部回放（晋升前的追平判定）。
    pub async fn replication_drained(&self) -> Result<bool, EngineError> {
        let rows = self
            .root_runner()
            .query_vertical("SHOW REPLICA STATUS")
            .await?;
        if rows.len() != 1 {
            return Ok(false);
        }
        let row = &rows[0];

        let io_state = row.get("Replica_IO_State").ok_or_else(|| {
            EngineError::ReplicaStatus {
                detail: "Replica_IO_State column missing".to_string(),
            }
        })?;
        if io_state != IO_STATE_WAITING && io_state != IO_STATE_RECONNECTING {
            return Ok(false);
        }

        let sql_state = row.get("Replica_SQL_Running_State").ok_or_else(|| {
            EngineError::ReplicaStatus {
                detail: "Replica_SQL_Running_State column missing".to_string(),
            }
        })?;
        Ok(sql_state == SQL_STATE_DRAINED)
    }
}
