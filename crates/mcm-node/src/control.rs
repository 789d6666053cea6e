//! 控制循环状态机。
//!
//! 单逻辑 actor：所有状态迁移在一个任务里按时间串行。每个 tick 的
//! 动作幂等——协调调用可能阻塞到重试预算上限，重复执行必须无害。
//!
//! 状态与迁移：
//! - `Boot`：装配已在 main 完成（代理子进程、地址发现），直接入下一态。
//! - `WaitCoord`：等协调服务可达（慢路径预算，超限致命）。
//! - `SessionReady`：确保有会话；首次走 `Initializing`，会话丢失后的
//!   再入路径走重注册与角色重评（领导权必须重新竞争）。
//! - `Initializing`：分配服务器 ID、写集群配置片段、注册节点；数据
//!   目录为空且有可见快照时转 `Restoring`，否则从零初始化。
//! - `Restoring`：快照恢复；失败转 `Degraded`。
//! - `Running(role)`：周期 tick——会话体检、领导权竞争/自检、路由
//!   同步、从节点的快照调度。
//! - `Degraded`：不再参与集群，进程以非零码退出等待重启。
//! - `Stopping`：注销服务、停引擎、销毁会话（随之带走节点记录与
//!   可能持有的主节点记录）。

use std::sync::Arc;
use std::time::Duration;

use mcm_core::{FailureClass, FieldPatch, McmError, McmResult, NodeRecord, codes};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::context::AppContext;
use crate::refresher::SESSION_TTL;

/// Running 态的 tick 周期。
pub const TICK: Duration = Duration::from_secs(5);
/// 晋升前等待中继日志追平的预算。
const DRAIN_WAIT: Duration = Duration::from_secs(30);

/// 集群角色。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

/// 状态机状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Boot,
    WaitCoord,
    SessionReady,
    Initializing,
    Restoring,
    Running(Role),
    Degraded,
    Stopping,
}

pub struct ControlLoop {
    ctx: Arc<AppContext>,
    state: NodeState,
    server_id: Option<u64>,
    engine_process: Option<mcm_engine::EngineProcess>,
    snapshot_worker: Option<JoinHandle<()>>,
    shutdown_rx: watch::Receiver<bool>,
    session_lost_rx: mpsc::Receiver<()>,
}

impl ControlLoop {
    pub fn new(
        ctx: Arc<AppContext>,
        shutdown_rx: watch::Receiver<bool>,
        session_lost_rx: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            ctx,
            state: NodeState::Boot,
            server_id: None,
            engine_process: None,
            snapshot_worker: None,
            shutdown_rx,
            session_lost_rx,
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// 驱动状态机直到停机或不可恢复。
    pub async fn run(&mut self) -> McmResult<()> {
        loop {
            if *self.shutdown_rx.borrow() && self.state != NodeState::Stopping {
                self.state = NodeState::Stopping;
            }

            match self.state {
                NodeState::Boot => {
                    info!(address = %self.ctx.address, "control loop starting");
                    self.state = NodeState::WaitCoord;
                }
                NodeState::WaitCoord => {
                    self.ctx.client.wait_reachable().await?;
                    self.state = NodeState::SessionReady;
                }
                NodeState::SessionReady => self.session_ready().await?,
                NodeState::Initializing => self.initialize().await?,
                NodeState::Restoring => self.restore().await,
                NodeState::Running(role) => self.tick(role).await?,
                NodeState::Degraded => {
                    error!("node is degraded and will not participate until restarted");
                    return Err(McmError::new(
                        codes::NODE_DEGRADED,
                        FailureClass::Fatal,
                        "node entered the degraded state",
                    ));
                }
                NodeState::Stopping => {
                    self.enter_stopping().await;
                    return Ok(());
                }
            }
        }
    }

    /// 确保有会话。首次进入走初始化；再入（会话丢失后）走重注册与
    /// 角色重评。
    async fn session_ready(&mut self) -> McmResult<()> {
        if self.ctx.client.session_opt().is_none() {
            let name = mcm_core::record::session_name(self.ctx.client.namespace());
            self.ctx.client.session_create(&name, SESSION_TTL).await?;
        }

        if self.server_id.is_none() {
            self.state = NodeState::Initializing;
            return Ok(());
        }

        // 再入路径：记录随旧会话消失，须重注册；旧领导权不被继承。
        info!("re-entering the cluster after session loss");
        self.ctx.registry.register().await?;
        self.publish_identity().await;
        let role = self.assume_role().await?;
        self.state = NodeState::Running(role);
        Ok(())
    }

    async fn initialize(&mut self) -> McmResult<()> {
        let server_id = self.ctx.allocator.allocate().await?;
        self.server_id = Some(server_id);
        self.ctx.engine.write_cluster_config(server_id)?;
        self.ctx.registry.register().await?;

        if !self.ctx.engine.is_initialized() && self.ctx.snapshots.exists() {
            info!("empty data directory and a visible snapshot, restoring");
            self.state = NodeState::Restoring;
            return Ok(());
        }

        match self.ctx.engine.init_if_needed(server_id).await {
            Ok(created) => {
                if created {
                    info!("engine initialised from scratch");
                }
            }
            Err(err) => {
                error!(%err, "engine initialisation failed");
                self.state = NodeState::Degraded;
                return Ok(());
            }
        }

        self.start_engine_and_assume_role().await
    }

    async fn restore(&mut self) {
        match self.ctx.snapshots.restore().await {
            Ok(()) => {
                info!("snapshot restored");
                if let Err(err) = self.start_engine_and_assume_role().await {
                    error!(%err, "engine start after restore failed");
                    self.state = NodeState::Degraded;
                }
            }
            Err(err) => {
                error!(%err, "snapshot restore failed");
                self.state = NodeState::Degraded;
            }
        }
    }

    async fn start_engine_and_assume_role(&mut self) -> McmResult<()> {
        let Some(server_id) = self.server_id else {
            return Err(McmError::new(
                codes::NODE_DEGRADED,
                FailureClass::Fatal,
                "engine start requested before server-id allocation",
            ));
        };
        match self.ctx.engine.start(server_id, true).await {
            Ok(process) => self.engine_process = Some(process),
            Err(err) => {
                error!(%err, "engine failed to start");
                self.state = NodeState::Degraded;
                return Ok(());
            }
        }

        self.publish_identity().await;
        let role = self.assume_role().await?;
        self.refresh_router(role).await;
        self.state = NodeState::Running(role);
        Ok(())
    }

    /// 竞争领导权并把引擎配置到相应角色。
    async fn assume_role(&mut self) -> McmResult<Role> {
        if self.ctx.leader.try_acquire().await? {
            self.promote().await
        } else {
            self.become_follower().await
        }
    }

    /// 晋升：追平中继日志、清复制配置、放开写入、对外宣告。
    async fn promote(&mut self) -> McmResult<Role> {
        info!("promoting to replication leader");
        self.wait_replication_drained().await;

        if let Err(err) = self.ctx.engine.clear_follower_config().await {
            error!(%err, "failed to clear the follower configuration");
            self.state = NodeState::Degraded;
            return Err(err.into());
        }

        self.announce_role(true).await;
        Ok(Role::Leader)
    }

    /// 降级/入从：收紧写入并指向现任主节点。
    async fn become_follower(&mut self) -> McmResult<Role> {
        let leader = self.ctx.leader.leader_address().await?;
        match leader {
            Some(addr) if addr != self.ctx.address => {
                if let Err(err) = self.ctx.engine.configure_follower(&addr).await {
                    error!(%err, leader = %addr, "failed to configure replication");
                    self.state = NodeState::Degraded;
                    return Err(err.into());
                }
            }
            _ => {
                // 主节点未知（或记录仍指向本机的旧会话）：先收紧写入，
                // 下一个 tick 再竞争或跟随。
                if let Err(err) = self.ctx.engine.set_read_only().await {
                    error!(%err, "failed to set the engine read-only");
                    self.state = NodeState::Degraded;
                    return Err(err.into());
                }
            }
        }

        self.announce_role(false).await;
        Ok(Role::Follower)
    }

    /// 晋升前给中继日志一个追平窗口；源已消失时等待自然落空。
    async fn wait_replication_drained(&self) {
        match self.ctx.engine.replication_source().await {
            Ok(Some(_)) => {}
            _ => return,
        }
        let deadline = tokio::time::Instant::now() + DRAIN_WAIT;
        while tokio::time::Instant::now() < deadline {
            match self.ctx.engine.replication_drained().await {
                Ok(true) => return,
                Ok(false) => tokio::time::sleep(Duration::from_secs(1)).await,
                Err(err) => {
                    warn!(%err, "replica status unavailable while draining");
                    return;
                }
            }
        }
        warn!("relay log did not drain in time, promoting anyway");
    }

    /// 服务目录里的角色标签（尽力而为）。
    async fn announce_role(&self, leader: bool) {
        if let Err(err) = self
            .ctx
            .client
            .register_service(&self.ctx.address, leader, self.ctx.engine.config().port)
            .await
        {
            warn!(%err, "service catalog registration failed");
        }
    }

    /// 发布引擎版本与服务器 ID（尽力而为；下一 tick 可重试）。
    async fn publish_identity(&self) {
        let Some(server_id) = self.server_id else { return };
        let version = match self.ctx.engine.version().await {
            Ok(version) => version,
            Err(err) => {
                warn!(%err, "engine version probe failed");
                return;
            }
        };
        if let Err(err) = self
            .ctx
            .registry
            .set_fields(FieldPatch::identity(server_id, version))
            .await
        {
            warn!(%err, "publishing identity fields failed");
        }
    }

    /// Running 态的一个 tick。
    async fn tick(&mut self, role: Role) -> McmResult<()> {
        // 1. 会话体检：刷新工作者报告丢失，或会话为空。
        if self.session_lost_rx.try_recv().is_ok() || self.ctx.client.session_opt().is_none() {
            warn!("session lost, re-entering the cluster");
            self.state = NodeState::WaitCoord;
            return Ok(());
        }

        let mut role = role;

        // 2. 从节点：主节点记录空缺时竞争领导权。
        if role == Role::Follower {
            match self.ctx.leader.leader_address().await? {
                None => {
                    if self.ctx.leader.try_acquire().await? {
                        role = self.promote().await?;
                    }
                }
                Some(leader) if leader != self.ctx.address => {
                    // 主节点易主后把复制指向新主。
                    let source = self.ctx.engine.replication_source().await.ok().flatten();
                    if source.as_deref() != Some(leader.as_str()) {
                        info!(leader = %leader, "replication source changed, reconfiguring");
                        if let Err(err) = self.ctx.engine.configure_follower(&leader).await {
                            warn!(%err, "failed to re-point replication");
                        }
                    }
                }
                Some(_) => {}
            }
        }

        // 3. 主节点：领导权自检，失位即降级。
        if role == Role::Leader && !self.ctx.leader.am_leader().await? {
            warn!("leadership lost, demoting");
            role = self.become_follower().await?;
        }

        // 4. 路由器对齐注册表。
        self.refresh_router(role).await;

        // 5. 从节点的快照调度；主节点绝不从写者取快照。
        if role == Role::Follower {
            self.schedule_snapshot_if_due().await;
        }

        self.state = NodeState::Running(role);

        // 等下一个 tick；停机与会话丢失都要能把等待打断。
        tokio::select! {
            _ = self.shutdown_rx.changed() => {}
            _ = tokio::time::sleep(TICK) => {}
        }
        Ok(())
    }

    /// 把路由器写组/读组对齐到注册表。
    async fn refresh_router(&self, role: Role) {
        let live = match self.ctx.registry.list_live().await {
            Ok(live) => live,
            Err(err) => {
                warn!(%err, "registry scan for router sync failed");
                return;
            }
        };
        let leader = match self.ctx.leader.leader_address().await {
            Ok(leader) => leader,
            Err(err) => {
                warn!(%err, "leader lookup for router sync failed");
                return;
            }
        };
        let leader = leader.or_else(|| (role == Role::Leader).then(|| self.ctx.address.clone()));

        let (writer, readers) = split_backends(&live, leader.as_deref());
        if let Err(err) = self.ctx.router.sync_backends(writer.as_deref(), &readers).await {
            warn!(%err, "router backend sync failed");
        }
    }

    /// 快照缺失或超龄时在后台工作者里创建；每节点至多一个在飞。
    async fn schedule_snapshot_if_due(&mut self) {
        if let Some(worker) = &self.snapshot_worker {
            if !worker.is_finished() {
                return;
            }
            if let Some(worker) = self.snapshot_worker.take() {
                let _ = worker.await;
            }
        }

        if !snapshot_due(self.ctx.snapshots.age(), self.ctx.settings.snapshot.interval) {
            return;
        }

        info!("snapshot missing or stale, starting a snapshot worker");
        let store = Arc::clone(&self.ctx.snapshots);
        self.snapshot_worker = Some(tokio::spawn(async move {
            // 备份恒在从节点上跑，因此带安全从库选项。
            if let Err(err) = store.create(false).await {
                error!(%err, "scheduled snapshot failed");
            }
        }));
    }

    /// 停机路径：注销、停库、销毁会话。
    async fn enter_stopping(&mut self) {
        info!("shutting down");

        if let Some(worker) = self.snapshot_worker.take() {
            if !worker.is_finished() {
                warn!("aborting the in-flight snapshot worker");
                worker.abort();
            }
        }

        if let Err(err) = self.ctx.client.deregister_service(&self.ctx.address).await {
            warn!(%err, "service deregistration failed");
        }

        // 先从注册表退出并让路由器收敛，再停引擎，避免路由器把查询
        // 发给一个正在关闭的后端。
        if let Err(err) = self.ctx.registry.deregister().await {
            warn!(%err, "registry deregistration failed");
        }
        self.refresh_router(Role::Follower).await;

        if let Some(mut process) = self.engine_process.take() {
            if let Err(err) = self.ctx.engine.stop(&mut process).await {
                warn!(%err, "engine shutdown failed");
            }
        }

        // 会话销毁连带移除节点记录与（若持有）主节点记录。
        if let Err(err) = self.ctx.client.session_destroy_current().await {
            warn!(%err, "session destruction failed");
        }
        info!("shutdown complete");
    }
}

/// 快照是否到期：不存在即到期，超过间隔即到期。
fn snapshot_due(age: Option<Duration>, interval: Duration) -> bool {
    age.is_none_or(|age| age > interval)
}

/// 把存活节点拆成写者与读者集合。
fn split_backends(live: &[NodeRecord], leader: Option<&str>) -> (Option<String>, Vec<String>) {
    let writer = leader
        .filter(|addr| live.iter().any(|node| node.address == *addr))
        .map(str::to_string);
    let readers = live
        .iter()
        .filter(|node| Some(node.address.as_str()) != leader)
        .map(|node| node.address.clone())
        .collect();
    (writer, readers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_due_when_missing_or_stale() {
        let interval = Duration::from_secs(900);
        assert!(snapshot_due(None, interval));
        assert!(snapshot_due(Some(Duration::from_secs(901)), interval));
        assert!(!snapshot_due(Some(Duration::from_secs(600)), interval));
    }

    fn node(address: &str) -> NodeRecord {
        NodeRecord::new(address)
    }

    #[test]
    fn backends_split_into_one_writer_and_the_rest() {
        let live = vec![node("10.0.0.1"), node("10.0.0.2"), node("10.0.0.3")];
        let (writer, readers) = split_backends(&live, Some("10.0.0.1"));
        assert_eq!(writer.as_deref(), Some("10.0.0.1"));
        assert_eq!(readers, vec!["10.0.0.2".to_string(), "10.0.0.3".to_string()]);
    }

    #[test]
    fn a_leader_missing_from_the_registry_is_not_a_writer() {
        let live = vec![node("10.0.0.2"), node("10.0.0.3")];
        let (writer, readers) = split_backends(&live, Some("10.0.0.1"));
        assert_eq!(writer, None);
        assert_eq!(readers.len(), 2);
    }

    #[test]
    fn no_leader_means_no_writer() {
        let live = vec![node("10.0.0.2")];
        let (writer, readers) = split_backends(&live, None);
        assert_eq!(writer, None);
        assert_eq!(readers, vec!["10.0.0.2".to_string()]);
    }
}
