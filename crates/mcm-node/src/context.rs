//! 进程级装配。
//!
//! 所有单例在进程启动时构造一次，经由本结构按引用传递——没有环境
//! 全局量。各组件共享同一个协调客户端（因而共享同一个会话）。

use std::sync::Arc;

use mcm_coord::{ConsulCoord, CoordBackend, CoordClient, IdAllocator, LeaderLock, NodeRegistry};
use mcm_core::config::Settings;
use mcm_engine::{Engine, EngineConfig};
use mcm_router::{RouterBridge, RouterSettings};
use mcm_snapshot::{SnapshotConfig, SnapshotStore};

/// 控制循环及其工作者共享的应用上下文。
pub struct AppContext {
    pub settings: Settings,
    pub address: String,
    pub client: Arc<CoordClient>,
    pub registry: Arc<NodeRegistry>,
    pub leader: LeaderLock,
    pub allocator: IdAllocator,
    pub engine: Arc<Engine>,
    pub snapshots: Arc<SnapshotStore>,
    pub router: Arc<RouterBridge>,
}

impl AppContext {
    /// 以生产后端（HTTP 协调服务、默认引擎/路由器布局）装配。
    pub fn new(settings: Settings, address: String) -> Self {
        let backend: Arc<dyn CoordBackend> =
            Arc::new(ConsulCoord::new(settings.coordination.http_addr.clone()));
        Self::with_backend(settings, address, backend)
    }

    /// 以任意协调后端装配（测试注入进程内后端）。
    pub fn with_backend(
        settings: Settings,
        address: String,
        backend: Arc<dyn CoordBackend>,
    ) -> Self {
        let client = Arc::new(CoordClient::new(
            backend,
            settings.coordination.namespace.clone(),
        ));
        let registry = Arc::new(NodeRegistry::new(Arc::clone(&client), address.clone()));
        let leader = LeaderLock::new(Arc::clone(&client), address.clone());
        let allocator = IdAllocator::new(Arc::clone(&client));

        let engine_config = EngineConfig::default();
        let engine = Arc::new(Engine::new(engine_config.clone(), settings.accounts.clone()));

        let mut snapshot_config = SnapshotConfig::new(
            settings.snapshot.root.clone(),
            engine_config.datadir.clone(),
            settings.accounts.backup.clone(),
        );
        snapshot_config.service_user = engine_config.service_user.clone();
        let snapshots = Arc::new(SnapshotStore::new(snapshot_config, Arc::clone(&registry)));

        let router = Arc::new(RouterBridge::new(
            RouterSettings::default(),
            settings.accounts.clone(),
            settings.tls.clone(),
        ));

        Self {
            settings,
            address,
            client,
            registry,
            leader,
            allocator,
            engine,
            snapshots,
            router,
        }
    }
}
