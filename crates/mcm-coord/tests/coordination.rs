//! 协调层语义测试：领导权唯一性、会话生命周期、ID 分配与注册表
//! 读-改-写，全部跑在进程内后端上。

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use mcm_core::{FailureClass, FieldPatch, RetryPolicy};
use mcm_coord::{
    CoordBackend, CoordClient, IdAllocator, KvEntry, LeaderLock, MemoryCoord, NodeRegistry,
    PutMode,
};

const SESSION_TTL: Duration = Duration::from_secs(15);

fn client(backend: &Arc<MemoryCoord>) -> Arc<CoordClient> {
    let short = RetryPolicy::new(3, Duration::from_millis(10));
    Arc::new(CoordClient::with_policies(
        Arc::clone(backend) as Arc<dyn CoordBackend>,
        "mcm/",
        short,
        short,
    ))
}

async fn session(client: &CoordClient) -> String {
    client
        .session_create("mcm/instances", SESSION_TTL)
        .await
        .expect("会话创建应成功")
}

#[tokio::test]
async fn at_most_one_node_acquires_leadership() {
    let backend = Arc::new(MemoryCoord::new());
    let mut locks = Vec::new();
    for i in 0..3 {
        let c = client(&backend);
        session(&c).await;
        locks.push(LeaderLock::new(c, format!("10.0.0.{i}")));
    }

    let results = join_all(locks.iter().map(|lock| lock.try_acquire())).await;
    let winners = results
        .iter()
        .filter(|r| *r.as_ref().expect("竞争本身不应报错"))
        .count();
    assert_eq!(winners, 1);

    let mut leaders = 0;
    for lock in &locks {
        if lock.am_leader().await.unwrap() {
            leaders += 1;
        }
    }
    assert_eq!(leaders, 1);
}

#[tokio::test]
async fn leader_loss_allows_exactly_one_successor() {
    let backend = Arc::new(MemoryCoord::new());

    let a = client(&backend);
    let a_session = session(&a).await;
    let a_lock = LeaderLock::new(Arc::clone(&a), "10.0.0.1");
    assert!(a_lock.try_acquire().await.unwrap());

    let b = client(&backend);
    session(&b).await;
    let b_lock = LeaderLock::new(Arc::clone(&b), "10.0.0.2");
    let c = client(&backend);
    session(&c).await;
    let c_lock = LeaderLock::new(Arc::clone(&c), "10.0.0.3");

    assert!(!b_lock.try_acquire().await.unwrap());

    // A 的会话过期，记录随之消失。
    backend.expire_session(&a_session);
    assert!(b_lock.leader_address().await.unwrap().is_none());

    let results = join_all([b_lock.try_acquire(), c_lock.try_acquire()]).await;
    let winners = results.iter().filter(|r| *r.as_ref().unwrap()).count();
    assert_eq!(winners, 1);
    assert!(!a_lock.am_leader().await.unwrap());
}

#[tokio::test]
async fn recreated_session_competes_fresh_for_leadership() {
    let backend = Arc::new(MemoryCoord::new());
    let a = client(&backend);
    let first = session(&a).await;
    let lock = LeaderLock::new(Arc::clone(&a), "10.0.0.1");
    assert!(lock.try_acquire().await.unwrap());

    backend.expire_session(&first);
    session(&a).await;

    // 新会话不会继承旧记录：必须重新竞争。
    assert!(!lock.am_leader().await.unwrap());
    assert!(lock.try_acquire().await.unwrap());
    assert!(lock.am_leader().await.unwrap());
}

#[tokio::test]
async fn node_record_lives_and_dies_with_the_session() {
    let backend = Arc::new(MemoryCoord::new());
    let c = client(&backend);
    let sid = session(&c).await;
    let registry = NodeRegistry::new(Arc::clone(&c), "10.0.0.7");

    registry.register().await.unwrap();
    assert!(registry.get_own().await.unwrap().is_some());

    backend.expire_session(&sid);
    assert!(registry.get_own().await.unwrap().is_none());
}

#[tokio::test]
async fn register_then_publish_then_destroy_leaves_no_residue() {
    let backend = Arc::new(MemoryCoord::new());
    let c = client(&backend);
    session(&c).await;
    let registry = NodeRegistry::new(Arc::clone(&c), "10.0.0.7");

    registry.register().await.unwrap();
    registry
        .set_fields(FieldPatch::identity(3, "8.0.39"))
        .await
        .unwrap();

    let live = registry.list_live().await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].server_id, Some(3));
    assert_eq!(live[0].engine_version.as_deref(), Some("8.0.39"));

    c.session_destroy_current().await.unwrap();
    assert!(registry.list_live().await.unwrap().is_empty());
}

#[tokio::test]
async fn set_fields_without_a_record_demands_re_registration() {
    let backend = Arc::new(MemoryCoord::new());
    let c = client(&backend);
    session(&c).await;
    let registry = NodeRegistry::new(Arc::clone(&c), "10.0.0.7");

    let err = registry
        .set_fields(FieldPatch::restoring(true))
        .await
        .unwrap_err();
    assert_eq!(err.class(), FailureClass::SessionLost);
}

#[tokio::test]
async fn nodes_with_operations_in_progress_are_not_routable() {
    let backend = Arc::new(MemoryCoord::new());

    let a = client(&backend);
    session(&a).await;
    let reg_a = NodeRegistry::new(Arc::clone(&a), "10.0.0.1");
    reg_a.register().await.unwrap();

    let b = client(&backend);
    session(&b).await;
    let reg_b = NodeRegistry::new(Arc::clone(&b), "10.0.0.2");
    reg_b.register().await.unwrap();
    reg_b.set_fields(FieldPatch::restoring(true)).await.unwrap();

    let live = reg_a.list_live().await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].address, "10.0.0.1");

    assert!(reg_a.any_restoring().await.unwrap());
    assert!(!reg_a.any_snapshotting().await.unwrap());

    reg_b.set_fields(FieldPatch::restoring(false)).await.unwrap();
    assert!(!reg_a.any_restoring().await.unwrap());
    assert_eq!(reg_a.list_live().await.unwrap().len(), 2);
}

#[tokio::test]
async fn malformed_records_never_contribute_liveness() {
    let backend = Arc::new(MemoryCoord::new());
    let c = client(&backend);
    session(&c).await;
    let registry = NodeRegistry::new(Arc::clone(&c), "10.0.0.1");
    registry.register().await.unwrap();

    // 缺必填键的文档：协调服务不会拒收，解码层必须拒收。
    backend
        .kv_put(
            "mcm/instances/10.0.0.9",
            br#"{"restoring": true}"#.to_vec(),
            PutMode::Plain,
        )
        .await
        .unwrap();

    let live = registry.list_live().await.unwrap();
    assert_eq!(live.len(), 1);
    assert!(!registry.any_restoring().await.unwrap());
}

#[tokio::test]
async fn server_ids_are_unique_and_strictly_increasing() {
    let backend = Arc::new(MemoryCoord::new());

    let mut sequential = Vec::new();
    for _ in 0..3 {
        let c = client(&backend);
        sequential.push(IdAllocator::new(c).allocate().await.unwrap());
    }
    assert_eq!(sequential, vec![1, 2, 3]);

    let allocators: Vec<_> = (0..5).map(|_| IdAllocator::new(client(&backend))).collect();
    let mut concurrent: Vec<u64> = join_all(allocators.iter().map(|a| a.allocate()))
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    concurrent.sort_unstable();
    concurrent.dedup();
    assert_eq!(concurrent.len(), 5, "并发分配不得产生重复 ID");
    assert!(concurrent.iter().all(|id| *id > 3));
}

#[tokio::test]
async fn stale_cas_on_the_counter_fails_and_a_reread_produces_a_successor() {
    let backend = Arc::new(MemoryCoord::new());
    let c = client(&backend);
    let allocator = IdAllocator::new(Arc::clone(&c));

    assert_eq!(allocator.allocate().await.unwrap(), 1);
    let stale: KvEntry = backend.kv_get("mcm/server_id").await.unwrap().unwrap();

    assert_eq!(allocator.allocate().await.unwrap(), 2);

    // 用过期索引直接写：必须失败。
    let applied = backend
        .kv_put(
            "mcm/server_id",
            br#"{"last_used_id": 99}"#.to_vec(),
            PutMode::Cas(stale.modify_index),
        )
        .await
        .unwrap();
    assert!(!applied);

    assert_eq!(allocator.allocate().await.unwrap(), 3);
}

#[tokio::test(start_paused = true)]
async fn re_registration_inherits_an_unfinished_restore_flag() {
    let backend = Arc::new(MemoryCoord::new());

    let c1 = client(&backend);
    let s1 = session(&c1).await;
    let reg1 = NodeRegistry::new(Arc::clone(&c1), "10.0.0.7");
    reg1.register().await.unwrap();
    reg1.set_fields(FieldPatch::restoring(true)).await.unwrap();

    // 同一节点恢复中途崩溃后快速重启：新会话，旧会话尚未过期。
    let c2 = client(&backend);
    session(&c2).await;
    let reg2 = NodeRegistry::new(Arc::clone(&c2), "10.0.0.7");

    let expiry = tokio::spawn({
        let backend = Arc::clone(&backend);
        async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            backend.expire_session(&s1);
        }
    });

    reg2.register().await.unwrap();
    expiry.await.unwrap();

    let own = reg2.get_own().await.unwrap().expect("新记录应已绑定");
    assert!(own.restoring, "未完成的恢复旗标必须被继承");
}

#[tokio::test]
async fn short_outage_does_not_cost_leadership() {
    let backend = Arc::new(MemoryCoord::new());
    let a = client(&backend);
    let sid = session(&a).await;
    let lock = LeaderLock::new(Arc::clone(&a), "10.0.0.1");
    assert!(lock.try_acquire().await.unwrap());

    // 中断短于 TTL：会话未过期，恢复后领导权仍在。
    backend.set_reachable(false);
    assert!(a.session_renew(&sid).await.is_err());
    backend.set_reachable(true);
    a.session_renew(&sid).await.unwrap();
    assert!(lock.am_leader().await.unwrap());
}
