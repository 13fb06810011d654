//! Spec repository: the coordinator's control loops
//!
//! Owns the authoritative spec set. The three periodic operations
//! (refresh, expire, assign) each hold the repository mutex for their whole
//! duration, so two loops never interleave. Errors inside a loop are
//! logged and the loop moves on; nothing unwinds across the mutex.

use crate::execution::manager::BlockManager;
use crate::ingest::provider::SpecProvider;
use crate::meta::spec::TableRegistry;
use crate::meta::{ClusterInfo, NodeInfo, Spec, SpecState};
use crate::service::client::ClientMaker;
use crate::service::task::{Task, TaskState};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct SpecRepository {
    /// The repository mutex: every control loop holds it end to end
    tables: Mutex<BTreeMap<String, TableRegistry>>,
    cluster: Arc<ClusterInfo>,
    blocks: Arc<BlockManager>,
    provider: SpecProvider,
}

impl SpecRepository {
    pub fn new(cluster: Arc<ClusterInfo>, blocks: Arc<BlockManager>) -> Self {
        Self {
            tables: Mutex::new(BTreeMap::new()),
            cluster,
            blocks,
            provider: SpecProvider::new(),
        }
    }

    /// Enumerate the current spec snapshot for every configured table and
    /// merge it into the registries. A configuration error fails the whole
    /// cycle and keeps the previous spec set. Returns specs considered.
    pub fn refresh(&self) -> usize {
        let mut tables = self.tables.lock();

        let now = chrono::Utc::now().timestamp() as u64;
        let version = format!("{}.{}", self.cluster.version(), now);

        // generate everything first so a bad table leaves all registries
        // untouched
        let mut snapshots = Vec::new();
        for config in self.cluster.tables() {
            match self.provider.generate(&version, &config, now) {
                Ok(snapshot) => snapshots.push((config.name.clone(), snapshot)),
                Err(e) => {
                    log::error!("refresh failed on table {}: {}", config.name, e);
                    return 0;
                }
            }
        }

        let mut total = 0;
        for (table, snapshot) in snapshots {
            total += snapshot.len();
            tables
                .entry(table.clone())
                .or_insert_with(|| TableRegistry::new(table))
                .update(snapshot);
        }
        total
    }

    /// Poll every active node and take stale specs offline: anything a node
    /// holds that the registries no longer track gets one EXPIRATION task.
    /// Also reports node memory back to the cluster view. Returns pairs
    /// expired.
    pub fn expire(&self, client_maker: ClientMaker<'_>) -> usize {
        let tables = self.tables.lock();

        // stale empty-spec records would mask real losses
        self.blocks.clear_empty_specs();

        let mut total = 0;
        for node in self.cluster.nodes().into_iter().filter(|n| n.active) {
            let mut client = match client_maker(&node) {
                Ok(client) => client,
                Err(e) => {
                    log::warn!("no client for node {}: {}", node.addr, e);
                    continue;
                }
            };
            if let Err(e) = client.update() {
                log::warn!("poll of node {} failed: {}", node.addr, e);
                continue;
            }

            let expired = self.blocks.expired_on_node(&node.addr, |table, spec| {
                tables
                    .get(table)
                    .map(|registry| !registry.is_empty() && registry.online(spec))
                    .unwrap_or(false)
            });

            if !expired.is_empty() {
                let pairs: Vec<(String, String)> = expired.iter().cloned().collect();
                let count = pairs.len();
                let state = client.task(&Task::expire(pairs));
                log::info!(
                    "expire {} specs on node {}: {}",
                    count,
                    node.addr,
                    state.code()
                );
                total += count;
            }

            let memory = self.blocks.node_raw_bytes(&node.addr);
            self.cluster.update_node_size(&node.addr, memory);
        }
        total
    }

    /// Place unassigned specs round-robin over the active nodes (smallest
    /// reported size first) and send ingestion tasks for NEW/RENEW specs.
    /// Returns `(tasks sent, nodes considered)`.
    pub fn assign(&self, client_maker: ClientMaker<'_>) -> (usize, usize) {
        let mut tables = self.tables.lock();

        let mut nodes: Vec<NodeInfo> = self
            .cluster
            .nodes()
            .into_iter()
            .filter(|n| n.active)
            .collect();
        if nodes.is_empty() {
            log::warn!("no active node to assign specs");
            return (0, 0);
        }
        nodes.sort_by_key(|n| n.size);

        let active_specs = self.blocks.active_specs(&nodes);
        let empty_specs = self.blocks.empty_specs();

        let mut idx = 0usize;
        let mut tasks = 0usize;
        for registry in tables.values_mut() {
            for spec in registry.all_mut() {
                // an assigned spec unseen on any node (and not legitimately
                // empty) was lost; place it again
                if spec.assigned()
                    && !active_specs.contains(spec.id())
                    && !empty_specs.contains(spec.id())
                {
                    spec.reset();
                }

                if !spec.assigned() {
                    spec.assign(nodes[idx].addr.clone());
                    idx = (idx + 1) % nodes.len();
                }

                if !spec.needs_sync() {
                    continue;
                }
                tasks += 1;
                let addr = spec.affinity().expect("assigned above").to_string();
                let node = nodes
                    .iter()
                    .find(|n| n.addr == addr)
                    .cloned()
                    .unwrap_or_else(|| NodeInfo::new(addr.clone()));
                let mut client = match client_maker(&node) {
                    Ok(client) => client,
                    Err(e) => {
                        log::warn!("no client for node {}: {}", addr, e);
                        continue;
                    }
                };
                match client.task(&Task::ingest(spec.clone())) {
                    TaskState::Succeeded => spec.set_state(SpecState::Ready),
                    state @ (TaskState::Failed | TaskState::Queue) => {
                        // leave NEW/RENEW so the next cycle retries
                        log::warn!(
                            "task state {} at node {} | ingest:{}",
                            state.code(),
                            addr,
                            spec.id()
                        );
                    }
                    TaskState::InProgress => {}
                }
            }
        }
        (tasks, nodes.len())
    }

    /// A node disappeared: every spec assigned to it goes back to NEW with
    /// invalid affinity so the next assign cycle re-places it. Returns the
    /// number of specs reset.
    pub fn lost(&self, addr: &str) -> usize {
        let mut tables = self.tables.lock();
        let mut count = 0;
        for registry in tables.values_mut() {
            for spec in registry.all_mut() {
                if spec.assigned() && spec.affinity() == Some(addr) {
                    spec.reset();
                    count += 1;
                }
            }
        }
        count
    }

    /// Whether a spec is still tracked for its table
    pub fn online(&self, table: &str, spec_id: &str) -> bool {
        let tables = self.tables.lock();
        tables
            .get(table)
            .map(|registry| registry.online(spec_id))
            .unwrap_or(false)
    }

    /// Cloned view of every tracked spec, for metrics and tests
    pub fn snapshot(&self) -> Vec<Spec> {
        let tables = self.tables.lock();
        tables
            .values()
            .flat_map(|registry| registry.all().cloned().collect::<Vec<_>>())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::block::{BatchBlock, BlockSignature};
    use crate::execution::manager::TableStates;
    use crate::execution::table_state::TableState;
    use crate::meta::{ClusterConfig, TableConfig};
    use crate::service::client::{NodeClient, RowCursor};
    use crate::service::task::TaskPayload;
    use ahash::AHashMap;
    use std::collections::BTreeMap;

    /// Shared record of what every mock node has ingested
    #[derive(Default)]
    struct MockCluster {
        ingested: Mutex<AHashMap<String, Vec<Spec>>>,
    }

    struct MockClient {
        addr: String,
        world: Arc<MockCluster>,
        blocks: Arc<BlockManager>,
        fail_tasks: bool,
    }

    impl NodeClient for MockClient {
        fn update(&mut self) -> crate::Result<()> {
            let ingested = self.world.ingested.lock();
            let mut states = TableStates::new();
            if let Some(specs) = ingested.get(&self.addr) {
                for spec in specs {
                    let sign = BlockSignature {
                        table: spec.table.clone(),
                        spec_id: spec.id().to_string(),
                        id: 0,
                        time_start: spec.time_start,
                        time_end: spec.time_end,
                        storage_locator: spec.domain_locator.clone(),
                    };
                    states
                        .entry(spec.table.clone())
                        .or_insert_with(|| TableState::new(spec.table.clone()))
                        .add(Arc::new(BatchBlock::shadow(sign, 10, 100, vec![])));
                }
            }
            self.blocks.swap(&self.addr, states);
            Ok(())
        }

        fn task(&mut self, task: &Task) -> TaskState {
            if self.fail_tasks {
                return TaskState::Failed;
            }
            let mut ingested = self.world.ingested.lock();
            match &task.payload {
                TaskPayload::Ingest(spec) => {
                    ingested
                        .entry(self.addr.clone())
                        .or_default()
                        .push(spec.clone());
                }
                TaskPayload::Expire(pairs) => {
                    if let Some(specs) = ingested.get_mut(&self.addr) {
                        specs.retain(|s| {
                            !pairs
                                .iter()
                                .any(|(table, id)| *table == s.table && id == s.id())
                        });
                    }
                }
                TaskPayload::Command(_) => {}
            }
            TaskState::Succeeded
        }

        fn execute(&mut self, _plan: &crate::query::QueryPlan) -> crate::Result<RowCursor> {
            Ok(Box::new(std::iter::empty()))
        }
    }

    fn cluster_with(nodes: Vec<NodeInfo>, tables: Vec<TableConfig>) -> Arc<ClusterInfo> {
        Arc::new(ClusterInfo::new(ClusterConfig {
            version: "7".into(),
            nodes,
            tables,
        }))
    }

    fn hourly_table() -> TableConfig {
        TableConfig {
            name: "events".into(),
            // two retained hours → three hourly specs
            locator: "s3://n/dt={date}/hr={hour}".into(),
            retention_seconds: 2 * 3600,
            columns: vec![],
            macros: BTreeMap::new(),
        }
    }

    fn maker_for(
        world: &Arc<MockCluster>,
        blocks: &Arc<BlockManager>,
    ) -> impl Fn(&NodeInfo) -> crate::Result<Box<dyn NodeClient>> {
        let world = Arc::clone(world);
        let blocks = Arc::clone(blocks);
        move |node: &NodeInfo| {
            Ok(Box::new(MockClient {
                addr: node.addr.clone(),
                world: Arc::clone(&world),
                blocks: Arc::clone(&blocks),
                fail_tasks: false,
            }) as Box<dyn NodeClient>)
        }
    }

    #[test]
    fn test_assignment_prefers_smaller_nodes() {
        let mut n1 = NodeInfo::new("n1:9190");
        n1.size = 100;
        let mut n2 = NodeInfo::new("n2:9190");
        n2.size = 200;
        let cluster = cluster_with(vec![n2, n1], vec![hourly_table()]);
        let blocks = Arc::new(BlockManager::new());
        let repo = SpecRepository::new(cluster, Arc::clone(&blocks));
        let world = Arc::new(MockCluster::default());
        let maker = maker_for(&world, &blocks);

        assert_eq!(repo.refresh(), 3);
        let (tasks, nodes) = repo.assign(&maker);
        assert_eq!((tasks, nodes), (3, 2));

        // round-robin over the size-sorted list: the smaller node gets two
        let ingested = world.ingested.lock();
        assert_eq!(ingested.get("n1:9190").map(Vec::len), Some(2));
        assert_eq!(ingested.get("n2:9190").map(Vec::len), Some(1));
        drop(ingested);

        for spec in repo.snapshot() {
            assert_eq!(spec.state(), SpecState::Ready);
            assert!(spec.assigned());
        }
    }

    #[test]
    fn test_lost_node_reassigns_to_survivor() {
        let cluster = cluster_with(
            vec![NodeInfo::new("n1:9190"), NodeInfo::new("n2:9190")],
            vec![hourly_table()],
        );
        let blocks = Arc::new(BlockManager::new());
        let repo = SpecRepository::new(Arc::clone(&cluster), Arc::clone(&blocks));
        let world = Arc::new(MockCluster::default());
        let maker = maker_for(&world, &blocks);

        repo.refresh();
        repo.assign(&maker);
        // shadows must reflect the placements before the next assign
        repo.expire(&maker);

        let on_n1 = repo
            .snapshot()
            .iter()
            .filter(|s| s.affinity() == Some("n1:9190"))
            .count();
        assert!(on_n1 > 0);

        cluster.set_node_active("n1:9190", false);
        let reset = repo.lost("n1:9190");
        assert_eq!(reset, on_n1);

        let (tasks, nodes) = repo.assign(&maker);
        assert_eq!(nodes, 1);
        assert_eq!(tasks, reset);
        for spec in repo.snapshot() {
            assert_eq!(spec.affinity(), Some("n2:9190"));
            assert_eq!(spec.state(), SpecState::Ready);
        }
    }

    #[test]
    fn test_no_active_node_returns_zero() {
        let mut node = NodeInfo::new("n1:9190");
        node.active = false;
        let cluster = cluster_with(vec![node], vec![hourly_table()]);
        let blocks = Arc::new(BlockManager::new());
        let repo = SpecRepository::new(cluster, Arc::clone(&blocks));
        let world = Arc::new(MockCluster::default());
        let maker = maker_for(&world, &blocks);

        repo.refresh();
        assert_eq!(repo.assign(&maker), (0, 0));
    }

    #[test]
    fn test_failed_task_leaves_spec_new() {
        let cluster = cluster_with(vec![NodeInfo::new("n1:9190")], vec![hourly_table()]);
        let blocks = Arc::new(BlockManager::new());
        let repo = SpecRepository::new(cluster, Arc::clone(&blocks));
        let world = Arc::new(MockCluster::default());
        let failing = {
            let world = Arc::clone(&world);
            let blocks = Arc::clone(&blocks);
            move |node: &NodeInfo| {
                Ok(Box::new(MockClient {
                    addr: node.addr.clone(),
                    world: Arc::clone(&world),
                    blocks: Arc::clone(&blocks),
                    fail_tasks: true,
                }) as Box<dyn NodeClient>)
            }
        };

        repo.refresh();
        let (tasks, _) = repo.assign(&failing);
        assert_eq!(tasks, 3);
        for spec in repo.snapshot() {
            // still syncable so the next cycle retries
            assert_eq!(spec.state(), SpecState::New);
            assert!(spec.assigned());
        }
    }

    #[test]
    fn test_expire_removes_offline_specs() {
        let cluster = cluster_with(vec![NodeInfo::new("n1:9190")], vec![hourly_table()]);
        let blocks = Arc::new(BlockManager::new());
        let repo = SpecRepository::new(cluster, Arc::clone(&blocks));
        let world = Arc::new(MockCluster::default());
        let maker = maker_for(&world, &blocks);

        repo.refresh();
        repo.assign(&maker);

        // plant a stale spec the registries do not track
        world.ingested.lock().entry("n1:9190".into()).or_default().push(Spec::new(
            "0.0",
            "events",
            "s3://n/dt=1999-01-01/hr=00",
            0,
            3599,
            "",
        ));

        let expired = repo.expire(&maker);
        assert_eq!(expired, 1);
        assert!(world
            .ingested
            .lock()
            .get("n1:9190")
            .unwrap()
            .iter()
            .all(|s| repo.online(&s.table, s.id())));
    }

    #[test]
    fn test_reported_specs_subset_of_registry() {
        let cluster = cluster_with(
            vec![NodeInfo::new("n1:9190"), NodeInfo::new("n2:9190")],
            vec![hourly_table()],
        );
        let blocks = Arc::new(BlockManager::new());
        let repo = SpecRepository::new(cluster, Arc::clone(&blocks));
        let world = Arc::new(MockCluster::default());
        let maker = maker_for(&world, &blocks);

        repo.refresh();
        repo.assign(&maker);
        repo.expire(&maker);

        let registry_ids: Vec<String> =
            repo.snapshot().iter().map(|s| s.id().to_string()).collect();
        for specs in world.ingested.lock().values() {
            for spec in specs {
                assert!(registry_ids.contains(&spec.id().to_string()));
            }
        }
    }
}
