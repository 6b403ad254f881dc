//! In-process cluster harness.
//!
//! Every node runs the real stack (consensus core, segment storage,
//! snapshots) over a temporary directory, wired together through the
//! in-memory [`Router`]. Timers are shortened so tests converge fast.

use crate::fsm::{FsmProbe, TestFsm};
use crate::router::Router;
use anyhow::{Context, Result, bail};
use common::{Config, NodeId};
use raft::{Raft, RoleKind};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

/// One running node plus its observation handles.
pub struct TestNode {
    pub raft: Raft,
    pub probe: FsmProbe,
    pub dir: PathBuf,
}

/// A cluster of in-process nodes.
pub struct TestCluster {
    pub router: Router,
    pub nodes: BTreeMap<NodeId, TestNode>,
    config: Config,
    _tmp: TempDir,
}

fn address_of(id: NodeId) -> String {
    format!("node-{id}:7000")
}

impl TestCluster {
    /// Fast timers for test clusters.
    pub fn test_config() -> Config {
        Config::builder()
            .election_timeout(Duration::from_millis(150))
            .heartbeat_interval(Duration::from_millis(25))
            .tick_interval(Duration::from_millis(5))
            .build()
    }

    /// Bootstrap node 1, start it, then add and promote nodes `2..=n`
    /// as voters.
    pub async fn bootstrap(n: u64) -> Result<Self> {
        Self::bootstrap_with_config(n, Self::test_config()).await
    }

    pub async fn bootstrap_with_config(n: u64, config: Config) -> Result<Self> {
        crate::init_tracing();
        let tmp = TempDir::new()?;
        let mut cluster = TestCluster {
            router: Router::new(),
            nodes: BTreeMap::new(),
            config,
            _tmp: tmp,
        };

        let dir = cluster.node_dir(1);
        Raft::bootstrap(1, address_of(1), &dir, &cluster.config).await?;
        cluster.start_node(1).await?;
        cluster.wait_for_leader().await?;

        for id in 2..=n {
            cluster.start_node(id).await?;
            let leader = cluster.leader_handle().await?;
            leader
                .add_server(id, address_of(id))
                .await
                .with_context(|| format!("adding node {id}"))?;
            let leader = cluster.leader_handle().await?;
            leader
                .promote_server(id)
                .await
                .with_context(|| format!("promoting node {id}"))?;
        }
        Ok(cluster)
    }

    fn node_dir(&self, id: NodeId) -> PathBuf {
        self._tmp.path().join(format!("node-{id}"))
    }

    /// Start (or restart) a node over its data directory.
    pub async fn start_node(&mut self, id: NodeId) -> Result<()> {
        let dir = self.node_dir(id);
        let (fsm, probe) = TestFsm::new();
        let raft = Raft::start(
            id,
            &dir,
            self.config.clone(),
            self.router.network(id),
            fsm,
        )?;
        self.router.register(id, raft.clone());
        self.nodes.insert(id, TestNode { raft, probe, dir });
        Ok(())
    }

    /// Shut a node down and remove it from the router, keeping its data
    /// directory for a later restart.
    pub async fn stop_node(&mut self, id: NodeId) -> Result<()> {
        self.router.deregister(id);
        if let Some(node) = self.nodes.remove(&id) {
            node.raft.shutdown().await?;
        }
        Ok(())
    }

    pub fn node(&self, id: NodeId) -> &TestNode {
        &self.nodes[&id]
    }

    /// Wait until every node reports the same live leader.
    pub async fn wait_for_leader(&self) -> Result<NodeId> {
        self.wait_for_leader_within(Duration::from_secs(10)).await
    }

    pub async fn wait_for_leader_within(&self, timeout: Duration) -> Result<NodeId> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leader) = self.agreed_leader() {
                return Ok(leader);
            }
            if tokio::time::Instant::now() >= deadline {
                bail!("no agreed leader within {timeout:?}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn agreed_leader(&self) -> Option<NodeId> {
        let mut agreed = None;
        for node in self.nodes.values() {
            let metrics = node.raft.metrics().borrow().clone();
            let leader = metrics.leader?;
            match agreed {
                None => agreed = Some(leader),
                Some(previous) if previous != leader => return None,
                _ => {}
            }
        }
        let leader = agreed?;
        let metrics = self.nodes.get(&leader)?.raft.metrics().borrow().clone();
        (metrics.role == RoleKind::Leader).then_some(leader)
    }

    /// Handle of the current leader.
    pub async fn leader_handle(&self) -> Result<Raft> {
        let leader = self.wait_for_leader().await?;
        Ok(self.nodes[&leader].raft.clone())
    }

    /// Wait until every node has applied at least `index`.
    pub async fn wait_for_applied(&self, index: u64, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let lagging: Vec<NodeId> = self
                .nodes
                .iter()
                .filter(|(_, node)| node.raft.metrics().borrow().last_applied < index)
                .map(|(id, _)| *id)
                .collect();
            if lagging.is_empty() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                bail!("nodes {lagging:?} did not reach applied index {index} in {timeout:?}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Shut every node down.
    pub async fn shutdown(mut self) -> Result<()> {
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        for id in ids {
            self.stop_node(id).await?;
        }
        Ok(())
    }
}
