//! Registry of per-remote-node processors under one root directory.
//!
//! Processors are created lazily on the first write destined for a node and
//! revived from their numbered directories on open.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crate::config::HintedHandoffConfig;
use crate::line::Point;
use crate::meta::MetaError;
use crate::metrics::{self, MetricEvent};

use super::node_processor::NodeProcessor;
use super::{ClusterView, HhError, HhResult, ShardWriter};

struct ServiceState {
    open: bool,
    processors: HashMap<u64, Arc<NodeProcessor>>,
}

pub struct HintedHandoff {
    config: HintedHandoffConfig,
    meta: Arc<dyn ClusterView>,
    writer: Arc<dyn ShardWriter>,
    state: Mutex<ServiceState>,
}

impl HintedHandoff {
    pub fn new(
        config: HintedHandoffConfig,
        writer: Arc<dyn ShardWriter>,
        meta: Arc<dyn ClusterView>,
    ) -> Self {
        Self {
            config,
            meta,
            writer,
            state: Mutex::new(ServiceState {
                open: false,
                processors: HashMap::new(),
            }),
        }
    }

    fn node_dir(&self, node_id: u64) -> PathBuf {
        self.config.dir.join(node_id.to_string())
    }

    /// Scans the root directory and revives a processor for every numbered
    /// node directory found there.
    pub fn open(&self) -> HhResult<()> {
        let mut state = self.state.lock().expect("service lock poisoned");
        if state.open {
            return Ok(());
        }

        fs::create_dir_all(&self.config.dir).map_err(|source| HhError::Io {
            path: self.config.dir.clone(),
            source,
        })?;

        let entries = fs::read_dir(&self.config.dir).map_err(|source| HhError::Io {
            path: self.config.dir.clone(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| HhError::Io {
                path: self.config.dir.clone(),
                source,
            })?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let node_id: u64 = name
                .parse()
                .map_err(|_| HhError::InvalidNodeDir { name: name.clone() })?;
            let processor = Arc::new(NodeProcessor::new(
                node_id,
                &entry.path(),
                &self.config,
                self.writer.clone(),
                self.meta.clone(),
            ));
            processor.open()?;
            tracing::info!(node_id, "revived hinted-handoff processor");
            state.processors.insert(node_id, processor);
        }

        state.open = true;
        Ok(())
    }

    pub fn close(&self) -> HhResult<()> {
        let mut state = self.state.lock().expect("service lock poisoned");
        if !state.open {
            return Ok(());
        }
        for processor in state.processors.values() {
            processor.close()?;
        }
        state.open = false;
        Ok(())
    }

    /// Buffers a shard write for an unreachable owner node, creating the
    /// node's processor on first use.
    pub fn write_shard(&self, shard_id: u64, owner_node_id: u64, points: &[Point]) -> HhResult<()> {
        let processor = {
            let mut state = self.state.lock().expect("service lock poisoned");
            if !state.open {
                return Err(HhError::Closed);
            }
            match state.processors.get(&owner_node_id) {
                Some(processor) => processor.clone(),
                None => {
                    let processor = Arc::new(NodeProcessor::new(
                        owner_node_id,
                        &self.node_dir(owner_node_id),
                        &self.config,
                        self.writer.clone(),
                        self.meta.clone(),
                    ));
                    processor.open()?;
                    state.processors.insert(owner_node_id, processor.clone());
                    processor
                }
            }
        };
        processor.write_shard(shard_id, points)
    }

    /// Closes and purges processors for nodes that no longer exist in the
    /// metadata and whose queue has been idle longer than `min_idle`.
    pub fn purge_inactive(&self, min_idle: Duration) -> HhResult<()> {
        let mut state = self.state.lock().expect("service lock poisoned");
        let cutoff = SystemTime::now()
            .checked_sub(min_idle)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut departed = Vec::new();
        for (node_id, processor) in &state.processors {
            match self.meta.data_node(*node_id) {
                Ok(_) => continue,
                Err(MetaError::NodeNotFound { .. }) => {}
                Err(err) => return Err(HhError::Meta(err)),
            }
            let last_modified = processor.last_modified()?;
            if last_modified < cutoff {
                departed.push(*node_id);
            }
        }

        for node_id in departed {
            if let Some(processor) = state.processors.remove(&node_id) {
                processor.close()?;
                processor.purge()?;
                tracing::info!(node_id, "purged hinted-handoff data for departed node");
            }
        }
        Ok(())
    }

    /// Counter snapshots across every processor.
    pub fn statistics(&self, tags: &[(&'static str, String)]) -> Vec<MetricEvent> {
        let state = self.state.lock().expect("service lock poisoned");
        let mut events = Vec::new();
        for processor in state.processors.values() {
            events.extend(processor.statistics(tags));
        }
        events
    }

    /// Emits the current statistics through the metric sink.
    pub fn report_statistics(&self, tags: &[(&'static str, String)]) {
        for event in self.statistics(tags) {
            metrics::record(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::NodeInfo;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex as StdMutex;
    use std::time::Instant;

    struct MutableView {
        nodes: StdMutex<Vec<u64>>,
    }

    impl MutableView {
        fn with_nodes(nodes: &[u64]) -> Arc<Self> {
            Arc::new(Self {
                nodes: StdMutex::new(nodes.to_vec()),
            })
        }

        fn remove(&self, id: u64) {
            self.nodes.lock().unwrap().retain(|n| *n != id);
        }
    }

    impl ClusterView for MutableView {
        fn data_node(&self, id: u64) -> Result<NodeInfo, MetaError> {
            if self.nodes.lock().unwrap().contains(&id) {
                Ok(NodeInfo {
                    id,
                    host: format!("node-{id}:8086"),
                    tcp_host: format!("node-{id}:8088"),
                    frozen: false,
                })
            } else {
                Err(MetaError::NodeNotFound { id })
            }
        }
    }

    struct CountingWriter {
        accepted: StdMutex<Vec<(u64, u64)>>,
    }

    impl CountingWriter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                accepted: StdMutex::new(Vec::new()),
            })
        }
    }

    impl ShardWriter for CountingWriter {
        fn write_shard(&self, shard_id: u64, node_id: u64, _points: &[Point]) -> HhResult<()> {
            self.accepted.lock().unwrap().push((shard_id, node_id));
            Ok(())
        }
    }

    fn fast_config(dir: &std::path::Path) -> HintedHandoffConfig {
        HintedHandoffConfig {
            dir: dir.to_path_buf(),
            retry_interval_ms: 10,
            retry_max_interval_ms: 100,
            ..HintedHandoffConfig::default()
        }
    }

    fn point() -> Vec<Point> {
        vec![Point::parse("cpu value=1").unwrap()]
    }

    fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        f()
    }

    #[test]
    fn write_rejected_while_closed() {
        let dir = tempfile::tempdir().unwrap();
        let service = HintedHandoff::new(
            fast_config(dir.path()),
            CountingWriter::new(),
            MutableView::with_nodes(&[1]),
        );
        assert!(matches!(
            service.write_shard(1, 1, &point()),
            Err(HhError::Closed)
        ));
    }

    #[test]
    fn processors_are_created_lazily_per_node() {
        let dir = tempfile::tempdir().unwrap();
        let writer = CountingWriter::new();
        let service = HintedHandoff::new(
            fast_config(dir.path()),
            writer.clone(),
            MutableView::with_nodes(&[1, 2]),
        );
        service.open().unwrap();

        service.write_shard(100, 1, &point()).unwrap();
        service.write_shard(200, 2, &point()).unwrap();
        assert!(dir.path().join("1").is_dir());
        assert!(dir.path().join("2").is_dir());

        assert!(wait_until(Duration::from_secs(5), || {
            writer.accepted.lock().unwrap().len() == 2
        }));
        let mut nodes: Vec<u64> = writer.accepted.lock().unwrap().iter().map(|w| w.1).collect();
        nodes.sort_unstable();
        assert_eq!(nodes, vec![1, 2]);
        service.close().unwrap();
    }

    #[test]
    fn open_revives_existing_node_directories() {
        let dir = tempfile::tempdir().unwrap();
        let view = MutableView::with_nodes(&[3]);

        // First life: buffer a write while the remote is gone, then close.
        {
            let writer = CountingWriter::new();
            let service =
                HintedHandoff::new(fast_config(dir.path()), writer, MutableView::with_nodes(&[]));
            service.open().unwrap();
            service.write_shard(300, 3, &point()).unwrap();
            service.close().unwrap();
        }

        // Second life: the revived processor drains to the returned node.
        let writer = CountingWriter::new();
        let service = HintedHandoff::new(fast_config(dir.path()), writer.clone(), view);
        service.open().unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            writer.accepted.lock().unwrap().len() == 1
        }));
        assert_eq!(writer.accepted.lock().unwrap()[0], (300, 3));
        service.close().unwrap();
    }

    #[test]
    fn open_rejects_foreign_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("not-a-node")).unwrap();
        let service = HintedHandoff::new(
            fast_config(dir.path()),
            CountingWriter::new(),
            MutableView::with_nodes(&[]),
        );
        assert!(matches!(
            service.open(),
            Err(HhError::InvalidNodeDir { .. })
        ));
    }

    #[test]
    fn purge_inactive_drops_departed_idle_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let view = MutableView::with_nodes(&[4, 5]);
        let writer = CountingWriter::new();
        let service = HintedHandoff::new(fast_config(dir.path()), writer, view.clone());
        service.open().unwrap();

        service.write_shard(1, 4, &point()).unwrap();
        service.write_shard(2, 5, &point()).unwrap();

        // Let the still-present node drain before judging idleness.
        let reachable_stats = {
            let state = service.state.lock().unwrap();
            state.processors.get(&4).unwrap().statistics_handle()
        };
        assert!(wait_until(Duration::from_secs(5), || {
            reachable_stats.write_node_req.load(Ordering::SeqCst) == 1
        }));

        // Node 5 leaves the cluster; with a zero idle threshold its queue
        // counts as idle immediately.
        view.remove(5);

        service.purge_inactive(Duration::ZERO).unwrap();
        {
            let state = service.state.lock().unwrap();
            assert!(state.processors.contains_key(&4));
            assert!(!state.processors.contains_key(&5));
        }
        assert!(!dir.path().join("5").exists());
        assert!(dir.path().join("4").is_dir());
        service.close().unwrap();
    }

    #[test]
    fn statistics_cover_every_processor() {
        let dir = tempfile::tempdir().unwrap();
        let service = HintedHandoff::new(
            fast_config(dir.path()),
            CountingWriter::new(),
            MutableView::with_nodes(&[6, 7]),
        );
        service.open().unwrap();
        service.write_shard(1, 6, &point()).unwrap();
        service.write_shard(2, 7, &point()).unwrap();

        let events = service.statistics(&[("host", "local".to_string())]);
        // Six metrics per processor.
        assert_eq!(events.len(), 12);
        service.report_statistics(&[]);
        service.close().unwrap();
    }
}
