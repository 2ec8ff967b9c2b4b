//! Per-remote-node processor: a durable queue plus the background loop that
//! drains it.
//!
//! The loop multiplexes a shutdown signal with two deadlines: a periodic
//! age-based purge and a send attempt whose period backs off exponentially
//! on failure, capped at the configured ceiling.

use std::cmp;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use crossbeam::channel::{at, bounded, Receiver, Sender};

use crate::config::HintedHandoffConfig;
use crate::line::Point;
use crate::meta::MetaError;
use crate::metrics::{MetricEvent, MetricLabel, MetricValue};

use super::codec::{marshal_write, unmarshal_write};
use super::limiter::RateLimiter;
use super::queue::{DiskQueue, Queue, QueuePosition};
use super::{ClusterView, HhError, HhResult, ShardWriter};

static MAX_ACTIVE_PROCESSORS: AtomicI32 = AtomicI32::new(0);
static ACTIVE_PROCESSORS: AtomicI32 = AtomicI32::new(0);

const CONCURRENCY_WAIT: Duration = Duration::from_secs(1);

/// Process-wide cap on concurrently sending processors. 0 disables the gate.
pub fn set_max_active_processors(n: i32) {
    MAX_ACTIVE_PROCESSORS.store(n, Ordering::SeqCst);
}

/// Spins on the shared counter for a bounded time trying to claim a send
/// slot. The gate is coarse; contention is between background loops only.
fn acquire_send_slot(timeout: Duration) -> Option<SendSlot> {
    let deadline = Instant::now() + timeout;
    loop {
        if ACTIVE_PROCESSORS.fetch_add(1, Ordering::SeqCst) + 1
            <= MAX_ACTIVE_PROCESSORS.load(Ordering::SeqCst)
        {
            return Some(SendSlot);
        }
        ACTIVE_PROCESSORS.fetch_sub(1, Ordering::SeqCst);
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::yield_now();
    }
}

struct SendSlot;

impl Drop for SendSlot {
    fn drop(&mut self) {
        ACTIVE_PROCESSORS.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
pub struct NodeProcessorStatistics {
    pub write_shard_req: AtomicI64,
    pub write_shard_req_points: AtomicI64,
    pub write_node_req: AtomicI64,
    pub write_node_req_fail: AtomicI64,
    pub write_node_req_points: AtomicI64,
}

struct Lifecycle {
    done: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

pub struct NodeProcessor {
    node_id: u64,
    dir: PathBuf,
    purge_interval: Duration,
    retry_interval: Duration,
    retry_max_interval: Duration,
    max_size: u64,
    max_age: Duration,
    retry_rate_limit: u64,
    queue: Arc<Mutex<Option<Box<dyn Queue>>>>,
    stats: Arc<NodeProcessorStatistics>,
    meta: Arc<dyn ClusterView>,
    writer: Arc<dyn ShardWriter>,
    lifecycle: Mutex<Lifecycle>,
}

/// Everything the background thread needs, snapshotted at open.
struct LoopCtx {
    node_id: u64,
    retry_interval: Duration,
    retry_max_interval: Duration,
    max_age: Duration,
    queue: Arc<Mutex<Option<Box<dyn Queue>>>>,
    stats: Arc<NodeProcessorStatistics>,
    meta: Arc<dyn ClusterView>,
    writer: Arc<dyn ShardWriter>,
    limiter: Option<RateLimiter>,
}

impl NodeProcessor {
    pub fn new(
        node_id: u64,
        dir: &Path,
        config: &HintedHandoffConfig,
        writer: Arc<dyn ShardWriter>,
        meta: Arc<dyn ClusterView>,
    ) -> Self {
        Self {
            node_id,
            dir: dir.to_path_buf(),
            purge_interval: config.purge_interval(),
            retry_interval: config.retry_interval(),
            retry_max_interval: config.retry_max_interval(),
            max_size: config.max_size,
            max_age: config.max_age(),
            retry_rate_limit: config.retry_rate_limit,
            queue: Arc::new(Mutex::new(None)),
            stats: Arc::new(NodeProcessorStatistics::default()),
            meta,
            writer,
            lifecycle: Mutex::new(Lifecycle {
                done: None,
                handle: None,
            }),
        }
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn statistics_handle(&self) -> Arc<NodeProcessorStatistics> {
        self.stats.clone()
    }

    /// Opens the queue directory and starts the background loop. Idempotent
    /// while already open.
    pub fn open(&self) -> HhResult<()> {
        let mut lifecycle = self.lifecycle.lock().expect("processor lock poisoned");
        if lifecycle.done.is_some() {
            return Ok(());
        }

        std::fs::create_dir_all(&self.dir).map_err(|source| HhError::Io {
            path: self.dir.clone(),
            source,
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.dir, std::fs::Permissions::from_mode(0o700)).map_err(
                |source| HhError::Io {
                    path: self.dir.clone(),
                    source,
                },
            )?;
        }

        let disk_queue = DiskQueue::open(&self.dir, self.max_size)?;
        *self.queue.lock().expect("queue lock poisoned") = Some(Box::new(disk_queue));

        let (done_tx, done_rx) = bounded::<()>(0);
        let ctx = LoopCtx {
            node_id: self.node_id,
            retry_interval: self.retry_interval,
            retry_max_interval: self.retry_max_interval,
            max_age: self.max_age,
            queue: self.queue.clone(),
            stats: self.stats.clone(),
            meta: self.meta.clone(),
            writer: self.writer.clone(),
            limiter: if self.retry_rate_limit > 0 {
                Some(RateLimiter::new(
                    self.retry_rate_limit,
                    10 * self.retry_rate_limit,
                ))
            } else {
                None
            },
        };
        let purge_interval = self.purge_interval;
        lifecycle.handle = Some(std::thread::spawn(move || {
            run(ctx, done_rx, purge_interval);
        }));
        lifecycle.done = Some(done_tx);
        Ok(())
    }

    /// Stops the loop (letting an in-flight send finish) and closes the
    /// queue. Idempotent while already closed.
    pub fn close(&self) -> HhResult<()> {
        let mut lifecycle = self.lifecycle.lock().expect("processor lock poisoned");
        if lifecycle.done.is_none() {
            return Ok(());
        }
        // Dropping the sender disconnects the loop's done channel.
        lifecycle.done = None;
        if let Some(handle) = lifecycle.handle.take() {
            let _ = handle.join();
        }
        if let Some(mut queue) = self.queue.lock().expect("queue lock poisoned").take() {
            queue.close()?;
        }
        Ok(())
    }

    /// Removes all hinted data under this processor. Requires closed.
    pub fn purge(&self) -> HhResult<()> {
        let lifecycle = self.lifecycle.lock().expect("processor lock poisoned");
        if lifecycle.done.is_some() {
            return Err(HhError::Open);
        }
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(HhError::Io {
                path: self.dir.clone(),
                source,
            }),
        }
    }

    /// Enqueues one shard write. Counters track every accepted request even
    /// if the append later fails.
    pub fn write_shard(&self, shard_id: u64, points: &[Point]) -> HhResult<()> {
        let mut queue = self.queue.lock().expect("queue lock poisoned");
        let Some(queue) = queue.as_mut() else {
            return Err(HhError::Closed);
        };
        self.stats.write_shard_req.fetch_add(1, Ordering::SeqCst);
        self.stats
            .write_shard_req_points
            .fetch_add(points.len() as i64, Ordering::SeqCst);
        let frame = marshal_write(shard_id, points);
        queue.append(&frame)?;
        Ok(())
    }

    pub fn last_modified(&self) -> HhResult<SystemTime> {
        let queue = self.queue.lock().expect("queue lock poisoned");
        match queue.as_ref() {
            Some(queue) => Ok(queue.last_modified()?),
            None => Err(HhError::Closed),
        }
    }

    pub fn position(&self) -> HhResult<QueuePosition> {
        let queue = self.queue.lock().expect("queue lock poisoned");
        match queue.as_ref() {
            Some(queue) => Ok(queue.position()),
            None => Err(HhError::Closed),
        }
    }

    pub fn head(&self) -> String {
        self.position().map(|p| p.head).unwrap_or_default()
    }

    pub fn tail(&self) -> String {
        self.position().map(|p| p.tail).unwrap_or_default()
    }

    pub fn queue_bytes(&self) -> u64 {
        let queue = self.queue.lock().expect("queue lock poisoned");
        queue.as_ref().map(|q| q.total_bytes()).unwrap_or(0)
    }

    /// One send attempt against the remote node; used by the background loop
    /// and directly by tests.
    pub fn send_write(&self) -> HhResult<usize> {
        send_write(
            self.node_id,
            &self.queue,
            &self.stats,
            self.meta.as_ref(),
            self.writer.as_ref(),
        )
    }

    /// Counter snapshot tagged by node and path.
    pub fn statistics(&self, tags: &[(&'static str, String)]) -> Vec<MetricEvent> {
        let mut labels = vec![
            MetricLabel::new("node", self.node_id.to_string()),
            MetricLabel::new("path", self.dir.display().to_string()),
        ];
        for (key, value) in tags {
            labels.push(MetricLabel::new(key, value.clone()));
        }
        let counter = |name: &'static str, value: &AtomicI64| MetricEvent {
            name,
            value: MetricValue::Counter(value.load(Ordering::SeqCst)),
            labels: labels.clone(),
        };
        vec![
            counter("hh_write_shard_req", &self.stats.write_shard_req),
            counter(
                "hh_write_shard_req_points",
                &self.stats.write_shard_req_points,
            ),
            counter("hh_write_node_req", &self.stats.write_node_req),
            counter("hh_write_node_req_fail", &self.stats.write_node_req_fail),
            counter(
                "hh_write_node_req_points",
                &self.stats.write_node_req_points,
            ),
            MetricEvent {
                name: "hh_queue_bytes",
                value: MetricValue::Gauge(self.queue_bytes()),
                labels: labels.clone(),
            },
        ]
    }
}

impl Drop for NodeProcessor {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn run(mut ctx: LoopCtx, done: Receiver<()>, purge_interval: Duration) {
    let mut wait = cmp::min(ctx.retry_interval, ctx.retry_max_interval);
    let mut next_purge = Instant::now() + purge_interval;
    let mut next_send = Instant::now() + wait;

    loop {
        crossbeam::select! {
            recv(done) -> _ => return,
            recv(at(next_purge)) -> _ => {
                purge_pass(&ctx);
                next_purge = Instant::now() + purge_interval;
            }
            recv(at(next_send)) -> _ => {
                wait = sending_pass(&mut ctx, wait);
                next_send = Instant::now() + wait;
            }
        }
    }
}

fn purge_pass(ctx: &LoopCtx) {
    let cutoff = SystemTime::now()
        .checked_sub(ctx.max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let mut queue = ctx.queue.lock().expect("queue lock poisoned");
    if let Some(queue) = queue.as_mut() {
        if let Err(err) = queue.purge_older_than(cutoff) {
            tracing::warn!(node_id = ctx.node_id, error = %err, "failed to purge");
        }
    }
}

/// One send attempt plus the next-delay computation.
fn sending_pass(ctx: &mut LoopCtx, cur_delay: Duration) -> Duration {
    let _slot = if MAX_ACTIVE_PROCESSORS.load(Ordering::SeqCst) > 0 {
        match acquire_send_slot(CONCURRENCY_WAIT) {
            Some(slot) => Some(slot),
            None => {
                tracing::info!(node_id = ctx.node_id, "concurrency control, skip scheduling once");
                return ctx.retry_interval;
            }
        }
    } else {
        None
    };

    let result = send_write(
        ctx.node_id,
        &ctx.queue,
        &ctx.stats,
        ctx.meta.as_ref(),
        ctx.writer.as_ref(),
    );

    if let Ok(sent) = &result {
        if *sent > 0 {
            if let Some(limiter) = ctx.limiter.as_mut() {
                tracing::info!(node_id = ctx.node_id, bytes = *sent, "throttling after write");
                limiter.wait_n(*sent as u64);
            }
        }
    }

    match result {
        Ok(_) => ctx.retry_interval,
        Err(err) if err.is_drained() => ctx.retry_interval,
        Err(_) => cmp::min(cur_delay * 2, ctx.retry_max_interval),
    }
}

/// Sends the frame at the queue head, advancing only after the remote
/// acknowledges it. Undecodable frames are logged and skipped.
fn send_write(
    node_id: u64,
    queue: &Mutex<Option<Box<dyn Queue>>>,
    stats: &NodeProcessorStatistics,
    meta: &dyn ClusterView,
    writer: &dyn ShardWriter,
) -> HhResult<usize> {
    match meta.data_node(node_id) {
        Ok(_) => {}
        Err(MetaError::NodeNotFound { .. }) => return Err(HhError::NodeInactive { node_id }),
        Err(err) => {
            tracing::warn!(node_id, error = %err, "failed to determine if node is active");
            return Err(HhError::Meta(err));
        }
    }

    let buf = {
        let mut guard = queue.lock().expect("queue lock poisoned");
        let Some(q) = guard.as_mut() else {
            return Err(HhError::Closed);
        };
        q.current()?
    };

    let (shard_id, points) = match unmarshal_write(&buf) {
        Ok(decoded) => decoded,
        Err(err) => {
            tracing::warn!(node_id, error = %err, "unmarshal write failed, skipping frame");
            let mut guard = queue.lock().expect("queue lock poisoned");
            if let Some(q) = guard.as_mut() {
                if let Err(advance_err) = q.advance() {
                    tracing::warn!(node_id, error = %advance_err, "failed to advance queue");
                }
            }
            return Err(err);
        }
    };

    // The queue lock is not held across the remote write; ingress keeps
    // appending while a send is in flight.
    if let Err(err) = writer.write_shard(shard_id, node_id, &points) {
        stats.write_node_req_fail.fetch_add(1, Ordering::SeqCst);
        return Err(err);
    }
    stats.write_node_req.fetch_add(1, Ordering::SeqCst);
    stats
        .write_node_req_points
        .fetch_add(points.len() as i64, Ordering::SeqCst);

    let mut guard = queue.lock().expect("queue lock poisoned");
    if let Some(q) = guard.as_mut() {
        if let Err(err) = q.advance() {
            tracing::warn!(node_id, error = %err, "failed to advance queue");
        }
    }
    Ok(buf.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::NodeInfo;
    use std::sync::Mutex as StdMutex;

    struct StaticView {
        node: Option<NodeInfo>,
    }

    impl ClusterView for StaticView {
        fn data_node(&self, id: u64) -> Result<NodeInfo, MetaError> {
            self.node
                .clone()
                .filter(|n| n.id == id)
                .ok_or(MetaError::NodeNotFound { id })
        }
    }

    fn view_with_node(id: u64) -> Arc<StaticView> {
        Arc::new(StaticView {
            node: Some(NodeInfo {
                id,
                host: format!("node-{id}:8086"),
                tcp_host: format!("node-{id}:8088"),
                frozen: false,
            }),
        })
    }

    fn view_without_node() -> Arc<StaticView> {
        Arc::new(StaticView { node: None })
    }

    /// Accepts or rejects writes according to a scripted outcome list; once
    /// the script is exhausted every write succeeds.
    struct ScriptedWriter {
        outcomes: StdMutex<Vec<bool>>,
        accepted: StdMutex<Vec<(u64, u64, Vec<Point>)>>,
    }

    impl ScriptedWriter {
        fn accepting() -> Arc<Self> {
            Self::scripted(vec![])
        }

        fn scripted(outcomes: Vec<bool>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: StdMutex::new(outcomes),
                accepted: StdMutex::new(Vec::new()),
            })
        }

        fn accepted(&self) -> Vec<(u64, u64, Vec<Point>)> {
            self.accepted.lock().unwrap().clone()
        }
    }

    impl ShardWriter for ScriptedWriter {
        fn write_shard(&self, shard_id: u64, node_id: u64, points: &[Point]) -> HhResult<()> {
            let mut outcomes = self.outcomes.lock().unwrap();
            let ok = if outcomes.is_empty() {
                true
            } else {
                outcomes.remove(0)
            };
            if !ok {
                return Err(HhError::WriteFailed {
                    node_id,
                    reason: "scripted failure".to_string(),
                });
            }
            self.accepted
                .lock()
                .unwrap()
                .push((shard_id, node_id, points.to_vec()));
            Ok(())
        }
    }

    fn fast_config() -> HintedHandoffConfig {
        HintedHandoffConfig {
            retry_interval_ms: 10,
            retry_max_interval_ms: 100,
            purge_interval_ms: 3_600_000,
            ..HintedHandoffConfig::default()
        }
    }

    fn points(lines: &[&str]) -> Vec<Point> {
        lines.iter().map(|l| Point::parse(l).unwrap()).collect()
    }

    // Tests below share the process-wide gate statics; the two that depend
    // on its exact state must not overlap.
    static GATE_LOCK: StdMutex<()> = StdMutex::new(());

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
    fn write_shard_rejected_while_closed() {
        let dir = tempfile::tempdir().unwrap();
        let p = NodeProcessor::new(
            1,
            dir.path(),
            &fast_config(),
            ScriptedWriter::accepting(),
            view_with_node(1),
        );
        let err = p
            .write_shard(1, &points(&["cpu value=1"]))
            .unwrap_err();
        assert!(matches!(err, HhError::Closed));
    }

    #[test]
    fn open_write_drain_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ScriptedWriter::accepting();
        let p = NodeProcessor::new(
            2,
            dir.path(),
            &fast_config(),
            writer.clone(),
            view_with_node(2),
        );
        p.open().unwrap();
        p.open().unwrap(); // idempotent

        let batch = points(&["cpu value=1 100", "cpu value=2 200"]);
        p.write_shard(42, &batch).unwrap();

        let stats = p.statistics_handle();
        assert!(wait_until(Duration::from_secs(5), || {
            stats.write_node_req.load(Ordering::SeqCst) == 1
        }));
        assert_eq!(stats.write_shard_req.load(Ordering::SeqCst), 1);
        assert_eq!(stats.write_shard_req_points.load(Ordering::SeqCst), 2);
        assert_eq!(stats.write_node_req_points.load(Ordering::SeqCst), 2);
        assert_eq!(stats.write_node_req_fail.load(Ordering::SeqCst), 0);

        let accepted = writer.accepted();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].0, 42);
        assert_eq!(accepted[0].1, 2);
        assert_eq!(accepted[0].2, batch);

        // The frame was consumed.
        assert!(matches!(
            p.send_write(),
            Err(HhError::Queue(crate::hh::QueueError::Empty))
        ));

        p.close().unwrap();
        p.close().unwrap(); // idempotent
    }

    #[test]
    fn inactive_node_never_reaches_writer() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ScriptedWriter::accepting();
        let p = NodeProcessor::new(
            3,
            dir.path(),
            &fast_config(),
            writer.clone(),
            view_without_node(),
        );
        p.open().unwrap();
        p.write_shard(1, &points(&["cpu value=1"])).unwrap();

        std::thread::sleep(Duration::from_millis(100));
        let stats = p.statistics_handle();
        assert_eq!(stats.write_node_req.load(Ordering::SeqCst), 0);
        assert_eq!(stats.write_node_req_fail.load(Ordering::SeqCst), 0);
        assert!(writer.accepted().is_empty());
        p.close().unwrap();
    }

    #[test]
    fn invariant_shard_points_never_below_node_points() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ScriptedWriter::accepting();
        let p = NodeProcessor::new(
            4,
            dir.path(),
            &fast_config(),
            writer,
            view_with_node(4),
        );
        p.open().unwrap();
        let stats = p.statistics_handle();
        for i in 0..5 {
            p.write_shard(i, &points(&["cpu value=1"])).unwrap();
            assert!(
                stats.write_shard_req_points.load(Ordering::SeqCst)
                    >= stats.write_node_req_points.load(Ordering::SeqCst)
            );
        }
        assert!(wait_until(Duration::from_secs(5), || {
            stats.write_node_req_points.load(Ordering::SeqCst) == 5
        }));
        p.close().unwrap();
    }

    #[test]
    fn delivery_preserves_append_order() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ScriptedWriter::scripted(vec![false, true, true, true]);
        let p = NodeProcessor::new(
            5,
            dir.path(),
            &fast_config(),
            writer.clone(),
            view_with_node(5),
        );
        p.open().unwrap();
        for i in 0..3u64 {
            p.write_shard(i, &points(&[&format!("cpu value={i}")])).unwrap();
        }
        let stats = p.statistics_handle();
        assert!(wait_until(Duration::from_secs(5), || {
            stats.write_node_req.load(Ordering::SeqCst) == 3
        }));
        let shard_ids: Vec<u64> = writer.accepted().iter().map(|w| w.0).collect();
        assert_eq!(shard_ids, vec![0, 1, 2]);
        assert_eq!(stats.write_node_req_fail.load(Ordering::SeqCst), 1);
        p.close().unwrap();
    }

    #[test]
    fn backoff_doubles_until_capped_and_resets_on_success() {
        let _gate = GATE_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let writer = ScriptedWriter::scripted(vec![false, false, false]);
        let p = NodeProcessor::new(6, dir.path(), &fast_config(), writer, view_with_node(6));
        // Drive the pass synchronously instead of via the loop thread.
        let config = fast_config();
        std::fs::create_dir_all(dir.path()).unwrap();
        let queue = DiskQueue::open(dir.path(), config.max_size).unwrap();
        *p.queue.lock().unwrap() = Some(Box::new(queue));
        p.write_shard(9, &points(&["cpu value=1"])).unwrap();

        let mut ctx = LoopCtx {
            node_id: 6,
            retry_interval: Duration::from_millis(100),
            retry_max_interval: Duration::from_millis(250),
            max_age: config.max_age(),
            queue: p.queue.clone(),
            stats: p.stats.clone(),
            meta: p.meta.clone(),
            writer: p.writer.clone(),
            limiter: None,
        };

        let base = Duration::from_millis(100);
        let d1 = sending_pass(&mut ctx, base);
        assert_eq!(d1, Duration::from_millis(200));
        let d2 = sending_pass(&mut ctx, d1);
        assert_eq!(d2, Duration::from_millis(250));
        let d3 = sending_pass(&mut ctx, d2);
        assert_eq!(d3, Duration::from_millis(250));
        // Script exhausted: the next attempt succeeds and resets the delay.
        let d4 = sending_pass(&mut ctx, d3);
        assert_eq!(d4, base);
        // Queue drained: stays at the base interval.
        let d5 = sending_pass(&mut ctx, d4);
        assert_eq!(d5, base);
    }

    #[test]
    fn poison_frame_is_skipped_then_drain_continues() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ScriptedWriter::accepting();
        let p = NodeProcessor::new(
            7,
            dir.path(),
            &fast_config(),
            writer.clone(),
            view_with_node(7),
        );
        p.open().unwrap();

        // A frame shorter than the shard id prefix cannot decode.
        {
            let mut guard = p.queue.lock().unwrap();
            guard.as_mut().unwrap().append(b"bad").unwrap();
        }
        p.write_shard(11, &points(&["cpu value=1"])).unwrap();

        let stats = p.statistics_handle();
        assert!(wait_until(Duration::from_secs(5), || {
            stats.write_node_req.load(Ordering::SeqCst) == 1
        }));
        assert_eq!(writer.accepted()[0].0, 11);
        p.close().unwrap();
    }

    #[test]
    fn purge_requires_closed() {
        let dir = tempfile::tempdir().unwrap();
        let p = NodeProcessor::new(
            8,
            dir.path().join("hh-8").as_path(),
            &fast_config(),
            ScriptedWriter::accepting(),
            view_with_node(8),
        );
        p.open().unwrap();
        assert!(matches!(p.purge(), Err(HhError::Open)));
        p.close().unwrap();
        p.purge().unwrap();
        assert!(!dir.path().join("hh-8").exists());
        // Purging an already-removed directory is fine.
        p.purge().unwrap();
    }

    #[test]
    fn reopen_after_close_is_supported() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ScriptedWriter::accepting();
        let p = NodeProcessor::new(
            9,
            dir.path(),
            &fast_config(),
            writer.clone(),
            view_with_node(9),
        );
        p.open().unwrap();
        p.close().unwrap();
        p.open().unwrap();
        p.write_shard(1, &points(&["cpu value=1"])).unwrap();
        let stats = p.statistics_handle();
        assert!(wait_until(Duration::from_secs(5), || {
            stats.write_node_req.load(Ordering::SeqCst) == 1
        }));
        p.close().unwrap();
    }

    #[test]
    fn concurrency_gate_bounds_active_senders() {
        let _gate = GATE_LOCK.lock().unwrap();
        set_max_active_processors(1);
        let first = acquire_send_slot(Duration::from_millis(50));
        assert!(first.is_some());
        let second = acquire_send_slot(Duration::from_millis(50));
        assert!(second.is_none());
        drop(first);
        let third = acquire_send_slot(Duration::from_millis(50));
        assert!(third.is_some());
        drop(third);
        set_max_active_processors(0);
    }

    #[test]
    fn statistics_are_tagged_by_node_and_path() {
        let dir = tempfile::tempdir().unwrap();
        let p = NodeProcessor::new(
            10,
            dir.path(),
            &fast_config(),
            ScriptedWriter::accepting(),
            view_with_node(10),
        );
        let events = p.statistics(&[("cluster", "test".to_string())]);
        assert_eq!(events.len(), 6);
        for event in &events {
            assert!(event.labels.iter().any(|l| l.key == "node" && l.value == "10"));
            assert!(event.labels.iter().any(|l| l.key == "path"));
            assert!(event.labels.iter().any(|l| l.key == "cluster"));
        }
        // Shard-side and node-side point counters are distinct metrics.
        assert!(events.iter().any(|e| e.name == "hh_write_shard_req_points"));
        assert!(events.iter().any(|e| e.name == "hh_write_node_req_points"));
    }
}
