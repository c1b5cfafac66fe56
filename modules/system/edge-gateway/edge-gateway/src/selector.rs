//! Weighted random node selection.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::time::Instant;

use crate::client::transport::NodeTransport;
use crate::error::GatewayError;
use crate::random::{RandomSource, SeededRandom, SharedRandom, shared};

/// Narrows the candidate set before weighting.
pub type NodeFilter = Arc<dyn Fn(&[Arc<Node>]) -> Vec<Arc<Node>> + Send + Sync>;

/// Observer notified whenever a selection completes.
pub type DoneHook = Arc<dyn Fn(&Node, &DoneInfo) + Send + Sync>;

/// Outcome reported when a selection completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoneInfo {
    /// `None` on success.
    pub error: Option<String>,
    pub elapsed: Duration,
}

impl DoneInfo {
    pub(crate) const ABANDONED: &'static str = "abandoned";
}

/// A resolved backend instance with its own pooled transport.
pub struct Node {
    address: String,
    weight: u32,
    service: Option<String>,
    transport: NodeTransport,
    inflight: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

impl Node {
    pub fn new(
        address: impl Into<String>,
        weight: u32,
        service: Option<String>,
        transport: NodeTransport,
    ) -> Self {
        Self {
            address: address.into(),
            weight,
            service,
            transport,
            inflight: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// `host:port` the node's transport connects to.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Discovery service this node was resolved from, if any.
    #[must_use]
    pub fn service(&self) -> Option<&str> {
        self.service.as_deref()
    }

    #[must_use]
    pub fn inflight(&self) -> u64 {
        self.inflight.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub(crate) fn transport(&self) -> NodeTransport {
        self.transport.clone()
    }

    fn record(&self, info: &DoneInfo) {
        self.inflight.fetch_sub(1, Ordering::Relaxed);
        if info.error.is_some() {
            self.failures.fetch_add(1, Ordering::Relaxed);
        } else {
            self.successes.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("address", &self.address)
            .field("weight", &self.weight)
            .field("service", &self.service)
            .field("inflight", &self.inflight())
            .finish_non_exhaustive()
    }
}

/// Completion guard of one selection.
///
/// The outcome is recorded exactly once: by [`done`](Self::done), or with an
/// "abandoned" error when the guard is dropped first.
#[must_use = "dropping the guard reports the selection as abandoned"]
pub struct DoneGuard {
    node: Arc<Node>,
    started: Instant,
    hook: Option<DoneHook>,
    finished: bool,
}

impl DoneGuard {
    fn new(node: Arc<Node>, hook: Option<DoneHook>) -> Self {
        node.inflight.fetch_add(1, Ordering::Relaxed);
        Self {
            node,
            started: Instant::now(),
            hook,
            finished: false,
        }
    }

    #[must_use]
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Time since the node was selected.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Report the outcome of the selection.
    pub fn done(mut self, error: Option<String>) {
        let info = DoneInfo {
            error,
            elapsed: self.elapsed(),
        };
        self.finish(&info);
    }

    fn finish(&mut self, info: &DoneInfo) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.node.record(info);
        if let Some(hook) = &self.hook {
            hook(&self.node, info);
        }
    }
}

impl Drop for DoneGuard {
    fn drop(&mut self) {
        if !self.finished {
            let info = DoneInfo {
                error: Some(DoneInfo::ABANDONED.to_owned()),
                elapsed: self.elapsed(),
            };
            self.finish(&info);
        }
    }
}

impl fmt::Debug for DoneGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DoneGuard")
            .field("node", &self.node.address)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

/// Load balancer over a replaceable node table.
pub trait Selector: Send + Sync {
    /// Pick a node among those surviving `filters`.
    ///
    /// # Errors
    /// Returns [`GatewayError::NoAvailableNode`] when nothing is eligible.
    fn select(&self, filters: &[NodeFilter]) -> Result<(Arc<Node>, DoneGuard), GatewayError>;

    /// Replace the whole node table.
    fn apply(&self, nodes: Vec<Arc<Node>>);

    /// Snapshot of the current node table.
    fn nodes(&self) -> Arc<Vec<Arc<Node>>>;
}

/// Weighted random selection. Weight 0 is skipped unless every candidate
/// has weight 0, in which case candidates are picked uniformly.
pub struct WeightedSelector {
    nodes: ArcSwap<Vec<Arc<Node>>>,
    random: SharedRandom,
    hook: Option<DoneHook>,
}

impl Default for WeightedSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl WeightedSelector {
    #[must_use]
    pub fn new() -> Self {
        Self::with_random(SeededRandom::from_os())
    }

    #[must_use]
    pub fn with_random(random: impl RandomSource + 'static) -> Self {
        Self {
            nodes: ArcSwap::from_pointee(Vec::new()),
            random: shared(random),
            hook: None,
        }
    }

    #[must_use]
    pub fn with_done_hook(mut self, hook: DoneHook) -> Self {
        self.hook = Some(hook);
        self
    }

    fn pick(&self, candidates: &[Arc<Node>]) -> Arc<Node> {
        let total: u64 = candidates.iter().map(|n| u64::from(n.weight)).sum();
        let mut random = self.random.lock();
        if total == 0 {
            let idx = random.below(candidates.len() as u64);
            return Arc::clone(&candidates[usize::try_from(idx).unwrap_or(0)]);
        }
        let mut point = random.below(total);
        drop(random);
        for node in candidates {
            let weight = u64::from(node.weight);
            if point < weight {
                return Arc::clone(node);
            }
            point -= weight;
        }
        // Unreachable while `point < total`; fall back to the last candidate.
        Arc::clone(&candidates[candidates.len() - 1])
    }
}

impl Selector for WeightedSelector {
    fn select(&self, filters: &[NodeFilter]) -> Result<(Arc<Node>, DoneGuard), GatewayError> {
        let table = self.nodes.load();
        let mut candidates: Vec<Arc<Node>> = table.iter().cloned().collect();
        for filter in filters {
            candidates = filter(&candidates);
        }
        if candidates.is_empty() {
            return Err(GatewayError::NoAvailableNode);
        }
        let node = self.pick(&candidates);
        let guard = DoneGuard::new(Arc::clone(&node), self.hook.clone());
        Ok((node, guard))
    }

    fn apply(&self, nodes: Vec<Arc<Node>>) {
        tracing::debug!(nodes = nodes.len(), "node table replaced");
        self.nodes.store(Arc::new(nodes));
    }

    fn nodes(&self) -> Arc<Vec<Arc<Node>>> {
        self.nodes.load_full()
    }
}
