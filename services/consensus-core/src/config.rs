use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use mesh_core::{ConsensusSettings, PeerId};

use crate::execution::{ExecutionRequest, ExecutionResult};

/// Smallest cluster that tolerates one Byzantine replica.
pub const MINIMUM_REPLICA_COUNT: usize = 4;
pub const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// How far past `last_executed` a pre-prepare may be numbered. There are no
/// checkpoints, so this caps the slots a new view has to re-propose.
pub const DEFAULT_SEQUENCE_WINDOW: u64 = 1024;

/// Hook invoked after every execution. Runs on the replica task, keep it short.
pub trait PostProcessor: Send + Sync {
    fn process(&self, request_id: &str, origin: &PeerId, request: &ExecutionRequest, result: &ExecutionResult);
}

impl<F> PostProcessor for F
where
    F: Fn(&str, &PeerId, &ExecutionRequest, &ExecutionResult) + Send + Sync,
{
    fn process(&self, request_id: &str, origin: &PeerId, request: &ExecutionRequest, result: &ExecutionResult) {
        self(request_id, origin, request, result)
    }
}

#[derive(Clone)]
pub struct ReplicaConfig {
    /// Upper bound for one send or broadcast.
    pub network_timeout: Duration,
    /// Inactivity period after which the primary is suspected.
    pub request_timeout: Duration,
    pub sequence_window: u64,
    pub post_processors: Vec<Arc<dyn PostProcessor>>,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            network_timeout: DEFAULT_NETWORK_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            sequence_window: DEFAULT_SEQUENCE_WINDOW,
            post_processors: Vec::new(),
        }
    }
}

impl ReplicaConfig {
    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_sequence_window(mut self, window: u64) -> Self {
        self.sequence_window = window;
        self
    }

    pub fn with_post_processor(mut self, processor: Arc<dyn PostProcessor>) -> Self {
        self.post_processors.push(processor);
        self
    }
}

impl From<&ConsensusSettings> for ReplicaConfig {
    fn from(settings: &ConsensusSettings) -> Self {
        Self {
            network_timeout: settings.network_timeout(),
            request_timeout: settings.request_timeout(),
            ..Self::default()
        }
    }
}

impl fmt::Debug for ReplicaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaConfig")
            .field("network_timeout", &self.network_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("sequence_window", &self.sequence_window)
            .field("post_processors", &self.post_processors.len())
            .finish()
    }
}
