//! Coordinator/client round-trip contract

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::ClientError;
use crate::rl::{RolloutStats, WeightBlob};
use crate::sim::{JunctionId, JunctionLink};

/// Cooperative interrupt flag, checked at round and phase boundaries
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A client's contribution to one round
#[derive(Debug, Clone)]
pub struct ClientUpdate {
    pub junction: JunctionId,
    pub weights: WeightBlob,
    pub stats: RolloutStats,
}

impl ClientUpdate {
    pub fn new(junction: JunctionId, weights: WeightBlob, stats: RolloutStats) -> Self {
        Self {
            junction,
            weights,
            stats,
        }
    }
}

/// One junction participating in federated rounds
pub trait FederatedClient: Send + 'static {
    fn junction(&self) -> &JunctionId;

    /// Start from `global`, collect through `link`, update locally and
    /// report. The link must be released once collection ends.
    fn run_round(
        &mut self,
        round: u64,
        global: Arc<WeightBlob>,
        link: JunctionLink,
        cancel: CancelToken,
    ) -> impl Future<Output = Result<ClientUpdate, ClientError>> + Send;
}
