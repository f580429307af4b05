//! Shared simulation handle and the per-tick join across junction clients

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until, timeout};

use crate::error::SimulationFailure;

use super::{JunctionId, JunctionStep, Observation, SimulationEnvironmentAdapter, SimulationState};

const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Cloneable handle to the one adapter that owns the simulator
#[derive(Clone)]
pub struct SimulationSession {
    adapter: Arc<Mutex<SimulationEnvironmentAdapter>>,
    /// Set once a simulator call overruns its timeout; the session is dead after that
    failure: Arc<OnceLock<SimulationFailure>>,
    step_timeout: Duration,
}

impl SimulationSession {
    pub fn new(adapter: SimulationEnvironmentAdapter) -> Self {
        Self {
            adapter: Arc::new(Mutex::new(adapter)),
            failure: Arc::new(OnceLock::new()),
            step_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }

    /// Bound on a single simulator reset or step issued through the async API
    pub fn with_step_timeout(mut self, step_timeout: Duration) -> Self {
        self.step_timeout = step_timeout;
        self
    }

    pub fn step_timeout(&self) -> Duration {
        self.step_timeout
    }

    /// The failure that ended this session, if any
    pub fn failure(&self) -> Option<SimulationFailure> {
        self.failure.get().cloned()
    }

    /// Run `f` with exclusive access to the adapter
    pub fn with_adapter<T>(
        &self,
        f: impl FnOnce(&mut SimulationEnvironmentAdapter) -> T,
    ) -> Result<T, SimulationFailure> {
        if let Some(failure) = self.failure.get() {
            return Err(failure.clone());
        }
        let mut adapter = self.adapter.lock().map_err(|_| SimulationFailure::Poisoned)?;
        Ok(f(&mut adapter))
    }

    pub fn reset(&self) -> Result<BTreeMap<JunctionId, Observation>, SimulationFailure> {
        self.with_adapter(|adapter| adapter.reset())?
    }

    pub fn observe(&self, junction: &JunctionId) -> Result<Observation, SimulationFailure> {
        self.with_adapter(|adapter| adapter.observe(junction))?
    }

    pub fn step(
        &self,
        actions: &BTreeMap<JunctionId, usize>,
    ) -> Result<BTreeMap<JunctionId, JunctionStep>, SimulationFailure> {
        self.with_adapter(|adapter| adapter.step(actions))?
    }

    pub fn state(&self) -> Result<SimulationState, SimulationFailure> {
        self.with_adapter(|adapter| adapter.state().clone())
    }

    pub fn tick(&self) -> Result<u64, SimulationFailure> {
        self.with_adapter(|adapter| adapter.tick())
    }

    /// Step on the blocking pool, failing with `StepTimeout` when the
    /// simulator does not answer in time
    pub async fn step_with_timeout(
        &self,
        actions: BTreeMap<JunctionId, usize>,
    ) -> Result<BTreeMap<JunctionId, JunctionStep>, SimulationFailure> {
        self.blocking(move |adapter| adapter.step(&actions)).await
    }

    pub async fn reset_with_timeout(
        &self,
    ) -> Result<BTreeMap<JunctionId, Observation>, SimulationFailure> {
        self.blocking(|adapter| adapter.reset()).await
    }

    /// Run `f` on the blocking pool, bounded by the step timeout. A timeout
    /// marks the whole session failed: the stalled call still holds the
    /// adapter, so later callers get the failure instead of waiting on it.
    pub async fn blocking<T, F>(&self, f: F) -> Result<T, SimulationFailure>
    where
        T: Send + 'static,
        F: FnOnce(&mut SimulationEnvironmentAdapter) -> Result<T, SimulationFailure>
            + Send
            + 'static,
    {
        let session = self.clone();
        let task = tokio::task::spawn_blocking(move || session.with_adapter(f).and_then(|r| r));

        match timeout(self.step_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(SimulationFailure::Exited(format!("simulator task failed: {}", e))),
            Err(_) => {
                let timed_out = SimulationFailure::StepTimeout(self.step_timeout.as_millis() as u64);
                let failure = self.failure.get_or_init(|| timed_out);
                tracing::error!("Simulator stalled, closing the session: {}", failure);
                Err(failure.clone())
            }
        }
    }
}

enum BarrierRequest {
    Observe {
        junction: JunctionId,
        reply: oneshot::Sender<Result<Observation, SimulationFailure>>,
    },
    Submit {
        junction: JunctionId,
        action: usize,
        reply: oneshot::Sender<Result<JunctionStep, SimulationFailure>>,
    },
    Leave {
        junction: JunctionId,
    },
}

enum BarrierEvent {
    Request(Option<BarrierRequest>),
    Deadline,
}

/// What happened while the barrier ran
#[derive(Debug, Clone, Default)]
pub struct BarrierReport {
    /// Shared ticks advanced
    pub ticks: u64,
    /// Episode resets performed
    pub episodes: u64,
    /// Junctions removed for missing a tick deadline
    pub evicted: Vec<JunctionId>,
    /// First simulator failure; every later request fails with it
    pub failure: Option<SimulationFailure>,
}

/// Round-scoped task joining the action submissions of every member
/// junction before advancing the shared clock by exactly one tick
pub struct TickBarrier {
    session: SimulationSession,
    requests: mpsc::UnboundedReceiver<BarrierRequest>,
    members: BTreeSet<JunctionId>,
    pending: BTreeMap<JunctionId, (usize, oneshot::Sender<Result<JunctionStep, SimulationFailure>>)>,
    straggler_timeout: Duration,
    report: BarrierReport,
}

impl TickBarrier {
    /// Create the barrier and one link per member junction
    pub fn new<I>(
        session: SimulationSession,
        junctions: I,
        straggler_timeout: Duration,
    ) -> (Self, Vec<JunctionLink>)
    where
        I: IntoIterator<Item = JunctionId>,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let members: BTreeSet<JunctionId> = junctions.into_iter().collect();
        let links = members
            .iter()
            .map(|junction| JunctionLink {
                junction: junction.clone(),
                requests: tx.clone(),
            })
            .collect();

        let barrier = Self {
            session,
            requests: rx,
            members,
            pending: BTreeMap::new(),
            straggler_timeout,
            report: BarrierReport::default(),
        };
        (barrier, links)
    }

    /// Serve requests until every link has been dropped
    pub async fn run(mut self) -> BarrierReport {
        let members = self.members.clone();
        if let Err(e) = self
            .session
            .blocking(move |adapter| {
                adapter.set_active(members);
                Ok(())
            })
            .await
        {
            self.report.failure = Some(e);
        }

        let mut deadline: Option<Instant> = None;
        loop {
            let event = match deadline {
                Some(at) => tokio::select! {
                    request = self.requests.recv() => BarrierEvent::Request(request),
                    _ = sleep_until(at) => BarrierEvent::Deadline,
                },
                None => BarrierEvent::Request(self.requests.recv().await),
            };

            match event {
                BarrierEvent::Request(Some(request)) => self.handle(request).await,
                BarrierEvent::Request(None) => break,
                BarrierEvent::Deadline => self.evict_stragglers().await,
            }

            deadline = if self.pending.is_empty() {
                None
            } else {
                deadline.or_else(|| Some(Instant::now() + self.straggler_timeout))
            };
        }

        if let Err(e) = self
            .session
            .blocking(|adapter| {
                adapter.activate_all();
                Ok(())
            })
            .await
        {
            tracing::warn!("Could not reactivate junctions after the round: {}", e);
        }
        tracing::debug!(
            "Tick barrier closed after {} ticks ({} episode resets)",
            self.report.ticks,
            self.report.episodes
        );
        self.report
    }

    async fn handle(&mut self, request: BarrierRequest) {
        match request {
            BarrierRequest::Observe { junction, reply } => {
                let result = match self.admit(&junction) {
                    Ok(()) => {
                        self.session
                            .blocking(move |adapter| adapter.observe(&junction))
                            .await
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            BarrierRequest::Submit {
                junction,
                action,
                reply,
            } => {
                if let Err(e) = self.admit(&junction) {
                    let _ = reply.send(Err(e));
                    return;
                }
                self.pending.insert(junction, (action, reply));
                self.try_advance().await;
            }
            BarrierRequest::Leave { junction } => {
                self.pending.remove(&junction);
                if self.members.remove(&junction) {
                    tracing::debug!("Junction {} left the tick barrier", junction);
                    self.deactivate(junction).await;
                }
                self.try_advance().await;
            }
        }
    }

    fn admit(&self, junction: &JunctionId) -> Result<(), SimulationFailure> {
        if let Some(failure) = &self.report.failure {
            return Err(failure.clone());
        }
        if self.members.contains(junction) {
            Ok(())
        } else if self.report.evicted.contains(junction) {
            Err(SimulationFailure::Evicted(junction.clone()))
        } else {
            Err(SimulationFailure::UnknownJunction(junction.clone()))
        }
    }

    async fn evict_stragglers(&mut self) {
        let stragglers: Vec<JunctionId> = self
            .members
            .iter()
            .filter(|m| !self.pending.contains_key(*m))
            .cloned()
            .collect();
        for junction in stragglers {
            tracing::warn!(
                "Junction {} missed the tick deadline at tick {}, evicting",
                junction,
                self.report.ticks
            );
            self.members.remove(&junction);
            self.report.evicted.push(junction.clone());
            self.deactivate(junction).await;
        }
        self.try_advance().await;
    }

    /// Stop stepping `junction`; it keeps its current phase
    async fn deactivate(&mut self, junction: JunctionId) {
        let result = self
            .session
            .blocking({
                let junction = junction.clone();
                move |adapter| {
                    adapter.deactivate(&junction);
                    Ok(())
                }
            })
            .await;
        if let Err(e) = result {
            tracing::warn!("Could not deactivate junction {}: {}", junction, e);
            self.report.failure.get_or_insert(e);
        }
    }

    async fn try_advance(&mut self) {
        if self.pending.is_empty() || self.members.iter().any(|m| !self.pending.contains_key(m)) {
            return;
        }

        let pending = std::mem::take(&mut self.pending);
        let actions: BTreeMap<JunctionId, usize> = pending
            .iter()
            .map(|(junction, (action, _))| (junction.clone(), *action))
            .collect();

        match self.advance(actions).await {
            Ok(mut results) => {
                for (junction, (_, reply)) in pending {
                    let result = results
                        .remove(&junction)
                        .ok_or(SimulationFailure::UnknownJunction(junction));
                    let _ = reply.send(result);
                }
            }
            Err(e) => {
                tracing::error!("Simulation failed at tick {}: {}", self.report.ticks, e);
                for (_, (_, reply)) in pending {
                    let _ = reply.send(Err(e.clone()));
                }
                self.report.failure = Some(e);
            }
        }
    }

    /// One shared tick; resets the episode when any junction reports done
    async fn advance(
        &mut self,
        actions: BTreeMap<JunctionId, usize>,
    ) -> Result<BTreeMap<JunctionId, JunctionStep>, SimulationFailure> {
        let mut results = self.session.step_with_timeout(actions).await?;
        self.report.ticks += 1;

        if results.values().any(|r| r.done) {
            let fresh = self.session.reset_with_timeout().await?;
            self.report.episodes += 1;
            for (junction, result) in results.iter_mut() {
                if let Some(observation) = fresh.get(junction) {
                    result.observation = observation.clone();
                }
            }
        }
        Ok(results)
    }
}

/// A junction client's membership in the tick barrier; leaves on drop
pub struct JunctionLink {
    junction: JunctionId,
    requests: mpsc::UnboundedSender<BarrierRequest>,
}

impl JunctionLink {
    pub fn junction(&self) -> &JunctionId {
        &self.junction
    }

    /// Current observation; does not advance the clock
    pub async fn observe(&self) -> Result<Observation, SimulationFailure> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(BarrierRequest::Observe {
                junction: self.junction.clone(),
                reply,
            })
            .map_err(|_| SimulationFailure::BarrierClosed)?;
        response.await.map_err(|_| SimulationFailure::BarrierClosed)?
    }

    /// Submit this tick's action and wait for the shared step
    pub async fn submit(&self, action: usize) -> Result<JunctionStep, SimulationFailure> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(BarrierRequest::Submit {
                junction: self.junction.clone(),
                action,
                reply,
            })
            .map_err(|_| SimulationFailure::BarrierClosed)?;
        response.await.map_err(|_| SimulationFailure::BarrierClosed)?
    }
}

impl Drop for JunctionLink {
    fn drop(&mut self) {
        let _ = self.requests.send(BarrierRequest::Leave {
            junction: self.junction.clone(),
        });
    }
}
