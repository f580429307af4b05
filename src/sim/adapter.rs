//! Simulation environment adapter - gym-like view of the shared simulation
//!
//! Turns raw simulator snapshots into fixed-length per-junction observations
//! and rewards, applies phase actions and decides when an episode ends.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::config::{Config, RewardConfig, VehicleWeights};
use crate::error::{ConfigValidationError, SimulationFailure};

use super::{JunctionId, JunctionLayout, JunctionSnapshot, TrafficSimulator};

/// Discrete phase-selection action space of one junction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionSpace {
    pub junction: JunctionId,
    /// Selectable green phases; action `i` selects phase `i`
    pub phases: usize,
}

impl ActionSpace {
    pub fn contains(&self, action: usize) -> bool {
        action < self.phases
    }

    /// Validity mask over the shared action head
    pub fn mask(&self, head_size: usize) -> Vec<f32> {
        (0..head_size)
            .map(|a| if self.contains(a) { 1.0 } else { 0.0 })
            .collect()
    }
}

/// Adapter settings derived from the config
#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub seed: u64,
    pub control_interval_secs: u32,
    pub episode_ticks: u64,
    pub priority_aware: bool,
    pub queue_norm: f32,
    pub wait_norm: f32,
    pub phase_norm: f32,
    pub reward: RewardConfig,
    pub vehicle_weights: VehicleWeights,
}

impl AdapterSettings {
    pub fn from_config(config: &Config) -> Self {
        let sim = &config.simulation;
        Self {
            seed: sim.seed,
            control_interval_secs: sim.control_interval_secs,
            episode_ticks: sim.episode_ticks,
            priority_aware: sim.priority_aware,
            queue_norm: sim.queue_norm,
            wait_norm: sim.wait_norm,
            phase_norm: sim.phase_norm,
            reward: config.reward.clone(),
            vehicle_weights: config.vehicle_weights.clone(),
        }
    }
}

/// Observation for one junction
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// `[q_0, w_0, .., q_{A-1}, w_{A-1}, elapsed_phase, waiting_aggregate, (priority)]`
    pub features: Vec<f32>,
    /// Action validity over the shared head
    pub mask: Vec<f32>,
}

/// Derived per-junction view of the simulation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JunctionState {
    /// Stopped vehicles per approach
    pub queue_lengths: Vec<u32>,
    /// Class-weighted stopped vehicles per approach
    pub weighted_queues: Vec<f32>,
    /// Largest class-weighted waiting time per approach
    pub max_weighted_wait: Vec<f32>,
    pub phase: usize,
    pub phase_elapsed: f64,
    /// Mean class-weighted waiting time of vehicles present
    pub mean_weighted_wait: f32,
    /// Waiting vehicle-seconds since reset
    pub cumulative_waiting: f64,
    pub vehicle_count: usize,
    /// Approach holding the longest-waiting priority vehicle
    pub priority_approach: Option<usize>,
    pub cumulative_teleports: u64,
}

impl JunctionState {
    fn from_snapshot(snapshot: &JunctionSnapshot, weights: &VehicleWeights) -> Self {
        let mut state = JunctionState {
            phase: snapshot.phase,
            phase_elapsed: snapshot.phase_elapsed,
            cumulative_waiting: snapshot.cumulative_waiting,
            cumulative_teleports: snapshot.cumulative_teleports,
            ..Default::default()
        };

        let mut weighted_wait_sum = 0.0f32;
        let mut longest_priority_wait = f32::NEG_INFINITY;

        for (index, approach) in snapshot.approaches.iter().enumerate() {
            let mut stopped = 0u32;
            let mut weighted_queue = 0.0f32;
            let mut max_wait = 0.0f32;

            for vehicle in &approach.vehicles {
                let weight = weights.weight(vehicle.class);
                if vehicle.is_stopped() {
                    stopped += 1;
                    weighted_queue += weight;
                }
                let weighted_wait = vehicle.waiting_time * weight;
                max_wait = max_wait.max(weighted_wait);
                weighted_wait_sum += weighted_wait;

                if vehicle.class.is_priority() && vehicle.waiting_time > longest_priority_wait {
                    longest_priority_wait = vehicle.waiting_time;
                    state.priority_approach = Some(index);
                }
            }

            state.vehicle_count += approach.vehicles.len();
            state.queue_lengths.push(stopped);
            state.weighted_queues.push(weighted_queue);
            state.max_weighted_wait.push(max_wait);
        }

        if state.vehicle_count > 0 {
            state.mean_weighted_wait = weighted_wait_sum / state.vehicle_count as f32;
        }
        state
    }

    /// Total stopped vehicles
    pub fn queue_length(&self) -> u32 {
        self.queue_lengths.iter().sum()
    }

    pub fn weighted_queue(&self) -> f32 {
        self.weighted_queues.iter().sum()
    }

    /// Population standard deviation of the per-approach queues
    pub fn pressure(&self) -> f32 {
        let n = self.weighted_queues.len();
        if n < 2 {
            return 0.0;
        }
        let mean = self.weighted_queue() / n as f32;
        if mean <= 0.0 {
            return 0.0;
        }
        let var = self
            .weighted_queues
            .iter()
            .map(|q| (q - mean).powi(2))
            .sum::<f32>()
            / n as f32;
        var.sqrt()
    }
}

/// Shared simulation state, owned by the adapter
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulationState {
    pub tick: u64,
    pub episode: u64,
    pub junctions: BTreeMap<JunctionId, JunctionState>,
}

/// Additional information from a step
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepInfo {
    /// Tick reached by this step
    pub tick: u64,
    /// Stopped vehicles after the step
    pub queue_length: u32,
    /// Waiting vehicle-seconds since reset
    pub cumulative_waiting: f64,
    /// Waiting vehicle-seconds accrued during this step
    pub waiting_delta: f64,
    /// Episode ended by local gridlock (penalty applied)
    pub gridlock: bool,
    /// Episode ended by horizon or an empty network
    pub truncated: bool,
    pub teleports_in_window: u64,
    pub priority_approach: Option<usize>,
}

/// Per-junction result of one tick
#[derive(Debug, Clone, PartialEq)]
pub struct JunctionStep {
    pub observation: Observation,
    pub reward: f32,
    pub done: bool,
    pub info: StepInfo,
}

/// Sliding per-tick teleport counts
#[derive(Debug, Clone, Default)]
struct TeleportWindow {
    counts: VecDeque<u64>,
}

impl TeleportWindow {
    fn push(&mut self, teleports: u64, window: usize) -> u64 {
        self.counts.push_back(teleports);
        while self.counts.len() > window {
            self.counts.pop_front();
        }
        self.counts.iter().sum()
    }
}

/// Wraps the external simulator for the training clients and the controller
pub struct SimulationEnvironmentAdapter {
    simulator: Box<dyn TrafficSimulator>,
    settings: AdapterSettings,
    action_spaces: BTreeMap<JunctionId, ActionSpace>,
    layouts: BTreeMap<JunctionId, JunctionLayout>,
    active: BTreeSet<JunctionId>,
    state: SimulationState,
    teleport_windows: BTreeMap<JunctionId, TeleportWindow>,
    max_approaches: usize,
    action_head: usize,
    /// Episodes started so far; also offsets the reset seed
    episodes: u64,
    started: bool,
}

impl SimulationEnvironmentAdapter {
    pub fn new(
        simulator: Box<dyn TrafficSimulator>,
        settings: AdapterSettings,
        action_spaces: BTreeMap<JunctionId, usize>,
    ) -> Self {
        let action_head = action_spaces.values().copied().max().unwrap_or(0);
        let action_spaces: BTreeMap<JunctionId, ActionSpace> = action_spaces
            .into_iter()
            .map(|(junction, phases)| {
                (
                    junction.clone(),
                    ActionSpace { junction, phases },
                )
            })
            .collect();
        let active = action_spaces.keys().cloned().collect();

        Self {
            simulator,
            settings,
            max_approaches: action_head,
            action_head,
            action_spaces,
            layouts: BTreeMap::new(),
            active,
            state: SimulationState::default(),
            teleport_windows: BTreeMap::new(),
            episodes: 0,
            started: false,
        }
    }

    /// Restart the simulation at tick 0 and return every junction's observation
    pub fn reset(&mut self) -> Result<BTreeMap<JunctionId, Observation>, SimulationFailure> {
        let seed = self.settings.seed.wrapping_add(self.episodes);
        let layouts = self.simulator.reset(seed)?;

        let layouts: BTreeMap<JunctionId, JunctionLayout> = layouts
            .into_iter()
            .map(|layout| (layout.id.clone(), layout))
            .collect();
        let max_approaches = self
            .action_spaces
            .iter()
            .map(|(id, space)| {
                layouts
                    .get(id)
                    .map(|l| l.approaches.len())
                    .unwrap_or(space.phases)
            })
            .max()
            .unwrap_or(0);
        // observation width is pinned by the first reset
        if self.episodes > 0 && max_approaches != self.max_approaches {
            return Err(SimulationFailure::Protocol(format!(
                "layout changed after restart: {} approaches per junction, observations sized for {}",
                max_approaches, self.max_approaches
            )));
        }
        self.layouts = layouts;
        self.max_approaches = max_approaches;

        self.state = SimulationState {
            tick: 0,
            episode: self.episodes,
            junctions: BTreeMap::new(),
        };
        self.teleport_windows.clear();
        self.started = true;
        self.episodes += 1;

        let known: Vec<JunctionId> = self
            .action_spaces
            .keys()
            .filter(|id| self.layouts.contains_key(*id))
            .cloned()
            .collect();
        for id in &known {
            let snapshot = self.simulator.query(id)?;
            let junction = JunctionState::from_snapshot(&snapshot, &self.settings.vehicle_weights);
            self.state.junctions.insert(id.clone(), junction);
        }

        tracing::debug!(
            "Simulation reset (episode {}, seed {}, {} junctions)",
            self.state.episode,
            seed,
            known.len()
        );

        known
            .iter()
            .map(|id| Ok((id.clone(), self.observe(id)?)))
            .collect()
    }

    /// Check configured action spaces against the simulator's layout
    pub fn validate_layout(&self) -> Result<(), ConfigValidationError> {
        for (id, space) in &self.action_spaces {
            let layout = self
                .layouts
                .get(id)
                .ok_or_else(|| ConfigValidationError::UnknownJunction(id.to_string()))?;
            if layout.green_phases != space.phases {
                return Err(ConfigValidationError::ActionSpaceMismatch {
                    junction: id.to_string(),
                    configured: space.phases,
                    reported: layout.green_phases,
                });
            }
        }
        Ok(())
    }

    /// Current observation for one junction; does not advance the clock
    pub fn observe(&self, junction: &JunctionId) -> Result<Observation, SimulationFailure> {
        if !self.started {
            return Err(SimulationFailure::NotStarted);
        }
        let state = self
            .state
            .junctions
            .get(junction)
            .ok_or_else(|| SimulationFailure::UnknownJunction(junction.clone()))?;
        let space = &self.action_spaces[junction];

        let settings = &self.settings;
        let mut features = Vec::with_capacity(self.observation_size());
        for approach in 0..self.max_approaches {
            let queue = state.weighted_queues.get(approach).copied().unwrap_or(0.0);
            let wait = state.max_weighted_wait.get(approach).copied().unwrap_or(0.0);
            features.push((queue / settings.queue_norm).min(1.0));
            features.push((wait / settings.wait_norm).min(1.0));
        }
        features.push((state.phase_elapsed as f32 / settings.phase_norm).min(1.0));
        features.push((state.mean_weighted_wait / settings.wait_norm).min(1.0));
        if settings.priority_aware {
            features.push(if state.priority_approach.is_some() { 1.0 } else { 0.0 });
        }

        Ok(Observation {
            features,
            mask: space.mask(self.action_head),
        })
    }

    /// Advance one control interval. Every active junction must have an action.
    pub fn step(
        &mut self,
        actions: &BTreeMap<JunctionId, usize>,
    ) -> Result<BTreeMap<JunctionId, JunctionStep>, SimulationFailure> {
        if !self.started {
            return Err(SimulationFailure::NotStarted);
        }
        if let Some(missing) = self.active.iter().find(|j| !actions.contains_key(*j)) {
            return Err(SimulationFailure::MissingAction(missing.clone()));
        }

        let mut phases = BTreeMap::new();
        for (junction, &action) in actions {
            let space = self
                .action_spaces
                .get(junction)
                .ok_or_else(|| SimulationFailure::UnknownJunction(junction.clone()))?;
            if space.contains(action) {
                phases.insert(junction.clone(), action);
            } else {
                // padded action: hold the current phase
                tracing::debug!("Junction {} action {} outside its phases, holding", junction, action);
            }
        }

        self.simulator
            .step(&phases, self.settings.control_interval_secs)?;
        self.state.tick += 1;

        let drained = self.simulator.expected_vehicles()? == 0;
        let horizon = self.state.tick >= self.settings.episode_ticks;

        let ids: Vec<JunctionId> = self.state.junctions.keys().cloned().collect();
        let mut results = BTreeMap::new();
        for id in ids {
            let snapshot = self.simulator.query(&id)?;
            let next = JunctionState::from_snapshot(&snapshot, &self.settings.vehicle_weights);
            let previous = self.state.junctions.insert(id.clone(), next.clone());

            let (waiting_delta, teleport_delta) = previous
                .map(|p| {
                    (
                        (next.cumulative_waiting - p.cumulative_waiting).max(0.0),
                        next.cumulative_teleports.saturating_sub(p.cumulative_teleports),
                    )
                })
                .unwrap_or((0.0, 0));

            let reward_cfg = &self.settings.reward;
            let teleports_in_window = self
                .teleport_windows
                .entry(id.clone())
                .or_default()
                .push(teleport_delta, reward_cfg.gridlock_window);
            let gridlock = teleports_in_window > u64::from(reward_cfg.gridlock_teleport_threshold);

            if !actions.contains_key(&id) {
                continue;
            }

            let mut reward = -(reward_cfg.queue_weight * next.weighted_queue()
                + reward_cfg.waiting_weight * waiting_delta as f32
                + reward_cfg.pressure_weight * next.pressure())
                * reward_cfg.scale;
            if gridlock {
                reward -= reward_cfg.gridlock_penalty;
                tracing::warn!(
                    "Gridlock at junction {} (tick {}, {} teleports in window)",
                    id,
                    self.state.tick,
                    teleports_in_window
                );
            }

            let info = StepInfo {
                tick: self.state.tick,
                queue_length: next.queue_length(),
                cumulative_waiting: next.cumulative_waiting,
                waiting_delta,
                gridlock,
                truncated: (horizon || drained) && !gridlock,
                teleports_in_window,
                priority_approach: next.priority_approach,
            };
            results.insert(
                id.clone(),
                JunctionStep {
                    observation: self.observe(&id)?,
                    reward,
                    done: gridlock || horizon || drained,
                    info,
                },
            );
        }

        Ok(results)
    }

    /// Restrict which junctions must submit an action each tick
    pub fn set_active<I: IntoIterator<Item = JunctionId>>(&mut self, junctions: I) {
        self.active = junctions
            .into_iter()
            .filter(|j| self.action_spaces.contains_key(j))
            .collect();
    }

    pub fn deactivate(&mut self, junction: &JunctionId) {
        self.active.remove(junction);
    }

    pub fn activate_all(&mut self) {
        self.active = self.action_spaces.keys().cloned().collect();
    }

    pub fn active(&self) -> &BTreeSet<JunctionId> {
        &self.active
    }

    pub fn state(&self) -> &SimulationState {
        &self.state
    }

    pub fn tick(&self) -> u64 {
        self.state.tick
    }

    pub fn junctions(&self) -> impl Iterator<Item = &JunctionId> {
        self.action_spaces.keys()
    }

    pub fn action_space(&self, junction: &JunctionId) -> Option<&ActionSpace> {
        self.action_spaces.get(junction)
    }

    /// Size of the shared action head
    pub fn action_head(&self) -> usize {
        self.action_head
    }

    /// Length of every observation vector
    pub fn observation_size(&self) -> usize {
        2 * self.max_approaches + 2 + usize::from(self.settings.priority_aware)
    }

    pub fn close(&mut self) {
        self.simulator.close();
        self.started = false;
    }
}
