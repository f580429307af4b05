//! Simulation boundary
//!
//! ```text
//! TrafficSimulator (built-in queue model | external bridge process)
//!     │  reset / step / query
//!     ▼
//! SimulationEnvironmentAdapter   observations, rewards, gridlock, horizon
//!     │
//!     ▼
//! SimulationSession (shared handle) ──► TickBarrier ──► JunctionLink per client
//! ```

pub mod adapter;
pub mod bridge;
pub mod queue_model;
pub mod session;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{Config, SimulatorBackend};
use crate::error::SimulationFailure;

pub use adapter::{
    ActionSpace, AdapterSettings, JunctionState, JunctionStep, Observation,
    SimulationEnvironmentAdapter, SimulationState, StepInfo,
};
pub use bridge::ProcessSimulator;
pub use queue_model::QueueSimulator;
pub use session::{BarrierReport, JunctionLink, SimulationSession, TickBarrier};

/// Junction identifier as used by the simulator
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JunctionId(String);

impl JunctionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JunctionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for JunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleClass {
    Car,
    Motorcycle,
    Bus,
    Truck,
    /// Priority vehicle
    Emergency,
}

impl VehicleClass {
    pub const ALL: [VehicleClass; 5] = [
        VehicleClass::Car,
        VehicleClass::Motorcycle,
        VehicleClass::Bus,
        VehicleClass::Truck,
        VehicleClass::Emergency,
    ];

    pub fn is_priority(self) -> bool {
        matches!(self, VehicleClass::Emergency)
    }
}

/// One vehicle on an incoming approach
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VehicleSample {
    pub class: VehicleClass,
    /// Seconds spent below the stop speed
    pub waiting_time: f32,
    pub speed: f32,
}

impl VehicleSample {
    pub const STOP_SPEED: f32 = 0.1;

    pub fn is_stopped(&self) -> bool {
        self.speed < Self::STOP_SPEED
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApproachSnapshot {
    /// Incoming road id
    pub road: String,
    pub vehicles: Vec<VehicleSample>,
}

/// Result of the metrics query for one junction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JunctionSnapshot {
    /// Current green phase index
    pub phase: usize,
    /// Seconds since the phase last changed
    pub phase_elapsed: f64,
    pub approaches: Vec<ApproachSnapshot>,
    /// Waiting vehicle-seconds accrued since reset
    pub cumulative_waiting: f64,
    /// Teleports at this junction since reset
    pub cumulative_teleports: u64,
}

/// Static description of a signalised junction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JunctionLayout {
    pub id: JunctionId,
    pub approaches: Vec<String>,
    pub green_phases: usize,
}

/// Control API of an external microsimulation
pub trait TrafficSimulator: Send {
    /// Restart at time zero; describes every signalised junction
    fn reset(&mut self, seed: u64) -> Result<Vec<JunctionLayout>, SimulationFailure>;

    /// Apply green-phase commands, then advance the clock
    fn step(
        &mut self,
        phases: &BTreeMap<JunctionId, usize>,
        seconds: u32,
    ) -> Result<(), SimulationFailure>;

    /// Metrics query for one junction
    fn query(&mut self, junction: &JunctionId) -> Result<JunctionSnapshot, SimulationFailure>;

    /// Vehicles still to be simulated (queued, running or yet to depart)
    fn expected_vehicles(&mut self) -> Result<u64, SimulationFailure>;

    fn close(&mut self) {}
}

/// Build the simulator named in the config
pub fn build_simulator(config: &Config) -> Box<dyn TrafficSimulator> {
    match &config.simulation.backend {
        SimulatorBackend::Builtin(model) => Box::new(QueueSimulator::new(
            config.action_spaces(),
            model.clone(),
            config.simulation.yellow_secs,
        )),
        SimulatorBackend::Process { command, args } => {
            Box::new(ProcessSimulator::new(command.clone(), args.clone()))
        }
    }
}

/// Build a session around the configured simulator and run the startup
/// reset. The layout check is left to the caller
/// (`SimulationEnvironmentAdapter::validate_layout`).
pub fn open_session(config: &Config) -> Result<SimulationSession, SimulationFailure> {
    let simulator = build_simulator(config);
    let mut adapter = SimulationEnvironmentAdapter::new(
        simulator,
        AdapterSettings::from_config(config),
        config.action_spaces(),
    );
    adapter.reset()?;
    Ok(SimulationSession::new(adapter)
        .with_step_timeout(Duration::from_millis(config.simulation.step_timeout_ms)))
}
