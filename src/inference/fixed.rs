//! Static phase-timing baseline

use std::collections::BTreeMap;

use crate::config::FixedProgramConfig;
use crate::sim::JunctionId;

/// Round-robin over one junction's green phases
#[derive(Debug, Clone)]
struct PhaseCycle {
    hold_ticks: Vec<u32>,
    phase: usize,
    held: u32,
}

impl PhaseCycle {
    fn next(&mut self) -> usize {
        let phase = self.phase;
        self.held += 1;
        if self.held >= self.hold_ticks[phase] {
            self.held = 0;
            self.phase = (self.phase + 1) % self.hold_ticks.len();
        }
        phase
    }
}

/// Pre-defined timing for every junction, ignoring traffic
#[derive(Debug, Clone)]
pub struct FixedTimeProgram {
    cycles: BTreeMap<JunctionId, PhaseCycle>,
}

impl FixedTimeProgram {
    pub fn new(config: &FixedProgramConfig, action_spaces: &BTreeMap<JunctionId, usize>) -> Self {
        let cycles = action_spaces
            .iter()
            .filter(|(_, phases)| **phases > 0)
            .map(|(junction, &phases)| {
                let hold_ticks = match config.per_junction.get(junction.as_str()) {
                    Some(ticks) if ticks.len() == phases => {
                        ticks.iter().map(|&t| t.max(1)).collect()
                    }
                    Some(ticks) => {
                        tracing::warn!(
                            "Fixed program for {} lists {} phases, junction has {}; using {} ticks each",
                            junction,
                            ticks.len(),
                            phases,
                            config.phase_ticks
                        );
                        vec![config.phase_ticks.max(1); phases]
                    }
                    None => vec![config.phase_ticks.max(1); phases],
                };
                (
                    junction.clone(),
                    PhaseCycle {
                        hold_ticks,
                        phase: 0,
                        held: 0,
                    },
                )
            })
            .collect();
        Self { cycles }
    }

    /// Phase command for every junction for the coming tick
    pub fn next_actions(&mut self) -> BTreeMap<JunctionId, usize> {
        self.cycles
            .iter_mut()
            .map(|(junction, cycle)| (junction.clone(), cycle.next()))
            .collect()
    }
}
