//! Drives one inference session and writes the step-level metric log

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::InferenceBackend;
use crate::error::InferenceError;
use crate::rl::PolicyValueNet;
use crate::sim::{JunctionId, JunctionStep, Observation, SimulationSession};

use super::InferenceMode;
use super::fixed::FixedTimeProgram;

/// Where actions come from
pub enum DecisionSource {
    Fixed(FixedTimeProgram),
    /// Greedy policy per junction (the same global network, or per-junction ones)
    Learned(BTreeMap<JunctionId, PolicyValueNet<InferenceBackend>>),
}

#[derive(Debug, Clone)]
pub struct InferenceSettings {
    pub mode: InferenceMode,
    pub max_steps: u64,
    pub max_priority_extension_ticks: u32,
    pub log_dir: PathBuf,
    /// Write a CSV row every this many ticks
    pub log_interval: u64,
}

/// Green-phase hold for an approaching priority vehicle, capped per event
#[derive(Debug, Clone, Default)]
pub struct PriorityOverride {
    cap: u32,
    used: u32,
    pub overrides: u32,
}

impl PriorityOverride {
    pub fn new(cap: u32) -> Self {
        Self {
            cap,
            used: 0,
            overrides: 0,
        }
    }

    /// Returns the action to submit. `serving` is the phase giving green to
    /// the priority vehicle's approach, if one is waiting.
    pub fn apply(&mut self, serving: Option<usize>, selected: usize) -> usize {
        match serving {
            Some(phase) if self.used < self.cap => {
                self.used += 1;
                if phase != selected {
                    self.overrides += 1;
                }
                phase
            }
            Some(_) => selected,
            None => {
                // re-arm once the vehicle has cleared
                self.used = 0;
                selected
            }
        }
    }
}

/// Per-junction totals over a session
#[derive(Debug, Clone, PartialEq)]
pub struct JunctionSummary {
    pub junction: JunctionId,
    pub mean_queue: f32,
    pub final_cumulative_waiting: f64,
    pub gridlocks: u32,
    pub priority_overrides: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceSummary {
    pub mode: InferenceMode,
    pub ticks: u64,
    pub junctions: Vec<JunctionSummary>,
    /// Submitted actions per tick, in junction order
    pub actions: Vec<Vec<usize>>,
    pub log_path: PathBuf,
}

#[derive(Debug, Default)]
struct Accumulator {
    queue_sum: u64,
    samples: u64,
    cumulative_waiting: f64,
    gridlocks: u32,
}

/// CSV written to `<name>.partial` and renamed into place on `finish`
struct MetricLog {
    path: PathBuf,
    partial: PathBuf,
    writer: BufWriter<File>,
    junctions: Vec<JunctionId>,
    finished: bool,
}

impl MetricLog {
    fn create(path: PathBuf, junctions: Vec<JunctionId>) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut partial = path.as_os_str().to_owned();
        partial.push(".partial");
        let partial = PathBuf::from(partial);

        let mut writer = BufWriter::new(File::create(&partial)?);
        let mut header = String::from("tick");
        for junction in &junctions {
            header.push_str(&format!(",{0}_queue,{0}_wait", junction));
        }
        writeln!(writer, "{}", header)?;

        Ok(Self {
            path,
            partial,
            writer,
            junctions,
            finished: false,
        })
    }

    fn row(&mut self, tick: u64, results: &BTreeMap<JunctionId, JunctionStep>) -> io::Result<()> {
        let mut line = tick.to_string();
        for junction in &self.junctions {
            match results.get(junction) {
                Some(step) => line.push_str(&format!(
                    ",{},{:.3}",
                    step.info.queue_length, step.info.cumulative_waiting
                )),
                None => line.push_str(",,"),
            }
        }
        writeln!(self.writer, "{}", line)
    }

    fn finish(mut self) -> io::Result<PathBuf> {
        self.writer.flush()?;
        fs::rename(&self.partial, &self.path)?;
        self.finished = true;
        Ok(self.path.clone())
    }
}

impl Drop for MetricLog {
    fn drop(&mut self) {
        if !self.finished {
            let _ = fs::remove_file(&self.partial);
        }
    }
}

pub fn log_path(dir: &Path, mode: InferenceMode) -> PathBuf {
    dir.join(format!("inference_{}.csv", mode))
}

/// Runs fixed, rl or rl_priority control against the shared session
pub struct InferenceController {
    session: SimulationSession,
    settings: InferenceSettings,
    source: DecisionSource,
    action_spaces: BTreeMap<JunctionId, usize>,
    priority: BTreeMap<JunctionId, PriorityOverride>,
}

impl InferenceController {
    pub fn new(
        session: SimulationSession,
        settings: InferenceSettings,
        source: DecisionSource,
        action_spaces: BTreeMap<JunctionId, usize>,
    ) -> Self {
        let priority = action_spaces
            .keys()
            .map(|junction| {
                (
                    junction.clone(),
                    PriorityOverride::new(settings.max_priority_extension_ticks),
                )
            })
            .collect();
        Self {
            session,
            settings,
            source,
            action_spaces,
            priority,
        }
    }

    /// Reset, then step until every junction is done or the step budget is spent
    pub async fn run(&mut self) -> Result<InferenceSummary, InferenceError> {
        let mode = self.settings.mode;
        tracing::info!("Starting {} inference session (max {} steps)", mode, self.settings.max_steps);

        let mut observations = self.session.reset_with_timeout().await?;
        let junctions: Vec<JunctionId> = observations.keys().cloned().collect();

        let path = log_path(&self.settings.log_dir, mode);
        let log_error = |source: io::Error| InferenceError::Log {
            path: path.clone(),
            source,
        };
        let mut log = MetricLog::create(path.clone(), junctions.clone()).map_err(log_error)?;

        let mut totals: BTreeMap<JunctionId, Accumulator> = junctions
            .iter()
            .map(|j| (j.clone(), Accumulator::default()))
            .collect();
        let mut actions_taken = Vec::new();
        let mut ticks = 0;

        while ticks < self.settings.max_steps {
            let actions = self.select_actions(&observations)?;
            actions_taken.push(junctions.iter().filter_map(|j| actions.get(j).copied()).collect());

            let results = self.session.step_with_timeout(actions).await?;
            ticks += 1;
            let tick = results.values().map(|r| r.info.tick).max().unwrap_or(ticks);

            for (junction, step) in &results {
                let Some(total) = totals.get_mut(junction) else {
                    continue;
                };
                total.queue_sum += u64::from(step.info.queue_length);
                total.samples += 1;
                total.cumulative_waiting = step.info.cumulative_waiting;
                if step.info.gridlock {
                    total.gridlocks += 1;
                    tracing::warn!(
                        "Gridlock at junction {} on tick {} ({} teleports in window), continuing",
                        junction,
                        tick,
                        step.info.teleports_in_window
                    );
                }
            }

            let all_done = !results.is_empty() && results.values().all(|r| r.done);
            if ticks % self.settings.log_interval.max(1) == 0 || all_done {
                log.row(tick, &results).map_err(log_error)?;
            }

            observations = results
                .into_iter()
                .map(|(junction, step)| (junction, step.observation))
                .collect();

            if all_done {
                tracing::debug!("All junctions done at tick {}", tick);
                break;
            }
        }

        let written = log.finish().map_err(log_error)?;

        let junction_summaries: Vec<JunctionSummary> = totals
            .into_iter()
            .map(|(junction, total)| {
                let priority_overrides = self
                    .priority
                    .get(&junction)
                    .map(|p| p.overrides)
                    .unwrap_or(0);
                JunctionSummary {
                    mean_queue: if total.samples > 0 {
                        total.queue_sum as f32 / total.samples as f32
                    } else {
                        0.0
                    },
                    final_cumulative_waiting: total.cumulative_waiting,
                    gridlocks: total.gridlocks,
                    priority_overrides,
                    junction,
                }
            })
            .collect();

        for summary in &junction_summaries {
            tracing::info!(
                "{} {}: mean queue {:.2}, cumulative waiting {:.1}s, gridlocks {}, priority overrides {}",
                mode,
                summary.junction,
                summary.mean_queue,
                summary.final_cumulative_waiting,
                summary.gridlocks,
                summary.priority_overrides
            );
        }
        tracing::info!("{} session finished after {} ticks, log at {}", mode, ticks, written.display());

        Ok(InferenceSummary {
            mode,
            ticks,
            junctions: junction_summaries,
            actions: actions_taken,
            log_path: written,
        })
    }

    fn select_actions(
        &mut self,
        observations: &BTreeMap<JunctionId, Observation>,
    ) -> Result<BTreeMap<JunctionId, usize>, InferenceError> {
        let models = match &mut self.source {
            DecisionSource::Fixed(program) => return Ok(program.next_actions()),
            DecisionSource::Learned(models) => models,
        };

        let serving = if self.settings.mode == InferenceMode::RlPriority {
            self.session.with_adapter(|adapter| {
                adapter
                    .state()
                    .junctions
                    .iter()
                    .map(|(junction, state)| (junction.clone(), state.priority_approach))
                    .collect::<BTreeMap<_, _>>()
            })?
        } else {
            BTreeMap::new()
        };

        let mut actions = BTreeMap::new();
        for (junction, observation) in observations {
            let Some(model) = models.get(junction) else {
                continue;
            };
            let mut action = model.greedy_action(observation).action;

            if self.settings.mode == InferenceMode::RlPriority {
                let phases = self.action_spaces.get(junction).copied().unwrap_or(0);
                // green phase i serves approach i
                let phase = serving
                    .get(junction)
                    .copied()
                    .flatten()
                    .filter(|&approach| approach < phases);
                if let Some(priority) = self.priority.get_mut(junction) {
                    action = priority.apply(phase, action);
                }
            }
            actions.insert(junction.clone(), action);
        }
        Ok(actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_extension_is_capped() {
        let mut priority = PriorityOverride::new(2);
        assert_eq!(priority.apply(Some(1), 0), 1);
        assert_eq!(priority.apply(Some(1), 0), 1);
        // cap reached: the policy's choice stands
        assert_eq!(priority.apply(Some(1), 0), 0);
        assert_eq!(priority.overrides, 2);
    }

    #[test]
    fn test_priority_rearms_after_flag_clears() {
        let mut priority = PriorityOverride::new(1);
        assert_eq!(priority.apply(Some(2), 0), 2);
        assert_eq!(priority.apply(Some(2), 0), 0);
        assert_eq!(priority.apply(None, 0), 0);
        assert_eq!(priority.apply(Some(2), 0), 2);
    }

    #[test]
    fn test_zero_cap_disables_override() {
        let mut priority = PriorityOverride::new(0);
        assert_eq!(priority.apply(Some(1), 0), 0);
        assert_eq!(priority.overrides, 0);
    }

    #[test]
    fn test_partial_log_removed_when_abandoned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inference_rl.csv");
        fs::write(&path, "previous run\n").unwrap();
        {
            let log = MetricLog::create(path.clone(), vec![JunctionId::from("A")]).unwrap();
            assert!(log.partial.exists());
        }
        assert!(!dir.path().join("inference_rl.csv.partial").exists());
        assert_eq!(fs::read_to_string(&path).unwrap(), "previous run\n");
    }

    #[test]
    fn test_header_lists_each_junction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/inference_fixed.csv");
        let log = MetricLog::create(
            path.clone(),
            vec![JunctionId::from("A"), JunctionId::from("B")],
        )
        .unwrap();
        log.finish().unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.trim(), "tick,A_queue,A_wait,B_queue,B_wait");
    }
}
