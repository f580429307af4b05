//! Built-in point-queue traffic model
//!
//! Each junction has one incoming approach per green phase. Vehicles arrive
//! per approach as Bernoulli trials each simulated second, queue FIFO and
//! are discharged at the saturation flow while their approach is green.
//! Changing phase costs `yellow_secs` of lost time. A vehicle stuck longer
//! than `teleport_after_secs` is teleported out and counted against its
//! junction, which is the gridlock signal the adapter watches.

use std::collections::{BTreeMap, VecDeque};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::QueueModelConfig;
use crate::error::SimulationFailure;

use super::{
    ApproachSnapshot, JunctionId, JunctionLayout, JunctionSnapshot, TrafficSimulator,
    VehicleClass, VehicleSample,
};

#[derive(Debug, Clone)]
struct QueuedVehicle {
    class: VehicleClass,
    waiting: f32,
}

#[derive(Debug, Clone)]
struct Approach {
    road: String,
    arrival_rate: f32,
    queue: VecDeque<QueuedVehicle>,
    discharge_credit: f32,
}

#[derive(Debug, Clone)]
struct QueueJunction {
    approaches: Vec<Approach>,
    phase: usize,
    phase_elapsed: f64,
    yellow_remaining: u32,
    cumulative_waiting: f64,
    cumulative_teleports: u64,
}

/// Seeded queue-model simulator
pub struct QueueSimulator {
    /// Approaches per junction
    topology: BTreeMap<JunctionId, usize>,
    model: QueueModelConfig,
    yellow_secs: u32,
    rng: StdRng,
    time: f64,
    junctions: BTreeMap<JunctionId, QueueJunction>,
    class_mix: Vec<(VehicleClass, f32)>,
    started: bool,
}

impl QueueSimulator {
    pub fn new(
        topology: BTreeMap<JunctionId, usize>,
        model: QueueModelConfig,
        yellow_secs: u32,
    ) -> Self {
        let mut class_mix: Vec<(VehicleClass, f32)> = model
            .class_mix
            .iter()
            .filter(|(_, share)| **share > 0.0)
            .map(|(class, share)| (*class, *share))
            .collect();
        if class_mix.is_empty() {
            class_mix.push((VehicleClass::Car, 1.0));
        }

        Self {
            topology,
            model,
            yellow_secs,
            rng: StdRng::seed_from_u64(0),
            time: 0.0,
            junctions: BTreeMap::new(),
            class_mix,
            started: false,
        }
    }

    /// Simulated seconds since reset
    pub fn time(&self) -> f64 {
        self.time
    }

    fn demand_active(&self) -> bool {
        self.model
            .demand_until_secs
            .is_none_or(|until| self.time < until)
    }

    fn sample_class(&mut self) -> VehicleClass {
        let total: f32 = self.class_mix.iter().map(|(_, share)| share).sum();
        let mut draw = self.rng.random::<f32>() * total;
        for (class, share) in &self.class_mix {
            if draw < *share {
                return *class;
            }
            draw -= share;
        }
        self.class_mix[self.class_mix.len() - 1].0
    }

    fn build_junction(&self, id: &JunctionId, approaches: usize) -> QueueJunction {
        let rates = self.model.arrival_rates.get(id.as_str());
        QueueJunction {
            approaches: (0..approaches)
                .map(|i| Approach {
                    road: format!("{}_in{}", id, i),
                    arrival_rate: rates
                        .and_then(|r| r.get(i).copied())
                        .unwrap_or(self.model.arrival_rate),
                    queue: VecDeque::new(),
                    discharge_credit: 0.0,
                })
                .collect(),
            phase: 0,
            phase_elapsed: 0.0,
            yellow_remaining: 0,
            cumulative_waiting: 0.0,
            cumulative_teleports: 0,
        }
    }

    fn advance_one_second(&mut self) {
        let demand = self.demand_active();
        let saturation_flow = self.model.saturation_flow;
        let teleport_after = self.model.teleport_after_secs;
        let ids: Vec<JunctionId> = self.junctions.keys().cloned().collect();

        for id in ids {
            let count = self.junctions[&id].approaches.len();
            let mut arrivals: Vec<Option<VehicleClass>> = Vec::with_capacity(count);
            for i in 0..count {
                let rate = self.junctions[&id].approaches[i].arrival_rate;
                let arrival = if demand && self.rng.random::<f32>() < rate {
                    Some(self.sample_class())
                } else {
                    None
                };
                arrivals.push(arrival);
            }

            let Some(junction) = self.junctions.get_mut(&id) else {
                continue;
            };
            let in_yellow = junction.yellow_remaining > 0;
            if in_yellow {
                junction.yellow_remaining -= 1;
            }
            let green = junction.phase;

            for (index, (approach, arrival)) in junction
                .approaches
                .iter_mut()
                .zip(arrivals)
                .enumerate()
            {
                if let Some(class) = arrival {
                    approach.queue.push_back(QueuedVehicle {
                        class,
                        waiting: 0.0,
                    });
                }

                if index == green && !in_yellow {
                    approach.discharge_credit += saturation_flow;
                    while approach.discharge_credit >= 1.0 && !approach.queue.is_empty() {
                        approach.queue.pop_front();
                        approach.discharge_credit -= 1.0;
                    }
                    if approach.queue.is_empty() {
                        approach.discharge_credit = 0.0;
                    }
                } else {
                    approach.discharge_credit = 0.0;
                }

                for vehicle in approach.queue.iter_mut() {
                    vehicle.waiting += 1.0;
                }
                junction.cumulative_waiting += approach.queue.len() as f64;

                let before = approach.queue.len();
                approach.queue.retain(|v| v.waiting <= teleport_after);
                junction.cumulative_teleports += (before - approach.queue.len()) as u64;
            }

            junction.phase_elapsed += 1.0;
        }

        self.time += 1.0;
    }
}

impl TrafficSimulator for QueueSimulator {
    fn reset(&mut self, seed: u64) -> Result<Vec<JunctionLayout>, SimulationFailure> {
        self.rng = StdRng::seed_from_u64(seed);
        self.time = 0.0;
        self.junctions = self
            .topology
            .iter()
            .map(|(id, &approaches)| (id.clone(), self.build_junction(id, approaches)))
            .collect();
        self.started = true;

        Ok(self
            .junctions
            .iter()
            .map(|(id, junction)| JunctionLayout {
                id: id.clone(),
                approaches: junction.approaches.iter().map(|a| a.road.clone()).collect(),
                green_phases: junction.approaches.len(),
            })
            .collect())
    }

    fn step(
        &mut self,
        phases: &BTreeMap<JunctionId, usize>,
        seconds: u32,
    ) -> Result<(), SimulationFailure> {
        if !self.started {
            return Err(SimulationFailure::NotStarted);
        }

        for (id, &phase) in phases {
            let yellow_secs = self.yellow_secs;
            let junction = self
                .junctions
                .get_mut(id)
                .ok_or_else(|| SimulationFailure::UnknownJunction(id.clone()))?;
            if phase >= junction.approaches.len() {
                return Err(SimulationFailure::Protocol(format!(
                    "junction `{}` has no green phase {}",
                    id, phase
                )));
            }
            if phase != junction.phase {
                junction.phase = phase;
                junction.phase_elapsed = 0.0;
                junction.yellow_remaining = yellow_secs;
            }
        }

        for _ in 0..seconds {
            self.advance_one_second();
        }
        Ok(())
    }

    fn query(&mut self, junction: &JunctionId) -> Result<JunctionSnapshot, SimulationFailure> {
        if !self.started {
            return Err(SimulationFailure::NotStarted);
        }
        let state = self
            .junctions
            .get(junction)
            .ok_or_else(|| SimulationFailure::UnknownJunction(junction.clone()))?;

        Ok(JunctionSnapshot {
            phase: state.phase,
            phase_elapsed: state.phase_elapsed,
            approaches: state
                .approaches
                .iter()
                .map(|approach| ApproachSnapshot {
                    road: approach.road.clone(),
                    vehicles: approach
                        .queue
                        .iter()
                        .map(|v| VehicleSample {
                            class: v.class,
                            waiting_time: v.waiting,
                            speed: 0.0,
                        })
                        .collect(),
                })
                .collect(),
            cumulative_waiting: state.cumulative_waiting,
            cumulative_teleports: state.cumulative_teleports,
        })
    }

    /// Queued vehicles, plus one while demand is still being generated
    fn expected_vehicles(&mut self) -> Result<u64, SimulationFailure> {
        if !self.started {
            return Err(SimulationFailure::NotStarted);
        }
        let queued: usize = self
            .junctions
            .values()
            .flat_map(|j| j.approaches.iter())
            .map(|a| a.queue.len())
            .sum();
        Ok(queued as u64 + u64::from(self.demand_active()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_junction(model: QueueModelConfig) -> QueueSimulator {
        QueueSimulator::new(BTreeMap::from([(JunctionId::from("J1"), 2)]), model, 0)
    }

    fn car_only(rate: f32) -> QueueModelConfig {
        QueueModelConfig {
            arrival_rate: rate,
            class_mix: BTreeMap::from([(VehicleClass::Car, 1.0)]),
            ..QueueModelConfig::default()
        }
    }

    fn queue_lengths(sim: &mut QueueSimulator) -> Vec<usize> {
        sim.query(&JunctionId::from("J1"))
            .unwrap()
            .approaches
            .iter()
            .map(|a| a.vehicles.len())
            .collect()
    }

    #[test]
    fn test_reset_describes_layout() {
        let mut sim = single_junction(car_only(0.1));
        let layout = sim.reset(7).unwrap();
        assert_eq!(layout.len(), 1);
        assert_eq!(layout[0].green_phases, 2);
        assert_eq!(layout[0].approaches, vec!["J1_in0", "J1_in1"]);
    }

    #[test]
    fn test_step_before_reset_fails() {
        let mut sim = single_junction(car_only(0.1));
        assert!(matches!(
            sim.step(&BTreeMap::new(), 1),
            Err(SimulationFailure::NotStarted)
        ));
    }

    #[test]
    fn test_green_approach_discharges() {
        let mut sim = single_junction(QueueModelConfig {
            saturation_flow: 1.0,
            ..car_only(1.0)
        });
        sim.reset(1).unwrap();
        let phases = BTreeMap::from([(JunctionId::from("J1"), 0)]);
        sim.step(&phases, 20).unwrap();

        let lengths = queue_lengths(&mut sim);
        assert_eq!(lengths[0], 0, "green approach keeps up with arrivals");
        assert_eq!(lengths[1], 20, "red approach accumulates every arrival");
    }

    #[test]
    fn test_yellow_costs_discharge_time() {
        let mut sim = QueueSimulator::new(
            BTreeMap::from([(JunctionId::from("J1"), 2)]),
            QueueModelConfig {
                saturation_flow: 1.0,
                ..car_only(1.0)
            },
            3,
        );
        sim.reset(1).unwrap();
        let to_phase_one = BTreeMap::from([(JunctionId::from("J1"), 1)]);
        sim.step(&to_phase_one, 3).unwrap();

        let snapshot = sim.query(&JunctionId::from("J1")).unwrap();
        assert_eq!(snapshot.phase, 1);
        assert_eq!(snapshot.approaches[1].vehicles.len(), 3, "no discharge during yellow");
    }

    #[test]
    fn test_stuck_vehicles_teleport() {
        let mut sim = single_junction(QueueModelConfig {
            teleport_after_secs: 5.0,
            demand_until_secs: Some(1.0),
            ..car_only(1.0)
        });
        sim.reset(3).unwrap();
        let hold = BTreeMap::from([(JunctionId::from("J1"), 0)]);
        sim.step(&hold, 10).unwrap();

        let snapshot = sim.query(&JunctionId::from("J1")).unwrap();
        assert_eq!(snapshot.cumulative_teleports, 1);
        assert!(snapshot.approaches[1].vehicles.is_empty());
        assert_eq!(sim.expected_vehicles().unwrap(), 0);
    }

    #[test]
    fn test_same_seed_same_trajectory() {
        let model = QueueModelConfig::default();
        let mut a = single_junction(model.clone());
        let mut b = single_junction(model);
        a.reset(99).unwrap();
        b.reset(99).unwrap();
        let phases = BTreeMap::from([(JunctionId::from("J1"), 1)]);
        for _ in 0..10 {
            a.step(&phases, 10).unwrap();
            b.step(&phases, 10).unwrap();
        }
        assert_eq!(
            a.query(&JunctionId::from("J1")).unwrap(),
            b.query(&JunctionId::from("J1")).unwrap()
        );
    }

    #[test]
    fn test_unknown_junction_rejected() {
        let mut sim = single_junction(car_only(0.1));
        sim.reset(1).unwrap();
        let phases = BTreeMap::from([(JunctionId::from("nope"), 0)]);
        assert!(matches!(
            sim.step(&phases, 1),
            Err(SimulationFailure::UnknownJunction(_))
        ));
    }
}
