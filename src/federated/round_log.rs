//! Aggregate training logs: `training_log.csv` and `training_log.json`

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::TrainingError;

use super::coordinator::{RoundStatus, TrainingRound};

const CSV_FILE: &str = "training_log.csv";
const JSON_FILE: &str = "training_log.json";
const CSV_HEADER: &str =
    "round,mean_reward,mean_loss,policy_loss,value_loss,entropy,samples,participants,dropouts";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropoutRecord {
    pub junction: String,
    pub reason: String,
}

/// Serialized form of one `TrainingRound`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub attempt: u64,
    pub round: u64,
    pub status: RoundStatus,
    pub mean_reward: f32,
    pub mean_loss: f32,
    pub policy_loss: f32,
    pub value_loss: f32,
    pub entropy: f32,
    pub samples: usize,
    pub participants: Vec<String>,
    pub dropouts: Vec<DropoutRecord>,
}

impl From<&TrainingRound> for RoundRecord {
    fn from(round: &TrainingRound) -> Self {
        Self {
            attempt: round.attempt,
            round: round.round,
            status: round.status,
            mean_reward: round.mean_reward,
            mean_loss: round.mean_loss,
            policy_loss: round.policy_loss,
            value_loss: round.value_loss,
            entropy: round.entropy,
            samples: round.samples,
            participants: round.participants.iter().map(|j| j.to_string()).collect(),
            dropouts: round
                .dropouts
                .iter()
                .map(|d| DropoutRecord {
                    junction: d.junction.to_string(),
                    reason: d.reason.to_string(),
                })
                .collect(),
        }
    }
}

impl RoundRecord {
    fn csv_row(&self) -> String {
        format!(
            "{},{:.6},{:.6},{:.6},{:.6},{:.6},{},{},{}",
            self.round,
            self.mean_reward,
            self.mean_loss,
            self.policy_loss,
            self.value_loss,
            self.entropy,
            self.samples,
            self.participants.len(),
            self.dropouts.len()
        )
    }
}

/// Appends aggregated rounds to the CSV and rewrites the JSON history
#[derive(Debug)]
pub struct RoundLog {
    dir: PathBuf,
    records: Vec<RoundRecord>,
}

impl RoundLog {
    /// Open `dir`, picking up an existing JSON history so resumed runs
    /// keep appending
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let json = dir.join(JSON_FILE);
        let records = match fs::read_to_string(&json) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable training history {}: {}", json.display(), e);
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };
        Self { dir, records }
    }

    pub fn csv_path(&self) -> PathBuf {
        self.dir.join(CSV_FILE)
    }

    pub fn json_path(&self) -> PathBuf {
        self.dir.join(JSON_FILE)
    }

    pub fn records(&self) -> &[RoundRecord] {
        &self.records
    }

    pub fn append(&mut self, round: &TrainingRound) -> Result<(), TrainingError> {
        let record = RoundRecord::from(round);

        let csv = self.csv_path();
        if record.status == RoundStatus::Aggregated {
            append_csv(&csv, &record.csv_row()).map_err(|source| TrainingError::Log {
                path: csv.clone(),
                source,
            })?;
        }

        self.records.push(record);
        let json = self.json_path();
        write_json(&json, &self.records).map_err(|source| TrainingError::Log { path: json, source })
    }
}

fn append_csv(path: &Path, row: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let fresh = !path.exists();
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if fresh {
        writeln!(file, "{}", CSV_HEADER)?;
    }
    writeln!(file, "{}", row)
}

fn write_json(path: &Path, records: &[RoundRecord]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string_pretty(records).map_err(io::Error::other)?;
    fs::write(path, text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use crate::federated::coordinator::{Dropout, DropoutReason};
    use crate::sim::JunctionId;

    fn round(attempt: u64, round: u64, status: RoundStatus) -> TrainingRound {
        TrainingRound {
            attempt,
            round,
            status,
            participants: vec![JunctionId::from("J1"), JunctionId::from("J2")],
            dropouts: vec![Dropout {
                junction: JunctionId::from("J3"),
                reason: DropoutReason::Failed(ClientError::EmptyRollout),
            }],
            mean_reward: -1.5,
            mean_loss: 0.25,
            policy_loss: 0.1,
            value_loss: 0.3,
            entropy: 0.6,
            samples: 128,
            ticks: 64,
        }
    }

    #[test]
    fn test_csv_has_header_and_aggregated_rows_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = RoundLog::open(dir.path());
        log.append(&round(1, 1, RoundStatus::Aggregated)).unwrap();
        log.append(&round(2, 1, RoundStatus::Abandoned)).unwrap();
        log.append(&round(3, 2, RoundStatus::Aggregated)).unwrap();

        let csv = fs::read_to_string(log.csv_path()).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER);
        assert!(lines[1].starts_with("1,-1.500000,0.250000"));
        assert!(lines[1].ends_with(",128,2,1"));
        assert!(lines[2].starts_with("2,"));
    }

    #[test]
    fn test_json_history_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut log = RoundLog::open(dir.path());
            log.append(&round(1, 1, RoundStatus::Aggregated)).unwrap();
            log.append(&round(2, 1, RoundStatus::Discarded)).unwrap();
        }
        let mut log = RoundLog::open(dir.path());
        assert_eq!(log.records().len(), 2);
        assert_eq!(log.records()[1].status, RoundStatus::Discarded);
        assert_eq!(log.records()[0].dropouts[0].junction, "J3");

        log.append(&round(3, 2, RoundStatus::Aggregated)).unwrap();
        let text = fs::read_to_string(log.json_path()).unwrap();
        let records: Vec<RoundRecord> = serde_json::from_str(&text).unwrap();
        assert_eq!(records.len(), 3);
    }
}
