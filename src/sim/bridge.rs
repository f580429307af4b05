//! External simulator bridge
//!
//! Talks to a bridge process (for example a TraCI shim in front of a
//! microsimulator) over newline-delimited JSON on its stdin/stdout. One
//! request line, one response line:
//!
//! ```text
//! > {"op":"reset","seed":42}
//! < {"ok":true,"layout":[{"id":"J1","approaches":["e1","e2"],"green_phases":2}]}
//! > {"op":"step","phases":{"J1":1},"seconds":10}
//! < {"ok":true}
//! > {"op":"query","junction":"J1"}
//! < {"ok":true,"snapshot":{...}}
//! ```

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use serde::{Deserialize, Serialize};

use crate::error::SimulationFailure;

use super::{JunctionId, JunctionLayout, JunctionSnapshot, TrafficSimulator};

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum BridgeRequest<'a> {
    Reset {
        seed: u64,
    },
    Step {
        phases: &'a BTreeMap<JunctionId, usize>,
        seconds: u32,
    },
    Query {
        junction: &'a JunctionId,
    },
    ExpectedVehicles,
    Close,
}

#[derive(Debug, Deserialize)]
struct BridgeResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    layout: Option<Vec<JunctionLayout>>,
    #[serde(default)]
    snapshot: Option<JunctionSnapshot>,
    #[serde(default)]
    expected_vehicles: Option<u64>,
}

/// Request/response channel over any line-oriented transport
pub struct BridgeConnection<R: BufRead, W: Write> {
    reader: R,
    writer: W,
    line: String,
}

impl<R: BufRead, W: Write> BridgeConnection<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            line: String::new(),
        }
    }

    fn request(&mut self, request: &BridgeRequest<'_>) -> Result<BridgeResponse, SimulationFailure> {
        let encoded = serde_json::to_string(request)
            .map_err(|e| SimulationFailure::Protocol(format!("encode request: {}", e)))?;
        writeln!(self.writer, "{}", encoded)
            .and_then(|_| self.writer.flush())
            .map_err(|e| SimulationFailure::Exited(format!("write to bridge: {}", e)))?;

        self.line.clear();
        let read = self
            .reader
            .read_line(&mut self.line)
            .map_err(|e| SimulationFailure::Exited(format!("read from bridge: {}", e)))?;
        if read == 0 {
            return Err(SimulationFailure::Exited(
                "bridge closed its output".to_string(),
            ));
        }

        let response: BridgeResponse = serde_json::from_str(self.line.trim_end())
            .map_err(|e| SimulationFailure::Protocol(format!("malformed reply: {}", e)))?;
        if !response.ok {
            return Err(SimulationFailure::Protocol(
                response
                    .error
                    .unwrap_or_else(|| "bridge reported an unspecified error".to_string()),
            ));
        }
        Ok(response)
    }

    fn reset(&mut self, seed: u64) -> Result<Vec<JunctionLayout>, SimulationFailure> {
        self.request(&BridgeRequest::Reset { seed })?
            .layout
            .ok_or_else(|| SimulationFailure::Protocol("reset reply without layout".into()))
    }

    fn step(
        &mut self,
        phases: &BTreeMap<JunctionId, usize>,
        seconds: u32,
    ) -> Result<(), SimulationFailure> {
        self.request(&BridgeRequest::Step { phases, seconds })
            .map(|_| ())
    }

    fn query(&mut self, junction: &JunctionId) -> Result<JunctionSnapshot, SimulationFailure> {
        self.request(&BridgeRequest::Query { junction })?
            .snapshot
            .ok_or_else(|| SimulationFailure::Protocol("query reply without snapshot".into()))
    }

    fn expected_vehicles(&mut self) -> Result<u64, SimulationFailure> {
        self.request(&BridgeRequest::ExpectedVehicles)?
            .expected_vehicles
            .ok_or_else(|| {
                SimulationFailure::Protocol("expected_vehicles reply without count".into())
            })
    }
}

/// Simulator living in a child process
pub struct ProcessSimulator {
    command: String,
    args: Vec<String>,
    child: Option<Child>,
    connection: Option<BridgeConnection<BufReader<ChildStdout>, ChildStdin>>,
}

impl ProcessSimulator {
    pub fn new(command: String, args: Vec<String>) -> Self {
        Self {
            command,
            args,
            child: None,
            connection: None,
        }
    }

    fn spawn(&mut self) -> Result<(), SimulationFailure> {
        let start_failure = |reason: String| SimulationFailure::Start {
            command: self.command.clone(),
            reason,
        };

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| start_failure(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| start_failure("no stdin pipe".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| start_failure("no stdout pipe".into()))?;

        tracing::info!("Started simulator bridge `{}` (pid {})", self.command, child.id());
        self.connection = Some(BridgeConnection::new(BufReader::new(stdout), stdin));
        self.child = Some(child);
        Ok(())
    }

    fn has_exited(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }

    fn connection(
        &mut self,
    ) -> Result<&mut BridgeConnection<BufReader<ChildStdout>, ChildStdin>, SimulationFailure> {
        self.connection.as_mut().ok_or(SimulationFailure::NotStarted)
    }
}

impl TrafficSimulator for ProcessSimulator {
    fn reset(&mut self, seed: u64) -> Result<Vec<JunctionLayout>, SimulationFailure> {
        if self.has_exited() {
            if self.child.is_some() {
                tracing::warn!("Simulator bridge `{}` exited, restarting", self.command);
            }
            self.close();
            self.spawn()?;
        }
        self.connection()?.reset(seed)
    }

    fn step(
        &mut self,
        phases: &BTreeMap<JunctionId, usize>,
        seconds: u32,
    ) -> Result<(), SimulationFailure> {
        self.connection()?.step(phases, seconds)
    }

    fn query(&mut self, junction: &JunctionId) -> Result<JunctionSnapshot, SimulationFailure> {
        self.connection()?.query(junction)
    }

    fn expected_vehicles(&mut self) -> Result<u64, SimulationFailure> {
        self.connection()?.expected_vehicles()
    }

    fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            let _ = connection.request(&BridgeRequest::Close);
        }
        if let Some(mut child) = self.child.take() {
            if matches!(child.try_wait(), Ok(None)) {
                let _ = child.kill();
            }
            let _ = child.wait();
        }
    }
}

impl Drop for ProcessSimulator {
    fn drop(&mut self) {
        self.close();
    }
}
