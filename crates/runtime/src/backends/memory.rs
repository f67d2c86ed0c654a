//! In-memory container runtime for tests and dry runs.
//!
//! Nothing is launched. Started containers are recorded, `exec` answers
//! readiness checks from a script and echoes every other command.

use crate::error::{RuntimeError, RuntimeResult};
use crate::traits::{ContainerRuntime, ContainerSpec, ExecOutput, RunningContainer};
use async_trait::async_trait;
use cask_core::names::random_name;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use tokio::sync::Mutex;

const FIRST_MAPPED_PORT: u16 = 49_000;

#[derive(Default)]
struct MemoryState {
    networks: Vec<String>,
    started: Vec<ContainerSpec>,
    stopped: Vec<String>,
    execs: Vec<(String, Vec<String>)>,
    responses: HashMap<String, ExecOutput>,
    readiness_failures_left: usize,
    fail_start: Option<String>,
}

/// A scripted, in-memory [`ContainerRuntime`].
#[derive(Clone)]
pub struct MemoryRuntime {
    state: Arc<Mutex<MemoryState>>,
    ready: Arc<AtomicBool>,
    next_port: Arc<AtomicU16>,
}

impl Default for MemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            ready: Arc::new(AtomicBool::new(true)),
            next_port: Arc::new(AtomicU16::new(FIRST_MAPPED_PORT)),
        }
    }

    /// Fail the first `attempts` readiness checks.
    pub async fn fail_readiness(&self, attempts: usize) {
        self.state.lock().await.readiness_failures_left = attempts;
    }

    /// Make every readiness check fail (or succeed again) from now on.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Make every container start fail with `message`.
    pub async fn fail_start(&self, message: impl Into<String>) {
        self.state.lock().await.fail_start = Some(message.into());
    }

    /// Answer commands whose program is `program` with `output`.
    pub async fn respond_to(&self, program: impl Into<String>, output: ExecOutput) {
        self.state.lock().await.responses.insert(program.into(), output);
    }

    pub async fn networks(&self) -> Vec<String> {
        self.state.lock().await.networks.clone()
    }

    pub async fn started(&self) -> Vec<ContainerSpec> {
        self.state.lock().await.started.clone()
    }

    pub async fn stopped(&self) -> Vec<String> {
        self.state.lock().await.stopped.clone()
    }

    /// Every executed command with the name of its container.
    pub async fn exec_log(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().await.execs.clone()
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn create_network(&self) -> RuntimeResult<String> {
        let network = random_name("cask_net");
        self.state.lock().await.networks.push(network.clone());
        Ok(network)
    }

    async fn start(&self, spec: ContainerSpec) -> RuntimeResult<Box<dyn RunningContainer>> {
        let mut state = self.state.lock().await;
        if let Some(message) = &state.fail_start {
            return Err(RuntimeError::Container(message.clone()));
        }
        state.started.push(spec.clone());
        Ok(Box::new(MemoryContainer {
            name: spec.name,
            mapped_port: self.next_port.fetch_add(1, Ordering::SeqCst),
            runtime: self.clone(),
            stopped: AtomicBool::new(false),
        }))
    }
}

struct MemoryContainer {
    name: String,
    mapped_port: u16,
    runtime: MemoryRuntime,
    stopped: AtomicBool,
}

#[async_trait]
impl RunningContainer for MemoryContainer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn host(&self) -> RuntimeResult<String> {
        Ok("127.0.0.1".to_string())
    }

    async fn mapped_port(&self, _port: u16) -> RuntimeResult<u16> {
        Ok(self.mapped_port)
    }

    async fn exec(&self, command: &[String]) -> RuntimeResult<ExecOutput> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RuntimeError::Exec(format!("container {} is stopped", self.name)));
        }

        let mut state = self.runtime.state.lock().await;
        state.execs.push((self.name.clone(), command.to_vec()));

        let program = command.first().map(String::as_str).unwrap_or_default();
        if program == "pg_isready" {
            let ready = if state.readiness_failures_left > 0 {
                state.readiness_failures_left -= 1;
                false
            } else {
                self.runtime.ready.load(Ordering::SeqCst)
            };
            return Ok(if ready {
                ExecOutput {
                    exit_code: 0,
                    output: "accepting connections\n".to_string(),
                }
            } else {
                ExecOutput {
                    exit_code: 2,
                    output: "no response\n".to_string(),
                }
            });
        }

        if let Some(output) = state.responses.get(program) {
            return Ok(output.clone());
        }
        Ok(ExecOutput {
            exit_code: 0,
            output: command.join(" "),
        })
    }

    async fn stop(&self) -> RuntimeResult<()> {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.runtime.state.lock().await.stopped.push(self.name.clone());
        }
        Ok(())
    }
}
