//! Test support utilities shared across unit and integration tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;

use crate::error::{Error, Operation};
use crate::provider::{
    ExecOutput, ExecRequest, GithubBootstrap, Machine, MachineSpec, MachineState, Provider,
    ProviderFuture,
};

/// Records a single call made through [`MockProvider`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProviderInvocation {
    /// Plain creation path.
    CreateMachine {
        /// Requested machine name.
        name: String,
    },
    /// GitHub bootstrap creation path.
    CreateMachineWithGithub {
        /// Requested machine name.
        name: String,
        /// Repository to clone on boot.
        repo_url: String,
    },
    /// Machine fetch.
    GetMachine {
        /// Backend-native id.
        id: String,
    },
    /// Machine listing.
    ListMachines,
    /// Machine start.
    StartMachine {
        /// Backend-native id.
        id: String,
    },
    /// Machine stop.
    StopMachine {
        /// Backend-native id.
        id: String,
    },
    /// Machine teardown.
    DestroyMachine {
        /// Backend-native id.
        id: String,
    },
    /// Remote command execution.
    ExecuteCommand {
        /// Backend-native id.
        id: String,
        /// Rendered shell string.
        command: String,
        /// Caller timeout as passed to the provider.
        timeout: Duration,
    },
}

/// In-memory provider double with scripted outcomes.
///
/// Machines live in a mutexed map; exec results and per-operation failures
/// are consumed in FIFO order. Every call is recorded so tests can assert
/// which provider paths ran (and, for validation properties, that none
/// did).
#[derive(Debug, Default)]
pub struct MockProvider {
    machines: Mutex<HashMap<String, Machine>>,
    create_state: Mutex<Option<MachineState>>,
    start_state: Mutex<Option<MachineState>>,
    exec_results: Mutex<VecDeque<Result<ExecOutput, Error>>>,
    failures: Mutex<HashMap<Operation, VecDeque<Option<Error>>>>,
    exec_delay: Mutex<Option<Duration>>,
    invocations: Mutex<Vec<ProviderInvocation>>,
    counter: AtomicU64,
}

impl MockProvider {
    /// Creates a provider whose new machines report `started`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the state newly created machines report.
    pub fn set_create_state(&self, state: MachineState) {
        *lock(&self.create_state) = Some(state);
    }

    /// Queues one exec outcome; consumed before the default echo behaviour.
    pub fn push_exec_result(&self, result: Result<ExecOutput, Error>) {
        lock(&self.exec_results).push_back(result);
    }

    /// Queues one failure for the named operation.
    pub fn push_failure(&self, operation: Operation, error: Error) {
        lock(&self.failures)
            .entry(operation)
            .or_default()
            .push_back(Some(error));
    }

    /// Queues one pass-through slot for the named operation, letting a later
    /// queued failure target a specific call in a sequence.
    pub fn push_success(&self, operation: Operation) {
        lock(&self.failures)
            .entry(operation)
            .or_default()
            .push_back(None);
    }

    /// Overrides the state machines report after a start call, simulating a
    /// boot that does not reach running.
    pub fn set_start_state(&self, state: MachineState) {
        *lock(&self.start_state) = Some(state);
    }

    /// Delays every exec call, simulating an unresponsive backend.
    pub fn set_exec_delay(&self, delay: Duration) {
        *lock(&self.exec_delay) = Some(delay);
    }

    /// Forces the stored state of an existing machine.
    pub fn set_machine_state(&self, id: &str, state: MachineState) {
        if let Some(machine) = lock(&self.machines).get_mut(id) {
            machine.state = state;
        }
    }

    /// Returns a snapshot of all recorded invocations.
    #[must_use]
    pub fn invocations(&self) -> Vec<ProviderInvocation> {
        lock(&self.invocations).clone()
    }

    /// Number of recorded invocations.
    #[must_use]
    pub fn invocation_count(&self) -> usize {
        lock(&self.invocations).len()
    }

    fn record(&self, invocation: ProviderInvocation) {
        lock(&self.invocations).push(invocation);
    }

    fn take_failure(&self, operation: Operation) -> Option<Error> {
        lock(&self.failures)
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
            .flatten()
    }

    fn insert_machine(&self, spec: &MachineSpec) -> Machine {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let state = lock(&self.create_state).unwrap_or(MachineState::Started);
        let machine = Machine {
            id: format!("mock-{n}"),
            name: spec.name.clone(),
            state,
            region: spec.region.clone(),
            image: Some(spec.image.clone()),
            size: Some(spec.size.clone()),
            memory_mb: Some(spec.memory_mb),
            private_ip: Some(format!("fdaa:0:1::{n}")),
            created_at: Some(Utc::now()),
            updated_at: Some(Utc::now()),
            metadata: spec.metadata.clone(),
        };
        lock(&self.machines).insert(machine.id.clone(), machine.clone());
        machine
    }

    fn machine(&self, id: &str) -> Result<Machine, Error> {
        lock(&self.machines)
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("machine", id))
    }

    fn transition(&self, id: &str, state: MachineState) -> Result<Machine, Error> {
        let mut machines = lock(&self.machines);
        let Some(machine) = machines.get_mut(id) else {
            return Err(Error::not_found("machine", id));
        };
        machine.state = state;
        Ok(machine.clone())
    }
}

impl Provider for MockProvider {
    fn create_machine<'a>(&'a self, spec: &'a MachineSpec) -> ProviderFuture<'a, Machine> {
        Box::pin(async move {
            self.record(ProviderInvocation::CreateMachine {
                name: spec.name.clone(),
            });
            if let Some(error) = self.take_failure(Operation::Create) {
                return Err(error);
            }
            Ok(self.insert_machine(spec))
        })
    }

    fn create_machine_with_github<'a>(
        &'a self,
        spec: &'a MachineSpec,
        bootstrap: &'a GithubBootstrap,
    ) -> ProviderFuture<'a, Machine> {
        Box::pin(async move {
            self.record(ProviderInvocation::CreateMachineWithGithub {
                name: spec.name.clone(),
                repo_url: bootstrap.repo_url.clone(),
            });
            if let Some(error) = self.take_failure(Operation::Create) {
                return Err(error);
            }
            Ok(self.insert_machine(spec))
        })
    }

    fn get_machine<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, Machine> {
        Box::pin(async move {
            self.record(ProviderInvocation::GetMachine { id: id.to_owned() });
            if let Some(error) = self.take_failure(Operation::Get) {
                return Err(error);
            }
            self.machine(id)
        })
    }

    fn list_machines(&self) -> ProviderFuture<'_, Vec<Machine>> {
        Box::pin(async move {
            self.record(ProviderInvocation::ListMachines);
            if let Some(error) = self.take_failure(Operation::List) {
                return Err(error);
            }
            Ok(lock(&self.machines).values().cloned().collect())
        })
    }

    fn start_machine<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, Machine> {
        Box::pin(async move {
            self.record(ProviderInvocation::StartMachine { id: id.to_owned() });
            if let Some(error) = self.take_failure(Operation::Start) {
                return Err(error);
            }
            let state = lock(&self.start_state).unwrap_or(MachineState::Started);
            self.transition(id, state)
        })
    }

    fn stop_machine<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, Machine> {
        Box::pin(async move {
            self.record(ProviderInvocation::StopMachine { id: id.to_owned() });
            if let Some(error) = self.take_failure(Operation::Stop) {
                return Err(error);
            }
            self.transition(id, MachineState::Stopped)
        })
    }

    fn destroy_machine<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.record(ProviderInvocation::DestroyMachine { id: id.to_owned() });
            if let Some(error) = self.take_failure(Operation::Destroy) {
                return Err(error);
            }
            if lock(&self.machines).remove(id).is_none() {
                return Err(Error::not_found("machine", id));
            }
            Ok(())
        })
    }

    fn execute_command<'a>(
        &'a self,
        id: &'a str,
        request: &'a ExecRequest,
    ) -> ProviderFuture<'a, ExecOutput> {
        Box::pin(async move {
            self.record(ProviderInvocation::ExecuteCommand {
                id: id.to_owned(),
                command: request.command.clone(),
                timeout: request.timeout,
            });
            if let Some(error) = self.take_failure(Operation::Execute) {
                return Err(error);
            }
            let delay = *lock(&self.exec_delay);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.machine(id)?;
            if let Some(result) = lock(&self.exec_results).pop_front() {
                return result;
            }
            Ok(default_exec_output(&request.command))
        })
    }
}

/// Default exec behaviour: `echo` reproduces its arguments, everything else
/// succeeds silently.
fn default_exec_output(command: &str) -> ExecOutput {
    let stdout = command
        .strip_prefix("echo ")
        .map_or_else(String::new, |rest| format!("{rest}\n"));
    ExecOutput {
        stdout,
        stderr: String::new(),
        exit_code: Some(0),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
