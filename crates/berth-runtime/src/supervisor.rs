//! The process supervisor.
//!
//! Owns the worker pool of one service. Every worker shares the listening
//! socket bound once by the engine. The supervisor polls its children on a
//! fixed tick, promotes survivors to `Running`, applies the restart policy
//! to crashes and publishes a status snapshot through a `watch` channel.

use std::time::{Duration, Instant};

use berth_common::config::SupervisorSettings;
use berth_common::error::{BerthError, Result};
use berth_common::types::{ServiceState, WorkerState};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::listener::SharedListener;
use crate::restart::RestartPolicy;
use crate::worker::{Worker, WorkerExit, WorkerSnapshot, WorkerSpec};

/// Poll interval for worker exits and state transitions.
const TICK: Duration = Duration::from_millis(50);

/// Consecutive crashes of one slot after which the loop is called out.
const CRASH_LOOP_THRESHOLD: u32 = 5;

/// Pool size and timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorOptions {
    /// Number of workers.
    pub workers: usize,
    /// Survival time before a worker counts as running.
    pub ready_after: Duration,
    /// Run time after which the crash counter resets.
    pub stable_after: Duration,
    /// Grace period between SIGTERM and SIGKILL.
    pub graceful_timeout: Duration,
}

impl SupervisorOptions {
    /// Takes the timing from `settings` with an explicit pool size.
    #[must_use]
    pub const fn from_settings(settings: &SupervisorSettings, workers: usize) -> Self {
        Self {
            workers,
            ready_after: settings.ready_after(),
            stable_after: settings.stable_after(),
            graceful_timeout: settings.graceful_timeout(),
        }
    }
}

/// Status snapshot published to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    /// Overall service state.
    pub state: ServiceState,
    /// One entry per worker slot.
    pub workers: Vec<WorkerSnapshot>,
    /// Worker restarts since the service started.
    pub restarts: u64,
}

impl ServiceStatus {
    fn starting(workers: usize) -> Self {
        Self {
            state: ServiceState::Starting,
            workers: (0..workers)
                .map(|slot| WorkerSnapshot {
                    slot,
                    pid: None,
                    state: WorkerState::Starting,
                    restarts: 0,
                    uptime_ms: 0,
                    last_exit: None,
                })
                .collect(),
            restarts: 0,
        }
    }

    /// Returns the number of workers in `Running`.
    #[must_use]
    pub fn running_workers(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.state == WorkerState::Running)
            .count()
    }
}

#[derive(Debug)]
enum Slot {
    Live(Worker),
    Pending { due: Instant },
    Done(WorkerState),
}

#[derive(Debug)]
struct SlotState {
    slot: Slot,
    attempts: u32,
    restarts: u32,
    last_exit: Option<WorkerExit>,
    last_pid: Option<u32>,
}

impl SlotState {
    fn snapshot(&self, index: usize) -> WorkerSnapshot {
        match &self.slot {
            Slot::Live(worker) => worker.snapshot(self.restarts, self.last_exit),
            Slot::Pending { .. } => self.idle_snapshot(
                index,
                if self.last_exit.is_some() {
                    WorkerState::Crashed
                } else {
                    WorkerState::Starting
                },
            ),
            Slot::Done(state) => self.idle_snapshot(index, *state),
        }
    }

    const fn idle_snapshot(&self, slot: usize, state: WorkerState) -> WorkerSnapshot {
        WorkerSnapshot {
            slot,
            pid: self.last_pid,
            state,
            restarts: self.restarts,
            uptime_ms: 0,
            last_exit: self.last_exit,
        }
    }
}

/// What one poll of a slot found.
enum Event {
    Idle,
    Exited {
        exit: WorkerExit,
        pid: u32,
        was_starting: bool,
    },
    Due,
}

enum Step {
    Continue,
    Done(Result<()>),
}

/// Supervises the worker pool of one service.
#[derive(Debug)]
pub struct Supervisor {
    service: String,
    spec: WorkerSpec,
    listener: Option<SharedListener>,
    policy: Box<dyn RestartPolicy>,
    options: SupervisorOptions,
    status: watch::Sender<ServiceStatus>,
    restarts: u64,
}

impl Supervisor {
    /// Creates a supervisor. Workers inherit `listener` when given;
    /// otherwise each worker binds its own address.
    #[must_use]
    pub fn new(
        service: impl Into<String>,
        spec: WorkerSpec,
        listener: Option<SharedListener>,
        policy: Box<dyn RestartPolicy>,
        options: SupervisorOptions,
    ) -> Self {
        let (status, _) = watch::channel(ServiceStatus::starting(options.workers));
        Self {
            service: service.into(),
            spec,
            listener,
            policy,
            options,
            status,
            restarts: 0,
        }
    }

    /// Returns a receiver of status snapshots.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ServiceStatus> {
        self.status.subscribe()
    }

    /// Runs the pool until `shutdown` becomes `true` (or its sender is
    /// dropped), or until no worker is left to run.
    ///
    /// # Errors
    ///
    /// Returns `BerthError::EntryPoint` if a worker fails to load the
    /// application, `BerthError::WorkerCrash` if the restart policy gave up,
    /// or an error if a worker cannot be spawned or polled.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::info!(
            service = %self.service,
            workers = self.options.workers,
            shared_socket = self.listener.is_some(),
            "supervisor starting"
        );
        let now = Instant::now();
        let mut slots: Vec<SlotState> = (0..self.options.workers)
            .map(|_| SlotState {
                slot: Slot::Pending { due: now },
                attempts: 0,
                restarts: 0,
                last_exit: None,
                last_pid: None,
            })
            .collect();

        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow_and_update() {
                return self.shutdown(&mut slots).await;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return self.shutdown(&mut slots).await;
                    }
                }
                _ = tick.tick() => {
                    if let Step::Done(outcome) = self.step(&mut slots).await {
                        return outcome;
                    }
                }
            }
        }
    }

    async fn step(&mut self, slots: &mut [SlotState]) -> Step {
        let now = Instant::now();
        for index in 0..slots.len() {
            let event = match poll_slot(&mut slots[index], now, &self.options) {
                Ok(event) => event,
                Err(e) => return self.fail(slots, e).await,
            };
            match event {
                Event::Idle => {}
                Event::Due => {
                    let state = &mut slots[index];
                    match Worker::spawn(index, &self.spec, self.listener.as_ref()) {
                        Ok(worker) => {
                            if let Some(exit) = state.last_exit {
                                state.restarts += 1;
                                self.restarts += 1;
                                tracing::info!(
                                    service = %self.service,
                                    worker = index,
                                    pid = worker.pid(),
                                    attempt = state.attempts,
                                    "worker restarted"
                                );
                                self.service_log(&format!(
                                    "worker {index} restarted as pid {} after {exit}",
                                    worker.pid()
                                ));
                            } else {
                                self.service_log(&format!(
                                    "worker {index} started as pid {}",
                                    worker.pid()
                                ));
                            }
                            state.slot = Slot::Live(worker);
                        }
                        Err(e) => return self.fail(slots, e).await,
                    }
                }
                Event::Exited {
                    exit,
                    pid,
                    was_starting,
                } => {
                    if let Some(err) = self.on_exit(&mut slots[index], index, exit, pid, was_starting, now) {
                        return self.fail(slots, err).await;
                    }
                }
            }
        }
        self.settle(slots)
    }

    /// Applies the exit of a worker to its slot. Returns a fatal error when
    /// the application could not be loaded.
    fn on_exit(
        &self,
        state: &mut SlotState,
        index: usize,
        exit: WorkerExit,
        pid: u32,
        was_starting: bool,
        now: Instant,
    ) -> Option<BerthError> {
        state.last_exit = Some(exit);
        state.last_pid = Some(pid);

        if exit.is_clean() {
            tracing::info!(service = %self.service, worker = index, pid, exit = %exit, "worker terminated");
            self.service_log(&format!("worker {index} (pid {pid}) terminated: {exit}"));
            state.slot = Slot::Done(WorkerState::Terminated);
            return None;
        }

        if was_starting && exit.is_load_failure() {
            tracing::error!(service = %self.service, worker = index, pid, exit = %exit, "application failed to load");
            self.service_log(&format!("worker {index} (pid {pid}) failed to load the application: {exit}"));
            state.slot = Slot::Done(WorkerState::Crashed);
            return Some(BerthError::EntryPoint {
                message: format!("worker {index} could not load the application ({exit})"),
            });
        }

        state.attempts += 1;
        tracing::error!(
            service = %self.service,
            worker = index,
            pid,
            exit = %exit,
            attempt = state.attempts,
            "worker crashed"
        );
        self.service_log(&format!(
            "worker {index} (pid {pid}) crashed: {exit} (attempt {})",
            state.attempts
        ));

        if !self.policy.should_restart(state.attempts, &exit) {
            tracing::warn!(service = %self.service, worker = index, "restart policy gave up");
            self.service_log(&format!("worker {index} will not be restarted"));
            state.slot = Slot::Done(WorkerState::Crashed);
            return None;
        }

        if state.attempts > CRASH_LOOP_THRESHOLD && self.policy.is_unbounded() {
            tracing::warn!(
                service = %self.service,
                worker = index,
                attempts = state.attempts,
                "crash loop under an unbounded restart policy; only log-based alerting will notice"
            );
            self.service_log(&format!(
                "crash loop: worker {index} crashed {} times in a row, restarting without limit",
                state.attempts
            ));
        }
        let delay = self.policy.backoff(state.attempts);
        tracing::debug!(service = %self.service, worker = index, delay_ms = delay.as_millis(), "restart scheduled");
        state.slot = Slot::Pending { due: now + delay };
        None
    }

    /// Publishes the current status and decides whether supervision ends.
    fn settle(&self, slots: &[SlotState]) -> Step {
        let live = slots.iter().any(|s| matches!(s.slot, Slot::Live(_)));
        let pending = slots.iter().any(|s| matches!(s.slot, Slot::Pending { .. }));

        if !live && !pending {
            let crashed = slots
                .iter()
                .enumerate()
                .find(|(_, s)| matches!(s.slot, Slot::Done(WorkerState::Crashed)));
            return if let Some((index, s)) = crashed {
                self.publish(ServiceState::Failed, slots);
                let status = s
                    .last_exit
                    .map_or_else(|| "unknown".to_string(), |e| e.to_string());
                tracing::error!(service = %self.service, worker = index, "no workers left, service failed");
                Step::Done(Err(BerthError::WorkerCrash {
                    worker: index,
                    status,
                    attempts: s.attempts,
                }))
            } else {
                self.publish(ServiceState::Stopped, slots);
                tracing::info!(service = %self.service, "all workers terminated cleanly");
                Step::Done(Ok(()))
            };
        }

        let running = slots.iter().any(|s| match &s.slot {
            Slot::Live(w) => w.state() == WorkerState::Running,
            _ => false,
        });
        let state = if running {
            ServiceState::Running
        } else if slots.iter().any(|s| s.last_exit.is_some()) {
            ServiceState::Restarting
        } else {
            ServiceState::Starting
        };
        self.publish(state, slots);
        Step::Continue
    }

    fn publish(&self, state: ServiceState, slots: &[SlotState]) {
        let previous = self.status.borrow().state;
        if previous != state {
            tracing::info!(service = %self.service, from = %previous, to = %state, "service state changed");
        }
        let _ = self.status.send_replace(ServiceStatus {
            state,
            workers: slots
                .iter()
                .enumerate()
                .map(|(i, s)| s.snapshot(i))
                .collect(),
            restarts: self.restarts,
        });
    }

    async fn fail(&self, slots: &mut [SlotState], err: BerthError) -> Step {
        self.stop_workers(slots).await;
        self.publish(ServiceState::Failed, slots);
        Step::Done(Err(err))
    }

    async fn shutdown(&self, slots: &mut [SlotState]) -> Result<()> {
        tracing::info!(service = %self.service, "supervisor shutting down");
        self.service_log("shutting down");
        self.stop_workers(slots).await;
        self.publish(ServiceState::Stopped, slots);
        Ok(())
    }

    /// SIGTERM to every live worker, SIGKILL to those still alive after the
    /// graceful timeout.
    async fn stop_workers(&self, slots: &mut [SlotState]) {
        for state in slots.iter_mut() {
            match &state.slot {
                Slot::Live(worker) => {
                    if let Err(e) = worker.signal(Signal::SIGTERM) {
                        tracing::warn!(worker = worker.slot(), error = %e, "failed to send SIGTERM");
                    }
                }
                Slot::Pending { .. } => state.slot = Slot::Done(WorkerState::Terminated),
                Slot::Done(_) => {}
            }
        }

        let deadline = tokio::time::Instant::now() + self.options.graceful_timeout;
        for (index, state) in slots.iter_mut().enumerate() {
            let Slot::Live(worker) = &mut state.slot else {
                continue;
            };
            let exit = match tokio::time::timeout_at(deadline, worker.wait()).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(service = %self.service, worker = index, "graceful timeout elapsed, sending SIGKILL");
                    if let Err(e) = worker.signal(Signal::SIGKILL) {
                        tracing::warn!(worker = index, error = %e, "failed to send SIGKILL");
                    }
                    worker.wait().await
                }
            };
            state.last_pid = Some(worker.pid());
            match exit {
                Ok(exit) => {
                    tracing::debug!(worker = index, exit = %exit, "worker stopped");
                    state.last_exit = Some(exit);
                }
                Err(e) => tracing::warn!(worker = index, error = %e, "failed to reap worker"),
            }
            state.slot = Slot::Done(WorkerState::Terminated);
        }
    }

    fn service_log(&self, line: &str) {
        if let Some(path) = &self.spec.log_file {
            if let Err(e) = crate::logs::append_line(path, line) {
                tracing::warn!(path = %path.display(), error = %e, "cannot write service log");
            }
        }
    }
}

fn poll_slot(state: &mut SlotState, now: Instant, options: &SupervisorOptions) -> Result<Event> {
    match &mut state.slot {
        Slot::Live(worker) => {
            let was_starting = worker.state() == WorkerState::Starting;
            match worker.try_exit()? {
                Some(exit) => Ok(Event::Exited {
                    exit,
                    pid: worker.pid(),
                    was_starting,
                }),
                None => {
                    if worker.promote_if_ready(options.ready_after) {
                        tracing::info!(worker = worker.slot(), pid = worker.pid(), "worker running");
                    }
                    if state.attempts > 0 && worker.uptime() >= options.stable_after {
                        tracing::debug!(worker = worker.slot(), "worker stable, crash counter reset");
                        state.attempts = 0;
                    }
                    Ok(Event::Idle)
                }
            }
        }
        Slot::Pending { due } if now >= *due => Ok(Event::Due),
        Slot::Pending { .. } | Slot::Done(_) => Ok(Event::Idle),
    }
}
