//! Session registry: the process-wide map from session id to VM, and the
//! per-session run worker that drives `arm2_core::session::Session::step`
//! one instruction at a time so pause/status requests are never blocked
//! behind a whole `run` (§5: "holds the mutex only across individual
//! instruction boundaries, releasing briefly between instructions").

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arm2_core::debugger::StopReason;
use arm2_core::error::ExecError;
use arm2_core::executor::ExecOutcome;
use arm2_core::memory::WriteRecord;
use arm2_core::session::{Session, SessionConfig, Stream, VmState};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::DaemonConfig;

/// Wire form of [`WriteRecord`] -- a daemon-local DTO so `arm2-core` stays
/// free of `utoipa`/web-schema concerns.
#[derive(Debug, Clone, Copy, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LastWrite {
    pub address: u32,
    pub size: u8,
    pub value: u32,
}

impl From<WriteRecord> for LastWrite {
    fn from(r: WriteRecord) -> Self {
        Self { address: r.address, size: r.size, value: r.value }
    }
}

/// Wire form of [`arm2_core::cpu::Cpsr`] -- `arm2-core` stays free of the
/// `utoipa` dependency, so the daemon mirrors the four flags here.
#[derive(Debug, Clone, Copy, Serialize, ToSchema)]
pub struct CpsrDto {
    pub n: bool,
    pub z: bool,
    pub c: bool,
    pub v: bool,
}

impl From<arm2_core::cpu::Cpsr> for CpsrDto {
    fn from(c: arm2_core::cpu::Cpsr) -> Self {
        Self { n: c.n, z: c.z, c: c.c, v: c.v }
    }
}

/// `StateEvent` of §3/§4.8: VM state plus register snapshot plus last
/// write, pushed at every observable transition.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StateEvent {
    pub state: String,
    pub pc: u32,
    pub registers: [u32; 16],
    pub cpsr: CpsrDto,
    pub cycles: u64,
    pub last_write: Option<LastWrite>,
}

/// `ExecutionEvent` of §4.8: breakpoint/watchpoint/halt/error notices.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionNotice {
    pub kind: String,
    pub address: Option<u32>,
    pub message: Option<String>,
}

/// One event multiplexed to a session's WebSocket subscribers.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    State(StateEvent),
    Output { stream: String, content: String },
    Event(ExecutionNotice),
}

pub fn state_label(state: VmState) -> &'static str {
    match state {
        VmState::Idle => "idle",
        VmState::Running => "running",
        VmState::Breakpoint => "breakpoint",
        VmState::Halted => "halted",
        VmState::Error => "error",
        VmState::WaitingForInput => "waiting-for-input",
    }
}

fn stream_label(stream: Stream) -> &'static str {
    match stream {
        Stream::Stdout => "stdout",
        Stream::Stderr => "stderr",
    }
}

fn build_state_event(session: &Session) -> StateEvent {
    let snap = session.registers();
    StateEvent {
        state: state_label(session.state()).to_string(),
        pc: snap.registers[15],
        registers: snap.registers,
        cpsr: CpsrDto::from(snap.cpsr),
        cycles: snap.cycles,
        last_write: session.last_write().map(LastWrite::from),
    }
}

/// One session's VM plus the daemon-side concurrency primitives wrapped
/// around it: a mutex acquired per instruction (never held across a
/// whole `run`), a broadcast channel for WebSocket fan-out, a pause flag
/// the run worker checks between instructions, and a `Notify` the
/// `/stdin` handler signals after feeding input so a parked `run` worker
/// wakes promptly instead of busy-polling.
pub struct SessionHandle {
    pub id: Uuid,
    pub vm: Mutex<Session>,
    events: broadcast::Sender<SessionEvent>,
    pause: Arc<AtomicBool>,
    stdin_ready: Arc<Notify>,
    last_activity: Mutex<Instant>,
    running: AtomicBool,
}

impl SessionHandle {
    fn new(id: Uuid, config: &DaemonConfig) -> Self {
        let session_config = SessionConfig {
            memory: arm2_core::memory::MemoryConfig {
                size: config.default_memory_size,
                ..arm2_core::memory::MemoryConfig::default()
            },
            console_cap: 64 * 1024,
            sandbox_root: config.sandbox_root.as_ref().map(std::path::PathBuf::from),
            trace: arm2_core::trace::TraceConfig::default(),
            instruction_budget: Some(config.default_instruction_budget),
        };
        let (tx, _rx) = broadcast::channel(config.event_queue_capacity);
        Self {
            id,
            vm: Mutex::new(Session::new(id.to_string(), session_config)),
            events: tx,
            pause: Arc::new(AtomicBool::new(false)),
            stdin_ready: Arc::new(Notify::new()),
            last_activity: Mutex::new(Instant::now()),
            running: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Broadcasts `event`, forcing a follow-up `StateEvent` next
    /// transition if the bounded queue just dropped one for a slow
    /// subscriber (§4.8: "never silently lose terminal state").
    fn broadcast(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub async fn touch(&self) {
        *self.last_activity.lock().await = Instant::now();
    }

    pub async fn idle_for(&self) -> Duration {
        self.last_activity.lock().await.elapsed()
    }

    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Feeds stdin into the VM and wakes a parked run worker. A no-op
    /// wake if nothing is waiting (`Notify::notify_one` is safe to call
    /// with no listener).
    pub async fn feed_stdin(&self, bytes: &[u8]) {
        {
            let mut vm = self.vm.lock().await;
            vm.feed_stdin(bytes);
        }
        self.stdin_ready.notify_one();
    }

    /// Drives `Session::step` in a loop until the VM stops being
    /// runnable, locking the session only for the duration of each
    /// instruction. Emits `OutputEvent`s for fresh console bytes and a
    /// `StateEvent`/`ExecutionEvent` pair at the terminal transition.
    /// `fire_and_forget`: the HTTP `run` handler returns as soon as this
    /// task is spawned (§5 "HTTP run returns immediately").
    pub async fn run_worker(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pause.store(false, Ordering::SeqCst);
        let budget = {
            let vm = self.vm.lock().await;
            vm.instruction_budget()
        };
        let mut executed = 0u64;
        loop {
            if self.pause.load(Ordering::SeqCst) {
                self.pause.store(false, Ordering::SeqCst);
                let vm = self.vm.lock().await;
                self.broadcast(SessionEvent::State(build_state_event(&vm)));
                break;
            }
            if let Some(limit) = budget {
                if executed >= limit {
                    let mut vm = self.vm.lock().await;
                    vm.fail_with(ExecError::CycleLimitExceeded { limit });
                    self.broadcast(SessionEvent::Event(ExecutionNotice {
                        kind: "error".to_string(),
                        address: Some(vm.registers().registers[15]),
                        message: vm.error().map(str::to_string),
                    }));
                    self.broadcast(SessionEvent::State(build_state_event(&vm)));
                    break;
                }
            }

            let (outcome, drained, state_event) = {
                let mut vm = self.vm.lock().await;
                let outcome = vm.step();
                let drained = vm.console_mut().drain_new();
                let state_event = build_state_event(&vm);
                (outcome, drained, state_event)
            };

            for (stream, bytes) in drained {
                self.broadcast(SessionEvent::Output {
                    stream: stream_label(stream).to_string(),
                    content: String::from_utf8_lossy(&bytes).into_owned(),
                });
            }

            match outcome {
                ExecOutcome::Continued => {
                    executed += 1;
                    tokio::task::yield_now().await;
                    continue;
                }
                ExecOutcome::Paused | ExecOutcome::BudgetExhausted => {
                    self.broadcast(SessionEvent::State(state_event));
                    break;
                }
                ExecOutcome::Stopped(reason) => {
                    let (kind, address) = match reason {
                        StopReason::Breakpoint(id) => ("breakpoint_hit", Some(id)),
                        StopReason::Watchpoint(id) => ("watchpoint_hit", Some(id)),
                    };
                    self.broadcast(SessionEvent::Event(ExecutionNotice {
                        kind: kind.to_string(),
                        address,
                        message: None,
                    }));
                    self.broadcast(SessionEvent::State(state_event));
                    break;
                }
                ExecOutcome::Halted => {
                    self.broadcast(SessionEvent::Event(ExecutionNotice {
                        kind: "halted".to_string(),
                        address: Some(state_event.pc),
                        message: None,
                    }));
                    self.broadcast(SessionEvent::State(state_event));
                    break;
                }
                ExecOutcome::Faulted(e) => {
                    self.broadcast(SessionEvent::Event(ExecutionNotice {
                        kind: "error".to_string(),
                        address: Some(state_event.pc),
                        message: Some(e.to_string()),
                    }));
                    self.broadcast(SessionEvent::State(state_event));
                    break;
                }
                ExecOutcome::WaitingForInput => {
                    self.broadcast(SessionEvent::State(state_event));
                    // Park until stdin arrives, a pause is requested, or
                    // we're kicked periodically to notice cancellation.
                    tokio::select! {
                        _ = self.stdin_ready.notified() => {}
                        _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                    }
                    if self.pause.load(Ordering::SeqCst) {
                        self.pause.store(false, Ordering::SeqCst);
                        break;
                    }
                    continue;
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Process-wide `session id -> SessionHandle` map, guarded by a
/// read-write lock (§5: "the process-wide session registry is guarded
/// by a read-write lock").
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<SessionHandle>>>,
    config: DaemonConfig,
}

impl SessionRegistry {
    pub fn new(config: DaemonConfig) -> Self {
        Self { sessions: RwLock::new(HashMap::new()), config }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub async fn create(&self) -> Arc<SessionHandle> {
        let id = Uuid::new_v4();
        let handle = Arc::new(SessionHandle::new(id, &self.config));
        self.sessions.write().await.insert(id, Arc::clone(&handle));
        handle
    }

    pub async fn get(&self, id: Uuid) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(&id).cloned()
    }

    pub async fn remove(&self, id: Uuid) -> Option<Arc<SessionHandle>> {
        self.sessions.write().await.remove(&id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Periodically destroys sessions idle longer than the configured
    /// inactivity timeout. Spawned once from `main`; a no-op loop if the
    /// timeout is zero (disabled).
    pub async fn reap_idle_forever(self: Arc<Self>) {
        if self.config.session_inactivity_timeout_seconds == 0 {
            return;
        }
        let timeout = Duration::from_secs(self.config.session_inactivity_timeout_seconds);
        let mut interval = tokio::time::interval(Duration::from_secs(30).min(timeout));
        loop {
            interval.tick().await;
            let stale: Vec<Uuid> = {
                let sessions = self.sessions.read().await;
                let mut out = Vec::new();
                for (id, handle) in sessions.iter() {
                    if !handle.is_running() && handle.idle_for().await >= timeout {
                        out.push(*id);
                    }
                }
                out
            };
            if !stale.is_empty() {
                let mut sessions = self.sessions.write().await;
                for id in stale {
                    sessions.remove(&id);
                    tracing::info!(session_id = %id, "reaped idle session");
                }
            }
        }
    }
}

/// Helper used by handlers to build the `StateEvent` DTO directly off a
/// locked session, without constructing a daemon-side re-borrow.
pub fn state_event_for(session: &Session) -> StateEvent {
    build_state_event(session)
}
