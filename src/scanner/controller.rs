use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::Result;
use serde::Serialize;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time,
};

use super::{
    guard::{PersistenceError, PersistenceGuard},
    motion::{split_committed, StepOutcome, StepPlan},
    position::{distance, movement_duration, resolve_target, Delta, Position},
    queue::{MovementQueue, QueueOutcome},
    state::{Direction, ScannerSnapshot, ScannerState},
    store::ScannerStore,
};
use crate::db::models::{CaptureEntry, OperationKind, OperationLogEntry, ScannerRecord};
use crate::settings::ScannerSettings;
use crate::utils::logging::notice_timestamp;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

/// Capacity of each client's outbound queue.
pub const CLIENT_BUFFER: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct LogNotice {
    pub timestamp: String,
    pub message: String,
}

/// What a connected client is sent.
#[derive(Debug, Clone)]
pub enum ScannerEvent {
    State(Arc<ScannerSnapshot>),
    Log(LogNotice),
}

pub type ClientSender = mpsc::Sender<ScannerEvent>;

/// Leading part of a client id, enough to tell connections apart in notices.
fn short_id(client_id: &str) -> &str {
    client_id.get(..8).unwrap_or(client_id)
}

enum StepResult {
    Moved,
    Abandoned,
}

/// Owns one user's scanner: its state, the background run that drives it,
/// and the clients watching it.
///
/// Lock order is always `runner` before `state`.
#[derive(Clone)]
pub struct ScannerController {
    user_id: Arc<str>,
    settings: Arc<ScannerSettings>,
    queue: MovementQueue,
    state: Arc<Mutex<ScannerState>>,
    runner: Arc<Mutex<Option<JoinHandle<()>>>>,
    clients: Arc<Mutex<HashMap<String, ClientSender>>>,
    last_session: Arc<Mutex<Option<String>>>,
    /// Set when the durable row could not be read, so the in-memory revision
    /// may trail it. Cleared by the first save that lands.
    revision_unknown: Arc<AtomicBool>,
    store: Arc<dyn ScannerStore>,
    guard: Arc<PersistenceGuard>,
}

impl ScannerController {
    pub fn new(
        user_id: impl Into<String>,
        settings: ScannerSettings,
        store: Arc<dyn ScannerStore>,
        guard: Arc<PersistenceGuard>,
    ) -> Self {
        let user_id: String = user_id.into();
        let state = ScannerState::new(user_id.clone(), settings.default_position());
        Self {
            user_id: Arc::from(user_id),
            queue: MovementQueue::new(settings.grid_size, settings.max_pending_movements),
            settings: Arc::new(settings),
            state: Arc::new(Mutex::new(state)),
            runner: Arc::new(Mutex::new(None)),
            clients: Arc::new(Mutex::new(HashMap::new())),
            last_session: Arc::new(Mutex::new(None)),
            revision_unknown: Arc::new(AtomicBool::new(false)),
            store,
            guard,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Adopts the durable state for this user, correcting anything invalid for
    /// the current grid. Falls back to defaults when the store is unavailable.
    /// Loaded pending motion is kept but not executed until the next command.
    pub async fn initialize(&self) {
        let store = Arc::clone(&self.store);
        let user_id = self.user_id.to_string();
        let loaded = self
            .guard
            .run("load_state", || {
                let store = Arc::clone(&store);
                let user_id = user_id.clone();
                async move { store.load_state(&user_id).await }
            })
            .await;

        let record = match loaded {
            Ok(record) => record,
            Err(err) => {
                log_error!("Failed to load scanner {}; using defaults: {err}", self.user_id);
                self.revision_unknown.store(true, Ordering::SeqCst);
                return;
            }
        };

        let Some(record) = record else {
            log_info!("Scanner {} has no saved state; starting at defaults", self.user_id);
            if let Err(err) = self.save_state().await {
                log_warn!("Failed to save initial state for {}: {err}", self.user_id);
            }
            return;
        };

        let captures = match self
            .guard
            .run("load_distinct_captures", || {
                let store = Arc::clone(&store);
                let user_id = user_id.clone();
                async move { store.load_distinct_captures(&user_id).await }
            })
            .await
        {
            Ok(captures) => captures,
            Err(err) => {
                log_warn!("Failed to load captures for {}: {err}", self.user_id);
                Default::default()
            }
        };

        let corrections = {
            let mut state = self.state.lock().await;
            state.restore(
                &record,
                captures,
                self.settings.grid_size,
                self.settings.default_position(),
                self.settings.max_pending_movements,
            )
        };

        for correction in &corrections {
            log_warn!("Scanner {} loaded with {correction}", self.user_id);
        }
        if !corrections.is_empty() {
            if let Err(err) = self.save_state().await {
                log_warn!("Failed to save corrected state for {}: {err}", self.user_id);
            }
        }
        log_info!("Scanner {} restored at {}", self.user_id, record.position);
    }

    /// Queues one unit step. Rejections leave state untouched and are
    /// reported to clients as a log notice.
    pub async fn queue_movement(
        &self,
        direction: Direction,
        session_id: Option<&str>,
    ) -> Result<QueueOutcome> {
        let (outcome, position) = {
            let mut state = self.state.lock().await;
            let outcome = self.queue.apply(&mut state, direction);
            (outcome, state.position())
        };

        let pending = match outcome {
            QueueOutcome::Rejected(rejection) => {
                log_info!("Scanner {} rejected {direction}: {rejection}", self.user_id);
                self.broadcast_log(rejection.to_string()).await;
                return Ok(outcome);
            }
            QueueOutcome::Accepted { pending } => pending,
        };

        if let Some(session_id) = session_id {
            *self.last_session.lock().await = Some(session_id.to_string());
        }
        log_debug!(
            "Scanner {} queued {direction}; pending ({}, {})",
            self.user_id,
            pending.horizontal,
            pending.vertical
        );

        self.log_operation(
            OperationKind::QueueMove,
            position,
            None,
            Some(format!(
                "direction={direction} pending=({}, {})",
                pending.horizontal, pending.vertical
            )),
        )
        .await;
        self.broadcast_log(format!(
            "Movement queued: {direction} (H:{}, V:{})",
            pending.horizontal, pending.vertical
        ))
        .await;
        self.broadcast_state(false).await;
        self.ensure_processing().await;
        self.save_state().await?;
        Ok(outcome)
    }

    /// Cancels any active run, restores defaults and clears the user's history.
    pub async fn reset_scanner(&self) -> Result<()> {
        {
            let mut runner = self.runner.lock().await;
            if let Some(handle) = runner.take() {
                handle.abort();
                if let Err(err) = handle.await {
                    if !err.is_cancelled() {
                        log_error!("Scanner {} run failed before reset: {err}", self.user_id);
                    }
                }
            }
            let mut state = self.state.lock().await;
            state.reset(self.settings.default_position());
        }
        log_info!("Scanner {} reset", self.user_id);
        self.broadcast_state(true).await;

        let store = Arc::clone(&self.store);
        let user_id = self.user_id.to_string();
        self.guard
            .run("clear_history", || {
                let store = Arc::clone(&store);
                let user_id = user_id.clone();
                async move { store.clear_history(&user_id).await }
            })
            .await?;
        self.save_state().await?;

        self.broadcast_log(format!(
            "Scanner reset to {}",
            self.settings.default_position()
        ))
        .await;
        Ok(())
    }

    pub async fn get_state_snapshot(&self) -> Arc<ScannerSnapshot> {
        self.state.lock().await.snapshot()
    }

    /// Registers a client and immediately sends it the current snapshot.
    pub async fn connect_client(&self, client_id: &str, sender: ClientSender) -> usize {
        let snapshot = self.get_state_snapshot().await;
        if sender.try_send(ScannerEvent::State(snapshot)).is_err() {
            log_warn!("Client {client_id} closed before the first snapshot");
        }

        let connected = {
            let mut clients = self.clients.lock().await;
            clients.insert(client_id.to_string(), sender);
            clients.len()
        };
        log_info!(
            "Client {client_id} connected to scanner {} ({connected} connected)",
            self.user_id
        );
        self.broadcast_log(format!("Client {} connected", short_id(client_id)))
            .await;
        connected
    }

    pub async fn disconnect_client(&self, client_id: &str) -> bool {
        let remaining = {
            let mut clients = self.clients.lock().await;
            clients.remove(client_id).map(|_| clients.len())
        };
        let Some(remaining) = remaining else {
            return false;
        };
        log_info!(
            "Client {client_id} disconnected from scanner {} ({remaining} connected)",
            self.user_id
        );
        self.broadcast_log(format!("Client {} disconnected", short_id(client_id)))
            .await;
        true
    }

    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// Pushes the snapshot to every client. Suppressed while a run is active
    /// unless `force` is set.
    pub async fn broadcast_state(&self, force: bool) {
        let snapshot = {
            let mut state = self.state.lock().await;
            if state.is_processing() && !force {
                return;
            }
            state.snapshot()
        };
        self.push(ScannerEvent::State(snapshot)).await;
    }

    pub async fn broadcast_log(&self, message: impl Into<String>) {
        self.push(ScannerEvent::Log(LogNotice {
            timestamp: notice_timestamp(),
            message: message.into(),
        }))
        .await;
    }

    /// A client whose queue is closed or full is dropped; delivery to the
    /// others continues.
    async fn push(&self, event: ScannerEvent) {
        let mut clients = self.clients.lock().await;
        clients.retain(|client_id, sender| match sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(err) => {
                log_warn!(
                    "Dropping client {client_id} of scanner {}: {err}",
                    self.user_id
                );
                false
            }
        });
    }

    /// Starts a run unless one is already active. The `processing` flag is
    /// the single source of truth and only changes under the runner lock.
    async fn ensure_processing(&self) {
        let mut runner = self.runner.lock().await;
        {
            let mut state = self.state.lock().await;
            if state.is_processing() || !state.has_pending() {
                return;
            }
            state.set_processing(true);
        }

        let controller = self.clone();
        *runner = Some(tokio::spawn(async move {
            controller.process_runs().await;
        }));
        log_debug!("Scanner {} processing started", self.user_id);
    }

    async fn process_runs(self) {
        loop {
            self.run_cycle().await;

            let _runner = self.runner.lock().await;
            let mut state = self.state.lock().await;
            if state.has_pending() {
                continue;
            }
            state.set_processing(false);
            break;
        }

        log_debug!("Scanner {} processing finished", self.user_id);
        self.broadcast_state(true).await;
    }

    /// Drains pending motion, then focuses and captures once it has settled.
    async fn run_cycle(&self) {
        let started = Instant::now();
        let processing_timeout = self.settings.processing_timeout();
        let mut iterations: u32 = 0;
        let mut moved = false;

        loop {
            if !self.state.lock().await.has_pending() {
                break;
            }

            if iterations >= self.settings.max_iterations {
                self.abandon_run(format!(
                    "Movement stopped after {iterations} steps; pending movements cleared"
                ))
                .await;
                return;
            }
            if started.elapsed() >= processing_timeout {
                self.abandon_run(format!(
                    "Movement exceeded {:.0}s; pending movements cleared",
                    processing_timeout.as_secs_f64()
                ))
                .await;
                return;
            }
            iterations += 1;

            match self.execute_step().await {
                Ok(StepResult::Moved) => moved = true,
                Ok(StepResult::Abandoned) => return,
                Err(err) => {
                    log_error!("Scanner {} movement step failed: {err:#}", self.user_id);
                    self.abandon_run(String::from("Movement failed; pending movements cleared"))
                        .await;
                    return;
                }
            }
        }

        if moved {
            self.focus_and_capture().await;
        }
    }

    /// Clears pending motion and returns to READY without focusing.
    async fn abandon_run(&self, notice: String) {
        {
            let mut state = self.state.lock().await;
            state.clear_pending();
            state.force_ready();
        }
        log_warn!("Scanner {}: {notice}", self.user_id);
        if let Err(err) = self.save_state().await {
            log_error!("Failed to save abandoned state for {}: {err}", self.user_id);
        }
        self.broadcast_state(true).await;
        self.broadcast_log(notice).await;
    }

    async fn execute_step(&self) -> Result<StepResult> {
        let max_duration = self.settings.max_move_duration_secs;
        let plan = {
            let mut state = self.state.lock().await;
            let from = state.position();
            let target = resolve_target(from, state.pending(), self.settings.grid_size);
            let seconds = movement_duration(
                distance(from, target),
                self.settings.movement_speed_multiplier,
            );

            if !(seconds > 0.0) || seconds > max_duration {
                drop(state);
                self.abandon_run(format!(
                    "Movement to {target} rejected: duration {seconds:.2}s outside (0, {max_duration}]"
                ))
                .await;
                return Ok(StepResult::Abandoned);
            }

            let committed = Delta::between(from, target);
            state.begin_step(committed, seconds);
            StepPlan {
                from,
                target,
                committed,
                duration: Duration::from_secs_f64(seconds),
            }
        };

        log_info!(
            "Scanner {} moving {} -> {} over {:.2}s",
            self.user_id,
            plan.from,
            plan.target,
            plan.duration.as_secs_f64()
        );
        self.log_operation(
            OperationKind::MoveStart,
            plan.from,
            Some(plan.duration.as_secs_f64()),
            Some(format!("target={}", plan.target)),
        )
        .await;
        self.save_state().await?;
        self.broadcast_state(true).await;
        self.broadcast_log(format!(
            "Starting movement to {}. Distance: {:.2}, Duration: {:.2}s",
            plan.target,
            distance(plan.from, plan.target),
            plan.duration.as_secs_f64()
        ))
        .await;

        let outcome = self.run_step(&plan).await;
        let (position, details) = match outcome {
            StepOutcome::Completed { position } => (position, String::from("completed")),
            StepOutcome::Interrupted { position, returned } => {
                self.broadcast_log("New movement detected during operation, recalculating...")
                    .await;
                log_info!(
                    "Scanner {} interrupted at {position}; ({}, {}) returned to queue",
                    self.user_id,
                    returned.horizontal,
                    returned.vertical
                );
                (
                    position,
                    format!(
                        "interrupted returned=({}, {})",
                        returned.horizontal, returned.vertical
                    ),
                )
            }
        };

        self.log_operation(
            OperationKind::MoveComplete,
            position,
            Some(plan.duration.as_secs_f64()),
            Some(details),
        )
        .await;
        self.save_state().await?;
        self.broadcast_state(true).await;
        self.broadcast_log(format!("Movement completed to {position}")).await;
        Ok(StepResult::Moved)
    }

    /// Waits out the step, polling for newly queued commands.
    async fn run_step(&self, plan: &StepPlan) -> StepOutcome {
        let poll = self.settings.poll_interval();
        let started = Instant::now();

        loop {
            let remaining = plan.duration.saturating_sub(started.elapsed());
            time::sleep(poll.min(remaining)).await;
            let elapsed = started.elapsed();

            let mut state = self.state.lock().await;
            if elapsed >= plan.duration {
                state.complete_step(plan.target);
                return StepOutcome::Completed {
                    position: plan.target,
                };
            }

            if state.has_pending() {
                let cells = plan.cells_justified(elapsed);
                let (advanced, returned) = split_committed(plan.committed, cells);
                state.interrupt_step(advanced, returned, self.settings.grid_size);
                return StepOutcome::Interrupted {
                    position: state.position(),
                    returned,
                };
            }
        }
    }

    /// Any failure here forces READY.
    async fn focus_and_capture(&self) {
        if let Err(err) = self.try_focus_and_capture().await {
            log_error!("Scanner {} focus failed: {err:#}", self.user_id);
            self.state.lock().await.force_ready();
            if let Err(err) = self.save_state().await {
                log_error!("Failed to save state for {} after focus failure: {err}", self.user_id);
            }
            self.broadcast_state(true).await;
        }
    }

    async fn try_focus_and_capture(&self) -> Result<()> {
        let focus = self.settings.focus_duration();
        let position = {
            let mut state = self.state.lock().await;
            if state.has_pending() {
                return Ok(());
            }
            state.begin_focus();
            state.position()
        };

        log_info!("Scanner {} focusing at {position}", self.user_id);
        self.broadcast_log(format!("Starting focus and capture at {position}"))
            .await;
        self.log_operation(
            OperationKind::FocusStart,
            position,
            Some(focus.as_secs_f64()),
            None,
        )
        .await;
        self.save_state().await?;
        self.broadcast_state(true).await;

        time::sleep(focus).await;

        let (position, first_capture) = self.state.lock().await.record_capture();
        let details = if first_capture { "new" } else { "repeat" };
        self.log_operation(
            OperationKind::Capture,
            position,
            None,
            Some(details.to_string()),
        )
        .await;

        let entry = CaptureEntry::new(self.user_id.to_string(), self.session_id().await, position);
        let store = Arc::clone(&self.store);
        self.guard
            .run("append_capture", || {
                let store = Arc::clone(&store);
                let entry = entry.clone();
                async move { store.append_capture(&entry).await }
            })
            .await?;

        self.save_state().await?;
        self.broadcast_state(true).await;
        self.broadcast_log(format!("Captured image at {position}")).await;

        time::sleep(self.settings.settle_delay()).await;

        self.state.lock().await.force_ready();
        self.save_state().await?;
        self.broadcast_state(true).await;
        Ok(())
    }

    async fn session_id(&self) -> Option<String> {
        self.last_session.lock().await.clone()
    }

    async fn save_state(&self) -> Result<(), PersistenceError> {
        let record = self.state.lock().await.to_record();
        if self.write_record(&record).await? {
            self.revision_unknown.store(false, Ordering::SeqCst);
            return Ok(());
        }

        if self.revision_unknown.load(Ordering::SeqCst) {
            return self.rebase_and_save().await;
        }

        log_debug!(
            "Skipped stale save of scanner {} at revision {}",
            self.user_id,
            record.revision
        );
        Ok(())
    }

    /// The stored row outranks a state that was started from defaults after a
    /// failed load. Memory wins: move its revision past the stored one and
    /// write again.
    async fn rebase_and_save(&self) -> Result<(), PersistenceError> {
        let store = Arc::clone(&self.store);
        let user_id = self.user_id.to_string();
        let stored = self
            .guard
            .run("load_state", || {
                let store = Arc::clone(&store);
                let user_id = user_id.clone();
                async move { store.load_state(&user_id).await }
            })
            .await?;
        let floor = stored.map(|record| record.revision).unwrap_or(0);

        let record = {
            let mut state = self.state.lock().await;
            state.advance_revision_past(floor);
            state.to_record()
        };
        if self.write_record(&record).await? {
            self.revision_unknown.store(false, Ordering::SeqCst);
            log_info!(
                "Scanner {} took over stored revision {floor} at {}",
                self.user_id,
                record.revision
            );
        }
        Ok(())
    }

    async fn write_record(&self, record: &ScannerRecord) -> Result<bool, PersistenceError> {
        let store = Arc::clone(&self.store);
        self.guard
            .run("save_state", || {
                let store = Arc::clone(&store);
                let record = record.clone();
                async move { store.save_state(&record).await }
            })
            .await
    }

    /// Audit entries are best-effort; a failed append never stops motion.
    async fn log_operation(
        &self,
        kind: OperationKind,
        position: Position,
        duration: Option<f64>,
        details: Option<String>,
    ) {
        let mut entry =
            OperationLogEntry::new(self.user_id.to_string(), self.session_id().await, kind, position);
        entry.duration = duration;
        entry.details = details;

        let store = Arc::clone(&self.store);
        let result = self
            .guard
            .run("append_operation", || {
                let store = Arc::clone(&store);
                let entry = entry.clone();
                async move { store.append_operation(&entry).await }
            })
            .await;

        if let Err(err) = result {
            log_warn!("Failed to log {kind} for {}: {err}", self.user_id);
        }
    }
}
