use parking_lot::Mutex;
use rhi_common::{ResourceHandle, ResourceKind};
use rhi_render::{Backend, BackendError, Command, Opcode, PresentReport, execute};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use crate::error::CommandFailure;
use crate::ring::RingConsumer;
use crate::semaphore::Semaphore;
use crate::stats::{DispatchStats, DrainTimer};

const DRAIN_WINDOW: usize = 120;

/// State both threads see. Everything else belongs to exactly one side.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    /// Producer → consumer: "a drain is requested".
    pub consume: Semaphore,
    /// Consumer → producer: "snapshot taken, keep encoding".
    pub resume: Semaphore,
    /// Records encoded since the consumer's last snapshot.
    pub pending: AtomicUsize,
    pub exit: AtomicBool,
    pub alive: AtomicBool,
    pub failures: Mutex<Vec<CommandFailure>>,
    pub query_results: Mutex<HashMap<ResourceHandle, u64>>,
    pub stats: Mutex<DispatchStats>,
}

impl Shared {
    pub fn new() -> Self {
        Self {
            alive: AtomicBool::new(true),
            ..Default::default()
        }
    }
}

/// Marks the queue dead however the render thread leaves, and wakes a
/// producer that may be blocked in `flush`.
struct AliveGuard(Arc<Shared>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            tracing::error!("render thread panicked; queue is dead");
        }
        self.0.alive.store(false, Ordering::Release);
        self.0.resume.signal();
    }
}

/// The render-thread side: waits for flush requests and replays records on
/// the backend it owns.
pub(crate) struct Dispatcher<B: Backend> {
    backend: B,
    ring: RingConsumer<Command>,
    shared: Arc<Shared>,
    strict: bool,
    timer: DrainTimer,
    stats: DispatchStats,
    /// Handles whose create record failed. The producer still owns them, so
    /// their release must not reach the backend, which holds nothing there.
    failed_creates: HashSet<ResourceHandle>,
}

impl<B: Backend> Dispatcher<B> {
    pub fn new(backend: B, ring: RingConsumer<Command>, shared: Arc<Shared>, strict: bool) -> Self {
        Self {
            backend,
            ring,
            shared,
            strict,
            timer: DrainTimer::new(DRAIN_WINDOW),
            stats: DispatchStats::default(),
            failed_creates: HashSet::new(),
        }
    }

    pub fn run(mut self) {
        let _guard = AliveGuard(self.shared.clone());
        tracing::info!(backend = self.backend.name(), "render thread started");
        loop {
            self.shared.consume.wait();
            let exiting = self.shared.exit.load(Ordering::Acquire);
            let end = self.ring.snapshot();
            self.shared.pending.store(0, Ordering::Release);
            if !exiting {
                self.shared.resume.signal();
            }
            self.drain(end);
            if exiting {
                break;
            }
        }
        self.backend.shutdown();
        tracing::info!(
            frames = self.stats.frames_presented,
            commands = self.stats.commands_executed,
            "render thread stopped"
        );
    }

    fn drain(&mut self, end: usize) {
        let _span = tracing::debug_span!("drain", from = self.ring.position(), to = end).entered();
        let start = Instant::now();
        let mut executed = 0u64;
        while let Some(command) = self.ring.pop_until(end) {
            self.execute_one(&command);
            executed += 1;
            // `command` and its payload drop here, right after execution.
        }
        let elapsed = start.elapsed();
        self.timer.record(elapsed);
        self.stats.drains += 1;
        self.stats.commands_executed += executed;
        self.stats.last_drain = elapsed;
        self.stats.average_drain = self.timer.average();
        self.stats.max_drain = self.timer.max();
        *self.shared.stats.lock() = self.stats.clone();
        tracing::debug!(executed, ?elapsed, "drain complete");
    }

    fn execute_one(&mut self, command: &Command) {
        let opcode = command.opcode();
        let slot = command.resource_slot();
        tracing::trace!(?opcode, %slot, "execute");
        if let Command::Release { kind, handle } = command {
            if *kind == ResourceKind::Query {
                // Results of a released query must not leak to the next
                // query allocated into the same slot.
                self.shared.query_results.lock().remove(handle);
            }
            if self.failed_creates.remove(handle) {
                tracing::debug!(%handle, ?kind, "release of a failed creation skipped");
                return;
            }
        }
        match execute(&mut self.backend, command) {
            Ok(Some(report)) => self.on_present(report),
            Ok(None) => {}
            Err(error) => {
                if opcode.creates_resource() {
                    self.failed_creates.insert(slot);
                }
                self.on_error(opcode, slot, error);
            }
        }
    }

    fn on_present(&mut self, report: PresentReport) {
        self.stats.frames_presented += 1;
        if report.recovered {
            self.stats.recoveries += 1;
            tracing::info!(frame = report.frame, "backend recovered during present");
        }
        if !report.query_results.is_empty() {
            self.shared
                .query_results
                .lock()
                .extend(report.query_results.iter().copied());
        }
    }

    fn on_error(&mut self, opcode: Opcode, handle: ResourceHandle, error: BackendError) {
        if error.is_misuse() && self.strict {
            panic!("backend rejected {opcode:?} (slot {handle}): {error}");
        }
        match &error {
            BackendError::CreationFailed { .. } => {
                tracing::warn!(?opcode, %handle, %error, "resource creation failed")
            }
            _ => tracing::error!(?opcode, %handle, %error, "command failed"),
        }
        self.stats.failures += 1;
        self.shared.failures.lock().push(CommandFailure {
            opcode,
            handle,
            error,
        });
    }
}
