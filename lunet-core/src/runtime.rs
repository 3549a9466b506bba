use serde::Serialize;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tokio::sync::Notify;
use tokio::task::LocalSet;
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;
use crate::fiber::{FiberId, FiberRef};
use crate::ops;
use crate::registry::{AnchorId, HandleId, HandleSlot, Registry};
use crate::script::OpRequest;
use crate::signal::SignalTable;
use crate::value::Value;

// ─── Configuration ────────────────────────────────────────────

/// Process-wide runtime tunables.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Bytes handed to each stream `read`. Tunable at runtime through
    /// `set_read_buffer_size`.
    pub read_buffer_size: usize,
    /// Pre-accepted connections a listener buffers before the pump stops
    /// admitting more (back-pressure watermark).
    pub accept_backlog_watermark: usize,
    /// Datagram inbox cap with drop-oldest overflow. 0 = unbounded.
    pub dgram_inbox_cap: usize,
    /// Permit binding to non-loopback addresses. Maps onto the launcher's
    /// `--dangerously-skip-loopback-restriction` flag.
    pub allow_nonloopback: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            read_buffer_size: 64 * 1024,
            accept_backlog_watermark: 64,
            dgram_inbox_cap: 1024,
            allow_nonloopback: false,
        }
    }
}

// ─── Diagnostics ──────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct Diag {
    pub fibers_spawned: Cell<u64>,
    pub fiber_faults: Cell<u64>,
    pub dgram_dropped: Cell<u64>,
}

/// Point-in-time copy of the runtime counters, printed at shutdown and
/// asserted on by tests.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct DiagSnapshot {
    pub fibers_spawned: u64,
    pub fiber_faults: u64,
    pub anchors_created: u64,
    pub anchors_released: u64,
    pub anchors_live: usize,
    pub double_releases: u64,
    pub handles_live: usize,
    pub dgram_dropped: u64,
}

impl DiagSnapshot {
    pub fn anchors_balanced(&self) -> bool {
        self.anchors_created == self.anchors_released && self.anchors_live == 0
    }
}

// ─── Root state ───────────────────────────────────────────────

/// The process-wide script engine root. Long-lived handles store this —
/// never the spawning fiber — so callbacks that fire after the fiber has
/// returned still resolve through live state.
pub(crate) struct RootState {
    pub config: RefCell<RuntimeConfig>,
    pub registry: RefCell<Registry>,
    pub diag: Diag,
    pub signals: SignalTable,
    pub shutdown: CancellationToken,
    exit_code: Cell<i32>,
    live_fibers: Cell<u64>,
    idle: Notify,
    next_fiber_id: Cell<u64>,
}

/// Cloneable, `!Send` reference to the root state. This is what every
/// engine function and native op receives.
#[derive(Clone)]
pub struct RuntimeHandle {
    pub(crate) root: Rc<RootState>,
}

impl RuntimeHandle {
    /// Build a root state without an event loop of its own, for embedding
    /// into an existing current-thread runtime (tests do this). All calls
    /// must stay on the loop thread.
    pub fn new(config: RuntimeConfig) -> RuntimeHandle {
        RuntimeHandle {
            root: Rc::new(RootState {
                config: RefCell::new(config),
                registry: RefCell::new(Registry::new()),
                diag: Diag::default(),
                signals: SignalTable::new(),
                shutdown: CancellationToken::new(),
                exit_code: Cell::new(0),
                live_fibers: Cell::new(0),
                idle: Notify::new(),
                next_fiber_id: Cell::new(1),
            }),
        }
    }

    // ── Dispatch from outside a fiber ──

    /// Issue an operation from the root state (outside any fiber).
    /// Suspending primitives fail with `NOT_IN_FIBER`; synchronous ones
    /// (spawn, listen, bind, close, fs, config) run normally.
    pub fn try_dispatch(&self, req: OpRequest) -> Result<Vec<Value>, CoreError> {
        if req.is_suspending() {
            return Err(CoreError::NotInFiber);
        }
        ops::dispatch_sync(self, req)
    }

    // ── Exit code ──

    pub fn set_exit_code(&self, code: i32) {
        self.root.exit_code.set(code);
    }

    pub fn exit_code(&self) -> i32 {
        self.root.exit_code.get()
    }

    // ── Config ──

    pub fn read_buffer_size(&self) -> usize {
        self.root.config.borrow().read_buffer_size
    }

    pub(crate) fn set_read_buffer_size(&self, bytes: usize) {
        self.root.config.borrow_mut().read_buffer_size = bytes;
    }

    // ── Anchors ──

    /// Anchor a fiber for the duration of one suspension. The guard
    /// releases exactly once on drop.
    pub(crate) fn anchor(&self, fiber: FiberRef) -> AnchorGuard {
        let id = self.root.registry.borrow_mut().anchor(fiber);
        AnchorGuard {
            root: self.root.clone(),
            id,
        }
    }

    // ── Fiber accounting ──

    pub(crate) fn next_fiber_id(&self) -> FiberId {
        let id = self.root.next_fiber_id.get();
        self.root.next_fiber_id.set(id + 1);
        FiberId(id)
    }

    pub(crate) fn fiber_started(&self) {
        self.root
            .diag
            .fibers_spawned
            .set(self.root.diag.fibers_spawned.get() + 1);
        self.root.live_fibers.set(self.root.live_fibers.get() + 1);
    }

    pub(crate) fn fiber_finished(&self) {
        let left = self.root.live_fibers.get() - 1;
        self.root.live_fibers.set(left);
        if left == 0 {
            self.root.idle.notify_waiters();
        }
    }

    pub(crate) fn fiber_faulted(&self) {
        self.root
            .diag
            .fiber_faults
            .set(self.root.diag.fiber_faults.get() + 1);
    }

    pub(crate) fn dgram_dropped(&self) {
        self.root
            .diag
            .dgram_dropped
            .set(self.root.diag.dgram_dropped.get() + 1);
    }

    // ── Native handles (offload crates) ──

    /// Register an offload-crate resource (e.g. a DB connection) and get
    /// its script-visible id.
    pub fn insert_native_handle(&self, h: Rc<dyn Any>) -> HandleId {
        self.root
            .registry
            .borrow_mut()
            .insert(HandleSlot::Native(h))
    }

    pub fn get_native_handle<T: 'static>(&self, id: HandleId) -> Result<Rc<T>, CoreError> {
        let any = self.root.registry.borrow().get_native(id)?;
        any.downcast::<T>().map_err(|_| CoreError::InvalidHandle)
    }

    pub fn remove_native_handle(&self, id: HandleId) -> Result<(), CoreError> {
        self.root
            .registry
            .borrow_mut()
            .remove(id)
            .map(|_| ())
            .ok_or(CoreError::InvalidHandle)
    }

    // ── Queue observation ──

    /// Pre-accepted connections currently queued on a listener.
    pub fn listener_backlog(&self, id: HandleId) -> Result<usize, CoreError> {
        Ok(self.root.registry.borrow().get_listener(id)?.backlog_len())
    }

    /// Datagrams currently queued on a bound socket's inbox.
    pub fn dgram_inbox(&self, id: HandleId) -> Result<usize, CoreError> {
        Ok(self.root.registry.borrow().get_dgram(id)?.inbox_len())
    }

    // ── Shutdown & diagnostics ──

    /// Cancel signal waits and other root-scoped waiters.
    pub fn request_stop(&self) {
        self.root.shutdown.cancel();
    }

    pub fn diagnostics(&self) -> DiagSnapshot {
        let reg = self.root.registry.borrow();
        DiagSnapshot {
            fibers_spawned: self.root.diag.fibers_spawned.get(),
            fiber_faults: self.root.diag.fiber_faults.get(),
            anchors_created: reg.anchors_created,
            anchors_released: reg.anchors_released,
            anchors_live: reg.anchors_live(),
            double_releases: reg.double_releases,
            handles_live: reg.handles_live(),
            dgram_dropped: self.root.diag.dgram_dropped.get(),
        }
    }

    /// Wait for every fiber to terminate.
    pub async fn wait_idle(&self) {
        loop {
            if self.root.live_fibers.get() == 0 {
                return;
            }
            self.root.idle.notified().await;
        }
    }

    /// Two-phase-close every live handle and wait until the loop has
    /// confirmed teardown (pumps joined, slots vacated). Offload-crate
    /// handles are dropped directly; their own Drop tears the native
    /// resource down.
    pub async fn close_all_handles(&self) {
        let ids = self.root.registry.borrow().handle_ids();
        for id in ids {
            let is_native = {
                let reg = self.root.registry.borrow();
                matches!(reg.get_any(id), Ok(HandleSlot::Native(_)))
            };
            if is_native {
                self.root.registry.borrow_mut().remove(id);
            } else if let Err(e) = ops::close(self, id) {
                tracing::debug!("shutdown close {}: {}", id, e);
            }
        }
        while self.root.registry.borrow().handles_live() > 0 {
            tokio::task::yield_now().await;
        }
    }
}

// ─── Anchor guard ─────────────────────────────────────────────

/// Registry anchor held for the duration of one suspension; releases
/// exactly once when dropped.
pub(crate) struct AnchorGuard {
    root: Rc<RootState>,
    id: AnchorId,
}

impl Drop for AnchorGuard {
    fn drop(&mut self) {
        self.root.registry.borrow_mut().release(self.id);
    }
}

// ─── Runtime ──────────────────────────────────────────────────

/// The event loop plus root state: what a launcher embeds.
///
/// `run` executes the top level (expected to call [`crate::spawn`]),
/// drives the loop until every fiber has terminated, tears down remaining
/// handles, prints the diagnostics summary, and returns the
/// script-settable exit code.
pub struct Runtime {
    rt: tokio::runtime::Runtime,
    handle: RuntimeHandle,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> anyhow::Result<Runtime> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Runtime {
            rt,
            handle: RuntimeHandle::new(config),
        })
    }

    pub fn handle(&self) -> RuntimeHandle {
        self.handle.clone()
    }

    pub fn run<F>(&mut self, top: F) -> i32
    where
        F: FnOnce(&RuntimeHandle),
    {
        let handle = self.handle.clone();
        let local = LocalSet::new();
        self.rt.block_on(local.run_until(async {
            top(&handle);
            handle.wait_idle().await;
            handle.request_stop();
            handle.close_all_handles().await;
        }));
        // Drain any finalizer still queued on the local set.
        self.rt.block_on(local);

        let snap = self.handle.diagnostics();
        tracing::info!(
            fibers = snap.fibers_spawned,
            faults = snap.fiber_faults,
            anchors_created = snap.anchors_created,
            anchors_released = snap.anchors_released,
            handles_live = snap.handles_live,
            dgram_dropped = snap.dgram_dropped,
            "lunet shutdown"
        );
        if !snap.anchors_balanced() {
            tracing::error!(
                created = snap.anchors_created,
                released = snap.anchors_released,
                live = snap.anchors_live,
                "ANCHOR_IMBALANCE at shutdown"
            );
            debug_assert!(snap.anchors_balanced(), "anchor imbalance at shutdown");
        }
        self.handle.exit_code()
    }
}
