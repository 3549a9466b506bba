use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::ops;
use crate::runtime::RuntimeHandle;
use crate::script::{ScriptFiber, Step};
use crate::value::Value;

// ─── Fiber identity ───────────────────────────────────────────

/// Stable fiber identity, unique per root state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FiberId(pub u64);

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber#{}", self.0)
    }
}

/// Runtime-side state of one fiber. The registry holds strong refs to this
/// (anchors) while the fiber is suspended; the driver task holds one for
/// the fiber's whole life.
pub struct FiberState {
    pub id: FiberId,
    pub(crate) fiber: RefCell<Box<dyn ScriptFiber>>,
    pub(crate) alive: Cell<bool>,
}

impl FiberState {
    /// False once the fiber's entry function has returned or faulted.
    pub fn is_alive(&self) -> bool {
        self.alive.get()
    }
}

pub type FiberRef = Rc<FiberState>;

/// Dispatch context for the currently executing fiber.
pub(crate) struct FiberCtx {
    pub rt: RuntimeHandle,
    pub fiber: FiberRef,
}

// ─── Spawn & drive ────────────────────────────────────────────

/// Create a new fiber, anchor it in the root registry, and schedule its
/// first step at the tail of the current loop iteration.
///
/// Must be called on the loop thread (inside the runtime's `LocalSet`).
/// The entry function runs when the loop next idles, not inline.
pub fn spawn(rt: &RuntimeHandle, fiber: Box<dyn ScriptFiber>, args: Vec<Value>) -> FiberId {
    let id = rt.next_fiber_id();
    let state: FiberRef = Rc::new(FiberState {
        id,
        fiber: RefCell::new(fiber),
        alive: Cell::new(true),
    });

    let anchor = rt.anchor(state.clone());
    rt.fiber_started();

    let rt2 = rt.clone();
    tokio::task::spawn_local(async move {
        drive(rt2.clone(), state, args).await;
        drop(anchor);
        rt2.fiber_finished();
    });
    id
}

/// The fiber driver: step the script until it parks on a primitive, run
/// the primitive, resume with its results. Exactly one fiber steps at any
/// instant because the whole runtime lives on one `LocalSet`.
async fn drive(rt: RuntimeHandle, state: FiberRef, mut inputs: Vec<Value>) {
    let ctx = FiberCtx {
        rt,
        fiber: state.clone(),
    };
    loop {
        let step = state.fiber.borrow_mut().step(std::mem::take(&mut inputs));
        match step {
            Ok(Step::Yield(req)) => {
                inputs = ops::dispatch(&ctx, req).await;
            }
            Ok(Step::Done(_)) => break,
            Err(fault) => {
                ctx.rt.fiber_faulted();
                tracing::error!("FIBER_FAULT: {}: {}", state.id, fault.message);
                break;
            }
        }
    }
    state.alive.set(false);
}
