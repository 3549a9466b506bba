use std::cell::RefCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ─── Handle lifecycle ─────────────────────────────────────────

/// Lifecycle of a loop-owned resource. Close is two-phase: `Open →
/// Closing` cancels the pump and resolves armed ops with `CANCELLED`;
/// the slot is vacated (`Closed`) only after the pump has joined, which
/// is the loop's confirmation that no further callback will fire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleState {
    Open,
    Closing,
    Closed,
}

// ─── Pump ─────────────────────────────────────────────────────

/// A background task tied to one handle (accept loop, datagram receive
/// loop) plus the token that cancels it.
///
/// Ops racing against the handle's teardown select on `token()`; the
/// close path calls `shutdown` and awaits the join before freeing the
/// handle slot.
pub(crate) struct Pump {
    token: CancellationToken,
    task: RefCell<Option<JoinHandle<()>>>,
}

impl Pump {
    pub fn new() -> Pump {
        Pump {
            token: CancellationToken::new(),
            task: RefCell::new(None),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn start(&self, task: JoinHandle<()>) {
        let prev = self.task.borrow_mut().replace(task);
        debug_assert!(prev.is_none(), "pump started twice");
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancel and join. After this returns, no pump callback can fire.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let task = self.task.borrow_mut().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}
