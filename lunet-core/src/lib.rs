//! Lunet runtime core.
//!
//! Lunet embeds a scripting language on top of an asynchronous event loop so
//! that ordinary-looking sequential script code transparently performs
//! non-blocking I/O. A script calls `read`, `accept`, `sleep` or `db.query`
//! as if they were blocking; the runtime suspends the calling fiber, drives
//! the I/O through the loop, and resumes the fiber with the result.
//!
//! This crate is the core: the value model and script-engine seam, the
//! registry that keeps suspended fibers anchored across loop callbacks, the
//! fiber runtime itself, and the stream/datagram/timer/signal engines. The
//! offload-based modules (database, outbound HTTPS) live in sibling crates
//! and plug in through [`script::NativeOp`].
//!
//! The whole crate is single-threaded by construction: every fiber steps on
//! the loop thread inside a `tokio` `LocalSet`, and exactly one fiber
//! executes script code at any instant. Blocking work never runs here — it
//! is pushed to the blocking pool and only its results come back.

pub mod bridge;
pub mod dgram;
pub mod error;
pub mod fiber;
pub mod fsops;
mod ops;
pub mod registry;
pub mod runtime;
pub mod script;
pub mod signal;
pub mod stream;
pub mod timer;
pub mod value;

pub use error::CoreError;
pub use fiber::{spawn, FiberId};
pub use registry::{AnchorId, HandleId};
pub use runtime::{Runtime, RuntimeConfig, RuntimeHandle};
pub use script::{FiberFault, FsMode, NativeOp, OpRequest, Proto, ScriptFiber, Step};
pub use value::{Table, Value};
