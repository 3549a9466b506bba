use async_trait::async_trait;
use bytes::Bytes;

use crate::registry::HandleId;
use crate::runtime::RuntimeHandle;
use crate::value::Value;

// ─── The engine seam ──────────────────────────────────────────

/// One step of a script fiber.
pub enum Step {
    /// The fiber suspended on an async primitive; resume it with the
    /// operation's results.
    Yield(OpRequest),
    /// The fiber's entry function returned.
    Done(Vec<Value>),
}

/// A fatal script error raised while the fiber was executing.
#[derive(Clone, Debug)]
pub struct FiberFault {
    pub message: String,
}

impl FiberFault {
    pub fn new(message: impl Into<String>) -> FiberFault {
        FiberFault {
            message: message.into(),
        }
    }
}

/// The contract a scripting engine implements so the runtime can drive its
/// cooperative tasks.
///
/// `step` runs script code on the loop thread until the fiber either
/// suspends on a primitive (`Step::Yield`) or terminates. The runtime
/// passes the previous operation's results in as the resume values. The
/// engine never blocks inside `step`; anything that waits must be
/// expressed as a yield.
pub trait ScriptFiber: 'static {
    fn step(&mut self, inputs: Vec<Value>) -> Result<Step, FiberFault>;
}

/// Closures are fibers. Tests and small embedders write fiber bodies as
/// `FnMut(Vec<Value>) -> Result<Step, FiberFault>` state machines.
impl<F> ScriptFiber for F
where
    F: FnMut(Vec<Value>) -> Result<Step, FiberFault> + 'static,
{
    fn step(&mut self, inputs: Vec<Value>) -> Result<Step, FiberFault> {
        self(inputs)
    }
}

// ─── Operations ───────────────────────────────────────────────

/// Stream transport selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Proto {
    Tcp,
    Unix,
}

/// File open mode for the filesystem surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsMode {
    Read,
    Write,
    Append,
}

/// An operation a fiber yields on.
///
/// Suspending variants park the fiber until the loop completes the I/O;
/// the rest resolve synchronously on the loop thread. `Native` is the
/// extension point the offload crates (db, httpc) plug into.
pub enum OpRequest {
    // Fiber & runtime
    Spawn {
        fiber: Box<dyn ScriptFiber>,
        args: Vec<Value>,
    },
    Exit {
        code: i32,
    },
    SetReadBufferSize {
        bytes: usize,
    },

    // Stream
    Listen {
        proto: Proto,
        /// Host for tcp, filesystem path for unix.
        addr: String,
        port: u16,
    },
    Accept {
        listener: HandleId,
    },
    Connect {
        host: String,
        port: u16,
    },
    ConnectUnix {
        path: String,
    },
    Read {
        stream: HandleId,
    },
    Write {
        stream: HandleId,
        data: Bytes,
    },
    GetPeerName {
        stream: HandleId,
    },
    /// Close any registry handle (stream, listener, datagram, file).
    Close {
        handle: HandleId,
    },
    Unlink {
        path: String,
    },

    // Datagram
    DgramBind {
        host: String,
        port: u16,
    },
    DgramSend {
        socket: HandleId,
        host: String,
        port: u16,
        data: Bytes,
    },
    DgramRecv {
        socket: HandleId,
    },

    // Timer & signal
    Sleep {
        ms: u64,
    },
    SignalWait {
        name: String,
    },

    // Filesystem (synchronous surface)
    FsOpen {
        path: String,
        mode: FsMode,
    },
    FsRead {
        file: HandleId,
        max: usize,
    },
    FsWrite {
        file: HandleId,
        data: Bytes,
    },
    FsStat {
        path: String,
    },
    FsScandir {
        path: String,
    },

    // Offloaded native work (db, httpc)
    Native(Box<dyn NativeOp>),
}

impl OpRequest {
    /// Stable short name for logs and diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            OpRequest::Spawn { .. } => "spawn",
            OpRequest::Exit { .. } => "exit",
            OpRequest::SetReadBufferSize { .. } => "set_read_buffer_size",
            OpRequest::Listen { .. } => "listen",
            OpRequest::Accept { .. } => "accept",
            OpRequest::Connect { .. } => "connect",
            OpRequest::ConnectUnix { .. } => "connect_unix",
            OpRequest::Read { .. } => "read",
            OpRequest::Write { .. } => "write",
            OpRequest::GetPeerName { .. } => "getpeername",
            OpRequest::Close { .. } => "close",
            OpRequest::Unlink { .. } => "unlink",
            OpRequest::DgramBind { .. } => "dgram_bind",
            OpRequest::DgramSend { .. } => "dgram_send",
            OpRequest::DgramRecv { .. } => "dgram_recv",
            OpRequest::Sleep { .. } => "sleep",
            OpRequest::SignalWait { .. } => "signal_wait",
            OpRequest::FsOpen { .. } => "fs_open",
            OpRequest::FsRead { .. } => "fs_read",
            OpRequest::FsWrite { .. } => "fs_write",
            OpRequest::FsStat { .. } => "fs_stat",
            OpRequest::FsScandir { .. } => "fs_scandir",
            OpRequest::Native(op) => op.name(),
        }
    }

    /// True for the primitives that park the fiber. Exactly these may not
    /// be issued from outside a fiber.
    pub fn is_suspending(&self) -> bool {
        matches!(
            self,
            OpRequest::Accept { .. }
                | OpRequest::Connect { .. }
                | OpRequest::ConnectUnix { .. }
                | OpRequest::Read { .. }
                | OpRequest::Write { .. }
                | OpRequest::DgramSend { .. }
                | OpRequest::DgramRecv { .. }
                | OpRequest::Sleep { .. }
                | OpRequest::SignalWait { .. }
                | OpRequest::Native(_)
        )
    }
}

/// Blocking or pool-offloaded work exposed as a script primitive.
///
/// Implementations marshal their inputs up front, run the blocking part
/// on the pool via `spawn_blocking`, and materialize results back into
/// values on the loop thread. They must not touch script state from the
/// pool thread — only the returned values reach the fiber.
#[async_trait(?Send)]
pub trait NativeOp: 'static {
    fn name(&self) -> &'static str;
    async fn run(self: Box<Self>, rt: RuntimeHandle) -> Vec<Value>;
}
