//! Operation dispatch: routes a fiber's yielded request to the owning
//! engine, wrapping every suspending primitive in a registry anchor for
//! the duration of the suspension.

use crate::dgram;
use crate::error::CoreError;
use crate::fiber::{spawn, FiberCtx};
use crate::fsops;
use crate::registry::{HandleId, HandleSlot};
use crate::runtime::RuntimeHandle;
use crate::script::OpRequest;
use crate::signal;
use crate::stream;
use crate::timer;
use crate::value::Value;

/// Dispatch one operation for a running fiber. Returns the fiber's resume
/// values; failures resolve as `(nil, err)`.
pub(crate) async fn dispatch(ctx: &FiberCtx, req: OpRequest) -> Vec<Value> {
    if !req.is_suspending() {
        return match dispatch_sync(&ctx.rt, req) {
            Ok(v) => v,
            Err(e) => e.into_result(),
        };
    }

    // Anchor the fiber across the suspension: created at the moment of
    // suspension, released exactly once when the guard drops on resume.
    let _anchor = ctx.rt.anchor(ctx.fiber.clone());
    let rt = &ctx.rt;
    let res = match req {
        OpRequest::Accept { listener } => stream::accept(rt, listener).await,
        OpRequest::Connect { host, port } => stream::connect(rt, &host, port).await,
        OpRequest::ConnectUnix { path } => stream::connect_unix(rt, &path).await,
        OpRequest::Read { stream: h } => stream::read(rt, h).await,
        OpRequest::Write { stream: h, data } => stream::write(rt, h, data).await,
        OpRequest::DgramSend {
            socket,
            host,
            port,
            data,
        } => dgram::send(rt, socket, &host, port, data).await,
        OpRequest::DgramRecv { socket } => dgram::recv(rt, socket).await,
        OpRequest::Sleep { ms } => timer::sleep(ms).await,
        OpRequest::SignalWait { name } => signal::wait(rt, &name).await,
        OpRequest::Native(op) => return op.run(rt.clone()).await,
        _ => unreachable!("non-suspending op in suspending dispatch"),
    };
    res.unwrap_or_else(CoreError::into_result)
}

/// The synchronous subset, shared with [`RuntimeHandle::try_dispatch`].
pub(crate) fn dispatch_sync(rt: &RuntimeHandle, req: OpRequest) -> Result<Vec<Value>, CoreError> {
    match req {
        OpRequest::Spawn { fiber, args } => {
            let id = spawn(rt, fiber, args);
            Ok(vec![Value::Int(id.0 as i64)])
        }
        OpRequest::Exit { code } => {
            rt.set_exit_code(code);
            Ok(vec![])
        }
        OpRequest::SetReadBufferSize { bytes } => stream::set_read_buffer_size(rt, bytes),
        OpRequest::Listen { proto, addr, port } => {
            stream::listen(rt, proto, &addr, port).map(|id| vec![Value::handle(id)])
        }
        OpRequest::GetPeerName { stream: h } => stream::getpeername(rt, h),
        OpRequest::Close { handle } => close(rt, handle),
        OpRequest::Unlink { path } => fsops::unlink(&path),
        OpRequest::DgramBind { host, port } => {
            dgram::bind(rt, &host, port).map(|id| vec![Value::handle(id)])
        }
        OpRequest::FsOpen { path, mode } => fsops::open(rt, &path, mode),
        OpRequest::FsRead { file, max } => fsops::read(rt, file, max),
        OpRequest::FsWrite { file, data } => fsops::write(rt, file, data),
        OpRequest::FsStat { path } => fsops::stat(&path),
        OpRequest::FsScandir { path } => fsops::scandir(&path),
        _ => unreachable!("suspending op in sync dispatch"),
    }
}

/// Close any registry handle. Never parks the calling fiber: the
/// two-phase teardown completes on the loop after this returns.
pub(crate) fn close(rt: &RuntimeHandle, handle: HandleId) -> Result<Vec<Value>, CoreError> {
    let slot = rt.root.registry.borrow().get_any(handle)?;
    match slot {
        HandleSlot::Listener(l) => stream::close_listener(l),
        HandleSlot::Stream(s) => stream::close_stream(s),
        HandleSlot::Dgram(d) => dgram::close(d),
        HandleSlot::File(f) => fsops::close(rt, f),
        // Offload-crate handles close through their own ops (db.close).
        HandleSlot::Native(_) => return Err(CoreError::InvalidHandle),
    }
    Ok(vec![])
}
