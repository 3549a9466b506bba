use bytes::Bytes;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::{IpAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::rc::Rc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{tcp, unix, TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::{oneshot, Notify};

use crate::bridge::{HandleState, Pump};
use crate::error::CoreError;
use crate::registry::{HandleId, HandleSlot};
use crate::runtime::RuntimeHandle;
use crate::script::Proto;
use crate::value::Value;

/// Longest path a unix socket address can carry (sun_path minus NUL).
const UNIX_PATH_MAX: usize = 107;

// ─── Socket wrappers ──────────────────────────────────────────

enum ListenerSocket {
    Tcp(TcpListener),
    Unix(UnixListener),
}

enum AcceptedStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

enum ReadHalf {
    Tcp(tcp::OwnedReadHalf),
    Unix(unix::OwnedReadHalf),
}

enum WriteHalf {
    Tcp(tcp::OwnedWriteHalf),
    Unix(unix::OwnedWriteHalf),
}

impl ReadHalf {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            ReadHalf::Tcp(r) => r.read(buf).await,
            ReadHalf::Unix(r) => r.read(buf).await,
        }
    }
}

impl WriteHalf {
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            WriteHalf::Tcp(w) => w.write_all(buf).await,
            WriteHalf::Unix(w) => w.write_all(buf).await,
        }
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            WriteHalf::Tcp(w) => w.shutdown().await,
            WriteHalf::Unix(w) => w.shutdown().await,
        }
    }
}

// ─── Handles ──────────────────────────────────────────────────

/// A listening socket. Lives until closed; stores the root state, never
/// the fiber that created it — the creating fiber may return immediately
/// and later accepts must still resolve through live state.
pub struct ListenerHandle {
    pub(crate) rt: RuntimeHandle,
    pub(crate) id: Cell<HandleId>,
    pub(crate) proto: Proto,
    pub(crate) local: String,
    unix_path: Option<PathBuf>,
    pub(crate) state: Cell<HandleState>,
    /// Connections admitted by the kernel before any `accept` ran. FIFO.
    backlog: RefCell<VecDeque<HandleId>>,
    accept_armed: Cell<bool>,
    accept_tx: RefCell<Option<oneshot::Sender<Result<HandleId, CoreError>>>>,
    /// Wakes the pump after a backlog pop when it paused at the watermark.
    drained: Notify,
    pump: Pump,
}

impl ListenerHandle {
    pub fn backlog_len(&self) -> usize {
        self.backlog.borrow().len()
    }

    pub fn local_addr(&self) -> &str {
        &self.local
    }

    pub fn proto(&self) -> Proto {
        self.proto
    }
}

/// A connected stream. Read and write sides are independent and each
/// single-armed.
pub struct StreamHandle {
    pub(crate) rt: RuntimeHandle,
    pub(crate) id: Cell<HandleId>,
    pub(crate) state: Cell<HandleState>,
    peer: String,
    rd: RefCell<ReadHalf>,
    wr: RefCell<WriteHalf>,
    read_armed: Cell<bool>,
    write_armed: Cell<bool>,
    pump: Pump,
}

// ─── Bind / listen ────────────────────────────────────────────

pub(crate) fn check_loopback(rt: &RuntimeHandle, host: &str, port: u16) -> Result<(), CoreError> {
    if rt.root.config.borrow().allow_nonloopback {
        return Ok(());
    }
    let ip: Option<IpAddr> = match host.parse() {
        Ok(ip) => Some(ip),
        Err(_) => (host, port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut it| it.next())
            .map(|a| a.ip()),
    };
    match ip {
        Some(ip) if ip.is_loopback() => Ok(()),
        _ => Err(CoreError::NonLoopbackForbidden(host.to_string())),
    }
}

/// Create a listening socket and start its accept pump. Synchronous:
/// listening never parks the fiber, so a fiber may `listen`, stash the
/// handle and return before the first connection arrives.
pub fn listen(
    rt: &RuntimeHandle,
    proto: Proto,
    addr: &str,
    port: u16,
) -> Result<HandleId, CoreError> {
    let (socket, local, unix_path) = match proto {
        Proto::Tcp => {
            check_loopback(rt, addr, port)?;
            let std_listener = std::net::TcpListener::bind((addr, port))
                .map_err(|e| CoreError::BindFailed(e.to_string()))?;
            std_listener
                .set_nonblocking(true)
                .map_err(|e| CoreError::ListenFailed(e.to_string()))?;
            let listener = TcpListener::from_std(std_listener)
                .map_err(|e| CoreError::ListenFailed(e.to_string()))?;
            let local = listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default();
            (ListenerSocket::Tcp(listener), local, None)
        }
        Proto::Unix => {
            if addr.len() > UNIX_PATH_MAX {
                return Err(CoreError::PathTooLong);
            }
            let std_listener = std::os::unix::net::UnixListener::bind(addr)
                .map_err(|e| CoreError::BindFailed(e.to_string()))?;
            std_listener
                .set_nonblocking(true)
                .map_err(|e| CoreError::ListenFailed(e.to_string()))?;
            let listener = UnixListener::from_std(std_listener)
                .map_err(|e| CoreError::ListenFailed(e.to_string()))?;
            (
                ListenerSocket::Unix(listener),
                addr.to_string(),
                Some(PathBuf::from(addr)),
            )
        }
    };

    let handle = Rc::new(ListenerHandle {
        rt: rt.clone(),
        id: Cell::new(HandleId(usize::MAX)),
        proto,
        local,
        unix_path,
        state: Cell::new(HandleState::Open),
        backlog: RefCell::new(VecDeque::new()),
        accept_armed: Cell::new(false),
        accept_tx: RefCell::new(None),
        drained: Notify::new(),
        pump: Pump::new(),
    });
    let id = rt
        .root
        .registry
        .borrow_mut()
        .insert(HandleSlot::Listener(handle.clone()));
    handle.id.set(id);
    handle
        .pump
        .start(tokio::task::spawn_local(pump_accept(handle.clone(), socket)));
    Ok(id)
}

/// The listener's accept pump: admit kernel connections as they arrive,
/// deliver to the armed acceptor or queue in the backlog, and pause at
/// the back-pressure watermark.
async fn pump_accept(l: Rc<ListenerHandle>, socket: ListenerSocket) {
    let token = l.pump.token();
    loop {
        loop {
            let watermark = l.rt.root.config.borrow().accept_backlog_watermark;
            if l.backlog.borrow().len() < watermark {
                break;
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = l.drained.notified() => {}
            }
        }

        let accepted = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            r = async {
                match &socket {
                    ListenerSocket::Tcp(s) => s.accept().await.map(|(c, _)| AcceptedStream::Tcp(c)),
                    ListenerSocket::Unix(s) => s.accept().await.map(|(c, _)| AcceptedStream::Unix(c)),
                }
            } => r,
        };

        match accepted {
            Ok(conn) => {
                let cid = register_client(&l.rt, conn);
                let tx = l.accept_tx.borrow_mut().take();
                match tx {
                    Some(tx) => {
                        if let Err(Ok(cid)) = tx.send(Ok(cid)) {
                            l.backlog.borrow_mut().push_back(cid);
                        }
                    }
                    None => l.backlog.borrow_mut().push_back(cid),
                }
            }
            Err(e) => {
                let tx = l.accept_tx.borrow_mut().take();
                if let Some(tx) = tx {
                    let _ = tx.send(Err(CoreError::AcceptFailed(e.to_string())));
                } else {
                    tracing::warn!("accept on {}: {}", l.local, e);
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
            }
        }
    }
}

fn register_client(rt: &RuntimeHandle, conn: AcceptedStream) -> HandleId {
    let (peer, rd, wr) = match conn {
        AcceptedStream::Tcp(s) => {
            let peer = s
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".to_string());
            let (rd, wr) = s.into_split();
            (peer, ReadHalf::Tcp(rd), WriteHalf::Tcp(wr))
        }
        AcceptedStream::Unix(s) => {
            let (rd, wr) = s.into_split();
            ("unix".to_string(), ReadHalf::Unix(rd), WriteHalf::Unix(wr))
        }
    };
    let handle = Rc::new(StreamHandle {
        rt: rt.clone(),
        id: Cell::new(HandleId(usize::MAX)),
        state: Cell::new(HandleState::Open),
        peer,
        rd: RefCell::new(rd),
        wr: RefCell::new(wr),
        read_armed: Cell::new(false),
        write_armed: Cell::new(false),
        pump: Pump::new(),
    });
    let id = rt
        .root
        .registry
        .borrow_mut()
        .insert(HandleSlot::Stream(handle.clone()));
    handle.id.set(id);
    id
}

// ─── Accept ───────────────────────────────────────────────────

/// Take the next connection. Backlogged connections return immediately
/// without parking; otherwise the fiber arms the accept side and waits.
pub async fn accept(rt: &RuntimeHandle, listener: HandleId) -> Result<Vec<Value>, CoreError> {
    let l = rt.root.registry.borrow().get_listener(listener)?;
    if l.state.get() != HandleState::Open {
        return Err(CoreError::ConnClosed);
    }

    let queued = l.backlog.borrow_mut().pop_front();
    if let Some(cid) = queued {
        l.drained.notify_one();
        return Ok(vec![Value::handle(cid)]);
    }

    if l.accept_armed.get() {
        return Err(CoreError::AnotherInProgress);
    }
    l.accept_armed.set(true);
    let (tx, rx) = oneshot::channel();
    *l.accept_tx.borrow_mut() = Some(tx);

    let token = l.pump.token();
    let res = tokio::select! {
        biased;
        _ = token.cancelled() => Err(CoreError::Cancelled),
        r = rx => r.unwrap_or(Err(CoreError::Cancelled)),
    };

    l.accept_armed.set(false);
    l.accept_tx.borrow_mut().take();
    res.map(|cid| vec![Value::handle(cid)])
}

// ─── Connect ──────────────────────────────────────────────────

pub async fn connect(rt: &RuntimeHandle, host: &str, port: u16) -> Result<Vec<Value>, CoreError> {
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| CoreError::ConnectFailed(e.to_string()))?;
    Ok(vec![Value::handle(register_client(
        rt,
        AcceptedStream::Tcp(stream),
    ))])
}

pub async fn connect_unix(rt: &RuntimeHandle, path: &str) -> Result<Vec<Value>, CoreError> {
    if path.len() > UNIX_PATH_MAX {
        return Err(CoreError::PathTooLong);
    }
    let stream = UnixStream::connect(path)
        .await
        .map_err(|e| CoreError::ConnectFailed(e.to_string()))?;
    Ok(vec![Value::handle(register_client(
        rt,
        AcceptedStream::Unix(stream),
    ))])
}

// ─── Read / write ─────────────────────────────────────────────

/// One-shot read: the next delivered chunk, as a fresh bytes value.
/// EOF resumes the fiber with nil.
pub async fn read(rt: &RuntimeHandle, stream: HandleId) -> Result<Vec<Value>, CoreError> {
    let s = rt.root.registry.borrow().get_stream(stream)?;
    if s.state.get() != HandleState::Open {
        return Err(CoreError::ConnClosed);
    }
    if s.read_armed.get() {
        return Err(CoreError::AnotherInProgress);
    }
    s.read_armed.set(true);

    let mut buf = vec![0u8; rt.read_buffer_size()];
    let token = s.pump.token();
    let res = {
        let mut rd = s.rd.borrow_mut();
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(CoreError::Cancelled),
            r = rd.read(&mut buf) => r.map_err(|e| CoreError::ReadFailed(e.to_string())),
        }
    };
    s.read_armed.set(false);

    match res {
        Ok(0) => Ok(vec![Value::Nil]),
        Ok(n) => {
            buf.truncate(n);
            Ok(vec![Value::Bytes(Bytes::from(buf))])
        }
        Err(e) => Err(e),
    }
}

/// Queue the whole payload and park until the kernel has accepted it.
/// Partial success is never exposed: the op resolves once everything is
/// written or the connection has failed.
pub async fn write(rt: &RuntimeHandle, stream: HandleId, data: Bytes) -> Result<Vec<Value>, CoreError> {
    let s = rt.root.registry.borrow().get_stream(stream)?;
    if s.state.get() != HandleState::Open {
        return Err(CoreError::ConnClosed);
    }
    if s.write_armed.get() {
        return Err(CoreError::AnotherInProgress);
    }
    s.write_armed.set(true);

    let token = s.pump.token();
    let res = {
        let mut wr = s.wr.borrow_mut();
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(CoreError::Cancelled),
            r = wr.write_all(&data) => r.map_err(|e| CoreError::WriteFailed(e.to_string())),
        }
    };
    s.write_armed.set(false);
    res.map(|_| vec![])
}

// ─── Metadata & config ────────────────────────────────────────

pub fn getpeername(rt: &RuntimeHandle, stream: HandleId) -> Result<Vec<Value>, CoreError> {
    let s = rt.root.registry.borrow().get_stream(stream)?;
    if s.state.get() != HandleState::Open {
        return Err(CoreError::ConnClosed);
    }
    Ok(vec![Value::Str(s.peer.clone())])
}

pub fn set_read_buffer_size(rt: &RuntimeHandle, bytes: usize) -> Result<Vec<Value>, CoreError> {
    if bytes == 0 {
        return Err(CoreError::BadParam("read buffer size must be > 0".into()));
    }
    rt.set_read_buffer_size(bytes);
    Ok(vec![])
}

// ─── Close ────────────────────────────────────────────────────

/// Close a listener: cancel the pump, resolve an armed accept with
/// `CANCELLED`, close undelivered backlog entries, then vacate the slot
/// once the pump has joined. Teardown resolves through the handle's
/// stored root state; the fiber that called close may be long gone by
/// the time the pump joins.
pub(crate) fn close_listener(l: Rc<ListenerHandle>) {
    if l.state.get() != HandleState::Open {
        return;
    }
    l.state.set(HandleState::Closing);
    l.pump.cancel();
    let rt = l.rt.clone();
    tokio::task::spawn_local(async move {
        l.pump.shutdown().await;
        let queued: Vec<HandleId> = l.backlog.borrow_mut().drain(..).collect();
        for cid in queued {
            let client = rt.root.registry.borrow().get_stream(cid);
            if let Ok(s) = client {
                close_stream(s);
            }
        }
        rt.root.registry.borrow_mut().remove(l.id.get());
        l.state.set(HandleState::Closed);
        if let Some(path) = &l.unix_path {
            let _ = std::fs::remove_file(path);
        }
    });
}

/// Close a connected stream: cancel armed ops, then shut the write side
/// down and vacate the slot once both sides have disarmed.
pub(crate) fn close_stream(s: Rc<StreamHandle>) {
    if s.state.get() != HandleState::Open {
        return;
    }
    s.state.set(HandleState::Closing);
    s.pump.cancel();
    let rt = s.rt.clone();
    tokio::task::spawn_local(async move {
        while s.read_armed.get() || s.write_armed.get() {
            tokio::task::yield_now().await;
        }
        {
            let mut wr = s.wr.borrow_mut();
            let _ = wr.shutdown().await;
        }
        rt.root.registry.borrow_mut().remove(s.id.get());
        s.state.set(HandleState::Closed);
    });
}
