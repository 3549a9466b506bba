use bytes::Bytes;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;

use crate::bridge::{HandleState, Pump};
use crate::error::CoreError;
use crate::registry::{HandleId, HandleSlot};
use crate::runtime::RuntimeHandle;
use crate::value::Value;

/// Largest datagram the receive pump will deliver.
const RECV_BUF: usize = 64 * 1024;

/// A bound datagram socket. The receive side is permanently armed by a
/// pump; messages that arrive before the script calls `recv` accumulate
/// in the inbox, capped with drop-oldest (observable via the runtime's
/// `dgram_dropped` counter).
pub struct DgramHandle {
    pub(crate) rt: RuntimeHandle,
    pub(crate) id: Cell<HandleId>,
    pub(crate) state: Cell<HandleState>,
    socket: Rc<UdpSocket>,
    local: SocketAddr,
    inbox: RefCell<VecDeque<(Bytes, SocketAddr)>>,
    recv_armed: Cell<bool>,
    recv_tx: RefCell<Option<oneshot::Sender<(Bytes, SocketAddr)>>>,
    send_armed: Cell<bool>,
    pump: Pump,
}

impl DgramHandle {
    pub fn inbox_len(&self) -> usize {
        self.inbox.borrow().len()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

// ─── Bind ─────────────────────────────────────────────────────

/// Bind a datagram socket and start its receive pump. Synchronous, like
/// `listen`.
pub fn bind(rt: &RuntimeHandle, host: &str, port: u16) -> Result<HandleId, CoreError> {
    crate::stream::check_loopback(rt, host, port)?;
    let std_socket = std::net::UdpSocket::bind((host, port))
        .map_err(|e| CoreError::BindFailed(e.to_string()))?;
    std_socket
        .set_nonblocking(true)
        .map_err(|e| CoreError::BindFailed(e.to_string()))?;
    let socket = UdpSocket::from_std(std_socket).map_err(|e| CoreError::BindFailed(e.to_string()))?;
    let local = socket
        .local_addr()
        .map_err(|e| CoreError::BindFailed(e.to_string()))?;

    let handle = Rc::new(DgramHandle {
        rt: rt.clone(),
        id: Cell::new(HandleId(usize::MAX)),
        state: Cell::new(HandleState::Open),
        socket: Rc::new(socket),
        local,
        inbox: RefCell::new(VecDeque::new()),
        recv_armed: Cell::new(false),
        recv_tx: RefCell::new(None),
        send_armed: Cell::new(false),
        pump: Pump::new(),
    });
    let id = rt
        .root
        .registry
        .borrow_mut()
        .insert(HandleSlot::Dgram(handle.clone()));
    handle.id.set(id);
    handle
        .pump
        .start(tokio::task::spawn_local(pump_recv(handle.clone())));
    Ok(id)
}

/// The receive pump: copy each inbound datagram into a queue entry,
/// deliver to the armed waiter if there is one, otherwise let it
/// accumulate. Overflow drops the oldest entry and counts the drop.
async fn pump_recv(d: Rc<DgramHandle>) {
    let token = d.pump.token();
    let socket = d.socket.clone();
    let mut buf = vec![0u8; RECV_BUF];
    loop {
        let received = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            r = socket.recv_from(&mut buf) => r,
        };
        match received {
            Ok((n, from)) => {
                let payload = Bytes::copy_from_slice(&buf[..n]);
                let tx = d.recv_tx.borrow_mut().take();
                match tx {
                    Some(tx) => {
                        if let Err(entry) = tx.send((payload, from)) {
                            d.inbox.borrow_mut().push_back(entry);
                        }
                    }
                    None => {
                        let mut inbox = d.inbox.borrow_mut();
                        inbox.push_back((payload, from));
                        let cap = d.rt.root.config.borrow().dgram_inbox_cap;
                        if cap > 0 && inbox.len() > cap {
                            inbox.pop_front();
                            d.rt.dgram_dropped();
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!("recv on {}: {}", d.local, e);
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        }
    }
}

// ─── Send / recv ──────────────────────────────────────────────

/// Send one datagram. The fiber parks until the kernel accepts it.
pub async fn send(
    rt: &RuntimeHandle,
    socket: HandleId,
    host: &str,
    port: u16,
    data: Bytes,
) -> Result<Vec<Value>, CoreError> {
    let d = rt.root.registry.borrow().get_dgram(socket)?;
    if d.state.get() != HandleState::Open {
        return Err(CoreError::ConnClosed);
    }
    if d.send_armed.get() {
        return Err(CoreError::AnotherInProgress);
    }
    d.send_armed.set(true);

    let token = d.pump.token();
    let res = tokio::select! {
        biased;
        _ = token.cancelled() => Err(CoreError::Cancelled),
        r = d.socket.send_to(&data, (host, port)) => {
            r.map_err(|e| CoreError::SendFailed(e.to_string()))
        }
    };
    d.send_armed.set(false);
    res.map(|_| vec![])
}

/// Receive one datagram: immediate when the inbox is non-empty, parking
/// otherwise. Delivery is in arrival order.
pub async fn recv(rt: &RuntimeHandle, socket: HandleId) -> Result<Vec<Value>, CoreError> {
    let d = rt.root.registry.borrow().get_dgram(socket)?;
    if d.state.get() != HandleState::Open {
        return Err(CoreError::ConnClosed);
    }

    let queued = d.inbox.borrow_mut().pop_front();
    if let Some((payload, from)) = queued {
        return Ok(recv_result(payload, from));
    }

    if d.recv_armed.get() {
        return Err(CoreError::AnotherInProgress);
    }
    d.recv_armed.set(true);
    let (tx, rx) = oneshot::channel();
    *d.recv_tx.borrow_mut() = Some(tx);

    let token = d.pump.token();
    let res = tokio::select! {
        biased;
        _ = token.cancelled() => Err(CoreError::Cancelled),
        r = rx => r.map_err(|_| CoreError::Cancelled),
    };
    d.recv_armed.set(false);
    d.recv_tx.borrow_mut().take();
    res.map(|(payload, from)| recv_result(payload, from))
}

fn recv_result(payload: Bytes, from: SocketAddr) -> Vec<Value> {
    vec![
        Value::Bytes(payload),
        Value::Str(from.ip().to_string()),
        Value::Int(i64::from(from.port())),
    ]
}

// ─── Close ────────────────────────────────────────────────────

pub(crate) fn close(d: Rc<DgramHandle>) {
    if d.state.get() != HandleState::Open {
        return;
    }
    d.state.set(HandleState::Closing);
    d.pump.cancel();
    let rt = d.rt.clone();
    tokio::task::spawn_local(async move {
        d.pump.shutdown().await;
        rt.root.registry.borrow_mut().remove(d.id.get());
        d.state.set(HandleState::Closed);
    });
}
