//! Integration tests for the stream engine: loopback echo, listener
//! lifetime beyond its creating fiber, backlog drain, and the per-side
//! operation contract.

use bytes::Bytes;
use std::cell::RefCell;
use std::rc::Rc;

use lunet_core::{
    spawn, FiberFault, OpRequest, Proto, Runtime, RuntimeConfig, Step, Value,
};

fn yielded(req: OpRequest) -> Result<Step, FiberFault> {
    Ok(Step::Yield(req))
}

fn done() -> Result<Step, FiberFault> {
    Ok(Step::Done(vec![]))
}

fn handle_of(inputs: &[Value]) -> lunet_core::HandleId {
    inputs[0]
        .as_handle()
        .unwrap_or_else(|| panic!("expected handle, got {inputs:?}"))
}

/// One fiber accepts, reads one message and writes it back; a second
/// connects, writes "ping" and reads the echo. Clean shutdown with
/// balanced anchors.
#[test]
fn loopback_echo() {
    let mut rt = Runtime::new(RuntimeConfig::default()).unwrap();
    let echoed: Rc<RefCell<Option<Bytes>>> = Rc::new(RefCell::new(None));

    let handle = rt.handle();
    let got = echoed.clone();
    let exit = rt.run(move |h| {
        // Server: listen → accept → read → write back → close.
        let mut step = 0;
        let mut listener = None;
        let mut client = None;
        spawn(
            h,
            Box::new(move |inputs: Vec<Value>| {
                step += 1;
                match step {
                    1 => yielded(OpRequest::Listen {
                        proto: Proto::Tcp,
                        addr: "127.0.0.1".into(),
                        port: 18080,
                    }),
                    2 => {
                        listener = Some(handle_of(&inputs));
                        yielded(OpRequest::Accept {
                            listener: listener.unwrap(),
                        })
                    }
                    3 => {
                        client = Some(handle_of(&inputs));
                        yielded(OpRequest::Read {
                            stream: client.unwrap(),
                        })
                    }
                    4 => {
                        let data = inputs[0].as_bytes().expect("read bytes").clone();
                        yielded(OpRequest::Write {
                            stream: client.unwrap(),
                            data,
                        })
                    }
                    5 => yielded(OpRequest::Close {
                        handle: client.unwrap(),
                    }),
                    6 => yielded(OpRequest::Close {
                        handle: listener.unwrap(),
                    }),
                    _ => done(),
                }
            }),
            vec![],
        );

        // Client: connect → write "ping" → read echo → close.
        let mut step = 0;
        let mut conn = None;
        let got = got.clone();
        spawn(
            h,
            Box::new(move |inputs: Vec<Value>| {
                step += 1;
                match step {
                    1 => yielded(OpRequest::Connect {
                        host: "127.0.0.1".into(),
                        port: 18080,
                    }),
                    2 => {
                        conn = Some(handle_of(&inputs));
                        yielded(OpRequest::Write {
                            stream: conn.unwrap(),
                            data: Bytes::from_static(b"ping"),
                        })
                    }
                    3 => yielded(OpRequest::Read {
                        stream: conn.unwrap(),
                    }),
                    4 => {
                        *got.borrow_mut() = inputs[0].as_bytes().cloned();
                        yielded(OpRequest::Close {
                            handle: conn.unwrap(),
                        })
                    }
                    _ => done(),
                }
            }),
            vec![],
        );
    });

    assert_eq!(exit, 0);
    assert_eq!(echoed.borrow().as_deref(), Some(&b"ping"[..]));
    let snap = handle.diagnostics();
    assert!(snap.anchors_balanced(), "anchor imbalance: {snap:?}");
    assert_eq!(snap.fiber_faults, 0);
    assert_eq!(snap.handles_live, 0);
}

/// A fiber listens on a unix socket, stores the handle and terminates.
/// A later fiber accepts on the same listener and a third connects — no
/// callback may dereference the terminated fiber's state.
#[test]
fn listener_outlives_creating_fiber() {
    let path = "/tmp/lunet-test-sync.sock";
    let _ = std::fs::remove_file(path);

    let mut rt = Runtime::new(RuntimeConfig::default()).unwrap();
    let shared: Rc<RefCell<Option<lunet_core::HandleId>>> = Rc::new(RefCell::new(None));
    let accepted = Rc::new(RefCell::new(false));
    let connected = Rc::new(RefCell::new(false));

    let handle = rt.handle();
    let (s1, s2, ok_a, ok_c) = (
        shared.clone(),
        shared.clone(),
        accepted.clone(),
        connected.clone(),
    );
    rt.run(move |h| {
        // Fiber 1: listen, stash the handle, return immediately.
        let mut step = 0;
        spawn(
            h,
            Box::new(move |inputs: Vec<Value>| {
                step += 1;
                match step {
                    1 => yielded(OpRequest::Listen {
                        proto: Proto::Unix,
                        addr: path.into(),
                        port: 0,
                    }),
                    _ => {
                        *s1.borrow_mut() = Some(handle_of(&inputs));
                        done()
                    }
                }
            }),
            vec![],
        );

        // Fiber 2: accept on the stored listener.
        let mut step = 0;
        let mut client = None;
        spawn(
            h,
            Box::new(move |inputs: Vec<Value>| {
                step += 1;
                match step {
                    1 => yielded(OpRequest::Accept {
                        listener: s2.borrow().expect("listener stored"),
                    }),
                    2 => {
                        client = Some(handle_of(&inputs));
                        *ok_a.borrow_mut() = true;
                        yielded(OpRequest::Close {
                            handle: client.unwrap(),
                        })
                    }
                    3 => yielded(OpRequest::Close {
                        handle: s2.borrow().unwrap(),
                    }),
                    _ => done(),
                }
            }),
            vec![],
        );

        // Fiber 3: connect.
        let mut step = 0;
        let mut conn = None;
        spawn(
            h,
            Box::new(move |inputs: Vec<Value>| {
                step += 1;
                match step {
                    1 => yielded(OpRequest::ConnectUnix { path: path.into() }),
                    2 => {
                        conn = Some(handle_of(&inputs));
                        *ok_c.borrow_mut() = true;
                        yielded(OpRequest::Close {
                            handle: conn.unwrap(),
                        })
                    }
                    _ => done(),
                }
            }),
            vec![],
        );
    });

    assert!(*accepted.borrow());
    assert!(*connected.borrow());
    assert!(handle.diagnostics().anchors_balanced());
    assert!(!std::path::Path::new(path).exists(), "socket file unlinked");
}

/// Two peers connect before any accept runs: both land in the backlog and
/// two sequential accepts drain them without parking.
#[test]
fn backlog_drains_without_suspending() {
    let mut rt = Runtime::new(RuntimeConfig::default()).unwrap();
    let observed_backlog = Rc::new(RefCell::new(0usize));
    let drained = Rc::new(RefCell::new(Vec::new()));

    let handle = rt.handle();
    let obs = observed_backlog.clone();
    let got = drained.clone();
    rt.run(move |h| {
        let h2 = h.clone();
        let mut step = 0;
        let mut listener = None;
        spawn(
            h,
            Box::new(move |inputs: Vec<Value>| {
                step += 1;
                match step {
                    1 => yielded(OpRequest::Listen {
                        proto: Proto::Tcp,
                        addr: "127.0.0.1".into(),
                        port: 18081,
                    }),
                    2 => {
                        listener = Some(handle_of(&inputs));
                        // Let both connectors land while nobody accepts.
                        yielded(OpRequest::Sleep { ms: 100 })
                    }
                    3 => {
                        *obs.borrow_mut() = h2.listener_backlog(listener.unwrap()).unwrap();
                        yielded(OpRequest::Accept {
                            listener: listener.unwrap(),
                        })
                    }
                    4 => {
                        got.borrow_mut().push(handle_of(&inputs));
                        yielded(OpRequest::Accept {
                            listener: listener.unwrap(),
                        })
                    }
                    5 => {
                        got.borrow_mut().push(handle_of(&inputs));
                        yielded(OpRequest::Close {
                            handle: listener.unwrap(),
                        })
                    }
                    _ => done(),
                }
            }),
            vec![],
        );

        for _ in 0..2 {
            let mut step = 0;
            let mut conn = None;
            spawn(
                h,
                Box::new(move |inputs: Vec<Value>| {
                    step += 1;
                    match step {
                        1 => yielded(OpRequest::Connect {
                            host: "127.0.0.1".into(),
                            port: 18081,
                        }),
                        2 => {
                            conn = Some(handle_of(&inputs));
                            // Keep the socket open long enough to be accepted.
                            yielded(OpRequest::Sleep { ms: 200 })
                        }
                        3 => yielded(OpRequest::Close {
                            handle: conn.unwrap(),
                        }),
                        _ => done(),
                    }
                }),
                vec![],
            );
        }
    });

    assert_eq!(*observed_backlog.borrow(), 2);
    let drained = drained.borrow();
    assert_eq!(drained.len(), 2);
    assert_ne!(drained[0], drained[1]);
    assert!(handle.diagnostics().anchors_balanced());
}

/// A second read on an already read-armed side is a contract violation,
/// not a queue.
#[test]
fn second_read_fails_another_in_progress() {
    let mut rt = Runtime::new(RuntimeConfig::default()).unwrap();
    let err = Rc::new(RefCell::new(String::new()));

    let got = err.clone();
    rt.run(move |h| {
        let mut step = 0;
        let mut listener = None;
        spawn(
            h,
            Box::new(move |inputs: Vec<Value>| {
                step += 1;
                match step {
                    1 => yielded(OpRequest::Listen {
                        proto: Proto::Tcp,
                        addr: "127.0.0.1".into(),
                        port: 18082,
                    }),
                    2 => {
                        listener = Some(handle_of(&inputs));
                        yielded(OpRequest::Accept {
                            listener: listener.unwrap(),
                        })
                    }
                    3 => {
                        // Park in a read that nothing will satisfy.
                        yielded(OpRequest::Read {
                            stream: handle_of(&inputs),
                        })
                    }
                    _ => done(),
                }
            }),
            vec![],
        );

        let shared_conn: Rc<RefCell<Option<lunet_core::HandleId>>> =
            Rc::new(RefCell::new(None));
        let sc = shared_conn.clone();
        let mut step = 0;
        spawn(
            h,
            Box::new(move |inputs: Vec<Value>| {
                step += 1;
                match step {
                    1 => yielded(OpRequest::Connect {
                        host: "127.0.0.1".into(),
                        port: 18082,
                    }),
                    2 => {
                        *sc.borrow_mut() = Some(handle_of(&inputs));
                        // First read arms the side and parks.
                        yielded(OpRequest::Read {
                            stream: sc.borrow().unwrap(),
                        })
                    }
                    _ => done(),
                }
            }),
            vec![],
        );

        // Third fiber: try reading the same stream while it is armed.
        let got = got.clone();
        let sc = shared_conn.clone();
        let h2 = h.clone();
        let mut step = 0;
        spawn(
            h,
            Box::new(move |inputs: Vec<Value>| {
                step += 1;
                match step {
                    1 => yielded(OpRequest::Sleep { ms: 50 }),
                    2 => yielded(OpRequest::Read {
                        stream: sc.borrow().expect("client stored"),
                    }),
                    3 => {
                        *got.borrow_mut() = inputs[1].as_str().unwrap_or("").to_string();
                        // Unblock everyone: closing resolves armed reads.
                        let _ = h2.try_dispatch(OpRequest::Close {
                            handle: sc.borrow().unwrap(),
                        });
                        yielded(OpRequest::Sleep { ms: 10 })
                    }
                    _ => done(),
                }
            }),
            vec![],
        );
    });

    assert_eq!(*err.borrow(), "ANOTHER_IN_PROGRESS");
}

/// Closing a handle with an armed op resolves the waiting fiber with
/// CANCELLED.
#[test]
fn close_cancels_armed_accept() {
    let mut rt = Runtime::new(RuntimeConfig::default()).unwrap();
    let err = Rc::new(RefCell::new(String::new()));

    let handle = rt.handle();
    let got = err.clone();
    rt.run(move |h| {
        let shared: Rc<RefCell<Option<lunet_core::HandleId>>> = Rc::new(RefCell::new(None));
        let s1 = shared.clone();
        let mut step = 0;
        let got = got.clone();
        spawn(
            h,
            Box::new(move |inputs: Vec<Value>| {
                step += 1;
                match step {
                    1 => yielded(OpRequest::Listen {
                        proto: Proto::Tcp,
                        addr: "127.0.0.1".into(),
                        port: 18083,
                    }),
                    2 => {
                        *s1.borrow_mut() = Some(handle_of(&inputs));
                        yielded(OpRequest::Accept {
                            listener: s1.borrow().unwrap(),
                        })
                    }
                    3 => {
                        assert!(inputs[0].is_nil());
                        *got.borrow_mut() = inputs[1].as_str().unwrap_or("").to_string();
                        done()
                    }
                    _ => done(),
                }
            }),
            vec![],
        );

        let s2 = shared.clone();
        let mut step = 0;
        spawn(
            h,
            Box::new(move |_inputs: Vec<Value>| {
                step += 1;
                match step {
                    1 => yielded(OpRequest::Sleep { ms: 30 }),
                    2 => yielded(OpRequest::Close {
                        handle: s2.borrow().expect("listener stored"),
                    }),
                    _ => done(),
                }
            }),
            vec![],
        );
    });

    assert_eq!(*err.borrow(), "CANCELLED");
    assert!(handle.diagnostics().anchors_balanced());
}

/// Binding to a non-loopback address is refused unless the restriction is
/// explicitly lifted.
#[test]
fn nonloopback_bind_is_refused() {
    let mut rt = Runtime::new(RuntimeConfig::default()).unwrap();
    let err = Rc::new(RefCell::new(String::new()));

    let got = err.clone();
    rt.run(move |h| {
        let mut step = 0;
        let got = got.clone();
        spawn(
            h,
            Box::new(move |inputs: Vec<Value>| {
                step += 1;
                match step {
                    1 => yielded(OpRequest::Listen {
                        proto: Proto::Tcp,
                        addr: "0.0.0.0".into(),
                        port: 18084,
                    }),
                    2 => {
                        assert!(inputs[0].is_nil());
                        *got.borrow_mut() = inputs[1].as_str().unwrap_or("").to_string();
                        done()
                    }
                    _ => done(),
                }
            }),
            vec![],
        );
    });

    assert!(
        err.borrow().starts_with("NONLOOPBACK_FORBIDDEN"),
        "got: {}",
        err.borrow()
    );
}

/// Suspending primitives are fiber-only; from the root state they fail
/// with NOT_IN_FIBER instead of crashing.
#[test]
fn not_in_fiber_outside_fiber_context() {
    let rt = Runtime::new(RuntimeConfig::default()).unwrap();
    let h = rt.handle();
    let err = h.try_dispatch(OpRequest::Sleep { ms: 1 }).unwrap_err();
    assert_eq!(err.to_string(), "NOT_IN_FIBER");
    let err = h
        .try_dispatch(OpRequest::Connect {
            host: "127.0.0.1".into(),
            port: 1,
        })
        .unwrap_err();
    assert_eq!(err.to_string(), "NOT_IN_FIBER");
}

/// getpeername formats "host:port" for tcp peers.
#[test]
fn getpeername_reports_peer() {
    let mut rt = Runtime::new(RuntimeConfig::default()).unwrap();
    let peer = Rc::new(RefCell::new(String::new()));

    let got = peer.clone();
    rt.run(move |h| {
        let mut step = 0;
        let mut listener = None;
        let mut client = None;
        let got = got.clone();
        spawn(
            h,
            Box::new(move |inputs: Vec<Value>| {
                step += 1;
                match step {
                    1 => yielded(OpRequest::Listen {
                        proto: Proto::Tcp,
                        addr: "127.0.0.1".into(),
                        port: 18085,
                    }),
                    2 => {
                        listener = Some(handle_of(&inputs));
                        yielded(OpRequest::Accept {
                            listener: listener.unwrap(),
                        })
                    }
                    3 => {
                        client = Some(handle_of(&inputs));
                        yielded(OpRequest::GetPeerName {
                            stream: client.unwrap(),
                        })
                    }
                    4 => {
                        *got.borrow_mut() = inputs[0].as_str().unwrap_or("").to_string();
                        yielded(OpRequest::Close {
                            handle: client.unwrap(),
                        })
                    }
                    5 => yielded(OpRequest::Close {
                        handle: listener.unwrap(),
                    }),
                    _ => done(),
                }
            }),
            vec![],
        );

        let mut step = 0;
        let mut conn = None;
        spawn(
            h,
            Box::new(move |inputs: Vec<Value>| {
                step += 1;
                match step {
                    1 => yielded(OpRequest::Connect {
                        host: "127.0.0.1".into(),
                        port: 18085,
                    }),
                    2 => {
                        conn = Some(handle_of(&inputs));
                        yielded(OpRequest::Sleep { ms: 50 })
                    }
                    3 => yielded(OpRequest::Close {
                        handle: conn.unwrap(),
                    }),
                    _ => done(),
                }
            }),
            vec![],
        );
    });

    assert!(
        peer.borrow().starts_with("127.0.0.1:"),
        "got: {}",
        peer.borrow()
    );
}
