//! Timer ordering, signal waiter contract, and the synchronous
//! filesystem surface.

use bytes::Bytes;
use std::cell::RefCell;
use std::rc::Rc;

use lunet_core::{
    spawn, FiberFault, FsMode, OpRequest, Runtime, RuntimeConfig, Step, Value,
};

fn yielded(req: OpRequest) -> Result<Step, FiberFault> {
    Ok(Step::Yield(req))
}

fn done() -> Result<Step, FiberFault> {
    Ok(Step::Done(vec![]))
}

/// Two sleeping fibers wake in deadline order.
#[test]
fn sleep_wakes_in_deadline_order() {
    let mut rt = Runtime::new(RuntimeConfig::default()).unwrap();
    let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

    let out = order.clone();
    rt.run(move |h| {
        for (tag, ms) in [("slow", 80u64), ("fast", 20u64)] {
            let out = out.clone();
            let mut step = 0;
            spawn(
                h,
                Box::new(move |_inputs: Vec<Value>| {
                    step += 1;
                    match step {
                        1 => yielded(OpRequest::Sleep { ms }),
                        _ => {
                            out.borrow_mut().push(tag);
                            done()
                        }
                    }
                }),
                vec![],
            );
        }
    });

    assert_eq!(order.borrow().as_slice(), &["fast", "slow"]);
}

/// A SIGUSR2 raised while one fiber waits resumes it with the canonical
/// name; a second waiter on the same name is refused.
#[test]
fn signal_wait_fires_and_is_single_waiter() {
    let mut rt = Runtime::new(RuntimeConfig::default()).unwrap();
    let fired = Rc::new(RefCell::new(String::new()));
    let second = Rc::new(RefCell::new(String::new()));

    let out1 = fired.clone();
    let out2 = second.clone();
    rt.run(move |h| {
        let mut step = 0;
        let out1 = out1.clone();
        spawn(
            h,
            Box::new(move |inputs: Vec<Value>| {
                step += 1;
                match step {
                    1 => yielded(OpRequest::SignalWait {
                        name: "USR2".into(),
                    }),
                    _ => {
                        *out1.borrow_mut() = inputs[0].as_str().unwrap_or("").to_string();
                        done()
                    }
                }
            }),
            vec![],
        );

        // Second waiter on the same signal: contract violation.
        let mut step = 0;
        let out2 = out2.clone();
        spawn(
            h,
            Box::new(move |inputs: Vec<Value>| {
                step += 1;
                match step {
                    1 => yielded(OpRequest::Sleep { ms: 20 }),
                    2 => yielded(OpRequest::SignalWait {
                        name: "USR2".into(),
                    }),
                    _ => {
                        *out2.borrow_mut() = inputs[1].as_str().unwrap_or("").to_string();
                        done()
                    }
                }
            }),
            vec![],
        );

        // Raise the signal once both waiters have had their chance to arm.
        let mut step = 0;
        spawn(
            h,
            Box::new(move |_inputs: Vec<Value>| {
                step += 1;
                match step {
                    1 => yielded(OpRequest::Sleep { ms: 60 }),
                    2 => {
                        unsafe {
                            libc::kill(libc::getpid(), libc::SIGUSR2);
                        }
                        yielded(OpRequest::Sleep { ms: 10 })
                    }
                    _ => done(),
                }
            }),
            vec![],
        );
    });

    assert_eq!(*fired.borrow(), "USR2");
    assert_eq!(*second.borrow(), "ANOTHER_IN_PROGRESS");
}

/// Unknown signal names are a parameter error, not a crash.
#[test]
fn signal_wait_rejects_unknown_name() {
    let mut rt = Runtime::new(RuntimeConfig::default()).unwrap();
    let err = Rc::new(RefCell::new(String::new()));

    let out = err.clone();
    rt.run(move |h| {
        let mut step = 0;
        let out = out.clone();
        spawn(
            h,
            Box::new(move |inputs: Vec<Value>| {
                step += 1;
                match step {
                    1 => yielded(OpRequest::SignalWait {
                        name: "NOPE".into(),
                    }),
                    _ => {
                        *out.borrow_mut() = inputs[1].as_str().unwrap_or("").to_string();
                        done()
                    }
                }
            }),
            vec![],
        );
    });

    assert!(err.borrow().starts_with("BAD_PARAM"), "got: {}", err.borrow());
}

/// Write N bytes, read until EOF: the concatenation equals the input.
#[test]
fn fs_write_then_read_until_eof() {
    let path = "/tmp/lunet-test-fs.txt";
    let _ = std::fs::remove_file(path);

    let mut rt = Runtime::new(RuntimeConfig::default()).unwrap();
    let collected: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let stat_size = Rc::new(RefCell::new(0i64));

    let out = collected.clone();
    let size = stat_size.clone();
    rt.run(move |h| {
        let mut step = 0;
        let mut file = None;
        let out = out.clone();
        let size = size.clone();
        spawn(
            h,
            Box::new(move |inputs: Vec<Value>| {
                step += 1;
                match step {
                    1 => yielded(OpRequest::FsOpen {
                        path: path.into(),
                        mode: FsMode::Write,
                    }),
                    2 => {
                        file = inputs[0].as_handle();
                        yielded(OpRequest::FsWrite {
                            file: file.unwrap(),
                            data: Bytes::from_static(b"lunet file payload"),
                        })
                    }
                    3 => yielded(OpRequest::Close {
                        handle: file.unwrap(),
                    }),
                    4 => yielded(OpRequest::FsOpen {
                        path: path.into(),
                        mode: FsMode::Read,
                    }),
                    5 => {
                        file = inputs[0].as_handle();
                        // Tiny reads force several chunks before EOF.
                        yielded(OpRequest::FsRead {
                            file: file.unwrap(),
                            max: 5,
                        })
                    }
                    n if n >= 6 => {
                        if inputs.is_empty() {
                            // A close completed; nothing left to do.
                            return done();
                        }
                        if inputs[0].is_nil() {
                            // EOF.
                            if *size.borrow() == 0 {
                                return yielded(OpRequest::FsStat { path: path.into() });
                            }
                            return yielded(OpRequest::Close {
                                handle: file.unwrap(),
                            });
                        }
                        if let Some(b) = inputs[0].as_bytes() {
                            out.borrow_mut().extend_from_slice(b);
                            return yielded(OpRequest::FsRead {
                                file: file.unwrap(),
                                max: 5,
                            });
                        }
                        if let Some(t) = inputs[0].as_table() {
                            *size.borrow_mut() = t.get("size").and_then(|v| v.as_int()).unwrap();
                            return yielded(OpRequest::Close {
                                handle: file.unwrap(),
                            });
                        }
                        done()
                    }
                    _ => done(),
                }
            }),
            vec![],
        );
    });

    assert_eq!(collected.borrow().as_slice(), b"lunet file payload");
    assert_eq!(*stat_size.borrow(), 18);
    let _ = std::fs::remove_file(path);
}

/// scandir lists entries with kinds; unlink removes a file.
#[test]
fn fs_scandir_and_unlink() {
    let dir = "/tmp/lunet-test-dir";
    let _ = std::fs::remove_dir_all(dir);
    std::fs::create_dir(dir).unwrap();
    std::fs::write(format!("{dir}/a.txt"), b"x").unwrap();
    std::fs::create_dir(format!("{dir}/sub")).unwrap();

    let mut rt = Runtime::new(RuntimeConfig::default()).unwrap();
    let names: Rc<RefCell<Vec<(String, String)>>> = Rc::new(RefCell::new(Vec::new()));

    let out = names.clone();
    rt.run(move |h| {
        let mut step = 0;
        let out = out.clone();
        spawn(
            h,
            Box::new(move |inputs: Vec<Value>| {
                step += 1;
                match step {
                    1 => yielded(OpRequest::FsScandir { path: dir.into() }),
                    2 => {
                        let listing = inputs[0].as_table().unwrap();
                        for row in &listing.arr {
                            let row = row.as_table().unwrap();
                            out.borrow_mut().push((
                                row.get("name").unwrap().as_str().unwrap().to_string(),
                                row.get("kind").unwrap().as_str().unwrap().to_string(),
                            ));
                        }
                        yielded(OpRequest::Unlink {
                            path: format!("{dir}/a.txt"),
                        })
                    }
                    _ => done(),
                }
            }),
            vec![],
        );
    });

    let mut names = names.borrow().clone();
    names.sort();
    assert_eq!(
        names,
        vec![
            ("a.txt".to_string(), "file".to_string()),
            ("sub".to_string(), "dir".to_string())
        ]
    );
    assert!(!std::path::Path::new(&format!("{dir}/a.txt")).exists());
    let _ = std::fs::remove_dir_all(dir);
}
