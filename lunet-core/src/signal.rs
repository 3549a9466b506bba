use std::cell::RefCell;
use std::collections::HashSet;
use tokio::signal::unix::{signal, SignalKind};

use crate::error::CoreError;
use crate::runtime::RuntimeHandle;
use crate::value::Value;

/// Tracks which signal names have a waiting fiber. Each name admits at
/// most one waiter.
pub(crate) struct SignalTable {
    armed: RefCell<HashSet<&'static str>>,
}

impl SignalTable {
    pub fn new() -> SignalTable {
        SignalTable {
            armed: RefCell::new(HashSet::new()),
        }
    }
}

fn parse(name: &str) -> Option<(&'static str, SignalKind)> {
    match name {
        "INT" | "SIGINT" => Some(("INT", SignalKind::interrupt())),
        "TERM" | "SIGTERM" => Some(("TERM", SignalKind::terminate())),
        "HUP" | "SIGHUP" => Some(("HUP", SignalKind::hangup())),
        "QUIT" | "SIGQUIT" => Some(("QUIT", SignalKind::quit())),
        "USR1" | "SIGUSR1" => Some(("USR1", SignalKind::user_defined1())),
        "USR2" | "SIGUSR2" => Some(("USR2", SignalKind::user_defined2())),
        _ => None,
    }
}

/// Park the fiber until the named signal fires once, resuming with the
/// canonical name. A second waiter on the same name fails with
/// `ANOTHER_IN_PROGRESS`; runtime stop cancels the wait.
pub async fn wait(rt: &RuntimeHandle, name: &str) -> Result<Vec<Value>, CoreError> {
    let (canon, kind) =
        parse(name).ok_or_else(|| CoreError::BadParam(format!("unknown signal: {name}")))?;

    if !rt.root.signals.armed.borrow_mut().insert(canon) {
        return Err(CoreError::AnotherInProgress);
    }

    let shutdown = rt.root.shutdown.clone();
    let res = async {
        let mut sig = signal(kind).map_err(|e| CoreError::SignalFailed(e.to_string()))?;
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => Err(CoreError::Cancelled),
            fired = sig.recv() => match fired {
                Some(()) => Ok(vec![Value::Str(canon.to_string())]),
                None => Err(CoreError::Cancelled),
            },
        }
    }
    .await;

    rt.root.signals.armed.borrow_mut().remove(canon);
    res
}
