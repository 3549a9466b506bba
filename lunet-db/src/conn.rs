use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::driver::{DbError, DriverConn};

/// A shared DB connection: native handle behind a mutex plus the closed
/// flag workers observe.
///
/// Close tears the native connection down under the mutex but never the
/// mutex itself: any in-flight worker still holds an `Arc` clone, so the
/// mutex outlives every possible lock attempt and is destroyed only when
/// the last clone drops.
pub struct DbConn {
    driver_name: &'static str,
    native: Mutex<Option<Box<dyn DriverConn>>>,
    closed: AtomicBool,
}

impl DbConn {
    pub(crate) fn new(native: Box<dyn DriverConn>, driver_name: &'static str) -> Arc<DbConn> {
        Arc::new(DbConn {
            driver_name,
            native: Mutex::new(Some(native)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn driver_name(&self) -> &'static str {
        self.driver_name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Pool-thread body: lock, check the closed flag, run the driver.
    /// No script state is reachable from here.
    pub(crate) fn with_conn<R>(
        &self,
        f: impl FnOnce(&mut dyn DriverConn) -> Result<R, DbError>,
    ) -> Result<R, DbError> {
        let mut guard = self.native.lock().unwrap_or_else(|p| p.into_inner());
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::Closed);
        }
        match guard.as_mut() {
            Some(conn) => f(conn.as_mut()),
            None => Err(DbError::Closed),
        }
    }

    /// Tear down the native connection. Safe against in-flight work: a
    /// worker either ran before us (its result is valid) or observes the
    /// closed flag after taking the mutex.
    pub(crate) fn close(&self) {
        let mut guard = self.native.lock().unwrap_or_else(|p| p.into_inner());
        self.closed.store(true, Ordering::Release);
        *guard = None;
    }
}

/// The registry-held script handle for a connection.
pub struct DbHandle {
    pub conn: Arc<DbConn>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{ExecOutcome, SqlParam, SqlRow};

    struct NopConn;

    impl DriverConn for NopConn {
        fn exec(&mut self, _sql: &str, _params: &[SqlParam]) -> Result<ExecOutcome, DbError> {
            Ok(ExecOutcome::default())
        }
        fn query(&mut self, _sql: &str, _params: &[SqlParam]) -> Result<Vec<SqlRow>, DbError> {
            Ok(vec![])
        }
        fn escape(&self, s: &str) -> String {
            s.to_string()
        }
    }

    #[test]
    fn close_is_observed_by_later_work() {
        let conn = DbConn::new(Box::new(NopConn), "nop");
        assert!(conn.with_conn(|c| c.exec("x", &[])).is_ok());
        conn.close();
        assert!(conn.is_closed());
        assert!(matches!(
            conn.with_conn(|c| c.exec("x", &[])),
            Err(DbError::Closed)
        ));
    }

    #[test]
    fn close_twice_is_idempotent() {
        let conn = DbConn::new(Box::new(NopConn), "nop");
        conn.close();
        conn.close();
        assert!(conn.is_closed());
    }
}
