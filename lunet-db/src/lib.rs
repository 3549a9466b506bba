//! Database offload for the lunet runtime.
//!
//! DB drivers are blocking native code; running them on the loop thread
//! would stall every fiber. Each script-visible DB call builds a
//! [`lunet_core::NativeOp`] that marshals its inputs up front, runs the
//! driver on the blocking pool under the connection's mutex, stages the
//! results in owned memory, and materializes script tables back on the
//! loop thread before resuming the fiber. Pool threads never touch
//! script state.
//!
//! The core knows no specific database: drivers supply connect / exec /
//! query / escape behind [`Driver`] and [`DriverConn`], and the crate
//! guarantees mutex serialization plus the closed-flag discipline.

mod conn;
mod driver;
mod ops;
mod sqlite;

pub use conn::{DbConn, DbHandle};
pub use driver::{DbError, Driver, DriverConn, ExecOutcome, SqlParam, SqlRow, SqlValue};
pub use ops::{close, escape, exec, exec_params, open, query, query_params};
pub use sqlite::SqliteDriver;
