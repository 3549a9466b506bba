//! Script-visible DB operations, each a [`NativeOp`] the fiber yields on.

use async_trait::async_trait;
use std::rc::Rc;
use std::sync::Arc;

use lunet_core::{HandleId, NativeOp, OpRequest, RuntimeHandle, Table, Value};

use crate::conn::{DbConn, DbHandle};
use crate::driver::{marshal_params, DbError, Driver, ExecOutcome, SqlRow, SqlValue};

// ─── Op constructors (the module surface) ─────────────────────

pub fn open(driver: Arc<dyn Driver>, params: Value) -> OpRequest {
    OpRequest::Native(Box::new(OpenOp { driver, params }))
}

pub fn close(conn: HandleId) -> OpRequest {
    OpRequest::Native(Box::new(CloseOp { conn }))
}

pub fn query(conn: HandleId, sql: impl Into<String>) -> OpRequest {
    stmt(conn, sql, Vec::new(), StmtKind::Query)
}

pub fn query_params(conn: HandleId, sql: impl Into<String>, params: Vec<Value>) -> OpRequest {
    stmt(conn, sql, params, StmtKind::Query)
}

pub fn exec(conn: HandleId, sql: impl Into<String>) -> OpRequest {
    stmt(conn, sql, Vec::new(), StmtKind::Exec)
}

pub fn exec_params(conn: HandleId, sql: impl Into<String>, params: Vec<Value>) -> OpRequest {
    stmt(conn, sql, params, StmtKind::Exec)
}

pub fn escape(conn: HandleId, s: impl Into<String>) -> OpRequest {
    OpRequest::Native(Box::new(EscapeOp {
        conn,
        input: s.into(),
    }))
}

fn stmt(conn: HandleId, sql: impl Into<String>, params: Vec<Value>, kind: StmtKind) -> OpRequest {
    OpRequest::Native(Box::new(StmtOp {
        conn,
        sql: sql.into(),
        params,
        kind,
    }))
}

// ─── Shared plumbing ──────────────────────────────────────────

fn err_result(msg: impl Into<String>) -> Vec<Value> {
    vec![Value::Nil, Value::Str(msg.into())]
}

fn lookup(rt: &RuntimeHandle, conn: HandleId) -> Result<Arc<DbConn>, DbError> {
    rt.get_native_handle::<DbHandle>(conn)
        .map(|h| h.conn.clone())
        .map_err(|e| DbError::Driver(e.to_string()))
}

/// Staged results coming back from the pool thread.
enum Staged {
    Rows(Vec<SqlRow>),
    Exec(ExecOutcome),
}

/// Loop-thread materialization: rows become an array of column-name →
/// typed-value tables.
fn materialize(staged: Staged) -> Value {
    match staged {
        Staged::Rows(rows) => {
            let mut out = Table::new();
            for row in rows {
                let mut r = Table::new();
                for (name, v) in row.cols {
                    let v = match v {
                        SqlValue::Null => Value::Nil,
                        SqlValue::Int(n) => Value::Int(n),
                        SqlValue::Real(n) => Value::Num(n),
                        SqlValue::Text(s) => Value::Str(s),
                        SqlValue::Blob(b) => Value::Bytes(b.into()),
                    };
                    r.set(name, v);
                }
                out.push(Value::Table(r));
            }
            Value::Table(out)
        }
        Staged::Exec(o) => {
            let mut t = Table::new();
            t.set("affected", Value::Int(o.affected as i64));
            t.set("last_insert_id", Value::Int(o.last_insert_id));
            Value::Table(t)
        }
    }
}

// ─── Open ─────────────────────────────────────────────────────

struct OpenOp {
    driver: Arc<dyn Driver>,
    params: Value,
}

#[async_trait(?Send)]
impl NativeOp for OpenOp {
    fn name(&self) -> &'static str {
        "db_open"
    }

    async fn run(self: Box<Self>, rt: RuntimeHandle) -> Vec<Value> {
        let OpenOp { driver, params } = *self;
        let name = driver.name();
        let joined =
            tokio::task::spawn_blocking(move || driver.connect(&params)).await;
        match joined {
            Ok(Ok(native)) => {
                let handle = Rc::new(DbHandle {
                    conn: DbConn::new(native, name),
                });
                let id = rt.insert_native_handle(handle);
                vec![Value::handle(id)]
            }
            Ok(Err(e)) => err_result(e.to_string()),
            Err(e) => err_result(format!("db worker failed: {e}")),
        }
    }
}

// ─── Statements ───────────────────────────────────────────────

#[derive(Clone, Copy)]
enum StmtKind {
    Query,
    Exec,
}

struct StmtOp {
    conn: HandleId,
    sql: String,
    params: Vec<Value>,
    kind: StmtKind,
}

#[async_trait(?Send)]
impl NativeOp for StmtOp {
    fn name(&self) -> &'static str {
        match self.kind {
            StmtKind::Query => "db_query",
            StmtKind::Exec => "db_exec",
        }
    }

    async fn run(self: Box<Self>, rt: RuntimeHandle) -> Vec<Value> {
        let StmtOp {
            conn,
            sql,
            params,
            kind,
        } = *self;

        let conn = match lookup(&rt, conn) {
            Ok(c) => c,
            Err(e) => return err_result(e.to_string()),
        };
        // Marshal on the loop thread; the pool thread owns the copies.
        let params = match marshal_params(&params) {
            Ok(p) => p,
            Err(e) => return err_result(e.to_string()),
        };

        let joined = tokio::task::spawn_blocking(move || match kind {
            StmtKind::Query => conn
                .with_conn(|c| c.query(&sql, &params))
                .map(Staged::Rows),
            StmtKind::Exec => conn.with_conn(|c| c.exec(&sql, &params)).map(Staged::Exec),
        })
        .await;

        match joined {
            Ok(Ok(staged)) => vec![materialize(staged), Value::Nil],
            Ok(Err(e)) => err_result(e.to_string()),
            Err(e) => {
                tracing::error!("db worker panicked: {e}");
                err_result(format!("db worker failed: {e}"))
            }
        }
    }
}

// ─── Escape ───────────────────────────────────────────────────

struct EscapeOp {
    conn: HandleId,
    input: String,
}

#[async_trait(?Send)]
impl NativeOp for EscapeOp {
    fn name(&self) -> &'static str {
        "db_escape"
    }

    async fn run(self: Box<Self>, rt: RuntimeHandle) -> Vec<Value> {
        let EscapeOp { conn, input } = *self;
        let conn = match lookup(&rt, conn) {
            Ok(c) => c,
            Err(e) => return err_result(e.to_string()),
        };
        let joined =
            tokio::task::spawn_blocking(move || conn.with_conn(|c| Ok(c.escape(&input)))).await;
        match joined {
            Ok(Ok(s)) => vec![Value::Str(s), Value::Nil],
            Ok(Err(e)) => err_result(e.to_string()),
            Err(e) => err_result(format!("db worker failed: {e}")),
        }
    }
}

// ─── Close ────────────────────────────────────────────────────

struct CloseOp {
    conn: HandleId,
}

#[async_trait(?Send)]
impl NativeOp for CloseOp {
    fn name(&self) -> &'static str {
        "db_close"
    }

    async fn run(self: Box<Self>, rt: RuntimeHandle) -> Vec<Value> {
        let conn = match lookup(&rt, self.conn) {
            Ok(c) => c,
            Err(e) => return err_result(e.to_string()),
        };
        // Unregister first so no new op can reach the handle, then tear
        // the native connection down off the loop.
        let _ = rt.remove_native_handle(self.conn);
        let joined = tokio::task::spawn_blocking(move || conn.close()).await;
        if let Err(e) = joined {
            return err_result(format!("db worker failed: {e}"));
        }
        vec![]
    }
}
