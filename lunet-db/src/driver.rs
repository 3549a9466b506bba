use lunet_core::Value;
use thiserror::Error;

// ─── Errors ───────────────────────────────────────────────────

#[derive(Clone, Debug, Error, PartialEq)]
pub enum DbError {
    /// The connection was closed before or while the work item ran.
    #[error("connection is closed")]
    Closed,
    #[error("BAD_PARAM: {0}")]
    BadParam(String),
    /// Driver-reported failure, passed through verbatim.
    #[error("{0}")]
    Driver(String),
}

// ─── Wire-level values ────────────────────────────────────────

/// A marshalled statement parameter. Deep-copied out of script values on
/// the loop thread so the pool thread owns everything it touches.
#[derive(Clone, Debug, PartialEq)]
pub enum SqlParam {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// A column value staged by the driver for later materialization.
#[derive(Clone, Debug, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// One staged result row: column name → value, in select order.
#[derive(Clone, Debug, Default)]
pub struct SqlRow {
    pub cols: Vec<(String, SqlValue)>,
}

/// Staged outcome of a non-query statement.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExecOutcome {
    pub affected: u64,
    pub last_insert_id: i64,
}

// ─── Driver contract ──────────────────────────────────────────

/// A live native connection. Always called under the owning
/// [`crate::DbConn`] mutex, on a pool thread.
pub trait DriverConn: Send {
    fn exec(&mut self, sql: &str, params: &[SqlParam]) -> Result<ExecOutcome, DbError>;
    fn query(&mut self, sql: &str, params: &[SqlParam]) -> Result<Vec<SqlRow>, DbError>;
    fn escape(&self, s: &str) -> String;
}

/// A database driver: everything the runtime needs to open connections.
pub trait Driver: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn connect(&self, params: &Value) -> Result<Box<dyn DriverConn>, DbError>;
}

// ─── Parameter marshalling ────────────────────────────────────

/// Deep-copy script values into pool-ownable parameters. Booleans map to
/// 0/1; tables do not convert and fail the op.
pub(crate) fn marshal_params(values: &[Value]) -> Result<Vec<SqlParam>, DbError> {
    values
        .iter()
        .map(|v| match v {
            Value::Nil => Ok(SqlParam::Null),
            Value::Bool(b) => Ok(SqlParam::Int(i64::from(*b))),
            Value::Int(n) => Ok(SqlParam::Int(*n)),
            Value::Num(n) => Ok(SqlParam::Real(*n)),
            Value::Str(s) => Ok(SqlParam::Text(s.clone())),
            Value::Bytes(b) => Ok(SqlParam::Blob(b.to_vec())),
            other => match other.coerce_str() {
                Some(s) => Ok(SqlParam::Text(s)),
                None => Err(DbError::BadParam(format!(
                    "cannot bind {} parameter",
                    other.type_name()
                ))),
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lunet_core::Table;

    #[test]
    fn scalars_marshal_booleans_as_integers() {
        let params = marshal_params(&[
            Value::Nil,
            Value::Bool(true),
            Value::Int(-3),
            Value::Num(1.5),
            Value::Str("O'Brien".into()),
        ])
        .unwrap();
        assert_eq!(
            params,
            vec![
                SqlParam::Null,
                SqlParam::Int(1),
                SqlParam::Int(-3),
                SqlParam::Real(1.5),
                SqlParam::Text("O'Brien".into()),
            ]
        );
    }

    #[test]
    fn tables_do_not_bind() {
        let err = marshal_params(&[Value::Table(Table::new())]).unwrap_err();
        assert!(err.to_string().starts_with("BAD_PARAM"));
    }
}
