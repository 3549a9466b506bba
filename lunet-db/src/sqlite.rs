use lunet_core::Value;
use rusqlite::types::Value as SqliteValue;

use crate::driver::{
    DbError, Driver, DriverConn, ExecOutcome, SqlParam, SqlRow, SqlValue,
};

/// SQLite driver (bundled). Connection params: nil for in-memory, a path
/// string, or a table with a `path` entry.
pub struct SqliteDriver;

struct SqliteConn {
    conn: rusqlite::Connection,
}

fn db_err(e: rusqlite::Error) -> DbError {
    DbError::Driver(e.to_string())
}

fn to_sqlite(p: &SqlParam) -> SqliteValue {
    match p {
        SqlParam::Null => SqliteValue::Null,
        SqlParam::Int(n) => SqliteValue::Integer(*n),
        SqlParam::Real(n) => SqliteValue::Real(*n),
        SqlParam::Text(s) => SqliteValue::Text(s.clone()),
        SqlParam::Blob(b) => SqliteValue::Blob(b.clone()),
    }
}

fn from_sqlite(v: SqliteValue) -> SqlValue {
    match v {
        SqliteValue::Null => SqlValue::Null,
        SqliteValue::Integer(n) => SqlValue::Int(n),
        SqliteValue::Real(n) => SqlValue::Real(n),
        SqliteValue::Text(s) => SqlValue::Text(s),
        SqliteValue::Blob(b) => SqlValue::Blob(b),
    }
}

impl Driver for SqliteDriver {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn connect(&self, params: &Value) -> Result<Box<dyn DriverConn>, DbError> {
        let path = match params {
            Value::Nil => ":memory:".to_string(),
            Value::Str(s) => s.clone(),
            Value::Table(t) => t
                .get("path")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| DbError::BadParam("missing path".into()))?,
            other => {
                return Err(DbError::BadParam(format!(
                    "cannot open from {}",
                    other.type_name()
                )))
            }
        };
        let conn = rusqlite::Connection::open(&path).map_err(db_err)?;
        Ok(Box::new(SqliteConn { conn }))
    }
}

impl DriverConn for SqliteConn {
    fn exec(&mut self, sql: &str, params: &[SqlParam]) -> Result<ExecOutcome, DbError> {
        let affected = self
            .conn
            .execute(sql, rusqlite::params_from_iter(params.iter().map(to_sqlite)))
            .map_err(db_err)?;
        Ok(ExecOutcome {
            affected: affected as u64,
            last_insert_id: self.conn.last_insert_rowid(),
        })
    }

    fn query(&mut self, sql: &str, params: &[SqlParam]) -> Result<Vec<SqlRow>, DbError> {
        let mut stmt = self.conn.prepare(sql).map_err(db_err)?;
        let names: Vec<String> = stmt.column_names().iter().map(|n| n.to_string()).collect();
        let mut rows = stmt
            .query(rusqlite::params_from_iter(params.iter().map(to_sqlite)))
            .map_err(db_err)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(db_err)? {
            let mut cols = Vec::with_capacity(names.len());
            for (i, name) in names.iter().enumerate() {
                let v: SqliteValue = row.get(i).map_err(db_err)?;
                cols.push((name.clone(), from_sqlite(v)));
            }
            out.push(SqlRow { cols });
        }
        Ok(out)
    }

    fn escape(&self, s: &str) -> String {
        s.replace('\'', "''")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_and_query_through_the_contract() {
        let mut conn = SqliteDriver.connect(&Value::Nil).unwrap();
        conn.exec("CREATE TABLE t(id INT, name TEXT)", &[]).unwrap();
        let out = conn
            .exec(
                "INSERT INTO t VALUES(?, ?)",
                &[SqlParam::Int(1), SqlParam::Text("O'Brien".into())],
            )
            .unwrap();
        assert_eq!(out.affected, 1);
        assert_eq!(out.last_insert_id, 1);

        let rows = conn
            .query("SELECT name FROM t WHERE id = ?", &[SqlParam::Int(1)])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0].cols[0],
            ("name".to_string(), SqlValue::Text("O'Brien".into()))
        );
    }

    #[test]
    fn escape_doubles_quotes() {
        let conn = SqliteDriver.connect(&Value::Nil).unwrap();
        assert_eq!(conn.escape("O'Brien"), "O''Brien");
    }

    #[test]
    fn syntax_errors_surface_as_driver_errors() {
        let mut conn = SqliteDriver.connect(&Value::Nil).unwrap();
        let err = conn.exec("NOT SQL", &[]).unwrap_err();
        assert!(matches!(err, DbError::Driver(_)));
    }
}
