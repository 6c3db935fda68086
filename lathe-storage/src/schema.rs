//! Dynamic schema management for per-task-type tables
//!
//! Task tables are created on first use and extended additively (new
//! nullable columns) when a task's parameter set grows. Identifiers are
//! validated and quoted; values are always bound.

use serde_json::Value as JsonValue;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use std::collections::HashMap;
use tracing::debug;

use crate::error::{DbError, DbResult};

/// Columns appended to every task table after the parameter columns
pub const RESULT_COLUMNS: &[(&str, &str)] = &[
    ("task_status", "TEXT"),
    ("summary", "TEXT"),
    ("payload", "TEXT"),
    ("impl_schemas", "TEXT"),
];

/// Identifiers come from task and parameter names; dots appear in
/// flattened sub-parameter keys.
pub fn validate_identifier(name: &str) -> DbResult<()> {
    let mut chars = name.chars();
    let valid_first = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if valid_first && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.') {
        Ok(())
    } else {
        Err(DbError::InvalidIdentifier(name.to_string()))
    }
}

/// Double-quote a validated identifier for embedding in SQL.
pub fn quote(name: &str) -> DbResult<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name))
}

/// SQLite column type for a JSON value. Compound values are stored as
/// JSON text.
pub fn sql_type(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Bool(_) => "INTEGER",
        JsonValue::Number(n) if n.is_i64() || n.is_u64() => "INTEGER",
        JsonValue::Number(_) => "REAL",
        JsonValue::String(_) => "TEXT",
        _ => "TEXT",
    }
}

/// Bind a JSON value onto a dynamic query.
pub fn bind_json<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    value: &JsonValue,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    match value {
        JsonValue::Null => query.bind(None::<String>),
        JsonValue::Bool(b) => query.bind(*b as i64),
        JsonValue::Number(n) if n.is_i64() => query.bind(n.as_i64().unwrap_or_default()),
        JsonValue::Number(n) if n.is_u64() => query.bind(n.as_u64().unwrap_or_default() as i64),
        JsonValue::Number(n) => query.bind(n.as_f64().unwrap_or_default()),
        JsonValue::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

/// Read one column of a row back into a JSON value, trying the storage
/// classes in declaration-type order. SQL NULL maps to JSON null.
pub fn column_to_json(row: &SqliteRow, column: &str) -> JsonValue {
    if let Ok(v) = row.try_get::<Option<i64>, _>(column) {
        return v.map(JsonValue::from).unwrap_or(JsonValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(column) {
        return v.map(JsonValue::from).unwrap_or(JsonValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(column) {
        return v.map(JsonValue::from).unwrap_or(JsonValue::Null);
    }
    JsonValue::Null
}

pub async fn table_exists(conn: &mut SqliteConnection, table: &str) -> DbResult<bool> {
    let row = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
        .bind(table)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.is_some())
}

/// Current columns of a table, name to declared type.
pub async fn table_columns(
    conn: &mut SqliteConnection,
    table: &str,
) -> DbResult<HashMap<String, String>> {
    let sql = format!("PRAGMA table_info({})", quote(table)?);
    let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
    let mut columns = HashMap::new();
    for row in rows {
        let name: String = row.try_get("name")?;
        let ty: String = row.try_get("type")?;
        columns.insert(name, ty);
    }
    Ok(columns)
}

pub async fn column_exists(
    conn: &mut SqliteConnection,
    table: &str,
    column: &str,
) -> DbResult<bool> {
    Ok(table_columns(conn, table).await?.contains_key(column))
}

/// Create a shared (header / descriptor) table.
pub async fn ensure_shared_table(
    conn: &mut SqliteConnection,
    table: &str,
    columns: &[(String, &'static str)],
) -> DbResult<()> {
    let mut cols = String::new();
    for (name, ty) in columns {
        cols.push_str(&format!(", {} {}", quote(name)?, ty));
    }
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {}(id INTEGER PRIMARY KEY AUTOINCREMENT{})",
        quote(table)?,
        cols
    );
    sqlx::query(&sql).execute(&mut *conn).await?;
    Ok(())
}

/// Create the task-type table, or extend it with any parameter columns it
/// does not have yet. Existing rows are never rewritten; new columns are
/// nullable by construction.
pub async fn ensure_task_table(
    conn: &mut SqliteConnection,
    task_name: &str,
    param_columns: &[(String, &'static str)],
) -> DbResult<()> {
    if table_exists(conn, task_name).await? {
        let existing = table_columns(conn, task_name).await?;
        for (name, ty) in param_columns {
            if !existing.contains_key(name) {
                let sql = format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    quote(task_name)?,
                    quote(name)?,
                    ty
                );
                debug!(task = task_name, column = %name, "extending task table");
                sqlx::query(&sql).execute(&mut *conn).await?;
            }
        }
        return Ok(());
    }

    let mut cols = String::new();
    for (name, ty) in param_columns {
        cols.push_str(&format!("{} {}, ", quote(name)?, ty));
    }
    for (name, ty) in RESULT_COLUMNS {
        cols.push_str(&format!("{} {}, ", quote(name)?, ty));
    }
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {}(\
         id INTEGER PRIMARY KEY AUTOINCREMENT, \
         timestamp DATETIME DEFAULT CURRENT_TIMESTAMP, \
         gen_cfg_id INTEGER, exec_cfg_id INTEGER, {}valid_flag INTEGER)",
        quote(task_name)?,
        cols
    );
    sqlx::query(&sql).execute(&mut *conn).await?;
    Ok(())
}

/// Return the id of a row matching all entries, inserting it first if no
/// match exists. Shared header/descriptor rows stay deduplicated this way.
pub async fn row_id_no_duplicate(
    conn: &mut SqliteConnection,
    table: &str,
    entries: &[(String, JsonValue)],
) -> DbResult<i64> {
    let table_q = quote(table)?;
    let mut conditions = Vec::new();
    for (name, _) in entries {
        conditions.push(format!("{} IS ?", quote(name)?));
    }
    let select = format!(
        "SELECT id FROM {} WHERE {} ORDER BY id DESC LIMIT 1",
        table_q,
        conditions.join(" AND ")
    );
    let mut query = sqlx::query(&select);
    for (_, value) in entries {
        query = bind_json(query, value);
    }
    if let Some(row) = query.fetch_optional(&mut *conn).await? {
        return Ok(row.try_get::<i64, _>("id")?);
    }

    let mut names = Vec::new();
    for (name, _) in entries {
        names.push(quote(name)?);
    }
    let placeholders = vec!["?"; entries.len()].join(", ");
    let insert = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table_q,
        names.join(", "),
        placeholders
    );
    let mut query = sqlx::query(&insert);
    for (_, value) in entries {
        query = bind_json(query, value);
    }
    let result = query.execute(&mut *conn).await?;
    Ok(result.last_insert_rowid())
}
