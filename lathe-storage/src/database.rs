//! High-level database API
//!
//! One [`ConfigDatabase`] serves one working directory. Writes are wrapped
//! in a single transaction per recorded invocation; concurrent Executors
//! serialize through SQLite's own transaction mechanism, never through
//! application-level locks.

use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use tracing::{debug, instrument};

use crate::error::{DbError, DbResult};
use crate::record::AnalysisConfig;
use crate::schema::{
    bind_json, column_exists, column_to_json, ensure_shared_table, ensure_task_table, quote,
    row_id_no_duplicate, sql_type, table_exists,
};
use crate::DB_FILE_NAME;

/// Embedded relational store recording configuration and outcome of every
/// invocation run in a working directory.
pub struct ConfigDatabase {
    pool: SqlitePool,
}

impl ConfigDatabase {
    /// Open (creating if missing) the database of a working directory.
    pub async fn open(work_dir: &Path) -> DbResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(work_dir.join(DB_FILE_NAME))
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Record one invocation: lookup-or-insert the header row, lookup-or-
    /// insert the execution-descriptor row, and insert the invocation row
    /// referencing both. All three steps commit atomically.
    #[instrument(skip_all, fields(task = %config.task_name))]
    pub async fn record_analysis(&self, config: &AnalysisConfig) -> DbResult<()> {
        let header_entries: Vec<(String, JsonValue)> = vec![
            ("title".into(), config.header.title.clone().into()),
            ("experiment".into(), config.header.experiment.clone().into()),
            ("run".into(), config.header.run.clone().into()),
            ("date".into(), config.header.date.clone().into()),
            ("version".into(), config.header.version.clone().into()),
            ("task_timeout_s".into(), config.header.task_timeout_s.into()),
        ];
        let descriptor_entries: Vec<(String, JsonValue)> = vec![
            ("env".into(), config.descriptor.env.clone().into()),
            ("poll_interval_s".into(), config.descriptor.poll_interval_s.into()),
            ("communicators".into(), config.descriptor.communicators.clone().into()),
        ];

        let param_columns: Vec<(String, &'static str)> = config
            .parameters
            .iter()
            .map(|(name, value)| (name.clone(), sql_type(value)))
            .collect();

        let mut tx = self.pool.begin().await?;

        ensure_shared_table(
            &mut *tx,
            "gen_cfg",
            &header_entries
                .iter()
                .map(|(name, value)| (name.clone(), sql_type(value)))
                .collect::<Vec<_>>(),
        )
        .await?;
        ensure_shared_table(
            &mut *tx,
            "exec_cfg",
            &descriptor_entries
                .iter()
                .map(|(name, value)| (name.clone(), sql_type(value)))
                .collect::<Vec<_>>(),
        )
        .await?;
        ensure_task_table(&mut *tx, &config.task_name, &param_columns).await?;

        let gen_id = row_id_no_duplicate(&mut *tx, "gen_cfg", &header_entries).await?;
        let exec_id = row_id_no_duplicate(&mut *tx, "exec_cfg", &descriptor_entries).await?;

        let mut entries: Vec<(String, JsonValue)> = vec![
            ("gen_cfg_id".into(), gen_id.into()),
            ("exec_cfg_id".into(), exec_id.into()),
        ];
        entries.extend(config.parameters.iter().cloned());
        entries.push(("task_status".into(), config.result.status.to_string().into()));
        entries.push(("summary".into(), config.result.summary.clone().into()));
        let payload = if config.result.payload.is_null() {
            JsonValue::Null
        } else {
            JsonValue::String(serde_json::to_string(&config.result.payload)?)
        };
        entries.push(("payload".into(), payload));
        entries.push(("impl_schemas".into(), config.result.schemas.join(";").into()));
        entries.push(("valid_flag".into(), (config.result.valid_flag() as i64).into()));

        let mut names = Vec::new();
        for (name, _) in &entries {
            names.push(quote(name)?);
        }
        let placeholders = vec!["?"; entries.len()].join(", ");
        let insert = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote(&config.task_name)?,
            names.join(", "),
            placeholders
        );
        let mut query = sqlx::query(&insert);
        for (_, value) in &entries {
            query = bind_json(query, value);
        }
        query.execute(&mut *tx).await?;

        tx.commit().await?;
        debug!(gen_id, exec_id, "invocation recorded");
        Ok(())
    }

    /// Latest value of `param` recorded for `task_name`, most recently
    /// inserted row first, optionally restricted to valid rows. Absence of
    /// the table, the column, a matching row, or a value is `None`, never
    /// an error.
    pub async fn read_latest(
        &self,
        task_name: &str,
        param: &str,
        valid_only: bool,
    ) -> DbResult<Option<JsonValue>> {
        let mut conn = self.pool.acquire().await?;
        if !table_exists(&mut *conn, task_name).await?
            || !column_exists(&mut *conn, task_name, param).await?
        {
            return Ok(None);
        }
        let mut sql = format!(
            "SELECT {} AS value FROM {}",
            quote(param)?,
            quote(task_name)?
        );
        if valid_only {
            sql.push_str(" WHERE valid_flag = 1");
        }
        sql.push_str(" ORDER BY id DESC LIMIT 1");

        let row = sqlx::query(&sql).fetch_optional(&mut *conn).await?;
        Ok(row.and_then(|row| match column_to_json(&row, "value") {
            JsonValue::Null => None,
            value => Some(value),
        }))
    }

    /// Set the validity flag of one invocation row, in either direction.
    /// Validity is an operator-settable override and is independent of the
    /// recorded status.
    pub async fn set_valid(&self, task_name: &str, entry_id: i64, valid: bool) -> DbResult<()> {
        let mut conn = self.pool.acquire().await?;
        if !table_exists(&mut *conn, task_name).await? {
            return Err(DbError::NoSuchEntry {
                table: task_name.to_string(),
                id: entry_id,
            });
        }
        let sql = format!(
            "UPDATE {} SET valid_flag = ? WHERE id = ?",
            quote(task_name)?
        );
        let result = sqlx::query(&sql)
            .bind(valid as i64)
            .bind(entry_id)
            .execute(&mut *conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NoSuchEntry {
                table: task_name.to_string(),
                id: entry_id,
            });
        }
        Ok(())
    }

    /// Mark one invocation row invalid. Idempotent.
    pub async fn invalidate(&self, task_name: &str, entry_id: i64) -> DbResult<()> {
        self.set_valid(task_name, entry_id, false).await
    }

    /// Id of the most recently inserted row for a task, if any.
    pub async fn latest_entry_id(&self, task_name: &str) -> DbResult<Option<i64>> {
        let mut conn = self.pool.acquire().await?;
        if !table_exists(&mut *conn, task_name).await? {
            return Ok(None);
        }
        let sql = format!("SELECT id FROM {} ORDER BY id DESC LIMIT 1", quote(task_name)?);
        let row = sqlx::query(&sql).fetch_optional(&mut *conn).await?;
        row.map(|row| row.try_get::<i64, _>("id").map_err(DbError::from))
            .transpose()
    }

    /// Number of rows in a table; zero when the table does not exist.
    /// Test and inspection helper.
    pub async fn count_rows(&self, table: &str) -> DbResult<i64> {
        let mut conn = self.pool.acquire().await?;
        if !table_exists(&mut *conn, table).await? {
            return Ok(0);
        }
        let sql = format!("SELECT COUNT(*) AS n FROM {}", quote(table)?);
        let row = sqlx::query(&sql).fetch_one(&mut *conn).await?;
        Ok(row.try_get::<i64, _>("n")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ExecDescriptor, RecordedResult};
    use lathe_config::AnalysisHeader;
    use lathe_ipc::TaskStatus;
    use serde_json::json;

    fn descriptor() -> ExecDescriptor {
        ExecDescriptor {
            env: "LATHE_SOCKET=/tmp/l.sock".to_string(),
            poll_interval_s: 0.05,
            communicators: "PipeCommunicator;SocketCommunicator".to_string(),
        }
    }

    fn config(
        task: &str,
        header: AnalysisHeader,
        parameters: Vec<(String, JsonValue)>,
        status: TaskStatus,
    ) -> AnalysisConfig {
        AnalysisConfig {
            task_name: task.to_string(),
            header,
            descriptor: descriptor(),
            parameters,
            result: RecordedResult {
                status,
                summary: format!("{} finished", task),
                payload: json!(null),
                schemas: vec![],
                valid_override: None,
            },
        }
    }

    #[tokio::test]
    async fn test_identical_headers_share_one_row() {
        let dir = tempfile::tempdir().unwrap();
        let db = ConfigDatabase::open(dir.path()).await.unwrap();
        let header = AnalysisHeader::default();

        db.record_analysis(&config(
            "TaskA",
            header.clone(),
            vec![("n".into(), json!(1))],
            TaskStatus::Completed,
        ))
        .await
        .unwrap();
        db.record_analysis(&config(
            "TaskA",
            header.clone(),
            vec![("n".into(), json!(2))],
            TaskStatus::Completed,
        ))
        .await
        .unwrap();
        assert_eq!(db.count_rows("gen_cfg").await.unwrap(), 1);

        // Any differing header field produces a second row
        let mut other = header;
        other.run = "13".to_string();
        db.record_analysis(&config(
            "TaskA",
            other,
            vec![("n".into(), json!(3))],
            TaskStatus::Completed,
        ))
        .await
        .unwrap();
        assert_eq!(db.count_rows("gen_cfg").await.unwrap(), 2);
        assert_eq!(db.count_rows("TaskA").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_read_latest_and_invalidate() {
        let dir = tempfile::tempdir().unwrap();
        let db = ConfigDatabase::open(dir.path()).await.unwrap();

        assert_eq!(db.read_latest("TaskX", "outfile", true).await.unwrap(), None);

        let header = AnalysisHeader::default();
        db.record_analysis(&config(
            "TaskX",
            header.clone(),
            vec![("outfile".into(), json!("first.h5"))],
            TaskStatus::Completed,
        ))
        .await
        .unwrap();
        db.record_analysis(&config(
            "TaskX",
            header.clone(),
            vec![("outfile".into(), json!("second.h5"))],
            TaskStatus::Completed,
        ))
        .await
        .unwrap();

        assert_eq!(
            db.read_latest("TaskX", "outfile", true).await.unwrap(),
            Some(json!("second.h5"))
        );

        // Invalidation removes the row from valid-only reads
        let latest = db.latest_entry_id("TaskX").await.unwrap().unwrap();
        db.invalidate("TaskX", latest).await.unwrap();
        db.invalidate("TaskX", latest).await.unwrap(); // idempotent
        assert_eq!(
            db.read_latest("TaskX", "outfile", true).await.unwrap(),
            Some(json!("first.h5"))
        );
        // Unfiltered reads still see it
        assert_eq!(
            db.read_latest("TaskX", "outfile", false).await.unwrap(),
            Some(json!("second.h5"))
        );
    }

    #[tokio::test]
    async fn test_failed_rows_excluded_from_valid_reads() {
        let dir = tempfile::tempdir().unwrap();
        let db = ConfigDatabase::open(dir.path()).await.unwrap();
        let header = AnalysisHeader::default();

        db.record_analysis(&config(
            "TaskY",
            header.clone(),
            vec![("outfile".into(), json!("broken.h5"))],
            TaskStatus::Failed,
        ))
        .await
        .unwrap();

        assert_eq!(db.read_latest("TaskY", "outfile", true).await.unwrap(), None);
        assert_eq!(
            db.read_latest("TaskY", "outfile", false).await.unwrap(),
            Some(json!("broken.h5"))
        );

        // A timed-out run can later be marked usable
        let id = db.latest_entry_id("TaskY").await.unwrap().unwrap();
        db.set_valid("TaskY", id, true).await.unwrap();
        assert_eq!(
            db.read_latest("TaskY", "outfile", true).await.unwrap(),
            Some(json!("broken.h5"))
        );
    }

    #[tokio::test]
    async fn test_schema_grows_additively() {
        let dir = tempfile::tempdir().unwrap();
        let db = ConfigDatabase::open(dir.path()).await.unwrap();
        let header = AnalysisHeader::default();

        db.record_analysis(&config(
            "Evolving",
            header.clone(),
            vec![("a".into(), json!(1))],
            TaskStatus::Completed,
        ))
        .await
        .unwrap();
        // Second invocation grew a new parameter and a nested one
        db.record_analysis(&config(
            "Evolving",
            header.clone(),
            vec![
                ("a".into(), json!(2)),
                ("b".into(), json!(0.5)),
                ("opts.cell".into(), json!("lyso.cell")),
            ],
            TaskStatus::Completed,
        ))
        .await
        .unwrap();

        assert_eq!(db.count_rows("Evolving").await.unwrap(), 2);
        assert_eq!(
            db.read_latest("Evolving", "b", true).await.unwrap(),
            Some(json!(0.5))
        );
        assert_eq!(
            db.read_latest("Evolving", "opts.cell", true).await.unwrap(),
            Some(json!("lyso.cell"))
        );
        // Old rows gained NULL for the new column; read_latest of the old
        // field still works
        assert_eq!(
            db.read_latest("Evolving", "a", true).await.unwrap(),
            Some(json!(2))
        );
    }

    #[tokio::test]
    async fn test_set_valid_missing_row_errors() {
        let dir = tempfile::tempdir().unwrap();
        let db = ConfigDatabase::open(dir.path()).await.unwrap();
        let err = db.set_valid("NoSuchTask", 1, false).await.unwrap_err();
        assert!(matches!(err, DbError::NoSuchEntry { .. }));
    }
}
