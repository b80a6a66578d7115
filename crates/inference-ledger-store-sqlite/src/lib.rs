//! Local storage substrate: a transactional SQLite record store.
//!
//! Production data lands in a single `data` table holding one row per
//! scored input item: the model's feature columns plus `date`,
//! `prediction`, `confidence`, `ground_truth`, and `uuid`. The table is
//! created implicitly on first save. A model using this substrate is
//! served directly over HTTP, so `deploy` is a documented no-op.

#![allow(clippy::missing_errors_doc)]

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use inference_ledger_core::{
    format_rfc3339, now_utc, Backend, BackendConfig, FeatureRow, FeatureSchema, InferenceRecord,
    LabelSynthesizer, LabeledRow, LedgerError, ScoredOutput,
};
use inference_ledger_endpoint::EndpointClient;
use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::{error, info};
use ulid::Ulid;

pub struct SqliteRecordStore {
    database: PathBuf,
    schema: FeatureSchema,
    synthesizer: LabelSynthesizer,
    endpoint: EndpointClient,
}

impl SqliteRecordStore {
    /// Builds the store from a resolved backend configuration.
    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        let schema = config.feature_schema()?;
        let domain = config.label_domain()?;

        info!(database = %config.database, "backend database");

        Ok(Self {
            database: PathBuf::from(&config.database),
            schema,
            synthesizer: LabelSynthesizer::new(domain, config.seed),
            endpoint: EndpointClient::from_config(config),
        })
    }

    #[must_use]
    pub fn database(&self) -> &Path {
        &self.database
    }

    fn open_connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.database).with_context(|| {
            format!("failed to open sqlite database at {}", self.database.display())
        })?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(conn)
    }

    fn ensure_table(&self, conn: &Connection) -> Result<()> {
        let feature_columns = self
            .schema
            .columns()
            .iter()
            .map(|column| format!("\"{column}\","))
            .collect::<String>();

        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS data (
                {feature_columns}
                date TEXT NOT NULL,
                prediction TEXT,
                confidence REAL,
                ground_truth TEXT,
                uuid TEXT PRIMARY KEY
             );"
        ))
        .context("failed to create data table")?;

        Ok(())
    }

    fn insert_sql(&self) -> String {
        let mut columns = self
            .schema
            .columns()
            .iter()
            .map(|column| format!("\"{column}\""))
            .collect::<Vec<_>>();
        columns.extend(
            ["date", "prediction", "confidence", "ground_truth", "uuid"]
                .iter()
                .map(ToString::to_string),
        );

        let placeholders = (1..=columns.len())
            .map(|index| format!("?{index}"))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "INSERT INTO data ({}) VALUES ({placeholders})",
            columns.join(", ")
        )
    }

    fn select_sql(&self) -> String {
        let feature_columns = self
            .schema
            .columns()
            .iter()
            .map(|column| format!("\"{column}\", "))
            .collect::<String>();

        format!(
            "SELECT {feature_columns}prediction, confidence, ground_truth \
             FROM data ORDER BY date DESC LIMIT ?1"
        )
    }

    /// Appends one row per input item and returns how many were stored.
    pub fn try_save(&self, inputs: &[FeatureRow], outputs: &[ScoredOutput]) -> Result<usize> {
        if !outputs.is_empty() && outputs.len() != inputs.len() {
            return Err(anyhow!(
                "model output length {} does not match input length {}",
                outputs.len(),
                inputs.len()
            ));
        }

        let captured_at = now_utc();
        let mut records = Vec::with_capacity(inputs.len());
        for (index, features) in inputs.iter().enumerate() {
            self.schema
                .validate_row(features)
                .with_context(|| format!("invalid feature row at position {index}"))?;

            records.push(InferenceRecord {
                record_id: Ulid::new(),
                features: features.clone(),
                output: if outputs.is_empty() {
                    None
                } else {
                    outputs.get(index).cloned()
                },
                ground_truth: None,
                captured_at,
                event_id: None,
                item_index: None,
            });
        }

        let mut conn = self.open_connection()?;
        self.ensure_table(&conn)?;

        let date = format_rfc3339(captured_at)?;
        let sql = self.insert_sql();
        let tx = conn.transaction().context("failed to start save transaction")?;

        for record in &records {
            let mut values = Vec::with_capacity(self.schema.columns().len() + 5);
            for column in self.schema.columns() {
                values.push(json_to_sql(record.features.get(column).unwrap_or(&Value::Null)));
            }
            values.push(rusqlite::types::Value::Text(date.clone()));
            match &record.output {
                Some(output) => {
                    values.push(rusqlite::types::Value::Text(output.prediction.clone()));
                    values.push(rusqlite::types::Value::Real(output.confidence));
                }
                None => {
                    values.push(rusqlite::types::Value::Null);
                    values.push(rusqlite::types::Value::Null);
                }
            }
            values.push(rusqlite::types::Value::Null);
            values.push(rusqlite::types::Value::Text(record.record_id.to_string()));

            tx.execute(&sql, rusqlite::params_from_iter(values))
                .context("failed to append production data row")?;
        }

        tx.commit().context("failed to commit save transaction")?;
        Ok(records.len())
    }

    /// Returns up to `limit` rows, most recently captured first. An absent
    /// database is the "nothing captured yet" state, not an error.
    pub fn try_load(&self, limit: usize) -> Result<Vec<LabeledRow>> {
        if !self.database.exists() {
            info!(database = %self.database.display(), "database does not exist yet");
            return Ok(Vec::new());
        }

        let conn = self.open_connection()?;
        let column_count = self.schema.columns().len();
        let mut stmt = conn.prepare(&self.select_sql())?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], |row| {
            let mut features = FeatureRow::new();
            for (index, column) in self.schema.columns().iter().enumerate() {
                features.insert(column.clone(), column_to_json(row.get_ref(index)?));
            }

            Ok(LabeledRow {
                features,
                prediction: row.get(column_count)?,
                confidence: row.get(column_count + 1)?,
                ground_truth: row.get(column_count + 2)?,
            })
        })?;

        collect_rows(rows)
    }

    /// Labels every unlabeled scored row inside one transaction; rows
    /// captured without a model output stay unlabeled.
    pub fn try_label(&mut self, accuracy: f64) -> Result<usize> {
        if !self.database.exists() {
            info!(database = %self.database.display(), "database does not exist yet");
            return Ok(0);
        }

        let mut conn = self.open_connection()?;
        let tx = conn.transaction().context("failed to start label transaction")?;

        let unlabeled = {
            let mut stmt =
                tx.prepare("SELECT uuid, prediction FROM data WHERE ground_truth IS NULL")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })?;
            collect_rows(rows)?
        };

        info!(count = unlabeled.len(), "loaded unlabeled samples");

        let mut labeled = 0_usize;
        for (uuid, prediction) in &unlabeled {
            let Some(prediction) = prediction else {
                continue;
            };

            let label = self.synthesizer.synthesize(Some(prediction), accuracy);
            tx.execute(
                "UPDATE data SET ground_truth = ?1 WHERE uuid = ?2",
                params![label, uuid],
            )
            .context("failed to update ground truth")?;
            labeled += 1;
        }

        tx.commit().context("failed to commit label transaction")?;
        Ok(labeled)
    }
}

impl Backend for SqliteRecordStore {
    fn load(&self, limit: usize) -> Vec<LabeledRow> {
        match self.try_load(limit) {
            Ok(rows) => rows,
            Err(err) => {
                error!(error = %format!("{err:#}"), "failed to load production data");
                Vec::new()
            }
        }
    }

    fn save(&mut self, inputs: &[FeatureRow], outputs: &[ScoredOutput]) {
        info!("storing production data in the database");
        if let Err(err) = self.try_save(inputs, outputs) {
            // Persistence must never block the caller's primary duty.
            error!(error = %format!("{err:#}"), "failed to save production data");
        }
    }

    fn label(&mut self, accuracy: f64) -> usize {
        match self.try_label(accuracy) {
            Ok(count) => count,
            Err(err) => {
                error!(error = %format!("{err:#}"), "failed to label production data");
                0
            }
        }
    }

    fn invoke(&self, payload: &Value) -> Option<Value> {
        match self.endpoint.invoke(payload) {
            Ok(response) => Some(response),
            Err(err) => {
                error!(error = %format!("{err:#}"), "failed to send traffic to the endpoint");
                None
            }
        }
    }

    fn deploy(&self, _model_uri: &str, _model_version: &str) -> Result<(), LedgerError> {
        // Nothing to deploy when the model is served directly.
        info!("deploy is not applicable for the sqlite substrate");
        Ok(())
    }
}

fn json_to_sql(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::Null => rusqlite::types::Value::Null,
        Value::Bool(flag) => rusqlite::types::Value::Integer(i64::from(*flag)),
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                rusqlite::types::Value::Integer(int)
            } else {
                rusqlite::types::Value::Real(number.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(text) => rusqlite::types::Value::Text(text.clone()),
        // Schema validation rejects non-scalar features before writes.
        other => rusqlite::types::Value::Text(other.to_string()),
    }
}

fn column_to_json(value: rusqlite::types::ValueRef<'_>) -> Value {
    match value {
        rusqlite::types::ValueRef::Null => Value::Null,
        rusqlite::types::ValueRef::Integer(int) => Value::from(int),
        rusqlite::types::ValueRef::Real(real) => {
            serde_json::Number::from_f64(real).map_or(Value::Null, Value::Number)
        }
        rusqlite::types::ValueRef::Text(text) => {
            Value::String(String::from_utf8_lossy(text).into_owned())
        }
        rusqlite::types::ValueRef::Blob(_) => Value::Null,
    }
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
