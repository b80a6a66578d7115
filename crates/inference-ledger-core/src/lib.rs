//! Domain types for the inference ledger.
//!
//! The ledger records every input scored by a deployed model together with
//! the model's prediction, and later reconciles those records with ground
//! truth labels that arrive asynchronously. This crate holds everything the
//! storage substrates share: the capability trait, the feature schema and
//! label domain, the fake-label synthesis policy, and the resolved backend
//! configuration.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("ingestion error: {0}")]
    Ingestion(String),
    #[error("deployment error: {0}")]
    Deployment(String),
}

/// A single row of model features, keyed by schema column name.
///
/// Backed by `serde_json::Map` so the column order observed at capture time
/// is preserved end to end.
pub type FeatureRow = serde_json::Map<String, Value>;

/// Column names reserved for ledger bookkeeping; a feature schema may not
/// shadow them.
pub const RESERVED_COLUMNS: [&str; 5] = ["date", "prediction", "confidence", "ground_truth", "uuid"];

/// The closed set of class names a ground truth label may take.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LabelDomain {
    classes: Vec<String>,
}

impl LabelDomain {
    /// Builds a label domain from a non-empty list of distinct class names.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when the list is empty,
    /// contains a blank name, or contains duplicates.
    pub fn new(classes: Vec<String>) -> Result<Self, LedgerError> {
        if classes.is_empty() {
            return Err(LedgerError::Configuration(
                "label domain MUST contain at least one class".to_string(),
            ));
        }

        for class in &classes {
            if class.trim().is_empty() {
                return Err(LedgerError::Configuration(
                    "label domain class names MUST NOT be blank".to_string(),
                ));
            }
        }

        let mut seen = std::collections::BTreeSet::new();
        for class in &classes {
            if !seen.insert(class.as_str()) {
                return Err(LedgerError::Configuration(format!(
                    "duplicate class name in label domain: {class}"
                )));
            }
        }

        Ok(Self { classes })
    }

    #[must_use]
    pub fn contains(&self, label: &str) -> bool {
        self.classes.iter().any(|class| class == label)
    }

    #[must_use]
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

/// The explicit feature schema of the deployed model.
///
/// Columns are declared up front rather than inferred from whatever shape
/// arrives at capture time; every saved or ingested row is validated
/// against this schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeatureSchema {
    columns: Vec<String>,
}

impl FeatureSchema {
    /// Builds a schema from a non-empty list of distinct column names.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when the list is empty, a
    /// name is not a valid identifier, a name collides with a reserved
    /// bookkeeping column, or names repeat.
    pub fn new(columns: Vec<String>) -> Result<Self, LedgerError> {
        if columns.is_empty() {
            return Err(LedgerError::Configuration(
                "feature schema MUST contain at least one column".to_string(),
            ));
        }

        let mut seen = std::collections::BTreeSet::new();
        for column in &columns {
            if !is_identifier(column) {
                return Err(LedgerError::Configuration(format!(
                    "invalid feature column name: {column:?}"
                )));
            }
            if RESERVED_COLUMNS.contains(&column.as_str()) {
                return Err(LedgerError::Configuration(format!(
                    "feature column {column} collides with a reserved ledger column"
                )));
            }
            if !seen.insert(column.as_str()) {
                return Err(LedgerError::Configuration(format!(
                    "duplicate feature column: {column}"
                )));
            }
        }

        Ok(Self { columns })
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Validates one feature row against the schema: every schema column
    /// present, no extra keys, scalar values only.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] describing the first mismatch.
    pub fn validate_row(&self, row: &FeatureRow) -> Result<(), LedgerError> {
        for column in &self.columns {
            let Some(value) = row.get(column) else {
                return Err(LedgerError::Validation(format!(
                    "feature row is missing column {column}"
                )));
            };
            if !is_scalar(value) {
                return Err(LedgerError::Validation(format!(
                    "feature column {column} MUST hold a scalar value"
                )));
            }
        }

        for key in row.keys() {
            if !self.columns.iter().any(|column| column == key) {
                return Err(LedgerError::Validation(format!(
                    "feature row has unknown column {key}"
                )));
            }
        }

        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_scalar(value: &Value) -> bool {
    matches!(
        value,
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_)
    )
}

/// A prediction and its confidence, always present together.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredOutput {
    pub prediction: String,
    pub confidence: f64,
}

/// One row captured at serving time by the local record store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InferenceRecord {
    pub record_id: Ulid,
    pub features: FeatureRow,
    pub output: Option<ScoredOutput>,
    pub ground_truth: Option<String>,
    pub captured_at: OffsetDateTime,
    /// Originating request id; populated by the object substrate only.
    pub event_id: Option<String>,
    /// 0-based position within the originating request; object substrate only.
    pub item_index: Option<u32>,
}

/// One row returned by `load`: features plus the public prediction and
/// ground truth columns. Confidence is only populated by the local
/// substrate; the object substrate drops it during reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LabeledRow {
    pub features: FeatureRow,
    pub prediction: Option<String>,
    pub confidence: Option<f64>,
    pub ground_truth: Option<String>,
}

/// Synthesizes demo ground truth labels from stored predictions.
///
/// With probability `accuracy` the label equals the row's prediction;
/// otherwise it is drawn uniformly from the full label domain (the
/// original prediction may recur by chance). The random source is
/// seedable so tests can make synthesis deterministic.
#[derive(Debug)]
pub struct LabelSynthesizer {
    domain: LabelDomain,
    rng: fastrand::Rng,
}

impl LabelSynthesizer {
    #[must_use]
    pub fn new(domain: LabelDomain, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };
        Self { domain, rng }
    }

    /// Draws one synthetic label. A row without a prediction always
    /// receives a uniform draw from the domain; callers that prefer to
    /// skip unscored rows filter them out before calling.
    pub fn synthesize(&mut self, prediction: Option<&str>, accuracy: f64) -> String {
        if let Some(prediction) = prediction {
            if self.rng.f64() < accuracy {
                return prediction.to_string();
            }
        }

        let index = self.rng.usize(..self.domain.len());
        self.domain.classes()[index].clone()
    }

    #[must_use]
    pub fn domain(&self) -> &LabelDomain {
        &self.domain
    }
}

/// Storage substrate selector: a closed, compile-time-known set, never a
/// class path resolved at runtime.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubstrateKind {
    #[default]
    Sqlite,
    Object,
}

impl SubstrateKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Object => "object",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sqlite" => Some(Self::Sqlite),
            "object" => Some(Self::Object),
            _ => None,
        }
    }
}

impl Display for SubstrateKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend configuration, fully resolved before any component consumes it.
///
/// Any string value may embed `${ENV_VAR}` placeholders; a single
/// substitution pass at load time resolves them against the process
/// environment and leaves unresolved placeholders untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    #[serde(default)]
    pub substrate: SubstrateKind,
    /// Serving endpoint URL (local substrate) or deployment name (object
    /// substrate).
    #[serde(default = "default_target")]
    pub target: String,
    #[serde(default = "default_database")]
    pub database: String,
    /// Root directory of the object store; required by the object substrate.
    #[serde(default)]
    pub object_root: Option<String>,
    #[serde(default = "default_data_capture_prefix")]
    pub data_capture_prefix: String,
    #[serde(default = "default_ground_truth_prefix")]
    pub ground_truth_prefix: String,
    /// Base URL of the deployment collaborator's API; required by `deploy`
    /// on the object substrate.
    #[serde(default)]
    pub deployment_api: Option<String>,
    #[serde(default)]
    pub assume_role: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_classes")]
    pub classes: Vec<String>,
    #[serde(default = "default_features")]
    pub features: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Optional seed for the label synthesizer's random source.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_target() -> String {
    "http://127.0.0.1:8080/invocations".to_string()
}

fn default_database() -> String {
    "penguins.db".to_string()
}

fn default_data_capture_prefix() -> String {
    "data-capture".to_string()
}

fn default_ground_truth_prefix() -> String {
    "ground-truth".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_classes() -> Vec<String> {
    vec![
        "Adelie".to_string(),
        "Chinstrap".to_string(),
        "Gentoo".to_string(),
    ]
}

fn default_features() -> Vec<String> {
    vec![
        "island".to_string(),
        "sex".to_string(),
        "culmen_length_mm".to_string(),
        "culmen_depth_mm".to_string(),
        "flipper_length_mm".to_string(),
        "body_mass_g".to_string(),
    ]
}

fn default_timeout_ms() -> u64 {
    5_000
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            substrate: SubstrateKind::default(),
            target: default_target(),
            database: default_database(),
            object_root: None,
            data_capture_prefix: default_data_capture_prefix(),
            ground_truth_prefix: default_ground_truth_prefix(),
            deployment_api: None,
            assume_role: None,
            region: default_region(),
            classes: default_classes(),
            features: default_features(),
            timeout_ms: default_timeout_ms(),
            seed: None,
        }
    }
}

impl BackendConfig {
    /// Parses a JSON configuration document and resolves every `${ENV_VAR}`
    /// placeholder in its string values.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when the document does not
    /// decode.
    pub fn from_json(body: &str) -> Result<Self, LedgerError> {
        let config: Self = serde_json::from_str(body)
            .map_err(|err| LedgerError::Configuration(format!("invalid backend config: {err}")))?;
        Ok(config.resolved())
    }

    /// Runs the environment substitution pass over every string field.
    #[must_use]
    pub fn resolved(mut self) -> Self {
        self.target = expand_env_placeholders(&self.target);
        self.database = expand_env_placeholders(&self.database);
        self.object_root = self.object_root.map(|v| expand_env_placeholders(&v));
        self.data_capture_prefix = expand_env_placeholders(&self.data_capture_prefix);
        self.ground_truth_prefix = expand_env_placeholders(&self.ground_truth_prefix);
        self.deployment_api = self.deployment_api.map(|v| expand_env_placeholders(&v));
        self.assume_role = self.assume_role.map(|v| expand_env_placeholders(&v));
        self.region = expand_env_placeholders(&self.region);
        self
    }

    /// # Errors
    /// Returns [`LedgerError::Configuration`] when the configured classes
    /// do not form a valid label domain.
    pub fn label_domain(&self) -> Result<LabelDomain, LedgerError> {
        LabelDomain::new(self.classes.clone())
    }

    /// # Errors
    /// Returns [`LedgerError::Configuration`] when the configured feature
    /// columns do not form a valid schema.
    pub fn feature_schema(&self) -> Result<FeatureSchema, LedgerError> {
        FeatureSchema::new(self.features.clone())
    }
}

/// Substitutes `${ENV_VAR}` placeholders from the process environment.
/// Placeholders naming an unset variable are left untouched.
#[must_use]
pub fn expand_env_placeholders(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let Some(end) = after.find('}') else {
            out.push_str("${");
            rest = after;
            continue;
        };

        let name = &after[..end];
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');

        if valid {
            match std::env::var(name) {
                Ok(resolved) => out.push_str(&resolved),
                Err(_) => {
                    out.push_str("${");
                    out.push_str(name);
                    out.push('}');
                }
            }
        } else {
            out.push_str("${");
            out.push_str(name);
            out.push('}');
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

/// Capability interface implemented once per storage substrate.
///
/// The five operations are uniform regardless of substrate. `load`,
/// `save`, `label`, and `invoke` fail soft: absent state and transient
/// I/O failures are logged at the operation boundary and converted to an
/// empty result, a zero count, or an absent response so the caller's
/// primary workflow is never interrupted. `deploy` surfaces its errors;
/// retries are always the caller's responsibility.
pub trait Backend {
    /// Returns up to `limit` rows of production data. The local substrate
    /// orders by capture time descending; the object substrate returns
    /// reconciled rows in merge order.
    fn load(&self, limit: usize) -> Vec<LabeledRow>;

    /// Appends one row per input item, stamping each with a fresh record
    /// id and the current time. An empty `outputs` slice stores the rows
    /// unscored. Persistence failures are logged and swallowed.
    fn save(&mut self, inputs: &[FeatureRow], outputs: &[ScoredOutput]);

    /// Synthesizes ground truth for every unlabeled row and returns the
    /// number of rows labeled; 0 when there is nothing to label or the
    /// store does not exist yet.
    fn label(&mut self, accuracy: f64) -> usize;

    /// Sends a prediction request to the hosted model and returns the raw
    /// response, or `None` on any transport failure.
    fn invoke(&self, payload: &Value) -> Option<Value>;

    /// Deploys the supplied model version. Idempotent where applicable; a
    /// documented no-op on substrates that serve the model directly.
    ///
    /// # Errors
    /// Returns [`LedgerError::Deployment`] when the deployment collaborator
    /// rejects the request.
    fn deploy(&self, model_uri: &str, model_version: &str) -> Result<(), LedgerError>;
}

/// Parses an RFC3339 timestamp, requiring the UTC offset.
///
/// # Errors
/// Returns [`LedgerError::Validation`] for malformed or non-UTC input.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, LedgerError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| LedgerError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(LedgerError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// # Errors
/// Returns [`LedgerError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, LedgerError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| LedgerError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
