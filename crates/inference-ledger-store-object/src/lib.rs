//! Object-storage substrate: file-per-batch capture and ground truth.
//!
//! The hosted endpoint deposits capture objects (JSON lines, one line per
//! request) under one prefix, and an external labeling process deposits
//! ground truth batches under another. Neither stream carries a shared row
//! identifier, so this crate reconciles them positionally: rows are keyed
//! by `(event_id, item_index)` where the index is a 0-based running
//! counter within each event, and labels are attached through a left
//! outer join over that synthesized key.

#![allow(clippy::missing_errors_doc)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use inference_ledger_core::{
    now_utc, parse_rfc3339_utc, Backend, BackendConfig, FeatureRow, FeatureSchema, LabelDomain,
    LabelSynthesizer, LabeledRow, LedgerError, ScoredOutput,
};
use inference_ledger_endpoint::{DeploymentClient, DeploymentSpec, EndpointClient};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{error, info, warn};

const DEFAULT_PAGE_SIZE: usize = 1_000;

/// One page of a listing plus the token that continues it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectPage {
    pub keys: Vec<String>,
    pub next_token: Option<String>,
}

/// Minimal object-storage surface the ledger needs. Listings are
/// paginated the way bucket APIs paginate them; consumers must follow
/// continuation tokens until exhaustion.
pub trait ObjectStore {
    fn list_page(&self, prefix: &str, token: Option<&str>) -> Result<ObjectPage>;
    fn get(&self, key: &str) -> Result<String>;
    fn put(&self, key: &str, body: &str) -> Result<()>;
}

/// Follows continuation tokens until every key under the prefix has been
/// seen. No object may be silently skipped.
pub fn list_all(store: &dyn ObjectStore, prefix: &str) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    let mut token: Option<String> = None;

    loop {
        let page = store.list_page(prefix, token.as_deref())?;
        keys.extend(page.keys);
        match page.next_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }

    Ok(keys)
}

/// Filesystem-rooted object store. Keys are slash-separated paths
/// relative to the root; listings return them sorted, a page at a time.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
    page_size: usize,
}

impl FsObjectStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn collect_keys(&self, prefix: &str) -> Result<Vec<String>> {
        // A missing root is the "nothing deposited yet" state.
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        collect_files(&self.root, &self.root, &mut keys)?;
        keys.retain(|key| key.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}

fn collect_files(root: &Path, dir: &Path, keys: &mut Vec<String>) -> Result<()> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to list directory {}", dir.display()))?;

    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, keys)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            let key = relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            keys.push(key);
        }
    }

    Ok(())
}

impl ObjectStore for FsObjectStore {
    fn list_page(&self, prefix: &str, token: Option<&str>) -> Result<ObjectPage> {
        let keys = self.collect_keys(prefix)?;
        let start = match token {
            Some(token) => keys.partition_point(|key| key.as_str() <= token),
            None => 0,
        };

        let page: Vec<String> = keys
            .iter()
            .skip(start)
            .take(self.page_size)
            .cloned()
            .collect();
        let next_token = if start + page.len() < keys.len() {
            page.last().cloned()
        } else {
            None
        };

        Ok(ObjectPage {
            keys: page,
            next_token,
        })
    }

    fn get(&self, key: &str) -> Result<String> {
        let path = self.root.join(key);
        std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read object {}", path.display()))
    }

    fn put(&self, key: &str, body: &str) -> Result<()> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create prefix {}", parent.display()))?;
        }
        std::fs::write(&path, body)
            .with_context(|| format!("failed to write object {}", path.display()))
    }
}

// Wire shapes of the two object streams. The capture envelope is
// vendor-controlled; the ground truth record is written both by the
// external labeling process and by `label` below.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CaptureEnvelope {
    capture_data: CaptureData,
    event_metadata: CaptureEventMetadata,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CaptureData {
    endpoint_input: CapturePayload,
    endpoint_output: CapturePayload,
}

#[derive(Debug, Deserialize)]
struct CapturePayload {
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CaptureEventMetadata {
    event_id: String,
    inference_time: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundTruthRecord {
    pub ground_truth_data: GroundTruthData,
    pub event_metadata: GroundTruthMetadata,
    pub event_version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GroundTruthData {
    pub data: Vec<String>,
    pub encoding: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundTruthMetadata {
    pub event_id: String,
}

/// One captured input item, reconstructed from a capture envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedRow {
    pub event_id: String,
    pub captured_at: OffsetDateTime,
    pub features: FeatureRow,
    pub output: Option<ScoredOutput>,
    /// Position within the event; synthesized during reconciliation.
    pub item_index: u32,
    pub ground_truth: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OutputPayload {
    predictions: Vec<ScoredOutput>,
}

/// Auto-detects which of the three interchangeable input shapes a capture
/// record uses and flattens it into one feature row per item.
fn flatten_input(input: &Value) -> Result<Vec<FeatureRow>, LedgerError> {
    if let Some(instances) = input.get("instances") {
        return rows_from_objects(instances, "instances");
    }
    if let Some(inputs) = input.get("inputs") {
        return rows_from_objects(inputs, "inputs");
    }
    if let Some(split) = input.get("dataframe_split") {
        return rows_from_split(split);
    }

    Err(LedgerError::Ingestion(
        "capture input has none of the known shapes (instances, inputs, dataframe_split)"
            .to_string(),
    ))
}

fn rows_from_objects(items: &Value, shape: &str) -> Result<Vec<FeatureRow>, LedgerError> {
    let Some(items) = items.as_array() else {
        return Err(LedgerError::Ingestion(format!("{shape} MUST be an array")));
    };

    let mut rows = Vec::with_capacity(items.len());
    for item in items {
        let Some(object) = item.as_object() else {
            return Err(LedgerError::Ingestion(format!(
                "{shape} entries MUST be objects"
            )));
        };
        rows.push(object.clone());
    }

    Ok(rows)
}

fn rows_from_split(split: &Value) -> Result<Vec<FeatureRow>, LedgerError> {
    let columns = split
        .get("columns")
        .and_then(Value::as_array)
        .ok_or_else(|| LedgerError::Ingestion("dataframe_split is missing columns".to_string()))?;
    let data = split
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| LedgerError::Ingestion("dataframe_split is missing data".to_string()))?;

    let names: Vec<String> = columns
        .iter()
        .map(|column| {
            column
                .as_str()
                .map(ToString::to_string)
                .ok_or_else(|| LedgerError::Ingestion("column names MUST be strings".to_string()))
        })
        .collect::<Result<_, _>>()?;

    let mut rows = Vec::with_capacity(data.len());
    for entry in data {
        let Some(cells) = entry.as_array() else {
            return Err(LedgerError::Ingestion(
                "dataframe_split data rows MUST be arrays".to_string(),
            ));
        };
        if cells.len() != names.len() {
            return Err(LedgerError::Ingestion(format!(
                "dataframe_split row has {} cells for {} columns",
                cells.len(),
                names.len()
            )));
        }

        let mut row = FeatureRow::new();
        for (name, cell) in names.iter().zip(cells) {
            row.insert(name.clone(), cell.clone());
        }
        rows.push(row);
    }

    Ok(rows)
}

fn parse_capture_line(line: &str, schema: &FeatureSchema) -> Result<Vec<CapturedRow>, LedgerError> {
    let envelope: CaptureEnvelope = serde_json::from_str(line)
        .map_err(|err| LedgerError::Ingestion(format!("invalid capture envelope: {err}")))?;

    let input: Value = serde_json::from_str(&envelope.capture_data.endpoint_input.data)
        .map_err(|err| LedgerError::Ingestion(format!("invalid endpoint input payload: {err}")))?;
    let output: OutputPayload = serde_json::from_str(&envelope.capture_data.endpoint_output.data)
        .map_err(|err| LedgerError::Ingestion(format!("invalid endpoint output payload: {err}")))?;

    let features = flatten_input(&input)?;
    if output.predictions.len() != features.len() {
        return Err(LedgerError::Ingestion(format!(
            "{} predictions for {} input rows",
            output.predictions.len(),
            features.len()
        )));
    }

    let captured_at = parse_rfc3339_utc(&envelope.event_metadata.inference_time)?;

    let mut rows = Vec::with_capacity(features.len());
    for (row, prediction) in features.into_iter().zip(output.predictions) {
        schema.validate_row(&row)?;
        rows.push(CapturedRow {
            event_id: envelope.event_metadata.event_id.clone(),
            captured_at,
            features: row,
            output: Some(prediction),
            item_index: 0,
            ground_truth: None,
        });
    }

    Ok(rows)
}

/// The object-storage backend: ingestion, reconciliation, and batch
/// labeling over a capture prefix and a ground truth prefix.
pub struct ObjectLedger {
    store: Box<dyn ObjectStore>,
    data_capture_prefix: String,
    ground_truth_prefix: String,
    schema: FeatureSchema,
    domain: LabelDomain,
    synthesizer: LabelSynthesizer,
    endpoint: EndpointClient,
    deployment: Option<DeploymentClient>,
    target: String,
    region: String,
    assume_role: Option<String>,
    data_capture_uri: Option<String>,
}

impl ObjectLedger {
    /// Builds the ledger from a resolved backend configuration, rooting a
    /// filesystem object store at `object_root`.
    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        let Some(object_root) = &config.object_root else {
            return Err(anyhow!(
                "the object substrate requires object_root to be configured"
            ));
        };

        Self::with_store(Box::new(FsObjectStore::new(object_root)), config)
    }

    /// Builds the ledger over an explicit object store implementation.
    pub fn with_store(store: Box<dyn ObjectStore>, config: &BackendConfig) -> Result<Self> {
        let schema = config.feature_schema()?;
        let domain = config.label_domain()?;
        let timeout = std::time::Duration::from_millis(config.timeout_ms);

        let invoke_target = if config.target.starts_with("http://")
            || config.target.starts_with("https://")
        {
            config.target.clone()
        } else if let Some(api) = &config.deployment_api {
            format!(
                "{}/deployments/{}/invocations",
                api.trim_end_matches('/'),
                config.target
            )
        } else {
            config.target.clone()
        };

        let data_capture_uri = config
            .object_root
            .as_ref()
            .map(|root| format!("{}/{}", root.trim_end_matches('/'), config.data_capture_prefix));

        info!(endpoint = %config.target, "object ledger target");
        info!(capture = %config.data_capture_prefix, ground_truth = %config.ground_truth_prefix, "object ledger prefixes");

        Ok(Self {
            store,
            data_capture_prefix: config.data_capture_prefix.clone(),
            ground_truth_prefix: config.ground_truth_prefix.trim_end_matches('/').to_string(),
            schema,
            domain: domain.clone(),
            synthesizer: LabelSynthesizer::new(domain, config.seed),
            endpoint: EndpointClient::new(invoke_target, timeout),
            deployment: config
                .deployment_api
                .as_ref()
                .map(|api| DeploymentClient::new(api, timeout)),
            target: config.target.clone(),
            region: config.region.clone(),
            assume_role: config.assume_role.clone(),
            data_capture_uri,
        })
    }

    /// Reads every capture object under the capture prefix into rows.
    /// Malformed lines are skipped with a warning; a duplicate delivery of
    /// an already-seen event is rejected whole, first occurrence wins.
    /// Rows come back sorted by capture time descending; the sort is
    /// stable, so within-event arrival order survives.
    fn load_capture_rows(&self) -> Result<Vec<CapturedRow>> {
        let keys = list_all(self.store.as_ref(), &self.data_capture_prefix)?;

        let mut rows = Vec::new();
        let mut seen_events = BTreeSet::new();
        for key in keys {
            let body = self.store.get(&key)?;
            for (line_number, line) in body.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match parse_capture_line(line, &self.schema) {
                    Ok(parsed) => {
                        let Some(first) = parsed.first() else {
                            continue;
                        };
                        if !seen_events.insert(first.event_id.clone()) {
                            warn!(
                                key = %key,
                                line = line_number,
                                event_id = %first.event_id,
                                "rejecting duplicate capture delivery"
                            );
                            continue;
                        }
                        rows.extend(parsed);
                    }
                    Err(err) => {
                        warn!(key = %key, line = line_number, error = %err, "skipping malformed capture record");
                    }
                }
            }
        }

        rows.sort_by(|a, b| b.captured_at.cmp(&a.captured_at));
        Ok(rows)
    }

    /// Reads every ground truth batch under the ground truth prefix into a
    /// per-event label list. A later-read batch for the same event
    /// replaces the earlier one (last-wins merge).
    fn load_ground_truth(&self) -> Result<BTreeMap<String, Vec<String>>> {
        let keys = list_all(self.store.as_ref(), &self.ground_truth_prefix)?;

        let mut labels = BTreeMap::new();
        for key in keys {
            let body = self.store.get(&key)?;
            for (line_number, line) in body.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let record: GroundTruthRecord = match serde_json::from_str(line) {
                    Ok(record) => record,
                    Err(err) => {
                        warn!(key = %key, line = line_number, error = %err, "skipping malformed ground truth record");
                        continue;
                    }
                };

                if let Some(unknown) = record
                    .ground_truth_data
                    .data
                    .iter()
                    .find(|label| !self.domain.contains(label))
                {
                    warn!(
                        key = %key,
                        line = line_number,
                        label = %unknown,
                        "skipping ground truth record with a label outside the domain"
                    );
                    continue;
                }

                labels.insert(
                    record.event_metadata.event_id,
                    record.ground_truth_data.data,
                );
            }
        }

        Ok(labels)
    }

    /// Joins captured rows with ground truth on `(event_id, item_index)`.
    /// Every captured row is preserved; labels without a captured partner
    /// are dropped. No capture objects means an empty table regardless of
    /// any ground truth presence.
    fn reconcile(&self) -> Result<Vec<CapturedRow>> {
        let mut rows = self.load_capture_rows()?;
        if rows.is_empty() {
            return Ok(rows);
        }

        let labels = self.load_ground_truth()?;

        let mut counters: BTreeMap<String, u32> = BTreeMap::new();
        for row in &mut rows {
            let counter = counters.entry(row.event_id.clone()).or_insert(0);
            row.item_index = *counter;
            *counter += 1;

            row.ground_truth = labels
                .get(&row.event_id)
                .and_then(|event_labels| event_labels.get(row.item_index as usize))
                .cloned();
        }

        Ok(rows)
    }

    /// Returns reconciled rows that have ground truth, truncated to
    /// `limit` in merge order, with bookkeeping columns dropped.
    pub fn try_load(&self, limit: usize) -> Result<Vec<LabeledRow>> {
        let mut rows: Vec<LabeledRow> = self
            .reconcile()?
            .into_iter()
            .filter(|row| row.ground_truth.is_some())
            .map(|row| LabeledRow {
                features: row.features,
                prediction: row.output.map(|output| output.prediction),
                confidence: None,
                ground_truth: row.ground_truth,
            })
            .collect();
        rows.truncate(limit);
        Ok(rows)
    }

    /// Synthesizes ground truth for every captured row absent from the
    /// join and deposits one new batch object under the ground truth
    /// prefix. Append-only: existing objects are never mutated.
    pub fn try_label(&mut self, accuracy: f64) -> Result<usize> {
        let rows = self.reconcile()?;

        // Events with at least one unlabeled row, in merge order.
        let mut pending = BTreeSet::new();
        let mut order: Vec<String> = Vec::new();
        for row in &rows {
            if row.ground_truth.is_none() && pending.insert(row.event_id.clone()) {
                order.push(row.event_id.clone());
            }
        }

        info!(events = order.len(), "loaded events with unlabeled samples");
        if order.is_empty() {
            return Ok(0);
        }

        let mut events: BTreeMap<&str, Vec<&CapturedRow>> = BTreeMap::new();
        for row in &rows {
            events.entry(row.event_id.as_str()).or_default().push(row);
        }

        // One line per event, one label per event item. A later batch
        // replaces the whole label list for its event, so the deposited
        // list must cover every position: existing labels are carried at
        // their indices and synthesis only fills the gaps. Rows without a
        // stored prediction get a uniform domain draw.
        let mut synthesized = 0_usize;
        let mut lines = Vec::with_capacity(order.len());
        for event_id in order {
            let Some(items) = events.get_mut(event_id.as_str()) else {
                continue;
            };
            items.sort_by_key(|row| row.item_index);

            let mut data = Vec::with_capacity(items.len());
            for row in items.iter() {
                match &row.ground_truth {
                    Some(label) => data.push(label.clone()),
                    None => {
                        data.push(self.synthesizer.synthesize(
                            row.output.as_ref().map(|output| output.prediction.as_str()),
                            accuracy,
                        ));
                        synthesized += 1;
                    }
                }
            }

            let record = GroundTruthRecord {
                ground_truth_data: GroundTruthData {
                    data,
                    encoding: "CSV".to_string(),
                },
                event_metadata: GroundTruthMetadata { event_id },
                event_version: "0".to_string(),
            };
            lines.push(serde_json::to_string(&record).context("failed to encode ground truth record")?);
        }

        let key = format!("{}/{}", self.ground_truth_prefix, batch_key(now_utc()));
        self.store.put(&key, &lines.join("\n"))?;
        info!(key = %key, events = lines.len(), labeled = synthesized, "deposited ground truth batch");

        Ok(synthesized)
    }
}

/// Timestamp-derived object key, `YYYY/MM/DD/HH/MMSS.jsonl` relative to
/// the ground truth prefix root.
fn batch_key(timestamp: OffsetDateTime) -> String {
    format!(
        "{:04}/{:02}/{:02}/{:02}/{:02}{:02}.jsonl",
        timestamp.year(),
        u8::from(timestamp.month()),
        timestamp.day(),
        timestamp.hour(),
        timestamp.minute(),
        timestamp.second()
    )
}

impl Backend for ObjectLedger {
    fn load(&self, limit: usize) -> Vec<LabeledRow> {
        match self.try_load(limit) {
            Ok(rows) => rows,
            Err(err) => {
                error!(error = %format!("{err:#}"), "failed to load production data");
                Vec::new()
            }
        }
    }

    fn save(&mut self, _inputs: &[FeatureRow], _outputs: &[ScoredOutput]) {
        // The hosted endpoint captures its own traffic; there is nothing
        // for this substrate to persist.
        info!("save is not applicable for the object substrate");
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

    fn deploy(&self, model_uri: &str, model_version: &str) -> Result<(), LedgerError> {
        let Some(client) = &self.deployment else {
            return Err(LedgerError::Deployment(
                "deployment_api is not configured".to_string(),
            ));
        };

        let spec = DeploymentSpec::new(&self.target, model_uri, model_version, &self.region)
            .with_data_capture_uri(self.data_capture_uri.clone())
            .with_execution_role(self.assume_role.clone());

        client
            .ensure_deployed(&spec)
            .map_err(|err| LedgerError::Deployment(format!("{err:#}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_config(root: &Path) -> BackendConfig {
        BackendConfig {
            substrate: inference_ledger_core::SubstrateKind::Object,
            target: "penguins".to_string(),
            object_root: Some(root.display().to_string()),
            features: vec!["island".to_string(), "body_mass_g".to_string()],
            seed: Some(23),
            ..BackendConfig::default()
        }
    }

    fn fixture_ledger(root: &Path) -> ObjectLedger {
        must(ObjectLedger::from_config(&fixture_config(root)))
    }

    fn instances_input(islands: &[&str]) -> String {
        let items: Vec<Value> = islands
            .iter()
            .enumerate()
            .map(|(index, island)| json!({"island": island, "body_mass_g": 3_000 + index}))
            .collect();
        json!({ "instances": items }).to_string()
    }

    fn output_payload(predictions: &[(&str, f64)]) -> String {
        let items: Vec<Value> = predictions
            .iter()
            .map(|(label, confidence)| json!({"prediction": label, "confidence": confidence}))
            .collect();
        json!({ "predictions": items }).to_string()
    }

    fn capture_line(event_id: &str, time: &str, input: &str, output: &str) -> String {
        json!({
            "captureData": {
                "endpointInput": { "data": input, "encoding": "JSON", "mode": "INPUT" },
                "endpointOutput": { "data": output, "encoding": "JSON", "mode": "OUTPUT" }
            },
            "eventMetadata": { "eventId": event_id, "inferenceTime": time },
            "eventVersion": "0"
        })
        .to_string()
    }

    fn ground_truth_line(event_id: &str, labels: &[&str]) -> String {
        json!({
            "groundTruthData": {
                "data": labels,
                "encoding": "CSV"
            },
            "eventMetadata": { "eventId": event_id },
            "eventVersion": "0"
        })
        .to_string()
    }

    fn put(root: &Path, key: &str, body: &str) {
        must(FsObjectStore::new(root).put(key, body));
    }

    #[test]
    fn fs_store_paginates_exhaustively() {
        let dir = must(tempfile::tempdir());
        let store = FsObjectStore::new(dir.path()).with_page_size(2);
        for index in 0..5 {
            must(store.put(&format!("data-capture/2025/06/0{index}.jsonl"), "x"));
        }
        must(store.put("ground-truth/2025/06/01.jsonl", "y"));

        let first = must(store.list_page("data-capture", None));
        assert_eq!(first.keys.len(), 2);
        assert!(first.next_token.is_some());

        let keys = must(list_all(&store, "data-capture"));
        assert_eq!(keys.len(), 5);
        assert!(keys.iter().all(|key| key.starts_with("data-capture/")));

        // An absent prefix lists empty rather than failing.
        assert!(must(list_all(&store, "missing-prefix")).is_empty());
    }

    #[test]
    fn fs_store_round_trips_nested_keys() {
        let dir = must(tempfile::tempdir());
        let store = FsObjectStore::new(dir.path());
        must(store.put("ground-truth/2025/06/01/10/3015.jsonl", "line-1\nline-2"));
        assert_eq!(
            must(store.get("ground-truth/2025/06/01/10/3015.jsonl")),
            "line-1\nline-2"
        );
        assert!(store.get("ground-truth/absent.jsonl").is_err());
    }

    #[test]
    fn all_three_input_shapes_flatten_identically() {
        let keyed = json!({"inputs": [{"island": "Biscoe", "body_mass_g": 4000}]});
        let instances = json!({"instances": [{"island": "Biscoe", "body_mass_g": 4000}]});
        let split = json!({"dataframe_split": {
            "columns": ["island", "body_mass_g"],
            "data": [["Biscoe", 4000]]
        }});

        let from_keyed = must(flatten_input(&keyed));
        let from_instances = must(flatten_input(&instances));
        let from_split = must(flatten_input(&split));

        assert_eq!(from_keyed, from_instances);
        assert_eq!(from_keyed, from_split);
        assert_eq!(from_keyed[0]["island"], json!("Biscoe"));

        assert!(flatten_input(&json!({"rows": []})).is_err());
        assert!(flatten_input(&json!({"dataframe_split": {"columns": ["a"], "data": [[1, 2]]}}))
            .is_err());
    }

    #[test]
    fn malformed_capture_lines_are_skipped_not_fatal() {
        let dir = must(tempfile::tempdir());
        put(
            dir.path(),
            "data-capture/2025/06/01.jsonl",
            &format!(
                "not json at all\n{}\n{}",
                json!({"captureData": {}}),
                capture_line(
                    "E1",
                    "2025-06-01T10:00:00Z",
                    &instances_input(&["Biscoe"]),
                    &output_payload(&[("Gentoo", 0.9)]),
                )
            ),
        );

        let ledger = fixture_ledger(dir.path());
        let rows = must(ledger.load_capture_rows());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_id, "E1");
    }

    #[test]
    fn join_attaches_labels_positionally_and_drops_orphans() {
        let dir = must(tempfile::tempdir());
        put(
            dir.path(),
            "data-capture/2025/06/01.jsonl",
            &format!(
                "{}\n{}",
                capture_line(
                    "E1",
                    "2025-06-01T10:00:00Z",
                    &instances_input(&["Biscoe", "Dream"]),
                    &output_payload(&[("Gentoo", 0.9), ("Adelie", 0.7)]),
                ),
                capture_line(
                    "E2",
                    "2025-06-01T11:00:00Z",
                    &instances_input(&["Torgersen"]),
                    &output_payload(&[("Chinstrap", 0.6)]),
                )
            ),
        );
        // E1 gets labels for both items; E3 has no captured partner and
        // must vanish from the join.
        put(
            dir.path(),
            "ground-truth/2025/06/02.jsonl",
            &format!(
                "{}\n{}",
                ground_truth_line("E1", &["Gentoo", "Chinstrap"]),
                ground_truth_line("E3", &["Adelie"])
            ),
        );

        let ledger = fixture_ledger(dir.path());
        let rows = must(ledger.reconcile());
        assert_eq!(rows.len(), 3);

        let e1: Vec<&CapturedRow> = rows.iter().filter(|row| row.event_id == "E1").collect();
        assert_eq!(e1.len(), 2);
        assert_eq!(e1[0].item_index, 0);
        assert_eq!(e1[0].ground_truth.as_deref(), Some("Gentoo"));
        assert_eq!(e1[1].item_index, 1);
        assert_eq!(e1[1].ground_truth.as_deref(), Some("Chinstrap"));

        let e2: Vec<&CapturedRow> = rows.iter().filter(|row| row.event_id == "E2").collect();
        assert_eq!(e2.len(), 1);
        assert!(e2[0].ground_truth.is_none());

        assert!(!rows.iter().any(|row| row.event_id == "E3"));
    }

    #[test]
    fn load_returns_only_labeled_rows_without_bookkeeping() {
        let dir = must(tempfile::tempdir());
        put(
            dir.path(),
            "data-capture/2025/06/01.jsonl",
            &capture_line(
                "E1",
                "2025-06-01T10:00:00Z",
                &instances_input(&["Biscoe", "Dream"]),
                &output_payload(&[("Gentoo", 0.9), ("Adelie", 0.7)]),
            ),
        );
        put(
            dir.path(),
            "ground-truth/2025/06/02.jsonl",
            &ground_truth_line("E1", &["Gentoo"]),
        );

        let ledger = fixture_ledger(dir.path());
        let rows = must(ledger.try_load(10));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].prediction.as_deref(), Some("Gentoo"));
        assert_eq!(rows[0].ground_truth.as_deref(), Some("Gentoo"));
        // Confidence is internal bookkeeping for this substrate.
        assert!(rows[0].confidence.is_none());

        assert!(must(ledger.try_load(0)).is_empty());
    }

    #[test]
    fn no_capture_objects_means_empty_regardless_of_ground_truth() {
        let dir = must(tempfile::tempdir());
        put(
            dir.path(),
            "ground-truth/2025/06/02.jsonl",
            &ground_truth_line("E1", &["Gentoo"]),
        );

        let ledger = fixture_ledger(dir.path());
        assert!(must(ledger.reconcile()).is_empty());
        assert!(must(ledger.try_load(10)).is_empty());
    }

    #[test]
    fn duplicate_capture_delivery_is_rejected_first_wins() {
        let dir = must(tempfile::tempdir());
        let envelope = capture_line(
            "E1",
            "2025-06-01T10:00:00Z",
            &instances_input(&["Biscoe", "Dream"]),
            &output_payload(&[("Gentoo", 0.9), ("Adelie", 0.7)]),
        );
        put(dir.path(), "data-capture/2025/06/01.jsonl", &envelope);
        put(
            dir.path(),
            "data-capture/2025/06/02.jsonl",
            &capture_line(
                "E1",
                "2025-06-01T10:05:00Z",
                &instances_input(&["Torgersen", "Torgersen"]),
                &output_payload(&[("Chinstrap", 0.5), ("Chinstrap", 0.5)]),
            ),
        );
        put(
            dir.path(),
            "ground-truth/2025/06/03.jsonl",
            &ground_truth_line("E1", &["Gentoo", "Chinstrap"]),
        );

        let ledger = fixture_ledger(dir.path());
        let rows = must(ledger.reconcile());

        // Only the first-encountered delivery survives, keeping indices
        // contiguous from 0, and both labels attach to it.
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].features["island"], json!("Biscoe"));
        assert_eq!(rows[0].item_index, 0);
        assert_eq!(rows[0].ground_truth.as_deref(), Some("Gentoo"));
        assert_eq!(rows[1].item_index, 1);
        assert_eq!(rows[1].ground_truth.as_deref(), Some("Chinstrap"));
    }

    #[test]
    fn later_ground_truth_batch_wins_per_event() {
        let dir = must(tempfile::tempdir());
        put(
            dir.path(),
            "data-capture/2025/06/01.jsonl",
            &capture_line(
                "E1",
                "2025-06-01T10:00:00Z",
                &instances_input(&["Biscoe"]),
                &output_payload(&[("Gentoo", 0.9)]),
            ),
        );
        put(
            dir.path(),
            "ground-truth/2025/06/01.jsonl",
            &ground_truth_line("E1", &["Adelie"]),
        );
        put(
            dir.path(),
            "ground-truth/2025/06/02.jsonl",
            &ground_truth_line("E1", &["Chinstrap"]),
        );

        let ledger = fixture_ledger(dir.path());
        let rows = must(ledger.reconcile());
        assert_eq!(rows[0].ground_truth.as_deref(), Some("Chinstrap"));
    }

    #[test]
    fn labeling_a_partially_labeled_event_keeps_existing_positions() {
        let dir = must(tempfile::tempdir());
        put(
            dir.path(),
            "data-capture/2025/06/01.jsonl",
            &capture_line(
                "E1",
                "2025-06-01T10:00:00Z",
                &instances_input(&["Biscoe", "Dream"]),
                &output_payload(&[("Adelie", 0.9), ("Chinstrap", 0.7)]),
            ),
        );
        // The external process labeled only the first item so far.
        put(
            dir.path(),
            "ground-truth/2025/06/02.jsonl",
            &ground_truth_line("E1", &["Gentoo"]),
        );

        let mut ledger = fixture_ledger(dir.path());
        assert_eq!(must(ledger.try_label(1.0)), 1);

        // The deposited batch replaces E1's whole label list, so it must
        // carry the existing label at position 0 and the synthesized one
        // at position 1.
        let store = FsObjectStore::new(dir.path());
        let keys = must(list_all(&store, "ground-truth"));
        assert_eq!(keys.len(), 2);
        let new_key = match keys.iter().find(|key| *key != "ground-truth/2025/06/02.jsonl") {
            Some(key) => key,
            None => panic!("labeling must deposit a new batch object"),
        };
        let body = must(store.get(new_key));
        let record: GroundTruthRecord = must(serde_json::from_str(&body));
        assert_eq!(record.ground_truth_data.data, ["Gentoo", "Chinstrap"]);

        let rows = must(ledger.reconcile());
        assert_eq!(rows[0].ground_truth.as_deref(), Some("Gentoo"));
        assert_eq!(rows[1].ground_truth.as_deref(), Some("Chinstrap"));

        assert_eq!(must(ledger.try_label(1.0)), 0);
    }

    #[test]
    fn ground_truth_outside_the_domain_is_skipped() {
        let dir = must(tempfile::tempdir());
        put(
            dir.path(),
            "data-capture/2025/06/01.jsonl",
            &capture_line(
                "E1",
                "2025-06-01T10:00:00Z",
                &instances_input(&["Biscoe"]),
                &output_payload(&[("Gentoo", 0.9)]),
            ),
        );
        put(
            dir.path(),
            "ground-truth/2025/06/01.jsonl",
            &ground_truth_line("E1", &["Emperor"]),
        );

        let ledger = fixture_ledger(dir.path());
        let rows = must(ledger.reconcile());
        assert!(rows[0].ground_truth.is_none());
    }

    #[test]
    fn label_deposits_one_batch_and_makes_rows_loadable() {
        let dir = must(tempfile::tempdir());
        put(
            dir.path(),
            "data-capture/2025/06/01.jsonl",
            &format!(
                "{}\n{}",
                capture_line(
                    "E1",
                    "2025-06-01T10:00:00Z",
                    &instances_input(&["Biscoe", "Dream"]),
                    &output_payload(&[("Gentoo", 0.9), ("Adelie", 0.7)]),
                ),
                capture_line(
                    "E2",
                    "2025-06-01T11:00:00Z",
                    &instances_input(&["Torgersen"]),
                    &output_payload(&[("Chinstrap", 0.6)]),
                )
            ),
        );

        let mut ledger = fixture_ledger(dir.path());
        assert!(must(ledger.try_load(10)).is_empty());

        // Perfect accuracy: every synthesized label equals its prediction.
        assert_eq!(must(ledger.try_label(1.0)), 3);

        let store = FsObjectStore::new(dir.path());
        let keys = must(list_all(&store, "ground-truth"));
        assert_eq!(keys.len(), 1);
        assert!(keys[0].ends_with(".jsonl"));
        // ground-truth/YYYY/MM/DD/HH/MMSS.jsonl
        assert_eq!(keys[0].split('/').count(), 6);

        let body = must(store.get(&keys[0]));
        assert_eq!(body.lines().count(), 2);
        for line in body.lines() {
            let record: GroundTruthRecord = must(serde_json::from_str(line));
            assert_eq!(record.ground_truth_data.encoding, "CSV");
            assert_eq!(record.event_version, "0");
        }

        let rows = must(ledger.try_load(10));
        assert_eq!(rows.len(), 3);
        for row in &rows {
            assert_eq!(row.ground_truth.as_deref(), row.prediction.as_deref());
        }

        // Everything is labeled now; a second pass deposits nothing.
        assert_eq!(must(ledger.try_label(1.0)), 0);
        assert_eq!(must(list_all(&store, "ground-truth")).len(), 1);
    }

    #[test]
    fn deploy_without_a_deployment_api_is_a_configuration_fault() {
        let dir = must(tempfile::tempdir());
        let ledger = fixture_ledger(dir.path());
        assert!(ledger.deploy("models:/penguins/3", "3").is_err());
    }

    #[test]
    fn batch_keys_follow_the_timestamp_pattern() {
        let timestamp = must(parse_rfc3339_utc("2025-06-01T10:30:15Z"));
        assert_eq!(batch_key(timestamp), "2025/06/01/10/3015.jsonl");
    }
}
