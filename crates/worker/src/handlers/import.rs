//! `manufacturing.import`: bulk import of machine telemetry.
//!
//! Payload:
//!
//! ```json
//! { "format": "csv", "data": "machine_id,timestamp,metric,value\n...", "source": "line-3", "strict": false }
//! { "format": "json", "data": [{ "machine_id": "m-1", "timestamp": "...", "metric": "temp", "value": 71.5 }] }
//! ```
//!
//! CSV cells may be quoted (`"Press 3, Line A"`, with `""` for a literal
//! quote); a quoted cell cannot span lines.
//!
//! Rows that fail validation are counted as rejected. With `strict` set any
//! rejected row fails the whole job with a `ValidationError`, which the
//! default retry strategy quarantines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use jobward_core::JobError;
use jobward_queue::handler::JobContext;

pub const JOB_TYPE: &str = "manufacturing.import";

/// Progress is reported, and the lease renewed, after this many rows.
pub const PROGRESS_EVERY: usize = 100;

const CSV_HEADER: [&str; 4] = ["machine_id", "timestamp", "metric", "value"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportFormat {
    Csv,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImportPayload {
    pub format: ImportFormat,
    pub data: Value,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub strict: bool,
}

/// One telemetry reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MachineReading {
    pub machine_id: String,
    pub timestamp: DateTime<Utc>,
    pub metric: String,
    pub value: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportSummary {
    pub imported: usize,
    pub rejected: usize,
    pub source: Option<String>,
}

/// A row that failed validation, with its 1-based position.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRow {
    pub row: usize,
    pub reason: String,
}

/// Handler entry point.
pub fn handle(ctx: &JobContext<'_>) -> Result<Value, JobError> {
    let payload: ImportPayload = serde_json::from_value(ctx.payload().clone())
        .map_err(|e| JobError::validation(format!("invalid import payload: {e}")))?;

    let rows = split_rows(&payload)?;
    let total = rows.len();
    let mut summary = ImportSummary {
        source: payload.source.clone(),
        ..ImportSummary::default()
    };
    let mut rejections = Vec::new();

    for (i, row) in rows.into_iter().enumerate() {
        match row.and_then(|r| validate(&r)) {
            Ok(reading) => {
                debug!(machine_id = %reading.machine_id, metric = %reading.metric, "reading imported");
                summary.imported += 1;
            }
            Err(reason) => {
                summary.rejected += 1;
                rejections.push(RejectedRow { row: i + 1, reason });
            }
        }
        if (i + 1) % PROGRESS_EVERY == 0 {
            ctx.report_items((i + 1) as u64, total as u64);
            ctx.heartbeat()
                .map_err(|e| JobError::untyped(format!("lease renewal failed at row {}: {e}", i + 1)))?;
        }
    }

    if payload.strict && let Some(first) = rejections.first() {
        return Err(JobError::validation(format!(
            "{} of {} rows rejected; row {}: {}",
            summary.rejected, total, first.row, first.reason
        )));
    }

    ctx.report_items(total as u64, total as u64);
    ctx.report_progress(100, format!("imported {} rows, rejected {}", summary.imported, summary.rejected));
    info!(
        job_id = %ctx.job().id,
        imported = summary.imported,
        rejected = summary.rejected,
        source = summary.source.as_deref().unwrap_or("-"),
        "import finished"
    );

    Ok(json!(summary))
}

/// Raw rows keyed by column name; a row-level parse error is kept in place.
type RawRow = Result<serde_json::Map<String, Value>, String>;

fn split_rows(payload: &ImportPayload) -> Result<Vec<RawRow>, JobError> {
    match (payload.format, &payload.data) {
        (ImportFormat::Csv, Value::String(text)) => csv_rows(text),
        (ImportFormat::Json, Value::Array(items)) => Ok(items
            .iter()
            .map(|item| match item {
                Value::Object(map) => Ok(map.clone()),
                other => Err(format!("expected an object, got {other}")),
            })
            .collect()),
        (ImportFormat::Json, Value::String(text)) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Array(items)) => split_rows(&ImportPayload {
                data: Value::Array(items),
                ..payload.clone()
            }),
            Ok(_) => Err(JobError::validation("json data must be an array of records")),
            Err(e) => Err(JobError::validation(format!("json data is not valid JSON: {e}"))),
        },
        (ImportFormat::Csv, _) => Err(JobError::validation("csv data must be a string")),
        (ImportFormat::Json, _) => Err(JobError::validation("json data must be an array of records")),
    }
}

fn csv_rows(text: &str) -> Result<Vec<RawRow>, JobError> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let header: Vec<String> = csv_cells(
        lines
            .next()
            .ok_or_else(|| JobError::validation("csv data has no header row"))?,
    )
    .map_err(|e| JobError::validation(format!("csv header: {e}")))?
    .into_iter()
    .map(|h| h.to_ascii_lowercase())
    .collect();

    if let Some(missing) = CSV_HEADER.iter().find(|col| !header.iter().any(|h| h == *col)) {
        return Err(JobError::validation(format!("csv header is missing column {missing:?}")));
    }

    Ok(lines
        .map(|line| {
            let cells = csv_cells(line)?;
            if cells.len() != header.len() {
                return Err(format!("expected {} columns, found {}", header.len(), cells.len()));
            }
            Ok(header
                .iter()
                .zip(cells)
                .map(|(h, c)| (h.clone(), Value::String(c)))
                .collect())
        })
        .collect())
}

/// Split one CSV record. Unquoted cells are trimmed; quoted cells are kept
/// verbatim apart from `""` escapes.
fn csv_cells(line: &str) -> Result<Vec<String>, String> {
    let mut cells = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while chars.next_if(|c| *c == ' ' || *c == '\t').is_some() {}

        let mut cell = String::new();
        if chars.next_if_eq(&'"').is_some() {
            loop {
                match chars.next() {
                    Some('"') => {
                        if chars.next_if_eq(&'"').is_none() {
                            break;
                        }
                        cell.push('"');
                    }
                    Some(c) => cell.push(c),
                    None => return Err("unterminated quoted cell".to_string()),
                }
            }
            while chars.next_if(|c| *c == ' ' || *c == '\t').is_some() {}
            match chars.peek() {
                None | Some(',') => {}
                Some(c) => return Err(format!("unexpected {c:?} after quoted cell")),
            }
        } else {
            while let Some(c) = chars.next_if(|c| *c != ',') {
                cell.push(c);
            }
            cell = cell.trim().to_string();
        }
        cells.push(cell);

        if chars.next().is_none() {
            return Ok(cells);
        }
    }
}

fn validate(row: &serde_json::Map<String, Value>) -> Result<MachineReading, String> {
    let text = |key: &str| -> Result<String, String> {
        match row.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
            Some(Value::String(_)) | None | Some(Value::Null) => Err(format!("{key} is required")),
            Some(other) => Err(format!("{key} must be a string, got {other}")),
        }
    };

    let machine_id = text("machine_id")?;
    let metric = text("metric")?;
    let timestamp = DateTime::parse_from_rfc3339(&text("timestamp")?)
        .map_err(|e| format!("timestamp is not RFC 3339: {e}"))?
        .with_timezone(&Utc);

    let value = match row.get("value") {
        Some(Value::Number(n)) => n.as_f64().ok_or_else(|| "value is out of range".to_string())?,
        Some(Value::String(s)) => s.trim().parse::<f64>().map_err(|_| format!("value {s:?} is not a number"))?,
        _ => return Err("value is required".to_string()),
    };
    if !value.is_finite() {
        return Err("value must be finite".to_string());
    }

    Ok(MachineReading {
        machine_id,
        timestamp,
        metric,
        value,
    })
}

#[cfg(test)]
mod tests {
    use jobward_queue::job::{JobDescriptor, JobOptions};
    use jobward_queue::progress::InMemoryProgressSink;
    use jobward_queue::{ErrorKind, StoreError};
    use proptest::prelude::*;

    use super::*;

    fn run(payload: Value) -> (Result<Value, JobError>, InMemoryProgressSink) {
        run_with(payload, &|| Ok(()))
    }

    fn run_with(
        payload: Value,
        beat: &(dyn Fn() -> Result<(), StoreError> + Sync),
    ) -> (Result<Value, JobError>, InMemoryProgressSink) {
        let job = JobDescriptor::new("import", JOB_TYPE, payload, &JobOptions::new());
        let sink = InMemoryProgressSink::new();
        let result = {
            let ctx = JobContext::new(&job, "w-1", &sink, beat);
            handle(&ctx)
        };
        (result, sink)
    }

    fn csv(rows: usize) -> String {
        let mut out = String::from("machine_id,timestamp,metric,value\n");
        for i in 0..rows {
            out.push_str(&format!("m-{},2026-03-01T08:00:{:02}Z,spindle_temp,{}.5\n", i % 7, i % 60, 60 + i % 20));
        }
        out
    }

    #[test]
    fn imports_csv_rows() {
        let (result, sink) = run(json!({"format": "csv", "data": csv(3), "source": "line-3"}));
        assert_eq!(result.unwrap(), json!({"imported": 3, "rejected": 0, "source": "line-3"}));

        let last = sink.all().pop().unwrap();
        assert_eq!(last.percent, Some(100));
    }

    #[test]
    fn imports_json_records() {
        let data = json!([
            {"machine_id": "m-1", "timestamp": "2026-03-01T08:00:00+01:00", "metric": "rpm", "value": 1200},
            {"machine_id": "m-2", "timestamp": "2026-03-01T08:00:00Z", "metric": "rpm", "value": "980.5"},
            {"machine_id": "", "timestamp": "2026-03-01T08:00:00Z", "metric": "rpm", "value": 1},
        ]);
        let (result, _) = run(json!({"format": "json", "data": data}));
        assert_eq!(result.unwrap(), json!({"imported": 2, "rejected": 1, "source": null}));
    }

    #[test]
    fn json_data_may_be_a_string() {
        let data = r#"[{"machine_id":"m-1","timestamp":"2026-03-01T08:00:00Z","metric":"rpm","value":1}]"#;
        let (result, _) = run(json!({"format": "json", "data": data}));
        assert_eq!(result.unwrap()["imported"], 1);
    }

    #[test]
    fn reports_progress_every_hundred_rows() {
        let (result, sink) = run(json!({"format": "csv", "data": csv(250)}));
        assert_eq!(result.unwrap()["imported"], 250);

        let counts: Vec<Option<u64>> = sink.all().iter().map(|u| u.processed).collect();
        assert_eq!(counts, vec![Some(100), Some(200), Some(250), None]);
    }

    #[test]
    fn bad_rows_are_rejected_not_fatal() {
        let data = "machine_id,timestamp,metric,value\n\
                    m-1,2026-03-01T08:00:00Z,temp,70\n\
                    m-1,yesterday,temp,70\n\
                    m-1,2026-03-01T08:00:00Z,temp,hot\n\
                    m-1,2026-03-01T08:00:00Z,temp\n";
        let (result, _) = run(json!({"format": "csv", "data": data}));
        assert_eq!(result.unwrap(), json!({"imported": 1, "rejected": 3, "source": null}));
    }

    #[test]
    fn strict_mode_fails_on_any_rejection() {
        let data = "machine_id,timestamp,metric,value\nm-1,not-a-time,temp,70\n";
        let (result, _) = run(json!({"format": "csv", "data": data, "strict": true}));
        let err = result.unwrap_err();
        assert_eq!(err.effective_kind(), ErrorKind::Validation);
        assert!(err.message.contains("row 1"), "{}", err.message);
    }

    #[test]
    fn malformed_payloads_are_validation_errors() {
        for payload in [
            json!({"data": "x"}),
            json!({"format": "xml", "data": "x"}),
            json!({"format": "csv", "data": [1, 2]}),
            json!({"format": "csv", "data": ""}),
            json!({"format": "csv", "data": "machine_id,metric,value\n"}),
            json!({"format": "json", "data": {"machine_id": "m-1"}}),
            json!({"format": "json", "data": "[oops"}),
        ] {
            let (result, _) = run(payload.clone());
            let err = result.unwrap_err();
            assert_eq!(err.effective_kind(), ErrorKind::Validation, "{payload}");
        }
    }

    #[test]
    fn header_columns_may_be_reordered() {
        let data = "value,metric,machine_id,timestamp\n12.5,temp,m-9,2026-03-01T08:00:00Z\n";
        let (result, _) = run(json!({"format": "csv", "data": data}));
        assert_eq!(result.unwrap()["imported"], 1);
    }

    #[test]
    fn quoted_cells_may_contain_commas_and_quotes() {
        let data = "machine_id,timestamp,metric,value\n\
                    \"Press 3, Line A\",2026-03-01T08:00:00Z,\"temp \"\"inner\"\"\",70\n\
                    \"unterminated,2026-03-01T08:00:00Z,temp,70\n";
        let (result, _) = run(json!({"format": "csv", "data": data}));
        assert_eq!(result.unwrap(), json!({"imported": 1, "rejected": 1, "source": null}));

        assert_eq!(
            csv_cells(r#" "Press 3, Line A" ,2026-03-01T08:00:00Z,"temp ""inner""",70"#).unwrap(),
            vec!["Press 3, Line A", "2026-03-01T08:00:00Z", "temp \"inner\"", "70"]
        );
        assert_eq!(csv_cells("a,,b").unwrap(), vec!["a", "", "b"]);
        assert!(csv_cells(r#""a"b,c"#).is_err());
    }

    #[test]
    fn lost_lease_stops_the_import() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let beats = AtomicUsize::new(0);
        let beat = || -> Result<(), StoreError> {
            beats.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::LeaseLost(jobward_queue::JobId::new()))
        };
        let (result, sink) = run_with(json!({"format": "csv", "data": csv(250)}), &beat);

        let err = result.unwrap_err();
        assert!(err.message.contains("row 100"), "{}", err.message);
        assert_eq!(beats.load(Ordering::SeqCst), 1);
        assert_eq!(sink.all().len(), 1);
    }

    proptest! {
        /// Every well-formed row is imported, whatever the machine or value.
        #[test]
        fn well_formed_rows_always_import(
            rows in proptest::collection::vec((0u32..1000, -1.0e6f64..1.0e6), 0..50),
        ) {
            let mut data = String::from("machine_id,timestamp,metric,value\n");
            for (machine, value) in &rows {
                data.push_str(&format!("m-{machine},2026-03-01T08:00:00Z,load,{value}\n"));
            }
            let (result, _) = run(json!({"format": "csv", "data": data}));
            let summary = result.unwrap();
            prop_assert_eq!(summary["imported"].as_u64(), Some(rows.len() as u64));
            prop_assert_eq!(summary["rejected"].as_u64(), Some(0));
        }
    }
}
