//! Tests for `StageOutput` and `BatchMetrics`.

use super::{BatchMetrics, StageOutput, StageStatus};
use crate::errors::CyclestreamError;

#[test]
fn test_ok_output() {
    let metrics = BatchMetrics {
        batches_committed: 2,
        rows_out: 10,
        ..BatchMetrics::default()
    };
    let output = StageOutput::ok(metrics, "weather_S9.json");

    assert_eq!(output.status, StageStatus::Ok);
    assert!(output.is_success());
    assert_eq!(output.metrics.rows_out, 10);
    assert_eq!(output.watermark.as_deref(), Some("weather_S9.json"));
}

#[test]
fn test_skip_output() {
    let output = StageOutput::skip("no new input");

    assert_eq!(output.status, StageStatus::Skip);
    assert!(output.is_success());
    assert_eq!(output.skip_reason.as_deref(), Some("no new input"));
}

#[test]
fn test_default_is_skip() {
    assert_eq!(StageOutput::default().status, StageStatus::Skip);
}

#[test]
fn test_cancel_output() {
    let output = StageOutput::cancel("shutdown requested");

    assert_eq!(output.status, StageStatus::Cancel);
    assert!(output.is_failure());
    assert_eq!(output.cancel_reason.as_deref(), Some("shutdown requested"));
}

#[test]
fn test_fail_output() {
    let output = StageOutput::fail("boom");

    assert_eq!(output.status, StageStatus::Fail);
    assert!(!output.retryable);
    assert_eq!(output.error.as_deref(), Some("boom"));
}

#[test]
fn test_from_error_keeps_code_and_retryability() {
    let transient = StageOutput::from_error(&CyclestreamError::transient("raw", "EAGAIN"));
    assert!(transient.retryable);
    assert_eq!(transient.error_code.as_deref(), Some("transient_io"));

    let conflict = StageOutput::from_error(&CyclestreamError::conflict("wm", 1, 2));
    assert!(!conflict.retryable);
    assert_eq!(conflict.error_code.as_deref(), Some("commit_conflict"));
}

#[test]
fn test_metrics_absorb() {
    let mut total = BatchMetrics::default();
    let mut batch = BatchMetrics {
        batches_committed: 1,
        rows_in: 5,
        rows_out: 4,
        rows_dropped: 1,
        ..BatchMetrics::default()
    };
    batch.constraint_violations.insert("valid_station_id".into(), 1);

    total.absorb(&batch);
    total.absorb(&batch);

    assert_eq!(total.batches_committed, 2);
    assert_eq!(total.rows_in, 10);
    assert_eq!(total.rows_dropped, 2);
    assert_eq!(total.constraint_violations["valid_station_id"], 2);
    assert_eq!(total.total_violations(), 2);
}

#[test]
fn test_output_serialization_skips_empty_fields() {
    let output = StageOutput::skip("idle");
    let json = serde_json::to_value(&output).unwrap();

    assert_eq!(json["status"], "skip");
    assert!(json.get("error").is_none());
    assert!(json.get("retryable").is_none());
}
