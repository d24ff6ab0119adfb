//! Tests for error types

use std::path::PathBuf;

use graphoptima::Error;

#[test]
fn test_config_error() {
    let error = Error::Config("queue.poll_interval_ms must be positive".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("Configuration error"));
    assert!(error_str.contains("poll_interval_ms"));
}

#[test]
fn test_malformed_artifact_error_names_path() {
    let error = Error::MalformedArtifact {
        path: PathBuf::from("work/abc.params"),
        reason: "empty payload".to_string(),
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("work/abc.params"));
    assert!(error_str.contains("empty payload"));
}

#[test]
fn test_malformed_metrics_error() {
    let error = Error::MalformedMetrics("got 3 values".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("Malformed metrics"));
    assert!(error_str.contains("Expected exactly 7"));
}

#[test]
fn test_dimension_mismatch_error() {
    let error = Error::DimensionMismatch {
        expected: 3,
        actual: 5,
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("expected 3"));
    assert!(error_str.contains("got 5"));
}

#[test]
fn test_stage_error() {
    let error = Error::Stage {
        stage: "layout_evaluator".to_string(),
        reason: "exit status 139".to_string(),
    };
    assert_eq!(format!("{error}"), "Stage 'layout_evaluator' failed: exit status 139");
}

#[test]
fn test_scheduler_error() {
    let error = Error::Scheduler("sbatch not found".to_string());
    assert!(format!("{error}").starts_with("Scheduler error"));
}

#[test]
fn test_io_error_conversion() {
    let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
    let error: Error = io_error.into();
    let error_str = format!("{error}");
    assert!(error_str.contains("IO error"));
}

#[test]
fn test_serialization_error_conversion() {
    let json_error = serde_json::from_str::<Vec<f64>>("[1.0,").unwrap_err();
    let error: Error = json_error.into();
    assert!(matches!(error, Error::Serialization(_)));
}

#[test]
fn test_error_debug() {
    let error = Error::InvalidInput("weight group must have 3 entries".to_string());
    let debug_str = format!("{error:?}");
    assert!(debug_str.contains("InvalidInput"));
}

#[test]
fn test_result_type_alias_error() {
    fn returns_error() -> graphoptima::Result<i32> {
        Err(Error::InvalidInput("test error".to_string()))
    }

    assert!(returns_error().is_err());
}
