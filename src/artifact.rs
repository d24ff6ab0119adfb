//! On-disk artifact formats of the pipeline.
//!
//! | Artifact | Name | Content |
//! |---|---|---|
//! | work unit | `<id>.params` | comma-separated numbers |
//! | layout | `<id>.dot` | graph description text |
//! | score | `<score_dir>/<id>.txt` | 5-token preamble, then metric values |

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::{Error, Result};

/// Suffix of work units awaiting layout generation.
pub const PARAMS_SUFFIX: &str = "params";

/// Suffix of layouts awaiting evaluation.
pub const LAYOUT_SUFFIX: &str = "dot";

/// Suffix of score artifacts awaiting the orchestrator.
pub const SCORE_SUFFIX: &str = "txt";

/// Number of whitespace tokens preceding the metric values in a score artifact.
pub const SCORE_PREAMBLE_TOKENS: usize = 5;

/// Read an artifact as UTF-8 text.
///
/// # Errors
///
/// Returns an IO error if the file cannot be read and
/// [`Error::MalformedArtifact`] if its content is not UTF-8.
pub fn read_text(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    String::from_utf8(bytes).map_err(|e| Error::MalformedArtifact {
        path: path.to_path_buf(),
        reason: e.utf8_error().to_string(),
    })
}

/// Encode a parameter vector as a work unit payload.
///
/// Coordinates listed in `integer_params` are truncated toward zero, since
/// the layout generator takes them as iteration counts.
#[must_use]
pub fn encode_params(params: &[f64], integer_params: &[usize]) -> String {
    params
        .iter()
        .enumerate()
        .map(|(i, &value)| {
            if integer_params.contains(&i) {
                format!("{}", value.trunc())
            } else {
                format!("{value}")
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Decode a work unit payload. Only the first line is read.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if the payload is empty or any field is not
/// a number.
pub fn decode_params(payload: &str) -> Result<Vec<f64>> {
    let line = payload.lines().next().unwrap_or("").trim();
    if line.is_empty() {
        return Err(Error::InvalidInput("empty parameter payload".into()));
    }
    line.split(',')
        .map(|field| {
            field
                .trim()
                .parse::<f64>()
                .map_err(|e| Error::InvalidInput(format!("bad parameter {field:?}: {e}")))
        })
        .collect()
}

fn number_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[-+]?(?:\d*\.\d+|\d+)").expect("static pattern is valid"))
}

/// Extract raw metric values from a score artifact.
///
/// Every numeric substring of every token after the preamble is returned in
/// order. A value printed in scientific notation therefore shows up as a
/// mantissa followed by a negative exponent; [`crate::reward::normalize_metrics`]
/// folds those back together.
#[must_use]
pub fn parse_score(text: &str) -> Vec<f64> {
    text.split_whitespace()
        .skip(SCORE_PREAMBLE_TOKENS)
        .flat_map(|token| {
            number_pattern()
                .find_iter(token)
                .filter_map(|m| m.as_str().parse::<f64>().ok())
                .collect::<Vec<_>>()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_text_rejects_non_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc.dot");
        std::fs::write(&path, [b'g', 0xff, 0xfe]).unwrap();
        match read_text(&path) {
            Err(Error::MalformedArtifact { path: bad, .. }) => assert_eq!(bad, path),
            other => panic!("unexpected {other:?}"),
        }

        std::fs::write(&path, "graph {}").unwrap();
        assert_eq!(read_text(&path).unwrap(), "graph {}");
    }

    #[test]
    fn test_encode_truncates_integer_params() {
        assert_eq!(encode_params(&[1.5, 0.25, 50.9], &[2]), "1.5,0.25,50");
        assert_eq!(encode_params(&[1.0, 2.0, 50.0], &[]), "1,2,50");
    }

    #[test]
    fn test_decode_round_trips_encoded_payload() {
        let decoded = decode_params(&encode_params(&[3.25, -1.0, 7.0], &[2])).unwrap();
        assert_eq!(decoded, vec![3.25, -1.0, 7.0]);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_params("").is_err());
        assert!(decode_params("1.0,abc,3").is_err());
    }

    #[test]
    fn test_parse_score_skips_preamble() {
        let text = "Reading graph layout.dot done. 0.8 3 0.1 0.05 0.9 0.4 0.6";
        assert_eq!(parse_score(text), vec![0.8, 3.0, 0.1, 0.05, 0.9, 0.4, 0.6]);
    }

    #[test]
    fn test_parse_score_splits_scientific_notation() {
        let text = "a b c d e crosslessness=0.5 angle=1.5e-05";
        assert_eq!(parse_score(text), vec![0.5, 1.5, -5.0]);
    }

    #[test]
    fn test_parse_score_empty() {
        assert!(parse_score("").is_empty());
        assert!(parse_score("only four preamble tokens").is_empty());
    }
}
