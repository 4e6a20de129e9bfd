//! Classifier for lines coming off the device
//!
//! The device prints three kinds of lines:
//! - `KEY: value` - status lines, forwarded verbatim
//! - `distance,angle` - a telemetry sample in centimetres and degrees
//! - `--- ... ---` separators and blank lines, dropped

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lines containing this marker are separators.
pub const SEPARATOR_MARKER: &str = "---";

/// Lines containing this marker are status lines.
pub const STATUS_MARKER: char = ':';

/// A decoded distance/angle observation with derived Cartesian coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    pub distance: f64,
    pub angle_degrees: f64,
    #[serde(rename = "x")]
    pub x_coord: f64,
    #[serde(rename = "y")]
    pub y_coord: f64,
    pub captured_at: DateTime<Utc>,
}

impl TelemetryRecord {
    /// Build a record from polar coordinates.
    pub fn from_polar(distance: f64, angle_degrees: f64, captured_at: DateTime<Utc>) -> Self {
        let radians = angle_degrees.to_radians();
        Self {
            distance,
            angle_degrees,
            x_coord: distance * radians.cos(),
            y_coord: distance * radians.sin(),
            captured_at,
        }
    }
}

/// Outcome of classifying one inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum LineClass {
    /// Forwarded as-is to subscribers
    Passthrough(String),

    /// Decoded telemetry sample
    Telemetry(TelemetryRecord),

    /// Dropped
    Ignored,
}

/// Classify a single line (without its terminator).
///
/// `captured_at` is stamped on telemetry records; passing it in keeps this
/// function free of clock reads.
pub fn classify(line: &str, captured_at: DateTime<Utc>) -> LineClass {
    let trimmed = line.trim();

    if trimmed.is_empty() || line.contains(SEPARATOR_MARKER) {
        return LineClass::Ignored;
    }

    if line.contains(STATUS_MARKER) {
        return LineClass::Passthrough(line.to_string());
    }

    let fields: Vec<&str> = trimmed.split(',').collect();
    if fields.len() != 2 {
        return LineClass::Ignored;
    }

    match (parse_field(fields[0]), parse_field(fields[1])) {
        (Some(distance), Some(angle)) => {
            LineClass::Telemetry(TelemetryRecord::from_polar(distance, angle, captured_at))
        }
        _ => LineClass::Ignored,
    }
}

fn parse_field(field: &str) -> Option<f64> {
    field.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_classify_telemetry_pair() {
        match classify("12.5,90", now()) {
            LineClass::Telemetry(record) => {
                assert_eq!(record.distance, 12.5);
                assert_eq!(record.angle_degrees, 90.0);
                assert!(record.x_coord.abs() < 1e-9);
                assert!((record.y_coord - 12.5).abs() < 1e-9);
                assert_eq!(record.captured_at, now());
            }
            other => panic!("Expected Telemetry, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_zero_angle_lies_on_x_axis() {
        match classify(" 30 , 0 ", now()) {
            LineClass::Telemetry(record) => {
                assert_eq!(record.x_coord, 30.0);
                assert_eq!(record.y_coord, 0.0);
            }
            other => panic!("Expected Telemetry, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_status_line_is_passthrough() {
        assert_eq!(
            classify("TOTAL_DISTANCE: 7", now()),
            LineClass::Passthrough("TOTAL_DISTANCE: 7".to_string())
        );
        // Status lines are never parsed as telemetry, even with a comma
        assert_eq!(
            classify("POS: 1,2", now()),
            LineClass::Passthrough("POS: 1,2".to_string())
        );
    }

    #[test]
    fn test_classify_status_line_kept_verbatim() {
        assert_eq!(
            classify("  MODE: idle ", now()),
            LineClass::Passthrough("  MODE: idle ".to_string())
        );
    }

    #[test]
    fn test_classify_blank_and_separator_ignored() {
        assert_eq!(classify("", now()), LineClass::Ignored);
        assert_eq!(classify("   \r", now()), LineClass::Ignored);
        assert_eq!(classify("--- marker ---", now()), LineClass::Ignored);
    }

    #[test]
    fn test_classify_bad_numbers_ignored() {
        assert_eq!(classify("abc,12", now()), LineClass::Ignored);
        assert_eq!(classify("12,", now()), LineClass::Ignored);
        assert_eq!(classify("NaN,12", now()), LineClass::Ignored);
    }

    #[test]
    fn test_classify_other_shapes_ignored() {
        assert_eq!(classify("1,2,3", now()), LineClass::Ignored);
        assert_eq!(classify("hello", now()), LineClass::Ignored);
        assert_eq!(classify("42", now()), LineClass::Ignored);
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let record = TelemetryRecord::from_polar(10.0, 0.0, now());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["distance"], 10.0);
        assert_eq!(json["angleDegrees"], 0.0);
        assert_eq!(json["x"], 10.0);
        assert_eq!(json["y"], 0.0);
        assert_eq!(json["capturedAt"], "2024-05-01T12:00:00Z");
    }
}
