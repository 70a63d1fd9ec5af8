use std::fs;
use std::path::Path;

use crate::error::EngineError;

/// Check that a time axis is non-empty, finite and strictly increasing.
pub fn validate_time_axis(times: &[f64]) -> Result<(), EngineError> {
    if times.is_empty() {
        return Err(EngineError::config("time series is empty"));
    }
    if let Some(bad) = times.iter().find(|t| !t.is_finite()) {
        return Err(EngineError::config(format!(
            "time series contains non-finite time {}",
            bad
        )));
    }
    if let Some(i) = times.windows(2).position(|w| w[1] <= w[0]) {
        return Err(EngineError::config(format!(
            "time series is not strictly increasing at index {} ({} -> {})",
            i + 1,
            times[i],
            times[i + 1]
        )));
    }
    Ok(())
}

/// Parse two-column `t,value` text. A non-numeric first line is taken as a
/// header; blank lines and lines starting with `#` are skipped.
pub fn parse_time_series(text: &str) -> Result<(Vec<f64>, Vec<f64>), EngineError> {
    let mut times = Vec::new();
    let mut values = Vec::new();

    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut cols = line.split(|c: char| c == ',' || c.is_whitespace()).filter(|s| !s.is_empty());
        let (Some(t), Some(v)) = (cols.next(), cols.next()) else {
            return Err(EngineError::config(format!(
                "line {}: expected two columns",
                line_no + 1
            )));
        };
        match (t.parse::<f64>(), v.parse::<f64>()) {
            (Ok(t), Ok(v)) => {
                times.push(t);
                values.push(v);
            }
            _ if times.is_empty() && line_no == 0 => continue,
            _ => {
                return Err(EngineError::config(format!(
                    "line {}: cannot parse '{}'",
                    line_no + 1,
                    line
                )));
            }
        }
    }

    validate_time_axis(&times)?;
    Ok((times, values))
}

pub fn read_time_series<P: AsRef<Path>>(path: P) -> Result<(Vec<f64>, Vec<f64>), EngineError> {
    let text = fs::read_to_string(path)?;
    parse_time_series(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_and_comments_are_skipped() {
        let (t, v) = parse_time_series("t,value\n# ramp\n0.0, 1.0\n0.5,2.0\n\n1.0 4.0\n").unwrap();
        assert_eq!(t, vec![0.0, 0.5, 1.0]);
        assert_eq!(v, vec![1.0, 2.0, 4.0]);
    }

    #[test]
    fn repeated_time_is_a_configuration_error() {
        let err = parse_time_series("0,1\n1,2\n1,3\n").unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn garbage_after_data_is_rejected() {
        assert!(parse_time_series("0,1\nfoo,bar\n").is_err());
    }
}
