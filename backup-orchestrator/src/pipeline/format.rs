//! Human-readable byte sizes, shared by responses and error messages.
//!
//! Binary units throughout: the same table is used to format estimates and to
//! convert `df -h` style figures ("12G") back to bytes, so a formatted size
//! round-trips through the parser within display rounding.

use crate::error::PipelineError;

const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// Format a byte count with two decimals, e.g. `1073741824` -> `"1.00 GB"`.
/// Zero formats as `"0 B"`.
pub fn format_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0 B".to_string();
    }
    let mut size = bytes as f64;
    let mut idx = 0;
    while size >= 1024.0 && idx < UNITS.len() - 1 {
        size /= 1024.0;
        idx += 1;
    }
    format!("{:.2} {}", size, UNITS[idx])
}

/// Convert a human-readable size back to bytes.
///
/// Accepts both the abbreviated `df` forms ("12G", "500K") and the formatted
/// forms this crate emits ("5.00 GB"). A bare number is taken as bytes.
pub fn parse_size(input: &str) -> Result<u64, PipelineError> {
    let s = input.trim().to_ascii_uppercase();
    if s.is_empty() {
        return Err(PipelineError::DiskQueryParse("empty size string".into()));
    }

    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| PipelineError::DiskQueryParse(format!("invalid size format: '{input}'")))?;

    let multiplier: u64 = match unit.trim() {
        "" | "B" | "BYTES" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024u64.pow(2),
        "G" | "GB" => 1024u64.pow(3),
        "T" | "TB" => 1024u64.pow(4),
        other => {
            return Err(PipelineError::DiskQueryParse(format!(
                "unknown size unit '{other}' in '{input}'"
            )))
        }
    };

    Ok((value * multiplier as f64).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_formats_without_units_math() {
        assert_eq!(format_size(0), "0 B");
    }

    #[test]
    fn formats_each_unit_band() {
        assert_eq!(format_size(512), "512.00 B");
        assert_eq!(format_size(2048), "2.00 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_size(1073741824), "1.00 GB");
        assert_eq!(format_size(3 * 1024u64.pow(4)), "3.00 TB");
    }

    #[test]
    fn caps_at_terabytes() {
        assert_eq!(format_size(2048 * 1024u64.pow(4)), "2048.00 TB");
    }

    #[test]
    fn parses_df_style_figures() {
        assert_eq!(parse_size("12G").unwrap(), 12 * 1024u64.pow(3));
        assert_eq!(parse_size("500K").unwrap(), 500 * 1024);
        assert_eq!(parse_size("1.5M").unwrap(), (1.5 * 1024.0 * 1024.0) as u64);
        assert_eq!(parse_size("973").unwrap(), 973);
    }

    #[test]
    fn round_trips_formatted_sizes() {
        assert_eq!(parse_size("1.00 GB").unwrap(), 1073741824);
        assert_eq!(parse_size("5.00 GB").unwrap(), 5 * 1024u64.pow(3));
        assert_eq!(parse_size(&format_size(2048)).unwrap(), 2048);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("12X").is_err());
        assert!(parse_size("..G").is_err());
    }
}
