//! Destination free-space verification.
//!
//! For remote destinations this must run, and pass, before any transfer
//! begins; skipping it risks an unrecoverable mid-transfer disk-full failure,
//! so a malformed disk-usage reply is a hard error rather than a pass.
//! Local destinations perform no check.

use serde::Serialize;

use crate::error::PipelineError;
use crate::pipeline::format::{format_size, parse_size};
use crate::remote::{RemoteCommand, RemoteShell};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Sufficient,
    Insufficient,
}

#[derive(Debug, Clone, Serialize)]
pub struct CapacityCheck {
    pub required_bytes: u64,
    pub available_bytes: u64,
    pub required: String,
    pub available: String,
    pub verdict: Verdict,
}

impl CapacityCheck {
    pub fn evaluate(required_bytes: u64, available_bytes: u64) -> Self {
        let verdict = if available_bytes < required_bytes {
            Verdict::Insufficient
        } else {
            Verdict::Sufficient
        };
        Self {
            required_bytes,
            available_bytes,
            required: format_size(required_bytes),
            available: format_size(available_bytes),
            verdict,
        }
    }

    pub fn ensure_sufficient(&self) -> Result<(), PipelineError> {
        match self.verdict {
            Verdict::Sufficient => Ok(()),
            Verdict::Insufficient => Err(PipelineError::InsufficientSpace {
                required: self.required.clone(),
                available: self.available.clone(),
            }),
        }
    }
}

/// Extract the value under the `Avail` header from `df -h` output. The column
/// is located by header name, not fixed index, to tolerate column-order
/// variation between platforms.
pub fn parse_available_column(output: &str) -> Result<String, PipelineError> {
    let mut lines = output.lines().filter(|l| !l.trim().is_empty());
    let header = lines
        .next()
        .ok_or_else(|| PipelineError::DiskQueryParse("empty disk usage output".into()))?;
    let values = lines.next().ok_or_else(|| {
        PipelineError::DiskQueryParse("disk usage output has fewer than two lines".into())
    })?;

    let idx = header
        .split_whitespace()
        .position(|h| h == "Avail")
        .ok_or_else(|| {
            PipelineError::DiskQueryParse("no 'Avail' column in disk usage output".into())
        })?;

    values
        .split_whitespace()
        .nth(idx)
        .map(str::to_string)
        .ok_or_else(|| PipelineError::DiskQueryParse("'Avail' column has no value".into()))
}

/// Query free space at `path` over the given session and compare it to the
/// required byte count.
pub fn check_remote(
    shell: &dyn RemoteShell,
    path: &str,
    required_bytes: u64,
) -> Result<CapacityCheck, PipelineError> {
    let out = shell.exec(&RemoteCommand::new("df").arg("-h").arg(path))?;
    if !out.success() {
        return Err(PipelineError::DiskQueryParse(format!(
            "disk usage query failed: {}",
            out.stderr.trim()
        )));
    }

    let available = parse_size(&parse_available_column(&out.stdout)?)?;
    Ok(CapacityCheck::evaluate(required_bytes, available))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DF_OUTPUT: &str = "\
Filesystem      Size  Used Avail Use% Mounted on
/dev/sda1       100G   88G   12G  89% /backups
";

    #[test]
    fn finds_avail_by_header_name() {
        assert_eq!(parse_available_column(DF_OUTPUT).unwrap(), "12G");
    }

    #[test]
    fn tolerates_reordered_columns() {
        let reordered = "\
Filesystem      Avail  Size  Used Use% Mounted on
/dev/sda1         3T   10T    7T  70% /backups
";
        assert_eq!(parse_available_column(reordered).unwrap(), "3T");
    }

    #[test]
    fn missing_avail_column_is_a_hard_error() {
        let bad = "\
Filesystem      Size  Used Use% Mounted on
/dev/sda1       100G   88G  89% /backups
";
        assert!(matches!(
            parse_available_column(bad),
            Err(PipelineError::DiskQueryParse(_))
        ));
    }

    #[test]
    fn short_output_is_a_hard_error() {
        assert!(parse_available_column("").is_err());
        assert!(parse_available_column("Filesystem Size Used Avail\n").is_err());
    }

    #[test]
    fn verdict_tracks_comparison() {
        let check = CapacityCheck::evaluate(200, 100);
        assert_eq!(check.verdict, Verdict::Insufficient);
        assert!(check.ensure_sufficient().is_err());

        let check = CapacityCheck::evaluate(100, 100);
        assert_eq!(check.verdict, Verdict::Sufficient);
        assert!(check.ensure_sufficient().is_ok());
    }

    #[test]
    fn insufficient_error_carries_formatted_sizes() {
        let check = CapacityCheck::evaluate(5 * 1024u64.pow(3), 2 * 1024u64.pow(3));
        match check.ensure_sufficient() {
            Err(PipelineError::InsufficientSpace {
                required,
                available,
            }) => {
                assert_eq!(required, "5.00 GB");
                assert_eq!(available, "2.00 GB");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
