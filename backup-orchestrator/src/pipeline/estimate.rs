//! Per-unit size estimation from backend-reported statistics.

use serde::Serialize;

use crate::backend::{Backend, UnitName};
use crate::error::PipelineError;
use crate::pipeline::format::format_size;

#[derive(Debug, Clone, Serialize)]
pub struct UnitSize {
    pub unit: String,
    pub bytes: u64,
    pub size: String,
}

/// Derived per request, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct SizeEstimate {
    pub units: Vec<UnitSize>,
    pub total_bytes: u64,
    pub total: String,
}

/// Estimate one unit, or every listed unit when none is named.
pub async fn estimate(
    backend: &dyn Backend,
    unit: Option<&UnitName>,
) -> Result<SizeEstimate, PipelineError> {
    let names = match unit {
        Some(u) => vec![u.clone()],
        None => backend.list_units().await?,
    };

    let mut units = Vec::with_capacity(names.len());
    let mut total_bytes: u64 = 0;
    for name in &names {
        let bytes = backend.estimate_size(Some(name)).await?;
        total_bytes += bytes;
        units.push(UnitSize {
            unit: name.to_string(),
            bytes,
            size: format_size(bytes),
        });
    }

    Ok(SizeEstimate {
        units,
        total_bytes,
        total: format_size(total_bytes),
    })
}
