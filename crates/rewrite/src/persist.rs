//! Persistence of rewrite artefacts as ordered JSON documents.
//!
//! One document per pipeline run. Both writers key entries by module path
//! and keep insertion order, so a saved document reads in the same order the
//! tree was traversed.

use std::path::Path;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use ternify_common::Result;
use ternify_core::calibrate::CalibrationResult;

use crate::swap::Manifest;

/// Write the conversion manifest as pretty-printed JSON.
pub fn save_manifest(manifest: &Manifest, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(manifest)?;
    std::fs::write(path, json)?;
    tracing::info!(entries = manifest.len(), path = %path.display(), "Manifest saved");
    Ok(())
}

struct ScaleDump<'a>(&'a [(String, Vec<f32>)]);

impl Serialize for ScaleDump<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (path, scales) in self.0 {
            map.serialize_entry(path, scales)?;
        }
        map.end()
    }
}

/// Write calibration results as a JSON mapping from module path to its scale
/// vector. Thresholds and reconstruction errors are not persisted.
pub fn save_calibration(results: &[(String, CalibrationResult)], path: &Path) -> Result<()> {
    let mut entries: Vec<(String, Vec<f32>)> = Vec::with_capacity(results.len());
    for (module_path, result) in results {
        entries.push((module_path.clone(), result.scales.to_vec1::<f32>()?));
    }
    let json = serde_json::to_string_pretty(&ScaleDump(&entries))?;
    std::fs::write(path, json)?;
    tracing::info!(entries = results.len(), path = %path.display(), "Calibration saved");
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────
