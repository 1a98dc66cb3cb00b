//! Post-training calibration of per-row quantisation parameters.
//!
//! For each linear unit: scale is the mean absolute weight per row, threshold
//! is a fixed quantile of the absolute weights per row, and the reported
//! error is the per-row mean squared gap between the original weight and its
//! scaled ternary reconstruction.
//!
//! Activation samples are accepted and threaded through, but the threshold is
//! derived from the weights alone — the quantile is a fixed policy choice,
//! not fitted to the activations. Callers that need activation-aware
//! thresholds must extend this deliberately.

use candle_core::Tensor;

use ternify_common::{Result, TernifyError};

use crate::module::{visit, LinearUnit, ModuleNode};
use crate::quantize::ternarize;

/// Quantile of |W| used as the per-row ternarisation threshold.
pub const CALIBRATION_QUANTILE: f64 = 0.7;

/// Per-module calibration output. Ephemeral — consumed by the caller, never
/// retained by the layers themselves.
#[derive(Debug, Clone)]
pub struct CalibrationResult {
    /// Per-row scale, shape `(out_features,)`.
    pub scales: Tensor,
    /// Per-row threshold, shape `(out_features,)`.
    pub thresholds: Tensor,
    /// Per-row mean squared reconstruction error, shape `(out_features,)`.
    pub error: Tensor,
}

/// Calibrate a single linear unit against an activation sample.
pub fn calibrate_unit(unit: &LinearUnit, _activations: &Tensor) -> Result<CalibrationResult> {
    let weight = unit.weight().as_tensor();
    let abs_w = weight.abs()?;
    let scales = abs_w.mean(1)?;
    let thresholds = row_quantile(&abs_w, CALIBRATION_QUANTILE)?;
    let (ternary, _mask) = ternarize(weight, &thresholds)?;
    let recon = ternary.broadcast_mul(&scales.unsqueeze(1)?)?;
    let error = (weight - &recon)?.sqr()?.mean(1)?;
    Ok(CalibrationResult {
        scales,
        thresholds: thresholds.squeeze(1)?,
        error,
    })
}

/// Calibrate every linear-capable node in the tree.
///
/// Fails with [`TernifyError::EmptyCalibrationData`] when `samples` is empty.
/// Every node is calibrated against the first sample — per-layer distinct
/// activations are not required. Results come back in traversal order, one
/// entry per eligible node.
pub fn calibrate_tree(
    root: &ModuleNode,
    samples: &[Tensor],
) -> Result<Vec<(String, CalibrationResult)>> {
    if samples.is_empty() {
        return Err(TernifyError::EmptyCalibrationData);
    }
    let mut units: Vec<(String, &LinearUnit)> = Vec::new();
    visit(root, |path, node| {
        if let ModuleNode::Linear(unit) = node {
            units.push((path.to_string(), unit));
        }
    });
    let mut results = Vec::with_capacity(units.len());
    for (path, unit) in units {
        let result = calibrate_unit(unit, &samples[0])?;
        results.push((path, result));
    }
    Ok(results)
}

/// Per-row quantile of a 2-D tensor, linearly interpolated between order
/// statistics. Returns shape `(rows, 1)` so the result broadcasts like a
/// threshold vector.
fn row_quantile(values: &Tensor, q: f64) -> Result<Tensor> {
    let rows = values.to_vec2::<f32>()?;
    let mut out = Vec::with_capacity(rows.len());
    for mut row in rows {
        row.sort_by(|a, b| a.total_cmp(b));
        let n = row.len();
        if n == 1 {
            out.push(row[0]);
            continue;
        }
        let pos = q * (n - 1) as f64;
        let lo = pos.floor() as usize;
        let hi = pos.ceil() as usize;
        let frac = (pos - lo as f64) as f32;
        out.push(row[lo] + (row[hi] - row[lo]) * frac);
    }
    let n_rows = out.len();
    Ok(Tensor::from_vec(out, (n_rows, 1), values.device())?)
}

// ── Tests ───────────────────────────────────────────────────────────────────
