//! Quantisation primitives: per-row ternarise and its straight-through variant.
//!
//! This module is the mathematical foundation of the workspace. `BitLinear`
//! delegates to [`ternarize`] for the forward pass, and the T-LoRA adapter
//! uses [`ternarize_ste`] so gradients still reach the latent factor.

use candle_core::{DType, Result, Tensor};

// ── Ternarisation ───────────────────────────────────────────────────────────

/// Ternarise a weight tensor against a per-row threshold.
///
/// ```text
/// mask[i][j]    = |W[i][j]| ≥ T[i]
/// ternary[i][j] = sign(W[i][j]) · mask[i][j]
/// ```
///
/// `threshold` has shape `(rows, 1)` and broadcasts across columns. Candle's
/// `sign(0) = 0`, so a zero weight ternarises to zero regardless of the
/// threshold. Returns `(ternary, mask)`, both F32; the mask holds 1.0 where
/// the weight survived and 0.0 where it was zeroed.
///
/// The comparison is a hard gate with no gradient; callers that train through
/// this must use [`ternarize_ste`].
pub fn ternarize(w: &Tensor, threshold: &Tensor) -> Result<(Tensor, Tensor)> {
    let abs_w = w.abs()?;
    let mask = abs_w
        .broadcast_sub(threshold)?
        .ge(0f64)?
        .to_dtype(DType::F32)?;
    let ternary = (w.sign()? * &mask)?;
    Ok((ternary, mask))
}

/// Ternarise with a straight-through estimator.
///
/// The trick: `q.detach() + (w - w.detach())`. In the forward pass the
/// residual is zero, so the output equals the hard ternary value. In the
/// backward pass the residual contributes an identity gradient, so
/// `∂loss/∂w` flows as if the quantiser were the identity — the mask is
/// treated as locally constant.
pub fn ternarize_ste(w: &Tensor, threshold: &Tensor) -> Result<Tensor> {
    let (ternary, _mask) = ternarize(w, threshold)?;
    let residual = (w - &w.detach())?;
    ternary.detach() + &residual
}

// ── Debug helpers ───────────────────────────────────────────────────────────

/// Count {-1, 0, +1} occurrences after ternarising `w` against `threshold`.
pub fn ternary_distribution(w: &Tensor, threshold: &Tensor) -> Result<(u64, u64, u64)> {
    let (ternary, _mask) = ternarize(w, threshold)?;
    let flat = ternary.flatten_all()?.to_vec1::<f32>()?;
    let (mut n_neg, mut n_zero, mut n_pos) = (0u64, 0u64, 0u64);
    for &v in &flat {
        if v < -0.5 {
            n_neg += 1;
        } else if v > 0.5 {
            n_pos += 1;
        } else {
            n_zero += 1;
        }
    }
    Ok((n_neg, n_zero, n_pos))
}

// ── Tensor helpers ──────────────────────────────────────────────────────────

/// Reshape `x` to 2-D, multiply by `w_t`, reshape back.
///
/// Handles (B, K), (B, T, K), and arbitrary leading dims.
pub fn matmul_reshape(x: &Tensor, w_t: &Tensor) -> Result<Tensor> {
    let dims = x.dims();
    let out_dim = w_t.dim(1)?;
    if dims.len() == 2 {
        return x.matmul(w_t);
    }
    let last = dims[dims.len() - 1];
    let lead: usize = dims[..dims.len() - 1].iter().product();
    let y = x.reshape((lead, last))?.matmul(w_t)?;
    let mut out_shape: Vec<usize> = dims[..dims.len() - 1].to_vec();
    out_shape.push(out_dim);
    y.reshape(out_shape.as_slice())
}

// ── Tests ───────────────────────────────────────────────────────────────────
