//! Ternary low-rank adapters with straight-through gradients.
//!
//! A `TLoraAdapter` wraps a base linear unit with two factors: the
//! down-projection stays full precision, the up-projection is ternarised on
//! every use with a fixed threshold. The up factor starts at zero, so a
//! freshly attached adapter is a no-op until training moves it.

use candle_core::{DType, Result as CandleResult, Shape, Tensor, Var};
use candle_nn::init::DEFAULT_KAIMING_UNIFORM;
use candle_nn::Dropout;
use serde::{Deserialize, Serialize};

use ternify_common::{Result, TernifyError};

use crate::module::LinearUnit;
use crate::quantize::{matmul_reshape, ternarize_ste};

/// Threshold applied to the up-projection factor at every forward pass.
/// Fixed by design; not calibrated per instance.
const UP_THRESHOLD: f64 = 0.05;

/// Adapter hyper-parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TLoraConfig {
    /// Adapter rank.
    #[serde(default = "default_rank")]
    pub r: usize,
    /// Numerator of the fixed output scale (`alpha / r`).
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Dropout probability applied to the adapter input.
    #[serde(default)]
    pub dropout: f32,
}

fn default_rank() -> usize {
    8
}
fn default_alpha() -> f64 {
    16.0
}

impl Default for TLoraConfig {
    fn default() -> Self {
        Self {
            r: default_rank(),
            alpha: default_alpha(),
            dropout: 0.0,
        }
    }
}

/// Ternary LoRA adapter around a shared base linear unit.
///
/// The base is not owned: it is a `LinearUnit` clone whose `Var`s alias the
/// originals, so [`merge`](Self::merge) and [`unmerge`](Self::unmerge) are
/// visible through every other handle to the same unit (the tree node
/// included). The shared storage lives as long as any handle does.
#[derive(Debug)]
pub struct TLoraAdapter {
    base: LinearUnit,
    down: Var,
    up: Var,
    scale: f64,
    dropout: Dropout,
    up_threshold: Tensor,
    config: TLoraConfig,
}

impl TLoraAdapter {
    /// Wrap `base` with fresh factors: down-projection `(r, in)` with
    /// fan-in-aware init, up-projection `(out, r)` zero-initialised so the
    /// adapter contributes nothing at attachment time.
    ///
    /// Dimension problems are construction-time failures, never deferred to
    /// the forward pass.
    pub fn new(base: LinearUnit, config: &TLoraConfig) -> Result<Self> {
        if config.r == 0 {
            return Err(TernifyError::invalid_config("adapter rank must be >= 1"));
        }
        let (in_features, out_features) = (base.in_features(), base.out_features());
        if config.r > in_features.min(out_features) {
            return Err(TernifyError::shape_mismatch(
                format!("rank <= min({in_features}, {out_features})"),
                format!("rank {}", config.r),
            ));
        }
        if !(0.0..1.0).contains(&config.dropout) {
            return Err(TernifyError::invalid_config(format!(
                "dropout must be in [0, 1), got {}",
                config.dropout
            )));
        }
        let device = base.weight().device().clone();
        let down = DEFAULT_KAIMING_UNIFORM.var(
            Shape::from((config.r, in_features)),
            DType::F32,
            &device,
        )?;
        let up = Var::zeros((out_features, config.r), DType::F32, &device)?;
        let up_threshold = Tensor::full(UP_THRESHOLD as f32, (out_features, 1), &device)?;
        Ok(Self {
            base,
            down,
            up,
            scale: config.alpha / config.r as f64,
            dropout: Dropout::new(config.dropout),
            up_threshold,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &TLoraConfig {
        &self.config
    }

    /// Fixed output scale, `alpha / r`, set once at construction.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn base(&self) -> &LinearUnit {
        &self.base
    }

    pub fn feature_counts(&self) -> (usize, usize) {
        (self.base.in_features(), self.base.out_features())
    }

    /// Down-projection factor, `(r, in_features)`.
    pub fn down(&self) -> &Var {
        &self.down
    }

    /// Up-projection factor, `(out_features, r)`. Full-precision storage;
    /// ternarised on every use.
    pub fn up(&self) -> &Var {
        &self.up
    }

    /// The factors an optimiser should update. The base weight is frozen.
    pub fn trainable_vars(&self) -> Vec<Var> {
        vec![self.down.clone(), self.up.clone()]
    }

    /// `base(x) + scale · (dropout(x) @ downᵀ) @ ternarize(up)ᵀ`.
    ///
    /// The up factor goes through the straight-through ternariser, so in
    /// training both factors receive gradients even though the forward value
    /// is a hard {-1, 0, +1} matrix.
    pub fn forward(&self, x: &Tensor, train: bool) -> CandleResult<Tensor> {
        let base_out = self.base.forward(x)?;
        let dropped = self.dropout.forward(x, train)?;
        let hidden = matmul_reshape(&dropped, &self.down.as_tensor().t()?)?;
        let up_ternary = ternarize_ste(self.up.as_tensor(), &self.up_threshold)?;
        let adapted = matmul_reshape(&hidden, &up_ternary.t()?)?;
        base_out + &adapted.affine(self.scale, 0.0)?
    }

    /// Fold `scale · (up @ down)` into the base weight in place.
    pub fn merge(&self) -> Result<()> {
        let update = self.low_rank_update()?;
        let merged = (self.base.weight().as_tensor() + &update)?;
        self.base.weight().set(&merged)?;
        Ok(())
    }

    /// Subtract the low-rank update back out of the base weight.
    ///
    /// The update is recomputed from the *current* factors, not cached at
    /// merge time: if the factors change between `merge` and `unmerge`, the
    /// pre-merge weight is NOT restored. An immediate unmerge after merge
    /// round-trips within floating tolerance.
    pub fn unmerge(&self) -> Result<()> {
        let update = self.low_rank_update()?;
        let restored = (self.base.weight().as_tensor() - &update)?;
        self.base.weight().set(&restored)?;
        Ok(())
    }

    fn low_rank_update(&self) -> CandleResult<Tensor> {
        self.up
            .as_tensor()
            .matmul(self.down.as_tensor())?
            .affine(self.scale, 0.0)?
            .to_dtype(self.base.weight().dtype())
    }
}

impl Clone for TLoraAdapter {
    fn clone(&self) -> Self {
        Self {
            base: self.base.clone(),
            down: self.down.clone(),
            up: self.up.clone(),
            scale: self.scale,
            dropout: Dropout::new(self.config.dropout),
            up_threshold: self.up_threshold.clone(),
            config: self.config.clone(),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
