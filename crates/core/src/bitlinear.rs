//! BitLinear: a linear layer with ternary weights and per-row scaling.
//!
//! The layer stores a full-precision-shaped latent weight plus two per-row
//! buffers, `scale` and `threshold`. Every forward pass re-derives the
//! ternary weight from the latent weight and threshold; nothing quantised is
//! cached. Scale and threshold are only touched by conversion or calibration.

use candle_core::{DType, Device, Result, Shape, Tensor, Var};
use candle_nn::init::DEFAULT_KAIMING_UNIFORM;
use candle_nn::Init;

use ternify_common::TernifyError;

use crate::quantize::{matmul_reshape, ternarize};

/// Per-row threshold a fresh BitLinear starts with.
pub const DEFAULT_THRESHOLD: f64 = 0.05;

/// Externally supplied parameters for [`BitLinear::load_state`]: a ternary
/// weight, a per-row scale, and an optional bias.
#[derive(Debug, Clone)]
pub struct BitLinearState {
    pub ternary_weight: Tensor,
    pub scale: Tensor,
    pub bias: Option<Tensor>,
}

/// Linear layer with ternary weights and per-row scaling.
///
/// Forward contract:
///
/// ```text
/// output = x @ (ternarize(weight, threshold) ⊙ scale_per_row)ᵀ + bias
/// ```
#[derive(Debug, Clone)]
pub struct BitLinear {
    weight: Var,
    scale: Tensor,
    threshold: Tensor,
    bias: Option<Var>,
    in_features: usize,
    out_features: usize,
}

impl BitLinear {
    /// Construct with fan-in-aware Kaiming-uniform weights, unit scales, and
    /// the default threshold on every row.
    pub fn new(in_features: usize, out_features: usize, bias: bool, device: &Device) -> Result<Self> {
        let weight = DEFAULT_KAIMING_UNIFORM.var(
            Shape::from((out_features, in_features)),
            DType::F32,
            device,
        )?;
        let bias = if bias {
            let bound = 1.0 / (in_features as f64).sqrt();
            Some(Init::Uniform { lo: -bound, up: bound }.var(
                Shape::from(out_features),
                DType::F32,
                device,
            )?)
        } else {
            None
        };
        let scale = Tensor::ones(out_features, DType::F32, device)?;
        let threshold = Tensor::full(DEFAULT_THRESHOLD as f32, (out_features, 1), device)?;
        Ok(Self {
            weight,
            scale,
            threshold,
            bias,
            in_features,
            out_features,
        })
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// Latent weight, shape `(out_features, in_features)`.
    pub fn weight(&self) -> &Var {
        &self.weight
    }

    /// Per-row scale, shape `(out_features,)`.
    pub fn scale(&self) -> &Tensor {
        &self.scale
    }

    /// Per-row threshold, shape `(out_features, 1)`.
    pub fn threshold(&self) -> &Tensor {
        &self.threshold
    }

    pub fn bias(&self) -> Option<&Var> {
        self.bias.as_ref()
    }

    /// Install calibrated per-row scale and threshold.
    pub fn set_calibration(&mut self, scale: Tensor, threshold: Tensor) -> ternify_common::Result<()> {
        if scale.dims() != [self.out_features] {
            return Err(TernifyError::shape_mismatch(
                format!("({},)", self.out_features),
                format!("{:?}", scale.dims()),
            ));
        }
        if threshold.dims() != [self.out_features, 1] {
            return Err(TernifyError::shape_mismatch(
                format!("({}, 1)", self.out_features),
                format!("{:?}", threshold.dims()),
            ));
        }
        self.scale = scale;
        self.threshold = threshold;
        Ok(())
    }

    /// Overwrite the weight, scale, and (when both sides have one) bias with
    /// externally supplied values — used when installing converted or
    /// calibrated parameters.
    pub fn load_state(&mut self, state: &BitLinearState) -> ternify_common::Result<()> {
        if state.ternary_weight.dims() != [self.out_features, self.in_features] {
            return Err(TernifyError::shape_mismatch(
                format!("({}, {})", self.out_features, self.in_features),
                format!("{:?}", state.ternary_weight.dims()),
            ));
        }
        if state.scale.dims() != [self.out_features] {
            return Err(TernifyError::shape_mismatch(
                format!("({},)", self.out_features),
                format!("{:?}", state.scale.dims()),
            ));
        }
        self.weight.set(&state.ternary_weight)?;
        self.scale = state.scale.clone();
        if let (Some(bias), Some(new_bias)) = (&self.bias, &state.bias) {
            if new_bias.dims() != [self.out_features] {
                return Err(TernifyError::shape_mismatch(
                    format!("({},)", self.out_features),
                    format!("{:?}", new_bias.dims()),
                ));
            }
            bias.set(new_bias)?;
        }
        Ok(())
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (ternary, _mask) = ternarize(self.weight.as_tensor(), &self.threshold)?;
        let packed = ternary.broadcast_mul(&self.scale.unsqueeze(1)?)?;
        let out = matmul_reshape(x, &packed.t()?)?;
        match &self.bias {
            Some(bias) => out.broadcast_add(bias.as_tensor()),
            None => Ok(out),
        }
    }
}

impl std::fmt::Display for BitLinear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BitLinear(in_features={}, out_features={}, bias={})",
            self.in_features,
            self.out_features,
            self.bias.is_some()
        )
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_shape() {
        let dev = Device::Cpu;
        let layer = BitLinear::new(4, 3, true, &dev).unwrap();
        let x = Tensor::randn(0f32, 1f32, (2, 4), &dev).unwrap();
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.dims(), &[2, 3]);
    }

    #[test]
    fn forward_matches_manual_affine() {
        let dev = Device::Cpu;
        let mut layer = BitLinear::new(3, 1, false, &dev).unwrap();
        let state = BitLinearState {
            ternary_weight: Tensor::new(&[[1f32, -1.0, 0.0]], &dev).unwrap(),
            scale: Tensor::new(&[0.5f32], &dev).unwrap(),
            bias: None,
        };
        layer.load_state(&state).unwrap();
        let x = Tensor::new(&[[2f32, 4.0, 8.0]], &dev).unwrap();
        let y = layer.forward(&x).unwrap();
        // 0.5 * (2 - 4 + 0) = -1
        assert_eq!(y.to_vec2::<f32>().unwrap(), vec![vec![-1.0]]);
    }

    #[test]
    fn new_layer_defaults() {
        let dev = Device::Cpu;
        let layer = BitLinear::new(8, 4, false, &dev).unwrap();
        assert_eq!(layer.scale().to_vec1::<f32>().unwrap(), vec![1.0; 4]);
        let thresholds = layer.threshold().to_vec2::<f32>().unwrap();
        assert_eq!(thresholds, vec![vec![0.05]; 4]);
    }

    #[test]
    fn load_state_rejects_wrong_shape() {
        let dev = Device::Cpu;
        let mut layer = BitLinear::new(4, 2, false, &dev).unwrap();
        let state = BitLinearState {
            ternary_weight: Tensor::zeros((2, 3), DType::F32, &dev).unwrap(),
            scale: Tensor::ones(2, DType::F32, &dev).unwrap(),
            bias: None,
        };
        assert!(layer.load_state(&state).is_err());
    }

    #[test]
    fn set_calibration_replaces_buffers() {
        let dev = Device::Cpu;
        let mut layer = BitLinear::new(4, 2, false, &dev).unwrap();
        let scale = Tensor::new(&[0.2f32, 0.4], &dev).unwrap();
        let threshold = Tensor::new(&[[0.1f32], [0.3]], &dev).unwrap();
        layer.set_calibration(scale, threshold).unwrap();
        assert_eq!(layer.scale().to_vec1::<f32>().unwrap(), vec![0.2, 0.4]);
        assert_eq!(
            layer.threshold().to_vec2::<f32>().unwrap(),
            vec![vec![0.1], vec![0.3]]
        );
    }
}
