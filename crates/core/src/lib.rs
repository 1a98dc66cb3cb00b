//! # ternify-core — The Mathematical Engine
//!
//! Every compute primitive needed to ternarise, calibrate, and adapt a
//! trained network lives in this crate:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`quantize`] | `ternarize`, the STE variant, matmul helpers |
//! | [`bitlinear`] | `BitLinear` — ternary linear with per-row scale/threshold |
//! | [`module`] | `ModuleNode` tree, kind tags, dotted-path resolution |
//! | [`calibrate`] | per-row scale/threshold/error from weight statistics |
//! | [`tlora`] | `TLoraAdapter` — ternary low-rank adapter with merge/unmerge |
//!
//! ## Design principles
//!
//! 1. **Pure Rust hot path.** Everything goes through `candle-core`/`candle-nn`.
//! 2. **Recompute, don't cache.** Ternary weights are derived from the latent
//!    weight and threshold on every forward pass; only scale and threshold
//!    are stored.
//! 3. **Deterministic.** Same weights + same thresholds = same ternary values.

pub mod bitlinear;
pub mod calibrate;
pub mod module;
pub mod quantize;
pub mod tlora;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use bitlinear::{BitLinear, BitLinearState, DEFAULT_THRESHOLD};
pub use calibrate::{calibrate_tree, calibrate_unit, CalibrationResult};
pub use module::{
    resolve_parent_mut, visit, EmbeddingUnit, LinearUnit, ModuleKind, ModuleNode, NormUnit,
};
pub use quantize::{matmul_reshape, ternarize, ternarize_ste, ternary_distribution};
pub use tlora::{TLoraAdapter, TLoraConfig};
