//! # ternify-rewrite — Module-Graph Rewriting
//!
//! The passes that transform a module tree in place:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`swap`] | allow/block policy, linear → BitLinear conversion, `Manifest` |
//! | [`attach`] | T-LoRA adapter attachment over linear-capable nodes |
//! | [`persist`] | manifest / calibration persistence as ordered JSON |
//!
//! Both passes share the same discipline: a pre-order collection walk, then
//! per-path parent resolution and slot replacement. There is no rollback —
//! a pass that fails partway leaves earlier replacements installed, and the
//! manifest records exactly the conversions that happened.

pub mod attach;
pub mod persist;
pub mod swap;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use attach::attach_tlora;
pub use persist::{save_calibration, save_manifest};
pub use swap::{convert_tree, linear_to_bitlinear, Manifest, SwapPolicy, SwapRecord};
