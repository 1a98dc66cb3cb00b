//! Demo network description for the pipeline CLI.
//!
//! Serialised as JSON. Every field has a sensible default so a minimal `{}`
//! JSON produces a small working stack of linear blocks. A `NetSpec` only
//! describes the tree shape, not trained weights; the CLI initialises
//! parameters randomly and runs the conversion pipeline over the result.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TernifyError};

/// Description of the demo module tree the CLI builds and converts.
///
/// Produces `blocks.N.{proj, norm}` composites feeding a final `head` linear,
/// optionally preceded by an `embed` table. Backwards-compatible: missing
/// fields fall back to their `#[serde(default)]` values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetSpec {
    /// Input feature dimension.
    #[serde(default = "default_input_dim")]
    pub input_dim: usize,
    /// Hidden width of each block.
    #[serde(default = "default_hidden_dim")]
    pub hidden_dim: usize,
    /// Output dimension of the final head.
    #[serde(default = "default_output_dim")]
    pub output_dim: usize,
    /// Number of `{proj, norm}` blocks between input and head.
    #[serde(default = "default_num_blocks")]
    pub num_blocks: usize,
    /// Attach an RMS norm after each block projection.
    #[serde(default = "default_true")]
    pub use_norm: bool,
    /// Give linear units a bias vector.
    #[serde(default = "default_true")]
    pub use_bias: bool,
    /// Prepend an embedding table (`vocab_size` × `input_dim`). Zero disables.
    #[serde(default)]
    pub vocab_size: usize,
}

// ── Default value functions ─────────────────────────────────────────────────

fn default_input_dim() -> usize {
    16
}
fn default_hidden_dim() -> usize {
    32
}
fn default_output_dim() -> usize {
    8
}
fn default_num_blocks() -> usize {
    2
}
fn default_true() -> bool {
    true
}

// ── Impl ────────────────────────────────────────────────────────────────────

impl Default for NetSpec {
    fn default() -> Self {
        Self {
            input_dim: default_input_dim(),
            hidden_dim: default_hidden_dim(),
            output_dim: default_output_dim(),
            num_blocks: default_num_blocks(),
            use_norm: true,
            use_bias: true,
            vocab_size: 0,
        }
    }
}

impl NetSpec {
    /// Reject zero-sized dimensions before any tensor is allocated.
    pub fn validate(&self) -> Result<()> {
        if self.input_dim == 0 || self.hidden_dim == 0 || self.output_dim == 0 {
            return Err(TernifyError::invalid_config(
                "input_dim, hidden_dim and output_dim must be non-zero",
            ));
        }
        Ok(())
    }

    /// Save spec to a JSON file.
    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load spec from a JSON file.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let spec = serde_json::from_str(&json)?;
        Ok(spec)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_json_round_trip() {
        let spec = NetSpec::default();
        let json = serde_json::to_string(&spec).unwrap();
        let loaded: NetSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(spec.input_dim, loaded.input_dim);
        assert_eq!(spec.hidden_dim, loaded.hidden_dim);
        assert_eq!(spec.num_blocks, loaded.num_blocks);
        assert!(loaded.use_norm);
    }

    #[test]
    fn minimal_json_uses_defaults() {
        let loaded: NetSpec = serde_json::from_str("{}").unwrap();
        assert_eq!(loaded.input_dim, 16);
        assert_eq!(loaded.hidden_dim, 32);
        assert_eq!(loaded.output_dim, 8);
        assert_eq!(loaded.vocab_size, 0);
        assert!(loaded.use_bias);
    }

    #[test]
    fn zero_width_rejected() {
        let spec = NetSpec {
            hidden_dim: 0,
            ..Default::default()
        };
        assert!(spec.validate().is_err());
    }
}
