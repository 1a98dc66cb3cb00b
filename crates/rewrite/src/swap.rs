//! Linear → BitLinear conversion over a module tree.
//!
//! The pass runs in two phases. First a pre-order walk collects every path
//! the policy accepts; then each path is resolved to its parent composite and
//! the child slot is overwritten with the replacement. The manifest is built
//! in walk order, one record per conversion, and is the authoritative account
//! of what happened — there is no rollback on mid-pass failure.

use std::collections::HashSet;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use ternify_common::{Result, TernifyError};
use ternify_core::bitlinear::{BitLinear, BitLinearState};
use ternify_core::module::{resolve_parent_mut, visit, LinearUnit, ModuleKind, ModuleNode};

// ── Policy ──────────────────────────────────────────────────────────────────

/// Which kinds the conversion pass touches.
///
/// The block-set is checked first and wins over the allow-set; a node must
/// then satisfy the structural linear-capable contract (in/out feature
/// counts). `BitLinear` is deliberately absent from the default allow-set, so
/// re-running the pass over its own output converts nothing. Callers who
/// allow-list `BitLinear` themselves own the resulting double conversion.
#[derive(Debug, Clone)]
pub struct SwapPolicy {
    pub allow: HashSet<ModuleKind>,
    pub block: HashSet<ModuleKind>,
    /// Copy the source unit's bias into the replacement.
    pub include_bias: bool,
}

impl Default for SwapPolicy {
    fn default() -> Self {
        Self {
            allow: HashSet::from([ModuleKind::LinearCapable]),
            block: HashSet::from([ModuleKind::EmbeddingLike, ModuleKind::NormLike]),
            include_bias: true,
        }
    }
}

impl SwapPolicy {
    /// Block first, then allow, then the structural shape contract.
    pub fn convertible(&self, node: &ModuleNode) -> bool {
        let kind = node.kind();
        if self.block.contains(&kind) {
            return false;
        }
        if !self.allow.contains(&kind) {
            return false;
        }
        node.feature_counts().is_some()
    }
}

// ── Manifest ────────────────────────────────────────────────────────────────

/// Immutable record of one conversion.
#[derive(Debug, Clone)]
pub struct SwapRecord {
    pub module_path: String,
    pub original: String,
    pub replacement: String,
    /// Snapshot of the replacement's per-row scale at conversion time.
    pub scale: Vec<f32>,
}

/// Ordered, path-keyed record of a conversion pass. Entry order is traversal
/// order; paths are unique by construction (each slot is converted once).
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    records: Vec<SwapRecord>,
}

impl Manifest {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&SwapRecord> {
        self.records.iter().find(|r| r.module_path == path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SwapRecord> {
        self.records.iter()
    }
}

#[derive(Serialize)]
struct ManifestEntry<'a> {
    original: &'a str,
    replacement: &'a str,
    scale: &'a [f32],
}

/// Serialises as a JSON object keyed by module path, entries in traversal
/// order.
impl Serialize for Manifest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.records.len()))?;
        for record in &self.records {
            map.serialize_entry(
                &record.module_path,
                &ManifestEntry {
                    original: &record.original,
                    replacement: &record.replacement,
                    scale: &record.scale,
                },
            )?;
        }
        map.end()
    }
}

// ── Conversion ──────────────────────────────────────────────────────────────

/// Build a BitLinear from a full-precision linear unit: weight becomes
/// `sign(W)`, scale the per-row mean absolute weight, threshold the default.
pub fn linear_to_bitlinear(unit: &LinearUnit, include_bias: bool) -> Result<BitLinear> {
    let weight = unit.weight().as_tensor();
    let device = weight.device().clone();
    let bias = if include_bias {
        unit.bias().map(|b| b.as_tensor().clone())
    } else {
        None
    };
    let mut bit = BitLinear::new(
        unit.in_features(),
        unit.out_features(),
        bias.is_some(),
        &device,
    )?;
    let state = BitLinearState {
        ternary_weight: weight.sign()?,
        scale: weight.abs()?.mean(1)?,
        bias,
    };
    bit.load_state(&state)?;
    Ok(bit)
}

/// Convert every policy-eligible node in the tree, in place, and return the
/// manifest. Replacement is structural: the parent's slot for the child is
/// overwritten; the tree is never copied.
pub fn convert_tree(root: &mut ModuleNode, policy: &SwapPolicy) -> Result<Manifest> {
    let mut eligible: Vec<String> = Vec::new();
    visit(root, |path, node| {
        if policy.convertible(node) {
            eligible.push(path.to_string());
        }
    });

    let mut manifest = Manifest::default();
    for path in eligible {
        let (parent, local) = resolve_parent_mut(root, &path)?;
        let slot = parent
            .child_mut(&local)
            .ok_or_else(|| TernifyError::UnresolvedPath(path.clone()))?;
        let ModuleNode::Linear(unit) = &*slot else {
            // The collection walk saw a convertible node here; anything else
            // means the tree changed underneath us.
            return Err(TernifyError::UnresolvedPath(path.clone()));
        };
        let original = slot.kind();
        let replacement = linear_to_bitlinear(unit, policy.include_bias)?;
        let record = SwapRecord {
            module_path: path.clone(),
            original: original.as_str().to_string(),
            replacement: ModuleKind::BitLinear.as_str().to_string(),
            scale: replacement.scale().to_vec1::<f32>()?,
        };
        *slot = ModuleNode::BitLinear(replacement);
        tracing::debug!(path = %record.module_path, "converted linear unit");
        manifest.records.push(record);
    }

    tracing::info!(converted = manifest.len(), "Swap pass complete");
    Ok(manifest)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor, Var};
    use ternify_core::module::NormUnit;

    fn linear_node(in_features: usize, out_features: usize) -> ModuleNode {
        let dev = Device::Cpu;
        ModuleNode::Linear(LinearUnit::new(in_features, out_features, true, &dev).unwrap())
    }

    fn two_level_tree() -> ModuleNode {
        let dev = Device::Cpu;
        ModuleNode::Composite(vec![
            ("linear_a".to_string(), linear_node(4, 2)),
            (
                "norm_b".to_string(),
                ModuleNode::Norm(NormUnit::new(2, 1e-5, &dev).unwrap()),
            ),
        ])
    }

    #[test]
    fn converts_linear_and_skips_blocked() {
        let mut tree = two_level_tree();
        let manifest = convert_tree(&mut tree, &SwapPolicy::default()).unwrap();
        assert_eq!(manifest.len(), 1);
        let record = manifest.get("linear_a").unwrap();
        assert_eq!(record.original, "Linear");
        assert_eq!(record.replacement, "BitLinear");
        assert_eq!(tree.child_mut("linear_a").unwrap().kind(), ModuleKind::BitLinear);
        // The blocked node is untouched and keeps its kind.
        assert_eq!(tree.child_mut("norm_b").unwrap().kind(), ModuleKind::NormLike);
    }

    #[test]
    fn second_pass_converts_nothing() {
        let mut tree = two_level_tree();
        let first = convert_tree(&mut tree, &SwapPolicy::default()).unwrap();
        assert_eq!(first.len(), 1);
        let second = convert_tree(&mut tree, &SwapPolicy::default()).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn scale_is_row_mean_abs_of_original() {
        let dev = Device::Cpu;
        let weight = Tensor::new(&[[0.9f32, -0.2, 0.05]], &dev).unwrap();
        let unit = LinearUnit::from_parts(Var::from_tensor(&weight).unwrap(), None).unwrap();
        let mut tree = ModuleNode::Composite(vec![("proj".to_string(), ModuleNode::Linear(unit))]);
        let manifest = convert_tree(&mut tree, &SwapPolicy::default()).unwrap();
        let record = manifest.get("proj").unwrap();
        // mean(|0.9|, |0.2|, |0.05|) = 0.38333...
        assert!((record.scale[0] - 1.15 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn converted_weight_is_sign_of_original() {
        let dev = Device::Cpu;
        let weight = Tensor::new(&[[0.9f32, -0.2, 0.0]], &dev).unwrap();
        let unit = LinearUnit::from_parts(Var::from_tensor(&weight).unwrap(), None).unwrap();
        let mut tree = ModuleNode::Composite(vec![("proj".to_string(), ModuleNode::Linear(unit))]);
        convert_tree(&mut tree, &SwapPolicy::default()).unwrap();
        let ModuleNode::BitLinear(bit) = tree.child_mut("proj").unwrap() else {
            panic!("proj was not converted");
        };
        assert_eq!(
            bit.weight().as_tensor().to_vec2::<f32>().unwrap(),
            vec![vec![1.0, -1.0, 0.0]]
        );
    }

    #[test]
    fn manifest_covers_all_eligible_nodes_in_order() {
        let mut tree = ModuleNode::Composite(vec![(
            "blocks".to_string(),
            ModuleNode::Composite(vec![
                (
                    "0".to_string(),
                    ModuleNode::Composite(vec![("proj".to_string(), linear_node(4, 4))]),
                ),
                (
                    "1".to_string(),
                    ModuleNode::Composite(vec![("proj".to_string(), linear_node(4, 4))]),
                ),
            ]),
        )]);
        let manifest = convert_tree(&mut tree, &SwapPolicy::default()).unwrap();
        let paths: Vec<_> = manifest.iter().map(|r| r.module_path.as_str()).collect();
        assert_eq!(paths, vec!["blocks.0.proj", "blocks.1.proj"]);
    }

    #[test]
    fn block_set_wins_over_allow_set() {
        let mut policy = SwapPolicy::default();
        policy.allow.insert(ModuleKind::NormLike);
        policy.block.insert(ModuleKind::NormLike);
        let mut tree = two_level_tree();
        let manifest = convert_tree(&mut tree, &policy).unwrap();
        assert_eq!(manifest.len(), 1);
        assert_eq!(tree.child_mut("norm_b").unwrap().kind(), ModuleKind::NormLike);
    }

    #[test]
    fn include_bias_false_drops_bias() {
        let mut tree = ModuleNode::Composite(vec![("proj".to_string(), linear_node(4, 2))]);
        let policy = SwapPolicy {
            include_bias: false,
            ..Default::default()
        };
        convert_tree(&mut tree, &policy).unwrap();
        let ModuleNode::BitLinear(bit) = tree.child_mut("proj").unwrap() else {
            panic!("proj was not converted");
        };
        assert!(bit.bias().is_none());
    }

    #[test]
    fn manifest_serialises_keyed_by_path() {
        let mut tree = two_level_tree();
        let manifest = convert_tree(&mut tree, &SwapPolicy::default()).unwrap();
        let json = serde_json::to_string(&manifest).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let entry = &value["linear_a"];
        assert_eq!(entry["original"], "Linear");
        assert_eq!(entry["replacement"], "BitLinear");
        assert_eq!(entry["scale"].as_array().unwrap().len(), 2);
    }
}
