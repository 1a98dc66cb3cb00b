//! T-LoRA adapter attachment over a module tree.
//!
//! Walks the tree like the swap pass, wraps every linear-capable node with a
//! fresh adapter, and hands back `(path, adapter)` pairs in traversal order.
//! The returned adapters share their base's `Var` storage with the tree node
//! that now wraps it, so merging through a returned handle is visible in the
//! tree.
//!
//! Converted `BitLinear` nodes carry their own kind and are not wrapped;
//! attachment over a fully converted tree returns an empty list.

use ternify_common::{Result, TernifyError};
use ternify_core::module::{resolve_parent_mut, visit, ModuleNode};
use ternify_core::tlora::{TLoraAdapter, TLoraConfig};

/// Wrap every linear-capable node with a fresh adapter, in place.
pub fn attach_tlora(
    root: &mut ModuleNode,
    config: &TLoraConfig,
) -> Result<Vec<(String, TLoraAdapter)>> {
    let mut eligible: Vec<String> = Vec::new();
    visit(root, |path, node| {
        if matches!(node, ModuleNode::Linear(_)) {
            eligible.push(path.to_string());
        }
    });

    let mut adapters = Vec::with_capacity(eligible.len());
    for path in eligible {
        let (parent, local) = resolve_parent_mut(root, &path)?;
        let slot = parent
            .child_mut(&local)
            .ok_or_else(|| TernifyError::UnresolvedPath(path.clone()))?;
        let ModuleNode::Linear(unit) = &*slot else {
            return Err(TernifyError::UnresolvedPath(path.clone()));
        };
        let adapter = TLoraAdapter::new(unit.clone(), config)?;
        *slot = ModuleNode::Adapter(adapter.clone());
        adapters.push((path, adapter));
    }

    tracing::info!(attached = adapters.len(), "Adapter attachment complete");
    Ok(adapters)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use ternify_core::module::{LinearUnit, ModuleKind, NormUnit};

    use crate::swap::{convert_tree, SwapPolicy};

    fn tree() -> ModuleNode {
        let dev = Device::Cpu;
        ModuleNode::Composite(vec![
            (
                "proj".to_string(),
                ModuleNode::Linear(LinearUnit::new(4, 2, false, &dev).unwrap()),
            ),
            (
                "norm".to_string(),
                ModuleNode::Norm(NormUnit::new(2, 1e-5, &dev).unwrap()),
            ),
            (
                "head".to_string(),
                ModuleNode::Linear(LinearUnit::new(2, 2, false, &dev).unwrap()),
            ),
        ])
    }

    #[test]
    fn wraps_linears_in_traversal_order() {
        let mut tree = tree();
        let adapters = attach_tlora(&mut tree, &TLoraConfig {
            r: 2,
            ..Default::default()
        })
        .unwrap();
        let paths: Vec<_> = adapters.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["proj", "head"]);
        assert_eq!(tree.child_mut("proj").unwrap().kind(), ModuleKind::Adapter);
        assert_eq!(tree.child_mut("norm").unwrap().kind(), ModuleKind::NormLike);
    }

    #[test]
    fn returned_adapter_shares_tree_storage() {
        let dev = Device::Cpu;
        let mut tree = tree();
        let adapters = attach_tlora(&mut tree, &TLoraConfig {
            r: 2,
            ..Default::default()
        })
        .unwrap();
        let (_, adapter) = &adapters[0];
        adapter
            .up()
            .set(&Tensor::ones((2, 2), DType::F32, &dev).unwrap())
            .unwrap();
        let before = adapter.base().weight().as_tensor().to_vec2::<f32>().unwrap();
        adapter.merge().unwrap();
        // The tree's wrapped node sees the merged weight.
        let ModuleNode::Adapter(in_tree) = tree.child_mut("proj").unwrap() else {
            panic!("proj was not wrapped");
        };
        let after = in_tree.base().weight().as_tensor().to_vec2::<f32>().unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn converted_tree_attaches_nothing() {
        let mut tree = tree();
        convert_tree(&mut tree, &SwapPolicy::default()).unwrap();
        let adapters = attach_tlora(&mut tree, &TLoraConfig::default()).unwrap();
        assert!(adapters.is_empty());
    }

    #[test]
    fn adapted_tree_forward_matches_base() {
        let dev = Device::Cpu;
        let mut tree = tree();
        let x = Tensor::randn(0f32, 1f32, (3, 4), &dev).unwrap();
        let base_out = tree.forward(&x, false).unwrap().to_vec2::<f32>().unwrap();
        attach_tlora(&mut tree, &TLoraConfig {
            r: 2,
            ..Default::default()
        })
        .unwrap();
        // Fresh adapters are no-ops: zero up factors contribute nothing.
        let adapted_out = tree.forward(&x, false).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(base_out, adapted_out);
    }
}
