//! Module tree: kind-tagged nodes, dotted paths, and slot replacement.
//!
//! A network is a tree of [`ModuleNode`]s. Interior nodes are `Composite`
//! (ordered, named children); leaves are parameterised units. Every node
//! carries a [`ModuleKind`] tag, and the allow/block policy of the rewriter
//! operates on that tag — there is no runtime type inspection anywhere.
//!
//! Replacement is expressed structurally: resolve the dotted path to the
//! parent composite, then overwrite the named child slot. The tree is mutated
//! in place; it is never copied wholesale.

use candle_core::{DType, Device, Result, Shape, Tensor, Var};
use candle_nn::init::DEFAULT_KAIMING_UNIFORM;
use candle_nn::Init;

use ternify_common::TernifyError;

use crate::bitlinear::BitLinear;
use crate::quantize::matmul_reshape;
use crate::tlora::TLoraAdapter;

// ── Kind tags ───────────────────────────────────────────────────────────────

/// Capability class of a module node. The swap policy's allow/block sets are
/// sets of these tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleKind {
    /// A plain linear unit: has in/out feature counts and a dense weight.
    LinearCapable,
    /// An embedding table. Blocked from conversion by default.
    EmbeddingLike,
    /// A normalisation layer. Blocked from conversion by default.
    NormLike,
    /// An already-converted ternary linear. Not in the default allow-set, so
    /// a second rewrite pass leaves it alone.
    BitLinear,
    /// A linear unit wrapped by a T-LoRA adapter.
    Adapter,
    /// An interior node holding named children.
    Composite,
}

impl ModuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LinearCapable => "Linear",
            Self::EmbeddingLike => "Embedding",
            Self::NormLike => "Norm",
            Self::BitLinear => "BitLinear",
            Self::Adapter => "TLoraAdapter",
            Self::Composite => "Composite",
        }
    }
}

impl std::fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Leaf units ──────────────────────────────────────────────────────────────

/// Full-precision linear unit, the conversion source for BitLinear.
///
/// Parameters are `Var`s; cloning a unit shares the underlying storage, which
/// is how an adapter holds a non-owning reference to its base — `Var::set`
/// through either handle is visible through both.
#[derive(Debug, Clone)]
pub struct LinearUnit {
    weight: Var,
    bias: Option<Var>,
    in_features: usize,
    out_features: usize,
}

impl LinearUnit {
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
        Ok(Self {
            weight,
            bias,
            in_features,
            out_features,
        })
    }

    /// Wrap an existing weight (and optional bias) without re-initialising.
    pub fn from_parts(weight: Var, bias: Option<Var>) -> ternify_common::Result<Self> {
        let dims = weight.dims();
        if dims.len() != 2 {
            return Err(TernifyError::shape_mismatch(
                "(out_features, in_features)",
                format!("{dims:?}"),
            ));
        }
        let (out_features, in_features) = (dims[0], dims[1]);
        if let Some(b) = &bias {
            if b.dims() != [out_features] {
                return Err(TernifyError::shape_mismatch(
                    format!("({out_features},)"),
                    format!("{:?}", b.dims()),
                ));
            }
        }
        Ok(Self {
            weight,
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

    pub fn weight(&self) -> &Var {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Var> {
        self.bias.as_ref()
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let out = matmul_reshape(x, &self.weight.as_tensor().t()?)?;
        match &self.bias {
            Some(bias) => out.broadcast_add(bias.as_tensor()),
            None => Ok(out),
        }
    }
}

/// Embedding table, `(vocab_size, dim)`. Exists so trees have something the
/// default block-set actually blocks; forward is a plain row lookup.
#[derive(Debug, Clone)]
pub struct EmbeddingUnit {
    weight: Var,
    vocab_size: usize,
    dim: usize,
}

impl EmbeddingUnit {
    pub fn new(vocab_size: usize, dim: usize, device: &Device) -> Result<Self> {
        let weight = Init::Randn { mean: 0.0, stdev: 1.0 }.var(
            Shape::from((vocab_size, dim)),
            DType::F32,
            device,
        )?;
        Ok(Self {
            weight,
            vocab_size,
            dim,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn weight(&self) -> &Var {
        &self.weight
    }

    /// Look up rows by index. `ids` is an integer tensor of any shape; the
    /// output gains a trailing `dim` axis.
    pub fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        let mut out_dims = ids.dims().to_vec();
        out_dims.push(self.dim);
        let flat = ids.flatten_all()?;
        let rows = self.weight.as_tensor().index_select(&flat, 0)?;
        rows.reshape(out_dims)
    }
}

/// RMS normalisation. Preferred over LayerNorm for ternary models: no mean
/// subtraction, so activations are not shifted across the quantisation
/// threshold between steps.
#[derive(Debug, Clone)]
pub struct NormUnit {
    weight: Var,
    eps: f64,
}

impl NormUnit {
    pub fn new(dim: usize, eps: f64, device: &Device) -> Result<Self> {
        let weight = Var::ones(dim, DType::F32, device)?;
        Ok(Self { weight, eps })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean_sq = x.sqr()?.mean_keepdim(candle_core::D::Minus1)?;
        let denom = mean_sq.affine(1.0, self.eps)?.sqrt()?;
        x.broadcast_div(&denom)?
            .broadcast_mul(self.weight.as_tensor())
    }
}

// ── Tree nodes ──────────────────────────────────────────────────────────────

/// A node in the module tree.
#[derive(Debug, Clone)]
pub enum ModuleNode {
    Linear(LinearUnit),
    Embedding(EmbeddingUnit),
    Norm(NormUnit),
    BitLinear(BitLinear),
    Adapter(TLoraAdapter),
    Composite(Vec<(String, ModuleNode)>),
}

impl ModuleNode {
    pub fn kind(&self) -> ModuleKind {
        match self {
            Self::Linear(_) => ModuleKind::LinearCapable,
            Self::Embedding(_) => ModuleKind::EmbeddingLike,
            Self::Norm(_) => ModuleKind::NormLike,
            Self::BitLinear(_) => ModuleKind::BitLinear,
            Self::Adapter(_) => ModuleKind::Adapter,
            Self::Composite(_) => ModuleKind::Composite,
        }
    }

    /// Structural shape contract of the rewriter: the node exposes in/out
    /// feature counts it could be converted with.
    pub fn feature_counts(&self) -> Option<(usize, usize)> {
        match self {
            Self::Linear(unit) => Some((unit.in_features(), unit.out_features())),
            Self::BitLinear(bit) => Some((bit.in_features(), bit.out_features())),
            Self::Adapter(adapter) => Some(adapter.feature_counts()),
            _ => None,
        }
    }

    /// Named children of a composite; empty for leaves.
    pub fn children(&self) -> &[(String, ModuleNode)] {
        match self {
            Self::Composite(children) => children,
            _ => &[],
        }
    }

    /// Mutable handle to a direct child slot.
    pub fn child_mut(&mut self, name: &str) -> Option<&mut ModuleNode> {
        match self {
            Self::Composite(children) => children
                .iter_mut()
                .find(|(child_name, _)| child_name == name)
                .map(|(_, child)| child),
            _ => None,
        }
    }

    /// Evaluate the node. Composites apply their children in declaration
    /// order; `train` gates dropout and the STE path in adapters.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Self::Linear(unit) => unit.forward(x),
            Self::Embedding(unit) => unit.forward(x),
            Self::Norm(unit) => unit.forward(x),
            Self::BitLinear(bit) => bit.forward(x),
            Self::Adapter(adapter) => adapter.forward(x, train),
            Self::Composite(children) => {
                let mut h = x.clone();
                for (_, child) in children {
                    h = child.forward(&h, train)?;
                }
                Ok(h)
            }
        }
    }
}

// ── Traversal & path resolution ─────────────────────────────────────────────

/// Pre-order, depth-first walk over named children. The root itself is not
/// yielded; paths are dotted and relative to it. Visit order is the manifest
/// order of every rewrite pass.
pub fn visit<'a, F>(root: &'a ModuleNode, mut f: F)
where
    F: FnMut(&str, &'a ModuleNode),
{
    fn walk<'a, F>(node: &'a ModuleNode, prefix: &str, f: &mut F)
    where
        F: FnMut(&str, &'a ModuleNode),
    {
        for (name, child) in node.children() {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}.{name}")
            };
            f(&path, child);
            walk(child, &path, f);
        }
    }
    walk(root, "", &mut f);
}

/// Resolve a dotted path to `(parent node, local child name)`.
///
/// Every intermediate segment must name a child of a composite; otherwise the
/// tree is structurally inconsistent with the path and `UnresolvedPath` is
/// returned. The final segment is not checked here — the caller looks it up
/// with [`ModuleNode::child_mut`], which is where a missing leaf surfaces.
pub fn resolve_parent_mut<'a>(
    root: &'a mut ModuleNode,
    path: &str,
) -> ternify_common::Result<(&'a mut ModuleNode, String)> {
    let (parent_path, local) = match path.rsplit_once('.') {
        Some((parent, local)) => (Some(parent), local),
        None => (None, path),
    };
    if local.is_empty() {
        return Err(TernifyError::UnresolvedPath(path.to_string()));
    }
    let mut node = root;
    if let Some(parent_path) = parent_path {
        for segment in parent_path.split('.') {
            node = node
                .child_mut(segment)
                .ok_or_else(|| TernifyError::UnresolvedPath(path.to_string()))?;
        }
    }
    Ok((node, local.to_string()))
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn two_level_tree() -> ModuleNode {
        let dev = Device::Cpu;
        ModuleNode::Composite(vec![(
            "block".to_string(),
            ModuleNode::Composite(vec![
                (
                    "proj".to_string(),
                    ModuleNode::Linear(LinearUnit::new(4, 2, true, &dev).unwrap()),
                ),
                (
                    "norm".to_string(),
                    ModuleNode::Norm(NormUnit::new(2, 1e-5, &dev).unwrap()),
                ),
            ]),
        )])
    }

    #[test]
    fn visit_is_preorder_with_dotted_paths() {
        let tree = two_level_tree();
        let mut paths = Vec::new();
        visit(&tree, |path, _| paths.push(path.to_string()));
        assert_eq!(paths, vec!["block", "block.proj", "block.norm"]);
    }

    #[test]
    fn resolve_parent_finds_slot() {
        let mut tree = two_level_tree();
        let (parent, local) = resolve_parent_mut(&mut tree, "block.proj").unwrap();
        assert_eq!(local, "proj");
        assert!(parent.child_mut("proj").is_some());
    }

    #[test]
    fn resolve_parent_rejects_missing_segment() {
        let mut tree = two_level_tree();
        let err = resolve_parent_mut(&mut tree, "missing.proj").unwrap_err();
        assert!(matches!(err, TernifyError::UnresolvedPath(_)));
    }

    #[test]
    fn kind_tags() {
        let tree = two_level_tree();
        assert_eq!(tree.kind(), ModuleKind::Composite);
        let mut kinds = Vec::new();
        visit(&tree, |_, node| kinds.push(node.kind()));
        assert_eq!(
            kinds,
            vec![
                ModuleKind::Composite,
                ModuleKind::LinearCapable,
                ModuleKind::NormLike
            ]
        );
    }

    #[test]
    fn composite_forward_is_sequential() {
        let dev = Device::Cpu;
        let tree = two_level_tree();
        let x = Tensor::randn(0f32, 1f32, (3, 4), &dev).unwrap();
        let y = tree.forward(&x, false).unwrap();
        assert_eq!(y.dims(), &[3, 2]);
    }

    #[test]
    fn linear_unit_forward_with_bias() {
        let dev = Device::Cpu;
        let weight = Var::from_tensor(&Tensor::new(&[[1f32, 2.0]], &dev).unwrap()).unwrap();
        let bias = Var::from_tensor(&Tensor::new(&[10f32], &dev).unwrap()).unwrap();
        let unit = LinearUnit::from_parts(weight, Some(bias)).unwrap();
        let x = Tensor::new(&[[3f32, 4.0]], &dev).unwrap();
        let y = unit.forward(&x).unwrap();
        // 1*3 + 2*4 + 10 = 21
        assert_eq!(y.to_vec2::<f32>().unwrap(), vec![vec![21.0]]);
    }

    #[test]
    fn from_parts_rejects_bias_mismatch() {
        let dev = Device::Cpu;
        let weight = Var::from_tensor(&Tensor::zeros((2, 3), DType::F32, &dev).unwrap()).unwrap();
        let bias = Var::from_tensor(&Tensor::zeros(3, DType::F32, &dev).unwrap()).unwrap();
        assert!(LinearUnit::from_parts(weight, Some(bias)).is_err());
    }
}
