//! Tree-structured collections of tensors.
//!
//! Gradients mirror the model's parameter structure. [`PyTree`] gives every
//! such structure a flatten/unflatten view so that clipping and noise can work
//! leaf by leaf without knowing the model.

use std::collections::BTreeMap;

use crate::error::{DpError, Result};
use crate::tensor::{l2_norm, scaled_l2_norm, Tensor};

/// Gradient (and parameter) tree keyed by parameter name.
pub type GradientTree = BTreeMap<String, Tensor>;

/// Structural description of a [`PyTree`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TreeSpec {
    /// A single tensor.
    Leaf,
    /// An ordered sequence of children.
    Seq(Vec<TreeSpec>),
    /// A pair of potentially distinct structures.
    Tuple2(Box<TreeSpec>, Box<TreeSpec>),
    /// Named children in key order.
    Map(Vec<(String, TreeSpec)>),
}

impl TreeSpec {
    /// Number of leaves described by this spec.
    pub fn leaf_count(&self) -> usize {
        match self {
            TreeSpec::Leaf => 1,
            TreeSpec::Seq(children) => children.iter().map(TreeSpec::leaf_count).sum(),
            TreeSpec::Tuple2(a, b) => a.leaf_count() + b.leaf_count(),
            TreeSpec::Map(entries) => entries.iter().map(|(_, s)| s.leaf_count()).sum(),
        }
    }
}

/// A tree of tensors with a stable leaf order.
pub trait PyTree: Sized {
    /// Structure of the tree, without leaf data.
    fn spec(&self) -> TreeSpec;

    /// Borrow every leaf in flatten order.
    fn leaf_refs(&self) -> Vec<&Tensor>;

    /// Rebuild a tree by pulling leaves from `leaves` in flatten order.
    fn unflatten_from(spec: &TreeSpec, leaves: &mut dyn Iterator<Item = Tensor>) -> Result<Self>;

    /// Apply `f` to every leaf, keeping the structure.
    fn map_leaves(&self, f: &mut dyn FnMut(&Tensor) -> Tensor) -> Self;

    /// Flatten into owned leaves plus a structural specification.
    fn flatten(&self) -> (Vec<Tensor>, TreeSpec) {
        let leaves = self.leaf_refs().into_iter().cloned().collect();
        (leaves, self.spec())
    }

    /// Reconstruct from a spec and exactly the right number of leaves.
    fn unflatten(spec: &TreeSpec, leaves: Vec<Tensor>) -> Result<Self> {
        let given = leaves.len();
        let expected = spec.leaf_count();
        if given != expected {
            return Err(DpError::shape(format!(
                "tree expects {expected} leaves, got {given}"
            )));
        }
        let mut iter = leaves.into_iter();
        Self::unflatten_from(spec, &mut iter)
    }
}

impl PyTree for Tensor {
    fn spec(&self) -> TreeSpec {
        TreeSpec::Leaf
    }

    fn leaf_refs(&self) -> Vec<&Tensor> {
        vec![self]
    }

    fn unflatten_from(spec: &TreeSpec, leaves: &mut dyn Iterator<Item = Tensor>) -> Result<Self> {
        match spec {
            TreeSpec::Leaf => leaves
                .next()
                .ok_or_else(|| DpError::shape("ran out of leaves while rebuilding tree")),
            other => Err(DpError::shape(format!(
                "expected a leaf, found structure {other:?}"
            ))),
        }
    }

    fn map_leaves(&self, f: &mut dyn FnMut(&Tensor) -> Tensor) -> Self {
        f(self)
    }
}

impl<T: PyTree> PyTree for Vec<T> {
    fn spec(&self) -> TreeSpec {
        TreeSpec::Seq(self.iter().map(T::spec).collect())
    }

    fn leaf_refs(&self) -> Vec<&Tensor> {
        self.iter().flat_map(T::leaf_refs).collect()
    }

    fn unflatten_from(spec: &TreeSpec, leaves: &mut dyn Iterator<Item = Tensor>) -> Result<Self> {
        match spec {
            TreeSpec::Seq(children) => children
                .iter()
                .map(|child| T::unflatten_from(child, leaves))
                .collect(),
            other => Err(DpError::shape(format!(
                "expected a sequence, found structure {other:?}"
            ))),
        }
    }

    fn map_leaves(&self, f: &mut dyn FnMut(&Tensor) -> Tensor) -> Self {
        self.iter().map(|item| item.map_leaves(f)).collect()
    }
}

impl<A: PyTree, B: PyTree> PyTree for (A, B) {
    fn spec(&self) -> TreeSpec {
        TreeSpec::Tuple2(Box::new(self.0.spec()), Box::new(self.1.spec()))
    }

    fn leaf_refs(&self) -> Vec<&Tensor> {
        let mut out = self.0.leaf_refs();
        out.extend(self.1.leaf_refs());
        out
    }

    fn unflatten_from(spec: &TreeSpec, leaves: &mut dyn Iterator<Item = Tensor>) -> Result<Self> {
        match spec {
            TreeSpec::Tuple2(a, b) => {
                let first = A::unflatten_from(a, leaves)?;
                let second = B::unflatten_from(b, leaves)?;
                Ok((first, second))
            }
            other => Err(DpError::shape(format!(
                "expected a pair, found structure {other:?}"
            ))),
        }
    }

    fn map_leaves(&self, f: &mut dyn FnMut(&Tensor) -> Tensor) -> Self {
        (self.0.map_leaves(f), self.1.map_leaves(f))
    }
}

impl<T: PyTree> PyTree for BTreeMap<String, T> {
    fn spec(&self) -> TreeSpec {
        TreeSpec::Map(self.iter().map(|(k, v)| (k.clone(), v.spec())).collect())
    }

    fn leaf_refs(&self) -> Vec<&Tensor> {
        self.values().flat_map(T::leaf_refs).collect()
    }

    fn unflatten_from(spec: &TreeSpec, leaves: &mut dyn Iterator<Item = Tensor>) -> Result<Self> {
        match spec {
            TreeSpec::Map(entries) => entries
                .iter()
                .map(|(key, child)| Ok((key.clone(), T::unflatten_from(child, leaves)?)))
                .collect(),
            other => Err(DpError::shape(format!(
                "expected a map, found structure {other:?}"
            ))),
        }
    }

    fn map_leaves(&self, f: &mut dyn FnMut(&Tensor) -> Tensor) -> Self {
        self.iter()
            .map(|(k, v)| (k.clone(), v.map_leaves(f)))
            .collect()
    }
}

/// Global L2 norm across all leaves.
pub fn global_l2_norm<T: PyTree>(tree: &T) -> f64 {
    let leaf_norms: Vec<f64> = tree.leaf_refs().into_iter().map(l2_norm).collect();
    scaled_l2_norm(leaf_norms.iter().copied())
}

/// Fail unless `actual` has the structure and leaf shapes of `expected`.
pub fn check_same_shape<T: PyTree>(expected: &T, actual: &T, what: &str) -> Result<()> {
    let (es, as_) = (expected.spec(), actual.spec());
    if es != as_ {
        return Err(DpError::shape(format!(
            "{what}: structure {as_:?} differs from {es:?}"
        )));
    }
    for (i, (e, a)) in expected
        .leaf_refs()
        .into_iter()
        .zip(actual.leaf_refs())
        .enumerate()
    {
        if e.shape() != a.shape() {
            return Err(DpError::shape(format!(
                "{what}: leaf {i} has shape {:?}, expected {:?}",
                a.shape(),
                e.shape()
            )));
        }
    }
    Ok(())
}

/// Leaf-wise sum of two identically shaped trees.
pub fn tree_add<T: PyTree>(lhs: &T, rhs: &T) -> Result<T> {
    check_same_shape(lhs, rhs, "tree_add")?;
    let (leaves, spec) = lhs.flatten();
    let summed = leaves
        .into_iter()
        .zip(rhs.leaf_refs())
        .map(|(a, b)| a + b)
        .collect();
    T::unflatten(&spec, summed)
}

/// A tree of zeros with the same structure and shapes.
pub fn zeros_like<T: PyTree>(tree: &T) -> T {
    tree.map_leaves(&mut |leaf| Tensor::zeros(leaf.raw_dim()))
}

/// Multiply every leaf by `factor`.
pub fn scale<T: PyTree>(tree: &T, factor: f64) -> T {
    tree.map_leaves(&mut |leaf| leaf.mapv(|v| v * factor))
}
