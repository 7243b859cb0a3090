//! Batches of training examples.

use std::collections::BTreeMap;

use ndarray::{Axis, Slice};

use crate::error::{DpError, Result};
use crate::tensor::Tensor;

/// Named input arrays sharing a leading example dimension.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    fields: BTreeMap<String, Tensor>,
    size: usize,
}

/// One row of a [`Batch`], with the leading axis removed.
#[derive(Clone, Debug, PartialEq)]
pub struct Example {
    index: usize,
    fields: BTreeMap<String, Tensor>,
}

impl Batch {
    /// Build a batch, checking that every field has the same leading dimension.
    pub fn new(fields: BTreeMap<String, Tensor>) -> Result<Self> {
        let mut size = None;
        for (name, t) in &fields {
            if t.ndim() == 0 {
                return Err(DpError::invalid(format!(
                    "batch field '{name}' is a scalar; expected a leading example axis"
                )));
            }
            let rows = t.len_of(Axis(0));
            match size {
                None => size = Some((name.clone(), rows)),
                Some((ref first, n)) if n != rows => {
                    return Err(DpError::shape(format!(
                        "batch field '{name}' has {rows} examples but '{first}' has {n}"
                    )));
                }
                Some(_) => {}
            }
        }
        match size {
            None => Err(DpError::invalid("batch has no fields")),
            Some((_, 0)) => Err(DpError::invalid("batch must contain at least one example")),
            Some((_, n)) => Ok(Self { fields, size: n }),
        }
    }

    /// Build a batch from `(name, tensor)` pairs.
    pub fn from_fields<S, I>(fields: I) -> Result<Self>
    where
        S: Into<String>,
        I: IntoIterator<Item = (S, Tensor)>,
    {
        Self::new(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Number of examples.
    pub fn len(&self) -> usize {
        self.size
    }

    /// Always false; batches hold at least one example.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// A whole field, including the example axis.
    pub fn field(&self, name: &str) -> Option<&Tensor> {
        self.fields.get(name)
    }

    /// Field names in order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Extract example `i`.
    pub fn example(&self, i: usize) -> Result<Example> {
        if i >= self.size {
            return Err(DpError::invalid(format!(
                "example index {i} out of range for batch of {}",
                self.size
            )));
        }
        let fields = self
            .fields
            .iter()
            .map(|(k, t)| (k.clone(), t.index_axis(Axis(0), i).to_owned()))
            .collect();
        Ok(Example { index: i, fields })
    }

    /// Examples `start..end` as a new batch.
    pub fn slice(&self, start: usize, end: usize) -> Result<Self> {
        if start >= end || end > self.size {
            return Err(DpError::invalid(format!(
                "invalid example range {start}..{end} for batch of {}",
                self.size
            )));
        }
        let fields = self
            .fields
            .iter()
            .map(|(k, t)| {
                let part = t.slice_axis(Axis(0), Slice::from(start..end)).to_owned();
                (k.clone(), part)
            })
            .collect();
        Ok(Self {
            fields,
            size: end - start,
        })
    }

    /// Split into consecutive micro-batches of at most `size` examples.
    pub fn chunks(&self, size: usize) -> Result<Vec<Self>> {
        if size == 0 {
            return Err(DpError::invalid("micro-batch size must be positive"));
        }
        (0..self.size)
            .step_by(size)
            .map(|start| self.slice(start, (start + size).min(self.size)))
            .collect()
    }
}

impl Example {
    /// Position of this example in its batch.
    pub fn index(&self) -> usize {
        self.index
    }

    /// A field of this example.
    pub fn field(&self, name: &str) -> Option<&Tensor> {
        self.fields.get(name)
    }

    /// A field of this example, failing if it is absent.
    pub fn require(&self, name: &str) -> Result<&Tensor> {
        self.fields
            .get(name)
            .ok_or_else(|| DpError::invalid(format!("example has no field '{name}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn batch() -> Batch {
        Batch::from_fields([
            ("x", array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]].into_dyn()),
            ("y", array![1.0, 0.0, 1.0].into_dyn()),
        ])
        .unwrap()
    }

    #[test]
    fn example_drops_leading_axis() {
        let ex = batch().example(1).unwrap();
        assert_eq!(ex.index(), 1);
        assert_eq!(ex.require("x").unwrap(), &array![3.0, 4.0].into_dyn());
        assert_eq!(ex.require("y").unwrap().ndim(), 0);
        assert!(ex.require("z").is_err());
        assert_eq!(batch().field_names().collect::<Vec<_>>(), ["x", "y"]);
    }

    #[test]
    fn mismatched_leading_dims_are_rejected() {
        let err = Batch::from_fields([
            ("x", array![[1.0], [2.0]].into_dyn()),
            ("y", array![1.0, 0.0, 1.0].into_dyn()),
        ])
        .unwrap_err();
        assert!(matches!(err, DpError::ShapeMismatch { .. }));
    }

    #[test]
    fn empty_batch_is_invalid() {
        let err = Batch::from_fields([("x", ndarray::Array2::<f64>::zeros((0, 2)).into_dyn())])
            .unwrap_err();
        assert!(matches!(err, DpError::InvalidConfig { .. }));
        assert!(Batch::new(BTreeMap::new()).is_err());
    }

    #[test]
    fn chunks_cover_every_example() {
        let parts = batch().chunks(2).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].len(), 2);
        assert_eq!(parts[1].len(), 1);
        assert_eq!(parts[1].field("y").unwrap(), &array![1.0].into_dyn());
    }

    #[test]
    fn out_of_range_example_errors() {
        assert!(batch().example(3).is_err());
    }
}
