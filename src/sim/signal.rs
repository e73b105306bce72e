//! Signal buffers: the mutably-shared numeric state operators read and
//! write. Exactly one operator per chunk produces a buffer; cross-rank
//! sharing is always by copy over the messaging layer.

use crate::error::Error;
use crate::model::SignalSpec;
use crate::Result;

/// A keyed `(rows, cols)` block of f64 values, stored row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalBuffer {
    key: u64,
    label: String,
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl SignalBuffer {
    pub fn from_spec(spec: &SignalSpec) -> Result<Self> {
        if spec.rows == 0 || spec.cols == 0 || spec.initial.len() != spec.rows * spec.cols {
            return Err(Error::BadShape {
                key: spec.key,
                rows: spec.rows,
                cols: spec.cols,
                len: spec.initial.len(),
            });
        }
        Ok(Self {
            key: spec.key,
            label: spec.label.clone(),
            rows: spec.rows,
            cols: spec.cols,
            data: spec.initial.clone(),
        })
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// View of the current values.
    pub fn read(&self) -> &[f64] {
        &self.data
    }

    /// Replace the values wholesale. The replacement must match the
    /// buffer's shape.
    pub fn write(&mut self, values: &[f64]) -> Result<()> {
        if values.len() != self.data.len() {
            return Err(Error::BadShape {
                key: self.key,
                rows: self.rows,
                cols: self.cols,
                len: values.len(),
            });
        }
        self.data.copy_from_slice(values);
        Ok(())
    }

    /// In-place mutable access for accumulating operators.
    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }
}
