//! Broadcasting and axis helpers shared by shape logic and kernels.

use crate::{Error, Result};

/// Compute NumPy-style broadcast output shape from two input shapes.
///
/// Shapes are aligned from the rightmost dimension; dimensions match if they
/// are equal or one of them is 1, and missing leading dimensions count as 1.
///
/// ```text
/// broadcast_shape(&[2, 4, 8, 8], &[2, 1, 1, 8]) -> [2, 4, 8, 8]
/// broadcast_shape(&[8, 1, 6, 1], &[7, 1, 5])    -> [8, 7, 6, 5]
/// ```
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let max_rank = a.len().max(b.len());
    let mut result = Vec::with_capacity(max_rank);

    for i in 0..max_rank {
        let da = dim_or_one(a, i, max_rank);
        let db = dim_or_one(b, i, max_rank);

        if da == db || db == 1 {
            result.push(da);
        } else if da == 1 {
            result.push(db);
        } else {
            return Err(Error::Shape(format!(
                "Cannot broadcast shapes {a:?} and {b:?} at dimension {i}"
            )));
        }
    }

    Ok(result)
}

fn dim_or_one(shape: &[usize], i: usize, rank: usize) -> usize {
    let offset = rank - shape.len();
    if i < offset { 1 } else { shape[i - offset] }
}

/// Row-major strides for a shape.
pub fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Map a flat index in the broadcast `out_shape` to the flat index of an
/// input of shape `in_shape` (which must broadcast to `out_shape`).
pub fn broadcast_index(flat: usize, out_shape: &[usize], in_shape: &[usize]) -> usize {
    let offset = out_shape.len() - in_shape.len();
    let in_strides = strides(in_shape);
    let mut remaining = flat;
    let mut index = 0;
    for axis in (0..out_shape.len()).rev() {
        let coord = remaining % out_shape[axis];
        remaining /= out_shape[axis];
        if axis >= offset {
            let in_axis = axis - offset;
            if in_shape[in_axis] != 1 {
                index += coord * in_strides[in_axis];
            }
        }
    }
    index
}

/// Resolve a possibly negative axis against `rank`.
pub fn normalize_axis(axis: i64, rank: usize) -> Result<usize> {
    let rank_i = rank as i64;
    let resolved = if axis < 0 { axis + rank_i } else { axis };
    if resolved < 0 || resolved >= rank_i {
        return Err(Error::Shape(format!(
            "Axis {axis} out of range for rank {rank}"
        )));
    }
    Ok(resolved as usize)
}
