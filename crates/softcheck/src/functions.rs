// Functions — axis-style entry points over Tensor methods

use softcheck_core::{Backend, Error, Result, Tensor};

/// Resolve a possibly negative axis (`-1` is the last dimension).
pub fn normalize_axis(axis: isize, rank: usize) -> Result<usize> {
    let resolved = if axis < 0 {
        axis + rank as isize
    } else {
        axis
    };
    if resolved < 0 || resolved as usize >= rank {
        return Err(Error::msg(format!(
            "axis {axis} is out of range for a tensor of rank {rank}"
        )));
    }
    Ok(resolved as usize)
}

/// Softmax of `x` along `axis`; negative axes count from the end.
///
/// Routed through the fused backend kernel or the composite fallback
/// according to the current dispatch config.
pub fn softmax<B: Backend>(x: &Tensor<B>, axis: isize) -> Result<Tensor<B>> {
    x.softmax(normalize_axis(axis, x.rank())?)
}
