//! Quantized tensor arithmetic.
//!
//! Numeric policy: activations are quantized per group to symmetric int8 with
//! `scale = max|x| / 127` and values rounded half to even. Dot products are
//! accumulated in `i32` per group and scaled in `f32`; group partial sums are
//! added in ascending group order, so results do not depend on thread count.

#[cfg(test)]
#[path = "../tests/unit/tensor_test.rs"]
mod tests;

use rayon::prelude::*;

const Q_MAX: f32 = 127.0;

/// Owned int8 tensor with one scale per group, used for activations.
#[derive(Debug, Clone)]
pub struct QuantizedTensor {
    pub q: Vec<i8>,
    pub s: Vec<f32>,
}

impl QuantizedTensor {
    pub fn new(size: usize, group_size: usize) -> Self {
        let scale_size = if group_size == 0 { 0 } else { size / group_size };
        Self { q: vec![0; size], s: vec![0.0; scale_size] }
    }
}

/// Borrowed int8 weights with their group scales.
#[derive(Debug, Clone, Copy)]
pub struct QuantizedView<'a> {
    pub q: &'a [i8],
    pub s: &'a [f32],
}

/// `xout[i] = sum_j w[i, j] * x[j]` for a row-major `d x n` quantized matrix.
pub fn matmul_q8(xout: &mut [f32], x: &QuantizedTensor, w: QuantizedView<'_>, n: usize, d: usize, group_size: usize) {
    assert!(xout.len() >= d, "Output slice length must be at least d parameter: {} >= {}", xout.len(), d);

    xout.par_iter_mut().enumerate().take(d).for_each(|(i, out_val)| {
        compute_matmul_row(out_val, x, w, i, n, group_size);
    });
}

#[inline]
fn compute_matmul_row(
    out_val: &mut f32,
    x: &QuantizedTensor,
    w: QuantizedView<'_>,
    row_idx: usize,
    n: usize,
    group_size: usize,
) {
    debug_assert_eq!(n % group_size, 0, "n must be divisible by group_size");

    let weight_row_offset = row_idx * n;
    let num_groups = n / group_size;

    *out_val = (0..num_groups)
        .map(|group_idx| {
            let group_start = group_idx * group_size;
            let weight_group_offset = weight_row_offset + group_start;

            let quantized_dot_product: i32 = x.q[group_start..group_start + group_size]
                .iter()
                .zip(&w.q[weight_group_offset..weight_group_offset + group_size])
                .map(|(&x_quant, &w_quant)| x_quant as i32 * w_quant as i32)
                .sum();

            let weight_scale = w.s[weight_group_offset / group_size];
            let input_scale = x.s[group_idx];

            quantized_dot_product as f32 * weight_scale * input_scale
        })
        .sum();
}

/// Full precision counterpart of [`matmul_q8`].
pub fn matmul_f32(xout: &mut [f32], x: &[f32], w: &[f32], n: usize, d: usize) {
    assert!(xout.len() >= d, "Output slice length must be at least d parameter: {} >= {}", xout.len(), d);

    xout.par_iter_mut().enumerate().take(d).for_each(|(i, out_val)| {
        let row = &w[i * n..(i + 1) * n];
        *out_val = row.iter().zip(&x[..n]).map(|(&w_val, &x_val)| w_val * x_val).sum();
    });
}

/// Dequantizes int8 values with their group scales into a float buffer.
pub fn dequantize(q: &[i8], s: &[f32], x: &mut [f32], group_size: usize) {
    debug_assert_eq!(x.len(), q.len(), "Output buffer size must match quantized tensor size");
    debug_assert_eq!(s.len(), x.len() / group_size);

    for (i, &q_val) in q.iter().enumerate() {
        x[i] = q_val as f32 * s[i / group_size];
    }
}

/// Quantizes `x` into `qx` using per-group symmetric scaling.
///
/// All-zero groups get a zero scale and zero values.
pub fn quantize(qx: &mut QuantizedTensor, x: &[f32], group_size: usize) {
    let size = x.len();
    debug_assert!(qx.q.len() >= size, "Quantized buffer too small: {} < {}", qx.q.len(), size);
    debug_assert!(qx.s.len() >= size / group_size, "Scale buffer too small: {} < {}", qx.s.len(), size / group_size);

    for (group, values) in x.chunks_exact(group_size).enumerate() {
        let wmax = values.iter().fold(0.0f32, |acc, &val| acc.max(val.abs()));
        let scale = wmax / Q_MAX;
        qx.s[group] = scale;

        let group_start = group * group_size;
        for (i, &val) in values.iter().enumerate() {
            let quant_value = if scale != 0.0 { (val / scale).round_ties_even().clamp(-Q_MAX, Q_MAX) } else { 0.0 };
            qx.q[group_start + i] = quant_value as i8;
        }
    }
}

/// Applies softmax normalization to a slice in-place.
pub fn softmax(x: &mut [f32]) {
    let max_val = x.iter().fold(f32::NEG_INFINITY, |acc, &val| acc.max(val));
    let sum = x
        .iter_mut()
        .map(|val| {
            *val = (*val - max_val).exp();
            *val
        })
        .sum::<f32>();
    let inv_sum = sum.recip();
    x.iter_mut().for_each(|val| *val *= inv_sum);
}
