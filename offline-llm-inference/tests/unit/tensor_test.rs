use crate::tensor::*;

#[test]
fn test_quantize_scales_by_group_maximum() {
    let x = [1.0, -2.0, 0.5, 0.0, 10.0, 4.0, -10.0, 2.5];
    let mut qx = QuantizedTensor::new(8, 4);

    quantize(&mut qx, &x, 4);

    assert_eq!(qx.s, vec![2.0 / 127.0, 10.0 / 127.0]);
    assert_eq!(&qx.q[4..], &[127, 51, -127, 32]);
    assert_eq!(qx.q[1], -127);
}

#[test]
fn test_quantize_rounds_half_to_even() {
    // scale = 127 / 127 = 1, so values are quantized as is
    let x = [127.0, 0.5, 1.5, -2.5];
    let mut qx = QuantizedTensor::new(4, 4);

    quantize(&mut qx, &x, 4);

    assert_eq!(qx.q, vec![127, 0, 2, -2]);
}

#[test]
fn test_zero_group_quantizes_to_zero() {
    let mut qx = QuantizedTensor::new(4, 4);

    quantize(&mut qx, &[0.0; 4], 4);

    assert_eq!(qx.s, vec![0.0]);
    assert_eq!(qx.q, vec![0; 4]);
}

#[test]
fn test_matmul_q8_matches_float_product() {
    // 2 x 4 weights, one group per row
    let weights_q = [127i8, 0, 0, 0, 0, 127, 0, -127];
    let weights_s = [1.0 / 127.0, 2.0 / 127.0];
    let mut x = QuantizedTensor::new(4, 4);
    quantize(&mut x, &[127.0, 63.0, 1.0, 2.0], 4);

    let mut out = [0.0f32; 2];
    matmul_q8(&mut out, &x, QuantizedView { q: &weights_q, s: &weights_s }, 4, 2, 4);

    assert!((out[0] - 127.0).abs() < 1e-3, "{}", out[0]);
    assert!((out[1] - 2.0 * (63.0 - 2.0)).abs() < 1e-3, "{}", out[1]);
}

#[test]
fn test_matmul_f32() {
    let w = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    let mut out = [0.0f32; 2];

    matmul_f32(&mut out, &[1.0, 0.0, -1.0], &w, 3, 2);

    assert_eq!(out, [-2.0, -2.0]);
}

#[test]
fn test_dequantize() {
    let mut out = [0.0f32; 4];

    dequantize(&[1, -2, 3, 4], &[0.5, 2.0], &mut out, 2);

    assert_eq!(out, [0.5, -1.0, 6.0, 8.0]);
}

#[test]
fn test_softmax_sums_to_one() {
    let mut x = [1.0, 2.0, 3.0];

    softmax(&mut x);

    assert!((x.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    assert!(x[2] > x[1] && x[1] > x[0]);
}
