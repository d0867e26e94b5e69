use std::sync::Arc;

use ewfuse::{Arg, DType, Device, Op, Rounding};
use half::f16;

use crate::harness::{download_f16, download_i32, engine, rand_state, upload_f32, zeros};

const SAMPLES: usize = 4096;

/// `1 + 2^-12` sits a quarter of the way between two adjacent `f16` values.
/// Stochastic stores must average to it; nearest stores must all read `1.0`.
pub fn stochastic_f16_store_is_unbiased<D: Device>(device: &Arc<D>) {
    let engine = engine(device);
    let rs = rand_state(device, 21);
    let value = 1.0 + 2f32.powi(-12);
    let a = upload_f32(device, &[SAMPLES], &vec![value; SAMPLES]);
    let out = zeros(device, DType::F16, &[SAMPLES])
        .with_rounding(Rounding::Stochastic { mantissa_bits: 10 });

    engine
        .evaluate(
            &rs,
            &[Arg::Tensor(&out), Arg::Tensor(&a), Arg::assign_rounded()],
        )
        .expect("stochastic store");
    let lo = f16::from_f32(1.0);
    let hi = f16::from_f32(1.0 + 2f32.powi(-10));
    let stored = download_f16(device, &out);
    assert!(stored.iter().all(|v| *v == lo || *v == hi));
    let mean = stored.iter().map(|v| v.to_f64()).sum::<f64>() / SAMPLES as f64;
    assert!(
        (mean - value as f64).abs() < 2f64.powi(-14),
        "mean {mean} drifted from {value}"
    );

    engine
        .evaluate(&rs, &[Arg::Tensor(&out), Arg::Tensor(&a), Arg::assign()])
        .expect("nearest store");
    assert!(download_f16(device, &out).iter().all(|v| *v == lo));
}

/// `convert_f32` narrows with round-to-nearest-even.
pub fn convert_f32_matches_half<D: Device>(device: &Arc<D>) {
    let engine = engine(device);
    let host: Vec<f32> = (0..300).map(|i| (i as f32 - 150.0) * 0.013_7).collect();
    let src = upload_f32(device, &[300], &host);
    let dest = zeros(device, DType::F16, &[300]);
    engine.convert_f32(src.ptr(), &dest).expect("convert");
    let expected: Vec<f16> = host.iter().map(|v| f16::from_f32(*v)).collect();
    assert_eq!(download_f16(device, &dest), expected);
}

pub fn integer_stores_round_half_to_even<D: Device>(device: &Arc<D>) {
    let engine = engine(device);
    let rs = rand_state(device, 22);
    let a = upload_f32(device, &[4], &[0.5, 1.5, 2.5, -2.5]);
    let c = zeros(device, DType::Si32, &[4]);
    engine
        .evaluate(
            &rs,
            &[
                Arg::Tensor(&c),
                Arg::Tensor(&a),
                Arg::Const(1.0),
                Arg::op(Op::Mul),
                Arg::assign(),
            ],
        )
        .expect("evaluate");
    assert_eq!(download_i32(device, &c), vec![0, 2, 2, -2]);
}
