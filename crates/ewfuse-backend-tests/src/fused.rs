use std::sync::Arc;

use ewfuse::{Arg, DType, Device, DeviceTensor, FuseError, Op};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::harness::{
    assert_close, download_f32, engine, rand_state, upload_f32, upload_i32, zeros,
};

fn random(len: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen_range(0.25f32..2.0)).collect()
}

/// `C = 2.5 * A * B + 1` over a shape that takes the flat path.
pub fn scaled_product_matches_host<D: Device>(device: &Arc<D>) {
    let engine = engine(device);
    let rs = rand_state(device, 1);
    let shape = [7, 45];
    let a_host = random(7 * 45, 10);
    let b_host = random(7 * 45, 11);
    let a = upload_f32(device, &shape, &a_host);
    let b = upload_f32(device, &shape, &b_host);
    let c = zeros(device, DType::F32, &shape);

    engine
        .evaluate(
            &rs,
            &[
                Arg::Tensor(&c),
                Arg::Const(2.5),
                Arg::Tensor(&a),
                Arg::op(Op::Mul),
                Arg::Tensor(&b),
                Arg::op(Op::Mul),
                Arg::Const(1.0),
                Arg::op(Op::Add),
                Arg::assign(),
            ],
        )
        .expect("evaluate");

    let expected: Vec<f32> = a_host
        .iter()
        .zip(&b_host)
        .map(|(a, b)| 2.5 * a * b + 1.0)
        .collect();
    assert_close(&download_f32(device, &c), &expected, 1e-6);
}

/// `C = A op B` where `B` broadcasts from `b_shape` to `[rows, cols]`.
pub fn broadcast_matches_dense<D: Device>(
    device: &Arc<D>,
    op: Op,
    rows: usize,
    cols: usize,
    b_shape: [usize; 2],
) {
    let engine = engine(device);
    let rs = rand_state(device, 2);
    let a_host = random(rows * cols, 20);
    let b_host = random(b_shape[0] * b_shape[1], 21);
    let a = upload_f32(device, &[rows, cols], &a_host);
    let b = upload_f32(device, &b_shape, &b_host);
    let c = zeros(device, DType::F32, &[rows, cols]);

    engine
        .evaluate(
            &rs,
            &[
                Arg::Tensor(&c),
                Arg::Tensor(&a),
                Arg::Tensor(&b),
                Arg::op(op),
                Arg::assign(),
            ],
        )
        .expect("evaluate");

    let mut expected = Vec::with_capacity(rows * cols);
    for r in 0..rows {
        for col in 0..cols {
            let br = if b_shape[0] == 1 { 0 } else { r };
            let bc = if b_shape[1] == 1 { 0 } else { col };
            expected.push(op.apply(a_host[r * cols + col], b_host[br * b_shape[1] + bc]));
        }
    }
    assert_close(&download_f32(device, &c), &expected, 1e-5);
}

pub fn mismatched_shapes_are_rejected<D: Device>(device: &Arc<D>) {
    let engine = engine(device);
    let rs = rand_state(device, 3);
    let a = zeros(device, DType::F32, &[3, 4]);
    let b = zeros(device, DType::F32, &[3, 5]);
    let c = zeros(device, DType::F32, &[3, 4]);
    let err = engine
        .evaluate(
            &rs,
            &[
                Arg::Tensor(&c),
                Arg::Tensor(&a),
                Arg::Tensor(&b),
                Arg::op(Op::Add),
                Arg::assign(),
            ],
        )
        .unwrap_err();
    assert!(matches!(err, FuseError::ShapeCompatibility { .. }), "{err}");
}

/// Same structure with different tensors, constants and sizes compiles once.
pub fn structural_repeats_reuse_kernel<D: Device>(device: &Arc<D>) {
    let engine = engine(device);
    let rs = rand_state(device, 4);
    for (n, k) in [(64usize, 0.5f32), (96, 3.0), (128, -1.0)] {
        let a = upload_f32(device, &[n], &vec![1.0; n]);
        let c = zeros(device, DType::F32, &[n]);
        engine
            .evaluate(
                &rs,
                &[
                    Arg::Tensor(&c),
                    Arg::Tensor(&a),
                    Arg::Const(k),
                    Arg::op(Op::Mul),
                    Arg::assign(),
                ],
            )
            .expect("evaluate");
        assert_eq!(download_f32(device, &c), vec![k; n]);
    }
    let stats = engine.cache_stats().expect("stats");
    assert_eq!(stats.builds, 1);
    assert_eq!(stats.hits, 2);
}

/// Gathers rows (block take) and columns (loop take) through index arrays.
pub fn take_gathers_rows_and_columns<D: Device>(device: &Arc<D>) {
    let engine = engine(device);
    let rs = rand_state(device, 5);
    let host: Vec<f32> = (0..20).map(|v| v as f32).collect();
    let a = upload_f32(device, &[5, 4], &host);

    let rows = upload_i32(device, &[3, 0, 4]);
    let gathered = a.clone().with_take(rows.ptr(), 0, 3);
    let c = zeros(device, DType::F32, &[3, 4]);
    engine
        .evaluate(
            &rs,
            &[Arg::Tensor(&c), Arg::Tensor(&gathered), Arg::assign()],
        )
        .expect("row take");
    let expected: Vec<f32> = [3usize, 0, 4]
        .iter()
        .flat_map(|r| (0..4).map(move |col| (r * 4 + col) as f32))
        .collect();
    assert_eq!(download_f32(device, &c), expected);

    let cols = upload_i32(device, &[2, 0]);
    let gathered = a.with_take(cols.ptr(), 1, 2);
    let c = zeros(device, DType::F32, &[5, 2]);
    engine
        .evaluate(
            &rs,
            &[Arg::Tensor(&c), Arg::Tensor(&gathered), Arg::assign()],
        )
        .expect("column take");
    let expected: Vec<f32> = (0..5)
        .flat_map(|r| [2usize, 0].map(|col| (r * 4 + col) as f32))
        .collect();
    assert_eq!(download_f32(device, &c), expected);
}

/// `C[r, c] = 1` where `labels[r] == c`.
pub fn onehot_marks_labels<D: Device>(device: &Arc<D>) {
    let engine = engine(device);
    let rs = rand_state(device, 6);
    let labels = upload_i32(device, &[0, 2, 1]);
    let c = upload_f32(device, &[3, 4], &[9.0; 12]);
    engine
        .evaluate(
            &rs,
            &[Arg::Tensor(&c), Arg::onehot(&labels, 1), Arg::assign()],
        )
        .expect("evaluate");
    let expected = [
        1.0, 0.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0, //
        0.0, 1.0, 0.0, 0.0,
    ];
    assert_eq!(download_f32(device, &c), expected);
}

/// `C = A^T + 1` reading `A` through a swapped-stride view.
pub fn transposed_view_matches_host<D: Device>(device: &Arc<D>) {
    let engine = engine(device);
    let rs = rand_state(device, 7);
    let (rows, cols) = (5usize, 37usize);
    let host: Vec<f32> = (0..rows * cols).map(|v| v as f32).collect();
    let a = upload_f32(device, &[rows, cols], &host).transposed();
    assert!(a.is_transposed());
    let c = zeros(device, DType::F32, &[cols, rows]);
    engine
        .evaluate(
            &rs,
            &[
                Arg::Tensor(&c),
                Arg::Tensor(&a),
                Arg::Const(1.0),
                Arg::op(Op::Add),
                Arg::assign(),
            ],
        )
        .expect("evaluate");

    let mut expected = Vec::with_capacity(rows * cols);
    for i in 0..cols {
        for j in 0..rows {
            expected.push(host[j * cols + i] + 1.0);
        }
    }
    assert_eq!(download_f32(device, &c), expected);
}

/// `C = A * A` over a column slice of a wider buffer.
pub fn strided_view_matches_host<D: Device>(device: &Arc<D>) {
    let engine = engine(device);
    let rs = rand_state(device, 8);
    let host: Vec<f32> = (0..60).map(|v| v as f32 * 0.5).collect();
    let base = upload_f32(device, &[6, 10], &host);
    let a = DeviceTensor::new(base.ptr(), DType::F32, vec![6, 4]).with_strides(vec![10, 1]);
    assert!(!a.is_contiguous() && !a.is_transposed());
    let c = zeros(device, DType::F32, &[6, 4]);
    engine
        .evaluate(
            &rs,
            &[
                Arg::Tensor(&c),
                Arg::Tensor(&a),
                Arg::Tensor(&a),
                Arg::op(Op::Mul),
                Arg::assign(),
            ],
        )
        .expect("evaluate");

    let expected: Vec<f32> = (0..6)
        .flat_map(|r| (0..4).map(move |col| (r * 10 + col) as f32 * 0.5))
        .map(|v| v * v)
        .collect();
    assert_eq!(download_f32(device, &c), expected);
}

/// `C = C + A`: the output is read back before it is overwritten.
pub fn output_read_back_accumulates<D: Device>(device: &Arc<D>) {
    let engine = engine(device);
    let rs = rand_state(device, 9);
    let shape = [3, 40];
    let a_host = random(120, 30);
    let c_host = random(120, 31);
    let a = upload_f32(device, &shape, &a_host);
    let c = upload_f32(device, &shape, &c_host);
    for _ in 0..2 {
        engine
            .evaluate(
                &rs,
                &[
                    Arg::Tensor(&c),
                    Arg::Tensor(&c),
                    Arg::Tensor(&a),
                    Arg::op(Op::Add),
                    Arg::assign(),
                ],
            )
            .expect("evaluate");
    }
    let expected: Vec<f32> = c_host.iter().zip(&a_host).map(|(c, a)| c + a + a).collect();
    assert_close(&download_f32(device, &c), &expected, 1e-6);
}
