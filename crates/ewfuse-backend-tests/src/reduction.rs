use std::sync::Arc;

use ewfuse::{Arg, DType, Device, Op};

use crate::harness::{
    assert_close, download_f32, download_i32, engine, rand_state, upload_f32, upload_i32, zeros,
};

/// Sums of a 4x5 block of ones along each axis.
pub fn axis_sums_of_ones<D: Device>(device: &Arc<D>) {
    let engine = engine(device);
    let rs = rand_state(device, 11);
    let a = upload_f32(device, &[4, 5], &[1.0; 20]);

    let cols = zeros(device, DType::F32, &[1, 5]);
    engine
        .evaluate(
            &rs,
            &[Arg::Tensor(&cols), Arg::Tensor(&a), Arg::reduce(Op::Sum, 0), Arg::assign()],
        )
        .expect("axis 0");
    assert_eq!(download_f32(device, &cols), vec![4.0; 5]);

    let rows = zeros(device, DType::F32, &[4, 1]);
    engine
        .evaluate(
            &rs,
            &[Arg::Tensor(&rows), Arg::Tensor(&a), Arg::reduce(Op::Sum, 1), Arg::assign()],
        )
        .expect("axis 1");
    assert_eq!(download_f32(device, &rows), vec![5.0; 4]);
}

/// `C = A - sum(A, 1) / n`: a reduction stage feeding the elementwise store.
pub fn row_centering_matches_host<D: Device>(device: &Arc<D>) {
    let engine = engine(device);
    let rs = rand_state(device, 12);
    let (rows, cols) = (3usize, 40usize);
    let host: Vec<f32> = (0..rows * cols).map(|v| (v % 9) as f32 - 4.0).collect();
    let a = upload_f32(device, &[rows, cols], &host);
    let c = zeros(device, DType::F32, &[rows, cols]);
    engine
        .evaluate(
            &rs,
            &[
                Arg::Tensor(&c),
                Arg::Tensor(&a),
                Arg::Tensor(&a),
                Arg::reduce(Op::Sum, 1),
                Arg::Const(1.0 / cols as f32),
                Arg::op(Op::Mul),
                Arg::op(Op::Sub),
                Arg::assign(),
            ],
        )
        .expect("evaluate");

    let mut expected = Vec::with_capacity(rows * cols);
    for row in host.chunks(cols) {
        let mean = row.iter().sum::<f32>() * (1.0 / cols as f32);
        expected.extend(row.iter().map(|v| v - mean));
    }
    assert_close(&download_f32(device, &c), &expected, 1e-5);
}

/// Reductions deep enough to need more than one warp per block.
pub fn deep_sum_matches_host<D: Device>(device: &Arc<D>) {
    let engine = engine(device);
    let rs = rand_state(device, 13);
    let (rows, depth) = (2usize, 3000usize);
    let host: Vec<f32> = (0..rows * depth).map(|v| (v % 7) as f32).collect();
    let a = upload_f32(device, &[rows, depth], &host);
    let c = zeros(device, DType::F32, &[rows, 1]);
    engine
        .evaluate(
            &rs,
            &[Arg::Tensor(&c), Arg::Tensor(&a), Arg::reduce(Op::Sum, 1), Arg::assign()],
        )
        .expect("evaluate");
    let expected: Vec<f32> = host.chunks(depth).map(|r| r.iter().sum()).collect();
    assert_eq!(download_f32(device, &c), expected);
}

pub fn max_and_min_of_negatives<D: Device>(device: &Arc<D>) {
    let engine = engine(device);
    let rs = rand_state(device, 14);
    let a = upload_f32(device, &[2, 3], &[-5.0, -2.0, -9.0, -0.5, -7.0, -3.0]);
    for (op, expected) in [(Op::Max, [-2.0, -0.5]), (Op::Min, [-9.0, -7.0])] {
        let c = zeros(device, DType::F32, &[2, 1]);
        engine
            .evaluate(
                &rs,
                &[Arg::Tensor(&c), Arg::Tensor(&a), Arg::reduce(op, 1), Arg::assign()],
            )
            .expect("evaluate");
        assert_eq!(download_f32(device, &c), expected);
    }
}

/// Arg-reductions report the first index among equal extremes.
pub fn arg_reductions_prefer_first_index<D: Device>(device: &Arc<D>) {
    let engine = engine(device);
    let rs = rand_state(device, 15);
    let a = upload_f32(
        device,
        &[2, 6],
        &[
            1.0, 5.0, 5.0, 2.0, 0.0, 5.0, //
            -1.0, -3.0, -1.0, -2.0, -1.0, -9.0,
        ],
    );
    for (op, expected) in [(Op::ArgMax, [1, 0]), (Op::ArgMin, [4, 5])] {
        let c = zeros(device, DType::Si32, &[2, 1]);
        engine
            .evaluate(
                &rs,
                &[Arg::Tensor(&c), Arg::Tensor(&a), Arg::reduce(op, 1), Arg::assign()],
            )
            .expect("evaluate");
        assert_eq!(download_i32(device, &c), expected, "{op}");
    }
}

/// Column sums over rows gathered through an index array, repeats included.
pub fn axis0_sum_over_gathered_rows<D: Device>(device: &Arc<D>) {
    let engine = engine(device);
    let rs = rand_state(device, 16);
    let host: Vec<f32> = (0..20).map(|v| v as f32).collect();
    let a = upload_f32(device, &[5, 4], &host);
    let rows = [3, 0, 4, 4];
    let index = upload_i32(device, &rows);
    let gathered = a.with_take(index.ptr(), 0, rows.len());
    let c = zeros(device, DType::F32, &[1, 4]);
    engine
        .evaluate(
            &rs,
            &[
                Arg::Tensor(&c),
                Arg::Tensor(&gathered),
                Arg::reduce(Op::Sum, 0),
                Arg::assign(),
            ],
        )
        .expect("evaluate");

    let expected: Vec<f32> = (0..4)
        .map(|col| rows.iter().map(|&r| host[r as usize * 4 + col]).sum())
        .collect();
    assert_eq!(download_f32(device, &c), expected);
}
