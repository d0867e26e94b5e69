use std::sync::Arc;

use ewfuse::{DType, Device, DeviceTensor};
use half::f16;

use crate::harness::{download_f16, download_f32, engine, rand_state, upload_f32, zeros};

pub fn transpose_swaps_axes<D: Device>(device: &Arc<D>) {
    let engine = engine(device);
    let (rows, cols) = (5usize, 37usize);
    let host: Vec<f32> = (0..rows * cols).map(|v| v as f32).collect();
    let input = upload_f32(device, &[rows, cols], &host);
    let out = zeros(device, DType::F32, &[cols, rows]);
    engine.transpose(&out, &input).expect("transpose");

    let got = download_f32(device, &out);
    for r in 0..rows {
        for c in 0..cols {
            assert_eq!(got[c * rows + r], host[r * cols + c]);
        }
    }
    assert!(engine.transpose(&input, &input).is_err());
}

pub fn transpose_f16_copies_bits<D: Device>(device: &Arc<D>) {
    let engine = engine(device);
    let values: Vec<f16> = (0..6).map(|v| f16::from_f32(v as f32 * 0.1)).collect();
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    let ptr = device.alloc(bytes.len()).expect("alloc");
    device.upload(ptr, &bytes).expect("upload");
    let input = DeviceTensor::new(ptr, DType::F16, vec![2, 3]);
    let out = zeros(device, DType::F16, &[3, 2]);
    engine.transpose(&out, &input).expect("transpose");
    let got = download_f16(device, &out);
    assert_eq!(
        got,
        [0, 3, 1, 4, 2, 5].map(|i| values[i]).to_vec()
    );
}

/// Increments far below the sum's resolution accumulate in the compensation term.
pub fn compensated_sum_keeps_lost_bits<D: Device>(device: &Arc<D>) {
    let engine = engine(device);
    let rs = rand_state(device, 31);
    let shape = [2, 8];
    let sum = upload_f32(device, &shape, &[1.0; 16]);
    let cmp = zeros(device, DType::F32, &shape);
    let tiny = 2f32.powi(-30);
    let add = upload_f32(device, &shape, &[tiny; 16]);
    for _ in 0..8 {
        engine
            .compensated_sum(&rs, &sum, &cmp, &add, 1.0, 1.0)
            .expect("compensated_sum");
    }
    assert_eq!(download_f32(device, &sum), vec![1.0; 16]);
    assert_eq!(download_f32(device, &cmp), vec![-8.0 * tiny; 16]);

    let plain = zeros(device, DType::F32, &shape);
    let plain_cmp = zeros(device, DType::F32, &shape);
    let three = upload_f32(device, &shape, &[3.0; 16]);
    engine
        .compensated_sum(&rs, &plain, &plain_cmp, &three, 1.0, 0.5)
        .expect("compensated_sum");
    assert_eq!(download_f32(device, &plain), vec![1.5; 16]);
    assert_eq!(download_f32(device, &plain_cmp), vec![0.0; 16]);
}

/// `CTRSK -> KTRSC` across several tiles in both swapped axes.
pub fn dim_shuffle_matches_host_permutation<D: Device>(device: &Arc<D>) {
    let engine = engine(device);
    let [c, t, r, s, k] = [35usize, 2, 3, 2, 40];
    let host: Vec<f32> = (0..c * t * r * s * k).map(|v| v as f32).collect();
    let input = upload_f32(device, &[c, t, r, s, k], &host);
    let out = zeros(device, DType::F32, &[k, t, r, s, c]);
    engine.dim_shuffle(&out, &input).expect("dim_shuffle");

    let got = download_f32(device, &out);
    for ci in 0..c {
        for trs in 0..t * r * s {
            for ki in 0..k {
                let src = (ci * t * r * s + trs) * k + ki;
                let dst = (ki * t * r * s + trs) * c + ci;
                assert_eq!(got[dst], host[src], "c={ci} trs={trs} k={ki}");
            }
        }
    }
    assert!(engine.dim_shuffle(&input, &input).is_err());
}
