use std::sync::Arc;

use ewfuse_backend_cuda::CudaDevice;
use ewfuse_backend_tests::{auxiliary, fused, reduction, rounding};

fn device_or_skip() -> Option<Arc<CudaDevice>> {
    let _ = env_logger::builder().is_test(true).try_init();
    if !CudaDevice::is_available() {
        eprintln!("skipping cuda backend test: CUDA driver unavailable");
        return None;
    }
    match CudaDevice::new() {
        Ok(device) => Some(Arc::new(device)),
        Err(err) => {
            eprintln!("skipping cuda backend test: {err}");
            None
        }
    }
}

macro_rules! cuda_test {
    ($name:ident, $func:path) => {
        #[test]
        fn $name() {
            let Some(device) = device_or_skip() else {
                return;
            };
            $func(&device);
        }
    };
}

cuda_test!(scaled_product_matches_host, fused::scaled_product_matches_host);
cuda_test!(mismatched_shapes_are_rejected, fused::mismatched_shapes_are_rejected);
cuda_test!(structural_repeats_reuse_kernel, fused::structural_repeats_reuse_kernel);
cuda_test!(take_gathers_rows_and_columns, fused::take_gathers_rows_and_columns);
cuda_test!(onehot_marks_labels, fused::onehot_marks_labels);
cuda_test!(transposed_view_matches_host, fused::transposed_view_matches_host);
cuda_test!(strided_view_matches_host, fused::strided_view_matches_host);
cuda_test!(output_read_back_accumulates, fused::output_read_back_accumulates);
cuda_test!(axis_sums_of_ones, reduction::axis_sums_of_ones);
cuda_test!(row_centering_matches_host, reduction::row_centering_matches_host);
cuda_test!(deep_sum_matches_host, reduction::deep_sum_matches_host);
cuda_test!(arg_reductions_prefer_first_index, reduction::arg_reductions_prefer_first_index);
cuda_test!(axis0_sum_over_gathered_rows, reduction::axis0_sum_over_gathered_rows);
cuda_test!(stochastic_f16_store_is_unbiased, rounding::stochastic_f16_store_is_unbiased);
cuda_test!(convert_f32_matches_half, rounding::convert_f32_matches_half);
cuda_test!(transpose_swaps_axes, auxiliary::transpose_swaps_axes);
cuda_test!(compensated_sum_keeps_lost_bits, auxiliary::compensated_sum_keeps_lost_bits);
cuda_test!(dim_shuffle_matches_host_permutation, auxiliary::dim_shuffle_matches_host_permutation);

#[test]
fn broadcast_row_vector_matches_dense() {
    let Some(device) = device_or_skip() else {
        return;
    };
    fused::broadcast_matches_dense(&device, ewfuse::Op::Add, 8, 700, [1, 700]);
}
