//! Numeric suites shared by every ewfuse device crate.
//!
//! Each suite is a plain function generic over [`ewfuse::Device`]; device
//! crates either call them directly or stamp out the whole set with
//! [`define_backend_tests!`].

pub mod auxiliary;
pub mod fused;
pub mod harness;
pub mod reduction;
pub mod rounding;

#[macro_export]
macro_rules! define_backend_tests {
    ($module:ident, $device_ctor:expr) => {
        #[cfg(test)]
        mod $module {
            use super::*;
            use $crate::{auxiliary, fused, reduction, rounding};

            macro_rules! suite_test {
                ($name:ident, $func:path) => {
                    #[test]
                    fn $name() {
                        let device = ($device_ctor)();
                        $func(&device);
                    }
                };
            }

            suite_test!(fused_scaled_product_matches_host, fused::scaled_product_matches_host);
            suite_test!(fused_mismatched_shapes_are_rejected, fused::mismatched_shapes_are_rejected);
            suite_test!(fused_structural_repeats_reuse_kernel, fused::structural_repeats_reuse_kernel);
            suite_test!(fused_take_gathers_rows_and_columns, fused::take_gathers_rows_and_columns);
            suite_test!(fused_onehot_marks_labels, fused::onehot_marks_labels);
            suite_test!(fused_transposed_view_matches_host, fused::transposed_view_matches_host);
            suite_test!(fused_strided_view_matches_host, fused::strided_view_matches_host);
            suite_test!(fused_output_read_back_accumulates, fused::output_read_back_accumulates);

            suite_test!(reduction_axis_sums_of_ones, reduction::axis_sums_of_ones);
            suite_test!(reduction_row_centering_matches_host, reduction::row_centering_matches_host);
            suite_test!(reduction_deep_sum_matches_host, reduction::deep_sum_matches_host);
            suite_test!(reduction_max_and_min_of_negatives, reduction::max_and_min_of_negatives);
            suite_test!(reduction_arg_reductions_prefer_first_index, reduction::arg_reductions_prefer_first_index);
            suite_test!(reduction_axis0_sum_over_gathered_rows, reduction::axis0_sum_over_gathered_rows);

            suite_test!(rounding_stochastic_f16_store_is_unbiased, rounding::stochastic_f16_store_is_unbiased);
            suite_test!(rounding_convert_f32_matches_half, rounding::convert_f32_matches_half);
            suite_test!(rounding_integer_stores_round_half_to_even, rounding::integer_stores_round_half_to_even);

            suite_test!(aux_transpose_swaps_axes, auxiliary::transpose_swaps_axes);
            suite_test!(aux_transpose_f16_copies_bits, auxiliary::transpose_f16_copies_bits);
            suite_test!(aux_compensated_sum_keeps_lost_bits, auxiliary::compensated_sum_keeps_lost_bits);
            suite_test!(aux_dim_shuffle_matches_host_permutation, auxiliary::dim_shuffle_matches_host_permutation);
        }
    };
}
