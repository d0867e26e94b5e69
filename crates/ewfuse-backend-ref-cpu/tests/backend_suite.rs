use std::sync::Arc;

use ewfuse::{Arg, DType, Device, Engine, EngineConfig, Op};
use ewfuse_backend_ref_cpu::HostDevice;
use ewfuse_backend_tests::{fused, harness};
use rstest::rstest;

ewfuse_backend_tests::define_backend_tests!(ref_cpu, || Arc::new(HostDevice::new()));

fn device() -> Arc<HostDevice> {
    let _ = env_logger::builder().is_test(true).try_init();
    Arc::new(HostDevice::new())
}

#[rstest]
#[case::add_row_vector(Op::Add, 4, 33, [1, 33])]
#[case::mul_column_vector(Op::Mul, 6, 20, [6, 1])]
#[case::sub_scalar_like(Op::Sub, 3, 3, [1, 1])]
#[case::pow_wide_rows(Op::Pow, 2, 600, [1, 600])]
#[case::mul_wide_column(Op::Mul, 3, 520, [3, 1])]
fn broadcast_matches_dense(
    #[case] op: Op,
    #[case] rows: usize,
    #[case] cols: usize,
    #[case] b_shape: [usize; 2],
) {
    fused::broadcast_matches_dense(&device(), op, rows, cols, b_shape);
}

#[test]
fn duplicate_subexpressions_compile_once() -> anyhow::Result<()> {
    let device = device();
    let engine = Engine::new(Arc::clone(&device)).with_config(EngineConfig::default());
    let rs = harness::rand_state(&device, 40);
    let a = harness::upload_f32(&device, &[4, 64], &[0.5; 256]);
    let c = harness::zeros(&device, DType::F32, &[4, 1]);
    let args = [
        Arg::Tensor(&c),
        Arg::Tensor(&a),
        Arg::reduce(Op::Sum, 1),
        Arg::Tensor(&a),
        Arg::reduce(Op::Sum, 1),
        Arg::op(Op::Add),
        Arg::assign(),
    ];
    engine.evaluate(&rs, &args)?;
    engine.evaluate(&rs, &args)?;
    assert_eq!(harness::download_f32(&device, &c), vec![64.0; 4]);
    assert_eq!(device.compile_count(), 1);
    assert_eq!(device.launch_count(), 2);
    Ok(())
}

#[test]
fn random_draws_stay_in_unit_interval_and_advance() -> anyhow::Result<()> {
    let device = device();
    let engine = Engine::new(Arc::clone(&device)).with_config(EngineConfig::default());
    let rs = harness::rand_state(&device, 41);
    let c = harness::zeros(&device, DType::F32, &[8, 64]);
    let draw = |engine: &Engine<HostDevice>| -> anyhow::Result<Vec<f32>> {
        engine.evaluate(&rs, &[Arg::Tensor(&c), Arg::op(Op::Rand), Arg::assign()])?;
        Ok(harness::download_f32(&device, &c))
    };
    let first = draw(&engine)?;
    let second = draw(&engine)?;
    assert!(first.iter().all(|v| (0.0..1.0).contains(v)));
    assert_ne!(first, second);
    Ok(())
}

#[test]
fn freed_memory_is_unmapped() -> anyhow::Result<()> {
    let device = device();
    let ptr = device.alloc(64)?;
    device.upload(ptr, &[7; 64])?;
    assert_eq!(device.download(ptr, 64)?, vec![7; 64]);
    device.free(ptr)?;
    assert!(device.download(ptr, 1).is_err());
    Ok(())
}
