use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ewfuse::stages::StageKind;
use rstest::rstest;
use ewfuse::{
    Arg, DType, Device, DevicePtr, DeviceTensor, Engine, EngineConfig, FuseError, FuseResult,
    KernelArg, KernelProgram, KernelSource, LaunchConfig, Op, RandState,
};

/// Device that records compiles and launches without executing anything.
#[derive(Default)]
struct RecordingDevice {
    compiles: Mutex<Vec<String>>,
    launches: Mutex<Vec<(String, LaunchConfig, Vec<KernelArg>)>>,
    next_addr: AtomicU64,
}

impl RecordingDevice {
    fn compile_count(&self) -> usize {
        self.compiles.lock().expect("compiles poisoned").len()
    }

    fn launches(&self) -> Vec<(String, LaunchConfig, Vec<KernelArg>)> {
        self.launches.lock().expect("launches poisoned").clone()
    }
}

impl Device for RecordingDevice {
    type Kernel = (String, Arc<KernelProgram>);

    fn name(&self) -> &str {
        "recording"
    }

    fn compile(&self, source: &KernelSource) -> FuseResult<Self::Kernel> {
        self.compiles
            .lock()
            .expect("compiles poisoned")
            .push(source.symbol.clone());
        Ok((source.symbol.clone(), Arc::clone(&source.program)))
    }

    fn launch(
        &self,
        kernel: &Self::Kernel,
        config: LaunchConfig,
        args: &[KernelArg],
    ) -> FuseResult<()> {
        self.launches.lock().expect("launches poisoned").push((
            kernel.0.clone(),
            config,
            args.to_vec(),
        ));
        Ok(())
    }

    fn alloc(&self, bytes: usize) -> FuseResult<DevicePtr> {
        let addr = self.next_addr.fetch_add(bytes as u64 + 256, Ordering::Relaxed);
        Ok(DevicePtr(0x1000 + addr))
    }

    fn free(&self, _ptr: DevicePtr) -> FuseResult<()> {
        Ok(())
    }

    fn upload(&self, _dst: DevicePtr, _bytes: &[u8]) -> FuseResult<()> {
        Ok(())
    }

    fn download(&self, _src: DevicePtr, _len: usize) -> FuseResult<Vec<u8>> {
        Err(FuseError::device("recording device holds no data"))
    }
}

fn engine() -> (Arc<RecordingDevice>, Engine<RecordingDevice>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let device = Arc::new(RecordingDevice::default());
    let engine = Engine::new(Arc::clone(&device)).with_config(EngineConfig::default());
    (device, engine)
}

fn tensor(device: &RecordingDevice, shape: &[usize]) -> DeviceTensor {
    let len: usize = shape.iter().product();
    let ptr = device.alloc(len * 4).expect("alloc");
    DeviceTensor::new(ptr, DType::F32, shape.to_vec())
}

#[test]
fn duplicate_reductions_compile_one_reduction_stage() -> anyhow::Result<()> {
    let (device, engine) = engine();
    let rs = RandState::allocate(device.as_ref(), 1)?;
    let a = tensor(&device, &[4, 64]);
    let c = tensor(&device, &[4, 1]);

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

    let launches = device.launches();
    assert_eq!(launches.len(), 1);
    let (symbol, config, kargs) = &launches[0];
    assert!(symbol.starts_with("ew_sum_add_"));
    assert_eq!(config.grid, (4, 1, 1));
    assert_eq!(config.block, (32, 1, 1));
    assert_eq!(config.shared_mem_bytes, 0);
    // rand, out(3), a(3), n0, unused, terminal bound
    assert_eq!(kargs.len(), 10);
    assert_eq!(kargs[7], KernelArg::I32(64));
    assert_eq!(kargs[8], KernelArg::I32(64));
    Ok(())
}

#[test]
fn structurally_equal_calls_share_a_kernel() -> anyhow::Result<()> {
    let (device, engine) = engine();
    let rs = RandState::allocate(device.as_ref(), 2)?;
    for _ in 0..3 {
        let a = tensor(&device, &[16, 32]);
        let b = tensor(&device, &[16, 32]);
        let c = tensor(&device, &[16, 32]);
        engine.evaluate(
            &rs,
            &[
                Arg::Tensor(&c),
                Arg::Tensor(&a),
                Arg::Tensor(&b),
                Arg::op(Op::Mul),
                Arg::Const(0.5),
                Arg::op(Op::Add),
                Arg::assign(),
            ],
        )?;
    }
    assert_eq!(device.compile_count(), 1);
    let stats = engine.cache_stats()?;
    assert_eq!(stats.builds, 1);
    assert_eq!(stats.hits, 2);
    assert_eq!(device.launches().len(), 3);
    Ok(())
}

#[test]
fn mismatched_shapes_fail_before_any_launch() -> anyhow::Result<()> {
    let (device, engine) = engine();
    let rs = RandState::allocate(device.as_ref(), 3)?;
    let a = tensor(&device, &[3, 4]);
    let b = tensor(&device, &[3, 5]);
    let c = tensor(&device, &[3, 4]);
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
    assert_eq!(device.compile_count(), 0);
    assert!(device.launches().is_empty());
    Ok(())
}

#[test]
fn reduced_value_into_full_output_is_rejected() -> anyhow::Result<()> {
    let (device, engine) = engine();
    let rs = RandState::allocate(device.as_ref(), 4)?;
    let a = tensor(&device, &[4, 8]);
    let c = tensor(&device, &[4, 8]);
    let err = engine
        .evaluate(
            &rs,
            &[
                Arg::Tensor(&c),
                Arg::Tensor(&a),
                Arg::reduce(Op::Max, 1),
                Arg::assign(),
            ],
        )
        .unwrap_err();
    assert!(matches!(err, FuseError::ShapeCompatibility { .. }), "{err}");
    assert_eq!(device.compile_count(), 0);
    assert!(device.launches().is_empty());
    assert_eq!(engine.cache_stats()?.builds, 0);

    // the same reduction into a reduced output is fine
    let c = tensor(&device, &[4, 1]);
    engine.evaluate(
        &rs,
        &[
            Arg::Tensor(&c),
            Arg::Tensor(&a),
            Arg::reduce(Op::Max, 1),
            Arg::assign(),
        ],
    )?;
    assert_eq!(device.compile_count(), 1);
    Ok(())
}

#[test]
fn short_strides_are_rejected_before_compiling() -> anyhow::Result<()> {
    let (device, engine) = engine();
    let rs = RandState::allocate(device.as_ref(), 8)?;
    let a = tensor(&device, &[3, 4]).with_strides(vec![4]);
    let c = tensor(&device, &[3, 4]);
    let err = engine
        .evaluate(
            &rs,
            &[
                Arg::Tensor(&c),
                Arg::Tensor(&a),
                Arg::op(Op::Exp),
                Arg::assign(),
            ],
        )
        .unwrap_err();
    assert!(matches!(err, FuseError::UnsupportedShape { .. }), "{err}");
    assert_eq!(device.compile_count(), 0);
    Ok(())
}

#[rstest]
#[case(100, 32, 0)]
#[case(300, 64, 256)]
#[case(600, 128, 512)]
#[case(1500, 256, 1024)]
#[case(3000, 512, 2048)]
#[case(5000, 1024, 4096)]
fn reduction_width_picks_threads_and_shared_memory(
    #[case] width: usize,
    #[case] threads: u32,
    #[case] shared: u32,
) -> anyhow::Result<()> {
    let (device, engine) = engine();
    let rs = RandState::allocate(device.as_ref(), 5)?;
    let a = tensor(&device, &[1, width]);
    let c = tensor(&device, &[1, 1]);
    engine.evaluate(
        &rs,
        &[
            Arg::Tensor(&c),
            Arg::Tensor(&a),
            Arg::reduce(Op::Sum, 1),
            Arg::assign(),
        ],
    )?;
    let (_, config, _) = &device.launches()[0];
    assert_eq!(config.block, (threads, 1, 1));
    assert_eq!(config.shared_mem_bytes, shared);
    Ok(())
}

#[test]
fn reduction_terminal_stage_is_a_single_store() -> anyhow::Result<()> {
    let (device, engine) = engine();
    let rs = RandState::allocate(device.as_ref(), 6)?;
    let a = tensor(&device, &[2, 40]);
    let c = tensor(&device, &[2, 1]);
    let args = [
        Arg::Tensor(&c),
        Arg::Tensor(&a),
        Arg::reduce(Op::Sum, 1),
        Arg::Const(2.0),
        Arg::op(Op::Mul),
        Arg::assign(),
    ];
    engine.evaluate(&rs, &args)?;
    let source = engine
        .cache()
        .get_or_build(
            &ewfuse::KernelKey::Fused(ewfuse::Signature::new(vec![
                ewfuse::SigItem::Tensor {
                    slot: 0,
                    dtype: DType::F32,
                    take: ewfuse::TakeMode::None,
                },
                ewfuse::SigItem::Tensor {
                    slot: 1,
                    dtype: DType::F32,
                    take: ewfuse::TakeMode::None,
                },
                ewfuse::SigItem::Op { op: Op::Sum, id: 0 },
                ewfuse::SigItem::Const { slot: 2 },
                ewfuse::SigItem::Op { op: Op::Mul, id: 1 },
                ewfuse::SigItem::Assign {
                    id: 2,
                    stochastic: false,
                    threads: 32,
                },
            ])),
            None,
            |_| Err(FuseError::device("expected a cache hit")),
        )?;
    let KernelProgram::Fused(plan) = source.source.program.as_ref() else {
        panic!("fused program expected");
    };
    let kinds: Vec<StageKind> = plan.stages.iter().map(|s| s.kind).collect();
    assert_eq!(
        kinds,
        vec![StageKind::Reduction, StageKind::Scalar, StageKind::RedOut]
    );
    assert_eq!(device.compile_count(), 1);
    Ok(())
}

#[test]
fn convert_f32_targets_a_flat_layout() -> anyhow::Result<()> {
    let (device, engine) = engine();
    let src = device.alloc(1024 * 4)?;
    let dest = DeviceTensor::new(device.alloc(1024 * 2)?, DType::F16, vec![32, 32]);
    engine.convert_f32(src, &dest)?;
    let (_, config, kargs) = &device.launches()[0];
    assert_eq!(config.grid, (4, 1, 1));
    assert_eq!(kargs[4], KernelArg::Ptr(src));
    assert_eq!(kargs.last(), Some(&KernelArg::I32(256)));

    let strided = dest.clone().transposed();
    assert!(matches!(
        engine.convert_f32(src, &strided),
        Err(FuseError::UnsupportedShape { .. })
    ));
    Ok(())
}

#[test]
fn rank_three_broadcasts_are_unsupported() -> anyhow::Result<()> {
    let (device, engine) = engine();
    let rs = RandState::allocate(device.as_ref(), 7)?;
    let a = tensor(&device, &[2, 3, 4]);
    let v = tensor(&device, &[4]);
    let c = tensor(&device, &[2, 3, 4]);
    let err = engine
        .evaluate(
            &rs,
            &[
                Arg::Tensor(&c),
                Arg::Tensor(&a),
                Arg::Tensor(&v),
                Arg::op(Op::Add),
                Arg::assign(),
            ],
        )
        .unwrap_err();
    assert!(matches!(err, FuseError::UnsupportedShape { .. }), "{err}");

    // plain contiguous rank-3 work is flattened instead
    engine.evaluate(
        &rs,
        &[
            Arg::Tensor(&c),
            Arg::Tensor(&a),
            Arg::op(Op::Sqr),
            Arg::assign(),
        ],
    )?;
    let (_, config, _) = &device.launches()[0];
    assert_eq!(config.grid, (1, 1, 1));
    Ok(())
}
