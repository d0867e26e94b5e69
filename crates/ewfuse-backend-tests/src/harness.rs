use std::sync::Arc;

use ewfuse::{DType, Device, DeviceTensor, Engine, EngineConfig, RandState};

/// Engine with a private cache and default configuration, independent of the
/// process environment.
pub fn engine<D: Device>(device: &Arc<D>) -> Engine<D> {
    Engine::new(Arc::clone(device)).with_config(EngineConfig::default())
}

pub fn rand_state<D: Device>(device: &Arc<D>, seed: u64) -> RandState {
    RandState::allocate(device.as_ref(), seed).expect("allocate rand state")
}

pub fn upload_f32<D: Device>(device: &Arc<D>, shape: &[usize], data: &[f32]) -> DeviceTensor {
    assert_eq!(shape.iter().product::<usize>(), data.len());
    let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
    let ptr = device.alloc(bytes.len()).expect("alloc");
    device.upload(ptr, &bytes).expect("upload");
    DeviceTensor::new(ptr, DType::F32, shape.to_vec())
}

pub fn upload_i32<D: Device>(device: &Arc<D>, data: &[i32]) -> DeviceTensor {
    let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
    let ptr = device.alloc(bytes.len()).expect("alloc");
    device.upload(ptr, &bytes).expect("upload");
    DeviceTensor::new(ptr, DType::Si32, vec![data.len()])
}

/// Zeroed tensor of `dtype`.
pub fn zeros<D: Device>(device: &Arc<D>, dtype: DType, shape: &[usize]) -> DeviceTensor {
    let len: usize = shape.iter().product();
    let ptr = device.alloc(len * dtype.size_in_bytes()).expect("alloc");
    DeviceTensor::new(ptr, dtype, shape.to_vec())
}

fn raw<D: Device>(device: &Arc<D>, tensor: &DeviceTensor) -> Vec<u8> {
    device
        .download(tensor.ptr(), tensor.len() * tensor.dtype().size_in_bytes())
        .expect("download")
}

pub fn download_f32<D: Device>(device: &Arc<D>, tensor: &DeviceTensor) -> Vec<f32> {
    assert_eq!(tensor.dtype(), DType::F32);
    raw(device, tensor)
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn download_f16<D: Device>(device: &Arc<D>, tensor: &DeviceTensor) -> Vec<half::f16> {
    assert_eq!(tensor.dtype(), DType::F16);
    raw(device, tensor)
        .chunks_exact(2)
        .map(|c| half::f16::from_bits(u16::from_le_bytes([c[0], c[1]])))
        .collect()
}

pub fn download_i32<D: Device>(device: &Arc<D>, tensor: &DeviceTensor) -> Vec<i32> {
    assert_eq!(tensor.dtype(), DType::Si32);
    raw(device, tensor)
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn assert_close(actual: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        let scale = e.abs().max(1.0);
        assert!(
            (a - e).abs() <= tol * scale,
            "element {i}: got {a}, expected {e}"
        );
    }
}
