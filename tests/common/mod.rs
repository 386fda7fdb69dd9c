//! Common test utilities for pipeline integration tests
#![allow(dead_code)]

use hostcl::{Context, DeviceFilter, HostRuntime, ResourceEnumerator, RuntimeHandle};

pub const EPSILON: f32 = 1e-5;

pub fn approx_eq(a: f32, b: f32) -> bool {
    (a - b).abs() < EPSILON
}

pub fn vec_approx_eq(a: &[f32], b: &[f32]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).all(|(x, y)| approx_eq(*x, *y))
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// `[0.1, 1.2, 2.3, ..., 10.0]`, the demo workload's expected output.
pub fn expected_demo_sums() -> Vec<f32> {
    (0..10).map(|i| i as f32 + (i + 1) as f32 / 10.0).collect()
}

pub fn host_runtime() -> RuntimeHandle {
    HostRuntime::new().into_handle()
}

/// A context on the first device of the first platform.
pub fn first_context(runtime: &RuntimeHandle) -> Context {
    let enumerator = ResourceEnumerator::new(runtime.clone());
    let platform = enumerator.list_platforms().unwrap().remove(0);
    let device = enumerator
        .list_devices(&platform, DeviceFilter::All)
        .unwrap()
        .remove(0);
    Context::new(runtime, &device).unwrap()
}
