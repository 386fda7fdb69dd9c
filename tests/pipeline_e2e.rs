//! End-to-end runs of the vector-add pipeline on the host runtime

mod common;

use common::{expected_demo_sums, host_runtime, init_logger, vec_approx_eq};
use hostcl::{
    DispatchError, FixedSelection, HostDevice, HostPlatform, HostRuntime, PipelineConfig,
    PipelineDriver, PipelineState, demo_inputs,
};
use rstest::rstest;

#[rstest]
#[case(Some(10))]
#[case(Some(5))]
#[case(Some(2))]
#[case(Some(1))]
#[case(None)]
fn test_demo_scenario(#[case] local_size: Option<usize>) {
    init_logger();
    let mut config = PipelineConfig::default();
    config.local_size = local_size;
    let mut driver = PipelineDriver::new(host_runtime(), config);
    let (a, b) = demo_inputs();

    let report = driver
        .run_vector_add(&mut FixedSelection::default(), &a, &b)
        .unwrap();

    let results = report.results();
    assert!(
        vec_approx_eq(&results, &expected_demo_sums()),
        "local {local_size:?}: {results:?}"
    );
    for (a, b, r) in &report.rows {
        assert!(common::approx_eq(a + b, *r));
    }
    assert_eq!(report.platform.name, "hostcl Reference Platform");
    assert_eq!(driver.state(), &PipelineState::Done);
}

#[test]
fn test_indivisible_local_size_fails_at_launch() {
    init_logger();
    let config = PipelineConfig::builder().local_size(3).build();
    let mut driver = PipelineDriver::new(host_runtime(), config);
    let (a, b) = demo_inputs();

    let err = driver
        .run_vector_add(&mut FixedSelection::default(), &a, &b)
        .unwrap_err();
    assert!(matches!(err, DispatchError::InvalidWorkSize { .. }));
    assert_eq!(driver.failed_at(), Some(&PipelineState::Launched));
}

#[test]
fn test_compile_failure_is_isolated() {
    init_logger();
    let config = PipelineConfig::builder()
        .source(
            "__kernel void parallel_add(__global float* x, __global float* y, __global float* z){\n\
             const int i = get_global_id(0)\n\
             z[i] = y[i] + x[i];\n}",
        )
        .build();
    let mut driver = PipelineDriver::new(host_runtime(), config);
    let (a, b) = demo_inputs();

    match driver.run_vector_add(&mut FixedSelection::default(), &a, &b) {
        Err(DispatchError::Compilation { code, log }) => {
            assert_eq!(code, -11);
            assert!(log.contains("3:"), "diagnostic should point at line 3: {log}");
        }
        other => panic!("expected a compilation error, got {other:?}"),
    }
    assert_eq!(driver.failed_at(), Some(&PipelineState::ProgramBuilt));
    assert!(!driver.trace().contains(&PipelineState::KernelBound));
}

#[test]
fn test_missing_entry_point_fails_at_kernel() {
    init_logger();
    let config = PipelineConfig::builder().entry("parallel_mul").build();
    let mut driver = PipelineDriver::new(host_runtime(), config);
    let (a, b) = demo_inputs();

    let err = driver
        .run_vector_add(&mut FixedSelection::default(), &a, &b)
        .unwrap_err();
    assert_eq!(err.stage(), "kernel extraction");
    assert_eq!(driver.failed_at(), Some(&PipelineState::KernelBound));
}

#[test]
fn test_selects_second_device_by_type() {
    init_logger();
    let runtime = HostRuntime::empty()
        .with_platform(HostPlatform::new("Empty"))
        .with_platform(
            HostPlatform::new("Mixed")
                .device(HostDevice::cpu("cpu0"))
                .device(HostDevice::gpu("gpu0"))
                .device(HostDevice::gpu("gpu1").max_work_group_size(2)),
        )
        .into_handle();
    let config = PipelineConfig::builder()
        .device_filter(hostcl::DeviceFilter::Gpu)
        .local_size(2)
        .build();
    let mut driver = PipelineDriver::new(runtime, config);
    let (a, b) = demo_inputs();

    let report = driver
        .run_vector_add(&mut FixedSelection::new(2, 2), &a, &b)
        .unwrap();
    assert_eq!(report.platform.name, "Mixed");
    assert_eq!(report.device.name, "gpu1");
    assert!(vec_approx_eq(&report.results(), &expected_demo_sums()));
}

#[test]
fn test_work_group_over_device_limit() {
    init_logger();
    let runtime = HostRuntime::empty()
        .with_platform(
            HostPlatform::new("Small").device(HostDevice::accelerator("tiny").max_work_group_size(4)),
        )
        .into_handle();
    let config = PipelineConfig::builder().local_size(5).build();
    let mut driver = PipelineDriver::new(runtime, config);
    let (a, b) = demo_inputs();

    let err = driver
        .run_vector_add(&mut FixedSelection::default(), &a, &b)
        .unwrap_err();
    assert!(matches!(err, DispatchError::InvalidWorkSize { local: Some(5), .. }));
}

#[test]
fn test_empty_platform_reports_no_device() {
    init_logger();
    let runtime = HostRuntime::empty()
        .with_platform(HostPlatform::new("Empty"))
        .into_handle();
    let mut driver = PipelineDriver::new(runtime, PipelineConfig::default());
    let (a, b) = demo_inputs();

    let err = driver
        .run_vector_add(&mut FixedSelection::default(), &a, &b)
        .unwrap_err();
    assert!(matches!(err, DispatchError::NoDevice { .. }));
    assert_eq!(driver.failed_at(), Some(&PipelineState::DevicesListed));
}

#[test]
fn test_unavailable_device_fails_context() {
    init_logger();
    let runtime = HostRuntime::empty()
        .with_platform(HostPlatform::new("Lab").device(HostDevice::gpu("broken").unavailable()))
        .into_handle();
    let mut driver = PipelineDriver::new(runtime, PipelineConfig::default());
    let (a, b) = demo_inputs();

    let err = driver
        .run_vector_add(&mut FixedSelection::default(), &a, &b)
        .unwrap_err();
    assert_eq!(err.code(), -2);
    assert_eq!(driver.failed_at(), Some(&PipelineState::ContextReady));
}

#[test]
fn test_custom_kernel_with_build_options() {
    init_logger();
    let config = PipelineConfig::builder()
        .source(
            "// weighted sum\n\
             __kernel void weighted(__global const float* x, __global const float* y, __global float* z) {\n\
                 int i = get_global_id(0);\n\
                 z[i] = x[i] * WEIGHT + y[i];\n\
             }",
        )
        .entry("weighted")
        .build_options("-D WEIGHT=2.0f")
        .build();
    let mut driver = PipelineDriver::new(host_runtime(), config);

    let report = driver
        .run_vector_add(&mut FixedSelection::default(), &[1.0, 2.0], &[0.5, 0.25])
        .unwrap();
    assert!(vec_approx_eq(&report.results(), &[2.5, 4.25]));
}
