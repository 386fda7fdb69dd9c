//! Reference workload and pipeline configuration.

use typed_builder::TypedBuilder;

use crate::resource::DeviceFilter;

/// Element-wise vector addition, the reference workload.
pub const REFERENCE_KERNEL: &str = r#"
__kernel void parallel_add(__global float* x, __global float* y, __global float* z){
    const int i = get_global_id(0);
    z[i] = y[i] + x[i];
}
"#;

pub const REFERENCE_ENTRY: &str = "parallel_add";

/// Element count of the demo workload.
pub const DEMO_ELEMENTS: usize = 10;

/// Work-group size used unless configured otherwise: one group covers the demo.
pub const DEFAULT_LOCAL_SIZE: usize = DEMO_ELEMENTS;

/// Demo inputs: `a = 0, 1, ..., 9` and `b = 0.1, 0.2, ..., 1.0`.
pub fn demo_inputs() -> (Vec<f32>, Vec<f32>) {
    let a = (0..DEMO_ELEMENTS).map(|i| i as f32).collect();
    let b = (1..=DEMO_ELEMENTS).map(|i| i as f32 / 10.0).collect();
    (a, b)
}

/// What the pipeline builds and how it launches.
///
/// # Example
///
/// ```
/// use hostcl::PipelineConfig;
///
/// let config = PipelineConfig::builder().local_size(5).build();
/// assert_eq!(config.entry, "parallel_add");
/// assert_eq!(config.local_size, Some(5));
/// ```
#[derive(Debug, Clone, TypedBuilder)]
pub struct PipelineConfig {
    #[builder(default = REFERENCE_KERNEL.to_string(), setter(into))]
    pub source: String,
    #[builder(default = REFERENCE_ENTRY.to_string(), setter(into))]
    pub entry: String,
    #[builder(default, setter(into))]
    pub build_options: String,
    #[builder(default)]
    pub device_filter: DeviceFilter,
    /// Work-group size; `None` leaves the choice to the runtime.
    #[builder(default = Some(DEFAULT_LOCAL_SIZE), setter(strip_option))]
    pub local_size: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_inputs() {
        let (a, b) = demo_inputs();
        assert_eq!(a.len(), DEMO_ELEMENTS);
        assert_eq!(a[9], 9.0);
        assert!((b[0] - 0.1).abs() < 1e-6);
        assert!((b[9] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.source, REFERENCE_KERNEL);
        assert_eq!(config.device_filter, DeviceFilter::All);
        assert_eq!(config.local_size, Some(DEFAULT_LOCAL_SIZE));
        assert_eq!(config.local_size, Some(10));
        assert!(config.build_options.is_empty());
    }
}
