//! hostcl command line: run the vector-add pipeline on a chosen device.

use clap::Parser;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use hostcl::{
    Device, DeviceFilter, DispatchError, FixedSelection, HostRuntime, PipelineConfig,
    PipelineDriver, Platform, ResourceEnumerator, RuntimeHandle, SelectionError, Selector,
    ValidIndex, demo_inputs, parse_index, validate_index,
};

#[derive(Parser)]
#[command(name = "hostcl")]
#[command(about = "Enumerate compute devices, build a kernel and run vector addition")]
#[command(version)]
struct Cli {
    /// Platform number (1-based); prompts when omitted
    #[arg(short, long, env = "HOSTCL_PLATFORM")]
    platform: Option<usize>,

    /// Device number (1-based) within the platform; prompts when omitted
    #[arg(short, long, env = "HOSTCL_DEVICE")]
    device: Option<usize>,

    /// Work-group size (must divide the element count)
    #[arg(short, long, default_value_t = hostcl::DEFAULT_LOCAL_SIZE, env = "HOSTCL_LOCAL_SIZE")]
    local_size: usize,

    /// Only list devices of this type
    #[arg(long, default_value = "all", env = "HOSTCL_DEVICE_TYPE")]
    device_type: DeviceFilter,

    /// Kernel source file (default: built-in parallel_add)
    #[arg(short, long, value_name = "FILE", env = "HOSTCL_KERNEL")]
    kernel: Option<PathBuf>,

    /// Kernel entry point
    #[arg(short, long, default_value = hostcl::REFERENCE_ENTRY, env = "HOSTCL_ENTRY")]
    entry: String,

    /// Options passed to the program build (e.g. "-D SCALE=2")
    #[arg(long, default_value = "", env = "HOSTCL_BUILD_OPTIONS")]
    build_options: String,

    /// Compute runtime
    #[arg(short, long, default_value = "host", env = "HOSTCL_RUNTIME")]
    runtime: RuntimeKind,

    /// Print platforms and devices, then exit
    #[arg(long)]
    list: bool,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum RuntimeKind {
    /// In-process reference runtime
    Host,
    /// System OpenCL drivers
    #[value(name = "opencl", alias = "cl")]
    OpenCl,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        if let Some(e) = e.downcast_ref::<DispatchError>() {
            eprintln!("  stage: {}, status code: {}", e.stage(), e.code());
        }
        std::process::exit(1);
    }
}

fn open_runtime(kind: RuntimeKind) -> Result<RuntimeHandle, Box<dyn std::error::Error>> {
    match kind {
        RuntimeKind::Host => Ok(HostRuntime::new().into_handle()),
        #[cfg(feature = "opencl")]
        RuntimeKind::OpenCl => Ok(hostcl::OpenClRuntime::new().into_handle()),
        #[cfg(not(feature = "opencl"))]
        RuntimeKind::OpenCl => {
            Err("this build has no OpenCL support (rebuild with --features opencl)".into())
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = open_runtime(cli.runtime)?;

    if cli.list {
        return list(&ResourceEnumerator::new(runtime), cli.device_type);
    }

    let mut config = PipelineConfig::builder()
        .entry(cli.entry)
        .build_options(cli.build_options)
        .device_filter(cli.device_type)
        .build();
    config.local_size = Some(cli.local_size);
    if let Some(path) = &cli.kernel {
        config.source = fs::read_to_string(path)
            .map_err(|e| format!("cannot read kernel file {}: {e}", path.display()))?;
    }

    let (a, b) = demo_inputs();
    let mut driver = PipelineDriver::new(runtime, config);
    let report = match (cli.platform, cli.device) {
        (Some(platform), Some(device)) => {
            driver.run_vector_add(&mut FixedSelection::new(platform, device), &a, &b)?
        }
        (platform, device) => {
            let stdin = io::stdin();
            let mut selector = ConsoleSelector {
                platform,
                device,
                input: stdin.lock(),
            };
            driver.run_vector_add(&mut selector, &a, &b)?
        }
    };

    println!("Platform: {}", report.platform.name);
    println!("Device: {}", report.device.name);
    if !report.build_log.trim().is_empty() {
        println!("Build log:\n{}", report.build_log.trim_end());
    }
    for (a, b, r) in &report.rows {
        println!("{a} + {b} = {r}");
    }
    Ok(())
}

fn list(enumerator: &ResourceEnumerator, filter: DeviceFilter) -> Result<(), Box<dyn std::error::Error>> {
    for (pi, platform) in enumerator.list_platforms()?.iter().enumerate() {
        println!("{}. {} ({}, {})", pi + 1, platform.name, platform.vendor, platform.version);
        match enumerator.list_devices(platform, filter) {
            Ok(devices) => {
                for (di, device) in devices.iter().enumerate() {
                    println!(
                        "   {}. {} [{}] max work-group {}",
                        di + 1,
                        device.name,
                        device.device_type,
                        device.max_work_group_size
                    );
                }
            }
            Err(DispatchError::NoDevice { .. }) => println!("   (no {filter} devices)"),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Uses the indices given on the command line and asks on the console for
/// the rest, re-asking until the answer is valid.
struct ConsoleSelector<R> {
    platform: Option<usize>,
    device: Option<usize>,
    input: R,
}

impl<R: BufRead> ConsoleSelector<R> {
    fn ask(&mut self, what: &str, names: &[String]) -> Result<ValidIndex, SelectionError> {
        println!("Available {what}s:");
        for (i, name) in names.iter().enumerate() {
            println!("  {}. {name}", i + 1);
        }
        loop {
            print!("Choose a {what} (1-{}): ", names.len());
            let _ = io::stdout().flush();

            let mut line = String::new();
            match self.input.read_line(&mut line) {
                Ok(0) | Err(_) => return Err(SelectionError::NotANumber("<end of input>".into())),
                Ok(_) => {}
            }
            match parse_index(&line, names.len()) {
                Ok(index) => return Ok(index),
                Err(e) => println!("{e}"),
            }
        }
    }
}

impl<R: BufRead> Selector for ConsoleSelector<R> {
    fn select_platform(&mut self, platforms: &[Platform]) -> Result<ValidIndex, SelectionError> {
        match self.platform {
            Some(n) => validate_index(n, platforms.len()),
            None => {
                let names: Vec<String> = platforms.iter().map(|p| p.name.clone()).collect();
                self.ask("platform", &names)
            }
        }
    }

    fn select_device(&mut self, devices: &[Device]) -> Result<ValidIndex, SelectionError> {
        match self.device {
            Some(n) => validate_index(n, devices.len()),
            None => {
                let names: Vec<String> = devices.iter().map(|d| d.name.clone()).collect();
                self.ask("device", &names)
            }
        }
    }
}
