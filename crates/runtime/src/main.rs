#![deny(clippy::all, clippy::pedantic)]

//! Runs the `fill` kernel once on the build's native backend and prints the
//! result. Set `RUST_LOG=minicompute=debug` to watch commits and waits.

use anyhow::{ensure, Context, Result};
use clap::Parser;
use minicompute::{BufferBinding, BufferKind, Compute, DeviceOptions};

const FILL_SOURCE: &str = include_str!("../../../shaders/fill.wgsl");

#[derive(Parser, Debug)]
#[command(about = "Fill a GPU buffer with base + index and read it back")]
struct Args {
    /// Number of u32 elements to fill.
    #[arg(long, default_value_t = 64)]
    elements: u32,
    /// Value written to element 0.
    #[arg(long, default_value_t = 0)]
    base: u32,
    /// Substring of the adapter name to run on.
    #[arg(long)]
    adapter: Option<String>,
    /// Prefer a low-power adapter.
    #[arg(long)]
    low_power: bool,
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct FillParams {
    base: u32,
    _pad: [u32; 3],
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();
    ensure!(args.elements > 0, "--elements must be at least 1");

    let mut options = DeviceOptions::from_env();
    if args.adapter.is_some() {
        options.adapter_name.clone_from(&args.adapter);
    }
    if args.low_power {
        options.power_preference = minicompute::wgpu::PowerPreference::LowPower;
    }

    tracing::info!(backend = %minicompute::backend(), "creating compute context");
    let mut compute = Compute::with_options(&options).context("failed to create compute context")?;

    let len = args.elements as usize * std::mem::size_of::<u32>();
    let mut out = compute.create_structured_buffer(len, std::mem::size_of::<u32>());
    let mut params = compute.create_buffer(std::mem::size_of::<FillParams>(), BufferKind::Constant);
    let fill_params = FillParams {
        base: args.base,
        _pad: [0; 3],
    };
    compute
        .set_buffer_pod(&params, &[fill_params], 0)
        .context("failed to upload fill parameters")?;

    let kernel = compute
        .create_kernel(FILL_SOURCE.as_bytes(), "fill")
        .context("failed to build the fill kernel")?;
    let group_size = kernel.workgroup_size().unwrap_or([64, 1, 1]);

    compute.set_kernel(&kernel);
    compute.set_kernel_buffer(&mut out, 0, BufferBinding::Output);
    compute.set_kernel_buffer(&mut params, 1, BufferBinding::Constant);
    compute.dispatch([args.elements, 1, 1], group_size);

    let mut values = vec![0u32; args.elements as usize];
    compute.get_buffer_pod(&mut out, &mut values, 0)?;

    let stats = compute.stats();
    tracing::info!(
        commits = stats.command_buffers_committed,
        waits = stats.waits,
        "read back {} elements",
        values.len()
    );
    let mismatch = values
        .iter()
        .zip(0u32..)
        .find(|(value, i)| **value != args.base.wrapping_add(*i));
    if let Some((value, i)) = mismatch {
        anyhow::bail!("element {i} is {value}, expected {}", args.base.wrapping_add(i));
    }
    println!("{values:?}");

    compute.delete_kernel(kernel);
    compute.delete_buffer(out);
    compute.delete_buffer(params);
    compute.delete()?;
    Ok(())
}
