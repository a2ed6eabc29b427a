#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

use anyhow::{bail, Result};
use clap::Parser;
use log::info;

use std::path;

use nestsched::common::{DimSize, Dtype};
use nestsched::ir::{LoopNest, ReduceKind};
use nestsched::lowering::{self, Conv2dParams};
use nestsched::pprint::{pprint, NestPrintStyle};
use nestsched::strategies;
use nestsched::target::{
    Arch, ArmTarget, CudaTarget, RocmTarget, Target, TargetId, X86Target,
};
use nestsched::tuning::{TunedParams, CUDA_CONV_PARAMS};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Partial sums each global-pool block combines per output.
const GLOBAL_POOL_LANES: u32 = 32;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Target architecture
    #[arg(long, value_enum, hide_default_value = true, default_value_t = TargetId::default())]
    target: TargetId,

    /// Tuned-parameter table to use instead of the built-in one
    #[arg(long)]
    params: Option<path::PathBuf>,

    /// Nest print style
    #[arg(long, value_enum, default_value_t = NestPrintStyle::Full)]
    style: NestPrintStyle,

    #[command(subcommand)]
    op: OpCommand,
}

#[derive(clap::Subcommand)]
enum OpCommand {
    #[command(about = "Schedule an elementwise operator")]
    Elementwise {
        #[arg(required = true, num_args = 1..)]
        shape: Vec<DimSize>,
        #[arg(long, default_value = "exp")]
        op: String,
        /// Keep the innermost loop scalar
        #[arg(long, default_value_t = false)]
        no_vectorize: bool,
    },
    #[command(about = "Schedule a reduction over some axes")]
    Reduce {
        #[arg(required = true, num_args = 1..)]
        shape: Vec<DimSize>,
        #[arg(long, value_delimiter = ',', required = true)]
        axes: Vec<usize>,
        #[arg(long, value_enum, default_value_t = ReduceKind::Sum)]
        kind: ReduceKind,
        /// Trailing output axes to bind to threads
        #[arg(long, default_value = "1")]
        last_dims: usize,
    },
    #[command(about = "Schedule a softmax")]
    Softmax {
        #[arg(required = true, num_args = 1..)]
        shape: Vec<DimSize>,
        #[arg(long, default_value = "-1", allow_hyphen_values = true)]
        axis: i32,
    },
    #[command(about = "Schedule a 2-D max pool over NCHW input")]
    Pool {
        #[arg(num_args = 4)]
        shape: Vec<DimSize>,
        #[arg(long, default_value = "2")]
        kernel: u32,
        #[arg(long, default_value = "2")]
        stride: u32,
    },
    #[command(about = "Schedule a global average pool over NCHW input")]
    GlobalPool {
        #[arg(num_args = 4)]
        shape: Vec<DimSize>,
    },
    #[command(about = "Schedule a direct 2-D convolution")]
    Conv {
        #[arg(long, short, default_value = "1")]
        batch: DimSize,
        #[arg(long, default_value = "3")]
        channels: DimSize,
        #[arg(long, default_value = "64")]
        filters: DimSize,
        #[arg(long, default_value = "7")]
        filters_size: DimSize,
        #[arg(long, default_value = "3")]
        pad: u32,
        #[arg(long, default_value = "2")]
        stride: u32,
        #[arg(long, default_value = "1")]
        dilation: u32,
        size: DimSize,
    },
    #[command(about = "Schedule a matrix multiplication")]
    Matmul {
        m: DimSize,
        n: DimSize,
        k: DimSize,
        /// Reduction chunk of the host variant's partial products
        #[arg(long, default_value = "8")]
        k_inner: DimSize,
    },
    #[command(about = "Schedule a split into sections along an axis")]
    Split {
        #[arg(required = true, num_args = 1..)]
        shape: Vec<DimSize>,
        #[arg(long)]
        axis: usize,
        #[arg(long, value_delimiter = ',', required = true)]
        sections: Vec<u32>,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let nest = match &args.target {
        TargetId::X86 => main_per_target::<X86Target>(&args)?,
        TargetId::Arm => main_per_target::<ArmTarget>(&args)?,
        TargetId::Cuda => main_per_target::<CudaTarget>(&args)?,
        TargetId::Rocm => main_per_target::<RocmTarget>(&args)?,
    };
    pprint(&nest, args.style);
    Ok(())
}

fn main_per_target<Tgt: Target>(args: &Args) -> Result<LoopNest> {
    let dtype = Dtype::Float32;
    let accelerator_only = |name: &str| -> Result<()> {
        if Tgt::arch() != Arch::Accelerator {
            bail!("{name} is only scheduled for accelerator targets, not {}", Tgt::target_id());
        }
        Ok(())
    };

    let start_time = std::time::Instant::now();
    let nest = match &args.op {
        OpCommand::Elementwise {
            shape,
            op,
            no_vectorize,
        } => {
            let mut nest = lowering::elementwise(shape, dtype, op)?;
            strategies::schedule_injective::<Tgt>(&mut nest, shape, !no_vectorize)?;
            nest
        }
        OpCommand::Reduce {
            shape,
            axes,
            kind,
            last_dims,
        } => {
            accelerator_only("reduce")?;
            let mut nest = lowering::reduce(shape, axes, *kind, dtype)?;
            let output = nest.get_block("reduce_out")?;
            let output_shape = nest.output_buffer(&output)?.shape.clone();
            strategies::schedule_reduce_gpu::<Tgt>(&mut nest, &output_shape, *last_dims)?;
            nest
        }
        OpCommand::Softmax { shape, axis } => {
            if Tgt::arch() != Arch::Host {
                bail!("softmax is only scheduled for host targets, not {}", Tgt::target_id());
            }
            let mut nest = lowering::softmax(shape, *axis, dtype)?;
            strategies::schedule_softmax_cpu(&mut nest, *axis)?;
            nest
        }
        OpCommand::Pool {
            shape,
            kernel,
            stride,
        } => {
            accelerator_only("pool")?;
            let mut nest = lowering::pool2d(shape, *kernel, *stride, dtype)?;
            strategies::schedule_pool_gpu::<Tgt>(&mut nest)?;
            nest
        }
        OpCommand::GlobalPool { shape } => {
            accelerator_only("global-pool")?;
            let mut nest = lowering::global_pool(shape, GLOBAL_POOL_LANES, dtype)?;
            strategies::schedule_global_pool_gpu(&mut nest)?;
            nest
        }
        OpCommand::Conv {
            batch,
            channels,
            filters,
            filters_size,
            pad,
            stride,
            dilation,
            size,
        } => {
            accelerator_only("conv")?;
            let params = CUDA_CONV_PARAMS.get_or_try_init(|| match &args.params {
                Some(path) => TunedParams::load(path),
                None => Ok(TunedParams::builtin()),
            })?;
            let mut nest = lowering::conv2d(
                &[*batch, *channels, *size, *size],
                &[*filters, *channels, *filters_size, *filters_size],
                Conv2dParams {
                    pad: *pad,
                    stride: *stride,
                    dilation: *dilation,
                },
                dtype,
            )?;
            let tiling = strategies::schedule_conv::<Tgt>(&mut nest, params)?;
            info!("Convolution used the {tiling:?} tiling");
            nest
        }
        OpCommand::Matmul { m, n, k, k_inner } => match Tgt::arch() {
            Arch::Host => {
                let mut nest =
                    lowering::matmul_cpu(m.get(), n.get(), k.get(), k_inner.get(), dtype)?;
                let partial = nest.get_block("mul_partial")?;
                let partial_shape = nest.output_buffer(&partial)?.shape.clone();
                strategies::schedule_matmul::<Tgt>(&mut nest, &partial_shape)?;
                nest
            }
            Arch::Accelerator => {
                let mut nest = lowering::matmul(m.get(), n.get(), k.get(), dtype)?;
                strategies::schedule_matmul::<Tgt>(&mut nest, &[])?;
                nest
            }
        },
        OpCommand::Split {
            shape,
            axis,
            sections,
        } => {
            let (mut nest, output_shapes) = lowering::split(shape, *axis, sections, dtype)?;
            strategies::schedule_split::<Tgt>(&mut nest, &output_shapes, *axis)?;
            nest
        }
    };
    info!("Scheduling took {:?}", start_time.elapsed());
    Ok(nest)
}
