//! Process-wide setup performed once per run.
//!
//! [`init`] pins libtorch to a single intra-op and inter-op thread, disables
//! cuDNN autotuning, derives the effective seed, seeds the torch generator and
//! returns the run's [`StdRng`] together with the compute device.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tch::Device;
use tracing::info;

/// Seeds and device of one run.
pub struct Runtime {
    /// Seed named in the configuration.
    pub nominal_seed: u64,
    /// Seed actually used by every generator.
    pub effective_seed: u64,
    /// Data-side generator: split shuffle, loader order and augmentation.
    pub rng: StdRng,
    /// Device holding models and batches.
    pub device: Device,
}

/// Map a nominal seed to the effective seed: the first draw in
/// `[0, 2³² − 1]` of a generator seeded with `nominal`.
pub fn effective_seed(nominal: u64) -> u64 {
    let mut rng = StdRng::seed_from_u64(nominal);
    rng.gen_range(0..=u64::from(u32::MAX))
}

/// Pin threads, seed every generator and select a device.
///
/// With `use_cuda` the first CUDA device is used when available, otherwise
/// the CPU.
pub fn init(nominal_seed: u64, use_cuda: bool) -> Runtime {
    tch::set_num_threads(1);
    tch::set_num_interop_threads(1);
    tch::Cuda::cudnn_set_benchmark(false);

    let effective = effective_seed(nominal_seed);
    tch::manual_seed(effective as i64);

    let device = if use_cuda { Device::cuda_if_available() } else { Device::Cpu };
    info!(nominal_seed, effective_seed = effective, ?device, "runtime initialised");

    Runtime {
        nominal_seed,
        effective_seed: effective,
        rng: StdRng::seed_from_u64(effective),
        device,
    }
}
