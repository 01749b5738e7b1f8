//! Tunes batch-norm inference over an NHWC tensor and runs the winner.
//!
//! ```text
//! cargo run --release --example batchnorm_infer
//! BRINY_TUNE_REPEAT=10 RUST_LOG=debug cargo run --example batchnorm_infer --features wgpu
//! ```

use std::sync::Arc;

use briny_tune::prelude::*;
use env_logger::Env;
use rand::Rng;

const RANK: usize = 4;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let lengths = vec![16, 8, 128, 256];
    let problem = ProblemDescriptor::new(RawProblem {
        strides: vec![8 * 128 * 256, 128 * 256, 256, 1],
        lengths,
        reduce_dims: vec![0, 1, 2],
        invariant_dims: vec![3],
        param_lengths: vec![256],
        param_strides: vec![1],
        epsilon: f64::from(f32::EPSILON),
    })?;

    let alloc = Arc::new(HostAllocator::new());
    let mut rng = rand::rng();
    let mut random = |len: usize| -> Result<DeviceMem, TuneError> {
        let data: Vec<f32> = (0..len).map(|_| rng.random_range(-1.0..1.0)).collect();
        let mut mem = DeviceMem::with_elements::<f32>(alloc.clone(), len)?;
        mem.copy_from_host(&data)?;
        Ok(mem)
    };

    let num_xy = problem.num_elements();
    let num_param = problem.num_param_elements();
    let x = random(num_xy)?;
    let mean = random(num_param)?;
    let scale = random(num_param)?;
    let bias = random(num_param)?;
    let y = DeviceMem::with_elements::<f32>(alloc.clone(), num_xy)?;

    // variance must be non-negative
    let mut variance = DeviceMem::with_elements::<f32>(alloc.clone(), num_param)?;
    variance.set_zero()?;

    let inputs = [&x, &mean, &variance, &scale, &bias];
    let outputs = [&y];
    let bindings = Bindings::new(&inputs, &outputs);

    let registry = Registry::<BatchNormInfer<f32, RANK>>::instances();
    let mut tuner = Tuner::new(registry, TuneConfig::from_env());
    let result = tuner.tune(&problem, &bindings)?;

    if let Some(best) = result.best() {
        let sample = y.to_host_vec::<f32>()?;
        log::debug!("{} wrote y[..4] = {:?}", best.name, &sample[..4]);
    }

    Ok(())
}
