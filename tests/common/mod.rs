#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use briny_tune::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Operation family used to drive the harness with scripted candidates.
pub struct MockOp;

pub struct MockArgument {
    pub bytes: usize,
}

impl DeviceOp for MockOp {
    type Argument<'a> = MockArgument;

    fn signature() -> OpSignature {
        OpSignature {
            inputs: vec!["f32"],
            outputs: vec!["f32"],
            transform: "PassThrough",
            rank: 2,
        }
    }
}

#[derive(Debug, Default)]
pub struct Calls {
    pub binds: AtomicUsize,
    pub timed: AtomicUsize,
    pub untimed: AtomicUsize,
}

impl Calls {
    pub fn binds(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }

    pub fn timed(&self) -> usize {
        self.timed.load(Ordering::SeqCst)
    }

    pub fn untimed(&self) -> usize {
        self.untimed.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Script {
    /// Supported; reports this many milliseconds when timed.
    Time(f64),
    Declines,
    BindFails,
    /// Supported, then fails while running.
    Fails,
}

pub struct Scripted {
    pub name: String,
    pub script: Script,
    pub calls: Arc<Calls>,
}

impl Scripted {
    pub fn boxed(name: &str, script: Script) -> (Box<dyn Candidate<MockOp>>, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        let candidate = Box::new(Self {
            name: name.to_string(),
            script,
            calls: calls.clone(),
        });
        (candidate, calls)
    }
}

impl Candidate<MockOp> for Scripted {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn bind<'a>(
        &self,
        _problem: &ProblemDescriptor,
        bindings: &Bindings<'a>,
    ) -> Result<MockArgument, TuneError> {
        self.calls.binds.fetch_add(1, Ordering::SeqCst);
        match self.script {
            Script::BindFails => Err(TuneError::Unsupported("scripted bind failure".into())),
            _ => Ok(MockArgument {
                bytes: bindings.total_bytes(),
            }),
        }
    }

    fn supports(&self, _argument: &MockArgument) -> bool {
        !matches!(self.script, Script::Declines)
    }

    fn run(&self, _argument: &MockArgument, stream: &StreamConfig) -> Result<f64, TuneError> {
        let counter = if stream.time_kernel {
            &self.calls.timed
        } else {
            &self.calls.untimed
        };
        counter.fetch_add(1, Ordering::SeqCst);
        match self.script {
            Script::Fails => Err(TuneError::Gpu("device lost".into())),
            Script::Time(ms) if stream.time_kernel => Ok(ms),
            _ => Ok(0.0),
        }
    }
}

/// Builds a registry from scripts, returning the per-candidate call counters.
pub fn scripted_registry(scripts: &[(&str, Script)]) -> (Registry<MockOp>, Vec<Arc<Calls>>) {
    let (candidates, calls) = scripts
        .iter()
        .map(|&(name, script)| Scripted::boxed(name, script))
        .unzip();
    (Registry::from_candidates(candidates), calls)
}

/// Records every reporter event as a line.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    pub events: Vec<String>,
}

impl RecordingReporter {
    pub fn production_runs(&self) -> usize {
        self.events.iter().filter(|e| e.starts_with("production")).count()
    }
}

impl Reporter for RecordingReporter {
    fn on_start(&mut self, _signature: &OpSignature, instances: usize) {
        self.events.push(format!("start {instances}"));
    }

    fn on_instance(&mut self, report: &InstanceReport) {
        self.events.push(format!("instance {}", report.name));
    }

    fn on_selection(&mut self, result: &SelectionResult) {
        self.events
            .push(format!("selection {}", result.best_name().unwrap_or("-")));
    }

    fn on_production_run(&mut self, name: &str) {
        self.events.push(format!("production {name}"));
    }

    fn on_done(&mut self) {
        self.events.push("done".into());
    }
}

/// Fast stream settings for tests.
pub fn quick_stream() -> StreamConfig {
    StreamConfig {
        cold_niters: 1,
        nrepeat: 2,
        ..StreamConfig::default()
    }
}

pub fn quick_config() -> TuneConfig {
    TuneConfig {
        cold_niters: 1,
        nrepeat: 2,
        ..TuneConfig::default()
    }
}

/// A packed problem with per-last-axis parameters.
pub fn packed_problem(lengths: &[usize]) -> ProblemDescriptor {
    let rank = lengths.len();
    let inner = lengths[rank - 1];
    ProblemDescriptor::new(RawProblem {
        lengths: lengths.to_vec(),
        strides: packed_strides(lengths),
        reduce_dims: (0..rank - 1).collect(),
        invariant_dims: vec![rank - 1],
        param_lengths: vec![inner],
        param_strides: vec![1],
        epsilon: f32::EPSILON as f64,
    })
    .unwrap()
}

/// Buffers for one batch-norm inference problem.
pub struct NormBuffers {
    pub x: DeviceMem,
    pub mean: DeviceMem,
    pub variance: DeviceMem,
    pub scale: DeviceMem,
    pub bias: DeviceMem,
    pub y: DeviceMem,
}

impl NormBuffers {
    /// Random inputs sized for `problem`, with a zeroed output.
    pub fn random<T: Element>(
        alloc: &Arc<HostAllocator>,
        problem: &ProblemDescriptor,
        seed: u64,
    ) -> Result<Self, TuneError> {
        let mut rng = StdRng::seed_from_u64(seed);
        let xy_len = required_elements(problem.lengths(), problem.xy_strides()).unwrap();
        let param_len =
            required_elements(problem.lengths(), problem.aligned_param_strides()).unwrap();

        let mut fill = |len: usize, lo: f64, hi: f64| -> Result<DeviceMem, TuneError> {
            let data: Vec<T> = (0..len)
                .map(|_| T::from_f64(rng.random_range(lo..hi)))
                .collect();
            let mut mem = DeviceMem::with_elements::<T>(alloc.clone(), len)?;
            mem.copy_from_host(&data)?;
            Ok(mem)
        };

        Ok(Self {
            x: fill(xy_len, -1.0, 1.0)?,
            mean: fill(param_len, -1.0, 1.0)?,
            variance: fill(param_len, 0.0, 1.0)?,
            scale: fill(param_len, -1.0, 1.0)?,
            bias: fill(param_len, -1.0, 1.0)?,
            y: DeviceMem::with_elements::<T>(alloc.clone(), xy_len)?,
        })
    }

    pub fn inputs(&self) -> [&DeviceMem; 5] {
        [&self.x, &self.mean, &self.variance, &self.scale, &self.bias]
    }
}

/// Straightforward host evaluation, indexing through the descriptor's strides.
pub fn reference_output<T: Element>(problem: &ProblemDescriptor, buffers: &NormBuffers) -> Vec<T> {
    let x = buffers.x.to_host_vec::<T>().unwrap();
    let mean = buffers.mean.to_host_vec::<T>().unwrap();
    let variance = buffers.variance.to_host_vec::<T>().unwrap();
    let scale = buffers.scale.to_host_vec::<T>().unwrap();
    let bias = buffers.bias.to_host_vec::<T>().unwrap();
    let eps = T::from_f64(problem.epsilon());

    let lengths = problem.lengths();
    let mut y = vec![T::default(); x.len()];
    for linear in 0..problem.num_elements() {
        let (mut rem, mut xy, mut p) = (linear, 0, 0);
        for d in (0..lengths.len()).rev() {
            let i = rem % lengths[d];
            rem /= lengths[d];
            xy += i * problem.xy_strides()[d];
            p += i * problem.aligned_param_strides()[d];
        }
        y[xy] = (x[xy] - mean[p]) / (variance[p] + eps).sqrt() * scale[p] + bias[p];
    }
    y
}
