//! Built-in workload exercising partitioning, implicit dependencies and
//! reductions on whatever workers the runtime was started with.

use indicatif::ProgressBar;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tessera_core::{AccessMode, Arch, MemoryNode};
use tessera_data::{BlockFilter, MsiStats, ReductionOps};
use tessera_runtime::{Codelet, KernelContext, Runtime, RuntimeResult};
use tessera_sched::SchedIntrospection;

/// Shape of the workload
#[derive(Debug, Clone, Copy)]
pub struct DemoParams {
    /// Vector length in bytes
    pub size: usize,
    /// Number of blocks the vector is split into
    pub blocks: usize,
    /// Increment passes over every block
    pub iterations: usize,
}

/// Outcome of one run
#[derive(Debug, Clone, Serialize)]
pub struct DemoReport {
    pub tasks: usize,
    pub checksum: u64,
    pub expected: u64,
    pub elapsed_ms: f64,
    pub sched: SchedIntrospection,
    pub msi: MsiStats,
}

impl DemoReport {
    pub fn is_correct(&self) -> bool {
        self.checksum == self.expected
    }
}

fn initial(i: usize) -> u8 {
    (i % 251) as u8
}

fn with_every_arch(name: &str, modes: &[AccessMode], kernel: fn(&KernelContext<'_>)) -> Arc<Codelet> {
    Arc::new(
        Arch::ALL
            .into_iter()
            .fold(Codelet::new(name, modes), |c, arch| c.with_impl(arch, kernel)),
    )
}

fn bump(ctx: &KernelContext<'_>) {
    ctx.buffer(0)
        .with_mut(|b| b.iter_mut().for_each(|x| *x = x.wrapping_add(1)));
}

fn block_sum(ctx: &KernelContext<'_>) {
    let sum: u64 = ctx.buffer(0).with(|b| b.iter().map(|x| u64::from(*x)).sum());
    ctx.buffer(1).with_mut(|acc| add_into(acc, sum));
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(word)
}

fn add_into(acc: &mut [u8], value: u64) {
    let total = read_u64(acc).wrapping_add(value);
    acc[..8].copy_from_slice(&total.to_le_bytes());
}

fn sum_ops() -> ReductionOps {
    ReductionOps::new(
        Arc::new(|acc: &mut [u8]| acc.fill(0)),
        Arc::new(|dst: &mut [u8], src: &[u8]| add_into(dst, read_u64(src))),
    )
}

/// Checksum the workload must produce
pub fn expected_checksum(params: DemoParams) -> u64 {
    (0..params.size)
        .map(|i| ((usize::from(initial(i)) + params.iterations) % 256) as u64)
        .sum()
}

/// Run the workload on `rt`, ticking `progress` once per finished task
///
/// # Errors
///
/// Returns the first runtime error or task failure
pub fn run(rt: &Runtime, params: DemoParams, progress: &ProgressBar) -> RuntimeResult<DemoReport> {
    let start = Instant::now();
    let bump = with_every_arch("demo_bump", &[AccessMode::ReadWrite], bump);
    let sum = with_every_arch("demo_sum", &[AccessMode::Read, AccessMode::Redux], block_sum);

    let vector = rt.register((0..params.size).map(initial).collect())?;
    let blocks = rt.partition(vector, &BlockFilter::new(params.blocks))?;
    let acc = rt.register(vec![0; 8])?;
    rt.start_reduction(acc, sum_ops())?;

    let mut tasks = 0;
    for _ in 0..params.iterations {
        for block in &blocks {
            let progress = progress.clone();
            rt.task(&bump)
                .buffer(*block)
                .on_complete(move || progress.inc(1))
                .submit()?;
            tasks += 1;
        }
    }
    for block in &blocks {
        let progress = progress.clone();
        rt.task(&sum)
            .buffers(&[*block, acc])
            .on_complete(move || progress.inc(1))
            .submit()?;
        tasks += 1;
    }
    rt.end_reduction(acc)?;

    let checksum = read_u64(&rt.acquire(acc, AccessMode::Read)?.to_vec());
    rt.release(acc)?;
    rt.wait_for_all()?;
    rt.unpartition(vector, MemoryNode::HOST)?;
    rt.unregister(vector)?;
    rt.unregister(acc)?;

    let report = DemoReport {
        tasks,
        checksum,
        expected: expected_checksum(params),
        elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
        sched: rt.introspect(),
        msi: rt.msi_stats(),
    };
    tracing::info!(tasks, checksum, elapsed_ms = report.elapsed_ms, "demo finished");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_runtime::RuntimeConfig;

    #[test]
    fn test_expected_checksum_wraps() {
        let params = DemoParams {
            size: 3,
            blocks: 1,
            iterations: 256,
        };
        assert_eq!(expected_checksum(params), 1 + 2);
    }

    #[test]
    fn test_demo_on_cpus() {
        let rt = Runtime::start(RuntimeConfig::default().with_ncpus(3)).unwrap();
        let params = DemoParams {
            size: 1000,
            blocks: 7,
            iterations: 4,
        };
        let report = run(&rt, params, &ProgressBar::hidden()).unwrap();
        assert_eq!(report.tasks, 7 * 4 + 7);
        assert!(report.is_correct(), "{} != {}", report.checksum, report.expected);
        rt.shutdown().unwrap();
    }

    #[test]
    fn test_demo_with_accelerators() {
        let config = RuntimeConfig::default()
            .with_ncpus(2)
            .with_accelerator(Arch::Cuda, 0)
            .with_accelerator(Arch::OpenCl, 0);
        let rt = Runtime::start(config).unwrap();
        let params = DemoParams {
            size: 512,
            blocks: 4,
            iterations: 3,
        };
        let report = run(&rt, params, &ProgressBar::hidden()).unwrap();
        assert!(report.is_correct());
        assert_eq!(report.sched.workers.len(), 4);
        rt.shutdown().unwrap();
    }
}
