use criterion::{Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use tessera_core::{AccessMode, Arch, ArchSet, HandleId, ManualClock, MemoryNode, PerfArch, TaskId, TaskKind, WorkerId};
use tessera_perf::{PerfModel, PerfRegistry};
use tessera_sched::{BufferAccess, DataOracle, DmdaScheduler, SchedConfig, SchedPolicy, SchedTask, WorkerInfo, WorkerRegistry};

struct FlatOracle;

impl DataOracle for FlatOracle {
    fn expected_penalty(&self, node: MemoryNode, buffers: &[(HandleId, AccessMode)]) -> f64 {
        if node == MemoryNode::HOST { 0.0 } else { 10.0 * buffers.len() as f64 }
    }

    fn count_non_ready(&self, _node: MemoryNode, _buffers: &[(HandleId, AccessMode)]) -> usize {
        0
    }

    fn prefetch(&self, _handle: HandleId, _node: MemoryNode) {}
}

fn scheduler(policy: SchedPolicy) -> DmdaScheduler {
    let mut infos: Vec<WorkerInfo> = (0..8).map(|i| WorkerInfo::cpu(WorkerId::from_index(i))).collect();
    infos.push(WorkerInfo::accelerator(WorkerId::from_index(8), Arch::Cuda, 0, MemoryNode::from_index(1)));
    infos.push(WorkerInfo::accelerator(WorkerId::from_index(9), Arch::Cuda, 1, MemoryNode::from_index(2)));

    let perf = PerfRegistry::new(1);
    perf.register(PerfModel::per_arch(
        TaskKind::from_symbol("gemm"),
        "gemm",
        &[
            (PerfArch::cpu(), 400.0),
            (PerfArch::new(Arch::Cuda, 0), 40.0),
            (PerfArch::new(Arch::Cuda, 1), 40.0),
        ],
    ));
    DmdaScheduler::new(
        SchedConfig::default().with_policy(policy).with_prefetch(false),
        Arc::new(WorkerRegistry::new(infos)),
        Arc::new(perf),
        Arc::new(FlatOracle),
        Arc::new(ManualClock::new()),
    )
}

fn bench_push_pop(c: &mut Criterion) {
    let kind = TaskKind::from_symbol("gemm");
    for policy in SchedPolicy::ALL {
        c.bench_function(&format!("push_pop_{policy}"), |b| {
            let sched = scheduler(policy);
            let workers = sched.workers().len();
            let mut next = 0u64;
            b.iter(|| {
                let task = SchedTask::new(
                    TaskId::from_raw(next),
                    kind,
                    ArchSet::all(),
                    vec![BufferAccess::new(HandleId::from_index(0), AccessMode::Read)],
                );
                next += 1;
                let worker = sched.push(black_box(task)).unwrap_or(WorkerId::from_index(0));
                if let Some(task) = sched.pop(worker) {
                    sched.task_done(worker, &task);
                }
                black_box(workers)
            });
        });
    }
}

criterion_group!(benches, bench_push_pop);
criterion_main!(benches);
