//! End-to-end runs on a simulated machine with host RAM standing in for
//! every memory node.

use std::sync::Arc;
use tessera_core::{AccessMode, Arch, MemoryNode};
use tessera_data::{BlockFilter, CacheState, ReductionOps};
use tessera_runtime::{Codelet, Runtime, RuntimeConfig, RuntimeError};

fn add_one(name: &str, arch: Arch) -> Arc<Codelet> {
    Arc::new(Codelet::new(name, &[AccessMode::ReadWrite]).with_impl(arch, |ctx| {
        ctx.buffer(0).with_mut(|b| b.iter_mut().for_each(|x| *x += 1));
    }))
}

fn sum_ops() -> ReductionOps {
    ReductionOps::new(
        Arc::new(|b: &mut [u8]| b.fill(0)),
        Arc::new(|dst: &mut [u8], src: &[u8]| {
            let total = u64::from_le_bytes(dst[..8].try_into().unwrap_or_default())
                + u64::from_le_bytes(src[..8].try_into().unwrap_or_default());
            dst[..8].copy_from_slice(&total.to_le_bytes());
        }),
    )
}

#[test]
fn test_write_on_accelerator_moves_ownership() {
    let rt = Runtime::start(
        RuntimeConfig::default()
            .with_ncpus(1)
            .with_accelerator(Arch::Cuda, 0),
    )
    .unwrap();
    let gpu = MemoryNode::from_index(1);
    let h = rt.register(vec![1, 1, 1, 1]).unwrap();

    rt.task(&add_one("gpu_add", Arch::Cuda)).buffer(h).submit().unwrap();
    rt.wait_for_all().unwrap();
    assert_eq!(rt.data().state_on(h, gpu).unwrap(), CacheState::Owner);
    assert_eq!(rt.data().state_on(h, MemoryNode::HOST).unwrap(), CacheState::Invalid);

    // A host reader pulls the data back and both copies end up shared
    let read = Arc::new(Codelet::new("host_read", &[AccessMode::Read]).with_impl(Arch::Cpu, |ctx| {
        assert_eq!(ctx.buffer(0).to_vec(), vec![2, 2, 2, 2]);
    }));
    rt.task(&read).buffer(h).submit().unwrap();
    rt.wait_for_all().unwrap();
    assert!(rt.data().is_valid_on(h, MemoryNode::HOST).unwrap());
    assert!(rt.data().is_valid_on(h, gpu).unwrap());

    assert_eq!(rt.unregister(h).unwrap(), Some(vec![2, 2, 2, 2]));
    rt.shutdown().unwrap();
}

#[test]
fn test_mixed_workers_keep_program_order() {
    let rt = Runtime::start(
        RuntimeConfig::default()
            .with_ncpus(2)
            .with_accelerator(Arch::Cuda, 0),
    )
    .unwrap();
    let h = rt.register(vec![0]).unwrap();
    let both = Arc::new(
        Codelet::new("anywhere_add", &[AccessMode::ReadWrite])
            .with_impl(Arch::Cpu, |ctx| ctx.buffer(0).with_mut(|b| b[0] += 1))
            .with_impl(Arch::Cuda, |ctx| ctx.buffer(0).with_mut(|b| b[0] += 1)),
    );
    for _ in 0..40 {
        rt.task(&both).buffer(h).submit().unwrap();
    }
    rt.wait_for_all().unwrap();
    assert_eq!(rt.unregister(h).unwrap(), Some(vec![40]));
    rt.shutdown().unwrap();
}

#[test]
fn test_reduction_folds_every_contribution() {
    let rt = Runtime::start(RuntimeConfig::default().with_ncpus(4)).unwrap();
    let h = rt.register(5u64.to_le_bytes().to_vec()).unwrap();
    rt.start_reduction(h, sum_ops()).unwrap();

    let contribute = Arc::new(Codelet::new("contribute", &[AccessMode::Redux]).with_impl(Arch::Cpu, |ctx| {
        ctx.buffer(0).with_mut(|b| {
            let acc = u64::from_le_bytes(b[..8].try_into().unwrap_or_default()) + 1;
            b[..8].copy_from_slice(&acc.to_le_bytes());
        });
    }));
    for _ in 0..25 {
        rt.task(&contribute).buffer(h).submit().unwrap();
    }
    rt.end_reduction(h).unwrap();

    let buffer = rt.acquire(h, AccessMode::Read).unwrap();
    assert_eq!(buffer.to_vec(), 30u64.to_le_bytes().to_vec());
    rt.release(h).unwrap();
    rt.shutdown().unwrap();
}

#[test]
fn test_partitioned_blocks_are_gathered() {
    let rt = Runtime::start(RuntimeConfig::default().with_ncpus(3)).unwrap();
    let h = rt.register(vec![0; 9]).unwrap();
    let blocks = rt.partition(h, &BlockFilter::new(3)).unwrap();
    assert_eq!(blocks.len(), 3);

    let codelet = add_one("block_add", Arch::Cpu);
    for (i, block) in blocks.iter().enumerate() {
        for _ in 0..=i {
            rt.task(&codelet).buffer(*block).submit().unwrap();
        }
    }
    rt.unpartition(h, MemoryNode::HOST).unwrap();
    assert_eq!(rt.unregister(h).unwrap(), Some(vec![1, 1, 1, 2, 2, 2, 3, 3, 3]));
    rt.shutdown().unwrap();
}

#[test]
fn test_invalidate_then_overwrite() {
    let rt = Runtime::start(RuntimeConfig::default().with_ncpus(2)).unwrap();
    let h = rt.register(vec![5]).unwrap();
    rt.invalidate_submit(h).unwrap();
    assert!(rt.data().query_status(h, MemoryNode::HOST).is_ok());

    let set = Arc::new(Codelet::new("set", &[AccessMode::Write]).with_impl(Arch::Cpu, |ctx| {
        ctx.buffer(0).with_mut(|b| b[0] = 7);
    }));
    rt.task(&set).buffer(h).submit().unwrap();
    let buffer = rt.acquire(h, AccessMode::Read).unwrap();
    assert_eq!(buffer.to_vec(), vec![7]);
    rt.release(h).unwrap();
    rt.shutdown().unwrap();
}

#[test]
fn test_data_cpy_chain() {
    let rt = Runtime::start(RuntimeConfig::default().with_ncpus(2)).unwrap();
    let a = rt.register(vec![4, 2]).unwrap();
    let b = rt.register_uninitialized(2);
    let c = rt.register_uninitialized(2);
    rt.data_cpy(b, a).unwrap();
    rt.task(&add_one("bump", Arch::Cpu)).buffer(b).submit().unwrap();
    rt.data_cpy(c, b).unwrap();
    rt.wait_for_all().unwrap();

    let buffer = rt.acquire(c, AccessMode::Read).unwrap();
    assert_eq!(buffer.to_vec(), vec![5, 3]);
    rt.release(c).unwrap();
    assert_eq!(rt.unregister(a).unwrap(), Some(vec![4, 2]));
    rt.shutdown().unwrap();
}

#[test]
fn test_failures_surface_in_wait_for_all() {
    let rt = Runtime::start(RuntimeConfig::default().with_ncpus(1)).unwrap();
    let nothing = rt.register_uninitialized(1);
    rt.task(&add_one("read_nothing", Arch::Cpu)).buffer(nothing).submit().unwrap();
    assert!(matches!(rt.wait_for_all(), Err(RuntimeError::TaskFailed { .. })));
    // Failures are reported once
    rt.wait_for_all().unwrap();
    rt.shutdown().unwrap();
}

#[test]
fn test_models_persist_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let config = RuntimeConfig::default()
        .with_ncpus(1)
        .with_sampling_dir(dir.path());

    let rt = Runtime::start(config.clone()).unwrap();
    let h = rt.register(vec![0; 64]).unwrap();
    let codelet = add_one("persisted", Arch::Cpu);
    for _ in 0..3 {
        rt.task(&codelet).buffer(h).submit().unwrap();
    }
    rt.wait_for_all().unwrap();
    rt.shutdown().unwrap();

    let files: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(files.len(), 1);
    let json: serde_json::Value = serde_json::from_slice(&std::fs::read(&files[0]).unwrap()).unwrap();
    assert!(json.is_object());

    let rt = Runtime::start(config).unwrap();
    let summary = rt
        .perf()
        .summaries()
        .into_iter()
        .find(|s| s.kind == codelet.kind())
        .unwrap();
    assert_eq!(summary.samples, 3);
    rt.shutdown().unwrap();
}

#[test]
fn test_introspection_counts_processed_tasks() {
    let rt = Runtime::start(RuntimeConfig::default().with_ncpus(2)).unwrap();
    let codelet = add_one("counted", Arch::Cpu);
    let handles: Vec<_> = (0..6).map(|_| rt.register(vec![0]).unwrap()).collect();
    for h in &handles {
        rt.task(&codelet).buffer(*h).submit().unwrap();
    }
    rt.wait_for_all().unwrap();
    let snapshot = rt.introspect();
    assert_eq!(snapshot.workers.iter().map(|w| w.processed).sum::<u64>(), 6);
    assert!(snapshot.workers.iter().all(|w| w.queued == 0));
    rt.shutdown().unwrap();
}

#[test]
fn test_unregister_waits_for_pins() {
    let rt = Runtime::start(RuntimeConfig::default().with_ncpus(1)).unwrap();
    let h = rt.register(vec![3; 16]).unwrap();
    let data = Arc::clone(rt.data());
    data.acquire(h, MemoryNode::HOST, AccessMode::Read).unwrap();

    let (tx, rx) = std::sync::mpsc::channel();
    let unregistering = {
        let data = Arc::clone(&data);
        std::thread::spawn(move || {
            let contents = data.unregister(h);
            tx.send(()).unwrap();
            contents
        })
    };
    assert!(rx.recv_timeout(std::time::Duration::from_millis(50)).is_err());
    data.release(h, MemoryNode::HOST, AccessMode::Read).unwrap();
    assert_eq!(unregistering.join().unwrap().unwrap(), Some(vec![3; 16]));
    assert!(data.handle(h).is_err());
    rt.shutdown().unwrap();
}
