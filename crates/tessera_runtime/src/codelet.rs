//! Codelets: the per-architecture implementations of one task kind.

use crate::error::{RuntimeError, RuntimeResult};
use indexmap::IndexMap;
use std::any::Any;
use std::cell::Cell;
use std::sync::Arc;
use tessera_core::{AccessMode, Arch, ArchSet, MemoryNode, PerfArch, TaskKind, WorkerId};
use tessera_data::NodeBuffer;
use tessera_perf::{CostFn, PerfModel, PerfRegistry};

/// Kernel body
pub type KernelFn = Arc<dyn Fn(&KernelContext<'_>) + Send + Sync>;

/// What a kernel sees while it runs
pub struct KernelContext<'a> {
    buffers: &'a [NodeBuffer],
    arg: Option<&'a (dyn Any + Send + Sync)>,
    worker: WorkerId,
    arch: Arch,
    node: MemoryNode,
    power: Cell<Option<f64>>,
}

impl<'a> KernelContext<'a> {
    pub(crate) fn new(
        buffers: &'a [NodeBuffer],
        arg: Option<&'a (dyn Any + Send + Sync)>,
        worker: WorkerId,
        arch: Arch,
        node: MemoryNode,
    ) -> Self {
        Self {
            buffers,
            arg,
            worker,
            arch,
            node,
            power: Cell::new(None),
        }
    }

    /// Buffer `index` in declaration order
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range
    #[must_use]
    pub fn buffer(&self, index: usize) -> &NodeBuffer {
        &self.buffers[index]
    }

    /// Every buffer
    #[must_use]
    pub fn buffers(&self) -> &[NodeBuffer] {
        self.buffers
    }

    /// The task argument, if it has type `T`
    #[must_use]
    pub fn arg<T: Any>(&self) -> Option<&T> {
        self.arg.and_then(|a| a.downcast_ref::<T>())
    }

    /// Worker running the kernel
    #[must_use]
    pub const fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Architecture of that worker
    #[must_use]
    pub const fn arch(&self) -> Arch {
        self.arch
    }

    /// Memory node the buffers live on
    #[must_use]
    pub const fn node(&self) -> MemoryNode {
        self.node
    }

    /// Report the power drawn by this run
    pub fn report_power(&self, watts: f64) {
        self.power.set(Some(watts));
    }

    pub(crate) fn reported_power(&self) -> Option<f64> {
        self.power.get()
    }
}

/// How the duration of a codelet is predicted
#[derive(Clone, Default)]
pub enum CodeletModel {
    /// Learn from measurements
    #[default]
    History,
    /// Caller-supplied cost function
    Analytic(CostFn),
    /// Fixed cost per performance architecture
    PerArch(Vec<(PerfArch, f64)>),
}

impl std::fmt::Debug for CodeletModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::History => f.write_str("History"),
            Self::Analytic(_) => f.write_str("Analytic"),
            Self::PerArch(costs) => f.debug_tuple("PerArch").field(costs).finish(),
        }
    }
}

/// Implementations of one task kind
#[derive(Clone)]
pub struct Codelet {
    name: String,
    kind: TaskKind,
    modes: Vec<AccessMode>,
    implementations: IndexMap<Arch, KernelFn>,
    model: CodeletModel,
}

impl std::fmt::Debug for Codelet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codelet")
            .field("name", &self.name)
            .field("modes", &self.modes)
            .field("where", &self.where_mask())
            .field("model", &self.model)
            .finish()
    }
}

impl Codelet {
    /// A codelet named `name` accessing buffers in `modes`
    ///
    /// The task kind is derived from the name, so two codelets with one
    /// name share a performance model.
    #[must_use]
    pub fn new(name: impl Into<String>, modes: &[AccessMode]) -> Self {
        let name = name.into();
        Self {
            kind: TaskKind::from_symbol(&name),
            name,
            modes: modes.to_vec(),
            implementations: IndexMap::new(),
            model: CodeletModel::default(),
        }
    }

    /// Add (or replace) the implementation for `arch`
    #[must_use]
    pub fn with_impl(
        mut self,
        arch: Arch,
        kernel: impl Fn(&KernelContext<'_>) + Send + Sync + 'static,
    ) -> Self {
        self.implementations.insert(arch, Arc::new(kernel));
        self
    }

    /// Set the performance model
    #[must_use]
    pub fn with_model(mut self, model: CodeletModel) -> Self {
        self.model = model;
        self
    }

    /// Name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Task kind
    #[must_use]
    pub const fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Buffer access modes in declaration order
    #[must_use]
    pub fn modes(&self) -> &[AccessMode] {
        &self.modes
    }

    /// Architectures with an implementation
    #[must_use]
    pub fn where_mask(&self) -> ArchSet {
        self.implementations.keys().copied().collect()
    }

    /// Implementation for `arch`
    #[must_use]
    pub fn implementation(&self, arch: Arch) -> Option<&KernelFn> {
        self.implementations.get(&arch)
    }

    /// Check the codelet is runnable at all
    ///
    /// # Errors
    ///
    /// Returns `NoImplementation` when no architecture is covered
    pub fn validate(&self) -> RuntimeResult<()> {
        if self.implementations.is_empty() {
            return Err(RuntimeError::NoImplementation {
                codelet: self.name.clone(),
            });
        }
        Ok(())
    }

    /// Make sure `perf` knows how to predict this codelet
    pub(crate) fn register_model(&self, perf: &PerfRegistry) {
        match &self.model {
            CodeletModel::History => perf.ensure_history(self.kind, &self.name),
            CodeletModel::Analytic(cost) => {
                perf.register_analytic(self.kind, &self.name, Arc::clone(cost));
            }
            CodeletModel::PerArch(costs) => {
                perf.register(PerfModel::per_arch(self.kind, self.name.clone(), costs));
            }
        }
    }
}

/// Built-in codelet copying buffer 1 into buffer 0
#[must_use]
pub fn copy_codelet() -> Codelet {
    let copy = |ctx: &KernelContext<'_>| ctx.buffer(0).copy_from(ctx.buffer(1));
    Arch::ALL.into_iter().fold(
        Codelet::new("tessera_data_cpy", &[AccessMode::Write, AccessMode::Read]),
        |codelet, arch| codelet.with_impl(arch, copy),
    )
}
