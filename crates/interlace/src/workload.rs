//! Workload records and the fixed table the scheduler operates over.
//!
//! The table is an arena constructed once at startup. Workloads are addressed
//! by their stable index in `[0, len)`, dependency edges are plain indices.
//! Configuration (enablement, load tunables, dependency edges) may only change
//! between frames; the `&mut` borrow the orchestrator takes for the duration
//! of a frame enforces that structurally.

use thiserror::Error;

use crate::backend::{Backend, MarkerId, QueueId, RegionId, WorkKind};
use crate::timing::TimingHistory;

///Upper bound for a workload's element-group count.
pub const MAX_GROUPS: u32 = 256;
///Upper bound for a workload's per-element iteration count.
pub const MAX_ITERATIONS: u32 = 128;
///Device-side elements per group.
pub const GROUP_SIZE: u32 = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("workload index {0} out of range")]
    UnknownWorkload(usize),
    #[error("dependency {dependency} out of range for a table of {len} workloads")]
    DependencyOutOfRange { dependency: usize, len: usize },
    #[error("workload {workload} may only depend on a strictly earlier workload, got {dependency}")]
    DependencyNotEarlier { workload: usize, dependency: usize },
    #[error("workload {workload} and dependency {dependency} are bound to different queues")]
    CrossQueueDependency { workload: usize, dependency: usize },
}

///Queue binding of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadClass {
    ///Compute work on the primary queue's timeline.
    Compute,
    ///Graphics work on the primary queue's timeline.
    Graphics,
    ///Compute work on the independent secondary queue.
    AsyncCompute,
}

impl WorkloadClass {
    ///The timeline this class executes on.
    pub fn queue(&self) -> QueueId {
        match self {
            WorkloadClass::Compute | WorkloadClass::Graphics => QueueId::Primary,
            WorkloadClass::AsyncCompute => QueueId::Secondary,
        }
    }

    pub(crate) fn work_kind(&self) -> WorkKind {
        match self {
            WorkloadClass::Graphics => WorkKind::Graphics,
            WorkloadClass::Compute | WorkloadClass::AsyncCompute => WorkKind::Compute,
        }
    }
}

///Per-frame state of a workload's output region transition.
///
/// Modeled explicitly so the begin/end pairing of split barriers is checkable
/// instead of implied by control flow. Reset to [Idle](TransitionState::Idle)
/// at the start of every frame's resolution pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransitionState {
    ///No transition issued this frame.
    Idle,
    ///The begin half of a split transition was recorded after the producer's
    /// work. Awaiting the matching end half.
    BeginIssued,
    ///The region is consumer-readable for the rest of the frame.
    Complete,
}

///Startup description of one workload.
#[derive(Debug, Clone)]
pub struct WorkloadDesc {
    pub name: String,
    pub class: WorkloadClass,
    pub groups: u32,
    pub iterations: u32,
    pub depends_on: Option<usize>,
}

impl WorkloadDesc {
    pub fn new(name: impl Into<String>, class: WorkloadClass) -> Self {
        WorkloadDesc {
            name: name.into(),
            class,
            //defaults of the reference workload set
            groups: 8,
            iterations: 64,
            depends_on: None,
        }
    }

    pub fn depends_on(mut self, dependency: usize) -> Self {
        self.depends_on = Some(dependency);
        self
    }
}

///The reference table: four primary-queue compute workloads, one graphics
/// workload, and three async compute workloads, each depending on its
/// predecessor within its queue grouping.
pub fn reference_table() -> Vec<WorkloadDesc> {
    vec![
        WorkloadDesc::new("Compute Workload A", WorkloadClass::Compute),
        WorkloadDesc::new("Compute Workload B", WorkloadClass::Compute).depends_on(0),
        WorkloadDesc::new("Compute Workload C", WorkloadClass::Compute).depends_on(1),
        WorkloadDesc::new("Gfx Workload A", WorkloadClass::Graphics).depends_on(2),
        WorkloadDesc::new("Compute Workload D", WorkloadClass::Compute).depends_on(3),
        WorkloadDesc::new("Compute Queue Workload A", WorkloadClass::AsyncCompute),
        WorkloadDesc::new("Compute Queue Workload B", WorkloadClass::AsyncCompute).depends_on(5),
        WorkloadDesc::new("Compute Queue Workload C", WorkloadClass::AsyncCompute).depends_on(6),
    ]
}

///One schedulable unit of device work with its output region, markers,
/// optional dependency edge, and timing history.
#[derive(Debug)]
pub struct Workload {
    pub(crate) name: String,
    pub(crate) class: WorkloadClass,
    pub(crate) enabled: bool,
    pub(crate) groups: u32,
    pub(crate) iterations: u32,
    pub(crate) depends_on: Option<usize>,

    pub(crate) output: RegionId,
    pub(crate) start_marker: MarkerId,
    pub(crate) end_marker: MarkerId,

    pub(crate) transition: TransitionState,
    ///Frame counter stamped when the workload was last recorded.
    pub(crate) last_updated_frame: Option<u64>,
    pub(crate) history: TimingHistory,
}

impl Workload {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class(&self) -> WorkloadClass {
        self.class
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn groups(&self) -> u32 {
        self.groups
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn dependency(&self) -> Option<usize> {
        self.depends_on
    }

    ///The workload's device-side output region.
    pub fn output_region(&self) -> RegionId {
        self.output
    }
}

///Ordered, fixed-size table of workload records.
#[derive(Debug)]
pub struct WorkloadTable {
    pub(crate) workloads: Vec<Workload>,
}

impl WorkloadTable {
    ///Builds the table, validating every dependency edge and allocating each
    /// workload's output region and start/end markers on the backend.
    pub(crate) fn new<B: Backend>(
        backend: &mut B,
        descs: &[WorkloadDesc],
    ) -> Result<Self, crate::SchedError> {
        let mut workloads = Vec::with_capacity(descs.len());
        for (idx, desc) in descs.iter().enumerate() {
            if let Some(dep) = desc.depends_on {
                Self::validate_edge(descs, idx, dep)?;
            }

            let output = backend.create_region(&desc.name)?;
            let start_marker = backend.create_marker(&desc.name)?;
            let end_marker = backend.create_marker(&desc.name)?;

            workloads.push(Workload {
                name: desc.name.clone(),
                class: desc.class,
                enabled: true,
                groups: desc.groups.clamp(1, MAX_GROUPS),
                iterations: desc.iterations.clamp(1, MAX_ITERATIONS),
                depends_on: desc.depends_on,
                output,
                start_marker,
                end_marker,
                transition: TransitionState::Idle,
                last_updated_frame: None,
                history: TimingHistory::new(),
            });
        }

        Ok(WorkloadTable { workloads })
    }

    fn validate_edge(descs: &[WorkloadDesc], workload: usize, dep: usize) -> Result<(), ConfigError> {
        if dep >= descs.len() {
            return Err(ConfigError::DependencyOutOfRange {
                dependency: dep,
                len: descs.len(),
            });
        }
        if dep >= workload {
            return Err(ConfigError::DependencyNotEarlier {
                workload,
                dependency: dep,
            });
        }
        //the resolver emits the transition on the dependent's queue. An edge
        // into the other grouping could never be resolved there.
        if descs[dep].class.queue() != descs[workload].class.queue() {
            return Err(ConfigError::CrossQueueDependency {
                workload,
                dependency: dep,
            });
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.workloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workloads.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Workload> {
        self.workloads.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Workload> {
        self.workloads.iter()
    }

    pub fn set_enabled(&mut self, idx: usize, enabled: bool) -> Result<(), ConfigError> {
        self.workloads
            .get_mut(idx)
            .ok_or(ConfigError::UnknownWorkload(idx))?
            .enabled = enabled;
        Ok(())
    }

    ///Updates the load tunables. Values are clamped to the supported range.
    pub fn set_load(&mut self, idx: usize, groups: u32, iterations: u32) -> Result<(), ConfigError> {
        let w = self
            .workloads
            .get_mut(idx)
            .ok_or(ConfigError::UnknownWorkload(idx))?;
        w.groups = groups.clamp(1, MAX_GROUPS);
        w.iterations = iterations.clamp(1, MAX_ITERATIONS);
        Ok(())
    }

    ///Reassigns a dependency edge. Takes effect on the next frame's
    /// resolution pass.
    pub fn set_dependency(&mut self, idx: usize, dep: Option<usize>) -> Result<(), ConfigError> {
        if idx >= self.workloads.len() {
            return Err(ConfigError::UnknownWorkload(idx));
        }
        if let Some(dep) = dep {
            if dep >= self.workloads.len() {
                return Err(ConfigError::DependencyOutOfRange {
                    dependency: dep,
                    len: self.workloads.len(),
                });
            }
            if dep >= idx {
                return Err(ConfigError::DependencyNotEarlier {
                    workload: idx,
                    dependency: dep,
                });
            }
            if self.workloads[dep].class.queue() != self.workloads[idx].class.queue() {
                return Err(ConfigError::CrossQueueDependency {
                    workload: idx,
                    dependency: dep,
                });
            }
        }
        self.workloads[idx].depends_on = dep;
        Ok(())
    }

    ///The dependency edge of `idx` after applying the degrade policy: an edge
    /// that is out of range, not strictly earlier, cross-queue, or pointing at
    /// a disabled workload counts as "no dependency".
    pub(crate) fn resolved_dependency(&self, idx: usize) -> Option<usize> {
        let dep = self.workloads[idx].depends_on?;
        if dep >= idx {
            return None;
        }
        let d = &self.workloads[dep];
        if !d.enabled || d.class.queue() != self.workloads[idx].class.queue() {
            return None;
        }
        Some(dep)
    }
}
