//! # Backend seam
//!
//! The scheduler never talks to a device API directly. Everything it needs from
//! the outside world is a handful of opaque services: "put recorded operations on
//! queue Q", "transition a resource region", "signal/wait a monotonic counter",
//! and "read back a scalar the device wrote". [Backend] bundles those services.
//!
//! Counters are timeline-style: they only ever increase, signaling an old value
//! is a no-op, and waiting for value `v` returns once the counter reached at
//! least `v`. This matches both D3D12 fences and Vulkan timeline semaphores.

use std::time::Duration;

use anyhow::Result;

///Identifies one of the two independent execution timelines.
#[derive(Hash, PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy)]
pub enum QueueId {
    ///The direct queue. Compute and graphics workloads share this timeline.
    Primary,
    ///The async compute queue.
    Secondary,
}

///Submission priority of a queue, consumed at submit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePriority {
    Normal,
    High,
}

///Handle to a device-side output region owned by exactly one workload.
#[derive(Hash, PartialEq, Eq, Debug, Clone, Copy)]
pub struct RegionId(pub u32);

///Handle to a device-written scalar marker.
#[derive(Hash, PartialEq, Eq, Debug, Clone, Copy)]
pub struct MarkerId(pub u32);

///Handle to a monotonically increasing counter.
#[derive(Hash, PartialEq, Eq, Debug, Clone, Copy)]
pub struct CounterId(pub u32);

///Access state of an output region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    ///The producing workload may write the region.
    Writable,
    ///A consumer may read the region.
    Readable,
}

///How a state transition is issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierPhase {
    ///Immediate transition, resolved in place.
    Full,
    ///First half of a two-phase transition. Must be closed by a matching
    /// [End](BarrierPhase::End) on the same region before the next read.
    Begin,
    ///Second half of a two-phase transition.
    End,
}

///Pipeline a workload's device work runs through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    Compute,
    Graphics,
}

///Everything the backend needs to enqueue one workload invocation.
///
/// The device-side program is expected to write `frame` (truncated to 32 bit)
/// to `start_marker` as its first visible side effect and to `end_marker` as
/// its last one. The timer relies on that contract.
#[derive(Debug, Clone, Copy)]
pub struct WorkDesc<'a> {
    pub name: &'a str,
    pub kind: WorkKind,
    ///CPU frame counter at record time.
    pub frame: u64,
    ///Element-group count. Bounds how many elements one invocation touches.
    pub groups: u32,
    ///Iterations per element.
    pub iterations: u32,
    pub output: RegionId,
    pub start_marker: MarkerId,
    pub end_marker: MarkerId,
}

///The opaque device services the scheduler is built on.
///
/// Submission failures are unrecoverable for the session. They are surfaced to
/// the caller and never retried.
pub trait Backend {
    ///Allocates a new output region, initially [Writable](RegionState::Writable).
    fn create_region(&mut self, name: &str) -> Result<RegionId>;
    ///Allocates a new marker, initialized to 0.
    fn create_marker(&mut self, name: &str) -> Result<MarkerId>;
    ///Allocates a new counter, initialized to 0.
    fn create_counter(&mut self) -> Result<CounterId>;

    ///Records a clear of `region` onto `queue`'s open batch.
    fn clear_region(&mut self, queue: QueueId, region: RegionId) -> Result<()>;
    ///Records one workload invocation onto `queue`'s open batch.
    fn record_work(&mut self, queue: QueueId, work: &WorkDesc<'_>) -> Result<()>;
    ///Records a resource state transition onto `queue`'s open batch.
    fn insert_transition(
        &mut self,
        queue: QueueId,
        region: RegionId,
        from: RegionState,
        to: RegionState,
        phase: BarrierPhase,
    ) -> Result<()>;

    ///Makes `queue`'s subsequent submissions wait until `counter` reaches
    /// `value`. Device-side, never blocks the CPU.
    fn gpu_wait(&mut self, queue: QueueId, counter: CounterId, value: u64) -> Result<()>;
    ///Closes and submits `queue`'s open batch.
    fn submit(&mut self, queue: QueueId, priority: QueuePriority) -> Result<()>;
    ///Enqueues a signal of `counter` to `value` on `queue`'s timeline. The
    /// counter reaches `value` once all prior submissions on `queue` completed.
    fn signal(&mut self, queue: QueueId, counter: CounterId, value: u64) -> Result<()>;

    ///Signals `counter` from the CPU, immediately.
    fn signal_counter(&mut self, counter: CounterId, value: u64) -> Result<()>;
    ///Blocks the calling thread until `counter` reaches `value` or `timeout`
    /// expires. Returns whether the value was reached.
    fn block_until(&self, counter: CounterId, value: u64, timeout: Duration) -> Result<bool>;
    ///Non-blocking poll of a counter's current value.
    fn counter_value(&self, counter: CounterId) -> u64;
    ///Non-blocking poll of a device-written marker.
    fn read_marker(&self, marker: MarkerId) -> u32;
}
