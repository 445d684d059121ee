//! # Interlace
//!
//! A multi-queue, dependency-driven execution scheduler. A fixed table of
//! [workloads](workload::Workload) is recorded every frame across two
//! independent queue timelines. The scheduler resolves each workload's
//! dependency edge into the correct output-region transition (optionally as a
//! two-phase split barrier), keeps the queues in step through monotonic
//! counters instead of CPU blocking, bounds the number of frames in flight to
//! a configured pipeline depth, and times each workload's device-side
//! execution through start/end markers smoothed over a fixed window.
//!
//! Device, queue, and resource creation stay outside: the scheduler drives a
//! [Backend](backend::Backend) implementation and nothing else.

pub mod backend;
pub mod workload;

mod resolver;
mod timing;
mod track;

#[cfg(test)]
mod test_stub;

use std::time::Duration;

use thiserror::Error;
use tinyvec::TinyVec;

use backend::{Backend, CounterId, QueueId, QueuePriority};
use track::Tracks;
use workload::{WorkloadDesc, WorkloadTable};

pub use timing::{HISTORY_LEN, WorkloadTiming};
pub use track::{Guard, TrackId};
pub use workload::ConfigError;

///Top level error structure.
#[derive(Debug, Error)]
pub enum SchedError {
    #[error("backend failure")]
    Backend(#[from] anyhow::Error),

    #[error("workload configuration rejected")]
    Config(#[from] ConfigError),

    #[error("pipeline overrun on {queue:?}: frame counter {value} not reached within {timeout:?}")]
    ThrottleTimeout {
        queue: QueueId,
        value: u64,
        timeout: Duration,
    },

    #[error("execution markers of '{workload}' not observed within {timeout:?}")]
    MarkerTimeout { workload: String, timeout: Duration },
}

///Configuration consumed at frame boundaries. Changing a field mid-frame is
/// impossible, [Scheduler::frame] copies the settings before recording.
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    ///Issue dependency transitions as two-phase split barriers to hide their
    /// latency behind trailing work.
    pub split_barriers: bool,
    ///Submit the secondary queue's batches at high priority.
    pub high_priority_secondary: bool,
    ///Maximum number of frames in flight before recording blocks.
    pub render_latency: u64,
    ///Bound on the pipeline-depth throttle and the shutdown flush.
    pub throttle_timeout: Duration,
    ///Bound on the execution-marker poll.
    pub marker_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            split_barriers: false,
            high_priority_secondary: false,
            render_latency: 2,
            throttle_timeout: Duration::from_secs(1),
            marker_timeout: Duration::from_millis(500),
        }
    }
}

///Guards for one submitted frame, one per queue timeline.
#[derive(Debug, Clone, Copy)]
pub struct FrameGuards {
    ///The frame that was recorded and submitted.
    pub frame: u64,
    pub primary: Guard,
    pub secondary: Guard,
}

///Pacing state of one queue timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    ///Frame counter value stamped on the latest submission.
    pub submitted: u64,
    ///Frame counter value the device has completed.
    pub completed: u64,
}

///Owns the workload table, both queue tracks, and the frame-ready counter, and
/// drives the per-frame cycle. Explicit init/teardown, no process-wide state.
pub struct Scheduler<B: Backend> {
    backend: B,
    table: WorkloadTable,
    tracks: Tracks,
    settings: Settings,

    ///CPU-signaled counter both queues wait on before executing a frame, so
    /// cross-queue timestamp sampling starts from one consistent point.
    ready_counter: CounterId,
    ///Monotonically increasing CPU-side frame counter.
    cpu_frame: u64,
}

impl<B: Backend> Scheduler<B> {
    pub fn new(mut backend: B, descs: &[WorkloadDesc]) -> Result<Self, SchedError> {
        let table = WorkloadTable::new(&mut backend, descs)?;
        let tracks = Tracks::new(&mut backend)?;
        let ready_counter = backend.create_counter()?;

        Ok(Scheduler {
            backend,
            table,
            tracks,
            settings: Settings::default(),
            ready_counter,
            cpu_frame: 0,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    ///Settings take effect with the next [frame](Self::frame) call.
    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn table(&self) -> &WorkloadTable {
        &self.table
    }

    ///Configuration access. Only reachable between frames.
    pub fn table_mut(&mut self) -> &mut WorkloadTable {
        &mut self.table
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn current_frame(&self) -> u64 {
        self.cpu_frame
    }

    pub fn stats(&self, queue: QueueId) -> QueueStats {
        let track = self.tracks.get(queue);
        QueueStats {
            submitted: track.latest_signaled_value,
            completed: self
                .backend
                .counter_value(track.counter)
                .min(track.latest_signaled_value),
        }
    }

    ///Returns true once the work guarded by `guard` has completed.
    pub fn guard_finished(&self, guard: &Guard) -> bool {
        self.tracks.guard_finished(&self.backend, guard)
    }

    ///Smoothed start/end times of every enabled workload, for display.
    pub fn timings(&self) -> TinyVec<[WorkloadTiming; 8]> {
        let mut vec = tinyvec::tiny_vec!([WorkloadTiming; 8]);
        for w in self.table.iter() {
            if !w.enabled() {
                continue;
            }
            let (start_ms, end_ms) = w.history.smoothed();
            vec.push(WorkloadTiming {
                name: w.name().to_owned(),
                start_ms,
                end_ms,
            });
        }
        vec
    }

    ///Runs one frame cycle: release the previous frame, throttle, time the
    /// released frame, resolve and record both queue groupings, hold both
    /// queues behind the frame-ready signal, submit, stamp each queue with the
    /// next frame counter value, advance.
    pub fn frame(&mut self) -> Result<FrameGuards, SchedError> {
        //freeze configuration for this frame
        let settings = self.settings;
        let latency = settings.render_latency.max(1);

        //1. let the device start on the previous frame. This must happen ahead
        // of the throttle: at a latency of one the throttle waits for the very
        // frame this signal unparks.
        if self.cpu_frame > 0 {
            self.backend
                .signal_counter(self.ready_counter, self.cpu_frame)?;
        }

        //2. make sure the recording slot about to be reused is idle
        for queue in [QueueId::Primary, QueueId::Secondary] {
            let track = self.tracks.get_mut(queue);
            track.tick_frame(&self.backend);
            track.throttle(&self.backend, latency, settings.throttle_timeout)?;
        }

        //3. watch the released frame's markers
        if self.cpu_frame > 0 {
            timing::sample_workloads(
                &self.backend,
                &mut self.table,
                self.cpu_frame,
                settings.marker_timeout,
            )?;
        }

        //4. resolve dependencies and record, one queue grouping at a time
        resolver::record_queue(
            &mut self.backend,
            &mut self.table,
            QueueId::Primary,
            self.cpu_frame,
            settings.split_barriers,
        )?;
        resolver::record_queue(
            &mut self.backend,
            &mut self.table,
            QueueId::Secondary,
            self.cpu_frame,
            settings.split_barriers,
        )?;

        //5./6. hold execution behind the next frame-ready signal, submit, and
        // stamp the queue's counter with the next frame value
        let mut guards = [None, None];
        for (slot, queue) in [QueueId::Primary, QueueId::Secondary].into_iter().enumerate() {
            self.backend
                .gpu_wait(queue, self.ready_counter, self.cpu_frame + 1)?;

            let priority = if queue == QueueId::Secondary && settings.high_priority_secondary {
                QueuePriority::High
            } else {
                QueuePriority::Normal
            };
            self.backend.submit(queue, priority)?;

            let track = self.tracks.get_mut(queue);
            let guard = track.next_guard();
            self.backend.signal(queue, track.counter, guard.wait_value())?;
            guards[slot] = Some(guard);
        }

        //7. advance
        let frame = self.cpu_frame;
        self.cpu_frame += 1;

        Ok(FrameGuards {
            frame,
            //both were just filled
            primary: guards[0].take().unwrap(),
            secondary: guards[1].take().unwrap(),
        })
    }

    ///Drains both queues. Any waiter still parked on the frame-ready counter
    /// is released first so the flush cannot deadlock.
    pub fn flush(&mut self) -> Result<(), SchedError> {
        self.backend.signal_counter(self.ready_counter, u64::MAX)?;
        let timeout = self.settings.throttle_timeout;
        for queue in [QueueId::Primary, QueueId::Secondary] {
            self.tracks.get_mut(queue).flush(&self.backend, timeout)?;
        }
        Ok(())
    }
}

impl<B: Backend> Drop for Scheduler<B> {
    fn drop(&mut self) {
        //best effort: outstanding submissions must not outlive the backend
        if let Err(_e) = self.flush() {
            #[cfg(feature = "logging")]
            log::error!("failed to flush scheduler on drop: {}", _e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_stub::{StubBackend, StubOp};
    use crate::workload::reference_table;
    use static_assertions::assert_impl_all;

    assert_impl_all!(SchedError: Send, Sync);
    assert_impl_all!(Settings: Copy);

    fn scheduler() -> Scheduler<StubBackend> {
        Scheduler::new(StubBackend::default(), &reference_table()).unwrap()
    }

    #[test]
    fn frame_advances_counters_in_lockstep() {
        let mut sched = scheduler();
        for expect in 0..4u64 {
            let guards = sched.frame().unwrap();
            assert_eq!(guards.frame, expect);
            assert_eq!(guards.primary.wait_value(), expect + 1);
            assert_eq!(guards.secondary.wait_value(), expect + 1);
        }
        assert_eq!(sched.current_frame(), 4);

        for queue in [QueueId::Primary, QueueId::Secondary] {
            let stats = sched.stats(queue);
            assert_eq!(stats.submitted, 4);
            assert!(stats.completed <= stats.submitted);
        }
    }

    #[test]
    fn queues_are_held_behind_the_ready_signal() {
        let mut sched = scheduler();
        sched.frame().unwrap();
        let ops = sched.backend_mut().take_ops();

        //per queue: the wait on the ready counter precedes the submit, the
        // submit precedes the completion signal
        for queue in [QueueId::Primary, QueueId::Secondary] {
            let wait = ops
                .iter()
                .position(|op| matches!(op, StubOp::GpuWait { queue: q, value: 1, .. } if *q == queue))
                .unwrap();
            let submit = ops
                .iter()
                .position(|op| matches!(op, StubOp::Submit { queue: q, .. } if *q == queue))
                .unwrap();
            let signal = ops
                .iter()
                .position(|op| matches!(op, StubOp::Signal { queue: q, value: 1, .. } if *q == queue))
                .unwrap();
            assert!(wait < submit && submit < signal);
        }
    }

    #[test]
    fn high_priority_applies_to_the_secondary_queue_only() {
        let mut sched = scheduler();
        sched.settings_mut().high_priority_secondary = true;
        sched.frame().unwrap();
        let ops = sched.backend_mut().take_ops();

        assert!(ops.iter().any(|op| matches!(
            op,
            StubOp::Submit {
                queue: QueueId::Secondary,
                priority: QueuePriority::High
            }
        )));
        assert!(ops.iter().any(|op| matches!(
            op,
            StubOp::Submit {
                queue: QueueId::Primary,
                priority: QueuePriority::Normal
            }
        )));
    }

    #[test]
    fn disabled_workload_leaves_the_timing_set() {
        let mut sched = scheduler();
        sched.frame().unwrap();
        sched.table_mut().set_enabled(3, false).unwrap();
        sched.frame().unwrap();

        let timings = sched.timings();
        assert_eq!(timings.len(), 7);
        assert!(timings.iter().all(|t| t.name != "Gfx Workload A"));
    }
}
