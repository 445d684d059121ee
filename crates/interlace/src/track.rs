//! Execution tracks: one monotonic counter per queue plus the CPU-side frame
//! pacing built on top of them. The throttle here is the central backpressure
//! mechanism of the whole scheduler; it is the only place (apart from shutdown)
//! where the CPU blocks on the device.

use std::time::Duration;

use ahash::AHashMap;

use crate::SchedError;
use crate::backend::{Backend, CounterId, QueueId};

///A point on a track's timeline. Work guarded by it has completed once the
/// track's counter reached [wait_value](Guard::wait_value).
#[derive(Debug, Clone, Copy)]
pub struct Guard {
    track: TrackId,
    target_value: u64,
}

impl From<Guard> for TrackId {
    fn from(g: Guard) -> Self {
        g.track
    }
}

impl AsRef<TrackId> for Guard {
    fn as_ref(&self) -> &TrackId {
        &self.track
    }
}

impl Guard {
    pub fn queue(&self) -> QueueId {
        self.track.0
    }

    pub fn wait_value(&self) -> u64 {
        self.target_value
    }
}

#[derive(Hash, PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy)]
pub struct TrackId(pub QueueId);

///Execution track. A queue timeline and its pacing state.
pub(crate) struct Track {
    pub(crate) queue: QueueId,
    pub(crate) counter: CounterId,

    ///Latest value that is going to be signaled eventually.
    pub(crate) latest_signaled_value: u64,
    ///Highest value known on the CPU side to have completed.
    pub(crate) completed_value: u64,
    ///Latency the in-flight frames were admitted under. A latency lowered
    /// between frames leaves a legitimate gap above the new value; the
    /// overrun assert must measure against this one.
    admitted_latency: u64,
}

impl Track {
    pub fn new<B: Backend>(backend: &mut B, queue: QueueId) -> Result<Self, SchedError> {
        let counter = backend.create_counter()?;
        Ok(Track {
            queue,
            counter,
            latest_signaled_value: 0,
            completed_value: 0,
            admitted_latency: 0,
        })
    }

    ///Ticks the track: folds the device's current counter value into the
    /// CPU-side completion state.
    pub fn tick_frame<B: Backend>(&mut self, backend: &B) {
        let finished = backend.counter_value(self.counter);
        //the counter is saturated to u64::MAX during shutdown, never credit
        // more than was actually submitted
        self.completed_value = self
            .completed_value
            .max(finished.min(self.latest_signaled_value));
        debug_assert!(self.completed_value <= self.latest_signaled_value);
    }

    ///Allocates the next guard for this track.
    pub fn next_guard(&mut self) -> Guard {
        self.latest_signaled_value += 1;

        Guard {
            track: TrackId(self.queue),
            target_value: self.latest_signaled_value,
        }
    }

    ///Blocks until at most `latency` submissions are in flight once the next
    /// one is stamped, so the recording slot about to be reused is idle.
    ///
    /// A gap beyond the latency the frames were admitted under is an invariant
    /// violation: it asserts in debug builds, and is resolved here by blocking
    /// rather than letting a frame overwrite command data still in flight. A
    /// `latency` lowered between frames is not a violation, the surplus frames
    /// are simply drained before recording continues.
    pub fn throttle<B: Backend>(
        &mut self,
        backend: &B,
        latency: u64,
        timeout: Duration,
    ) -> Result<(), SchedError> {
        let next = self.latest_signaled_value + 1;
        let admitted = latency.max(self.admitted_latency);
        debug_assert!(
            next - self.completed_value <= admitted + 1,
            "pipeline overrun on {:?}: {} frames in flight, admitted latency {}",
            self.queue,
            next - self.completed_value,
            admitted
        );

        let target = next.saturating_sub(latency);
        while self.completed_value < target {
            let wait_for = self.completed_value + 1;
            #[cfg(feature = "logging")]
            log::trace!(
                "throttling {:?}, waiting for frame counter {}",
                self.queue,
                wait_for
            );
            if !backend.block_until(self.counter, wait_for, timeout)? {
                return Err(SchedError::ThrottleTimeout {
                    queue: self.queue,
                    value: wait_for,
                    timeout,
                });
            }
            self.completed_value += 1;
        }
        self.admitted_latency = latency;
        Ok(())
    }

    ///Blocks until everything submitted on this track has completed.
    pub fn flush<B: Backend>(&mut self, backend: &B, timeout: Duration) -> Result<(), SchedError> {
        if self.completed_value >= self.latest_signaled_value {
            return Ok(());
        }
        #[cfg(feature = "logging")]
        log::trace!(
            "flushing {:?}, waiting for frame counter {}",
            self.queue,
            self.latest_signaled_value
        );
        if !backend.block_until(self.counter, self.latest_signaled_value, timeout)? {
            return Err(SchedError::ThrottleTimeout {
                queue: self.queue,
                value: self.latest_signaled_value,
                timeout,
            });
        }
        self.completed_value = self.latest_signaled_value;
        Ok(())
    }
}

pub(crate) struct Tracks(pub AHashMap<TrackId, Track>);

impl Tracks {
    pub fn new<B: Backend>(backend: &mut B) -> Result<Self, SchedError> {
        let mut map = AHashMap::with_capacity(2);
        for queue in [QueueId::Primary, QueueId::Secondary] {
            map.insert(TrackId(queue), Track::new(backend, queue)?);
        }
        Ok(Tracks(map))
    }

    pub fn get(&self, queue: QueueId) -> &Track {
        &self.0[&TrackId(queue)]
    }

    pub fn get_mut(&mut self, queue: QueueId) -> &mut Track {
        self.0.get_mut(&TrackId(queue)).unwrap()
    }

    ///Returns true once the guard's value was reached on its track.
    pub fn guard_finished<B: Backend>(&self, backend: &B, guard: &Guard) -> bool {
        if let Some(t) = self.0.get(guard.as_ref()) {
            backend.counter_value(t.counter) >= guard.wait_value()
        } else {
            true
        }
    }
}
