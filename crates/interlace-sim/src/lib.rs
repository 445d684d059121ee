//! # Interlace-Sim
//!
//! A CPU-only implementation of [interlace's backend seam](interlace::backend::Backend).
//! Each queue is a worker thread consuming submitted batches in order, counters
//! are condvar-backed monotonic cells with timeline-semaphore semantics, and
//! markers are atomics the simulated "device" writes as work executes.
//!
//! On top of executing work the simulation keeps two audit trails:
//! - an event log of every queue-level operation in CPU call order, for
//!   asserting program order in tests, and
//! - a violation list fed by the worker threads whenever the transition
//!   protocol is broken (an unmatched begin half, a read of a writable
//!   region, a device-side wait that never resolved).

mod queue;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use anyhow::{Result, anyhow};

use interlace::backend::{
    Backend, BarrierPhase, CounterId, MarkerId, QueueId, QueuePriority, RegionId, RegionState,
    WorkDesc,
};

use queue::{QueueCmd, SimOp, Worker};

///One recorded operation, as seen at submit time.
#[derive(Debug, Clone, PartialEq)]
pub enum OpEvent {
    Clear {
        region: RegionId,
    },
    Transition {
        region: RegionId,
        from: RegionState,
        to: RegionState,
        phase: BarrierPhase,
    },
    Work {
        workload: String,
        frame: u64,
    },
}

///One queue-level operation, in CPU call order.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    GpuWait {
        queue: QueueId,
        value: u64,
    },
    Submitted {
        queue: QueueId,
        priority: QueuePriority,
        ops: Vec<OpEvent>,
    },
    Signaled {
        queue: QueueId,
        value: u64,
    },
}

///Monotonically increasing counter with timeline-semaphore semantics:
/// signaling never lowers the value, waiting returns once the value was
/// reached.
pub(crate) struct Counter {
    value: Mutex<u64>,
    cond: Condvar,
}

impl Counter {
    fn new() -> Arc<Self> {
        Arc::new(Counter {
            value: Mutex::new(0),
            cond: Condvar::new(),
        })
    }

    pub fn signal(&self, value: u64) {
        let mut guard = self.value.lock().unwrap();
        if value > *guard {
            *guard = value;
            self.cond.notify_all();
        }
    }

    pub fn get(&self) -> u64 {
        *self.value.lock().unwrap()
    }

    ///Waits in short slices so a shutdown can interrupt a parked waiter.
    pub fn wait(&self, value: u64, timeout: Duration, shutdown: &AtomicBool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.value.lock().unwrap();
        while *guard < value {
            if shutdown.load(Ordering::Relaxed) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let slice = (deadline - now).min(Duration::from_millis(10));
            let (next, _) = self.cond.wait_timeout(guard, slice).unwrap();
            guard = next;
        }
        true
    }
}

pub(crate) struct RegionSlot {
    pub name: String,
    pub state: RegionState,
    ///A begin half was recorded and awaits its end half.
    pub begin_pending: bool,
}

///State shared between the frontend and the queue workers.
pub(crate) struct Shared {
    pub shutdown: AtomicBool,
    pub regions: Mutex<AHashMap<RegionId, RegionSlot>>,
    pub violations: Mutex<Vec<String>>,
    pub paused: Mutex<AHashMap<QueueId, bool>>,
    pub pause_cond: Condvar,
    ///Simulated device cost per element-group iteration.
    pub cost: Duration,
}

impl Shared {
    pub fn violation(&self, msg: String) {
        #[cfg(feature = "logging")]
        log::error!("protocol violation: {}", msg);
        self.violations.lock().unwrap().push(msg);
    }

    ///Parks the calling worker while its queue is paused.
    pub fn pause_gate(&self, queue: QueueId) {
        let mut paused = self.paused.lock().unwrap();
        while *paused.get(&queue).unwrap_or(&false) {
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            let (next, _) = self
                .pause_cond
                .wait_timeout(paused, Duration::from_millis(10))
                .unwrap();
            paused = next;
        }
    }
}

///The simulated device. Owns both queue workers and every allocated region,
/// marker, and counter.
pub struct SimBackend {
    shared: Arc<Shared>,
    workers: AHashMap<QueueId, Worker>,

    counters: Vec<Arc<Counter>>,
    markers: Vec<Arc<AtomicU32>>,
    next_region: u32,

    pending: AHashMap<QueueId, Vec<SimOp>>,
    pending_events: AHashMap<QueueId, Vec<OpEvent>>,
    events: Vec<Event>,
}

impl SimBackend {
    pub fn new() -> Self {
        Self::with_cost(Duration::from_micros(2))
    }

    ///`cost` is the simulated execution time per element-group iteration, so
    /// one invocation busy-runs for `groups * iterations * cost`.
    pub fn with_cost(cost: Duration) -> Self {
        let shared = Arc::new(Shared {
            shutdown: AtomicBool::new(false),
            regions: Mutex::new(AHashMap::default()),
            violations: Mutex::new(Vec::new()),
            paused: Mutex::new(AHashMap::default()),
            pause_cond: Condvar::new(),
            cost,
        });

        let mut workers = AHashMap::with_capacity(2);
        let mut pending = AHashMap::with_capacity(2);
        let mut pending_events = AHashMap::with_capacity(2);
        for queue in [QueueId::Primary, QueueId::Secondary] {
            workers.insert(queue, Worker::spawn(queue, shared.clone()));
            pending.insert(queue, Vec::new());
            pending_events.insert(queue, Vec::new());
        }

        SimBackend {
            shared,
            workers,
            counters: Vec::new(),
            markers: Vec::new(),
            next_region: 0,
            pending,
            pending_events,
            events: Vec::new(),
        }
    }

    ///Stops `queue`'s worker from making progress until [resume](Self::resume).
    pub fn pause(&self, queue: QueueId) {
        *self
            .shared
            .paused
            .lock()
            .unwrap()
            .entry(queue)
            .or_default() = true;
    }

    pub fn resume(&self, queue: QueueId) {
        *self
            .shared
            .paused
            .lock()
            .unwrap()
            .entry(queue)
            .or_default() = false;
        self.shared.pause_cond.notify_all();
    }

    ///Drains the recorded queue-level events.
    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    ///Protocol violations the workers observed so far.
    pub fn violations(&self) -> Vec<String> {
        self.shared.violations.lock().unwrap().clone()
    }

    fn send(&self, queue: QueueId, cmd: QueueCmd) -> Result<()> {
        self.workers
            .get(&queue)
            .expect("both queues exist")
            .send(cmd)
            .map_err(|_| anyhow!("queue worker for {:?} terminated", queue))
    }

    fn counter(&self, counter: CounterId) -> Result<&Arc<Counter>> {
        self.counters
            .get(counter.0 as usize)
            .ok_or_else(|| anyhow!("unknown counter {:?}", counter))
    }
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for SimBackend {
    fn create_region(&mut self, name: &str) -> Result<RegionId> {
        let id = RegionId(self.next_region);
        self.next_region += 1;
        self.shared.regions.lock().unwrap().insert(
            id,
            RegionSlot {
                name: name.to_owned(),
                state: RegionState::Writable,
                begin_pending: false,
            },
        );
        Ok(id)
    }

    fn create_marker(&mut self, _name: &str) -> Result<MarkerId> {
        let id = MarkerId(self.markers.len() as u32);
        self.markers.push(Arc::new(AtomicU32::new(0)));
        Ok(id)
    }

    fn create_counter(&mut self) -> Result<CounterId> {
        let id = CounterId(self.counters.len() as u32);
        self.counters.push(Counter::new());
        Ok(id)
    }

    fn clear_region(&mut self, queue: QueueId, region: RegionId) -> Result<()> {
        self.pending.get_mut(&queue).unwrap().push(SimOp::Clear { region });
        self.pending_events
            .get_mut(&queue)
            .unwrap()
            .push(OpEvent::Clear { region });
        Ok(())
    }

    fn record_work(&mut self, queue: QueueId, work: &WorkDesc<'_>) -> Result<()> {
        let start_marker = self
            .markers
            .get(work.start_marker.0 as usize)
            .ok_or_else(|| anyhow!("unknown marker {:?}", work.start_marker))?
            .clone();
        let end_marker = self
            .markers
            .get(work.end_marker.0 as usize)
            .ok_or_else(|| anyhow!("unknown marker {:?}", work.end_marker))?
            .clone();

        self.pending.get_mut(&queue).unwrap().push(SimOp::Work {
            workload: work.name.to_owned(),
            frame: work.frame,
            units: u64::from(work.groups) * u64::from(work.iterations),
            output: work.output,
            start_marker,
            end_marker,
        });
        self.pending_events
            .get_mut(&queue)
            .unwrap()
            .push(OpEvent::Work {
                workload: work.name.to_owned(),
                frame: work.frame,
            });
        Ok(())
    }

    fn insert_transition(
        &mut self,
        queue: QueueId,
        region: RegionId,
        from: RegionState,
        to: RegionState,
        phase: BarrierPhase,
    ) -> Result<()> {
        self.pending
            .get_mut(&queue)
            .unwrap()
            .push(SimOp::Transition { region, phase });
        self.pending_events
            .get_mut(&queue)
            .unwrap()
            .push(OpEvent::Transition {
                region,
                from,
                to,
                phase,
            });
        Ok(())
    }

    fn gpu_wait(&mut self, queue: QueueId, counter: CounterId, value: u64) -> Result<()> {
        let counter = self.counter(counter)?.clone();
        self.events.push(Event::GpuWait { queue, value });
        self.send(queue, QueueCmd::Wait { counter, value })
    }

    fn submit(&mut self, queue: QueueId, priority: QueuePriority) -> Result<()> {
        let ops = std::mem::take(self.pending.get_mut(&queue).unwrap());
        let op_events = std::mem::take(self.pending_events.get_mut(&queue).unwrap());
        self.events.push(Event::Submitted {
            queue,
            priority,
            ops: op_events,
        });
        self.send(queue, QueueCmd::Batch(ops))
    }

    fn signal(&mut self, queue: QueueId, counter: CounterId, value: u64) -> Result<()> {
        let counter = self.counter(counter)?.clone();
        self.events.push(Event::Signaled { queue, value });
        self.send(queue, QueueCmd::Signal { counter, value })
    }

    fn signal_counter(&mut self, counter: CounterId, value: u64) -> Result<()> {
        self.counter(counter)?.signal(value);
        Ok(())
    }

    fn block_until(&self, counter: CounterId, value: u64, timeout: Duration) -> Result<bool> {
        let counter = self.counter(counter)?;
        Ok(counter.wait(value, timeout, &self.shared.shutdown))
    }

    fn counter_value(&self, counter: CounterId) -> u64 {
        self.counters
            .get(counter.0 as usize)
            .map(|c| c.get())
            .unwrap_or(0)
    }

    fn read_marker(&self, marker: MarkerId) -> u32 {
        self.markers
            .get(marker.0 as usize)
            .map(|m| m.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}

impl Drop for SimBackend {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        self.shared.pause_cond.notify_all();
        for (_queue, worker) in self.workers.iter_mut() {
            worker.stop();
        }
    }
}
