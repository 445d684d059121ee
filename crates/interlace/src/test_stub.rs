//! A recording stand-in for the device services, for unit tests only. Every
//! recorded or queue-level operation lands in one flat list in call order, and
//! counters complete instantly unless [hold_counters](StubBackend::hold_counters)
//! was called.

use std::cell::{Cell, RefCell};
use std::time::Duration;

use ahash::AHashMap;
use anyhow::Result;

use crate::backend::{
    Backend, BarrierPhase, CounterId, MarkerId, QueueId, QueuePriority, RegionId, RegionState,
    WorkDesc,
};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StubOp {
    Clear {
        queue: QueueId,
        region: RegionId,
    },
    Transition {
        queue: QueueId,
        region: RegionId,
        from: RegionState,
        to: RegionState,
        phase: BarrierPhase,
    },
    Work {
        queue: QueueId,
        name: String,
        frame: u64,
    },
    GpuWait {
        queue: QueueId,
        counter: CounterId,
        value: u64,
    },
    Submit {
        queue: QueueId,
        priority: QueuePriority,
    },
    Signal {
        queue: QueueId,
        counter: CounterId,
        value: u64,
    },
}

#[derive(Default)]
pub(crate) struct StubBackend {
    next_id: u32,
    ops: Vec<StubOp>,
    counters: RefCell<AHashMap<u32, u64>>,
    held: Cell<bool>,
    block_calls: Cell<usize>,
    ///value every marker poll reports. Defaults to "always signaled" so the
    /// timer never spins in unit tests.
    marker_value: Cell<Option<u32>>,
}

impl StubBackend {
    pub fn take_ops(&mut self) -> Vec<StubOp> {
        std::mem::take(&mut self.ops)
    }

    ///Stops counters from auto-completing on [Backend::block_until].
    pub fn hold_counters(&self) {
        self.held.set(true);
    }

    pub fn block_calls(&self) -> usize {
        self.block_calls.get()
    }

    #[allow(dead_code)]
    pub fn set_marker_value(&self, value: u32) {
        self.marker_value.set(Some(value));
    }

    fn next(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

impl Backend for StubBackend {
    fn create_region(&mut self, _name: &str) -> Result<RegionId> {
        Ok(RegionId(self.next()))
    }

    fn create_marker(&mut self, _name: &str) -> Result<MarkerId> {
        Ok(MarkerId(self.next()))
    }

    fn create_counter(&mut self) -> Result<CounterId> {
        let id = self.next();
        self.counters.borrow_mut().insert(id, 0);
        Ok(CounterId(id))
    }

    fn clear_region(&mut self, queue: QueueId, region: RegionId) -> Result<()> {
        self.ops.push(StubOp::Clear { queue, region });
        Ok(())
    }

    fn record_work(&mut self, queue: QueueId, work: &WorkDesc<'_>) -> Result<()> {
        self.ops.push(StubOp::Work {
            queue,
            name: work.name.to_owned(),
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
        self.ops.push(StubOp::Transition {
            queue,
            region,
            from,
            to,
            phase,
        });
        Ok(())
    }

    fn gpu_wait(&mut self, queue: QueueId, counter: CounterId, value: u64) -> Result<()> {
        self.ops.push(StubOp::GpuWait {
            queue,
            counter,
            value,
        });
        Ok(())
    }

    fn submit(&mut self, queue: QueueId, priority: QueuePriority) -> Result<()> {
        self.ops.push(StubOp::Submit { queue, priority });
        Ok(())
    }

    fn signal(&mut self, queue: QueueId, counter: CounterId, value: u64) -> Result<()> {
        self.ops.push(StubOp::Signal {
            queue,
            counter,
            value,
        });
        //queue-side signals complete instantly unless held
        if !self.held.get() {
            let mut counters = self.counters.borrow_mut();
            let c = counters.entry(counter.0).or_default();
            *c = (*c).max(value);
        }
        Ok(())
    }

    fn signal_counter(&mut self, counter: CounterId, value: u64) -> Result<()> {
        let mut counters = self.counters.borrow_mut();
        let c = counters.entry(counter.0).or_default();
        *c = (*c).max(value);
        Ok(())
    }

    fn block_until(&self, counter: CounterId, value: u64, _timeout: Duration) -> Result<bool> {
        self.block_calls.set(self.block_calls.get() + 1);
        if self.held.get() {
            return Ok(self.counter_value(counter) >= value);
        }
        let mut counters = self.counters.borrow_mut();
        let c = counters.entry(counter.0).or_default();
        *c = (*c).max(value);
        Ok(true)
    }

    fn counter_value(&self, counter: CounterId) -> u64 {
        self.counters
            .borrow()
            .get(&counter.0)
            .copied()
            .unwrap_or(0)
    }

    fn read_marker(&self, _marker: MarkerId) -> u32 {
        self.marker_value.get().unwrap_or(u32::MAX)
    }
}
