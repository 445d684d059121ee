//! Per-queue execution. One OS thread per simulated queue consumes commands
//! strictly in submission order, which is exactly the in-order guarantee the
//! scheduler's frame cycle relies on.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{Receiver, SendError, Sender, channel};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use interlace::backend::{BarrierPhase, QueueId, RegionId, RegionState};

use crate::{Counter, Shared};

///One device-side operation inside a submitted batch.
pub(crate) enum SimOp {
    Clear {
        region: RegionId,
    },
    Transition {
        region: RegionId,
        phase: BarrierPhase,
    },
    Work {
        workload: String,
        frame: u64,
        ///groups * iterations, scaled by the shared per-unit cost.
        units: u64,
        output: RegionId,
        start_marker: Arc<AtomicU32>,
        end_marker: Arc<AtomicU32>,
    },
}

pub(crate) enum QueueCmd {
    Wait { counter: Arc<Counter>, value: u64 },
    Batch(Vec<SimOp>),
    Signal { counter: Arc<Counter>, value: u64 },
}

pub(crate) struct Worker {
    sender: Option<Sender<QueueCmd>>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn(queue: QueueId, shared: Arc<Shared>) -> Self {
        let (sender, receiver) = channel();
        let handle = std::thread::Builder::new()
            .name(format!("sim-queue-{:?}", queue).to_lowercase())
            .spawn(move || run(queue, shared, receiver))
            .expect("failed to spawn queue worker");

        Worker {
            sender: Some(sender),
            handle: Some(handle),
        }
    }

    pub fn send(&self, cmd: QueueCmd) -> Result<(), SendError<QueueCmd>> {
        //sender lives until stop()
        self.sender.as_ref().unwrap().send(cmd)
    }

    ///Closes the channel and joins the thread. Idempotent.
    pub fn stop(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(queue: QueueId, shared: Arc<Shared>, receiver: Receiver<QueueCmd>) {
    while let Ok(cmd) = receiver.recv() {
        if shared.shutdown.load(Ordering::Relaxed) {
            break;
        }
        shared.pause_gate(queue);
        match cmd {
            QueueCmd::Wait { counter, value } => {
                //generous bound, a lost signal shows up as a violation instead
                // of a hung test run
                if !counter.wait(value, Duration::from_secs(10), &shared.shutdown)
                    && !shared.shutdown.load(Ordering::Relaxed)
                {
                    shared.violation(format!(
                        "{:?}: device wait for counter value {} never resolved",
                        queue, value
                    ));
                }
            }
            QueueCmd::Batch(ops) => {
                for op in ops {
                    shared.pause_gate(queue);
                    if shared.shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                    execute(queue, &shared, op);
                }
            }
            QueueCmd::Signal { counter, value } => counter.signal(value),
        }
    }
}

fn execute(queue: QueueId, shared: &Shared, op: SimOp) {
    match op {
        SimOp::Clear { region } => {
            let mut regions = shared.regions.lock().unwrap();
            let slot = regions.get_mut(&region).expect("region exists");
            if slot.begin_pending {
                shared.violation(format!(
                    "{:?}: '{}' cleared while a begin half is outstanding",
                    queue, slot.name
                ));
                slot.begin_pending = false;
            }
            slot.state = RegionState::Writable;
        }
        SimOp::Transition { region, phase } => {
            let mut regions = shared.regions.lock().unwrap();
            let slot = regions.get_mut(&region).expect("region exists");
            match phase {
                BarrierPhase::Full => {
                    if slot.begin_pending {
                        shared.violation(format!(
                            "{:?}: full transition of '{}' overlaps a begin half",
                            queue, slot.name
                        ));
                        slot.begin_pending = false;
                    }
                    slot.state = RegionState::Readable;
                }
                BarrierPhase::Begin => {
                    if slot.begin_pending {
                        shared.violation(format!(
                            "{:?}: duplicate begin half for '{}'",
                            queue, slot.name
                        ));
                    }
                    slot.begin_pending = true;
                }
                BarrierPhase::End => {
                    if !slot.begin_pending {
                        shared.violation(format!(
                            "{:?}: end half for '{}' without a begin half",
                            queue, slot.name
                        ));
                    }
                    slot.begin_pending = false;
                    slot.state = RegionState::Readable;
                }
            }
        }
        SimOp::Work {
            workload,
            frame,
            units,
            output,
            start_marker,
            end_marker,
        } => {
            {
                let regions = shared.regions.lock().unwrap();
                let slot = regions.get(&output).expect("region exists");
                if slot.state != RegionState::Writable {
                    shared.violation(format!(
                        "{:?}: '{}' writes '{}' while it is readable",
                        queue, workload, slot.name
                    ));
                }
            }

            start_marker.store(frame as u32, Ordering::Release);
            std::thread::sleep(shared.cost * units.min(u64::from(u32::MAX)) as u32);
            end_marker.store(frame as u32, Ordering::Release);
        }
    }
}
