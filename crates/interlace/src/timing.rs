//! Execution timing: polls the start/end markers device-side work writes, and
//! smooths the observed wall-clock samples over a fixed window.

use std::time::{Duration, Instant};

use smallvec::SmallVec;

use crate::SchedError;
use crate::backend::Backend;
use crate::workload::WorkloadTable;

///Number of per-workload samples kept for smoothing.
pub const HISTORY_LEN: usize = 64;

///Fixed circular history of start/end samples, overwritten round-robin keyed
/// by frame counter.
///
/// The reported value is the arithmetic mean over the *full* window, including
/// the zero-initialized slots. Until [HISTORY_LEN] frames have been sampled the
/// mean is therefore biased toward zero. That transient is deliberate, the
/// window is meant for a continuously running display.
#[derive(Debug)]
pub(crate) struct TimingHistory {
    starts: [f32; HISTORY_LEN],
    ends: [f32; HISTORY_LEN],
}

impl TimingHistory {
    pub fn new() -> Self {
        TimingHistory {
            starts: [0.0; HISTORY_LEN],
            ends: [0.0; HISTORY_LEN],
        }
    }

    pub fn record(&mut self, frame: u64, start_ms: f32, end_ms: f32) {
        let slot = (frame % HISTORY_LEN as u64) as usize;
        self.starts[slot] = start_ms;
        self.ends[slot] = end_ms;
    }

    ///Smoothed (start, end) pair in milliseconds.
    pub fn smoothed(&self) -> (f32, f32) {
        let start: f32 = self.starts.iter().sum();
        let end: f32 = self.ends.iter().sum();
        (start / HISTORY_LEN as f32, end / HISTORY_LEN as f32)
    }
}

///Smoothed timing of one workload, in milliseconds relative to the frame's
/// release point.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct WorkloadTiming {
    pub name: String,
    pub start_ms: f32,
    pub end_ms: f32,
}

struct Pending {
    idx: usize,
    start_ms: Option<f32>,
    end_ms: Option<f32>,
}

///Polls the start/end markers of every workload that was recorded in frame
/// `frame - 1` until each has been observed both starting and finishing,
/// stamping wall-clock times as they appear.
///
/// This is a spin-poll: progress depends entirely on the device writing the
/// markers. A hung device is surfaced as [SchedError::MarkerTimeout] once
/// `deadline` expires instead of spinning forever.
pub(crate) fn sample_workloads<B: Backend>(
    backend: &B,
    table: &mut WorkloadTable,
    frame: u64,
    deadline: Duration,
) -> Result<(), SchedError> {
    debug_assert!(frame > 0);
    let observed = frame - 1;

    let mut pending: SmallVec<[Pending; 8]> = table
        .workloads
        .iter()
        .enumerate()
        .filter(|(_, w)| w.enabled && w.last_updated_frame == Some(observed))
        .map(|(idx, _)| Pending {
            idx,
            start_ms: None,
            end_ms: None,
        })
        .collect();

    if pending.is_empty() {
        return Ok(());
    }

    let timer = Instant::now();
    let mut open = pending.len();
    while open > 0 {
        for p in pending.iter_mut() {
            if p.start_ms.is_some() && p.end_ms.is_some() {
                continue;
            }
            let w = &table.workloads[p.idx];

            //markers carry the frame counter truncated to 32 bit
            let signal_value = observed as u32;
            if p.start_ms.is_none() && backend.read_marker(w.start_marker) >= signal_value {
                p.start_ms = Some(timer.elapsed().as_secs_f32() * 1000.0);
            }
            if p.end_ms.is_none() && backend.read_marker(w.end_marker) >= signal_value {
                p.end_ms = Some(timer.elapsed().as_secs_f32() * 1000.0);
            }

            if p.start_ms.is_some() && p.end_ms.is_some() {
                open -= 1;
            }
        }

        if open > 0 && timer.elapsed() > deadline {
            let stuck = pending
                .iter()
                .find(|p| p.start_ms.is_none() || p.end_ms.is_none())
                .map(|p| table.workloads[p.idx].name.clone())
                .unwrap_or_default();
            return Err(SchedError::MarkerTimeout {
                workload: stuck,
                timeout: deadline,
            });
        }
        std::hint::spin_loop();
    }

    for p in pending {
        let w = &mut table.workloads[p.idx];
        //both are Some once the loop above terminated
        w.history
            .record(frame, p.start_ms.unwrap_or(0.0), p.end_ms.unwrap_or(0.0));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smoothing_converges_after_a_full_window() {
        let mut h = TimingHistory::new();
        for frame in 0..HISTORY_LEN as u64 {
            h.record(frame, 2.5, 4.0);
        }
        let (start, end) = h.smoothed();
        assert!((start - 2.5).abs() < 1e-5);
        assert!((end - 4.0).abs() < 1e-5);
    }

    #[test]
    fn smoothing_is_zero_biased_while_filling() {
        //known transient: the mean runs over the whole window, so after half
        // of it the reported value is half the constant sample
        let mut h = TimingHistory::new();
        for frame in 0..(HISTORY_LEN / 2) as u64 {
            h.record(frame, 8.0, 8.0);
        }
        let (start, _) = h.smoothed();
        assert!((start - 4.0).abs() < 1e-5);
    }

    #[test]
    fn slots_are_reused_round_robin() {
        let mut h = TimingHistory::new();
        for frame in 0..(HISTORY_LEN * 3) as u64 {
            h.record(frame, 1.0, 2.0);
        }
        //a later frame overwrites the slot of frame % HISTORY_LEN
        h.record(HISTORY_LEN as u64 * 3, 65.0, 66.0);
        let (start, end) = h.smoothed();
        assert!((start - (63.0 + 65.0) / 64.0).abs() < 1e-4);
        assert!((end - (63.0 * 2.0 + 66.0) / 64.0).abs() < 1e-4);
    }
}
