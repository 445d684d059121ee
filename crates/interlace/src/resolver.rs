//! The per-frame dependency/barrier pass.
//!
//! One linear scan per queue grouping, in ascending workload index order. A
//! dependency edge always points at a strictly earlier index, so a single scan
//! resolves every edge without a topological sort. Whether a workload is
//! depended upon is re-derived freshly every frame; caching it across frames
//! would let a mid-run disable orphan one half of a split transition.

use crate::SchedError;
use crate::backend::{Backend, BarrierPhase, QueueId, RegionState, WorkDesc};
use crate::workload::{TransitionState, WorkloadTable};

///Records one queue's ordered subset of enabled workloads for `frame`,
/// emitting the required output-region transitions along the way.
pub(crate) fn record_queue<B: Backend>(
    backend: &mut B,
    table: &mut WorkloadTable,
    queue: QueueId,
    frame: u64,
    split_barriers: bool,
) -> Result<(), SchedError> {
    //reset the transient transition state before any workload of this pass
    // runs, then clear each enabled workload's output region
    for idx in 0..table.len() {
        let w = &mut table.workloads[idx];
        if w.class.queue() != queue {
            continue;
        }
        w.transition = TransitionState::Idle;
        if !w.enabled {
            continue;
        }
        backend.clear_region(queue, w.output)?;
    }

    for idx in 0..table.len() {
        if table.workloads[idx].class.queue() != queue || !table.workloads[idx].enabled {
            continue;
        }

        //make the dependency's output visible, unless an earlier consumer
        // already did (the transition is idempotent per frame)
        if let Some(dep) = table.resolved_dependency(idx) {
            if table.workloads[dep].transition != TransitionState::Complete {
                let phase = if split_barriers {
                    if table.workloads[dep].transition == TransitionState::BeginIssued {
                        //close the half opened right after the dependency's work
                        BarrierPhase::End
                    } else {
                        //the begin half was never opened. With configuration
                        // frozen for the frame this cannot happen, but an
                        // unmatched end would be a protocol violation, so
                        // degrade to an immediate transition.
                        #[cfg(feature = "logging")]
                        log::warn!(
                            "split transition for '{}' had no begin half, issuing a full barrier",
                            table.workloads[dep].name
                        );
                        BarrierPhase::Full
                    }
                } else {
                    BarrierPhase::Full
                };

                backend.insert_transition(
                    queue,
                    table.workloads[dep].output,
                    RegionState::Writable,
                    RegionState::Readable,
                    phase,
                )?;
                table.workloads[dep].transition = TransitionState::Complete;
            }
        }

        let w = &table.workloads[idx];
        let desc = WorkDesc {
            name: &w.name,
            kind: w.class.work_kind(),
            frame,
            groups: w.groups,
            iterations: w.iterations,
            output: w.output,
            start_marker: w.start_marker,
            end_marker: w.end_marker,
        };
        backend.record_work(queue, &desc)?;
        table.workloads[idx].last_updated_frame = Some(frame);

        //in split mode, open the begin half right after the producing work so
        // the transition overlaps everything recorded until the consumer. Only
        // pay for it if someone actually consumes this output later on.
        if split_barriers && table.workloads[idx].transition == TransitionState::Idle {
            let is_depended_on = (idx + 1..table.len()).any(|other| {
                table.workloads[other].enabled && table.resolved_dependency(other) == Some(idx)
            });

            if is_depended_on {
                let output = table.workloads[idx].output;
                backend.insert_transition(
                    queue,
                    output,
                    RegionState::Writable,
                    RegionState::Readable,
                    BarrierPhase::Begin,
                )?;
                table.workloads[idx].transition = TransitionState::BeginIssued;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_stub::{StubBackend, StubOp};
    use crate::workload::{WorkloadClass, WorkloadDesc};

    fn chain(n: usize) -> Vec<WorkloadDesc> {
        (0..n)
            .map(|i| {
                let d = WorkloadDesc::new(format!("w{}", i), WorkloadClass::Compute);
                if i > 0 { d.depends_on(i - 1) } else { d }
            })
            .collect()
    }

    fn run(
        backend: &mut StubBackend,
        table: &mut WorkloadTable,
        split: bool,
    ) -> Vec<StubOp> {
        record_queue(backend, table, QueueId::Primary, 0, split).unwrap();
        backend.take_ops()
    }

    #[test]
    fn transition_resolves_before_dependent_work() {
        let mut backend = StubBackend::default();
        let mut table = WorkloadTable::new(&mut backend, &chain(2)).unwrap();
        let ops = run(&mut backend, &mut table, false);

        let producer_work = ops
            .iter()
            .position(|op| matches!(op, StubOp::Work { name, .. } if name == "w0"))
            .unwrap();
        let transition = ops
            .iter()
            .position(|op| matches!(op, StubOp::Transition { phase: BarrierPhase::Full, .. }))
            .unwrap();
        let consumer_work = ops
            .iter()
            .position(|op| matches!(op, StubOp::Work { name, .. } if name == "w1"))
            .unwrap();
        assert!(producer_work < transition && transition < consumer_work);
    }

    #[test]
    fn split_mode_pairs_begin_and_end() {
        let mut backend = StubBackend::default();
        let mut table = WorkloadTable::new(&mut backend, &chain(3)).unwrap();
        let ops = run(&mut backend, &mut table, true);

        let begins = ops
            .iter()
            .filter(|op| matches!(op, StubOp::Transition { phase: BarrierPhase::Begin, .. }))
            .count();
        let ends = ops
            .iter()
            .filter(|op| matches!(op, StubOp::Transition { phase: BarrierPhase::End, .. }))
            .count();
        //w0 and w1 are depended upon, w2 is not
        assert_eq!(begins, 2);
        assert_eq!(ends, 2);
        assert!(!ops.iter().any(|op| matches!(op, StubOp::Transition { phase: BarrierPhase::Full, .. })));
    }

    #[test]
    fn tail_workload_emits_no_split_barrier() {
        let mut backend = StubBackend::default();
        let mut table = WorkloadTable::new(&mut backend, &chain(2)).unwrap();
        let tail_output = table.workloads[1].output;
        let ops = run(&mut backend, &mut table, true);

        assert!(!ops.iter().any(
            |op| matches!(op, StubOp::Transition { region, .. } if *region == tail_output)
        ));
    }

    #[test]
    fn disabled_dependency_skips_barrier_emission() {
        let mut backend = StubBackend::default();
        let mut table = WorkloadTable::new(&mut backend, &chain(4)).unwrap();
        table.set_enabled(2, false).unwrap();
        let ops = run(&mut backend, &mut table, false);

        //w3 depends on the disabled w2: no transition on w2's output, and w2
        // is neither cleared nor recorded
        let w2_output = table.workloads[2].output;
        assert!(!ops.iter().any(
            |op| matches!(op, StubOp::Transition { region, .. } if *region == w2_output)
        ));
        assert!(!ops
            .iter()
            .any(|op| matches!(op, StubOp::Work { name, .. } if name == "w2")));
        assert_eq!(table.workloads[2].last_updated_frame, None);
    }

    #[test]
    fn shared_dependency_transitions_once() {
        let mut backend = StubBackend::default();
        let descs = vec![
            WorkloadDesc::new("producer", WorkloadClass::Compute),
            WorkloadDesc::new("consumer A", WorkloadClass::Compute).depends_on(0),
            WorkloadDesc::new("consumer B", WorkloadClass::Compute).depends_on(0),
        ];
        let mut table = WorkloadTable::new(&mut backend, &descs).unwrap();
        let ops = run(&mut backend, &mut table, false);

        let transitions = ops
            .iter()
            .filter(|op| matches!(op, StubOp::Transition { .. }))
            .count();
        assert_eq!(transitions, 1);
    }

    #[test]
    fn other_queue_grouping_is_untouched() {
        let mut backend = StubBackend::default();
        let descs = vec![
            WorkloadDesc::new("direct", WorkloadClass::Compute),
            WorkloadDesc::new("async", WorkloadClass::AsyncCompute),
        ];
        let mut table = WorkloadTable::new(&mut backend, &descs).unwrap();
        let ops = run(&mut backend, &mut table, false);

        assert!(ops
            .iter()
            .all(|op| !matches!(op, StubOp::Work { name, .. } if name == "async")));
        assert_eq!(table.workloads[1].last_updated_frame, None);
    }
}
