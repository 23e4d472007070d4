//! # Scheduler
//!
//! The fixed-capacity thread table and the credit-based selection pass run
//! by each core's context switch.
//!
//! ## Scheduling Algorithm
//!
//! On every context-switch request, independently per core:
//! 1. **Demote**: the outgoing thread, if still Running, becomes Ready.
//!    A thread that suspended or stopped itself keeps that state.
//! 2. **Age**: every live thread gains `credit += priority`, whatever its
//!    state. Each thread's stack guard is checked on the way; a thread whose
//!    guard is gone is stopped.
//! 3. **Select**: the Ready thread with the most credit wins, ties going to
//!    the lowest table slot. The thread the other core is executing is
//!    skipped even if it reads Ready.
//! 4. **Charge**: the winner's credit drops to zero and it becomes Running.
//!
//! With no Ready thread the core idles until the next interrupt.
//!
//! ## Fairness
//!
//! Higher priority never yields a smaller share, and equal priorities
//! alternate exactly. Shares are not strictly proportional to priority:
//! a thread's credit is wiped on selection, so a low-priority thread that
//! waits long enough catches up with a busier one.
//!
//! Suspended threads keep aging. A thread resumed after a long suspension
//! carries a large credit and runs first.

use crate::config::MAX_THREADS;
use crate::thread::{ThreadControlBlock, ThreadState};

// ---------------------------------------------------------------------------
// Thread table
// ---------------------------------------------------------------------------

/// All thread control blocks, shared by both cores and guarded by the
/// kernel's thread-table lock.
pub(crate) struct ThreadTable {
    slots: [Option<ThreadControlBlock>; MAX_THREADS],
}

impl ThreadTable {
    pub(crate) const fn new() -> Self {
        Self {
            slots: [const { None }; MAX_THREADS],
        }
    }

    /// Place `tcb` in the first free slot.
    ///
    /// # Returns
    /// The slot index, or `None` when the table is full.
    pub(crate) fn insert(&mut self, tcb: ThreadControlBlock) -> Option<usize> {
        let slot = self.slots.iter().position(Option::is_none)?;
        self.slots[slot] = Some(tcb);
        Some(slot)
    }

    pub(crate) fn remove(&mut self, slot: usize) -> Option<ThreadControlBlock> {
        self.slots.get_mut(slot)?.take()
    }

    pub(crate) fn get(&self, slot: usize) -> Option<&ThreadControlBlock> {
        self.slots.get(slot)?.as_ref()
    }

    pub(crate) fn get_mut(&mut self, slot: usize) -> Option<&mut ThreadControlBlock> {
        self.slots.get_mut(slot)?.as_mut()
    }

    /// Number of occupied slots.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Run one scheduling pass for a core whose outgoing thread is
    /// `outgoing` (`None` when the core was idle). `elsewhere` is the slot
    /// the other core is executing; it is never selected, whatever its
    /// state, since that core is still on its stack.
    ///
    /// # Returns
    /// The slot now Running on this core, or `None` to idle.
    pub(crate) fn schedule(
        &mut self,
        outgoing: Option<usize>,
        elsewhere: Option<usize>,
    ) -> Option<usize> {
        if let Some(tcb) = outgoing.and_then(|slot| self.get_mut(slot)) {
            if tcb.state == ThreadState::Running {
                tcb.state = ThreadState::Ready;
            }
        }

        let mut best: Option<(usize, u32)> = None;
        for (slot, entry) in self.slots.iter_mut().enumerate() {
            let Some(tcb) = entry else { continue };

            tcb.credit = tcb.credit.saturating_add(tcb.priority);

            if tcb.state != ThreadState::Stopped && !tcb.guard_intact() {
                log::warn!("thread in slot {} overflowed its stack; stopping it", slot);
                tcb.state = ThreadState::Stopped;
            }

            if !tcb.is_runnable() || Some(slot) == elsewhere {
                continue;
            }
            match best {
                Some((_, credit)) if tcb.credit <= credit => {}
                _ => best = Some((slot, tcb.credit)),
            }
        }

        let (slot, _) = best?;
        let tcb = self.get_mut(slot)?;
        tcb.credit = 0;
        tcb.state = ThreadState::Running;
        Some(slot)
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tcb(priority: u32) -> ThreadControlBlock {
        let stack = Box::leak(vec![0usize; 64].into_boxed_slice());
        ThreadControlBlock::new(stack, 0x0800_0101, 0, 0x0800_0201, priority).unwrap()
    }

    fn table_with(priorities: &[u32]) -> ThreadTable {
        let mut table = ThreadTable::new();
        for &p in priorities {
            table.insert(tcb(p)).unwrap();
        }
        table
    }

    /// Simulate one core running `passes` scheduling passes; returns how
    /// often each slot was selected.
    fn run(table: &mut ThreadTable, passes: usize) -> Vec<usize> {
        let mut counts = vec![0; MAX_THREADS];
        let mut current = None;
        for _ in 0..passes {
            current = table.schedule(current, None);
            if let Some(slot) = current {
                counts[slot] += 1;
            }
        }
        counts
    }

    #[test]
    fn test_insert_and_remove() {
        let mut table = ThreadTable::new();
        assert_eq!(table.insert(tcb(1)), Some(0));
        assert_eq!(table.insert(tcb(1)), Some(1));
        assert_eq!(table.len(), 2);

        assert!(table.remove(0).is_some());
        assert!(table.get(0).is_none());
        assert_eq!(table.insert(tcb(1)), Some(0));
        assert!(table.remove(MAX_THREADS).is_none());
    }

    #[test]
    fn test_full_table_rejects_insert() {
        let mut table = table_with(&[1; MAX_THREADS]);
        assert!(table.insert(tcb(1)).is_none());
        assert_eq!(table.len(), MAX_THREADS);
    }

    #[test]
    fn test_empty_table_idles() {
        let mut table = ThreadTable::new();
        assert_eq!(table.schedule(None, None), None);
    }

    #[test]
    fn test_selected_thread_is_charged() {
        let mut table = table_with(&[3, 1]);
        assert_eq!(table.schedule(None, None), Some(0));

        let winner = table.get(0).unwrap();
        assert_eq!(winner.state, ThreadState::Running);
        assert_eq!(winner.credit, 0);
        let loser = table.get(1).unwrap();
        assert_eq!(loser.state, ThreadState::Ready);
        assert_eq!(loser.credit, 1);
    }

    #[test]
    fn test_ties_go_to_scan_order() {
        let mut table = table_with(&[2, 2, 2]);
        assert_eq!(table.schedule(None, None), Some(0));
    }

    #[test]
    fn test_equal_priorities_alternate() {
        let mut table = table_with(&[4, 4]);
        let mut current = None;
        let mut picks = Vec::new();
        for _ in 0..6 {
            current = table.schedule(current, None);
            picks.push(current.unwrap());
        }
        assert_eq!(picks, vec![0, 1, 0, 1, 0, 1]);
    }

    #[test]
    fn test_self_suspended_outgoing_keeps_state() {
        let mut table = table_with(&[1, 1]);
        let first = table.schedule(None, None).unwrap();
        table.get_mut(first).unwrap().state = ThreadState::Suspended;

        let next = table.schedule(Some(first), None).unwrap();
        assert_ne!(next, first);
        assert_eq!(table.get(first).unwrap().state, ThreadState::Suspended);
    }

    #[test]
    fn test_suspended_thread_keeps_aging() {
        let mut table = table_with(&[2, 1]);
        table.get_mut(0).unwrap().state = ThreadState::Suspended;

        let mut current = None;
        for _ in 0..10 {
            current = table.schedule(current, None);
            assert_eq!(current, Some(1));
        }
        assert_eq!(table.get(0).unwrap().credit, 20);

        // Once resumed, the banked credit wins immediately.
        table.get_mut(0).unwrap().state = ThreadState::Ready;
        assert_eq!(table.schedule(current, None), Some(0));
    }

    #[test]
    fn test_no_ready_thread_idles_but_ages() {
        let mut table = table_with(&[5]);
        table.get_mut(0).unwrap().state = ThreadState::Stopped;
        assert_eq!(table.schedule(None, None), None);
        assert_eq!(table.get(0).unwrap().credit, 5);
    }

    #[test]
    fn test_overflowed_thread_is_stopped() {
        let stack = Box::leak(vec![0usize; 64].into_boxed_slice());
        let base = stack.as_mut_ptr();
        let mut table = ThreadTable::new();
        table
            .insert(ThreadControlBlock::new(stack, 0x0800_0101, 0, 0x0800_0201, 9).unwrap())
            .unwrap();
        table.insert(tcb(1)).unwrap();

        unsafe { base.write_volatile(0x1234) };
        assert_eq!(table.schedule(None, None), Some(1));
        assert_eq!(table.get(0).unwrap().state, ThreadState::Stopped);
    }

    #[test]
    fn test_thread_on_other_core_is_skipped() {
        let mut table = table_with(&[8, 1]);
        assert_eq!(table.schedule(None, Some(0)), Some(1));
        assert_eq!(table.get(0).unwrap().state, ThreadState::Ready);

        // Only candidate is busy elsewhere: idle rather than share a stack.
        let mut table = table_with(&[1]);
        assert_eq!(table.schedule(None, Some(0)), None);
        assert_eq!(table.get(0).unwrap().credit, 1);
    }

    #[test]
    fn test_higher_priority_gets_more_turns() {
        let mut table = table_with(&[1, 3]);
        let counts = run(&mut table, 300);
        assert!(counts[1] > counts[0]);
        assert!(counts[0] > 0);
    }

    proptest! {
        #[test]
        fn prop_aging_touches_every_live_thread(
            priorities in prop::collection::vec(1u32..=32, 1..MAX_THREADS),
            stopped in prop::collection::vec(any::<bool>(), MAX_THREADS),
        ) {
            let mut table = table_with(&priorities);
            for (slot, &stop) in stopped.iter().enumerate().take(priorities.len()) {
                if stop {
                    table.get_mut(slot).unwrap().state = ThreadState::Stopped;
                }
            }

            let chosen = table.schedule(None, None);
            for (slot, &p) in priorities.iter().enumerate() {
                let tcb = table.get(slot).unwrap();
                if Some(slot) == chosen {
                    prop_assert_eq!(tcb.credit, 0);
                } else {
                    prop_assert_eq!(tcb.credit, p);
                }
            }
        }

        #[test]
        fn prop_selection_has_maximal_credit(
            priorities in prop::collection::vec(1u32..=32, 1..MAX_THREADS),
            passes in 1usize..50,
        ) {
            let mut table = table_with(&priorities);
            let mut current = None;
            for _ in 0..passes {
                // Credits after aging, before the pass charges the winner.
                let aged: Vec<u32> = (0..priorities.len())
                    .map(|slot| {
                        let tcb = table.get(slot).unwrap();
                        tcb.credit + tcb.priority
                    })
                    .collect();
                current = table.schedule(current, None);
                let winner = current.unwrap();
                let best = *aged.iter().max().unwrap();
                prop_assert_eq!(aged[winner], best);
                prop_assert_eq!(aged.iter().position(|&c| c == best), Some(winner));
            }
        }

        #[test]
        fn prop_share_is_monotone_in_priority(low in 1u32..=16, extra in 0u32..=16) {
            let high = low + extra;
            let mut table = table_with(&[low, high]);
            let counts = run(&mut table, 400);
            prop_assert!(counts[1] + 1 >= counts[0]);
            prop_assert_eq!(counts[0] + counts[1], 400);
        }
    }
}
