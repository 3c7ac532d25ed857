//! Structure to keep track of in-flight operations.
//!
//! [`Slots`] is a fixed-size arena of operation slots, allocated once when the
//! backend is constructed. Nothing on the submission or completion path allocates.
//!
//! - Unused slots are threaded on a singly-linked free list.
//! - Armed slots that have not been handed to the kernel sit on the *submit list*.
//! - Submitted poll-adds sit on the *active list* until their completion arrives.
//!
//! Both pending lists are doubly-linked through the slots themselves, so a slot can
//! be unlinked in O(1) when a watch is disarmed or the backend tears down.
//! A slot is a member of at most one list at any time.
//!
//! Slot 0 is the timer slot. It is never on the free list and never released.
//!
//! The kernel only ever sees a slot through its tag (see [`SlotId::tag`]), which
//! carries the slot's generation. Releasing a slot bumps the generation, so a
//! late completion for a previous occupant of the slot can be told apart and dropped.

use tracing::trace;

use crate::ops::{poll_add::Watch, poll_remove::PollRemove};

const NIL: u32 = u32::MAX;

/// Tag of slot-less poll-removes issued during teardown.
pub(crate) const DETACHED_TAG: u64 = u64::MAX;

/// Handle to a slot. Stale handles (the slot was released since) are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    index: u32,
    generation: u32,
}

impl SlotId {
    pub fn index(&self) -> usize {
        self.index as usize
    }

    /// The opaque `user_data` value carried through the kernel.
    pub(crate) fn tag(&self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    fn from_tag(tag: u64) -> SlotId {
        SlotId {
            index: (tag & 0xffff_ffff) as u32,
            generation: (tag >> 32) as u32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Vacant,
    Timer,
    PollAdd(Watch),
    PollRemove(PollRemove),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    Free,
    /// Populated, not yet handed to the kernel.
    Armed,
    /// Handed to the kernel, completion outstanding.
    Submitted,
    /// Its completion is being dispatched right now.
    Completing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Member {
    Nothing,
    FreeList,
    SubmitList,
    ActiveList,
}

struct Entry {
    op: Op,
    state: SlotState,
    generation: u32,
    member: Member,
    prev: u32,
    next: u32,
}

struct List {
    head: u32,
    tail: u32,
    len: usize,
}

impl List {
    const fn new() -> Self {
        List {
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }
}

pub(crate) enum Resolved {
    Live(SlotId),
    Stale(SlotId),
    Detached,
}

pub(crate) struct Slots {
    entries: Box<[Entry]>,
    free_head: u32,
    free_len: usize,
    in_use: usize,
    submit_list: List,
    active_list: List,
}

impl Slots {
    pub(crate) const TIMER: SlotId = SlotId {
        index: 0,
        generation: 0,
    };

    pub(crate) fn new(total: usize) -> Self {
        assert!(total >= 2, "need at least the timer slot and one operation slot");
        assert!(total < NIL as usize);
        let entries = (0..total)
            .map(|i| Entry {
                op: if i == 0 { Op::Timer } else { Op::Vacant },
                state: if i == 0 {
                    SlotState::Armed
                } else {
                    SlotState::Free
                },
                generation: 0,
                member: Member::Nothing,
                prev: NIL,
                next: NIL,
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let mut slots = Slots {
            entries,
            free_head: NIL,
            free_len: 0,
            in_use: 0,
            submit_list: List::new(),
            active_list: List::new(),
        };
        // pushed in reverse so that allocation hands out 1, 2, 3, ...
        for idx in (1..total as u32).rev() {
            slots.push_free(idx);
        }
        slots
    }

    pub(crate) fn total(&self) -> usize {
        self.entries.len()
    }

    /// Slots currently owned by an operation, excluding the timer slot.
    pub(crate) fn in_use(&self) -> usize {
        self.in_use
    }

    pub(crate) fn free_len(&self) -> usize {
        self.free_len
    }

    pub(crate) fn submit_len(&self) -> usize {
        self.submit_list.len
    }

    pub(crate) fn active_len(&self) -> usize {
        self.active_list.len
    }

    /// Pop a slot off the free list and populate it. `None` when the pool is exhausted.
    pub(crate) fn allocate(&mut self, op: Op) -> Option<SlotId> {
        assert!(!matches!(op, Op::Vacant | Op::Timer));
        let idx = self.free_head;
        if idx == NIL {
            return None;
        }
        let entry = &mut self.entries[idx as usize];
        debug_assert_eq!(entry.member, Member::FreeList);
        debug_assert_eq!(entry.state, SlotState::Free);
        self.free_head = entry.next;
        entry.next = NIL;
        entry.member = Member::Nothing;
        entry.op = op;
        entry.state = SlotState::Armed;
        self.free_len -= 1;
        self.in_use += 1;
        let id = SlotId {
            index: idx,
            generation: entry.generation,
        };
        trace!(slot = idx, in_use = self.in_use, "allocated slot");
        Some(id)
    }

    /// Return a slot to the free list, handing back what it held.
    ///
    /// The caller guarantees the kernel no longer references the slot's tag.
    pub(crate) fn release(&mut self, id: SlotId) -> Op {
        assert_ne!(id.index, Self::TIMER.index, "the timer slot is never released");
        if !self.is_current(id) {
            panic!(
                "implementation error: double release of slot {} (generation {})",
                id.index, id.generation
            );
        }
        let entry = &mut self.entries[id.index as usize];
        if entry.member != Member::Nothing {
            panic!(
                "implementation error: slot {} released while still linked",
                id.index
            );
        }
        let op = std::mem::replace(&mut entry.op, Op::Vacant);
        entry.state = SlotState::Free;
        entry.generation = entry.generation.wrapping_add(1);
        self.in_use -= 1;
        self.push_free(id.index);
        trace!(slot = id.index, in_use = self.in_use, "released slot");
        op
    }

    fn push_free(&mut self, idx: u32) {
        let entry = &mut self.entries[idx as usize];
        entry.member = Member::FreeList;
        entry.prev = NIL;
        entry.next = self.free_head;
        self.free_head = idx;
        self.free_len += 1;
    }

    /// Whether `id` still names the slot's current occupant.
    pub(crate) fn is_current(&self, id: SlotId) -> bool {
        match self.entries.get(id.index as usize) {
            Some(entry) => entry.generation == id.generation && entry.state != SlotState::Free,
            None => false,
        }
    }

    pub(crate) fn resolve(&self, tag: u64) -> Resolved {
        if tag == DETACHED_TAG {
            return Resolved::Detached;
        }
        let id = SlotId::from_tag(tag);
        if self.is_current(id) {
            Resolved::Live(id)
        } else {
            Resolved::Stale(id)
        }
    }

    pub(crate) fn op(&self, id: SlotId) -> Op {
        debug_assert!(self.is_current(id));
        self.entries[id.index as usize].op
    }

    pub(crate) fn state(&self, id: SlotId) -> SlotState {
        self.entries[id.index as usize].state
    }

    pub(crate) fn set_state(&mut self, id: SlotId, state: SlotState) {
        debug_assert!(self.is_current(id));
        self.entries[id.index as usize].state = state;
    }

    /// Drop what an armed slot holds without releasing it, so the release
    /// doesn't undo side effects that never happened.
    pub(crate) fn clear_op(&mut self, id: SlotId) {
        self.entries[id.index as usize].op = Op::Vacant;
    }

    pub(crate) fn push_submit(&mut self, id: SlotId) {
        self.link_back(id, Member::SubmitList);
    }

    pub(crate) fn pop_submit(&mut self) -> Option<SlotId> {
        self.pop_front(Member::SubmitList)
    }

    pub(crate) fn push_active(&mut self, id: SlotId) {
        self.link_back(id, Member::ActiveList);
    }

    pub(crate) fn pop_active(&mut self) -> Option<SlotId> {
        self.pop_front(Member::ActiveList)
    }

    pub(crate) fn is_on_submit_list(&self, id: SlotId) -> bool {
        self.entries[id.index as usize].member == Member::SubmitList
    }

    fn list_mut(&mut self, which: Member) -> &mut List {
        match which {
            Member::SubmitList => &mut self.submit_list,
            Member::ActiveList => &mut self.active_list,
            Member::FreeList | Member::Nothing => unreachable!("not a doubly-linked list"),
        }
    }

    fn link_back(&mut self, id: SlotId, which: Member) {
        assert_eq!(
            self.entries[id.index as usize].member,
            Member::Nothing,
            "implementation error: slot {} linked twice",
            id.index
        );
        let list = self.list_mut(which);
        let old_tail = list.tail;
        list.tail = id.index;
        if old_tail == NIL {
            list.head = id.index;
        }
        list.len += 1;
        if old_tail != NIL {
            self.entries[old_tail as usize].next = id.index;
        }
        let entry = &mut self.entries[id.index as usize];
        entry.member = which;
        entry.prev = old_tail;
        entry.next = NIL;
    }

    fn pop_front(&mut self, which: Member) -> Option<SlotId> {
        let head = self.list_mut(which).head;
        if head == NIL {
            return None;
        }
        let id = SlotId {
            index: head,
            generation: self.entries[head as usize].generation,
        };
        self.unlink(id);
        Some(id)
    }

    /// Remove a slot from whichever pending list it is on. O(1).
    pub(crate) fn unlink(&mut self, id: SlotId) {
        let (which, prev, next) = {
            let entry = &self.entries[id.index as usize];
            (entry.member, entry.prev, entry.next)
        };
        assert!(
            matches!(which, Member::SubmitList | Member::ActiveList),
            "implementation error: slot {} is not on a pending list",
            id.index
        );
        if prev != NIL {
            self.entries[prev as usize].next = next;
        }
        if next != NIL {
            self.entries[next as usize].prev = prev;
        }
        let list = self.list_mut(which);
        if list.head == id.index {
            list.head = next;
        }
        if list.tail == id.index {
            list.tail = prev;
        }
        list.len -= 1;
        let entry = &mut self.entries[id.index as usize];
        entry.member = Member::Nothing;
        entry.prev = NIL;
        entry.next = NIL;
    }

    /// Slots whose completion was consumed but never finished dispatching.
    /// Only non-empty after a handler unwound.
    pub(crate) fn completing(&self) -> Vec<SlotId> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.state == SlotState::Completing)
            .map(|(index, entry)| SlotId {
                index: index as u32,
                generation: entry.generation,
            })
            .collect()
    }

    pub(crate) fn debug_dump(&self) -> SlotsDump {
        let mut dump = SlotsDump::default();
        for entry in self.entries.iter().skip(1) {
            match entry.state {
                SlotState::Free => dump.free += 1,
                SlotState::Armed => dump.armed += 1,
                SlotState::Submitted => dump.submitted += 1,
                SlotState::Completing => dump.completing += 1,
            }
        }
        dump
    }
}

/// Per-state slot counts, for logging.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotsDump {
    pub(crate) free: usize,
    pub(crate) armed: usize,
    pub(crate) submitted: usize,
    pub(crate) completing: usize,
}
