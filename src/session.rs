use crate::cell_buffer::CellBuffer;
use crate::instruction::{Instruction, InstructionQueue};
use crate::subcirc_list::SubcircList;
use crate::{CircuitId, Cookie, Direction, Error, SessionId, SubcircId, SPLIT_COOKIE_LEN};
use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubcircState {
    /// Waiting for a fresh cookie to become valid.
    PendingCookie,
    /// Waiting for the merge point to confirm the join.
    PendingJoin,
    /// Fully registered member of the session.
    Added,
}

impl fmt::Display for SubcircState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubcircState::PendingCookie => "PENDING_COOKIE".fmt(f),
            SubcircState::PendingJoin => "PENDING_JOIN".fmt(f),
            SubcircState::Added => "ADDED".fmt(f),
        }
    }
}

/// One entry-side leg of a split circuit.
#[derive(Debug)]
pub(crate) struct Subcircuit {
    pub(crate) id: SubcircId,
    pub(crate) state: SubcircState,
    pub(crate) circuit: CircuitId,
    pub(crate) buffer: CellBuffer,
}

impl Subcircuit {
    pub(crate) fn new(state: SubcircState, circuit: CircuitId) -> Self {
        Self {
            id: SubcircId::BASE,
            state,
            circuit,
            buffer: CellBuffer::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CookieState {
    /// Cookie must not be used.
    Invalid,
    /// SET_COOKIE sent, waiting for COOKIE_SET.
    Pending,
    /// Cookie is installed at the merge point.
    Valid,
}

/// Joint client/middle state of one split circuit: the cookie, the
/// sub-circuit registry and the per-direction instruction pipeline.
#[derive(Debug)]
pub(crate) struct Session {
    pub(crate) id: SessionId,
    pub(crate) base: CircuitId,
    pub(crate) cookie: Cookie,
    pub(crate) cookie_state: CookieState,
    pub(crate) subcircs: SubcircList<Subcircuit>,
    instructions_in: InstructionQueue,
    instructions_out: InstructionQueue,
    next_sc_in: Option<SubcircId>,
    next_sc_out: Option<SubcircId>,
    finished_in: usize,
    finished_out: usize,
    pub(crate) marked_for_close: bool,
}

impl Session {
    pub(crate) fn new(id: SessionId, base: CircuitId) -> Self {
        Self {
            id,
            base,
            cookie: Cookie::new([0; SPLIT_COOKIE_LEN]),
            cookie_state: CookieState::Invalid,
            subcircs: SubcircList::new(),
            instructions_in: InstructionQueue::default(),
            instructions_out: InstructionQueue::default(),
            next_sc_in: None,
            next_sc_out: None,
            finished_in: 0,
            finished_out: 0,
            marked_for_close: false,
        }
    }

    pub(crate) fn num_added(&self) -> usize {
        self.subcircs.len()
    }

    pub(crate) fn instructions_len(&self, direction: Direction) -> usize {
        match direction {
            Direction::Inbound => self.instructions_in.len(),
            Direction::Outbound => self.instructions_out.len(),
        }
    }

    pub(crate) fn instructions_full(&self, direction: Direction) -> bool {
        match direction {
            Direction::Inbound => self.instructions_in.is_full(),
            Direction::Outbound => self.instructions_out.is_full(),
        }
    }

    pub(crate) fn push_instruction(
        &mut self,
        direction: Direction,
        instruction: Instruction,
    ) -> Result<(), Error> {
        match direction {
            Direction::Inbound => self.instructions_in.push(instruction),
            Direction::Outbound => self.instructions_out.push(instruction),
        }
    }

    /// The sub-circuit to use next in `direction`.
    ///
    /// Returns the same pick until [`Session::used_subcirc`] commits it;
    /// only then is the next ID consumed from the instruction pipeline. A
    /// session that is marked for close keeps answering with the base
    /// sub-circuit (while it exists) so last-gasp probes can still go out.
    pub(crate) fn next_subcirc(&mut self, direction: Direction) -> Result<SubcircId, Error> {
        if self.marked_for_close {
            return self
                .subcircs
                .get(SubcircId::BASE)
                .map(|sub| sub.id)
                .ok_or(Error::SessionClosing);
        }

        let (next, queue, finished) = match direction {
            Direction::Inbound => (
                &mut self.next_sc_in,
                &mut self.instructions_in,
                &mut self.finished_in,
            ),
            Direction::Outbound => (
                &mut self.next_sc_out,
                &mut self.instructions_out,
                &mut self.finished_out,
            ),
        };

        if let Some(id) = *next {
            return Ok(id);
        }

        let (id, drained) = queue.next_id().ok_or(Error::NoActiveInstruction)?;
        if drained {
            *finished += 1;
        }
        *next = Some(id);

        if !self.subcircs.contains(id) {
            return Err(Error::Protocol(
                "instruction references an unknown sub-circuit",
            ));
        }

        Ok(id)
    }

    /// Commit the pick returned by [`Session::next_subcirc`].
    pub(crate) fn used_subcirc(&mut self, direction: Direction) {
        match direction {
            Direction::Inbound => self.next_sc_in = None,
            Direction::Outbound => self.next_sc_out = None,
        }
    }

    pub(crate) fn reset_next_subcirc(&mut self) {
        self.next_sc_in = None;
        self.next_sc_out = None;
    }

    /// Number of instructions fully drained in `direction` since the last
    /// call; the client replenishes one instruction per drained one.
    pub(crate) fn take_finished(&mut self, direction: Direction) -> usize {
        let finished = match direction {
            Direction::Inbound => &mut self.finished_in,
            Direction::Outbound => &mut self.finished_out,
        };

        std::mem::take(finished)
    }

    /// Register `subcirc` as a full member under `id`.
    pub(crate) fn insert_added(
        &mut self,
        mut subcirc: Subcircuit,
        id: SubcircId,
    ) -> Result<(), Error> {
        subcirc.id = id;
        subcirc.state = SubcircState::Added;
        self.subcircs.add(id, subcirc)?;
        self.reset_next_subcirc();

        Ok(())
    }

    /// Remove the member at `id`, resetting the sticky picks.
    pub(crate) fn remove_added(&mut self, id: SubcircId) -> Option<Subcircuit> {
        let removed = self.subcircs.remove(id)?;
        self.reset_next_subcirc();

        Some(removed)
    }

    pub(crate) fn subcirc_by_circuit(&self, circuit: CircuitId) -> Option<SubcircId> {
        self.subcircs
            .iter()
            .find(|(_, sub)| sub.circuit == circuit)
            .map(|(id, _)| id)
    }

    /// Idempotently flip the close marker; true on the first call.
    pub(crate) fn mark_for_close(&mut self) -> bool {
        if self.marked_for_close {
            return false;
        }

        self.marked_for_close = true;

        true
    }
}
