use crate::cell::{Cell, CellCommand};
use crate::instruction::Instruction;
use crate::scheduler;
use crate::session::{CookieState, Session, SubcircState, Subcircuit};
use crate::wire::{self, RelayCommand};
use crate::{
    cell_buffer, CircuitId, CircuitPurpose, CircuitState, CloseReason, Cookie, Direction, Error,
    SessionId, SubcircId, MAX_SUBCIRCS,
};
use std::collections::{HashMap, VecDeque};

/// What the circuit layer tells us about a circuit when it first shows up
/// in the split handshake.
#[derive(Debug, Clone, Copy)]
pub struct CircuitInfo {
    pub purpose: CircuitPurpose,
    pub state: CircuitState,
    pub marked_for_close: bool,
    /// Restricted-lifetime cells the circuit may still forward; the session
    /// inherits this budget from its base circuit.
    pub remaining_relay_early: u32,
}

/// The commands returned from a [`Middle`].
///
/// The [`Middle`] itself is sans-IO: the caller is responsible for causing
/// the side effects described by these commands.
#[derive(Debug)]
pub enum Command {
    /// Send a signalling cell towards the client on `circuit`.
    SendControlCell {
        circuit: CircuitId,
        command: RelayCommand,
        payload: Vec<u8>,
    },
    /// Put `cell` on `circuit`'s queue in `direction`.
    ForwardCell {
        circuit: CircuitId,
        direction: Direction,
        cell: Cell,
    },
    /// Ask the circuit layer to close `circuit`.
    MarkForClose {
        circuit: CircuitId,
        reason: CloseReason,
    },
    /// Buffered reorder bytes exceed the configured limit; the caller
    /// should run its OOM handler.
    MemoryPressure { buffered_bytes: usize },
}

#[derive(Debug)]
struct MiddleSession {
    session: Session,
    remaining_relay_early: u32,
}

/// Merge-point side of the traffic splitting protocol.
///
/// Responds to the cookie/join handshake, keeps the cookie index, queues
/// the client's split instructions and redistributes cells between the
/// sub-circuits and the base circuit's onward hop.
#[derive(Debug)]
pub struct Middle {
    sessions: HashMap<SessionId, MiddleSession>,
    /// Cookie index; holds exactly the cookies in the VALID state.
    sessions_by_cookie: HashMap<Cookie, SessionId>,
    members: HashMap<CircuitId, (SessionId, SubcircId)>,

    pending_commands: VecDeque<Command>,
    next_session_id: SessionId,

    max_buffered_bytes: usize,
}

impl Middle {
    pub fn new(max_buffered_bytes: usize) -> Self {
        Self {
            sessions: Default::default(),
            sessions_by_cookie: Default::default(),
            members: Default::default(),
            pending_commands: Default::default(),
            next_session_id: SessionId::default(),
            max_buffered_bytes,
        }
    }

    /// Return the next command to be executed.
    pub fn next_command(&mut self) -> Option<Command> {
        self.pending_commands.pop_front()
    }

    pub fn num_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn num_indexed_cookies(&self) -> usize {
        self.sessions_by_cookie.len()
    }

    /// Process a split signalling cell that arrived on `circuit`.
    ///
    /// `info` describes the circuit as the circuit layer sees it right now.
    pub fn process_relay_cell(
        &mut self,
        circuit: CircuitId,
        info: &CircuitInfo,
        command: RelayCommand,
        payload: &[u8],
    ) -> Result<(), Error> {
        match command {
            RelayCommand::SetCookie => self.handle_set_cookie(circuit, info, payload),
            RelayCommand::Join => self.handle_join(circuit, payload),
            RelayCommand::Instruction => {
                self.handle_instruction(circuit, payload, Direction::Inbound)
            }
            RelayCommand::Info => self.handle_instruction(circuit, payload, Direction::Outbound),
            RelayCommand::CookieSet | RelayCommand::Joined => {
                tracing::info!(
                    "Relay cell {command:?} was received at the wrong node type. Dropping..."
                );
                Ok(())
            }
        }
    }

    fn handle_set_cookie(
        &mut self,
        circuit: CircuitId,
        info: &CircuitInfo,
        payload: &[u8],
    ) -> Result<(), Error> {
        let cookie = match wire::parse_cookie(payload) {
            Ok(cookie) => cookie,
            Err(e) => {
                tracing::warn!("Received SET_COOKIE cell on {circuit} with wrong length. Closing...");
                self.close(circuit, CloseReason::Protocol);
                return Err(e);
            }
        };

        tracing::info!("Received SET_COOKIE cell on {circuit} with {cookie:?}");

        let (session_id, subcirc_id) = match self.members.get(&circuit) {
            Some((session_id, subcirc_id)) => (*session_id, *subcirc_id),
            None => {
                if let Err(reason) = suitable_for_split(info) {
                    tracing::warn!(
                        "{circuit} not suited as split circuit ({reason}). Notifying client..."
                    );
                    self.send_control(circuit, RelayCommand::CookieSet, wire::ack_payload(None));
                    return Ok(());
                }

                let session_id = self.next_session_id.next();
                let mut session = Session::new(session_id, circuit);

                let subcirc_id = SubcircId::BASE;
                session.insert_added(
                    Subcircuit::new(SubcircState::Added, circuit),
                    subcirc_id,
                )?;

                tracing::info!("Added {circuit} with index {subcirc_id} to {session_id}");

                self.sessions.insert(
                    session_id,
                    MiddleSession {
                        session,
                        remaining_relay_early: info.remaining_relay_early,
                    },
                );
                self.members.insert(circuit, (session_id, subcirc_id));

                (session_id, subcirc_id)
            }
        };

        self.install_cookie(session_id, cookie);
        self.send_control(
            circuit,
            RelayCommand::CookieSet,
            wire::ack_payload(Some(subcirc_id)),
        );

        Ok(())
    }

    /// Make `cookie` the one valid cookie of `session_id`.
    ///
    /// The session's previous cookie leaves the index first; if a different
    /// session held the new value, that session's cookie becomes invalid.
    fn install_cookie(&mut self, session_id: SessionId, cookie: Cookie) {
        if let Some(entry) = self.sessions.get_mut(&session_id) {
            if entry.session.cookie_state == CookieState::Valid {
                self.sessions_by_cookie.remove(&entry.session.cookie);
            }

            entry.session.cookie = cookie;
            entry.session.cookie_state = CookieState::Valid;
        }

        if let Some(loser) = self.sessions_by_cookie.insert(cookie, session_id) {
            if loser != session_id {
                tracing::info!("{cookie:?} collided; invalidating the cookie of {loser}");

                if let Some(entry) = self.sessions.get_mut(&loser) {
                    entry.session.cookie_state = CookieState::Invalid;
                }
            }
        }
    }

    fn handle_join(&mut self, circuit: CircuitId, payload: &[u8]) -> Result<(), Error> {
        if let Some((session_id, subcirc_id)) = self.members.get(&circuit) {
            tracing::info!(
                "Received JOIN cell on {circuit} which was already added to {session_id} \
                 with ID {subcirc_id}. Dropping..."
            );
            return Ok(());
        }

        let cookie = match wire::parse_cookie(payload) {
            Ok(cookie) => cookie,
            Err(e) => {
                tracing::warn!("Received JOIN cell on {circuit} with wrong length. Closing...");
                self.close(circuit, CloseReason::Protocol);
                return Err(e);
            }
        };

        tracing::info!("Received JOIN cell on {circuit} with {cookie:?}");

        let Some(session_id) = self.sessions_by_cookie.get(&cookie).copied() else {
            tracing::info!("Requested split cookie wasn't found, might be stale. Notifying client...");
            self.send_control(circuit, RelayCommand::Joined, wire::ack_payload(None));
            return Ok(());
        };

        let Some(entry) = self.sessions.get_mut(&session_id) else {
            debug_assert!(false, "cookie index referenced a freed session");
            self.send_control(circuit, RelayCommand::Joined, wire::ack_payload(None));
            return Ok(());
        };

        // IDs are assigned strictly in join order
        let next_index = entry.session.num_added();
        if next_index >= MAX_SUBCIRCS {
            tracing::warn!("{session_id} already has {MAX_SUBCIRCS} sub-circuits. Notifying client...");
            self.send_control(circuit, RelayCommand::Joined, wire::ack_payload(None));
            return Ok(());
        }

        let subcirc_id = SubcircId::new(next_index as u8);
        if entry.session.subcircs.contains(subcirc_id) {
            // earlier removals left a hole below the count
            tracing::warn!("Index {subcirc_id} of {session_id} is occupied. Notifying client...");
            self.send_control(circuit, RelayCommand::Joined, wire::ack_payload(None));
            return Ok(());
        }

        entry
            .session
            .insert_added(Subcircuit::new(SubcircState::Added, circuit), subcirc_id)?;
        self.members.insert(circuit, (session_id, subcirc_id));

        tracing::info!("Added {circuit} with index {subcirc_id} to {session_id}");

        self.send_control(
            circuit,
            RelayCommand::Joined,
            wire::ack_payload(Some(subcirc_id)),
        );

        Ok(())
    }

    fn handle_instruction(
        &mut self,
        circuit: CircuitId,
        payload: &[u8],
        direction: Direction,
    ) -> Result<(), Error> {
        let Some((session_id, _)) = self.members.get(&circuit).copied() else {
            tracing::warn!("Received instruction cell on unaffiliated {circuit}. Closing...");
            self.close(circuit, CloseReason::Protocol);
            return Err(Error::Protocol("instruction on unaffiliated circuit"));
        };

        let instruction = match Instruction::decode(payload) {
            Ok(instruction) => instruction,
            Err(e) => {
                // client and middle would disagree on scheduling from here on
                tracing::warn!("Cannot parse instruction cell: {e}. Closing...");
                self.close(circuit, CloseReason::Protocol);
                return Err(e);
            }
        };

        let Some(entry) = self.sessions.get_mut(&session_id) else {
            return Err(Error::SessionClosing);
        };

        if !instruction.check(&entry.session.subcircs) {
            tracing::warn!("Instruction references unknown sub-circuit IDs. Closing...");
            self.close(circuit, CloseReason::Protocol);
            return Err(Error::Protocol(
                "instruction references an unknown sub-circuit",
            ));
        }

        if entry.session.instructions_full(direction) {
            // refuse to queue unbounded state for the peer
            tracing::warn!("Too many pending {direction} instructions. Closing...");
            self.close(circuit, CloseReason::Protocol);
            return Err(Error::CapacityExceeded("too many pending instructions"));
        }

        entry.session.push_instruction(direction, instruction)?;

        tracing::info!(
            "Queued new {direction} instruction for {session_id} via {circuit} ({} pending)",
            entry.session.instructions_len(direction)
        );

        // the new instruction may release buffered cells
        self.drain_session(session_id);

        Ok(())
    }

    /// A cell from the client side arrived on a sub-circuit, travelling
    /// towards the exit.
    pub fn handle_cell_from_client(
        &mut self,
        circuit: CircuitId,
        cell: &Cell,
        now: u32,
    ) -> Result<(), Error> {
        let Some((session_id, subcirc_id)) = self.members.get(&circuit).copied() else {
            // not part of a split circuit, pass through unchanged
            self.pending_commands.push_back(Command::ForwardCell {
                circuit,
                direction: Direction::Outbound,
                cell: cell.clone(),
            });
            return Ok(());
        };

        self.check_pressure();

        let Some(entry) = self.sessions.get_mut(&session_id) else {
            return Err(Error::SessionClosing);
        };

        scheduler::buffer_cell(&mut entry.session, subcirc_id, cell, Direction::Outbound, now)?;
        self.drain_session(session_id);

        Ok(())
    }

    /// A cell from the exit side arrived on the base circuit, travelling
    /// towards the client.
    pub fn handle_cell_from_exit(
        &mut self,
        circuit: CircuitId,
        cell: &Cell,
        now: u32,
    ) -> Result<(), Error> {
        let Some((session_id, subcirc_id)) = self.members.get(&circuit).copied() else {
            self.pending_commands.push_back(Command::ForwardCell {
                circuit,
                direction: Direction::Inbound,
                cell: cell.clone(),
            });
            return Ok(());
        };

        if subcirc_id != SubcircId::BASE {
            // only the base extends beyond the merge point
            tracing::warn!("Inbound cell arrived on non-base sub-circuit {subcirc_id}. Closing...");
            self.close(circuit, CloseReason::Protocol);
            return Err(Error::Protocol("inbound cell on non-base sub-circuit"));
        }

        self.check_pressure();

        let Some(entry) = self.sessions.get_mut(&session_id) else {
            return Err(Error::SessionClosing);
        };

        scheduler::buffer_cell(&mut entry.session, subcirc_id, cell, Direction::Inbound, now)?;
        self.drain_session(session_id);

        Ok(())
    }

    /// Re-examine buffered cells of the session `circuit` belongs to.
    pub fn handle_buffered_cells(&mut self, circuit: CircuitId) {
        if let Some((session_id, _)) = self.members.get(&circuit).copied() {
            self.drain_session(session_id);
        }
    }

    /// Forward every buffered cell the active instructions allow.
    fn drain_session(&mut self, session_id: SessionId) {
        let Some(entry) = self.sessions.get_mut(&session_id) else {
            return;
        };
        let base = entry.session.base;

        // outbound: merge sub-circuit arrivals onto the base's onward hop
        let mut merged = Vec::new();
        if let Err(e) = scheduler::merge(&mut entry.session, Direction::Outbound, &mut merged) {
            tracing::warn!("Failed to merge outbound cells of {session_id}: {e}. Closing...");
            self.close(base, CloseReason::Protocol);
            return;
        }

        for mut cell in merged {
            if cell.command() == CellCommand::RelayEarly {
                if entry.remaining_relay_early > 0 {
                    entry.remaining_relay_early -= 1;
                } else {
                    cell.demote();
                }
            }

            self.pending_commands.push_back(Command::ForwardCell {
                circuit: base,
                direction: Direction::Outbound,
                cell,
            });
        }

        // inbound: distribute base arrivals across the sub-circuits
        let mut forwards = Vec::new();
        if let Err(e) = scheduler::distribute(&mut entry.session, Direction::Inbound, &mut forwards)
        {
            tracing::warn!("Failed to distribute inbound cells of {session_id}: {e}. Closing...");
            self.close(base, CloseReason::Protocol);
            return;
        }

        for forward in forwards {
            self.pending_commands.push_back(Command::ForwardCell {
                circuit: forward.circuit,
                direction: Direction::Inbound,
                cell: forward.cell,
            });
        }
    }

    /// The circuit layer is closing `circuit`.
    ///
    /// Closing the base tears down the whole session; losing any other
    /// sub-circuit never cascades to its siblings.
    pub fn mark_for_close(&mut self, circuit: CircuitId, reason: CloseReason) {
        let Some((session_id, subcirc_id)) = self.members.get(&circuit).copied() else {
            return;
        };

        if subcirc_id != SubcircId::BASE {
            return;
        }

        self.mark_session_for_close(session_id, circuit, reason);
    }

    fn mark_session_for_close(
        &mut self,
        session_id: SessionId,
        cause: CircuitId,
        reason: CloseReason,
    ) {
        let Some(entry) = self.sessions.get_mut(&session_id) else {
            return;
        };

        if !entry.session.mark_for_close() {
            return;
        }

        tracing::info!("Marked {session_id} for close");

        let members = entry
            .session
            .subcircs
            .iter()
            .map(|(_, sub)| sub.circuit)
            .filter(|c| *c != cause)
            .collect::<Vec<_>>();

        for circuit in members {
            self.pending_commands
                .push_back(Command::MarkForClose { circuit, reason });
        }
    }

    /// `circuit` has been freed by the circuit layer; drop its membership.
    ///
    /// Frees the session once its last sub-circuit is gone, removing the
    /// cookie index entry with it.
    pub fn remove_subcirc(&mut self, circuit: CircuitId) {
        let Some((session_id, subcirc_id)) = self.members.remove(&circuit) else {
            return;
        };

        if subcirc_id == SubcircId::BASE {
            self.mark_session_for_close(session_id, circuit, CloseReason::Internal);
        }

        let Some(entry) = self.sessions.get_mut(&session_id) else {
            return;
        };

        entry.session.remove_added(subcirc_id);

        tracing::info!("Removed {circuit} (ID {subcirc_id}) from {session_id}");

        if entry.session.num_added() == 0 {
            if entry.session.cookie_state == CookieState::Valid {
                self.sessions_by_cookie.remove(&entry.session.cookie);
            }
            self.sessions.remove(&session_id);

            tracing::info!("Freed {session_id}");
        }
    }

    /// Age of the oldest cell buffered for `circuit`, 0 if none.
    pub fn max_buffered_cell_age(&self, circuit: CircuitId, now: u32) -> u32 {
        let Some((session_id, subcirc_id)) = self.members.get(&circuit) else {
            return 0;
        };

        self.sessions
            .get(session_id)
            .and_then(|entry| entry.session.subcircs.get(*subcirc_id))
            .map(|sub| sub.buffer.oldest_age(now))
            .unwrap_or(0)
    }

    /// Free the reorder buffer of a circuit that was marked for close.
    ///
    /// Returns the number of bytes freed.
    pub fn free_buffers(&mut self, circuit: CircuitId) -> usize {
        let Some((session_id, subcirc_id)) = self.members.get(&circuit) else {
            return 0;
        };

        self.sessions
            .get_mut(session_id)
            .and_then(|entry| entry.session.subcircs.get_mut(*subcirc_id))
            .map(|sub| sub.buffer.clear())
            .unwrap_or(0)
    }

    fn check_pressure(&mut self) {
        let buffered_bytes = cell_buffer::total_buffered_bytes();

        if buffered_bytes > self.max_buffered_bytes {
            self.pending_commands
                .push_back(Command::MemoryPressure { buffered_bytes });
        }
    }

    fn send_control(&mut self, circuit: CircuitId, command: RelayCommand, payload: Vec<u8>) {
        self.pending_commands.push_back(Command::SendControlCell {
            circuit,
            command,
            payload,
        });
    }

    fn close(&mut self, circuit: CircuitId, reason: CloseReason) {
        self.pending_commands
            .push_back(Command::MarkForClose { circuit, reason });
    }
}

fn suitable_for_split(info: &CircuitInfo) -> Result<(), &'static str> {
    if info.marked_for_close {
        return Err("marked for close");
    }

    if info.state != CircuitState::Open {
        return Err("not open");
    }

    if info.purpose != CircuitPurpose::Or {
        return Err("wrong purpose");
    }

    Ok(())
}
