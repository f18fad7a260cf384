use crate::cell::Cell;
use crate::path::{Fingerprint, HopInfo, PathHop};
use crate::scheduler;
use crate::session::{CookieState, Session, SubcircState, Subcircuit};
use crate::strategy::{self, Strategy, WeightCache};
use crate::wire::{self, RelayCommand};
use crate::{
    cell_buffer, CircuitId, CircuitPurpose, CircuitState, CloseReason, Cookie, Direction, Error,
    SessionId, SplitConfig, SubcircId, MAX_SUBCIRCS, NUM_SPLIT_INSTRUCTIONS,
};
use rand::rngs::ThreadRng;
use rand::Rng;
use std::collections::{HashMap, VecDeque};

/// Join circuits are built with route length 2: entry guard, then the merge
/// point. The JOIN cell is addressed to that terminal hop.
const JOIN_CIRCUIT_MIDDLE_HOP: usize = 1;

/// The commands returned from a [`Client`].
///
/// The [`Client`] itself is sans-IO: the caller is responsible for causing
/// the side effects described by these commands.
#[derive(Debug)]
pub enum Command {
    /// Send a signalling cell on `circuit`, addressed to the hop at `layer`.
    SendControlCell {
        circuit: CircuitId,
        layer: usize,
        command: RelayCommand,
        payload: Vec<u8>,
    },
    /// Build a new circuit terminating at `middle` for `session`.
    ///
    /// Report the outcome via [`Client::subcircuit_launched`] or
    /// [`Client::subcircuit_launch_failed`], then
    /// [`Client::join_circuit_opened`] once the circuit reaches the middle.
    LaunchJoinCircuit {
        session: SessionId,
        middle: HopInfo,
    },
    /// Append `hops` to `circuit`'s cryptographic path; the crypto handles
    /// share state with the base circuit's path.
    ExtendPath {
        circuit: CircuitId,
        hops: Vec<PathHop>,
    },
    /// Put `cell` on `circuit`'s queue in `direction`.
    ForwardCell {
        circuit: CircuitId,
        direction: Direction,
        cell: Cell,
    },
    /// Hand `cell` upwards as regular inbound traffic of `circuit`.
    DeliverCell { circuit: CircuitId, cell: Cell },
    /// Every merge point on `circuit` is final; pending streams may attach.
    StreamsAttachable { circuit: CircuitId },
    /// Ask the circuit layer to close `circuit`.
    MarkForClose {
        circuit: CircuitId,
        reason: CloseReason,
    },
    /// Buffered reorder bytes exceed the configured limit; the caller
    /// should run its OOM handler.
    MemoryPressure { buffered_bytes: usize },
}

/// Snapshot of an origin circuit, supplied by the circuit layer when the
/// split is set up.
#[derive(Debug, Clone)]
pub struct BaseCircuit {
    pub id: CircuitId,
    pub purpose: CircuitPurpose,
    pub state: CircuitState,
    pub one_hop: bool,
    pub marked_for_close: bool,
    /// The circuit's path from entry to exit.
    pub hops: Vec<PathHop>,
}

#[derive(Debug)]
struct ClientSession {
    session: Session,
    /// Sub-circuits not yet confirmed by the merge point.
    pending: Vec<Subcircuit>,
    /// Launches deferred until the cookie becomes valid.
    launch_on_cookie: usize,
    /// Launches commanded but not yet reported back by the circuit layer.
    launching: usize,
    middle: HopInfo,
    /// Index of the merge point within the base circuit's path.
    middle_index: usize,
    /// Path between the merge point (exclusive) and the exit (inclusive);
    /// cloned onto every joined sub-circuit.
    remaining_path: Vec<PathHop>,
    /// Every relay on the base circuit, for exclusion during path selection.
    base_path: Vec<Fingerprint>,
    /// Entry-side path of each launched sub-circuit, as reported by the
    /// circuit layer. A new leg must never reuse another leg's entry guard.
    member_paths: HashMap<CircuitId, Vec<Fingerprint>>,
    strategy: Strategy,
    /// Set once the session has enough members for streams to attach.
    is_final: bool,
    weights_in: WeightCache,
    weights_out: WeightCache,
}

impl ClientSession {
    fn num_total(&self) -> usize {
        self.session.num_added() + self.pending.len()
    }

    /// Sub-circuits that exist or will exist once everything in flight
    /// lands.
    fn num_in_flight(&self) -> usize {
        self.pending.len() + self.launch_on_cookie + self.launching
    }

    fn pending_position(&self, circuit: CircuitId) -> Option<usize> {
        self.pending.iter().position(|sub| sub.circuit == circuit)
    }

    fn weights_mut(&mut self, direction: Direction) -> &mut WeightCache {
        match direction {
            Direction::Inbound => &mut self.weights_in,
            Direction::Outbound => &mut self.weights_out,
        }
    }
}

/// Merge points living on one base circuit.
#[derive(Debug, Default)]
struct Envelope {
    /// `(hop index, session)` pairs, ordered entry to exit.
    merge_points: Vec<(usize, SessionId)>,
    /// Sub-circuits currently flow-controlled on their onward channel.
    num_blocked: u32,
}

/// Client side of the traffic splitting protocol.
///
/// Initiates the cookie/join handshake, launches sub-circuits, generates
/// and replenishes split instructions and schedules cells across the
/// sub-circuits of each merge point.
#[derive(Debug)]
pub struct Client<R = ThreadRng> {
    config: SplitConfig,

    sessions: HashMap<SessionId, ClientSession>,
    /// Base circuits carrying at least one merge point.
    envelopes: HashMap<CircuitId, Envelope>,
    /// Join circuits, pending or added, by their session.
    members: HashMap<CircuitId, SessionId>,

    pending_commands: VecDeque<Command>,
    next_session_id: SessionId,

    rng: R,
}

impl Client {
    pub fn new(config: SplitConfig) -> Self {
        Self::with_rng(config, rand::thread_rng())
    }
}

impl<R> Client<R>
where
    R: Rng,
{
    pub fn with_rng(config: SplitConfig, rng: R) -> Self {
        Self {
            config,
            sessions: Default::default(),
            envelopes: Default::default(),
            members: Default::default(),
            pending_commands: Default::default(),
            next_session_id: SessionId::default(),
            rng,
        }
    }

    pub fn config(&self) -> &SplitConfig {
        &self.config
    }

    /// Return the next command to be executed.
    pub fn next_command(&mut self) -> Option<Command> {
        self.pending_commands.pop_front()
    }

    pub fn num_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Launch `n` new sub-circuits for `base`, merging at the hop at
    /// `middle_index`. Turns the circuit into a split circuit first if
    /// necessary.
    pub fn launch_subcircuits(
        &mut self,
        base: &BaseCircuit,
        middle_index: usize,
        n: usize,
    ) -> Result<(), Error> {
        if n == 0 {
            return Ok(());
        }

        check_base_circuit(base)?;
        check_merge_hop(base, middle_index)?;

        // the base itself occupies one of the slots
        if n >= MAX_SUBCIRCS {
            tracing::warn!("Cannot launch {n} sub-circuits at once");
            return Err(Error::CapacityExceeded("too many sub-circuits"));
        }

        let existing = self
            .envelopes
            .get(&base.id)
            .and_then(|env| {
                env.merge_points
                    .iter()
                    .find(|(index, _)| *index == middle_index)
            })
            .map(|(_, session_id)| *session_id);

        let session_id = match existing {
            Some(session_id) => session_id,
            None => self.create_session(base, middle_index)?,
        };

        let Some(entry) = self.sessions.get_mut(&session_id) else {
            return Err(Error::SessionClosing);
        };

        if entry.session.marked_for_close {
            tracing::info!("{session_id} was marked for close, cannot launch new sub-circuits");
            return Err(Error::SessionClosing);
        }

        if entry.num_total() + entry.launch_on_cookie + entry.launching + n > MAX_SUBCIRCS {
            tracing::info!("{session_id} already reached its maximum number of sub-circuits");
            return Err(Error::CapacityExceeded("too many sub-circuits"));
        }

        match entry.session.cookie_state {
            CookieState::Valid => {
                tracing::info!("Launching {n} new sub-circuits of {session_id}");

                entry.launching += n;
                let middle = entry.middle.clone();
                for _ in 0..n {
                    self.pending_commands.push_back(Command::LaunchJoinCircuit {
                        session: session_id,
                        middle: middle.clone(),
                    });
                }
            }
            CookieState::Pending => {
                entry.launch_on_cookie += n;
            }
            CookieState::Invalid => {
                entry.launch_on_cookie += n;
                self.send_new_cookie(session_id);
            }
        }

        Ok(())
    }

    /// Turn `(base, middle_index)` into a merge point by creating a session
    /// and starting the cookie handshake.
    fn create_session(&mut self, base: &BaseCircuit, middle_index: usize) -> Result<SessionId, Error> {
        let remaining_path = base.hops[middle_index + 1..].to_vec();

        if remaining_path.iter().any(|hop| !hop.open) {
            return Err(Error::Protocol("path beyond the merge point is not open"));
        }

        let session_id = self.next_session_id.next();
        let mut session = Session::new(session_id, base.id);
        session.cookie_state = CookieState::Invalid;

        let entry = ClientSession {
            session,
            pending: vec![Subcircuit::new(SubcircState::PendingCookie, base.id)],
            launch_on_cookie: 0,
            launching: 0,
            middle: base.hops[middle_index].info.clone(),
            middle_index,
            remaining_path,
            base_path: base.hops.iter().map(|hop| hop.info.fingerprint).collect(),
            member_paths: HashMap::new(),
            strategy: self.config.strategy,
            is_final: false,
            weights_in: WeightCache::default(),
            weights_out: WeightCache::default(),
        };

        tracing::info!("New split session {session_id} on {} merging at hop {middle_index}", base.id);

        self.sessions.insert(session_id, entry);

        let envelope = self.envelopes.entry(base.id).or_default();
        envelope.merge_points.push((middle_index, session_id));
        envelope.merge_points.sort_unstable_by_key(|(index, _)| *index);

        self.send_new_cookie(session_id);

        Ok(session_id)
    }

    /// Propose a fresh cookie to the merge point.
    ///
    /// Does nothing while an earlier proposal is still in flight.
    fn send_new_cookie(&mut self, session_id: SessionId) {
        let Some(entry) = self.sessions.get_mut(&session_id) else {
            return;
        };

        if entry.session.cookie_state == CookieState::Pending {
            return;
        }

        entry.session.cookie = Cookie::generate(&mut self.rng);
        entry.session.cookie_state = CookieState::Pending;

        tracing::info!(
            "Sending new SET_COOKIE cell on {} with {:?}",
            entry.session.base,
            entry.session.cookie
        );

        let circuit = entry.session.base;
        let layer = entry.middle_index;
        let payload = wire::cookie_payload(&entry.session.cookie);

        self.pending_commands.push_back(Command::SendControlCell {
            circuit,
            layer,
            command: RelayCommand::SetCookie,
            payload,
        });
    }

    /// The circuit layer built `circuit` in response to
    /// [`Command::LaunchJoinCircuit`].
    ///
    /// `path` lists the relays of the freshly built circuit, entry guard
    /// first; they are excluded when further sub-circuits are launched.
    pub fn subcircuit_launched(
        &mut self,
        session_id: SessionId,
        circuit: CircuitId,
        path: &[Fingerprint],
    ) {
        let Some(entry) = self.sessions.get_mut(&session_id) else {
            tracing::debug!("Sub-circuit launched for unknown {session_id}");
            return;
        };

        if entry.session.marked_for_close {
            tracing::info!("{session_id} already marked for close, dropping new sub-circuit");
            self.pending_commands.push_back(Command::MarkForClose {
                circuit,
                reason: CloseReason::Internal,
            });
            return;
        }

        entry.launching = entry.launching.saturating_sub(1);
        entry
            .pending
            .push(Subcircuit::new(SubcircState::PendingJoin, circuit));
        entry.member_paths.insert(circuit, path.to_vec());
        self.members.insert(circuit, session_id);

        tracing::info!("Added {circuit} to the pending sub-circuits of {session_id}");
    }

    /// Launching a sub-circuit failed; give up on this attempt.
    pub fn subcircuit_launch_failed(&mut self, session_id: SessionId) {
        tracing::info!("Launching new split sub-circuit for {session_id} failed");

        if let Some(entry) = self.sessions.get_mut(&session_id) {
            entry.launching = entry.launching.saturating_sub(1);
            self.finalise(session_id);
        }
    }

    /// A launched join circuit reached the merge point; send the JOIN.
    pub fn join_circuit_opened(&mut self, circuit: CircuitId) {
        let Some(session_id) = self.members.get(&circuit).copied() else {
            tracing::debug!("{circuit} opened but belongs to no session");
            return;
        };

        self.send_join(session_id, circuit);
    }

    /// Send JOIN for a pending sub-circuit, or park it until the cookie is
    /// valid again.
    fn send_join(&mut self, session_id: SessionId, circuit: CircuitId) {
        let Some(entry) = self.sessions.get_mut(&session_id) else {
            return;
        };
        let Some(position) = entry.pending_position(circuit) else {
            return;
        };

        match entry.session.cookie_state {
            CookieState::Valid => {
                entry.pending[position].state = SubcircState::PendingJoin;

                tracing::info!(
                    "Sending JOIN cell on {circuit} with {:?}",
                    entry.session.cookie
                );

                let payload = wire::cookie_payload(&entry.session.cookie);
                self.pending_commands.push_back(Command::SendControlCell {
                    circuit,
                    layer: JOIN_CIRCUIT_MIDDLE_HOP,
                    command: RelayCommand::Join,
                    payload,
                });
            }
            CookieState::Pending => {
                tracing::info!("Already setting new cookie for {session_id}");
                entry.pending[position].state = SubcircState::PendingCookie;
            }
            CookieState::Invalid => {
                tracing::info!("Invalid cookie at {session_id}, set new one");
                entry.pending[position].state = SubcircState::PendingCookie;
                self.send_new_cookie(session_id);
            }
        }
    }

    /// Process a split signalling cell that arrived on `circuit` from the
    /// hop at `layer`.
    pub fn process_relay_cell(
        &mut self,
        circuit: CircuitId,
        layer: usize,
        command: RelayCommand,
        payload: &[u8],
    ) -> Result<(), Error> {
        match command {
            RelayCommand::CookieSet => self.handle_cookie_set(circuit, layer, payload),
            RelayCommand::Joined => self.handle_joined(circuit, payload),
            RelayCommand::SetCookie | RelayCommand::Join | RelayCommand::Instruction
            | RelayCommand::Info => {
                tracing::info!(
                    "Relay cell {command:?} was received at the wrong node type. Dropping..."
                );
                Ok(())
            }
        }
    }

    fn handle_cookie_set(
        &mut self,
        circuit: CircuitId,
        layer: usize,
        payload: &[u8],
    ) -> Result<(), Error> {
        let Some(session_id) = self.session_at(circuit, layer) else {
            tracing::info!("Cannot process COOKIE_SET as there is no session. Closing...");
            self.close(circuit, CloseReason::Protocol);
            return Err(Error::Protocol("COOKIE_SET without a session"));
        };

        let ack = match wire::parse_ack(payload) {
            Ok(ack) => ack,
            Err(e) => {
                tracing::warn!("Received COOKIE_SET cell on {circuit} with wrong length. Closing...");
                self.close(circuit, CloseReason::Protocol);
                return Err(e);
            }
        };

        tracing::info!(
            "Received COOKIE_SET {} cell on {circuit}",
            if ack.is_some() { "(success)" } else { "(failure)" }
        );

        let Some(entry) = self.sessions.get_mut(&session_id) else {
            return Err(Error::SessionClosing);
        };

        if entry.session.cookie_state != CookieState::Pending {
            tracing::warn!("Cookie state wasn't \"pending\". Closing...");
            self.close(circuit, CloseReason::Protocol);
            return Err(Error::Protocol("unsolicited COOKIE_SET"));
        }

        match ack {
            Some(id) => {
                let initial = entry
                    .pending_position(circuit)
                    .filter(|i| entry.pending[*i].state == SubcircState::PendingCookie);

                if let Some(position) = initial {
                    // initial handshake; the base becomes sub-circuit 0
                    if id != SubcircId::BASE {
                        tracing::warn!("COOKIE_SET assigned ID {id} to the base circuit. Closing...");
                        self.close(circuit, CloseReason::Protocol);
                        return Err(Error::Protocol("base was not assigned ID 0"));
                    }

                    let subcirc = entry.pending.remove(position);
                    entry.session.insert_added(subcirc, id)?;

                    tracing::info!("Transferring {circuit} to ADDED with index {id}");
                } else {
                    // re-key on an established session
                    match entry.session.subcirc_by_circuit(circuit) {
                        Some(existing) if existing == id => {}
                        _ => {
                            tracing::warn!(
                                "COOKIE_SET cell contains an unexpected sub-circuit ID. Closing..."
                            );
                            self.close(circuit, CloseReason::Protocol);
                            return Err(Error::Protocol("unexpected sub-circuit ID"));
                        }
                    }
                }

                entry.session.cookie_state = CookieState::Valid;

                self.handle_pending_cookie(session_id);
                self.finalise(session_id);
            }
            None => {
                let initial = entry
                    .pending_position(circuit)
                    .filter(|i| entry.pending[*i].state == SubcircState::PendingCookie);

                if let Some(position) = initial {
                    // the merge point refused the very first cookie; the
                    // session never got established
                    entry.pending.remove(position);
                    entry.session.cookie_state = CookieState::Invalid;
                    self.remove_session_if_empty(session_id);
                } else {
                    entry.session.cookie_state = CookieState::Invalid;
                }
            }
        }

        Ok(())
    }

    fn handle_joined(&mut self, circuit: CircuitId, payload: &[u8]) -> Result<(), Error> {
        let Some(session_id) = self.members.get(&circuit).copied() else {
            tracing::info!("Cannot process JOINED as there is no session. Closing...");
            self.close(circuit, CloseReason::Protocol);
            return Err(Error::Protocol("JOINED without a session"));
        };

        let ack = match wire::parse_ack(payload) {
            Ok(ack) => ack,
            Err(e) => {
                tracing::warn!("Received JOINED cell on {circuit} with wrong length. Closing...");
                self.close(circuit, CloseReason::Protocol);
                return Err(e);
            }
        };

        tracing::info!(
            "Received JOINED {} cell on {circuit}",
            if ack.is_some() { "(success)" } else { "(failure)" }
        );

        let Some(entry) = self.sessions.get_mut(&session_id) else {
            return Err(Error::SessionClosing);
        };

        let Some(position) = entry.pending_position(circuit) else {
            tracing::warn!("JOINED for a circuit that is not pending. Closing...");
            self.close(circuit, CloseReason::Protocol);
            return Err(Error::Protocol("unsolicited JOINED"));
        };

        if entry.pending[position].state != SubcircState::PendingJoin {
            tracing::warn!("Sub-circuit state wasn't \"pending join\". Closing...");
            self.close(circuit, CloseReason::Protocol);
            return Err(Error::Protocol("unsolicited JOINED"));
        }

        match ack {
            Some(id) => {
                let base = entry.session.base;
                let hops = entry.remaining_path.clone();
                let subcirc = entry.pending.remove(position);

                if let Err(e) = entry.session.insert_added(subcirc, id) {
                    tracing::warn!("Cannot register sub-circuit under ID {id}: {e}. Closing...");
                    entry.member_paths.remove(&circuit);
                    self.members.remove(&circuit);
                    self.close(circuit, CloseReason::Protocol);
                    return Err(e);
                }

                tracing::info!("Transferring {circuit} to ADDED with index {id}");

                // reproduce the post-middle path so end-to-end cells flow as
                // if the new entry leg had always been there
                self.pending_commands
                    .push_back(Command::ExtendPath { circuit, hops });

                self.finalise(session_id);

                if self.may_attach_stream(base, true) {
                    self.pending_commands
                        .push_back(Command::StreamsAttachable { circuit: base });
                }
            }
            None => {
                // the cookie went stale at the middle; re-key and retry
                tracing::info!("JOIN was refused, cookie is stale. Re-keying...");
                entry.pending[position].state = SubcircState::PendingCookie;
                self.send_new_cookie(session_id);

                return Err(Error::CookieStale);
            }
        }

        Ok(())
    }

    /// The cookie just became valid: launch deferred sub-circuits and send
    /// JOIN for everything that was waiting on it.
    fn handle_pending_cookie(&mut self, session_id: SessionId) {
        let Some(entry) = self.sessions.get_mut(&session_id) else {
            return;
        };

        let to_launch = std::mem::take(&mut entry.launch_on_cookie);
        entry.launching += to_launch;
        let middle = entry.middle.clone();

        let waiting = entry
            .pending
            .iter()
            .filter(|sub| sub.state == SubcircState::PendingCookie)
            .map(|sub| sub.circuit)
            .collect::<Vec<_>>();

        for _ in 0..to_launch {
            self.pending_commands.push_back(Command::LaunchJoinCircuit {
                session: session_id,
                middle: middle.clone(),
            });
        }

        for circuit in waiting {
            self.send_join(session_id, circuit);
        }
    }

    /// Mark the session final once enough sub-circuits are in place, and
    /// pre-emit the first pipeline of instructions for both directions.
    fn finalise(&mut self, session_id: SessionId) {
        let Some(entry) = self.sessions.get_mut(&session_id) else {
            return;
        };

        if entry.is_final || entry.session.marked_for_close {
            return;
        }

        let wanted = self.config.subcircuits_per_circuit();
        if entry.session.num_added() < wanted || entry.num_in_flight() > 0 {
            return;
        }

        tracing::info!("Make {session_id} final");

        // a new page load starts here; both directions draw fresh weights
        entry.weights_in.use_prev = false;
        entry.weights_out.use_prev = false;
        entry.is_final = true;

        for _ in 0..NUM_SPLIT_INSTRUCTIONS {
            self.emit_instruction(session_id, Direction::Inbound);
        }
        for _ in 0..NUM_SPLIT_INSTRUCTIONS {
            self.emit_instruction(session_id, Direction::Outbound);
        }
    }

    /// Generate one instruction for `direction`, queue it locally and send
    /// it to the merge point.
    fn emit_instruction(&mut self, session_id: SessionId, direction: Direction) {
        let Some(entry) = self.sessions.get_mut(&session_id) else {
            return;
        };

        if entry.session.num_added() == 0 || entry.session.marked_for_close {
            return;
        }

        if entry.session.instructions_full(direction) {
            tracing::warn!("We have already created too many {direction} instructions");
            return;
        }

        let cache = match direction {
            Direction::Inbound => &mut entry.weights_in,
            Direction::Outbound => &mut entry.weights_out,
        };
        let instruction =
            strategy::generate(entry.strategy, &entry.session.subcircs, &mut self.rng, cache);

        // every further generation within this page load reuses the draw
        entry.weights_mut(direction).use_prev = true;

        let payload = match instruction.encode() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Cannot encode split instruction: {e}");
                return;
            }
        };

        if entry.session.push_instruction(direction, instruction).is_err() {
            return;
        }

        let command = match direction {
            Direction::Inbound => RelayCommand::Instruction,
            Direction::Outbound => RelayCommand::Info,
        };

        tracing::info!(
            "Sending new {command:?} cell on {} for {session_id}",
            entry.session.base
        );

        let circuit = entry.session.base;
        let layer = entry.middle_index;
        self.pending_commands.push_back(Command::SendControlCell {
            circuit,
            layer,
            command,
            payload,
        });
    }

    /// Emit one replacement instruction per instruction drained since the
    /// last call.
    fn replenish(&mut self, session_id: SessionId) {
        for direction in [Direction::Inbound, Direction::Outbound] {
            let Some(entry) = self.sessions.get_mut(&session_id) else {
                return;
            };

            let drained = entry.session.take_finished(direction);
            for _ in 0..drained {
                tracing::info!(
                    "Used up a {direction} instruction of {session_id}. Generate and send a new one"
                );
                self.emit_instruction(session_id, direction);
            }
        }
    }

    /// True when streams may be attached to `circuit`.
    ///
    /// Join circuits never carry streams. With `must_be_open`, every merge
    /// point on the circuit must report final.
    pub fn may_attach_stream(&mut self, circuit: CircuitId, must_be_open: bool) -> bool {
        if self.members.contains_key(&circuit) {
            return false;
        }

        if !must_be_open {
            return true;
        }

        let Some(envelope) = self.envelopes.get(&circuit) else {
            return true;
        };

        let session_ids = envelope
            .merge_points
            .iter()
            .map(|(_, session_id)| *session_id)
            .collect::<Vec<_>>();

        for session_id in &session_ids {
            self.finalise(*session_id);
        }

        let all_final = session_ids
            .iter()
            .all(|id| self.sessions.get(id).map(|s| s.is_final).unwrap_or(true));

        if !all_final {
            tracing::info!("Not all merge points of {circuit} are final. Cannot attach streams...");
        }

        all_final
    }

    /// A cell of the base circuit is about to leave towards `layer`;
    /// schedule it over the sub-circuits of the first merge point on the
    /// way, or pass it through when there is none.
    pub fn handle_outgoing_cell(
        &mut self,
        circuit: CircuitId,
        layer: usize,
        cell: &Cell,
        now: u32,
    ) -> Result<(), Error> {
        let Some(session_id) = self.merge_point_before(circuit, layer) else {
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

        scheduler::buffer_cell(
            &mut entry.session,
            SubcircId::BASE,
            cell,
            Direction::Outbound,
            now,
        )?;

        self.drain_session(session_id);

        Ok(())
    }

    /// A cell arrived from the network on `circuit` (a sub-circuit or the
    /// base); reorder it into the base circuit's inbound stream.
    pub fn handle_incoming_cell(
        &mut self,
        circuit: CircuitId,
        cell: &Cell,
        now: u32,
    ) -> Result<(), Error> {
        let located = self.locate_arrival(circuit);

        let Some((session_id, subcirc_id)) = located else {
            self.pending_commands.push_back(Command::DeliverCell {
                circuit,
                cell: cell.clone(),
            });
            return Ok(());
        };

        self.check_pressure();

        let Some(entry) = self.sessions.get_mut(&session_id) else {
            return Err(Error::SessionClosing);
        };

        scheduler::buffer_cell(&mut entry.session, subcirc_id, cell, Direction::Inbound, now)?;

        self.drain_session(session_id);

        Ok(())
    }

    /// Re-examine buffered cells of every session `circuit` belongs to.
    pub fn handle_buffered_cells(&mut self, circuit: CircuitId) {
        let session_ids = if let Some(session_id) = self.members.get(&circuit) {
            vec![*session_id]
        } else if let Some(envelope) = self.envelopes.get(&circuit) {
            envelope
                .merge_points
                .iter()
                .map(|(_, session_id)| *session_id)
                .collect()
        } else {
            return;
        };

        for session_id in session_ids {
            self.drain_session(session_id);
        }
    }

    /// Forward and deliver every buffered cell the active instructions
    /// allow, then replenish what was consumed.
    fn drain_session(&mut self, session_id: SessionId) {
        let Some(entry) = self.sessions.get_mut(&session_id) else {
            return;
        };
        let base = entry.session.base;

        let mut forwards = Vec::new();
        if let Err(e) = scheduler::distribute(&mut entry.session, Direction::Outbound, &mut forwards)
        {
            tracing::warn!("Failed to distribute outbound cells of {session_id}: {e}. Closing...");
            self.close(base, CloseReason::Protocol);
            return;
        }

        for forward in forwards {
            self.pending_commands.push_back(Command::ForwardCell {
                circuit: forward.circuit,
                direction: Direction::Outbound,
                cell: forward.cell,
            });
        }

        let mut merged = Vec::new();
        if let Err(e) = scheduler::merge(&mut entry.session, Direction::Inbound, &mut merged) {
            tracing::warn!("Failed to merge inbound cells of {session_id}: {e}. Closing...");
            self.close(base, CloseReason::Protocol);
            return;
        }

        for cell in merged {
            self.pending_commands
                .push_back(Command::DeliverCell { circuit: base, cell });
        }

        self.replenish(session_id);
    }

    /// The circuit layer is closing `circuit`.
    ///
    /// Closing a base circuit tears down all of its sessions; losing a
    /// single sub-circuit never cascades to its siblings.
    pub fn mark_for_close(&mut self, circuit: CircuitId, reason: CloseReason) {
        if self.members.contains_key(&circuit) {
            return;
        }

        let Some(envelope) = self.envelopes.get(&circuit) else {
            return;
        };

        let session_ids = envelope
            .merge_points
            .iter()
            .map(|(_, session_id)| *session_id)
            .collect::<Vec<_>>();

        for session_id in session_ids {
            self.mark_session_for_close(session_id, circuit, reason);
        }
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
            .chain(entry.pending.iter().map(|sub| sub.circuit))
            .filter(|circuit| *circuit != cause)
            .collect::<Vec<_>>();

        for circuit in members {
            self.pending_commands
                .push_back(Command::MarkForClose { circuit, reason });
        }
    }

    /// `circuit` has been freed by the circuit layer; drop its memberships.
    pub fn remove_subcirc(&mut self, circuit: CircuitId) {
        if let Some(session_id) = self.members.remove(&circuit) {
            let Some(entry) = self.sessions.get_mut(&session_id) else {
                return;
            };

            if let Some(position) = entry.pending_position(circuit) {
                entry.pending.remove(position);
            } else if let Some(id) = entry.session.subcirc_by_circuit(circuit) {
                entry.session.remove_added(id);
            }

            entry.member_paths.remove(&circuit);

            // membership changed; the next finalise starts a new page load
            entry.is_final = false;

            tracing::info!("Removed {circuit} from {session_id}");

            self.remove_session_if_empty(session_id);
            return;
        }

        let Some(envelope) = self.envelopes.remove(&circuit) else {
            return;
        };

        for (_, session_id) in envelope.merge_points {
            self.mark_session_for_close(session_id, circuit, CloseReason::Internal);

            let Some(entry) = self.sessions.get_mut(&session_id) else {
                continue;
            };

            if let Some(position) = entry.pending_position(circuit) {
                entry.pending.remove(position);
            } else if let Some(id) = entry.session.subcirc_by_circuit(circuit) {
                entry.session.remove_added(id);
            }

            tracing::info!("Removed {circuit} from {session_id}");

            self.remove_session_if_empty(session_id);
        }
    }

    fn remove_session_if_empty(&mut self, session_id: SessionId) {
        let Some(entry) = self.sessions.get(&session_id) else {
            return;
        };

        if entry.num_total() > 0 {
            return;
        }

        let base = entry.session.base;
        self.sessions.remove(&session_id);

        if let Some(envelope) = self.envelopes.get_mut(&base) {
            envelope
                .merge_points
                .retain(|(_, candidate)| *candidate != session_id);

            if envelope.merge_points.is_empty() {
                self.envelopes.remove(&base);
            }
        }

        tracing::info!("Freed {session_id}");
    }

    /// A sub-circuit's onward channel became flow-controlled.
    pub fn inc_blocked(&mut self, base: CircuitId) {
        if let Some(envelope) = self.envelopes.get_mut(&base) {
            envelope.num_blocked += 1;
        }
    }

    pub fn dec_blocked(&mut self, base: CircuitId) {
        if let Some(envelope) = self.envelopes.get_mut(&base) {
            envelope.num_blocked = envelope.num_blocked.saturating_sub(1);
        }
    }

    /// The base may only be unblocked once no sub-circuit is blocked.
    pub fn should_unblock(&self, base: CircuitId) -> bool {
        self.envelopes
            .get(&base)
            .map(|envelope| envelope.num_blocked == 0)
            .unwrap_or(true)
    }

    /// Relays that path selection must avoid when building join circuits
    /// for `base`.
    ///
    /// Covers every hop of the base circuit itself plus the full recorded
    /// path of every sub-circuit — added and pending alike — of every merge
    /// point on the circuit, so a new leg never reuses another leg's
    /// independently chosen entry guard. The caller widens each fingerprint
    /// to its whole node family; family knowledge lives with the relay
    /// directory, not here.
    pub fn excluded_nodes(&self, base: CircuitId) -> Vec<Fingerprint> {
        let Some(envelope) = self.envelopes.get(&base) else {
            return Vec::new();
        };

        let mut excluded: Vec<Fingerprint> = Vec::new();
        for (_, session_id) in &envelope.merge_points {
            let Some(entry) = self.sessions.get(session_id) else {
                continue;
            };

            let legs = entry.member_paths.values().flatten();
            for fingerprint in entry.base_path.iter().chain(legs) {
                if !excluded.contains(fingerprint) {
                    excluded.push(*fingerprint);
                }
            }
        }

        excluded
    }

    /// Age of the oldest cell buffered for `circuit`, 0 if none.
    pub fn max_buffered_cell_age(&self, circuit: CircuitId, now: u32) -> u32 {
        let mut age = 0;

        if let Some(session_id) = self.members.get(&circuit) {
            if let Some(entry) = self.sessions.get(session_id) {
                if let Some(id) = entry.session.subcirc_by_circuit(circuit) {
                    if let Some(sub) = entry.session.subcircs.get(id) {
                        age = age.max(sub.buffer.oldest_age(now));
                    }
                }
            }
        }

        if let Some(envelope) = self.envelopes.get(&circuit) {
            for (_, session_id) in &envelope.merge_points {
                if let Some(entry) = self.sessions.get(session_id) {
                    if let Some(sub) = entry.session.subcircs.get(SubcircId::BASE) {
                        age = age.max(sub.buffer.oldest_age(now));
                    }
                }
            }
        }

        age
    }

    /// Free the reorder buffers of a circuit that was marked for close.
    ///
    /// Returns the number of bytes freed.
    pub fn free_buffers(&mut self, circuit: CircuitId) -> usize {
        let mut freed = 0;

        if let Some(session_id) = self.members.get(&circuit).copied() {
            if let Some(entry) = self.sessions.get_mut(&session_id) {
                if let Some(id) = entry.session.subcirc_by_circuit(circuit) {
                    if let Some(sub) = entry.session.subcircs.get_mut(id) {
                        freed += sub.buffer.clear();
                    }
                }
            }
        }

        let session_ids = self
            .envelopes
            .get(&circuit)
            .map(|envelope| {
                envelope
                    .merge_points
                    .iter()
                    .map(|(_, session_id)| *session_id)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        for session_id in session_ids {
            if let Some(entry) = self.sessions.get_mut(&session_id) {
                if let Some(sub) = entry.session.subcircs.get_mut(SubcircId::BASE) {
                    freed += sub.buffer.clear();
                }
            }
        }

        freed
    }

    /// The session of the merge point at exactly `layer` on `circuit`.
    fn session_at(&self, circuit: CircuitId, layer: usize) -> Option<SessionId> {
        self.envelopes
            .get(&circuit)?
            .merge_points
            .iter()
            .find(|(index, _)| *index == layer)
            .map(|(_, session_id)| *session_id)
    }

    /// The first established merge point strictly before `layer`.
    fn merge_point_before(&self, circuit: CircuitId, layer: usize) -> Option<SessionId> {
        self.envelopes
            .get(&circuit)?
            .merge_points
            .iter()
            .filter(|(index, _)| *index < layer)
            .map(|(_, session_id)| *session_id)
            .find(|session_id| {
                self.sessions
                    .get(session_id)
                    .map(|entry| entry.session.subcircs.contains(SubcircId::BASE))
                    .unwrap_or(false)
            })
    }

    /// Resolve which session and sub-circuit an inbound cell on `circuit`
    /// belongs to.
    fn locate_arrival(&self, circuit: CircuitId) -> Option<(SessionId, SubcircId)> {
        if let Some(session_id) = self.members.get(&circuit) {
            let id = self
                .sessions
                .get(session_id)
                .and_then(|entry| entry.session.subcirc_by_circuit(circuit))?;

            return Some((*session_id, id));
        }

        let envelope = self.envelopes.get(&circuit)?;
        envelope
            .merge_points
            .iter()
            .map(|(_, session_id)| *session_id)
            .find(|session_id| {
                self.sessions
                    .get(session_id)
                    .map(|entry| entry.session.subcircs.contains(SubcircId::BASE))
                    .unwrap_or(false)
            })
            .map(|session_id| (session_id, SubcircId::BASE))
    }

    fn check_pressure(&mut self) {
        let buffered_bytes = cell_buffer::total_buffered_bytes();

        if buffered_bytes > self.config.max_buffered_bytes {
            self.pending_commands
                .push_back(Command::MemoryPressure { buffered_bytes });
        }
    }

    fn close(&mut self, circuit: CircuitId, reason: CloseReason) {
        self.pending_commands
            .push_back(Command::MarkForClose { circuit, reason });
    }
}

fn check_base_circuit(base: &BaseCircuit) -> Result<(), Error> {
    if base.marked_for_close {
        tracing::warn!("{} is marked for close; don't use as split circuit", base.id);
        return Err(Error::Protocol("circuit is marked for close"));
    }

    if base.purpose != CircuitPurpose::General {
        tracing::warn!("{} has the wrong purpose; don't use as split circuit", base.id);
        return Err(Error::Protocol("circuit has the wrong purpose"));
    }

    if base.one_hop {
        tracing::warn!("{} is a one-hop tunnel; don't use as split circuit", base.id);
        return Err(Error::Protocol("circuit is a one-hop tunnel"));
    }

    if base.state != CircuitState::Open {
        tracing::warn!("{} is not open; don't use as split circuit", base.id);
        return Err(Error::Protocol("circuit is not open"));
    }

    Ok(())
}

fn check_merge_hop(base: &BaseCircuit, middle_index: usize) -> Result<(), Error> {
    if middle_index == 0 || middle_index + 1 >= base.hops.len() {
        tracing::warn!(
            "Hop {middle_index} of {} is an endpoint; don't use as merge point",
            base.id
        );
        return Err(Error::Protocol("merge point must be an interior hop"));
    }

    if !base.hops[middle_index].open {
        tracing::warn!(
            "{} has not been extended to hop {middle_index}; don't use as merge point",
            base.id
        );
        return Err(Error::Protocol("circuit not extended to the merge point"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellCommand;
    use crate::path::HopCrypto;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const NOW: u32 = 0;
    const MIDDLE: usize = 1;

    /// Entry guard the circuit layer picks for launched join legs.
    const JOIN_GUARD: Fingerprint = Fingerprint([9; 20]);

    fn base_circuit(id: u64) -> BaseCircuit {
        let hops = (0..3u8)
            .map(|i| PathHop::new(Fingerprint([i; 20]), HopCrypto::new(u64::from(i)), true))
            .collect();

        BaseCircuit {
            id: CircuitId(id),
            purpose: CircuitPurpose::General,
            state: CircuitState::Open,
            one_hop: false,
            marked_for_close: false,
            hops,
        }
    }

    fn client(subcircuits: usize) -> Client<StdRng> {
        let config = SplitConfig {
            subcircuits,
            ..Default::default()
        };

        Client::with_rng(config, StdRng::seed_from_u64(42))
    }

    fn drain(client: &mut Client<StdRng>) -> Vec<Command> {
        std::iter::from_fn(|| client.next_command()).collect()
    }

    /// Run the full handshake of a two-sub-circuit session and return the
    /// IDs of base and join circuit.
    fn established_session(client: &mut Client<StdRng>) -> (CircuitId, CircuitId) {
        let base = base_circuit(1);
        client.launch_subcircuits(&base, MIDDLE, 1).unwrap();
        drain(client);

        client
            .process_relay_cell(base.id, MIDDLE, RelayCommand::CookieSet, &[0x01, 0x00])
            .unwrap();

        let commands = drain(client);
        let session = commands
            .iter()
            .find_map(|c| match c {
                Command::LaunchJoinCircuit { session, .. } => Some(*session),
                _ => None,
            })
            .expect("a join circuit launch");

        let join_circ = CircuitId(50);
        client.subcircuit_launched(session, join_circ, &[JOIN_GUARD, Fingerprint([1; 20])]);
        client.join_circuit_opened(join_circ);
        drain(client);

        client
            .process_relay_cell(join_circ, 1, RelayCommand::Joined, &[0x01, 0x01])
            .unwrap();
        drain(client);

        (base.id, join_circ)
    }

    #[test]
    fn launch_rejects_unsuitable_circuits() {
        let mut client = client(2);

        let mut one_hop = base_circuit(1);
        one_hop.one_hop = true;
        assert_eq!(
            client.launch_subcircuits(&one_hop, MIDDLE, 1),
            Err(Error::Protocol("circuit is a one-hop tunnel"))
        );

        let mut wrong_purpose = base_circuit(2);
        wrong_purpose.purpose = CircuitPurpose::SplitJoin;
        assert_eq!(
            client.launch_subcircuits(&wrong_purpose, MIDDLE, 1),
            Err(Error::Protocol("circuit has the wrong purpose"))
        );

        // entry and exit cannot be merge points
        assert_eq!(
            client.launch_subcircuits(&base_circuit(3), 0, 1),
            Err(Error::Protocol("merge point must be an interior hop"))
        );
        assert_eq!(
            client.launch_subcircuits(&base_circuit(4), 2, 1),
            Err(Error::Protocol("merge point must be an interior hop"))
        );

        assert_eq!(client.num_sessions(), 0);
    }

    #[test]
    fn launch_starts_the_cookie_handshake_and_defers() {
        let mut client = client(2);
        let base = base_circuit(1);

        client.launch_subcircuits(&base, MIDDLE, 1).unwrap();

        let commands = drain(&mut client);
        assert!(matches!(
            commands.as_slice(),
            [Command::SendControlCell {
                circuit: CircuitId(1),
                layer: MIDDLE,
                command: RelayCommand::SetCookie,
                ..
            }]
        ));
        assert_eq!(client.num_sessions(), 1);
    }

    #[test]
    fn launch_is_capped_inclusively() {
        let mut client = client(2);
        let base = base_circuit(1);

        // the base itself counts towards the limit
        assert_eq!(
            client.launch_subcircuits(&base, MIDDLE, MAX_SUBCIRCS),
            Err(Error::CapacityExceeded("too many sub-circuits"))
        );

        // current + n == MAX_SUBCIRCS is fine
        client
            .launch_subcircuits(&base, MIDDLE, MAX_SUBCIRCS - 1)
            .unwrap();
    }

    #[test]
    fn cookie_refusal_during_setup_tears_the_session_down() {
        let mut client = client(2);
        let base = base_circuit(1);
        client.launch_subcircuits(&base, MIDDLE, 1).unwrap();
        drain(&mut client);

        client
            .process_relay_cell(base.id, MIDDLE, RelayCommand::CookieSet, &[0x00])
            .unwrap();

        assert_eq!(client.num_sessions(), 0);
    }

    #[test]
    fn deferred_launches_fire_once_the_cookie_is_valid() {
        let mut client = client(3);
        let base = base_circuit(1);
        client.launch_subcircuits(&base, MIDDLE, 2).unwrap();
        drain(&mut client);

        client
            .process_relay_cell(base.id, MIDDLE, RelayCommand::CookieSet, &[0x01, 0x00])
            .unwrap();

        let launches = drain(&mut client)
            .iter()
            .filter(|c| matches!(c, Command::LaunchJoinCircuit { .. }))
            .count();

        assert_eq!(launches, 2);
    }

    #[test]
    fn joined_success_extends_the_path_and_finalises() {
        let mut client = client(2);
        let base = base_circuit(1);
        client.launch_subcircuits(&base, MIDDLE, 1).unwrap();
        drain(&mut client);
        client
            .process_relay_cell(base.id, MIDDLE, RelayCommand::CookieSet, &[0x01, 0x00])
            .unwrap();
        let session = drain(&mut client)
            .iter()
            .find_map(|c| match c {
                Command::LaunchJoinCircuit { session, .. } => Some(*session),
                _ => None,
            })
            .unwrap();

        let join_circ = CircuitId(50);
        client.subcircuit_launched(session, join_circ, &[JOIN_GUARD, Fingerprint([1; 20])]);
        client.join_circuit_opened(join_circ);
        drain(&mut client);

        assert!(!client.may_attach_stream(base.id, true));

        client
            .process_relay_cell(join_circ, 1, RelayCommand::Joined, &[0x01, 0x01])
            .unwrap();

        let commands = drain(&mut client);

        // the join circuit's path is extended with the shared post-middle hop
        let extend = commands.iter().find_map(|c| match c {
            Command::ExtendPath { circuit, hops } => Some((*circuit, hops.len())),
            _ => None,
        });
        assert_eq!(extend, Some((join_circ, 1)));

        // two instructions per direction are pre-emitted
        let instructions = commands
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    Command::SendControlCell {
                        command: RelayCommand::Instruction,
                        ..
                    }
                )
            })
            .count();
        let infos = commands
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    Command::SendControlCell {
                        command: RelayCommand::Info,
                        ..
                    }
                )
            })
            .count();
        assert_eq!((instructions, infos), (NUM_SPLIT_INSTRUCTIONS, NUM_SPLIT_INSTRUCTIONS));

        // and streams may now attach
        assert!(commands
            .iter()
            .any(|c| matches!(c, Command::StreamsAttachable { circuit } if *circuit == base.id)));
        assert!(client.may_attach_stream(base.id, true));
    }

    #[test]
    fn stale_join_triggers_a_rekey() {
        let mut client = client(2);
        let base = base_circuit(1);
        client.launch_subcircuits(&base, MIDDLE, 1).unwrap();
        drain(&mut client);
        client
            .process_relay_cell(base.id, MIDDLE, RelayCommand::CookieSet, &[0x01, 0x00])
            .unwrap();
        let session = drain(&mut client)
            .iter()
            .find_map(|c| match c {
                Command::LaunchJoinCircuit { session, .. } => Some(*session),
                _ => None,
            })
            .unwrap();

        let join_circ = CircuitId(50);
        client.subcircuit_launched(session, join_circ, &[JOIN_GUARD, Fingerprint([1; 20])]);
        client.join_circuit_opened(join_circ);
        drain(&mut client);

        let result = client.process_relay_cell(join_circ, 1, RelayCommand::Joined, &[0x00]);
        assert_eq!(result, Err(Error::CookieStale));

        // a fresh SET_COOKIE goes out on the base circuit
        let commands = drain(&mut client);
        assert!(matches!(
            commands.as_slice(),
            [Command::SendControlCell {
                circuit: CircuitId(1),
                command: RelayCommand::SetCookie,
                ..
            }]
        ));
    }

    #[test]
    fn outgoing_cells_follow_the_outbound_schedule() {
        let mut client = client(2);
        let (base, join_circ) = established_session(&mut client);

        let cell = Cell::new(CellCommand::Relay, &[1]);

        // round-robin: 0, 1, 0, 1, ...
        client.handle_outgoing_cell(base, 2, &cell, NOW).unwrap();
        client.handle_outgoing_cell(base, 2, &cell, NOW).unwrap();

        let targets = drain(&mut client)
            .iter()
            .filter_map(|c| match c {
                Command::ForwardCell {
                    circuit,
                    direction: Direction::Outbound,
                    ..
                } => Some(*circuit),
                _ => None,
            })
            .collect::<Vec<_>>();

        assert_eq!(targets, vec![base, join_circ]);
    }

    #[test]
    fn incoming_cells_are_reordered_by_the_inbound_schedule() {
        let mut client = client(2);
        let (base, join_circ) = established_session(&mut client);

        // round-robin expects sub-circuit 0 first; a cell arriving on the
        // join circuit (ID 1) must wait for it
        let first = Cell::new(CellCommand::Relay, &[1]);
        let second = Cell::new(CellCommand::Relay, &[2]);

        client.handle_incoming_cell(join_circ, &second, NOW).unwrap();
        assert!(drain(&mut client).is_empty());

        client.handle_incoming_cell(base, &first, NOW).unwrap();

        let delivered = drain(&mut client)
            .iter()
            .filter_map(|c| match c {
                Command::DeliverCell { circuit, cell } => Some((*circuit, cell.payload()[0])),
                _ => None,
            })
            .collect::<Vec<_>>();

        assert_eq!(delivered, vec![(base, 1), (base, 2)]);
    }

    #[test]
    fn cells_pass_through_without_a_merge_point() {
        let mut client = client(2);

        let cell = Cell::new(CellCommand::Relay, &[7]);
        client
            .handle_outgoing_cell(CircuitId(9), 2, &cell, NOW)
            .unwrap();

        assert!(matches!(
            drain(&mut client).as_slice(),
            [Command::ForwardCell {
                circuit: CircuitId(9),
                direction: Direction::Outbound,
                ..
            }]
        ));
    }

    #[test]
    fn closing_the_base_cascades() {
        let mut client = client(2);
        let (base, join_circ) = established_session(&mut client);

        client.mark_for_close(base, CloseReason::Internal);

        let closed = drain(&mut client)
            .iter()
            .filter_map(|c| match c {
                Command::MarkForClose { circuit, .. } => Some(*circuit),
                _ => None,
            })
            .collect::<Vec<_>>();

        assert_eq!(closed, vec![join_circ]);
    }

    #[test]
    fn removing_all_members_frees_the_session() {
        let mut client = client(2);
        let (base, join_circ) = established_session(&mut client);

        client.remove_subcirc(join_circ);
        assert_eq!(client.num_sessions(), 1);

        client.remove_subcirc(base);
        assert_eq!(client.num_sessions(), 0);
        assert!(client.should_unblock(base));
    }

    #[test]
    fn blocked_counter_gates_unblocking() {
        let mut client = client(2);
        let (base, _) = established_session(&mut client);

        assert!(client.should_unblock(base));

        client.inc_blocked(base);
        client.inc_blocked(base);
        assert!(!client.should_unblock(base));

        client.dec_blocked(base);
        assert!(!client.should_unblock(base));

        client.dec_blocked(base);
        assert!(client.should_unblock(base));
    }

    #[test]
    fn excluded_nodes_cover_every_leg_of_the_split() {
        let mut client = client(2);
        let (base, join_circ) = established_session(&mut client);

        let excluded = client.excluded_nodes(base);

        // the base circuit's own hops
        for i in 0..3u8 {
            assert!(excluded.contains(&Fingerprint([i; 20])));
        }

        // and the join leg's independently chosen entry guard, with the
        // shared merge point deduplicated
        assert!(excluded.contains(&JOIN_GUARD));
        assert_eq!(excluded.len(), 4);

        // a torn-down leg no longer taints path selection
        client.remove_subcirc(join_circ);
        assert!(!client.excluded_nodes(base).contains(&JOIN_GUARD));
    }
}
