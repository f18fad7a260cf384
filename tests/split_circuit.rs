use circuit_split::{
    BaseCircuit, Cell, CellCommand, CircuitId, CircuitInfo, CircuitPurpose, CircuitState, Client,
    ClientCommand, Fingerprint, HopCrypto, Instruction, Middle, MiddleCommand, PathHop,
    RelayCommand, SessionId, SplitConfig, Strategy, NUM_SPLIT_INSTRUCTIONS,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

const MIDDLE_HOP: usize = 1;
const NOW: u32 = 0;

fn or_info() -> CircuitInfo {
    CircuitInfo {
        purpose: CircuitPurpose::Or,
        state: CircuitState::Open,
        marked_for_close: false,
        remaining_relay_early: 8,
    }
}

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

/// Wires a client and a middle together through their command queues.
///
/// Signalling cells are forwarded eagerly; data cells are parked so tests
/// can replay them with arbitrary skew.
struct Harness {
    client: Client<StdRng>,
    middle: Middle,
    next_join_circuit: u64,

    /// Signalling cells the client sent, in order.
    client_control: Vec<(CircuitId, RelayCommand, Vec<u8>)>,
    /// Join circuits that were launched.
    launched: Vec<(SessionId, CircuitId)>,
    /// Outbound data cells the client emitted, with their carrier circuit.
    client_data: Vec<(CircuitId, Cell)>,
    /// Inbound data cells the middle emitted towards the client.
    middle_data: Vec<(CircuitId, Cell)>,
    /// Cells the middle forwarded on the base towards the exit.
    to_exit: Vec<Cell>,
    /// Cells the client delivered upwards on the base circuit.
    delivered: Vec<(CircuitId, Cell)>,
    /// Whether any merge point reported attachable streams.
    streams_attachable: bool,
}

impl Harness {
    fn new(config: SplitConfig) -> Self {
        Self {
            client: Client::with_rng(config, StdRng::seed_from_u64(1)),
            middle: Middle::new(usize::MAX),
            next_join_circuit: 100,
            client_control: Vec::new(),
            launched: Vec::new(),
            client_data: Vec::new(),
            middle_data: Vec::new(),
            to_exit: Vec::new(),
            delivered: Vec::new(),
            streams_attachable: false,
        }
    }

    /// Shuttle commands between the two sides until both are quiescent.
    fn pump(&mut self) {
        loop {
            let mut progressed = false;

            while let Some(command) = self.client.next_command() {
                progressed = true;
                self.on_client_command(command);
            }

            while let Some(command) = self.middle.next_command() {
                progressed = true;
                self.on_middle_command(command);
            }

            if !progressed {
                break;
            }
        }
    }

    fn on_client_command(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::SendControlCell {
                circuit,
                command,
                payload,
                ..
            } => {
                self.client_control.push((circuit, command, payload.clone()));
                let _ = self
                    .middle
                    .process_relay_cell(circuit, &or_info(), command, &payload);
            }
            ClientCommand::LaunchJoinCircuit { session, middle } => {
                let circuit = CircuitId(self.next_join_circuit);
                self.next_join_circuit += 1;

                // each join leg gets its own entry guard
                let guard = Fingerprint([circuit.0 as u8; 20]);

                self.launched.push((session, circuit));
                self.client
                    .subcircuit_launched(session, circuit, &[guard, middle.fingerprint]);
                self.client.join_circuit_opened(circuit);
            }
            ClientCommand::ForwardCell { circuit, cell, .. } => {
                self.client_data.push((circuit, cell));
            }
            ClientCommand::DeliverCell { circuit, cell } => {
                self.delivered.push((circuit, cell));
            }
            ClientCommand::StreamsAttachable { .. } => {
                self.streams_attachable = true;
            }
            ClientCommand::ExtendPath { .. }
            | ClientCommand::MarkForClose { .. }
            | ClientCommand::MemoryPressure { .. } => {}
        }
    }

    fn on_middle_command(&mut self, command: MiddleCommand) {
        match command {
            MiddleCommand::SendControlCell {
                circuit,
                command,
                payload,
            } => {
                let _ = self
                    .client
                    .process_relay_cell(circuit, MIDDLE_HOP, command, &payload);
            }
            MiddleCommand::ForwardCell {
                circuit,
                direction,
                cell,
            } => match direction {
                circuit_split::Direction::Outbound => self.to_exit.push(cell),
                circuit_split::Direction::Inbound => self.middle_data.push((circuit, cell)),
            },
            MiddleCommand::MarkForClose { .. } | MiddleCommand::MemoryPressure { .. } => {}
        }
    }

    /// Replay parked outbound data cells to the middle in the given order.
    fn deliver_to_middle(&mut self, order: &[usize]) {
        let cells = std::mem::take(&mut self.client_data);
        for index in order {
            let (circuit, cell) = &cells[*index];
            self.middle
                .handle_cell_from_client(*circuit, cell, NOW)
                .unwrap();
        }
        self.pump();
    }

    /// Replay parked inbound data cells to the client in the given order.
    fn deliver_to_client(&mut self, order: &[usize]) {
        let cells = std::mem::take(&mut self.middle_data);
        for index in order {
            let (circuit, cell) = &cells[*index];
            self.client.handle_incoming_cell(*circuit, cell, NOW).unwrap();
        }
        self.pump();
    }

    fn instructions(&self, wanted: RelayCommand) -> Vec<Instruction> {
        self.client_control
            .iter()
            .filter(|(_, command, _)| *command == wanted)
            .map(|(_, _, payload)| Instruction::decode(payload).unwrap())
            .collect()
    }
}

fn establish(config: SplitConfig, extra_subcircuits: usize) -> (Harness, CircuitId) {
    let mut harness = Harness::new(config);
    let base = base_circuit(1);

    harness
        .client
        .launch_subcircuits(&base, MIDDLE_HOP, extra_subcircuits)
        .unwrap();
    harness.pump();

    (harness, base.id)
}

#[test]
fn two_sub_circuit_happy_path() {
    let config = SplitConfig {
        subcircuits: 2,
        strategy: Strategy::RoundRobin,
        ..Default::default()
    };

    let (harness, base) = establish(config, 1);

    // handshake: SET_COOKIE, then JOIN, then two instructions per direction
    let commands = harness
        .client_control
        .iter()
        .map(|(_, command, _)| *command)
        .collect::<Vec<_>>();
    assert_eq!(
        commands,
        vec![
            RelayCommand::SetCookie,
            RelayCommand::Join,
            RelayCommand::Instruction,
            RelayCommand::Instruction,
            RelayCommand::Info,
            RelayCommand::Info,
        ]
    );

    assert_eq!(harness.launched.len(), 1);
    assert_eq!(harness.middle.num_sessions(), 1);
    assert!(harness.streams_attachable);

    // with ROUND_ROBIN the first instruction alternates 0, 1, 0, 1, ...
    let instructions = harness.instructions(RelayCommand::Instruction);
    assert_eq!(instructions.len(), NUM_SPLIT_INSTRUCTIONS);
    let ids = instructions[0]
        .ids()
        .iter()
        .map(|id| id.value())
        .collect::<Vec<_>>();
    assert!(ids.chunks(2).all(|pair| pair == [0, 1] || pair == [0]));

    // the schedule fills the whole payload
    let max_id = circuit_split::SubcircId::new(1);
    assert_eq!(ids.len(), circuit_split::max_ids_per_cell(max_id));

    // further launches must avoid the join leg's entry guard as well as
    // the base circuit's own relays
    let (_, join_circ) = harness.launched[0];
    let excluded = harness.client.excluded_nodes(base);
    assert!(excluded.contains(&Fingerprint([join_circ.0 as u8; 20])));
    assert!(excluded.contains(&Fingerprint([0; 20])));
}

#[test]
fn outbound_cells_arrive_at_the_exit_in_order_despite_skew() {
    let config = SplitConfig {
        subcircuits: 2,
        strategy: Strategy::RoundRobin,
        ..Default::default()
    };

    let (mut harness, base) = establish(config, 1);

    for tag in 1..=4u8 {
        let cell = Cell::new(CellCommand::Relay, &[tag]);
        harness
            .client
            .handle_outgoing_cell(base, 2, &cell, NOW)
            .unwrap();
    }
    harness.pump();

    assert_eq!(harness.client_data.len(), 4);

    // the join circuit's cells overtake the base's cells on the way to the
    // middle; the merge point restores the original order
    harness.deliver_to_middle(&[1, 3, 0, 2]);

    let tags = harness
        .to_exit
        .iter()
        .map(|cell| cell.payload()[0])
        .collect::<Vec<_>>();
    assert_eq!(tags, vec![1, 2, 3, 4]);
}

#[test]
fn inbound_cells_reach_the_client_in_order_despite_skew() {
    let config = SplitConfig {
        subcircuits: 2,
        strategy: Strategy::RoundRobin,
        ..Default::default()
    };

    let (mut harness, base) = establish(config, 1);

    for tag in 1..=4u8 {
        let cell = Cell::new(CellCommand::Relay, &[tag]);
        harness.middle.handle_cell_from_exit(base, &cell, NOW).unwrap();
    }
    harness.pump();

    assert_eq!(harness.middle_data.len(), 4);

    harness.deliver_to_client(&[1, 3, 0, 2]);

    let delivered = harness
        .delivered
        .iter()
        .map(|(circuit, cell)| (*circuit, cell.payload()[0]))
        .collect::<Vec<_>>();
    assert_eq!(
        delivered,
        vec![(base, 1), (base, 2), (base, 3), (base, 4)]
    );
}

#[test]
fn stolen_cookie_forces_a_rekey_and_the_join_still_succeeds() {
    let config = SplitConfig {
        subcircuits: 3,
        strategy: Strategy::RoundRobin,
        ..Default::default()
    };

    // establish base + one join, but one short of final
    let (mut harness, base) = establish(config, 1);
    assert!(!harness.streams_attachable);

    // another circuit steals the client's cookie at the middle and goes
    // away again, leaving the client with a stale cookie
    let (_, _, stolen) = harness.client_control[0].clone();
    harness
        .middle
        .process_relay_cell(CircuitId(66), &or_info(), RelayCommand::SetCookie, &stolen)
        .unwrap();
    while harness.middle.next_command().is_some() {}
    harness.middle.remove_subcirc(CircuitId(66));
    while harness.middle.next_command().is_some() {}

    // the next join runs into the stale cookie, triggering a re-key
    harness.client.launch_subcircuits(&base_circuit(1), MIDDLE_HOP, 1).unwrap();
    harness.pump();

    let joins = harness
        .client_control
        .iter()
        .filter(|(_, command, _)| *command == RelayCommand::Join)
        .count();
    let rekeys = harness
        .client_control
        .iter()
        .filter(|(_, command, _)| *command == RelayCommand::SetCookie)
        .count();

    assert!(rekeys >= 2, "client must have re-keyed");
    assert!(joins >= 3, "the refused join must have been retried");

    // the session eventually reaches three members and becomes final
    assert!(harness.streams_attachable);
    assert!(harness.client.may_attach_stream(base, true));
}

#[test]
fn weighted_random_reuses_weights_within_one_page_load() {
    let config = SplitConfig {
        subcircuits: 2,
        strategy: Strategy::WeightedRandom,
        ..Default::default()
    };

    let (harness, _) = establish(config, 1);

    let infos = harness.instructions(RelayCommand::Info);
    assert_eq!(infos.len(), NUM_SPLIT_INSTRUCTIONS);

    // both pre-emitted schedules are drawn from the same θ, so their
    // empirical shares of sub-circuit 0 differ only by sampling noise
    let share = |instruction: &Instruction| {
        let zeros = instruction.ids().iter().filter(|id| id.value() == 0).count();
        zeros as f64 / instruction.ids().len() as f64
    };

    let difference = (share(&infos[0]) - share(&infos[1])).abs();
    assert!(
        difference < 0.05,
        "shares differ by {difference}, weights were not reused"
    );
}
