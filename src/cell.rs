use core::fmt;

/// Payload width of a circuit-layer cell.
pub const CELL_PAYLOAD_LEN: usize = 509;

/// Portion of the cell payload available to relay commands, and thus the
/// upper bound for an encoded instruction frame.
pub const RELAY_PAYLOAD_LEN: usize = 498;

/// Command tag of a circuit-layer cell as far as the splitting core cares:
/// restricted-lifetime cells are rewritten at the merge point once the
/// session's budget is exhausted, everything else passes through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellCommand {
    Relay,
    RelayEarly,
}

/// A fixed-size circuit-layer frame.
///
/// The core treats the payload as opaque; it only decides which sub-circuit
/// carries the cell between client and merge point.
#[derive(Clone, PartialEq, Eq)]
pub struct Cell {
    command: CellCommand,
    payload: Box<[u8; CELL_PAYLOAD_LEN]>,
}

impl Cell {
    /// Create a cell from `bytes`, zero-padded to the full payload width.
    pub fn new(command: CellCommand, bytes: &[u8]) -> Self {
        let mut payload = Box::new([0u8; CELL_PAYLOAD_LEN]);
        let len = bytes.len().min(CELL_PAYLOAD_LEN);
        payload[..len].copy_from_slice(&bytes[..len]);

        Self { command, payload }
    }

    pub fn command(&self) -> CellCommand {
        self.command
    }

    pub fn payload(&self) -> &[u8; CELL_PAYLOAD_LEN] {
        &self.payload
    }

    /// Rewrite a restricted-lifetime tag into the unrestricted form.
    pub(crate) fn demote(&mut self) {
        self.command = CellCommand::Relay;
    }
}

impl fmt::Debug for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("command", &self.command)
            .field("payload", &format_args!("[{} bytes]", CELL_PAYLOAD_LEN))
            .finish()
    }
}
