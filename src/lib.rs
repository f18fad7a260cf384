mod cell;
mod cell_buffer;
mod client;
mod dirichlet;
mod instruction;
mod middle;
mod path;
mod scheduler;
mod session;
mod strategy;
mod subcirc_list;
mod wire;

pub use cell::{Cell, CellCommand, CELL_PAYLOAD_LEN, RELAY_PAYLOAD_LEN};
pub use cell_buffer::{total_buffered_bytes, CellBuffer};
pub use client::{BaseCircuit, Client, Command as ClientCommand};
pub use instruction::{max_ids_per_cell, Instruction};
pub use middle::{CircuitInfo, Command as MiddleCommand, Middle};
pub use path::{Fingerprint, HopCrypto, HopInfo, PathHop};
pub use strategy::{Strategy, UnknownStrategy, C_MAX, C_MIN};
pub use subcirc_list::SubcircList;
pub use wire::RelayCommand;

use core::fmt;
use rand::Rng;

/// Maximum number of sub-circuits per session.
///
/// Sub-circuit IDs therefore always fit a `u8`, which is also their wire
/// width.
pub const MAX_SUBCIRCS: usize = 5;

/// Length of the authentication cookie in bytes.
pub const SPLIT_COOKIE_LEN: usize = 20;

/// Maximum number of split instructions that may be queued per direction.
pub const MAX_NUM_SPLIT_INSTRUCTIONS: usize = 8;

/// Number of split instructions pre-emitted per direction when a session
/// becomes final.
pub const NUM_SPLIT_INSTRUCTIONS: usize = 2;

/// Default number of sub-circuits we want to establish per circuit.
pub const DEFAULT_SUBCIRCS: usize = 3;

/// ID of a sub-circuit, unique per session.
///
/// ID 0 is always the base sub-circuit, i.e. the circuit on which the split
/// was originally established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SubcircId(u8);

impl SubcircId {
    pub const BASE: SubcircId = SubcircId(0);

    pub fn new(id: u8) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    pub fn index(&self) -> usize {
        usize::from(self.0)
    }
}

impl fmt::Display for SubcircId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lookup key for a circuit owned by the circuit layer.
///
/// The core never owns circuits; it only refers to them by this key and
/// instructs the caller via commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CircuitId(pub u64);

impl fmt::Display for CircuitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Circ-{}", self.0)
    }
}

/// Identifier of a split session, one per (base circuit, merge point) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    fn next(&mut self) -> Self {
        let id = self.0;
        self.0 += 1;

        SessionId(id)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        SessionId(1)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Split-{}", self.0)
    }
}

/// Opaque 20-byte value that authorises a circuit to join a session at the
/// merge point.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cookie([u8; SPLIT_COOKIE_LEN]);

impl Cookie {
    pub fn new(bytes: [u8; SPLIT_COOKIE_LEN]) -> Self {
        Self(bytes)
    }

    pub fn generate<R>(rng: &mut R) -> Self
    where
        R: Rng,
    {
        let mut bytes = [0u8; SPLIT_COOKIE_LEN];
        rng.fill(&mut bytes[..]);

        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, Error> {
        let bytes = <[u8; SPLIT_COOKIE_LEN]>::try_from(bytes)
            .map_err(|_| Error::Protocol("cookie payload has wrong length"))?;

        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; SPLIT_COOKIE_LEN] {
        &self.0
    }
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use hex_display::HexDisplayExt;

        write!(f, "Cookie({})", self.0[..4].hex())
    }
}

/// Direction of a cell relative to the circuit: inbound cells travel towards
/// the client, outbound cells towards the exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn flip(&self) -> Self {
        match self {
            Direction::Inbound => Direction::Outbound,
            Direction::Outbound => Direction::Inbound,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => "inbound".fmt(f),
            Direction::Outbound => "outbound".fmt(f),
        }
    }
}

/// Reason forwarded to the circuit layer when the core asks for a circuit to
/// be closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer violated the signalling protocol.
    Protocol,
    /// The session the circuit belonged to is going away.
    Internal,
}

/// Purpose of a circuit as tracked by the circuit layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitPurpose {
    /// A general-purpose origin circuit.
    General,
    /// A relayed circuit at an onion router.
    Or,
    /// A two-hop circuit launched solely to join an existing session.
    SplitJoin,
}

/// Build state of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Building,
    Open,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(&'static str),
    #[error("cookie is no longer valid at the merge point")]
    CookieStale,
    #[error("no active split instruction")]
    NoActiveInstruction,
    #[error("session is marked for close")]
    SessionClosing,
}

/// Configuration consumed by the core.
#[derive(Debug, Clone)]
pub struct SplitConfig {
    /// Desired number of sub-circuits per circuit (`1..=MAX_SUBCIRCS`).
    pub subcircuits: usize,
    /// Strategy used to generate split instructions.
    pub strategy: Strategy,
    /// Entry-guard fingerprint pins.
    pub entry_nodes: Vec<Fingerprint>,
    /// Merge-point fingerprint pins.
    pub middle_nodes: Vec<Fingerprint>,
    /// Exit fingerprint pins.
    pub exit_nodes: Vec<Fingerprint>,
    /// Global limit on buffered reorder bytes before the OOM hook is raised.
    pub max_buffered_bytes: usize,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            subcircuits: DEFAULT_SUBCIRCS,
            strategy: Strategy::default(),
            entry_nodes: Vec::new(),
            middle_nodes: Vec::new(),
            exit_nodes: Vec::new(),
            max_buffered_bytes: 8 * 1024 * 1024,
        }
    }
}

impl SplitConfig {
    /// The effective number of sub-circuits to establish per circuit.
    ///
    /// Out-of-range settings fall back to the default.
    pub fn subcircuits_per_circuit(&self) -> usize {
        if (1..=MAX_SUBCIRCS).contains(&self.subcircuits) {
            self.subcircuits
        } else {
            DEFAULT_SUBCIRCS
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_subcircuits_falls_back_to_default() {
        let config = SplitConfig {
            subcircuits: 0,
            ..Default::default()
        };
        assert_eq!(config.subcircuits_per_circuit(), DEFAULT_SUBCIRCS);

        let config = SplitConfig {
            subcircuits: MAX_SUBCIRCS + 1,
            ..Default::default()
        };
        assert_eq!(config.subcircuits_per_circuit(), DEFAULT_SUBCIRCS);
    }

    #[test]
    fn cookie_debug_does_not_print_all_bytes() {
        let cookie = Cookie::new([0xab; SPLIT_COOKIE_LEN]);

        assert_eq!(format!("{cookie:?}"), "Cookie(abababab)");
    }
}
