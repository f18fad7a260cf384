use core::fmt;
use std::sync::Arc;

/// Identity digest of a relay.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub [u8; 20]);

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use hex_display::HexDisplayExt;

        self.0.hex().fmt(f)
    }
}

/// What the client needs to extend a circuit to a particular relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopInfo {
    pub fingerprint: Fingerprint,
}

/// Shared per-hop relay crypto state, owned by the circuit layer.
///
/// Cloning shares the underlying state; the last handle to be dropped frees
/// it. The key identifies the state within the circuit layer.
#[derive(Debug, Clone)]
pub struct HopCrypto(Arc<HopCryptoInner>);

#[derive(Debug)]
struct HopCryptoInner {
    key: u64,
}

impl HopCrypto {
    pub fn new(key: u64) -> Self {
        Self(Arc::new(HopCryptoInner { key }))
    }

    pub fn key(&self) -> u64 {
        self.0.key
    }

    /// Number of live handles to this crypto state.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

/// One hop of a cryptographic path.
#[derive(Debug, Clone)]
pub struct PathHop {
    pub info: HopInfo,
    pub crypto: HopCrypto,
    /// Whether the circuit has completed its handshake with this hop.
    pub open: bool,
}

impl PathHop {
    pub fn new(fingerprint: Fingerprint, crypto: HopCrypto, open: bool) -> Self {
        Self {
            info: HopInfo { fingerprint },
            crypto,
            open,
        }
    }
}
