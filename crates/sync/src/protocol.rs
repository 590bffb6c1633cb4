use std::fmt;

/// Capability set of a peer, fixed at registration from the negotiated
/// protocol version.
///
/// Variants are ordered by capability, so `Protocol::HeaderSplit <= p` reads
/// as "p serves at least headers and bodies".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    /// eth/61: hash chains and full blocks only.
    Legacy,
    /// eth/62: separate header and body retrieval.
    HeaderSplit,
    /// eth/63: header/body split plus receipts and state node data.
    StateCapable,
}

impl Protocol {
    pub const LEGACY_VERSION: u32 = 61;
    pub const HEADER_SPLIT_VERSION: u32 = 62;
    pub const STATE_CAPABLE_VERSION: u32 = 63;

    /// Map a negotiated version to its capability variant. Versions above 63
    /// are served through the eth/63 message set.
    pub fn from_version(version: u32) -> Option<Self> {
        match version {
            Self::LEGACY_VERSION => Some(Protocol::Legacy),
            Self::HEADER_SPLIT_VERSION => Some(Protocol::HeaderSplit),
            v if v >= Self::STATE_CAPABLE_VERSION => Some(Protocol::StateCapable),
            _ => None,
        }
    }

    pub fn version(self) -> u32 {
        match self {
            Protocol::Legacy => Self::LEGACY_VERSION,
            Protocol::HeaderSplit => Self::HEADER_SPLIT_VERSION,
            Protocol::StateCapable => Self::STATE_CAPABLE_VERSION,
        }
    }

    /// Whether the peer answers hash-chain and full-block requests.
    pub fn serves_hashes(self) -> bool {
        self == Protocol::Legacy
    }

    pub fn serves_headers(self) -> bool {
        self >= Protocol::HeaderSplit
    }

    pub fn serves_bodies(self) -> bool {
        self >= Protocol::HeaderSplit
    }

    pub fn serves_receipts(self) -> bool {
        self == Protocol::StateCapable
    }

    pub fn serves_state(self) -> bool {
        self == Protocol::StateCapable
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "eth/{}", self.version())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_map_to_variants() {
        assert_eq!(Protocol::from_version(60), None);
        assert_eq!(Protocol::from_version(61), Some(Protocol::Legacy));
        assert_eq!(Protocol::from_version(62), Some(Protocol::HeaderSplit));
        assert_eq!(Protocol::from_version(63), Some(Protocol::StateCapable));
        assert_eq!(Protocol::from_version(68), Some(Protocol::StateCapable));
    }

    #[test]
    fn capabilities() {
        assert!(Protocol::Legacy.serves_hashes());
        assert!(!Protocol::Legacy.serves_headers());
        assert!(Protocol::HeaderSplit.serves_bodies());
        assert!(!Protocol::HeaderSplit.serves_receipts());
        assert!(Protocol::StateCapable.serves_state());
        assert!(Protocol::Legacy < Protocol::HeaderSplit);
        assert_eq!(Protocol::StateCapable.to_string(), "eth/63");
    }
}
