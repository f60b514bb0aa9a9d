use std::fmt::{Display, Formatter};

use bitflags::bitflags;
use tracing::warn;

use crate::codec::ProtocolKind;

pub const THRIFT_BINARY: &str = "thrift_binary";
pub const THRIFT_COMPACT: &str = "thrift_compact";
pub const SNAPPY_RAW: &str = "snappy_raw";

bitflags! {
    /// The encodings a node supports. Peers exchange it as a `;`-separated list of names in
    ///  the `capacity` header extension of the login messages.
    #[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
    pub struct ProtocolCapability: u8 {
        const BINARY = 0b0000_0001;
        const COMPACT = 0b0000_0010;
        const COMPRESSION = 0b0000_0100;
    }
}

impl Default for ProtocolCapability {
    /// binary is always understood
    fn default() -> Self {
        ProtocolCapability::BINARY
    }
}

impl ProtocolCapability {
    /// Unknown names are ignored, binary is implied
    pub fn parse(s: &str) -> ProtocolCapability {
        let mut result = ProtocolCapability::BINARY;
        for name in s.split(';').map(str::trim).filter(|n| !n.is_empty()) {
            match name {
                THRIFT_BINARY => result |= ProtocolCapability::BINARY,
                THRIFT_COMPACT => result |= ProtocolCapability::COMPACT,
                SNAPPY_RAW => result |= ProtocolCapability::COMPRESSION,
                other => warn!("ignoring unknown protocol capability {}", other),
            }
        }
        result
    }

    /// compact only if both sides support it
    pub fn thrift_proto(&self, remote: ProtocolCapability) -> ProtocolKind {
        if self.contains(ProtocolCapability::COMPACT) && remote.contains(ProtocolCapability::COMPACT) {
            ProtocolKind::Compact
        }
        else {
            ProtocolKind::Binary
        }
    }

    pub fn compress_enabled(&self, remote: ProtocolCapability) -> bool {
        self.contains(ProtocolCapability::COMPRESSION) && remote.contains(ProtocolCapability::COMPRESSION)
    }
}

impl Display for ProtocolCapability {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut names = Vec::new();
        if self.contains(ProtocolCapability::BINARY) {
            names.push(THRIFT_BINARY);
        }
        if self.contains(ProtocolCapability::COMPACT) {
            names.push(THRIFT_COMPACT);
        }
        if self.contains(ProtocolCapability::COMPRESSION) {
            names.push(SNAPPY_RAW);
        }
        write!(f, "{}", names.join(";"))
    }
}
