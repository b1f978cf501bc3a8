//! Negotiated protocol versions.

use std::fmt;

use super::responses::{ResponseTable, ACKNOWLEDGED_RESPONSES, LEGACY_RESPONSES};

/// The protocol revisions the client knows how to correlate.
///
/// Selected once per handshake from the `version` field of the
/// `runtime:runtime` message. Everything that differs between revisions is
/// carried by [`ProtocolVersion::responses`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    /// 0.6 and earlier. `runtime:packet` is never acknowledged.
    V0_6,
    /// 0.7 and later. `runtime:packet` is acknowledged with `packetsent`.
    V0_7,
}

impl ProtocolVersion {
    /// Parse a `major.minor[.patch]` version string as announced by a runtime.
    ///
    /// Returns `None` when the string is not a version at all.
    pub fn parse(version: &str) -> Option<Self> {
        let mut parts = version.trim().split('.');
        let major: u32 = parts.next()?.parse().ok()?;
        let minor: u32 = match parts.next() {
            Some(minor) => minor.parse().ok()?,
            None => 0,
        };
        if major == 0 && minor <= 6 {
            Some(ProtocolVersion::V0_6)
        } else {
            Some(ProtocolVersion::V0_7)
        }
    }

    /// Response-correlation rules for this revision.
    pub fn responses(&self) -> &'static ResponseTable {
        match self {
            ProtocolVersion::V0_6 => &*LEGACY_RESPONSES,
            ProtocolVersion::V0_7 => &*ACKNOWLEDGED_RESPONSES,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVersion::V0_6 => f.write_str("0.6"),
            ProtocolVersion::V0_7 => f.write_str("0.7"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_legacy_versions() {
        assert_eq!(ProtocolVersion::parse("0.6"), Some(ProtocolVersion::V0_6));
        assert_eq!(ProtocolVersion::parse("0.4"), Some(ProtocolVersion::V0_6));
        assert_eq!(ProtocolVersion::parse("0.5.2"), Some(ProtocolVersion::V0_6));
        assert_eq!(ProtocolVersion::parse("0"), Some(ProtocolVersion::V0_6));
    }

    #[test]
    fn test_parse_acknowledged_versions() {
        assert_eq!(ProtocolVersion::parse("0.7"), Some(ProtocolVersion::V0_7));
        assert_eq!(ProtocolVersion::parse("0.8"), Some(ProtocolVersion::V0_7));
        assert_eq!(ProtocolVersion::parse("0.10"), Some(ProtocolVersion::V0_7));
        assert_eq!(ProtocolVersion::parse("1.0"), Some(ProtocolVersion::V0_7));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(ProtocolVersion::parse(""), None);
        assert_eq!(ProtocolVersion::parse("latest"), None);
        assert_eq!(ProtocolVersion::parse("0.x"), None);
    }
}
