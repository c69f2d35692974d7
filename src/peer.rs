//! Peer identities.
//!
//! The bus has exactly two fixed links, one per coprocessor. Everything that
//! is kept "per peer" (queues, health, transports) is indexed by [`PeerId`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// One of the two coprocessors reachable from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerId {
    /// Graphics renderer.
    Graphics,
    /// Audio synthesizer.
    Audio,
}

impl PeerId {
    /// Number of peers on the bus.
    pub const COUNT: usize = 2;

    /// All peers, in index order.
    pub const ALL: [PeerId; Self::COUNT] = [PeerId::Graphics, PeerId::Audio];

    /// Stable index used for per-peer arrays.
    #[inline]
    pub const fn index(self) -> usize {
        match self {
            PeerId::Graphics => 0,
            PeerId::Audio => 1,
        }
    }

    /// Short lowercase name.
    pub const fn name(self) -> &'static str {
        match self {
            PeerId::Graphics => "graphics",
            PeerId::Audio => "audio",
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indices_are_dense() {
        for (i, peer) in PeerId::ALL.iter().enumerate() {
            assert_eq!(peer.index(), i);
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(PeerId::Graphics.to_string(), "graphics");
        assert_eq!(PeerId::Audio.to_string(), "audio");
    }
}
