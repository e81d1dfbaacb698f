//! Data access modes.

use serde::{Deserialize, Serialize};

/// How a task or application request accesses a data handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    /// Read only
    Read,
    /// Write only; previous contents are not needed
    Write,
    /// Read then write
    ReadWrite,
    /// Private uninitialized scratch space, one copy per worker
    Scratch,
    /// Commutative accumulation into a per-worker private copy
    Redux,
}

impl AccessMode {
    /// Whether the access needs the current contents
    #[must_use]
    pub const fn reads(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    /// Whether the access modifies the contents
    #[must_use]
    pub const fn writes(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite | Self::Redux)
    }

    /// Whether the access uses a per-worker replica exempt from single-owner coherency
    #[must_use]
    pub const fn is_relaxed(self) -> bool {
        matches!(self, Self::Scratch | Self::Redux)
    }

    /// Combine two modes requested on the same replica
    ///
    /// Used when a pending fetch is coalesced with a new one.
    #[must_use]
    pub const fn merge(self, other: AccessMode) -> AccessMode {
        let reads = self.reads() || other.reads();
        let writes = self.writes() || other.writes();
        match (reads, writes) {
            (true, true) => Self::ReadWrite,
            (false, true) => Self::Write,
            _ => Self::Read,
        }
    }

    /// Short name
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Read => "R",
            Self::Write => "W",
            Self::ReadWrite => "RW",
            Self::Scratch => "SCRATCH",
            Self::Redux => "REDUX",
        }
    }
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_writes() {
        assert!(AccessMode::Read.reads());
        assert!(!AccessMode::Read.writes());
        assert!(AccessMode::Write.writes());
        assert!(!AccessMode::Write.reads());
        assert!(AccessMode::ReadWrite.reads() && AccessMode::ReadWrite.writes());
        assert!(AccessMode::Redux.is_relaxed());
        assert!(AccessMode::Scratch.is_relaxed());
        assert!(!AccessMode::ReadWrite.is_relaxed());
    }

    #[test]
    fn test_merge() {
        assert_eq!(AccessMode::Read.merge(AccessMode::Read), AccessMode::Read);
        assert_eq!(AccessMode::Read.merge(AccessMode::Write), AccessMode::ReadWrite);
        assert_eq!(AccessMode::Write.merge(AccessMode::Write), AccessMode::Write);
        assert_eq!(AccessMode::ReadWrite.merge(AccessMode::Read), AccessMode::ReadWrite);
    }
}
