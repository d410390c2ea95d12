//! Buffer flag set.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// A set of boolean properties attached to a [`Buffer`](crate::Buffer).
///
/// # Example
///
/// ```
/// use stream_media::BufferFlags;
///
/// let mut flags = BufferFlags::DISCONT | BufferFlags::DELTA_UNIT;
/// assert!(flags.contains(BufferFlags::DISCONT));
/// flags.remove(BufferFlags::DISCONT);
/// assert!(!flags.contains(BufferFlags::DISCONT));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BufferFlags(u32);

impl BufferFlags {
    /// The buffer is read-only.
    pub const READONLY: Self = Self(1 << 0);
    /// The buffer is part of a preroll and should not be rendered.
    pub const PREROLL: Self = Self(1 << 1);
    /// The buffer marks a discontinuity in the stream.
    pub const DISCONT: Self = Self(1 << 2);
    /// The buffer carries header data also present in the stream caps.
    pub const IN_CAPS: Self = Self(1 << 3);
    /// The buffer contains no meaningful data (a gap in the stream).
    pub const GAP: Self = Self(1 << 4);
    /// The buffer cannot be decoded independently.
    pub const DELTA_UNIT: Self = Self(1 << 5);
    /// The buffer contains stream header data.
    pub const HEADER: Self = Self(1 << 6);
    /// The storage is not owned by the buffer and is never released.
    pub const DONT_FREE: Self = Self(1 << 7);

    const NAMES: [(Self, &'static str); 8] = [
        (Self::READONLY, "READONLY"),
        (Self::PREROLL, "PREROLL"),
        (Self::DISCONT, "DISCONT"),
        (Self::IN_CAPS, "IN_CAPS"),
        (Self::GAP, "GAP"),
        (Self::DELTA_UNIT, "DELTA_UNIT"),
        (Self::HEADER, "HEADER"),
        (Self::DONT_FREE, "DONT_FREE"),
    ];

    /// Returns an empty flag set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Returns the raw bit representation.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns `true` if no flag is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if all flags in `other` are set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets all flags in `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Clears all flags in `other`.
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Returns a copy of this set without the flags in `other`.
    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for BufferFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for BufferFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for BufferFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                set.entry(&format_args!("{name}"));
            }
        }
        set.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty() {
        let flags = BufferFlags::default();
        assert!(flags.is_empty());
        assert_eq!(flags.bits(), 0);
    }

    #[test]
    fn test_insert_remove() {
        let mut flags = BufferFlags::empty();
        flags.insert(BufferFlags::GAP);
        flags |= BufferFlags::HEADER;
        assert!(flags.contains(BufferFlags::GAP | BufferFlags::HEADER));
        flags.remove(BufferFlags::GAP);
        assert!(!flags.contains(BufferFlags::GAP));
        assert!(flags.contains(BufferFlags::HEADER));
    }

    #[test]
    fn test_without() {
        let flags = BufferFlags::DISCONT | BufferFlags::DONT_FREE;
        assert_eq!(flags.without(BufferFlags::DONT_FREE), BufferFlags::DISCONT);
    }

    #[test]
    fn test_debug_lists_names() {
        let debug = format!("{:?}", BufferFlags::DISCONT | BufferFlags::GAP);
        assert!(debug.contains("DISCONT"));
        assert!(debug.contains("GAP"));
        assert!(!debug.contains("HEADER"));
    }
}
