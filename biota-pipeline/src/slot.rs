//! The two physical copies of the published observation set.

use std::fmt;

/// One of the two index instances.
///
/// Readers always see the active slot; a run writes into the other one and
/// flips the activation record when it finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InstanceSlot {
    /// Slot `0`, active on a fresh installation.
    Zero,
    /// Slot `1`.
    One,
}

impl InstanceSlot {
    /// The slot that is not `self`.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Zero => Self::One,
            Self::One => Self::Zero,
        }
    }

    /// Integer tag stored in SQLite.
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        match self {
            Self::Zero => 0,
            Self::One => 1,
        }
    }

    /// Decode a stored tag, returning `None` for anything but `0` or `1`.
    #[must_use]
    pub const fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Zero),
            1 => Some(Self::One),
            _ => None,
        }
    }
}

impl fmt::Display for InstanceSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(InstanceSlot::Zero, InstanceSlot::One)]
    #[case(InstanceSlot::One, InstanceSlot::Zero)]
    fn opposite_flips_and_round_trips(#[case] slot: InstanceSlot, #[case] other: InstanceSlot) {
        assert_eq!(slot.opposite(), other);
        assert_eq!(slot.opposite().opposite(), slot);
        assert_eq!(InstanceSlot::from_i64(slot.as_i64()), Some(slot));
    }

    #[rstest]
    #[case(-1)]
    #[case(2)]
    fn unknown_tags_are_rejected(#[case] tag: i64) {
        assert_eq!(InstanceSlot::from_i64(tag), None);
    }
}
