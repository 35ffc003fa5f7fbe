use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortFlags(u8);

impl PortFlags {
    pub const NONE: Self = Self(0);
    pub const IS_INPUT: Self = Self(1 << 0);
    pub const IS_OUTPUT: Self = Self(1 << 1);
    pub const IS_PHYSICAL: Self = Self(1 << 2);
    pub const IS_TERMINAL: Self = Self(1 << 3);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_input(self) -> bool {
        self.contains(Self::IS_INPUT)
    }

    pub const fn is_output(self) -> bool {
        self.contains(Self::IS_OUTPUT)
    }

    pub const fn is_physical(self) -> bool {
        self.contains(Self::IS_PHYSICAL)
    }

    pub const fn is_terminal(self) -> bool {
        self.contains(Self::IS_TERMINAL)
    }

    /// Exactly one of the direction bits is set.
    pub const fn has_direction(self) -> bool {
        self.is_input() != self.is_output()
    }
}

impl BitOr for PortFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for PortFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for PortFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Display for PortFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::with_capacity(4);
        if self.is_input() {
            names.push("input");
        }
        if self.is_output() {
            names.push("output");
        }
        if self.is_physical() {
            names.push("physical");
        }
        if self.is_terminal() {
            names.push("terminal");
        }
        write!(f, "{}", names.join("|"))
    }
}
