//! # Cascade
//! A cascade says which backends an operation may touch. Its bits are tiers: the local cache and the remote API.

use std::ops::BitOr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Cascade(u8);

impl Cascade {
    pub const NONE: Cascade = Cascade(0);
    pub const LOCAL: Cascade = Cascade(1);
    pub const REMOTE: Cascade = Cascade(2);
    pub const ALL: Cascade = Cascade(3);

    pub fn can(self, tier: Cascade) -> bool {
        self.0 & tier.0 != 0
    }

    pub fn without(self, tier: Cascade) -> Cascade {
        Cascade(self.0 & !tier.0)
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl Default for Cascade {
    fn default() -> Self {
        Cascade::ALL
    }
}

impl BitOr for Cascade {
    type Output = Cascade;

    fn bitor(self, rhs: Cascade) -> Cascade {
        Cascade(self.0 | rhs.0)
    }
}
