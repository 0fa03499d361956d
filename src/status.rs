use std::fmt::{Display, Formatter};
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

/// Lifecycle flags of an [`Exchange`](crate::exchange::Exchange).
///
/// The lifecycle is `CREATED -> IN_CHAIN -> (COMPLETED | FAILED) -> NOTIFIED`.
/// The terminal outcome flag is kept when `NOTIFIED` is added, so a notified
/// exchange still reports whether it succeeded.
#[derive(Clone, Copy, Debug)]
pub struct ExchangeState(pub i32);

impl ExchangeState {
    pub const CREATED: Self = Self(1);
    pub const IN_CHAIN: Self = Self(1 << 1);
    pub const COMPLETED: Self = Self(1 << 2);
    pub const FAILED: Self = Self(1 << 3);
    pub const NOTIFIED: Self = Self(1 << 4);

    pub fn any_flags(&self, flags: ExchangeState) -> bool {
        self.0 & flags.0 != 0
    }

    pub fn any_flags_clear(&self, flags: ExchangeState) -> bool {
        self.0 & flags.0 != flags.0
    }

    pub fn all_flags(&self, flags: ExchangeState) -> bool {
        self.0 & flags.0 == flags.0
    }

    pub fn all_flags_clear(&self, flags: ExchangeState) -> bool {
        self.0 & flags.0 == 0
    }

    pub fn is_in_chain(&self) -> bool {
        self.any_flags(ExchangeState::IN_CHAIN) && !self.is_terminal()
    }

    /// True once a success or failure outcome has been recorded.
    pub fn is_terminal(&self) -> bool {
        self.any_flags(ExchangeState::COMPLETED | ExchangeState::FAILED)
    }

    pub fn is_failed(&self) -> bool {
        self.any_flags(ExchangeState::FAILED)
    }

    pub fn is_notified(&self) -> bool {
        self.any_flags(ExchangeState::NOTIFIED)
    }

    /// Returns the state reached by entering a processor chain, or `None`
    /// when the exchange already reached a terminal state.
    pub fn enter_chain(self) -> Option<Self> {
        if self.is_terminal() || self.is_notified() {
            None
        } else {
            Some(ExchangeState::IN_CHAIN)
        }
    }

    /// Returns the terminal state for the given outcome. Terminal states are
    /// sticky: finishing twice keeps the first outcome.
    pub fn finish(self, failed: bool) -> Self {
        if self.is_terminal() {
            return self;
        }
        if failed {
            ExchangeState::FAILED
        } else {
            ExchangeState::COMPLETED
        }
    }
}

impl Display for ExchangeState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = if self.is_notified() {
            if self.is_failed() { "FAILED|NOTIFIED" } else { "COMPLETED|NOTIFIED" }
        } else if self.all_flags(ExchangeState::FAILED) {
            "FAILED"
        } else if self.all_flags(ExchangeState::COMPLETED) {
            "COMPLETED"
        } else if self.all_flags(ExchangeState::IN_CHAIN) {
            "IN_CHAIN"
        } else {
            "CREATED"
        };
        write!(f, "{}({:b})", name, self.0)
    }
}

impl PartialEq for ExchangeState {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for ExchangeState {}

impl BitOrAssign for ExchangeState {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0
    }
}

impl BitAndAssign for ExchangeState {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0
    }
}

impl Not for ExchangeState {
    type Output = Self;

    fn not(self) -> Self::Output {
        Self(!self.0)
    }
}

impl BitAnd for ExchangeState {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

impl BitOr for ExchangeState {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}
