//! Lifecycle phases

use serde::{Deserialize, Serialize};

/// One of the eight ordered lifecycle stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum Phase {
    #[default]
    P0,
    P1,
    P2,
    P3,
    P4,
    P5,
    P6,
    P7,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::P0,
        Phase::P1,
        Phase::P2,
        Phase::P3,
        Phase::P4,
        Phase::P5,
        Phase::P6,
        Phase::P7,
    ];

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    /// The following phase; `None` for P7
    pub fn next(self) -> Option<Self> {
        Self::from_index(self.index() + 1)
    }

    pub fn is_terminal(self) -> bool {
        self == Phase::P7
    }

    pub fn title(self) -> &'static str {
        match self {
            Self::P0 => "Discovery",
            Self::P1 => "Specification",
            Self::P2 => "Design",
            Self::P3 => "Implementation",
            Self::P4 => "Testing",
            Self::P5 => "Review",
            Self::P6 => "Integration",
            Self::P7 => "Release",
        }
    }

    /// Phases strictly between `self` and `target`
    pub fn between(self, target: Phase) -> Vec<Phase> {
        let (lo, hi) = if self <= target { (self, target) } else { (target, self) };
        Self::ALL
            .iter()
            .copied()
            .filter(|p| *p > lo && *p < hi)
            .collect()
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "P{}", self.index())
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix('P')
            .or_else(|| trimmed.strip_prefix('p'))
            .unwrap_or(trimmed);
        if let Ok(n) = digits.parse::<u8>() {
            return Self::from_index(n).ok_or_else(|| format!("Unknown phase: {}. Use P0 through P7", s));
        }
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.title().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| format!("Unknown phase: {}. Use P0 through P7", s))
    }
}
