//! Halt Detector
//!
//! Decides whether a chain stopped exactly at the upgrade height.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::Height;

/// Outcome of comparing the observed height with the planned halt height
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HaltVerdict {
    /// Chain froze at the halt height
    Correct { height: Height },

    /// Chain kept producing blocks past the halt height with the old binary
    OverRun { expected: Height, observed: Height },

    /// Chain stopped below the halt height (consensus stalled)
    StalledEarly { expected: Height, observed: Height },

    /// Wait ended before its window closed without passing the halt height
    Inconclusive { expected: Height, observed: Height },
}

impl HaltVerdict {
    pub fn is_correct(&self) -> bool {
        matches!(self, HaltVerdict::Correct { .. })
    }
}

impl fmt::Display for HaltVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltVerdict::Correct { height } => write!(f, "halted at {}", height),
            HaltVerdict::OverRun { expected, observed } => {
                write!(f, "over-ran halt height {} (observed {})", expected, observed)
            }
            HaltVerdict::StalledEarly { expected, observed } => {
                write!(f, "stalled at {} before halt height {}", observed, expected)
            }
            HaltVerdict::Inconclusive { expected, observed } => write!(
                f,
                "inconclusive: wait ended early at {} (halt height {})",
                observed, expected
            ),
        }
    }
}

/// Classify a halt observation
///
/// `deadline_reached` is true when the wait for a block past the halt
/// height timed out, which is what a correct halt looks like.
pub fn classify(expected: Height, observed: Height, deadline_reached: bool) -> HaltVerdict {
    if observed > expected {
        return HaltVerdict::OverRun { expected, observed };
    }
    if !deadline_reached {
        return HaltVerdict::Inconclusive { expected, observed };
    }
    if observed == expected {
        HaltVerdict::Correct { height: observed }
    } else {
        HaltVerdict::StalledEarly { expected, observed }
    }
}
