use std::fmt;

/// What a tick should do with the crawl, derived fresh from the stored pass
/// count and the number of items still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassState {
    /// Items are still in flight for `pass`; dispatch workers and wait.
    Active { pass: u32, outstanding: u64 },
    /// The pass drained and more passes remain; failures go around again.
    Resubmit { next_pass: u32 },
    /// The last pass drained; aggregate and freeze the crawl record.
    Finalizing { final_pass: u32 },
    /// Already finalized. Every further tick is a silent no-op.
    Terminal,
}

impl PassState {
    #[must_use]
    pub fn evaluate(passes: u32, max_passes: u32, outstanding: u64) -> Self {
        if passes >= max_passes {
            return Self::Terminal;
        }
        if outstanding > 0 {
            return Self::Active { pass: passes, outstanding };
        }

        let next_pass = passes + 1;
        if next_pass < max_passes {
            Self::Resubmit { next_pass }
        } else {
            Self::Finalizing { final_pass: next_pass }
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active { .. } => "active",
            Self::Resubmit { .. } => "resubmit",
            Self::Finalizing { .. } => "finalizing",
            Self::Terminal => "terminal",
        }
    }
}

impl fmt::Display for PassState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
