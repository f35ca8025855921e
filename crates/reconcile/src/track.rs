//! Revision tracker: decides whether a cycle should run at all.

use std::time::Duration;

/// Outcome of the entry check. `Proceed` still fires periodically with an
/// unchanged revision so drift gets healed by the interval poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Proceed,
    SkipSuspended,
    /// Revision already attempted and the interval has not elapsed.
    SkipUpToDate { retry_in: Duration },
    /// Minimum-interval throttle; applies even to new revisions.
    SkipTooSoon { retry_in: Duration },
}

/// `elapsed` is time since the last attempt, `None` when unknown (first
/// attempt, or process restart); unknown elapsed never blocks a cycle.
pub fn decide(
    current_revision: &str,
    last_attempted: Option<&str>,
    suspend: bool,
    elapsed: Option<Duration>,
    interval: Duration,
    min_interval: Duration,
) -> Decision {
    if suspend {
        return Decision::SkipSuspended;
    }
    if let Some(el) = elapsed {
        if el < min_interval {
            return Decision::SkipTooSoon { retry_in: min_interval - el };
        }
    }
    if last_attempted != Some(current_revision) {
        return Decision::Proceed;
    }
    match elapsed {
        None => Decision::Proceed,
        Some(el) if el >= interval => Decision::Proceed,
        Some(el) => Decision::SkipUpToDate { retry_in: interval - el },
    }
}
