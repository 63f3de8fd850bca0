//! Everything that knows about the portal: its markup, how its session
//! behaves, and the two scrape protocols run against it.

pub mod dates;
pub mod query;
pub mod selectors;
pub mod session;
#[cfg(any(test, feature = "fake"))]
pub mod testing;

pub use dates::{DateRange, FollowUp, QueryKind, ResolvedQuery, follow_up, resolve};
pub use query::{AchievementRecord, PvResult, QueryEngine, QueryError, parse_pv};
pub use session::{SessionController, SessionError, SessionLease, SessionState};
