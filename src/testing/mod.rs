//! Testing infrastructure for taskline.
//!
//! - **Mocks**: [`MockAgent`] and [`MockCheckpointer`] stand in for the
//!   agent and version-control seams, sharing an optional [`EventLog`] so
//!   tests can assert the order of side effects
//! - **Fixtures**: [`UnitFixture`] lays out a unit directory with a ledger
//!
//! # Example
//!
//! ```rust,ignore
//! use taskline::testing::{EventLog, MockAgent, MockCheckpointer};
//!
//! let events = EventLog::new();
//! let agent = MockAgent::new()
//!     .with_failures("# Task A", 1, "tests failed")
//!     .with_events(events.clone());
//! let vcs = MockCheckpointer::new().with_events(events.clone());
//! ```

pub mod fixtures;
pub mod mocks;

pub use fixtures::*;
pub use mocks::*;
