//! Test support for primer-orca: job fixtures, a scripted optimizer, an
//! event recorder and a harness wiring them to the in-memory backends.

pub mod events;
pub mod harness;
pub mod job;
pub mod mock;

pub use events::RecordingEvents;
pub use harness::Harness;
pub use job::{JobFixture, OUT_PRIMERS, OUT_SCORES, INIT_PRIMERS, INIT_SCORES};
pub use mock::{Script, ScriptedProcessRunner};
