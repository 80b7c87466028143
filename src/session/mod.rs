//! Write session tracking for open-for-write handles.
//!
//! A commit's files must be written front to back: the bytes of a file are
//! whatever its writes cover, and a file with holes or rewritten ranges is
//! rejected. Each write handle carries a [`WriteSession`] that records every
//! write and checks the pattern when the handle closes.

mod error;
mod tracker;

pub use error::{ContiguityError, ContiguityResult};
pub use tracker::{WriteInterval, WriteSession};
