//! Command shell over the engine and the mount adapter.

mod repl;

pub use repl::{Outcome, Repl, ReplConfig, ShellError, ShellResult};
