//! Command trait definition for CLI commands.
//!
//! The trait uses `enum_dispatch` so `main` can call [`Command::execute`] on the parsed subcommand
//! without a hand-written match.

use anyhow::Result;
use enum_dispatch::enum_dispatch;

/// Trait implemented by every fgmarkdup subcommand.
///
/// `command_line` is the full invocation, recorded in the output's `@PG` header line.
#[enum_dispatch]
pub trait Command {
    #[allow(clippy::missing_errors_doc)]
    fn execute(&self, command_line: &str) -> Result<()>;
}
