// ABOUTME: Command implementations behind the CLI subcommands
// ABOUTME: Exports migrate, status, and reset commands

pub mod migrate;
pub mod reset;
pub mod status;

pub use migrate::migrate;
pub use reset::reset;
pub use status::status;
