//! CLI subcommands for the `atlas` binary.

pub mod cards;
pub mod evidence;
pub mod run;
pub mod serve;
