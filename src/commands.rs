//! Implementation of the CLI subcommands.

pub mod server;
