//! Cadence CLI library: the command implementations behind the `cadence`
//! binary, exposed so integration tests can drive them directly.

pub mod commands;
