//! Process-level helpers for services built on temit.

pub mod bootstrap;
