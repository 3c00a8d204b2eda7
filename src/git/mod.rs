//! Wrappers around the system `git` binary.

pub mod commands;
