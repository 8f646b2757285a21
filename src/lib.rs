//! meshresponder library
//!
//! Trigger-driven auto responder for mesh radio networks: matches incoming
//! text messages against author-defined patterns, produces replies from static
//! text or sandboxed scripts, and paces them onto the shared radio channel.

pub mod autoreply;
pub mod cli;
pub mod config;
pub mod logging;
pub mod messages;
pub mod scripts;
