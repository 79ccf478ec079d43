//! Stackfile Event - lifecycle hooks
//!
//! Hooks are declared on releases or on the whole state and fire on named
//! events. Commands are rendered as templates and run through a [`Runner`].

pub mod bus;
pub mod error;
pub mod runner;

pub use bus::Bus;
pub use error::{HookError, Result, RunError};
pub use runner::{Runner, ShellRunner};

/// Fired once per run before any chart is prepared
pub const PREPARE: &str = "prepare";
/// Fired before a release is installed or upgraded
pub const PRESYNC: &str = "presync";
/// Fired after a release sync, whether it succeeded or not
pub const POSTSYNC: &str = "postsync";
pub const PREUNINSTALL: &str = "preuninstall";
pub const POSTUNINSTALL: &str = "postuninstall";
/// Fired once per run after all work is done
pub const CLEANUP: &str = "cleanup";
