//! Standard exit codes for CLI operations
//!
//! These exit codes follow Unix conventions and sysexits.h where applicable.

#![allow(dead_code)]

/// Success - operation completed without errors
pub const SUCCESS: i32 = 0;

/// General error - unspecified failure, including failed releases
pub const ERROR: i32 = 1;

/// Diff found changes (only with `--detailed-exitcode`)
pub const DIFF_CHANGES: i32 = 2;

/// Template error - a state file or release field failed to render
pub const TEMPLATE_ERROR: i32 = 3;

/// State error - invalid state file, environment, selector or dependency graph
pub const STATE_ERROR: i32 = 4;

/// IO error - file not found, permission denied, etc.
pub const IO_ERROR: i32 = 5;

/// Usage error - invalid arguments or options (following sysexits.h convention)
pub const USAGE_ERROR: i32 = 64;

/// Internal software error (following sysexits.h convention)
pub const INTERNAL_ERROR: i32 = 70;
