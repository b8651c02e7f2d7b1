// SPDX-License-Identifier: Apache-2.0

//! Configuration file parsing, command-line helpers, and logger setup.

/// Command-line interface parsing.
pub mod cli;
/// Configuration file parsing and management.
pub mod config;
/// Enumerations used in configuration.
pub mod enums;
/// Hand-written INI reader for the original framework's `.conf` grammar.
pub mod ini;
/// Logger initialization.
pub mod logger;
