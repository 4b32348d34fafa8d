//! Error reporting for the whole crate.
//!
//! Every diagnostic this crate produces (lexing, assembling, linking,
//! executing, loading) implements the [`Error`] trait, which extends
//! [`std::error::Error`] with two reporting hooks:
//! - [`Error::line`]: the 1-indexed source line the diagnostic points at,
//!   when the error came out of a source file;
//! - [`Error::help`]: a hint on how to resolve the error.
//!
//! [`report`] renders an error in the standard form used by the
//! command-layer wrappers.

use std::borrow::Cow;

/// Unified error interface for this crate's diagnostics.
pub trait Error: std::error::Error {
    /// The 1-indexed source line this error is attributed to, if any.
    fn line(&self) -> Option<usize> {
        None
    }

    /// A hint on how to mitigate the error, if one is known.
    fn help(&self) -> Option<Cow<str>> {
        None
    }
}

/// Renders an error (with its line attribution and help text) into a
/// human-readable report.
pub fn report<E: Error + ?Sized>(err: &E) -> String {
    let mut out = String::new();

    match err.line() {
        Some(line) => out.push_str(&format!("error (line {line}): {err}")),
        None => out.push_str(&format!("error: {err}")),
    }
    if let Some(help) = err.help() {
        out.push_str(&format!("\n  help: {help}"));
    }

    out
}
