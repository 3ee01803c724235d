//! Error taxonomy.
//!
//! Three kinds of failures surface from a handle: unsupported input
//! binaries, object format mismatches, and fat Mach-O shape violations.
//! Everything else (I/O, malformed archives, writer failures) is reported
//! through `anyhow` by the operation that hit it.

use thiserror::Error;

use crate::format::ObjectFormat;

/// Errors raised while ingesting binaries or emitting the final archive.
#[derive(Debug, Error)]
pub enum Error {
    /// The input is neither an object file, an archive of object files,
    /// nor a fat Mach-O container.
    #[error("error while reading binary: {0}")]
    UnsupportedBinary(String),

    /// An object disagrees with the format committed by earlier inputs.
    #[error("invalid object format type: expected {expected}, got {found}")]
    FormatMismatch {
        /// Format the handle is committed to.
        expected: ObjectFormat,
        /// Format of the offending object.
        found: ObjectFormat,
    },

    /// A fat Mach-O input broke one of the universal-binary rules.
    #[error("fat Mach-O error: {0}")]
    FatMachO(String),
}
