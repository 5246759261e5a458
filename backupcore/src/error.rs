// backupcore is the library implementing the chunked backup archive engine.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// An `Error` indicates a failure of the backup or restore pipeline.
///
/// Every variant corresponds to one of the error kinds a worker may report;
/// any error aborts the whole operation, and the working directory is always
/// removed on the way out regardless of which variant fired.
#[derive(Debug, Error)]
pub enum Error {
    /// The plan failed validation before any stage was started.
    #[error("invalid plan: {detail}")]
    PlanInvalid {
        /// Human-readable description of the violated invariant.
        detail: String,
    },

    /// A named child stage exited non-zero or died.
    #[error("stage \"{stage}\" failed")]
    StageFailure {
        /// Name of the failing stage, e.g. `"hmac"`, `"cipher"`, `"archive"`.
        stage: String,
    },

    /// An HMAC mismatch or malformed HMAC file. Always fatal.
    #[error("authentication failure on \"{}\"", path.display())]
    AuthFailure {
        /// Path of the chunk (or header file) whose HMAC did not verify.
        path: PathBuf,
    },

    /// The backup header failed to parse, or no HMAC algorithm verified it.
    #[error("corrupt header: {detail}")]
    CorruptHeader {
        /// Human-readable description of the parse failure.
        detail: String,
    },

    /// A read or write on the transport byte stream failed.
    #[error("transport error: {0}")]
    TransportError(#[from] io::Error),

    /// The demultiplexer closed before the end-of-stream sentinel, with a
    /// chunk still pending.
    #[error("stream ended prematurely after \"{last_name}\"")]
    PrematureEnd {
        /// Name of the last member observed before the stream closed.
        last_name: String,
    },

    /// The archive reader reported non-zero on finishing a logical file.
    #[error("extraction of \"{logical}\" failed")]
    ExtractError {
        /// Name of the logical file being extracted.
        logical: String,
    },

    /// The caller requested termination of an in-progress operation.
    #[error("operation cancelled")]
    Cancelled,
}

/// Convenience alias for `backupcore` operations.
pub type Result<T> = std::result::Result<T, Error>;
