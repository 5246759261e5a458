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

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Error;

/// Size of one chunk, in bytes: 100 000 KiB, per the outer archive tool's
/// multi-volume `--tape-length` configuration.
pub const CHUNK_SIZE_BYTES: u64 = 100_000 * 1024;

/// A `ToolConfig` names the external tools the pipeline shells out to and the
/// defaults it assumes until a backup header overrides them.
///
/// Unlike a node-bound configuration file, this carries no fixed path: the
/// engine is a library, and the caller (CLI, daemon, or test harness) decides
/// where its copy lives.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Binary used for the digest tool, e.g. `"openssl"`.
    pub digest_tool: String,
    /// Binary used for the cipher tool, e.g. `"openssl"`.
    pub cipher_tool: String,
    /// Binary used for the compressor, e.g. `"gzip"`.
    pub compressor_tool: String,
    /// Binary used for the multi-volume outer archive tool, e.g. `"tar"`.
    pub archive_tool: String,
    /// Default HMAC algorithm identifier, e.g. `"sha256"`.
    pub hmac_algorithm: String,
    /// Default cipher algorithm identifier, e.g. `"aes-256-cbc"`.
    pub crypto_algorithm: String,
    /// Size of one chunk, in bytes.
    pub chunk_size_bytes: u64,
    /// Root directory under which per-run working directories are created.
    pub temp_root: PathBuf,
}

impl Default for ToolConfig {
    fn default() -> Self {
        ToolConfig {
            digest_tool: "openssl".to_string(),
            cipher_tool: "openssl".to_string(),
            compressor_tool: "gzip".to_string(),
            archive_tool: "tar".to_string(),
            hmac_algorithm: "sha256".to_string(),
            crypto_algorithm: "aes-256-cbc".to_string(),
            chunk_size_bytes: CHUNK_SIZE_BYTES,
            temp_root: PathBuf::from("/var/tmp"),
        }
    }
}

impl ToolConfig {
    /// Loads a `ToolConfig` from `path`.
    ///
    /// Rejects a configuration file whose permission bits reach beyond the
    /// owner, the same way a node configuration does.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let mut f = File::open(path)?;

        if f.metadata()?.permissions().mode() & 0o7077 > 0 {
            return Err(Error::PlanInvalid {
                detail: "config file permissions allow access beyond the owner".to_string(),
            });
        }

        let mut s = String::new();
        f.read_to_string(&mut s)?;

        toml::from_str(&s).map_err(|e| Error::CorruptHeader {
            detail: format!("malformed tool config: {e}"),
        })
    }

    /// Saves this `ToolConfig` to `path` with owner-only permissions.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let s = toml::to_string_pretty(self).map_err(|e| Error::CorruptHeader {
            detail: format!("unable to serialize tool config: {e}"),
        })?;

        let mut f = OpenOptions::new()
            .create(true)
            .read(false)
            .write(true)
            .append(false)
            .truncate(true)
            .mode(0o0600)
            .open(path)?;

        write!(f, "{s}")?;
        Ok(())
    }
}
