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

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::Error;

/// One logical file or directory to archive.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BackupEntry {
    /// Absolute path of the file or directory on disk.
    pub source_path: PathBuf,
    /// Recursive disk usage of `source_path`, in bytes.
    pub size_bytes: u64,
    /// Namespace prefix inside the archive. Either empty or ends in `/`.
    pub archive_subdir: String,
}

impl BackupEntry {
    /// Validates the `archive_subdir` shape invariant: empty, or ends in `/`.
    pub fn validate(&self) -> Result<(), Error> {
        if !self.archive_subdir.is_empty() && !self.archive_subdir.ends_with('/') {
            return Err(Error::PlanInvalid {
                detail: format!(
                    "archive_subdir \"{}\" is non-empty and does not end in '/'",
                    self.archive_subdir
                ),
            });
        }
        Ok(())
    }

    /// Basename of `source_path`, used as the outer archive member name.
    pub fn member_name(&self) -> Result<&str, Error> {
        self.source_path
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::PlanInvalid {
                detail: format!("entry path \"{}\" has no file name", self.source_path.display()),
            })
    }
}

/// An ordered sequence of [`BackupEntry`], consumed once, in order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BackupPlan {
    pub entries: Vec<BackupEntry>,
}

impl BackupPlan {
    /// Total size across all entries, in bytes.
    pub fn total_size_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size_bytes).sum()
    }

    /// Validates every entry's `archive_subdir` shape and the
    /// `encrypted ∧ compressed` exclusion on the given header.
    pub fn validate(&self, header: &BackupHeader) -> Result<(), Error> {
        for entry in &self.entries {
            entry.validate()?;
        }
        header.validate()
    }
}

/// The backup-header record: algorithm identifiers and flags declared at the
/// head of the send queue, ahead of any data chunk.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BackupHeader {
    pub hmac_algorithm: String,
    pub crypto_algorithm: String,
    pub encrypted: bool,
    pub compressed: bool,
}

impl BackupHeader {
    /// Rejects `encrypted ∧ compressed`: compression-by-cipher is
    /// unimplemented, so both at once is a hard error on the write path.
    pub fn validate(&self) -> Result<(), Error> {
        if self.encrypted && self.compressed {
            return Err(Error::PlanInvalid {
                detail: "encrypted and compressed cannot both be requested".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for BackupHeader {
    fn default() -> Self {
        BackupHeader {
            hmac_algorithm: "sha256".to_string(),
            crypto_algorithm: "aes-256-cbc".to_string(),
            encrypted: false,
            compressed: false,
        }
    }
}

/// A reference to one chunk on disk: `<logical-path>.NNN`, plus its sibling
/// `<logical-path>.NNN.hmac`.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ChunkRef {
    logical: String,
    index: u32,
}

impl ChunkRef {
    /// The first chunk of a logical file, `.000`.
    pub fn first(logical: impl Into<String>) -> Self {
        ChunkRef {
            logical: logical.into(),
            index: 0,
        }
    }

    /// The chunk following this one, same logical prefix, `index + 1`.
    pub fn next(&self) -> Self {
        ChunkRef {
            logical: self.logical.clone(),
            index: self.index + 1,
        }
    }

    /// Name of the logical file this chunk belongs to.
    pub fn logical(&self) -> &str {
        &self.logical
    }

    /// Zero-based chunk index within the logical file.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Reports whether this is the first chunk (`.000`) of a logical file.
    pub fn is_first(&self) -> bool {
        self.index == 0
    }

    /// Path of the accompanying HMAC file: this chunk's name with `.hmac`
    /// appended.
    pub fn hmac_file_name(&self) -> String {
        format!("{self}.hmac")
    }

    /// Parses a chunk filename of the form `<logical>.NNN`. Returns `None`
    /// if the trailing component is not exactly three decimal digits.
    pub fn parse(name: &str) -> Option<Self> {
        let (logical, suffix) = name.rsplit_once('.')?;
        if suffix.len() != 3 || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let index: u32 = suffix.parse().ok()?;
        Some(ChunkRef {
            logical: logical.to_string(),
            index,
        })
    }

    /// Parses a `.hmac` filename, stripping the trailing `.hmac` suffix
    /// before delegating to [`ChunkRef::parse`].
    pub fn parse_hmac_name(name: &str) -> Option<Self> {
        let chunk_name = name.strip_suffix(".hmac")?;
        Self::parse(chunk_name)
    }
}

impl fmt::Display for ChunkRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:03}", self.logical, self.index)
    }
}

/// How a single VM is handled on restore.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VmSelection {
    Restore,
    SkipExcluded,
    SkipAlreadyExists,
    SkipMissingTemplate,
    SkipMissingNetvm,
}

/// Resolved restore options, defaults matching the original implementation's
/// `backup_restore_set_defaults`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RestoreOptions {
    pub use_default_template: bool,
    pub use_default_netvm: bool,
    pub use_none_netvm: bool,
    pub dom0_home: bool,
    pub ignore_dom0_username_mismatch: bool,
    pub exclude_list: Vec<String>,
    pub replace_template: Vec<String>,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        RestoreOptions {
            use_default_template: false,
            use_default_netvm: false,
            use_none_netvm: false,
            dom0_home: true,
            ignore_dom0_username_mismatch: false,
            exclude_list: Vec::new(),
            replace_template: Vec::new(),
        }
    }
}

/// Map from VM name to its resolved selection, plus template/netvm
/// remapping and restore-wide options.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RestorePlan {
    pub selections: HashMap<String, VmSelection>,
    pub template_remap: HashMap<String, String>,
    pub netvm_remap: HashMap<String, String>,
    pub options: RestoreOptions,
}

impl RestorePlan {
    /// Reports whether `vm_name` is selected for restore.
    pub fn is_selected(&self, vm_name: &str) -> bool {
        matches!(self.selections.get(vm_name), Some(VmSelection::Restore))
    }

    /// Number of VMs slated for restore (used in the `UPDATES_MAX_FILES`
    /// budget).
    pub fn restore_count(&self) -> usize {
        self.selections
            .values()
            .filter(|s| matches!(s, VmSelection::Restore))
            .count()
    }
}

/// Checks whether `location` holds a legacy format-version-1 backup: a flat
/// directory with `qubes.xml` directly present at its top.
pub fn is_legacy_format(location: &Path) -> bool {
    location.join("qubes.xml").is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_ref_round_trips_through_display_and_parse() {
        let c = ChunkRef::first("vm1/private.img");
        assert_eq!(c.to_string(), "vm1/private.img.000");
        assert_eq!(c.hmac_file_name(), "vm1/private.img.000.hmac");

        let parsed = ChunkRef::parse(&c.to_string()).unwrap();
        assert_eq!(parsed, c);
        assert!(parsed.is_first());

        let next = c.next();
        assert_eq!(next.to_string(), "vm1/private.img.001");
        assert!(!next.is_first());
    }

    #[test]
    fn chunk_ref_rejects_non_numeric_suffix() {
        assert!(ChunkRef::parse("backup-header").is_none());
        assert!(ChunkRef::parse("vm1/private.img.abc").is_none());
    }

    #[test]
    fn header_rejects_encrypted_and_compressed() {
        let header = BackupHeader {
            encrypted: true,
            compressed: true,
            ..BackupHeader::default()
        };
        assert!(header.validate().is_err());
    }

    #[test]
    fn entry_requires_trailing_slash_subdir() {
        let mut entry = BackupEntry {
            source_path: PathBuf::from("/home/user/vm1"),
            size_bytes: 0,
            archive_subdir: "vm1".to_string(),
        };
        assert!(entry.validate().is_err());
        entry.archive_subdir = "vm1/".to_string();
        assert!(entry.validate().is_ok());
    }
}
