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

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use rand::Rng;
use tempfile::TempDir;

use crate::Error;

/// A process-private working directory holding one named pipe, used as the
/// channel between the outer archive stage and the chunker/dechunker.
///
/// Cleaned up on drop, on both the success and failure path: `TempDir`
/// removes its directory tree when it goes out of scope, which is what
/// makes the idempotent-cleanup invariant hold without the orchestrator
/// having to remember to call anything on the error path.
pub struct WorkingDir {
    dir: TempDir,
    pipe_path: PathBuf,
}

impl WorkingDir {
    /// Creates a fresh working directory under `root`, named-pipe included.
    pub fn new(root: impl AsRef<Path>, prefix: &str) -> Result<Self, Error> {
        let dir = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(root)
            .map_err(Error::TransportError)?;

        let pipe_path = dir.path().join(format!("stage-{}.fifo", random_hex(4)));
        mkfifo(&pipe_path, Mode::S_IRUSR | Mode::S_IWUSR)
            .map_err(|e| Error::TransportError(io::Error::from_raw_os_error(e as i32)))?;

        Ok(WorkingDir { dir, pipe_path })
    }

    /// Root of the working directory.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Path of the named pipe used to shuttle bytes between stages.
    pub fn pipe_path(&self) -> &Path {
        &self.pipe_path
    }
}

/// Computes the recursive disk usage of `path`, the way the original
/// implementation sizes dom0-home and VM directories for the backup plan and
/// the `UPDATES_MAX_BYTES` budget: `du -s --block-size=1`, i.e. actual
/// allocated disk-block usage, not `--apparent-size`/`stat`'s nominal size.
/// This matters for sparse VM disk images, which `ArchiveWriter` archives
/// with `--sparse`.
pub fn disk_usage(path: impl AsRef<Path>) -> Result<u64, Error> {
    let output = Command::new("du")
        .arg("-s")
        .arg("--block-size=1")
        .arg(path.as_ref())
        .stdin(Stdio::null())
        .output()
        .map_err(Error::TransportError)?;

    if !output.status.success() {
        return Err(Error::StageFailure {
            stage: "du".to_string(),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let first_field = stdout.split_whitespace().next().ok_or_else(|| Error::StageFailure {
        stage: "du".to_string(),
    })?;

    first_field.parse().map_err(|_| Error::StageFailure {
        stage: "du".to_string(),
    })
}

/// Recursively copies `src` onto `dst`, creating directories as needed. Used
/// for the format-version-1 restore path, which is a plain filesystem copy
/// rather than a chunked extraction.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<(), Error> {
    fs::create_dir_all(dst).map_err(Error::TransportError)?;

    for entry in fs::read_dir(src).map_err(Error::TransportError)? {
        let entry = entry.map_err(Error::TransportError)?;
        let file_type = entry.file_type().map_err(Error::TransportError)?;
        let target = dst.join(entry.file_name());

        if file_type.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            let link_target = std::fs::read_link(entry.path()).map_err(Error::TransportError)?;
            std::os::unix::fs::symlink(link_target, &target).map_err(Error::TransportError)?;
        } else {
            fs::copy(entry.path(), &target).map_err(Error::TransportError)?;
        }
    }

    Ok(())
}

/// `n` random bytes from the thread-local generator.
pub fn random_bytes(n: usize) -> Vec<u8> {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Standard)
        .take(n)
        .collect()
}

/// `n` random bytes, hex-encoded. Used for disambiguating transient file
/// names within a working directory.
pub fn random_hex(n: usize) -> String {
    random_bytes(n).iter().map(|b| format!("{b:02x}")).collect()
}
