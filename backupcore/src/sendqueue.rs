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
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};

use crate::config::ToolConfig;
use crate::Error;

/// Capacity of the bounded FIFO between the chunker and the transport
/// writer.
pub const CAPACITY: usize = 10;

/// Replaces the `"FINISHED"`/`"ERROR"` in-band sentinels with a typed sum:
/// a filename to send, a clean end-of-stream marker, or a request to abort.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SendMessage {
    Data(PathBuf),
    Done,
    Abort,
}

/// Creates the bounded channel a [`ChunkWriter`](crate::chunk::ChunkWriter)
/// feeds and a send worker drains.
pub fn channel() -> (SyncSender<SendMessage>, Receiver<SendMessage>) {
    sync_channel(CAPACITY)
}

/// Drains `rx`, archiving and transmitting each named file until `Done` or
/// `Abort` is received.
///
/// For each filename: invokes the outer archive tool with `create`,
/// `to-stdout`, `posix-format`, one member, relative to `working_dir`, and
/// pipes its stdout to `transport`. Exit code 1 is a non-fatal warning (the
/// worker continues); exit code 2 or higher aborts with `TransportError`.
/// The source file is deleted after a successful send.
pub fn run(
    cfg: &ToolConfig,
    working_dir: &Path,
    rx: &Receiver<SendMessage>,
    mut transport: impl Write,
) -> Result<(), Error> {
    loop {
        match rx.recv() {
            Ok(SendMessage::Data(path)) => {
                send_one(cfg, working_dir, &path, &mut transport)?;
                fs::remove_file(&path).map_err(Error::TransportError)?;
            }
            Ok(SendMessage::Done) | Err(_) => return Ok(()),
            Ok(SendMessage::Abort) => return Err(Error::Cancelled),
        }
    }
}

fn send_one(cfg: &ToolConfig, working_dir: &Path, path: &Path, transport: &mut impl Write) -> Result<(), Error> {
    // Relative to `working_dir`, not just the bare file name: a chunk
    // belonging to a namespaced logical name (e.g. `vmname/private.img.000`)
    // lives in a same-named subdirectory, and that subdirectory must come
    // along into the archive member's path for the restore side's per-VM
    // filter to be able to select it by name.
    let name = path
        .strip_prefix(working_dir)
        .ok()
        .and_then(|p| p.to_str())
        .ok_or_else(|| Error::TransportError(
            io::Error::new(io::ErrorKind::InvalidInput, "send queue entry has no file name"),
        ))?;

    let mut child = Command::new(&cfg.archive_tool)
        .arg("-cO")
        .arg("--posix")
        .arg(name)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(Error::TransportError)?;

    let mut stdout = child.stdout.take().ok_or_else(|| Error::StageFailure {
        stage: "archive".to_string(),
    })?;
    io::copy(&mut stdout, transport).map_err(Error::TransportError)?;
    drop(stdout);

    let status = child.wait().map_err(Error::TransportError)?;
    match status.code() {
        Some(0) | Some(1) => Ok(()),
        other => Err(Error::TransportError(io::Error::new(
            io::ErrorKind::Other,
            format!("archive tool exited with code {other:?}"),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_stops_on_done() {
        let (tx, rx) = channel();
        tx.send(SendMessage::Done).unwrap();

        let cfg = ToolConfig::default();
        let dir = tempfile::tempdir().unwrap();
        let result = run(&cfg, dir.path(), &rx, io::sink());
        assert!(result.is_ok());
    }

    #[test]
    fn worker_propagates_abort() {
        let (tx, rx) = channel();
        tx.send(SendMessage::Abort).unwrap();

        let cfg = ToolConfig::default();
        let dir = tempfile::tempdir().unwrap();
        let result = run(&cfg, dir.path(), &rx, io::sink());
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
