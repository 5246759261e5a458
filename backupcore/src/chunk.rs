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

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};

use subtle::ConstantTimeEq;

use crate::config::ToolConfig;
use crate::header::parse_auth_token;
use crate::model::ChunkRef;
use crate::pipeline::MIN_BLOCK_SIZE;
use crate::Error;

/// Spawns the digest tool in HMAC mode, stdin piped in, stdout piped out.
/// Shared between [`ChunkWriter`]/[`ChunkReader`] and `header::HeaderCodec`.
pub fn spawn_digest(cfg: &ToolConfig, algorithm: &str, passphrase: &str) -> Result<Child, Error> {
    Command::new(&cfg.digest_tool)
        .arg("dgst")
        .arg(format!("-{algorithm}"))
        .arg("-hmac")
        .arg(passphrase)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(Error::TransportError)
}

fn finish_digest(mut child: Child, stage: &str) -> Result<String, Error> {
    let mut out = String::new();
    child
        .stdout
        .take()
        .ok_or_else(|| Error::StageFailure {
            stage: stage.to_string(),
        })?
        .read_to_string(&mut out)
        .map_err(Error::TransportError)?;

    let status = child.wait().map_err(Error::TransportError)?;
    if !status.success() {
        return Err(Error::StageFailure {
            stage: stage.to_string(),
        });
    }

    Ok(out)
}

/// A reader that reads at most `limit` bytes from `inner`, tracking whether
/// it hit that limit or ran dry first. Used to carve one chunk's worth of
/// bytes out of the continuous stream coming off the named pipe.
struct BoundedReader<R> {
    inner: R,
    remaining: u64,
}

impl<R: Read> BoundedReader<R> {
    fn new(inner: R, limit: u64) -> Self {
        BoundedReader { inner, remaining: limit }
    }
}

impl<R: Read> Read for BoundedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let cap = buf.len().min(self.remaining as usize);
        let n = self.inner.read(&mut buf[..cap])?;
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Splits a byte stream into fixed-size chunks on disk, with a sibling
/// `.hmac` file per chunk, handing completed pairs off to the send queue.
pub struct ChunkWriter<'a> {
    cfg: &'a ToolConfig,
    target_dir: &'a Path,
    logical: String,
    passphrase: String,
    hmac_algorithm: String,
    chunk_size: u64,
}

/// Outcome of writing one chunk.
pub struct WrittenChunk {
    pub chunk_ref: ChunkRef,
    pub chunk_path: std::path::PathBuf,
    pub hmac_path: std::path::PathBuf,
    /// Whether this was a full chunk (more data may follow) or a short
    /// final chunk (the logical file is complete).
    pub is_final: bool,
}

impl<'a> ChunkWriter<'a> {
    pub fn new(
        cfg: &'a ToolConfig,
        target_dir: &'a Path,
        logical: impl Into<String>,
        passphrase: impl Into<String>,
        hmac_algorithm: impl Into<String>,
    ) -> Self {
        ChunkWriter {
            cfg,
            target_dir,
            logical: logical.into(),
            passphrase: passphrase.into(),
            hmac_algorithm: hmac_algorithm.into(),
            chunk_size: cfg.chunk_size_bytes,
        }
    }

    /// Writes one chunk worth of bytes (or fewer, at end of stream) from
    /// `in_stream`, computing its HMAC and writing the sibling `.hmac` file.
    /// Returns `Ok(None)` if `in_stream` was already at EOF (no data left at
    /// all for this chunk index — the caller should not release a volume).
    pub fn write_chunk(
        &self,
        chunk_ref: &ChunkRef,
        mut in_stream: impl Read,
    ) -> Result<Option<WrittenChunk>, Error> {
        let chunk_path = self.target_dir.join(chunk_ref.to_string());
        let hmac_path = self.target_dir.join(chunk_ref.hmac_file_name());

        let mut digest = spawn_digest(self.cfg, &self.hmac_algorithm, &self.passphrase)?;
        let mut digest_stdin = digest
            .stdin
            .take()
            .ok_or_else(|| Error::StageFailure {
                stage: "hmac".to_string(),
            })?;

        if let Some(parent) = chunk_path.parent() {
            fs::create_dir_all(parent).map_err(Error::TransportError)?;
        }
        let mut chunk_file = File::create(&chunk_path).map_err(Error::TransportError)?;

        let mut bounded = BoundedReader::new(&mut in_stream, self.chunk_size);
        let mut buf = vec![0u8; MIN_BLOCK_SIZE];
        let mut total = 0u64;

        loop {
            let n = bounded.read(&mut buf).map_err(Error::TransportError)?;
            if n == 0 {
                break;
            }
            chunk_file.write_all(&buf[..n]).map_err(Error::TransportError)?;
            digest_stdin.write_all(&buf[..n]).map_err(Error::TransportError)?;
            total += n as u64;
        }

        drop(digest_stdin);
        chunk_file.sync_all().map_err(Error::TransportError)?;

        if total == 0 {
            let _ = fs::remove_file(&chunk_path);
            let _ = digest.kill();
            let _ = digest.wait();
            return Ok(None);
        }

        let digest_out = finish_digest(digest, "hmac")?;
        fs::write(&hmac_path, digest_out).map_err(Error::TransportError)?;

        let is_final = total < self.chunk_size;

        Ok(Some(WrittenChunk {
            chunk_ref: chunk_ref.clone(),
            chunk_path,
            hmac_path,
            is_final,
        }))
    }
}

/// Inverse of [`ChunkWriter`]: verifies `(chunk, hmac)` pairs announced by an
/// untrusted demultiplexer before any byte reaches decrypt/decompress/
/// extract.
pub struct ChunkReader<'a> {
    cfg: &'a ToolConfig,
    passphrase: String,
    hmac_algorithm: String,
}

impl<'a> ChunkReader<'a> {
    pub fn new(cfg: &'a ToolConfig, passphrase: impl Into<String>, hmac_algorithm: impl Into<String>) -> Self {
        ChunkReader {
            cfg,
            passphrase: passphrase.into(),
            hmac_algorithm: hmac_algorithm.into(),
        }
    }

    /// Verifies a chunk against its `.hmac` file. On success the `.hmac` file
    /// is deleted and the chunk file is left on disk for the caller to feed
    /// to decrypt/decompress/extract and delete; on failure neither file is
    /// touched.
    ///
    /// This is the central reason the chunk layer exists: nothing downstream
    /// of this call ever sees a chunk's bytes until `ct_eq` confirms the
    /// recomputed HMAC matches, so a tampered chunk never reaches whatever
    /// the caller wires to decrypt/decompress/extract.
    pub fn verify_chunk(&self, chunk_path: &Path, hmac_path: &Path) -> Result<(), Error> {
        let expected_hmac_name = format!(
            "{}.hmac",
            chunk_path.file_name().and_then(|s| s.to_str()).unwrap_or_default()
        );
        if hmac_path.file_name().and_then(|s| s.to_str()) != Some(expected_hmac_name.as_str()) {
            return Err(Error::AuthFailure {
                path: hmac_path.to_path_buf(),
            });
        }

        let bytes = fs::read(chunk_path).map_err(Error::TransportError)?;
        let stored_line = fs::read_to_string(hmac_path).map_err(Error::TransportError)?;
        let stored_token = parse_auth_token(&stored_line).ok_or_else(|| Error::AuthFailure {
            path: hmac_path.to_path_buf(),
        })?;

        let mut digest = spawn_digest(self.cfg, &self.hmac_algorithm, &self.passphrase)?;
        digest
            .stdin
            .take()
            .ok_or_else(|| Error::StageFailure {
                stage: "hmac".to_string(),
            })?
            .write_all(&bytes)
            .map_err(Error::TransportError)?;
        let computed_line = finish_digest(digest, "hmac")?;
        let computed_token = parse_auth_token(&computed_line).ok_or_else(|| Error::AuthFailure {
            path: hmac_path.to_path_buf(),
        })?;

        if computed_token.as_bytes().ct_eq(stored_token.as_bytes()).into() {
            let _ = fs::remove_file(hmac_path);
            Ok(())
        } else {
            Err(Error::AuthFailure {
                path: hmac_path.to_path_buf(),
            })
        }
    }
}
