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

use std::io::{Read, Write};
use std::process::Child;

use crate::Error;

/// Minimum block size for [`PipelineRunner::supervise`] reads.
pub const MIN_BLOCK_SIZE: usize = 256 * 1024;

/// A child process participating in a pipeline, tagged with the stage name
/// that appears in [`Error::StageFailure`].
pub struct NamedChild {
    pub name: String,
    pub child: Child,
}

impl NamedChild {
    pub fn new(name: impl Into<String>, child: Child) -> Self {
        NamedChild {
            name: name.into(),
            child,
        }
    }

    fn poll_failure(&mut self) -> Result<Option<Error>, Error> {
        match self.child.try_wait().map_err(Error::TransportError)? {
            Some(status) if !status.success() => Ok(Some(Error::StageFailure {
                stage: self.name.clone(),
            })),
            _ => Ok(None),
        }
    }
}

/// Polls every stage once, returning the first failure observed. Exposed so
/// callers outside this module (e.g. the orchestrator's chunked backup path)
/// can interleave the same failure check between their own block reads.
pub fn poll_any_failure(stages: &mut [NamedChild]) -> Result<Option<Error>, Error> {
    for stage in stages.iter_mut() {
        if let Some(err) = stage.poll_failure()? {
            return Ok(Some(err));
        }
    }
    Ok(None)
}

/// Best-effort termination of every stage: sends a kill signal, then waits,
/// ignoring errors from either step. Used on the cooperative-cancellation
/// path when any stage or the control thread itself fails.
pub fn terminate_all(stages: &mut [NamedChild]) {
    for stage in stages.iter_mut() {
        let _ = stage.child.kill();
        let _ = stage.child.wait();
    }
}

/// Supervises a linear chain of child processes connected by pipes, pumping
/// bytes from `in_stream` to `out_stream` (and, if present, to an
/// authenticator stage's stdin) in fixed-size blocks.
pub struct PipelineRunner {
    block_size: usize,
}

impl Default for PipelineRunner {
    fn default() -> Self {
        PipelineRunner {
            block_size: MIN_BLOCK_SIZE,
        }
    }
}

impl PipelineRunner {
    /// Creates a runner with a larger-than-minimum block size. Panics if
    /// `block_size < MIN_BLOCK_SIZE`.
    pub fn with_block_size(block_size: usize) -> Self {
        assert!(block_size >= MIN_BLOCK_SIZE);
        PipelineRunner { block_size }
    }

    /// Pumps bytes from `in_stream` to `out_stream` until the producer
    /// closes its output, forwarding a copy to `auth_sink` along the way.
    ///
    /// `producer_name` identifies which entry of `stages` must have exited
    /// zero for the pump to report success; the remaining stages (e.g. a
    /// restore-side VM helper whose lifecycle the caller manages separately)
    /// are polled for failure but not required to have exited.
    pub fn supervise(
        &self,
        producer_name: &str,
        stages: &mut [NamedChild],
        mut in_stream: impl Read,
        mut out_stream: impl Write,
        mut auth_sink: Option<&mut dyn Write>,
    ) -> Result<(), Error> {
        let mut buf = vec![0u8; self.block_size];

        loop {
            for stage in stages.iter_mut() {
                if let Some(err) = stage.poll_failure()? {
                    terminate_all(stages);
                    return Err(err);
                }
            }

            let n = in_stream.read(&mut buf).map_err(Error::TransportError)?;
            if n == 0 {
                break;
            }

            out_stream.write_all(&buf[..n]).map_err(Error::TransportError)?;
            if let Some(sink) = auth_sink.as_deref_mut() {
                sink.write_all(&buf[..n]).map_err(Error::TransportError)?;
            }
        }

        for stage in stages.iter_mut() {
            if stage.name == producer_name {
                let status = stage.child.wait().map_err(Error::TransportError)?;
                if !status.success() {
                    return Err(Error::StageFailure {
                        stage: producer_name.to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    fn spawn(bin: &str, name: &str) -> NamedChild {
        let child = Command::new(bin)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        NamedChild::new(name, child)
    }

    #[test]
    fn reports_failure_of_monitored_stage() {
        let mut stages = vec![spawn("/bin/false", "hmac")];
        // Give the child a moment to exit before the first poll.
        std::thread::sleep(std::time::Duration::from_millis(50));

        let runner = PipelineRunner::default();
        let result = runner.supervise(
            "producer",
            &mut stages,
            std::io::empty(),
            std::io::sink(),
            None,
        );

        assert!(matches!(result, Err(Error::StageFailure { stage }) if stage == "hmac"));
    }

    #[test]
    fn succeeds_when_producer_exits_cleanly_and_input_drains() {
        let mut stages = vec![spawn("/bin/true", "producer")];
        std::thread::sleep(std::time::Duration::from_millis(50));

        let runner = PipelineRunner::default();
        let result = runner.supervise(
            "producer",
            &mut stages,
            std::io::empty(),
            std::io::sink(),
            None,
        );

        assert!(result.is_ok());
    }

    #[test]
    fn forwards_bytes_to_both_outputs() {
        let runner = PipelineRunner::with_block_size(MIN_BLOCK_SIZE);
        let input = b"hello pipeline".to_vec();
        let mut out = Vec::new();
        let mut auth = Vec::new();
        let mut stages: Vec<NamedChild> = Vec::new();

        runner
            .supervise(
                "producer",
                &mut stages,
                &input[..],
                &mut out,
                Some(&mut auth),
            )
            .unwrap();

        assert_eq!(out, input);
        assert_eq!(auth, input);
    }
}
