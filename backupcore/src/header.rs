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

use std::process::{Command, Stdio};

use subtle::ConstantTimeEq;

use crate::chunk::spawn_digest;
use crate::config::ToolConfig;
use crate::model::BackupHeader;
use crate::Error;

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

/// Parses the trailing hex token out of an HMAC-tool output line, e.g.
/// `SHA256(stdin)= deadbeef`: split on the first `=`, strip whitespace, take
/// the trailing token.
pub fn parse_auth_token(line: &str) -> Option<String> {
    let (_, rhs) = line.split_once('=')?;
    let token = rhs.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Writes and parses the backup-header record: `key=value\n` lines plus its
/// HMAC, with read-side algorithm auto-detection.
pub struct HeaderCodec<'a> {
    cfg: &'a ToolConfig,
    passphrase: String,
}

impl<'a> HeaderCodec<'a> {
    pub fn new(cfg: &'a ToolConfig, passphrase: impl Into<String>) -> Self {
        HeaderCodec {
            cfg,
            passphrase: passphrase.into(),
        }
    }

    /// Serializes the four recognized keys as `key=value\n` lines.
    pub fn serialize(header: &BackupHeader) -> String {
        format!(
            "hmac-algorithm={}\ncrypto-algorithm={}\nencrypted={}\ncompressed={}\n",
            header.hmac_algorithm, header.crypto_algorithm, header.encrypted, header.compressed,
        )
    }

    /// Computes the HMAC line for a serialized header, using the header's
    /// own declared algorithm.
    pub fn compute_hmac(&self, header: &BackupHeader, text: &str) -> Result<String, Error> {
        let mut digest = spawn_digest(self.cfg, &header.hmac_algorithm, &self.passphrase)?;
        {
            use std::io::Write;
            digest
                .stdin
                .take()
                .ok_or_else(|| Error::StageFailure {
                    stage: "hmac".to_string(),
                })?
                .write_all(text.as_bytes())
                .map_err(Error::TransportError)?;
        }

        let mut out = String::new();
        {
            use std::io::Read;
            digest
                .stdout
                .take()
                .ok_or_else(|| Error::StageFailure {
                    stage: "hmac".to_string(),
                })?
                .read_to_string(&mut out)
                .map_err(Error::TransportError)?;
        }

        let status = digest.wait().map_err(Error::TransportError)?;
        if !status.success() {
            return Err(Error::StageFailure {
                stage: "hmac".to_string(),
            });
        }

        Ok(out)
    }

    /// Parses `key=value` lines into a [`BackupHeader`], per the grammar in
    /// the external-interfaces section: unknown keys with exactly one `=`
    /// are ignored (forward compatibility); a line with zero or two-or-more
    /// `=` signs is corrupt.
    pub fn parse(text: &str) -> Result<BackupHeader, Error> {
        let mut header = BackupHeader::default();

        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            let eq_count = line.matches('=').count();
            if eq_count != 1 {
                return Err(Error::CorruptHeader {
                    detail: format!("malformed header line: \"{line}\""),
                });
            }
            let (key, value) = line.split_once('=').expect("exactly one '=' checked above");

            match key {
                "hmac-algorithm" => header.hmac_algorithm = value.to_string(),
                "crypto-algorithm" => header.crypto_algorithm = value.to_string(),
                "encrypted" => header.encrypted = is_truthy(value),
                "compressed" => header.compressed = is_truthy(value),
                _ => {} // unknown key: ignored, forward compatibility
            }
        }

        Ok(header)
    }

    /// Enumerates HMAC algorithms the digest tool supports, `default` first
    /// (never repeated in the tail), the way the original implementation's
    /// `get_supported_hmac_algo` walks `openssl list-message-digest-algorithms`.
    pub fn supported_algorithms(&self, default: &str) -> Vec<String> {
        let mut algos = vec![default.to_string()];

        if let Ok(output) = Command::new(&self.cfg.digest_tool)
            .arg("list")
            .arg("-digest-algorithms")
            .stdin(Stdio::null())
            .output()
        {
            let text = String::from_utf8_lossy(&output.stdout);
            for line in text.lines() {
                let Some(first) = line.split_whitespace().next() else {
                    continue;
                };
                let name = first.trim_end_matches(':').to_ascii_lowercase();
                if !name.is_empty() && name != default && !algos.contains(&name) {
                    algos.push(name);
                }
            }
        }

        algos
    }

    /// Verifies `hmac_line` against `header_text` trying `default` first,
    /// then every other enumerated algorithm, adopting whichever first
    /// succeeds. Returns the adopted algorithm and the parsed header.
    pub fn verify_autodetect(
        &self,
        default_algorithm: &str,
        header_text: &str,
        hmac_line: &str,
    ) -> Result<(String, BackupHeader), Error> {
        let stored_token = parse_auth_token(hmac_line).ok_or_else(|| Error::CorruptHeader {
            detail: "malformed backup-header.hmac".to_string(),
        })?;

        for algorithm in self.supported_algorithms(default_algorithm) {
            let mut digest = match spawn_digest(self.cfg, &algorithm, &self.passphrase) {
                Ok(d) => d,
                Err(_) => continue,
            };
            let computed = {
                use std::io::{Read, Write};
                let Some(mut stdin) = digest.stdin.take() else {
                    continue;
                };
                if stdin.write_all(header_text.as_bytes()).is_err() {
                    continue;
                }
                drop(stdin);

                let mut out = String::new();
                let Some(mut stdout) = digest.stdout.take() else {
                    continue;
                };
                if stdout.read_to_string(&mut out).is_err() {
                    continue;
                }
                let _ = digest.wait();
                out
            };

            let Some(computed_token) = parse_auth_token(&computed) else {
                continue;
            };

            if computed_token.as_bytes().ct_eq(stored_token.as_bytes()).into() {
                let mut header = Self::parse(header_text)?;
                header.hmac_algorithm = algorithm.clone();
                return Ok((algorithm, header));
            }
        }

        Err(Error::CorruptHeader {
            detail: "no HMAC algorithm verified the backup header".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_recognized_keys_and_ignores_unknown() {
        let text = "hmac-algorithm=sha256\nencrypted=yes\nfuture-option=42\ncompressed=0\n";
        let header = HeaderCodec::parse(text).unwrap();
        assert_eq!(header.hmac_algorithm, "sha256");
        assert!(header.encrypted);
        assert!(!header.compressed);
    }

    #[test]
    fn rejects_lines_with_wrong_equals_count() {
        assert!(HeaderCodec::parse("no-equals-here\n").is_err());
        assert!(HeaderCodec::parse("a=b=c\n").is_err());
    }

    #[test]
    fn bool_coercion_is_case_insensitive() {
        assert!(is_truthy("TRUE"));
        assert!(is_truthy("Yes"));
        assert!(is_truthy("1"));
        assert!(!is_truthy("0"));
        assert!(!is_truthy("no"));
    }

    #[test]
    fn parse_auth_token_splits_on_first_equals() {
        assert_eq!(
            parse_auth_token("SHA256(stdin)= deadbeef\n"),
            Some("deadbeef".to_string())
        );
        assert_eq!(parse_auth_token("no equals"), None);
    }
}
