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

//! End-to-end exercise of [`Orchestrator::backup`]/[`Orchestrator::restore`]
//! against the real `tar`/`openssl`/`gzip` binaries. Every scenario checks
//! for its required tools first and prints a notice and returns early if
//! they are missing, rather than failing the suite on a machine that lacks
//! them.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::Path;
use std::process::Command;

use backupcore::collaborators::{NullProgress, StderrLog};
use backupcore::config::ToolConfig;
use backupcore::model::{BackupEntry, BackupHeader, BackupPlan, RestoreOptions, RestorePlan, VmSelection};
use backupcore::orchestrator::Orchestrator;

fn have(bin: &str) -> bool {
    Command::new(bin).arg("--version").output().is_ok()
}

/// Skips the calling test (with a printed notice) unless every named tool is
/// on `$PATH`.
macro_rules! require_tools {
    ($($bin:expr),+ $(,)?) => {{
        let missing: Vec<&str> = [$($bin),+].into_iter().filter(|b| !have(b)).collect();
        if !missing.is_empty() {
            eprintln!("skipping {}: missing {:?} on PATH", module_path!(), missing);
            return;
        }
    }};
}

fn test_cfg(temp_root: &Path) -> ToolConfig {
    ToolConfig {
        temp_root: temp_root.to_path_buf(),
        ..ToolConfig::default()
    }
}

fn write_file(path: &Path, contents: &[u8]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

/// Builds the conventional plan shape: the inventory XML first with an empty
/// subdir, then one namespaced entry per VM directory under `vms_root`.
fn plan_for(inventory_xml: &Path, vms_root: &Path, vm_names: &[&str]) -> BackupPlan {
    let mut entries = vec![BackupEntry {
        source_path: inventory_xml.to_path_buf(),
        size_bytes: fs::metadata(inventory_xml).unwrap().len(),
        archive_subdir: String::new(),
    }];

    for name in vm_names {
        let vm_dir = vms_root.join(name);
        entries.push(BackupEntry {
            source_path: vm_dir,
            size_bytes: 4096,
            archive_subdir: format!("{name}/"),
        });
    }

    BackupPlan { entries }
}

fn restore_plan(vm_names: &[&str]) -> RestorePlan {
    let mut selections = HashMap::new();
    for name in vm_names {
        selections.insert(name.to_string(), VmSelection::Restore);
    }
    RestorePlan {
        selections,
        template_remap: HashMap::new(),
        netvm_remap: HashMap::new(),
        options: RestoreOptions::default(),
    }
}

#[test]
fn round_trip_restores_plaintext_backup() {
    require_tools!("tar");

    let workdir = tempfile::tempdir().unwrap();
    let source_root = workdir.path().join("source");
    let inventory_xml = source_root.join("qubes.xml");
    write_file(&inventory_xml, b"vm1\n");
    write_file(&source_root.join("vm1").join("private.img"), b"vm1 disk contents");

    let cfg = test_cfg(workdir.path());
    let plan = plan_for(&inventory_xml, &source_root, &["vm1"]);
    let header = BackupHeader::default();

    let archive_path = workdir.path().join("backup.tar");
    let transport = File::create(&archive_path).unwrap();

    let orchestrator = Orchestrator::new(&cfg);
    orchestrator
        .backup(&plan, &header, "correct horse", transport, &mut NullProgress, &mut StderrLog)
        .unwrap();

    let target_dir = workdir.path().join("restored");
    let outcome = orchestrator
        .restore(
            &archive_path,
            &restore_plan(&["vm1"]),
            "correct horse",
            &cfg.hmac_algorithm,
            1_000_000,
            &target_dir,
            &mut NullProgress,
            &mut StderrLog,
        )
        .unwrap();

    assert_eq!(outcome.inventory_xml, b"vm1\n");
    let restored = fs::read(target_dir.join("vm1").join("private.img")).unwrap();
    assert_eq!(restored, b"vm1 disk contents");
}

#[test]
fn round_trip_spans_multiple_chunks_for_large_file() {
    require_tools!("tar");

    let workdir = tempfile::tempdir().unwrap();
    let source_root = workdir.path().join("source");
    let inventory_xml = source_root.join("qubes.xml");
    write_file(&inventory_xml, b"vm1\n");

    // Bigger than the tiny chunk size below, so the file is written as
    // several `.000`/`.001`/... chunks instead of one.
    let payload: Vec<u8> = (0u8..=255).cycle().take(5000).collect();
    write_file(&source_root.join("vm1").join("disk"), &payload);

    let mut cfg = test_cfg(workdir.path());
    cfg.chunk_size_bytes = 512;

    let plan = plan_for(&inventory_xml, &source_root, &["vm1"]);
    let header = BackupHeader::default();

    let archive_path = workdir.path().join("backup.tar");
    let transport = File::create(&archive_path).unwrap();

    let orchestrator = Orchestrator::new(&cfg);
    orchestrator
        .backup(&plan, &header, "passphrase", transport, &mut NullProgress, &mut StderrLog)
        .unwrap();

    let target_dir = workdir.path().join("restored");
    orchestrator
        .restore(
            &archive_path,
            &restore_plan(&["vm1"]),
            "passphrase",
            &cfg.hmac_algorithm,
            1_000_000,
            &target_dir,
            &mut NullProgress,
            &mut StderrLog,
        )
        .unwrap();

    let restored = fs::read(target_dir.join("vm1").join("disk")).unwrap();
    assert_eq!(restored, payload, "chunk ordering must reassemble the file exactly");
}

#[test]
fn round_trip_through_encryption() {
    require_tools!("tar", "openssl");

    let workdir = tempfile::tempdir().unwrap();
    let source_root = workdir.path().join("source");
    let inventory_xml = source_root.join("qubes.xml");
    write_file(&inventory_xml, b"vm1\n");
    write_file(&source_root.join("vm1").join("private.img"), b"secret disk bytes");

    let cfg = test_cfg(workdir.path());
    let plan = plan_for(&inventory_xml, &source_root, &["vm1"]);
    let header = BackupHeader {
        encrypted: true,
        ..BackupHeader::default()
    };

    let archive_path = workdir.path().join("backup.tar");
    let transport = File::create(&archive_path).unwrap();

    let orchestrator = Orchestrator::new(&cfg);
    orchestrator
        .backup(&plan, &header, "a strong passphrase", transport, &mut NullProgress, &mut StderrLog)
        .unwrap();

    // Ciphertext must not contain the plaintext marker.
    let archived_bytes = fs::read(&archive_path).unwrap();
    assert!(!contains(&archived_bytes, b"secret disk bytes"));

    let target_dir = workdir.path().join("restored");
    let outcome = orchestrator
        .restore(
            &archive_path,
            &restore_plan(&["vm1"]),
            "a strong passphrase",
            &cfg.hmac_algorithm,
            1_000_000,
            &target_dir,
            &mut NullProgress,
            &mut StderrLog,
        )
        .unwrap();

    assert!(outcome.header.encrypted);
    let restored = fs::read(target_dir.join("vm1").join("private.img")).unwrap();
    assert_eq!(restored, b"secret disk bytes");
}

#[test]
fn round_trip_through_compression() {
    require_tools!("tar", "gzip");

    let workdir = tempfile::tempdir().unwrap();
    let source_root = workdir.path().join("source");
    let inventory_xml = source_root.join("qubes.xml");
    write_file(&inventory_xml, b"vm1\n");
    // Compressible: a single repeated byte, long enough that gzip actually
    // shrinks it below the plaintext size.
    let payload = vec![b'x'; 8192];
    write_file(&source_root.join("vm1").join("private.img"), &payload);

    let cfg = test_cfg(workdir.path());
    let plan = plan_for(&inventory_xml, &source_root, &["vm1"]);
    let header = BackupHeader {
        compressed: true,
        ..BackupHeader::default()
    };

    let archive_path = workdir.path().join("backup.tar");
    let transport = File::create(&archive_path).unwrap();

    let orchestrator = Orchestrator::new(&cfg);
    orchestrator
        .backup(&plan, &header, "passphrase", transport, &mut NullProgress, &mut StderrLog)
        .unwrap();

    let target_dir = workdir.path().join("restored");
    let outcome = orchestrator
        .restore(
            &archive_path,
            &restore_plan(&["vm1"]),
            "passphrase",
            &cfg.hmac_algorithm,
            1_000_000,
            &target_dir,
            &mut NullProgress,
            &mut StderrLog,
        )
        .unwrap();

    assert!(outcome.header.compressed);
    let restored = fs::read(target_dir.join("vm1").join("private.img")).unwrap();
    assert_eq!(restored, payload);
}

#[test]
fn restore_rejects_tampered_chunk() {
    require_tools!("tar");

    let workdir = tempfile::tempdir().unwrap();
    let source_root = workdir.path().join("source");
    let inventory_xml = source_root.join("qubes.xml");
    write_file(&inventory_xml, b"vm1\n");

    let marker = b"UNMISTAKABLE-PAYLOAD-MARKER-0123456789";
    write_file(&source_root.join("vm1").join("private.img"), marker);

    let cfg = test_cfg(workdir.path());
    let plan = plan_for(&inventory_xml, &source_root, &["vm1"]);
    let header = BackupHeader::default();

    let archive_path = workdir.path().join("backup.tar");
    let transport = File::create(&archive_path).unwrap();

    let orchestrator = Orchestrator::new(&cfg);
    orchestrator
        .backup(&plan, &header, "passphrase", transport, &mut NullProgress, &mut StderrLog)
        .unwrap();

    // The backup is plaintext and uncompressed, so the marker appears
    // verbatim in the archive; flip one of its bytes in place.
    let mut bytes = fs::read(&archive_path).unwrap();
    let at = find(&bytes, marker).expect("marker must appear verbatim in an unencrypted archive");
    bytes[at] ^= 0xff;
    fs::write(&archive_path, &bytes).unwrap();

    let target_dir = workdir.path().join("restored");
    let result = orchestrator.restore(
        &archive_path,
        &restore_plan(&["vm1"]),
        "passphrase",
        &cfg.hmac_algorithm,
        1_000_000,
        &target_dir,
        &mut NullProgress,
        &mut StderrLog,
    );

    assert!(result.is_err(), "a tampered chunk must never reach extraction");
}

#[test]
fn restore_only_extracts_selected_vms() {
    require_tools!("tar");

    let workdir = tempfile::tempdir().unwrap();
    let source_root = workdir.path().join("source");
    let inventory_xml = source_root.join("qubes.xml");
    write_file(&inventory_xml, b"vm1\nvm2\n");
    write_file(&source_root.join("vm1").join("private.img"), b"vm1 bytes");
    write_file(&source_root.join("vm2").join("private.img"), b"vm2 bytes");

    let cfg = test_cfg(workdir.path());
    let plan = plan_for(&inventory_xml, &source_root, &["vm1", "vm2"]);
    let header = BackupHeader::default();

    let archive_path = workdir.path().join("backup.tar");
    let transport = File::create(&archive_path).unwrap();

    let orchestrator = Orchestrator::new(&cfg);
    orchestrator
        .backup(&plan, &header, "passphrase", transport, &mut NullProgress, &mut StderrLog)
        .unwrap();

    let target_dir = workdir.path().join("restored");
    orchestrator
        .restore(
            &archive_path,
            &restore_plan(&["vm1"]),
            "passphrase",
            &cfg.hmac_algorithm,
            1_000_000,
            &target_dir,
            &mut NullProgress,
            &mut StderrLog,
        )
        .unwrap();

    assert!(target_dir.join("vm1").join("private.img").is_file());
    assert!(
        !target_dir.join("vm2").exists(),
        "an unselected VM's chunks must be discarded, not extracted"
    );
}

#[test]
fn legacy_format_restore_copies_tree_directly() {
    let workdir = tempfile::tempdir().unwrap();
    let legacy_root = workdir.path().join("legacy");
    write_file(&legacy_root.join("qubes.xml"), b"<inventory/>");
    write_file(&legacy_root.join("vm1").join("private.img"), b"legacy vm bytes");

    let cfg = test_cfg(workdir.path());
    let orchestrator = Orchestrator::new(&cfg);
    let target_dir = workdir.path().join("restored");

    let outcome = orchestrator
        .restore(
            &legacy_root,
            &restore_plan(&["vm1"]),
            "unused",
            &cfg.hmac_algorithm,
            0,
            &target_dir,
            &mut NullProgress,
            &mut StderrLog,
        )
        .unwrap();

    assert_eq!(outcome.inventory_xml, b"<inventory/>");
    assert_eq!(fs::read(target_dir.join("vm1").join("private.img")).unwrap(), b"legacy vm bytes");
}

#[test]
fn header_autodetect_ignores_unknown_keys_from_a_newer_producer() {
    require_tools!("openssl");

    use backupcore::chunk::spawn_digest;
    use backupcore::header::{parse_auth_token, HeaderCodec};
    use std::io::{Read, Write};

    let workdir = tempfile::tempdir().unwrap();
    let cfg = test_cfg(workdir.path());

    // A header line set a newer producer might emit: the four recognized
    // keys plus one this build has never heard of.
    let header_text = "hmac-algorithm=sha256\ncrypto-algorithm=aes-256-cbc\nencrypted=false\n\
                        compressed=false\nfuture-feature=enabled\n";

    let mut digest = spawn_digest(&cfg, "sha256", "passphrase").unwrap();
    digest.stdin.take().unwrap().write_all(header_text.as_bytes()).unwrap();
    let mut hmac_line = String::new();
    digest.stdout.take().unwrap().read_to_string(&mut hmac_line).unwrap();
    digest.wait().unwrap();
    assert!(parse_auth_token(&hmac_line).is_some());

    let codec = HeaderCodec::new(&cfg, "passphrase");
    let (algorithm, header) = codec.verify_autodetect("sha256", header_text, &hmac_line).unwrap();

    assert_eq!(algorithm, "sha256");
    assert!(!header.encrypted);
    assert!(!header.compressed);
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    find(haystack, needle).is_some()
}
