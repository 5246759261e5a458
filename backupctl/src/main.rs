// backupctl is the command-line front end for the backupcore archive engine.
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

mod error;
use error::*;

use backupcore::collaborators::{ProgressSink, StderrLog, Vm, VmInventory};
use backupcore::config::ToolConfig;
use backupcore::model::{BackupEntry, BackupHeader, BackupPlan, RestorePlan, VmSelection};
use backupcore::orchestrator::Orchestrator;
use backupcore::system;

use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up a directory of VM subdirectories to an archive file.
    Backup {
        /// Directory holding one subdirectory per VM to include.
        inventory_dir: PathBuf,
        /// Path the resulting backup archive is written to.
        output: PathBuf,
        /// Encrypt the backup with the configured cipher algorithm.
        #[arg(short, long)]
        encrypt: bool,
        /// Compress the backup with the configured compressor.
        #[arg(short, long)]
        compress: bool,
    },
    /// Restore selected VMs from a backup archive (or legacy directory).
    Restore {
        /// Path of the backup archive, or of a legacy format-version-1 directory.
        location: PathBuf,
        /// Directory restored VM subdirectories are written into.
        target_dir: PathBuf,
        /// VM names to restore. If empty, only the header and inventory XML are recovered.
        #[arg(short, long)]
        vms: Vec<String>,
        /// Upper bound on the total bytes expected across the selected VMs,
        /// used to size the demultiplexer's safety budget.
        #[arg(long, default_value_t = 10_000_000_000)]
        expected_bytes: u64,
    },
}

/// Treats a directory's immediate subdirectories as the VM collection,
/// enough to drive the engine end-to-end without any real Qubes
/// integration, which stays out of scope here.
struct DirInventory {
    root: PathBuf,
    vms: Vec<Vm>,
}

impl DirInventory {
    fn load(root: &Path) -> io::Result<Self> {
        let mut vms = Vec::new();

        for entry in fs::read_dir(root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                let name = entry.file_name().to_string_lossy().into_owned();
                vms.push(Vm {
                    name,
                    template: None,
                    netvm: None,
                });
            }
        }

        vms.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(DirInventory {
            root: root.to_path_buf(),
            vms,
        })
    }

    /// Stand-in serialization of the VM list, used as the inventory-XML
    /// entry every backup carries first.
    fn to_inventory_bytes(&self) -> Vec<u8> {
        let mut text = String::new();
        for vm in &self.vms {
            text.push_str(&vm.name);
            text.push('\n');
        }
        text.into_bytes()
    }
}

impl VmInventory for DirInventory {
    fn list_included(&self) -> Vec<Vm> {
        self.vms.clone()
    }

    fn default_template(&self) -> Option<String> {
        None
    }

    fn default_netvm(&self) -> Option<String> {
        None
    }

    fn add(&mut self, vm: Vm) -> Vm {
        self.vms.push(vm.clone());
        vm
    }

    fn save(&mut self) -> io::Result<()> {
        fs::write(self.root.join("qubes.xml"), self.to_inventory_bytes())
    }

    fn lock(&mut self) {}

    fn unlock(&mut self) {}
}

/// Prints a single-line percentage update per report, the way the original
/// binaries print status lines directly rather than through a progress bar
/// crate.
struct PercentProgress {
    label: &'static str,
}

impl ProgressSink for PercentProgress {
    fn report(&mut self, percent: u8) {
        println!("{}: {percent}%", self.label);
    }
}

fn logic() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Backup {
            inventory_dir,
            output,
            encrypt,
            compress,
        } => {
            let passphrase = rpassword::prompt_password("Enter backup passphrase: ")?;
            backup(&inventory_dir, &output, encrypt, compress, &passphrase)?;
        }
        Commands::Restore {
            location,
            target_dir,
            vms,
            expected_bytes,
        } => {
            let passphrase = rpassword::prompt_password("Enter backup passphrase: ")?;
            restore(&location, &target_dir, &vms, expected_bytes, &passphrase)?;
        }
    }

    Ok(())
}

fn default_tool_config() -> ToolConfig {
    ToolConfig {
        temp_root: std::env::temp_dir(),
        ..ToolConfig::default()
    }
}

fn backup(inventory_dir: &Path, output: &Path, encrypt: bool, compress: bool, passphrase: &str) -> Result<()> {
    let cfg = default_tool_config();
    let inventory = DirInventory::load(inventory_dir)?;

    let inventory_path = std::env::temp_dir().join(format!("backupctl-inventory-{}.xml", std::process::id()));
    fs::write(&inventory_path, inventory.to_inventory_bytes())?;

    let mut entries = vec![BackupEntry {
        size_bytes: fs::metadata(&inventory_path)?.len(),
        source_path: inventory_path.clone(),
        archive_subdir: String::new(),
    }];

    for vm in inventory.list_included() {
        let vm_dir = inventory_dir.join(&vm.name);
        let size_bytes = system::disk_usage(&vm_dir)?;
        entries.push(BackupEntry {
            source_path: vm_dir,
            size_bytes,
            // Namespaces this VM's chunks under "<name>/" so the restore
            // side's per-VM tar filtering (Orchestrator::restore's vm_dirs
            // selection) can select this VM's chunks by name.
            archive_subdir: format!("{}/", vm.name),
        });
    }

    let plan = BackupPlan { entries };
    let header = BackupHeader {
        hmac_algorithm: cfg.hmac_algorithm.clone(),
        crypto_algorithm: cfg.crypto_algorithm.clone(),
        encrypted: encrypt,
        compressed: compress,
    };

    let transport = File::create(output)?;
    let orchestrator = Orchestrator::new(&cfg);
    let mut progress = PercentProgress { label: "backup" };
    let mut log = StderrLog;

    let result = orchestrator.backup(&plan, &header, passphrase, transport, &mut progress, &mut log);
    let _ = fs::remove_file(&inventory_path);
    result?;

    println!("Backup written to {}", output.display());
    Ok(())
}

fn restore(
    location: &Path,
    target_dir: &Path,
    vms: &[String],
    expected_bytes: u64,
    passphrase: &str,
) -> Result<()> {
    let cfg = default_tool_config();

    let mut selections = HashMap::new();
    for vm in vms {
        selections.insert(vm.clone(), VmSelection::Restore);
    }
    let plan = RestorePlan {
        selections,
        ..RestorePlan::default()
    };

    let orchestrator = Orchestrator::new(&cfg);
    let mut progress = PercentProgress { label: "restore" };
    let mut log = StderrLog;

    let outcome = orchestrator.restore(
        location,
        &plan,
        passphrase,
        &cfg.hmac_algorithm,
        expected_bytes,
        target_dir,
        &mut progress,
        &mut log,
    )?;

    fs::create_dir_all(target_dir)?;
    fs::write(target_dir.join("qubes.xml"), &outcome.inventory_xml)?;

    println!("Restore complete, inventory written to {}", target_dir.join("qubes.xml").display());
    Ok(())
}

fn main() {
    match logic() {
        Ok(_) => {}
        Err(e) => eprintln!("Error: {}", e),
    }
}
