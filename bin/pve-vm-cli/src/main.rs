// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use pve_client::{Client, NodeShell};
use pve_vm::{DocumentAccessor, Orchestrator, VmDocument, VmSpec};
use pve_vm_config::Config;
use slog::{info, o, Drain, Level, Logger};

#[derive(Debug, Parser)]
#[clap(about, version)]
/// Reconcile Proxmox VE virtual machines against a desired-state document
struct Opt {
    /// Configuration file (TOML)
    #[clap(short, long, action)]
    config: Option<PathBuf>,

    /// State file holding the VM document (JSON)
    #[clap(short, long, action)]
    state: PathBuf,

    /// Enable debugging
    #[clap(short, long, action)]
    debug: bool,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the VM described by a desired-state file
    Create {
        /// Desired VM description (JSON)
        #[clap(action)]
        spec: PathBuf,
    },

    /// Refresh the state file from the hypervisor
    Read,

    /// Apply a new desired state to an existing VM
    Update {
        /// Replacement desired VM description (JSON); defaults to the one
        /// already in the state file
        #[clap(action)]
        spec: Option<PathBuf>,
    },

    /// Stop and destroy the VM
    Delete,

    /// Print the run state of the VM
    Status,
}

fn parse_json_file<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> anyhow::Result<T> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    serde_json::from_reader(reader).map_err(|e| e.into())
}

fn load_spec(path: &Path, config: &Config) -> anyhow::Result<VmSpec> {
    let mut spec: VmSpec = parse_json_file(path)
        .with_context(|| anyhow!("failed to parse {}", path.display()))?;
    if spec.node_name.is_empty() {
        spec.node_name = config.endpoint.node.clone();
    }
    Ok(spec)
}

fn load_document(path: &Path) -> anyhow::Result<VmDocument> {
    parse_json_file(path).with_context(|| {
        anyhow!("failed to read state file {}", path.display())
    })
}

fn save_document(path: &Path, doc: &VmDocument) -> anyhow::Result<()> {
    let contents = serde_json::to_vec_pretty(doc)?;
    std::fs::write(path, contents).with_context(|| {
        anyhow!("failed to write state file {}", path.display())
    })
}

fn build_logger(level: Level) -> Logger {
    let main_drain = if atty::is(atty::Stream::Stderr) {
        let decorator = slog_term::TermDecorator::new().stderr().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    } else {
        let drain = slog_bunyan::with_name("pve-vm", std::io::stderr())
            .build()
            .fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    };

    let filtered = slog::LevelFilter::new(main_drain, level).fuse();
    Logger::root(filtered, o!())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();
    let log = build_logger(if opt.debug { Level::Debug } else { Level::Info });

    let config = match &opt.config {
        Some(path) => pve_vm_config::parse(path)
            .with_context(|| anyhow!("failed to parse {}", path.display()))?,
        None => Config::default(),
    };

    let client = Client::new(
        &config.endpoint.url,
        config.endpoint.token.as_deref(),
        config.endpoint.insecure,
        log.new(o!("component" => "api")),
    )?;
    let shell = NodeShell::new(
        config.shell.user.clone(),
        config.shell.host.clone(),
        config.shell.port,
        config.shell.identity_file.clone(),
        log.new(o!("component" => "shell")),
    );
    let orch =
        Orchestrator::new(client, shell, config.timeouts.clone(), log.clone());

    let (mut doc, res) = match opt.cmd {
        Command::Create { spec } => {
            if opt.state.exists() {
                let existing = load_document(&opt.state)?;
                if let Some(id) = existing.id() {
                    return Err(anyhow!(
                        "{} already manages VM {}",
                        opt.state.display(),
                        id
                    ));
                }
            }
            let mut doc = VmDocument::new(load_spec(&spec, &config)?);
            let res = orch.create(&mut doc).await;
            (doc, res)
        }
        Command::Read => {
            let mut doc = load_document(&opt.state)?;
            let res = orch.read(&mut doc).await;
            (doc, res)
        }
        Command::Update { spec } => {
            let mut doc = load_document(&opt.state)?;
            if let Some(spec) = spec {
                doc.desired = load_spec(&spec, &config)?;
            }
            let res = orch.update(&mut doc).await;
            (doc, res)
        }
        Command::Delete => {
            let mut doc = load_document(&opt.state)?;
            let res = orch.delete(&mut doc).await;
            (doc, res)
        }
        Command::Status => {
            let doc = load_document(&opt.state)?;
            match orch.status(&doc).await? {
                Some(status) => println!("{:?}", status),
                None => println!("absent"),
            }
            return Ok(());
        }
    };

    // The document records partial progress (e.g. an allocated identifier)
    // even when the operation failed.
    save_document(&opt.state, &doc)?;
    res?;

    if let Some(id) = doc.id() {
        info!(log, "VM reconciled"; "vm" => id);
    }
    println!("{}", serde_json::to_string_pretty(doc.computed())?);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn spec_inherits_configured_node() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{ "name": "web", "vm_id": -1 }}"#).unwrap();

        let mut config = Config::default();
        config.endpoint.node = "edge".to_string();
        let spec = load_spec(file.path(), &config).unwrap();
        assert_eq!(spec.node_name, "edge");
        assert_eq!(spec.name.as_deref(), Some("web"));
    }

    #[test]
    fn document_survives_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.json");

        let mut doc = VmDocument::new(VmSpec {
            node_name: "pve".to_string(),
            ..Default::default()
        });
        doc.set_id(Some(104));
        save_document(&path, &doc).unwrap();

        let loaded = load_document(&path).unwrap();
        assert_eq!(loaded, doc);
    }

    #[test]
    fn cli_shape() {
        let opt = Opt::try_parse_from([
            "pve-vm", "--state", "vm.json", "update", "next.json",
        ])
        .unwrap();
        assert!(matches!(opt.cmd, Command::Update { spec: Some(_) }));
    }
}
