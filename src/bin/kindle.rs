//! Binary entry point for the Kindle WAL tool.
#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use kindle::config::{default_config_path, StorageOptions};
use kindle::primitives::io::{FileIo, StdFileIo};
use kindle::primitives::pager::{PageMemory, PageStore};
use kindle::primitives::wal::Wal;
use kindle::storage::{
    chain_nodes, verify_chain, PageHeader, Recovery, RecoveryReport, ReplayPolicy, WalRecord,
};
use kindle::types::{GroupId, PageId, WalPointer};
use serde::Serialize;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "kindle",
    version,
    about = "Inspect and replay Kindle write-ahead logs",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "List the records of a WAL file")]
    InspectWal {
        #[arg(value_name = "WAL")]
        wal: PathBuf,

        #[arg(long, help = "Include a hex dump of every payload")]
        hex: bool,
    },

    #[command(about = "Replay a WAL file into fresh pages and verify free lists")]
    Replay {
        #[arg(value_name = "WAL")]
        wal: PathBuf,

        #[arg(
            long,
            value_name = "FILE",
            env = "KINDLE_CONFIG",
            help = "Configuration file (defaults to the user config dir)"
        )]
        config: Option<PathBuf>,

        #[arg(long, value_enum, help = "Override the configured replay policy")]
        policy: Option<PolicyArg>,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum PolicyArg {
    FailFast,
    Quarantine,
}

impl From<PolicyArg> for ReplayPolicy {
    fn from(value: PolicyArg) -> Self {
        match value {
            PolicyArg::FailFast => ReplayPolicy::FailFast,
            PolicyArg::Quarantine => ReplayPolicy::Quarantine,
        }
    }
}

#[derive(Serialize)]
struct InspectEntry {
    pointer: WalPointer,
    #[serde(skip_serializing_if = "Option::is_none")]
    record: Option<WalRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    decode_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_hex: Option<String>,
}

#[derive(Serialize)]
struct InspectReport {
    salt: u64,
    valid_up_to: u64,
    file_len: u64,
    records: Vec<InspectEntry>,
}

#[derive(Serialize)]
struct FreeListCheck {
    group: GroupId,
    head: PageId,
    nodes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct ReplayOutput {
    report: RecoveryReport,
    free_lists: Vec<FreeListCheck>,
}

fn main() {
    install_tracing_subscriber();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn install_tracing_subscriber() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kindle=info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    match cli.command {
        Command::InspectWal { wal, hex } => {
            let report = inspect(&wal, hex)?;
            emit(&cli.format, &report, |_| print_inspect_text(&report))?;
        }
        Command::Replay {
            wal,
            config,
            policy,
        } => {
            let config = config.or_else(default_config_path);
            let options = StorageOptions::load_or_default(config.as_deref())?;
            let policy = policy.map(ReplayPolicy::from).unwrap_or(options.recovery.policy);
            let output = replay(&wal, &options, policy)?;
            emit(&cli.format, &output, |_| print_replay_text(&output))?;
            let broken = output.free_lists.iter().any(|c| c.error.is_some());
            if !output.report.is_clean() || broken {
                std::process::exit(2);
            }
        }
    }
    Ok(())
}

fn open_existing(path: &Path) -> Result<Arc<dyn FileIo>, Box<dyn Error>> {
    if !path.is_file() {
        return Err(format!("WAL file {} does not exist", path.display()).into());
    }
    Ok(Arc::new(StdFileIo::open(path)?))
}

fn inspect(path: &Path, hex: bool) -> Result<InspectReport, Box<dyn Error>> {
    let io = open_existing(path)?;
    let file_len = io.len()?;
    let mut iter = Wal::read_existing(io)?;
    let mut records = Vec::new();
    while let Some(frame) = iter.next_frame()? {
        let (record, decode_error) = match WalRecord::decode(&frame.payload) {
            Ok(record) => (Some(record), None),
            Err(err) => (None, Some(err.to_string())),
        };
        records.push(InspectEntry {
            pointer: frame.pointer,
            record,
            decode_error,
            payload_hex: hex.then(|| hex::encode(&frame.payload)),
        });
    }
    Ok(InspectReport {
        salt: iter.salt(),
        valid_up_to: iter.valid_up_to(),
        file_len,
        records,
    })
}

fn replay(
    path: &Path,
    options: &StorageOptions,
    policy: ReplayPolicy,
) -> Result<ReplayOutput, Box<dyn Error>> {
    let io = open_existing(path)?;
    let salt = Wal::read_existing(Arc::clone(&io))?.salt();
    let mut wal_options = options.wal_options(Default::default());
    wal_options.salt = salt;
    let wal = Wal::open(io, wal_options)?;

    let pages = options.page_memory()?;
    register_logged_groups(&wal, &pages, options)?;
    let report = Recovery::replay(&wal, &pages, policy)?;

    let quarantined: BTreeSet<(GroupId, PageId)> =
        report.quarantined.iter().map(|q| (q.group, q.page)).collect();
    let mut free_lists = Vec::new();
    for group in pages.groups() {
        for head in free_list_heads(&pages, group) {
            if quarantined.contains(&(group, head)) {
                continue;
            }
            let check = match verify_chain(&pages, group, head) {
                Ok(()) => FreeListCheck {
                    group,
                    head,
                    nodes: chain_nodes(&pages, group, head)?.len(),
                    error: None,
                },
                Err(err) => FreeListCheck {
                    group,
                    head,
                    nodes: 0,
                    error: Some(err.to_string()),
                },
            };
            free_lists.push(check);
        }
    }
    Ok(ReplayOutput { report, free_lists })
}

/// Groups named by logged deltas but absent from the config get the default page size.
fn register_logged_groups(
    wal: &Wal,
    pages: &PageMemory,
    options: &StorageOptions,
) -> Result<(), Box<dyn Error>> {
    let mut iter = wal.iter()?;
    while let Some(frame) = iter.next_frame()? {
        let Ok(record) = WalRecord::decode(&frame.payload) else {
            continue;
        };
        if let Some(group) = record.delta().map(|d| d.group_id) {
            if !pages.groups().contains(&group) {
                pages.register_group(group, options.page_size(group))?;
            }
        }
    }
    Ok(())
}

/// Pages formatted as free-list nodes that have no predecessor.
fn free_list_heads(pages: &PageMemory, group: GroupId) -> Vec<PageId> {
    let mut ids = pages.dirty_pages(group);
    ids.sort();
    ids.into_iter()
        .filter(|id| {
            let Ok(page) = pages.page(group, *id) else {
                return false;
            };
            let Ok(header) = PageHeader::parse(page.data()) else {
                return false;
            };
            match pages.page_io().pages_list(header.io_type, header.io_version) {
                Ok(io) => io.prev_id(page.data()).is_ok_and(|prev| prev.is_null()),
                Err(_) => false,
            }
        })
        .collect()
}

fn emit<T, F>(format: &OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(OutputFormat),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(OutputFormat::Text),
    }
    Ok(())
}

fn print_inspect_text(report: &InspectReport) {
    println!(
        "WAL salt={:#x} valid_up_to={} file_len={}",
        report.salt, report.valid_up_to, report.file_len
    );
    for entry in &report.records {
        let p = entry.pointer;
        match (&entry.record, &entry.decode_error) {
            (Some(record), _) => println!("  lsn={} off={} len={} {record}", p.lsn, p.offset, p.len),
            (None, Some(err)) => {
                println!("  lsn={} off={} len={} <undecodable: {err}>", p.lsn, p.offset, p.len)
            }
            (None, None) => {}
        }
        if let Some(hex) = &entry.payload_hex {
            println!("    {hex}");
        }
    }
    if report.valid_up_to < report.file_len {
        println!(
            "  torn tail: {} byte(s) past the last valid frame",
            report.file_len - report.valid_up_to
        );
    }
}

fn print_replay_text(output: &ReplayOutput) {
    let report = &output.report;
    println!("Replay:");
    println!(
        "  applied={} skipped={} whole_records={} valid_up_to={}",
        report.applied, report.skipped, report.whole_records, report.valid_up_to
    );
    if let Some(lsn) = report.last_lsn {
        println!("  last_lsn={lsn}");
    }
    if let Some(snap) = &report.last_snapshot {
        println!("  last_snapshot id={} full={}", snap.snapshot_id, snap.full);
    }
    if let Some(checkpoint) = report.last_checkpoint {
        println!("  last_checkpoint={checkpoint}");
    }
    for q in &report.quarantined {
        println!(
            "  quarantined grp={} page={} lsn={}: {}",
            q.group, q.page, q.lsn, q.reason
        );
    }
    println!("Free lists:");
    if output.free_lists.is_empty() {
        println!("  (none)");
    }
    for check in &output.free_lists {
        match &check.error {
            None => println!(
                "  grp={} head={} nodes={} ok",
                check.group, check.head, check.nodes
            ),
            Some(err) => println!("  grp={} head={} BROKEN: {err}", check.group, check.head),
        }
    }
}
