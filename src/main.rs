//! hostfs - Host directory export adapter
//!
//! Usage:
//!   hostfs init <root>      - Write a configuration exporting <root>
//!   hostfs ls [path]        - List a directory of the export
//!   hostfs cat <path>       - Print a file of the export
//!   hostfs handle <path>    - Encode and verify the file handle of an entry
//!   hostfs status           - Show export status

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use hostfs::{
    config::Config,
    fs::{overlay::MAX_READ, EntryHandle, FileKind, FileSystem, FileSystemManager},
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "hostfs")]
#[command(author = "hostfs Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Export a host directory tree as a network filesystem")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value_os_t = Config::default_path())]
    config: PathBuf,

    /// Export this directory instead of the configured root
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Enable verbose logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a configuration exporting a host directory
    Init {
        /// Host directory to export
        root: PathBuf,

        /// Reject every mutating operation
        #[arg(long)]
        read_only: bool,

        /// Use 32-byte file handles
        #[arg(long)]
        compact: bool,

        /// Mountpoint override as LOGICAL=PHYSICAL
        #[arg(short, long = "mount", value_parser = parse_mountpoint)]
        mountpoints: Vec<(PathBuf, PathBuf)>,
    },

    /// List a directory of the export
    Ls {
        /// Logical path inside the export
        #[arg(default_value = "/")]
        path: PathBuf,
    },

    /// Print a file of the export
    Cat {
        /// Logical path inside the export
        path: PathBuf,
    },

    /// Encode the file handle of an entry and decode it again
    Handle {
        /// Logical path inside the export
        path: PathBuf,
    },

    /// Show export status
    Status,
}

fn main() {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set subscriber: {}", e);
    }

    let config_path = expand_tilde(&cli.config);

    if let Err(e) = run_command(cli.command, &config_path, cli.root) {
        match e.chain().find_map(|c| c.downcast_ref::<hostfs::Error>()) {
            Some(fs_err) => error!("Error (status {}): {:#}", fs_err.kind().nfs_code(), e),
            None => error!("Error: {:#}", e),
        }
        std::process::exit(1);
    }
}

fn run_command(
    command: Commands,
    config_path: &Path,
    root: Option<PathBuf>,
) -> anyhow::Result<()> {
    match command {
        Commands::Init {
            root,
            read_only,
            compact,
            mountpoints,
        } => cmd_init(config_path, root, read_only, compact, mountpoints),

        Commands::Ls { path } => cmd_ls(&load_config(config_path, root)?, &path),

        Commands::Cat { path } => cmd_cat(&load_config(config_path, root)?, &path),

        Commands::Handle { path } => cmd_handle(&load_config(config_path, root)?, &path),

        Commands::Status => cmd_status(config_path, &load_config(config_path, root)?),
    }
}

fn cmd_init(
    config_path: &Path,
    root: PathBuf,
    read_only: bool,
    compact: bool,
    mountpoints: Vec<(PathBuf, PathBuf)>,
) -> anyhow::Result<()> {
    info!("Initializing hostfs export...");

    let root = std::fs::canonicalize(&root)
        .with_context(|| format!("Failed to resolve export root {:?}", root))?;

    let mut config = Config::from_root(root);
    config.export.read_only = read_only;
    config.export.mountpoints = mountpoints.into_iter().collect();
    config.handles.compact = compact;
    config.validate()?;

    // Ensure config directory exists
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    config.save(config_path)?;

    info!("Configuration saved to {:?}", config_path);
    info!("Exporting {:?}", config.export.root);
    Ok(())
}

fn cmd_ls(config: &Config, path: &Path) -> anyhow::Result<()> {
    let (_, fs) = open_export(config)?;
    let dir = fs.resolve_path(path)?;

    if !dir.is_dir() {
        print_entry(&dir);
        return Ok(());
    }
    for entry in fs.list(&dir)? {
        print_entry(&entry);
    }
    Ok(())
}

fn cmd_cat(config: &Config, path: &Path) -> anyhow::Result<()> {
    let (_, fs) = open_export(config)?;
    let file = fs.resolve_path(path)?;
    if file.kind != FileKind::Regular {
        bail!("{:?} is not a regular file", path);
    }

    let mut stdout = std::io::stdout().lock();
    let mut offset = 0u64;
    loop {
        let chunk = fs.read(&file, offset, MAX_READ)?;
        if chunk.is_empty() {
            break;
        }
        stdout.write_all(&chunk)?;
        offset += chunk.len() as u64;
    }
    stdout.flush()?;
    Ok(())
}

fn cmd_handle(config: &Config, path: &Path) -> anyhow::Result<()> {
    let (manager, fs) = open_export(config)?;
    let entry = fs.resolve_path(path)?;
    let compact = config.handles.compact;

    let handle = manager.encode(&entry, compact);
    let (resolved_fs, resolved) = manager.resolve(&handle, compact)?;

    println!("Path:    {:?}", path);
    println!("Type:    {:?} (ftype {})", entry.kind, entry.kind.nfs_type());
    println!("Handle:  {}", hex::encode(&handle));
    println!("Length:  {} bytes", handle.len());
    println!("Decoded: fsid={} fileid={}", resolved_fs.fsid(), resolved.fileid);
    println!("(handles are only valid for the lifetime of this process)");
    Ok(())
}

fn cmd_status(config_path: &Path, config: &Config) -> anyhow::Result<()> {
    let (_, fs) = open_export(config)?;
    let root = fs.root();
    let stats = fs.statfs();

    let quota = |q: Option<u64>| q.map_or_else(|| "none".to_string(), |q| q.to_string());

    println!("hostfs Status");
    println!("=============");
    println!();
    println!("Configuration: {:?}", config_path);
    println!("Export root: {:?}", config.export.root);
    println!("Mode: {}", if stats.read_only { "read-only" } else { "read-write" });
    println!("Handle size: {} bytes", if config.handles.compact { 32 } else { 48 });
    println!("Size quota: {} (not enforced)", quota(stats.size_quota));
    println!("Entries quota: {} (not enforced)", quota(stats.entries_quota));
    println!("Root owner: {}:{}", root.attrs.uid, root.attrs.gid);
    for (logical, physical) in &config.export.mountpoints {
        println!("Mountpoint: {:?} -> {:?}", logical, physical);
    }

    Ok(())
}

/// Load the configuration file, or build one from `--root`
fn load_config(config_path: &Path, root: Option<PathBuf>) -> anyhow::Result<Config> {
    match root {
        Some(root) => {
            let mut config = Config::from_root(std::fs::canonicalize(&root)?);
            config.apply_env_overrides();
            config.validate()?;
            Ok(config)
        }
        None => Config::load(config_path).with_context(|| {
            format!("Failed to load {:?} (run 'hostfs init' first)", config_path)
        }),
    }
}

fn open_export(config: &Config) -> anyhow::Result<(FileSystemManager, Arc<dyn FileSystem>)> {
    let manager = FileSystemManager::new();
    let fs = manager.register(&config.export)?;
    Ok((manager, fs))
}

fn print_entry(entry: &EntryHandle) {
    let kind = match entry.kind {
        FileKind::Directory => 'd',
        FileKind::Regular => '-',
        FileKind::Symlink => 'l',
        FileKind::CharDevice => 'c',
        FileKind::BlockDevice => 'b',
        FileKind::Fifo => 'p',
        FileKind::Socket => 's',
    };
    println!(
        "{}{:04o} {:>6} {:>5}:{:<5} {:>10} {}",
        kind,
        entry.attrs.perm(),
        entry.fileid,
        entry.attrs.uid,
        entry.attrs.gid,
        entry.attrs.size,
        entry.name.to_string_lossy()
    );
}

fn parse_mountpoint(s: &str) -> Result<(PathBuf, PathBuf), String> {
    match s.split_once('=') {
        Some((logical, physical)) if !logical.is_empty() && !physical.is_empty() => {
            Ok((PathBuf::from(logical), PathBuf::from(physical)))
        }
        _ => Err(format!("expected LOGICAL=PHYSICAL, got {:?}", s)),
    }
}

/// Expand ~ to home directory in a path given on the command line
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
