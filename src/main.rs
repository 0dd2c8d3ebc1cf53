use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use geode::codec::CodecId;
use geode::engine::{BackupEngine, EngineOptions, MANIFEST_ENTRY};
use geode::io_stream::ArchiveReader;
use geode::manifest::Manifest;
use geode::task::{self, OperationHandle};
use geode::{CancelToken, DirectoryStore, ImportMode, Limits, Passphrase};
use std::fmt::Debug;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "geode", about = "Back up and restore a specimen collection (.geode archives)")]
struct Cli {
    /// More log output (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export a collection directory into an archive
    Export {
        #[arg(short, long)]
        collection: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Encrypt with AES-256-GCM (Argon2id key derivation)
        #[arg(short, long, env = "GEODE_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        /// Codec for asset entries: lz4 (default), zstd, brotli, none
        #[arg(long, default_value = "lz4")]
        asset_codec: String,
        /// Compression level (zstd 1-19; brotli 0-11; ignored for lz4)
        #[arg(short, long, default_value = "3")]
        level: i32,
    },
    /// Import an archive into a collection directory
    Import {
        input: PathBuf,
        #[arg(short, long)]
        collection: PathBuf,
        #[arg(short, long, value_enum, default_value_t = Mode::Merge)]
        mode: Mode,
        #[arg(short, long, env = "GEODE_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Show superblock, manifest and entry table; verifies digests
    Inspect {
        input: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Merge,
    Replace,
}

impl From<Mode> for ImportMode {
    fn from(m: Mode) -> Self {
        match m {
            Mode::Merge => ImportMode::Merge,
            Mode::Replace => ImportMode::Replace,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let default_filter = match cli.verbose {
        0 => "geode=info",
        1 => "geode=debug",
        _ => "geode=trace",
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    match cli.command {
        // ── Export ───────────────────────────────────────────────────────────
        Commands::Export { collection, output, password, asset_codec, level } => {
            let options = EngineOptions {
                compression_level: level,
                asset_codec: parse_codec(&asset_codec),
                ..EngineOptions::default()
            };
            let engine = Arc::new(BackupEngine::with_options(DirectoryStore::open(&collection)?, options));
            let op = task::spawn_export(engine, output.clone(), password.map(Passphrase::from));
            let handle = follow(op).await?;
            println!("Created: {}", output.display());
            println!("  Records   {}", handle.manifest.counts.primary_records);
            println!("  Assets    {}", handle.manifest.counts.asset_files);
            println!("  Encrypted {}", handle.manifest.encrypted);
            println!("  Size      {} B", handle.bytes_written);
        }

        // ── Import ───────────────────────────────────────────────────────────
        Commands::Import { input, collection, mode, password } => {
            let engine = Arc::new(BackupEngine::new(DirectoryStore::open(&collection)?));
            let staged = follow(task::spawn_stage(engine.clone(), input.clone())).await?;
            if staged.is_encrypted() && password.is_none() {
                return Err("archive is encrypted: pass --password or set GEODE_PASSWORD".into());
            }
            let op = task::spawn_apply(engine, Arc::new(staged), password.map(Passphrase::from), mode.into());
            let result = follow(op).await?;
            println!("Imported {} into {}", input.display(), collection.display());
            println!("  Imported  {}", result.imported);
            println!("  Skipped   {}", result.skipped);
            for e in &result.errors {
                println!("  {:?}  {}: {}", e.kind, e.subject, e.reason);
            }
        }

        // ── Inspect ──────────────────────────────────────────────────────────
        Commands::Inspect { input } => {
            let mut reader = ArchiveReader::open(BufReader::new(File::open(&input)?))?;
            let sb = reader.superblock().clone();
            println!("── .geode Archive ───────────────────────────────────────");
            println!("  Path           {}", input.display());
            println!("  Format version {}", sb.format_version);
            println!("  UUID           {}", sb.archive_uuid);
            println!("  Entries        {}", sb.entry_count);
            println!();
            println!("{:<32} {:>7} {:>12} {:>12}  Digest", "Name", "Codec", "Size", "Compressed");

            let cancel = CancelToken::new();
            let mut manifest = None;
            while let Some(mut entry) = reader.next_entry()? {
                let header = entry.header().clone();
                let digest = match header.expected_digest() {
                    Some(d) => hex::encode(&d[..6]),
                    None => "sealed".into(),
                };
                println!(
                    "{:<32} {:>7} {:>12} {:>12}  {}",
                    header.name, header.codec.name(), header.uncompressed_size, header.compressed_size, digest
                );
                if entry.path().ok() == Some(MANIFEST_ENTRY) {
                    let bytes = entry.read_capped(Limits::STANDARD.max_manifest_bytes, &cancel)?;
                    manifest = Some(Manifest::parse(&bytes)?.0);
                } else {
                    entry.copy_to(&mut io::sink(), &cancel)?;
                }
            }

            match manifest {
                Some(m) => {
                    println!();
                    println!("  Producer       {}", m.producer_id);
                    println!("  Schema         {}", m.schema_version);
                    println!("  Exported at    {}", m.exported_at);
                    println!("  Records        {}", m.counts.primary_records);
                    println!("  Assets         {}", m.counts.asset_files);
                    match &m.encryption {
                        Some(enc) => println!("  Encryption     {}", enc.algorithm_id),
                        None => println!("  Encryption     none"),
                    }
                }
                None => println!("  (no manifest entry)"),
            }
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

/// Log state transitions until the operation finishes.
async fn follow<T, E, St>(op: OperationHandle<T, E, St>) -> Result<T, E>
where
    E: From<io::Error>,
    St: Copy + Debug + Send + Sync + 'static,
{
    let mut states = op.states();
    let watcher = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            tracing::debug!(?state, "progress");
        }
    });
    let result = op.wait().await;
    watcher.abort();
    result
}

fn parse_codec(s: &str) -> CodecId {
    CodecId::from_name(s).unwrap_or_else(|| {
        eprintln!("Unknown codec '{}', defaulting to lz4", s);
        CodecId::Lz4
    })
}
