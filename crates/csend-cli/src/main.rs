//! csend: end-to-end encrypted file transfer client
//!
//! Commands:
//!   upload <files>...          - encrypt and upload, print the share link
//!   download <link>            - download, verify and decrypt into a directory
//!   info <id> --owner <token>  - download limit, count and expiry
//!   delete <id> --owner        - remove an upload
//!   limit <id> --owner -n <N>  - change the download limit
//!   password <link> --owner    - protect an existing link with a password

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use futures::TryStreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::SecretString;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use csend_chunks::{Archive, ArchiveFile};
use csend_core::config::{DownloadStrategy, SendConfig};
use csend_core::types::{FileMetadata, ProgressFn};
use csend_core::ByteStream;
use csend_crypto::Keychain;
use csend_transfer::{ApiClient, FileReceiver, FileSender, ShareLink, TransferSession};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "csend",
    version,
    about = "End-to-end encrypted file transfer",
    long_about = "csend: encrypt files locally, upload them to a send server, \
                  and share a link that carries the key"
)]
struct Cli {
    /// Path to csend.toml configuration file
    #[arg(long, short = 'c', env = "CSEND_CONFIG", default_value = "csend.toml")]
    config: PathBuf,

    /// Server base URL (overrides server.base_url)
    #[arg(long, short = 's', env = "CSEND_SERVER")]
    server: Option<String>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG wins if set
    #[arg(long, env = "CSEND_LOG")]
    log: Option<String>,

    /// Log format (json, text)
    #[arg(long, env = "CSEND_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq)]
enum Strategy {
    Stream,
    Buffered,
}

impl From<Strategy> for DownloadStrategy {
    fn from(s: Strategy) -> Self {
        match s {
            Strategy::Stream => DownloadStrategy::Stream,
            Strategy::Buffered => DownloadStrategy::Buffered,
        }
    }
}

#[derive(clap::Args, Debug)]
struct PasswordArgs {
    /// Password for the link
    #[arg(long, env = "CSEND_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Prompt for the password on the terminal
    #[arg(long, short = 'p', conflicts_with = "password")]
    ask_password: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encrypt and upload one or more files
    ///
    /// Several files are sent as one archive; the receiver gets them back
    /// as separate files.
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Download limit to set after the upload
        #[arg(long, short = 'n')]
        dlimit: Option<u32>,
        #[command(flatten)]
        password: PasswordArgs,
    },

    /// Download and decrypt a share link
    Download {
        /// Share link (https://host/download/<id>/#<secret>)
        link: String,
        /// Output directory
        #[arg(long, short = 'o', default_value = ".")]
        output: PathBuf,
        /// Download strategy (overrides transfer.download_strategy)
        #[arg(long)]
        strategy: Option<Strategy>,
        #[command(flatten)]
        password: PasswordArgs,
    },

    /// Show download limit, download count and expiry of an upload
    Info {
        id: String,
        /// Owner token printed by `upload`
        #[arg(long)]
        owner: String,
    },

    /// Delete an upload from the server
    Delete {
        id: String,
        #[arg(long)]
        owner: String,
    },

    /// Change the download limit of an upload
    Limit {
        id: String,
        #[arg(long)]
        owner: String,
        #[arg(long, short = 'n')]
        dlimit: u32,
    },

    /// Require a password for an existing share link
    Password {
        link: String,
        #[arg(long)]
        owner: String,
        #[command(flatten)]
        password: PasswordArgs,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = SendConfig::load(&cli.config)
        .with_context(|| format!("loading config: {}", cli.config.display()))?;
    if let Some(server) = &cli.server {
        config.server.base_url = server.clone();
        config.validate().context("--server")?;
    }

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli.log_format.clone().unwrap_or(if config.log.format == "json" {
        LogFormat::Json
    } else {
        LogFormat::Text
    });
    init_logging(&level, &format);
    if !cli.config.exists() {
        tracing::debug!(path = %cli.config.display(), "no config file, using defaults");
    }

    match cli.command {
        Commands::Upload {
            files,
            dlimit,
            password,
        } => cmd_upload(&config, &files, dlimit, read_password(&password)?).await,
        Commands::Download {
            link,
            output,
            strategy,
            password,
        } => {
            let strategy = strategy
                .map(DownloadStrategy::from)
                .unwrap_or(config.transfer.download_strategy);
            cmd_download(&config, &link, &output, strategy, read_password(&password)?).await
        }
        Commands::Info { id, owner } => cmd_info(&config, &id, &owner).await,
        Commands::Delete { id, owner } => cmd_delete(&config, &id, &owner).await,
        Commands::Limit { id, owner, dlimit } => cmd_limit(&config, &id, &owner, dlimit).await,
        Commands::Password {
            link,
            owner,
            password,
        } => {
            let password = read_password(&password)?
                .context("a password is required (--password or --ask-password)")?;
            cmd_password(&config, &link, &owner, &password).await
        }
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // logs go to stderr so stdout stays clean for links and tokens
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn read_password(args: &PasswordArgs) -> Result<Option<SecretString>> {
    if let Some(password) = &args.password {
        return Ok(Some(SecretString::from(password.clone())));
    }
    if args.ask_password {
        let password = rpassword::prompt_password("Password: ").context("reading password")?;
        if password.is_empty() {
            anyhow::bail!("empty password");
        }
        return Ok(Some(SecretString::from(password)));
    }
    Ok(None)
}

/// Cancel `session` on Ctrl-C.
/// A session for one transfer that Ctrl-C cancels.
fn cancel_on_ctrl_c() -> TransferSession {
    let session = TransferSession::new();
    let handle = session.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ncancelling...");
            handle.cancel();
        }
    });
    session
}

// ── Progress display ──────────────────────────────────────────────────────────

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::with_template(
        "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
    )
    .map(|s| s.progress_chars("=>-"))
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_prefix(prefix.to_string());
    pb
}

fn progress_callback(pb: &ProgressBar) -> ProgressFn {
    let pb = pb.clone();
    Box::new(move |done, total| {
        pb.set_length(total);
        pb.set_position(done);
    })
}

// ── `csend upload` ────────────────────────────────────────────────────────────

async fn cmd_upload(
    config: &SendConfig,
    paths: &[PathBuf],
    dlimit: Option<u32>,
    password: Option<SecretString>,
) -> Result<()> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        files.push(
            ArchiveFile::from_path(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?,
        );
    }
    let archive = Archive::new(files)?;

    let pb = make_progress_bar(archive.size(), "upload");
    pb.set_message(archive.name().to_string());

    let sender = FileSender::from_config(config)?.with_progress(progress_callback(&pb));
    let session = cancel_on_ctrl_c();

    let sent = match sender.send(&archive, password.as_ref(), &session).await {
        Ok(sent) => sent,
        Err(e) => {
            pb.abandon_with_message("failed");
            return Err(e).context("upload failed");
        }
    };
    pb.finish_with_message("done");

    if let Some(dlimit) = dlimit {
        let ok = sender
            .api()
            .set_params(&sent.id, &sent.owner_token, dlimit)
            .await?;
        if !ok {
            tracing::warn!(id = %sent.id, dlimit, "server refused the download limit");
        }
    }

    println!();
    println!("  link:    {}", sent.link);
    println!("  id:      {}", sent.id);
    println!("  owner:   {}", sent.owner_token);
    println!("  files:   {} ({})", archive.files().len(), fmt_bytes(archive.size()));
    if password.is_some() {
        println!("  password protected");
    }
    Ok(())
}

// ── `csend download` ──────────────────────────────────────────────────────────

async fn cmd_download(
    config: &SendConfig,
    link: &str,
    output: &Path,
    strategy: DownloadStrategy,
    password: Option<SecretString>,
) -> Result<()> {
    let link = ShareLink::parse(link)?;
    tokio::fs::create_dir_all(output)
        .await
        .with_context(|| format!("creating {}", output.display()))?;

    let pb = make_progress_bar(0, "download");
    let receiver = FileReceiver::from_config(config).with_progress(progress_callback(&pb));
    let session = cancel_on_ctrl_c();

    let (metadata, body) = receiver
        .receive(&link, password.as_ref(), strategy, &session)
        .await
        .context("download failed")?;
    pb.set_message(metadata.name.clone());

    let streaming = strategy == DownloadStrategy::Stream;
    if streaming {
        pb.set_length(metadata.size);
    }
    let tick = pb.clone();
    let written = write_files(output, &entries(&metadata), body, move |n| {
        if streaming {
            tick.inc(n);
        }
    })
    .await;

    match written {
        Ok(paths) => {
            pb.finish_with_message("done");
            println!();
            for path in paths {
                println!("  {}", path.display());
            }
            Ok(())
        }
        Err(e) => {
            pb.abandon_with_message("failed");
            Err(e)
        }
    }
}

/// Files to split the payload into: the manifest for archives, otherwise
/// the single named file.
fn entries(metadata: &FileMetadata) -> Vec<(String, u64)> {
    if metadata.manifest.files.len() > 1 {
        metadata
            .manifest
            .files
            .iter()
            .map(|f| (f.name.clone(), f.size))
            .collect()
    } else {
        vec![(metadata.name.clone(), metadata.size)]
    }
}

fn safe_name(name: &str) -> Result<&str> {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("refusing unsafe file name {name:?}"))
}

/// File names to write `entries` under. Entries that share a base name get
/// a ` (n)` suffix so none overwrites another.
fn output_names(entries: &[(String, u64)]) -> Result<Vec<String>> {
    let mut used = HashSet::new();
    let mut names = Vec::with_capacity(entries.len());
    for (name, _) in entries {
        let base = safe_name(name)?;
        let mut candidate = base.to_string();
        let mut n = 1;
        while !used.insert(candidate.clone()) {
            let path = Path::new(base);
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(base);
            candidate = match path.extension().and_then(|e| e.to_str()) {
                Some(ext) => format!("{stem} ({n}).{ext}"),
                None => format!("{stem} ({n})"),
            };
            n += 1;
        }
        names.push(candidate);
    }
    Ok(names)
}

/// Write the plaintext stream into `dir`, one file per entry, then check the
/// stream ends exactly there. Files already written are removed on failure.
async fn write_files(
    dir: &Path,
    entries: &[(String, u64)],
    body: ByteStream,
    on_chunk: impl Fn(u64),
) -> Result<Vec<PathBuf>> {
    let mut created = Vec::new();
    let result = write_files_inner(dir, entries, body, &on_chunk, &mut created).await;
    if result.is_err() {
        for path in &created {
            let _ = tokio::fs::remove_file(path).await;
        }
    }
    result.map(|()| created)
}

async fn write_files_inner(
    dir: &Path,
    entries: &[(String, u64)],
    mut body: ByteStream,
    on_chunk: &impl Fn(u64),
    created: &mut Vec<PathBuf>,
) -> Result<()> {
    let mut pending = Bytes::new();
    let names = output_names(entries)?;
    for ((name, size), file_name) in entries.iter().zip(&names) {
        let path = dir.join(file_name);
        let mut file = tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("creating {}", path.display()))?;
        created.push(path.clone());

        let mut remaining = *size;
        while remaining > 0 {
            if pending.is_empty() {
                match body.try_next().await? {
                    Some(chunk) => {
                        on_chunk(chunk.len() as u64);
                        pending = chunk;
                        continue;
                    }
                    None => anyhow::bail!("payload ended {remaining} bytes short of {name}"),
                }
            }
            let take = remaining.min(pending.len() as u64) as usize;
            file.write_all(&pending.split_to(take))
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            remaining -= take as u64;
        }
        file.flush().await?;
    }

    // draining to the end is what verifies the final record
    let mut extra = pending.len() as u64;
    while let Some(chunk) = body.try_next().await? {
        extra += chunk.len() as u64;
    }
    if extra > 0 {
        anyhow::bail!("payload is {extra} bytes longer than its metadata says");
    }
    Ok(())
}

// ── owner commands ────────────────────────────────────────────────────────────

async fn cmd_info(config: &SendConfig, id: &str, owner: &str) -> Result<()> {
    let api = ApiClient::new(&config.server.base_url)?;
    let info = api
        .file_info(id, owner)
        .await
        .with_context(|| format!("fetching info for {id}"))?;
    println!("  id:         {id}");
    println!("  downloads:  {} of {}", info.dtotal, info.dlimit);
    println!("  expires in: {}", fmt_duration_ms(info.ttl));
    Ok(())
}

async fn cmd_delete(config: &SendConfig, id: &str, owner: &str) -> Result<()> {
    let api = ApiClient::new(&config.server.base_url)?;
    if !api.delete(id, owner).await? {
        anyhow::bail!("server refused to delete {id}");
    }
    println!("deleted {id}");
    Ok(())
}

async fn cmd_limit(config: &SendConfig, id: &str, owner: &str, dlimit: u32) -> Result<()> {
    let api = ApiClient::new(&config.server.base_url)?;
    if !api.set_params(id, owner, dlimit).await? {
        anyhow::bail!("server refused the download limit for {id}");
    }
    println!("download limit of {id} set to {dlimit}");
    Ok(())
}

async fn cmd_password(
    config: &SendConfig,
    link: &str,
    owner: &str,
    password: &SecretString,
) -> Result<()> {
    let link = ShareLink::parse(link)?;
    let mut keychain = Keychain::new(Some(&link.secret_b64), None, None)?
        .with_pbkdf2_iterations(config.crypto.pbkdf2_iterations);
    keychain.set_password(password, &link.url)?;

    let api = ApiClient::new(link.origin())?;
    if !api.set_password(&link.id, owner, &keychain).await? {
        anyhow::bail!("server refused the password for {}", link.id);
    }
    println!("password set for {}", link.id);
    Ok(())
}

// ── Formatting ────────────────────────────────────────────────────────────────

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

fn fmt_duration_ms(ms: u64) -> String {
    let secs = ms / 1000;
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m}m")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}
