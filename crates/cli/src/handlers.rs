//! Command handlers for dropline CLI

use crate::wizard::run_init_wizard;
use anyhow::{anyhow, Result};
use clap::Command;
use clap_complete::{generate, Shell as ClapShell};
use console::style;
use dropline_core::config::{get_config_path, TOKEN_ENV};
use dropline_core::{
    load_config_from, resolve_token, validate_config, CommitOptions, ConfigFile, DropboxClient,
    Error, FileMetadata, PollOptions, WriteMode, MAX_BATCH_ENTRIES,
};
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tabled::{Table, Tabled};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

/// Uploads started concurrently while filling a batch
const UPLOAD_CONCURRENCY: usize = 8;

/// Global options shared by every command
pub struct Context {
    config_path: Option<PathBuf>,
    token_file: Option<PathBuf>,
}

impl Context {
    pub fn new(config_path: Option<PathBuf>, token_file: Option<PathBuf>) -> Self {
        Self {
            config_path,
            token_file,
        }
    }

    pub fn config_path(&self) -> Result<PathBuf> {
        match &self.config_path {
            Some(path) => Ok(path.clone()),
            None => Ok(get_config_path()?),
        }
    }

    pub fn load_config(&self) -> Result<ConfigFile> {
        Ok(load_config_from(&self.config_path()?)?)
    }

    /// Config file, or defaults when the token comes from elsewhere
    fn load_config_or_default(&self) -> Result<ConfigFile> {
        match load_config_from(&self.config_path()?) {
            Ok(config) => Ok(config),
            Err(Error::ConfigNotFound(_))
                if self.token_file.is_some() || std::env::var_os(TOKEN_ENV).is_some() =>
            {
                Ok(ConfigFile::default())
            }
            Err(Error::ConfigNotFound(path)) => Err(anyhow!(
                "Configuration not found at {} (run 'dropline init', pass --token-file or set {})",
                path.display(),
                TOKEN_ENV
            )),
            Err(e) => Err(e.into()),
        }
    }

    pub fn client(&self) -> Result<(ConfigFile, DropboxClient)> {
        let config = self.load_config_or_default()?;
        let token = resolve_token(&config, self.token_file.as_deref())?;
        let client = config.client(token)?;
        Ok((config, client))
    }
}

/// Handle init command
pub async fn handle_init(ctx: &Context) -> Result<()> {
    run_init_wizard(&ctx.config_path()?).await
}

/// Handle config commands
pub async fn handle_config(ctx: &Context, action: &str) -> Result<()> {
    match action {
        "show" => {
            let config = ctx.load_config()?;

            println!("Current configuration:");
            println!();

            println!("Auth:");
            match (&config.auth.token, &config.auth.token_file) {
                (Some(token), _) => println!("  Token: {}", mask_token(token)),
                (None, Some(file)) => println!("  Token file: {}", file),
                (None, None) => println!("  Token: not configured"),
            }
            if std::env::var_os(TOKEN_ENV).is_some() {
                println!("  Overridden by {}", TOKEN_ENV);
            }
            println!();

            let endpoints = config.endpoints();
            println!("Endpoints:");
            println!("  API: {}", endpoints.api_url);
            println!("  Content: {}", endpoints.content_url);
            println!();

            let policy = config.retry_policy()?;
            let statuses: Vec<String> = policy
                .retry_statuses
                .iter()
                .map(|s| s.as_u16().to_string())
                .collect();
            println!("Retry:");
            println!("  Max attempts: {}", policy.max_attempts);
            println!("  Retry statuses: {}", statuses.join(", "));
            println!("  When exhausted: {:?}", policy.on_exhausted);
            println!();

            let http = config.http();
            println!("HTTP:");
            println!("  Connections per host: {}", http.max_connections_per_host);
            println!("  Timeout: {}s", http.timeout);
            println!();

            let options = config.commit_options()?;
            println!("Upload:");
            println!("  Mode: {}", options.mode);
            println!("  Autorename: {}", options.autorename);
            println!("  Mute: {}", options.mute);
            println!("  Poll interval: {}s", config.poll_interval().as_secs());

            Ok(())
        }
        "validate" => {
            println!("Validating configuration...");

            let config = ctx.load_config()?;
            validate_config(&config)?;
            println!("  {} Valid configuration format", style("✅").green());

            println!("  Checking token...");
            let (_, client) = ctx.client()?;
            client.validate().await?;
            println!("  {} Token accepted by Dropbox", style("✅").green());

            Ok(())
        }
        "path" => {
            println!("{}", ctx.config_path()?.display());
            Ok(())
        }
        _ => {
            println!("Unknown action: {}", action);
            println!("Available actions: show, validate, path");
            Ok(())
        }
    }
}

/// Handle download command
pub async fn handle_download(
    ctx: &Context,
    remote: &str,
    dest: Option<&Path>,
    folder: bool,
) -> Result<()> {
    let (_, client) = ctx.client()?;

    let saved = if folder {
        client.download_folder(remote, dest).await?
    } else {
        client.download_file(remote, dest).await?
    };

    println!("{} Saved to {}", style("✅").green(), saved.display());
    Ok(())
}

/// Handle fetch command
pub async fn handle_fetch(ctx: &Context, link: &str, dest: Option<&Path>) -> Result<()> {
    let (_, client) = ctx.client()?;
    let saved = client.download_shared_link(link, dest).await?;

    println!("{} Saved to {}", style("✅").green(), saved.display());
    Ok(())
}

/// Arguments of the upload command
pub struct UploadArgs {
    pub paths: Vec<PathBuf>,
    pub to: String,
    pub single: bool,
    pub mode: Option<String>,
    pub autorename: bool,
    pub mute: bool,
    pub poll_interval: Option<u64>,
    pub deadline: Option<u64>,
}

#[derive(Tabled)]
struct UploadRow {
    status: String,
    path: String,
    size: String,
    modified: String,
}

impl UploadRow {
    fn from_metadata(entry: &FileMetadata) -> Self {
        if entry.is_failure() {
            let reason = entry
                .get("failure")
                .and_then(|f| f.get(".tag"))
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            return Self::failed("-", reason);
        }

        Self {
            status: "✅ Uploaded".to_string(),
            path: entry.path_display().or(entry.name()).unwrap_or("-").to_string(),
            size: entry.size().map(format_bytes).unwrap_or_else(|| "-".to_string()),
            modified: entry
                .server_modified()
                .map(format_date)
                .unwrap_or_else(|| "-".to_string()),
        }
    }

    fn failed(path: &str, reason: &str) -> Self {
        Self {
            status: format!("❌ {}", reason),
            path: path.to_string(),
            size: "-".to_string(),
            modified: "-".to_string(),
        }
    }

    fn is_failure(&self) -> bool {
        self.status.starts_with('❌')
    }
}

/// Handle upload command
pub async fn handle_upload(ctx: &Context, args: UploadArgs) -> Result<()> {
    let (config, client) = ctx.client()?;

    let mut options = config.commit_options()?;
    if let Some(mode) = &args.mode {
        options.mode = mode.parse::<WriteMode>()?;
    }
    options.autorename |= args.autorename;
    options.mute |= args.mute;

    let files = collect_uploads(&args.paths, &args.to)?;
    if files.is_empty() {
        println!("Nothing to upload");
        return Ok(());
    }

    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    let rows = if args.single {
        upload_each(&client, &files, &options, &pb).await
    } else {
        let interval = args
            .poll_interval
            .map(Duration::from_secs)
            .unwrap_or_else(|| config.poll_interval());
        let mut poll = PollOptions::every(interval).cancel_on(cancel_on_ctrl_c());
        if let Some(deadline) = args.deadline {
            poll = poll.deadline(Duration::from_secs(deadline));
        }
        upload_batched(&client, &files, &options, &poll, &pb).await?
    };

    pb.finish_and_clear();

    let total = rows.len();
    let failed = rows.iter().filter(|row| row.is_failure()).count();
    println!("{}", Table::new(rows));

    if failed > 0 {
        return Err(anyhow!("{} of {} uploads failed", failed, total));
    }
    println!("{} {} file(s) uploaded", style("✅").green(), total);
    Ok(())
}

async fn upload_each(
    client: &DropboxClient,
    files: &[(PathBuf, String)],
    options: &CommitOptions,
    pb: &ProgressBar,
) -> Vec<UploadRow> {
    let mut rows = Vec::with_capacity(files.len());
    for (local, remote) in files {
        pb.set_message(remote.clone());
        let row = match client.upload_single(local, remote, options).await {
            Ok(entry) => UploadRow::from_metadata(&entry),
            Err(e) => UploadRow::failed(remote, &e.to_string()),
        };
        rows.push(row);
        pb.inc(1);
    }
    rows
}

async fn upload_batched(
    client: &DropboxClient,
    files: &[(PathBuf, String)],
    options: &CommitOptions,
    poll: &PollOptions,
    pb: &ProgressBar,
) -> Result<Vec<UploadRow>> {
    let mut rows = Vec::with_capacity(files.len());

    for chunk in files.chunks(MAX_BATCH_ENTRIES) {
        let started: Vec<_> = stream::iter(chunk)
            .map(|(local, remote)| async move {
                let result = client.begin_upload(local, remote, options).await;
                pb.inc(1);
                (remote, result)
            })
            .buffer_unordered(UPLOAD_CONCURRENCY)
            .collect()
            .await;

        for (remote, result) in started {
            if let Err(e) = result {
                rows.push(UploadRow::failed(remote, &e.to_string()));
            }
        }

        if client.batch().is_empty() {
            continue;
        }

        pb.set_message("committing batch...");
        let entries = client.finish_batch(poll).await?;
        rows.extend(entries.iter().map(UploadRow::from_metadata));
    }

    Ok(rows)
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let guard = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            guard.cancel();
        }
    });
    token
}

/// Expand directories and pair every local file with its remote path
fn collect_uploads(paths: &[PathBuf], remote_folder: &str) -> Result<Vec<(PathBuf, String)>> {
    let mut files = Vec::new();

    for path in paths {
        if path.is_file() {
            let name = path
                .file_name()
                .ok_or_else(|| anyhow!("Invalid file name: {}", path.display()))?;
            files.push((path.clone(), join_remote(remote_folder, &name.to_string_lossy())));
        } else if path.is_dir() {
            let base = path.parent().unwrap_or(path.as_path());
            for entry in WalkDir::new(path).sort_by_file_name() {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry.path().strip_prefix(base)?;
                let relative: Vec<String> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                files.push((
                    entry.path().to_path_buf(),
                    join_remote(remote_folder, &relative.join("/")),
                ));
            }
        } else {
            return Err(Error::LocalFileNotFound(path.clone()).into());
        }
    }

    Ok(files)
}

fn join_remote(folder: &str, relative: &str) -> String {
    format!(
        "{}/{}",
        folder.trim_end_matches('/'),
        relative.trim_start_matches('/')
    )
}

/// Handle share command
pub async fn handle_share(ctx: &Context, path: &str) -> Result<()> {
    let (_, client) = ctx.client()?;
    let url = client.create_shared_link(path).await?;
    println!("{}", url);
    Ok(())
}

/// Handle link-info command
pub async fn handle_link_info(ctx: &Context, url: &str, output: &str) -> Result<()> {
    let (_, client) = ctx.client()?;
    let metadata = client.shared_link_metadata(url).await?;

    match output {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&metadata)?);
        }
        _ => {
            #[derive(Tabled)]
            struct FieldRow {
                field: String,
                value: String,
            }

            let rows: Vec<FieldRow> = metadata
                .as_object()
                .into_iter()
                .flatten()
                .filter_map(|(key, value)| {
                    let value = match value {
                        Value::String(s) if key == "server_modified" || key == "client_modified" => {
                            format_date(s)
                        }
                        Value::String(s) => s.clone(),
                        Value::Number(n) if key == "size" => {
                            n.as_u64().map(format_bytes).unwrap_or_else(|| n.to_string())
                        }
                        Value::Number(n) => n.to_string(),
                        Value::Bool(b) => b.to_string(),
                        _ => return None,
                    };
                    Some(FieldRow {
                        field: key.clone(),
                        value,
                    })
                })
                .collect();

            println!("{}", Table::new(rows));
        }
    }

    Ok(())
}

/// Mask all but the first characters of a token
fn mask_token(token: &str) -> String {
    let visible: String = token.chars().take(6).collect();
    format!("{}...", visible)
}

/// Format ISO date to readable format
fn format_date(iso_date: &str) -> String {
    match chrono::DateTime::parse_from_rfc3339(iso_date) {
        Ok(dt) => dt.format("%Y-%m-%d %H:%M").to_string(),
        Err(_) => iso_date.to_string(),
    }
}

/// Format bytes to human-readable size
fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Handle shell completion generation
pub async fn handle_completion(shell: &str, cmd: &mut Command) -> Result<()> {
    use std::io;

    let clap_shell = match shell {
        "bash" => ClapShell::Bash,
        "zsh" => ClapShell::Zsh,
        "fish" => ClapShell::Fish,
        "elvish" => ClapShell::Elvish,
        "powershell" | "pwsh" => ClapShell::PowerShell,
        _ => {
            return Err(anyhow!(
                "Unsupported shell: {}\nSupported shells: bash, zsh, fish, elvish, powershell",
                shell
            ));
        }
    };

    // Script on stdout, instructions on stderr so the output can be sourced
    generate(clap_shell, cmd, "dropline", &mut io::stdout());

    eprintln!();
    eprintln!("Installation instructions:");
    match clap_shell {
        ClapShell::Bash => {
            eprintln!("  # Add to your ~/.bashrc:");
            eprintln!("  source <(dropline completion bash)");
        }
        ClapShell::Zsh => {
            eprintln!("  dropline completion zsh > ~/.zsh/completion/_dropline");
            eprintln!("  # then add to ~/.zshrc:");
            eprintln!("  fpath=(~/.zsh/completion $fpath)");
            eprintln!("  autoload -U compinit && compinit");
        }
        ClapShell::Fish => {
            eprintln!("  dropline completion fish > ~/.config/fish/completions/dropline.fish");
        }
        ClapShell::Elvish => {
            eprintln!("  dropline completion elvish > ~/.elvish/lib/dropline.elv");
        }
        _ => {
            eprintln!("  dropline completion powershell > $PROFILE");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_remote() {
        assert_eq!(join_remote("/", "a.txt"), "/a.txt");
        assert_eq!(join_remote("/Backups/", "a.txt"), "/Backups/a.txt");
        assert_eq!(join_remote("/Backups", "/dir/a.txt"), "/Backups/dir/a.txt");
    }

    #[test]
    fn test_collect_uploads_walks_directories() {
        let dir = tempfile::tempdir().unwrap();
        let photos = dir.path().join("photos");
        std::fs::create_dir_all(photos.join("2024")).unwrap();
        std::fs::write(photos.join("a.jpg"), b"a").unwrap();
        std::fs::write(photos.join("2024").join("b.jpg"), b"b").unwrap();
        let single = dir.path().join("notes.txt");
        std::fs::write(&single, b"n").unwrap();

        let files = collect_uploads(&[single.clone(), photos.clone()], "/up").unwrap();
        let remotes: Vec<&str> = files.iter().map(|(_, r)| r.as_str()).collect();

        assert_eq!(remotes, vec!["/up/notes.txt", "/up/photos/2024/b.jpg", "/up/photos/a.jpg"]);
        assert_eq!(files[0].0, single);
    }

    #[test]
    fn test_collect_uploads_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        assert!(collect_uploads(&[dir.path().join("absent")], "/").is_err());
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_date("2024-05-01T10:30:00Z"), "2024-05-01 10:30");
        assert_eq!(format_date("not a date"), "not a date");
        assert_eq!(mask_token("sl.abcdefghijk"), "sl.abc...");
    }

    #[test]
    fn test_failure_rows() {
        let entry = FileMetadata::from(
            serde_json::json!({ ".tag": "failure", "failure": { ".tag": "too_many_write_operations" } })
                .as_object()
                .unwrap()
                .clone(),
        );
        let row = UploadRow::from_metadata(&entry);
        assert!(row.is_failure());
        assert!(row.status.contains("too_many_write_operations"));
    }
}
