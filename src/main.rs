use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use kindling_lib::download::http_client;
use kindling_lib::events::OutputStream;
use kindling_lib::launcher::LaunchOptions;
use kindling_lib::release::{
    assets_for_platform, fetch_latest_release, is_update_available, matching_asset, DownloadAsset,
    InstallOptions, DEFAULT_RELEASES_API,
};
use kindling_lib::{AppState, LauncherConfig, LauncherEvent};

#[derive(Parser)]
#[command(name = "kindling")]
#[command(about = "Install, launch and share a local KoboldCpp-compatible backend")]
struct Cli {
    /// Directory holding backends, cached models and settings
    #[arg(long, global = true)]
    install_dir: Option<PathBuf>,

    /// Port of the local proxy (0 picks a free one)
    #[arg(long, global = true)]
    proxy_port: Option<u16>,

    /// Show every backend output line
    #[arg(long, global = true)]
    debug: bool,

    /// Use this cloudflared binary instead of downloading one
    #[arg(long, global = true)]
    cloudflared: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List installed backends
    List,
    /// Download and unpack a packed release
    Install {
        url: String,
        version: String,
        /// Asset file name (defaults to the last URL segment)
        #[arg(long)]
        name: Option<String>,
        /// Replace the current backend once installed
        #[arg(long)]
        update: bool,
    },
    /// Compare the current backend with the latest published release
    CheckUpdate {
        #[arg(long, default_value = DEFAULT_RELEASES_API)]
        api: String,
        /// Install the matching asset when an update exists
        #[arg(long)]
        install: bool,
    },
    /// Make an installed launcher the current backend
    Use { path: PathBuf },
    /// Delete an installed backend
    Remove { path: PathBuf },
    /// Download a remote model into the cache and print its local path
    Resolve {
        url: String,
        #[arg(long, default_value = "model")]
        param_type: String,
    },
    /// Launch the current backend and keep it running until Ctrl-C
    Launch {
        /// Expose the UI through a public tunnel
        #[arg(long)]
        tunnel: bool,
        #[arg(long, default_value = kindling_lib::launcher::BUILTIN_FRONTEND)]
        frontend: String,
        /// Shell command to start alongside the backend (repeatable)
        #[arg(long = "pre-launch")]
        pre_launch: Vec<String>,
        /// Backend arguments
        #[arg(last = true)]
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    kindling_lib::init_logging();

    let cli = Cli::parse();

    let mut config = match cli.install_dir {
        Some(dir) => LauncherConfig::with_install_dir(dir),
        None => LauncherConfig::from_env(),
    };
    if let Some(port) = cli.proxy_port {
        config.proxy_port = port;
    }
    if cli.debug {
        config.debug_output = true;
    }
    if let Some(binary) = cli.cloudflared {
        config.tunnel_binary = Some(binary);
    }

    let state = AppState::new(config)?;
    tokio::spawn(print_events(state.events.subscribe()));

    match cli.command {
        Commands::List => list(&state).await,
        Commands::Install {
            url,
            version,
            name,
            update,
        } => {
            let name = match name {
                Some(name) => name,
                None => asset_name_from_url(&url)?,
            };
            let asset = DownloadAsset {
                name,
                source_url: url,
                expected_size_bytes: 0,
                version,
            };
            install(&state, &asset, update).await
        }
        Commands::CheckUpdate { api, install: apply } => check_update(&state, &api, apply).await,
        Commands::Use { path } => {
            state.registry.set_current(&path).await?;
            println!("Current backend: {}", path.display());
            Ok(())
        }
        Commands::Remove { path } => {
            state.registry.delete(&path).await?;
            println!("Removed {}", path.display());
            Ok(())
        }
        Commands::Resolve { url, param_type } => {
            let local = state
                .resolver
                .resolve(&url, &param_type, &CancellationToken::new())
                .await?;
            println!("{}", local);
            Ok(())
        }
        Commands::Launch {
            tunnel,
            frontend,
            pre_launch,
            args,
        } => {
            launch(
                &state,
                LaunchOptions {
                    args,
                    frontend,
                    pre_launch_commands: pre_launch,
                    tunnel,
                },
            )
            .await
        }
    }
}

async fn list(state: &AppState) -> anyhow::Result<()> {
    let current = state.registry.current_path();
    let backends = state.registry.list_backends().await;

    if backends.is_empty() {
        println!("No backends installed in {}", state.registry.install_dir().display());
        return Ok(());
    }

    for backend in backends {
        let marker = if current.as_deref() == Some(backend.path.as_path()) { "*" } else { " " };
        let actual = backend
            .actual_version
            .as_deref()
            .map(|v| format!(" (reports {})", v))
            .unwrap_or_default();
        println!(
            "{} {:<32} {:<10}{} {:>8.1} MB  {}",
            marker,
            backend.folder_name,
            backend.version,
            actual,
            backend.size_bytes as f64 / 1_048_576.0,
            backend.path.display()
        );
    }
    Ok(())
}

async fn install(state: &AppState, asset: &DownloadAsset, update: bool) -> anyhow::Result<()> {
    let current = state.registry.get_current().await?;
    let options = InstallOptions {
        is_update: update,
        was_current: update && current.is_some(),
        old_backend_path: if update { current.map(|b| b.path) } else { None },
    };

    let launcher = state
        .installer
        .install(asset, &options, &CancellationToken::new())
        .await?;
    println!("Installed {}", launcher.display());
    Ok(())
}

async fn check_update(state: &AppState, api: &str, apply: bool) -> anyhow::Result<()> {
    let Some(current) = state.registry.get_current().await? else {
        bail!("No backend installed");
    };

    let release = fetch_latest_release(&http_client()?, api).await?;
    if !is_update_available(&current, release.version()) {
        println!("{} is up to date", current.version);
        return Ok(());
    }

    let assets = assets_for_platform(&release);
    let Some(asset) = matching_asset(&current, &assets) else {
        bail!(
            "Release {} has no asset matching {}",
            release.tag_name,
            current.folder_name
        );
    };

    println!("Update available: {} -> {} ({})", current.version, asset.version, asset.name);
    if apply {
        install(state, asset, true).await?;
    }
    Ok(())
}

async fn launch(state: &AppState, options: LaunchOptions) -> anyhow::Result<()> {
    let mut events = state.events.subscribe();

    let pid = state.launcher.launch(options).await?;
    println!("Backend running (pid {}) behind {}", pid, state.launcher.proxy_url().await);

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break Ok(()),
            event = events.recv() => match event {
                Ok(LauncherEvent::Crashed(report)) => break Err(anyhow::anyhow!(report.message)),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break Ok(()),
            },
        }
    };

    state.launcher.stop().await;
    outcome
}

async fn print_events(mut events: broadcast::Receiver<LauncherEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::debug!("Event printer skipped {} events", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        match event {
            LauncherEvent::Output { stream, line } => match stream {
                OutputStream::Stdout => println!("{}", line),
                OutputStream::Stderr => eprintln!("{}", line),
            },
            LauncherEvent::DownloadProgress(p) => {
                let eta = p.eta_secs.map(|s| format!(", {}s left", s)).unwrap_or_default();
                eprintln!(
                    "{}: {:.1}% ({:.1} MB/s{})",
                    p.label,
                    p.percent,
                    p.speed_bps / 1_048_576.0,
                    eta
                );
            }
            LauncherEvent::TunnelUrlChanged { url: Some(url) } => println!("Public URL: {}", url),
            LauncherEvent::TunnelUrlChanged { url: None } => {}
            LauncherEvent::LaunchFailed { message } => eprintln!("Launch failed: {}", message),
            LauncherEvent::Crashed(report) => eprintln!("Backend crashed: {}", report.message),
            other => log::debug!("{:?}", other),
        }
    }
}

fn asset_name_from_url(url: &str) -> anyhow::Result<String> {
    let parsed = reqwest::Url::parse(url).with_context(|| format!("Invalid URL {}", url))?;
    match parsed.path_segments().and_then(|s| s.last()).filter(|s| !s.is_empty()) {
        Some(name) => Ok(name.to_string()),
        None => bail!("Cannot derive an asset name from {}; pass --name", url),
    }
}
