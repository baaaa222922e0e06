use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use marginalia_sync::SyncConfig;

#[derive(Debug, Parser)]
#[command(name = "marginalia")]
#[command(about = "Collect Kindle notebook highlights into a JSON snapshot")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape the notebook, merge with the saved snapshot and publish it.
    Sync {
        /// Amazon storefront: com or co.uk.
        #[arg(long)]
        region: Option<String>,
        /// Save locally without uploading to the gist.
        #[arg(long)]
        no_upload: bool,
    },
    /// Sign in through a visible browser and save the session.
    Login {
        #[arg(long)]
        region: Option<String>,
    },
    /// Upload an existing snapshot file to the gist.
    Upload {
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long)]
        filename: Option<String>,
    },
    /// Serve the highlight viewer.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        region: None,
        no_upload: false,
    }) {
        Commands::Sync { region, no_upload } => {
            let summary = marginalia_sync::run_sync_once_from_env(region.as_deref(), !no_upload).await?;
            println!(
                "sync complete: run_id={} scraped={} total={} output={}",
                summary.run_id, summary.scraped, summary.merged, summary.output_path
            );
            if let Some(raw_url) = summary.raw_url {
                println!("raw url: {raw_url}");
                if let Some(stable) = SyncConfig::from_env().stable_raw_url(None) {
                    println!("stable url: {stable}");
                }
            }
        }
        Commands::Login { region } => {
            let config = SyncConfig::from_env().with_region(region.as_deref());
            let notebook_url = config.notebook_url();
            let auth_path = config.auth_path();
            let state = tokio::task::spawn_blocking(move || {
                marginalia_adapters::interactive_login(&notebook_url, &auth_path, wait_for_enter)
            })
            .await
            .context("login task failed to complete")??;
            println!(
                "saved {} cookies to {}",
                state.cookies.len(),
                config.auth_path().display()
            );
            println!(
                "for CI, store the output of `base64 -w0 {}` as AMAZON_AUTH_JSON_B64",
                config.auth_path().display()
            );
        }
        Commands::Upload { file, filename } => {
            let config = SyncConfig::from_env();
            let raw_url =
                marginalia_sync::upload_saved_snapshot(&config, file.as_deref(), filename.as_deref()).await?;
            println!("uploaded: {raw_url}");
            if let Some(stable) = config.stable_raw_url(filename.as_deref()) {
                println!("stable url: {stable}");
            }
        }
        Commands::Serve { port } => {
            marginalia_web::serve_from_env(port).await?;
        }
    }

    Ok(())
}

fn wait_for_enter() -> io::Result<()> {
    print!("Sign in to Amazon in the browser window, then press Enter here... ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(())
}
