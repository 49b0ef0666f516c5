//! Stills uploader entry point.
//!
//! ```text
//! stills-uploader                   Connect and upload until Ctrl-C
//! stills-uploader --config <path>   Load a custom config TOML
//! stills-uploader --address <addr>  Override the switcher address
//! stills-uploader --attempts <n>    Stop after n upload attempts
//! stills-uploader --gen-config      Write default config to stdout
//! ```

use std::io::BufRead;
use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use stills_uploader::config::UploaderConfig;
use stills_uploader::uploader::Uploader;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "stills-uploader", about = "Repeatedly upload a still to a switcher's media pool")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "stills-uploader.toml")]
    config: PathBuf,

    /// Switcher address, overriding `device.address`.
    #[arg(short, long)]
    address: Option<String>,

    /// Stop after this many upload attempts.
    #[arg(short = 'n', long)]
    attempts: Option<u64>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Exit immediately on failure instead of waiting for Enter.
    #[arg(long)]
    no_prompt: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&UploaderConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = match UploaderConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => fatal(
            &format!("Invalid config {}: {e}", cli.config.display()),
            cli.no_prompt,
        ),
    };
    if let Some(address) = cli.address {
        config.device.address = address;
    }
    if let Some(attempts) = cli.attempts {
        config.upload.max_attempts = Some(attempts);
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("stills-uploader v{}", env!("CARGO_PKG_VERSION"));
    info!("switcher: {}", config.device.address);
    info!(
        "frame: {}x{} {:?}",
        config.frame.width, config.frame.height, config.frame.format
    );

    let uploader = Uploader::simulated(config);

    let session = match uploader.connect().await {
        Ok(session) => session,
        Err(e) => fatal(&e.to_string(), cli.no_prompt),
    };
    println!("Connected");
    info!("product: {}", session.product_name());

    let mut upload_loop = match uploader.build_loop(&session) {
        Ok(upload_loop) => upload_loop,
        Err(e) => fatal(&e.to_string(), cli.no_prompt),
    };

    let stop = upload_loop.stop_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, finishing current upload");
        stop.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    match upload_loop.run().await {
        Ok(stats) => {
            info!(
                attempts = stats.attempts,
                completed = stats.completed,
                cancelled = stats.cancelled,
                failed = stats.failed,
                timeouts = stats.timeouts,
                connected = ?session.connected_for(),
                "done"
            );
            Ok(())
        }
        Err(e) => fatal(&e.to_string(), cli.no_prompt),
    }
}

/// Report a fatal failure, let the operator read it, and exit with 1.
fn fatal(message: &str, no_prompt: bool) -> ! {
    println!("{message}");
    if !no_prompt {
        println!("Press enter to exit...");
        let mut line = String::new();
        let _ = std::io::stdin().lock().read_line(&mut line);
    }
    std::process::exit(1);
}
