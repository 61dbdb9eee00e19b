use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use devcom::service::EchoHandler;
use devcom::{setup_tracing, AppError, AppResult, DevcomConfig, Server, GLOBAL_CONFIG};
use dotenv::dotenv;
use tokio::runtime;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, trace};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    /// directory for the rolling log files
    #[arg(long, default_value = "./logs")]
    pub log_dir: String,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

fn load_config(conf: Option<&String>) -> AppResult<DevcomConfig> {
    match conf {
        Some(path) => DevcomConfig::set_up_config(PathBuf::from(path)),
        None => {
            let path = PathBuf::from("./conf.toml");
            if path.exists() {
                DevcomConfig::set_up_config(path)
            } else {
                Ok(DevcomConfig::default())
            }
        }
    }
}

fn main() -> AppResult<()> {
    dotenv().ok();

    let commandline: CommandLine = CommandLine::parse();
    let config = load_config(commandline.conf.as_ref())?;
    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", config);
        return Ok(());
    }

    // an explicit RUST_LOG wins over -v
    if std::env::var_os("RUST_LOG").is_none() {
        let level = match commandline.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", format!("devcom={}", level));
    }

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let _tracing_guard = setup_tracing(&commandline.log_dir);

    GLOBAL_CONFIG
        .set(config)
        .map_err(|_| AppError::IllegalStateError("config already set".to_string()))?;
    let config = devcom::global_config();

    rt.block_on(async {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);

        let server = Server::bind(config, notify_shutdown.clone(), shutdown_complete_tx).await?;
        let handler = Arc::new(EchoHandler::new(config.network.max_package_size));
        server.run_until(handler, signal::ctrl_c()).await?;

        // stop accepting, then tell every connection task to finish
        drop(server);
        let _ = notify_shutdown.send(());
        trace!("waiting for shutdown complete...");
        let _ = shutdown_complete_rx.recv().await;
        info!("devcom shutdown complete");
        Ok::<(), AppError>(())
    })
}
