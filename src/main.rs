use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use ftlog::appender::FileAppender;

use webserv::{Config, Server, ServerError};

#[derive(Debug, Parser)]
#[command(name = "webserv", version, about = "HTTP/1.1 server with virtual hosts and CGI")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", cli.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    if cli.check {
        println!("{}: configuration ok", cli.config.display());
        return ExitCode::SUCCESS;
    }

    let level = match config.logging.level_filter() {
        Ok(level) => level,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let builder = ftlog::Builder::new().max_log_level(level);
    let builder = match &config.logging.file {
        Some(path) => builder.root(FileAppender::new(path)),
        None => builder,
    };
    // Flushes buffered log lines when dropped at exit.
    let _guard = match builder.try_init() {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to initialise logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    match serve(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn serve(config: &Config) -> Result<(), ServerError> {
    let mut server = Server::bind(config)?;
    let shutdown = server.shutdown_handle();
    ctrlc::set_handler(move || {
        log::info!("received shutdown signal, draining");
        shutdown.shutdown();
    })?;
    server.run()
}
