//! Standalone RTSP server binary (§6: CLI and configuration file).

use std::io::Read;
use std::path::Path;
use std::sync::mpsc;

use clap::Parser;
use rtsp::{Config, Result, RtspError, Server};

/// Special `confpath` value that reads the YAML document from stdin
/// instead of a file.
const STDIN_CONFPATH: &str = "stdin";

/// Default `confpath`, used with no arguments. Unlike any other path, a
/// missing file here is not an error — the server just starts with
/// [`Config::default`].
const DEFAULT_CONFPATH: &str = "conf.yml";

#[derive(Parser)]
#[command(name = "rtsp-server", version, about = "RTSP server that mediates publishers and readers")]
struct Args {
    /// Path to a YAML configuration file, or `stdin` to read one from
    /// standard input.
    #[arg(default_value = DEFAULT_CONFPATH)]
    confpath: String,
}

fn load_config(confpath: &str) -> Result<Config> {
    if confpath == STDIN_CONFPATH {
        let mut raw = String::new();
        std::io::stdin()
            .read_to_string(&mut raw)
            .map_err(RtspError::Io)?;
        return Config::from_yaml(&raw);
    }

    let path = Path::new(confpath);
    if !path.exists() {
        if confpath == DEFAULT_CONFPATH {
            return Ok(Config::default());
        }
        return Err(RtspError::Config(format!(
            "configuration file not found: {confpath}"
        )));
    }

    let raw = std::fs::read_to_string(path).map_err(RtspError::Io)?;
    Config::from_yaml(&raw)
}

fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let config = match load_config(&args.confpath) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let server = match Server::start(config) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("failed to start server: {e}");
            std::process::exit(1);
        }
    };

    let (tx, rx) = mpsc::channel();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = tx.send(());
    }) {
        eprintln!("failed to install signal handler: {e}");
        std::process::exit(1);
    }

    let _ = rx.recv();
    if let Err(e) = server.stop() {
        eprintln!("error during shutdown: {e}");
        std::process::exit(1);
    }
}
