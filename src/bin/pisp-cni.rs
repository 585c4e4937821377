use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use pisp_cni::commands::run_cni;
use pisp_cni::config::Settings;

/// stdout carries the CNI result, so logs go to stderr or the debug file
fn init_tracing(settings: &Settings) {
    let level = if settings.debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_ansi(false);

    if settings.debug {
        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&settings.log_file)
        {
            Ok(file) => {
                let _ = tracing::subscriber::set_global_default(
                    builder.with_writer(Mutex::new(file)).finish(),
                );
                return;
            }
            Err(e) => eprintln!(
                "pisp-cni: cannot open {}: {}",
                settings.log_file.display(),
                e
            ),
        }
    }

    let _ = tracing::subscriber::set_global_default(
        builder.with_writer(std::io::stderr).finish(),
    );
}

fn main() {
    let settings = Settings::from_env();
    init_tracing(&settings);

    // errors are already reported on stdout in CNI format
    if run_cni(&settings).is_err() {
        std::process::exit(1);
    }
}
