use tracing_subscriber::EnvFilter;

fn filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("webrtc_service=debug,webrtc_worker=debug")
        } else {
            EnvFilter::new("webrtc_service=info,webrtc_worker=info")
        }
    })
}

/// Console logging for the host process.
pub fn init_logging(verbose: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(verbose))
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .try_init();
}

/// Logging for the worker process. stdout carries protocol frames, so
/// everything goes to stderr.
pub fn init_worker_logging(verbose: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(verbose))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}
