use sitegate::config::Config;
use sitegate::service::ServiceContext;
use sitegate::{PKG_NAME, VERSION};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("sitegate.toml"));

    // Logging needs the configured level, so load first and report failures after init
    let loaded = Config::load(&config_path);
    let level = loaded
        .as_ref()
        .map(|c| c.logging.level.clone())
        .unwrap_or_else(|_| "info".to_string());
    init_logging(&level);

    let config = loaded.map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let service = ServiceContext::new(config)?;
    service.start().await;

    info!(
        http = service.is_http_running(),
        https = service.is_https_running(),
        fastcgi = service.is_fastcgi_running(),
        "Gateway started"
    );

    // Wait for shutdown signal (Ctrl+C or SIGTERM); SIGHUP reloads certificates
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reloading certificates...");
                    let count = service.reload_certificates();
                    info!(domains = count, "Certificates reloaded");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    service.stop().await;

    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// RUST_LOG wins over the configured level
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("sitegate={}", level)))
        .unwrap_or_else(|_| EnvFilter::new("sitegate=info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting web gateway");
    info!(
        bind = %config.server.bind,
        http_port = (config.server.http_port > 0).then_some(config.server.http_port),
        https_port = (config.server.https_port > 0).then_some(config.server.https_port),
        proxy = config.server.proxy_enabled,
        "Server configuration"
    );
    info!(
        www_root = %config.server.www_root.display(),
        cert_root = %config.server.cert_root.display(),
        proxy_access_root = %config.server.proxy_access_root.display(),
        "Directory layout"
    );
    info!(
        enabled = config.fastcgi.enabled,
        command = %config.fastcgi.command,
        workers = config.fastcgi.workers,
        base_port = config.fastcgi.base_port,
        "FastCGI settings"
    );
    info!(
        sites = config.sites.len(),
        hosts = ?config.sites.iter().map(|s| s.host.as_str()).collect::<Vec<_>>(),
        proxies = config.proxies.iter().filter(|p| p.enable).count(),
        "Configured hosts"
    );
}

/// PID file handle that keeps an exclusive lock for the life of the process
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another gateway instance is running (PID file {} is locked)", path.display());
            }
            return Err(err.into());
        }

        writeln!(&file, "{}", std::process::id())?;
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}
