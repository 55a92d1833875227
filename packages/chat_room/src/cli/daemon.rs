use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::config::ChatRoomConfig;

/// A lock file older than this is assumed to belong to a crashed starter.
const STALE_LOCK_AGE: Duration = Duration::from_secs(30);

const START_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct BrokerInfo {
    pub pid: u32,
    pub port: u16,
    pub host: String,
}

impl BrokerInfo {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Where a client should connect for a broker bound to `bind_host`.
pub fn connect_host(bind_host: &str) -> String {
    match bind_host {
        "0.0.0.0" | "::" | "[::]" => "127.0.0.1".to_string(),
        other => other.to_string(),
    }
}

/// Check if a broker is already running by reading PID/port files and verifying the process.
pub fn check_broker(config: &ChatRoomConfig, host: &str) -> Option<BrokerInfo> {
    let pid_path = config.broker_pid_path();
    let port_path = config.broker_port_path();

    let pid_str = std::fs::read_to_string(&pid_path).ok()?;
    let pid: u32 = pid_str.trim().parse().ok()?;

    // Signal 0 only checks that the process exists. EPERM means it exists
    // but belongs to another participant.
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal;
        use nix::unistd::Pid;
        if let Err(Errno::ESRCH) = signal::kill(Pid::from_raw(pid as i32), None) {
            cleanup_broker_files(config);
            return None;
        }
    }

    let port_str = std::fs::read_to_string(&port_path).ok()?;
    let port: u16 = port_str.trim().parse().ok()?;

    Some(BrokerInfo {
        pid,
        port,
        host: connect_host(host),
    })
}

/// A broker is healthy if it accepts TCP connections.
pub async fn health_check(info: &BrokerInfo) -> bool {
    matches!(
        tokio::time::timeout(
            Duration::from_secs(1),
            tokio::net::TcpStream::connect(info.addr())
        )
        .await,
        Ok(Ok(_))
    )
}

/// Start a new broker process in the background.
pub fn start_broker(config: &ChatRoomConfig) -> Result<()> {
    let exe = std::env::current_exe().context("Failed to determine current executable")?;

    std::fs::create_dir_all(&config.logs_dir)?;

    let mut cmd = std::process::Command::new(&exe);
    cmd.arg("server")
        .arg("--data-dir")
        .arg(&config.data_dir)
        .stdin(std::process::Stdio::null())
        .stdout(log_sink(&config.broker_log_path()))
        .stderr(log_sink(&config.broker_err_path()));

    // On Unix, create a new session so the broker doesn't die with the terminal
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                nix::libc::setsid();
                Ok(())
            });
        }
    }

    cmd.spawn().context("Failed to spawn chat broker")?;
    Ok(())
}

/// Broker output goes to the shared logs dir when we may write there.
fn log_sink(path: &Path) -> std::process::Stdio {
    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
    {
        Ok(file) => std::process::Stdio::from(file),
        Err(e) => {
            debug!("Discarding broker output, cannot open {}: {}", path.display(), e);
            std::process::Stdio::null()
        }
    }
}

/// Ensure a broker is running, starting one if needed.
///
/// Entry points that race here serialize on a lock file in the state dir:
/// whoever holds it checks again and starts the broker, everyone else waits
/// for the port file to appear.
pub async fn ensure_broker(config: &ChatRoomConfig, host: &str) -> Result<BrokerInfo> {
    if let Some(info) = running_broker(config, host).await {
        return Ok(info);
    }

    let deadline = Instant::now() + START_TIMEOUT;
    loop {
        if let Some(lock) = BrokerLock::try_acquire(&config.broker_lock_path())? {
            if let Some(info) = running_broker(config, host).await {
                return Ok(info);
            }
            cleanup_broker_files(config);
            debug!("Starting chat broker");
            start_broker(config)?;
            let info = wait_for_broker(config, host, deadline).await;
            drop(lock);
            return info;
        }

        if let Some(info) = running_broker(config, host).await {
            return Ok(info);
        }
        if Instant::now() > deadline {
            anyhow::bail!(
                "Timed out waiting for another client to start the chat broker ({} is held)",
                config.broker_lock_path().display()
            );
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn running_broker(config: &ChatRoomConfig, host: &str) -> Option<BrokerInfo> {
    let info = check_broker(config, host)?;
    if health_check(&info).await {
        Some(info)
    } else {
        None
    }
}

async fn wait_for_broker(
    config: &ChatRoomConfig,
    host: &str,
    deadline: Instant,
) -> Result<BrokerInfo> {
    loop {
        if Instant::now() > deadline {
            anyhow::bail!(
                "Timed out waiting for chat broker to start. Check logs at: {}",
                config.broker_err_path().display()
            );
        }

        tokio::time::sleep(POLL_INTERVAL).await;

        if let Some(info) = running_broker(config, host).await {
            debug!("Chat broker running on port {}", info.port);
            return Ok(info);
        }
    }
}

/// Clean up broker PID and port files.
pub fn cleanup_broker_files(config: &ChatRoomConfig) {
    let _ = std::fs::remove_file(config.broker_pid_path());
    let _ = std::fs::remove_file(config.broker_port_path());
}

/// Write broker PID and port files after the server binds.
pub fn write_broker_files(config: &ChatRoomConfig, pid: u32, port: u16) -> Result<()> {
    std::fs::write(config.broker_pid_path(), pid.to_string())
        .context("Failed to write broker PID file")?;
    std::fs::write(config.broker_port_path(), port.to_string())
        .context("Failed to write broker port file")?;
    Ok(())
}

/// Held while checking for and starting a broker. Removed on drop.
#[derive(Debug)]
pub struct BrokerLock {
    path: PathBuf,
}

impl BrokerLock {
    /// `Ok(None)` if someone else holds a fresh lock.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        for _ in 0..2 {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
            {
                Ok(mut file) => {
                    use std::io::Write;
                    let _ = write!(file, "{}", std::process::id());
                    return Ok(Some(Self {
                        path: path.to_path_buf(),
                    }));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if !is_stale(path) {
                        return Ok(None);
                    }
                    warn!("Removing stale broker lock {}", path.display());
                    let _ = std::fs::remove_file(path);
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to create lock {}", path.display()));
                }
            }
        }
        Ok(None)
    }
}

impl Drop for BrokerLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn is_stale(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > STALE_LOCK_AGE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config() -> (ChatRoomConfig, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let config = ChatRoomConfig::new(Some(tmp.path().join("data"))).unwrap();
        (config, tmp)
    }

    #[test]
    fn connect_host_maps_wildcards_to_loopback() {
        assert_eq!(connect_host("0.0.0.0"), "127.0.0.1");
        assert_eq!(connect_host("::"), "127.0.0.1");
        assert_eq!(connect_host("10.0.0.5"), "10.0.0.5");
    }

    #[test]
    fn broker_files_round_trip() {
        let (config, _tmp) = temp_config();
        assert!(check_broker(&config, "127.0.0.1").is_none());

        write_broker_files(&config, std::process::id(), 4242).unwrap();
        let info = check_broker(&config, "0.0.0.0").unwrap();
        assert_eq!(info.pid, std::process::id());
        assert_eq!(info.port, 4242);
        assert_eq!(info.addr(), "127.0.0.1:4242");

        cleanup_broker_files(&config);
        assert!(!config.broker_pid_path().exists());
        assert!(!config.broker_port_path().exists());
    }

    #[cfg(unix)]
    #[test]
    fn dead_broker_files_are_cleaned_up() {
        let (config, _tmp) = temp_config();
        // Far above any real pid_max.
        write_broker_files(&config, 999_999_999, 4242).unwrap();
        assert!(check_broker(&config, "127.0.0.1").is_none());
        assert!(!config.broker_pid_path().exists());
    }

    #[tokio::test]
    async fn health_check_needs_a_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let info = BrokerInfo {
            pid: std::process::id(),
            port,
            host: "127.0.0.1".into(),
        };
        assert!(health_check(&info).await);

        drop(listener);
        assert!(!health_check(&info).await);
    }

    #[tokio::test]
    async fn ensure_broker_finds_running_broker() {
        let (config, _tmp) = temp_config();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        write_broker_files(&config, std::process::id(), port).unwrap();

        let info = ensure_broker(&config, "127.0.0.1").await.unwrap();
        assert_eq!(info.port, port);
        assert!(!config.broker_lock_path().exists());
    }

    #[test]
    fn lock_is_exclusive_until_dropped() {
        let (config, _tmp) = temp_config();
        let path = config.broker_lock_path();

        let first = BrokerLock::try_acquire(&path).unwrap().unwrap();
        assert!(BrokerLock::try_acquire(&path).unwrap().is_none());

        drop(first);
        assert!(!path.exists());
        assert!(BrokerLock::try_acquire(&path).unwrap().is_some());
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let (config, _tmp) = temp_config();
        let path = config.broker_lock_path();
        std::fs::write(&path, "12345").unwrap();

        let old = SystemTime::now() - Duration::from_secs(120);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(old)
            .unwrap();

        let lock = BrokerLock::try_acquire(&path).unwrap();
        assert!(lock.is_some());
    }
}
