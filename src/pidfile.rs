//! PID-file bookkeeping for the `start|stop|restart` CLI surface (spec
//! §6.3) shared by both binaries. Each service's own in-process
//! [`broker::memory::MemoryBroker`](crate::broker::memory::MemoryBroker) has
//! no cross-process reach, so `stop`/`restart` fall back to the
//! conventional Unix pattern: a PID file under the system temp directory,
//! signalled with `kill`.

use std::io::Write;
use std::path::PathBuf;

fn path_for(service_name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("beamline_fabric.{service_name}.pid"))
}

/// Record the current process's PID so a later `stop`/`restart` invocation
/// can find it.
pub fn write(service_name: &str) -> anyhow::Result<()> {
    let path = path_for(service_name);
    let mut file = std::fs::File::create(&path)?;
    write!(file, "{}", std::process::id())?;
    Ok(())
}

/// Remove this service's PID file, called on graceful exit.
pub fn remove(service_name: &str) {
    let _ = std::fs::remove_file(path_for(service_name));
}

/// Send a graceful-termination signal (`SIGTERM` on Unix) to whatever PID
/// was last recorded for `service_name`. Returns an error — non-zero exit,
/// per spec §6.3 — if no instance is known to be running.
pub fn stop(service_name: &str) -> anyhow::Result<()> {
    let path = path_for(service_name);
    let pid = std::fs::read_to_string(&path)
        .map_err(|_| anyhow::anyhow!("no running '{service_name}' instance found ({path:?} missing)"))?;
    let pid = pid.trim();

    #[cfg(unix)]
    {
        let status = std::process::Command::new("kill")
            .arg("-TERM")
            .arg(pid)
            .status()?;
        if !status.success() {
            anyhow::bail!("failed to signal '{service_name}' (pid {pid})");
        }
    }
    #[cfg(not(unix))]
    {
        anyhow::bail!("stopping '{service_name}' by pid is only supported on unix");
    }

    let _ = std::fs::remove_file(&path);
    Ok(())
}
