//! PID-based liveness and signalling for detached agent processes.
//!
//! Agents outlive the hub that spawned them, so nothing here relies on a
//! `Child` handle. Each agent chain leads its own process group and is
//! signalled through the group so the shim and the agent binary die together.

use std::time::Duration;

use tracing::{debug, warn};

/// Poll interval while waiting for a terminated process to exit.
const EXIT_POLL: Duration = Duration::from_millis(100);

/// Returns true when `pid` names a process we can see.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check,
    // no signal is delivered.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(pid, 0) };
    ret == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub const fn is_alive(_pid: u32) -> bool {
    false
}

/// Send `signal` to the process group led by `pid`, falling back to the
/// single process when it is not a group leader.
#[cfg(unix)]
pub fn signal_group(pid: u32, signal: i32) -> std::io::Result<()> {
    let pid = i32::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    if pid <= 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "refusing to signal pid <= 0",
        ));
    }
    // SAFETY: pid is positive, so -pid addresses exactly one process group
    // and never the broadcast targets 0 or -1.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(-pid, signal) };
    if ret == 0 {
        return Ok(());
    }
    // SAFETY: same positive pid, addressed directly.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(pid, signal) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub fn signal_group(_pid: u32, _signal: i32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "process signalling requires unix",
    ))
}

/// SIGTERM the group, wait up to `grace`, then SIGKILL.
///
/// Returns `true` when the process exited within the grace period.
#[cfg(unix)]
pub async fn terminate(pid: u32, grace: Duration) -> bool {
    if !is_alive(pid) {
        return true;
    }
    if let Err(e) = signal_group(pid, libc::SIGTERM) {
        warn!(pid, error = %e, "Failed to send SIGTERM");
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !is_alive(pid) {
            debug!(pid, "Process exited after SIGTERM");
            return true;
        }
        tokio::time::sleep(EXIT_POLL).await;
    }

    warn!(pid, grace_secs = grace.as_secs(), "Process ignored SIGTERM, sending SIGKILL");
    if let Err(e) = signal_group(pid, libc::SIGKILL) {
        warn!(pid, error = %e, "Failed to send SIGKILL");
    }
    false
}

#[cfg(not(unix))]
pub async fn terminate(_pid: u32, _grace: Duration) -> bool {
    true
}

#[cfg(all(test, unix))]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;

    #[test]
    fn own_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }

    #[test]
    fn nonsense_pids_are_dead() {
        assert!(!is_alive(0));
        assert!(!is_alive(u32::MAX));
    }

    #[test]
    fn signal_group_rejects_zero() {
        assert!(signal_group(0, libc::SIGTERM).is_err());
    }

    #[tokio::test]
    async fn terminate_stops_a_sleeping_group() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id();

        // Reap in the background so the pid does not linger as a zombie.
        let reaper = std::thread::spawn(move || child.wait());

        assert!(terminate(pid, Duration::from_secs(5)).await);
        reaper.join().unwrap().unwrap();
        assert!(!is_alive(pid));
    }
}
