use anyhow::Result;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::time::Duration;
use tokio::process::Child;
use tracing::{error, info, warn};

/// Kills a process by PID.
///
/// # Errors
///
/// Returns an error if the signal cannot be sent to the process.
pub fn kill_pid(pid: i32, signal: Signal) -> Result<()> {
    kill(Pid::from_raw(pid), signal).map_err(|e| anyhow::anyhow!("Failed to kill pid {pid}: {e}"))
}

/// Sends `signal` to the process group led by `pgid`.
///
/// A group that is already gone counts as success.
pub fn signal_group(pgid: u32, name: &str, signal: Signal) {
    let pgid = i32::try_from(pgid).unwrap_or(i32::MAX);

    // Negative PID addresses the whole process group
    if let Err(e) = kill(Pid::from_raw(-pgid), signal)
        && e != nix::errno::Errno::ESRCH
    {
        error!("Failed to send {:?} to {}: {}", signal, name, e);
    }
}

/// Terminates a child process gracefully.
///
/// Sends `signal` (usually SIGTERM) to the child's process group, waits up to
/// `grace` for it to exit, then force-kills the group with SIGKILL.
///
/// Returns the exit code if the process reported one.
pub async fn terminate_gracefully(
    child: &mut Child,
    name: &str,
    signal: Signal,
    grace: Duration,
) -> Option<i32> {
    let Some(pid) = child.id() else {
        // Already reaped
        return child.try_wait().ok().flatten().and_then(|s| s.code());
    };

    info!("Sending {:?} to {} (PGID: {})", signal, name, pid);
    signal_group(pid, name, signal);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        Ok(Err(e)) => {
            warn!("Failed to wait for {}: {}", name, e);
            None
        }
        Err(_) => {
            warn!("{} did not exit, sending SIGKILL", name);
            signal_group(pid, name, Signal::SIGKILL);
            if let Err(e) = child.kill().await {
                warn!("Failed to force kill {}: {}", name, e);
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::process::Command;

    fn spawn_in_group(script: &str) -> Child {
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn sigterm_stops_cooperative_child() {
        let mut child = spawn_in_group("sleep 30");
        terminate_gracefully(&mut child, "sleeper", Signal::SIGTERM, Duration::from_secs(5)).await;
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn stubborn_child_is_killed_after_grace() {
        let mut child = spawn_in_group("trap '' TERM; while true; do sleep 1; done");
        // Let the shell install its trap
        tokio::time::sleep(Duration::from_millis(100)).await;

        terminate_gracefully(
            &mut child,
            "stubborn",
            Signal::SIGTERM,
            Duration::from_millis(200),
        )
        .await;
        assert!(child.try_wait().unwrap().is_some());
    }

    #[test]
    fn killing_missing_pid_is_an_error() {
        // PID near the top of the default pid_max range is unlikely to exist
        assert!(kill_pid(4_194_000, Signal::SIGKILL).is_err());
    }
}
