//! Startup/shutdown wiring and the single-instance guarantee (§4.M).
//!
//! This module is the thin layer that assembles the independently-testable
//! pieces (config, session manager, control socket, materializer,
//! aggregator, optional HQ registration) in the order §4.M specifies, the
//! same role the teacher's `main.rs` plays over `clauderon::*` — everything
//! here is orchestration, not logic.

use std::path::PathBuf;
use std::time::Duration;

use sysinfo::System;

/// Debug override disabling the single-instance kill (stands in for
/// "appears to be under a debugger", §4.M).
pub const NO_SINGLE_INSTANCE_ENV: &str = "VIBETUNNEL_NO_SINGLE_INSTANCE";

/// HQ registration is optional (§4.I); its presence is what decides whether
/// this daemon runs as a bare remote or registers upward. Set together.
pub const HQ_URL_ENV: &str = "VIBETUNNEL_HQ_URL";
/// Stable id this remote registers under; defaults to the hostname if unset.
pub const HQ_ID_ENV: &str = "VIBETUNNEL_HQ_ID";
/// Human-readable name reported at registration.
pub const HQ_NAME_ENV: &str = "VIBETUNNEL_HQ_NAME";
/// URL HQ can reach this remote at, required alongside [`HQ_URL_ENV`].
pub const HQ_SELF_URL_ENV: &str = "VIBETUNNEL_HQ_SELF_URL";
/// Basic-auth username this remote presents to HQ.
pub const HQ_USERNAME_ENV: &str = "VIBETUNNEL_HQ_USERNAME";
/// Basic-auth password this remote presents to HQ.
pub const HQ_PASSWORD_ENV: &str = "VIBETUNNEL_HQ_PASSWORD";
/// Registration attempts before giving up and running un-federated (§4.I).
pub const HQ_REGISTER_MAX_ATTEMPTS: u32 = 5;

/// Wait after killing conflicting instances before proceeding (§4.M).
pub const SINGLE_INSTANCE_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Grace period between SIGTERM and SIGKILL during shutdown (§4.M).
pub const SHUTDOWN_SIGKILL_DELAY: Duration = Duration::from_secs(2);

/// Deadline for signalling HQ detach during shutdown (§4.M).
pub const HQ_DETACH_DEADLINE: Duration = Duration::from_millis(500);

/// Enumerate other processes sharing this binary's name and SIGKILL them,
/// unless [`NO_SINGLE_INSTANCE_ENV`] is set (§4.M).
///
/// Returns the pids that were killed.
///
/// # Panics
///
/// Panics if the current process's own pid cannot be determined from
/// `std::process::id()` conversion — this is infallible on every platform
/// this crate targets.
pub fn enforce_single_instance() -> Vec<u32> {
    if std::env::var_os(NO_SINGLE_INSTANCE_ENV).is_some() {
        return Vec::new();
    }

    let Ok(own_exe) = std::env::current_exe() else {
        return Vec::new();
    };
    let Some(own_name) = own_exe.file_name().and_then(|n| n.to_str()) else {
        return Vec::new();
    };
    let own_pid = std::process::id();

    let mut system = System::new_all();
    system.refresh_all();

    let mut killed = Vec::new();
    for (pid, process) in system.processes() {
        let Some(name) = process.name().to_str() else {
            continue;
        };
        if name != own_name {
            continue;
        }
        let pid = pid.as_u32();
        if pid == own_pid {
            continue;
        }

        #[expect(unsafe_code, reason = "libc::kill has no safe wrapper")]
        // SAFETY: `kill(2)` with a pid/signal pair has no memory-safety
        // preconditions; failure is reported via errno, not UB.
        let result = unsafe { libc::kill(libc::pid_t::try_from(pid).unwrap_or(0), libc::SIGKILL) };
        if result == 0 {
            killed.push(pid);
        }
    }

    killed
}

/// One-shot readiness barrier used at shutdown: HQ detach is attempted but
/// bounded by [`HQ_DETACH_DEADLINE`] so a slow/unreachable HQ never blocks
/// process exit (§4.M).
///
/// # Errors
///
/// Returns `Err(())` if `detach` did not complete within the deadline.
pub async fn detach_from_hq_with_deadline<F>(detach: F) -> Result<(), ()>
where
    F: std::future::Future<Output = ()>,
{
    tokio::time::timeout(HQ_DETACH_DEADLINE, detach).await.map_err(|_| ())
}

/// Send `SIGTERM` to `pid`, then `SIGKILL` if it has not exited after
/// [`SHUTDOWN_SIGKILL_DELAY`] (§4.M). `is_alive` is polled to decide
/// whether the escalation is still needed.
pub async fn terminate_then_kill<F>(pid: u32, mut is_alive: F)
where
    F: FnMut() -> bool,
{
    send_signal(pid, libc::SIGTERM);
    tokio::time::sleep(SHUTDOWN_SIGKILL_DELAY).await;
    if is_alive() {
        send_signal(pid, libc::SIGKILL);
    }
}

fn send_signal(pid: u32, signal: i32) {
    #[expect(unsafe_code, reason = "libc::kill has no safe wrapper")]
    // SAFETY: `kill(2)` with a pid/signal pair has no memory-safety
    // preconditions; failure is reported via errno, not UB.
    let _ = unsafe { libc::kill(libc::pid_t::try_from(pid).unwrap_or(0), signal) };
}

/// Directory daemon log files live under (§1 ambient logging).
#[must_use]
pub fn logs_dir() -> PathBuf {
    crate::paths::control_dir().join("logs")
}

/// Build an [`crate::remote::HqClient`] from [`HQ_URL_ENV`] and friends, if
/// HQ registration is configured for this run (§4.M startup order: HQ
/// registration is attempted last, and only when configured).
#[must_use]
pub fn hq_client_from_env() -> Option<crate::remote::HqClient> {
    let hq_url = std::env::var(HQ_URL_ENV).ok()?;
    let self_url = std::env::var(HQ_SELF_URL_ENV).ok()?;
    let id = std::env::var(HQ_ID_ENV)
        .ok()
        .or_else(|| sysinfo::System::host_name())
        .unwrap_or_else(|| "vibetunnel-remote".to_owned());
    let display_name = std::env::var(HQ_NAME_ENV).unwrap_or_else(|_| id.clone());
    let username = std::env::var(HQ_USERNAME_ENV).unwrap_or_default();
    let password = std::env::var(HQ_PASSWORD_ENV).unwrap_or_default();
    Some(crate::remote::HqClient::new(hq_url, id, display_name, self_url, (username, password)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn detach_within_deadline_succeeds() {
        let result = detach_from_hq_with_deadline(async {}).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn detach_past_deadline_times_out() {
        let result = detach_from_hq_with_deadline(async {
            tokio::time::sleep(HQ_DETACH_DEADLINE + Duration::from_millis(50)).await;
        })
        .await;
        assert!(result.is_err());
    }
}
