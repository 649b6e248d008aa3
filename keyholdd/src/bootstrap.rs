//! Process hardening applied at daemon startup.

/// Harden the daemon process before any key material exists.
///
/// Call first thing in `main()`, after logging is initialised but before the
/// store is created.  Both steps are best-effort: a failure is logged and the
/// daemon continues.
///
/// 1. `PR_SET_DUMPABLE=0` — no core dumps, no `/proc/<pid>/mem` reads by
///    non-root processes.
/// 2. `mlockall(MCL_CURRENT | MCL_FUTURE)` — key material is never paged to
///    swap.  Needs `CAP_IPC_LOCK`; without it the call fails with EPERM or
///    ENOMEM and is skipped.
#[cfg(unix)]
pub fn harden_process() {
    // SAFETY: prctl with PR_SET_DUMPABLE and integer args has no memory
    // safety requirements.
    let ret = unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0i64, 0i64, 0i64, 0i64) };
    if ret == 0 {
        tracing::debug!("PR_SET_DUMPABLE=0");
    } else {
        let err = std::io::Error::last_os_error();
        tracing::warn!("PR_SET_DUMPABLE=0 failed (non-fatal): {err}");
    }

    // SAFETY: mlockall has no memory safety requirements.
    let ret = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if ret == 0 {
        tracing::debug!("mlockall: memory pages locked in RAM");
    } else {
        let err = std::io::Error::last_os_error();
        tracing::warn!("mlockall failed (non-fatal, keys may be swapped to disk): {err}");
    }
}

#[cfg(not(unix))]
pub fn harden_process() {}
