//! Thread-to-core pinning.

/// Pin the current thread to `cpu`.
///
/// Uses `sched_setaffinity` on Linux; a no-op elsewhere. Pinning is
/// best-effort throughout the server: failures are reported and ignored.
#[cfg(target_os = "linux")]
pub fn set_cpu_affinity(cpu: usize) -> std::io::Result<()> {
    use std::mem;

    unsafe {
        let mut cpu_set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut cpu_set);
        libc::CPU_SET(cpu, &mut cpu_set);

        if libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &cpu_set) == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}

/// Pin the current thread to `cpu` (no-op on non-Linux platforms).
#[cfg(not(target_os = "linux"))]
pub fn set_cpu_affinity(_cpu: usize) -> std::io::Result<()> {
    Ok(())
}
