//! Thread scheduling control for POSIX systems
use errno::{errno, Errno};
use std::os::raw::c_int;

/// The scheduling parameters of a thread.
#[derive(Debug, Clone, Copy)]
pub struct SchedParams {
    policy: c_int,
    priority: c_int,
}

pub fn is_privileged() -> bool {
    // Safety: `geteuid` is always successful
    unsafe { libc::geteuid() == 0 }
}

/// Get the valid priority range of `SCHED_FIFO`.
pub fn priority_range() -> Result<(c_int, c_int), Errno> {
    // Safety: These functions have no preconditions
    let min = ok_or_errno(unsafe { libc::sched_get_priority_min(libc::SCHED_FIFO) })?;
    let max = ok_or_errno(unsafe { libc::sched_get_priority_max(libc::SCHED_FIFO) })?;
    Ok((min, max))
}

/// Get the current thread's scheduling parameters.
pub fn current() -> Result<SchedParams, Errno> {
    let mut policy = 0;
    // Safety: `sched_param` is a plain C struct
    let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
    // Safety: The pointers are valid for writes
    ok_or_err_code(unsafe { libc::pthread_getschedparam(libc::pthread_self(), &mut policy, &mut param) })?;
    Ok(SchedParams {
        policy,
        priority: param.sched_priority,
    })
}

/// Switch the current thread to `SCHED_FIFO` with the specified priority.
pub fn set_current_fifo(priority: c_int) -> Result<(), Errno> {
    set_current(libc::SCHED_FIFO, priority)
}

/// Restore the parameters returned by [`current`].
pub fn restore(params: SchedParams) -> Result<(), Errno> {
    set_current(params.policy, params.priority)
}

fn set_current(policy: c_int, priority: c_int) -> Result<(), Errno> {
    // Safety: `sched_param` is a plain C struct
    let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
    param.sched_priority = priority;
    // Safety: `param` is valid for reads
    ok_or_err_code(unsafe { libc::pthread_setschedparam(libc::pthread_self(), policy, &param) })
}

/// Restrict the current thread to the specified CPU.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn pin_current_to(cpu: usize) -> Result<(), Errno> {
    if cpu >= libc::CPU_SETSIZE as usize {
        return Err(Errno(libc::EINVAL));
    }

    // Safety: `cpu_set_t` is a plain C struct
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    // Safety: `cpu` is in range
    unsafe {
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
    }
    // Safety: `set` is valid for reads. `0` means the calling thread.
    ok_or_errno(unsafe {
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
    })
    .map(drop)
}

/// Restrict the current thread to the specified CPU.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn pin_current_to(_cpu: usize) -> Result<(), Errno> {
    Err(Errno(libc::ENOSYS))
}

/// For functions that return `-1` and set `errno` on failure.
fn ok_or_errno(x: c_int) -> Result<c_int, Errno> {
    if x >= 0 {
        Ok(x)
    } else {
        Err(errno())
    }
}

/// For functions that return an error number.
fn ok_or_err_code(x: c_int) -> Result<(), Errno> {
    if x == 0 {
        Ok(())
    } else {
        Err(Errno(x))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_priority_range() {
        let (min, max) = priority_range().unwrap();
        assert!(min < max, "{min} < {max}");
    }

    #[test]
    fn read_and_restore() {
        std::thread::spawn(|| {
            let params = current().unwrap();
            restore(params).unwrap();
        })
        .join()
        .unwrap();
    }

    #[test]
    fn pin_out_of_range() {
        assert!(pin_current_to(usize::MAX).is_err());
    }
}
