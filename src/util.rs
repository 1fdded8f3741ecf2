//! Internal utilities.

use crate::error::Result;
use std::ffi::CString;

/// Checks whether the process with the given PID is still alive.
///
/// Uses `kill(pid, 0)`: signal 0 checks existence without delivering a signal.
#[must_use]
pub fn is_process_alive(pid: u32) -> bool {
    // SAFETY: `kill(pid, 0)` is a standard POSIX existence check that does
    // not deliver any signal.
    #[allow(clippy::cast_possible_wrap)]
    unsafe {
        libc::kill(pid as libc::pid_t, 0) == 0
    }
}

/// Looks up OS interface indices by name.
pub trait Interfaces: Send + Sync {
    /// Returns the index of `name`, or `None` if no such interface exists.
    ///
    /// # Errors
    ///
    /// Returns an error only if the lookup itself cannot be performed.
    fn index(&self, name: &str) -> Result<Option<u32>>;
}

/// [`Interfaces`] backed by `if_nametoindex(3)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInterfaces;

impl Interfaces for SystemInterfaces {
    fn index(&self, name: &str) -> Result<Option<u32>> {
        let Ok(c_name) = CString::new(name) else {
            return Ok(None);
        };
        // SAFETY: `c_name` is a valid NUL-terminated string that outlives the
        // call; `if_nametoindex` returns 0 when the interface is missing.
        let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
        Ok((index != 0).then_some(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn dead_pid_is_not_alive() {
        assert!(!is_process_alive(999_999_999));
    }

    #[test]
    fn loopback_has_an_index() {
        let name = if cfg!(target_os = "linux") { "lo" } else { "lo0" };
        assert!(SystemInterfaces.index(name).unwrap().is_some());
    }

    #[test]
    fn missing_interface_has_no_index() {
        assert_eq!(SystemInterfaces.index("nonexistent-if0").unwrap(), None);
        assert_eq!(SystemInterfaces.index("bad\0name").unwrap(), None);
    }
}
