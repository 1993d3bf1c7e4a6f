//! Best-effort uid/gid → name resolution for `FileRecord::owner`/`group`.
//!
//! Resolved synchronously at stat time (spec.md §9, Open Question b) rather
//! than cached — the index store already has one cache-invalidation axis
//! (the large-file catalog itself); a second one for identity names isn't
//! worth the complexity for a value that is allowed to come back empty.

use libc::{c_char, gid_t, group, passwd, uid_t};
use std::ffi::CStr;
use std::mem::MaybeUninit;

const BUF_SIZE: usize = 4096;

/// Resolve a uid to a username, or an empty string if the lookup fails.
pub fn username(uid: uid_t) -> String {
    let mut pwd = MaybeUninit::<passwd>::uninit();
    let mut buf = vec![0 as c_char; BUF_SIZE];
    let mut result: *mut passwd = std::ptr::null_mut();

    let rc = unsafe {
        libc::getpwuid_r(
            uid,
            pwd.as_mut_ptr(),
            buf.as_mut_ptr(),
            buf.len(),
            &mut result,
        )
    };

    if rc != 0 || result.is_null() {
        return String::new();
    }

    let pwd = unsafe { pwd.assume_init() };
    unsafe { CStr::from_ptr(pwd.pw_name) }
        .to_string_lossy()
        .into_owned()
}

/// Resolve a gid to a group name, or an empty string if the lookup fails.
pub fn groupname(gid: gid_t) -> String {
    let mut grp = MaybeUninit::<group>::uninit();
    let mut buf = vec![0 as c_char; BUF_SIZE];
    let mut result: *mut group = std::ptr::null_mut();

    let rc = unsafe {
        libc::getgrgid_r(
            gid,
            grp.as_mut_ptr(),
            buf.as_mut_ptr(),
            buf.len(),
            &mut result,
        )
    };

    if rc != 0 || result.is_null() {
        return String::new();
    }

    let grp = unsafe { grp.assume_init() };
    unsafe { CStr::from_ptr(grp.gr_name) }
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_root_uid_or_falls_back_to_empty() {
        // uid 0 is root on every POSIX system this runs on; either we
        // resolve a name or we get the best-effort empty string, never a
        // panic.
        let name = username(0);
        assert!(name.is_empty() || name == "root");
    }

    #[test]
    fn unknown_uid_resolves_to_empty() {
        assert_eq!(username(u32::MAX - 1), String::new());
    }
}
