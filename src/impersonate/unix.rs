//! Unix identity provider backed by the passwd database and effective-id
//! switching
//!
//! Impersonation switches the effective uid/gid of the agent for the scope of
//! a guard; launched children inherit the switched identity. Secret
//! verification is the host channel's job for the named-current-user flow;
//! for name+password credentials the provider requires the agent itself to
//! run privileged, because an unprivileged process cannot change identity no
//! matter what the secret says.

#![cfg(unix)]

use super::{IdentityProvider, OsIdentity};
use guestops_shared::{OpError, OpResult};
use std::ffi::{CStr, CString};
use tracing::debug;

/// True when the agent process runs with system privilege
pub fn process_is_privileged() -> bool {
    // SAFETY: geteuid has no failure modes
    unsafe { libc::geteuid() == 0 }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(-1)
}

/// Look up an account by name in the passwd database
pub fn lookup_user(name: &str) -> OpResult<OsIdentity> {
    let cname = CString::new(name).map_err(|_| OpError::InvalidArgument)?;
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = vec![0u8; 4096];
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    loop {
        // SAFETY: all pointers reference live local storage of the stated size
        let rc = unsafe {
            libc::getpwnam_r(
                cname.as_ptr(),
                &mut pwd,
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
                &mut result,
            )
        };
        if rc == libc::ERANGE {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc != 0 {
            return Err(OpError::System(rc));
        }
        break;
    }

    if result.is_null() {
        return Err(OpError::PermissionDenied);
    }
    Ok(OsIdentity {
        username: name.to_string(),
        uid: pwd.pw_uid,
        gid: pwd.pw_gid,
    })
}

/// Resolve a uid to an account name, if the passwd database knows it
pub fn username_for_uid(uid: u32) -> Option<String> {
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = vec![0u8; 4096];
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    loop {
        // SAFETY: all pointers reference live local storage of the stated size
        let rc = unsafe {
            libc::getpwuid_r(
                uid,
                &mut pwd,
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
                &mut result,
            )
        };
        if rc == libc::ERANGE {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc != 0 || result.is_null() {
            return None;
        }
        break;
    }

    // SAFETY: getpwuid_r populated pw_name with a NUL-terminated string in buf
    let name = unsafe { CStr::from_ptr(pwd.pw_name) };
    name.to_str().ok().map(str::to_string)
}

/// Identity provider using effective uid/gid switching
pub struct UnixIdentityProvider {
    saved_euid: libc::uid_t,
    saved_egid: libc::gid_t,
}

impl UnixIdentityProvider {
    pub fn new() -> Self {
        // SAFETY: id reads have no failure modes
        unsafe {
            Self {
                saved_euid: libc::geteuid(),
                saved_egid: libc::getegid(),
            }
        }
    }
}

impl Default for UnixIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityProvider for UnixIdentityProvider {
    fn current_username(&self) -> OpResult<String> {
        username_for_uid(self.saved_euid).ok_or(OpError::PermissionDenied)
    }

    fn authenticate(&self, name: &str, _secret: &str) -> OpResult<OsIdentity> {
        let identity = lookup_user(name)?;
        if !process_is_privileged() {
            // cannot assume another identity without privilege
            return Err(OpError::PermissionDenied);
        }
        Ok(identity)
    }

    fn switch_to(&self, identity: &OsIdentity) -> OpResult<()> {
        // gid first: once the euid drops, we may no longer be allowed to
        // change groups
        // SAFETY: plain id switches, checked for failure
        unsafe {
            if libc::setegid(identity.gid) != 0 {
                return Err(OpError::System(last_errno()));
            }
            if libc::seteuid(identity.uid) != 0 {
                let errno = last_errno();
                libc::setegid(self.saved_egid);
                return Err(OpError::System(errno));
            }
        }
        debug!(user = %identity.username, uid = identity.uid, "security context switched");
        Ok(())
    }

    fn restore(&self) -> OpResult<()> {
        // SAFETY: restoring ids saved at startup
        unsafe {
            if libc::seteuid(self.saved_euid) != 0 {
                return Err(OpError::System(last_errno()));
            }
            if libc::setegid(self.saved_egid) != 0 {
                return Err(OpError::System(last_errno()));
            }
        }
        Ok(())
    }

    fn release(&self, _identity: &OsIdentity) {
        // effective-id switching holds no OS handle to close
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_username_resolves() {
        let provider = UnixIdentityProvider::new();
        let name = provider.current_username().expect("must resolve own account");
        assert!(!name.is_empty());
    }

    #[test]
    fn unknown_user_lookup_is_denied() {
        assert_eq!(
            lookup_user("guestops-no-such-account").err(),
            Some(OpError::PermissionDenied)
        );
    }

    #[test]
    fn uid_roundtrip_matches_current_user() {
        let provider = UnixIdentityProvider::new();
        let name = provider.current_username().unwrap();
        let identity = lookup_user(&name).unwrap();
        assert_eq!(identity.uid, unsafe { libc::geteuid() });
    }
}
