//! Dropping root privileges once the listening sockets exist.

use std::ffi::CString;
use std::io;

use crate::error::ServerError;

/// Numeric identity of a system user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
}

/// Looks `name` up in the user database.
pub fn lookup(name: &str) -> Result<Identity, ServerError> {
    let unknown = || ServerError::UnknownUser(name.to_owned());
    let cname = CString::new(name).map_err(|_| unknown())?;

    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = vec![0 as libc::c_char; 4096];
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let rc = unsafe {
        libc::getpwnam_r(cname.as_ptr(), &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result)
    };
    if rc != 0 || result.is_null() {
        return Err(unknown());
    }
    Ok(Identity {
        uid: pwd.pw_uid,
        gid: pwd.pw_gid,
    })
}

/// Switches the process to `user`'s group and user ids. Group first: once
/// the uid is dropped the gid can no longer be changed.
pub fn drop_to(user: &str) -> Result<(), ServerError> {
    let identity = lookup(user)?;
    let failed = |source: io::Error| ServerError::Privileges {
        user: user.to_owned(),
        source,
    };

    if unsafe { libc::setgroups(0, std::ptr::null()) } != 0 {
        // Only root may clear supplementary groups; not fatal for others.
        log::debug!("setgroups: {}", io::Error::last_os_error());
    }
    if unsafe { libc::setgid(identity.gid) } != 0 {
        return Err(failed(io::Error::last_os_error()));
    }
    if unsafe { libc::setuid(identity.uid) } != 0 {
        return Err(failed(io::Error::last_os_error()));
    }
    log::info!("running as {} (uid {}, gid {})", user, identity.uid, identity.gid);
    Ok(())
}

/// Applies the configured runtime user, if any.
pub fn apply(user: Option<&str>) -> Result<(), ServerError> {
    match user {
        Some(user) => drop_to(user),
        None => {
            if unsafe { libc::geteuid() } == 0 {
                log::warn!("running as root; set a runtime user to drop privileges");
            }
            Ok(())
        }
    }
}
