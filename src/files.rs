//! The Read strategy: serving a configured file, or a file contained in a
//! configured directory.

use std::ffi::OsStr;
use std::fs::{self, File};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::response::{Body, Response, Status};

/// Resolves and opens the file for `request_path` under `root`.
///
/// When `root` is a directory the decoded request path is appended to it and
/// the canonical result must stay inside the canonical root:
/// escaping it yields 403, a directory yields 400 and a missing file 404.
pub fn serve(root: &Path, request_path: &[u8], content_type: &str) -> Response {
    match open(root, request_path) {
        Ok((file, len)) => Response::new(
            Status::OK,
            Body::Sized {
                reader: Box::new(file),
                len,
            },
        )
        .with_content_type(content_type),
        Err(status) => Response::error(status),
    }
}

fn open(root: &Path, request_path: &[u8]) -> Result<(File, u64), Status> {
    let meta = fs::metadata(root).map_err(|_| Status::NOT_FOUND)?;
    let target = if meta.is_dir() {
        resolve(root, request_path)?
    } else {
        root.to_owned()
    };

    let file = File::open(&target).map_err(|err| {
        log::debug!("cannot open {}: {}", target.display(), err);
        Status::FORBIDDEN
    })?;
    let len = file
        .metadata()
        .map_err(|err| {
            log::warn!("cannot stat open file {}: {}", target.display(), err);
            Status::INTERNAL_SERVER_ERROR
        })?
        .len();
    Ok((file, len))
}

/// Joins the request path onto `root` and checks containment.
pub fn resolve(root: &Path, request_path: &[u8]) -> Result<PathBuf, Status> {
    // Plain concatenation: a leading '/' in the request must not make the
    // joined path absolute.
    let mut assembled = root.as_os_str().to_owned();
    assembled.push(OsStr::from_bytes(request_path));

    // ENOTDIR, ENAMETOOLONG, ELOOP and embedded NULs: nothing to serve.
    let target = fs::canonicalize(&assembled).map_err(|err| match err.kind() {
        io::ErrorKind::PermissionDenied => Status::FORBIDDEN,
        _ => {
            log::debug!("cannot resolve {:?}: {}", assembled, err);
            Status::NOT_FOUND
        }
    })?;
    let base = fs::canonicalize(root).map_err(|err| {
        log::warn!("cannot resolve root {}: {}", root.display(), err);
        Status::NOT_FOUND
    })?;

    if !target.starts_with(&base) {
        log::info!("rejected traversal to {} outside {}", target.display(), base.display());
        return Err(Status::FORBIDDEN);
    }
    if target.is_dir() {
        return Err(Status::BAD_REQUEST);
    }
    Ok(target)
}
