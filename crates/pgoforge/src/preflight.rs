//! Host checks that run before anything on disk is touched.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const GIB: u64 = 1024 * 1024 * 1024;

#[cfg(unix)]
fn effective_uid() -> u32 {
    unsafe { libc::geteuid() }
}

#[cfg(not(unix))]
fn effective_uid() -> u32 {
    u32::MAX
}

pub fn check_privileges(allow_root: bool) -> Result<()> {
    check_privileges_for(effective_uid(), allow_root)
}

fn check_privileges_for(euid: u32, allow_root: bool) -> Result<()> {
    if euid == 0 && !allow_root {
        return Err(Error::precondition(
            "refusing to run as root; the external builder must run unprivileged (set kernel.allow_root = true to override)",
        ));
    }
    Ok(())
}

/// `path` itself if it exists, else its closest existing parent.
pub fn nearest_existing_ancestor(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .find(|p| !p.as_os_str().is_empty() && p.exists())
        .map(Path::to_path_buf)
        .or_else(|| path.is_relative().then(|| PathBuf::from(".")))
}

#[cfg(unix)]
pub fn available_bytes(path: &Path) -> Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::msg(format!("path contains NUL: {}", path.display())))?;
    let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut st) };
    if rc != 0 {
        return Err(Error::msg(format!(
            "statvfs({}) failed: {}",
            path.display(),
            std::io::Error::last_os_error()
        )));
    }
    let avail = (st.f_bavail as u128).saturating_mul(st.f_frsize as u128);
    Ok(u64::try_from(avail).unwrap_or(u64::MAX))
}

#[cfg(not(unix))]
pub fn available_bytes(_path: &Path) -> Result<u64> {
    Ok(u64::MAX)
}

pub fn check_free_space(dir: &Path, min_free_gib: u64) -> Result<()> {
    if min_free_gib == 0 {
        return Ok(());
    }
    let probe = nearest_existing_ancestor(dir).ok_or_else(|| {
        Error::precondition(format!(
            "cannot determine free space for {}: no existing ancestor",
            dir.display()
        ))
    })?;
    let avail = available_bytes(&probe).map_err(|e| Error::precondition(e.to_string()))?;
    let need = min_free_gib.saturating_mul(GIB);
    if avail < need {
        return Err(Error::precondition(format!(
            "insufficient disk space on {}: {:.1} GiB free, {min_free_gib} GiB required",
            probe.display(),
            avail as f64 / GIB as f64
        )));
    }
    tracing::debug!(path = %probe.display(), avail_gib = avail / GIB, "free space ok");
    Ok(())
}

/// Every `(label, path)` must name an existing regular file.
pub fn check_files(files: &[(String, PathBuf)]) -> Result<()> {
    let missing: Vec<String> = files
        .iter()
        .filter(|(_, p)| !p.is_file())
        .map(|(label, p)| format!("{label} ({})", p.display()))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    Err(Error::precondition(format!(
        "missing input file(s): {}",
        missing.join(", ")
    )))
}
