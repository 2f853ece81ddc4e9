//! Utility functions for payload sniffing, hashing, disk space and atomic file writes

use crate::error::{Error, Result};
use crate::types::Fingerprint;
use std::io::Read;
use std::path::Path;

/// Read buffer used when hashing files
const HASH_CHUNK: usize = 64 * 1024;

/// Number of leading bytes inspected when sniffing for an HTML page
const HTML_SNIFF_LEN: usize = 30;

/// Whether a payload starts like an HTML document
///
/// Data portals commonly answer with a 200 and an error or landing page instead of
/// the requested file. Only the first few bytes are inspected, case-insensitively,
/// after skipping leading whitespace and a UTF-8 byte order mark.
///
/// ```
/// use dataset_archiver::utils::looks_like_html;
///
/// assert!(looks_like_html(b"\n<!DOCTYPE html><html>..."));
/// assert!(looks_like_html(b"<html><body>maintenance</body></html>"));
/// assert!(!looks_like_html(b"PK\x03\x04"));
/// ```
pub fn looks_like_html(bytes: &[u8]) -> bool {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = (start + HTML_SNIFF_LEN).min(bytes.len());
    let head = String::from_utf8_lossy(&bytes[start..end]).to_ascii_lowercase();
    head.contains("<!doctype html") || head.starts_with("<html")
}

/// Last path segment of a URL, used as a default archive entry name
///
/// Falls back to `"download"` when the URL has no usable segment.
pub fn entry_name_from_url(url: &str) -> String {
    if let Ok(parsed) = url::Url::parse(url)
        && let Some(mut segments) = parsed.path_segments()
        && let Some(last) = segments.next_back()
        && !last.is_empty()
    {
        return urlencoding::decode(last)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| last.to_string());
    }
    "download".to_string()
}

/// Get available disk space for a given path
///
/// Uses platform-specific APIs to query filesystem statistics:
/// - Linux/macOS: statvfs
/// - Windows: GetDiskFreeSpaceExW
pub fn get_available_space(path: &Path) -> std::io::Result<u64> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        // SAFETY: c_path is a valid NUL-terminated string, stat is zero-initialized and
        // only read after statvfs reports success.
        unsafe {
            let mut stat: libc::statvfs = std::mem::zeroed();
            if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            // f_bavail counts blocks available to unprivileged users
            #[allow(clippy::unnecessary_cast)]
            let available_bytes = (stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64);
            Ok(available_bytes)
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::ffi::OsStrExt;
        use winapi::um::fileapi::GetDiskFreeSpaceExW;

        let wide_path: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        // SAFETY: wide_path is NUL-terminated and every out pointer refers to a live u64.
        unsafe {
            let mut free_bytes_available: u64 = 0;
            let mut _total_bytes: u64 = 0;
            let mut _total_free_bytes: u64 = 0;

            if GetDiskFreeSpaceExW(
                wide_path.as_ptr(),
                &mut free_bytes_available as *mut u64 as *mut _,
                &mut _total_bytes as *mut u64 as *mut _,
                &mut _total_free_bytes as *mut u64 as *mut _,
            ) == 0
            {
                return Err(std::io::Error::last_os_error());
            }

            Ok(free_bytes_available)
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "disk space checking is not supported on this platform",
        ))
    }
}

/// Fingerprint and size of the file at `path`, read in fixed-size chunks
pub(crate) fn hash_file(path: &Path) -> std::io::Result<(Fingerprint, u64)> {
    let mut file = std::fs::File::open(path)?;
    let mut context = md5::Context::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        context.consume(&buf[..n]);
        size += n as u64;
    }
    Ok((Fingerprint::from_digest(context.compute()), size))
}

/// Fail with [`Error::InsufficientSpace`] unless `path` has `required + reserve` bytes free
///
/// Platforms without a disk-space API are let through with a debug log.
pub fn ensure_free_space(path: &Path, required: u64, reserve: u64) -> Result<()> {
    match get_available_space(path) {
        Ok(available) => {
            let needed = required.saturating_add(reserve);
            if available < needed {
                return Err(Error::InsufficientSpace {
                    required: needed,
                    available,
                });
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::Unsupported => {
            tracing::debug!(path = %path.display(), "disk space check unsupported, skipping");
            Ok(())
        }
        Err(e) => Err(Error::Io(e)),
    }
}

/// Write `bytes` to `path` through a sibling temp file and a rename
///
/// Readers never observe a half-written file: they see either the old content or
/// the new one.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let tmp = path.with_file_name(format!(".{file_name}.tmp-{}", std::process::id()));
    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(Error::Io(e));
    }
    Ok(())
}
