//! Deterministic zip packaging and structural integrity checks
//!
//! All functions here do blocking file I/O and are meant to run on
//! `tokio::task::spawn_blocking`.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use zip::write::FileOptions;

use crate::error::{Error, Result};

/// Write a zip whose bytes depend only on the entry names and contents
///
/// Every entry gets the same 1980-01-01 timestamp, deflate compression and fixed
/// permissions, so fetching unchanged data twice yields the same fingerprint.
/// Entries are written in the order given.
pub fn write_deterministic_zip(entries: &[(String, PathBuf)], dest: &Path) -> Result<()> {
    let invalid = |reason: String| Error::InvalidArchive {
        path: dest.to_path_buf(),
        reason,
    };

    let out = File::create(dest)?;
    let mut writer = zip::ZipWriter::new(BufWriter::new(out));
    let options = FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o644);

    for (name, source) in entries {
        writer
            .start_file(name.as_str(), options)
            .map_err(|e| invalid(format!("cannot add entry {name}: {e}")))?;
        let mut input = BufReader::new(File::open(source)?);
        std::io::copy(&mut input, &mut writer)?;
    }

    let mut inner = writer
        .finish()
        .map_err(|e| invalid(format!("cannot finalize archive: {e}")))?;
    inner.flush()?;
    debug!(path = %dest.display(), entries = entries.len(), "wrote deterministic zip");
    Ok(())
}

/// Check that a zip can be listed and every entry decompresses with a valid CRC
///
/// Returns the number of entries.
pub fn verify_zip(path: &Path) -> Result<usize> {
    let invalid = |reason: String| Error::InvalidArchive {
        path: path.to_path_buf(),
        reason,
    };

    let file = File::open(path)?;
    let mut archive =
        zip::ZipArchive::new(BufReader::new(file)).map_err(|e| invalid(e.to_string()))?;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| invalid(format!("entry {index}: {e}")))?;
        let name = entry.name().to_string();
        std::io::copy(&mut entry, &mut std::io::sink())
            .map_err(|e| invalid(format!("entry {name}: {e}")))?;
    }

    Ok(archive.len())
}
