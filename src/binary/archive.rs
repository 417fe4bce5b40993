//! Container-format validation for the runner agent package.

use crate::{FleetError, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Check that `path` holds a readable tar archive, gzip-compressed or not,
/// with at least one entry.
pub async fn validate(path: &Path) -> Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || validate_blocking(&path))
        .await
        .map_err(|e| FleetError::BinaryCorrupt(format!("archive validation did not finish: {}", e)))?
}

fn validate_blocking(path: &Path) -> Result<()> {
    let mut file = File::open(path)
        .map_err(|e| FleetError::BinaryIo(format!("open {}: {}", path.display(), e)))?;

    let mut magic = [0u8; 2];
    let read = file
        .read(&mut magic)
        .and_then(|n| file.seek(SeekFrom::Start(0)).map(|_| n))
        .map_err(|e| FleetError::BinaryIo(format!("read {}: {}", path.display(), e)))?;

    let counted = if read == magic.len() && magic == GZIP_MAGIC {
        count_entries(GzDecoder::new(BufReader::new(file)))
    } else {
        count_entries(BufReader::new(file))
    };
    let entries = counted.map_err(|e| {
        FleetError::BinaryCorrupt(format!("{} is not a valid archive: {}", path.display(), e))
    })?;

    if entries == 0 {
        return Err(FleetError::BinaryCorrupt(format!(
            "{} contains no archive entries",
            path.display()
        )));
    }
    tracing::debug!("Validated archive {} with {} entries", path.display(), entries);
    Ok(())
}

/// Walk every entry, reading its contents so truncation and checksum errors
/// in the compressed stream surface here.
fn count_entries<R: Read>(reader: R) -> io::Result<usize> {
    let mut archive = tar::Archive::new(reader);
    let mut count = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        entry.path()?;
        io::copy(&mut entry, &mut io::sink())?;
        count += 1;
    }
    Ok(count)
}
