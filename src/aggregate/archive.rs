//! Merges per-batch zip archives into one results archive.
//!
//! The service names archive members `<prefix>_CollCode<id>.cif`. Members are
//! renamed to `<prefix>_<id>` with the id zero-padded to six digits and written
//! with a fixed timestamp, so the same batches always give the same bytes.

use std::collections::HashSet;
use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

use super::{AggregateError, ID_PAD_WIDTH, MergeError, Merger, archive_path, ensure_folder};
use crate::batch::Batch;

/// Marker between the prefix and the id in service-side member names.
const COLL_CODE_MARKER: &str = "_CollCode";

/// Length of the extension (including the dot) on service-side member names.
const EXTENSION_LEN: usize = 4;

/// Maps a service-side member name to its canonical name.
///
/// `icsd_CollCode4.cif` with prefix `icsd` becomes `icsd_000004`.
///
/// # Errors
///
/// Returns a description of the problem if the name does not carry the
/// expected prefix, extension, or a numeric id.
pub fn canonical_member_name(prefix: &str, member: &str) -> Result<String, String> {
    let expected = format!("{prefix}{COLL_CODE_MARKER}");
    let rest = member
        .strip_prefix(&expected)
        .ok_or_else(|| format!("member {member:?} does not start with {expected:?}"))?;

    let code = rest
        .len()
        .checked_sub(EXTENSION_LEN)
        .filter(|&end| end > 0)
        .and_then(|end| rest.get(..end))
        .ok_or_else(|| format!("member {member:?} has no collection code"))?;

    let id: u64 = code
        .parse()
        .map_err(|_| format!("member {member:?} has non-numeric collection code {code:?}"))?;

    Ok(format!("{prefix}_{id:0width$}", width = ID_PAD_WIDTH))
}

/// Streams renamed members of every merged batch into `<prefix>_results.zip`.
pub struct ArchiveMerger {
    path: PathBuf,
    prefix: String,
    writer: ZipWriter<File>,
    written: HashSet<String>,
}

impl std::fmt::Debug for ArchiveMerger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveMerger")
            .field("path", &self.path)
            .field("prefix", &self.prefix)
            .field("members", &self.written.len())
            .finish_non_exhaustive()
    }
}

impl ArchiveMerger {
    /// Creates `<folder>/<prefix>_results.zip`, creating `folder` if needed.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError::Io`] if the folder or file cannot be created.
    pub fn create(folder: &Path, prefix: &str) -> Result<Self, AggregateError> {
        ensure_folder(folder)?;
        let path = archive_path(folder, prefix);
        let file = File::create(&path).map_err(|e| AggregateError::io(&path, e))?;
        debug!(path = %path.display(), "created results archive");

        Ok(Self {
            path,
            prefix: prefix.to_string(),
            writer: ZipWriter::new(file),
            written: HashSet::new(),
        })
    }

    /// Number of members written so far.
    #[must_use]
    pub fn members(&self) -> usize {
        self.written.len()
    }

    fn options() -> FileOptions {
        FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(DateTime::default())
    }

    /// Reads and renames every member of one batch archive without writing anything.
    fn read_batch(&self, bytes: Vec<u8>) -> Result<Vec<(String, Vec<u8>)>, MergeError> {
        let mut archive = ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| MergeError::malformed(format!("unreadable batch archive: {e}")))?;

        let mut members = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let mut file = archive
                .by_index(i)
                .map_err(|e| MergeError::malformed(format!("unreadable archive member {i}: {e}")))?;
            if file.is_dir() {
                continue;
            }

            let name =
                canonical_member_name(&self.prefix, file.name()).map_err(MergeError::Malformed)?;
            let mut contents = Vec::new();
            file.read_to_end(&mut contents).map_err(|e| {
                MergeError::malformed(format!("corrupt archive member {name}: {e}"))
            })?;
            members.push((name, contents));
        }
        Ok(members)
    }
}

impl Merger<Vec<u8>> for ArchiveMerger {
    fn merge(&mut self, batch: &Batch, payload: Vec<u8>) -> Result<(), MergeError> {
        let members = self.read_batch(payload)?;
        let distinct: HashSet<&str> = members.iter().map(|(name, _)| name.as_str()).collect();
        if distinct.len() != batch.len() {
            return Err(MergeError::malformed(format!(
                "batch archive holds {} distinct members for {} requested ids",
                distinct.len(),
                batch.len()
            )));
        }

        for (name, contents) in members {
            if self.written.contains(&name) {
                warn!(batch = batch.index, member = %name, "skipping duplicate archive member");
                continue;
            }
            self.writer
                .start_file(name.as_str(), Self::options())
                .map_err(|source| AggregateError::Archive {
                    path: self.path.clone(),
                    source,
                })?;
            self.writer
                .write_all(&contents)
                .map_err(|e| AggregateError::io(&self.path, e))?;
            self.written.insert(name);
        }

        debug!(batch = batch.index, members = self.written.len(), "merged batch archive");
        Ok(())
    }

    fn finish(mut self) -> Result<PathBuf, AggregateError> {
        self.writer.finish().map_err(|source| AggregateError::Archive {
            path: self.path.clone(),
            source,
        })?;
        info!(path = %self.path.display(), members = self.written.len(), "results archive written");
        Ok(self.path)
    }
}
