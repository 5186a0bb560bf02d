/// Archive builder, listing and extraction
///
/// One backup run produces one `remnawave_backup_<stamp>.tar.gz` holding the
/// compressed dump and whichever auxiliary env files exist, all at the top
/// level of the archive. Archives are written under a `.partial` name in the
/// staging directory and renamed into the archive directory only once the gzip
/// stream is complete, so a half-written archive is never listed.

use chrono::{Duration, NaiveDateTime, Timelike};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::core::error::{BackupError, Result};
use crate::utils::{archive_file_name, parse_archive_stamp, AUX_FILES, DUMP_PREFIX, DUMP_SUFFIX};

/// An archive found in the archive directory
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveEntry {
    pub path: PathBuf,
    pub file_name: String,
    pub stamp: NaiveDateTime,
    pub size: u64,
}

/// Names of the members inside an archive
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveContents {
    pub dump: String,
    pub aux: Vec<String>,
}

/// Archive unpacked into a private temporary directory.
///
/// The directory and everything in it is removed when this value is dropped.
#[derive(Debug)]
pub struct ExtractedArchive {
    dir: TempDir,
    pub dump: PathBuf,
    pub aux: Vec<PathBuf>,
}

impl ExtractedArchive {
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Remove the extraction directory now, reporting failures
    pub fn close(self) -> io::Result<()> {
        self.dir.close()
    }
}

/// Pick the run stamp for a new archive.
///
/// Starts at `now` (truncated to the second) and moves forward one second at a
/// time while an archive with that name already exists.
pub fn allocate_stamp(archive_dir: &Path, now: NaiveDateTime) -> NaiveDateTime {
    let mut stamp = now.with_nanosecond(0).unwrap_or(now);
    while archive_dir.join(archive_file_name(&stamp)).exists() {
        stamp += Duration::seconds(1);
    }
    stamp
}

/// Auxiliary files that exist on the host. Missing ones are a warning only.
pub fn collect_aux_files(candidates: &[PathBuf]) -> Vec<PathBuf> {
    candidates
        .iter()
        .filter(|path| {
            if path.is_file() {
                true
            } else {
                warn!(path = %path.display(), "auxiliary file not found, skipping");
                false
            }
        })
        .cloned()
        .collect()
}

/// Bundle `dump` and `aux` into `<archive_dir>/remnawave_backup_<stamp>.tar.gz`.
///
/// The archive is assembled as `<name>.partial` inside `staging_dir` (which
/// must be on the same filesystem as `archive_dir`) and renamed at the end.
pub fn build_archive(
    dump: &Path,
    aux: &[PathBuf],
    staging_dir: &Path,
    archive_dir: &Path,
    stamp: &NaiveDateTime,
) -> Result<PathBuf> {
    let name = archive_file_name(stamp);
    let partial = staging_dir.join(format!("{}.partial", name));
    let destination = archive_dir.join(&name);

    if destination.exists() {
        return Err(BackupError::Archive {
            message: format!("{} already exists", destination.display()),
            source: None,
        });
    }

    if let Err(e) = write_tar_gz(dump, aux, &partial) {
        let _ = fs::remove_file(&partial);
        return Err(BackupError::archive(format!("writing {}", partial.display()), e));
    }

    fs::rename(&partial, &destination).map_err(|e| {
        let _ = fs::remove_file(&partial);
        BackupError::archive(format!("moving archive into {}", archive_dir.display()), e)
    })?;

    info!(archive = %destination.display(), members = aux.len() + 1, "archive created");
    Ok(destination)
}

fn write_tar_gz(dump: &Path, aux: &[PathBuf], output: &Path) -> io::Result<()> {
    let file = File::create(output)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for path in std::iter::once(dump).chain(aux.iter().map(PathBuf::as_path)) {
        let name = path.file_name().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("{} has no file name", path.display()))
        })?;
        debug!(member = ?name, source = %path.display(), "adding to archive");
        builder.append_path_with_name(path, name)?;
    }

    let encoder = builder.into_inner()?;
    let mut writer = encoder.finish()?;
    writer.flush()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()
}

/// Archives in `dir`, newest first. A missing directory yields an empty list.
pub fn list_archives(dir: &Path) -> Vec<ArchiveEntry> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut archives: Vec<ArchiveEntry> = entries
        .flatten()
        .filter_map(|entry| {
            let file_name = entry.file_name().to_str()?.to_string();
            let stamp = parse_archive_stamp(&file_name)?;
            let metadata = entry.metadata().ok().filter(|m| m.is_file())?;
            Some(ArchiveEntry {
                path: entry.path(),
                file_name,
                stamp,
                size: metadata.len(),
            })
        })
        .collect();

    archives.sort_by(|a, b| b.stamp.cmp(&a.stamp));
    archives
}

/// Read the archive's table of contents and check it holds a dump
pub fn verify_archive(path: &Path) -> Result<ArchiveContents> {
    let read_err = |e: io::Error| BackupError::archive(format!("reading {}", path.display()), e);

    let file = File::open(path).map_err(read_err)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));

    let mut dump = None;
    let mut aux = Vec::new();
    for entry in archive.entries().map_err(read_err)? {
        let entry = entry.map_err(read_err)?;
        let name = flat_member_name(&entry.path().map_err(read_err)?)?;
        if is_dump_name(&name) {
            dump = Some(name);
        } else {
            aux.push(name);
        }
    }

    match dump {
        Some(dump) => Ok(ArchiveContents { dump, aux }),
        None => Err(BackupError::Archive {
            message: format!("{} contains no database dump", path.display()),
            source: None,
        }),
    }
}

/// Unpack `path` into a fresh temporary directory under `scratch_parent`.
///
/// The archive itself is only read. Only flat members are accepted; a member
/// with a directory component fails the extraction.
pub fn extract_archive(path: &Path, scratch_parent: &Path) -> Result<ExtractedArchive> {
    let read_err = |e: io::Error| BackupError::archive(format!("extracting {}", path.display()), e);

    let dir = tempfile::Builder::new()
        .prefix("rw-restore-")
        .tempdir_in(scratch_parent)
        .map_err(|e| BackupError::archive("creating extraction directory", e))?;

    let file = File::open(path).map_err(read_err)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));

    let mut dump = None;
    let mut aux = Vec::new();
    for entry in archive.entries().map_err(read_err)? {
        let mut entry = entry.map_err(read_err)?;
        let name = flat_member_name(&entry.path().map_err(read_err)?)?;
        let target = dir.path().join(&name);
        entry.unpack(&target).map_err(read_err)?;

        if is_dump_name(&name) {
            dump = Some(target);
        } else if AUX_FILES.contains(&name.as_str()) {
            aux.push(target);
        } else {
            warn!(member = %name, "ignoring unexpected archive member");
        }
    }

    let dump = dump.ok_or_else(|| BackupError::Archive {
        message: format!("{} contains no database dump", path.display()),
        source: None,
    })?;

    debug!(dir = %dir.path().display(), aux = aux.len(), "archive extracted");
    Ok(ExtractedArchive { dir, dump, aux })
}

fn is_dump_name(name: &str) -> bool {
    name.starts_with(DUMP_PREFIX) && name.ends_with(DUMP_SUFFIX)
}

fn flat_member_name(path: &Path) -> Result<String> {
    let mut components = path.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) => Ok(name.to_string_lossy().to_string()),
        _ => Err(BackupError::Archive {
            message: format!("unexpected archive member {}", path.display()),
            source: None,
        }),
    }
}
