//! Zip archives for multi-file shares.
//!
//! All functions here do blocking I/O and are meant to run inside
//! `tokio::task::spawn_blocking`. Archives are never edited in place: each
//! change writes a fresh zip next to the original.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const MAX_ARCHIVE_ENTRIES: usize = 1000;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Invalid archive: {0}")]
    Invalid(#[from] zip::result::ZipError),

    #[error("Archive I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Entry not found: {0}")]
    EntryNotFound(String),

    #[error("An archive must keep at least one entry")]
    LastEntry,

    #[error("Archive would exceed {0} entries")]
    TooManyEntries(usize),

    #[error("Invalid entry name")]
    InvalidName,
}

impl ArchiveError {
    pub fn status_code(&self) -> u16 {
        match self {
            ArchiveError::Invalid(_) => 422,
            ArchiveError::EntryNotFound(_) => 404,
            ArchiveError::LastEntry => 409,
            ArchiveError::TooManyEntries(_) | ArchiveError::InvalidName => 400,
            ArchiveError::Io(_) => 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub name: String,
    pub size: u64,
    pub compressed_size: u64,
}

/// A file on local disk that should become an archive entry
#[derive(Debug, Clone)]
pub struct EntrySource {
    pub name: String,
    pub path: PathBuf,
}

/// Normalize an entry path, rejecting traversal and absolute paths
pub fn sanitize_entry_name(name: &str) -> Option<String> {
    let parts: Vec<&str> = name
        .split(|c| c == '/' || c == '\\')
        .filter(|part| !part.is_empty() && *part != "." && *part != "..")
        .collect();

    if parts.is_empty() {
        return None;
    }
    let joined = parts.join("/");
    if joined.contains(':') || joined.chars().any(|c| c.is_control()) {
        return None;
    }
    Some(joined)
}

/// "report.pdf" -> "report (1).pdf", "report (2).pdf", ...
fn unique_name(name: &str, taken: &HashSet<String>) -> String {
    if !taken.contains(name) {
        return name.to_string();
    }
    let (base, ext) = match name.rfind('.') {
        Some(dot) if dot > 0 => (&name[..dot], &name[dot..]),
        _ => (name, ""),
    };
    (1..)
        .map(|i| format!("{} ({}){}", base, i, ext))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| name.to_string())
}

fn options_for(size: u64) -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644)
        .large_file(size >= u64::from(u32::MAX))
}

fn write_source<W: Write + std::io::Seek>(zip: &mut ZipWriter<W>, name: &str, path: &Path) -> Result<(), ArchiveError> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
    zip.start_file(name, options_for(size))?;
    std::io::copy(&mut file, zip)?;
    Ok(())
}

fn open(path: &Path) -> Result<ZipArchive<BufReader<File>>, ArchiveError> {
    Ok(ZipArchive::new(BufReader::new(File::open(path)?))?)
}

/// File entries of an archive (directories are skipped)
pub fn list_entries(path: &Path) -> Result<Vec<ArchiveEntry>, ArchiveError> {
    let mut archive = open(path)?;
    let mut entries = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let file = archive.by_index_raw(i)?;
        if file.is_dir() {
            continue;
        }
        entries.push(ArchiveEntry {
            name: file.name().to_string(),
            size: file.size(),
            compressed_size: file.compressed_size(),
        });
    }
    Ok(entries)
}

/// Bundle several files into a new archive. Clashing names get a
/// numbered suffix. Returns the final entry names.
pub fn build_archive(dest: &Path, sources: &[EntrySource]) -> Result<Vec<String>, ArchiveError> {
    if sources.len() > MAX_ARCHIVE_ENTRIES {
        return Err(ArchiveError::TooManyEntries(MAX_ARCHIVE_ENTRIES));
    }
    let mut zip = ZipWriter::new(BufWriter::new(File::create(dest)?));
    let mut taken = HashSet::new();
    let mut names = Vec::with_capacity(sources.len());

    for source in sources {
        let clean = sanitize_entry_name(&source.name).ok_or(ArchiveError::InvalidName)?;
        let name = unique_name(&clean, &taken);
        write_source(&mut zip, &name, &source.path)?;
        taken.insert(name.clone());
        names.push(name);
    }

    zip.finish()?.flush()?;
    Ok(names)
}

/// Copy `src` into `dest` with `additions` appended. An existing entry with
/// the same name as an addition is replaced.
pub fn add_entries(src: &Path, dest: &Path, additions: &[EntrySource]) -> Result<Vec<String>, ArchiveError> {
    let mut added = Vec::with_capacity(additions.len());
    let mut replacing = HashSet::new();
    for addition in additions {
        let name = sanitize_entry_name(&addition.name).ok_or(ArchiveError::InvalidName)?;
        replacing.insert(name.clone());
        added.push((name, addition.path.clone()));
    }

    let mut archive = open(src)?;
    let kept = (0..archive.len())
        .filter_map(|i| archive.name_for_index(i).map(|n| n.to_string()))
        .filter(|name| !replacing.contains(name))
        .count();
    if kept + replacing.len() > MAX_ARCHIVE_ENTRIES {
        return Err(ArchiveError::TooManyEntries(MAX_ARCHIVE_ENTRIES));
    }

    let mut zip = ZipWriter::new(BufWriter::new(File::create(dest)?));
    for i in 0..archive.len() {
        let file = archive.by_index_raw(i)?;
        if replacing.contains(file.name()) {
            continue;
        }
        zip.raw_copy_file(file)?;
    }

    // later duplicates within one request win
    let mut written = HashSet::new();
    for (name, path) in added.iter().rev() {
        if written.insert(name.clone()) {
            write_source(&mut zip, name, path)?;
        }
    }

    zip.finish()?.flush()?;
    let mut names: Vec<String> = written.into_iter().collect();
    names.sort();
    Ok(names)
}

/// Copy `src` into `dest` without the named entry
pub fn remove_entry(src: &Path, dest: &Path, name: &str) -> Result<(), ArchiveError> {
    let mut archive = open(src)?;
    let mut found = false;
    let mut remaining = 0usize;
    for i in 0..archive.len() {
        let file = archive.by_index_raw(i)?;
        if file.name() == name {
            found = true;
        } else if !file.is_dir() {
            remaining += 1;
        }
    }
    if !found {
        return Err(ArchiveError::EntryNotFound(name.to_string()));
    }
    if remaining == 0 {
        return Err(ArchiveError::LastEntry);
    }

    let mut zip = ZipWriter::new(BufWriter::new(File::create(dest)?));
    for i in 0..archive.len() {
        let file = archive.by_index_raw(i)?;
        if file.name() == name {
            continue;
        }
        zip.raw_copy_file(file)?;
    }
    zip.finish()?.flush()?;
    Ok(())
}

/// Whether the file at `path` opens as a zip archive
pub fn is_archive(path: &Path) -> bool {
    open(path).is_ok()
}
