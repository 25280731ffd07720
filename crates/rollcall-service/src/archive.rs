//! Zipped artifact handling: dataset archives and model artifact pairs.
//!
//! Extraction validates every entry name before anything is written, so a
//! hostile archive can never place files outside the target root.

use rollcall_core::recognizer::is_image_file;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive entry escapes the extraction root: {0}")]
    PathTraversal(String),
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Extract an in-memory zip into `dest`.
///
/// Every entry name is validated up front; any entry that would resolve
/// outside `dest` aborts the whole extraction before a single byte lands.
pub fn extract_zip(bytes: &[u8], dest: &Path) -> Result<(), ArchiveError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;

    let mut targets: Vec<PathBuf> = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        let rel = entry
            .enclosed_name()
            .ok_or_else(|| ArchiveError::PathTraversal(entry.name().to_string()))?;
        targets.push(dest.join(rel));
    }

    for (i, target) in targets.iter().enumerate() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            fs::create_dir_all(target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(target)?;
        io::copy(&mut entry, &mut out)?;
    }

    Ok(())
}

/// Read a single named entry out of an in-memory zip, matching either the
/// exact name or a `.../name` suffix (wrapper directories).
pub fn extract_entry(bytes: &[u8], name: &str) -> Result<Option<Vec<u8>>, ArchiveError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;

    let index = (0..archive.len()).find_map(|i| {
        let entry = archive.by_index(i).ok()?;
        if entry.is_dir() {
            return None;
        }
        let entry_name = entry.name();
        (entry_name == name || entry_name.ends_with(&format!("/{name}"))).then_some(i)
    });

    match index {
        Some(i) => {
            let mut entry = archive.by_index(i)?;
            let mut out = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut out)?;
            Ok(Some(out))
        }
        None => Ok(None),
    }
}

/// Zip a directory tree into memory, entry names relative to `dir`.
pub fn zip_dir(dir: &Path) -> Result<Vec<u8>, ArchiveError> {
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = ZipWriter::new(&mut cursor);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        add_dir_entries(&mut writer, dir, Path::new(""), options)?;
        writer.finish()?;
    }
    Ok(cursor.into_inner())
}

fn add_dir_entries<W: Write + io::Seek>(
    writer: &mut ZipWriter<W>,
    dir: &Path,
    prefix: &Path,
    options: SimpleFileOptions,
) -> Result<(), ArchiveError> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let rel = prefix.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            add_dir_entries(writer, &path, &rel, options)?;
        } else {
            writer.start_file(rel.to_string_lossy().replace('\\', "/"), options)?;
            let bytes = fs::read(&path)?;
            writer.write_all(&bytes)?;
        }
    }
    Ok(())
}

/// Find the directory that actually holds the per-student folders.
/// Archives sometimes wrap the content in one (or more) extra top-level
/// directories; unwrap until student folders with images are visible.
pub fn locate_dataset_root(dir: &Path) -> io::Result<PathBuf> {
    let mut current = dir.to_path_buf();
    loop {
        if has_student_folders(&current)? {
            return Ok(current);
        }
        let subdirs: Vec<PathBuf> = fs::read_dir(&current)?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| e.path())
            .collect();
        match subdirs.as_slice() {
            [only] => current = only.clone(),
            _ => return Ok(current),
        }
    }
}

fn has_student_folders(dir: &Path) -> io::Result<bool> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let has_images = fs::read_dir(entry.path())?
            .filter_map(|e| e.ok())
            .any(|e| is_image_file(&e.path()));
        if has_images {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Count image files per student folder under the dataset root.
pub fn count_images_per_student(root: &Path) -> io::Result<BTreeMap<String, usize>> {
    let mut counts = BTreeMap::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let student = entry.file_name().to_string_lossy().into_owned();
        let images = fs::read_dir(entry.path())?
            .filter_map(|e| e.ok())
            .filter(|e| is_image_file(&e.path()))
            .count();
        counts.insert(student, images);
    }
    Ok(counts)
}
