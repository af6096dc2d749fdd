//! Packaging of backup payloads: tar for directories, gzip for compression.

use crate::error::{BackupError, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Pack a directory into an uncompressed tar at `out_dir/<stem>.tar`.
pub fn archive_directory(source: &Path, out_dir: &Path, stem: &str) -> Result<PathBuf> {
    let target = out_dir.join(format!("{stem}.tar"));
    let file = File::create(&target).map_err(|e| transform("create archive", &target, e))?;

    let mut builder = tar::Builder::new(BufWriter::new(file));
    builder
        .append_dir_all(".", source)
        .map_err(|e| transform("archive", source, e))?;
    let mut writer = builder
        .into_inner()
        .map_err(|e| transform("finish archive", &target, e))?;
    writer.flush().map_err(|e| transform("flush archive", &target, e))?;

    Ok(target)
}

/// Compress `source` into `out_dir`.
///
/// A directory becomes `<stem>.tar.gz`, a file becomes `<stem>.gz`.
#[cfg(feature = "compression")]
pub fn compress_path(source: &Path, out_dir: &Path, stem: &str) -> Result<PathBuf> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    if source.is_dir() {
        let target = out_dir.join(format!("{stem}.tar.gz"));
        let file = File::create(&target).map_err(|e| transform("create archive", &target, e))?;
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());

        let mut builder = tar::Builder::new(encoder);
        builder
            .append_dir_all(".", source)
            .map_err(|e| transform("archive", source, e))?;
        let encoder = builder
            .into_inner()
            .map_err(|e| transform("finish archive", &target, e))?;
        let mut writer = encoder
            .finish()
            .map_err(|e| transform("finish gzip", &target, e))?;
        writer.flush().map_err(|e| transform("flush gzip", &target, e))?;
        Ok(target)
    } else {
        let target = out_dir.join(format!("{stem}.gz"));
        let mut input = File::open(source).map_err(|e| transform("open", source, e))?;
        let file = File::create(&target).map_err(|e| transform("create", &target, e))?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());

        std::io::copy(&mut input, &mut encoder).map_err(|e| transform("compress", source, e))?;
        let mut writer = encoder
            .finish()
            .map_err(|e| transform("finish gzip", &target, e))?;
        writer.flush().map_err(|e| transform("flush gzip", &target, e))?;
        Ok(target)
    }
}

#[cfg(not(feature = "compression"))]
pub fn compress_path(_source: &Path, _out_dir: &Path, _stem: &str) -> Result<PathBuf> {
    Err(BackupError::Transform(
        "compression support not compiled in; enable the 'compression' feature".to_string(),
    ))
}

fn transform(action: &str, path: &Path, err: std::io::Error) -> BackupError {
    BackupError::Transform(format!("could not {action} {}: {err}", path.display()))
}
