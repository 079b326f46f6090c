//! Streaming archive writer for `.zip` and `.tar.gz` backups.
//!
//! `zip` and `tar` are blocking, so every operation runs on the blocking
//! pool with the writer moved in and handed back.

use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use studio_core::ArchiveFormat;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

enum Inner {
    Zip(ZipWriter<File>),
    TarGz(tar::Builder<GzEncoder<File>>),
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Zip(_) => f.write_str("Zip"),
            Self::TarGz(_) => f.write_str("TarGz"),
        }
    }
}

fn zip_err(e: zip::result::ZipError) -> io::Error {
    match e {
        zip::result::ZipError::Io(e) => e,
        other => io::Error::other(other),
    }
}

fn zip_options(size: u64) -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644)
        .large_file(size >= u64::from(u32::MAX))
}

fn tar_header(size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_size(size);
    header.set_mode(0o644);
    let mtime = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    header.set_mtime(mtime);
    header.set_cksum();
    header
}

impl Inner {
    fn create(path: &Path, format: ArchiveFormat) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        match format {
            ArchiveFormat::Zip => Ok(Self::Zip(ZipWriter::new(file))),
            ArchiveFormat::TarGz => Ok(Self::TarGz(tar::Builder::new(GzEncoder::new(
                file,
                Compression::default(),
            )))),
            ArchiveFormat::Sql => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "a .sql destination is not an archive",
            )),
        }
    }

    fn append_file(&mut self, source: &Path, name: &str) -> io::Result<()> {
        let mut file = File::open(source)?;
        let size = file.metadata()?.len();
        match self {
            Self::Zip(zip) => {
                zip.start_file(name, zip_options(size)).map_err(zip_err)?;
                io::copy(&mut file, zip)?;
            }
            Self::TarGz(tar) => {
                let mut header = tar_header(size);
                tar.append_data(&mut header, name, &mut file)?;
            }
        }
        Ok(())
    }

    fn append_bytes(&mut self, name: &str, bytes: &[u8]) -> io::Result<()> {
        let size = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
        match self {
            Self::Zip(zip) => {
                zip.start_file(name, zip_options(size)).map_err(zip_err)?;
                io::Write::write_all(zip, bytes)?;
            }
            Self::TarGz(tar) => {
                let mut header = tar_header(size);
                tar.append_data(&mut header, name, bytes)?;
            }
        }
        Ok(())
    }

    /// Write the trailer and flush everything to disk.
    fn finish(self) -> io::Result<()> {
        let file = match self {
            Self::Zip(zip) => zip.finish().map_err(zip_err)?,
            Self::TarGz(tar) => tar.into_inner()?.finish()?,
        };
        file.sync_all()
    }
}

/// An archive being written to `path`.
#[derive(Debug)]
pub struct ArchiveWriter {
    path: PathBuf,
    inner: Option<Inner>,
}

fn closed() -> io::Error {
    io::Error::other("archive writer already closed")
}

async fn blocking<T, F>(f: F) -> io::Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(io::Error::other)
}

impl ArchiveWriter {
    pub async fn create(path: &Path, format: ArchiveFormat) -> io::Result<Self> {
        let target = path.to_path_buf();
        let inner = blocking(move || Inner::create(&target, format)).await??;
        Ok(Self {
            path: path.to_path_buf(),
            inner: Some(inner),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy the file at `source` into the archive as `name`.
    pub async fn append_file(&mut self, source: &Path, name: &str) -> io::Result<()> {
        let mut inner = self.inner.take().ok_or_else(closed)?;
        let source = source.to_path_buf();
        let name = name.to_string();
        let (inner, result) = blocking(move || {
            let result = inner.append_file(&source, &name);
            (inner, result)
        })
        .await?;
        self.inner = Some(inner);
        result
    }

    pub async fn append_bytes(&mut self, name: &str, bytes: Vec<u8>) -> io::Result<()> {
        let mut inner = self.inner.take().ok_or_else(closed)?;
        let name = name.to_string();
        let (inner, result) = blocking(move || {
            let result = inner.append_bytes(&name, &bytes);
            (inner, result)
        })
        .await?;
        self.inner = Some(inner);
        result
    }

    /// Finalize the archive. Resolves once the file is closed and synced.
    pub async fn finish(mut self) -> io::Result<()> {
        let inner = self.inner.take().ok_or_else(closed)?;
        blocking(move || inner.finish()).await?
    }
}
