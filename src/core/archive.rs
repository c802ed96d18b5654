//! Streaming tar archives, optionally gzip-compressed
//!
//! Writers pick compression from the destination name. Readers detect it
//! from the stream itself. A reader is forward-only: every read operation
//! consumes it, so listing and then extracting requires opening the archive
//! again, as does each further selective extraction.
//!
//! Entries carry mode, ownership and mtime. The writer records no extended
//! attributes or ACLs; the reader restores those only when an archive from
//! another tool carries them as PAX records.
//!
//! Handles release their file on drop. A writer dropped without `finish`
//! still writes the tar trailer and gzip footer, but any error doing so is
//! lost; the happy path must call `finish`.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use crate::core::error::{AgentError, ArchiveError};

type Result<T> = std::result::Result<T, ArchiveError>;

/// Run synchronous archive work on the blocking pool
pub async fn blocking<T, F>(work: F) -> std::result::Result<T, AgentError>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| AgentError::io("archive worker", io::Error::new(io::ErrorKind::Other, e)))?
        .map_err(AgentError::from)
}

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// True when the archive name implies gzip compression
pub fn is_compressed_name(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    name.ends_with(".gz") || name.ends_with(".tgz")
}

enum Sink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Plain(w) => w.write(buf),
            Sink::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Plain(w) => w.flush(),
            Sink::Gzip(w) => w.flush(),
        }
    }
}

impl Sink {
    fn finish(self) -> io::Result<()> {
        let mut inner = match self {
            Sink::Plain(w) => w,
            Sink::Gzip(w) => w.finish()?,
        };
        inner.flush()?;
        inner.get_ref().sync_all()
    }
}

/// Archive open for writing
pub struct ArchiveWriter {
    path: PathBuf,
    builder: tar::Builder<Sink>,
}

impl ArchiveWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|e| ArchiveError::native(&path, e))?;
        let file = BufWriter::new(file);

        let sink = if is_compressed_name(&path) {
            Sink::Gzip(GzEncoder::new(file, Compression::default()))
        } else {
            Sink::Plain(file)
        };

        let mut builder = tar::Builder::new(sink);
        // Symlinks are archived as links, never followed
        builder.follow_symlinks(false);
        // Keep uid/gid/mode/mtime so restored services need no fix-up
        builder.mode(tar::HeaderMode::Complete);

        debug!(archive = %path.display(), "archive opened for writing");
        Ok(Self { path, builder })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add one file (or symlink, or bare directory) under `name`
    ///
    /// Ownership and permissions are copied from the file's metadata and its
    /// content is streamed in chunks.
    pub fn add_entry(&mut self, file: impl AsRef<Path>, name: impl AsRef<Path>) -> Result<()> {
        let file = file.as_ref();
        self.builder
            .append_path_with_name(file, name.as_ref())
            .map_err(|e| ArchiveError::native(file, e))
    }

    /// Add `dir` and everything below it, rooted at `name` inside the archive
    pub fn add_directory(&mut self, dir: impl AsRef<Path>, name: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        let name = name.as_ref();

        for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(dir).to_path_buf();
                ArchiveError::native(&path, io::Error::from(e))
            })?;
            let relative = entry
                .path()
                .strip_prefix(dir)
                .map_err(|e| ArchiveError::native(entry.path(), io::Error::new(io::ErrorKind::InvalidInput, e)))?;
            let entry_name = if relative.as_os_str().is_empty() {
                name.to_path_buf()
            } else {
                name.join(relative)
            };
            if entry_name.as_os_str().is_empty() {
                continue;
            }
            self.add_entry(entry.path(), &entry_name)?;
        }
        Ok(())
    }

    /// Write the trailer and flush everything to disk
    pub fn finish(self) -> Result<()> {
        let path = self.path;
        let sink = self
            .builder
            .into_inner()
            .map_err(|e| ArchiveError::native(&path, e))?;
        sink.finish().map_err(|e| ArchiveError::native(&path, e))?;
        debug!(archive = %path.display(), "archive finalised");
        Ok(())
    }
}

/// Forward-only reader over an archive
pub struct ArchiveReader {
    path: PathBuf,
    archive: tar::Archive<Box<dyn Read + Send>>,
}

impl ArchiveReader {
    /// Open `path`, detecting gzip compression from its first bytes
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path).map_err(|e| ArchiveError::native(&path, e))?;

        let mut magic = [0u8; 2];
        let read = file.read(&mut magic).map_err(|e| ArchiveError::native(&path, e))?;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| ArchiveError::native(&path, e))?;

        let reader = BufReader::new(file);
        let stream: Box<dyn Read + Send> = if read == 2 && magic == GZIP_MAGIC {
            Box::new(GzDecoder::new(reader))
        } else {
            Box::new(reader)
        };

        let mut archive = tar::Archive::new(stream);
        archive.set_preserve_permissions(true);
        archive.set_preserve_mtime(true);
        // Only PAX xattr records written by other tools
        archive.set_unpack_xattrs(true);
        // Changing ownership needs root; otherwise files belong to us
        archive.set_preserve_ownerships(nix::unistd::geteuid().is_root());
        archive.set_overwrite(true);

        Ok(Self { path, archive })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Names of every entry, without extracting payloads
    pub fn list_entries(mut self) -> Result<Vec<String>> {
        let path = self.path;
        let entries = self
            .archive
            .entries()
            .map_err(|e| ArchiveError::native(&path, e))?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| ArchiveError::native(&path, e))?;
            let name = entry.path().map_err(|e| ArchiveError::native(&path, e))?;
            names.push(name.to_string_lossy().into_owned());
        }
        Ok(names)
    }

    /// Extract the single entry called `name` below `dest`
    ///
    /// Returns the path the entry was written to.
    pub fn extract_one(mut self, name: &str, dest: impl AsRef<Path>) -> Result<PathBuf> {
        let dest = dest.as_ref();
        let path = self.path;
        let wanted = Path::new(name);

        let entries = self
            .archive
            .entries()
            .map_err(|e| ArchiveError::native(&path, e))?;

        for entry in entries {
            let mut entry = entry.map_err(|e| ArchiveError::native(&path, e))?;
            let entry_path = entry
                .path()
                .map_err(|e| ArchiveError::native(&path, e))?
                .into_owned();
            if entry_path != wanted {
                continue;
            }
            entry
                .unpack_in(dest)
                .map_err(|e| ArchiveError::native(&path, e))?;
            debug!(archive = %path.display(), entry = name, dest = %dest.display(), "entry extracted");
            return Ok(dest.join(entry_path));
        }

        Err(ArchiveError::EntryNotFound {
            path,
            entry: name.to_string(),
        })
    }

    /// Extract every entry below `dest`
    pub fn extract_all(mut self, dest: impl AsRef<Path>) -> Result<()> {
        let dest = dest.as_ref();
        self.archive
            .unpack(dest)
            .map_err(|e| ArchiveError::native(&self.path, e))?;
        debug!(archive = %self.path.display(), dest = %dest.display(), "archive extracted");
        Ok(())
    }
}
