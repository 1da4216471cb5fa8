//! Archive extraction
//!
//! The format is sniffed from the file signature, with the extension as a
//! fallback. Content is extracted into a hidden sibling of the destination
//! and renamed into place only when extraction completed.

mod progress;

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::UnpackError;

pub use progress::ProgressReader;

const UNPACK_PREFIX: &str = ".unpack-";
const TAR_MAGIC_OFFSET: u64 = 257;

/// Supported archive formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Tar,
    TarGz,
    TarBz2,
    TarXz,
}

impl ArchiveFormat {
    /// Detect the format of an archive file
    pub fn detect(path: &Path) -> Result<Self, UnpackError> {
        let mut file = File::open(path)?;
        let mut header = [0u8; 6];
        let read = read_up_to(&mut file, &mut header)?;

        if let Some(format) = Self::from_magic(&header[..read]) {
            return Ok(format);
        }

        let mut ustar = [0u8; 5];
        file.seek(SeekFrom::Start(TAR_MAGIC_OFFSET))?;
        if read_up_to(&mut file, &mut ustar)? == ustar.len() && &ustar == b"ustar" {
            return Ok(ArchiveFormat::Tar);
        }

        Self::from_extension(path).ok_or_else(|| UnpackError::UnsupportedArchive(path.to_path_buf()))
    }

    fn from_magic(header: &[u8]) -> Option<Self> {
        match header {
            [b'P', b'K', 0x03, 0x04, ..] | [b'P', b'K', 0x05, 0x06, ..] => Some(ArchiveFormat::Zip),
            [0x1f, 0x8b, ..] => Some(ArchiveFormat::TarGz),
            [b'B', b'Z', b'h', ..] => Some(ArchiveFormat::TarBz2),
            [0xfd, b'7', b'z', b'X', b'Z', 0x00] => Some(ArchiveFormat::TarXz),
            _ => None,
        }
    }

    fn from_extension(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_ascii_lowercase();
        if name.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") {
            Some(ArchiveFormat::TarBz2)
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            Some(ArchiveFormat::TarXz)
        } else if name.ends_with(".tar") {
            Some(ArchiveFormat::Tar)
        } else {
            None
        }
    }

    fn extract<R: Read + Seek>(self, reader: R, dest: &Path) -> Result<(), UnpackError> {
        match self {
            ArchiveFormat::Zip => extract_zip(reader, dest),
            ArchiveFormat::Tar => extract_tar(reader, dest),
            ArchiveFormat::TarGz => extract_tar(flate2::read::GzDecoder::new(reader), dest),
            ArchiveFormat::TarBz2 => extract_tar(bzip2::read::BzDecoder::new(reader), dest),
            ArchiveFormat::TarXz => extract_tar(xz2::read::XzDecoder::new(reader), dest),
        }
    }
}

/// Extract `archive` into `dest`, which must not exist yet.
///
/// A single top-level directory is hoisted so `dest` becomes the archive's
/// content root. Blocking; run it off the async runtime.
pub fn unpack(archive: &Path, dest: &Path, with_progress: bool) -> Result<PathBuf, UnpackError> {
    if dest.exists() {
        return Err(UnpackError::DestinationExists(dest.to_path_buf()));
    }
    let format = ArchiveFormat::detect(archive)?;
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let scratch = tempfile::Builder::new()
        .prefix(UNPACK_PREFIX)
        .tempdir_in(parent)?;
    debug!("Unpacking {:?} as {:?} into {:?}", archive, format, scratch.path());

    let file = BufReader::new(File::open(archive)?);
    if with_progress {
        let total = std::fs::metadata(archive)?.len();
        let label = archive
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        format.extract(ProgressReader::new(file, total, label), scratch.path())?;
    } else {
        format.extract(file, scratch.path())?;
    }

    let root = content_root(scratch.path())?;
    std::fs::rename(&root, dest)?;
    info!("Unpacked {:?} into {:?}", archive, dest);
    Ok(dest.to_path_buf())
}

/// The single top-level directory when it is the only entry, else `dir` itself
fn content_root(dir: &Path) -> Result<PathBuf, UnpackError> {
    let entries: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    match entries.as_slice() {
        [only] if only.file_type()?.is_dir() => Ok(only.path()),
        _ => Ok(dir.to_path_buf()),
    }
}

fn extract_tar<R: Read>(reader: R, dest: &Path) -> Result<(), UnpackError> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.unpack_in(dest)? {
            let path = entry.path()?.display().to_string();
            return Err(UnpackError::UnsafeEntry(path));
        }
    }
    Ok(())
}

fn extract_zip<R: Read + Seek>(reader: R, dest: &Path) -> Result<(), UnpackError> {
    let mut archive = zip::ZipArchive::new(reader)?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(enclosed) = entry.enclosed_name().map(|p| dest.join(p)) else {
            return Err(UnpackError::UnsafeEntry(entry.name().to_string()));
        };
        if entry.is_dir() {
            std::fs::create_dir_all(&enclosed)?;
            continue;
        }
        if let Some(parent) = enclosed.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut outfile = File::create(&enclosed)?;
        std::io::copy(&mut entry, &mut outfile)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                std::fs::set_permissions(&enclosed, std::fs::Permissions::from_mode(mode))?;
            }
        }
    }
    Ok(())
}

fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
