//! Tar construction/extraction and buildpack fingerprinting (spec.md §4.C).
//!
//! Mirrors the teacher's `filesystem/archive.rs` approach of doing the
//! actual archive I/O synchronously (the `tar` crate is blocking) and
//! leaving the async wrapping to the caller — our callers invoke these from
//! `tokio::task::spawn_blocking` the same way `archive.rs::compress` does.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use regex::Regex;
use tar::{Builder, EntryType, Header};

use crate::error::{EngineError, Result};

/// Header fields of a located tar entry (spec.md §4.C.2: "a reader
/// positioned at that entry's body plus the header, for size").
#[derive(Debug, Clone)]
pub struct TarEntryHeader {
    pub name: String,
    pub size: u64,
    pub mode: u32,
}

/// Build an in-memory tar archive containing exactly one entry.
///
/// Fails with [`EngineError::Tar`] ("EOF") if `reader` yields fewer bytes
/// than `size` declares — the declared size and the actual byte count must
/// agree exactly, matching spec.md §4.C.1.
pub fn tar_file(name: &str, mut reader: impl Read, size: u64, mode: u32) -> Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());

    let mut header = Header::new_gnu();
    header.set_path(name).map_err(|e| EngineError::Tar(e.to_string()))?;
    header.set_size(size);
    header.set_mode(mode);
    header.set_entry_type(EntryType::Regular);
    header.set_cksum();

    let mut body = Vec::with_capacity(size as usize);
    let mut limited = reader.by_ref().take(size);
    limited
        .read_to_end(&mut body)
        .map_err(|e| EngineError::Tar(e.to_string()))?;
    if (body.len() as u64) < size {
        return Err(EngineError::Tar("EOF".into()));
    }

    builder
        .append(&header, body.as_slice())
        .map_err(|e| EngineError::Tar(e.to_string()))?;
    builder.into_inner().map_err(|e| EngineError::Tar(e.to_string()))
}

/// Sequentially scan `reader`'s tar headers for an entry named `name`,
/// returning its header and body bytes.
///
/// Fails with [`EngineError::Tar`] ("EOF") if no entry matches before the
/// archive ends, per spec.md §4.C.2.
pub fn file_from_tar(name: &str, reader: impl Read) -> Result<(TarEntryHeader, Vec<u8>)> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| EngineError::Tar(e.to_string()))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| EngineError::Tar(e.to_string()))?;
        let path = entry
            .path()
            .map_err(|e| EngineError::Tar(e.to_string()))?
            .to_string_lossy()
            .trim_end_matches('/')
            .to_string();
        if path == name || path.trim_start_matches("./") == name {
            let header = TarEntryHeader {
                name: path,
                size: entry.header().size().map_err(|e| EngineError::Tar(e.to_string()))?,
                mode: entry.header().mode().unwrap_or(0o644),
            };
            let mut body = Vec::with_capacity(header.size as usize);
            entry
                .read_to_end(&mut body)
                .map_err(|e| EngineError::Tar(e.to_string()))?;
            return Ok((header, body));
        }
    }
    Err(EngineError::Tar("EOF".into()))
}

/// Default excludes applied when the caller supplies none (spec.md §4.C.3).
pub fn default_excludes() -> Vec<Regex> {
    vec![
        Regex::new(r"^.+\.droplet$").unwrap(),
        Regex::new(r"^\..+\.cache$").unwrap(),
    ]
}

/// Build an application's upload tar from `path`, which may be either a
/// directory tree or a pre-zipped app bundle (CF `cf push` accepts both).
/// A zip bundle is unpacked to a scratch directory first, then walked the
/// same as a directory would be.
pub fn tar_app(path: &Path, excludes: Option<&[Regex]>) -> Result<Vec<u8>> {
    if is_zip_file(path)? {
        let scratch = tempfile::tempdir().map_err(|e| EngineError::Tar(e.to_string()))?;
        unzip_to(path, scratch.path())?;
        walk_app_dir(scratch.path(), excludes)
    } else {
        walk_app_dir(path, excludes)
    }
}

/// A zip archive's first four bytes are always `PK\x03\x04` (or `PK\x05\x06`
/// for an empty archive) — cheaper than asking `zip::ZipArchive` to parse
/// the whole central directory just to find out.
fn is_zip_file(path: &Path) -> Result<bool> {
    if path.is_dir() {
        return Ok(false);
    }
    let mut f = std::fs::File::open(path).map_err(|e| EngineError::Tar(e.to_string()))?;
    let mut magic = [0u8; 4];
    match f.read_exact(&mut magic) {
        Ok(()) => Ok(magic == *b"PK\x03\x04" || magic == *b"PK\x05\x06"),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(EngineError::Tar(e.to_string())),
    }
}

fn unzip_to(zip_path: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(zip_path).map_err(|e| EngineError::Tar(e.to_string()))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| EngineError::Tar(e.to_string()))?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| EngineError::Tar(e.to_string()))?;
        let out_path = match entry.enclosed_name() {
            Some(name) => dest.join(name),
            None => continue,
        };
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path).map_err(|e| EngineError::Tar(e.to_string()))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::Tar(e.to_string()))?;
        }
        let mut out = std::fs::File::create(&out_path).map_err(|e| EngineError::Tar(e.to_string()))?;
        std::io::copy(&mut entry, &mut out).map_err(|e| EngineError::Tar(e.to_string()))?;
    }
    Ok(())
}

/// Walk `root` recursively, producing a tar archive of every file whose
/// basename doesn't match any of `excludes` (CF "application files"
/// semantics). Directory entries are included so permissions round-trip.
pub fn walk_app_dir(root: &Path, excludes: Option<&[Regex]>) -> Result<Vec<u8>> {
    let owned;
    let excludes = match excludes {
        Some(e) => e,
        None => {
            owned = default_excludes();
            &owned
        }
    };

    let mut builder = Builder::new(Vec::new());
    let mut stack = vec![PathBuf::new()];

    while let Some(rel) = stack.pop() {
        let abs = root.join(&rel);
        let read_dir = std::fs::read_dir(&abs).map_err(|e| EngineError::Tar(e.to_string()))?;
        for entry in read_dir {
            let entry = entry.map_err(|e| EngineError::Tar(e.to_string()))?;
            let basename = entry.file_name();
            let basename = basename.to_string_lossy();
            if excludes.iter().any(|re| re.is_match(&basename)) {
                continue;
            }
            let rel_path = rel.join(entry.file_name());
            let file_type = entry.file_type().map_err(|e| EngineError::Tar(e.to_string()))?;
            if file_type.is_dir() {
                builder
                    .append_dir(&rel_path, entry.path())
                    .map_err(|e| EngineError::Tar(e.to_string()))?;
                stack.push(rel_path);
            } else if file_type.is_file() {
                let mut f = std::fs::File::open(entry.path()).map_err(|e| EngineError::Tar(e.to_string()))?;
                builder
                    .append_file(&rel_path, &mut f)
                    .map_err(|e| EngineError::Tar(e.to_string()))?;
            }
        }
    }

    builder.into_inner().map_err(|e| EngineError::Tar(e.to_string()))
}

/// Buildpack fingerprint: lowercase-hex MD5 of the UTF-8 bytes of `url`
/// (spec.md §4.C).
pub fn fingerprint(url: &str) -> String {
    use md5::{Digest, Md5};
    let digest = Md5::digest(url.as_bytes());
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trips_name_and_bytes() {
        let data = b"hello droplet";
        let archive = tar_file("app/run.sh", Cursor::new(data.to_vec()), data.len() as u64, 0o755).unwrap();

        let (header, body) = file_from_tar("app/run.sh", Cursor::new(archive)).unwrap();
        assert_eq!(body, data);
        assert_eq!(header.size, data.len() as u64);
    }

    #[test]
    fn tar_file_short_read_is_eof() {
        let data = b"short";
        let err = tar_file("x", Cursor::new(data.to_vec()), 100, 0o644).unwrap_err();
        assert!(matches!(err, EngineError::Tar(ref m) if m == "EOF"));
    }

    #[test]
    fn file_from_tar_missing_entry_is_eof() {
        let archive = tar_file("a", Cursor::new(b"x".to_vec()), 1, 0o644).unwrap();
        let err = file_from_tar("b", Cursor::new(archive)).unwrap_err();
        assert!(matches!(err, EngineError::Tar(ref m) if m == "EOF"));
    }

    #[test]
    fn fingerprint_is_lowercase_hex_md5_of_url() {
        let expected = {
            use md5::{Digest, Md5};
            hex::encode(Md5::digest(b"https://example.com/bp.zip"))
        };
        assert_eq!(fingerprint("https://example.com/bp.zip"), expected);
    }

    #[test]
    fn walk_app_dir_skips_default_excludes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.rb"), b"code").unwrap();
        std::fs::write(dir.path().join("old.droplet"), b"junk").unwrap();
        std::fs::write(dir.path().join(".buildpack.cache"), b"junk").unwrap();

        let archive = walk_app_dir(dir.path(), None).unwrap();
        let mut names = Vec::new();
        let mut ar = tar::Archive::new(Cursor::new(archive));
        for entry in ar.entries().unwrap() {
            let entry = entry.unwrap();
            names.push(entry.path().unwrap().to_string_lossy().to_string());
        }
        assert!(names.iter().any(|n| n == "app.rb"));
        assert!(!names.iter().any(|n| n.contains("droplet")));
        assert!(!names.iter().any(|n| n.contains("cache")));
    }

    #[test]
    fn tar_app_unpacks_a_zip_bundle_before_walking() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("app.zip");
        let file = std::fs::File::create(&zip_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer.start_file("app.rb", zip::write::FileOptions::default()).unwrap();
        writer.write_all(b"code").unwrap();
        writer.finish().unwrap();

        let archive = tar_app(&zip_path, None).unwrap();
        let mut names = Vec::new();
        let mut ar = tar::Archive::new(Cursor::new(archive));
        for entry in ar.entries().unwrap() {
            let entry = entry.unwrap();
            names.push(entry.path().unwrap().to_string_lossy().to_string());
        }
        assert!(names.iter().any(|n| n == "app.rb"));
    }

    #[test]
    fn tar_app_walks_a_plain_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.rb"), b"code").unwrap();
        let archive = tar_app(dir.path(), None).unwrap();
        let mut ar = tar::Archive::new(Cursor::new(archive));
        assert!(ar.entries().unwrap().count() >= 1);
    }
}
