//! Archive handling for program sources, libraries and run outputs

use std::fs::{self, File};
use std::io::{self, Read, Seek};
use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use tempfile::{NamedTempFile, TempDir};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Entry that some archivers add next to the real content
const MACOS_METADATA: &str = "__MACOSX";

/// Supported archive formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Tar,
    TarGz,
}

impl ArchiveKind {
    /// Detect the format from a file name
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(ArchiveKind::TarGz)
        } else if lower.ends_with(".tar") {
            Some(ArchiveKind::Tar)
        } else {
            None
        }
    }
}

pub fn extract_zip<R: Read + Seek>(data: R, dest: &Path) -> anyhow::Result<()> {
    let mut archive = ZipArchive::new(data)?;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;

        // entries that would land outside `dest` are skipped
        let file_path = match file.enclosed_name() {
            Some(path) => path.to_owned(),
            None => continue,
        };

        let outpath = dest.join(&file_path);

        if file.is_dir() {
            fs::create_dir_all(&outpath)?;
        } else {
            if let Some(parent) = outpath.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut outfile = File::create(&outpath)?;
            io::copy(&mut file, &mut outfile)?;
        }
    }

    Ok(())
}

/// Unpack a tar stream; the tar crate refuses entries escaping `dest`
pub fn extract_tar<R: Read>(data: R, dest: &Path) -> anyhow::Result<()> {
    let mut archive = tar::Archive::new(data);
    archive.unpack(dest)?;
    Ok(())
}

/// Extract `archive` into `dest`.
///
/// When the archive holds a single top-level directory its contents are
/// placed directly in `dest`. `dest` may already exist (it may hold logs).
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let kind = ArchiveKind::from_name(&name)
        .with_context(|| format!("Unsupported archive type: {}", name))?;

    fs::create_dir_all(dest).with_context(|| format!("Failed to create {}", dest.display()))?;
    // staging next to dest so the final moves are renames
    let staging_parent = dest.parent().unwrap_or(dest);
    let staging = TempDir::new_in(staging_parent).context("Failed to create staging dir")?;

    let file = File::open(archive)
        .with_context(|| format!("Failed to open archive {}", archive.display()))?;
    match kind {
        ArchiveKind::Zip => extract_zip(file, staging.path()),
        ArchiveKind::Tar => extract_tar(file, staging.path()),
        ArchiveKind::TarGz => extract_tar(GzDecoder::new(file), staging.path()),
    }
    .with_context(|| format!("Failed to extract {}", archive.display()))?;

    let metadata = staging.path().join(MACOS_METADATA);
    if metadata.exists() {
        fs::remove_dir_all(&metadata)?;
    }

    let root = single_top_level_dir(staging.path())?.unwrap_or_else(|| staging.path().to_path_buf());
    for entry in fs::read_dir(&root)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        fs::rename(entry.path(), &target)
            .with_context(|| format!("Failed to move {} into place", target.display()))?;
    }

    Ok(())
}

fn single_top_level_dir(dir: &Path) -> Result<Option<std::path::PathBuf>> {
    let entries: Vec<_> = fs::read_dir(dir)?.collect::<io::Result<_>>()?;
    match entries.as_slice() {
        [only] if only.file_type()?.is_dir() => Ok(Some(only.path())),
        _ => Ok(None),
    }
}

/// Compress the tree under `src` into the zip file `dest`.
///
/// `dest` may live inside `src`; it is never added to itself.
pub fn zip_dir(src: &Path, dest: &Path) -> Result<()> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    let tmp = NamedTempFile::new_in(parent).context("Failed to create temp archive")?;
    let tmp_path = tmp.path().to_path_buf();

    let mut writer = ZipWriter::new(tmp.reopen()?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();
        if path == dest || path == tmp_path {
            continue;
        }

        let rel = path.strip_prefix(src)?;
        let name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if entry.file_type().is_dir() {
            writer.add_directory(name, options)?;
        } else if entry.file_type().is_file() {
            writer.start_file(name, options)?;
            let mut file = File::open(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            io::copy(&mut file, &mut writer)?;
        }
    }
    writer.finish()?;

    tmp.persist(dest)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to write {}", dest.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn write_zip(path: &Path, files: &[(&str, &str)]) {
        let mut writer = ZipWriter::new(File::create(path).unwrap());
        for (name, content) in files {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_kind_from_name() {
        assert_eq!(ArchiveKind::from_name("foo.ZIP"), Some(ArchiveKind::Zip));
        assert_eq!(ArchiveKind::from_name("foo.tar.gz"), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::from_name("foo.tgz"), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::from_name("foo.tar"), Some(ArchiveKind::Tar));
        assert_eq!(ArchiveKind::from_name("foo.rar"), None);
    }

    #[test]
    fn test_zip_single_root_is_flattened() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("foo.zip");
        write_zip(
            &archive,
            &[("foo-main/main.py", "print(1)"), ("foo-main/data/in.csv", "a,b")],
        );

        let dest = dir.path().join("programs").join("foo");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("install.log"), "log").unwrap();
        extract_archive(&archive, &dest).unwrap();

        assert_eq!(fs::read_to_string(dest.join("main.py")).unwrap(), "print(1)");
        assert!(dest.join("data/in.csv").exists());
        assert!(dest.join("install.log").exists());
        assert!(!dest.join("foo-main").exists());
    }

    #[test]
    fn test_zip_slip_entries_are_skipped() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("evil.zip");
        write_zip(&archive, &[("../escape.txt", "x"), ("ok.txt", "y"), ("b.txt", "z")]);

        let dest = dir.path().join("out");
        extract_archive(&archive, &dest).unwrap();
        assert!(dest.join("ok.txt").exists());
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[test]
    fn test_tar_gz_without_single_root() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("lib.tar.gz");
        {
            let gz = GzEncoder::new(File::create(&archive).unwrap(), Compression::default());
            let mut builder = tar::Builder::new(gz);
            for (name, content) in [("a.py", "a"), ("pkg/b.py", "b")] {
                let mut header = tar::Header::new_gnu();
                header.set_size(content.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder.append_data(&mut header, name, content.as_bytes()).unwrap();
            }
            builder.into_inner().unwrap().finish().unwrap();
        }

        let dest = dir.path().join("lib");
        extract_archive(&archive, &dest).unwrap();
        assert_eq!(fs::read_to_string(dest.join("a.py")).unwrap(), "a");
        assert_eq!(fs::read_to_string(dest.join("pkg/b.py")).unwrap(), "b");
    }

    #[test]
    fn test_unsupported_archive_is_rejected() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("foo.rar");
        fs::write(&archive, "junk").unwrap();
        assert!(extract_archive(&archive, &dir.path().join("out")).is_err());
    }

    #[test]
    fn test_zip_dir_skips_itself() {
        let dir = TempDir::new().unwrap();
        let run = dir.path().join("run");
        fs::create_dir_all(run.join("out")).unwrap();
        fs::write(run.join("out/result.csv"), "1,2").unwrap();
        fs::write(run.join("main.py"), "pass").unwrap();

        let dest = run.join("foo__t1.zip");
        zip_dir(&run, &dest).unwrap();
        // second pass must not nest the previous archive
        zip_dir(&run, &dest).unwrap();

        let mut archive = ZipArchive::new(File::open(&dest).unwrap()).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert!(names.contains(&"out/result.csv".to_string()));
        assert!(names.contains(&"main.py".to_string()));
        assert!(!names.iter().any(|n| n.ends_with(".zip")));

        let mut content = String::new();
        archive
            .by_name("out/result.csv")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "1,2");
    }
}
