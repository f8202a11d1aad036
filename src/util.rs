//! Small helpers: naming, sanitizing, timestamps and lexical paths

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use walkdir::WalkDir;

/// Timestamp stored in the tables
pub fn timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Timestamp suffix used for stored archive names
pub fn file_stamp() -> String {
    Local::now().format("%Y%m%d%H%M%S").to_string()
}

/// Keep ASCII alphanumerics plus `_`, `-` and `.`
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || "_-.".contains(*c))
        .collect()
}

/// A sanitized name that can be used as a directory name
pub fn is_safe_name(name: &str) -> bool {
    !name.is_empty() && !name.chars().all(|c| c == '.')
}

/// Strip characters that could break out of the argument string of a shell
/// command line
pub fn sanitize_args(args: &str) -> String {
    args.chars()
        .filter(|c| c.is_alphanumeric() || " '\"-_/\\^()[],.=".contains(*c))
        .collect()
}

/// Collapse a free-text comment to a single line
pub fn one_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Human readable size as shown in the tables
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{} KB", bytes / 1024)
    } else {
        format!("{} MB", bytes / (1024 * 1024))
    }
}

/// Split `name.tar.gz` style file names into stem and full extension
pub fn split_extension(file_name: &str) -> (&str, &str) {
    for ext in [".tar.gz", ".tgz", ".tar", ".zip"] {
        if file_name.len() > ext.len() && file_name.to_ascii_lowercase().ends_with(ext) {
            let at = file_name.len() - ext.len();
            return (&file_name[..at], &file_name[at..]);
        }
    }
    match file_name.rfind('.') {
        Some(at) if at > 0 => (&file_name[..at], &file_name[at..]),
        _ => (file_name, ""),
    }
}

/// Resolve `.` and `..` without touching the filesystem
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = matches!(out.components().next_back(), Some(Component::Normal(_)));
                if popped {
                    out.pop();
                } else if !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// `path` relative to `base`, with `..` steps when it lies outside
pub fn relative_to(path: &Path, base: &Path) -> PathBuf {
    let path = normalize(path);
    let base = normalize(base);

    let ours: Vec<_> = path.components().collect();
    let theirs: Vec<_> = base.components().collect();
    let common = ours
        .iter()
        .zip(theirs.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut out = PathBuf::new();
    for _ in common..theirs.len() {
        out.push("..");
    }
    for component in &ours[common..] {
        out.push(component.as_os_str());
    }
    out
}

/// Whether `path` (relative to `base` unless absolute) stays inside `base`
pub fn is_within(path: &Path, base: &Path) -> bool {
    let resolved = normalize(&base.join(path));
    resolved.starts_with(normalize(base))
}

/// Recursively copy `src` into `dst`, skipping entries named in `skip`
pub fn copy_tree(src: &Path, dst: &Path, skip: &[&str]) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("Failed to create {}", dst.display()))?;

    let entries = WalkDir::new(src).min_depth(1).into_iter().filter_entry(|e| {
        e.depth() != 1 || !skip.iter().any(|s| e.file_name() == *s)
    });
    for entry in entries {
        let entry = entry?;
        let rel = entry.path().strip_prefix(src)?;
        let target = dst.join(rel);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target).with_context(|| {
                format!("Failed to copy {} to {}", entry.path().display(), target.display())
            })?;
        }
    }

    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    let link = fs::read_link(src)?;
    std::os::unix::fs::symlink(link, dst)?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    fs::copy(src, dst)?;
    Ok(())
}

/// Delete a tree after clearing read-only bits that would block removal
pub fn remove_tree(path: &Path) -> Result<()> {
    for entry in WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_symlink() {
            continue;
        }
        if let Ok(meta) = entry.metadata() {
            let mut perms = meta.permissions();
            if perms.readonly() {
                #[allow(clippy::permissions_set_readonly_false)]
                perms.set_readonly(false);
                let _ = fs::set_permissions(entry.path(), perms);
            }
        }
    }
    fs::remove_dir_all(path).with_context(|| format!("Failed to remove {}", path.display()))
}

/// Total size of the regular files under `path`
pub fn tree_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize_name("my prog/../x!"), "myprog..x");
        assert_eq!(sanitize_args("main.py -n 3; rm -rf / && `id`"), "main.py -n 3 rm -rf /  id");
        assert_eq!(one_line("first\nsecond\t third "), "first second third");
        assert!(is_safe_name("v1.2"));
        assert!(!is_safe_name(".."));
        assert!(!is_safe_name(""));
    }

    #[test]
    fn test_split_extension() {
        assert_eq!(split_extension("foo.tar.gz"), ("foo", ".tar.gz"));
        assert_eq!(split_extension("foo.ZIP"), ("foo", ".ZIP"));
        assert_eq!(split_extension("foo.rar"), ("foo", ".rar"));
        assert_eq!(split_extension("foo"), ("foo", ""));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(10), "10 B");
        assert_eq!(format_size(2048), "2 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3 MB");
    }

    #[test]
    fn test_relative_paths() {
        let base = Path::new("/srv/programs/foo");
        assert_eq!(
            relative_to(Path::new("/srv/programs/foo/data/./in.csv"), base),
            PathBuf::from("data/in.csv")
        );
        assert_eq!(
            relative_to(Path::new("/srv/other/x.csv"), base),
            PathBuf::from("../../other/x.csv")
        );
        assert!(is_within(Path::new("out/../out/r.csv"), base));
        assert!(!is_within(Path::new("../../etc/passwd"), base));
        assert!(!is_within(Path::new("/tmp/r.csv"), base));
    }

    #[test]
    fn test_copy_and_remove_tree() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("pkg")).unwrap();
        fs::write(src.join("pkg/mod.py"), "x = 1").unwrap();
        fs::write(src.join("skip.log"), "log").unwrap();

        let dst = dir.path().join("dst");
        copy_tree(&src, &dst, &["skip.log"]).unwrap();
        assert_eq!(fs::read_to_string(dst.join("pkg/mod.py")).unwrap(), "x = 1");
        assert!(!dst.join("skip.log").exists());

        let file = dst.join("pkg/mod.py");
        let mut perms = fs::metadata(&file).unwrap().permissions();
        perms.set_readonly(true);
        fs::set_permissions(&file, perms).unwrap();

        remove_tree(&dst).unwrap();
        assert!(!dst.exists());
        assert_eq!(tree_size(&src), 8);
    }
}
