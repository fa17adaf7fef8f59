use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use lazy_static::lazy_static;
use regex::Regex;
use sanitize_filename::sanitize;
use sysinfo::Disks;
use tokio::fs;
use tracing::warn;

pub fn url_to_filename(url: &str) -> String {
    lazy_static! {
        // Find the last segment of the URL, discarding any query parameters
        static ref RE: Regex = Regex::new(r#"/([^?/]+)([?].*)?$"#).unwrap();
    }
    RE.captures(url)
        .and_then(|v| v.get(1))
        .map(|v| sanitize(v.as_str()))
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| sanitize(url))
}

/// Work out where a download is written. Relative paths are placed in the
/// download directory, and a path naming a directory gets the file name
/// appended.
pub async fn resolve_destination(
    download_directory: &Path,
    file_path: &str,
    file_name: &str,
) -> PathBuf {
    let path = Path::new(file_path);
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        download_directory.join(path)
    };
    let is_dir = fs::metadata(&path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    if is_dir || file_path.ends_with('/') || file_path.ends_with('\\') {
        path.join(file_name)
    } else {
        path
    }
}

/// Size of the file on disk, 0 if it does not exist.
pub async fn file_size(path: &Path) -> u64 {
    fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

pub async fn file_exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

fn nearest_existing(path: &Path) -> PathBuf {
    let mut current = path;
    loop {
        if current.exists() {
            return current.to_path_buf();
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => return path.to_path_buf(),
        }
    }
}

/// Free bytes on the volume holding `path`, if the volume can be found.
pub fn available_space(path: &Path) -> Option<u64> {
    let target = nearest_existing(path);
    let target = std::fs::canonicalize(&target).unwrap_or(target);
    let disks = Disks::new_with_refreshed_list();

    // The longest mount point containing the path is the volume it lives on.
    disks
        .list()
        .iter()
        .filter(|disk| target.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

/// [`available_space`] off the async runtime, listing disks and resolving
/// paths both block.
pub async fn free_space(path: &Path) -> Option<u64> {
    let path = path.to_path_buf();
    match tokio::task::spawn_blocking(move || available_space(&path)).await {
        Ok(space) => space,
        Err(err) => {
            warn!("Free space lookup failed: {}", err);
            None
        }
    }
}

/// Ask the OS file manager to show the file.
pub fn reveal_in_folder(path: &Path) -> io::Result<()> {
    let mut command = if cfg!(target_os = "macos") {
        let mut command = Command::new("open");
        command.arg("-R").arg(path);
        command
    } else if cfg!(target_os = "windows") {
        let mut command = Command::new("explorer");
        command.arg(format!("/select,{}", path.display()));
        command
    } else {
        let mut command = Command::new("xdg-open");
        command.arg(path.parent().unwrap_or(path));
        command
    };
    command.spawn().map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_comes_from_the_last_segment() {
        assert_eq!(
            url_to_filename("https://example.com/files/game.zip?token=abc"),
            "game.zip"
        );
        assert_eq!(url_to_filename("https://example.com/a/b/c.bin"), "c.bin");
    }

    #[test]
    fn filename_falls_back_to_the_sanitized_url() {
        assert_eq!(url_to_filename("not a url"), "not a url");
        assert!(!url_to_filename("https://example.com/").contains('/'));
    }

    #[tokio::test]
    async fn destinations_resolve_against_the_download_directory() {
        let dir = tempfile::tempdir().unwrap();
        let downloads = dir.path().join("downloads");
        std::fs::create_dir_all(downloads.join("games")).unwrap();

        assert_eq!(
            resolve_destination(&downloads, "games", "a.zip").await,
            downloads.join("games").join("a.zip")
        );
        assert_eq!(
            resolve_destination(&downloads, "other/b.zip", "a.zip").await,
            downloads.join("other/b.zip")
        );
        let absolute = dir.path().join("c.zip");
        assert_eq!(
            resolve_destination(&downloads, &absolute.display().to_string(), "a.zip").await,
            absolute
        );
    }

    #[tokio::test]
    async fn free_space_is_looked_up_on_the_nearest_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("not/yet/created.bin");
        assert_eq!(nearest_existing(&missing), dir.path());
        // Containers may not expose their volumes, only the lookup finishing matters.
        if let Some(free) = free_space(&missing).await {
            assert!(free > 0);
        }
    }

    #[tokio::test]
    async fn missing_files_have_no_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing");
        assert_eq!(file_size(&path).await, 0);
        assert!(!file_exists(&path).await);
        std::fs::write(&path, b"hello").unwrap();
        assert_eq!(file_size(&path).await, 5);
        assert!(file_exists(&path).await);
    }
}
