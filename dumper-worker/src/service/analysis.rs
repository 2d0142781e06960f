//! Supplementary files written into the dump
//!
//! - `board-info.txt`: vendor build date and Qualcomm firmware versions
//! - `all_files.txt`: sorted listing of every file in the dump

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::service::properties::PropertyTree;

pub const BOARD_INFO_FILE: &str = "board-info.txt";
pub const FILE_LIST: &str = "all_files.txt";
pub const DEVICE_TREE_DIR: &str = "aosp-device-tree";

const QC_VERSION: &str = "QC_IMAGE_VERSION_STRING";
const MPSS_VERSION: &str = "QC_IMAGE_VERSION_STRING=MPSS.";

/// Shortest run of printable bytes considered a string
const MIN_STRING_LEN: usize = 4;

/// Writes `board-info.txt` when anything is known about the board
///
/// # Returns
/// The number of lines written, zero when no file was created
pub fn write_board_info(tree: &Path) -> Result<usize> {
    let mut lines = BTreeSet::new();

    if let Some(date) =
        PropertyTree::new(tree).search(&["ro.vendor.build.date.utc"], &["vendor/build.prop"])
    {
        lines.insert(format!("require version-vendor={}", date));
    }

    let modem = tree.join("modem");
    let trustzone = trustzone_dirs(tree);
    if modem.is_dir() && !trustzone.is_empty() {
        let baseband = first_string_containing(&modem, MPSS_VERSION)?
            .map(|s| s.replacen(MPSS_VERSION, "", 1).chars().skip(3).collect::<String>())
            .filter(|v| !v.is_empty());
        if let Some(version) = baseband {
            lines.insert(format!("require version-baseband={}", version));
        }

        for dir in trustzone {
            if let Some(s) = first_string_containing(&dir, QC_VERSION)? {
                lines.insert(s.replacen(QC_VERSION, "require version-trustzone", 1));
                break;
            }
        }
    }

    if lines.is_empty() {
        return Ok(0);
    }

    let mut content = lines.iter().cloned().collect::<Vec<_>>().join("\n");
    content.push('\n');
    std::fs::write(tree.join(BOARD_INFO_FILE), content)
        .with_context(|| format!("Failed to write {}", BOARD_INFO_FILE))?;

    Ok(lines.len())
}

fn trustzone_dirs(tree: &Path) -> Vec<PathBuf> {
    let pattern = format!("{}/tz*", glob::Pattern::escape(&tree.to_string_lossy()));
    let mut dirs: Vec<PathBuf> = glob::glob(&pattern)
        .map(|paths| paths.flatten().filter(|p| p.is_dir()).collect())
        .unwrap_or_default();
    dirs.sort();
    dirs
}

/// First printable string containing `needle` in any file below `dir`
fn first_string_containing(dir: &Path, needle: &str) -> Result<Option<String>> {
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let file = File::open(entry.path())
            .with_context(|| format!("Failed to open {}", entry.path().display()))?;
        if let Some(found) = scan_strings(BufReader::new(file), needle)? {
            return Ok(Some(found));
        }
    }
    Ok(None)
}

/// Streams `reader` like `strings(1)` and returns the first run containing `needle`
fn scan_strings(mut reader: impl Read, needle: &str) -> Result<Option<String>> {
    let mut buffer = [0u8; 64 * 1024];
    let mut run = Vec::new();

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        for &byte in &buffer[..read] {
            if byte == b'\t' || (0x20..0x7f).contains(&byte) {
                run.push(byte);
                continue;
            }
            if let Some(found) = matching_run(&run, needle) {
                return Ok(Some(found));
            }
            run.clear();
        }
    }

    Ok(matching_run(&run, needle))
}

fn matching_run(run: &[u8], needle: &str) -> Option<String> {
    if run.len() < MIN_STRING_LEN {
        return None;
    }
    let text = String::from_utf8_lossy(run);
    text.contains(needle).then(|| text.into_owned())
}

/// Writes `all_files.txt`, one relative path per line
///
/// # Returns
/// The number of files listed
pub fn write_file_list(tree: &Path) -> Result<usize> {
    let files = list_files(tree)?;

    let mut content = files.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    std::fs::write(tree.join(FILE_LIST), content)
        .with_context(|| format!("Failed to write {}", FILE_LIST))?;

    Ok(files.len())
}

/// Sorted relative paths of every file in the dump
pub fn list_files(tree: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();

    let walker = WalkDir::new(tree).into_iter().filter_entry(|e| {
        e.depth() != 1 || (e.file_name() != ".git" && e.file_name() != DEVICE_TREE_DIR)
    });

    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk {}", tree.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(tree)
            .with_context(|| format!("{} is outside the dump", entry.path().display()))?
            .to_string_lossy()
            .into_owned();

        if relative != FILE_LIST {
            files.push(relative);
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::write_file;

    #[test]
    fn test_board_info_collects_versions() {
        let root = tempfile::tempdir().unwrap();
        let tree = root.path();
        write_file(&tree.join("vendor/build.prop"), "ro.vendor.build.date.utc=1700000000\n");

        let mut modem = b"\x00\x01junk\x00".to_vec();
        modem.extend_from_slice(b"QC_IMAGE_VERSION_STRING=MPSS.DE.3.1-00417-KODIAK_GEN_PACK-1\x00\xff");
        std::fs::create_dir_all(tree.join("modem/image")).unwrap();
        std::fs::write(tree.join("modem/image/modem.b01"), modem).unwrap();

        std::fs::create_dir_all(tree.join("tz")).unwrap();
        std::fs::write(
            tree.join("tz/tz.mbn"),
            b"\x00QC_IMAGE_VERSION_STRING=TZ.XF.5.0-00123\x00",
        )
        .unwrap();

        assert_eq!(write_board_info(tree).unwrap(), 3);
        assert_eq!(
            std::fs::read_to_string(tree.join(BOARD_INFO_FILE)).unwrap(),
            "require version-baseband=3.1-00417-KODIAK_GEN_PACK-1\n\
             require version-trustzone=TZ.XF.5.0-00123\n\
             require version-vendor=1700000000\n"
        );
    }

    #[test]
    fn test_board_info_needs_both_modem_and_trustzone() {
        let root = tempfile::tempdir().unwrap();
        let tree = root.path();
        write_file(&tree.join("modem/modem.b01"), "QC_IMAGE_VERSION_STRING=MPSS.DE.3.1");

        assert_eq!(write_board_info(tree).unwrap(), 0);
        assert!(!tree.join(BOARD_INFO_FILE).exists());
    }

    #[test]
    fn test_file_list_excludes_itself_and_generated_dirs() {
        let root = tempfile::tempdir().unwrap();
        let tree = root.path();
        write_file(&tree.join("system/build.prop"), "x");
        write_file(&tree.join("boot.img"), "x");
        write_file(&tree.join(".git/HEAD"), "x");
        write_file(&tree.join("aosp-device-tree/device.mk"), "x");
        write_file(&tree.join(FILE_LIST), "stale");

        assert_eq!(write_file_list(tree).unwrap(), 2);
        assert_eq!(
            std::fs::read_to_string(tree.join(FILE_LIST)).unwrap(),
            "boot.img\nsystem/build.prop\n"
        );
    }

    #[test]
    fn test_strings_scan_ignores_short_runs() {
        let data = b"ab\x00QC_IMAGE_VERSION_STRING=X\x00";
        assert_eq!(
            scan_strings(&data[..], QC_VERSION).unwrap().as_deref(),
            Some("QC_IMAGE_VERSION_STRING=X")
        );
        assert_eq!(scan_strings(&b"QC\x00"[..], "QC").unwrap(), None);
    }
}
