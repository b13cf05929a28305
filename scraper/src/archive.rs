//! On-disk storage of run log archives.
//!
//! The platform serves logs as a ZIP archive where every entry is compressed
//! on its own. Runs are made of many small text files, so they are stored as
//! a tar stream under a single gzip stream instead.

use crate::Result;
use flate2::{write::GzEncoder, Compression};
use github::WorkflowRun;
use log::debug;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::LazyLock,
};

static SANITIZE_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^0-9a-zA-Z]+").unwrap());

/// Replace runs of non-alphanumeric characters with `_`, suffixed with the
/// first 4 hex characters of the text's sha256 so that names sanitizing to
/// the same string stay apart.
pub fn sanitize(text: &str) -> String {
    let digest = hex::encode(Sha256::digest(text.as_bytes()));
    format!("{}_{}", SANITIZE_PATTERN.replace_all(text, "_"), &digest[..4])
}

/// `<logs_dir>/<owner>/<repo>/<sanitized workflow name>/<run_number>-<run_attempt>.tar.gz`.
/// Runs without a display name use their workflow path instead.
pub fn archive_path(logs_dir: &Path, run: &WorkflowRun) -> PathBuf {
    let workflow = run.name.as_deref().unwrap_or(&run.path);
    logs_dir
        .join(&run.repository.full_name)
        .join(sanitize(workflow))
        .join(format!("{}-{}.tar.gz", run.run_number, run.run_attempt))
}

/// Sibling of `path` that is written first, then renamed into place
fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}

/// Epoch seconds of a ZIP timestamp. ZIP does not record a time zone, the
/// timestamp is taken as UTC.
fn zip_mtime(datetime: zip::DateTime) -> u64 {
    chrono::NaiveDate::from_ymd_opt(
        datetime.year().into(),
        datetime.month().into(),
        datetime.day().into(),
    )
    .and_then(|date| {
        date.and_hms_opt(
            datetime.hour().into(),
            datetime.minute().into(),
            datetime.second().into(),
        )
    })
    .map(|datetime| datetime.and_utc().timestamp().max(0) as u64)
    .unwrap_or_default()
}

/// Write the entries of `zip_bytes` to `destination` as a tar.gz archive,
/// keeping entry names, sizes and modification times. Entries are streamed
/// one at a time. Returns the number of entries written.
///
/// Blocking: call from `spawn_blocking`.
pub fn zip_to_tar_gz(zip_bytes: &[u8], destination: &Path) -> Result<usize> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }

    let partial = partial_path(destination);
    let written = write_tar_gz(zip_bytes, &partial).and_then(|written| {
        fs::rename(&partial, destination)?;
        Ok(written)
    });

    if written.is_err() {
        let _ = fs::remove_file(&partial);
    }
    written
}

fn write_tar_gz(zip_bytes: &[u8], path: &Path) -> Result<usize> {
    let mut zip = zip::ZipArchive::new(io::Cursor::new(zip_bytes))?;
    let encoder = GzEncoder::new(BufWriter::new(File::create(path)?), Compression::default());
    let mut tar = tar::Builder::new(encoder);

    for i in 0..zip.len() {
        let entry = zip.by_index(i)?;
        let name = entry.name().to_owned();

        let mut header = tar::Header::new_gnu();
        header.set_size(entry.size());
        header.set_mtime(zip_mtime(entry.last_modified()));
        if entry.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(0o755);
        } else {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(0o644);
        }

        debug!("Adding {} ({} bytes)", name, entry.size());
        tar.append_data(&mut header, &name, entry)?;
    }

    let entries = zip.len();
    tar.into_inner()?.finish()?.flush()?;
    Ok(entries)
}

#[cfg(test)]
pub(crate) mod test {
    use super::{archive_path, sanitize, zip_to_tar_gz};
    use flate2::read::GzDecoder;
    use std::{
        fs::File,
        io::{Cursor, Read, Write},
        path::Path,
    };
    use zip::{write::FileOptions, CompressionMethod, ZipWriter};

    /// ZIP archive of `(name, content)` entries, all dated 2023-08-01 10:00:00
    pub(crate) fn zip_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(zip::DateTime::from_date_and_time(2023, 8, 1, 10, 0, 0).unwrap());
        for (name, content) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn tar_entries(path: &Path) -> Vec<(String, u64, u64, Vec<u8>)> {
        let mut archive = tar::Archive::new(GzDecoder::new(File::open(path).unwrap()));
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let name = entry.path().unwrap().to_string_lossy().into_owned();
                let size = entry.header().size().unwrap();
                let mtime = entry.header().mtime().unwrap();
                let mut content = Vec::new();
                entry.read_to_end(&mut content).unwrap();
                (name, size, mtime, content)
            })
            .collect()
    }

    #[test]
    fn entries_survive_conversion() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("octocat/hello-world/CI_1234/1-1.tar.gz");
        let zip = zip_archive(&[
            ("1_build.txt", b"build log\n"),
            ("2_test.txt", b"test log\nsecond line\n"),
            ("build/1_Set up job.txt", b"step log\n"),
        ]);

        assert_eq!(zip_to_tar_gz(&zip, &destination).unwrap(), 3);
        assert!(!destination.with_file_name("1-1.tar.gz.part").exists());

        let entries = tar_entries(&destination);
        let names: Vec<_> = entries.iter().map(|e| e.0.as_str()).collect();
        assert_eq!(names, ["1_build.txt", "2_test.txt", "build/1_Set up job.txt"]);
        assert_eq!(entries[1].1, 21);
        assert_eq!(entries[1].3, b"test log\nsecond line\n");
        // 2023-08-01T10:00:00Z
        assert!(entries.iter().all(|e| e.2 == 1_690_884_000));
    }

    #[test]
    fn invalid_zip_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("1-1.tar.gz");

        assert!(zip_to_tar_gz(b"not a zip", &destination).is_err());
        assert!(!destination.exists());
        assert!(!dir.path().join("1-1.tar.gz.part").exists());
    }

    #[test]
    fn sanitized_names() {
        assert_eq!(&sanitize("CI / Build & Test")[..14], "CI_Build_Test_");
        assert_eq!(sanitize("CI / Build & Test").len(), 18);
        // Same sanitized prefix, different suffix
        assert_ne!(sanitize("a-b"), sanitize("a_b"));
        assert!(sanitize("a-b").starts_with("a_b_"));
    }

    #[test]
    fn path_layout() {
        let run: github::WorkflowRun = serde_json::from_value(serde_json::json!({
            "id": 1,
            "name": "CI",
            "path": ".github/workflows/ci.yml",
            "run_number": 12,
            "run_attempt": 2,
            "created_at": "2023-08-01T10:00:00Z",
            "logs_url": "https://api.github.com/logs",
            "repository": {"full_name": "octocat/hello-world"},
        }))
        .unwrap();

        let path = archive_path(Path::new("data/logs"), &run);
        assert_eq!(
            path,
            Path::new("data/logs/octocat/hello-world")
                .join(sanitize("CI"))
                .join("12-2.tar.gz")
        );
    }

    #[test]
    fn unnamed_workflows_use_their_path() {
        let run: github::WorkflowRun = serde_json::from_value(serde_json::json!({
            "id": 1,
            "name": null,
            "path": ".github/workflows/ci.yml",
            "run_number": 12,
            "run_attempt": 1,
            "created_at": "2023-08-01T10:00:00Z",
            "logs_url": "https://api.github.com/logs",
            "repository": {"full_name": "octocat/hello-world"},
        }))
        .unwrap();

        let path = archive_path(Path::new("data/logs"), &run);
        assert_eq!(
            path,
            Path::new("data/logs/octocat/hello-world")
                .join(sanitize(".github/workflows/ci.yml"))
                .join("12-1.tar.gz")
        );
    }
}
