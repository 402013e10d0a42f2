//! Turning submit commands into jobs

use log::{debug, warn};
use std::path::{Path, PathBuf};
use transfer_protocol::{
    JobKind, RemoteItem, SubmitDelete, SubmitDownload, SubmitRestore, SubmitUpload,
};

use crate::error::{TransferError, TransferResult};
use crate::job::{Job, JobTarget};

/// A local file found under a submitted path
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LocalFile {
    pub path: PathBuf,
    /// Key suffix, '/'-separated
    pub relative_key: String,
    pub size: Option<u64>,
}

/// `prefix` with exactly one trailing '/', or empty
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string()
}

fn to_key(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Every file under `root`, depth first, hidden entries skipped, sorted by
/// key so a batch always expands the same way.
async fn walk_folder(root: &Path) -> TransferResult<Vec<LocalFile>> {
    let folder = file_name_of(root);
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(current) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if file_name_of(&path).starts_with('.') {
                continue;
            }
            let metadata = tokio::fs::metadata(&path).await?;
            if metadata.is_file() {
                let relative = path.strip_prefix(root).map_err(|e| {
                    TransferError::LocalIo(format!("Failed to get relative path: {}", e))
                })?;
                files.push(LocalFile {
                    relative_key: format!("{}/{}", folder, to_key(relative)),
                    path,
                    size: Some(metadata.len()),
                });
            } else if metadata.is_dir() {
                stack.push(path);
            }
        }
    }

    files.sort_by(|a, b| a.relative_key.cmp(&b.relative_key));
    Ok(files)
}

/// Resolve submitted paths into files. A path that cannot be read still
/// yields an entry, so its job fails visibly instead of vanishing.
pub(crate) async fn collect_local_files(paths: &[String]) -> TransferResult<Vec<LocalFile>> {
    let mut files = Vec::new();
    for raw in paths {
        let path = PathBuf::from(raw);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => {
                let found = walk_folder(&path).await?;
                debug!("expand_folder: {} files={}", path.display(), found.len());
                files.extend(found);
            }
            Ok(meta) => files.push(LocalFile {
                relative_key: file_name_of(&path),
                path,
                size: Some(meta.len()),
            }),
            Err(e) => {
                warn!("expand_missing_path: {} error={}", path.display(), e);
                files.push(LocalFile {
                    relative_key: file_name_of(&path),
                    path,
                    size: None,
                });
            }
        }
    }
    Ok(files)
}

pub(crate) async fn expand_upload(submit: &SubmitUpload) -> TransferResult<Vec<Job>> {
    let prefix = normalize_prefix(&submit.destination.prefix);
    let files = collect_local_files(&submit.paths).await?;
    Ok(files
        .into_iter()
        .map(|file| {
            Job::new(
                JobKind::Upload,
                JobTarget {
                    region: submit.destination.region.clone(),
                    bucket: submit.destination.bucket.clone(),
                    key: format!("{}{}", prefix, file.relative_key),
                    local_path: Some(file.path),
                },
                submit.options.clone(),
            )
            .with_total(file.size)
        })
        .collect())
}

/// Where a downloaded item lands under `destination`
fn download_path(destination: &Path, item: &RemoteItem) -> TransferResult<PathBuf> {
    let relative = match item.name.as_deref() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => item
            .key
            .rsplit('/')
            .next()
            .unwrap_or(item.key.as_str())
            .to_string(),
    };
    let relative = Path::new(&relative);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, std::path::Component::Normal(_)));
    if escapes {
        return Err(TransferError::InvalidRequest(format!(
            "Download name for {} leaves the destination folder",
            item.key
        )));
    }
    Ok(destination.join(relative))
}

pub(crate) fn expand_download(submit: &SubmitDownload) -> TransferResult<Vec<Job>> {
    let destination = PathBuf::from(&submit.destination);
    submit
        .items
        .iter()
        .map(|item| {
            if item.key.ends_with('/') {
                return Err(TransferError::InvalidRequest(format!(
                    "{} is a folder; list it and submit its objects",
                    item.key
                )));
            }
            Ok(Job::new(
                JobKind::Download,
                JobTarget {
                    region: submit.region.clone(),
                    bucket: submit.bucket.clone(),
                    key: item.key.clone(),
                    local_path: Some(download_path(&destination, item)?),
                },
                submit.options.clone(),
            )
            .with_total(item.size))
        })
        .collect()
}

fn remote_jobs(
    kind: JobKind,
    region: &str,
    bucket: &str,
    items: &[RemoteItem],
    options: &transfer_protocol::JobOptions,
) -> Vec<Job> {
    items
        .iter()
        .map(|item| {
            Job::new(
                kind,
                JobTarget {
                    region: region.to_string(),
                    bucket: bucket.to_string(),
                    key: item.key.clone(),
                    local_path: None,
                },
                options.clone(),
            )
            .with_fresh_id()
        })
        .collect()
}

pub(crate) fn expand_delete(submit: &SubmitDelete) -> Vec<Job> {
    remote_jobs(
        JobKind::Delete,
        &submit.region,
        &submit.bucket,
        &submit.items,
        &submit.options,
    )
}

pub(crate) fn expand_restore(submit: &SubmitRestore) -> Vec<Job> {
    remote_jobs(
        JobKind::Restore,
        &submit.region,
        &submit.bucket,
        &submit.items,
        &submit.options,
    )
    .into_iter()
    .map(|job| job.with_restore_days(submit.days))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use transfer_protocol::{JobOptions, RemoteLocation};

    fn item(key: &str) -> RemoteItem {
        RemoteItem {
            key: key.to_string(),
            size: Some(5),
            name: None,
        }
    }

    #[test]
    fn prefix_gets_one_trailing_slash() {
        assert_eq!(normalize_prefix(""), "");
        assert_eq!(normalize_prefix("/"), "");
        assert_eq!(normalize_prefix("2024"), "2024/");
        assert_eq!(normalize_prefix("/2024/trip//"), "2024/trip/");
    }

    #[tokio::test]
    async fn folders_expand_recursively_under_their_name() {
        let dir = tempfile::tempdir().unwrap();
        let album = dir.path().join("album");
        std::fs::create_dir_all(album.join("day1")).unwrap();
        std::fs::write(album.join("cover.jpg"), b"c").unwrap();
        std::fs::write(album.join("day1/a.jpg"), b"aa").unwrap();
        std::fs::write(album.join(".DS_Store"), b"x").unwrap();
        let single = dir.path().join("notes.txt");
        std::fs::write(&single, b"n").unwrap();

        let jobs = expand_upload(&SubmitUpload {
            paths: vec![
                album.to_string_lossy().into_owned(),
                single.to_string_lossy().into_owned(),
            ],
            destination: RemoteLocation {
                region: "auto".to_string(),
                bucket: "photos".to_string(),
                prefix: "backup".to_string(),
            },
            options: JobOptions::default(),
        })
        .await
        .unwrap();

        let keys: Vec<&str> = jobs.iter().map(|j| j.target.key.as_str()).collect();
        assert_eq!(
            keys,
            vec!["backup/album/cover.jpg", "backup/album/day1/a.jpg", "backup/notes.txt"]
        );
        assert_eq!(jobs[1].total_bytes, Some(2));
    }

    #[tokio::test]
    async fn missing_path_still_becomes_a_job() {
        let files = collect_local_files(&["/definitely/not/here.bin".to_string()])
            .await
            .unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].size, None);
        assert_eq!(files[0].relative_key, "here.bin");
    }

    #[test]
    fn download_folders_are_rejected() {
        let submit = SubmitDownload {
            region: "auto".to_string(),
            bucket: "b".to_string(),
            items: vec![item("a.txt"), item("dir/")],
            destination: "/tmp/dl".to_string(),
            options: JobOptions::default(),
        };
        assert!(matches!(
            expand_download(&submit),
            Err(TransferError::InvalidRequest(_))
        ));
    }

    #[test]
    fn download_lands_under_destination() {
        let submit = SubmitDownload {
            region: "auto".to_string(),
            bucket: "b".to_string(),
            items: vec![
                item("deep/path/a.txt"),
                RemoteItem {
                    name: Some("renamed/b.txt".to_string()),
                    ..item("b.txt")
                },
            ],
            destination: "/tmp/dl".to_string(),
            options: JobOptions::default(),
        };
        let jobs = expand_download(&submit).unwrap();
        assert_eq!(
            jobs[0].target.local_path.as_deref(),
            Some(Path::new("/tmp/dl/a.txt"))
        );
        assert_eq!(
            jobs[1].target.local_path.as_deref(),
            Some(Path::new("/tmp/dl/renamed/b.txt"))
        );

        let escaping = SubmitDownload {
            items: vec![RemoteItem {
                name: Some("../etc/passwd".to_string()),
                ..item("x")
            }],
            ..submit
        };
        assert!(expand_download(&escaping).is_err());
    }

    #[test]
    fn remote_items_get_fresh_ids() {
        let submit = SubmitDelete {
            region: "auto".to_string(),
            bucket: "b".to_string(),
            items: vec![item("a"), item("a")],
            options: JobOptions::default(),
        };
        let jobs = expand_delete(&submit);
        assert_eq!(jobs.len(), 2);
        assert_ne!(jobs[0].id, jobs[1].id);
        assert!(jobs[0].id.starts_with("del-"));
    }
}
