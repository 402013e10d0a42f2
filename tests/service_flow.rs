mod common;

use bucket_transfer::protocol::{
    BatchStatus, Command, CommandReply, ErrorKind, Event, JobSnapshot, JobStatus, ListFilter,
    NoPayload,
};
use bucket_transfer::{LocalBucketStore, TransferService, TransferSettings};
use common::{record_events, wait_until, Scripted, ScriptedStorage};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn settings() -> TransferSettings {
    TransferSettings {
        upload_concurrency: 2,
        download_concurrency: 2,
        remote_concurrency: 2,
        retry_cap: 3,
        backoff_base_ms: 5,
        backoff_max_ms: 20,
        progress_interval_ms: 0,
        persist_interval_ms: 20,
        ..TransferSettings::default()
    }
}

fn submitted(reply: CommandReply) -> (String, Vec<String>) {
    match reply {
        CommandReply::Submitted { batch_id, job_ids } => (batch_id, job_ids),
        other => panic!("expected a submission, got {:?}", other),
    }
}

async fn list(service: &TransferService) -> Vec<JobSnapshot> {
    match service
        .host()
        .handle(Command::ListJobs(ListFilter::default()))
        .await
    {
        CommandReply::Jobs { jobs } => jobs,
        other => panic!("expected jobs, got {:?}", other),
    }
}

fn status(service: &TransferService, id: &str) -> Option<JobStatus> {
    service
        .queues()
        .find(id)
        .and_then(|q| q.snapshot(id))
        .map(|s| s.status)
}

fn batch_settled(service: &TransferService, batch_id: &str) -> bool {
    service
        .aggregator()
        .progress(batch_id)
        .map_or(false, |p| {
            matches!(p.status, BatchStatus::Finished | BatchStatus::Errored)
        })
}

fn write_file(dir: &Path, name: &str, len: usize) -> String {
    let path = dir.join(name);
    std::fs::write(&path, vec![b'x'; len]).unwrap();
    path.to_string_lossy().into_owned()
}

#[tokio::test]
async fn upload_batch_survives_transient_failures() {
    let dir = tempfile::tempdir().unwrap();
    let storage = ScriptedStorage::new(100, 4, Duration::from_millis(2));
    storage.script("photos/b.jpg", &[Scripted::Network, Scripted::Network]);
    let service = TransferService::start(settings(), storage.clone(), dir.path().join("queue.json"))
        .await
        .unwrap();
    let events = record_events(service.bus());

    let paths: Vec<String> = ["a.jpg", "b.jpg", "c.jpg"]
        .iter()
        .map(|name| write_file(dir.path(), name, 100))
        .collect();
    let reply = service
        .host()
        .dispatch_json(
            &json!({
                "version": 1,
                "action": "submitUpload",
                "payload": {
                    "paths": paths,
                    "destination": { "region": "auto", "bucket": "media", "prefix": "photos" },
                    "options": { "verify": false }
                }
            })
            .to_string(),
        )
        .await;
    let (batch_id, job_ids) = submitted(reply);
    assert_eq!(job_ids.len(), 3);

    wait_until("upload batch", || batch_settled(&service, &batch_id)).await;

    let progress = service.aggregator().progress(&batch_id).unwrap();
    assert_eq!(progress.status, BatchStatus::Finished);
    assert_eq!((progress.total, progress.finished, progress.errored), (3, 3, 0));

    let jobs = list(&service).await;
    let flaky = jobs.iter().find(|j| j.key == "photos/b.jpg").unwrap();
    assert_eq!(flaky.status, JobStatus::Finished);
    assert_eq!(flaky.retry_count, 2);
    assert!(storage.max_in_flight() <= 2);
    assert!(storage.has_object("photos/c.jpg"));

    // Surfaces saw the batch go through running to finished
    let statuses: Vec<BatchStatus> = events
        .lock()
        .iter()
        .filter_map(|e| match e {
            Event::BatchProgress(p) if p.batch_id == batch_id => Some(p.status),
            _ => None,
        })
        .collect();
    assert!(statuses.contains(&BatchStatus::Running));
    assert_eq!(statuses.last(), Some(&BatchStatus::Finished));

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn delete_batch_reports_the_missing_object() {
    let dir = tempfile::tempdir().unwrap();
    let storage = ScriptedStorage::new(0, 1, Duration::from_millis(1));
    storage.script("k3", &[Scripted::NotFound]);
    let service = TransferService::start(settings(), storage.clone(), dir.path().join("queue.json"))
        .await
        .unwrap();

    let items: Vec<_> = (1..=5).map(|i| json!({ "key": format!("k{}", i) })).collect();
    let reply = service
        .host()
        .dispatch_json(
            &json!({
                "action": "submitDelete",
                "payload": { "region": "auto", "bucket": "media", "items": items }
            })
            .to_string(),
        )
        .await;
    let (batch_id, job_ids) = submitted(reply);

    wait_until("delete batch", || batch_settled(&service, &batch_id)).await;

    let statuses: Vec<JobStatus> = job_ids
        .iter()
        .map(|id| status(&service, id).unwrap())
        .collect();
    assert_eq!(
        statuses,
        vec![
            JobStatus::Finished,
            JobStatus::Finished,
            JobStatus::Failed,
            JobStatus::Finished,
            JobStatus::Finished,
        ]
    );
    let failed = service.queues().find(&job_ids[2]).unwrap().snapshot(&job_ids[2]).unwrap();
    assert_eq!(failed.error.unwrap().kind, ErrorKind::NotFound);

    let progress = service.aggregator().progress(&batch_id).unwrap();
    assert_eq!(progress.status, BatchStatus::Errored);
    assert_eq!((progress.finished, progress.errored), (4, 1));

    // Retrying the failed one goes through once the object stops being missing
    let reply = service
        .host()
        .handle(Command::RetryFailed(Default::default()))
        .await;
    assert_eq!(reply, CommandReply::Affected { count: 1 });
    wait_until("retried delete", || {
        status(&service, &job_ids[2]) == Some(JobStatus::Finished)
    })
    .await;
    wait_until("batch recovers", || {
        service
            .aggregator()
            .progress(&batch_id)
            .map_or(false, |p| p.status == BatchStatus::Finished)
    })
    .await;

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn interrupted_download_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let remote_root = dir.path().join("remote");
    let queue_file = dir.path().join("state/queue.json");
    let downloads = dir.path().join("downloads");
    std::fs::create_dir_all(&downloads).unwrap();

    let content: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    let settings = TransferSettings {
        chunk_size: 1024,
        ..settings()
    };
    let store = LocalBucketStore::from_settings(&remote_root, &settings)
        .with_chunk_delay(Duration::from_millis(10));
    let object = store.object_path("media", "videos/clip.bin").unwrap();
    std::fs::create_dir_all(object.parent().unwrap()).unwrap();
    std::fs::write(&object, &content).unwrap();
    let store = Arc::new(store);

    let service = TransferService::start(settings.clone(), store.clone(), &queue_file)
        .await
        .unwrap();
    let reply = service
        .host()
        .dispatch_json(
            &json!({
                "action": "submitDownload",
                "payload": {
                    "region": "auto",
                    "bucket": "media",
                    "items": [{ "key": "videos/clip.bin", "size": content.len() }],
                    "destination": downloads.to_string_lossy()
                }
            })
            .to_string(),
        )
        .await;
    let (_, job_ids) = submitted(reply);
    let id = job_ids[0].clone();

    let progressed = |service: &TransferService| {
        service
            .queues()
            .find(&id)
            .and_then(|q| q.snapshot(&id))
            .map_or(0, |s| s.transferred_bytes)
    };
    wait_until("some bytes", || progressed(&service) >= 8 * 1024).await;
    service.shutdown().await.unwrap();

    // Second session picks the job up from the queue file
    let service = TransferService::start(settings, store.clone(), &queue_file)
        .await
        .unwrap();
    let restored = list(&service).await;
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].id, id);
    assert_eq!(restored[0].status, JobStatus::Stopped);
    let kept = restored[0].transferred_bytes;
    assert!(kept >= 8 * 1024 && kept < content.len() as u64);

    let reply = service
        .host()
        .handle(Command::ResumeAll(NoPayload::default()))
        .await;
    assert_eq!(reply, CommandReply::Affected { count: 1 });
    wait_until("download to finish", || {
        status(&service, &id) == Some(JobStatus::Finished)
    })
    .await;

    let snapshot = service.queues().find(&id).unwrap().snapshot(&id).unwrap();
    assert_eq!(snapshot.transferred_bytes, content.len() as u64);
    assert_eq!(std::fs::read(downloads.join("clip.bin")).unwrap(), content);

    // Done jobs are not written back
    service.flush().await.unwrap();
    let file: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&queue_file).unwrap()).unwrap();
    assert!(file["jobs"].as_object().unwrap().is_empty());

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn running_progress_reaches_the_queue_file() {
    let dir = tempfile::tempdir().unwrap();
    let remote_root = dir.path().join("remote");
    let queue_file = dir.path().join("queue.json");
    let downloads = dir.path().join("downloads");
    std::fs::create_dir_all(&downloads).unwrap();

    let settings = TransferSettings {
        chunk_size: 1024,
        ..settings()
    };
    let store = LocalBucketStore::from_settings(&remote_root, &settings)
        .with_chunk_delay(Duration::from_millis(10));
    let object = store.object_path("media", "big.bin").unwrap();
    std::fs::create_dir_all(object.parent().unwrap()).unwrap();
    std::fs::write(&object, vec![7u8; 128 * 1024]).unwrap();

    let service = TransferService::start(settings, Arc::new(store), &queue_file)
        .await
        .unwrap();
    let reply = service
        .host()
        .dispatch_json(
            &json!({
                "action": "submitDownload",
                "payload": {
                    "region": "auto",
                    "bucket": "media",
                    "items": [{ "key": "big.bin", "size": 128 * 1024 }],
                    "destination": downloads.to_string_lossy()
                }
            })
            .to_string(),
        )
        .await;
    let (_, job_ids) = submitted(reply);
    let id = job_ids[0].clone();

    // No flush: only the throttled writer may put these bytes on disk
    let on_disk = || -> Option<(String, u64)> {
        let body = std::fs::read_to_string(&queue_file).ok()?;
        let file: serde_json::Value = serde_json::from_str(&body).ok()?;
        let job = &file["jobs"][id.as_str()];
        Some((job["status"].as_str()?.to_string(), job["transferred_bytes"].as_u64()?))
    };
    wait_until("progress on disk", || {
        matches!(on_disk(), Some((ref s, bytes)) if s == "running" && bytes > 0)
    })
    .await;

    let (_, written) = on_disk().unwrap();
    assert!(written < 128 * 1024);
    assert_eq!(status(&service, &id), Some(JobStatus::Running));

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn surfaces_see_the_job_finish_before_its_batch() {
    let dir = tempfile::tempdir().unwrap();
    let storage = ScriptedStorage::new(0, 1, Duration::from_millis(1));
    let service = TransferService::start(settings(), storage, dir.path().join("queue.json"))
        .await
        .unwrap();
    let mut surface = service.host().attach_surface();

    let reply = service
        .host()
        .dispatch_json(
            &json!({
                "action": "submitDelete",
                "payload": { "region": "auto", "bucket": "media", "items": [{ "key": "gone" }] }
            })
            .to_string(),
        )
        .await;
    let (batch_id, job_ids) = submitted(reply);

    let mut seen = Vec::new();
    let deadline = Duration::from_secs(30);
    while let Ok(Some(event)) = tokio::time::timeout(deadline, surface.recv()).await {
        let done = matches!(
            &event,
            Event::BatchProgress(p) if p.batch_id == batch_id && p.status == BatchStatus::Finished
        );
        seen.push(event);
        if done {
            break;
        }
    }

    let job_finished = seen.iter().position(|e| {
        matches!(e, Event::JobUpdated(s) if s.id == job_ids[0] && s.status == JobStatus::Finished)
    });
    let batch_finished = seen.iter().position(|e| {
        matches!(e, Event::BatchProgress(p) if p.status == BatchStatus::Finished)
    });
    let (job_finished, batch_finished) = (job_finished.unwrap(), batch_finished.unwrap());
    assert!(job_finished < batch_finished);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn sign_out_clears_everything() {
    let dir = tempfile::tempdir().unwrap();
    let storage = ScriptedStorage::new(100, 50, Duration::from_millis(20));
    let service = TransferService::start(settings(), storage.clone(), dir.path().join("queue.json"))
        .await
        .unwrap();
    let mut surface = service.host().attach_surface();

    let items: Vec<_> = (0..4).map(|i| json!({ "key": format!("old/{}", i) })).collect();
    let reply = service
        .host()
        .dispatch_json(
            &json!({
                "action": "submitRestore",
                "payload": { "region": "auto", "bucket": "cold", "items": items, "days": 3 }
            })
            .to_string(),
        )
        .await;
    let (batch_id, _) = submitted(reply);
    assert!(surface.recv().await.is_some());

    let reply = service.host().handle(Command::SignOut(NoPayload::default())).await;
    assert_eq!(reply, CommandReply::Affected { count: 4 });
    assert!(list(&service).await.is_empty());
    assert!(service.aggregator().progress(&batch_id).is_none());

    service.shutdown().await.unwrap();
}
