use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use chrono::Duration;
use chrono::Utc;
use test_utils::fixture_file;

use super::progress_percent;
use super::LocalFile;
use super::MessageType;
use super::UploadStatus;
use super::UploadTarget;
use super::UploadTask;

fn local_file(name: &str, mime_type: &str) -> LocalFile {
    return LocalFile::new(PathBuf::from(name), name, 1024, mime_type);
}

mod message_type {
    use super::*;

    #[test]
    fn it_classifies_by_top_level_mime() {
        assert_eq!(MessageType::from_mime("image/png"), MessageType::Image);
        assert_eq!(MessageType::from_mime("video/mp4"), MessageType::Video);
        assert_eq!(MessageType::from_mime("audio/mpeg"), MessageType::Audio);
        assert_eq!(MessageType::from_mime("application/pdf"), MessageType::Document);
        assert_eq!(MessageType::from_mime("text/csv"), MessageType::Document);
    }

    #[test]
    fn it_ignores_case_and_whitespace() {
        assert_eq!(MessageType::from_mime(" IMAGE/JPEG"), MessageType::Image);
    }

    #[test]
    fn it_defaults_to_document() {
        assert_eq!(MessageType::from_mime(""), MessageType::Document);
        assert_eq!(MessageType::from_mime("garbage"), MessageType::Document);
    }

    #[test]
    fn it_serializes_uppercase() -> Result<()> {
        assert_eq!(MessageType::Video.to_string(), "VIDEO");
        assert_eq!(serde_json::to_string(&MessageType::Audio)?, "\"AUDIO\"");

        return Ok(());
    }
}

mod upload_status {
    use super::*;

    #[test]
    fn it_marks_terminal_states() {
        assert!(!UploadStatus::Queued.is_terminal());
        assert!(!UploadStatus::Uploading.is_terminal());
        assert!(UploadStatus::Success.is_terminal());
        assert!(UploadStatus::Error.is_terminal());
        assert!(UploadStatus::Canceled.is_terminal());
    }

    #[test]
    fn it_allows_documented_transitions() {
        assert!(UploadStatus::Queued.can_transition_to(UploadStatus::Uploading));
        assert!(UploadStatus::Queued.can_transition_to(UploadStatus::Canceled));
        assert!(UploadStatus::Uploading.can_transition_to(UploadStatus::Success));
        assert!(UploadStatus::Uploading.can_transition_to(UploadStatus::Error));
        assert!(UploadStatus::Uploading.can_transition_to(UploadStatus::Canceled));
        assert!(UploadStatus::Error.can_transition_to(UploadStatus::Queued));
        assert!(UploadStatus::Canceled.can_transition_to(UploadStatus::Queued));
    }

    #[test]
    fn it_rejects_everything_else() {
        assert!(!UploadStatus::Queued.can_transition_to(UploadStatus::Success));
        assert!(!UploadStatus::Queued.can_transition_to(UploadStatus::Error));
        assert!(!UploadStatus::Success.can_transition_to(UploadStatus::Queued));
        assert!(!UploadStatus::Success.can_transition_to(UploadStatus::Canceled));
        assert!(!UploadStatus::Canceled.can_transition_to(UploadStatus::Uploading));
        assert!(!UploadStatus::Uploading.can_transition_to(UploadStatus::Queued));
    }
}

mod upload_task {
    use super::*;

    #[test]
    fn it_starts_queued() {
        let task = UploadTask::new(
            local_file("a.pdf", "application/pdf"),
            UploadTarget::General,
            BTreeMap::new(),
        );

        assert_eq!(task.status, UploadStatus::Queued);
        assert_eq!(task.progress, 0);
        assert_eq!(task.message_type, MessageType::Document);
        assert!(task.error.is_none());
        assert!(task.duration().is_none());
        assert!(!task.is_terminal());
    }

    #[test]
    fn it_generates_unique_ids() {
        let first = UploadTask::new(
            local_file("a.pdf", "application/pdf"),
            UploadTarget::General,
            BTreeMap::new(),
        );
        let second = UploadTask::new(
            local_file("a.pdf", "application/pdf"),
            UploadTarget::General,
            BTreeMap::new(),
        );

        assert_ne!(first.id, second.id);
    }

    #[test]
    fn it_measures_duration() {
        let mut task = UploadTask::new(
            local_file("b.png", "image/png"),
            UploadTarget::Project("p-1".to_string()),
            BTreeMap::new(),
        );
        let started_at = Utc::now();
        task.started_at = Some(started_at);
        task.completed_at = Some(started_at + Duration::seconds(3));

        assert_eq!(task.message_type, MessageType::Image);
        assert_eq!(task.duration(), Some(Duration::seconds(3)));
    }
}

mod from_path {
    use super::*;

    #[tokio::test]
    async fn it_reads_file_details() -> Result<()> {
        let (_dir, path) = fixture_file("drawing.png", 2048);
        let file = LocalFile::from_path(&path).await?;

        assert_eq!(file.name, "drawing.png");
        assert_eq!(file.size, 2048);
        assert_eq!(file.mime_type, "image/png");
        assert_eq!(file.path, path);

        return Ok(());
    }

    #[tokio::test]
    async fn it_falls_back_to_octet_stream() -> Result<()> {
        let (_dir, path) = fixture_file("notes.unknownext", 3);
        let file = LocalFile::from_path(&path).await?;

        assert_eq!(file.mime_type, "application/octet-stream");

        return Ok(());
    }

    #[tokio::test]
    async fn it_fails_for_missing_files() {
        let res = LocalFile::from_path("./does/not/exist.pdf").await;

        assert!(res.is_err());
    }

    #[tokio::test]
    async fn it_fails_for_directories() {
        let (dir, _path) = fixture_file("a.pdf", 1);
        let res = LocalFile::from_path(dir.path()).await;

        assert!(res.is_err());
    }
}

#[test]
fn it_converts_bytes_to_percent() {
    assert_eq!(progress_percent(0, 200), 0);
    assert_eq!(progress_percent(1, 200), 0);
    assert_eq!(progress_percent(100, 200), 50);
    assert_eq!(progress_percent(199, 200), 99);
    assert_eq!(progress_percent(200, 200), 100);
    assert_eq!(progress_percent(500, 200), 100);
    assert_eq!(progress_percent(0, 0), 100);
}
