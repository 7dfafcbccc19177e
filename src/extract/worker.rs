//! MJPEG frame extraction
//!
//! Decomposes a recorded MJPEG file back into per-frame JPEG images by
//! scanning the byte stream for SOI/EOI marker pairs. Runs on a blocking
//! worker, observable through a task registry, cancellable between
//! frames. Archive packaging is an external collaborator behind
//! [`Packager`].

use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{AppError, Result};

/// Read granularity while scanning the source file
const SCAN_CHUNK: usize = 64 * 1024;
/// JPEG start-of-image marker
const SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Extraction task state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionState {
    Pending,
    Running,
    Completed,
    Cancelled,
    Error,
}

/// External archive packager contract: called once after a task
/// completes; the returned path is recorded on the task.
pub trait Packager: Send + Sync {
    fn package(&self, output_dir: &Path, source_stem: &str) -> Result<PathBuf>;
}

struct TaskShared {
    id: String,
    source_path: PathBuf,
    output_dir: PathBuf,
    every_n: u64,
    state: parking_lot::RwLock<ExtractionState>,
    extracted: AtomicU64,
    total_estimated: AtomicU64,
    first_frame: parking_lot::RwLock<Option<String>>,
    last_frame: parking_lot::RwLock<Option<String>>,
    archive_path: parking_lot::RwLock<Option<PathBuf>>,
    error: parking_lot::RwLock<Option<String>>,
    cancel: AtomicBool,
    created_at: Instant,
}

/// Status snapshot of one extraction task
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionStatus {
    pub task_id: String,
    pub source_path: PathBuf,
    pub output_dir: PathBuf,
    pub every_n: u64,
    pub state: ExtractionState,
    pub extracted: u64,
    pub total_estimated: u64,
    pub first_frame: Option<String>,
    pub last_frame: Option<String>,
    pub archive_path: Option<PathBuf>,
    pub error: Option<String>,
}

impl TaskShared {
    fn snapshot(&self) -> ExtractionStatus {
        ExtractionStatus {
            task_id: self.id.clone(),
            source_path: self.source_path.clone(),
            output_dir: self.output_dir.clone(),
            every_n: self.every_n,
            state: *self.state.read(),
            extracted: self.extracted.load(Ordering::Relaxed),
            total_estimated: self.total_estimated.load(Ordering::Relaxed),
            first_frame: self.first_frame.read().clone(),
            last_frame: self.last_frame.read().clone(),
            archive_path: self.archive_path.read().clone(),
            error: self.error.read().clone(),
        }
    }
}

/// Registry and runner for extraction tasks
pub struct ExtractionManager {
    frames_dir: PathBuf,
    tasks: parking_lot::RwLock<HashMap<String, Arc<TaskShared>>>,
    packager: Option<Arc<dyn Packager>>,
}

impl ExtractionManager {
    pub fn new(frames_dir: impl AsRef<Path>, packager: Option<Arc<dyn Packager>>) -> Self {
        Self {
            frames_dir: frames_dir.as_ref().to_path_buf(),
            tasks: parking_lot::RwLock::new(HashMap::new()),
            packager,
        }
    }

    /// Validate the request, create the output directory and spawn the
    /// worker. Returns the new task id immediately.
    pub fn start(&self, source_path: impl AsRef<Path>, every_n: u64) -> Result<String> {
        let source_path = source_path.as_ref().to_path_buf();

        if every_n == 0 {
            return Err(AppError::InvalidArgument(
                "extraction interval must be at least 1".to_string(),
            ));
        }
        if !source_path.is_file() {
            return Err(AppError::NotFound(format!(
                "source file {} does not exist",
                source_path.display()
            )));
        }
        let extension = source_path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        if !matches!(extension.as_deref(), Some("mjpeg") | Some("mjpg")) {
            return Err(AppError::UnsupportedFormat(
                "only MJPEG recordings can be decomposed into frames".to_string(),
            ));
        }

        let task_id = Uuid::new_v4().to_string();
        let output_dir = self.frames_dir.join(&task_id);
        std::fs::create_dir_all(&output_dir)?;

        let shared = Arc::new(TaskShared {
            id: task_id.clone(),
            source_path,
            output_dir,
            every_n,
            state: parking_lot::RwLock::new(ExtractionState::Pending),
            extracted: AtomicU64::new(0),
            total_estimated: AtomicU64::new(0),
            first_frame: parking_lot::RwLock::new(None),
            last_frame: parking_lot::RwLock::new(None),
            archive_path: parking_lot::RwLock::new(None),
            error: parking_lot::RwLock::new(None),
            cancel: AtomicBool::new(false),
            created_at: Instant::now(),
        });
        self.tasks.write().insert(task_id.clone(), shared.clone());

        let packager = self.packager.clone();
        tokio::task::spawn_blocking(move || run_extraction(shared, packager));

        Ok(task_id)
    }

    /// Request cancellation; the worker honors it between frames
    pub fn cancel(&self, task_id: &str) -> Result<()> {
        let tasks = self.tasks.read();
        let task = tasks
            .get(task_id)
            .ok_or_else(|| AppError::NotFound(format!("extraction task {}", task_id)))?;
        task.cancel.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn status(&self, task_id: &str) -> Result<ExtractionStatus> {
        let tasks = self.tasks.read();
        tasks
            .get(task_id)
            .map(|task| task.snapshot())
            .ok_or_else(|| AppError::NotFound(format!("extraction task {}", task_id)))
    }

    pub fn all_statuses(&self) -> Vec<ExtractionStatus> {
        let mut statuses: Vec<_> = self
            .tasks
            .read()
            .values()
            .map(|task| (task.created_at, task.snapshot()))
            .collect();
        statuses.sort_by_key(|(created_at, _)| *created_at);
        statuses.into_iter().map(|(_, status)| status).collect()
    }

    /// Drop finished tasks from the registry, keeping the newest
    /// `keep_last_n`. On-disk frames are left in place.
    pub fn cleanup_completed(&self, keep_last_n: usize) -> usize {
        let mut tasks = self.tasks.write();
        let mut finished: Vec<(Instant, String)> = tasks
            .iter()
            .filter(|(_, task)| {
                matches!(
                    *task.state.read(),
                    ExtractionState::Completed | ExtractionState::Cancelled | ExtractionState::Error
                )
            })
            .map(|(id, task)| (task.created_at, id.clone()))
            .collect();

        finished.sort_by_key(|(created_at, _)| *created_at);
        let remove_count = finished.len().saturating_sub(keep_last_n);
        for (_, id) in finished.into_iter().take(remove_count) {
            tasks.remove(&id);
        }
        remove_count
    }
}

fn run_extraction(task: Arc<TaskShared>, packager: Option<Arc<dyn Packager>>) {
    *task.state.write() = ExtractionState::Running;
    info!(
        "Extraction {} started: {} every {} frame(s)",
        task.id,
        task.source_path.display(),
        task.every_n
    );

    match extract_frames(&task) {
        Ok(()) => {
            if task.cancel.load(Ordering::SeqCst) {
                *task.state.write() = ExtractionState::Cancelled;
                info!("Extraction {} cancelled", task.id);
                return;
            }

            if let Some(packager) = packager {
                let stem = task
                    .source_path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("frames")
                    .to_string();
                match packager.package(&task.output_dir, &stem) {
                    Ok(archive) => *task.archive_path.write() = Some(archive),
                    Err(e) => warn!("Extraction {} packaging failed: {}", task.id, e),
                }
            }

            *task.state.write() = ExtractionState::Completed;
            info!(
                "Extraction {} completed: {} frames",
                task.id,
                task.extracted.load(Ordering::Relaxed)
            );
        }
        Err(e) => {
            error!("Extraction {} failed: {}", task.id, e);
            *task.error.write() = Some(e.to_string());
            *task.state.write() = ExtractionState::Error;
        }
    }
}

fn extract_frames(task: &TaskShared) -> Result<()> {
    let source_size = std::fs::metadata(&task.source_path)?.len();
    let file = File::open(&task.source_path)?;
    let mut reader = BufReader::new(file);

    let mut pending: Vec<u8> = Vec::with_capacity(SCAN_CHUNK * 2);
    let mut chunk = vec![0u8; SCAN_CHUNK];
    let mut seen_frames: u64 = 0;
    let mut written: u64 = 0;
    let mut frame_bytes_total: u64 = 0;

    loop {
        if task.cancel.load(Ordering::SeqCst) {
            return Ok(());
        }

        let read = reader.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        pending.extend_from_slice(&chunk[..read]);

        let mut consumed = 0;
        while let Some((start, end)) = scan_jpeg_frames(&pending[consumed..]) {
            if task.cancel.load(Ordering::SeqCst) {
                return Ok(());
            }

            let frame = &pending[consumed + start..consumed + end];
            seen_frames += 1;
            frame_bytes_total += frame.len() as u64;

            if (seen_frames - 1) % task.every_n == 0 {
                written += 1;
                let name = format!("frame_{:06}.jpg", written);
                let path = task.output_dir.join(&name);
                let mut out = File::create(&path)?;
                out.write_all(frame)?;

                task.extracted.store(written, Ordering::Relaxed);
                if task.first_frame.read().is_none() {
                    *task.first_frame.write() = Some(name.clone());
                }
                *task.last_frame.write() = Some(name);
            }

            // Total estimate from the running mean frame size
            let mean = frame_bytes_total / seen_frames;
            if mean > 0 {
                task.total_estimated
                    .store(source_size / mean / task.every_n, Ordering::Relaxed);
            }

            consumed += end;
        }
        pending.drain(..consumed);
    }

    Ok(())
}

/// Find the next complete SOI..EOI span in `data`.
/// Returns (start, end) with `end` one past the EOI marker.
pub fn scan_jpeg_frames(data: &[u8]) -> Option<(usize, usize)> {
    let start = find_marker(data, &SOI, 0)?;
    let eoi = find_marker(data, &EOI, start + 2)?;
    Some((start, eoi + 2))
}

fn find_marker(data: &[u8], marker: &[u8; 2], from: usize) -> Option<usize> {
    if data.len() < from + 2 {
        return None;
    }
    data[from..]
        .windows(2)
        .position(|w| w == marker)
        .map(|pos| from + pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn jpeg_bytes(fill: u8, payload: usize) -> Vec<u8> {
        let mut data = vec![0xFF, 0xD8];
        data.extend(vec![fill; payload]);
        data.extend([0xFF, 0xD9]);
        data
    }

    fn write_mjpeg(dir: &Path, name: &str, frames: usize) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        for i in 0..frames {
            file.write_all(&jpeg_bytes(i as u8, 300)).unwrap();
        }
        path
    }

    async fn wait_done(manager: &ExtractionManager, task_id: &str) -> ExtractionStatus {
        for _ in 0..100 {
            let status = manager.status(task_id).unwrap();
            if status.state != ExtractionState::Pending && status.state != ExtractionState::Running
            {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("extraction did not finish");
    }

    #[test]
    fn test_scan_finds_marker_pair() {
        let mut data = vec![0x00, 0x01];
        data.extend(jpeg_bytes(0xAA, 10));
        data.extend([0x02, 0x03]);

        let (start, end) = scan_jpeg_frames(&data).unwrap();
        assert_eq!(start, 2);
        assert_eq!(&data[start..start + 2], &[0xFF, 0xD8]);
        assert_eq!(&data[end - 2..end], &[0xFF, 0xD9]);
    }

    #[test]
    fn test_scan_incomplete_frame() {
        // SOI without EOI: not a complete frame yet
        let mut data = vec![0xFF, 0xD8];
        data.extend(vec![0u8; 50]);
        assert!(scan_jpeg_frames(&data).is_none());
    }

    #[tokio::test]
    async fn test_extract_every_frame() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_mjpeg(dir.path(), "clip.mjpeg", 9);
        let manager = ExtractionManager::new(dir.path().join("frames"), None);

        let task_id = manager.start(&source, 1).unwrap();
        let status = wait_done(&manager, &task_id).await;

        assert_eq!(status.state, ExtractionState::Completed);
        assert_eq!(status.extracted, 9);
        assert_eq!(status.first_frame.as_deref(), Some("frame_000001.jpg"));
        assert_eq!(status.last_frame.as_deref(), Some("frame_000009.jpg"));

        for index in 1..=9 {
            let frame_path = status.output_dir.join(format!("frame_{:06}.jpg", index));
            let data = std::fs::read(frame_path).unwrap();
            assert_eq!(&data[..2], &[0xFF, 0xD8]);
            assert_eq!(&data[data.len() - 2..], &[0xFF, 0xD9]);
        }
    }

    #[tokio::test]
    async fn test_extract_every_third_frame() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_mjpeg(dir.path(), "clip.mjpeg", 9);
        let manager = ExtractionManager::new(dir.path().join("frames"), None);

        let task_id = manager.start(&source, 3).unwrap();
        let status = wait_done(&manager, &task_id).await;

        assert_eq!(status.state, ExtractionState::Completed);
        assert_eq!(status.extracted, 3);
        // Frames 1, 4, 7 of the source; output numbering is contiguous
        let first = std::fs::read(status.output_dir.join("frame_000001.jpg")).unwrap();
        assert_eq!(first[2], 0);
        let second = std::fs::read(status.output_dir.join("frame_000002.jpg")).unwrap();
        assert_eq!(second[2], 3);
    }

    #[tokio::test]
    async fn test_input_validation() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ExtractionManager::new(dir.path().join("frames"), None);

        assert!(matches!(
            manager.start(dir.path().join("missing.mjpeg"), 1),
            Err(AppError::NotFound(_))
        ));

        let not_mjpeg = dir.path().join("clip.mp4");
        File::create(&not_mjpeg).unwrap();
        assert!(matches!(
            manager.start(&not_mjpeg, 1),
            Err(AppError::UnsupportedFormat(_))
        ));

        let source = write_mjpeg(dir.path(), "clip.mjpeg", 1);
        assert!(matches!(
            manager.start(&source, 0),
            Err(AppError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_packager_callback_records_archive() {
        struct TouchPackager;
        impl Packager for TouchPackager {
            fn package(&self, output_dir: &Path, source_stem: &str) -> Result<PathBuf> {
                let archive = output_dir
                    .parent()
                    .unwrap()
                    .join(format!("{}_frames.tar.gz", source_stem));
                File::create(&archive)?;
                Ok(archive)
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let source = write_mjpeg(dir.path(), "clip.mjpeg", 3);
        let manager =
            ExtractionManager::new(dir.path().join("frames"), Some(Arc::new(TouchPackager)));

        let task_id = manager.start(&source, 1).unwrap();
        let status = wait_done(&manager, &task_id).await;

        assert_eq!(status.state, ExtractionState::Completed);
        let archive = status.archive_path.unwrap();
        assert!(archive.ends_with("clip_frames.tar.gz"));
        assert!(archive.exists());
    }

    #[tokio::test]
    async fn test_cleanup_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_mjpeg(dir.path(), "clip.mjpeg", 2);
        let manager = ExtractionManager::new(dir.path().join("frames"), None);

        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = manager.start(&source, 1).unwrap();
            wait_done(&manager, &id).await;
            ids.push(id);
        }

        let removed = manager.cleanup_completed(1);
        assert_eq!(removed, 2);
        assert!(manager.status(&ids[0]).is_err());
        assert!(manager.status(&ids[1]).is_err());
        assert!(manager.status(&ids[2]).is_ok());
    }
}
