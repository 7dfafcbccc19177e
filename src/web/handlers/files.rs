//! Stored file listings and transfers (photos/, videos/)

use axum::{
    body::Body,
    extract::{Path as AxumPath, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{AppError, Result};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    pub modified: Option<chrono::DateTime<chrono::Local>>,
}

/// Reject anything that could escape the storage directory
fn sanitize_filename(name: &str) -> Result<&str> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || name.starts_with('.')
    {
        return Err(AppError::InvalidArgument(format!(
            "invalid file name: {}",
            name
        )));
    }
    Ok(name)
}

async fn list_dir(dir: &Path) -> Result<Vec<FileEntry>> {
    let mut entries = Vec::new();
    let mut read_dir = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        // A storage dir that does not exist yet is just empty
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
        Err(e) => return Err(AppError::Io(e)),
    };

    while let Some(entry) = read_dir.next_entry().await? {
        let metadata = match entry.metadata().await {
            Ok(m) if m.is_file() => m,
            _ => continue,
        };
        let name = entry.file_name().to_string_lossy().to_string();
        // In-progress recordings stay hidden until renamed
        if name.ends_with(".tmp") {
            continue;
        }
        entries.push(FileEntry {
            name,
            size: metadata.len(),
            modified: metadata.modified().ok().map(chrono::DateTime::from),
        });
    }

    entries.sort_by(|a, b| b.name.cmp(&a.name));
    Ok(entries)
}

async fn serve_file(dir: &Path, name: &str, attachment: bool) -> Result<Response> {
    let name = sanitize_filename(name)?;
    let path = dir.join(name);

    let data = match tokio::fs::read(&path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::NotFound(name.to_string()))
        }
        Err(e) => return Err(AppError::Io(e)),
    };

    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, mime.as_ref())
        .header(header::CONTENT_LENGTH, data.len());
    if attachment {
        builder = builder.header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", name),
        );
    }
    builder
        .body(Body::from(data))
        .map_err(|e| AppError::Internal(e.to_string()))
}

pub async fn list_photos(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>> {
    let files = list_dir(&state.config.storage.photos_dir).await?;
    Ok(Json(json!({ "success": true, "files": files })))
}

pub async fn get_photo(
    State(state): State<Arc<AppState>>,
    AxumPath(file): AxumPath<String>,
) -> Result<impl IntoResponse> {
    serve_file(&state.config.storage.photos_dir, &file, false).await
}

pub async fn download_photo(
    State(state): State<Arc<AppState>>,
    AxumPath(file): AxumPath<String>,
) -> Result<impl IntoResponse> {
    serve_file(&state.config.storage.photos_dir, &file, true).await
}

pub async fn list_videos(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>> {
    let files = list_dir(&state.config.storage.videos_dir).await?;
    Ok(Json(json!({ "success": true, "files": files })))
}

pub async fn get_video(
    State(state): State<Arc<AppState>>,
    AxumPath(file): AxumPath<String>,
) -> Result<impl IntoResponse> {
    serve_file(&state.config.storage.videos_dir, &file, false).await
}

pub async fn download_video(
    State(state): State<Arc<AppState>>,
    AxumPath(file): AxumPath<String>,
) -> Result<impl IntoResponse> {
    serve_file(&state.config.storage.videos_dir, &file, true).await
}

/// Used by the extraction handlers as well
pub(crate) async fn serve_stored_file(
    dir: &Path,
    name: &str,
    attachment: bool,
) -> Result<Response> {
    serve_file(dir, name, attachment).await
}

/// Resolve a user-supplied recording name inside the videos directory
pub(crate) fn resolve_video_path(state: &AppState, name: &str) -> Result<PathBuf> {
    let name = sanitize_filename(name)?;
    Ok(state.config.storage.videos_dir.join(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert!(sanitize_filename("video_20250101_120000.mjpeg").is_ok());
        assert!(sanitize_filename("../etc/passwd").is_err());
        assert!(sanitize_filename("a/b.jpg").is_err());
        assert!(sanitize_filename(".hidden").is_err());
        assert!(sanitize_filename("").is_err());
    }

    #[tokio::test]
    async fn test_list_dir_skips_tmp_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"x").unwrap();
        std::fs::write(dir.path().join("b.mjpeg.tmp"), b"x").unwrap();

        let files = list_dir(dir.path()).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "a.jpg");

        let empty = list_dir(&dir.path().join("missing")).await.unwrap();
        assert!(empty.is_empty());
    }
}
