use crate::error::{empty_body, ResponseBody};
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE, LAST_MODIFIED};
use hyper::{Method, Response, StatusCode};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

/// Read size for streamed file bodies
const CHUNK_SIZE: usize = 64 * 1024;

/// Map a decoded request path onto `root`.
///
/// Returns None for paths with `..` segments; existence is not checked.
pub fn join_request_path(root: &Path, request_path: &str) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    for segment in request_path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return None,
            s if s.contains('\\') || s.contains('\0') => return None,
            s => path.push(s),
        }
    }
    Some(path)
}

/// Canonical form of a decoded request path.
///
/// Empty and `.` segments are dropped and a trailing slash is kept. Returns
/// None for `..`, backslash or NUL segments.
pub fn normalize_path(decoded: &str) -> Option<String> {
    let mut segments = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return None,
            s if s.contains('\\') || s.contains('\0') => return None,
            s => segments.push(s),
        }
    }

    let mut path = format!("/{}", segments.join("/"));
    if !segments.is_empty() && (decoded.ends_with('/') || decoded.ends_with("/.")) {
        path.push('/');
    }
    Some(path)
}

/// Percent-decode a request path, keeping the raw text when it isn't UTF-8
pub fn decode_path(raw: &str) -> String {
    match urlencoding::decode(raw) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => raw.to_string(),
    }
}

fn http_date(time: SystemTime) -> String {
    let time: DateTime<Utc> = time.into();
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Send `file` from inside `document_root`.
///
/// Returns None when the file is missing, not a regular file, or resolves
/// outside the document root; the caller renders its not-found page.
pub async fn serve_file(
    document_root: &Path,
    file: &Path,
    method: &Method,
) -> Option<Response<ResponseBody>> {
    let canonical = tokio::fs::canonicalize(file).await.ok()?;
    let root = tokio::fs::canonicalize(document_root).await.ok()?;
    if !canonical.starts_with(&root) {
        warn!(
            path = %file.display(),
            resolved = %canonical.display(),
            "Refusing to serve file outside document root"
        );
        return None;
    }

    let metadata = tokio::fs::metadata(&canonical).await.ok()?;
    if !metadata.is_file() {
        return None;
    }

    let mime = mime_guess::from_path(&canonical).first_or_octet_stream();
    let last_modified = http_date(metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH));

    let body = if method == Method::HEAD {
        empty_body()
    } else {
        let handle = match tokio::fs::File::open(&canonical).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(path = %canonical.display(), error = %e, "Failed to open static file");
                return None;
            }
        };
        file_body(handle)
    };

    debug!(path = %canonical.display(), size = metadata.len(), "Serving static file");

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, mime.as_ref())
        .header(CONTENT_LENGTH, metadata.len())
        .header(LAST_MODIFIED, last_modified)
        .body(body)
        .expect("valid response with mime type and formatted date");
    Some(response)
}

fn file_body(file: tokio::fs::File) -> ResponseBody {
    let chunks = futures::stream::try_unfold(file, |mut file| async move {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let n = file.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok::<_, std::io::Error>(Some((Frame::data(Bytes::from(buf)), file)))
    });

    StreamBody::new(chunks).boxed_unsync()
}
