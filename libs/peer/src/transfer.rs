//! PIN-authenticated HTTP transfer of images between two appliances: a
//! small `axum` server exposing the receiving side, and a `reqwest` client
//! driving the sending side.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{FromRequest, Multipart, Path as AxumPath, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::Engine;
use rand::Rng;
use rpi_cloner_storage::repo::{get_repo_usage, DiskImage, ImageRepo};
use rpi_cloner_storage::{ProgressFrame, ProgressSink};
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;

use crate::discovery::PeerDevice;
use crate::error::{AuthenticationError, ServerError, TransferError};

const SESSION_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(30);
const RATE_LIMIT_ATTEMPTS: usize = 3;
const CHUNK_SIZE: usize = 1024 * 1024;

struct Session {
    created_at: Instant,
}

/// Server-side state for the receiving appliance. Generates a fresh 4-digit
/// PIN on construction unless one is supplied.
pub struct TransferServer {
    pin: String,
    destination: ImageRepo,
    sessions: Mutex<HashMap<String, Session>>,
    failed_attempts: Mutex<HashMap<IpAddr, Vec<Instant>>>,
}

#[derive(Deserialize)]
struct AuthRequest {
    pin: String,
}

#[derive(Deserialize)]
struct TransferRequest {
    images: Vec<TransferImageMeta>,
}

#[derive(Deserialize)]
struct TransferImageMeta {
    #[allow(dead_code)]
    name: String,
    size: u64,
}

impl TransferServer {
    pub fn new(destination: ImageRepo, pin: Option<String>) -> Arc<Self> {
        let pin = pin.unwrap_or_else(generate_pin);
        log::info!("peer transfer PIN: {pin}");
        Arc::new(Self {
            pin,
            destination,
            sessions: Mutex::new(HashMap::new()),
            failed_attempts: Mutex::new(HashMap::new()),
        })
    }

    pub fn pin(&self) -> &str {
        &self.pin
    }

    fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/auth", post(handle_auth))
            .route("/transfer", post(handle_transfer))
            .route("/upload/{image_name}", post(handle_upload))
            .route("/status", get(handle_status))
            .with_state(self)
    }

    pub async fn serve(self: Arc<Self>, addr: SocketAddr) -> Result<(), ServerError> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind { addr, source: e })?;
        let router = self.router();
        axum::serve(listener, router)
            .await
            .map_err(|e| ServerError::Runtime(e.to_string()))
    }

    fn check_rate_limit(&self, ip: IpAddr) -> Result<(), u64> {
        let mut attempts = self.failed_attempts.lock().unwrap();
        let now = Instant::now();
        let bucket = attempts.entry(ip).or_default();
        bucket.retain(|t| now.duration_since(*t) < RATE_LIMIT_WINDOW);
        if bucket.len() >= RATE_LIMIT_ATTEMPTS {
            return Err(RATE_LIMIT_WINDOW.as_secs());
        }
        Ok(())
    }

    fn record_failed_attempt(&self, ip: IpAddr) {
        self.failed_attempts
            .lock()
            .unwrap()
            .entry(ip)
            .or_default()
            .push(Instant::now());
    }

    fn clear_failed_attempts(&self, ip: IpAddr) {
        self.failed_attempts.lock().unwrap().remove(&ip);
    }

    fn issue_session(&self) -> String {
        let token = generate_token();
        self.sessions
            .lock()
            .unwrap()
            .insert(token.clone(), Session { created_at: Instant::now() });
        token
    }

    fn check_session(&self, token: &str) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.retain(|_, s| s.created_at.elapsed() < SESSION_TIMEOUT);
        sessions.contains_key(token)
    }
}

fn generate_pin() -> String {
    format!("{:04}", rand::thread_rng().gen_range(0..10000))
}

fn generate_token() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn client_ip(headers: &HeaderMap, fallback: IpAddr) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(fallback)
}

async fn handle_auth(
    State(server): State<Arc<TransferServer>>,
    headers: HeaderMap,
    Json(req): Json<AuthRequest>,
) -> Response {
    let ip = client_ip(&headers, IpAddr::from([0, 0, 0, 0]));
    if let Err(retry_after) = server.check_rate_limit(ip) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "retry_after": retry_after })),
        )
            .into_response();
    }

    if req.pin == server.pin {
        server.clear_failed_attempts(ip);
        let token = server.issue_session();
        Json(json!({ "token": token })).into_response()
    } else {
        server.record_failed_attempt(ip);
        StatusCode::UNAUTHORIZED.into_response()
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

async fn handle_transfer(
    State(server): State<Arc<TransferServer>>,
    headers: HeaderMap,
    Json(req): Json<TransferRequest>,
) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    if !server.check_session(token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let required: u64 = req.images.iter().map(|i| i.size).sum();
    let usage = get_repo_usage(&server.destination);
    if required > usage.free_bytes {
        return (
            StatusCode::INSUFFICIENT_STORAGE,
            Json(json!({ "required": required, "available": usage.free_bytes })),
        )
            .into_response();
    }

    let transfer_id = generate_token();
    Json(json!({ "transfer_id": transfer_id, "accepted": true })).into_response()
}

async fn handle_upload(
    State(server): State<Arc<TransferServer>>,
    AxumPath(image_name): AxumPath<String>,
    request: Request,
) -> Response {
    let headers = request.headers().clone();
    let Some(token) = bearer_token(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    if !server.check_session(token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let is_directory = headers
        .get("x-image-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("clonezilla"));

    let result = if is_directory {
        match Multipart::from_request(request, &server).await {
            Ok(mp) => receive_directory(&server.destination, &image_name, mp).await,
            Err(e) => Err(TransferError::Io(std::io::Error::other(e.to_string()))),
        }
    } else {
        match axum::body::to_bytes(request.into_body(), usize::MAX).await {
            Ok(body) => receive_single_file(&server.destination, &image_name, &body).await,
            Err(e) => Err(TransferError::Io(std::io::Error::other(e.to_string()))),
        }
    };

    match result {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            log::warn!("upload of {image_name} failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn receive_single_file(
    repo: &ImageRepo,
    image_name: &str,
    body: &[u8],
) -> Result<(), TransferError> {
    let dest = repo.path.join(image_name);
    let mut file = tokio::fs::File::create(&dest).await?;
    for chunk in body.chunks(CHUNK_SIZE) {
        file.write_all(chunk).await?;
    }
    file.flush().await?;
    Ok(())
}

async fn receive_directory(
    repo: &ImageRepo,
    image_name: &str,
    mut multipart: Multipart,
) -> Result<(), TransferError> {
    let root = repo.path.join("clonezilla").join(image_name);
    tokio::fs::create_dir_all(&root).await?;

    while let Ok(Some(field)) = multipart.next_field().await {
        let Some(relative) = field.file_name().map(str::to_string) else {
            continue;
        };
        let dest = root.join(relative);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let data = field
            .bytes()
            .await
            .map_err(|e| TransferError::Io(std::io::Error::other(e.to_string())))?;
        tokio::fs::write(&dest, &data).await?;
    }
    Ok(())
}

async fn handle_status(State(server): State<Arc<TransferServer>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ready",
        "pin_required": true,
        "destination": server.destination.path.display().to_string(),
    }))
}

/// Drives an outbound transfer to a peer appliance: authenticates, then
/// uploads each image with progress reported through a [`ProgressSink`].
pub struct TransferClient {
    base_url: String,
    http: reqwest::Client,
    token: Option<String>,
}

impl TransferClient {
    pub fn new(peer: &PeerDevice) -> Self {
        Self {
            base_url: format!("http://{}:{}", peer.ipv4, peer.port),
            http: reqwest::Client::new(),
            token: None,
        }
    }

    pub async fn authenticate(&mut self, pin: &str) -> Result<(), AuthenticationError> {
        let response = self
            .http
            .post(format!("{}/auth", self.base_url))
            .json(&json!({ "pin": pin }))
            .send()
            .await?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            let retry_after_secs = body.get("retry_after").and_then(|v| v.as_u64()).unwrap_or(30);
            return Err(AuthenticationError::RateLimited { retry_after_secs });
        }
        if !response.status().is_success() {
            return Err(AuthenticationError::Rejected);
        }

        let body: serde_json::Value = response.json().await?;
        self.token = body.get("token").and_then(|v| v.as_str()).map(str::to_string);
        Ok(())
    }

    pub async fn send_images(
        &self,
        images: &[DiskImage],
        sink: &mut dyn ProgressSink,
    ) -> Result<(), TransferError> {
        let Some(token) = &self.token else {
            return Err(TransferError::NotAuthenticated);
        };

        let meta: Vec<_> = images
            .iter()
            .map(|img| {
                json!({ "name": img.name(), "size": image_size(img) })
            })
            .collect();

        let response = self
            .http
            .post(format!("{}/transfer", self.base_url))
            .bearer_auth(token)
            .json(&json!({ "images": meta }))
            .send()
            .await?;

        if response.status() == StatusCode::INSUFFICIENT_STORAGE {
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            return Err(TransferError::InsufficientSpace {
                required: body.get("required").and_then(|v| v.as_u64()).unwrap_or(0),
                available: body.get("available").and_then(|v| v.as_u64()).unwrap_or(0),
            });
        }
        response.error_for_status_ref().map_err(TransferError::Request)?;

        for image in images {
            self.upload_image(token, image, sink).await?;
        }
        Ok(())
    }

    async fn upload_image(
        &self,
        token: &str,
        image: &DiskImage,
        sink: &mut dyn ProgressSink,
    ) -> Result<(), TransferError> {
        match image {
            DiskImage::Iso { .. } | DiskImage::ImageUsbBin { .. } => {
                self.upload_single_file(token, image, sink).await
            }
            DiskImage::ClonezillaDir { path, .. } => {
                self.upload_directory(token, image, path, sink).await
            }
        }
    }

    async fn upload_single_file(
        &self,
        token: &str,
        image: &DiskImage,
        sink: &mut dyn ProgressSink,
    ) -> Result<(), TransferError> {
        let size = image_size(image).max(1);
        let bytes = tokio::fs::read(image.path()).await?;
        sink.emit(ProgressFrame {
            lines: vec![format!("Sending {}", image.name())],
            ratio: Some(0.0),
        });
        let response = self
            .http
            .post(format!("{}/upload/{}", self.base_url, image.name()))
            .bearer_auth(token)
            .body(bytes)
            .send()
            .await?;
        response.error_for_status_ref().map_err(TransferError::Request)?;
        sink.emit(ProgressFrame {
            lines: vec![format!("Sent {}", image.name())],
            ratio: Some(size as f64 / size as f64),
        });
        Ok(())
    }

    async fn upload_directory(
        &self,
        token: &str,
        image: &DiskImage,
        dir: &std::path::Path,
        sink: &mut dyn ProgressSink,
    ) -> Result<(), TransferError> {
        let total = dir_size(dir);
        let mut sent = 0u64;
        let mut form = reqwest::multipart::Form::new();

        for entry in walk_files(dir) {
            let relative = entry
                .strip_prefix(dir)
                .unwrap_or(&entry)
                .to_string_lossy()
                .into_owned();
            let bytes = tokio::fs::read(&entry).await?;
            sent += bytes.len() as u64;
            let part = reqwest::multipart::Part::bytes(bytes).file_name(relative);
            form = form.part("file", part);
            sink.emit(ProgressFrame {
                lines: vec![format!("Sending {}", image.name())],
                ratio: Some(if total == 0 { 1.0 } else { sent as f64 / total as f64 }),
            });
        }

        let response = self
            .http
            .post(format!("{}/upload/{}", self.base_url, image.name()))
            .header("X-Image-Type", "clonezilla")
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await?;
        response.error_for_status_ref().map_err(TransferError::Request)?;
        Ok(())
    }
}

fn image_size(image: &DiskImage) -> u64 {
    match image {
        DiskImage::Iso { size, .. } | DiskImage::ImageUsbBin { size, .. } => *size,
        DiskImage::ClonezillaDir { path, .. } => dir_size(path),
    }
}

fn dir_size(dir: &std::path::Path) -> u64 {
    walk_files(dir)
        .iter()
        .filter_map(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .sum()
}

fn walk_files(dir: &std::path::Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            out.extend(walk_files(&path));
        } else {
            out.push(path);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_pin_is_four_digits() {
        let pin = generate_pin();
        assert_eq!(pin.len(), 4);
        assert!(pin.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn generated_token_is_url_safe() {
        let token = generate_token();
        assert!(!token.contains('+'));
        assert!(!token.contains('/'));
    }
}
