//! Live stream sessions: admission, per-client state and the frame
//! pipeline shared by HTTP MJPEG and WebSocket clients.

mod session;

pub use session::{StreamParams, StreamSession};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use crate::error::{AppError, Result};

/// Client ID type (UUID string)
pub type ClientId = String;

/// Bound on a single socket write before the session is torn down
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-client session information
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub id: ClientId,
    pub connected_at: Instant,
    pub last_activity: Instant,
    pub frames_sent: u64,
    pub fps_calculator: FpsCalculator,
}

impl ClientSession {
    fn new(id: ClientId) -> Self {
        let now = Instant::now();
        Self {
            id,
            connected_at: now,
            last_activity: now,
            frames_sent: 0,
            fps_calculator: FpsCalculator::new(),
        }
    }

    pub fn connected_duration(&self) -> Duration {
        self.last_activity.duration_since(self.connected_at)
    }
}

/// Rolling 1-second window FPS calculator
#[derive(Debug, Clone)]
pub struct FpsCalculator {
    frame_times: VecDeque<Instant>,
    window: Duration,
}

impl FpsCalculator {
    pub fn new() -> Self {
        Self {
            frame_times: VecDeque::with_capacity(120),
            window: Duration::from_secs(1),
        }
    }

    pub fn record_frame(&mut self) {
        let now = Instant::now();
        self.frame_times.push_back(now);

        let cutoff = now - self.window;
        while let Some(&oldest) = self.frame_times.front() {
            if oldest < cutoff {
                self.frame_times.pop_front();
            } else {
                break;
            }
        }
    }

    /// Frames recorded in the last window
    pub fn current_fps(&self) -> u32 {
        self.frame_times.len() as u32
    }
}

impl Default for FpsCalculator {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-client stats for status snapshots
#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub id: ClientId,
    pub fps: u32,
    pub frames_sent: u64,
    pub connected_secs: u64,
}

/// Admission control and client registry for all live stream sessions
pub struct StreamManager {
    max_clients: usize,
    clients: RwLock<HashMap<ClientId, ClientSession>>,
}

impl StreamManager {
    pub fn new(max_clients: usize) -> Arc<Self> {
        Arc::new(Self {
            max_clients,
            clients: RwLock::new(HashMap::new()),
        })
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    /// Admit a new client or reject before any frame is sent
    fn admit(&self, client_id: ClientId) -> Result<()> {
        let mut clients = self.clients.write();
        if clients.len() >= self.max_clients {
            return Err(AppError::AdmissionDenied(format!(
                "stream client limit ({}) reached",
                self.max_clients
            )));
        }
        clients.insert(client_id.clone(), ClientSession::new(client_id.clone()));
        drop(clients);
        info!(
            "Stream client {} connected (total: {})",
            client_id,
            self.client_count()
        );
        Ok(())
    }

    fn unregister(&self, client_id: &str) {
        if let Some(session) = self.clients.write().remove(client_id) {
            let duration_secs = session.connected_duration().as_secs_f32();
            let avg_fps = if duration_secs > 0.1 {
                session.frames_sent as f32 / duration_secs
            } else {
                0.0
            };
            info!(
                "Stream client {} disconnected after {:.1}s ({} frames, {:.1} avg FPS)",
                client_id, duration_secs, session.frames_sent, avg_fps
            );
        }
    }

    /// Record one frame handed to the transport for this client
    pub fn record_frame_sent(&self, client_id: &str) {
        if let Some(session) = self.clients.write().get_mut(client_id) {
            session.last_activity = Instant::now();
            session.frames_sent += 1;
            session.fps_calculator.record_frame();
        }
    }

    pub fn client_stats(&self) -> Vec<ClientStats> {
        self.clients
            .read()
            .values()
            .map(|session| ClientStats {
                id: session.id.clone(),
                fps: session.fps_calculator.current_fps(),
                frames_sent: session.frames_sent,
                connected_secs: session.connected_duration().as_secs(),
            })
            .collect()
    }
}

/// RAII guard for client lifecycle; ensures unregistration on any exit
/// path, including panics and abrupt disconnects.
pub struct ClientGuard {
    client_id: ClientId,
    manager: Arc<StreamManager>,
}

impl ClientGuard {
    /// Admission check + registration in one step
    pub fn admit(manager: Arc<StreamManager>) -> Result<Self> {
        let client_id = uuid::Uuid::new_v4().to_string();
        manager.admit(client_id.clone())?;
        Ok(Self { client_id, manager })
    }

    pub fn id(&self) -> &ClientId {
        &self.client_id
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.manager.unregister(&self.client_id);
    }
}

/// Assemble one `multipart/x-mixed-replace` part around a JPEG payload
pub fn mjpeg_part(jpeg_data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(128 + jpeg_data.len());

    buf.put_slice(b"--frame\r\n");
    buf.put_slice(b"Content-Type: image/jpeg\r\n");
    buf.put_slice(format!("Content-Length: {}\r\n", jpeg_data.len()).as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(jpeg_data);
    buf.put_slice(b"\r\n");

    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_limit() {
        let manager = StreamManager::new(2);

        let first = ClientGuard::admit(manager.clone()).unwrap();
        let _second = ClientGuard::admit(manager.clone()).unwrap();
        assert_eq!(manager.client_count(), 2);

        // At the limit: denied without registering
        let denied = ClientGuard::admit(manager.clone());
        assert!(matches!(denied, Err(AppError::AdmissionDenied(_))));
        assert_eq!(manager.client_count(), 2);

        // A slot frees on disconnect
        drop(first);
        assert_eq!(manager.client_count(), 1);
        assert!(ClientGuard::admit(manager.clone()).is_ok());
    }

    #[test]
    fn test_record_frame_sent() {
        let manager = StreamManager::new(4);
        let guard = ClientGuard::admit(manager.clone()).unwrap();

        manager.record_frame_sent(guard.id());
        manager.record_frame_sent(guard.id());

        let stats = manager.client_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].frames_sent, 2);
        assert_eq!(stats[0].fps, 2);
    }

    #[test]
    fn test_mjpeg_part_framing() {
        let payload = vec![0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9];
        let part = mjpeg_part(&payload);

        let text = String::from_utf8_lossy(&part);
        assert!(text.starts_with("--frame\r\n"));
        assert!(text.contains("Content-Type: image/jpeg\r\n"));
        assert!(text.contains("Content-Length: 6\r\n"));
        assert!(part.ends_with(b"\r\n"));

        // Payload is embedded verbatim between the blank line and trailer
        let header_end = part
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("header terminator")
            + 4;
        assert_eq!(&part[header_end..header_end + payload.len()], &payload[..]);
    }

    #[test]
    fn test_fps_calculator_window() {
        let mut calc = FpsCalculator::new();
        assert_eq!(calc.current_fps(), 0);
        calc.record_frame();
        calc.record_frame();
        calc.record_frame();
        assert_eq!(calc.current_fps(), 3);
    }
}
