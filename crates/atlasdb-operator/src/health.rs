//! Liveness and readiness probes for the operator process.
//!
//! `/healthz` answers as soon as the process is up. `/readyz` only turns
//! green once the controller has confirmed it can list PostgresClusters.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

/// Liveness probe path
pub const LIVENESS_PATH: &str = "/healthz";

/// Readiness probe path
pub const READINESS_PATH: &str = "/readyz";

/// Shared flag flipped once the controller is running
#[derive(Debug, Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_ready(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Status code and body for a request line such as `GET /readyz HTTP/1.1`
pub fn probe_response(request_line: &str, readiness: &Readiness) -> (u16, &'static str) {
    let path = request_line.split_whitespace().nth(1).unwrap_or("/");
    match path {
        LIVENESS_PATH => (200, "OK"),
        READINESS_PATH if readiness.is_ready() => (200, "OK"),
        READINESS_PATH => (503, "controller not started"),
        _ => (404, "not found"),
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        503 => "Service Unavailable",
        _ => "Not Found",
    }
}

/// Bind `addr` and answer probes until the process exits
pub async fn serve(addr: SocketAddr, readiness: Readiness) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(address = %addr, "Starting health server");
    serve_on(listener, readiness).await
}

/// Answer probes on an already bound listener
pub async fn serve_on(listener: TcpListener, readiness: Readiness) -> std::io::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        let readiness = readiness.clone();
        tokio::spawn(async move {
            if let Err(e) = answer(socket, &readiness).await {
                debug!(%peer, error = %e, "Health probe connection failed");
            }
        });
    }
}

async fn answer(mut socket: TcpStream, readiness: &Readiness) -> std::io::Result<()> {
    let mut buf = [0; 1024];
    let read = socket.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..read]);
    let request_line = request.lines().next().unwrap_or_default();

    let (status, body) = probe_response(request_line, readiness);
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason(status),
        body.len(),
        body
    );
    socket.write_all(response.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_paths() {
        let readiness = Readiness::new();
        assert_eq!(probe_response("GET /healthz HTTP/1.1", &readiness).0, 200);
        assert_eq!(probe_response("GET /readyz HTTP/1.1", &readiness).0, 503);
        assert_eq!(probe_response("GET /metrics HTTP/1.1", &readiness).0, 404);
        assert_eq!(probe_response("", &readiness).0, 404);

        readiness.clone().mark_ready();
        assert_eq!(probe_response("GET /readyz HTTP/1.1", &readiness).0, 200);
    }

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path).as_bytes())
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_readiness_follows_controller_start() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let readiness = Readiness::new();
        tokio::spawn(serve_on(listener, readiness.clone()));

        assert!(get(addr, LIVENESS_PATH).await.starts_with("HTTP/1.1 200"));
        assert!(get(addr, READINESS_PATH)
            .await
            .starts_with("HTTP/1.1 503 Service Unavailable"));

        readiness.mark_ready();
        let response = get(addr, READINESS_PATH).await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("OK"));
    }
}
