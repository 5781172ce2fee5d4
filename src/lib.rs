use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(feature = "env")]
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

pub mod error;
pub mod helpers;
pub mod storage;

pub use error::{CaptureError, MultipartError, NoSeparator, StorageError};
pub use helpers::traits::bytes::SplitBytes;
pub use helpers::traits::http_request::{
    extension_of, ExtractedFile, Extraction, Multipart, MultipartPart, RequestUtils,
    DEFAULT_EXTENSION,
};
pub use helpers::traits::http_response::ACKNOWLEDGEMENT;
pub use helpers::traits::http_stream::StreamCapture;
pub use storage::{ArtifactKind, ArtifactSink, Clock, DirectorySink, SystemClock};

pub mod external {
    #[cfg(feature = "env")]
    pub use dotenv;
    pub use http;
    pub use tokio;
}

pub type SendableError = Box<dyn std::error::Error + Send + Sync>;

/// Listening endpoint, read limits and storage location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub address: String,
    pub port: u16,
    pub idle_timeout_seconds: f64,
    pub max_bytes: usize,
    pub storage_dir: PathBuf,
    pub read_buffer_size: usize,
    pub no_delay: bool,
}

const DEFAULT_IDLE_TIMEOUT_SECONDS: f64 = 5.0;

impl Default for Options {
    fn default() -> Self {
        Options {
            address: "127.0.0.1".into(),
            port: 8000,
            idle_timeout_seconds: DEFAULT_IDLE_TIMEOUT_SECONDS,
            max_bytes: 10240,
            storage_dir: PathBuf::from("./request"),
            read_buffer_size: 1024,
            no_delay: true,
        }
    }
}

impl Options {
    pub fn new() -> Options {
        #[allow(unused_mut)]
        let mut _options = Options::default();

        #[cfg(feature = "env")]
        {
            use std::env;
            if let Ok(data) = env::var("CAPTURE_ADDRESS") {
                _options.address = data;
            }

            if let Ok(data) = env::var("CAPTURE_PORT") {
                if let Ok(data) = data.parse::<u16>() {
                    _options.port = data;
                }
            }

            if let Ok(data) = env::var("CAPTURE_IDLE_TIMEOUT_SECONDS") {
                if let Ok(data) = data.parse::<f64>() {
                    _options.idle_timeout_seconds = data;
                }
            }

            if let Ok(data) = env::var("CAPTURE_MAX_BYTES") {
                if let Ok(data) = data.parse::<usize>() {
                    _options.max_bytes = data;
                }
            }

            if let Ok(data) = env::var("CAPTURE_STORAGE_DIR") {
                if let Ok(data) = PathBuf::from_str(&data) {
                    _options.storage_dir = data;
                }
            }

            if let Ok(data) = env::var("CAPTURE_READ_BUFFER_SIZE") {
                if let Ok(data) = data.parse::<usize>() {
                    _options.read_buffer_size = data;
                }
            }

            if let Ok(data) = env::var("CAPTURE_NO_DELAY") {
                // true, false
                if let Ok(data) = data.parse::<bool>() {
                    _options.no_delay = data;
                }
            }
        }

        _options
    }

    /// Loads options from a JSON file; keys it leaves out come from
    /// [`Options::new`], so environment overrides still apply.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Options, CaptureError> {
        Self::from_json_file_over(path, Options::new())
    }

    /// Loads options from a JSON file, layering its keys over `base`.
    pub fn from_json_file_over<P: AsRef<Path>>(
        path: P,
        base: Options,
    ) -> Result<Options, CaptureError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| CaptureError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        let parse_error = |source| CaptureError::ConfigParse {
            path: path.to_path_buf(),
            source,
        };

        let overrides: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&data).map_err(parse_error)?;
        let mut merged = match serde_json::to_value(base).map_err(parse_error)? {
            serde_json::Value::Object(fields) => fields,
            _ => serde_json::Map::new(),
        };
        merged.extend(overrides);

        serde_json::from_value(serde_json::Value::Object(merged)).map_err(parse_error)
    }

    /// Idle timeout as a `Duration`; unusable values fall back to 5 seconds.
    pub fn idle_timeout(&self) -> Duration {
        match Duration::try_from_secs_f64(self.idle_timeout_seconds) {
            Ok(timeout) if !timeout.is_zero() => timeout,
            _ => Duration::from_secs_f64(DEFAULT_IDLE_TIMEOUT_SECONDS),
        }
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Why the byte reader stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEnd {
    PeerClosed,
    SizeCap,
    IdleTimeout,
    Failed(io::ErrorKind),
}

/// Bytes captured from one connection.
#[derive(Debug, Clone)]
pub struct RawRequest {
    pub bytes: Vec<u8>,
    pub end: ReadEnd,
}

impl RawRequest {
    pub fn new(bytes: Vec<u8>, end: ReadEnd) -> Self {
        Self { bytes, end }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Per-connection lifecycle. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Accepted,
    Reading,
    Parsing,
    Persisting,
    Responding,
    Closed,
}

/// What one connection cycle produced.
#[derive(Debug)]
pub struct ConnectionReport {
    pub peer: Option<SocketAddr>,
    pub state: ConnectionState,
    pub read_end: Option<ReadEnd>,
    pub bytes_read: usize,
    pub extraction: Option<Extraction>,
    pub raw_path: Option<PathBuf>,
    pub file_path: Option<PathBuf>,
    pub storage_errors: Vec<StorageError>,
    pub acknowledged: bool,
}

impl ConnectionReport {
    fn new(peer: Option<SocketAddr>) -> Self {
        Self {
            peer,
            state: ConnectionState::Accepted,
            read_end: None,
            bytes_read: 0,
            extraction: None,
            raw_path: None,
            file_path: None,
            storage_errors: Vec::new(),
            acknowledged: false,
        }
    }

    fn enter(&mut self, next: ConnectionState) {
        debug_assert!(next > self.state, "{:?} -> {:?}", self.state, next);
        debug!(peer = ?self.peer, from = ?self.state, to = ?next, "connection state");
        self.state = next;
    }

    fn record(&mut self, stored: Result<PathBuf, StorageError>) -> Option<PathBuf> {
        match stored {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(error = %e, "storage failed, continuing");
                self.storage_errors.push(e);
                None
            }
        }
    }
}

/// Server context: the listener, its options and where artifacts go.
pub struct Server<S = DirectorySink> {
    pub listener: TcpListener,
    pub options: Options,
    sink: S,
}

impl Server<DirectorySink> {
    pub async fn new(options: Options) -> Result<Server, CaptureError> {
        let sink = DirectorySink::new(&options.storage_dir);
        Server::with_sink(options, sink).await
    }
}

impl<S: ArtifactSink> Server<S> {
    pub async fn with_sink(options: Options, sink: S) -> Result<Server<S>, CaptureError> {
        let address = options.socket_addr();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| CaptureError::Bind { address, source })?;

        Ok(Server {
            listener,
            options,
            sink,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), CaptureError> {
        match self.listener.accept().await {
            Ok(data) => Ok(data),
            Err(e) => {
                if !is_connection_error(&e) {
                    // Resource exhaustion (EMFILE and friends) clears up slowly.
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(CaptureError::Accept(e))
            }
        }
    }

    /// Runs one full cycle: read, extract, persist, acknowledge, close.
    /// Parsing and storage problems are logged and recorded, never raised.
    pub async fn handle_connection(&self, mut stream: TcpStream) -> ConnectionReport {
        let mut report = ConnectionReport::new(stream.peer_addr().ok());

        report.enter(ConnectionState::Reading);
        let request = stream.read_request(&self.options).await;
        report.read_end = Some(request.end);
        report.bytes_read = request.len();

        report.enter(ConnectionState::Parsing);
        let extraction = request.extract_file();
        match &extraction {
            Extraction::Found(file) => debug!(
                filename = ?file.filename,
                extension = %file.extension,
                len = file.payload.len(),
                "found file part"
            ),
            Extraction::Malformed(e) => debug!(error = %e, "malformed multipart body"),
            other => debug!(outcome = ?other, "no file extracted"),
        }

        report.enter(ConnectionState::Persisting);
        let stored = self
            .sink
            .store(&request.bytes, &ArtifactKind::RawRequest)
            .await;
        report.raw_path = report.record(stored);

        if let Some(file) = extraction.file() {
            let kind = ArtifactKind::File {
                extension: file.extension.clone(),
            };
            let stored = self.sink.store(&file.payload, &kind).await;
            report.file_path = report.record(stored);
        }
        report.extraction = Some(extraction);

        report.enter(ConnectionState::Responding);
        match stream.acknowledge().await {
            Ok(()) => report.acknowledged = true,
            Err(e) => warn!(peer = ?report.peer, error = %e, "failed to send acknowledgement"),
        }

        report.enter(ConnectionState::Closed);
        report
    }

    /// Accepts and handles connections one at a time until `shutdown`
    /// resolves. Shutdown is only observed between connections. The listener
    /// is closed on return.
    pub async fn serve<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        match self.local_addr() {
            Ok(addr) => info!(%addr, "capture server listening"),
            Err(_) => info!("capture server listening"),
        }

        loop {
            let stream = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.accept() => match accepted {
                    Ok((stream, addr)) => {
                        info!(%addr, "request accepted");
                        stream
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };

            let report = self.handle_connection(stream).await;
            info!(
                peer = ?report.peer,
                bytes = report.bytes_read,
                raw = ?report.raw_path,
                file = ?report.file_path,
                "request handled"
            );
        }

        info!("capture server stopped");
    }

    /// `serve` until the process receives Ctrl+C.
    pub async fn serve_until_ctrl_c(self) {
        self.serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for interrupt");
                std::future::pending::<()>().await;
            }
        })
        .await
    }
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}
