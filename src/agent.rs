//! Client side of the device-modding agent
//!
//! The agent runs on the device and is reached over whatever byte channel the
//! caller provides (typically a shell session carried by the bridge). This
//! module only speaks its line protocol; it does not implement patching.

use async_trait::async_trait;
use bridge_shared::agent::{
    ImportResultType, LogLevel, ModModel, ModStatus, Request, Response,
};
use bridge_shared::codec::{self, CodecError, LineDecoder};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, trace, warn};

/// Errors returned by agent requests
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Agent failed: {0}")]
    Remote(String),

    #[error("Unexpected {got} response to {request}")]
    UnexpectedResponse {
        request: &'static str,
        got: &'static str,
    },

    #[error("Agent disconnected before responding")]
    Disconnected,

    #[error("Agent codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Agent I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// Options for patching the app
#[derive(Debug, Clone, Default)]
pub struct PatchOptions {
    pub downgrade_to: Option<String>,
    pub remodding: bool,
    pub allow_no_core_mods: bool,
    pub override_core_mod_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatchOutcome {
    pub installed_mods: Vec<ModModel>,
    pub did_remove_dlc: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportOutcome {
    pub result: ImportResultType,
    pub used_filename: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModSyncOutcome {
    pub installed_mods: Vec<ModModel>,
    pub failures: Option<String>,
}

/// Operations offered by the device-modding agent
#[async_trait]
pub trait ModAgent: Send {
    /// Install status of the app, its mod loader and installed mods
    async fn query_mod_status(&mut self, override_core_mod_url: Option<String>)
        -> Result<ModStatus>;

    /// Patch the app with the mod loader
    async fn patch(&mut self, options: PatchOptions) -> Result<PatchOutcome>;

    /// Import a file already present on the device
    async fn import(&mut self, from_path: &str) -> Result<ImportOutcome>;

    /// Download and import a mod
    async fn import_mod_url(&mut self, from_url: &str) -> Result<ImportOutcome>;

    /// Remove a mod, returning the mods still installed
    async fn remove_mod(&mut self, id: &str) -> Result<Vec<ModModel>>;

    /// Enable or disable mods by ID
    async fn set_mods_enabled(&mut self, statuses: HashMap<String, bool>)
        -> Result<ModSyncOutcome>;
}

/// Agent reached over a newline-delimited JSON byte channel
pub struct LineAgent<R, W> {
    reader: R,
    writer: W,
    decoder: LineDecoder,
    read_buf: Vec<u8>,
}

impl<R, W> LineAgent<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            decoder: LineDecoder::new(),
            read_buf: vec![0u8; 4096],
        }
    }

    /// Send one request and wait for its final response
    ///
    /// Log lines received meanwhile are forwarded to `tracing`. Lines that are
    /// not JSON are skipped. An agent `Error` response becomes
    /// [`AgentError::Remote`].
    pub async fn request(&mut self, request: &Request) -> Result<Response> {
        debug!("[AGENT] -> {}", request.name());

        // Anything still buffered belongs to an earlier exchange
        let stale = self.decoder.buffer_len();
        if stale > 0 {
            warn!("[AGENT] Discarding {} unread bytes from a previous reply", stale);
            self.decoder = LineDecoder::new();
        }

        let encoded = codec::encode(request)?;
        self.writer.write_all(&encoded).await?;
        self.writer.flush().await?;

        loop {
            loop {
                match self.decoder.decode_next::<Value>() {
                    Ok(Some(line)) => {
                        if let Some(response) = final_response(line)? {
                            debug!("[AGENT] <- {}", response.kind());
                            return Ok(response);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => warn!("[AGENT] Skipping unreadable line: {}", e),
                }
            }

            let n = self.reader.read(&mut self.read_buf).await?;
            if n == 0 {
                return Err(AgentError::Disconnected);
            }
            self.decoder.extend(&self.read_buf[..n]);
        }
    }

    pub fn into_inner(self) -> (R, W) {
        (self.reader, self.writer)
    }
}

/// Log progress lines and decode the final one
///
/// Log lines are read loosely so an unknown level still gets logged.
fn final_response(line: Value) -> Result<Option<Response>> {
    if line.get("type").and_then(Value::as_str) == Some("LogMsg") {
        log_agent_line(&line);
        return Ok(None);
    }

    match serde_json::from_value::<Response>(line).map_err(CodecError::from)? {
        Response::Error { message } => Err(AgentError::Remote(message)),
        response => Ok(Some(response)),
    }
}

fn log_agent_line(line: &Value) {
    let message = line.get("message").and_then(Value::as_str).unwrap_or_default();
    let level = line.get("level");

    match level.and_then(|level| serde_json::from_value::<LogLevel>(level.clone()).ok()) {
        Some(LogLevel::Error) => error!("[AGENT] {}", message),
        Some(LogLevel::Warn) => warn!("[AGENT] {}", message),
        Some(LogLevel::Info) => info!("[AGENT] {}", message),
        Some(LogLevel::Debug) => debug!("[AGENT] {}", message),
        Some(LogLevel::Trace) => trace!("[AGENT] {}", message),
        None => info!(
            "[AGENT] ({}) {}",
            level.and_then(serde_json::Value::as_str).unwrap_or("unknown level"),
            message
        ),
    }
}

fn unexpected(request: &Request, response: &Response) -> AgentError {
    AgentError::UnexpectedResponse {
        request: request.name(),
        got: response.kind(),
    }
}

#[async_trait]
impl<R, W> ModAgent for LineAgent<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn query_mod_status(
        &mut self,
        override_core_mod_url: Option<String>,
    ) -> Result<ModStatus> {
        let request = Request::GetModStatus {
            override_core_mod_url,
        };
        match self.request(&request).await? {
            Response::ModStatus(status) => Ok(status),
            other => Err(unexpected(&request, &other)),
        }
    }

    async fn patch(&mut self, options: PatchOptions) -> Result<PatchOutcome> {
        let request = Request::Patch {
            downgrade_to: options.downgrade_to,
            remodding: options.remodding,
            allow_no_core_mods: options.allow_no_core_mods,
            override_core_mod_url: options.override_core_mod_url,
        };
        match self.request(&request).await? {
            Response::Patched {
                installed_mods,
                did_remove_dlc,
            } => Ok(PatchOutcome {
                installed_mods,
                did_remove_dlc,
            }),
            other => Err(unexpected(&request, &other)),
        }
    }

    async fn import(&mut self, from_path: &str) -> Result<ImportOutcome> {
        let request = Request::Import {
            from_path: from_path.to_string(),
        };
        match self.request(&request).await? {
            Response::ImportResult {
                result,
                used_filename,
            } => Ok(ImportOutcome {
                result,
                used_filename,
            }),
            other => Err(unexpected(&request, &other)),
        }
    }

    async fn import_mod_url(&mut self, from_url: &str) -> Result<ImportOutcome> {
        let request = Request::ImportModUrl {
            from_url: from_url.to_string(),
        };
        match self.request(&request).await? {
            Response::ImportResult {
                result,
                used_filename,
            } => Ok(ImportOutcome {
                result,
                used_filename,
            }),
            other => Err(unexpected(&request, &other)),
        }
    }

    async fn remove_mod(&mut self, id: &str) -> Result<Vec<ModModel>> {
        let request = Request::RemoveMod { id: id.to_string() };
        match self.request(&request).await? {
            Response::Mods { installed_mods } => Ok(installed_mods),
            other => Err(unexpected(&request, &other)),
        }
    }

    async fn set_mods_enabled(
        &mut self,
        statuses: HashMap<String, bool>,
    ) -> Result<ModSyncOutcome> {
        let request = Request::SetModsEnabled { statuses };
        match self.request(&request).await? {
            Response::ModSyncResult {
                installed_mods,
                failures,
            } => Ok(ModSyncOutcome {
                installed_mods,
                failures,
            }),
            other => Err(unexpected(&request, &other)),
        }
    }
}
