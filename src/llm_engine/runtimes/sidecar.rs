//! Sidecar inference runtime
//!
//! Runs inference in a separate process so the tensor backend stays isolated
//! from the app. Speaks JSON-RPC 2.0 over stdin/stdout: `load_model`,
//! `generate`, `decode` and `stop` requests, with token batches arriving as
//! `tokens` notifications while a generation is in flight. A single reader
//! task routes responses to waiting callers by request id and forwards token
//! notifications into the active generation's channel.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::llm_engine::catalog::ModelDescriptor;
use crate::llm_engine::downloader;
use crate::llm_engine::error::EngineError;
use crate::llm_engine::prompt::ChatMessage;
use crate::llm_engine::runtime::{
    InferenceRuntime, LoadProgress, LoadStage, ModelHandle, ProgressFn, SampleParams, Token,
    TokenReceiver, TOKEN_CHANNEL_CAPACITY,
};

/// Share of the load progress range attributed to the download; the
/// remainder covers compile/warm-up in the sidecar.
const DOWNLOAD_PROGRESS_SHARE: f32 = 0.9;

#[derive(Debug, Serialize)]
struct JsonRpcRequest {
    jsonrpc: String,
    id: u64,
    method: String,
    params: serde_json::Value,
}

impl JsonRpcRequest {
    fn new(id: u64, method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// One inbound frame: either a response (has `id`) or a notification
/// (has `method`).
#[derive(Debug, Deserialize)]
struct JsonRpcFrame {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    #[allow(dead_code)]
    code: i32,
    message: String,
}

#[derive(Debug, Deserialize)]
struct TokensNotification {
    #[serde(default)]
    tokens: Vec<Token>,
    #[serde(default)]
    done: bool,
}

/// Sidecar runtime configuration
#[derive(Debug, Clone)]
pub struct SidecarConfig {
    /// Directory where GGUF models are stored
    pub models_dir: PathBuf,
    /// Path to the sidecar binary; discovered near the executable if unset
    pub sidecar_path: Option<PathBuf>,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            models_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("localchat")
                .join("models"),
            sidecar_path: None,
        }
    }
}

type PendingMap = HashMap<u64, oneshot::Sender<Result<serde_json::Value, String>>>;
/// Unbounded relay into the active generation. The frame reader must never
/// block on token backpressure, or a decode response queued behind token
/// notifications would go unread while the engine awaits it; the bounded
/// engine channel is fed by a per-generation forwarder task instead.
type TokenSink = mpsc::UnboundedSender<Result<Vec<Token>, EngineError>>;

struct SidecarProcess {
    child: Mutex<Option<Child>>,
    stdin: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    next_id: AtomicU64,
    pending: Mutex<PendingMap>,
    /// Sink of the generation currently in flight, if any
    token_sink: Mutex<Option<TokenSink>>,
}

impl SidecarProcess {
    async fn spawn(path: &PathBuf) -> Result<Arc<Self>, EngineError> {
        log::info!("Starting inference sidecar: {}", path.display());

        let mut child = Command::new(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // sidecar logs go to our stderr
            .spawn()
            .map_err(|e| {
                EngineError::RuntimeUnavailable(format!("Failed to start sidecar: {}", e))
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            EngineError::RuntimeUnavailable("Failed to get sidecar stdin".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            EngineError::RuntimeUnavailable("Failed to get sidecar stdout".to_string())
        })?;

        let process = Self::attach(stdin, stdout);
        *process.child.lock().await = Some(child);
        Ok(process)
    }

    /// Wire up the protocol over arbitrary IO halves. Split out from `spawn`
    /// so tests can drive a fake sidecar over an in-memory pipe.
    fn attach<W, R>(writer: W, reader: R) -> Arc<Self>
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let process = Arc::new(Self {
            child: Mutex::new(None),
            stdin: Mutex::new(Box::new(writer) as Box<dyn AsyncWrite + Send + Unpin>),
            next_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            token_sink: Mutex::new(None),
        });

        tokio::spawn(Self::read_loop(process.clone(), BufReader::new(reader)));
        process
    }

    /// Routes every inbound frame: responses to their waiting caller,
    /// token notifications to the active generation. Routing never awaits
    /// channel capacity, so a response frame behind a burst of token
    /// notifications is always read promptly.
    async fn read_loop<R>(process: Arc<SidecarProcess>, mut stdout: BufReader<R>)
    where
        R: AsyncRead + Send + Unpin,
    {
        let mut line = String::new();
        loop {
            line.clear();
            match stdout.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }

            let frame: JsonRpcFrame = match serde_json::from_str(&line) {
                Ok(frame) => frame,
                Err(e) => {
                    log::warn!("Discarding malformed sidecar frame: {}", e);
                    continue;
                }
            };

            if let Some(id) = frame.id {
                let outcome = match frame.error {
                    Some(err) => Err(err.message),
                    None => Ok(frame.result.unwrap_or(serde_json::Value::Null)),
                };
                if let Some(tx) = process.pending.lock().await.remove(&id) {
                    let _ = tx.send(outcome);
                }
                continue;
            }

            if frame.method.as_deref() == Some("tokens") {
                let params = frame.params.unwrap_or(serde_json::Value::Null);
                let note: TokensNotification = match serde_json::from_value(params) {
                    Ok(note) => note,
                    Err(e) => {
                        log::warn!("Bad tokens notification: {}", e);
                        continue;
                    }
                };

                let mut sink = process.token_sink.lock().await;
                if let Some(tx) = sink.as_ref() {
                    if !note.tokens.is_empty() && tx.send(Ok(note.tokens)).is_err() {
                        // Consumer went away; stop forwarding
                        *sink = None;
                        continue;
                    }
                }
                if note.done {
                    *sink = None;
                }
            }
        }

        // Process exited: fail everything still waiting
        log::warn!("Inference sidecar exited");
        for (_, tx) in process.pending.lock().await.drain() {
            let _ = tx.send(Err("Sidecar process exited".to_string()));
        }
        let mut sink = process.token_sink.lock().await;
        if let Some(tx) = sink.take() {
            let _ = tx.send(Err(EngineError::GenerationFailed(
                "Sidecar process exited mid-generation".to_string(),
            )));
        }
    }

    async fn write_frame(&self, request: &JsonRpcRequest) -> Result<(), String> {
        let json =
            serde_json::to_string(request).map_err(|e| format!("Failed to serialize: {}", e))?;
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(json.as_bytes())
            .await
            .map_err(|e| format!("Failed to write to sidecar: {}", e))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| format!("Failed to write newline: {}", e))?;
        stdin
            .flush()
            .await
            .map_err(|e| format!("Failed to flush: {}", e))
    }

    /// Send a request and await its response.
    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        let (id, rx) = self.register(method, params).await?;
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err("Sidecar dropped the request".to_string())
            }
        }
    }

    /// Send a request and hand back the response future without awaiting it.
    async fn register(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<(u64, oneshot::Receiver<Result<serde_json::Value, String>>), String> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = JsonRpcRequest::new(id, method, params);
        if let Err(e) = self.write_frame(&request).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }
        Ok((id, rx))
    }

    async fn kill(&self) {
        if let Some(child) = self.child.lock().await.as_mut() {
            let _ = child.start_kill();
        }
    }
}

/// [`InferenceRuntime`] backed by an external inference process.
pub struct SidecarRuntime {
    config: SidecarConfig,
    process: Arc<RwLock<Option<Arc<SidecarProcess>>>>,
}

impl SidecarRuntime {
    pub fn new(config: SidecarConfig) -> Self {
        Self {
            config,
            process: Arc::new(RwLock::new(None)),
        }
    }

    pub fn with_default_config() -> Self {
        Self::new(SidecarConfig::default())
    }

    /// Find the sidecar binary next to the executable or in target dirs.
    fn find_sidecar_path(&self) -> Result<PathBuf, EngineError> {
        if let Some(ref path) = self.config.sidecar_path {
            if path.exists() {
                return Ok(path.clone());
            }
        }

        let sidecar_name = if cfg!(windows) {
            "llm-sidecar.exe"
        } else {
            "llm-sidecar"
        };

        if let Ok(exe_path) = std::env::current_exe() {
            let exe_dir = exe_path.parent().unwrap_or(std::path::Path::new("."));

            let path = exe_dir.join(sidecar_name);
            if path.exists() {
                log::debug!("Found sidecar in exe dir: {}", path.display());
                return Ok(path);
            }

            let mut current = exe_dir;
            for _ in 0..3 {
                if let Some(parent) = current.parent() {
                    for profile in &["debug", "release"] {
                        let path = parent.join("target").join(profile).join(sidecar_name);
                        if path.exists() {
                            log::debug!("Found sidecar at: {}", path.display());
                            return Ok(path);
                        }
                    }
                    current = parent;
                }
            }
        }

        Err(EngineError::RuntimeUnavailable(
            "Inference sidecar binary not found".to_string(),
        ))
    }

    async fn ensure_process(&self) -> Result<Arc<SidecarProcess>, EngineError> {
        {
            let guard = self.process.read().await;
            if let Some(process) = guard.as_ref() {
                return Ok(process.clone());
            }
        }

        let path = self.find_sidecar_path()?;
        let process = SidecarProcess::spawn(&path).await?;
        *self.process.write().await = Some(process.clone());
        Ok(process)
    }

    /// Kill and forget the sidecar process; it respawns on the next load.
    pub async fn restart(&self) {
        if let Some(process) = self.process.write().await.take() {
            process.kill().await;
        }
    }
}

#[async_trait]
impl InferenceRuntime for SidecarRuntime {
    async fn load(
        &self,
        model: &ModelDescriptor,
        on_progress: ProgressFn,
    ) -> Result<Arc<dyn ModelHandle>, EngineError> {
        let weights_path = if downloader::is_downloaded(&self.config.models_dir, &model.id) {
            on_progress(LoadProgress {
                fraction: DOWNLOAD_PROGRESS_SHARE,
                stage: LoadStage::Fetching,
            });
            downloader::model_path(&self.config.models_dir, &model.id)
        } else {
            downloader::download_model(&self.config.models_dir, model, |fraction| {
                on_progress(LoadProgress {
                    fraction: fraction * DOWNLOAD_PROGRESS_SHARE,
                    stage: LoadStage::Fetching,
                });
            })
            .await?
        };

        on_progress(LoadProgress {
            fraction: DOWNLOAD_PROGRESS_SHARE,
            stage: LoadStage::Compiling,
        });

        let process = self.ensure_process().await?;
        process
            .call(
                "load_model",
                serde_json::json!({
                    "model_id": model.id,
                    "model_path": weights_path,
                    "context_length": model.context_length,
                }),
            )
            .await
            .map_err(EngineError::LoadFailed)?;

        on_progress(LoadProgress {
            fraction: 1.0,
            stage: LoadStage::Ready,
        });

        Ok(Arc::new(SidecarHandle {
            model_id: model.id.clone(),
            process,
        }))
    }
}

struct SidecarHandle {
    model_id: String,
    process: Arc<SidecarProcess>,
}

#[async_trait]
impl ModelHandle for SidecarHandle {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn start(
        &self,
        messages: &[ChatMessage],
        params: &SampleParams,
        cancel: CancellationToken,
    ) -> Result<TokenReceiver, EngineError> {
        let (tx, rx) = mpsc::channel(TOKEN_CHANNEL_CAPACITY);
        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
        *self.process.token_sink.lock().await = Some(sink_tx.clone());

        let (_, response) = self
            .process
            .register(
                "generate",
                serde_json::json!({
                    "messages": messages,
                    "temperature": params.temperature,
                    "seed": params.seed,
                }),
            )
            .await
            .map_err(EngineError::GenerationFailed)?;

        // Cancelled once this generation is over, whichever way it ends
        let done = CancellationToken::new();

        // Forward relayed batches into the engine's bounded channel;
        // backpressure lands here, never on the frame reader
        let done_guard = done.clone().drop_guard();
        tokio::spawn(async move {
            let _done_guard = done_guard;
            while let Some(item) = sink_rx.recv().await {
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });

        // Surface a failed generate response through the token queue
        let fail_tx = sink_tx;
        tokio::spawn(async move {
            if let Ok(Err(msg)) = response.await {
                let _ = fail_tx.send(Err(EngineError::GenerationFailed(msg)));
            }
        });

        // Forward cancellation as a stop request; the sidecar finishes the
        // current batch and sends a final done notification. Exits with the
        // generation, so completed sessions leave no task behind.
        let process = self.process.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = done.cancelled() => {}
                _ = cancel.cancelled() => {
                    if let Err(e) = process.call("stop", serde_json::json!({})).await {
                        log::debug!("Sidecar stop request failed: {}", e);
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn decode(&self, tokens: &[Token]) -> Result<String, EngineError> {
        let result = self
            .process
            .call("decode", serde_json::json!({ "tokens": tokens }))
            .await
            .map_err(EngineError::GenerationFailed)?;

        result
            .get("text")
            .and_then(|t| t.as_str())
            .map(|t| t.to_string())
            .ok_or_else(|| {
                EngineError::GenerationFailed("Decode response missing text".to_string())
            })
    }
}
