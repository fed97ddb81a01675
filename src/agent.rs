//! Agent assembly and the inbound command boundary
//!
//! One [`Agent`] owns the dispatcher and its shared state. Commands arrive
//! as length-prefixed frames on a local socket; each frame produces exactly
//! one reply frame, while launch outcomes travel separately on the
//! completion channel.

use crate::command::{CommandDispatcher, HandlerContext};
use crate::impersonate::unix::{process_is_privileged, UnixIdentityProvider};
use crate::impersonate::ImpersonationGate;
use crate::process::{EnvironmentTable, ExitedProcessRegistry, ProcessEngine, ProgramCompletion};
use anyhow::Context as _;
use bytes::Bytes;
use guestops_shared::codec::{self, FrameDecoder};
use guestops_shared::now_secs;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::RwLock;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

pub struct AgentConfig {
    pub socket_path: PathBuf,
    /// Whether the console-session-owner credential is honored while the
    /// agent runs privileged
    pub allow_console_user_ops: bool,
    /// Initial contents of the launch-environment override table
    pub base_env: Option<Vec<(String, String)>>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/guestops-agent.sock"),
            allow_console_user_ops: true,
            base_env: None,
        }
    }
}

/// Interval between background sweeps of the exited-process registry
const REAP_SWEEP_SECS: u64 = 60;

pub struct Agent {
    dispatcher: CommandDispatcher,
    registry: Arc<ExitedProcessRegistry>,
    request_seq: AtomicU64,
}

impl Agent {
    /// Build the agent and hand back the completion stream for the
    /// host-notification side to drain
    pub fn new(config: &AgentConfig) -> (Self, UnboundedReceiver<ProgramCompletion>) {
        let registry = Arc::new(ExitedProcessRegistry::new());
        let env = Arc::new(EnvironmentTable::new(config.base_env.clone()));
        let (completion_tx, completion_rx) = unbounded_channel();
        let engine = Arc::new(ProcessEngine::new(
            Arc::clone(&registry),
            Arc::clone(&env),
            completion_tx,
        ));
        let gate = Arc::new(ImpersonationGate::new(
            Arc::new(UnixIdentityProvider::new()),
            process_is_privileged(),
            config.allow_console_user_ops,
        ));

        let ctx = HandlerContext {
            gate,
            engine,
            registry: Arc::clone(&registry),
            env,
            guest_vars: Arc::new(RwLock::new(HashMap::new())),
            agent_pid: std::process::id() as u64,
        };
        let agent = Self {
            dispatcher: CommandDispatcher::new(ctx),
            registry,
            request_seq: AtomicU64::new(1),
        };
        (agent, completion_rx)
    }

    /// Dispatch one framed request envelope and frame the reply
    pub async fn handle_frame(&self, frame: &[u8]) -> anyhow::Result<Bytes> {
        let request_name = format!("req-{}", self.request_seq.fetch_add(1, Ordering::Relaxed));
        let reply = self.dispatcher.dispatch(frame, &request_name).await;
        codec::encode_reply(reply.status, reply.result.as_bytes()).context("encoding reply frame")
    }

    /// Accept loop. One task per connection; a misbehaving peer only takes
    /// its own connection down.
    pub async fn serve(self: Arc<Self>, listener: UnixListener) -> anyhow::Result<()> {
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            // keeps the registry bounded even when no list request arrives
            let mut ticker = interval(Duration::from_secs(REAP_SWEEP_SECS));
            loop {
                ticker.tick().await;
                registry.reap(now_secs()).await;
            }
        });

        info!("accepting commands");
        loop {
            let (stream, _addr) = listener.accept().await.context("accepting connection")?;
            let agent = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = agent.handle_connection(stream).await {
                    warn!(error = %e, "connection closed with error");
                }
            });
        }
    }

    async fn handle_connection(&self, mut stream: UnixStream) -> anyhow::Result<()> {
        let mut decoder = FrameDecoder::new();
        let mut read_buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut read_buf).await.context("socket read")?;
            if n == 0 {
                debug!("peer closed connection");
                return Ok(());
            }
            decoder.extend(&read_buf[..n]);
            while let Some(frame) = decoder.decode_next()? {
                let reply = self.handle_frame(&frame).await?;
                stream.write_all(&reply).await.context("socket write")?;
            }
        }
    }
}
