//! Connection handler
//!
//! Runs one connection from accept to close: reads frames, drives the
//! Unauthenticated → Authenticated → Closed state machine, and owns the
//! writer task that drains the connection's outbound mailbox.
//!
//! Error policy:
//! - an empty, malformed or unknown command is answered with an error line
//!   and the connection stays open
//! - an empty or taken alias on `CONNECT` is answered, then the connection closes
//! - framing and transport errors, idle timeouts and disconnect requests close
//!   the connection without retry

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::broadcast::Broadcaster;
use crate::client::{Client, Outbound};
use crate::config::ServerConfig;
use crate::error::{AppError, RegisterError};
use crate::message::{Command, WireFormat};
use crate::registry::ClientRegistry;
use crate::types::{Alias, ConnectionId};

/// Per-connection state, owned by the handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Only `CONNECT` is accepted
    Unauthenticated,
    /// Registered under an alias; `MESSAGE` is accepted
    Authenticated(Alias),
    /// Terminal
    Closed,
}

/// What the read loop does after a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Handle an accepted connection until it closes
///
/// Returns once the alias (if any) has been unregistered and the outbound
/// side has been flushed and shut down.
pub async fn handle_connection<S>(
    stream: S,
    registry: ClientRegistry,
    config: Arc<ServerConfig>,
) -> Result<(), AppError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let id = ConnectionId::new();
    serve(stream, id, registry, config)
        .instrument(info_span!("connection", %id))
        .await
}

async fn serve<S>(
    stream: S,
    id: ConnectionId,
    registry: ClientRegistry,
    config: Arc<ServerConfig>,
) -> Result<(), AppError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut frames =
        FramedRead::new(reader, LinesCodec::new_with_max_length(config.max_frame_length));

    // Server -> client mailbox, shared with the registry once authenticated
    let (outbound_tx, outbound_rx) = mpsc::channel::<Outbound>(config.outbound_capacity);
    let closer = CancellationToken::new();

    let write_task = tokio::spawn(
        write_outbound(writer, outbound_rx, closer.clone(), config.write_timeout).in_current_span(),
    );

    let mut conn = Connection {
        id,
        state: ConnectionState::Unauthenticated,
        broadcaster: Broadcaster::new(registry.clone(), config.wire_format),
        registry,
        format: config.wire_format,
        outbound: outbound_tx,
        closer,
    };

    debug!("connection opened");
    let result = conn.run(&mut frames, config.idle_timeout).await;
    let cleanup = conn.close().await;

    if write_task.await.is_err() {
        warn!("write task panicked");
    }
    info!("connection closed");

    result.and(cleanup)
}

/// Read side of one connection
struct Connection {
    id: ConnectionId,
    state: ConnectionState,
    registry: ClientRegistry,
    broadcaster: Broadcaster,
    format: WireFormat,
    outbound: mpsc::Sender<Outbound>,
    closer: CancellationToken,
}

impl Connection {
    /// Process frames until the state machine or the transport ends the connection
    async fn run<R>(
        &mut self,
        frames: &mut FramedRead<R, LinesCodec>,
        idle_timeout: Option<Duration>,
    ) -> Result<(), AppError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let next = tokio::select! {
                _ = self.closer.cancelled() => {
                    info!("disconnect requested");
                    return Ok(());
                }
                next = next_frame(frames, idle_timeout) => next,
            };

            let flow = match next {
                Some(Ok(frame)) => self.process_frame(&frame).await?,
                Some(Err(FrameError::Idle)) => {
                    info!("idle timeout");
                    self.reject(AppError::IdleTimeout).await?
                }
                Some(Err(FrameError::Codec(e))) => return Err(e.into()),
                None => {
                    debug!("peer closed the stream");
                    return Ok(());
                }
            };

            if flow == Flow::Close {
                return Ok(());
            }
        }
    }

    /// Decode one frame and apply it to the current state
    async fn process_frame(&mut self, frame: &str) -> Result<Flow, AppError> {
        let command = match self.format.decode(frame) {
            Ok(command) => command,
            Err(e) => return self.reject(e.into()).await,
        };

        let alias = match &self.state {
            ConnectionState::Closed => return Ok(Flow::Close),
            ConnectionState::Unauthenticated => None,
            ConnectionState::Authenticated(alias) => Some(alias.clone()),
        };

        match (alias, command) {
            (None, Command::Connect { alias }) => self.connect(alias).await,
            (None, _) => self.reject(AppError::AliasNotSet).await,
            (Some(alias), Command::Message { content }) => {
                let report = self.broadcaster.broadcast(alias.as_str(), &content).await?;
                debug!(
                    "message from '{}' reached {} clients, {} failed",
                    alias,
                    report.delivered,
                    report.failed.len()
                );
                Ok(Flow::Continue)
            }
            // The alias is fixed once registered, so a second CONNECT is unknown too
            (Some(_), other) => {
                self.reject(AppError::UnknownCommand(other.verb().to_string()))
                    .await
            }
        }
    }

    /// Try to register `requested` for this connection
    async fn connect(&mut self, requested: String) -> Result<Flow, AppError> {
        let alias = match Alias::parse(requested) {
            Ok(alias) => alias,
            Err(e) => return self.reject(e).await,
        };

        let client = Client::new(
            alias.clone(),
            self.id,
            self.outbound.clone(),
            self.closer.clone(),
        );

        match self.registry.try_register(client).await {
            Ok(_) => {
                info!("client '{}' connected", alias);
                self.state = ConnectionState::Authenticated(alias);
                Ok(Flow::Continue)
            }
            Err(RegisterError::AliasTaken(alias)) => {
                info!("alias '{}' already taken", alias);
                self.reject(AppError::AliasTaken(alias)).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Report `err` to the peer; fatal errors close the connection
    async fn reject(&self, err: AppError) -> Result<Flow, AppError> {
        debug!("rejecting: {}", err);
        let line = self.format.encode_error(&err.to_string());
        self.outbound
            .send(Outbound::Line(line))
            .await
            .map_err(|_| AppError::ChannelSend)?;

        if err.is_fatal() {
            Ok(Flow::Close)
        } else {
            Ok(Flow::Continue)
        }
    }

    /// Enter `Closed`: unregister first, then let the writer flush and shut down
    async fn close(&mut self) -> Result<(), AppError> {
        let previous = std::mem::replace(&mut self.state, ConnectionState::Closed);

        let result = match previous {
            ConnectionState::Authenticated(alias) => {
                info!("client '{}' disconnected", alias);
                self.registry
                    .unregister(alias.as_str())
                    .await
                    .map(|_| ())
                    .map_err(AppError::from)
            }
            _ => Ok(()),
        };

        tokio::select! {
            _ = self.outbound.send(Outbound::Close) => {}
            _ = self.closer.cancelled() => {}
        }

        result
    }
}

enum FrameError {
    Idle,
    Codec(LinesCodecError),
}

/// Next frame from the peer, bounded by the idle timeout
async fn next_frame<R>(
    frames: &mut FramedRead<R, LinesCodec>,
    idle_timeout: Option<Duration>,
) -> Option<Result<String, FrameError>>
where
    R: AsyncRead + Unpin,
{
    let next = match idle_timeout {
        Some(limit) => match timeout(limit, frames.next()).await {
            Ok(next) => next,
            Err(_) => return Some(Err(FrameError::Idle)),
        },
        None => frames.next().await,
    };
    next.map(|frame| frame.map_err(FrameError::Codec))
}

/// Drain the outbound mailbox onto the transport
///
/// Stops on `Outbound::Close`, on cancellation, or on the first failed or
/// timed-out write. Always cancels `closer` on exit so the read side and
/// any broadcaster see the connection as gone.
async fn write_outbound<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Outbound>,
    closer: CancellationToken,
    write_timeout: Duration,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let item = tokio::select! {
            biased;
            _ = closer.cancelled() => break,
            item = outbound.recv() => item,
        };

        let line = match item {
            Some(Outbound::Line(line)) => line,
            Some(Outbound::Close) | None => break,
        };

        match timeout(write_timeout, write_line(&mut writer, &line)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("write failed: {}", e);
                break;
            }
            Err(_) => {
                warn!("write timed out after {:?}", write_timeout);
                break;
            }
        }
    }

    closer.cancel();
    outbound.close();
    let _ = timeout(write_timeout, writer.shutdown()).await;
    debug!("write task ended");
}

async fn write_line<W>(writer: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use tokio::io::{split, AsyncBufReadExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
    use tokio::task::JoinHandle;

    use super::*;

    const RECV_TIMEOUT: Duration = Duration::from_secs(2);

    fn test_config() -> Arc<ServerConfig> {
        Arc::new(ServerConfig {
            idle_timeout: None,
            ..ServerConfig::default()
        })
    }

    struct Peer {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Peer {
        async fn send(&mut self, line: &str) {
            self.writer
                .write_all(format!("{line}\n").as_bytes())
                .await
                .unwrap();
        }

        async fn recv(&mut self) -> Option<String> {
            timeout(RECV_TIMEOUT, self.lines.next_line())
                .await
                .expect("timed out waiting for a line")
                .unwrap()
        }
    }

    fn open(
        registry: &ClientRegistry,
        config: Arc<ServerConfig>,
    ) -> (Peer, JoinHandle<Result<(), AppError>>) {
        open_with_buffer(registry, config, 4096)
    }

    fn open_with_buffer(
        registry: &ClientRegistry,
        config: Arc<ServerConfig>,
        buffer: usize,
    ) -> (Peer, JoinHandle<Result<(), AppError>>) {
        let (client, server) = tokio::io::duplex(buffer);
        let task = tokio::spawn(handle_connection(server, registry.clone(), config));
        let (reader, writer) = split(client);
        let peer = Peer {
            lines: BufReader::new(reader).lines(),
            writer,
        };
        (peer, task)
    }

    async fn wait_registered(registry: &ClientRegistry, alias: &str, expected: bool) {
        timeout(RECV_TIMEOUT, async {
            while registry.is_registered(alias).await.unwrap() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("registry never reached the expected state");
    }

    async fn join(
        registry: &ClientRegistry,
        alias: &str,
    ) -> (Peer, JoinHandle<Result<(), AppError>>) {
        let (mut peer, task) = open(registry, test_config());
        peer.send(&format!("CONNECT {alias}")).await;
        wait_registered(registry, alias, true).await;
        (peer, task)
    }

    #[tokio::test]
    async fn test_empty_alias_closes_without_registering() {
        let registry = ClientRegistry::spawn();
        let (mut peer, task) = open(&registry, test_config());

        peer.send("CONNECT").await;

        assert_eq!(peer.recv().await.as_deref(), Some("alias cannot be empty"));
        assert_eq!(peer.recv().await, None);
        task.await.unwrap().unwrap();
        assert_eq!(registry.member_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_message_before_connect_is_not_broadcast() {
        let registry = ClientRegistry::spawn();
        let (mut watcher, _watcher_task) = join(&registry, "watcher").await;
        let (mut peer, _task) = open(&registry, test_config());

        peer.send("MESSAGE sneaky").await;
        assert_eq!(
            peer.recv().await.as_deref(),
            Some("alias not set; send CONNECT <alias> first")
        );
        assert_eq!(registry.member_count().await.unwrap(), 1);

        // Still open and allowed to register afterwards
        peer.send("CONNECT amy").await;
        wait_registered(&registry, "amy", true).await;
        peer.send("MESSAGE hello").await;

        assert_eq!(peer.recv().await.as_deref(), Some("amy: hello"));
        assert_eq!(watcher.recv().await.as_deref(), Some("amy: hello"));
    }

    #[tokio::test]
    async fn test_sender_receives_own_message() {
        let registry = ClientRegistry::spawn();
        let (mut alice, _task) = join(&registry, "alice").await;

        alice.send("message  hi   all").await;

        assert_eq!(alice.recv().await.as_deref(), Some("alice: hi all"));
    }

    #[tokio::test]
    async fn test_disconnect_unregisters_alias() {
        let registry = ClientRegistry::spawn();
        let (peer, task) = join(&registry, "bob").await;

        drop(peer);
        task.await.unwrap().unwrap();

        assert!(!registry.is_registered("bob").await.unwrap());
        let (_again, _task) = join(&registry, "bob").await;
    }

    #[tokio::test]
    async fn test_duplicate_alias_rejects_new_connection_only() {
        let registry = ClientRegistry::spawn();
        let (mut first, _first_task) = join(&registry, "bob").await;
        let (mut second, second_task) = open(&registry, test_config());

        second.send("CONNECT bob").await;
        assert_eq!(
            second.recv().await.as_deref(),
            Some("alias 'bob' is already taken")
        );
        assert_eq!(second.recv().await, None);
        second_task.await.unwrap().unwrap();

        assert!(registry.is_registered("bob").await.unwrap());
        first.send("MESSAGE still here").await;
        assert_eq!(first.recv().await.as_deref(), Some("bob: still here"));
    }

    #[tokio::test]
    async fn test_second_connect_is_rejected() {
        let registry = ClientRegistry::spawn();
        let (mut alice, _task) = join(&registry, "alice").await;

        alice.send("CONNECT alicia").await;

        assert_eq!(
            alice.recv().await.as_deref(),
            Some("unknown command 'CONNECT'")
        );
        assert!(registry.is_registered("alice").await.unwrap());
        assert!(!registry.is_registered("alicia").await.unwrap());
    }

    #[tokio::test]
    async fn test_protocol_errors_keep_connection_open() {
        let registry = ClientRegistry::spawn();
        let (mut alice, _task) = join(&registry, "alice").await;

        alice.send("   ").await;
        assert_eq!(alice.recv().await.as_deref(), Some("empty command"));

        alice.send("DANCE now").await;
        assert_eq!(alice.recv().await.as_deref(), Some("unknown command 'DANCE'"));

        alice.send("MESSAGE ok").await;
        assert_eq!(alice.recv().await.as_deref(), Some("alice: ok"));
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_and_cleans_up() {
        let registry = ClientRegistry::spawn();
        let config = Arc::new(ServerConfig {
            idle_timeout: Some(Duration::from_millis(300)),
            ..ServerConfig::default()
        });
        let (mut peer, task) = open(&registry, config);
        peer.send("CONNECT sleepy").await;
        wait_registered(&registry, "sleepy", true).await;

        assert_eq!(
            peer.recv().await.as_deref(),
            Some("idle timeout; closing connection")
        );
        assert_eq!(peer.recv().await, None);
        task.await.unwrap().unwrap();
        assert!(!registry.is_registered("sleepy").await.unwrap());
    }

    #[tokio::test]
    async fn test_disconnect_request_closes_and_cleans_up() {
        let registry = ClientRegistry::spawn();
        let (mut peer, task) = join(&registry, "slow").await;

        let members = registry.snapshot_members().await.unwrap();
        members[0].disconnect();

        assert_eq!(peer.recv().await, None);
        task.await.unwrap().unwrap();
        assert!(!registry.is_registered("slow").await.unwrap());
    }

    #[tokio::test]
    async fn test_write_timeout_closes_stalled_reader() {
        let registry = ClientRegistry::spawn();
        let (mut talker, _talker_task) = join(&registry, "talker").await;

        // Tiny transport buffer and a peer that never reads
        let config = Arc::new(ServerConfig {
            idle_timeout: None,
            write_timeout: Duration::from_millis(200),
            ..ServerConfig::default()
        });
        let (mut stuck, stuck_task) = open_with_buffer(&registry, config, 64);
        stuck.send("CONNECT stuck").await;
        wait_registered(&registry, "stuck", true).await;

        for i in 0..50 {
            talker.send(&format!("MESSAGE filler line {i}")).await;
        }
        for i in 0..50 {
            assert_eq!(
                talker.recv().await,
                Some(format!("talker: filler line {i}"))
            );
        }

        wait_registered(&registry, "stuck", false).await;
        timeout(RECV_TIMEOUT, stuck_task)
            .await
            .expect("stalled handler never finished")
            .unwrap()
            .unwrap();
        assert!(registry.is_registered("talker").await.unwrap());
    }

    #[tokio::test]
    async fn test_json_format_session() {
        let registry = ClientRegistry::spawn();
        let config = Arc::new(ServerConfig {
            idle_timeout: None,
            wire_format: WireFormat::Json,
            ..ServerConfig::default()
        });
        let (mut peer, _task) = open(&registry, config);

        peer.send(r#"{"commandType":1,"from":"jay","content":"early"}"#).await;
        let reply: serde_json::Value =
            serde_json::from_str(&peer.recv().await.unwrap()).unwrap();
        assert_eq!(reply["error"], "alias not set; send CONNECT <alias> first");

        peer.send(r#"{"commandType":0,"from":"jay","content":""}"#).await;
        wait_registered(&registry, "jay", true).await;
        peer.send(r#"{"commandType":1,"from":"jay","content":"hi"}"#).await;

        let line: serde_json::Value =
            serde_json::from_str(&peer.recv().await.unwrap()).unwrap();
        assert_eq!(line["from"], "jay");
        assert_eq!(line["content"], "hi");
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_connection() {
        let registry = ClientRegistry::spawn();
        let config = Arc::new(ServerConfig {
            idle_timeout: None,
            max_frame_length: 16,
            ..ServerConfig::default()
        });
        let (mut peer, task) = open(&registry, config);
        peer.send("CONNECT zed").await;
        wait_registered(&registry, "zed", true).await;

        peer.send(&format!("MESSAGE {}", "x".repeat(64))).await;

        assert_eq!(peer.recv().await, None);
        assert!(matches!(task.await.unwrap(), Err(AppError::Frame(_))));
        assert!(!registry.is_registered("zed").await.unwrap());
    }
}
