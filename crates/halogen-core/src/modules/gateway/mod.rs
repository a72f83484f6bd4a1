//! Socket gateway: extends the bus to remote clients over line-delimited JSON.
//!
//! Two long-lived tasks serve every client: a reader that accepts connections
//! and multiplexes all client streams, and a writer that drains one outbound
//! queue and routes each event to the connection owning its chain's context.

pub mod clients;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::DateTime;
use futures_util::stream::{self, AbortHandle, Abortable, BoxStream, SelectAll, StreamExt};
use halogen_protocol::{
    Chain, DEFAULT_HOST, DEFAULT_PORT, Event, EventBody, EventKind, Outcome, PROCESS_CONTEXT,
    ProtocolError, wire,
};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

pub use clients::{ClientConnection, ClientInfo, ClientTable};

use crate::config::ModuleConfig;
use crate::event_bus::Emitter;
use crate::module::{Module, ModuleContext, Operations};

pub const NAME: &str = "server";

/// How long `end` waits for the reader and writer to stop.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(8);

/// Longest accepted record; longer lines are dropped as protocol errors.
const MAX_LINE_LENGTH: usize = 1024 * 1024;

enum ClientFrame {
    Line(String),
    Oversized,
    Failed(String),
    Closed,
}

/// Identifies one accepted socket: the context it owns plus its connection id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Link {
    context: u64,
    id: u64,
}

type ClientStream = BoxStream<'static, (Link, ClientFrame)>;

pub struct GatewayServer {
    emitter: Emitter,
    config: ModuleConfig,
    host: String,
    port: u16,
    clients: Arc<ClientTable>,
    bound: Arc<Mutex<Option<SocketAddr>>>,
    outbound: Option<mpsc::UnboundedSender<Event>>,
    shutdown: Option<watch::Sender<bool>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl GatewayServer {
    pub fn new(context: ModuleContext) -> Self {
        let host = context.config.get("host", DEFAULT_HOST.to_string());
        let port = context.config.get("port", DEFAULT_PORT);
        Self {
            emitter: context.emitter,
            config: context.config,
            host,
            port,
            clients: Arc::new(ClientTable::new()),
            bound: Arc::new(Mutex::new(None)),
            outbound: None,
            shutdown: None,
            reader: None,
            writer: None,
        }
    }

    /// Address actually bound, available once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn clients(&self) -> &Arc<ClientTable> {
        &self.clients
    }
}

#[async_trait]
impl Module for GatewayServer {
    fn name(&self) -> &str {
        NAME
    }

    fn info(&self) -> String {
        format!("Socket gateway for remote clients on {}:{}", self.host, self.port)
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        let listener = TcpListener::bind((self.host.as_str(), self.port))
            .await
            .with_context(|| format!("could not listen on {}:{}", self.host, self.port))?;
        let addr = listener.local_addr()?;
        *self.bound.lock().unwrap_or_else(PoisonError::into_inner) = Some(addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        self.reader = Some(tokio::spawn(read_loop(
            listener,
            self.emitter.clone(),
            self.clients.clone(),
            shutdown_rx,
        )));
        self.writer = Some(tokio::spawn(write_loop(
            outbound_rx,
            self.emitter.clone(),
            self.clients.clone(),
        )));
        self.outbound = Some(outbound_tx);
        self.shutdown = Some(shutdown_tx);

        tracing::info!(addr = %addr, section = self.config.name(), "gateway listening");
        let chain = self.emitter.chain(None);
        self.emitter
            .info(chain, format!("Server listening on {addr}"));
        Ok(())
    }

    async fn end(&mut self) -> (bool, String) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        // the writer finishes what is already queued, then sees the channel close
        self.outbound = None;

        let handles: Vec<JoinHandle<()>> = self
            .reader
            .take()
            .into_iter()
            .chain(self.writer.take())
            .collect();
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let joined = tokio::time::timeout(JOIN_TIMEOUT, join_all(handles)).await;

        for connection in self.clients.drain() {
            connection.stop_reading();
            let _ = connection.writer.lock().await.shutdown().await;
            self.emitter.chains().release(connection.context);
        }

        match joined {
            Ok(failures) if failures.is_empty() => (
                true,
                "Closed the read and write threads and every client connection.".to_string(),
            ),
            Ok(failures) => (
                false,
                format!("Read or write thread did not stop cleanly: {}", failures.join("; ")),
            ),
            Err(_) => {
                for abort in aborts {
                    abort.abort();
                }
                (false, "Could not close the read and write threads. Timed out.".to_string())
            }
        }
    }

    fn handled_events(&self) -> Vec<EventKind> {
        vec![
            EventKind::ClientActivation,
            EventKind::CommandExecuted,
            EventKind::TaskCompletion,
            EventKind::Response,
            EventKind::Error,
        ]
    }

    async fn handle(&mut self, event: &Event) -> anyhow::Result<()> {
        if event.chain.context == PROCESS_CONTEXT {
            return Ok(());
        }
        if let Some(outbound) = &self.outbound {
            outbound
                .send(event.clone())
                .context("gateway writer has stopped")?;
        }
        Ok(())
    }

    fn operations(&self) -> Operations {
        let bound = self.bound.clone();
        let configured = format!("{}:{}", self.host, self.port);
        let clients = self.clients.clone();
        Operations::new()
            .command("address", "Address the server listens on", move |_, _| {
                let address = *bound.lock().unwrap_or_else(PoisonError::into_inner);
                Outcome::ok(address.map_or_else(|| configured.clone(), |a| a.to_string()))
            })
            .command("clients", "List connected clients", move |_, _| {
                let list = clients.list();
                if list.is_empty() {
                    return Outcome::ok("No clients connected.");
                }
                let lines: Vec<String> = list
                    .iter()
                    .map(|c| {
                        let since = DateTime::from_timestamp(c.connected_at, 0)
                            .map_or_else(|| "unknown".to_string(), |t| t.format("%H:%M:%S").to_string());
                        format!("Client : {} from {} since {since}", Chain::new(c.context, 0), c.peer)
                    })
                    .collect();
                Outcome::ok(lines.join("\n"))
            })
    }
}

/// Await every task, collecting the failures of those that panicked or were aborted.
async fn join_all(handles: Vec<JoinHandle<()>>) -> Vec<String> {
    let mut failures = Vec::new();
    for handle in handles {
        if let Err(err) = handle.await {
            failures.push(err.to_string());
        }
    }
    failures
}

// ============================================================================
// Reader
// ============================================================================

async fn read_loop(
    listener: TcpListener,
    emitter: Emitter,
    clients: Arc<ClientTable>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut streams: SelectAll<ClientStream> = SelectAll::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => streams.push(greet(socket, peer, &emitter, &clients)),
                Err(err) => tracing::warn!(error = %err, "failed to accept connection"),
            },
            Some((link, frame)) = streams.next(), if !streams.is_empty() => {
                match frame {
                    ClientFrame::Line(line) => receive_line(link, &line, &emitter, &clients),
                    ClientFrame::Oversized => {
                        let reason = format!("record longer than {MAX_LINE_LENGTH} bytes");
                        protocol_error(link.context, &emitter, reason);
                    }
                    ClientFrame::Failed(reason) => disconnect(link, &reason, &emitter, &clients).await,
                    ClientFrame::Closed => disconnect(link, "connection closed", &emitter, &clients).await,
                }
            }
        }
    }
    tracing::debug!("gateway reader stopped");
}

/// Register a new connection and turn its read half into a tagged frame stream.
fn greet(socket: TcpStream, peer: SocketAddr, emitter: &Emitter, clients: &ClientTable) -> ClientStream {
    let chain = emitter.chains().new_context();
    let context = chain.context;
    let (read, write) = socket.into_split();
    let (reading, registration) = AbortHandle::new_pair();
    let id = clients.register(context, peer, write, reading);
    let link = Link { context, id };

    emitter.info(chain, format!("Client {peer} connected with Chain ID: {chain}"));
    emitter.send(
        chain,
        EventBody::ClientActivation {
            message: format!("Client successfully registered to the server with Chain ID: {chain}"),
        },
    );

    let frames = FramedRead::new(read, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    Abortable::new(frames, registration)
        .map(move |item| {
            let frame = match item {
                Ok(line) => ClientFrame::Line(line),
                Err(LinesCodecError::MaxLineLengthExceeded) => ClientFrame::Oversized,
                Err(LinesCodecError::Io(err)) => ClientFrame::Failed(err.to_string()),
            };
            (link, frame)
        })
        .chain(stream::once(async move { (link, ClientFrame::Closed) }))
        .boxed()
}

fn receive_line(link: Link, line: &str, emitter: &Emitter, clients: &ClientTable) {
    // the writer may have dropped this connection already
    if !clients.is_current(link.context, link.id) || line.trim().is_empty() {
        return;
    }
    let context = link.context;
    let decoded = wire::decode(line).and_then(|event| {
        if event.chain.context == context {
            Ok(event)
        } else {
            Err(ProtocolError::ContextMismatch {
                expected: context,
                found: event.chain.context,
            })
        }
    });
    match decoded {
        Ok(event) => emitter.emit(event),
        Err(err) => protocol_error(context, emitter, err.to_string()),
    }
}

fn protocol_error(context: u64, emitter: &Emitter, reason: String) {
    tracing::warn!(context, error = %reason, "dropped record from client");
    let chain = emitter.chain(None);
    emitter.warning(
        chain,
        format!("Protocol error from client {}: {reason}. Record dropped", Chain::new(context, 0)),
    );
}

/// Drop a connection: stop reading it, close its write half and release its context.
async fn disconnect(link: Link, reason: &str, emitter: &Emitter, clients: &ClientTable) {
    let context = link.context;
    let Some(connection) = clients.unregister(context, link.id) else {
        return;
    };
    connection.stop_reading();
    let _ = connection.writer.lock().await.shutdown().await;
    emitter.chains().release(context);

    let chain = emitter.chain(None);
    emitter.info(
        chain,
        format!("Client {} ({}) disconnected: {reason}", Chain::new(context, 0), connection.peer),
    );
}

// ============================================================================
// Writer
// ============================================================================

async fn write_loop(
    mut outbound: mpsc::UnboundedReceiver<Event>,
    emitter: Emitter,
    clients: Arc<ClientTable>,
) {
    while let Some(event) = outbound.recv().await {
        let context = event.chain.context;
        let Some((id, writer)) = clients.writer_for(context) else {
            tracing::debug!(context, kind = %event.kind(), "no client owns this chain, dropping event");
            continue;
        };
        let line = match wire::encode(&event) {
            Ok(line) => line,
            Err(err) => {
                protocol_error(context, &emitter, err.to_string());
                continue;
            }
        };

        let written = writer.lock().await.write_all(line.as_bytes()).await;
        if let Err(err) = written {
            let chain = emitter.chain(None);
            emitter.warning(
                chain,
                format!("Could not send output event to client. Encountered Error= {err}"),
            );
            disconnect(Link { context, id }, "write failure", &emitter, &clients).await;
        }
    }
    tracing::debug!("gateway writer stopped");
}
