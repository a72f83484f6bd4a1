use std::collections::VecDeque;
use std::time::Duration;

use halogen_protocol::{
    Chain, ChainAllocator, ChainSource, Event, EventBody, EventKind, PROCESS_CONTEXT, ProtocolError, wire,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::{ClientError, Result};

/// How long to wait for the server's greeting after connecting.
pub const ACTIVATION_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `end` waits for the reader and writer to stop.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(8);

const LOCAL_SENDER: &str = "client";
const LOST_SERVER: &str = "Could not communicate with server. Perhaps it was shutdown?";

/// One connection to a halogen gateway.
///
/// A reader task turns incoming lines into events on an inbound queue and a
/// writer task drains an outbound queue onto the socket.
pub struct HalogenClient {
    addr: String,
    sender: String,
    chain: Option<Chain>,
    chains: ChainAllocator,
    /// Locally raised or re-queued events, served before `inbound`.
    pending: VecDeque<Event>,
    inbound: mpsc::UnboundedReceiver<Event>,
    outbound: Option<mpsc::UnboundedSender<Event>>,
    shutdown: Option<watch::Sender<bool>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl HalogenClient {
    /// Connect and wait for the server to assign this client its chain.
    pub async fn connect(addr: &str, sender: impl Into<String>) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ClientError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        let (read, write) = stream.into_split();

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let reader = tokio::spawn(read_loop(read, inbound_tx, shutdown_rx));
        let writer = tokio::spawn(write_loop(write, outbound_rx));

        let mut client = Self {
            addr: addr.to_string(),
            sender: sender.into(),
            chain: None,
            chains: ChainAllocator::default(),
            pending: VecDeque::new(),
            inbound: inbound_rx,
            outbound: Some(outbound_tx),
            shutdown: Some(shutdown_tx),
            reader: Some(reader),
            writer: Some(writer),
        };
        client.await_activation().await;
        Ok(client)
    }

    async fn await_activation(&mut self) {
        match timeout(ACTIVATION_TIMEOUT, self.inbound.recv()).await {
            Ok(Some(event)) if event.kind() == EventKind::ClientActivation => {
                tracing::info!(addr = %self.addr, chain = %event.chain, "activated by server");
                self.chains.adopt(event.chain);
                self.chain = Some(event.chain);
            }
            Ok(Some(foreign)) => {
                tracing::warn!(kind = %foreign.kind(), "first message from server was not a greeting");
                self.raise("No greeting sent by the server :(");
                self.pending.push_back(foreign);
            }
            Ok(None) | Err(_) => {
                tracing::warn!(addr = %self.addr, "no greeting from server");
                self.raise("No greeting sent by the server :(");
            }
        }
    }

    /// Surface a problem as a local `ErrorEvent`.
    fn raise(&mut self, message: &str) {
        self.pending.push_back(local_error(message));
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Chain assigned by the server, once activated.
    pub fn chain(&self) -> Option<Chain> {
        self.chain
    }

    pub fn is_activated(&self) -> bool {
        self.chain.is_some()
    }

    /// Next unrelated chain in this client's context.
    pub fn next_chain(&self) -> Result<Chain> {
        let chain = self.chain.ok_or(ClientError::NotConnected)?;
        Ok(self.chains.next_in(chain.context))
    }

    pub fn send_event(&self, event: Event) -> Result<()> {
        if event.is_local_only() {
            return Err(ProtocolError::LocalOnly(event.kind().to_string()).into());
        }
        let outbound = self.outbound.as_ref().ok_or(ClientError::NotConnected)?;
        outbound.send(event).map_err(|_| ClientError::Closed)
    }

    /// Send `body` on a fresh chain and return that chain.
    pub fn send_body(&self, body: EventBody) -> Result<Chain> {
        let chain = self.next_chain()?;
        self.send_event(Event::new(self.sender.clone(), chain, body))?;
        Ok(chain)
    }

    pub fn send_message(&self, message: impl Into<String>) -> Result<Chain> {
        self.send_body(EventBody::UserInput {
            message: message.into(),
        })
    }

    pub fn send_command(&self, module: &str, command: &str, args: Vec<String>) -> Result<Chain> {
        self.send_body(EventBody::command(module, command, args))
    }

    /// Wait for the next event. `None` once the connection is gone and drained.
    pub async fn receive_event(&mut self) -> Option<Event> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }
        self.inbound.recv().await
    }

    /// Next event if one arrives within `wait`; without a wait, only what is already queued.
    pub async fn check_event(&mut self, wait: Option<Duration>) -> Option<Event> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }
        match wait {
            None => self.inbound.try_recv().ok(),
            Some(wait) => timeout(wait, self.inbound.recv()).await.ok().flatten(),
        }
    }

    /// Stop both tasks and shut the socket down for writing.
    pub async fn end(&mut self) -> (bool, String) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        self.outbound = None;
        self.chain = None;

        let handles: Vec<JoinHandle<()>> = self
            .reader
            .take()
            .into_iter()
            .chain(self.writer.take())
            .collect();
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let joined = timeout(JOIN_TIMEOUT, join_all(handles)).await;

        match joined {
            Ok(failures) if failures.is_empty() => {
                (true, "Closed the connection to the server.".to_string())
            }
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
}

/// Await every handle, collecting the ones that panicked or were cancelled.
async fn join_all(handles: Vec<JoinHandle<()>>) -> Vec<String> {
    let mut failures = Vec::new();
    for handle in handles {
        if let Err(err) = handle.await {
            failures.push(err.to_string());
        }
    }
    failures
}

fn local_error(message: &str) -> Event {
    Event::new(
        LOCAL_SENDER,
        Chain::new(PROCESS_CONTEXT, 0),
        EventBody::error(message),
    )
}

async fn read_loop(
    read: OwnedReadHalf,
    inbound: mpsc::UnboundedSender<Event>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut lines = BufReader::new(read).lines();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match wire::decode(&line) {
                        Ok(event) => {
                            if inbound.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "dropped malformed record from server"),
                    }
                }
                Ok(None) => {
                    let _ = inbound.send(local_error(LOST_SERVER));
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "read from server failed");
                    let _ = inbound.send(local_error(LOST_SERVER));
                    break;
                }
            },
        }
    }
    tracing::debug!("client reader stopped");
}

async fn write_loop(mut write: OwnedWriteHalf, mut outbound: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = outbound.recv().await {
        let line = match wire::encode(&event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "could not encode event");
                continue;
            }
        };
        if let Err(e) = write.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "write to server failed");
            break;
        }
    }
    let _ = write.shutdown().await;
    tracing::debug!("client writer stopped");
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    async fn greeting_server(first: EventBody) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let greeting = Event::new("server", Chain::new(7, 0), first);
            write
                .write_all(wire::encode(&greeting).unwrap().as_bytes())
                .await
                .unwrap();

            let mut received = Vec::new();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                received.push(line);
            }
            received
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn test_activation_assigns_chain() {
        let (addr, server) = greeting_server(EventBody::ClientActivation {
            message: "hello".to_string(),
        })
        .await;
        let mut client = HalogenClient::connect(&addr, "tester").await.unwrap();
        assert_eq!(client.chain(), Some(Chain::new(7, 0)));

        let chain = client.send_command("core", "get", vec!["chain".to_string()]).unwrap();
        assert_eq!(chain, Chain::new(7, 1));
        assert_eq!(client.send_message("hi").unwrap(), Chain::new(7, 2));

        let (ok, _) = client.end().await;
        assert!(ok);

        let lines = server.await.unwrap();
        assert_eq!(lines.len(), 2);
        let first = wire::decode(&lines[0]).unwrap();
        assert_eq!(first.sender, "tester");
        assert_eq!(first.body, EventBody::command("core", "get", vec!["chain".to_string()]));
    }

    #[tokio::test]
    async fn test_foreign_first_message_raises_error() {
        let (addr, _server) = greeting_server(EventBody::Response {
            message: "surprise".to_string(),
        })
        .await;
        let mut client = HalogenClient::connect(&addr, "tester").await.unwrap();
        assert!(!client.is_activated());
        assert!(matches!(client.send_message("hi"), Err(ClientError::NotConnected)));

        let error = client.check_event(None).await.unwrap();
        assert_eq!(error.body, EventBody::error("No greeting sent by the server :("));
        let foreign = client.check_event(None).await.unwrap();
        assert_eq!(foreign.kind(), EventKind::Response);

        client.end().await;
    }

    #[tokio::test]
    async fn test_end_reports_failed_thread() {
        let (addr, _server) = greeting_server(EventBody::ClientActivation {
            message: "hello".to_string(),
        })
        .await;
        let mut client = HalogenClient::connect(&addr, "tester").await.unwrap();
        client.reader.as_ref().unwrap().abort();

        let (ok, message) = client.end().await;
        assert!(!ok);
        assert!(message.starts_with("Read or write thread did not stop cleanly"));
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        assert!(matches!(
            HalogenClient::connect(&addr, "tester").await,
            Err(ClientError::Connect { .. })
        ));
    }
}
