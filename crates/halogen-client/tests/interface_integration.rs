//! Client interface against a full core with the socket gateway enabled.

use std::sync::Arc;
use std::time::Duration;

use halogen_client::config::{ClientSettings, ServerConfig};
use halogen_client::{ClientConfig, ClientError, HalogenInterface};
use halogen_core::module::NoModules;
use halogen_core::modules::builtin_modules;
use halogen_core::{Core, CoreExit, EventBus, Settings};
use halogen_protocol::{Chain, ChainAllocator, ChainSource, Event, EventBody, EventKind};
use tempfile::TempDir;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn core(dir: &TempDir, port: u16) -> Core {
    let source = format!(
        r#"
[user]
name = "tester"

[logger]
level = "debug"
terminal = false
logfile = '{}'

[server]
host = "127.0.0.1"
port = {port}
"#,
        dir.path().join("halogen.log").display(),
    );
    let settings = Settings::from_toml(&source).unwrap();
    let bus = Arc::new(EventBus::new());
    let chains: Arc<dyn ChainSource> = Arc::new(ChainAllocator::default());
    Core::init(settings, bus, chains, builtin_modules(), &NoModules)
}

fn client_config(port: u16) -> ClientConfig {
    ClientConfig {
        server: ServerConfig {
            address: Some(format!("127.0.0.1:{port}")),
        },
        client: ClientSettings {
            name: Some("test-client".to_string()),
            timeout_secs: Some(5),
        },
    }
}

/// The gateway binds once the core starts, so retry for a while.
async fn connect(port: u16) -> HalogenInterface {
    for _ in 0..200 {
        match HalogenInterface::from_config(client_config(port)).await {
            Ok(interface) => return interface,
            Err(ClientError::Connect { .. }) => tokio::time::sleep(Duration::from_millis(10)).await,
            Err(e) => panic!("unexpected client error: {e}"),
        }
    }
    panic!("gateway never came up on port {port}");
}

async fn wait_for(
    interface: &mut HalogenInterface,
    matches: impl Fn(&Event) -> bool,
) -> Event {
    loop {
        let event = interface
            .check_event(Some(Duration::from_secs(5)))
            .await
            .unwrap()
            .expect("timed out waiting for an event");
        if matches(&event) {
            return event;
        }
    }
}

fn executed_on(chain: Chain) -> impl Fn(&Event) -> bool {
    move |event| event.kind() == EventKind::CommandExecuted && event.chain == chain
}

#[tokio::test]
async fn test_command_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let mut core = core(&dir, port);

    let (result, ()) = tokio::join!(core.run(), async {
        let mut interface = connect(port).await;
        assert!(interface.is_connected());
        let own = interface.chain().unwrap();
        assert_eq!(own.flow, 0);

        let chain = interface
            .send_command("core", "get", vec!["user".to_string()])
            .unwrap();
        assert_eq!(chain.context, own.context);
        let reply = wait_for(&mut interface, executed_on(chain)).await;
        match reply.body {
            EventBody::CommandExecuted { success, output, .. } => {
                assert!(success);
                assert_eq!(output, "tester");
            }
            other => panic!("unexpected reply {other:?}"),
        }

        let chain = interface.send_command("core", "bogus", Vec::new()).unwrap();
        let reply = wait_for(&mut interface, executed_on(chain)).await;
        match reply.body {
            EventBody::CommandExecuted { success, output, .. } => {
                assert!(!success);
                assert_eq!(output, "Undefined Command: core::bogus");
            }
            other => panic!("unexpected reply {other:?}"),
        }

        interface.shutdown_halogen().unwrap();
        wait_for(&mut interface, |e| e.kind() == EventKind::Error).await;
        let (ok, _) = interface.end().await;
        assert!(ok);
    });

    assert_eq!(result.unwrap(), CoreExit::Shutdown);
}

#[tokio::test]
async fn test_clients_get_distinct_contexts() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let mut core = core(&dir, port);

    let (result, ()) = tokio::join!(core.run(), async {
        let mut first = connect(port).await;
        let mut second = connect(port).await;
        let (a, b) = (first.chain().unwrap(), second.chain().unwrap());
        assert_ne!(a.context, b.context);

        // A reply for the second client never reaches the first.
        let chain = second
            .send_command("core", "get", vec!["chain".to_string()])
            .unwrap();
        let reply = wait_for(&mut second, executed_on(chain)).await;
        assert_eq!(reply.chain.context, b.context);
        assert!(
            first
                .check_event(Some(Duration::from_millis(200)))
                .await
                .unwrap()
                .is_none()
        );

        first.end().await;
        second.shutdown_halogen().unwrap();
        wait_for(&mut second, |e| e.kind() == EventKind::Error).await;
        second.end().await;
    });

    assert_eq!(result.unwrap(), CoreExit::Shutdown);
}

#[tokio::test]
async fn test_restart_reconnects() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let mut core = core(&dir, port);

    let (result, ()) = tokio::join!(core.run(), async {
        let mut interface = connect(port).await;
        let before = interface.chain().unwrap();

        interface.restart().await.unwrap();
        let after = interface.chain().unwrap();
        assert_ne!(before.context, after.context);

        interface.shutdown_halogen().unwrap();
        wait_for(&mut interface, |e| e.kind() == EventKind::Error).await;
        interface.end().await;
    });

    assert_eq!(result.unwrap(), CoreExit::Shutdown);
}

#[tokio::test]
async fn test_calls_without_connection_fail() {
    let port = free_port();
    let mut interface = connect_then_end(port).await;
    assert!(!interface.is_connected());
    assert!(matches!(interface.send_message("hi"), Err(ClientError::NotConnected)));
    let (ok, _) = interface.end().await;
    assert!(!ok);
}

/// Connect to a server that hangs up without a greeting, then end the connection.
async fn connect_then_end(port: u16) -> HalogenInterface {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let accept = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        drop(socket);
    });
    let mut interface = HalogenInterface::from_config(client_config(port)).await.unwrap();
    accept.await.unwrap();
    interface.end().await;
    interface
}
