//! TCP listener for the echo service.
//!
//! Binds the listening socket, runs the accept loop and spawns one detached
//! handler task per connection. Handlers are never tracked or joined: stopping
//! the server closes the listening socket only, and connections already
//! accepted keep running until they notice the cleared `running` flag.

use crate::config::Config;
use crate::connection::handle_connection;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info};

/// Server instance
pub struct Server {
    host: String,
    port: u16,
    backlog: u32,
    handle: ServerHandle,
    connection_limit: Option<Arc<Semaphore>>,
}

/// Cloneable handle for observing and stopping a running server.
#[derive(Clone)]
pub struct ServerHandle {
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl ServerHandle {
    fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Whether the accept loop is (or is about to be) accepting connections.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop accepting connections. Safe to call any number of times.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            // notify_one stores a permit if the accept loop is not parked yet
            self.shutdown.notify_one();
            info!("Server stopped");
        } else {
            debug!("Stop requested but server is not running");
        }
    }
}

impl Server {
    /// Create a new server instance
    pub fn new(config: &Config) -> Self {
        Server {
            host: config.host.clone(),
            port: config.port,
            backlog: config.backlog,
            handle: ServerHandle::new(),
            connection_limit: config
                .max_connections
                .map(|max| Arc::new(Semaphore::new(max))),
        }
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    /// Bind, install signal handlers and serve until stopped.
    ///
    /// Returns an error only if the listening socket could not be set up.
    /// An unexpected accept failure ends the loop but still returns `Ok`.
    pub async fn start(&self) -> Result<(), ServerError> {
        let listener = match self.bind().await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to start server: {e}");
                return Err(e);
            }
        };

        spawn_signal_listener(self.handle());
        self.serve(listener).await;
        Ok(())
    }

    /// Create the listening socket and mark the server running.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = resolve(&self.host, self.port).await?;

        let listener = create_listener(addr, self.backlog)
            .and_then(TcpListener::from_std)
            .map_err(|source| ServerError::Bind { addr, source })?;

        self.handle.running.store(true, Ordering::Release);
        info!("Echo server listening on {}:{}", self.host, self.port);
        Ok(listener)
    }

    /// Run the accept loop until `stop` is called or accept fails.
    ///
    /// The listener is dropped, and therefore closed, when this returns.
    pub async fn serve(&self, listener: TcpListener) {
        info!("Waiting for connections...");

        loop {
            if !self.is_running() {
                break;
            }

            let accepted = tokio::select! {
                _ = self.handle.shutdown.notified() => break,
                accepted = self.accept(&listener) => accepted,
            };

            match accepted {
                Ok((stream, peer, permit)) => {
                    let running = Arc::clone(&self.handle.running);

                    tokio::spawn(async move {
                        handle_connection(stream, peer, running).await;
                        drop(permit);
                    });
                }
                Err(e) => {
                    // A failure racing with stop is expected and stays quiet
                    if self.is_running() {
                        error!("Socket error: {e}");
                    }
                    break;
                }
            }
        }

        drop(listener);
        debug!("Listener closed");
    }

    async fn accept(
        &self,
        listener: &TcpListener,
    ) -> io::Result<(TcpStream, SocketAddr, Option<OwnedSemaphorePermit>)> {
        let permit = match &self.connection_limit {
            Some(limit) => {
                if limit.available_permits() == 0 {
                    debug!("Connection limit reached, waiting for a free slot");
                }
                let permit = Arc::clone(limit)
                    .acquire_owned()
                    .await
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                Some(permit)
            }
            None => None,
        };

        let (stream, peer) = listener.accept().await?;
        Ok((stream, peer, permit))
    }
}

/// Resolve `host:port`, preferring IPv4 results.
async fn resolve(host: &str, port: u16) -> Result<SocketAddr, ServerError> {
    let resolve_error = |source| ServerError::Resolve {
        host: host.to_string(),
        port,
        source,
    };

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(resolve_error)?
        .collect();

    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| {
            resolve_error(io::Error::new(
                io::ErrorKind::NotFound,
                "no addresses found",
            ))
        })
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

    Ok(socket.into())
}

/// Stop the server on Ctrl-C, or SIGTERM on Unix.
fn spawn_signal_listener(handle: ServerHandle) {
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(()) => {
                info!("Shutdown signal received");
                handle.stop();
            }
            Err(e) => error!("Failed to install signal handlers: {e}"),
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Server startup errors
#[derive(Debug)]
pub enum ServerError {
    Resolve {
        host: String,
        port: u16,
        source: io::Error,
    },
    Bind {
        addr: SocketAddr,
        source: io::Error,
    },
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Resolve { host, port, source } => {
                write!(f, "Failed to resolve '{host}:{port}': {source}")
            }
            ServerError::Bind { addr, source } => {
                write!(f, "Failed to bind {addr}: {source}")
            }
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Resolve { source, .. } => Some(source),
            ServerError::Bind { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Config::default()
        }
    }

    async fn spawn_server(config: Config) -> (ServerHandle, SocketAddr, JoinHandle<()>) {
        let server = Server::new(&config);
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = server.handle();
        let task = tokio::spawn(async move { server.serve(listener).await });
        (handle, addr, task)
    }

    async fn echo(client: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
        client.write_all(payload).await.unwrap();
        let mut reply = vec![0u8; payload.len()];
        timeout(WAIT, client.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        reply
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = Server::new(&test_config());
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_echo_hello() {
        let (handle, addr, _task) = spawn_server(test_config()).await;
        assert!(handle.is_running());

        let mut client = TcpStream::connect(addr).await.unwrap();
        assert_eq!(echo(&mut client, b"hello").await, b"hello");

        handle.stop();
    }

    #[tokio::test]
    async fn test_server_closes_after_client_half_close() {
        let (handle, addr, _task) = spawn_server(test_config()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        assert_eq!(echo(&mut client, b"bye").await, b"bye");
        client.shutdown().await.unwrap();

        let mut rest = Vec::new();
        let n = timeout(WAIT, client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        handle.stop();
    }

    #[tokio::test]
    async fn test_invalid_utf8_echoed_unmodified() {
        let (handle, addr, _task) = spawn_server(test_config()).await;

        let payload = [0xc3, 0x28, 0xa0, 0xa1, 0xff, b'\r', b'\n'];
        let mut client = TcpStream::connect(addr).await.unwrap();
        assert_eq!(echo(&mut client, &payload).await, payload);

        handle.stop();
    }

    #[tokio::test]
    async fn test_payload_larger_than_chunk() {
        let (handle, addr, _task) = spawn_server(test_config()).await;

        let payload: Vec<u8> = (0..10_000).map(|i| (i % 253) as u8).collect();
        let mut client = TcpStream::connect(addr).await.unwrap();
        assert_eq!(echo(&mut client, &payload).await, payload);

        handle.stop();
    }

    #[tokio::test]
    async fn test_writes_echoed_in_order() {
        let (handle, addr, _task) = spawn_server(test_config()).await;

        let writes: [&[u8]; 4] = [b"one ", b"two ", b"three ", b"four"];
        let mut client = TcpStream::connect(addr).await.unwrap();
        for w in writes {
            client.write_all(w).await.unwrap();
        }
        client.shutdown().await.unwrap();

        let mut received = Vec::new();
        timeout(WAIT, client.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, writes.concat());

        handle.stop();
    }

    #[tokio::test]
    async fn test_concurrent_clients_isolated() {
        let (handle, addr, _task) = spawn_server(test_config()).await;

        let clients: Vec<_> = (0..8)
            .map(|i| {
                tokio::spawn(async move {
                    let payload = format!("client-{i}-").repeat(50).into_bytes();
                    let mut client = TcpStream::connect(addr).await.unwrap();
                    client.write_all(&payload).await.unwrap();
                    client.shutdown().await.unwrap();

                    let mut received = Vec::new();
                    timeout(WAIT, client.read_to_end(&mut received))
                        .await
                        .unwrap()
                        .unwrap();
                    assert_eq!(received, payload);
                })
            })
            .collect();

        for client in clients {
            client.await.unwrap();
        }

        handle.stop();
    }

    #[tokio::test]
    async fn test_stop_ends_accept_loop() {
        let (handle, addr, task) = spawn_server(test_config()).await;

        handle.stop();
        assert!(!handle.is_running());
        timeout(WAIT, task).await.unwrap().unwrap();

        // Listener is closed, so nothing accepts on that port any more
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (handle, _addr, task) = spawn_server(test_config()).await;

        handle.stop();
        handle.stop();
        timeout(WAIT, task).await.unwrap().unwrap();
        handle.stop();
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let server = Server::new(&test_config());
        server.handle().stop();
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_stop_leaves_open_connections() {
        let (handle, addr, task) = spawn_server(test_config()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        assert_eq!(echo(&mut client, b"before").await, b"before");

        // Let the handler park in its next read
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop();
        timeout(WAIT, task).await.unwrap().unwrap();

        // The blocked read still completes one round, then the handler exits
        assert_eq!(echo(&mut client, b"after").await, b"after");
        let mut rest = Vec::new();
        timeout(WAIT, client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let server = Server::new(&Config {
            port,
            ..test_config()
        });
        match server.start().await {
            Err(ServerError::Bind { addr, .. }) => assert_eq!(addr.port(), port),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_resolve_prefers_ipv4() {
        let addr = resolve("localhost", 8080).await.unwrap();
        assert!(addr.is_ipv4());
        assert_eq!(addr.port(), 8080);
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let (handle, addr, _task) = spawn_server(Config {
            max_connections: Some(1),
            ..test_config()
        })
        .await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        assert_eq!(echo(&mut first, b"first").await, b"first");

        // Queued in the backlog until the first connection finishes
        let mut second = TcpStream::connect(addr).await.unwrap();
        second.write_all(b"second").await.unwrap();
        let mut reply = [0u8; 6];
        assert!(
            timeout(Duration::from_millis(200), second.read_exact(&mut reply))
                .await
                .is_err()
        );

        drop(first);
        timeout(WAIT, second.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply, b"second");

        handle.stop();
    }
}
