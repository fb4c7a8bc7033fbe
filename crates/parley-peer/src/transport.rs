//! Lock-step request/reply transport.
//!
//! Every call is one TCP connection: the caller writes its payload, half-closes
//! the write side and reads the reply until EOF. Requests are read
//! concurrently, each within the read timeout, but complete requests are
//! handled strictly one at a time: a call is answered before the next queued
//! one reaches the handler. A caller that never finishes sending only holds
//! its own connection.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use parley_common::{Error, Inbound, Reply, Result};
use parley_crypto::CryptoIdentity;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::PeerConfig;

const LISTEN_BACKLOG: u32 = 128;
/// Complete requests waiting for the handler.
const INBOUND_QUEUE: usize = 64;

/// The inbound side of the transport: one listener, one call handled at a time.
pub struct TransportEndpoint {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    identity: Arc<CryptoIdentity>,
    poll_interval: Duration,
    read_timeout: Duration,
    max_wire_bytes: usize,
    stop: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// A request read in full, waiting for its reply.
struct PendingCall {
    stream: TcpStream,
    remote: SocketAddr,
    payload: Vec<u8>,
}

impl TransportEndpoint {
    /// Bind `bind_host:listen_port`. Failing here is fatal to startup.
    pub fn bind(config: &PeerConfig, identity: Arc<CryptoIdentity>) -> Result<Self> {
        let addr = SocketAddr::new(config.bind_host, config.listen_port);
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(LISTEN_BACKLOG)?;
        let local_addr = listener.local_addr()?;
        info!("listening on {}", local_addr);

        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            identity,
            poll_interval: config.poll_interval,
            read_timeout: config.call_timeout,
            max_wire_bytes: config.max_wire_bytes,
            stop: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start the serve loop on its own task.
    ///
    /// Each inbound payload is opened with our identity, classified and handed
    /// to `handler`; its reply is written back before the next request is
    /// handed over. A handler error drops the call without a reply, which the
    /// caller observes as a timeout.
    pub fn serve<H, Fut>(&self, handler: H) -> Result<()>
    where
        H: Fn(Inbound) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply>> + Send + 'static,
    {
        let listener = take(&self.listener)
            .ok_or_else(|| Error::DuplicateOperation("transport is already serving".into()))?;

        let stop = self.stop.clone();
        let poll_interval = self.poll_interval;
        let read_timeout = self.read_timeout;
        let max_wire_bytes = self.max_wire_bytes;
        let local_addr = self.local_addr;

        let (queue, calls) = mpsc::channel(INBOUND_QUEUE);
        let handling = tokio::spawn(handle_calls(
            calls,
            self.identity.clone(),
            handler,
            read_timeout,
        ));

        let handle = tokio::spawn(async move {
            while !stop.load(Ordering::SeqCst) {
                let (stream, remote) = match timeout(poll_interval, listener.accept()).await {
                    Err(_) => continue,
                    Ok(Err(e)) => {
                        warn!("accept failed on {}: {}", local_addr, e);
                        continue;
                    }
                    Ok(Ok(pair)) => pair,
                };

                let queue = queue.clone();
                tokio::spawn(async move {
                    match read_call(stream, remote, read_timeout, max_wire_bytes).await {
                        Ok(call) => {
                            if queue.send(call).await.is_err() {
                                debug!("serve loop gone, dropping call from {}", remote);
                            }
                        }
                        Err(e) => debug!("dropped call from {}: {}", remote, e),
                    }
                });
            }

            drop(listener);
            handling.abort();
            if let Err(e) = handling.await {
                if !e.is_cancelled() {
                    warn!("call handler ended abnormally: {}", e);
                }
            }
            debug!("serve loop on {} stopped", local_addr);
        });

        let mut task = lock(&self.task);
        *task = Some(handle);
        Ok(())
    }

    /// Signal the serve loop to exit at its next poll. Idempotent.
    pub fn stop(&self) {
        if !self.stop.swap(true, Ordering::SeqCst) {
            debug!("stopping transport on {}", self.local_addr);
        }
    }

    /// Stop and wait until the port is released.
    pub async fn shutdown(&self) {
        self.stop();
        drop(take(&self.listener));

        let handle = take(&self.task);
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("serve loop ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for TransportEndpoint {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

async fn read_call(
    mut stream: TcpStream,
    remote: SocketAddr,
    read_timeout: Duration,
    max_wire_bytes: usize,
) -> Result<PendingCall> {
    let payload = timeout(read_timeout, read_limited(&mut stream, max_wire_bytes))
        .await
        .map_err(|_| Error::timeout("caller did not finish sending"))??;
    if payload.is_empty() {
        return Err(Error::protocol("empty request"));
    }
    Ok(PendingCall {
        stream,
        remote,
        payload,
    })
}

/// Answer queued calls one at a time, in the order they finished arriving.
async fn handle_calls<H, Fut>(
    mut calls: mpsc::Receiver<PendingCall>,
    identity: Arc<CryptoIdentity>,
    handler: H,
    write_timeout: Duration,
) where
    H: Fn(Inbound) -> Fut,
    Fut: Future<Output = Result<Reply>>,
{
    while let Some(call) = calls.recv().await {
        let PendingCall {
            mut stream,
            remote,
            payload,
        } = call;

        let reply = match answer(payload, &identity, &handler).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("dropped call from {}: {}", remote, e);
                continue;
            }
        };

        let written = timeout(write_timeout, async {
            stream.write_all(reply.as_bytes()).await?;
            stream.shutdown().await
        })
        .await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("could not reply to {}: {}", remote, e),
            Err(_) => debug!("reply to {} timed out", remote),
        }
    }
}

async fn answer<H, Fut>(payload: Vec<u8>, identity: &CryptoIdentity, handler: &H) -> Result<String>
where
    H: Fn(Inbound) -> Fut,
    Fut: Future<Output = Result<Reply>>,
{
    let text = String::from_utf8(payload).map_err(|_| Error::protocol("payload is not UTF-8"))?;
    let inbound = Inbound::classify(identity.open(&text));
    handler(inbound).await?.encode()
}

/// Make one outbound call and wait up to `call_timeout` for its reply.
///
/// Errors map to `Unreachable` when nothing accepts the connection,
/// `Timeout` when no reply arrives (or the call is dropped without one) and
/// `Protocol` when the reply does not decode.
pub async fn call(
    host: &str,
    port: u16,
    payload: &str,
    call_timeout: Duration,
    max_wire_bytes: usize,
) -> Result<Reply> {
    match timeout(call_timeout, exchange(host, port, payload, max_wire_bytes)).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(format!(
            "no reply from {host}:{port} within {call_timeout:?}"
        ))),
    }
}

async fn exchange(host: &str, port: u16, payload: &str, max_wire_bytes: usize) -> Result<Reply> {
    let unreachable = |e: std::io::Error| Error::unreachable(format!("{host}:{port}: {e}"));

    let mut stream = TcpStream::connect((host, port)).await.map_err(unreachable)?;
    stream.write_all(payload.as_bytes()).await.map_err(unreachable)?;
    stream.shutdown().await.map_err(unreachable)?;

    let reply = read_limited(&mut stream, max_wire_bytes).await.map_err(|e| match e {
        Error::Io(io) => unreachable(io),
        other => other,
    })?;
    if reply.is_empty() {
        return Err(Error::timeout(format!(
            "{host}:{port} closed the call without replying"
        )));
    }

    let text = String::from_utf8(reply).map_err(|_| Error::protocol("reply is not UTF-8"))?;
    Reply::decode(text.trim())
}

async fn read_limited<R>(reader: &mut R, max_bytes: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    reader
        .take(max_bytes as u64 + 1)
        .read_to_end(&mut buf)
        .await?;
    if buf.len() > max_bytes {
        return Err(Error::PayloadTooLarge {
            size: buf.len(),
            limit: max_bytes,
        });
    }
    Ok(buf)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    lock(slot).take()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_common::Envelope;
    use parley_crypto::MIN_KEY_BITS;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::OnceLock;

    fn identity() -> Arc<CryptoIdentity> {
        static KEY: OnceLock<Arc<CryptoIdentity>> = OnceLock::new();
        KEY.get_or_init(|| Arc::new(CryptoIdentity::generate_with_bits(MIN_KEY_BITS).unwrap()))
            .clone()
    }

    fn config() -> PeerConfig {
        let mut config = PeerConfig::new("tester", 0);
        config.bind_host = IpAddr::V4(Ipv4Addr::LOCALHOST);
        config.poll_interval = Duration::from_millis(50);
        config.call_timeout = Duration::from_secs(2);
        config.decision_timeout = Duration::from_secs(1);
        config
    }

    #[tokio::test]
    async fn test_read_limited_enforces_bound() {
        let mut small: &[u8] = b"hello";
        assert_eq!(read_limited(&mut small, 5).await.unwrap(), b"hello");

        let mut big: &[u8] = b"hello!";
        assert!(matches!(
            read_limited(&mut big, 5).await,
            Err(Error::PayloadTooLarge { limit: 5, .. })
        ));
    }

    #[tokio::test]
    async fn test_serve_twice_is_rejected() {
        let endpoint = TransportEndpoint::bind(&config(), identity()).unwrap();
        endpoint.serve(|_| async { Ok(Reply::Ack) }).unwrap();
        assert!(matches!(
            endpoint.serve(|_| async { Ok(Reply::Ack) }),
            Err(Error::DuplicateOperation(_))
        ));
        endpoint.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_releases_port() {
        let endpoint = TransportEndpoint::bind(&config(), identity()).unwrap();
        let addr = endpoint.local_addr();
        endpoint.serve(|_| async { Ok(Reply::Ack) }).unwrap();

        endpoint.stop();
        endpoint.stop();
        endpoint.shutdown().await;
        endpoint.shutdown().await;

        let err = call(
            "127.0.0.1",
            addr.port(),
            "{}",
            Duration::from_secs(1),
            1024,
        )
        .await
        .unwrap_err();
        assert!(err.is_transport_loss(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_handler_sees_plain_text() {
        let endpoint = TransportEndpoint::bind(&config(), identity()).unwrap();
        let port = endpoint.local_addr().port();
        endpoint
            .serve(|inbound| async move {
                match inbound {
                    Inbound::Text(text) => Ok(Reply::from(Envelope::Message {
                        username: "echo".into(),
                        content: text,
                    })),
                    Inbound::Envelope(_) => Err(Error::protocol("expected text")),
                }
            })
            .unwrap();

        let reply = call("127.0.0.1", port, "just words", Duration::from_secs(2), 1024)
            .await
            .unwrap();
        assert_eq!(
            reply,
            Reply::Envelope(Envelope::Message {
                username: "echo".into(),
                content: "just words".into(),
            })
        );
        endpoint.shutdown().await;
    }
}
