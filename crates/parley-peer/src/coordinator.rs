//! Connection handshake, key exchange and delivery.
//!
//! A [`Coordinator`] owns the local identity, the peer directory and the
//! transport. Outbound operations are plain async methods; callers that want
//! them off their own task spawn them. Inbound calls arrive one at a time
//! from the transport's serve loop.
//!
//! Handshake, seen from the side that calls [`Coordinator::connect`]:
//!
//! ```text
//! requester                                   acceptor
//!   connection_request  ───────────────────▶  held until accept/refuse
//!                       ◀───────────────────  connection_accepted
//!   key_exchange(ours)  ───────────────────▶  store, promote
//!                       ◀───────────────────  key_exchange(theirs)
//!                       ◀───────────────────  key_exchange(theirs)   (acceptor task)
//!   key_exchange_ack    ───────────────────▶
//! ```
//!
//! Both sides send their key; whichever delivery lands first promotes the
//! peer and the other is acknowledged.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use parley_common::file_transfer::{encode_file_payload, sanitize_filename};
use parley_common::helpers::discover_local_ipv4;
use parley_common::{Envelope, Error, Inbound, Reply, Result};
use parley_crypto::{fingerprint_pem, validate_public_key, CryptoIdentity};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot, Notify};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::config::{validate_username, PeerConfig};
use crate::directory::{ConnectionState, PeerAddress, PeerDirectory, PeerRecord};
use crate::events::{EventSubscription, PeerEvent, EVENT_CAPACITY};
use crate::transport::{self, TransportEndpoint};

/// Refusal reason when nobody answers an incoming request in time.
pub const DECISION_TIMEOUT_REASON: &str = "no decision before timeout";
/// Status detail for a `Connected` peer whose listener went away.
pub const CONNECTION_LOST: &str = "connection lost";
pub const REFUSED_REASON: &str = "connection refused";
const SHUTTING_DOWN: &str = "peer is shutting down";

#[derive(Debug)]
enum Decision {
    Accept,
    Refuse(String),
}

/// Handle to a running peer. Cheap to clone.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    config: PeerConfig,
    identity: Arc<CryptoIdentity>,
    advertised: SocketAddr,
    transport: TransportEndpoint,
    directory: Mutex<PeerDirectory>,
    pending: Mutex<HashMap<String, oneshot::Sender<Decision>>>,
    events: broadcast::Sender<PeerEvent>,
    /// Signalled whenever a peer is promoted or discarded.
    changed: Notify,
    shut_down: AtomicBool,
    /// Runtime `start` ran on. Background work is spawned here so the sync
    /// entry points work from threads outside the runtime.
    runtime: Handle,
}

impl Coordinator {
    /// Validate `config`, generate the session key, bind and start serving.
    pub async fn start(config: PeerConfig) -> Result<Self> {
        config.validate()?;

        let bits = config.key_bits;
        let identity = tokio::task::spawn_blocking(move || CryptoIdentity::generate_with_bits(bits))
            .await
            .map_err(|e| Error::crypto(format!("key generation task failed: {e}")))??;
        let identity = Arc::new(identity);
        info!(
            "generated {}-bit session key, fingerprint {}",
            identity.key_bits(),
            identity.fingerprint()
        );

        let transport = TransportEndpoint::bind(&config, identity.clone())?;
        let host = config.advertise_host.unwrap_or_else(discover_local_ipv4);
        let advertised = SocketAddr::new(host, transport.local_addr().port());

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(Inner {
            config,
            identity,
            advertised,
            transport,
            directory: Mutex::new(PeerDirectory::new()),
            pending: Mutex::new(HashMap::new()),
            events,
            changed: Notify::new(),
            shut_down: AtomicBool::new(false),
            runtime: Handle::current(),
        });

        let weak = Arc::downgrade(&inner);
        inner.transport.serve(move |inbound| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => inner.handle_inbound(inbound).await,
                    None => Err(Error::protocol("coordinator is gone")),
                }
            }
        })?;

        info!("{} is reachable at {}", inner.config.username, advertised);
        Ok(Self { inner })
    }

    /// Ask `username` at `host:port` to connect, then exchange keys.
    ///
    /// Returns once the peer is `Connected`, or with the error that failed
    /// the handshake.
    pub async fn connect(&self, host: &str, port: u16, username: &str) -> Result<()> {
        self.inner.connect(host, port, username).await
    }

    /// Accept the pending request from `username`.
    ///
    /// Safe to call from any thread; the key exchange it starts runs on the
    /// runtime the coordinator was started on.
    pub fn accept_incoming(&self, username: &str) -> Result<()> {
        self.inner.accept_incoming(username)
    }

    /// Refuse the pending request from `username`.
    pub fn refuse_incoming(&self, username: &str) -> Result<()> {
        self.inner.refuse_incoming(username)
    }

    /// Send chat text to a `Connected` peer.
    pub async fn send(&self, username: &str, text: &str) -> Result<()> {
        self.inner.send(username, text).await
    }

    /// Send a whole file to a `Connected` peer.
    pub async fn send_file(&self, username: &str, filename: &str, bytes: &[u8]) -> Result<()> {
        self.inner.send_file(username, filename, bytes).await
    }

    /// Tear down the connection with `username`. The local record is removed
    /// even when the peer cannot be told.
    pub async fn disconnect(&self, username: &str) -> Result<()> {
        self.inner.disconnect(username).await
    }

    /// Disconnect everyone, refuse pending requests and release the port.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription::new(self.inner.events.subscribe())
    }

    pub fn username(&self) -> &str {
        &self.inner.config.username
    }

    /// Address we tell peers to dial back.
    pub fn advertised_addr(&self) -> SocketAddr {
        self.inner.advertised
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.transport.local_addr()
    }

    pub fn public_key_pem(&self) -> &str {
        self.inner.identity.public_key_pem()
    }

    pub fn fingerprint(&self) -> &str {
        self.inner.identity.fingerprint()
    }

    /// `Failed` sticks until the next request to or from `username`.
    pub fn peer_state(&self, username: &str) -> ConnectionState {
        self.inner.directory().state_of(username)
    }

    pub fn peer_public_key(&self, username: &str) -> Option<String> {
        self.inner
            .directory()
            .get(username)
            .and_then(|r| r.public_key.clone())
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.inner.directory().snapshot()
    }

    /// Usernames whose connection requests await a decision.
    pub fn pending_requests(&self) -> Vec<String> {
        let mut names: Vec<_> = lock(&self.inner.pending).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }
}

impl Inner {
    fn directory(&self) -> MutexGuard<'_, PeerDirectory> {
        lock(&self.directory)
    }

    fn emit(&self, event: PeerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn status(&self, username: &str, connected: bool, detail: Option<&str>) {
        self.emit(PeerEvent::ConnectionStatusChanged {
            username: username.to_string(),
            connected,
            detail: detail.map(str::to_string),
        });
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(Error::protocol("coordinator has shut down"));
        }
        Ok(())
    }

    async fn call(&self, address: &PeerAddress, envelope: &Envelope) -> Result<Reply> {
        let payload = envelope.encode()?;
        transport::call(
            &address.host,
            address.port,
            &payload,
            self.config.call_timeout,
            self.config.max_wire_bytes,
        )
        .await
    }

    fn own_request(&self) -> Envelope {
        Envelope::ConnectionRequest {
            username: self.config.username.clone(),
            host: self.advertised.ip().to_string(),
            port: self.advertised.port(),
        }
    }

    fn own_accept(&self) -> Reply {
        Envelope::ConnectionAccepted {
            username: self.config.username.clone(),
            host: self.advertised.ip().to_string(),
            port: self.advertised.port(),
        }
        .into()
    }

    fn own_key(&self) -> Envelope {
        Envelope::KeyExchange {
            username: self.config.username.clone(),
            public_key: self.identity.public_key_pem().to_string(),
        }
    }

    fn refused(&self, reason: &str) -> Reply {
        Envelope::ConnectionRefused {
            username: self.config.username.clone(),
            reason: reason.to_string(),
        }
        .into()
    }

    /// Store the key and, the first time, announce the connection.
    fn promote(&self, username: &str, public_key: &str) -> Result<bool> {
        let promoted = self
            .directory()
            .store_public_key_and_promote(username, public_key)?;
        if promoted {
            let fingerprint = fingerprint_pem(public_key).unwrap_or_else(|_| "unknown".into());
            info!("connected to {} (key fingerprint {})", username, fingerprint);
            self.changed.notify_waiters();
            self.emit(PeerEvent::KeyExchangeComplete {
                username: username.to_string(),
            });
            self.status(username, true, None);
        }
        Ok(promoted)
    }

    /// Discard a peer whose handshake has not completed.
    ///
    /// `Connected` peers are left alone. Returns whether a record was dropped.
    fn discard(&self, username: &str, detail: &str) -> bool {
        let discarded = {
            let mut dir = self.directory();
            match dir.state_of(username) {
                ConnectionState::Connected | ConnectionState::Idle | ConnectionState::Failed => None,
                _ => dir.fail(username),
            }
        };
        if discarded.is_none() {
            return false;
        }
        self.changed.notify_waiters();
        self.status(username, false, Some(detail));
        true
    }

    fn fail_peer(&self, username: &str, detail: &str) {
        if self.discard(username, detail) {
            warn!("handshake with {} failed: {}", username, detail);
        }
    }

    /// Wait until `username` is promoted, discarded, or `limit` elapses.
    async fn wait_until_connected(&self, username: &str, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            let notified = self.changed.notified();
            let state = self.directory().state_of(username);
            match state {
                ConnectionState::Connected => return true,
                s if s.is_in_progress() => {}
                _ => return false,
            }
            if timeout_at(deadline, notified).await.is_err() {
                return self.directory().state_of(username) == ConnectionState::Connected;
            }
        }
    }

    async fn connect(self: &Arc<Self>, host: &str, port: u16, username: &str) -> Result<()> {
        self.ensure_running()?;
        validate_username(username)?;
        if username == self.config.username {
            return Err(Error::protocol("cannot connect to yourself"));
        }

        let address = PeerAddress::new(host, port);
        self.directory().begin_request(username, address.clone())?;
        info!("requesting connection with {} at {}", username, address);

        let reply = match self.call(&address, &self.own_request()).await {
            Ok(reply) => reply,
            Err(e) => {
                self.fail_peer(username, &e.to_string());
                return Err(e);
            }
        };

        match reply {
            Reply::Envelope(Envelope::ConnectionAccepted { username: from, .. }) if from != username => {
                let err = Error::protocol(format!(
                    "{address} answered as {from}, expected {username}"
                ));
                self.fail_peer(username, &err.to_string());
                return Err(err);
            }
            Reply::Envelope(Envelope::ConnectionAccepted { .. }) => {
                debug!("{} accepted our request", username);
            }
            Reply::Envelope(Envelope::ConnectionRefused { reason, .. }) => {
                self.fail_peer(username, &format!("refused: {reason}"));
                return Err(Error::Refused(reason));
            }
            Reply::Envelope(Envelope::Error { detail }) => {
                self.fail_peer(username, &detail);
                return Err(Error::protocol(detail));
            }
            other => {
                let err = Error::protocol(format!(
                    "unexpected reply to connection request: {}",
                    reply_kind(&other)
                ));
                self.fail_peer(username, &err.to_string());
                return Err(err);
            }
        }

        // The acceptor's own key exchange may already have promoted the peer.
        let state = {
            let mut dir = self.directory();
            let state = dir.state_of(username);
            if state == ConnectionState::Requesting {
                dir.transition(username, ConnectionState::KeyExchanging)?;
            }
            dir.state_of(username)
        };
        match state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::KeyExchanging => self.exchange_keys(username, &address).await,
            _ => Err(Error::protocol(format!(
                "handshake with {username} was abandoned"
            ))),
        }
    }

    /// Send our key to `username` and store the key it answers with.
    async fn exchange_keys(&self, username: &str, address: &PeerAddress) -> Result<()> {
        debug!("sending public key to {}", username);
        let reply = match self.call(address, &self.own_key()).await {
            Ok(reply) => reply,
            Err(e) => {
                self.fail_peer(username, &format!("key exchange failed: {e}"));
                return Err(e);
            }
        };

        match reply {
            Reply::Envelope(Envelope::KeyExchange {
                username: from,
                public_key,
            }) => {
                let checked = if from != username {
                    Err(Error::protocol(format!(
                        "key exchange answered by {from}, expected {username}"
                    )))
                } else {
                    validate_public_key(&public_key)
                        .map_err(Error::from)
                        .and_then(|_| self.promote(username, &public_key))
                };
                match checked {
                    Ok(_) => Ok(()),
                    Err(e) => {
                        self.fail_peer(username, &format!("key exchange failed: {e}"));
                        Err(e)
                    }
                }
            }
            Reply::Envelope(Envelope::KeyExchangeAck { .. }) => {
                // The peer already holds our key; its own exchange brings us theirs.
                if self
                    .wait_until_connected(username, self.config.call_timeout)
                    .await
                {
                    Ok(())
                } else {
                    let err = Error::timeout(format!(
                        "{username} acknowledged our key but never sent its own"
                    ));
                    self.fail_peer(username, &err.to_string());
                    Err(err)
                }
            }
            Reply::Envelope(Envelope::Error { detail }) => {
                self.fail_peer(username, &format!("key exchange rejected: {detail}"));
                Err(Error::protocol(detail))
            }
            other => {
                let err = Error::protocol(format!(
                    "unexpected reply to key exchange: {}",
                    reply_kind(&other)
                ));
                self.fail_peer(username, &err.to_string());
                Err(err)
            }
        }
    }

    fn spawn_key_exchange(self: &Arc<Self>, username: &str, address: PeerAddress) {
        let inner = self.clone();
        let username = username.to_string();
        self.runtime.spawn(async move {
            if let Err(e) = inner.exchange_keys(&username, &address).await {
                warn!("key exchange with {} failed: {}", username, e);
            }
        });
    }

    fn accept_incoming(self: &Arc<Self>, username: &str) -> Result<()> {
        self.ensure_running()?;
        let sender = lock(&self.pending)
            .remove(username)
            .ok_or_else(|| Error::UnknownPeer(format!("no pending request from {username}")))?;

        let address = {
            let mut dir = self.directory();
            dir.transition(username, ConnectionState::KeyExchanging)?;
            dir.get(username).map(|r| r.address.clone())
        };
        let address = address.ok_or_else(|| Error::UnknownPeer(username.to_string()))?;

        if sender.send(Decision::Accept).is_err() {
            self.fail_peer(username, DECISION_TIMEOUT_REASON);
            return Err(Error::timeout(format!(
                "request from {username} expired before it was accepted"
            )));
        }

        info!("accepted connection from {}", username);
        self.spawn_key_exchange(username, address);
        Ok(())
    }

    fn refuse_incoming(&self, username: &str) -> Result<()> {
        let sender = lock(&self.pending)
            .remove(username)
            .ok_or_else(|| Error::UnknownPeer(format!("no pending request from {username}")))?;

        // The caller may have given up already; the record goes either way.
        let _ = sender.send(Decision::Refuse(REFUSED_REASON.to_string()));
        self.discard(username, REFUSED_REASON);
        info!("refused connection from {}", username);
        Ok(())
    }

    async fn send(&self, username: &str, text: &str) -> Result<()> {
        let record = self.connected_record(username)?;
        let envelope = Envelope::Message {
            username: self.config.username.clone(),
            content: text.to_string(),
        };
        self.deliver(&record, &envelope).await
    }

    async fn send_file(&self, username: &str, filename: &str, bytes: &[u8]) -> Result<()> {
        let record = self.connected_record(username)?;
        let clean = sanitize_filename(filename)
            .ok_or_else(|| Error::protocol(format!("invalid filename: {filename}")))?;
        let content = encode_file_payload(bytes)?;
        let envelope = Envelope::File {
            username: Some(self.config.username.clone()),
            filename: clean,
            content,
        };
        self.deliver(&record, &envelope).await
    }

    fn connected_record(&self, username: &str) -> Result<PeerRecord> {
        match self.directory().get(username) {
            Some(record) if record.state == ConnectionState::Connected => Ok(record.clone()),
            Some(record) => Err(Error::NotConnected(format!(
                "{username} is {}",
                record.state
            ))),
            None => Err(Error::NotConnected(format!("{username} is not connected"))),
        }
    }

    /// Seal and send a message or file, reporting the outcome as an event.
    async fn deliver(&self, record: &PeerRecord, envelope: &Envelope) -> Result<()> {
        let username = record.username.as_str();
        let result = self.seal_and_call(record, envelope).await;

        match &result {
            Ok(()) => {
                debug!("delivered {} to {}", envelope.kind(), username);
                self.emit(PeerEvent::SendOutcome {
                    username: username.to_string(),
                    success: true,
                    error: None,
                });
            }
            Err(e) => {
                warn!("sending {} to {} failed: {}", envelope.kind(), username, e);
                self.emit(PeerEvent::SendOutcome {
                    username: username.to_string(),
                    success: false,
                    error: Some(e.to_string()),
                });
                if e.is_transport_loss() {
                    self.on_transport_loss(username);
                }
            }
        }
        result
    }

    async fn seal_and_call(&self, record: &PeerRecord, envelope: &Envelope) -> Result<()> {
        let plaintext = envelope.encode()?;
        let sealed = self
            .identity
            .seal_for(&plaintext, record.public_key.as_deref())?;
        if !sealed.is_encrypted() {
            warn!(
                "no key for {}, sending {} unencrypted",
                record.username,
                envelope.kind()
            );
        }

        let reply = transport::call(
            &record.address.host,
            record.address.port,
            sealed.as_str(),
            self.config.call_timeout,
            self.config.max_wire_bytes,
        )
        .await?;

        match reply {
            Reply::Ack => Ok(()),
            Reply::Envelope(Envelope::Error { detail }) => Err(Error::protocol(format!(
                "{} rejected {}: {}",
                record.username,
                envelope.kind(),
                detail
            ))),
            Reply::Envelope(other) => Err(Error::protocol(format!(
                "unexpected reply to {}: {}",
                envelope.kind(),
                other.kind()
            ))),
        }
    }

    fn on_transport_loss(&self, username: &str) {
        if self.directory().remove_connected(username).is_ok() {
            warn!("lost connection to {}", username);
            self.changed.notify_waiters();
            self.status(username, false, Some(CONNECTION_LOST));
        }
    }

    async fn disconnect(&self, username: &str) -> Result<()> {
        let record = {
            let mut dir = self.directory();
            match dir.state_of(username) {
                ConnectionState::Idle | ConnectionState::Failed => {
                    return Err(Error::NotConnected(format!("{username} is not connected")));
                }
                ConnectionState::Connected => dir.remove_connected(username)?,
                _ => dir
                    .fail(username)
                    .ok_or_else(|| Error::UnknownPeer(username.to_string()))?,
            }
        };
        self.changed.notify_waiters();
        info!("disconnecting from {}", username);

        let bye = Envelope::Disconnect {
            username: self.config.username.clone(),
        };
        match self.call(&record.address, &bye).await {
            Ok(Reply::Ack) | Ok(Reply::Envelope(Envelope::DisconnectAck {})) => {
                debug!("{} acknowledged disconnect", username);
            }
            Ok(Reply::Envelope(other)) => {
                warn!("unexpected reply to disconnect from {}: {}", username, other.kind());
            }
            Err(e) => warn!("could not tell {} we disconnected: {}", username, e),
        }

        self.status(username, false, Some("disconnected"));
        Ok(())
    }

    async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down {}", self.config.username);

        let pending: Vec<_> = lock(&self.pending).drain().collect();
        for (username, sender) in pending {
            debug!("refusing pending request from {}", username);
            let _ = sender.send(Decision::Refuse(SHUTTING_DOWN.to_string()));
        }

        let connected = self.directory().connected_peers();
        for username in connected {
            if let Err(e) = self.disconnect(&username).await {
                debug!("disconnect from {} during shutdown: {}", username, e);
            }
        }

        self.transport.shutdown().await;
        let dropped = self.directory().clear();
        self.changed.notify_waiters();
        debug!("shutdown complete, dropped {} peer records", dropped);
    }

    async fn handle_inbound(self: &Arc<Self>, inbound: Inbound) -> Result<Reply> {
        let envelope = match inbound {
            Inbound::Envelope(envelope) => envelope,
            Inbound::Text(text) => {
                warn!("received {} bytes that are not an envelope, delivering as text", text.len());
                self.emit(PeerEvent::MessageReceived(Inbound::Text(text)));
                return Ok(Reply::Ack);
            }
        };
        debug!(
            "inbound {} from {}",
            envelope.kind(),
            envelope.sender().unwrap_or("unnamed sender")
        );

        match envelope {
            Envelope::ConnectionRequest {
                username,
                host,
                port,
            } => self.on_connection_request(username, host, port).await,
            Envelope::KeyExchange {
                username,
                public_key,
            } => Ok(self.on_key_exchange(&username, &public_key)),
            Envelope::Message { .. } | Envelope::File { .. } => {
                self.on_delivery(envelope);
                Ok(Reply::Ack)
            }
            Envelope::Disconnect { username } => {
                self.on_disconnect(&username);
                Ok(Envelope::DisconnectAck {}.into())
            }
            other => {
                warn!("unexpected inbound {}", other.kind());
                Ok(Envelope::Error {
                    detail: format!("unexpected {}", other.kind()),
                }
                .into())
            }
        }
    }

    async fn on_connection_request(
        self: &Arc<Self>,
        username: String,
        host: String,
        port: u16,
    ) -> Result<Reply> {
        if username == self.config.username {
            return Ok(self.refused("cannot connect to yourself"));
        }
        if self.shut_down.load(Ordering::SeqCst) {
            return Ok(self.refused(SHUTTING_DOWN));
        }
        if let Err(e) = validate_username(&username) {
            return Ok(self.refused(&e.to_string()));
        }

        let address = PeerAddress::new(host.clone(), port);
        let state = {
            let mut dir = self.directory();
            let state = dir.state_of(&username);
            if matches!(state, ConnectionState::Idle | ConnectionState::Failed) {
                dir.begin_accepting(&username, address.clone())?;
            }
            state
        };

        match state {
            ConnectionState::Idle | ConnectionState::Failed => {}
            ConnectionState::Requesting => {
                self.on_simultaneous_request(&username);
                return Ok(self.own_accept());
            }
            _ => {
                debug!("{} asked again while {}, accepting without a new handshake", username, state);
                return Ok(self.own_accept());
            }
        }

        let (tx, mut rx) = oneshot::channel();
        lock(&self.pending).insert(username.clone(), tx);
        info!("incoming connection request from {} at {}", username, address);
        self.emit(PeerEvent::IncomingConnectionRequest {
            username: username.clone(),
            host,
            port,
        });

        let decision = match timeout(self.config.decision_timeout, &mut rx).await {
            Ok(decision) => decision.ok(),
            Err(_) => {
                let unclaimed = lock(&self.pending).remove(&username).is_some();
                if unclaimed {
                    None
                } else {
                    // accept/refuse took the sender just as we timed out.
                    rx.await.ok()
                }
            }
        };

        match decision {
            Some(Decision::Accept) => Ok(self.own_accept()),
            Some(Decision::Refuse(reason)) => {
                self.discard(&username, &reason);
                Ok(self.refused(&reason))
            }
            None => {
                info!("request from {} expired without a decision", username);
                self.discard(&username, DECISION_TIMEOUT_REASON);
                Ok(self.refused(DECISION_TIMEOUT_REASON))
            }
        }
    }

    /// Both sides asked at once. Our own request counts as consent, so the
    /// answer is always accept; the username that sorts first acts as the
    /// client of the pair and the other side starts the key exchange.
    fn on_simultaneous_request(self: &Arc<Self>, username: &str) {
        if username >= self.config.username.as_str() {
            debug!("simultaneous request from {}, our request drives the handshake", username);
            return;
        }

        let address = {
            let mut dir = self.directory();
            match dir.transition(username, ConnectionState::KeyExchanging) {
                Ok(_) => dir.get(username).map(|r| r.address.clone()),
                Err(_) => None,
            }
        };
        if let Some(address) = address {
            debug!("simultaneous request from {}, starting key exchange", username);
            self.spawn_key_exchange(username, address);
        }
    }

    fn on_key_exchange(&self, username: &str, public_key: &str) -> Reply {
        if let Err(e) = validate_public_key(public_key) {
            warn!("rejecting key from {}: {}", username, e);
            self.fail_peer(username, "invalid public key");
            return Envelope::Error {
                detail: "invalid public key".into(),
            }
            .into();
        }

        match self.promote(username, public_key) {
            Ok(true) => self.own_key().into(),
            Ok(false) => Envelope::KeyExchangeAck {
                username: self.config.username.clone(),
            }
            .into(),
            Err(e) => {
                warn!("rejecting key exchange from {}: {}", username, e);
                Envelope::Error {
                    detail: format!("key exchange rejected: {e}"),
                }
                .into()
            }
        }
    }

    fn on_delivery(&self, envelope: Envelope) {
        let connected = envelope
            .sender()
            .map(|name| self.directory().state_of(name) == ConnectionState::Connected);
        match (connected, envelope.sender()) {
            (Some(true), _) => {}
            (_, Some(name)) => warn!("{} from {} who is not connected", envelope.kind(), name),
            (_, None) => warn!("{} from an unnamed sender", envelope.kind()),
        }
        self.emit(PeerEvent::MessageReceived(Inbound::Envelope(envelope)));
    }

    fn on_disconnect(&self, username: &str) {
        let removed = {
            let mut dir = self.directory();
            match dir.state_of(username) {
                ConnectionState::Connected => dir.remove_connected(username).ok(),
                ConnectionState::Idle | ConnectionState::Failed => None,
                _ => dir.fail(username),
            }
        };
        match removed {
            Some(record) => {
                info!("{} disconnected while {}", username, record.state);
                self.changed.notify_waiters();
                self.status(username, false, Some("peer disconnected"));
            }
            None => debug!("disconnect from unknown peer {}", username),
        }
    }
}

fn reply_kind(reply: &Reply) -> &'static str {
    match reply {
        Reply::Ack => parley_common::ACK_TOKEN,
        Reply::Envelope(envelope) => envelope.kind(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
