//! The TLS session layer.
//!
//! An [`Encryption`] session is a full-duplex state machine translating
//! between a plaintext stream and a ciphertext stream. The socket pushes
//! received ciphertext in and pops decrypted plaintext out; plaintext
//! submitted for transmission comes back out as ciphertext to be sent
//! through the ordinary send path. Handshake orchestration, certificate
//! validation, server-name dispatch, and the bidirectional close-notify
//! exchange all happen behind these four buffer operations.
//!
//! [`EncryptionContext`] captures the per-role configuration: trust
//! anchors, identity, and validation policy. [`EncryptionManager`] maps
//! server names to contexts with a default fallback; on the server side
//! it drives certificate selection during the handshake, which is how a
//! client's SNI transparently swaps the active context.

use bytes::{Buf, Bytes, BytesMut};
use fnv::FnvHashMap;
use std::convert::TryFrom;
use std::fmt;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use rustls::client::{ServerCertVerified, ServerCertVerifier, WebPkiVerifier};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{
    Certificate, ClientConfig, ClientConnection, Connection, PrivateKey, RootCertStore,
    ServerConfig, ServerConnection, ServerName,
};

use crate::options::UpgradeOptions;
use crate::record;
use crate::Error;

/// A DER-encoded X.509 certificate. Decoding the contents is delegated
/// to the cryptographic layer; this crate moves certificates around and
/// compares them byte-wise.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionCertificate {
    der: Vec<u8>,
}

impl EncryptionCertificate {
    pub fn from_der(der: Vec<u8>) -> Self {
        Self { der }
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }
}

impl From<Certificate> for EncryptionCertificate {
    fn from(certificate: Certificate) -> Self {
        Self {
            der: certificate.0,
        }
    }
}

impl fmt::Debug for EncryptionCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptionCertificate({} bytes)", self.der.len())
    }
}

/// Application-level hook run over the peer's certificate chain after
/// the cryptographic verification passed. Returning `false` fails the
/// handshake with an application-verification error.
pub type CertificateValidator = Arc<dyn Fn(&[EncryptionCertificate]) -> bool + Send + Sync>;

/// Certificate validation policy merged into the verifier.
#[derive(Clone, Default)]
pub struct EncryptionValidation {
    /// Names the peer certificate must match, tried in order; entries
    /// that parse as IP addresses are matched against IP constraints.
    /// Empty means the handshake's server name is used.
    pub hosts: Vec<String>,
    /// Accept a trust chain that terminates in the peer's own
    /// certificate.
    pub allow_self_signed: bool,
    pub validator: Option<CertificateValidator>,
}

impl fmt::Debug for EncryptionValidation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionValidation")
            .field("hosts", &self.hosts)
            .field("allow_self_signed", &self.allow_self_signed)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionRole {
    Client,
    Server,
}

/// Per-role TLS configuration: trust anchors, identity, validation
/// policy.
pub struct EncryptionContext {
    role: EncryptionRole,
    trusted: Vec<EncryptionCertificate>,
    chain: Vec<EncryptionCertificate>,
    private_key: Option<Vec<u8>>,
    validation: EncryptionValidation,
    certified_key: Option<Arc<CertifiedKey>>,
}

impl EncryptionContext {
    pub fn role(&self) -> EncryptionRole {
        self.role
    }

    pub fn validation(&self) -> &EncryptionValidation {
        &self.validation
    }

    /// The identity presented to peers, when configured.
    pub fn certificate(&self) -> Option<&EncryptionCertificate> {
        self.chain.first()
    }

    fn certified_key(&self) -> Option<Arc<CertifiedKey>> {
        self.certified_key.clone()
    }

    fn client_config(
        &self,
        validation_override: Option<&EncryptionValidation>,
    ) -> Result<Arc<ClientConfig>, Error> {
        let mut roots = RootCertStore::empty();
        for trusted in &self.trusted {
            roots
                .add(&Certificate(trusted.der.clone()))
                .map_err(|_| Error::NotAuthorized)?;
        }
        let builder = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots.clone());
        let mut config = match self.private_key {
            Some(ref key) => {
                let chain = self
                    .chain
                    .iter()
                    .map(|certificate| Certificate(certificate.der.clone()))
                    .collect();
                builder
                    .with_client_auth_cert(chain, PrivateKey(key.clone()))
                    .map_err(|_| Error::NotAuthorized)?
            }
            None => builder.with_no_client_auth(),
        };
        let validation = validation_override.unwrap_or(&self.validation).clone();
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(PolicyVerifier::new(roots, validation)));
        Ok(Arc::new(config))
    }

    fn server_config(
        self: &Arc<Self>,
        factory: Option<Arc<dyn EncryptionContextFactory>>,
    ) -> Result<Arc<ServerConfig>, Error> {
        let resolver = SniCertResolver {
            factory,
            fallback: self.clone(),
        };
        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(resolver));
        Ok(Arc::new(config))
    }
}

/// Assembles an [`EncryptionContext`].
pub struct EncryptionContextBuilder {
    role: EncryptionRole,
    trusted: Vec<EncryptionCertificate>,
    chain: Vec<EncryptionCertificate>,
    private_key: Option<Vec<u8>>,
    validation: EncryptionValidation,
}

impl EncryptionContextBuilder {
    pub fn new(role: EncryptionRole) -> Self {
        Self {
            role,
            trusted: Vec::new(),
            chain: Vec::new(),
            private_key: None,
            validation: EncryptionValidation::default(),
        }
    }

    /// Add a trust anchor for peer verification.
    pub fn add_trusted(mut self, certificate: EncryptionCertificate) -> Self {
        self.trusted.push(certificate);
        self
    }

    /// Set the identity presented to peers: a certificate chain (leaf
    /// first) and its DER-encoded private key.
    pub fn identity(mut self, chain: Vec<EncryptionCertificate>, private_key_der: Vec<u8>) -> Self {
        self.chain = chain;
        self.private_key = Some(private_key_der);
        self
    }

    pub fn validation(mut self, validation: EncryptionValidation) -> Self {
        self.validation = validation;
        self
    }

    pub fn build(self) -> Result<Arc<EncryptionContext>, Error> {
        let certified_key = match (self.role, &self.private_key) {
            (EncryptionRole::Server, None) => return Err(Error::Invalid),
            (_, Some(key)) => {
                let signing_key = rustls::sign::any_supported_type(&PrivateKey(key.clone()))
                    .map_err(|_| Error::NotAuthorized)?;
                let chain = self
                    .chain
                    .iter()
                    .map(|certificate| Certificate(certificate.der.clone()))
                    .collect();
                Some(Arc::new(CertifiedKey::new(chain, signing_key)))
            }
            (_, None) => None,
        };
        Ok(Arc::new(EncryptionContext {
            role: self.role,
            trusted: self.trusted,
            chain: self.chain,
            private_key: self.private_key,
            validation: self.validation,
            certified_key,
        }))
    }
}

/// Maps a requested server name to the context that should serve it.
pub trait EncryptionContextFactory: Send + Sync {
    fn lookup(&self, server_name: &str) -> Option<Arc<EncryptionContext>>;
    fn fallback(&self) -> Option<Arc<EncryptionContext>>;
}

struct ManagerState {
    contexts: FnvHashMap<String, Arc<EncryptionContext>>,
    default_context: Option<Arc<EncryptionContext>>,
}

/// Registry of server contexts keyed by server name, with a default
/// fallback for unknown or absent names.
pub struct EncryptionManager {
    state: Mutex<ManagerState>,
}

impl EncryptionManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ManagerState {
                contexts: FnvHashMap::default(),
                default_context: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn set_default_context(&self, context: Arc<EncryptionContext>) {
        self.lock().default_context = Some(context);
    }

    pub fn add_context(&self, server_name: &str, context: Arc<EncryptionContext>) {
        self.lock().contexts.insert(server_name.into(), context);
    }

    pub fn remove_context(&self, server_name: &str) -> bool {
        self.lock().contexts.remove(server_name).is_some()
    }
}

impl Default for EncryptionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EncryptionContextFactory for EncryptionManager {
    fn lookup(&self, server_name: &str) -> Option<Arc<EncryptionContext>> {
        self.lock().contexts.get(server_name).cloned()
    }

    fn fallback(&self) -> Option<Arc<EncryptionContext>> {
        self.lock().default_context.clone()
    }
}

/// Certificate selection during the server handshake: the requested
/// name picks the matching context, anything else falls back to the
/// default. The swap is invisible to the user.
struct SniCertResolver {
    factory: Option<Arc<dyn EncryptionContextFactory>>,
    fallback: Arc<EncryptionContext>,
}

impl SniCertResolver {
    fn select(&self, server_name: Option<&str>) -> Arc<EncryptionContext> {
        if let Some(factory) = &self.factory {
            if let Some(context) = server_name.and_then(|name| factory.lookup(name)) {
                return context;
            }
            if let Some(context) = factory.fallback() {
                return context;
            }
        }
        self.fallback.clone()
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.select(client_hello.server_name()).certified_key()
    }
}

/// The merged validation policy applied when the engine requests
/// verification: chain verification against the context's trust
/// anchors, host overrides, the self-signed waiver, and the
/// application-level validator.
struct PolicyVerifier {
    inner: WebPkiVerifier,
    validation: EncryptionValidation,
}

impl PolicyVerifier {
    fn new(roots: RootCertStore, validation: EncryptionValidation) -> Self {
        Self {
            inner: WebPkiVerifier::new(roots, None),
            validation,
        }
    }
}

impl ServerCertVerifier for PolicyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        intermediates: &[Certificate],
        server_name: &ServerName,
        scts: &mut dyn Iterator<Item = &[u8]>,
        ocsp_response: &[u8],
        now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let result = if self.validation.hosts.is_empty() {
            self.inner.verify_server_cert(
                end_entity,
                intermediates,
                server_name,
                scts,
                ocsp_response,
                now,
            )
        } else {
            let mut outcome = Err(rustls::Error::General("no usable host entry".into()));
            for host in &self.validation.hosts {
                let candidate = match ServerName::try_from(host.as_str()) {
                    Ok(candidate) => candidate,
                    Err(_) => continue,
                };
                outcome = self.inner.verify_server_cert(
                    end_entity,
                    intermediates,
                    &candidate,
                    &mut std::iter::empty(),
                    ocsp_response,
                    now,
                );
                if outcome.is_ok() {
                    break;
                }
            }
            outcome
        };
        match result {
            Ok(_) => {}
            Err(rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer))
                if self.validation.allow_self_signed => {}
            Err(error) => return Err(error),
        }
        if let Some(validator) = &self.validation.validator {
            let mut chain = Vec::with_capacity(1 + intermediates.len());
            chain.push(EncryptionCertificate::from(end_entity.clone()));
            chain.extend(
                intermediates
                    .iter()
                    .map(|certificate| EncryptionCertificate::from(certificate.clone())),
            );
            if !validator(&chain) {
                return Err(rustls::Error::InvalidCertificate(
                    rustls::CertificateError::ApplicationVerificationFailure,
                ));
            }
        }
        Ok(ServerCertVerified::assertion())
    }
}

/// The one-shot result of a handshake.
#[derive(Debug, Clone)]
pub struct HandshakeOutcome {
    pub error: Option<Error>,
    pub details: String,
    pub remote_certificate: Option<EncryptionCertificate>,
}

pub type HandshakeCallback = Box<dyn FnOnce(&HandshakeOutcome) + Send>;

struct EncryptionState {
    connection: Option<Connection>,
    options: UpgradeOptions,
    server_name: Option<String>,
    incoming_ciphertext: BytesMut,
    incoming_plaintext: BytesMut,
    outgoing_plaintext: BytesMut,
    incoming_leftovers: Option<BytesMut>,
    outgoing_leftovers: Option<BytesMut>,
    handshake_complete: bool,
    handshake_failed: Option<(Error, String)>,
    pending_outcome: Option<HandshakeOutcome>,
    handshake_callback: Option<HandshakeCallback>,
    shutdown_sent: bool,
    shutdown_received: bool,
    source_certificate: Option<EncryptionCertificate>,
    remote_certificate: Option<EncryptionCertificate>,
}

enum EncryptionConfig {
    Client(Arc<EncryptionContext>),
    Server {
        context: Arc<EncryptionContext>,
        factory: Option<Arc<dyn EncryptionContextFactory>>,
    },
}

/// A TLS session: the bidirectional translator between a plaintext
/// stream and a ciphertext stream.
pub struct Encryption {
    config: EncryptionConfig,
    state: Mutex<EncryptionState>,
}

impl Encryption {
    /// A client session authenticating servers against `context`.
    pub fn client(context: Arc<EncryptionContext>) -> Self {
        Self::new(EncryptionConfig::Client(context))
    }

    /// A server session presenting `context`'s identity.
    pub fn server(context: Arc<EncryptionContext>) -> Self {
        Self::new(EncryptionConfig::Server {
            context,
            factory: None,
        })
    }

    /// A server session dispatching on the requested server name
    /// through `factory`, presenting `fallback` for unmatched names.
    pub fn server_with_factory(
        fallback: Arc<EncryptionContext>,
        factory: Arc<dyn EncryptionContextFactory>,
    ) -> Self {
        Self::new(EncryptionConfig::Server {
            context: fallback,
            factory: Some(factory),
        })
    }

    fn new(config: EncryptionConfig) -> Self {
        Self {
            config,
            state: Mutex::new(EncryptionState {
                connection: None,
                options: UpgradeOptions::default(),
                server_name: None,
                incoming_ciphertext: BytesMut::new(),
                incoming_plaintext: BytesMut::new(),
                outgoing_plaintext: BytesMut::new(),
                incoming_leftovers: None,
                outgoing_leftovers: None,
                handshake_complete: false,
                handshake_failed: None,
                pending_outcome: None,
                handshake_callback: None,
                shutdown_sent: false,
                shutdown_received: false,
                source_certificate: None,
                remote_certificate: None,
            }),
        }
    }

    pub fn role(&self) -> EncryptionRole {
        match self.config {
            EncryptionConfig::Client(_) => EncryptionRole::Client,
            EncryptionConfig::Server { .. } => EncryptionRole::Server,
        }
    }

    fn lock(&self) -> MutexGuard<'_, EncryptionState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Begin the handshake. Clients require `options.server_name`. The
    /// optional callback fires exactly once when the handshake
    /// completes or fails; alternatively the outcome may be polled with
    /// [`Encryption::take_handshake_outcome`].
    pub fn initiate_handshake(
        &self,
        options: &UpgradeOptions,
        callback: Option<HandshakeCallback>,
    ) -> Result<(), Error> {
        let result = {
            let mut state = self.lock();
            if state.connection.is_some() {
                return Err(Error::Invalid);
            }
            state.options = options.clone();
            state.handshake_callback = callback;
            let connection = match self.config {
                EncryptionConfig::Client(ref context) => {
                    let name = match options.server_name {
                        Some(ref name) => name.clone(),
                        None => return Err(Error::Invalid),
                    };
                    let server_name =
                        ServerName::try_from(name.as_str()).map_err(|_| Error::Invalid)?;
                    let config = context.client_config(options.validation.as_ref())?;
                    state.server_name = Some(name);
                    state.source_certificate = context.certificate().cloned();
                    Connection::Client(
                        ClientConnection::new(config, server_name).map_err(|_| Error::Invalid)?,
                    )
                }
                EncryptionConfig::Server {
                    ref context,
                    ref factory,
                } => {
                    let config = context.server_config(factory.clone())?;
                    Connection::Server(
                        ServerConnection::new(config).map_err(|_| Error::Invalid)?,
                    )
                }
            };
            let mut connection = connection;
            connection.set_buffer_limit(None);
            state.connection = Some(connection);
            self.process(&mut state)
        };
        self.announce();
        result
    }

    /// Feed bytes received from the transport. When the upgrade keeps
    /// incoming leftovers, the buffer is scanned record by record and
    /// everything after the first byte that fails to begin a valid
    /// record is diverted before the engine sees it.
    pub fn push_incoming_cipher_text(&self, data: &[u8]) -> Result<(), Error> {
        let result = {
            let mut state = self.lock();
            state.incoming_ciphertext.extend_from_slice(data);
            if state.options.keep_incoming_leftovers {
                let boundary = record::scan_boundary(&state.incoming_ciphertext);
                if boundary < state.incoming_ciphertext.len() {
                    let tail = state.incoming_ciphertext.split_off(boundary);
                    state
                        .incoming_leftovers
                        .get_or_insert_with(BytesMut::new)
                        .extend_from_slice(&tail);
                }
            }
            self.process(&mut state)
        };
        self.announce();
        result
    }

    pub fn has_incoming_plain_text(&self) -> bool {
        !self.lock().incoming_plaintext.is_empty()
    }

    /// Drain decrypted plaintext into `out`.
    pub fn pop_incoming_plain_text(&self, out: &mut BytesMut) -> Result<(), Error> {
        let mut state = self.lock();
        let len = state.incoming_plaintext.len();
        let plaintext = state.incoming_plaintext.split_to(len);
        out.extend_from_slice(&plaintext);
        Ok(())
    }

    /// Submit plaintext for transmission. During the handshake, with
    /// `keep_outgoing_leftovers` set, the bytes are diverted and only
    /// re-submitted once the handshake succeeds.
    pub fn push_outgoing_plain_text(&self, data: &[u8]) -> Result<(), Error> {
        let result = {
            let mut state = self.lock();
            if state.connection.is_none() {
                return Err(Error::Invalid);
            }
            if !state.handshake_complete && state.options.keep_outgoing_leftovers {
                state
                    .outgoing_leftovers
                    .get_or_insert_with(BytesMut::new)
                    .extend_from_slice(data);
                return Ok(());
            }
            state.outgoing_plaintext.extend_from_slice(data);
            self.process(&mut state)
        };
        self.announce();
        result
    }

    pub fn has_outgoing_cipher_text(&self) -> bool {
        self.lock()
            .connection
            .as_ref()
            .map(|connection| connection.wants_write())
            .unwrap_or(false)
    }

    /// Drain pending ciphertext (handshake records, application records,
    /// close-notify) into `out` for transmission.
    pub fn pop_outgoing_cipher_text(&self, out: &mut BytesMut) -> Result<(), Error> {
        let mut state = self.lock();
        let connection = match state.connection.as_mut() {
            Some(connection) => connection,
            None => return Err(Error::Invalid),
        };
        let mut staged = Vec::new();
        while connection.wants_write() {
            connection
                .write_tls(&mut staged)
                .map_err(|_| Error::Invalid)?;
        }
        out.extend_from_slice(&staged);
        Ok(())
    }

    /// Initiate (or acknowledge) the close-notify exchange. The
    /// resulting alert becomes pending outgoing ciphertext.
    pub fn shutdown(&self) -> Result<(), Error> {
        let mut state = self.lock();
        if state.shutdown_sent {
            return Ok(());
        }
        let connection = match state.connection.as_mut() {
            Some(connection) => connection,
            None => return Err(Error::Invalid),
        };
        connection.send_close_notify();
        state.shutdown_sent = true;
        Ok(())
    }

    pub fn is_handshake_finished(&self) -> bool {
        self.lock().handshake_complete
    }

    /// Claim the one-shot handshake outcome, if it is ready and has not
    /// been claimed.
    pub fn take_handshake_outcome(&self) -> Option<HandshakeOutcome> {
        self.lock().pending_outcome.take()
    }

    pub fn is_shutdown_sent(&self) -> bool {
        self.lock().shutdown_sent
    }

    pub fn is_shutdown_received(&self) -> bool {
        self.lock().shutdown_received
    }

    /// Both close-notify directions have been exchanged. This may
    /// become true before all incoming plaintext has been drained;
    /// callers drain plaintext first.
    pub fn is_shutdown_finished(&self) -> bool {
        let state = self.lock();
        state.shutdown_sent && state.shutdown_received
    }

    pub fn source_certificate(&self) -> Option<EncryptionCertificate> {
        self.lock().source_certificate.clone()
    }

    pub fn remote_certificate(&self) -> Option<EncryptionCertificate> {
        self.lock().remote_certificate.clone()
    }

    /// The server name in effect: the client's requested name, or the
    /// name the engine observed in the client hello.
    pub fn server_name(&self) -> Option<String> {
        self.lock().server_name.clone()
    }

    /// Drain bytes that trailed the final TLS record, available once
    /// the downgrade is complete.
    pub fn pop_incoming_leftovers(&self, out: &mut BytesMut) -> Result<(), Error> {
        let mut state = self.lock();
        if let Some(mut leftovers) = state.incoming_leftovers.take() {
            out.extend_from_slice(&leftovers.split_to(leftovers.len()));
        }
        Ok(())
    }

    /// Reclaim plaintext diverted during a failed handshake.
    pub fn pop_outgoing_leftovers(&self) -> Option<Bytes> {
        self.lock()
            .outgoing_leftovers
            .take()
            .map(BytesMut::freeze)
    }

    /// Run the engine: feed staged ciphertext, step the handshake,
    /// write staged plaintext, and drain decrypted plaintext.
    fn process(&self, state: &mut EncryptionState) -> Result<(), Error> {
        let was_handshaking = !state.handshake_complete;
        let connection = match state.connection.as_mut() {
            Some(connection) => connection,
            None => return Err(Error::Invalid),
        };

        while !state.incoming_ciphertext.is_empty() && wants_read(connection) {
            let consumed = {
                let mut cursor = &state.incoming_ciphertext[..];
                connection.read_tls(&mut cursor).map_err(|_| Error::Invalid)?
            };
            if consumed == 0 {
                break;
            }
            state.incoming_ciphertext.advance(consumed);
            match connection.process_new_packets() {
                Ok(io_state) => {
                    if io_state.peer_has_closed() {
                        state.shutdown_received = true;
                    }
                }
                Err(error) => {
                    let mapped = map_engine_error(&error);
                    let details = error.to_string();
                    if was_handshaking && state.handshake_failed.is_none() {
                        state.handshake_failed = Some((mapped, details.clone()));
                        state.pending_outcome = Some(HandshakeOutcome {
                            error: Some(mapped),
                            details,
                            remote_certificate: None,
                        });
                    }
                    return Err(mapped);
                }
            }
        }

        if was_handshaking && !connection.is_handshaking() && state.handshake_failed.is_none() {
            state.handshake_complete = true;
            state.remote_certificate = connection
                .peer_certificates()
                .and_then(|certificates| certificates.first().cloned())
                .map(EncryptionCertificate::from);
            match *connection {
                Connection::Server(ref server) => {
                    state.server_name = server.server_name().map(str::to_string);
                    if let EncryptionConfig::Server {
                        ref context,
                        ref factory,
                    } = self.config
                    {
                        let selected = state
                            .server_name
                            .as_deref()
                            .and_then(|name| {
                                factory.as_ref().and_then(|factory| factory.lookup(name))
                            })
                            .or_else(|| factory.as_ref().and_then(|factory| factory.fallback()))
                            .unwrap_or_else(|| context.clone());
                        state.source_certificate = selected.certificate().cloned();
                    }
                }
                Connection::Client(_) => {}
            }
            if let Some(leftovers) = state.outgoing_leftovers.take() {
                let mut combined = BytesMut::with_capacity(
                    leftovers.len() + state.outgoing_plaintext.len(),
                );
                combined.extend_from_slice(&leftovers);
                combined.extend_from_slice(&state.outgoing_plaintext);
                state.outgoing_plaintext = combined;
            }
            state.pending_outcome = Some(HandshakeOutcome {
                error: None,
                details: String::new(),
                remote_certificate: state.remote_certificate.clone(),
            });
        }

        if state.handshake_complete {
            while !state.outgoing_plaintext.is_empty() {
                let written = connection
                    .writer()
                    .write(&state.outgoing_plaintext[..])
                    .map_err(|_| Error::Invalid)?;
                if written == 0 {
                    break;
                }
                state.outgoing_plaintext.advance(written);
            }
        }

        loop {
            let mut buffer = [0u8; 4096];
            match connection.reader().read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => state.incoming_plaintext.extend_from_slice(&buffer[..read]),
                Err(ref error) if error.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }

        Ok(())
    }

    /// Invoke the one-shot handshake callback outside the session
    /// mutex.
    fn announce(&self) {
        let announcement = {
            let mut state = self.lock();
            if state.pending_outcome.is_some() && state.handshake_callback.is_some() {
                let outcome = state.pending_outcome.take();
                let callback = state.handshake_callback.take();
                match (callback, outcome) {
                    (Some(callback), Some(outcome)) => Some((callback, outcome)),
                    _ => None,
                }
            } else {
                None
            }
        };
        if let Some((callback, outcome)) = announcement {
            callback(&outcome);
        }
    }
}

fn wants_read(connection: &Connection) -> bool {
    match *connection {
        Connection::Client(ref client) => client.wants_read(),
        Connection::Server(ref server) => server.wants_read(),
    }
}

fn map_engine_error(error: &rustls::Error) -> Error {
    match error {
        rustls::Error::InvalidCertificate(_) => Error::NotAuthorized,
        rustls::Error::AlertReceived(alert) => match alert {
            rustls::AlertDescription::BadCertificate
            | rustls::AlertDescription::UnsupportedCertificate
            | rustls::AlertDescription::CertificateRevoked
            | rustls::AlertDescription::CertificateExpired
            | rustls::AlertDescription::CertificateUnknown
            | rustls::AlertDescription::UnknownCA
            | rustls::AlertDescription::AccessDenied => Error::NotAuthorized,
            _ => Error::Invalid,
        },
        _ => Error::Invalid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ContentType, RecordHeader};

    fn certificate_for(names: &[&str]) -> (EncryptionCertificate, Vec<u8>) {
        let names: Vec<String> = names.iter().map(|name| name.to_string()).collect();
        let generated = rcgen::generate_simple_self_signed(names).unwrap();
        (
            EncryptionCertificate::from_der(generated.serialize_der().unwrap()),
            generated.serialize_private_key_der(),
        )
    }

    fn server_context(names: &[&str]) -> (Arc<EncryptionContext>, EncryptionCertificate) {
        let (certificate, key) = certificate_for(names);
        let context = EncryptionContextBuilder::new(EncryptionRole::Server)
            .identity(vec![certificate.clone()], key)
            .build()
            .unwrap();
        (context, certificate)
    }

    fn client_context(validation: EncryptionValidation) -> Arc<EncryptionContext> {
        EncryptionContextBuilder::new(EncryptionRole::Client)
            .validation(validation)
            .build()
            .unwrap()
    }

    fn permissive_client_context() -> Arc<EncryptionContext> {
        client_context(EncryptionValidation {
            allow_self_signed: true,
            ..EncryptionValidation::default()
        })
    }

    /// Shuttle ciphertext both ways until neither side has output.
    fn pump(client: &Encryption, server: &Encryption) -> Result<(), Error> {
        for _ in 0..32 {
            let mut moved = false;
            let mut buffer = BytesMut::new();
            if client.has_outgoing_cipher_text() {
                client.pop_outgoing_cipher_text(&mut buffer)?;
                if !buffer.is_empty() {
                    server.push_incoming_cipher_text(&buffer)?;
                    moved = true;
                }
            }
            let mut buffer = BytesMut::new();
            if server.has_outgoing_cipher_text() {
                server.pop_outgoing_cipher_text(&mut buffer)?;
                if !buffer.is_empty() {
                    client.push_incoming_cipher_text(&buffer)?;
                    moved = true;
                }
            }
            if !moved {
                return Ok(());
            }
        }
        Ok(())
    }

    fn handshake_pair(
        client_options: UpgradeOptions,
    ) -> (Encryption, Encryption, EncryptionCertificate) {
        let (server_ctx, server_cert) = server_context(&["example.test"]);
        let client = Encryption::client(permissive_client_context());
        let server = Encryption::server(server_ctx);
        let options = UpgradeOptions {
            server_name: Some("example.test".into()),
            ..client_options
        };
        client.initiate_handshake(&options, None).unwrap();
        server
            .initiate_handshake(&UpgradeOptions::default(), None)
            .unwrap();
        pump(&client, &server).unwrap();
        (client, server, server_cert)
    }

    #[test]
    fn handshake_completes_and_exposes_certificates() {
        let (client, server, server_cert) = handshake_pair(UpgradeOptions::default());
        assert!(client.is_handshake_finished());
        assert!(server.is_handshake_finished());
        assert_eq!(client.remote_certificate(), Some(server_cert.clone()));
        assert_eq!(server.source_certificate(), Some(server_cert));
        assert_eq!(server.server_name().as_deref(), Some("example.test"));

        let outcome = client.take_handshake_outcome().unwrap();
        assert!(outcome.error.is_none());
        assert!(outcome.remote_certificate.is_some());
        assert!(client.take_handshake_outcome().is_none());
    }

    #[test]
    fn plaintext_round_trip() {
        let (client, server, _) = handshake_pair(UpgradeOptions::default());

        client.push_outgoing_plain_text(b"ping").unwrap();
        pump(&client, &server).unwrap();
        let mut received = BytesMut::new();
        assert!(server.has_incoming_plain_text());
        server.pop_incoming_plain_text(&mut received).unwrap();
        assert_eq!(&received[..], b"ping");

        server.push_outgoing_plain_text(b"pong").unwrap();
        pump(&client, &server).unwrap();
        let mut received = BytesMut::new();
        client.pop_incoming_plain_text(&mut received).unwrap();
        assert_eq!(&received[..], b"pong");
    }

    #[test]
    fn sni_dispatches_to_matching_context() {
        let (default_ctx, default_cert) = server_context(&["other.test"]);
        let (example_ctx, example_cert) = server_context(&["example.test"]);
        assert_ne!(default_cert, example_cert);

        let manager = Arc::new(EncryptionManager::new());
        manager.set_default_context(default_ctx.clone());
        manager.add_context("example.test", example_ctx);

        let client = Encryption::client(permissive_client_context());
        let server = Encryption::server_with_factory(default_ctx, manager);
        client
            .initiate_handshake(
                &UpgradeOptions {
                    server_name: Some("example.test".into()),
                    ..UpgradeOptions::default()
                },
                None,
            )
            .unwrap();
        server
            .initiate_handshake(&UpgradeOptions::default(), None)
            .unwrap();
        pump(&client, &server).unwrap();

        assert!(client.is_handshake_finished());
        assert_eq!(client.remote_certificate(), Some(example_cert.clone()));
        assert_eq!(server.source_certificate(), Some(example_cert));
        assert_eq!(server.server_name().as_deref(), Some("example.test"));
    }

    #[test]
    fn sni_falls_back_to_default_context() {
        let (default_ctx, default_cert) = server_context(&["unknown.test"]);
        let manager = Arc::new(EncryptionManager::new());
        manager.set_default_context(default_ctx.clone());

        let client = Encryption::client(permissive_client_context());
        let server = Encryption::server_with_factory(default_ctx, manager);
        client
            .initiate_handshake(
                &UpgradeOptions {
                    server_name: Some("unknown.test".into()),
                    ..UpgradeOptions::default()
                },
                None,
            )
            .unwrap();
        server
            .initiate_handshake(&UpgradeOptions::default(), None)
            .unwrap();
        pump(&client, &server).unwrap();
        assert_eq!(client.remote_certificate(), Some(default_cert));
    }

    #[test]
    fn untrusted_server_fails_without_waiver() {
        let (server_ctx, _) = server_context(&["example.test"]);
        let client = Encryption::client(client_context(EncryptionValidation::default()));
        let server = Encryption::server(server_ctx);
        client
            .initiate_handshake(
                &UpgradeOptions {
                    server_name: Some("example.test".into()),
                    ..UpgradeOptions::default()
                },
                None,
            )
            .unwrap();
        server
            .initiate_handshake(&UpgradeOptions::default(), None)
            .unwrap();

        let result = pump(&client, &server);
        assert_eq!(result, Err(Error::NotAuthorized));
        let outcome = client.take_handshake_outcome().unwrap();
        assert_eq!(outcome.error, Some(Error::NotAuthorized));
        assert!(!client.is_handshake_finished());
    }

    #[test]
    fn application_validator_can_reject() {
        let (server_ctx, _) = server_context(&["example.test"]);
        let client = Encryption::client(client_context(EncryptionValidation {
            allow_self_signed: true,
            validator: Some(Arc::new(|_chain| false)),
            ..EncryptionValidation::default()
        }));
        let server = Encryption::server(server_ctx);
        client
            .initiate_handshake(
                &UpgradeOptions {
                    server_name: Some("example.test".into()),
                    ..UpgradeOptions::default()
                },
                None,
            )
            .unwrap();
        server
            .initiate_handshake(&UpgradeOptions::default(), None)
            .unwrap();

        assert_eq!(pump(&client, &server), Err(Error::NotAuthorized));
    }

    #[test]
    fn application_validator_sees_chain() {
        let (server_ctx, server_cert) = server_context(&["example.test"]);
        let expected = server_cert.der().to_vec();
        let client = Encryption::client(client_context(EncryptionValidation {
            allow_self_signed: true,
            validator: Some(Arc::new(move |chain| {
                chain.first().map(EncryptionCertificate::der) == Some(&expected[..])
            })),
            ..EncryptionValidation::default()
        }));
        let server = Encryption::server(server_ctx);
        client
            .initiate_handshake(
                &UpgradeOptions {
                    server_name: Some("example.test".into()),
                    ..UpgradeOptions::default()
                },
                None,
            )
            .unwrap();
        server
            .initiate_handshake(&UpgradeOptions::default(), None)
            .unwrap();
        pump(&client, &server).unwrap();
        assert!(client.is_handshake_finished());
    }

    #[test]
    fn handshake_callback_fires_exactly_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = fired.clone();

        let (server_ctx, _) = server_context(&["example.test"]);
        let client = Encryption::client(permissive_client_context());
        let server = Encryption::server(server_ctx);
        client
            .initiate_handshake(
                &UpgradeOptions {
                    server_name: Some("example.test".into()),
                    ..UpgradeOptions::default()
                },
                Some(Box::new(move |outcome| {
                    assert!(outcome.error.is_none());
                    observed.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
        server
            .initiate_handshake(&UpgradeOptions::default(), None)
            .unwrap();
        pump(&client, &server).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn outgoing_leftovers_flush_on_handshake_success() {
        let (server_ctx, _) = server_context(&["example.test"]);
        let client = Encryption::client(permissive_client_context());
        let server = Encryption::server(server_ctx);
        client
            .initiate_handshake(
                &UpgradeOptions {
                    server_name: Some("example.test".into()),
                    keep_outgoing_leftovers: true,
                    ..UpgradeOptions::default()
                },
                None,
            )
            .unwrap();

        // Submitted mid-handshake, diverted rather than encrypted.
        client.push_outgoing_plain_text(b"early").unwrap();

        server
            .initiate_handshake(&UpgradeOptions::default(), None)
            .unwrap();
        pump(&client, &server).unwrap();
        assert!(client.is_handshake_finished());

        let mut received = BytesMut::new();
        server.pop_incoming_plain_text(&mut received).unwrap();
        assert_eq!(&received[..], b"early");
        assert!(client.pop_outgoing_leftovers().is_none());
    }

    #[test]
    fn bidirectional_close_notify() {
        let (client, server, _) = handshake_pair(UpgradeOptions::default());

        client.shutdown().unwrap();
        assert!(client.is_shutdown_sent());
        assert!(client.has_outgoing_cipher_text());
        pump(&client, &server).unwrap();
        assert!(server.is_shutdown_received());

        server.shutdown().unwrap();
        pump(&client, &server).unwrap();
        assert!(client.is_shutdown_received());
        assert!(client.is_shutdown_finished());
        assert!(server.is_shutdown_finished());

        // Repeating is a no-op.
        assert!(client.shutdown().is_ok());
    }

    #[test]
    fn incoming_leftovers_after_close_notify() {
        let (client, server, _) = handshake_pair(UpgradeOptions {
            keep_incoming_leftovers: true,
            ..UpgradeOptions::default()
        });

        server.push_outgoing_plain_text(b"data").unwrap();
        server.shutdown().unwrap();
        let mut wire = BytesMut::new();
        server.pop_outgoing_cipher_text(&mut wire).unwrap();

        // Plaintext concatenated after the close-notify in the same
        // transport segment.
        wire.extend_from_slice(b"post");
        client.push_incoming_cipher_text(&wire).unwrap();

        let mut plaintext = BytesMut::new();
        client.pop_incoming_plain_text(&mut plaintext).unwrap();
        assert_eq!(&plaintext[..], b"data");
        assert!(client.is_shutdown_received());

        let mut leftovers = BytesMut::new();
        client.pop_incoming_leftovers(&mut leftovers).unwrap();
        assert_eq!(&leftovers[..], b"post");
    }

    #[test]
    fn leftover_scan_ignores_record_shaped_payload() {
        // A buffer that is entirely well-formed records yields no
        // leftovers even when scanning is enabled.
        let header = RecordHeader {
            content_type: ContentType::ApplicationData,
            version: 0x0303,
            length: 3,
        };
        let mut wire = Vec::new();
        wire.extend_from_slice(&header.encode());
        wire.extend_from_slice(b"abc");
        assert_eq!(record::scan_boundary(&wire), wire.len());
    }
}
