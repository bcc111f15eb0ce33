//! QUIC transport for both server channels.
//!
//! Every request and every watch registration travels on its own bidirectional stream: the client
//! writes one bincode frame and finishes its half, the server answers with one frame and finishes
//! its half. Connection tasks only move bytes; all state lives behind the [`ServerHandle`].

use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use quinn::crypto::rustls::QuicClientConfig as QuinnRustlsClientConfig;
use quinn::{ClientConfig as QuinnClientConfig, Connection, Endpoint, RecvStream, SendStream, ServerConfig};
use rcgen::generate_simple_self_signed;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, UnixTime};
use rustls::{ClientConfig as RustlsClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::client::{ClientError, Transport};
use crate::error::ServerError;
use crate::event::EncodedRecord;
use crate::ids::{NamespaceId, OriginId};
use crate::protocol::{self, Command, Reply, ReplyPayload, Request, WatchRegistration, WatchReply};
use crate::server::ServerHandle;

/// Name both sides put in the TLS handshake.
const SERVER_NAME: &str = "localhost";

/// Creates a QUIC endpoint bound to `addr` that accepts connections with a fresh self-signed
/// certificate.
///
/// The client side of every endpoint built here skips certificate verification, so traffic is
/// encrypted but not authenticated. Bind to loopback unless the network is trusted.
pub fn make_server_endpoint(addr: SocketAddr) -> Result<Endpoint> {
    let server_config = make_server_config()?;
    let mut endpoint = Endpoint::server(server_config, addr)?;
    endpoint.set_default_client_config(make_client_config()?);
    Ok(endpoint)
}

/// Creates a dial-only endpoint on an ephemeral local port.
pub fn make_client_endpoint() -> Result<Endpoint> {
    let mut endpoint = Endpoint::client(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))?;
    endpoint.set_default_client_config(make_client_config()?);
    Ok(endpoint)
}

fn make_server_config() -> Result<ServerConfig> {
    let cert = generate_simple_self_signed([SERVER_NAME.to_string()])?;
    let cert_der: CertificateDer<'static> = CertificateDer::from(cert.cert.der().clone());
    let key_der: PrivateKeyDer<'static> = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()).into();

    let mut server_config = quinn::ServerConfig::with_single_cert(vec![cert_der], key_der)?;
    let mut transport = quinn::TransportConfig::default();
    transport.keep_alive_interval(Some(Duration::from_secs(10)));
    server_config.transport_config(Arc::new(transport));

    Ok(server_config)
}

fn make_client_config() -> Result<QuinnClientConfig> {
    let mut client_config = RustlsClientConfig::builder()
        .with_root_certificates(RootCertStore::empty())
        .with_no_client_auth();
    client_config
        .dangerous()
        .set_certificate_verifier(Arc::new(SkipServerVerification));

    let client_crypto = QuinnRustlsClientConfig::try_from(Arc::new(client_config))?;
    let mut config = QuinnClientConfig::new(Arc::new(client_crypto));
    let mut transport = quinn::TransportConfig::default();
    transport.keep_alive_interval(Some(Duration::from_secs(10)));
    config.transport_config(Arc::new(transport));
    Ok(config)
}

#[derive(Debug)]
struct SkipServerVerification;

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PKCS1_SHA256,
        ]
    }
}

/// Which server channel an endpoint serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    State,
    Watch,
}

/// Accept loop for one channel's endpoint.
pub struct Network {
    endpoint: Endpoint,
    channel: Channel,
    server: ServerHandle,
    max_frame_bytes: usize,
}

impl Network {
    pub fn new(endpoint: Endpoint, channel: Channel, server: ServerHandle, max_frame_bytes: usize) -> Self {
        Self {
            endpoint,
            channel,
            server,
            max_frame_bytes,
        }
    }

    /// Accepts connections until the endpoint is closed, serving each on its own task.
    pub async fn run(self) -> Result<()> {
        tracing::info!(channel = ?self.channel, addr = %self.endpoint.local_addr()?, "listening");
        while let Some(incoming) = self.endpoint.accept().await {
            let server = self.server.clone();
            let channel = self.channel;
            let max_frame_bytes = self.max_frame_bytes;
            tokio::spawn(async move {
                if let Err(err) = handle_connection(incoming, channel, server, max_frame_bytes).await {
                    tracing::warn!(?channel, "connection error: {err:#}");
                }
            });
        }
        tracing::info!(channel = ?self.channel, "endpoint closed");
        Ok(())
    }
}

async fn handle_connection(
    incoming: quinn::Incoming,
    channel: Channel,
    server: ServerHandle,
    max_frame_bytes: usize,
) -> Result<()> {
    let connection = incoming.await?;
    let remote = connection.remote_address();
    tracing::debug!(%remote, ?channel, "connected");

    loop {
        let (send, recv) = match connection.accept_bi().await {
            Ok(streams) => streams,
            Err(
                quinn::ConnectionError::ApplicationClosed(_)
                | quinn::ConnectionError::LocallyClosed
                | quinn::ConnectionError::TimedOut,
            ) => {
                tracing::debug!(%remote, ?channel, "disconnected");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let server = server.clone();
        tokio::spawn(async move {
            let served = match channel {
                Channel::State => serve_request(send, recv, &server, max_frame_bytes).await,
                Channel::Watch => serve_watch(send, recv, &server, max_frame_bytes).await,
            };
            if let Err(err) = served {
                tracing::debug!(%remote, ?channel, "stream ended early: {err:#}");
            }
        });
    }
}

/// Reads one whole frame, turning an oversized or truncated one into a protocol error for the peer.
async fn read_frame(recv: &mut RecvStream, max_frame_bytes: usize) -> Result<Vec<u8>, ServerError> {
    recv.read_to_end(max_frame_bytes).await.map_err(|err| {
        tracing::warn!(max_frame_bytes, "rejected frame: {err}");
        match err {
            quinn::ReadToEndError::TooLong => {
                ServerError::Protocol(format!("frame exceeds {max_frame_bytes} bytes"))
            }
            other => ServerError::Protocol(format!("unreadable frame: {other}")),
        }
    })
}

async fn write_frame(send: &mut SendStream, frame: &[u8]) -> Result<()> {
    send.write_all(frame).await?;
    send.finish()?;
    Ok(())
}

async fn serve_request(
    mut send: SendStream,
    mut recv: RecvStream,
    server: &ServerHandle,
    max_frame_bytes: usize,
) -> Result<()> {
    let decoded = read_frame(&mut recv, max_frame_bytes)
        .await
        .and_then(|frame| protocol::decode::<Request>(&frame));
    let reply: Reply = match decoded {
        Ok(request) => match server.request(request).await {
            Ok(reply) => reply,
            Err(err) => {
                tracing::debug!("server unavailable: {err}");
                return Ok(());
            }
        },
        Err(err) => Err(err),
    };
    let frame = protocol::encode(&reply)?;
    write_frame(&mut send, &frame).await
}

async fn serve_watch(
    mut send: SendStream,
    mut recv: RecvStream,
    server: &ServerHandle,
    max_frame_bytes: usize,
) -> Result<()> {
    let registration = match read_frame(&mut recv, max_frame_bytes)
        .await
        .and_then(|frame| protocol::decode::<WatchRegistration>(&frame))
    {
        Ok(registration) => registration,
        Err(err) => {
            let frame = protocol::encode(&WatchReply::Rejected(err))?;
            return write_frame(&mut send, &frame).await;
        }
    };

    let watcher = registration.watcher.clone();
    // A peer that gives up stops the stream; dropping the pending future closes the delivery
    // route and the server prunes the watch on its next pass.
    let record = tokio::select! {
        delivered = server.watch(registration) => delivered,
        _ = send.stopped() => {
            tracing::debug!(watcher = %watcher, "watcher went away");
            return Ok(());
        }
    };
    match record {
        Ok(record) => {
            let frame = protocol::encode(&WatchReply::Delivered(record.to_vec()))?;
            write_frame(&mut send, &frame).await
        }
        Err(err) => {
            tracing::debug!(watcher = %watcher, "delivery route closed: {err}");
            Ok(())
        }
    }
}

fn transport_error(err: impl Display) -> ClientError {
    ClientError::Transport(err.to_string())
}

/// Client side of the QUIC transport: one connection per server channel.
#[derive(Clone, Debug)]
pub struct RemoteTransport {
    state: Connection,
    watch: Connection,
    max_frame_bytes: usize,
}

impl RemoteTransport {
    /// Connects to the state channel at `state_address`, asks the server where its watch channel
    /// lives, and connects there too.
    pub async fn connect(
        endpoint: &Endpoint,
        state_address: SocketAddr,
        max_frame_bytes: usize,
    ) -> Result<Self, ClientError> {
        let state = dial(endpoint, state_address).await?;
        let request = Request {
            namespace: NamespaceId::default(),
            origin: OriginId::random(),
            command: Command::GetServerMeta,
        };
        let reply: Reply = bincode::deserialize(&exchange(&state, &bincode::serialize(&request)?, max_frame_bytes).await?)?;
        let meta = match reply? {
            ReplyPayload::ServerMeta(meta) => meta,
            reply => {
                return Err(ClientError::UnexpectedReply {
                    command: "get_server_meta",
                    reply,
                })
            }
        };

        let mut watch_address: SocketAddr = meta
            .watch_address
            .parse()
            .map_err(|err| transport_error(format!("bad watch address {:?}: {err}", meta.watch_address)))?;
        // A wildcard bind is reachable wherever the state channel was.
        if watch_address.ip().is_unspecified() {
            watch_address.set_ip(state_address.ip());
        }
        let watch = dial(endpoint, watch_address).await?;
        tracing::debug!(%state_address, %watch_address, version = %meta.version, "connected to server");

        Ok(Self {
            state,
            watch,
            max_frame_bytes,
        })
    }
}

async fn dial(endpoint: &Endpoint, address: SocketAddr) -> Result<Connection, ClientError> {
    endpoint
        .connect(address, SERVER_NAME)
        .map_err(transport_error)?
        .await
        .map_err(transport_error)
}

/// One frame out, one frame back, on a fresh stream.
async fn exchange(connection: &Connection, frame: &[u8], max_frame_bytes: usize) -> Result<Vec<u8>, ClientError> {
    let (mut send, mut recv) = connection.open_bi().await.map_err(transport_error)?;
    send.write_all(frame).await.map_err(transport_error)?;
    send.finish().map_err(transport_error)?;
    match recv.read_to_end(max_frame_bytes).await {
        Ok(reply) => Ok(reply),
        Err(quinn::ReadToEndError::Read(quinn::ReadError::ConnectionLost(_))) => Err(ClientError::Disconnected),
        Err(err) => Err(transport_error(err)),
    }
}

impl Transport for RemoteTransport {
    async fn call(&self, request: Request) -> Result<ReplyPayload, ClientError> {
        let frame = bincode::serialize(&request)?;
        let reply: Reply = bincode::deserialize(&exchange(&self.state, &frame, self.max_frame_bytes).await?)?;
        Ok(reply?)
    }

    async fn watch(&self, registration: WatchRegistration) -> Result<EncodedRecord, ClientError> {
        let frame = bincode::serialize(&registration)?;
        let reply: WatchReply = bincode::deserialize(&exchange(&self.watch, &frame, self.max_frame_bytes).await?)?;
        match reply {
            WatchReply::Delivered(record) => Ok(EncodedRecord::from(record)),
            WatchReply::Rejected(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::client::{Client, WatchOptions};
    use crate::clock::ManualClock;
    use crate::error::TransformError;
    use crate::protocol::ServerMeta;
    use crate::server::StateServer;
    use crate::value::Value;

    struct Harness {
        endpoint: Endpoint,
        state_address: SocketAddr,
        clock: ManualClock,
    }

    fn start(max_frame_bytes: usize) -> Harness {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let loopback: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let state = make_server_endpoint(loopback).unwrap();
        let watch = make_server_endpoint(loopback).unwrap();
        let state_address = state.local_addr().unwrap();
        let watch_address = watch.local_addr().unwrap();

        let clock = ManualClock::new(10.0);
        let meta = ServerMeta::new(state_address.to_string(), watch_address.to_string());
        let (handle, _task) = StateServer::spawn(meta, clock.clone());
        tokio::spawn(Network::new(state, Channel::State, handle.clone(), max_frame_bytes).run());
        tokio::spawn(Network::new(watch, Channel::Watch, handle, max_frame_bytes).run());

        Harness {
            endpoint: make_client_endpoint().unwrap(),
            state_address,
            clock,
        }
    }

    #[tokio::test]
    async fn remote_client_round_trip() {
        let harness = start(64 * 1024);
        let transport = timeout(
            Duration::from_secs(10),
            RemoteTransport::connect(&harness.endpoint, harness.state_address, 64 * 1024),
        )
        .await
        .expect("connect in time")
        .expect("connect");

        let writer = Client::new(transport.clone(), "jar");
        let reader = Client::new(transport, "jar");

        assert_eq!(writer.ping(b"hello".to_vec()).await.unwrap(), std::process::id());
        harness.clock.advance(1.0);
        writer.set("cookies", 3).await.unwrap();
        assert_eq!(reader.get("cookies").await.unwrap(), Value::Int(3));

        let mut changes = reader.changes(WatchOptions::since(10.0)).await.unwrap();
        let record = timeout(Duration::from_secs(10), changes.next())
            .await
            .expect("delivery in time")
            .expect("delivered")
            .expect("cursor has no limit");
        assert_eq!(record.after.get("cookies"), Some(&Value::Int(3)));
        assert_eq!(record.timestamp, 11.0);

        let err = writer.increment("missing", 1).await.unwrap_err();
        assert!(matches!(err, ClientError::Remote(ServerError::Transform(TransformError::Path(_)))));
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let harness = start(256);
        let transport = RemoteTransport::connect(&harness.endpoint, harness.state_address, 64 * 1024)
            .await
            .expect("connect");
        let client = Client::new(transport, "jar");

        let err = client.set("blob", "x".repeat(1024)).await.unwrap_err();
        assert!(matches!(err, ClientError::Remote(ServerError::Protocol(_))));
        assert_eq!(client.snapshot().await.unwrap(), Value::empty_map());
    }
}
