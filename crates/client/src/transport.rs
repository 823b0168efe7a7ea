//! TCP and TLS dialing.

use std::{pin::Pin, sync::Arc, time::Duration};

use tern_types::{ErrorClass, ServerDescriptor, TernError, TernResult};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_rustls::{
    TlsConnector,
    rustls::{
        self, ClientConfig, DigitallySignedStruct, SignatureScheme,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        crypto::{CryptoProvider, ring},
        pki_types::{CertificateDer, ServerName, UnixTime},
    },
};

pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// A plain or TLS-wrapped socket.
pub(crate) type BoxedStream = Pin<Box<dyn AsyncStream>>;

/// Electrum servers overwhelmingly run self-signed certificates, so the
/// chain is not validated; handshake signatures still are.
#[derive(Debug)]
struct AcceptAnyCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

fn tls_connector(server: &str) -> TernResult<TlsConnector> {
    let provider = Arc::new(ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_error(server, &e))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert { provider }))
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

fn tls_error(server: &str, err: &dyn std::fmt::Display) -> TernError {
    TernError::Connection {
        server: server.to_string(),
        class: ErrorClass::TlsError,
        message: err.to_string(),
    }
}

/// Open a socket to `server`, wrapping it in TLS when the descriptor asks
/// for it. The whole dial, TLS included, is bounded by `timeout`.
pub(crate) async fn dial(server: &ServerDescriptor, timeout: Duration) -> TernResult<BoxedStream> {
    let key = server.key();
    let connect = async {
        let tcp = TcpStream::connect((server.host.as_str(), server.port))
            .await
            .map_err(|e| TernError::from_io(&key, &e))?;
        let _ = tcp.set_nodelay(true);
        if !server.tls {
            return Ok(Box::pin(tcp) as BoxedStream);
        }

        let name = ServerName::try_from(server.host.clone()).map_err(|e| tls_error(&key, &e))?;
        let stream = tls_connector(&key)?.connect(name, tcp).await.map_err(|e| {
            let class = ErrorClass::classify_io(&e);
            let class = if class == ErrorClass::ServerError { ErrorClass::TlsError } else { class };
            TernError::Connection { server: key.clone(), class, message: e.to_string() }
        })?;
        Ok(Box::pin(stream) as BoxedStream)
    };

    match tokio::time::timeout(timeout, connect).await {
        Ok(result) => result,
        Err(_) => Err(TernError::Connection {
            server: key,
            class: ErrorClass::Timeout,
            message: format!("connect timed out after {timeout:?}"),
        }),
    }
}
