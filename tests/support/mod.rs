use std::{
    fs::File,
    io::BufReader,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

use tlsgate::{GatewayConfig, SslGateway, SslRuntime};

// Loads the installed runtime the same way the binary does. `None` (with a
// note on stderr) when the machine has no usable OpenSSL.
#[allow(dead_code)]
pub fn system_runtime() -> Option<Arc<SslRuntime>> {
    let gateway = SslGateway::system(&GatewayConfig::from_env());
    match gateway.runtime() {
        Ok(runtime) => Some(runtime),
        Err(err) => {
            eprintln!("skipping: no ssl runtime installed ({err})");
            None
        }
    }
}

#[allow(dead_code)]
pub fn data_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("data")
        .join(name)
}

#[allow(dead_code)]
pub fn server_cert_path() -> PathBuf {
    data_path("server.cert.pem")
}

#[allow(dead_code)]
pub fn acceptor() -> TlsAcceptor {
    let certs = load_certs(&server_cert_path());
    let key = load_key(&data_path("server.key.pem"));

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .expect("valid test key/cert pair");

    TlsAcceptor::from(Arc::new(config))
}

/// Accepts one TLS client and echoes until it disconnects.
#[allow(dead_code)]
pub async fn spawn_echo_server() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
    let addr = listener.local_addr().unwrap();
    let acceptor = acceptor();

    let handle = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.expect("accept");
        let mut tls = acceptor.accept(socket).await.expect("server handshake");

        let mut buf = [0u8; 4096];
        loop {
            let n = match tls.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if tls.write_all(&buf[..n]).await.is_err() {
                break;
            }
            let _ = tls.flush().await;
        }
    });

    (addr, handle)
}

/// Accepts one TLS client, sends `greeting`, then closes with close_notify.
#[allow(dead_code)]
pub async fn spawn_greeting_server(greeting: &'static [u8]) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
    let addr = listener.local_addr().unwrap();
    let acceptor = acceptor();

    let handle = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.expect("accept");
        let mut tls = acceptor.accept(socket).await.expect("server handshake");
        tls.write_all(greeting).await.expect("send greeting");
        let _ = tls.shutdown().await;
    });

    (addr, handle)
}

/// Plain TCP listener that accepts and then never says anything.
#[allow(dead_code)]
pub async fn spawn_silent_server() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut buf = [0u8; 1024];
        while let Ok(n) = socket.read(&mut buf).await {
            if n == 0 {
                break;
            }
        }
    });

    (addr, handle)
}

#[allow(dead_code)]
fn load_certs(path: &Path) -> Vec<CertificateDer<'static>> {
    let file = File::open(path).unwrap_or_else(|e| panic!("open {}: {e}", path.display()));
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .unwrap_or_else(|e| panic!("read {}: {e}", path.display()));

    assert!(!certs.is_empty(), "no certificates in {}", path.display());
    certs
}

#[allow(dead_code)]
fn load_key(path: &Path) -> PrivateKeyDer<'static> {
    let file = File::open(path).unwrap_or_else(|e| panic!("open {}: {e}", path.display()));
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .unwrap_or_else(|e| panic!("read {}: {e}", path.display()))
        .unwrap_or_else(|| panic!("no private key in {}", path.display()))
}
