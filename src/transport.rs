//! Overlay transport.
//!
//! The onion-routing daemon is an external process; this module speaks its
//! control port (authentication, `ADD_ONION`, bootstrap progress) and dials
//! through its SOCKS5 port. On top of each overlay stream it runs the
//! three-message mutual-authentication handshake that binds the connection to
//! the remote's long-lived identity before any NNTP traffic flows.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Signature, VerifyingKey};
use rand::RngCore;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio_socks::tcp::Socks5Stream;

use crate::keys::{onion_from_pubkey, verify, NodeKey};

/// Handshake lines longer than this abort the connection.
const MAX_LINE: usize = 1024;
/// Ceiling on waiting for the daemon to finish bootstrapping.
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(180);
const BOOTSTRAP_POLL: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("handshake line exceeded {MAX_LINE} bytes")]
    Oversize,
    #[error("control port: {0}")]
    Control(String),
    #[error("overlay bootstrap timed out")]
    BootstrapTimeout,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("socks: {0}")]
    Socks(#[from] tokio_socks::Error),
}

// ─── Daemon connection ────────────────────────────────────────────────────────

/// Handle on the external onion daemon. Cheap to clone; each `listen` call
/// opens its own control connection so the published service lives exactly as
/// long as the returned [`OnionService`].
#[derive(Clone)]
pub struct TorCon {
    control_addr: String,
    socks_addr: String,
    cookie: Option<Vec<u8>>,
}

impl TorCon {
    /// A handle that has not talked to the daemon yet. Prefer
    /// [`TorCon::connect`], which also waits for bootstrap.
    pub fn new(control_addr: &str, socks_addr: &str) -> TorCon {
        TorCon {
            control_addr: control_addr.to_string(),
            socks_addr: socks_addr.to_string(),
            cookie: None,
        }
    }

    /// Connect to the daemon and block until its dialer is usable (the
    /// bootstrap-complete event), within a three-minute ceiling.
    pub async fn connect(
        control_addr: &str,
        socks_addr: &str,
        data_dir: Option<&Path>,
    ) -> Result<TorCon, TransportError> {
        let cookie = match data_dir {
            Some(dir) => tokio::fs::read(dir.join("control_auth_cookie")).await.ok(),
            None => None,
        };
        let tc = TorCon {
            control_addr: control_addr.to_string(),
            socks_addr: socks_addr.to_string(),
            cookie,
        };
        let mut conn = tc.control_connection().await?;
        tc.wait_bootstrap(&mut conn).await?;
        log::info!("overlay daemon bootstrapped");
        Ok(tc)
    }

    async fn control_connection(&self) -> Result<ControlConn, TransportError> {
        let stream = TcpStream::connect(&self.control_addr).await?;
        let (read_half, write_half) = stream.into_split();
        let mut conn = ControlConn { reader: BufReader::new(read_half), writer: write_half };

        let auth = match &self.cookie {
            Some(cookie) => format!("AUTHENTICATE {}", hex::encode(cookie)),
            None => "AUTHENTICATE \"\"".to_string(),
        };
        conn.command(&auth).await?;
        Ok(conn)
    }

    async fn wait_bootstrap(&self, conn: &mut ControlConn) -> Result<(), TransportError> {
        let deadline = tokio::time::Instant::now() + BOOTSTRAP_TIMEOUT;
        loop {
            let reply = conn.command("GETINFO status/bootstrap-phase").await?;
            if reply.iter().any(|line| line.contains("PROGRESS=100")) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(TransportError::BootstrapTimeout);
            }
            tokio::time::sleep(BOOTSTRAP_POLL).await;
        }
    }

    /// Dial `host:port` through the daemon's SOCKS port.
    pub async fn dial(&self, addr: &str) -> Result<Socks5Stream<TcpStream>, TransportError> {
        let stream = Socks5Stream::connect(self.socks_addr.as_str(), addr).await?;
        Ok(stream)
    }

    /// Publish an onion service for `key`, forwarding `virtual_port` to a
    /// freshly bound local listener.
    pub async fn listen(&self, virtual_port: u16, key: &NodeKey) -> Result<OnionService, TransportError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let local = listener.local_addr()?;

        let secret = key
            .onion_private_bytes()
            .map_err(|err| TransportError::Control(err.to_string()))?;
        let mut conn = self.control_connection().await?;
        let reply = conn
            .command(&format!(
                "ADD_ONION ED25519-V3:{} Flags=DiscardPK Port={},{}",
                BASE64.encode(secret),
                virtual_port,
                local,
            ))
            .await?;
        let id = reply
            .iter()
            .find_map(|line| line.strip_prefix("ServiceID="))
            .ok_or_else(|| TransportError::Control("ADD_ONION reply had no ServiceID".into()))?
            .to_string();
        log::info!("onion service published: {id}");
        Ok(OnionService { id, listener, _control: conn })
    }
}

/// A published onion service. Dropping it closes the control connection,
/// which unpublishes the ephemeral service.
pub struct OnionService {
    pub id: String,
    listener: TcpListener,
    _control: ControlConn,
}

impl OnionService {
    pub async fn accept(&self) -> std::io::Result<TcpStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }
}

struct ControlConn {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ControlConn {
    /// Send one control command and collect the reply lines (without their
    /// status prefixes). Any non-250 status is an error.
    async fn command(&mut self, cmd: &str) -> Result<Vec<String>, TransportError> {
        self.writer.write_all(cmd.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;

        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line).await? == 0 {
                return Err(TransportError::Control("daemon closed control connection".into()));
            }
            let line = line.trim_end();
            if line.len() < 4 {
                return Err(TransportError::Control(format!("short reply: {line}")));
            }
            let (status, rest) = line.split_at(3);
            let separator = &line[3..4];
            if status != "250" {
                return Err(TransportError::Control(line.to_string()));
            }
            lines.push(rest[1..].to_string());
            if separator == " " {
                return Ok(lines);
            }
        }
    }
}

// ─── Handshake ────────────────────────────────────────────────────────────────
//
// C -> S:  <client_pubkey> <client_id> <random32> <sig1>
// S -> C:  <server_pubkey> <server_id> <random32> <sig2>
//          sig2 covers the server tokens plus the full client line
// C -> S:  <sig3>  over the full server line
// S -> C:  "OK"
//
// Byte-at-a-time reads keep the NNTP stream that follows unbuffered.

async fn read_line_capped<S: AsyncRead + Unpin>(stream: &mut S) -> Result<String, TransportError> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if stream.read(&mut byte).await? == 0 {
            return Err(TransportError::HandshakeFailed("stream closed mid-handshake".into()));
        }
        if byte[0] == b'\n' {
            return String::from_utf8(line)
                .map_err(|_| TransportError::HandshakeFailed("non-utf8 handshake line".into()));
        }
        line.push(byte[0]);
        if line.len() > MAX_LINE {
            return Err(TransportError::Oversize);
        }
    }
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

fn decode_pubkey(token: &str) -> Result<VerifyingKey, TransportError> {
    let raw = hex::decode(token).map_err(|_| bad_token("public key"))?;
    let bytes: [u8; 32] = raw.as_slice().try_into().map_err(|_| bad_token("public key"))?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| bad_token("public key"))
}

fn decode_sig(token: &str) -> Result<Signature, TransportError> {
    let raw = hex::decode(token).map_err(|_| bad_token("signature"))?;
    let bytes: [u8; 64] = raw.as_slice().try_into().map_err(|_| bad_token("signature"))?;
    Ok(Signature::from_bytes(&bytes))
}

fn bad_token(what: &str) -> TransportError {
    TransportError::HandshakeFailed(format!("undecodable {what} token"))
}

/// Run the initiator side. `expected_peer` is the onion id that was dialed;
/// the server must prove it holds that identity.
pub async fn client_handshake<S>(
    stream: &mut S,
    my_key: &NodeKey,
    expected_peer: &str,
) -> Result<VerifyingKey, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let first = format!(
        "{} {} {}",
        hex::encode(my_key.public_key().as_bytes()),
        my_key.node_id(),
        random_hex(32),
    );
    let sig1 = my_key
        .sign(first.as_bytes())
        .map_err(|err| TransportError::HandshakeFailed(err.to_string()))?;
    let client_line = format!("{first} {}", hex::encode(sig1.to_bytes()));
    stream.write_all(format!("{client_line}\n").as_bytes()).await?;
    stream.flush().await?;

    let server_line = read_line_capped(stream).await?;
    let tokens: Vec<&str> = server_line.split(' ').collect();
    if tokens.len() != 4 {
        return Err(TransportError::HandshakeFailed("server reply malformed".into()));
    }
    let server_pubkey = decode_pubkey(tokens[0])?;
    let derived_id = onion_from_pubkey(&server_pubkey);
    if derived_id != tokens[1] || derived_id != expected_peer {
        return Err(TransportError::HandshakeFailed(
            "server key does not match its claimed onion id".into(),
        ));
    }
    let sig2 = decode_sig(tokens[3])?;
    let signed_portion = format!("{} {} {} {}", tokens[0], tokens[1], tokens[2], client_line);
    if !verify(&server_pubkey, signed_portion.as_bytes(), &sig2) {
        return Err(TransportError::HandshakeFailed("server signature invalid".into()));
    }

    let sig3 = my_key
        .sign(server_line.as_bytes())
        .map_err(|err| TransportError::HandshakeFailed(err.to_string()))?;
    stream.write_all(format!("{}\n", hex::encode(sig3.to_bytes())).as_bytes()).await?;
    stream.flush().await?;

    let confirmation = read_line_capped(stream).await?;
    if confirmation != "OK" {
        return Err(TransportError::HandshakeFailed("server refused connection".into()));
    }
    Ok(server_pubkey)
}

/// Run the responder side. `auth` decides whether the proven client identity
/// may proceed; the default policy admits only known peers.
pub async fn server_handshake<S, F, Fut>(
    stream: &mut S,
    my_key: &NodeKey,
    auth: F,
) -> Result<VerifyingKey, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(VerifyingKey) -> Fut,
    Fut: Future<Output = bool>,
{
    let client_line = read_line_capped(stream).await?;
    let tokens: Vec<&str> = client_line.split(' ').collect();
    if tokens.len() != 4 {
        return Err(TransportError::HandshakeFailed(
            "handshake has wrong number of arguments".into(),
        ));
    }
    let client_pubkey = decode_pubkey(tokens[0])?;
    if onion_from_pubkey(&client_pubkey) != tokens[1] {
        return Err(TransportError::HandshakeFailed(
            "client key does not match its claimed onion id".into(),
        ));
    }
    if !auth(client_pubkey).await {
        return Err(TransportError::HandshakeFailed("client refused by policy".into()));
    }
    let sig1 = decode_sig(tokens[3])?;
    let client_msg = tokens[..3].join(" ");
    if !verify(&client_pubkey, client_msg.as_bytes(), &sig1) {
        return Err(TransportError::HandshakeFailed("client signature invalid".into()));
    }

    let first = format!(
        "{} {} {}",
        hex::encode(my_key.public_key().as_bytes()),
        my_key.node_id(),
        random_hex(32),
    );
    let sig2 = my_key
        .sign(format!("{first} {client_line}").as_bytes())
        .map_err(|err| TransportError::HandshakeFailed(err.to_string()))?;
    let server_line = format!("{first} {}", hex::encode(sig2.to_bytes()));
    stream.write_all(format!("{server_line}\n").as_bytes()).await?;
    stream.flush().await?;

    let sig3 = decode_sig(&read_line_capped(stream).await?)?;
    if !verify(&client_pubkey, server_line.as_bytes(), &sig3) {
        return Err(TransportError::HandshakeFailed("client confirmation invalid".into()));
    }
    stream.write_all(b"OK\n").await?;
    stream.flush().await?;
    Ok(client_pubkey)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mutual_handshake_succeeds_between_honest_peers() {
        let client_key = NodeKey::generate();
        let server_key = NodeKey::generate();
        let server_id = server_key.node_id();
        let client_pub = client_key.public_key();

        let (mut client_end, mut server_end) = tokio::io::duplex(4096);

        let server = {
            let server_key = server_key.clone();
            tokio::spawn(async move {
                server_handshake(&mut server_end, &server_key, |_| async { true }).await
            })
        };
        let seen_server = client_handshake(&mut client_end, &client_key, &server_id)
            .await
            .expect("client side succeeds");
        let seen_client = server.await.unwrap().expect("server side succeeds");

        assert_eq!(seen_server, server_key.public_key());
        assert_eq!(seen_client, client_pub);
    }

    #[tokio::test]
    async fn auth_callback_rejects_unknown_clients() {
        let client_key = NodeKey::generate();
        let server_key = NodeKey::generate();
        let server_id = server_key.node_id();

        let (mut client_end, mut server_end) = tokio::io::duplex(4096);
        let server = tokio::spawn(async move {
            server_handshake(&mut server_end, &server_key, |_| async { false }).await
        });

        let client = client_handshake(&mut client_end, &client_key, &server_id).await;
        assert!(client.is_err());
        assert!(matches!(server.await.unwrap(), Err(TransportError::HandshakeFailed(_))));
    }

    #[tokio::test]
    async fn client_id_spoofing_is_caught() {
        let real_key = NodeKey::generate();
        let spoofed_id = NodeKey::generate().node_id();
        let server_key = NodeKey::generate();

        let (mut client_end, mut server_end) = tokio::io::duplex(4096);
        let server = tokio::spawn(async move {
            server_handshake(&mut server_end, &server_key, |_| async { true }).await
        });

        // Well-signed line, but the claimed onion id belongs to someone else.
        let first = format!(
            "{} {} {}",
            hex::encode(real_key.public_key().as_bytes()),
            spoofed_id,
            random_hex(32),
        );
        let sig = real_key.sign(first.as_bytes()).unwrap();
        client_end
            .write_all(format!("{first} {}\n", hex::encode(sig.to_bytes())).as_bytes())
            .await
            .unwrap();

        assert!(matches!(server.await.unwrap(), Err(TransportError::HandshakeFailed(_))));
    }

    #[tokio::test]
    async fn server_id_mismatch_is_caught_by_client() {
        let client_key = NodeKey::generate();
        let server_key = NodeKey::generate();
        // Client dialed a different onion address than the server's identity.
        let expected = NodeKey::generate().node_id();

        let (mut client_end, mut server_end) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let _ = server_handshake(&mut server_end, &server_key, |_| async { true }).await;
        });

        let result = client_handshake(&mut client_end, &client_key, &expected).await;
        assert!(matches!(result, Err(TransportError::HandshakeFailed(_))));
    }

    #[tokio::test]
    async fn tampered_client_signature_fails() {
        let client_key = NodeKey::generate();
        let server_key = NodeKey::generate();

        let (mut client_end, mut server_end) = tokio::io::duplex(4096);
        let server = tokio::spawn(async move {
            server_handshake(&mut server_end, &server_key, |_| async { true }).await
        });

        let first = format!(
            "{} {} {}",
            hex::encode(client_key.public_key().as_bytes()),
            client_key.node_id(),
            random_hex(32),
        );
        // Signature over different bytes.
        let sig = client_key.sign(b"unrelated bytes").unwrap();
        client_end
            .write_all(format!("{first} {}\n", hex::encode(sig.to_bytes())).as_bytes())
            .await
            .unwrap();

        assert!(matches!(server.await.unwrap(), Err(TransportError::HandshakeFailed(_))));
    }

    #[tokio::test]
    async fn oversize_line_aborts() {
        let server_key = NodeKey::generate();
        let (mut client_end, mut server_end) = tokio::io::duplex(8192);
        let server = tokio::spawn(async move {
            server_handshake(&mut server_end, &server_key, |_| async { true }).await
        });

        let garbage = "a".repeat(MAX_LINE + 10);
        client_end.write_all(format!("{garbage}\n").as_bytes()).await.unwrap();

        assert!(matches!(server.await.unwrap(), Err(TransportError::Oversize)));
    }
}
