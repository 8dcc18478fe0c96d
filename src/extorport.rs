//! Client side of the Extended ORPort protocol.
//!
//! Instead of a plain backend connection, the relay can connect to the
//! backend's Extended ORPort, authenticate with the shared cookie (SAFE_COOKIE),
//! and tell the backend which client address and transport the new connection
//! belongs to. After the backend acknowledges, the connection carries the
//! client's bytes exactly like a plain one.

use anyhow::{Context, Result, anyhow, bail};
use bytes::{BufMut, BytesMut};
use sha2::{Digest, Sha256};
use std::{fmt, fs, io, net::SocketAddr, path::Path};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const AUTH_COOKIE_HEADER: &[u8; 32] = b"! Extended ORPort Auth Cookie !\x0a";
pub const AUTH_COOKIE_LEN: usize = 32;

const AUTH_TYPE_SAFE_COOKIE: u8 = 1;
pub(crate) const AUTH_SUCCESS: u8 = 1;
const NONCE_LEN: usize = 32;
const SERVER_HASH_CONTEXT: &[u8] = b"ExtORPort authentication server-to-client hash";
const CLIENT_HASH_CONTEXT: &[u8] = b"ExtORPort authentication client-to-server hash";

pub(crate) const CMD_DONE: u16 = 0x0000;
pub(crate) const CMD_USERADDR: u16 = 0x0001;
pub(crate) const CMD_TRANSPORT: u16 = 0x0002;
pub(crate) const REPLY_OKAY: u16 = 0x1000;

pub type AuthCookie = [u8; AUTH_COOKIE_LEN];

/// Where the Extended ORPort listens and the secret that unlocks it.
#[derive(Clone)]
pub struct ExtOrPort {
    pub addr: SocketAddr,
    pub auth_cookie: AuthCookie,
}

impl fmt::Debug for ExtOrPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtOrPort")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

pub fn read_auth_cookie(path: impl AsRef<Path>) -> Result<AuthCookie> {
    let path = path.as_ref();
    let contents =
        fs::read(path).with_context(|| format!("Failed to read auth cookie {}", path.display()))?;
    parse_auth_cookie(&contents)
        .with_context(|| format!("Invalid auth cookie file {}", path.display()))
}

/// Extracts the cookie from the contents of an auth cookie file: a fixed
/// 32-byte header followed by exactly 32 bytes of secret.
pub fn parse_auth_cookie(contents: &[u8]) -> Result<AuthCookie> {
    let Some(cookie) = contents.strip_prefix(AUTH_COOKIE_HEADER.as_slice()) else {
        bail!("missing auth cookie header");
    };
    cookie
        .try_into()
        .map_err(|_| anyhow!("expected {AUTH_COOKIE_LEN} cookie bytes, found {}", cookie.len()))
}

/// Authenticates on a freshly opened Extended ORPort connection and registers
/// the client address and transport name for it.
pub async fn handshake<S>(
    stream: &mut S,
    auth_cookie: &AuthCookie,
    client_addr: SocketAddr,
    method_name: &str,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    authenticate(stream, auth_cookie).await?;
    send_metadata(stream, client_addr, method_name).await
}

async fn authenticate<S>(stream: &mut S, auth_cookie: &AuthCookie) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // The server lists the methods it supports, terminated by a zero byte.
    let mut safe_cookie_offered = false;
    loop {
        match stream.read_u8().await? {
            0 => break,
            AUTH_TYPE_SAFE_COOKIE => safe_cookie_offered = true,
            _ => {}
        }
    }
    if !safe_cookie_offered {
        return Err(protocol_error("server didn't offer SAFE_COOKIE authentication"));
    }

    let client_nonce: [u8; NONCE_LEN] = rand::random();
    let mut hello = BytesMut::with_capacity(1 + NONCE_LEN);
    hello.put_u8(AUTH_TYPE_SAFE_COOKIE);
    hello.put_slice(&client_nonce);
    stream.write_all(&hello).await?;

    let mut server_hash = [0u8; 32];
    let mut server_nonce = [0u8; NONCE_LEN];
    stream.read_exact(&mut server_hash).await?;
    stream.read_exact(&mut server_nonce).await?;

    let expected = auth_hash(auth_cookie, SERVER_HASH_CONTEXT, &client_nonce, &server_nonce);
    if !constant_time_eq(&expected, &server_hash) {
        return Err(protocol_error("server hash mismatch"));
    }

    let client_hash = auth_hash(auth_cookie, CLIENT_HASH_CONTEXT, &client_nonce, &server_nonce);
    stream.write_all(&client_hash).await?;

    match stream.read_u8().await? {
        AUTH_SUCCESS => Ok(()),
        _ => Err(protocol_error("server rejected authentication")),
    }
}

async fn send_metadata<S>(
    stream: &mut S,
    client_addr: SocketAddr,
    method_name: &str,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut commands = BytesMut::new();
    put_command(&mut commands, CMD_USERADDR, client_addr.to_string().as_bytes())?;
    put_command(&mut commands, CMD_TRANSPORT, method_name.as_bytes())?;
    put_command(&mut commands, CMD_DONE, &[])?;
    stream.write_all(&commands).await?;
    stream.flush().await?;

    let reply = stream.read_u16().await?;
    let len = stream.read_u16().await?;
    let mut body = vec![0u8; usize::from(len)];
    stream.read_exact(&mut body).await?;
    if reply != REPLY_OKAY {
        return Err(protocol_error(format!(
            "server refused connection metadata (reply {reply:#06x})"
        )));
    }
    Ok(())
}

fn put_command(out: &mut BytesMut, command: u16, body: &[u8]) -> io::Result<()> {
    let len = u16::try_from(body.len()).map_err(|_| protocol_error("command body too long"))?;
    out.put_u16(command);
    out.put_u16(len);
    out.put_slice(body);
    Ok(())
}

fn auth_hash(
    auth_cookie: &AuthCookie,
    context: &[u8],
    client_nonce: &[u8; NONCE_LEN],
    server_nonce: &[u8; NONCE_LEN],
) -> [u8; 32] {
    hmac_sha256(auth_cookie, &[context, client_nonce.as_slice(), server_nonce.as_slice()])
}

/// HMAC-SHA256 over the concatenation of `parts`.
fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    const BLOCK_SIZE: usize = 64;

    let mut key_block = [0u8; BLOCK_SIZE];
    if key.len() > BLOCK_SIZE {
        key_block[..32].copy_from_slice(&Sha256::digest(key));
    } else {
        key_block[..key.len()].copy_from_slice(key);
    }

    let mut inner = Sha256::new();
    inner.update(key_block.map(|b| b ^ 0x36));
    for part in parts {
        inner.update(part);
    }

    let mut outer = Sha256::new();
    outer.update(key_block.map(|b| b ^ 0x5c));
    outer.update(inner.finalize());
    outer.finalize().into()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn protocol_error(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("Extended ORPort: {}", msg.into()))
}


#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    const COOKIE: AuthCookie = [0x42; AUTH_COOKIE_LEN];
    const CLIENT: &str = "192.0.2.10:40000";

    async fn run(
        server_cookie: AuthCookie,
        auth_status: u8,
        reply: u16,
    ) -> (io::Result<()>, io::Result<Vec<(u16, Vec<u8>)>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            fake::serve(&mut stream, &server_cookie, auth_status, reply).await
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let client = handshake(&mut stream, &COOKIE, CLIENT.parse().unwrap(), "meek").await;
        drop(stream);
        (client, server.await.unwrap())
    }

    mod cookie {
        use super::*;

        #[test]
        fn parses_cookie_after_header() {
            let mut contents = AUTH_COOKIE_HEADER.to_vec();
            contents.extend_from_slice(&COOKIE);
            assert_eq!(parse_auth_cookie(&contents).unwrap(), COOKIE);
        }

        #[test]
        fn rejects_wrong_header_or_length() {
            assert!(parse_auth_cookie(&[0x42; 64]).is_err());

            let mut short = AUTH_COOKIE_HEADER.to_vec();
            short.extend_from_slice(&[0x42; 31]);
            let err = parse_auth_cookie(&short).unwrap_err();
            assert!(err.to_string().contains("found 31"));

            let mut long = AUTH_COOKIE_HEADER.to_vec();
            long.extend_from_slice(&[0x42; 33]);
            assert!(parse_auth_cookie(&long).is_err());
        }

        #[test]
        fn reports_missing_file() {
            let err = read_auth_cookie("/nonexistent/extended_orport_auth_cookie").unwrap_err();
            assert!(err.to_string().contains("Failed to read auth cookie"));
        }
    }

    mod hmac {
        use super::*;

        #[test]
        fn matches_published_test_vector() {
            // RFC 4231, test case 2.
            let data = [b"what do ya want ".as_slice(), b"for nothing?".as_slice()];
            let mac = hmac_sha256(b"Jefe", &data);
            assert_eq!(
                mac,
                [
                    0x5b, 0xdc, 0xc1, 0x46, 0xbf, 0x60, 0x75, 0x4e, 0x6a, 0x04, 0x24, 0x26, 0x08,
                    0x95, 0x75, 0xc7, 0x5a, 0x00, 0x3f, 0x08, 0x9d, 0x27, 0x39, 0x83, 0x9d, 0xec,
                    0x58, 0xb9, 0x64, 0xec, 0x38, 0x43,
                ]
            );
        }

        #[test]
        fn compares_in_full() {
            assert!(constant_time_eq(b"abc", b"abc"));
            assert!(!constant_time_eq(b"abc", b"abd"));
            assert!(!constant_time_eq(b"abc", b"ab"));
        }
    }

    mod exchange {
        use super::*;

        #[tokio::test]
        async fn registers_client_address_and_transport() {
            let (client, server) = run(COOKIE, AUTH_SUCCESS, REPLY_OKAY).await;
            client.unwrap();
            assert_eq!(
                server.unwrap(),
                vec![
                    (CMD_USERADDR, CLIENT.as_bytes().to_vec()),
                    (CMD_TRANSPORT, b"meek".to_vec()),
                    (CMD_DONE, Vec::new()),
                ]
            );
        }

        #[tokio::test]
        async fn detects_server_without_the_cookie() {
            let (client, _) = run([0x17; AUTH_COOKIE_LEN], AUTH_SUCCESS, REPLY_OKAY).await;
            let err = client.unwrap_err();
            assert!(err.to_string().contains("server hash mismatch"));
        }

        #[tokio::test]
        async fn fails_when_authentication_is_rejected() {
            let (client, _) = run(COOKIE, 0, REPLY_OKAY).await;
            let err = client.unwrap_err();
            assert!(err.to_string().contains("rejected authentication"));
        }

        #[tokio::test]
        async fn fails_when_metadata_is_refused() {
            let (client, server) = run(COOKIE, AUTH_SUCCESS, 0x1001).await;
            assert_eq!(server.unwrap().len(), 3);
            let err = client.unwrap_err();
            assert!(err.to_string().contains("reply 0x1001"));
        }

        #[tokio::test]
        async fn requires_safe_cookie_method() {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                let (mut stream, _) = listener.accept().await.unwrap();
                let _ = stream.write_all(&[3, 0]).await;
            });

            let mut stream = TcpStream::connect(addr).await.unwrap();
            let err = handshake(&mut stream, &COOKIE, CLIENT.parse().unwrap(), "meek")
                .await
                .unwrap_err();
            assert!(err.to_string().contains("SAFE_COOKIE"));
        }
    }
}
