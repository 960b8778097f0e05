//! Minimal RESP2 client for Redis-compatible servers.
//!
//! Speaks just enough of the protocol for [`KvBackend`]: commands go out as
//! arrays of bulk strings, replies are parsed one level deep (arrays of
//! scalars). The TCP connection is opened lazily and kept only while it is
//! known to be in step with the server; the next command after any I/O,
//! protocol or cancellation failure reconnects.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::backend::KvBackend;
use crate::error::{Result, StrataError};
use crate::types::Tier;

/// Largest bulk reply accepted (512 MiB, the Redis limit).
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// A parsed server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<Reply>>),
}

impl Reply {
    fn into_bulk(self, operation: &'static str) -> Result<Option<Vec<u8>>> {
        match self {
            Self::Bulk(b) => Ok(b),
            other => Err(protocol_error(operation, &format!("expected bulk, got {other:?}"))),
        }
    }

    fn into_integer(self, operation: &'static str) -> Result<i64> {
        match self {
            Self::Integer(i) => Ok(i),
            other => Err(protocol_error(operation, &format!("expected integer, got {other:?}"))),
        }
    }

    fn into_array(self, operation: &'static str) -> Result<Vec<Vec<u8>>> {
        match self {
            Self::Array(None) => Ok(Vec::new()),
            Self::Array(Some(items)) => items
                .into_iter()
                .map(|r| r.into_bulk(operation).map(Option::unwrap_or_default))
                .collect(),
            other => Err(protocol_error(operation, &format!("expected array, got {other:?}"))),
        }
    }
}

fn protocol_error(operation: &'static str, reason: &str) -> StrataError {
    StrataError::Transport {
        tier: Tier::Network,
        operation,
        reason: reason.to_string(),
    }
}

/// Encode a command as a RESP array of bulk strings.
fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    buf.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.extend_from_slice(arg);
        buf.extend_from_slice(b"\r\n");
    }
    buf
}

/// Read one header line without its trailing CRLF.
async fn read_header(stream: &mut BufReader<TcpStream>, operation: &'static str) -> Result<(u8, String)> {
    let mut line = String::new();
    let n = stream.read_line(&mut line).await?;
    if n == 0 {
        return Err(protocol_error(operation, "connection closed by server"));
    }
    let line = line.trim_end_matches(['\r', '\n']);
    let mut chars = line.chars();
    let Some(prefix) = chars.next() else {
        return Err(protocol_error(operation, "empty reply line"));
    };
    Ok((prefix as u8, chars.as_str().to_string()))
}

fn parse_len(raw: &str, operation: &'static str) -> Result<i64> {
    raw.parse::<i64>()
        .map_err(|_| protocol_error(operation, &format!("bad length {raw:?}")))
}

async fn read_bulk(stream: &mut BufReader<TcpStream>, len: i64, operation: &'static str) -> Result<Option<Vec<u8>>> {
    if len < 0 {
        return Ok(None);
    }
    let len = usize::try_from(len).map_err(|_| protocol_error(operation, "bulk too large"))?;
    if len > MAX_BULK_LEN {
        return Err(protocol_error(operation, "bulk too large"));
    }
    let mut buf = vec![0u8; len + 2];
    stream.read_exact(&mut buf).await?;
    buf.truncate(len);
    Ok(Some(buf))
}

/// Read a scalar reply (anything but an array).
async fn read_scalar(
    stream: &mut BufReader<TcpStream>,
    prefix: u8,
    rest: String,
    operation: &'static str,
) -> Result<Reply> {
    match prefix {
        b'+' => Ok(Reply::Simple(rest)),
        b'-' => Ok(Reply::Error(rest)),
        b':' => Ok(Reply::Integer(parse_len(&rest, operation)?)),
        b'$' => {
            let len = parse_len(&rest, operation)?;
            Ok(Reply::Bulk(read_bulk(stream, len, operation).await?))
        }
        other => Err(protocol_error(
            operation,
            &format!("unexpected reply prefix {:?}", other as char),
        )),
    }
}

async fn read_reply(stream: &mut BufReader<TcpStream>, operation: &'static str) -> Result<Reply> {
    let (prefix, rest) = read_header(stream, operation).await?;
    if prefix != b'*' {
        return read_scalar(stream, prefix, rest, operation).await;
    }
    let count = parse_len(&rest, operation)?;
    if count < 0 {
        return Ok(Reply::Array(None));
    }
    let mut items = Vec::with_capacity(usize::try_from(count).unwrap_or(0).min(1024));
    for _ in 0..count {
        let (prefix, rest) = read_header(stream, operation).await?;
        if prefix == b'*' {
            return Err(protocol_error(operation, "nested arrays are not supported"));
        }
        items.push(read_scalar(stream, prefix, rest, operation).await?);
    }
    Ok(Reply::Array(Some(items)))
}

/// [`KvBackend`] talking RESP2 over TCP.
#[derive(Debug)]
pub struct RespBackend {
    address: String,
    connect_timeout: Duration,
    conn: Mutex<Option<BufReader<TcpStream>>>,
}

impl RespBackend {
    /// A backend for the server at `address` (`host:port`). Nothing is
    /// opened until the first command.
    #[must_use]
    pub fn new(address: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            connect_timeout,
            conn: Mutex::new(None),
        }
    }

    /// Server address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Send one command and read its reply, reconnecting if needed.
    ///
    /// The connection is taken out of the slot for the round trip and put
    /// back only once a whole reply has been read. A command cancelled
    /// between write and reply drops the stream with the future, so no
    /// later command can read a stale reply.
    async fn command(&self, operation: &'static str, args: &[&[u8]]) -> Result<Reply> {
        let mut guard = self.conn.lock().await;
        let mut stream = match guard.take() {
            Some(stream) => stream,
            None => self.connect().await?,
        };

        let result: Result<Reply> = async {
            stream.get_mut().write_all(&encode_command(args)).await?;
            read_reply(&mut stream, operation).await
        }
        .await;

        match result {
            Ok(Reply::Error(message)) => {
                *guard = Some(stream);
                Err(protocol_error(operation, &message))
            }
            Ok(reply) => {
                *guard = Some(stream);
                Ok(reply)
            }
            Err(e) => {
                debug!(address = %self.address, error = %e, "Dropping network connection");
                Err(e)
            }
        }
    }

    async fn connect(&self) -> Result<BufReader<TcpStream>> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| StrataError::Timeout {
                tier: Tier::Network,
                operation: "connect",
                timeout_ms: u64::try_from(self.connect_timeout.as_millis()).unwrap_or(u64::MAX),
            })?
            .map_err(|e| protocol_error("connect", &format!("{}: {e}", self.address)))?;
        stream.set_nodelay(true)?;
        info!(address = %self.address, "Network tier connected");
        Ok(BufReader::new(stream))
    }
}

fn millis(ttl: Duration) -> String {
    ttl.as_millis().max(1).to_string()
}

#[async_trait]
impl KvBackend for RespBackend {
    async fn ping(&self) -> Result<()> {
        match self.command("ping", &[b"PING"]).await? {
            Reply::Simple(s) if s == "PONG" => Ok(()),
            other => Err(protocol_error("ping", &format!("unexpected PING reply {other:?}"))),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.command("get", &[b"GET", key.as_bytes()]).await?.into_bulk("get")
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let ms = millis(ttl);
        self.command("set", &[b"SET", key.as_bytes(), value, b"PX", ms.as_bytes()])
            .await
            .map(drop)
    }

    async fn pttl(&self, key: &str) -> Result<Option<Duration>> {
        let ms = self.command("pttl", &[b"PTTL", key.as_bytes()]).await?.into_integer("pttl")?;
        Ok(u64::try_from(ms).ok().map(Duration::from_millis))
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let n = self.command("del", &[b"DEL", key.as_bytes()]).await?.into_integer("del")?;
        Ok(n > 0)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        self.command("sadd", &[b"SADD", key.as_bytes(), member.as_bytes()])
            .await
            .map(drop)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        self.command("srem", &[b"SREM", key.as_bytes(), member.as_bytes()])
            .await
            .map(drop)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let members = self
            .command("smembers", &[b"SMEMBERS", key.as_bytes()])
            .await?
            .into_array("smembers")?;
        Ok(members
            .into_iter()
            .filter_map(|m| String::from_utf8(m).ok())
            .collect())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let ms = millis(ttl);
        self.command("expire", &[b"PEXPIRE", key.as_bytes(), ms.as_bytes()])
            .await
            .map(drop)
    }

    async fn lpush(&self, key: &str, value: &[u8]) -> Result<()> {
        self.command("lpush", &[b"LPUSH", key.as_bytes(), value])
            .await
            .map(drop)
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        let (start, stop) = (start.to_string(), stop.to_string());
        self.command("ltrim", &[b"LTRIM", key.as_bytes(), start.as_bytes(), stop.as_bytes()])
            .await
            .map(drop)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>> {
        let (start, stop) = (start.to_string(), stop.to_string());
        self.command("lrange", &[b"LRANGE", key.as_bytes(), start.as_bytes(), stop.as_bytes()])
            .await?
            .into_array("lrange")
    }

    async fn close(&self) {
        if self.conn.lock().await.take().is_some() {
            info!(address = %self.address, "Network tier connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn encodes_commands_as_bulk_arrays() {
        let encoded = encode_command(&[b"SET", b"k", b"v"]);
        assert_eq!(encoded, b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n".to_vec());
    }

    /// Serve a fixed byte script to the first client, after reading one command per reply.
    async fn scripted_server(replies: Vec<&'static str>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            let mut socket = BufReader::new(socket);
            for reply in replies {
                // Each command is "*N" followed by 2N lines.
                let mut header = String::new();
                socket.read_line(&mut header).await.expect("header");
                let n: usize = header.trim_end()[1..].parse().expect("count");
                for _ in 0..2 * n {
                    let mut line = String::new();
                    socket.read_line(&mut line).await.expect("line");
                }
                socket.get_mut().write_all(reply.as_bytes()).await.expect("write");
            }
        });
        addr
    }

    #[tokio::test]
    async fn parses_scalar_and_array_replies() {
        let addr = scripted_server(vec![
            "+PONG\r\n",
            "$5\r\nhello\r\n",
            "$-1\r\n",
            ":1500\r\n",
            "*2\r\n$1\r\na\r\n$1\r\nb\r\n",
            "-ERR wrong\r\n",
        ])
        .await;
        let backend = RespBackend::new(addr, Duration::from_secs(1));

        backend.ping().await.expect("ping");
        assert_eq!(backend.get("k").await.expect("get"), Some(b"hello".to_vec()));
        assert_eq!(backend.get("missing").await.expect("get"), None);
        assert_eq!(backend.pttl("k").await.expect("pttl"), Some(Duration::from_millis(1500)));
        assert_eq!(
            backend.smembers("s").await.expect("smembers"),
            vec!["a".to_string(), "b".to_string()]
        );
        assert!(backend.get("k").await.is_err());
    }

    /// Serve one script per accepted connection; each step waits before replying.
    async fn slow_server(scripts: Vec<Vec<(Duration, &'static str)>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        tokio::spawn(async move {
            for script in scripts {
                let (socket, _) = listener.accept().await.expect("accept");
                tokio::spawn(async move {
                    let mut socket = BufReader::new(socket);
                    for (delay, reply) in script {
                        let mut header = String::new();
                        if socket.read_line(&mut header).await.unwrap_or(0) == 0 {
                            return;
                        }
                        let n: usize = header.trim_end()[1..].parse().expect("count");
                        for _ in 0..2 * n {
                            let mut line = String::new();
                            socket.read_line(&mut line).await.expect("line");
                        }
                        tokio::time::sleep(delay).await;
                        if socket.get_mut().write_all(reply.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn cancelled_command_does_not_leak_its_reply() {
        let addr = slow_server(vec![
            vec![(Duration::from_millis(300), "$8\r\nrecord-A\r\n")],
            vec![(Duration::ZERO, "$8\r\nrecord-B\r\n")],
        ])
        .await;
        let backend = RespBackend::new(addr, Duration::from_secs(1));

        let first = tokio::time::timeout(Duration::from_millis(100), backend.get("strata:memory:A")).await;
        assert!(first.is_err());

        let second = backend.get("strata:memory:B").await.expect("get");
        assert_eq!(second, Some(b"record-B".to_vec()));
    }

    #[tokio::test]
    async fn server_errors_keep_the_connection() {
        // A single scripted connection: a reconnect would find no server script.
        let addr = slow_server(vec![vec![
            (Duration::ZERO, "-ERR wrong\r\n"),
            (Duration::ZERO, "+PONG\r\n"),
        ]])
        .await;
        let backend = RespBackend::new(addr, Duration::from_secs(1));
        assert!(backend.get("k").await.is_err());
        backend.ping().await.expect("same connection still in step");
    }

    #[tokio::test]
    async fn negative_pttl_means_no_expiry() {
        let addr = scripted_server(vec![":-2\r\n"]).await;
        let backend = RespBackend::new(addr, Duration::from_secs(1));
        assert_eq!(backend.pttl("gone").await.expect("pttl"), None);
    }

    #[tokio::test]
    async fn unreachable_server_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        drop(listener);
        let backend = RespBackend::new(addr, Duration::from_millis(500));
        assert!(backend.ping().await.is_err());
    }
}
