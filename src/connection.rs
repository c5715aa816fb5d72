//! Handshake, redirect and admission policy
//!
//! A client opens with the 4-byte probe `test`. The daemon answers with
//! [`ACK`] when it services the connection itself, or with
//! `REDIRECT:<host>:<port>` followed by a close when the admission policy
//! deflects it to the mirror.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use clap::ValueEnum;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::{timeout, Duration};

use crate::error::{Error, Result};
use crate::protocol::timeouts::{CONNECT_MS, HANDSHAKE_MS};
use crate::protocol::{ACK, ADMIT_ALTERNATE_AFTER, ADMIT_FIRST, MAX_REDIRECTS, PROBE, REDIRECT_PREFIX};
use crate::transfer::{read_text, send_text};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Primary,
    Mirror,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Primary => f.write_str("primary"),
            Role::Mirror => f.write_str("mirror"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Direct,
    Redirect,
}

/// Whether the `n`-th accepted connection (counting from 0) is serviced directly.
///
/// The sequence is fixed: 0-3 served, 4-7 redirected, then even counts served
/// and odd counts redirected. It is not a load balancer and must stay literal
/// for compatibility with existing deployments.
pub fn admits_directly(n: u64) -> bool {
    n < ADMIT_FIRST || (n > ADMIT_ALTERNATE_AFTER && n % 2 == 0)
}

/// Accept-loop-owned counter deciding direct service vs. redirect
#[derive(Debug)]
pub struct AdmissionPolicy {
    role: Role,
    accepted: u64,
}

impl AdmissionPolicy {
    pub fn new(role: Role) -> Self {
        Self { role, accepted: 0 }
    }

    /// Classify the next accepted connection; every connection is counted
    pub fn admit(&mut self) -> Admission {
        let n = self.accepted;
        self.accepted += 1;
        match self.role {
            Role::Mirror => Admission::Direct,
            Role::Primary if admits_directly(n) => Admission::Direct,
            Role::Primary => Admission::Redirect,
        }
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }
}

/// Per-connection state, owned by the task serving it
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub peer: SocketAddr,
    pub role: Role,
    /// Position in the accept order, counting from 0
    pub sequence: u64,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {} on {}", self.sequence, self.peer, self.role)
    }
}

/// Reply to the liveness probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeReply {
    Ack(String),
    Redirect { host: String, port: u16 },
}

pub fn redirect_message(host: &str, port: u16) -> String {
    format!("{}{}:{}", REDIRECT_PREFIX, host, port)
}

/// Classify the daemon's first message
pub fn parse_reply(text: &str) -> Result<HandshakeReply> {
    let Some(rest) = text.strip_prefix(REDIRECT_PREFIX) else {
        return Ok(HandshakeReply::Ack(text.to_string()));
    };
    let (host, port_part) = rest
        .split_once(':')
        .ok_or_else(|| Error::Redirect(text.to_string()))?;
    let digits: String = port_part.chars().take_while(|c| c.is_ascii_digit()).collect();
    let port = digits
        .parse::<u16>()
        .map_err(|_| Error::Redirect(text.to_string()))?;
    if host.is_empty() {
        return Err(Error::Redirect(text.to_string()));
    }
    Ok(HandshakeReply::Redirect {
        host: host.to_string(),
        port,
    })
}

/// Resolve `host:port` and connect to the first address that accepts
pub async fn connect(host: &str, port: u16) -> Result<TcpStream> {
    let addr = format!("{}:{}", host, port);
    let candidates: Vec<SocketAddr> = lookup_host(&addr)
        .await
        .map_err(|source| Error::Connection {
            addr: addr.clone(),
            source,
        })?
        .collect();

    let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no addresses resolved");
    for candidate in candidates {
        match timeout(Duration::from_millis(CONNECT_MS), TcpStream::connect(candidate)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Ok(Err(e)) => {
                debug!("connect {} failed: {}", candidate, e);
                last_err = e;
            }
            Err(_) => {
                debug!("connect {} timed out", candidate);
                last_err = io::Error::new(io::ErrorKind::TimedOut, "connect timeout");
            }
        }
    }
    Err(Error::Connection {
        addr,
        source: last_err,
    })
}

/// A connection that completed the handshake
#[derive(Debug)]
pub struct Established {
    pub stream: TcpStream,
    pub host: String,
    pub port: u16,
    pub redirected: bool,
    pub greeting: String,
}

/// Send the probe and read the reply on a fresh connection
async fn probe(stream: &mut TcpStream) -> Result<HandshakeReply> {
    stream
        .write_all(PROBE)
        .await
        .map_err(|e| Error::Handshake(format!("probe not sent: {}", e)))?;
    let reply = timeout(Duration::from_millis(HANDSHAKE_MS), read_text(stream))
        .await
        .map_err(|_| Error::Handshake(format!("no reply within {} ms", HANDSHAKE_MS)))??;
    parse_reply(&reply)
}

/// Connect, probe, and follow a mirror redirect if the daemon issues one
pub async fn establish(host: &str, port: u16) -> Result<Established> {
    let mut host = host.to_string();
    let mut port = port;
    let mut redirects = 0usize;
    loop {
        let mut stream = connect(&host, port).await?;
        match probe(&mut stream).await? {
            HandshakeReply::Ack(greeting) => {
                return Ok(Established {
                    stream,
                    host,
                    port,
                    redirected: redirects > 0,
                    greeting,
                });
            }
            HandshakeReply::Redirect {
                host: next_host,
                port: next_port,
            } => {
                if redirects >= MAX_REDIRECTS {
                    return Err(Error::Handshake(format!(
                        "redirected again by {}:{}",
                        host, port
                    )));
                }
                info!("redirected from {}:{} to {}:{}", host, port, next_host, next_port);
                redirects += 1;
                host = next_host;
                port = next_port;
            }
        }
    }
}

/// Daemon side of a deflected connection: consume the probe, send the redirect, close
pub async fn send_redirect(mut stream: TcpStream, host: &str, port: u16) -> Result<()> {
    // Reading the probe first keeps the close from resetting the connection
    // before the client has seen the redirect
    let mut probe = [0u8; 4];
    let _ = timeout(Duration::from_millis(HANDSHAKE_MS), stream.read_exact(&mut probe)).await;
    send_text(&mut stream, &redirect_message(host, port)).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Acknowledge a probe on a directly serviced connection
pub async fn send_ack<W>(writer: &mut W) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    send_text(writer, ACK).await
}
