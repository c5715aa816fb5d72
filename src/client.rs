//! Client session: one connection, commands issued strictly in sequence
//!
//! Lines are validated locally before anything is sent; a line that does not
//! parse never reaches the daemon.

use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use tokio::net::TcpStream;

use crate::archive::unpack_archive;
use crate::command::{Command, Verb};
use crate::connection::establish;
use crate::error::{Error, Result};
use crate::protocol::{LOCAL_ARCHIVE_NAME, QUIT_ACK};
use crate::transfer::{read_text, receive_archive_with, send_text};

/// What the daemon answered to one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// findfile result, `File not found`, or another plain text answer
    Text(String),
    /// Archive command that matched nothing (or whose archive failed)
    NoArchive,
    Archive {
        /// Local archive file; already removed when `-u` was given
        path: PathBuf,
        bytes: u64,
        marker: String,
        /// Entries unpacked into the download directory for `-u`
        extracted: Option<u64>,
    },
    Quit,
}

pub struct Client {
    stream: TcpStream,
    host: String,
    port: u16,
    redirected: bool,
    download_dir: PathBuf,
}

impl Client {
    /// Connect, complete the handshake (following a redirect if issued)
    pub async fn connect(host: &str, port: u16, download_dir: impl Into<PathBuf>) -> Result<Self> {
        let est = establish(host, port).await?;
        info!("connected to {}:{}: {}", est.host, est.port, est.greeting);
        Ok(Self {
            stream: est.stream,
            host: est.host,
            port: est.port,
            redirected: est.redirected,
            download_dir: download_dir.into(),
        })
    }

    /// The daemon actually serving this session
    pub fn endpoint(&self) -> (&str, u16) {
        (&self.host, self.port)
    }

    pub fn was_redirected(&self) -> bool {
        self.redirected
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn archive_path(&self) -> PathBuf {
        self.download_dir.join(LOCAL_ARCHIVE_NAME)
    }

    /// Validate and run one raw line; invalid lines fail without touching the socket
    pub async fn submit_line(&mut self, line: &str) -> Result<Reply> {
        let cmd = Command::parse(line)?;
        self.execute(&cmd).await
    }

    pub async fn execute(&mut self, cmd: &Command) -> Result<Reply> {
        self.execute_with(cmd, |_, _| {}).await
    }

    /// Run one parsed command, reporting archive download progress as `(received, total)`
    pub async fn execute_with<F>(&mut self, cmd: &Command, progress: F) -> Result<Reply>
    where
        F: FnMut(u64, u64),
    {
        let line = cmd.to_line();
        debug!("sending {:?}", line);
        send_text(&mut self.stream, &line).await?;

        match cmd.verb {
            Verb::Quit => {
                let text = read_text(&mut self.stream).await?;
                if text.trim_end() == QUIT_ACK {
                    Ok(Reply::Quit)
                } else {
                    Ok(Reply::Text(text))
                }
            }
            Verb::FindFile => Ok(Reply::Text(read_text(&mut self.stream).await?)),
            _ => self.receive(cmd, progress).await,
        }
    }

    async fn receive<F>(&mut self, cmd: &Command, progress: F) -> Result<Reply>
    where
        F: FnMut(u64, u64),
    {
        let Some(received) = receive_archive_with(&mut self.stream, progress).await? else {
            info!("{}: no archive", cmd.verb);
            return Ok(Reply::NoArchive);
        };

        let path = self.archive_path();
        tokio::fs::create_dir_all(&self.download_dir).await?;
        tokio::fs::write(&path, received.blob.as_bytes()).await?;
        let bytes = received.blob.len() as u64;
        info!("{}: stored {} byte archive at {}", cmd.verb, bytes, path.display());

        let extracted = if cmd.extract_on_complete {
            let archive = path.clone();
            let dest = self.download_dir.clone();
            let unpacked = tokio::task::spawn_blocking(move || unpack_archive(&archive, &dest))
                .await
                .map_err(|e| Error::Io(std::io::Error::other(e)))?;
            // The local archive goes whether or not extraction succeeded
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!("cannot remove {}: {}", path.display(), e);
            }
            let count = unpacked?;
            info!("{}: extracted {} entries, removed {}", cmd.verb, count, path.display());
            Some(count)
        } else {
            None
        };

        Ok(Reply::Archive {
            path,
            bytes,
            marker: received.marker,
            extracted,
        })
    }

    /// Send `quit` and wait for the acknowledgment
    pub async fn quit(mut self) -> Result<()> {
        let cmd = Command::parse(Verb::Quit.keyword())?;
        self.execute(&cmd).await.map(|_| ())
    }
}
