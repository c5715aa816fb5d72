//! Daemon accept loop and per-connection session loop
//!
//! The accept loop owns the admission counter. Every admitted connection gets
//! its own task holding nothing but its stream and a read-only
//! [`SessionContext`]; commands on one connection are handled strictly one
//! after another.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};

use crate::archive::{ArchiveBlob, Archiver, TarZstdArchiver};
use crate::command::{Command, Verb};
use crate::config::ServerConfig;
use crate::connection::{send_ack, send_redirect, Admission, AdmissionPolicy, ConnectionState, Role};
use crate::error::{Error, Result};
use crate::matcher::{self, MatchCriterion};
use crate::protocol::{FILE_NOT_FOUND, HOME_UNREADABLE, INVALID_COMMAND, PROBE, QUIT_ACK};
use crate::transfer::{read_line, send_archive, send_no_archive, send_text};

/// Read-only state shared by every session of one daemon
pub struct SessionContext {
    pub home: PathBuf,
    pub archiver: Arc<dyn Archiver>,
    pub idle_timeout: Option<Duration>,
}

impl SessionContext {
    pub fn new(home: PathBuf, archiver: Arc<dyn Archiver>) -> Self {
        Self {
            home,
            archiver,
            idle_timeout: None,
        }
    }
}

enum Step {
    Continue,
    Quit,
}

fn join_error(e: tokio::task::JoinError) -> Error {
    Error::Io(io::Error::other(e))
}

/// Bound a session read by the idle timeout, when one is configured
async fn idle_bounded<F, T>(idle: Option<Duration>, read: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match idle {
        Some(limit) => timeout(limit, read).await.map_err(|_| {
            Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("idle for {} s", limit.as_secs()),
            ))
        })?,
        None => read.await,
    }
}

/// Serve one admitted connection until `quit`, peer close, or a fatal error
pub async fn run_session<S>(stream: S, ctx: &SessionContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = BufReader::new(stream);

    let mut probe = [0u8; 4];
    idle_bounded(ctx.idle_timeout, async {
        conn.read_exact(&mut probe)
            .await
            .map_err(|e| Error::framing("liveness probe", e))
    })
    .await?;
    // A client skipping the probe has just sent the start of its first command
    let mut carry = if &probe == PROBE {
        send_ack(&mut conn).await?;
        String::new()
    } else {
        String::from_utf8_lossy(&probe).into_owned()
    };

    loop {
        let Some(line) = idle_bounded(ctx.idle_timeout, read_line(&mut conn)).await? else {
            debug!("peer closed the connection");
            return Ok(());
        };
        let line = if carry.is_empty() {
            line
        } else {
            std::mem::take(&mut carry) + &line
        };

        match dispatch(&mut conn, ctx, &line).await? {
            Step::Continue => {}
            Step::Quit => return Ok(()),
        }
    }
}

async fn dispatch<S>(conn: &mut BufReader<S>, ctx: &SessionContext, line: &str) -> Result<Step>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let line = line.trim_end_matches(|c| c == ' ' || c == '\n' || c == '\r');
    info!("received command: {}", line);

    if line.as_bytes() == PROBE {
        send_ack(conn).await?;
        return Ok(Step::Continue);
    }

    let cmd = match Command::parse(line) {
        Ok(cmd) => cmd,
        Err(e) => {
            info!("rejected {:?}: {}", line, e);
            send_text(conn, INVALID_COMMAND).await?;
            return Ok(Step::Continue);
        }
    };

    match cmd.verb {
        Verb::Quit => {
            info!("client issued quit, closing connection");
            send_text(conn, QUIT_ACK).await?;
            Ok(Step::Quit)
        }
        Verb::FindFile => {
            let reply = find_file(ctx, &cmd.args[0]).await?;
            send_text(conn, &reply).await?;
            Ok(Step::Continue)
        }
        _ => {
            let started = Instant::now();
            match build_archive(ctx, &cmd).await {
                Ok(blob) => {
                    send_archive(conn, &blob).await?;
                    info!(
                        "{}: sent {} byte archive in {:.2?}",
                        cmd.verb,
                        blob.len(),
                        started.elapsed()
                    );
                }
                Err(e) if !e.is_fatal() => {
                    warn!("{}: no archive sent: {}", cmd.verb, e);
                    send_no_archive(conn).await?;
                }
                Err(e) => return Err(e),
            }
            Ok(Step::Continue)
        }
    }
}

async fn find_file(ctx: &SessionContext, name: &str) -> Result<String> {
    let home = ctx.home.clone();
    let name = name.to_string();
    let res = tokio::task::spawn_blocking(move || matcher::find_first(&home, &name))
        .await
        .map_err(join_error)?;
    match res {
        Ok(Some(found)) => Ok(found.render()),
        Ok(None) => Ok(FILE_NOT_FOUND.to_string()),
        Err(e @ Error::FilesystemAccess { .. }) => {
            warn!("findfile: {}", e);
            Ok(HOME_UNREADABLE.to_string())
        }
        Err(e) => Err(e),
    }
}

/// Match and pack on the blocking pool; no matches yields an empty blob
async fn build_archive(ctx: &SessionContext, cmd: &Command) -> Result<ArchiveBlob> {
    let Some(criterion) = MatchCriterion::from_command(cmd)? else {
        return Ok(ArchiveBlob::empty());
    };
    let home = ctx.home.clone();
    let archiver = Arc::clone(&ctx.archiver);
    tokio::task::spawn_blocking(move || {
        let matched = matcher::run(&home, &criterion)?;
        if !matched.found.is_empty() {
            debug!("requested names found: {:?}", matched.found);
        }
        archiver.create_archive(&matched.paths)
    })
    .await
    .map_err(join_error)?
}

/// A bound daemon, ready to accept
pub struct Server {
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    policy: AdmissionPolicy,
    role: Role,
    mirror_host: String,
    mirror_port: u16,
}

impl Server {
    pub async fn bind(config: &ServerConfig, home: PathBuf) -> anyhow::Result<Self> {
        use anyhow::Context;
        let listener = TcpListener::bind(&config.bind)
            .await
            .with_context(|| format!("bind {}", config.bind))?;
        let archiver = TarZstdArchiver::new(home.clone(), config.resolve_spool_dir());
        let mut ctx = SessionContext::new(home, Arc::new(archiver));
        ctx.idle_timeout = config.idle_timeout();
        Ok(Self {
            listener,
            ctx: Arc::new(ctx),
            policy: AdmissionPolicy::new(config.role),
            role: config.role,
            mirror_host: config.mirror_host.clone(),
            mirror_port: config.mirror_port,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept forever
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Accept until `shutdown` resolves; sessions already running are left to finish
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            "treefetch {} daemon listening on {} home={}",
            self.role,
            self.local_addr()?,
            self.ctx.home.display()
        );
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested after {} connections", self.policy.accepted());
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let _ = stream.set_nodelay(true);
                            self.admit(stream, peer);
                        }
                        Err(e) => warn!("accept failed: {}", e),
                    }
                }
            }
        }
    }

    fn admit(&mut self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let n = self.policy.accepted();
        match self.policy.admit() {
            Admission::Direct => {
                let state = ConnectionState {
                    peer,
                    role: self.role,
                    sequence: n,
                };
                info!("connection {} serviced directly", state);
                let ctx = Arc::clone(&self.ctx);
                tokio::spawn(async move {
                    match run_session(stream, &ctx).await {
                        Ok(()) => info!("session {} ended", state),
                        Err(e) => warn!("session {} ended: {}", state, e),
                    }
                });
            }
            Admission::Redirect => {
                info!(
                    "connection #{} from {} redirected to {}:{}",
                    n, peer, self.mirror_host, self.mirror_port
                );
                let host = self.mirror_host.clone();
                let port = self.mirror_port;
                tokio::spawn(async move {
                    if let Err(e) = send_redirect(stream, &host, port).await {
                        warn!("redirect of {} failed: {}", peer, e);
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::{read_text, receive_archive};
    use std::fs;
    use tempfile::TempDir;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    struct Fixture {
        home: TempDir,
        _spool: TempDir,
        ctx: Arc<SessionContext>,
    }

    fn fixture() -> Fixture {
        let home = TempDir::new().unwrap();
        let spool = TempDir::new().unwrap();
        fs::write(home.path().join("a.txt"), vec![b'a'; 10]).unwrap();
        fs::write(home.path().join("b.txt"), vec![b'b'; 1000]).unwrap();
        let archiver = TarZstdArchiver::new(home.path(), spool.path());
        let ctx = Arc::new(SessionContext::new(home.path().to_path_buf(), Arc::new(archiver)));
        Fixture {
            home,
            _spool: spool,
            ctx,
        }
    }

    async fn start(ctx: Arc<SessionContext>) -> (DuplexStream, tokio::task::JoinHandle<Result<()>>) {
        let (mut client, server) = duplex(1 << 20);
        let task = tokio::spawn(async move { run_session(server, &ctx).await });
        client.write_all(PROBE).await.unwrap();
        assert_eq!(read_text(&mut client).await.unwrap(), crate::protocol::ACK);
        (client, task)
    }

    #[tokio::test]
    async fn quit_is_acknowledged_and_ends_session() {
        let fx = fixture();
        let (mut client, task) = start(fx.ctx.clone()).await;
        client.write_all(b"quit\n").await.unwrap();
        assert_eq!(read_text(&mut client).await.unwrap(), QUIT_ACK);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn invalid_command_keeps_connection_open() {
        let fx = fixture();
        let (mut client, task) = start(fx.ctx.clone()).await;
        client.write_all(b"dgetfiles 2024-01-10 2024-01-01\n").await.unwrap();
        assert_eq!(read_text(&mut client).await.unwrap(), INVALID_COMMAND);
        client.write_all(b"findfile b.txt\n").await.unwrap();
        let reply = read_text(&mut client).await.unwrap();
        assert!(reply.starts_with("File found: "), "{reply}");
        assert!(reply.contains("Size: 1000 bytes"));
        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn findfile_miss_sends_no_archive() {
        let fx = fixture();
        let (mut client, _task) = start(fx.ctx.clone()).await;
        client.write_all(b"findfile report.pdf\n").await.unwrap();
        assert_eq!(read_text(&mut client).await.unwrap(), FILE_NOT_FOUND);
    }

    #[tokio::test]
    async fn size_search_sends_archive() {
        let fx = fixture();
        let (mut client, _task) = start(fx.ctx.clone()).await;
        client.write_all(b"sgetfiles 5 100\n").await.unwrap();
        let got = receive_archive(&mut client).await.unwrap().unwrap();
        assert_eq!(got.marker, "Tar received");

        let mut archive = tar::Archive::new(zstd::Decoder::new(got.blob.as_bytes()).unwrap());
        let names: Vec<PathBuf> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().into_owned())
            .collect();
        assert_eq!(names, vec![PathBuf::from("a.txt")]);
    }

    #[tokio::test]
    async fn empty_match_sends_no_archive_header() {
        let fx = fixture();
        let (mut client, _task) = start(fx.ctx.clone()).await;
        client.write_all(b"gettargz pdf\n").await.unwrap();
        assert!(receive_archive(&mut client).await.unwrap().is_none());
        // Session still answers
        client.write_all(b"test\n").await.unwrap();
        assert_eq!(read_text(&mut client).await.unwrap(), crate::protocol::ACK);
    }

    #[tokio::test]
    async fn unreadable_home_answers_instead_of_dropping() {
        let fx = fixture();
        let gone = fx.home.path().join("missing");
        let ctx = Arc::new(SessionContext::new(gone, Arc::clone(&fx.ctx.archiver)));
        let (mut client, _task) = start(ctx).await;
        client.write_all(b"findfile a.txt\n").await.unwrap();
        assert_eq!(read_text(&mut client).await.unwrap(), HOME_UNREADABLE);
        client.write_all(b"sgetfiles 0 10\n").await.unwrap();
        assert!(receive_archive(&mut client).await.unwrap().is_none());
    }

    struct FailingArchiver;

    impl Archiver for FailingArchiver {
        fn create_archive(&self, paths: &[PathBuf]) -> Result<ArchiveBlob> {
            Err(Error::ArchiveCreation {
                path: paths.first().cloned().unwrap_or_default(),
                source: io::ErrorKind::NotFound.into(),
            })
        }
    }

    #[tokio::test]
    async fn archive_failure_answers_with_no_archive() {
        let fx = fixture();
        let ctx = Arc::new(SessionContext::new(fx.home.path().to_path_buf(), Arc::new(FailingArchiver)));
        let (mut client, _task) = start(ctx).await;
        client.write_all(b"getfiles a.txt\n").await.unwrap();
        assert!(receive_archive(&mut client).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_probe_is_tolerated() {
        let fx = fixture();
        let (mut client, server) = duplex(1 << 16);
        let ctx = fx.ctx.clone();
        tokio::spawn(async move { run_session(server, &ctx).await });
        client.write_all(b"quit\n").await.unwrap();
        assert_eq!(read_text(&mut client).await.unwrap(), QUIT_ACK);
    }

    #[tokio::test]
    async fn idle_session_times_out() {
        let fx = fixture();
        let mut ctx = SessionContext::new(fx.home.path().to_path_buf(), Arc::clone(&fx.ctx.archiver));
        ctx.idle_timeout = Some(Duration::from_millis(50));
        let (_client, task) = start(Arc::new(ctx)).await;
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn silent_peer_times_out_before_probe() {
        let fx = fixture();
        let mut ctx = SessionContext::new(fx.home.path().to_path_buf(), Arc::clone(&fx.ctx.archiver));
        ctx.idle_timeout = Some(Duration::from_millis(50));
        let (_client, server) = duplex(1024);
        let task = tokio::spawn(async move { run_session(server, &ctx).await });
        let res = timeout(Duration::from_secs(5), task)
            .await
            .expect("session must give up on a peer that never probes")
            .unwrap();
        match res {
            Err(Error::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::TimedOut),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
