//! Per-connection submission handling.
//!
//! A session resolves the submitting team, sends the banner and then
//! streams: every complete line is classified in its own task while the
//! reader keeps reading, so responses come back in completion order. A
//! single writer task owns the write half and writes whole lines, which
//! keeps responses from interleaving.

use crate::protocol::{next_line, Frame, Response};
use crate::team::{TeamId, TeamResolver};
use crate::validator::Validator;
use bytes::{Bytes, BytesMut};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Read buffer size
const BUFFER_SIZE: usize = 4 * 1024;

/// Sent instead of the banner when the peer is not on a team network
const UNKNOWN_TEAM_MESSAGE: &str = "Could not determine your team from your address";

type SessionResult = Result<SessionState, Box<dyn std::error::Error + Send + Sync>>;

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, banner not yet queued
    AwaitingBannerSent,
    /// Banner queued, accepting submissions
    Streaming,
    /// Ended by EOF or idle timeout
    Closed,
    /// Ended by a protocol violation or the pre-banner error path
    Errored,
}

/// Shared, read-only state handed to every session.
pub struct SessionContext {
    pub validator: Arc<Validator>,
    pub teams: Arc<TeamResolver>,
    /// Banner including the `\n\n` terminator
    pub banner: Bytes,
    /// Close after this long without receiving bytes; also bounds each write
    pub idle_timeout: Option<Duration>,
    pub max_line_length: usize,
    /// In-flight validations allowed per connection
    pub max_pending: usize,
}

struct Session {
    peer: SocketAddr,
    team: TeamId,
    state: SessionState,
}

impl Session {
    fn transition(&mut self, next: SessionState) {
        trace!(peer = %self.peer, from = ?self.state, to = ?next, "Session state change");
        self.state = next;
    }
}

/// Run one submission session until the peer goes away.
///
/// Returns the state the session ended in. I/O errors on the read side are
/// returned as errors.
pub async fn handle_connection<R, W>(
    mut reader: R,
    mut writer: W,
    peer: SocketAddr,
    ctx: Arc<SessionContext>,
) -> SessionResult
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let Some(team) = ctx.teams.resolve(peer.ip()) else {
        debug!(peer = %peer, "No team for peer address");
        writer
            .write_all(&Response::error_message(UNKNOWN_TEAM_MESSAGE))
            .await?;
        writer.shutdown().await?;
        return Ok(SessionState::Errored);
    };

    let mut session = Session {
        peer,
        team,
        state: SessionState::AwaitingBannerSent,
    };
    debug!(peer = %peer, team, "Session started");

    // The writer sends the banner before anything else it receives
    let (tx, rx) = mpsc::channel(ctx.max_pending.max(1));
    let mut writer_task = tokio::spawn(write_responses(
        writer,
        ctx.banner.clone(),
        rx,
        ctx.idle_timeout,
    ));
    session.transition(SessionState::Streaming);

    let result = read_submissions(&mut reader, &mut session, &ctx, tx).await;

    // In-flight validations hold their own senders; wait for their
    // responses to drain, bounded by the idle timeout
    let joined = match ctx.idle_timeout {
        Some(timeout) => tokio::time::timeout(timeout, &mut writer_task).await,
        None => Ok((&mut writer_task).await),
    };
    match joined {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => debug!(peer = %peer, error = %e, "Write failed"),
        Ok(Err(e)) => warn!(peer = %peer, error = %e, "Writer task failed"),
        Err(_) => {
            debug!(peer = %peer, "Timed out flushing responses");
            writer_task.abort();
        }
    }

    debug!(peer = %peer, team, state = ?session.state, "Session ended");
    result
}

/// Await `future` unless `deadline` passes first.
async fn before<F: Future>(deadline: Option<Instant>, future: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, future).await.ok(),
        None => Some(future.await),
    }
}

async fn read_submissions<R>(
    reader: &mut R,
    session: &mut Session,
    ctx: &Arc<SessionContext>,
    tx: mpsc::Sender<BytesMut>,
) -> SessionResult
where
    R: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);
    let pending = Arc::new(Semaphore::new(ctx.max_pending.max(1)));

    // Idle time counts from the last received byte, including time spent
    // waiting for an in-flight slot
    let idle_deadline = || ctx.idle_timeout.map(|timeout| Instant::now() + timeout);
    let mut deadline = idle_deadline();

    loop {
        loop {
            match next_line(&mut buffer, ctx.max_line_length) {
                Frame::Line(line) => {
                    if tx.is_closed() {
                        debug!(peer = %session.peer, "Writer gone, closing");
                        session.transition(SessionState::Closed);
                        return Ok(session.state);
                    }

                    let slot = Arc::clone(&pending).acquire_owned();
                    let Some(permit) = before(deadline, slot).await else {
                        debug!(peer = %session.peer, "Idle timeout with submissions in flight");
                        session.transition(SessionState::Closed);
                        return Ok(session.state);
                    };

                    dispatch(line, session.team, ctx, &tx, permit?);
                }
                Frame::Incomplete => break,
                Frame::TooLong => {
                    warn!(peer = %session.peer, limit = ctx.max_line_length, "Line too long");
                    session.transition(SessionState::Errored);
                    return Ok(session.state);
                }
            }
        }

        let Some(read) = before(deadline, reader.read_buf(&mut buffer)).await else {
            debug!(peer = %session.peer, "Idle timeout");
            session.transition(SessionState::Closed);
            return Ok(session.state);
        };

        match read {
            Ok(0) => {
                if !buffer.is_empty() {
                    trace!(peer = %session.peer, bytes = buffer.len(), "Discarding partial line");
                }
                session.transition(SessionState::Closed);
                return Ok(session.state);
            }
            Ok(_) => deadline = idle_deadline(),
            Err(e) => {
                session.transition(SessionState::Errored);
                return Err(e.into());
            }
        }
    }
}

/// Classify one line in its own task, holding an in-flight slot until the
/// response is queued.
fn dispatch(
    line: Bytes,
    team: TeamId,
    ctx: &Arc<SessionContext>,
    tx: &mpsc::Sender<BytesMut>,
    permit: OwnedSemaphorePermit,
) {
    let validator = Arc::clone(&ctx.validator);
    let tx = tx.clone();

    // Detached: the validation finishes even if the connection goes away
    tokio::spawn(async move {
        let code = validator.classify(&line, team);
        trace!(team, %code, "Classified submission");

        // A closed channel means the writer is gone; drop the response
        let _ = tx.send(Response::line(&line, &code)).await;
        drop(permit);
    });
}

/// Write `buf` and flush, failing with `TimedOut` if the peer stops reading.
async fn write_within<W>(writer: &mut W, buf: &[u8], timeout: Option<Duration>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let write = async {
        writer.write_all(buf).await?;
        writer.flush().await
    };

    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, write)
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))?,
        None => write.await,
    }
}

/// Write the banner, then response lines as they arrive.
async fn write_responses<W>(
    mut writer: W,
    banner: Bytes,
    mut rx: mpsc::Receiver<BytesMut>,
    write_timeout: Option<Duration>,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_within(&mut writer, &banner, write_timeout).await?;

    while let Some(mut batch) = rx.recv().await {
        // Coalesce whatever else is ready into one write
        while let Ok(line) = rx.try_recv() {
            batch.extend_from_slice(&line);
        }
        write_within(&mut writer, &batch, write_timeout).await?;
    }

    writer.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Tick;
    use crate::protocol::{FlagFormat, ResponseCode, ResponseLine};
    use crate::storage::{FlagInfo, FlagStore, MemoryStore, StoreError};
    use crate::validator::tests::{test_store, FLAG, OLD_FLAG};
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Condvar, Mutex};
    use tokio::io::{duplex, AsyncBufReadExt, BufReader, DuplexStream};

    const BANNER: &str = "Welcome to the flag submission\nOne flag per line";

    fn context(idle_timeout: Option<Duration>) -> Arc<SessionContext> {
        context_with(test_store(), idle_timeout, 4)
    }

    fn context_with(
        store: Arc<dyn FlagStore>,
        idle_timeout: Option<Duration>,
        max_pending: usize,
    ) -> Arc<SessionContext> {
        let validator = Validator::new(store, FlagFormat::default(), 5);
        Arc::new(SessionContext {
            validator: Arc::new(validator),
            teams: Arc::new(TeamResolver::new(vec![[10, 32], [10, 33]], 1, None)),
            banner: Response::banner(BANNER),
            idle_timeout,
            max_line_length: 128,
            max_pending,
        })
    }

    /// Store whose lookups block until released, one lookup per release
    struct GatedStore {
        inner: Arc<MemoryStore>,
        entered: AtomicUsize,
        released: Mutex<usize>,
        gate: Condvar,
    }

    impl GatedStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: test_store(),
                entered: AtomicUsize::new(0),
                released: Mutex::new(0),
                gate: Condvar::new(),
            })
        }

        fn release(&self, lookups: usize) {
            *self.released.lock().unwrap() += lookups;
            self.gate.notify_all();
        }

        fn entered(&self) -> usize {
            self.entered.load(Ordering::SeqCst)
        }
    }

    impl FlagStore for GatedStore {
        fn lookup(&self, flag: &str) -> Result<Option<FlagInfo>, StoreError> {
            self.entered.fetch_add(1, Ordering::SeqCst);
            let mut released = self.released.lock().unwrap();
            while *released == 0 {
                released = self.gate.wait(released).unwrap();
            }
            *released -= 1;
            drop(released);
            self.inner.lookup(flag)
        }
        fn is_submitted(&self, flag: &str, team: TeamId) -> Result<bool, StoreError> {
            self.inner.is_submitted(flag, team)
        }
        fn record(&self, flag: &str, team: TeamId) -> Result<bool, StoreError> {
            self.inner.record(flag, team)
        }
        fn current_tick(&self) -> Result<Tick, StoreError> {
            self.inner.current_tick()
        }
    }

    async fn wait_for_lookups(store: &GatedStore, count: usize) {
        for _ in 0..500 {
            if store.entered() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("only {} of {} lookups started", store.entered(), count);
    }

    fn team_peer(team: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 32, team, 2)), 40000)
    }

    /// Start a session for `peer`, returning the client end
    fn start(
        ctx: Arc<SessionContext>,
        peer: SocketAddr,
    ) -> (DuplexStream, tokio::task::JoinHandle<SessionResult>) {
        let (client, server) = duplex(64 * 1024);
        let handle = tokio::spawn(async move {
            let (reader, writer) = tokio::io::split(server);
            handle_connection(reader, writer, peer, ctx).await
        });
        (client, handle)
    }

    async fn read_banner<R: AsyncRead + Unpin>(reader: &mut R) -> Vec<u8> {
        let mut banner = vec![0u8; BANNER.len() + 2];
        reader.read_exact(&mut banner).await.unwrap();
        banner
    }

    #[tokio::test]
    async fn test_banner_only() {
        let (client, handle) = start(context(None), team_peer(1));
        let (mut reader, mut writer) = tokio::io::split(client);

        let banner = read_banner(&mut reader).await;
        assert!(banner.ends_with(b"\n\n"));
        assert_eq!(&banner[..BANNER.len()], BANNER.as_bytes());

        writer.shutdown().await.unwrap();
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        assert_eq!(handle.await.unwrap().unwrap(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_exact_banner_bytes() {
        let reader = tokio_test::io::Builder::new().build();
        let writer = tokio_test::io::Builder::new()
            .write(b"Welcome to the flag submission\nOne flag per line\n\n")
            .build();

        let state = handle_connection(reader, writer, team_peer(1), context(None))
            .await
            .unwrap();
        assert_eq!(state, SessionState::Closed);
    }

    #[tokio::test]
    async fn test_submit_ok_then_dup() {
        let (client, handle) = start(context(None), team_peer(1));
        let (reader, mut writer) = tokio::io::split(client);
        let mut reader = BufReader::new(reader);
        read_banner(&mut reader).await;

        let mut line = String::new();
        writer.write_all(format!("{FLAG}\n").as_bytes()).await.unwrap();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, format!("{FLAG} OK Accepted\n"));

        line.clear();
        writer.write_all(format!("{FLAG}\r\n").as_bytes()).await.unwrap();
        reader.read_line(&mut line).await.unwrap();
        let parsed = ResponseLine::parse(line.as_bytes()).unwrap();
        assert_eq!(parsed.flag, FLAG.as_bytes());
        assert_eq!(parsed.code, ResponseCode::Dup);

        drop(writer);
        drop(reader);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_pipelined_before_banner() {
        let ctx = context(None);
        let (client, handle) = start(Arc::clone(&ctx), team_peer(1));
        let (reader, mut writer) = tokio::io::split(client);

        // Everything is sent before the banner is read, then the write side closes
        let submissions = format!("{FLAG}\n{OLD_FLAG}\n{FLAG}\ngarbage\n\nFLAG_partial");
        writer.write_all(submissions.as_bytes()).await.unwrap();
        writer.shutdown().await.unwrap();

        let mut reader = BufReader::new(reader);
        let banner = read_banner(&mut reader).await;
        assert!(banner.ends_with(b"\n\n"));

        let mut responses = Vec::new();
        let mut line = Vec::new();
        while reader.read_until(b'\n', &mut line).await.unwrap() > 0 {
            responses.push(ResponseLine::parse(&line).unwrap());
            line.clear();
        }
        assert_eq!(handle.await.unwrap().unwrap(), SessionState::Closed);

        // Order is not guaranteed, so compare per flag
        assert_eq!(responses.len(), 5);
        let codes_for = |flag: &[u8]| -> Vec<ResponseCode> {
            responses
                .iter()
                .filter(|r| r.flag == flag)
                .map(|r| r.code.clone())
                .collect()
        };

        let mut main_codes = codes_for(FLAG.as_bytes());
        main_codes.sort_by_key(|c| c.to_string());
        assert_eq!(main_codes, vec![ResponseCode::Dup, ResponseCode::Ok]);
        assert_eq!(codes_for(OLD_FLAG.as_bytes()), vec![ResponseCode::Old]);
        assert_eq!(codes_for(b"garbage"), vec![ResponseCode::Inv]);
        // The blank line is answered too, with an empty echo
        assert_eq!(codes_for(b""), vec![ResponseCode::Inv]);

        let stats = ctx.validator.stats().snapshot();
        assert_eq!(stats.total(), 5);
    }

    #[tokio::test]
    async fn test_own_flag() {
        let (client, handle) = start(context(None), team_peer(3));
        let (reader, mut writer) = tokio::io::split(client);
        let mut reader = BufReader::new(reader);
        read_banner(&mut reader).await;

        writer.write_all(format!("{FLAG}\n").as_bytes()).await.unwrap();
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, format!("{FLAG} OWN This is your own flag\n"));

        drop(writer);
        drop(reader);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_non_ascii_echo() {
        let (client, handle) = start(context(None), team_peer(1));
        let (reader, mut writer) = tokio::io::split(client);
        let mut reader = BufReader::new(reader);
        read_banner(&mut reader).await;

        let flag = "FLAG_\u{00e4}\u{1F6A9}".as_bytes();
        writer.write_all(flag).await.unwrap();
        writer.write_all(b"\n").await.unwrap();

        let mut line = Vec::new();
        reader.read_until(b'\n', &mut line).await.unwrap();
        let parsed = ResponseLine::parse(&line).unwrap();
        assert_eq!(parsed.flag, flag);
        assert_eq!(parsed.code, ResponseCode::Inv);

        drop(writer);
        drop(reader);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_team_gets_error_instead_of_banner() {
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5)), 40000);
        let (mut client, handle) = start(context(None), peer);

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();

        assert_eq!(received, format!("{UNKNOWN_TEAM_MESSAGE}\n").as_bytes());
        assert!(!received.windows(2).any(|w| w == b"\n\n"));
        assert_eq!(handle.await.unwrap().unwrap(), SessionState::Errored);
    }

    #[tokio::test]
    async fn test_line_too_long_closes() {
        let (client, handle) = start(context(None), team_peer(1));
        let (mut reader, mut writer) = tokio::io::split(client);
        read_banner(&mut reader).await;

        writer.write_all(&[b'A'; 512]).await.unwrap();

        assert_eq!(handle.await.unwrap().unwrap(), SessionState::Errored);
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout() {
        let (client, handle) = start(context(Some(Duration::from_secs(30))), team_peer(1));
        let (mut reader, _writer) = tokio::io::split(client);
        read_banner(&mut reader).await;

        // The paused clock auto-advances once every task is idle
        assert_eq!(handle.await.unwrap().unwrap(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_responses_survive_half_close() {
        let ctx = context(None);
        let (client, handle) = start(Arc::clone(&ctx), team_peer(2));
        let (mut reader, mut writer) = tokio::io::split(client);

        writer.write_all(format!("{FLAG}\n").as_bytes()).await.unwrap();
        writer.shutdown().await.unwrap();

        read_banner(&mut reader).await;
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, format!("{FLAG} OK Accepted\n").as_bytes());

        handle.await.unwrap().unwrap();
        assert_eq!(ctx.validator.stats().snapshot().ok, 1);
    }

    #[tokio::test]
    async fn test_blank_line_is_invalid() {
        let (client, handle) = start(context(None), team_peer(1));
        let (reader, mut writer) = tokio::io::split(client);
        let mut reader = BufReader::new(reader);
        read_banner(&mut reader).await;

        writer.write_all(b"  \r\n").await.unwrap();
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "   INV Invalid flag\n");

        drop(writer);
        drop(reader);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_pending_limit_stops_reading() {
        let store = GatedStore::new();
        let ctx = context_with(store.clone(), None, 2);
        let (client, handle) = start(ctx, team_peer(1));
        let (reader, mut writer) = tokio::io::split(client);
        let mut reader = BufReader::new(reader);
        read_banner(&mut reader).await;

        let flags: Vec<String> = (0..5)
            .map(|i| format!("FLAG_{}", i.to_string().repeat(32)))
            .collect();
        for flag in &flags {
            writer.write_all(format!("{flag}\n").as_bytes()).await.unwrap();
        }

        // Two validations in flight, the third line waits for a slot
        wait_for_lookups(&store, 2).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.entered(), 2);

        store.release(1);
        wait_for_lookups(&store, 3).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.entered(), 3);

        store.release(flags.len());
        let mut responses = Vec::new();
        let mut line = Vec::new();
        for _ in 0..flags.len() {
            line.clear();
            reader.read_until(b'\n', &mut line).await.unwrap();
            responses.push(ResponseLine::parse(&line).unwrap());
        }
        assert!(responses.iter().all(|r| r.code == ResponseCode::Inv));
        assert_eq!(store.entered(), flags.len());

        drop(writer);
        drop(reader);
        assert_eq!(handle.await.unwrap().unwrap(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_when_client_never_reads() {
        let ctx = context(Some(Duration::from_secs(30)));
        let (client, server) = duplex(256);
        let handle = tokio::spawn(async move {
            let (reader, writer) = tokio::io::split(server);
            handle_connection(reader, writer, team_peer(1), ctx).await
        });

        // Keep the read half open without reading, so responses back up
        let (_reader, mut writer) = tokio::io::split(client);
        let flooding = tokio::spawn(async move {
            let _ = writer.write_all(&b"garbage\n".repeat(200)).await;
            writer
        });

        let finished = tokio::time::timeout(Duration::from_secs(3600), handle).await;
        let state = finished.expect("session outlived the idle timeout");
        assert_eq!(state.unwrap().unwrap(), SessionState::Closed);

        flooding.abort();
    }
}
