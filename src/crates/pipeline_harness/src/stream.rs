use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, warn, Span};

use crate::error::{HarnessError, HarnessResult};
use crate::synth::{FieldSet, StreamWiring};

const SOCKET_NAME: &str = "socket";
const ACCEPT_POLL: Duration = Duration::from_millis(10);

enum Peer {
    Pending,
    Connected(UnixStream),
    Failed(String),
    Cancelled,
    Taken,
}

struct PeerState {
    peer: Peer,
    closed: bool,
}

/// One-shot latch flipped by the acceptor thread when the engine connects
/// (or when accepting gives up).
struct Readiness {
    state: Mutex<PeerState>,
    signal: Condvar,
}

impl Readiness {
    fn new() -> Self {
        Self {
            state: Mutex::new(PeerState {
                peer: Peer::Pending,
                closed: false,
            }),
            signal: Condvar::new(),
        }
    }

    fn publish(&self, outcome: io::Result<UnixStream>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !matches!(state.peer, Peer::Pending) {
            return;
        }
        state.peer = match outcome {
            // The sender was closed before the engine showed up: hand it an
            // immediate end of input instead of a connection nobody writes to.
            Ok(stream) if state.closed => {
                let _ = stream.shutdown(Shutdown::Write);
                Peer::Taken
            }
            Ok(stream) => Peer::Connected(stream),
            Err(err) => Peer::Failed(err.to_string()),
        };
        self.signal.notify_all();
    }

    fn cancel(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(state.peer, Peer::Pending) {
            state.peer = Peer::Cancelled;
            self.signal.notify_all();
        }
    }

    fn wait(&self, timeout: Duration) -> HarnessResult<UnixStream> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut state, _) = self
            .signal
            .wait_timeout_while(state, timeout, |state| {
                matches!(state.peer, Peer::Pending)
            })
            .unwrap_or_else(PoisonError::into_inner);

        match std::mem::replace(&mut state.peer, Peer::Taken) {
            Peer::Connected(stream) => Ok(stream),
            Peer::Pending => {
                state.peer = Peer::Pending;
                Err(HarnessError::WriteTimeout(timeout))
            }
            Peer::Failed(message) => {
                state.peer = Peer::Failed(message.clone());
                Err(HarnessError::Io(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    message,
                )))
            }
            Peer::Cancelled | Peer::Taken => Err(HarnessError::StreamClosed),
        }
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        if matches!(state.peer, Peer::Connected(_)) {
            if let Peer::Connected(stream) = std::mem::replace(&mut state.peer, Peer::Taken) {
                let _ = stream.shutdown(Shutdown::Write);
            }
        }
    }
}

/// Input socket and output sink for one logical test case.
///
/// The engine connects to the socket as a client and reads input lines from
/// it; it writes the matching events to the sink file, which the harness
/// drains once the engine is done.
pub struct StreamChannel {
    span: Span,
    codec: String,
    fields: FieldSet,
    timeout: Duration,
    socket_path: PathBuf,
    sink_path: PathBuf,
    dir: Option<TempDir>,
    sink: Option<NamedTempFile>,
    readiness: Arc<Readiness>,
    cancel: Arc<AtomicBool>,
    acceptor: Option<thread::JoinHandle<()>>,
    sender: Option<UnixStream>,
    closed: bool,
}

impl StreamChannel {
    /// Bind a fresh socket and sink and start waiting for the engine to connect.
    ///
    /// `timeout` bounds how long [`write`](Self::write) waits for that connection.
    pub fn create(
        codec: impl Into<String>,
        fields: FieldSet,
        timeout: Duration,
        span: Span,
    ) -> HarnessResult<Self> {
        let dir = tempfile::Builder::new()
            .prefix("lfv-stream-")
            .tempdir()
            .map_err(|err| HarnessError::allocation("stream directory", err))?;
        let socket_path = dir.path().join(SOCKET_NAME);
        let listener = UnixListener::bind(&socket_path)
            .map_err(|err| HarnessError::allocation("stream socket", err))?;
        listener
            .set_nonblocking(true)
            .map_err(|err| HarnessError::allocation("stream socket", err))?;

        let sink = tempfile::Builder::new()
            .prefix("lfv-sink-")
            .suffix(".jsonl")
            .tempfile()
            .map_err(|err| HarnessError::allocation("stream sink", err))?;
        let sink_path = sink.path().to_path_buf();

        let readiness = Arc::new(Readiness::new());
        let cancel = Arc::new(AtomicBool::new(false));
        let acceptor = spawn_acceptor(listener, readiness.clone(), cancel.clone(), span.clone());

        debug!(
            parent: &span,
            socket = %socket_path.display(),
            sink = %sink_path.display(),
            "stream channel created"
        );

        Ok(Self {
            span,
            codec: codec.into(),
            fields,
            timeout,
            socket_path,
            sink_path,
            dir: Some(dir),
            sink: Some(sink),
            readiness,
            cancel,
            acceptor: Some(acceptor),
            sender: None,
            closed: false,
        })
    }

    pub fn codec(&self) -> &str {
        &self.codec
    }

    pub fn fields(&self) -> &FieldSet {
        &self.fields
    }

    /// Path of the listening socket the engine connects to.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Path of the file the engine writes this stream's events to.
    pub fn sink_path(&self) -> &Path {
        &self.sink_path
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn wiring(&self) -> StreamWiring<'_> {
        StreamWiring {
            socket_path: &self.socket_path,
            sink_path: &self.sink_path,
            codec: &self.codec,
            fields: &self.fields,
        }
    }

    /// Forward bytes to the engine, waiting for it to connect first.
    ///
    /// Nothing is written if the engine does not connect within the timeout.
    pub fn write(&mut self, bytes: &[u8]) -> HarnessResult<usize> {
        if self.closed {
            return Err(HarnessError::StreamClosed);
        }
        if self.sender.is_none() {
            let stream = self.readiness.wait(self.timeout)?;
            debug!(parent: &self.span, socket = %self.socket_path.display(), "engine connected");
            self.sender = Some(stream);
        }
        let sender = self.sender.as_mut().ok_or(HarnessError::StreamClosed)?;
        sender.write_all(bytes)?;
        Ok(bytes.len())
    }

    /// Write a single record followed by the line separator.
    pub fn write_line(&mut self, line: &str) -> HarnessResult<usize> {
        let mut record = String::with_capacity(line.len() + 1);
        record.push_str(line);
        record.push('\n');
        self.write(record.as_bytes())
    }

    /// Close the sending side. Calling it again is a no-op.
    pub fn close(&mut self) -> HarnessResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.readiness.close();
        if let Some(sender) = self.sender.take() {
            match sender.shutdown(Shutdown::Write) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotConnected => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Current size of the sink in bytes.
    pub fn sink_len(&self) -> HarnessResult<u64> {
        let sink = self.sink.as_ref().ok_or(HarnessError::StreamClosed)?;
        Ok(sink.as_file().metadata()?.len())
    }

    /// Read every complete line the engine has written to the sink so far.
    pub fn read_events(&mut self) -> HarnessResult<Vec<String>> {
        let sink = self.sink.as_mut().ok_or(HarnessError::StreamClosed)?;
        let file = sink.as_file_mut();
        file.seek(SeekFrom::Start(0))?;
        let mut text = String::new();
        file.read_to_string(&mut text)?;

        Ok(text
            .split_inclusive('\n')
            .filter(|line| line.ends_with('\n'))
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Close the sink handle, which also removes the file.
    pub fn close_sink(&mut self) {
        if let Some(sink) = self.sink.take() {
            if let Err(err) = sink.close() {
                debug!(parent: &self.span, error = %err, "sink already gone");
            }
        }
    }

    /// Tear down the listener, sender, backing directory and sink.
    ///
    /// Safe to call repeatedly and on a half-used channel.
    pub fn release(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        if let Err(err) = self.close() {
            debug!(parent: &self.span, error = %err, "closing sender during release failed");
        }
        if let Some(handle) = self.acceptor.take() {
            let _ = handle.join();
        }
        if let Some(dir) = self.dir.take() {
            if let Err(err) = dir.close() {
                warn!(parent: &self.span, error = %err, "failed to remove stream directory");
            }
        }
        self.close_sink();
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        self.release();
    }
}

/// Release every channel in the slice.
pub fn release_streams(streams: &mut [StreamChannel]) {
    for stream in streams {
        stream.release();
    }
}

fn spawn_acceptor(
    listener: UnixListener,
    readiness: Arc<Readiness>,
    cancel: Arc<AtomicBool>,
    span: Span,
) -> thread::JoinHandle<()> {
    thread::spawn(move || loop {
        match listener.accept() {
            Ok((stream, _)) => {
                let outcome = stream.set_nonblocking(false).map(|()| stream);
                readiness.publish(outcome);
                return;
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                if cancel.load(Ordering::SeqCst) {
                    readiness.cancel();
                    return;
                }
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(parent: &span, error = %err, "accept on stream socket failed");
                readiness.publish(Err(err));
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader};
    use std::time::Instant;

    use super::*;

    fn channel(timeout: Duration) -> StreamChannel {
        StreamChannel::create("line", FieldSet::new(), timeout, Span::none())
            .expect("stream channel")
    }

    #[test]
    fn write_times_out_without_peer() {
        let timeout = Duration::from_millis(200);
        let mut stream = channel(timeout);

        let start = Instant::now();
        let err = stream.write(b"hello\n").expect_err("no peer connected");
        let elapsed = start.elapsed();

        assert!(matches!(err, HarnessError::WriteTimeout(t) if t == timeout));
        assert!(elapsed >= timeout, "returned after {elapsed:?}");
        assert!(elapsed < timeout + Duration::from_secs(2), "returned after {elapsed:?}");
    }

    #[test]
    fn write_reaches_connected_peer() {
        let mut stream = channel(Duration::from_secs(5));
        let peer = UnixStream::connect(stream.socket_path()).expect("connect");

        assert_eq!(stream.write_line("first").expect("write"), 6);
        stream.write_line("second").expect("write");
        stream.close().expect("close");

        let lines: Vec<String> = BufReader::new(peer)
            .lines()
            .collect::<Result<_, _>>()
            .expect("read lines");
        assert_eq!(lines, vec!["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn close_is_idempotent_and_blocks_later_writes() {
        let mut stream = channel(Duration::from_millis(50));
        stream.close().expect("first close");
        stream.close().expect("second close");
        assert!(matches!(stream.write(b"x"), Err(HarnessError::StreamClosed)));
    }

    #[test]
    fn late_peer_sees_end_of_input_after_close() {
        let mut stream = channel(Duration::from_millis(50));
        stream.close().expect("close");

        let mut peer = UnixStream::connect(stream.socket_path()).expect("connect");
        peer.set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");
        let mut buf = Vec::new();
        peer.read_to_end(&mut buf).expect("eof");
        assert!(buf.is_empty());
    }

    #[test]
    fn release_removes_everything_and_can_repeat() {
        let mut stream = channel(Duration::from_millis(50));
        let socket = stream.socket_path().to_path_buf();
        let dir = socket.parent().expect("socket dir").to_path_buf();
        let sink = stream.sink_path().to_path_buf();
        assert!(socket.exists());
        assert!(sink.exists());

        stream.release();
        stream.release();

        assert!(!socket.exists());
        assert!(!dir.exists());
        assert!(!sink.exists());
    }

    #[test]
    fn read_events_skips_partial_trailing_line() {
        let mut stream = channel(Duration::from_millis(50));
        std::fs::write(stream.sink_path(), "{\"a\":1}\n\n{\"b\":2}\n{\"c\"").expect("write sink");

        let lines = stream.read_events().expect("drain");
        assert_eq!(lines, vec![r#"{"a":1}"#, r#"{"b":2}"#]);
    }
}
