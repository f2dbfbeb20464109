//! FrameConnection: the frame codec bound to one TCP connection.
//!
//! # Scheduling model
//!
//! Every call blocks.  The connection starts no threads of its own; callers
//! drive a read loop (usually one per connection side) and write from
//! whichever thread produces data.  Reads and writes take independent locks,
//! so one thread can sit in [`FrameConnection::read_sequence`] while another
//! completes [`FrameConnection::send_payload`] on the same connection.
//!
//! # Disconnection versus disposal
//!
//! - The peer going away (reset, abort, refused, unreachable, shutdown, EOF)
//!   is *disconnection*: the connected flag drops, reads return `Ok(None)`,
//!   writes return [`TransportError::Disconnected`].
//! - [`FrameConnection::close`] is *disposal*: idempotent, safe while other
//!   threads are mid-call, and every later (or in-flight) operation returns
//!   [`TransportError::Disposed`].
//!
//! Any other I/O error is unexpected and propagates as
//! [`TransportError::Io`].

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::protocol::codec::{
    decode_packet, encode_frame, frame_body_len, ProtocolError, FRAME_PREFIX_SIZE,
};
use crate::protocol::messages::{SessionId, SyncPayload, ValidationError};
use crate::protocol::packet::Packet;
use crate::protocol::sequencer::{PacketSequencer, ReassembledSequence, SequenceAssembler};

/// Minimum time between two liveness checks of the same connection.
pub const LIVENESS_REFRESH_INTERVAL: Duration = Duration::from_millis(500);

/// Errors surfaced by a [`FrameConnection`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer is gone.
    #[error("peer disconnected")]
    Disconnected,

    /// The connection was closed locally.
    #[error("connection already disposed")]
    Disposed,

    /// An I/O error that does not mean disconnection.
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer sent a malformed frame or sequence.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A payload failed local validation before it was sent.
    #[error("invalid payload: {0}")]
    Validation(#[from] ValidationError),
}

#[derive(Debug)]
struct LivenessCache {
    checked_at: Option<Instant>,
    alive: bool,
}

/// Length-prefixed packet I/O over one `TcpStream`.
#[derive(Debug)]
pub struct FrameConnection {
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
    /// Lock-free handle used for shutdown and liveness checks.
    control: TcpStream,
    peer: SocketAddr,
    connected: AtomicBool,
    disposed: AtomicBool,
    liveness: Mutex<LivenessCache>,
}

impl FrameConnection {
    /// Wraps an established stream.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if the stream cannot be cloned or has
    /// no peer address.
    pub fn new(stream: TcpStream) -> Result<Self, TransportError> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            control: stream,
            peer,
            connected: AtomicBool::new(true),
            disposed: AtomicBool::new(false),
            liveness: Mutex::new(LivenessCache {
                checked_at: None,
                alive: true,
            }),
        })
    }

    /// Opens a TCP connection to `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Disconnected`] when the peer refuses or is
    /// unreachable, [`TransportError::Io`] otherwise.
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self, TransportError> {
        match TcpStream::connect(addr) {
            Ok(stream) => Self::new(stream),
            Err(e) if is_disconnect_error(&e) => Err(TransportError::Disconnected),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    // ── Writing ──────────────────────────────────────────────────────────────

    /// Writes one packet as one frame.
    pub fn write_packet(&self, packet: &Packet) -> Result<(), TransportError> {
        self.write_packets(std::slice::from_ref(packet))
    }

    /// Writes several packets back to back while holding the write lock, so
    /// no other writer can interleave frames into the sequence.
    pub fn write_packets(&self, packets: &[Packet]) -> Result<(), TransportError> {
        self.ensure_open()?;
        let frames = packets
            .iter()
            .map(encode_frame)
            .collect::<Result<Vec<_>, _>>()?;

        let mut writer = lock(&self.writer);
        let result = frames
            .iter()
            .try_for_each(|frame| writer.write_all(frame))
            .and_then(|()| writer.flush());
        drop(writer);

        self.settle(result.map_err(|e| self.translate(e)))
    }

    /// Fragments `payload` with `sequencer` and writes the whole sequence.
    pub fn send_payload(
        &self,
        sequencer: &PacketSequencer,
        payload: &SyncPayload,
    ) -> Result<(), TransportError> {
        payload.validate()?;
        let packets = sequencer.fragment_payload(payload)?;
        debug!(
            "sending {:?} to {} in {} fragment(s)",
            payload.payload_type(),
            self.peer,
            packets.len()
        );
        self.write_packets(&packets)
    }

    // ── Reading ──────────────────────────────────────────────────────────────

    /// Blocks until one complete frame arrives.
    ///
    /// Returns `Ok(None)` once the peer has gone away.
    pub fn read_packet(&self) -> Result<Option<Packet>, TransportError> {
        self.ensure_open()?;
        let mut reader = lock(&self.reader);
        let result = self.read_frame(&mut reader);
        drop(reader);
        self.settle_read(result)
    }

    /// Blocks until one complete sequence has been reassembled.
    ///
    /// Returns `Ok(None)` once the peer has gone away, even mid-sequence.
    ///
    /// # Errors
    ///
    /// A malformed fragment aborts the read with
    /// [`TransportError::Protocol`]; the caller decides whether to tear the
    /// connection down.
    pub fn read_sequence(&self) -> Result<Option<ReassembledSequence>, TransportError> {
        self.ensure_open()?;
        let mut reader = lock(&self.reader);
        let mut assembler = SequenceAssembler::new();
        let result = loop {
            match self.read_frame(&mut reader) {
                Ok(Some(packet)) => match assembler.push(packet) {
                    Ok(Some(sequence)) => break Ok(Some(sequence)),
                    Ok(None) => continue,
                    Err(e) => break Err(TransportError::Protocol(e)),
                },
                Ok(None) => {
                    if let Some((received, expected)) = assembler.progress() {
                        debug!("peer {} closed after {received}/{expected} fragments", self.peer);
                    }
                    break Ok(None);
                }
                Err(e) => break Err(e),
            }
        };
        drop(reader);
        self.settle_read(result)
    }

    /// Reads one sequence and decodes it, returning the sender and payload.
    pub fn read_payload(&self) -> Result<Option<(SessionId, SyncPayload)>, TransportError> {
        match self.read_sequence()? {
            Some(sequence) => Ok(Some((sequence.sender, sequence.decode()?))),
            None => Ok(None),
        }
    }

    fn read_frame(&self, stream: &mut TcpStream) -> Result<Option<Packet>, TransportError> {
        let mut prefix = [0u8; FRAME_PREFIX_SIZE];
        if !read_prefix(stream, &mut prefix).map_err(|e| self.translate(e))? {
            self.connected.store(false, Ordering::SeqCst);
            return Ok(None);
        }
        let body_len = frame_body_len(prefix)?;
        let mut body = vec![0u8; body_len];
        stream.read_exact(&mut body).map_err(|e| self.translate(e))?;
        Ok(Some(decode_packet(&body)?))
    }

    // ── State ────────────────────────────────────────────────────────────────

    /// `false` once a disconnect-class error or EOF has been observed.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.is_disposed()
    }

    /// Samples the socket's live status at most once per
    /// [`LIVENESS_REFRESH_INTERVAL`].  Between samples every caller sees the
    /// cached value.  A peer that has sent FIN reads as dead.
    pub fn is_alive(&self) -> bool {
        if self.is_disposed() {
            return false;
        }
        let mut cache = lock(&self.liveness);
        let due = cache
            .checked_at
            .map_or(true, |at| at.elapsed() >= LIVENESS_REFRESH_INTERVAL);
        if due {
            cache.alive = self.sample_liveness();
            cache.checked_at = Some(Instant::now());
            if !cache.alive {
                self.connected.store(false, Ordering::SeqCst);
            }
        }
        cache.alive
    }

    fn sample_liveness(&self) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        match self.control.take_error() {
            Ok(None) => {}
            Ok(Some(e)) | Err(e) => {
                debug!("liveness check for {} failed: {e}", self.peer);
                return false;
            }
        }
        match peek_readable(&self.control) {
            Ok(0) => {
                debug!("{} closed its side of the connection", self.peer);
                false
            }
            Ok(_) => true,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => true,
            Err(e) => {
                debug!("liveness check for {} failed: {e}", self.peer);
                false
            }
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Disposes the connection.  Safe to call repeatedly and from any thread;
    /// a thread blocked in a read is woken and observes
    /// [`TransportError::Disposed`].
    pub fn close(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        if let Err(e) = self.control.shutdown(Shutdown::Both) {
            if e.kind() != ErrorKind::NotConnected {
                warn!("shutdown of connection to {} failed: {e}", self.peer);
            }
        }
        debug!("connection to {} disposed", self.peer);
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_disposed() {
            Err(TransportError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Maps an I/O error to the transport taxonomy, updating the flags.
    fn translate(&self, e: io::Error) -> TransportError {
        if self.is_disposed() {
            TransportError::Disposed
        } else if is_disconnect_error(&e) {
            self.connected.store(false, Ordering::SeqCst);
            TransportError::Disconnected
        } else {
            TransportError::Io(e)
        }
    }

    /// Disposal observed during the call wins over whatever the call returned.
    fn settle<T>(&self, result: Result<T, TransportError>) -> Result<T, TransportError> {
        if self.is_disposed() {
            return Err(TransportError::Disposed);
        }
        result
    }

    fn settle_read<T>(&self, result: Result<Option<T>, TransportError>) -> Result<Option<T>, TransportError> {
        match self.settle(result) {
            Err(TransportError::Disconnected) => Ok(None),
            other => other,
        }
    }
}

impl Drop for FrameConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Fills `prefix`.  Returns `Ok(false)` on a clean EOF before the first byte.
fn read_prefix(stream: &mut impl Read, prefix: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < prefix.len() {
        match stream.read(&mut prefix[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(io::Error::from(ErrorKind::UnexpectedEof)),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Peeks one byte without blocking and without consuming it.  `Ok(0)` means
/// the peer has shut down its sending side.
#[cfg(unix)]
fn peek_readable(stream: &TcpStream) -> io::Result<usize> {
    use std::os::unix::io::AsRawFd;

    let mut byte = 0u8;
    // SAFETY: `byte` is a live one-byte buffer for the duration of the call
    // and the descriptor stays open while `stream` is borrowed.  The
    // per-call MSG_DONTWAIT leaves the shared blocking mode untouched.
    let n = unsafe {
        libc::recv(
            stream.as_raw_fd(),
            (&mut byte as *mut u8).cast::<libc::c_void>(),
            1,
            libc::MSG_PEEK | libc::MSG_DONTWAIT,
        )
    };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Without a per-call non-blocking peek, fall back to the peer address
/// lookup, which fails once the socket is no longer connected.
#[cfg(not(unix))]
fn peek_readable(stream: &TcpStream) -> io::Result<usize> {
    stream.peer_addr().map(|_| 1)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Returns `true` for socket errors that mean the peer is gone.
pub fn is_disconnect_error(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionRefused
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
    ) {
        return true;
    }
    // Network unreachable, network reset, and transport-endpoint shutdown
    // have no stable `ErrorKind` on the supported toolchain.
    #[cfg(target_os = "linux")]
    const RAW_DISCONNECT_CODES: &[i32] = &[101, 102, 108];
    #[cfg(target_os = "macos")]
    const RAW_DISCONNECT_CODES: &[i32] = &[51, 52, 58];
    #[cfg(windows)]
    const RAW_DISCONNECT_CODES: &[i32] = &[10051, 10052, 10058];
    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    const RAW_DISCONNECT_CODES: &[i32] = &[];

    e.raw_os_error()
        .is_some_and(|code| RAW_DISCONNECT_CODES.contains(&code))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{ClientUpdate, Operation, PayloadType};
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread;
    use uuid::Uuid;

    fn pair() -> (FrameConnection, FrameConnection) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = FrameConnection::connect(addr).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        (client, FrameConnection::new(accepted).unwrap())
    }

    fn packet(payload: &[u8]) -> Packet {
        PacketSequencer::new(Uuid::new_v4())
            .fragment(PayloadType::ClientUpdate, Some(payload))
            .remove(0)
    }

    #[test]
    fn test_write_then_read_single_packet() {
        let (a, b) = pair();
        let sent = packet(b"hello");

        a.write_packet(&sent).unwrap();
        let received = b.read_packet().unwrap();

        assert_eq!(received, Some(sent));
    }

    #[test]
    fn test_read_returns_none_after_peer_closes() {
        let (a, b) = pair();
        drop(a);

        assert!(b.read_packet().unwrap().is_none());
        assert!(!b.is_connected());
    }

    #[test]
    fn test_large_payload_travels_as_one_sequence() {
        let (a, b) = pair();
        let sender = Uuid::new_v4();
        let sequencer = PacketSequencer::new(sender);
        let ops = (0..50).map(|i| Operation::new(vec![i as u8; 400])).collect();
        let payload = SyncPayload::Update(ClientUpdate::new(Some(ops), None).unwrap());

        a.send_payload(&sequencer, &payload).unwrap();
        let (from, received) = b.read_payload().unwrap().expect("sequence");

        assert_eq!(from, sender);
        assert_eq!(received, payload);
    }

    #[test]
    fn test_negative_length_prefix_is_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut raw = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        let conn = FrameConnection::new(accepted).unwrap();

        raw.write_all(&(-5i32).to_le_bytes()).unwrap();

        assert!(matches!(
            conn.read_packet(),
            Err(TransportError::Protocol(ProtocolError::InvalidFrameLength(-5)))
        ));
    }

    #[test]
    fn test_close_is_idempotent_and_reports_disposed() {
        let (a, _b) = pair();

        a.close();
        a.close();

        assert!(a.is_disposed());
        assert!(!a.is_alive());
        assert!(matches!(a.read_packet(), Err(TransportError::Disposed)));
        assert!(matches!(a.write_packet(&packet(b"x")), Err(TransportError::Disposed)));
    }

    #[test]
    fn test_close_wakes_blocked_reader_with_disposed() {
        let (a, _b) = pair();
        let a = Arc::new(a);
        let reader = {
            let a = Arc::clone(&a);
            thread::spawn(move || a.read_packet())
        };
        thread::sleep(Duration::from_millis(50));

        a.close();
        let result = reader.join().expect("reader thread panicked");

        assert!(matches!(result, Err(TransportError::Disposed)));
    }

    #[test]
    fn test_write_proceeds_while_another_thread_reads() {
        let (a, b) = pair();
        let a = Arc::new(a);
        let reader = {
            let a = Arc::clone(&a);
            thread::spawn(move || a.read_packet())
        };
        thread::sleep(Duration::from_millis(20));

        // `a` writes while its own reader is blocked; `b` echoes back.
        a.write_packet(&packet(b"ping")).unwrap();
        let echoed = b.read_packet().unwrap().unwrap();
        b.write_packet(&echoed).unwrap();

        let received = reader.join().unwrap().unwrap();
        assert_eq!(received.map(|p| p.payload), Some(Some(b"ping".to_vec())));
    }

    #[test]
    fn test_write_to_departed_peer_reports_disconnected() {
        let (a, b) = pair();
        drop(b);

        let mut outcome = None;
        for _ in 0..50 {
            if let Err(e) = a.write_packet(&packet(&[0u8; 1024])) {
                outcome = Some(e);
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        assert!(matches!(outcome, Some(TransportError::Disconnected)));
        assert!(!a.is_connected());
    }

    #[test]
    fn test_is_alive_is_true_for_open_connection() {
        let (a, _b) = pair();
        assert!(a.is_alive());
        assert!(a.is_alive(), "cached value must be stable between samples");
    }

    #[cfg(unix)]
    #[test]
    fn test_is_alive_turns_false_after_peer_closes() {
        // Arrange
        let (a, b) = pair();
        assert!(a.is_alive());

        // Act
        drop(b);
        thread::sleep(LIVENESS_REFRESH_INTERVAL + Duration::from_millis(200));

        // Assert
        assert!(!a.is_alive());
        assert!(!a.is_connected());
    }

    #[cfg(unix)]
    #[test]
    fn test_unread_data_keeps_connection_alive() {
        // Arrange
        let (a, b) = pair();
        let sent = packet(b"pending");

        // Act
        b.write_packet(&sent).unwrap();
        thread::sleep(Duration::from_millis(100));

        // Assert
        assert!(a.is_alive());
        assert_eq!(a.read_packet().unwrap(), Some(sent));
    }

    #[test]
    fn test_disconnect_error_classification() {
        for kind in [
            ErrorKind::ConnectionReset,
            ErrorKind::ConnectionAborted,
            ErrorKind::ConnectionRefused,
            ErrorKind::NotConnected,
            ErrorKind::BrokenPipe,
        ] {
            assert!(is_disconnect_error(&io::Error::from(kind)), "{kind:?}");
        }
        assert!(!is_disconnect_error(&io::Error::from(ErrorKind::PermissionDenied)));
        assert!(!is_disconnect_error(&io::Error::from(ErrorKind::InvalidData)));
    }

    #[test]
    fn test_read_prefix_distinguishes_clean_eof_from_truncation() {
        let mut prefix = [0u8; 4];
        assert!(!read_prefix(&mut io::Cursor::new(Vec::new()), &mut prefix).unwrap());

        let err = read_prefix(&mut io::Cursor::new(vec![1, 2]), &mut prefix).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }
}
