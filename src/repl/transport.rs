//! Transport seam between primary and replicas.
//!
//! The coordinator and standby apply loop only see [`ReplicaChannel`];
//! tests use the in-memory pair, deployments use the TCP channel. Both
//! ends of a channel are symmetric: send delivers to the peer, recv drains
//! this end's queue.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{HeartwoodError, Result};
use crate::repl::wire::{Message, MESSAGE_HDR_LEN};
use crate::types::crc32;

/// Bidirectional, message-oriented link to one peer.
pub trait ReplicaChannel: Send {
    /// Delivers a message to the peer.
    fn send(&self, msg: &Message) -> Result<()>;

    /// Waits up to `timeout` for a message from the peer. `Ok(None)` means
    /// the timeout elapsed; a closed channel is an error.
    fn recv(&self, timeout: Duration) -> Result<Option<Message>>;
}

fn closed() -> HeartwoodError {
    HeartwoodError::Io(io::Error::new(
        io::ErrorKind::BrokenPipe,
        "replication channel closed",
    ))
}

struct Queue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

struct QueueState {
    messages: VecDeque<Message>,
    closed: bool,
}

impl Queue {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                messages: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        })
    }

    fn push(&self, msg: Message) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(closed());
        }
        state.messages.push_back(msg);
        self.ready.notify_one();
        Ok(())
    }

    fn pop(&self, timeout: Duration) -> Result<Option<Message>> {
        let mut state = self.state.lock();
        loop {
            if let Some(msg) = state.messages.pop_front() {
                return Ok(Some(msg));
            }
            if state.closed {
                return Err(closed());
            }
            if self.ready.wait_for(&mut state, timeout).timed_out() {
                return Ok(None);
            }
        }
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.ready.notify_all();
    }
}

/// One end of an in-memory channel pair. Clones share the same queues, so
/// a test can keep a handle to an end it has given away.
#[derive(Clone)]
pub struct MemoryChannel {
    inbox: Arc<Queue>,
    outbox: Arc<Queue>,
}

impl MemoryChannel {
    /// Simulates a network partition: both directions error from now on.
    pub fn disconnect(&self) {
        self.inbox.close();
        self.outbox.close();
    }
}

impl ReplicaChannel for MemoryChannel {
    fn send(&self, msg: &Message) -> Result<()> {
        self.outbox.push(msg.clone())
    }

    fn recv(&self, timeout: Duration) -> Result<Option<Message>> {
        self.inbox.pop(timeout)
    }
}

/// Builds a connected pair of in-memory channels.
pub fn memory_pair() -> (MemoryChannel, MemoryChannel) {
    let a_to_b = Queue::new();
    let b_to_a = Queue::new();
    (
        MemoryChannel {
            inbox: Arc::clone(&b_to_a),
            outbox: Arc::clone(&a_to_b),
        },
        MemoryChannel {
            inbox: a_to_b,
            outbox: b_to_a,
        },
    )
}

/// A [`ReplicaChannel`] over one TCP stream, using the wire framing.
pub struct TcpChannel {
    stream: Mutex<TcpStream>,
}

impl TcpChannel {
    /// Wraps an accepted or connected stream.
    pub fn new(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream: Mutex::new(stream),
        })
    }

    /// Connects to a primary or replica endpoint.
    pub fn connect(addr: &str) -> Result<Self> {
        Self::new(TcpStream::connect(addr)?)
    }
}

impl ReplicaChannel for TcpChannel {
    fn send(&self, msg: &Message) -> Result<()> {
        let bytes = msg.encode();
        let mut stream = self.stream.lock();
        stream.write_all(&bytes)?;
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> Result<Option<Message>> {
        let mut stream = self.stream.lock();
        stream.set_read_timeout(Some(timeout))?;
        let mut hdr = [0u8; MESSAGE_HDR_LEN];
        match stream.read_exact(&mut hdr) {
            Ok(()) => {}
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        }
        let len = u32::from_be_bytes(hdr[0..4].try_into().unwrap()) as usize;
        let crc = u32::from_be_bytes(hdr[4..8].try_into().unwrap());
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body)?;
        if crc32(&[&body]) != crc {
            return Err(HeartwoodError::Corruption("wire frame checksum mismatch"));
        }
        Message::decode_body(&body).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Epoch, Lsn};

    #[test]
    fn memory_pair_delivers_both_ways() {
        let (a, b) = memory_pair();
        a.send(&Message::Heartbeat {
            end_lsn: Lsn(1),
            epoch: Epoch(0),
        })
        .unwrap();
        b.send(&Message::Ack {
            received: Lsn(1),
            flushed: Lsn(1),
            applied: Lsn(0),
            epoch: Epoch(0),
        })
        .unwrap();
        assert!(matches!(
            b.recv(Duration::from_millis(100)).unwrap(),
            Some(Message::Heartbeat { .. })
        ));
        assert!(matches!(
            a.recv(Duration::from_millis(100)).unwrap(),
            Some(Message::Ack { .. })
        ));
    }

    #[test]
    fn recv_times_out_when_idle() {
        let (a, _b) = memory_pair();
        assert!(a.recv(Duration::from_millis(10)).unwrap().is_none());
    }

    #[test]
    fn disconnect_closes_both_directions() {
        let (a, b) = memory_pair();
        a.disconnect();
        assert!(b
            .send(&Message::Heartbeat {
                end_lsn: Lsn(0),
                epoch: Epoch(0),
            })
            .is_err());
        assert!(b.recv(Duration::from_millis(10)).is_err());
    }

    #[test]
    fn tcp_channel_roundtrip() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            TcpChannel::new(stream).unwrap()
        });
        let client = TcpChannel::connect(&addr.to_string()).unwrap();
        let server = accept.join().unwrap();
        client
            .send(&Message::Start {
                start_lsn: Lsn(128),
                epoch: Epoch(1),
            })
            .unwrap();
        match server.recv(Duration::from_secs(2)).unwrap() {
            Some(Message::Start { start_lsn, epoch }) => {
                assert_eq!(start_lsn, Lsn(128));
                assert_eq!(epoch, Epoch(1));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
