// ABOUTME: Byte stream transports the link can run over
// ABOUTME: Transport trait with TCP and in-memory channel implementations

use crossbeam::channel::{self, Receiver, Sender};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

/// Ordered, connection-oriented byte stream supplied by the caller.
///
/// The link takes one reader for its receive thread and one writer for the
/// encoder, then calls [`Transport::close`] exactly once during teardown.
pub trait Transport: Send {
    /// Blocking reader for the receive thread
    fn reader(&mut self) -> io::Result<Box<dyn Read + Send>>;

    /// Writer for the encoder
    fn writer(&mut self) -> io::Result<Box<dyn Write + Send>>;

    /// Release the connection. Should unblock a pending read where possible.
    fn close(&mut self);
}

impl Transport for TcpStream {
    fn reader(&mut self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn writer(&mut self) -> io::Result<Box<dyn Write + Send>> {
        // Frames are small and written in one call each
        self.set_nodelay(true)?;
        Ok(Box::new(self.try_clone()?))
    }

    fn close(&mut self) {
        if let Err(e) = self.shutdown(Shutdown::Both) {
            log::debug!("TCP shutdown failed: {}", e);
        }
    }
}

/// One end of an in-memory byte pipe
pub struct ChannelTransport {
    incoming: Option<Receiver<Vec<u8>>>,
    outgoing: Option<Sender<Vec<u8>>>,
    closed_tx: Option<Sender<()>>,
    closed_rx: Receiver<()>,
}

/// Create two connected in-memory transports
pub fn pair() -> (ChannelTransport, ChannelTransport) {
    let (a_tx, a_rx) = channel::unbounded();
    let (b_tx, b_rx) = channel::unbounded();
    (ChannelTransport::new(a_rx, b_tx), ChannelTransport::new(b_rx, a_tx))
}

impl ChannelTransport {
    fn new(incoming: Receiver<Vec<u8>>, outgoing: Sender<Vec<u8>>) -> Self {
        let (closed_tx, closed_rx) = channel::bounded(0);
        Self {
            incoming: Some(incoming),
            outgoing: Some(outgoing),
            closed_tx: Some(closed_tx),
            closed_rx,
        }
    }

    /// Take the reading half. Can only be taken once.
    pub fn channel_reader(&mut self) -> io::Result<ChannelReader> {
        let rx = self
            .incoming
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "reader already taken"))?;
        Ok(ChannelReader {
            rx,
            closed: self.closed_rx.clone(),
            pending: Vec::new(),
            offset: 0,
            timeout: None,
        })
    }

    /// Create a writing half
    pub fn channel_writer(&self) -> io::Result<ChannelWriter> {
        let tx = self
            .outgoing
            .clone()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        Ok(ChannelWriter { tx })
    }
}

impl Transport for ChannelTransport {
    fn reader(&mut self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(self.channel_reader()?))
    }

    fn writer(&mut self) -> io::Result<Box<dyn Write + Send>> {
        Ok(Box::new(self.channel_writer()?))
    }

    fn close(&mut self) {
        self.outgoing = None;
        self.closed_tx = None;
    }
}

/// Reading half of a [`ChannelTransport`]
pub struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    closed: Receiver<()>,
    pending: Vec<u8>,
    offset: usize,
    timeout: Option<Duration>,
}

impl ChannelReader {
    /// Fail reads with `TimedOut` after waiting this long (None blocks forever)
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    fn next_chunk(&self) -> io::Result<Option<Vec<u8>>> {
        match self.timeout {
            Some(timeout) => channel::select! {
                recv(self.rx) -> chunk => Ok(chunk.ok()),
                recv(self.closed) -> _ => Ok(None),
                default(timeout) => Err(io::ErrorKind::TimedOut.into()),
            },
            None => channel::select! {
                recv(self.rx) -> chunk => Ok(chunk.ok()),
                recv(self.closed) -> _ => Ok(None),
            },
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        while self.offset >= self.pending.len() {
            match self.next_chunk()? {
                Some(chunk) => {
                    self.pending = chunk;
                    self.offset = 0;
                }
                // Peer gone or this end closed
                None => return Ok(0),
            }
        }

        let available = &self.pending[self.offset..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.offset += n;
        Ok(n)
    }
}

/// Writing half of a [`ChannelTransport`]
pub struct ChannelWriter {
    tx: Sender<Vec<u8>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
