// ABOUTME: Receive thread for a connected link
// ABOUTME: Reads the transport, feeds the frame decoder and dispatches frames to the session

use crate::link::session::Link;
use crate::protocol::decoder::FrameDecoder;
use std::io::{self, Read};
use std::thread::{self, JoinHandle};

/// Spawn the receive thread for session `version`
pub(crate) fn spawn(
    link: Link,
    reader: Box<dyn Read + Send>,
    version: u32,
) -> io::Result<JoinHandle<()>> {
    let name = link.config().receiver_thread_name.clone();
    thread::Builder::new()
        .name(name)
        .spawn(move || run(link, reader, version))
}

fn run(link: Link, mut reader: Box<dyn Read + Send>, version: u32) {
    let mut decoder = FrameDecoder::new();
    let mut buffer = vec![0u8; link.config().read_buffer_size];

    log::debug!("Receive thread started (version {})", version);

    loop {
        let result = reader.read(&mut buffer);

        // Teardown closes the transport to unblock the read above
        if !link.is_current(version) || !link.is_connected() {
            break;
        }

        match result {
            Ok(0) => {
                link.on_transport_error(
                    version,
                    io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer"),
                );
                break;
            }
            Ok(n) => {
                decoder.feed(&buffer[..n], |frame| {
                    log::trace!("Received {:?}", frame);
                    link.handle_frame(version, frame);
                });
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                link.on_transport_error(version, e);
                break;
            }
        }
    }

    log::debug!("Receive thread exiting (version {})", version);
}
