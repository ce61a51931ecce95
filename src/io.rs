//! The buffered non-blocking read and write-with-retry used by the engine
//! to move bytes on and off a `Server` socket, plain or TLS.

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::socket::{SocketState, Transport};

const CHUNK: usize = 4 * 1024;

/// Reads as much as is available into `state.read_buffer`, growing it in
/// `CHUNK`-sized steps, until the socket would block, the peer closes, or
/// the connection's data cap is hit. Returns the number of bytes now
/// unconsumed in the buffer (`remaining()`).
///
/// The unconsumed tail from a prior read is never disturbed — callers only
/// ever `mark_read` what the external parser actually consumed, and the
/// buffer itself preserves everything after that across calls.
pub fn read(state: &mut SocketState, max_data_per_conn: usize) -> Result<usize> {
    loop {
        if state.read_buffer.remaining() >= max_data_per_conn {
            return Err(Error::OverLimit);
        }

        if state.read_buffer.remaining_mut() < CHUNK {
            state.read_buffer.reserve(CHUNK);
        }

        let n = {
            let SocketState {
                read_buffer,
                transport,
                tls,
                handshake_done,
                ..
            } = state;
            let buf = std::borrow::BorrowMut::borrow_mut(read_buffer);
            let transport = transport
                .as_mut()
                .ok_or(Error::InvalidParam("read on released socket"))?;

            match (tls.as_deref_mut(), *handshake_done) {
                (Some(session), true) => read_tls_plaintext(session, transport, buf)?,
                _ => read_plain(transport, buf)?,
            }
        };

        match n {
            Some(0) => {
                return Err(Error::ReadFailed(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed connection",
                )))
            }
            Some(n) => {
                state.read_buffer.mark_written(n);
                if n < CHUNK {
                    // Short read: the descriptor is drained for now.
                    return Ok(state.read_buffer.remaining());
                }
            }
            None => return Ok(state.read_buffer.remaining()),
        }
    }
}

fn read_plain(transport: &mut Transport, buf: &mut [u8]) -> Result<Option<usize>> {
    let stream = transport
        .as_stream_mut()
        .ok_or(Error::InvalidParam("plain read on bare transport"))?;
    match stream.read(buf) {
        Ok(n) => Ok(Some(n)),
        Err(e) if Error::is_transient_io(&e) => Ok(None),
        Err(e) => Err(Error::ReadFailed(e)),
    }
}

fn read_tls_plaintext(
    session: &mut rustls::ServerConnection,
    transport: &mut Transport,
    buf: &mut [u8],
) -> Result<Option<usize>> {
    let stream = transport
        .as_stream_mut()
        .ok_or(Error::InvalidParam("TLS read on bare transport"))?;

    loop {
        match session.read_tls(stream) {
            Ok(0) => return Ok(Some(0)),
            Ok(_) => {
                if let Err(e) = session.process_new_packets() {
                    return Err(Error::TlsError(e));
                }
            }
            Err(e) if Error::is_transient_io(&e) => break,
            Err(e) => return Err(Error::ReadFailed(e)),
        }
    }

    match session.reader().read(buf) {
        Ok(n) => Ok(Some(n)),
        Err(e) if Error::is_transient_io(&e) => Ok(None),
        Err(e) => Err(Error::ReadFailed(e)),
    }
}

/// Writes all of `buf`, backing off through up to five "octaves" of
/// retry on transient errors: 1000 tries at 1 ms, then each octave divides
/// the retry budget by 10 (1000, 100, 10, 1, 1) and multiplies the sleep by
/// 10. Total budget is about 5 seconds. A successful partial write resets
/// the ladder.
pub fn write(state: &mut SocketState, buf: &[u8]) -> Result<()> {
    let mut offset = 0;
    let mut max_try = 1000u32;
    let mut cnt_rty = 0u32;
    let mut timer_ms = 1u64;
    let mut time_out_sec: i64 = 5;

    while offset < buf.len() {
        let n = {
            let SocketState {
                transport,
                tls,
                handshake_done,
                ..
            } = state;
            let transport = transport
                .as_mut()
                .ok_or(Error::InvalidParam("write on released socket"))?;

            match (tls.as_deref_mut(), *handshake_done) {
                (Some(session), true) => write_tls(session, transport, &buf[offset..])?,
                _ => write_plain(transport, &buf[offset..])?,
            }
        };

        match n {
            Some(n) if n > 0 => {
                offset += n;
                max_try = 1000;
                cnt_rty = 0;
                timer_ms = 1;
                time_out_sec = 5;
            }
            _ => {
                std::thread::sleep(Duration::from_millis(timer_ms));
                cnt_rty += 1;
                if cnt_rty >= max_try {
                    max_try = if max_try <= 1 { 1 } else { max_try / 10 };
                    cnt_rty = 0;
                    timer_ms = (timer_ms * 10).min(1000);
                    time_out_sec -= 1;
                }
                if time_out_sec < 0 {
                    return Err(Error::WriteFailed(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "write retry budget exhausted",
                    )));
                }
            }
        }
    }
    Ok(())
}

fn write_plain(transport: &mut Transport, buf: &[u8]) -> Result<Option<usize>> {
    let stream = transport
        .as_stream_mut()
        .ok_or(Error::InvalidParam("plain write on bare transport"))?;
    match stream.write(buf) {
        Ok(n) => Ok(Some(n)),
        Err(e) if Error::is_transient_io(&e) => Ok(None),
        Err(e) => Err(Error::WriteFailed(e)),
    }
}

fn write_tls(
    session: &mut rustls::ServerConnection,
    transport: &mut Transport,
    buf: &[u8],
) -> Result<Option<usize>> {
    let stream = transport
        .as_stream_mut()
        .ok_or(Error::InvalidParam("TLS write on bare transport"))?;
    let n = session
        .writer()
        .write(buf)
        .map_err(Error::WriteFailed)?;
    loop {
        match session.write_tls(stream) {
            Ok(_) if session.wants_write() => continue,
            Ok(_) => break,
            Err(e) if Error::is_transient_io(&e) => return Ok(None),
            Err(e) => return Err(Error::WriteFailed(e)),
        }
    }
    Ok(Some(n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use crate::socket::SocketState;

    fn bare_state(fd: std::os::fd::RawFd) -> SocketState {
        SocketState {
            transport: Some(Transport::Bare(fd)),
            tls: None,
            handshake_done: true,
            read_buffer: Buffer::new(0),
            request_handle: None,
            companion: None,
            timer_expired: false,
            closed: false,
        }
    }

    #[test]
    fn over_limit_reported_before_touching_fd() {
        let mut state = bare_state(-1);
        state.read_buffer.reserve(16);
        state.read_buffer.mark_written(16);
        let result = read(&mut state, 16);
        assert!(matches!(result, Err(Error::OverLimit)));
    }
}
