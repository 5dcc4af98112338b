// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Framing over a byte stream: one canonical S-expression per packet.
//!
//! The reader accumulates bytes in a [`BytesMut`] and re-parses until the
//! incremental parser yields a complete frame. The writer retries short
//! writes and, when the transport refuses to take more without blocking,
//! stashes the unsent tail so the next send on the descriptor can flush it
//! (`EINPROGRESS` semantics).

use std::io::{self, ErrorKind, Read, Write};

use bytes::BytesMut;
use seap_sexp::{canonical, SExp};

use crate::error::{Error, Result};
use crate::packet::DecodeError;

const READ_CHUNK: usize = 8 * 1024;

pub struct FrameReader {
    src: Box<dyn Read + Send>,
    buf: BytesMut,
}

impl FrameReader {
    pub fn new(src: Box<dyn Read + Send>) -> FrameReader {
        FrameReader {
            src,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Blocks until one full frame has been read and decoded.
    ///
    /// EOF exactly on a frame boundary is [`Error::Closed`] when `eof_ok`
    /// is set; EOF anywhere else truncates a frame and is a transport
    /// error.
    pub fn recv_sexp(&mut self, eof_ok: bool) -> Result<SExp> {
        loop {
            match canonical::parse_frame(&self.buf).map_err(|e| Error::Decode(DecodeError::from(e)))? {
                canonical::Parsed::Complete { sexp, consumed } => {
                    let _ = self.buf.split_to(consumed);
                    return Ok(sexp);
                }
                canonical::Parsed::Partial => {}
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = loop {
                match self.src.read(&mut chunk) {
                    Ok(n) => break n,
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(e) => return Err(Error::Transport(e)),
                }
            };
            if n == 0 {
                return if self.buf.is_empty() && eof_ok {
                    Err(Error::Closed)
                } else {
                    Err(Error::Transport(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "link closed mid-frame",
                    )))
                };
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

pub struct FrameWriter {
    dst: Box<dyn Write + Send>,
    // Unsent tail of a partially written frame.
    pending: Vec<u8>,
}

impl FrameWriter {
    pub fn new(dst: Box<dyn Write + Send>) -> FrameWriter {
        FrameWriter {
            dst,
            pending: Vec::new(),
        }
    }

    /// Whether a previous frame is still waiting to be flushed.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Encodes and writes one frame, flushing any stashed tail first.
    pub fn send_sexp(&mut self, sexp: &SExp) -> Result<usize> {
        self.flush_pending()?;

        let frame = canonical::encode(sexp);
        let sent = self.write_frame(&frame)?;
        debug_assert_eq!(sent, frame.len());
        self.dst.flush()?;
        Ok(sent)
    }

    fn flush_pending(&mut self) -> Result<()> {
        while !self.pending.is_empty() {
            match self.dst.write(&self.pending) {
                Ok(0) => {
                    return Err(Error::Transport(io::Error::new(
                        ErrorKind::WriteZero,
                        "failed to write whole frame",
                    )))
                }
                Ok(n) => {
                    let _ = self.pending.drain(..n);
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Err(Error::InProgress),
                Err(e) => return Err(Error::Transport(e)),
            }
        }
        Ok(())
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<usize> {
        let mut off = 0;
        while off < frame.len() {
            match self.dst.write(&frame[off..]) {
                Ok(0) => {
                    return Err(Error::Transport(io::Error::new(
                        ErrorKind::WriteZero,
                        "failed to write whole frame",
                    )))
                }
                Ok(n) => off += n,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    self.pending = frame[off..].to_vec();
                    return Err(Error::InProgress);
                }
                Err(e) => return Err(Error::Transport(e)),
            }
        }
        Ok(frame.len())
    }
}
