//! Chunked file transfers.
//!
//! Uploads (`FileIn`) arrive as chunks after the request and before the
//! reply. Downloads (`FileOut`) go out as chunks after an OK reply, so once
//! a download has started the only way left to report a failure is a
//! cancel chunk.

use crate::error::HandlerError;
use crate::transport::Transport;
use guestd_proto::chunk::encode_chunk;
use guestd_proto::message::encode_reply;
use guestd_proto::{CANCEL_FLAG, Chunk, ChunkKind, Frame, LAUNCH_FLAG, MAX_CHUNK_SIZE, PROGRESS_FLAG};
use guestd_proto::{ProtoError, XdrDecode};
use std::io::{self, Read};

/// How an upload ended.
#[derive(Debug)]
pub enum Received<E> {
    /// The controller sent every chunk and the sink accepted them all.
    Complete,
    /// The sink failed. The controller has been told to stop and the
    /// remaining chunks were discarded; an ERROR reply is still owed.
    SinkFailed(E),
    /// The controller cancelled; it expects no reply.
    PeerCancelled,
}

impl<E: Into<HandlerError>> Received<E> {
    pub fn into_result(self) -> Result<(), HandlerError> {
        match self {
            Received::Complete => Ok(()),
            Received::SinkFailed(e) => Err(e.into()),
            Received::PeerCancelled => Err(HandlerError::Cancelled),
        }
    }
}

/// The incoming chunk stream of an upload.
pub struct FileIn<'t> {
    transport: &'t mut Transport,
    finished: bool,
}

impl<'t> FileIn<'t> {
    pub(crate) fn new(transport: &'t mut Transport) -> Self {
        Self {
            transport,
            finished: false,
        }
    }

    /// Whether chunks are still waiting to be read.
    pub fn is_pending(&self) -> bool {
        !self.finished
    }

    fn next_chunk(&mut self) -> Result<Chunk, ProtoError> {
        loop {
            match self.transport.read_frame()? {
                Some(Frame::Message(buf)) => return Chunk::from_xdr(&buf),
                // A late cancel from the controller; the cancel chunk that
                // follows it is what ends the stream.
                Some(Frame::Cancel) => continue,
                Some(Frame::Launch) => return Err(ProtoError::UnexpectedFlag(LAUNCH_FLAG)),
                Some(Frame::Progress(_)) => return Err(ProtoError::UnexpectedFlag(PROGRESS_FLAG)),
                None => return Err(ProtoError::UnexpectedEof),
            }
        }
    }

    /// Feed every chunk to `sink` until the stream ends.
    pub fn receive<E>(
        &mut self,
        mut sink: impl FnMut(&[u8]) -> Result<(), E>,
    ) -> Result<Received<E>, ProtoError> {
        if self.finished {
            return Ok(Received::Complete);
        }
        self.finished = true;

        loop {
            let chunk = self.next_chunk()?;
            match chunk.kind() {
                ChunkKind::More => {
                    if let Err(e) = sink(&chunk.data) {
                        self.send_cancel()?;
                        return Ok(Received::SinkFailed(e));
                    }
                }
                ChunkKind::End => return Ok(Received::Complete),
                ChunkKind::Cancel => {
                    tracing::warn!("Upload cancelled by the controller");
                    return Ok(Received::PeerCancelled);
                }
            }
        }
    }

    /// Refuse the upload without reading it, e.g. when the target could
    /// not be opened.
    pub fn cancel(&mut self) -> Result<(), ProtoError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.send_cancel()
    }

    /// Ask the controller to stop, then discard chunks until it does.
    fn send_cancel(&mut self) -> Result<(), ProtoError> {
        tracing::warn!("Cancelling upload");
        self.transport.send_flag(CANCEL_FLAG)?;
        while self.next_chunk()?.kind() == ChunkKind::More {}
        Ok(())
    }
}

/// How a download ended.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Streamed {
    Completed,
    /// The download failed part way and was ended with a cancel chunk.
    Cancelled,
    PeerCancelled,
}

/// The right to answer a download request.
pub struct FileOut<'t> {
    transport: &'t mut Transport,
    proc_nr: i32,
    serial: u32,
}

impl<'t> FileOut<'t> {
    pub(crate) fn new(transport: &'t mut Transport, proc_nr: i32, serial: u32) -> Self {
        Self {
            transport,
            proc_nr,
            serial,
        }
    }

    /// Send the OK reply, then run `body` to write the payload.
    ///
    /// Failures from `body` become a cancel chunk since no error reply is
    /// possible any more; only a broken channel comes back as `Err`. This
    /// must be the last thing a download handler does.
    pub fn stream<F>(self, body: F) -> Result<Streamed, HandlerError>
    where
        F: FnOnce(&mut FileStream<'_>) -> Result<(), HandlerError>,
    {
        self.transport
            .send_message(&encode_reply(self.proc_nr, self.serial, &()))?;

        let mut stream = FileStream {
            transport: self.transport,
        };
        match body(&mut stream) {
            Ok(()) => {
                stream.send_chunk(false, &[])?;
                Ok(Streamed::Completed)
            }
            Err(HandlerError::Cancelled) => Ok(Streamed::PeerCancelled),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::warn!("Download failed after reply: {}", e);
                stream.send_chunk(true, &[])?;
                Ok(Streamed::Cancelled)
            }
        }
    }
}

/// The outgoing side of a download in progress.
pub struct FileStream<'t> {
    transport: &'t mut Transport,
}

impl FileStream<'_> {
    fn send_chunk(&mut self, cancel: bool, data: &[u8]) -> Result<(), ProtoError> {
        self.transport.send_message(&encode_chunk(cancel, data))
    }

    /// Send `data`, split into chunks of at most `MAX_CHUNK_SIZE`.
    ///
    /// Returns `HandlerError::Cancelled` once the controller has cancelled;
    /// the closing cancel chunk has then already been sent.
    pub fn write(&mut self, data: &[u8]) -> Result<(), HandlerError> {
        for piece in data.chunks(MAX_CHUNK_SIZE) {
            if self.transport.cancel_pending()? {
                tracing::warn!("Download cancelled by the controller");
                self.send_chunk(true, &[])?;
                return Err(HandlerError::Cancelled);
            }
            self.send_chunk(false, piece)?;
        }
        Ok(())
    }
}

/// Fill `buf` from `reader`, stopping early only at end of input.
pub fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
