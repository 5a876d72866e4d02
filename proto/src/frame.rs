//! Length-prefixed framing.
//!
//! Every frame starts with a big-endian `u32`. Ordinarily it is the length of
//! the payload that follows; the reserved flag values are bare markers (plus a
//! fixed-size record for progress).

use std::io::{ErrorKind, Read, Write};

use crate::chunk::Progress;
use crate::error::ProtoError;
use crate::{CANCEL_FLAG, LAUNCH_FLAG, MESSAGE_MAX, PROGRESS_FLAG, PROGRESS_MESSAGE_SIZE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Message(Vec<u8>),
    Cancel,
    Launch,
    Progress(Progress),
}

/// Read one length word.
///
/// Returns `Ok(None)` only when the peer closed the stream exactly at a frame
/// boundary. A length word cut short is [`ProtoError::UnexpectedEof`].
pub fn read_word<R: Read>(reader: &mut R) -> Result<Option<u32>, ProtoError> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(ProtoError::UnexpectedEof),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Some(u32::from_be_bytes(buf)))
}

fn read_payload<R: Read>(reader: &mut R, len: usize) -> Result<Vec<u8>, ProtoError> {
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => ProtoError::UnexpectedEof,
        _ => ProtoError::Io(e),
    })?;
    Ok(buf)
}

/// Read the frame that follows an already consumed length word.
pub fn read_frame_body<R: Read>(reader: &mut R, word: u32) -> Result<Frame, ProtoError> {
    match word {
        CANCEL_FLAG => Ok(Frame::Cancel),
        LAUNCH_FLAG => Ok(Frame::Launch),
        PROGRESS_FLAG => {
            let record = read_payload(reader, PROGRESS_MESSAGE_SIZE)?;
            Ok(Frame::Progress(Progress::from_bytes(&record)?))
        }
        len if len as usize > MESSAGE_MAX => Err(ProtoError::TooLong {
            len: len as u64,
            max: MESSAGE_MAX,
        }),
        len => Ok(Frame::Message(read_payload(reader, len as usize)?)),
    }
}

pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Frame>, ProtoError> {
    match read_word(reader)? {
        Some(word) => read_frame_body(reader, word).map(Some),
        None => Ok(None),
    }
}

/// Write one message frame. The length word and payload go out in a single
/// buffer so a failed write never leaves half a header on the wire.
pub fn write_message<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), ProtoError> {
    if payload.len() > MESSAGE_MAX {
        return Err(ProtoError::TooLong {
            len: payload.len() as u64,
            max: MESSAGE_MAX,
        });
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

pub fn write_flag<W: Write>(writer: &mut W, flag: u32) -> Result<(), ProtoError> {
    writer.write_all(&flag.to_be_bytes())?;
    writer.flush()?;
    Ok(())
}

pub fn write_progress<W: Write>(writer: &mut W, progress: &Progress) -> Result<(), ProtoError> {
    let mut frame = [0u8; 4 + PROGRESS_MESSAGE_SIZE];
    frame[..4].copy_from_slice(&PROGRESS_FLAG.to_be_bytes());
    frame[4..].copy_from_slice(&progress.to_bytes());
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_message_frame() {
        let mut wire = Vec::new();
        write_message(&mut wire, b"payload").unwrap();
        assert_eq!(&wire[..4], &[0, 0, 0, 7]);

        let mut reader = Cursor::new(wire);
        assert_eq!(
            read_frame(&mut reader).unwrap(),
            Some(Frame::Message(b"payload".to_vec()))
        );
        assert_eq!(read_frame(&mut reader).unwrap(), None);
    }

    #[test]
    fn test_flags() {
        let mut wire = Vec::new();
        write_flag(&mut wire, CANCEL_FLAG).unwrap();
        write_flag(&mut wire, LAUNCH_FLAG).unwrap();
        let progress = Progress {
            proc_nr: 1,
            serial: 2,
            position: 3,
            total: 4,
        };
        write_progress(&mut wire, &progress).unwrap();

        let mut reader = Cursor::new(wire);
        assert_eq!(read_frame(&mut reader).unwrap(), Some(Frame::Cancel));
        assert_eq!(read_frame(&mut reader).unwrap(), Some(Frame::Launch));
        assert_eq!(
            read_frame(&mut reader).unwrap(),
            Some(Frame::Progress(progress))
        );
    }

    #[test]
    fn test_short_length_word_is_fatal() {
        let mut reader = Cursor::new(vec![0, 0]);
        assert!(matches!(
            read_frame(&mut reader),
            Err(ProtoError::UnexpectedEof)
        ));
    }

    #[test]
    fn test_short_payload_is_fatal() {
        let mut reader = Cursor::new(vec![0, 0, 0, 10, 1, 2, 3]);
        assert!(matches!(
            read_frame(&mut reader),
            Err(ProtoError::UnexpectedEof)
        ));
    }

    #[test]
    fn test_oversized_length_rejected_before_allocation() {
        let word = (MESSAGE_MAX as u32 + 1).to_be_bytes();
        let mut reader = Cursor::new(word.to_vec());
        assert!(matches!(
            read_frame(&mut reader),
            Err(ProtoError::TooLong { .. })
        ));
    }

    #[test]
    fn test_oversized_write_rejected() {
        let mut wire = Vec::new();
        let payload = vec![0u8; MESSAGE_MAX + 1];
        assert!(write_message(&mut wire, &payload).is_err());
        assert!(wire.is_empty());
    }
}
