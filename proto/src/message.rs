//! Request and reply envelopes.

use crate::error::ProtoError;
use crate::xdr::{XdrDecode, XdrDecoder, XdrEncode, XdrEncoder};
use crate::{ERROR_LEN, PROGRAM, PROTOCOL_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Call = 0,
    Reply = 1,
}

impl TryFrom<i32> for Direction {
    type Error = ProtoError;

    fn try_from(v: i32) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Direction::Call),
            1 => Ok(Direction::Reply),
            value => Err(ProtoError::InvalidEnum {
                field: "direction",
                value,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 0,
    Error = 1,
}

impl TryFrom<i32> for Status {
    type Error = ProtoError;

    fn try_from(v: i32) -> Result<Self, ProtoError> {
        match v {
            0 => Ok(Status::Ok),
            1 => Ok(Status::Error),
            value => Err(ProtoError::InvalidEnum {
                field: "status",
                value,
            }),
        }
    }
}

/// Header shared by calls and replies.
///
/// `direction` and `status` stay raw so that a readable header with bad
/// values can still be answered with an error reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub prog: u32,
    pub vers: u32,
    pub proc_nr: i32,
    pub direction: i32,
    pub serial: u32,
    pub status: i32,
    pub progress_hint: u64,
    pub optargs_bitmask: u64,
}

impl MessageHeader {
    pub fn call(proc_nr: i32, serial: u32, optargs_bitmask: u64) -> Self {
        Self {
            prog: PROGRAM,
            vers: PROTOCOL_VERSION,
            proc_nr,
            direction: Direction::Call as i32,
            serial,
            status: Status::Ok as i32,
            progress_hint: 0,
            optargs_bitmask,
        }
    }

    pub fn reply(proc_nr: i32, serial: u32, status: Status) -> Self {
        Self {
            prog: PROGRAM,
            vers: PROTOCOL_VERSION,
            proc_nr,
            direction: Direction::Reply as i32,
            serial,
            status: status as i32,
            progress_hint: 0,
            optargs_bitmask: 0,
        }
    }

    /// Checks a call header, returning the reason it must be refused.
    pub fn validate_call(&self) -> Result<(), String> {
        if self.prog != PROGRAM {
            return Err(format!("wrong program ({})", self.prog));
        }
        if self.vers != PROTOCOL_VERSION {
            return Err(format!("wrong protocol version ({})", self.vers));
        }
        if self.direction != Direction::Call as i32 {
            return Err(format!("unexpected message direction ({})", self.direction));
        }
        if self.status != Status::Ok as i32 {
            return Err(format!("unexpected message status ({})", self.status));
        }
        Ok(())
    }
}

impl XdrEncode for MessageHeader {
    fn encode(&self, enc: &mut XdrEncoder) {
        enc.put_u32(self.prog);
        enc.put_u32(self.vers);
        enc.put_i32(self.proc_nr);
        enc.put_i32(self.direction);
        enc.put_u32(self.serial);
        enc.put_i32(self.status);
        enc.put_u64(self.progress_hint);
        enc.put_u64(self.optargs_bitmask);
    }
}

impl XdrDecode for MessageHeader {
    fn decode(dec: &mut XdrDecoder<'_>) -> Result<Self, ProtoError> {
        Ok(Self {
            prog: dec.get_u32()?,
            vers: dec.get_u32()?,
            proc_nr: dec.get_i32()?,
            direction: dec.get_i32()?,
            serial: dec.get_u32()?,
            status: dec.get_i32()?,
            progress_hint: dec.get_u64()?,
            optargs_bitmask: dec.get_u64()?,
        })
    }
}

/// Body of an `ERROR` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub errno: i32,
    pub message: String,
}

impl ErrorBody {
    pub fn new(errno: i32, message: impl Into<String>) -> Self {
        let mut message = message.into();
        truncate_on_char_boundary(&mut message, ERROR_LEN);
        Self { errno, message }
    }
}

fn truncate_on_char_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

impl XdrEncode for ErrorBody {
    fn encode(&self, enc: &mut XdrEncoder) {
        enc.put_i32(self.errno);
        enc.put_string(&self.message);
    }
}

impl XdrDecode for ErrorBody {
    fn decode(dec: &mut XdrDecoder<'_>) -> Result<Self, ProtoError> {
        Ok(Self {
            errno: dec.get_i32()?,
            message: dec.get_string()?,
        })
    }
}

/// Encode a complete call message (header followed by arguments).
pub fn encode_call<A: XdrEncode>(header: &MessageHeader, args: &A) -> Vec<u8> {
    let mut enc = XdrEncoder::new();
    header.encode(&mut enc);
    args.encode(&mut enc);
    enc.into_inner()
}

/// Encode an OK reply carrying `ret`.
pub fn encode_reply<R: XdrEncode>(proc_nr: i32, serial: u32, ret: &R) -> Vec<u8> {
    let mut enc = XdrEncoder::new();
    MessageHeader::reply(proc_nr, serial, Status::Ok).encode(&mut enc);
    ret.encode(&mut enc);
    enc.into_inner()
}

pub fn encode_error(proc_nr: i32, serial: u32, body: &ErrorBody) -> Vec<u8> {
    let mut enc = XdrEncoder::new();
    MessageHeader::reply(proc_nr, serial, Status::Error).encode(&mut enc);
    body.encode(&mut enc);
    enc.into_inner()
}

/// A decoded reply as seen by the controller side.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply<R> {
    Ok(R),
    Error(ErrorBody),
}

pub fn decode_reply<R: XdrDecode>(buf: &[u8]) -> Result<(MessageHeader, Reply<R>), ProtoError> {
    let mut dec = XdrDecoder::new(buf);
    let header = MessageHeader::decode(&mut dec)?;
    let body = match Status::try_from(header.status)? {
        Status::Ok => Reply::Ok(R::decode(&mut dec)?),
        Status::Error => Reply::Error(ErrorBody::decode(&mut dec)?),
    };
    Ok((header, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let mut header = MessageHeader::call(14, 7, 0b101);
        header.progress_hint = 1 << 33;
        let bytes = header.to_xdr();
        assert_eq!(bytes.len(), 40);
        assert_eq!(MessageHeader::from_xdr(&bytes).unwrap(), header);
    }

    #[test]
    fn test_validate_call() {
        let mut header = MessageHeader::call(1, 1, 0);
        assert!(header.validate_call().is_ok());

        header.vers = 3;
        assert_eq!(
            header.validate_call().unwrap_err(),
            "wrong protocol version (3)"
        );

        let reply = MessageHeader::reply(1, 1, Status::Ok);
        assert!(reply.validate_call().unwrap_err().contains("direction"));
    }

    #[test]
    fn test_error_reply_decodes() {
        let bytes = encode_error(16, 3, &ErrorBody::new(2, "/bin/ls: No such file or directory"));
        let (header, reply) = decode_reply::<String>(&bytes).unwrap();
        assert_eq!(header.serial, 3);
        assert_eq!(header.proc_nr, 16);
        match reply {
            Reply::Error(body) => {
                assert_eq!(body.errno, 2);
                assert!(body.message.contains("No such file"));
            }
            Reply::Ok(_) => panic!("expected error reply"),
        }
    }

    #[test]
    fn test_error_message_truncated() {
        let body = ErrorBody::new(0, "é".repeat(ERROR_LEN));
        assert!(body.message.len() <= ERROR_LEN);
        assert!(body.message.chars().all(|c| c == 'é'));
    }
}
