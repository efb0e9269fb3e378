//! Minimal WebSocket framing for a client that only ever sends text.
//!
//! Encoder: FIN + opcode, masked payload (clients must mask), 7/16/64-bit
//! lengths. Decoder: unfragmented server frames only, enough to drain text,
//! answer pings and notice a close.

const FIN: u8 = 0x80;
const MASK_BIT: u8 = 0x80;

pub const OP_TEXT: u8 = 0x1;
pub const OP_BINARY: u8 = 0x2;
pub const OP_CLOSE: u8 = 0x8;
pub const OP_PING: u8 = 0x9;
pub const OP_PONG: u8 = 0xA;

/// Frames bigger than this are a protocol violation for this client.
const MAX_PAYLOAD: u64 = 1 << 20;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unsupported opcode {0:#x}")]
    Unsupported(u8),
    #[error("frame too large ({0} bytes)")]
    TooLarge(u64),
    #[error("fragmented frames are not supported")]
    Fragmented,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// Fresh masking key for one frame.
pub fn mask_key() -> [u8; 4] {
    let id = uuid::Uuid::new_v4();
    let b = id.as_bytes();
    [b[0], b[1], b[2], b[3]]
}

pub fn encode(opcode: u8, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
    let len = payload.len();
    let mut out = Vec::with_capacity(len + 14);
    out.push(FIN | opcode);
    if len <= 125 {
        out.push(MASK_BIT | len as u8);
    } else if len <= usize::from(u16::MAX) {
        out.push(MASK_BIT | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(MASK_BIT | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
    out.extend_from_slice(&mask);
    out.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    out
}

pub fn encode_text(text: &str) -> Vec<u8> {
    encode(OP_TEXT, text.as_bytes(), mask_key())
}

/// Tries to take one frame off the front of `buf`.
/// `Ok(None)` means more bytes are needed; on success returns the frame and bytes consumed.
pub fn decode(buf: &[u8]) -> Result<Option<(Frame, usize)>, FrameError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let fin = buf[0] & FIN != 0;
    let opcode = buf[0] & 0x0F;
    let masked = buf[1] & MASK_BIT != 0;
    let mut pos = 2;

    let len = match buf[1] & 0x7F {
        126 => {
            let Some(bytes) = buf.get(2..4) else { return Ok(None) };
            pos = 4;
            u64::from(u16::from_be_bytes([bytes[0], bytes[1]]))
        }
        127 => {
            let Some(bytes) = buf.get(2..10) else { return Ok(None) };
            pos = 10;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(bytes);
            u64::from_be_bytes(raw)
        }
        n => u64::from(n),
    };
    if len > MAX_PAYLOAD {
        return Err(FrameError::TooLarge(len));
    }

    let mask = if masked {
        let Some(bytes) = buf.get(pos..pos + 4) else { return Ok(None) };
        pos += 4;
        Some([bytes[0], bytes[1], bytes[2], bytes[3]])
    } else {
        None
    };

    let end = pos + len as usize;
    let Some(raw) = buf.get(pos..end) else { return Ok(None) };
    let payload: Vec<u8> = match mask {
        Some(m) => raw.iter().enumerate().map(|(i, b)| b ^ m[i % 4]).collect(),
        None => raw.to_vec(),
    };

    if !fin || opcode == 0x0 {
        return Err(FrameError::Fragmented);
    }
    let frame = match opcode {
        OP_TEXT => Frame::Text(String::from_utf8_lossy(&payload).into_owned()),
        OP_BINARY => Frame::Binary(payload),
        OP_CLOSE => Frame::Close,
        OP_PING => Frame::Ping(payload),
        OP_PONG => Frame::Pong(payload),
        other => return Err(FrameError::Unsupported(other)),
    };
    Ok(Some((frame, end)))
}
