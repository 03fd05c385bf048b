//! Wire protocol: fixed-layout, packed, big-endian request/reply frames.
//!
//! Layouts and constants follow `common/dnbd-cliserv.h` of the original
//! kernel module byte for byte.

/// Magic value stamped on every frame. Frames that don't carry it are
/// dropped silently at the packet layer.
pub const MAGIC: u32 = 0x1905_1979;

/// Default multicast port both client and server bind to.
pub const DEFAULT_PORT: u16 = 5001;

const CMD_MASK: u16 = 0x07;
const CMD_INIT: u16 = 0x01;
const CMD_READ: u16 = 0x02;
const CMD_HB: u16 = 0x03;
const CMD_CLI: u16 = 0x08;
const CMD_SRV: u16 = 0x10;

/// The three request/reply kinds carried in the low 3 bits of `cmd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Init,
    Read,
    Hb,
}

impl Op {
    fn from_bits(cmd: u16) -> Option<Op> {
        match cmd & CMD_MASK {
            CMD_INIT => Some(Op::Init),
            CMD_READ => Some(Op::Read),
            CMD_HB => Some(Op::Hb),
            _ => None,
        }
    }

    fn bits(self) -> u16 {
        match self {
            Op::Init => CMD_INIT,
            Op::Read => CMD_READ,
            Op::Hb => CMD_HB,
        }
    }
}

/// The orthogonal direction bit distinguishing client- from
/// server-originated frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Client,
    Server,
}

impl Direction {
    fn bits(self) -> u16 {
        match self {
            Direction::Client => CMD_CLI,
            Direction::Server => CMD_SRV,
        }
    }
}

fn cmd_field(op: Op, dir: Direction) -> u16 {
    op.bits() | dir.bits()
}

fn split_cmd(cmd: u16) -> Option<(Op, Direction)> {
    let op = Op::from_bits(cmd)?;
    let dir = if cmd & CMD_SRV != 0 {
        Direction::Server
    } else if cmd & CMD_CLI != 0 {
        Direction::Client
    } else {
        return None;
    };
    Some((op, dir))
}

pub const REQUEST_SIZE: usize = 20;
pub const REPLY_HEADER_SIZE: usize = 18;
pub const REPLY_INIT_SIZE: usize = 20;

/// A request frame, as sent by the client (INIT/HB broadcasts, READ reads).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub id: u16,
    pub op: Op,
    pub pos: u64,
    pub time: u16,
    pub len: u16,
}

impl Request {
    pub fn encode(&self) -> [u8; REQUEST_SIZE] {
        let mut buf = [0u8; REQUEST_SIZE];
        buf[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        buf[4..6].copy_from_slice(&self.id.to_be_bytes());
        buf[6..8].copy_from_slice(&cmd_field(self.op, Direction::Client).to_be_bytes());
        buf[8..16].copy_from_slice(&self.pos.to_be_bytes());
        buf[16..18].copy_from_slice(&self.time.to_be_bytes());
        buf[18..20].copy_from_slice(&self.len.to_be_bytes());
        buf
    }

    /// Decodes a request frame. Returns `None` on bad magic, short frame,
    /// an unrecognised op, or a missing CLI direction bit — all of which
    /// are silently-dropped conditions per spec.
    pub fn decode(buf: &[u8]) -> Option<Request> {
        if buf.len() < REQUEST_SIZE {
            return None;
        }
        let magic = u32::from_be_bytes(buf[0..4].try_into().ok()?);
        if magic != MAGIC {
            return None;
        }
        let id = u16::from_be_bytes(buf[4..6].try_into().ok()?);
        let cmd = u16::from_be_bytes(buf[6..8].try_into().ok()?);
        let (op, dir) = split_cmd(cmd)?;
        if dir != Direction::Client {
            return None;
        }
        let pos = u64::from_be_bytes(buf[8..16].try_into().ok()?);
        let time = u16::from_be_bytes(buf[16..18].try_into().ok()?);
        let len = u16::from_be_bytes(buf[18..20].try_into().ok()?);
        Some(Request { id, op, pos, time, len })
    }
}

/// Reply header shared by READ, INIT and HB replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    pub id: u16,
    pub op: Op,
    pub pos: u64,
    pub time: u16,
}

impl ReplyHeader {
    pub fn encode(&self) -> [u8; REPLY_HEADER_SIZE] {
        let mut buf = [0u8; REPLY_HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        buf[4..6].copy_from_slice(&self.id.to_be_bytes());
        buf[6..8].copy_from_slice(&cmd_field(self.op, Direction::Server).to_be_bytes());
        buf[8..16].copy_from_slice(&self.pos.to_be_bytes());
        buf[16..18].copy_from_slice(&self.time.to_be_bytes());
        buf
    }

    /// Encodes the header followed by a READ payload in one allocation.
    pub fn encode_with_payload(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(REPLY_HEADER_SIZE + payload.len());
        out.extend_from_slice(&self.encode());
        out.extend_from_slice(payload);
        out
    }

    /// Decodes a reply header. The remainder of `buf` past
    /// `REPLY_HEADER_SIZE` (if any) is the READ payload. Returns `None` on
    /// bad magic, short frame, unrecognised op, or a missing SRV direction
    /// bit.
    pub fn decode(buf: &[u8]) -> Option<ReplyHeader> {
        if buf.len() < REPLY_HEADER_SIZE {
            return None;
        }
        let magic = u32::from_be_bytes(buf[0..4].try_into().ok()?);
        if magic != MAGIC {
            return None;
        }
        let id = u16::from_be_bytes(buf[4..6].try_into().ok()?);
        let cmd = u16::from_be_bytes(buf[6..8].try_into().ok()?);
        let (op, dir) = split_cmd(cmd)?;
        if dir != Direction::Server {
            return None;
        }
        let pos = u64::from_be_bytes(buf[8..16].try_into().ok()?);
        let time = u16::from_be_bytes(buf[16..18].try_into().ok()?);
        Some(ReplyHeader { id, op, pos, time })
    }
}

/// INIT/HB reply carrying device geometry instead of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyInit {
    pub id: u16,
    pub capacity: u64,
    pub time: u16,
    pub blksize: u16,
}

impl ReplyInit {
    pub fn encode(&self) -> [u8; REPLY_INIT_SIZE] {
        let mut buf = [0u8; REPLY_INIT_SIZE];
        buf[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        buf[4..6].copy_from_slice(&self.id.to_be_bytes());
        buf[6..8].copy_from_slice(&cmd_field(Op::Init, Direction::Server).to_be_bytes());
        buf[8..16].copy_from_slice(&self.capacity.to_be_bytes());
        buf[16..18].copy_from_slice(&self.time.to_be_bytes());
        buf[18..20].copy_from_slice(&self.blksize.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<ReplyInit> {
        if buf.len() < REPLY_INIT_SIZE {
            return None;
        }
        let magic = u32::from_be_bytes(buf[0..4].try_into().ok()?);
        if magic != MAGIC {
            return None;
        }
        let id = u16::from_be_bytes(buf[4..6].try_into().ok()?);
        let cmd = u16::from_be_bytes(buf[6..8].try_into().ok()?);
        let (op, dir) = split_cmd(cmd)?;
        if op != Op::Init && op != Op::Hb {
            return None;
        }
        if dir != Direction::Server {
            return None;
        }
        let capacity = u64::from_be_bytes(buf[8..16].try_into().ok()?);
        let time = u16::from_be_bytes(buf[16..18].try_into().ok()?);
        let blksize = u16::from_be_bytes(buf[18..20].try_into().ok()?);
        Some(ReplyInit { id, capacity, time, blksize })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let req = Request { id: 3, op: Op::Read, pos: 0xdead_beef, time: 1234, len: 4096 };
        let encoded = req.encode();
        assert_eq!(encoded.len(), REQUEST_SIZE);
        let decoded = Request::decode(&encoded).expect("decode");
        assert_eq!(decoded, req);
    }

    #[test]
    fn request_rejects_bad_magic() {
        let mut buf = Request { id: 0, op: Op::Init, pos: 0, time: 0, len: 0 }.encode();
        buf[0] ^= 0xff;
        assert!(Request::decode(&buf).is_none());
    }

    #[test]
    fn request_rejects_short_frame() {
        let buf = [0u8; REQUEST_SIZE - 1];
        assert!(Request::decode(&buf).is_none());
    }

    #[test]
    fn request_rejects_server_direction() {
        let header = ReplyHeader { id: 1, op: Op::Read, pos: 0, time: 0 };
        let encoded = header.encode();
        assert!(Request::decode(&encoded).is_none());
    }

    #[test]
    fn reply_header_round_trip_with_payload() {
        let header = ReplyHeader { id: 1, op: Op::Read, pos: 4096, time: 42 };
        let payload = vec![0xab; 128];
        let frame = header.encode_with_payload(&payload);
        let decoded = ReplyHeader::decode(&frame).expect("decode");
        assert_eq!(decoded, header);
        assert_eq!(&frame[REPLY_HEADER_SIZE..], &payload[..]);
    }

    #[test]
    fn reply_init_round_trip() {
        let init = ReplyInit { id: 1, capacity: 1 << 20, time: 7, blksize: 4096 };
        let encoded = init.encode();
        let decoded = ReplyInit::decode(&encoded).expect("decode");
        assert_eq!(decoded, init);
    }

    #[test]
    fn reply_init_accepts_hb_op() {
        let mut buf = ReplyInit { id: 2, capacity: 0, time: 0, blksize: 4096 }.encode();
        // flip low bits of cmd (byte 7) from INIT to HB
        buf[7] = (buf[7] & !CMD_MASK) | CMD_HB;
        assert!(ReplyInit::decode(&buf).is_some());
    }
}
