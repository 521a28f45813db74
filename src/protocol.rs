//! Frame layout, request/reply type tags and protocol-wide constants.
//!
//! Both directions use the same frame: `u32 magic | u32 type | u32 len`
//! followed by `len` body bytes. Two magic values distinguish protocol
//! generations: [`VMGR_MAGIC2`] adds 64-bit capacity fields, side indices
//! and the extended identity fields to several message bodies. The server
//! accepts both and formats every reply in the generation of the request.

use crate::wire::{WireReader, WireWriter};
use std::io::{self, Read, Write};

/// Generation 1 protocol magic.
pub const VMGR_MAGIC: u32 = 0x7667_0001;
/// Generation 2 protocol magic (byte-accurate 64-bit capacities).
pub const VMGR_MAGIC2: u32 = 0x7667_0002;

/// Default daemon port.
pub const VMGR_PORT: u16 = 5013;

/// Server-side send buffer capacity for one list batch. The number of
/// entries per batch is `LISTBUFSZ / entry wire size`.
pub const LISTBUFSZ: usize = 4096;

/// Reply header length on the wire (magic, reply type, payload length).
pub const REPLY_HEADER_LEN: usize = 12;

/// Largest request body the server will read.
pub const MAX_BODY_LEN: usize = 1 << 16;

pub const ONE_KB: u64 = 1024;

/// Field length limits, including the NUL terminator slot.
pub mod limits {
    pub const VID: usize = 6 + 1;
    pub const VSN: usize = 6 + 1;
    pub const POOL_NAME: usize = 15 + 1;
    pub const LIBRARY: usize = 8 + 1;
    pub const DENSITY: usize = 8 + 1;
    pub const LBLTYPE: usize = 3 + 1;
    pub const MODEL: usize = 6 + 1;
    pub const MEDIA_LETTER: usize = 1 + 1;
    pub const MANUFACTURER: usize = 12 + 1;
    pub const SERIAL: usize = 24 + 1;
    pub const DGN: usize = 6 + 1;
    pub const TAG: usize = 255 + 1;
    pub const HOST: usize = 63 + 1;
    pub const CONDITION: usize = 512;
}

/// Numeric result codes carried in `VMGR_RC` replies, errno-style below
/// 1000 with service-specific codes above.
pub mod codes {
    pub const ENOENT: i32 = 2;
    pub const EACCES: i32 = 13;
    pub const EBUSY: i32 = 16;
    pub const EEXIST: i32 = 17;
    pub const EINVAL: i32 = 22;
    pub const ENOSPC: i32 = 28;
    /// Internal error not classifiable as any of the above.
    pub const SEINTERNAL: i32 = 1015;
    /// Idle list cursor reclaimed, or some other server-side timeout.
    pub const SETIMEDOUT: i32 = 1004;
    /// Communication error / dropped connection.
    pub const SECOMERR: i32 = 1018;
    /// Volume manager not active or being drained; clients retry.
    pub const EVMGRNACT: i32 = 2001;
}

/// Request types, one per logical operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ReqType {
    EnterTape = 1,
    ModifyTape = 2,
    DeleteTape = 3,
    QueryTape = 4,
    EnterModel = 5,
    ModifyModel = 6,
    DeleteModel = 7,
    QueryModel = 8,
    EnterPool = 9,
    ModifyPool = 10,
    DeletePool = 11,
    QueryPool = 12,
    EnterLibrary = 13,
    ModifyLibrary = 14,
    DeleteLibrary = 15,
    QueryLibrary = 16,
    EnterDenMap = 17,
    DeleteDenMap = 18,
    EnterDgnMap = 19,
    DeleteDgnMap = 20,
    ListTape = 21,
    ListModel = 22,
    ListPool = 23,
    ListLibrary = 24,
    ListDenMap = 25,
    ListDgnMap = 26,
    GetTape = 30,
    UpdateTape = 31,
    SetTag = 32,
    GetTag = 33,
    DelTag = 34,
    Reclaim = 35,
    TpMounted = 36,
    Shutdown = 40,
}

impl ReqType {
    pub fn from_u32(raw: u32) -> Option<Self> {
        use ReqType::*;
        Some(match raw {
            1 => EnterTape,
            2 => ModifyTape,
            3 => DeleteTape,
            4 => QueryTape,
            5 => EnterModel,
            6 => ModifyModel,
            7 => DeleteModel,
            8 => QueryModel,
            9 => EnterPool,
            10 => ModifyPool,
            11 => DeletePool,
            12 => QueryPool,
            13 => EnterLibrary,
            14 => ModifyLibrary,
            15 => DeleteLibrary,
            16 => QueryLibrary,
            17 => EnterDenMap,
            18 => DeleteDenMap,
            19 => EnterDgnMap,
            20 => DeleteDgnMap,
            21 => ListTape,
            22 => ListModel,
            23 => ListPool,
            24 => ListLibrary,
            25 => ListDenMap,
            26 => ListDgnMap,
            30 => GetTape,
            31 => UpdateTape,
            32 => SetTag,
            33 => GetTag,
            34 => DelTag,
            35 => Reclaim,
            36 => TpMounted,
            40 => Shutdown,
            _ => return None,
        })
    }

    pub fn is_list(self) -> bool {
        matches!(
            self,
            ReqType::ListTape
                | ReqType::ListModel
                | ReqType::ListPool
                | ReqType::ListLibrary
                | ReqType::ListDenMap
                | ReqType::ListDgnMap
        )
    }

    pub fn name(self) -> &'static str {
        use ReqType::*;
        match self {
            EnterTape => "entertape",
            ModifyTape => "modifytape",
            DeleteTape => "deletetape",
            QueryTape => "querytape",
            EnterModel => "entermodel",
            ModifyModel => "modifymodel",
            DeleteModel => "deletemodel",
            QueryModel => "querymodel",
            EnterPool => "enterpool",
            ModifyPool => "modifypool",
            DeletePool => "deletepool",
            QueryPool => "querypool",
            EnterLibrary => "enterlibrary",
            ModifyLibrary => "modifylibrary",
            DeleteLibrary => "deletelibrary",
            QueryLibrary => "querylibrary",
            EnterDenMap => "enterdenmap",
            DeleteDenMap => "deletedenmap",
            EnterDgnMap => "enterdgnmap",
            DeleteDgnMap => "deletedgnmap",
            ListTape => "listtape",
            ListModel => "listmodel",
            ListPool => "listpool",
            ListLibrary => "listlibrary",
            ListDenMap => "listdenmap",
            ListDgnMap => "listdgnmap",
            GetTape => "gettape",
            UpdateTape => "updatetape",
            SetTag => "settag",
            GetTag => "gettag",
            DelTag => "deltag",
            Reclaim => "reclaim",
            TpMounted => "tpmounted",
            Shutdown => "shutdown",
        }
    }
}

/// Reply message tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RepType {
    /// Formatted human-readable error text; more messages follow.
    MsgErr = 1,
    /// Opaque reply data; more messages follow.
    MsgData = 2,
    /// Terminal return code; the connection closes after this.
    Rc = 3,
    /// Intermediate return code; the connection stays open (list batches).
    Irc = 4,
}

impl RepType {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => RepType::MsgErr,
            2 => RepType::MsgData,
            3 => RepType::Rc,
            4 => RepType::Irc,
            _ => return None,
        })
    }
}

/// Round markers of the streaming list sub-protocol, carried as a `u16` in
/// every list request body.
pub const LIST_BEGIN: u16 = 0;
pub const LIST_CONTINUE: u16 = 1;
pub const LIST_END: u16 = 2;

/// A decoded request frame.
#[derive(Debug, Clone)]
pub struct RequestFrame {
    pub magic: u32,
    pub req_type: ReqType,
    pub body: Vec<u8>,
}

/// Writes one complete request frame.
pub fn write_request(
    stream: &mut impl Write,
    magic: u32,
    req_type: ReqType,
    body: &[u8],
) -> io::Result<()> {
    let mut header = WireWriter::with_capacity(REPLY_HEADER_LEN + body.len());
    header.put_u32(magic);
    header.put_u32(req_type as u32);
    header.put_u32(body.len() as u32);
    header.put_bytes(body);
    stream.write_all(header.as_slice())?;
    stream.flush()
}

/// Errors surfaced while reading a frame off the wire.
#[derive(Debug)]
pub enum FrameError {
    Io(io::Error),
    BadMagic(u32),
    BadType(u32),
    Oversized(usize),
}

impl From<io::Error> for FrameError {
    fn from(err: io::Error) -> Self {
        FrameError::Io(err)
    }
}

/// Reads one request frame, validating magic, type tag and body length.
pub fn read_request(stream: &mut impl Read) -> Result<RequestFrame, FrameError> {
    let mut header = [0u8; REPLY_HEADER_LEN];
    stream.read_exact(&mut header)?;
    let mut r = WireReader::new(&header);
    let magic = r.get_u32().expect("12-byte header");
    let raw_type = r.get_u32().expect("12-byte header");
    let len = r.get_u32().expect("12-byte header") as usize;
    if magic != VMGR_MAGIC && magic != VMGR_MAGIC2 {
        return Err(FrameError::BadMagic(magic));
    }
    let req_type = ReqType::from_u32(raw_type).ok_or(FrameError::BadType(raw_type))?;
    if len > MAX_BODY_LEN {
        return Err(FrameError::Oversized(len));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    Ok(RequestFrame {
        magic,
        req_type,
        body,
    })
}

/// Writes one reply message (`MSG_ERR`, `MSG_DATA`, `VMGR_RC` or
/// `VMGR_IRC`). Return codes carry the numeric code as a 4-byte payload.
pub fn write_reply(
    stream: &mut impl Write,
    magic: u32,
    rep_type: RepType,
    payload: &[u8],
) -> io::Result<()> {
    let mut out = WireWriter::with_capacity(REPLY_HEADER_LEN + payload.len());
    out.put_u32(magic);
    out.put_u32(rep_type as u32);
    out.put_u32(payload.len() as u32);
    out.put_bytes(payload);
    stream.write_all(out.as_slice())?;
    stream.flush()
}

pub fn write_rc(stream: &mut impl Write, magic: u32, code: i32) -> io::Result<()> {
    let mut body = WireWriter::with_capacity(4);
    body.put_i32(code);
    write_reply(stream, magic, RepType::Rc, body.as_slice())
}

pub fn write_irc(stream: &mut impl Write, magic: u32, code: i32) -> io::Result<()> {
    let mut body = WireWriter::with_capacity(4);
    body.put_i32(code);
    write_reply(stream, magic, RepType::Irc, body.as_slice())
}

pub fn write_err_text(stream: &mut impl Write, magic: u32, text: &str) -> io::Result<()> {
    let mut body = WireWriter::with_capacity(text.len() + 1);
    body.put_string(text);
    write_reply(stream, magic, RepType::MsgErr, body.as_slice())
}

/// One decoded reply message.
#[derive(Debug, Clone)]
pub struct ReplyFrame {
    pub magic: u32,
    pub rep_type: RepType,
    pub payload: Vec<u8>,
}

/// Reads one reply message from the stream.
pub fn read_reply(stream: &mut impl Read) -> Result<ReplyFrame, FrameError> {
    let mut header = [0u8; REPLY_HEADER_LEN];
    stream.read_exact(&mut header)?;
    let mut r = WireReader::new(&header);
    let magic = r.get_u32().expect("12-byte header");
    let raw_type = r.get_u32().expect("12-byte header");
    let len = r.get_u32().expect("12-byte header") as usize;
    if magic != VMGR_MAGIC && magic != VMGR_MAGIC2 {
        return Err(FrameError::BadMagic(magic));
    }
    let rep_type = RepType::from_u32(raw_type).ok_or(FrameError::BadType(raw_type))?;
    if len > MAX_BODY_LEN {
        return Err(FrameError::Oversized(len));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok(ReplyFrame {
        magic,
        rep_type,
        payload,
    })
}
