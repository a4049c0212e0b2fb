//! Serialize/deserialize 9P messages into/from binary.

use crate::{fcall::*, io_err, res};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;
use std::io::{Read, Result};
use std::mem;
use std::ops::Shl;

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };

    ($typ:ident, $buf:expr) => {
        $typ::from_bits_retain(decode!($buf))
    };
}

fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; size];
    r.read_exact(&mut buf[..]).and(Ok(buf))
}

/// Result of an `Encoder` chain, so that `<<` can keep chaining after an error
pub struct SResult<T>(::std::io::Result<T>);

/// Counts the bytes of a chain of `<<` writes
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    /// Encode data, equivalent to: encoder << data
    pub fn encode<T: Encodable>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        SResult(self.encode(rhs).map(|_| self))
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        SResult(self.0.and_then(|mut encoder| encoder.encode(rhs).map(|_| encoder)))
    }
}

impl<W> SResult<Encoder<W>> {
    /// Total bytes written by the chain, or the first error
    fn written(self) -> Result<usize> {
        self.0.map(|enc| enc.bytes)
    }
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u8(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u16::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u64::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        if self.len() > u16::MAX as usize {
            return res!(io_err!(InvalidInput, "string too long for 9P"));
        }
        let mut bytes = (self.len() as u16).encode(w)?;
        bytes += w.write_all(self.as_bytes()).and(Ok(self.len()))?;
        Ok(bytes)
    }
}

impl Encodable for QId {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        (Encoder::new(w) << &self.typ.bits() << &self.version << &self.path).written()
    }
}

/// stat[n] as it appears in `RStat`/`TWStat` and in directory reads:
/// size[2] followed by the fields
impl Encodable for Dir {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        (Encoder::new(w)
            << &stat_size(self)?
            << &self.typ
            << &self.dev
            << &self.qid
            << &self.mode
            << &self.atime
            << &self.mtime
            << &self.length
            << &self.name
            << &self.uid
            << &self.gid
            << &self.muid)
            .written()
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = self.0.len();
        let bytes = (size as u32).encode(w)? + size;
        w.write_all(&self.0)?;
        Ok(bytes)
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        self.iter()
            .fold(Encoder::new(w) << &(self.len() as u16), |acc, s| acc << s)
            .written()
    }
}

impl Encodable for Msg {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        use crate::FCall::*;

        let typ = MsgType::from(&self.body);
        let buf = Encoder::new(w) << &(typ as u8) << &self.tag;

        let buf = match self.body {
            RlError { ref ecode } => buf << ecode,
            TVersion {
                ref msize,
                ref version,
            } => buf << msize << version,
            RVersion {
                ref msize,
                ref version,
            } => buf << msize << version,
            TAuth {
                ref afid,
                ref uname,
                ref aname,
            } => buf << afid << uname << aname,
            RAuth { ref aqid } => buf << aqid,
            TAttach {
                ref fid,
                ref afid,
                ref uname,
                ref aname,
            } => buf << fid << afid << uname << aname,
            RAttach { ref qid } => buf << qid,
            RError { ref ename } => buf << ename,
            TFlush { ref oldtag } => buf << oldtag,
            RFlush => buf,
            TWalk {
                ref fid,
                ref newfid,
                ref wnames,
            } => buf << fid << newfid << wnames,
            RWalk { ref wqids } => buf << wqids,
            TOpen { ref fid, ref mode } => buf << fid << mode,
            ROpen {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            TCreate {
                ref fid,
                ref name,
                ref perm,
                ref mode,
            } => buf << fid << name << perm << mode,
            RCreate {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            TRead {
                ref fid,
                ref offset,
                ref count,
            } => buf << fid << offset << count,
            RRead { ref data } => buf << data,
            TWrite {
                ref fid,
                ref offset,
                ref data,
            } => buf << fid << offset << data,
            RWrite { ref count } => buf << count,
            TClunk { ref fid } => buf << fid,
            RClunk => buf,
            TRemove { ref fid } => buf << fid,
            RRemove => buf,
            TStat { ref fid } => buf << fid,
            // stat is wrapped in an extra n[2] count in these two messages
            RStat { ref stat } => buf << &nested_stat_size(stat)? << stat,
            TWStat { ref fid, ref stat } => buf << fid << &nested_stat_size(stat)? << stat,
            RWStat => buf,
        };

        buf.written()
    }
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u8()
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u16::<LittleEndian>()
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl Decodable for u64 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u64::<LittleEndian>()
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        String::from_utf8(read_exact(r, len as usize)?)
            .map_err(|_| io_err!(InvalidData, "Invalid UTF-8 sequence"))
    }
}

impl Decodable for QId {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(QId {
            typ: decode!(QIdType, *r),
            version: Decodable::decode(r)?,
            path: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Dir {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let size: u16 = Decodable::decode(r)?;
        let dir = Dir {
            typ: Decodable::decode(r)?,
            dev: Decodable::decode(r)?,
            qid: Decodable::decode(r)?,
            mode: Decodable::decode(r)?,
            atime: Decodable::decode(r)?,
            mtime: Decodable::decode(r)?,
            length: Decodable::decode(r)?,
            name: Decodable::decode(r)?,
            uid: Decodable::decode(r)?,
            gid: Decodable::decode(r)?,
            muid: Decodable::decode(r)?,
        };
        if dir.size() != Some(size) {
            return res!(io_err!(InvalidData, "stat size does not match its contents"));
        }
        Ok(dir)
    }
}

impl Decodable for Data {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u32 = Decodable::decode(r)?;
        Ok(Data(read_exact(r, len as usize)?))
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        let mut buf = Vec::with_capacity(len as usize);
        for _ in 0..len {
            buf.push(Decodable::decode(r)?);
        }
        Ok(buf)
    }
}

impl Decodable for Msg {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        use crate::MsgType::*;

        let mut buf = r;

        let msg_type = MsgType::from_u8(decode!(buf));
        let tag = decode!(buf);
        let body = match msg_type {
            Some(RlError) => FCall::RlError {
                ecode: decode!(buf),
            },
            Some(TVersion) => FCall::TVersion {
                msize: decode!(buf),
                version: decode!(buf),
            },
            Some(RVersion) => FCall::RVersion {
                msize: decode!(buf),
                version: decode!(buf),
            },
            Some(TAuth) => FCall::TAuth {
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
            },
            Some(RAuth) => FCall::RAuth { aqid: decode!(buf) },
            Some(TAttach) => FCall::TAttach {
                fid: decode!(buf),
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
            },
            Some(RAttach) => FCall::RAttach { qid: decode!(buf) },
            Some(RError) => FCall::RError {
                ename: decode!(buf),
            },
            Some(TFlush) => FCall::TFlush {
                oldtag: decode!(buf),
            },
            Some(RFlush) => FCall::RFlush,
            Some(TWalk) => FCall::TWalk {
                fid: decode!(buf),
                newfid: decode!(buf),
                wnames: decode!(buf),
            },
            Some(RWalk) => FCall::RWalk {
                wqids: decode!(buf),
            },
            Some(TOpen) => FCall::TOpen {
                fid: decode!(buf),
                mode: decode!(buf),
            },
            Some(ROpen) => FCall::ROpen {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            Some(TCreate) => FCall::TCreate {
                fid: decode!(buf),
                name: decode!(buf),
                perm: decode!(buf),
                mode: decode!(buf),
            },
            Some(RCreate) => FCall::RCreate {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            Some(TRead) => FCall::TRead {
                fid: decode!(buf),
                offset: decode!(buf),
                count: decode!(buf),
            },
            Some(RRead) => FCall::RRead { data: decode!(buf) },
            Some(TWrite) => FCall::TWrite {
                fid: decode!(buf),
                offset: decode!(buf),
                data: decode!(buf),
            },
            Some(RWrite) => FCall::RWrite {
                count: decode!(buf),
            },
            Some(TClunk) => FCall::TClunk { fid: decode!(buf) },
            Some(RClunk) => FCall::RClunk,
            Some(TRemove) => FCall::TRemove { fid: decode!(buf) },
            Some(RRemove) => FCall::RRemove,
            Some(TStat) => FCall::TStat { fid: decode!(buf) },
            Some(RStat) => FCall::RStat {
                stat: decode_nested_stat(buf)?,
            },
            Some(TWStat) => FCall::TWStat {
                fid: decode!(buf),
                stat: decode_nested_stat(buf)?,
            },
            Some(RWStat) => FCall::RWStat,
            Some(TlError) | Some(TError) | None => {
                return res!(io_err!(InvalidData, "Invalid message type"));
            }
        };

        Ok(Msg { tag, body })
    }
}

fn stat_size(dir: &Dir) -> Result<u16> {
    dir.size()
        .ok_or_else(|| io_err!(InvalidInput, "stat record too long for 9P"))
}

/// n[2] of `RStat`/`TWStat`, which also counts the record's own size[2]
fn nested_stat_size(dir: &Dir) -> Result<u16> {
    stat_size(dir)?
        .checked_add(2)
        .ok_or_else(|| io_err!(InvalidInput, "stat record too long for 9P"))
}

/// stat[n] of `RStat`/`TWStat`: n[2] counts the stat record including its own size[2]
fn decode_nested_stat<R: ReadBytesExt>(r: &mut R) -> Result<Dir> {
    let n: u16 = Decodable::decode(r)?;
    let stat: Dir = Decodable::decode(r)?;
    if nested_stat_size(&stat).ok() != Some(n) {
        return res!(io_err!(InvalidData, "stat count does not match its record"));
    }
    Ok(stat)
}

/// Helper function to read a 9P message from a byte-oriented stream
pub fn read_msg<R: ReadBytesExt>(r: &mut R) -> Result<Msg> {
    Decodable::decode(r)
}

/// Helper function to write a 9P message into a byte-oriented stream
pub fn write_msg<W: WriteBytesExt>(w: &mut W, msg: &Msg) -> Result<usize> {
    msg.encode(w)
}

/// Decode the stat records returned by reading a directory
pub fn read_dirs(mut data: &[u8]) -> Result<Vec<Dir>> {
    let mut dirs = Vec::new();
    while !data.is_empty() {
        dirs.push(Decodable::decode(&mut data)?);
    }
    Ok(dirs)
}

#[test]
fn tversion_layout() {
    let msg = Msg {
        tag: NOTAG,
        body: FCall::TVersion {
            msize: 8192,
            version: P92000.to_owned(),
        },
    };
    let mut buf = Vec::new();
    write_msg(&mut buf, &msg).unwrap();

    let mut expected = vec![MsgType::TVersion as u8, 0xff, 0xff, 0x00, 0x20, 0, 0, 6, 0];
    expected.extend_from_slice(b"9P2000");
    assert_eq!(buf, expected);
    assert_eq!(read_msg(&mut &buf[..]).unwrap(), msg);
}

#[test]
fn twalk_layout() {
    let msg = Msg {
        tag: 1,
        body: FCall::TWalk {
            fid: 0,
            newfid: 1,
            wnames: vec!["usr".to_owned(), "glenda".to_owned()],
        },
    };
    let mut buf = Vec::new();
    let n = write_msg(&mut buf, &msg).unwrap();

    // type[1] tag[2] fid[4] newfid[4] nwname[2] 2+3 2+6
    assert_eq!(n, 1 + 2 + 4 + 4 + 2 + 5 + 8);
    assert_eq!(n, buf.len());
    assert_eq!(buf[0], MsgType::TWalk as u8);
    assert_eq!(&buf[11..13], &[2, 0]);
}

#[test]
fn rstat_carries_nested_size() {
    let stat = Dir {
        qid: QId {
            typ: QIdType::DIR,
            version: 3,
            path: 42,
        },
        mode: dm::DIR | 0o755,
        name: "tmp".to_owned(),
        uid: "glenda".to_owned(),
        gid: "sys".to_owned(),
        muid: "glenda".to_owned(),
        ..Default::default()
    };
    let msg = Msg {
        tag: 7,
        body: FCall::RStat { stat: stat.clone() },
    };
    let mut buf = Vec::new();
    write_msg(&mut buf, &msg).unwrap();

    let n = u16::from_le_bytes([buf[3], buf[4]]);
    let size = u16::from_le_bytes([buf[5], buf[6]]);
    let expected = stat.size().unwrap();
    assert_eq!(n, expected + 2);
    assert_eq!(size, expected);
    assert_eq!(buf.len(), 3 + 2 + 2 + expected as usize);
    assert_eq!(read_msg(&mut &buf[..]).unwrap(), msg);
}

#[test]
fn directory_data_splits_into_dirs() {
    let a = Dir {
        name: "a".to_owned(),
        ..Default::default()
    };
    let b = Dir {
        name: "bee".to_owned(),
        mode: dm::DIR,
        ..Default::default()
    };
    let mut data = Vec::new();
    a.encode(&mut data).unwrap();
    b.encode(&mut data).unwrap();

    assert_eq!(read_dirs(&data).unwrap(), vec![a, b]);
    assert!(read_dirs(&data[..data.len() - 1]).is_err());
}

#[test]
fn unknown_message_type_is_an_error() {
    let buf = [0xffu8, 0x01, 0x00];
    let err = read_msg(&mut &buf[..]).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);

    let terror = [MsgType::TError as u8, 0x01, 0x00];
    assert!(read_msg(&mut &terror[..]).is_err());
}

#[test]
fn oversized_stat_is_refused() {
    let stat = Dir {
        name: "n".repeat(40_000),
        muid: "m".repeat(40_000),
        ..Default::default()
    };
    let mut buf = Vec::new();
    let err = stat.encode(&mut buf).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);

    // Fits size[2] but not the extra n[2] count of TWStat
    let fixed = Dir::default().size().unwrap() as usize;
    let edge = Dir {
        name: "n".repeat(u16::MAX as usize - fixed),
        ..Default::default()
    };
    assert_eq!(edge.size(), Some(u16::MAX));
    let msg = Msg {
        tag: 1,
        body: FCall::TWStat { fid: 0, stat: edge },
    };
    assert!(write_msg(&mut Vec::new(), &msg).is_err());
}
