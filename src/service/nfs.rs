//! Userspace NFSv4.0 loopback server.
//!
//! A single-threaded event loop bound to 127.0.0.1 on an ephemeral port.
//! It speaks ONC RPC with record marking and AUTH_SYS, and answers the
//! NFSv4.0 COMPOUND subset a loopback mount needs. The export is a pseudo
//! filesystem with three handles:
//!
//! * 1: the root directory
//! * 2: "volume", whose content is the virtual block device
//! * 3: "control", a read-only metadata channel carrying the serialised
//!   volume info
//!
//! Attributes are encoded per RFC 7530 section 5, including the
//! self-describing SUPPORTED_ATTRS set.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::registry;
use crate::service::{BlockDevice, SharedDevice};

// RPC constants.
const RPC_CALL: u32 = 0;
const RPC_VERSION: u32 = 2;
const NFS_PROGRAM: u32 = 100_003;
const NFS_VERSION: u32 = 4;
const PROC_NULL: u32 = 0;
const PROC_COMPOUND: u32 = 1;
const AUTH_NONE: u32 = 0;
const AUTH_SYS: u32 = 1;

// Reply dispositions.
const MSG_ACCEPTED: u32 = 0;
const MSG_DENIED: u32 = 1;
const ACCEPT_SUCCESS: u32 = 0;
const ACCEPT_PROG_UNAVAIL: u32 = 1;
const ACCEPT_PROC_UNAVAIL: u32 = 3;
const ACCEPT_GARBAGE_ARGS: u32 = 4;
const REJECT_AUTH_ERROR: u32 = 1;
const AUTH_BADCRED: u32 = 1;

// NFSv4 operation numbers (RFC 7530).
const OP_ACCESS: u32 = 3;
const OP_CLOSE: u32 = 4;
const OP_COMMIT: u32 = 5;
const OP_GETATTR: u32 = 9;
const OP_GETFH: u32 = 10;
const OP_LOCK: u32 = 12;
const OP_LOCKT: u32 = 13;
const OP_LOCKU: u32 = 14;
const OP_LOOKUP: u32 = 15;
const OP_NVERIFY: u32 = 17;
const OP_OPEN: u32 = 18;
const OP_OPEN_CONFIRM: u32 = 20;
const OP_PUTFH: u32 = 22;
const OP_PUTROOTFH: u32 = 24;
const OP_READ: u32 = 25;
const OP_READDIR: u32 = 26;
const OP_RENEW: u32 = 30;
const OP_RESTOREFH: u32 = 31;
const OP_SAVEFH: u32 = 32;
const OP_SECINFO: u32 = 33;
const OP_SETATTR: u32 = 34;
const OP_SETCLIENTID: u32 = 35;
const OP_SETCLIENTID_CONFIRM: u32 = 36;
const OP_VERIFY: u32 = 37;
const OP_WRITE: u32 = 38;
const OP_RELEASE_LOCKOWNER: u32 = 39;
const OP_ILLEGAL: u32 = 10_044;

// NFSv4 status codes.
const NFS4_OK: u32 = 0;
const NFS4ERR_NOENT: u32 = 2;
const NFS4ERR_IO: u32 = 5;
const NFS4ERR_NOTDIR: u32 = 20;
const NFS4ERR_INVAL: u32 = 22;
const NFS4ERR_ROFS: u32 = 30;
const NFS4ERR_BADHANDLE: u32 = 10_001;
const NFS4ERR_NOFILEHANDLE: u32 = 10_020;
const NFS4ERR_MINOR_VERS_MISMATCH: u32 = 10_021;
const NFS4ERR_OP_ILLEGAL: u32 = 10_044;

// File handles of the pseudo filesystem.
const FH_ROOT: u32 = 1;
const FH_VOLUME: u32 = 2;
const FH_CONTROL: u32 = 3;

// Attribute numbers we support.
const ATTR_SUPPORTED_ATTRS: u32 = 0;
const ATTR_TYPE: u32 = 1;
const ATTR_FH_EXPIRE_TYPE: u32 = 2;
const ATTR_CHANGE: u32 = 3;
const ATTR_SIZE: u32 = 4;
const ATTR_LINK_SUPPORT: u32 = 5;
const ATTR_SYMLINK_SUPPORT: u32 = 6;
const ATTR_NAMED_ATTR: u32 = 7;
const ATTR_FSID: u32 = 8;
const ATTR_UNIQUE_HANDLES: u32 = 9;
const ATTR_LEASE_TIME: u32 = 10;
const ATTR_RDATTR_ERROR: u32 = 11;
const ATTR_FILEHANDLE: u32 = 19;
const ATTR_MODE: u32 = 33;
const ATTR_NUMLINKS: u32 = 35;
const ATTR_OWNER: u32 = 36;
const ATTR_OWNER_GROUP: u32 = 37;
const ATTR_SPACE_USED: u32 = 45;
const ATTR_TIME_ACCESS: u32 = 47;
const ATTR_TIME_METADATA: u32 = 52;
const ATTR_TIME_MODIFY: u32 = 53;

const SUPPORTED_ATTRS: [u32; 21] = [
    ATTR_SUPPORTED_ATTRS,
    ATTR_TYPE,
    ATTR_FH_EXPIRE_TYPE,
    ATTR_CHANGE,
    ATTR_SIZE,
    ATTR_LINK_SUPPORT,
    ATTR_SYMLINK_SUPPORT,
    ATTR_NAMED_ATTR,
    ATTR_FSID,
    ATTR_UNIQUE_HANDLES,
    ATTR_LEASE_TIME,
    ATTR_RDATTR_ERROR,
    ATTR_FILEHANDLE,
    ATTR_MODE,
    ATTR_NUMLINKS,
    ATTR_OWNER,
    ATTR_OWNER_GROUP,
    ATTR_SPACE_USED,
    ATTR_TIME_ACCESS,
    ATTR_TIME_METADATA,
    ATTR_TIME_MODIFY,
];

const LEASE_TIME_SECONDS: u32 = 90;
const MAX_RECORD_SIZE: usize = 4 * 1024 * 1024;

/// Big-endian XDR reader.
struct Xdr<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Xdr<'a> {
    fn new(data: &'a [u8]) -> Xdr<'a> {
        Xdr { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> std::result::Result<&'a [u8], ()> {
        if self.pos + n > self.data.len() {
            return Err(());
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u32(&mut self) -> std::result::Result<u32, ()> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> std::result::Result<u64, ()> {
        Ok((u64::from(self.u32()?) << 32) | u64::from(self.u32()?))
    }

    /// Variable-length opaque: length word plus data padded to 4 bytes.
    fn opaque(&mut self) -> std::result::Result<&'a [u8], ()> {
        let len = self.u32()? as usize;
        if len > MAX_RECORD_SIZE {
            return Err(());
        }
        let data = self.take(len)?;
        let pad = (4 - len % 4) % 4;
        self.take(pad)?;
        Ok(data)
    }

    fn string(&mut self) -> std::result::Result<String, ()> {
        let bytes = self.opaque()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ())
    }

    /// Attribute bitmap: word count plus words.
    fn bitmap(&mut self) -> std::result::Result<Vec<u32>, ()> {
        let words = self.u32()? as usize;
        if words > 16 {
            return Err(());
        }
        let mut out = Vec::with_capacity(words);
        for _ in 0..words {
            out.push(self.u32()?);
        }
        Ok(out)
    }

    fn stateid(&mut self) -> std::result::Result<(u32, [u8; 12]), ()> {
        let seqid = self.u32()?;
        let other = self.take(12)?;
        let mut o = [0u8; 12];
        o.copy_from_slice(other);
        Ok((seqid, o))
    }
}

/// Big-endian XDR writer.
#[derive(Default)]
struct XdrOut {
    buf: Vec<u8>,
}

impl XdrOut {
    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn opaque(&mut self, bytes: &[u8]) {
        self.u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
        let pad = (4 - bytes.len() % 4) % 4;
        self.buf.extend_from_slice(&[0u8; 4][..pad]);
    }

    fn string(&mut self, s: &str) {
        self.opaque(s.as_bytes());
    }

    fn bitmap(&mut self, words: &[u32]) {
        self.u32(words.len() as u32);
        for w in words {
            self.u32(*w);
        }
    }

    fn stateid(&mut self, seqid: u32, other: &[u8; 12]) {
        self.u32(seqid);
        self.raw(other);
    }
}

fn bitmap_from_attrs(attrs: &[u32]) -> Vec<u32> {
    let mut words = vec![0u32; 2];
    for &a in attrs {
        let word = (a / 32) as usize;
        if word >= words.len() {
            words.resize(word + 1, 0);
        }
        words[word] |= 1 << (a % 32);
    }
    words
}

fn bitmap_contains(bitmap: &[u32], attr: u32) -> bool {
    let word = (attr / 32) as usize;
    word < bitmap.len() && bitmap[word] & (1 << (attr % 32)) != 0
}

/// Per-connection COMPOUND state.
struct Session {
    current_fh: Option<u32>,
    saved_fh: Option<u32>,
}

/// Server-wide state for one served volume.
struct NfsServer {
    device: SharedDevice,
    slot_hint: u64,
    change_counter: u64,
    next_state: u32,
    next_clientid: u64,
    write_verifier: [u8; 8],
}

impl NfsServer {
    fn new(device: SharedDevice) -> NfsServer {
        let mut verifier = [0u8; 8];
        let _ = crate::rng::get_data(&mut verifier, true);
        NfsServer {
            device,
            slot_hint: 0,
            change_counter: 1,
            next_state: 1,
            next_clientid: 1,
            write_verifier: verifier,
        }
    }

    fn volume_size(&self) -> u64 {
        self.device.lock().unwrap_or_else(|e| e.into_inner()).size()
    }

    fn control_bytes(&self) -> Vec<u8> {
        let device = self.device.lock().unwrap_or_else(|e| e.into_inner());
        let info = device.info(self.slot_hint as u32, None);
        registry::serialize_info(&info).into_bytes()
    }

    fn read_only(&self) -> bool {
        let device = self.device.lock().unwrap_or_else(|e| e.into_inner());
        device.volume().is_read_only()
    }

    fn file_size(&self, fh: u32) -> u64 {
        match fh {
            FH_VOLUME => self.volume_size(),
            FH_CONTROL => self.control_bytes().len() as u64,
            _ => 0,
        }
    }

    /// Encode the requested-and-supported attributes for `fh` in ascending
    /// attribute order, as RFC 7530 requires.
    fn encode_attrs(&self, fh: u32, requested: &[u32]) -> (Vec<u32>, Vec<u8>) {
        let mut present = Vec::new();
        let mut vals = XdrOut::default();

        for &attr in SUPPORTED_ATTRS.iter() {
            if !bitmap_contains(requested, attr) {
                continue;
            }
            present.push(attr);
            match attr {
                ATTR_SUPPORTED_ATTRS => {
                    vals.bitmap(&bitmap_from_attrs(&SUPPORTED_ATTRS));
                }
                ATTR_TYPE => vals.u32(if fh == FH_ROOT { 2 } else { 1 }), // NF4DIR / NF4REG
                ATTR_FH_EXPIRE_TYPE => vals.u32(0),                       // FH4_PERSISTENT
                ATTR_CHANGE => vals.u64(self.change_counter),
                ATTR_SIZE => vals.u64(self.file_size(fh)),
                ATTR_LINK_SUPPORT => vals.u32(0),
                ATTR_SYMLINK_SUPPORT => vals.u32(0),
                ATTR_NAMED_ATTR => vals.u32(0),
                ATTR_FSID => {
                    vals.u64(0xBA5A);
                    vals.u64(self.slot_hint);
                }
                ATTR_UNIQUE_HANDLES => vals.u32(1),
                ATTR_LEASE_TIME => vals.u32(LEASE_TIME_SECONDS),
                ATTR_RDATTR_ERROR => vals.u32(NFS4_OK),
                ATTR_FILEHANDLE => vals.opaque(&fh.to_be_bytes()),
                ATTR_MODE => vals.u32(if fh == FH_ROOT { 0o755 } else { 0o600 }),
                ATTR_NUMLINKS => vals.u32(if fh == FH_ROOT { 2 } else { 1 }),
                ATTR_OWNER => vals.string("0"),
                ATTR_OWNER_GROUP => vals.string("0"),
                ATTR_SPACE_USED => vals.u64(self.file_size(fh)),
                ATTR_TIME_ACCESS | ATTR_TIME_METADATA | ATTR_TIME_MODIFY => {
                    let secs = std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_secs();
                    vals.u64(secs); // int64 seconds
                    vals.u32(0); // nseconds
                }
                _ => {}
            }
        }
        (bitmap_from_attrs(&present), vals.buf)
    }

    fn next_stateid(&mut self) -> (u32, [u8; 12]) {
        let n = self.next_state;
        self.next_state = self.next_state.wrapping_add(1);
        let mut other = [0u8; 12];
        other[..4].copy_from_slice(&n.to_be_bytes());
        other[4..8].copy_from_slice(b"bslt");
        (1, other)
    }

    /// Process one COMPOUND call. Ops execute in order until the first
    /// failure, per RFC 7530.
    fn compound(&mut self, args: &mut Xdr<'_>) -> std::result::Result<Vec<u8>, ()> {
        let tag = args.opaque()?.to_vec();
        let minor = args.u32()?;
        let numops = args.u32()?;

        let mut results = XdrOut::default();
        let mut session = Session {
            current_fh: None,
            saved_fh: None,
        };

        if minor != 0 {
            let mut out = XdrOut::default();
            out.u32(NFS4ERR_MINOR_VERS_MISMATCH);
            out.opaque(&tag);
            out.u32(0);
            return Ok(out.buf);
        }

        let mut status = NFS4_OK;
        let mut completed = 0u32;
        for _ in 0..numops {
            let op = args.u32()?;
            let op_status = self.dispatch(op, args, &mut session, &mut results)?;
            completed += 1;
            if op_status != NFS4_OK {
                status = op_status;
                break;
            }
        }

        let mut out = XdrOut::default();
        out.u32(status);
        out.opaque(&tag);
        out.u32(completed);
        out.raw(&results.buf);
        Ok(out.buf)
    }

    /// Execute one operation, appending its result (opcode, status, body).
    /// Returns the op status. A parse failure of the op arguments is a
    /// garbage-args error for the whole call, signalled with `Err`.
    fn dispatch(
        &mut self,
        op: u32,
        args: &mut Xdr<'_>,
        session: &mut Session,
        results: &mut XdrOut,
    ) -> std::result::Result<u32, ()> {
        match op {
            OP_PUTROOTFH => {
                session.current_fh = Some(FH_ROOT);
                results.u32(op);
                results.u32(NFS4_OK);
                Ok(NFS4_OK)
            }
            OP_PUTFH => {
                let fh = args.opaque()?;
                results.u32(op);
                if fh.len() != 4 {
                    results.u32(NFS4ERR_BADHANDLE);
                    return Ok(NFS4ERR_BADHANDLE);
                }
                let handle = u32::from_be_bytes([fh[0], fh[1], fh[2], fh[3]]);
                if !(FH_ROOT..=FH_CONTROL).contains(&handle) {
                    results.u32(NFS4ERR_BADHANDLE);
                    return Ok(NFS4ERR_BADHANDLE);
                }
                session.current_fh = Some(handle);
                results.u32(NFS4_OK);
                Ok(NFS4_OK)
            }
            OP_GETFH => {
                results.u32(op);
                match session.current_fh {
                    Some(fh) => {
                        results.u32(NFS4_OK);
                        results.opaque(&fh.to_be_bytes());
                        Ok(NFS4_OK)
                    }
                    None => {
                        results.u32(NFS4ERR_NOFILEHANDLE);
                        Ok(NFS4ERR_NOFILEHANDLE)
                    }
                }
            }
            OP_SAVEFH => {
                results.u32(op);
                match session.current_fh {
                    Some(fh) => {
                        session.saved_fh = Some(fh);
                        results.u32(NFS4_OK);
                        Ok(NFS4_OK)
                    }
                    None => {
                        results.u32(NFS4ERR_NOFILEHANDLE);
                        Ok(NFS4ERR_NOFILEHANDLE)
                    }
                }
            }
            OP_RESTOREFH => {
                results.u32(op);
                match session.saved_fh {
                    Some(fh) => {
                        session.current_fh = Some(fh);
                        results.u32(NFS4_OK);
                        Ok(NFS4_OK)
                    }
                    None => {
                        results.u32(NFS4ERR_NOFILEHANDLE);
                        Ok(NFS4ERR_NOFILEHANDLE)
                    }
                }
            }
            OP_LOOKUP => {
                let name = args.string()?;
                results.u32(op);
                let status = match session.current_fh {
                    None => NFS4ERR_NOFILEHANDLE,
                    Some(FH_ROOT) => match name.as_str() {
                        "volume" => {
                            session.current_fh = Some(FH_VOLUME);
                            NFS4_OK
                        }
                        "control" => {
                            session.current_fh = Some(FH_CONTROL);
                            NFS4_OK
                        }
                        _ => NFS4ERR_NOENT,
                    },
                    Some(_) => NFS4ERR_NOTDIR,
                };
                results.u32(status);
                Ok(status)
            }
            OP_GETATTR => {
                let requested = args.bitmap()?;
                results.u32(op);
                match session.current_fh {
                    None => {
                        results.u32(NFS4ERR_NOFILEHANDLE);
                        Ok(NFS4ERR_NOFILEHANDLE)
                    }
                    Some(fh) => {
                        let (bitmap, vals) = self.encode_attrs(fh, &requested);
                        results.u32(NFS4_OK);
                        results.bitmap(&bitmap);
                        results.opaque(&vals);
                        Ok(NFS4_OK)
                    }
                }
            }
            OP_SETATTR => {
                // Stateid, then the attributes; our pseudo-fs accepts and
                // ignores them.
                args.stateid()?;
                args.bitmap()?;
                args.opaque()?;
                results.u32(op);
                results.u32(NFS4_OK);
                results.bitmap(&[]);
                Ok(NFS4_OK)
            }
            OP_ACCESS => {
                let requested = args.u32()?;
                results.u32(op);
                match session.current_fh {
                    None => {
                        results.u32(NFS4ERR_NOFILEHANDLE);
                        Ok(NFS4ERR_NOFILEHANDLE)
                    }
                    Some(fh) => {
                        // READ=1 LOOKUP=2 MODIFY=4 EXTEND=8
                        let mut supported = 0x1 | 0x2;
                        if fh == FH_VOLUME && !self.read_only() {
                            supported |= 0x4 | 0x8;
                        }
                        results.u32(NFS4_OK);
                        results.u32(supported);
                        results.u32(requested & supported);
                        Ok(NFS4_OK)
                    }
                }
            }
            OP_READDIR => {
                let cookie = args.u64()?;
                let _verifier = args.take(8)?;
                let _dircount = args.u32()?;
                let _maxcount = args.u32()?;
                let requested = args.bitmap()?;
                results.u32(op);
                if session.current_fh != Some(FH_ROOT) {
                    let status = if session.current_fh.is_none() {
                        NFS4ERR_NOFILEHANDLE
                    } else {
                        NFS4ERR_NOTDIR
                    };
                    results.u32(status);
                    return Ok(status);
                }

                results.u32(NFS4_OK);
                results.raw(&[0u8; 8]); // cookie verifier
                for (entry_cookie, name, fh) in
                    [(3u64, "volume", FH_VOLUME), (4u64, "control", FH_CONTROL)]
                {
                    if entry_cookie <= cookie {
                        continue;
                    }
                    results.u32(1); // another entry follows
                    results.u64(entry_cookie);
                    results.string(name);
                    let (bitmap, vals) = self.encode_attrs(fh, &requested);
                    results.bitmap(&bitmap);
                    results.opaque(&vals);
                }
                results.u32(0); // no more entries
                results.u32(1); // eof
                Ok(NFS4_OK)
            }
            OP_OPEN => {
                let _seqid = args.u32()?;
                let share_access = args.u32()?;
                let _share_deny = args.u32()?;
                let _owner_clientid = args.u64()?;
                let _owner = args.opaque()?;
                let opentype = args.u32()?;
                if opentype == 1 {
                    // CREATE: consume the createhow; creation itself is not
                    // meaningful in the pseudo-fs.
                    let createmode = args.u32()?;
                    match createmode {
                        0 | 1 => {
                            args.bitmap()?;
                            args.opaque()?;
                        }
                        _ => {
                            args.take(8)?;
                        }
                    }
                }
                let claim_type = args.u32()?;
                let name = if claim_type == 0 {
                    args.string()?
                } else {
                    results.u32(op);
                    results.u32(NFS4ERR_INVAL);
                    return Ok(NFS4ERR_INVAL);
                };

                results.u32(op);
                let target = match (session.current_fh, name.as_str()) {
                    (Some(FH_ROOT), "volume") => FH_VOLUME,
                    (Some(FH_ROOT), "control") => FH_CONTROL,
                    (Some(FH_ROOT), _) => {
                        results.u32(NFS4ERR_NOENT);
                        return Ok(NFS4ERR_NOENT);
                    }
                    _ => {
                        results.u32(NFS4ERR_NOFILEHANDLE);
                        return Ok(NFS4ERR_NOFILEHANDLE);
                    }
                };
                if target == FH_VOLUME && share_access & 0x2 != 0 && self.read_only() {
                    results.u32(NFS4ERR_ROFS);
                    return Ok(NFS4ERR_ROFS);
                }
                session.current_fh = Some(target);

                let (seqid, other) = self.next_stateid();
                results.u32(NFS4_OK);
                results.stateid(seqid, &other);
                // change_info: atomic, before, after.
                results.u32(1);
                results.u64(self.change_counter);
                results.u64(self.change_counter);
                results.u32(0x2); // OPEN4_RESULT_CONFIRM
                results.bitmap(&[]);
                results.u32(0); // OPEN_DELEGATE_NONE
                Ok(NFS4_OK)
            }
            OP_OPEN_CONFIRM => {
                let (_seq, other) = args.stateid()?;
                let _seqid = args.u32()?;
                results.u32(op);
                results.u32(NFS4_OK);
                results.stateid(2, &other);
                Ok(NFS4_OK)
            }
            OP_CLOSE => {
                let _seqid = args.u32()?;
                let (_seq, other) = args.stateid()?;
                results.u32(op);
                results.u32(NFS4_OK);
                results.stateid(0, &other);
                Ok(NFS4_OK)
            }
            OP_READ => {
                args.stateid()?;
                let offset = args.u64()?;
                let count = args.u32()? as usize;
                results.u32(op);

                match session.current_fh {
                    Some(FH_VOLUME) => {
                        let size = self.volume_size();
                        if offset >= size {
                            results.u32(NFS4_OK);
                            results.u32(1); // eof
                            results.opaque(&[]);
                            return Ok(NFS4_OK);
                        }
                        let n = count.min((size - offset) as usize).min(MAX_RECORD_SIZE / 2);
                        let mut buf = vec![0u8; n];
                        let read = {
                            let mut device =
                                self.device.lock().unwrap_or_else(|e| e.into_inner());
                            device.read_at(offset, &mut buf)
                        };
                        match read {
                            Ok(()) => {
                                results.u32(NFS4_OK);
                                results.u32(u32::from(offset + n as u64 >= size));
                                results.opaque(&buf);
                                Ok(NFS4_OK)
                            }
                            Err(err) => {
                                log::warn!("NFS read failed: {err}");
                                results.u32(NFS4ERR_IO);
                                Ok(NFS4ERR_IO)
                            }
                        }
                    }
                    Some(FH_CONTROL) => {
                        let content = self.control_bytes();
                        let start = (offset as usize).min(content.len());
                        let end = (start + count).min(content.len());
                        results.u32(NFS4_OK);
                        results.u32(u32::from(end == content.len()));
                        results.opaque(&content[start..end]);
                        Ok(NFS4_OK)
                    }
                    Some(FH_ROOT) => {
                        results.u32(NFS4ERR_INVAL);
                        Ok(NFS4ERR_INVAL)
                    }
                    Some(_) => {
                        results.u32(NFS4ERR_BADHANDLE);
                        Ok(NFS4ERR_BADHANDLE)
                    }
                    None => {
                        results.u32(NFS4ERR_NOFILEHANDLE);
                        Ok(NFS4ERR_NOFILEHANDLE)
                    }
                }
            }
            OP_WRITE => {
                args.stateid()?;
                let offset = args.u64()?;
                let _stable = args.u32()?;
                let data = args.opaque()?;
                results.u32(op);

                match session.current_fh {
                    Some(FH_VOLUME) => {
                        if self.read_only() {
                            results.u32(NFS4ERR_ROFS);
                            return Ok(NFS4ERR_ROFS);
                        }
                        let write = {
                            let mut device =
                                self.device.lock().unwrap_or_else(|e| e.into_inner());
                            device.write_at(offset, data)
                        };
                        match write {
                            Ok(()) => {
                                self.change_counter += 1;
                                results.u32(NFS4_OK);
                                results.u32(data.len() as u32);
                                results.u32(2); // FILE_SYNC4
                                results.raw(&self.write_verifier);
                                Ok(NFS4_OK)
                            }
                            Err(Error::VolumeProtected | Error::VolumeReadOnly) => {
                                results.u32(NFS4ERR_ROFS);
                                Ok(NFS4ERR_ROFS)
                            }
                            Err(err) => {
                                log::warn!("NFS write failed: {err}");
                                results.u32(NFS4ERR_IO);
                                Ok(NFS4ERR_IO)
                            }
                        }
                    }
                    Some(FH_CONTROL) => {
                        // The control channel ignores writes.
                        results.u32(NFS4_OK);
                        results.u32(data.len() as u32);
                        results.u32(2);
                        results.raw(&self.write_verifier);
                        Ok(NFS4_OK)
                    }
                    Some(FH_ROOT) => {
                        results.u32(NFS4ERR_INVAL);
                        Ok(NFS4ERR_INVAL)
                    }
                    Some(_) => {
                        results.u32(NFS4ERR_BADHANDLE);
                        Ok(NFS4ERR_BADHANDLE)
                    }
                    None => {
                        results.u32(NFS4ERR_NOFILEHANDLE);
                        Ok(NFS4ERR_NOFILEHANDLE)
                    }
                }
            }
            OP_COMMIT => {
                let _offset = args.u64()?;
                let _count = args.u32()?;
                results.u32(op);
                let flushed = {
                    let mut device = self.device.lock().unwrap_or_else(|e| e.into_inner());
                    device.flush()
                };
                match flushed {
                    Ok(()) => {
                        results.u32(NFS4_OK);
                        results.raw(&self.write_verifier);
                        Ok(NFS4_OK)
                    }
                    Err(err) => {
                        log::warn!("NFS commit failed: {err}");
                        results.u32(NFS4ERR_IO);
                        Ok(NFS4ERR_IO)
                    }
                }
            }
            OP_SETCLIENTID => {
                let _verifier = args.take(8)?;
                let _id = args.opaque()?;
                let _cb_program = args.u32()?;
                let _netid = args.string()?;
                let _addr = args.string()?;
                let _callback_ident = args.u32()?;
                results.u32(op);
                results.u32(NFS4_OK);
                let clientid = self.next_clientid;
                self.next_clientid += 1;
                results.u64(clientid);
                results.raw(&self.write_verifier);
                Ok(NFS4_OK)
            }
            OP_SETCLIENTID_CONFIRM => {
                let _clientid = args.u64()?;
                let _verifier = args.take(8)?;
                results.u32(op);
                results.u32(NFS4_OK);
                Ok(NFS4_OK)
            }
            OP_RENEW => {
                let _clientid = args.u64()?;
                results.u32(op);
                results.u32(NFS4_OK);
                Ok(NFS4_OK)
            }
            OP_LOCK => {
                let _locktype = args.u32()?;
                let _reclaim = args.u32()?;
                let _offset = args.u64()?;
                let _length = args.u64()?;
                let new_owner = args.u32()?;
                let other = if new_owner != 0 {
                    let _open_seqid = args.u32()?;
                    let (_seq, other) = args.stateid()?;
                    let _lock_seqid = args.u32()?;
                    let _clientid = args.u64()?;
                    let _owner = args.opaque()?;
                    other
                } else {
                    let (_seq, other) = args.stateid()?;
                    let _lock_seqid = args.u32()?;
                    other
                };
                // Locks are always granted: a loopback export has exactly
                // one writer by construction.
                results.u32(op);
                results.u32(NFS4_OK);
                results.stateid(1, &other);
                Ok(NFS4_OK)
            }
            OP_LOCKT => {
                let _locktype = args.u32()?;
                let _offset = args.u64()?;
                let _length = args.u64()?;
                let _clientid = args.u64()?;
                let _owner = args.opaque()?;
                results.u32(op);
                results.u32(NFS4_OK); // no conflicting lock
                Ok(NFS4_OK)
            }
            OP_LOCKU => {
                let _locktype = args.u32()?;
                let _seqid = args.u32()?;
                let (_seq, other) = args.stateid()?;
                let _offset = args.u64()?;
                let _length = args.u64()?;
                results.u32(op);
                results.u32(NFS4_OK);
                results.stateid(0, &other);
                Ok(NFS4_OK)
            }
            OP_RELEASE_LOCKOWNER => {
                let _clientid = args.u64()?;
                let _owner = args.opaque()?;
                results.u32(op);
                results.u32(NFS4_OK);
                Ok(NFS4_OK)
            }
            OP_SECINFO => {
                let _name = args.string()?;
                results.u32(op);
                results.u32(NFS4_OK);
                results.u32(1); // one flavor
                results.u32(AUTH_SYS);
                Ok(NFS4_OK)
            }
            OP_VERIFY | OP_NVERIFY => {
                args.bitmap()?;
                args.opaque()?;
                results.u32(op);
                results.u32(NFS4_OK);
                Ok(NFS4_OK)
            }
            _ => {
                log::debug!("illegal NFS op {op}");
                results.u32(OP_ILLEGAL);
                results.u32(NFS4ERR_OP_ILLEGAL);
                Ok(NFS4ERR_OP_ILLEGAL)
            }
        }
    }

    /// Handle one RPC message, returning the reply body (without record
    /// marking).
    fn handle_message(&mut self, message: &[u8]) -> Option<Vec<u8>> {
        let mut xdr = Xdr::new(message);
        let xid = xdr.u32().ok()?;
        let msg_type = xdr.u32().ok()?;
        if msg_type != RPC_CALL {
            return None;
        }
        let rpcvers = xdr.u32().ok()?;
        let prog = xdr.u32().ok()?;
        let vers = xdr.u32().ok()?;
        let proc = xdr.u32().ok()?;
        let cred_flavor = xdr.u32().ok()?;
        let _cred_body = xdr.opaque().ok()?;
        let _verf_flavor = xdr.u32().ok()?;
        let _verf_body = xdr.opaque().ok()?;

        let mut reply = XdrOut::default();
        reply.u32(xid);
        reply.u32(1); // REPLY

        if rpcvers != RPC_VERSION {
            reply.u32(MSG_DENIED);
            reply.u32(0); // RPC_MISMATCH
            reply.u32(RPC_VERSION);
            reply.u32(RPC_VERSION);
            return Some(reply.buf);
        }
        if cred_flavor != AUTH_SYS && cred_flavor != AUTH_NONE {
            reply.u32(MSG_DENIED);
            reply.u32(REJECT_AUTH_ERROR);
            reply.u32(AUTH_BADCRED);
            return Some(reply.buf);
        }

        reply.u32(MSG_ACCEPTED);
        reply.u32(AUTH_NONE); // verifier
        reply.u32(0);

        if prog != NFS_PROGRAM || vers != NFS_VERSION {
            reply.u32(ACCEPT_PROG_UNAVAIL);
            return Some(reply.buf);
        }

        match proc {
            PROC_NULL => {
                reply.u32(ACCEPT_SUCCESS);
                Some(reply.buf)
            }
            PROC_COMPOUND => match self.compound(&mut xdr) {
                Ok(body) => {
                    reply.u32(ACCEPT_SUCCESS);
                    reply.raw(&body);
                    Some(reply.buf)
                }
                Err(()) => {
                    reply.u32(ACCEPT_GARBAGE_ARGS);
                    Some(reply.buf)
                }
            },
            _ => {
                reply.u32(ACCEPT_PROC_UNAVAIL);
                Some(reply.buf)
            }
        }
    }
}

/// Read one record-marked RPC message. Returns `Ok(None)` on clean EOF.
fn read_record(stream: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
    let mut message = Vec::new();
    loop {
        let mut mark = [0u8; 4];
        match stream.read_exact(&mut mark) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof && message.is_empty() => {
                return Ok(None)
            }
            Err(e) => return Err(e),
        }
        let word = u32::from_be_bytes(mark);
        let last = word & 0x8000_0000 != 0;
        let len = (word & 0x7FFF_FFFF) as usize;
        if message.len() + len > MAX_RECORD_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "oversized RPC record",
            ));
        }
        let start = message.len();
        message.resize(start + len, 0);
        stream.read_exact(&mut message[start..])?;
        if last {
            return Ok(Some(message));
        }
    }
}

fn write_record(stream: &mut TcpStream, body: &[u8]) -> std::io::Result<()> {
    let mark = 0x8000_0000u32 | body.len() as u32;
    stream.write_all(&mark.to_be_bytes())?;
    stream.write_all(body)?;
    stream.flush()
}

fn serve_connection(server: &mut NfsServer, stream: &mut TcpStream, shutdown: &AtomicBool) {
    stream
        .set_read_timeout(Some(Duration::from_millis(200)))
        .ok();
    while !shutdown.load(Ordering::SeqCst) {
        match read_record(stream) {
            Ok(Some(message)) => {
                if let Some(reply) = server.handle_message(&message) {
                    if write_record(stream, &reply).is_err() {
                        return;
                    }
                }
            }
            Ok(None) => return,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(_) => return,
        }
    }
}

/// Start the NFS event loop for one device. Returns the thread handle and
/// the bound address the host collaborator should mount.
pub fn serve(
    device: SharedDevice,
    shutdown: Arc<AtomicBool>,
) -> Result<(JoinHandle<()>, SocketAddr)> {
    let listener =
        TcpListener::bind(("127.0.0.1", 0)).map_err(|e| Error::system(e, "NFS listener"))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| Error::system(e, "NFS listener"))?;
    let addr = listener
        .local_addr()
        .map_err(|e| Error::system(e, "NFS listener"))?;

    let thread = std::thread::Builder::new()
        .name("basalt-nfs".to_string())
        .spawn(move || {
            let mut server = NfsServer::new(device);
            log::info!("NFS export listening on {addr}");
            while !shutdown.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((mut stream, peer)) => {
                        log::debug!("NFS client connected from {peer}");
                        stream.set_nonblocking(false).ok();
                        serve_connection(&mut server, &mut stream, &shutdown);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(50));
                    }
                    Err(e) => {
                        log::warn!("NFS accept failed: {e}");
                        break;
                    }
                }
            }
            log::debug!("NFS event loop stopped");
        })
        .map_err(|e| Error::system(e, "NFS thread"))?;

    Ok((thread, addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create::{create_volume, CreateOptions, FilesystemType};
    use crate::crypto::EncryptionAlgorithm;
    use crate::kdf::Kdf;
    use crate::memory::Password;
    use crate::rng;
    use crate::service::VolumeDevice;
    use crate::volume::{OpenOptions, Volume};
    use std::sync::Mutex;

    fn test_shared_device() -> SharedDevice {
        rng::start().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nfs.bslt");
        std::mem::forget(dir);
        create_volume(
            CreateOptions {
                path: path.clone(),
                size: 1024 * 1024,
                algorithm: EncryptionAlgorithm::Aes,
                kdf: Kdf::Pbkdf2Sha512Legacy,
                password: Password::from_str("pw").unwrap(),
                keyfiles: Vec::new(),
                filesystem: FilesystemType::None,
                quick: true,
                sector_size: 512,
                hidden_size: None,
                hidden_password: None,
            },
            None,
            &mut |_, _| {},
        )
        .unwrap();
        let volume =
            Volume::open(OpenOptions::new(&path, Password::from_str("pw").unwrap())).unwrap();
        Arc::new(Mutex::new(VolumeDevice::new(volume)))
    }

    struct Client {
        stream: TcpStream,
        xid: u32,
    }

    impl Client {
        fn connect(addr: SocketAddr) -> Client {
            Client {
                stream: TcpStream::connect(addr).unwrap(),
                xid: 100,
            }
        }

        fn call(&mut self, proc: u32, body: &[u8]) -> Vec<u8> {
            self.xid += 1;
            let mut msg = XdrOut::default();
            msg.u32(self.xid);
            msg.u32(RPC_CALL);
            msg.u32(RPC_VERSION);
            msg.u32(NFS_PROGRAM);
            msg.u32(NFS_VERSION);
            msg.u32(proc);
            msg.u32(AUTH_SYS);
            // Minimal AUTH_SYS credential body.
            let mut cred = XdrOut::default();
            cred.u32(0); // stamp
            cred.string("test");
            cred.u32(0); // uid
            cred.u32(0); // gid
            cred.u32(0); // no aux gids
            msg.opaque(&cred.buf);
            msg.u32(AUTH_NONE);
            msg.opaque(&[]);
            msg.raw(body);

            write_record(&mut self.stream, &msg.buf).unwrap();
            let reply = read_record(&mut self.stream).unwrap().unwrap();

            // Strip the RPC reply envelope, asserting MSG_ACCEPTED/SUCCESS.
            let mut xdr = Xdr::new(&reply);
            assert_eq!(xdr.u32().unwrap(), self.xid);
            assert_eq!(xdr.u32().unwrap(), 1); // REPLY
            assert_eq!(xdr.u32().unwrap(), MSG_ACCEPTED);
            let _verf_flavor = xdr.u32().unwrap();
            let _verf = xdr.opaque().unwrap();
            assert_eq!(xdr.u32().unwrap(), ACCEPT_SUCCESS);
            reply[xdr.pos..].to_vec()
        }

        fn compound(&mut self, ops: &XdrOut, numops: u32) -> Vec<u8> {
            let mut body = XdrOut::default();
            body.opaque(b""); // tag
            body.u32(0); // minorversion
            body.u32(numops);
            body.raw(&ops.buf);
            self.call(PROC_COMPOUND, &body.buf)
        }
    }

    #[test]
    fn null_procedure_round_trips() {
        let device = test_shared_device();
        let shutdown = Arc::new(AtomicBool::new(false));
        let (thread, addr) = serve(device, shutdown.clone()).unwrap();

        let mut client = Client::connect(addr);
        let rest = client.call(PROC_NULL, &[]);
        assert!(rest.is_empty());

        shutdown.store(true, Ordering::SeqCst);
        drop(client);
        thread.join().unwrap();
    }

    #[test]
    fn compound_lookup_read_write() {
        let device = test_shared_device();
        let shutdown = Arc::new(AtomicBool::new(false));
        let (thread, addr) = serve(device.clone(), shutdown.clone()).unwrap();
        let mut client = Client::connect(addr);

        // PUTROOTFH ; LOOKUP "volume" ; GETFH.
        let mut ops = XdrOut::default();
        ops.u32(OP_PUTROOTFH);
        ops.u32(OP_LOOKUP);
        ops.string("volume");
        ops.u32(OP_GETFH);
        let res = client.compound(&ops, 3);
        let mut xdr = Xdr::new(&res);
        assert_eq!(xdr.u32().unwrap(), NFS4_OK); // compound status
        let _tag = xdr.opaque().unwrap();
        assert_eq!(xdr.u32().unwrap(), 3); // three results
        assert_eq!(xdr.u32().unwrap(), OP_PUTROOTFH);
        assert_eq!(xdr.u32().unwrap(), NFS4_OK);
        assert_eq!(xdr.u32().unwrap(), OP_LOOKUP);
        assert_eq!(xdr.u32().unwrap(), NFS4_OK);
        assert_eq!(xdr.u32().unwrap(), OP_GETFH);
        assert_eq!(xdr.u32().unwrap(), NFS4_OK);
        assert_eq!(xdr.opaque().unwrap(), FH_VOLUME.to_be_bytes());

        // PUTFH(volume) ; WRITE @0 ; then read it back.
        let payload = b"sector payload..";
        let mut ops = XdrOut::default();
        ops.u32(OP_PUTFH);
        ops.opaque(&FH_VOLUME.to_be_bytes());
        ops.u32(OP_WRITE);
        ops.stateid(0, &[0u8; 12]);
        ops.u64(0);
        ops.u32(2); // FILE_SYNC4
        ops.opaque(payload);
        let res = client.compound(&ops, 2);
        let mut xdr = Xdr::new(&res);
        assert_eq!(xdr.u32().unwrap(), NFS4_OK);
        let _tag = xdr.opaque().unwrap();
        assert_eq!(xdr.u32().unwrap(), 2);
        assert_eq!(xdr.u32().unwrap(), OP_PUTFH);
        assert_eq!(xdr.u32().unwrap(), NFS4_OK);
        assert_eq!(xdr.u32().unwrap(), OP_WRITE);
        assert_eq!(xdr.u32().unwrap(), NFS4_OK);
        assert_eq!(xdr.u32().unwrap(), payload.len() as u32);

        let mut ops = XdrOut::default();
        ops.u32(OP_PUTFH);
        ops.opaque(&FH_VOLUME.to_be_bytes());
        ops.u32(OP_READ);
        ops.stateid(0, &[0u8; 12]);
        ops.u64(0);
        ops.u32(16);
        let res = client.compound(&ops, 2);
        let mut xdr = Xdr::new(&res);
        assert_eq!(xdr.u32().unwrap(), NFS4_OK);
        let _tag = xdr.opaque().unwrap();
        assert_eq!(xdr.u32().unwrap(), 2);
        assert_eq!(xdr.u32().unwrap(), OP_PUTFH);
        assert_eq!(xdr.u32().unwrap(), NFS4_OK);
        assert_eq!(xdr.u32().unwrap(), OP_READ);
        assert_eq!(xdr.u32().unwrap(), NFS4_OK);
        let _eof = xdr.u32().unwrap();
        assert_eq!(xdr.opaque().unwrap(), payload);

        shutdown.store(true, Ordering::SeqCst);
        drop(client);
        thread.join().unwrap();
    }

    #[test]
    fn getattr_reports_size_and_type() {
        let device = test_shared_device();
        let expected_size = {
            let dev = device.lock().unwrap();
            dev.size()
        };
        let shutdown = Arc::new(AtomicBool::new(false));
        let (thread, addr) = serve(device, shutdown.clone()).unwrap();
        let mut client = Client::connect(addr);

        let mut ops = XdrOut::default();
        ops.u32(OP_PUTFH);
        ops.opaque(&FH_VOLUME.to_be_bytes());
        ops.u32(OP_GETATTR);
        ops.bitmap(&bitmap_from_attrs(&[ATTR_TYPE, ATTR_SIZE]));
        let res = client.compound(&ops, 2);
        let mut xdr = Xdr::new(&res);
        assert_eq!(xdr.u32().unwrap(), NFS4_OK);
        let _tag = xdr.opaque().unwrap();
        assert_eq!(xdr.u32().unwrap(), 2);
        assert_eq!(xdr.u32().unwrap(), OP_PUTFH);
        assert_eq!(xdr.u32().unwrap(), NFS4_OK);
        assert_eq!(xdr.u32().unwrap(), OP_GETATTR);
        assert_eq!(xdr.u32().unwrap(), NFS4_OK);
        let bitmap = xdr.bitmap().unwrap();
        assert!(bitmap_contains(&bitmap, ATTR_TYPE));
        assert!(bitmap_contains(&bitmap, ATTR_SIZE));
        let vals = xdr.opaque().unwrap();
        let mut vx = Xdr::new(vals);
        assert_eq!(vx.u32().unwrap(), 1); // NF4REG
        assert_eq!(vx.u64().unwrap(), expected_size);

        shutdown.store(true, Ordering::SeqCst);
        drop(client);
        thread.join().unwrap();
    }

    #[test]
    fn readdir_lists_volume_and_control() {
        let device = test_shared_device();
        let shutdown = Arc::new(AtomicBool::new(false));
        let (thread, addr) = serve(device, shutdown.clone()).unwrap();
        let mut client = Client::connect(addr);

        let mut ops = XdrOut::default();
        ops.u32(OP_PUTROOTFH);
        ops.u32(OP_READDIR);
        ops.u64(0); // cookie
        ops.raw(&[0u8; 8]); // verifier
        ops.u32(1024);
        ops.u32(4096);
        ops.bitmap(&bitmap_from_attrs(&[ATTR_TYPE]));
        let res = client.compound(&ops, 2);
        let mut xdr = Xdr::new(&res);
        assert_eq!(xdr.u32().unwrap(), NFS4_OK);
        let _tag = xdr.opaque().unwrap();
        assert_eq!(xdr.u32().unwrap(), 2);
        assert_eq!(xdr.u32().unwrap(), OP_PUTROOTFH);
        assert_eq!(xdr.u32().unwrap(), NFS4_OK);
        assert_eq!(xdr.u32().unwrap(), OP_READDIR);
        assert_eq!(xdr.u32().unwrap(), NFS4_OK);
        xdr.take(8).unwrap(); // cookie verifier

        let mut names = Vec::new();
        while xdr.u32().unwrap() == 1 {
            let _cookie = xdr.u64().unwrap();
            names.push(xdr.string().unwrap());
            let _bitmap = xdr.bitmap().unwrap();
            let _vals = xdr.opaque().unwrap();
        }
        assert_eq!(xdr.u32().unwrap(), 1); // eof
        assert_eq!(names, vec!["volume".to_string(), "control".to_string()]);

        shutdown.store(true, Ordering::SeqCst);
        drop(client);
        thread.join().unwrap();
    }

    #[test]
    fn bad_auth_flavor_denied() {
        let device = test_shared_device();
        let shutdown = Arc::new(AtomicBool::new(false));
        let (thread, addr) = serve(device, shutdown.clone()).unwrap();
        let mut stream = TcpStream::connect(addr).unwrap();

        let mut msg = XdrOut::default();
        msg.u32(7);
        msg.u32(RPC_CALL);
        msg.u32(RPC_VERSION);
        msg.u32(NFS_PROGRAM);
        msg.u32(NFS_VERSION);
        msg.u32(PROC_NULL);
        msg.u32(6); // RPCSEC_GSS: not offered
        msg.opaque(&[]);
        msg.u32(AUTH_NONE);
        msg.opaque(&[]);
        write_record(&mut stream, &msg.buf).unwrap();
        let reply = read_record(&mut stream).unwrap().unwrap();
        let mut xdr = Xdr::new(&reply);
        assert_eq!(xdr.u32().unwrap(), 7);
        assert_eq!(xdr.u32().unwrap(), 1);
        assert_eq!(xdr.u32().unwrap(), MSG_DENIED);
        assert_eq!(xdr.u32().unwrap(), REJECT_AUTH_ERROR);

        shutdown.store(true, Ordering::SeqCst);
        drop(stream);
        thread.join().unwrap();
    }
}
