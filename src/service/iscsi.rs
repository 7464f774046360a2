//! iSCSI loopback target.
//!
//! Binds 127.0.0.1 at port `3260 + slot - 1` with an IQN derived from the
//! slot, walks the initiator through login into full-feature phase, and
//! answers the small SCSI block-command set a host initiator needs:
//! INQUIRY, TEST UNIT READY, READ CAPACITY(10/16), MODE SENSE(6),
//! READ(10/16), WRITE(10/16), SYNCHRONIZE CACHE and REPORT LUNS. Digests
//! are not negotiated; writes arrive as immediate data or Data-Out PDUs.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};
use crate::service::{BlockDevice, SharedDevice};

const BHS_SIZE: usize = 48;
const MAX_DATA_SEGMENT: usize = 256 * 1024;

// Initiator opcodes.
const OP_NOP_OUT: u8 = 0x00;
const OP_SCSI_COMMAND: u8 = 0x01;
const OP_LOGIN_REQUEST: u8 = 0x03;
const OP_TEXT_REQUEST: u8 = 0x04;
const OP_SCSI_DATA_OUT: u8 = 0x05;
const OP_LOGOUT_REQUEST: u8 = 0x06;

// Target opcodes.
const OP_NOP_IN: u8 = 0x20;
const OP_SCSI_RESPONSE: u8 = 0x21;
const OP_LOGIN_RESPONSE: u8 = 0x23;
const OP_TEXT_RESPONSE: u8 = 0x24;
const OP_SCSI_DATA_IN: u8 = 0x25;
const OP_LOGOUT_RESPONSE: u8 = 0x26;

// SCSI statuses.
const SCSI_GOOD: u8 = 0x00;
const SCSI_CHECK_CONDITION: u8 = 0x02;

/// IQN for a slot, following the usual reversed-domain convention.
pub fn iqn_for_slot(slot: u32) -> String {
    format!("iqn.2024-01.dev.basalt:volume{slot}")
}

/// Loopback port for a slot.
pub fn port_for_slot(slot: u32) -> u16 {
    3260 + (slot.saturating_sub(1) as u16)
}

/// One iSCSI PDU: 48-byte header plus data segment.
struct Pdu {
    bhs: [u8; BHS_SIZE],
    data: Vec<u8>,
}

impl Pdu {
    fn opcode(&self) -> u8 {
        self.bhs[0] & 0x3F
    }

    fn flags(&self) -> u8 {
        self.bhs[1]
    }

    fn itt(&self) -> u32 {
        BigEndian::read_u32(&self.bhs[16..20])
    }

    fn cmd_sn(&self) -> u32 {
        BigEndian::read_u32(&self.bhs[24..28])
    }
}

fn read_pdu(stream: &mut TcpStream) -> std::io::Result<Option<Pdu>> {
    let mut bhs = [0u8; BHS_SIZE];
    match stream.read_exact(&mut bhs) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let ahs_len = bhs[4] as usize * 4;
    let data_len = ((bhs[5] as usize) << 16) | ((bhs[6] as usize) << 8) | bhs[7] as usize;
    if data_len > MAX_DATA_SEGMENT {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "oversized iSCSI data segment",
        ));
    }

    // Additional header segments are not negotiated; drain defensively.
    if ahs_len > 0 {
        let mut skip = vec![0u8; ahs_len];
        stream.read_exact(&mut skip)?;
    }

    let padded = data_len.div_ceil(4) * 4;
    let mut data = vec![0u8; padded];
    stream.read_exact(&mut data)?;
    data.truncate(data_len);
    Ok(Some(Pdu { bhs, data }))
}

fn write_pdu(
    stream: &mut TcpStream,
    opcode: u8,
    flags: u8,
    fill: impl FnOnce(&mut [u8; BHS_SIZE]),
    data: &[u8],
) -> std::io::Result<()> {
    let mut bhs = [0u8; BHS_SIZE];
    bhs[0] = opcode;
    bhs[1] = flags;
    bhs[5] = (data.len() >> 16) as u8;
    bhs[6] = (data.len() >> 8) as u8;
    bhs[7] = data.len() as u8;
    fill(&mut bhs);
    stream.write_all(&bhs)?;
    stream.write_all(data)?;
    let pad = (4 - data.len() % 4) % 4;
    stream.write_all(&[0u8; 4][..pad])?;
    stream.flush()
}

/// Parse the null-separated key=value text of a login/text data segment.
fn parse_text_keys(data: &[u8]) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for pair in data.split(|&b| b == 0) {
        if pair.is_empty() {
            continue;
        }
        if let Ok(text) = std::str::from_utf8(pair) {
            if let Some((key, value)) = text.split_once('=') {
                out.insert(key.to_string(), value.to_string());
            }
        }
    }
    out
}

fn text_keys(pairs: &[(&str, &str)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in pairs {
        out.extend_from_slice(key.as_bytes());
        out.push(b'=');
        out.extend_from_slice(value.as_bytes());
        out.push(0);
    }
    out
}

/// A write command waiting for its Data-Out PDUs.
struct PendingWrite {
    lba_offset: u64,
    expected: usize,
    buffer: Vec<u8>,
}

struct Connection {
    stat_sn: u32,
    exp_cmd_sn: u32,
    logged_in: bool,
    pending_writes: HashMap<u32, PendingWrite>,
}

struct IscsiTarget {
    device: SharedDevice,
    iqn: String,
    addr: SocketAddr,
}

impl IscsiTarget {
    fn block_size(&self) -> u32 {
        let device = self.device.lock().unwrap_or_else(|e| e.into_inner());
        device.sector_size()
    }

    fn block_count(&self) -> u64 {
        let device = self.device.lock().unwrap_or_else(|e| e.into_inner());
        device.size() / device.sector_size() as u64
    }

    fn fill_sn(&self, conn: &Connection, bhs: &mut [u8; BHS_SIZE]) {
        BigEndian::write_u32(&mut bhs[24..28], conn.stat_sn);
        BigEndian::write_u32(&mut bhs[28..32], conn.exp_cmd_sn);
        BigEndian::write_u32(&mut bhs[32..36], conn.exp_cmd_sn.wrapping_add(16));
    }

    fn login(&self, conn: &mut Connection, stream: &mut TcpStream, pdu: &Pdu) -> std::io::Result<()> {
        let keys = parse_text_keys(&pdu.data);
        if let Some(initiator) = keys.get("InitiatorName") {
            log::info!("iSCSI login from {initiator}");
        }

        let transit = pdu.flags() & 0x80 != 0;
        let nsg = pdu.flags() & 0x03;
        let response_keys = text_keys(&[
            ("TargetPortalGroupTag", "1"),
            ("AuthMethod", "None"),
            ("HeaderDigest", "None"),
            ("DataDigest", "None"),
            ("MaxRecvDataSegmentLength", "262144"),
            ("FirstBurstLength", "262144"),
            ("MaxBurstLength", "262144"),
            ("InitialR2T", "Yes"),
            ("ImmediateData", "Yes"),
            ("MaxConnections", "1"),
            ("ErrorRecoveryLevel", "0"),
        ]);

        let mut flags = 0u8;
        if transit {
            flags |= 0x80 | nsg;
            if nsg == 3 {
                conn.logged_in = true;
            }
        }
        conn.exp_cmd_sn = pdu.cmd_sn().wrapping_add(1);
        conn.stat_sn = conn.stat_sn.wrapping_add(1);

        let itt = pdu.itt();
        let stat_sn = conn.stat_sn;
        let exp = conn.exp_cmd_sn;
        // ISID echoes back in bytes 8..14; TSIH gets a fixed non-zero tag.
        let mut isid = [0u8; 6];
        isid.copy_from_slice(&pdu.bhs[8..14]);
        write_pdu(
            stream,
            OP_LOGIN_RESPONSE,
            flags,
            |bhs| {
                bhs[2] = 0x00; // version-max
                bhs[3] = 0x00; // version-active
                bhs[8..14].copy_from_slice(&isid);
                BigEndian::write_u16(&mut bhs[14..16], 1); // TSIH
                BigEndian::write_u32(&mut bhs[16..20], itt);
                BigEndian::write_u32(&mut bhs[24..28], stat_sn);
                BigEndian::write_u32(&mut bhs[28..32], exp);
                BigEndian::write_u32(&mut bhs[32..36], exp.wrapping_add(16));
                // status-class/detail 0/0: success
            },
            &response_keys,
        )
    }

    fn text(&self, conn: &mut Connection, stream: &mut TcpStream, pdu: &Pdu) -> std::io::Result<()> {
        let keys = parse_text_keys(&pdu.data);
        let data = if keys.get("SendTargets").is_some() {
            let address = format!("{},1", self.addr);
            text_keys(&[("TargetName", &self.iqn), ("TargetAddress", &address)])
        } else {
            Vec::new()
        };

        conn.exp_cmd_sn = pdu.cmd_sn().wrapping_add(1);
        conn.stat_sn = conn.stat_sn.wrapping_add(1);
        let itt = pdu.itt();
        let mut sn = [0u8; BHS_SIZE];
        self.fill_sn(conn, &mut sn);
        write_pdu(
            stream,
            OP_TEXT_RESPONSE,
            0x80, // final
            |bhs| {
                BigEndian::write_u32(&mut bhs[16..20], itt);
                BigEndian::write_u32(&mut bhs[20..24], 0xFFFF_FFFF); // TTT
                bhs[24..36].copy_from_slice(&sn[24..36]);
            },
            &data,
        )
    }

    fn scsi_response(
        &self,
        conn: &mut Connection,
        stream: &mut TcpStream,
        itt: u32,
        status: u8,
        sense: Option<&[u8]>,
    ) -> std::io::Result<()> {
        conn.stat_sn = conn.stat_sn.wrapping_add(1);
        let mut data = Vec::new();
        if let Some(sense) = sense {
            data.extend_from_slice(&(sense.len() as u16).to_be_bytes());
            data.extend_from_slice(sense);
        }
        let mut sn = [0u8; BHS_SIZE];
        self.fill_sn(conn, &mut sn);
        write_pdu(
            stream,
            OP_SCSI_RESPONSE,
            0x80,
            |bhs| {
                bhs[2] = 0x00; // response: command completed
                bhs[3] = status;
                BigEndian::write_u32(&mut bhs[16..20], itt);
                bhs[24..36].copy_from_slice(&sn[24..36]);
            },
            &data,
        )
    }

    /// Data-In carrying the whole read result plus status.
    fn data_in(
        &self,
        conn: &mut Connection,
        stream: &mut TcpStream,
        itt: u32,
        payload: &[u8],
    ) -> std::io::Result<()> {
        conn.stat_sn = conn.stat_sn.wrapping_add(1);
        let mut sn = [0u8; BHS_SIZE];
        self.fill_sn(conn, &mut sn);
        write_pdu(
            stream,
            OP_SCSI_DATA_IN,
            0x80 | 0x01, // final + status
            |bhs| {
                bhs[3] = SCSI_GOOD;
                BigEndian::write_u32(&mut bhs[16..20], itt);
                BigEndian::write_u32(&mut bhs[20..24], 0xFFFF_FFFF);
                bhs[24..36].copy_from_slice(&sn[24..36]);
                // DataSN 0, BufferOffset 0, no residual.
            },
            payload,
        )
    }

    fn illegal_request_sense() -> [u8; 18] {
        let mut sense = [0u8; 18];
        sense[0] = 0x70; // current errors, fixed format
        sense[2] = 0x05; // ILLEGAL REQUEST
        sense[7] = 10; // additional length
        sense[12] = 0x20; // INVALID COMMAND OPERATION CODE
        sense
    }

    fn do_write(
        &self,
        conn: &mut Connection,
        stream: &mut TcpStream,
        itt: u32,
        byte_offset: u64,
        data: &[u8],
    ) -> std::io::Result<()> {
        let result = {
            let mut device = self.device.lock().unwrap_or_else(|e| e.into_inner());
            device.write_at(byte_offset, data)
        };
        match result {
            Ok(()) => self.scsi_response(conn, stream, itt, SCSI_GOOD, None),
            Err(err) => {
                log::warn!("iSCSI write failed: {err}");
                let mut sense = Self::illegal_request_sense();
                sense[2] = match err {
                    // DATA PROTECT for the protected/read-only cases.
                    Error::VolumeReadOnly | Error::VolumeProtected => 0x07,
                    _ => 0x03, // MEDIUM ERROR
                };
                self.scsi_response(conn, stream, itt, SCSI_CHECK_CONDITION, Some(&sense))
            }
        }
    }

    fn scsi_command(
        &self,
        conn: &mut Connection,
        stream: &mut TcpStream,
        pdu: &Pdu,
    ) -> std::io::Result<()> {
        conn.exp_cmd_sn = pdu.cmd_sn().wrapping_add(1);
        let itt = pdu.itt();
        let cdb = &pdu.bhs[32..48];
        let block = self.block_size() as u64;

        match cdb[0] {
            // TEST UNIT READY
            0x00 => self.scsi_response(conn, stream, itt, SCSI_GOOD, None),
            // REQUEST SENSE: no pending sense
            0x03 => {
                let mut sense = [0u8; 18];
                sense[0] = 0x70;
                sense[7] = 10;
                let len = (cdb[4] as usize).min(sense.len());
                self.data_in(conn, stream, itt, &sense[..len])
            }
            // INQUIRY
            0x12 => {
                if cdb[1] & 0x01 != 0 {
                    // VPD pages: only the supported-pages page, listing
                    // itself.
                    let page = cdb[2];
                    if page == 0x00 {
                        let data = [0x00u8, 0x00, 0x00, 0x01, 0x00];
                        return self.data_in(conn, stream, itt, &data);
                    }
                    let sense = Self::illegal_request_sense();
                    return self.scsi_response(
                        conn,
                        stream,
                        itt,
                        SCSI_CHECK_CONDITION,
                        Some(&sense),
                    );
                }
                let mut data = [0u8; 36];
                data[0] = 0x00; // direct-access block device
                data[2] = 0x05; // SPC-3
                data[3] = 0x02; // response format
                data[4] = 31; // additional length
                data[8..16].copy_from_slice(b"BASALT  ");
                data[16..32].copy_from_slice(b"VIRTUAL VOLUME  ");
                data[32..36].copy_from_slice(b"0.1 ");
                let len = BigEndian::read_u16(&cdb[3..5]) as usize;
                let n = len.min(data.len());
                self.data_in(conn, stream, itt, &data[..n])
            }
            // MODE SENSE(6): header only, write-protect bit when read-only
            0x1A => {
                let read_only = {
                    let device = self.device.lock().unwrap_or_else(|e| e.into_inner());
                    device.volume().is_read_only()
                };
                let mut data = [0u8; 4];
                data[0] = 3; // mode data length
                data[2] = if read_only { 0x80 } else { 0x00 };
                self.data_in(conn, stream, itt, &data)
            }
            // READ CAPACITY(10)
            0x25 => {
                let blocks = self.block_count();
                let last = blocks.saturating_sub(1);
                let mut data = [0u8; 8];
                BigEndian::write_u32(&mut data[0..4], last.min(u32::MAX as u64) as u32);
                BigEndian::write_u32(&mut data[4..8], block as u32);
                self.data_in(conn, stream, itt, &data)
            }
            // SERVICE ACTION IN: READ CAPACITY(16)
            0x9E if cdb[1] & 0x1F == 0x10 => {
                let mut data = [0u8; 32];
                BigEndian::write_u64(&mut data[0..8], self.block_count().saturating_sub(1));
                BigEndian::write_u32(&mut data[8..12], block as u32);
                self.data_in(conn, stream, itt, &data)
            }
            // READ(10) / READ(16)
            0x28 | 0x88 => {
                let (lba, count) = if cdb[0] == 0x28 {
                    (
                        BigEndian::read_u32(&cdb[2..6]) as u64,
                        BigEndian::read_u16(&cdb[7..9]) as u64,
                    )
                } else {
                    (
                        BigEndian::read_u64(&cdb[2..10]),
                        BigEndian::read_u32(&cdb[10..14]) as u64,
                    )
                };
                let len = (count * block) as usize;
                if len > MAX_DATA_SEGMENT {
                    let sense = Self::illegal_request_sense();
                    return self.scsi_response(
                        conn,
                        stream,
                        itt,
                        SCSI_CHECK_CONDITION,
                        Some(&sense),
                    );
                }
                let mut buf = vec![0u8; len];
                let result = {
                    let mut device = self.device.lock().unwrap_or_else(|e| e.into_inner());
                    device.read_at(lba * block, &mut buf)
                };
                match result {
                    Ok(()) => self.data_in(conn, stream, itt, &buf),
                    Err(err) => {
                        log::warn!("iSCSI read failed: {err}");
                        let mut sense = Self::illegal_request_sense();
                        sense[2] = 0x03; // MEDIUM ERROR
                        self.scsi_response(conn, stream, itt, SCSI_CHECK_CONDITION, Some(&sense))
                    }
                }
            }
            // WRITE(10) / WRITE(16)
            0x2A | 0x8A => {
                let (lba, count) = if cdb[0] == 0x2A {
                    (
                        BigEndian::read_u32(&cdb[2..6]) as u64,
                        BigEndian::read_u16(&cdb[7..9]) as u64,
                    )
                } else {
                    (
                        BigEndian::read_u64(&cdb[2..10]),
                        BigEndian::read_u32(&cdb[10..14]) as u64,
                    )
                };
                let expected = (count * block) as usize;
                let byte_offset = lba * block;

                if pdu.data.len() >= expected {
                    // Whole payload arrived as immediate data.
                    self.do_write(conn, stream, itt, byte_offset, &pdu.data[..expected])
                } else {
                    // The rest follows in Data-Out PDUs keyed by ITT.
                    let mut pending = PendingWrite {
                        lba_offset: byte_offset,
                        expected,
                        buffer: Vec::with_capacity(expected),
                    };
                    pending.buffer.extend_from_slice(&pdu.data);
                    conn.pending_writes.insert(itt, pending);
                    Ok(())
                }
            }
            // SYNCHRONIZE CACHE(10)
            0x35 => {
                let result = {
                    let mut device = self.device.lock().unwrap_or_else(|e| e.into_inner());
                    device.flush()
                };
                match result {
                    Ok(()) => self.scsi_response(conn, stream, itt, SCSI_GOOD, None),
                    Err(_) => {
                        let sense = Self::illegal_request_sense();
                        self.scsi_response(conn, stream, itt, SCSI_CHECK_CONDITION, Some(&sense))
                    }
                }
            }
            // REPORT LUNS
            0xA0 => {
                let mut data = [0u8; 16];
                BigEndian::write_u32(&mut data[0..4], 8); // one LUN entry
                self.data_in(conn, stream, itt, &data)
            }
            other => {
                log::debug!("unsupported SCSI opcode {other:#x}");
                let sense = Self::illegal_request_sense();
                self.scsi_response(conn, stream, itt, SCSI_CHECK_CONDITION, Some(&sense))
            }
        }
    }

    fn data_out(
        &self,
        conn: &mut Connection,
        stream: &mut TcpStream,
        pdu: &Pdu,
    ) -> std::io::Result<()> {
        let itt = pdu.itt();
        let Some(mut pending) = conn.pending_writes.remove(&itt) else {
            log::warn!("Data-Out for unknown task {itt}");
            return Ok(());
        };
        let offset = BigEndian::read_u32(&pdu.bhs[40..44]) as usize;
        if pending.buffer.len() != offset {
            log::warn!("out-of-order Data-Out for task {itt}");
        }
        pending.buffer.extend_from_slice(&pdu.data);

        if pending.buffer.len() >= pending.expected {
            let data = std::mem::take(&mut pending.buffer);
            self.do_write(conn, stream, itt, pending.lba_offset, &data[..pending.expected])
        } else {
            conn.pending_writes.insert(itt, pending);
            Ok(())
        }
    }

    fn serve_connection(&self, stream: &mut TcpStream, shutdown: &AtomicBool) {
        stream
            .set_read_timeout(Some(Duration::from_millis(200)))
            .ok();
        let mut conn = Connection {
            stat_sn: 0,
            exp_cmd_sn: 1,
            logged_in: false,
            pending_writes: HashMap::new(),
        };

        while !shutdown.load(Ordering::SeqCst) {
            let pdu = match read_pdu(stream) {
                Ok(Some(pdu)) => pdu,
                Ok(None) => return,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue
                }
                Err(_) => return,
            };

            let outcome = match pdu.opcode() {
                OP_LOGIN_REQUEST => self.login(&mut conn, stream, &pdu),
                OP_TEXT_REQUEST => self.text(&mut conn, stream, &pdu),
                OP_NOP_OUT => {
                    conn.exp_cmd_sn = pdu.cmd_sn().wrapping_add(1);
                    conn.stat_sn = conn.stat_sn.wrapping_add(1);
                    let itt = pdu.itt();
                    let mut sn = [0u8; BHS_SIZE];
                    self.fill_sn(&conn, &mut sn);
                    let echo = pdu.data.clone();
                    write_pdu(
                        stream,
                        OP_NOP_IN,
                        0x80,
                        |bhs| {
                            BigEndian::write_u32(&mut bhs[16..20], itt);
                            BigEndian::write_u32(&mut bhs[20..24], 0xFFFF_FFFF);
                            bhs[24..36].copy_from_slice(&sn[24..36]);
                        },
                        &echo,
                    )
                }
                OP_SCSI_COMMAND if conn.logged_in => self.scsi_command(&mut conn, stream, &pdu),
                OP_SCSI_DATA_OUT if conn.logged_in => self.data_out(&mut conn, stream, &pdu),
                OP_LOGOUT_REQUEST => {
                    conn.exp_cmd_sn = pdu.cmd_sn().wrapping_add(1);
                    conn.stat_sn = conn.stat_sn.wrapping_add(1);
                    let itt = pdu.itt();
                    let mut sn = [0u8; BHS_SIZE];
                    self.fill_sn(&conn, &mut sn);
                    let _ = write_pdu(
                        stream,
                        OP_LOGOUT_RESPONSE,
                        0x80,
                        |bhs| {
                            BigEndian::write_u32(&mut bhs[16..20], itt);
                            bhs[24..36].copy_from_slice(&sn[24..36]);
                        },
                        &[],
                    );
                    return;
                }
                other => {
                    log::warn!("unexpected iSCSI opcode {other:#x}");
                    return;
                }
            };
            if outcome.is_err() {
                return;
            }
        }
    }
}

/// Start the iSCSI target event loop for one device.
pub fn serve(
    device: SharedDevice,
    slot: u32,
    shutdown: Arc<AtomicBool>,
) -> Result<(JoinHandle<()>, SocketAddr, String)> {
    let port = port_for_slot(slot);
    let listener = TcpListener::bind(("127.0.0.1", port))
        .map_err(|e| Error::system(e, format!("iSCSI listener on port {port}")))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| Error::system(e, "iSCSI listener"))?;
    let addr = listener
        .local_addr()
        .map_err(|e| Error::system(e, "iSCSI listener"))?;
    let iqn = iqn_for_slot(slot);

    let target_iqn = iqn.clone();
    let thread = std::thread::Builder::new()
        .name("basalt-iscsi".to_string())
        .spawn(move || {
            let target = IscsiTarget {
                device,
                iqn: target_iqn,
                addr,
            };
            log::info!("iSCSI target {} listening on {}", target.iqn, addr);
            while !shutdown.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((mut stream, peer)) => {
                        log::debug!("iSCSI initiator connected from {peer}");
                        stream.set_nonblocking(false).ok();
                        target.serve_connection(&mut stream, &shutdown);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(50));
                    }
                    Err(e) => {
                        log::warn!("iSCSI accept failed: {e}");
                        break;
                    }
                }
            }
            log::debug!("iSCSI event loop stopped");
        })
        .map_err(|e| Error::system(e, "iSCSI thread"))?;

    Ok((thread, addr, iqn))
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
        let path = dir.path().join("iscsi.bslt");
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

    fn send_pdu(
        stream: &mut TcpStream,
        opcode: u8,
        flags: u8,
        fill: impl FnOnce(&mut [u8; BHS_SIZE]),
        data: &[u8],
    ) {
        write_pdu(stream, opcode, flags, fill, data).unwrap();
    }

    fn recv_pdu(stream: &mut TcpStream) -> Pdu {
        read_pdu(stream).unwrap().unwrap()
    }

    fn login(stream: &mut TcpStream) {
        let keys = text_keys(&[
            ("InitiatorName", "iqn.2024-01.dev.test:initiator"),
            ("TargetName", "iqn.2024-01.dev.basalt:volume1"),
            ("SessionType", "Normal"),
            ("AuthMethod", "None"),
        ]);
        // Transit to full-feature phase: CSG=1, NSG=3.
        send_pdu(
            stream,
            OP_LOGIN_REQUEST | 0x40, // immediate
            0x80 | 0x04 | 0x03,
            |bhs| {
                bhs[8..14].copy_from_slice(&[0x80, 0, 0, 0x02, 0xab, 0xcd]);
                BigEndian::write_u32(&mut bhs[16..20], 1);
                BigEndian::write_u32(&mut bhs[24..28], 1); // CmdSN
            },
            &keys,
        );
        let reply = recv_pdu(stream);
        assert_eq!(reply.opcode(), OP_LOGIN_RESPONSE);
        assert_eq!(reply.bhs[36], 0, "login status-class");
        assert!(reply.flags() & 0x80 != 0, "transit bit echoed");
    }

    fn scsi(stream: &mut TcpStream, itt: u32, cmd_sn: u32, flags: u8, cdb: &[u8], data: &[u8]) {
        send_pdu(
            stream,
            OP_SCSI_COMMAND,
            0x80 | flags,
            |bhs| {
                BigEndian::write_u32(&mut bhs[16..20], itt);
                BigEndian::write_u32(
                    &mut bhs[20..24],
                    data.len().max(cdb_transfer_len(cdb)) as u32,
                );
                BigEndian::write_u32(&mut bhs[24..28], cmd_sn);
                bhs[32..32 + cdb.len()].copy_from_slice(cdb);
            },
            data,
        );
    }

    fn cdb_transfer_len(cdb: &[u8]) -> usize {
        match cdb[0] {
            0x28 | 0x2A => BigEndian::read_u16(&cdb[7..9]) as usize * 512,
            0x25 => 8,
            0x12 => BigEndian::read_u16(&cdb[3..5]) as usize,
            _ => 0,
        }
    }

    #[test]
    fn login_inquiry_capacity_read_write() {
        let device = test_shared_device();
        let shutdown = Arc::new(AtomicBool::new(false));
        // Slot 200 keeps the fixed port clear of other test runs.
        let (thread, addr, iqn) = serve(device, 200, shutdown.clone()).unwrap();
        assert_eq!(iqn, "iqn.2024-01.dev.basalt:volume200");
        assert_eq!(addr.port(), 3260 + 199);

        let mut stream = TcpStream::connect(addr).unwrap();
        login(&mut stream);

        // INQUIRY.
        let mut cdb = [0u8; 16];
        cdb[0] = 0x12;
        BigEndian::write_u16(&mut cdb[3..5], 36);
        scsi(&mut stream, 2, 2, 0x40, &cdb, &[]);
        let reply = recv_pdu(&mut stream);
        assert_eq!(reply.opcode(), OP_SCSI_DATA_IN);
        assert_eq!(&reply.data[8..14], b"BASALT");

        // READ CAPACITY(10): 1 MiB volume minus two header groups.
        let mut cdb = [0u8; 16];
        cdb[0] = 0x25;
        scsi(&mut stream, 3, 3, 0x40, &cdb, &[]);
        let reply = recv_pdu(&mut stream);
        assert_eq!(reply.opcode(), OP_SCSI_DATA_IN);
        let last_lba = BigEndian::read_u32(&reply.data[0..4]) as u64;
        let block = BigEndian::read_u32(&reply.data[4..8]);
        assert_eq!(block, 512);
        let expected_blocks = (1024 * 1024 - 2 * 131_072) / 512;
        assert_eq!(last_lba, expected_blocks - 1);

        // WRITE(10) one block of immediate data at LBA 4.
        let payload = [0xA5u8; 512];
        let mut cdb = [0u8; 16];
        cdb[0] = 0x2A;
        BigEndian::write_u32(&mut cdb[2..6], 4);
        BigEndian::write_u16(&mut cdb[7..9], 1);
        scsi(&mut stream, 4, 4, 0x20, &cdb, &payload);
        let reply = recv_pdu(&mut stream);
        assert_eq!(reply.opcode(), OP_SCSI_RESPONSE);
        assert_eq!(reply.bhs[3], SCSI_GOOD);

        // READ(10) the same block back.
        let mut cdb = [0u8; 16];
        cdb[0] = 0x28;
        BigEndian::write_u32(&mut cdb[2..6], 4);
        BigEndian::write_u16(&mut cdb[7..9], 1);
        scsi(&mut stream, 5, 5, 0x40, &cdb, &[]);
        let reply = recv_pdu(&mut stream);
        assert_eq!(reply.opcode(), OP_SCSI_DATA_IN);
        assert_eq!(reply.data, payload);

        // Logout.
        send_pdu(
            &mut stream,
            OP_LOGOUT_REQUEST | 0x40,
            0x80,
            |bhs| {
                BigEndian::write_u32(&mut bhs[16..20], 6);
                BigEndian::write_u32(&mut bhs[24..28], 6);
            },
            &[],
        );
        let reply = recv_pdu(&mut stream);
        assert_eq!(reply.opcode(), OP_LOGOUT_RESPONSE);

        shutdown.store(true, Ordering::SeqCst);
        drop(stream);
        thread.join().unwrap();
    }

    #[test]
    fn unsupported_scsi_opcode_gets_check_condition() {
        let device = test_shared_device();
        let shutdown = Arc::new(AtomicBool::new(false));
        let (thread, addr, _iqn) = serve(device, 210, shutdown.clone()).unwrap();
        let mut stream = TcpStream::connect(addr).unwrap();
        login(&mut stream);

        let mut cdb = [0u8; 16];
        cdb[0] = 0x42; // UNMAP: not in our command set
        scsi(&mut stream, 2, 2, 0, &cdb, &[]);
        let reply = recv_pdu(&mut stream);
        assert_eq!(reply.opcode(), OP_SCSI_RESPONSE);
        assert_eq!(reply.bhs[3], SCSI_CHECK_CONDITION);
        // Sense data: ILLEGAL REQUEST.
        assert_eq!(reply.data[2 + 2] & 0x0F, 0x05);

        shutdown.store(true, Ordering::SeqCst);
        drop(stream);
        thread.join().unwrap();
    }
}
