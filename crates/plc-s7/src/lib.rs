//! S7comm protocol emulator: TPKT + COTP connection setup, then S7 PDU
//! dispatch (Setup Communication, Read/Write Variable, Read SZL via
//! UserData).
//!
//! As in [`plc_modbus`](../plc_modbus/index.html), the wire-framing and
//! PDU-building logic is kept as pure functions so it can be unit tested
//! without a socket; [`serve`] supplies the async connection loop around
//! it.

use plc_memory::{DeviceImage, S7Area};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// How long a connection may sit idle before the handler closes it.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Emulated PLC family, each with its own valid TSAP slot set and max-PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S7Model {
    /// S7-300 family.
    S7_300,
    /// S7-1200 family.
    S7_1200,
    /// S7-1500 family.
    S7_1500,
}

/// Static per-model identity returned inside SZL responses.
#[derive(Debug, Clone, Copy)]
pub struct ModelProfile {
    /// CPU order code, e.g. "6ES7 315-2AH14-0AB0".
    pub order_code: &'static str,
    /// Module name, e.g. "CPU 315-2 PN/DP".
    pub module_name: &'static str,
    /// Negotiated max PDU size in Setup Communication.
    pub max_pdu: u16,
    /// System name reported in SZL 0x001C.
    pub system_name: &'static str,
    /// Serial number reported in SZL 0x001C and 0x0011.
    pub serial_number: &'static str,
    /// Plant identifier reported in SZL 0x001C.
    pub plant_id: &'static str,
    /// OEM identifier reported in SZL 0x001C.
    pub oem_id: &'static str,
    /// Physical location string reported in SZL 0x001C.
    pub location: &'static str,
    /// TSAP slot values this model will accept a connection request on.
    pub valid_slots: &'static [u8],
}

impl S7Model {
    /// Look up this model's static identity.
    #[must_use]
    pub fn profile(self) -> ModelProfile {
        match self {
            Self::S7_300 => ModelProfile {
                order_code: "6ES7 315-2AH14-0AB0",
                module_name: "CPU 315-2 PN/DP",
                max_pdu: 240,
                system_name: "S7-300 Station",
                serial_number: "S C-X9K282922019",
                plant_id: "",
                oem_id: "",
                location: "",
                valid_slots: &[2],
            },
            Self::S7_1200 => ModelProfile {
                order_code: "6ES7 212-1AE40-0XB0",
                module_name: "CPU 1212C",
                max_pdu: 480,
                system_name: "S7-1200 Station",
                serial_number: "S C-C2UC38922019",
                plant_id: "",
                oem_id: "",
                location: "",
                valid_slots: &[1],
            },
            Self::S7_1500 => ModelProfile {
                order_code: "6ES7 515-2AM01-0AB0",
                module_name: "CPU 1515-2 PN",
                max_pdu: 960,
                system_name: "S7-1500 Station",
                serial_number: "S C-T9S282922019",
                plant_id: "",
                oem_id: "",
                location: "",
                valid_slots: &[1],
            },
        }
    }
}

impl std::str::FromStr for S7Model {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "S7-300" | "s7-300" => Ok(Self::S7_300),
            "S7-1200" | "s7-1200" => Ok(Self::S7_1200),
            "S7-1500" | "s7-1500" => Ok(Self::S7_1500),
            other => Err(format!("unknown S7 model: {other}")),
        }
    }
}

// --- TPKT -------------------------------------------------------------

/// Parse a TPKT header; returns the declared total length and the bytes
/// following the 4-byte header (truncated to `total_length - 4` if the
/// caller handed us more than one frame's worth).
fn tpkt_parse(bytes: &[u8]) -> Option<&[u8]> {
    if bytes.len() < 4 || bytes[0] != 0x03 {
        return None;
    }
    let total_length = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
    if bytes.len() < total_length || total_length < 4 {
        return None;
    }
    Some(&bytes[4..total_length])
}

fn tpkt_wrap(cotp_and_payload: Vec<u8>) -> Vec<u8> {
    let total_length = (4 + cotp_and_payload.len()) as u16;
    let mut out = vec![0x03, 0x00];
    out.extend_from_slice(&total_length.to_be_bytes());
    out.extend_from_slice(&cotp_and_payload);
    out
}

// --- COTP ---------------------------------------------------------------

const COTP_CR: u8 = 0xE0;
const COTP_CC: u8 = 0xD0;
const COTP_DR: u8 = 0x80;
const COTP_DT: u8 = 0xF0;

/// A parsed COTP Connect Request.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Destination reference (assigned by the requester, usually 0).
    pub dst_ref: u16,
    /// Source reference, echoed back by the server on CC/DR.
    pub src_ref: u16,
    /// Requested TSAP slot, decoded from the Called-TSAP parameter.
    pub requested_slot: Option<u8>,
    /// Raw value of the Calling-TSAP parameter (code `0xC1`), for logging.
    pub src_tsap: Option<Vec<u8>>,
    /// Raw value of the Called-TSAP parameter (code `0xC2`), for logging.
    pub dst_tsap: Option<Vec<u8>>,
}

fn cotp_parse_cr(body: &[u8]) -> Option<ConnectRequest> {
    if body.len() < 6 || body[0] != COTP_CR {
        return None;
    }
    let dst_ref = u16::from_be_bytes([body[1], body[2]]);
    let src_ref = u16::from_be_bytes([body[3], body[4]]);
    let mut requested_slot = None;
    let mut src_tsap = None;
    let mut dst_tsap = None;
    let mut cursor = 6;
    while cursor + 2 <= body.len() {
        let code = body[cursor];
        let len = body[cursor + 1] as usize;
        let value_start = cursor + 2;
        if value_start + len > body.len() {
            break;
        }
        let value = &body[value_start..value_start + len];
        if code == 0xC1 {
            src_tsap = Some(value.to_vec());
        } else if code == 0xC2 {
            dst_tsap = Some(value.to_vec());
            if len == 2 {
                requested_slot = Some(value[1] & 0x1F);
            }
        }
        cursor = value_start + len;
    }
    Some(ConnectRequest { dst_ref, src_ref, requested_slot, src_tsap, dst_tsap })
}

fn cotp_build_cc(cr: &ConnectRequest) -> Vec<u8> {
    let mut body = vec![COTP_CC];
    body.extend_from_slice(&cr.src_ref.to_be_bytes());
    body.extend_from_slice(&cr.dst_ref.to_be_bytes());
    body.push(0x00);
    let mut out = vec![body.len() as u8];
    out.extend(body);
    out
}

fn cotp_build_dr(cr: &ConnectRequest, reason: u8) -> Vec<u8> {
    let mut body = vec![COTP_DR];
    body.extend_from_slice(&cr.src_ref.to_be_bytes());
    body.extend_from_slice(&0u16.to_be_bytes());
    body.push(reason);
    let mut out = vec![body.len() as u8];
    out.extend(body);
    out
}

fn cotp_build_dt(payload: Vec<u8>) -> Vec<u8> {
    let mut out = vec![2u8, COTP_DT, 0x80];
    out.extend(payload);
    out
}

/// Parse a COTP DT (Data) header, returning the S7 PDU bytes that follow.
fn cotp_parse_dt(body: &[u8]) -> Option<&[u8]> {
    if body.len() < 3 || body[1] != COTP_DT {
        return None;
    }
    let header_len = body[0] as usize;
    Some(&body[1 + header_len..])
}

// --- S7 PDU header --------------------------------------------------------

/// ROSCTR (Region Of Service / PDU kind) values.
pub mod rosctr {
    /// Request from the client.
    pub const JOB: u8 = 1;
    /// Successful response.
    pub const ACK_DATA: u8 = 3;
    /// Vendor-specific out-of-band traffic (used for Read SZL).
    pub const USER_DATA: u8 = 7;
}

#[derive(Debug, Clone, Copy)]
struct S7Header {
    rosctr: u8,
    pdu_reference: u16,
}

fn s7_parse_header(bytes: &[u8]) -> Option<(S7Header, usize, usize, usize)> {
    if bytes.len() < 10 || bytes[0] != 0x32 {
        return None;
    }
    let rosctr = bytes[1];
    let pdu_reference = u16::from_be_bytes([bytes[4], bytes[5]]);
    let param_length = u16::from_be_bytes([bytes[6], bytes[7]]) as usize;
    let data_length = u16::from_be_bytes([bytes[8], bytes[9]]) as usize;
    let header_len = if rosctr == rosctr::ACK_DATA { 12 } else { 10 };
    Some((S7Header { rosctr, pdu_reference }, header_len, param_length, data_length))
}

fn s7_build_ack_data(pdu_reference: u16, param: Vec<u8>, data: Vec<u8>) -> Vec<u8> {
    let mut out = vec![0x32, rosctr::ACK_DATA];
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&pdu_reference.to_be_bytes());
    out.extend_from_slice(&(param.len() as u16).to_be_bytes());
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.push(0x00);
    out.push(0x00);
    out.extend(param);
    out.extend(data);
    out
}

fn s7_build_error(pdu_reference: u16, rosctr_value: u8, error_class: u8, error_code: u8) -> Vec<u8> {
    let mut out = vec![0x32, rosctr_value];
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&pdu_reference.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.push(error_class);
    out.push(error_code);
    out
}

fn s7_build_userdata(pdu_reference: u16, param: Vec<u8>, data: Vec<u8>) -> Vec<u8> {
    let mut out = vec![0x32, rosctr::USER_DATA];
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&pdu_reference.to_be_bytes());
    out.extend_from_slice(&(param.len() as u16).to_be_bytes());
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.extend(param);
    out.extend(data);
    out
}

// --- Read/Write Variable item addressing ----------------------------------

const AREA_INPUT: u8 = 0x81;
const AREA_OUTPUT: u8 = 0x82;
const AREA_MERKER: u8 = 0x83;
const AREA_DB: u8 = 0x84;

fn s7_area_of(byte: u8) -> Option<S7Area> {
    match byte {
        AREA_INPUT => Some(S7Area::I),
        AREA_OUTPUT => Some(S7Area::Q),
        AREA_MERKER => Some(S7Area::M),
        AREA_DB => Some(S7Area::Db),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
struct ReadWriteItem {
    transport_type: u8,
    length: u16,
    db_num: u16,
    area: S7Area,
    byte_offset: u16,
}

fn parse_item(bytes: &[u8]) -> Option<ReadWriteItem> {
    if bytes.len() < 12 || bytes[0] != 0x12 || bytes[1] != 0x0A {
        return None;
    }
    let transport_type = bytes[3];
    let length = u16::from_be_bytes([bytes[4], bytes[5]]);
    let db_num = u16::from_be_bytes([bytes[6], bytes[7]]);
    let area = s7_area_of(bytes[8])?;
    let addr = u32::from_be_bytes([0, bytes[9], bytes[10], bytes[11]]);
    let byte_offset = (addr >> 3) as u16;
    Some(ReadWriteItem { transport_type, length, db_num, area, byte_offset })
}

fn byte_length(item: &ReadWriteItem) -> u16 {
    match item.transport_type {
        0x01 => item.length.div_ceil(8),
        0x02 => item.length,
        0x04 => item.length * 2,
        _ => item.length,
    }
}

fn resp_transport(transport_type: u8) -> u8 {
    if transport_type == 0x01 {
        0x03
    } else {
        0x04
    }
}

/// Outcome of handling one S7 PDU, for the interaction logger.
#[derive(Debug, Clone, Default)]
pub struct LogMetadata {
    /// Function code of a Job PDU (0xF0 setup, 0x04 read, 0x05 write), if any.
    pub function_code: Option<u8>,
    /// ROSCTR of the handled PDU.
    pub rosctr: u8,
    /// S7 memory area touched, as its raw wire byte, if any.
    pub area: Option<u8>,
    /// DB number touched, if any.
    pub db_number: Option<u16>,
    /// Byte offset touched, if any.
    pub address: Option<u16>,
    /// Raw write payload, hex-ready.
    pub write_data: Option<Vec<u8>>,
    /// SZL ID requested, if this was a Read SZL.
    pub szl_id: Option<u16>,
    /// SZL index requested, if this was a Read SZL.
    pub szl_index: Option<u16>,
    /// Declared TPKT length of the request frame this record was logged for.
    pub tpkt_len: Option<u16>,
    /// S7 protocol id byte (always `0x32`), set once a PDU header parses.
    pub proto_id: Option<u8>,
    /// Human-readable label for `rosctr` ("Job", "Ack_Data", "UserData", ...).
    pub pdu_type: Option<&'static str>,
    /// Non-PDU connection event, e.g. `"reject_connection"` on a slot-mismatch CR.
    pub action: Option<&'static str>,
    /// Raw Calling-TSAP (source) value from a Connect Request, hex-ready.
    pub cotp_src_tsap: Option<Vec<u8>>,
    /// Raw Called-TSAP (destination) value from a Connect Request, hex-ready.
    pub cotp_dst_tsap: Option<Vec<u8>>,
}

/// Wire byte of the S7 protocol id field, constant across all PDUs.
const PROTO_ID_S7: u8 = 0x32;

/// Human-readable label matching the ROSCTR values `handle_pdu` produces.
fn rosctr_label(rosctr: u8) -> &'static str {
    match rosctr {
        rosctr::JOB => "Job",
        2 => "Ack",
        rosctr::ACK_DATA => "Ack_Data",
        rosctr::USER_DATA => "UserData",
        _ => "Unknown",
    }
}

/// Handle one S7 PDU (the bytes following the COTP DT header) against a
/// device's memory image. Returns the S7 PDU response bytes (still
/// needing a COTP DT + TPKT wrap) and log metadata.
#[must_use]
pub fn handle_pdu(pdu: &[u8], image: &Mutex<DeviceImage>, model: S7Model) -> Option<(Vec<u8>, LogMetadata)> {
    let (header, header_len, param_length, _data_length) = s7_parse_header(pdu)?;
    if pdu.len() < header_len + param_length {
        return None;
    }
    let param = &pdu[header_len..header_len + param_length];
    let data = &pdu[header_len + param_length..];

    match header.rosctr {
        rosctr::JOB if param.first() == Some(&0xF0) => {
            let max_pdu = model.profile().max_pdu;
            let mut response_param = vec![0xF0, 0x00];
            response_param.extend_from_slice(&1u16.to_be_bytes());
            response_param.extend_from_slice(&1u16.to_be_bytes());
            response_param.extend_from_slice(&max_pdu.to_be_bytes());
            Some((
                s7_build_ack_data(header.pdu_reference, response_param, Vec::new()),
                LogMetadata { function_code: Some(0xF0), rosctr: rosctr::ACK_DATA, ..Default::default() },
            ))
        }
        rosctr::JOB if param.first() == Some(&0x04) => {
            let item_count = *param.get(1)? as usize;
            let mut image = image.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let mut response_data = Vec::new();
            let mut last_meta = LogMetadata { function_code: Some(0x04), rosctr: rosctr::ACK_DATA, ..Default::default() };
            for i in 0..item_count {
                let item_bytes = param.get(2 + i * 12..2 + (i + 1) * 12)?;
                let item = parse_item(item_bytes)?;
                let len = byte_length(&item);
                let bytes = image.s7_read(item.area, item.db_num, item.byte_offset, len);
                response_data.push(0xFF);
                response_data.push(resp_transport(item.transport_type));
                response_data.extend_from_slice(&(len * 8).to_be_bytes());
                response_data.extend_from_slice(&bytes);
                last_meta.area = Some(wire_area_byte(item.area));
                last_meta.db_number = Some(item.db_num);
                last_meta.address = Some(item.byte_offset);
            }
            let mut response_param = vec![0x04];
            response_param.push(item_count as u8);
            Some((s7_build_ack_data(header.pdu_reference, response_param, response_data), last_meta))
        }
        rosctr::JOB if param.first() == Some(&0x05) => {
            let item_count = *param.get(1)? as usize;
            let mut image = image.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let mut cursor = 0usize;
            let mut last_meta = LogMetadata { function_code: Some(0x05), rosctr: rosctr::ACK_DATA, ..Default::default() };
            let mut write_data_log = Vec::new();
            for i in 0..item_count {
                let item_bytes = param.get(2 + i * 12..2 + (i + 1) * 12)?;
                let item = parse_item(item_bytes)?;
                if data.len() < cursor + 4 {
                    break;
                }
                let length_bits = u16::from_be_bytes([data[cursor + 2], data[cursor + 3]]);
                let byte_len = if item.transport_type == 0x01 {
                    (length_bits as usize).div_ceil(8)
                } else {
                    length_bits as usize / 8
                };
                let value_start = cursor + 4;
                let value_end = (value_start + byte_len).min(data.len());
                let bytes = &data[value_start..value_end];
                image.s7_write(item.area, item.db_num, item.byte_offset, bytes);
                write_data_log.extend_from_slice(bytes);
                last_meta.area = Some(wire_area_byte(item.area));
                last_meta.db_number = Some(item.db_num);
                last_meta.address = Some(item.byte_offset);
                cursor = value_end;
                // Items are word-aligned on the wire.
                if cursor % 2 != 0 {
                    cursor += 1;
                }
            }
            last_meta.write_data = Some(write_data_log);
            let response_data = vec![0xFFu8; item_count];
            let mut response_param = vec![0x05];
            response_param.push(item_count as u8);
            Some((s7_build_ack_data(header.pdu_reference, response_param, response_data), last_meta))
        }
        rosctr::USER_DATA => handle_read_szl(header.pdu_reference, data, model),
        _ => Some((
            s7_build_error(header.pdu_reference, rosctr::ACK_DATA, 0x81, 0x04),
            LogMetadata { rosctr: rosctr::ACK_DATA, ..Default::default() },
        )),
    }
}

fn wire_area_byte(area: S7Area) -> u8 {
    match area {
        S7Area::I => AREA_INPUT,
        S7Area::Q => AREA_OUTPUT,
        S7Area::M => AREA_MERKER,
        S7Area::Db => AREA_DB,
    }
}

fn pad32(s: &str) -> Vec<u8> {
    let mut out = s.as_bytes().to_vec();
    out.resize(32, 0);
    out
}

fn handle_read_szl(pdu_reference: u16, data: &[u8], model: S7Model) -> Option<(Vec<u8>, LogMetadata)> {
    if data.len() < 8 {
        return None;
    }
    let szl_id = u16::from_be_bytes([data[4], data[5]]);
    let szl_index = u16::from_be_bytes([data[6], data[7]]);
    let profile = model.profile();

    let entries: Option<(u16, Vec<u8>)> = match szl_id {
        0x0011 => {
            let mut entry = Vec::new();
            entry.extend_from_slice(&0u16.to_be_bytes());
            let mut article_no = profile.order_code.as_bytes().to_vec();
            article_no.resize(20, 0);
            entry.extend(article_no);
            entry.extend_from_slice(&[0, 0]);
            entry.extend_from_slice(&[0, 0]);
            entry.extend_from_slice(&[0, 0]);
            Some((28, entry))
        }
        0x001C => {
            let fields = [
                profile.system_name,
                profile.module_name,
                profile.plant_id,
                "Original MC 575",
                profile.serial_number,
                profile.module_name,
                profile.oem_id,
                profile.location,
            ];
            let mut entries = Vec::new();
            for (i, field) in fields.iter().enumerate() {
                entries.extend_from_slice(&(i as u16).to_be_bytes());
                entries.extend(pad32(field));
            }
            Some((34, entries))
        }
        0x0131 => {
            let mut entry = Vec::new();
            entry.extend_from_slice(&0u16.to_be_bytes());
            entry.extend_from_slice(&profile.max_pdu.to_be_bytes());
            entry.extend_from_slice(&32u16.to_be_bytes());
            entry.extend_from_slice(&[0u8; 16]);
            Some((22, entry))
        }
        _ => None,
    };

    let metadata = LogMetadata {
        rosctr: rosctr::USER_DATA,
        szl_id: Some(szl_id),
        szl_index: Some(szl_index),
        ..Default::default()
    };

    match entries {
        Some((entry_size, entries)) => {
            let entry_count = (entries.len() / entry_size as usize) as u16;
            let mut response_data = vec![0xFF, 0x09];
            let total_length = 4 + entries.len();
            response_data.extend_from_slice(&(total_length as u16).to_be_bytes());
            response_data.extend_from_slice(&entry_size.to_be_bytes());
            response_data.extend_from_slice(&entry_count.to_be_bytes());
            response_data.extend(entries);
            let response_param = vec![0x00, 0x01, 0x00, 0x04, 0x01, 0x00, 0x00, 0x00];
            Some((s7_build_userdata(pdu_reference, response_param, response_data), metadata))
        }
        None => Some((s7_build_error(pdu_reference, rosctr::ACK_DATA, 0x81, 0x04), metadata)),
    }
}

/// Sink for per-PDU interaction log records.
pub trait S7LogSink: Send + Sync {
    /// Record one handled PDU (including CR/CC/DR framing events), with
    /// both raw TPKT frames.
    fn log(&self, peer: SocketAddr, raw_request: &[u8], raw_response: &[u8], metadata: &LogMetadata);
}

/// Resolves a device by whatever key the deployment uses (S7 has no
/// Unit-ID-style multiplexing; a listener typically serves one device).
pub trait S7DeviceMap: Send + Sync {
    /// Fetch the single device and model this listener emulates.
    fn device(&self) -> (Arc<Mutex<DeviceImage>>, S7Model);
}

/// A fixed single-device map, the common case: one S7 listener per device.
pub struct SingleDevice {
    image: Arc<Mutex<DeviceImage>>,
    model: S7Model,
}

impl SingleDevice {
    /// Wrap a device image and model as an [`S7DeviceMap`].
    #[must_use]
    pub fn new(image: Arc<Mutex<DeviceImage>>, model: S7Model) -> Self {
        Self { image, model }
    }
}

impl S7DeviceMap for SingleDevice {
    fn device(&self) -> (Arc<Mutex<DeviceImage>>, S7Model) {
        (Arc::clone(&self.image), self.model)
    }
}

/// Run the S7comm accept loop until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    devices: Arc<dyn S7DeviceMap>,
    logger: Arc<dyn S7LogSink>,
    cancel: CancellationToken,
) -> io::Result<()> {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let devices = Arc::clone(&devices);
                let logger = Arc::clone(&logger);
                let cancel = cancel.child_token();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, peer, devices, logger, cancel).await {
                        tracing::debug!(%peer, %err, "s7 connection ended");
                    }
                });
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    devices: Arc<dyn S7DeviceMap>,
    logger: Arc<dyn S7LogSink>,
    cancel: CancellationToken,
) -> io::Result<()> {
    let (image, model) = devices.device();
    let mut buf = vec![0u8; 8192];
    let mut connected_cr: Option<ConnectRequest> = None;

    loop {
        let read = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            result = tokio::time::timeout(INACTIVITY_TIMEOUT, stream.read(&mut buf)) => result,
        };
        let n = match read {
            Ok(Ok(0)) => return Ok(()),
            Ok(Ok(n)) => n,
            Ok(Err(err)) => return Err(err),
            Err(_) => return Ok(()),
        };
        let request = buf[..n].to_vec();
        let Some(cotp_body) = tpkt_parse(&request) else {
            continue;
        };

        let tpkt_len = Some(u16::from_be_bytes([request[2], request[3]]));

        if connected_cr.is_none() {
            let Some(cr) = cotp_parse_cr(cotp_body) else {
                continue;
            };
            let slot_ok = cr
                .requested_slot
                .is_some_and(|slot| model.profile().valid_slots.contains(&slot));
            let cr_metadata = LogMetadata {
                tpkt_len,
                cotp_src_tsap: cr.src_tsap.clone(),
                cotp_dst_tsap: cr.dst_tsap.clone(),
                ..Default::default()
            };
            if slot_ok {
                let response = tpkt_wrap(cotp_build_cc(&cr));
                logger.log(peer, &request, &response, &cr_metadata);
                stream.write_all(&response).await?;
                connected_cr = Some(cr);
            } else {
                let response = tpkt_wrap(cotp_build_dr(&cr, 0x01));
                let reject_metadata = LogMetadata { action: Some("reject_connection"), ..cr_metadata };
                logger.log(peer, &request, &response, &reject_metadata);
                stream.write_all(&response).await?;
                return Ok(());
            }
            continue;
        }

        let Some(pdu) = cotp_parse_dt(cotp_body) else {
            continue;
        };
        let Some((response_pdu, mut metadata)) = handle_pdu(pdu, &image, model) else {
            continue;
        };
        metadata.tpkt_len = tpkt_len;
        metadata.proto_id = Some(PROTO_ID_S7);
        metadata.pdu_type = Some(rosctr_label(metadata.rosctr));
        let response = tpkt_wrap(cotp_build_dt(response_pdu));
        logger.log(peer, &request, &response, &metadata);
        stream.write_all(&response).await?;
    }
}
