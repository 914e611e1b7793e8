//! Modbus/TCP protocol emulator.
//!
//! [`process_request`] is the pure core: MBAP+PDU bytes in, response bytes
//! and a [`LogMetadata`] record out, with no I/O. [`serve`] wraps it in a
//! tokio accept loop — one handler task per connection, one lock
//! acquisition per request against whichever device the request's Unit ID
//! maps to.

use plc_memory::{DeviceImage, ModbusArea};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// How long a connection may sit idle before the handler closes it.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Function codes this emulator understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    /// Read Coils.
    ReadCoils = 0x01,
    /// Read Discrete Inputs.
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers.
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers.
    ReadInputRegisters = 0x04,
    /// Write Single Coil.
    WriteSingleCoil = 0x05,
    /// Write Single Register.
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils.
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers.
    WriteMultipleRegisters = 0x10,
    /// Report Server ID.
    ReportServerId = 0x11,
    /// MEI / Read Device Identification (sub-function 0x0E).
    EncapsulatedInterfaceTransport = 0x2B,
}

impl FunctionCode {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::ReadCoils),
            0x02 => Some(Self::ReadDiscreteInputs),
            0x03 => Some(Self::ReadHoldingRegisters),
            0x04 => Some(Self::ReadInputRegisters),
            0x05 => Some(Self::WriteSingleCoil),
            0x06 => Some(Self::WriteSingleRegister),
            0x0F => Some(Self::WriteMultipleCoils),
            0x10 => Some(Self::WriteMultipleRegisters),
            0x11 => Some(Self::ReportServerId),
            0x2B => Some(Self::EncapsulatedInterfaceTransport),
            _ => None,
        }
    }

    /// Short name used in log metadata.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadCoils => "read_coils",
            Self::ReadDiscreteInputs => "read_discrete_inputs",
            Self::ReadHoldingRegisters => "read_holding_registers",
            Self::ReadInputRegisters => "read_input_registers",
            Self::WriteSingleCoil => "write_single_coil",
            Self::WriteSingleRegister => "write_single_register",
            Self::WriteMultipleCoils => "write_multiple_coils",
            Self::WriteMultipleRegisters => "write_multiple_registers",
            Self::ReportServerId => "report_server_id",
            Self::EncapsulatedInterfaceTransport => "read_device_id",
        }
    }
}

/// Modbus exception codes this emulator can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    /// Function code not supported.
    IllegalFunction = 0x01,
    /// Address or address range not valid for this device.
    IllegalDataAddress = 0x02,
    /// A field value is out of the function's legal range.
    IllegalDataValue = 0x03,
    /// Unit ID not mapped to a device (gateway mode).
    GatewayPathUnavailable = 0x0A,
}

/// Parsed MBAP header (7 bytes): the framing layer around every PDU.
#[derive(Debug, Clone, Copy)]
pub struct MbapHeader {
    /// Echoed verbatim in the response.
    pub transaction_id: u16,
    /// Must be zero.
    pub protocol_id: u16,
    /// Byte count of unit id + PDU that follows.
    pub length: u16,
    /// Identifies which logical device (gateway mode) the request targets.
    pub unit_id: u8,
}

impl MbapHeader {
    /// Size in bytes of the MBAP header.
    pub const SIZE: usize = 7;

    /// Parse a header from the first 7 bytes of `bytes`.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            unit_id: bytes[6],
        })
    }

    /// Serialize back to 7 bytes.
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..2].copy_from_slice(&self.transaction_id.to_be_bytes());
        out[2..4].copy_from_slice(&self.protocol_id.to_be_bytes());
        out[4..6].copy_from_slice(&self.length.to_be_bytes());
        out[6] = self.unit_id;
        out
    }
}

/// Metadata describing one handled request, for the interaction logger.
#[derive(Debug, Clone, Default)]
pub struct LogMetadata {
    /// Unit ID the request targeted.
    pub unit_id: u8,
    /// Raw function code byte.
    pub func_code: u8,
    /// Human-readable function name, when recognized.
    pub func_name: Option<&'static str>,
    /// MBAP transaction id.
    pub trans_id: u16,
    /// Starting address, for functions that have one.
    pub start_addr: Option<u16>,
    /// Quantity of coils/registers, for functions that have one.
    pub quantity: Option<u16>,
    /// Single write value, for FC5/FC6.
    pub write_value: Option<u16>,
    /// Raw write/response payload bytes, hex-ready.
    pub data_payload: Option<Vec<u8>>,
    /// Exception code, if the response was an exception.
    pub exception_code: Option<u8>,
}

/// The outcome of handling one request: response bytes plus log metadata.
#[derive(Debug, Clone)]
pub struct HandledRequest {
    /// Full MBAP+PDU response frame.
    pub response: Vec<u8>,
    /// Metadata for the interaction log.
    pub metadata: LogMetadata,
}

fn exception_response(header: MbapHeader, func_code: u8, exception: ExceptionCode) -> HandledRequest {
    let pdu = vec![func_code | 0x80, exception as u8];
    let response_header = MbapHeader {
        transaction_id: header.transaction_id,
        protocol_id: 0,
        length: (1 + pdu.len()) as u16,
        unit_id: header.unit_id,
    };
    let mut response = response_header.to_bytes().to_vec();
    response.extend_from_slice(&pdu);
    HandledRequest {
        response,
        metadata: LogMetadata {
            unit_id: header.unit_id,
            func_code,
            func_name: FunctionCode::from_byte(func_code).map(FunctionCode::name),
            trans_id: header.transaction_id,
            exception_code: Some(exception as u8),
            ..Default::default()
        },
    }
}

fn ok_response(header: MbapHeader, func_code: u8, pdu_body: Vec<u8>) -> Vec<u8> {
    let mut pdu = vec![func_code];
    pdu.extend(pdu_body);
    let response_header = MbapHeader {
        transaction_id: header.transaction_id,
        protocol_id: 0,
        length: (1 + pdu.len()) as u16,
        unit_id: header.unit_id,
    };
    let mut response = response_header.to_bytes().to_vec();
    response.extend_from_slice(&pdu);
    response
}

fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let byte_count = bits.len().div_ceil(8);
    let mut bytes = vec![0u8; byte_count];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

fn unpack_bits(bytes: &[u8], count: u16) -> Vec<bool> {
    (0..count as usize)
        .map(|i| bytes.get(i / 8).is_some_and(|b| b & (1 << (i % 8)) != 0))
        .collect()
}

/// Device identity returned by FC17 (Report Server ID) and FC43 (Read
/// Device Identification).
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    /// Free-text model string returned as the FC17 server id.
    pub model: String,
    /// Vendor name, MEI object 0x00.
    pub vendor_name: String,
    /// Revision string, MEI object 0x02.
    pub revision: String,
}

/// Handle one Modbus request against `image`, holding its lock for the
/// span of this call only. Pure apart from that lock acquisition: no
/// socket I/O happens here, which is what makes this directly unit
/// testable.
#[must_use]
pub fn process_request(request: &[u8], image: &Mutex<DeviceImage>, identity: &DeviceIdentity) -> Option<HandledRequest> {
    let header = MbapHeader::from_bytes(request)?;
    if request.len() < MbapHeader::SIZE + 1 {
        return None;
    }
    let pdu = &request[MbapHeader::SIZE..];
    let func_code = pdu[0];
    let body = &pdu[1..];

    let Some(function) = FunctionCode::from_byte(func_code) else {
        return Some(exception_response(header, func_code, ExceptionCode::IllegalFunction));
    };

    let mut image = image.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

    let (response, metadata) = match function {
        FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
            let Some((start, qty)) = read_start_qty(body) else {
                return Some(exception_response(header, func_code, ExceptionCode::IllegalDataValue));
            };
            if qty == 0 || qty > 2000 {
                return Some(exception_response(header, func_code, ExceptionCode::IllegalDataValue));
            }
            let area = if function == FunctionCode::ReadCoils {
                ModbusArea::Coils
            } else {
                ModbusArea::DiscreteInputs
            };
            let bits = image.modbus_read_bools(area, start, qty);
            let packed = pack_bits(&bits);
            let mut pdu_body = vec![packed.len() as u8];
            pdu_body.extend(&packed);
            (
                ok_response(header, func_code, pdu_body),
                LogMetadata {
                    start_addr: Some(start),
                    quantity: Some(qty),
                    ..base_metadata(header, func_code, function)
                },
            )
        }
        FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
            let Some((start, qty)) = read_start_qty(body) else {
                return Some(exception_response(header, func_code, ExceptionCode::IllegalDataValue));
            };
            if qty == 0 || qty > 125 {
                return Some(exception_response(header, func_code, ExceptionCode::IllegalDataValue));
            }
            let area = if function == FunctionCode::ReadHoldingRegisters {
                ModbusArea::HoldingRegisters
            } else {
                ModbusArea::InputRegisters
            };
            let regs = image.modbus_read_registers(area, start, qty);
            let mut pdu_body = vec![(regs.len() * 2) as u8];
            for reg in &regs {
                pdu_body.extend_from_slice(&reg.to_be_bytes());
            }
            (
                ok_response(header, func_code, pdu_body),
                LogMetadata {
                    start_addr: Some(start),
                    quantity: Some(qty),
                    ..base_metadata(header, func_code, function)
                },
            )
        }
        FunctionCode::WriteSingleCoil => {
            if body.len() < 4 {
                return Some(exception_response(header, func_code, ExceptionCode::IllegalDataValue));
            }
            let addr = u16::from_be_bytes([body[0], body[1]]);
            let raw = u16::from_be_bytes([body[2], body[3]]);
            let value = match raw {
                0xFF00 => true,
                0x0000 => false,
                _ => return Some(exception_response(header, func_code, ExceptionCode::IllegalDataValue)),
            };
            image.modbus_write_bool(ModbusArea::Coils, addr, value);
            (
                ok_response(header, func_code, body.to_vec()),
                LogMetadata {
                    start_addr: Some(addr),
                    write_value: Some(raw),
                    ..base_metadata(header, func_code, function)
                },
            )
        }
        FunctionCode::WriteSingleRegister => {
            if body.len() < 4 {
                return Some(exception_response(header, func_code, ExceptionCode::IllegalDataValue));
            }
            let addr = u16::from_be_bytes([body[0], body[1]]);
            let value = u16::from_be_bytes([body[2], body[3]]);
            image.modbus_write_registers(ModbusArea::HoldingRegisters, addr, &[value]);
            (
                ok_response(header, func_code, body.to_vec()),
                LogMetadata {
                    start_addr: Some(addr),
                    write_value: Some(value),
                    ..base_metadata(header, func_code, function)
                },
            )
        }
        FunctionCode::WriteMultipleCoils => {
            if body.len() < 5 {
                return Some(exception_response(header, func_code, ExceptionCode::IllegalDataValue));
            }
            let start = u16::from_be_bytes([body[0], body[1]]);
            let qty = u16::from_be_bytes([body[2], body[3]]);
            let byte_count = body[4] as usize;
            if body.len() < 5 + byte_count || qty == 0 || qty > 1968 {
                return Some(exception_response(header, func_code, ExceptionCode::IllegalDataValue));
            }
            let bits = unpack_bits(&body[5..5 + byte_count], qty);
            image.modbus_write_bools(ModbusArea::Coils, start, &bits);
            let mut pdu_body = Vec::with_capacity(4);
            pdu_body.extend_from_slice(&start.to_be_bytes());
            pdu_body.extend_from_slice(&qty.to_be_bytes());
            (
                ok_response(header, func_code, pdu_body),
                LogMetadata {
                    start_addr: Some(start),
                    quantity: Some(qty),
                    data_payload: Some(body[5..5 + byte_count].to_vec()),
                    ..base_metadata(header, func_code, function)
                },
            )
        }
        FunctionCode::WriteMultipleRegisters => {
            if body.len() < 5 {
                return Some(exception_response(header, func_code, ExceptionCode::IllegalDataValue));
            }
            let start = u16::from_be_bytes([body[0], body[1]]);
            let qty = u16::from_be_bytes([body[2], body[3]]);
            let byte_count = body[4] as usize;
            if body.len() < 5 + byte_count || byte_count != qty as usize * 2 || qty == 0 || qty > 123 {
                return Some(exception_response(header, func_code, ExceptionCode::IllegalDataValue));
            }
            let values: Vec<u16> = body[5..5 + byte_count]
                .chunks(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect();
            image.modbus_write_registers(ModbusArea::HoldingRegisters, start, &values);
            let mut pdu_body = Vec::with_capacity(4);
            pdu_body.extend_from_slice(&start.to_be_bytes());
            pdu_body.extend_from_slice(&qty.to_be_bytes());
            (
                ok_response(header, func_code, pdu_body),
                LogMetadata {
                    start_addr: Some(start),
                    quantity: Some(qty),
                    data_payload: Some(body[5..5 + byte_count].to_vec()),
                    ..base_metadata(header, func_code, function)
                },
            )
        }
        FunctionCode::ReportServerId => {
            let id_bytes = identity.model.as_bytes();
            let mut pdu_body = vec![(id_bytes.len() + 1) as u8];
            pdu_body.extend_from_slice(id_bytes);
            pdu_body.push(0xFF);
            (ok_response(header, func_code, pdu_body), base_metadata(header, func_code, function))
        }
        FunctionCode::EncapsulatedInterfaceTransport => {
            if body.first() != Some(&0x0E) {
                return Some(exception_response(header, func_code, ExceptionCode::IllegalFunction));
            }
            let mut pdu_body = vec![0x0E, 0x01, 0x01, 0x00, 0x00, 0x03];
            for (object_id, value) in [
                (0x00u8, identity.vendor_name.as_str()),
                (0x01, identity.model.as_str()),
                (0x02, identity.revision.as_str()),
            ] {
                let bytes = value.as_bytes();
                pdu_body.push(object_id);
                pdu_body.push(bytes.len() as u8);
                pdu_body.extend_from_slice(bytes);
            }
            (ok_response(header, func_code, pdu_body), base_metadata(header, func_code, function))
        }
    };

    Some(HandledRequest { response, metadata })
}

fn base_metadata(header: MbapHeader, func_code: u8, function: FunctionCode) -> LogMetadata {
    LogMetadata {
        unit_id: header.unit_id,
        func_code,
        func_name: Some(function.name()),
        trans_id: header.transaction_id,
        ..Default::default()
    }
}

fn read_start_qty(body: &[u8]) -> Option<(u16, u16)> {
    if body.len() < 4 {
        return None;
    }
    Some((
        u16::from_be_bytes([body[0], body[1]]),
        u16::from_be_bytes([body[2], body[3]]),
    ))
}

/// Resolves a Unit ID to the shared memory image of the device it
/// addresses (gateway mode: many logical devices behind one listener).
pub trait DeviceMap: Send + Sync {
    /// Look up the device bound to `unit_id`, if any is mapped.
    fn get(&self, unit_id: u8) -> Option<(Arc<Mutex<DeviceImage>>, Arc<DeviceIdentity>)>;
}

impl DeviceMap for HashMap<u8, (Arc<Mutex<DeviceImage>>, Arc<DeviceIdentity>)> {
    fn get(&self, unit_id: u8) -> Option<(Arc<Mutex<DeviceImage>>, Arc<DeviceIdentity>)> {
        HashMap::get(self, &unit_id).cloned()
    }
}

/// Sink for per-request interaction log records.
pub trait ModbusLogSink: Send + Sync {
    /// Record one handled (or rejected) request, with both raw frames.
    fn log(&self, peer: SocketAddr, raw_request: &[u8], raw_response: &[u8], metadata: &LogMetadata);
}

/// Run the Modbus/TCP accept loop until `cancel` fires.
///
/// Spawns one handler task per accepted connection; each handler reads
/// frames sequentially (preserving in-order responses) with a 30 s
/// inactivity timeout, dispatching every request through
/// [`process_request`] against whichever device `devices` maps its Unit
/// ID to.
pub async fn serve(
    listener: TcpListener,
    devices: Arc<dyn DeviceMap>,
    logger: Arc<dyn ModbusLogSink>,
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
                        tracing::debug!(%peer, %err, "modbus connection ended");
                    }
                });
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    devices: Arc<dyn DeviceMap>,
    logger: Arc<dyn ModbusLogSink>,
    cancel: CancellationToken,
) -> io::Result<()> {
    let mut buf = vec![0u8; 4096];
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

        let request = &buf[..n];
        let Some(header) = MbapHeader::from_bytes(request) else {
            continue;
        };

        let Some((image, identity)) = devices.get(header.unit_id) else {
            let func_code = request.get(MbapHeader::SIZE).copied().unwrap_or(0);
            let handled = exception_response(header, func_code, ExceptionCode::GatewayPathUnavailable);
            logger.log(peer, request, &handled.response, &handled.metadata);
            stream.write_all(&handled.response).await?;
            continue;
        };

        let Some(handled) = process_request(request, &image, &identity) else {
            continue;
        };
        logger.log(peer, request, &handled.response, &handled.metadata);
        stream.write_all(&handled.response).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            model: "PM5300".to_string(),
            vendor_name: "Schneider Electric".to_string(),
            revision: "V1.0.0".to_string(),
        }
    }

    fn frame(unit_id: u8, pdu: &[u8]) -> Vec<u8> {
        let header = MbapHeader {
            transaction_id: 0x0001,
            protocol_id: 0,
            length: (1 + pdu.len()) as u16,
            unit_id,
        };
        let mut out = header.to_bytes().to_vec();
        out.extend_from_slice(pdu);
        out
    }

    #[test]
    fn read_holding_registers_round_trips() {
        let image = Mutex::new(DeviceImage::new());
        image
            .lock()
            .unwrap()
            .modbus_write_registers(ModbusArea::HoldingRegisters, 0, &[111, 222]);

        let request = frame(1, &[0x03, 0x00, 0x00, 0x00, 0x02]);
        let handled = process_request(&request, &image, &identity()).unwrap();

        assert_eq!(handled.metadata.func_code, 0x03);
        assert_eq!(handled.metadata.start_addr, Some(0));
        assert_eq!(handled.metadata.quantity, Some(2));
        // MBAP (7) + func (1) + byte-count (1) + 2 regs (4).
        assert_eq!(handled.response.len(), 7 + 1 + 1 + 4);
        assert_eq!(&handled.response[9..], &[0x00, 111, 0x00, 222]);
    }

    #[test]
    fn write_single_coil_accepts_on_off_only() {
        let image = Mutex::new(DeviceImage::new());
        let on = frame(1, &[0x05, 0x00, 0x00, 0xFF, 0x00]);
        let handled = process_request(&on, &image, &identity()).unwrap();
        assert!(handled.metadata.exception_code.is_none());
        assert!(image.lock().unwrap().modbus_read_bools(ModbusArea::Coils, 0, 1)[0]);

        let bad = frame(1, &[0x05, 0x00, 0x00, 0x12, 0x34]);
        let handled = process_request(&bad, &image, &identity()).unwrap();
        assert_eq!(handled.metadata.exception_code, Some(ExceptionCode::IllegalDataValue as u8));
    }

    #[test]
    fn unknown_function_code_returns_illegal_function() {
        let image = Mutex::new(DeviceImage::new());
        let request = frame(1, &[0x99, 0x00, 0x00]);
        let handled = process_request(&request, &image, &identity()).unwrap();
        assert_eq!(handled.metadata.exception_code, Some(ExceptionCode::IllegalFunction as u8));
        assert_eq!(handled.response[7], 0x99 | 0x80);
    }

    #[test]
    fn write_multiple_registers_round_trips() {
        let image = Mutex::new(DeviceImage::new());
        let mut pdu = vec![0x10, 0x00, 0x0A, 0x00, 0x02, 0x04];
        pdu.extend_from_slice(&1u16.to_be_bytes());
        pdu.extend_from_slice(&2u16.to_be_bytes());
        let request = frame(1, &pdu);
        let handled = process_request(&request, &image, &identity()).unwrap();
        assert!(handled.metadata.exception_code.is_none());
        assert_eq!(
            image.lock().unwrap().modbus_read_registers(ModbusArea::HoldingRegisters, 10, 2),
            vec![1, 2]
        );
    }

    #[test]
    fn report_server_id_returns_model_string() {
        let image = Mutex::new(DeviceImage::new());
        let request = frame(1, &[0x11]);
        let handled = process_request(&request, &image, &identity()).unwrap();
        let pdu = &handled.response[7..];
        assert_eq!(pdu[0], 0x11);
        let byte_count = pdu[1] as usize;
        let id_bytes = &pdu[2..2 + byte_count - 1];
        assert_eq!(id_bytes, b"PM5300");
        assert_eq!(pdu[2 + byte_count - 1], 0xFF);
    }

    #[test]
    fn read_device_id_returns_three_objects() {
        let image = Mutex::new(DeviceImage::new());
        let request = frame(1, &[0x2B, 0x0E, 0x01, 0x00]);
        let handled = process_request(&request, &image, &identity()).unwrap();
        let pdu = &handled.response[7..];
        assert_eq!(pdu[0], 0x2B);
        assert_eq!(pdu[1], 0x0E);
        assert_eq!(pdu[6], 0x03); // number of objects
    }
}
