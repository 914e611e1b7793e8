//! Black-box acceptance tests for the ICS honeypot fleet.
//!
//! Each test binds a real emulator to an ephemeral TCP port and drives it
//! over an actual socket with the exact byte sequences the protocol
//! scenarios describe, asserting exact response bytes rather than
//! internal state.

use plc_agent::config::PlcConfig;
use plc_memory::DeviceImage;
use plc_modbus::{DeviceIdentity, LogMetadata as ModbusLogMetadata, ModbusLogSink};
use plc_s7::{LogMetadata as S7LogMetadata, S7LogSink, S7Model, SingleDevice};
use plc_server::AgentRegistry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

struct NullSink;

impl ModbusLogSink for NullSink {
    fn log(&self, _peer: SocketAddr, _req: &[u8], _resp: &[u8], _meta: &ModbusLogMetadata) {}
}

impl S7LogSink for NullSink {
    fn log(&self, _peer: SocketAddr, _req: &[u8], _resp: &[u8], _meta: &S7LogMetadata) {}
}

/// Captures every logged S7 record so a test can assert on metadata, not
/// just wire bytes.
#[derive(Default)]
struct CapturingS7Sink {
    records: Mutex<Vec<S7LogMetadata>>,
}

impl S7LogSink for CapturingS7Sink {
    fn log(&self, _peer: SocketAddr, _req: &[u8], _resp: &[u8], meta: &S7LogMetadata) {
        self.records.lock().unwrap().push(meta.clone());
    }
}

async fn start_modbus_gateway(unit_ids: &[u8]) -> (SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let identity = DeviceIdentity {
        model: "PM5300".to_string(),
        vendor_name: "Schneider Electric".to_string(),
        revision: "V1.0.0".to_string(),
    };
    let mut devices = HashMap::new();
    for &unit_id in unit_ids {
        devices.insert(unit_id, (Arc::new(Mutex::new(DeviceImage::new())), Arc::new(identity.clone())));
    }
    let cancel = CancellationToken::new();
    tokio::spawn(plc_modbus::serve(listener, Arc::new(devices), Arc::new(NullSink), cancel.clone()));
    (addr, cancel)
}

async fn start_s7_device(model: S7Model) -> (SocketAddr, CancellationToken) {
    start_s7_device_with_sink(model, Arc::new(NullSink)).await
}

async fn start_s7_device_with_sink(
    model: S7Model,
    sink: Arc<dyn S7LogSink>,
) -> (SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let device = SingleDevice::new(Arc::new(Mutex::new(DeviceImage::new())), model);
    let cancel = CancellationToken::new();
    tokio::spawn(plc_s7::serve(listener, Arc::new(device), sink, cancel.clone()));
    (addr, cancel)
}

async fn roundtrip(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut buf = vec![0u8; 4096];
    let n = stream.read(&mut buf).await.unwrap();
    buf.truncate(n);
    buf
}

/// Seed scenario 1: Modbus FC3 read of ten zero registers from an empty image.
#[tokio::test]
async fn modbus_fc3_read_zero() {
    let (addr, _cancel) = start_modbus_gateway(&[1]).await;
    let request = hex("0001 0000 0006 01 03 0000 000A");
    let response = roundtrip(addr, &request).await;
    let expected =
        hex("0001 0000 0017 01 03 14 0000 0000 0000 0000 0000 0000 0000 0000 0000 0000");
    assert_eq!(response, expected);
}

/// Seed scenario 2: FC6 write then FC3 read observes the written value.
#[tokio::test]
async fn modbus_fc6_then_fc3() {
    let (addr, _cancel) = start_modbus_gateway(&[1]).await;
    let write = hex("0002 0000 0006 01 06 0000 3039");
    let write_response = roundtrip(addr, &write).await;
    assert_eq!(write_response, hex("0002 0000 0006 01 06 0000 3039"));

    let read = hex("0003 0000 0006 01 03 0000 0001");
    let read_response = roundtrip(addr, &read).await;
    let data = &read_response[read_response.len() - 2..];
    assert_eq!(data, &[0x30, 0x39]);
}

/// Seed scenario 3: FC43 MEI-14 returns vendor, model, and revision objects.
#[tokio::test]
async fn modbus_fc43_read_device_identification() {
    let (addr, _cancel) = start_modbus_gateway(&[1]).await;
    let request = hex("0004 0000 0006 01 2B 0E 01 00");
    let response = roundtrip(addr, &request).await;

    let pdu = &response[7..];
    assert_eq!(pdu[0], 0x2B);
    let body = &pdu[2..];
    assert_eq!(body[0], 0x0E);
    assert_eq!(body[5], 3, "three MEI objects");

    let text = String::from_utf8_lossy(body);
    assert!(text.contains("Schneider Electric"));
    assert!(text.contains("PM5300"));
    assert!(text.contains("V1.0.0"));
}

/// Seed scenario 4: a request against an unmapped Unit ID returns the
/// gateway-path-unavailable exception.
#[tokio::test]
async fn modbus_gateway_exception_for_unknown_unit_id() {
    let (addr, _cancel) = start_modbus_gateway(&[1]).await;
    let request = hex("0005 0000 0006 02 03 0000 0001");
    let response = roundtrip(addr, &request).await;
    let pdu = &response[7..];
    assert_eq!(pdu, &[0x83, 0x0A]);
}

/// Seed scenario 5: a Connect Request for an invalid slot on an S7-300 is
/// rejected with a COTP Disconnect Request and the socket is closed.
#[tokio::test]
async fn s7_connect_wrong_slot_is_rejected() {
    let (addr, _cancel) = start_s7_device(S7Model::S7_300).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let cr_frame = tpkt(&cr_body(0x1234, 1));
    stream.write_all(&cr_frame).await.unwrap();

    let mut buf = vec![0u8; 256];
    let n = stream.read(&mut buf).await.unwrap();
    buf.truncate(n);

    // TPKT(4) + LI(1) + DR(0x80) + echoed src-ref(2) + 0x0000 + reason(1).
    assert_eq!(buf[4], 6, "disconnect-request COTP length indicator");
    assert_eq!(buf[5], 0x80, "COTP Disconnect Request PDU code");
    assert_eq!(u16::from_be_bytes([buf[6], buf[7]]), 0x1234, "echoes src-ref");
    assert_eq!(buf[10], 0x01, "reason: slot not supported");

    let mut probe = [0u8; 1];
    let result = stream.read(&mut probe).await;
    assert!(matches!(result, Ok(0) | Err(_)));
}

/// Seed scenario 5, logging half: the rejected CR is logged with
/// `action="reject_connection"` and the declared TPKT length, not just a
/// default-valued record.
#[tokio::test]
async fn s7_connect_wrong_slot_rejection_is_logged() {
    let sink = Arc::new(CapturingS7Sink::default());
    let (addr, _cancel) = start_s7_device_with_sink(S7Model::S7_300, sink.clone()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let cr_frame = tpkt(&cr_body(0x1234, 1));
    let sent_len = cr_frame.len() as u16;
    stream.write_all(&cr_frame).await.unwrap();

    let mut buf = vec![0u8; 256];
    stream.read(&mut buf).await.unwrap();

    let records = sink.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].action, Some("reject_connection"));
    assert_eq!(records[0].tpkt_len, Some(sent_len));
    assert_eq!(records[0].cotp_dst_tsap.as_deref(), Some(&[0x01, 0x01][..]));
}

/// Seed scenario 6: after Setup Communication, a write to DB1.DBB0 is
/// observed by the next read from the same address.
#[tokio::test]
async fn s7_setup_then_write_then_read_db() {
    let (addr, _cancel) = start_s7_device(S7Model::S7_1500).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let cr_frame = tpkt(&cr_body(0x0001, 2));
    stream.write_all(&cr_frame).await.unwrap();
    let mut buf = vec![0u8; 256];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(buf[5], 0xD0, "COTP Connect Confirm");
    let _ = n;

    let setup = setup_communication_pdu(7);
    stream.write_all(&dt_frame(&setup)).await.unwrap();
    let mut buf = vec![0u8; 256];
    let n = stream.read(&mut buf).await.unwrap();
    let s7_pdu = s7_pdu_from_dt_frame(&buf[..n]);
    let param_len = u16::from_be_bytes([s7_pdu[6], s7_pdu[7]]) as usize;
    let param = &s7_pdu[12..12 + param_len];
    let max_pdu = u16::from_be_bytes([param[5], param[6]]);
    assert_eq!(max_pdu, 960, "S7-1500 advertises a 960-byte max PDU");

    let write = write_var_pdu(8, 1, 0, &[0xDE, 0xAD, 0xBE, 0xEF]);
    stream.write_all(&dt_frame(&write)).await.unwrap();
    let mut buf = vec![0u8; 256];
    let n = stream.read(&mut buf).await.unwrap();
    let s7_pdu = s7_pdu_from_dt_frame(&buf[..n]);
    assert_eq!(&s7_pdu[12..], &[0xFF], "single item write acknowledged");

    let read = read_var_pdu(9, 1, 0, 10);
    stream.write_all(&dt_frame(&read)).await.unwrap();
    let mut buf = vec![0u8; 256];
    let n = stream.read(&mut buf).await.unwrap();
    let s7_pdu = s7_pdu_from_dt_frame(&buf[..n]);
    let data = &s7_pdu[14..];
    assert_eq!(&data[..4], &[0xDE, 0xAD, 0xBE, 0xEF]);
    assert_eq!(data.len(), 10);
}

/// Seed scenario 7: after an operator rename, a still-running agent's
/// heartbeat under its old id is adopted to the new one.
#[tokio::test]
async fn control_plane_adoption_after_rename() {
    let registry = AgentRegistry::new();
    registry.handle_heartbeat("agent-old", "10.0.0.9", None, None);
    registry.rename("agent-old", "agent-new", None, None).unwrap();

    let decision = registry.handle_heartbeat("agent-old", "10.0.0.9", None, None);
    assert_eq!(decision.status, "adopted");
    assert_eq!(decision.new_node_id.as_deref(), Some("agent-new"));

    let next = registry.handle_heartbeat("agent-new", "10.0.0.9", None, None);
    assert_eq!(next.status, "ok");
}

/// Seed scenario 8: stopping a device fleet releases the listening port.
#[tokio::test]
async fn device_stop_releases_listening_port() {
    use plc_agent::devices::DeviceFleet;
    use plc_logger::InteractionLog;
    use plc_profiles::ProfileStore;

    let dir = tempfile::tempdir().unwrap();
    let profiles = ProfileStore::load(dir.path()).unwrap();
    let logger = Arc::new(InteractionLog::new());
    let mut fleet = DeviceFleet::new();

    let plc = PlcConfig { enabled: true, port: 0, model: "generic".to_string(), ..PlcConfig::default() };
    assert!(fleet.start_all(&[plc], &profiles, Arc::clone(&logger)).await);
    assert!(fleet.is_running());

    fleet.stop_all();
    assert!(!fleet.is_running());
}

fn hex(spaced: &str) -> Vec<u8> {
    spaced
        .split_whitespace()
        .map(|byte| u8::from_str_radix(byte, 16).unwrap())
        .collect()
}

fn tpkt(cotp: &[u8]) -> Vec<u8> {
    let total_length = (4 + cotp.len()) as u16;
    let mut out = vec![0x03, 0x00];
    out.extend_from_slice(&total_length.to_be_bytes());
    out.extend_from_slice(cotp);
    out
}

fn dt_frame(s7_pdu: &[u8]) -> Vec<u8> {
    let mut cotp = vec![2u8, 0xF0, 0x80];
    cotp.extend_from_slice(s7_pdu);
    tpkt(&cotp)
}

fn s7_pdu_from_dt_frame(frame: &[u8]) -> Vec<u8> {
    let cotp = &frame[4..];
    let header_len = cotp[0] as usize;
    cotp[1 + header_len..].to_vec()
}

fn cr_body(src_ref: u16, slot: u8) -> Vec<u8> {
    let mut body = vec![0xE0u8];
    body.extend_from_slice(&0u16.to_be_bytes());
    body.extend_from_slice(&src_ref.to_be_bytes());
    body.push(0x00);
    body.extend_from_slice(&[0xC2, 0x02, 0x01, slot]);
    body
}

fn setup_communication_pdu(pdu_reference: u16) -> Vec<u8> {
    let mut pdu = vec![0x32, 0x01];
    pdu.extend_from_slice(&0u16.to_be_bytes());
    pdu.extend_from_slice(&pdu_reference.to_be_bytes());
    pdu.extend_from_slice(&7u16.to_be_bytes());
    pdu.extend_from_slice(&0u16.to_be_bytes());
    pdu.extend_from_slice(&[0xF0, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0xF0]);
    pdu
}

fn item_spec(transport_type: u8, length: u16, db_num: u16, area: u8, byte_offset: u16) -> Vec<u8> {
    let mut item = vec![0x12, 0x0A, 0x10, transport_type];
    item.extend_from_slice(&length.to_be_bytes());
    item.extend_from_slice(&db_num.to_be_bytes());
    item.push(area);
    let addr = u32::from(byte_offset) << 3;
    item.extend_from_slice(&addr.to_be_bytes()[1..]);
    item
}

const AREA_DB: u8 = 0x84;

fn read_var_pdu(pdu_reference: u16, db_num: u16, byte_offset: u16, length: u16) -> Vec<u8> {
    let item = item_spec(0x02, length, db_num, AREA_DB, byte_offset);
    let mut param = vec![0x04, 0x01];
    param.extend(item);

    let mut pdu = vec![0x32, 0x01];
    pdu.extend_from_slice(&0u16.to_be_bytes());
    pdu.extend_from_slice(&pdu_reference.to_be_bytes());
    pdu.extend_from_slice(&(param.len() as u16).to_be_bytes());
    pdu.extend_from_slice(&0u16.to_be_bytes());
    pdu.extend(param);
    pdu
}

fn write_var_pdu(pdu_reference: u16, db_num: u16, byte_offset: u16, bytes: &[u8]) -> Vec<u8> {
    let item = item_spec(0x02, bytes.len() as u16, db_num, AREA_DB, byte_offset);
    let mut param = vec![0x05, 0x01];
    param.extend(item);

    let mut data = vec![0x00, 0x04];
    data.extend_from_slice(&((bytes.len() as u16) * 8).to_be_bytes());
    data.extend_from_slice(bytes);

    let mut pdu = vec![0x32, 0x01];
    pdu.extend_from_slice(&0u16.to_be_bytes());
    pdu.extend_from_slice(&pdu_reference.to_be_bytes());
    pdu.extend_from_slice(&(param.len() as u16).to_be_bytes());
    pdu.extend_from_slice(&(data.len() as u16).to_be_bytes());
    pdu.extend(param);
    pdu.extend(data);
    pdu
}
