//! Device lifecycle: binding listeners, spawning protocol servers and
//! simulation tick loops, and the start-attempt backoff counter.

use crate::config::{PlcConfig, PlcKind};
use plc_common::{HoneypotError, HoneypotResult};
use plc_logger::{InteractionLog, Protocol as LogProtocol};
use plc_memory::DeviceImage;
use plc_modbus::{DeviceIdentity, DeviceMap, LogMetadata as ModbusLogMetadata, ModbusLogSink};
use plc_profiles::ProfileStore;
use plc_s7::{LogMetadata as S7LogMetadata, S7DeviceMap, S7LogSink, S7Model, SingleDevice};
use plc_simulation::{DeviceConfig as SimConfig, EffectiveSpec, TickState, WaveformClock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Simulation tick period (§5: "the simulation tick suspends on a 1 s timer").
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Maximum consecutive failed device-start attempts before the agent gives
/// up and waits for the next config change or adoption.
const MAX_START_ATTEMPTS: u8 = 3;

/// Cooldown between device-start attempts.
const START_COOLDOWN: Duration = Duration::from_secs(10);

/// Tracks the shared start-attempt counter described in §4.8: it counts
/// attempts to start the whole device set, not per-device attempts.
#[derive(Debug, Default)]
pub struct StartBackoff {
    attempts: u8,
    last_attempt: Option<std::time::Instant>,
}

impl StartBackoff {
    /// A fresh counter, as after a successful start, a config change, or
    /// adoption.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether another start attempt is currently allowed.
    #[must_use]
    pub fn can_attempt(&self) -> bool {
        if self.attempts >= MAX_START_ATTEMPTS {
            return false;
        }
        match self.last_attempt {
            None => true,
            Some(last) => last.elapsed() >= START_COOLDOWN,
        }
    }

    /// Record a failed attempt.
    pub fn record_failure(&mut self) {
        self.attempts += 1;
        self.last_attempt = Some(std::time::Instant::now());
    }

    /// Reset on success, config change, or adoption.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.last_attempt = None;
    }

    /// Whether the cap has been hit and the agent should stop retrying
    /// until something resets the counter.
    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.attempts >= MAX_START_ATTEMPTS
    }
}

/// A bundle of tasks backing one started `plcs[i]` entry.
struct RunningPlc {
    cancel: CancellationToken,
}

/// Routes logged interactions into the agent's shared [`InteractionLog`].
struct LogSink {
    log: Arc<InteractionLog>,
}

impl LogSink {
    fn new(log: Arc<InteractionLog>) -> Self {
        Self { log }
    }
}

impl ModbusLogSink for LogSink {
    fn log(&self, peer: SocketAddr, raw_request: &[u8], raw_response: &[u8], metadata: &ModbusLogMetadata) {
        let meta = modbus_metadata_map(metadata);
        self.log.record(
            LogProtocol::Modbus,
            peer.ip().to_string(),
            raw_request.to_vec(),
            raw_response.to_vec(),
            meta,
        );
    }
}

impl S7LogSink for LogSink {
    fn log(&self, peer: SocketAddr, raw_request: &[u8], raw_response: &[u8], metadata: &S7LogMetadata) {
        let meta = s7_metadata_map(metadata);
        self.log.record(
            LogProtocol::S7comm,
            peer.ip().to_string(),
            raw_request.to_vec(),
            raw_response.to_vec(),
            meta,
        );
    }
}

/// Lowercase, unseparated hex, matching `plc_logger`'s raw-frame encoding.
fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn modbus_metadata_map(metadata: &ModbusLogMetadata) -> HashMap<String, String> {
    let mut map = HashMap::new();
    map.insert("unit_id".to_string(), metadata.unit_id.to_string());
    map.insert("function_code".to_string(), metadata.func_code.to_string());
    if let Some(name) = metadata.func_name {
        map.insert("function_name".to_string(), name.to_string());
    }
    map.insert("transaction_id".to_string(), metadata.trans_id.to_string());
    if let Some(addr) = metadata.start_addr {
        map.insert("start_address".to_string(), addr.to_string());
    }
    if let Some(qty) = metadata.quantity {
        map.insert("quantity".to_string(), qty.to_string());
    }
    if let Some(value) = metadata.write_value {
        map.insert("write_value".to_string(), value.to_string());
    }
    if let Some(payload) = &metadata.data_payload {
        map.insert("data_payload".to_string(), hex(payload));
    }
    if let Some(code) = metadata.exception_code {
        map.insert("exception_code".to_string(), format!("0x{code:02X}"));
    }
    map
}

fn s7_metadata_map(metadata: &S7LogMetadata) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(code) = metadata.function_code {
        map.insert("function_code".to_string(), format!("0x{code:02X}"));
    }
    map.insert("rosctr".to_string(), metadata.rosctr.to_string());
    if let Some(area) = metadata.area {
        map.insert("area".to_string(), format!("0x{area:02X}"));
    }
    if let Some(db) = metadata.db_number {
        map.insert("db_number".to_string(), db.to_string());
    }
    if let Some(addr) = metadata.address {
        map.insert("address".to_string(), addr.to_string());
    }
    if let Some(data) = &metadata.write_data {
        map.insert("write_data".to_string(), hex(data));
    }
    if let Some(id) = metadata.szl_id {
        map.insert("szl_id".to_string(), format!("0x{id:04X}"));
    }
    if let Some(index) = metadata.szl_index {
        map.insert("szl_index".to_string(), format!("0x{index:04X}"));
    }
    if let Some(len) = metadata.tpkt_len {
        map.insert("tpkt_len".to_string(), len.to_string());
    }
    if let Some(proto_id) = metadata.proto_id {
        map.insert("proto_id".to_string(), format!("0x{proto_id:02X}"));
    }
    if let Some(pdu_type) = metadata.pdu_type {
        map.insert("pdu_type".to_string(), pdu_type.to_string());
    }
    if let Some(action) = metadata.action {
        map.insert("action".to_string(), action.to_string());
    }
    if let Some(tsap) = &metadata.cotp_src_tsap {
        map.insert("cotp_src_tsap".to_string(), hex(tsap));
    }
    if let Some(tsap) = &metadata.cotp_dst_tsap {
        map.insert("cotp_dst_tsap".to_string(), hex(tsap));
    }
    map
}

/// Resolves Unit IDs to per-sub-device images for a Modbus gateway.
struct GatewayMap {
    devices: HashMap<u8, (Arc<Mutex<DeviceImage>>, Arc<DeviceIdentity>)>,
}

impl DeviceMap for GatewayMap {
    fn get(&self, unit_id: u8) -> Option<(Arc<Mutex<DeviceImage>>, Arc<DeviceIdentity>)> {
        self.devices.get(&unit_id).cloned()
    }
}

/// Everything the agent needs to run the simulation loop for one memory
/// image: the image itself, its resolved spec, and its cross-tick state.
struct SimTarget {
    image: Arc<Mutex<DeviceImage>>,
    spec: EffectiveSpec,
}

fn spawn_tick_loop(target: SimTarget, cancel: CancellationToken) {
    tokio::spawn(async move {
        let clock = WaveformClock::new();
        let mut state = TickState::new();
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = interval.tick() => {
                    let elapsed = clock.elapsed_s();
                    let mut rng = rand::thread_rng();
                    let mut guard =
                        target.image.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                    plc_simulation::tick(&target.spec, &mut guard, elapsed, &mut state, &mut rng);
                }
            }
        }
    });
}

/// Start one configured, enabled PLC: bind its listener, spawn the
/// protocol server and its simulation tick loop(s).
///
/// # Errors
///
/// Returns [`HoneypotError::PortInUse`] if the port cannot be bound.
async fn start_plc(
    plc: &PlcConfig,
    profile_store: &ProfileStore,
    logger: Arc<InteractionLog>,
) -> HoneypotResult<RunningPlc> {
    let listener = TcpListener::bind(("0.0.0.0", plc.port))
        .await
        .map_err(|_| HoneypotError::PortInUse(plc.port))?;
    let cancel = CancellationToken::new();
    let sim_config = plc.simulation.clone().unwrap_or_default();

    match plc.kind {
        PlcKind::Modbus => start_modbus(plc, listener, &sim_config, profile_store, logger, cancel.clone()),
        PlcKind::S7comm => start_s7(plc, listener, &sim_config, profile_store, logger, cancel.clone())?,
    }

    Ok(RunningPlc { cancel })
}

fn start_modbus(
    plc: &PlcConfig,
    listener: TcpListener,
    sim_config: &SimConfig,
    profile_store: &ProfileStore,
    logger: Arc<InteractionLog>,
    cancel: CancellationToken,
) {
    let spec = plc_simulation::resolve(profile_store, sim_config);
    let sub_devices = plc.devices.clone().unwrap_or_else(|| {
        vec![crate::config::ModbusSubDevice { unit_id: 1, model: plc.model.clone() }]
    });

    let mut devices = HashMap::new();
    for sub in sub_devices {
        let image = Arc::new(Mutex::new(DeviceImage::new()));
        let identity = Arc::new(DeviceIdentity {
            model: sub.model,
            vendor_name: plc.vendor.clone().unwrap_or_else(|| "Schneider Electric".to_string()),
            revision: plc.revision.clone().unwrap_or_else(|| "V1.0.0".to_string()),
        });
        devices.insert(sub.unit_id, (Arc::clone(&image), identity));
        spawn_tick_loop(SimTarget { image, spec: spec.clone() }, cancel.child_token());
    }

    let map: Arc<dyn DeviceMap> = Arc::new(GatewayMap { devices });
    let sink: Arc<dyn ModbusLogSink> = Arc::new(LogSink::new(logger));
    let serve_cancel = cancel.child_token();
    tokio::spawn(async move {
        if let Err(err) = plc_modbus::serve(listener, map, sink, serve_cancel).await {
            tracing::warn!(%err, "modbus listener exited");
        }
    });
}

fn start_s7(
    plc: &PlcConfig,
    listener: TcpListener,
    sim_config: &SimConfig,
    profile_store: &ProfileStore,
    logger: Arc<InteractionLog>,
    cancel: CancellationToken,
) -> HoneypotResult<()> {
    let model = S7Model::from_str(&plc.model)
        .map_err(HoneypotError::Config)?;
    let spec = plc_simulation::resolve(profile_store, sim_config);
    let image = Arc::new(Mutex::new(DeviceImage::new()));

    spawn_tick_loop(SimTarget { image: Arc::clone(&image), spec }, cancel.child_token());

    let map: Arc<dyn S7DeviceMap> = Arc::new(SingleDevice::new(image, model));
    let sink: Arc<dyn S7LogSink> = Arc::new(LogSink::new(logger));
    let serve_cancel = cancel.child_token();
    tokio::spawn(async move {
        if let Err(err) = plc_s7::serve(listener, map, sink, serve_cancel).await {
            tracing::warn!(%err, "s7 listener exited");
        }
    });
    Ok(())
}

/// Owns every currently-running PLC and the start backoff counter for the
/// agent's current configuration.
#[derive(Default)]
pub struct DeviceFleet {
    running: HashMap<usize, RunningPlc>,
    backoff: StartBackoff,
}

impl DeviceFleet {
    /// An empty fleet, nothing running.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any device is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.running.is_empty()
    }

    /// Stop every running device. Idempotent: safe to call when nothing
    /// is running.
    pub fn stop_all(&mut self) {
        for (_, plc) in self.running.drain() {
            plc.cancel.cancel();
        }
    }

    /// Reset the start backoff counter (on success, config change, or
    /// adoption).
    pub fn reset_backoff(&mut self) {
        self.backoff.reset();
    }

    /// Whether the backoff cap has been hit for the current configuration.
    #[must_use]
    pub fn backoff_exhausted(&self) -> bool {
        self.backoff.exhausted()
    }

    /// Whether another start attempt may be made right now.
    #[must_use]
    pub fn can_attempt_start(&self) -> bool {
        self.backoff.can_attempt()
    }

    /// Attempt to start every enabled device in `plcs`. On the first
    /// bind failure, every device already started in this attempt is
    /// torn back down and the backoff counter is incremented.
    pub async fn start_all(
        &mut self,
        plcs: &[PlcConfig],
        profile_store: &ProfileStore,
        logger: Arc<InteractionLog>,
    ) -> bool {
        let mut started = HashMap::new();
        for (index, plc) in plcs.iter().enumerate() {
            if !plc.enabled {
                continue;
            }
            match start_plc(plc, profile_store, Arc::clone(&logger)).await {
                Ok(running) => {
                    started.insert(index, running);
                }
                Err(err) => {
                    tracing::error!(port = plc.port, %err, "failed to start device, rolling back");
                    for (_, running) in started {
                        running.cancel.cancel();
                    }
                    self.backoff.record_failure();
                    if self.backoff.exhausted() {
                        tracing::error!("device start attempts exhausted, giving up until config changes");
                    }
                    return false;
                }
            }
        }
        self.running = started;
        self.backoff.reset();
        true
    }
}
