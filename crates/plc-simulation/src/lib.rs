//! Per-device simulation engine.
//!
//! One [`EffectiveSpec`] is resolved once when a device starts (profile
//! lookup plus a custom-config overlay) and then driven by [`tick`] once
//! per second for the device's lifetime. [`TickState`] carries the only
//! state that crosses tick boundaries — prior samples for stateful
//! waveform families and one-shot initialization markers for `static`
//! and `string` entries.

use plc_memory::{DeviceImage, ModbusArea, S7Area};
use plc_profiles::{BoolEntry, ProfileStore, RegisterEntry, RegisterTypeTag, S7DataType, S7Entry};
use plc_waveform::WaveformValue;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

/// Name of the bundled fallback profile used when a device declares no
/// profile and no custom entries of its own.
pub const DEFAULT_PROFILE_NAME: &str = "water_treatment";

/// A device's declared simulation configuration: an optional base profile
/// plus custom per-address overlay entries, later entries winning over
/// the profile's. This is also the wire shape of a `plcs[i].simulation`
/// field in the agent's configuration JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Base profile name, if any.
    pub profile: Option<String>,
    /// Modbus overlay entries.
    pub modbus: Option<plc_profiles::ModbusProfile>,
    /// S7 overlay entries.
    pub s7: Option<plc_profiles::S7Profile>,
}

/// The fully resolved, flattened simulation target for one device: every
/// address/offset this device will drive, with profile and overlay
/// entries already merged (overlay wins on address collision).
#[derive(Debug, Clone, Default)]
pub struct EffectiveSpec {
    /// Holding register entries, sorted by address.
    pub holding_registers: Vec<RegisterEntry>,
    /// Input register entries, sorted by address.
    pub input_registers: Vec<RegisterEntry>,
    /// Coil entries, sorted by address.
    pub coils: Vec<BoolEntry>,
    /// Discrete input entries, sorted by address.
    pub discrete_inputs: Vec<BoolEntry>,
    /// Data block entries, keyed by DB number then byte offset.
    pub db: BTreeMap<u16, BTreeMap<u16, S7Entry>>,
    /// Merker entries, keyed by byte offset.
    pub m: BTreeMap<u16, S7Entry>,
    /// Process image input entries, keyed by byte offset.
    pub i: BTreeMap<u16, S7Entry>,
    /// Process image output entries, keyed by byte offset.
    pub q: BTreeMap<u16, S7Entry>,
    /// Name of a registered post-hook to run after every tick.
    pub post_hook: Option<String>,
}

/// Resolve the effective spec for a device: load its base profile (if
/// named, or the default when the device declares no custom entries of
/// its own), then overlay the device's custom entries on top.
#[must_use]
pub fn resolve(store: &ProfileStore, config: &DeviceConfig) -> EffectiveSpec {
    let modbus_empty = config.modbus.as_ref().map_or(true, is_modbus_empty);
    let s7_empty = config.s7.as_ref().map_or(true, is_s7_empty);

    let base_modbus = if let Some(name) = &config.profile {
        store.get_modbus(name).cloned()
    } else if modbus_empty {
        store.get_modbus(DEFAULT_PROFILE_NAME).cloned()
    } else {
        None
    };

    let base_s7 = if let Some(name) = &config.profile {
        store.get_s7(name).cloned()
    } else if s7_empty {
        store.get_s7(DEFAULT_PROFILE_NAME).cloned()
    } else {
        None
    };

    let post_hook = config
        .modbus
        .as_ref()
        .and_then(|m| m.post_hook.clone())
        .or_else(|| base_modbus.as_ref().and_then(|m| m.post_hook.clone()));

    EffectiveSpec {
        holding_registers: merge_registers(
            base_modbus.as_ref().map(|m| m.holding_registers.as_slice()),
            config.modbus.as_ref().map(|m| m.holding_registers.as_slice()),
        ),
        input_registers: merge_registers(
            base_modbus.as_ref().map(|m| m.input_registers.as_slice()),
            config.modbus.as_ref().map(|m| m.input_registers.as_slice()),
        ),
        coils: merge_bools(
            base_modbus.as_ref().map(|m| m.coils.as_slice()),
            config.modbus.as_ref().map(|m| m.coils.as_slice()),
        ),
        discrete_inputs: merge_bools(
            base_modbus.as_ref().map(|m| m.discrete_inputs.as_slice()),
            config.modbus.as_ref().map(|m| m.discrete_inputs.as_slice()),
        ),
        db: merge_s7_db(
            base_s7.as_ref().map(|s| &s.db),
            config.s7.as_ref().map(|s| &s.db),
        ),
        m: merge_s7_flat(base_s7.as_ref().map(|s| &s.m), config.s7.as_ref().map(|s| &s.m)),
        i: merge_s7_flat(base_s7.as_ref().map(|s| &s.i), config.s7.as_ref().map(|s| &s.i)),
        q: merge_s7_flat(base_s7.as_ref().map(|s| &s.q), config.s7.as_ref().map(|s| &s.q)),
        post_hook,
    }
}

fn is_modbus_empty(m: &plc_profiles::ModbusProfile) -> bool {
    m.holding_registers.is_empty()
        && m.input_registers.is_empty()
        && m.coils.is_empty()
        && m.discrete_inputs.is_empty()
}

fn is_s7_empty(s: &plc_profiles::S7Profile) -> bool {
    s.db.is_empty() && s.m.is_empty() && s.i.is_empty() && s.q.is_empty()
}

fn merge_registers(base: Option<&[RegisterEntry]>, overlay: Option<&[RegisterEntry]>) -> Vec<RegisterEntry> {
    let mut merged: BTreeMap<u16, RegisterEntry> = BTreeMap::new();
    for entry in base.into_iter().flatten() {
        merged.insert(entry.address, entry.clone());
    }
    for entry in overlay.into_iter().flatten() {
        merged.insert(entry.address, entry.clone());
    }
    merged.into_values().collect()
}

fn merge_bools(base: Option<&[BoolEntry]>, overlay: Option<&[BoolEntry]>) -> Vec<BoolEntry> {
    let mut merged: BTreeMap<u16, BoolEntry> = BTreeMap::new();
    for entry in base.into_iter().flatten() {
        merged.insert(entry.address, entry.clone());
    }
    for entry in overlay.into_iter().flatten() {
        merged.insert(entry.address, entry.clone());
    }
    merged.into_values().collect()
}

fn merge_s7_flat(
    base: Option<&BTreeMap<u16, S7Entry>>,
    overlay: Option<&BTreeMap<u16, S7Entry>>,
) -> BTreeMap<u16, S7Entry> {
    let mut merged = base.cloned().unwrap_or_default();
    if let Some(o) = overlay {
        merged.extend(o.clone());
    }
    merged
}

fn merge_s7_db(
    base: Option<&BTreeMap<u16, BTreeMap<u16, S7Entry>>>,
    overlay: Option<&BTreeMap<u16, BTreeMap<u16, S7Entry>>>,
) -> BTreeMap<u16, BTreeMap<u16, S7Entry>> {
    let mut merged: BTreeMap<u16, BTreeMap<u16, S7Entry>> = base.cloned().unwrap_or_default();
    if let Some(o) = overlay {
        for (db_num, inner) in o {
            merged.entry(*db_num).or_default().extend(inner.clone());
        }
    }
    merged
}

/// A monotonic clock handing out elapsed seconds since a device's
/// simulation started, the `t` that waveform evaluators are driven by.
#[derive(Debug)]
pub struct WaveformClock {
    start: Instant,
}

impl Default for WaveformClock {
    fn default() -> Self {
        Self::new()
    }
}

impl WaveformClock {
    /// Start the clock now.
    #[must_use]
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }

    /// Seconds elapsed since this clock was created.
    #[must_use]
    pub fn elapsed_s(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum StateKey {
    Modbus(ModbusArea, u16),
    S7(S7Area, u16, u16),
}

/// Cross-tick state for one device's simulation: the last sample handed
/// to stateful waveform families, and which one-shot entries (`static`,
/// `string`) have already been initialized.
#[derive(Debug, Default)]
pub struct TickState {
    prior: HashMap<StateKey, f64>,
    initialized: HashSet<StateKey>,
}

impl TickState {
    /// A fresh, empty state for a device that has not ticked yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn to_register(value: f64) -> u16 {
    (value.round() as i64) as u16
}

fn encode_f32_be(value: f32) -> [u16; 2] {
    let bytes = value.to_be_bytes();
    [
        u16::from_be_bytes([bytes[0], bytes[1]]),
        u16::from_be_bytes([bytes[2], bytes[3]]),
    ]
}

fn decode_f32_be(regs: &[u16]) -> f32 {
    let b0 = regs[0].to_be_bytes();
    let b1 = regs[1].to_be_bytes();
    f32::from_be_bytes([b0[0], b0[1], b1[0], b1[1]])
}

fn encode_string_registers(text: &str, length: u16) -> Vec<u16> {
    let mut bytes = text.as_bytes().to_vec();
    bytes.resize(length as usize * 2, 0);
    bytes
        .chunks(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect()
}

fn encode_s7_value(value: f64, data_type: S7DataType) -> Vec<u8> {
    let rounded = value.round() as i64;
    match data_type {
        S7DataType::Byte => vec![rounded as u8],
        S7DataType::Int => (rounded as i16).to_be_bytes().to_vec(),
        S7DataType::Word => (rounded as u16).to_be_bytes().to_vec(),
        S7DataType::Dint => (rounded as i32).to_be_bytes().to_vec(),
        S7DataType::Dword => (rounded as u32).to_be_bytes().to_vec(),
        S7DataType::Real => (value as f32).to_be_bytes().to_vec(),
    }
}

fn apply_register_entries(
    entries: &[RegisterEntry],
    area: ModbusArea,
    image: &mut DeviceImage,
    elapsed_s: f64,
    state: &mut TickState,
    rng: &mut impl Rng,
) {
    for entry in entries {
        let key = StateKey::Modbus(area, entry.address);
        if entry.data_type.kind == RegisterTypeTag::String {
            if state.initialized.insert(key) {
                match &entry.text {
                    Some(text) => {
                        let regs = encode_string_registers(text, entry.data_type.length as u16);
                        image.modbus_write_registers(area, entry.address, &regs);
                    }
                    None => tracing::warn!(
                        address = entry.address,
                        "string register entry has no text, leaving unset"
                    ),
                }
            }
            continue;
        }

        let prior = state.prior.get(&key).copied();
        let value = plc_waveform::evaluate(&entry.waveform, elapsed_s, prior, rng);
        let sample = match value {
            WaveformValue::Number(n) => n,
            WaveformValue::Bool(b) => f64::from(u8::from(b)),
            WaveformValue::DoNotOverwrite => continue,
        };
        state.prior.insert(key, sample);

        match entry.data_type.kind {
            RegisterTypeTag::Int16 => {
                image.modbus_write_registers(area, entry.address, &[to_register(sample)]);
            }
            RegisterTypeTag::Float32 => {
                let regs = encode_f32_be(sample as f32);
                image.modbus_write_registers(area, entry.address, &regs);
            }
            RegisterTypeTag::String => unreachable!("handled above"),
        }
    }
}

fn apply_bool_entries(
    entries: &[BoolEntry],
    area: ModbusArea,
    image: &mut DeviceImage,
    elapsed_s: f64,
    state: &mut TickState,
    rng: &mut impl Rng,
) {
    for entry in entries {
        let key = StateKey::Modbus(area, entry.address);
        let prior = state.prior.get(&key).copied();
        let value = plc_waveform::evaluate(&entry.waveform, elapsed_s, prior, rng);
        match value {
            WaveformValue::Bool(b) => {
                state.prior.insert(key, f64::from(u8::from(b)));
                image.modbus_write_bool(area, entry.address, b);
            }
            WaveformValue::Number(n) => {
                state.prior.insert(key, n);
                image.modbus_write_bool(area, entry.address, n != 0.0);
            }
            WaveformValue::DoNotOverwrite => {}
        }
    }
}

fn apply_s7_entries(
    entries: &BTreeMap<u16, S7Entry>,
    area: S7Area,
    db_num: u16,
    image: &mut DeviceImage,
    elapsed_s: f64,
    state: &mut TickState,
    rng: &mut impl Rng,
) {
    for (&offset, entry) in entries {
        let key = StateKey::S7(area, db_num, offset);
        let prior = state.prior.get(&key).copied();
        let value = plc_waveform::evaluate(&entry.waveform, elapsed_s, prior, rng);
        let sample = match value {
            WaveformValue::Number(n) => n,
            WaveformValue::Bool(b) => f64::from(u8::from(b)),
            WaveformValue::DoNotOverwrite => continue,
        };
        state.prior.insert(key, sample);
        let bytes = encode_s7_value(sample, entry.data_type);
        image.s7_write(area, db_num, offset, &bytes);
    }
}

/// Advance one device's memory image by one tick.
///
/// Evaluates every entry in `spec` at `elapsed_s`, writes the results into
/// `image`, and finally runs the spec's post-hook (if any). Caller holds
/// whatever lock serializes `image` against concurrent protocol-emulator
/// access; this function itself does no locking.
pub fn tick(
    spec: &EffectiveSpec,
    image: &mut DeviceImage,
    elapsed_s: f64,
    state: &mut TickState,
    rng: &mut impl Rng,
) {
    apply_register_entries(
        &spec.holding_registers,
        ModbusArea::HoldingRegisters,
        image,
        elapsed_s,
        state,
        rng,
    );
    apply_register_entries(
        &spec.input_registers,
        ModbusArea::InputRegisters,
        image,
        elapsed_s,
        state,
        rng,
    );
    apply_bool_entries(&spec.coils, ModbusArea::Coils, image, elapsed_s, state, rng);
    apply_bool_entries(
        &spec.discrete_inputs,
        ModbusArea::DiscreteInputs,
        image,
        elapsed_s,
        state,
        rng,
    );
    for (&db_num, inner) in &spec.db {
        apply_s7_entries(inner, S7Area::Db, db_num, image, elapsed_s, state, rng);
    }
    apply_s7_entries(&spec.m, S7Area::M, 0, image, elapsed_s, state, rng);
    apply_s7_entries(&spec.i, S7Area::I, 0, image, elapsed_s, state, rng);
    apply_s7_entries(&spec.q, S7Area::Q, 0, image, elapsed_s, state, rng);

    if let Some(hook) = &spec.post_hook {
        run_post_hook(hook, image);
    }
}

/// Name of the registered PM5300 power-meter post-hook.
pub const PM5300_POST_HOOK: &str = "pm5300_command";

/// Run a named post-hook against a device's freshly updated image.
///
/// Post-hooks model vendor-specific device firmware behavior that goes
/// beyond plain waveform-driven registers. Unknown hook names are logged
/// and ignored rather than treated as fatal, since a device's profile may
/// reference a hook from a newer agent build.
fn run_post_hook(name: &str, image: &mut DeviceImage) {
    match name {
        PM5300_POST_HOOK => pm5300_command(image),
        other => tracing::warn!(hook = other, "unknown post-hook, skipping"),
    }
}

/// Schneider PM5300 power meter command-register emulation.
///
/// Triggered whenever a profile declares holding register 5000. Reads it
/// as a command code, services a reset-energy-counters command, a
/// clear-three-phase-voltage coil, and CT-primary-ratio rescaling of the
/// three current readings.
fn pm5300_command(image: &mut DeviceImage) {
    let command = image
        .modbus_read_registers(ModbusArea::HoldingRegisters, 5000, 1)
        .first()
        .copied()
        .unwrap_or(0);

    if command == 2020 {
        image.modbus_write_registers(ModbusArea::HoldingRegisters, 3200, &[0, 0]);
        image.modbus_write_registers(ModbusArea::HoldingRegisters, 5000, &[0]);
        image.modbus_write_registers(ModbusArea::HoldingRegisters, 5002, &[0]);
    }

    let reset_voltages = image
        .modbus_read_bools(ModbusArea::Coils, 0, 1)
        .first()
        .copied()
        .unwrap_or(false);
    if reset_voltages {
        for addr in [3020u16, 3022, 3024] {
            image.modbus_write_registers(ModbusArea::HoldingRegisters, addr, &[0, 0]);
        }
    }

    let ct_regs = image.modbus_read_registers(ModbusArea::HoldingRegisters, 2012, 2);
    let ct_primary = decode_f32_be(&ct_regs).max(f32::MIN_POSITIVE);
    if (ct_primary - 100.0).abs() > f32::EPSILON {
        let factor = ct_primary / 100.0;
        for addr in [3000u16, 3002, 3004] {
            let regs = image.modbus_read_registers(ModbusArea::HoldingRegisters, addr, 2);
            let current = decode_f32_be(&regs);
            let scaled = encode_f32_be(current * factor);
            image.modbus_write_registers(ModbusArea::HoldingRegisters, addr, &scaled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plc_profiles::{ModbusProfile, RegisterType};
    use plc_waveform::WaveformSpec;
    use rand::SeedableRng;

    fn rng() -> rand::rngs::StdRng {
        rand::rngs::StdRng::seed_from_u64(42)
    }

    #[test]
    fn resolve_overlay_wins_over_profile() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("base.json"),
            r#"{
                "name": "base",
                "modbus": {
                    "holding_registers": [
                        {"address": 0, "waveform": {"type": "fixed", "value": 1.0}}
                    ]
                }
            }"#,
        )
        .unwrap();
        let store = ProfileStore::load(tmp.path()).unwrap();

        let config = DeviceConfig {
            profile: Some("base".to_string()),
            modbus: Some(ModbusProfile {
                holding_registers: vec![RegisterEntry {
                    address: 0,
                    waveform: WaveformSpec::Fixed { value: 99.0 },
                    data_type: RegisterType::default(),
                    text: None,
                }],
                ..Default::default()
            }),
            s7: None,
        };

        let spec = resolve(&store, &config);
        assert_eq!(spec.holding_registers.len(), 1);
        assert_eq!(spec.holding_registers[0].waveform, WaveformSpec::Fixed { value: 99.0 });
    }

    #[test]
    fn resolve_falls_back_to_default_profile_when_device_is_bare() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("water_treatment.json"),
            r#"{
                "name": "water_treatment",
                "modbus": {
                    "holding_registers": [
                        {"address": 40001, "waveform": {"type": "fixed", "value": 7.0}}
                    ]
                }
            }"#,
        )
        .unwrap();
        let store = ProfileStore::load(tmp.path()).unwrap();

        let spec = resolve(&store, &DeviceConfig::default());
        assert_eq!(spec.holding_registers.len(), 1);
        assert_eq!(spec.holding_registers[0].address, 40001);
    }

    #[test]
    fn tick_writes_int16_and_float32_registers() {
        let spec = EffectiveSpec {
            holding_registers: vec![
                RegisterEntry {
                    address: 0,
                    waveform: WaveformSpec::Fixed { value: 42.0 },
                    data_type: RegisterType::default(),
                    text: None,
                },
                RegisterEntry {
                    address: 10,
                    waveform: WaveformSpec::Fixed { value: 3.5 },
                    data_type: RegisterType {
                        kind: RegisterTypeTag::Float32,
                        length: 0,
                    },
                    text: None,
                },
            ],
            ..Default::default()
        };
        let mut image = DeviceImage::new();
        let mut state = TickState::new();
        let mut r = rng();

        tick(&spec, &mut image, 0.0, &mut state, &mut r);

        assert_eq!(
            image.modbus_read_registers(ModbusArea::HoldingRegisters, 0, 1),
            vec![42]
        );
        let regs = image.modbus_read_registers(ModbusArea::HoldingRegisters, 10, 2);
        assert_eq!(decode_f32_be(&regs), 3.5f32);
    }

    #[test]
    fn tick_writes_string_once_and_never_again() {
        let spec = EffectiveSpec {
            holding_registers: vec![RegisterEntry {
                address: 0,
                waveform: WaveformSpec::Fixed { value: 0.0 },
                data_type: RegisterType {
                    kind: RegisterTypeTag::String,
                    length: 3,
                },
                text: Some("HELLO!".to_string()),
            }],
            ..Default::default()
        };
        let mut image = DeviceImage::new();
        let mut state = TickState::new();
        let mut r = rng();

        tick(&spec, &mut image, 0.0, &mut state, &mut r);
        let regs = image.modbus_read_registers(ModbusArea::HoldingRegisters, 0, 3);
        assert_eq!(regs, vec![0x4845, 0x4c4c, 0x4f21]);

        // Overwrite the cell directly, simulating an attacker write, then
        // tick again: the simulator must not clobber it back.
        image.modbus_write_registers(ModbusArea::HoldingRegisters, 0, &[0, 0, 0]);
        tick(&spec, &mut image, 1.0, &mut state, &mut r);
        assert_eq!(
            image.modbus_read_registers(ModbusArea::HoldingRegisters, 0, 3),
            vec![0, 0, 0]
        );
    }

    #[test]
    fn static_entry_seeds_once_then_never_overwritten() {
        let spec = EffectiveSpec {
            holding_registers: vec![RegisterEntry {
                address: 0,
                waveform: WaveformSpec::Static { initial: 55.0 },
                data_type: RegisterType::default(),
                text: None,
            }],
            ..Default::default()
        };
        let mut image = DeviceImage::new();
        let mut state = TickState::new();
        let mut r = rng();

        tick(&spec, &mut image, 0.0, &mut state, &mut r);
        assert_eq!(
            image.modbus_read_registers(ModbusArea::HoldingRegisters, 0, 1),
            vec![55]
        );

        image.modbus_write_registers(ModbusArea::HoldingRegisters, 0, &[7]);
        tick(&spec, &mut image, 1.0, &mut state, &mut r);
        assert_eq!(
            image.modbus_read_registers(ModbusArea::HoldingRegisters, 0, 1),
            vec![7]
        );
    }

    #[test]
    fn pm5300_hook_resets_energy_counters_on_command_2020() {
        let mut image = DeviceImage::new();
        image.modbus_write_registers(ModbusArea::HoldingRegisters, 5000, &[2020]);
        image.modbus_write_registers(ModbusArea::HoldingRegisters, 3200, &[11, 22]);
        image.modbus_write_registers(ModbusArea::HoldingRegisters, 2012, &encode_f32_be(100.0));

        run_post_hook(PM5300_POST_HOOK, &mut image);

        assert_eq!(
            image.modbus_read_registers(ModbusArea::HoldingRegisters, 3200, 2),
            vec![0, 0]
        );
        assert_eq!(
            image.modbus_read_registers(ModbusArea::HoldingRegisters, 5000, 1),
            vec![0]
        );
        assert_eq!(
            image.modbus_read_registers(ModbusArea::HoldingRegisters, 5002, 1),
            vec![0]
        );
    }

    #[test]
    fn pm5300_hook_rescales_currents_by_ct_ratio() {
        let mut image = DeviceImage::new();
        image.modbus_write_registers(ModbusArea::HoldingRegisters, 2012, &encode_f32_be(200.0));
        image.modbus_write_registers(ModbusArea::HoldingRegisters, 3000, &encode_f32_be(10.0));
        image.modbus_write_registers(ModbusArea::HoldingRegisters, 3002, &encode_f32_be(20.0));
        image.modbus_write_registers(ModbusArea::HoldingRegisters, 3004, &encode_f32_be(30.0));

        run_post_hook(PM5300_POST_HOOK, &mut image);

        let regs = image.modbus_read_registers(ModbusArea::HoldingRegisters, 3000, 2);
        assert_eq!(decode_f32_be(&regs), 20.0f32);
    }
}
