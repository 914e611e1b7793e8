//! Per-device memory images for the emulated Modbus and S7 address spaces.
//!
//! A [`DeviceImage`] is mutated by exactly two writers — the simulation
//! tick and the protocol emulator's request handler — and must be
//! serialized per device. Callers wrap one in `Arc<std::sync::Mutex<_>>`;
//! this crate only owns the storage and the read/write semantics, not the
//! locking strategy.

use std::collections::HashMap;

/// Which Modbus table an access targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModbusArea {
    /// Read/write 16-bit registers (function codes 3/6/16).
    HoldingRegisters,
    /// Read-only 16-bit registers (function code 4).
    InputRegisters,
    /// Read/write single-bit coils (function codes 1/5/15).
    Coils,
    /// Read-only single-bit discrete inputs (function code 2).
    DiscreteInputs,
}

/// Which S7 memory area an access targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S7Area {
    /// A data block, addressed by DB number.
    Db,
    /// Merker (flag memory), 64 KiB flat.
    M,
    /// Process image input, 64 KiB flat.
    I,
    /// Process image output, 64 KiB flat.
    Q,
}

const S7_FLAT_AREA_SIZE: usize = 65_536;

/// Sparse 16-bit register table; unwritten addresses read as zero.
#[derive(Debug, Clone, Default)]
struct RegisterTable(HashMap<u16, u16>);

impl RegisterTable {
    fn read(&self, addr: u16, count: u16) -> Vec<u16> {
        (0..count)
            .map(|i| self.0.get(&addr.wrapping_add(i)).copied().unwrap_or(0))
            .collect()
    }

    fn write(&mut self, addr: u16, value: u16) {
        self.0.insert(addr, value);
    }

    fn write_many(&mut self, addr: u16, values: &[u16]) {
        for (i, value) in values.iter().enumerate() {
            self.0.insert(addr.wrapping_add(i as u16), *value);
        }
    }
}

/// Sparse bit table; unwritten addresses read as false.
#[derive(Debug, Clone, Default)]
struct BoolTable(HashMap<u16, bool>);

impl BoolTable {
    fn read(&self, addr: u16, count: u16) -> Vec<bool> {
        (0..count)
            .map(|i| self.0.get(&addr.wrapping_add(i)).copied().unwrap_or(false))
            .collect()
    }

    fn write(&mut self, addr: u16, value: bool) {
        self.0.insert(addr, value);
    }

    fn write_many(&mut self, addr: u16, values: &[bool]) {
        for (i, value) in values.iter().enumerate() {
            self.0.insert(addr.wrapping_add(i as u16), *value);
        }
    }
}

/// The Modbus half of a device's memory image.
#[derive(Debug, Clone, Default)]
struct ModbusImage {
    holding_registers: RegisterTable,
    input_registers: RegisterTable,
    coils: BoolTable,
    discrete_inputs: BoolTable,
}

/// A fixed 64 KiB flat byte area (M, I, or Q).
#[derive(Debug, Clone)]
struct FlatArea(Vec<u8>);

impl Default for FlatArea {
    fn default() -> Self {
        Self(vec![0u8; S7_FLAT_AREA_SIZE])
    }
}

impl FlatArea {
    fn read(&self, offset: u16, length: u16) -> Vec<u8> {
        let start = offset as usize;
        let end = (start + length as usize).min(self.0.len());
        if start >= self.0.len() {
            return vec![0u8; length as usize];
        }
        let mut out = self.0[start..end].to_vec();
        out.resize(length as usize, 0);
        out
    }

    fn write(&mut self, offset: u16, bytes: &[u8]) {
        let start = offset as usize;
        if start >= self.0.len() {
            return;
        }
        let end = (start + bytes.len()).min(self.0.len());
        let take = end - start;
        self.0[start..end].copy_from_slice(&bytes[..take]);
    }
}

/// The S7 half of a device's memory image.
#[derive(Debug, Clone, Default)]
struct S7Image {
    db: HashMap<u16, Vec<u8>>,
    m: FlatArea,
    i: FlatArea,
    q: FlatArea,
}

impl S7Image {
    fn read(&self, area: S7Area, db_num: u16, offset: u16, length: u16) -> Vec<u8> {
        match area {
            S7Area::Db => {
                let Some(buf) = self.db.get(&db_num) else {
                    return vec![0u8; length as usize];
                };
                let start = offset as usize;
                if start >= buf.len() {
                    return vec![0u8; length as usize];
                }
                let end = (start + length as usize).min(buf.len());
                let mut out = buf[start..end].to_vec();
                out.resize(length as usize, 0);
                out
            }
            S7Area::M => self.m.read(offset, length),
            S7Area::I => self.i.read(offset, length),
            S7Area::Q => self.q.read(offset, length),
        }
    }

    fn write(&mut self, area: S7Area, db_num: u16, offset: u16, bytes: &[u8]) {
        match area {
            S7Area::Db => {
                let buf = self.db.entry(db_num).or_default();
                let needed = offset as usize + bytes.len();
                if buf.len() < needed {
                    buf.resize(needed, 0);
                }
                buf[offset as usize..needed].copy_from_slice(bytes);
            }
            S7Area::M => self.m.write(offset, bytes),
            S7Area::I => self.i.write(offset, bytes),
            S7Area::Q => self.q.write(offset, bytes),
        }
    }
}

/// One emulated device's full memory image: Modbus tables plus S7 areas.
///
/// Created when a device starts, discarded when it stops or is
/// reconfigured. Not internally synchronized — wrap in `Arc<Mutex<_>>` to
/// share between the simulation tick and the protocol emulator.
#[derive(Debug, Clone, Default)]
pub struct DeviceImage {
    modbus: ModbusImage,
    s7: S7Image,
}

impl DeviceImage {
    /// Create a fresh, all-zero image.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `count` consecutive 16-bit registers from `area`, starting at
    /// `addr`. `area` must be [`ModbusArea::HoldingRegisters`] or
    /// [`ModbusArea::InputRegisters`].
    #[must_use]
    pub fn modbus_read_registers(&self, area: ModbusArea, addr: u16, count: u16) -> Vec<u16> {
        match area {
            ModbusArea::HoldingRegisters => self.modbus.holding_registers.read(addr, count),
            ModbusArea::InputRegisters => self.modbus.input_registers.read(addr, count),
            ModbusArea::Coils | ModbusArea::DiscreteInputs => {
                tracing::warn!(?area, "register read against a bit area, returning empty");
                Vec::new()
            }
        }
    }

    /// Write a single register. `area` must be
    /// [`ModbusArea::HoldingRegisters`]; writes to read-only areas are
    /// ignored.
    pub fn modbus_write_register(&mut self, area: ModbusArea, addr: u16, value: u16) {
        if area == ModbusArea::HoldingRegisters {
            self.modbus.holding_registers.write(addr, value);
        } else {
            tracing::warn!(?area, "ignoring register write against a non-writable area");
        }
    }

    /// Write consecutive registers starting at `addr`.
    pub fn modbus_write_registers(&mut self, area: ModbusArea, addr: u16, values: &[u16]) {
        if area == ModbusArea::HoldingRegisters {
            self.modbus.holding_registers.write_many(addr, values);
        } else {
            tracing::warn!(?area, "ignoring register write against a non-writable area");
        }
    }

    /// Read `count` consecutive bits from `area`, starting at `addr`.
    /// `area` must be [`ModbusArea::Coils`] or
    /// [`ModbusArea::DiscreteInputs`].
    #[must_use]
    pub fn modbus_read_bools(&self, area: ModbusArea, addr: u16, count: u16) -> Vec<bool> {
        match area {
            ModbusArea::Coils => self.modbus.coils.read(addr, count),
            ModbusArea::DiscreteInputs => self.modbus.discrete_inputs.read(addr, count),
            ModbusArea::HoldingRegisters | ModbusArea::InputRegisters => {
                tracing::warn!(?area, "bool read against a register area, returning empty");
                Vec::new()
            }
        }
    }

    /// Write a single bit. `area` must be [`ModbusArea::Coils`].
    pub fn modbus_write_bool(&mut self, area: ModbusArea, addr: u16, value: bool) {
        if area == ModbusArea::Coils {
            self.modbus.coils.write(addr, value);
        } else {
            tracing::warn!(?area, "ignoring bool write against a non-writable area");
        }
    }

    /// Write consecutive bits starting at `addr`.
    pub fn modbus_write_bools(&mut self, area: ModbusArea, addr: u16, values: &[bool]) {
        if area == ModbusArea::Coils {
            self.modbus.coils.write_many(addr, values);
        } else {
            tracing::warn!(?area, "ignoring bool write against a non-writable area");
        }
    }

    /// Read `length` bytes from an S7 area. Out-of-range reads return
    /// zero-filled bytes rather than an error, matching how a real S7 PLC
    /// silently returns default-valued memory.
    #[must_use]
    pub fn s7_read(&self, area: S7Area, db_num: u16, offset: u16, length: u16) -> Vec<u8> {
        self.s7.read(area, db_num, offset, length)
    }

    /// Write bytes into an S7 area. `DB` buffers expand to fit; writes
    /// past the end of the fixed 64 KiB `M`/`I`/`Q` areas are silently
    /// truncated.
    pub fn s7_write(&mut self, area: S7Area, db_num: u16, offset: u16, bytes: &[u8]) {
        self.s7.write(area, db_num, offset, bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwritten_registers_read_zero() {
        let image = DeviceImage::new();
        assert_eq!(
            image.modbus_read_registers(ModbusArea::HoldingRegisters, 0, 4),
            vec![0, 0, 0, 0]
        );
        assert_eq!(
            image.modbus_read_bools(ModbusArea::Coils, 0, 3),
            vec![false, false, false]
        );
    }

    #[test]
    fn register_round_trip() {
        let mut image = DeviceImage::new();
        image.modbus_write_registers(ModbusArea::HoldingRegisters, 10, &[1, 2, 3]);
        assert_eq!(
            image.modbus_read_registers(ModbusArea::HoldingRegisters, 10, 3),
            vec![1, 2, 3]
        );
        // Input registers are untouched.
        assert_eq!(
            image.modbus_read_registers(ModbusArea::InputRegisters, 10, 3),
            vec![0, 0, 0]
        );
    }

    #[test]
    fn s7_db_expands_on_write() {
        let mut image = DeviceImage::new();
        image.s7_write(S7Area::Db, 1, 100, &[1, 2, 3, 4]);
        assert_eq!(image.s7_read(S7Area::Db, 1, 100, 4), vec![1, 2, 3, 4]);
        // Untouched DB number reads as zero-filled.
        assert_eq!(image.s7_read(S7Area::Db, 2, 0, 4), vec![0, 0, 0, 0]);
    }

    #[test]
    fn s7_db_out_of_range_read_is_zero_filled() {
        let mut image = DeviceImage::new();
        image.s7_write(S7Area::Db, 1, 0, &[9, 9]);
        // Reading past what was ever written still returns a full-length buffer.
        assert_eq!(image.s7_read(S7Area::Db, 1, 0, 10), {
            let mut expected = vec![9, 9];
            expected.resize(10, 0);
            expected
        });
    }

    #[test]
    fn s7_flat_area_write_past_end_is_truncated_silently() {
        let mut image = DeviceImage::new();
        // Writing near the end of M should not panic even if the slice
        // would overrun the fixed 64 KiB buffer.
        image.s7_write(S7Area::M, 0, 65_534, &[1, 2, 3, 4]);
        assert_eq!(image.s7_read(S7Area::M, 0, 65_534, 2), vec![1, 2]);
    }

    #[test]
    fn s7_flat_area_read_past_end_returns_zero() {
        let image = DeviceImage::new();
        let bytes = image.s7_read(S7Area::I, 0, 70_000, 4);
        assert_eq!(bytes, vec![0, 0, 0, 0]);
    }
}
