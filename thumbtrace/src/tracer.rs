//! The symbolic register-value tracer consumed as an external black box.
//!
//! The pipeline never implements register-level symbolic execution itself; resolving a
//! PC-switch's table source and computed target needs one, so the capability is abstracted
//! behind this trait. Production wiring supplies a real tracer; this crate's own tests
//! supply a minimal double.

use address::VirtAddr;
use decode::Register;

use crate::model::DisassemblyMap;

/// A snapshot of the 16 architectural registers, each either known or unknown.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct RegisterSnapshot {
    values: [Option<u32>; 16],
}

impl RegisterSnapshot {
    /// A snapshot in which every register is unknown.
    pub const EMPTY: Self = Self { values: [None; 16] };

    /// Returns the known value of `register`, if any.
    pub const fn get(&self, register: Register) -> Option<u32> {
        self.values[register.number() as usize]
    }

    /// Records a known value for `register`.
    pub fn set(&mut self, register: Register, value: u32) {
        self.values[register.number() as usize] = Some(value);
    }
}

/// A snapshot of the four condition flags (N, Z, C, V), each either known or unknown.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ConditionFlags {
    /// Negative flag.
    pub negative: Option<bool>,
    /// Zero flag.
    pub zero: Option<bool>,
    /// Carry flag.
    pub carry: Option<bool>,
    /// Overflow flag.
    pub overflow: Option<bool>,
}

/// The register-value tracer the Data/Code Separator consults to resolve indirect
/// PC-switch dispatch tables.
///
/// Mirrors the external contract exactly: given a start address, a set of stop addresses,
/// and initial register/flag state, symbolically execute forward (respecting or ignoring
/// conditional paths per `respect_path`) and report the register state at the first stop
/// address reached.
pub trait StrandTracer {
    /// Traces execution from `start` until one of `stop_addresses` is reached, returning
    /// the register snapshot at that point, or `None` if no stop address is ever reached.
    fn trace(
        &self,
        disassembly: &DisassemblyMap,
        start: VirtAddr,
        stop_addresses: &[VirtAddr],
        initial_registers: RegisterSnapshot,
        initial_flags: ConditionFlags,
        respect_path: bool,
    ) -> Option<RegisterSnapshot>;
}
