//! Small traversal helpers shared by the Data/Code Separator and the Cross-Reference pass.
//!
//! Both stages walk the disassembly map by decode head rather than by fixed 2-byte stride,
//! since a 4-byte instruction's second halfword is never a key of [`DisassemblyMap`]. Using
//! `BTreeMap::range` here means a table or instruction of any width is skipped correctly
//! without either stage needing to track instruction lengths itself.

use std::ops::Bound;

use address::VirtAddr;

use crate::model::DisassemblyMap;

/// Returns the smallest key in `map` strictly greater than `address`, if any.
pub fn next_address(map: &DisassemblyMap, address: VirtAddr) -> Option<VirtAddr> {
    map.range((Bound::Excluded(address), Bound::Unbounded))
        .next()
        .map(|(&key, _)| key)
}

/// Returns the largest key in `map` strictly less than `address`, if any.
pub fn previous_address(map: &DisassemblyMap, address: VirtAddr) -> Option<VirtAddr> {
    map.range((Bound::Unbounded, Bound::Excluded(address)))
        .next_back()
        .map(|(&key, _)| key)
}

/// Returns `true` if `address` is a decode head holding a (not yet reclassified) instruction.
pub fn is_valid_code_address(map: &DisassemblyMap, address: VirtAddr) -> bool {
    map.get(&address).is_some_and(|slot| slot.insn.is_some())
}
