//! Pipeline stage 2: the Code-Base Estimator.

use std::collections::HashMap;

use address::{FileOffset, VirtAddr};
use decode::{Decoder, Opcode, Operand, Register};
use image::Image;
use image::vector_table::VectorTable;

use crate::model::DisassemblyMap;
use crate::stages::disassemble::linear_disassemble;

/// Scans the image for a default-handler value: the interrupt-handler address that recurs
/// most often in the vector table, or (failing that) a plausible handler found by scanning
/// vector slots past the declared minimum.
fn estimate_default_handler(image: &Image<'_>, vector_table: &VectorTable) -> Option<u32> {
    let mut candidates: Vec<u32> = vector_table
        .interrupt_handler_addresses()
        .map(VirtAddr::value)
        .collect();

    if let Some(value) = most_common_with_count_at_least_2(&candidates) {
        return Some(value);
    }

    if candidates.is_empty() {
        return None;
    }
    let min_value = candidates.iter().copied().min()?;
    let max_value = candidates.iter().copied().max()?;
    let file_size = usize_to_u32(image.len());

    let mut address = 0x3Cu32;
    while address < 0x400 {
        let Ok(entry) = image.read_u32(FileOffset::new(address)) else {
            break;
        };
        if entry == 0 || entry == 0xFFFF_FFFF {
            address += 4;
            continue;
        }
        if entry.is_multiple_of(2) {
            break;
        }
        if entry < min_value && max_value.wrapping_sub(entry) > file_size {
            break;
        }
        if entry > max_value && entry.wrapping_sub(min_value) > file_size {
            break;
        }
        candidates.push(entry.wrapping_sub(1));
        address += 4;
    }

    most_common_with_count_at_least_2(&candidates)
}

fn most_common_with_count_at_least_2(values: &[u32]) -> Option<u32> {
    let mut counts: HashMap<u32, u32> = HashMap::new();
    for &value in values {
        *counts.entry(value).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .filter(|&(_, count)| count > 1)
        .max_by_key(|&(_, count)| count)
        .map(|(value, _)| value)
}

fn usize_to_u32(value: usize) -> u32 {
    conversion::usize_to_u32_truncating(value)
}

/// Scans `map` (disassembled assuming code base 0) for self-targeting branch idioms,
/// returning their raw file offsets in ascending order.
fn populate_self_targeting_branches(map: &DisassemblyMap, image: &Image<'_>) -> Vec<u32> {
    let mut branches = Vec::new();

    for (&address, slot) in map {
        let Some(insn) = &slot.insn else { continue };
        match insn.opcode {
            Opcode::B | Opcode::Bl => {
                if let Some(Operand::Immediate(offset)) = insn.operands.as_slice().first() {
                    let target = address.value().wrapping_add(4).wrapping_add_signed(*offset);
                    if target == address.value() {
                        branches.push(target);
                    }
                }
            }
            Opcode::Bx => {
                let Some(Operand::Register(register)) = insn.operands.as_slice().first() else {
                    continue;
                };
                if register.is_lr() {
                    continue;
                }
                let Some(ldr_address) = address.checked_sub(2) else {
                    continue;
                };
                let Some(ldr_slot) = map.get(&ldr_address) else {
                    continue;
                };
                let Some(ldr_insn) = &ldr_slot.insn else {
                    continue;
                };
                if ldr_insn.opcode != Opcode::Ldr {
                    continue;
                }
                let Some(Operand::Memory {
                    base: Register::Pc,
                    displacement,
                    ..
                }) = ldr_insn.operands.as_slice().get(1)
                else {
                    continue;
                };
                let pc_value = ldr_address.value().wrapping_add(4) & !0b11;
                let load_target = pc_value.wrapping_add_signed(*displacement);
                let Ok(data) = image.read_u32(FileOffset::new(load_target)) else {
                    continue;
                };
                let target_branch = data.wrapping_sub(1);
                if (target_branch & 0xFFF) == (address.value() & 0xFFF) {
                    branches.push(address.value());
                }
            }
            _ => {}
        }
    }

    branches.sort_unstable();
    branches
}

/// Finds every `(interrupt_handler, self_branch)` pair whose low `hex_digits` hex digits
/// match, yielding `interrupt_handler - self_branch` as a candidate base, filtered to those
/// for which `reset` would fall within `[base, base + image_size)`.
fn estimate_code_base(
    interrupt_handlers: &[u32],
    self_targeting_branches: &[u32],
    hex_digits: u32,
    reset_address: u32,
    image_size: u32,
) -> Vec<u32> {
    let mask = (1u32 << (hex_digits * 4)) - 1;
    let mut candidates = Vec::new();

    for &handler in interrupt_handlers {
        for &branch in self_targeting_branches {
            if (branch & mask) != (handler & mask) {
                continue;
            }
            let Some(base) = handler.checked_sub(branch) else {
                continue;
            };
            let max_range = base.wrapping_add(image_size);
            if reset_address < base || reset_address > max_range {
                continue;
            }
            candidates.push(base);
        }
    }

    candidates
}

/// Estimates the absolute load address of the image (stage 4.2 in full).
///
/// Returns `None` if no candidate base places `reset` inside `[base, base + image_size)`.
pub fn estimate_app_code_base(
    image: &Image<'_>,
    vector_table: &VectorTable,
    decoder: &dyn Decoder,
) -> Option<u32> {
    let base_zero_map = linear_disassemble(image, 0, decoder);

    let mut interrupt_handlers: Vec<u32> = vector_table
        .interrupt_handler_addresses()
        .map(VirtAddr::value)
        .collect();

    let default_handler = estimate_default_handler(image, vector_table);
    if let Some(handler) = default_handler {
        if !interrupt_handlers.contains(&handler) {
            interrupt_handlers.push(handler);
        }
    }

    let self_targeting_branches = populate_self_targeting_branches(&base_zero_map, image);
    if self_targeting_branches.is_empty() {
        log::debug!("no self-targeting branches found; app code base cannot be determined");
    }

    let reset_address = vector_table.reset().value();
    let image_size = usize_to_u32(image.len());

    let mut candidates = estimate_code_base(
        &interrupt_handlers,
        &self_targeting_branches,
        3,
        reset_address,
        image_size,
    );
    if candidates.is_empty() {
        log::trace!("trying lower accuracy app code base estimation");
        candidates = estimate_code_base(
            &interrupt_handlers,
            &self_targeting_branches,
            2,
            reset_address,
            image_size,
        );
    }

    let app_code_base = resolve_candidate(
        &candidates,
        default_handler,
        &self_targeting_branches,
        reset_address,
        image_size,
    )?;

    if reset_address < app_code_base || reset_address >= app_code_base.wrapping_add(image_size) {
        log::debug!("app code base does not include reset handler");
        return None;
    }

    log::info!("app code base estimated as {app_code_base:#010x}");
    Some(app_code_base)
}

fn resolve_candidate(
    candidates: &[u32],
    default_handler: Option<u32>,
    self_targeting_branches: &[u32],
    reset_address: u32,
    image_size: u32,
) -> Option<u32> {
    let mut counts: HashMap<u32, u32> = HashMap::new();
    for &candidate in candidates {
        *counts.entry(candidate).or_insert(0) += 1;
    }

    match counts.len() {
        0 => None,
        1 => counts.into_keys().next(),
        _ => {
            log::warn!("more than one possibility for app code base");
            if let Some((&value, _)) = counts.iter().max_by_key(|&(_, &count)| count) {
                let max_count = counts[&value];
                if max_count > 1 {
                    return Some(value);
                }
            }
            let handler = default_handler?;
            let mut tie_break =
                estimate_code_base(&[handler], self_targeting_branches, 3, reset_address, image_size);
            if tie_break.is_empty() {
                tie_break = estimate_code_base(
                    &[handler],
                    self_targeting_branches,
                    2,
                    reset_address,
                    image_size,
                );
            }
            let mut tie_counts: HashMap<u32, u32> = HashMap::new();
            for value in tie_break {
                *tie_counts.entry(value).or_insert(0) += 1;
            }
            tie_counts
                .into_iter()
                .max_by_key(|&(_, count)| count)
                .map(|(value, _)| value)
        }
    }
}

#[cfg(test)]
mod test {
    use decode::ThumbDecoder;
    use image::Image;
    use image::vector_table::read_vector_table;

    use super::estimate_app_code_base;

    #[test]
    fn recovers_nonzero_code_base_from_self_targeting_branch() {
        // Vector table: initial_sp, reset=0x08000101, hard_fault=0x08000121 repeated.
        let mut bytes = vec![0u8; 0x130];
        bytes[0..4].copy_from_slice(&0x2000_0400u32.to_le_bytes());
        bytes[4..8].copy_from_slice(&0x0800_0101u32.to_le_bytes());
        for offset in [0x0Cusize, 0x10, 0x14, 0x18, 0x2C, 0x30, 0x38] {
            bytes[offset..offset + 4].copy_from_slice(&0x0800_0121u32.to_le_bytes());
        }
        // Self-branch `B .` (E7FE) at file offset 0x120.
        bytes[0x120..0x122].copy_from_slice(&0xE7FEu16.to_le_bytes());

        let image = Image::new(&bytes);
        let vector_table = read_vector_table(&image).unwrap();
        let base = estimate_app_code_base(&image, &vector_table, &ThumbDecoder);

        assert_eq!(base, Some(0x0800_0000));
    }

    #[test]
    fn zero_base_is_recovered_when_branch_already_matches() {
        let mut bytes = vec![0u8; 0x130];
        bytes[0..4].copy_from_slice(&0x2000_0400u32.to_le_bytes());
        bytes[4..8].copy_from_slice(&0x0000_0101u32.to_le_bytes());
        for offset in [0x0Cusize, 0x10, 0x14, 0x18, 0x2C, 0x30, 0x38] {
            bytes[offset..offset + 4].copy_from_slice(&0x0000_0121u32.to_le_bytes());
        }
        bytes[0x120..0x122].copy_from_slice(&0xE7FEu16.to_le_bytes());

        let image = Image::new(&bytes);
        let vector_table = read_vector_table(&image).unwrap();
        let base = estimate_app_code_base(&image, &vector_table, &ThumbDecoder);

        assert_eq!(base, Some(0));
    }
}
