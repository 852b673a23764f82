//! Pipeline stage 6: the Cross-Reference & Terminator Annotator.

use address::VirtAddr;
use decode::{DecodedInstruction, Opcode, Operand, Register};

use crate::model::{Architecture, DisassemblyMap};
use crate::stages::util::{next_address, previous_address};

/// Resolves every branch target, annotates `xref_from`, threads `last_insn_address` forward,
/// and detects the ARMv7-M-only opcode set. Mutates `disassembly` in place and returns the
/// detected architecture.
pub fn annotate_cross_references(
    disassembly: &mut DisassemblyMap,
    code_start_address: VirtAddr,
    code_end_address: VirtAddr,
) -> Architecture {
    resolve_branch_targets(disassembly);
    thread_last_insn_address(disassembly, code_start_address, code_end_address);
    detect_architecture(disassembly, code_start_address, code_end_address)
}

fn resolve_branch_targets(disassembly: &mut DisassemblyMap) {
    let edges: Vec<(VirtAddr, VirtAddr)> = disassembly
        .iter()
        .filter_map(|(&address, slot)| {
            let insn = slot.insn.as_ref()?;
            if !insn.opcode.is_branch() {
                return None;
            }
            let target = resolve_target(disassembly, address, insn)?;
            if target == address {
                // A self-targeting idiom (`B .`), not a real call; Testable Property 10.
                return None;
            }
            is_plausible_target(disassembly, target, insn.opcode.is_call()).then_some((address, target))
        })
        .collect();

    for (source, target) in edges {
        if let Some(slot) = disassembly.get_mut(&target) {
            slot.xref_from.insert(source);
        }
    }
}

fn resolve_target(
    disassembly: &DisassemblyMap,
    address: VirtAddr,
    insn: &DecodedInstruction,
) -> Option<VirtAddr> {
    match insn.opcode {
        Opcode::B | Opcode::Bl => {
            let Some(Operand::Immediate(offset)) = insn.operands.as_slice().first() else {
                return None;
            };
            let pc = address.value().wrapping_add(4);
            Some(VirtAddr::new(pc.wrapping_add_signed(*offset)))
        }
        Opcode::Bx | Opcode::Blx => resolve_register_branch(disassembly, address, insn),
        _ => None,
    }
}

/// `BX`/`BLX Rx` resolves only when the immediately preceding slot is a PC-relative `LDR`
/// into the same register; the loaded value was already captured as a data slot's raw bytes
/// by the Data/Code Separator, so it is read back from there rather than from the image.
fn resolve_register_branch(
    disassembly: &DisassemblyMap,
    address: VirtAddr,
    insn: &DecodedInstruction,
) -> Option<VirtAddr> {
    let Some(Operand::Register(register)) = insn.operands.as_slice().first() else {
        return None;
    };
    let previous = previous_address(disassembly, address)?;
    let prev_insn = disassembly.get(&previous)?.insn.as_ref()?;
    if prev_insn.opcode != Opcode::Ldr {
        return None;
    }
    let Some(Operand::Register(dest)) = prev_insn.operands.as_slice().first() else {
        return None;
    };
    if dest != register {
        return None;
    }
    let Some(Operand::Memory {
        base: Register::Pc,
        displacement,
        ..
    }) = prev_insn.operands.as_slice().get(1)
    else {
        return None;
    };
    let pc = previous.strict_add(4).align_down(4);
    let load_address = VirtAddr::new(pc.value().wrapping_add_signed(*displacement));
    let raw = read_data_u32(disassembly, load_address)?;
    Some(VirtAddr::from_thumb_pointer(raw))
}

/// Reassembles a 4-byte little-endian data value from two adjacent 2-byte data slots.
fn read_data_u32(disassembly: &DisassemblyMap, address: VirtAddr) -> Option<u32> {
    let low = disassembly.get(&address)?;
    let high = disassembly.get(&address.strict_add(2))?;
    if !low.is_data || !high.is_data {
        return None;
    }
    let low_bytes = low.raw_bytes.as_slice();
    let high_bytes = high.raw_bytes.as_slice();
    if low_bytes.len() < 2 || high_bytes.len() < 2 {
        return None;
    }
    Some(u32::from_le_bytes([low_bytes[0], low_bytes[1], high_bytes[0], high_bytes[1]]))
}

fn is_plausible_target(disassembly: &DisassemblyMap, target: VirtAddr, is_call: bool) -> bool {
    let Some(slot) = disassembly.get(&target) else {
        return false;
    };
    if slot.is_data {
        return false;
    }
    let Some(insn) = &slot.insn else {
        return false;
    };
    if is_call && matches!(insn.opcode, Opcode::Pop | Opcode::Bl | Opcode::Blx | Opcode::Bx) {
        return false;
    }
    if is_call && insn.opcode == Opcode::B && !insn.condition.is_always() {
        return false;
    }
    true
}

fn thread_last_insn_address(
    disassembly: &mut DisassemblyMap,
    code_start_address: VirtAddr,
    code_end_address: VirtAddr,
) {
    let mut last = None;
    let mut cursor = Some(code_start_address);
    while let Some(address) = cursor {
        if address > code_end_address {
            break;
        }
        if let Some(slot) = disassembly.get_mut(&address) {
            slot.last_insn_address = last;
            if let Some(insn) = &slot.insn
                && !is_nop_or_self_mov(insn)
            {
                last = Some(address);
            }
        }
        cursor = next_address(disassembly, address);
    }
}

fn is_nop_or_self_mov(insn: &DecodedInstruction) -> bool {
    if insn.opcode == Opcode::Nop {
        return true;
    }
    matches!(
        insn.operands.as_slice(),
        [Operand::Register(a), Operand::Register(b)] if insn.opcode == Opcode::Mov && a == b
    )
}

fn detect_architecture(
    disassembly: &DisassemblyMap,
    code_start_address: VirtAddr,
    code_end_address: VirtAddr,
) -> Architecture {
    let found = disassembly
        .range(code_start_address..=code_end_address)
        .filter_map(|(_, slot)| slot.insn.as_ref())
        .any(|insn| matches!(insn.opcode, Opcode::Udiv | Opcode::Tbb | Opcode::Tbh));

    if found { Architecture::ArmV7M } else { Architecture::ArmV6M }
}

#[cfg(test)]
mod test {
    use decode::ThumbDecoder;
    use image::Image;

    use super::*;
    use crate::stages::disassemble::linear_disassemble;

    #[test]
    fn direct_branch_populates_xref_from() {
        // B #0 at address 0 targets address+4+0 = 4 (Thumb PC bias); NOP at 2 is just filler
        // between the branch and its landing site, BX LR at 4.
        let bytes = [0x00, 0xE0, 0x00, 0xBF, 0x70, 0x47];
        let image = Image::new(&bytes);
        let mut map = linear_disassemble(&image, 0, &ThumbDecoder);

        annotate_cross_references(&mut map, VirtAddr::new(0), VirtAddr::new(4));

        let target = &map[&VirtAddr::new(4)];
        assert!(target.xref_from.contains(&VirtAddr::new(0)));
    }

    #[test]
    fn self_targeting_branch_has_no_self_xref() {
        // B . (E7FE)
        let bytes = [0xFE, 0xE7];
        let image = Image::new(&bytes);
        let mut map = linear_disassemble(&image, 0, &ThumbDecoder);

        annotate_cross_references(&mut map, VirtAddr::new(0), VirtAddr::new(0));

        assert!(map[&VirtAddr::new(0)].xref_from.is_empty());
    }

    #[test]
    fn call_landing_on_pop_is_rejected() {
        // BL +2 ; POP {R4}
        let bytes = [0x00, 0xF0, 0x00, 0xF8, 0x10, 0xBC];
        let image = Image::new(&bytes);
        let mut map = linear_disassemble(&image, 0, &ThumbDecoder);

        annotate_cross_references(&mut map, VirtAddr::new(0), VirtAddr::new(4));

        assert!(map[&VirtAddr::new(4)].xref_from.is_empty());
    }

    #[test]
    fn last_insn_address_skips_nop_and_self_mov() {
        // NOP ; MOV R1, R1 ; MOVS R0, #1
        let bytes = [0x00, 0xBF, 0x09, 0x46, 0x01, 0x20];
        let image = Image::new(&bytes);
        let mut map = linear_disassemble(&image, 0, &ThumbDecoder);

        annotate_cross_references(&mut map, VirtAddr::new(0), VirtAddr::new(4));

        assert_eq!(map[&VirtAddr::new(0)].last_insn_address, None);
        assert_eq!(map[&VirtAddr::new(2)].last_insn_address, None);
        assert_eq!(map[&VirtAddr::new(4)].last_insn_address, None);
    }

    #[test]
    fn architecture_detection_flags_tbb() {
        let bytes = [0x00, 0xE8, 0xD0, 0xF0];
        let image = Image::new(&bytes);
        let map = linear_disassemble(&image, 0, &ThumbDecoder);

        let architecture = detect_architecture(&map, VirtAddr::new(0), VirtAddr::new(0));
        assert_eq!(architecture, Architecture::ArmV7M);
    }

    #[test]
    fn architecture_defaults_to_v6m_without_sentinel_opcodes() {
        let bytes = [0x70, 0x47];
        let image = Image::new(&bytes);
        let map = linear_disassemble(&image, 0, &ThumbDecoder);

        let architecture = detect_architecture(&map, VirtAddr::new(0), VirtAddr::new(0));
        assert_eq!(architecture, Architecture::ArmV6M);
    }
}
