//! Pipeline stage 3: the Linear Disassembler.

use address::{FileOffset, VirtAddr};
use conversion::{u32_to_usize, usize_to_u32_truncating};
use decode::{DecodeError, Decoder, Opcode};
use image::Image;

use crate::model::{DecodedSlot, DisassemblyMap, RawBytes};

/// Performs an initial byte-by-byte Thumb decode of the entire image, starting at
/// `app_code_base`, then repairs decoder misinterpretations before returning.
///
/// Every offset that fails to decode (fewer than 2 bytes remaining) is stored as a
/// single-byte data slot rather than halting, matching the decoder's skip-data mode.
pub fn linear_disassemble(
    image: &Image<'_>,
    app_code_base: u32,
    decoder: &dyn Decoder,
) -> DisassemblyMap {
    let mut map = DisassemblyMap::new();
    let len = usize_to_u32_truncating(image.len());
    let mut offset = 0u32;

    while offset < len {
        let window = u32_to_usize((len - offset).min(4));
        let bytes = image
            .read_slice(FileOffset::new(offset), window)
            .expect("offset is within image bounds by loop invariant");

        let address = VirtAddr::new(app_code_base.wrapping_add(offset));
        match decoder.decode(bytes) {
            Ok(insn) => {
                let length = u32::from(insn.length);
                let raw = RawBytes::from_slice(&bytes[..u32_to_usize(length)]);
                map.insert(address, DecodedSlot::code(insn, raw));
                offset += length;
            }
            Err(DecodeError::Truncated) => {
                let mut slot = DecodedSlot::code(
                    decode::DecodedInstruction::new(
                        Opcode::ByteLiteral,
                        1,
                        decode::OperandList::EMPTY,
                    ),
                    RawBytes::from_slice(&bytes[..1]),
                );
                slot.mark_data();
                map.insert(address, slot);
                offset += 1;
            }
        }
    }

    repair_misinterpretations(&mut map, image, app_code_base, decoder);
    map
}

/// Repairs 32-bit decodes this decoder could not recognize.
///
/// The original tool's trigger is a mnemonic beginning with `v` (Capstone decoding stray
/// `0xff` bytes as a NEON/VFP instruction); this decoder does not implement the
/// coprocessor encoding space at all, so every such stray byte run already decodes as
/// [`Opcode::Invalid`] at length 4. The same repair is applied to that broader condition,
/// inserting every overlapping sliding-window interpretation the original produces so later
/// passes can choose based on branch reachability:
/// - the 2 bytes at the original address, decoded alone;
/// - the 2 bytes at `address + 2`, decoded alone;
/// - the 2 bytes at `address + 2` joined with the first 2 bytes of the following slot,
///   decoded as a second, overlapping 4-byte instruction at `address + 2`.
fn repair_misinterpretations(
    map: &mut DisassemblyMap,
    image: &Image<'_>,
    app_code_base: u32,
    decoder: &dyn Decoder,
) {
    let suspect: Vec<VirtAddr> = map
        .iter()
        .filter(|(_, slot)| {
            slot.insn
                .as_ref()
                .is_some_and(|insn| insn.opcode == Opcode::Invalid && insn.length == 4)
        })
        .map(|(address, _)| *address)
        .collect();

    for address in suspect {
        let offset = address.value().wrapping_sub(app_code_base);
        let Ok(first_half) = image.read_slice(FileOffset::new(offset), 2) else {
            continue;
        };
        if let Ok(insn) = decoder.decode(first_half) {
            map.insert(address, DecodedSlot::code(insn, RawBytes::from_slice(first_half)));
        }

        let second_offset = offset.wrapping_add(2);
        let Ok(second_half) = image.read_slice(FileOffset::new(second_offset), 2) else {
            continue;
        };
        let second_address = VirtAddr::new(app_code_base.wrapping_add(second_offset));
        if let Ok(insn) = decoder.decode(second_half) {
            map.insert(
                second_address,
                DecodedSlot::code(insn, RawBytes::from_slice(second_half)),
            );
        }

        // Overlapping interpretation: the second half joined with the next slot's bytes,
        // as a single 4-byte instruction starting at `address + 2`.
        let Ok(overlapping) = image.read_slice(FileOffset::new(second_offset), 4) else {
            continue;
        };
        if let Ok(insn) = decoder.decode(overlapping)
            && insn.length == 4
        {
            map.insert(
                second_address,
                DecodedSlot::code(insn, RawBytes::from_slice(overlapping)),
            );
        }
    }
}

#[cfg(test)]
mod test {
    use decode::ThumbDecoder;

    use super::linear_disassemble;

    #[test]
    fn decodes_a_simple_instruction_stream() {
        // MOVS R0, #5 ; BX LR
        let bytes = [0x05, 0x20, 0x70, 0x47];
        let image = image::Image::new(&bytes);
        let map = linear_disassemble(&image, 0, &ThumbDecoder);

        assert_eq!(map.len(), 2);
        assert!(!map[&address::VirtAddr::new(0)].is_data);
        assert!(!map[&address::VirtAddr::new(2)].is_data);
    }

    #[test]
    fn trailing_odd_byte_becomes_a_data_slot() {
        let bytes = [0x05, 0x20, 0xFF];
        let image = image::Image::new(&bytes);
        let map = linear_disassemble(&image, 0, &ThumbDecoder);

        let tail = &map[&address::VirtAddr::new(2)];
        assert!(tail.is_data);
    }

    #[test]
    fn addresses_are_rebased_by_app_code_base() {
        let bytes = [0x70, 0x47];
        let image = image::Image::new(&bytes);
        let map = linear_disassemble(&image, 0x0800_0000, &ThumbDecoder);

        assert!(map.contains_key(&address::VirtAddr::new(0x0800_0000)));
    }
}
