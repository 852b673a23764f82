//! Pipeline stage 4: the Vector Table Sizer.

use address::FileOffset;
use image::Image;
use image::vector_table::MIN_VECTOR_TABLE_BYTES;

use crate::config::PipelineConfig;

/// Scans past the fixed 15-entry minimum to find the first word that does not look like a
/// plausible vendor IRQ handler, returning the resulting table size in bytes.
///
/// `app_code_base` of `None` is treated as `0` (the estimator could not place the image,
/// but sizing can still proceed relative to file offset 0).
pub fn size_vector_table(
    image: &Image<'_>,
    app_code_base: Option<u32>,
    config: &PipelineConfig,
) -> u32 {
    let app_code_base = app_code_base.unwrap_or(0);
    let image_size = conversion::usize_to_u32_truncating(image.len());
    let mut address = MIN_VECTOR_TABLE_BYTES;

    loop {
        if address >= config.max_vector_table_bytes {
            break;
        }
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
        let relative_entry = entry.wrapping_sub(1).wrapping_sub(app_code_base);
        if relative_entry >= MIN_VECTOR_TABLE_BYTES && relative_entry < image_size {
            address += 4;
            continue;
        }
        if entry < app_code_base {
            address += 4;
            continue;
        }
        break;
    }

    log::info!("vector table size computed as {address:#x}");
    address
}

#[cfg(test)]
mod test {
    use image::Image;

    use super::size_vector_table;
    use crate::config::PipelineConfig;

    #[test]
    fn stops_at_the_first_even_word() {
        // relative_entry = 0x0800_0041 - 1 - 0x0800_0000 = 64, inside [60, image_size).
        let mut bytes = vec![0u8; 72];
        bytes[60..64].copy_from_slice(&0x0800_0041u32.to_le_bytes());
        bytes[64..68].copy_from_slice(&0x0800_0200u32.to_le_bytes());
        let image = Image::new(&bytes);

        let size = size_vector_table(&image, Some(0x0800_0000), &PipelineConfig::default());
        assert_eq!(size, 64);
    }

    #[test]
    fn skips_zero_and_all_ones_fillers() {
        let mut bytes = vec![0u8; 76];
        bytes[60..64].copy_from_slice(&0u32.to_le_bytes());
        bytes[64..68].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        bytes[68..72].copy_from_slice(&0x0800_0045u32.to_le_bytes());
        bytes[72..76].copy_from_slice(&0x0800_0200u32.to_le_bytes());
        let image = Image::new(&bytes);

        let size = size_vector_table(&image, Some(0x0800_0000), &PipelineConfig::default());
        assert_eq!(size, 72);
    }

    #[test]
    fn caps_at_the_configured_maximum() {
        // Every word looks like a plausible in-range odd handler, so without a cap the
        // scan would run to the end of the (large) image.
        let mut bytes = vec![0u8; 4096];
        for chunk in bytes[60..].chunks_exact_mut(4) {
            chunk.copy_from_slice(&0x0800_0131u32.to_le_bytes());
        }
        let image = Image::new(&bytes);
        let config = PipelineConfig {
            max_vector_table_bytes: 100,
            ..PipelineConfig::default()
        };

        let size = size_vector_table(&image, Some(0x0800_0000), &config);
        assert_eq!(size, 100);
    }
}
