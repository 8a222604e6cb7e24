// Texel encoding for the probed format
//
// Every scenario copies R16G16B16_UNORM: three little-endian u16 channels,
// no alpha, 6 bytes per texel, tightly packed in the readback buffer.

use ash::vk;
use std::fmt;

/// Image format under test
pub const TEXEL_FORMAT: vk::Format = vk::Format::R16G16B16_UNORM;

/// Bytes per texel of `TEXEL_FORMAT`
pub const TEXEL_SIZE: usize = 3 * 2;

/// One decoded R16G16B16 texel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb16(pub [u16; 3]);

impl Rgb16 {
    /// Expected texel after clearing with a float clear color (alpha is dropped)
    pub fn from_clear_color(color: [f32; 4]) -> Self {
        Self([unorm16(color[0]), unorm16(color[1]), unorm16(color[2])])
    }

    pub fn from_le_bytes(bytes: &[u8; TEXEL_SIZE]) -> Self {
        Self([
            u16::from_le_bytes([bytes[0], bytes[1]]),
            u16::from_le_bytes([bytes[2], bytes[3]]),
            u16::from_le_bytes([bytes[4], bytes[5]]),
        ])
    }
}

impl fmt::Display for Rgb16 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [r, g, b] = self.0;
        write!(f, "[{:#06X}, {:#06X}, {:#06X}]", r, g, b)
    }
}

/// Float to 16-bit UNORM conversion as the driver is required to perform it
pub fn unorm16(value: f32) -> u16 {
    // NaN clamps to 0
    let clamped = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
    (clamped * u16::MAX as f32).round() as u16
}

/// Decode a readback buffer. A trailing partial texel is ignored.
pub fn read_texels(bytes: &[u8]) -> Vec<Rgb16> {
    bytes
        .chunks_exact(TEXEL_SIZE)
        .map(|chunk| {
            let mut texel = [0u8; TEXEL_SIZE];
            texel.copy_from_slice(chunk);
            Rgb16::from_le_bytes(&texel)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn red_clear_color_is_full_red_channel() {
        let red = Rgb16::from_clear_color([1.0, 0.0, 0.0, 1.0]);
        assert_eq!(red, Rgb16([0xFFFF, 0x0000, 0x0000]));
    }

    #[test]
    fn unorm16_clamps_and_rounds() {
        assert_eq!(unorm16(-0.5), 0);
        assert_eq!(unorm16(2.0), 0xFFFF);
        assert_eq!(unorm16(f32::NAN), 0);
        assert_eq!(unorm16(0.5), 32768);
    }

    #[test]
    fn texels_decode_little_endian() {
        let bytes = [0xFF, 0xFF, 0x00, 0x00, 0x34, 0x12, 0x01, 0x00, 0x02, 0x00, 0x03, 0x00, 0xAA];
        let texels = read_texels(&bytes);

        assert_eq!(texels, vec![Rgb16([0xFFFF, 0, 0x1234]), Rgb16([1, 2, 3])]);
    }

    #[test]
    fn display_uses_hex_channels() {
        assert_eq!(Rgb16([0xFFFF, 0, 0x12]).to_string(), "[0xFFFF, 0x0000, 0x0012]");
    }
}
