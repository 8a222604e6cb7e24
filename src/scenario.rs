// Named transfer scenarios
//
// The size is the only thing that varies: the wide, thin image is the one
// that reads back corrupted texels, the square one is the known-good control.

use crate::texel::{Rgb16, TEXEL_FORMAT, TEXEL_SIZE};
use anyhow::Result;
use ash::vk;

/// Clear color written into the image before the copy (opaque red)
pub const CLEAR_COLOR: [f32; 4] = [1.0, 0.0, 0.0, 1.0];

/// Texels compared individually after readback
pub const PROBE_TEXELS: [usize; 3] = [0, 1, 2];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scenario {
    pub name: &'static str,
    pub width: u32,
    pub height: u32,
}

pub const WIDE: Scenario = Scenario {
    name: "wide",
    width: 5462,
    height: 2,
};

pub const SQUARE: Scenario = Scenario {
    name: "square",
    width: 256,
    height: 256,
};

pub const ALL: [Scenario; 2] = [WIDE, SQUARE];

impl Scenario {
    pub fn by_name(name: &str) -> Result<Self> {
        ALL.iter()
            .copied()
            .find(|s| s.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                let known: Vec<_> = ALL.iter().map(|s| s.name).collect();
                anyhow::anyhow!("Unknown scenario '{}' (known: {})", name, known.join(", "))
            })
    }

    pub fn format(&self) -> vk::Format {
        TEXEL_FORMAT
    }

    pub fn extent(&self) -> vk::Extent3D {
        vk::Extent3D {
            width: self.width,
            height: self.height,
            depth: 1,
        }
    }

    pub fn texel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Tightly packed readback size
    pub fn buffer_size(&self) -> vk::DeviceSize {
        (self.texel_count() * TEXEL_SIZE) as vk::DeviceSize
    }

    pub fn expected_texel(&self) -> Rgb16 {
        Rgb16::from_clear_color(CLEAR_COLOR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wide_scenario_buffer_size() {
        assert_eq!(WIDE.texel_count(), 10924);
        assert_eq!(WIDE.buffer_size(), 65544);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        assert_eq!(Scenario::by_name("Square").unwrap(), SQUARE);
    }

    #[test]
    fn unknown_scenario_lists_known_names() {
        let err = Scenario::by_name("tall").unwrap_err().to_string();
        assert!(err.contains("tall"));
        assert!(err.contains("wide, square"));
    }

    #[test]
    fn expected_texel_is_red() {
        assert_eq!(WIDE.expected_texel(), Rgb16([0xFFFF, 0, 0]));
    }
}
