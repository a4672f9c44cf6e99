//! Minimal JPEG header reader for embedding baseline/progressive JPEGs as-is.

/// Frame parameters read from the SOF segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JpegInfo {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Number of colour components (1 gray, 3 YCbCr, 4 CMYK).
    pub components: u8,
}

impl JpegInfo {
    /// PDF colour space name for the component count.
    #[must_use]
    pub fn color_space(&self) -> &'static str {
        match self.components {
            1 => "/DeviceGray",
            4 => "/DeviceCMYK",
            _ => "/DeviceRGB",
        }
    }
}

/// Reads the frame header of a JPEG, or `None` if `data` is not a usable JPEG.
#[must_use]
pub fn read_info(data: &[u8]) -> Option<JpegInfo> {
    if data.len() < 4 || data[0] != 0xFF || data[1] != 0xD8 {
        return None;
    }

    let mut pos = 2;
    while pos + 4 <= data.len() {
        if data[pos] != 0xFF {
            return None;
        }
        let marker = data[pos + 1];
        if marker == 0xFF {
            pos += 1;
            continue;
        }
        pos += 2;

        // Standalone markers carry no length.
        if marker == 0x01 || (0xD0..=0xD7).contains(&marker) {
            continue;
        }
        if marker == 0xD9 || marker == 0xDA {
            return None;
        }

        let len = usize::from(u16::from_be_bytes([*data.get(pos)?, *data.get(pos + 1)?]));
        if len < 2 {
            return None;
        }

        let is_sof = (0xC0..=0xCF).contains(&marker) && !matches!(marker, 0xC4 | 0xC8 | 0xCC);
        if is_sof {
            let segment = data.get(pos + 2..pos + len)?;
            if segment.len() < 6 {
                return None;
            }
            let height = u32::from(u16::from_be_bytes([segment[1], segment[2]]));
            let width = u32::from(u16::from_be_bytes([segment[3], segment[4]]));
            let components = segment[5];
            if width == 0 || height == 0 || components == 0 {
                return None;
            }
            return Some(JpegInfo {
                width,
                height,
                components,
            });
        }

        pos += len;
    }
    None
}
