use std::fmt;

use crate::contract::{DecoderError, FormatTag, PixelFormat};

pub const SOFTWARE_PRIORITY: [PixelFormat; 7] = [
    PixelFormat::I420,
    PixelFormat::I422,
    PixelFormat::I444,
    PixelFormat::I010,
    PixelFormat::I210,
    PixelFormat::I410,
    PixelFormat::Nv12,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodePath {
    Hardware,
    Software,
}

impl fmt::Display for DecodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hardware => f.write_str("hardware"),
            Self::Software => f.write_str("software"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedFormat {
    pub tag: FormatTag,
    pub pixel_format: PixelFormat,
    pub path: DecodePath,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceNegotiator {
    allow_hardware: bool,
}

impl SurfaceNegotiator {
    #[must_use]
    pub fn new(allow_hardware: bool) -> Self {
        Self { allow_hardware }
    }

    #[must_use]
    pub fn software_only(self) -> Self {
        Self {
            allow_hardware: false,
        }
    }

    pub fn negotiate(&self, candidates: &[FormatTag]) -> Result<NegotiatedFormat, DecoderError> {
        let classified: Vec<(FormatTag, PixelFormat)> = candidates
            .iter()
            .filter_map(|tag| tag.pixel_format().map(|class| (*tag, class)))
            .collect();

        if self.allow_hardware {
            if let Some((tag, pixel_format)) =
                classified.iter().find(|(_, class)| class.is_hardware())
            {
                return Ok(NegotiatedFormat {
                    tag: *tag,
                    pixel_format: *pixel_format,
                    path: DecodePath::Hardware,
                });
            }
        }

        SOFTWARE_PRIORITY
            .iter()
            .find_map(|wanted| {
                classified
                    .iter()
                    .find(|(_, class)| class == wanted)
                    .map(|(tag, class)| NegotiatedFormat {
                        tag: *tag,
                        pixel_format: *class,
                        path: DecodePath::Software,
                    })
            })
            .ok_or_else(|| DecoderError::NoSupportedFormat(describe(candidates)))
    }
}

fn describe(candidates: &[FormatTag]) -> String {
    if candidates.is_empty() {
        return "engine listed no formats".to_string();
    }
    candidates
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
