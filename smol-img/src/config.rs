// Conversion options shared by every converter.
//
// Defaults target the full-page cover box (450x750) at the panel's
// native 2-bit depth with dithering on.

use crate::Error;

// default box used for full-page cover rendering
pub const DEFAULT_MAX_WIDTH: u16 = 450;
pub const DEFAULT_MAX_HEIGHT: u16 = 750;

/// Bits per output pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputDepth {
    /// black / white
    Mono1,
    /// four grey levels
    Gray2,
}

impl OutputDepth {
    /// The panel's native grey depth.
    pub const NATIVE: Self = OutputDepth::Gray2;

    pub const fn bits(self) -> u8 {
        match self {
            OutputDepth::Mono1 => 1,
            OutputDepth::Gray2 => 2,
        }
    }

    pub const fn levels(self) -> u8 {
        1 << self.bits()
    }
}

/// Depth-reduction strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    /// Floyd-Steinberg error diffusion
    Dither,
    /// per-pixel nearest level, no carried state (quick previews)
    Threshold,
}

/// Options for one conversion call.
///
/// `should_abort` is polled before the BMP header is written and then
/// once per decoded row group; `log_tag` only prefixes log lines.
#[derive(Clone, Copy)]
pub struct ImageConvertConfig<'a> {
    pub max_width: u16,
    pub max_height: u16,
    pub one_bit: bool,
    pub quick_mode: bool,
    pub log_tag: &'a str,
    pub should_abort: Option<&'a dyn Fn() -> bool>,
}

impl Default for ImageConvertConfig<'_> {
    fn default() -> Self {
        Self {
            max_width: DEFAULT_MAX_WIDTH,
            max_height: DEFAULT_MAX_HEIGHT,
            one_bit: false,
            quick_mode: false,
            log_tag: "IMG",
            should_abort: None,
        }
    }
}

impl<'a> ImageConvertConfig<'a> {
    pub fn with_size(max_width: u16, max_height: u16) -> Self {
        Self {
            max_width,
            max_height,
            ..Self::default()
        }
    }

    // a zero dimension falls back to the default box
    pub fn target_box(&self) -> (u16, u16) {
        let w = if self.max_width == 0 {
            DEFAULT_MAX_WIDTH
        } else {
            self.max_width
        };
        let h = if self.max_height == 0 {
            DEFAULT_MAX_HEIGHT
        } else {
            self.max_height
        };
        (w, h)
    }

    pub fn quality(&self) -> Quality {
        if self.quick_mode {
            Quality::Threshold
        } else {
            Quality::Dither
        }
    }

    pub fn depth(&self) -> OutputDepth {
        if self.one_bit {
            OutputDepth::Mono1
        } else {
            OutputDepth::NATIVE
        }
    }

    pub fn aborted(&self) -> bool {
        self.should_abort.is_some_and(|f| f())
    }

    pub(crate) fn check_abort(&self) -> Result<(), Error> {
        if self.aborted() {
            log::info!("{}: abort requested", self.log_tag);
            return Err(Error::Aborted);
        }
        Ok(())
    }
}
