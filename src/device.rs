//! CPAL device discovery.
//!
//! This module provides [`CpalDevice`] for discovering audio devices and
//! creating the line-out and line-in nodes bound to them.
//!
//! # Example: List and Select a Device
//!
//! ```no_run
//! use klanggraph::{Context, ContextConfig, CpalDevice};
//!
//! for (i, device) in CpalDevice::list_outputs().iter().enumerate() {
//!     println!("[{}] {} ({} Hz, {} ch)",
//!         i, device.name(), device.sample_rate(), device.channels());
//! }
//!
//! let device = CpalDevice::default_output().expect("no output device");
//! let ctx = Context::new(ContextConfig::default());
//! let out = ctx.make_node(device.create_line_out());
//! ctx.set_target(&out).unwrap();
//! ```

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{SupportedBufferSize, SupportedStreamConfig};

use crate::nodes::{LineIn, LineOut};

/// Block size requested from devices that allow a range.
const PREFERRED_FRAMES_PER_BLOCK: u32 = 512;

/// A discovered audio device and its default stream configuration.
pub struct CpalDevice {
    device: cpal::Device,
    config: SupportedStreamConfig,
    name: String,
}

impl CpalDevice {
    /// The system's default output device, if any.
    pub fn default_output() -> Option<Self> {
        let device = cpal::default_host().default_output_device()?;
        let config = device.default_output_config().ok()?;
        Some(Self::from_parts(device, config))
    }

    /// The system's default input device, if any.
    pub fn default_input() -> Option<Self> {
        let device = cpal::default_host().default_input_device()?;
        let config = device.default_input_config().ok()?;
        Some(Self::from_parts(device, config))
    }

    /// All output devices with a usable default configuration.
    ///
    /// Returns an empty list if enumeration fails.
    pub fn list_outputs() -> Vec<Self> {
        cpal::default_host()
            .output_devices()
            .map(|devices| {
                devices
                    .filter_map(|device| {
                        let config = device.default_output_config().ok()?;
                        Some(Self::from_parts(device, config))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All input devices with a usable default configuration.
    pub fn list_inputs() -> Vec<Self> {
        cpal::default_host()
            .input_devices()
            .map(|devices| {
                devices
                    .filter_map(|device| {
                        let config = device.default_input_config().ok()?;
                        Some(Self::from_parts(device, config))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn from_parts(device: cpal::Device, config: SupportedStreamConfig) -> Self {
        let name = device.name().unwrap_or_else(|_| "Unknown".into());
        Self {
            device,
            config,
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate().0
    }

    pub fn channels(&self) -> u16 {
        self.config.channels()
    }

    /// Block size the context should render with for this device.
    pub fn frames_per_block(&self) -> usize {
        match self.config.buffer_size() {
            SupportedBufferSize::Range { min, max } => {
                PREFERRED_FRAMES_PER_BLOCK.clamp(*min, (*max).max(*min)) as usize
            }
            SupportedBufferSize::Unknown => PREFERRED_FRAMES_PER_BLOCK as usize,
        }
    }

    /// A target node playing the context's output on this device.
    pub fn create_line_out(&self) -> LineOut {
        LineOut::new(self.device.clone(), self.config.clone(), self.frames_per_block())
    }

    /// A source node capturing this device's input.
    pub fn create_line_in(&self) -> LineIn {
        LineIn::new(self.device.clone(), self.config.clone())
    }
}

impl core::fmt::Debug for CpalDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CpalDevice")
            .field("name", &self.name)
            .field("sample_rate", &self.sample_rate())
            .field("channels", &self.channels())
            .finish()
    }
}
