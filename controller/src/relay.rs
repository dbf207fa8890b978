use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use heating_common::{config::RelayConfig, Channel, RelayDriver, RelayError};
use tracing::{debug, info, warn};

const BOARD_CHANNELS: usize = 8;
const CMD_ON: u8 = 0xFF;
const CMD_OFF: u8 = 0xFD;

/// HID output report for a single channel switch. The leading zero is the
/// report number the hidraw interface expects for unnumbered reports.
pub fn command_frame(channel: u8, on: bool) -> [u8; 9] {
    let mut frame = [0u8; 9];
    frame[1] = if on { CMD_ON } else { CMD_OFF };
    frame[2] = channel;
    frame
}

fn open_port(device: &Path) -> io::Result<File> {
    OpenOptions::new().write(true).open(device)
}

/// An 8-channel USB HID relay board driven through its hidraw node.
///
/// The board has no input report, so `status` answers from the latches of the
/// frames the device accepted. A failed write drops the handle; the next
/// command reopens the node and assumes a power-cycled board with every relay
/// released, which lets the resync pass re-send the intended state.
#[derive(Debug)]
pub struct UsbRelayBoard {
    device: PathBuf,
    port: Option<File>,
    heating_channel: u8,
    preheat_channel: u8,
    latched: [bool; BOARD_CHANNELS],
}

impl UsbRelayBoard {
    /// Exactly one configured board must be present.
    pub fn find(config: &RelayConfig) -> Result<Self, RelayError> {
        let present: Vec<&String> = config
            .devices
            .iter()
            .filter(|device| Path::new(device.as_str()).exists())
            .collect();
        let device = match present.as_slice() {
            [] => return Err(RelayError::NotFound),
            [device] => PathBuf::from(device.as_str()),
            devices => return Err(RelayError::TooMany(devices.len())),
        };

        let port = open_port(&device).map_err(|err| RelayError::Unavailable {
            device: device.display().to_string(),
            reason: err.to_string(),
        })?;
        info!(
            "relay board {}: heating on channel {}, preheat on channel {}",
            device.display(),
            config.heating_channel,
            config.preheat_channel
        );

        Ok(Self {
            device,
            port: Some(port),
            heating_channel: config.heating_channel,
            preheat_channel: config.preheat_channel,
            latched: [false; BOARD_CHANNELS],
        })
    }

    fn slot(&self, channel: Channel) -> Result<(u8, usize), RelayError> {
        let number = match channel {
            Channel::Heating => self.heating_channel,
            Channel::Preheat => self.preheat_channel,
        };
        match usize::from(number).checked_sub(1) {
            Some(index) if index < BOARD_CHANNELS => Ok((number, index)),
            _ => Err(RelayError::UnknownChannel(channel)),
        }
    }

    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        let mut port = match self.port.take() {
            Some(port) => port,
            None => {
                let port = open_port(&self.device)?;
                info!("relay board {} reopened", self.device.display());
                self.latched = [false; BOARD_CHANNELS];
                port
            }
        };
        port.write_all(frame)?;
        self.port = Some(port);
        Ok(())
    }

    fn switch(&mut self, channel: Channel, on: bool) -> Result<(), RelayError> {
        let (number, index) = self.slot(channel)?;
        let frame = command_frame(number, on);
        debug!("relay board {}: frame {frame:02x?}", self.device.display());
        self.send(&frame).map_err(|err| {
            warn!("relay board {} write failed: {err}", self.device.display());
            RelayError::Command {
                channel,
                reason: err.to_string(),
            }
        })?;
        self.latched[index] = on;
        Ok(())
    }
}

impl RelayDriver for UsbRelayBoard {
    fn on(&mut self, channel: Channel) -> Result<(), RelayError> {
        self.switch(channel, true)
    }

    fn off(&mut self, channel: Channel) -> Result<(), RelayError> {
        self.switch(channel, false)
    }

    fn status(&mut self, channel: Channel) -> Result<bool, RelayError> {
        let (_, index) = self.slot(channel)?;
        Ok(self.latched[index])
    }
}
