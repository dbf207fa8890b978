use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use thiserror::Error;
use tracing::{info, warn};

use crate::types::Channel;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RelayError {
    #[error("no relays found")]
    NotFound,
    #[error("only one relay allowed, found {0}")]
    TooMany(usize),
    #[error("relay channel {0} is not wired")]
    UnknownChannel(Channel),
    #[error("relay {channel} command failed: {reason}")]
    Command { channel: Channel, reason: String },
    #[error("relay board {device} unavailable: {reason}")]
    Unavailable { device: String, reason: String },
}

/// Physical relay board. Implementations are not expected to be reentrant.
pub trait RelayDriver: Send {
    fn on(&mut self, channel: Channel) -> Result<(), RelayError>;
    fn off(&mut self, channel: Channel) -> Result<(), RelayError>;
    fn status(&mut self, channel: Channel) -> Result<bool, RelayError>;
}

impl<D: RelayDriver + ?Sized> RelayDriver for Box<D> {
    fn on(&mut self, channel: Channel) -> Result<(), RelayError> {
        (**self).on(channel)
    }

    fn off(&mut self, channel: Channel) -> Result<(), RelayError> {
        (**self).off(channel)
    }

    fn status(&mut self, channel: Channel) -> Result<bool, RelayError> {
        (**self).status(channel)
    }
}

struct RelayBus<D> {
    driver: D,
    tracked: BTreeMap<Channel, bool>,
}

impl<D: RelayDriver> RelayBus<D> {
    fn tracked(&self, channel: Channel) -> bool {
        self.tracked.get(&channel).copied().unwrap_or(false)
    }

    fn command(&mut self, channel: Channel, on: bool) -> Result<(), RelayError> {
        if on {
            self.driver.on(channel)?;
        } else {
            self.driver.off(channel)?;
        }
        self.tracked.insert(channel, on);
        Ok(())
    }

    fn switch(&mut self, channel: Channel, on: bool) -> Result<(), RelayError> {
        if self.tracked(channel) == on {
            return self.resync_channel(channel);
        }
        self.command(channel, on)?;
        info!("relay {channel} {}", if on { "on" } else { "off" });
        Ok(())
    }

    fn resync_channel(&mut self, channel: Channel) -> Result<(), RelayError> {
        let wanted = self.tracked(channel);
        let actual = self.driver.status(channel)?;
        if actual != wanted {
            warn!("relay {channel} reads {actual} but should be {wanted}, resending");
            self.command(channel, wanted)?;
        }
        Ok(())
    }
}

/// Serializes every relay command behind one bus lock and remembers the
/// intended state of each channel.
pub struct RelayOutput<D> {
    bus: Mutex<RelayBus<D>>,
}

impl<D: RelayDriver> RelayOutput<D> {
    /// Channels are assumed on until [`RelayOutput::force_all_off`] runs.
    pub fn new(driver: D) -> Self {
        let tracked = Channel::ALL.iter().map(|channel| (*channel, true)).collect();
        Self {
            bus: Mutex::new(RelayBus { driver, tracked }),
        }
    }

    fn bus(&self) -> MutexGuard<'_, RelayBus<D>> {
        self.bus.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn on(&self, channel: Channel) -> Result<(), RelayError> {
        self.bus().switch(channel, true)
    }

    pub fn off(&self, channel: Channel) -> Result<(), RelayError> {
        self.bus().switch(channel, false)
    }

    pub fn status(&self, channel: Channel) -> bool {
        self.bus().tracked(channel)
    }

    /// Re-issues the tracked state on every channel whose hardware disagrees.
    pub fn resync(&self) -> Result<(), RelayError> {
        let mut bus = self.bus();
        let mut first_error = None;
        for channel in Channel::ALL {
            if let Err(err) = bus.resync_channel(channel) {
                warn!("relay {channel} resync failed: {err}");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Sends OFF to every channel regardless of tracked state.
    pub fn force_all_off(&self) -> Result<(), RelayError> {
        let mut bus = self.bus();
        let mut first_error = None;
        for channel in Channel::ALL {
            match bus.command(channel, false) {
                Ok(()) => info!("relay {channel} forced off"),
                Err(err) => {
                    warn!("relay {channel} could not be forced off: {err}");
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
