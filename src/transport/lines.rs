//! Control lines and the physical link abstraction.
//!
//! Each link end drives two single-bit signals, **select** and **ready**, and
//! samples the same two signals driven by the far end. Line polarity is a
//! configuration value: the protocol reasons about "asserted", the [`Link`]
//! sees electrical [`Level`]s.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Electrical level of a control line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// Logic low.
    Low,
    /// Logic high.
    High,
}

/// Which level means "asserted".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    /// Asserted when low (reference hardware).
    #[default]
    ActiveLow,
    /// Asserted when high.
    ActiveHigh,
}

impl Polarity {
    /// Level to drive for a logical state.
    #[inline]
    pub fn level(self, asserted: bool) -> Level {
        match (self, asserted) {
            (Polarity::ActiveLow, true) | (Polarity::ActiveHigh, false) => Level::Low,
            (Polarity::ActiveLow, false) | (Polarity::ActiveHigh, true) => Level::High,
        }
    }

    /// Logical state of a sampled level.
    #[inline]
    pub fn is_asserted(self, level: Level) -> bool {
        self.level(true) == level
    }

    /// Level of a released line.
    #[inline]
    pub fn idle(self) -> Level {
        self.level(false)
    }
}

/// One end of a point-to-point synchronous serial link.
///
/// Implementations wrap the serial peripheral and two GPIO pairs. `read`
/// must never block: it returns whatever bytes the peripheral has already
/// shifted in, possibly none.
pub trait Link: Send {
    /// Drive this end's select line.
    fn drive_select(&mut self, level: Level);

    /// Drive this end's ready line.
    fn drive_ready(&mut self, level: Level);

    /// Sample the far end's select line.
    fn sense_select(&self) -> Level;

    /// Sample the far end's ready line.
    fn sense_ready(&self) -> Level;

    /// Shift bytes out to the far end.
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Copy available inbound bytes into `buf`, returning how many.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Reinitialize the serial peripheral, discarding buffered bytes.
    fn reinit(&mut self) -> Result<()>;
}

impl<L: Link + ?Sized> Link for Box<L> {
    fn drive_select(&mut self, level: Level) {
        (**self).drive_select(level)
    }

    fn drive_ready(&mut self, level: Level) {
        (**self).drive_ready(level)
    }

    fn sense_select(&self) -> Level {
        (**self).sense_select()
    }

    fn sense_ready(&self) -> Level {
        (**self).sense_ready()
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        (**self).write(bytes)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf)
    }

    fn reinit(&mut self) -> Result<()> {
        (**self).reinit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_low() {
        let p = Polarity::ActiveLow;
        assert_eq!(p.level(true), Level::Low);
        assert_eq!(p.idle(), Level::High);
        assert!(p.is_asserted(Level::Low));
        assert!(!p.is_asserted(Level::High));
    }

    #[test]
    fn test_active_high() {
        let p = Polarity::ActiveHigh;
        assert_eq!(p.level(true), Level::High);
        assert_eq!(p.idle(), Level::Low);
        assert!(p.is_asserted(Level::High));
    }

    #[test]
    fn test_polarity_from_json() {
        let p: Polarity = serde_json::from_str("\"active_high\"").unwrap();
        assert_eq!(p, Polarity::ActiveHigh);
        assert_eq!(Polarity::default(), Polarity::ActiveLow);
    }
}
