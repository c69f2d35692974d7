//! In-memory link pair for running host and peer firmware in one process.
//!
//! Each end owns its own select/ready lines and an inbound byte FIFO; writes
//! land in the other end's FIFO. Both ends can live on different threads.
//!
//! ```
//! use conbus::transport::{loopback, Link, Polarity};
//!
//! let (mut host, peer) = loopback::pair(Polarity::ActiveLow);
//! host.drive_select(Polarity::ActiveLow.level(true));
//! assert!(Polarity::ActiveLow.is_asserted(peer.sense_select()));
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use super::lines::{Level, Link, Polarity};
use crate::error::Result;

const HOST: usize = 0;
const PEER: usize = 1;

struct Wire {
    select: [Level; 2],
    ready: [Level; 2],
    inbound: [VecDeque<u8>; 2],
}

/// One end of an in-memory link.
pub struct LoopbackLink {
    wire: Arc<Mutex<Wire>>,
    end: usize,
}

/// Create a connected (host end, peer end) pair with all lines released.
pub fn pair(polarity: Polarity) -> (LoopbackLink, LoopbackLink) {
    let idle = polarity.idle();
    let wire = Arc::new(Mutex::new(Wire {
        select: [idle; 2],
        ready: [idle; 2],
        inbound: [VecDeque::new(), VecDeque::new()],
    }));
    (
        LoopbackLink {
            wire: wire.clone(),
            end: HOST,
        },
        LoopbackLink { wire, end: PEER },
    )
}

impl LoopbackLink {
    fn lock(&self) -> MutexGuard<'_, Wire> {
        self.wire.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn far(&self) -> usize {
        1 - self.end
    }
}

impl Link for LoopbackLink {
    fn drive_select(&mut self, level: Level) {
        let end = self.end;
        self.lock().select[end] = level;
    }

    fn drive_ready(&mut self, level: Level) {
        let end = self.end;
        self.lock().ready[end] = level;
    }

    fn sense_select(&self) -> Level {
        self.lock().select[self.far()]
    }

    fn sense_ready(&self) -> Level {
        self.lock().ready[self.far()]
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let far = self.far();
        self.lock().inbound[far].extend(bytes.iter().copied());
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let end = self.end;
        let mut wire = self.lock();
        let inbound = &mut wire.inbound[end];
        let n = buf.len().min(inbound.len());
        for (slot, byte) in buf.iter_mut().zip(inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn reinit(&mut self) -> Result<()> {
        let end = self.end;
        self.lock().inbound[end].clear();
        Ok(())
    }
}
