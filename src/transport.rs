use crate::Error;
use std::time::Duration;

/// Byte-transport boundary to the shared half-duplex bus.
///
/// The bus has no flow control and no framing byte; reply capture is purely
/// timing based, so implementations only need to expose a write, a pending
/// byte count and a single-byte read.
pub trait Bus {
    fn write_all(&mut self, data: &[u8]) -> Result<(), Error>;
    fn bytes_to_read(&mut self) -> Result<usize, Error>;
    fn read_byte(&mut self) -> Result<u8, Error>;
}

/// Full send+settle+drain cycles attempted before giving up on a reply of
/// the expected length.
pub const SEND_ATTEMPTS: usize = 3;

/// The single owner of the bus. Serializes all request/reply cycles so two
/// logical requests can never interleave; stray bytes from a prior reply
/// would corrupt the next frame's interpretation.
#[derive(Debug)]
pub struct BusMaster<B> {
    bus: B,
}

impl<B: Bus> BusMaster<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Replies are captured by waiting long enough for the board to clock
    /// the expected bytes out, then draining whatever arrived.
    fn settle_delay(expected: usize) -> Duration {
        Duration::from_millis(2 * (expected as u64 / 8 + 1))
    }

    /// Writes a prepared frame, draining any stale bytes first.
    pub fn send(&mut self, frame: &[u8]) -> Result<(), Error> {
        loop {
            let pending = self.bus.bytes_to_read()?;
            if pending == 0 {
                break;
            }
            log::trace!("Draining {} stale bytes before send", pending);
            for _ in 0..pending {
                let _ = self.bus.read_byte()?;
            }
        }
        log::trace!("send: {:02X?}", frame);
        self.bus.write_all(frame)
    }

    /// Drains all currently available bytes, up to `max`.
    ///
    /// There is no end-of-frame delimiter; the caller must validate length
    /// and content after the fact. If the capture fills `max`, any excess
    /// is discarded so it cannot leak into the next cycle.
    pub fn get_reply(&mut self, max: usize) -> Result<Vec<u8>, Error> {
        let mut reply = Vec::with_capacity(max);
        while self.bus.bytes_to_read()? > 0 && reply.len() < max {
            reply.push(self.bus.read_byte()?);
        }
        if reply.len() == max {
            while self.bus.bytes_to_read()? > 0 {
                let _ = self.bus.read_byte()?;
            }
        }
        log::trace!("get_reply: {:02X?}", reply);
        Ok(reply)
    }

    /// One send+settle+drain cycle without retry.
    ///
    /// Used where a missing reply is meaningful (enumeration probing) and
    /// retrying would only slow the loop down.
    pub fn transact(&mut self, frame: &[u8], max: usize) -> Result<Vec<u8>, Error> {
        self.send(frame)?;
        std::thread::sleep(Self::settle_delay(max));
        self.get_reply(max)
    }

    /// Sends a frame and captures a reply of `expected` bytes, retrying the
    /// full cycle up to [`SEND_ATTEMPTS`] times on a length mismatch.
    ///
    /// A short capture is a strong signal to retry but not fatal by itself:
    /// whatever was last captured is returned and the caller validates
    /// content and CRC independently.
    pub fn send_with_reply(&mut self, frame: &[u8], expected: usize) -> Result<Vec<u8>, Error> {
        let mut reply = Vec::new();
        for attempt in 1..=SEND_ATTEMPTS {
            self.send(frame)?;
            std::thread::sleep(Self::settle_delay(expected));
            reply = self.get_reply(expected)?;
            if reply.len() == expected {
                return Ok(reply);
            }
            log::debug!(
                "Attempt {}/{}: captured {} of {} expected bytes",
                attempt,
                SEND_ATTEMPTS,
                reply.len(),
                expected
            );
        }
        Ok(reply)
    }
}
