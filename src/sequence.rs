use crate::flags::ContextFlags;
use crate::{Error, ErrorKind, Result};

/// Number of already received sequence numbers remembered behind the highest one.
pub const WINDOW_SIZE: u64 = 20;

/// Replay and ordering checks for per-message sequence numbers.
///
/// Sequence numbers are taken relative to the first expected one, so wraparound is handled
/// with a plain mask: 64 bits in CFX mode, 32 bits otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceWindow {
    do_replay: bool,
    do_sequence: bool,
    mask: u64,
    base: u64,
    /// Next expected sequence number, relative to `base`.
    next: u64,
    /// Bit `n` is set when `next - 1 - n` has been received.
    received: u64,
}

impl SequenceWindow {
    pub fn new(initial_seq: u64, is_cfx: bool, flags: ContextFlags) -> Self {
        let mask = if is_cfx { u64::MAX } else { u64::from(u32::MAX) };

        Self {
            do_replay: flags.contains(ContextFlags::REPLAY),
            do_sequence: flags.contains(ContextFlags::SEQUENCE),
            mask,
            base: initial_seq & mask,
            next: 0,
            received: 0,
        }
    }

    pub fn check(&mut self, seq: u64) -> Result<()> {
        if !self.do_replay && !self.do_sequence {
            return Ok(());
        }

        let relative = seq.wrapping_sub(self.base) & self.mask;
        // distance ahead of the next expected number, with the upper half of the space counting as behind
        let ahead = relative.wrapping_sub(self.next) & self.mask;

        if ahead <= self.mask / 2 {
            let shift = ahead.checked_add(1).and_then(|n| u32::try_from(n).ok());

            self.received = shift
                .and_then(|shift| self.received.checked_shl(shift))
                .unwrap_or(0)
                | 1;
            self.next = relative.wrapping_add(1) & self.mask;

            if ahead > 0 && self.do_sequence {
                return Err(Error::new(
                    ErrorKind::GapToken,
                    format!("{} sequence numbers are missing before {}", ahead, seq),
                ));
            }

            return Ok(());
        }

        let offset = self.next.wrapping_sub(relative) & self.mask;
        if offset > WINDOW_SIZE {
            return Err(if self.do_sequence {
                Error::new(ErrorKind::UnseqToken, format!("sequence number {} is out of order", seq))
            } else {
                Error::new(ErrorKind::OldToken, format!("sequence number {} is too old", seq))
            });
        }

        let bit = 1_u64 << (offset - 1);
        if self.do_replay && self.received & bit != 0 {
            return Err(Error::new(
                ErrorKind::DuplicateToken,
                format!("sequence number {} was already received", seq),
            ));
        }
        self.received |= bit;

        if self.do_sequence {
            return Err(Error::new(
                ErrorKind::UnseqToken,
                format!("sequence number {} arrived out of order", seq),
            ));
        }

        Ok(())
    }
}
