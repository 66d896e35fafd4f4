// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! TCP MD stream framing (spec.md §4.4 "UDP vs TCP"): a single TCP
//! connection multiplexes several MD sessions; framing is by the header's
//! declared payload length. Each connection keeps an accumulator and
//! yields exactly one message once `40 + payload_length` bytes are
//! buffered.

use crate::constant::{CRC_SIZE, HEADER_SIZE};
use crate::error::{Error, Result};

pub struct Accumulator {
    buf: Vec<u8>,
}

impl Default for Accumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Accumulator {
    pub fn new() -> Self {
        Accumulator { buf: Vec::new() }
    }

    /// Feed newly-read bytes from the socket into the accumulator.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pull as many complete frames as are currently buffered. A short
    /// read that leaves a partial frame is left in the accumulator for
    /// the next `feed`.
    pub fn drain_frames(&mut self) -> Result<Vec<Vec<u8>>> {
        let mut frames = Vec::new();
        loop {
            if self.buf.len() < HEADER_SIZE {
                break;
            }
            let declared_len = u32::from_be_bytes(
                self.buf[24..28].try_into().map_err(|_| Error::Wire("short header"))?,
            ) as usize;
            let total = HEADER_SIZE + declared_len + CRC_SIZE;
            if self.buf.len() < total {
                break;
            }
            frames.push(self.buf.drain(..total).collect());
        }
        Ok(frames)
    }
}
