//! The packet-source abstraction (§9 design note): `NextPacket(buf) -> (view, type, err)` plus
//! `Close()`, implementable either by a real platform capture ring or, here, by a deterministic
//! in-memory mock — directly analogous to the teacher's `FileSystem`/`RealFs`/`MockFs` triad
//! used to keep `Collector` testable without a real `/proc`.

use crate::flowkey::Direction;
use std::io;

/// Metadata about one packet handed back by [`PacketSource::next_packet`]. `direction_hint`
/// carries an OS-level packet-type hint when the source can supply one (§9's "OS-hint assisted"
/// classification); `None` means the capture-time heuristic classifier must decide (§9 open
/// question #3).
#[derive(Clone, Copy, Debug)]
pub struct PacketView {
    pub len: usize,
    pub direction_hint: Option<Direction>,
}

/// A source of raw IP-layer frames. This crate is not a packet-capture library (§1 non-goals):
/// the source is platform-supplied in production and a deterministic mock in tests.
pub trait PacketSource: Send {
    /// Copies the next packet's bytes into `buf`, returning its [`PacketView`]. Returns `Ok(None)`
    /// when the source is exhausted (the mock's "completion signal"; a real ring never returns
    /// this — it blocks instead).
    fn next_packet(&mut self, buf: &mut [u8]) -> io::Result<Option<PacketView>>;

    fn close(&mut self) -> io::Result<()>;
}

/// A pre-loaded, order-preserving queue of frames with a completion signal, used throughout the
/// §8 end-to-end scenario tests.
pub struct MockPacketSource {
    frames: std::collections::VecDeque<(Vec<u8>, Option<Direction>)>,
    closed: bool,
}

impl MockPacketSource {
    pub fn new(frames: Vec<(Vec<u8>, Option<Direction>)>) -> Self {
        MockPacketSource {
            frames: frames.into(),
            closed: false,
        }
    }

    pub fn empty() -> Self {
        MockPacketSource::new(Vec::new())
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl PacketSource for MockPacketSource {
    fn next_packet(&mut self, buf: &mut [u8]) -> io::Result<Option<PacketView>> {
        if self.closed {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "mock packet source is closed",
            ));
        }
        let Some((bytes, direction_hint)) = self.frames.pop_front() else {
            return Ok(None);
        };
        if bytes.len() > buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "mock packet source: caller buffer too small",
            ));
        }
        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok(Some(PacketView {
            len: bytes.len(),
            direction_hint,
        }))
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yields_frames_then_none() {
        let mut src = MockPacketSource::new(vec![(vec![1, 2, 3], None)]);
        let mut buf = [0u8; 64];
        let view = src.next_packet(&mut buf).unwrap().unwrap();
        assert_eq!(view.len, 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
        assert!(src.next_packet(&mut buf).unwrap().is_none());
    }

    #[test]
    fn errors_after_close() {
        let mut src = MockPacketSource::empty();
        src.close().unwrap();
        let mut buf = [0u8; 8];
        assert!(src.next_packet(&mut buf).is_err());
    }
}
