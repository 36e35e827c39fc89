//! Per-connection frame accumulation for non-blocking sockets.
//!
//! [`FrameAccumulator`] collects inbound bytes until exactly one frame is
//! available; [`FrameQueue`] holds encoded outbound frames and remembers how
//! much of the head frame has already been written.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

use super::frame::{EMPTY_FRAME, FRAME_LEN, Frame};

/// Outcome of one read into a [`FrameAccumulator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// The peer closed the stream.
    Eof,
    /// Some bytes arrived but the frame is not complete yet.
    Partial { filled: usize },
    /// A whole frame is available; the accumulator is empty again.
    Complete(Frame),
}

/// Inbound state: the bytes of the current frame collected so far.
#[derive(Debug, Clone)]
pub struct FrameAccumulator {
    buf: Frame,
    filled: usize,
}

impl Default for FrameAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self {
            buf: EMPTY_FRAME,
            filled: 0,
        }
    }

    /// Bytes of the current frame received so far.
    pub fn filled(&self) -> usize {
        self.filled
    }

    /// Space left in the current frame.
    pub fn unfilled(&mut self) -> &mut [u8] {
        &mut self.buf[self.filled..]
    }

    /// Account for `n` bytes written into [`Self::unfilled`]. Returns the frame
    /// once it is complete and resets for the next one.
    pub fn advance(&mut self, n: usize) -> Option<Frame> {
        debug_assert!(self.filled + n <= FRAME_LEN, "advanced past frame end");
        self.filled += n;

        if self.filled == FRAME_LEN {
            self.filled = 0;
            Some(self.buf)
        } else {
            None
        }
    }

    /// Read at most the rest of the current frame from `src`.
    ///
    /// Never reads beyond the frame boundary, so bytes of the following frame
    /// stay in the socket until the caller reads again.
    pub fn read_from<R: Read>(&mut self, src: &mut R) -> io::Result<Fill> {
        let n = src.read(self.unfilled())?;
        if n == 0 {
            return Ok(Fill::Eof);
        }

        Ok(match self.advance(n) {
            Some(frame) => Fill::Complete(frame),
            None => Fill::Partial {
                filled: self.filled,
            },
        })
    }
}

/// Outcome of [`FrameQueue::write_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// Every queued frame was written.
    Drained,
    /// The sink would block; frames remain queued.
    Blocked,
}

/// Outbound state: frames waiting to be written, oldest first.
#[derive(Debug, Default)]
pub struct FrameQueue {
    frames: VecDeque<Frame>,
    written: usize,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: Frame) {
        self.frames.push_back(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Write as much as `dst` accepts. Partial writes of the head frame are
    /// remembered and resumed on the next call.
    pub fn write_to<W: Write>(&mut self, dst: &mut W) -> io::Result<Flush> {
        while let Some(head) = self.frames.front() {
            match dst.write(&head[self.written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.written += n;
                    if self.written == FRAME_LEN {
                        self.frames.pop_front();
                        self.written = 0;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flush::Blocked),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(Flush::Drained)
    }
}
