//! Recording transport for unit tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::transport::{BitMode, Transport};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MockError {
    Injected,
}

#[derive(Default)]
struct State {
    writes: Vec<Vec<u8>>,
    bit_modes: Vec<(u8, BitMode)>,
    reads: VecDeque<Vec<u8>>,
    echo: bool,
    inflate: usize,
    fail_write_at: Option<usize>,
    short_write_at: Option<(usize, usize)>,
    fail_read: bool,
    write_calls: usize,
}

/// Shares its state between clones so a test can keep a handle while the
/// channel owns the transport.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Rc<RefCell<State>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer each sync write the way the engine does.
    pub fn set_echo(&self, echo: bool) {
        self.state.borrow_mut().echo = echo;
    }

    /// Queue the result of one future read poll.
    pub fn push_read(&self, bytes: &[u8]) {
        self.state.borrow_mut().reads.push_back(bytes.to_vec());
    }

    /// Report `extra` more bytes than were copied on the next read.
    pub fn inflate_reads(&self, extra: usize) {
        self.state.borrow_mut().inflate = extra;
    }

    pub fn fail_write_next(&self) {
        let mut state = self.state.borrow_mut();
        state.fail_write_at = Some(state.write_calls);
    }

    /// Fail the write call `calls` calls from now.
    pub fn fail_write_after(&self, calls: usize) {
        let mut state = self.state.borrow_mut();
        state.fail_write_at = Some(state.write_calls + calls);
    }

    pub fn short_write_next(&self, accepted: usize) {
        let mut state = self.state.borrow_mut();
        state.short_write_at = Some((state.write_calls, accepted));
    }

    pub fn fail_reads(&self, fail: bool) {
        self.state.borrow_mut().fail_read = fail;
    }

    /// Every accepted write, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.borrow().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state.borrow_mut().writes.clear();
    }

    pub fn bit_modes(&self) -> Vec<(u8, BitMode)> {
        self.state.borrow().bit_modes.clone()
    }
}

impl Transport for MockTransport {
    type Error = MockError;

    fn write(&mut self, data: &[u8]) -> Result<usize, MockError> {
        let mut state = self.state.borrow_mut();
        let call = state.write_calls;
        state.write_calls += 1;

        if state.fail_write_at == Some(call) {
            state.fail_write_at = None;
            return Err(MockError::Injected);
        }
        if let Some((at, accepted)) = state.short_write_at {
            if at == call {
                state.short_write_at = None;
                return Ok(accepted);
            }
        }

        state.writes.push(data.to_vec());
        if state.echo && data == [0xab, 0xaa] {
            state.reads.push_back(vec![0xfa, 0xab, 0xfa, 0xaa]);
        }
        Ok(data.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> nb::Result<usize, MockError> {
        let mut state = self.state.borrow_mut();
        if state.fail_read {
            return Err(nb::Error::Other(MockError::Injected));
        }
        let mut chunk = match state.reads.pop_front() {
            Some(chunk) => chunk,
            None => return Err(nb::Error::WouldBlock),
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            let rest = chunk.split_off(n);
            state.reads.push_front(rest);
        }
        let reported = n + state.inflate;
        state.inflate = 0;
        Ok(reported)
    }

    fn set_bit_mode(&mut self, mask: u8, mode: BitMode) -> Result<(), MockError> {
        self.state.borrow_mut().bit_modes.push((mask, mode));
        Ok(())
    }
}
