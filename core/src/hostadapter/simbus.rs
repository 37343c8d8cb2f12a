//! Simulated SCSI bus with a scripted initiator on the other end
//!
//! The initiator reacts to REQ the way a well-behaved host does: it latches
//! (or drives) the data bus and answers with ACK, optionally after a number
//! of polls. It can also be told to stop answering, or to pull RST, after a
//! given number of handshakes.

use std::collections::VecDeque;
use std::sync::Arc;

use super::{BusLine, BusLines};
use crate::types::ResetLatch;

pub struct SimBus {
    /// Electrical levels of the target outputs, indexed by [`Self::out_idx`]
    outputs: [bool; 5],

    /// Data pin levels driven by the target
    target_pins: u8,

    /// Data pin levels driven by the initiator
    host_pins: u8,

    data_output: bool,
    sel: bool,
    rst: bool,

    /// Polls of ACK left before it asserts, None when no handshake is pending
    ack_countdown: Option<u32>,
    ack_delay: u32,

    /// Handshakes the initiator is willing to complete
    ack_budget: Option<usize>,

    /// Handshake number at which the initiator pulls RST
    reset_after: Option<usize>,

    handshakes: usize,
    host_rx: Vec<u8>,
    host_tx: VecDeque<u8>,

    latch: Arc<ResetLatch>,
}

impl SimBus {
    pub fn new() -> Self {
        Self {
            outputs: [true; 5],
            target_pins: 0xFF,
            host_pins: 0xFF,
            data_output: false,
            sel: true,
            rst: true,
            ack_countdown: None,
            ack_delay: 0,
            ack_budget: None,
            reset_after: None,
            handshakes: 0,
            host_rx: vec![],
            host_tx: VecDeque::new(),
            latch: Arc::new(ResetLatch::new()),
        }
    }

    /// Number of ACK polls the initiator takes to respond to REQ
    pub fn with_ack_delay(mut self, polls: u32) -> Self {
        self.ack_delay = polls;
        self
    }

    /// Initiator stops acknowledging after this many handshakes
    pub fn with_ack_budget(mut self, handshakes: usize) -> Self {
        self.ack_budget = Some(handshakes);
        self
    }

    /// Initiator pulls RST when starting this handshake (1-based)
    pub fn with_reset_after(mut self, handshakes: usize) -> Self {
        self.reset_after = Some(handshakes);
        self
    }

    /// The latch the simulated RST edge interrupt sets
    pub fn reset_latch(&self) -> Arc<ResetLatch> {
        Arc::clone(&self.latch)
    }

    /// Bytes the initiator will send during DataOut/Command phases
    pub fn queue_host_bytes(&mut self, bytes: impl IntoIterator<Item = u8>) {
        self.host_tx.extend(bytes);
    }

    /// Bytes the initiator has received so far
    pub fn host_received(&self) -> &[u8] {
        &self.host_rx
    }

    pub fn take_host_received(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.host_rx)
    }

    pub fn handshakes(&self) -> usize {
        self.handshakes
    }

    pub fn data_output(&self) -> bool {
        self.data_output
    }

    /// Initiator (de)selects the target
    pub fn set_select(&mut self, active: bool) {
        self.sel = !active;
    }

    /// Pulses RST, firing the edge interrupt
    pub fn pulse_reset(&mut self) {
        self.rst = false;
        self.latch.set();
    }

    /// Clears all scripted failure behaviour and releases RST
    pub fn heal(&mut self) {
        self.ack_budget = None;
        self.reset_after = None;
        self.rst = true;
    }

    const fn out_idx(line: BusLine) -> Option<usize> {
        match line {
            BusLine::Msg => Some(0),
            BusLine::Bsy => Some(1),
            BusLine::Req => Some(2),
            BusLine::Io => Some(3),
            BusLine::Cd => Some(4),
            _ => None,
        }
    }

    fn begin_handshake(&mut self) {
        if let Some(budget) = self.ack_budget {
            if self.handshakes >= budget {
                return;
            }
        }
        self.handshakes += 1;

        if self.reset_after == Some(self.handshakes) {
            self.pulse_reset();
        }

        if self.data_output {
            self.host_rx.push(!self.target_pins);
        } else {
            let b = self.host_tx.pop_front().unwrap_or(0);
            self.host_pins = !b;
        }
        self.ack_countdown = Some(self.ack_delay);
    }
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BusLines for SimBus {
    fn set(&mut self, line: BusLine, level: bool) {
        if let BusLine::Db(bit) = line {
            if level {
                self.target_pins |= 1 << bit;
            } else {
                self.target_pins &= !(1 << bit);
            }
            return;
        }
        let Some(idx) = Self::out_idx(line) else {
            // Inputs cannot be driven by the target
            return;
        };
        let was = self.outputs[idx];
        self.outputs[idx] = level;

        if line == BusLine::Req {
            if was && !level {
                self.begin_handshake();
            } else if !was && level {
                self.ack_countdown = None;
            }
        }
    }

    fn get(&mut self, line: BusLine) -> bool {
        match line {
            BusLine::Ack => match self.ack_countdown {
                Some(0) => false,
                Some(n) => {
                    self.ack_countdown = Some(n - 1);
                    true
                }
                None => true,
            },
            BusLine::Sel => self.sel,
            BusLine::Rst => self.rst,
            BusLine::Db(bit) => {
                let pins = if self.data_output {
                    self.target_pins
                } else {
                    self.host_pins
                };
                pins & (1 << bit) != 0
            }
            _ => Self::out_idx(line).is_some_and(|i| self.outputs[i]),
        }
    }

    fn set_data_direction(&mut self, output: bool) {
        self.data_output = output;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_follows_req() {
        let mut b = SimBus::new().with_ack_delay(2);
        assert!(b.get(BusLine::Ack));
        b.set(BusLine::Req, false);
        assert!(b.get(BusLine::Ack));
        assert!(b.get(BusLine::Ack));
        assert!(!b.get(BusLine::Ack));
        b.set(BusLine::Req, true);
        assert!(b.get(BusLine::Ack));
        assert_eq!(b.handshakes(), 1);
    }

    #[test]
    fn budget_exhausted() {
        let mut b = SimBus::new().with_ack_budget(1);
        b.set(BusLine::Req, false);
        b.set(BusLine::Req, true);
        b.set(BusLine::Req, false);
        for _ in 0..100 {
            assert!(b.get(BusLine::Ack));
        }
        assert_eq!(b.handshakes(), 1);
    }

    #[test]
    fn reset_fires_latch() {
        let mut b = SimBus::new().with_reset_after(2);
        let latch = b.reset_latch();
        b.set(BusLine::Req, false);
        b.set(BusLine::Req, true);
        assert!(!latch.peek());
        b.set(BusLine::Req, false);
        assert!(latch.peek());
        assert!(!b.get(BusLine::Rst));
        b.heal();
        assert!(b.get(BusLine::Rst));
    }
}
