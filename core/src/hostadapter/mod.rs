//! SCSI host adapter signal driver
//!
//! All SCSI signals and data lines are active-low on the wire. The platform
//! layer ([`BusLines`]) deals in raw pin levels; everything above it in this
//! module deals in logical (active-high) values and inverts at the boundary.

pub mod simbus;

use std::sync::Arc;

use log::*;

use crate::error::{DriveError, DriveResult};
use crate::types::{ResetLatch, SECTOR_SIZE, Sector};

/// Default handshake spin limit (iterations per byte, not wall-clock)
pub const DEFAULT_SPIN_LIMIT: u32 = 100_000;

/// A physical line on the SCSI bus as seen by the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::IntoStaticStr)]
pub enum BusLine {
    // Inputs
    Rst,
    Ack,
    Sel,

    // Outputs
    Msg,
    Bsy,
    Req,
    Io,
    Cd,

    /// Data bus bit (0-7)
    Db(u8),
}

impl BusLine {
    /// Data bus lines, LSB first
    pub const DATA: [Self; 8] = [
        Self::Db(0),
        Self::Db(1),
        Self::Db(2),
        Self::Db(3),
        Self::Db(4),
        Self::Db(5),
        Self::Db(6),
        Self::Db(7),
    ];

    /// Lines driven by the target at all times
    pub const OUTPUTS: [Self; 5] = [Self::Msg, Self::Bsy, Self::Req, Self::Io, Self::Cd];
}

/// Pin-level access to the bus, implemented once per platform.
///
/// Levels are electrical: `true` is a high pin, which is the inactive state
/// for every SCSI line.
pub trait BusLines {
    fn set(&mut self, line: BusLine, level: bool);
    fn get(&mut self, line: BusLine) -> bool;

    /// Switches the data bus pins between driven (`true`) and sensed.
    fn set_data_direction(&mut self, output: bool);
}

/// Target-side SCSI-1 handshake driver
pub struct HostAdapter<B: BusLines> {
    lines: B,
    reset: Arc<ResetLatch>,

    /// Iteration ceiling for a single REQ/ACK wait
    spin_limit: u32,

    /// Last aborted transfer ran into the spin limit (rather than RST)
    timed_out: bool,
}

impl<B: BusLines> HostAdapter<B> {
    /// Takes ownership of the bus lines and puts them in the idle state.
    pub fn new(lines: B, reset: Arc<ResetLatch>, spin_limit: u32) -> Self {
        let mut adapter = Self {
            lines,
            reset,
            spin_limit: spin_limit.max(1),
            timed_out: false,
        };
        adapter.release_bus();
        adapter
    }

    /// Returns the latch for the platform's RST interrupt handler
    pub fn reset_latch(&self) -> Arc<ResetLatch> {
        Arc::clone(&self.reset)
    }

    pub fn lines(&self) -> &B {
        &self.lines
    }

    pub fn lines_mut(&mut self) -> &mut B {
        &mut self.lines
    }

    /// Returns all lines to idle after the host signalled reset
    pub fn reset(&mut self) {
        self.release_bus();
        self.timed_out = false;
        info!("Host adapter has been reset");
    }

    fn release_bus(&mut self) {
        self.lines.set_data_direction(false);
        for line in BusLine::OUTPUTS {
            self.lines.set(line, true);
        }
    }

    fn assert_line(&mut self, line: BusLine, active: bool) {
        self.lines.set(line, !active);
    }

    fn line_active(&mut self, line: BusLine) -> bool {
        !self.lines.get(line)
    }

    pub fn set_data_direction(&mut self, output: bool) {
        self.lines.set_data_direction(output);
    }

    /// Reads the (inverted) data bus
    fn read_databus(&mut self) -> u8 {
        let mut pins = 0;
        for (bit, line) in BusLine::DATA.into_iter().enumerate() {
            if self.lines.get(line) {
                pins |= 1 << bit;
            }
        }
        !pins
    }

    /// Drives the data bus with the inverted value
    fn write_databus(&mut self, val: u8) {
        let pins = !val;
        for (bit, line) in BusLine::DATA.into_iter().enumerate() {
            self.lines.set(line, pins & (1 << bit) != 0);
        }
    }

    /// Spins until ACK is asserted. Returns false if the spin limit ran out
    /// or the reset latch was set.
    fn wait_ack(&mut self) -> bool {
        let mut spins = 0;
        while !self.line_active(BusLine::Ack) {
            if self.reset.peek() {
                return false;
            }
            spins += 1;
            if spins >= self.spin_limit {
                // Host went away, treat as a reset
                self.timed_out = true;
                self.reset.set();
                return false;
            }
        }
        true
    }

    /// Reads a single byte from the host with a REQ/ACK handshake.
    ///
    /// On an aborted handshake the returned value is meaningless; callers
    /// must check [`Self::read_reset_flag`].
    pub fn read_byte(&mut self) -> u8 {
        if self.reset.peek() {
            return 0;
        }
        self.assert_line(BusLine::Req, true);
        self.wait_ack();
        self.assert_line(BusLine::Req, false);
        self.read_databus()
    }

    /// Writes a single byte to the host with a REQ/ACK handshake.
    pub fn write_byte(&mut self, val: u8) {
        if self.reset.peek() {
            return;
        }
        self.write_databus(val);
        self.assert_line(BusLine::Req, true);
        self.wait_ack();
        self.assert_line(BusLine::Req, false);
    }

    /// Host reads a sector from the target.
    /// Returns the number of bytes the host actually acknowledged.
    pub fn perform_block_read(&mut self, data: &Sector) -> usize {
        for (i, &b) in data.iter().enumerate() {
            if self.reset.peek() {
                return i;
            }
            self.write_databus(b);
            self.assert_line(BusLine::Req, true);
            if !self.wait_ack() {
                self.assert_line(BusLine::Req, false);
                return i;
            }
            self.assert_line(BusLine::Req, false);
        }
        SECTOR_SIZE
    }

    /// Host writes a sector to the target.
    /// Returns the number of bytes actually received.
    pub fn perform_block_write(&mut self, data: &mut Sector) -> usize {
        for i in 0..SECTOR_SIZE {
            if self.reset.peek() {
                return i;
            }
            self.assert_line(BusLine::Req, true);
            if !self.wait_ack() {
                self.assert_line(BusLine::Req, false);
                return i;
            }
            data[i] = self.read_databus();
            self.assert_line(BusLine::Req, false);
        }
        SECTOR_SIZE
    }

    /// Classifies the result of a block transfer
    pub fn check_transfer(&self, transferred: usize) -> DriveResult<()> {
        if transferred == SECTOR_SIZE && !self.reset.peek() {
            Ok(())
        } else if self.timed_out {
            Err(DriveError::BusTimeout { transferred })
        } else {
            Err(DriveError::BusReset { transferred })
        }
    }

    pub fn write_reset_flag(&mut self, val: bool) {
        if !val {
            self.timed_out = false;
        }
        self.reset.write(val);
    }

    pub fn read_reset_flag(&self) -> bool {
        self.reset.peek()
    }

    /// Sets the phase lines and turns the data bus around to match I/O
    pub fn write_data_phase_flags(
        &mut self,
        message: bool,
        command_not_data: bool,
        input_not_output: bool,
    ) {
        self.assert_line(BusLine::Msg, message);
        self.assert_line(BusLine::Cd, command_not_data);
        self.assert_line(BusLine::Io, input_not_output);
        self.lines.set_data_direction(input_not_output);
    }

    pub fn write_busy_flag(&mut self, active: bool) {
        self.assert_line(BusLine::Bsy, active);
    }

    pub fn write_request_flag(&mut self, active: bool) {
        self.assert_line(BusLine::Req, active);
    }

    pub fn read_select_flag(&mut self) -> bool {
        self.line_active(BusLine::Sel)
    }
}
