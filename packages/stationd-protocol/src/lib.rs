//! Command/response protocol spoken by LED driver units on the station's serial line.
//!
//! [`ProtocolMaster`] owns the byte stream and runs at most one command at a
//! time. The driver commands themselves live in [`commands`] and their wire
//! framing in [`packets`].

pub mod commands;
pub mod master;
pub mod packets;

pub use master::{Command, MasterError, MasterOptions, ProtocolMaster, open_serial};

/// Driver command opcodes. Replies echo the opcode with [`REPLY_BIT`] set.
pub mod opcodes {
    pub const CONNECT: u8 = 0x01;

    // Parameter access
    pub const READ_PARAMETER: u8 = 0x02;
    pub const WRITE_PARAMETER: u8 = 0x03;

    // Output control
    pub const RUN: u8 = 0x04;
    pub const STOP: u8 = 0x05;

    pub const REPLY_BIT: u8 = 0x80;
}
