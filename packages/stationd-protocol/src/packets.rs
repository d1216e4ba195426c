//! Wire framing for driver commands.
//!
//! Requests are framed as `[address, opcode, payload.., checksum]` and
//! replies as `[address, opcode | 0x80, payload.., checksum]`, where the
//! checksum is the wrapping sum of every preceding byte.

use snafu::Snafu;

use crate::opcodes::REPLY_BIT;

/// Bytes a frame carries besides its payload.
pub const FRAME_OVERHEAD: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum DecodeError {
    #[snafu(display("expected a {expected} byte reply, got {actual} bytes"))]
    Length { expected: usize, actual: usize },
    #[snafu(display("reply addressed to {actual:#04x}, expected {expected:#04x}"))]
    Address { expected: u8, actual: u8 },
    #[snafu(display("reply opcode {actual:#04x}, expected {expected:#04x}"))]
    Opcode { expected: u8, actual: u8 },
    #[snafu(display("checksum mismatch: frame says {actual:#04x}, computed {expected:#04x}"))]
    Checksum { expected: u8, actual: u8 },
    #[snafu(display("reply is for parameter {actual:#06x}, expected {expected:#06x}"))]
    Parameter { expected: u16, actual: u16 },
    #[snafu(display("driver rejected the request (code {code:#04x})"))]
    Rejected { code: u8 },
}

pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Builds a request frame for `opcode` addressed to `address`.
pub fn encode_request(address: u8, opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    frame.push(address);
    frame.push(opcode);
    frame.extend_from_slice(payload);
    frame.push(checksum(&frame));
    frame
}

/// Builds the reply a driver sends for `opcode`. Used by simulators and tests.
pub fn encode_reply(address: u8, opcode: u8, payload: &[u8]) -> Vec<u8> {
    encode_request(address, opcode | REPLY_BIT, payload)
}

/// Validates a reply frame and returns its payload.
pub fn open_reply(
    address: u8,
    opcode: u8,
    payload_len: usize,
    frame: &[u8],
) -> Result<&[u8], DecodeError> {
    let expected = payload_len + FRAME_OVERHEAD;
    if frame.len() != expected {
        return Err(DecodeError::Length {
            expected,
            actual: frame.len(),
        });
    }

    let (body, sum) = frame.split_at(frame.len() - 1);
    let computed = checksum(body);
    if computed != sum[0] {
        return Err(DecodeError::Checksum {
            expected: computed,
            actual: sum[0],
        });
    }
    if body[0] != address {
        return Err(DecodeError::Address {
            expected: address,
            actual: body[0],
        });
    }
    if body[1] != opcode | REPLY_BIT {
        return Err(DecodeError::Opcode {
            expected: opcode | REPLY_BIT,
            actual: body[1],
        });
    }

    Ok(&body[2..])
}

bitflags::bitflags! {
    /// Status flags reported by a driver.
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub struct DeviceStatus: u8 {
        const RUNNING = 0b0000_0001;
        const OVERTEMPERATURE = 0b0000_0010;
        const OPEN_LOAD = 0b0000_0100;
        const SHORT_CIRCUIT = 0b0000_1000;
        const CONFIG_LOCKED = 0b0001_0000;
    }
}

impl DeviceStatus {
    /// Flags that mean the driver cannot be programmed or run.
    pub const FAULTS: Self = Self::OVERTEMPERATURE
        .union(Self::OPEN_LOAD)
        .union(Self::SHORT_CIRCUIT);

    pub fn has_fault(self) -> bool {
        self.intersects(Self::FAULTS)
    }
}

/// Identification returned by [`Connect`](crate::commands::Connect).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DeviceInfo {
    pub firmware: (u8, u8),
    pub status: DeviceStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_layout() {
        let frame = encode_request(0x07, 0x02, &[0x00, 0x10]);
        assert_eq!(frame, vec![0x07, 0x02, 0x00, 0x10, 0x19]);
    }

    #[test]
    fn reply_with_bad_checksum_is_rejected() {
        let mut frame = encode_reply(0x07, 0x04, &[0x01]);
        frame[3] = frame[3].wrapping_add(1);
        assert!(matches!(
            open_reply(0x07, 0x04, 1, &frame),
            Err(DecodeError::Checksum { .. })
        ));
    }

    #[test]
    fn reply_from_other_unit_is_rejected() {
        let frame = encode_reply(0x08, 0x04, &[0x01]);
        assert_eq!(
            open_reply(0x07, 0x04, 1, &frame),
            Err(DecodeError::Address {
                expected: 0x07,
                actual: 0x08
            })
        );
    }

    #[test]
    fn request_echo_is_not_a_reply() {
        // A line echo of the request must never be mistaken for the answer.
        let frame = encode_request(0x07, 0x04, &[0x01]);
        assert!(matches!(
            open_reply(0x07, 0x04, 1, &frame),
            Err(DecodeError::Opcode { .. })
        ));
    }

    #[test]
    fn fault_flags() {
        assert!(!DeviceStatus::RUNNING.has_fault());
        assert!((DeviceStatus::RUNNING | DeviceStatus::OPEN_LOAD).has_fault());
    }
}
