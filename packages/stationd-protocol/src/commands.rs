//! Driver commands and the address-qualified helpers built on them.

use crate::{
    MasterError, ProtocolMaster,
    master::Command,
    opcodes::{CONNECT, READ_PARAMETER, RUN, STOP, WRITE_PARAMETER},
    packets::{DecodeError, DeviceInfo, DeviceStatus, FRAME_OVERHEAD, open_reply},
};

/// Opens a session with the driver and reads its identification.
#[derive(Debug, Clone, Copy)]
pub struct Connect;

impl Command for Connect {
    type Output = DeviceInfo;

    fn opcode(&self) -> u8 {
        CONNECT
    }

    fn response_len(&self) -> usize {
        3 + FRAME_OVERHEAD
    }

    fn decode(&self, address: u8, response: &[u8]) -> Result<DeviceInfo, DecodeError> {
        let payload = open_reply(address, CONNECT, 3, response)?;
        Ok(DeviceInfo {
            firmware: (payload[0], payload[1]),
            status: DeviceStatus::from_bits_retain(payload[2]),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReadParameter {
    pub id: u16,
}

impl Command for ReadParameter {
    type Output = u16;

    fn opcode(&self) -> u8 {
        READ_PARAMETER
    }

    fn payload(&self) -> Vec<u8> {
        self.id.to_be_bytes().to_vec()
    }

    fn response_len(&self) -> usize {
        4 + FRAME_OVERHEAD
    }

    fn decode(&self, address: u8, response: &[u8]) -> Result<u16, DecodeError> {
        let payload = open_reply(address, READ_PARAMETER, 4, response)?;
        check_parameter(self.id, payload)?;
        Ok(u16::from_be_bytes([payload[2], payload[3]]))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WriteParameter {
    pub id: u16,
    pub value: u16,
}

impl Command for WriteParameter {
    type Output = ();

    fn opcode(&self) -> u8 {
        WRITE_PARAMETER
    }

    fn payload(&self) -> Vec<u8> {
        let mut payload = self.id.to_be_bytes().to_vec();
        payload.extend(self.value.to_be_bytes());
        payload
    }

    fn response_len(&self) -> usize {
        3 + FRAME_OVERHEAD
    }

    fn decode(&self, address: u8, response: &[u8]) -> Result<(), DecodeError> {
        let payload = open_reply(address, WRITE_PARAMETER, 3, response)?;
        check_parameter(self.id, payload)?;
        match payload[2] {
            0 => Ok(()),
            code => Err(DecodeError::Rejected { code }),
        }
    }
}

/// Switches the driver output on.
#[derive(Debug, Clone, Copy)]
pub struct Run;

impl Command for Run {
    type Output = DeviceStatus;

    fn opcode(&self) -> u8 {
        RUN
    }

    fn response_len(&self) -> usize {
        1 + FRAME_OVERHEAD
    }

    fn decode(&self, address: u8, response: &[u8]) -> Result<DeviceStatus, DecodeError> {
        decode_status(address, RUN, response)
    }
}

/// Switches the driver output off.
#[derive(Debug, Clone, Copy)]
pub struct Stop;

impl Command for Stop {
    type Output = DeviceStatus;

    fn opcode(&self) -> u8 {
        STOP
    }

    fn response_len(&self) -> usize {
        1 + FRAME_OVERHEAD
    }

    fn decode(&self, address: u8, response: &[u8]) -> Result<DeviceStatus, DecodeError> {
        decode_status(address, STOP, response)
    }
}

fn decode_status(address: u8, opcode: u8, response: &[u8]) -> Result<DeviceStatus, DecodeError> {
    let payload = open_reply(address, opcode, 1, response)?;
    Ok(DeviceStatus::from_bits_retain(payload[0]))
}

fn check_parameter(expected: u16, payload: &[u8]) -> Result<(), DecodeError> {
    let actual = u16::from_be_bytes([payload[0], payload[1]]);
    if actual != expected {
        return Err(DecodeError::Parameter { expected, actual });
    }
    Ok(())
}

impl ProtocolMaster {
    pub async fn connect(&self) -> Result<DeviceInfo, MasterError> {
        self.execute(Connect).await
    }

    pub async fn read_parameter(&self, id: u16) -> Result<u16, MasterError> {
        self.execute(ReadParameter { id }).await
    }

    pub async fn write_parameter(&self, id: u16, value: u16) -> Result<(), MasterError> {
        self.execute(WriteParameter { id, value }).await
    }

    pub async fn run(&self) -> Result<DeviceStatus, MasterError> {
        self.execute(Run).await
    }

    pub async fn stop(&self) -> Result<DeviceStatus, MasterError> {
        self.execute(Stop).await
    }
}
