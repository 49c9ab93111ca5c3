//! Configuration frames for the acquisition firmware.
//!
//! Every frame is 12 bytes: `12 34 00 0F <cmd> <sub> <p0> <p1> <p2> <p3> AB CD`, where the
//! four payload bytes carry a big-endian parameter.
use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, UdpSocket};

use super::constants::*;
use super::device::CardClaim;
use super::error::{CommandError, DeviceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    DeadTime,
    TriggerThreshold,
    WaveformMode,
    SpectrumRefresh,
    WorkMode,
    StartStop,
}

impl Command {
    pub fn code(&self) -> u8 {
        match self {
            Self::DeadTime => 0x01,
            Self::TriggerThreshold => 0x02,
            Self::WaveformMode => 0x03,
            Self::SpectrumRefresh => 0x04,
            Self::WorkMode => 0x05,
            Self::StartStop => 0x06,
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = CommandError;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::DeadTime),
            0x02 => Ok(Self::TriggerThreshold),
            0x03 => Ok(Self::WaveformMode),
            0x04 => Ok(Self::SpectrumRefresh),
            0x05 => Ok(Self::WorkMode),
            0x06 => Ok(Self::StartStop),
            _ => Err(CommandError::UnknownCommand(value)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame {
    pub command: Command,
    pub sub: u8,
    pub parameter: u32,
}

impl CommandFrame {
    pub fn new(command: Command, sub: u8, parameter: u32) -> Self {
        Self {
            command,
            sub,
            parameter,
        }
    }

    pub fn encode(&self) -> [u8; COMMAND_FRAME_SIZE] {
        let mut frame = [0u8; COMMAND_FRAME_SIZE];
        frame[0..4].copy_from_slice(&COMMAND_FRAME_HEAD);
        frame[4] = self.command.code();
        frame[5] = self.sub;
        BigEndian::write_u32(&mut frame[6..10], self.parameter);
        frame[10..12].copy_from_slice(&COMMAND_FRAME_TAIL);
        frame
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CommandError> {
        if bytes.len() != COMMAND_FRAME_SIZE {
            return Err(CommandError::BadLength(bytes.len()));
        }
        if bytes[0..4] != COMMAND_FRAME_HEAD || bytes[10..12] != COMMAND_FRAME_TAIL {
            return Err(CommandError::BadEnvelope);
        }
        Ok(Self {
            command: Command::try_from(bytes[4])?,
            sub: bytes[5],
            parameter: BigEndian::read_u32(&bytes[6..10]),
        })
    }
}

/// Where configuration frames are delivered
pub trait CommandLink: Send {
    fn send(&mut self, frame: &CommandFrame) -> Result<(), CommandError>;
}

/// Sends frames as UDP datagrams to the instrument's configured address
#[derive(Debug)]
pub struct UdpCommandLink {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpCommandLink {
    pub fn connect(target: SocketAddr) -> Result<Self, CommandError> {
        let bind: SocketAddr = if target.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind)?;
        spdlog::info!("Command link bound to {} for {target}", socket.local_addr()?);
        Ok(Self { socket, target })
    }
}

impl CommandLink for UdpCommandLink {
    fn send(&mut self, frame: &CommandFrame) -> Result<(), CommandError> {
        self.socket.send_to(&frame.encode(), self.target)?;
        spdlog::debug!("Sent {:?} to {}", frame, self.target);
        Ok(())
    }
}

/// Write a frame straight to a claimed card's control register
pub fn write_to_card(claim: &CardClaim<'_>, frame: &CommandFrame) -> Result<(), DeviceError> {
    claim.write_frame(&frame.encode())
}
