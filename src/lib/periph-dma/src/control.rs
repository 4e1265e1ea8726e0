//! Control commands, encoded the way the character device's ioctl interface encodes them.

use crate::{
    device::{AddrMode, DmaDevice, TransferMode},
    error::{Error, Result},
};

/// Type byte shared by every command of this device.
pub const IOC_MAGIC: u8 = 0xe7;

pub const NR_OPMODE: u8 = 3;
pub const NR_BRIDGE: u8 = 5;
pub const NR_INCRADDR: u8 = 7;

const NR_SHIFT: u32 = 0;
const TYPE_SHIFT: u32 = 8;
const SIZE_SHIFT: u32 = 16;
const DIR_SHIFT: u32 = 30;
const SIZE_MASK: u32 = (1 << 14) - 1;

bitflags::bitflags! {
    /// Data direction bits of a command, from the caller's point of view.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct IocDir : u32 {
        const WRITE = 1;
        const READ = 2;
    }
}

/// Encode a command number.
pub const fn ioc(dir: IocDir, ty: u8, nr: u8, size: u32) -> u32 {
    (dir.bits() << DIR_SHIFT)
        | ((size & SIZE_MASK) << SIZE_SHIFT)
        | ((ty as u32) << TYPE_SHIFT)
        | ((nr as u32) << NR_SHIFT)
}

pub const SET_OPMODE: u32 = ioc(IocDir::WRITE, IOC_MAGIC, NR_OPMODE, 0);
pub const GET_OPMODE: u32 = ioc(IocDir::READ, IOC_MAGIC, NR_OPMODE, 0);
pub const SET_BRIDGE: u32 = ioc(IocDir::WRITE, IOC_MAGIC, NR_BRIDGE, 0);
pub const GET_BRIDGE: u32 = ioc(IocDir::READ, IOC_MAGIC, NR_BRIDGE, 0);
pub const SET_INCRADDR: u32 = ioc(IocDir::WRITE, IOC_MAGIC, NR_INCRADDR, 0);
pub const GET_INCRADDR: u32 = ioc(IocDir::READ, IOC_MAGIC, NR_INCRADDR, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// A decoded control command.
pub enum Command {
    GetMode,
    SetMode(TransferMode),
    GetAddrMode,
    SetAddrMode(AddrMode),
}

impl Command {
    /// Decode a command number and its argument.
    pub fn decode(cmd: u32, arg: u64) -> Result<Self> {
        let ty = ((cmd >> TYPE_SHIFT) & 0xff) as u8;
        let nr = ((cmd >> NR_SHIFT) & 0xff) as u8;
        let dir = IocDir::from_bits_truncate(cmd >> DIR_SHIFT);
        if ty != IOC_MAGIC {
            return Err(Error::UnknownCommand);
        }
        let read = dir == IocDir::READ;
        Ok(match nr {
            NR_OPMODE if read => Command::GetMode,
            NR_OPMODE => Command::SetMode(TransferMode::try_from(arg)?),
            NR_INCRADDR if read => Command::GetAddrMode,
            NR_INCRADDR => Command::SetAddrMode(AddrMode::try_from(arg)?),
            _ => return Err(Error::UnknownCommand),
        })
    }
}

impl DmaDevice {
    /// Execute a control command. Reads return the current value, writes return 0.
    pub fn control(&self, cmd: u32, arg: u64) -> Result<u64> {
        let command = Command::decode(cmd, arg).inspect_err(|e| {
            tracing::error!("control command {:#x} (arg {}): {}", cmd, arg, e);
        })?;
        Ok(match command {
            Command::GetMode => self.mode() as u64,
            Command::SetMode(mode) => {
                self.set_mode(mode);
                0
            }
            Command::GetAddrMode => self.addr_mode() as u64,
            Command::SetAddrMode(mode) => {
                self.set_addr_mode(mode);
                0
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_numbers() {
        assert_eq!(SET_OPMODE, 0x4000_e703);
        assert_eq!(GET_OPMODE, 0x8000_e703);
        assert_eq!(GET_INCRADDR, 0x8000_e707);
        assert_eq!(SET_BRIDGE, 0x4000_e705);
    }

    #[test]
    fn decode() {
        assert_eq!(Command::decode(GET_OPMODE, 0), Ok(Command::GetMode));
        assert_eq!(
            Command::decode(SET_OPMODE, 2),
            Ok(Command::SetMode(TransferMode::ScatterGather))
        );
        assert_eq!(
            Command::decode(SET_INCRADDR, 0),
            Ok(Command::SetAddrMode(AddrMode::Incrementing))
        );
        assert_eq!(Command::decode(GET_INCRADDR, 0), Ok(Command::GetAddrMode));
    }

    #[test]
    fn decode_rejects() {
        assert_eq!(Command::decode(GET_BRIDGE, 0), Err(Error::UnknownCommand));
        assert_eq!(Command::decode(SET_BRIDGE, 1), Err(Error::UnknownCommand));
        assert_eq!(
            Command::decode(ioc(IocDir::READ, 0x42, NR_OPMODE, 0), 0),
            Err(Error::UnknownCommand)
        );
        assert_eq!(Command::decode(SET_OPMODE, 3), Err(Error::UnsupportedMode));
        assert_eq!(Command::decode(SET_INCRADDR, 7), Err(Error::UnsupportedMode));
    }
}
