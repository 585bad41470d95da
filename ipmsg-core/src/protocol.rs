//! Wire protocol: command modes, option flags and version.

/// Protocol version carried in the first header field of every packet.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default UDP/TCP port shared by the packet listener and the file endpoint.
pub const DEFAULT_PORT: u16 = 2425;

/// Command mode (low byte of the command field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Mode {
    NoOperation = 0x00,
    /// Discovery: announce presence on every broadcast address.
    BrEntry = 0x01,
    /// Graceful leave.
    BrExit = 0x02,
    /// Unicast reply to `BrEntry`.
    AnsEntry = 0x03,
    /// Presence update (absence mode or name change).
    BrAbsence = 0x04,
    SendMsg = 0x20,
    /// Delivery acknowledgement; message = acknowledged packet number.
    RecvMsg = 0x21,
    /// Seal opened by the recipient; message = packet number.
    ReadMsg = 0x30,
    DelMsg = 0x31,
    AnsReadMsg = 0x32,
    GetInfo = 0x40,
    SendInfo = 0x41,
    /// TCP: request a regular file or clipboard attachment.
    GetFileData = 0x60,
    /// Attachments of a packet are no longer needed by the sender of this command.
    ReleaseFiles = 0x61,
    /// TCP: request a directory attachment as a header-framed stream.
    GetDirFiles = 0x62,
    GetPubKey = 0x72,
    AnsPubKey = 0x73,
}

impl Mode {
    /// Map the low byte of a command to a known mode. Unknown modes return `None`.
    pub fn from_code(code: u32) -> Option<Self> {
        let mode = match code & MODE_MASK {
            0x00 => Mode::NoOperation,
            0x01 => Mode::BrEntry,
            0x02 => Mode::BrExit,
            0x03 => Mode::AnsEntry,
            0x04 => Mode::BrAbsence,
            0x20 => Mode::SendMsg,
            0x21 => Mode::RecvMsg,
            0x30 => Mode::ReadMsg,
            0x31 => Mode::DelMsg,
            0x32 => Mode::AnsReadMsg,
            0x40 => Mode::GetInfo,
            0x41 => Mode::SendInfo,
            0x60 => Mode::GetFileData,
            0x61 => Mode::ReleaseFiles,
            0x62 => Mode::GetDirFiles,
            0x72 => Mode::GetPubKey,
            0x73 => Mode::AnsPubKey,
            _ => return None,
        };
        Some(mode)
    }

    pub fn code(self) -> u32 {
        self as u32
    }
}

pub const MODE_MASK: u32 = 0x0000_00ff;

/// Option flags. Entry-class and send-class flags share bit positions.
pub mod opt {
    // Entry-class.
    pub const ABSENCE: u32 = 0x0000_0100;
    pub const SERVER: u32 = 0x0000_0200;
    pub const DIALUP: u32 = 0x0001_0000;
    pub const FILEATTACH: u32 = 0x0020_0000;
    pub const ENCRYPT: u32 = 0x0040_0000;
    pub const UTF8: u32 = 0x0080_0000;
    pub const CAPUTF8: u32 = 0x0100_0000;
    pub const ENCEXTMSG: u32 = 0x0400_0000;
    pub const CLIPBOARD: u32 = 0x0800_0000;

    // Send-class.
    pub const SENDCHECK: u32 = 0x0000_0100;
    pub const SECRET: u32 = 0x0000_0200;
    pub const BROADCAST: u32 = 0x0000_0400;
    pub const MULTICAST: u32 = 0x0000_0800;
    pub const AUTORET: u32 = 0x0000_2000;
    pub const PASSWORD: u32 = 0x0000_8000;
    pub const READCHECK: u32 = 0x0010_0000;
}

/// Command field: mode plus option flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Command(pub u32);

impl Command {
    pub fn new(mode: Mode) -> Self {
        Command(mode.code())
    }

    pub fn with(self, flags: u32) -> Self {
        Command(self.0 | flags)
    }

    /// `None` for modes this engine does not know.
    pub fn mode(self) -> Option<Mode> {
        Mode::from_code(self.0)
    }

    pub fn has(self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    pub fn options(self) -> u32 {
        self.0 & !MODE_MASK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_roundtrip_and_unknown() {
        assert_eq!(Mode::from_code(0x20), Some(Mode::SendMsg));
        assert_eq!(Mode::from_code(0x20 | opt::SENDCHECK), Some(Mode::SendMsg));
        assert_eq!(Mode::from_code(0x7f), None);
    }

    #[test]
    fn command_flags() {
        let cmd = Command::new(Mode::SendMsg).with(opt::SENDCHECK | opt::SECRET);
        assert_eq!(cmd.mode(), Some(Mode::SendMsg));
        assert!(cmd.has(opt::SECRET));
        assert!(!cmd.has(opt::PASSWORD));
        assert_eq!(cmd.options(), opt::SENDCHECK | opt::SECRET);
    }
}
