//! Command codes carried in the first field of every [`Frame`].

/// Wire command codes. Code 18 is reserved (unused in the original
/// protocol) and deliberately left out of the enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CmdCode {
    Ping = 1,
    Exit = 2,
    Ack = 3,
    Result = 4,
    ResultStack = 5,
    Exception = 6,
    LoadLibrary = 7,
    UnloadLibrary = 8,
    GetSym = 9,
    Alloc = 10,
    Free = 11,
    SendBuff = 12,
    RecvBuff = 13,
    Call = 14,
    CallStackIn = 15,
    CallStackOut = 16,
    CallStackInOut = 17,
    NewPeer = 19,
}

impl CmdCode {
    pub fn from_u8(raw: u8) -> Option<CmdCode> {
        use CmdCode::*;
        let code = match raw {
            1 => Ping,
            2 => Exit,
            3 => Ack,
            4 => Result,
            5 => ResultStack,
            6 => Exception,
            7 => LoadLibrary,
            8 => UnloadLibrary,
            9 => GetSym,
            10 => Alloc,
            11 => Free,
            12 => SendBuff,
            13 => RecvBuff,
            14 => Call,
            15 => CallStackIn,
            16 => CallStackOut,
            17 => CallStackInOut,
            19 => NewPeer,
            _ => return None,
        };
        Some(code)
    }

    /// True for commands only ever sent host -> worker.
    pub fn is_request_only(self) -> bool {
        !matches!(self, CmdCode::Result | CmdCode::ResultStack | CmdCode::Exception | CmdCode::Ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_known_code() {
        for code in [
            CmdCode::Ping, CmdCode::Exit, CmdCode::Ack, CmdCode::Result, CmdCode::ResultStack,
            CmdCode::Exception, CmdCode::LoadLibrary, CmdCode::UnloadLibrary, CmdCode::GetSym,
            CmdCode::Alloc, CmdCode::Free, CmdCode::SendBuff, CmdCode::RecvBuff, CmdCode::Call,
            CmdCode::CallStackIn, CmdCode::CallStackOut, CmdCode::CallStackInOut, CmdCode::NewPeer,
        ] {
            assert_eq!(CmdCode::from_u8(code as u8), Some(code));
        }
    }

    #[test]
    fn gap_and_zero_are_unknown() {
        assert_eq!(CmdCode::from_u8(18), None);
        assert_eq!(CmdCode::from_u8(0), None);
        assert_eq!(CmdCode::from_u8(20), None);
    }
}
