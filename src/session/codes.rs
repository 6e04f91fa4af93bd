use std::fmt;

/// Single-byte control codes exchanged with participant clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlCode {
    Heartbeat = 0,
    NextScreen = 1,
    Disconnect = 2,
    SubmissionFinished = 3,
}

impl ControlCode {
    pub fn byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(b: u8) -> Option<ControlCode> {
        match b {
            0 => Some(ControlCode::Heartbeat),
            1 => Some(ControlCode::NextScreen),
            2 => Some(ControlCode::Disconnect),
            3 => Some(ControlCode::SubmissionFinished),
            _ => None,
        }
    }
}

impl fmt::Display for ControlCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ControlCode::Heartbeat => "HEARTBEAT",
            ControlCode::NextScreen => "NEXT_SCREEN",
            ControlCode::Disconnect => "DISCONNECT",
            ControlCode::SubmissionFinished => "SUBMISSION_FINISHED",
        };
        f.write_str(s)
    }
}
