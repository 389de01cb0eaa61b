//! Shared protocol constants for the depot framed transport

/// Fixed header section: five 4-byte big-endian fields
/// (total length | action | option | message | optional length).
pub const FIXED_SECTION_LEN: usize = 20;

/// Prologue of the optional section: dataLength (8 bytes) + level count (4 bytes).
pub const OPTIONAL_PROLOGUE_LEN: usize = 12;

// Maximum accepted header length - prevents memory exhaustion from a hostile
// length prefix. Real headers carry a single path and stay far below this.
pub const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Payload transfer chunk size, both directions.
pub const IO_CHUNK: usize = 4096;

// Option bit masks (keep numeric stable for wire compat)
pub mod option_bits {
    /// PUT request: overwrite an existing file instead of failing with FILE_EXIST.
    pub const OVERWRITE: u32 = 0x01;
}

/// Request/response verbs. The ordinal is the wire encoding - a versioned
/// contract, never reorder or renumber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Action {
    None = 0,
    Put = 1,
    PutAck = 2,
    PutFin = 3,
    Get = 4,
    GetAck = 5,
    Del = 6,
    DelAck = 7,
    Lst = 8,
    LstAck = 9,
}

impl Action {
    pub fn from_ordinal(v: u32) -> Option<Action> {
        Some(match v {
            0 => Action::None,
            1 => Action::Put,
            2 => Action::PutAck,
            3 => Action::PutFin,
            4 => Action::Get,
            5 => Action::GetAck,
            6 => Action::Del,
            7 => Action::DelAck,
            8 => Action::Lst,
            9 => Action::LstAck,
            _ => return None,
        })
    }

    pub fn ordinal(self) -> u32 {
        self as u32
    }
}

/// Operation results carried in ack frames. Ordinals are wire encoding,
/// same contract as [`Action`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Message {
    None = 0,
    FileExist = 1,
    FileNotExist = 2,
    FileCreated = 3,
    FileNotCreated = 4,
    FileDeleted = 5,
    FileNotDeleted = 6,
    PermissionDenied = 7,
}

impl Message {
    pub fn from_ordinal(v: u32) -> Option<Message> {
        Some(match v {
            0 => Message::None,
            1 => Message::FileExist,
            2 => Message::FileNotExist,
            3 => Message::FileCreated,
            4 => Message::FileNotCreated,
            5 => Message::FileDeleted,
            6 => Message::FileNotDeleted,
            7 => Message::PermissionDenied,
            _ => return None,
        })
    }

    pub fn ordinal(self) -> u32 {
        self as u32
    }
}
