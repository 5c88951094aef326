use crate::error::Error;
use heapless::Deque;

/// Slots of the pending command pool.
pub const COMMAND_SLOTS: usize = 2;

#[derive(strum::FromRepr, strum::Display, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Opcode {
    StopRec = 1,
    StartRec = 2,
    StopRead = 3,
    StartRead = 4,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    StopRecording,
    StartRecording,
    StopRead,
    /// Read logical sectors `start..end`.
    StartRead { start: u32, end: u32 },
}

impl Command {
    /// Parses a control write. The accepted forms are
    ///
    /// ```text
    /// [opcode]                          start = 0, end = u32::MAX
    /// [opcode, start: u32]              end = u32::MAX
    /// [opcode, start: u32, end: u32]    requires start < end
    /// ```
    ///
    /// with little endian integers.
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        let (opcode, start, end) = match bytes {
            [opcode] => (*opcode, 0, u32::MAX),
            [opcode, start @ ..] if start.len() == 4 => (*opcode, le_u32(start), u32::MAX),
            [opcode, range @ ..] if range.len() == 8 => {
                let (start, end) = (le_u32(&range[..4]), le_u32(&range[4..]));
                if start >= end {
                    return Err(Error::InvalidReadRange);
                }
                (*opcode, start, end)
            }
            _ => return Err(Error::MalformedCommand),
        };

        match Opcode::from_repr(opcode) {
            Some(Opcode::StopRec) => Ok(Command::StopRecording),
            Some(Opcode::StartRec) => Ok(Command::StartRecording),
            Some(Opcode::StopRead) => Ok(Command::StopRead),
            Some(Opcode::StartRead) => Ok(Command::StartRead { start, end }),
            None => Err(Error::UnknownCommand(opcode)),
        }
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Command::StopRecording => Opcode::StopRec,
            Command::StartRecording => Opcode::StartRec,
            Command::StopRead => Opcode::StopRead,
            Command::StartRead { .. } => Opcode::StartRead,
        }
    }
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Commands accepted from the link but not yet executed by the task.
#[derive(Default)]
pub struct CommandQueue {
    pending: Deque<Command, COMMAND_SLOTS>,
}

impl CommandQueue {
    pub const fn new() -> Self {
        Self {
            pending: Deque::new(),
        }
    }

    pub fn push(&mut self, command: Command) -> Result<(), Error> {
        self.pending
            .push_back(command)
            .map_err(|_| Error::CommandQueueFull)
    }

    pub fn pop(&mut self) -> Option<Command> {
        self.pending.pop_front()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
