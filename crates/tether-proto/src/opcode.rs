/// Operation code carried in every frame header.
///
/// Values are stable on the wire; new opcodes must take unused values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    /// Client handshake carrying API key and optional user credentials
    Connect = 0x0001,
    /// Server acknowledgement of a handshake, assigns the connection id
    Connected = 0x0002,
    /// Graceful close
    Goodbye = 0x0003,
    /// Server-pushed chat event (also used for health checks in both directions)
    Event = 0x0010,
    /// Outbound chat message
    SendMessage = 0x0011,
    /// Server error report
    Error = 0x00FF,
}

impl Opcode {
    /// Wire value.
    #[must_use]
    pub const fn to_u16(self) -> u16 {
        self as u16
    }

    /// Parse a wire value. `None` if unassigned.
    #[must_use]
    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(Self::Connect),
            0x0002 => Some(Self::Connected),
            0x0003 => Some(Self::Goodbye),
            0x0010 => Some(Self::Event),
            0x0011 => Some(Self::SendMessage),
            0x00FF => Some(Self::Error),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unassigned_values_are_rejected() {
        assert_eq!(Opcode::from_u16(0x0000), None);
        assert_eq!(Opcode::from_u16(0x0004), None);
        assert_eq!(Opcode::from_u16(0xFFFF), None);
    }

    #[test]
    fn assigned_values_map_back() {
        for op in [
            Opcode::Connect,
            Opcode::Connected,
            Opcode::Goodbye,
            Opcode::Event,
            Opcode::SendMessage,
            Opcode::Error,
        ] {
            assert_eq!(Opcode::from_u16(op.to_u16()), Some(op));
        }
    }
}
