use bitflags::bitflags;

bitflags! {
    /// The 10 flag bits of the frame header word. Bit assignments are shared
    /// across frame types; the aliases below spell out the per-type meaning.
    ///
    /// https://rsocket.io/about/protocol/#frame-header-format
    #[repr(transparent)]
    pub struct Flags: u16 {
        /// The frame may be dropped by a receiver that cannot handle it.
        const IGNORE = 0x0200;
        /// Metadata (and its 24-bit length, where the layout carries one) is present.
        const METADATA = 0x0100;
        /// More fragments of this frame follow.
        const FOLLOWS = 0x0080;
        /// On SETUP: the client requests resume capability.
        const RESUME = 0x0080;
        /// On KEEPALIVE: the receiver must answer with a KEEPALIVE of its own.
        const RESPOND = 0x0080;
        /// The sending direction of the stream is complete.
        const COMPLETE = 0x0040;
        /// On SETUP: the client will honor LEASE frames.
        const LEASE = 0x0040;
        /// Payload data and/or metadata is present (a "next" element).
        const NEXT = 0x0020;
    }
}

impl Flags {
    /// Mask of the bits that fit the 10-bit flag field.
    pub const MASK: u16 = 0x03FF;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_positions() {
        assert_eq!(Flags::IGNORE.bits(), 0b10_0000_0000);
        assert_eq!(Flags::METADATA.bits(), 0b01_0000_0000);
        assert_eq!(Flags::FOLLOWS.bits(), 0b00_1000_0000);
        assert_eq!(Flags::COMPLETE.bits(), 0b00_0100_0000);
        assert_eq!(Flags::NEXT.bits(), 0b00_0010_0000);
    }

    #[test]
    fn aliases_share_bits() {
        assert_eq!(Flags::RESUME, Flags::FOLLOWS);
        assert_eq!(Flags::RESPOND, Flags::FOLLOWS);
        assert_eq!(Flags::LEASE, Flags::COMPLETE);
    }

    #[test]
    fn truncation_drops_type_bits() {
        let word = 0xFC00 | Flags::METADATA.bits();
        assert_eq!(Flags::from_bits_truncate(word), Flags::METADATA);
    }
}
