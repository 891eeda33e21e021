//! Variable-length opcodes.
//!
//! ```text
//! 1 byte:  first byte top bits != 11         0x00..=0xBF
//! 2 bytes: first byte 110xxxxx               0xC000..=0xDFFF
//! 3 bytes: first byte 111xxxxx + company ID  0xE00000..=0xFFFFFF
//! ```
//!
//! The company identifier of a 3-byte opcode is carried little-endian.

use std::fmt;

use crate::core::PduError;

/// An access-layer opcode, stored as its big-endian encoded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Opcode(u32);

impl Opcode {
    /// Wrap an encoded opcode value, checking it has a valid length prefix.
    pub fn new(value: u32) -> Result<Self, PduError> {
        let valid = matches!(value, 0x00..=0xBF | 0xC000..=0xDFFF | 0xE0_0000..=0xFF_FFFF);
        if valid { Ok(Self(value)) } else { Err(PduError::InvalidOpcode) }
    }

    /// Single-byte opcode.
    pub fn single(value: u8) -> Result<Self, PduError> {
        Self::new(u32::from(value))
    }

    /// Vendor opcode: 5-bit opcode and a company identifier.
    pub const fn vendor(opcode: u8, company: u16) -> Self {
        let [lo, hi] = company.to_le_bytes();
        Self(((0xE0 | (opcode as u32 & 0x1F)) << 16) | ((lo as u32) << 8) | hi as u32)
    }

    /// Encoded value.
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Encoded length in bytes.
    pub const fn len(self) -> usize {
        if self.0 <= 0xFF {
            1
        } else if self.0 <= 0xFFFF {
            2
        } else {
            3
        }
    }

    /// Company identifier of a vendor opcode.
    pub const fn company(self) -> Option<u16> {
        if self.len() == 3 {
            Some(u16::from_le_bytes([(self.0 >> 8) as u8, self.0 as u8]))
        } else {
            None
        }
    }

    /// Wire bytes.
    pub fn to_bytes(self) -> Vec<u8> {
        let bytes = self.0.to_be_bytes();
        bytes[4 - self.len()..].to_vec()
    }

    /// Read the opcode at the start of an Access PDU.
    ///
    /// Returns the opcode and its encoded length.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), PduError> {
        let first = *data.first().ok_or(PduError::TooShort {
            expected: 1,
            actual: 0,
        })?;
        let len = match first >> 5 {
            0b110 => 2,
            0b111 => 3,
            _ => 1,
        };
        if data.len() < len {
            return Err(PduError::InvalidOpcode);
        }
        let value = data[..len]
            .iter()
            .fold(0u32, |acc, byte| (acc << 8) | u32::from(*byte));
        Ok((Self(value), len))
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#0width$x}", self.0, width = 2 + self.len() * 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lengths() {
        assert_eq!(Opcode::new(0x00).unwrap().len(), 1);
        assert_eq!(Opcode::new(0xBF).unwrap().len(), 1);
        assert_eq!(Opcode::new(0xC001).unwrap().len(), 2);
        assert_eq!(Opcode::vendor(0x01, 0x0059).len(), 3);

        assert_eq!(Opcode::new(0xC0), Err(PduError::InvalidOpcode));
        assert_eq!(Opcode::new(0x8001), Err(PduError::InvalidOpcode));
        assert_eq!(Opcode::new(0x0100_0000), Err(PduError::InvalidOpcode));
    }

    #[test]
    fn test_vendor_company_is_little_endian() {
        let opcode = Opcode::vendor(0x01, 0x0059);
        assert_eq!(opcode.to_bytes(), vec![0xE1, 0x59, 0x00]);
        assert_eq!(opcode.company(), Some(0x0059));
        assert_eq!(Opcode::new(0x42).unwrap().company(), None);
    }

    #[test]
    fn test_decode_prefixes() {
        assert_eq!(Opcode::decode(&[0x82, 0x01]).unwrap(), (Opcode(0x82), 1));
        assert_eq!(Opcode::decode(&[0xC4, 0x01, 0xFF]).unwrap(), (Opcode(0xC401), 2));
        assert_eq!(
            Opcode::decode(&[0xE1, 0x59, 0x00, 0x07]).unwrap(),
            (Opcode::vendor(0x01, 0x0059), 3)
        );
    }

    #[test]
    fn test_truncated_opcode() {
        assert_eq!(Opcode::decode(&[0xC4]), Err(PduError::InvalidOpcode));
        assert_eq!(Opcode::decode(&[0xE1, 0x59]), Err(PduError::InvalidOpcode));
        assert!(Opcode::decode(&[]).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(Opcode::new(0x05).unwrap().to_string(), "0x05");
        assert_eq!(Opcode::new(0xC401).unwrap().to_string(), "0xc401");
    }
}
