//! Checksums used by instrument framings.

/// Checksum carried as a `:XX` suffix on text lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checksum {
    /// Two's complement of the byte sum (longitudinal redundancy check).
    Lrc8,
    /// XOR of all bytes.
    Xor8,
}

impl Checksum {
    /// Compute over `data`.
    pub fn compute(self, data: &[u8]) -> u8 {
        match self {
            Checksum::Lrc8 => lrc8(data),
            Checksum::Xor8 => xor8(data),
        }
    }
}

/// Two's complement of the 8-bit byte sum, so that the sum of data and
/// checksum is zero.
pub fn lrc8(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
        .wrapping_neg()
}

/// XOR of all bytes.
pub fn xor8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc ^ b)
}

/// CRC-16/Modbus, transmitted little-endian.
#[cfg(feature = "crc")]
pub fn crc16_modbus(data: &[u8]) -> u16 {
    use crc::{Crc, CRC_16_MODBUS};
    Crc::<u16>::new(&CRC_16_MODBUS).checksum(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lrc8_sums_to_zero() {
        let data = b"01 0 OK IDLE -- 0";
        let sum = data
            .iter()
            .fold(lrc8(data), |acc, &b| acc.wrapping_add(b));
        assert_eq!(sum, 0);
        assert_eq!(lrc8(data), 0x8D);
    }

    #[test]
    fn test_xor8() {
        assert_eq!(xor8(&[0x01, 0x02, 0x04]), 0x07);
        assert_eq!(xor8(&[]), 0);
    }

    #[cfg(feature = "crc")]
    #[test]
    fn test_crc16_modbus_known_vector() {
        // Read holding registers: slave 1, fn 3, start 0, count 1
        assert_eq!(crc16_modbus(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]), 0x0A84);
    }
}
