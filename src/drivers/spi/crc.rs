//! SD CRCs: CRC7 for command frames, CRC16-CCITT for data blocks

/// CRC7 (x^7 + x^3 + 1) of `data`, returned as the frame's last byte:
/// CRC in bits 7:1 and the end bit set
pub fn crc7(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in data {
        let mut d = byte;
        for _ in 0..8 {
            crc <<= 1;
            if (d ^ crc) & 0x80 != 0 {
                crc ^= 0x09;
            }
            d <<= 1;
        }
    }
    (crc << 1) | 1
}

/// CRC16-CCITT (x^16 + x^12 + x^5 + 1, initial value 0) of `data`
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0u16;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x1021 } else { crc << 1 };
        }
    }
    crc
}
