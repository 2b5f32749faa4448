pub(crate) fn num_bytes_for_bits(count: u16) -> usize {
    (count as usize + 7) / 8
}

/// pack a slice of bits LSB-first into bytes, as they appear on the wire
pub(crate) fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; (bits.len() + 7) / 8];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

/// retrieve bit `index` from LSB-first packed bytes
pub(crate) fn get_bit(bytes: &[u8], index: usize) -> bool {
    match bytes.get(index / 8) {
        Some(byte) => (*byte & (1 << (index % 8))) != 0,
        None => false,
    }
}
