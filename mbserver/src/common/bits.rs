pub(crate) fn num_bytes_for_bits(count: u16) -> usize {
    (count as usize + 7) / 8
}

/// pack bits LSB first, as the Modbus specification requires for coils and discrete inputs
pub(crate) fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; (bits.len() + 7) / 8];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

/// iterator over `count` bits packed LSB first into `bytes`
pub(crate) fn unpack_bits(bytes: &[u8], count: u16) -> impl Iterator<Item = bool> + '_ {
    (0..count as usize).map(move |i| match bytes.get(i / 8) {
        Some(byte) => (*byte & (1 << (i % 8))) != 0,
        None => false,
    })
}
