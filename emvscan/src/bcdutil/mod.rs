const ASCII_CHARACTER_0: u8 = 0x30;

fn nibbles(bcd_data: &[u8]) -> impl Iterator<Item = u8> + '_ {
    bcd_data.iter().flat_map(|byte| [byte >> 4, byte & 0xF])
}

// Strict decode: every nibble must be a digit, except 0xF padding at the very end
pub fn bcd_to_ascii(bcd_data: &[u8]) -> Option<Vec<u8>> {
    let mut ascii_output: Vec<u8> = Vec::with_capacity(bcd_data.len() * 2);

    for (i, &byte) in bcd_data.iter().enumerate() {
        if byte == 0xFF {
            break;
        }

        let n2 = byte >> 4;
        let n1 = byte & 0xF;

        if n2 > 0x9 {
            return None;
        }
        ascii_output.push(ASCII_CHARACTER_0 + n2);

        if n1 <= 0x9 {
            ascii_output.push(ASCII_CHARACTER_0 + n1);
        } else if n1 != 0xF || i != bcd_data.len() - 1 {
            return None;
        }
    }

    Some(ascii_output)
}

// Lenient decode: decimal nibbles are kept, 0xA-0xF nibbles are dropped as padding
pub fn bcd_digits(bcd_data: &[u8]) -> String {
    nibbles(bcd_data)
        .filter(|n| *n <= 0x9)
        .map(|n| char::from(ASCII_CHARACTER_0 + n))
        .collect()
}

// Two decimal nibbles of a single byte, e.g. 0x28 -> 28
pub fn bcd_byte_value(byte: u8) -> Option<u8> {
    let high = byte >> 4;
    let low = byte & 0xF;
    if high > 0x9 || low > 0x9 {
        return None;
    }

    Some(high * 10 + low)
}

//cn = 12 34 56 78 90 12 3F FF
pub fn ascii_to_bcd_cn(ascii_data: &[u8], size: usize) -> Option<Vec<u8>> {
    if ascii_data.len() > size * 2 {
        return None;
    }

    let mut bcd_output: Vec<u8> = Vec::with_capacity(size);

    for pair in ascii_data.chunks(2) {
        let b1 = pair[0].checked_sub(ASCII_CHARACTER_0).filter(|b| *b <= 0x9)?;

        let b2 = match pair.get(1) {
            Some(c) => c.checked_sub(ASCII_CHARACTER_0).filter(|b| *b <= 0x9)?,
            None => 0xF,
        };

        bcd_output.push(b2 + (b1 << 4));
    }

    bcd_output.resize(size, 0xFF);

    Some(bcd_output)
}

//n = 00 00 00 01 23 45
pub fn ascii_to_bcd_n(ascii_data: &[u8], size: usize) -> Option<Vec<u8>> {
    if ascii_data.len() > size * 2 {
        return None;
    }

    let mut ascii_data_aligned: Vec<u8> = Vec::with_capacity(ascii_data.len() + 1);
    if ascii_data.len() % 2 == 1 {
        ascii_data_aligned.push(ASCII_CHARACTER_0);
    }
    ascii_data_aligned.extend_from_slice(ascii_data);

    let mut bcd_output: Vec<u8> = vec![0x00; size - ascii_data_aligned.len() / 2];

    for pair in ascii_data_aligned.chunks(2) {
        let b1 = pair[0].checked_sub(ASCII_CHARACTER_0).filter(|b| *b <= 0x9)?;
        let b2 = pair[1].checked_sub(ASCII_CHARACTER_0).filter(|b| *b <= 0x9)?;

        bcd_output.push(b2 + (b1 << 4));
    }

    Some(bcd_output)
}
