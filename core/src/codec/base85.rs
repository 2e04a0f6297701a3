//! Base85 text encoding for the SMS transport.
//!
//! Every 4 input bytes (big-endian tuple) become 5 symbols. A trailing group of
//! `n` bytes becomes `n + 1` symbols. The alphabet is printable ASCII with the
//! characters that SMS gateways tend to mangle removed (`\`, `[`, `]`, `^`, `` ` ``, `{`..`~`).

const ALPHABET: &[u8; 85] = b"!\"#$%&'()*+,-./0123456789:;<=>?@ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";

/// Symbol -> digit. Bytes outside the alphabet decode as digit 0.
const DECODE_TABLE: [u8; 256] = build_decode_table();

const POW85: [u64; 5] = [85 * 85 * 85 * 85, 85 * 85 * 85, 85 * 85, 85, 1];

const fn build_decode_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut digit = 0;
    while digit < ALPHABET.len() {
        table[ALPHABET[digit] as usize] = digit as u8;
        digit += 1;
    }
    table
}

/// Number of symbols `encode85` produces for `byte_len` input bytes.
pub fn encoded_len(byte_len: usize) -> usize {
    let tail = byte_len % 4;
    (byte_len / 4) * 5 + if tail == 0 { 0 } else { tail + 1 }
}

/// Number of bytes `decode85` produces for `symbol_len` input symbols.
pub fn decoded_len(symbol_len: usize) -> usize {
    let tail = symbol_len % 5;
    (symbol_len / 5) * 4 + tail.saturating_sub(1)
}

pub fn encode85(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded_len(src.len()));

    for group in src.chunks(4) {
        let mut tuple = [0u8; 4];
        tuple[..group.len()].copy_from_slice(group);
        let mut value = u32::from_be_bytes(tuple);

        let mut digits = [0u8; 5];
        for slot in digits.iter_mut().rev() {
            *slot = (value % 85) as u8;
            value /= 85;
        }

        // A partial group only needs enough symbols to pin down its bytes.
        let symbols = group.len() + 1;
        out.extend(digits[..symbols].iter().map(|&d| ALPHABET[d as usize]));
    }

    out
}

/// Decode Base85 text.
///
/// Out-of-alphabet symbols are read as digit 0 and never rejected: corrupted SMS
/// text decodes to wrong bytes, which the CRC or AEAD check then catches.
pub fn decode85(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(decoded_len(src.len()));

    for group in src.chunks(5) {
        let mut value: u64 = group
            .iter()
            .zip(POW85.iter())
            .map(|(&symbol, &weight)| DECODE_TABLE[symbol as usize] as u64 * weight)
            .sum();

        let bytes = if group.len() == 5 {
            4
        } else {
            // Round up by one unit of the last present digit so truncated
            // low-order digits cannot borrow from the kept bytes.
            value += POW85[group.len() - 1];
            group.len() - 1
        };

        let tuple = (value as u32).to_be_bytes();
        out.extend_from_slice(&tuple[..bytes]);
    }

    out
}
