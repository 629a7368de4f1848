use thiserror::Error;


/// cipher spec bytes, terminator included
pub const MAX_SPEC_LEN: usize = 80;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    /// the bytes read so far do not reach the terminator yet
    #[error("cipher spec is incomplete")]
    Incomplete,
    #[error("unknown cipher opcode 0x{0:02x}")]
    UnknownOpcode(u8),
    #[error("cipher spec exceeds {MAX_SPEC_LEN} bytes")]
    TooLong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    ReverseBits,
    Xor(u8),
    XorPos,
    Add(u8),
    AddPos,
}

impl Op {
    fn apply(&self, position: u64, byte: u8) -> u8 {
        match *self {
            Op::ReverseBits => byte.reverse_bits(),
            Op::Xor(n) => byte ^ n,
            Op::XorPos => byte ^ position as u8,
            Op::Add(n) => byte.wrapping_add(n),
            Op::AddPos => byte.wrapping_add(position as u8),
        }
    }

    fn invert(&self, position: u64, byte: u8) -> u8 {
        match *self {
            // the first three are their own inverse
            Op::ReverseBits => byte.reverse_bits(),
            Op::Xor(n) => byte ^ n,
            Op::XorPos => byte ^ position as u8,
            Op::Add(n) => byte.wrapping_sub(n),
            Op::AddPos => byte.wrapping_sub(position as u8),
        }
    }
}

/// An operation list as negotiated at the start of a connection. Positions
///  are absolute stream offsets: the caller keeps one counter per direction
///  and never resets them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cipher {
    ops: Vec<Op>,
}

impl Cipher {
    /// Parses a cipher spec from the front of `raw`, returning the cipher
    ///  and the number of bytes consumed, terminator included.
    pub fn parse(raw: &[u8]) -> Result<(Cipher, usize), CipherError> {
        let mut ops = Vec::new();
        let mut i = 0;
        loop {
            if i >= MAX_SPEC_LEN {
                return Err(CipherError::TooLong);
            }
            let Some(&opcode) = raw.get(i) else {
                return Err(CipherError::Incomplete);
            };
            match opcode {
                0x00 => return Ok((Cipher { ops }, i + 1)),
                0x01 => {
                    ops.push(Op::ReverseBits);
                    i += 1;
                }
                0x02 => {
                    let Some(&n) = raw.get(i + 1) else {
                        return Err(CipherError::Incomplete);
                    };
                    ops.push(Op::Xor(n));
                    i += 2;
                }
                0x03 => {
                    ops.push(Op::XorPos);
                    i += 1;
                }
                0x04 => {
                    let Some(&n) = raw.get(i + 1) else {
                        return Err(CipherError::Incomplete);
                    };
                    ops.push(Op::Add(n));
                    i += 2;
                }
                0x05 => {
                    ops.push(Op::AddPos);
                    i += 1;
                }
                other => return Err(CipherError::UnknownOpcode(other)),
            }
        }
    }

    /// A cipher that maps the printable ASCII block onto itself byte for
    ///  byte hides nothing and must be refused.
    pub fn is_noop(&self) -> bool {
        (0x20u8..=0x7e)
            .enumerate()
            .all(|(position, byte)| self.encode(position as u64, byte) == byte)
    }

    pub fn encode(&self, position: u64, byte: u8) -> u8 {
        self.ops.iter().fold(byte, |b, op| op.apply(position, b))
    }

    pub fn decode(&self, position: u64, byte: u8) -> u8 {
        self.ops.iter().rev().fold(byte, |b, op| op.invert(position, b))
    }

    pub fn encode_slice(&self, start: u64, data: &[u8]) -> Vec<u8> {
        data.iter()
            .enumerate()
            .map(|(offset, &byte)| self.encode(start + offset as u64, byte))
            .collect()
    }

    pub fn decode_slice(&self, start: u64, data: &[u8]) -> Vec<u8> {
        data.iter()
            .enumerate()
            .map(|(offset, &byte)| self.decode(start + offset as u64, byte))
            .collect()
    }
}
