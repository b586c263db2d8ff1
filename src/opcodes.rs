//! Bytecode instruction set for the hogtail VM
//!
//! A stack machine with absolute jumps. Each instruction carries at most one
//! operand, and the source line it was generated from for diagnostics.

use chrono::TimeDelta;
use std::fmt;

macro_rules! opcodes {
    ($($(#[$doc:meta])* $name:ident = $byte:literal => $text:literal,)*) => {
        /// Opcodes are single bytes (u8) for compact representation
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $($(#[$doc])* $name = $byte,)*
        }

        impl Opcode {
            /// Try to parse a u8 into an Opcode
            pub fn from_u8(byte: u8) -> Result<Self, String> {
                match byte {
                    $($byte => Ok(Opcode::$name),)*
                    _ => Err(format!("Unknown opcode: 0x{:02x}", byte)),
                }
            }

            /// Mnemonic used by the disassembler
            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$name => $text,)*
                }
            }
        }
    };
}

opcodes! {
    // Control flow
    /// End the program for this line
    Stop = 0x01 => "stop",
    /// Operand: regex index. Match the line, push bool, record captures
    Match = 0x02 => "match",
    /// Operand: regex index. Pop a string, match it, push bool, record captures
    Smatch = 0x03 => "smatch",
    /// Operand: absolute target. Pop bool, jump if true
    Jm = 0x04 => "jm",
    /// Operand: absolute target. Pop bool, jump if false
    Jnm = 0x05 => "jnm",
    /// Operand: absolute target
    Jmp = 0x06 => "jmp",
    /// Operand: bool. Record whether the enclosing action fired
    Setmatched = 0x07 => "setmatched",
    /// Push true iff no sibling action matched
    Otherwise = 0x08 => "otherwise",

    // Comparisons; operand -1, 0, 1 selects <, ==, >. Pop b, pop a, push bool
    Cmp = 0x10 => "cmp",
    Icmp = 0x11 => "icmp",
    Fcmp = 0x12 => "fcmp",
    Scmp = 0x13 => "scmp",

    // Stack
    /// Operand: literal (int, float, bool, regex index or duration)
    Push = 0x20 => "push",
    /// Operand: string pool index
    Str = 0x21 => "str",
    /// Operand: group index. Pop regex index, push captured group
    Capref = 0x22 => "capref",

    // Metrics
    /// Operand: metric index
    Mload = 0x30 => "mload",
    /// Operand: key count. Pop metric and keys, push datum
    Dload = 0x31 => "dload",
    Iget = 0x32 => "iget",
    Fget = 0x33 => "fget",
    Sget = 0x34 => "sget",
    /// Optional operand: pop delta first
    Inc = 0x35 => "inc",
    /// Optional operand: pop delta first
    Dec = 0x36 => "dec",
    Iset = 0x37 => "iset",
    Fset = 0x38 => "fset",
    Sset = 0x39 => "sset",
    /// Operand: key count. Pop metric, keys, duration
    Expire = 0x3a => "expire",
    /// Operand: key count. Pop metric and keys
    Del = 0x3b => "del",

    // Integer arithmetic
    Iadd = 0x40 => "iadd",
    Isub = 0x41 => "isub",
    Imul = 0x42 => "imul",
    Idiv = 0x43 => "idiv",
    Imod = 0x44 => "imod",
    Ipow = 0x45 => "ipow",

    // Float arithmetic
    Fadd = 0x48 => "fadd",
    Fsub = 0x49 => "fsub",
    Fmul = 0x4a => "fmul",
    Fdiv = 0x4b => "fdiv",
    Fmod = 0x4c => "fmod",
    Fpow = 0x4d => "fpow",

    // Bitwise and logical
    And = 0x50 => "and",
    Or = 0x51 => "or",
    Xor = 0x52 => "xor",
    Shl = 0x53 => "shl",
    Shr = 0x54 => "shr",
    /// Bitwise complement
    Neg = 0x55 => "neg",
    /// Logical negation
    Not = 0x56 => "not",

    // Strings
    Cat = 0x60 => "cat",
    Tolower = 0x61 => "tolower",
    Length = 0x62 => "length",
    /// Pop value, new, old; replace every `old` with `new`
    Subst = 0x63 => "subst",
    /// Pop value, new, regex index
    Rsubst = 0x64 => "rsubst",

    // Conversions
    /// Optional operand: pop radix first
    S2i = 0x70 => "s2i",
    S2f = 0x71 => "s2f",
    I2f = 0x72 => "i2f",
    I2s = 0x73 => "i2s",
    F2s = 0x74 => "f2s",
    F2i = 0x75 => "f2i",

    // Time and environment
    /// Pop layout, pop string, set the thread time
    Strptime = 0x80 => "strptime",
    /// Pop epoch seconds, set the thread time
    Settime = 0x81 => "settime",
    /// Push the thread time as epoch seconds
    Timestamp = 0x82 => "timestamp",
    Getfilename = 0x83 => "getfilename",
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Instruction operand
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    None,
    Int(i64),
    Float(f64),
    Bool(bool),
    /// String pool index
    Str(usize),
    /// Regex pool index
    Regex(usize),
    Duration(TimeDelta),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::None => Ok(()),
            Operand::Int(n) => write!(f, "{}", n),
            Operand::Float(n) => write!(f, "{:?}", n),
            Operand::Bool(b) => write!(f, "{}", b),
            Operand::Str(i) => write!(f, "str#{}", i),
            Operand::Regex(i) => write!(f, "re#{}", i),
            Operand::Duration(d) => write!(f, "{}s", d.num_milliseconds() as f64 / 1000.0),
        }
    }
}

/// A single VM instruction
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instr {
    pub opcode: Opcode,
    pub operand: Operand,
    /// Zero-based source line
    pub source_line: u32,
}

impl Instr {
    pub fn new(opcode: Opcode, operand: Operand, source_line: u32) -> Self {
        Instr {
            opcode,
            operand,
            source_line,
        }
    }

    /// Integer operand, if present
    pub fn int_operand(&self) -> Option<i64> {
        match self.operand {
            Operand::Int(n) => Some(n),
            _ => None,
        }
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operand {
            Operand::None => write!(f, "{}", self.opcode),
            operand => write!(f, "{} {}", self.opcode, operand),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        let opcodes = [
            Opcode::Match,
            Opcode::Jnm,
            Opcode::Setmatched,
            Opcode::Mload,
            Opcode::Inc,
            Opcode::Getfilename,
        ];

        for opcode in opcodes {
            let byte = opcode as u8;
            let parsed = Opcode::from_u8(byte).unwrap();
            assert_eq!(opcode, parsed);
        }
    }

    #[test]
    fn test_invalid_opcode() {
        assert!(Opcode::from_u8(0xFF).is_err());
        assert!(Opcode::from_u8(0x00).is_err());
    }

    #[test]
    fn test_instr_display() {
        assert_eq!(Instr::new(Opcode::Match, Operand::Regex(0), 0).to_string(), "match re#0");
        assert_eq!(Instr::new(Opcode::Inc, Operand::None, 3).to_string(), "inc");
        assert_eq!(
            Instr::new(Opcode::Setmatched, Operand::Bool(false), 0).to_string(),
            "setmatched false"
        );
        assert_eq!(Instr::new(Opcode::Push, Operand::Float(1.0), 0).to_string(), "push 1.0");
    }
}
