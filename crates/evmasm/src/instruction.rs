//! The EVM instruction set.
//!
//! Instructions are represented by their opcode byte. Every known opcode carries an
//! [`InstructionInfo`] describing its stack signature, side effects and gas tier.

use std::fmt;

/// An EVM instruction, identified by its opcode byte.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instruction(u8);

/// Gas price tier of an instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tier {
    /// 0, Zero
    Zero,
    /// 2, Quick
    Base,
    /// 3, Fastest
    VeryLow,
    /// 5, Fast
    Low,
    /// 8, Mid
    Mid,
    /// 10, Slow
    High,
    /// 20, Ext
    Ext,
    /// Depends on the EVM version (`BALANCE`, `EXTCODEHASH`).
    Balance,
    /// Depends on the EVM version (`EXTCODESIZE`, `EXTCODECOPY`).
    ExtCode,
    /// Multiparam or otherwise special.
    Special,
    /// Invalid.
    Invalid,
}

/// Static information about an instruction.
#[derive(Clone, Copy, Debug)]
pub struct InstructionInfo {
    /// The mnemonic.
    pub name: &'static str,
    /// Number of immediate bytes following the opcode.
    pub immediate: u8,
    /// Number of stack items consumed.
    pub args: u8,
    /// Number of stack items produced.
    pub ret: u8,
    /// Whether the instruction has side effects beyond its stack effect.
    pub side_effects: bool,
    /// Gas price tier.
    pub tier: Tier,
}

const INVALID_INFO: InstructionInfo = InstructionInfo {
    name: "<INVALID_INSTRUCTION>",
    immediate: 0,
    args: 0,
    ret: 0,
    side_effects: false,
    tier: Tier::Invalid,
};

macro_rules! instructions {
    ($($name:ident = $byte:literal, $imm:literal, $args:literal, $ret:literal, $se:literal, $tier:ident;)*) => {
        impl Instruction {
            $(pub const $name: Self = Self($byte);)*
        }

        static INFOS: [Option<InstructionInfo>; 256] = {
            let mut infos = [None; 256];
            $(
                infos[$byte] = Some(InstructionInfo {
                    name: stringify!($name),
                    immediate: $imm,
                    args: $args,
                    ret: $ret,
                    side_effects: $se,
                    tier: Tier::$tier,
                });
            )*
            infos
        };
    };
}

instructions! {
    STOP = 0x00, 0, 0, 0, true, Zero;
    ADD = 0x01, 0, 2, 1, false, VeryLow;
    MUL = 0x02, 0, 2, 1, false, Low;
    SUB = 0x03, 0, 2, 1, false, VeryLow;
    DIV = 0x04, 0, 2, 1, false, Low;
    SDIV = 0x05, 0, 2, 1, false, Low;
    MOD = 0x06, 0, 2, 1, false, Low;
    SMOD = 0x07, 0, 2, 1, false, Low;
    ADDMOD = 0x08, 0, 3, 1, false, Mid;
    MULMOD = 0x09, 0, 3, 1, false, Mid;
    EXP = 0x0a, 0, 2, 1, false, Special;
    SIGNEXTEND = 0x0b, 0, 2, 1, false, Low;
    LT = 0x10, 0, 2, 1, false, VeryLow;
    GT = 0x11, 0, 2, 1, false, VeryLow;
    SLT = 0x12, 0, 2, 1, false, VeryLow;
    SGT = 0x13, 0, 2, 1, false, VeryLow;
    EQ = 0x14, 0, 2, 1, false, VeryLow;
    ISZERO = 0x15, 0, 1, 1, false, VeryLow;
    AND = 0x16, 0, 2, 1, false, VeryLow;
    OR = 0x17, 0, 2, 1, false, VeryLow;
    XOR = 0x18, 0, 2, 1, false, VeryLow;
    NOT = 0x19, 0, 1, 1, false, VeryLow;
    BYTE = 0x1a, 0, 2, 1, false, VeryLow;
    SHL = 0x1b, 0, 2, 1, false, VeryLow;
    SHR = 0x1c, 0, 2, 1, false, VeryLow;
    SAR = 0x1d, 0, 2, 1, false, VeryLow;
    KECCAK256 = 0x20, 0, 2, 1, true, Special;
    ADDRESS = 0x30, 0, 0, 1, false, Base;
    BALANCE = 0x31, 0, 1, 1, false, Balance;
    ORIGIN = 0x32, 0, 0, 1, false, Base;
    CALLER = 0x33, 0, 0, 1, false, Base;
    CALLVALUE = 0x34, 0, 0, 1, false, Base;
    CALLDATALOAD = 0x35, 0, 1, 1, false, VeryLow;
    CALLDATASIZE = 0x36, 0, 0, 1, false, Base;
    CALLDATACOPY = 0x37, 0, 3, 0, true, VeryLow;
    CODESIZE = 0x38, 0, 0, 1, false, Base;
    CODECOPY = 0x39, 0, 3, 0, true, VeryLow;
    GASPRICE = 0x3a, 0, 0, 1, false, Base;
    EXTCODESIZE = 0x3b, 0, 1, 1, false, ExtCode;
    EXTCODECOPY = 0x3c, 0, 4, 0, true, ExtCode;
    RETURNDATASIZE = 0x3d, 0, 0, 1, false, Base;
    RETURNDATACOPY = 0x3e, 0, 3, 0, true, VeryLow;
    EXTCODEHASH = 0x3f, 0, 1, 1, false, Balance;
    BLOCKHASH = 0x40, 0, 1, 1, false, Ext;
    COINBASE = 0x41, 0, 0, 1, false, Base;
    TIMESTAMP = 0x42, 0, 0, 1, false, Base;
    NUMBER = 0x43, 0, 0, 1, false, Base;
    PREVRANDAO = 0x44, 0, 0, 1, false, Base;
    GASLIMIT = 0x45, 0, 0, 1, false, Base;
    CHAINID = 0x46, 0, 0, 1, false, Base;
    SELFBALANCE = 0x47, 0, 0, 1, false, Low;
    BASEFEE = 0x48, 0, 0, 1, false, Base;
    POP = 0x50, 0, 1, 0, false, Base;
    MLOAD = 0x51, 0, 1, 1, true, VeryLow;
    MSTORE = 0x52, 0, 2, 0, true, VeryLow;
    MSTORE8 = 0x53, 0, 2, 0, true, VeryLow;
    SLOAD = 0x54, 0, 1, 1, false, Special;
    SSTORE = 0x55, 0, 2, 0, true, Special;
    JUMP = 0x56, 0, 1, 0, true, Mid;
    JUMPI = 0x57, 0, 2, 0, true, High;
    PC = 0x58, 0, 0, 1, false, Base;
    MSIZE = 0x59, 0, 0, 1, false, Base;
    GAS = 0x5a, 0, 0, 1, false, Base;
    JUMPDEST = 0x5b, 0, 0, 0, true, Special;
    PUSH0 = 0x5f, 0, 0, 1, false, Base;
    PUSH1 = 0x60, 1, 0, 1, false, VeryLow;
    PUSH2 = 0x61, 2, 0, 1, false, VeryLow;
    PUSH3 = 0x62, 3, 0, 1, false, VeryLow;
    PUSH4 = 0x63, 4, 0, 1, false, VeryLow;
    PUSH5 = 0x64, 5, 0, 1, false, VeryLow;
    PUSH6 = 0x65, 6, 0, 1, false, VeryLow;
    PUSH7 = 0x66, 7, 0, 1, false, VeryLow;
    PUSH8 = 0x67, 8, 0, 1, false, VeryLow;
    PUSH9 = 0x68, 9, 0, 1, false, VeryLow;
    PUSH10 = 0x69, 10, 0, 1, false, VeryLow;
    PUSH11 = 0x6a, 11, 0, 1, false, VeryLow;
    PUSH12 = 0x6b, 12, 0, 1, false, VeryLow;
    PUSH13 = 0x6c, 13, 0, 1, false, VeryLow;
    PUSH14 = 0x6d, 14, 0, 1, false, VeryLow;
    PUSH15 = 0x6e, 15, 0, 1, false, VeryLow;
    PUSH16 = 0x6f, 16, 0, 1, false, VeryLow;
    PUSH17 = 0x70, 17, 0, 1, false, VeryLow;
    PUSH18 = 0x71, 18, 0, 1, false, VeryLow;
    PUSH19 = 0x72, 19, 0, 1, false, VeryLow;
    PUSH20 = 0x73, 20, 0, 1, false, VeryLow;
    PUSH21 = 0x74, 21, 0, 1, false, VeryLow;
    PUSH22 = 0x75, 22, 0, 1, false, VeryLow;
    PUSH23 = 0x76, 23, 0, 1, false, VeryLow;
    PUSH24 = 0x77, 24, 0, 1, false, VeryLow;
    PUSH25 = 0x78, 25, 0, 1, false, VeryLow;
    PUSH26 = 0x79, 26, 0, 1, false, VeryLow;
    PUSH27 = 0x7a, 27, 0, 1, false, VeryLow;
    PUSH28 = 0x7b, 28, 0, 1, false, VeryLow;
    PUSH29 = 0x7c, 29, 0, 1, false, VeryLow;
    PUSH30 = 0x7d, 30, 0, 1, false, VeryLow;
    PUSH31 = 0x7e, 31, 0, 1, false, VeryLow;
    PUSH32 = 0x7f, 32, 0, 1, false, VeryLow;
    DUP1 = 0x80, 0, 1, 2, false, VeryLow;
    DUP2 = 0x81, 0, 2, 3, false, VeryLow;
    DUP3 = 0x82, 0, 3, 4, false, VeryLow;
    DUP4 = 0x83, 0, 4, 5, false, VeryLow;
    DUP5 = 0x84, 0, 5, 6, false, VeryLow;
    DUP6 = 0x85, 0, 6, 7, false, VeryLow;
    DUP7 = 0x86, 0, 7, 8, false, VeryLow;
    DUP8 = 0x87, 0, 8, 9, false, VeryLow;
    DUP9 = 0x88, 0, 9, 10, false, VeryLow;
    DUP10 = 0x89, 0, 10, 11, false, VeryLow;
    DUP11 = 0x8a, 0, 11, 12, false, VeryLow;
    DUP12 = 0x8b, 0, 12, 13, false, VeryLow;
    DUP13 = 0x8c, 0, 13, 14, false, VeryLow;
    DUP14 = 0x8d, 0, 14, 15, false, VeryLow;
    DUP15 = 0x8e, 0, 15, 16, false, VeryLow;
    DUP16 = 0x8f, 0, 16, 17, false, VeryLow;
    SWAP1 = 0x90, 0, 2, 2, false, VeryLow;
    SWAP2 = 0x91, 0, 3, 3, false, VeryLow;
    SWAP3 = 0x92, 0, 4, 4, false, VeryLow;
    SWAP4 = 0x93, 0, 5, 5, false, VeryLow;
    SWAP5 = 0x94, 0, 6, 6, false, VeryLow;
    SWAP6 = 0x95, 0, 7, 7, false, VeryLow;
    SWAP7 = 0x96, 0, 8, 8, false, VeryLow;
    SWAP8 = 0x97, 0, 9, 9, false, VeryLow;
    SWAP9 = 0x98, 0, 10, 10, false, VeryLow;
    SWAP10 = 0x99, 0, 11, 11, false, VeryLow;
    SWAP11 = 0x9a, 0, 12, 12, false, VeryLow;
    SWAP12 = 0x9b, 0, 13, 13, false, VeryLow;
    SWAP13 = 0x9c, 0, 14, 14, false, VeryLow;
    SWAP14 = 0x9d, 0, 15, 15, false, VeryLow;
    SWAP15 = 0x9e, 0, 16, 16, false, VeryLow;
    SWAP16 = 0x9f, 0, 17, 17, false, VeryLow;
    LOG0 = 0xa0, 0, 2, 0, true, Special;
    LOG1 = 0xa1, 0, 3, 0, true, Special;
    LOG2 = 0xa2, 0, 4, 0, true, Special;
    LOG3 = 0xa3, 0, 5, 0, true, Special;
    LOG4 = 0xa4, 0, 6, 0, true, Special;
    CREATE = 0xf0, 0, 3, 1, true, Special;
    CALL = 0xf1, 0, 7, 1, true, Special;
    CALLCODE = 0xf2, 0, 7, 1, true, Special;
    RETURN = 0xf3, 0, 2, 0, true, Zero;
    DELEGATECALL = 0xf4, 0, 6, 1, true, Special;
    CREATE2 = 0xf5, 0, 4, 1, true, Special;
    STATICCALL = 0xfa, 0, 6, 1, true, Special;
    REVERT = 0xfd, 0, 2, 0, true, Zero;
    INVALID = 0xfe, 0, 0, 0, true, Zero;
    SELFDESTRUCT = 0xff, 0, 1, 0, true, Special;
}

impl Instruction {
    /// Alias of `PREVRANDAO` before the merge.
    pub const DIFFICULTY: Self = Self::PREVRANDAO;

    /// Returns the instruction for the given opcode byte, if it is a known opcode.
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        INFOS[byte as usize].map(|_| Self(byte))
    }

    /// Returns the opcode byte.
    #[inline]
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Returns the static information of this instruction.
    #[inline]
    pub fn info(self) -> &'static InstructionInfo {
        INFOS[self.0 as usize].as_ref().unwrap_or(&INVALID_INFO)
    }

    /// Returns the mnemonic.
    #[inline]
    pub fn name(self) -> &'static str {
        self.info().name
    }

    /// Returns the `PUSHn` instruction for `n` in `1..=32`.
    #[must_use]
    pub const fn push(n: u8) -> Self {
        debug_assert!(n >= 1 && n <= 32);
        Self(Self::PUSH1.0 + n - 1)
    }

    /// Returns the `DUPn` instruction for `n` in `1..=16`.
    #[must_use]
    pub const fn dup(n: u8) -> Self {
        debug_assert!(n >= 1 && n <= 16);
        Self(Self::DUP1.0 + n - 1)
    }

    /// Returns the `SWAPn` instruction for `n` in `1..=16`.
    #[must_use]
    pub const fn swap(n: u8) -> Self {
        debug_assert!(n >= 1 && n <= 16);
        Self(Self::SWAP1.0 + n - 1)
    }

    /// Returns the `LOGn` instruction for `n` in `0..=4`.
    #[must_use]
    pub const fn log(n: u8) -> Self {
        debug_assert!(n <= 4);
        Self(Self::LOG0.0 + n)
    }

    pub const fn is_push(self) -> bool {
        self.0 >= Self::PUSH1.0 && self.0 <= Self::PUSH32.0
    }

    pub const fn is_dup(self) -> bool {
        self.0 >= Self::DUP1.0 && self.0 <= Self::DUP16.0
    }

    pub const fn is_swap(self) -> bool {
        self.0 >= Self::SWAP1.0 && self.0 <= Self::SWAP16.0
    }

    pub const fn is_log(self) -> bool {
        self.0 >= Self::LOG0.0 && self.0 <= Self::LOG4.0
    }

    /// Number of bytes pushed by a `PUSHn`.
    pub const fn push_number(self) -> u8 {
        self.0 - Self::PUSH1.0 + 1
    }

    /// The depth of a `DUPn`.
    pub const fn dup_number(self) -> u8 {
        self.0 - Self::DUP1.0 + 1
    }

    /// The depth of a `SWAPn`.
    pub const fn swap_number(self) -> u8 {
        self.0 - Self::SWAP1.0 + 1
    }

    /// Number of topics of a `LOGn`.
    pub const fn log_number(self) -> u8 {
        self.0 - Self::LOG0.0
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_bytes() {
        assert_eq!(Instruction::STOP.get(), 0x00);
        assert_eq!(Instruction::PUSH1.get(), 0x60);
        assert_eq!(Instruction::PUSH32.get(), 0x7f);
        assert_eq!(Instruction::DUP1.get(), 0x80);
        assert_eq!(Instruction::SWAP16.get(), 0x9f);
        assert_eq!(Instruction::LOG4.get(), 0xa4);
        assert_eq!(Instruction::REVERT.get(), 0xfd);
        assert_eq!(Instruction::SELFDESTRUCT.get(), 0xff);
    }

    #[test]
    fn test_stack_signatures() {
        let info = Instruction::CALL.info();
        assert_eq!((info.args, info.ret, info.side_effects), (7, 1, true));
        let info = Instruction::dup(3).info();
        assert_eq!((info.args, info.ret), (3, 4));
        let info = Instruction::swap(2).info();
        assert_eq!((info.args, info.ret), (3, 3));
        let info = Instruction::log(2).info();
        assert_eq!((info.args, info.ret), (4, 0));
        assert!(!Instruction::SLOAD.info().side_effects);
        assert!(Instruction::MLOAD.info().side_effects);
    }

    #[test]
    fn test_helpers() {
        assert_eq!(Instruction::dup(16), Instruction::DUP16);
        assert_eq!(Instruction::swap(1), Instruction::SWAP1);
        assert_eq!(Instruction::push(20), Instruction::PUSH20);
        assert!(Instruction::SWAP5.is_swap());
        assert_eq!(Instruction::SWAP5.swap_number(), 5);
        assert_eq!(Instruction::DUP9.dup_number(), 9);
        assert_eq!(Instruction::LOG3.log_number(), 3);
        assert!(!Instruction::ADD.is_dup());
        assert_eq!(Instruction::from_u8(0x0c), None);
        assert_eq!(Instruction::from_u8(0x01), Some(Instruction::ADD));
        assert_eq!(Instruction::KECCAK256.to_string(), "KECCAK256");
        assert_eq!(Instruction::from_u8(0xef).map(Instruction::name), None);
    }
}
