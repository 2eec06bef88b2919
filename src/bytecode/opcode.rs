//! The bytecode instruction set (spec §4.12): a flat, stack-machine ISA.
//! Every opcode is one byte; most carry no immediate, some carry a fixed-
//! width little-endian operand (see `Opcode::operand_len`), and a few
//! (`Switch`) read additional words directly off the code stream because
//! their length depends on a case count encoded in the stream itself.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0,
    /// 8-byte immediate i64 pushed onto the operand stack.
    PushI64 = 1,
    /// 4-byte index into the module's constant pool.
    PushConst = 2,
    Pop = 3,
    Dup = 4,
    Add = 5,
    Sub = 6,
    Mul = 7,
    Div = 8,
    Mod = 9,
    Neg = 10,
    And = 11,
    Or = 12,
    Xor = 13,
    Not = 14,
    Shl = 15,
    Shr = 16,
    CmpEq = 17,
    CmpNe = 18,
    CmpLt = 19,
    CmpLe = 20,
    CmpGt = 21,
    CmpGe = 22,
    /// 4-byte absolute code-offset operand.
    Jmp = 23,
    /// 4-byte absolute code-offset; taken if the top of stack is zero
    /// (popped either way).
    JmpIfZero = 24,
    /// 4-byte absolute code-offset; taken if the top of stack is non-zero.
    JmpIfNotZero = 25,
    /// 4-byte index into the module's function table.
    Call = 26,
    /// 4-byte index into the VM's native function registry.
    CallNative = 27,
    Ret = 28,
    /// 4-byte local-slot index.
    LoadLocal = 29,
    StoreLocal = 30,
    /// 4-byte global-slot index.
    LoadGlobal = 31,
    StoreGlobal = 32,
    /// 4-byte absolute code-offset of the handler to install.
    EhPush = 33,
    EhPop = 34,
    /// Raises an exception of the kind named by its 1-byte immediate
    /// (see `TrapKind`); unwinds to the nearest handler installed by
    /// `EhPush`, or halts the VM if none is installed.
    Trap = 35,
    Halt = 36,

    /// 8-byte f64 bit pattern pushed onto the operand stack.
    PushF64 = 37,
    FAdd = 38,
    FSub = 39,
    FMul = 40,
    FDiv = 41,
    FNeg = 42,
    /// i64 -> f64, exact (every i64 value round-trips through f64 for the
    /// ranges this VM deals in; no trap path).
    I2F = 43,
    /// f64 -> i64, round-to-even; traps `InvalidCast` on NaN or
    /// out-of-i64-range input.
    F2I = 44,
    FCmpEq = 45,
    FCmpNe = 46,
    FCmpLt = 47,
    FCmpLe = 48,
    FCmpGt = 49,
    FCmpGe = 50,

    /// Checked arithmetic: traps `Overflow` instead of wrapping.
    AddChecked = 51,
    SubChecked = 52,
    MulChecked = 53,

    /// Narrowing conversions: trap `InvalidCast` if the value doesn't fit.
    TruncI32 = 54,
    TruncI16 = 55,
    TruncI8 = 56,

    /// 4-byte index into the module's string pool; pushes the pool
    /// index itself as the string handle (pool strings are immutable and
    /// never freed, so the handle needs no separate table).
    LoadStr = 57,
    /// No-op refcount ops kept for source compatibility with handles that
    /// (in a fuller runtime) might come from somewhere other than the
    /// constant pool; pool-backed handles never need retaining.
    StrRetain = 58,
    StrRelease = 59,

    /// Table switch. Not a fixed-width instruction: after this byte the
    /// stream holds `u32 num_cases`, `i32 default_offset`, then
    /// `num_cases * (i64 value, i32 offset)` pairs. Offsets are relative
    /// to the position of the `default_offset` word.
    Switch = 60,

    /// Indirect call through a tagged function-pointer slot. 4-byte
    /// argument-count operand; the callee pointer is read off the
    /// operand stack just above its arguments.
    CallIndirect = 61,

    /// Raises the trap kind found on top of the operand stack (as
    /// opposed to `Trap`'s compiled-in immediate).
    TrapFromErr = 62,
    /// Push the kind of the trap that is currently being handled.
    ErrGetKind = 63,
    /// Push the kind-specific auxiliary code of the current trap.
    ErrGetCode = 64,
    /// Push the code offset (absolute pc) the current trap occurred at.
    ErrGetIp = 65,
    /// Push the source line of the current trap, or -1 if unknown.
    ErrGetLine = 66,

    /// Resume execution by re-running the instruction that trapped.
    ResumeSame = 67,
    /// Resume execution at the instruction after the one that trapped.
    ResumeNext = 68,
    /// 4-byte absolute code-offset; resume execution there.
    ResumeLabel = 69,

    /// 4-byte byte-count operand; reserves that many bytes in the VM's
    /// alloca scratch buffer and pushes the base offset as a handle.
    Alloca = 70,

    LoadMem8 = 71,
    StoreMem8 = 72,
    LoadMem16 = 73,
    StoreMem16 = 74,
    LoadMem32 = 75,
    StoreMem32 = 76,
    LoadMem64 = 77,
    StoreMem64 = 78,
}

impl Opcode {
    /// Length of the *fixed* trailing operand read directly after the
    /// opcode byte. `Switch` is not representable here since its length
    /// depends on a case count it reads itself; callers must special-case
    /// it before consulting this table.
    pub const fn operand_len(self) -> usize {
        match self {
            Opcode::PushI64 | Opcode::PushF64 => 8,
            Opcode::PushConst
            | Opcode::Jmp
            | Opcode::JmpIfZero
            | Opcode::JmpIfNotZero
            | Opcode::Call
            | Opcode::CallNative
            | Opcode::LoadLocal
            | Opcode::StoreLocal
            | Opcode::LoadGlobal
            | Opcode::StoreGlobal
            | Opcode::EhPush
            | Opcode::LoadStr
            | Opcode::CallIndirect
            | Opcode::ResumeLabel
            | Opcode::Alloca => 4,
            Opcode::Trap => 1,
            _ => 0,
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = ();

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        use Opcode::*;
        Ok(match byte {
            0 => Nop,
            1 => PushI64,
            2 => PushConst,
            3 => Pop,
            4 => Dup,
            5 => Add,
            6 => Sub,
            7 => Mul,
            8 => Div,
            9 => Mod,
            10 => Neg,
            11 => And,
            12 => Or,
            13 => Xor,
            14 => Not,
            15 => Shl,
            16 => Shr,
            17 => CmpEq,
            18 => CmpNe,
            19 => CmpLt,
            20 => CmpLe,
            21 => CmpGt,
            22 => CmpGe,
            23 => Jmp,
            24 => JmpIfZero,
            25 => JmpIfNotZero,
            26 => Call,
            27 => CallNative,
            28 => Ret,
            29 => LoadLocal,
            30 => StoreLocal,
            31 => LoadGlobal,
            32 => StoreGlobal,
            33 => EhPush,
            34 => EhPop,
            35 => Trap,
            36 => Halt,
            37 => PushF64,
            38 => FAdd,
            39 => FSub,
            40 => FMul,
            41 => FDiv,
            42 => FNeg,
            43 => I2F,
            44 => F2I,
            45 => FCmpEq,
            46 => FCmpNe,
            47 => FCmpLt,
            48 => FCmpLe,
            49 => FCmpGt,
            50 => FCmpGe,
            51 => AddChecked,
            52 => SubChecked,
            53 => MulChecked,
            54 => TruncI32,
            55 => TruncI16,
            56 => TruncI8,
            57 => LoadStr,
            58 => StrRetain,
            59 => StrRelease,
            60 => Switch,
            61 => CallIndirect,
            62 => TrapFromErr,
            63 => ErrGetKind,
            64 => ErrGetCode,
            65 => ErrGetIp,
            66 => ErrGetLine,
            67 => ResumeSame,
            68 => ResumeNext,
            69 => ResumeLabel,
            70 => Alloca,
            71 => LoadMem8,
            72 => StoreMem8,
            73 => LoadMem16,
            74 => StoreMem16,
            75 => LoadMem32,
            76 => StoreMem32,
            77 => LoadMem64,
            78 => StoreMem64,
            _ => return Err(()),
        })
    }
}

/// Exception kinds a trap can carry (spec §4.12). Encoded as a `u8`
/// immediate on `Trap`, or read from the operand stack by `TrapFromErr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TrapKind {
    None = 0,
    Overflow = 1,
    InvalidCast = 2,
    DivisionByZero = 3,
    IndexOutOfBounds = 4,
    NullPointer = 5,
    StackOverflow = 6,
    InvalidOpcode = 7,
    RuntimeError = 8,
}

impl TrapKind {
    pub const fn from_u8(byte: u8) -> Option<Self> {
        use TrapKind::*;
        Some(match byte {
            0 => None,
            1 => Overflow,
            2 => InvalidCast,
            3 => DivisionByZero,
            4 => IndexOutOfBounds,
            5 => NullPointer,
            6 => StackOverflow,
            7 => InvalidOpcode,
            8 => RuntimeError,
            _ => return Option::None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_every_opcode_byte() {
        for byte in 0u8..=78 {
            let op = Opcode::try_from(byte).expect("valid opcode");
            assert_eq!(op as u8, byte);
        }
    }

    #[test]
    fn rejects_unknown_byte() {
        assert!(Opcode::try_from(200).is_err());
    }

    #[test]
    fn operand_lengths_match_encoding() {
        assert_eq!(Opcode::PushI64.operand_len(), 8);
        assert_eq!(Opcode::PushF64.operand_len(), 8);
        assert_eq!(Opcode::Jmp.operand_len(), 4);
        assert_eq!(Opcode::LoadStr.operand_len(), 4);
        assert_eq!(Opcode::Trap.operand_len(), 1);
        assert_eq!(Opcode::Add.operand_len(), 0);
    }

    #[test]
    fn trap_kind_roundtrips() {
        for byte in 0u8..=8 {
            let kind = TrapKind::from_u8(byte).expect("valid trap kind");
            assert_eq!(kind as u8, byte);
        }
        assert!(TrapKind::from_u8(9).is_none());
    }
}
