//! The bytecode interpreter (spec §4.12): a bounded-depth call stack of
//! frames, each with its own operand-stack slice and locals, a global
//! exception-handler stack for `EH_PUSH`/`TRAP`/"resume" opcodes, and
//! native call bridging through an index-addressed registry (grounded in
//! the same capped, cooperative-execution spirit as `rhai::runner`'s
//! `max_operations`/`on_progress` guard against runaway scripts).
//!
//! Values on the operand stack are untyped 64-bit words: integers live
//! there directly, floats live there as their IEEE-754 bit pattern
//! (`f64::to_bits`/`from_bits`), and string handles are string-pool
//! indices (pool strings are immutable for the module's lifetime, so no
//! separate handle table is needed — `STR_RETAIN`/`STR_RELEASE` are true
//! no-ops, matching what the source system this was distilled from does
//! for its own constant-pool strings).

use alloc::vec::Vec;

use crate::config::{VM_ALLOCA_BUFFER_CAP, VM_MAX_CALL_DEPTH, VM_MAX_STACK_SIZE};
use crate::errors::VError;

use super::module::Module;
use super::opcode::{Opcode, TrapKind};

pub type NativeFn = fn(&[i64]) -> Result<i64, VError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    StackOverflow,
    StackUnderflow,
    CallDepthExceeded,
    BadOpcode,
    BadOperand,
    UnknownFunction,
    UnknownNative,
    UnhandledTrap,
    AllocaOverflow,
}

impl From<VmError> for VError {
    fn from(_: VmError) -> Self {
        VError::InvalidArg
    }
}

struct Frame {
    return_pc: usize,
    /// Index into the VM's shared operand stack where this frame's
    /// locals+operands begin.
    stack_base: usize,
    num_locals: usize,
    eh_stack_base: usize,
    /// `alloca` buffer length when this frame was entered; restored on
    /// return so a callee's `ALLOCA`s don't leak into the caller.
    alloca_base: usize,
}

struct EhEntry {
    handler_pc: usize,
    /// Operand-stack depth (absolute index) to unwind to before jumping.
    stack_depth: usize,
    frame_depth: usize,
}

pub struct Vm<'m> {
    module: &'m Module,
    natives: &'m [NativeFn],
    stack: Vec<i64>,
    frames: Vec<Frame>,
    eh_stack: Vec<EhEntry>,
    /// Scratch buffer for VM-side `ALLOCA`/`*MEM*` temporaries, bounded by
    /// `VM_ALLOCA_BUFFER_CAP`.
    alloca: Vec<u8>,

    /// Fault context for the trap currently being handled, queried by
    /// `ERR_GET_*` and consumed by `RESUME_SAME`/`RESUME_NEXT`.
    fault_kind: TrapKind,
    fault_code: i64,
    fault_ip: i64,
    fault_line: i64,
    fault_resume_same: usize,
    fault_resume_next: usize,
}

impl<'m> Vm<'m> {
    pub fn new(module: &'m Module, natives: &'m [NativeFn]) -> Self {
        Self {
            module,
            natives,
            stack: Vec::new(),
            frames: Vec::new(),
            eh_stack: Vec::new(),
            alloca: Vec::new(),
            fault_kind: TrapKind::None,
            fault_code: 0,
            fault_ip: 0,
            fault_line: -1,
            fault_resume_same: 0,
            fault_resume_next: 0,
        }
    }

    fn push(&mut self, value: i64) -> Result<(), VmError> {
        let frame_depth = self.stack.len() - self.current_frame().stack_base;
        if frame_depth >= VM_MAX_STACK_SIZE {
            return Err(VmError::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<i64, VmError> {
        if self.stack.len() <= self.current_frame().stack_base + self.current_frame().num_locals {
            return Err(VmError::StackUnderflow);
        }
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    fn current_frame(&self) -> &Frame {
        self.frames.last().expect("vm always has an active frame")
    }

    fn current_frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("vm always has an active frame")
    }

    fn local_slot(&self, idx: usize) -> Result<usize, VmError> {
        let frame = self.current_frame();
        if idx >= frame.num_locals {
            return Err(VmError::BadOperand);
        }
        Ok(frame.stack_base + idx)
    }

    fn mem_bounds_ok(&self, ptr: usize, width: usize) -> bool {
        ptr.checked_add(width).is_some_and(|end| end <= self.alloca.len())
    }

    /// Run `function_index` with `args` pushed as its initial locals,
    /// returning the single i64 left on the stack when it returns.
    pub fn call(&mut self, function_index: u32, args: &[i64]) -> Result<i64, VmError> {
        let func = self
            .module
            .functions
            .get(function_index as usize)
            .ok_or(VmError::UnknownFunction)?;

        self.enter_frame(func.code_offset as usize, func.num_locals as usize, args)?;
        self.run()
    }

    fn enter_frame(&mut self, pc: usize, num_locals: usize, args: &[i64]) -> Result<(), VmError> {
        if self.frames.len() >= VM_MAX_CALL_DEPTH {
            return Err(VmError::CallDepthExceeded);
        }
        let stack_base = self.stack.len();
        for i in 0..num_locals {
            self.stack.push(args.get(i).copied().unwrap_or(0));
        }
        self.frames.push(Frame {
            return_pc: pc,
            stack_base,
            num_locals,
            eh_stack_base: self.eh_stack.len(),
            alloca_base: self.alloca.len(),
        });
        Ok(())
    }

    /// Interpreter loop: runs from the current frame's `return_pc`
    /// (repurposed as the live program counter) until `Ret` unwinds the
    /// frame that was active on entry, or `Halt`/an error ends execution.
    fn run(&mut self) -> Result<i64, VmError> {
        let base_frame_depth = self.frames.len();
        let mut pc = self.current_frame().return_pc;

        loop {
            let op_start_pc = pc;
            let byte = *self.module.code.get(pc).ok_or(VmError::BadOperand)?;
            let op = Opcode::try_from(byte).map_err(|_| VmError::BadOpcode)?;
            pc += 1;

            macro_rules! operand_u32 {
                () => {{
                    let bytes = self.module.code.get(pc..pc + 4).ok_or(VmError::BadOperand)?;
                    pc += 4;
                    u32::from_le_bytes(bytes.try_into().unwrap())
                }};
            }
            macro_rules! operand_i64 {
                () => {{
                    let bytes = self.module.code.get(pc..pc + 8).ok_or(VmError::BadOperand)?;
                    pc += 8;
                    i64::from_le_bytes(bytes.try_into().unwrap())
                }};
            }
            macro_rules! trap_here {
                ($kind:expr) => {{
                    let resume_next = pc;
                    self.trap($kind, &mut pc, op_start_pc, resume_next)?;
                    continue;
                }};
            }

            match op {
                Opcode::Nop => {}
                Opcode::PushI64 | Opcode::PushF64 => {
                    let v = operand_i64!();
                    self.push(v)?;
                }
                Opcode::PushConst => {
                    let idx = operand_u32!() as usize;
                    let v = *self.module.constants.get(idx).ok_or(VmError::BadOperand)?;
                    self.push(v)?;
                }
                Opcode::Pop => {
                    self.pop()?;
                }
                Opcode::Dup => {
                    let v = *self.stack.last().ok_or(VmError::StackUnderflow)?;
                    self.push(v)?;
                }
                Opcode::Add => self.binop(|a, b| a.wrapping_add(b))?,
                Opcode::Sub => self.binop(|a, b| a.wrapping_sub(b))?,
                Opcode::Mul => self.binop(|a, b| a.wrapping_mul(b))?,
                Opcode::Div => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    if b == 0 {
                        trap_here!(TrapKind::DivisionByZero);
                    }
                    self.push(a.wrapping_div(b))?;
                }
                Opcode::Mod => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    if b == 0 {
                        trap_here!(TrapKind::DivisionByZero);
                    }
                    self.push(a.wrapping_rem(b))?;
                }
                Opcode::Neg => {
                    let v = self.pop()?;
                    self.push(v.wrapping_neg())?;
                }
                Opcode::And => self.binop(|a, b| a & b)?,
                Opcode::Or => self.binop(|a, b| a | b)?,
                Opcode::Xor => self.binop(|a, b| a ^ b)?,
                Opcode::Not => {
                    let v = self.pop()?;
                    self.push(if v == 0 { 1 } else { 0 })?;
                }
                Opcode::Shl => self.binop(|a, b| a.wrapping_shl(b as u32))?,
                Opcode::Shr => self.binop(|a, b| a.wrapping_shr(b as u32))?,
                Opcode::CmpEq => self.binop(|a, b| (a == b) as i64)?,
                Opcode::CmpNe => self.binop(|a, b| (a != b) as i64)?,
                Opcode::CmpLt => self.binop(|a, b| (a < b) as i64)?,
                Opcode::CmpLe => self.binop(|a, b| (a <= b) as i64)?,
                Opcode::CmpGt => self.binop(|a, b| (a > b) as i64)?,
                Opcode::CmpGe => self.binop(|a, b| (a >= b) as i64)?,

                Opcode::FAdd => self.fbinop(|a, b| a + b)?,
                Opcode::FSub => self.fbinop(|a, b| a - b)?,
                Opcode::FMul => self.fbinop(|a, b| a * b)?,
                Opcode::FDiv => self.fbinop(|a, b| a / b)?,
                Opcode::FNeg => {
                    let v = f64::from_bits(self.pop()? as u64);
                    self.push((-v).to_bits() as i64)?;
                }
                Opcode::I2F => {
                    let v = self.pop()?;
                    self.push((v as f64).to_bits() as i64)?;
                }
                Opcode::F2I => {
                    let bits = self.pop()?;
                    let v = f64::from_bits(bits as u64);
                    match f2i_checked(v) {
                        Some(i) => self.push(i)?,
                        None => trap_here!(TrapKind::InvalidCast),
                    }
                }
                Opcode::FCmpEq => self.fcmp(|a, b| a == b)?,
                Opcode::FCmpNe => self.fcmp(|a, b| a != b)?,
                Opcode::FCmpLt => self.fcmp(|a, b| a < b)?,
                Opcode::FCmpLe => self.fcmp(|a, b| a <= b)?,
                Opcode::FCmpGt => self.fcmp(|a, b| a > b)?,
                Opcode::FCmpGe => self.fcmp(|a, b| a >= b)?,

                Opcode::AddChecked => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    match a.checked_add(b) {
                        Some(v) => self.push(v)?,
                        None => trap_here!(TrapKind::Overflow),
                    }
                }
                Opcode::SubChecked => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    match a.checked_sub(b) {
                        Some(v) => self.push(v)?,
                        None => trap_here!(TrapKind::Overflow),
                    }
                }
                Opcode::MulChecked => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    match a.checked_mul(b) {
                        Some(v) => self.push(v)?,
                        None => trap_here!(TrapKind::Overflow),
                    }
                }

                Opcode::TruncI32 => {
                    let v = self.pop()?;
                    if v < i32::MIN as i64 || v > i32::MAX as i64 {
                        trap_here!(TrapKind::InvalidCast);
                    }
                    self.push(v as i32 as i64)?;
                }
                Opcode::TruncI16 => {
                    let v = self.pop()?;
                    if v < i16::MIN as i64 || v > i16::MAX as i64 {
                        trap_here!(TrapKind::InvalidCast);
                    }
                    self.push(v as i16 as i64)?;
                }
                Opcode::TruncI8 => {
                    let v = self.pop()?;
                    if v < i8::MIN as i64 || v > i8::MAX as i64 {
                        trap_here!(TrapKind::InvalidCast);
                    }
                    self.push(v as i8 as i64)?;
                }

                Opcode::LoadStr => {
                    let idx = operand_u32!() as usize;
                    if idx >= self.module.strings.len() {
                        return Err(VmError::BadOperand);
                    }
                    self.push(idx as i64)?;
                }
                Opcode::StrRetain | Opcode::StrRelease => {
                    // No-op: every handle in this VM comes from the
                    // module's immutable string pool.
                }

                Opcode::Jmp => {
                    pc = operand_u32!() as usize;
                }
                Opcode::JmpIfZero => {
                    let target = operand_u32!() as usize;
                    let v = self.pop()?;
                    if v == 0 {
                        pc = target;
                    }
                }
                Opcode::JmpIfNotZero => {
                    let target = operand_u32!() as usize;
                    let v = self.pop()?;
                    if v != 0 {
                        pc = target;
                    }
                }
                Opcode::Switch => {
                    let num_cases = operand_u32!() as usize;
                    let default_word_pos = pc;
                    let default_offset = {
                        let bytes = self.module.code.get(pc..pc + 4).ok_or(VmError::BadOperand)?;
                        pc += 4;
                        i32::from_le_bytes(bytes.try_into().unwrap())
                    };
                    let value = self.pop()?;
                    let mut target = (default_word_pos as i64 + default_offset as i64) as usize;
                    for _ in 0..num_cases {
                        let case_bytes = self.module.code.get(pc..pc + 8).ok_or(VmError::BadOperand)?;
                        pc += 8;
                        let case_val = i64::from_le_bytes(case_bytes.try_into().unwrap());
                        let off_bytes = self.module.code.get(pc..pc + 4).ok_or(VmError::BadOperand)?;
                        pc += 4;
                        let off = i32::from_le_bytes(off_bytes.try_into().unwrap());
                        if case_val == value {
                            target = (default_word_pos as i64 + off as i64) as usize;
                        }
                    }
                    pc = target;
                }

                Opcode::Call => {
                    let func_idx = operand_u32!();
                    let func = self
                        .module
                        .functions
                        .get(func_idx as usize)
                        .ok_or(VmError::UnknownFunction)?;
                    let nargs = func.num_params as usize;
                    if self.stack.len() < nargs {
                        return Err(VmError::StackUnderflow);
                    }
                    let args_start = self.stack.len() - nargs;
                    let args: Vec<i64> = self.stack[args_start..].to_vec();
                    self.stack.truncate(args_start);
                    self.current_frame_mut().return_pc = pc;
                    self.enter_frame(func.code_offset as usize, func.num_locals as usize, &args)?;
                    pc = func.code_offset as usize;
                }
                Opcode::CallIndirect => {
                    let nargs = operand_u32!() as usize;
                    if self.stack.len() < nargs + 1 {
                        return Err(VmError::StackUnderflow);
                    }
                    let ptr_idx = self.stack.len() - nargs - 1;
                    let pointer = self.stack[ptr_idx];
                    for i in 0..nargs {
                        self.stack[ptr_idx + i] = self.stack[ptr_idx + 1 + i];
                    }
                    self.stack.truncate(self.stack.len() - 1);

                    if pointer == 0 {
                        trap_here!(TrapKind::NullPointer);
                    }
                    const TAG_BIT: i64 = i64::MIN;
                    if pointer & TAG_BIT == 0 {
                        trap_here!(TrapKind::InvalidCast);
                    }
                    let func_idx = (pointer & !TAG_BIT) as u32;
                    let func = self
                        .module
                        .functions
                        .get(func_idx as usize)
                        .ok_or(VmError::UnknownFunction)?;
                    if func.num_params as usize != nargs {
                        return Err(VmError::BadOperand);
                    }
                    let args_start = self.stack.len() - nargs;
                    let args: Vec<i64> = self.stack[args_start..].to_vec();
                    self.stack.truncate(args_start);
                    self.current_frame_mut().return_pc = pc;
                    self.enter_frame(func.code_offset as usize, func.num_locals as usize, &args)?;
                    pc = func.code_offset as usize;
                }
                Opcode::CallNative => {
                    let native_idx = operand_u32!() as usize;
                    let native = self.natives.get(native_idx).ok_or(VmError::UnknownNative)?;
                    let arg = self.pop()?;
                    match native(&[arg]) {
                        Ok(result) => self.push(result)?,
                        Err(_) => trap_here!(TrapKind::RuntimeError),
                    }
                }
                Opcode::Ret => {
                    let ret_val = if self.stack.len() > self.current_frame().stack_base + self.current_frame().num_locals {
                        self.pop()?
                    } else {
                        0
                    };
                    let frame = self.frames.pop().expect("frame present");
                    self.stack.truncate(frame.stack_base);
                    self.eh_stack.truncate(frame.eh_stack_base);
                    self.alloca.truncate(frame.alloca_base);

                    if self.frames.len() < base_frame_depth {
                        return Ok(ret_val);
                    }
                    self.push(ret_val)?;
                    pc = self.current_frame().return_pc;
                }
                Opcode::LoadLocal => {
                    let idx = operand_u32!() as usize;
                    let slot = self.local_slot(idx)?;
                    let v = self.stack[slot];
                    self.push(v)?;
                }
                Opcode::StoreLocal => {
                    let idx = operand_u32!() as usize;
                    let slot = self.local_slot(idx)?;
                    let v = self.pop()?;
                    self.stack[slot] = v;
                }
                Opcode::LoadGlobal | Opcode::StoreGlobal => {
                    // No global segment is wired yet; the operand is consumed
                    // so encoding stays in sync, but the access itself traps.
                    let _ = operand_u32!();
                    trap_here!(TrapKind::RuntimeError);
                }
                Opcode::EhPush => {
                    let handler_pc = operand_u32!() as usize;
                    self.eh_stack.push(EhEntry {
                        handler_pc,
                        stack_depth: self.stack.len(),
                        frame_depth: self.frames.len(),
                    });
                }
                Opcode::EhPop => {
                    self.eh_stack.pop();
                }
                Opcode::Trap => {
                    let kind_byte = *self.module.code.get(pc).ok_or(VmError::BadOperand)?;
                    pc += 1;
                    let kind = TrapKind::from_u8(kind_byte).unwrap_or(TrapKind::RuntimeError);
                    trap_here!(kind);
                }
                Opcode::TrapFromErr => {
                    let kind_val = self.pop()?;
                    let kind = TrapKind::from_u8(kind_val as u8).unwrap_or(TrapKind::RuntimeError);
                    trap_here!(kind);
                }
                Opcode::ErrGetKind => self.push(self.fault_kind as i64)?,
                Opcode::ErrGetCode => self.push(self.fault_code)?,
                Opcode::ErrGetIp => self.push(self.fault_ip)?,
                Opcode::ErrGetLine => self.push(self.fault_line)?,
                Opcode::ResumeSame => {
                    pc = self.fault_resume_same;
                }
                Opcode::ResumeNext => {
                    pc = self.fault_resume_next;
                }
                Opcode::ResumeLabel => {
                    pc = operand_u32!() as usize;
                }

                Opcode::Alloca => {
                    let size = operand_u32!() as usize;
                    if self.alloca.len() + size > VM_ALLOCA_BUFFER_CAP {
                        return Err(VmError::AllocaOverflow);
                    }
                    let base = self.alloca.len();
                    self.alloca.resize(base + size, 0);
                    self.push(base as i64)?;
                }
                Opcode::LoadMem8 => {
                    let ptr = self.pop()? as usize;
                    if !self.mem_bounds_ok(ptr, 1) {
                        trap_here!(TrapKind::IndexOutOfBounds);
                    }
                    self.push(self.alloca[ptr] as i64)?;
                }
                Opcode::StoreMem8 => {
                    let v = self.pop()?;
                    let ptr = self.pop()? as usize;
                    if !self.mem_bounds_ok(ptr, 1) {
                        trap_here!(TrapKind::IndexOutOfBounds);
                    }
                    self.alloca[ptr] = v as u8;
                }
                Opcode::LoadMem16 => {
                    let ptr = self.pop()? as usize;
                    if !self.mem_bounds_ok(ptr, 2) {
                        trap_here!(TrapKind::IndexOutOfBounds);
                    }
                    let bytes = &self.alloca[ptr..ptr + 2];
                    self.push(u16::from_le_bytes(bytes.try_into().unwrap()) as i64)?;
                }
                Opcode::StoreMem16 => {
                    let v = self.pop()?;
                    let ptr = self.pop()? as usize;
                    if !self.mem_bounds_ok(ptr, 2) {
                        trap_here!(TrapKind::IndexOutOfBounds);
                    }
                    self.alloca[ptr..ptr + 2].copy_from_slice(&(v as u16).to_le_bytes());
                }
                Opcode::LoadMem32 => {
                    let ptr = self.pop()? as usize;
                    if !self.mem_bounds_ok(ptr, 4) {
                        trap_here!(TrapKind::IndexOutOfBounds);
                    }
                    let bytes = &self.alloca[ptr..ptr + 4];
                    self.push(u32::from_le_bytes(bytes.try_into().unwrap()) as i64)?;
                }
                Opcode::StoreMem32 => {
                    let v = self.pop()?;
                    let ptr = self.pop()? as usize;
                    if !self.mem_bounds_ok(ptr, 4) {
                        trap_here!(TrapKind::IndexOutOfBounds);
                    }
                    self.alloca[ptr..ptr + 4].copy_from_slice(&(v as u32).to_le_bytes());
                }
                Opcode::LoadMem64 => {
                    let ptr = self.pop()? as usize;
                    if !self.mem_bounds_ok(ptr, 8) {
                        trap_here!(TrapKind::IndexOutOfBounds);
                    }
                    let bytes = &self.alloca[ptr..ptr + 8];
                    self.push(i64::from_le_bytes(bytes.try_into().unwrap()))?;
                }
                Opcode::StoreMem64 => {
                    let v = self.pop()?;
                    let ptr = self.pop()? as usize;
                    if !self.mem_bounds_ok(ptr, 8) {
                        trap_here!(TrapKind::IndexOutOfBounds);
                    }
                    self.alloca[ptr..ptr + 8].copy_from_slice(&v.to_le_bytes());
                }

                Opcode::Halt => {
                    return self.stack.last().copied().map_or(Ok(0), Ok);
                }
            }
        }
    }

    fn binop(&mut self, f: impl FnOnce(i64, i64) -> i64) -> Result<(), VmError> {
        let b = self.pop()?;
        let a = self.pop()?;
        self.push(f(a, b))
    }

    fn fbinop(&mut self, f: impl FnOnce(f64, f64) -> f64) -> Result<(), VmError> {
        let b = f64::from_bits(self.pop()? as u64);
        let a = f64::from_bits(self.pop()? as u64);
        self.push(f(a, b).to_bits() as i64)
    }

    fn fcmp(&mut self, f: impl FnOnce(f64, f64) -> bool) -> Result<(), VmError> {
        let b = f64::from_bits(self.pop()? as u64);
        let a = f64::from_bits(self.pop()? as u64);
        self.push(f(a, b) as i64)
    }

    /// Records fault context (queryable via `ERR_GET_*`, used by the
    /// `RESUME_*` opcodes) and unwinds to the nearest installed handler.
    fn trap(&mut self, kind: TrapKind, pc: &mut usize, fault_pc: usize, resume_next_pc: usize) -> Result<(), VmError> {
        self.fault_kind = kind;
        self.fault_code = kind as i64;
        self.fault_ip = fault_pc as i64;
        self.fault_line = -1;
        self.fault_resume_same = fault_pc;
        self.fault_resume_next = resume_next_pc;
        self.unwind_to_handler(pc)
    }

    /// "Resume next" unwind: pop handler frames/stack down to the nearest
    /// `EhPush` entry and jump there, discarding whatever was on the
    /// operand stack above it. No handler installed means the trap is
    /// fatal.
    fn unwind_to_handler(&mut self, pc: &mut usize) -> Result<(), VmError> {
        let entry = self.eh_stack.pop().ok_or(VmError::UnhandledTrap)?;
        self.frames.truncate(entry.frame_depth);
        self.stack.truncate(entry.stack_depth);
        *pc = entry.handler_pc;
        Ok(())
    }
}

/// Checked f64 -> i64: rejects NaN and anything outside i64's range,
/// rounds ties to even otherwise.
fn f2i_checked(v: f64) -> Option<i64> {
    if v.is_nan() {
        return None;
    }
    let rounded = v.round_ties_even();
    const MIN: f64 = -9223372036854775808.0; // -2^63
    const MAX: f64 = 9223372036854775808.0; // 2^63, exclusive
    if rounded < MIN || rounded >= MAX {
        return None;
    }
    Some(rounded as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::module::ModuleBuilder;
    use crate::bytecode::opcode::Opcode::*;

    fn emit_u32(code: &mut Vec<u8>, v: u32) {
        code.extend_from_slice(&v.to_le_bytes());
    }
    fn emit_i64(code: &mut Vec<u8>, v: i64) {
        code.extend_from_slice(&v.to_le_bytes());
    }
    fn emit_f64(code: &mut Vec<u8>, v: f64) {
        code.extend_from_slice(&v.to_bits().to_le_bytes());
    }

    /// fib(n): recursive, one local (n), one param.
    ///   if n < 2: return n
    ///   else: return fib(n-1) + fib(n-2)
    fn build_fib_module() -> Module {
        let mut b = ModuleBuilder::new();
        let mut code = Vec::new();

        // fn fib at offset 0, 1 param, 1 local.
        code.push(LoadLocal as u8);
        emit_u32(&mut code, 0);
        code.push(PushI64 as u8);
        emit_i64(&mut code, 2);
        code.push(CmpLt as u8);
        let jz_patch = code.len();
        code.push(JmpIfZero as u8);
        emit_u32(&mut code, 0); // patched below

        // base case: return n
        code.push(LoadLocal as u8);
        emit_u32(&mut code, 0);
        code.push(Ret as u8);

        let recursive_start = code.len() as u32;
        // fib(n-1)
        code.push(LoadLocal as u8);
        emit_u32(&mut code, 0);
        code.push(PushI64 as u8);
        emit_i64(&mut code, 1);
        code.push(Sub as u8);
        code.push(Call as u8);
        emit_u32(&mut code, 0);
        // fib(n-2)
        code.push(LoadLocal as u8);
        emit_u32(&mut code, 0);
        code.push(PushI64 as u8);
        emit_i64(&mut code, 2);
        code.push(Sub as u8);
        code.push(Call as u8);
        emit_u32(&mut code, 0);
        code.push(Add as u8);
        code.push(Ret as u8);

        let jz_target = recursive_start;
        code[jz_patch + 1..jz_patch + 5].copy_from_slice(&jz_target.to_le_bytes());

        b.add_function(0, 1, 1);
        b.set_code(code);
        let bytes = b.encode();
        Module::decode(&bytes).unwrap()
    }

    #[test]
    fn fib_recursive() {
        let module = build_fib_module();
        let natives: [NativeFn; 0] = [];
        let mut vm = Vm::new(&module, &natives);
        assert_eq!(vm.call(0, &[0]).unwrap(), 0);

        let mut vm = Vm::new(&module, &natives);
        assert_eq!(vm.call(0, &[1]).unwrap(), 1);

        let mut vm = Vm::new(&module, &natives);
        assert_eq!(vm.call(0, &[10]).unwrap(), 55);
    }

    fn square(args: &[i64]) -> Result<i64, VError> {
        Ok(args[0] * args[0])
    }

    #[test]
    fn native_call_square() {
        let mut b = ModuleBuilder::new();
        let mut code = Vec::new();
        code.push(LoadLocal as u8);
        emit_u32(&mut code, 0);
        code.push(CallNative as u8);
        emit_u32(&mut code, 0);
        code.push(Ret as u8);
        b.add_function(0, 1, 1);
        b.set_code(code);
        let bytes = b.encode();
        let module = Module::decode(&bytes).unwrap();

        let natives: [NativeFn; 1] = [square];
        let mut vm = Vm::new(&module, &natives);
        assert_eq!(vm.call(0, &[7]).unwrap(), 49);
    }

    #[test]
    fn trap_resumes_at_handler() {
        let mut b = ModuleBuilder::new();
        let mut code = Vec::new();
        // EH_PUSH handler
        code.push(EhPush as u8);
        let eh_patch = code.len();
        emit_u32(&mut code, 0);
        // push 1, trap (discarded by unwind), never reached: push 999
        code.push(PushI64 as u8);
        emit_i64(&mut code, 1);
        code.push(Trap as u8);
        code.push(TrapKind::RuntimeError as u8);
        code.push(PushI64 as u8);
        emit_i64(&mut code, 999);
        code.push(Ret as u8);

        let handler_pc = code.len() as u32;
        code[eh_patch..eh_patch + 4].copy_from_slice(&handler_pc.to_le_bytes());
        code.push(PushI64 as u8);
        emit_i64(&mut code, 42);
        code.push(Ret as u8);

        b.add_function(0, 0, 0);
        b.set_code(code);
        let bytes = b.encode();
        let module = Module::decode(&bytes).unwrap();

        let natives: [NativeFn; 0] = [];
        let mut vm = Vm::new(&module, &natives);
        assert_eq!(vm.call(0, &[]).unwrap(), 42);
    }

    #[test]
    fn unhandled_trap_errors() {
        let mut b = ModuleBuilder::new();
        let code = alloc::vec![Trap as u8, TrapKind::RuntimeError as u8];
        b.add_function(0, 0, 0);
        b.set_code(code);
        let bytes = b.encode();
        let module = Module::decode(&bytes).unwrap();

        let natives: [NativeFn; 0] = [];
        let mut vm = Vm::new(&module, &natives);
        assert_eq!(vm.call(0, &[]), Err(VmError::UnhandledTrap));
    }

    #[test]
    fn handler_reads_fault_kind_via_err_get_kind() {
        let mut b = ModuleBuilder::new();
        let mut code = Vec::new();
        code.push(EhPush as u8);
        let eh_patch = code.len();
        emit_u32(&mut code, 0);
        code.push(PushI64 as u8);
        emit_i64(&mut code, 1);
        code.push(PushI64 as u8);
        emit_i64(&mut code, 0);
        code.push(Div as u8); // 1 / 0 -> DivisionByZero trap

        let handler_pc = code.len() as u32;
        code[eh_patch..eh_patch + 4].copy_from_slice(&handler_pc.to_le_bytes());
        code.push(ErrGetKind as u8);
        code.push(Ret as u8);

        b.add_function(0, 0, 0);
        b.set_code(code);
        let bytes = b.encode();
        let module = Module::decode(&bytes).unwrap();

        let natives: [NativeFn; 0] = [];
        let mut vm = Vm::new(&module, &natives);
        assert_eq!(vm.call(0, &[]).unwrap(), TrapKind::DivisionByZero as i64);
    }

    #[test]
    fn float_arithmetic_roundtrips_through_bit_pattern() {
        let mut b = ModuleBuilder::new();
        let mut code = Vec::new();
        code.push(PushF64 as u8);
        emit_f64(&mut code, 3.5);
        code.push(PushF64 as u8);
        emit_f64(&mut code, 2.0);
        code.push(FMul as u8);
        code.push(F2I as u8);
        code.push(Ret as u8);
        b.add_function(0, 0, 0);
        b.set_code(code);
        let bytes = b.encode();
        let module = Module::decode(&bytes).unwrap();

        let natives: [NativeFn; 0] = [];
        let mut vm = Vm::new(&module, &natives);
        assert_eq!(vm.call(0, &[]).unwrap(), 7);
    }

    #[test]
    fn checked_add_overflow_traps_instead_of_wrapping() {
        let mut b = ModuleBuilder::new();
        let mut code = Vec::new();
        code.push(PushI64 as u8);
        emit_i64(&mut code, i64::MAX);
        code.push(PushI64 as u8);
        emit_i64(&mut code, 1);
        code.push(AddChecked as u8);
        code.push(Ret as u8);
        b.add_function(0, 0, 0);
        b.set_code(code);
        let bytes = b.encode();
        let module = Module::decode(&bytes).unwrap();

        let natives: [NativeFn; 0] = [];
        let mut vm = Vm::new(&module, &natives);
        assert_eq!(vm.call(0, &[]), Err(VmError::UnhandledTrap));
    }

    #[test]
    fn alloca_and_mem_roundtrip() {
        let mut b = ModuleBuilder::new();
        let mut code = Vec::new();
        code.push(Alloca as u8);
        emit_u32(&mut code, 8);
        code.push(Dup as u8);
        code.push(PushI64 as u8);
        emit_i64(&mut code, 1234);
        code.push(StoreMem64 as u8);
        code.push(LoadMem64 as u8);
        code.push(Ret as u8);
        b.add_function(0, 0, 0);
        b.set_code(code);
        let bytes = b.encode();
        let module = Module::decode(&bytes).unwrap();

        let natives: [NativeFn; 0] = [];
        let mut vm = Vm::new(&module, &natives);
        assert_eq!(vm.call(0, &[]).unwrap(), 1234);
    }

    #[test]
    fn switch_jumps_to_matching_case() {
        let mut b = ModuleBuilder::new();
        let mut code = Vec::new();
        code.push(LoadLocal as u8);
        emit_u32(&mut code, 0);
        code.push(Switch as u8);
        emit_u32(&mut code, 2); // num_cases
        let default_word_pos = code.len();
        emit_u32(&mut code, 0); // default_offset, patched below (points to "default" arm)
        emit_i64(&mut code, 1); // case 1
        emit_u32(&mut code, 0); // case 1 offset, patched below
        emit_i64(&mut code, 2); // case 2
        emit_u32(&mut code, 0); // case 2 offset, patched below

        let case1_arm = code.len() as u32;
        code.push(PushI64 as u8);
        emit_i64(&mut code, 111);
        code.push(Ret as u8);

        let case2_arm = code.len() as u32;
        code.push(PushI64 as u8);
        emit_i64(&mut code, 222);
        code.push(Ret as u8);

        let default_arm = code.len() as u32;
        code.push(PushI64 as u8);
        emit_i64(&mut code, 999);
        code.push(Ret as u8);

        let rel = |target: u32| -> i32 { target as i32 - default_word_pos as i32 };
        code[default_word_pos..default_word_pos + 4].copy_from_slice(&rel(default_arm).to_le_bytes());
        code[default_word_pos + 4 + 8..default_word_pos + 4 + 8 + 4].copy_from_slice(&rel(case1_arm).to_le_bytes());
        code[default_word_pos + 4 + 8 + 4 + 8..default_word_pos + 4 + 8 + 4 + 8 + 4]
            .copy_from_slice(&rel(case2_arm).to_le_bytes());

        b.add_function(0, 1, 1);
        b.set_code(code);
        let bytes = b.encode();
        let module = Module::decode(&bytes).unwrap();

        let natives: [NativeFn; 0] = [];
        let mut vm = Vm::new(&module, &natives);
        assert_eq!(vm.call(0, &[2]).unwrap(), 222);
        let mut vm = Vm::new(&module, &natives);
        assert_eq!(vm.call(0, &[7]).unwrap(), 999);
    }

    #[test]
    fn load_str_pushes_pool_index() {
        let mut b = ModuleBuilder::new();
        b.add_string("hello");
        let mut code = Vec::new();
        code.push(LoadStr as u8);
        emit_u32(&mut code, 0);
        code.push(Ret as u8);
        b.add_function(0, 0, 0);
        b.set_code(code);
        let bytes = b.encode();
        let module = Module::decode(&bytes).unwrap();

        let natives: [NativeFn; 0] = [];
        let mut vm = Vm::new(&module, &natives);
        assert_eq!(vm.call(0, &[]).unwrap(), 0);
    }
}
