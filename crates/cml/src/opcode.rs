//! The bytecode instruction set.
//!
//! Opcodes are fixed-size tagged records: an operator plus the immediates it
//! needs, which are either small indices into per-class or per-body lists, a
//! numeric immediate built directly into the instruction, or an absolute
//! jump offset (method-body relative). Building small constants into the
//! instruction avoids creating temp values for them.
//!
//! Jump offsets are patched in place by the compiler once the target is
//! known, so the payloads here are plain fields rather than opaque bytes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{ClassId, LocalId, MemberId, MethodId, ParmId};

/// One interpreter instruction.
///
/// The calling convention expects the emitter to have pushed the return
/// slot, then the method-call frame (`PushCurLine`), then the arguments in
/// order, before any of the `Call*` variants executes. The interpreter
/// locates the frame from the callee's parameter count and binds argument
/// slots relative to it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OpCode {
    /// Does nothing. Left behind by some patching operations.
    NoOp,
    /// Marks a statement boundary at the given source line. Drives the
    /// debugger line callback and the cooperative cancellation poll.
    CurLine(u32),
    /// Pushes the method-call frame for an upcoming call, stamped with the
    /// current source line for backtraces.
    PushCurLine,

    // Immediate pushes, one per primitive width. Each pushes a non-const
    // temp of the corresponding intrinsic class.
    PushImBoolean(bool),
    PushImCard1(u8),
    PushImCard2(u16),
    PushImCard4(u32),
    PushImCard8(u64),
    PushImChar(char),
    PushImFloat4(f32),
    PushImFloat8(f64),
    PushImInt1(i8),
    PushImInt2(i16),
    PushImInt4(i32),

    /// Pushes the current method's local with the given id.
    PushLocal(LocalId),
    /// Pushes the current instance's member with the given id.
    PushMember(MemberId),
    /// Pushes the current method's parameter with the given id.
    PushParm(ParmId),
    /// Pushes the current instance.
    PushThis,
    /// Pushes an entry of the current body's string pool, always const.
    PushStrPoolItem(u16),
    /// Pushes a const temp of the given class from the temp pool.
    PushTempConst(ClassId),
    /// Pushes a non-const temp of the given class from the temp pool.
    PushTempVar(ClassId),
    /// Pushes a temp enum value of the given class set to the ordinal.
    PushEnum(ClassId, u16),
    /// Pushes the thrown-exception value. Only valid inside a catch block.
    PushException,
    /// Re-pushes the item `depth` slots below the top. The new item carries
    /// the repush flag so popping it never releases the shared value.
    Repush(u32),

    /// Pops the top item, releasing whatever it owns.
    PopTop,
    /// Copies the stack top into the pending call's return slot, then pops.
    PopToReturn,
    /// Pops the given number of items.
    MultiPop(u32),
    /// Swaps the top two items.
    FlipTop,

    /// Expects (source above target) on the stack, both of the same
    /// copyable class. Copies source into target and pops both.
    Copy,
    /// Flips the boolean on the stack top in place.
    Negate,
    /// Pops two booleans, pushes their conjunction.
    LogicalAnd,
    /// Pops two booleans, pushes their disjunction.
    LogicalOr,
    /// Pops two booleans, pushes their exclusive or.
    LogicalXor,

    /// Unconditional jump to the absolute offset.
    Jump(u32),
    /// Pops a boolean; jumps when it is true.
    CondJump(u32),
    /// Jumps when the boolean on top is true, without popping it.
    CondJumpNP(u32),
    /// Pops a boolean; jumps when it is false.
    NotCondJump(u32),
    /// Jumps when the boolean on top is false, without popping it.
    NotCondJumpNP(u32),
    /// Pops the switch value and jumps through the body's jump table with
    /// the given id. The class id is the switch value's expected type.
    TableJump(u16, ClassId),

    /// Unwinds locals and arguments, pops the call frame, and resumes the
    /// caller. The return slot becomes the new stack top.
    Return,

    /// Calls the given method on a local of the current method.
    CallLocal(LocalId, MethodId),
    /// Calls the given method on a member of the current instance.
    CallMember(MemberId, MethodId),
    /// Calls the given method on a parameter of the current method.
    CallParm(ParmId, MethodId),
    /// Calls the given method on the current instance, dispatching to the
    /// direct ancestor's implementation.
    CallParent(MethodId),
    /// Calls the given method on the current instance polymorphically.
    CallThis(MethodId),
    /// Calls the given method on the value `depth` slots below the top,
    /// used when the receiver is the result of a previous call.
    CallStack(u16, MethodId),
    /// Calls the given method on the thrown-exception value.
    CallExcept(MethodId),

    /// Pops (index above collection) and pushes the indexed element as a
    /// live handle into the collection.
    ColIndex,
    /// Replaces the top with the value cast to the given class. Raises a
    /// cast error on incompatible classes, a range error on overflow.
    TypeCast(ClassId),

    /// Pushes a try marker recording the catch block's offset.
    Try(u32),
    /// Pops the try marker on the normal path, or the exception marker at
    /// the end of a catch block.
    EndTry,
    /// Throws the enum value on the stack top. The flag marks a rethrow,
    /// which preserves the original throw location and text.
    Throw(bool),
    /// Like `Throw`, with the given number of formattable argument values
    /// above the enum; they replace tokens in the error text.
    ThrowFmt(u32),

    /// Pops the enum value on the stack top, resetting it to its first
    /// ordinal.
    ResetEnum,
    /// Pops the enum on the stack top. If it was not at its last ordinal,
    /// increments it and pushes true; pushes false without changing it
    /// otherwise.
    CondEnumInc,
}

impl OpCode {
    /// Mnemonic for the operator, without operands.
    #[must_use]
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Self::NoOp => "NoOp",
            Self::CurLine(_) => "CurLine",
            Self::PushCurLine => "PushCurLine",
            Self::PushImBoolean(_) => "PushImBoolean",
            Self::PushImCard1(_) => "PushImCard1",
            Self::PushImCard2(_) => "PushImCard2",
            Self::PushImCard4(_) => "PushImCard4",
            Self::PushImCard8(_) => "PushImCard8",
            Self::PushImChar(_) => "PushImChar",
            Self::PushImFloat4(_) => "PushImFloat4",
            Self::PushImFloat8(_) => "PushImFloat8",
            Self::PushImInt1(_) => "PushImInt1",
            Self::PushImInt2(_) => "PushImInt2",
            Self::PushImInt4(_) => "PushImInt4",
            Self::PushLocal(_) => "PushLocal",
            Self::PushMember(_) => "PushMember",
            Self::PushParm(_) => "PushParm",
            Self::PushThis => "PushThis",
            Self::PushStrPoolItem(_) => "PushStrPoolItem",
            Self::PushTempConst(_) => "PushTempConst",
            Self::PushTempVar(_) => "PushTempVar",
            Self::PushEnum(..) => "PushEnum",
            Self::PushException => "PushException",
            Self::Repush(_) => "Repush",
            Self::PopTop => "PopTop",
            Self::PopToReturn => "PopToReturn",
            Self::MultiPop(_) => "MultiPop",
            Self::FlipTop => "FlipTop",
            Self::Copy => "Copy",
            Self::Negate => "Negate",
            Self::LogicalAnd => "LogicalAnd",
            Self::LogicalOr => "LogicalOr",
            Self::LogicalXor => "LogicalXor",
            Self::Jump(_) => "Jump",
            Self::CondJump(_) => "CondJump",
            Self::CondJumpNP(_) => "CondJumpNP",
            Self::NotCondJump(_) => "NotCondJump",
            Self::NotCondJumpNP(_) => "NotCondJumpNP",
            Self::TableJump(..) => "TableJump",
            Self::Return => "Return",
            Self::CallLocal(..) => "CallLocal",
            Self::CallMember(..) => "CallMember",
            Self::CallParm(..) => "CallParm",
            Self::CallParent(_) => "CallParent",
            Self::CallThis(_) => "CallThis",
            Self::CallStack(..) => "CallStack",
            Self::CallExcept(_) => "CallExcept",
            Self::ColIndex => "ColIndex",
            Self::TypeCast(_) => "TypeCast",
            Self::Try(_) => "Try",
            Self::EndTry => "EndTry",
            Self::Throw(_) => "Throw",
            Self::ThrowFmt(_) => "ThrowFmt",
            Self::ResetEnum => "ResetEnum",
            Self::CondEnumInc => "CondEnumInc",
        }
    }

    /// Whether this is a call operator.
    #[must_use]
    pub fn is_call(&self) -> bool {
        matches!(
            self,
            Self::CallLocal(..)
                | Self::CallMember(..)
                | Self::CallParm(..)
                | Self::CallParent(_)
                | Self::CallThis(_)
                | Self::CallStack(..)
                | Self::CallExcept(_)
        )
    }
}

/// Disassembly form: mnemonic plus operands. Stable across parses of the
/// same source, which the listing round-trip tests rely on.
impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NoOp
            | Self::PushCurLine
            | Self::PushThis
            | Self::PushException
            | Self::PopTop
            | Self::PopToReturn
            | Self::FlipTop
            | Self::Copy
            | Self::Negate
            | Self::LogicalAnd
            | Self::LogicalOr
            | Self::LogicalXor
            | Self::Return
            | Self::ColIndex
            | Self::EndTry
            | Self::ResetEnum
            | Self::CondEnumInc => write!(f, "{}", self.mnemonic()),
            Self::CurLine(n) => write!(f, "CurLine {n}"),
            Self::PushImBoolean(v) => write!(f, "PushImBoolean {v}"),
            Self::PushImCard1(v) => write!(f, "PushImCard1 {v}"),
            Self::PushImCard2(v) => write!(f, "PushImCard2 {v}"),
            Self::PushImCard4(v) => write!(f, "PushImCard4 {v}"),
            Self::PushImCard8(v) => write!(f, "PushImCard8 {v}"),
            Self::PushImChar(v) => write!(f, "PushImChar {:#06x}", v as u32),
            Self::PushImFloat4(v) => write!(f, "PushImFloat4 {v:?}"),
            Self::PushImFloat8(v) => write!(f, "PushImFloat8 {v:?}"),
            Self::PushImInt1(v) => write!(f, "PushImInt1 {v}"),
            Self::PushImInt2(v) => write!(f, "PushImInt2 {v}"),
            Self::PushImInt4(v) => write!(f, "PushImInt4 {v}"),
            Self::PushLocal(id) => write!(f, "PushLocal {id}"),
            Self::PushMember(id) => write!(f, "PushMember {id}"),
            Self::PushParm(id) => write!(f, "PushParm {id}"),
            Self::PushStrPoolItem(id) => write!(f, "PushStrPoolItem {id}"),
            Self::PushTempConst(id) => write!(f, "PushTempConst {id}"),
            Self::PushTempVar(id) => write!(f, "PushTempVar {id}"),
            Self::PushEnum(class, ord) => write!(f, "PushEnum {class},{ord}"),
            Self::Repush(depth) => write!(f, "Repush {depth}"),
            Self::MultiPop(n) => write!(f, "MultiPop {n}"),
            Self::Jump(ip) => write!(f, "Jump {ip}"),
            Self::CondJump(ip) => write!(f, "CondJump {ip}"),
            Self::CondJumpNP(ip) => write!(f, "CondJumpNP {ip}"),
            Self::NotCondJump(ip) => write!(f, "NotCondJump {ip}"),
            Self::NotCondJumpNP(ip) => write!(f, "NotCondJumpNP {ip}"),
            Self::TableJump(table, class) => write!(f, "TableJump {table},{class}"),
            Self::CallLocal(target, method) => write!(f, "CallLocal {target},{method}"),
            Self::CallMember(target, method) => write!(f, "CallMember {target},{method}"),
            Self::CallParm(target, method) => write!(f, "CallParm {target},{method}"),
            Self::CallParent(method) => write!(f, "CallParent {method}"),
            Self::CallThis(method) => write!(f, "CallThis {method}"),
            Self::CallStack(depth, method) => write!(f, "CallStack {depth},{method}"),
            Self::CallExcept(method) => write!(f, "CallExcept {method}"),
            Self::TypeCast(class) => write!(f, "TypeCast {class}"),
            Self::Try(ip) => write!(f, "Try {ip}"),
            Self::Throw(rethrow) => write!(f, "Throw {rethrow}"),
            Self::ThrowFmt(n) => write!(f, "ThrowFmt {n}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_operands() {
        assert_eq!(OpCode::PushLocal(2).to_string(), "PushLocal 2");
        assert_eq!(OpCode::CallStack(1, 4).to_string(), "CallStack 1,4");
        assert_eq!(OpCode::Throw(true).to_string(), "Throw true");
        assert_eq!(OpCode::Return.to_string(), "Return");
    }

    #[test]
    fn call_predicate() {
        assert!(OpCode::CallThis(3).is_call());
        assert!(!OpCode::Jump(0).is_call());
    }
}
