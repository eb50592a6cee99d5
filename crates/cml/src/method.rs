//! Method descriptors and method bodies.
//!
//! A descriptor ([`MethodInfo`]) is the callable signature: name, id,
//! return class, parameters, visibility, extension attribute, constness,
//! and the constructor flag. Descriptors are copied down the inheritance
//! chain so an override shares its parent's id.
//!
//! A body ([`MethodBody`]) is one implementation of a descriptor: the local
//! list, the per-body string pool, the opcode sequence, and any jump
//! tables. Bodies are self-contained (opcodes index only into their own
//! pools) so a compiled body can be reused across engine instances.
//! Native implementations have no body at all; they dispatch through
//! [`MethodImpl::Native`] outside the interpreter loop.

use std::rc::Rc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{
    error::NativeError,
    intrinsics::NativeMethod,
    opcode::OpCode,
    types::{BAD_ID, ClassId, Intrinsic, LocalId, MethodExt, MethodId, ParmDir, ParmId, Visibility},
    value::ValueData,
};

const MAX_LOCALS: usize = 4096;

/// One parameter of a method descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParmInfo {
    pub name: String,
    pub class_id: ClassId,
    pub dir: ParmDir,
    /// 1-based position within the owning descriptor.
    pub id: ParmId,
}

/// One declared local of a method body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalInfo {
    pub name: String,
    pub class_id: ClassId,
    pub is_const: bool,
    /// 1-based position within the owning body.
    pub id: LocalId,
    /// Literal initializer for primitive locals, applied on push.
    pub init: Option<ValueData>,
}

/// A method signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodInfo {
    name: String,
    /// 1-based id within the owning class, shared with overrides.
    id: MethodId,
    ret_class: ClassId,
    parms: SmallVec<[ParmInfo; 4]>,
    visibility: Visibility,
    ext: MethodExt,
    is_const: bool,
    is_ctor: bool,
}

impl MethodInfo {
    #[must_use]
    pub fn new(name: &str, ret_class: ClassId, visibility: Visibility, ext: MethodExt) -> Self {
        Self {
            name: name.to_owned(),
            id: BAD_ID,
            ret_class,
            parms: SmallVec::new(),
            visibility,
            ext,
            is_const: false,
            is_ctor: false,
        }
    }

    /// Convenience constructor for a void-returning method.
    #[must_use]
    pub fn new_void(name: &str, visibility: Visibility, ext: MethodExt) -> Self {
        Self::new(name, Intrinsic::Void.id(), visibility, ext)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn id(&self) -> MethodId {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: MethodId) {
        self.id = id;
    }

    #[must_use]
    pub fn ret_class(&self) -> ClassId {
        self.ret_class
    }

    #[must_use]
    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    #[must_use]
    pub fn ext(&self) -> MethodExt {
        self.ext
    }

    pub fn set_ext(&mut self, ext: MethodExt) {
        self.ext = ext;
    }

    #[must_use]
    pub fn is_const(&self) -> bool {
        self.is_const
    }

    #[must_use]
    pub fn set_const(mut self, is_const: bool) -> Self {
        self.is_const = is_const;
        self
    }

    #[must_use]
    pub fn is_ctor(&self) -> bool {
        self.is_ctor
    }

    #[must_use]
    pub fn set_ctor(mut self, is_ctor: bool) -> Self {
        self.is_ctor = is_ctor;
        self
    }

    /// Adds a parameter, assigning the next 1-based id.
    pub fn add_parm(&mut self, name: &str, class_id: ClassId, dir: ParmDir) -> Result<ParmId, NativeError> {
        if self.parms.len() + 1 >= usize::from(BAD_ID) {
            return Err(NativeError::Capacity("parameter"));
        }
        let id = (self.parms.len() + 1) as ParmId;
        self.parms.push(ParmInfo {
            name: name.to_owned(),
            class_id,
            dir,
            id,
        });
        Ok(id)
    }

    /// Builder form of [`Self::add_parm`], used by the intrinsic tables
    /// where the fixed signatures cannot overflow.
    #[must_use]
    pub fn with_parm(mut self, name: &str, class_id: ClassId, dir: ParmDir) -> Self {
        self.add_parm(name, class_id, dir).expect("intrinsic parameter list overflow");
        self
    }

    #[must_use]
    pub fn parm_count(&self) -> usize {
        self.parms.len()
    }

    #[must_use]
    pub fn parms(&self) -> &[ParmInfo] {
        &self.parms
    }

    /// Looks up a parameter by 1-based id.
    #[must_use]
    pub fn parm(&self, id: ParmId) -> Option<&ParmInfo> {
        id.checked_sub(1).and_then(|ix| self.parms.get(usize::from(ix)))
    }

    #[must_use]
    pub fn find_parm(&self, name: &str) -> Option<&ParmInfo> {
        self.parms.iter().find(|p| p.name == name)
    }

    /// Whether `other` matches this descriptor exactly: parameter count,
    /// types and directions, and return type. Required for overrides.
    #[must_use]
    pub fn same_signature(&self, other: &Self) -> bool {
        self.ret_class == other.ret_class
            && self.parms.len() == other.parms.len()
            && self
                .parms
                .iter()
                .zip(&other.parms)
                .all(|(a, b)| a.class_id == b.class_id && a.dir == b.dir)
    }
}

/// A case entry's match value.
///
/// Stored by value rather than as a heap handle so compiled bodies stay
/// self-contained and serializable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CaseValue {
    Bool(bool),
    Char(char),
    Card(u64),
    Int(i64),
    Enum(u32),
}

impl CaseValue {
    /// Whether a runtime switch value matches this case.
    #[must_use]
    pub fn matches(&self, data: &ValueData) -> bool {
        match (self, data) {
            (Self::Bool(a), ValueData::Boolean(b)) => a == b,
            (Self::Char(a), ValueData::Char(b)) => a == b,
            (Self::Enum(a), ValueData::Enum(b)) => a == b,
            (Self::Card(a), _) => data.as_i128() == Some(i128::from(*a)),
            (Self::Int(a), _) => data.as_i128() == Some(i128::from(*a)),
            _ => false,
        }
    }
}

/// Per-switch lookup from case value to target offset, plus a default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JumpTable {
    cases: Vec<(CaseValue, u32)>,
    default_ip: Option<u32>,
}

impl JumpTable {
    /// Records a case. The compiler checks duplicates before calling.
    pub fn add_case(&mut self, value: CaseValue, ip: u32) {
        self.cases.push((value, ip));
    }

    pub fn set_default(&mut self, ip: u32) {
        self.default_ip = Some(ip);
    }

    #[must_use]
    pub fn has_case(&self, value: CaseValue) -> bool {
        self.cases.iter().any(|(v, _)| v.matches_case(value))
    }

    #[must_use]
    pub fn has_default(&self) -> bool {
        self.default_ip.is_some()
    }

    #[must_use]
    pub fn case_count(&self) -> usize {
        self.cases.len()
    }

    /// The target for a runtime switch value: the matching case, or the
    /// default when nothing matches.
    #[must_use]
    pub fn find_target(&self, data: &ValueData) -> Option<u32> {
        self.cases
            .iter()
            .find(|(v, _)| v.matches(data))
            .map(|&(_, ip)| ip)
            .or(self.default_ip)
    }
}

impl CaseValue {
    fn matches_case(&self, other: Self) -> bool {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => *a == b,
            (Self::Char(a), Self::Char(b)) => *a == b,
            (Self::Enum(a), Self::Enum(b)) => *a == b,
            (Self::Card(a), Self::Card(b)) => *a == b,
            (Self::Int(a), Self::Int(b)) => *a == b,
            _ => false,
        }
    }
}

/// One bytecode implementation of a method descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodBody {
    method_id: MethodId,
    locals: Vec<LocalInfo>,
    string_pool: Vec<String>,
    ops: Vec<OpCode>,
    jump_tables: Vec<JumpTable>,
}

impl MethodBody {
    #[must_use]
    pub fn new(method_id: MethodId) -> Self {
        Self {
            method_id,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn method_id(&self) -> MethodId {
        self.method_id
    }

    /// Adds a declared local, assigning the next 1-based id.
    pub fn add_local(
        &mut self,
        name: &str,
        class_id: ClassId,
        is_const: bool,
        init: Option<ValueData>,
    ) -> Result<LocalId, NativeError> {
        if self.locals.len() >= MAX_LOCALS {
            return Err(NativeError::Capacity("local"));
        }
        let id = (self.locals.len() + 1) as LocalId;
        self.locals.push(LocalInfo {
            name: name.to_owned(),
            class_id,
            is_const,
            id,
            init,
        });
        Ok(id)
    }

    #[must_use]
    pub fn locals(&self) -> &[LocalInfo] {
        &self.locals
    }

    /// Looks up a local by 1-based id.
    #[must_use]
    pub fn local(&self, id: LocalId) -> Option<&LocalInfo> {
        id.checked_sub(1).and_then(|ix| self.locals.get(usize::from(ix)))
    }

    #[must_use]
    pub fn find_local(&self, name: &str) -> Option<&LocalInfo> {
        self.locals.iter().find(|l| l.name == name)
    }

    /// Adds a string literal to the pool, returning its index.
    ///
    /// With `dedup`, an identical existing entry is reused; the medium and
    /// maximum optimization levels compile with dedup on.
    pub fn add_string(&mut self, text: &str, dedup: bool) -> Result<u16, NativeError> {
        if dedup {
            if let Some(ix) = self.string_pool.iter().position(|s| s == text) {
                return Ok(ix as u16);
            }
        }
        if self.string_pool.len() >= usize::from(BAD_ID) {
            return Err(NativeError::Capacity("string pool entry"));
        }
        let ix = self.string_pool.len() as u16;
        self.string_pool.push(text.to_owned());
        Ok(ix)
    }

    #[must_use]
    pub fn pool_string(&self, ix: u16) -> Option<&str> {
        self.string_pool.get(usize::from(ix)).map(String::as_str)
    }

    #[must_use]
    pub fn string_count(&self) -> usize {
        self.string_pool.len()
    }

    /// Appends an opcode, returning its offset.
    pub fn add_op(&mut self, op: OpCode) -> u32 {
        let ip = self.ops.len() as u32;
        self.ops.push(op);
        ip
    }

    #[must_use]
    pub fn op(&self, ip: u32) -> Option<&OpCode> {
        self.ops.get(ip as usize)
    }

    #[must_use]
    pub fn ops(&self) -> &[OpCode] {
        &self.ops
    }

    /// Offset the next emitted opcode will get.
    #[must_use]
    pub fn next_ip(&self) -> u32 {
        self.ops.len() as u32
    }

    /// Rewrites the jump target of the (jump-family) opcode at `ip`.
    pub fn patch_jump(&mut self, ip: u32, target: u32) {
        match self.ops.get_mut(ip as usize) {
            Some(
                OpCode::Jump(t)
                | OpCode::CondJump(t)
                | OpCode::CondJumpNP(t)
                | OpCode::NotCondJump(t)
                | OpCode::NotCondJumpNP(t)
                | OpCode::Try(t),
            ) => *t = target,
            other => debug_assert!(false, "patch target at {ip} is not a jump: {other:?}"),
        }
    }

    /// Reserves a jump table, returning its index for `TableJump`.
    pub fn add_jump_table(&mut self) -> Result<u16, NativeError> {
        if self.jump_tables.len() >= usize::from(BAD_ID) {
            return Err(NativeError::Capacity("jump table"));
        }
        let ix = self.jump_tables.len() as u16;
        self.jump_tables.push(JumpTable::default());
        Ok(ix)
    }

    #[must_use]
    pub fn jump_table(&self, ix: u16) -> Option<&JumpTable> {
        self.jump_tables.get(usize::from(ix))
    }

    pub fn jump_table_mut(&mut self, ix: u16) -> Option<&mut JumpTable> {
        self.jump_tables.get_mut(usize::from(ix))
    }

    /// Rewrites the immediate push at `ip` to the given numeric class, for
    /// untyped literals adapting to their context. False when the opcode
    /// is not an immediate push or the value does not fit the target.
    pub fn convert_numeric(&mut self, ip: u32, target: Intrinsic) -> bool {
        let Some(op) = self.ops.get_mut(ip as usize) else {
            return false;
        };
        let wide: i128 = match *op {
            OpCode::PushImCard1(v) => i128::from(v),
            OpCode::PushImCard2(v) => i128::from(v),
            OpCode::PushImCard4(v) => i128::from(v),
            OpCode::PushImCard8(v) => i128::from(v),
            OpCode::PushImInt1(v) => i128::from(v),
            OpCode::PushImInt2(v) => i128::from(v),
            OpCode::PushImInt4(v) => i128::from(v),
            OpCode::PushImFloat4(v) => {
                return match target {
                    Intrinsic::Float8 => {
                        *op = OpCode::PushImFloat8(f64::from(v));
                        true
                    }
                    Intrinsic::Float4 => true,
                    _ => false,
                };
            }
            OpCode::PushImFloat8(v) => {
                return match target {
                    Intrinsic::Float4 => {
                        *op = OpCode::PushImFloat4(v as f32);
                        true
                    }
                    Intrinsic::Float8 => true,
                    _ => false,
                };
            }
            _ => return false,
        };
        let converted = match target {
            Intrinsic::Float4 => Some(OpCode::PushImFloat4(wide as f32)),
            Intrinsic::Float8 => Some(OpCode::PushImFloat8(wide as f64)),
            _ => match ValueData::from_i128(target, wide) {
                Some(ValueData::Card1(v)) => Some(OpCode::PushImCard1(v)),
                Some(ValueData::Card2(v)) => Some(OpCode::PushImCard2(v)),
                Some(ValueData::Card4(v)) => Some(OpCode::PushImCard4(v)),
                Some(ValueData::Card8(v)) => Some(OpCode::PushImCard8(v)),
                Some(ValueData::Int1(v)) => Some(OpCode::PushImInt1(v)),
                Some(ValueData::Int2(v)) => Some(OpCode::PushImInt2(v)),
                Some(ValueData::Int4(v)) => Some(OpCode::PushImInt4(v)),
                _ => None,
            },
        };
        match converted {
            Some(new_op) => {
                *op = new_op;
                true
            }
            None => false,
        }
    }

    /// Disassembly listing of the opcode sequence, one instruction per
    /// line. Identical source compiles to an identical listing.
    #[must_use]
    pub fn listing(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        for (ip, op) in self.ops.iter().enumerate() {
            let _ = writeln!(out, "{ip:05} {op}");
        }
        out
    }
}

/// One implementation slot of a class: bytecode or host-native.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MethodImpl {
    /// A compiled bytecode body, shared with the interpreter during
    /// execution.
    Ops(Rc<MethodBody>),
    /// A host-provided method dispatched outside the interpreter.
    Native { method_id: MethodId, func: NativeMethod },
}

impl MethodImpl {
    #[must_use]
    pub fn method_id(&self) -> MethodId {
        match self {
            Self::Ops(body) => body.method_id(),
            Self::Native { method_id, .. } => *method_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_pool_dedup_collapses_duplicates() {
        let mut body = MethodBody::new(1);
        let a = body.add_string("hello", true).unwrap();
        let b = body.add_string("world", true).unwrap();
        let c = body.add_string("hello", true).unwrap();
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(body.string_count(), 2);

        // without dedup, duplicates get their own slots
        let d = body.add_string("hello", false).unwrap();
        assert_eq!(body.string_count(), 3);
        assert_ne!(a, d);
    }

    #[test]
    fn jump_table_falls_back_to_default() {
        let mut table = JumpTable::default();
        table.add_case(CaseValue::Enum(2), 10);
        table.add_case(CaseValue::Enum(3), 20);
        table.set_default(30);
        assert_eq!(table.find_target(&ValueData::Enum(2)), Some(10));
        assert_eq!(table.find_target(&ValueData::Enum(7)), Some(30));
        assert!(table.has_case(CaseValue::Enum(3)));
        assert!(!table.has_case(CaseValue::Enum(4)));
    }

    #[test]
    fn signature_match_requires_types_directions_and_return() {
        let mut a = MethodInfo::new("M", Intrinsic::String.id(), Visibility::Public, MethodExt::NonFinal);
        a.add_parm("x", Intrinsic::Card4.id(), ParmDir::In).unwrap();
        let mut b = a.clone();
        assert!(a.same_signature(&b));

        b.add_parm("y", Intrinsic::Card4.id(), ParmDir::In).unwrap();
        assert!(!a.same_signature(&b));

        let mut c = MethodInfo::new("M", Intrinsic::String.id(), Visibility::Public, MethodExt::NonFinal);
        c.add_parm("x", Intrinsic::Card4.id(), ParmDir::Out).unwrap();
        assert!(!a.same_signature(&c));
    }

    #[test]
    fn patch_jump_rewrites_target() {
        let mut body = MethodBody::new(1);
        let jump = body.add_op(OpCode::Jump(0));
        body.add_op(OpCode::NoOp);
        body.patch_jump(jump, 2);
        assert_eq!(body.op(jump), Some(&OpCode::Jump(2)));
    }
}
