//! Shared id types and small enums used across the engine.
//!
//! Every entity the engine tracks (classes, methods, members, parameters,
//! locals) gets a 16-bit id assigned as a 1-based monotonically increasing
//! counter within its container. `BAD_ID` marks absence. Class ids are
//! engine-global and assigned in registration order, which lets the
//! interpreter test intrinsic membership with simple range comparisons.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, FromRepr, IntoStaticStr};

/// Engine-global class id, assigned in registration order.
pub type ClassId = u16;

/// Method id within a class (inherited methods keep their parent ids).
pub type MethodId = u16;

/// Member id within a class (inherited members keep their parent ids).
pub type MemberId = u16;

/// Parameter id within a method descriptor.
pub type ParmId = u16;

/// Local-variable id within a method body.
pub type LocalId = u16;

/// Sentinel id meaning "no such entity".
pub const BAD_ID: u16 = u16::MAX;

/// The intrinsic classes, in their fixed registration order.
///
/// The engine registers these before anything else so their class ids are
/// known constants. Several interpreter fast paths depend on the ordering:
/// numeric classes are the contiguous `Card1..=Int4` range, and any id below
/// `Intrinsic::COUNT` is intrinsic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, FromRepr, IntoStaticStr, Serialize, Deserialize)]
#[repr(u16)]
pub enum Intrinsic {
    Object,
    Void,
    TextOutStream,
    Formattable,
    Enum,
    BaseInfo,
    Boolean,
    Char,
    String,
    Card1,
    Card2,
    Card4,
    Card8,
    Float4,
    Float8,
    Int1,
    Int2,
    Int4,
    Time,
    StringList,
    Exception,
    MemBuf,
    StringOutStream,
}

impl Intrinsic {
    /// Number of intrinsic classes; user class ids start here.
    pub const COUNT: u16 = 23;

    /// The class id this intrinsic was registered under.
    #[must_use]
    pub fn id(self) -> ClassId {
        self as ClassId
    }

    /// Reverse lookup from a class id, when it is in the intrinsic range.
    #[must_use]
    pub fn from_id(id: ClassId) -> Option<Self> {
        Self::from_repr(id)
    }
}

/// Returns true if the id names one of the intrinsic classes.
#[must_use]
pub fn is_intrinsic(id: ClassId) -> bool {
    id < Intrinsic::COUNT
}

/// Returns true if the id names one of the numeric intrinsic classes.
///
/// Relies on the contiguous numeric block in the intrinsic ordering.
#[must_use]
pub fn is_numeric(id: ClassId) -> bool {
    (Intrinsic::Card1.id()..=Intrinsic::Int4.id()).contains(&id)
}

/// Returns true if the id names an unsigned numeric intrinsic.
#[must_use]
pub fn is_cardinal(id: ClassId) -> bool {
    (Intrinsic::Card1.id()..=Intrinsic::Card8.id()).contains(&id)
}

/// Returns true if the id names a signed integral intrinsic.
#[must_use]
pub fn is_integer(id: ClassId) -> bool {
    (Intrinsic::Int1.id()..=Intrinsic::Int4.id()).contains(&id)
}

/// Returns true if the id names a floating-point intrinsic.
#[must_use]
pub fn is_float(id: ClassId) -> bool {
    (Intrinsic::Float4.id()..=Intrinsic::Float8.id()).contains(&id)
}

/// How a class may be extended.
///
/// Abstract classes must be derived from and cannot be instantiated. Final
/// classes stop further derivation. Class-level Final overrides any
/// per-method extension attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr, Serialize, Deserialize)]
pub enum ClassExt {
    Abstract,
    NonFinal,
    Final,
}

/// How a method may be extended at the current class level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr, Serialize, Deserialize)]
pub enum MethodExt {
    NonFinal,
    Required,
    Final,
}

impl MethodExt {
    /// Whether an override at a derived level may carry `to` when the parent
    /// level carries `self`.
    ///
    /// Any forward movement is legal (NonFinal -> Required, anything ->
    /// Final), the only backward movement is Required -> NonFinal, and a
    /// Final method cannot be overridden at all.
    #[must_use]
    pub fn allows_override_as(self, to: Self) -> bool {
        match self {
            Self::Final => false,
            Self::NonFinal | Self::Required => {
                matches!(to, Self::NonFinal | Self::Required | Self::Final)
            }
        }
    }
}

/// Parameter passing direction.
///
/// In parameters cannot be assigned inside the callee. Out and InOut
/// arguments must be direct value references at the call site so callee
/// writes reach the caller's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr, Serialize, Deserialize)]
pub enum ParmDir {
    In,
    Out,
    InOut,
}

/// Method visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr, Serialize, Deserialize)]
pub enum Visibility {
    Private,
    Public,
}

/// Result of a type cast attempt.
///
/// Incompatible means the classes cannot convert at all; Range means the
/// source value does not fit the target width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastRes {
    Ok,
    Incompatible,
    Range,
}

/// Method dispatch mode.
///
/// Poly resolves the body on the runtime class of the receiver; Mono starts
/// at the statically named class (used for explicit parent calls).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Mono,
    Poly,
}

/// Optimization level for method-body compilation.
///
/// Minimal performs no transformations. Medium and Maximum enable string
/// pool deduplication and prefer immediate pushes for small numeric
/// literals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Serialize, Deserialize)]
pub enum OptLevel {
    #[default]
    Minimal,
    Medium,
    Maximum,
}

/// When macro-level exceptions are reported to the runtime error handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExceptReport {
    /// Report at the point of throw, even if later caught.
    AtThrow,
    /// Report only when the unwind exits the outermost frame.
    #[default]
    NotHandled,
}

/// Result of resolving a class name that may be partial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassMatch {
    NotFound,
    Unique,
    Ambiguous,
}

/// How tolerant a parsing step is of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recover {
    /// Emit an error and give up on the construct.
    No,
    /// Emit an error, resync to a safe anchor, and continue.
    Yes,
    /// Just report failure to the caller, emitting nothing.
    CheckOnly,
}

/// Commands a debugger returns from its line callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbgAction {
    /// Tear down the session entirely.
    CloseSession,
    Continue,
    /// Unwind everything and exit the macro.
    Exit,
}

/// Format depth requested from a value by debugging UIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbgFmt {
    Short,
    Long,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intrinsic_ids_are_stable() {
        assert_eq!(Intrinsic::Object.id(), 0);
        assert_eq!(Intrinsic::Void.id(), 1);
        assert_eq!(Intrinsic::Boolean.id(), 6);
        assert_eq!(Intrinsic::Card1.id(), 9);
        assert_eq!(Intrinsic::Int4.id(), 17);
        assert_eq!(Intrinsic::StringOutStream.id(), Intrinsic::COUNT - 1);
        assert_eq!(Intrinsic::from_id(8), Some(Intrinsic::String));
        assert_eq!(Intrinsic::from_id(Intrinsic::COUNT), None);
    }

    #[test]
    fn numeric_range_covers_exactly_the_numeric_block() {
        let numeric: Vec<ClassId> = (0..Intrinsic::COUNT).filter(|&id| is_numeric(id)).collect();
        assert_eq!(
            numeric,
            vec![
                Intrinsic::Card1.id(),
                Intrinsic::Card2.id(),
                Intrinsic::Card4.id(),
                Intrinsic::Card8.id(),
                Intrinsic::Float4.id(),
                Intrinsic::Float8.id(),
                Intrinsic::Int1.id(),
                Intrinsic::Int2.id(),
                Intrinsic::Int4.id(),
            ]
        );
        assert!(!is_numeric(Intrinsic::String.id()));
        assert!(!is_numeric(Intrinsic::Time.id()));
    }

    #[test]
    fn override_transitions() {
        assert!(MethodExt::NonFinal.allows_override_as(MethodExt::Final));
        assert!(MethodExt::NonFinal.allows_override_as(MethodExt::Required));
        assert!(MethodExt::Required.allows_override_as(MethodExt::NonFinal));
        assert!(MethodExt::Required.allows_override_as(MethodExt::Final));
        assert!(!MethodExt::Final.allows_override_as(MethodExt::NonFinal));
        assert!(!MethodExt::Final.allows_override_as(MethodExt::Final));
    }
}
