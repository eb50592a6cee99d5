//! Registration of the intrinsic classes and dispatch of their methods.
//!
//! The intrinsic set is closed and registered in a fixed order (see
//! [`Intrinsic`]) so every id is a known constant. Each class registers its
//! method descriptors with a [`NativeMethod`] implementation handle; those
//! methods run outside the bytecode loop, reading their receiver, arguments
//! and return slot through the engine's stack accessors.
//!
//! The macro-visible `MEng.RuntimeErrors` enum class is registered right
//! after the fixed set, so engine-detected failures (range casts, bad
//! indexes, division by zero) propagate as ordinary catchable exceptions.

mod misc;
mod numeric;
mod strings;

use serde::{Deserialize, Serialize};

use crate::{
    class::{ClassInfo, ClassKind, EnumItem, LiteralValue},
    engine::Engine,
    error::{NativeError, RuntimeErr},
    heap::ValueId,
    method::{MethodImpl, MethodInfo},
    registry::ClassRegistry,
    types::{ClassExt, ClassId, Intrinsic, MethodExt, ParmDir, Visibility},
    value::ValueData,
};

/// Class path of the engine's runtime-error enum.
pub const RUNTIME_ERRORS_PATH: &str = "MEng.RuntimeErrors";

/// Implementation handle for a host-provided method.
///
/// One variant per native behavior; several classes share a variant when
/// the behavior is uniform over the receiver class (all the numeric
/// classes dispatch arithmetic through the same handles).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NativeMethod {
    /// Default constructor; storage is already default-initialized.
    DefCtor,
    /// One-argument constructor: copies the argument into the receiver.
    ValCtor,
    /// Equality over same-class scalar payloads.
    ScalarEqual,

    // numeric classes
    NumAdd,
    NumSub,
    NumMul,
    NumDiv,
    NumMod,
    NumGt,
    NumLt,
    NumGtEq,
    NumLtEq,
    NumInc,
    NumDec,
    NumNegate,
    BitAnd,
    BitOr,
    BitXor,

    // String
    StrClear,
    StrAppend,
    StrGetLength,
    StrIsEmpty,
    StrGetAt,

    // StringList
    StrListElemCount,
    StrListAppend,
    StrListGetAt,
    StrListClear,

    // Char
    CharGetOrd,

    // Enum base class, inherited by every enumerated class
    EnumGetOrdinal,
    EnumSetOrdinal,
    EnumGetName,
    EnumGetText,
    EnumFromName,

    // Exception
    ExcCheck,
    ExcGetErrorText,
    ExcGetErrorName,
    ExcGetLine,
    ExcGetClass,

    // output streams
    StrmPrint,
    StrmPrintLine,
    StrmNewLine,
    StrmGetText,
    StrmReset,

    // Time
    TimeGetCurMillis,
    TimeSetToNow,
    TimeSleep,

    // MemBuf
    BufGetAt,
    BufPutAt,
    BufGetSize,

    // nested array/vector classes
    ColAdd,
    ColElemCount,
    ColRemoveAll,
}

/// Receiver and frame location of an in-flight native call.
#[derive(Debug, Clone, Copy)]
pub struct NativeCall {
    /// The receiver value.
    pub this: ValueId,
    /// Stack index of the call frame; arguments sit just above it, the
    /// return slot just below.
    pub frame: usize,
}

/// Runs a native method. Errors with a macro-visible equivalent are turned
/// into catchable exceptions by the caller.
pub(crate) fn dispatch(engine: &mut Engine, func: NativeMethod, call: NativeCall) -> Result<(), NativeError> {
    use NativeMethod as N;
    match func {
        N::DefCtor => Ok(()),
        N::ValCtor => misc::val_ctor(engine, call),
        N::ScalarEqual => misc::scalar_equal(engine, call),

        N::NumAdd | N::NumSub | N::NumMul | N::NumDiv | N::NumMod | N::BitAnd | N::BitOr | N::BitXor => {
            numeric::binary_op(engine, func, call)
        }
        N::NumGt | N::NumLt | N::NumGtEq | N::NumLtEq => numeric::compare_op(engine, func, call),
        N::NumInc | N::NumDec => numeric::step_op(engine, func, call),
        N::NumNegate => numeric::negate(engine, call),

        N::StrClear | N::StrAppend | N::StrGetLength | N::StrIsEmpty | N::StrGetAt => {
            strings::string_op(engine, func, call)
        }
        N::StrListElemCount | N::StrListAppend | N::StrListGetAt | N::StrListClear => {
            strings::string_list_op(engine, func, call)
        }
        N::CharGetOrd => strings::char_get_ord(engine, call),

        N::EnumGetOrdinal | N::EnumSetOrdinal | N::EnumGetName | N::EnumGetText | N::EnumFromName => {
            misc::enum_op(engine, func, call)
        }

        N::ExcCheck | N::ExcGetErrorText | N::ExcGetErrorName | N::ExcGetLine | N::ExcGetClass => {
            misc::except_op(engine, func, call)
        }

        N::StrmPrint | N::StrmPrintLine | N::StrmNewLine | N::StrmGetText | N::StrmReset => {
            misc::stream_op(engine, func, call)
        }

        N::TimeGetCurMillis | N::TimeSetToNow | N::TimeSleep => misc::time_op(engine, func, call),

        N::BufGetAt | N::BufPutAt | N::BufGetSize => misc::membuf_op(engine, func, call),

        N::ColAdd | N::ColElemCount | N::ColRemoveAll => misc::collection_op(engine, func, call),
    }
}

/// Fills the method table of a nested array or vector class.
///
/// Arrays are fixed-size and only report their element count; vectors also
/// grow and reset.
pub(crate) fn collection_methods(class: &mut ClassInfo, elem: ClassId, growable: bool) {
    let count = MethodInfo::new("ElemCount", Intrinsic::Card4.id(), Visibility::Public, MethodExt::Final)
        .set_const(true);
    add_native(class, count, NativeMethod::ColElemCount);
    if growable {
        let add = MethodInfo::new_void("AddObject", Visibility::Public, MethodExt::Final).with_parm(
            "ToAdd",
            elem,
            ParmDir::In,
        );
        add_native(class, add, NativeMethod::ColAdd);
        let remove_all = MethodInfo::new_void("RemoveAll", Visibility::Public, MethodExt::Final);
        add_native(class, remove_all, NativeMethod::ColRemoveAll);
    }
}

/// Registers the closed intrinsic set, in fixed id order, plus the
/// runtime-error enum. Must run on an empty registry.
pub fn register_all(registry: &mut ClassRegistry) -> Result<(), NativeError> {
    debug_assert_eq!(registry.class_count(), 0, "intrinsics register first");

    // MEng.Object is the root; everything else names a parent.
    let object = ClassInfo::new("Object", "MEng", "", false, ClassExt::Abstract);
    registry.add_root_class(object)?;

    register_one(registry, Intrinsic::Void, "MEng.Object", false, ClassExt::Abstract, |_| {})?;

    // TextOutStream's fixed id precedes its parent's, so it registers
    // deferred and completes (and gains its methods) once Formattable is in.
    let stream_class = ClassInfo::new("TextOutStream", "MEng", "MEng.Formattable", false, ClassExt::Abstract);
    let stream_id = registry.add_class_deferred(stream_class)?;
    debug_assert_eq!(stream_id, Intrinsic::TextOutStream.id());

    register_one(registry, Intrinsic::Formattable, "MEng.Object", false, ClassExt::Abstract, |_| {})?;
    registry.complete_deferred(stream_id)?;
    misc::stream_methods(registry.class_by_id_mut(stream_id)?);
    register_one(registry, Intrinsic::Enum, "MEng.Formattable", true, ClassExt::Abstract, misc::enum_methods)?;
    register_one(registry, Intrinsic::BaseInfo, "MEng.Object", false, ClassExt::Final, misc::base_info_literals)?;
    register_one(registry, Intrinsic::Boolean, "MEng.Formattable", true, ClassExt::Final, misc::boolean_methods)?;
    register_one(registry, Intrinsic::Char, "MEng.Formattable", true, ClassExt::Final, strings::char_methods)?;
    register_one(registry, Intrinsic::String, "MEng.Formattable", true, ClassExt::Final, strings::string_methods)?;
    for num in [
        Intrinsic::Card1,
        Intrinsic::Card2,
        Intrinsic::Card4,
        Intrinsic::Card8,
        Intrinsic::Float4,
        Intrinsic::Float8,
        Intrinsic::Int1,
        Intrinsic::Int2,
        Intrinsic::Int4,
    ] {
        register_one(registry, num, "MEng.Formattable", true, ClassExt::Final, |class| {
            numeric::numeric_methods(class, num);
        })?;
    }
    register_one(registry, Intrinsic::Time, "MEng.Formattable", true, ClassExt::Final, misc::time_methods)?;
    register_one(registry, Intrinsic::StringList, "MEng.Formattable", true, ClassExt::Final, strings::string_list_methods)?;
    register_one(registry, Intrinsic::Exception, "MEng.Formattable", true, ClassExt::Final, misc::except_methods)?;
    register_one(registry, Intrinsic::MemBuf, "MEng.Formattable", true, ClassExt::Final, misc::membuf_methods)?;
    register_one(registry, Intrinsic::StringOutStream, "MEng.TextOutStream", false, ClassExt::Final, misc::string_stream_methods)?;

    register_runtime_errors(registry)?;
    Ok(())
}

/// Builds and registers one intrinsic class, asserting it lands on its
/// fixed id.
fn register_one(
    registry: &mut ClassRegistry,
    which: Intrinsic,
    parent: &str,
    copyable: bool,
    ext: ClassExt,
    fill: impl FnOnce(&mut ClassInfo),
) -> Result<(), NativeError> {
    let name: &'static str = which.into();
    let mut class = ClassInfo::new(name, "MEng", parent, copyable, ext);
    fill(&mut class);
    let id = registry.add_class(class)?;
    debug_assert_eq!(id, which.id(), "intrinsic registration order drifted");
    Ok(())
}

fn register_runtime_errors(registry: &mut ClassRegistry) -> Result<(), NativeError> {
    let mut class = ClassInfo::new("RuntimeErrors", "MEng", "MEng.Enum", true, ClassExt::Final);
    class.set_kind(ClassKind::Enum(
        RuntimeErr::ITEMS
            .iter()
            .enumerate()
            .map(|(ord, (name, text))| EnumItem {
                name: (*name).to_owned(),
                text: (*text).to_owned(),
                map_val: ord as u32,
            })
            .collect(),
    ));
    registry.add_class(class)?;
    Ok(())
}

/// Adds a method descriptor backed by a native handle.
pub(crate) fn add_native(class: &mut ClassInfo, method: MethodInfo, func: NativeMethod) {
    let method_id = class.add_method(method).expect("intrinsic method table overflow");
    class.add_method_impl(MethodImpl::Native { method_id, func });
}

/// The default constructor every concrete intrinsic carries.
pub(crate) fn add_def_ctor(class: &mut ClassInfo) {
    let ctor = MethodInfo::new_void("ctor", Visibility::Public, MethodExt::Final).set_ctor(true);
    add_native(class, ctor, NativeMethod::DefCtor);
}

/// A one-argument constructor taking an initial value of the class itself.
pub(crate) fn add_val_ctor(class: &mut ClassInfo, class_id: ClassId) {
    let ctor = MethodInfo::new_void("ctor1", Visibility::Public, MethodExt::Final)
        .set_ctor(true)
        .with_parm("InitVal", class_id, ParmDir::In);
    add_native(class, ctor, NativeMethod::ValCtor);
}

/// Shared literal helper for [`misc::base_info_literals`].
pub(crate) fn literal(name: &str, class: Intrinsic, data: ValueData) -> LiteralValue {
    LiteralValue {
        name: name.to_owned(),
        class_id: class.id(),
        data,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn registration_lands_on_fixed_ids() {
        let mut reg = ClassRegistry::new();
        register_all(&mut reg).unwrap();
        assert_eq!(reg.class_by_path("MEng.Object").unwrap().id(), Intrinsic::Object.id());
        assert_eq!(reg.class_by_path("MEng.String").unwrap().id(), Intrinsic::String.id());
        assert_eq!(reg.class_by_path("MEng.Int4").unwrap().id(), Intrinsic::Int4.id());
        assert_eq!(
            reg.class_by_path("MEng.StringOutStream").unwrap().id(),
            Intrinsic::StringOutStream.id()
        );
        // the runtime-error enum follows the fixed block
        assert_eq!(
            reg.class_by_path(RUNTIME_ERRORS_PATH).unwrap().id(),
            Intrinsic::COUNT
        );
    }

    #[test]
    fn numeric_classes_share_method_layout() {
        let mut reg = ClassRegistry::new();
        register_all(&mut reg).unwrap();
        let card4 = reg.class_by_path("MEng.Card4").unwrap();
        let int2 = reg.class_by_path("MEng.Int2").unwrap();
        assert_eq!(
            card4.find_method("Add").map(MethodInfo::id),
            int2.find_method("Add").map(MethodInfo::id)
        );
        assert!(card4.find_method("And").is_some());
        assert!(int2.find_method("And").is_none());
        assert!(int2.find_method("Negate").is_some());
        assert!(card4.find_method("Negate").is_none());
    }

    #[test]
    fn every_enum_class_inherits_the_base_protocol() {
        let mut reg = ClassRegistry::new();
        register_all(&mut reg).unwrap();
        let errors = reg.class_by_path(RUNTIME_ERRORS_PATH).unwrap();
        assert!(errors.find_method("GetOrdinal").is_some());
        assert!(errors.find_method("GetText").is_some());
        assert_eq!(errors.enum_items().len(), RuntimeErr::ITEMS.len());
    }
}
