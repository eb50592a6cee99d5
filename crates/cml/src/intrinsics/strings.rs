//! The text-ish intrinsic classes: String, StringList, Char.

use crate::{
    class::ClassInfo,
    engine::Engine,
    error::NativeError,
    intrinsics::{NativeCall, NativeMethod, add_def_ctor, add_native, add_val_ctor},
    method::MethodInfo,
    types::{Intrinsic, MethodExt, ParmDir, Visibility},
    value::ValueData,
};

pub(super) fn string_methods(class: &mut ClassInfo) {
    add_def_ctor(class);
    add_val_ctor(class, Intrinsic::String.id());

    let equal = MethodInfo::new("Equal", Intrinsic::Boolean.id(), Visibility::Public, MethodExt::Final)
        .set_const(true)
        .with_parm("Val", Intrinsic::String.id(), ParmDir::In);
    add_native(class, equal, NativeMethod::ScalarEqual);

    let clear = MethodInfo::new_void("Clear", Visibility::Public, MethodExt::Final);
    add_native(class, clear, NativeMethod::StrClear);

    let append = MethodInfo::new_void("Append", Visibility::Public, MethodExt::Final).with_parm(
        "ToAppend",
        Intrinsic::String.id(),
        ParmDir::In,
    );
    add_native(class, append, NativeMethod::StrAppend);

    let get_length = MethodInfo::new("GetLength", Intrinsic::Card4.id(), Visibility::Public, MethodExt::Final)
        .set_const(true);
    add_native(class, get_length, NativeMethod::StrGetLength);

    let is_empty =
        MethodInfo::new("IsEmpty", Intrinsic::Boolean.id(), Visibility::Public, MethodExt::Final).set_const(true);
    add_native(class, is_empty, NativeMethod::StrIsEmpty);

    let get_at = MethodInfo::new("GetAt", Intrinsic::Char.id(), Visibility::Public, MethodExt::Final)
        .set_const(true)
        .with_parm("Index", Intrinsic::Card4.id(), ParmDir::In);
    add_native(class, get_at, NativeMethod::StrGetAt);
}

pub(super) fn string_list_methods(class: &mut ClassInfo) {
    add_def_ctor(class);

    let count = MethodInfo::new("ElemCount", Intrinsic::Card4.id(), Visibility::Public, MethodExt::Final)
        .set_const(true);
    add_native(class, count, NativeMethod::StrListElemCount);

    let append = MethodInfo::new_void("Append", Visibility::Public, MethodExt::Final).with_parm(
        "ToAppend",
        Intrinsic::String.id(),
        ParmDir::In,
    );
    add_native(class, append, NativeMethod::StrListAppend);

    let get_at = MethodInfo::new("GetAt", Intrinsic::String.id(), Visibility::Public, MethodExt::Final)
        .set_const(true)
        .with_parm("Index", Intrinsic::Card4.id(), ParmDir::In);
    add_native(class, get_at, NativeMethod::StrListGetAt);

    let remove_all = MethodInfo::new_void("RemoveAll", Visibility::Public, MethodExt::Final);
    add_native(class, remove_all, NativeMethod::StrListClear);
}

pub(super) fn char_methods(class: &mut ClassInfo) {
    add_def_ctor(class);
    add_val_ctor(class, Intrinsic::Char.id());

    let equal = MethodInfo::new("Equal", Intrinsic::Boolean.id(), Visibility::Public, MethodExt::Final)
        .set_const(true)
        .with_parm("Val", Intrinsic::Char.id(), ParmDir::In);
    add_native(class, equal, NativeMethod::ScalarEqual);

    let get_ord =
        MethodInfo::new("GetOrd", Intrinsic::Card4.id(), Visibility::Public, MethodExt::Final).set_const(true);
    add_native(class, get_ord, NativeMethod::CharGetOrd);
}

fn this_string(engine: &Engine, call: NativeCall) -> Result<&String, NativeError> {
    match &engine.heap.get(call.this).data {
        ValueData::String(s) => Ok(s),
        _ => Err(NativeError::BadStackItem("string value")),
    }
}

pub(super) fn string_op(engine: &mut Engine, func: NativeMethod, call: NativeCall) -> Result<(), NativeError> {
    match func {
        NativeMethod::StrClear => {
            match &mut engine.heap.get_mut(call.this).data {
                ValueData::String(s) => s.clear(),
                _ => return Err(NativeError::BadStackItem("string value")),
            }
            Ok(())
        }
        NativeMethod::StrAppend => {
            let parm = engine.native_parm(call.frame, 1)?;
            let suffix = match &engine.heap.get(parm).data {
                ValueData::String(s) => s.clone(),
                _ => return Err(NativeError::BadStackItem("string value")),
            };
            match &mut engine.heap.get_mut(call.this).data {
                ValueData::String(s) => s.push_str(&suffix),
                _ => return Err(NativeError::BadStackItem("string value")),
            }
            Ok(())
        }
        NativeMethod::StrGetLength => {
            let len = this_string(engine, call)?.chars().count() as u32;
            engine.native_set_ret(call.frame, ValueData::Card4(len))
        }
        NativeMethod::StrIsEmpty => {
            let empty = this_string(engine, call)?.is_empty();
            engine.native_set_ret(call.frame, ValueData::Boolean(empty))
        }
        NativeMethod::StrGetAt => {
            let parm = engine.native_parm(call.frame, 1)?;
            let index = engine
                .heap
                .get(parm)
                .data
                .as_i128()
                .ok_or(NativeError::BadStackItem("index value"))? as u32;
            let text = this_string(engine, call)?;
            let count = text.chars().count() as u32;
            let ch = text
                .chars()
                .nth(index as usize)
                .ok_or(NativeError::IndexError { index, count })?;
            engine.native_set_ret(call.frame, ValueData::Char(ch))
        }
        _ => Err(NativeError::BadStackItem("string method")),
    }
}

pub(super) fn string_list_op(engine: &mut Engine, func: NativeMethod, call: NativeCall) -> Result<(), NativeError> {
    let items = match &engine.heap.get(call.this).data {
        ValueData::StringList(items) => items.clone(),
        _ => return Err(NativeError::BadStackItem("string list value")),
    };
    match func {
        NativeMethod::StrListElemCount => engine.native_set_ret(call.frame, ValueData::Card4(items.len() as u32)),
        NativeMethod::StrListAppend => {
            let parm = engine.native_parm(call.frame, 1)?;
            let item = match &engine.heap.get(parm).data {
                ValueData::String(s) => s.clone(),
                _ => return Err(NativeError::BadStackItem("string value")),
            };
            match &mut engine.heap.get_mut(call.this).data {
                ValueData::StringList(list) => list.push(item),
                _ => return Err(NativeError::BadStackItem("string list value")),
            }
            Ok(())
        }
        NativeMethod::StrListGetAt => {
            let parm = engine.native_parm(call.frame, 1)?;
            let index = engine
                .heap
                .get(parm)
                .data
                .as_i128()
                .ok_or(NativeError::BadStackItem("index value"))? as u32;
            let item = items.get(index as usize).cloned().ok_or(NativeError::IndexError {
                index,
                count: items.len() as u32,
            })?;
            engine.native_set_ret(call.frame, ValueData::String(item))
        }
        NativeMethod::StrListClear => {
            match &mut engine.heap.get_mut(call.this).data {
                ValueData::StringList(list) => list.clear(),
                _ => return Err(NativeError::BadStackItem("string list value")),
            }
            Ok(())
        }
        _ => Err(NativeError::BadStackItem("string list method")),
    }
}

pub(super) fn char_get_ord(engine: &mut Engine, call: NativeCall) -> Result<(), NativeError> {
    let ord = match &engine.heap.get(call.this).data {
        ValueData::Char(c) => *c as u32,
        _ => return Err(NativeError::BadStackItem("char value")),
    };
    engine.native_set_ret(call.frame, ValueData::Card4(ord))
}
