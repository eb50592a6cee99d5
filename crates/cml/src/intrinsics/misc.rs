//! The remaining intrinsic classes: Boolean, the Enum base, BaseInfo,
//! Exception, the output streams, Time, and MemBuf.

use std::{thread, time::Duration};

use chrono::Utc;

use crate::{
    class::ClassInfo,
    engine::Engine,
    error::NativeError,
    heap::ValueId,
    intrinsics::{NativeCall, NativeMethod, add_def_ctor, add_native, add_val_ctor, literal},
    method::MethodInfo,
    types::{Intrinsic, MethodExt, ParmDir, Visibility},
    value::ValueData,
};

/// Granularity of the cancellation poll inside `Time.Sleep`.
const SLEEP_SLICE_MS: u64 = 50;

pub(super) fn boolean_methods(class: &mut ClassInfo) {
    add_def_ctor(class);
    add_val_ctor(class, Intrinsic::Boolean.id());

    let equal = MethodInfo::new("Equal", Intrinsic::Boolean.id(), Visibility::Public, MethodExt::Final)
        .set_const(true)
        .with_parm("Val", Intrinsic::Boolean.id(), ParmDir::In);
    add_native(class, equal, NativeMethod::ScalarEqual);
}

/// Protocol shared by every enumerated class, defined once on the abstract
/// base so user enums inherit the descriptors and implementations.
pub(super) fn enum_methods(class: &mut ClassInfo) {
    let get_ordinal = MethodInfo::new("GetOrdinal", Intrinsic::Card4.id(), Visibility::Public, MethodExt::Final)
        .set_const(true);
    add_native(class, get_ordinal, NativeMethod::EnumGetOrdinal);

    let set_ordinal = MethodInfo::new_void("SetOrdinal", Visibility::Public, MethodExt::Final).with_parm(
        "ToSet",
        Intrinsic::Card4.id(),
        ParmDir::In,
    );
    add_native(class, set_ordinal, NativeMethod::EnumSetOrdinal);

    let get_name =
        MethodInfo::new("GetName", Intrinsic::String.id(), Visibility::Public, MethodExt::Final).set_const(true);
    add_native(class, get_name, NativeMethod::EnumGetName);

    let get_text =
        MethodInfo::new("GetText", Intrinsic::String.id(), Visibility::Public, MethodExt::Final).set_const(true);
    add_native(class, get_text, NativeMethod::EnumGetText);

    let from_name = MethodInfo::new_void("FromName", Visibility::Public, MethodExt::Final).with_parm(
        "ToFind",
        Intrinsic::String.id(),
        ParmDir::In,
    );
    add_native(class, from_name, NativeMethod::EnumFromName);

    let equal = MethodInfo::new("Equal", Intrinsic::Boolean.id(), Visibility::Public, MethodExt::Final)
        .set_const(true)
        .with_parm("Val", Intrinsic::Enum.id(), ParmDir::In);
    add_native(class, equal, NativeMethod::ScalarEqual);
}

/// BaseInfo carries no methods, just the width-limit literals macros use
/// for range checks.
pub(super) fn base_info_literals(class: &mut ClassInfo) {
    class.add_literal(literal("MaxCard1", Intrinsic::Card1, ValueData::Card1(u8::MAX)));
    class.add_literal(literal("MaxCard2", Intrinsic::Card2, ValueData::Card2(u16::MAX)));
    class.add_literal(literal("MaxCard4", Intrinsic::Card4, ValueData::Card4(u32::MAX)));
    class.add_literal(literal("MaxCard8", Intrinsic::Card8, ValueData::Card8(u64::MAX)));
    class.add_literal(literal("MaxInt1", Intrinsic::Int1, ValueData::Int1(i8::MAX)));
    class.add_literal(literal("MinInt1", Intrinsic::Int1, ValueData::Int1(i8::MIN)));
    class.add_literal(literal("MaxInt2", Intrinsic::Int2, ValueData::Int2(i16::MAX)));
    class.add_literal(literal("MinInt2", Intrinsic::Int2, ValueData::Int2(i16::MIN)));
    class.add_literal(literal("MaxInt4", Intrinsic::Int4, ValueData::Int4(i32::MAX)));
    class.add_literal(literal("MinInt4", Intrinsic::Int4, ValueData::Int4(i32::MIN)));
}

pub(super) fn except_methods(class: &mut ClassInfo) {
    add_def_ctor(class);

    let check = MethodInfo::new("Check", Intrinsic::Boolean.id(), Visibility::Public, MethodExt::Final)
        .set_const(true)
        .with_parm("ErrEnum", Intrinsic::Enum.id(), ParmDir::In)
        .with_parm("Ordinal", Intrinsic::Card4.id(), ParmDir::In);
    add_native(class, check, NativeMethod::ExcCheck);

    let text = MethodInfo::new("GetErrorText", Intrinsic::String.id(), Visibility::Public, MethodExt::Final)
        .set_const(true);
    add_native(class, text, NativeMethod::ExcGetErrorText);

    let name = MethodInfo::new("GetErrorName", Intrinsic::String.id(), Visibility::Public, MethodExt::Final)
        .set_const(true);
    add_native(class, name, NativeMethod::ExcGetErrorName);

    let line =
        MethodInfo::new("GetLine", Intrinsic::Card4.id(), Visibility::Public, MethodExt::Final).set_const(true);
    add_native(class, line, NativeMethod::ExcGetLine);

    let class_path =
        MethodInfo::new("GetClass", Intrinsic::String.id(), Visibility::Public, MethodExt::Final).set_const(true);
    add_native(class, class_path, NativeMethod::ExcGetClass);
}

pub(super) fn stream_methods(class: &mut ClassInfo) {
    let print = MethodInfo::new_void("Print", Visibility::Public, MethodExt::Final).with_parm(
        "ToPrint",
        Intrinsic::Formattable.id(),
        ParmDir::In,
    );
    add_native(class, print, NativeMethod::StrmPrint);

    let print_line = MethodInfo::new_void("PrintLine", Visibility::Public, MethodExt::Final).with_parm(
        "ToPrint",
        Intrinsic::Formattable.id(),
        ParmDir::In,
    );
    add_native(class, print_line, NativeMethod::StrmPrintLine);

    let new_line = MethodInfo::new_void("NewLine", Visibility::Public, MethodExt::Final);
    add_native(class, new_line, NativeMethod::StrmNewLine);
}

pub(super) fn string_stream_methods(class: &mut ClassInfo) {
    add_def_ctor(class);

    let get_text =
        MethodInfo::new("GetText", Intrinsic::String.id(), Visibility::Public, MethodExt::Final).set_const(true);
    add_native(class, get_text, NativeMethod::StrmGetText);

    let reset = MethodInfo::new_void("Reset", Visibility::Public, MethodExt::Final);
    add_native(class, reset, NativeMethod::StrmReset);
}

pub(super) fn time_methods(class: &mut ClassInfo) {
    add_def_ctor(class);

    let millis = MethodInfo::new("GetCurMillis", Intrinsic::Card8.id(), Visibility::Public, MethodExt::Final)
        .set_const(true);
    add_native(class, millis, NativeMethod::TimeGetCurMillis);

    let set_now = MethodInfo::new_void("SetToNow", Visibility::Public, MethodExt::Final);
    add_native(class, set_now, NativeMethod::TimeSetToNow);

    let sleep = MethodInfo::new_void("Sleep", Visibility::Public, MethodExt::Final).with_parm(
        "Millis",
        Intrinsic::Card4.id(),
        ParmDir::In,
    );
    add_native(class, sleep, NativeMethod::TimeSleep);
}

pub(super) fn membuf_methods(class: &mut ClassInfo) {
    add_def_ctor(class);

    let get_at = MethodInfo::new("GetAt", Intrinsic::Card1.id(), Visibility::Public, MethodExt::Final)
        .set_const(true)
        .with_parm("Index", Intrinsic::Card4.id(), ParmDir::In);
    add_native(class, get_at, NativeMethod::BufGetAt);

    let put_at = MethodInfo::new_void("PutAt", Visibility::Public, MethodExt::Final)
        .with_parm("Index", Intrinsic::Card4.id(), ParmDir::In)
        .with_parm("ToPut", Intrinsic::Card1.id(), ParmDir::In);
    add_native(class, put_at, NativeMethod::BufPutAt);

    let size =
        MethodInfo::new("GetSize", Intrinsic::Card4.id(), Visibility::Public, MethodExt::Final).set_const(true);
    add_native(class, size, NativeMethod::BufGetSize);
}

// ----- implementations ------------------------------------------------------

pub(super) fn val_ctor(engine: &mut Engine, call: NativeCall) -> Result<(), NativeError> {
    let parm = engine.native_parm(call.frame, 1)?;
    let data = engine.heap.get(parm).data.clone();
    engine.heap.get_mut(call.this).data = data;
    Ok(())
}

pub(super) fn scalar_equal(engine: &mut Engine, call: NativeCall) -> Result<(), NativeError> {
    let parm = engine.native_parm(call.frame, 1)?;
    let lhs = engine.heap.get(call.this);
    let rhs = engine.heap.get(parm);
    let equal = lhs.class_id() == rhs.class_id() && lhs.data == rhs.data;
    engine.native_set_ret(call.frame, ValueData::Boolean(equal))
}

pub(super) fn enum_op(engine: &mut Engine, func: NativeMethod, call: NativeCall) -> Result<(), NativeError> {
    let class_id = engine.heap.get(call.this).class_id();
    let ordinal = engine
        .heap
        .get(call.this)
        .data
        .as_ordinal()
        .ok_or(NativeError::BadStackItem("enum value"))?;
    match func {
        NativeMethod::EnumGetOrdinal => engine.native_set_ret(call.frame, ValueData::Card4(ordinal)),
        NativeMethod::EnumSetOrdinal => {
            let parm = engine.native_parm(call.frame, 1)?;
            let to_set = engine
                .heap
                .get(parm)
                .data
                .as_i128()
                .ok_or(NativeError::BadStackItem("ordinal value"))? as u32;
            let class = engine.registry.class_by_id(class_id)?;
            if u64::from(to_set) > u64::from(class.max_ordinal()) || class.enum_items().is_empty() {
                return Err(NativeError::BadOrdinal(class_id, to_set));
            }
            engine.heap.get_mut(call.this).data = ValueData::Enum(to_set);
            Ok(())
        }
        NativeMethod::EnumGetName | NativeMethod::EnumGetText => {
            let class = engine.registry.class_by_id(class_id)?;
            let item = class
                .enum_item(ordinal)
                .ok_or(NativeError::BadOrdinal(class_id, ordinal))?;
            let text = if func == NativeMethod::EnumGetName {
                item.name.clone()
            } else {
                item.text.clone()
            };
            engine.native_set_ret(call.frame, ValueData::String(text))
        }
        NativeMethod::EnumFromName => {
            let parm = engine.native_parm(call.frame, 1)?;
            let name = match &engine.heap.get(parm).data {
                ValueData::String(s) => s.clone(),
                _ => return Err(NativeError::BadStackItem("string value")),
            };
            let class = engine.registry.class_by_id(class_id)?;
            let ordinal = class
                .ordinal_from_name(&name)
                .ok_or_else(|| NativeError::BadEnumName(class_id, name))?;
            engine.heap.get_mut(call.this).data = ValueData::Enum(ordinal);
            Ok(())
        }
        _ => Err(NativeError::BadStackItem("enum method")),
    }
}

pub(super) fn except_op(engine: &mut Engine, func: NativeMethod, call: NativeCall) -> Result<(), NativeError> {
    let info = match &engine.heap.get(call.this).data {
        ValueData::Except(info) => info.clone(),
        _ => return Err(NativeError::BadStackItem("exception value")),
    };
    match func {
        NativeMethod::ExcCheck => {
            let enum_parm = engine.native_parm(call.frame, 1)?;
            let ord_parm = engine.native_parm(call.frame, 2)?;
            let err_class = engine.heap.get(enum_parm).class_id();
            let ordinal = engine
                .heap
                .get(ord_parm)
                .data
                .as_i128()
                .ok_or(NativeError::BadStackItem("ordinal value"))? as u32;
            let matches = info.err_class == err_class && info.ordinal == ordinal;
            engine.native_set_ret(call.frame, ValueData::Boolean(matches))
        }
        NativeMethod::ExcGetErrorText => engine.native_set_ret(call.frame, ValueData::String(info.text)),
        NativeMethod::ExcGetErrorName => engine.native_set_ret(call.frame, ValueData::String(info.name)),
        NativeMethod::ExcGetLine => engine.native_set_ret(call.frame, ValueData::Card4(info.line)),
        NativeMethod::ExcGetClass => engine.native_set_ret(call.frame, ValueData::String(info.class_path)),
        _ => Err(NativeError::BadStackItem("exception method")),
    }
}

/// Formats a value the way the output stream classes print it.
fn format_for_print(engine: &Engine, id: ValueId) -> String {
    let value = engine.heap.get(id);
    if let Some(text) = value.data.format_plain() {
        return text;
    }
    let mut out = String::new();
    engine
        .heap
        .dbg_format(&engine.registry, id, crate::types::DbgFmt::Short, 10, &mut out);
    out
}

pub(super) fn stream_op(engine: &mut Engine, func: NativeMethod, call: NativeCall) -> Result<(), NativeError> {
    match func {
        NativeMethod::StrmPrint | NativeMethod::StrmPrintLine => {
            let parm = engine.native_parm(call.frame, 1)?;
            let mut text = format_for_print(engine, parm);
            if func == NativeMethod::StrmPrintLine {
                text.push('\n');
            }
            match &mut engine.heap.get_mut(call.this).data {
                ValueData::OutStream(buf) => buf.push_str(&text),
                _ => return Err(NativeError::BadStackItem("stream value")),
            }
            Ok(())
        }
        NativeMethod::StrmNewLine => {
            match &mut engine.heap.get_mut(call.this).data {
                ValueData::OutStream(buf) => buf.push('\n'),
                _ => return Err(NativeError::BadStackItem("stream value")),
            }
            Ok(())
        }
        NativeMethod::StrmGetText => {
            let text = match &engine.heap.get(call.this).data {
                ValueData::OutStream(buf) => buf.clone(),
                _ => return Err(NativeError::BadStackItem("stream value")),
            };
            engine.native_set_ret(call.frame, ValueData::String(text))
        }
        NativeMethod::StrmReset => {
            match &mut engine.heap.get_mut(call.this).data {
                ValueData::OutStream(buf) => buf.clear(),
                _ => return Err(NativeError::BadStackItem("stream value")),
            }
            Ok(())
        }
        _ => Err(NativeError::BadStackItem("stream method")),
    }
}

fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

pub(super) fn time_op(engine: &mut Engine, func: NativeMethod, call: NativeCall) -> Result<(), NativeError> {
    match func {
        NativeMethod::TimeGetCurMillis => engine.native_set_ret(call.frame, ValueData::Card8(now_millis())),
        NativeMethod::TimeSetToNow => {
            engine.heap.get_mut(call.this).data = ValueData::Time(now_millis());
            Ok(())
        }
        NativeMethod::TimeSleep => {
            let parm = engine.native_parm(call.frame, 1)?;
            let mut remaining = engine
                .heap
                .get(parm)
                .data
                .as_i128()
                .ok_or(NativeError::BadStackItem("millis value"))? as u64;
            // sleep in slices so the host's cancellation predicate can
            // interrupt a long wait
            while remaining > 0 {
                if engine.sleep_cancelled() {
                    return Err(NativeError::Cancelled);
                }
                let slice = remaining.min(SLEEP_SLICE_MS);
                thread::sleep(Duration::from_millis(slice));
                remaining -= slice;
            }
            if engine.sleep_cancelled() {
                return Err(NativeError::Cancelled);
            }
            Ok(())
        }
        _ => Err(NativeError::BadStackItem("time method")),
    }
}

pub(super) fn collection_op(engine: &mut Engine, func: NativeMethod, call: NativeCall) -> Result<(), NativeError> {
    match func {
        NativeMethod::ColElemCount => {
            let count = match &engine.heap.get(call.this).data {
                ValueData::Collection(elems) => elems.len() as u32,
                _ => return Err(NativeError::BadStackItem("collection value")),
            };
            engine.native_set_ret(call.frame, ValueData::Card4(count))
        }
        NativeMethod::ColAdd => {
            let class_id = engine.heap.get(call.this).class_id();
            let elem_class = engine
                .registry
                .class_by_id(class_id)?
                .elem_class()
                .ok_or(NativeError::BadStackItem("collection value"))?;
            let parm = engine.native_parm(call.frame, 1)?;
            let new_elem = engine.heap.make_storage(&engine.registry, elem_class, false)?;
            if let Err(err) = engine.heap.copy_value(&engine.registry, new_elem, parm) {
                engine.heap.free(new_elem);
                return Err(err);
            }
            match &mut engine.heap.get_mut(call.this).data {
                ValueData::Collection(elems) => elems.push(new_elem),
                _ => return Err(NativeError::BadStackItem("collection value")),
            }
            Ok(())
        }
        NativeMethod::ColRemoveAll => {
            let elems = match &mut engine.heap.get_mut(call.this).data {
                ValueData::Collection(elems) => std::mem::take(elems),
                _ => return Err(NativeError::BadStackItem("collection value")),
            };
            for elem in elems {
                engine.heap.free(elem);
            }
            Ok(())
        }
        _ => Err(NativeError::BadStackItem("collection method")),
    }
}

pub(super) fn membuf_op(engine: &mut Engine, func: NativeMethod, call: NativeCall) -> Result<(), NativeError> {
    match func {
        NativeMethod::BufGetAt => {
            let parm = engine.native_parm(call.frame, 1)?;
            let index = engine
                .heap
                .get(parm)
                .data
                .as_i128()
                .ok_or(NativeError::BadStackItem("index value"))? as u32;
            let byte = match &engine.heap.get(call.this).data {
                ValueData::MemBuf(bytes) => bytes.get(index as usize).copied().ok_or(NativeError::IndexError {
                    index,
                    count: bytes.len() as u32,
                })?,
                _ => return Err(NativeError::BadStackItem("buffer value")),
            };
            engine.native_set_ret(call.frame, ValueData::Card1(byte))
        }
        NativeMethod::BufPutAt => {
            let index_parm = engine.native_parm(call.frame, 1)?;
            let byte_parm = engine.native_parm(call.frame, 2)?;
            let index = engine
                .heap
                .get(index_parm)
                .data
                .as_i128()
                .ok_or(NativeError::BadStackItem("index value"))? as usize;
            let byte = engine
                .heap
                .get(byte_parm)
                .data
                .as_i128()
                .ok_or(NativeError::BadStackItem("byte value"))? as u8;
            match &mut engine.heap.get_mut(call.this).data {
                ValueData::MemBuf(bytes) => {
                    // the buffer grows to cover the written index
                    if index >= bytes.len() {
                        bytes.resize(index + 1, 0);
                    }
                    bytes[index] = byte;
                }
                _ => return Err(NativeError::BadStackItem("buffer value")),
            }
            Ok(())
        }
        NativeMethod::BufGetSize => {
            let size = match &engine.heap.get(call.this).data {
                ValueData::MemBuf(bytes) => bytes.len() as u32,
                _ => return Err(NativeError::BadStackItem("buffer value")),
            };
            engine.native_set_ret(call.frame, ValueData::Card4(size))
        }
        _ => Err(NativeError::BadStackItem("buffer method")),
    }
}
