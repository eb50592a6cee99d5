//! The numeric intrinsic classes: Card1/2/4/8, Int1/2/4, Float4/8.
//!
//! All nine classes share one method layout (so `Add` has the same method
//! id everywhere) with family extras appended: modulus, increment and
//! bitwise operators on the integral classes, negation on the signed and
//! floating classes. Integral arithmetic wraps at the declared width, the
//! same way the stored payloads themselves do; only division by zero is an
//! error. Range enforcement belongs to `TypeCast`, not to arithmetic.

use crate::{
    class::ClassInfo,
    engine::Engine,
    error::NativeError,
    intrinsics::{NativeCall, NativeMethod, add_def_ctor, add_native, add_val_ctor},
    method::MethodInfo,
    types::{self, Intrinsic, MethodExt, ParmDir, Visibility},
    value::ValueData,
};

/// Fills the method table of one numeric class.
pub(super) fn numeric_methods(class: &mut ClassInfo, which: Intrinsic) {
    let id = which.id();
    add_def_ctor(class);
    add_val_ctor(class, id);

    let ret_self = |name: &str| {
        MethodInfo::new(name, id, Visibility::Public, MethodExt::Final)
            .set_const(true)
            .with_parm("Val", id, ParmDir::In)
    };
    let ret_bool = |name: &str| {
        MethodInfo::new(name, Intrinsic::Boolean.id(), Visibility::Public, MethodExt::Final)
            .set_const(true)
            .with_parm("Val", id, ParmDir::In)
    };

    add_native(class, ret_self("Add"), NativeMethod::NumAdd);
    add_native(class, ret_self("Sub"), NativeMethod::NumSub);
    add_native(class, ret_self("Mul"), NativeMethod::NumMul);
    add_native(class, ret_self("Div"), NativeMethod::NumDiv);
    add_native(class, ret_bool("Equal"), NativeMethod::ScalarEqual);
    add_native(class, ret_bool("GtThan"), NativeMethod::NumGt);
    add_native(class, ret_bool("LsThan"), NativeMethod::NumLt);
    add_native(class, ret_bool("GtThanEq"), NativeMethod::NumGtEq);
    add_native(class, ret_bool("LsThanEq"), NativeMethod::NumLtEq);

    if types::is_cardinal(id) || types::is_integer(id) {
        add_native(class, ret_self("ModDiv"), NativeMethod::NumMod);
        let inc = MethodInfo::new("Inc", id, Visibility::Public, MethodExt::Final);
        add_native(class, inc, NativeMethod::NumInc);
        let dec = MethodInfo::new("Dec", id, Visibility::Public, MethodExt::Final);
        add_native(class, dec, NativeMethod::NumDec);
    }
    if types::is_cardinal(id) {
        add_native(class, ret_self("And"), NativeMethod::BitAnd);
        add_native(class, ret_self("Or"), NativeMethod::BitOr);
        add_native(class, ret_self("Xor"), NativeMethod::BitXor);
    }
    if types::is_integer(id) || types::is_float(id) {
        let negate = MethodInfo::new_void("Negate", Visibility::Public, MethodExt::Final);
        add_native(class, negate, NativeMethod::NumNegate);
    }
}

/// Wraps a wide integral result into the payload width of the class.
fn wrap_to(which: Intrinsic, v: i128) -> ValueData {
    match which {
        Intrinsic::Card1 => ValueData::Card1(v as u8),
        Intrinsic::Card2 => ValueData::Card2(v as u16),
        Intrinsic::Card4 => ValueData::Card4(v as u32),
        Intrinsic::Card8 => ValueData::Card8(v as u64),
        Intrinsic::Int1 => ValueData::Int1(v as i8),
        Intrinsic::Int2 => ValueData::Int2(v as i16),
        Intrinsic::Int4 => ValueData::Int4(v as i32),
        _ => unreachable!("wrap_to on a non-integral class"),
    }
}

fn float_data(which: Intrinsic, v: f64) -> ValueData {
    match which {
        Intrinsic::Float4 => ValueData::Float4(v as f32),
        Intrinsic::Float8 => ValueData::Float8(v),
        _ => unreachable!("float_data on a non-float class"),
    }
}

fn receiver_kind(engine: &Engine, call: NativeCall) -> Intrinsic {
    let class_id = engine.heap.get(call.this).class_id();
    Intrinsic::from_id(class_id).expect("numeric native on a non-intrinsic receiver")
}

pub(super) fn binary_op(engine: &mut Engine, func: NativeMethod, call: NativeCall) -> Result<(), NativeError> {
    let which = receiver_kind(engine, call);
    let rhs_id = engine.native_parm(call.frame, 1)?;
    let lhs = engine.heap.get(call.this).data.clone();
    let rhs = engine.heap.get(rhs_id).data.clone();

    let result = if types::is_float(which.id()) {
        let (a, b) = (
            lhs.as_f64().ok_or(NativeError::BadStackItem("numeric value"))?,
            rhs.as_f64().ok_or(NativeError::BadStackItem("numeric value"))?,
        );
        let v = match func {
            NativeMethod::NumAdd => a + b,
            NativeMethod::NumSub => a - b,
            NativeMethod::NumMul => a * b,
            NativeMethod::NumDiv => a / b,
            _ => return Err(NativeError::BadStackItem("float operator")),
        };
        float_data(which, v)
    } else {
        let (a, b) = (
            lhs.as_i128().ok_or(NativeError::BadStackItem("numeric value"))?,
            rhs.as_i128().ok_or(NativeError::BadStackItem("numeric value"))?,
        );
        let v = match func {
            NativeMethod::NumAdd => a.wrapping_add(b),
            NativeMethod::NumSub => a.wrapping_sub(b),
            NativeMethod::NumMul => a.wrapping_mul(b),
            NativeMethod::NumDiv => {
                if b == 0 {
                    return Err(NativeError::DivideByZero);
                }
                a / b
            }
            NativeMethod::NumMod => {
                if b == 0 {
                    return Err(NativeError::DivideByZero);
                }
                a % b
            }
            NativeMethod::BitAnd => a & b,
            NativeMethod::BitOr => a | b,
            NativeMethod::BitXor => a ^ b,
            _ => return Err(NativeError::BadStackItem("integral operator")),
        };
        wrap_to(which, v)
    };
    engine.native_set_ret(call.frame, result)
}

pub(super) fn compare_op(engine: &mut Engine, func: NativeMethod, call: NativeCall) -> Result<(), NativeError> {
    let rhs_id = engine.native_parm(call.frame, 1)?;
    let a = engine
        .heap
        .get(call.this)
        .data
        .as_f64()
        .ok_or(NativeError::BadStackItem("numeric value"))?;
    let b = engine
        .heap
        .get(rhs_id)
        .data
        .as_f64()
        .ok_or(NativeError::BadStackItem("numeric value"))?;
    let result = match func {
        NativeMethod::NumGt => a > b,
        NativeMethod::NumLt => a < b,
        NativeMethod::NumGtEq => a >= b,
        NativeMethod::NumLtEq => a <= b,
        _ => return Err(NativeError::BadStackItem("comparison operator")),
    };
    engine.native_set_ret(call.frame, ValueData::Boolean(result))
}

pub(super) fn step_op(engine: &mut Engine, func: NativeMethod, call: NativeCall) -> Result<(), NativeError> {
    let which = receiver_kind(engine, call);
    let cur = engine
        .heap
        .get(call.this)
        .data
        .as_i128()
        .ok_or(NativeError::BadStackItem("integral value"))?;
    let next = match func {
        NativeMethod::NumInc => cur.wrapping_add(1),
        NativeMethod::NumDec => cur.wrapping_sub(1),
        _ => return Err(NativeError::BadStackItem("step operator")),
    };
    let data = wrap_to(which, next);
    engine.heap.get_mut(call.this).data = data.clone();
    engine.native_set_ret(call.frame, data)
}

pub(super) fn negate(engine: &mut Engine, call: NativeCall) -> Result<(), NativeError> {
    let which = receiver_kind(engine, call);
    let data = match &engine.heap.get(call.this).data {
        ValueData::Float4(v) => ValueData::Float4(-v),
        ValueData::Float8(v) => ValueData::Float8(-v),
        other => {
            let v = other.as_i128().ok_or(NativeError::BadStackItem("signed value"))?;
            wrap_to(which, v.wrapping_neg())
        }
    };
    engine.heap.get_mut(call.this).data = data;
    Ok(())
}
