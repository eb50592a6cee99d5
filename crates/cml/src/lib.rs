#![doc = include_str!("../../../README.md")]
#![expect(clippy::cast_possible_truncation, reason = "numeric narrowing is checked or wrapping by design")]
#![expect(clippy::cast_sign_loss, reason = "sign-changing casts are intentional")]
#![expect(clippy::must_use_candidate, reason = "accessors are pervasive; annotating every one adds noise")]

mod callstack;
mod class;
mod debugger;
mod engine;
mod error;
mod handlers;
mod heap;
mod intrinsics;
mod manager;
mod method;
mod opcode;
mod parser;
mod registry;
mod resolver;
mod types;
mod value;
mod vm;

pub use crate::{
    callstack::{CallFrame, StackItem, ValueItemKind},
    class::{ClassInfo, ClassKind, EnumItem, LiteralValue, MemberInfo},
    debugger::{DbgLine, Debugger, FinishReason, NoopDebugger},
    engine::Engine,
    error::{ExceptInfo, NativeError, RuntimeErr, Unwind, exit_code},
    handlers::{
        CollectParseErrors, CollectRuntimeErrors, ParseErrorHandler, ParseEvent, ParseEventKind, RuntimeErrorHandler,
        StreamParseErrorHandler, StreamRuntimeErrorHandler,
    },
    heap::ValueId,
    intrinsics::{NativeMethod, RUNTIME_ERRORS_PATH},
    manager::{CLASS_FILE_EXT, ClassLoader, ClassManager, FixedBaseClassManager, LoaderEnd, MemClassManager, ResMode},
    method::{CaseValue, JumpTable, LocalInfo, MethodBody, MethodImpl, MethodInfo, ParmInfo},
    opcode::OpCode,
    parser::CLASS_ROOT,
    registry::ClassRegistry,
    resolver::{FileResolver, FixedBaseFileResolver},
    types::{
        BAD_ID, CastRes, ClassExt, ClassId, ClassMatch, DbgAction, DbgFmt, Dispatch, ExceptReport, Intrinsic, LocalId,
        MemberId, MethodExt, MethodId, OptLevel, ParmDir, ParmId, Recover, Visibility, is_cardinal, is_float,
        is_integer, is_intrinsic, is_numeric,
    },
    value::{Value, ValueData},
};
