//! The bytecode dispatch loop.
//!
//! Execution is iterative: one loop runs nested macro calls by switching
//! the active [`Ctx`] (current body, instance, frame) at call and return
//! boundaries instead of recursing. The loop is entered from the host
//! through [`Engine::invoke`] and runs until the entry frame pops or an
//! unwind escapes it.
//!
//! Exceptions never use host unwinding: every step returns
//! `Result<_, Unwind>`, and the unwind module walks the call stack
//! explicitly, releasing each item on the way down.

mod unwind;

use std::rc::Rc;

use crate::{
    callstack::{StackItem, ValueItemKind},
    engine::Engine,
    error::{NativeError, StepResult, Unwind},
    heap::ValueId,
    intrinsics::{self, NativeCall},
    method::{MethodBody, MethodImpl},
    opcode::OpCode,
    types::{self, CastRes, ClassId, DbgAction, Dispatch, Intrinsic, LocalId, MemberId, MethodId, ParmId},
    value::ValueData,
};

/// The interpreter's view of the currently executing method.
#[derive(Debug, Clone)]
pub(crate) struct Ctx {
    /// Class that defines the executing body (parent calls start their
    /// dispatch above this class).
    pub class_id: ClassId,
    pub method_id: MethodId,
    pub body: Rc<MethodBody>,
    pub this: ValueId,
    /// Stack index of this invocation's call frame.
    pub frame: usize,
    pub parm_count: u16,
    pub ip: u32,
}

/// What a non-branching step asks the loop to do next.
enum Flow {
    Continue,
    /// A `Return` popped the frame; true when it was the entry frame.
    Returned(bool),
}

impl Engine {
    /// Runs a method on an instance until it returns or unwinds out.
    ///
    /// The caller must already have pushed the return slot, the call frame
    /// (via [`Engine::push_call_frame`]) and the argument values. On
    /// success the return slot is the stack top. On error the stack has
    /// been unwound to the state at the frame; the caller cleans up its
    /// own pushes.
    pub fn invoke(&mut self, this: ValueId, method_id: MethodId, dispatch: Dispatch) -> Result<(), Unwind> {
        let base_class = self.heap.get(this).class_id();
        let entry_frame = match self.begin_call(None, this, base_class, method_id, dispatch) {
            Ok(frame) => frame,
            Err(err) => return Err(self.raise_in_class(base_class, err)),
        };
        let Some(entry_frame) = entry_frame else {
            // native method: begin_call ran it to completion
            return Ok(());
        };
        let Some(StackItem::MethodCall(call)) = self.stack.item(entry_frame) else {
            return Err(Unwind::Native(NativeError::BadStackItem("method-call frame")));
        };
        let (impl_class, parm_count) = (call.called_class, call.parm_count);
        let body = match self
            .registry
            .class_by_id(impl_class)
            .map_err(Unwind::Native)?
            .impl_for(method_id)
        {
            Some(MethodImpl::Ops(body)) => Rc::clone(body),
            _ => return Err(Unwind::Native(NativeError::BadStackItem("bytecode method"))),
        };
        let ctx = Ctx {
            class_id: impl_class,
            method_id,
            body,
            this,
            frame: entry_frame,
            parm_count,
            ip: 0,
        };
        self.run_loop(ctx, entry_frame)
    }

    fn run_loop(&mut self, mut ctx: Ctx, entry_frame: usize) -> Result<(), Unwind> {
        loop {
            let Some(&op) = ctx.body.op(ctx.ip) else {
                // bodies end in Return; running off the end is a compile bug
                return Err(Unwind::Native(NativeError::BadStackItem("opcode")));
            };
            ctx.ip += 1;
            match self.step(&mut ctx, op) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Returned(at_entry)) => {
                    if at_entry {
                        return Ok(());
                    }
                }
                Err(Unwind::Except) => {
                    if !self.unwind_to_catch(&mut ctx, entry_frame) {
                        return Err(Unwind::Except);
                    }
                }
                Err(other) => {
                    self.release_to_entry(entry_frame);
                    return Err(other);
                }
            }
        }
    }

    /// Executes one opcode. Call opcodes switch the context in place.
    fn step(&mut self, ctx: &mut Ctx, op: OpCode) -> StepResult<Flow> {
        match op {
            OpCode::NoOp => {}

            OpCode::CurLine(line) => {
                self.cur_line = line;
                self.statement_boundary(ctx)?;
            }

            OpCode::PushCurLine => self.push_call_frame(),

            OpCode::PushImBoolean(v) => self.push_immediate(Intrinsic::Boolean, ValueData::Boolean(v), ctx)?,
            OpCode::PushImCard1(v) => self.push_immediate(Intrinsic::Card1, ValueData::Card1(v), ctx)?,
            OpCode::PushImCard2(v) => self.push_immediate(Intrinsic::Card2, ValueData::Card2(v), ctx)?,
            OpCode::PushImCard4(v) => self.push_immediate(Intrinsic::Card4, ValueData::Card4(v), ctx)?,
            OpCode::PushImCard8(v) => self.push_immediate(Intrinsic::Card8, ValueData::Card8(v), ctx)?,
            OpCode::PushImChar(v) => self.push_immediate(Intrinsic::Char, ValueData::Char(v), ctx)?,
            OpCode::PushImFloat4(v) => self.push_immediate(Intrinsic::Float4, ValueData::Float4(v), ctx)?,
            OpCode::PushImFloat8(v) => self.push_immediate(Intrinsic::Float8, ValueData::Float8(v), ctx)?,
            OpCode::PushImInt1(v) => self.push_immediate(Intrinsic::Int1, ValueData::Int1(v), ctx)?,
            OpCode::PushImInt2(v) => self.push_immediate(Intrinsic::Int2, ValueData::Int2(v), ctx)?,
            OpCode::PushImInt4(v) => self.push_immediate(Intrinsic::Int4, ValueData::Int4(v), ctx)?,

            OpCode::PushLocal(id) => {
                let index = self.local_index(ctx, id);
                let item = self.stack.repush_at(index);
                self.push_checked(item, ctx)?;
            }
            OpCode::PushParm(id) => {
                let index = self.parm_index(ctx, id);
                let item = self.stack.repush_at(index);
                self.push_checked(item, ctx)?;
            }
            OpCode::PushMember(id) => {
                let member = self.member_value(ctx, id).map_err(|e| self.raise(ctx, e))?;
                self.stack.push_value(member, ValueItemKind::Member, false);
            }
            OpCode::PushThis => self.stack.push_value(ctx.this, ValueItemKind::This, false),
            OpCode::PushStrPoolItem(ix) => {
                let text = ctx
                    .body
                    .pool_string(ix)
                    .ok_or_else(|| self.raise(ctx, NativeError::BadStackItem("string pool entry")))?
                    .to_owned();
                let id = self
                    .temps
                    .borrow(&mut self.heap, &self.registry, Intrinsic::String.id(), true)
                    .map_err(|e| self.raise(ctx, e))?;
                self.heap.get_mut(id).data = ValueData::String(text);
                self.stack.push_value(id, ValueItemKind::StrPool, false);
            }
            OpCode::PushTempConst(class_id) => {
                let id = self
                    .temps
                    .borrow(&mut self.heap, &self.registry, class_id, true)
                    .map_err(|e| self.raise(ctx, e))?;
                self.stack.push_value(id, ValueItemKind::Temp, false);
            }
            OpCode::PushTempVar(class_id) => {
                let id = self
                    .temps
                    .borrow(&mut self.heap, &self.registry, class_id, false)
                    .map_err(|e| self.raise(ctx, e))?;
                self.stack.push_value(id, ValueItemKind::Temp, false);
            }
            OpCode::PushEnum(class_id, ordinal) => {
                let id = self
                    .temps
                    .borrow(&mut self.heap, &self.registry, class_id, false)
                    .map_err(|e| self.raise(ctx, e))?;
                self.heap.get_mut(id).data = ValueData::Enum(u32::from(ordinal));
                self.stack.push_value(id, ValueItemKind::Temp, false);
            }
            OpCode::PushException => {
                let id = self.exception_value(ctx)?;
                self.stack.push_value(id, ValueItemKind::Except, false);
            }
            OpCode::Repush(depth) => {
                let item = self.stack.repush_of(depth as usize);
                self.push_checked(item, ctx)?;
            }

            OpCode::PopTop => {
                if self.pop_and_release().is_none() {
                    return Err(self.raise(ctx, NativeError::StackUnderflow));
                }
            }
            OpCode::PopToReturn => self.pop_to_return(ctx)?,
            OpCode::MultiPop(n) => {
                for _ in 0..n {
                    if self.pop_and_release().is_none() {
                        return Err(self.raise(ctx, NativeError::StackUnderflow));
                    }
                }
            }
            OpCode::FlipTop => self.stack.flip_top(),

            OpCode::Copy => {
                let src = self.top_value(ctx, 0)?;
                let dst = self.top_value(ctx, 1)?;
                self.heap
                    .copy_value(&self.registry, dst, src)
                    .map_err(|e| self.raise(ctx, e))?;
                self.pop_and_release();
                self.pop_and_release();
            }
            OpCode::Negate => {
                let id = self.top_value(ctx, 0)?;
                match &mut self.heap.get_mut(id).data {
                    ValueData::Boolean(b) => *b = !*b,
                    _ => return Err(self.raise(ctx, NativeError::BadStackItem("boolean value"))),
                }
            }
            OpCode::LogicalAnd | OpCode::LogicalOr | OpCode::LogicalXor => {
                let b = self.pop_bool(ctx)?;
                let a = self.pop_bool(ctx)?;
                let result = match op {
                    OpCode::LogicalAnd => a && b,
                    OpCode::LogicalOr => a || b,
                    _ => a != b,
                };
                self.push_immediate(Intrinsic::Boolean, ValueData::Boolean(result), ctx)?;
            }

            OpCode::Jump(target) => ctx.ip = target,
            OpCode::CondJump(target) => {
                if self.pop_bool(ctx)? {
                    ctx.ip = target;
                }
            }
            OpCode::NotCondJump(target) => {
                if !self.pop_bool(ctx)? {
                    ctx.ip = target;
                }
            }
            OpCode::CondJumpNP(target) => {
                if self.peek_bool(ctx)? {
                    ctx.ip = target;
                }
            }
            OpCode::NotCondJumpNP(target) => {
                if !self.peek_bool(ctx)? {
                    ctx.ip = target;
                }
            }
            OpCode::TableJump(table, _switch_class) => {
                let id = self.top_value(ctx, 0)?;
                let data = self.heap.get(id).data.clone();
                self.pop_and_release();
                let target = ctx
                    .body
                    .jump_table(table)
                    .and_then(|t| t.find_target(&data))
                    .ok_or_else(|| self.raise(ctx, NativeError::BadStackItem("jump table target")))?;
                ctx.ip = target;
            }

            OpCode::Return => return Ok(Flow::Returned(self.do_return(ctx)?)),

            OpCode::CallLocal(local, method) => {
                let recv = self.local_value(ctx, local)?;
                self.begin_macro_call(ctx, recv, None, method, Dispatch::Poly)?;
            }
            OpCode::CallMember(member, method) => {
                let recv = self.member_value(ctx, member).map_err(|e| self.raise(ctx, e))?;
                self.begin_macro_call(ctx, recv, None, method, Dispatch::Poly)?;
            }
            OpCode::CallParm(parm, method) => {
                let recv = self.parm_value(ctx, parm)?;
                self.begin_macro_call(ctx, recv, None, method, Dispatch::Poly)?;
            }
            OpCode::CallParent(method) => {
                let parent = match self.registry.class_by_id(ctx.class_id) {
                    Ok(class) => class.parent_id(),
                    Err(err) => return Err(self.raise(ctx, err)),
                };
                self.begin_macro_call(ctx, ctx.this, Some(parent), method, Dispatch::Mono)?;
            }
            OpCode::CallThis(method) => {
                self.begin_macro_call(ctx, ctx.this, None, method, Dispatch::Poly)?;
            }
            OpCode::CallStack(depth, method) => {
                let index = self
                    .stack
                    .top()
                    .checked_sub(usize::from(depth) + 1)
                    .ok_or_else(|| self.raise(ctx, NativeError::StackUnderflow))?;
                let recv = self
                    .stack_value_at(index)
                    .map_err(|e| self.raise(ctx, e))?;
                self.begin_macro_call(ctx, recv, None, method, Dispatch::Poly)?;
            }
            OpCode::CallExcept(method) => {
                let recv = self.exception_value(ctx)?;
                self.begin_macro_call(ctx, recv, None, method, Dispatch::Poly)?;
            }

            OpCode::ColIndex => self.col_index(ctx)?,
            OpCode::TypeCast(target) => self.type_cast(ctx, target)?,

            OpCode::Try(catch_ip) => self.stack.push(StackItem::TryMarker { catch_ip }),
            OpCode::EndTry => match self.stack.pop() {
                Some(StackItem::TryMarker { .. } | StackItem::ExceptMarker) => {}
                _ => return Err(self.raise(ctx, NativeError::BadStackItem("try marker"))),
            },
            OpCode::Throw(rethrow) => return Err(self.do_throw(ctx, rethrow, 0)),
            OpCode::ThrowFmt(fmt_count) => return Err(self.do_throw(ctx, false, fmt_count)),

            OpCode::ResetEnum => {
                let id = self.top_value(ctx, 0)?;
                match &mut self.heap.get_mut(id).data {
                    ValueData::Enum(ord) => *ord = 0,
                    _ => return Err(self.raise(ctx, NativeError::BadStackItem("enum value"))),
                }
                self.pop_and_release();
            }
            OpCode::CondEnumInc => {
                let id = self.top_value(ctx, 0)?;
                let class_id = self.heap.get(id).class_id();
                let max = match self.registry.class_by_id(class_id) {
                    Ok(class) => class.max_ordinal(),
                    Err(err) => return Err(self.raise(ctx, err)),
                };
                let advanced = match &mut self.heap.get_mut(id).data {
                    ValueData::Enum(ord) if *ord < max => {
                        *ord += 1;
                        true
                    }
                    ValueData::Enum(_) => false,
                    _ => return Err(self.raise(ctx, NativeError::BadStackItem("enum value"))),
                };
                self.pop_and_release();
                self.push_immediate(Intrinsic::Boolean, ValueData::Boolean(advanced), ctx)?;
            }
        }
        Ok(Flow::Continue)
    }

    // ----- step helpers ----------------------------------------------------

    /// Converts a native failure into the right unwind: macro-visible
    /// errors become catchable exceptions, cancellation becomes a debug
    /// exit, the rest surface as native errors.
    pub(crate) fn raise(&mut self, ctx: &Ctx, err: NativeError) -> Unwind {
        self.raise_in_class(ctx.class_id, err)
    }

    pub(crate) fn raise_in_class(&mut self, class_id: ClassId, err: NativeError) -> Unwind {
        if let Some(runtime_err) = err.runtime_err() {
            let class_path = self
                .registry
                .class_by_id(class_id)
                .map(|c| c.class_path().to_owned())
                .unwrap_or_default();
            self.fill_thrown(self.runtime_errors_class, runtime_err.ordinal().into(), &class_path, &[]);
            Unwind::Except
        } else if matches!(err, NativeError::Cancelled) {
            Unwind::DbgExit
        } else {
            Unwind::Native(err)
        }
    }

    /// The debugger hook and cancellation poll at a statement boundary.
    fn statement_boundary(&mut self, ctx: &Ctx) -> StepResult {
        if self.debugger.is_none() {
            return Ok(());
        }
        let class_path = self
            .registry
            .class_by_id(ctx.class_id)
            .map(|c| c.class_path().to_owned())
            .unwrap_or_default();
        let method_name = self
            .registry
            .class_by_id(ctx.class_id)
            .ok()
            .and_then(|c| c.method(ctx.method_id))
            .map(|m| m.name().to_owned())
            .unwrap_or_default();
        let debugger = self.debugger.as_mut().expect("checked above");
        let action = debugger.at_line(crate::debugger::DbgLine {
            class_path: &class_path,
            method_name: &method_name,
            line: self.cur_line,
            ip: ctx.ip,
        });
        if debugger.sleep_test() || action != DbgAction::Continue {
            return Err(Unwind::DbgExit);
        }
        Ok(())
    }

    fn push_immediate(&mut self, intrinsic: Intrinsic, data: ValueData, ctx: &Ctx) -> StepResult {
        let id = self
            .temps
            .borrow(&mut self.heap, &self.registry, intrinsic.id(), false)
            .map_err(|e| self.raise(ctx, e))?;
        self.heap.get_mut(id).data = data;
        self.stack.push_value(id, ValueItemKind::Temp, false);
        Ok(())
    }

    fn push_checked(&mut self, item: Option<StackItem>, ctx: &Ctx) -> StepResult {
        match item {
            Some(item) => {
                self.stack.push(item);
                Ok(())
            }
            None => Err(self.raise(ctx, NativeError::BadStackItem("repushable value"))),
        }
    }

    /// Absolute stack index of a local slot (1-based local id).
    fn local_index(&self, ctx: &Ctx, id: LocalId) -> usize {
        ctx.frame + usize::from(ctx.parm_count) + usize::from(id)
    }

    /// Absolute stack index of a parameter slot (1-based parm id).
    fn parm_index(&self, ctx: &Ctx, id: ParmId) -> usize {
        ctx.frame + usize::from(id)
    }

    fn local_value(&mut self, ctx: &Ctx, id: LocalId) -> StepResult<ValueId> {
        let index = self.local_index(ctx, id);
        self.stack_value_at(index).map_err(|e| self.raise(ctx, e))
    }

    fn parm_value(&mut self, ctx: &Ctx, id: ParmId) -> StepResult<ValueId> {
        let index = self.parm_index(ctx, id);
        self.stack_value_at(index).map_err(|e| self.raise(ctx, e))
    }

    fn member_value(&self, ctx: &Ctx, id: MemberId) -> Result<ValueId, NativeError> {
        match &self.heap.get(ctx.this).data {
            ValueData::User(members) => usize::from(id)
                .checked_sub(1)
                .and_then(|ix| members.get(ix))
                .copied()
                .ok_or(NativeError::BadStackItem("member slot")),
            _ => Err(NativeError::BadStackItem("user instance")),
        }
    }

    /// The value `depth` items below the stack top.
    fn top_value(&mut self, ctx: &Ctx, depth: usize) -> StepResult<ValueId> {
        let index = self
            .stack
            .top()
            .checked_sub(depth + 1)
            .ok_or_else(|| self.raise(ctx, NativeError::StackUnderflow))?;
        self.stack_value_at(index).map_err(|e| self.raise(ctx, e))
    }

    fn pop_bool(&mut self, ctx: &Ctx) -> StepResult<bool> {
        let id = self.top_value(ctx, 0)?;
        let value = self
            .heap
            .get(id)
            .data
            .as_bool()
            .ok_or_else(|| self.raise(ctx, NativeError::BadStackItem("boolean value")))?;
        self.pop_and_release();
        Ok(value)
    }

    fn peek_bool(&mut self, ctx: &Ctx) -> StepResult<bool> {
        let id = self.top_value(ctx, 0)?;
        self.heap
            .get(id)
            .data
            .as_bool()
            .ok_or_else(|| self.raise(ctx, NativeError::BadStackItem("boolean value")))
    }

    /// The engine's exception value, valid only while an exception marker
    /// sits in the current invocation (a catch block). Placeholder frames
    /// of calls still collecting arguments do not end the scan.
    fn exception_value(&mut self, ctx: &Ctx) -> StepResult<ValueId> {
        let mut index = self.stack.top();
        while index > ctx.frame {
            index -= 1;
            if matches!(self.stack.item(index), Some(StackItem::ExceptMarker)) {
                let value = self.except_value;
                return value.ok_or_else(|| self.raise(ctx, NativeError::BadStackItem("exception value")));
            }
        }
        Err(self.raise(ctx, NativeError::BadStackItem("catch block")))
    }

    /// Copies the stack top into the pending return slot and pops it.
    fn pop_to_return(&mut self, ctx: &Ctx) -> StepResult {
        let src = self.top_value(ctx, 0)?;
        let slot = ctx
            .frame
            .checked_sub(1)
            .ok_or_else(|| self.raise(ctx, NativeError::StackUnderflow))?;
        let dst = self.stack_value_at(slot).map_err(|e| self.raise(ctx, e))?;
        self.heap
            .copy_value(&self.registry, dst, src)
            .map_err(|e| self.raise(ctx, e))?;
        self.pop_and_release();
        Ok(())
    }

    /// Pops the indexed element of a collection as a live handle.
    fn col_index(&mut self, ctx: &Ctx) -> StepResult {
        let index_id = self.top_value(ctx, 0)?;
        let col_id = self.top_value(ctx, 1)?;
        let index = self
            .heap
            .get(index_id)
            .data
            .as_i128()
            .ok_or_else(|| self.raise(ctx, NativeError::BadStackItem("index value")))?;
        let elems = match &self.heap.get(col_id).data {
            ValueData::Collection(elems) => elems.clone(),
            _ => return Err(self.raise(ctx, NativeError::BadStackItem("collection value"))),
        };
        let count = elems.len() as u32;
        let element = u32::try_from(index)
            .ok()
            .and_then(|ix| elems.get(ix as usize).copied())
            .ok_or_else(|| {
                self.raise(
                    ctx,
                    NativeError::IndexError {
                        index: index.clamp(0, i128::from(u32::MAX)) as u32,
                        count,
                    },
                )
            })?;
        self.pop_and_release();
        self.pop_and_release();
        self.stack.push_value(element, ValueItemKind::ColElem, false);
        Ok(())
    }

    /// Replaces the stack top with a temp holding its conversion to the
    /// target class. A same-class cast still produces a private copy,
    /// which the compiler leans on to detach shared storage.
    fn type_cast(&mut self, ctx: &Ctx, target: ClassId) -> StepResult {
        let src_id = self.top_value(ctx, 0)?;
        let src_class = self.heap.get(src_id).class_id();
        let data = if src_class == target {
            Ok(self.heap.get(src_id).data.clone())
        } else {
            match cast_data(self, src_id, src_class, target) {
                (CastRes::Ok, Some(data)) => Ok(data),
                (CastRes::Range, _) => Err(NativeError::CastRange(src_class, target)),
                _ => Err(NativeError::CastType(src_class, target)),
            }
        };
        let data = data.map_err(|e| self.raise(ctx, e))?;
        self.pop_and_release();
        let id = self
            .temps
            .borrow(&mut self.heap, &self.registry, target, false)
            .map_err(|e| self.raise(ctx, e))?;
        self.heap.get_mut(id).data = data;
        self.stack.push_value(id, ValueItemKind::Temp, false);
        Ok(())
    }
}

/// Computes the converted payload for `TypeCast`, classifying the attempt
/// with the three-way cast contract: success, incompatible classes, or a
/// value out of range for the target.
fn cast_data(engine: &Engine, src_id: ValueId, src_class: ClassId, target: ClassId) -> (CastRes, Option<ValueData>) {
    let src = &engine.heap.get(src_id).data;
    let Ok(target_class) = engine.registry.class_by_id(target) else {
        return (CastRes::Incompatible, None);
    };

    // numeric, char and boolean targets take any integral-ish source
    if let Some(intrinsic) = Intrinsic::from_id(target) {
        if types::is_numeric(target) || intrinsic == Intrinsic::Char {
            if types::is_float(target) {
                let Some(v) = src.as_f64() else {
                    return (CastRes::Incompatible, None);
                };
                let data = if intrinsic == Intrinsic::Float4 {
                    ValueData::Float4(v as f32)
                } else {
                    ValueData::Float8(v)
                };
                return (CastRes::Ok, Some(data));
            }
            if types::is_float(src_class) {
                // float to integral: truncate, range-checked
                let Some(v) = src.as_f64() else {
                    return (CastRes::Incompatible, None);
                };
                if !v.is_finite() {
                    return (CastRes::Range, None);
                }
                return match ValueData::from_i128(intrinsic, v.trunc() as i128) {
                    Some(data) => (CastRes::Ok, Some(data)),
                    None => (CastRes::Range, None),
                };
            }
            let Some(v) = src.as_i128() else {
                return (CastRes::Incompatible, None);
            };
            return match ValueData::from_i128(intrinsic, v) {
                Some(data) => (CastRes::Ok, Some(data)),
                None => (CastRes::Range, None),
            };
        }
        if intrinsic == Intrinsic::Boolean {
            return match src.as_i128() {
                Some(v) => (CastRes::Ok, Some(ValueData::Boolean(v != 0))),
                None => (CastRes::Incompatible, None),
            };
        }
    }

    // ordinal to enum, range-checked against the target's item list
    if !target_class.enum_items().is_empty() {
        let Some(v) = src.as_i128() else {
            return (CastRes::Incompatible, None);
        };
        if v < 0 || v > i128::from(target_class.max_ordinal()) {
            return (CastRes::Range, None);
        }
        return (CastRes::Ok, Some(ValueData::Enum(v as u32)));
    }

    (CastRes::Incompatible, None)
}

impl Engine {
    /// Completes the frame below the arguments, dispatches, and either runs
    /// a native method to completion or returns the frame index for the
    /// loop to enter a bytecode body. `base_override` pins monomorphic
    /// dispatch (parent calls).
    ///
    /// Returns `Ok(None)` when the call was native and already finished.
    pub(crate) fn begin_call(
        &mut self,
        caller: Option<&Ctx>,
        recv: ValueId,
        base_class: ClassId,
        method_id: MethodId,
        dispatch: Dispatch,
    ) -> Result<Option<usize>, NativeError> {
        let base = match dispatch {
            Dispatch::Poly => self.heap.get(recv).class_id(),
            Dispatch::Mono => base_class,
        };
        let class = self.registry.class_by_id(base)?;
        let method = class
            .method(method_id)
            .ok_or_else(|| NativeError::UnknownMethod(base, format!("id {method_id}")))?;
        let parm_count = method.parm_count() as u16;

        let frame_index = self
            .stack
            .top()
            .checked_sub(usize::from(parm_count) + 1)
            .ok_or(NativeError::StackUnderflow)?;

        let (found, impl_class) = self
            .registry
            .find_impl(base, method_id, dispatch)
            .ok_or_else(|| NativeError::UnknownMethod(base, format!("id {method_id}")))?;
        let native = match found {
            MethodImpl::Native { func, .. } => Some(*func),
            MethodImpl::Ops(_) => None,
        };

        {
            let Some(StackItem::MethodCall(frame)) = self.stack.item_mut(frame_index) else {
                return Err(NativeError::BadStackItem("method-call frame"));
            };
            frame.called_class = impl_class;
            frame.called_method = method_id;
            frame.parm_count = parm_count;
            if let Some(ctx) = caller {
                frame.caller_class = ctx.class_id;
                frame.caller_method = ctx.method_id;
                frame.caller_body = Some(Rc::clone(&ctx.body));
                frame.caller_this = Some(ctx.this);
                frame.caller_frame = ctx.frame;
                frame.caller_parm_count = ctx.parm_count;
                frame.caller_ip = ctx.ip;
            }
        }
        if let Some(debugger) = self.debugger.as_mut() {
            debugger.call_stack_change();
        }

        if let Some(func) = native {
            let result = intrinsics::dispatch(self, func, NativeCall { this: recv, frame: frame_index });
            match result {
                Ok(()) => {
                    // native methods leave no locals; drop args and frame
                    self.cleanup_to(frame_index + 1);
                    self.stack.pop();
                    if let Some(debugger) = self.debugger.as_mut() {
                        debugger.call_stack_change();
                    }
                    Ok(None)
                }
                Err(err) => Err(err),
            }
        } else {
            // bytecode body: push locals above the arguments
            let body = match self.registry.class_by_id(impl_class)?.impl_for(method_id) {
                Some(MethodImpl::Ops(body)) => Rc::clone(body),
                _ => return Err(NativeError::BadStackItem("bytecode method")),
            };
            for local in body.locals().to_vec() {
                let id = self.heap.make_storage(&self.registry, local.class_id, local.is_const)?;
                if let Some(init) = &local.init {
                    self.heap.get_mut(id).data = init.clone();
                }
                self.stack.push_value(id, ValueItemKind::Local, false);
            }
            if !body.locals().is_empty() {
                if let Some(debugger) = self.debugger.as_mut() {
                    debugger.locals_change(true);
                }
            }
            Ok(Some(frame_index))
        }
    }

    /// A call opcode inside the loop: on a bytecode target, switches the
    /// context into the callee.
    fn begin_macro_call(
        &mut self,
        ctx: &mut Ctx,
        recv: ValueId,
        base_override: Option<ClassId>,
        method_id: MethodId,
        dispatch: Dispatch,
    ) -> StepResult {
        let base = base_override.unwrap_or_else(|| self.heap.get(recv).class_id());
        match self.begin_call(Some(&*ctx), recv, base, method_id, dispatch) {
            Ok(None) => Ok(()),
            Ok(Some(frame_index)) => {
                let Some(StackItem::MethodCall(frame)) = self.stack.item(frame_index) else {
                    return Err(self.raise(ctx, NativeError::BadStackItem("method-call frame")));
                };
                let impl_class = frame.called_class;
                let parm_count = frame.parm_count;
                let found = match self.registry.class_by_id(impl_class) {
                    Ok(class) => class.impl_for(method_id),
                    Err(err) => return Err(self.raise(ctx, err)),
                };
                let body = match found {
                    Some(MethodImpl::Ops(body)) => Rc::clone(body),
                    _ => return Err(self.raise(ctx, NativeError::BadStackItem("bytecode method"))),
                };
                *ctx = Ctx {
                    class_id: impl_class,
                    method_id,
                    body,
                    this: recv,
                    frame: frame_index,
                    parm_count,
                    ip: 0,
                };
                Ok(())
            }
            Err(err) => Err(self.raise(ctx, err)),
        }
    }

    /// `Return`: unwinds locals and arguments, pops the frame, restores
    /// the caller context. True when the popped frame was the entry frame.
    fn do_return(&mut self, ctx: &mut Ctx) -> StepResult<bool> {
        self.cleanup_to(ctx.frame + 1);
        if !ctx.body.locals().is_empty() {
            if let Some(debugger) = self.debugger.as_mut() {
                debugger.locals_change(false);
            }
        }
        let Some(StackItem::MethodCall(frame)) = self.stack.pop() else {
            return Err(self.raise(ctx, NativeError::BadStackItem("method-call frame")));
        };
        if let Some(debugger) = self.debugger.as_mut() {
            debugger.call_stack_change();
        }
        match frame.caller_body {
            Some(body) => {
                *ctx = Ctx {
                    class_id: frame.caller_class,
                    method_id: frame.caller_method,
                    body,
                    this: frame.caller_this.expect("macro caller has an instance"),
                    frame: frame.caller_frame,
                    parm_count: frame.caller_parm_count,
                    ip: frame.caller_ip,
                };
                Ok(false)
            }
            None => Ok(true),
        }
    }
}
