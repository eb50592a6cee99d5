//! Throw, rethrow, and stack unwinding.
//!
//! A macro exception is data, not a host exception: `Throw` fills the
//! engine's single thrown-exception slot and the opcode step returns
//! `Unwind::Except`. The loop then walks the call stack downward,
//! releasing every item it passes (temp borrowings cleared, locals freed,
//! repushed items skipped) and restoring the caller context at each frame,
//! until a try marker stops the walk or the entry frame is reached.

use crate::{
    callstack::StackItem,
    engine::Engine,
    error::{ExceptInfo, NativeError, Unwind},
    heap::ValueId,
    types::{ClassId, ExceptReport, Intrinsic},
    value::{Value, ValueData},
    vm::Ctx,
};

impl Engine {
    /// Executes `Throw` / `ThrowFmt` / rethrow. Always yields an unwind;
    /// a malformed stack yields a native one instead of an exception.
    pub(crate) fn do_throw(&mut self, ctx: &Ctx, rethrow: bool, fmt_count: u32) -> Unwind {
        if rethrow {
            // the original throw's class path, line, and text stay intact
            return Unwind::Except;
        }

        // formattable arguments sit above the error enum, last on top
        let mut fmt_args = Vec::with_capacity(fmt_count as usize);
        for _ in 0..fmt_count {
            let Ok(id) = self.top_value_for_throw() else {
                return Unwind::Native(NativeError::BadStackItem("formattable value"));
            };
            fmt_args.push(self.format_value_for_throw(id));
            self.pop_and_release();
        }
        fmt_args.reverse();

        let Ok(enum_id) = self.top_value_for_throw() else {
            return Unwind::Native(NativeError::BadStackItem("error enum value"));
        };
        let err_class = self.heap.get(enum_id).class_id();
        let Some(ordinal) = self.heap.get(enum_id).data.as_ordinal() else {
            return Unwind::Native(NativeError::BadStackItem("error enum value"));
        };
        self.pop_and_release();

        let class_path = self
            .registry
            .class_by_id(ctx.class_id)
            .map(|c| c.class_path().to_owned())
            .unwrap_or_default();
        self.fill_thrown(err_class, ordinal, &class_path, &fmt_args);
        Unwind::Except
    }

    /// Writes the thrown-exception slot (and its value mirror) and reports
    /// it when the engine is in report-at-throw mode.
    pub(crate) fn fill_thrown(&mut self, err_class: ClassId, ordinal: u32, class_path: &str, fmt_args: &[String]) {
        let (name, mut text) = self
            .registry
            .class_by_id(err_class)
            .ok()
            .and_then(|c| c.enum_item(ordinal))
            .map(|item| (item.name.clone(), item.text.clone()))
            .unwrap_or_default();
        for (ix, arg) in fmt_args.iter().enumerate() {
            text = text.replace(&format!("%({})", ix + 1), arg);
        }
        self.thrown = ExceptInfo {
            err_class,
            ordinal,
            name,
            text,
            class_path: class_path.to_owned(),
            line: self.cur_line,
        };
        self.sync_except_value();
        if self.except_report == ExceptReport::AtThrow {
            let thrown = self.thrown.clone();
            if let Some(handler) = self.rt_handler.as_mut() {
                handler.macro_exception(&thrown);
            }
        }
    }

    /// Keeps the magic exception value in step with the thrown slot,
    /// creating it on the first throw.
    fn sync_except_value(&mut self) {
        let data = ValueData::Except(self.thrown.clone());
        match self.except_value {
            Some(id) => self.heap.get_mut(id).data = data,
            None => {
                let id = self.heap.alloc(Value::new(Intrinsic::Exception.id(), true, data));
                self.except_value = Some(id);
            }
        }
    }

    /// Walks the stack down looking for a try marker. True when caught: the
    /// marker has been replaced by an exception marker and the context
    /// points at the catch block. False when the unwind reached the entry
    /// frame; everything above it has been released either way.
    pub(crate) fn unwind_to_catch(&mut self, ctx: &mut Ctx, entry_frame: usize) -> bool {
        loop {
            match self.stack.peek() {
                None => return false,
                Some(StackItem::TryMarker { catch_ip }) => {
                    let catch_ip = *catch_ip;
                    self.stack.pop();
                    self.stack.push(StackItem::ExceptMarker);
                    ctx.ip = catch_ip;
                    return true;
                }
                // a throw inside a catch block unwinds past its marker
                Some(StackItem::ExceptMarker) => {
                    self.stack.pop();
                }
                Some(StackItem::MethodCall(_)) => {
                    if self.stack.top() - 1 == entry_frame {
                        // uncaught: the entry point returns the exception
                        return false;
                    }
                    let Some(StackItem::MethodCall(frame)) = self.stack.pop() else {
                        unreachable!("peeked a method-call frame");
                    };
                    if let Some(debugger) = self.debugger.as_mut() {
                        debugger.call_stack_change();
                    }
                    // a placeholder frame (call was still collecting its
                    // arguments) restores nothing
                    if let Some(body) = frame.caller_body {
                        *ctx = Ctx {
                            class_id: frame.caller_class,
                            method_id: frame.caller_method,
                            body,
                            this: frame.caller_this.expect("macro caller has an instance"),
                            frame: frame.caller_frame,
                            parm_count: frame.caller_parm_count,
                            ip: frame.caller_ip,
                        };
                    }
                }
                Some(StackItem::Value { .. }) => {
                    self.pop_and_release();
                }
            }
        }
    }

    /// Releases everything above the entry frame without searching for a
    /// catch. Used for the unwind kinds that ignore try markers.
    pub(crate) fn release_to_entry(&mut self, entry_frame: usize) {
        self.cleanup_to(entry_frame + 1);
    }

    fn top_value_for_throw(&self) -> Result<ValueId, NativeError> {
        let top = self.stack.top().checked_sub(1).ok_or(NativeError::StackUnderflow)?;
        self.stack_value_at(top)
    }

    fn format_value_for_throw(&self, id: ValueId) -> String {
        self.heap.get(id).data.format_plain().unwrap_or_else(|| {
            let mut out = String::new();
            self.heap
                .dbg_format(&self.registry, id, crate::types::DbgFmt::Short, 10, &mut out);
            out
        })
    }
}
