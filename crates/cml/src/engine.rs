//! The engine facade the host drives.
//!
//! An [`Engine`] owns one complete runtime: the class registry, the value
//! heap and temp pool, the call stack, and the single thrown-exception
//! slot. It is single-threaded cooperative — all entry points are called
//! from one thread at a time, and the only suspension points are explicit
//! sleeps, debugger callbacks, and blocking host methods. A host wanting
//! concurrent macros runs multiple engines.
//!
//! The host-driven flow is: parse (or [`Self::register_class`] /
//! [`Self::load_classes`]) to populate the registry, [`Self::make_storage`]
//! to build an instance, [`Self::invoke_default_ctor`], then [`Self::run`]
//! with parameter values created by [`Self::create_parm_values`].

use crate::{
    callstack::{CallFrame, CallStack, StackItem, ValueItemKind},
    class::ClassInfo,
    debugger::{Debugger, FinishReason},
    error::{ExceptInfo, NativeError, Unwind, exit_code},
    handlers::{ParseErrorHandler, RuntimeErrorHandler},
    heap::{Heap, TempPool, ValueId},
    intrinsics,
    manager::{ClassLoader, ClassManager, LoaderEnd},
    parser::Parser,
    registry::ClassRegistry,
    resolver::FileResolver,
    types::{ClassExt, ClassId, Dispatch, ExceptReport, Intrinsic, MethodId, OptLevel},
    value::ValueData,
};

/// One complete macro runtime instance.
pub struct Engine {
    pub(crate) registry: ClassRegistry,
    pub(crate) heap: Heap,
    pub(crate) temps: TempPool,
    pub(crate) stack: CallStack,
    /// Source line the interpreter most recently crossed.
    pub(crate) cur_line: u32,
    /// The single thrown-exception payload; meaningful while unwinding or
    /// inside a catch block.
    pub(crate) thrown: ExceptInfo,
    /// Value mirroring `thrown`, faulted in on first throw.
    pub(crate) except_value: Option<ValueId>,
    pub(crate) debugger: Option<Box<dyn Debugger>>,
    pub(crate) rt_handler: Option<Box<dyn RuntimeErrorHandler>>,
    pub(crate) except_report: ExceptReport,
    opt_level: OptLevel,
    debug_mode: bool,
    dyn_type_ref: Option<String>,
    loaders: Vec<Box<dyn ClassLoader>>,
    resolver: Option<Box<dyn FileResolver>>,
    /// Class id of the `MEng.RuntimeErrors` enum.
    pub(crate) runtime_errors_class: ClassId,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Creates an engine with the intrinsic classes registered.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = ClassRegistry::new();
        intrinsics::register_all(&mut registry).expect("intrinsic registration on an empty registry");
        let runtime_errors_class = registry
            .find_class_id(intrinsics::RUNTIME_ERRORS_PATH)
            .expect("runtime error enum registers with the intrinsics");
        Self {
            registry,
            heap: Heap::new(),
            temps: TempPool::new(),
            stack: CallStack::new(),
            cur_line: 0,
            thrown: ExceptInfo::default(),
            except_value: None,
            debugger: None,
            rt_handler: None,
            except_report: ExceptReport::default(),
            opt_level: OptLevel::default(),
            debug_mode: false,
            dyn_type_ref: None,
            loaders: Vec::new(),
            resolver: None,
            runtime_errors_class,
        }
    }

    // ----- configuration ---------------------------------------------------

    #[must_use]
    pub fn registry(&self) -> &ClassRegistry {
        &self.registry
    }

    pub fn set_debugger(&mut self, debugger: Box<dyn Debugger>) {
        self.debugger = Some(debugger);
    }

    pub fn clear_debugger(&mut self) {
        self.debugger = None;
    }

    pub fn set_runtime_error_handler(&mut self, handler: Box<dyn RuntimeErrorHandler>) {
        self.rt_handler = Some(handler);
    }

    /// Takes the installed runtime handler back, so a host can inspect a
    /// collecting handler after a run.
    pub fn take_runtime_error_handler(&mut self) -> Option<Box<dyn RuntimeErrorHandler>> {
        self.rt_handler.take()
    }

    #[must_use]
    pub fn except_report(&self) -> ExceptReport {
        self.except_report
    }

    pub fn set_except_report(&mut self, mode: ExceptReport) {
        self.except_report = mode;
    }

    #[must_use]
    pub fn opt_level(&self) -> OptLevel {
        self.opt_level
    }

    pub fn set_opt_level(&mut self, level: OptLevel) {
        self.opt_level = level;
    }

    #[must_use]
    pub fn debug_mode(&self) -> bool {
        self.debug_mode
    }

    pub fn set_debug_mode(&mut self, on: bool) {
        self.debug_mode = on;
    }

    /// The class path that `$DynTypeRef` resolves to, when set.
    #[must_use]
    pub fn dyn_type_ref(&self) -> Option<&str> {
        self.dyn_type_ref.as_deref()
    }

    pub fn set_dyn_type_ref(&mut self, class_path: &str) {
        self.dyn_type_ref = Some(class_path.to_owned());
    }

    pub fn set_file_resolver(&mut self, resolver: Box<dyn FileResolver>) {
        self.resolver = Some(resolver);
    }

    /// Expands a macro-visible file path through the installed resolver.
    pub fn expand_file_path(&self, macro_path: &str) -> Result<std::path::PathBuf, NativeError> {
        self.resolver
            .as_ref()
            .ok_or_else(|| NativeError::ClassIo("no file resolver installed".to_owned()))?
            .expand(macro_path)
    }

    /// Contracts a host OS path through the installed resolver.
    pub fn contract_file_path(&self, os_path: &std::path::Path) -> Result<String, NativeError> {
        self.resolver
            .as_ref()
            .ok_or_else(|| NativeError::ClassIo("no file resolver installed".to_owned()))?
            .contract(os_path)
    }

    // ----- class registration ----------------------------------------------

    /// Registers a host-built class, returning its id.
    pub fn register_class(&mut self, class: ClassInfo) -> Result<ClassId, NativeError> {
        self.registry.add_class(class)
    }

    /// Installs an external class loader at the front or back of the
    /// lookup order.
    pub fn register_class_loader(&mut self, loader: Box<dyn ClassLoader>, end: LoaderEnd) {
        match end {
            LoaderEnd::First => self.loaders.insert(0, loader),
            LoaderEnd::Last => self.loaders.push(loader),
        }
    }

    /// Asks the installed loaders for a class, in priority order.
    pub(crate) fn load_external_class(&mut self, class_path: &str) -> Option<ClassInfo> {
        for loader in &mut self.loaders {
            if let Some(class) = loader.load_class(class_path) {
                return Some(class);
            }
        }
        None
    }

    /// Parses a macro class (and, recursively, everything it imports)
    /// into the registry.
    ///
    /// Diagnostics go to the handler; the return is the main class id, or
    /// None when any error was emitted — in which case every class this
    /// parse registered has been rolled back.
    pub fn parse(
        &mut self,
        class_path: &str,
        errors: &mut dyn ParseErrorHandler,
        manager: &mut dyn ClassManager,
    ) -> Option<ClassId> {
        let checkpoint = self.registry.class_count();
        let result = Parser::new(self, errors, manager).parse_class(class_path);
        match result {
            Some(id) => Some(id),
            None => {
                self.registry.truncate(checkpoint);
                None
            }
        }
    }

    // ----- registry snapshots ----------------------------------------------

    /// Serializes every non-intrinsic class, so a host can cache compiled
    /// macros and restore them without reparsing.
    pub fn dump_classes(&self) -> Result<Vec<u8>, NativeError> {
        let first_user = usize::from(Intrinsic::COUNT) + 1; // +1 for RuntimeErrors
        let user: Vec<&ClassInfo> = self.registry.classes()[first_user..].iter().collect();
        postcard::to_allocvec(&user).map_err(|e| NativeError::Snapshot(e.to_string()))
    }

    /// Restores classes serialized by [`Self::dump_classes`] into an engine
    /// whose registry holds only the intrinsics.
    pub fn load_classes(&mut self, bytes: &[u8]) -> Result<(), NativeError> {
        let classes: Vec<ClassInfo> = postcard::from_bytes(bytes).map_err(|e| NativeError::Snapshot(e.to_string()))?;
        for class in classes {
            let expect = class.id();
            let got = self.registry.restore_class(class)?;
            if got != expect {
                return Err(NativeError::Snapshot(format!(
                    "class id drifted on restore: expected {expect}, got {got}"
                )));
            }
        }
        Ok(())
    }

    // ----- instances and invocation ----------------------------------------

    /// Builds default-initialized storage for an instance of a class.
    pub fn make_storage(&mut self, class_path: &str, is_const: bool) -> Result<ValueId, NativeError> {
        let class_id = self.registry.find_class_id(class_path)?;
        let class = self.registry.class_by_id(class_id)?;
        if class.ext() == ClassExt::Abstract {
            return Err(NativeError::AbstractClass(class_path.to_owned()));
        }
        self.heap.make_storage(&self.registry, class_id, is_const)
    }

    /// Invokes the class's zero-parameter constructor on an instance.
    pub fn invoke_default_ctor(&mut self, instance: ValueId) -> Result<(), NativeError> {
        let class_id = self.heap.get(instance).class_id();
        let class = self.registry.class_by_id(class_id)?;
        let ctor_id = class
            .def_ctor_id()
            .ok_or_else(|| NativeError::NoDefaultCtor(class.class_path().to_owned()))?;
        let base = self.stack.top();
        self.push_pool_value(Intrinsic::Void.id(), false)?;
        self.push_call_frame();
        let outcome = self.invoke(instance, ctor_id, Dispatch::Poly);
        self.cleanup_to(base);
        match outcome {
            Ok(()) => Ok(()),
            Err(Unwind::Native(err)) => Err(err),
            Err(Unwind::Except) => Err(NativeError::ClassIo(format!(
                "constructor threw {}.{}",
                self.thrown.class_path, self.thrown.name
            ))),
            Err(Unwind::DbgExit) => Err(NativeError::Cancelled),
        }
    }

    /// Finds the host entry point: the public method named `Start`.
    pub fn find_entry_point(&self, class_id: ClassId) -> Result<MethodId, NativeError> {
        let class = self.registry.class_by_id(class_id)?;
        class
            .find_method("Start")
            .map(crate::method::MethodInfo::id)
            .ok_or_else(|| NativeError::NoEntryPoint(class.class_path().to_owned()))
    }

    /// Builds parameter values for an invocation of `method_id`, parsing
    /// the provided argument strings into the in and in-out slots.
    pub fn create_parm_values(
        &mut self,
        class_id: ClassId,
        method_id: MethodId,
        args: &[&str],
    ) -> Result<Vec<ValueId>, NativeError> {
        let class = self.registry.class_by_id(class_id)?;
        let method = class
            .method(method_id)
            .ok_or_else(|| NativeError::UnknownMethod(class_id, format!("id {method_id}")))?;
        let parms: Vec<_> = method.parms().to_vec();
        let mut out = Vec::with_capacity(parms.len());
        for parm in &parms {
            let id = self.heap.make_storage(&self.registry, parm.class_id, false)?;
            if parm.dir != crate::types::ParmDir::Out {
                if let Some(text) = args.get(usize::from(parm.id) - 1) {
                    let value = self.heap.get_mut(id);
                    if !value.data.parse_from_text(text) {
                        let class_id = value.class_id();
                        self.heap.free(id);
                        for prev in out {
                            self.heap.free(prev);
                        }
                        return Err(NativeError::BadTextValue(class_id, (*text).to_owned()));
                    }
                }
            }
            out.push(id);
        }
        Ok(out)
    }

    /// Runs the instance's `Start` method with the given parameter values
    /// and returns the macro's exit code.
    ///
    /// Normal termination returns the entry method's Int4 result. An
    /// unhandled macro exception, a native error, and a debugger exit each
    /// return their dedicated code, after reporting through the installed
    /// runtime error handler. Out and in-out parameter values hold their
    /// final contents on return; the caller still owns them.
    pub fn run(&mut self, instance: ValueId, parms: &[ValueId]) -> i32 {
        let class_id = self.heap.get(instance).class_id();
        let method_id = match self.find_entry_point(class_id) {
            Ok(id) => id,
            Err(err) => {
                self.report_native(&err);
                return exit_code::INTERNAL_ERROR;
            }
        };

        let base = self.stack.top();
        let ret = match self.push_pool_value(Intrinsic::Int4.id(), false) {
            Ok(id) => id,
            Err(err) => {
                self.report_native(&err);
                return exit_code::INTERNAL_ERROR;
            }
        };
        self.push_call_frame();
        for &parm in parms {
            self.stack.push_value(parm, ValueItemKind::Parm, false);
        }

        let outcome = self.invoke(instance, method_id, Dispatch::Poly);
        if let Some(debugger) = self.debugger.as_mut() {
            let reason = match &outcome {
                Ok(()) => FinishReason::Normal,
                Err(Unwind::Except) => FinishReason::MacroException,
                Err(Unwind::Native(_)) => FinishReason::NativeError,
                Err(Unwind::DbgExit) => FinishReason::Forced,
            };
            debugger.finished(reason);
        }
        let code = match outcome {
            Ok(()) => match &self.heap.get(ret).data {
                ValueData::Int4(v) => *v,
                _ => 0,
            },
            Err(Unwind::Except) => {
                // in at-throw mode the handler already saw this one
                if self.except_report == ExceptReport::NotHandled {
                    let thrown = self.thrown.clone();
                    if let Some(handler) = self.rt_handler.as_mut() {
                        handler.macro_exception(&thrown);
                    }
                }
                exit_code::RUNTIME_ERROR
            }
            Err(Unwind::Native(err)) => {
                self.report_native(&err);
                exit_code::INTERNAL_ERROR
            }
            Err(Unwind::DbgExit) => exit_code::DEBUG_EXIT,
        };
        self.cleanup_to(base);
        code
    }

    /// Space/quote-delimited variant of [`Self::run`]: splits the argument
    /// line into tokens, builds the parameter values, runs, and frees them.
    pub fn run_with_arg_line(&mut self, instance: ValueId, arg_line: &str) -> i32 {
        let tokens = split_arg_line(arg_line);
        let token_refs: Vec<&str> = tokens.iter().map(String::as_str).collect();
        let class_id = self.heap.get(instance).class_id();
        let method_id = match self.find_entry_point(class_id) {
            Ok(id) => id,
            Err(err) => {
                self.report_native(&err);
                return exit_code::INTERNAL_ERROR;
            }
        };
        let parms = match self.create_parm_values(class_id, method_id, &token_refs) {
            Ok(parms) => parms,
            Err(err) => {
                self.report_native(&err);
                return exit_code::INTERNAL_ERROR;
            }
        };
        let code = self.run(instance, &parms);
        for parm in parms {
            self.heap.free(parm);
        }
        code
    }

    /// The payload of any value, for hosts reading results back.
    #[must_use]
    pub fn value_data(&self, id: ValueId) -> &ValueData {
        &self.heap.get(id).data
    }

    /// Writes a value's payload, for hosts setting inputs directly.
    pub fn set_value_data(&mut self, id: ValueId, data: ValueData) {
        self.heap.get_mut(id).data = data;
    }

    /// Frees a value the host obtained from [`Self::make_storage`] or
    /// [`Self::create_parm_values`].
    pub fn free_value(&mut self, id: ValueId) {
        self.heap.free(id);
    }

    /// The most recently thrown macro exception.
    #[must_use]
    pub fn last_exception(&self) -> &ExceptInfo {
        &self.thrown
    }

    /// Temp-pool borrowings currently outstanding. Zero between
    /// invocations; useful for leak diagnostics in hosts and tests.
    #[must_use]
    pub fn outstanding_temps(&self) -> usize {
        self.temps.in_use_count(&self.heap)
    }

    /// Live values in the engine heap, pooled temps included.
    #[must_use]
    pub fn live_values(&self) -> usize {
        self.heap.live_count()
    }

    // ----- stack access (hosts and native methods) -------------------------

    /// Index of the next free stack slot.
    #[must_use]
    pub fn stack_top(&self) -> usize {
        self.stack.top()
    }

    /// The value at an absolute stack index, when that slot holds a value.
    pub fn stack_value_at(&self, index: usize) -> Result<ValueId, NativeError> {
        match self.stack.item(index) {
            Some(StackItem::Value { id, .. }) => Ok(*id),
            Some(_) => Err(NativeError::BadStackItem("value")),
            None => Err(NativeError::StackUnderflow),
        }
    }

    /// Typed read of a boolean stack slot.
    pub fn bool_stack_at(&self, index: usize) -> Result<bool, NativeError> {
        match &self.heap.get(self.stack_value_at(index)?).data {
            ValueData::Boolean(b) => Ok(*b),
            _ => Err(NativeError::BadStackItem("boolean value")),
        }
    }

    /// Typed read of any cardinal stack slot, widened to 64 bits.
    pub fn card_stack_at(&self, index: usize) -> Result<u64, NativeError> {
        let id = self.stack_value_at(index)?;
        let value = self.heap.get(id);
        match value.data.as_i128() {
            Some(v) if v >= 0 => Ok(v as u64),
            _ => Err(NativeError::BadStackItem("cardinal value")),
        }
    }

    /// Typed read of any integral stack slot, widened to 64 bits.
    pub fn int_stack_at(&self, index: usize) -> Result<i64, NativeError> {
        let id = self.stack_value_at(index)?;
        self.heap
            .get(id)
            .data
            .as_i128()
            .map(|v| v as i64)
            .ok_or(NativeError::BadStackItem("integral value"))
    }

    /// Typed read of a float stack slot.
    pub fn float_stack_at(&self, index: usize) -> Result<f64, NativeError> {
        let id = self.stack_value_at(index)?;
        self.heap
            .get(id)
            .data
            .as_f64()
            .ok_or(NativeError::BadStackItem("float value"))
    }

    /// Typed read of a char stack slot.
    pub fn char_stack_at(&self, index: usize) -> Result<char, NativeError> {
        match &self.heap.get(self.stack_value_at(index)?).data {
            ValueData::Char(c) => Ok(*c),
            _ => Err(NativeError::BadStackItem("char value")),
        }
    }

    /// Typed read of a string stack slot.
    pub fn string_stack_at(&self, index: usize) -> Result<&str, NativeError> {
        match &self.heap.get(self.stack_value_at(index)?).data {
            ValueData::String(s) => Ok(s),
            _ => Err(NativeError::BadStackItem("string value")),
        }
    }

    /// Swaps the top two stack items.
    pub fn flip_top(&mut self) {
        self.stack.flip_top();
    }

    /// Pops `count` items, releasing what each owns.
    pub fn multi_pop(&mut self, count: usize) {
        for _ in 0..count {
            self.pop_and_release();
        }
    }

    /// Pushes a temp of the given class borrowed from the pool.
    pub fn push_pool_value(&mut self, class_id: ClassId, is_const: bool) -> Result<ValueId, NativeError> {
        let id = self.temps.borrow(&mut self.heap, &self.registry, class_id, is_const)?;
        self.stack.push_value(id, ValueItemKind::Temp, false);
        Ok(id)
    }

    /// Pushes an existing value without transferring ownership.
    pub fn push_value(&mut self, id: ValueId, kind: ValueItemKind) {
        self.stack.push_value(id, kind, false);
    }

    /// Pushes a call-frame placeholder, as `PushCurLine` does from
    /// bytecode. The next `invoke` completes it.
    pub fn push_call_frame(&mut self) {
        self.stack.push(StackItem::MethodCall(CallFrame::placeholder(self.cur_line)));
    }

    // ----- internals shared with the vm and intrinsics ---------------------

    /// Pops the top item and releases whatever it owns: temps return to the
    /// pool, locals free their storage, repushed items release nothing.
    pub(crate) fn pop_and_release(&mut self) -> Option<StackItem> {
        let item = self.stack.pop()?;
        if let StackItem::Value { id, kind, repush } = &item {
            if !repush {
                match kind {
                    ValueItemKind::Temp | ValueItemKind::StrPool => self.temps.release(&mut self.heap, *id),
                    ValueItemKind::Local => self.heap.free(*id),
                    _ => {}
                }
            }
        }
        Some(item)
    }

    /// Pops everything above `base`, releasing as it goes.
    pub(crate) fn cleanup_to(&mut self, base: usize) {
        while self.stack.top() > base {
            self.pop_and_release();
        }
    }

    /// Argument `n` (1-based) of the native call whose frame is at `frame`.
    pub(crate) fn native_parm(&self, frame: usize, n: u16) -> Result<ValueId, NativeError> {
        self.stack_value_at(frame + usize::from(n))
    }

    /// Writes the return slot of the native call whose frame is at `frame`.
    pub(crate) fn native_set_ret(&mut self, frame: usize, data: ValueData) -> Result<(), NativeError> {
        let slot = frame.checked_sub(1).ok_or(NativeError::StackUnderflow)?;
        let id = self.stack_value_at(slot)?;
        self.heap.get_mut(id).data = data;
        Ok(())
    }

    /// Whether the host's cancellation predicate wants the macro stopped.
    pub(crate) fn sleep_cancelled(&mut self) -> bool {
        self.debugger.as_mut().is_some_and(|d| d.sleep_test())
    }

    pub(crate) fn report_native(&mut self, err: &NativeError) {
        if let Some(handler) = self.rt_handler.as_mut() {
            handler.exception(err);
        }
    }
}

/// Splits a command-line style argument string into tokens, honoring
/// double quotes.
fn split_arg_line(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut cur = String::new();
    let mut in_quotes = false;
    for ch in line.chars() {
        match ch {
            '"' => {
                if in_quotes {
                    tokens.push(std::mem::take(&mut cur));
                }
                in_quotes = !in_quotes;
            }
            c if c.is_whitespace() && !in_quotes => {
                if !cur.is_empty() {
                    tokens.push(std::mem::take(&mut cur));
                }
            }
            c => cur.push(c),
        }
    }
    if !cur.is_empty() {
        tokens.push(cur);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn arg_line_splitting_honors_quotes() {
        assert_eq!(split_arg_line("one two three"), vec!["one", "two", "three"]);
        assert_eq!(split_arg_line(r#"one "two three" four"#), vec!["one", "two three", "four"]);
        assert_eq!(split_arg_line("  "), Vec::<String>::new());
        assert_eq!(split_arg_line(r#""""#), vec![""]);
    }

    #[test]
    fn make_storage_rejects_abstract_classes() {
        let mut engine = Engine::new();
        assert!(matches!(
            engine.make_storage("MEng.Formattable", false),
            Err(NativeError::AbstractClass(_))
        ));
        assert!(matches!(
            engine.make_storage("MEng.Missing", false),
            Err(NativeError::UnknownClass(_))
        ));
        let s = engine.make_storage("MEng.String", false).unwrap();
        assert_eq!(engine.value_data(s), &ValueData::String(String::new()));
    }
}
