//! Host-side integration: debugger callbacks, cooperative cancellation,
//! exception report modes, and the argument-line runner.

use std::{cell::RefCell, rc::Rc};

use cml::{
    CollectParseErrors, DbgAction, DbgLine, Debugger, Engine, ExceptInfo, ExceptReport, MemClassManager, NativeError,
    RuntimeErrorHandler, exit_code,
};
use pretty_assertions::assert_eq;

fn engine_for(path: &str, source: &str) -> (Engine, u16) {
    let mut engine = Engine::new();
    let mut manager = MemClassManager::new();
    manager.add_class(path, source);
    let mut errors = CollectParseErrors::new();
    let id = engine
        .parse(path, &mut errors, &mut manager)
        .unwrap_or_else(|| panic!("parse failed: {:#?}", errors.events()));
    (engine, id)
}

fn start_instance(engine: &mut Engine, path: &str) -> cml::ValueId {
    let instance = engine.make_storage(path, false).unwrap();
    engine.invoke_default_ctor(instance).unwrap();
    instance
}

const SPINNER: &str = r#"
    Class=[NonFinal]
        ClassPath MEng.User.Spinner;
        ParentClass MEng.Object;
    EndClass;

    Methods=[Public,Final]
        Constructor()
        Begin
        EndConstructor;

        Method Start() Returns Int4
        Locals=
            Card4 Count;
        EndLocals;
        Begin
            While (True)
                Count++;
            EndWhile;
            Return 0;
        EndMethod;
    EndMethods;
"#;

/// Debugger that lets a bounded number of statements run, then exits.
struct ExitAfter {
    seen: Rc<RefCell<u32>>,
    limit: u32,
}

impl Debugger for ExitAfter {
    fn at_line(&mut self, _at: DbgLine<'_>) -> DbgAction {
        let mut seen = self.seen.borrow_mut();
        *seen += 1;
        if *seen >= self.limit { DbgAction::Exit } else { DbgAction::Continue }
    }
}

#[test]
fn debugger_exit_stops_a_runaway_macro() {
    let (mut engine, _) = engine_for("MEng.User.Spinner", SPINNER);
    let seen = Rc::new(RefCell::new(0));
    engine.set_debugger(Box::new(ExitAfter {
        seen: Rc::clone(&seen),
        limit: 50,
    }));
    let instance = start_instance(&mut engine, "MEng.User.Spinner");
    let code = engine.run(instance, &[]);
    assert_eq!(code, exit_code::DEBUG_EXIT);
    assert_eq!(*seen.borrow(), 50);
    // the forced unwind still released every temp
    assert_eq!(engine.outstanding_temps(), 0);
    engine.free_value(instance);
}

/// Debugger whose cancellation predicate fires immediately.
struct CancelNow;

impl Debugger for CancelNow {
    fn sleep_test(&mut self) -> bool {
        true
    }
}

#[test]
fn sleep_test_cancels_at_a_statement_boundary() {
    let (mut engine, _) = engine_for("MEng.User.Spinner", SPINNER);
    engine.set_debugger(Box::new(CancelNow));
    let instance = start_instance(&mut engine, "MEng.User.Spinner");
    let code = engine.run(instance, &[]);
    assert_eq!(code, exit_code::DEBUG_EXIT);
    engine.free_value(instance);
}

const CATCHER: &str = r#"
    Class=[NonFinal]
        ClassPath MEng.User.Quiet;
        ParentClass MEng.Object;
    EndClass;

    Types=
        Enum=Errs
            Oops : "oops";
        EndEnum;
    EndTypes;

    Methods=[Public,Final]
        Constructor()
        Begin
        EndConstructor;

        Method Start() Returns Int4
        Begin
            Try
                Throw(Errs.Oops);
            Catch
                Return 1;
            EndTry;
            Return 0;
        EndMethod;
    EndMethods;
"#;

/// Handler that shares its collected reports with the test.
struct SharedReports(Rc<RefCell<Vec<ExceptInfo>>>);

impl RuntimeErrorHandler for SharedReports {
    fn exception(&mut self, _error: &NativeError) {}

    fn macro_exception(&mut self, thrown: &ExceptInfo) {
        self.0.borrow_mut().push(thrown.clone());
    }
}

#[test]
fn report_at_throw_sees_even_caught_exceptions() {
    let (mut engine, _) = engine_for("MEng.User.Quiet", CATCHER);
    let reports = Rc::new(RefCell::new(Vec::new()));
    engine.set_runtime_error_handler(Box::new(SharedReports(Rc::clone(&reports))));
    engine.set_except_report(ExceptReport::AtThrow);

    let instance = start_instance(&mut engine, "MEng.User.Quiet");
    let code = engine.run(instance, &[]);
    assert_eq!(code, 1);
    assert_eq!(reports.borrow().len(), 1);
    assert_eq!(reports.borrow()[0].name, "Oops");
    engine.free_value(instance);
}

#[test]
fn report_not_handled_stays_silent_for_caught_exceptions() {
    let (mut engine, _) = engine_for("MEng.User.Quiet", CATCHER);
    let reports = Rc::new(RefCell::new(Vec::new()));
    engine.set_runtime_error_handler(Box::new(SharedReports(Rc::clone(&reports))));
    engine.set_except_report(ExceptReport::NotHandled);

    let instance = start_instance(&mut engine, "MEng.User.Quiet");
    let code = engine.run(instance, &[]);
    assert_eq!(code, 1);
    assert!(reports.borrow().is_empty());
    engine.free_value(instance);
}

#[test]
fn arg_line_runner_parses_quoted_tokens() {
    let source = r#"
        Class=[NonFinal]
            ClassPath MEng.User.Args;
            ParentClass MEng.Object;
        EndClass;

        Methods=[Public,Final]
            Constructor()
            Begin
            EndConstructor;

            Method Start([In] Card4 Num, [In] String Text) Returns Int4
            Begin
                If (Text = "two words")
                    Return TypeCast(MEng.Int4, Num);
                EndIf;
                Return -1;
            EndMethod;
        EndMethods;
    "#;
    let (mut engine, _) = engine_for("MEng.User.Args", source);
    let instance = start_instance(&mut engine, "MEng.User.Args");
    let code = engine.run_with_arg_line(instance, r#"7 "two words""#);
    assert_eq!(code, 7);
    engine.free_value(instance);
}
