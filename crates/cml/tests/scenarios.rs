//! End-to-end macro scenarios driven through the public engine facade.

use cml::{
    CollectParseErrors, Dispatch, Engine, Intrinsic, MemClassManager, ValueData, ValueItemKind, exit_code,
};
use pretty_assertions::assert_eq;

/// Parses a set of class sources and returns the engine plus the main
/// class id. Panics with the collected diagnostics on failure.
fn engine_with(main: &str, classes: &[(&str, &str)]) -> (Engine, u16) {
    let mut engine = Engine::new();
    let mut manager = MemClassManager::new();
    for (path, source) in classes {
        manager.add_class(path, source);
    }
    let mut errors = CollectParseErrors::new();
    match engine.parse(main, &mut errors, &mut manager) {
        Some(id) => (engine, id),
        None => panic!("parse of {main} failed: {:#?}", errors.events()),
    }
}

/// Builds an instance, runs its default ctor and Start method with the
/// given text arguments, and returns (exit code, parm values, engine).
fn run_start(main: &str, classes: &[(&str, &str)], args: &[&str]) -> (i32, Vec<ValueData>, Engine) {
    let (mut engine, class_id) = engine_with(main, classes);
    let instance = engine.make_storage(main, false).unwrap();
    engine.invoke_default_ctor(instance).unwrap();
    let method = engine.find_entry_point(class_id).unwrap();
    let parms = engine.create_parm_values(class_id, method, args).unwrap();
    let code = engine.run(instance, &parms);
    let values: Vec<ValueData> = parms.iter().map(|&p| engine.value_data(p).clone()).collect();
    for parm in parms {
        engine.free_value(parm);
    }
    engine.free_value(instance);
    (code, values, engine)
}

#[test]
fn hello_name_writes_out_parameters() {
    let source = r#"
        Class=[NonFinal]
            ClassPath MEng.User.Hello;
            ParentClass MEng.Object;
        EndClass;

        Methods=[Public,Final]
            Constructor()
            Begin
            EndConstructor;

            Method Start([Out] String Name, [Out] String Addr) Returns Int4
            Begin
                Name := "Alice";
                Addr := "Main St";
                Return 0;
            EndMethod;
        EndMethods;
    "#;
    let (code, values, engine) = run_start("MEng.User.Hello", &[("MEng.User.Hello", source)], &[]);
    assert_eq!(code, 0);
    assert_eq!(values[0], ValueData::String("Alice".into()));
    assert_eq!(values[1], ValueData::String("Main St".into()));
    // every temp borrowed during the run went back to the pool
    assert_eq!(engine.outstanding_temps(), 0);
}

#[test]
fn try_catch_lands_in_the_catch_block() {
    let source = r#"
        Class=[NonFinal]
            ClassPath MEng.User.Catcher;
            ParentClass MEng.Object;
        EndClass;

        Types=
            Enum=TestErrs
                Zero : "zero";
                One : "one";
                Two : "two";
                Three : "it went wrong";
            EndEnum;
        EndTypes;

        Methods=[Public,Final]
            Constructor()
            Begin
            EndConstructor;

            Method Start([Out] String Msg) Returns Int4
            Begin
                Try
                    Throw(TestErrs.Three);
                    Msg := "not reached";
                Catch
                    If ($Exception.Check(TestErrs.Three, 3))
                        Msg := "caught";
                    Else
                        Msg := "wrong error";
                    EndIf;
                EndTry;
                Return 0;
            EndMethod;
        EndMethods;
    "#;
    let (code, values, engine) = run_start("MEng.User.Catcher", &[("MEng.User.Catcher", source)], &[]);
    assert_eq!(code, 0);
    assert_eq!(values[0], ValueData::String("caught".into()));
    assert_eq!(engine.last_exception().name, "Three");
    assert_eq!(engine.last_exception().text, "it went wrong");
    assert_eq!(engine.outstanding_temps(), 0);
}

#[test]
fn switch_hits_cases_and_default() {
    let source = r#"
        Class=[NonFinal]
            ClassPath MEng.User.Switcher;
            ParentClass MEng.Object;
        EndClass;

        Types=
            Enum=Sides
                North : "n";
                South : "s";
                East : "e";
                West : "w";
            EndEnum;
        EndTypes;

        Methods=[Public,Final]
            Constructor()
            Begin
            EndConstructor;

            Method Start([In] Card4 Which, [Out] String Res) Returns Int4
            Locals=
                Sides SVal;
            EndLocals;
            Begin
                SVal.SetOrdinal(Which);
                Switch(SVal)
                    Case Sides.East :
                        Res := "two";
                    EndCase;
                    Default :
                        Res := "other";
                    EndCase;
                EndSwitch;
                Return 0;
            EndMethod;
        EndMethods;
    "#;
    let classes = [("MEng.User.Switcher", source)];

    // ordinal 2 is the enumerated case
    let (code, values, _) = run_start("MEng.User.Switcher", &classes, &["2"]);
    assert_eq!(code, 0);
    assert_eq!(values[1], ValueData::String("two".into()));

    // anything not enumerated lands in the default
    let (code, values, _) = run_start("MEng.User.Switcher", &classes, &["0"]);
    assert_eq!(code, 0);
    assert_eq!(values[1], ValueData::String("other".into()));
}

const POLY_BASE: &str = r#"
    Class=[NonFinal]
        ClassPath MEng.User.PolyA;
        ParentClass MEng.Object;
    EndClass;

    Methods=[Public,Final]
        Constructor()
        Begin
        EndConstructor;
    EndMethods;

    Methods=[Public,NonFinal]
        Method Who() Returns String
        Begin
            Return "A";
        EndMethod;
    EndMethods;
"#;

const POLY_DERIVED: &str = r#"
    Class=[NonFinal]
        ClassPath MEng.User.PolyB;
        ParentClass MEng.User.PolyA;
    EndClass;

    Methods=[Public,Final]
        Constructor()
        Begin
        EndConstructor;
    EndMethods;

    Methods=[Public,Final,Overrides]
        Method Who() Returns String
        Begin
            Return "B";
        EndMethod;
    EndMethods;
"#;

const POLY_CALLER: &str = r#"
    Class=[NonFinal]
        ClassPath MEng.User.PolyCaller;
        ParentClass MEng.Object;
    EndClass;

    Imports=
        MEng.User.PolyA;
    EndImports;

    Methods=[Public,Final]
        Constructor()
        Begin
        EndConstructor;

        Method Start([In] PolyA Obj, [Out] String Res) Returns Int4
        Begin
            Res := Obj.Who();
            Return 0;
        EndMethod;
    EndMethods;
"#;

#[test]
fn override_dispatches_on_the_runtime_class() {
    let classes = [
        ("MEng.User.PolyA", POLY_BASE),
        ("MEng.User.PolyB", POLY_DERIVED),
        ("MEng.User.PolyCaller", POLY_CALLER),
    ];
    let (mut engine, _) = engine_with("MEng.User.PolyCaller", &classes);

    // a B instance handed through an A-typed parameter runs B's override
    let instance = engine.make_storage("MEng.User.PolyCaller", false).unwrap();
    engine.invoke_default_ctor(instance).unwrap();
    let b_value = engine.make_storage("MEng.User.PolyB", false).unwrap();
    engine.invoke_default_ctor(b_value).unwrap();
    let res_value = engine.make_storage("MEng.String", false).unwrap();

    let code = engine.run(instance, &[b_value, res_value]);
    assert_eq!(code, 0);
    assert_eq!(engine.value_data(res_value), &ValueData::String("B".into()));

    // direct host invocation through the inherited descriptor agrees
    let a_class = engine.registry().class_by_path("MEng.User.PolyA").unwrap();
    let who_id = a_class.find_method("Who").unwrap().id();
    let ret = engine.push_pool_value(Intrinsic::String.id(), false).unwrap();
    engine.push_call_frame();
    engine.invoke(b_value, who_id, Dispatch::Poly).unwrap();
    assert_eq!(engine.value_data(ret), &ValueData::String("B".into()));
    engine.multi_pop(1);

    for id in [res_value, b_value, instance] {
        engine.free_value(id);
    }
}

#[test]
fn circular_imports_are_rejected_cleanly() {
    let a = r#"
        Class=[NonFinal]
            ClassPath MEng.User.CircA;
            ParentClass MEng.Object;
        EndClass;

        Imports=
            MEng.User.CircB;
        EndImports;

        Methods=[Public,Final]
            Constructor()
            Begin
            EndConstructor;
        EndMethods;
    "#;
    let b = r#"
        Class=[NonFinal]
            ClassPath MEng.User.CircB;
            ParentClass MEng.Object;
        EndClass;

        Imports=
            MEng.User.CircA;
        EndImports;

        Methods=[Public,Final]
            Constructor()
            Begin
            EndConstructor;
        EndMethods;
    "#;
    let mut engine = Engine::new();
    let mut manager = MemClassManager::new();
    manager.add_class("MEng.User.CircA", a);
    manager.add_class("MEng.User.CircB", b);
    let mut errors = CollectParseErrors::new();
    assert!(engine.parse("MEng.User.CircA", &mut errors, &mut manager).is_none());
    assert!(errors.mentions("circular"));
    // the failed parse leaves nothing behind, not even partial classes
    assert!(engine.registry().class_by_path("MEng.User.CircA").is_none());
    assert!(engine.registry().class_by_path("MEng.User.CircB").is_none());
}

#[test]
fn narrowing_cast_throws_a_range_error() {
    let source = r#"
        Class=[NonFinal]
            ClassPath MEng.User.Caster;
            ParentClass MEng.Object;
        EndClass;

        Methods=[Public,Final]
            Constructor()
            Begin
            EndConstructor;

            Method Start([Out] String Res) Returns Int4
            Locals=
                Card4 Big;
                Card2 Small;
            EndLocals;
            Begin
                Big := 70000;
                Try
                    Small := TypeCast(MEng.Card2, Big);
                    Res := "no throw";
                Catch
                    If ($Exception.Check(RuntimeErrors.CastRange, 0))
                        Res := "range";
                    Else
                        Res := "wrong error";
                    EndIf;
                EndTry;
                Return 0;
            EndMethod;
        EndMethods;
    "#;
    let (code, values, engine) = run_start("MEng.User.Caster", &[("MEng.User.Caster", source)], &[]);
    assert_eq!(code, 0);
    assert_eq!(values[0], ValueData::String("range".into()));
    assert_eq!(engine.last_exception().name, "CastRange");
    assert_eq!(engine.outstanding_temps(), 0);
}

#[test]
fn unhandled_exception_returns_the_runtime_error_code() {
    let source = r#"
        Class=[NonFinal]
            ClassPath MEng.User.Thrower;
            ParentClass MEng.Object;
        EndClass;

        Types=
            Enum=Errs
                Boom : "boom";
            EndEnum;
        EndTypes;

        Methods=[Public,Final]
            Constructor()
            Begin
            EndConstructor;

            Method Start() Returns Int4
            Begin
                Throw(Errs.Boom);
                Return 0;
            EndMethod;
        EndMethods;
    "#;
    let (code, _, engine) = run_start("MEng.User.Thrower", &[("MEng.User.Thrower", source)], &[]);
    assert_eq!(code, exit_code::RUNTIME_ERROR);
    assert_eq!(engine.last_exception().name, "Boom");
    assert_eq!(engine.last_exception().class_path, "MEng.User.Thrower");
    assert_eq!(engine.outstanding_temps(), 0);
}

#[test]
fn host_stack_helpers_round_trip() {
    let mut engine = Engine::new();
    let value = engine.make_storage("MEng.Card4", false).unwrap();
    engine.set_value_data(value, ValueData::Card4(9));
    engine.push_value(value, ValueItemKind::Parm);
    let top = engine.stack_top() - 1;
    assert_eq!(engine.card_stack_at(top).unwrap(), 9);
    assert!(engine.string_stack_at(top).is_err());
    engine.multi_pop(1);
    engine.free_value(value);
}
