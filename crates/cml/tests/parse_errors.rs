//! Parser diagnostics: each case feeds broken source through the engine
//! and checks that the right complaint comes back and nothing half-built
//! stays registered.

use cml::{CollectParseErrors, Engine, MemClassManager};

/// Parses one class expecting failure; returns the collected diagnostics.
fn expect_failure(path: &str, source: &str) -> CollectParseErrors {
    let mut engine = Engine::new();
    let mut manager = MemClassManager::new();
    manager.add_class(path, source);
    let mut errors = CollectParseErrors::new();
    assert!(
        engine.parse(path, &mut errors, &mut manager).is_none(),
        "parse unexpectedly succeeded"
    );
    assert!(errors.error_count() > 0);
    // a failed parse rolls its registrations back
    assert!(engine.registry().class_by_path(path).is_none());
    errors
}

fn wrap_body(path: &str, body: &str) -> String {
    format!(
        r#"
        Class=[NonFinal]
            ClassPath {path};
            ParentClass MEng.Object;
        EndClass;

        Methods=[Public,Final]
            Constructor()
            Begin
            EndConstructor;

            Method Start() Returns Int4
            Begin
                {body}
                Return 0;
            EndMethod;
        EndMethods;
        "#
    )
}

#[test]
fn unknown_member_type() {
    let source = r#"
        Class=[NonFinal]
            ClassPath MEng.User.Bad;
            ParentClass MEng.Object;
        EndClass;

        Members=
            Widget m_Thing;
        EndMembers;
    "#;
    let errors = expect_failure("MEng.User.Bad", source);
    assert!(errors.mentions("Widget"));
}

#[test]
fn missing_import_does_not_resolve() {
    let errors = expect_failure("MEng.User.Bad", &wrap_body("MEng.User.Bad", "Helper.Who();"));
    assert!(errors.mentions("Helper"));
}

#[test]
fn assignment_to_an_in_parameter() {
    let source = r#"
        Class=[NonFinal]
            ClassPath MEng.User.Bad;
            ParentClass MEng.Object;
        EndClass;

        Methods=[Public,Final]
            Constructor()
            Begin
            EndConstructor;

            Method Start([In] Card4 Given) Returns Int4
            Begin
                Given := 4;
                Return 0;
            EndMethod;
        EndMethods;
    "#;
    let errors = expect_failure("MEng.User.Bad", source);
    assert!(errors.mentions("cannot be written"));
}

#[test]
fn type_mismatch_in_assignment() {
    let source = r#"
        Class=[NonFinal]
            ClassPath MEng.User.Bad;
            ParentClass MEng.Object;
        EndClass;

        Methods=[Public,Final]
            Constructor()
            Begin
            EndConstructor;

            Method Start() Returns Int4
            Locals=
                Card4 Num;
            EndLocals;
            Begin
                Num := "text";
                Return 0;
            EndMethod;
        EndMethods;
    "#;
    let errors = expect_failure("MEng.User.Bad", source);
    assert!(errors.mentions("expected a value of class"));
}

#[test]
fn open_flow_construct_at_end_of_body() {
    let errors = expect_failure(
        "MEng.User.Bad",
        &wrap_body("MEng.User.Bad", "If (True)"),
    );
    assert!(errors.mentions("open If"));
}

#[test]
fn duplicate_member_names() {
    let source = r#"
        Class=[NonFinal]
            ClassPath MEng.User.Bad;
            ParentClass MEng.Object;
        EndClass;

        Members=
            Card4 m_Twice;
            String m_Twice;
        EndMembers;
    "#;
    let errors = expect_failure("MEng.User.Bad", source);
    assert!(errors.mentions("already used"));
}

#[test]
fn exception_reference_outside_catch() {
    let errors = expect_failure(
        "MEng.User.Bad",
        &wrap_body("MEng.User.Bad", "$Exception.GetLine();"),
    );
    assert!(errors.mentions("Catch"));
}

#[test]
fn override_with_changed_signature() {
    let base = r#"
        Class=[NonFinal]
            ClassPath MEng.User.BadBase;
            ParentClass MEng.Object;
        EndClass;

        Methods=[Public,NonFinal]
            Method Shape([In] Card4 X) Returns Card4
            Begin
                Return X;
            EndMethod;
        EndMethods;
    "#;
    let derived = r#"
        Class=[NonFinal]
            ClassPath MEng.User.BadDerived;
            ParentClass MEng.User.BadBase;
        EndClass;

        Methods=[Public,Final,Overrides]
            Method Shape([In] String X) Returns Card4
            Begin
                Return 1;
            EndMethod;
        EndMethods;
    "#;
    let mut engine = Engine::new();
    let mut manager = MemClassManager::new();
    manager.add_class("MEng.User.BadBase", base);
    manager.add_class("MEng.User.BadDerived", derived);
    let mut errors = CollectParseErrors::new();
    assert!(engine.parse("MEng.User.BadDerived", &mut errors, &mut manager).is_none());
    assert!(errors.mentions("signature"));
}

#[test]
fn final_method_cannot_be_overridden() {
    let base = r#"
        Class=[NonFinal]
            ClassPath MEng.User.SealedBase;
            ParentClass MEng.Object;
        EndClass;

        Methods=[Public,Final]
            Method Locked() Returns Card4
            Begin
                Return 1;
            EndMethod;
        EndMethods;
    "#;
    let derived = r#"
        Class=[NonFinal]
            ClassPath MEng.User.SealedDerived;
            ParentClass MEng.User.SealedBase;
        EndClass;

        Methods=[Public,Final]
            Method Locked() Returns Card4
            Begin
                Return 2;
            EndMethod;
        EndMethods;
    "#;
    let mut engine = Engine::new();
    let mut manager = MemClassManager::new();
    manager.add_class("MEng.User.SealedBase", base);
    manager.add_class("MEng.User.SealedDerived", derived);
    let mut errors = CollectParseErrors::new();
    assert!(engine.parse("MEng.User.SealedDerived", &mut errors, &mut manager).is_none());
    assert!(errors.mentions("overridden"));
}

#[test]
fn switch_requires_a_default() {
    let source = r#"
        Class=[NonFinal]
            ClassPath MEng.User.Bad;
            ParentClass MEng.Object;
        EndClass;

        Types=
            Enum=Two
                A : "a";
                B : "b";
            EndEnum;
        EndTypes;

        Methods=[Public,Final]
            Constructor()
            Begin
            EndConstructor;

            Method Start() Returns Int4
            Locals=
                Two Val;
            EndLocals;
            Begin
                Switch(Val)
                    Case Two.A :
                        Val.SetOrdinal(1);
                    EndCase;
                EndSwitch;
                Return 0;
            EndMethod;
        EndMethods;
    "#;
    let errors = expect_failure("MEng.User.Bad", source);
    assert!(errors.mentions("Default"));
}

#[test]
fn extending_a_final_class_fails() {
    let base = r#"
        Class=[Final]
            ClassPath MEng.User.Sealed;
            ParentClass MEng.Object;
        EndClass;
    "#;
    let derived = r#"
        Class=[NonFinal]
            ClassPath MEng.User.Unsealed;
            ParentClass MEng.User.Sealed;
        EndClass;
    "#;
    let mut engine = Engine::new();
    let mut manager = MemClassManager::new();
    manager.add_class("MEng.User.Sealed", base);
    manager.add_class("MEng.User.Unsealed", derived);
    let mut errors = CollectParseErrors::new();
    assert!(engine.parse("MEng.User.Unsealed", &mut errors, &mut manager).is_none());
    assert!(errors.mentions("final"));
}
