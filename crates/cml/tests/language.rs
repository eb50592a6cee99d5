//! Broader language coverage: loops, collections, operators, formatted
//! throws, inheritance calls, and output streams.

use cml::{CollectParseErrors, Engine, MemClassManager, ValueData};
use pretty_assertions::assert_eq;

fn run_one(main: &str, classes: &[(&str, &str)], args: &[&str]) -> (i32, Vec<ValueData>, Engine) {
    let mut engine = Engine::new();
    let mut manager = MemClassManager::new();
    for (path, source) in classes {
        manager.add_class(path, source);
    }
    let mut errors = CollectParseErrors::new();
    let Some(class_id) = engine.parse(main, &mut errors, &mut manager) else {
        panic!("parse of {main} failed: {:#?}", errors.events());
    };
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
fn while_loop_accumulates() {
    let source = r#"
        Class=[NonFinal]
            ClassPath MEng.User.Summer;
            ParentClass MEng.Object;
        EndClass;

        Methods=[Public,Final]
            Constructor()
            Begin
            EndConstructor;

            Method Start([Out] Card4 Total) Returns Int4
            Locals=
                Card4 Index;
            EndLocals;
            Begin
                Total := 0;
                Index := 1;
                While (Index <= 5)
                    Total += Index;
                    Index++;
                EndWhile;
                Return 0;
            EndMethod;
        EndMethods;
    "#;
    let (code, values, _) = run_one("MEng.User.Summer", &[("MEng.User.Summer", source)], &[]);
    assert_eq!(code, 0);
    assert_eq!(values[0], ValueData::Card4(15));
}

#[test]
fn do_loop_runs_at_least_once_and_break_exits() {
    let source = r#"
        Class=[NonFinal]
            ClassPath MEng.User.Looper;
            ParentClass MEng.Object;
        EndClass;

        Methods=[Public,Final]
            Constructor()
            Begin
            EndConstructor;

            Method Start([Out] Card4 Count) Returns Int4
            Begin
                Count := 0;
                DoLoop
                    Count++;
                    If (Count = 3)
                        Break;
                    EndIf;
                DoWhile (True);
                Return 0;
            EndMethod;
        EndMethods;
    "#;
    let (code, values, _) = run_one("MEng.User.Looper", &[("MEng.User.Looper", source)], &[]);
    assert_eq!(code, 0);
    assert_eq!(values[0], ValueData::Card4(3));
}

#[test]
fn for_each_visits_every_enum_value() {
    let source = r#"
        Class=[NonFinal]
            ClassPath MEng.User.Walker;
            ParentClass MEng.Object;
        EndClass;

        Types=
            Enum=Colors
                Red : "red";
                Green : "green";
                Blue : "blue";
            EndEnum;
        EndTypes;

        Methods=[Public,Final]
            Constructor()
            Begin
            EndConstructor;

            Method Start([Out] Card4 Count, [Out] String Names) Returns Int4
            Locals=
                Colors CVal;
            EndLocals;
            Begin
                Count := 0;
                ForEach(CVal)
                    Count++;
                    Names.Append(CVal.GetName());
                EndForEach;
                Return 0;
            EndMethod;
        EndMethods;
    "#;
    let (code, values, _) = run_one("MEng.User.Walker", &[("MEng.User.Walker", source)], &[]);
    assert_eq!(code, 0);
    assert_eq!(values[0], ValueData::Card4(3));
    assert_eq!(values[1], ValueData::String("RedGreenBlue".into()));
}

#[test]
fn arrays_and_vectors_index_by_reference() {
    let source = r#"
        Class=[NonFinal]
            ClassPath MEng.User.Collector;
            ParentClass MEng.Object;
        EndClass;

        Types=
            ArrayOf[MEng.Card4, 4] CardArr;
            VectorOf[MEng.String] StrVec;
        EndTypes;

        Members=
            CardArr m_Slots;
            StrVec m_Names;
        EndMembers;

        Methods=[Public,Final]
            Constructor()
            Begin
            EndConstructor;

            Method Start([Out] Card4 Third, [Out] String First, [Out] Card4 NameCount) Returns Int4
            Begin
                m_Slots[0] := 5;
                m_Slots[2] := m_Slots[0] + 2;
                Third := m_Slots[2];

                m_Names.AddObject("alpha");
                m_Names.AddObject("beta");
                m_Names[0].Append("!");
                First := m_Names[0];
                NameCount := m_Names.ElemCount();
                Return 0;
            EndMethod;
        EndMethods;
    "#;
    let (code, values, _) = run_one("MEng.User.Collector", &[("MEng.User.Collector", source)], &[]);
    assert_eq!(code, 0);
    assert_eq!(values[0], ValueData::Card4(7));
    // writes through the indexed handle reached the stored element
    assert_eq!(values[1], ValueData::String("alpha!".into()));
    assert_eq!(values[2], ValueData::Card4(2));
}

#[test]
fn short_circuit_skips_the_right_side() {
    // dividing by zero on the right side would throw; the false left side
    // must keep it from ever running
    let source = r#"
        Class=[NonFinal]
            ClassPath MEng.User.Shorty;
            ParentClass MEng.Object;
        EndClass;

        Methods=[Public,Final]
            Constructor()
            Begin
            EndConstructor;

            Method Start([In] Card4 Denom, [Out] String Res) Returns Int4
            Locals=
                Card4 Ten;
            EndLocals;
            Begin
                Ten := 10;
                If ((Denom != 0) && ((Ten / Denom) > 1))
                    Res := "big";
                Else
                    Res := "safe";
                EndIf;
                Return 0;
            EndMethod;
        EndMethods;
    "#;
    let classes = [("MEng.User.Shorty", source)];
    let (code, values, _) = run_one("MEng.User.Shorty", &classes, &["0"]);
    assert_eq!(code, 0);
    assert_eq!(values[1], ValueData::String("safe".into()));

    let (code, values, _) = run_one("MEng.User.Shorty", &classes, &["2"]);
    assert_eq!(code, 0);
    assert_eq!(values[1], ValueData::String("big".into()));
}

#[test]
fn throw_fmt_substitutes_tokens() {
    let source = r#"
        Class=[NonFinal]
            ClassPath MEng.User.Fmt;
            ParentClass MEng.Object;
        EndClass;

        Types=
            Enum=FmtErrs
                BadValue : "value %(1) is past the limit %(2)";
            EndEnum;
        EndTypes;

        Methods=[Public,Final]
            Constructor()
            Begin
            EndConstructor;

            Method Start([Out] String Msg) Returns Int4
            Locals=
                Card4 Val(99);
                Card4 Limit(10);
            EndLocals;
            Begin
                Try
                    Throw(FmtErrs.BadValue, Val, Limit);
                Catch
                    Msg := $Exception.GetErrorText();
                EndTry;
                Return 0;
            EndMethod;
        EndMethods;
    "#;
    let (code, values, _) = run_one("MEng.User.Fmt", &[("MEng.User.Fmt", source)], &[]);
    assert_eq!(code, 0);
    assert_eq!(values[0], ValueData::String("value 99 is past the limit 10".into()));
}

#[test]
fn rethrow_preserves_the_original_location() {
    let source = r#"
        Class=[NonFinal]
            ClassPath MEng.User.Rethrower;
            ParentClass MEng.Object;
        EndClass;

        Types=
            Enum=Errs
                Inner : "inner failure";
            EndEnum;
        EndTypes;

        Methods=[Public,Final]
            Constructor()
            Begin
            EndConstructor;

            Method Boom() Returns Void
            Begin
                Throw(Errs.Inner);
            EndMethod;

            Method Start([Out] String Msg) Returns Int4
            Begin
                Try
                    Try
                        This.Boom();
                    Catch
                        Rethrow;
                    EndTry;
                Catch
                    Msg := $Exception.GetErrorName();
                EndTry;
                Return 0;
            EndMethod;
        EndMethods;
    "#;
    let (code, values, engine) = run_one("MEng.User.Rethrower", &[("MEng.User.Rethrower", source)], &[]);
    assert_eq!(code, 0);
    assert_eq!(values[0], ValueData::String("Inner".into()));
    assert_eq!(engine.last_exception().class_path, "MEng.User.Rethrower");
}

#[test]
fn parent_call_reaches_the_overridden_body() {
    let base = r#"
        Class=[NonFinal]
            ClassPath MEng.User.Greeter;
            ParentClass MEng.Object;
        EndClass;

        Methods=[Public,Final]
            Constructor()
            Begin
            EndConstructor;
        EndMethods;

        Methods=[Public,NonFinal]
            Method Greeting() Returns String
            Begin
                Return "hello";
            EndMethod;
        EndMethods;
    "#;
    let derived = r#"
        Class=[NonFinal]
            ClassPath MEng.User.LoudGreeter;
            ParentClass MEng.User.Greeter;
        EndClass;

        Methods=[Public,Final]
            Constructor()
            Begin
            EndConstructor;

            Method Start([Out] String Res) Returns Int4
            Begin
                Res := This.Greeting();
                Return 0;
            EndMethod;
        EndMethods;

        Methods=[Public,Final,Overrides]
            Method Greeting() Returns String
            Locals=
                String Base;
            EndLocals;
            Begin
                Base := Parent.Greeting();
                Base.Append("!");
                Return Base;
            EndMethod;
        EndMethods;
    "#;
    let classes = [("MEng.User.Greeter", base), ("MEng.User.LoudGreeter", derived)];
    let (code, values, _) = run_one("MEng.User.LoudGreeter", &classes, &[]);
    assert_eq!(code, 0);
    assert_eq!(values[0], ValueData::String("hello!".into()));
}

#[test]
fn string_stream_collects_printed_values() {
    let source = r#"
        Class=[NonFinal]
            ClassPath MEng.User.Printer;
            ParentClass MEng.Object;
        EndClass;

        Members=
            StringOutStream m_Out;
        EndMembers;

        Methods=[Public,Final]
            Constructor()
            Begin
            EndConstructor;

            Method Start([Out] String Res) Returns Int4
            Begin
                m_Out.Print("count=");
                m_Out.Print(42);
                m_Out.NewLine();
                Res := m_Out.GetText();
                Return 0;
            EndMethod;
        EndMethods;
    "#;
    let (code, values, _) = run_one("MEng.User.Printer", &[("MEng.User.Printer", source)], &[]);
    assert_eq!(code, 0);
    assert_eq!(values[0], ValueData::String("count=42\n".into()));
}

#[test]
fn literals_and_member_initializers_apply() {
    let source = r#"
        Class=[NonFinal]
            ClassPath MEng.User.Inits;
            ParentClass MEng.Object;
        EndClass;

        Literals=
            Card4 kLimit(12);
            String kTag("tagged");
        EndLiterals;

        Members=
            Card4 m_Start(5);
            Const Card4 m_Fixed(7);
        EndMembers;

        Methods=[Public,Final]
            Constructor()
            Begin
            EndConstructor;

            Method Start([Out] Card4 Sum, [Out] String Tag) Returns Int4
            Begin
                Sum := m_Start + m_Fixed + kLimit;
                Tag := kTag;
                Return 0;
            EndMethod;
        EndMethods;
    "#;
    let (code, values, _) = run_one("MEng.User.Inits", &[("MEng.User.Inits", source)], &[]);
    assert_eq!(code, 0);
    assert_eq!(values[0], ValueData::Card4(24));
    assert_eq!(values[1], ValueData::String("tagged".into()));
}

#[test]
fn in_out_parameters_update_in_place() {
    let source = r#"
        Class=[NonFinal]
            ClassPath MEng.User.Doubler;
            ParentClass MEng.Object;
        EndClass;

        Methods=[Public,Final]
            Constructor()
            Begin
            EndConstructor;

            Method DoubleIt([InOut] Card4 Val) Returns Void
            Begin
                Val := Val * 2;
            EndMethod;

            Method Start([InOut] Card4 Num) Returns Int4
            Begin
                This.DoubleIt(Num);
                This.DoubleIt(Num);
                Return 0;
            EndMethod;
        EndMethods;
    "#;
    let (code, values, _) = run_one("MEng.User.Doubler", &[("MEng.User.Doubler", source)], &["3"]);
    assert_eq!(code, 0);
    assert_eq!(values[0], ValueData::Card4(12));
}
