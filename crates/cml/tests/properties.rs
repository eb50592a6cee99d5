//! Quantified engine properties: registry agreement, deterministic
//! recompilation, snapshot round-trips, pool dedup, and capacity limits.

use cml::{
    CollectParseErrors, ClassInfo, ClassExt, Engine, MemClassManager, MethodImpl, NativeError, OptLevel, ValueData,
};
use pretty_assertions::assert_eq;

const SAMPLE: &str = r#"
    Class=[NonFinal]
        ClassPath MEng.User.Sample;
        ParentClass MEng.Object;
    EndClass;

    Types=
        Enum=Moods
            Calm : "calm";
            Cross : "cross";
        EndEnum;
    EndTypes;

    Members=
        Card4 m_Count;
        String m_Tag;
    EndMembers;

    Methods=[Public,Final]
        Constructor()
        Begin
        EndConstructor;

        Method Bump([In] Card4 By) Returns Card4
        Begin
            m_Count := m_Count + By;
            Return m_Count;
        EndMethod;

        Method Start([Out] Card4 Result) Returns Int4
        Locals=
            Card4 Index;
        EndLocals;
        Begin
            Index := 0;
            While (Index < 4)
                Result := This.Bump(Index);
                Index++;
            EndWhile;
            Return 0;
        EndMethod;
    EndMethods;
"#;

fn parse_sample(engine: &mut Engine) -> u16 {
    let mut manager = MemClassManager::new();
    manager.add_class("MEng.User.Sample", SAMPLE);
    let mut errors = CollectParseErrors::new();
    engine
        .parse("MEng.User.Sample", &mut errors, &mut manager)
        .unwrap_or_else(|| panic!("sample failed to parse: {:#?}", errors.events()))
}

#[test]
fn path_and_id_lookup_agree_for_every_class() {
    let mut engine = Engine::new();
    parse_sample(&mut engine);
    for class in engine.registry().classes() {
        let by_path = engine.registry().class_by_path(class.class_path()).unwrap();
        let by_id = engine.registry().class_by_id(by_path.id()).unwrap();
        assert_eq!(by_id.class_path(), class.class_path());
    }
}

#[test]
fn method_ids_resolve_back_to_their_names() {
    let mut engine = Engine::new();
    let id = parse_sample(&mut engine);
    let class = engine.registry().class_by_id(id).unwrap();
    for method in class.methods() {
        assert_eq!(class.method(method.id()).unwrap().name(), method.name());
    }
    // own methods sit at or past the inherited/own split
    let bump = class.find_method("Bump").unwrap();
    assert!(bump.id() >= class.first_method_id());
}

/// Compiling the same source twice yields byte-identical opcode listings.
#[test]
fn reparse_produces_identical_listings() {
    let listings = |engine: &Engine, id: u16| -> Vec<String> {
        engine
            .registry()
            .class_by_id(id)
            .unwrap()
            .impls()
            .iter()
            .filter_map(|found| match found {
                MethodImpl::Ops(body) => Some(body.listing()),
                MethodImpl::Native { .. } => None,
            })
            .collect()
    };

    let mut first = Engine::new();
    let first_id = parse_sample(&mut first);
    let mut second = Engine::new();
    let second_id = parse_sample(&mut second);

    assert_eq!(first_id, second_id);
    assert_eq!(listings(&first, first_id), listings(&second, second_id));
}

#[test]
fn registry_snapshot_restores_runnable_classes() {
    let mut source_engine = Engine::new();
    parse_sample(&mut source_engine);
    let bytes = source_engine.dump_classes().unwrap();

    let mut engine = Engine::new();
    engine.load_classes(&bytes).unwrap();
    let class_id = engine.registry().class_by_path("MEng.User.Sample").unwrap().id();

    let instance = engine.make_storage("MEng.User.Sample", false).unwrap();
    engine.invoke_default_ctor(instance).unwrap();
    let method = engine.find_entry_point(class_id).unwrap();
    let parms = engine.create_parm_values(class_id, method, &[]).unwrap();
    let code = engine.run(instance, &parms);
    assert_eq!(code, 0);
    // 0 + 1 + 2 + 3 accumulated through the member
    assert_eq!(engine.value_data(parms[0]), &ValueData::Card4(6));

    // a double load would collide with the restored ids
    assert!(engine.load_classes(&bytes).is_err());
}

#[test]
fn string_pool_dedup_is_an_optimization_level_effect() {
    let source = r#"
        Class=[NonFinal]
            ClassPath MEng.User.Pools;
            ParentClass MEng.Object;
        EndClass;

        Methods=[Public,Final]
            Constructor()
            Begin
            EndConstructor;

            Method Start([Out] String Res) Returns Int4
            Begin
                Res := "same";
                Res := "same";
                Res := "other";
                Return 0;
            EndMethod;
        EndMethods;
    "#;
    let pool_count = |opt: OptLevel| -> usize {
        let mut engine = Engine::new();
        engine.set_opt_level(opt);
        let mut manager = MemClassManager::new();
        manager.add_class("MEng.User.Pools", source);
        let mut errors = CollectParseErrors::new();
        let id = engine.parse("MEng.User.Pools", &mut errors, &mut manager).unwrap();
        engine
            .registry()
            .class_by_id(id)
            .unwrap()
            .impls()
            .iter()
            .find_map(|found| match found {
                MethodImpl::Ops(body) if body.string_count() > 0 => Some(body.string_count()),
                _ => None,
            })
            .unwrap()
    };

    assert_eq!(pool_count(OptLevel::Minimal), 3);
    assert_eq!(pool_count(OptLevel::Medium), 2);
}

#[test]
fn class_id_space_is_capped_at_the_sixteen_bit_limit() {
    let mut engine = Engine::new();
    let mut last = Ok(0);
    for ix in 0..u32::from(u16::MAX) {
        let class = ClassInfo::new(&format!("Filler{ix}"), "MEng.User", "MEng.Object", true, ClassExt::NonFinal);
        last = engine.register_class(class);
        if last.is_err() {
            break;
        }
    }
    assert!(matches!(last, Err(NativeError::Capacity("class"))));
}
