//! The single-pass macro class parser/compiler.
//!
//! One pass does everything: lexing, name resolution, and opcode emission
//! straight into method bodies, with a flow stack tracking open constructs
//! for back-patching. Imports trigger recursive parses through the class
//! manager; a stack of in-flight class paths turns import cycles into a
//! diagnostic instead of a hang.
//!
//! Diagnostics accumulate through the installed handler. Where recovery is
//! possible the parser resyncs to the next statement terminator and keeps
//! going; the parse as a whole fails if any error was emitted, and the
//! engine rolls back every class the failed parse registered.

mod expr;
mod flow;
mod lexer;
mod stmt;

use std::rc::Rc;

pub(crate) use flow::{FlowItem, FlowKind, FlowStack};
pub(crate) use lexer::{Kw, Lexed, Lexer, NumLit, Token};

use crate::{
    class::{ClassInfo, ClassKind, EnumItem, LiteralValue},
    engine::Engine,
    error::NativeError,
    handlers::{ParseErrorHandler, ParseEventKind},
    manager::{ClassManager, ResMode},
    method::{MethodBody, MethodImpl, MethodInfo, ParmInfo},
    types::{self, BAD_ID, ClassExt, ClassId, ClassMatch, Intrinsic, MethodExt, OptLevel, ParmDir, Recover, Visibility},
    value::ValueData,
};

/// Reserved root of every class path.
pub const CLASS_ROOT: &str = "MEng";

/// Per-class parse state.
pub(crate) struct Unit {
    lexer: Lexer,
    pub class_path: String,
    pub own_id: ClassId,
    /// Position of the most recently consumed token.
    pub line: u32,
    pub col: u32,
    pub flow: FlowStack,
}

impl Unit {
    fn new(class_path: &str, source: &str) -> Self {
        Self {
            lexer: Lexer::new(source),
            class_path: class_path.to_owned(),
            own_id: BAD_ID,
            line: 1,
            col: 1,
            flow: FlowStack::new(),
        }
    }
}

/// State for the method body currently being compiled.
pub(crate) struct MethodCtx {
    pub body: MethodBody,
    pub ret_class: ClassId,
    pub parms: Vec<ParmInfo>,
    pub is_ctor: bool,
    /// Whether the method is const (members are read-only inside it).
    pub is_const: bool,
    /// Which end keyword closes this body.
    pub end_kw: Kw,
}

/// The parser. One instance drives one top-level parse, including the
/// recursive parses its imports trigger.
pub(crate) struct Parser<'a> {
    pub(crate) engine: &'a mut Engine,
    errors: &'a mut dyn ParseErrorHandler,
    manager: &'a mut dyn ClassManager,
    parse_stack: Vec<String>,
    error_count: usize,
}

impl<'a> Parser<'a> {
    pub(crate) fn new(
        engine: &'a mut Engine,
        errors: &'a mut dyn ParseErrorHandler,
        manager: &'a mut dyn ClassManager,
    ) -> Self {
        Self {
            engine,
            errors,
            manager,
            parse_stack: Vec::new(),
            error_count: 0,
        }
    }

    /// Loads and parses a class by path, recursing through imports.
    pub(crate) fn parse_class(&mut self, class_path: &str) -> Option<ClassId> {
        if self.parse_stack.iter().any(|p| p == class_path) {
            self.errors.event(
                ParseEventKind::Error,
                &format!("circular dependency: '{class_path}' is already being parsed"),
                0,
                0,
                class_path,
            );
            self.error_count += 1;
            return None;
        }
        if let Ok(id) = self.engine.registry.find_class_id(class_path) {
            return Some(id);
        }
        if let Some(class) = self.engine.load_external_class(class_path) {
            return match self.engine.registry.add_class(class) {
                Ok(id) => Some(id),
                Err(err) => {
                    self.errors.native_exception(&err, 0, 0, class_path);
                    self.error_count += 1;
                    None
                }
            };
        }
        let source = match self.manager.load(class_path, ResMode::ReadOnly) {
            Ok(source) => source,
            Err(err) => {
                self.errors.native_exception(&err, 0, 0, class_path);
                self.error_count += 1;
                return None;
            }
        };
        self.parse_stack.push(class_path.to_owned());
        let result = self.parse_source(class_path, &source);
        self.parse_stack.pop();
        result
    }

    fn parse_source(&mut self, class_path: &str, source: &str) -> Option<ClassId> {
        let errors_before = self.error_count;
        let mut u = Unit::new(class_path, source);
        self.parse_header(&mut u)?;
        loop {
            let lexed = self.next(&mut u);
            match lexed.token {
                Token::Eof => break,
                Token::Kw(Kw::Directives) => self.parse_directives(&mut u),
                Token::Kw(Kw::Imports) => self.parse_imports(&mut u),
                Token::Kw(Kw::Types) => self.parse_types(&mut u),
                Token::Kw(Kw::Literals) => self.parse_literals(&mut u),
                Token::Kw(Kw::Members) => self.parse_members(&mut u),
                Token::Kw(Kw::Methods) => self.parse_methods_block(&mut u),
                other => {
                    self.error(&u, &format!("expected a class section, found {}", other.describe()));
                    break;
                }
            }
        }
        (self.error_count == errors_before).then_some(u.own_id)
    }

    // ----- header ----------------------------------------------------------

    /// `Class=[ext]; ClassPath p; ParentClass p; EndClass;` — loads the
    /// parent and registers this class so later sections can reference it.
    fn parse_header(&mut self, u: &mut Unit) -> Option<()> {
        if !self.expect(u, &Token::Kw(Kw::Class), "the Class section") {
            return None;
        }
        self.expect(u, &Token::Equal, "'=' after Class");
        let ext = self.parse_class_attrs(u);

        self.expect(u, &Token::Kw(Kw::ClassPath), "ClassPath");
        let declared = self.parse_dotted_name(u)?;
        if declared != u.class_path {
            self.error(
                u,
                &format!("class declares path '{declared}' but was loaded as '{}'", u.class_path),
            );
        }
        self.expect_semi(u);

        self.expect(u, &Token::Kw(Kw::ParentClass), "ParentClass");
        let parent_path = self.parse_dotted_name(u)?;
        self.expect_semi(u);
        self.expect(u, &Token::Kw(Kw::EndClass), "EndClass");
        self.expect_semi(u);

        if !self.ensure_loaded(u, &parent_path) {
            return None;
        }
        let parent = self.engine.registry.class_by_path(&parent_path)?;
        if parent.ext() == ClassExt::Final {
            self.error(u, &format!("'{parent_path}' is final and cannot be extended"));
            return None;
        }

        let Some((base, name)) = u.class_path.rsplit_once('.') else {
            self.error(u, "a class path needs at least two segments");
            return None;
        };
        if !u.class_path.starts_with(&format!("{CLASS_ROOT}.")) {
            self.error(u, &format!("class paths are rooted at '{CLASS_ROOT}'"));
            return None;
        }
        let class = ClassInfo::new(name, base, &parent_path, true, ext);
        match self.engine.registry.add_class_deferred(class) {
            Ok(id) => {
                if let Err(err) = self.engine.registry.complete_deferred(id) {
                    self.native_error(u, &err);
                    return None;
                }
                u.own_id = id;
                Some(())
            }
            Err(err) => {
                self.native_error(u, &err);
                None
            }
        }
    }

    fn parse_class_attrs(&mut self, u: &mut Unit) -> ClassExt {
        let mut ext = ClassExt::NonFinal;
        if self.peek(u) != Token::OpenBracket {
            return ext;
        }
        self.next(u);
        loop {
            match self.next(u).token {
                Token::Kw(Kw::Final) => ext = ClassExt::Final,
                Token::Kw(Kw::NonFinal) => ext = ClassExt::NonFinal,
                Token::Kw(Kw::Abstract) => ext = ClassExt::Abstract,
                other => {
                    self.error(u, &format!("expected a class attribute, found {}", other.describe()));
                    break;
                }
            }
            match self.next(u).token {
                Token::Comma => {}
                Token::CloseBracket => break,
                other => {
                    self.error(u, &format!("expected ',' or ']', found {}", other.describe()));
                    break;
                }
            }
        }
        ext
    }

    // ----- simple sections -------------------------------------------------

    fn parse_directives(&mut self, u: &mut Unit) {
        self.expect(u, &Token::Equal, "'=' after Directives");
        loop {
            match self.next(u).token {
                Token::Kw(Kw::EndDirectives) => break,
                Token::Ident(key) => {
                    self.expect(u, &Token::Equal, "'=' after a directive key");
                    match self.next(u).token {
                        Token::Str(value) => {
                            self.own_mut(u).add_directive(&key, &value);
                        }
                        other => self.error(u, &format!("directive values are strings, found {}", other.describe())),
                    }
                    self.expect_semi(u);
                }
                Token::Eof => {
                    self.error(u, "source ends inside the Directives section");
                    return;
                }
                other => {
                    self.error(u, &format!("expected a directive key, found {}", other.describe()));
                    self.recover_to_semi(u);
                }
            }
        }
        self.expect_semi(u);
    }

    fn parse_imports(&mut self, u: &mut Unit) {
        self.expect(u, &Token::Equal, "'=' after Imports");
        loop {
            match self.next(u).token {
                Token::Kw(Kw::EndImports) => break,
                Token::Ident(first) => {
                    let Some(path) = self.parse_dotted_from(u, first) else {
                        self.recover_to_semi(u);
                        continue;
                    };
                    self.expect_semi(u);
                    if !self.ensure_loaded(u, &path) {
                        continue;
                    }
                    if !self.own_mut(u).add_import(&path, false) {
                        self.error(u, &format!("'{path}' is already imported"));
                        continue;
                    }
                    // an import brings the imported class's nested types in
                    // with it
                    let nested: Vec<String> = self
                        .engine
                        .registry
                        .class_by_path(&path)
                        .map(|c| c.nested_types().map(str::to_owned).collect())
                        .unwrap_or_default();
                    for nested_path in nested {
                        self.own_mut(u).add_import(&nested_path, true);
                    }
                }
                Token::Eof => {
                    self.error(u, "source ends inside the Imports section");
                    return;
                }
                other => {
                    self.error(u, &format!("expected a class path, found {}", other.describe()));
                    self.recover_to_semi(u);
                }
            }
        }
        self.expect_semi(u);
    }

    // ----- nested types ----------------------------------------------------

    fn parse_types(&mut self, u: &mut Unit) {
        self.expect(u, &Token::Equal, "'=' after Types");
        loop {
            match self.next(u).token {
                Token::Kw(Kw::EndTypes) => break,
                Token::Kw(Kw::Enum) => self.parse_enum_type(u),
                Token::Kw(Kw::ArrayOf) => self.parse_collection_type(u, true),
                Token::Kw(Kw::VectorOf) => self.parse_collection_type(u, false),
                Token::Eof => {
                    self.error(u, "source ends inside the Types section");
                    return;
                }
                other => {
                    self.error(u, &format!("expected a nested type, found {}", other.describe()));
                    self.recover_to_semi(u);
                }
            }
        }
        self.expect_semi(u);
    }

    /// `Enum=Name  Item : "text"; ...  EndEnum;`
    fn parse_enum_type(&mut self, u: &mut Unit) {
        self.expect(u, &Token::Equal, "'=' after Enum");
        let Some(name) = self.expect_ident(u) else {
            self.recover_to_semi(u);
            return;
        };
        let mut items: Vec<EnumItem> = Vec::new();
        loop {
            match self.next(u).token {
                Token::Kw(Kw::EndEnum) => break,
                Token::Ident(item_name) => {
                    if items.iter().any(|i| i.name == item_name) {
                        self.error(u, &format!("enum value '{item_name}' is already defined"));
                    }
                    let mut text = String::new();
                    let mut map_val = items.len() as u32;
                    if self.peek(u) == Token::Colon {
                        self.next(u);
                        match self.next(u).token {
                            Token::Str(s) => text = s,
                            other => self.error(u, &format!("expected the value text, found {}", other.describe())),
                        }
                        if self.peek(u) == Token::Comma {
                            self.next(u);
                            match self.next(u).token {
                                Token::Num(NumLit::Int { value, .. }) => map_val = value as u32,
                                other => {
                                    self.error(u, &format!("expected a numeric mapping, found {}", other.describe()));
                                }
                            }
                        }
                    }
                    self.expect_semi(u);
                    items.push(EnumItem {
                        name: item_name,
                        text,
                        map_val,
                    });
                }
                Token::Eof => {
                    self.error(u, "source ends inside an Enum definition");
                    return;
                }
                other => {
                    self.error(u, &format!("expected an enum value name, found {}", other.describe()));
                    self.recover_to_semi(u);
                }
            }
        }
        self.expect_semi(u);
        if items.is_empty() {
            self.error(u, &format!("enum '{name}' defines no values"));
            return;
        }
        let mut class = ClassInfo::new(&name, &u.class_path.clone(), "MEng.Enum", true, ClassExt::Final);
        class.set_kind(ClassKind::Enum(items));
        self.register_nested(u, class);
    }

    /// `ArrayOf[Type,Size] Name;` / `VectorOf[Type] Name;`
    fn parse_collection_type(&mut self, u: &mut Unit, is_array: bool) {
        self.expect(u, &Token::OpenBracket, "'['");
        let Some(elem) = self.parse_type_name(u) else {
            self.recover_to_semi(u);
            return;
        };
        let kind = if is_array {
            self.expect(u, &Token::Comma, "',' before the array size");
            let size = match self.next(u).token {
                Token::Num(NumLit::Int { value, .. }) if value > 0 => value as u32,
                other => {
                    self.error(u, &format!("expected a positive array size, found {}", other.describe()));
                    self.recover_to_semi(u);
                    return;
                }
            };
            ClassKind::Array { elem, size }
        } else {
            ClassKind::Vector { elem }
        };
        self.expect(u, &Token::CloseBracket, "']'");
        let Some(name) = self.expect_ident(u) else {
            self.recover_to_semi(u);
            return;
        };
        self.expect_semi(u);
        let copyable = self.engine.registry.is_copyable(elem);
        let mut class = ClassInfo::new(&name, &u.class_path.clone(), "MEng.Object", copyable, ClassExt::Final);
        let growable = matches!(kind, ClassKind::Vector { .. });
        class.set_kind(kind);
        // methods land after registration, which completes the parent link
        if let Some(id) = self.register_nested(u, class) {
            if let Ok(registered) = self.engine.registry.class_by_id_mut(id) {
                crate::intrinsics::collection_methods(registered, elem, growable);
            }
        }
    }

    fn register_nested(&mut self, u: &mut Unit, class: ClassInfo) -> Option<ClassId> {
        let path = class.class_path().to_owned();
        if self.engine.registry.is_loaded(&path) {
            self.error(u, &format!("nested type '{path}' is already defined"));
            return None;
        }
        match self.engine.registry.add_class(class) {
            Ok(id) => {
                let own = self.own_mut(u);
                own.add_nested(&path);
                own.add_import(&path, true);
                Some(id)
            }
            Err(err) => {
                self.native_error(u, &err);
                None
            }
        }
    }

    // ----- literals and members --------------------------------------------

    /// `Type Name(value);` entries until EndLiterals.
    fn parse_literals(&mut self, u: &mut Unit) {
        self.expect(u, &Token::Equal, "'=' after Literals");
        loop {
            match self.next(u).token {
                Token::Kw(Kw::EndLiterals) => break,
                Token::Ident(type_name) => {
                    let Some(class_id) = self.resolve_type_or_err(u, &type_name) else {
                        self.recover_to_semi(u);
                        continue;
                    };
                    let Some(name) = self.expect_ident(u) else {
                        self.recover_to_semi(u);
                        continue;
                    };
                    self.expect(u, &Token::OpenParen, "'(' before the literal value");
                    let Some(data) = self.parse_literal_value(u, class_id) else {
                        self.recover_to_semi(u);
                        continue;
                    };
                    self.expect(u, &Token::CloseParen, "')'");
                    self.expect_semi(u);
                    let literal = LiteralValue {
                        name: name.clone(),
                        class_id,
                        data,
                    };
                    if !self.own_mut(u).add_literal(literal) {
                        self.error(u, &format!("literal '{name}' is already defined"));
                    }
                }
                Token::Eof => {
                    self.error(u, "source ends inside the Literals section");
                    return;
                }
                other => {
                    self.error(u, &format!("expected a literal declaration, found {}", other.describe()));
                    self.recover_to_semi(u);
                }
            }
        }
        self.expect_semi(u);
    }

    /// One literal token of a fundamental class, as used by literal and
    /// initializer positions.
    fn parse_literal_value(&mut self, u: &mut Unit, class_id: ClassId) -> Option<ValueData> {
        let lexed = self.next(u);
        let data = match (lexed.token, Intrinsic::from_id(class_id)) {
            (Token::Str(s), Some(Intrinsic::String)) => ValueData::String(s),
            (Token::CharLit(c), Some(Intrinsic::Char)) => ValueData::Char(c),
            (Token::Kw(Kw::True), Some(Intrinsic::Boolean)) => ValueData::Boolean(true),
            (Token::Kw(Kw::False), Some(Intrinsic::Boolean)) => ValueData::Boolean(false),
            (Token::Num(num), Some(intrinsic)) if types::is_numeric(class_id) => {
                let data = match num {
                    NumLit::Int { value, suffix } => {
                        if suffix.is_some_and(|s| s != intrinsic) {
                            self.error(u, "the literal's suffix does not match its declared type");
                        }
                        ValueData::from_i128(intrinsic, value)
                    }
                    NumLit::Float { value, suffix } => {
                        if suffix.is_some_and(|s| s != intrinsic) {
                            self.error(u, "the literal's suffix does not match its declared type");
                        }
                        match intrinsic {
                            Intrinsic::Float4 => Some(ValueData::Float4(value as f32)),
                            Intrinsic::Float8 => Some(ValueData::Float8(value)),
                            _ => None,
                        }
                    }
                };
                match data {
                    Some(data) => data,
                    None => {
                        self.error(u, "the value does not fit the declared type");
                        return None;
                    }
                }
            }
            (Token::Subtract, Some(intrinsic)) if types::is_integer(class_id) || types::is_float(class_id) => {
                // negative numeric literal
                match self.next(u).token {
                    Token::Num(NumLit::Int { value, .. }) => match ValueData::from_i128(intrinsic, -value) {
                        Some(data) => data,
                        None => {
                            self.error(u, "the value does not fit the declared type");
                            return None;
                        }
                    },
                    Token::Num(NumLit::Float { value, .. }) => match intrinsic {
                        Intrinsic::Float4 => ValueData::Float4(-value as f32),
                        _ => ValueData::Float8(-value),
                    },
                    other => {
                        self.error(u, &format!("expected a numeric literal, found {}", other.describe()));
                        return None;
                    }
                }
            }
            (other, _) => {
                self.error(
                    u,
                    &format!("the value does not match the declared type, found {}", other.describe()),
                );
                return None;
            }
        };
        Some(data)
    }

    /// `[Const] Type Name[(init)];` entries until EndMembers.
    fn parse_members(&mut self, u: &mut Unit) {
        self.expect(u, &Token::Equal, "'=' after Members");
        loop {
            let mut is_const = false;
            let lexed = self.next(u);
            let type_name = match lexed.token {
                Token::Kw(Kw::EndMembers) => break,
                Token::Kw(Kw::Const) => {
                    is_const = true;
                    match self.next(u).token {
                        Token::Ident(name) => name,
                        other => {
                            self.error(u, &format!("expected a member type, found {}", other.describe()));
                            self.recover_to_semi(u);
                            continue;
                        }
                    }
                }
                Token::Ident(name) => name,
                Token::Eof => {
                    self.error(u, "source ends inside the Members section");
                    return;
                }
                other => {
                    self.error(u, &format!("expected a member declaration, found {}", other.describe()));
                    self.recover_to_semi(u);
                    continue;
                }
            };
            let Some(class_id) = self.resolve_type_or_err(u, &type_name) else {
                self.recover_to_semi(u);
                continue;
            };
            let Some(name) = self.expect_ident(u) else {
                self.recover_to_semi(u);
                continue;
            };
            let mut init = None;
            if self.peek(u) == Token::OpenParen {
                if !types::is_numeric(class_id) && !matches!(
                    Intrinsic::from_id(class_id),
                    Some(Intrinsic::Boolean | Intrinsic::Char | Intrinsic::String)
                ) {
                    self.error(u, "only fundamental members take a literal initializer");
                }
                self.next(u);
                init = self.parse_literal_value(u, class_id);
                self.expect(u, &Token::CloseParen, "')'");
            }
            self.expect_semi(u);

            if self.dup_name(u, &name) {
                self.error(u, &format!("'{name}' is already used in this class"));
                continue;
            }
            if !self.engine.registry.is_copyable(class_id) {
                self.own_mut(u).set_copyable(false);
            }
            if let Err(err) = self.own_mut(u).add_member(&name, class_id, is_const, init) {
                self.native_error(u, &err);
            }
        }
        self.expect_semi(u);
    }

    // ----- methods ---------------------------------------------------------

    fn parse_methods_block(&mut self, u: &mut Unit) {
        self.expect(u, &Token::Equal, "'=' after Methods");
        let attrs = self.parse_method_attrs(u);
        loop {
            match self.next(u).token {
                Token::Kw(Kw::EndMethods) => break,
                Token::Kw(Kw::Method) => self.parse_method(u, &attrs),
                Token::Kw(Kw::Constructor) => self.parse_ctor(u, &attrs),
                Token::Kw(Kw::Destructor) => self.parse_dtor(u, &attrs),
                Token::Eof => {
                    self.error(u, "source ends inside a Methods section");
                    return;
                }
                other => {
                    self.error(u, &format!("expected a method, found {}", other.describe()));
                    self.recover_to_semi(u);
                }
            }
        }
        self.expect_semi(u);
    }

    fn parse_method_attrs(&mut self, u: &mut Unit) -> MethodAttrs {
        let mut attrs = MethodAttrs::default();
        if self.peek(u) != Token::OpenBracket {
            return attrs;
        }
        self.next(u);
        loop {
            match self.next(u).token {
                Token::Kw(Kw::Public) => attrs.visibility = Visibility::Public,
                Token::Kw(Kw::Private) => attrs.visibility = Visibility::Private,
                Token::Kw(Kw::Final) => attrs.ext = MethodExt::Final,
                Token::Kw(Kw::NonFinal) => attrs.ext = MethodExt::NonFinal,
                Token::Kw(Kw::Required) => attrs.ext = MethodExt::Required,
                Token::Kw(Kw::Const) => attrs.is_const = true,
                Token::Kw(Kw::NonConst) => attrs.is_const = false,
                Token::Kw(Kw::Overrides) => attrs.overrides = true,
                other => {
                    self.error(u, &format!("expected a method attribute, found {}", other.describe()));
                    break;
                }
            }
            match self.next(u).token {
                Token::Comma => {}
                Token::CloseBracket => break,
                other => {
                    self.error(u, &format!("expected ',' or ']', found {}", other.describe()));
                    break;
                }
            }
        }
        attrs
    }

    /// `([In] Type Name, ...)`
    fn parse_parm_list(&mut self, u: &mut Unit, method: &mut MethodInfo) {
        self.expect(u, &Token::OpenParen, "'('");
        if self.peek(u) == Token::CloseParen {
            self.next(u);
            return;
        }
        loop {
            let mut dir = ParmDir::In;
            if self.peek(u) == Token::OpenBracket {
                self.next(u);
                match self.next(u).token {
                    Token::Kw(Kw::In) => dir = ParmDir::In,
                    Token::Kw(Kw::Out) => dir = ParmDir::Out,
                    Token::Kw(Kw::InOut) => dir = ParmDir::InOut,
                    other => self.error(u, &format!("expected a parameter direction, found {}", other.describe())),
                }
                self.expect(u, &Token::CloseBracket, "']'");
            }
            let Some(class_id) = self.parse_type_name(u) else {
                self.recover_to_semi(u);
                return;
            };
            let Some(name) = self.expect_ident(u) else {
                self.recover_to_semi(u);
                return;
            };
            if method.find_parm(&name).is_some() {
                self.error(u, &format!("parameter '{name}' is already declared"));
            } else if let Err(err) = method.add_parm(&name, class_id, dir) {
                self.native_error(u, &err);
            }
            match self.next(u).token {
                Token::Comma => {}
                Token::CloseParen => return,
                other => {
                    self.error(u, &format!("expected ',' or ')', found {}", other.describe()));
                    return;
                }
            }
        }
    }

    fn parse_method(&mut self, u: &mut Unit, attrs: &MethodAttrs) {
        let Some(name) = self.expect_ident(u) else {
            self.recover_to_semi(u);
            return;
        };
        let mut candidate = MethodInfo::new("", Intrinsic::Void.id(), attrs.visibility, attrs.ext);
        self.parse_parm_list(u, &mut candidate);
        let mut ret_class = Intrinsic::Void.id();
        if self.peek(u) == Token::Kw(Kw::Returns) {
            self.next(u);
            match self.parse_type_name(u) {
                Some(class_id) => ret_class = class_id,
                None => {
                    self.recover_to_semi(u);
                    return;
                }
            }
        }
        let mut method = MethodInfo::new(&name, ret_class, attrs.visibility, attrs.ext).set_const(attrs.is_const);
        for parm in candidate.parms() {
            let _ = method.add_parm(&parm.name, parm.class_id, parm.dir);
        }

        // an existing inherited descriptor makes this an override
        let (existing, first_method_id) = {
            let own = self.engine.registry.class_by_id(u.own_id).expect("own class registered");
            (own.find_method(&name).cloned(), own.first_method_id())
        };
        let method_id = match existing {
            Some(existing) if existing.id() < first_method_id => {
                if !existing.same_signature(&method) {
                    self.error(u, &format!("override of '{name}' changes the inherited signature"));
                }
                if !existing.ext().allows_override_as(attrs.ext) {
                    self.error(u, &format!("'{name}' cannot be overridden that way"));
                }
                let id = existing.id();
                if let Some(slot) = self.own_mut(u).method_mut(id) {
                    slot.set_ext(attrs.ext);
                }
                id
            }
            Some(_) => {
                self.error(u, &format!("method '{name}' is already defined"));
                self.skip_body(u, Kw::EndMethod);
                return;
            }
            None => {
                if attrs.overrides {
                    self.error(u, &format!("'{name}' is marked Overrides but overrides nothing"));
                }
                if self.dup_name(u, &name) {
                    self.error(u, &format!("'{name}' is already used in this class"));
                }
                match self.own_mut(u).add_method(method.clone()) {
                    Ok(id) => id,
                    Err(err) => {
                        self.native_error(u, &err);
                        return;
                    }
                }
            }
        };

        self.parse_method_body(u, method_id, ret_class, method.parms().to_vec(), false, attrs.is_const, Kw::EndMethod);
    }

    fn parse_ctor(&mut self, u: &mut Unit, attrs: &MethodAttrs) {
        let mut candidate = MethodInfo::new("", Intrinsic::Void.id(), attrs.visibility, MethodExt::Final);
        self.parse_parm_list(u, &mut candidate);
        let name = if candidate.parm_count() == 0 {
            "ctor".to_owned()
        } else {
            format!("ctor{}", candidate.parm_count())
        };
        let mut method = MethodInfo::new(&name, Intrinsic::Void.id(), attrs.visibility, MethodExt::Final).set_ctor(true);
        for parm in candidate.parms() {
            let _ = method.add_parm(&parm.name, parm.class_id, parm.dir);
        }
        if self.own_mut(u).find_method(&name).is_some() {
            self.error(u, "a constructor with this parameter count is already defined");
            self.skip_body(u, Kw::EndConstructor);
            return;
        }
        let parms = method.parms().to_vec();
        match self.own_mut(u).add_method(method) {
            Ok(id) => self.parse_method_body(u, id, Intrinsic::Void.id(), parms, true, false, Kw::EndConstructor),
            Err(err) => self.native_error(u, &err),
        }
    }

    fn parse_dtor(&mut self, u: &mut Unit, attrs: &MethodAttrs) {
        let method = MethodInfo::new("dtor", Intrinsic::Void.id(), attrs.visibility, MethodExt::Final);
        if self.own_mut(u).find_method("dtor").is_some() {
            self.error(u, "the destructor is already defined");
            self.skip_body(u, Kw::EndDestructor);
            return;
        }
        match self.own_mut(u).add_method(method) {
            Ok(id) => self.parse_method_body(u, id, Intrinsic::Void.id(), Vec::new(), false, false, Kw::EndDestructor),
            Err(err) => self.native_error(u, &err),
        }
    }

    fn parse_method_body(
        &mut self,
        u: &mut Unit,
        method_id: crate::types::MethodId,
        ret_class: ClassId,
        parms: Vec<ParmInfo>,
        is_ctor: bool,
        is_const: bool,
        end_kw: Kw,
    ) {
        let mut m = MethodCtx {
            body: MethodBody::new(method_id),
            ret_class,
            parms,
            is_ctor,
            is_const,
            end_kw,
        };
        while self.peek(u) == Token::Kw(Kw::Locals) {
            self.next(u);
            self.parse_locals(u, &mut m);
        }
        self.expect(u, &Token::Kw(Kw::Begin), "Begin");
        loop {
            if !self.parse_statement(u, &mut m) {
                break;
            }
        }
        if !u.flow.is_empty() {
            let open = u.flow.top().map_or("flow construct", FlowItem::describe);
            self.error(u, &format!("method body ends with an open {open}"));
            while u.flow.pop().is_some() {}
        }
        self.expect_semi(u);
        // every body ends in an explicit return
        m.body.add_op(crate::opcode::OpCode::Return);
        self.own_mut(u).add_method_impl(MethodImpl::Ops(Rc::new(m.body)));
    }

    /// `Locals=[Const]  Type Name[(init)]; ... EndLocals;`
    fn parse_locals(&mut self, u: &mut Unit, m: &mut MethodCtx) {
        self.expect(u, &Token::Equal, "'=' after Locals");
        let mut block_const = false;
        if self.peek(u) == Token::OpenBracket {
            self.next(u);
            if self.next(u).token != Token::Kw(Kw::Const) {
                self.error(u, "only Const applies to a Locals block");
            }
            self.expect(u, &Token::CloseBracket, "']'");
            block_const = true;
        }
        loop {
            let type_name = match self.next(u).token {
                Token::Kw(Kw::EndLocals) => break,
                Token::Ident(name) => name,
                Token::Eof => {
                    self.error(u, "source ends inside a Locals block");
                    return;
                }
                other => {
                    self.error(u, &format!("expected a local declaration, found {}", other.describe()));
                    self.recover_to_semi(u);
                    continue;
                }
            };
            let Some(class_id) = self.resolve_type_or_err(u, &type_name) else {
                self.recover_to_semi(u);
                continue;
            };
            let Some(name) = self.expect_ident(u) else {
                self.recover_to_semi(u);
                continue;
            };
            let mut init = None;
            if self.peek(u) == Token::OpenParen {
                self.next(u);
                init = self.parse_literal_value(u, class_id);
                self.expect(u, &Token::CloseParen, "')'");
            }
            self.expect_semi(u);
            if block_const && init.is_none() {
                self.error(u, &format!("const local '{name}' needs an initializer"));
            }
            if m.body.find_local(&name).is_some() || m.parms.iter().any(|p| p.name == name) {
                self.error(u, &format!("'{name}' is already declared in this method"));
                continue;
            }
            if let Err(err) = m.body.add_local(&name, class_id, block_const, init) {
                self.native_error(u, &err);
            }
        }
        self.expect_semi(u);
    }

    /// Skips a broken method body through its end keyword.
    fn skip_body(&mut self, u: &mut Unit, end_kw: Kw) {
        loop {
            match self.next(u).token {
                Token::Kw(kw) if kw == end_kw => break,
                Token::Eof => return,
                _ => {}
            }
        }
        self.expect_semi(u);
    }

    // ----- name resolution -------------------------------------------------

    /// Resolves a type name used inside the current class.
    ///
    /// Tries, in order: an exact path, a nested type of this class, the
    /// import set (where a short name matching several imports is an
    /// ambiguity, not a pick), and the implicit intrinsic names.
    pub(crate) fn resolve_type(&self, u: &Unit, name: &str) -> Result<ClassId, ClassMatch> {
        let registry = &self.engine.registry;
        if name.contains('.') {
            return registry.find_class_id(name).map_err(|_| ClassMatch::NotFound);
        }
        if u.own_id != BAD_ID {
            let nested = format!("{}.{name}", u.class_path);
            if let Ok(id) = registry.find_class_id(&nested) {
                return Ok(id);
            }
            let own = registry.class_by_id(u.own_id).expect("own class registered");
            match registry.resolve_name(name, own) {
                Ok(id) => return Ok(id),
                Err(ClassMatch::Ambiguous) => return Err(ClassMatch::Ambiguous),
                Err(_) => {}
            }
        }
        // the intrinsic classes are visible without imports
        let intrinsic = format!("{CLASS_ROOT}.{name}");
        match registry.find_class_id(&intrinsic) {
            Ok(id) if usize::from(id) <= usize::from(Intrinsic::COUNT) => Ok(id),
            _ => Err(ClassMatch::NotFound),
        }
    }

    fn resolve_type_or_err(&mut self, u: &mut Unit, name: &str) -> Option<ClassId> {
        self.resolve_type_hint(u, name, Recover::No)
    }

    /// Resolution with an explicit recovery hint: `CheckOnly` stays
    /// silent, `Yes` also resyncs to the next statement anchor.
    pub(crate) fn resolve_type_hint(&mut self, u: &mut Unit, name: &str, recover: Recover) -> Option<ClassId> {
        match self.resolve_type(u, name) {
            Ok(id) => Some(id),
            Err(matched) => {
                if recover != Recover::CheckOnly {
                    let text = if matched == ClassMatch::Ambiguous {
                        format!("'{name}' matches more than one import; use the full path")
                    } else {
                        format!("'{name}' does not name a known class")
                    };
                    self.error(u, &text);
                    if recover == Recover::Yes {
                        self.recover_to_semi(u);
                    }
                }
                None
            }
        }
    }

    /// A type name position: an identifier, a dotted path, or the dynamic
    /// type reference.
    pub(crate) fn parse_type_name(&mut self, u: &mut Unit) -> Option<ClassId> {
        match self.next(u).token {
            Token::Ident(first) => {
                let mut name = first;
                while self.peek(u) == Token::Period {
                    self.next(u);
                    match self.next(u).token {
                        Token::Ident(seg) => {
                            name.push('.');
                            name.push_str(&seg);
                        }
                        other => {
                            self.error(u, &format!("expected a path segment, found {}", other.describe()));
                            return None;
                        }
                    }
                }
                self.resolve_type_or_err(u, &name)
            }
            Token::DynTypeRef => {
                let Some(path) = self.engine.dyn_type_ref().map(str::to_owned) else {
                    self.error(u, "no dynamic type reference is set on the engine");
                    return None;
                };
                self.resolve_type_or_err(u, &path)
            }
            other => {
                self.error(u, &format!("expected a type name, found {}", other.describe()));
                None
            }
        }
    }

    fn parse_dotted_name(&mut self, u: &mut Unit) -> Option<String> {
        match self.next(u).token {
            Token::Ident(first) => self.parse_dotted_from(u, first),
            other => {
                self.error(u, &format!("expected a class path, found {}", other.describe()));
                None
            }
        }
    }

    fn parse_dotted_from(&mut self, u: &mut Unit, first: String) -> Option<String> {
        let mut path = first;
        while self.peek(u) == Token::Period {
            self.next(u);
            match self.next(u).token {
                Token::Ident(seg) => {
                    path.push('.');
                    path.push_str(&seg);
                }
                other => {
                    self.error(u, &format!("expected a path segment, found {}", other.describe()));
                    return None;
                }
            }
        }
        Some(path)
    }

    /// Makes sure a class is in the registry, recursing into its source
    /// through the class manager when needed.
    fn ensure_loaded(&mut self, u: &Unit, path: &str) -> bool {
        if self.engine.registry.is_loaded(path) {
            return true;
        }
        if !path.starts_with(&format!("{CLASS_ROOT}.")) {
            self.error(u, &format!("class paths are rooted at '{CLASS_ROOT}'"));
            return false;
        }
        self.parse_class(path).is_some()
    }

    /// Whether a name collides with an existing member, method or literal.
    fn dup_name(&mut self, u: &Unit, name: &str) -> bool {
        let Ok(own) = self.engine.registry.class_by_id(u.own_id) else {
            return false;
        };
        own.find_member(name, false).is_some() || own.has_method(name) || own.find_literal(name).is_some()
    }

    // ----- token plumbing --------------------------------------------------

    pub(crate) fn own_mut(&mut self, u: &Unit) -> &mut ClassInfo {
        self.engine
            .registry
            .class_by_id_mut(u.own_id)
            .expect("own class registered before sections parse")
    }

    pub(crate) fn opt_level(&self) -> OptLevel {
        self.engine.opt_level()
    }

    pub(crate) fn next(&mut self, u: &mut Unit) -> Lexed {
        match u.lexer.next_token() {
            Ok(lexed) => {
                u.line = lexed.line;
                u.col = lexed.col;
                lexed
            }
            Err(message) => {
                self.error(u, &message);
                Lexed {
                    token: Token::Eof,
                    line: u.line,
                    col: u.col,
                }
            }
        }
    }

    pub(crate) fn peek(&mut self, u: &mut Unit) -> Token {
        let lexed = self.next(u);
        let token = lexed.token.clone();
        u.lexer.push_back(lexed);
        token
    }

    pub(crate) fn push_back(&mut self, u: &mut Unit, lexed: Lexed) {
        u.lexer.push_back(lexed);
    }

    pub(crate) fn expect(&mut self, u: &mut Unit, token: &Token, what: &str) -> bool {
        let lexed = self.next(u);
        if lexed.token == *token {
            true
        } else {
            self.error(u, &format!("expected {what}, found {}", lexed.token.describe()));
            self.push_back(u, lexed);
            false
        }
    }

    pub(crate) fn expect_ident(&mut self, u: &mut Unit) -> Option<String> {
        match self.next(u).token {
            Token::Ident(name) => Some(name),
            other => {
                self.error(u, &format!("expected a name, found {}", other.describe()));
                None
            }
        }
    }

    pub(crate) fn expect_semi(&mut self, u: &mut Unit) -> bool {
        self.expect(u, &Token::Semi, "';'")
    }

    /// Advances to just past the next ';', the statement-level resync
    /// anchor.
    pub(crate) fn recover_to_semi(&mut self, u: &mut Unit) {
        loop {
            match self.next(u).token {
                Token::Semi | Token::Eof => return,
                _ => {}
            }
        }
    }

    pub(crate) fn error(&mut self, u: &Unit, text: &str) {
        self.errors
            .event(ParseEventKind::Error, text, u.line, u.col, &u.class_path);
        self.error_count += 1;
    }

    pub(crate) fn native_error(&mut self, u: &Unit, err: &NativeError) {
        self.errors.native_exception(err, u.line, u.col, &u.class_path);
        self.error_count += 1;
    }
}

/// Attributes of a `Methods=` block, applied to each method inside it.
#[derive(Debug, Clone)]
pub(crate) struct MethodAttrs {
    pub visibility: Visibility,
    pub ext: MethodExt,
    pub is_const: bool,
    pub overrides: bool,
}

impl Default for MethodAttrs {
    fn default() -> Self {
        Self {
            visibility: Visibility::Public,
            ext: MethodExt::NonFinal,
            is_const: false,
            overrides: false,
        }
    }
}
