//! Expression compilation.
//!
//! A classic operator-precedence climb that emits opcodes as it parses.
//! Operators compile to method calls on the left operand's class (the
//! receiver stays on the stack and the call targets it through
//! `CallStack`), except the boolean connectives, which use the dedicated
//! logical opcodes with non-popping conditional jumps for short-circuit.
//!
//! Untyped numeric literals adapt to their context: when the just-emitted
//! operand is a single immediate push and the expected class is numeric,
//! the immediate is rewritten in place rather than diagnosed.

use crate::{
    opcode::OpCode,
    parser::{Kw, MethodCtx, NumLit, Parser, Token, Unit},
    types::{self, ClassId, Intrinsic, Recover, Visibility},
    value::ValueData,
};

/// Where a named value lives in the current method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotKind {
    Local,
    Parm,
    Member,
}

/// A resolved reference to a local, parameter, or member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotRef {
    pub kind: SlotKind,
    /// 1-based id within its container.
    pub id: u16,
    pub class_id: ClassId,
    /// Whether assignment through this reference is legal here.
    pub writable: bool,
}

/// Receiver form of a compiled method call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallRecv {
    Slot(SlotRef),
    This,
    Parent,
    Except,
    /// Receiver is already on the stack (chained calls, indexed elements).
    Stack,
}

/// What an expression left on the stack.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExprVal {
    pub class_id: ClassId,
    /// True when the top is a fresh temp the compiler may mutate in place.
    pub is_temp: bool,
}

impl<'a> Parser<'a> {
    /// Compiles a full expression, leaving its value on the stack.
    pub(crate) fn parse_expr(&mut self, u: &mut Unit, m: &mut MethodCtx) -> Option<ExprVal> {
        self.parse_logical(u, m)
    }

    /// Compiles an expression that must produce the given class.
    ///
    /// A single numeric immediate is converted in place when it fits;
    /// a derived class passes where its ancestor is expected.
    pub(crate) fn parse_expr_with_target(&mut self, u: &mut Unit, m: &mut MethodCtx, want: ClassId) -> Option<ExprVal> {
        let mark = m.body.next_ip();
        let val = self.parse_expr(u, m)?;
        self.coerce_to(u, m, val, want, mark)
    }

    /// Applies the literal-conversion / upcast rules to an already-parsed
    /// operand.
    pub(crate) fn coerce_to(
        &mut self,
        u: &Unit,
        m: &mut MethodCtx,
        val: ExprVal,
        want: ClassId,
        mark: u32,
    ) -> Option<ExprVal> {
        if val.class_id == want {
            return Some(val);
        }
        if types::is_numeric(want) && m.body.next_ip() == mark + 1 {
            if let Some(intrinsic) = Intrinsic::from_id(want) {
                if m.body.convert_numeric(mark, intrinsic) {
                    return Some(ExprVal {
                        class_id: want,
                        is_temp: val.is_temp,
                    });
                }
            }
        }
        if self.engine.registry.is_derived_from(val.class_id, want) {
            return Some(ExprVal {
                class_id: want,
                is_temp: val.is_temp,
            });
        }
        self.error(
            u,
            &format!(
                "expected a value of class id {want}, found class id {}",
                val.class_id
            ),
        );
        None
    }

    // ----- precedence levels ------------------------------------------------

    /// `||`, `^^`, and `&&`, lowest precedence.
    fn parse_logical(&mut self, u: &mut Unit, m: &mut MethodCtx) -> Option<ExprVal> {
        let mut lhs = self.parse_logical_and(u, m)?;
        loop {
            match self.peek(u) {
                Token::LogOr => {
                    self.next(u);
                    self.check_bool(u, &lhs);
                    // short-circuit: a true left side skips the right side
                    let jump = m.body.add_op(OpCode::CondJumpNP(0));
                    let rhs = self.parse_logical_and(u, m)?;
                    self.check_bool(u, &rhs);
                    m.body.add_op(OpCode::LogicalOr);
                    m.body.patch_jump(jump, m.body.next_ip());
                    lhs = ExprVal {
                        class_id: Intrinsic::Boolean.id(),
                        is_temp: false,
                    };
                }
                Token::LogXor => {
                    self.next(u);
                    self.check_bool(u, &lhs);
                    let rhs = self.parse_logical_and(u, m)?;
                    self.check_bool(u, &rhs);
                    m.body.add_op(OpCode::LogicalXor);
                    lhs = ExprVal {
                        class_id: Intrinsic::Boolean.id(),
                        is_temp: true,
                    };
                }
                _ => return Some(lhs),
            }
        }
    }

    fn parse_logical_and(&mut self, u: &mut Unit, m: &mut MethodCtx) -> Option<ExprVal> {
        let mut lhs = self.parse_equality(u, m)?;
        while self.peek(u) == Token::LogAnd {
            self.next(u);
            self.check_bool(u, &lhs);
            // short-circuit: a false left side skips the right side
            let jump = m.body.add_op(OpCode::NotCondJumpNP(0));
            let rhs = self.parse_equality(u, m)?;
            self.check_bool(u, &rhs);
            m.body.add_op(OpCode::LogicalAnd);
            m.body.patch_jump(jump, m.body.next_ip());
            lhs = ExprVal {
                class_id: Intrinsic::Boolean.id(),
                is_temp: false,
            };
        }
        Some(lhs)
    }

    fn parse_equality(&mut self, u: &mut Unit, m: &mut MethodCtx) -> Option<ExprVal> {
        let mut lhs = self.parse_relational(u, m)?;
        loop {
            let negate = match self.peek(u) {
                Token::Equal => false,
                Token::NotEqual => true,
                _ => return Some(lhs),
            };
            self.next(u);
            lhs = self.emit_operator_call(u, m, lhs, "Equal", Self::parse_relational)?;
            if negate {
                // the Equal result is a fresh temp, safe to flip in place
                m.body.add_op(OpCode::Negate);
            }
        }
    }

    fn parse_relational(&mut self, u: &mut Unit, m: &mut MethodCtx) -> Option<ExprVal> {
        let mut lhs = self.parse_bitwise(u, m)?;
        loop {
            let name = match self.peek(u) {
                Token::GtThan => "GtThan",
                Token::LsThan => "LsThan",
                Token::GtThanEq => "GtThanEq",
                Token::LsThanEq => "LsThanEq",
                _ => return Some(lhs),
            };
            self.next(u);
            lhs = self.emit_operator_call(u, m, lhs, name, Self::parse_bitwise)?;
        }
    }

    fn parse_bitwise(&mut self, u: &mut Unit, m: &mut MethodCtx) -> Option<ExprVal> {
        let mut lhs = self.parse_additive(u, m)?;
        loop {
            let name = match self.peek(u) {
                Token::And => "And",
                Token::Or => "Or",
                Token::Xor => "Xor",
                _ => return Some(lhs),
            };
            self.next(u);
            lhs = self.emit_operator_call(u, m, lhs, name, Self::parse_additive)?;
        }
    }

    fn parse_additive(&mut self, u: &mut Unit, m: &mut MethodCtx) -> Option<ExprVal> {
        let mut lhs = self.parse_multiplicative(u, m)?;
        loop {
            let name = match self.peek(u) {
                Token::Add => "Add",
                Token::Subtract => "Sub",
                _ => return Some(lhs),
            };
            self.next(u);
            lhs = self.emit_operator_call(u, m, lhs, name, Self::parse_multiplicative)?;
        }
    }

    fn parse_multiplicative(&mut self, u: &mut Unit, m: &mut MethodCtx) -> Option<ExprVal> {
        let mut lhs = self.parse_unary(u, m)?;
        loop {
            let name = match self.peek(u) {
                Token::Multiply => "Mul",
                Token::Divide => "Div",
                Token::ModDiv => "ModDiv",
                _ => return Some(lhs),
            };
            self.next(u);
            lhs = self.emit_operator_call(u, m, lhs, name, Self::parse_unary)?;
        }
    }

    fn parse_unary(&mut self, u: &mut Unit, m: &mut MethodCtx) -> Option<ExprVal> {
        match self.peek(u) {
            Token::Exclaim => {
                self.next(u);
                let val = self.parse_unary(u, m)?;
                self.check_bool(u, &val);
                if val.is_temp {
                    m.body.add_op(OpCode::Negate);
                } else {
                    // the operand is shared storage; branch to a fresh
                    // immediate instead of flipping it in place
                    let to_false = m.body.add_op(OpCode::NotCondJump(0));
                    m.body.add_op(OpCode::PushImBoolean(false));
                    let to_end = m.body.add_op(OpCode::Jump(0));
                    m.body.patch_jump(to_false, m.body.next_ip());
                    m.body.add_op(OpCode::PushImBoolean(true));
                    m.body.patch_jump(to_end, m.body.next_ip());
                }
                Some(ExprVal {
                    class_id: Intrinsic::Boolean.id(),
                    is_temp: true,
                })
            }
            Token::Subtract => {
                self.next(u);
                // fold a literal operand into a negative immediate
                if let Token::Num(num) = self.peek(u) {
                    self.next(u);
                    let negated = match num {
                        NumLit::Int { value, suffix } => NumLit::Int { value: -value, suffix },
                        NumLit::Float { value, suffix } => NumLit::Float { value: -value, suffix },
                    };
                    return self.emit_num_immediate(u, m, negated, None);
                }
                let val = self.parse_unary(u, m)?;
                if !types::is_integer(val.class_id) && !types::is_float(val.class_id) {
                    self.error(u, "unary '-' needs a signed numeric value");
                    return None;
                }
                let val = self.materialize_temp(m, val);
                self.emit_void_self_call(u, m, val.class_id, "Negate")?;
                Some(val)
            }
            _ => self.parse_postfix(u, m),
        }
    }

    /// Postfix chains: method calls and collection indexing.
    fn parse_postfix(&mut self, u: &mut Unit, m: &mut MethodCtx) -> Option<ExprVal> {
        let mut val = self.parse_primary(u, m)?;
        loop {
            match self.peek(u) {
                Token::Period => {
                    self.next(u);
                    let Some(name) = self.expect_ident(u) else {
                        return None;
                    };
                    val = self.emit_call(u, m, CallRecv::Stack, val.class_id, &name)?;
                }
                Token::OpenBracket => {
                    self.next(u);
                    val = self.emit_index(u, m, val.class_id)?;
                }
                _ => return Some(val),
            }
        }
    }

    fn parse_primary(&mut self, u: &mut Unit, m: &mut MethodCtx) -> Option<ExprVal> {
        let lexed = self.next(u);
        match lexed.token {
            Token::Num(num) => self.emit_num_immediate(u, m, num, None),
            Token::Str(text) => self.emit_pool_string(u, m, &text),
            Token::CharLit(c) => {
                m.body.add_op(OpCode::PushImChar(c));
                Some(ExprVal {
                    class_id: Intrinsic::Char.id(),
                    is_temp: true,
                })
            }
            Token::Kw(kw @ (Kw::True | Kw::False)) => {
                m.body.add_op(OpCode::PushImBoolean(kw == Kw::True));
                Some(ExprVal {
                    class_id: Intrinsic::Boolean.id(),
                    is_temp: true,
                })
            }
            Token::OpenParen => {
                let val = self.parse_expr(u, m)?;
                self.expect(u, &Token::CloseParen, "')'");
                Some(val)
            }
            Token::CurLineRef => {
                m.body.add_op(OpCode::PushImCard4(lexed.line));
                Some(ExprVal {
                    class_id: Intrinsic::Card4.id(),
                    is_temp: true,
                })
            }
            Token::CurClassNameRef => {
                let path = u.class_path.clone();
                self.emit_pool_string(u, m, &path)
            }
            Token::Kw(Kw::This) => {
                m.body.add_op(OpCode::PushThis);
                Some(ExprVal {
                    class_id: u.own_id,
                    is_temp: false,
                })
            }
            Token::Kw(Kw::Parent) => {
                self.expect(u, &Token::Period, "'.' after Parent");
                let name = self.expect_ident(u)?;
                let parent = self
                    .engine
                    .registry
                    .class_by_id(u.own_id)
                    .ok()
                    .map(crate::class::ClassInfo::parent_id)?;
                self.emit_call(u, m, CallRecv::Parent, parent, &name)
            }
            Token::ExceptionRef => {
                if !u.flow.in_catch() {
                    self.error(u, "'$Exception' is only available inside a Catch block");
                    return None;
                }
                if self.peek(u) == Token::Period {
                    self.next(u);
                    let name = self.expect_ident(u)?;
                    self.emit_call(u, m, CallRecv::Except, Intrinsic::Exception.id(), &name)
                } else {
                    m.body.add_op(OpCode::PushException);
                    Some(ExprVal {
                        class_id: Intrinsic::Exception.id(),
                        is_temp: false,
                    })
                }
            }
            Token::Kw(Kw::TypeCast) => {
                self.expect(u, &Token::OpenParen, "'(' after TypeCast");
                let target = self.parse_type_name(u)?;
                self.expect(u, &Token::Comma, "',' before the cast value");
                self.parse_expr(u, m)?;
                self.expect(u, &Token::CloseParen, "')'");
                m.body.add_op(OpCode::TypeCast(target));
                Some(ExprVal {
                    class_id: target,
                    is_temp: true,
                })
            }
            Token::Ident(name) => self.parse_named_primary(u, m, name),
            other => {
                self.error(u, &format!("expected an expression, found {}", other.describe()));
                None
            }
        }
    }

    /// An identifier in value position: a local/parameter/member, a
    /// literal, or a class reference carrying an enum value or literal.
    fn parse_named_primary(&mut self, u: &mut Unit, m: &mut MethodCtx, name: String) -> Option<ExprVal> {
        if let Some(slot) = self.resolve_slot(u, m, &name) {
            self.emit_slot_push(m, slot);
            return Some(ExprVal {
                class_id: slot.class_id,
                is_temp: false,
            });
        }
        if let Some((data, class_id)) = self.own_literal(u, &name) {
            return self.emit_value_push(u, m, &data, class_id);
        }

        // progressively longer dotted prefixes until a class resolves
        let mut path = name;
        let class_id = loop {
            if let Some(id) = self.resolve_type_hint(u, &path, Recover::CheckOnly) {
                break id;
            }
            if self.peek(u) == Token::Period {
                self.next(u);
                let seg = self.expect_ident(u)?;
                path.push('.');
                path.push_str(&seg);
            } else {
                self.error(u, &format!("'{path}' does not name a value or class"));
                return None;
            }
        };
        self.expect(u, &Token::Period, "'.' after a class reference");
        let item = self.expect_ident(u)?;
        let class = self.engine.registry.class_by_id(class_id).ok()?;
        if let Some(ordinal) = class.ordinal_from_name(&item) {
            m.body.add_op(OpCode::PushEnum(class_id, ordinal as u16));
            return Some(ExprVal {
                class_id,
                is_temp: true,
            });
        }
        if let Some((literal, _)) = self.engine.registry.find_literal(class_id, &item) {
            let (data, lit_class) = (literal.data.clone(), literal.class_id);
            return self.emit_value_push(u, m, &data, lit_class);
        }
        self.error(u, &format!("'{path}' has no value or literal named '{item}'"));
        None
    }

    // ----- shared emission --------------------------------------------------

    /// Resolves a bare name against locals, then parameters, then members.
    pub(crate) fn resolve_slot(&self, u: &Unit, m: &MethodCtx, name: &str) -> Option<SlotRef> {
        if let Some(local) = m.body.find_local(name) {
            return Some(SlotRef {
                kind: SlotKind::Local,
                id: local.id,
                class_id: local.class_id,
                writable: !local.is_const,
            });
        }
        if let Some(parm) = m.parms.iter().find(|p| p.name == name) {
            return Some(SlotRef {
                kind: SlotKind::Parm,
                id: parm.id,
                class_id: parm.class_id,
                writable: parm.dir != crate::types::ParmDir::In,
            });
        }
        let own = self.engine.registry.class_by_id(u.own_id).ok()?;
        if let Some(member) = own.find_member(name, false) {
            return Some(SlotRef {
                kind: SlotKind::Member,
                id: member.id,
                class_id: member.class_id,
                writable: !member.is_const && !m.is_const,
            });
        }
        None
    }

    fn own_literal(&self, u: &Unit, name: &str) -> Option<(ValueData, ClassId)> {
        let (literal, _) = self.engine.registry.find_literal(u.own_id, name)?;
        Some((literal.data.clone(), literal.class_id))
    }

    pub(crate) fn emit_slot_push(&mut self, m: &mut MethodCtx, slot: SlotRef) {
        let op = match slot.kind {
            SlotKind::Local => OpCode::PushLocal(slot.id),
            SlotKind::Parm => OpCode::PushParm(slot.id),
            SlotKind::Member => OpCode::PushMember(slot.id),
        };
        m.body.add_op(op);
    }

    /// Pushes a numeric literal as an immediate of the right class.
    pub(crate) fn emit_num_immediate(
        &mut self,
        u: &Unit,
        m: &mut MethodCtx,
        num: NumLit,
        want: Option<Intrinsic>,
    ) -> Option<ExprVal> {
        let (op, intrinsic) = match num {
            NumLit::Float { value, suffix } => match suffix.or(want) {
                Some(Intrinsic::Float4) => (OpCode::PushImFloat4(value as f32), Intrinsic::Float4),
                _ => (OpCode::PushImFloat8(value), Intrinsic::Float8),
            },
            NumLit::Int { value, suffix } => {
                let intrinsic = match suffix.or(want) {
                    Some(intrinsic) => intrinsic,
                    // untyped literals default to the natural word types
                    None => {
                        if value >= 0 && u32::try_from(value).is_ok() {
                            Intrinsic::Card4
                        } else if i32::try_from(value).is_ok() {
                            Intrinsic::Int4
                        } else if value >= 0 && u64::try_from(value).is_ok() {
                            Intrinsic::Card8
                        } else {
                            self.error(u, "the numeric literal does not fit any numeric class");
                            return None;
                        }
                    }
                };
                let op = match ValueData::from_i128(intrinsic, value) {
                    Some(ValueData::Card1(v)) => OpCode::PushImCard1(v),
                    Some(ValueData::Card2(v)) => OpCode::PushImCard2(v),
                    Some(ValueData::Card4(v)) => OpCode::PushImCard4(v),
                    Some(ValueData::Card8(v)) => OpCode::PushImCard8(v),
                    Some(ValueData::Int1(v)) => OpCode::PushImInt1(v),
                    Some(ValueData::Int2(v)) => OpCode::PushImInt2(v),
                    Some(ValueData::Int4(v)) => OpCode::PushImInt4(v),
                    Some(ValueData::Float4(v)) => OpCode::PushImFloat4(v),
                    Some(ValueData::Float8(v)) => OpCode::PushImFloat8(v),
                    _ => {
                        self.error(u, "the numeric literal does not fit its type");
                        return None;
                    }
                };
                (op, intrinsic)
            }
        };
        m.body.add_op(op);
        Some(ExprVal {
            class_id: intrinsic.id(),
            is_temp: true,
        })
    }

    /// Pushes a string via the body's pool, deduplicating above the
    /// minimal optimization level.
    pub(crate) fn emit_pool_string(&mut self, u: &Unit, m: &mut MethodCtx, text: &str) -> Option<ExprVal> {
        let dedup = self.opt_level() != crate::types::OptLevel::Minimal;
        match m.body.add_string(text, dedup) {
            Ok(ix) => {
                m.body.add_op(OpCode::PushStrPoolItem(ix));
                Some(ExprVal {
                    class_id: Intrinsic::String.id(),
                    is_temp: false,
                })
            }
            Err(err) => {
                self.native_error(u, &err);
                None
            }
        }
    }

    /// Pushes a literal's value: immediates for the scalars, the string
    /// pool for strings.
    pub(crate) fn emit_value_push(
        &mut self,
        u: &Unit,
        m: &mut MethodCtx,
        data: &ValueData,
        class_id: ClassId,
    ) -> Option<ExprVal> {
        let op = match data {
            ValueData::Boolean(v) => OpCode::PushImBoolean(*v),
            ValueData::Char(v) => OpCode::PushImChar(*v),
            ValueData::Card1(v) => OpCode::PushImCard1(*v),
            ValueData::Card2(v) => OpCode::PushImCard2(*v),
            ValueData::Card4(v) => OpCode::PushImCard4(*v),
            ValueData::Card8(v) => OpCode::PushImCard8(*v),
            ValueData::Int1(v) => OpCode::PushImInt1(*v),
            ValueData::Int2(v) => OpCode::PushImInt2(*v),
            ValueData::Int4(v) => OpCode::PushImInt4(*v),
            ValueData::Float4(v) => OpCode::PushImFloat4(*v),
            ValueData::Float8(v) => OpCode::PushImFloat8(*v),
            ValueData::String(text) => {
                let text = text.clone();
                return self.emit_pool_string(u, m, &text);
            }
            _ => {
                self.error(u, "this literal kind cannot appear in an expression");
                return None;
            }
        };
        m.body.add_op(op);
        Some(ExprVal {
            class_id,
            is_temp: true,
        })
    }

    /// One binary-operator step: the left operand is on the stack; looks
    /// up the operator method on its class, parses the right operand, and
    /// emits the call.
    fn emit_operator_call(
        &mut self,
        u: &mut Unit,
        m: &mut MethodCtx,
        lhs: ExprVal,
        name: &str,
        lower: fn(&mut Self, &mut Unit, &mut MethodCtx) -> Option<ExprVal>,
    ) -> Option<ExprVal> {
        let Some(method) = self.method_on(lhs.class_id, name) else {
            self.error(u, &format!("the left operand's class has no '{name}' operator"));
            return None;
        };
        let parm_class = method.parms().first().map(|p| p.class_id)?;

        m.body.add_op(OpCode::PushTempVar(method.ret_class()));
        m.body.add_op(OpCode::PushCurLine);
        let mark = m.body.next_ip();
        let rhs = lower(self, u, m)?;
        self.coerce_to(u, m, rhs, parm_class, mark)?;
        // receiver sits under the return slot, the frame, and one argument
        m.body.add_op(OpCode::CallStack(3, method.id()));
        m.body.add_op(OpCode::FlipTop);
        m.body.add_op(OpCode::PopTop);
        Some(ExprVal {
            class_id: method.ret_class(),
            is_temp: true,
        })
    }

    /// A full method call. The receiver form picks the call opcode; for
    /// `Stack` receivers the spent receiver is dropped afterwards.
    pub(crate) fn emit_call(
        &mut self,
        u: &mut Unit,
        m: &mut MethodCtx,
        recv: CallRecv,
        recv_class: ClassId,
        method_name: &str,
    ) -> Option<ExprVal> {
        let Some(method) = self.method_on(recv_class, method_name) else {
            self.error(u, &format!("the receiver's class has no method '{method_name}'"));
            return None;
        };
        if method.visibility() == Visibility::Private
            && recv_class != u.own_id
            && !matches!(recv, CallRecv::This | CallRecv::Parent)
        {
            self.error(u, &format!("'{method_name}' is private to its class"));
            return None;
        }
        if !method.is_const() {
            let read_only = match recv {
                CallRecv::Slot(slot) => !slot.writable,
                CallRecv::This => m.is_const && !m.is_ctor,
                CallRecv::Except => true,
                _ => false,
            };
            if read_only {
                self.error(u, &format!("'{method_name}' is not const and the receiver is"));
                return None;
            }
        }

        m.body.add_op(OpCode::PushTempVar(method.ret_class()));
        m.body.add_op(OpCode::PushCurLine);

        // arguments, checked against the descriptor
        self.expect(u, &Token::OpenParen, "'('");
        let parms = method.parms().to_vec();
        for (ix, parm) in parms.iter().enumerate() {
            if ix > 0 {
                self.expect(u, &Token::Comma, "','");
            }
            if parm.dir == crate::types::ParmDir::In {
                self.parse_expr_with_target(u, m, parm.class_id)?;
            } else {
                self.parse_lvalue_arg(u, m, parm.class_id)?;
            }
        }
        self.expect(u, &Token::CloseParen, "')'");

        let parm_count = parms.len() as u16;
        let op = match recv {
            CallRecv::Slot(slot) => match slot.kind {
                SlotKind::Local => OpCode::CallLocal(slot.id, method.id()),
                SlotKind::Parm => OpCode::CallParm(slot.id, method.id()),
                SlotKind::Member => OpCode::CallMember(slot.id, method.id()),
            },
            CallRecv::This => OpCode::CallThis(method.id()),
            CallRecv::Parent => OpCode::CallParent(method.id()),
            CallRecv::Except => OpCode::CallExcept(method.id()),
            CallRecv::Stack => OpCode::CallStack(parm_count + 2, method.id()),
        };
        m.body.add_op(op);
        if recv == CallRecv::Stack {
            m.body.add_op(OpCode::FlipTop);
            m.body.add_op(OpCode::PopTop);
        }
        Some(ExprVal {
            class_id: method.ret_class(),
            is_temp: true,
        })
    }

    /// An out / in-out argument: a direct reference, optionally indexed
    /// into a collection, of exactly the parameter's class.
    fn parse_lvalue_arg(&mut self, u: &mut Unit, m: &mut MethodCtx, want: ClassId) -> Option<ExprVal> {
        let Some(name) = self.expect_ident(u) else {
            return None;
        };
        let Some(slot) = self.resolve_slot(u, m, &name) else {
            self.error(u, &format!("out parameters need a direct reference, '{name}' is not one"));
            return None;
        };
        if !slot.writable {
            self.error(u, &format!("'{name}' cannot be written through"));
            return None;
        }
        self.emit_slot_push(m, slot);
        let mut val = ExprVal {
            class_id: slot.class_id,
            is_temp: false,
        };
        while self.peek(u) == Token::OpenBracket {
            self.next(u);
            val = self.emit_index(u, m, val.class_id)?;
        }
        if val.class_id != want {
            self.error(u, "the argument's class does not match the out parameter");
            return None;
        }
        Some(val)
    }

    /// `[index]` on a collection value already on the stack; the closing
    /// bracket is consumed here.
    pub(crate) fn emit_index(&mut self, u: &mut Unit, m: &mut MethodCtx, col_class: ClassId) -> Option<ExprVal> {
        let elem = match self.engine.registry.class_by_id(col_class).ok().and_then(|c| c.elem_class()) {
            Some(elem) => elem,
            None => {
                self.error(u, "only array and vector values can be indexed");
                return None;
            }
        };
        let index = self.parse_expr(u, m)?;
        if !types::is_cardinal(index.class_id) {
            self.error(u, "collection indexes are cardinal values");
        }
        self.expect(u, &Token::CloseBracket, "']'");
        m.body.add_op(OpCode::ColIndex);
        Some(ExprVal {
            class_id: elem,
            is_temp: false,
        })
    }

    /// Turns a shared value on the stack into a private temp copy.
    fn materialize_temp(&mut self, m: &mut MethodCtx, val: ExprVal) -> ExprVal {
        if val.is_temp {
            return val;
        }
        m.body.add_op(OpCode::TypeCast(val.class_id));
        ExprVal {
            class_id: val.class_id,
            is_temp: true,
        }
    }

    /// A void-returning call on the stack top (Negate and friends).
    fn emit_void_self_call(&mut self, u: &Unit, m: &mut MethodCtx, class_id: ClassId, name: &str) -> Option<()> {
        let Some(method) = self.method_on(class_id, name) else {
            self.error(u, &format!("the class has no '{name}' method"));
            return None;
        };
        m.body.add_op(OpCode::PushTempVar(method.ret_class()));
        m.body.add_op(OpCode::PushCurLine);
        m.body.add_op(OpCode::CallStack(2, method.id()));
        m.body.add_op(OpCode::PopTop);
        Some(())
    }

    /// Looks up a callable method on a class, descriptors included from
    /// ancestors.
    pub(crate) fn method_on(&self, class_id: ClassId, name: &str) -> Option<crate::method::MethodInfo> {
        self.engine
            .registry
            .class_by_id(class_id)
            .ok()
            .and_then(|c| c.find_method(name))
            .cloned()
    }

    fn check_bool(&mut self, u: &Unit, val: &ExprVal) {
        if val.class_id != Intrinsic::Boolean.id() {
            self.error(u, "a boolean value is needed here");
        }
    }
}
