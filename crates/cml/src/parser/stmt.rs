//! Statement compilation for method bodies.
//!
//! Each statement starts with a `CurLine` marker for the debugger and the
//! backtrace machinery. Flow constructs push items on the flow stack and
//! patch their jumps when the matching end keyword arrives; everything
//! else is an expression statement — an assignment, a call chain, an
//! increment, or a compound assignment desugared into the operator call
//! plus a `Copy`.

use crate::{
    class::ClassKind,
    method::CaseValue,
    opcode::OpCode,
    parser::{
        FlowItem, FlowKind, Kw, Lexed, MethodCtx, Parser, Token, Unit,
        expr::{CallRecv, ExprVal, SlotKind, SlotRef},
    },
    types::{self, ClassId, Intrinsic},
};

/// Most formattable arguments a `ThrowFmt` can carry.
const MAX_THROW_FMT_ARGS: usize = 4;

impl<'a> Parser<'a> {
    /// Compiles one statement. False when the body's end keyword (or a
    /// structural error) terminates the statement loop.
    pub(crate) fn parse_statement(&mut self, u: &mut Unit, m: &mut MethodCtx) -> bool {
        let lexed = self.next(u);
        match lexed.token {
            Token::Kw(kw) if kw == m.end_kw => return false,
            Token::Kw(Kw::EndMethod | Kw::EndConstructor | Kw::EndDestructor) => {
                self.error(u, "wrong end keyword for this body");
                return false;
            }
            Token::Eof => {
                self.error(u, "source ends inside a method body");
                return false;
            }

            Token::Kw(Kw::If) => self.stmt_if(u, m, lexed.line),
            Token::Kw(Kw::ElseIf) => self.stmt_else_if(u, m, lexed.line),
            Token::Kw(Kw::Else) => self.stmt_else(u, m),
            Token::Kw(Kw::EndIf) => self.stmt_end_if(u, m),
            Token::Kw(Kw::While) => self.stmt_while(u, m, lexed.line),
            Token::Kw(Kw::EndWhile) => self.stmt_end_while(u, m),
            Token::Kw(Kw::DoLoop) => u.flow.push(FlowItem::new(
                FlowKind::DoLoop {
                    loop_top: m.body.next_ip(),
                },
                lexed.line,
            )),
            Token::Kw(Kw::DoWhile) => self.stmt_do_while(u, m, lexed.line),
            Token::Kw(Kw::ForEach) => self.stmt_for_each(u, m, lexed.line),
            Token::Kw(Kw::EndForEach) => self.stmt_end_for_each(u, m),
            Token::Kw(Kw::Break) => self.stmt_break(u, m, lexed.line),
            Token::Kw(Kw::Switch) => self.stmt_switch(u, m, lexed.line),
            Token::Kw(Kw::Case) => self.stmt_case(u, m, false),
            Token::Kw(Kw::FTCase) => self.stmt_case(u, m, true),
            Token::Kw(Kw::Default) => self.stmt_default(u, m),
            Token::Kw(Kw::EndCase) => self.stmt_end_case(u, m),
            Token::Kw(Kw::EndSwitch) => self.stmt_end_switch(u, m),
            Token::Kw(Kw::Try) => self.stmt_try(u, m, lexed.line),
            Token::Kw(Kw::Catch) => self.stmt_catch(u, m),
            Token::Kw(Kw::EndTry) => self.stmt_end_try(u, m),
            Token::Kw(Kw::Return) => self.stmt_return(u, m, lexed.line),
            Token::Kw(Kw::Throw) => self.stmt_throw(u, m, lexed.line),
            Token::Kw(Kw::Rethrow) => self.stmt_rethrow(u, m, lexed.line),

            // debug-only sections compile away unless the engine is in
            // debug mode
            Token::Kw(Kw::BeginDebug) => {
                if !self.engine.debug_mode() {
                    loop {
                        match self.next(u).token {
                            Token::Kw(Kw::EndDebug) => break,
                            Token::Eof => {
                                self.error(u, "source ends inside a BeginDebug section");
                                return false;
                            }
                            _ => {}
                        }
                    }
                    self.expect_semi(u);
                }
            }
            Token::Kw(Kw::EndDebug) => {
                self.expect_semi(u);
            }

            _ => {
                m.body.add_op(OpCode::CurLine(lexed.line));
                self.stmt_expression(u, m, lexed);
            }
        }
        true
    }

    // ----- if / loops -------------------------------------------------------

    fn stmt_if(&mut self, u: &mut Unit, m: &mut MethodCtx, line: u32) {
        m.body.add_op(OpCode::CurLine(line));
        self.parse_paren_bool(u, m);
        let cond_jump = m.body.add_op(OpCode::NotCondJump(0));
        u.flow.push(FlowItem::new(
            FlowKind::If {
                cond_jump: Some(cond_jump),
                exit_jumps: smallvec::SmallVec::new(),
                has_else: false,
            },
            line,
        ));
    }

    fn stmt_else_if(&mut self, u: &mut Unit, m: &mut MethodCtx, line: u32) {
        let state = match u.flow.top() {
            Some(FlowItem {
                kind: FlowKind::If {
                    cond_jump, has_else, ..
                },
                ..
            }) => (*cond_jump, *has_else),
            _ => {
                self.error(u, "'ElseIf' without an open If");
                return;
            }
        };
        let (Some(prev_jump), false) = state else {
            self.error(u, "'ElseIf' cannot follow 'Else'");
            return;
        };
        let exit = m.body.add_op(OpCode::Jump(0));
        m.body.patch_jump(prev_jump, m.body.next_ip());
        m.body.add_op(OpCode::CurLine(line));
        self.parse_paren_bool(u, m);
        let new_jump = m.body.add_op(OpCode::NotCondJump(0));
        if let Some(FlowItem {
            kind: FlowKind::If {
                cond_jump, exit_jumps, ..
            },
            ..
        }) = u.flow.top_mut()
        {
            exit_jumps.push(exit);
            *cond_jump = Some(new_jump);
        }
    }

    fn stmt_else(&mut self, u: &mut Unit, m: &mut MethodCtx) {
        let state = match u.flow.top() {
            Some(FlowItem {
                kind: FlowKind::If {
                    cond_jump, has_else, ..
                },
                ..
            }) => (*cond_jump, *has_else),
            _ => {
                self.error(u, "'Else' without an open If");
                return;
            }
        };
        let (Some(prev_jump), false) = state else {
            self.error(u, "this If already has an Else");
            return;
        };
        let exit = m.body.add_op(OpCode::Jump(0));
        m.body.patch_jump(prev_jump, m.body.next_ip());
        if let Some(FlowItem {
            kind: FlowKind::If {
                cond_jump,
                exit_jumps,
                has_else,
            },
            ..
        }) = u.flow.top_mut()
        {
            exit_jumps.push(exit);
            *cond_jump = None;
            *has_else = true;
        }
    }

    fn stmt_end_if(&mut self, u: &mut Unit, m: &mut MethodCtx) {
        match u.flow.pop() {
            Some(FlowItem {
                kind: FlowKind::If {
                    cond_jump, exit_jumps, ..
                },
                ..
            }) => {
                let here = m.body.next_ip();
                if let Some(jump) = cond_jump {
                    m.body.patch_jump(jump, here);
                }
                for jump in exit_jumps {
                    m.body.patch_jump(jump, here);
                }
                self.expect_semi(u);
            }
            other => {
                self.unbalanced_end(u, "EndIf", other);
            }
        }
    }

    fn stmt_while(&mut self, u: &mut Unit, m: &mut MethodCtx, line: u32) {
        m.body.add_op(OpCode::CurLine(line));
        let loop_top = m.body.next_ip();
        self.parse_paren_bool(u, m);
        let cond_jump = m.body.add_op(OpCode::NotCondJump(0));
        u.flow.push(FlowItem::new(FlowKind::While { loop_top, cond_jump }, line));
    }

    fn stmt_end_while(&mut self, u: &mut Unit, m: &mut MethodCtx) {
        match u.flow.pop() {
            Some(FlowItem {
                kind: FlowKind::While { loop_top, cond_jump },
                breaks,
                ..
            }) => {
                m.body.add_op(OpCode::Jump(loop_top));
                let here = m.body.next_ip();
                m.body.patch_jump(cond_jump, here);
                for jump in breaks {
                    m.body.patch_jump(jump, here);
                }
                self.expect_semi(u);
            }
            other => self.unbalanced_end(u, "EndWhile", other),
        }
    }

    fn stmt_do_while(&mut self, u: &mut Unit, m: &mut MethodCtx, line: u32) {
        match u.flow.pop() {
            Some(FlowItem {
                kind: FlowKind::DoLoop { loop_top },
                breaks,
                ..
            }) => {
                m.body.add_op(OpCode::CurLine(line));
                self.parse_paren_bool(u, m);
                m.body.add_op(OpCode::CondJump(loop_top));
                let here = m.body.next_ip();
                for jump in breaks {
                    m.body.patch_jump(jump, here);
                }
                self.expect_semi(u);
            }
            other => self.unbalanced_end(u, "DoWhile", other),
        }
    }

    fn stmt_for_each(&mut self, u: &mut Unit, m: &mut MethodCtx, line: u32) {
        m.body.add_op(OpCode::CurLine(line));
        self.expect(u, &Token::OpenParen, "'(' after ForEach");
        let Some(name) = self.expect_ident(u) else {
            self.recover_to_semi(u);
            return;
        };
        self.expect(u, &Token::CloseParen, "')'");
        let Some(slot) = self.resolve_slot(u, m, &name) else {
            self.error(u, &format!("'{name}' does not name a value"));
            return;
        };
        let is_enum = self
            .engine
            .registry
            .class_by_id(slot.class_id)
            .is_ok_and(|c| matches!(c.kind(), ClassKind::Enum(_)));
        if !is_enum {
            self.error(u, "'ForEach' iterates an enum variable");
            return;
        }
        if !slot.writable {
            self.error(u, "'ForEach' needs a writable enum variable");
            return;
        }
        self.emit_slot_push(m, slot);
        m.body.add_op(OpCode::ResetEnum);
        u.flow.push(FlowItem::new(
            FlowKind::ForEach {
                loop_top: m.body.next_ip(),
                var: slot,
            },
            line,
        ));
    }

    fn stmt_end_for_each(&mut self, u: &mut Unit, m: &mut MethodCtx) {
        match u.flow.pop() {
            Some(FlowItem {
                kind: FlowKind::ForEach { loop_top, var },
                breaks,
                ..
            }) => {
                self.emit_slot_push(m, var);
                m.body.add_op(OpCode::CondEnumInc);
                m.body.add_op(OpCode::CondJump(loop_top));
                let here = m.body.next_ip();
                for jump in breaks {
                    m.body.patch_jump(jump, here);
                }
                self.expect_semi(u);
            }
            other => self.unbalanced_end(u, "EndForEach", other),
        }
    }

    fn stmt_break(&mut self, u: &mut Unit, m: &mut MethodCtx, line: u32) {
        m.body.add_op(OpCode::CurLine(line));
        let jump = m.body.add_op(OpCode::Jump(0));
        if !u.flow.add_break(jump) {
            self.error(u, "'Break' needs an enclosing loop or switch, with no Try in between");
        }
        self.expect_semi(u);
    }

    // ----- switch -----------------------------------------------------------

    fn stmt_switch(&mut self, u: &mut Unit, m: &mut MethodCtx, line: u32) {
        m.body.add_op(OpCode::CurLine(line));
        self.expect(u, &Token::OpenParen, "'(' after Switch");
        let Some(val) = self.parse_expr(u, m) else {
            self.recover_to_semi(u);
            return;
        };
        self.expect(u, &Token::CloseParen, "')'");
        let switchable = self
            .engine
            .registry
            .class_by_id(val.class_id)
            .is_ok_and(|c| matches!(c.kind(), ClassKind::Enum(_)))
            || types::is_cardinal(val.class_id)
            || types::is_integer(val.class_id)
            || matches!(
                Intrinsic::from_id(val.class_id),
                Some(Intrinsic::Char | Intrinsic::Boolean)
            );
        if !switchable {
            self.error(u, "'Switch' takes an enum, integral, char, or boolean value");
            return;
        }
        let table = match m.body.add_jump_table() {
            Ok(table) => table,
            Err(err) => {
                self.native_error(u, &err);
                return;
            }
        };
        m.body.add_op(OpCode::TableJump(table, val.class_id));
        u.flow.push(FlowItem::new(
            FlowKind::Switch {
                table,
                switch_class: val.class_id,
                in_case: false,
                saw_default: false,
            },
            line,
        ));
    }

    fn stmt_case(&mut self, u: &mut Unit, m: &mut MethodCtx, fall_through: bool) {
        let Some(FlowItem {
            kind: FlowKind::Switch {
                table,
                switch_class,
                in_case,
                ..
            },
            ..
        }) = u.flow.top()
        else {
            self.error(u, "'Case' outside any Switch");
            self.recover_to_semi(u);
            return;
        };
        if *in_case {
            self.error(u, "the previous case block is still open");
            return;
        }
        let (table, switch_class) = (*table, *switch_class);

        let here = m.body.next_ip();
        loop {
            let Some(value) = self.parse_case_value(u, switch_class) else {
                self.recover_to_semi(u);
                return;
            };
            let Some(jump_table) = m.body.jump_table_mut(table) else {
                return;
            };
            if jump_table.has_case(value) {
                self.error(u, "this case value is already handled");
            } else {
                jump_table.add_case(value, here);
            }
            if self.peek(u) == Token::Comma {
                self.next(u);
            } else {
                break;
            }
        }
        if fall_through {
            // an FTCase shares the following case's block
            self.expect_semi(u);
        } else {
            self.expect(u, &Token::Colon, "':' after the case value");
            if let Some(FlowItem {
                kind: FlowKind::Switch { in_case, .. },
                ..
            }) = u.flow.top_mut()
            {
                *in_case = true;
            }
        }
    }

    /// One constant case value matching the switch class.
    fn parse_case_value(&mut self, u: &mut Unit, switch_class: ClassId) -> Option<CaseValue> {
        let lexed = self.next(u);
        match lexed.token {
            Token::Num(crate::parser::NumLit::Int { value, .. }) => {
                if types::is_cardinal(switch_class) && value >= 0 {
                    Some(CaseValue::Card(value as u64))
                } else if types::is_integer(switch_class) {
                    Some(CaseValue::Int(value as i64))
                } else {
                    self.error(u, "a numeric case needs an integral switch value");
                    None
                }
            }
            Token::CharLit(c) if Intrinsic::from_id(switch_class) == Some(Intrinsic::Char) => Some(CaseValue::Char(c)),
            Token::Kw(Kw::True) if Intrinsic::from_id(switch_class) == Some(Intrinsic::Boolean) => {
                Some(CaseValue::Bool(true))
            }
            Token::Kw(Kw::False) if Intrinsic::from_id(switch_class) == Some(Intrinsic::Boolean) => {
                Some(CaseValue::Bool(false))
            }
            Token::Ident(name) => {
                let class = self.engine.registry.class_by_id(switch_class).ok()?;
                if let Some(ordinal) = class.ordinal_from_name(&name) {
                    return Some(CaseValue::Enum(ordinal));
                }
                // a qualified enum value: EnumType.Item
                let Ok(class_id) = self.resolve_type(u, &name) else {
                    self.error(u, &format!("'{name}' is not a value of the switch class"));
                    return None;
                };
                if class_id != switch_class {
                    self.error(u, "the case value's class does not match the switch value");
                    return None;
                }
                self.expect(u, &Token::Period, "'.' before the enum value");
                let item = self.expect_ident(u)?;
                let ordinal = self
                    .engine
                    .registry
                    .class_by_id(switch_class)
                    .ok()
                    .and_then(|c| c.ordinal_from_name(&item));
                match ordinal {
                    Some(ordinal) => Some(CaseValue::Enum(ordinal)),
                    None => {
                        self.error(u, &format!("'{item}' is not a value of the switch enum"));
                        None
                    }
                }
            }
            other => {
                self.error(u, &format!("expected a case value, found {}", other.describe()));
                None
            }
        }
    }

    fn stmt_default(&mut self, u: &mut Unit, m: &mut MethodCtx) {
        let here = m.body.next_ip();
        let Some(FlowItem {
            kind: FlowKind::Switch {
                table,
                in_case,
                saw_default,
                ..
            },
            ..
        }) = u.flow.top_mut()
        else {
            self.error(u, "'Default' outside any Switch");
            return;
        };
        if *in_case {
            self.error(u, "the previous case block is still open");
            return;
        }
        if *saw_default {
            self.error(u, "this Switch already has a Default");
            return;
        }
        *in_case = true;
        *saw_default = true;
        let table = *table;
        if let Some(jump_table) = m.body.jump_table_mut(table) {
            jump_table.set_default(here);
        }
        self.expect(u, &Token::Colon, "':' after Default");
    }

    fn stmt_end_case(&mut self, u: &mut Unit, m: &mut MethodCtx) {
        let jump = m.body.add_op(OpCode::Jump(0));
        match u.flow.top_mut() {
            Some(FlowItem {
                kind: FlowKind::Switch { in_case, .. },
                breaks,
                ..
            }) if *in_case => {
                *in_case = false;
                breaks.push(jump);
                self.expect_semi(u);
            }
            _ => self.error(u, "'EndCase' without an open case block"),
        }
    }

    fn stmt_end_switch(&mut self, u: &mut Unit, m: &mut MethodCtx) {
        match u.flow.pop() {
            Some(FlowItem {
                kind: FlowKind::Switch {
                    in_case, saw_default, ..
                },
                breaks,
                line,
                ..
            }) => {
                if in_case {
                    self.error(u, "the last case block is still open");
                }
                if !saw_default {
                    self.error(u, &format!("the Switch at line {line} has no Default case"));
                }
                let here = m.body.next_ip();
                for jump in breaks {
                    m.body.patch_jump(jump, here);
                }
                self.expect_semi(u);
            }
            other => self.unbalanced_end(u, "EndSwitch", other),
        }
    }

    // ----- try / catch ------------------------------------------------------

    fn stmt_try(&mut self, u: &mut Unit, m: &mut MethodCtx, line: u32) {
        m.body.add_op(OpCode::CurLine(line));
        let op_ip = m.body.add_op(OpCode::Try(0));
        u.flow.push(FlowItem::new(FlowKind::Try { op_ip }, line));
    }

    fn stmt_catch(&mut self, u: &mut Unit, m: &mut MethodCtx) {
        match u.flow.pop() {
            Some(FlowItem {
                kind: FlowKind::Try { op_ip },
                line,
                ..
            }) => {
                // normal path: drop the try marker and hop over the catch
                m.body.add_op(OpCode::EndTry);
                let skip_jump = m.body.add_op(OpCode::Jump(0));
                m.body.patch_jump(op_ip, m.body.next_ip());
                u.flow.push(FlowItem::new(FlowKind::Catch { skip_jump }, line));
            }
            other => self.unbalanced_end(u, "Catch", other),
        }
    }

    fn stmt_end_try(&mut self, u: &mut Unit, m: &mut MethodCtx) {
        match u.flow.pop() {
            Some(FlowItem {
                kind: FlowKind::Catch { skip_jump },
                ..
            }) => {
                // exception path: drop the exception marker
                m.body.add_op(OpCode::EndTry);
                m.body.patch_jump(skip_jump, m.body.next_ip());
                self.expect_semi(u);
            }
            other => self.unbalanced_end(u, "EndTry", other),
        }
    }

    // ----- return / throw ---------------------------------------------------

    fn stmt_return(&mut self, u: &mut Unit, m: &mut MethodCtx, line: u32) {
        m.body.add_op(OpCode::CurLine(line));
        if self.peek(u) == Token::Semi {
            self.next(u);
            if m.ret_class != Intrinsic::Void.id() {
                self.error(u, "this method returns a value");
            }
        } else {
            if m.ret_class == Intrinsic::Void.id() {
                self.error(u, "this method returns nothing");
            }
            if self.parse_expr_with_target(u, m, m.ret_class).is_some() {
                m.body.add_op(OpCode::PopToReturn);
            }
            self.expect_semi(u);
        }
        m.body.add_op(OpCode::Return);
    }

    fn stmt_throw(&mut self, u: &mut Unit, m: &mut MethodCtx, line: u32) {
        m.body.add_op(OpCode::CurLine(line));
        self.expect(u, &Token::OpenParen, "'(' after Throw");
        let Some(err_val) = self.parse_expr(u, m) else {
            self.recover_to_semi(u);
            return;
        };
        let is_enum = self
            .engine
            .registry
            .class_by_id(err_val.class_id)
            .is_ok_and(|c| matches!(c.kind(), ClassKind::Enum(_)));
        if !is_enum {
            self.error(u, "'Throw' takes an error enum value");
        }
        let mut fmt_count = 0u32;
        while self.peek(u) == Token::Comma {
            self.next(u);
            let Some(arg) = self.parse_expr(u, m) else {
                self.recover_to_semi(u);
                return;
            };
            if !self
                .engine
                .registry
                .is_derived_from(arg.class_id, Intrinsic::Formattable.id())
            {
                self.error(u, "throw arguments must be formattable");
            }
            fmt_count += 1;
        }
        if fmt_count as usize > MAX_THROW_FMT_ARGS {
            self.error(u, "a throw takes at most four formattable arguments");
        }
        self.expect(u, &Token::CloseParen, "')'");
        self.expect_semi(u);
        if fmt_count == 0 {
            m.body.add_op(OpCode::Throw(false));
        } else {
            m.body.add_op(OpCode::ThrowFmt(fmt_count));
        }
    }

    fn stmt_rethrow(&mut self, u: &mut Unit, m: &mut MethodCtx, line: u32) {
        if !u.flow.in_catch() {
            self.error(u, "'Rethrow' is only available inside a Catch block");
        }
        m.body.add_op(OpCode::CurLine(line));
        self.expect_semi(u);
        m.body.add_op(OpCode::Throw(true));
    }

    // ----- expression statements --------------------------------------------

    /// Assignment, call chain, increment/decrement, or compound
    /// assignment, all starting from a reference.
    fn stmt_expression(&mut self, u: &mut Unit, m: &mut MethodCtx, first: Lexed) {
        match first.token {
            Token::Ident(name) => {
                let Some(slot) = self.resolve_slot(u, m, &name) else {
                    self.error(u, &format!("'{name}' does not name a value"));
                    self.recover_to_semi(u);
                    return;
                };
                self.finish_slot_statement(u, m, slot);
            }
            Token::Kw(Kw::This) => {
                self.expect(u, &Token::Period, "'.' after This");
                let Some(name) = self.expect_ident(u) else {
                    self.recover_to_semi(u);
                    return;
                };
                let Some(val) = self.emit_call(u, m, CallRecv::This, u.own_id, &name) else {
                    self.recover_to_semi(u);
                    return;
                };
                self.finish_call_statement(u, m, val);
            }
            Token::Kw(Kw::Parent) => {
                self.expect(u, &Token::Period, "'.' after Parent");
                let Some(name) = self.expect_ident(u) else {
                    self.recover_to_semi(u);
                    return;
                };
                let parent = self
                    .engine
                    .registry
                    .class_by_id(u.own_id)
                    .map(crate::class::ClassInfo::parent_id);
                let Ok(parent) = parent else {
                    self.recover_to_semi(u);
                    return;
                };
                let Some(val) = self.emit_call(u, m, CallRecv::Parent, parent, &name) else {
                    self.recover_to_semi(u);
                    return;
                };
                self.finish_call_statement(u, m, val);
            }
            Token::ExceptionRef => {
                if !u.flow.in_catch() {
                    self.error(u, "'$Exception' is only available inside a Catch block");
                    self.recover_to_semi(u);
                    return;
                }
                self.expect(u, &Token::Period, "'.' after $Exception");
                let Some(name) = self.expect_ident(u) else {
                    self.recover_to_semi(u);
                    return;
                };
                let Some(val) = self.emit_call(u, m, CallRecv::Except, Intrinsic::Exception.id(), &name) else {
                    self.recover_to_semi(u);
                    return;
                };
                self.finish_call_statement(u, m, val);
            }
            other => {
                self.error(u, &format!("expected a statement, found {}", other.describe()));
                self.recover_to_semi(u);
            }
        }
    }

    fn finish_slot_statement(&mut self, u: &mut Unit, m: &mut MethodCtx, slot: SlotRef) {
        match self.peek(u) {
            Token::Assign => {
                self.next(u);
                if !slot.writable {
                    self.error(u, "the assignment target cannot be written");
                }
                self.emit_slot_push(m, slot);
                if self.parse_expr_with_target(u, m, slot.class_id).is_none() {
                    self.recover_to_semi(u);
                    return;
                }
                m.body.add_op(OpCode::Copy);
                self.expect_semi(u);
            }
            Token::Inc | Token::Dec => {
                let name = if self.next(u).token == Token::Inc { "Inc" } else { "Dec" };
                if !slot.writable {
                    self.error(u, "the target of '++'/'--' cannot be written");
                }
                let Some(method) = self.method_on(slot.class_id, name) else {
                    self.error(u, &format!("the class has no '{name}' method"));
                    self.recover_to_semi(u);
                    return;
                };
                m.body.add_op(OpCode::PushTempVar(method.ret_class()));
                m.body.add_op(OpCode::PushCurLine);
                let op = match slot.kind {
                    SlotKind::Local => OpCode::CallLocal(slot.id, method.id()),
                    SlotKind::Parm => OpCode::CallParm(slot.id, method.id()),
                    SlotKind::Member => OpCode::CallMember(slot.id, method.id()),
                };
                m.body.add_op(op);
                m.body.add_op(OpCode::PopTop);
                self.expect_semi(u);
            }
            Token::AddEq | Token::SubEq | Token::MulEq | Token::DivEq | Token::ModEq | Token::AndEq | Token::OrEq
            | Token::XorEq => {
                let op_name = match self.next(u).token {
                    Token::AddEq => "Add",
                    Token::SubEq => "Sub",
                    Token::MulEq => "Mul",
                    Token::DivEq => "Div",
                    Token::ModEq => "ModDiv",
                    Token::AndEq => "And",
                    Token::OrEq => "Or",
                    _ => "Xor",
                };
                if !slot.writable {
                    self.error(u, "the assignment target cannot be written");
                }
                self.emit_slot_push(m, slot);
                self.emit_op_assign(u, m, slot.class_id, op_name);
            }
            Token::OpenBracket => {
                self.next(u);
                self.emit_slot_push(m, slot);
                let Some(val) = self.emit_index(u, m, slot.class_id) else {
                    self.recover_to_semi(u);
                    return;
                };
                self.finish_element_statement(u, m, val, slot.writable);
            }
            Token::Period => {
                self.next(u);
                let Some(name) = self.expect_ident(u) else {
                    self.recover_to_semi(u);
                    return;
                };
                let Some(val) = self.emit_call(u, m, CallRecv::Slot(slot), slot.class_id, &name) else {
                    self.recover_to_semi(u);
                    return;
                };
                self.finish_call_statement(u, m, val);
            }
            other => {
                self.error(u, &format!("this statement has no effect ({})", other.describe()));
                self.recover_to_semi(u);
            }
        }
    }

    /// After indexing left a live element handle on the stack.
    fn finish_element_statement(&mut self, u: &mut Unit, m: &mut MethodCtx, val: ExprVal, writable: bool) {
        match self.peek(u) {
            Token::Assign => {
                self.next(u);
                if !writable {
                    self.error(u, "the collection cannot be written through");
                }
                if self.parse_expr_with_target(u, m, val.class_id).is_none() {
                    self.recover_to_semi(u);
                    return;
                }
                m.body.add_op(OpCode::Copy);
                self.expect_semi(u);
            }
            Token::AddEq | Token::SubEq | Token::MulEq | Token::DivEq | Token::ModEq | Token::AndEq | Token::OrEq
            | Token::XorEq => {
                let op_name = match self.next(u).token {
                    Token::AddEq => "Add",
                    Token::SubEq => "Sub",
                    Token::MulEq => "Mul",
                    Token::DivEq => "Div",
                    Token::ModEq => "ModDiv",
                    Token::AndEq => "And",
                    Token::OrEq => "Or",
                    _ => "Xor",
                };
                if !writable {
                    self.error(u, "the collection cannot be written through");
                }
                self.emit_op_assign(u, m, val.class_id, op_name);
            }
            Token::OpenBracket => {
                self.next(u);
                let Some(inner) = self.emit_index(u, m, val.class_id) else {
                    self.recover_to_semi(u);
                    return;
                };
                self.finish_element_statement(u, m, inner, writable);
            }
            Token::Period => {
                self.next(u);
                let Some(name) = self.expect_ident(u) else {
                    self.recover_to_semi(u);
                    return;
                };
                let Some(call) = self.emit_call(u, m, CallRecv::Stack, val.class_id, &name) else {
                    self.recover_to_semi(u);
                    return;
                };
                self.finish_call_statement(u, m, call);
            }
            other => {
                self.error(u, &format!("this statement has no effect ({})", other.describe()));
                self.recover_to_semi(u);
            }
        }
    }

    /// `target op= expr` with the target handle already on the stack:
    /// compute `target op expr` into a temp, then copy it back.
    fn emit_op_assign(&mut self, u: &mut Unit, m: &mut MethodCtx, class_id: ClassId, op_name: &str) {
        let Some(method) = self.method_on(class_id, op_name) else {
            self.error(u, &format!("the class has no '{op_name}' operator"));
            self.recover_to_semi(u);
            return;
        };
        let Some(parm_class) = method.parms().first().map(|p| p.class_id) else {
            self.recover_to_semi(u);
            return;
        };
        m.body.add_op(OpCode::PushTempVar(method.ret_class()));
        m.body.add_op(OpCode::PushCurLine);
        let mark = m.body.next_ip();
        let Some(rhs) = self.parse_expr(u, m) else {
            self.recover_to_semi(u);
            return;
        };
        if self.coerce_to(u, m, rhs, parm_class, mark).is_none() {
            self.recover_to_semi(u);
            return;
        }
        m.body.add_op(OpCode::CallStack(3, method.id()));
        // the result lands back in the target below it
        m.body.add_op(OpCode::Copy);
        self.expect_semi(u);
    }

    /// After a call in statement position: chain further or discard the
    /// return value.
    fn finish_call_statement(&mut self, u: &mut Unit, m: &mut MethodCtx, mut val: ExprVal) {
        loop {
            match self.peek(u) {
                Token::Semi => {
                    self.next(u);
                    m.body.add_op(OpCode::PopTop);
                    return;
                }
                Token::Period => {
                    self.next(u);
                    let Some(name) = self.expect_ident(u) else {
                        self.recover_to_semi(u);
                        return;
                    };
                    let Some(next) = self.emit_call(u, m, CallRecv::Stack, val.class_id, &name) else {
                        self.recover_to_semi(u);
                        return;
                    };
                    val = next;
                }
                Token::OpenBracket => {
                    self.next(u);
                    let Some(elem) = self.emit_index(u, m, val.class_id) else {
                        self.recover_to_semi(u);
                        return;
                    };
                    self.finish_element_statement(u, m, elem, true);
                    return;
                }
                other => {
                    self.error(u, &format!("expected ';' or a chained call, found {}", other.describe()));
                    self.recover_to_semi(u);
                    return;
                }
            }
        }
    }

    // ----- shared bits ------------------------------------------------------

    /// `( boolean-expression )`
    fn parse_paren_bool(&mut self, u: &mut Unit, m: &mut MethodCtx) {
        self.expect(u, &Token::OpenParen, "'('");
        if let Some(val) = self.parse_expr(u, m) {
            if val.class_id != Intrinsic::Boolean.id() {
                self.error(u, "the condition must be a boolean value");
            }
        }
        self.expect(u, &Token::CloseParen, "')'");
    }

    fn unbalanced_end(&mut self, u: &Unit, what: &str, got: Option<FlowItem>) {
        match got {
            Some(item) => self.error(u, &format!("'{what}' closes a {} block", item.describe())),
            None => self.error(u, &format!("'{what}' without an open block")),
        }
    }
}
