//! Single-pass recursive-descent statement executor and expression evaluator.
//!
//! There is no separate AST. A statement is executed by walking source bytes
//! once; an expression is evaluated by a flat two-array Pratt machine (values
//! and operator token positions interleaved on one stack, operator positions
//! additionally indexed by a second array that gets bubble-sorted into
//! application order). Re-entering a loop body or a function call means
//! resetting `pos` to a remembered offset and walking the same bytes again —
//! the "AST" is just the source buffer plus a cursor.

use std::rc::Rc;

use crate::api::Engine;
use crate::error::ScriptError;
use crate::function;
use crate::lexer::{Lexer, Token, TokenInfo};
use crate::literal::{decode_string_literal, format_number, parse_number};
use crate::resource::EXPR_MAX;
use crate::scope;
use crate::value::{Type, Value};

#[derive(Clone, Copy)]
enum Item {
    Val(Value),
    Op(Token),
}

/// An addressable assignment target: either an existing `Property` entity,
/// or an as-yet-undeclared identifier (a source span) that plain `=` may
/// turn into a fresh global.
enum LValue {
    Existing(Value),
    Missing(Value),
}

fn precedence(tok: Token) -> u8 {
    use Token::*;
    match tok {
        Dot | Call => 19,
        PostInc | PostDec => 17,
        Not | Neg | Typeof | UPlus | UMinus => 16,
        Exp => 15,
        Mul | Div | Rem => 14,
        Plus | Minus => 13,
        Shl | Shr | ZShr => 12,
        Lt | Le | Gt | Ge => 11,
        Eq | Ne => 10,
        And => 9,
        Xor => 8,
        Or => 7,
        LAnd => 6,
        LOr => 5,
        other if other.is_assign() => 3,
        _ => 0,
    }
}

/// Finds the stack slot an operator at `idx` should read/write its left
/// operand at, walking back through the contiguous run of slots already
/// claimed (masked) by higher-precedence operators applied earlier in this
/// pass — this is what makes `a+b+c` write `a+b`'s result back into `a`'s
/// slot so the next `+` picks it up as its left operand.
fn backfill_slot(mask: u32, idx: usize) -> usize {
    let mut ri = idx;
    while ri > 0 && (mask & (1 << ri)) != 0 {
        ri -= 1;
    }
    if mask & (1 << ri) == 0 {
        ri += 1;
    }
    ri
}

impl Engine {
    // --- token cursor -----------------------------------------------------

    fn next_token(&mut self) -> Result<TokenInfo, ScriptError> {
        let mut lx = Lexer::new(&self.src);
        lx.set_pos(self.pos);
        let info = lx.next()?;
        self.pos = lx.pos();
        self.tok = info;
        Ok(info)
    }

    fn lookahead_token(&self) -> Result<TokenInfo, ScriptError> {
        let mut lx = Lexer::new(&self.src);
        lx.set_pos(self.pos);
        lx.next()
    }

    fn peek_is(&self, want: Token) -> Result<bool, ScriptError> {
        Ok(self.lookahead_token()?.tok == want)
    }

    fn slice(&self, off: u32, len: u32) -> &[u8] {
        &self.src[off as usize..(off + len) as usize]
    }

    fn text(&self, info: TokenInfo) -> &[u8] {
        self.slice(info.offset, info.len)
    }

    fn expect(&mut self, want: Token) -> Result<TokenInfo, ScriptError> {
        let info = self.next_token()?;
        if info.tok != want {
            return Err(self.unexpected(info));
        }
        Ok(info)
    }

    fn unexpected(&self, info: TokenInfo) -> ScriptError {
        let word = if info.tok == Token::Eof {
            "end of input".to_string()
        } else {
            String::from_utf8_lossy(self.text(info)).into_owned()
        };
        ScriptError::UnexpectedToken(word.into_boxed_str())
    }

    fn consume_semicolon(&mut self) -> Result<(), ScriptError> {
        if self.peek_is(Token::Semicolon)? {
            self.next_token()?;
        }
        Ok(())
    }

    // --- top level ----------------------------------------------------------

    /// Evaluates `source` as a sequence of top-level statements, returning
    /// the last statement's value, or a script-visible `Error` value (also
    /// recorded in `self.errmsg`) on failure.
    pub(crate) fn run(&mut self, source: &str) -> Value {
        self.errmsg = [0u8; crate::error::ERROR_MESSAGE_CAPACITY];
        self.src = Rc::from(source.as_bytes());
        self.pos = 0;
        match self.statements_until(Token::Eof) {
            Ok(v) => v,
            Err(e) => {
                e.write_into(&mut self.errmsg);
                Value::error()
            }
        }
    }

    fn maybe_collect(&mut self) {
        if self.lev == 0 && self.arena.usage_percent() >= self.gc_threshold {
            self.scope = self.arena.collect(self.scope);
        }
    }

    fn statements_until(&mut self, stop: Token) -> Result<Value, ScriptError> {
        let mut last = Value::undefined();
        loop {
            let la = self.lookahead_token()?;
            if la.tok == stop || la.tok == Token::Eof {
                break;
            }
            if !self.flags.noexec {
                self.maybe_collect();
            }
            last = self.statement()?;
            if self.flags.brk || self.flags.cont || self.flags.ret {
                break;
            }
        }
        Ok(last)
    }

    fn statement(&mut self) -> Result<Value, ScriptError> {
        let la = self.lookahead_token()?;
        match la.tok {
            Token::Let => self.let_stmt(),
            Token::If => self.if_stmt(),
            Token::While => self.while_stmt(),
            Token::Break => self.break_stmt(),
            Token::Continue => self.continue_stmt(),
            Token::Return => self.return_stmt(),
            Token::LBrace => self.block_stmt(),
            Token::Semicolon => {
                self.next_token()?;
                Ok(Value::undefined())
            }
            Token::For | Token::Switch | Token::Try | Token::Class | Token::With | Token::New | Token::Delete | Token::Var | Token::Const | Token::Yield | Token::Instanceof | Token::This => {
                self.next_token()?;
                Err(ScriptError::NotImplemented(String::from_utf8_lossy(self.text(la)).into_owned().into_boxed_str()))
            }
            _ => {
                let v = self.expression(&[Token::Semicolon])?;
                self.consume_semicolon()?;
                Ok(v)
            }
        }
    }

    fn block_or_stmt(&mut self) -> Result<Value, ScriptError> {
        if self.peek_is(Token::LBrace)? {
            self.block_stmt()
        } else {
            self.statement()
        }
    }

    fn block_stmt(&mut self) -> Result<Value, ScriptError> {
        self.expect(Token::LBrace)?;
        self.recursion.enter()?;
        let result = self.run_block_body();
        self.recursion.exit();
        let result = result?;
        self.expect(Token::RBrace)?;
        Ok(result)
    }

    fn run_block_body(&mut self) -> Result<Value, ScriptError> {
        let brk0 = self.arena.brk();
        let parent = self.scope;
        self.scope = scope::push(&mut self.arena, parent)?;
        let brk_after_push = self.arena.brk();
        let result = self.statements_until(Token::RBrace);
        self.scope = parent;
        if result.is_ok() && self.arena.brk() == brk_after_push {
            self.arena.set_brk(brk0);
        }
        result
    }

    fn let_stmt(&mut self) -> Result<Value, ScriptError> {
        self.expect(Token::Let)?;
        let mut last = Value::undefined();
        loop {
            let name_tok = self.expect(Token::Identifier)?;
            let name_bytes = self.text(name_tok).to_vec();
            let init = if self.peek_is(Token::Assign)? {
                self.next_token()?;
                self.expression(&[Token::Comma, Token::Semicolon])?
            } else {
                Value::undefined()
            };
            if !self.flags.noexec {
                let name_val = self.arena.mk_string(&name_bytes).map_err(|_| ScriptError::Oom)?;
                scope::declare(&mut self.arena, self.scope, name_val, init)?;
            }
            last = init;
            if self.peek_is(Token::Comma)? {
                self.next_token()?;
                continue;
            }
            break;
        }
        self.consume_semicolon()?;
        Ok(last)
    }

    fn if_stmt(&mut self) -> Result<Value, ScriptError> {
        self.expect(Token::If)?;
        self.expect(Token::LParen)?;
        let cond = self.expression(&[Token::RParen])?;
        self.expect(Token::RParen)?;
        let truthy = self.truthy(cond)?;

        let saved_noexec = self.flags.noexec;
        let mut result = Value::undefined();

        self.flags.noexec = saved_noexec || !truthy;
        let r = self.block_or_stmt()?;
        self.flags.noexec = saved_noexec;
        if truthy {
            result = r;
        }

        if self.peek_is(Token::Else)? {
            self.next_token()?;
            self.flags.noexec = saved_noexec || truthy;
            let r = self.block_or_stmt()?;
            self.flags.noexec = saved_noexec;
            if !truthy {
                result = r;
            }
        }
        Ok(result)
    }

    fn while_stmt(&mut self) -> Result<Value, ScriptError> {
        self.expect(Token::While)?;
        self.expect(Token::LParen)?;
        let cond_start = self.pos;
        let saved_loop = self.flags.in_loop;
        self.flags.in_loop = true;

        let mut result = Value::undefined();
        let mut body_end = None;
        loop {
            self.pos = cond_start;
            let cond = self.expression(&[Token::RParen])?;
            self.expect(Token::RParen)?;
            let truthy = self.truthy(cond)?;

            let saved_noexec = self.flags.noexec;
            self.flags.noexec = saved_noexec || !truthy;
            let r = self.block_or_stmt()?;
            self.flags.noexec = saved_noexec;
            body_end = Some(self.pos);

            if !truthy {
                break;
            }
            result = r;
            if self.flags.brk {
                self.flags.brk = false;
                break;
            }
            if self.flags.cont {
                self.flags.cont = false;
            }
            if self.flags.ret {
                break;
            }
        }
        self.flags.in_loop = saved_loop;
        if let Some(end) = body_end {
            self.pos = end;
        }
        Ok(result)
    }

    fn break_stmt(&mut self) -> Result<Value, ScriptError> {
        self.expect(Token::Break)?;
        if !self.flags.in_loop {
            return Err(ScriptError::NotInLoop);
        }
        self.flags.brk = true;
        self.consume_semicolon()?;
        Ok(Value::undefined())
    }

    fn continue_stmt(&mut self) -> Result<Value, ScriptError> {
        self.expect(Token::Continue)?;
        if !self.flags.in_loop {
            return Err(ScriptError::NotInLoop);
        }
        self.flags.cont = true;
        self.consume_semicolon()?;
        Ok(Value::undefined())
    }

    fn return_stmt(&mut self) -> Result<Value, ScriptError> {
        self.expect(Token::Return)?;
        if !self.flags.in_call {
            return Err(ScriptError::NotInFunc);
        }
        let la = self.lookahead_token()?;
        let v = if matches!(la.tok, Token::Semicolon | Token::RBrace | Token::Eof) {
            Value::undefined()
        } else {
            self.expression(&[Token::Semicolon])?
        };
        self.flags.ret = true;
        self.consume_semicolon()?;
        Ok(v)
    }

    // --- expressions ----------------------------------------------------------

    fn truthy(&self, v: Value) -> Result<bool, ScriptError> {
        match v.truthy_immediate() {
            Some(b) => Ok(b),
            None => Ok(!self.arena.string_bytes(v).is_empty()),
        }
    }

    fn resolveprop(&self, v: Value) -> Value {
        if v.value_type() == Type::Property {
            self.arena.prop_value(v)
        } else {
            v
        }
    }

    fn resolve_slot(&self, stack: &[Item], names: &[Option<Value>], idx: usize) -> Result<Value, ScriptError> {
        if let Some(coderef) = names[idx] {
            let text = String::from_utf8_lossy(self.slice(coderef.coderef_offset(), coderef.coderef_len())).into_owned();
            return Err(ScriptError::NotFound(text.into_boxed_str()));
        }
        match stack[idx] {
            Item::Val(v) => Ok(self.resolveprop(v)),
            Item::Op(_) => unreachable!("stack slot holds an operator marker"),
        }
    }

    fn lvalue_at(&self, stack: &[Item], names: &[Option<Value>], idx: usize) -> Result<LValue, ScriptError> {
        if let Some(coderef) = names[idx] {
            return Ok(LValue::Missing(coderef));
        }
        match stack[idx] {
            Item::Val(v) if v.value_type() == Type::Property => Ok(LValue::Existing(v)),
            _ => Err(ScriptError::BadLhs),
        }
    }

    /// A full expression: the flat operator/value stack plus genuinely
    /// short-circuiting ternary (`cond ? a : b`), which sits outside the
    /// stack because it has no fixed arity to bubble-sort against.
    fn expression(&mut self, terminators: &[Token]) -> Result<Value, ScriptError> {
        let mut with_question = [Token::Question; EXPR_MAX];
        let n = terminators.len().min(EXPR_MAX - 1);
        with_question[..n].copy_from_slice(&terminators[..n]);
        let cond = self.expr(&with_question[..=n])?;

        if !self.peek_is(Token::Question)? {
            return Ok(cond);
        }
        self.next_token()?;
        let truthy = self.truthy(cond)?;

        let saved_noexec = self.flags.noexec;
        self.flags.noexec = saved_noexec || !truthy;
        let a = self.expression(&[Token::Colon])?;
        self.flags.noexec = saved_noexec;
        self.expect(Token::Colon)?;
        self.flags.noexec = saved_noexec || truthy;
        let b = self.expression(terminators)?;
        self.flags.noexec = saved_noexec;

        Ok(if truthy { a } else { b })
    }

    /// The flat Pratt machine: no ternary, no statement awareness. Reads
    /// tokens until a terminator, pushing values and operator *positions*
    /// onto one interleaved stack, then sorts operator positions by
    /// descending precedence and applies them in that order.
    fn expr(&mut self, terminators: &[Token]) -> Result<Value, ScriptError> {
        let mut stack = [Item::Val(Value::undefined()); EXPR_MAX];
        let mut names: [Option<Value>; EXPR_MAX] = [None; EXPR_MAX];
        let mut ops = [0usize; EXPR_MAX];
        let mut n = 0usize;
        let mut nops = 0usize;
        let mut prev: Option<Token> = None;

        loop {
            let la = self.lookahead_token()?;
            if terminators.contains(&la.tok) || la.tok == Token::Eof {
                break;
            }
            if n >= EXPR_MAX {
                return Err(ScriptError::ExprTooDeep);
            }
            let info = self.next_token()?;
            let mut tok = info.tok;

            let after_dot = n > 0 && matches!(stack[n - 1], Item::Op(Token::Dot));
            if after_dot {
                if tok != Token::Identifier {
                    return Err(ScriptError::IdentExpected);
                }
                stack[n] = Item::Val(Value::coderef(info.offset, info.len));
                n += 1;
                prev = Some(Token::Identifier);
                continue;
            }

            if tok == Token::LParen && n > 0 && !prev.is_some_and(Token::is_operator) {
                tok = Token::Call;
            }
            if tok == Token::Plus || tok == Token::Minus {
                let convert = match prev {
                    None => true,
                    Some(pt) => !pt.allows_binary_plus_minus(),
                };
                if convert {
                    tok = if tok == Token::Plus { Token::UPlus } else { Token::UMinus };
                }
            }

            if tok.is_operator() {
                stack[n] = Item::Op(tok);
                ops[nops] = n;
                nops += 1;
                n += 1;
                if tok == Token::Call {
                    let args = self.capture_call_args()?;
                    if n >= EXPR_MAX {
                        return Err(ScriptError::ExprTooDeep);
                    }
                    stack[n] = Item::Val(args);
                    n += 1;
                }
            } else {
                let (value, marker) = self.primary(info)?;
                stack[n] = Item::Val(value);
                names[n] = marker;
                n += 1;
            }
            prev = Some(tok);
        }

        if n == 0 {
            return Ok(Value::undefined());
        }

        // bubble-sort operator positions by descending precedence; among
        // ties, right-associative families (assignment, `**`) prefer
        // applying the rightmost operator first so chains like `a=b=c`
        // associate right-to-left.
        loop {
            let mut swapped = false;
            for i in 0..nops.saturating_sub(1) {
                let a = match stack[ops[i]] {
                    Item::Op(t) => t,
                    _ => unreachable!(),
                };
                let b = match stack[ops[i + 1]] {
                    Item::Op(t) => t,
                    _ => unreachable!(),
                };
                let pa = precedence(a);
                let pb = precedence(b);
                let swap = pa < pb || (pa == pb && a.is_right_assoc() && ops[i] < ops[i + 1]);
                if swap {
                    ops.swap(i, i + 1);
                    swapped = true;
                }
            }
            if !swapped {
                break;
            }
        }

        let mut mask: u32 = 0;
        for i in 0..nops {
            let idx = ops[i];
            let op = match stack[idx] {
                Item::Op(t) => t,
                _ => unreachable!(),
            };
            let is_un = op.is_unary();
            let rassoc = op.is_right_assoc();
            let need_left = !(is_un && rassoc);
            let need_right = !(is_un && !rassoc);
            let lvalue_op = op.is_assign() || matches!(op, Token::PostInc | Token::PostDec);

            mask |= 1 << idx;
            let mut ri = idx;

            let result = if lvalue_op {
                if !need_left || idx < 1 {
                    return Err(ScriptError::BadExpr);
                }
                mask |= 1 << (idx - 1);
                ri = backfill_slot(mask, idx - 1);
                let lv = self.lvalue_at(&stack, &names, ri)?;
                let rhs = if need_right {
                    if idx + 1 >= n {
                        return Err(ScriptError::BadExpr);
                    }
                    mask |= 1 << (idx + 1);
                    self.resolve_slot(&stack, &names, idx + 1)?
                } else {
                    Value::undefined()
                };
                self.apply_assign_like(op, lv, rhs)?
            } else {
                let left = if need_left {
                    if idx < 1 {
                        return Err(ScriptError::BadExpr);
                    }
                    mask |= 1 << (idx - 1);
                    ri = backfill_slot(mask, idx - 1);
                    self.resolve_slot(&stack, &names, ri)?
                } else {
                    Value::undefined()
                };
                let right = if need_right {
                    if idx + 1 >= n {
                        return Err(ScriptError::BadExpr);
                    }
                    mask |= 1 << (idx + 1);
                    self.resolve_slot(&stack, &names, idx + 1)?
                } else {
                    Value::undefined()
                };
                self.apply_binary_or_unary(op, left, right)?
            };

            stack[ri] = Item::Val(result);
            names[ri] = None;
        }

        self.resolve_slot(&stack, &names, 0)
    }

    fn primary(&mut self, info: TokenInfo) -> Result<(Value, Option<Value>), ScriptError> {
        match info.tok {
            Token::Number => Ok((Value::number(parse_number(self.text(info))?), None)),
            Token::String => {
                let decoded = decode_string_literal(self.text(info))?;
                let v = self.arena.mk_string(&decoded).map_err(|_| ScriptError::Oom)?;
                Ok((v, None))
            }
            Token::True => Ok((Value::boolean(true), None)),
            Token::False => Ok((Value::boolean(false), None)),
            Token::Null => Ok((Value::null(), None)),
            Token::Undefined => Ok((Value::undefined(), None)),
            Token::Identifier => {
                let name = self.text(info);
                match scope::lookup_property(&self.arena, self.scope, name) {
                    Some(p) => Ok((p, None)),
                    None => Ok((Value::undefined(), Some(Value::coderef(info.offset, info.len)))),
                }
            }
            Token::LParen => {
                let v = self.expression(&[Token::RParen])?;
                self.expect(Token::RParen)?;
                Ok((v, None))
            }
            Token::LBrace => Ok((self.object_literal()?, None)),
            Token::Function => Ok((self.function_literal()?, None)),
            _ => Err(self.unexpected(info)),
        }
    }

    fn object_literal(&mut self) -> Result<Value, ScriptError> {
        self.expect(Token::LBrace)?;
        let obj = self.arena.mk_object(0).map_err(|_| ScriptError::Oom)?;
        if self.peek_is(Token::RBrace)? {
            self.next_token()?;
            return Ok(obj);
        }
        loop {
            let key_tok = self.next_token()?;
            let key_bytes = match key_tok.tok {
                Token::Identifier => self.text(key_tok).to_vec(),
                Token::String => decode_string_literal(self.text(key_tok))?,
                _ => return Err(self.unexpected(key_tok)),
            };
            self.expect(Token::Colon)?;
            let val = self.expression(&[Token::Comma, Token::RBrace])?;
            if !self.flags.noexec {
                let key = self.arena.mk_string(&key_bytes).map_err(|_| ScriptError::Oom)?;
                self.arena.set_prop(obj, key, val).map_err(|_| ScriptError::Oom)?;
            }
            if self.peek_is(Token::Comma)? {
                self.next_token()?;
                if self.peek_is(Token::RBrace)? {
                    self.next_token()?;
                    break;
                }
                continue;
            }
            self.expect(Token::RBrace)?;
            break;
        }
        Ok(obj)
    }

    fn function_literal(&mut self) -> Result<Value, ScriptError> {
        self.expect(Token::Function)?;
        let lparen = self.expect(Token::LParen)?;
        let start = lparen.offset;
        loop {
            let la = self.lookahead_token()?;
            if la.tok == Token::RParen {
                self.next_token()?;
                break;
            }
            self.expect(Token::Identifier)?;
            if self.peek_is(Token::Comma)? {
                self.next_token()?;
            } else {
                self.expect(Token::RParen)?;
                break;
            }
        }
        self.expect(Token::LBrace)?;

        let saved_noexec = self.flags.noexec;
        let saved_in_call = self.flags.in_call;
        let saved_in_loop = self.flags.in_loop;
        self.flags.noexec = true;
        self.flags.in_call = true;
        self.flags.in_loop = false;
        let body_result = self.statements_until(Token::RBrace);
        self.flags.noexec = saved_noexec;
        self.flags.in_call = saved_in_call;
        self.flags.in_loop = saved_in_loop;
        body_result?;

        let rbrace = self.expect(Token::RBrace)?;
        let end = rbrace.offset + rbrace.len;
        let text = self.slice(start, end - start).to_vec();
        let s = self.arena.mk_string(&text).map_err(|_| ScriptError::Oom)?;
        Ok(function::make_script(s))
    }

    fn capture_call_args(&mut self) -> Result<Value, ScriptError> {
        let start = self.pos;
        if self.peek_is(Token::RParen)? {
            self.next_token()?;
            return Ok(Value::coderef(start, 0));
        }
        let saved_noexec = self.flags.noexec;
        self.flags.noexec = true;
        let result = (|| -> Result<(), ScriptError> {
            loop {
                self.expression(&[Token::Comma, Token::RParen])?;
                if self.peek_is(Token::Comma)? {
                    self.next_token()?;
                    continue;
                }
                break;
            }
            Ok(())
        })();
        self.flags.noexec = saved_noexec;
        result?;
        let end = self.pos;
        self.expect(Token::RParen)?;
        let len = end - start;
        if len > Value::max_coderef_len() {
            return Err(ScriptError::ExprTooDeep);
        }
        Ok(Value::coderef(start, len))
    }

    // --- operator application ----------------------------------------------

    fn apply_assign_like(&mut self, op: Token, lv: LValue, rhs: Value) -> Result<Value, ScriptError> {
        if op == Token::Assign {
            return match lv {
                LValue::Existing(p) => {
                    self.arena.set_prop_value(p, rhs);
                    Ok(rhs)
                }
                LValue::Missing(coderef) => {
                    let bytes = self.slice(coderef.coderef_offset(), coderef.coderef_len()).to_vec();
                    let name = self.arena.mk_string(&bytes).map_err(|_| ScriptError::Oom)?;
                    scope::assign(&mut self.arena, self.scope, name, rhs)?;
                    Ok(rhs)
                }
            };
        }

        let prop = match lv {
            LValue::Existing(p) => p,
            LValue::Missing(coderef) => {
                let text = String::from_utf8_lossy(self.slice(coderef.coderef_offset(), coderef.coderef_len())).into_owned();
                return Err(ScriptError::NotFound(text.into_boxed_str()));
            }
        };
        let old = self.arena.prop_value(prop);

        if op == Token::PostInc || op == Token::PostDec {
            if old.value_type() != Type::Number {
                return Err(ScriptError::TypeMismatch);
            }
            let delta = if op == Token::PostInc { 1.0 } else { -1.0 };
            self.arena.set_prop_value(prop, Value::number(old.as_number() + delta));
            return Ok(old);
        }

        let binop = match op {
            Token::PlusAssign => Token::Plus,
            Token::MinusAssign => Token::Minus,
            Token::MulAssign => Token::Mul,
            Token::DivAssign => Token::Div,
            Token::RemAssign => Token::Rem,
            Token::ShlAssign => Token::Shl,
            Token::ShrAssign => Token::Shr,
            Token::ZShrAssign => Token::ZShr,
            Token::AndAssign => Token::And,
            Token::XorAssign => Token::Xor,
            Token::OrAssign => Token::Or,
            _ => unreachable!("not a compound-assign token"),
        };
        let newv = self.apply_binary_or_unary(binop, old, rhs)?;
        self.arena.set_prop_value(prop, newv);
        Ok(newv)
    }

    fn compare_eq(&self, op: Token, left: Value, right: Value) -> Result<Value, ScriptError> {
        if left.value_type() != right.value_type() {
            return Err(ScriptError::TypeMismatch);
        }
        let eq = match left.value_type() {
            Type::Number => (left.as_number() as i64) == (right.as_number() as i64),
            Type::Boolean => left.as_bool() == right.as_bool(),
            Type::Null | Type::Undefined => true,
            Type::Object | Type::Function => left.offset() == right.offset(),
            _ => return Err(ScriptError::TypeMismatch),
        };
        Ok(Value::boolean(if op == Token::Eq { eq } else { !eq }))
    }

    fn do_string_op(&mut self, op: Token, left: Value, right: Value) -> Result<Value, ScriptError> {
        match op {
            Token::Plus => {
                let mut bytes = self.arena.string_bytes(left).to_vec();
                bytes.extend_from_slice(self.arena.string_bytes(right));
                self.arena.mk_string(&bytes).map_err(|_| ScriptError::Oom)
            }
            Token::Eq => Ok(Value::boolean(self.arena.string_bytes(left) == self.arena.string_bytes(right))),
            Token::Ne => Ok(Value::boolean(self.arena.string_bytes(left) != self.arena.string_bytes(right))),
            _ => Err(ScriptError::BadStrOp),
        }
    }

    fn do_dot(&mut self, left: Value, right: Value) -> Result<Value, ScriptError> {
        if right.value_type() != Type::CodeRef {
            return Err(ScriptError::IdentExpected);
        }
        let name_bytes = self.slice(right.coderef_offset(), right.coderef_len()).to_vec();
        match left.value_type() {
            Type::Str if name_bytes == b"length" => Ok(Value::number(self.arena.string_bytes(left).len() as f64)),
            Type::Object => Ok(match self.arena.lookup_own_property(left, &name_bytes) {
                Some(off) => Value::offset_entity(Type::Property, off),
                None => Value::undefined(),
            }),
            _ => Err(ScriptError::LookupInNonObj),
        }
    }

    fn apply_binary_or_unary(&mut self, op: Token, left: Value, right: Value) -> Result<Value, ScriptError> {
        match op {
            Token::Not => {
                return Ok(Value::boolean(match right.value_type() {
                    Type::Boolean => !right.as_bool(),
                    Type::Number => right.as_number() == 0.0,
                    _ => return Err(ScriptError::TypeMismatch),
                }));
            }
            Token::Typeof => {
                let name = right.value_type().name();
                return self.arena.mk_string(name.as_bytes()).map_err(|_| ScriptError::Oom);
            }
            Token::LAnd => return Ok(Value::boolean(self.truthy(left)? && self.truthy(right)?)),
            Token::LOr => return Ok(Value::boolean(self.truthy(left)? || self.truthy(right)?)),
            Token::Dot => return self.do_dot(left, right),
            Token::Call => return self.call_value(left, right),
            _ => {}
        }

        if left.value_type() == Type::Str && right.value_type() == Type::Str {
            return self.do_string_op(op, left, right);
        }

        if op.is_unary() {
            if right.value_type() != Type::Number {
                return Err(ScriptError::TypeMismatch);
            }
        } else if op == Token::Eq || op == Token::Ne {
            return self.compare_eq(op, left, right);
        } else if left.value_type() != Type::Number || right.value_type() != Type::Number {
            return Err(ScriptError::TypeMismatch);
        }

        let l = if left.value_type() == Type::Number { left.as_number() } else { 0.0 };
        let r = right.as_number();
        let i32l = || l as i64 as i32;
        let i32r = || (r as i64 as i32) & 31;

        let result = match op {
            Token::UPlus => Value::number(r),
            Token::UMinus => Value::number(-r),
            Token::Neg => Value::number(!(r as i64 as i32) as f64),
            Token::Exp => Value::number(l.powf(r)),
            Token::Mul => Value::number(l * r),
            Token::Div => {
                if r == 0.0 {
                    return Err(ScriptError::DivByZero);
                }
                Value::number(l / r)
            }
            Token::Rem => {
                if r == 0.0 {
                    return Err(ScriptError::DivByZero);
                }
                Value::number(l % r)
            }
            Token::Plus => Value::number(l + r),
            Token::Minus => Value::number(l - r),
            Token::Shl => Value::number((i32l() << i32r()) as f64),
            Token::Shr => Value::number((i32l() >> i32r()) as f64),
            Token::ZShr => Value::number(((i32l() as u32) >> i32r()) as f64),
            Token::Lt => Value::boolean(l < r),
            Token::Le => Value::boolean(l <= r),
            Token::Gt => Value::boolean(l > r),
            Token::Ge => Value::boolean(l >= r),
            Token::And => Value::number((i32l() & (r as i64 as i32)) as f64),
            Token::Or => Value::number((i32l() | (r as i64 as i32)) as f64),
            Token::Xor => Value::number((i32l() ^ (r as i64 as i32)) as f64),
            other => return Err(ScriptError::UnknownOp(other as u8 as u32)),
        };
        Ok(result)
    }

    // --- calls --------------------------------------------------------------

    fn call_value(&mut self, func: Value, args: Value) -> Result<Value, ScriptError> {
        if func.value_type() != Type::Function {
            return Err(ScriptError::CallingNonFunction);
        }
        debug_assert_eq!(args.value_type(), Type::CodeRef);

        let (is_native, index, body) = match function::classify(&self.arena, func) {
            function::Callee::Script { source } => (false, 0u32, source.to_vec()),
            function::Callee::Native { index } => (true, index, Vec::new()),
        };

        self.recursion.enter()?;
        self.lev += 1;
        let result = if is_native { self.call_native(index, args) } else { self.call_script(&body, args) };
        self.lev -= 1;
        self.recursion.exit();
        result
    }

    fn call_native(&mut self, index: u32, args: Value) -> Result<Value, ScriptError> {
        let slot = self.natives.get(index).ok_or(ScriptError::Ffi)?;
        let saved_pos = self.pos;
        let mut argv = Vec::new();
        if args.coderef_len() > 0 {
            self.pos = args.coderef_offset();
            let end = args.coderef_offset() + args.coderef_len();
            loop {
                argv.push(self.expression(&[Token::Comma, Token::RParen])?);
                if self.peek_is(Token::Comma)? {
                    self.next_token()?;
                    if self.pos >= end {
                        break;
                    }
                    continue;
                }
                break;
            }
        }
        self.pos = saved_pos;
        Ok((slot.func)(self, &argv))
    }

    fn call_script(&mut self, func_src: &[u8], args: Value) -> Result<Value, ScriptError> {
        let body = function::split_body(func_src).to_vec();

        let saved_src = Rc::clone(&self.src);
        let saved_pos = self.pos;
        let saved_scope = self.scope;

        let new_scope = scope::push(&mut self.arena, self.scope)?;
        self.scope = new_scope;

        self.pos = args.coderef_offset();
        let args_end = args.coderef_offset() + args.coderef_len();
        let bind_result = (|| -> Result<(), ScriptError> {
            let mut piter = function::ParamIter::new(func_src);
            loop {
                let have_more_args = self.pos < args_end;
                let param_name = piter.next();
                if !have_more_args && param_name.is_none() {
                    break;
                }
                let value = if have_more_args {
                    let v = self.expression(&[Token::Comma])?;
                    if self.peek_is(Token::Comma)? {
                        self.next_token()?;
                    }
                    v
                } else {
                    Value::undefined()
                };
                if let Some(name) = param_name {
                    let name_val = self.arena.mk_string(name).map_err(|_| ScriptError::Oom)?;
                    scope::declare(&mut self.arena, self.scope, name_val, value)?;
                }
            }
            Ok(())
        })();

        let result = bind_result.and_then(|()| {
            self.src = Rc::from(body.into_boxed_slice());
            self.pos = 0;

            let saved_in_call = self.flags.in_call;
            let saved_in_loop = self.flags.in_loop;
            let saved_ret = self.flags.ret;
            let saved_brk = self.flags.brk;
            let saved_cont = self.flags.cont;
            self.flags.in_call = true;
            self.flags.in_loop = false;
            self.flags.ret = false;
            self.flags.brk = false;
            self.flags.cont = false;

            let r = self.statements_until(Token::Eof);

            self.flags.in_call = saved_in_call;
            self.flags.in_loop = saved_in_loop;
            self.flags.ret = saved_ret;
            self.flags.brk = saved_brk;
            self.flags.cont = saved_cont;
            r
        });

        self.scope = saved_scope;
        self.src = saved_src;
        self.pos = saved_pos;
        result
    }

    /// Invokes a script function with already-evaluated argument [`Value`]s
    /// rather than a `CodeRef` to re-parse — the path a host uses to invoke
    /// a callback it was handed earlier (see [`crate::native::pin`]), where
    /// there is no caller source buffer to slice arguments out of.
    pub(crate) fn call_with_values(&mut self, func: Value, args: &[Value]) -> Result<Value, ScriptError> {
        if func.value_type() != Type::Function {
            return Err(ScriptError::CallingNonFunction);
        }
        let func_src = match function::classify(&self.arena, func) {
            function::Callee::Script { source } => source.to_vec(),
            function::Callee::Native { index } => {
                self.recursion.enter()?;
                self.lev += 1;
                let slot = self.natives.get(index).ok_or(ScriptError::Ffi);
                let result = slot.map(|s| (s.func)(self, args));
                self.lev -= 1;
                self.recursion.exit();
                return result;
            }
        };
        self.recursion.enter()?;
        self.lev += 1;
        let result = self.call_script_with_values(&func_src, args);
        self.lev -= 1;
        self.recursion.exit();
        result
    }

    fn call_script_with_values(&mut self, func_src: &[u8], args: &[Value]) -> Result<Value, ScriptError> {
        let body = function::split_body(func_src).to_vec();

        let saved_src = Rc::clone(&self.src);
        let saved_pos = self.pos;
        let saved_scope = self.scope;

        let new_scope = scope::push(&mut self.arena, self.scope)?;
        self.scope = new_scope;

        let bind_result = (|| -> Result<(), ScriptError> {
            for (param_name, value) in function::ParamIter::new(func_src).zip(args.iter().copied().chain(std::iter::repeat(Value::undefined()))) {
                let name_val = self.arena.mk_string(param_name).map_err(|_| ScriptError::Oom)?;
                scope::declare(&mut self.arena, self.scope, name_val, value)?;
            }
            Ok(())
        })();

        let result = bind_result.and_then(|()| {
            self.src = Rc::from(body.into_boxed_slice());
            self.pos = 0;

            let saved_in_call = self.flags.in_call;
            let saved_in_loop = self.flags.in_loop;
            let saved_ret = self.flags.ret;
            let saved_brk = self.flags.brk;
            let saved_cont = self.flags.cont;
            self.flags.in_call = true;
            self.flags.in_loop = false;
            self.flags.ret = false;
            self.flags.brk = false;
            self.flags.cont = false;

            let r = self.statements_until(Token::Eof);

            self.flags.in_call = saved_in_call;
            self.flags.in_loop = saved_in_loop;
            self.flags.ret = saved_ret;
            self.flags.brk = saved_brk;
            self.flags.cont = saved_cont;
            r
        });

        self.scope = saved_scope;
        self.src = saved_src;
        self.pos = saved_pos;
        result
    }
}

/// Renders `v` the way `Engine::stringify` exposes it to the host: numbers
/// via [`format_number`], strings JSON-escaped, objects as `{k: v, ...}` in
/// newest-first property order (the arena's natural traversal order),
/// functions as their script source or a native marker.
pub(crate) fn stringify(engine: &Engine, v: Value) -> String {
    match v.value_type() {
        Type::Undefined => "undefined".to_string(),
        Type::Null => "null".to_string(),
        Type::Boolean => v.as_bool().to_string(),
        Type::Number => format_number(v.as_number()),
        Type::Str => json_escape(engine.arena_string_bytes(v)),
        Type::Error => {
            let bytes: Vec<u8> = engine.errmsg.iter().copied().take_while(|&b| b != 0).collect();
            String::from_utf8_lossy(&bytes).into_owned()
        }
        Type::Function => match function::classify(engine.arena_ref(), v) {
            function::Callee::Script { source } => format!("function{}", String::from_utf8_lossy(source)),
            function::Callee::Native { index } => format!("function native#{index}() {{ [native code] }}"),
        },
        Type::Object => stringify_object(engine, v),
        Type::Property => stringify(engine, engine.arena_ref().prop_value(v)),
        Type::CodeRef => "coderef".to_string(),
    }
}

fn stringify_object(engine: &Engine, obj: Value) -> String {
    let mut parts = Vec::new();
    for (key, val) in engine.arena_ref().properties(obj) {
        parts.push(format!("{}:{}", json_escape(key), stringify(engine, val)));
    }
    format!("{{{}}}", parts.join(","))
}

fn json_escape(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Engine;

    fn eval_num(src: &str) -> f64 {
        let mut e = Engine::create(4096).unwrap();
        let v = e.eval(src);
        assert!(!v.is_error(), "eval error: {}", e.str(v));
        assert_eq!(v.value_type(), Type::Number);
        v.as_number()
    }

    #[test]
    fn arithmetic_precedence() {
        assert_eq!(eval_num("1 + 2 * 3"), 7.0);
    }

    #[test]
    fn nested_property_compound_assign() {
        let mut e = Engine::create(4096).unwrap();
        let v = e.eval("let a = {b:{c:3}}; a.b.c += 4; a.b.c");
        assert!(!v.is_error(), "eval error: {}", e.str(v));
        assert_eq!(v.as_number(), 7.0);
    }

    #[test]
    fn recursive_factorial() {
        let mut e = Engine::create(8192).unwrap();
        let v = e.eval("let f = function(n){ if (n <= 1) return 1; return n * f(n-1); }; f(5)");
        assert!(!v.is_error(), "eval error: {}", e.str(v));
        assert_eq!(v.as_number(), 120.0);
    }

    #[test]
    fn string_length_is_byte_length() {
        let mut e = Engine::create(4096).unwrap();
        let v = e.eval("'Київ'.length");
        assert!(!v.is_error(), "eval error: {}", e.str(v));
        assert_eq!(v.as_number(), 8.0);
    }

    #[test]
    fn while_loop_accumulates() {
        let mut e = Engine::create(4096).unwrap();
        let v = e.eval("let i=0, a=0; while(i++<10) a+=i; a");
        assert!(!v.is_error(), "eval error: {}", e.str(v));
        assert_eq!(v.as_number(), 55.0);
    }

    #[test]
    fn strict_equal_type_mismatch_is_an_error() {
        let mut e = Engine::create(4096).unwrap();
        let v = e.eval("1 === '1'");
        assert!(v.is_error());
        assert_eq!(e.str(v), "ERROR: type mismatch");
    }

    #[test]
    fn block_scope_does_not_leak() {
        let mut e = Engine::create(4096).unwrap();
        let v = e.eval("let x = 1; { let x = 2; } x");
        assert!(!v.is_error(), "eval error: {}", e.str(v));
        assert_eq!(v.as_number(), 1.0);
    }

    #[test]
    fn undeclared_read_is_not_found() {
        let mut e = Engine::create(4096).unwrap();
        let v = e.eval("y");
        assert!(v.is_error());
        assert_eq!(e.str(v), "ERROR: 'y' not found");
    }

    #[test]
    fn ternary_short_circuits() {
        let mut e = Engine::create(4096).unwrap();
        let v = e.eval("true ? 1 : 2");
        assert_eq!(v.as_number(), 1.0);
    }

    #[test]
    fn missing_property_read_is_undefined_not_autovivified() {
        let mut e = Engine::create(4096).unwrap();
        let v = e.eval("let a = {}; a.missing");
        assert!(!v.is_error(), "eval error: {}", e.str(v));
        assert!(v.is_undefined());
        let obj = e.eval("let b = {}; b.missing; b");
        assert_eq!(e.str(obj), "{}");
    }

    #[test]
    fn assigning_to_a_missing_property_is_bad_lhs() {
        let mut e = Engine::create(4096).unwrap();
        let v = e.eval("let a = {}; a.missing = 1");
        assert!(v.is_error());
        assert_eq!(e.str(v), "ERROR: bad lhs");
    }

    #[test]
    fn object_stringifies_without_spaces() {
        let mut e = Engine::create(4096).unwrap();
        let v = e.eval("({k:1})");
        assert_eq!(e.str(v), "{\"k\":1}");
    }

    #[test]
    fn script_function_stringifies_with_function_prefix() {
        let mut e = Engine::create(4096).unwrap();
        let v = e.eval("function(a,b){return a+b;}");
        assert_eq!(e.str(v), "function(a,b){return a+b;}");
    }

    #[test]
    fn non_feature_keywords_are_a_parse_diagnostic() {
        for src in ["for (;;) {}", "switch (1) {}", "try {} catch (e) {}", "class Foo {}", "new Foo()", "var x = 1;"] {
            let mut e = Engine::create(4096).unwrap();
            let v = e.eval(src);
            assert!(v.is_error(), "{src:?} should not silently succeed");
            let msg = e.str(v).to_string();
            assert!(msg.contains("not implemented"), "{src:?} -> {msg:?}");
        }
    }
}
