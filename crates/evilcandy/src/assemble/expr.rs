//! The operator-precedence expression parser.
//!
//! A ladder of levels, loosest binding first: short-circuit logic, bitwise,
//! relational, shift, additive, multiplicative, unary, power, postfix
//! chains, atoms. Each level emits the instructions for its operands before
//! the operator instruction, so every expression nets exactly one pushed
//! value.

use super::Assembler;
use crate::{
    code::{Opcode, iarg},
    exc::RunResult,
    lex::{Delim, Keyword, TokenKind},
    xptr::Rodata,
};

impl Assembler<'_> {
    /// Parses one full expression, leaving its value on the stack.
    pub(crate) fn eval(&mut self) -> RunResult<()> {
        self.eval_logical()
    }

    fn eval_logical(&mut self) -> RunResult<()> {
        self.eval_bitwise()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Delim(Delim::AmpAmp) => Opcode::LogicalAnd,
                TokenKind::Delim(Delim::PipePipe) => Opcode::LogicalOr,
                _ => return Ok(()),
            };
            self.next();
            self.eval_bitwise()?;
            self.fr().emit(op, 0, 0);
        }
    }

    fn eval_bitwise(&mut self) -> RunResult<()> {
        self.eval_relational()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Delim(Delim::Amp) => Opcode::BinaryAnd,
                TokenKind::Delim(Delim::Pipe) => Opcode::BinaryOr,
                TokenKind::Delim(Delim::Caret) => Opcode::BinaryXor,
                _ => return Ok(()),
            };
            self.next();
            self.eval_relational()?;
            self.fr().emit(op, 0, 0);
        }
    }

    fn eval_relational(&mut self) -> RunResult<()> {
        self.eval_shift()?;
        loop {
            let rel = match self.peek().kind {
                TokenKind::Delim(Delim::EqEq) => iarg::EQ,
                TokenKind::Delim(Delim::Ne) => iarg::NEQ,
                TokenKind::Delim(Delim::Le) => iarg::LEQ,
                TokenKind::Delim(Delim::Ge) => iarg::GEQ,
                TokenKind::Delim(Delim::Lt) => iarg::LT,
                TokenKind::Delim(Delim::Gt) => iarg::GT,
                _ => return Ok(()),
            };
            self.next();
            self.eval_shift()?;
            self.fr().emit(Opcode::Cmp, rel, 0);
        }
    }

    fn eval_shift(&mut self) -> RunResult<()> {
        self.eval_additive()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Delim(Delim::Lshift) => Opcode::Lshift,
                TokenKind::Delim(Delim::Rshift) => Opcode::Rshift,
                _ => return Ok(()),
            };
            self.next();
            self.eval_additive()?;
            self.fr().emit(op, 0, 0);
        }
    }

    fn eval_additive(&mut self) -> RunResult<()> {
        self.eval_multiplicative()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Delim(Delim::Plus) => Opcode::Add,
                TokenKind::Delim(Delim::Minus) => Opcode::Sub,
                _ => return Ok(()),
            };
            self.next();
            self.eval_multiplicative()?;
            self.fr().emit(op, 0, 0);
        }
    }

    fn eval_multiplicative(&mut self) -> RunResult<()> {
        self.eval_unary()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Delim(Delim::Star) => Opcode::Mul,
                TokenKind::Delim(Delim::Slash) => Opcode::Div,
                TokenKind::Delim(Delim::Percent) => Opcode::Mod,
                _ => return Ok(()),
            };
            self.next();
            self.eval_unary()?;
            self.fr().emit(op, 0, 0);
        }
    }

    fn eval_unary(&mut self) -> RunResult<()> {
        let op = match self.peek().kind {
            TokenKind::Delim(Delim::Tilde) => Some(Opcode::BitwiseNot),
            TokenKind::Delim(Delim::Minus) => Some(Opcode::Negate),
            TokenKind::Delim(Delim::Bang) => Some(Opcode::LogicalNot),
            // Unary plus parses and does nothing.
            TokenKind::Delim(Delim::Plus) => None,
            _ => return self.eval_pow(),
        };
        self.next();
        self.eval_unary()?;
        if let Some(op) = op {
            self.fr().emit(op, 0, 0);
        }
        Ok(())
    }

    /// `**` binds tighter than unary minus on its left and looser on its
    /// right, so `-2 ** -3` is `-(2 ** (-3))`.
    fn eval_pow(&mut self) -> RunResult<()> {
        self.eval_postfix()?;
        if self.peek().kind == TokenKind::Delim(Delim::StarStar) {
            self.next();
            self.eval_unary()?;
            self.fr().emit(Opcode::Pow, 0, 0);
        }
        Ok(())
    }

    /// Dereference chains: `.name`, `[key]`, `(args)`.
    ///
    /// `GETATTR` keeps the parent on the stack beneath the attribute so a
    /// following call knows its receiver; the chain ends with `UNWIND` to
    /// collapse the accumulated parents back to one value.
    fn eval_postfix(&mut self) -> RunResult<()> {
        self.eval_primary()?;
        let mut have_parent = false;
        let mut inbal: i16 = 0;

        loop {
            match self.peek().kind {
                TokenKind::Delim(Delim::Dot) => {
                    self.next();
                    let tok = self.next();
                    let TokenKind::Ident(name) = tok.kind else {
                        return Err(self.err_at(tok, "expected attribute name after '.'"));
                    };
                    let namei = self.fr().seek_or_add_const(Rodata::Str(name))?;
                    self.fr().emit(Opcode::GetAttr, iarg::ATTR_CONST, namei);
                    have_parent = true;
                    inbal += 1;
                }
                TokenKind::Delim(Delim::Lbracket) => {
                    self.next();
                    if let Some(namei) = self.try_const_key()? {
                        self.fr().emit(Opcode::GetAttr, iarg::ATTR_CONST, namei);
                    } else {
                        self.eval()?;
                        self.expect_delim(Delim::Rbracket, "']'")?;
                        self.fr().emit(Opcode::GetAttr, iarg::ATTR_STACK, -1);
                    }
                    have_parent = true;
                    inbal += 1;
                }
                TokenKind::Delim(Delim::Lparen) => {
                    self.call_func(have_parent)?;
                    if have_parent {
                        inbal -= 1;
                    }
                    have_parent = false;
                }
                _ => break,
            }
        }

        debug_assert!(inbal >= 0);
        if inbal > 0 {
            self.fr().emit(Opcode::Unwind, 0, inbal);
        }
        Ok(())
    }

    /// Emits the argument pushes and the `CALL_FUNC`. The callee (and its
    /// receiver when `have_parent`) is already on the stack.
    pub(crate) fn call_func(&mut self, have_parent: bool) -> RunResult<()> {
        self.expect_delim(Delim::Lparen, "'('")?;
        let mut argc: i16 = 0;
        if self.peek().kind != TokenKind::Delim(Delim::Rparen) {
            loop {
                self.eval()?;
                argc += 1;
                let tok = self.next();
                match tok.kind {
                    TokenKind::Delim(Delim::Comma) => {}
                    TokenKind::Delim(Delim::Rparen) => break,
                    _ => return Err(self.err_at(tok, "expected ',' or ')' in argument list")),
                }
            }
        } else {
            self.next();
        }
        let mode = if have_parent { iarg::WITH_PARENT } else { iarg::NO_PARENT };
        self.fr().emit(Opcode::CallFunc, mode, argc);
        Ok(())
    }

    fn eval_primary(&mut self) -> RunResult<()> {
        let tok = self.next();
        match tok.kind {
            TokenKind::Ident(name) => self.push_symbol(name, tok),
            TokenKind::Int(v) => {
                let slot = self.fr().seek_or_add_const(Rodata::Int(v))?;
                self.fr().emit(Opcode::PushConst, 0, slot);
                Ok(())
            }
            TokenKind::Float(v) => {
                let slot = self.fr().seek_or_add_const(Rodata::Float(v))?;
                self.fr().emit(Opcode::PushConst, 0, slot);
                Ok(())
            }
            TokenKind::Str(s) => {
                let slot = self.fr().seek_or_add_const(Rodata::Str(s))?;
                self.fr().emit(Opcode::PushConst, 0, slot);
                Ok(())
            }
            TokenKind::Bytes(b) => {
                let slot = self.fr().seek_or_add_const(Rodata::Bytes(b))?;
                self.fr().emit(Opcode::PushConst, 0, slot);
                Ok(())
            }
            TokenKind::Keyword(Keyword::True) => {
                let slot = self.fr().seek_or_add_const(Rodata::Int(1))?;
                self.fr().emit(Opcode::PushConst, 0, slot);
                Ok(())
            }
            TokenKind::Keyword(Keyword::False) => {
                let slot = self.fr().seek_or_add_const(Rodata::Int(0))?;
                self.fr().emit(Opcode::PushConst, 0, slot);
                Ok(())
            }
            TokenKind::Keyword(Keyword::Null) => {
                // An ordinary push is null by default; no rodata needed.
                self.fr().emit(Opcode::PushLocal, 0, 0);
                Ok(())
            }
            TokenKind::Keyword(Keyword::This) => {
                self.fr().emit(Opcode::PushPtr, iarg::PTR_THIS, 0);
                Ok(())
            }
            TokenKind::Keyword(Keyword::Global) => {
                self.fr().emit(Opcode::PushPtr, iarg::PTR_GBL, 0);
                Ok(())
            }
            TokenKind::Keyword(Keyword::Function) => self.funcdef(false, tok.line),
            TokenKind::Delim(Delim::Lambda) => self.funcdef(true, tok.line),
            TokenKind::Delim(Delim::Lbracket) => self.arraydef(),
            TokenKind::Delim(Delim::Lbrace) => self.objdef(),
            TokenKind::Delim(Delim::Lparen) => {
                self.eval()?;
                self.expect_delim(Delim::Rparen, "')'")
            }
            _ => Err(self.err_at(tok, "unexpected token in expression")),
        }
    }

    fn arraydef(&mut self) -> RunResult<()> {
        self.fr().emit(Opcode::DefList, 0, 0);
        if self.peek().kind == TokenKind::Delim(Delim::Rbracket) {
            self.next();
            return Ok(());
        }
        loop {
            self.eval()?;
            self.fr().emit(Opcode::ListAppend, 0, 0);
            let tok = self.next();
            match tok.kind {
                TokenKind::Delim(Delim::Comma) => {}
                TokenKind::Delim(Delim::Rbracket) => return Ok(()),
                _ => return Err(self.err_at(tok, "expected ',' or ']' in array literal")),
            }
        }
    }

    /// Object literal `{k: v, …}` with optional `private`/`const` flags per
    /// entry.
    fn objdef(&mut self) -> RunResult<()> {
        self.fr().emit(Opcode::DefDict, 0, 0);
        if self.peek().kind == TokenKind::Delim(Delim::Rbrace) {
            self.next();
            return Ok(());
        }
        loop {
            let mut flags: u8 = 0;
            let mut tok = self.next();
            loop {
                match tok.kind {
                    TokenKind::Keyword(Keyword::Const) => flags |= iarg::ATTR_FLAG_CONST,
                    TokenKind::Keyword(Keyword::Private) => flags |= iarg::ATTR_FLAG_PRIVATE,
                    _ => break,
                }
                tok = self.next();
            }
            let name = match tok.kind {
                TokenKind::Ident(name) | TokenKind::Str(name) => name,
                _ => return Err(self.err_at(tok, "expected key name in object literal")),
            };
            let namei = self.fr().seek_or_add_const(Rodata::Str(name))?;
            self.expect_delim(Delim::Colon, "':' after key")?;
            self.eval()?;
            self.fr().emit(Opcode::AddAttr, flags, namei);
            let tok = self.next();
            match tok.kind {
                TokenKind::Delim(Delim::Comma) => {}
                TokenKind::Delim(Delim::Rbrace) => return Ok(()),
                _ => return Err(self.err_at(tok, "expected ',' or '}' in object literal")),
            }
        }
    }
}
