//! The single-pass recursive-descent assembler.
//!
//! Source tokens go straight to instructions: there is no AST. One
//! [`AsFrame`] per function being compiled sits on an explicit frame stack;
//! nested definitions push frames and the closure-capture walk iterates the
//! ancestor chain, inserting forwarding captures where needed. Finished
//! frames collect child-first, which is the order the post-pass wants.
//!
//! Grammar notes live where the corresponding parse happens; the statement
//! entry point is [`Assembler::statement`].

mod expr;
mod frame;
mod post;

pub use frame::{AsFrame, FRAME_STACK_MAX, LoopCtx};

use std::rc::Rc;

use crate::{
    code::{Opcode, iarg},
    exc::{RunError, RunResult},
    heap::Heap,
    intern::{Interns, StringId},
    lex::{Delim, Keyword, Token, TokenKind, TokenStream, tokenize},
    xptr::{Rodata, Xptr},
};

/// Compiles one source file to its entry-point executable.
pub fn assemble(src: &str, file_name: &str, interns: &mut Interns, heap: &mut Heap) -> RunResult<Rc<Xptr>> {
    let toks = tokenize(src, file_name, interns)?;
    let mut asm = Assembler {
        toks,
        interns,
        file_name: file_name.to_owned(),
        frames: vec![AsFrame::new(0, 1)],
        finished: Vec::new(),
        next_funcno: 1,
    };
    while asm.toks.peek().kind != TokenKind::Eof {
        asm.statement(false)?;
    }
    asm.fr().emit(Opcode::End, 0, 0);
    let script = asm.frames.pop().expect("script frame");
    asm.finished.push(script);

    post::run(asm.finished, file_name, heap, interns)
}

pub(crate) struct Assembler<'a> {
    toks: TokenStream,
    pub(crate) interns: &'a mut Interns,
    file_name: String,
    /// Active frames; index 0 is the script body, the last is the function
    /// currently being compiled.
    pub(crate) frames: Vec<AsFrame>,
    /// Fully-parsed frames, children before their parents.
    finished: Vec<AsFrame>,
    next_funcno: u32,
}

impl Assembler<'_> {
    /// The frame currently being compiled.
    pub(crate) fn fr(&mut self) -> &mut AsFrame {
        self.frames.last_mut().expect("no active frame")
    }

    fn frame_is_top(&self) -> bool {
        self.frames.len() == 1
    }

    /// Swaps the two top frames, so default/capture code for a function
    /// being defined is emitted into its parent.
    fn swap_top(&mut self) {
        let n = self.frames.len();
        debug_assert!(n >= 2, "swap with no parent frame");
        self.frames.swap(n - 2, n - 1);
    }

    pub(crate) fn err_at(&self, tok: Token, msg: impl Into<String>) -> RunError {
        RunError::parser(msg)
            .with_location(&self.file_name, tok.line)
            .with_col(tok.col)
    }

    pub(crate) fn next(&mut self) -> Token {
        self.toks.next()
    }

    pub(crate) fn peek(&self) -> Token {
        self.toks.peek()
    }

    pub(crate) fn unget(&mut self) {
        self.toks.unget();
    }

    pub(crate) fn expect_delim(&mut self, want: Delim, what: &str) -> RunResult<()> {
        let tok = self.next();
        if tok.kind == TokenKind::Delim(want) {
            Ok(())
        } else {
            Err(self.err_at(tok, format!("expected {what}")))
        }
    }

    fn eat_delim(&mut self, want: Delim) -> bool {
        if self.peek().kind == TokenKind::Delim(want) {
            self.next();
            true
        } else {
            false
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    /// Parses one statement: a `{…}` block or a single-line form.
    ///
    /// `in_for_iter` marks the third clause of a `for` header, which is
    /// terminated by `)` instead of `;` and forbids declarations.
    fn statement(&mut self, in_for_iter: bool) -> RunResult<()> {
        let tok = self.next();
        if tok.kind == TokenKind::Delim(Delim::Lbrace) {
            self.fr().push_scope();
            self.fr().emit(Opcode::PushBlock, iarg::BLOCK, 0);
            loop {
                let tok = self.peek();
                match tok.kind {
                    TokenKind::Delim(Delim::Rbrace) => {
                        self.next();
                        break;
                    }
                    TokenKind::Eof => return Err(self.err_at(tok, "unexpected end of file in block")),
                    _ => self.statement(false)?,
                }
            }
            let n = self.fr().pop_scope();
            for _ in 0..n {
                self.fr().emit(Opcode::Pop, 0, 0);
            }
            self.fr().emit(Opcode::PopBlock, 0, 0);
            return Ok(());
        }
        self.statement_single(tok, in_for_iter)
    }

    fn statement_single(&mut self, tok: Token, in_for_iter: bool) -> RunResult<()> {
        match tok.kind {
            TokenKind::Delim(Delim::Semi) => Ok(()),
            TokenKind::Ident(name) => {
                // `load` is not reserved; it is recognized positionally.
                if self.interns.get_str(name) == "load"
                    && matches!(self.peek().kind, TokenKind::Str(_))
                {
                    return self.load_stmt(tok);
                }
                self.push_symbol(name, tok)?;
                self.ident_helper(in_for_iter)
            }
            TokenKind::Keyword(Keyword::This) => {
                self.fr().emit(Opcode::PushPtr, iarg::PTR_THIS, 0);
                self.ident_helper(in_for_iter)
            }
            TokenKind::Keyword(Keyword::Global) => {
                self.fr().emit(Opcode::PushPtr, iarg::PTR_GBL, 0);
                self.ident_helper(in_for_iter)
            }
            TokenKind::Delim(Delim::Lparen) => {
                self.unget();
                self.eval()?;
                self.expect_delim(Delim::Semi, "';'")?;
                self.fr().emit(Opcode::Pop, 0, 0);
                Ok(())
            }
            TokenKind::Keyword(Keyword::Let) => {
                if in_for_iter {
                    return Err(self.err_at(tok, "declaration not allowed in for-loop step"));
                }
                self.let_stmt()
            }
            TokenKind::Keyword(Keyword::Function) => {
                if in_for_iter {
                    return Err(self.err_at(tok, "definition not allowed in for-loop step"));
                }
                self.named_funcdef_stmt(tok)
            }
            TokenKind::Keyword(Keyword::Return) => self.return_stmt(),
            TokenKind::Keyword(Keyword::Break) => self.break_stmt(tok),
            TokenKind::Keyword(Keyword::If) => self.if_stmt(),
            TokenKind::Keyword(Keyword::While) => self.while_stmt(),
            TokenKind::Keyword(Keyword::Do) => self.do_stmt(),
            TokenKind::Keyword(Keyword::For) => self.for_stmt(),
            _ => Err(self.err_at(tok, "unexpected token at start of statement")),
        }
    }

    /// `let [const] name [= expr];`
    ///
    /// Top-level declarations become global bindings (`SYMTAB`); function
    /// locals are just stack pushes, their names exist only at assembly.
    fn let_stmt(&mut self) -> RunResult<()> {
        let mut tok = self.next();
        let constant = if tok.kind == TokenKind::Keyword(Keyword::Const) {
            tok = self.next();
            true
        } else {
            false
        };
        let TokenKind::Ident(name) = tok.kind else {
            return Err(self.err_at(tok, "expected identifier after 'let'"));
        };

        let top = self.frame_is_top();
        let slot;
        if top {
            slot = self.fr().seek_or_add_const(Rodata::Str(name))?;
            self.fr().emit(Opcode::Symtab, 0, slot);
        } else {
            let text = self.interns.get_str(name).to_owned();
            slot = self
                .frames
                .last_mut()
                .expect("frame")
                .declare_local(name, &text)
                .map_err(|e| e.with_location(&self.file_name, tok.line))?;
            self.fr().emit(Opcode::PushLocal, 0, 0);
        }

        let tok = self.next();
        match tok.kind {
            TokenKind::Delim(Delim::Semi) => Ok(()),
            TokenKind::Delim(Delim::Eq) => {
                if top {
                    self.fr().emit(Opcode::PushPtr, iarg::PTR_SEEK, slot);
                } else {
                    self.fr().emit(Opcode::PushPtr, iarg::PTR_AP, slot);
                }
                self.eval()?;
                let flag = if constant { iarg::FLAG_CONST } else { 0 };
                self.fr().emit(Opcode::Assign, flag, 0);
                self.expect_delim(Delim::Semi, "';'")
            }
            _ => Err(self.err_at(tok, "expected '=' or ';' after declaration")),
        }
    }

    /// `function name(params) { … }` — sugar for declaring `name` and
    /// assigning the function literal to it.
    fn named_funcdef_stmt(&mut self, func_tok: Token) -> RunResult<()> {
        let tok = self.next();
        let TokenKind::Ident(name) = tok.kind else {
            return Err(self.err_at(tok, "expected function name"));
        };
        if self.frame_is_top() {
            let slot = self.fr().seek_or_add_const(Rodata::Str(name))?;
            self.fr().emit(Opcode::Symtab, 0, slot);
            self.fr().emit(Opcode::PushPtr, iarg::PTR_SEEK, slot);
        } else {
            let text = self.interns.get_str(name).to_owned();
            let slot = self
                .frames
                .last_mut()
                .expect("frame")
                .declare_local(name, &text)
                .map_err(|e| e.with_location(&self.file_name, tok.line))?;
            self.fr().emit(Opcode::PushLocal, 0, 0);
            self.fr().emit(Opcode::PushPtr, iarg::PTR_AP, slot);
        }
        self.funcdef(false, func_tok.line)?;
        self.fr().emit(Opcode::Assign, 0, 0);
        // The closing brace ends the definition; a trailing semicolon is
        // tolerated.
        if self.peek().kind == TokenKind::Delim(Delim::Semi) {
            self.next();
        }
        Ok(())
    }

    fn return_stmt(&mut self) -> RunResult<()> {
        if self.eat_delim(Delim::Semi) {
            self.fr().emit(Opcode::PushZero, 0, 0);
            self.fr().emit(Opcode::ReturnValue, 0, 0);
            return Ok(());
        }
        self.eval()?;
        self.fr().emit(Opcode::ReturnValue, 0, 0);
        self.expect_delim(Delim::Semi, "';'")
    }

    /// `break;` — pops locals declared since the loop head (counted
    /// statically from the lexical scopes), closes crossed blocks, and
    /// branches to the loop's `POP_BLOCK`.
    fn break_stmt(&mut self, tok: Token) -> RunResult<()> {
        let Some(ctx) = self.fr().loops.last().copied() else {
            return Err(self.err_at(tok, "'break' outside of a loop"));
        };
        let pops = self.fr().n_locals() - ctx.symbol_depth;
        for _ in 0..pops {
            self.fr().emit(Opcode::Pop, 0, 0);
        }
        let crossed = self.fr().scope_depth() - ctx.scope_depth;
        for _ in 0..crossed {
            self.fr().emit(Opcode::PopBlock, 0, 0);
        }
        self.fr()
            .emit(Opcode::B, 0, ctx.break_label.cast_signed());
        self.expect_delim(Delim::Semi, "';'")
    }

    fn load_stmt(&mut self, tok: Token) -> RunResult<()> {
        if !self.frame_is_top() {
            return Err(self.err_at(tok, "'load' is only allowed at the top level"));
        }
        let tok = self.next();
        let TokenKind::Str(path) = tok.kind else {
            return Err(self.err_at(tok, "expected file name string after 'load'"));
        };
        let slot = self.fr().seek_or_add_const(Rodata::Str(path))?;
        self.fr().emit(Opcode::Load, 0, slot);
        self.expect_delim(Delim::Semi, "';'")
    }

    fn if_stmt(&mut self) -> RunResult<()> {
        let end_label = self.fr().next_label()?;
        loop {
            let else_label = self.fr().next_label()?;
            self.expect_delim(Delim::Lparen, "'(' after 'if'")?;
            self.eval()?;
            self.expect_delim(Delim::Rparen, "')'")?;
            self.fr().emit(Opcode::BIf, 0, else_label.cast_signed());
            self.statement(false)?;
            self.fr().emit(Opcode::B, 0, end_label.cast_signed());
            self.fr().set_label(else_label);

            if self.peek().kind == TokenKind::Keyword(Keyword::Else) {
                self.next();
                if self.peek().kind == TokenKind::Keyword(Keyword::If) {
                    self.next();
                    continue;
                }
                self.statement(false)?;
            }
            break;
        }
        self.fr().set_label(end_label);
        Ok(())
    }

    fn while_stmt(&mut self) -> RunResult<()> {
        let start = self.fr().next_label()?;
        let brk = self.fr().next_label()?;
        self.fr().emit(Opcode::PushBlock, iarg::LOOP, brk.cast_signed());
        self.fr().set_label(start);

        self.expect_delim(Delim::Lparen, "'(' after 'while'")?;
        self.eval()?;
        self.expect_delim(Delim::Rparen, "')'")?;
        self.fr().emit(Opcode::BIf, 0, brk.cast_signed());

        self.enter_loop(brk);
        self.statement(false)?;
        self.exit_loop();

        self.fr().emit(Opcode::B, 0, start.cast_signed());
        self.fr().set_label(brk);
        self.fr().emit(Opcode::PopBlock, 0, 0);
        Ok(())
    }

    fn do_stmt(&mut self) -> RunResult<()> {
        let start = self.fr().next_label()?;
        let brk = self.fr().next_label()?;
        self.fr().emit(Opcode::PushBlock, iarg::LOOP, brk.cast_signed());
        self.fr().set_label(start);

        self.enter_loop(brk);
        self.statement(false)?;
        self.exit_loop();

        let tok = self.next();
        if tok.kind != TokenKind::Keyword(Keyword::While) {
            return Err(self.err_at(tok, "expected 'while' after 'do' body"));
        }
        self.expect_delim(Delim::Lparen, "'('")?;
        self.eval()?;
        self.expect_delim(Delim::Rparen, "')'")?;
        self.expect_delim(Delim::Semi, "';'")?;
        self.fr().emit(Opcode::BIf, 1, start.cast_signed());
        self.fr().set_label(brk);
        self.fr().emit(Opcode::PopBlock, 0, 0);
        Ok(())
    }

    /// `for (init; cond; step) body [else stmt]`
    ///
    /// The else clause runs when the condition falsifies; `break` skips it.
    /// Locals declared by the initializer belong to the enclosing scope, so
    /// `break` cleanup is counted from after the initializer.
    fn for_stmt(&mut self) -> RunResult<()> {
        self.expect_delim(Delim::Lparen, "'(' after 'for'")?;
        self.statement(false)?; // initializer, consumes its ';'

        let start = self.fr().next_label()?;
        let then = self.fr().next_label()?;
        let iter = self.fr().next_label()?;
        let forelse = self.fr().next_label()?;
        let brk = self.fr().next_label()?;

        self.fr().emit(Opcode::PushBlock, iarg::LOOP, brk.cast_signed());
        self.fr().set_label(start);
        if self.eat_delim(Delim::Semi) {
            // Empty condition is always true.
            self.fr().emit(Opcode::B, 0, then.cast_signed());
        } else {
            self.eval()?;
            self.expect_delim(Delim::Semi, "';'")?;
            self.fr().emit(Opcode::BIf, 0, forelse.cast_signed());
            self.fr().emit(Opcode::B, 0, then.cast_signed());
        }

        self.fr().set_label(iter);
        if !self.eat_delim(Delim::Rparen) {
            self.statement_single_for_iter()?;
        }
        self.fr().emit(Opcode::B, 0, start.cast_signed());

        self.fr().set_label(then);
        self.enter_loop(brk);
        self.statement(false)?;
        self.exit_loop();
        self.fr().emit(Opcode::B, 0, iter.cast_signed());

        self.fr().set_label(forelse);
        if self.peek().kind == TokenKind::Keyword(Keyword::Else) {
            self.next();
            self.statement(false)?;
        }
        self.fr().set_label(brk);
        self.fr().emit(Opcode::PopBlock, 0, 0);
        Ok(())
    }

    fn statement_single_for_iter(&mut self) -> RunResult<()> {
        let tok = self.next();
        self.statement_single(tok, true)
    }

    fn enter_loop(&mut self, break_label: u16) {
        let ctx = LoopCtx {
            break_label,
            scope_depth: self.frames.last().expect("frame").scope_depth(),
            symbol_depth: self.frames.last().expect("frame").n_locals(),
        };
        self.fr().loops.push(ctx);
    }

    fn exit_loop(&mut self) {
        self.fr().loops.pop().expect("loop underflow");
    }

    // ------------------------------------------------------------------
    // Identifier statement chains
    // ------------------------------------------------------------------

    /// Statement continuation after a pushed target: assignments, attribute
    /// stores, and call statements. A bare value is not a statement.
    fn ident_helper(&mut self, in_for_iter: bool) -> RunResult<()> {
        let mut have_parent = false;
        let mut inbal: i16 = 0;
        let mut last_was_call = false;

        loop {
            let tok = self.next();
            match tok.kind {
                TokenKind::Delim(Delim::PlusPlus) => {
                    self.fr().emit(Opcode::Incr, 0, 0);
                    break;
                }
                TokenKind::Delim(Delim::MinusMinus) => {
                    self.fr().emit(Opcode::Decr, 0, 0);
                    break;
                }
                TokenKind::Delim(d) if assign_opcode(d).is_some() => {
                    self.eval()?;
                    self.fr().emit(assign_opcode(d).expect("checked"), 0, 0);
                    break;
                }
                TokenKind::Delim(Delim::Dot) => {
                    let name_tok = self.next();
                    let TokenKind::Ident(name) = name_tok.kind else {
                        return Err(self.err_at(name_tok, "expected attribute name after '.'"));
                    };
                    let namei = self.fr().seek_or_add_const(Rodata::Str(name))?;
                    if self.eat_delim(Delim::Eq) {
                        self.eval()?;
                        self.fr().emit(Opcode::SetAttr, iarg::ATTR_CONST, namei);
                        break;
                    }
                    self.fr().emit(Opcode::GetAttr, iarg::ATTR_CONST, namei);
                    have_parent = true;
                    inbal += 1;
                }
                TokenKind::Delim(Delim::Lbracket) => {
                    if let Some(namei) = self.try_const_key()? {
                        if self.eat_delim(Delim::Eq) {
                            self.eval()?;
                            self.fr().emit(Opcode::SetAttr, iarg::ATTR_CONST, namei);
                            break;
                        }
                        self.fr().emit(Opcode::GetAttr, iarg::ATTR_CONST, namei);
                    } else {
                        self.eval()?;
                        self.expect_delim(Delim::Rbracket, "']'")?;
                        if self.eat_delim(Delim::Eq) {
                            self.eval()?;
                            self.fr().emit(Opcode::SetAttr, iarg::ATTR_STACK, -1);
                            break;
                        }
                        self.fr().emit(Opcode::GetAttr, iarg::ATTR_STACK, -1);
                    }
                    have_parent = true;
                    inbal += 1;
                }
                TokenKind::Delim(Delim::Lparen) => {
                    self.unget();
                    self.call_func(have_parent)?;
                    if have_parent {
                        inbal -= 1;
                    }
                    have_parent = false;
                    // Call results are discarded in statement position.
                    self.fr().emit(Opcode::Pop, 0, 0);
                    last_was_call = true;
                    continue;
                }
                TokenKind::Delim(Delim::Semi) | TokenKind::Delim(Delim::Rparen) => {
                    if !last_was_call {
                        return Err(self.err_at(tok, "expression statement must assign or call"));
                    }
                    self.unget();
                    break;
                }
                _ => return Err(self.err_at(tok, "unexpected token in statement")),
            }
            last_was_call = false;
        }

        // Parents accumulated by GETATTR have nothing to hand back in
        // statement position; drop them.
        for _ in 0..inbal {
            self.fr().emit(Opcode::Pop, 0, 0);
        }

        if in_for_iter {
            self.expect_delim(Delim::Rparen, "')'")
        } else {
            self.expect_delim(Delim::Semi, "';'")
        }
    }

    /// Fast path for `[k]` where `k` is a literal string or integer
    /// immediately followed by `]`: the key becomes a rodata constant.
    /// Returns `None` (with the stream rewound) when the subscript is a
    /// general expression.
    pub(crate) fn try_const_key(&mut self) -> RunResult<Option<i16>> {
        let save = self.toks.save();
        let tok = self.next();
        let rod = match tok.kind {
            TokenKind::Str(s) => Rodata::Str(s),
            TokenKind::Int(i) => Rodata::Int(i),
            _ => {
                self.toks.restore(save);
                return Ok(None);
            }
        };
        if self.peek().kind == TokenKind::Delim(Delim::Rbracket) {
            self.next();
            let namei = self.fr().seek_or_add_const(rod)?;
            return Ok(Some(namei));
        }
        self.toks.restore(save);
        Ok(None)
    }

    // ------------------------------------------------------------------
    // Symbols and closures
    // ------------------------------------------------------------------

    /// Emits the load of a name, trying in order: local slot, argument,
    /// closure cell, the globals object, implicit capture from enclosing
    /// functions, and finally a deferred global lookup by name.
    pub(crate) fn push_symbol(&mut self, name: StringId, _tok: Token) -> RunResult<()> {
        let resolved = {
            let fr = self.frames.last().expect("frame");
            if let Some(i) = fr.seek_local(name) {
                Some((iarg::PTR_AP, i))
            } else if let Some(i) = fr.seek_arg(name) {
                Some((iarg::PTR_FP, i))
            } else if let Some(i) = fr.seek_closure(name) {
                Some((iarg::PTR_CP, i))
            } else {
                None
            }
        };
        if let Some((mode, slot)) = resolved {
            self.fr().emit(Opcode::PushPtr, mode, slot);
        } else if self.interns.get_str(name) == "__gbl__" {
            self.fr().emit(Opcode::PushPtr, iarg::PTR_GBL, 0);
        } else if let Some(i) = self.capture_closure(name)? {
            self.fr().emit(Opcode::PushPtr, iarg::PTR_CP, i);
        } else {
            let namei = self.fr().seek_or_add_const(Rodata::Str(name))?;
            self.fr().emit(Opcode::PushPtr, iarg::PTR_SEEK, namei);
        }
        Ok(())
    }

    /// Implicit closure capture.
    ///
    /// When a name is found in an enclosing *function* frame (the script
    /// body does not count — its variables are globals), every frame on the
    /// chain between it and the current one captures the value: each parent
    /// pushes its binding and emits `ADD_CLOSURE` against the function
    /// value it is mid-way through defining. Returns the current frame's
    /// new cell index.
    fn capture_closure(&mut self, name: StringId) -> RunResult<Option<i16>> {
        if self.frames.len() < 3 {
            // Current function's parent is the script body; nothing to
            // capture from.
            return Ok(None);
        }
        let cur = self.frames.len() - 1;
        let Some(found) = (1..cur).rev().find(|&i| self.frames[i].has_symbol(name)) else {
            return Ok(None);
        };

        for child_idx in (found + 1)..=cur {
            let parent = &self.frames[child_idx - 1];
            // By construction the name is resolvable in the parent: either
            // it was found there, or the previous iteration captured it.
            let (mode, slot) = if let Some(i) = parent.seek_local(name) {
                (iarg::PTR_AP, i)
            } else if let Some(i) = parent.seek_arg(name) {
                (iarg::PTR_FP, i)
            } else if let Some(i) = parent.seek_closure(name) {
                (iarg::PTR_CP, i)
            } else {
                unreachable!("capture chain broken");
            };
            let parent = &mut self.frames[child_idx - 1];
            parent.emit(Opcode::PushPtr, mode, slot);
            parent.emit(Opcode::AddClosure, 0, 0);
            self.frames[child_idx].declare_closure(name)?;
        }
        Ok(self.frames[cur].seek_closure(name))
    }

    // ------------------------------------------------------------------
    // Function definitions
    // ------------------------------------------------------------------

    /// `function(params){…}` and ``` ``(params) expr `` ``` literals.
    ///
    /// `DEFFUNC` is emitted into the parent immediately (its arg2 holds the
    /// function number until the post-pass links the child executable), so
    /// the parameter list can bind defaults and captures onto the function
    /// value sitting on the parent's stack.
    pub(crate) fn funcdef(&mut self, lambda: bool, line: u32) -> RunResult<()> {
        let funcno = self.next_funcno;
        self.next_funcno += 1;
        let funcno_arg =
            i16::try_from(funcno).map_err(|_| RunError::parser("too many function definitions in one file"))?;
        self.fr().emit(Opcode::DefFunc, 0, funcno_arg);
        self.expect_delim(Delim::Lparen, "'(' after 'function'")?;

        self.frames.push(AsFrame::new(funcno, line));

        if !self.eat_delim(Delim::Rparen) {
            loop {
                let mut tok = self.next();
                // `:name = expr` declares an explicit capture with an
                // initializer evaluated in the parent.
                let closure = if tok.kind == TokenKind::Delim(Delim::Colon) {
                    tok = self.next();
                    true
                } else {
                    false
                };
                let TokenKind::Ident(name) = tok.kind else {
                    return Err(self.err_at(tok, "expected parameter name"));
                };
                let mut deflt = false;
                if self.eat_delim(Delim::Eq) {
                    deflt = true;
                    self.swap_top();
                    self.eval()?;
                    self.swap_top();
                }
                if closure {
                    if !deflt {
                        return Err(self.err_at(tok, "closure parameter needs an initializer"));
                    }
                    self.swap_top();
                    self.fr().emit(Opcode::AddClosure, 0, 0);
                    self.swap_top();
                    self.fr().declare_closure(name)?;
                } else {
                    if deflt {
                        // The parameter being declared gets the next slot.
                        let idx = self.frames.last().expect("frame").n_args() as i16;
                        self.swap_top();
                        self.fr().emit(Opcode::AddDefault, 0, idx);
                        self.swap_top();
                    }
                    let text = self.interns.get_str(name).to_owned();
                    self.frames
                        .last_mut()
                        .expect("frame")
                        .declare_arg(name, &text)
                        .map_err(|e| e.with_location(&self.file_name, tok.line))?;
                }
                let tok = self.next();
                match tok.kind {
                    TokenKind::Delim(Delim::Comma) => {}
                    TokenKind::Delim(Delim::Rparen) => break,
                    _ => return Err(self.err_at(tok, "expected ',' or ')' in parameter list")),
                }
            }
        }

        self.func_body(lambda)?;
        let done = self.frames.pop().expect("function frame");
        self.finished.push(done);
        Ok(())
    }

    fn func_body(&mut self, lambda: bool) -> RunResult<()> {
        if lambda {
            if self.peek().kind == TokenKind::Delim(Delim::Lbrace) {
                self.statement(false)?;
                self.expect_delim(Delim::Lambda, "closing '``'")?;
            } else {
                self.eval()?;
                self.expect_delim(Delim::Lambda, "closing '``'")?;
                self.fr().emit(Opcode::ReturnValue, 0, 0);
                return Ok(());
            }
        } else {
            self.statement(false)?;
        }
        // Fallthrough return for bodies that never hit `return`.
        self.fr().emit(Opcode::PushZero, 0, 0);
        self.fr().emit(Opcode::ReturnValue, 0, 0);
        Ok(())
    }
}

fn assign_opcode(d: Delim) -> Option<Opcode> {
    let op = match d {
        Delim::Eq => Opcode::Assign,
        Delim::PlusEq => Opcode::AssignAdd,
        Delim::MinusEq => Opcode::AssignSub,
        Delim::StarEq => Opcode::AssignMul,
        Delim::SlashEq => Opcode::AssignDiv,
        Delim::PercentEq => Opcode::AssignMod,
        Delim::CaretEq => Opcode::AssignXor,
        Delim::LshiftEq => Opcode::AssignLs,
        Delim::RshiftEq => Opcode::AssignRs,
        Delim::PipeEq => Opcode::AssignOr,
        Delim::AmpEq => Opcode::AssignAnd,
        _ => return None,
    };
    Some(op)
}
