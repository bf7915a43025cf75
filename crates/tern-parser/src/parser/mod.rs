//! Recursive-descent parser.
//!
//! The token cursor is restartable: `backup` saves the position, `restore`
//! rewinds to the last save, `commit` discards it. On error the parser reports
//! a diagnostic at the current token and skips to the next statement boundary
//! so that one pass collects as many diagnostics as are locally
//! distinguishable.

mod decl;
mod error;
mod expr;
mod stmt;
mod types;

pub use error::{ParseError, ParseErrorKind};

use crate::ast::{NodeArena, NodeId, NodeKind, ParseNode};
use crate::lexer::{LexOutput, Lexer};
use crate::log::{Logger, Severity};
use crate::source::{ModuleSource, SourceLocation};
use crate::token::{Keyword, Symbol, Token, TokenKind};
use rustc_hash::FxHashSet;

/// Names the parser treats as type identifiers: registered types plus forward
/// declarations encountered in the current parse.
#[derive(Debug, Default, Clone)]
pub struct ParseContext {
    pub type_names: FxHashSet<String>,
}

impl ParseContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            type_names: names.into_iter().map(Into::into).collect(),
        }
    }
}

/// The AST produced by one parse. Owns every node.
#[derive(Debug)]
pub struct ParseOutput {
    pub arena: NodeArena,
    pub root: NodeId,
}

/// Parse a module source into an AST, reporting lex and parse diagnostics to
/// `log`. Always produces a root node; its `body` list holds whatever
/// top-level units survived recovery.
pub fn parse_module(src: &ModuleSource, ctx: ParseContext, log: &mut Logger) -> ParseOutput {
    let LexOutput { tokens, errors } = Lexer::new(src).tokenize();
    for err in &errors {
        // Lexer codes occupy the 100-range
        let code = match err {
            crate::lexer::LexError::UnterminatedString { .. } => 100,
            crate::lexer::LexError::UnterminatedTemplate { .. } => 101,
            crate::lexer::LexError::UnterminatedComment { .. } => 102,
            crate::lexer::LexError::InvalidEscape { .. } => 103,
        };
        log.submit(Severity::Error, code, err.to_string(), Some(err.loc()));
    }

    Parser::new(tokens, ctx, log).run()
}

pub(crate) struct Parser<'src, 'log> {
    tokens: Vec<Token<'src>>,
    pos: usize,
    saved: Vec<usize>,
    pub(crate) arena: NodeArena,
    pub(crate) ctx: ParseContext,
    pub(crate) log: &'log mut Logger,
}

impl<'src, 'log> Parser<'src, 'log> {
    fn new(tokens: Vec<Token<'src>>, ctx: ParseContext, log: &'log mut Logger) -> Self {
        let mut p = Self {
            tokens,
            pos: 0,
            saved: Vec::new(),
            arena: NodeArena::new(),
            ctx,
            log,
        };
        p.skip_trivia();
        p
    }

    fn run(mut self) -> ParseOutput {
        let start = self.loc();
        let mut root = ParseNode::new(NodeKind::Root, start);
        let mut body = None;

        while !self.at_eof() {
            match decl::parse_top_level(&mut self) {
                Ok(Some(node)) => {
                    self.arena.append(&mut body, node);
                }
                Ok(None) => {}
                Err(err) => {
                    self.report(&err);
                    self.recover();
                }
            }
        }

        root.body = body;
        root.loc = start.merge(&self.loc());
        let root = self.arena.alloc(root);
        ParseOutput {
            arena: self.arena,
            root,
        }
    }

    // ----- cursor ---------------------------------------------------------

    fn skip_trivia(&mut self) {
        while self
            .tokens
            .get(self.pos)
            .map(|t| t.kind.is_trivia())
            .unwrap_or(false)
        {
            self.pos += 1;
        }
    }

    pub(crate) fn current(&self) -> &Token<'src> {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    pub(crate) fn loc(&self) -> SourceLocation {
        self.current().loc
    }

    pub(crate) fn at_eof(&self) -> bool {
        self.current().kind == TokenKind::Eof
    }

    pub(crate) fn advance(&mut self) -> Token<'src> {
        let tok = self.current().clone();
        if !self.at_eof() {
            self.pos += 1;
            self.skip_trivia();
        }
        tok
    }

    /// Save the cursor. Pair with `restore` or `commit`.
    pub(crate) fn backup(&mut self) {
        self.saved.push(self.pos);
    }

    /// Rewind to the most recent save.
    pub(crate) fn restore(&mut self) {
        if let Some(pos) = self.saved.pop() {
            self.pos = pos;
        }
    }

    /// Discard the most recent save, keeping the current position.
    pub(crate) fn commit(&mut self) {
        let popped = self.saved.pop();
        debug_assert!(popped.is_some(), "commit without backup");
    }

    // ----- matching -------------------------------------------------------

    pub(crate) fn at_symbol(&self, sym: Symbol) -> bool {
        self.current().is_symbol(sym)
    }

    pub(crate) fn at_keyword(&self, kw: Keyword) -> bool {
        self.current().is_keyword(kw)
    }

    pub(crate) fn eat_symbol(&mut self, sym: Symbol) -> bool {
        if self.at_symbol(sym) {
            self.advance();
            true
        } else {
            false
        }
    }

    pub(crate) fn eat_keyword(&mut self, kw: Keyword) -> bool {
        if self.at_keyword(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    pub(crate) fn expect_symbol(&mut self, sym: Symbol) -> Result<SourceLocation, ParseError> {
        if self.at_symbol(sym) {
            Ok(self.advance().loc)
        } else {
            Err(self.err(ParseErrorKind::ExpectedOperator(sym.as_str())))
        }
    }

    pub(crate) fn expect_keyword(&mut self, kw: Keyword) -> Result<SourceLocation, ParseError> {
        if self.at_keyword(kw) {
            Ok(self.advance().loc)
        } else {
            Err(self.err(ParseErrorKind::ExpectedKeyword(kw.as_str())))
        }
    }

    /// Consume an identifier token and return its text.
    pub(crate) fn expect_identifier(&mut self) -> Result<(String, SourceLocation), ParseError> {
        if self.current().kind == TokenKind::Identifier {
            let tok = self.advance();
            Ok((tok.text.into_owned(), tok.loc))
        } else {
            Err(self.err(ParseErrorKind::ExpectedIdentifier))
        }
    }

    pub(crate) fn err(&self, kind: ParseErrorKind) -> ParseError {
        let kind = if self.at_eof() {
            match kind {
                ParseErrorKind::UnexpectedEof(_) => kind,
                _ => ParseErrorKind::UnexpectedEof("input"),
            }
        } else {
            kind
        };
        ParseError::new(kind, self.loc())
    }

    pub(crate) fn report(&mut self, err: &ParseError) {
        self.log
            .submit(Severity::Error, err.kind.code(), err.to_string(), Some(err.loc));
    }

    /// Skip to the next statement boundary: past the next `;`, or up to a `}`
    /// that closes the brace level the error occurred at.
    pub(crate) fn recover(&mut self) {
        let mut depth = 0usize;
        while !self.at_eof() {
            match &self.current().kind {
                TokenKind::Symbol(Symbol::Semicolon) if depth == 0 => {
                    self.advance();
                    return;
                }
                TokenKind::Symbol(Symbol::OpenBrace) => {
                    depth += 1;
                }
                TokenKind::Symbol(Symbol::CloseBrace) => {
                    if depth == 0 {
                        self.advance();
                        return;
                    }
                    depth -= 1;
                }
                _ => {}
            }
            self.advance();
        }
    }

    // ----- node helpers ---------------------------------------------------

    pub(crate) fn alloc(&mut self, node: ParseNode) -> NodeId {
        self.arena.alloc(node)
    }

    /// Extend `node.loc` to end at the previous token.
    pub(crate) fn close_loc(&self, start: &SourceLocation) -> SourceLocation {
        let mut i = self.pos;
        while i > 0 {
            i -= 1;
            let t = &self.tokens[i];
            if !t.kind.is_trivia() {
                return start.merge(&t.loc);
            }
        }
        *start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> (ParseOutput, Logger) {
        let src = ModuleSource::new("test.tn", text);
        let mut log = Logger::new();
        let out = parse_module(&src, ParseContext::new(), &mut log);
        (out, log)
    }

    #[test]
    fn empty_module_has_root() {
        let (out, log) = parse("");
        assert!(!log.has_errors());
        assert_eq!(out.arena.get(out.root).kind, NodeKind::Root);
        assert!(out.arena.get(out.root).body.is_none());
    }

    #[test]
    fn recovery_collects_multiple_errors() {
        let (out, log) = parse("let = 1;\nlet y = 2;\nlet = 3;\nlet z = 4;");
        assert!(log.error_count() >= 2);
        // The two well-formed declarations survive
        let root = out.arena.get(out.root);
        let names: Vec<String> = out
            .arena
            .iter_list(root.body)
            .filter(|(_, n)| n.kind == NodeKind::VariableDecl)
            .filter_map(|(_, n)| {
                n.identifier
                    .and_then(|id| out.arena.get(id).text.clone())
            })
            .collect();
        assert_eq!(names, vec!["y".to_string(), "z".to_string()]);
    }

    #[test]
    fn c_style_declaration_gets_targeted_diagnostic() {
        let src = ModuleSource::new("test.tn", "i32 x = 1;\nlet y = 2;");
        let mut log = Logger::new();
        let out = parse_module(&src, ParseContext::with_type_names(["i32"]), &mut log);
        assert!(log
            .messages()
            .iter()
            .any(|m| m.message.contains("'let'")));
        // Recovery continues with the next statement
        let root = out.arena.get(out.root);
        assert!(out
            .arena
            .iter_list(root.body)
            .any(|(_, n)| n.kind == NodeKind::VariableDecl));
    }

    #[test]
    fn backup_restore_rewinds() {
        let src = ModuleSource::new("test.tn", "a b c");
        let LexOutput { tokens, .. } = Lexer::new(&src).tokenize();
        let mut log = Logger::new();
        let mut p = Parser::new(tokens, ParseContext::new(), &mut log);
        p.backup();
        p.advance();
        p.advance();
        assert_eq!(p.current().text, "c");
        p.restore();
        assert_eq!(p.current().text, "a");
        p.backup();
        p.advance();
        p.commit();
        assert_eq!(p.current().text, "b");
    }
}
