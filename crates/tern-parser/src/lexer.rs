//! Lexer for Tern source text.
//!
//! Built on a logos-derived tokenizer. The lexer never fails fatally: unknown
//! byte sequences become [`TokenKind::Unknown`] tokens for the parser to
//! report, and unterminated literals/comments produce diagnostics carrying the
//! opening source location while lexing continues.

use crate::source::{ModuleSource, SourceLocation};
use crate::token::{IntSuffix, Keyword, Symbol, Token, TokenKind};
use logos::Logos;
use std::borrow::Cow;
use thiserror::Error;

/// Lexer diagnostics. Collected, never thrown mid-stream.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LexError {
    #[error("unterminated string literal")]
    UnterminatedString { loc: SourceLocation },
    #[error("unterminated template literal")]
    UnterminatedTemplate { loc: SourceLocation },
    #[error("unterminated block comment")]
    UnterminatedComment { loc: SourceLocation },
    #[error("invalid escape sequence '\\{escape}'")]
    InvalidEscape { escape: char, loc: SourceLocation },
}

impl LexError {
    pub fn loc(&self) -> SourceLocation {
        match self {
            LexError::UnterminatedString { loc }
            | LexError::UnterminatedTemplate { loc }
            | LexError::UnterminatedComment { loc }
            | LexError::InvalidEscape { loc, .. } => *loc,
        }
    }
}

/// Result of lexing one module: the full token stream (comments included,
/// terminated by `Eof`) plus any diagnostics.
#[derive(Debug)]
pub struct LexOutput<'src> {
    pub tokens: Vec<Token<'src>>,
    pub errors: Vec<LexError>,
}

#[derive(Debug, Clone, PartialEq)]
struct QuotedLit {
    decoded: String,
    terminated: bool,
    bad_escape: Option<char>,
}

/// Internal logos token set, converted to [`TokenKind`] after matching.
#[derive(Logos, Debug, Clone, PartialEq)]
enum RawToken {
    #[regex(r"[ \t\r\n]+", logos::skip)]
    Whitespace,

    #[regex(r"//[^\n]*")]
    LineComment,

    #[regex(r"/\*", lex_block_comment)]
    BlockComment(bool),

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*")]
    Ident,

    #[regex(
        r"[0-9]+([uU]([bB]|[sS]|[lL][lL]?)|[bB]|[sS]|[lL][lL])?",
        parse_int
    )]
    Int((u64, IntSuffix)),

    #[regex(r"([0-9]+\.[0-9]*|\.[0-9]+)([eE][+-]?[0-9]+)?[fF]?", parse_float)]
    #[regex(r"[0-9]+[eE][+-]?[0-9]+[fF]?", parse_float)]
    #[regex(r"[0-9]+[fF]", parse_float)]
    Float((f64, bool)),

    #[token("\"", |lex| lex_quoted(lex, '"'))]
    #[token("'", |lex| lex_quoted(lex, '\''))]
    Str(QuotedLit),

    #[token("`", lex_template)]
    Template(QuotedLit),

    // Three-character operators first, then two, then one.
    #[token("<<=")]
    ShlAssign,
    #[token(">>=")]
    ShrAssign,

    #[token("<<")]
    Shl,
    #[token(">>")]
    Shr,
    #[token("&&")]
    AmpAmp,
    #[token("||")]
    PipePipe,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<=")]
    LessEq,
    #[token(">=")]
    GreaterEq,
    #[token("+=")]
    PlusAssign,
    #[token("-=")]
    MinusAssign,
    #[token("*=")]
    StarAssign,
    #[token("/=")]
    SlashAssign,
    #[token("%=")]
    PercentAssign,
    #[token("&=")]
    AmpAssign,
    #[token("|=")]
    PipeAssign,
    #[token("^=")]
    CaretAssign,
    #[token("=>")]
    Arrow,

    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("&")]
    Amp,
    #[token("|")]
    Pipe,
    #[token("^")]
    Caret,
    #[token("~")]
    Tilde,
    #[token("!")]
    Bang,
    #[token("<")]
    Less,
    #[token(">")]
    Greater,
    #[token("=")]
    Assign,
    #[token("?")]
    Question,
    #[token(":")]
    Colon,
    #[token(".")]
    Dot,
    #[token(",")]
    Comma,
    #[token(";")]
    Semicolon,
    #[token("(")]
    OpenParen,
    #[token(")")]
    CloseParen,
    #[token("{")]
    OpenBrace,
    #[token("}")]
    CloseBrace,
    #[token("[")]
    OpenBracket,
    #[token("]")]
    CloseBracket,
}

fn lex_block_comment(lex: &mut logos::Lexer<RawToken>) -> bool {
    let remainder = lex.remainder();
    match remainder.find("*/") {
        Some(end) => {
            lex.bump(end + 2);
            true
        }
        None => {
            lex.bump(remainder.len());
            false
        }
    }
}

fn parse_int(lex: &mut logos::Lexer<RawToken>) -> Option<(u64, IntSuffix)> {
    let slice = lex.slice();
    let digits_end = slice
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(slice.len());
    let value: u64 = slice[..digits_end].parse().ok()?;
    let suffix = match slice[digits_end..].to_ascii_lowercase().as_str() {
        "" => IntSuffix::None,
        "b" => IntSuffix::I8,
        "ub" => IntSuffix::U8,
        "s" => IntSuffix::I16,
        "us" => IntSuffix::U16,
        "ul" => IntSuffix::U32,
        "ll" => IntSuffix::I64,
        "ull" => IntSuffix::U64,
        _ => return None,
    };
    Some((value, suffix))
}

fn parse_float(lex: &mut logos::Lexer<RawToken>) -> Option<(f64, bool)> {
    let slice = lex.slice();
    let is_f32 = slice.ends_with(['f', 'F']);
    let digits = if is_f32 { &slice[..slice.len() - 1] } else { slice };
    digits.parse().ok().map(|v| (v, is_f32))
}

/// Decode a quoted literal starting after the opening delimiter.
///
/// Stops at the matching delimiter or, for single/double quotes, at a raw
/// newline (unterminated). Recognized escapes: `\n \r \t \\ \' \" \xHH`.
fn decode_quoted(remainder: &str, delim: char, allow_newline: bool) -> (QuotedLit, usize) {
    let mut decoded = String::new();
    let mut bad_escape = None;
    let mut chars = remainder.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if c == delim {
            return (
                QuotedLit {
                    decoded,
                    terminated: true,
                    bad_escape,
                },
                i + c.len_utf8(),
            );
        }
        if c == '\n' && !allow_newline {
            return (
                QuotedLit {
                    decoded,
                    terminated: false,
                    bad_escape,
                },
                i,
            );
        }
        if c == '\\' {
            match chars.next() {
                Some((_, 'n')) => decoded.push('\n'),
                Some((_, 'r')) => decoded.push('\r'),
                Some((_, 't')) => decoded.push('\t'),
                Some((_, '\\')) => decoded.push('\\'),
                Some((_, '\'')) => decoded.push('\''),
                Some((_, '"')) => decoded.push('"'),
                Some((_, '`')) => decoded.push('`'),
                Some((j, 'x')) => {
                    let hex = &remainder[j + 1..];
                    let digits: String = hex.chars().take(2).collect();
                    if digits.len() == 2 && digits.chars().all(|c| c.is_ascii_hexdigit()) {
                        // Cannot fail after the digit check
                        let byte = u8::from_str_radix(&digits, 16).unwrap_or(0);
                        decoded.push(byte as char);
                        chars.next();
                        chars.next();
                    } else {
                        bad_escape.get_or_insert('x');
                        decoded.push('x');
                    }
                }
                Some((_, other)) => {
                    bad_escape.get_or_insert(other);
                    decoded.push(other);
                }
                None => break,
            }
        } else {
            decoded.push(c);
        }
    }

    (
        QuotedLit {
            decoded,
            terminated: false,
            bad_escape,
        },
        remainder.len(),
    )
}

fn lex_quoted(lex: &mut logos::Lexer<RawToken>, delim: char) -> QuotedLit {
    let (lit, consumed) = decode_quoted(lex.remainder(), delim, false);
    lex.bump(consumed);
    lit
}

fn lex_template(lex: &mut logos::Lexer<RawToken>) -> QuotedLit {
    let (lit, consumed) = decode_quoted(lex.remainder(), '`', true);
    lex.bump(consumed);
    lit
}

/// Lexer over one [`ModuleSource`].
pub struct Lexer<'src> {
    src: &'src ModuleSource,
}

impl<'src> Lexer<'src> {
    pub fn new(src: &'src ModuleSource) -> Self {
        Self { src }
    }

    pub fn tokenize(self) -> LexOutput<'src> {
        let text = self.src.text();
        let mut tokens = Vec::new();
        let mut errors = Vec::new();
        let mut logos_lexer = RawToken::lexer(text);

        while let Some(result) = logos_lexer.next() {
            let range = logos_lexer.span();
            let loc = self.src.location(range.start as u32, range.end as u32);
            let slice = &text[range.clone()];

            let (kind, text_view): (TokenKind, Cow<'src, str>) = match result {
                Ok(raw) => match raw {
                    RawToken::LineComment => (TokenKind::Comment, Cow::Borrowed(slice)),
                    RawToken::BlockComment(terminated) => {
                        if !terminated {
                            let open = self.src.location(range.start as u32, range.start as u32 + 2);
                            errors.push(LexError::UnterminatedComment { loc: open });
                        }
                        (TokenKind::Comment, Cow::Borrowed(slice))
                    }
                    RawToken::Ident => match Keyword::from_str(slice) {
                        Some(kw) => (TokenKind::Keyword(kw), Cow::Borrowed(slice)),
                        None => (TokenKind::Identifier, Cow::Borrowed(slice)),
                    },
                    RawToken::Int((value, suffix)) => {
                        (TokenKind::IntLiteral { value, suffix }, Cow::Borrowed(slice))
                    }
                    RawToken::Float((value, is_f32)) => {
                        (TokenKind::FloatLiteral { value, is_f32 }, Cow::Borrowed(slice))
                    }
                    RawToken::Str(lit) => {
                        let open = self.src.location(range.start as u32, range.start as u32 + 1);
                        if !lit.terminated {
                            errors.push(LexError::UnterminatedString { loc: open });
                        }
                        if let Some(escape) = lit.bad_escape {
                            errors.push(LexError::InvalidEscape { escape, loc: open });
                        }
                        (TokenKind::StringLiteral, Cow::Owned(lit.decoded))
                    }
                    RawToken::Template(lit) => {
                        let open = self.src.location(range.start as u32, range.start as u32 + 1);
                        if !lit.terminated {
                            errors.push(LexError::UnterminatedTemplate { loc: open });
                        }
                        if let Some(escape) = lit.bad_escape {
                            errors.push(LexError::InvalidEscape { escape, loc: open });
                        }
                        (TokenKind::TemplateLiteral, Cow::Owned(lit.decoded))
                    }
                    RawToken::Whitespace => continue,
                    other => (TokenKind::Symbol(symbol_of(&other)), Cow::Borrowed(slice)),
                },
                Err(()) => (TokenKind::Unknown, Cow::Borrowed(slice)),
            };

            tokens.push(Token::new(kind, text_view, loc));
        }

        let end = text.len() as u32;
        tokens.push(Token::new(TokenKind::Eof, "", self.src.location(end, end)));

        LexOutput { tokens, errors }
    }
}

fn symbol_of(raw: &RawToken) -> Symbol {
    match raw {
        RawToken::Plus => Symbol::Plus,
        RawToken::Minus => Symbol::Minus,
        RawToken::Star => Symbol::Star,
        RawToken::Slash => Symbol::Slash,
        RawToken::Percent => Symbol::Percent,
        RawToken::Amp => Symbol::Amp,
        RawToken::Pipe => Symbol::Pipe,
        RawToken::Caret => Symbol::Caret,
        RawToken::Tilde => Symbol::Tilde,
        RawToken::Shl => Symbol::Shl,
        RawToken::Shr => Symbol::Shr,
        RawToken::AmpAmp => Symbol::AmpAmp,
        RawToken::PipePipe => Symbol::PipePipe,
        RawToken::Bang => Symbol::Bang,
        RawToken::EqEq => Symbol::EqEq,
        RawToken::NotEq => Symbol::NotEq,
        RawToken::Less => Symbol::Less,
        RawToken::Greater => Symbol::Greater,
        RawToken::LessEq => Symbol::LessEq,
        RawToken::GreaterEq => Symbol::GreaterEq,
        RawToken::Assign => Symbol::Assign,
        RawToken::PlusAssign => Symbol::PlusAssign,
        RawToken::MinusAssign => Symbol::MinusAssign,
        RawToken::StarAssign => Symbol::StarAssign,
        RawToken::SlashAssign => Symbol::SlashAssign,
        RawToken::PercentAssign => Symbol::PercentAssign,
        RawToken::AmpAssign => Symbol::AmpAssign,
        RawToken::PipeAssign => Symbol::PipeAssign,
        RawToken::CaretAssign => Symbol::CaretAssign,
        RawToken::ShlAssign => Symbol::ShlAssign,
        RawToken::ShrAssign => Symbol::ShrAssign,
        RawToken::Arrow => Symbol::Arrow,
        RawToken::Question => Symbol::Question,
        RawToken::Colon => Symbol::Colon,
        RawToken::Dot => Symbol::Dot,
        RawToken::Comma => Symbol::Comma,
        RawToken::Semicolon => Symbol::Semicolon,
        RawToken::OpenParen => Symbol::OpenParen,
        RawToken::CloseParen => Symbol::CloseParen,
        RawToken::OpenBrace => Symbol::OpenBrace,
        RawToken::CloseBrace => Symbol::CloseBrace,
        RawToken::OpenBracket => Symbol::OpenBracket,
        RawToken::CloseBracket => Symbol::CloseBracket,
        _ => unreachable!("non-symbol raw token"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(text: &str) -> (Vec<Token<'_>>, Vec<LexError>) {
        // Leak to satisfy the borrow; fine in tests.
        let src = Box::leak(Box::new(ModuleSource::new("test.tn", text)));
        let out = Lexer::new(src).tokenize();
        (out.tokens, out.errors)
    }

    fn kinds<'a>(tokens: &'a [Token<'a>]) -> Vec<&'a TokenKind> {
        tokens.iter().map(|t| &t.kind).collect()
    }

    #[test]
    fn keywords_and_identifiers() {
        let (tokens, errors) = lex("let x = sizeof(foo);");
        assert!(errors.is_empty());
        assert_eq!(
            kinds(&tokens),
            vec![
                &TokenKind::Keyword(Keyword::Let),
                &TokenKind::Identifier,
                &TokenKind::Symbol(Symbol::Assign),
                &TokenKind::Keyword(Keyword::Sizeof),
                &TokenKind::Symbol(Symbol::OpenParen),
                &TokenKind::Identifier,
                &TokenKind::Symbol(Symbol::CloseParen),
                &TokenKind::Symbol(Symbol::Semicolon),
                &TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn integer_suffixes() {
        let (tokens, _) = lex("1 2b 3ub 4s 5us 6ul 7ll 8ull 9ULL");
        let expected = [
            IntSuffix::None,
            IntSuffix::I8,
            IntSuffix::U8,
            IntSuffix::I16,
            IntSuffix::U16,
            IntSuffix::U32,
            IntSuffix::I64,
            IntSuffix::U64,
            IntSuffix::U64,
        ];
        for (tok, want) in tokens.iter().zip(expected) {
            match tok.kind {
                TokenKind::IntLiteral { suffix, .. } => assert_eq!(suffix, want),
                ref k => panic!("expected int literal, got {:?}", k),
            }
        }
    }

    #[test]
    fn float_literals() {
        let (tokens, _) = lex("1.5 2.5f 3e2 4f .25");
        let expected = [(1.5, false), (2.5, true), (300.0, false), (4.0, true), (0.25, false)];
        for (tok, (value, is_f32)) in tokens.iter().zip(expected) {
            match tok.kind {
                TokenKind::FloatLiteral { value: v, is_f32: f } => {
                    assert_eq!(v, value);
                    assert_eq!(f, is_f32);
                }
                ref k => panic!("expected float literal, got {:?}", k),
            }
        }
    }

    #[test]
    fn string_escapes_decode() {
        let (tokens, errors) = lex(r#""a\tb\x41\"q""#);
        assert!(errors.is_empty());
        assert_eq!(tokens[0].kind, TokenKind::StringLiteral);
        assert_eq!(tokens[0].text, "a\tbA\"q");
    }

    #[test]
    fn unterminated_string_is_diagnosed() {
        let (tokens, errors) = lex("\"abc\nlet x;");
        assert!(matches!(errors[0], LexError::UnterminatedString { .. }));
        assert_eq!(errors[0].loc().offset, 0);
        // Lexing continues on the following line
        assert!(tokens.iter().any(|t| t.is_keyword(Keyword::Let)));
    }

    #[test]
    fn template_spans_lines() {
        let (tokens, errors) = lex("`line one\nline two`");
        assert!(errors.is_empty());
        assert_eq!(tokens[0].kind, TokenKind::TemplateLiteral);
        assert_eq!(tokens[0].text, "line one\nline two");
    }

    #[test]
    fn comments_are_tokens() {
        let (tokens, errors) = lex("a // trailing\n/* block */ b");
        assert!(errors.is_empty());
        let comment_count = tokens.iter().filter(|t| t.kind == TokenKind::Comment).count();
        assert_eq!(comment_count, 2);
    }

    #[test]
    fn unterminated_comment_is_diagnosed() {
        let (_, errors) = lex("a /* never closed");
        assert!(matches!(errors[0], LexError::UnterminatedComment { .. }));
        assert_eq!(errors[0].loc().offset, 2);
    }

    #[test]
    fn unknown_bytes_do_not_abort() {
        let (tokens, _) = lex("let @ x;");
        assert!(tokens.iter().any(|t| t.kind == TokenKind::Unknown));
        assert!(tokens.iter().any(|t| t.is_keyword(Keyword::Let)));
        assert_eq!(tokens.last().map(|t| &t.kind), Some(&TokenKind::Eof));
    }

    #[test]
    fn operators_longest_match() {
        let (tokens, _) = lex("a <<= b >> c => d");
        assert!(tokens.iter().any(|t| t.is_symbol(Symbol::ShlAssign)));
        assert!(tokens.iter().any(|t| t.is_symbol(Symbol::Shr)));
        assert!(tokens.iter().any(|t| t.is_symbol(Symbol::Arrow)));
    }
}
