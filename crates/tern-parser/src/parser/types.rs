//! Type identifier parsing.

use super::{ParseError, ParseErrorKind, Parser};
use crate::ast::{NodeId, NodeKind, ParseNode};
use crate::token::{Symbol, TokenKind};

/// Parse a type reference.
///
/// Forms:
/// - `Name`
/// - `Name<T, U>` (template instantiation)
/// - `(T, U) => R` (function signature)
pub(crate) fn parse_type(p: &mut Parser) -> Result<NodeId, ParseError> {
    let start = p.loc();

    if p.at_symbol(Symbol::OpenParen) {
        return parse_function_type(p);
    }

    if p.current().kind != TokenKind::Identifier {
        return Err(p.err(ParseErrorKind::ExpectedType));
    }
    let (name, _) = p.expect_identifier()?;

    let mut node = ParseNode::new(NodeKind::TypeIdentifier, start);
    node.text = Some(name);

    if p.at_symbol(Symbol::Less) {
        p.advance();
        let mut args = None;
        loop {
            let arg = parse_type(p)?;
            p.arena.append(&mut args, arg);
            if !p.eat_symbol(Symbol::Comma) {
                break;
            }
        }
        p.expect_symbol(Symbol::Greater)?;
        node.arguments = args;
    }

    node.loc = p.close_loc(&start);
    Ok(p.alloc(node))
}

/// `(T, U) => R`
fn parse_function_type(p: &mut Parser) -> Result<NodeId, ParseError> {
    let start = p.loc();
    p.expect_symbol(Symbol::OpenParen)?;

    let mut params = None;
    if !p.at_symbol(Symbol::CloseParen) {
        loop {
            let param = parse_type(p)?;
            p.arena.append(&mut params, param);
            if !p.eat_symbol(Symbol::Comma) {
                break;
            }
        }
    }
    p.expect_symbol(Symbol::CloseParen)?;
    p.expect_symbol(Symbol::Arrow)?;
    let ret = parse_type(p)?;

    let mut node = ParseNode::new(NodeKind::TypeIdentifier, start);
    node.parameters = params;
    node.data_type = Some(ret);
    node.loc = p.close_loc(&start);
    Ok(p.alloc(node))
}

/// Whether the current token could begin a type reference. Consults the
/// typename set for bare identifiers.
pub(crate) fn at_type(p: &Parser) -> bool {
    match &p.current().kind {
        TokenKind::Identifier => p.ctx.type_names.contains(p.current().text.as_ref()),
        TokenKind::Symbol(Symbol::OpenParen) => true,
        _ => false,
    }
}
