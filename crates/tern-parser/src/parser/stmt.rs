//! Statement parsing.

use super::expr::parse_expression;
use super::types::{self, parse_type};
use super::{ParseError, ParseErrorKind, Parser};
use crate::ast::{NodeId, NodeKind, ParseNode};
use crate::token::{Keyword, Symbol, TokenKind};

pub(crate) fn parse_statement(p: &mut Parser) -> Result<NodeId, ParseError> {
    let start = p.loc();

    if p.at_symbol(Symbol::OpenBrace) {
        return parse_block(p);
    }
    if p.at_keyword(Keyword::If) {
        return parse_if(p);
    }
    if p.at_keyword(Keyword::For) {
        return parse_for(p);
    }
    if p.at_keyword(Keyword::While) {
        return parse_while(p);
    }
    if p.at_keyword(Keyword::Do) {
        return parse_do_while(p);
    }
    if p.at_keyword(Keyword::Switch) {
        return parse_switch(p);
    }
    if p.at_keyword(Keyword::Return) {
        p.advance();
        let mut node = ParseNode::new(NodeKind::Return, start);
        if !p.at_symbol(Symbol::Semicolon) {
            node.rvalue = Some(parse_expression(p)?);
        }
        p.expect_symbol(Symbol::Semicolon)?;
        node.loc = p.close_loc(&start);
        return Ok(p.alloc(node));
    }
    if p.at_keyword(Keyword::Delete) {
        p.advance();
        let target = parse_expression(p)?;
        p.expect_symbol(Symbol::Semicolon)?;
        let mut node = ParseNode::new(NodeKind::Delete, start);
        node.rvalue = Some(target);
        node.loc = p.close_loc(&start);
        return Ok(p.alloc(node));
    }
    if p.at_keyword(Keyword::Break) {
        p.advance();
        p.expect_symbol(Symbol::Semicolon)?;
        return Ok(p.alloc(ParseNode::new(NodeKind::Break, start)));
    }
    if p.at_keyword(Keyword::Continue) {
        p.advance();
        p.expect_symbol(Symbol::Semicolon)?;
        return Ok(p.alloc(ParseNode::new(NodeKind::Continue, start)));
    }
    if p.at_keyword(Keyword::Let) || p.at_keyword(Keyword::Const) {
        return parse_variable_decl(p);
    }
    if p.at_symbol(Symbol::Semicolon) {
        p.advance();
        return Ok(p.alloc(ParseNode::new(NodeKind::Empty, start)));
    }

    // A known type name opening a statement is usually a C-style declaration
    // slip; probe with the restartable cursor and report it as such.
    if p.current().kind == TokenKind::Identifier && types::at_type(p) {
        p.backup();
        let looks_like_decl =
            parse_type(p).is_ok() && p.current().kind == TokenKind::Identifier;
        p.restore();
        if looks_like_decl {
            return Err(p.err(ParseErrorKind::ExpectedKeyword("let")));
        }
    }

    // expression ';'
    let expr = parse_expression(p)?;
    p.expect_symbol(Symbol::Semicolon)?;
    Ok(expr)
}

pub(crate) fn parse_block(p: &mut Parser) -> Result<NodeId, ParseError> {
    let start = p.loc();
    p.expect_symbol(Symbol::OpenBrace)?;

    let mut body = None;
    while !p.at_symbol(Symbol::CloseBrace) && !p.at_eof() {
        match parse_statement(p) {
            Ok(stmt) => {
                p.arena.append(&mut body, stmt);
            }
            Err(err) => {
                p.report(&err);
                p.recover();
            }
        }
    }
    p.expect_symbol(Symbol::CloseBrace)?;

    let mut node = ParseNode::new(NodeKind::Block, start);
    node.body = body;
    node.loc = p.close_loc(&start);
    Ok(p.alloc(node))
}

fn parse_if(p: &mut Parser) -> Result<NodeId, ParseError> {
    let start = p.loc();
    p.expect_keyword(Keyword::If)?;
    p.expect_symbol(Symbol::OpenParen)?;
    let cond = parse_expression(p)?;
    p.expect_symbol(Symbol::CloseParen)?;
    let body = parse_statement(p)?;

    let mut node = ParseNode::new(NodeKind::If, start);
    node.condition = Some(cond);
    node.body = Some(body);
    if p.eat_keyword(Keyword::Else) {
        node.else_body = Some(parse_statement(p)?);
    }
    node.loc = p.close_loc(&start);
    Ok(p.alloc(node))
}

fn parse_for(p: &mut Parser) -> Result<NodeId, ParseError> {
    let start = p.loc();
    p.expect_keyword(Keyword::For)?;
    p.expect_symbol(Symbol::OpenParen)?;

    let mut node = ParseNode::new(NodeKind::For, start);

    // initializer
    if !p.eat_symbol(Symbol::Semicolon) {
        if p.at_keyword(Keyword::Let) || p.at_keyword(Keyword::Const) {
            node.initializer = Some(parse_variable_decl(p)?);
        } else {
            node.initializer = Some(parse_expression(p)?);
            p.expect_symbol(Symbol::Semicolon)?;
        }
    }

    // condition
    if !p.at_symbol(Symbol::Semicolon) {
        node.condition = Some(parse_expression(p)?);
    }
    p.expect_symbol(Symbol::Semicolon)?;

    // step
    if !p.at_symbol(Symbol::CloseParen) {
        node.modifier = Some(parse_expression(p)?);
    }
    p.expect_symbol(Symbol::CloseParen)?;

    node.body = Some(parse_statement(p)?);
    node.loc = p.close_loc(&start);
    Ok(p.alloc(node))
}

fn parse_while(p: &mut Parser) -> Result<NodeId, ParseError> {
    let start = p.loc();
    p.expect_keyword(Keyword::While)?;
    p.expect_symbol(Symbol::OpenParen)?;
    let cond = parse_expression(p)?;
    p.expect_symbol(Symbol::CloseParen)?;
    let body = parse_statement(p)?;

    let mut node = ParseNode::new(NodeKind::While, start);
    node.condition = Some(cond);
    node.body = Some(body);
    node.loc = p.close_loc(&start);
    Ok(p.alloc(node))
}

fn parse_do_while(p: &mut Parser) -> Result<NodeId, ParseError> {
    let start = p.loc();
    p.expect_keyword(Keyword::Do)?;
    let body = parse_statement(p)?;
    p.expect_keyword(Keyword::While)?;
    p.expect_symbol(Symbol::OpenParen)?;
    let cond = parse_expression(p)?;
    p.expect_symbol(Symbol::CloseParen)?;
    p.expect_symbol(Symbol::Semicolon)?;

    let mut node = ParseNode::new(NodeKind::DoWhile, start);
    node.condition = Some(cond);
    node.body = Some(body);
    node.loc = p.close_loc(&start);
    Ok(p.alloc(node))
}

fn parse_switch(p: &mut Parser) -> Result<NodeId, ParseError> {
    let start = p.loc();
    p.expect_keyword(Keyword::Switch)?;
    p.expect_symbol(Symbol::OpenParen)?;
    let value = parse_expression(p)?;
    p.expect_symbol(Symbol::CloseParen)?;
    p.expect_symbol(Symbol::OpenBrace)?;

    let mut cases = None;
    while !p.at_symbol(Symbol::CloseBrace) && !p.at_eof() {
        let case_start = p.loc();
        let mut case = ParseNode::new(NodeKind::SwitchCase, case_start);
        if p.eat_keyword(Keyword::Case) {
            case.condition = Some(parse_expression(p)?);
        } else {
            p.expect_keyword(Keyword::Default)?;
        }
        p.expect_symbol(Symbol::Colon)?;

        let mut body = None;
        while !p.at_symbol(Symbol::CloseBrace)
            && !p.at_keyword(Keyword::Case)
            && !p.at_keyword(Keyword::Default)
            && !p.at_eof()
        {
            let stmt = parse_statement(p)?;
            p.arena.append(&mut body, stmt);
        }
        case.body = body;
        case.loc = p.close_loc(&case_start);
        let case = p.alloc(case);
        p.arena.append(&mut cases, case);
    }
    p.expect_symbol(Symbol::CloseBrace)?;

    let mut node = ParseNode::new(NodeKind::Switch, start);
    node.condition = Some(value);
    node.body = cases;
    node.loc = p.close_loc(&start);
    Ok(p.alloc(node))
}

/// `let name[: type] [= init];` or `const name[: type] = init;`
///
/// Consumes the trailing semicolon.
pub(crate) fn parse_variable_decl(p: &mut Parser) -> Result<NodeId, ParseError> {
    let start = p.loc();
    let is_const = p.at_keyword(Keyword::Const);
    if !p.eat_keyword(Keyword::Let) && !p.eat_keyword(Keyword::Const) {
        return Err(p.err(super::ParseErrorKind::ExpectedKeyword("let")));
    }

    let (name, name_loc) = p.expect_identifier()?;
    let mut ident = ParseNode::new(NodeKind::Identifier, name_loc);
    ident.text = Some(name);
    let ident = p.alloc(ident);

    let mut node = ParseNode::new(NodeKind::VariableDecl, start);
    node.flags.is_const = is_const;
    node.identifier = Some(ident);

    if p.eat_symbol(Symbol::Colon) {
        node.data_type = Some(parse_type(p)?);
    }
    if p.eat_symbol(Symbol::Assign) {
        node.initializer = Some(parse_expression(p)?);
    }
    p.expect_symbol(Symbol::Semicolon)?;

    node.loc = p.close_loc(&start);
    Ok(p.alloc(node))
}
