//! Top-level and member declarations.

use super::expr::parse_expression;
use super::stmt::{parse_block, parse_statement, parse_variable_decl};
use super::types::parse_type;
use super::{ParseError, ParseErrorKind, Parser};
use crate::ast::{NodeFlags, NodeId, NodeKind, OperatorKind, ParseNode};
use crate::token::{Keyword, Symbol, TokenKind};

pub(crate) fn parse_top_level(p: &mut Parser) -> Result<Option<NodeId>, ParseError> {
    if p.at_keyword(Keyword::Import) {
        return parse_import(p).map(Some);
    }
    if p.at_keyword(Keyword::Export) {
        return parse_export(p).map(Some);
    }
    if p.at_keyword(Keyword::Type) {
        return parse_type_alias(p).map(Some);
    }
    if p.at_keyword(Keyword::Enum) {
        return parse_enum(p).map(Some);
    }
    if p.at_keyword(Keyword::Class) {
        return parse_class(p).map(Some);
    }
    if p.at_keyword(Keyword::Function) {
        return parse_function(p).map(Some);
    }
    parse_statement(p).map(Some)
}

/// `import { a, b } from 'path';` or `import 'path' as alias;`
fn parse_import(p: &mut Parser) -> Result<NodeId, ParseError> {
    let start = p.loc();
    p.expect_keyword(Keyword::Import)?;

    let mut node = ParseNode::new(NodeKind::Import, start);

    if p.eat_symbol(Symbol::OpenBrace) {
        let mut names = None;
        loop {
            let (name, name_loc) = p.expect_identifier()?;
            let mut ident = ParseNode::new(NodeKind::Identifier, name_loc);
            ident.text = Some(name);
            let ident = p.alloc(ident);
            p.arena.append(&mut names, ident);
            if !p.eat_symbol(Symbol::Comma) {
                break;
            }
        }
        p.expect_symbol(Symbol::CloseBrace)?;
        p.expect_keyword(Keyword::From)?;
        node.parameters = names;

        if p.current().kind != TokenKind::StringLiteral {
            return Err(p.err(ParseErrorKind::MalformedImportPath));
        }
        let path = p.advance();
        node.text = Some(path.text.into_owned());
    } else {
        if p.current().kind != TokenKind::StringLiteral {
            return Err(p.err(ParseErrorKind::MalformedImportPath));
        }
        let path = p.advance();
        node.text = Some(path.text.into_owned());

        p.expect_keyword(Keyword::As)?;
        let (alias, alias_loc) = p.expect_identifier()?;
        let mut ident = ParseNode::new(NodeKind::Identifier, alias_loc);
        ident.text = Some(alias);
        node.identifier = Some(p.alloc(ident));
    }

    p.expect_symbol(Symbol::Semicolon)?;
    node.loc = p.close_loc(&start);
    Ok(p.alloc(node))
}

/// `export <declaration>`
fn parse_export(p: &mut Parser) -> Result<NodeId, ParseError> {
    let start = p.loc();
    p.expect_keyword(Keyword::Export)?;

    let inner = if p.at_keyword(Keyword::Type) {
        parse_type_alias(p)?
    } else if p.at_keyword(Keyword::Enum) {
        parse_enum(p)?
    } else if p.at_keyword(Keyword::Class) {
        parse_class(p)?
    } else if p.at_keyword(Keyword::Function) {
        parse_function(p)?
    } else if p.at_keyword(Keyword::Let) || p.at_keyword(Keyword::Const) {
        parse_variable_decl(p)?
    } else {
        return Err(p.err(ParseErrorKind::UnexpectedToken(
            p.current().text.to_string(),
        )));
    };

    let mut node = ParseNode::new(NodeKind::Export, start);
    node.body = Some(inner);
    node.loc = p.close_loc(&start);
    Ok(p.alloc(node))
}

/// `type Name = <type>;`
fn parse_type_alias(p: &mut Parser) -> Result<NodeId, ParseError> {
    let start = p.loc();
    p.expect_keyword(Keyword::Type)?;
    let (name, name_loc) = p.expect_identifier()?;
    p.ctx.type_names.insert(name.clone());

    p.expect_symbol(Symbol::Assign)?;
    let target = parse_type(p)?;
    p.expect_symbol(Symbol::Semicolon)?;

    let mut ident = ParseNode::new(NodeKind::Identifier, name_loc);
    ident.text = Some(name);
    let ident = p.alloc(ident);

    let mut node = ParseNode::new(NodeKind::TypeDecl, start);
    node.identifier = Some(ident);
    node.data_type = Some(target);
    node.loc = p.close_loc(&start);
    Ok(p.alloc(node))
}

/// `enum Name { A, B = 2, C }`
fn parse_enum(p: &mut Parser) -> Result<NodeId, ParseError> {
    let start = p.loc();
    p.expect_keyword(Keyword::Enum)?;
    let (name, name_loc) = p.expect_identifier()?;
    p.ctx.type_names.insert(name.clone());
    p.expect_symbol(Symbol::OpenBrace)?;

    let mut enumerators = None;
    while !p.at_symbol(Symbol::CloseBrace) && !p.at_eof() {
        let e_start = p.loc();
        let (e_name, e_loc) = p.expect_identifier()?;
        let mut ident = ParseNode::new(NodeKind::Identifier, e_loc);
        ident.text = Some(e_name);
        let ident = p.alloc(ident);

        let mut e_node = ParseNode::new(NodeKind::Enumerator, e_start);
        e_node.identifier = Some(ident);
        if p.eat_symbol(Symbol::Assign) {
            e_node.initializer = Some(parse_expression(p)?);
        }
        e_node.loc = p.close_loc(&e_start);
        let e_node = p.alloc(e_node);
        p.arena.append(&mut enumerators, e_node);

        if !p.eat_symbol(Symbol::Comma) {
            break;
        }
    }
    p.expect_symbol(Symbol::CloseBrace)?;

    let mut ident = ParseNode::new(NodeKind::Identifier, name_loc);
    ident.text = Some(name);
    let ident = p.alloc(ident);

    let mut node = ParseNode::new(NodeKind::EnumDecl, start);
    node.identifier = Some(ident);
    node.body = enumerators;
    node.loc = p.close_loc(&start);
    Ok(p.alloc(node))
}

/// `class Name<T> extends Base1, Base2 { <members> }`
fn parse_class(p: &mut Parser) -> Result<NodeId, ParseError> {
    let start = p.loc();
    p.expect_keyword(Keyword::Class)?;
    let (name, name_loc) = p.expect_identifier()?;
    p.ctx.type_names.insert(name.clone());

    let mut node = ParseNode::new(NodeKind::ClassDecl, start);
    node.template_params = parse_template_params(p)?;

    if p.eat_keyword(Keyword::Extends) {
        let mut bases = None;
        loop {
            let base = parse_type(p)?;
            p.arena.append(&mut bases, base);
            if !p.eat_symbol(Symbol::Comma) {
                break;
            }
        }
        node.modifier = bases;
    }

    p.expect_symbol(Symbol::OpenBrace)?;
    let mut members = None;
    while !p.at_symbol(Symbol::CloseBrace) && !p.at_eof() {
        match parse_class_member(p) {
            Ok(member) => {
                p.arena.append(&mut members, member);
            }
            Err(err) => {
                p.report(&err);
                p.recover();
            }
        }
    }
    p.expect_symbol(Symbol::CloseBrace)?;

    let mut ident = ParseNode::new(NodeKind::Identifier, name_loc);
    ident.text = Some(name);
    node.identifier = Some(p.alloc(ident));
    node.body = members;
    node.loc = p.close_loc(&start);
    Ok(p.alloc(node))
}

fn parse_class_member(p: &mut Parser) -> Result<NodeId, ParseError> {
    let start = p.loc();
    let mut flags = NodeFlags::default();

    loop {
        if p.eat_keyword(Keyword::Private) {
            flags.is_private = true;
        } else if p.eat_keyword(Keyword::Public) {
            flags.is_private = false;
        } else if p.eat_keyword(Keyword::Static) {
            flags.is_static = true;
        } else {
            break;
        }
    }

    // Accessors. `get`/`set` followed by `(` is a plain method using the
    // keyword as its name.
    if p.at_keyword(Keyword::Get) || p.at_keyword(Keyword::Set) {
        let is_getter = p.at_keyword(Keyword::Get);
        p.backup();
        let keyword_text = p.advance().text.into_owned();
        if p.current().kind == TokenKind::Identifier {
            p.commit();
            flags.is_getter = is_getter;
            flags.is_setter = !is_getter;
            return parse_method(p, start, flags);
        }
        p.restore();
        p.advance();
        return parse_method_tail(p, start, flags, keyword_text);
    }

    // Operator methods
    if p.eat_keyword(Keyword::Operator) {
        flags.is_operator = true;
        let (op, text) = parse_operator_symbol(p)?;
        let node = parse_method_tail(p, start, flags, text)?;
        p.arena.get_mut(node).op = Some(op);
        return Ok(node);
    }

    let (name, _) = match p.current().kind {
        TokenKind::Identifier => p.expect_identifier()?,
        _ => {
            return Err(p.err(ParseErrorKind::ExpectedIdentifier));
        }
    };

    if p.at_symbol(Symbol::OpenParen) {
        // Method (constructor/destructor by name)
        return parse_method_tail(p, start, flags, name);
    }

    // Property: `name: Type;`
    p.expect_symbol(Symbol::Colon)?;
    let ty = parse_type(p)?;
    p.expect_symbol(Symbol::Semicolon)?;

    let mut ident = ParseNode::new(NodeKind::Identifier, start);
    ident.text = Some(name);
    let ident = p.alloc(ident);

    let mut node = ParseNode::new(NodeKind::ClassProperty, start);
    node.flags = flags;
    node.identifier = Some(ident);
    node.data_type = Some(ty);
    node.loc = p.close_loc(&start);
    Ok(p.alloc(node))
}

fn parse_operator_symbol(p: &mut Parser) -> Result<(OperatorKind, String), ParseError> {
    // `operator []` spans two tokens
    if p.eat_symbol(Symbol::OpenBracket) {
        p.expect_symbol(Symbol::CloseBracket)?;
        return Ok((OperatorKind::Index, "operator []".to_string()));
    }

    let op = match &p.current().kind {
        TokenKind::Symbol(Symbol::Plus) => OperatorKind::Add,
        TokenKind::Symbol(Symbol::Minus) => OperatorKind::Sub,
        TokenKind::Symbol(Symbol::Star) => OperatorKind::Mul,
        TokenKind::Symbol(Symbol::Slash) => OperatorKind::Div,
        TokenKind::Symbol(Symbol::Percent) => OperatorKind::Mod,
        TokenKind::Symbol(Symbol::Amp) => OperatorKind::BitAnd,
        TokenKind::Symbol(Symbol::Pipe) => OperatorKind::BitOr,
        TokenKind::Symbol(Symbol::Caret) => OperatorKind::BitXor,
        TokenKind::Symbol(Symbol::Shl) => OperatorKind::Shl,
        TokenKind::Symbol(Symbol::Shr) => OperatorKind::Shr,
        TokenKind::Symbol(Symbol::EqEq) => OperatorKind::Eq,
        TokenKind::Symbol(Symbol::NotEq) => OperatorKind::NotEq,
        TokenKind::Symbol(Symbol::Less) => OperatorKind::Less,
        TokenKind::Symbol(Symbol::LessEq) => OperatorKind::LessEq,
        TokenKind::Symbol(Symbol::Greater) => OperatorKind::Greater,
        TokenKind::Symbol(Symbol::GreaterEq) => OperatorKind::GreaterEq,
        TokenKind::Symbol(Symbol::Assign) => OperatorKind::Assign,
        _ => {
            return Err(p.err(ParseErrorKind::ExpectedOperator("operator symbol")));
        }
    };
    let text = format!("operator {}", op.symbol());
    p.advance();
    Ok((op, text))
}

fn parse_method(
    p: &mut Parser,
    start: crate::source::SourceLocation,
    flags: NodeFlags,
) -> Result<NodeId, ParseError> {
    let (name, _) = p.expect_identifier()?;
    parse_method_tail(p, start, flags, name)
}

fn parse_method_tail(
    p: &mut Parser,
    start: crate::source::SourceLocation,
    flags: NodeFlags,
    name: String,
) -> Result<NodeId, ParseError> {
    let mut ident = ParseNode::new(NodeKind::Identifier, start);
    ident.text = Some(name);
    let ident = p.alloc(ident);

    let params = parse_parameter_list(p)?;
    let ret = if p.eat_symbol(Symbol::Colon) {
        Some(parse_type(p)?)
    } else {
        None
    };
    let body = parse_block(p)?;

    let mut node = ParseNode::new(NodeKind::FunctionDecl, start);
    node.flags = flags;
    node.identifier = Some(ident);
    node.parameters = params;
    node.data_type = ret;
    node.body = Some(body);
    node.loc = p.close_loc(&start);
    Ok(p.alloc(node))
}

/// `function name<T>(a: A, b: B): R { ... }`
fn parse_function(p: &mut Parser) -> Result<NodeId, ParseError> {
    let start = p.loc();
    p.expect_keyword(Keyword::Function)?;
    let (name, name_loc) = p.expect_identifier()?;

    let template_params = parse_template_params(p)?;
    let params = parse_parameter_list(p)?;
    let ret = if p.eat_symbol(Symbol::Colon) {
        Some(parse_type(p)?)
    } else {
        None
    };
    let body = parse_block(p)?;

    let mut ident = ParseNode::new(NodeKind::Identifier, name_loc);
    ident.text = Some(name);
    let ident = p.alloc(ident);

    let mut node = ParseNode::new(NodeKind::FunctionDecl, start);
    node.identifier = Some(ident);
    node.template_params = template_params;
    node.parameters = params;
    node.data_type = ret;
    node.body = Some(body);
    node.loc = p.close_loc(&start);
    Ok(p.alloc(node))
}

/// `<T, U>`: a list of identifier nodes, or `None` when absent.
fn parse_template_params(p: &mut Parser) -> Result<Option<NodeId>, ParseError> {
    if !p.eat_symbol(Symbol::Less) {
        return Ok(None);
    }
    let mut params = None;
    loop {
        let (name, loc) = p.expect_identifier()?;
        p.ctx.type_names.insert(name.clone());
        let mut ident = ParseNode::new(NodeKind::Identifier, loc);
        ident.text = Some(name);
        let ident = p.alloc(ident);
        p.arena.append(&mut params, ident);
        if !p.eat_symbol(Symbol::Comma) {
            break;
        }
    }
    p.expect_symbol(Symbol::Greater)?;
    Ok(params)
}

/// `(a: A, b: B)`: Parameter nodes.
fn parse_parameter_list(p: &mut Parser) -> Result<Option<NodeId>, ParseError> {
    p.expect_symbol(Symbol::OpenParen)?;
    let mut params = None;
    if !p.at_symbol(Symbol::CloseParen) {
        loop {
            let start = p.loc();
            let (name, name_loc) = p.expect_identifier()?;
            p.expect_symbol(Symbol::Colon)?;
            let ty = parse_type(p)?;

            let mut ident = ParseNode::new(NodeKind::Identifier, name_loc);
            ident.text = Some(name);
            let ident = p.alloc(ident);

            let mut param = ParseNode::new(NodeKind::Parameter, start);
            param.identifier = Some(ident);
            param.data_type = Some(ty);
            param.loc = p.close_loc(&start);
            let param = p.alloc(param);
            p.arena.append(&mut params, param);

            if !p.eat_symbol(Symbol::Comma) {
                break;
            }
        }
    }
    p.expect_symbol(Symbol::CloseParen)?;
    Ok(params)
}
