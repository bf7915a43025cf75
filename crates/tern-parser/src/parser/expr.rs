//! Expression parsing.
//!
//! Precedence and associativity follow a fixed table: assignment and `?:` are
//! right-associative; every binary level below them is left-associative, in
//! the order `||`, `&&`, `|`, `^`, `&`, equality, relational, shift, additive,
//! multiplicative; unary prefix binds tighter, postfix tightest.
//!
//! Unary operators store their operand in the `lvalue` slot.

use super::types::parse_type;
use super::{ParseError, ParseErrorKind, Parser};
use crate::ast::{Literal, NodeId, NodeKind, OperatorKind, ParseNode};
use crate::token::{IntSuffix, Keyword, Symbol, TokenKind};

pub(crate) fn parse_expression(p: &mut Parser) -> Result<NodeId, ParseError> {
    parse_assignment(p)
}

fn assign_op(p: &Parser) -> Option<OperatorKind> {
    match &p.current().kind {
        TokenKind::Symbol(Symbol::Assign) => Some(OperatorKind::Assign),
        TokenKind::Symbol(Symbol::PlusAssign) => Some(OperatorKind::AddAssign),
        TokenKind::Symbol(Symbol::MinusAssign) => Some(OperatorKind::SubAssign),
        TokenKind::Symbol(Symbol::StarAssign) => Some(OperatorKind::MulAssign),
        TokenKind::Symbol(Symbol::SlashAssign) => Some(OperatorKind::DivAssign),
        TokenKind::Symbol(Symbol::PercentAssign) => Some(OperatorKind::ModAssign),
        TokenKind::Symbol(Symbol::AmpAssign) => Some(OperatorKind::BitAndAssign),
        TokenKind::Symbol(Symbol::PipeAssign) => Some(OperatorKind::BitOrAssign),
        TokenKind::Symbol(Symbol::CaretAssign) => Some(OperatorKind::BitXorAssign),
        TokenKind::Symbol(Symbol::ShlAssign) => Some(OperatorKind::ShlAssign),
        TokenKind::Symbol(Symbol::ShrAssign) => Some(OperatorKind::ShrAssign),
        _ => None,
    }
}

fn is_assignable(p: &Parser, id: NodeId) -> bool {
    let node = p.arena.get(id);
    match node.kind {
        NodeKind::Identifier => true,
        NodeKind::Expression => matches!(
            node.op,
            Some(OperatorKind::Member) | Some(OperatorKind::Index)
        ),
        _ => false,
    }
}

fn parse_assignment(p: &mut Parser) -> Result<NodeId, ParseError> {
    let start = p.loc();
    let left = parse_conditional(p)?;

    if let Some(op) = assign_op(p) {
        if !is_assignable(p, left) {
            return Err(ParseError::new(ParseErrorKind::ExpectedAssignable, start));
        }
        p.advance();
        let right = parse_assignment(p)?;
        let mut node = ParseNode::new(NodeKind::Expression, start);
        node.op = Some(op);
        node.lvalue = Some(left);
        node.rvalue = Some(right);
        node.loc = p.close_loc(&start);
        return Ok(p.alloc(node));
    }

    Ok(left)
}

fn parse_conditional(p: &mut Parser) -> Result<NodeId, ParseError> {
    let start = p.loc();
    let cond = parse_logical_or(p)?;

    if p.eat_symbol(Symbol::Question) {
        let then_val = parse_expression(p)?;
        p.expect_symbol(Symbol::Colon)?;
        let else_val = parse_assignment(p)?;
        let mut node = ParseNode::new(NodeKind::Expression, start);
        node.op = Some(OperatorKind::Conditional);
        node.condition = Some(cond);
        node.lvalue = Some(then_val);
        node.rvalue = Some(else_val);
        node.loc = p.close_loc(&start);
        return Ok(p.alloc(node));
    }

    Ok(cond)
}

/// One left-associative binary level.
fn parse_binary<F>(
    p: &mut Parser,
    table: &[(Symbol, OperatorKind)],
    mut next: F,
) -> Result<NodeId, ParseError>
where
    F: FnMut(&mut Parser) -> Result<NodeId, ParseError>,
{
    let start = p.loc();
    let mut left = next(p)?;

    'outer: loop {
        for (sym, op) in table {
            if p.at_symbol(*sym) {
                p.advance();
                let right = next(p)?;
                let mut node = ParseNode::new(NodeKind::Expression, start);
                node.op = Some(*op);
                node.lvalue = Some(left);
                node.rvalue = Some(right);
                node.loc = p.close_loc(&start);
                left = p.alloc(node);
                continue 'outer;
            }
        }
        break;
    }

    Ok(left)
}

fn parse_logical_or(p: &mut Parser) -> Result<NodeId, ParseError> {
    parse_binary(p, &[(Symbol::PipePipe, OperatorKind::LogicalOr)], parse_logical_and)
}

fn parse_logical_and(p: &mut Parser) -> Result<NodeId, ParseError> {
    parse_binary(p, &[(Symbol::AmpAmp, OperatorKind::LogicalAnd)], parse_bit_or)
}

fn parse_bit_or(p: &mut Parser) -> Result<NodeId, ParseError> {
    parse_binary(p, &[(Symbol::Pipe, OperatorKind::BitOr)], parse_bit_xor)
}

fn parse_bit_xor(p: &mut Parser) -> Result<NodeId, ParseError> {
    parse_binary(p, &[(Symbol::Caret, OperatorKind::BitXor)], parse_bit_and)
}

fn parse_bit_and(p: &mut Parser) -> Result<NodeId, ParseError> {
    parse_binary(p, &[(Symbol::Amp, OperatorKind::BitAnd)], parse_equality)
}

fn parse_equality(p: &mut Parser) -> Result<NodeId, ParseError> {
    parse_binary(
        p,
        &[
            (Symbol::EqEq, OperatorKind::Eq),
            (Symbol::NotEq, OperatorKind::NotEq),
        ],
        parse_relational,
    )
}

fn parse_relational(p: &mut Parser) -> Result<NodeId, ParseError> {
    parse_binary(
        p,
        &[
            (Symbol::LessEq, OperatorKind::LessEq),
            (Symbol::GreaterEq, OperatorKind::GreaterEq),
            (Symbol::Less, OperatorKind::Less),
            (Symbol::Greater, OperatorKind::Greater),
        ],
        parse_shift,
    )
}

fn parse_shift(p: &mut Parser) -> Result<NodeId, ParseError> {
    parse_binary(
        p,
        &[
            (Symbol::Shl, OperatorKind::Shl),
            (Symbol::Shr, OperatorKind::Shr),
        ],
        parse_additive,
    )
}

fn parse_additive(p: &mut Parser) -> Result<NodeId, ParseError> {
    parse_binary(
        p,
        &[
            (Symbol::Plus, OperatorKind::Add),
            (Symbol::Minus, OperatorKind::Sub),
        ],
        parse_multiplicative,
    )
}

fn parse_multiplicative(p: &mut Parser) -> Result<NodeId, ParseError> {
    parse_binary(
        p,
        &[
            (Symbol::Star, OperatorKind::Mul),
            (Symbol::Slash, OperatorKind::Div),
            (Symbol::Percent, OperatorKind::Mod),
        ],
        parse_unary,
    )
}

fn parse_unary(p: &mut Parser) -> Result<NodeId, ParseError> {
    let start = p.loc();
    let op = match &p.current().kind {
        TokenKind::Symbol(Symbol::Bang) => Some(OperatorKind::Not),
        TokenKind::Symbol(Symbol::Tilde) => Some(OperatorKind::BitNot),
        TokenKind::Symbol(Symbol::Minus) => Some(OperatorKind::Negate),
        _ => None,
    };

    if let Some(op) = op {
        p.advance();
        let operand = parse_unary(p)?;
        let mut node = ParseNode::new(NodeKind::Expression, start);
        node.op = Some(op);
        node.lvalue = Some(operand);
        node.loc = p.close_loc(&start);
        return Ok(p.alloc(node));
    }

    parse_postfix(p)
}

fn parse_postfix(p: &mut Parser) -> Result<NodeId, ParseError> {
    let start = p.loc();
    let mut expr = parse_primary(p)?;

    loop {
        if p.at_symbol(Symbol::OpenParen) {
            p.advance();
            let args = parse_call_args(p)?;
            p.expect_symbol(Symbol::CloseParen)?;
            let mut node = ParseNode::new(NodeKind::Expression, start);
            node.op = Some(OperatorKind::Call);
            node.callee = Some(expr);
            node.arguments = args;
            node.loc = p.close_loc(&start);
            expr = p.alloc(node);
        } else if p.at_symbol(Symbol::OpenBracket) {
            p.advance();
            let index = parse_expression(p)?;
            p.expect_symbol(Symbol::CloseBracket)?;
            let mut node = ParseNode::new(NodeKind::Expression, start);
            node.op = Some(OperatorKind::Index);
            node.lvalue = Some(expr);
            node.rvalue = Some(index);
            node.loc = p.close_loc(&start);
            expr = p.alloc(node);
        } else if p.at_symbol(Symbol::Dot) {
            p.advance();
            let (name, name_loc) = p.expect_identifier()?;
            let mut ident = ParseNode::new(NodeKind::Identifier, name_loc);
            ident.text = Some(name);
            let ident = p.alloc(ident);
            let mut node = ParseNode::new(NodeKind::Expression, start);
            node.op = Some(OperatorKind::Member);
            node.lvalue = Some(expr);
            node.identifier = Some(ident);
            node.loc = p.close_loc(&start);
            expr = p.alloc(node);
        } else if p.at_keyword(Keyword::As) {
            p.advance();
            let ty = parse_type(p)?;
            let mut node = ParseNode::new(NodeKind::Expression, start);
            node.op = Some(OperatorKind::Cast);
            node.lvalue = Some(expr);
            node.data_type = Some(ty);
            node.loc = p.close_loc(&start);
            expr = p.alloc(node);
        } else {
            break;
        }
    }

    Ok(expr)
}

pub(crate) fn parse_call_args(p: &mut Parser) -> Result<Option<NodeId>, ParseError> {
    let mut args = None;
    if !p.at_symbol(Symbol::CloseParen) {
        loop {
            let arg = parse_expression(p)?;
            p.arena.append(&mut args, arg);
            if !p.eat_symbol(Symbol::Comma) {
                break;
            }
        }
    }
    Ok(args)
}

fn parse_primary(p: &mut Parser) -> Result<NodeId, ParseError> {
    let start = p.loc();

    match p.current().kind.clone() {
        TokenKind::IntLiteral { value, suffix } => {
            p.advance();
            let lit = match suffix {
                IntSuffix::U8 | IntSuffix::U16 | IntSuffix::U32 | IntSuffix::U64 => {
                    Literal::Unsigned(value, suffix)
                }
                _ => Literal::Signed(value as i64, suffix),
            };
            let mut node = ParseNode::new(NodeKind::Literal, start);
            node.value = Some(lit);
            Ok(p.alloc(node))
        }
        TokenKind::FloatLiteral { value, is_f32 } => {
            p.advance();
            let mut node = ParseNode::new(NodeKind::Literal, start);
            node.value = Some(if is_f32 {
                Literal::F32(value as f32)
            } else {
                Literal::F64(value)
            });
            Ok(p.alloc(node))
        }
        TokenKind::StringLiteral | TokenKind::TemplateLiteral => {
            let tok = p.advance();
            let mut node = ParseNode::new(NodeKind::Literal, start);
            node.value = Some(Literal::Str(tok.text.into_owned()));
            Ok(p.alloc(node))
        }
        TokenKind::Keyword(Keyword::True) => {
            p.advance();
            let mut node = ParseNode::new(NodeKind::Literal, start);
            node.value = Some(Literal::Bool(true));
            Ok(p.alloc(node))
        }
        TokenKind::Keyword(Keyword::False) => {
            p.advance();
            let mut node = ParseNode::new(NodeKind::Literal, start);
            node.value = Some(Literal::Bool(false));
            Ok(p.alloc(node))
        }
        TokenKind::Keyword(Keyword::Null) => {
            p.advance();
            let mut node = ParseNode::new(NodeKind::Literal, start);
            node.value = Some(Literal::Null);
            Ok(p.alloc(node))
        }
        TokenKind::Keyword(Keyword::This) => {
            p.advance();
            Ok(p.alloc(ParseNode::new(NodeKind::This, start)))
        }
        TokenKind::Keyword(Keyword::Sizeof) => {
            p.advance();
            p.expect_symbol(Symbol::OpenParen)?;
            let ty = parse_type(p)?;
            p.expect_symbol(Symbol::CloseParen)?;
            let mut node = ParseNode::new(NodeKind::Sizeof, start);
            node.data_type = Some(ty);
            node.loc = p.close_loc(&start);
            Ok(p.alloc(node))
        }
        TokenKind::Keyword(Keyword::New) => {
            p.advance();
            let ty = parse_type(p)?;
            let mut args = None;
            if p.eat_symbol(Symbol::OpenParen) {
                args = parse_call_args(p)?;
                p.expect_symbol(Symbol::CloseParen)?;
            }
            let mut node = ParseNode::new(NodeKind::Expression, start);
            node.op = Some(OperatorKind::New);
            node.data_type = Some(ty);
            node.arguments = args;
            node.loc = p.close_loc(&start);
            Ok(p.alloc(node))
        }
        TokenKind::Identifier => {
            let (name, _) = p.expect_identifier()?;
            let mut node = ParseNode::new(NodeKind::Identifier, start);
            node.text = Some(name);
            Ok(p.alloc(node))
        }
        TokenKind::Symbol(Symbol::OpenParen) => {
            p.advance();
            let inner = parse_expression(p)?;
            p.expect_symbol(Symbol::CloseParen)?;
            Ok(inner)
        }
        TokenKind::Symbol(Symbol::OpenBracket) => {
            p.advance();
            let mut elements = None;
            if !p.at_symbol(Symbol::CloseBracket) {
                loop {
                    let elem = parse_expression(p)?;
                    p.arena.append(&mut elements, elem);
                    if !p.eat_symbol(Symbol::Comma) {
                        break;
                    }
                }
            }
            p.expect_symbol(Symbol::CloseBracket)?;
            let mut node = ParseNode::new(NodeKind::ArrayLiteral, start);
            node.arguments = elements;
            node.loc = p.close_loc(&start);
            Ok(p.alloc(node))
        }
        TokenKind::Unknown => {
            let tok = p.advance();
            Err(ParseError::new(
                ParseErrorKind::UnexpectedToken(tok.text.into_owned()),
                start,
            ))
        }
        _ => Err(p.err(ParseErrorKind::ExpectedExpression)),
    }
}
