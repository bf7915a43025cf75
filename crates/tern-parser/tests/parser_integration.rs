//! Front-end integration tests: token round-tripping, AST shape, and source
//! location coherence over whole programs.

use tern_parser::ast::NodeKind;
use tern_parser::{parse_module, Lexer, Logger, ModuleSource, ParseContext, TokenKind};

const PROGRAM: &str = r#"
import { print } from 'io';

enum Color { Red, Green = 2, Blue }

class Vec2 {
    x: f32;
    y: f32;

    constructor(x: f32, y: f32) {
        this.x = x;
        this.y = y;
    }

    operator +(rhs: Vec2): Vec2 {
        return new Vec2(this.x + rhs.x, this.y + rhs.y);
    }

    get length2(): f32 {
        return this.x * this.x + this.y * this.y;
    }
}

function add(a: i32, b: i32): i32 {
    // straight-line body
    return a + b;
}

export function main(): i32 {
    let total: i32 = 0;
    for (let i = 0; i < 10; i = i + 1) {
        if (i % 2 == 0) {
            total = total + add(i, 1);
        } else {
            total = total - 1;
        }
    }
    return total;
}
"#;

/// Re-tokenizing the concatenation of all token texts with original
/// whitespace yields the identical token stream.
#[test]
fn token_round_trip() {
    let src = ModuleSource::new("program.tn", PROGRAM);
    let first = Lexer::new(&src).tokenize();
    assert!(first.errors.is_empty());

    // Rebuild the source from token spans plus the whitespace between them.
    let mut rebuilt = String::new();
    let mut cursor = 0usize;
    for tok in &first.tokens {
        if tok.kind == TokenKind::Eof {
            break;
        }
        let begin = tok.loc.offset as usize;
        let end = tok.loc.end_offset() as usize;
        rebuilt.push_str(&PROGRAM[cursor..begin]);
        rebuilt.push_str(&PROGRAM[begin..end]);
        cursor = end;
    }
    rebuilt.push_str(&PROGRAM[cursor..]);
    assert_eq!(rebuilt, PROGRAM);

    let src2 = ModuleSource::new("program.tn", rebuilt.clone());
    let second = Lexer::new(&src2).tokenize();
    assert_eq!(first.tokens.len(), second.tokens.len());
    for (a, b) in first.tokens.iter().zip(second.tokens.iter()) {
        assert_eq!(a.kind, b.kind);
        assert_eq!(a.text, b.text);
        assert_eq!(a.loc, b.loc);
    }
}

/// Every node's start offset precedes its end offset and both map into the
/// module source.
#[test]
fn ast_locations_are_coherent() {
    let src = ModuleSource::new("program.tn", PROGRAM);
    let mut log = Logger::new();
    let out = parse_module(&src, ParseContext::new(), &mut log);
    assert!(!log.has_errors(), "diagnostics: {:?}", log.messages());

    let mut seen = 0;
    for (_, node) in out.arena.nodes() {
        let loc = node.loc;
        assert!(loc.offset() <= loc.end_location().offset());
        assert!(loc.end_offset() as usize <= src.len());
        seen += 1;
    }
    assert!(seen > 50, "expected a substantial tree, got {seen} nodes");
}

#[test]
fn parses_all_declaration_kinds() {
    let src = ModuleSource::new("program.tn", PROGRAM);
    let mut log = Logger::new();
    let out = parse_module(&src, ParseContext::new(), &mut log);
    assert!(!log.has_errors());

    let root = out.arena.get(out.root);
    let kinds: Vec<NodeKind> = out
        .arena
        .iter_list(root.body)
        .map(|(_, n)| n.kind)
        .collect();
    assert!(kinds.contains(&NodeKind::Import));
    assert!(kinds.contains(&NodeKind::EnumDecl));
    assert!(kinds.contains(&NodeKind::ClassDecl));
    assert!(kinds.contains(&NodeKind::FunctionDecl));
    assert!(kinds.contains(&NodeKind::Export));
}

#[test]
fn class_members_have_expected_shape() {
    let src = ModuleSource::new("program.tn", PROGRAM);
    let mut log = Logger::new();
    let out = parse_module(&src, ParseContext::new(), &mut log);

    let root = out.arena.get(out.root);
    let class = out
        .arena
        .iter_list(root.body)
        .find(|(_, n)| n.kind == NodeKind::ClassDecl)
        .map(|(id, _)| id)
        .expect("class decl");

    let class = out.arena.get(class);
    let mut props = 0;
    let mut methods = 0;
    let mut getters = 0;
    let mut operators = 0;
    for (_, member) in out.arena.iter_list(class.body) {
        match member.kind {
            NodeKind::ClassProperty => props += 1,
            NodeKind::FunctionDecl => {
                methods += 1;
                if member.flags.is_getter {
                    getters += 1;
                }
                if member.flags.is_operator {
                    operators += 1;
                }
            }
            other => panic!("unexpected member kind {:?}", other),
        }
    }
    assert_eq!(props, 2);
    assert_eq!(methods, 3);
    assert_eq!(getters, 1);
    assert_eq!(operators, 1);
}
