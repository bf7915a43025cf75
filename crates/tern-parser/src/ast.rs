//! AST data model.
//!
//! Nodes live in a [`NodeArena`] and reference each other by [`NodeId`].
//! Children occupy typed slots; homogeneous sequences (statement lists,
//! argument lists, parameter lists, enumerators) are intrusive singly-linked
//! lists through the `next` slot.

use crate::source::SourceLocation;
use crate::token::IntSuffix;

/// Index of a node within its owning [`NodeArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Node discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Root,
    /// `import a, b from 'path';`: imported names in `parameters`, path in
    /// the node's `text`.
    Import,
    /// `export <decl>;`: wrapped declaration in `body`.
    Export,
    /// `type Name = <type>;`: alias target in `data_type`.
    TypeDecl,
    /// Enumerators in `body`.
    EnumDecl,
    /// One enumerator; explicit value in `initializer`.
    Enumerator,
    /// Template params in `template_params`, bases in `modifier`, members in
    /// `body`.
    ClassDecl,
    /// Field: name + `data_type`. Accessors are `FunctionDecl` members
    /// flagged getter/setter.
    ClassProperty,
    FunctionDecl,
    Parameter,
    VariableDecl,
    /// A type reference: name + optional template args (`arguments`) or a
    /// function signature (`parameters` + `data_type` for the return).
    TypeIdentifier,
    Identifier,
    Literal,
    This,
    /// `sizeof(T)`: type in `data_type`.
    Sizeof,
    /// `[a, b, c]`: elements in `arguments`.
    ArrayLiteral,
    Expression,
    Block,
    If,
    For,
    While,
    DoWhile,
    Return,
    Break,
    Continue,
    Delete,
    Switch,
    SwitchCase,
    /// Lone `;`
    Empty,
}

/// Operator discriminator for `NodeKind::Expression` nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorKind {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    LogicalAnd,
    LogicalOr,
    Eq,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    Not,
    BitNot,
    Negate,
    Assign,
    AddAssign,
    SubAssign,
    MulAssign,
    DivAssign,
    ModAssign,
    BitAndAssign,
    BitOrAssign,
    BitXorAssign,
    ShlAssign,
    ShrAssign,
    /// `cond ? a : b`: condition + lvalue/rvalue.
    Conditional,
    /// callee + arguments list.
    Call,
    /// lvalue + rvalue (the index expression).
    Index,
    /// lvalue + identifier.
    Member,
    /// data_type + arguments list.
    New,
    /// lvalue + data_type (`expr as T`).
    Cast,
}

impl OperatorKind {
    /// The non-assigning operator a compound assignment decomposes to.
    pub fn base_of_compound(&self) -> Option<OperatorKind> {
        Some(match self {
            OperatorKind::AddAssign => OperatorKind::Add,
            OperatorKind::SubAssign => OperatorKind::Sub,
            OperatorKind::MulAssign => OperatorKind::Mul,
            OperatorKind::DivAssign => OperatorKind::Div,
            OperatorKind::ModAssign => OperatorKind::Mod,
            OperatorKind::BitAndAssign => OperatorKind::BitAnd,
            OperatorKind::BitOrAssign => OperatorKind::BitOr,
            OperatorKind::BitXorAssign => OperatorKind::BitXor,
            OperatorKind::ShlAssign => OperatorKind::Shl,
            OperatorKind::ShrAssign => OperatorKind::Shr,
            _ => return None,
        })
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            OperatorKind::Eq
                | OperatorKind::NotEq
                | OperatorKind::Less
                | OperatorKind::LessEq
                | OperatorKind::Greater
                | OperatorKind::GreaterEq
        )
    }

    /// Script-visible operator symbol, used to name `operator` methods.
    pub fn symbol(&self) -> &'static str {
        match self {
            OperatorKind::Add | OperatorKind::AddAssign => "+",
            OperatorKind::Sub | OperatorKind::SubAssign => "-",
            OperatorKind::Mul | OperatorKind::MulAssign => "*",
            OperatorKind::Div | OperatorKind::DivAssign => "/",
            OperatorKind::Mod | OperatorKind::ModAssign => "%",
            OperatorKind::BitAnd | OperatorKind::BitAndAssign => "&",
            OperatorKind::BitOr | OperatorKind::BitOrAssign => "|",
            OperatorKind::BitXor | OperatorKind::BitXorAssign => "^",
            OperatorKind::Shl | OperatorKind::ShlAssign => "<<",
            OperatorKind::Shr | OperatorKind::ShrAssign => ">>",
            OperatorKind::LogicalAnd => "&&",
            OperatorKind::LogicalOr => "||",
            OperatorKind::Eq => "==",
            OperatorKind::NotEq => "!=",
            OperatorKind::Less => "<",
            OperatorKind::LessEq => "<=",
            OperatorKind::Greater => ">",
            OperatorKind::GreaterEq => ">=",
            OperatorKind::Not => "!",
            OperatorKind::BitNot => "~",
            OperatorKind::Negate => "-",
            OperatorKind::Assign => "=",
            OperatorKind::Conditional => "?:",
            OperatorKind::Call => "()",
            OperatorKind::Index => "[]",
            OperatorKind::Member => ".",
            OperatorKind::New => "new",
            OperatorKind::Cast => "as",
        }
    }
}

/// Literal payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Signed(i64, IntSuffix),
    Unsigned(u64, IntSuffix),
    F32(f32),
    F64(f64),
    Str(String),
    Bool(bool),
    Null,
}

/// Per-node modifier flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeFlags {
    pub is_const: bool,
    pub is_static: bool,
    pub is_private: bool,
    pub is_getter: bool,
    pub is_setter: bool,
    pub is_operator: bool,
}

/// One AST node. Unused slots stay `None`.
#[derive(Debug, Clone)]
pub struct ParseNode {
    pub kind: NodeKind,
    pub loc: SourceLocation,
    pub flags: NodeFlags,
    /// Operator discriminator for `Expression` nodes.
    pub op: Option<OperatorKind>,
    /// Identifier/import-path text.
    pub text: Option<String>,
    /// Literal payload for `Literal` nodes.
    pub value: Option<Literal>,

    pub data_type: Option<NodeId>,
    pub identifier: Option<NodeId>,
    pub initializer: Option<NodeId>,
    pub condition: Option<NodeId>,
    pub body: Option<NodeId>,
    pub else_body: Option<NodeId>,
    pub lvalue: Option<NodeId>,
    pub rvalue: Option<NodeId>,
    pub callee: Option<NodeId>,
    pub arguments: Option<NodeId>,
    pub parameters: Option<NodeId>,
    pub template_params: Option<NodeId>,
    pub modifier: Option<NodeId>,
    /// Sibling pointer for sequences.
    pub next: Option<NodeId>,
}

impl ParseNode {
    pub fn new(kind: NodeKind, loc: SourceLocation) -> Self {
        Self {
            kind,
            loc,
            flags: NodeFlags::default(),
            op: None,
            text: None,
            value: None,
            data_type: None,
            identifier: None,
            initializer: None,
            condition: None,
            body: None,
            else_body: None,
            lvalue: None,
            rvalue: None,
            callee: None,
            arguments: None,
            parameters: None,
            template_params: None,
            modifier: None,
            next: None,
        }
    }
}

/// Arena owning every node of one parse.
#[derive(Debug, Default, Clone)]
pub struct NodeArena {
    nodes: Vec<ParseNode>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, node: ParseNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn get(&self, id: NodeId) -> &ParseNode {
        &self.nodes[id.index()]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut ParseNode {
        &mut self.nodes[id.index()]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &ParseNode)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (NodeId(i as u32), n))
    }

    /// Iterate a `next`-linked list starting at `head`.
    pub fn iter_list(&self, head: Option<NodeId>) -> ListIter<'_> {
        ListIter { arena: self, cur: head }
    }

    /// Number of nodes in a `next`-linked list.
    pub fn list_len(&self, head: Option<NodeId>) -> usize {
        self.iter_list(head).count()
    }

    /// Append `node` to the list headed at `*head`, updating the head when the
    /// list is empty. Returns the id unchanged for chaining.
    pub fn append(&mut self, head: &mut Option<NodeId>, node: NodeId) -> NodeId {
        match *head {
            None => *head = Some(node),
            Some(first) => {
                let mut cur = first;
                while let Some(next) = self.get(cur).next {
                    cur = next;
                }
                self.get_mut(cur).next = Some(node);
            }
        }
        node
    }

    /// Deep-copy the subtree rooted at `id` (following child slots and `next`
    /// chains of children, but not `id`'s own `next`). Used by template
    /// instantiation.
    pub fn deep_copy(&mut self, id: NodeId) -> NodeId {
        let mut copy = self.get(id).clone();
        copy.next = None;
        copy.data_type = copy.data_type.map(|c| self.deep_copy_list(c));
        copy.identifier = copy.identifier.map(|c| self.deep_copy_list(c));
        copy.initializer = copy.initializer.map(|c| self.deep_copy_list(c));
        copy.condition = copy.condition.map(|c| self.deep_copy_list(c));
        copy.body = copy.body.map(|c| self.deep_copy_list(c));
        copy.else_body = copy.else_body.map(|c| self.deep_copy_list(c));
        copy.lvalue = copy.lvalue.map(|c| self.deep_copy_list(c));
        copy.rvalue = copy.rvalue.map(|c| self.deep_copy_list(c));
        copy.callee = copy.callee.map(|c| self.deep_copy_list(c));
        copy.arguments = copy.arguments.map(|c| self.deep_copy_list(c));
        copy.parameters = copy.parameters.map(|c| self.deep_copy_list(c));
        copy.template_params = copy.template_params.map(|c| self.deep_copy_list(c));
        copy.modifier = copy.modifier.map(|c| self.deep_copy_list(c));
        self.alloc(copy)
    }

    fn deep_copy_list(&mut self, head: NodeId) -> NodeId {
        let copy = self.deep_copy(head);
        if let Some(next) = self.get(head).next {
            let next_copy = self.deep_copy_list(next);
            self.get_mut(copy).next = Some(next_copy);
        }
        copy
    }
}

/// Iterator over a sibling list.
pub struct ListIter<'a> {
    arena: &'a NodeArena,
    cur: Option<NodeId>,
}

impl<'a> Iterator for ListIter<'a> {
    type Item = (NodeId, &'a ParseNode);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cur?;
        let node = self.arena.get(id);
        self.cur = node.next;
        Some((id, node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(arena: &mut NodeArena, kind: NodeKind) -> NodeId {
        arena.alloc(ParseNode::new(kind, SourceLocation::default()))
    }

    #[test]
    fn append_builds_sibling_list() {
        let mut arena = NodeArena::new();
        let mut head = None;
        let a = node(&mut arena, NodeKind::Identifier);
        let b = node(&mut arena, NodeKind::Identifier);
        let c = node(&mut arena, NodeKind::Identifier);
        arena.append(&mut head, a);
        arena.append(&mut head, b);
        arena.append(&mut head, c);

        let ids: Vec<NodeId> = arena.iter_list(head).map(|(id, _)| id).collect();
        assert_eq!(ids, vec![a, b, c]);
        assert_eq!(arena.list_len(head), 3);
    }

    #[test]
    fn deep_copy_detaches_subtree() {
        let mut arena = NodeArena::new();
        let leaf = node(&mut arena, NodeKind::Identifier);
        arena.get_mut(leaf).text = Some("x".into());
        let mut parent = ParseNode::new(NodeKind::Expression, SourceLocation::default());
        parent.lvalue = Some(leaf);
        let parent = arena.alloc(parent);

        let copy = arena.deep_copy(parent);
        assert_ne!(copy, parent);
        let copied_leaf = arena.get(copy).lvalue.unwrap();
        assert_ne!(copied_leaf, leaf);
        // Mutating the copy leaves the original intact
        arena.get_mut(copied_leaf).text = Some("y".into());
        assert_eq!(arena.get(leaf).text.as_deref(), Some("x"));
    }

    #[test]
    fn compound_assignment_bases() {
        assert_eq!(OperatorKind::AddAssign.base_of_compound(), Some(OperatorKind::Add));
        assert_eq!(OperatorKind::ShrAssign.base_of_compound(), Some(OperatorKind::Shr));
        assert_eq!(OperatorKind::Assign.base_of_compound(), None);
    }
}
