//! Typed program representation for the valid-mode engine.
//!
//! A program owns a small C-like AST together with the integer value it
//! must print when compiled and executed. Transformations clone the whole
//! program before rewriting, so every tree is uniquely owned and local
//! in-place edits on the clone can never alias the original.

use std::fmt;

/// The three types generated programs ever mention.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Type {
    Void,
    VoidPtr,
    Int,
}

impl Type {
    pub fn name(self) -> &'static str {
        match self {
            Type::Void => "void",
            Type::VoidPtr => "void *",
            Type::Int => "int",
        }
    }
}

/// Program-scoped node identifier. Site selection records the id of the
/// node it picked so a transformation can re-find it in the clone.
pub type NodeId = u64;

/// One AST node. `generation` is the program generation at which the node
/// was created and is what biases site selection toward recent rewrites.
#[derive(Clone, Debug)]
pub struct Expr {
    pub id: NodeId,
    pub generation: u32,
    pub kind: ExprKind,
}

/// Expressions and statements share one discriminated sum, as the printed
/// language makes no hard distinction either (GNU statement expressions).
#[derive(Clone, Debug)]
pub enum ExprKind {
    IntLiteral(i32),
    Variable(String),
    Cast(Type, Box<Expr>),
    PreOp {
        op: &'static str,
        arg: Box<Expr>,
    },
    BinOp {
        op: &'static str,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    TernOp {
        op1: &'static str,
        op2: &'static str,
        arg1: Box<Expr>,
        arg2: Box<Expr>,
        arg3: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    AsmConstraint {
        constraint: &'static str,
        expr: Box<Expr>,
    },
    AsmStmt {
        volatile_: bool,
        outputs: Vec<Expr>,
        inputs: Vec<Expr>,
    },
    DeclStmt {
        ty: Type,
        var: Box<Expr>,
        init: Box<Expr>,
    },
    ReturnStmt(Box<Expr>),
    ExprStmt(Box<Expr>),
    Block(Vec<Expr>),
    IfStmt {
        cond: Box<Expr>,
        then_stmt: Box<Expr>,
        else_stmt: Option<Box<Expr>>,
    },
    StmtExpr {
        block: Box<Expr>,
        last: Box<Expr>,
    },
    /// Transparent wrapper marking a dynamically dead subtree. Prints as
    /// its inner node; only the visitor can see it.
    Unreachable(Box<Expr>),
}

/// A top-level function. Only nullary helpers are ever generated, so
/// argument names are not modelled.
#[derive(Clone, Debug)]
pub struct Function {
    pub name: String,
    pub return_type: Type,
    pub arg_types: Vec<Type>,
    pub body: Expr,
}

/// Emits fresh names `id0, id1, ...`, unique within one program.
#[derive(Clone, Debug, Default)]
pub struct IdentAllocator {
    next: u32,
}

impl IdentAllocator {
    pub fn new_ident(&mut self) -> String {
        let name = format!("id{}", self.next);
        self.next += 1;
        name
    }
}

#[derive(Clone, Debug, Default)]
struct NodeIdAllocator {
    next: NodeId,
}

impl NodeIdAllocator {
    fn fresh(&mut self) -> NodeId {
        let id = self.next;
        self.next += 1;
        id
    }
}

/// A complete candidate program.
#[derive(Clone, Debug)]
pub struct Program {
    pub generation: u32,
    pub expected_value: i32,
    idents: IdentAllocator,
    node_ids: NodeIdAllocator,
    pub toplevel_decls: Vec<Expr>,
    pub toplevel_fns: Vec<Function>,
    pub toplevel_fn: Function,
    pub toplevel_call: Expr,
}

impl Program {
    /// A fresh program whose printed output is `expected_value` followed
    /// by a newline: `toplevel_fn` returns the value and `main` prints
    /// the call.
    pub fn new(expected_value: i32) -> Program {
        let mut p = Program {
            generation: 0,
            expected_value,
            idents: IdentAllocator::default(),
            node_ids: NodeIdAllocator::default(),
            toplevel_decls: Vec::new(),
            toplevel_fns: Vec::new(),
            toplevel_fn: Function {
                name: String::new(),
                return_type: Type::Int,
                arg_types: Vec::new(),
                body: Expr {
                    id: 0,
                    generation: 0,
                    kind: ExprKind::Block(Vec::new()),
                },
            },
            toplevel_call: Expr {
                id: 0,
                generation: 0,
                kind: ExprKind::Block(Vec::new()),
            },
        };

        let name = p.idents.new_ident();
        let value = p.node(ExprKind::IntLiteral(expected_value));
        let ret = p.node(ExprKind::ReturnStmt(Box::new(value)));
        let body = p.node(ExprKind::Block(vec![ret]));
        p.toplevel_fn = Function {
            name: name.clone(),
            return_type: Type::Int,
            arg_types: Vec::new(),
            body,
        };
        let callee = p.node(ExprKind::Variable(name));
        p.toplevel_call = p.node(ExprKind::Call {
            callee: Box::new(callee),
            args: Vec::new(),
        });
        p
    }

    /// Deep clone with a bumped generation. The clone prints
    /// byte-identically to the source; nodes created afterwards are
    /// stamped with the new generation.
    pub fn next_generation(&self) -> Program {
        let mut p = self.clone();
        p.generation += 1;
        p
    }

    /// Creates a node stamped with the current generation and a fresh id.
    pub fn node(&mut self, kind: ExprKind) -> Expr {
        Expr {
            id: self.node_ids.fresh(),
            generation: self.generation,
            kind,
        }
    }

    pub fn new_ident(&mut self) -> String {
        self.idents.new_ident()
    }

    /// Visits every node reachable from the top-level decls, the helper
    /// functions and `toplevel_fn` (but not the top-level call), with
    /// children in fixed operand order.
    pub fn visit<V: Visitor>(&self, v: &mut V) {
        let mut ctx = VisitCtx {
            fn_ref: None,
            unreachable_depth: 0,
        };
        for decl in &self.toplevel_decls {
            walk_expr(decl, &mut ctx, v);
        }
        for (i, f) in self.toplevel_fns.iter().enumerate() {
            v.visit_function(f);
            ctx.fn_ref = Some(FnRef::Helper(i));
            walk_expr(&f.body, &mut ctx, v);
        }
        v.visit_function(&self.toplevel_fn);
        ctx.fn_ref = Some(FnRef::Toplevel);
        walk_expr(&self.toplevel_fn.body, &mut ctx, v);
    }

    /// Finds a node by id anywhere in the visited roots.
    pub fn find_expr_mut(&mut self, id: NodeId) -> Option<&mut Expr> {
        for decl in &mut self.toplevel_decls {
            if let Some(e) = find_in(decl, id) {
                return Some(e);
            }
        }
        for f in &mut self.toplevel_fns {
            if let Some(e) = find_in(&mut f.body, id) {
                return Some(e);
            }
        }
        find_in(&mut self.toplevel_fn.body, id)
    }

    /// The statement list of a function body.
    pub fn fn_body_mut(&mut self, r: FnRef) -> &mut Vec<Expr> {
        let body = match r {
            FnRef::Toplevel => &mut self.toplevel_fn.body,
            FnRef::Helper(i) => &mut self.toplevel_fns[i].body,
        };
        match &mut body.kind {
            ExprKind::Block(stmts) => stmts,
            _ => panic!("function body is not a block"),
        }
    }

    /// The program's sole serialization: a compilable translation unit.
    pub fn source_text(&self) -> String {
        let mut out = String::new();
        out.push_str("extern \"C\" {\n");
        out.push_str("extern int printf (const char *__restrict __format, ...);\n");
        out.push_str("}\n");
        out.push('\n');

        for decl in &self.toplevel_decls {
            decl.write(&mut out, 0);
        }
        for f in &self.toplevel_fns {
            f.write(&mut out);
        }
        self.toplevel_fn.write(&mut out);

        out.push_str("int main(int argc, char *argv[])\n");
        out.push_str("{\n");
        out.push_str("  printf(\"%d\\n\", ");
        self.toplevel_call.write(&mut out, 0);
        out.push_str(");\n");
        out.push_str("}\n");
        out
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source_text())
    }
}

fn find_in(e: &mut Expr, id: NodeId) -> Option<&mut Expr> {
    if e.id == id {
        return Some(e);
    }
    match &mut e.kind {
        ExprKind::IntLiteral(_) | ExprKind::Variable(_) => None,
        ExprKind::Cast(_, inner)
        | ExprKind::PreOp { arg: inner, .. }
        | ExprKind::AsmConstraint { expr: inner, .. }
        | ExprKind::ReturnStmt(inner)
        | ExprKind::ExprStmt(inner)
        | ExprKind::Unreachable(inner) => find_in(inner, id),
        ExprKind::BinOp { lhs, rhs, .. } => {
            if let Some(e) = find_in(lhs, id) {
                return Some(e);
            }
            find_in(rhs, id)
        }
        ExprKind::TernOp {
            arg1, arg2, arg3, ..
        } => {
            if let Some(e) = find_in(arg1, id) {
                return Some(e);
            }
            if let Some(e) = find_in(arg2, id) {
                return Some(e);
            }
            find_in(arg3, id)
        }
        ExprKind::Call { callee, args } => {
            if let Some(e) = find_in(callee, id) {
                return Some(e);
            }
            find_in_list(args, id)
        }
        ExprKind::AsmStmt {
            outputs, inputs, ..
        } => {
            if let Some(e) = find_in_list(outputs, id) {
                return Some(e);
            }
            find_in_list(inputs, id)
        }
        ExprKind::DeclStmt { var, init, .. } => {
            if let Some(e) = find_in(var, id) {
                return Some(e);
            }
            find_in(init, id)
        }
        ExprKind::Block(stmts) => find_in_list(stmts, id),
        ExprKind::IfStmt {
            cond,
            then_stmt,
            else_stmt,
        } => {
            if let Some(e) = find_in(cond, id) {
                return Some(e);
            }
            if let Some(e) = find_in(then_stmt, id) {
                return Some(e);
            }
            else_stmt.as_mut().and_then(|e| find_in(e, id))
        }
        ExprKind::StmtExpr { block, last } => {
            if let Some(e) = find_in(block, id) {
                return Some(e);
            }
            find_in(last, id)
        }
    }
}

fn find_in_list(list: &mut [Expr], id: NodeId) -> Option<&mut Expr> {
    for e in list {
        if let Some(found) = find_in(e, id) {
            return Some(found);
        }
    }
    None
}

/// Which function body a node lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FnRef {
    Toplevel,
    Helper(usize),
}

/// Traversal context handed to visitor hooks.
#[derive(Clone, Copy, Debug)]
pub struct VisitCtx {
    fn_ref: Option<FnRef>,
    unreachable_depth: u32,
}

impl VisitCtx {
    /// `None` while visiting top-level declarations.
    pub fn enclosing_fn(&self) -> Option<FnRef> {
        self.fn_ref
    }

    /// True for every visit strictly inside an `Unreachable` wrapper.
    pub fn is_unreachable(&self) -> bool {
        self.unreachable_depth > 0
    }
}

pub trait Visitor {
    fn visit_expr(&mut self, _ctx: &VisitCtx, _expr: &Expr) {}
    fn visit_function(&mut self, _f: &Function) {}
}

fn walk_expr<V: Visitor>(e: &Expr, ctx: &mut VisitCtx, v: &mut V) {
    if let ExprKind::Unreachable(inner) = &e.kind {
        ctx.unreachable_depth += 1;
        v.visit_expr(ctx, e);
        walk_expr(inner, ctx, v);
        ctx.unreachable_depth -= 1;
        return;
    }

    v.visit_expr(ctx, e);
    match &e.kind {
        ExprKind::IntLiteral(_) | ExprKind::Variable(_) => {}
        ExprKind::Cast(_, inner)
        | ExprKind::PreOp { arg: inner, .. }
        | ExprKind::AsmConstraint { expr: inner, .. }
        | ExprKind::ReturnStmt(inner)
        | ExprKind::ExprStmt(inner) => walk_expr(inner, ctx, v),
        ExprKind::BinOp { lhs, rhs, .. } => {
            walk_expr(lhs, ctx, v);
            walk_expr(rhs, ctx, v);
        }
        ExprKind::TernOp {
            arg1, arg2, arg3, ..
        } => {
            walk_expr(arg1, ctx, v);
            walk_expr(arg2, ctx, v);
            walk_expr(arg3, ctx, v);
        }
        ExprKind::Call { callee, args } => {
            walk_expr(callee, ctx, v);
            for arg in args {
                walk_expr(arg, ctx, v);
            }
        }
        // asm operands are not mutation sites
        ExprKind::AsmStmt { .. } => {}
        ExprKind::DeclStmt { var, init, .. } => {
            walk_expr(var, ctx, v);
            walk_expr(init, ctx, v);
        }
        ExprKind::Block(stmts) => {
            for stmt in stmts {
                walk_expr(stmt, ctx, v);
            }
        }
        ExprKind::IfStmt {
            cond,
            then_stmt,
            else_stmt,
        } => {
            walk_expr(cond, ctx, v);
            walk_expr(then_stmt, ctx, v);
            if let Some(else_stmt) = else_stmt {
                walk_expr(else_stmt, ctx, v);
            }
        }
        ExprKind::StmtExpr { block, last } => {
            walk_expr(block, ctx, v);
            walk_expr(last, ctx, v);
        }
        ExprKind::Unreachable(_) => unreachable!("handled above"),
    }
}

fn push_indent(out: &mut String, indent: usize) {
    for _ in 0..indent {
        out.push_str("  ");
    }
}

impl Expr {
    /// Serializes this node. Operators are parenthesised on every level
    /// so the output never depends on precedence.
    pub fn write(&self, out: &mut String, indent: usize) {
        match &self.kind {
            ExprKind::IntLiteral(v) => out.push_str(&v.to_string()),
            ExprKind::Variable(name) => out.push_str(name),
            ExprKind::Cast(ty, inner) => {
                out.push('(');
                out.push_str(ty.name());
                out.push_str(") (");
                inner.write(out, indent);
                out.push(')');
            }
            ExprKind::PreOp { op, arg } => {
                out.push_str(op);
                out.push('(');
                arg.write(out, indent);
                out.push(')');
            }
            ExprKind::BinOp { op, lhs, rhs } => {
                out.push('(');
                lhs.write(out, indent);
                out.push_str(") ");
                out.push_str(op);
                out.push_str(" (");
                rhs.write(out, indent);
                out.push(')');
            }
            ExprKind::TernOp {
                op1,
                op2,
                arg1,
                arg2,
                arg3,
            } => {
                out.push('(');
                arg1.write(out, indent);
                out.push_str(") ");
                out.push_str(op1);
                out.push_str(" (");
                arg2.write(out, indent);
                out.push_str(") ");
                out.push_str(op2);
                out.push_str(" (");
                arg3.write(out, indent);
                out.push(')');
            }
            ExprKind::Call { callee, args } => {
                callee.write(out, indent);
                out.push('(');
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    arg.write(out, indent);
                }
                out.push(')');
            }
            ExprKind::AsmConstraint { constraint, expr } => {
                out.push('"');
                out.push_str(constraint);
                out.push_str("\" (");
                expr.write(out, indent);
                out.push(')');
            }
            ExprKind::AsmStmt {
                volatile_,
                outputs,
                inputs,
            } => {
                push_indent(out, indent);
                out.push_str("asm ");
                if *volatile_ {
                    out.push_str("volatile ");
                }
                out.push_str("(\"\"");
                if !outputs.is_empty() || !inputs.is_empty() {
                    out.push_str(" : ");
                    for (i, output) in outputs.iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        output.write(out, indent);
                    }
                }
                if !inputs.is_empty() {
                    out.push_str(" : ");
                    for (i, input) in inputs.iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        input.write(out, indent);
                    }
                }
                out.push_str(");\n");
            }
            ExprKind::DeclStmt { ty, var, init } => {
                push_indent(out, indent);
                out.push_str(ty.name());
                out.push(' ');
                var.write(out, indent);
                out.push_str(" = ");
                init.write(out, indent);
                out.push_str(";\n");
            }
            ExprKind::ReturnStmt(inner) => {
                push_indent(out, indent);
                out.push_str("return ");
                inner.write(out, indent);
                out.push_str(";\n");
            }
            ExprKind::ExprStmt(inner) => {
                push_indent(out, indent);
                inner.write(out, indent);
                out.push_str(";\n");
            }
            ExprKind::Block(stmts) => {
                out.push_str("{\n");
                for stmt in stmts {
                    stmt.write(out, indent + 1);
                }
                push_indent(out, indent.saturating_sub(1));
                out.push_str("}\n");
            }
            ExprKind::IfStmt {
                cond,
                then_stmt,
                else_stmt,
            } => {
                push_indent(out, indent);
                out.push_str("if (");
                cond.write(out, indent);
                out.push_str(") ");
                then_stmt.write(out, indent + 1);
                if let Some(else_stmt) = else_stmt {
                    push_indent(out, indent);
                    out.push_str("else ");
                    else_stmt.write(out, indent + 1);
                }
            }
            ExprKind::StmtExpr { block, last } => {
                out.push_str("({ ");
                block.write(out, 0);
                last.write(out, 0);
                out.push_str("})");
            }
            ExprKind::Unreachable(inner) => inner.write(out, indent),
        }
    }
}

impl Function {
    pub fn write(&self, out: &mut String) {
        out.push_str(self.return_type.name());
        out.push(' ');
        out.push_str(&self.name);
        out.push('(');
        for (i, ty) in self.arg_types.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(ty.name());
        }
        out.push_str(")\n");
        self.body.write(out, 1);
        out.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_program_prints_expected_value() {
        let p = Program::new(42);
        let text = p.source_text();
        assert!(text.contains("extern int printf"));
        assert!(text.contains("int id0()"));
        assert!(text.contains("return 42;"));
        assert!(text.contains("printf(\"%d\\n\", id0());"));
    }

    #[test]
    fn clone_is_print_identical() {
        let p = Program::new(-7);
        let q = p.next_generation();
        assert_eq!(p.source_text(), q.source_text());
        assert_eq!(q.generation, p.generation + 1);
    }

    #[test]
    fn ident_allocator_never_repeats() {
        let mut ids = IdentAllocator::default();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            assert!(seen.insert(ids.new_ident()));
        }
    }

    #[test]
    fn unreachable_wrap_is_print_transparent() {
        let mut p = Program::new(1);
        let lit = p.node(ExprKind::IntLiteral(5));
        let mut plain = String::new();
        lit.write(&mut plain, 0);

        let wrapped = p.node(ExprKind::Unreachable(Box::new(lit)));
        let mut wrapped_text = String::new();
        wrapped.write(&mut wrapped_text, 0);
        assert_eq!(plain, wrapped_text);
    }

    #[test]
    fn visitor_sees_unreachable_depth() {
        let mut p = Program::new(3);
        let inner = p.node(ExprKind::Block(Vec::new()));
        let wrapped = p.node(ExprKind::Unreachable(Box::new(inner)));
        let cond = p.node(ExprKind::IntLiteral(0));
        let if_stmt = p.node(ExprKind::IfStmt {
            cond: Box::new(cond),
            then_stmt: Box::new(wrapped),
            else_stmt: None,
        });
        p.fn_body_mut(FnRef::Toplevel).insert(0, if_stmt);

        struct Recorder {
            unreachable_blocks: usize,
            reachable_blocks: usize,
        }
        impl Visitor for Recorder {
            fn visit_expr(&mut self, ctx: &VisitCtx, expr: &Expr) {
                if matches!(expr.kind, ExprKind::Block(_)) {
                    if ctx.is_unreachable() {
                        self.unreachable_blocks += 1;
                    } else {
                        self.reachable_blocks += 1;
                    }
                }
            }
        }
        let mut r = Recorder {
            unreachable_blocks: 0,
            reachable_blocks: 0,
        };
        p.visit(&mut r);
        // the dead branch is unreachable, the enclosing body is not
        assert_eq!(r.unreachable_blocks, 1);
        assert_eq!(r.reachable_blocks, 1);
    }

    #[test]
    fn find_expr_mut_locates_nested_nodes() {
        let mut p = Program::new(9);
        let lit = p.node(ExprKind::IntLiteral(123));
        let id = lit.id;
        let stmt = p.node(ExprKind::ExprStmt(Box::new(lit)));
        p.fn_body_mut(FnRef::Toplevel).insert(0, stmt);

        let found = p.find_expr_mut(id).expect("node should be reachable");
        assert!(matches!(found.kind, ExprKind::IntLiteral(123)));
    }
}
