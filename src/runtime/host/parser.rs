//! Compiler front end for the host runtime's OpenCL C subset.
//!
//! Walks the `program` rule of the shared grammar and produces slot-resolved,
//! type-annotated kernels. Everything outside the subset is rejected with a
//! positioned diagnostic, which the runtime turns into a failed build.

use std::collections::{HashMap, HashSet};

use pest::Parser;
use pest::iterators::Pair;

use crate::element::ScalarType;
use crate::source::signature::signature_from_header;
use crate::source::{
    Access, AddressSpace, KernelParam, MAX_NESTING, Macros, OpenClParser, ParamKind, Rule,
    SourceError, TypeName, check_nesting, next_child,
};

use super::interp::Value;

/// Deepest expression tree the compiler emits.
const MAX_EXPR_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinaryOp {
    fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge | BinaryOp::Eq | BinaryOp::Ne
        )
    }

    fn from_symbol(symbol: &str) -> Option<Self> {
        Some(match symbol {
            "+" => BinaryOp::Add,
            "-" => BinaryOp::Sub,
            "*" => BinaryOp::Mul,
            "/" => BinaryOp::Div,
            "%" => BinaryOp::Rem,
            "<" => BinaryOp::Lt,
            "<=" => BinaryOp::Le,
            ">" => BinaryOp::Gt,
            ">=" => BinaryOp::Ge,
            "==" => BinaryOp::Eq,
            "!=" => BinaryOp::Ne,
            "&&" => BinaryOp::And,
            "||" => BinaryOp::Or,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkItemFn {
    GlobalId,
    LocalId,
    GroupId,
    GlobalSize,
    LocalSize,
    NumGroups,
}

impl WorkItemFn {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "get_global_id" => WorkItemFn::GlobalId,
            "get_local_id" => WorkItemFn::LocalId,
            "get_group_id" => WorkItemFn::GroupId,
            "get_global_size" => WorkItemFn::GlobalSize,
            "get_local_size" => WorkItemFn::LocalSize,
            "get_num_groups" => WorkItemFn::NumGroups,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathFn {
    Sqrt,
    Fabs,
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(Value),
    Local(usize),
    Load {
        param: usize,
        elem: ScalarType,
        index: Box<Expr>,
    },
    Unary(UnaryOp, ScalarType, Box<Expr>),
    /// Operands are converted to the carried type before the operation.
    Binary(BinaryOp, ScalarType, Box<Expr>, Box<Expr>),
    Cast(ScalarType, Box<Expr>),
    WorkItem(WorkItemFn, Box<Expr>),
    WorkDim,
    Math(MathFn, ScalarType, Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// Assignment to a local slot; the value is converted to `ty`.
    Assign {
        slot: usize,
        ty: ScalarType,
        value: Expr,
    },
    Store {
        param: usize,
        elem: ScalarType,
        index: Expr,
        value: Expr,
    },
    /// `if` / `else if` chain: the first branch whose condition holds runs.
    If {
        branches: Vec<(Expr, Vec<Stmt>)>,
        otherwise: Vec<Stmt>,
    },
    For {
        init: Vec<Stmt>,
        cond: Option<Expr>,
        step: Vec<Stmt>,
        body: Vec<Stmt>,
    },
    Return,
}

/// A compiled kernel ready for the interpreter.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelDef {
    pub name: String,
    /// Pointer parameters carry the exact [`Access`] of the body.
    pub params: Vec<KernelParam>,
    pub body: Vec<Stmt>,
    /// Number of local slots, including by-value parameters.
    pub slots: usize,
    /// `(param index, slot)` for each by-value parameter.
    pub scalar_slots: Vec<(usize, usize)>,
}

/// Compiles every `__kernel` function in `source`.
pub fn parse_program(source: &str, macros: &Macros) -> Result<Vec<KernelDef>, SourceError> {
    check_nesting(source)?;
    let parsed =
        OpenClParser::parse(Rule::program, source).map_err(SourceError::from_pest_error)?;

    let mut kernels: Vec<KernelDef> = Vec::new();
    let mut names = HashSet::new();
    for pair in parsed.flat_map(|p| p.into_inner()) {
        if pair.as_rule() != Rule::kernel_def {
            continue;
        }
        let kernel = Compiler::new(macros).kernel(pair.clone())?;
        if !names.insert(kernel.name.clone()) {
            return Err(SourceError::at(
                &pair,
                format!("redefinition of kernel '{}'", kernel.name),
            ));
        }
        kernels.push(kernel);
    }

    if kernels.is_empty() {
        return Err(SourceError::new(0, 0, "program contains no __kernel functions"));
    }
    Ok(kernels)
}

/// C's usual arithmetic conversions restricted to `float`, `uint`, `int`.
pub fn usual_conversion(a: ScalarType, b: ScalarType) -> ScalarType {
    match (a, b) {
        (ScalarType::Float, _) | (_, ScalarType::Float) => ScalarType::Float,
        (ScalarType::UInt, _) | (_, ScalarType::UInt) => ScalarType::UInt,
        _ => ScalarType::Int,
    }
}

#[derive(Clone, Copy)]
struct Local {
    slot: usize,
    ty: ScalarType,
    is_const: bool,
}

#[derive(Clone, Copy)]
enum Symbol {
    Local(Local),
    Buffer(usize),
}

struct Typed {
    expr: Expr,
    ty: ScalarType,
    depth: usize,
}

impl Typed {
    fn leaf(expr: Expr, ty: ScalarType) -> Self {
        Typed { expr, ty, depth: 1 }
    }
}

/// Where an assignment lands.
enum Target {
    Local(Local),
    Element {
        param: usize,
        elem: ScalarType,
        index: Typed,
    },
}

impl Target {
    fn current(&self) -> Typed {
        match self {
            Target::Local(local) => Typed::leaf(Expr::Local(local.slot), local.ty),
            Target::Element { param, elem, index } => Typed {
                expr: Expr::Load {
                    param: *param,
                    elem: *elem,
                    index: Box::new(index.expr.clone()),
                },
                ty: *elem,
                depth: index.depth + 1,
            },
        }
    }

    fn assign(self, value: Expr) -> Stmt {
        match self {
            Target::Local(local) => Stmt::Assign {
                slot: local.slot,
                ty: local.ty,
                value,
            },
            Target::Element { param, elem, index } => Stmt::Store {
                param,
                elem,
                index: index.expr,
                value,
            },
        }
    }
}

struct Compiler<'m> {
    macros: &'m Macros,
    params: Vec<KernelParam>,
    scopes: Vec<HashMap<String, Symbol>>,
    slots: usize,
    /// Macros currently being expanded, innermost last.
    expanding: Vec<String>,
}

impl<'m> Compiler<'m> {
    fn new(macros: &'m Macros) -> Self {
        Compiler {
            macros,
            params: Vec::new(),
            scopes: vec![HashMap::new()],
            slots: 0,
            expanding: Vec::new(),
        }
    }

    fn kernel(mut self, pair: Pair<'_, Rule>) -> Result<KernelDef, SourceError> {
        let mut inner = pair.clone().into_inner();
        let header = next_child(&mut inner, &pair)?;
        let body = next_child(&mut inner, &pair)?;
        let signature = signature_from_header(header.clone(), self.macros)?;
        let param_pairs: Vec<Pair<'_, Rule>> = header
            .clone()
            .into_inner()
            .filter(|p| p.as_rule() == Rule::param)
            .collect();

        let mut scalar_slots = Vec::new();
        for (index, (param, at)) in signature.params.iter().zip(&param_pairs).enumerate() {
            let symbol = match &param.kind {
                ParamKind::Pointer { space, elem, .. } => {
                    if elem.scalar().is_none() {
                        return Err(SourceError::at(
                            at,
                            format!("unsupported element type '{elem}' for parameter '{}'", param.name),
                        ));
                    }
                    if !matches!(space, AddressSpace::Global | AddressSpace::Constant) {
                        return Err(SourceError::at(
                            at,
                            format!("{space} pointer parameter '{}' is not supported", param.name),
                        ));
                    }
                    Symbol::Buffer(index)
                }
                ParamKind::Value(TypeName::Scalar(ty)) => {
                    let slot = self.allocate();
                    scalar_slots.push((index, slot));
                    Symbol::Local(Local {
                        slot,
                        ty: *ty,
                        is_const: false,
                    })
                }
                ParamKind::Value(other) => {
                    return Err(SourceError::at(
                        at,
                        format!("unsupported type '{other}' for parameter '{}'", param.name),
                    ));
                }
            };
            self.declare(&param.name, symbol, at)?;
        }
        self.params = signature.params;

        let body = self.block(body)?;
        Ok(KernelDef {
            name: signature.name,
            params: self.params,
            body,
            slots: self.slots,
            scalar_slots,
        })
    }

    fn allocate(&mut self) -> usize {
        self.slots += 1;
        self.slots - 1
    }

    fn declare(&mut self, name: &str, symbol: Symbol, at: &Pair<'_, Rule>) -> Result<(), SourceError> {
        let scope = self
            .scopes
            .last_mut()
            .ok_or_else(|| SourceError::at(at, "declaration outside any scope"))?;
        if scope.insert(name.to_string(), symbol).is_some() {
            return Err(SourceError::at(at, format!("redefinition of '{name}'")));
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> Option<Symbol> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name)).copied()
    }

    fn mark(&mut self, param: usize, access: Access) {
        if let Some(param) = self.params.get_mut(param) {
            param.access = param.access.merge(access);
        }
    }

    fn scoped<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, SourceError>,
    ) -> Result<T, SourceError> {
        self.scopes.push(HashMap::new());
        let result = f(self);
        self.scopes.pop();
        result
    }

    // ---- statements -------------------------------------------------------

    fn block(&mut self, pair: Pair<'_, Rule>) -> Result<Vec<Stmt>, SourceError> {
        self.scoped(|c| {
            let mut out = Vec::new();
            for stmt in pair.into_inner() {
                c.statement(stmt, &mut out)?;
            }
            Ok(out)
        })
    }

    /// The body of an `if` or `for`, in a scope of its own.
    fn body(&mut self, pair: Pair<'_, Rule>) -> Result<Vec<Stmt>, SourceError> {
        self.scoped(|c| {
            let mut out = Vec::new();
            c.statement(pair, &mut out)?;
            Ok(out)
        })
    }

    fn statement(&mut self, pair: Pair<'_, Rule>, out: &mut Vec<Stmt>) -> Result<(), SourceError> {
        match pair.as_rule() {
            Rule::block => out.extend(self.block(pair)?),
            Rule::if_stmt => out.push(self.if_stmt(pair)?),
            Rule::for_stmt => out.push(self.scoped(|c| c.for_stmt(pair))?),
            Rule::return_stmt => {
                if let Some(value) = pair.into_inner().find(|p| p.as_rule() == Rule::expr) {
                    return Err(SourceError::at(&value, "kernel functions cannot return a value"));
                }
                out.push(Stmt::Return);
            }
            Rule::declaration => {
                for body in pair.into_inner() {
                    self.declaration(body, out)?;
                }
            }
            Rule::empty_stmt => {}
            Rule::expr_stmt => {
                for part in pair.into_inner() {
                    if part.as_rule() != Rule::update {
                        return Err(discarded(part));
                    }
                    self.update(part, out)?;
                }
            }
            _ => return Err(SourceError::at(&pair, "unsupported statement")),
        }
        Ok(())
    }

    fn if_stmt(&mut self, pair: Pair<'_, Rule>) -> Result<Stmt, SourceError> {
        let mut branches = Vec::new();
        let mut otherwise = Vec::new();
        for part in pair.into_inner() {
            match part.as_rule() {
                Rule::if_branch => {
                    let mut inner = part.clone().into_inner();
                    let _if = next_child(&mut inner, &part)?;
                    let cond = self.expr(next_child(&mut inner, &part)?)?;
                    let body = self.body(next_child(&mut inner, &part)?)?;
                    branches.push((cond.expr, body));
                }
                Rule::else_clause => {
                    let mut inner = part.clone().into_inner();
                    let _else = next_child(&mut inner, &part)?;
                    otherwise = self.body(next_child(&mut inner, &part)?)?;
                }
                _ => {}
            }
        }
        Ok(Stmt::If {
            branches,
            otherwise,
        })
    }

    fn for_stmt(&mut self, pair: Pair<'_, Rule>) -> Result<Stmt, SourceError> {
        let mut init = Vec::new();
        let mut cond = None;
        let mut step = Vec::new();
        let mut body = Vec::new();
        for part in pair.into_inner() {
            match part.as_rule() {
                Rule::kw_for => {}
                Rule::for_init => {
                    for item in part.into_inner() {
                        if item.as_rule() == Rule::declaration_body {
                            self.declaration(item, &mut init)?;
                        } else {
                            self.update(item, &mut init)?;
                        }
                    }
                }
                Rule::for_cond => {
                    if let Some(expr) = part.into_inner().next() {
                        cond = Some(self.expr(expr)?.expr);
                    }
                }
                Rule::for_step => {
                    for item in part.into_inner() {
                        self.update(item, &mut step)?;
                    }
                }
                _ => body = self.body(part)?,
            }
        }
        Ok(Stmt::For {
            init,
            cond,
            step,
            body,
        })
    }

    fn declaration(&mut self, pair: Pair<'_, Rule>, out: &mut Vec<Stmt>) -> Result<(), SourceError> {
        let mut is_const = false;
        let mut ty = ScalarType::Int;
        for part in pair.into_inner() {
            match part.as_rule() {
                Rule::const_kw => is_const = true,
                Rule::scalar_type => ty = scalar_type(part.as_str()),
                Rule::declarator => {
                    let mut inner = part.clone().into_inner();
                    let name = next_child(&mut inner, &part)?;
                    let value = match inner.next() {
                        Some(init) => self.expr(init)?.expr,
                        None if is_const => {
                            return Err(SourceError::at(
                                &name,
                                format!("const variable '{}' needs an initializer", name.as_str()),
                            ));
                        }
                        None => Expr::Const(Value::zero(ty)),
                    };
                    let slot = self.allocate();
                    self.declare(name.as_str(), Symbol::Local(Local { slot, ty, is_const }), &name)?;
                    out.push(Stmt::Assign { slot, ty, value });
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// `x = e`, `x op= e`, `x++`, `++x`, and the same on `p[i]`.
    fn update(&mut self, pair: Pair<'_, Rule>, out: &mut Vec<Stmt>) -> Result<(), SourceError> {
        let mut inner = pair.clone().into_inner();
        let first = next_child(&mut inner, &pair)?;
        let (lvalue, op) = if first.as_rule() == Rule::incdec {
            (next_child(&mut inner, &pair)?, first)
        } else {
            (first, next_child(&mut inner, &pair)?)
        };
        let rhs = inner.next();

        let target = self.target(lvalue)?;
        let symbol = op.as_str();
        let value = if op.as_rule() == Rule::incdec {
            let delta = if symbol == "++" { BinaryOp::Add } else { BinaryOp::Sub };
            self.read_back(&target);
            binary(delta, target.current(), Typed::leaf(Expr::Const(Value::Int(1)), ScalarType::Int), &op)?
        } else {
            let rhs = rhs.ok_or_else(|| SourceError::at(&op, "expected expression"))?;
            let value = self.expr(rhs)?;
            match symbol {
                "=" => value,
                _ => {
                    let compound = symbol
                        .strip_suffix('=')
                        .and_then(BinaryOp::from_symbol)
                        .filter(|b| {
                            matches!(
                                b,
                                BinaryOp::Add
                                    | BinaryOp::Sub
                                    | BinaryOp::Mul
                                    | BinaryOp::Div
                                    | BinaryOp::Rem
                            )
                        })
                        .ok_or_else(|| {
                            SourceError::at(&op, format!("unsupported assignment operator '{symbol}'"))
                        })?;
                    self.read_back(&target);
                    binary(compound, target.current(), value, &op)?
                }
            }
        };
        out.push(target.assign(value.expr));
        Ok(())
    }

    fn read_back(&mut self, target: &Target) {
        if let Target::Element { param, .. } = target {
            self.mark(*param, Access::Read);
        }
    }

    fn target(&mut self, lvalue: Pair<'_, Rule>) -> Result<Target, SourceError> {
        let mut inner = lvalue.clone().into_inner();
        let name_pair = next_child(&mut inner, &lvalue)?;
        let name = name_pair.as_str();
        match (self.lookup(name), inner.next()) {
            (Some(Symbol::Local(local)), None) => {
                if local.is_const {
                    return Err(SourceError::at(
                        &name_pair,
                        format!("cannot assign to const variable '{name}'"),
                    ));
                }
                Ok(Target::Local(local))
            }
            (Some(Symbol::Local(_)), Some(subscript)) => Err(SourceError::at(
                &subscript,
                format!("subscripted value '{name}' is not a pointer"),
            )),
            (Some(Symbol::Buffer(param)), Some(subscript)) => {
                if matches!(self.params[param].kind, ParamKind::Pointer { is_const: true, .. }) {
                    return Err(SourceError::at(
                        &name_pair,
                        format!("cannot store through read-only parameter '{name}'"),
                    ));
                }
                let (elem, index) = self.element(param, subscript)?;
                self.mark(param, Access::Write);
                Ok(Target::Element { param, elem, index })
            }
            (Some(Symbol::Buffer(_)), None) => Err(SourceError::at(
                &name_pair,
                format!("pointer '{name}' must be indexed"),
            )),
            (None, _) => Err(SourceError::at(
                &name_pair,
                format!("use of undeclared identifier '{name}'"),
            )),
        }
    }

    fn element(
        &mut self,
        param: usize,
        subscript: Pair<'_, Rule>,
    ) -> Result<(ScalarType, Typed), SourceError> {
        let mut inner = subscript.clone().into_inner();
        let index = self.expr(next_child(&mut inner, &subscript)?)?;
        if index.ty == ScalarType::Float {
            return Err(SourceError::at(&subscript, "array subscript is not an integer"));
        }
        let elem = match &self.params[param].kind {
            ParamKind::Pointer { elem, .. } => elem.scalar(),
            ParamKind::Value(_) => None,
        };
        let elem = elem.ok_or_else(|| SourceError::at(&subscript, "subscripted value is not a pointer"))?;
        Ok((elem, index))
    }

    // ---- expressions ------------------------------------------------------

    fn expr(&mut self, pair: Pair<'_, Rule>) -> Result<Typed, SourceError> {
        match pair.as_rule() {
            Rule::expr
            | Rule::logical_and
            | Rule::equality
            | Rule::relational
            | Rule::additive
            | Rule::multiplicative => self.chain(pair),
            Rule::unary => self.unary(pair),
            Rule::postfix => self.postfix(pair),
            Rule::float_lit => float_literal(&pair),
            Rule::int_lit => int_literal(&pair),
            Rule::call => self.call(pair),
            Rule::ident => self.name(pair),
            _ => Err(SourceError::at(&pair, "unsupported expression")),
        }
    }

    /// A left-associative run of one precedence level.
    fn chain(&mut self, pair: Pair<'_, Rule>) -> Result<Typed, SourceError> {
        let mut inner = pair.clone().into_inner();
        let mut acc = self.expr(next_child(&mut inner, &pair)?)?;
        while let Some(op) = inner.next() {
            let rhs = self.expr(next_child(&mut inner, &pair)?)?;
            let bin = BinaryOp::from_symbol(op.as_str()).ok_or_else(|| {
                SourceError::at(&op, format!("unsupported operator '{}'", op.as_str()))
            })?;
            acc = binary(bin, acc, rhs, &op)?;
        }
        Ok(acc)
    }

    fn unary(&mut self, pair: Pair<'_, Rule>) -> Result<Typed, SourceError> {
        let mut parts: Vec<Pair<'_, Rule>> = pair.clone().into_inner().collect();
        let operand = parts
            .pop()
            .ok_or_else(|| SourceError::at(&pair, "expected expression"))?;
        let mut value = self.expr(operand)?;

        for prefix in parts.into_iter().rev() {
            let depth = value.depth + 1;
            value = match prefix.as_rule() {
                Rule::neg => Typed {
                    ty: value.ty,
                    expr: Expr::Unary(UnaryOp::Neg, value.ty, Box::new(value.expr)),
                    depth,
                },
                Rule::not => Typed {
                    ty: ScalarType::Int,
                    expr: Expr::Unary(UnaryOp::Not, value.ty, Box::new(value.expr)),
                    depth,
                },
                Rule::cast => {
                    let mut inner = prefix.clone().into_inner();
                    let ty = scalar_type(next_child(&mut inner, &prefix)?.as_str());
                    Typed {
                        expr: Expr::Cast(ty, Box::new(value.expr)),
                        ty,
                        depth,
                    }
                }
                _ => value,
            };
            check_depth(&value, &prefix)?;
        }
        Ok(value)
    }

    fn postfix(&mut self, pair: Pair<'_, Rule>) -> Result<Typed, SourceError> {
        let mut inner = pair.clone().into_inner();
        let primary = next_child(&mut inner, &pair)?;
        let Some(subscript) = inner.next() else {
            return self.expr(primary);
        };

        let is_name = primary.as_rule() == Rule::ident;
        match self.lookup(primary.as_str()).filter(|_| is_name) {
            Some(Symbol::Buffer(param)) => {
                let (elem, index) = self.element(param, subscript)?;
                self.mark(param, Access::Read);
                Ok(Typed {
                    depth: index.depth + 1,
                    expr: Expr::Load {
                        param,
                        elem,
                        index: Box::new(index.expr),
                    },
                    ty: elem,
                })
            }
            None if is_name && !self.macros.contains_key(primary.as_str()) => Err(SourceError::at(
                &primary,
                format!("use of undeclared identifier '{}'", primary.as_str()),
            )),
            _ => Err(SourceError::at(&subscript, "subscripted value is not a pointer")),
        }
    }

    fn name(&mut self, pair: Pair<'_, Rule>) -> Result<Typed, SourceError> {
        let name = pair.as_str();
        match self.lookup(name) {
            Some(Symbol::Local(local)) => Ok(Typed::leaf(Expr::Local(local.slot), local.ty)),
            Some(Symbol::Buffer(_)) => Err(SourceError::at(
                &pair,
                format!("pointer '{name}' must be indexed"),
            )),
            None => self.expand(name, &pair),
        }
    }

    /// Replaces a `-D` macro by its value, parsed as an expression.
    fn expand(&mut self, name: &str, at: &Pair<'_, Rule>) -> Result<Typed, SourceError> {
        let macros = self.macros;
        let Some(text) = macros.get(name) else {
            return Err(SourceError::at(at, format!("use of undeclared identifier '{name}'")));
        };
        if self.expanding.iter().any(|n| n == name) {
            return Err(SourceError::at(at, format!("macro '{name}' expands to itself")));
        }
        if self.expanding.len() >= MAX_NESTING {
            return Err(SourceError::at(at, "macro expansion nested too deeply"));
        }

        let in_macro = |e: SourceError| {
            SourceError::at(at, format!("in expansion of macro '{name}': {}", e.message))
        };
        check_nesting(text).map_err(in_macro)?;
        let parsed = OpenClParser::parse(Rule::macro_value, text)
            .map_err(|e| in_macro(SourceError::from_pest_error(e)))?;
        let expr = parsed
            .flat_map(|p| p.into_inner())
            .find(|p| p.as_rule() == Rule::expr)
            .ok_or_else(|| SourceError::at(at, format!("macro '{name}' is empty")))?;

        self.expanding.push(name.to_string());
        let result = self.expr(expr);
        self.expanding.pop();
        result.map_err(in_macro)
    }

    fn call(&mut self, pair: Pair<'_, Rule>) -> Result<Typed, SourceError> {
        let mut inner = pair.clone().into_inner();
        let name_pair = next_child(&mut inner, &pair)?;
        let name = name_pair.as_str();
        let mut args = Vec::new();
        for arg in inner {
            args.push(self.expr(arg)?);
        }
        let depth = args.iter().map(|a| a.depth).max().unwrap_or(0) + 1;

        if let Some(func) = WorkItemFn::from_name(name) {
            arity(&pair, name, &args, 1)?;
            let dim = args.remove(0);
            if dim.ty == ScalarType::Float {
                return Err(SourceError::at(
                    &pair,
                    format!("dimension argument of '{name}' must be an integer"),
                ));
            }
            return Ok(Typed {
                expr: Expr::WorkItem(func, Box::new(dim.expr)),
                ty: ScalarType::UInt,
                depth,
            });
        }

        let (func, ty) = match name {
            "get_work_dim" => {
                arity(&pair, name, &args, 0)?;
                return Ok(Typed::leaf(Expr::WorkDim, ScalarType::UInt));
            }
            "sqrt" => (MathFn::Sqrt, ScalarType::Float),
            "fabs" => (MathFn::Fabs, ScalarType::Float),
            "fmin" => (MathFn::Min, ScalarType::Float),
            "fmax" => (MathFn::Max, ScalarType::Float),
            "min" | "max" => {
                arity(&pair, name, &args, 2)?;
                let ty = usual_conversion(args[0].ty, args[1].ty);
                let func = if name == "min" { MathFn::Min } else { MathFn::Max };
                (func, ty)
            }
            _ => {
                return Err(SourceError::at(
                    &name_pair,
                    format!("call to undeclared function '{name}'"),
                ));
            }
        };
        let expected = match func {
            MathFn::Sqrt | MathFn::Fabs => 1,
            MathFn::Min | MathFn::Max => 2,
        };
        arity(&pair, name, &args, expected)?;
        Ok(Typed {
            expr: Expr::Math(func, ty, args.into_iter().map(|a| a.expr).collect()),
            ty,
            depth,
        })
    }
}

fn binary(op: BinaryOp, lhs: Typed, rhs: Typed, at: &Pair<'_, Rule>) -> Result<Typed, SourceError> {
    let (ty, result) = match op {
        BinaryOp::And | BinaryOp::Or => (ScalarType::Int, ScalarType::Int),
        _ => {
            let ty = usual_conversion(lhs.ty, rhs.ty);
            if op == BinaryOp::Rem && ty == ScalarType::Float {
                return Err(SourceError::at(at, "invalid operands to binary '%' (float)"));
            }
            (ty, if op.is_comparison() { ScalarType::Int } else { ty })
        }
    };
    let typed = Typed {
        depth: lhs.depth.max(rhs.depth) + 1,
        expr: Expr::Binary(op, ty, Box::new(lhs.expr), Box::new(rhs.expr)),
        ty: result,
    };
    check_depth(&typed, at)?;
    Ok(typed)
}

fn check_depth(typed: &Typed, at: &Pair<'_, Rule>) -> Result<(), SourceError> {
    if typed.depth > MAX_EXPR_DEPTH {
        return Err(SourceError::at(
            at,
            format!("expression is too complex (more than {MAX_EXPR_DEPTH} levels)"),
        ));
    }
    Ok(())
}

fn arity(at: &Pair<'_, Rule>, name: &str, args: &[Typed], expected: usize) -> Result<(), SourceError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(SourceError::at(
            at,
            format!("'{name}' takes {expected} argument(s), {} given", args.len()),
        ))
    }
}

/// The error for an expression statement whose value is dropped.
fn discarded(expr: Pair<'_, Rule>) -> SourceError {
    let mut node = expr.clone();
    loop {
        if node.as_rule() == Rule::call {
            let name = node.clone().into_inner().next().map_or("", |n| n.as_str());
            return SourceError::at(&node, format!("unsupported statement: call to '{name}'"));
        }
        let mut children = node.clone().into_inner();
        match (children.next(), children.next()) {
            (Some(only), None) => node = only,
            _ => break,
        }
    }
    SourceError::at(&expr, "expected assignment operator; expression result is unused")
}

fn scalar_type(text: &str) -> ScalarType {
    match text.split_whitespace().next() {
        Some("float") => ScalarType::Float,
        Some("int") => ScalarType::Int,
        _ => ScalarType::UInt,
    }
}

fn int_literal(pair: &Pair<'_, Rule>) -> Result<Typed, SourceError> {
    let text = pair.as_str();
    let unsigned = text.ends_with(['u', 'U']);
    let digits = text.trim_end_matches(['u', 'U']);
    let parsed = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else if digits.len() > 1 && digits.starts_with('0') {
        u64::from_str_radix(&digits[1..], 8)
    } else {
        digits.parse::<u64>()
    };

    let too_large = || SourceError::at(pair, "integer literal is too large");
    let value = parsed.map_err(|_| too_large())?;
    let value = match i32::try_from(value) {
        Ok(v) if !unsigned => Value::Int(v),
        _ => Value::UInt(u32::try_from(value).map_err(|_| too_large())?),
    };
    Ok(Typed::leaf(Expr::Const(value), value.scalar_type()))
}

fn float_literal(pair: &Pair<'_, Rule>) -> Result<Typed, SourceError> {
    let value = pair
        .as_str()
        .trim_end_matches(['f', 'F'])
        .parse::<f32>()
        .map_err(|_| SourceError::at(pair, "malformed floating-point literal"))?;
    Ok(Typed::leaf(Expr::Const(Value::Float(value)), ScalarType::Float))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(src: &str) -> Result<Vec<KernelDef>, SourceError> {
        parse_program(src, &Macros::new())
    }

    #[test]
    fn test_reference_kernel() {
        let kernels = compile(
            "__kernel void parallel_add(__global float* x, __global float* y, __global float* z){\
               const int i = get_global_id(0); z[i] = y[i] + x[i]; }",
        )
        .unwrap();
        let k = &kernels[0];
        assert_eq!(k.name, "parallel_add");
        assert_eq!(k.params.len(), 3);
        assert_eq!(k.params[2].access, Access::Write);
        assert_eq!(k.params[0].access, Access::Read);
        assert_eq!(k.slots, 1);
        assert_eq!(k.body.len(), 2);
    }

    #[test]
    fn test_scalar_params_get_slots() {
        let k = &compile(
            "__kernel void scale(__global float* v, float f, int n) {\
               int i = get_global_id(0); if (i < n) v[i] *= f; }",
        )
        .unwrap()[0];
        assert_eq!(k.scalar_slots, vec![(1, 0), (2, 1)]);
        assert_eq!(k.slots, 3);
        // compound assignment loads as well as stores
        assert_eq!(k.params[0].access, Access::Write);
    }

    #[test]
    fn test_for_loop_and_else_if_chain() {
        let k = &compile(
            "__kernel void acc(__global int* out, int n) {\
               int s = 0;\
               for (int k = 0; k < n; k++) { s += k; }\
               if (s > 10) out[0] = s; else if (s > 5) out[0] = 1; else { out[0] = -s; }\
             }",
        )
        .unwrap()[0];
        assert!(matches!(k.body[1], Stmt::For { .. }));
        match &k.body[2] {
            Stmt::If {
                branches,
                otherwise,
            } => {
                assert_eq!(branches.len(), 2);
                assert_eq!(otherwise.len(), 1);
            }
            other => panic!("expected an if chain, got {other:?}"),
        }
    }

    #[test]
    fn test_unused_pointer_has_no_access() {
        let k = &compile("__kernel void f(__global float* a, __global float* b) { b[0] = 1.0f; }")
            .unwrap()[0];
        assert_eq!(k.params[0].access, Access::Unused);
    }

    #[test]
    fn test_missing_semicolon_is_positioned() {
        let err = compile(
            "__kernel void f(__global float* z) {\n  const int i = get_global_id(0)\n  z[i] = 1.0f;\n}",
        )
        .unwrap_err();
        assert_eq!((err.line, err.column), (3, 3));
        assert!(err.message.contains("expected"), "{}", err.message);
    }

    #[test]
    fn test_semantic_errors() {
        let cases = [
            ("__kernel void f(__global float* z) { z[0] = q; }", "undeclared identifier 'q'"),
            ("__kernel void f(__global const float* z) { z[0] = 1.0f; }", "read-only"),
            ("__kernel void f(__global float* z) { const int i = 0; i = 1; }", "const variable"),
            ("__kernel void f(__global float* z) { z[0] = 1.0f % 2.0f; }", "binary '%'"),
            ("__kernel void f(__global float* z) { z[1.0f] = 0.0f; }", "not an integer"),
            ("__kernel void f(__global float* z) { barrier(0); }", "call to 'barrier'"),
            ("__kernel void f(__global float* z) { z[0] + 1.0f; }", "expected assignment"),
            ("__kernel void f(__global float* z) { z[0] = exp(1.0f); }", "undeclared function"),
            ("__kernel void f(__global float* z) { z[0] = sqrt(1.0f, 2.0f); }", "takes 1 argument"),
            ("__kernel void f(__global float* z) { z = 0; }", "must be indexed"),
            ("__kernel void f(__global float* z) { z[0] <<= 1; }", "assignment operator '<<='"),
            ("__kernel void f(__global float* z) { return 1; }", "cannot return a value"),
            ("__kernel void f(__global double* z) { }", "unsupported element type"),
            ("__kernel void f(__local float* z) { }", "not supported"),
            ("__kernel int f(__global float* z) { }", "must return void"),
            ("float g(float v) { return v; }", "'__kernel'"),
        ];
        for (src, needle) in cases {
            let err = compile(src).unwrap_err();
            assert!(err.message.contains(needle), "{src}: {}", err.message);
        }
    }

    #[test]
    fn test_duplicate_kernel_names() {
        let err = compile("__kernel void a() {} __kernel void a() {}").unwrap_err();
        assert!(err.message.contains("redefinition of kernel"));
    }

    #[test]
    fn test_literals() {
        let k = &compile(
            "__kernel void f(__global uint* z) { z[0] = 0x10; z[1] = 4000000000; z[2] = 7u; z[3] = 010; }",
        )
        .unwrap()[0];
        let values: Vec<&Expr> = k
            .body
            .iter()
            .filter_map(|s| match s {
                Stmt::Store { value, .. } => Some(value),
                _ => None,
            })
            .collect();
        assert_eq!(
            values,
            vec![
                &Expr::Const(Value::Int(16)),
                &Expr::Const(Value::UInt(4_000_000_000)),
                &Expr::Const(Value::UInt(7)),
                &Expr::Const(Value::Int(8)),
            ]
        );
        assert!(compile("__kernel void f(__global uint* z) { z[0] = 5000000000; }").is_err());
    }

    #[test]
    fn test_macros_substitute() {
        let (macros, _) = crate::source::macros_from_options("-D SCALE=3 -D TWICE=(SCALE*2)").unwrap();
        let k = &parse_program("__kernel void f(__global int* z) { z[0] = SCALE; }", &macros)
            .unwrap()[0];
        assert_eq!(
            k.body[0],
            Stmt::Store {
                param: 0,
                elem: ScalarType::Int,
                index: Expr::Const(Value::Int(0)),
                value: Expr::Const(Value::Int(3)),
            }
        );
        assert!(parse_program("__kernel void f(__global int* z) { z[0] = TWICE; }", &macros).is_ok());

        let (looping, _) = crate::source::macros_from_options("-D A=B -D B=A").unwrap();
        let err = parse_program("__kernel void f(__global int* z) { z[0] = A; }", &looping)
            .unwrap_err();
        assert!(err.message.contains("expands to itself"), "{}", err.message);
    }

    #[test]
    fn test_deep_parentheses_are_refused() {
        for depth in [300, 5000] {
            let src = format!(
                "__kernel void k(__global int* z) {{ z[0] = {}1{}; }}",
                "(".repeat(depth),
                ")".repeat(depth)
            );
            let err = compile(&src).unwrap_err();
            assert!(err.message.contains("nested"), "{}", err.message);
            assert_eq!(err.line, 1);
        }
        let ok = format!(
            "__kernel void k(__global int* z) {{ z[0] = {}1{}; }}",
            "(".repeat(20),
            ")".repeat(20)
        );
        assert!(compile(&ok).is_ok());
    }

    #[test]
    fn test_deep_blocks_and_long_chains_are_refused() {
        let blocks = format!(
            "__kernel void k(__global int* z) {{ {} z[0] = 1; {} }}",
            "{".repeat(300),
            "}".repeat(300)
        );
        assert!(compile(&blocks).unwrap_err().message.contains("nested"));

        let ifs = format!(
            "__kernel void k(__global int* z) {{ {} z[0] = 1; }}",
            "if (1) ".repeat(300)
        );
        assert!(compile(&ifs).unwrap_err().message.contains("nested"));

        let sum = format!("__kernel void k(__global int* z) {{ z[0] = 1{}; }}", " + 1".repeat(1000));
        assert!(compile(&sum).unwrap_err().message.contains("too complex"));
    }
}
