//! `__kernel` header parsing and parameter access analysis.

use std::fmt;

use pest::Parser;
use pest::iterators::Pair;

use super::{
    Macros, OpenClParser, Rule, SourceError, check_nesting, is_identifier, macros_from_options,
    next_child,
};
use crate::element::ScalarType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressSpace {
    Global,
    Constant,
    Local,
    Private,
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressSpace::Global => write!(f, "__global"),
            AddressSpace::Constant => write!(f, "__constant"),
            AddressSpace::Local => write!(f, "__local"),
            AddressSpace::Private => write!(f, "__private"),
        }
    }
}

/// A parameter type: one of the scalar types the host understands, or any
/// other OpenCL type name that is passed through unchecked.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeName {
    Scalar(ScalarType),
    Other(String),
}

impl TypeName {
    pub fn scalar(&self) -> Option<ScalarType> {
        match self {
            TypeName::Scalar(ty) => Some(*ty),
            TypeName::Other(_) => None,
        }
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeName::Scalar(ty) => write!(f, "{ty}"),
            TypeName::Other(name) => write!(f, "{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParamKind {
    Pointer {
        space: AddressSpace,
        elem: TypeName,
        is_const: bool,
    },
    Value(TypeName),
}

/// What a kernel body does with a pointer parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Access {
    #[default]
    Unused,
    /// Only loaded through.
    Read,
    /// Stored through at least once.
    Write,
    /// The pointer escapes (passed to a function, aliased, offset or
    /// dereferenced), so what happens to the memory is not known.
    Unknown,
}

impl Access {
    /// Combines two observations of the same parameter. A store is certain
    /// wherever it is seen; an escape hides whether loads are all there is.
    pub fn merge(self, other: Access) -> Access {
        match (self, other) {
            (Access::Write, _) | (_, Access::Write) => Access::Write,
            (Access::Unknown, _) | (_, Access::Unknown) => Access::Unknown,
            (Access::Read, _) | (_, Access::Read) => Access::Read,
            (Access::Unused, Access::Unused) => Access::Unused,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelParam {
    pub name: String,
    pub kind: ParamKind,
    pub access: Access,
}

impl KernelParam {
    pub fn is_pointer(&self) -> bool {
        matches!(self.kind, ParamKind::Pointer { .. })
    }

    /// Whether the body certainly stores through this parameter.
    pub fn is_written(&self) -> bool {
        self.access == Access::Write
    }
}

impl fmt::Display for KernelParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ParamKind::Pointer {
                space,
                elem,
                is_const,
            } => {
                let qualifier = if *is_const { "const " } else { "" };
                write!(f, "{space} {qualifier}{elem}* {}", self.name)
            }
            ParamKind::Value(ty) => write!(f, "{ty} {}", self.name),
        }
    }
}

/// Declared interface of one `__kernel` function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSignature {
    pub name: String,
    pub params: Vec<KernelParam>,
}

impl KernelSignature {
    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

/// Builds a signature from a `header` node. Every parameter starts out
/// [`Access::Unused`].
pub(crate) fn signature_from_header(
    header: Pair<'_, Rule>,
    macros: &Macros,
) -> Result<KernelSignature, SourceError> {
    let mut inner = header.clone().into_inner();
    let _kernel = next_child(&mut inner, &header)?;
    let ret = next_child(&mut inner, &header)?;
    if ret.as_str() != "void" {
        return Err(SourceError::at(&ret, "kernel functions must return void"));
    }
    let name = next_child(&mut inner, &header)?.as_str().to_string();

    let mut params: Vec<KernelParam> = Vec::new();
    for pair in inner.filter(|p| p.as_rule() == Rule::param) {
        let param = parse_param(pair.clone(), macros)?;
        if params.iter().any(|p| p.name == param.name) {
            return Err(SourceError::at(
                &pair,
                format!("redefinition of parameter '{}'", param.name),
            ));
        }
        params.push(param);
    }

    Ok(KernelSignature { name, params })
}

fn parse_param(pair: Pair<'_, Rule>, macros: &Macros) -> Result<KernelParam, SourceError> {
    let pieces: Vec<Pair<'_, Rule>> = pair.clone().into_inner().collect();
    if let Some(suffix) = pieces.iter().find(|p| p.as_rule() == Rule::array_suffix) {
        return Err(SourceError::at(
            suffix,
            "array parameters are not supported; use a pointer",
        ));
    }
    let Some((name_pair, declaration)) = pieces.split_last() else {
        return Err(SourceError::at(&pair, "expected parameter"));
    };
    if name_pair.as_rule() != Rule::word {
        return Err(SourceError::at(name_pair, "expected parameter name"));
    }
    let name = name_pair.as_str().to_string();

    let mut space = AddressSpace::Private;
    let mut is_const = false;
    let mut unsigned = false;
    let mut base: Option<&str> = None;
    let mut stars = 0;

    for piece in declaration {
        if piece.as_rule() == Rule::star {
            stars += 1;
            continue;
        }
        let text = piece.as_str();
        // A single-word macro may stand in for a type name.
        let word = macros
            .get(text)
            .map(|value| value.trim())
            .filter(|value| is_identifier(value))
            .unwrap_or(text);

        if stars > 0 {
            match word {
                "const" | "__const" | "restrict" | "__restrict" | "volatile" => continue,
                _ => {
                    return Err(SourceError::at(piece, format!("unexpected '{text}' after '*'")));
                }
            }
        }
        match word {
            "__global" | "global" => space = AddressSpace::Global,
            "__constant" | "constant" => {
                space = AddressSpace::Constant;
                is_const = true;
            }
            "__local" | "local" => space = AddressSpace::Local,
            "__private" | "private" => space = AddressSpace::Private,
            "const" | "__const" => is_const = true,
            "volatile" | "restrict" | "__restrict" | "signed" | "__read_only" | "read_only"
            | "__write_only" | "write_only" | "__read_write" | "read_write" => {}
            "unsigned" => unsigned = true,
            _ if base.is_none() => base = Some(word),
            _ => {
                return Err(SourceError::at(
                    piece,
                    format!("unexpected '{text}' in declaration of parameter '{name}'"),
                ));
            }
        }
    }

    let ty = match (base, unsigned) {
        (Some("float"), false) => TypeName::Scalar(ScalarType::Float),
        (Some("int"), false) => TypeName::Scalar(ScalarType::Int),
        (Some("uint"), false) | (Some("int"), true) | (None, true) => {
            TypeName::Scalar(ScalarType::UInt)
        }
        (Some(other), true) => TypeName::Other(format!("u{other}")),
        (Some(other), false) => TypeName::Other(other.to_string()),
        (None, false) => {
            return Err(SourceError::at(
                name_pair,
                format!("parameter '{name}' has no type"),
            ));
        }
    };

    let kind = match stars {
        0 => {
            if matches!(space, AddressSpace::Global | AddressSpace::Constant) {
                return Err(SourceError::at(
                    name_pair,
                    format!("parameter '{name}' with {space} address space must be a pointer"),
                ));
            }
            ParamKind::Value(ty)
        }
        1 => ParamKind::Pointer {
            space,
            elem: ty,
            is_const,
        },
        _ => ParamKind::Pointer {
            space,
            elem: TypeName::Other(format!("{ty}{}", "*".repeat(stars - 1))),
            is_const,
        },
    };

    Ok(KernelParam {
        name,
        kind,
        access: Access::Unused,
    })
}

/// Classifies how a kernel body uses each pointer parameter.
///
/// `p[i] = ...`, `p[i] += ...`, `p[i]++` and `++p[i]` store; any other
/// subscript loads. A pointer named without a subscript, or with its
/// element's address taken, escapes and becomes [`Access::Unknown`].
fn analyze_access(body: Pair<'_, Rule>, params: &mut [KernelParam]) {
    let tokens: Vec<Pair<'_, Rule>> = body
        .into_inner()
        .flatten()
        .filter(|t| t.as_rule() != Rule::token_block)
        .collect();

    for (k, token) in tokens.iter().enumerate() {
        if token.as_rule() != Rule::word {
            continue;
        }
        let Some(param) = params
            .iter_mut()
            .find(|p| p.is_pointer() && p.name == token.as_str())
        else {
            continue;
        };
        let prev = k.checked_sub(1).map(|j| tokens[j].as_rule());
        if prev == Some(Rule::member_op) {
            continue;
        }

        let access = match tokens.get(k + 1).map(|t| t.as_rule()) {
            Some(Rule::open_bracket) => {
                let after = closing_bracket(&tokens, k + 1)
                    .and_then(|j| tokens.get(j + 1))
                    .map(|t| t.as_rule());
                match (prev, after) {
                    (Some(Rule::address_of), _) => Access::Unknown,
                    (Some(Rule::incdec), _) | (_, Some(Rule::assign_op | Rule::incdec)) => {
                        Access::Write
                    }
                    _ => Access::Read,
                }
            }
            _ => Access::Unknown,
        };
        param.access = param.access.merge(access);
    }
}

fn closing_bracket(tokens: &[Pair<'_, Rule>], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (j, token) in tokens.iter().enumerate().skip(open) {
        match token.as_rule() {
            Rule::open_bracket => depth += 1,
            Rule::close_bracket => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(j);
                }
            }
            _ => {}
        }
    }
    None
}

/// Lists every `__kernel` function in `source` with its parameters and how
/// each pointer parameter is accessed.
///
/// Only kernel headers are parsed strictly; everything else is read as a
/// token stream, so this accepts full OpenCL C. `options` may carry `-D`
/// definitions, which are honored in parameter types.
pub fn scan_kernels(source: &str, options: &str) -> Result<Vec<KernelSignature>, SourceError> {
    let (macros, _) = macros_from_options(options)?;
    check_nesting(source)?;
    let parsed =
        OpenClParser::parse(Rule::signatures, source).map_err(SourceError::from_pest_error)?;

    let mut kernels = Vec::new();
    for pair in parsed.flat_map(|p| p.into_inner()) {
        if pair.as_rule() != Rule::scanned_kernel {
            continue;
        }
        let mut inner = pair.clone().into_inner();
        let header = next_child(&mut inner, &pair)?;
        let mut signature = signature_from_header(header, &macros)?;
        // prototypes have no body
        let Some(body) = inner.next() else {
            continue;
        };
        analyze_access(body, &mut signature.params);
        kernels.push(signature);
    }

    Ok(kernels)
}
