//! Kernel source introspection shared by every runtime.
//!
//! OpenCL C is read through one pest grammar (`opencl.pest`). The host
//! runtime compiles its subset from the `program` rule; every runtime uses
//! [`scan_kernels`] to learn the declared parameters of each `__kernel`
//! function, which is what argument binding validates against.

pub mod signature;

use std::collections::HashMap;
use std::fmt;

use pest::error::LineColLocation;
use pest::iterators::{Pair, Pairs};
use pest_derive::Parser;

pub use signature::{
    Access, AddressSpace, KernelParam, KernelSignature, ParamKind, TypeName, scan_kernels,
};

#[derive(Parser)]
#[grammar = "source/opencl.pest"]
pub(crate) struct OpenClParser;

/// Brackets and unbraced control statements may nest this deep.
pub const MAX_NESTING: usize = 32;

/// Object-like macros from `-D` build options, name to replacement text.
pub type Macros = HashMap<String, String>;

/// A diagnostic with a source position (1-based; 0 when not tied to source).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl SourceError {
    pub fn new(line: usize, column: usize, message: impl Into<String>) -> Self {
        SourceError {
            line,
            column,
            message: message.into(),
        }
    }

    pub(crate) fn at(pair: &Pair<'_, Rule>, message: impl Into<String>) -> Self {
        let (line, column) = pair.line_col();
        SourceError::new(line, column, message)
    }

    /// Create a positioned error from a pest error
    pub(crate) fn from_pest_error(err: pest::error::Error<Rule>) -> Self {
        let err = err.renamed_rules(describe_rule);
        let (line, column) = match err.line_col {
            LineColLocation::Pos((l, c)) => (l, c),
            LineColLocation::Span((l, c), _) => (l, c),
        };
        SourceError::new(line, column, err.variant.message().to_string())
    }
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line == 0 {
            write!(f, "error: {}", self.message)
        } else {
            write!(f, "{}:{}: error: {}", self.line, self.column, self.message)
        }
    }
}

impl std::error::Error for SourceError {}

fn describe_rule(rule: &Rule) -> String {
    let text = match rule {
        Rule::EOI => "end of input",
        Rule::kernel_kw => "'__kernel'",
        Rule::word | Rule::ident => "identifier",
        Rule::scalar_type => "type name",
        Rule::param | Rule::void_params => "parameter",
        Rule::star => "'*'",
        Rule::array_suffix | Rule::subscript | Rule::open_bracket => "'['",
        Rule::close_bracket => "']'",
        Rule::block | Rule::token_block => "'{'",
        Rule::declaration | Rule::declaration_body => "declaration",
        Rule::declarator => "declarator",
        Rule::update | Rule::lvalue => "assignment",
        Rule::assign_op => "assignment operator",
        Rule::incdec => "'++' or '--'",
        Rule::expr
        | Rule::logical_and
        | Rule::equality
        | Rule::relational
        | Rule::additive
        | Rule::multiplicative
        | Rule::unary
        | Rule::postfix => "expression",
        Rule::cast => "cast",
        Rule::call => "function call",
        Rule::float_lit | Rule::int_lit | Rule::number => "literal",
        Rule::or_op => "'||'",
        Rule::and_op => "'&&'",
        Rule::eq_op => "'==' or '!='",
        Rule::rel_op => "comparison",
        Rule::add_op => "'+' or '-'",
        Rule::mul_op => "'*', '/' or '%'",
        other => return format!("{other:?}"),
    };
    text.to_string()
}

/// The next child of a parse node. Present whenever the grammar matched.
pub(crate) fn next_child<'i>(
    pairs: &mut Pairs<'i, Rule>,
    parent: &Pair<'i, Rule>,
) -> Result<Pair<'i, Rule>, SourceError> {
    pairs
        .next()
        .ok_or_else(|| SourceError::at(parent, "malformed syntax tree"))
}

/// Parses `-D NAME` / `-D NAME=VALUE` / `-DNAME=VALUE` from a build option
/// string. Other options are returned untouched for logging.
pub fn macros_from_options(options: &str) -> Result<(Macros, Vec<String>), SourceError> {
    let mut macros = Macros::new();
    let mut ignored = Vec::new();
    let mut words = options.split_whitespace();

    while let Some(word) = words.next() {
        let definition = if word == "-D" {
            words
                .next()
                .ok_or_else(|| SourceError::new(0, 0, "'-D' needs a macro name"))?
        } else if let Some(rest) = word.strip_prefix("-D") {
            rest
        } else {
            ignored.push(word.to_string());
            continue;
        };

        let (name, value) = definition.split_once('=').unwrap_or((definition, "1"));
        if name.is_empty() {
            return Err(SourceError::new(0, 0, "empty macro name in build options"));
        }
        if !is_identifier(name) {
            return Err(SourceError::new(0, 0, format!("invalid macro name '{name}'")));
        }
        macros.insert(name.to_string(), value.to_string());
    }

    Ok((macros, ignored))
}

pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Rejects sources nested deeper than [`MAX_NESTING`] before they reach the
/// parser, which recurses once per level.
///
/// Every open bracket is a level. So is each `if`/`for`/`while`/`do`/`else`
/// whose statement has not ended by a `;` or a closing brace, which covers
/// unbraced chains like `if (a) if (b) ...`. The count can overestimate but
/// never underestimates.
pub fn check_nesting(source: &str) -> Result<(), SourceError> {
    let chars: Vec<char> = source.chars().collect();
    // Pending control keywords per open bracket; the first entry is the file.
    let mut frames: Vec<usize> = vec![0];
    let mut depth = 0usize;
    let (mut line, mut column) = (1usize, 1usize);
    let mut i = 0;

    while let Some(&c) = chars.get(i) {
        let mut opened = false;
        let end = match c {
            '/' if chars.get(i + 1) == Some(&'/') => {
                find(&chars, i + 2, "\n").unwrap_or(chars.len())
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                find(&chars, i + 2, "*/").map_or(chars.len(), |end| end + 2)
            }
            '"' | '\'' => literal_end(&chars, i),
            c if c.is_ascii_alphabetic() || c == '_' => {
                let end = (i..chars.len())
                    .find(|&j| !(chars[j].is_ascii_alphanumeric() || chars[j] == '_'))
                    .unwrap_or(chars.len());
                let word: String = chars[i..end].iter().collect();
                if matches!(word.as_str(), "if" | "else" | "for" | "while" | "do") {
                    if let Some(pending) = frames.last_mut() {
                        *pending += 1;
                    }
                    opened = true;
                }
                end
            }
            '(' | '[' | '{' => {
                frames.push(0);
                opened = true;
                i + 1
            }
            ')' | ']' | '}' => {
                if frames.len() > 1 {
                    let pending = frames.pop().unwrap_or(0);
                    depth -= 1 + pending;
                    if c == '}' {
                        end_statement(&mut frames, &mut depth);
                    }
                }
                i + 1
            }
            ';' => {
                end_statement(&mut frames, &mut depth);
                i + 1
            }
            _ => i + 1,
        };

        if opened {
            depth += 1;
            if depth > MAX_NESTING {
                return Err(SourceError::new(
                    line,
                    column,
                    format!("code is nested more than {MAX_NESTING} levels deep"),
                ));
            }
        }
        for &ch in &chars[i..end] {
            if ch == '\n' {
                line += 1;
                column = 1;
            } else {
                column += 1;
            }
        }
        i = end;
    }
    Ok(())
}

fn end_statement(frames: &mut [usize], depth: &mut usize) {
    if let Some(pending) = frames.last_mut() {
        *depth -= *pending;
        *pending = 0;
    }
}

fn find(chars: &[char], from: usize, pattern: &str) -> Option<usize> {
    let pattern: Vec<char> = pattern.chars().collect();
    (from..chars.len()).find(|&i| chars[i..].starts_with(&pattern))
}

/// End of a string or character literal starting at `start`.
fn literal_end(chars: &[char], start: usize) -> usize {
    let quote = chars[start];
    let mut i = start + 1;
    while let Some(&c) = chars.get(i) {
        match c {
            '\\' => i += 2,
            '\n' => return i,
            c if c == quote => return i + 1,
            _ => i += 1,
        }
    }
    chars.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_macros_from_options() {
        let (macros, ignored) =
            macros_from_options("-D SCALE=2.0f -DFAST -cl-mad-enable").unwrap();
        assert_eq!(macros["SCALE"], "2.0f");
        assert_eq!(macros["FAST"], "1");
        assert_eq!(ignored, vec!["-cl-mad-enable".to_string()]);

        assert!(macros_from_options("-D").is_err());
        assert!(macros_from_options("-D=3").is_err());
        assert!(macros_from_options("-D 9X=1").is_err());
    }

    #[test]
    fn test_nesting_limit() {
        let shallow = format!("{}1{}", "(".repeat(MAX_NESTING), ")".repeat(MAX_NESTING));
        assert!(check_nesting(&shallow).is_ok());

        let deep = format!("x =\n  {}1{}", "(".repeat(300), ")".repeat(300));
        let err = check_nesting(&deep).unwrap_err();
        assert_eq!((err.line, err.column), (2, 3 + MAX_NESTING));

        // sequential statements do not accumulate
        let flat = "if (a) x = 1; else if (b) x = 2; else x = 3;\n".repeat(100);
        assert!(check_nesting(&flat).is_ok());
        let chained = format!("{}x = 1;", "if (a) ".repeat(MAX_NESTING + 1));
        assert!(check_nesting(&chained).is_err());
    }

    #[test]
    fn test_nesting_skips_comments_and_literals() {
        let src = format!("/* {} */ // {}\n\"{}\" '('", "(".repeat(100), "{".repeat(100), "[".repeat(100));
        assert!(check_nesting(&src).is_ok());
    }
}
