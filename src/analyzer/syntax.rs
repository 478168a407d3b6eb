//! Block-structured statement tree.
//!
//! This is not a full Python grammar. It recovers the statement structure
//! the analyzer needs: which logical lines are imports, which open a block,
//! and how blocks nest. Expression-level errors are left to the child's
//! `compile()`.

use super::lexer::{SyntaxError, Token, TokenKind};

/// Keywords that open a block.
const COMPOUND_KEYWORDS: &[&str] = &[
    "if", "elif", "else", "for", "while", "try", "except", "finally", "with", "def", "class",
    "async",
];

/// Soft keywords that open a block only when the line ends with `:`.
const SOFT_COMPOUND_KEYWORDS: &[&str] = &["match", "case"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StmtKind {
    /// `import a.b, c as d`; holds the dotted module names.
    Import(Vec<String>),
    /// `from .a import b`; `level` counts leading dots.
    ImportFrom {
        module: Option<String>,
        level: usize,
    },
    /// A block-opening statement, keyed by its leading keyword.
    Compound(String),
    Simple,
}

#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub line: usize,
    pub column: usize,
    /// The statement's own tokens. For compound statements, the header up
    /// to (not including) the colon.
    pub tokens: Vec<Token>,
    pub body: Vec<Stmt>,
}

impl Stmt {
    pub fn is_compound(&self) -> bool {
        matches!(self.kind, StmtKind::Compound(_))
    }
}

/// Build the statement tree for a tokenized module.
pub fn parse(tokens: &[Token]) -> Result<Vec<Stmt>, SyntaxError> {
    Parser { tokens, pos: 0 }.block(false)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn block(&mut self, nested: bool) -> Result<Vec<Stmt>, SyntaxError> {
        let mut stmts = Vec::new();
        while let Some(token) = self.tokens.get(self.pos) {
            match token.kind {
                TokenKind::EndMarker => break,
                TokenKind::Dedent => {
                    self.pos += 1;
                    if nested {
                        break;
                    }
                }
                TokenKind::Indent => {
                    return Err(SyntaxError::new(token.line, token.column, "unexpected indent"));
                }
                TokenKind::Newline => self.pos += 1,
                _ => self.statement(&mut stmts)?,
            }
        }
        Ok(stmts)
    }

    /// Consume one logical line, returning its tokens without the newline.
    fn logical_line(&mut self) -> &'a [Token] {
        let start = self.pos;
        while self
            .tokens
            .get(self.pos)
            .is_some_and(|t| !matches!(t.kind, TokenKind::Newline | TokenKind::EndMarker))
        {
            self.pos += 1;
        }
        let line = &self.tokens[start..self.pos];
        if self
            .tokens
            .get(self.pos)
            .is_some_and(|t| t.kind == TokenKind::Newline)
        {
            self.pos += 1;
        }
        line
    }

    fn statement(&mut self, out: &mut Vec<Stmt>) -> Result<(), SyntaxError> {
        let line = self.logical_line();
        let Some(first) = line.first() else {
            return Ok(());
        };

        if !opens_block(line) {
            out.extend(simple_statements(line)?);
            return Ok(());
        }

        let Some(colon) = header_colon(line) else {
            let last = line.last().unwrap_or(first);
            return Err(SyntaxError::new(last.line, last.column + last.text.chars().count(), "expected ':'"));
        };
        let rest = &line[colon + 1..];

        let body = if rest.is_empty() {
            match self.tokens.get(self.pos) {
                Some(t) if t.kind == TokenKind::Indent => {
                    self.pos += 1;
                    self.block(true)?
                }
                next => {
                    let (line_no, column) = next.map_or((first.line + 1, 0), |t| (t.line, t.column));
                    return Err(SyntaxError::new(
                        line_no,
                        column,
                        format!(
                            "expected an indented block after '{}' statement on line {}",
                            first.text, first.line
                        ),
                    ));
                }
            }
        } else {
            simple_statements(rest)?
        };

        out.push(Stmt {
            kind: StmtKind::Compound(first.text.clone()),
            line: first.line,
            column: first.column,
            tokens: line[..colon].to_vec(),
            body,
        });
        Ok(())
    }
}

fn opens_block(line: &[Token]) -> bool {
    let Some(first) = line.first() else {
        return false;
    };
    if first.kind != TokenKind::Name {
        return false;
    }
    if COMPOUND_KEYWORDS.contains(&first.text.as_str()) {
        return true;
    }
    SOFT_COMPOUND_KEYWORDS.contains(&first.text.as_str())
        && line.len() > 2
        && line.last().is_some_and(|t| t.is_op(":"))
        && !line[1].is_op("=")
        && !line[1].is_op(".")
}

/// Index of the colon that ends a block header: the first one outside
/// brackets that does not belong to a `lambda`.
fn header_colon(line: &[Token]) -> Option<usize> {
    let mut depth = 0usize;
    let mut lambdas = 0usize;
    for (i, token) in line.iter().enumerate() {
        if token.kind == TokenKind::Op {
            match token.text.as_str() {
                "(" | "[" | "{" => depth += 1,
                ")" | "]" | "}" => depth = depth.saturating_sub(1),
                ":" if depth == 0 => {
                    if lambdas == 0 {
                        return Some(i);
                    }
                    lambdas -= 1;
                }
                _ => {}
            }
        } else if depth == 0 && token.is_keyword("lambda") {
            lambdas += 1;
        }
    }
    None
}

/// Split a run of simple statements on `;` and classify each.
fn simple_statements(tokens: &[Token]) -> Result<Vec<Stmt>, SyntaxError> {
    let mut stmts = Vec::new();
    for segment in tokens.split(|t| t.is_op(";")) {
        let Some(first) = segment.first() else {
            continue;
        };
        if first.kind == TokenKind::Name && COMPOUND_KEYWORDS.contains(&first.text.as_str()) {
            return Err(SyntaxError::new(first.line, first.column, "invalid syntax"));
        }
        let kind = if first.is_keyword("import") {
            parse_import(segment)?
        } else if first.is_keyword("from") {
            parse_import_from(segment)?
        } else {
            StmtKind::Simple
        };
        stmts.push(Stmt {
            kind,
            line: first.line,
            column: first.column,
            tokens: segment.to_vec(),
            body: Vec::new(),
        });
    }
    Ok(stmts)
}

/// Read `Name ('.' Name)*` starting at `pos`.
fn dotted_name(tokens: &[Token], mut pos: usize) -> Option<(String, usize)> {
    let mut name = String::new();
    loop {
        let token = tokens.get(pos).filter(|t| t.is_identifier())?;
        name.push_str(&token.text);
        pos += 1;
        if tokens.get(pos).is_some_and(|t| t.is_op(".")) {
            name.push('.');
            pos += 1;
        } else {
            return Some((name, pos));
        }
    }
}

fn invalid(token: &Token) -> SyntaxError {
    SyntaxError::new(token.line, token.column, "invalid syntax")
}

fn parse_import(segment: &[Token]) -> Result<StmtKind, SyntaxError> {
    let mut modules = Vec::new();
    let mut pos = 1;
    loop {
        let at = segment.get(pos).unwrap_or(&segment[0]);
        let (name, next) = dotted_name(segment, pos).ok_or_else(|| invalid(at))?;
        modules.push(name);
        pos = next;
        if segment.get(pos).is_some_and(|t| t.is_keyword("as")) {
            let alias = segment.get(pos + 1).filter(|t| t.is_identifier());
            if alias.is_none() {
                return Err(invalid(&segment[pos]));
            }
            pos += 2;
        }
        match segment.get(pos) {
            None => return Ok(StmtKind::Import(modules)),
            Some(t) if t.is_op(",") => pos += 1,
            Some(t) => return Err(invalid(t)),
        }
    }
}

fn parse_import_from(segment: &[Token]) -> Result<StmtKind, SyntaxError> {
    let mut level = 0;
    let mut pos = 1;
    while let Some(token) = segment.get(pos) {
        match token.text.as_str() {
            "." if token.kind == TokenKind::Op => level += 1,
            "..." if token.kind == TokenKind::Op => level += 3,
            _ => break,
        }
        pos += 1;
    }

    let module = match dotted_name(segment, pos) {
        Some((name, next)) => {
            pos = next;
            Some(name)
        }
        None => None,
    };

    let at = segment.get(pos).unwrap_or(&segment[0]);
    if (module.is_none() && level == 0) || !at.is_keyword("import") {
        return Err(invalid(at));
    }
    Ok(StmtKind::ImportFrom { module, level })
}
