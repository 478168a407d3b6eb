//! Python tokenizer.
//!
//! Produces the token stream the syntax tree is built from: names, numbers,
//! strings, operators and the layout tokens `Newline`, `Indent` and
//! `Dedent`. Comments are dropped. Newlines inside brackets and after a
//! backslash continuation are not significant, as in Python.
//!
//! f-string replacement fields are captured as [`Interpolation`]s so the
//! analyzer can scan the expressions inside them.

/// Python keywords. None of them can be called or bound.
pub const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return",
    "try", "while", "with", "yield",
];

pub fn is_keyword(name: &str) -> bool {
    KEYWORDS.contains(&name)
}

/// Operators, longest first so the scanner takes the maximal munch.
const OPERATORS: &[&str] = &[
    "**=", "//=", ">>=", "<<=", "...", "->", ":=", "==", "!=", "<=", ">=", "**", "//", "<<",
    ">>", "+=", "-=", "*=", "/=", "%=", "&=", "|=", "^=", "@=", "+", "-", "*", "/", "%", "@",
    "&", "|", "^", "~", "<", ">", ",", ":", ".", ";", "=", "(", ")", "[", "]", "{", "}",
];

const STRING_PREFIXES: &[&str] = &["r", "u", "b", "f", "br", "rb", "fr", "rf"];

/// An expression embedded in an f-string (`f"{expr}"`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpolation {
    pub source: String,
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Name,
    Number,
    Str(Vec<Interpolation>),
    Op,
    Newline,
    Indent,
    Dedent,
    EndMarker,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    /// 1-based line.
    pub line: usize,
    /// 0-based column, in characters.
    pub column: usize,
}

impl Token {
    pub fn is_op(&self, op: &str) -> bool {
        self.kind == TokenKind::Op && self.text == op
    }

    pub fn is_name(&self) -> bool {
        self.kind == TokenKind::Name
    }

    pub fn is_keyword(&self, keyword: &str) -> bool {
        self.kind == TokenKind::Name && self.text == keyword
    }

    /// A name that is not a keyword.
    pub fn is_identifier(&self) -> bool {
        self.kind == TokenKind::Name && !is_keyword(&self.text)
    }
}

/// A tokenizer or structure error with its source position.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}, column {column}: {message}")]
pub struct SyntaxError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl SyntaxError {
    pub fn new(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            column,
            message: message.into(),
        }
    }
}

/// Tokenize a module, including indentation tokens.
pub fn tokenize(source: &str) -> Result<Vec<Token>, SyntaxError> {
    Lexer::new(source, 1, 0, false).run()
}

/// Tokenize an expression fragment (an f-string field) starting at the
/// given position. Indentation is ignored and errors are skipped over.
pub fn tokenize_fragment(source: &str, line: usize, column: usize) -> Vec<Token> {
    Lexer::new(source, line, column, true)
        .run()
        .unwrap_or_default()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
    tokens: Vec<Token>,
    indents: Vec<usize>,
    brackets: Vec<(char, usize, usize)>,
    at_line_start: bool,
    fragment: bool,
}

impl Lexer {
    fn new(source: &str, line: usize, column: usize, fragment: bool) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line,
            column,
            tokens: Vec::new(),
            indents: vec![0],
            brackets: Vec::new(),
            at_line_start: !fragment,
            fragment,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 0;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn push(&mut self, kind: TokenKind, text: impl Into<String>, line: usize, column: usize) {
        self.tokens.push(Token {
            kind,
            text: text.into(),
            line,
            column,
        });
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError::new(self.line, self.column, message)
    }

    fn run(mut self) -> Result<Vec<Token>, SyntaxError> {
        loop {
            if self.at_line_start && self.brackets.is_empty() {
                if !self.indentation()? {
                    break;
                }
                continue;
            }

            let Some(c) = self.peek() else { break };
            match c {
                ' ' | '\t' | '\x0c' => {
                    self.advance();
                }
                '#' => self.skip_comment(),
                '\r' | '\n' => self.newline(),
                '\\' => {
                    let (line, column) = (self.line, self.column);
                    self.advance();
                    match self.peek() {
                        Some('\n') => {
                            self.advance();
                        }
                        Some('\r') => {
                            self.advance();
                            if self.peek() == Some('\n') {
                                self.advance();
                            }
                        }
                        _ if self.fragment => {}
                        _ => {
                            return Err(SyntaxError::new(
                                line,
                                column,
                                "unexpected character after line continuation character",
                            ))
                        }
                    }
                }
                '"' | '\'' => self.string("")?,
                c if c.is_ascii_digit() => self.number(),
                '.' if self.peek_at(1).is_some_and(|n| n.is_ascii_digit()) => self.number(),
                c if c.is_alphabetic() || c == '_' => self.name()?,
                _ => self.operator()?,
            }
        }
        self.finish()
    }

    /// Measure indentation at the start of a logical line and emit layout
    /// tokens. Blank and comment-only lines are consumed without output.
    /// Returns `false` at end of input.
    fn indentation(&mut self) -> Result<bool, SyntaxError> {
        let mut width = 0;
        loop {
            match self.peek() {
                Some(' ') => width += 1,
                Some('\t') => width = (width / 8 + 1) * 8,
                Some('\x0c') => width = 0,
                _ => break,
            }
            self.advance();
        }

        match self.peek() {
            None => return Ok(false),
            Some('#') => {
                self.skip_comment();
                self.skip_line_break();
                return Ok(true);
            }
            Some('\r' | '\n') => {
                self.skip_line_break();
                return Ok(true);
            }
            _ => {}
        }

        self.at_line_start = false;
        let current = self.indents.last().copied().unwrap_or(0);
        if width > current {
            self.indents.push(width);
            self.push(TokenKind::Indent, "", self.line, 0);
        } else if width < current {
            while self.indents.last().is_some_and(|&level| level > width) {
                self.indents.pop();
                self.push(TokenKind::Dedent, "", self.line, self.column);
            }
            if self.indents.last().copied() != Some(width) {
                return Err(self.error("unindent does not match any outer indentation level"));
            }
        }
        Ok(true)
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' || c == '\r' {
                break;
            }
            self.advance();
        }
    }

    fn skip_line_break(&mut self) {
        if self.peek() == Some('\r') {
            self.advance();
        }
        if self.peek() == Some('\n') {
            self.advance();
        }
    }

    fn newline(&mut self) {
        let (line, column) = (self.line, self.column);
        self.skip_line_break();
        if !self.brackets.is_empty() || self.fragment {
            return;
        }
        if self
            .tokens
            .last()
            .is_some_and(|t| !matches!(t.kind, TokenKind::Newline | TokenKind::Indent | TokenKind::Dedent))
        {
            self.push(TokenKind::Newline, "\n", line, column);
        }
        self.at_line_start = true;
    }

    fn number(&mut self) {
        let (line, column) = (self.line, self.column);
        let start = self.pos;
        let hex = self.peek() == Some('0') && matches!(self.peek_at(1), Some('x' | 'X'));
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                self.advance();
            } else if (c == '+' || c == '-')
                && !hex
                && matches!(self.chars.get(self.pos - 1), Some('e' | 'E'))
            {
                self.advance();
            } else {
                break;
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        self.push(TokenKind::Number, text, line, column);
    }

    fn name(&mut self) -> Result<(), SyntaxError> {
        let (line, column) = (self.line, self.column);
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                self.advance();
            } else {
                break;
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        if matches!(self.peek(), Some('"' | '\''))
            && STRING_PREFIXES.contains(&text.to_ascii_lowercase().as_str())
        {
            return self.string(&text.to_ascii_lowercase());
        }
        self.push(TokenKind::Name, text, line, column);
        Ok(())
    }

    /// Scan a string literal whose prefix (already consumed) is `prefix`.
    fn string(&mut self, prefix: &str) -> Result<(), SyntaxError> {
        let start_line = self.line;
        let start_column = self.column.saturating_sub(prefix.chars().count());
        let start = self.pos - prefix.chars().count();
        let Some(quote) = self.advance() else {
            return Err(self.error("unterminated string literal"));
        };
        let triple = self.peek() == Some(quote) && self.peek_at(1) == Some(quote);
        if triple {
            self.advance();
            self.advance();
        }
        let formatted = prefix.contains('f');
        let mut interpolations = Vec::new();

        loop {
            let Some(c) = self.peek() else {
                let message = if triple {
                    "unterminated triple-quoted string literal"
                } else {
                    "unterminated string literal"
                };
                return Err(SyntaxError::new(start_line, start_column, message));
            };
            match c {
                '\\' => {
                    self.advance();
                    self.advance();
                }
                '\n' | '\r' if !triple => {
                    return Err(SyntaxError::new(
                        start_line,
                        start_column,
                        "unterminated string literal",
                    ));
                }
                c if c == quote => {
                    if !triple {
                        self.advance();
                        break;
                    }
                    if self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote) {
                        self.advance();
                        self.advance();
                        self.advance();
                        break;
                    }
                    self.advance();
                }
                '{' if formatted => {
                    if self.peek_at(1) == Some('{') {
                        self.advance();
                        self.advance();
                    } else if let Some(field) = self.replacement_field(quote, triple) {
                        interpolations.push(field);
                    }
                }
                _ => {
                    self.advance();
                }
            }
        }

        let text: String = self.chars[start..self.pos].iter().collect();
        self.push(TokenKind::Str(interpolations), text, start_line, start_column);
        Ok(())
    }

    /// Capture an f-string replacement field, leaving the cursor on the
    /// closing brace's successor. Stops early (without consuming) at the
    /// string's closing quote.
    fn replacement_field(&mut self, quote: char, triple: bool) -> Option<Interpolation> {
        self.advance();
        let (line, column) = (self.line, self.column);
        let start = self.pos;
        let mut depth = 1usize;
        while let Some(c) = self.peek() {
            if c == quote
                && (!triple || (self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote)))
            {
                break;
            }
            if (c == '\n' || c == '\r') && !triple {
                break;
            }
            match c {
                '{' | '[' | '(' => depth += 1,
                '}' | ']' | ')' => {
                    depth -= 1;
                    if depth == 0 {
                        let source: String = self.chars[start..self.pos].iter().collect();
                        self.advance();
                        return Some(Interpolation {
                            source,
                            line,
                            column,
                        });
                    }
                }
                _ => {}
            }
            self.advance();
        }
        let source: String = self.chars[start..self.pos].iter().collect();
        Some(Interpolation {
            source,
            line,
            column,
        })
    }

    fn operator(&mut self) -> Result<(), SyntaxError> {
        let (line, column) = (self.line, self.column);
        let matched = OPERATORS.iter().copied().find(|op| {
            op.chars()
                .enumerate()
                .all(|(i, c)| self.peek_at(i) == Some(c))
        });

        let Some(op) = matched else {
            let c = self.peek().unwrap_or(' ');
            if self.fragment {
                self.advance();
                return Ok(());
            }
            return Err(self.error(format!("invalid character '{c}'")));
        };

        for _ in 0..op.len() {
            self.advance();
        }

        match op {
            "(" | "[" | "{" => {
                let open = op.chars().next().unwrap_or('(');
                self.brackets.push((open, line, column));
            }
            ")" | "]" | "}" => {
                let close = op.chars().next().unwrap_or(')');
                match self.brackets.pop() {
                    Some((open, _, _)) if matching(open) == close => {}
                    Some((open, _, _)) if !self.fragment => {
                        return Err(SyntaxError::new(
                            line,
                            column,
                            format!(
                                "closing parenthesis '{close}' does not match opening parenthesis '{open}'"
                            ),
                        ));
                    }
                    None if !self.fragment => {
                        return Err(SyntaxError::new(line, column, format!("unmatched '{close}'")));
                    }
                    _ => {}
                }
            }
            _ => {}
        }

        self.push(TokenKind::Op, op, line, column);
        Ok(())
    }

    fn finish(mut self) -> Result<Vec<Token>, SyntaxError> {
        if !self.fragment {
            if let Some(&(open, line, column)) = self.brackets.first() {
                return Err(SyntaxError::new(
                    line,
                    column,
                    format!("'{open}' was never closed"),
                ));
            }
            if self
                .tokens
                .last()
                .is_some_and(|t| !matches!(t.kind, TokenKind::Newline | TokenKind::Dedent))
            {
                self.push(TokenKind::Newline, "\n", self.line, self.column);
            }
            while self.indents.len() > 1 {
                self.indents.pop();
                self.push(TokenKind::Dedent, "", self.line, 0);
            }
        }
        self.push(TokenKind::EndMarker, "", self.line, self.column);
        Ok(self.tokens)
    }
}

const fn matching(open: char) -> char {
    match open {
        '(' => ')',
        '[' => ']',
        _ => '}',
    }
}
