//! Static analysis of submitted source.
//!
//! The analyzer tokenizes the code, recovers its block structure and walks
//! it looking for imports outside the whitelist, calls matching the
//! blacklist and references to interpreter internals. It also measures
//! complexity. Nothing here executes the code.
//!
//! Only syntactically direct uses are caught: `getattr(os, 'system')()` or a
//! string-built import name are invisible here. The restricted namespace and
//! the read-only module views in the child are what stop those at run time.

pub mod lexer;
pub mod syntax;

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;

use crate::config::AnalyzerConfig;
use crate::registry::{module_root, Registry};

use lexer::{SyntaxError, Token, TokenKind};
use syntax::{Stmt, StmtKind};

/// Overall verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SafetyStatus {
    Safe,
    Warning,
    Dangerous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Reported, does not block execution.
    Warning,
    /// Blocks execution.
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Syntax,
    ForbiddenImport,
    ForbiddenCall,
    ForbiddenAttribute,
    Complexity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityIssue {
    pub kind: IssueKind,
    pub severity: Severity,
    pub line: usize,
    pub column: usize,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ComplexityMetrics {
    /// Non-blank, non-comment lines.
    pub lines_of_code: usize,
    pub cyclomatic_complexity: usize,
    /// Deepest block nesting; straight-line code is 0.
    pub nesting_depth: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub status: SafetyStatus,
    pub is_safe: bool,
    pub issues: Vec<SecurityIssue>,
    /// Imported module roots.
    pub imports: BTreeSet<String>,
    /// Imported roots outside the whitelist.
    pub forbidden_imports: BTreeSet<String>,
    /// Every statically resolved call target.
    pub function_calls: BTreeSet<String>,
    /// Call targets matching the blacklist.
    pub dangerous_calls: BTreeSet<String>,
    pub complexity: ComplexityMetrics,
}

impl ValidationResult {
    fn from_issues(
        issues: Vec<SecurityIssue>,
        imports: BTreeSet<String>,
        forbidden_imports: BTreeSet<String>,
        function_calls: BTreeSet<String>,
        dangerous_calls: BTreeSet<String>,
        complexity: ComplexityMetrics,
    ) -> Self {
        let status = if issues.iter().any(|i| i.severity == Severity::Critical) {
            SafetyStatus::Dangerous
        } else if issues.is_empty() {
            SafetyStatus::Safe
        } else {
            SafetyStatus::Warning
        };
        Self {
            status,
            is_safe: status != SafetyStatus::Dangerous,
            issues,
            imports,
            forbidden_imports,
            function_calls,
            dangerous_calls,
            complexity,
        }
    }

    fn syntax_error(error: &SyntaxError, lines_of_code: usize) -> Self {
        let issue = SecurityIssue {
            kind: IssueKind::Syntax,
            severity: Severity::Critical,
            line: error.line,
            column: error.column,
            message: format!("syntax error: {}", error.message),
            suggestion: None,
        };
        Self::from_issues(
            vec![issue],
            BTreeSet::new(),
            BTreeSet::new(),
            BTreeSet::new(),
            BTreeSet::new(),
            ComplexityMetrics {
                lines_of_code,
                ..ComplexityMetrics::default()
            },
        )
    }

    /// The issue that decides a rejection: the first critical one.
    pub fn first_blocking_issue(&self) -> Option<&SecurityIssue> {
        self.issues
            .iter()
            .find(|i| i.severity == Severity::Critical)
    }

    /// Whether the code failed to parse.
    pub fn is_syntax_error(&self) -> bool {
        self.issues.iter().any(|i| i.kind == IssueKind::Syntax)
    }
}

/// Stateless analyzer over a shared registry.
#[derive(Debug, Clone)]
pub struct Analyzer {
    registry: Arc<Registry>,
    config: AnalyzerConfig,
}

impl Analyzer {
    pub fn new(registry: Arc<Registry>, config: AnalyzerConfig) -> Self {
        Self { registry, config }
    }

    pub fn analyze(&self, code: &str) -> ValidationResult {
        let lines_of_code = count_lines_of_code(code);

        let tree = match lexer::tokenize(code).and_then(|tokens| syntax::parse(&tokens)) {
            Ok(tree) => tree,
            Err(e) => return ValidationResult::syntax_error(&e, lines_of_code),
        };

        let mut walk = Walk::new(&self.registry);
        walk.block(&tree, 0);

        let complexity = ComplexityMetrics {
            lines_of_code,
            cyclomatic_complexity: 1 + walk.branches,
            nesting_depth: walk.max_depth,
        };

        if complexity.nesting_depth > self.config.max_nesting_depth {
            let (line, column) = walk.deepest;
            walk.issues.push(SecurityIssue {
                kind: IssueKind::Complexity,
                severity: Severity::Warning,
                line,
                column,
                message: format!(
                    "nesting depth {} exceeds limit of {}",
                    complexity.nesting_depth, self.config.max_nesting_depth
                ),
                suggestion: Some("Move nested logic into helper functions".into()),
            });
        }
        if complexity.cyclomatic_complexity > self.config.max_cyclomatic_complexity {
            walk.issues.push(SecurityIssue {
                kind: IssueKind::Complexity,
                severity: Severity::Warning,
                line: 1,
                column: 0,
                message: format!(
                    "cyclomatic complexity {} exceeds limit of {}",
                    complexity.cyclomatic_complexity, self.config.max_cyclomatic_complexity
                ),
                suggestion: Some("Split the code into smaller functions".into()),
            });
        }

        ValidationResult::from_issues(
            walk.issues,
            walk.imports,
            walk.forbidden_imports,
            walk.function_calls,
            walk.dangerous_calls,
            complexity,
        )
    }
}

fn count_lines_of_code(code: &str) -> usize {
    code.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .count()
}

/// Keywords that add a decision point.
const BRANCH_KEYWORDS: &[&str] = &["if", "elif", "for", "while", "except", "and", "or"];

struct Walk<'a> {
    registry: &'a Registry,
    issues: Vec<SecurityIssue>,
    imports: BTreeSet<String>,
    forbidden_imports: BTreeSet<String>,
    function_calls: BTreeSet<String>,
    dangerous_calls: BTreeSet<String>,
    branches: usize,
    max_depth: usize,
    deepest: (usize, usize),
}

impl<'a> Walk<'a> {
    fn new(registry: &'a Registry) -> Self {
        Self {
            registry,
            issues: Vec::new(),
            imports: BTreeSet::new(),
            forbidden_imports: BTreeSet::new(),
            function_calls: BTreeSet::new(),
            dangerous_calls: BTreeSet::new(),
            branches: 0,
            max_depth: 0,
            deepest: (1, 0),
        }
    }

    fn block(&mut self, stmts: &[Stmt], depth: usize) {
        for stmt in stmts {
            match &stmt.kind {
                StmtKind::Import(modules) => {
                    for module in modules {
                        self.import(module, stmt);
                    }
                }
                StmtKind::ImportFrom { module, level } => {
                    if *level > 0 {
                        self.critical(
                            IssueKind::ForbiddenImport,
                            stmt.line,
                            stmt.column,
                            "relative imports are not allowed".into(),
                            None,
                        );
                    } else if let Some(module) = module {
                        self.import(module, stmt);
                    }
                }
                StmtKind::Compound(keyword) => {
                    if keyword == "case" {
                        self.branches += 1;
                    }
                    if depth + 1 > self.max_depth {
                        self.max_depth = depth + 1;
                        self.deepest = (stmt.line, stmt.column);
                    }
                }
                StmtKind::Simple => {}
            }
            // `import x` is fully judged by the import rules above.
            if !matches!(stmt.kind, StmtKind::Import(_)) {
                self.tokens(&stmt.tokens);
            }
            self.block(&stmt.body, depth + 1);
        }
    }

    fn import(&mut self, module: &str, stmt: &Stmt) {
        let root = module_root(module);
        self.imports.insert(root.to_string());
        if self.registry.is_module_allowed(root) {
            return;
        }
        self.forbidden_imports.insert(root.to_string());
        let allowed: Vec<&str> = self.registry.allowed_modules().collect();
        self.critical(
            IssueKind::ForbiddenImport,
            stmt.line,
            stmt.column,
            format!("import of module '{root}' is not allowed"),
            Some(format!("Allowed modules: {}", allowed.join(", "))),
        );
    }

    fn tokens(&mut self, tokens: &[Token]) {
        for (i, token) in tokens.iter().enumerate() {
            match &token.kind {
                TokenKind::Str(fields) => {
                    for field in fields {
                        let inner = lexer::tokenize_fragment(&field.source, field.line, field.column);
                        self.tokens(&inner);
                    }
                }
                TokenKind::Name => {
                    if BRANCH_KEYWORDS.contains(&token.text.as_str()) {
                        self.branches += 1;
                    } else if self.registry.is_attribute_blocked(&token.text) {
                        self.critical(
                            IssueKind::ForbiddenAttribute,
                            token.line,
                            token.column,
                            format!("access to '{}' is not allowed", token.text),
                            None,
                        );
                    } else if self.registry.is_module_name_blocked(&token.text) {
                        self.critical(
                            IssueKind::ForbiddenAttribute,
                            token.line,
                            token.column,
                            format!("reference to module '{}' is not allowed", token.text),
                            Some("Only whitelisted modules may be used".into()),
                        );
                    }
                }
                TokenKind::Op if token.text == "(" => {
                    if let Some(chain) = call_chain(&tokens[..i]) {
                        self.call(&chain, &tokens[i + 1 - chain.len() * 2]);
                    }
                }
                _ => {}
            }
        }
    }

    fn call(&mut self, chain: &[&str], at: &Token) {
        let target = chain.join(".");
        if let Some(pattern) = self.registry.blocked_call(chain) {
            let message = if pattern.as_str() == target {
                format!("call to '{target}' is not allowed")
            } else {
                format!("call to '{target}' is not allowed (matches '{pattern}')")
            };
            self.critical(IssueKind::ForbiddenCall, at.line, at.column, message, None);
            self.dangerous_calls.insert(target.clone());
        }
        self.function_calls.insert(target);
    }

    fn critical(
        &mut self,
        kind: IssueKind,
        line: usize,
        column: usize,
        message: String,
        suggestion: Option<String>,
    ) {
        self.issues.push(SecurityIssue {
            kind,
            severity: Severity::Critical,
            line,
            column,
            message,
            suggestion,
        });
    }
}

/// Resolve the `a.b.c` chain ending right before a `(`.
///
/// Returns `None` when the parenthesis does not follow a name (a call on a
/// subscript or call result, a tuple, a keyword) or when the name is being
/// defined by `def`/`class`.
fn call_chain<'t>(before: &'t [Token]) -> Option<Vec<&'t str>> {
    let mut end = before.len();
    let mut chain = Vec::new();
    loop {
        let name = before.get(end.checked_sub(1)?)?;
        if !name.is_identifier() {
            return None;
        }
        chain.push(name.text.as_str());
        end -= 1;
        let dotted = end >= 2 && before[end - 1].is_op(".") && before[end - 2].is_identifier();
        if !dotted {
            break;
        }
        end -= 1;
    }
    if end > 0 && (before[end - 1].is_keyword("def") || before[end - 1].is_keyword("class")) {
        return None;
    }
    chain.reverse();
    Some(chain)
}
