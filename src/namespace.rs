//! Restricted namespace construction.
//!
//! The namespace is described here and materialized in the child: the
//! harness starts from an empty dict, adds exactly the listed builtins,
//! imports the listed module handles and then merges the caller's globals.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::analyzer::lexer::is_keyword;
use crate::registry::{ModuleHandle, Registry};

/// Everything the child needs to build the execution scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionNamespace {
    /// Builtin names copied from the interpreter's builtins.
    pub builtins: Vec<String>,
    /// Library handles imported before user code runs.
    pub modules: Vec<ModuleHandle>,
    /// Import roots the guarded `__import__` admits.
    pub allowed_imports: Vec<String>,
    /// Caller-supplied variables, already filtered.
    pub globals: Map<String, Value>,
    /// Keys dropped from the caller's globals.
    #[serde(skip)]
    pub rejected_globals: Vec<String>,
}

impl ExecutionNamespace {
    /// Whether `name` is bound by the namespace itself rather than by user
    /// code.
    pub fn provides(&self, name: &str) -> bool {
        self.builtins.iter().any(|b| b == name)
            || self.modules.iter().any(|m| m.alias == name)
            || self.globals.contains_key(name)
    }
}

pub struct NamespaceBuilder<'a> {
    registry: &'a Registry,
}

impl<'a> NamespaceBuilder<'a> {
    pub fn new(registry: &'a Registry) -> Self {
        Self { registry }
    }

    /// Describe the namespace for one execution.
    ///
    /// Globals whose key could shadow a namespace-owned name, reach a dunder
    /// or not even be bound by Python are dropped.
    pub fn build(&self, extra_globals: &Map<String, Value>) -> ExecutionNamespace {
        let mut globals = Map::new();
        let mut rejected_globals = Vec::new();

        for (key, value) in extra_globals {
            if let Some(reason) = self.rejection(key) {
                warn!(key = %key, reason, "Dropping injected global");
                rejected_globals.push(key.clone());
            } else {
                globals.insert(key.clone(), value.clone());
            }
        }

        ExecutionNamespace {
            builtins: self.registry.builtins().to_vec(),
            modules: self.registry.preloaded().to_vec(),
            allowed_imports: self.registry.allowed_modules().map(str::to_string).collect(),
            globals,
            rejected_globals,
        }
    }

    fn rejection(&self, key: &str) -> Option<&'static str> {
        if !is_identifier(key) {
            Some("not an identifier")
        } else if is_keyword(key) {
            Some("keyword")
        } else if key.starts_with("__") {
            Some("dunder name")
        } else if self.registry.is_reserved_name(key) {
            Some("reserved name")
        } else {
            None
        }
    }
}

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn globals(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn builds_from_registry() {
        let registry = Registry::default();
        let ns = NamespaceBuilder::new(&registry).build(&Map::new());

        assert!(ns.builtins.iter().any(|b| b == "print"));
        assert!(!ns.builtins.iter().any(|b| b == "open"));
        assert!(ns.modules.contains(&ModuleHandle::new("np", "numpy")));
        assert!(ns.allowed_imports.iter().any(|m| m == "pandas"));
        assert!(ns.globals.is_empty());
        assert!(ns.provides("len"));
        assert!(ns.provides("pd"));
        assert!(!ns.provides("x"));
    }

    #[test]
    fn injects_plain_globals() {
        let registry = Registry::default();
        let ns = NamespaceBuilder::new(&registry)
            .build(&globals(json!({"window": 20, "symbols": ["AAPL", "MSFT"]})));

        assert_eq!(ns.globals["window"], json!(20));
        assert_eq!(ns.globals["symbols"], json!(["AAPL", "MSFT"]));
        assert!(ns.rejected_globals.is_empty());
        assert!(ns.provides("window"));
    }

    #[test]
    fn restricted_names_win_over_globals() {
        let registry = Registry::default();
        let ns = NamespaceBuilder::new(&registry).build(&globals(json!({
            "open": "smuggled",
            "print": 1,
            "np": null,
            "eval": "x",
            "__builtins__": {},
            "class": 1,
            "not valid": 2,
            "1abc": 3,
            "ok_name": 4,
        })));

        assert_eq!(ns.globals.len(), 1);
        assert_eq!(ns.globals["ok_name"], json!(4));
        let mut rejected = ns.rejected_globals.clone();
        rejected.sort();
        assert_eq!(
            rejected,
            ["1abc", "__builtins__", "class", "eval", "not valid", "np", "open", "print"]
        );
    }

    #[test]
    fn rejected_globals_are_not_serialized() {
        let registry = Registry::default();
        let ns = NamespaceBuilder::new(&registry).build(&globals(json!({"open": 1})));
        let json = serde_json::to_value(&ns).unwrap();
        assert!(json.get("rejected_globals").is_none());
        assert_eq!(json["globals"], json!({}));
    }

    #[test]
    fn identifier_rules() {
        assert!(is_identifier("x"));
        assert!(is_identifier("_private"));
        assert!(is_identifier("prix_2"));
        assert!(is_identifier("données"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("2x"));
        assert!(!is_identifier("a-b"));
    }
}
