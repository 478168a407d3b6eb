//! Whitelist/blacklist tables shared by the analyzer and the namespace builder.
//!
//! A [`Registry`] is built once from configuration at startup and handed out
//! as `Arc<Registry>`. Nothing mutates it afterwards, so concurrent executions
//! read it without locking.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::RegistryConfig;

/// Import roots that sandboxed code may import.
pub const DEFAULT_ALLOWED_MODULES: &[&str] = &[
    "numpy",
    "pandas",
    "math",
    "statistics",
    "datetime",
    "time",
    "decimal",
    "fractions",
    "random",
    "itertools",
    "functools",
    "collections",
    "operator",
    "re",
    "json",
    "typing",
    "heapq",
    "bisect",
    "copy",
    "string",
];

/// Library handles placed into every namespace, as `(alias, module)`.
pub const DEFAULT_PRELOADED: &[(&str, &str)] = &[
    ("np", "numpy"),
    ("pd", "pandas"),
    ("math", "math"),
    ("statistics", "statistics"),
    ("datetime", "datetime"),
];

/// Call patterns rejected by the analyzer.
pub const DEFAULT_BLOCKED_CALLS: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "__import__",
    "open",
    "input",
    "breakpoint",
    "globals",
    "locals",
    "vars",
    "getattr",
    "setattr",
    "delattr",
    "exit",
    "quit",
    "help",
    "os.*",
    "sys.*",
    "subprocess.*",
    "shutil.*",
    "socket.*",
    "ctypes.*",
    "importlib.*",
    "pickle.*",
    "marshal.*",
    "builtins.*",
    "pd.read_*",
    "pandas.read_*",
    "np.load",
    "np.loadtxt",
    "np.genfromtxt",
    "np.fromfile",
    "np.save",
    "np.savez",
    "np.savetxt",
    "numpy.load",
    "numpy.loadtxt",
    "numpy.genfromtxt",
    "numpy.fromfile",
    "numpy.save",
    "numpy.savez",
    "numpy.savetxt",
    "tofile",
    "to_pickle",
    "to_csv",
    "to_excel",
    "to_parquet",
    "to_hdf",
];

/// Attribute names that give access to interpreter internals.
pub const DEFAULT_BLOCKED_ATTRIBUTES: &[&str] = &[
    "__class__",
    "__base__",
    "__bases__",
    "__mro__",
    "__subclasses__",
    "__globals__",
    "__builtins__",
    "__code__",
    "__closure__",
    "__func__",
    "__self__",
    "__dict__",
    "__getattribute__",
    "__reduce__",
    "__reduce_ex__",
    "__loader__",
    "__spec__",
    "__import__",
    "f_globals",
    "f_locals",
    "f_back",
    "f_builtins",
    "gi_frame",
    "gi_code",
    "cr_frame",
    "tb_frame",
];

/// Names that evaluate to a non-whitelisted module, directly or as the
/// private alias a whitelisted module keeps for it (`typing.sys`,
/// `random._os`). Any reference to one is rejected, call or not.
pub const DEFAULT_BLOCKED_MODULE_NAMES: &[&str] = &[
    "os",
    "_os",
    "posix",
    "nt",
    "sys",
    "_sys",
    "modules",
    "subprocess",
    "_subprocess",
    "_posixsubprocess",
    "shutil",
    "socket",
    "_socket",
    "builtins",
    "_builtins",
    "importlib",
    "_imp",
    "ctypes",
    "ctypeslib",
    "pickle",
    "marshal",
];

/// Builtins exposed to sandboxed code.
pub const DEFAULT_BUILTINS: &[&str] = &[
    // constructors and conversions
    "bool",
    "int",
    "float",
    "complex",
    "str",
    "bytes",
    "bytearray",
    "list",
    "tuple",
    "dict",
    "set",
    "frozenset",
    "slice",
    "object",
    "type",
    "bin",
    "hex",
    "oct",
    "chr",
    "ord",
    "ascii",
    "repr",
    "format",
    "hash",
    // arithmetic and aggregation
    "abs",
    "divmod",
    "pow",
    "round",
    "sum",
    "min",
    "max",
    "all",
    "any",
    // iteration
    "len",
    "range",
    "enumerate",
    "zip",
    "map",
    "filter",
    "sorted",
    "reversed",
    "iter",
    "next",
    // classes
    "isinstance",
    "issubclass",
    "callable",
    "super",
    "property",
    "staticmethod",
    "classmethod",
    "__build_class__",
    // output
    "print",
    // exceptions
    "Exception",
    "ArithmeticError",
    "AssertionError",
    "AttributeError",
    "FloatingPointError",
    "ImportError",
    "IndexError",
    "KeyError",
    "LookupError",
    "MemoryError",
    "NameError",
    "NotImplementedError",
    "OverflowError",
    "RecursionError",
    "RuntimeError",
    "StopIteration",
    "TypeError",
    "ValueError",
    "ZeroDivisionError",
    "Warning",
    "RuntimeWarning",
    "UserWarning",
    "DeprecationWarning",
    "NotImplemented",
    "Ellipsis",
];

/// Builtins that are never exposed, whatever the configuration says.
const NEVER_EXPOSED: &[&str] = &[
    "__import__",
    "open",
    "eval",
    "exec",
    "compile",
    "input",
    "breakpoint",
    "globals",
    "locals",
    "vars",
    "getattr",
    "setattr",
    "delattr",
    "dir",
    "help",
    "exit",
    "quit",
    "memoryview",
    "__loader__",
    "__spec__",
];

/// A library handle injected into the namespace before user code runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleHandle {
    /// Name the handle is bound to (e.g. `np`).
    pub alias: String,
    /// Module imported for it (e.g. `numpy`).
    pub module: String,
}

impl ModuleHandle {
    pub fn new(alias: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            module: module.into(),
        }
    }

    /// Root package of the module (`os.path` -> `os`).
    pub fn root(&self) -> &str {
        module_root(&self.module)
    }
}

/// Root package of a dotted module path.
pub fn module_root(module: &str) -> &str {
    module.split('.').next().unwrap_or(module)
}

/// A forbidden call pattern such as `eval`, `os.system` or `subprocess.*`.
///
/// Patterns match against the *suffix* of a statically resolved attribute
/// chain: `eval` matches `eval(...)` and `x.eval(...)`, `os.system` matches
/// `os.system(...)`. A `*` segment matches any segment and a trailing `*`
/// inside a segment is a prefix match (`read_*`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallPattern {
    raw: String,
    segments: Vec<String>,
}

impl CallPattern {
    pub fn parse(raw: &str) -> Self {
        Self {
            raw: raw.to_string(),
            segments: raw.split('.').map(str::to_string).collect(),
        }
    }

    /// Whether this is a single-segment pattern like `eval`.
    pub fn is_bare(&self) -> bool {
        self.segments.len() == 1 && !self.segments[0].contains('*')
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Check a resolved call chain (`["os", "system"]`) against the pattern.
    pub fn matches<S: AsRef<str>>(&self, chain: &[S]) -> bool {
        if chain.len() < self.segments.len() {
            return false;
        }
        let tail = &chain[chain.len() - self.segments.len()..];
        self.segments
            .iter()
            .zip(tail)
            .all(|(pattern, segment)| segment_matches(pattern, segment.as_ref()))
    }
}

impl fmt::Display for CallPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn segment_matches(pattern: &str, segment: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    pattern
        .strip_suffix('*')
        .map_or(pattern == segment, |prefix| segment.starts_with(prefix))
}

/// Process-wide, read-only capability tables.
#[derive(Debug, Clone)]
pub struct Registry {
    allowed_modules: BTreeSet<String>,
    preloaded: Vec<ModuleHandle>,
    blocked_calls: Vec<CallPattern>,
    blocked_attributes: BTreeSet<String>,
    blocked_module_names: BTreeSet<String>,
    builtins: Vec<String>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::from_config(&RegistryConfig::default())
    }
}

impl Registry {
    /// Build the registry from configuration.
    ///
    /// Builtins listed in the configuration that are reflection, IO or
    /// import primitives are dropped with a warning. Preloaded handles whose
    /// module root is not whitelisted are dropped the same way. Blocked
    /// module names that the configuration whitelists or preloads stay
    /// usable.
    pub fn from_config(config: &RegistryConfig) -> Self {
        let allowed_modules: BTreeSet<String> = config
            .allowed_modules
            .iter()
            .map(|m| module_root(m).to_string())
            .collect();

        let mut builtins = Vec::with_capacity(config.builtins.len());
        for name in &config.builtins {
            if NEVER_EXPOSED.contains(&name.as_str()) {
                warn!(builtin = %name, "Refusing to expose builtin to sandboxed code");
            } else if !builtins.contains(name) {
                builtins.push(name.clone());
            }
        }

        let preloaded = config
            .preloaded
            .iter()
            .filter(|handle| {
                let allowed = allowed_modules.contains(handle.root());
                if !allowed {
                    warn!(module = %handle.module, "Preloaded module is not whitelisted, skipping");
                }
                allowed
            })
            .cloned()
            .collect::<Vec<ModuleHandle>>();

        let blocked_module_names = config
            .blocked_module_names
            .iter()
            .filter(|name| {
                !allowed_modules.contains(name.as_str())
                    && !preloaded.iter().any(|h| &h.alias == *name)
            })
            .cloned()
            .collect();

        Self {
            allowed_modules,
            preloaded,
            blocked_calls: config
                .blocked_calls
                .iter()
                .map(|p| CallPattern::parse(p))
                .collect(),
            blocked_attributes: config.blocked_attributes.iter().cloned().collect(),
            blocked_module_names,
            builtins,
        }
    }

    /// Whether `root` may be imported.
    pub fn is_module_allowed(&self, root: &str) -> bool {
        self.allowed_modules.contains(root)
    }

    pub fn allowed_modules(&self) -> impl Iterator<Item = &str> {
        self.allowed_modules.iter().map(String::as_str)
    }

    /// First blocked pattern matching a call chain, if any.
    ///
    /// Bare patterns do not apply to functions reached through a whitelisted
    /// module or preloaded alias (`re.compile`, `pd.eval`); those modules are
    /// covered by their dotted patterns instead.
    pub fn blocked_call<S: AsRef<str>>(&self, chain: &[S]) -> Option<&CallPattern> {
        let through_module = chain.len() > 1
            && chain
                .first()
                .is_some_and(|head| self.is_module_name(head.as_ref()));
        self.blocked_calls
            .iter()
            .filter(|p| !(through_module && p.is_bare()))
            .find(|p| p.matches(chain))
    }

    fn is_module_name(&self, name: &str) -> bool {
        self.allowed_modules.contains(name) || self.preloaded.iter().any(|h| h.alias == name)
    }

    pub fn is_attribute_blocked(&self, name: &str) -> bool {
        self.blocked_attributes.contains(name)
    }

    /// Whether `name` refers to a module sandboxed code may not touch.
    pub fn is_module_name_blocked(&self, name: &str) -> bool {
        self.blocked_module_names.contains(name)
    }

    pub fn builtins(&self) -> &[String] {
        &self.builtins
    }

    pub fn preloaded(&self) -> &[ModuleHandle] {
        &self.preloaded
    }

    /// Names the namespace owns: builtins, preloaded aliases and bare blocked
    /// call names. Caller-supplied globals may never bind these.
    pub fn is_reserved_name(&self, name: &str) -> bool {
        self.builtins.iter().any(|b| b == name)
            || self.preloaded.iter().any(|h| h.alias == name)
            || NEVER_EXPOSED.contains(&name)
            || self
                .blocked_calls
                .iter()
                .any(|p| p.is_bare() && p.as_str() == name)
    }
}
