//! Capability scope: the complete set of symbols executed code can reach.
//!
//! Every capability is exposed twice: as a free symbol in the component's
//! scope (`React`, `Recharts`, ...) and, optionally, as an import
//! specifier (`"react"`, `"recharts"`, ...) resolved by the module shim.
//! Whatever is not registered here does not exist for executed code.
pub mod builtin;

use std::collections::BTreeMap;
use std::fmt;

/// Names the module shim binds itself; a capability may not shadow them.
const RESERVED_SYMBOLS: &[&str] = &["require", "exports", "module"];

const JS_KEYWORDS: &[&str] = &[
    "await", "break", "case", "catch", "class", "const", "continue", "debugger", "default",
    "delete", "do", "else", "enum", "export", "extends", "false", "finally", "for", "function",
    "if", "import", "in", "instanceof", "let", "new", "null", "return", "static", "super",
    "switch", "this", "throw", "true", "try", "typeof", "var", "void", "while", "with", "yield",
];

/// One injectable implementation object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    /// Free identifier bound in the component's scope.
    pub symbol: String,
    /// Import specifier, if the capability is importable.
    pub specifier: Option<String>,
    /// JavaScript expression building the implementation. It is evaluated
    /// inside the engine's host runtime with `host` in scope.
    pub source: String,
}

impl Capability {
    pub fn new(symbol: &str, source: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            specifier: None,
            source: source.to_string(),
        }
    }

    pub fn importable_as(mut self, specifier: &str) -> Self {
        self.specifier = Some(specifier.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeError {
    InvalidSymbol(String),
    ReservedSymbol(String),
    DuplicateSymbol(String),
    InvalidSpecifier(String),
    DuplicateSpecifier(String),
}

impl fmt::Display for ScopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSymbol(s) => write!(f, "'{s}' is not a valid identifier"),
            Self::ReservedSymbol(s) => write!(f, "'{s}' is reserved by the module shim"),
            Self::DuplicateSymbol(s) => write!(f, "symbol '{s}' registered twice"),
            Self::InvalidSpecifier(s) => write!(f, "invalid import specifier '{s}'"),
            Self::DuplicateSpecifier(s) => write!(f, "import specifier '{s}' registered twice"),
        }
    }
}

impl std::error::Error for ScopeError {}

/// Read-only capability table. Built once through [`ScopeBuilder`],
/// then shared by `Arc` between the bridge and every execution.
#[derive(Debug, Clone)]
pub struct CapabilityScope {
    capabilities: BTreeMap<String, Capability>,
    imports: BTreeMap<String, String>,
}

impl CapabilityScope {
    pub fn builder() -> ScopeBuilder {
        ScopeBuilder::default()
    }

    /// The stock scope: UI, charting, diagramming, markdown, GFM, icons.
    pub fn builtin() -> Self {
        let mut capabilities = BTreeMap::new();
        let mut imports = BTreeMap::new();
        for capability in builtin::capabilities() {
            if let Some(specifier) = &capability.specifier {
                imports.insert(specifier.clone(), capability.symbol.clone());
            }
            capabilities.insert(capability.symbol.clone(), capability);
        }
        Self {
            capabilities,
            imports,
        }
    }

    pub fn get(&self, symbol: &str) -> Option<&Capability> {
        self.capabilities.get(symbol)
    }

    /// Import-style lookup (`import x from "<specifier>"`).
    pub fn resolve_import(&self, specifier: &str) -> Option<&Capability> {
        self.imports
            .get(specifier)
            .and_then(|symbol| self.capabilities.get(symbol))
    }

    /// Scope symbols in a stable order.
    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.capabilities.keys().map(String::as_str)
    }

    pub fn capabilities(&self) -> impl Iterator<Item = &Capability> {
        self.capabilities.values()
    }

    /// Specifier → symbol pairs.
    pub fn imports(&self) -> impl Iterator<Item = (&str, &str)> {
        self.imports.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct ScopeBuilder {
    entries: Vec<Capability>,
}

impl ScopeBuilder {
    pub fn register(mut self, capability: Capability) -> Self {
        self.entries.push(capability);
        self
    }

    /// Registers the stock capabilities alongside whatever is already queued.
    pub fn register_builtins(mut self) -> Self {
        self.entries.extend(builtin::capabilities());
        self
    }

    pub fn build(self) -> Result<CapabilityScope, ScopeError> {
        let mut capabilities = BTreeMap::new();
        let mut imports = BTreeMap::new();

        for capability in self.entries {
            let symbol = capability.symbol.clone();
            if !is_identifier(&symbol) || JS_KEYWORDS.contains(&symbol.as_str()) {
                return Err(ScopeError::InvalidSymbol(symbol));
            }
            if RESERVED_SYMBOLS.contains(&symbol.as_str()) {
                return Err(ScopeError::ReservedSymbol(symbol));
            }
            if capabilities.contains_key(&symbol) {
                return Err(ScopeError::DuplicateSymbol(symbol));
            }
            if let Some(specifier) = &capability.specifier {
                if specifier.is_empty() || specifier.chars().any(char::is_whitespace) {
                    return Err(ScopeError::InvalidSpecifier(specifier.clone()));
                }
                if imports.contains_key(specifier) {
                    return Err(ScopeError::DuplicateSpecifier(specifier.clone()));
                }
                imports.insert(specifier.clone(), symbol.clone());
            }
            capabilities.insert(symbol, capability);
        }

        Ok(CapabilityScope {
            capabilities,
            imports,
        })
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_symbols() {
        let scope = CapabilityScope::builtin();
        let symbols: Vec<&str> = scope.symbols().collect();
        for expected in ["Mermaid", "React", "ReactIcons", "ReactMarkdown", "Recharts", "remarkGfm"] {
            assert!(symbols.contains(&expected), "missing {expected}");
        }
        assert_eq!(scope.len(), 6);
    }

    #[test]
    fn test_builtin_imports_resolve() {
        let scope = CapabilityScope::builtin();
        assert_eq!(scope.resolve_import("react").unwrap().symbol, "React");
        assert_eq!(scope.resolve_import("recharts").unwrap().symbol, "Recharts");
        assert_eq!(scope.resolve_import("mermaid").unwrap().symbol, "Mermaid");
        assert_eq!(scope.resolve_import("react-markdown").unwrap().symbol, "ReactMarkdown");
        assert_eq!(scope.resolve_import("remark-gfm").unwrap().symbol, "remarkGfm");
        assert_eq!(scope.resolve_import("react-icons").unwrap().symbol, "ReactIcons");
    }

    #[test]
    fn test_unregistered_names_are_unresolvable() {
        let scope = CapabilityScope::builtin();
        assert!(scope.get("fetch").is_none());
        assert!(scope.get("Deno").is_none());
        assert!(scope.resolve_import("fs").is_none());
        assert!(scope.resolve_import("child_process").is_none());
    }

    #[test]
    fn test_builtin_passes_builder_validation() {
        let built = CapabilityScope::builder().register_builtins().build().unwrap();
        assert_eq!(built.len(), CapabilityScope::builtin().len());
    }

    #[test]
    fn test_builder_rejects_reserved_and_invalid_symbols() {
        let reserved = CapabilityScope::builder()
            .register(Capability::new("require", "({})"))
            .build();
        assert_eq!(reserved.unwrap_err(), ScopeError::ReservedSymbol("require".into()));

        let invalid = CapabilityScope::builder()
            .register(Capability::new("react-dom", "({})"))
            .build();
        assert_eq!(invalid.unwrap_err(), ScopeError::InvalidSymbol("react-dom".into()));

        let keyword = CapabilityScope::builder()
            .register(Capability::new("class", "({})"))
            .build();
        assert!(keyword.is_err());
    }

    #[test]
    fn test_builder_rejects_duplicates() {
        let dup_symbol = CapabilityScope::builder()
            .register(Capability::new("Lib", "({})"))
            .register(Capability::new("Lib", "({})"))
            .build();
        assert_eq!(dup_symbol.unwrap_err(), ScopeError::DuplicateSymbol("Lib".into()));

        let dup_specifier = CapabilityScope::builder()
            .register(Capability::new("A", "({})").importable_as("lib"))
            .register(Capability::new("B", "({})").importable_as("lib"))
            .build();
        assert_eq!(dup_specifier.unwrap_err(), ScopeError::DuplicateSpecifier("lib".into()));
    }

    #[test]
    fn test_symbol_without_specifier_is_scope_only() {
        let scope = CapabilityScope::builder()
            .register(Capability::new("Only", "({})"))
            .build()
            .unwrap();
        assert!(scope.get("Only").is_some());
        assert_eq!(scope.imports().count(), 0);
    }
}
