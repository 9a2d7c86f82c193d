//! Lowers component modules to a function body the host runtime can
//! evaluate with the capability scope bound as parameters.
//!
//! Only the module forms components actually use are handled:
//! JSX is lowered first (see [`super::jsx`]). Then
//! `import` declarations become `require()` lookups against the import
//! map, `export default` becomes an assignment to `exports.default`,
//! and named exports are kept as locals and copied to `exports` at the
//! end of the body. Line structure is preserved so engine error
//! positions still point at the submitted source.
use std::fmt;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use super::jsx::{self, JsxError};

static IMPORT_FROM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^([ \t]*)import\s+([\w$*{}\s,]+?)\s+from\s*['"]([^'"\n]+)['"][ \t]*;?"#)
        .expect("static regex")
});

static IMPORT_BARE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^([ \t]*)import\s*['"]([^'"\n]+)['"][ \t]*;?"#).expect("static regex")
});

static EXPORT_DEFAULT_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^([ \t]*)export\s+default\s+((?:async\s+)?function\s*\*?\s*|class\s+)([A-Za-z_$][\w$]*)")
        .expect("static regex")
});

static EXPORT_DEFAULT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^([ \t]*)export\s+default\s+").expect("static regex")
});

static EXPORT_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^([ \t]*)export\s+((?:const|let|var|class|(?:async\s+)?function\s*\*?)\s+)([A-Za-z_$][\w$]*)")
        .expect("static regex")
});

static EXPORT_LIST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^([ \t]*)export\s*\{([^}]*)\}[ \t]*;?").expect("static regex")
});

static REEXPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^[ \t]*export\s+(?:\*|\{[^}]*\})\s*(?:as\s+[\w$]+\s+)?from\s*['"]"#)
        .expect("static regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    NoDefaultExport,
    Reexport,
    MalformedImport(String),
    Jsx(JsxError),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoDefaultExport => {
                f.write_str("No default export found. Export a React component as default.")
            }
            Self::Reexport => f.write_str("Re-exporting from other modules is not supported"),
            Self::MalformedImport(clause) => write!(f, "Malformed import clause: {clause}"),
            Self::Jsx(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CompileError {}

/// A lowered component module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub body: String,
    /// Import specifiers referenced by the source, in order of appearance.
    pub imports: Vec<String>,
}

pub fn lower(source: &str) -> Result<Program, CompileError> {
    let source = jsx::transform(source).map_err(CompileError::Jsx)?;
    let source = source.as_str();
    if REEXPORT.is_match(source) {
        return Err(CompileError::Reexport);
    }

    let mut imports = Vec::new();
    let mut import_error = None;
    let mut counter = 0usize;

    let body = IMPORT_FROM.replace_all(source, |caps: &Captures| {
        let indent = &caps[1];
        let specifier = caps[3].to_string();
        match bind_import(&caps[2], &specifier, counter) {
            Ok(bindings) => {
                counter += 1;
                imports.push(specifier);
                format!("{indent}{bindings}")
            }
            Err(e) => {
                import_error.get_or_insert(e);
                String::new()
            }
        }
    });
    if let Some(e) = import_error {
        return Err(e);
    }

    let body = IMPORT_BARE.replace_all(&body, |caps: &Captures| {
        imports.push(caps[2].to_string());
        format!("{}require({});", &caps[1], js_string(&caps[2]))
    });

    let mut default_local: Option<String> = None;
    let mut has_default = false;

    let body = EXPORT_DEFAULT_DECL.replace_all(&body, |caps: &Captures| {
        has_default = true;
        if &caps[3] == "extends" {
            // Anonymous class: `export default class extends Base {}`.
            return format!("{}exports.default = {}{}", &caps[1], &caps[2], &caps[3]);
        }
        default_local = Some(caps[3].to_string());
        format!("{}{}{}", &caps[1], &caps[2], &caps[3])
    });

    let body = EXPORT_DEFAULT.replace_all(&body, |caps: &Captures| {
        has_default = true;
        format!("{}exports.default = ", &caps[1])
    });

    let mut named: Vec<(String, String)> = Vec::new();

    let body = EXPORT_DECL.replace_all(&body, |caps: &Captures| {
        named.push((caps[3].to_string(), caps[3].to_string()));
        format!("{}{}{}", &caps[1], &caps[2], &caps[3])
    });

    let body = EXPORT_LIST.replace_all(&body, |caps: &Captures| {
        for item in caps[2].split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (local, exported) = match item.split_once(" as ") {
                Some((local, exported)) => (local.trim(), exported.trim()),
                None => (item, item),
            };
            if exported == "default" {
                has_default = true;
                default_local = Some(local.to_string());
            } else {
                named.push((local.to_string(), exported.to_string()));
            }
        }
        caps[1].to_string()
    });

    if !has_default {
        return Err(CompileError::NoDefaultExport);
    }

    let mut body = body.into_owned();
    body.push('\n');
    if let Some(local) = default_local {
        body.push_str(&format!(";exports.default = {local};"));
    }
    for (local, exported) in named {
        body.push_str(&format!("exports[{}] = {local};", js_string(&exported)));
    }

    Ok(Program { body, imports })
}

/// Builds the bindings for one `import <clause> from "<specifier>"`,
/// all on a single line.
fn bind_import(clause: &str, specifier: &str, index: usize) -> Result<String, CompileError> {
    let module = format!("__import{index}");
    let mut out = format!("const {module} = require({});", js_string(specifier));
    let clause = clause.trim();

    let (default, rest) = if clause.starts_with('{') || clause.starts_with('*') {
        (None, Some(clause))
    } else {
        match clause.split_once(',') {
            Some((default, rest)) => (Some(default.trim()), Some(rest.trim())),
            None => (Some(clause), None),
        }
    };

    if let Some(default) = default {
        if !is_binding(default) {
            return Err(CompileError::MalformedImport(clause.to_string()));
        }
        out.push_str(&format!(
            " const {default} = {module} && {module}.default !== undefined ? {module}.default : {module};"
        ));
    }

    match rest {
        None => {}
        Some(rest) if rest.starts_with('*') => {
            let namespace = rest
                .trim_start_matches('*')
                .trim()
                .strip_prefix("as")
                .map(str::trim)
                .filter(|name| is_binding(name))
                .ok_or_else(|| CompileError::MalformedImport(clause.to_string()))?;
            out.push_str(&format!(" const {namespace} = {module};"));
        }
        Some(rest) if rest.starts_with('{') && rest.ends_with('}') => {
            let mut names = Vec::new();
            for item in rest[1..rest.len() - 1]
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
            {
                let (imported, local) = match item.split_once(" as ") {
                    Some((imported, local)) => (imported.trim(), local.trim()),
                    None => (item, item),
                };
                if !is_binding(imported) || !is_binding(local) {
                    return Err(CompileError::MalformedImport(clause.to_string()));
                }
                names.push(if imported == local {
                    local.to_string()
                } else {
                    format!("{imported}: {local}")
                });
            }
            if !names.is_empty() {
                out.push_str(&format!(" const {{ {} }} = {module};", names.join(", ")));
            }
        }
        Some(_) => return Err(CompileError::MalformedImport(clause.to_string())),
    }

    // Keep the source's line count so error positions stay meaningful.
    let newlines = clause.matches('\n').count();
    out.push_str(&"\n".repeat(newlines));
    Ok(out)
}

fn is_binding(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}
