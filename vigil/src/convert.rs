//! Conversion of surface-syntax `.mop` specifications into spec classes.
//!
//! The surface form is declarative and line-oriented:
//!
//! ```text
//! spec FileClosedAnalysis
//! description A file opened must be closed before the program ends.
//! params f
//! event open after(io.open) binds f=result
//! event close after(File.close) binds f=receiver
//! creation open
//! end end
//! message file was never closed
//! fsm:
//! s0 [
//!     open -> s1
//! ]
//! s1 [
//!     close -> s0
//!     end -> s2
//! ]
//! alias match = s2
//! ```
//!
//! `ere <expr>` may be used instead of the trailing `fsm:` block. The
//! generated `.vg` file carries a class named after the file stem, so it
//! loads through the registry like a hand-written spec. Predicates have
//! no surface form; specs that need them are written directly in the
//! host language.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{path}: malformed directive `{line}`")]
    MalformedLine { path: PathBuf, line: String },
    #[error("{path}: no property declared (expected `ere ...` or `fsm:`)")]
    MissingProperty { path: PathBuf },
    #[error("{path}: no events declared")]
    MissingEvents { path: PathBuf },
}

struct SurfaceEvent {
    name: String,
    hook: String,
    target: String,
    binds: Vec<(String, String)>,
}

#[derive(Default)]
struct SurfaceSpec {
    description: Option<String>,
    params: Vec<String>,
    events: Vec<SurfaceEvent>,
    creation: Vec<String>,
    end: Vec<String>,
    message: Option<String>,
    ere: Option<String>,
    fsm: Option<String>,
}

/// Converts every `.mop` file in the folder; returns the converted names.
pub fn convert_folder(folder: &Path) -> Result<Vec<String>, ConvertError> {
    let mut converted = Vec::new();
    let entries = std::fs::read_dir(folder).map_err(|source| ConvertError::Read {
        path: folder.to_path_buf(),
        source,
    })?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().map(|e| e == "mop").unwrap_or(false) {
            let name = convert_file(&path)?;
            converted.push(name);
        }
    }
    converted.sort();
    Ok(converted)
}

/// Converts one `.mop` file into a sibling `.vg` spec.
pub fn convert_file(path: &Path) -> Result<String, ConvertError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConvertError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "Converted".to_string());
    let spec = parse_surface(&text, path)?;
    let generated = generate(&name, &spec);

    let out = path.with_extension("vg");
    std::fs::write(&out, generated).map_err(|source| ConvertError::Write {
        path: out.clone(),
        source,
    })?;
    debug!(spec = %name, out = %out.display(), "converted surface spec");
    Ok(name)
}

fn parse_surface(text: &str, path: &Path) -> Result<SurfaceSpec, ConvertError> {
    let mut spec = SurfaceSpec::default();
    let malformed = |line: &str| ConvertError::MalformedLine {
        path: path.to_path_buf(),
        line: line.to_string(),
    };

    let mut lines = text.lines();
    while let Some(raw) = lines.next() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (directive, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        match directive {
            "spec" => {
                // The class name comes from the file stem; the directive
                // is informational.
                if rest.is_empty() {
                    return Err(malformed(line));
                }
            }
            "description" => spec.description = Some(rest.to_string()),
            "params" => {
                spec.params = rest
                    .split([',', ' '])
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "event" => spec.events.push(parse_event(rest).ok_or_else(|| malformed(line))?),
            "creation" => {
                spec.creation = rest
                    .split([',', ' '])
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "end" => {
                spec.end = rest
                    .split([',', ' '])
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "message" => spec.message = Some(rest.to_string()),
            "ere" => spec.ere = Some(rest.to_string()),
            "fsm:" => {
                let table: Vec<&str> = lines.by_ref().collect();
                spec.fsm = Some(table.join("\n"));
                break;
            }
            _ => return Err(malformed(line)),
        }
    }

    if spec.events.is_empty() {
        return Err(ConvertError::MissingEvents {
            path: path.to_path_buf(),
        });
    }
    if spec.ere.is_none() && spec.fsm.is_none() {
        return Err(ConvertError::MissingProperty {
            path: path.to_path_buf(),
        });
    }
    Ok(spec)
}

/// `<name> <hook>(<type.pattern>) [binds p=source, ...]`
fn parse_event(rest: &str) -> Option<SurfaceEvent> {
    let (name, rest) = rest.split_once(char::is_whitespace)?;
    let rest = rest.trim();
    let open = rest.find('(')?;
    let close = rest.find(')')?;
    let hook = rest[..open].trim().to_string();
    let target = rest[open + 1..close].trim().to_string();
    if target.is_empty() {
        return None;
    }

    let mut binds = Vec::new();
    let tail = rest[close + 1..].trim();
    if let Some(bind_text) = tail.strip_prefix("binds") {
        for pair in bind_text.split(',') {
            let (param, source) = pair.split_once('=')?;
            binds.push((param.trim().to_string(), source.trim().to_string()));
        }
    } else if !tail.is_empty() {
        return None;
    }

    Some(SurfaceEvent {
        name: name.to_string(),
        hook,
        target,
        binds,
    })
}

fn quote(text: &str) -> String {
    format!("{:?}", text)
}

fn generate(name: &str, spec: &SurfaceSpec) -> String {
    let mut out = String::new();
    out.push_str(&format!("class {}(Spec) {{\n", name));
    let description = spec
        .description
        .clone()
        .unwrap_or_else(|| format!("Converted from {}.mop", name));
    out.push_str(&format!("    {}\n\n", quote(&description)));
    out.push_str("    def init(self) {\n");
    if !spec.params.is_empty() {
        let params: Vec<String> = spec.params.iter().map(|p| quote(p)).collect();
        out.push_str(&format!("        self.params([{}])\n", params.join(", ")));
    }
    for event in &spec.events {
        let mut opts = vec![format!("{}: {}", quote("hook"), quote(&event.hook))];
        if !event.binds.is_empty() {
            let binds: Vec<String> = event
                .binds
                .iter()
                .map(|(p, s)| format!("{}: {}", quote(p), quote(s)))
                .collect();
            opts.push(format!("{}: {{{}}}", quote("binds"), binds.join(", ")));
        }
        out.push_str(&format!(
            "        self.event({}, {}, {{{}}})\n",
            quote(&event.name),
            quote(&event.target),
            opts.join(", ")
        ));
    }
    if let Some(ere) = &spec.ere {
        out.push_str(&format!("        self.ere({})\n", quote(ere)));
    }
    if let Some(fsm) = &spec.fsm {
        out.push_str(&format!("        self.fsm(\"\"\"\n{}\n\"\"\")\n", fsm));
    }
    if !spec.creation.is_empty() {
        let names: Vec<String> = spec.creation.iter().map(|n| quote(n)).collect();
        out.push_str(&format!(
            "        self.creation_events([{}])\n",
            names.join(", ")
        ));
    }
    if !spec.end.is_empty() {
        let names: Vec<String> = spec.end.iter().map(|n| quote(n)).collect();
        out.push_str(&format!("        self.end_events([{}])\n", names.join(", ")));
    }
    out.push_str("    }\n");
    if let Some(message) = &spec.message {
        out.push_str("\n    def match(self, e) {\n");
        out.push_str(&format!(
            "        self.violation(e, {})\n",
            quote(message)
        ));
        out.push_str("    }\n");
    }
    out.push_str("}\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SURFACE: &str = "\
spec FileClosedAnalysis
description A file opened must be closed before the program ends.
params f
event open after(io.open) binds f=result
event close after(File.close) binds f=receiver
creation open
end end
message file was never closed
fsm:
s0 [
    open -> s1
]
s1 [
    close -> s0
    end -> s2
]
alias match = s2
";

    #[test]
    fn parses_surface_form() {
        let spec = parse_surface(SURFACE, Path::new("FileClosedAnalysis.mop")).unwrap();
        assert_eq!(spec.params, vec!["f".to_string()]);
        assert_eq!(spec.events.len(), 2);
        assert_eq!(spec.events[0].name, "open");
        assert_eq!(spec.events[0].target, "io.open");
        assert_eq!(spec.events[0].binds, vec![("f".to_string(), "result".to_string())]);
        assert_eq!(spec.creation, vec!["open".to_string()]);
        assert!(spec.fsm.as_deref().unwrap().contains("alias match = s2"));
    }

    #[test]
    fn generated_class_parses_as_host_source() {
        let spec = parse_surface(SURFACE, Path::new("FileClosedAnalysis.mop")).unwrap();
        let generated = generate("FileClosedAnalysis", &spec);
        let module = vigil_instrument::parser::parse_module(
            &generated,
            "FileClosedAnalysis",
            "FileClosedAnalysis.vg",
        )
        .expect("generated spec parses");
        assert_eq!(module.body.len(), 1);
    }

    #[test]
    fn rejects_missing_property() {
        let text = "spec X\nevent a after(io.open)\n";
        assert!(matches!(
            parse_surface(text, Path::new("X.mop")),
            Err(ConvertError::MissingProperty { .. })
        ));
    }

    #[test]
    fn rejects_malformed_event() {
        let text = "spec X\nevent broken\nere broken\n";
        assert!(parse_surface(text, Path::new("X.mop")).is_err());
    }

    #[test]
    fn ere_surface_form() {
        let text = "spec Y\nparams l\nevent push after(list.append) binds l=receiver\nere push push\ncreation push\n";
        let spec = parse_surface(text, Path::new("Y.mop")).unwrap();
        assert_eq!(spec.ere.as_deref(), Some("push push"));
        let generated = generate("Y", &spec);
        assert!(generated.contains("self.ere(\"push push\")"));
    }
}
