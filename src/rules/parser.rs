//! Rule file parser.
//!
//! The file is line-oriented: `#` comments, `[name:...]` directives, `$NAME =
//! value` assignments, `!name(args) = body` macro declarations, and
//! `:[foreach] sources [| manual-deps] > command > targets` rule lines.
//! Macro calls and `$var` references in rule lines are expanded by pure text
//! substitution before the line is split into its three sections.

use crate::error::BuildError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use super::template::RuleTemplate;
use crate::paths::absolutize;

/// Position of a rule-file line, carried through to every diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleLocation {
    pub file: PathBuf,
    pub line: u32,
}

impl fmt::Display for RuleLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file.display(), self.line)
    }
}

/// Directives that feed run configuration rather than graph construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    RemoteCache {
        kind: String,
        host: String,
        access_key: String,
        secret_key: String,
        bucket: String,
        mode: String,
    },
    LocalCacheSizeMb(u64),
}

#[derive(Debug, Clone)]
struct MacroDef {
    params: Vec<String>,
    body: String,
}

#[derive(Debug, Default)]
pub struct ParsedRules {
    pub templates: Vec<RuleTemplate>,
    pub directives: Vec<Directive>,
}

/// Parse the rule file, expanding once per selected variant.
///
/// With no variants selected a single pass over the base variable bindings
/// runs. Each selected variant re-runs the pass with its overrides locked in
/// and `$VARIANT` bound to the variant name; the resulting command templates
/// are concatenated so one graph holds every variant's commands.
pub fn parse_rule_file(path: &Path, variants: &[String]) -> Result<ParsedRules> {
    let base = Pass::run(path, &BTreeMap::new(), None)?;
    if variants.is_empty() {
        return Ok(ParsedRules {
            templates: base.templates,
            directives: base.directives,
        });
    }

    let mut templates = Vec::new();
    for variant in variants {
        let overrides = base
            .variants
            .get(variant)
            .ok_or_else(|| BuildError::UnknownVariant(variant.clone()))?;
        let pass = Pass::run(path, overrides, Some(variant))?;
        templates.extend(pass.templates);
    }
    Ok(ParsedRules {
        templates,
        directives: base.directives,
    })
}

#[derive(Debug, Default)]
struct Pass {
    vars: HashMap<String, String>,
    /// Variant-bound names that assignments in the file must not clobber.
    locked: Vec<String>,
    macros: HashMap<String, MacroDef>,
    templates: Vec<RuleTemplate>,
    directives: Vec<Directive>,
    variants: BTreeMap<String, BTreeMap<String, String>>,
}

impl Pass {
    fn run(path: &Path, overrides: &BTreeMap<String, String>, variant: Option<&str>) -> Result<Pass> {
        let mut pass = Pass::default();
        for (name, value) in overrides {
            pass.vars.insert(name.clone(), value.clone());
            pass.locked.push(name.clone());
        }
        if let Some(name) = variant {
            pass.vars.insert("VARIANT".to_string(), name.to_string());
            pass.locked.push("VARIANT".to_string());
        }
        pass.parse_file(path)?;
        Ok(pass)
    }

    fn parse_file(&mut self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read rule file {}", path.display()))?;
        let file_dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        let mut root = file_dir.clone();

        for (idx, raw) in text.lines().enumerate() {
            let location = RuleLocation {
                file: path.to_path_buf(),
                line: idx as u32 + 1,
            };
            let line = raw.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.as_bytes()[0] {
                b':' => self.parse_rule_line(line, &root, &location)?,
                b'!' => self.parse_macro(line, &location)?,
                b'$' => self.parse_assignment(line, &location)?,
                b'[' => self.parse_directive(line, &mut root, &file_dir, &location)?,
                _ => {
                    return Err(config_err(
                        &location,
                        "unrecognized line; expected a rule (:), macro (!), variable ($) or directive ([...])",
                    ))
                }
            }
        }
        Ok(())
    }

    fn parse_directive(
        &mut self,
        line: &str,
        root: &mut PathBuf,
        file_dir: &Path,
        location: &RuleLocation,
    ) -> Result<()> {
        let inner = line
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .ok_or_else(|| config_err(location, "malformed directive, expected [name:value]"))?;
        let (name, value) = inner
            .split_once(':')
            .ok_or_else(|| config_err(location, "malformed directive, expected [name:value]"))?;
        let value = value.trim();

        match name {
            "workdir" => {
                *root = absolutize(Path::new(value), file_dir);
            }
            "include" => {
                let included = absolutize(Path::new(value), file_dir);
                self.parse_file(&included)
                    .with_context(|| format!("{location}: while including {value}"))?;
            }
            "variant" => {
                let mut tokens = value.split_whitespace();
                let variant = tokens
                    .next()
                    .ok_or_else(|| config_err(location, "variant directive needs a name"))?;
                let bindings = self.variants.entry(variant.to_string()).or_default();
                for token in tokens {
                    let (var, val) = token.split_once('=').ok_or_else(|| {
                        config_err(location, "variant bindings must look like $NAME=value")
                    })?;
                    bindings.insert(var.trim_start_matches('$').to_string(), val.to_string());
                }
            }
            "remote_cache" => {
                let tokens: Vec<&str> = value.split_whitespace().collect();
                if tokens.len() != 6 {
                    return Err(config_err(
                        location,
                        "remote_cache directive expects: <kind> <host> <key> <secret> <bucket> <ro|rw>",
                    ));
                }
                self.directives.push(Directive::RemoteCache {
                    kind: tokens[0].to_string(),
                    host: tokens[1].to_string(),
                    access_key: tokens[2].to_string(),
                    secret_key: tokens[3].to_string(),
                    bucket: tokens[4].to_string(),
                    mode: tokens[5].to_string(),
                });
            }
            "local_cache_size" => {
                let mb: u64 = value
                    .parse()
                    .map_err(|_| config_err(location, "local_cache_size expects a number of MB"))?;
                self.directives.push(Directive::LocalCacheSizeMb(mb));
            }
            other => {
                return Err(config_err(location, &format!("unknown directive '{other}'")));
            }
        }
        Ok(())
    }

    fn parse_assignment(&mut self, line: &str, location: &RuleLocation) -> Result<()> {
        let (name, value) = line
            .split_once('=')
            .ok_or_else(|| config_err(location, "assignment needs '='"))?;
        let name = name.trim().trim_start_matches('$').to_string();
        let value = self.substitute_vars(value.trim(), true, location)?;
        if !self.locked.contains(&name) {
            self.vars.insert(name, value);
        }
        Ok(())
    }

    fn parse_macro(&mut self, line: &str, location: &RuleLocation) -> Result<()> {
        let (decl, body) = line
            .split_once('=')
            .ok_or_else(|| config_err(location, "macro declaration needs '='"))?;
        let decl: String = decl.chars().filter(|c| !c.is_whitespace()).collect();
        let (name, params) = decl
            .strip_prefix('!')
            .and_then(|d| d.strip_suffix(')'))
            .and_then(|d| d.split_once('('))
            .ok_or_else(|| config_err(location, "macro declaration must look like !name(a,b) = body"))?;
        let params: Vec<String> = params
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect();
        self.macros.insert(
            name.to_string(),
            MacroDef {
                params,
                body: body.trim().to_string(),
            },
        );
        Ok(())
    }

    fn parse_rule_line(&mut self, line: &str, root: &Path, location: &RuleLocation) -> Result<()> {
        let line = self.expand_macros(line, location)?;
        let line = self.substitute_vars(&line, false, location)?;

        let parts: Vec<&str> = line.split('>').collect();
        if parts.len() != 3 {
            return Err(config_err(
                location,
                "rule must have the form ': sources [| manual-deps] > command > targets'",
            ));
        }
        let header: Vec<&str> = parts[0].split_whitespace().collect();
        let cmd_fmt = parts[1].trim().to_string();
        let targets_fmt: Vec<String> = parts[2].split_whitespace().map(String::from).collect();

        let foreach = match header.first() {
            Some(&":") => false,
            Some(&":foreach") => true,
            _ => {
                return Err(config_err(
                    location,
                    "rule must start with ':' or ':foreach'",
                ))
            }
        };
        let rest = &header[1..];
        let (sources_fmt, manual_fmt) = match rest.iter().position(|t| *t == "|") {
            Some(pipe) => (&rest[..pipe], &rest[pipe + 1..]),
            None => (rest, &[][..]),
        };

        self.templates.push(RuleTemplate {
            sources_fmt: sources_fmt.iter().map(|s| s.to_string()).collect(),
            manual_fmt: manual_fmt.iter().map(|s| s.to_string()).collect(),
            cmd_fmt,
            targets_fmt,
            foreach,
            root: root.to_path_buf(),
            location: location.clone(),
        });
        Ok(())
    }

    /// Replace every `!name(args)` call with the macro body, with arguments
    /// substituted for the declared parameters. Arguments starting with `$`
    /// are looked up in the variable table.
    fn expand_macros(&self, line: &str, location: &RuleLocation) -> Result<String> {
        let mut out = line.to_string();
        for call in find_macro_calls(line) {
            let (name, args_text) = call
                .strip_prefix('!')
                .and_then(|c| c.strip_suffix(')'))
                .and_then(|c| c.split_once('('))
                .ok_or_else(|| config_err(location, &format!("malformed macro call '{call}'")))?;
            let def = self
                .macros
                .get(name)
                .ok_or_else(|| config_err(location, &format!("unknown macro '!{name}'")))?;

            let args: Vec<&str> = if args_text.trim().is_empty() {
                Vec::new()
            } else {
                args_text.split(',').map(str::trim).collect()
            };
            if args.len() != def.params.len() {
                return Err(config_err(
                    location,
                    &format!(
                        "macro '!{name}' has {} parameters but was called with {}",
                        def.params.len(),
                        args.len()
                    ),
                ));
            }

            let mut body = def.body.clone();
            for (param, arg) in def.params.iter().zip(&args) {
                let value = if arg.is_empty() {
                    String::new()
                } else if let Some(var) = arg.strip_prefix('$') {
                    self.vars
                        .get(var)
                        .cloned()
                        .ok_or_else(|| {
                            config_err(location, &format!("macro argument '${var}' is undefined"))
                        })?
                } else {
                    arg.to_string()
                };
                body = body.replace(&format!("${param}"), &value);
            }
            out = out.replace(&call, &body);
        }
        Ok(out)
    }

    /// Replace `$NAME` references. In assignments an undefined variable is a
    /// configuration error; in rule lines unknown names pass through so shell
    /// variables in commands survive.
    fn substitute_vars(&self, text: &str, strict: bool, location: &RuleLocation) -> Result<String> {
        let mut out = String::with_capacity(text.len());
        let mut chars = text.char_indices().peekable();
        while let Some((_, c)) = chars.next() {
            if c != '$' {
                out.push(c);
                continue;
            }
            let mut name = String::new();
            while let Some(&(_, n)) = chars.peek() {
                if n.is_ascii_alphanumeric() || n == '_' {
                    name.push(n);
                    chars.next();
                } else {
                    break;
                }
            }
            if name.is_empty() {
                out.push('$');
            } else if let Some(value) = self.vars.get(&name) {
                out.push_str(value);
            } else if strict {
                return Err(config_err(location, &format!("undefined variable '${name}'")));
            } else {
                out.push('$');
                out.push_str(&name);
            }
        }
        Ok(out)
    }
}

/// Scan for `!name(...)` call spans, `!` through the closing `)`.
fn find_macro_calls(line: &str) -> Vec<String> {
    let mut calls = Vec::new();
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'!' {
            if let Some(end) = line[i..].find(')') {
                let candidate = &line[i..i + end + 1];
                if candidate.contains('(') {
                    calls.push(candidate.to_string());
                    i += end + 1;
                    continue;
                }
            }
        }
        i += 1;
    }
    calls
}

fn config_err(location: &RuleLocation, reason: &str) -> anyhow::Error {
    BuildError::Config {
        location: location.clone(),
        reason: reason.to_string(),
    }
    .into()
}
