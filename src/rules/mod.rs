//! Rule file parsing and expansion.
//!
//! `parser` turns the line-oriented rule file into directives and rule
//! templates (macro and variable substitution happen as text passes before
//! the rule line is split). `template` binds each template against the
//! filesystem and the accumulated target set, producing concrete commands.

pub mod parser;
pub mod template;

pub use parser::{parse_rule_file, Directive, ParsedRules, RuleLocation};
pub use template::{CommandSpec, Expansion, RuleTemplate};
