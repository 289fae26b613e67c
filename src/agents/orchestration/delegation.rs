//! Delegation directive parsing
//!
//! Agents request help from each other by writing lines of the form
//! `DELEGATE TO [name]: task` in their output. Parsing is line-based and
//! strict: the directive must open the line (after an optional list or
//! emphasis marker), the name must be bracketed, and the task must be
//! non-empty and on the same line.

use crate::agents::domain::DelegationDirective;
use crate::config::AgentDefinition;

const KEYWORD: &str = "delegate to";

/// Extract every directive in `text`, in order of appearance.
pub fn parse_delegations(text: &str) -> Vec<DelegationDirective> {
    text.lines().filter_map(parse_line).collect()
}

/// Parse a single line. Returns `None` unless the whole line is a directive.
pub fn parse_line(line: &str) -> Option<DelegationDirective> {
    let mut rest = strip_list_marker(line.trim());
    let bold = rest.starts_with("**");
    if bold {
        rest = &rest[2..];
    }

    let keyword = rest.get(..KEYWORD.len())?;
    if !keyword.eq_ignore_ascii_case(KEYWORD) {
        return None;
    }

    let rest = rest[KEYWORD.len()..].trim_start().strip_prefix('[')?;
    let close = rest.find(']')?;
    let name = rest[..close].trim();
    if name.is_empty() || name.contains('[') {
        return None;
    }

    let mut after = &rest[close + 1..];
    if bold {
        after = after.strip_prefix("**").unwrap_or(after);
    }
    let mut task = after.trim_start().strip_prefix(':')?.trim();
    if bold {
        task = task.strip_suffix("**").unwrap_or(task).trim_end();
    }
    if task.is_empty() {
        return None;
    }

    Some(DelegationDirective::new(name, task))
}

fn strip_list_marker(line: &str) -> &str {
    for marker in ["- ", "* ", "• ", "> "] {
        if let Some(rest) = line.strip_prefix(marker) {
            return rest.trim_start();
        }
    }

    let digits = line.bytes().take_while(u8::is_ascii_digit).count();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(rest) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            return rest.trim_start();
        }
    }
    line
}

/// Split directives into those `agent` may issue and those it may not.
pub fn authorize(
    agent: &AgentDefinition,
    directives: Vec<DelegationDirective>,
) -> (Vec<DelegationDirective>, Vec<DelegationDirective>) {
    directives
        .into_iter()
        .partition(|d| agent.can_delegate_to(&d.target_agent))
}
