//! Fixed `{{NAME}}` template-variable substitution applied to inline prompt text only
//! (C3). `prompt_file` contents are used verbatim — see DESIGN.md for the Open Question
//! this resolves. Missing/unused variable checks are plan-scoped (§4.3): call
//! [`validate`] once over every inline prompt in the plan — a variable counts as "used"
//! if any of them reference it — then [`apply`] per prompt to substitute.

use crate::error::{Error, Result};
use std::collections::{HashMap, HashSet};

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_uppercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

/// Extract every `{{NAME}}` placeholder's NAME from `text`, in order of first
/// appearance. Placeholders whose NAME doesn't match `^[A-Z][A-Z0-9_]*$` are left
/// untouched by substitution and are not collected as references.
fn referenced_names(text: &str) -> Vec<String> {
    let mut names = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'{' && bytes[i + 1] == b'{' {
            if let Some(end) = text[i + 2..].find("}}") {
                let candidate = &text[i + 2..i + 2 + end];
                if is_valid_name(candidate) && !names.contains(&candidate.to_string()) {
                    names.push(candidate.to_string());
                }
                i += 2 + end + 2;
                continue;
            }
        }
        i += 1;
    }
    names
}

/// Validate `variables` against every inline prompt in the plan at once. Fails if any
/// name referenced by any prompt is missing from `variables`, or if any supplied
/// variable is referenced by none of them. Call once per plan load, before substituting
/// into any individual prompt — checking prompt-by-prompt would reject a variable used
/// by node A's prompt but not node B's, even though the plan as a whole uses it.
pub fn validate(prompts: &[&str], variables: &HashMap<String, String>) -> Result<()> {
    let referenced: HashSet<String> = prompts
        .iter()
        .flat_map(|text| referenced_names(text))
        .collect();
    let supplied: HashSet<String> = variables.keys().cloned().collect();

    let missing: Vec<&String> = referenced.difference(&supplied).collect();
    if !missing.is_empty() {
        let mut missing: Vec<&str> = missing.iter().map(|s| s.as_str()).collect();
        missing.sort_unstable();
        return Err(Error::Plan(format!(
            "template variable(s) referenced but not supplied: {}",
            missing.join(", ")
        )));
    }

    let unused: Vec<&String> = supplied.difference(&referenced).collect();
    if !unused.is_empty() {
        let mut unused: Vec<&str> = unused.iter().map(|s| s.as_str()).collect();
        unused.sort_unstable();
        return Err(Error::Plan(format!(
            "template variable(s) supplied but not referenced: {}",
            unused.join(", ")
        )));
    }

    Ok(())
}

/// Replace every `{{NAME}}` placeholder in `text` with its supplied value. Assumes
/// `validate` has already been run over the full set of plan prompts; performs no
/// missing/unused checks of its own.
pub fn apply(text: &str, variables: &HashMap<String, String>) -> String {
    let mut out = text.to_string();
    for (name, value) in variables {
        out = out.replace(&format!("{{{{{name}}}}}"), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_referenced_variable() {
        let mut vars = HashMap::new();
        vars.insert("REPO".to_string(), "acme/widgets".to_string());
        let text = "Fix the bug in {{REPO}}.";
        validate(&[text], &vars).unwrap();
        assert_eq!(apply(text, &vars), "Fix the bug in acme/widgets.");
    }

    #[test]
    fn missing_variable_is_error() {
        let vars = HashMap::new();
        assert!(validate(&["Fix {{REPO}}."], &vars).is_err());
    }

    #[test]
    fn unused_variable_is_error() {
        let mut vars = HashMap::new();
        vars.insert("REPO".to_string(), "acme/widgets".to_string());
        assert!(validate(&["No placeholders here."], &vars).is_err());
    }

    #[test]
    fn lowercase_placeholder_is_not_a_reference() {
        let vars = HashMap::new();
        assert!(validate(&["literal {{not_a_var}} text"], &vars).is_ok());
    }

    #[test]
    fn variable_used_in_any_prompt_counts_as_used() {
        let mut vars = HashMap::new();
        vars.insert("REPO".to_string(), "acme/widgets".to_string());
        let prompts = ["No vars in this one.", "This one uses {{REPO}}."];
        assert!(validate(&prompts, &vars).is_ok());
    }

    #[test]
    fn variable_unused_across_all_prompts_is_still_an_error() {
        let mut vars = HashMap::new();
        vars.insert("REPO".to_string(), "acme/widgets".to_string());
        let prompts = ["No vars here.", "Nor here."];
        assert!(validate(&prompts, &vars).is_err());
    }
}
