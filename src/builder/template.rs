//! Tag templates for builder runs.
//!
//! A small Go-template-like language evaluated against the SCM facts of the
//! run: `{{ .ScmBranch }}`, `{{ .ScmTag | default "latest" }}`,
//! `{{ .ScmRef | substr 0 7 }}`. The rendered value must be a valid OCI tag
//! or the run fails validation before it is ever scheduled.

use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]{0,127}$").unwrap());

#[derive(Debug, Error, PartialEq)]
pub enum TemplateError {
    #[error("unterminated template expression")]
    Unterminated,
    #[error("unknown template field: {0}")]
    UnknownField(String),
    #[error("unknown template function: {0}")]
    UnknownFunction(String),
    #[error("bad arguments for {0}")]
    BadArguments(String),
    #[error("rendered tag {0:?} is not a valid OCI tag")]
    InvalidTag(String),
}

#[derive(Debug, Default, Clone)]
pub struct TemplateContext {
    pub scm_branch: String,
    pub scm_tag: String,
    pub scm_ref: String,
}

impl TemplateContext {
    fn field(&self, name: &str) -> Result<String, TemplateError> {
        match name {
            "ScmBranch" => Ok(self.scm_branch.clone()),
            "ScmTag" => Ok(self.scm_tag.clone()),
            "ScmRef" => Ok(self.scm_ref.clone()),
            other => Err(TemplateError::UnknownField(other.to_string())),
        }
    }
}

/// Split an expression segment into tokens, honouring double quotes.
fn tokenize(segment: &str) -> Vec<String> {
    let mut tokens = vec![];
    let mut current = String::new();
    let mut quoted = false;

    for c in segment.chars() {
        match c {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}

fn apply(value: String, tokens: &[String]) -> Result<String, TemplateError> {
    let (func, args) = tokens
        .split_first()
        .ok_or_else(|| TemplateError::BadArguments("empty pipeline stage".to_string()))?;

    match (func.as_str(), args) {
        ("lower", []) => Ok(value.to_lowercase()),
        ("upper", []) => Ok(value.to_uppercase()),
        ("trim", []) => Ok(value.trim().to_string()),
        ("replace", [old, new]) => Ok(value.replace(old.as_str(), new)),
        ("substr", [start, len]) => {
            let start: usize = start
                .parse()
                .map_err(|_| TemplateError::BadArguments("substr".to_string()))?;
            let len: usize = len
                .parse()
                .map_err(|_| TemplateError::BadArguments("substr".to_string()))?;
            Ok(value.chars().skip(start).take(len).collect())
        }
        ("default", [fallback]) => {
            if value.is_empty() {
                Ok(fallback.clone())
            } else {
                Ok(value)
            }
        }
        ("lower" | "upper" | "trim" | "replace" | "substr" | "default", _) => {
            Err(TemplateError::BadArguments(func.clone()))
        }
        (other, _) => Err(TemplateError::UnknownFunction(other.to_string())),
    }
}

fn evaluate_expression(
    expression: &str,
    context: &TemplateContext,
) -> Result<String, TemplateError> {
    let mut stages = expression.split('|');

    let head = stages
        .next()
        .ok_or_else(|| TemplateError::BadArguments("empty expression".to_string()))?;
    let head_tokens = tokenize(head);

    let mut value = match head_tokens.as_slice() {
        [field] if field.starts_with('.') => context.field(&field[1..])?,
        [literal] => literal.clone(),
        _ => return Err(TemplateError::BadArguments(head.trim().to_string())),
    };

    for stage in stages {
        let tokens = tokenize(stage);
        value = apply(value, &tokens)?;
    }

    Ok(value)
}

/// Evaluate a template without tag validation.
pub fn evaluate(template: &str, context: &TemplateContext) -> Result<String, TemplateError> {
    let mut out = String::new();
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or(TemplateError::Unterminated)?;

        out.push_str(&evaluate_expression(&after[..end], context)?);
        rest = &after[end + 2..];
    }
    out.push_str(rest);

    Ok(out)
}

/// Evaluate a template and require the result to be a valid OCI tag.
pub fn render(template: &str, context: &TemplateContext) -> Result<String, TemplateError> {
    let rendered = evaluate(template, context)?;

    if !TAG_RE.is_match(&rendered) {
        return Err(TemplateError::InvalidTag(rendered));
    }

    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> TemplateContext {
        TemplateContext {
            scm_branch: "feature/login".into(),
            scm_tag: "v1.2.3".into(),
            scm_ref: "0123456789abcdef0123456789abcdef01234567".into(),
        }
    }

    #[test]
    fn plain_field() {
        assert_eq!(evaluate("{{ .ScmTag }}", &context()).unwrap(), "v1.2.3");
    }

    #[test]
    fn literal_text_passes_through() {
        assert_eq!(
            evaluate("release-{{ .ScmTag }}", &context()).unwrap(),
            "release-v1.2.3"
        );
        assert_eq!(evaluate("latest", &context()).unwrap(), "latest");
    }

    #[test]
    fn pipeline_helpers() {
        assert_eq!(
            evaluate("{{ .ScmBranch | replace \"/\" \"-\" }}", &context()).unwrap(),
            "feature-login"
        );
        assert_eq!(
            evaluate("{{ .ScmTag | upper }}", &context()).unwrap(),
            "V1.2.3"
        );
        assert_eq!(
            evaluate("{{ .ScmRef | substr 0 7 }}", &context()).unwrap(),
            "0123456"
        );
        assert_eq!(
            evaluate("{{ .ScmBranch | replace \"/\" \"-\" | upper }}", &context()).unwrap(),
            "FEATURE-LOGIN"
        );
    }

    #[test]
    fn default_applies_only_when_empty() {
        let mut ctx = context();
        assert_eq!(
            evaluate("{{ .ScmTag | default \"latest\" }}", &ctx).unwrap(),
            "v1.2.3"
        );

        ctx.scm_tag = String::new();
        assert_eq!(
            evaluate("{{ .ScmTag | default \"latest\" }}", &ctx).unwrap(),
            "latest"
        );
    }

    #[test]
    fn render_enforces_oci_tag_shape() {
        // Raw branch with a slash is not a valid tag
        assert_eq!(
            render("{{ .ScmBranch }}", &context()),
            Err(TemplateError::InvalidTag("feature/login".into()))
        );

        // Sanitised it is
        assert_eq!(
            render("{{ .ScmBranch | replace \"/\" \"-\" }}", &context()).unwrap(),
            "feature-login"
        );

        // Empty render is invalid too
        let empty = TemplateContext::default();
        assert!(render("{{ .ScmBranch }}", &empty).is_err());

        // Length cap at 128
        let long = "x".repeat(129);
        assert!(render(&long, &context()).is_err());
    }

    #[test]
    fn errors_are_reported() {
        assert_eq!(
            evaluate("{{ .Nope }}", &context()),
            Err(TemplateError::UnknownField("Nope".into()))
        );
        assert_eq!(
            evaluate("{{ .ScmTag | frobnicate }}", &context()),
            Err(TemplateError::UnknownFunction("frobnicate".into()))
        );
        assert_eq!(
            evaluate("{{ .ScmTag", &context()),
            Err(TemplateError::Unterminated)
        );
        assert_eq!(
            evaluate("{{ .ScmTag | substr a b }}", &context()),
            Err(TemplateError::BadArguments("substr".into()))
        );
    }
}
