//! Template error types

use std::fmt;

/// Errors that can occur while translating or rendering a template
#[derive(Debug)]
pub enum TemplateError {
    /// Rendering failed inside the template engine
    Render(minijinja::Error),
    /// Template text is not a valid Go-style template
    Syntax(String),
    /// A referenced field does not exist in the data
    Undefined(String),
    /// A template function was called with unusable arguments
    Function(String),
}

impl TemplateError {
    /// True for errors detected before any data was consulted
    pub fn is_syntax(&self) -> bool {
        match self {
            Self::Syntax(_) => true,
            Self::Render(e) => e.kind() == minijinja::ErrorKind::SyntaxError,
            _ => false,
        }
    }
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Render(e) => write!(f, "template render error: {}", e),
            Self::Syntax(msg) => write!(f, "template syntax error: {}", msg),
            Self::Undefined(key) => write!(f, "failed to render template: \"{}\" not found", key),
            Self::Function(msg) => write!(f, "template function error: {}", msg),
        }
    }
}

impl std::error::Error for TemplateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Render(e) => Some(e),
            _ => None,
        }
    }
}

impl From<minijinja::Error> for TemplateError {
    fn from(err: minijinja::Error) -> Self {
        match err.kind() {
            minijinja::ErrorKind::UndefinedError => {
                Self::Undefined(err.detail().unwrap_or("unknown").to_string())
            }
            minijinja::ErrorKind::InvalidOperation => Self::Function(
                err.detail()
                    .map(str::to_string)
                    .unwrap_or_else(|| err.to_string()),
            ),
            _ => Self::Render(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undefined_names_the_missing_key() {
        let err = TemplateError::Undefined("Phases".to_string());
        assert_eq!(
            err.to_string(),
            "failed to render template: \"Phases\" not found"
        );
    }

    #[test]
    fn syntax_errors_are_flagged() {
        assert!(TemplateError::Syntax("unclosed action".to_string()).is_syntax());
        assert!(!TemplateError::Undefined("x".to_string()).is_syntax());
    }

    #[test]
    fn minijinja_undefined_maps_to_undefined() {
        let err = minijinja::Error::new(minijinja::ErrorKind::UndefinedError, "Output");
        assert!(matches!(TemplateError::from(err), TemplateError::Undefined(k) if k == "Output"));
    }
}
