//! Named HTML email templates, compiled with askama.
//!
//! Values from `templateData` are HTML-escaped on output and never
//! re-interpreted as template syntax. Built once at startup and shared as
//! `Arc<TemplateRegistry>`; there is no global template cache.

use askama::Template;

use postbox_common::error::AppError;

#[derive(Template)]
#[template(path = "emails/welcome.html")]
struct WelcomeEmail {
    name: String,
    login_url: String,
}

#[derive(Template)]
#[template(path = "emails/comeback.html")]
struct ComebackEmail {
    name: String,
    login_url: String,
}

/// The templates a send request may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailTemplate {
    Welcome,
    Comeback,
}

impl EmailTemplate {
    pub const ALL: [EmailTemplate; 2] = [EmailTemplate::Welcome, EmailTemplate::Comeback];

    pub fn name(self) -> &'static str {
        match self {
            EmailTemplate::Welcome => "welcome",
            EmailTemplate::Comeback => "comeback",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }

    fn render(self, data: &serde_json::Value) -> askama::Result<String> {
        let name = field(data, "name");
        let login_url = field(data, "login_url");
        match self {
            EmailTemplate::Welcome => WelcomeEmail { name, login_url }.render(),
            EmailTemplate::Comeback => ComebackEmail { name, login_url }.render(),
        }
    }
}

#[derive(Debug)]
pub struct TemplateRegistry {
    templates: Vec<EmailTemplate>,
}

impl TemplateRegistry {
    /// Registry with the `welcome` and `comeback` templates.
    pub fn with_builtin() -> Self {
        let registry = Self {
            templates: EmailTemplate::ALL.to_vec(),
        };
        tracing::info!(count = registry.templates.len(), "Email templates loaded");
        registry
    }

    fn lookup(&self, name: &str) -> Option<EmailTemplate> {
        EmailTemplate::from_name(name).filter(|t| self.templates.contains(t))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// Render `name` with the top-level fields of `data`. Missing fields
    /// render empty.
    pub fn render(&self, name: &str, data: &serde_json::Value) -> Result<String, AppError> {
        let template = self
            .lookup(name)
            .ok_or_else(|| AppError::Validation(format!("Unknown template '{}'", name)))?;

        template
            .render(data)
            .map_err(|e| AppError::Internal(format!("failed to render template '{}': {}", name, e)))
    }
}

fn field(data: &serde_json::Value, key: &str) -> String {
    match data.get(key) {
        Some(serde_json::Value::String(s)) => s.clone(),
        None | Some(serde_json::Value::Null) => String::new(),
        Some(other) => other.to_string(),
    }
}
