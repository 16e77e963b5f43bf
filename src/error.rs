#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Oracle,
    Store,
    Auth,
    Input,
    Internal,
}

impl ErrorCategory {
    pub fn code(self) -> &'static str {
        match self {
            ErrorCategory::Oracle => "ORACLE",
            ErrorCategory::Store => "STORE",
            ErrorCategory::Auth => "AUTH",
            ErrorCategory::Input => "INPUT",
            ErrorCategory::Internal => "INTERNAL",
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            ErrorCategory::Oracle => {
                "Check --ai-base-url/--ai-model and that the API key env var (default LINKBOX_AI_API_KEY) is set."
            }
            ErrorCategory::Store => {
                "Check --db-url and run `linkbox migrate` to create or upgrade the schema."
            }
            ErrorCategory::Auth => "Create a token with `linkbox users create --username <name>`.",
            ErrorCategory::Input => "Run linkbox --help and correct command arguments.",
            ErrorCategory::Internal => {
                "Retry with RUST_LOG=debug. If it persists, capture logs and open an issue."
            }
        }
    }
}

pub fn categorize_error(err: &anyhow::Error) -> ErrorCategory {
    let msg = format!("{err:#}").to_ascii_lowercase();

    if msg.contains("api key")
        || msg.contains("chat completion")
        || msg.contains("oracle")
        || msg.contains("ai endpoint")
    {
        return ErrorCategory::Oracle;
    }

    if msg.contains("token") || msg.contains("unauthorized") {
        return ErrorCategory::Auth;
    }

    if msg.contains("invalid value")
        || msg.contains("unknown argument")
        || msg.contains("profile")
        || msg.contains("cannot be empty")
        || msg.contains("bind address")
    {
        return ErrorCategory::Input;
    }

    if msg.contains("sqlite") || msg.contains("database") || msg.contains("migrat") {
        return ErrorCategory::Store;
    }

    ErrorCategory::Internal
}

pub fn format_cli_error(err: &anyhow::Error, show_sensitive_config: bool) -> String {
    let category = categorize_error(err);
    let rendered_error = render_error_message(err, show_sensitive_config);
    format!(
        "[{}] {}\nHint: {}",
        category.code(),
        rendered_error,
        category.hint()
    )
}

pub fn render_error_message(err: &anyhow::Error, show_sensitive_config: bool) -> String {
    let message = format!("{err:#}");
    if show_sensitive_config {
        message
    } else {
        redact_sensitive_text(&message)
    }
}

pub fn redact_sensitive_text(text: &str) -> String {
    redact_bearer_tokens(&redact_sqlite_urls(text))
}

fn token_end(remainder: &str) -> usize {
    remainder
        .find(|ch: char| {
            ch.is_whitespace()
                || matches!(
                    ch,
                    '"' | '\'' | '(' | ')' | '[' | ']' | '{' | '}' | ',' | ';'
                )
        })
        .unwrap_or(remainder.len())
}

pub fn redact_sqlite_urls(text: &str) -> String {
    const SQLITE_PREFIX: &str = "sqlite:";
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0usize;

    while let Some(offset) = text[cursor..].find(SQLITE_PREFIX) {
        let start = cursor + offset;
        out.push_str(&text[cursor..start]);

        let remainder = &text[start..];
        let end = token_end(remainder);
        out.push_str(&redact_sqlite_url_value(&remainder[..end]));
        cursor = start + end;
    }

    out.push_str(&text[cursor..]);
    out
}

pub fn redact_sqlite_url_value(value: &str) -> String {
    if value.starts_with("sqlite://") {
        "sqlite://[REDACTED]".to_string()
    } else if value.starts_with("sqlite:") {
        "sqlite:[REDACTED]".to_string()
    } else {
        value.to_string()
    }
}

pub fn redact_bearer_tokens(text: &str) -> String {
    const BEARER_PREFIX: &str = "Bearer ";
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0usize;

    while let Some(offset) = text[cursor..].find(BEARER_PREFIX) {
        let start = cursor + offset + BEARER_PREFIX.len();
        out.push_str(&text[cursor..start]);
        let end = token_end(&text[start..]);
        if end > 0 {
            out.push_str("[REDACTED]");
        }
        cursor = start + end;
    }

    out.push_str(&text[cursor..]);
    out
}
