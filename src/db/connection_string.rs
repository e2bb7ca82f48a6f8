// Connection Strings
// Builds and parses `KEY=value;` driver connection strings

use crate::db::config::ConnectionParams;

/// Build the driver connection string for `params`.
///
/// With a username: `DSN=<source>;UID=<user>;PWD=<password>`.
/// Without one, integrated authentication:
/// `DSN=<source>;INTEGRATED SECURITY=true;Trusted_Connection=yes`.
pub fn build(params: &ConnectionParams) -> String {
    let dsn = escape(&params.data_source);
    if params.uses_integrated_security() {
        format!("DSN={};INTEGRATED SECURITY=true;Trusted_Connection=yes", dsn)
    } else {
        format!(
            "DSN={};UID={};PWD={}",
            dsn,
            escape(params.username.trim()),
            escape(&params.password)
        )
    }
}

/// Replace the `PWD` value with asterisks, for logging.
pub fn mask_password(connection_string: &str) -> String {
    let parsed = ConnectionString::parse(connection_string);
    parsed
        .pairs
        .iter()
        .map(|(key, value)| {
            if key.eq_ignore_ascii_case("PWD") {
                format!("{}=***", key)
            } else {
                format!("{}={}", key, escape(value))
            }
        })
        .collect::<Vec<_>>()
        .join(";")
}

fn escape(value: &str) -> String {
    if value.contains(';') || value.contains('}') || value.starts_with('{') {
        format!("{{{}}}", value.replace('}', "}}"))
    } else {
        value.to_string()
    }
}

/// Parsed `KEY=value` pairs; keys compare case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionString {
    pairs: Vec<(String, String)>,
}

impl ConnectionString {
    pub fn parse(input: &str) -> Self {
        let mut pairs = Vec::new();
        let mut chars = input.chars().peekable();

        loop {
            let mut key = String::new();
            while let Some(&c) = chars.peek() {
                chars.next();
                if c == '=' || c == ';' {
                    if c == ';' {
                        key.clear();
                        continue;
                    }
                    break;
                }
                key.push(c);
            }
            let key = key.trim().to_string();
            if key.is_empty() && chars.peek().is_none() {
                break;
            }

            let mut value = String::new();
            if chars.peek() == Some(&'{') {
                chars.next();
                while let Some(c) = chars.next() {
                    if c == '}' {
                        if chars.peek() == Some(&'}') {
                            chars.next();
                            value.push('}');
                            continue;
                        }
                        break;
                    }
                    value.push(c);
                }
                // Skip anything up to the separator.
                for c in chars.by_ref() {
                    if c == ';' {
                        break;
                    }
                }
            } else {
                for c in chars.by_ref() {
                    if c == ';' {
                        break;
                    }
                    value.push(c);
                }
                value = value.trim().to_string();
            }

            if !key.is_empty() {
                pairs.push((key, value));
            }
            if chars.peek().is_none() {
                break;
            }
        }

        Self { pairs }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// True when the value for `key` reads as an affirmative flag.
    pub fn flag(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| {
            matches!(v.to_ascii_lowercase().as_str(), "true" | "yes" | "sspi" | "1")
        })
    }
}
