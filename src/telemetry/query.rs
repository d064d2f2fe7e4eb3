use std::collections::HashMap;

/// Errors raised while rendering a query template.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueryBuildError {
    #[error("placeholder ${{{0}}} has no bound value")]
    Unbound(String),

    #[error("unterminated placeholder at byte {0}")]
    Unterminated(usize),
}

/// Flux query template with `${name}` placeholders.
///
/// Bound values are always rendered as Flux string literals, so a value
/// taken from configuration can't change the shape of the query.
#[derive(Debug, Clone)]
pub struct FluxQuery {
    template: &'static str,
    params: HashMap<&'static str, String>,
}

impl FluxQuery {
    pub fn new(template: &'static str) -> Self {
        Self {
            template,
            params: HashMap::new(),
        }
    }

    pub fn bind(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.params.insert(name, value.into());
        self
    }

    pub fn render(&self) -> Result<String, QueryBuildError> {
        let mut out = String::with_capacity(self.template.len());
        let mut rest = self.template;
        let mut offset = 0;

        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find('}')
                .ok_or(QueryBuildError::Unterminated(offset + start))?;
            let name = &after[..end];
            let value = self
                .params
                .get(name)
                .ok_or_else(|| QueryBuildError::Unbound(name.to_string()))?;
            out.push_str(&string_literal(value));

            let consumed = start + 2 + end + 1;
            offset += consumed;
            rest = &rest[consumed..];
        }
        out.push_str(rest);

        Ok(out)
    }
}

/// Quote a value as a Flux string literal.
fn string_literal(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            // Flux interpolates ${...} inside string literals
            '$' if chars.peek() == Some(&'{') => quoted.push_str("\\$"),
            _ => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_binds_string_literals() {
        let query = FluxQuery::new("from(bucket: ${bucket}) |> filter(fn: (r) => r._measurement == ${m})")
            .bind("bucket", "speedtest")
            .bind("m", "net");
        assert_eq!(
            query.render().unwrap(),
            r#"from(bucket: "speedtest") |> filter(fn: (r) => r._measurement == "net")"#
        );
    }

    #[test]
    fn test_render_escapes_injection_attempt() {
        let query = FluxQuery::new("from(bucket: ${bucket})")
            .bind("bucket", r#"x") |> drop(columns: ["_value"]) //"#);
        assert_eq!(
            query.render().unwrap(),
            r#"from(bucket: "x\") |> drop(columns: [\"_value\"]) //")"#
        );
    }

    #[test]
    fn test_render_escapes_interpolation_and_backslash() {
        let query = FluxQuery::new("${v}").bind("v", r"a\b${c}$d");
        assert_eq!(query.render().unwrap(), r#""a\\b\${c}$d""#);
    }

    #[test]
    fn test_unbound_placeholder() {
        let err = FluxQuery::new("from(bucket: ${bucket})").render().unwrap_err();
        assert_eq!(err, QueryBuildError::Unbound("bucket".to_string()));
    }

    #[test]
    fn test_unterminated_placeholder() {
        let err = FluxQuery::new("abc ${bucket").render().unwrap_err();
        assert_eq!(err, QueryBuildError::Unterminated(4));
    }

    #[test]
    fn test_template_without_placeholders() {
        assert_eq!(FluxQuery::new("buckets()").render().unwrap(), "buckets()");
    }
}
