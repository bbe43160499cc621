//! Helper functions to [`toml_span`].

use std::borrow::Cow;

use toml_span::{DeserError, value::ValueInner};

use crate::prelude::*;

/// Deserialize a TOML string into a value of the specified type.
pub fn from_toml_str<T>(toml_str: &str) -> Result<T, DeserError>
where
    T: toml_span::Deserialize<'static>,
{
    let mut value = toml_span::de::parse(toml_str)?.into_static_value();
    T::deserialize(&mut value)
}

/// Convert a `toml_span::Value<'_>` to a `toml_span::Value<'static>`.
pub trait IntoStaticValue {
    /// Our output type.
    type Output;

    /// Convert to a static value.
    fn into_static_value(self) -> Self::Output;
}

impl IntoStaticValue for toml_span::Value<'_> {
    type Output = toml_span::Value<'static>;

    fn into_static_value(mut self) -> Self::Output {
        let inner = self.take().into_static_value();
        toml_span::Value::with_span(inner, self.span)
    }
}

impl IntoStaticValue for ValueInner<'_> {
    type Output = ValueInner<'static>;

    fn into_static_value(self) -> Self::Output {
        match self {
            ValueInner::String(cow) => ValueInner::String(cow.into_owned().into()),
            ValueInner::Integer(i) => ValueInner::Integer(i),
            ValueInner::Float(f) => ValueInner::Float(f),
            ValueInner::Boolean(b) => ValueInner::Boolean(b),
            ValueInner::Array(values) => {
                let values = values
                    .into_iter()
                    .map(IntoStaticValue::into_static_value)
                    .collect();
                ValueInner::Array(values)
            }
            ValueInner::Table(btree_map) => {
                let btree_map = btree_map
                    .into_iter()
                    .map(|(k, v)| (k.into_static_value(), v.into_static_value()))
                    .collect();
                ValueInner::Table(btree_map)
            }
        }
    }
}

impl IntoStaticValue for toml_span::value::Key<'_> {
    type Output = toml_span::value::Key<'static>;

    fn into_static_value(self) -> Self::Output {
        toml_span::value::Key {
            name: self.name.into_owned().into(),
            span: self.span,
        }
    }
}

/// Create a custom [`DeserError`] with a span.
pub fn custom_deser_error(
    span: toml_span::Span,
    msg: impl Into<Cow<'static, str>>,
) -> DeserError {
    let err_kind = toml_span::ErrorKind::Custom(msg.into());
    let err = toml_span::Error::from((err_kind, span));
    DeserError::from(err)
}

/// Render every error in a [`DeserError`] as `path:line:column: message`,
/// one per line.
pub fn describe_deser_error(path: &Path, source: &str, err: &DeserError) -> String {
    let mut lines = Vec::with_capacity(err.errors.len());
    for error in &err.errors {
        let (line, column) = line_and_column(source, error.span.start as usize);
        lines.push(format!("{}:{line}:{column}: {error}", path.display()));
    }
    if lines.is_empty() {
        lines.push(format!("{}: invalid preset file", path.display()));
    }
    lines.join("\n")
}

/// 1-based line and column of a byte offset.
fn line_and_column(source: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(source.len());
    let before = source.get(..offset).unwrap_or(source);
    let line = before.matches('\n').count() + 1;
    let column = before
        .rfind('\n')
        .map(|nl| before[nl + 1..].chars().count())
        .unwrap_or_else(|| before.chars().count())
        + 1;
    (line, column)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_map_to_lines_and_columns() {
        let src = "a = 1\nbb = 2\n";
        assert_eq!(line_and_column(src, 0), (1, 1));
        assert_eq!(line_and_column(src, 6), (2, 1));
        assert_eq!(line_and_column(src, 9), (2, 4));
    }

    #[test]
    fn parse_errors_are_located() {
        let src = "name = \"x\"\nbroken = ";
        let err = from_toml_str::<crate::presets::CollectionPreset>(src);
        let Err(err) = err else {
            panic!("expected a parse error");
        };
        let msg = describe_deser_error(Path::new("p.toml"), src, &err);
        assert!(msg.starts_with("p.toml:2:"), "{msg}");
    }
}
