use std::fmt;

/// Identifies a query whose complete result is cached in a repository.
///
/// Built from the query name plus its arguments. Each argument starts with
/// NUL and a presence tag: `-` when absent, `+<len>:` before a present
/// value. The length keeps values containing NUL or tags from running into
/// the next argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionKey(String);

impl CollectionKey {
    pub fn new(method: &str) -> Self {
        CollectionKey(method.to_string())
    }

    pub fn arg(mut self, arg: Option<impl fmt::Display>) -> Self {
        self.0.push('\0');
        match arg {
            Some(arg) => {
                let value = arg.to_string();
                self.0.push_str(&format!("+{}:{}", value.len(), value));
            }
            None => self.0.push('-'),
        }
        self
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
