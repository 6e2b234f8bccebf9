//! Input naming and output materialization for batch items

use std::path::{Path, PathBuf};

use crate::error::OperationError;

/// Inputs accepted by a batch.
///
/// `source` is a human-readable descriptor (usually a path). Inputs without
/// one, like raw bytes, are named after their index.
pub trait BatchInput {
    fn source(&self) -> Option<String> {
        None
    }

    /// Base name used for the `{name}` placeholder.
    fn file_name(&self) -> Option<String> {
        let source = self.source()?;
        Path::new(&source)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
    }
}

impl BatchInput for PathBuf {
    fn source(&self) -> Option<String> {
        Some(self.display().to_string())
    }
}

impl BatchInput for String {
    fn source(&self) -> Option<String> {
        Some(self.clone())
    }
}

impl BatchInput for &'static str {
    fn source(&self) -> Option<String> {
        Some((*self).to_string())
    }
}

impl BatchInput for Vec<u8> {}

impl BatchInput for () {}

pub(crate) fn describe_input<I: BatchInput + ?Sized>(input: &I, index: usize) -> String {
    input
        .source()
        .unwrap_or_else(|| format!("bytes_input_{index}"))
}

pub(crate) fn output_name<I: BatchInput + ?Sized>(input: &I, index: usize) -> String {
    input
        .file_name()
        .unwrap_or_else(|| format!("image_{index}.png"))
}

/// Successful results that can be written to disk.
pub trait Payload: Send + Sync {
    fn bytes(&self) -> &[u8];
}

impl Payload for Vec<u8> {
    fn bytes(&self) -> &[u8] {
        self
    }
}

impl Payload for String {
    fn bytes(&self) -> &[u8] {
        self.as_bytes()
    }
}

/// Filename template with `{index}` and `{name}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTemplate(String);

impl OutputTemplate {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    pub fn pattern(&self) -> &str {
        &self.0
    }

    /// Substitute the placeholders; unknown braces are left untouched.
    pub fn render(&self, index: usize, name: &str) -> String {
        self.0
            .replace("{index}", &index.to_string())
            .replace("{name}", name)
    }

    pub fn path_in(&self, dir: &Path, index: usize, name: &str) -> PathBuf {
        dir.join(self.render(index, name))
    }
}

impl Default for OutputTemplate {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_OUTPUT_PATTERN)
    }
}

/// Write one payload, creating the directory if needed.
pub(crate) async fn persist<T: Payload + ?Sized>(
    payload: &T,
    path: &Path,
) -> Result<(), OperationError> {
    let to_persist_error = |e: std::io::Error| OperationError::Persist {
        path: path.to_path_buf(),
        message: e.to_string(),
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(to_persist_error)?;
    }
    tokio::fs::write(path, payload.bytes())
        .await
        .map_err(to_persist_error)
}
