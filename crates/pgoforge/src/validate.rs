use crate::error::ConfigError;

/// Every build input needs exactly one digest; an empty side never passes.
pub fn validate<S, C>(sources: &[S], checksums: &[C]) -> Result<(), ConfigError> {
    if sources.is_empty() || checksums.is_empty() || sources.len() != checksums.len() {
        return Err(ConfigError::StructuralMismatch {
            sources: sources.len(),
            checksums: checksums.len(),
        });
    }
    Ok(())
}
