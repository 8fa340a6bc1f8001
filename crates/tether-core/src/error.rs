use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A start request raced against a run that is still live for the same
    /// identity. The caller must wait for it to finish or abort it first.
    #[error("a live run already exists for `{0}`")]
    RunExists(String),

    #[error("no run found for `{0}`")]
    RunNotFound(String),
}
