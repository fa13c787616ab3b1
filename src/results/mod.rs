//! Durable, at-least-once completion records for non-blocking actions.
//!
//! Each transaction gets a directory under the spool root named after its
//! `transaction_id`, holding up to five files: `metadata` (the
//! `action_metadata` JSON object), `pid`, `stdout`, `stderr`, and
//! `exitcode`. The presence of `exitcode` is the sole durable marker that an
//! action has finished; everything else may be rewritten in place.

pub mod mutex_registry;

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::AsyncWriteExt as _;

/// Errors raised while reading or writing a transaction's results directory.
#[derive(Debug, Error)]
pub enum ResultsStorageError {
    /// No results directory exists for the given transaction.
    #[error("no results directory for transaction {0}")]
    NotFound(String),
    /// An I/O operation against the spool directory failed.
    #[error("I/O error on transaction {transaction_id}: {source}")]
    Io {
        /// The transaction whose files could not be read or written.
        transaction_id: String,
        #[source]
        source: std::io::Error,
    },
    /// The `metadata` file did not contain valid JSON, or was not an object.
    #[error("malformed metadata for transaction {0}: {1}")]
    MalformedMetadata(String, serde_json::Error),
    /// The `pid` or `exitcode` file did not contain a valid integer.
    #[error("malformed {1} file for transaction {0}")]
    MalformedInteger(String, &'static str),
    /// The `metadata` file parsed as JSON but was not an object.
    #[error("metadata for transaction {0} is not a JSON object")]
    MetadataNotAnObject(String),
}

/// The captured process output for a finished action.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionOutput {
    /// Process exit code.
    pub exitcode: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

/// Filesystem-backed storage for non-blocking action results, rooted at a
/// single spool directory.
#[derive(Debug, Clone)]
pub struct ResultsStorage {
    spool_dir: PathBuf,
}

impl ResultsStorage {
    /// Build a [`ResultsStorage`] rooted at `spool_dir`. Does not touch the
    /// filesystem; the directory is created lazily on first write.
    #[must_use]
    pub fn new(spool_dir: impl Into<PathBuf>) -> Self {
        Self { spool_dir: spool_dir.into() }
    }

    /// The spool root this storage operates under.
    #[must_use]
    pub fn spool_dir(&self) -> &Path { &self.spool_dir }

    fn transaction_dir(&self, transaction_id: &str) -> PathBuf {
        self.spool_dir.join(transaction_id)
    }

    /// Returns `true` if a results directory exists for `transaction_id`.
    #[must_use]
    pub fn find(&self, transaction_id: &str) -> bool {
        self.transaction_dir(transaction_id).is_dir()
    }

    /// Create the results directory (if needed) and write the initial
    /// `metadata` file.
    ///
    /// # Errors
    /// Returns [`ResultsStorageError::Io`] if the directory cannot be
    /// created or the file cannot be written.
    pub async fn initialize_metadata_file(
        &self,
        transaction_id: &str,
        metadata: &Map<String, Value>,
    ) -> Result<(), ResultsStorageError> {
        let dir = self.transaction_dir(transaction_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| io_err(transaction_id, source))?;
        self.write_metadata_file(transaction_id, metadata).await
    }

    /// Overwrite the `metadata` file for an existing transaction.
    ///
    /// # Errors
    /// Returns [`ResultsStorageError::NotFound`] if no results directory
    /// exists, or [`ResultsStorageError::Io`] if the write fails.
    pub async fn update_metadata_file(
        &self,
        transaction_id: &str,
        metadata: &Map<String, Value>,
    ) -> Result<(), ResultsStorageError> {
        if !self.find(transaction_id) {
            return Err(ResultsStorageError::NotFound(transaction_id.to_owned()));
        }
        self.write_metadata_file(transaction_id, metadata).await
    }

    async fn write_metadata_file(
        &self,
        transaction_id: &str,
        metadata: &Map<String, Value>,
    ) -> Result<(), ResultsStorageError> {
        let dir = self.transaction_dir(transaction_id);
        let body = serde_json::to_vec_pretty(metadata).map_err(|e| ResultsStorageError::MalformedMetadata(transaction_id.to_owned(), e))?;
        atomic_write(&dir, "metadata", &body)
            .await
            .map_err(|source| io_err(transaction_id, source))
    }

    /// Read back the `action_metadata` object for `transaction_id`.
    ///
    /// # Errors
    /// Returns [`ResultsStorageError::NotFound`] if the metadata file is
    /// absent, [`ResultsStorageError::MalformedMetadata`] if it is not a
    /// JSON object, or [`ResultsStorageError::Io`] for other read failures.
    pub async fn get_action_metadata(&self, transaction_id: &str) -> Result<Map<String, Value>, ResultsStorageError> {
        let path = self.transaction_dir(transaction_id).join("metadata");
        let bytes = tokio::fs::read(&path).await.map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ResultsStorageError::NotFound(transaction_id.to_owned())
            } else {
                io_err(transaction_id, source)
            }
        })?;
        let value: Value = serde_json::from_slice(&bytes)
            .map_err(|e| ResultsStorageError::MalformedMetadata(transaction_id.to_owned(), e))?;
        value
            .as_object()
            .cloned()
            .ok_or_else(|| ResultsStorageError::MetadataNotAnObject(transaction_id.to_owned()))
    }

    /// Returns `true` if the `pid` file exists for `transaction_id`.
    #[must_use]
    pub fn pid_file_exists(&self, transaction_id: &str) -> bool {
        self.transaction_dir(transaction_id).join("pid").is_file()
    }

    /// Read the running pid from the `pid` file.
    ///
    /// # Errors
    /// Returns [`ResultsStorageError::Io`] if the file cannot be read, or
    /// [`ResultsStorageError::MalformedInteger`] if its content is not a
    /// valid integer.
    pub async fn get_pid(&self, transaction_id: &str) -> Result<u32, ResultsStorageError> {
        let path = self.transaction_dir(transaction_id).join("pid");
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| io_err(transaction_id, source))?;
        raw.trim()
            .parse()
            .map_err(|_| ResultsStorageError::MalformedInteger(transaction_id.to_owned(), "pid"))
    }

    /// Returns `true` if the `exitcode` file exists, the sole durable marker
    /// that the action has completed.
    #[must_use]
    pub fn output_is_ready(&self, transaction_id: &str) -> bool {
        self.transaction_dir(transaction_id).join("exitcode").is_file()
    }

    /// Read the captured `stdout`/`stderr`/`exitcode` for a finished action.
    ///
    /// # Errors
    /// Returns [`ResultsStorageError::Io`] if `stdout`/`stderr` exist but
    /// cannot be read, or [`ResultsStorageError::MalformedInteger`] if the
    /// `exitcode` file content is not a valid integer.
    pub async fn get_output(&self, transaction_id: &str) -> Result<ActionOutput, ResultsStorageError> {
        let dir = self.transaction_dir(transaction_id);
        let exitcode_raw = tokio::fs::read_to_string(dir.join("exitcode"))
            .await
            .map_err(|source| io_err(transaction_id, source))?;
        let exitcode = exitcode_raw
            .trim()
            .parse()
            .map_err(|_| ResultsStorageError::MalformedInteger(transaction_id.to_owned(), "exitcode"))?;
        self.get_output_with_exitcode(transaction_id, exitcode).await
    }

    /// Same as [`Self::get_output`], but takes the exit code from the caller
    /// instead of reading the `exitcode` file.
    ///
    /// # Errors
    /// Returns [`ResultsStorageError::Io`] if `stdout`/`stderr` exist but
    /// cannot be read.
    pub async fn get_output_with_exitcode(
        &self,
        transaction_id: &str,
        exitcode: i32,
    ) -> Result<ActionOutput, ResultsStorageError> {
        let dir = self.transaction_dir(transaction_id);
        let stdout = read_optional(&dir.join("stdout")).await.map_err(|source| io_err(transaction_id, source))?;
        let stderr = read_optional(&dir.join("stderr")).await.map_err(|source| io_err(transaction_id, source))?;
        Ok(ActionOutput { exitcode, stdout, stderr })
    }
}

async fn read_optional(path: &Path) -> Result<String, std::io::Error> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e),
    }
}

async fn atomic_write(dir: &Path, filename: &str, body: &[u8]) -> Result<(), std::io::Error> {
    let tmp_path = dir.join(format!(".{filename}.tmp"));
    let final_path = dir.join(filename);
    let file = tokio::fs::File::create(&tmp_path).await?;
    set_owner_only_permissions(&file).await?;
    let mut file = file;
    file.write_all(body).await?;
    file.flush().await?;
    tokio::fs::rename(&tmp_path, &final_path).await
}

#[cfg(unix)]
async fn set_owner_only_permissions(file: &tokio::fs::File) -> Result<(), std::io::Error> {
    use std::os::unix::fs::PermissionsExt as _;
    file.set_permissions(std::fs::Permissions::from_mode(0o640)).await
}

#[cfg(not(unix))]
async fn set_owner_only_permissions(_file: &tokio::fs::File) -> Result<(), std::io::Error> {
    Ok(())
}

fn io_err(transaction_id: &str, source: std::io::Error) -> ResultsStorageError {
    ResultsStorageError::Io { transaction_id: transaction_id.to_owned(), source }
}
