use std::path::Path;

use dwh_core::ERROR_FILE_NAME;
use dwh_storage::DwhFiles;
use tracing::error;

/// Persist the full error chain of a failed run as `<root>/error.log`.
///
/// Returns the written location. When the write itself fails the diagnostics
/// are only logged locally.
pub async fn capture_error(root: &Path, err: &anyhow::Error) -> Option<String> {
    let text = format!("{err:?}\n");
    match DwhFiles::for_root(root)
        .write_file(ERROR_FILE_NAME, text.as_bytes())
        .await
    {
        Ok(path) => Some(path.display().to_string()),
        Err(write_err) => {
            error!(
                root = %root.display(),
                error = %write_err,
                "error while capturing run failure to a file"
            );
            None
        }
    }
}
