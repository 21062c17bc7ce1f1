//! Built-in extractor implementations.

pub mod docx;
pub mod pdf_text;
pub mod plain_text;

pub use docx::DocxExtractor;
pub use pdf_text::PdfTextExtractor;
pub use plain_text::PlainTextExtractor;

use std::ffi::OsStr;
use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::time::Duration;

use tokio::process::Command;

use lectern_core::ExtractionError;

/// Lower-cased file extension, if any.
pub(crate) fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(OsStr::to_str)
        .map(str::to_ascii_lowercase)
}

/// Run an external converter and return its stdout.
///
/// A missing binary is `MissingCapability`, a non-zero exit is `Corruption`
/// and exceeding `timeout` is `Timeout`. The child is killed if the future
/// is dropped.
pub(crate) async fn run_command(
    program: &str,
    args: &[&OsStr],
    timeout: Duration,
) -> Result<Vec<u8>, ExtractionError> {
    let mut cmd = Command::new(program);
    cmd.args(args).kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Err(_) => {
            return Err(ExtractionError::timeout(format!(
                "{} timed out after {}s",
                program,
                timeout.as_secs()
            )))
        }
        Ok(Err(e)) if e.kind() == IoErrorKind::NotFound => {
            return Err(ExtractionError::missing_capability(format!(
                "{} is not installed",
                program
            )))
        }
        Ok(Err(e)) => {
            return Err(ExtractionError::unknown(format!(
                "failed to run {}: {}",
                program, e
            )))
        }
        Ok(Ok(output)) => output,
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ExtractionError::corruption(format!(
            "{} failed ({}): {}",
            program,
            output.status,
            stderr.trim()
        )));
    }

    Ok(output.stdout)
}

/// Whether an external program can be launched.
pub(crate) async fn program_available(program: &str, version_flag: &str) -> bool {
    match Command::new(program)
        .arg(version_flag)
        .kill_on_drop(true)
        .output()
        .await
    {
        // pdftotext -v exits 99 on some poppler versions.
        Ok(output) => output.status.success() || output.status.code() == Some(99),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lectern_core::ErrorKind;

    #[test]
    fn test_extension_lowercased() {
        assert_eq!(extension(Path::new("A.PDF")).as_deref(), Some("pdf"));
        assert_eq!(extension(Path::new("noext")), None);
    }

    #[tokio::test]
    async fn test_run_command_missing_binary() {
        let err = run_command(
            "lectern-no-such-binary",
            &[OsStr::new("x")],
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::MissingCapability);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_nonzero_exit_is_corruption() {
        let err = run_command("false", &[], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Corruption);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_timeout() {
        let err = run_command("sleep", &[OsStr::new("5")], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_stdout() {
        let out = run_command("echo", &[OsStr::new("hello")], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&out).trim(), "hello");
    }
}
