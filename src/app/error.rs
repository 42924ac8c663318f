use std::process::ExitCode;

use crate::Error;

/// Maps any fatal error to this tool's exit code. The richer `Error` enum
/// stays useful for logging and tests, but the CLI surface is pinned to
/// exactly `{0, 1}`: configuration, registration, and image-resolution
/// failures are all equally "setup failed, nothing is running".
pub fn exit_code(_err: &Error) -> ExitCode {
    ExitCode::FAILURE
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn every_error_variant_maps_to_failure() {
        let err = Error::InvalidConfig {
            path: PathBuf::from("spec.json"),
            message: "bad".to_string(),
        };
        assert_eq!(exit_code(&err), ExitCode::FAILURE);
    }
}
