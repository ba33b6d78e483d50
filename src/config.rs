//! Configuration for the client CLI: API credentials via `ortho_config` and
//! the per-run execution settings assembled from CLI arguments.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Container image repository the server image types resolve against.
pub const BASE_IMAGE: &str = "caravel/caravel-server";

/// Remote directory that receives an uploaded command file.
pub const REMOTE_TMP_DIR: &str = "/tmp";

/// Remote working directory synchronised with the local sync dir.
pub const REMOTE_WORK_DIR: &str = "/workdir";

/// Environment variable carrying the authorized public key into the
/// container.
pub const PUBLIC_KEY_ENV: &str = "CARAVEL_PUBLIC_KEY";

/// Environment variable carrying the base command into the container.
pub const COMMAND_ENV: &str = "CARAVEL_COMMAND";

/// Base command exported to freshly provisioned containers.
pub const DEFAULT_BASE_COMMAND: &str = "/bin/bash";

/// Image type keywords with a published server image variant.
pub const IMAGE_TYPES: &[&str] = &[
    "alpine", "debian", "ubuntu", "centos", "golang", "node", "php", "python", "python2", "ruby",
    "ansible",
];

/// Platform API credentials and endpoint, loaded via `ortho-config` from
/// configuration files and `CARAVEL_*` environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "CARAVEL")]
pub struct PlatformApiConfig {
    /// API token identifying the account.
    pub api_token: String,
    /// API secret paired with the token.
    pub api_secret: String,
    /// Base URL of the platform API.
    #[ortho_config(default = "https://api.caravel.cloud/v1".to_owned())]
    pub api_endpoint: String,
}

impl PlatformApiConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("caravel")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Ensures credentials are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(&self.api_token, "API token", "CARAVEL_API_TOKEN", "api_token")?;
        Self::require_field(
            &self.api_secret,
            "API secret",
            "CARAVEL_API_SECRET",
            "api_secret",
        )?;
        Self::require_field(
            &self.api_endpoint,
            "API endpoint",
            "CARAVEL_API_ENDPOINT",
            "api_endpoint",
        )?;
        Ok(())
    }

    fn require_field(
        value: &str,
        description: &str,
        env_var: &str,
        toml_key: &str,
    ) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {description}: set {env_var} or add {toml_key} to caravel.toml"
            )));
        }
        Ok(())
    }
}

/// Immutable-after-validation settings for one remote run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunConfig {
    /// OpenSSH public key; generated when empty.
    pub public_key: String,
    /// OpenSSH private key; generated when empty.
    pub private_key: String,
    /// Application name shown by the platform.
    pub app_name: String,
    /// Plan identifier to provision under.
    pub plan: String,
    /// Image type keyword resolved against [`BASE_IMAGE`].
    pub image_type: String,
    /// Explicit image reference; overrides the image type when non-empty.
    pub image_name: String,
    /// Shell command tokens to run remotely.
    pub commands: Vec<String>,
    /// Script file uploaded and executed instead of command tokens.
    pub command_file: Option<Utf8PathBuf>,
    /// Local directory synchronised with the remote working directory.
    pub sync_dir: Option<Utf8PathBuf>,
    /// Skip the download phase.
    pub upload_only: bool,
    /// Skip the upload phase.
    pub download_only: bool,
    /// Bound on provisioning plus boot.
    pub boot_timeout: Duration,
    /// Bound on each transfer and on command execution.
    pub exec_timeout: Duration,
}

impl RunConfig {
    /// Returns the image reference to provision: the explicit image name when
    /// set, otherwise the base image tagged with the image type.
    #[must_use]
    pub fn image(&self) -> String {
        if self.image_name.is_empty() {
            format!("{BASE_IMAGE}:{}", self.image_type)
        } else {
            self.image_name.clone()
        }
    }

    /// Returns the file name of the configured command file, if any.
    #[must_use]
    pub fn command_file_name(&self) -> Option<&str> {
        self.command_file.as_deref().and_then(Utf8Path::file_name)
    }

    /// Returns the sync dir when it is configured and exists locally.
    #[must_use]
    pub fn existing_sync_dir(&self) -> Option<&Utf8Path> {
        self.sync_dir
            .as_deref()
            .filter(|path| path.symlink_metadata().is_ok())
    }

    /// Checks the run settings for contradictions before any remote call.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a public key is supplied without its
    /// private half, when upload-only and download-only are both set, when
    /// command tokens and a command file are both (or neither) given, when
    /// the command file would never be uploaded, when the image type
    /// keyword is unknown, when the command file is missing or empty, or
    /// when the sync dir names an existing file.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.private_key.is_empty() && !self.public_key.is_empty() {
            return Err(ConfigError::PartialKeyPair);
        }
        if self.upload_only && self.download_only {
            return Err(ConfigError::ExclusiveSyncModes);
        }
        if self.download_only && self.command_file.is_some() {
            return Err(ConfigError::CommandFileNeedsUpload);
        }
        match (&self.command_file, self.commands.is_empty()) {
            (Some(_), false) => return Err(ConfigError::AmbiguousCommandSource),
            (None, true) => return Err(ConfigError::NoCommand),
            _ => {}
        }
        if self.image_name.is_empty() && !IMAGE_TYPES.contains(&self.image_type.as_str()) {
            return Err(ConfigError::UnknownImageType {
                value: self.image_type.clone(),
            });
        }
        if let Some(path) = &self.command_file {
            Self::validate_command_file(path)?;
        }
        if let Some(path) = &self.sync_dir {
            if path.is_file() {
                return Err(ConfigError::SyncDirIsFile { path: path.clone() });
            }
        }
        Ok(())
    }

    fn validate_command_file(path: &Utf8Path) -> Result<(), ConfigError> {
        let metadata = path
            .metadata()
            .map_err(|_| ConfigError::CommandFileMissing { path: path.to_owned() })?;
        if metadata.is_dir() {
            return Err(ConfigError::CommandFileIsDir { path: path.to_owned() });
        }
        if metadata.len() == 0 {
            return Err(ConfigError::CommandFileEmpty { path: path.to_owned() });
        }
        Ok(())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// A public key was supplied without the private half it belongs to.
    #[error("a public key without its private half cannot authenticate; supply the private key too")]
    PartialKeyPair,
    /// Upload-only and download-only cannot both be requested.
    #[error("--upload-only and --download-only are mutually exclusive")]
    ExclusiveSyncModes,
    /// A command file cannot run when the upload phase is skipped.
    #[error("--command-file cannot be combined with --download-only; the script would never be uploaded")]
    CommandFileNeedsUpload,
    /// Command tokens and a command file cannot both be given.
    #[error("command arguments cannot be combined with --command-file")]
    AmbiguousCommandSource,
    /// Neither command tokens nor a command file were given.
    #[error("either a command or --command-file is required")]
    NoCommand,
    /// The image type keyword has no published server image.
    #[error("unknown image type '{value}', expected one of: alpine/debian/ubuntu/…")]
    UnknownImageType {
        /// Keyword supplied by the caller.
        value: String,
    },
    /// The configured command file does not exist.
    #[error("command file {path} does not exist")]
    CommandFileMissing {
        /// Path supplied by the caller.
        path: Utf8PathBuf,
    },
    /// The configured command file is a directory.
    #[error("command file {path} is a directory")]
    CommandFileIsDir {
        /// Path supplied by the caller.
        path: Utf8PathBuf,
    },
    /// The configured command file is empty.
    #[error("command file {path} is empty")]
    CommandFileEmpty {
        /// Path supplied by the caller.
        path: Utf8PathBuf,
    },
    /// The configured sync dir names an existing regular file.
    #[error("sync dir {path} already exists as a file")]
    SyncDirIsFile {
        /// Path supplied by the caller.
        path: Utf8PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};
    use std::io::Write as _;

    #[fixture]
    fn base_config() -> RunConfig {
        RunConfig {
            public_key: String::new(),
            private_key: String::new(),
            app_name: String::from("caravel-server"),
            plan: String::from("free"),
            image_type: String::from("alpine"),
            image_name: String::new(),
            commands: vec![String::from("echo"), String::from("hello")],
            command_file: None,
            sync_dir: None,
            upload_only: false,
            download_only: false,
            boot_timeout: Duration::from_secs(600),
            exec_timeout: Duration::from_secs(3600),
        }
    }

    #[rstest]
    fn validate_accepts_plain_command(base_config: RunConfig) {
        assert!(base_config.validate().is_ok());
    }

    #[rstest]
    fn validate_rejects_lone_public_key(base_config: RunConfig) {
        let cfg = RunConfig {
            public_key: String::from("ssh-rsa AAAA caravel"),
            ..base_config
        };
        assert_eq!(cfg.validate(), Err(ConfigError::PartialKeyPair));
    }

    #[rstest]
    fn validate_accepts_lone_private_key(base_config: RunConfig) {
        let cfg = RunConfig {
            private_key: String::from("key material"),
            ..base_config
        };
        assert!(cfg.validate().is_ok());
    }

    #[rstest]
    fn validate_rejects_both_sync_modes(base_config: RunConfig) {
        let cfg = RunConfig {
            upload_only: true,
            download_only: true,
            ..base_config
        };
        assert_eq!(cfg.validate(), Err(ConfigError::ExclusiveSyncModes));
    }

    #[rstest]
    fn validate_rejects_missing_command(base_config: RunConfig) {
        let cfg = RunConfig {
            commands: Vec::new(),
            ..base_config
        };
        assert_eq!(cfg.validate(), Err(ConfigError::NoCommand));
    }

    #[rstest]
    fn validate_rejects_command_plus_file(base_config: RunConfig) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("task.sh");
        std::fs::write(&path, "echo hi\n").expect("write script");
        let cfg = RunConfig {
            command_file: Some(Utf8PathBuf::from_path_buf(path).expect("utf8 path")),
            ..base_config
        };
        assert_eq!(cfg.validate(), Err(ConfigError::AmbiguousCommandSource));
    }

    #[rstest]
    fn validate_rejects_command_file_with_download_only(base_config: RunConfig) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("task.sh");
        std::fs::write(&path, "echo hi\n").expect("write script");
        let cfg = RunConfig {
            commands: Vec::new(),
            command_file: Some(Utf8PathBuf::from_path_buf(path).expect("utf8 path")),
            download_only: true,
            ..base_config
        };
        assert_eq!(cfg.validate(), Err(ConfigError::CommandFileNeedsUpload));
    }

    #[rstest]
    fn validate_rejects_unknown_image_type(base_config: RunConfig) {
        let cfg = RunConfig {
            image_type: String::from("plan9"),
            ..base_config
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::UnknownImageType { .. })
        ));
    }

    #[rstest]
    fn explicit_image_name_bypasses_type_catalogue(base_config: RunConfig) {
        let cfg = RunConfig {
            image_type: String::from("plan9"),
            image_name: String::from("example/custom:latest"),
            ..base_config
        };
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.image(), "example/custom:latest");
    }

    #[rstest]
    fn image_resolves_from_type_keyword(base_config: RunConfig) {
        assert_eq!(base_config.image(), "caravel/caravel-server:alpine");
    }

    #[rstest]
    fn validate_rejects_empty_command_file(base_config: RunConfig) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("task.sh");
        let file = std::fs::File::create(&path).expect("create script");
        drop(file);
        let cfg = RunConfig {
            commands: Vec::new(),
            command_file: Some(Utf8PathBuf::from_path_buf(path).expect("utf8 path")),
            ..base_config
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::CommandFileEmpty { .. })
        ));
    }

    #[rstest]
    fn validate_rejects_sync_dir_that_is_a_file(base_config: RunConfig) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("workdir");
        let mut file = std::fs::File::create(&path).expect("create file");
        writeln!(file, "not a dir").expect("write file");
        let cfg = RunConfig {
            sync_dir: Some(Utf8PathBuf::from_path_buf(path).expect("utf8 path")),
            ..base_config
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::SyncDirIsFile { .. })
        ));
    }

    #[rstest]
    fn missing_sync_dir_is_not_an_error(base_config: RunConfig) {
        let cfg = RunConfig {
            sync_dir: Some(Utf8PathBuf::from("/nonexistent/caravel-sync")),
            ..base_config
        };
        assert!(cfg.validate().is_ok());
        assert!(cfg.existing_sync_dir().is_none());
    }
}
