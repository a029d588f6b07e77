// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The configuration format for `cardsign`.
//!
//! Configuration is provided via a command-line argument or environment
//! variable (`CARDSIGN_CONFIG`). The configuration should be in TOML format.
//!
//! The [`Config`] has several top-level settings, as well as a list of one or
//! more signing [`Profile`] settings.
//!
//! There is no configuration merging: a configuration file must contain
//! settings for _all_ required fields.
//!
//! To validate your configuration, refer to the `cardsign config` command.

use std::{collections::HashSet, path::PathBuf, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, job::CertificateIdentity};

/// The configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The directory holding the channel socket and lock file.
    ///
    /// It must not be accessible to other users. If unset,
    /// `$XDG_RUNTIME_DIR/cardsign` is used, or `/tmp/cardsign-<uid>` when
    /// `XDG_RUNTIME_DIR` is not set.
    pub runtime_directory: Option<PathBuf>,

    /// The number of seconds the server waits without any work before it exits.
    ///
    /// Cached PINs are forgotten when the server exits. Set to 0 to keep the
    /// server running until it is interrupted.
    pub idle_timeout_secs: u64,

    /// The pinentry program used to ask for smart card PINs.
    ///
    /// Any program speaking the Assuan pinentry protocol works, for example
    /// `pinentry-gnome3`, `pinentry-qt` or `pinentry-curses`.
    pub pinentry: PathBuf,

    /// A command that exits successfully when the card for a profile is present.
    ///
    /// The strings `{reader}`, `{card}` and `{cert}` in any argument are
    /// replaced with the profile's `card_reader`, `card_name` and `cert_id`. If
    /// unset, the card is assumed to be present.
    ///
    /// # Example
    ///
    /// ```toml
    /// card_status_command = ["pkcs11-tool", "--list-token-slots"]
    /// ```
    pub card_status_command: Option<Vec<String>>,

    /// The shortest PIN accepted from the prompt.
    pub min_pin_length: usize,

    /// The longest PIN accepted from the prompt.
    pub max_pin_length: usize,

    /// The signing profiles; the first one is used unless another is requested.
    pub profiles: Vec<Profile>,
}

/// A certificate on a smart card and the tool used to sign with it.
///
/// All jobs submitted with the same profile share one cached PIN.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// The name used to select this profile on the command line.
    pub name: String,
    /// The key container (certificate) identifier on the card.
    pub cert_id: String,
    /// The name of the smart card.
    pub card_name: String,
    /// The reader holding the card.
    pub card_reader: String,
    /// The command line run for every file.
    ///
    /// `%1` is replaced with the absolute path of the file and `%2` with the
    /// PIN. If `%2` is not used, the PIN is written to the tool's standard
    /// input instead. `%%` is a literal `%`. Arguments are separated by
    /// whitespace and may be grouped with double quotes.
    pub sign_command: String,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            name: "default".into(),
            cert_id: "01".into(),
            card_name: "PIV Card".into(),
            card_reader: "Yubico YubiKey CCID 00 00".into(),
            sign_command: "osslsigncode sign -pkcs11module /usr/lib/opensc-pkcs11.so \
                           -key \"pkcs11:id=%%01;pin-value=%2\" -certs codesign.pem \
                           -in %1 -out %1.signed"
                .into(),
        }
    }
}

impl Profile {
    /// The certificate this profile signs with.
    pub fn identity(&self) -> CertificateIdentity {
        CertificateIdentity::new(&self.cert_id, &self.card_name, &self.card_reader)
    }
}

impl Config {
    /// The runtime directory to use.
    pub fn runtime_directory(&self) -> PathBuf {
        self.runtime_directory
            .clone()
            .unwrap_or_else(crate::channel::default_runtime_directory)
    }

    /// The idle timeout, if enabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    /// Look up a profile by name, or the first profile if no name is given.
    pub fn profile(&self, name: Option<&str>) -> Result<&Profile, ConfigError> {
        match name {
            Some(name) => self
                .profiles
                .iter()
                .find(|profile| profile.name == name)
                .ok_or_else(|| ConfigError::UnknownProfile(name.to_string())),
            None => self.profiles.first().ok_or(ConfigError::NoProfiles),
        }
    }

    /// Check the configuration file for validity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.profiles.is_empty() {
            return Err(ConfigError::NoProfiles);
        }
        let mut names = HashSet::new();
        for profile in &self.profiles {
            if !names.insert(profile.name.as_str()) {
                return Err(ConfigError::DuplicateProfile(profile.name.clone()));
            }
            if profile.sign_command.trim().is_empty() {
                return Err(ConfigError::EmptySignCommand(profile.name.clone()));
            }
        }
        if self.min_pin_length == 0 || self.min_pin_length > self.max_pin_length {
            return Err(ConfigError::PinBounds {
                min: self.min_pin_length,
                max: self.max_pin_length,
            });
        }

        Ok(())
    }
}

impl std::fmt::Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            toml::ser::to_string_pretty(&self).unwrap_or_default()
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runtime_directory: None,
            idle_timeout_secs: 300,
            pinentry: PathBuf::from("pinentry"),
            card_status_command: None,
            min_pin_length: 4,
            max_pin_length: 64,
            profiles: vec![Profile::default()],
        }
    }
}

pub(crate) fn load(path: &str) -> anyhow::Result<Config> {
    let config = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read from path {path:?}"))?;
    tracing::info!(%path, "Read from configuration file");
    let config: Config = toml::from_str(&config)
        .inspect_err(|error| {
            eprintln!("Failed to parse configuration loaded from {path:?}:\n{error}");
            eprintln!("Example config file:\n\n{}", Config::default());
        })
        .context("configuration file is invalid")?;
    config
        .validate()
        .with_context(|| format!("configuration file {path:?} is invalid"))?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn default_is_valid_and_round_trips() -> anyhow::Result<()> {
        let config = Config::default();
        config.validate()?;

        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, "{config}")?;
        let loaded = load(file.path().to_str().expect("utf-8 temp path"))?;
        assert_eq!(loaded.profiles[0].sign_command, config.profiles[0].sign_command);
        assert_eq!(loaded.idle_timeout(), Some(Duration::from_secs(300)));
        Ok(())
    }

    #[test]
    fn profiles_are_selected_by_name() -> anyhow::Result<()> {
        let mut config = Config::default();
        config.profiles.push(Profile {
            name: "release".into(),
            cert_id: "02".into(),
            ..Profile::default()
        });

        assert_eq!(config.profile(None)?.name, "default");
        assert_eq!(config.profile(Some("release"))?.identity().cert_id, "02");
        assert!(matches!(
            config.profile(Some("nightly")),
            Err(ConfigError::UnknownProfile(name)) if name == "nightly"
        ));
        Ok(())
    }

    #[test]
    fn invalid_configurations_are_rejected() {
        let config = Config {
            profiles: vec![],
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::NoProfiles)));

        let config = Config {
            profiles: vec![Profile::default(), Profile::default()],
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateProfile(_))
        ));

        let config = Config {
            profiles: vec![Profile {
                sign_command: "  ".into(),
                ..Profile::default()
            }],
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EmptySignCommand(_))
        ));

        let config = Config {
            min_pin_length: 9,
            max_pin_length: 8,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PinBounds { min: 9, max: 8 })
        ));
    }

    #[test]
    fn zero_disables_idle_timeout() {
        let config = Config {
            idle_timeout_secs: 0,
            ..Config::default()
        };
        assert_eq!(config.idle_timeout(), None);
    }
}
