// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Smart card checks backed by external tools.

use std::process::{Command, Stdio};

use crate::{
    credentials::{CardProvider, Pin},
    error::CredentialError,
    job::CertificateIdentity,
};

/// Checks card presence by running a configured command.
///
/// The command's arguments may reference `{reader}`, `{card}` and `{cert}`,
/// which are replaced with the fields of the certificate identity. A zero exit
/// status means the card is present. Without a command the card is assumed to
/// be present and the signing tool reports a missing card itself.
///
/// PIN validation is limited to what can be checked without touching the key:
/// the length must lie within the configured bounds and the PIN must not contain
/// control characters. A PIN that passes may still be refused by the signing tool.
#[derive(Debug, Clone)]
pub struct CommandCardProvider {
    status_command: Option<Vec<String>>,
    min_pin_length: usize,
    max_pin_length: usize,
}

impl CommandCardProvider {
    pub fn new(
        status_command: Option<Vec<String>>,
        min_pin_length: usize,
        max_pin_length: usize,
    ) -> Self {
        Self {
            status_command,
            min_pin_length,
            max_pin_length,
        }
    }
}

impl CardProvider for CommandCardProvider {
    fn status(&self, identity: &CertificateIdentity) -> Result<(), CredentialError> {
        let Some((program, args)) = self
            .status_command
            .as_ref()
            .and_then(|command| command.split_first())
        else {
            return Ok(());
        };

        let substitute = |arg: &String| {
            arg.replace("{reader}", &identity.card_reader)
                .replace("{card}", &identity.card_name)
                .replace("{cert}", &identity.cert_id)
        };
        let mut command = Command::new(substitute(program));
        command
            .args(args.iter().map(substitute))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        tracing::debug!(?command, "Checking smart card status");

        let unavailable = |reason: String| CredentialError::CardUnavailable {
            reader: identity.card_reader.clone(),
            reason,
        };
        let output = command
            .output()
            .map_err(|error| unavailable(format!("failed to run {program}: {error}")))?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(unavailable(format!(
                "{} ({})",
                stderr.trim(),
                output.status
            )))
        }
    }

    fn validate_pin(
        &self,
        _identity: &CertificateIdentity,
        pin: &Pin,
    ) -> Result<(), CredentialError> {
        let pin = pin.expose();
        let length = pin.chars().count();
        if length < self.min_pin_length
            || length > self.max_pin_length
            || pin.chars().any(char::is_control)
        {
            return Err(CredentialError::Rejected);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> CertificateIdentity {
        CertificateIdentity::new("C1", "CardA", "Reader1")
    }

    #[test]
    fn no_command_means_present() {
        let card = CommandCardProvider::new(None, 4, 8);
        assert!(card.status(&identity()).is_ok());
    }

    #[test]
    fn status_command_exit_code_decides() {
        let present = CommandCardProvider::new(Some(vec!["true".into()]), 4, 8);
        assert!(present.status(&identity()).is_ok());

        let absent = CommandCardProvider::new(
            Some(vec![
                "sh".into(),
                "-c".into(),
                "echo no card in $0 >&2; exit 1".into(),
                "{reader}".into(),
            ]),
            4,
            8,
        );
        match absent.status(&identity()) {
            Err(CredentialError::CardUnavailable { reader, reason }) => {
                assert_eq!(reader, "Reader1");
                assert!(reason.contains("no card in Reader1"), "{reason}");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn missing_status_tool_is_unavailable() {
        let card = CommandCardProvider::new(Some(vec!["/nonexistent/card-tool".into()]), 4, 8);
        assert!(matches!(
            card.status(&identity()),
            Err(CredentialError::CardUnavailable { .. })
        ));
    }

    #[test]
    fn pin_format_is_checked() {
        let card = CommandCardProvider::new(None, 4, 8);
        assert!(card.validate_pin(&identity(), &Pin::new("1234")).is_ok());
        assert!(card.validate_pin(&identity(), &Pin::new("12345678")).is_ok());
        assert!(card.validate_pin(&identity(), &Pin::new("123")).is_err());
        assert!(card.validate_pin(&identity(), &Pin::new("123456789")).is_err());
        assert!(card.validate_pin(&identity(), &Pin::new("12\n34")).is_err());
    }
}
