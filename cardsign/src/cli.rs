// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::path::PathBuf;

use clap::Parser;

use crate::config::{self, Config};

/// Sign files with a smart card certificate, entering the PIN only once.
///
/// The first invocation becomes the signing server: it queues its files,
/// prompts for the card PIN when the first file is signed, and keeps the PIN
/// encrypted in memory. Later invocations hand their files to the running
/// server and exit immediately. Files are signed one at a time, in the order
/// they were submitted. The server exits after a period of inactivity or when
/// interrupted, forgetting every cached PIN.
///
/// Log configuration is provided using the "CARDSIGN_LOG"
/// environment variable with one or more comma-separated directives. In short,
/// filters can be plain verbosity levels ("trace", "debug", "info", "warn",
/// "error"), or more complex filtering at the span or event level.
///
/// The complete format is documented at
/// https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/filter/struct.EnvFilter.html#directives.
#[derive(Parser, Debug)]
#[command(version)]
pub struct Cli {
    /// Path to the configuration file.
    ///
    /// If no path is provided, the defaults are used. To view the
    /// defaults, run the `config` subcommand.
    #[arg(long, short, env = "CARDSIGN_CONFIG", value_parser = config::load)]
    pub config: Option<Config>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand, Debug)]
pub enum Command {
    /// Sign files, starting the signing server if none is running.
    Sign {
        /// The signing profile to use; defaults to the first configured profile.
        #[arg(long, short)]
        profile: Option<String>,
        /// The files to sign.
        files: Vec<PathBuf>,
    },
    /// Print the current configuration to standard output.
    ///
    /// If no config file is provided, the defaults are printed. For complete details on each
    /// configuration option, refer to the documentation.
    Config,
}
