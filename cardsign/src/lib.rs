// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

#![doc = include_str!("../README.md")]

pub mod card;
pub mod channel;
#[doc(hidden)]
pub mod cli;
pub mod config;
pub mod credentials;
pub mod decoder;
pub mod error;
pub mod job;
pub mod pinentry;
pub mod protocol;
pub mod runner;
pub mod service;
