// SPDX-License-Identifier: Apache-2.0

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::CodecKind;
use crate::codec::head::HeadDialect;

/// On-disk mirror of [`CodecKind`] — kept separate so the wire enum
/// stays free of `serde` and this one is free to grow config-only
/// aliases.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CodecConfig {
    Binary,
    Json,
    Bson,
}

impl From<CodecConfig> for CodecKind {
    fn from(c: CodecConfig) -> Self {
        match c {
            CodecConfig::Binary => CodecKind::Binary,
            CodecConfig::Json => CodecKind::Json,
            CodecConfig::Bson => CodecKind::Bson,
        }
    }
}

impl fmt::Display for CodecConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CodecConfig::Binary => "binary",
            CodecConfig::Json => "json",
            CodecConfig::Bson => "bson",
        })
    }
}

/// On-disk mirror of [`HeadDialect`].
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HeadDialectConfig {
    Thrift,
    Protobuf,
}

impl From<HeadDialectConfig> for HeadDialect {
    fn from(d: HeadDialectConfig) -> Self {
        match d {
            HeadDialectConfig::Thrift => HeadDialect::Thrift,
            HeadDialectConfig::Protobuf => HeadDialect::Protobuf,
        }
    }
}

impl fmt::Display for HeadDialectConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HeadDialectConfig::Thrift => "thrift",
            HeadDialectConfig::Protobuf => "protobuf",
        })
    }
}
