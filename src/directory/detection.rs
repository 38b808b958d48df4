// src/directory/detection.rs

//! Detection rules attached to application version objects
//!
//! A device decides whether an application is installed by evaluating its
//! detection rules. Each rule kind carries exactly the fields it needs:
//! a file check with a version comparison cannot exist without a comparison
//! value, and a presence check cannot carry one.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
}

impl Operator {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "equal" => Some(Operator::Equal),
            "notEqual" => Some(Operator::NotEqual),
            "greaterThan" => Some(Operator::GreaterThan),
            "greaterThanOrEqual" => Some(Operator::GreaterThanOrEqual),
            "lessThan" => Some(Operator::LessThan),
            "lessThanOrEqual" => Some(Operator::LessThanOrEqual),
            _ => None,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operator::Equal => "equal",
            Operator::NotEqual => "notEqual",
            Operator::GreaterThan => "greaterThan",
            Operator::GreaterThanOrEqual => "greaterThanOrEqual",
            Operator::LessThan => "lessThan",
            Operator::LessThanOrEqual => "lessThanOrEqual",
        };
        f.write_str(s)
    }
}

/// Operator plus the value it compares against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comparison {
    pub operator: Operator,
    pub value: String,
}

impl Comparison {
    pub fn new(operator: Operator, value: impl Into<String>) -> Self {
        Self {
            operator,
            value: value.into(),
        }
    }
}

/// What a file or folder rule checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCheck {
    Exists,
    DoesNotExist,
    Version(Comparison),
    SizeInMb(Comparison),
    ModifiedDate(Comparison),
    CreatedDate(Comparison),
}

/// What a registry rule checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryCheck {
    Exists,
    DoesNotExist,
    String(Comparison),
    Integer(Comparison),
    Version(Comparison),
}

/// How a device detects that an application version is installed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DetectionRule {
    File {
        path: String,
        name: String,
        check: FileCheck,
        #[serde(default)]
        check_32bit_on_64: bool,
    },
    Registry {
        key_path: String,
        value_name: Option<String>,
        check: RegistryCheck,
        #[serde(default)]
        check_32bit_on_64: bool,
    },
    ProductCode {
        product_code: String,
        version: Option<Comparison>,
    },
    Script {
        script_base64: String,
        #[serde(default)]
        enforce_signature_check: bool,
        #[serde(default)]
        run_as_32bit: bool,
    },
}

impl DetectionRule {
    /// Version string this rule compares against, if it checks a version
    pub fn checked_version(&self) -> Option<&str> {
        match self {
            DetectionRule::File {
                check: FileCheck::Version(c),
                ..
            }
            | DetectionRule::Registry {
                check: RegistryCheck::Version(c),
                ..
            }
            | DetectionRule::ProductCode {
                version: Some(c), ..
            } => Some(&c.value),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DetectionRule::File { .. } => "file",
            DetectionRule::Registry { .. } => "registry",
            DetectionRule::ProductCode { .. } => "product_code",
            DetectionRule::Script { .. } => "script",
        }
    }
}
