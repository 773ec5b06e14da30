//! Resource quantity parsing and arithmetic.

use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::spec::ResourceSpec;

/// Parsed resource quantities.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourceUsage {
    /// CPU cores (fractional).
    pub cpu: f64,
    /// Memory in bytes.
    pub memory: u64,
    /// Disk in bytes.
    pub disk: u64,
    /// GPU count.
    pub gpu: u64,
}

impl ResourceUsage {
    /// Parses the string quantities of a [`ResourceSpec`].
    pub fn parse(spec: &ResourceSpec) -> Result<Self, ModelError> {
        Ok(Self {
            cpu: parse_cpu(&spec.cpu)?,
            memory: parse_bytes("memory", &spec.memory)?,
            disk: parse_bytes("disk", &spec.disk)?,
            gpu: parse_count("gpu", &spec.gpu)?,
        })
    }

    /// True if every quantity is within `limit`.
    pub fn fits_within(&self, limit: &ResourceUsage) -> bool {
        self.cpu <= limit.cpu
            && self.memory <= limit.memory
            && self.disk <= limit.disk
            && self.gpu <= limit.gpu
    }

    pub fn saturating_add(&self, other: &ResourceUsage) -> Self {
        Self {
            cpu: self.cpu + other.cpu,
            memory: self.memory.saturating_add(other.memory),
            disk: self.disk.saturating_add(other.disk),
            gpu: self.gpu.saturating_add(other.gpu),
        }
    }

    pub fn saturating_sub(&self, other: &ResourceUsage) -> Self {
        Self {
            cpu: (self.cpu - other.cpu).max(0.0),
            memory: self.memory.saturating_sub(other.memory),
            disk: self.disk.saturating_sub(other.disk),
            gpu: self.gpu.saturating_sub(other.gpu),
        }
    }

    /// Fills any zero quantity from `defaults`.
    pub fn or_defaults(&self, defaults: &ResourceUsage) -> Self {
        Self {
            cpu: if self.cpu == 0.0 { defaults.cpu } else { self.cpu },
            memory: if self.memory == 0 { defaults.memory } else { self.memory },
            disk: if self.disk == 0 { defaults.disk } else { self.disk },
            gpu: if self.gpu == 0 { defaults.gpu } else { self.gpu },
        }
    }
}

fn parse_cpu(value: &str) -> Result<f64, ModelError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(0.0);
    }

    let invalid = || ModelError::InvalidResource {
        field: "cpu",
        value: value.to_string(),
    };

    let cores = match value.strip_suffix('m') {
        Some(millis) => millis.trim().parse::<f64>().map_err(|_| invalid())? / 1000.0,
        None => value.parse::<f64>().map_err(|_| invalid())?,
    };

    if !cores.is_finite() || cores < 0.0 {
        return Err(invalid());
    }
    Ok(cores)
}

fn parse_count(field: &'static str, value: &str) -> Result<u64, ModelError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(0);
    }
    value.parse::<u64>().map_err(|_| ModelError::InvalidResource {
        field,
        value: value.to_string(),
    })
}

/// Parses sizes like `512`, `64kb`, `512Mb`, `2Gi`, `1.5GiB`.
///
/// Decimal and binary suffixes are both treated as powers of 1024.
fn parse_bytes(field: &'static str, value: &str) -> Result<u64, ModelError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }

    let invalid = || ModelError::InvalidResource {
        field,
        value: value.to_string(),
    };

    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let number: f64 = number.parse().map_err(|_| invalid())?;

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "ki" | "kib" => 1 << 10,
        "m" | "mb" | "mi" | "mib" => 1 << 20,
        "g" | "gb" | "gi" | "gib" => 1 << 30,
        "t" | "tb" | "ti" | "tib" => 1 << 40,
        _ => return Err(invalid()),
    };

    let bytes = number * multiplier as f64;
    if !bytes.is_finite() || bytes < 0.0 || bytes > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(bytes as u64)
}
