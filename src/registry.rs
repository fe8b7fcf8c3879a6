//! Subscription Registry
//!
//! Immutable set of instruments the recorder subscribes to, loaded once at
//! startup. `instrument_token` is the unique key; registry order is preserved
//! for the subscription payload and for table rows.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use tracing::{info, warn};

use crate::feed::envelope::SubscriptionPair;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentMeta {
    pub instrument_token: u32,
    pub exchange_code: u8,
    pub company_name: String,
}

impl InstrumentMeta {
    pub fn new(instrument_token: u32, exchange_code: u8, company_name: impl Into<String>) -> Self {
        Self {
            instrument_token,
            exchange_code,
            company_name: company_name.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to read instrument file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid instrument file {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Source of instrument metadata.
pub trait InstrumentLoader {
    fn load(&self) -> Result<Vec<InstrumentMeta>, RegistryError>;
}

#[derive(Debug, Clone, Default)]
pub struct SubscriptionRegistry {
    instruments: Vec<InstrumentMeta>,
    index: HashMap<u32, usize>,
}

impl SubscriptionRegistry {
    /// Build a registry; a repeated token keeps its first occurrence.
    pub fn new(instruments: Vec<InstrumentMeta>) -> Self {
        let mut kept = Vec::with_capacity(instruments.len());
        let mut index = HashMap::with_capacity(instruments.len());

        for meta in instruments {
            if index.contains_key(&meta.instrument_token) {
                warn!(
                    token = meta.instrument_token,
                    company = %meta.company_name,
                    "duplicate instrument token ignored"
                );
                continue;
            }
            index.insert(meta.instrument_token, kept.len());
            kept.push(meta);
        }

        Self {
            instruments: kept,
            index,
        }
    }

    pub fn load(loader: &dyn InstrumentLoader) -> Result<Self, RegistryError> {
        let registry = Self::new(loader.load()?);
        info!(instruments = registry.len(), "instrument registry loaded");
        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InstrumentMeta> {
        self.instruments.iter()
    }

    pub fn get(&self, token: u32) -> Option<&InstrumentMeta> {
        self.index.get(&token).map(|&i| &self.instruments[i])
    }

    pub fn contains(&self, token: u32) -> bool {
        self.index.contains_key(&token)
    }

    /// `(exchange_code, instrument_token)` for every instrument, in registry order.
    pub fn subscription_pairs(&self) -> Vec<SubscriptionPair> {
        self.instruments
            .iter()
            .map(|m| SubscriptionPair(m.exchange_code, m.instrument_token))
            .collect()
    }
}

// =============================================================================
// JSON FILE LOADER
// =============================================================================

/// Entry as published in the instrument master file.
#[derive(Debug, Deserialize)]
struct RawInstrument {
    exchange_code: u64,
    code: serde_json::Value,
    #[serde(default)]
    company: String,
}

/// Loads one segment (e.g. `NSE-OTH`) from a JSON object of segment arrays.
#[derive(Debug, Clone)]
pub struct JsonInstrumentLoader {
    path: PathBuf,
    segment: String,
}

impl JsonInstrumentLoader {
    pub fn new(path: impl AsRef<Path>, segment: impl Into<String>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            segment: segment.into(),
        }
    }

    fn parse(&self, raw: &str) -> Result<Vec<InstrumentMeta>, RegistryError> {
        let mut segments: HashMap<String, serde_json::Value> =
            serde_json::from_str(raw).map_err(|source| RegistryError::Json {
                path: self.path.clone(),
                source,
            })?;

        let Some(segment) = segments.remove(&self.segment) else {
            warn!(segment = %self.segment, "segment not present in instrument file");
            return Ok(Vec::new());
        };
        let serde_json::Value::Array(entries) = segment else {
            warn!(segment = %self.segment, "segment is not a list of instruments");
            return Ok(Vec::new());
        };

        Ok(entries
            .into_iter()
            .filter_map(|entry| match serde_json::from_value::<RawInstrument>(entry) {
                Ok(raw) => to_meta(raw),
                Err(e) => {
                    warn!(segment = %self.segment, error = %e, "malformed instrument entry, skipping");
                    None
                }
            })
            .collect())
    }
}

impl InstrumentLoader for JsonInstrumentLoader {
    fn load(&self) -> Result<Vec<InstrumentMeta>, RegistryError> {
        let raw = std::fs::read_to_string(&self.path).map_err(|source| RegistryError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.parse(&raw)
    }
}

fn to_meta(raw: RawInstrument) -> Option<InstrumentMeta> {
    let token = match &raw.code {
        serde_json::Value::String(s) => s.trim().parse::<u32>().ok(),
        serde_json::Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        _ => None,
    };
    let Some(token) = token else {
        warn!(code = %raw.code, company = %raw.company, "instrument code is not a valid token, skipping");
        return None;
    };
    let Ok(exchange_code) = u8::try_from(raw.exchange_code) else {
        warn!(token, exchange_code = raw.exchange_code, "exchange code out of range, skipping");
        return None;
    };

    Some(InstrumentMeta::new(token, exchange_code, raw.company))
}
