//! SAP entity extraction via pattern and dictionary matching.
//!
//! Pulls SAP-specific tokens out of raw text: transaction codes, table
//! names, BAPI names, message classes, and package names. Extraction is
//! purely lexical — no index or store dependency — so the same extractor
//! runs at ingest time (per chunk) and at query time (per query string).
//!
//! Pattern matching alone over-fires on SAP text (almost any short
//! uppercase token looks like a tcode), so each pattern is backed by a
//! dictionary of well-known names plus structural cues (`Z`/`Y` custom
//! namespaces, `BAPI_` prefixes, dictionary table prefixes).

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use serde::{Deserialize, Serialize};

/// The kinds of SAP entities the extractor recognizes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Transaction,
    Table,
    Bapi,
    MessageClass,
    Package,
}

/// Extracted entities, keyed by kind. `BTreeMap`/`BTreeSet` keep the
/// mapping deterministic for serialization and audit.
pub type EntityMap = BTreeMap<EntityKind, BTreeSet<String>>;

/// Well-known transaction codes. Uppercase tokens matching the tcode
/// shape are only accepted when listed here or when they carry a custom
/// namespace prefix.
const KNOWN_TRANSACTIONS: &[&str] = &[
    "VA01", "VA02", "VA03", "VF01", "VF02", "VL01N", "VL02N", "ME21N", "ME22N", "ME23N",
    "MM01", "MM02", "MM03", "FB01", "FB03", "FBL1N", "FBL3N", "FBL5N", "MIGO", "MIRO",
    "SE11", "SE16", "SE16N", "SE24", "SE37", "SE38", "SE80", "SM12", "SM13", "SM21",
    "SM37", "SM50", "SM51", "SM58", "SM59", "ST22", "ST05", "SU01", "SU53", "PFCG",
    "SPRO", "CO01", "CO02", "CO03", "IW31", "IW32", "IW33", "QA01", "QA02", "XK01",
    "XD01", "KE24", "KSB1", "CJ20N", "SNOTE", "STMS", "AL11", "SLG1", "WE02", "WE19",
];

/// Well-known dictionary tables, plus prefixes that mark standard
/// application tables.
const KNOWN_TABLES: &[&str] = &[
    "MARA", "MARC", "MARD", "MAKT", "VBAK", "VBAP", "VBEP", "VBFA", "VBRK", "VBRP",
    "LIKP", "LIPS", "EKKO", "EKPO", "EKET", "EKBE", "MSEG", "MKPF", "BKPF", "BSEG",
    "BSID", "BSIK", "KNA1", "KNB1", "KNVV", "LFA1", "LFB1", "T001", "T001W", "T156",
    "TVAK", "TVAP", "CDHDR", "CDPOS", "NAST", "STXH", "STXL", "AUFK", "AFKO", "AFPO",
    "COEP", "COBK", "PRPS", "PROJ", "QMEL", "EQUI", "EQKT", "JEST", "TJ02T", "USR02",
];

/// Well-known message classes. Single letters and two-letter classes
/// are too ambiguous to pattern-match, so only dictionary hits plus
/// explicit `MESSAGE ... (class)` syntax are accepted.
const KNOWN_MESSAGE_CLASSES: &[&str] = &["V1", "V4", "M7", "F5", "00", "SU", "VL", "ME", "KI"];

/// Compiled extraction patterns. Construct once and reuse; compilation
/// is the expensive part.
pub struct EntityExtractor {
    tcode_shape: Regex,
    table_shape: Regex,
    bapi_shape: Regex,
    message_stmt: Regex,
    package_shape: Regex,
    custom_object: Regex,
}

impl EntityExtractor {
    pub fn new() -> Self {
        // Shapes are matched against individual uppercase tokens, then
        // filtered through the dictionaries above.
        Self {
            tcode_shape: Regex::new(r"^[A-Z]{1,4}[0-9]{1,3}[A-Z]?$").unwrap(),
            table_shape: Regex::new(r"^[A-Z][A-Z0-9]{3,15}$").unwrap(),
            bapi_shape: Regex::new(r"\bBAPI_[A-Z0-9_]{3,40}\b").unwrap(),
            message_stmt: Regex::new(r"(?i)\bMESSAGE\s+[aeiwsx][0-9]{3}\(([A-Z0-9]{1,20})\)")
                .unwrap(),
            package_shape: Regex::new(r"\b(?:package|devclass|paket)\s+([ZY][A-Z0-9_]{1,29})\b")
                .unwrap(),
            custom_object: Regex::new(r"\b[ZY][A-Z0-9_]{2,29}\b").unwrap(),
        }
    }

    /// Extract all recognized SAP entities from `text`.
    pub fn extract(&self, text: &str) -> EntityMap {
        let mut out: EntityMap = BTreeMap::new();

        for token in uppercase_tokens(text) {
            if self.tcode_shape.is_match(token) && KNOWN_TRANSACTIONS.contains(&token) {
                insert(&mut out, EntityKind::Transaction, token);
            }
            if self.table_shape.is_match(token) && KNOWN_TABLES.contains(&token) {
                insert(&mut out, EntityKind::Table, token);
            }
        }

        for m in self.bapi_shape.find_iter(text) {
            insert(&mut out, EntityKind::Bapi, m.as_str());
        }

        for cap in self.message_stmt.captures_iter(text) {
            let class = cap[1].to_uppercase();
            if KNOWN_MESSAGE_CLASSES.contains(&class.as_str()) || class.starts_with('Z') {
                insert(&mut out, EntityKind::MessageClass, &class);
            }
        }

        for cap in self.package_shape.captures_iter(text) {
            insert(&mut out, EntityKind::Package, &cap[1]);
        }

        // Custom-namespace objects: tables when they look like table
        // declarations, otherwise left to the broader kinds above.
        for m in self.custom_object.find_iter(text) {
            let token = m.as_str();
            if token.len() >= 5 && looks_like_table_context(text, m.start()) {
                insert(&mut out, EntityKind::Table, token);
            }
        }

        out
    }
}

impl Default for EntityExtractor {
    fn default() -> Self {
        Self::new()
    }
}

fn insert(map: &mut EntityMap, kind: EntityKind, value: &str) {
    map.entry(kind).or_default().insert(value.to_string());
}

/// Iterate candidate tokens: maximal runs of `[A-Z0-9_]` of length >= 2.
fn uppercase_tokens(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !(c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_'))
        .filter(|t| t.len() >= 2 && t.chars().any(|c| c.is_ascii_uppercase()))
}

/// True when the bytes just before `pos` suggest a table reference
/// (`FROM`, `TABLES`, `SELECT ... INTO`, `MODIFY`, `UPDATE`).
fn looks_like_table_context(text: &str, pos: usize) -> bool {
    let prefix_start = pos.saturating_sub(24);
    // Snap to a char boundary; SAP docs are mostly ASCII but not always.
    let mut start = prefix_start;
    while start > 0 && !text.is_char_boundary(start) {
        start -= 1;
    }
    let prefix = text[start..pos].to_uppercase();
    ["FROM ", "TABLES", "MODIFY ", "UPDATE ", "INSERT "]
        .iter()
        .any(|kw| prefix.contains(kw))
}
