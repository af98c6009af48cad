//! Stateless raw-to-typed transformation.
//!
//! A page of raw provider records becomes an ordered sequence of typed rows
//! plus a discard list with reasons. The steps run in a fixed order: shape
//! check (required fields, Korea-bounds coordinates), normalization (trim,
//! 14-digit timestamps), field mapping, then a per-row quality score. The
//! transform is deterministic: re-running it over the same archived page
//! yields identical rows.

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::mapping::{FieldKind, TableMapping};

/// Korea bounding box for the coordinate gate.
const LAT_RANGE: (f64, f64) = (32.0, 39.0);
const LON_RANGE: (f64, f64) = (123.0, 132.0);

/// One column value headed for the database.
#[derive(Debug, Clone, PartialEq)]
pub enum ColValue {
    Text(Option<String>),
    Float(Option<f64>),
    Int(Option<i64>),
    Json(Option<Value>),
    Uuid(Option<Uuid>),
    Timestamp(Option<DateTime<Utc>>),
}

impl ColValue {
    pub fn is_null(&self) -> bool {
        matches!(
            self,
            ColValue::Text(None)
                | ColValue::Float(None)
                | ColValue::Int(None)
                | ColValue::Json(None)
                | ColValue::Uuid(None)
                | ColValue::Timestamp(None)
        )
    }
}

/// One typed row with a uniform column set per target table.
#[derive(Debug, Clone)]
pub struct TypedRow {
    pub columns: Vec<(&'static str, ColValue)>,
    pub quality_score: f64,
}

impl TypedRow {
    pub fn get(&self, column: &str) -> Option<&ColValue> {
        self.columns
            .iter()
            .find(|(name, _)| *name == column)
            .map(|(_, value)| value)
    }

    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns.iter().map(|(name, _)| *name).collect()
    }
}

/// A record rejected by the transform, with the reason it was dropped.
#[derive(Debug, Clone)]
pub struct Discard {
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct TransformOutput {
    pub rows: Vec<TypedRow>,
    pub discards: Vec<Discard>,
}

impl TransformOutput {
    /// Chunked view for memory-bounded insertion.
    pub fn chunks(&self, size: usize) -> std::slice::Chunks<'_, TypedRow> {
        self.rows.chunks(size.max(1))
    }
}

/// Transform one raw page of tourism records under a mapping.
///
/// `raw_id` is the archive row the page came from and `synced_at` its
/// archival instant; both land in every typed row so landed data stays
/// traceable to its source response. The transform is a pure function of
/// its arguments: replaying an archived page yields identical rows.
pub fn transform_page(
    mapping: &TableMapping,
    items: &[Value],
    raw_id: Option<Uuid>,
    synced_at: DateTime<Utc>,
) -> TransformOutput {
    let mut output = TransformOutput::default();

    'items: for (index, item) in items.iter().enumerate() {
        let Some(obj) = item.as_object() else {
            output.discards.push(Discard {
                index,
                reason: "record is not an object".into(),
            });
            continue;
        };

        // Shape check: required fields.
        for required in mapping.required {
            if trimmed(obj.get(*required)).is_none() {
                output.discards.push(Discard {
                    index,
                    reason: format!("missing required field: {required}"),
                });
                continue 'items;
            }
        }

        // Shape check: coordinates, when the mapping carries them. Absent
        // coordinates stay null; present but unparseable or out-of-bounds
        // coordinates drop the record.
        let coords = if mapping.has_coordinates {
            match parse_coordinates(obj.get("mapy"), obj.get("mapx")) {
                Ok(coords) => coords,
                Err(reason) => {
                    output.discards.push(Discard { index, reason });
                    continue;
                }
            }
        } else {
            None
        };

        // Normalization and field mapping.
        let mut columns: Vec<(&'static str, ColValue)> =
            Vec::with_capacity(mapping.fields.len() + 6);
        for fm in mapping.fields {
            let raw = trimmed(obj.get(fm.source));
            let value = match fm.kind {
                FieldKind::Text => ColValue::Text(raw),
                FieldKind::Float => ColValue::Float(raw.and_then(|s| s.parse().ok())),
                FieldKind::Stamp => ColValue::Text(raw.and_then(|s| stamp14(&s))),
            };
            columns.push((fm.column, value));
        }

        if mapping.has_coordinates {
            columns.push(("latitude", ColValue::Float(coords.map(|(lat, _)| lat))));
            columns.push(("longitude", ColValue::Float(coords.map(|(_, lon)| lon))));
        }

        // Quality score: fraction of important source fields present.
        let present = mapping
            .important
            .iter()
            .filter(|f| trimmed(obj.get(**f)).is_some())
            .count();
        let quality_score = if mapping.important.is_empty() {
            1.0
        } else {
            present as f64 / mapping.important.len() as f64
        };

        columns.push(("raw_data_id", ColValue::Uuid(raw_id)));
        columns.push(("data_quality_score", ColValue::Float(Some(quality_score))));
        columns.push(("processing_status", ColValue::Text(Some("processed".into()))));
        columns.push(("last_sync_at", ColValue::Timestamp(Some(synced_at))));

        output.rows.push(TypedRow {
            columns,
            quality_score,
        });
    }

    output
}

/// Trimmed string form of a raw value; empty strings become `None`.
/// Numeric payloads are normalized to their string form, since the portal
/// mixes the two freely.
pub fn trimmed(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Normalize provider timestamps to a 14-digit `YYYYMMDDHHMMSS` string.
/// Accepts `20240101093000`, `2024-01-01 09:30:00`, and date-only forms,
/// padding missing time digits with zeros.
pub fn stamp14(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 8 {
        return None;
    }
    let mut stamp = digits[..digits.len().min(14)].to_string();
    while stamp.len() < 14 {
        stamp.push('0');
    }
    Some(stamp)
}

fn parse_coordinates(
    lat_raw: Option<&Value>,
    lon_raw: Option<&Value>,
) -> Result<Option<(f64, f64)>, String> {
    let lat = trimmed(lat_raw);
    let lon = trimmed(lon_raw);

    match (lat, lon) {
        (None, None) => Ok(None),
        (Some(lat), Some(lon)) => {
            let lat: f64 = lat
                .parse()
                .map_err(|_| format!("latitude does not parse: {lat}"))?;
            let lon: f64 = lon
                .parse()
                .map_err(|_| format!("longitude does not parse: {lon}"))?;
            if !(LAT_RANGE.0..=LAT_RANGE.1).contains(&lat)
                || !(LON_RANGE.0..=LON_RANGE.1).contains(&lon)
            {
                return Err(format!("coordinates outside Korea bounds: {lat},{lon}"));
            }
            Ok(Some((lat, lon)))
        }
        _ => Err("only one of mapx/mapy present".into()),
    }
}
