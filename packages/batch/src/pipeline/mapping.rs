//! Raw-to-typed mapping descriptors.
//!
//! One immutable descriptor per tourism content type: which source fields
//! land in which columns, which are required, which count toward the row
//! quality score, and which columns form the upsert conflict key. The
//! listing payload shape is uniform across KTO content types, so the field
//! table is shared and only the target table differs.

use datago_client::ContentType;

/// How a mapped column is typed in the target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Float,
    /// 14-digit `YYYYMMDDHHMMSS` text, normalized from provider timestamps.
    Stamp,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldMap {
    pub source: &'static str,
    pub column: &'static str,
    pub kind: FieldKind,
}

const fn field(source: &'static str, column: &'static str, kind: FieldKind) -> FieldMap {
    FieldMap {
        source,
        column,
        kind,
    }
}

/// Shared KTO listing fields. Coordinates are handled separately by the
/// shape check and are not part of this table.
const KTO_FIELDS: &[FieldMap] = &[
    field("contentid", "content_id", FieldKind::Text),
    field("title", "title", FieldKind::Text),
    field("addr1", "address", FieldKind::Text),
    field("addr2", "detail_address", FieldKind::Text),
    field("zipcode", "zip_code", FieldKind::Text),
    field("areacode", "area_code", FieldKind::Text),
    field("sigungucode", "sigungu_code", FieldKind::Text),
    field("cat1", "category_large", FieldKind::Text),
    field("cat2", "category_medium", FieldKind::Text),
    field("cat3", "category_small", FieldKind::Text),
    field("tel", "phone", FieldKind::Text),
    field("firstimage", "image_url", FieldKind::Text),
    field("firstimage2", "thumbnail_url", FieldKind::Text),
    field("createdtime", "created_time", FieldKind::Stamp),
    field("modifiedtime", "modified_time", FieldKind::Stamp),
];

const KTO_REQUIRED: &[&str] = &["contentid", "title"];
const KTO_IMPORTANT: &[&str] = &[
    "title",
    "addr1",
    "areacode",
    "mapx",
    "mapy",
    "tel",
    "firstimage",
];
const KTO_CONFLICT: &[&str] = &["content_id"];

/// Immutable per-content-type mapping configuration.
#[derive(Debug, Clone, Copy)]
pub struct TableMapping {
    pub table: &'static str,
    pub fields: &'static [FieldMap],
    /// Source fields that must be present and non-empty.
    pub required: &'static [&'static str],
    /// Source fields counted by the per-row quality score.
    pub important: &'static [&'static str],
    /// Target columns forming the upsert conflict key.
    pub conflict_keys: &'static [&'static str],
    /// Whether `mapx`/`mapy` undergo the Korea-bounds coordinate gate.
    pub has_coordinates: bool,
}

const fn kto_mapping(table: &'static str) -> TableMapping {
    TableMapping {
        table,
        fields: KTO_FIELDS,
        required: KTO_REQUIRED,
        important: KTO_IMPORTANT,
        conflict_keys: KTO_CONFLICT,
        has_coordinates: true,
    }
}

/// Mapping for one tourism content type.
pub fn for_content_type(content_type: ContentType) -> TableMapping {
    match content_type {
        ContentType::TouristAttraction => kto_mapping("tourist_attractions"),
        ContentType::CulturalFacility => kto_mapping("cultural_facilities"),
        ContentType::Festival => kto_mapping("festivals_events"),
        ContentType::TravelCourse => kto_mapping("travel_courses"),
        ContentType::LeisureSports => kto_mapping("leisure_sports"),
        ContentType::Accommodation => kto_mapping("accommodations"),
        ContentType::Shopping => kto_mapping("shopping"),
        ContentType::Restaurant => kto_mapping("restaurants"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_content_type_has_a_table() {
        let tables: Vec<&str> = ContentType::ALL
            .iter()
            .map(|ct| for_content_type(*ct).table)
            .collect();
        assert_eq!(tables.len(), 8);
        let unique: std::collections::HashSet<&&str> = tables.iter().collect();
        assert_eq!(unique.len(), 8);
    }

    #[test]
    fn tourism_conflict_key_is_content_id() {
        for ct in ContentType::ALL {
            assert_eq!(for_content_type(ct).conflict_keys, &["content_id"]);
        }
    }

    #[test]
    fn required_fields_are_part_of_the_field_table() {
        let mapping = for_content_type(ContentType::TouristAttraction);
        for required in mapping.required {
            assert!(
                mapping.fields.iter().any(|f| f.source == *required),
                "required field {required} missing from field table"
            );
        }
    }
}
