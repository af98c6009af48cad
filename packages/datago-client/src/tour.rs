//! Request builders for the KTO tourism services (TourAPI 4.0).

use serde::{Deserialize, Serialize};

use crate::request::ProviderRequest;
use crate::Provider;

/// Default page size for listing endpoints.
pub const DEFAULT_NUM_OF_ROWS: i64 = 100;

/// The tourism provider's numeric tag for an entity class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentType {
    TouristAttraction,
    CulturalFacility,
    Festival,
    TravelCourse,
    LeisureSports,
    Accommodation,
    Shopping,
    Restaurant,
}

impl ContentType {
    pub const ALL: [ContentType; 8] = [
        ContentType::TouristAttraction,
        ContentType::CulturalFacility,
        ContentType::Festival,
        ContentType::TravelCourse,
        ContentType::LeisureSports,
        ContentType::Accommodation,
        ContentType::Shopping,
        ContentType::Restaurant,
    ];

    /// Wire identifier (`contentTypeId`).
    pub fn id(&self) -> u32 {
        match self {
            ContentType::TouristAttraction => 12,
            ContentType::CulturalFacility => 14,
            ContentType::Festival => 15,
            ContentType::TravelCourse => 25,
            ContentType::LeisureSports => 28,
            ContentType::Accommodation => 32,
            ContentType::Shopping => 38,
            ContentType::Restaurant => 39,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|ct| ct.id() == id)
    }

    /// Human tag used in job names and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::TouristAttraction => "tourist_attraction",
            ContentType::CulturalFacility => "cultural_facility",
            ContentType::Festival => "festival",
            ContentType::TravelCourse => "travel_course",
            ContentType::LeisureSports => "leisure_sports",
            ContentType::Accommodation => "accommodation",
            ContentType::Shopping => "shopping",
            ContentType::Restaurant => "restaurant",
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn base(endpoint: &str, app_name: &str) -> ProviderRequest {
    ProviderRequest::new(Provider::Kto, endpoint)
        .param("MobileOS", "ETC")
        .param("MobileApp", app_name)
        .param("_type", "json")
}

/// Area-based content listing (`areaBasedList2`), paged.
pub fn area_based_list(
    content_type: ContentType,
    area_code: Option<&str>,
    app_name: &str,
) -> ProviderRequest {
    let mut req = base("areaBasedList2", app_name)
        .param("contentTypeId", content_type.id().to_string())
        .param("arrange", "C");
    if let Some(area) = area_code {
        req = req.param("areaCode", area);
    }
    req.paged(1, DEFAULT_NUM_OF_ROWS)
}

/// Listing filtered to records modified since `modified_time` (YYYYMMDD).
pub fn area_based_list_modified(
    content_type: ContentType,
    area_code: Option<&str>,
    modified_time: &str,
    app_name: &str,
) -> ProviderRequest {
    let mut req = base("areaBasedList2", app_name)
        .param("contentTypeId", content_type.id().to_string())
        .param("arrange", "C")
        .param("modifiedtime", modified_time);
    if let Some(area) = area_code {
        req = req.param("areaCode", area);
    }
    req.paged(1, DEFAULT_NUM_OF_ROWS)
}

/// Common detail lookup for one content id (`detailCommon2`).
pub fn detail_common(content_id: &str, app_name: &str) -> ProviderRequest {
    base("detailCommon2", app_name).param("contentId", content_id)
}

/// Province/city code listing (`areaCode2`). Cheap; used as the key probe.
pub fn area_codes(app_name: &str) -> ProviderRequest {
    base("areaCode2", app_name).paged(1, 50)
}

/// Festival search starting from `event_start_date` (YYYYMMDD).
pub fn search_festival(event_start_date: &str, app_name: &str) -> ProviderRequest {
    base("searchFestival2", app_name)
        .param("eventStartDate", event_start_date)
        .paged(1, DEFAULT_NUM_OF_ROWS)
}
