//! Decoding of the portal's nested response envelope.
//!
//! Every service behind the portal answers with the same wrapper:
//!
//! ```json
//! {
//!   "response": {
//!     "header": { "resultCode": "00", "resultMsg": "OK" },
//!     "body": {
//!       "items": { "item": [ ... ] },
//!       "numOfRows": 100, "pageNo": 1, "totalCount": 1234
//!     }
//!   }
//! }
//! ```
//!
//! Two quirks are normalized here: `items.item` is a bare object when a page
//! holds exactly one record, and `items` degrades to an empty string when a
//! page holds none.

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{classify_result_code, DatagoError, RESULT_OK};

/// Full response document for item-listing services.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
    pub response: ResponseDoc<T>,
}

#[derive(Debug, Deserialize)]
pub struct ResponseDoc<T> {
    pub header: Header,
    #[serde(default = "Option::default")]
    pub body: Option<Body<T>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Header {
    #[serde(rename = "resultCode")]
    pub result_code: String,
    #[serde(rename = "resultMsg", default)]
    pub result_msg: String,
}

impl Header {
    pub fn is_ok(&self) -> bool {
        self.result_code == RESULT_OK
    }
}

#[derive(Debug, Deserialize)]
pub struct Body<T> {
    #[serde(default = "ItemsField::empty")]
    pub items: ItemsField<T>,
    #[serde(rename = "numOfRows", default)]
    pub num_of_rows: i64,
    #[serde(rename = "pageNo", default)]
    pub page_no: i64,
    #[serde(rename = "totalCount", default)]
    pub total_count: i64,
}

/// The `items` field: either the `{ "item": ... }` wrapper or the empty
/// sentinel (`""` or missing).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ItemsField<T> {
    Wrapped { item: Items<T> },
    Empty(EmptySentinel),
}

impl<T> ItemsField<T> {
    fn empty() -> Self {
        ItemsField::Empty(EmptySentinel::Text(String::new()))
    }

    pub fn into_vec(self) -> Vec<T> {
        match self {
            ItemsField::Wrapped { item } => item.into_vec(),
            ItemsField::Empty(_) => Vec::new(),
        }
    }
}

/// `""` when a page holds no rows; some services send `null` instead.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum EmptySentinel {
    Text(String),
    Null(Option<()>),
}

/// `item` as returned by the portal: one record or many.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Items<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> Items<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            Items::Many(v) => v,
            Items::One(item) => vec![item],
        }
    }
}

/// One decoded page: normalized records plus paging counters.
#[derive(Debug)]
pub struct PageSlice<T> {
    pub items: Vec<T>,
    pub page_no: i64,
    pub num_of_rows: i64,
    pub total_count: i64,
}

impl<T> PageSlice<T> {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Decode a raw JSON document into a page of `T`, enforcing the header's
/// result code.
pub fn decode_page<T: DeserializeOwned>(raw: &serde_json::Value) -> crate::Result<PageSlice<T>> {
    let envelope: ApiEnvelope<T> = serde_json::from_value(raw.clone())?;
    envelope.into_page()
}

/// Check only the envelope header of a raw document.
pub fn check_header(raw: &serde_json::Value) -> crate::Result<Header> {
    let header: Header = raw
        .pointer("/response/header")
        .cloned()
        .map(serde_json::from_value)
        .transpose()?
        .ok_or_else(|| DatagoError::Envelope("missing response.header".into()))?;

    if header.is_ok() {
        Ok(header)
    } else {
        Err(DatagoError::Provider {
            fault: classify_result_code(&header.result_code, &header.result_msg),
            code: header.result_code,
            message: header.result_msg,
        })
    }
}

impl<T> ApiEnvelope<T> {
    /// Enforce the result code and flatten the body into a [`PageSlice`].
    pub fn into_page(self) -> crate::Result<PageSlice<T>> {
        let header = self.response.header;
        if !header.is_ok() {
            return Err(DatagoError::Provider {
                fault: classify_result_code(&header.result_code, &header.result_msg),
                code: header.result_code,
                message: header.result_msg,
            });
        }

        let body = self
            .response
            .body
            .ok_or_else(|| DatagoError::Envelope("success response without body".into()))?;

        Ok(PageSlice {
            page_no: body.page_no,
            num_of_rows: body.num_of_rows,
            total_count: body.total_count,
            items: body.items.into_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Row {
        contentid: String,
    }

    fn envelope(items: serde_json::Value, total: i64) -> serde_json::Value {
        json!({
            "response": {
                "header": { "resultCode": "00", "resultMsg": "OK" },
                "body": { "items": items, "numOfRows": 100, "pageNo": 1, "totalCount": total }
            }
        })
    }

    #[test]
    fn many_items_decode_in_order() {
        let raw = envelope(
            json!({ "item": [ { "contentid": "1" }, { "contentid": "2" } ] }),
            2,
        );
        let page: PageSlice<Row> = decode_page(&raw).unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].contentid, "1");
        assert_eq!(page.total_count, 2);
    }

    #[test]
    fn single_item_is_normalized_to_a_vec() {
        let raw = envelope(json!({ "item": { "contentid": "42" } }), 1);
        let page: PageSlice<Row> = decode_page(&raw).unwrap();
        assert_eq!(page.items, vec![Row { contentid: "42".into() }]);
    }

    #[test]
    fn empty_string_items_decode_as_no_rows() {
        let raw = envelope(json!(""), 0);
        let page: PageSlice<Row> = decode_page(&raw).unwrap();
        assert!(page.is_empty());
    }

    #[test]
    fn missing_items_decode_as_no_rows() {
        let raw = json!({
            "response": {
                "header": { "resultCode": "00", "resultMsg": "OK" },
                "body": { "numOfRows": 0, "pageNo": 1, "totalCount": 0 }
            }
        });
        let page: PageSlice<Row> = decode_page(&raw).unwrap();
        assert!(page.is_empty());
    }

    #[test]
    fn error_header_surfaces_provider_fault() {
        let raw = json!({
            "response": {
                "header": {
                    "resultCode": "22",
                    "resultMsg": "LIMITED_NUMBER_OF_SERVICE_REQUESTS_EXCEEDS_ERROR"
                }
            }
        });
        let err = decode_page::<Row>(&raw).unwrap_err();
        assert_eq!(err.fault(), crate::ProviderFault::RateLimited);
    }

    #[test]
    fn check_header_rejects_shapeless_documents() {
        let err = check_header(&json!({ "weird": true })).unwrap_err();
        assert!(matches!(err, DatagoError::Envelope(_)));
    }
}
