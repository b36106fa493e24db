//! Wire envelopes for the batch endpoint and the decoded per-target record.

use serde::{Deserialize, Serialize};

/// Inbound body: `{ "urls": [...] }`.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct BatchRequest {
    pub urls: Vec<String>,
}

/// One decoded upstream payload, tagged with the target it came from.
///
/// The upstream document must carry `userId`, `id`, `title` and
/// `completed`; unknown fields are ignored and any `url` it carries is
/// replaced by the originating target.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TodoRecord {
    #[serde(default)]
    pub url: String,
    #[serde(rename = "userId")]
    pub user_id: i64,
    pub id: i64,
    pub title: String,
    pub completed: bool,
}

impl TodoRecord {
    pub fn decode(target: &str, payload: &[u8]) -> Result<Self, serde_json::Error> {
        let mut record: TodoRecord = serde_json::from_slice(payload)?;
        record.url = target.to_string();
        Ok(record)
    }
}

/// Records of a batch whose every target succeeded, in completion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResult {
    records: Vec<TodoRecord>,
}

impl BatchResult {
    pub fn new(records: Vec<TodoRecord>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[TodoRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<TodoRecord> {
        self.records
    }
}

/// Outbound body: `{ "results": [...] }`.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct BatchResponse {
    pub results: Vec<TodoRecord>,
}

impl From<BatchResult> for BatchResponse {
    fn from(result: BatchResult) -> Self {
        Self {
            results: result.into_records(),
        }
    }
}
